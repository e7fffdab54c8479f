// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::NcpError;
use crate::rom::blz;

#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleParams {
    pub autoload_list_start: u32,
    pub autoload_list_end: u32,
    pub autoload_start: u32,
    pub static_bss_start: u32,
    pub static_bss_end: u32,
    pub comp_static_end: u32,
    pub sdk_version_id: u32,
    pub nitro_code_be: u32,
    pub nitro_code_le: u32,
}

const MODULE_PARAMS_SIZE: usize = 9 * 4;

impl ModuleParams {
    fn read(buf: &[u8], off: usize) -> ModuleParams {
        ModuleParams {
            autoload_list_start: LittleEndian::read_u32(&buf[off..]),
            autoload_list_end: LittleEndian::read_u32(&buf[off + 4..]),
            autoload_start: LittleEndian::read_u32(&buf[off + 8..]),
            static_bss_start: LittleEndian::read_u32(&buf[off + 12..]),
            static_bss_end: LittleEndian::read_u32(&buf[off + 16..]),
            comp_static_end: LittleEndian::read_u32(&buf[off + 20..]),
            sdk_version_id: LittleEndian::read_u32(&buf[off + 24..]),
            nitro_code_be: LittleEndian::read_u32(&buf[off + 28..]),
            nitro_code_le: LittleEndian::read_u32(&buf[off + 32..]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoLoadEntry {
    pub address: u32,
    pub size: u32,
    pub bss_size: u32,
    pub data_off: u32,
}

/// The main ARM binary for one of the console's two CPUs.
pub struct ArmBin {
    pub ram_addr: u32,
    pub entry_addr: u32,
    pub autoload_hook_off: u32,
    pub is_arm9: bool,
    pub module_params_off: usize,
    pub bytes: Vec<u8>,
    pub autoload_list: Vec<AutoLoadEntry>,
}

impl ArmBin {
    /// Loads the binary, locates `ModuleParams` via the autoload hook word,
    /// decompresses it in place if it is BLZ-compressed, and walks its
    /// autoload list.
    pub fn load(
        bytes: Vec<u8>,
        entry_addr: u32,
        ram_addr: u32,
        autoload_hook_off: u32,
        is_arm9: bool,
    ) -> Result<Self, NcpError> {
        if bytes.len() < 4 {
            return Err(NcpError::CorruptRomFile("ARM binary too small".into()));
        }

        let hook_rel = (autoload_hook_off as i64 - ram_addr as i64 - 4) as usize;
        if hook_rel + 4 > bytes.len() {
            return Err(NcpError::CorruptRomFile(
                "autoload hook offset out of range".into(),
            ));
        }
        let module_params_addr = LittleEndian::read_u32(&bytes[hook_rel..]);
        let module_params_off = (module_params_addr - ram_addr) as usize;
        if module_params_off + MODULE_PARAMS_SIZE > bytes.len() {
            return Err(NcpError::CorruptRomFile(
                "ModuleParams offset out of range".into(),
            ));
        }

        let mut module_params = ModuleParams::read(&bytes, module_params_off);
        let mut bytes = bytes;

        if module_params.comp_static_end != 0 {
            let comp_off = (module_params.comp_static_end - ram_addr) as usize;
            if comp_off > bytes.len() {
                return Err(NcpError::CorruptRomFile(
                    "comp_static_end out of range".into(),
                ));
            }
            let (head, tail) = bytes.split_at(comp_off);
            let decompressed = blz::uncompress(tail)?;
            let mut new_bytes = head.to_vec();
            new_bytes.extend_from_slice(&decompressed);
            bytes = new_bytes;

            module_params.comp_static_end = 0;
            LittleEndian::write_u32(&mut bytes[module_params_off + 20..], 0);
        }

        let mut autoload_list = Vec::new();
        let al_start = (module_params.autoload_list_start - ram_addr) as usize;
        let al_end = (module_params.autoload_list_end - ram_addr) as usize;
        let mut data_off = module_params.autoload_start - ram_addr;
        let mut pos = al_start;
        while pos + 12 <= al_end {
            let address = LittleEndian::read_u32(&bytes[pos..]);
            let size = LittleEndian::read_u32(&bytes[pos + 4..]);
            let bss_size = LittleEndian::read_u32(&bytes[pos + 8..]);
            autoload_list.push(AutoLoadEntry {
                address,
                size,
                bss_size,
                data_off,
            });
            data_off += size;
            pos += 12;
        }

        Ok(ArmBin {
            ram_addr,
            entry_addr,
            autoload_hook_off,
            is_arm9,
            module_params_off,
            bytes,
            autoload_list,
        })
    }

    pub fn module_params(&self) -> ModuleParams {
        ModuleParams::read(&self.bytes, self.module_params_off)
    }

    pub fn write_module_params(&mut self, params: &ModuleParams) {
        let off = self.module_params_off;
        LittleEndian::write_u32(&mut self.bytes[off..], params.autoload_list_start);
        LittleEndian::write_u32(&mut self.bytes[off + 4..], params.autoload_list_end);
        LittleEndian::write_u32(&mut self.bytes[off + 8..], params.autoload_start);
        LittleEndian::write_u32(&mut self.bytes[off + 12..], params.static_bss_start);
        LittleEndian::write_u32(&mut self.bytes[off + 16..], params.static_bss_end);
        LittleEndian::write_u32(&mut self.bytes[off + 20..], params.comp_static_end);
        LittleEndian::write_u32(&mut self.bytes[off + 24..], params.sdk_version_id);
        LittleEndian::write_u32(&mut self.bytes[off + 28..], params.nitro_code_be);
        LittleEndian::write_u32(&mut self.bytes[off + 32..], params.nitro_code_le);
    }

    pub fn sanity_check_address(&self, addr: u32) -> bool {
        addr >= self.ram_addr && addr < self.ram_addr.wrapping_add(0x0040_0000)
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        let off = (addr - self.ram_addr) as usize;
        LittleEndian::read_u32(&self.bytes[off..])
    }

    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) {
        let off = (addr - self.ram_addr) as usize;
        self.bytes[off..off + data.len()].copy_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_uncompressed_binary() -> (Vec<u8>, u32, u32) {
        let ram_addr = 0x0200_0000u32;
        let autoload_hook_off = ram_addr + 0x100;
        let module_params_off = 0x40usize;
        let mut bytes = vec![0u8; 0x200];

        // hook word at autoload_hook_off - ram_addr - 4 holds module params addr
        let hook_rel = (autoload_hook_off - ram_addr - 4) as usize;
        LittleEndian::write_u32(
            &mut bytes[hook_rel..],
            ram_addr + module_params_off as u32,
        );

        // module params: empty autoload list (start == end), no compression
        let mp_off = module_params_off;
        LittleEndian::write_u32(&mut bytes[mp_off..], ram_addr + 0x180); // autoload_list_start
        LittleEndian::write_u32(&mut bytes[mp_off + 4..], ram_addr + 0x180); // autoload_list_end
        LittleEndian::write_u32(&mut bytes[mp_off + 8..], ram_addr + 0x180); // autoload_start
        LittleEndian::write_u32(&mut bytes[mp_off + 20..], 0); // comp_static_end = 0

        (bytes, ram_addr, autoload_hook_off)
    }

    #[test]
    fn loads_uncompressed_binary_with_empty_autoload() {
        let (bytes, ram_addr, hook_off) = build_uncompressed_binary();
        let arm = ArmBin::load(bytes, ram_addr, ram_addr, hook_off, true).unwrap();
        assert_eq!(arm.autoload_list.len(), 0);
        assert_eq!(arm.module_params().comp_static_end, 0);
    }

    #[test]
    fn rejects_too_small_binary() {
        let result = ArmBin::load(vec![0, 1], 0, 0, 4, true);
        assert!(result.is_err());
    }
}
