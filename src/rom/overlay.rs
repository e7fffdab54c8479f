// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::NcpError;
use crate::rom::blz;

pub const OVT_ENTRY_SIZE: usize = 32;
pub const OVERLAY_FLAG_COMP: u8 = 1;
pub const OVERLAY_FLAG_AUTH: u8 = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct OvtEntry {
    pub overlay_id: u32,
    pub ram_address: u32,
    pub ram_size: u32,
    pub bss_size: u32,
    pub sinit_start: u32,
    pub sinit_end: u32,
    pub file_id: u32,
    pub compressed: u32, // 24-bit field
    pub flag: u8,        // 8-bit field
}

impl OvtEntry {
    pub fn read(buf: &[u8]) -> OvtEntry {
        let packed = LittleEndian::read_u32(&buf[28..32]);
        OvtEntry {
            overlay_id: LittleEndian::read_u32(&buf[0..4]),
            ram_address: LittleEndian::read_u32(&buf[4..8]),
            ram_size: LittleEndian::read_u32(&buf[8..12]),
            bss_size: LittleEndian::read_u32(&buf[12..16]),
            sinit_start: LittleEndian::read_u32(&buf[16..20]),
            sinit_end: LittleEndian::read_u32(&buf[20..24]),
            file_id: LittleEndian::read_u32(&buf[24..28]),
            compressed: packed & 0x00FF_FFFF,
            flag: (packed >> 24) as u8,
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.overlay_id);
        LittleEndian::write_u32(&mut buf[4..8], self.ram_address);
        LittleEndian::write_u32(&mut buf[8..12], self.ram_size);
        LittleEndian::write_u32(&mut buf[12..16], self.bss_size);
        LittleEndian::write_u32(&mut buf[16..20], self.sinit_start);
        LittleEndian::write_u32(&mut buf[20..24], self.sinit_end);
        LittleEndian::write_u32(&mut buf[24..28], self.file_id);
        let packed = (self.compressed & 0x00FF_FFFF) | ((self.flag as u32) << 24);
        LittleEndian::write_u32(&mut buf[28..32], packed);
    }
}

pub fn load_overlay_table(data: &[u8]) -> Result<Vec<OvtEntry>, NcpError> {
    if data.len() % OVT_ENTRY_SIZE != 0 {
        return Err(NcpError::CorruptRomFile(
            "overlay table size is not a multiple of entry size".into(),
        ));
    }
    Ok(data
        .chunks(OVT_ENTRY_SIZE)
        .map(OvtEntry::read)
        .collect())
}

pub fn save_overlay_table(entries: &[OvtEntry]) -> Vec<u8> {
    let mut buf = vec![0u8; entries.len() * OVT_ENTRY_SIZE];
    for (i, e) in entries.iter().enumerate() {
        e.write(&mut buf[i * OVT_ENTRY_SIZE..(i + 1) * OVT_ENTRY_SIZE]);
    }
    buf
}

/// A loadable overlay blob.
pub struct OverlayBin {
    pub bytes: Vec<u8>,
    pub ram_address: u32,
    pub id: u32,
    pub dirty: bool,
}

impl OverlayBin {
    pub fn load(bytes: Vec<u8>, ram_address: u32, compressed: bool, id: u32) -> Result<Self, NcpError> {
        let bytes = if compressed {
            blz::uncompress(&bytes)?
        } else {
            bytes
        };
        Ok(OverlayBin {
            bytes,
            ram_address,
            id,
            dirty: false,
        })
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        let off = (addr - self.ram_address) as usize;
        LittleEndian::read_u32(&self.bytes[off..])
    }

    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) {
        let off = (addr - self.ram_address) as usize;
        self.bytes[off..off + data.len()].copy_from_slice(data);
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ovt_entry() {
        let entry = OvtEntry {
            overlay_id: 3,
            ram_address: 0x0233_0000,
            ram_size: 0x1600,
            bss_size: 0x100,
            sinit_start: 0,
            sinit_end: 0,
            file_id: 3,
            compressed: 0,
            flag: 0,
        };
        let mut buf = [0u8; OVT_ENTRY_SIZE];
        entry.write(&mut buf);
        let back = OvtEntry::read(&buf);
        assert_eq!(back.overlay_id, 3);
        assert_eq!(back.ram_size, 0x1600);
        assert_eq!(back.flag, 0);
    }

    #[test]
    fn rejects_misaligned_table() {
        assert!(load_overlay_table(&[0u8; 10]).is_err());
    }
}
