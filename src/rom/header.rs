// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal NDS-style ROM header: only the fields the patch engine consumes
//! (entry/ram addresses, autoload hook offsets, overlay-table location).
//! Full header parsing (banner, icon, checksum) is ambient/out of scope.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::NcpError;

pub const HEADER_MIN_SIZE: usize = 0x200;

#[derive(Debug, Clone, Copy)]
pub struct ArmBinaryInfo {
    pub rom_offset: u32,
    pub entry_address: u32,
    pub ram_address: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BinaryInfo {
    pub rom_offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct NdsHeader {
    pub arm9: ArmBinaryInfo,
    pub arm7: ArmBinaryInfo,
    pub arm9_ovt: BinaryInfo,
    pub arm7_ovt: BinaryInfo,
    pub arm9_autoload_hook_off: u32,
    pub arm7_autoload_hook_off: u32,
}

impl NdsHeader {
    pub fn parse(data: &[u8]) -> Result<Self, NcpError> {
        if data.len() < HEADER_MIN_SIZE {
            return Err(NcpError::CorruptRomFile(
                "ROM header smaller than minimum size".into(),
            ));
        }
        let arm_info = |off: usize| ArmBinaryInfo {
            rom_offset: LittleEndian::read_u32(&data[off..]),
            entry_address: LittleEndian::read_u32(&data[off + 4..]),
            ram_address: LittleEndian::read_u32(&data[off + 8..]),
            size: LittleEndian::read_u32(&data[off + 12..]),
        };
        let bin_info = |off: usize| BinaryInfo {
            rom_offset: LittleEndian::read_u32(&data[off..]),
            size: LittleEndian::read_u32(&data[off + 4..]),
        };
        Ok(NdsHeader {
            arm9: arm_info(0x20),
            arm7: arm_info(0x30),
            arm9_ovt: bin_info(0x50),
            arm7_ovt: bin_info(0x58),
            arm9_autoload_hook_off: LittleEndian::read_u32(&data[0x60..]),
            arm7_autoload_hook_off: LittleEndian::read_u32(&data[0x64..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_header() {
        let mut buf = vec![0u8; HEADER_MIN_SIZE];
        LittleEndian::write_u32(&mut buf[0x20..], 0x4000);
        LittleEndian::write_u32(&mut buf[0x24..], 0x0200_0000);
        LittleEndian::write_u32(&mut buf[0x28..], 0x0200_0000);
        LittleEndian::write_u32(&mut buf[0x2C..], 0x1000);
        let header = NdsHeader::parse(&buf).unwrap();
        assert_eq!(header.arm9.ram_address, 0x0200_0000);
        assert_eq!(header.arm9.size, 0x1000);
    }

    #[test]
    fn rejects_too_small_header() {
        assert!(NdsHeader::parse(&[0u8; 16]).is_err());
    }
}
