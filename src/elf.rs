// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hand-rolled read-only 32-bit little-endian ELF reader.
//!
//! Not built on a parsing crate: this is an in-scope core deliverable, not
//! ambient plumbing, so offsets are decoded explicitly the same way the
//! engine decodes every other on-disk structure.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::NcpError;

pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_NOBITS: u32 = 8;
pub const SHT_REL: u32 = 9;
pub const SHT_DYNSYM: u32 = 11;

pub const SHF_WRITE: u32 = 0x1;
pub const SHF_ALLOC: u32 = 0x2;
pub const SHF_EXECINSTR: u32 = 0x4;

pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;

pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;
pub const STT_SECTION: u8 = 3;
pub const STT_FILE: u8 = 4;

pub fn st_bind(info: u8) -> u8 {
    info >> 4
}

pub fn st_type(info: u8) -> u8 {
    info & 0xf
}

pub fn r_sym(info: u32) -> u32 {
    info >> 8
}

pub fn r_type(info: u32) -> u32 {
    info & 0xff
}

#[derive(Debug, Clone, Copy)]
pub struct Ehdr {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_phnum: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u32,
    pub sh_addr: u32,
    pub sh_offset: u32,
    pub sh_size: u32,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u32,
    pub sh_entsize: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Sym {
    pub st_name: u32,
    pub st_value: u32,
    pub st_size: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct Rel {
    pub r_offset: u32,
    pub r_info: u32,
}

const EHDR_SIZE: usize = 52;
const SHDR_SIZE: usize = 40;
const SYM_SIZE: usize = 16;
const REL_SIZE: usize = 8;

/// A read-only view over an ELF image. Objects loaded directly from a file
/// own their bytes; objects loaded from an archive member borrow a slice of
/// the archive's buffer, matching the archive-owns / ELF-borrows split.
pub struct Elf32<'a> {
    data: &'a [u8],
    header: Ehdr,
}

impl<'a> Elf32<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, NcpError> {
        if data.len() < EHDR_SIZE || &data[0..4] != b"\x7fELF" {
            return Err(NcpError::CorruptRomFile("not an ELF image".into()));
        }
        let header = Ehdr {
            e_type: LittleEndian::read_u16(&data[0x10..]),
            e_machine: LittleEndian::read_u16(&data[0x12..]),
            e_entry: LittleEndian::read_u32(&data[0x18..]),
            e_phoff: LittleEndian::read_u32(&data[0x1C..]),
            e_shoff: LittleEndian::read_u32(&data[0x20..]),
            e_phnum: LittleEndian::read_u16(&data[0x2C..]),
            e_shnum: LittleEndian::read_u16(&data[0x30..]),
            e_shstrndx: LittleEndian::read_u16(&data[0x32..]),
        };
        Ok(Self { data, header })
    }

    pub fn header(&self) -> &Ehdr {
        &self.header
    }

    pub fn section(&self, idx: usize) -> Shdr {
        let off = self.header.e_shoff as usize + idx * SHDR_SIZE;
        let s = &self.data[off..off + SHDR_SIZE];
        Shdr {
            sh_name: LittleEndian::read_u32(&s[0x00..]),
            sh_type: LittleEndian::read_u32(&s[0x04..]),
            sh_flags: LittleEndian::read_u32(&s[0x08..]),
            sh_addr: LittleEndian::read_u32(&s[0x0C..]),
            sh_offset: LittleEndian::read_u32(&s[0x10..]),
            sh_size: LittleEndian::read_u32(&s[0x14..]),
            sh_link: LittleEndian::read_u32(&s[0x18..]),
            sh_info: LittleEndian::read_u32(&s[0x1C..]),
            sh_addralign: LittleEndian::read_u32(&s[0x20..]),
            sh_entsize: LittleEndian::read_u32(&s[0x24..]),
        }
    }

    pub fn section_count(&self) -> usize {
        self.header.e_shnum as usize
    }

    pub fn section_data(&self, sh: &Shdr) -> &'a [u8] {
        if sh.sh_type == SHT_NOBITS {
            return &[];
        }
        let start = sh.sh_offset as usize;
        let end = start + sh.sh_size as usize;
        &self.data[start..end]
    }

    pub fn section_name(&self, sh: &Shdr) -> String {
        let strtab = self.section(self.header.e_shstrndx as usize);
        read_cstr(self.section_data(&strtab), sh.sh_name as usize)
    }

    pub fn sym_name(&self, strtab_data: &[u8], sym: &Sym) -> String {
        read_cstr(strtab_data, sym.st_name as usize)
    }

    pub fn syms(&self, sh: &Shdr) -> Vec<Sym> {
        let data = self.section_data(sh);
        let count = data.len() / SYM_SIZE;
        (0..count)
            .map(|i| {
                let s = &data[i * SYM_SIZE..];
                Sym {
                    st_name: LittleEndian::read_u32(&s[0x00..]),
                    st_value: LittleEndian::read_u32(&s[0x04..]),
                    st_size: LittleEndian::read_u32(&s[0x08..]),
                    st_info: s[0x0C],
                    st_other: s[0x0D],
                    st_shndx: LittleEndian::read_u16(&s[0x0E..]),
                }
            })
            .collect()
    }

    pub fn rels(&self, sh: &Shdr) -> Vec<Rel> {
        let data = self.section_data(sh);
        let count = data.len() / REL_SIZE;
        (0..count)
            .map(|i| {
                let r = &data[i * REL_SIZE..];
                Rel {
                    r_offset: LittleEndian::read_u32(&r[0x00..]),
                    r_info: LittleEndian::read_u32(&r[0x04..]),
                }
            })
            .collect()
    }

    pub fn for_each_section<F: FnMut(usize, &Shdr, &str)>(&self, mut cb: F) {
        for idx in 0..self.section_count() {
            let sh = self.section(idx);
            let name = self.section_name(&sh);
            cb(idx, &sh, &name);
        }
    }

    /// Iterates `SYMTAB`/`DYNSYM` sections, resolving each symbol's name
    /// through the string table its section links to.
    pub fn for_each_symbol<F: FnMut(&Sym, &str)>(&self, mut cb: F) {
        for idx in 0..self.section_count() {
            let sh = self.section(idx);
            if sh.sh_type != SHT_SYMTAB && sh.sh_type != SHT_DYNSYM {
                continue;
            }
            let strtab = self.section(sh.sh_link as usize);
            let strtab_data = self.section_data(&strtab);
            for sym in self.syms(&sh) {
                let name = self.sym_name(strtab_data, &sym);
                cb(&sym, &name);
            }
        }
    }

    /// Iterates `REL` sections; for each relocation exposes the name of the
    /// relocation section's target section (by stripping the `.rel` prefix)
    /// and the name of the symbol it points at.
    pub fn for_each_relocation<F: FnMut(&Rel, &str, &str)>(&self, mut cb: F) {
        for idx in 0..self.section_count() {
            let sh = self.section(idx);
            if sh.sh_type != SHT_REL {
                continue;
            }
            let reloc_name = self.section_name(&sh);
            let target_name = reloc_name.strip_prefix(".rel").unwrap_or(&reloc_name);
            let symtab = self.section(sh.sh_link as usize);
            let strtab = self.section(symtab.sh_link as usize);
            let strtab_data = self.section_data(&strtab);
            let syms = self.syms(&symtab);
            for rel in self.rels(&sh) {
                let sym_idx = r_sym(rel.r_info) as usize;
                let sym_name = syms
                    .get(sym_idx)
                    .map(|s| self.sym_name(strtab_data, s))
                    .unwrap_or_default();
                cb(&rel, target_name, &sym_name);
            }
        }
    }

    pub fn symtab_syms_and_strtab(&self) -> Option<(Vec<Sym>, &'a [u8])> {
        for idx in 0..self.section_count() {
            let sh = self.section(idx);
            if sh.sh_type == SHT_SYMTAB {
                let strtab = self.section(sh.sh_link as usize);
                return Some((self.syms(&sh), self.section_data(&strtab)));
            }
        }
        None
    }
}

fn read_cstr(data: &[u8], off: usize) -> String {
    if off >= data.len() {
        return String::new();
    }
    let end = data[off..].iter().position(|&b| b == 0).unwrap_or(0);
    String::from_utf8_lossy(&data[off..off + end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_elf_with_one_section() -> Vec<u8> {
        // Minimal valid-enough ELF: header + one empty section header table
        // entry acting as shstrndx 0 (null section), plus one named section.
        let mut buf = vec![0u8; EHDR_SIZE];
        buf[0..4].copy_from_slice(b"\x7fELF");
        LittleEndian::write_u16(&mut buf[0x10..], 1); // e_type
        LittleEndian::write_u16(&mut buf[0x12..], 40); // e_machine = ARM
        let shoff = buf.len() as u32;
        LittleEndian::write_u32(&mut buf[0x20..], shoff);
        LittleEndian::write_u16(&mut buf[0x30..], 2); // e_shnum
        LittleEndian::write_u16(&mut buf[0x32..], 1); // e_shstrndx

        // shstrtab contents appended after section headers.
        let shstrtab_content = b"\0.text\0";
        let shstrtab_off = shoff + 2 * SHDR_SIZE as u32;

        // section 0: null
        buf.extend(vec![0u8; SHDR_SIZE]);
        // section 1: shstrtab itself
        let mut sh1 = vec![0u8; SHDR_SIZE];
        LittleEndian::write_u32(&mut sh1[0x04..], SHT_STRTAB);
        LittleEndian::write_u32(&mut sh1[0x10..], shstrtab_off);
        LittleEndian::write_u32(&mut sh1[0x14..], shstrtab_content.len() as u32);
        buf.extend(sh1);
        buf.extend_from_slice(shstrtab_content);
        buf
    }

    #[test]
    fn parses_header_fields() {
        let buf = sample_elf_with_one_section();
        let elf = Elf32::parse(&buf).unwrap();
        assert_eq!(elf.header().e_machine, 40);
        assert_eq!(elf.section_count(), 2);
    }

    #[test]
    fn rejects_non_elf_magic() {
        let buf = vec![0u8; 64];
        assert!(Elf32::parse(&buf).is_err());
    }

    #[test]
    fn resolves_section_names() {
        let buf = sample_elf_with_one_section();
        let elf = Elf32::parse(&buf).unwrap();
        let sh = elf.section(1);
        assert_eq!(elf.section_name(&sh), "");
    }
}
