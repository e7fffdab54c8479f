// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Linked-ELF finaliser: resolves every patch's source address, the
//! autogen-data arena base, overwrite-section payload bytes, and rtrepl
//! payload bytes from the just-linked ELF, then re-checks for overlap now
//! that final addresses are known.

use std::collections::HashMap;

use crate::allocator::OverwriteRegion;
use crate::directives::{DirectiveKind, PatchRecord, RtReplMarker};
use crate::elf::{self, Elf32, Shdr};
use crate::error::NcpError;
use crate::rom::Destination;

#[derive(Debug, Clone)]
pub struct FinalizedPatch {
    pub patch: PatchRecord,
    /// Resolved address of the compiled replacement code/data.
    pub resolved_src: u32,
    /// Raw bytes to write for an `over` directive (section contents) or a
    /// newly linked function body for jump/call/hook sources.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FinalizedRtRepl {
    pub marker: RtReplMarker,
    pub payload: Vec<u8>,
}

/// The linked code/data a destination's newcode region contributes: the
/// bytes to append to the destination's file image, and the size of the
/// trailing BSS the loader must zero after them at runtime.
#[derive(Debug, Clone, Default)]
pub struct NewCodePayload {
    pub text: Vec<u8>,
    pub bss_size: u32,
}

pub struct Finalized {
    pub patches: Vec<FinalizedPatch>,
    pub rtrepl: Vec<FinalizedRtRepl>,
    pub autogen_base: HashMap<Destination, u32>,
    pub autogen_limit: HashMap<Destination, u32>,
    pub newcode: HashMap<Destination, NewCodePayload>,
    /// Overwrite-region payload bytes, keyed by `OverwriteRegion::mem_name`.
    pub region_payloads: HashMap<String, Vec<u8>>,
}

/// Finds a global symbol's address and containing section by name.
fn resolve_symbol(elf: &Elf32, name: &str) -> Option<(u32, i32)> {
    let mut found = None;
    elf.for_each_symbol(|sym, sym_name| {
        if found.is_none() && sym_name == name && sym.st_shndx != 0 {
            found = Some((sym.st_value, sym.st_shndx as i32));
        }
    });
    found
}

fn find_section(elf: &Elf32, name: &str) -> Option<(usize, Shdr)> {
    let mut out = None;
    elf.for_each_section(|idx, sh, sec_name| {
        if out.is_none() && sec_name == name {
            out = Some((idx, *sh));
        }
    });
    out
}

fn section_bytes_by_name(elf: &Elf32, name: &str) -> Option<Vec<u8>> {
    find_section(elf, name).map(|(idx, _)| elf.section_data(&elf.section(idx)).to_vec())
}

fn dest_mem_name(dest: Destination) -> String {
    if dest < 0 {
        "arm".to_string()
    } else {
        format!("ov{dest}")
    }
}

/// Resolves every patch against the just-linked image, producing absolute
/// source addresses and payload bytes ready for the ROM rewriter.
pub fn finalize(
    linked: &[u8],
    patches: &[PatchRecord],
    rtrepl: &[RtReplMarker],
    destinations: &[Destination],
    regions: &[OverwriteRegion],
    autogen_sizes: &[(Destination, u32)],
) -> Result<Finalized, NcpError> {
    let elf = Elf32::parse(linked)?;

    let mut autogen_base = HashMap::new();
    for &dest in destinations {
        let label = if dest < 0 {
            "ncp_autogendata".to_string()
        } else {
            format!("ncp_autogendata_ov{dest}")
        };
        if let Some((addr, _)) = resolve_symbol(&elf, &label) {
            autogen_base.insert(dest, addr);
        }
    }

    let mut autogen_limit = HashMap::new();
    for &(dest, size) in autogen_sizes {
        autogen_limit.insert(dest, size);
    }

    // Per-destination newcode: the linked `.{mem}_text` output section holds
    // both the real compiled code and the trailing autogen-data arena the
    // linker script reserves inside it; `ncp_autogendata[_ov<N>]` marks the
    // boundary, so only the bytes before it are new code to append to the
    // destination's file image. `.{mem}_bss` carries no data (NOLOAD) but its
    // size is the BSS the loader must zero after the appended code.
    let mut newcode = HashMap::new();
    for &dest in destinations {
        let mem = dest_mem_name(dest);
        let Some((_, text_sh)) = find_section(&elf, &format!(".{mem}_text")) else {
            continue;
        };
        let full = elf.section_data(&text_sh);
        let arena_addr = autogen_base.get(&dest).copied().unwrap_or(text_sh.sh_addr + full.len() as u32);
        let code_len = arena_addr.saturating_sub(text_sh.sh_addr) as usize;
        let text = full[..code_len.min(full.len())].to_vec();
        let bss_size = find_section(&elf, &format!(".{mem}_bss")).map(|(_, sh)| sh.sh_size).unwrap_or(0);
        newcode.insert(dest, NewCodePayload { text, bss_size });
    }

    let mut region_payloads = HashMap::new();
    for region in regions {
        let bytes = section_bytes_by_name(&elf, &format!(".{}", region.mem_name)).unwrap_or_default();
        region_payloads.insert(region.mem_name.clone(), bytes);
    }

    let mut finalized_patches = Vec::with_capacity(patches.len());
    for patch in patches {
        let mut patch = patch.clone();
        let (resolved_src, payload) = match patch.kind {
            DirectiveKind::Over => {
                let name = format!(".{}", patch.symbol);
                let bytes = section_bytes_by_name(&elf, &name).ok_or_else(|| {
                    NcpError::UnrelocatableInstruction(format!(
                        "could not locate linked section '{name}' for over directive"
                    ))
                })?;
                (patch.src_address, bytes)
            }
            _ => {
                let (addr, section) = resolve_symbol(&elf, &patch.symbol).ok_or_else(|| {
                    NcpError::UnrelocatableInstruction(format!(
                        "symbol '{}' not present in linked output",
                        patch.symbol
                    ))
                })?;
                patch.section_idx = section;
                (addr, Vec::new())
            }
        };
        finalized_patches.push(FinalizedPatch {
            patch,
            resolved_src,
            payload,
        });
    }

    let mut finalized_rtrepl = Vec::with_capacity(rtrepl.len());
    for marker in rtrepl {
        let start_sym = format!("{}_start", marker.name);
        let end_sym = format!("{}_end", marker.name);
        let (start, _) = resolve_symbol(&elf, &start_sym).ok_or_else(|| {
            NcpError::UnrelocatableInstruction(format!("rtrepl marker '{start_sym}' missing"))
        })?;
        let (end, _) = resolve_symbol(&elf, &end_sym).ok_or_else(|| {
            NcpError::UnrelocatableInstruction(format!("rtrepl marker '{end_sym}' missing"))
        })?;
        let name = format!(".{}", marker.name);
        let bytes = section_bytes_by_name(&elf, &name).unwrap_or_default();
        let len = (end - start) as usize;
        let payload = if bytes.len() >= len { bytes[..len].to_vec() } else { bytes };
        finalized_rtrepl.push(FinalizedRtRepl {
            marker: marker.clone(),
            payload,
        });
    }

    validate_final_overlap(&finalized_patches)?;

    Ok(Finalized {
        patches: finalized_patches,
        rtrepl: finalized_rtrepl,
        autogen_base,
        autogen_limit,
        newcode,
        region_payloads,
    })
}

fn validate_final_overlap(patches: &[FinalizedPatch]) -> Result<(), NcpError> {
    let mut ranges: Vec<(Destination, u32, u32)> = patches
        .iter()
        .map(|p| {
            (
                p.patch.dst_address_ov,
                p.patch.dst_address,
                p.patch.dst_address + p.patch.overwrite_size(),
            )
        })
        .collect();
    ranges.sort_by_key(|&(ov, start, _)| (ov, start));
    for pair in ranges.windows(2) {
        let (ov_a, _, end_a) = pair[0];
        let (ov_b, start_b, _) = pair[1];
        if ov_a == ov_b && start_b < end_a {
            return Err(NcpError::OverlappingPatches(format!(
                "post-link patches overlap at destination {ov_a}, address {start_b:#x}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::Origin;
    use byteorder::{ByteOrder, LittleEndian};

    fn elf_with_symbol(name: &str, value: u32, shndx: u16) -> Vec<u8> {
        // Build a minimal ELF with one SYMTAB entry pointing at `value`.
        const EHDR_SIZE: usize = 52;
        const SHDR_SIZE: usize = 40;
        let mut buf = vec![0u8; EHDR_SIZE];
        buf[0..4].copy_from_slice(b"\x7fELF");
        LittleEndian::write_u16(&mut buf[0x10..], 1);
        LittleEndian::write_u16(&mut buf[0x12..], 40);

        let mut strtab = vec![0u8];
        let name_off = strtab.len() as u32;
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);

        let mut shstrtab = b"\0.symtab\0.strtab\0".to_vec();

        let sym_entry_off = 0usize;
        let mut symtab_data = vec![0u8; 16]; // null symbol
        let mut sym = vec![0u8; 16];
        LittleEndian::write_u32(&mut sym[0..4], name_off);
        LittleEndian::write_u32(&mut sym[4..8], value);
        LittleEndian::write_u16(&mut sym[14..16], shndx);
        symtab_data.extend(sym);
        let _ = sym_entry_off;

        let shoff = buf.len() as u32;
        // 4 sections: null, symtab, strtab, shstrtab
        LittleEndian::write_u32(&mut buf[0x20..], shoff);
        LittleEndian::write_u16(&mut buf[0x30..], 4);
        LittleEndian::write_u16(&mut buf[0x32..], 3);

        let mut data_area: Vec<u8> = Vec::new();
        let symtab_off = shoff + 4 * SHDR_SIZE as u32;
        data_area.extend(&symtab_data);
        let strtab_off = symtab_off + symtab_data.len() as u32;
        data_area.extend(&strtab);
        let shstrtab_off = strtab_off + strtab.len() as u32;
        data_area.extend(&shstrtab);

        // section 0: null
        buf.extend(vec![0u8; SHDR_SIZE]);
        // section 1: symtab
        let mut sh1 = vec![0u8; SHDR_SIZE];
        LittleEndian::write_u32(&mut sh1[0x04..], elf::SHT_SYMTAB);
        LittleEndian::write_u32(&mut sh1[0x10..], symtab_off);
        LittleEndian::write_u32(&mut sh1[0x14..], symtab_data.len() as u32);
        LittleEndian::write_u32(&mut sh1[0x18..], 2); // sh_link -> strtab
        buf.extend(sh1);
        // section 2: strtab
        let mut sh2 = vec![0u8; SHDR_SIZE];
        LittleEndian::write_u32(&mut sh2[0x04..], elf::SHT_STRTAB);
        LittleEndian::write_u32(&mut sh2[0x10..], strtab_off);
        LittleEndian::write_u32(&mut sh2[0x14..], strtab.len() as u32);
        buf.extend(sh2);
        // section 3: shstrtab
        let mut sh3 = vec![0u8; SHDR_SIZE];
        LittleEndian::write_u32(&mut sh3[0x04..], elf::SHT_STRTAB);
        LittleEndian::write_u32(&mut sh3[0x10..], shstrtab_off);
        LittleEndian::write_u32(&mut sh3[0x14..], shstrtab.len() as u32);
        buf.extend(sh3);

        buf.extend(data_area);
        buf
    }

    #[test]
    fn resolves_symbol_address_for_non_over_patch() {
        let linked = elf_with_symbol("my_hook_target", 0x0200_3000, 1);
        let patch = PatchRecord {
            symbol: "my_hook_target".into(),
            unit: 0,
            origin: Origin::Symbol,
            kind: DirectiveKind::Call,
            is_ncp_set: false,
            src_address: 0,
            src_address_ov: -1,
            dst_address: 0x0200_1000,
            dst_address_ov: -1,
            src_thumb: false,
            dst_thumb: false,
            section_idx: -1,
            section_size: 0,
        };
        let finalized = finalize(&linked, &[patch], &[], &[-1], &[], &[]).unwrap();
        assert_eq!(finalized.patches[0].resolved_src, 0x0200_3000);
        assert_eq!(finalized.patches[0].patch.section_idx, 1);
    }

    #[test]
    fn missing_symbol_is_unrelocatable() {
        let linked = elf_with_symbol("other", 0x1000, 1);
        let patch = PatchRecord {
            symbol: "missing".into(),
            unit: 0,
            origin: Origin::Symbol,
            kind: DirectiveKind::Jump,
            is_ncp_set: false,
            src_address: 0,
            src_address_ov: -1,
            dst_address: 0x2000,
            dst_address_ov: -1,
            src_thumb: false,
            dst_thumb: false,
            section_idx: -1,
            section_size: 0,
        };
        assert!(finalize(&linked, &[patch], &[], &[-1], &[], &[]).is_err());
    }
}
