// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ROM rewriter: applies every finalized patch to the in-memory ARM/overlay
//! binaries, dispatching on `DirectiveKind` x THUMB/ARM combination.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::directives::DirectiveKind;
use crate::error::NcpError;
use crate::finalize::{Finalized, FinalizedPatch};
use crate::rom::arm::AutoLoadEntry;
use crate::rom::overlay::{OverlayBin, OVERLAY_FLAG_COMP};
use crate::rom::{Destination, RomImage};
use crate::trampoline;

/// Per-destination bump allocator over the autogen-data arena the linker
/// script reserves at the end of each destination's `.{mem}_text` section.
/// Bridges (interworking thunks, hook trampolines) are carved out of it as
/// patches are applied.
type ArenaUsage = HashMap<Destination, u32>;

fn alloc_arena(
    finalized: &Finalized,
    arena_used: &mut ArenaUsage,
    dest: Destination,
    size: u32,
) -> Result<u32, NcpError> {
    let base = *finalized.autogen_base.get(&dest).ok_or_else(|| {
        NcpError::UnrelocatableInstruction(format!(
            "no autogen-data arena resolved for destination {dest}"
        ))
    })?;
    let limit = finalized.autogen_limit.get(&dest).copied().unwrap_or(0);
    let used = arena_used.entry(dest).or_insert(0);
    if *used + size > limit {
        return Err(NcpError::UnrelocatableInstruction(format!(
            "autogen-data arena for destination {dest} exhausted: needed {size} more bytes, {} of {limit} already used",
            *used
        )));
    }
    let addr = base + *used;
    *used += size;
    Ok(addr)
}

/// A destination-agnostic view over either the main ARM binary or a single
/// overlay, so the application table below doesn't need to branch on
/// main-vs-overlay at every call site.
enum CodeBin<'a> {
    Main(&'a mut RomImage),
    Overlay(&'a mut OverlayBin),
}

impl<'a> CodeBin<'a> {
    fn read_u32(&self, addr: u32) -> u32 {
        match self {
            CodeBin::Main(rom) => rom.arm.read_u32(addr),
            CodeBin::Overlay(ov) => ov.read_u32(addr),
        }
    }

    fn write_bytes(&mut self, addr: u32, data: &[u8]) {
        match self {
            CodeBin::Main(rom) => rom.arm.write_bytes(addr, data),
            CodeBin::Overlay(ov) => ov.write_bytes(addr, data),
        }
    }

    fn write_u32(&mut self, addr: u32, value: u32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write_bytes(addr, &buf);
    }

    fn write_u16(&mut self, addr: u32, value: u16) {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.write_bytes(addr, &buf);
    }
}

fn bin_for<'a>(rom: &'a mut RomImage, dest: Destination) -> Result<CodeBin<'a>, NcpError> {
    if dest < 0 {
        Ok(CodeBin::Main(rom))
    } else {
        rom.overlay_mut(dest as u32)
            .map(CodeBin::Overlay)
            .ok_or_else(|| NcpError::InvalidDestinationMode(format!("no loaded overlay {dest}")))
    }
}

/// Applies a single `jump`/`call` directive: an ARM or THUMB branch, with an
/// interworking bridge substituted when source and destination states
/// differ and the directive can't reach the destination with a single
/// direct branch instruction.
fn apply_branch(
    bin: &mut CodeBin,
    p: &FinalizedPatch,
    link: bool,
    finalized: &Finalized,
    arena_used: &mut ArenaUsage,
) -> Result<(), NcpError> {
    let src = p.patch.dst_address;
    let dst = p.resolved_src;

    if p.patch.src_thumb == p.patch.dst_thumb {
        if p.patch.src_thumb {
            let [hi, lo] = trampoline::encode_thumb_bl(src, dst, link)?;
            bin.write_u16(src, hi);
            bin.write_u16(src + 2, lo);
        } else {
            let insn = trampoline::encode_arm_branch(src, dst, link)?;
            bin.write_u32(src, insn);
        }
        return Ok(());
    }

    if !p.patch.src_thumb && p.patch.dst_thumb {
        if link {
            let insn = trampoline::encode_arm_blx(src, dst)?;
            bin.write_u32(src, insn);
        } else {
            // `jump` must not clobber `lr`, so a direct BLX is off the
            // table; route through an 8-byte bridge that sets the THUMB bit
            // and branches without linking.
            let bridge_addr = alloc_arena(finalized, arena_used, p.patch.dst_address_ov, 8)?;
            let bridge = trampoline::arm_to_thumb_bridge(dst);
            bin.write_bytes(bridge_addr, &bridge);
            let insn = trampoline::encode_arm_branch(src, bridge_addr, false)?;
            bin.write_u32(src, insn);
        }
        return Ok(());
    }

    // THUMB source, ARM destination.
    if link {
        let [hi, lo] = trampoline::encode_thumb_bl(src, dst, true)?;
        bin.write_u16(src, hi);
        bin.write_u16(src + 2, lo);
        return Ok(());
    }

    Err(NcpError::MissingInterworking(format!(
        "THUMB source at {src:#x} cannot jump to ARM destination {dst:#x} without linking"
    )))
}

/// Applies a `hook` directive: builds a 20-byte ARM bridge that preserves
/// caller-saved registers, calls into the hook body, restores them, replays
/// the instruction the hook site overwrote, then resumes at the site.
fn apply_hook(
    bin: &mut CodeBin,
    p: &FinalizedPatch,
    finalized: &Finalized,
    arena_used: &mut ArenaUsage,
) -> Result<(), NcpError> {
    let site = p.patch.dst_address;
    if p.patch.src_thumb {
        return Err(NcpError::UnsupportedHook(format!(
            "THUMB hook site at {site:#x} is not supported"
        )));
    }

    let bridge_addr = alloc_arena(finalized, arena_used, p.patch.dst_address_ov, 20)?;
    let resume_addr = site + 4;
    let original_insn = bin.read_u32(site);
    let original_insn = match trampoline::arm_pc_relative_kind(original_insn) {
        Some(_) => trampoline::fixup_arm_pc_relative(original_insn, site, bridge_addr + 12)?,
        None => original_insn,
    };

    let bridge = trampoline::build_hook_bridge(
        bridge_addr,
        p.resolved_src,
        p.patch.dst_thumb,
        original_insn,
        resume_addr,
    )?;
    bin.write_bytes(bridge_addr, &bridge);

    let insn = trampoline::encode_arm_branch(site, bridge_addr, false)?;
    bin.write_u32(site, insn);
    Ok(())
}

fn apply_over(bin: &mut CodeBin, p: &FinalizedPatch) -> Result<(), NcpError> {
    bin.write_bytes(p.patch.dst_address, &p.payload);
    Ok(())
}

/// Applies every finalized non-rtrepl patch in the destination's code
/// binary. Call once per destination after `finalize::finalize`.
pub fn apply_patches(rom: &mut RomImage, finalized: &Finalized) -> Result<(), NcpError> {
    let mut arena_used: ArenaUsage = HashMap::new();
    for p in &finalized.patches {
        let mut bin = bin_for(rom, p.patch.dst_address_ov)?;
        debug!(
            target: "patch::rewrite",
            "applying {:?} at {:#x} (dest {})",
            p.patch.kind, p.patch.dst_address, p.patch.dst_address_ov
        );
        match p.patch.kind {
            DirectiveKind::Jump => apply_branch(&mut bin, p, false, finalized, &mut arena_used)?,
            DirectiveKind::Call => apply_branch(&mut bin, p, true, finalized, &mut arena_used)?,
            DirectiveKind::Hook => apply_hook(&mut bin, p, finalized, &mut arena_used)?,
            DirectiveKind::Over => apply_over(&mut bin, p)?,
            DirectiveKind::RtRepl => unreachable!("rtrepl markers are not PatchRecords"),
        }
    }
    Ok(())
}

/// Writes the per-region overwrite payload (new code/data placed by the
/// allocator) into its destination, using the region's already-resolved
/// `start` address as the write cursor.
pub fn apply_overwrite_region(
    rom: &mut RomImage,
    dest: Destination,
    start: u32,
    payload: &[u8],
) -> Result<(), NcpError> {
    let mut bin = bin_for(rom, dest)?;
    bin.write_bytes(start, payload);
    Ok(())
}

/// Rounds a BSS size up to 4-byte alignment, matching the gap the loader
/// leaves between consecutive autoload data blocks.
fn align_bss_gap(size: u32) -> u32 {
    (size + 3) & !3
}

/// Appends freshly linked code for the main ARM binary as a new autoload
/// block, prepended ahead of the existing autoload data so its own load
/// address is the binary's current `autoload_start` (a destination a linker
/// script wrote the new code's symbols against). The existing autoload
/// entries keep their own `address` field (each autoload block can target
/// its own RAM region, e.g. ITCM) but their recorded file position shifts by
/// the inserted block's size. `arena_lo` is the address of the heap-top
/// pointer the runtime reads at startup; it is updated to sit just past the
/// newly inserted block's code and BSS.
pub fn apply_newcode_main(
    rom: &mut RomImage,
    arena_lo: u32,
    payload: &[u8],
    bss_size: u32,
) -> Result<u32, NcpError> {
    let ram_addr = rom.arm.ram_addr;
    let params = rom.arm.module_params();
    let new_code_addr = params.autoload_start;
    let data_start_off = (new_code_addr - ram_addr) as usize;
    let list_start_off = (params.autoload_list_start - ram_addr) as usize;
    let list_end_off = (params.autoload_list_end - ram_addr) as usize;

    if data_start_off > list_start_off || list_start_off > list_end_off || list_end_off > rom.arm.bytes.len() {
        return Err(NcpError::CorruptRomFile(
            "autoload region bounds inconsistent with ModuleParams".into(),
        ));
    }

    let bss_gap = align_bss_gap(bss_size);

    let mut new_bytes = Vec::with_capacity(rom.arm.bytes.len() + payload.len() + 12);
    new_bytes.extend_from_slice(&rom.arm.bytes[..data_start_off]);
    new_bytes.extend_from_slice(payload);
    new_bytes.extend_from_slice(&rom.arm.bytes[data_start_off..list_start_off]);
    let new_record_off = new_bytes.len();
    new_bytes.extend_from_slice(&[0u8; 12]);
    new_bytes.extend_from_slice(&rom.arm.bytes[list_start_off..]);
    LittleEndian::write_u32(&mut new_bytes[new_record_off..], new_code_addr);
    LittleEndian::write_u32(&mut new_bytes[new_record_off + 4..], payload.len() as u32);
    LittleEndian::write_u32(&mut new_bytes[new_record_off + 8..], bss_gap);
    rom.arm.bytes = new_bytes;

    for entry in &mut rom.arm.autoload_list {
        entry.data_off += payload.len() as u32;
    }
    rom.arm.autoload_list.insert(
        0,
        AutoLoadEntry {
            address: new_code_addr,
            size: payload.len() as u32,
            bss_size: bss_gap,
            data_off: data_start_off as u32,
        },
    );

    let mut params = rom.arm.module_params();
    params.autoload_list_start += payload.len() as u32;
    params.autoload_list_end += payload.len() as u32 + 12;
    params.autoload_start = new_code_addr + payload.len() as u32 + 12;
    rom.arm.write_module_params(&params);

    let heap_top = new_code_addr + payload.len() as u32 + bss_gap;
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, heap_top);
    rom.arm.write_bytes(arena_lo, &buf);

    Ok(new_code_addr)
}

pub enum OverlayWriteMode {
    Append,
    Replace,
}

/// Writes new code into an overlay per the region's declared mode, raising
/// `OverlayTooLarge` when `Replace` mode's declared `maxsize` is exceeded.
pub fn apply_newcode_overlay(
    rom: &mut RomImage,
    overlay_id: u32,
    mode: OverlayWriteMode,
    maxsize: Option<u32>,
    payload: &[u8],
) -> Result<(), NcpError> {
    let base = {
        let ov = rom
            .overlay_mut(overlay_id)
            .ok_or_else(|| NcpError::InvalidDestinationMode(format!("no loaded overlay {overlay_id}")))?;
        let base = ov.ram_address + ov.bytes.len() as u32;
        match mode {
            OverlayWriteMode::Append => {
                ov.bytes.extend_from_slice(payload);
                ov.dirty = true;
            }
            OverlayWriteMode::Replace => {
                if let Some(max) = maxsize {
                    if payload.len() as u32 > max {
                        return Err(NcpError::OverlayTooLarge(format!(
                            "overlay {overlay_id} payload {} exceeds declared maxsize {max}",
                            payload.len()
                        )));
                    }
                }
                ov.bytes.clear();
                ov.bytes.extend_from_slice(payload);
                ov.dirty = true;
            }
        }
        base
    };

    let new_ram_size = rom
        .overlays
        .iter()
        .find(|o| o.id == overlay_id)
        .map(|o| o.bytes.len() as u32);
    if let Some(entry) = rom.ovt_entry_mut(overlay_id) {
        if let Some(size) = new_ram_size {
            entry.ram_size = size;
        }
        entry.compressed = 0;
        entry.flag &= !OVERLAY_FLAG_COMP;
    }
    let _ = base;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::{Origin, PatchRecord};
    use crate::rom::arm::ArmBin;

    fn rom_with_main(ram_addr: u32, size: usize) -> RomImage {
        let hook_off = ram_addr + 0x100;
        let mp_off = 0x40usize;
        let mut bytes = vec![0u8; size];
        let hook_rel = (hook_off - ram_addr - 4) as usize;
        LittleEndian::write_u32(&mut bytes[hook_rel..], ram_addr + mp_off as u32);
        LittleEndian::write_u32(&mut bytes[mp_off..], ram_addr + 0x180);
        LittleEndian::write_u32(&mut bytes[mp_off + 4..], ram_addr + 0x180);
        LittleEndian::write_u32(&mut bytes[mp_off + 8..], ram_addr + 0x180);
        LittleEndian::write_u32(&mut bytes[mp_off + 20..], 0);
        let arm = ArmBin::load(bytes, ram_addr, ram_addr, hook_off, true).unwrap();
        RomImage {
            arm,
            ovt: Vec::new(),
            overlays: Vec::new(),
        }
    }

    fn patch(dst_address: u32, kind: DirectiveKind, src_thumb: bool, dst_thumb: bool) -> FinalizedPatch {
        FinalizedPatch {
            patch: PatchRecord {
                symbol: "target".into(),
                unit: 0,
                origin: Origin::Symbol,
                kind,
                is_ncp_set: false,
                src_address: 0,
                src_address_ov: -1,
                dst_address,
                dst_address_ov: -1,
                src_thumb,
                dst_thumb,
                section_idx: -1,
                section_size: 0,
            },
            resolved_src: dst_address + 0x1000,
            payload: Vec::new(),
        }
    }

    #[test]
    fn applies_arm_jump_branch() {
        let mut rom = rom_with_main(0x0200_0000, 0x200);
        let p = patch(0x0200_0010, DirectiveKind::Jump, false, false);
        let finalized = Finalized {
            patches: vec![p],
            rtrepl: vec![],
            autogen_base: Default::default(),
            autogen_limit: Default::default(),
            newcode: Default::default(),
            region_payloads: Default::default(),
        };
        apply_patches(&mut rom, &finalized).unwrap();
        let insn = rom.arm.read_u32(0x0200_0010);
        assert!(trampoline::is_arm_branch(insn));
    }

    #[test]
    fn mismatched_thumb_without_blx_support_errors() {
        let mut rom = rom_with_main(0x0200_0000, 0x200);
        let p = patch(0x0200_0010, DirectiveKind::Jump, true, false);
        let finalized = Finalized {
            patches: vec![p],
            rtrepl: vec![],
            autogen_base: Default::default(),
            autogen_limit: Default::default(),
            newcode: Default::default(),
            region_payloads: Default::default(),
        };
        assert!(apply_patches(&mut rom, &finalized).is_err());
    }

    #[test]
    fn newcode_main_prepends_autoload_entry() {
        let mut rom = rom_with_main(0x0200_0000, 0x200);
        let ram_addr = rom.arm.ram_addr;
        let before = rom.arm.autoload_list.len();
        let arena_lo = ram_addr + 0x20;
        let addr = apply_newcode_main(&mut rom, arena_lo, &[1, 2, 3, 4], 8).unwrap();
        assert_eq!(addr, ram_addr + 0x180);
        assert_eq!(rom.arm.autoload_list.len(), before + 1);

        let entry = &rom.arm.autoload_list[0];
        assert_eq!(entry.address, ram_addr + 0x180);
        assert_eq!(entry.size, 4);
        assert_eq!(entry.bss_size, 8);
        assert_eq!(entry.data_off, 0x180);

        let params = rom.arm.module_params();
        assert_eq!(params.autoload_start, ram_addr + 0x180 + 4 + 12);
        assert_eq!(params.autoload_list_start, ram_addr + 0x180 + 4);
        assert_eq!(params.autoload_list_end, ram_addr + 0x180 + 4 + 12);

        let heap_top = rom.arm.read_u32(arena_lo);
        assert_eq!(heap_top, ram_addr + 0x180 + 4 + 8);
    }

    #[test]
    fn apply_hook_builds_bridge_and_branches_site() {
        let mut rom = rom_with_main(0x0200_0000, 0x200);
        rom.arm.write_bytes(0x0200_0010, &{
            let mut b = [0u8; 4];
            LittleEndian::write_u32(&mut b, 0xE1A0_1000); // MOV r1, r0
            b
        });
        let mut p = patch(0x0200_0010, DirectiveKind::Hook, false, false);
        p.resolved_src = 0x0200_00A0;
        let mut autogen_base = HashMap::new();
        autogen_base.insert(-1, 0x0200_0100);
        let mut autogen_limit = HashMap::new();
        autogen_limit.insert(-1, 0x40);
        let finalized = Finalized {
            patches: vec![p],
            rtrepl: vec![],
            autogen_base,
            autogen_limit,
            newcode: Default::default(),
            region_payloads: Default::default(),
        };
        apply_patches(&mut rom, &finalized).unwrap();
        let site_insn = rom.arm.read_u32(0x0200_0010);
        assert!(trampoline::is_arm_branch(site_insn));
        assert_eq!(trampoline::decode_arm_branch(0x0200_0010, site_insn), 0x0200_0100);
        let original = rom.arm.read_u32(0x0200_0100 + 12);
        assert_eq!(original, 0xE1A0_1000);
    }
}
