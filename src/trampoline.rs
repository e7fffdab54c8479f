// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trampoline synthesiser: branch-instruction encoding and the ARM<->THUMB
//! bridge layouts written into the autogen-data arena the linker script
//! reserves at the tail of each destination's `.text`.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::NcpError;

const ARM_B_COND_MASK: u32 = 0xFF00_0000;
const ARM_B: u32 = 0xEA00_0000;
const ARM_BL: u32 = 0xEB00_0000;
const ARM_BLX_IMM_H: u32 = 0xFA00_0000;
const THUMB_BL_HIGH: u16 = 0xF000;
const THUMB_BL_LOW: u16 = 0xF800;
const THUMB_BLX_LOW: u16 = 0xE800;

/// Encodes an ARM `B`/`BL` targeting a word-aligned address. `link` selects
/// `BL` over `B`. Both source and destination must be ARM (not THUMB).
pub fn encode_arm_branch(src: u32, dst: u32, link: bool) -> Result<u32, NcpError> {
    if src & 0b11 != 0 || dst & 0b11 != 0 {
        return Err(NcpError::UnrelocatableInstruction(
            "ARM branch requires 4-byte aligned source and destination".into(),
        ));
    }
    let offset = (dst as i64) - (src as i64) - 8;
    if offset % 4 != 0 {
        return Err(NcpError::UnrelocatableInstruction("branch offset not word aligned".into()));
    }
    let imm24 = offset / 4;
    if !(-(1 << 23)..(1 << 23)).contains(&imm24) {
        return Err(NcpError::BranchOutOfRange(format!(
            "ARM branch from {src:#x} to {dst:#x} exceeds +-32MB range"
        )));
    }
    let opcode = if link { ARM_BL } else { ARM_B };
    Ok(opcode | (imm24 as u32 & 0x00FF_FFFF))
}

/// Encodes an ARM `BLX` (immediate form) targeting a THUMB address from an
/// ARM source. Only valid on the interworking-capable ARM9 core.
pub fn encode_arm_blx(src: u32, dst: u32) -> Result<u32, NcpError> {
    if src & 0b11 != 0 {
        return Err(NcpError::UnrelocatableInstruction("BLX source must be 4-byte aligned".into()));
    }
    let dst_aligned = dst & !1;
    let offset = (dst_aligned as i64) - (src as i64) - 8;
    let h = ((offset >> 1) & 1) as u32;
    let imm24 = offset >> 2;
    if !(-(1 << 23)..(1 << 23)).contains(&imm24) {
        return Err(NcpError::BranchOutOfRange(format!(
            "BLX from {src:#x} to {dst:#x} exceeds +-32MB range"
        )));
    }
    Ok(ARM_BLX_IMM_H | (h << 24) | (imm24 as u32 & 0x00FF_FFFF))
}

/// Encodes a THUMB `BL` (or `BLX` when `blx` is set) as its two halfwords.
pub fn encode_thumb_bl(src: u32, dst: u32, blx: bool) -> Result<[u16; 2], NcpError> {
    let offset = (dst as i64 & !1) - (src as i64) - 4;
    if !(-(1 << 22)..(1 << 22)).contains(&offset) {
        return Err(NcpError::BranchOutOfRange(format!(
            "THUMB BL from {src:#x} to {dst:#x} exceeds +-4MB range"
        )));
    }
    let high = THUMB_BL_HIGH | (((offset >> 12) & 0x7FF) as u16);
    let low_opcode = if blx { THUMB_BLX_LOW } else { THUMB_BL_LOW };
    let low = low_opcode | (((offset >> 1) & 0x7FF) as u16);
    Ok([high, low])
}

/// Decodes an ARM B/BL word back to its absolute target, for round-trip tests
/// and for rewriting an existing in-ROM branch.
pub fn decode_arm_branch(src: u32, insn: u32) -> u32 {
    let imm24 = insn & 0x00FF_FFFF;
    let signed = ((imm24 << 8) as i32) >> 8;
    (src as i64 + 8 + (signed as i64) * 4) as u32
}

pub fn is_arm_branch(insn: u32) -> bool {
    insn & ARM_B_COND_MASK == ARM_B || insn & ARM_B_COND_MASK == ARM_BL
}

/// Instructions whose encoding embeds a PC-relative offset and therefore
/// cannot simply be copied byte for byte into a trampoline without a fixup:
/// LDR/STR (and halfword/signed-byte variants) with Rn == PC, and ADR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcRelativeKind {
    LdrLiteral,
    AdrArm,
}

/// Detects whether a THUMB instruction is a PC-relative `LDR` (literal pool
/// load, opcode `01001xxx`) or an `ADR` (opcode `10100xxx`).
pub fn thumb_pc_relative_kind(insn: u16) -> Option<PcRelativeKind> {
    if insn & 0xF800 == 0x4800 {
        Some(PcRelativeKind::LdrLiteral)
    } else if insn & 0xF800 == 0xA000 {
        Some(PcRelativeKind::AdrArm)
    } else {
        None
    }
}

/// Rewrites a relocated THUMB PC-relative instruction's immediate so it
/// keeps pointing at the same absolute literal/address after being moved
/// from `old_pc` to `new_pc`. Both must share 4-byte literal-pool alignment.
pub fn fixup_thumb_pc_relative(insn: u16, old_pc: u32, new_pc: u32) -> Result<u16, NcpError> {
    let kind = thumb_pc_relative_kind(insn)
        .ok_or_else(|| NcpError::UnrelocatableInstruction("not a PC-relative THUMB instruction".into()))?;
    let imm8 = (insn & 0xFF) as u32;
    let old_target = (old_pc & !3) + 4 + imm8 * 4;
    let new_base = (new_pc & !3) + 4;
    if old_target < new_base {
        return Err(NcpError::UnrelocatableInstruction(
            "PC-relative fixup would require a negative offset".into(),
        ));
    }
    let new_imm8 = (old_target - new_base) / 4;
    if new_imm8 > 0xFF {
        return Err(NcpError::UnrelocatableInstruction(format!(
            "PC-relative fixup offset {new_imm8} exceeds 8-bit immediate ({kind:?})"
        )));
    }
    Ok((insn & 0xFF00) | new_imm8 as u16)
}

/// ARM (32-bit) instructions whose encoding embeds a PC-relative offset:
/// word/byte `LDR`/`STR` (12-bit immediate), halfword/signed `LDRH`/`STRH`/
/// `LDRSB`/`LDRSH` (8-bit immediate split across two nibbles), and the
/// `ADR` pseudo-instruction (an `ADD`/`SUB` against `pc` with a rotated
/// 8-bit immediate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmPcRelativeKind {
    LdrStrImm12,
    HalfwordImm8,
    Adr,
}

/// Detects whether an ARM instruction addresses `pc` (r15) as its base
/// register in one of the three PC-relative addressing forms above.
pub fn arm_pc_relative_kind(insn: u32) -> Option<ArmPcRelativeKind> {
    let rn = (insn >> 16) & 0xF;
    if rn != 0xF {
        return None;
    }
    if insn & 0x0C00_0000 == 0x0400_0000 && insn & 0x0200_0000 == 0 {
        return Some(ArmPcRelativeKind::LdrStrImm12);
    }
    if insn & 0x0E00_0000 == 0 && insn & 0x90 == 0x90 && insn & 0x0040_0000 != 0 {
        return Some(ArmPcRelativeKind::HalfwordImm8);
    }
    if insn & 0x0C00_0000 == 0 && insn & 0x0200_0000 != 0 {
        let opcode = (insn >> 21) & 0xF;
        if opcode == 0b0100 || opcode == 0b0010 {
            return Some(ArmPcRelativeKind::Adr);
        }
    }
    None
}

/// Decodes an ARM "modified immediate" (4-bit rotate, 8-bit value, rotate
/// applied as a 32-bit rotate-right by twice the rotate field).
fn decode_arm_imm(rot: u32, imm8: u32) -> u32 {
    imm8.rotate_right(rot * 2)
}

/// Finds the smallest even rotation that re-encodes `value` as an 8-bit
/// immediate, or `None` if no rotation can represent it exactly.
fn encode_arm_imm(value: u32) -> Option<(u32, u32)> {
    for rot in 0..16u32 {
        let rotated = value.rotate_left(rot * 2);
        if rotated <= 0xFF {
            return Some((rot, rotated));
        }
    }
    None
}

/// Rewrites a relocated ARM PC-relative instruction's immediate (and, for
/// `LdrStrImm12`/`HalfwordImm8`, its up/down bit) so it keeps addressing the
/// same absolute target after being moved from `old_pc` to `new_pc`. ARM's
/// pipeline reads `pc` as the instruction's own address plus 8.
pub fn fixup_arm_pc_relative(insn: u32, old_pc: u32, new_pc: u32) -> Result<u32, NcpError> {
    let kind = arm_pc_relative_kind(insn)
        .ok_or_else(|| NcpError::UnrelocatableInstruction("not a PC-relative ARM instruction".into()))?;
    let base_old = old_pc as i64 + 8;
    let base_new = new_pc as i64 + 8;

    match kind {
        ArmPcRelativeKind::LdrStrImm12 => {
            let imm12 = (insn & 0xFFF) as i64;
            let old_target = if insn & 0x0080_0000 != 0 { base_old + imm12 } else { base_old - imm12 };
            let diff = old_target - base_new;
            if diff.unsigned_abs() > 0xFFF {
                return Err(NcpError::UnrelocatableInstruction(format!(
                    "PC-relative LDR/STR fixup offset {diff} exceeds 12-bit immediate"
                )));
            }
            let mut out = insn & !(0x0080_0000 | 0xFFF);
            if diff >= 0 {
                out |= 0x0080_0000;
            }
            out |= diff.unsigned_abs() as u32;
            Ok(out)
        }
        ArmPcRelativeKind::HalfwordImm8 => {
            let imm8 = (((insn >> 8) & 0xF) << 4) | (insn & 0xF);
            let imm8 = imm8 as i64;
            let old_target = if insn & 0x0080_0000 != 0 { base_old + imm8 } else { base_old - imm8 };
            let diff = old_target - base_new;
            if diff.unsigned_abs() > 0xFF {
                return Err(NcpError::UnrelocatableInstruction(format!(
                    "PC-relative LDRH/STRH fixup offset {diff} exceeds 8-bit immediate"
                )));
            }
            let new_imm8 = diff.unsigned_abs() as u32;
            let mut out = insn & !(0x0080_0000 | 0x0F00 | 0x000F);
            if diff >= 0 {
                out |= 0x0080_0000;
            }
            out |= (new_imm8 & 0xF0) << 4;
            out |= new_imm8 & 0x0F;
            Ok(out)
        }
        ArmPcRelativeKind::Adr => {
            let opcode = (insn >> 21) & 0xF;
            let rot = (insn >> 8) & 0xF;
            let imm8 = insn & 0xFF;
            let old_imm = decode_arm_imm(rot, imm8) as i64;
            let old_target = if opcode == 0b0100 { base_old + old_imm } else { base_old - old_imm };
            let diff = old_target - base_new;
            let (new_opcode, magnitude) = if diff >= 0 { (0b0100u32, diff) } else { (0b0010u32, -diff) };
            let (new_rot, new_imm8) = encode_arm_imm(magnitude as u32).ok_or_else(|| {
                NcpError::UnrelocatableInstruction(format!(
                    "PC-relative ADR fixup offset {magnitude} has no rotated-immediate encoding"
                ))
            })?;
            let mut out = insn & !(0xF << 21) & !0xFFF;
            out |= new_opcode << 21;
            out |= new_rot << 8;
            out |= new_imm8;
            Ok(out)
        }
    }
}

/// Builds the 8-byte ARM->THUMB interworking bridge: `BX` via a literal pool
/// entry holding the THUMB target with bit 0 set. Used for `jump` directives
/// crossing instruction sets, since `jump` (unlike `call`) must not disturb
/// `lr`, ruling out a direct `BLX` immediate.
///
/// Layout: `LDR PC, [PC, #-4]` ; `.word target|1`
pub fn arm_to_thumb_bridge(target: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    LittleEndian::write_u32(&mut buf[0..4], 0xE51F_F004); // LDR PC, [PC, #-4]
    LittleEndian::write_u32(&mut buf[4..8], target | 1);
    buf
}

/// Builds the 20-byte hook bridge written into the autogen-data arena at
/// `bridge_addr`: save volatile registers, call into the hook body, restore
/// them, replay the (already fixed-up) instruction the hook overwrote, then
/// branch back to resume normal execution right after the hook site.
///
/// Layout: `STMFD sp!, {r0-r3,r12,lr}` ; `BL`/`BLX` hook body ;
/// `LDMFD sp!, {r0-r3,r12,lr}` ; original instruction ; `B` resume_addr.
pub fn build_hook_bridge(
    bridge_addr: u32,
    hook_target: u32,
    hook_is_thumb: bool,
    original_insn: u32,
    resume_addr: u32,
) -> Result<[u8; 20], NcpError> {
    let mut buf = [0u8; 20];
    LittleEndian::write_u32(&mut buf[0..4], 0xE92D_500F); // STMFD sp!, {r0-r3,r12,lr}
    let call_insn = if hook_is_thumb {
        encode_arm_blx(bridge_addr + 4, hook_target)?
    } else {
        encode_arm_branch(bridge_addr + 4, hook_target, true)?
    };
    LittleEndian::write_u32(&mut buf[4..8], call_insn);
    LittleEndian::write_u32(&mut buf[8..12], 0xE8BD_500F); // LDMFD sp!, {r0-r3,r12,lr}
    LittleEndian::write_u32(&mut buf[12..16], original_insn);
    let back_insn = encode_arm_branch(bridge_addr + 16, resume_addr, false)?;
    LittleEndian::write_u32(&mut buf[16..20], back_insn);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_branch_round_trips() {
        let src = 0x0200_1000;
        let dst = 0x0200_2000;
        let insn = encode_arm_branch(src, dst, false).unwrap();
        assert_eq!(decode_arm_branch(src, insn), dst);
        assert!(is_arm_branch(insn));
    }

    #[test]
    fn arm_bl_sets_link_bit() {
        let insn = encode_arm_branch(0x1000, 0x1008, true).unwrap();
        assert_eq!(insn & 0xFF00_0000, ARM_BL);
    }

    #[test]
    fn rejects_unaligned_arm_branch() {
        assert!(encode_arm_branch(0x1001, 0x2000, false).is_err());
    }

    #[test]
    fn rejects_out_of_range_arm_branch() {
        assert!(encode_arm_branch(0, 0x0400_0000, false).is_err());
    }

    #[test]
    fn thumb_bl_encodes_two_halfwords() {
        let [hi, lo] = encode_thumb_bl(0x1000, 0x1100, false).unwrap();
        assert_eq!(hi & 0xF800, THUMB_BL_HIGH);
        assert_eq!(lo & 0xF800, THUMB_BL_LOW);
    }

    #[test]
    fn thumb_blx_uses_blx_low_opcode() {
        let [_hi, lo] = encode_thumb_bl(0x1000, 0x1100, true).unwrap();
        assert_eq!(lo & 0xF800, THUMB_BLX_LOW);
    }

    #[test]
    fn thumb_pc_relative_fixup_preserves_target() {
        let insn: u16 = 0x4802; // LDR r0, [pc, #8]
        let old_pc = 0x1000;
        let old_target = (old_pc & !3u32) + 4 + 2 * 4;
        let new_pc = 0x2000;
        let fixed = fixup_thumb_pc_relative(insn, old_pc, new_pc).unwrap();
        let new_base = (new_pc & !3u32) + 4;
        let new_imm8 = (fixed & 0xFF) as u32;
        assert_eq!(new_base + new_imm8 * 4, old_target);
    }

    #[test]
    fn bridge_layouts_have_fixed_sizes() {
        assert_eq!(arm_to_thumb_bridge(0x1000).len(), 8);
        let bridge = build_hook_bridge(0x0200_4000, 0x0200_8000, false, 0xE1A0_0000, 0x0200_1004).unwrap();
        assert_eq!(bridge.len(), 20);
    }

    #[test]
    fn arm_to_thumb_bridge_sets_thumb_bit() {
        let buf = arm_to_thumb_bridge(0x0200_1000);
        let target = LittleEndian::read_u32(&buf[4..8]);
        assert_eq!(target & 1, 1);
    }

    #[test]
    fn hook_bridge_replays_original_instruction_and_returns_home() {
        let bridge_addr = 0x0200_4000;
        let resume = 0x0200_1004;
        let original = 0xE1A0_1000; // MOV r1, r0
        let bridge = build_hook_bridge(bridge_addr, 0x0200_8000, false, original, resume).unwrap();
        assert_eq!(LittleEndian::read_u32(&bridge[12..16]), original);
        let back_insn = LittleEndian::read_u32(&bridge[16..20]);
        assert_eq!(decode_arm_branch(bridge_addr + 16, back_insn), resume);
    }

    #[test]
    fn arm_ldr_literal_fixup_preserves_target() {
        let insn: u32 = 0xE59F_0010; // LDR r0, [pc, #0x10]
        let old_pc = 0x0200_1000;
        let old_target = old_pc + 8 + 0x10;
        let new_pc = 0x0200_4000;
        let fixed = fixup_arm_pc_relative(insn, old_pc, new_pc).unwrap();
        let new_target = decode_arm_ldr_target(fixed, new_pc);
        assert_eq!(new_target, old_target);
    }

    #[test]
    fn arm_adr_fixup_preserves_target() {
        let insn: u32 = 0xE28F_0010; // ADD r0, pc, #0x10 (ADR r0, .+0x18)
        let old_pc = 0x0200_1000;
        let old_target = old_pc + 8 + 0x10;
        let new_pc = 0x0200_4000;
        let fixed = fixup_arm_pc_relative(insn, old_pc, new_pc).unwrap();
        assert_eq!(arm_pc_relative_kind(fixed), Some(ArmPcRelativeKind::Adr));
        let rot = (fixed >> 8) & 0xF;
        let imm8 = fixed & 0xFF;
        let new_imm = decode_arm_imm(rot, imm8);
        let opcode = (fixed >> 21) & 0xF;
        let new_target = if opcode == 0b0100 { new_pc + 8 + new_imm } else { new_pc + 8 - new_imm };
        assert_eq!(new_target, old_target);
    }

    fn decode_arm_ldr_target(insn: u32, pc: u32) -> u32 {
        let imm12 = insn & 0xFFF;
        if insn & 0x0080_0000 != 0 {
            pc + 8 + imm12
        } else {
            pc + 8 - imm12
        }
    }
}
