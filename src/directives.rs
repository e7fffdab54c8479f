// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Patch-directive extractor. Decodes the `ncp_*` naming grammar once, at
//! this boundary, into a tagged `DirectiveKind` plus orthogonal flags so
//! every downstream stage switches on the variant, never on the name.

use std::collections::HashSet;

use log::debug;
use regex::Regex;

use crate::config::parse_int;
use crate::elf::{self, Sym};
use crate::error::NcpError;
use crate::rom::Destination;
use crate::units::{UnitId, UnitRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    Jump,
    Call,
    Hook,
    Over,
    RtRepl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Section,
    Symbol,
    Symver,
}

#[derive(Debug, Clone)]
pub struct PatchRecord {
    pub symbol: String,
    pub unit: UnitId,
    pub origin: Origin,
    pub kind: DirectiveKind,
    pub is_ncp_set: bool,
    pub src_address: u32,
    pub src_address_ov: Destination,
    pub dst_address: u32,
    pub dst_address_ov: Destination,
    pub src_thumb: bool,
    pub dst_thumb: bool,
    pub section_idx: i32,
    pub section_size: u32,
}

impl PatchRecord {
    /// Number of destination bytes this patch claims, used for the overlap
    /// check: 8 for an ARM->THUMB jump bridge site, `section_size` for
    /// `over`, 4 otherwise.
    pub fn overwrite_size(&self) -> u32 {
        match self.kind {
            DirectiveKind::Over => self.section_size,
            DirectiveKind::Jump if self.dst_thumb != self.src_thumb => 8,
            _ => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RtReplMarker {
    pub name: String,
    pub unit: UnitId,
    pub section_idx: i32,
}

#[derive(Debug, Clone)]
pub struct OverwriteCandidate {
    pub unit: UnitId,
    pub section_idx: i32,
    pub name: String,
    pub size: u32,
    pub alignment: u32,
}

#[derive(Debug, Default)]
pub struct ExtractedDirectives {
    pub patches: Vec<PatchRecord>,
    pub rtrepl: Vec<RtReplMarker>,
    pub overwrite_candidates: Vec<OverwriteCandidate>,
    pub external_symbols: HashSet<String>,
}

fn directive_regex() -> Regex {
    Regex::new(r"^\.?ncp_([a-z]+)_(0[xX][0-9a-fA-F]+|\d+)(?:_ov(\d+))?$").unwrap()
}

fn symver_regex() -> Regex {
    Regex::new(r"^__ncp_([a-z]+)_(0[xX][0-9a-fA-F]+|\d+)(?:_ov(\d+))?_(.+)$").unwrap()
}

/// Collapses the twelve `set`/`sett`/`t`-prefixed op spellings into a
/// canonical `DirectiveKind` plus `is_ncp_set` / destination-THUMB flags.
fn normalize_op(raw: &str) -> Result<(DirectiveKind, bool, bool), NcpError> {
    let (is_ncp_set, dst_thumb, base) = if let Some(rest) = raw.strip_prefix("sett") {
        (true, true, rest)
    } else if let Some(rest) = raw.strip_prefix("set") {
        (true, false, rest)
    } else if let Some(rest) = raw.strip_prefix("t") {
        (false, true, rest)
    } else {
        (false, false, raw)
    };
    let kind = match base {
        "jump" => DirectiveKind::Jump,
        "call" => DirectiveKind::Call,
        "hook" => DirectiveKind::Hook,
        "over" => DirectiveKind::Over,
        "rtrepl" => DirectiveKind::RtRepl,
        other => {
            return Err(NcpError::InvalidDirective(format!(
                "unknown directive op '{other}' (from '{raw}')"
            )))
        }
    };
    Ok((kind, is_ncp_set, dst_thumb))
}

fn is_special_section(name: &str) -> bool {
    name.starts_with(".rel")
        || name.starts_with(".debug")
        || name == ".shstrtab"
        || name == ".strtab"
        || name == ".symtab"
}

fn is_overwrite_candidate_name(name: &str) -> bool {
    name.starts_with(".text")
        || name.starts_with(".rodata")
        || name.starts_with(".init_array")
        || name.starts_with(".data")
        || name.starts_with(".bss")
        || matches!(
            name,
            ".ncp_jump" | ".ncp_call" | ".ncp_hook" | ".ncp_tjump" | ".ncp_tcall" | ".ncp_thook"
        )
}

fn dest_tag(ov: Option<&str>) -> Destination {
    ov.and_then(|s| s.parse::<i32>().ok()).unwrap_or(-1)
}

pub fn extract(registry: &UnitRegistry) -> Result<ExtractedDirectives, NcpError> {
    let dir_re = directive_regex();
    let symver_re = symver_regex();
    let mut out = ExtractedDirectives::default();

    for unit_id in registry.all_units() {
        let unit = registry.get(unit_id);
        let elf = unit.elf()?;

        // --- section-form directives and overwrite candidates ---
        let mut section_names = Vec::new();
        elf.for_each_section(|idx, sh, name| {
            section_names.push((idx, *sh, name.to_string()));
        });

        for (idx, sh, name) in &section_names {
            if let Some(caps) = dir_re.captures(name) {
                let raw_op = &caps[1];
                let addr = parse_int(&caps[2])?;
                let ov = caps.get(3).map(|m| m.as_str());
                let (kind, is_ncp_set, dst_thumb) = normalize_op(raw_op)?;

                if is_ncp_set && sh.sh_size != 4 {
                    return Err(NcpError::InvalidDirective(format!(
                        "ncp_set section '{name}' must be exactly 4 bytes, got {}",
                        sh.sh_size
                    )));
                }

                if kind == DirectiveKind::RtRepl {
                    out.rtrepl.push(RtReplMarker {
                        name: name.trim_start_matches('.').to_string(),
                        unit: unit_id,
                        section_idx: *idx as i32,
                    });
                    continue;
                }

                debug!(target: "patch::directives", "section directive {name} -> {kind:?} @ {addr:#x}");

                out.patches.push(PatchRecord {
                    symbol: name.trim_start_matches('.').to_string(),
                    unit: unit_id,
                    origin: Origin::Section,
                    kind,
                    is_ncp_set,
                    src_address: 0,
                    src_address_ov: -1,
                    dst_address: addr,
                    dst_address_ov: dest_tag(ov),
                    src_thumb: false,
                    dst_thumb,
                    section_idx: *idx as i32,
                    section_size: sh.sh_size,
                });
            }

            if !is_special_section(name) && sh.sh_size > 0 && is_overwrite_candidate_name(name) {
                out.overwrite_candidates.push(OverwriteCandidate {
                    unit: unit_id,
                    section_idx: *idx as i32,
                    name: name.clone(),
                    size: sh.sh_size,
                    alignment: sh.sh_addralign.max(1),
                });
            }
        }

        // --- symbol-form and symver-form directives ---
        let mut func_syms: Vec<(Sym, String)> = Vec::new();
        let mut symbol_error: Option<NcpError> = None;
        elf.for_each_symbol(|sym, name| {
            if elf::st_type(sym.st_info) == elf::STT_FUNC {
                func_syms.push((*sym, name.to_string()));
            }

            if let Some(caps) = dir_re.captures(name) {
                let raw_op = &caps[1];
                if let Ok(addr) = parse_int(&caps[2]) {
                    let ov = caps.get(3).map(|m| m.as_str());
                    if let Ok((kind, is_ncp_set, dst_thumb)) = normalize_op(raw_op) {
                        if kind == DirectiveKind::Over {
                            if symbol_error.is_none() {
                                symbol_error = Some(NcpError::InvalidDirective(format!(
                                    "'over' directive '{name}' must be a section, not a symbol"
                                )));
                            }
                            return;
                        }
                        out.patches.push(PatchRecord {
                            symbol: name.to_string(),
                            unit: unit_id,
                            origin: Origin::Symbol,
                            kind,
                            is_ncp_set,
                            src_address: 0,
                            src_address_ov: -1,
                            dst_address: addr,
                            dst_address_ov: dest_tag(ov),
                            src_thumb: false,
                            dst_thumb,
                            section_idx: -1,
                            section_size: 0,
                        });
                        out.external_symbols.insert(name.to_string());
                    }
                }
            } else if let Some(caps) = symver_re.captures(name) {
                let raw_op = &caps[1];
                if let Ok(addr) = parse_int(&caps[2]) {
                    let ov = caps.get(3).map(|m| m.as_str());
                    if let Ok((kind, is_ncp_set, dst_thumb)) = normalize_op(raw_op) {
                        out.patches.push(PatchRecord {
                            symbol: name.to_string(),
                            unit: unit_id,
                            origin: Origin::Symver,
                            kind,
                            is_ncp_set,
                            src_address: sym.st_value,
                            src_address_ov: -1,
                            dst_address: addr,
                            dst_address_ov: dest_tag(ov),
                            src_thumb: false,
                            dst_thumb,
                            section_idx: sym.st_shndx as i32,
                            section_size: 0,
                        });
                    }
                }
            }
        });
        if let Some(err) = symbol_error {
            return Err(err);
        }

        // Resolve symver placeholders to the first function-typed symbol
        // in the same section with matching value and no `@` in its name.
        for patch in out
            .patches
            .iter_mut()
            .filter(|p| p.unit == unit_id && p.origin == Origin::Symver)
        {
            let resolved = func_syms.iter().find(|(s, n)| {
                s.st_shndx as i32 == patch.section_idx
                    && s.st_value == patch.src_address
                    && !n.contains('@')
            });
            match resolved {
                Some((_, name)) => {
                    patch.symbol = name.clone();
                    out.external_symbols.insert(name.clone());
                }
                None => {
                    return Err(NcpError::UnresolvedSymver(patch.symbol.clone()));
                }
            }
        }

        // THUMB detection for source: copy the defining function's LSB into
        // src_thumb for every patch whose section_idx names that function's section.
        for patch in out.patches.iter_mut().filter(|p| p.unit == unit_id) {
            if patch.section_idx < 0 {
                continue;
            }
            if let Some((sym, _)) = func_syms
                .iter()
                .find(|(s, _)| s.st_shndx as i32 == patch.section_idx)
            {
                patch.src_thumb = sym.st_value & 1 != 0;
            }
        }
    }

    validate_overlap(&out.patches)?;
    Ok(out)
}

fn validate_overlap(patches: &[PatchRecord]) -> Result<(), NcpError> {
    let mut ranges: Vec<(Destination, u32, u32)> = patches
        .iter()
        .map(|p| (p.dst_address_ov, p.dst_address, p.dst_address + p.overwrite_size()))
        .collect();
    ranges.sort_by_key(|&(ov, start, _)| (ov, start));
    for pair in ranges.windows(2) {
        let (ov_a, _, end_a) = pair[0];
        let (ov_b, start_b, _) = pair[1];
        if ov_a == ov_b && start_b < end_a {
            return Err(NcpError::OverlappingPatches(format!(
                "patches overlap at destination {ov_a}, address {start_b:#x}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_plain_op() {
        let (kind, is_set, thumb) = normalize_op("jump").unwrap();
        assert_eq!(kind, DirectiveKind::Jump);
        assert!(!is_set);
        assert!(!thumb);
    }

    #[test]
    fn normalizes_set_prefixed_op() {
        let (kind, is_set, thumb) = normalize_op("setcall").unwrap();
        assert_eq!(kind, DirectiveKind::Call);
        assert!(is_set);
        assert!(!thumb);
    }

    #[test]
    fn normalizes_sett_prefixed_op() {
        let (kind, is_set, thumb) = normalize_op("setthook").unwrap();
        assert_eq!(kind, DirectiveKind::Hook);
        assert!(is_set);
        assert!(thumb);
    }

    #[test]
    fn normalizes_t_prefixed_op() {
        let (kind, is_set, thumb) = normalize_op("tjump").unwrap();
        assert_eq!(kind, DirectiveKind::Jump);
        assert!(!is_set);
        assert!(thumb);
    }

    #[test]
    fn rejects_unknown_op() {
        assert!(normalize_op("bogus").is_err());
    }

    #[test]
    fn directive_regex_parses_addr_and_overlay() {
        let re = directive_regex();
        let caps = re.captures("ncp_call_0x02004000_ov3").unwrap();
        assert_eq!(&caps[1], "call");
        assert_eq!(&caps[2], "0x02004000");
        assert_eq!(&caps[3], "3");
    }

    #[test]
    fn overwrite_candidate_names() {
        assert!(is_overwrite_candidate_name(".text"));
        assert!(is_overwrite_candidate_name(".ncp_hook"));
        assert!(!is_overwrite_candidate_name(".debug_info"));
    }

    #[test]
    fn detects_overlapping_patches() {
        let patches = vec![
            PatchRecord {
                symbol: "a".into(),
                unit: 0,
                origin: Origin::Symbol,
                kind: DirectiveKind::Call,
                is_ncp_set: false,
                src_address: 0,
                src_address_ov: -1,
                dst_address: 0x1000,
                dst_address_ov: -1,
                src_thumb: false,
                dst_thumb: false,
                section_idx: -1,
                section_size: 0,
            },
            PatchRecord {
                symbol: "b".into(),
                unit: 0,
                origin: Origin::Symbol,
                kind: DirectiveKind::Call,
                is_ncp_set: false,
                src_address: 0,
                src_address_ov: -1,
                dst_address: 0x1002,
                dst_address_ov: -1,
                src_thumb: false,
                dst_thumb: false,
                section_idx: -1,
                section_size: 0,
            },
        ];
        assert!(validate_overlap(&patches).is_err());
    }
}
