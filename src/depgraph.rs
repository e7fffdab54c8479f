// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dependency resolver: approximates a GC-linker's mark phase ahead of
//! linking so the overwrite-region allocator sees accurate surviving sizes.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::directives::OverwriteCandidate;
use crate::elf::{self, Sym};
use crate::units::{UnitId, UnitRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SectionKey {
    unit: UnitId,
    section_idx: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SymbolKey {
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Reference {
    Section(SectionKey),
    Symbol(SymbolKey),
}

struct SectionInfo {
    key: SectionKey,
    refs: Vec<Reference>,
}

/// Builds the reference graph (one node per non-special section, edges from
/// relocations) and resolves a global symbol -> defining-section table.
struct Graph {
    sections: Vec<SectionInfo>,
    symbol_owner: HashMap<String, SectionKey>,
}

fn build_graph(registry: &UnitRegistry) -> Result<Graph, crate::error::NcpError> {
    let mut sections = Vec::new();
    let mut symbol_owner: HashMap<String, SectionKey> = HashMap::new();
    let mut symbol_bind: HashMap<String, u8> = HashMap::new();

    for unit_id in registry.all_units() {
        let unit = registry.get(unit_id);
        let elf = unit.elf()?;

        // Resolve global/weak symbol ownership, honoring
        // strong-overrides-weak / first-wins-among-equals.
        elf.for_each_symbol(|sym: &Sym, name| {
            if name.is_empty() || sym.st_shndx == 0 {
                return;
            }
            let bind = elf::st_bind(sym.st_info);
            if bind != elf::STB_GLOBAL && bind != elf::STB_WEAK {
                return;
            }
            let key = SectionKey {
                unit: unit_id,
                section_idx: sym.st_shndx as i32,
            };
            match symbol_bind.get(name) {
                None => {
                    symbol_owner.insert(name.to_string(), key);
                    symbol_bind.insert(name.to_string(), bind);
                }
                Some(&existing_bind) => {
                    if existing_bind == elf::STB_WEAK && bind == elf::STB_GLOBAL {
                        symbol_owner.insert(name.to_string(), key);
                        symbol_bind.insert(name.to_string(), bind);
                    }
                    // strong-over-weak and first-wins-among-equals: otherwise keep existing
                }
            }
        });

        let mut refs_by_section: HashMap<i32, Vec<Reference>> = HashMap::new();
        elf.for_each_relocation(|_rel, target_section_name, sym_name| {
            // Find the index of the target section by name (the section the
            // relocations apply to), then record the referenced symbol/section.
            let mut target_idx = None;
            elf.for_each_section(|idx, _sh, name| {
                if name == target_section_name {
                    target_idx = Some(idx as i32);
                }
            });
            let Some(target_idx) = target_idx else { return };

            // Determine whether the symbol is itself a section symbol by
            // checking if a section shares that exact name.
            let mut is_section_ref = false;
            let mut ref_section_idx = None;
            elf.for_each_section(|idx, _sh, name| {
                if name == sym_name {
                    is_section_ref = true;
                    ref_section_idx = Some(idx as i32);
                }
            });

            let reference = if is_section_ref {
                Reference::Section(SectionKey {
                    unit: unit_id,
                    section_idx: ref_section_idx.unwrap(),
                })
            } else {
                Reference::Symbol(SymbolKey {
                    name: sym_name.to_string(),
                })
            };
            refs_by_section.entry(target_idx).or_default().push(reference);
        });

        elf.for_each_section(|idx, _sh, _name| {
            sections.push(SectionInfo {
                key: SectionKey {
                    unit: unit_id,
                    section_idx: idx as i32,
                },
                refs: refs_by_section.remove(&(idx as i32)).unwrap_or_default(),
            });
        });
    }

    Ok(Graph {
        sections,
        symbol_owner,
    })
}

/// Runs the worklist fixed-point mark phase and returns the set of marked
/// `(unit, section_idx)` pairs.
pub fn mark(
    registry: &UnitRegistry,
    entry_points: &HashSet<(UnitId, i32)>,
    verbose: bool,
) -> Result<HashSet<(UnitId, i32)>, crate::error::NcpError> {
    let graph = build_graph(registry)?;
    let mut marked: HashSet<(UnitId, i32)> = entry_points.clone();
    let mut worklist: Vec<(UnitId, i32)> = entry_points.iter().cloned().collect();

    let section_lookup: HashMap<(UnitId, i32), usize> = graph
        .sections
        .iter()
        .enumerate()
        .map(|(i, s)| ((s.key.unit, s.key.section_idx), i))
        .collect();

    while let Some((unit, idx)) = worklist.pop() {
        let Some(&pos) = section_lookup.get(&(unit, idx)) else { continue };
        for reference in &graph.sections[pos].refs {
            match reference {
                Reference::Section(key) => {
                    let target = (key.unit, key.section_idx);
                    if marked.insert(target) {
                        if verbose {
                            debug!(target: "patch::depgraph", "mark {:?} <- intra-unit section ref", target);
                        }
                        worklist.push(target);
                    }
                }
                Reference::Symbol(sym) => {
                    if let Some(owner) = graph.symbol_owner.get(&sym.name) {
                        let target = (owner.unit, owner.section_idx);
                        if marked.insert(target) {
                            if verbose {
                                debug!(target: "patch::depgraph", "mark {:?} <- symbol '{}'", target, sym.name);
                            }
                            worklist.push(target);
                        }
                    } else if verbose {
                        debug!(target: "patch::depgraph", "\u{26a0} unresolved symbol reference '{}'", sym.name);
                    }
                }
            }
        }
    }

    Ok(marked)
}

/// Filters a candidate list down to those whose `(unit, section)` pair
/// survived the mark phase.
pub fn exclude_unused_sections(
    candidates: Vec<OverwriteCandidate>,
    marked: &HashSet<(UnitId, i32)>,
) -> Vec<OverwriteCandidate> {
    candidates
        .into_iter()
        .filter(|c| marked.contains(&(c.unit, c.section_idx)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_unused_sections_keeps_only_marked() {
        let candidates = vec![
            OverwriteCandidate {
                unit: 0,
                section_idx: 1,
                name: ".text".into(),
                size: 10,
                alignment: 4,
            },
            OverwriteCandidate {
                unit: 0,
                section_idx: 2,
                name: ".text.unused".into(),
                size: 10,
                alignment: 4,
            },
        ];
        let mut marked = HashSet::new();
        marked.insert((0, 1));
        let filtered = exclude_unused_sections(candidates, &marked);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].section_idx, 1);
    }
}
