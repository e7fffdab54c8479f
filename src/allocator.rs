// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Overwrite-region allocator: packs surviving sections into user-declared
//! reclaimable ranges using a best-fit, largest-first policy. Grounded on
//! the teacher's `dist.rs` `allocate_all`/`allocate_one` free-region packer.

use indexmap::IndexMap;
use log::debug;

use crate::directives::OverwriteCandidate;
use crate::rom::Destination;
use crate::units::UnitId;

#[derive(Debug, Clone)]
pub struct OverwriteRegion {
    pub start: u32,
    pub end: u32,
    pub dest_tag: Destination,
    pub used_size: u32,
    pub assigned_sections: Vec<(UnitId, i32)>,
    pub mem_name: String,
}

impl OverwriteRegion {
    pub fn new(start: u32, end: u32, dest_tag: Destination, mem_name: String) -> Self {
        Self {
            start,
            end,
            dest_tag,
            used_size: 0,
            assigned_sections: Vec::new(),
            mem_name,
        }
    }

    fn capacity(&self) -> u32 {
        self.end - self.start
    }
}

fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment <= 1 {
        return value;
    }
    (value + alignment - 1) / alignment * alignment
}

/// Groups regions by destination, largest-free-space first within each
/// group, matching the allocator's bucket-by-destination policy.
pub fn group_regions_by_destination(
    regions: &[OverwriteRegion],
) -> IndexMap<Destination, Vec<usize>> {
    let mut by_dest: IndexMap<Destination, Vec<usize>> = IndexMap::new();
    for (i, r) in regions.iter().enumerate() {
        by_dest.entry(r.dest_tag).or_default().push(i);
    }
    for indices in by_dest.values_mut() {
        indices.sort_by_key(|&i| std::cmp::Reverse(regions[i].capacity()));
    }
    by_dest
}

/// Allocates one destination's candidates (already sorted largest-first by
/// the caller is not required; this function sorts) against that
/// destination's regions (largest-free-space first).
pub fn allocate_for_destination(
    regions: &mut [OverwriteRegion],
    mut candidates: Vec<OverwriteCandidate>,
) -> Vec<OverwriteCandidate> {
    candidates.sort_by_key(|c| std::cmp::Reverse(c.size));

    let mut order: Vec<usize> = (0..regions.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(regions[i].end - regions[i].start));

    let mut unplaced = Vec::new();
    for candidate in candidates {
        let mut placed = false;
        for &ri in &order {
            let region = &mut regions[ri];
            let addr = align_up(region.start + region.used_size, candidate.alignment);
            if addr + candidate.size <= region.end {
                let pad = addr - (region.start + region.used_size);
                region.used_size += pad + candidate.size;
                region.assigned_sections.push((candidate.unit, candidate.section_idx));
                debug!(
                    target: "patch::section",
                    "placed '{}' ({} bytes) in region '{}' at {:#x}",
                    candidate.name, candidate.size, region.mem_name, addr
                );
                placed = true;
                break;
            }
        }
        if !placed {
            unplaced.push(candidate);
        }
    }
    unplaced
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(unit: UnitId, idx: i32, size: u32) -> OverwriteCandidate {
        OverwriteCandidate {
            unit,
            section_idx: idx,
            name: format!("sec{idx}"),
            size,
            alignment: 4,
        }
    }

    #[test]
    fn best_fit_seed_scenario_from_spec() {
        // 192-byte region; candidates of 120, 48, 40 (all 4-byte aligned):
        // 120 placed at start, 48 right after, 40 falls through as unplaced.
        let mut regions = vec![OverwriteRegion::new(0x02005000, 0x020050C0, -1, "ov0".into())];
        let candidates = vec![candidate(0, 1, 120), candidate(0, 2, 48), candidate(0, 3, 40)];
        let unplaced = allocate_for_destination(&mut regions, candidates);

        assert_eq!(unplaced.len(), 1);
        assert_eq!(unplaced[0].size, 40);
        assert_eq!(regions[0].used_size, 168);
        assert_eq!(regions[0].assigned_sections.len(), 2);
    }

    #[test]
    fn respects_alignment_gaps() {
        let mut regions = vec![OverwriteRegion::new(0, 100, -1, "r".into())];
        let mut c1 = candidate(0, 1, 10);
        c1.alignment = 1;
        let mut c2 = candidate(0, 2, 8);
        c2.alignment = 16;
        let unplaced = allocate_for_destination(&mut regions, vec![c1, c2]);
        assert!(unplaced.is_empty());
        // c2 (size 8) placed first (largest-first sort is by size desc: 10 > 8, so c1 first)
        assert_eq!(regions[0].used_size, 10 + 6 /*pad to 16*/ + 8);
    }
}
