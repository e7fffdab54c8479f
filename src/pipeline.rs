// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Top-level per-target orchestration, wiring every stage together in the
//! order the build actually needs them. Mirrors the teacher's `dist::package`
//! top-level driver: load inputs, run the pipeline, persist outputs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::info;
use walkdir::WalkDir;

use crate::allocator::{self, OverwriteRegion};
use crate::app::AppContext;
use crate::config::{Config, Destination as CfgDestination, Mode, RegionConfig, TargetConfig};
use crate::depgraph;
use crate::directives;
use crate::error::{push_context, NcpError};
use crate::finalize;
use crate::linker::{self, LinkerInputs};
use crate::rebuild_cache::{self, RebuildCache};
use crate::rewrite::{self, OverlayWriteMode};
use crate::rom::arm::ArmBin;
use crate::rom::header::NdsHeader;
use crate::rom::overlay::{self, OverlayBin};
use crate::rom::{self, Destination, RomImage};
use crate::units::UnitRegistry;

/// Runs every `pre-build`/`post-build` shell command in sequence, failing
/// fast on the first non-zero exit.
fn run_shell_commands(commands: &[String]) -> Result<(), NcpError> {
    for cmd in commands {
        info!(target: "patch::build", "running build command: {cmd}");
        let status = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .status()
            .map_err(|e| NcpError::ExternalToolFailure(format!("failed to spawn '{cmd}': {e}")))?;
        if !status.success() {
            return Err(NcpError::ExternalToolFailure(format!(
                "command '{cmd}' exited with {status}"
            )));
        }
    }
    Ok(())
}

fn compiler_for(toolchain: &str, ext: &str) -> Option<String> {
    match ext {
        "c" => Some(format!("{toolchain}gcc")),
        "cpp" | "cc" | "cxx" => Some(format!("{toolchain}g++")),
        "s" | "asm" => Some(format!("{toolchain}gcc")),
        _ => None,
    }
}

/// Compiles every source file under a target's declared source directories
/// into a `.o` next to it in the build directory, skipping files whose
/// object is newer (cheap incrementality, matching the C/C++/ASM table the
/// teacher's maker keeps per extension).
fn compile_sources(
    toolchain: &str,
    build_dir: &Path,
    sources: &[PathBuf],
    includes: &[PathBuf],
    flags_for: impl Fn(&str) -> String,
) -> Result<Vec<PathBuf>, NcpError> {
    let mut objects = Vec::new();
    for source_root in sources {
        let walk = if source_root.is_dir() {
            WalkDir::new(source_root).into_iter().filter_map(|e| e.ok()).collect::<Vec<_>>()
        } else {
            vec![walkdir::WalkDir::new(source_root)
                .into_iter()
                .filter_map(|e| e.ok())
                .next()
                .ok_or_else(|| NcpError::FileNotFound(source_root.clone()))?]
        };

        for entry in walk {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
            let Some(driver) = compiler_for(toolchain, &ext) else { continue };

            let obj_path = build_dir.join(path.file_name().unwrap()).with_extension("o");
            let needs_build = !obj_path.exists()
                || path
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .zip(obj_path.metadata().and_then(|m| m.modified()).ok())
                    .map(|(src, obj)| src > obj)
                    .unwrap_or(true);

            if needs_build {
                let _ctx = push_context(format!("compiling {}", path.display()));
                let mut cmd = Command::new(&driver);
                cmd.arg("-c").arg(path).arg("-o").arg(&obj_path);
                for inc in includes {
                    cmd.arg("-I").arg(inc);
                }
                for flag in flags_for(&ext).split_whitespace() {
                    cmd.arg(flag);
                }
                let output = cmd
                    .output()
                    .map_err(|e| NcpError::ExternalToolFailure(format!("failed to spawn {driver}: {e}")))?;
                if !output.status.success() {
                    return Err(NcpError::ExternalToolFailure(format!(
                        "{} failed on {}: {}",
                        driver,
                        path.display(),
                        String::from_utf8_lossy(&output.stderr)
                    )));
                }
            }
            objects.push(obj_path);
        }
    }
    Ok(objects)
}

fn cfg_dest_to_rom(dest: CfgDestination) -> Destination {
    match dest {
        CfgDestination::Main => rom::DEST_MAIN,
        CfgDestination::Overlay(id) => id as Destination,
    }
}

fn load_rom_image(
    header: &NdsHeader,
    config: &Config,
    is_arm9: bool,
    regions: &[RegionConfig],
) -> Result<RomImage, NcpError> {
    let (bin_info, ovt_info, hook_off) = if is_arm9 {
        (header.arm9, header.arm9_ovt, header.arm9_autoload_hook_off)
    } else {
        (header.arm7, header.arm7_ovt, header.arm7_autoload_hook_off)
    };

    let rel_name = if is_arm9 { "arm9.bin" } else { "arm7.bin" };
    let live_path = config.filesystem.join(rel_name);
    let bytes = rom::load_with_backup(&config.backup, rel_name, &live_path)?;
    let arm = ArmBin::load(bytes, bin_info.entry_address, bin_info.ram_address, hook_off, is_arm9)?;

    let ovt_rel = if is_arm9 { "arm9ovt.bin" } else { "arm7ovt.bin" };
    let ovt_bytes = if ovt_info.size > 0 {
        rom::load_with_backup(&config.backup, ovt_rel, &config.filesystem.join(ovt_rel))
            .unwrap_or_default()
    } else {
        Vec::new()
    };
    let ovt = overlay::load_overlay_table(&ovt_bytes).unwrap_or_default();

    let needed: HashSet<u32> = regions
        .iter()
        .filter_map(|r| match r.destination {
            CfgDestination::Overlay(id) => Some(id),
            CfgDestination::Main => None,
        })
        .collect();

    let mut overlays = Vec::new();
    for entry in ovt.iter().filter(|e| needed.contains(&e.overlay_id)) {
        let rel = format!("overlay{}.bin", entry.overlay_id);
        let bytes = rom::load_with_backup(&config.backup, &rel, &config.filesystem.join(&rel))?;
        let compressed = entry.flag & overlay::OVERLAY_FLAG_COMP != 0;
        overlays.push(OverlayBin::load(bytes, entry.ram_address, compressed, entry.overlay_id)?);
    }

    Ok(RomImage { arm, ovt, overlays })
}

/// Runs the full eleven-step pipeline for one target (ARM7 or ARM9).
pub fn run_target(
    _ctx: &AppContext,
    config: &Config,
    target: &TargetConfig,
    is_arm9: bool,
    header: &NdsHeader,
    cache: &mut RebuildCache,
) -> Result<(), NcpError> {
    let target_name = if is_arm9 { "arm9" } else { "arm7" };
    let _ctx_guard = push_context(format!("building {target_name}"));

    let target_mtime = rebuild_cache::file_mtime_secs(&target.target).unwrap_or(i64::MAX);
    let needs_rebuild = if is_arm9 {
        cache.arm9_needs_rebuild(target_mtime, 0, &config.defines)
    } else {
        cache.arm7_needs_rebuild(target_mtime, 0, &config.defines)
    };
    if !needs_rebuild {
        info!(target: "patch::build", "{target_name} up to date, skipping");
        return Ok(());
    }

    run_shell_commands(&config.pre_build)?;

    let mut rom_image = load_rom_image(header, config, is_arm9, &target.regions)?;

    let build_dir = target.workdir.clone().unwrap_or_else(|| target.build.clone());
    let mut registry = UnitRegistry::new();
    for region in &target.regions {
        let flags_for = |ext: &str| match ext {
            "c" => target.c_flags.clone(),
            "cpp" | "cc" | "cxx" => target.cpp_flags.clone(),
            _ => target.asm_flags.clone(),
        };
        let objects = compile_sources(&config.toolchain, &build_dir, &region.sources, &target.includes, flags_for)?;
        for obj in objects {
            let bytes = std::fs::read(&obj).map_err(|_| NcpError::FileUnreadable(obj.clone()))?;
            registry.add_user_object(obj, bytes);
        }
    }

    let extracted = directives::extract(&registry)?;

    let entry_points: HashSet<(usize, i32)> = extracted
        .patches
        .iter()
        .map(|p| (p.unit, p.section_idx))
        .filter(|&(_, idx)| idx >= 0)
        .chain(registry.user_units().map(|u| (u, -2)))
        .collect();
    let marked = depgraph::mark(&registry, &entry_points, false)?;
    let surviving = depgraph::exclude_unused_sections(extracted.overwrite_candidates.clone(), &marked);

    let mut regions: Vec<OverwriteRegion> = target
        .regions
        .iter()
        .filter(|r| !r.overwrites.is_empty())
        .flat_map(|r| {
            let dest = cfg_dest_to_rom(r.destination);
            r.overwrites.iter().enumerate().map(move |(i, &(start, end))| {
                OverwriteRegion::new(start, end, dest, format!("ov_{dest}_{i}"))
            })
        })
        .collect();
    let unplaced = allocator::allocate_for_destination(&mut regions, surviving);
    if !unplaced.is_empty() {
        info!(
            target: "patch::section",
            "{} sections could not be placed in any overwrite region and will be linked fresh",
            unplaced.len()
        );
    }

    let destinations: Vec<Destination> = {
        let mut d: Vec<Destination> = target
            .regions
            .iter()
            .map(|r| cfg_dest_to_rom(r.destination))
            .collect();
        d.sort_unstable();
        d.dedup();
        d
    };
    let external_symbols: Vec<String> = extracted.external_symbols.into_iter().collect();
    let autogen_sizes: Vec<(Destination, u32)> = destinations
        .iter()
        .map(|&d| (d, linker::HOOK_BRIDGE_SIZE * 8 + linker::ARM_THUMB_BRIDGE_SIZE * 8))
        .collect();

    let linker_inputs = LinkerInputs {
        registry: &registry,
        patches: &extracted.patches,
        rtrepl: &extracted.rtrepl,
        overwrite_regions: &regions,
        external_symbols: &external_symbols,
        destinations: &destinations,
        autogen_data_size: &autogen_sizes,
    };
    let script = linker::synthesize(&linker_inputs)?;
    let script_path = build_dir.join(format!("{target_name}_ncp.ld"));
    std::fs::write(&script_path, script).map_err(|_| NcpError::FileUnwritable(script_path.clone()))?;

    let linked_path = build_dir.join(format!("{target_name}_ncp.elf"));
    let object_paths: Vec<PathBuf> = registry.user_units().map(|u| PathBuf::from(&registry.get(u).object_path)).collect();
    linker::link(&config.toolchain, &script_path, &linked_path, &target.ld_flags, &object_paths)?;
    let linked_bytes = std::fs::read(&linked_path).map_err(|_| NcpError::FileUnreadable(linked_path.clone()))?;

    let finalized = finalize::finalize(
        &linked_bytes,
        &extracted.patches,
        &extracted.rtrepl,
        &destinations,
        &regions,
        &autogen_sizes,
    )?;

    rewrite::apply_patches(&mut rom_image, &finalized)?;

    for region in &regions {
        if region.used_size == 0 {
            continue;
        }
        let payload = finalized
            .region_payloads
            .get(&region.mem_name)
            .cloned()
            .unwrap_or_else(|| vec![0u8; region.used_size as usize]);
        rewrite::apply_overwrite_region(&mut rom_image, region.dest_tag, region.start, &payload)?;
    }

    for region_cfg in target.regions.iter().filter(|r| r.mode != Mode::Create || r.address.is_some()) {
        let dest = cfg_dest_to_rom(region_cfg.destination);
        let newcode = finalized.newcode.get(&dest);
        let payload = newcode.map(|n| n.text.as_slice()).unwrap_or(&[]);
        let bss_size = newcode.map(|n| n.bss_size).unwrap_or(0);
        if dest == rom::DEST_MAIN {
            if let Some(arena_lo) = target.arena_lo {
                rewrite::apply_newcode_main(&mut rom_image, arena_lo, payload, bss_size)?;
            }
        } else {
            let mode = match region_cfg.mode {
                Mode::Append => OverlayWriteMode::Append,
                Mode::Replace | Mode::Create => OverlayWriteMode::Replace,
            };
            rewrite::apply_newcode_overlay(&mut rom_image, dest as u32, mode, region_cfg.maxsize, payload)?;
        }
    }

    let arm_rel = if is_arm9 { "arm9.bin" } else { "arm7.bin" };
    rom::save_bytes(&config.filesystem.join(arm_rel), &rom_image.arm.bytes)?;
    for overlay in rom_image.overlays.iter().filter(|o| o.dirty) {
        let rel = format!("overlay{}.bin", overlay.id);
        rom::save_bytes(&config.filesystem.join(rel), &overlay.bytes)?;
    }
    if !rom_image.ovt.is_empty() {
        let ovt_rel = if is_arm9 { "arm9ovt.bin" } else { "arm7ovt.bin" };
        rom::save_bytes(&config.filesystem.join(ovt_rel), &overlay::save_overlay_table(&rom_image.ovt))?;
    }

    if is_arm9 {
        cache.arm9_target_write_time = rebuild_cache::now_secs();
        cache.arm9_patched_ovs = rom_image.overlays.iter().map(|o| o.id).collect();
    } else {
        cache.arm7_target_write_time = rebuild_cache::now_secs();
        cache.arm7_patched_ovs = rom_image.overlays.iter().map(|o| o.id).collect();
    }
    cache.defines = config.defines.clone();

    run_shell_commands(&config.post_build)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiler_for_maps_known_extensions() {
        assert_eq!(compiler_for("arm-none-eabi-", "c").as_deref(), Some("arm-none-eabi-gcc"));
        assert_eq!(compiler_for("arm-none-eabi-", "cpp").as_deref(), Some("arm-none-eabi-g++"));
        assert_eq!(compiler_for("arm-none-eabi-", "s").as_deref(), Some("arm-none-eabi-gcc"));
        assert_eq!(compiler_for("arm-none-eabi-", "txt"), None);
    }

    #[test]
    fn cfg_dest_to_rom_maps_main_and_overlay() {
        assert_eq!(cfg_dest_to_rom(CfgDestination::Main), rom::DEST_MAIN);
        assert_eq!(cfg_dest_to_rom(CfgDestination::Overlay(4)), 4);
    }
}
