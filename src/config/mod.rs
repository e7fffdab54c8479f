// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed configuration surface. The document's grammar (comments, includes)
//! is an external reader's concern; this module owns the typed shape the
//! engine consumes plus the `${...}` variable-expansion pass layered on top,
//! mirroring the teacher's `read_and_flatten_toml` inheritance pass.

mod expand;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::NcpError;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    backup: String,
    filesystem: String,
    toolchain: String,
    arm7: Option<RawTarget>,
    arm9: Option<RawTarget>,
    #[serde(default)]
    pre_build: Vec<String>,
    #[serde(default)]
    post_build: Vec<String>,
    #[serde(default = "default_thread_count")]
    thread_count: u32,
    #[serde(default)]
    var: serde_json::Map<String, serde_json::Value>,
}

fn default_thread_count() -> u32 {
    1
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawTarget {
    target: String,
    build: String,
    workdir: Option<String>,
    #[serde(default)]
    arena_lo: Option<String>,
    #[serde(default)]
    symbols: Option<String>,
    #[serde(default)]
    includes: Vec<String>,
    #[serde(default)]
    c_flags: String,
    #[serde(default)]
    cpp_flags: String,
    #[serde(default)]
    asm_flags: String,
    #[serde(default)]
    ld_flags: String,
    #[serde(default)]
    regions: Vec<RawRegion>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawRegion {
    #[serde(default)]
    sources: Vec<String>,
    #[serde(rename = "dest")]
    destination: String,
    mode: Mode,
    #[serde(default)]
    compress: bool,
    address: Option<String>,
    #[serde(default)]
    maxsize: Option<String>,
    #[serde(default)]
    overwrites: Vec<(String, String)>,
    #[serde(default)]
    c_flags: Option<String>,
    #[serde(default)]
    cpp_flags: Option<String>,
    #[serde(default)]
    asm_flags: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Append,
    Replace,
    Create,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backup: PathBuf,
    pub filesystem: PathBuf,
    pub toolchain: String,
    pub arm7: Option<TargetConfig>,
    pub arm9: Option<TargetConfig>,
    pub pre_build: Vec<String>,
    pub post_build: Vec<String>,
    pub thread_count: u32,
    pub defines: Vec<String>,
    pub buildhash: u64,
}

#[derive(Clone, Debug)]
pub struct TargetConfig {
    pub target: PathBuf,
    pub build: PathBuf,
    pub workdir: Option<PathBuf>,
    pub arena_lo: Option<u32>,
    pub symbols: Option<PathBuf>,
    pub includes: Vec<PathBuf>,
    pub c_flags: String,
    pub cpp_flags: String,
    pub asm_flags: String,
    pub ld_flags: String,
    pub regions: Vec<RegionConfig>,
}

#[derive(Clone, Debug)]
pub struct RegionConfig {
    pub sources: Vec<PathBuf>,
    pub destination: Destination,
    pub mode: Mode,
    pub compress: bool,
    pub address: Option<u32>,
    pub maxsize: Option<u32>,
    pub overwrites: Vec<(u32, u32)>,
    pub c_flags: Option<String>,
    pub cpp_flags: Option<String>,
    pub asm_flags: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination {
    Main,
    Overlay(u32),
}

impl Config {
    pub fn from_file(path: &Path, defines: Vec<String>) -> Result<Self, NcpError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|_| NcpError::FileUnreadable(path.to_path_buf()))?;
        Self::from_str(&contents, defines)
    }

    pub fn from_str(contents: &str, defines: Vec<String>) -> Result<Self, NcpError> {
        let mut value: serde_json::Value = serde_json::from_str(contents)
            .map_err(|e| NcpError::InvalidConfiguration(format!("invalid JSON: {e}")))?;

        let mut hasher = DefaultHasher::new();
        contents.hash(&mut hasher);
        for d in &defines {
            d.hash(&mut hasher);
        }
        let buildhash = hasher.finish();

        let vars = value
            .get("var")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        expand::expand_value(&mut value, &vars)?;

        let raw: RawConfig = serde_json::from_value(value)
            .map_err(|e| NcpError::InvalidConfiguration(e.to_string()))?;

        if raw.arm7.is_none() && raw.arm9.is_none() {
            return Err(NcpError::InvalidConfiguration(
                "at least one of arm7/arm9 must be configured".into(),
            ));
        }

        Ok(Config {
            backup: PathBuf::from(raw.backup),
            filesystem: PathBuf::from(raw.filesystem),
            toolchain: raw.toolchain,
            arm7: raw.arm7.map(lower_target).transpose()?,
            arm9: raw.arm9.map(lower_target).transpose()?,
            pre_build: raw.pre_build,
            post_build: raw.post_build,
            thread_count: raw.thread_count.max(1),
            defines,
            buildhash,
        })
    }
}

fn lower_target(raw: RawTarget) -> Result<TargetConfig, NcpError> {
    let regions = raw
        .regions
        .into_iter()
        .map(lower_region)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(TargetConfig {
        target: PathBuf::from(raw.target),
        build: PathBuf::from(raw.build),
        workdir: raw.workdir.map(PathBuf::from),
        arena_lo: raw.arena_lo.map(|s| parse_int(&s)).transpose()?,
        symbols: raw.symbols.map(PathBuf::from),
        includes: raw.includes.into_iter().map(PathBuf::from).collect(),
        c_flags: raw.c_flags,
        cpp_flags: raw.cpp_flags,
        asm_flags: raw.asm_flags,
        ld_flags: raw.ld_flags,
        regions,
    })
}

fn lower_region(raw: RawRegion) -> Result<RegionConfig, NcpError> {
    let destination = if raw.destination == "main" {
        Destination::Main
    } else if let Some(num) = raw.destination.strip_prefix("ov") {
        let id: u32 = num.parse().map_err(|_| {
            NcpError::InvalidConfiguration(format!("bad destination '{}'", raw.destination))
        })?;
        Destination::Overlay(id)
    } else {
        return Err(NcpError::InvalidConfiguration(format!(
            "destination must be 'main' or 'ovNN', got '{}'",
            raw.destination
        )));
    };
    let overwrites = raw
        .overwrites
        .into_iter()
        .map(|(s, e)| Ok((parse_int(&s)?, parse_int(&e)?)))
        .collect::<Result<Vec<_>, NcpError>>()?;
    Ok(RegionConfig {
        sources: raw.sources.into_iter().map(PathBuf::from).collect(),
        destination,
        mode: raw.mode,
        compress: raw.compress,
        address: raw.address.map(|s| parse_int(&s)).transpose()?,
        maxsize: raw.maxsize.map(|s| parse_int(&s)).transpose()?,
        overwrites,
        c_flags: raw.c_flags,
        cpp_flags: raw.cpp_flags,
        asm_flags: raw.asm_flags,
    })
}

/// Shared by directive addresses and configuration address-shaped fields:
/// hex with a `0x` prefix, or decimal.
pub fn parse_int(s: &str) -> Result<u32, NcpError> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
            .map_err(|_| NcpError::InvalidConfiguration(format!("bad hex value '{s}'")))
    } else {
        s.parse::<u32>()
            .map_err(|_| NcpError::InvalidConfiguration(format!("bad integer value '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "backup": "${root}/backup",
            "filesystem": "${root}/rom",
            "toolchain": "arm-none-eabi-",
            "var": { "root": "build" },
            "arm9": {
                "target": "arm9.bin",
                "build": "build/arm9",
                "regions": [
                    { "dest": "main", "mode": "append" }
                ]
            }
        }"#
    }

    #[test]
    fn expands_variables_and_parses() {
        let cfg = Config::from_str(sample_json(), vec![]).unwrap();
        assert_eq!(cfg.backup, PathBuf::from("build/backup"));
        assert_eq!(cfg.filesystem, PathBuf::from("build/rom"));
        assert!(cfg.arm9.is_some());
        assert!(cfg.arm7.is_none());
    }

    #[test]
    fn rejects_missing_targets() {
        let json = r#"{"backup":"b","filesystem":"f","toolchain":"t"}"#;
        assert!(Config::from_str(json, vec![]).is_err());
    }

    #[test]
    fn parse_int_accepts_hex_and_decimal() {
        assert_eq!(parse_int("0x1000").unwrap(), 0x1000);
        assert_eq!(parse_int("4096").unwrap(), 4096);
        assert!(parse_int("nope").is_err());
    }
}
