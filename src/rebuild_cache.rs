// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rebuild cache: a small binary file recording what the previous build saw,
//! so unaffected targets can be skipped and unaffected overlays can be
//! reloaded from their pristine backups instead of from a freshly extracted
//! ROM. Binary layout ported from the original `rebuildconfig.cpp`.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::NcpError;

/// `3 * time_t(8) + 3 * u32(4)`: the three timestamps plus the three counts
/// that must be present before the variable-length tail can be interpreted.
const MIN_SIZE: usize = 29;
const TIME_T_SIZE: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct RebuildCache {
    pub build_config_write_time: i64,
    pub arm7_target_write_time: i64,
    pub arm9_target_write_time: i64,
    pub arm7_patched_ovs: Vec<u32>,
    pub arm9_patched_ovs: Vec<u32>,
    pub defines: Vec<String>,
}

impl RebuildCache {
    /// A cache standing in for "nothing has ever been built", forcing every
    /// target to rebuild.
    pub fn absent() -> Self {
        RebuildCache {
            build_config_write_time: i64::MAX,
            arm7_target_write_time: i64::MAX,
            arm9_target_write_time: i64::MAX,
            ..Default::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, NcpError> {
        if !path.exists() {
            return Ok(Self::absent());
        }
        let data = fs::read(path).map_err(|_| NcpError::FileUnreadable(path.to_path_buf()))?;
        if data.len() < MIN_SIZE {
            return Err(NcpError::RebuildCacheCorrupt(format!(
                "rebuild cache has {} bytes, need at least {MIN_SIZE}",
                data.len()
            )));
        }

        let mut pos = 0usize;
        let build_config_write_time = LittleEndian::read_i64(&data[pos..]);
        pos += TIME_T_SIZE;
        let arm7_target_write_time = LittleEndian::read_i64(&data[pos..]);
        pos += TIME_T_SIZE;
        let arm9_target_write_time = LittleEndian::read_i64(&data[pos..]);
        pos += TIME_T_SIZE;

        let arm7_count = LittleEndian::read_u32(&data[pos..]) as usize;
        pos += 4;
        let arm9_count = LittleEndian::read_u32(&data[pos..]) as usize;
        pos += 4;
        let defines_count = LittleEndian::read_u32(&data[pos..]) as usize;
        pos += 4;

        let required = 3 * TIME_T_SIZE + 12 + arm7_count * 4 + arm9_count * 4;
        if required > data.len() {
            return Err(NcpError::RebuildCacheCorrupt(
                "overlay count exceeds file size".into(),
            ));
        }

        let mut arm7_patched_ovs = Vec::with_capacity(arm7_count);
        for _ in 0..arm7_count {
            arm7_patched_ovs.push(LittleEndian::read_u32(&data[pos..]));
            pos += 4;
        }
        let mut arm9_patched_ovs = Vec::with_capacity(arm9_count);
        for _ in 0..arm9_count {
            arm9_patched_ovs.push(LittleEndian::read_u32(&data[pos..]));
            pos += 4;
        }

        let mut defines = Vec::with_capacity(defines_count);
        for _ in 0..defines_count {
            if pos + 4 > data.len() {
                return Err(NcpError::RebuildCacheCorrupt(
                    "truncated define length prefix".into(),
                ));
            }
            let len = LittleEndian::read_u32(&data[pos..]) as usize;
            pos += 4;
            if pos + len > data.len() {
                return Err(NcpError::RebuildCacheCorrupt(
                    "define string length exceeds file size".into(),
                ));
            }
            defines.push(String::from_utf8_lossy(&data[pos..pos + len]).into_owned());
            pos += len;
        }

        Ok(RebuildCache {
            build_config_write_time,
            arm7_target_write_time,
            arm9_target_write_time,
            arm7_patched_ovs,
            arm9_patched_ovs,
            defines,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), NcpError> {
        let defines_size: usize = self.defines.iter().map(|d| 4 + d.len()).sum();
        let size = 3 * TIME_T_SIZE
            + 12
            + self.arm7_patched_ovs.len() * 4
            + self.arm9_patched_ovs.len() * 4
            + defines_size;
        let mut buf = vec![0u8; size];
        let mut pos = 0usize;

        LittleEndian::write_i64(&mut buf[pos..], self.build_config_write_time);
        pos += TIME_T_SIZE;
        LittleEndian::write_i64(&mut buf[pos..], self.arm7_target_write_time);
        pos += TIME_T_SIZE;
        LittleEndian::write_i64(&mut buf[pos..], self.arm9_target_write_time);
        pos += TIME_T_SIZE;

        LittleEndian::write_u32(&mut buf[pos..], self.arm7_patched_ovs.len() as u32);
        pos += 4;
        LittleEndian::write_u32(&mut buf[pos..], self.arm9_patched_ovs.len() as u32);
        pos += 4;
        LittleEndian::write_u32(&mut buf[pos..], self.defines.len() as u32);
        pos += 4;

        for &id in &self.arm7_patched_ovs {
            LittleEndian::write_u32(&mut buf[pos..], id);
            pos += 4;
        }
        for &id in &self.arm9_patched_ovs {
            LittleEndian::write_u32(&mut buf[pos..], id);
            pos += 4;
        }
        for define in &self.defines {
            LittleEndian::write_u32(&mut buf[pos..], define.len() as u32);
            pos += 4;
            buf[pos..pos + define.len()].copy_from_slice(define.as_bytes());
            pos += define.len();
        }

        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        fs::write(path, buf).map_err(|_| NcpError::FileUnwritable(path.to_path_buf()))
    }

    /// A target needs rebuilding when its own mtime, the shared config's
    /// mtime, or its `--define` set has changed since the cache was written.
    pub fn arm9_needs_rebuild(&self, arm9_mtime: i64, config_mtime: i64, defines: &[String]) -> bool {
        arm9_mtime > self.arm9_target_write_time
            || config_mtime > self.build_config_write_time
            || defines != self.defines.as_slice()
    }

    pub fn arm7_needs_rebuild(&self, arm7_mtime: i64, config_mtime: i64, defines: &[String]) -> bool {
        arm7_mtime > self.arm7_target_write_time
            || config_mtime > self.build_config_write_time
            || defines != self.defines.as_slice()
    }

    /// An overlay can be reloaded from its backup (skipping a fresh extract)
    /// only if the previous build already touched it.
    pub fn overlay_is_cached(&self, arm9: bool, overlay_id: u32) -> bool {
        let list = if arm9 { &self.arm9_patched_ovs } else { &self.arm7_patched_ovs };
        list.contains(&overlay_id)
    }
}

pub fn file_mtime_secs(path: &Path) -> Result<i64, NcpError> {
    let meta = fs::metadata(path).map_err(|_| NcpError::FileUnreadable(path.to_path_buf()))?;
    let modified = meta
        .modified()
        .map_err(|_| NcpError::FileUnreadable(path.to_path_buf()))?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64)
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = std::env::temp_dir().join(format!("ncp-rebcache-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rebuild.bin");

        let cache = RebuildCache {
            build_config_write_time: 100,
            arm7_target_write_time: 200,
            arm9_target_write_time: 300,
            arm7_patched_ovs: vec![1, 2],
            arm9_patched_ovs: vec![3],
            defines: vec!["FOO".into(), "BAR=1".into()],
        };
        cache.save(&path).unwrap();
        let loaded = RebuildCache::load(&path).unwrap();
        assert_eq!(loaded.arm9_target_write_time, 300);
        assert_eq!(loaded.arm7_patched_ovs, vec![1, 2]);
        assert_eq!(loaded.defines, vec!["FOO".to_string(), "BAR=1".to_string()]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn absent_file_forces_rebuild() {
        let path = std::env::temp_dir().join("ncp-nonexistent-rebuild.bin");
        let cache = RebuildCache::load(&path).unwrap();
        assert!(cache.arm9_needs_rebuild(1, 1, &[]));
    }

    #[test]
    fn rejects_truncated_cache() {
        let dir = std::env::temp_dir().join(format!("ncp-rebcache-bad-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rebuild.bin");
        fs::write(&path, [0u8; 10]).unwrap();
        assert!(RebuildCache::load(&path).is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn overlay_is_cached_checks_correct_target() {
        let cache = RebuildCache {
            arm9_patched_ovs: vec![5],
            arm7_patched_ovs: vec![],
            ..Default::default()
        };
        assert!(cache.overlay_is_cached(true, 5));
        assert!(!cache.overlay_is_cached(false, 5));
    }
}
