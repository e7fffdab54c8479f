// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod arm;
pub mod blz;
pub mod header;
pub mod overlay;

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::NcpError;
use arm::ArmBin;
use overlay::{OverlayBin, OvtEntry};

/// A small integer naming a code container: `-1` is the main ARM binary,
/// `0..N-1` are overlays.
pub type Destination = i32;
pub const DEST_MAIN: Destination = -1;

/// Virtual address in the console's memory map. Bit 0 denotes THUMB when
/// carried alongside a `*_thumb` flag; the canonical stored value always has
/// bit 0 cleared.
pub type RomAddress = u32;

/// Reads a file, preferring a pristine copy from the backup directory if one
/// already exists there; on first touch, copies the just-loaded bytes into
/// the backup directory unmodified so future builds start from the original.
pub fn load_with_backup(
    backup_dir: &Path,
    rel_name: &str,
    live_path: &Path,
) -> Result<Vec<u8>, NcpError> {
    let backup_path = backup_dir.join(rel_name);
    if backup_path.exists() {
        debug!(target: "patch::build", "loading {rel_name} from backup");
        return fs::read(&backup_path)
            .map_err(|_| NcpError::FileUnreadable(backup_path.clone()));
    }

    if !live_path.exists() {
        return Err(NcpError::FileNotFound(live_path.to_path_buf()));
    }
    let bytes = fs::read(live_path).map_err(|_| NcpError::FileUnreadable(live_path.to_path_buf()))?;

    if let Some(parent) = backup_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|_| NcpError::FileUnwritable(backup_path.clone()))?;
    }
    fs::write(&backup_path, &bytes).map_err(|_| NcpError::FileUnwritable(backup_path.clone()))?;
    Ok(bytes)
}

pub fn backup_path(backup_dir: &Path, rel_name: &str) -> PathBuf {
    backup_dir.join(rel_name)
}

pub fn save_bytes(path: &Path, bytes: &[u8]) -> Result<(), NcpError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    fs::write(path, bytes).map_err(|_| NcpError::FileUnwritable(path.to_path_buf()))
}

/// Owns the loaded ARM binary, overlay table, and any overlay binaries
/// touched during a single target's build.
pub struct RomImage {
    pub arm: ArmBin,
    pub ovt: Vec<OvtEntry>,
    pub overlays: Vec<OverlayBin>,
}

impl RomImage {
    pub fn overlay_mut(&mut self, id: u32) -> Option<&mut OverlayBin> {
        self.overlays.iter_mut().find(|o| o.id == id)
    }

    pub fn ovt_entry_mut(&mut self, id: u32) -> Option<&mut OvtEntry> {
        self.ovt.iter_mut().find(|e| e.overlay_id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn first_load_populates_backup() {
        let dir = std::env::temp_dir().join(format!("ncp-test-{}", std::process::id()));
        let _ = fs::create_dir_all(&dir);
        let live = dir.join("live.bin");
        let mut f = fs::File::create(&live).unwrap();
        f.write_all(b"hello").unwrap();

        let backup_dir = dir.join("backup");
        let bytes = load_with_backup(&backup_dir, "arm9.bin", &live).unwrap();
        assert_eq!(bytes, b"hello");
        assert!(backup_dir.join("arm9.bin").exists());

        // mutate the live file; second load should still read pristine backup
        fs::write(&live, b"mutated").unwrap();
        let bytes2 = load_with_backup(&backup_dir, "arm9.bin", &live).unwrap();
        assert_eq!(bytes2, b"hello");

        let _ = fs::remove_dir_all(&dir);
    }
}
