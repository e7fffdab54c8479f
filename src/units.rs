// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The compilation-unit registry: a single owner of every loaded object's
//! bytes, holding the arena's indices rather than handing out back-pointers,
//! per the arena-over-reference-counting design note.

use std::path::PathBuf;

use crate::archive::Archive;
use crate::elf::Elf32;
use crate::error::NcpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    UserSource,
    LibraryMember,
}

/// Index into `UnitRegistry::units`. Stable for the lifetime of a target build.
pub type UnitId = usize;

pub struct CompilationUnit {
    pub kind: UnitKind,
    pub source_path: PathBuf,
    /// `archive.a:member.o` for library members, the object path otherwise.
    pub object_path: String,
    bytes: Vec<u8>,
}

impl CompilationUnit {
    pub fn elf(&self) -> Result<Elf32<'_>, NcpError> {
        Elf32::parse(&self.bytes)
    }
}

#[derive(Default)]
pub struct UnitRegistry {
    units: Vec<CompilationUnit>,
    user_units: Vec<UnitId>,
    library_units: Vec<UnitId>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user_object(&mut self, source_path: PathBuf, bytes: Vec<u8>) -> UnitId {
        let object_path = source_path.display().to_string();
        let id = self.units.len();
        self.units.push(CompilationUnit {
            kind: UnitKind::UserSource,
            source_path,
            object_path,
            bytes,
        });
        self.user_units.push(id);
        id
    }

    /// Loads every member of a static archive as a library unit.
    pub fn add_archive(&mut self, archive_path: PathBuf, data: Vec<u8>) -> Result<Vec<UnitId>, NcpError> {
        let archive_name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let archive = Archive::load(data)?;
        let mut ids = Vec::new();
        for member in archive.members()? {
            let id = self.units.len();
            self.units.push(CompilationUnit {
                kind: UnitKind::LibraryMember,
                source_path: archive_path.clone(),
                object_path: format!("{archive_name}:{}", member.name),
                bytes: member.data.to_vec(),
            });
            self.library_units.push(id);
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn get(&self, id: UnitId) -> &CompilationUnit {
        &self.units[id]
    }

    pub fn user_units(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.user_units.iter().copied()
    }

    pub fn library_units(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.library_units.iter().copied()
    }

    pub fn all_units(&self) -> impl Iterator<Item = UnitId> {
        0..self.units.len()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_elf_bytes() -> Vec<u8> {
        let mut buf = vec![0u8; 52];
        buf[0..4].copy_from_slice(b"\x7fELF");
        buf
    }

    #[test]
    fn user_and_library_partitions_stay_disjoint() {
        let mut reg = UnitRegistry::new();
        reg.add_user_object(PathBuf::from("main.o"), minimal_elf_bytes());
        assert_eq!(reg.user_units().count(), 1);
        assert_eq!(reg.library_units().count(), 0);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn object_path_uses_archive_colon_member_form() {
        let mut reg = UnitRegistry::new();
        let mut archive_buf = b"!<arch>\n".to_vec();
        let mut header = vec![b' '; 60];
        header[0..4].copy_from_slice(b"a.o/");
        let elf = minimal_elf_bytes();
        let size_str = format!("{:<10}", elf.len());
        header[48..58].copy_from_slice(size_str.as_bytes());
        header[58] = b'`';
        header[59] = b'\n';
        archive_buf.extend(header);
        archive_buf.extend(elf);

        let ids = reg
            .add_archive(PathBuf::from("lib.a"), archive_buf)
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(reg.get(ids[0]).object_path, "lib.a:a.o");
        assert_eq!(reg.get(ids[0]).kind, UnitKind::LibraryMember);
    }
}
