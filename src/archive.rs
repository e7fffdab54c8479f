// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Unix `ar` archive reader.
//!
//! Two passes: the first locates the `//` string-table member, the second
//! builds member records, resolving long names via that table. The archive
//! owns the whole buffer; members are zero-copy slices into it.

use crate::error::NcpError;

const AR_MAGIC: &[u8; 8] = b"!<arch>\n";
const HEADER_SIZE: usize = 60;

pub struct ArchiveMember<'a> {
    pub name: String,
    pub data: &'a [u8],
}

pub struct Archive {
    buf: Vec<u8>,
}

impl Archive {
    pub fn load(data: Vec<u8>) -> Result<Self, NcpError> {
        if data.len() < AR_MAGIC.len() || &data[..AR_MAGIC.len()] != AR_MAGIC {
            return Err(NcpError::CorruptRomFile("not a unix ar archive".into()));
        }
        Ok(Self { buf: data })
    }

    /// Returns members in archive order, skipping the `/` symbol table and
    /// `//` string table special members.
    pub fn members(&self) -> Result<Vec<ArchiveMember<'_>>, NcpError> {
        let strtab = self.find_string_table()?;
        let mut members = Vec::new();
        let mut pos = AR_MAGIC.len();
        while pos + HEADER_SIZE <= self.buf.len() {
            let header = &self.buf[pos..pos + HEADER_SIZE];
            if &header[58..60] != b"`\n" {
                return Err(NcpError::CorruptRomFile(
                    "malformed ar member header".into(),
                ));
            }
            let raw_name = &header[0..16];
            let size = parse_decimal_field(&header[48..58])?;
            let data_start = pos + HEADER_SIZE;
            let data_end = data_start + size;
            if data_end > self.buf.len() {
                return Err(NcpError::CorruptRomFile(
                    "ar member extends past end of archive".into(),
                ));
            }

            let name = parse_name(raw_name, strtab.as_deref())?;
            if name != "/" && name != "//" {
                members.push(ArchiveMember {
                    name,
                    data: &self.buf[data_start..data_end],
                });
            }

            pos = data_end + (size & 1);
        }
        Ok(members)
    }

    fn find_string_table(&self) -> Result<Option<Vec<u8>>, NcpError> {
        let mut pos = AR_MAGIC.len();
        while pos + HEADER_SIZE <= self.buf.len() {
            let header = &self.buf[pos..pos + HEADER_SIZE];
            let raw_name = &header[0..16];
            let size = parse_decimal_field(&header[48..58])?;
            let data_start = pos + HEADER_SIZE;
            let data_end = data_start + size;
            if data_end > self.buf.len() {
                return Err(NcpError::CorruptRomFile(
                    "ar member extends past end of archive".into(),
                ));
            }
            if &raw_name[0..2] == b"//" {
                return Ok(Some(self.buf[data_start..data_end].to_vec()));
            }
            pos = data_end + (size & 1);
        }
        Ok(None)
    }
}

fn parse_decimal_field(field: &[u8]) -> Result<usize, NcpError> {
    let s = std::str::from_utf8(field)
        .map_err(|_| NcpError::CorruptRomFile("non-ascii ar field".into()))?
        .trim_end();
    s.trim()
        .parse::<usize>()
        .map_err(|_| NcpError::CorruptRomFile(format!("bad ar decimal field '{s}'")))
}

fn parse_name(raw: &[u8], strtab: Option<&[u8]>) -> Result<String, NcpError> {
    if raw[0] == b'/' && raw[1].is_ascii_digit() {
        let digits: String = raw[1..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .map(|&b| b as char)
            .collect();
        let offset: usize = digits
            .parse()
            .map_err(|_| NcpError::CorruptRomFile("bad ar long-name offset".into()))?;
        let table = strtab.ok_or_else(|| {
            NcpError::CorruptRomFile("ar long name with no string table".into())
        })?;
        if offset >= table.len() {
            return Err(NcpError::CorruptRomFile(
                "ar long-name offset out of range".into(),
            ));
        }
        let end = table[offset..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| offset + p)
            .unwrap_or(table.len());
        let name = String::from_utf8_lossy(&table[offset..end]);
        Ok(name.trim_end_matches('/').to_string())
    } else if &raw[0..2] == b"/ " {
        Ok("/".to_string())
    } else if &raw[0..2] == b"//" {
        Ok("//".to_string())
    } else {
        let end = raw
            .iter()
            .position(|&b| b == b'/' || b == b' ' || b == 0)
            .unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[0..end]).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header(name16: &[u8; 16], size: usize) -> Vec<u8> {
        let mut h = vec![b' '; HEADER_SIZE];
        h[0..16].copy_from_slice(name16);
        h[16..28].copy_from_slice(b"0           ");
        h[28..34].copy_from_slice(b"0     ");
        h[34..40].copy_from_slice(b"0     ");
        h[40..48].copy_from_slice(b"644     ");
        let size_str = format!("{size:<10}");
        h[48..58].copy_from_slice(size_str.as_bytes());
        h[58] = b'`';
        h[59] = b'\n';
        h
    }

    fn pad16(name: &str) -> [u8; 16] {
        let mut out = [b' '; 16];
        out[..name.len()].copy_from_slice(name.as_bytes());
        out
    }

    #[test]
    fn parses_short_name_member() {
        let mut buf = AR_MAGIC.to_vec();
        buf.extend(make_header(&pad16("a.o/"), 4));
        buf.extend(b"DATA");
        let archive = Archive::load(buf).unwrap();
        let members = archive.members().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "a.o");
        assert_eq!(members[0].data, b"DATA");
    }

    #[test]
    fn resolves_long_name_via_string_table() {
        let mut buf = AR_MAGIC.to_vec();
        let strtab_content = b"a_very_long_member_name.o/\n";
        buf.extend(make_header(&pad16("//"), strtab_content.len()));
        buf.extend(strtab_content);
        buf.extend(make_header(&pad16("/0"), 4));
        buf.extend(b"BODY");
        let archive = Archive::load(buf).unwrap();
        let members = archive.members().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "a_very_long_member_name.o");
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(Archive::load(vec![0u8; 16]).is_err());
    }
}
