// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BLZ decompression. The compressor half is out of scope; only the
//! decompressor the engine needs to unpack existing binaries is implemented.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::NcpError;

/// Uncompresses a BLZ-compressed buffer whose trailer (last 4 bytes) holds
/// the additional size the decompressed form grows by, returning a new,
/// grown buffer. Mirrors the backward-scanning LZ variant used by the
/// console's loader.
pub fn uncompress(data: &[u8]) -> Result<Vec<u8>, NcpError> {
    if data.len() < 4 {
        return Err(NcpError::CorruptRomFile(
            "blz buffer too small for trailer".into(),
        ));
    }
    let data_size = data.len();
    let grow = LittleEndian::read_u32(&data[data_size - 4..]) as usize;
    let dest_size = data_size + grow;
    let mut dest = vec![0u8; dest_size];
    dest[..data_size].copy_from_slice(data);
    uncompress_backward(&mut dest, data_size)?;
    Ok(dest)
}

/// In-place variant used when the compressed buffer already sits at the
/// front of a larger, pre-grown allocation.
pub fn uncompress_inplace(data: &mut Vec<u8>) -> Result<(), NcpError> {
    let data_size = data.len();
    if data_size < 4 {
        return Err(NcpError::CorruptRomFile(
            "blz buffer too small for trailer".into(),
        ));
    }
    let grow = LittleEndian::read_u32(&data[data_size - 4..]) as usize;
    data.resize(data_size + grow, 0);
    uncompress_backward(data, data_size)
}

/// `bottom` is the offset one past the original compressed payload (i.e.
/// where the still-to-be-decompressed region's pristine tail starts).
fn uncompress_backward(buf: &mut [u8], bottom: usize) -> Result<(), NcpError> {
    if bottom < 8 {
        return Err(NcpError::CorruptRomFile("blz trailer truncated".into()));
    }
    let offset_out = LittleEndian::read_u32(&buf[bottom - 4..]) as usize;
    let offset_in = LittleEndian::read_u32(&buf[bottom - 8..]);
    let offset_in_btm = (offset_in >> 24) as usize;
    let offset_in_top = (offset_in & 0x00FF_FFFF) as usize;

    let mut p_out = bottom + offset_out;
    let mut p_in_btm = bottom
        .checked_sub(offset_in_btm)
        .ok_or_else(|| NcpError::CorruptRomFile("blz offset_in_btm underflow".into()))?;
    let p_in_top = bottom
        .checked_sub(offset_in_top)
        .ok_or_else(|| NcpError::CorruptRomFile("blz offset_in_top underflow".into()))?;

    while p_in_top < p_in_btm {
        p_in_btm -= 1;
        let mut flag = buf[p_in_btm];

        for _ in 0..8 {
            if p_in_btm < p_in_top {
                return Err(NcpError::CorruptRomFile("blz source shortage".into()));
            }
            if p_out < p_in_top {
                return Err(NcpError::CorruptRomFile("blz destination overrun".into()));
            }

            if flag & 0x80 == 0 {
                p_in_btm -= 1;
                p_out -= 1;
                buf[p_out] = buf[p_in_btm];
            } else {
                if p_in_btm < p_in_top + 2 {
                    return Err(NcpError::CorruptRomFile("blz destination overrun".into()));
                }
                p_in_btm -= 1;
                let hi = buf[p_in_btm] as u32;
                p_in_btm -= 1;
                let lo = buf[p_in_btm] as u32;
                let offset = (((hi & 0xF) << 8) | lo) as usize + 3;
                let length = (hi >> 4) as usize + 3;

                if p_out < p_in_top + length {
                    return Err(NcpError::CorruptRomFile("blz destination overrun".into()));
                }
                let mut p_tmp = p_out + offset;
                for _ in 0..length {
                    p_tmp -= 1;
                    p_out -= 1;
                    buf[p_out] = buf[p_tmp];
                }
            }

            if p_in_btm <= p_in_top {
                break;
            }
            flag <<= 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An all-literal BLZ stream: flag byte 0x00 means every one of the next
    /// 8 bytes is copied verbatim (scanned backward), with no back-references.
    #[test]
    fn uncompress_all_literal_stream() {
        let payload = b"ABCDEFGH";
        let mut compressed = payload.to_vec();
        compressed.push(0x00); // flag: all literal
        // offset_in: btm=0 (trailer sits right after payload), top=compressed.len()
        let total_extra = 1 /*flag*/ + 4 /*offset_in*/ + 4 /*offset_out*/;
        let offset_in_btm = total_extra as u32;
        let offset_in_top = total_extra as u32;
        let offset_in = (offset_in_btm << 24) | offset_in_top;
        let mut buf4 = [0u8; 4];
        LittleEndian::write_u32(&mut buf4, offset_in);
        compressed.extend_from_slice(&buf4);
        let offset_out = 0u32; // dest grows by exactly payload.len() at same relative spot
        LittleEndian::write_u32(&mut buf4, offset_out);
        compressed.extend_from_slice(&buf4);
        let grow = payload.len() as u32;
        LittleEndian::write_u32(&mut buf4, grow);
        compressed.extend_from_slice(&buf4);

        let result = uncompress(&compressed).unwrap();
        assert_eq!(&result[result.len() - payload.len()..], payload);
    }

    #[test]
    fn rejects_truncated_buffer() {
        assert!(uncompress(&[0, 1, 2]).is_err());
    }
}
