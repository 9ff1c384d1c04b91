//! Payload compression engines.
//!
//! Each connection owns one [`Compressor`]. Output goes into one of two
//! alternating scratch arenas, so the result of frame N stays valid while
//! frame N+1 is produced, without allocating per frame.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;
use twox_hash::XxHash32;

/// Largest uncompressed payload a single frame can carry.
const MAX_CONTENT: usize = 65536;

/// LZ4 frame magic number, little-endian on the wire.
pub const LZ4_FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4d, 0x18];

/// FLG: version 01, independent blocks, content checksum.
const LZ4_FLG: u8 = 0x64;
/// BD: 64 KiB maximum block size.
const LZ4_BD: u8 = 0x40;

const FLG_VERSION_MASK: u8 = 0xc0;
const FLG_VERSION: u8 = 0x40;
const FLG_BLOCK_INDEPENDENT: u8 = 0x20;
const FLG_BLOCK_CHECKSUM: u8 = 0x10;
const FLG_CONTENT_SIZE: u8 = 0x08;
const FLG_CONTENT_CHECKSUM: u8 = 0x04;
const FLG_DICT_ID: u8 = 0x01;

const BLOCK_UNCOMPRESSED: u32 = 0x8000_0000;

/// Bytes added by the LZ4 frame envelope around a single block.
pub const LZ4_FRAME_OVERHEAD: usize = 4 + 3 + 4 + 4 + 4;

/// Compression applied to a frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum CompressMode {
    #[default]
    Raw = 0,
    Lz4Frame = 1,
    Lz4Block = 2,
}

impl CompressMode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CompressMode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressMode::Raw),
            1 => Ok(CompressMode::Lz4Frame),
            2 => Ok(CompressMode::Lz4Block),
            other => Err(ProtocolError::UnknownCompression(other)),
        }
    }
}

impl fmt::Display for CompressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressMode::Raw => write!(f, "raw"),
            CompressMode::Lz4Frame => write!(f, "lz4-frame"),
            CompressMode::Lz4Block => write!(f, "lz4-block"),
        }
    }
}

impl FromStr for CompressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "none" | "0" => Ok(CompressMode::Raw),
            "lz4-frame" | "frame" | "1" => Ok(CompressMode::Lz4Frame),
            "lz4-block" | "block" | "lz4" | "2" => Ok(CompressMode::Lz4Block),
            other => Err(format!("unknown compression mode: {other}")),
        }
    }
}

fn xxh32(data: &[u8]) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(data);
    hasher.finish() as u32
}

fn header_checksum(descriptor: &[u8]) -> u8 {
    ((xxh32(descriptor) >> 8) & 0xff) as u8
}

fn read_u32_le(src: &[u8], pos: usize) -> Result<u32, ProtocolError> {
    src.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| ProtocolError::Decompress("truncated lz4 frame".into()))
}

/// Per-connection compression state with double-buffered scratch arenas.
#[derive(Debug, Default)]
pub struct Compressor {
    pack_buf: [Vec<u8>; 2],
    unpack_buf: [Vec<u8>; 2],
    packed: usize,
    unpacked: usize,
}

impl Compressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compresses `src` with `mode`.
    ///
    /// Returns `None` when the mode is raw, when compression fails, or when
    /// the output would not be strictly smaller than the input. The caller
    /// then sends the payload raw.
    pub fn compress(&mut self, mode: CompressMode, src: &[u8]) -> Option<&[u8]> {
        if mode == CompressMode::Raw || src.is_empty() {
            return None;
        }
        let slot = self.packed & 1;
        self.packed = self.packed.wrapping_add(1);
        let out = &mut self.pack_buf[slot];
        let n = match mode {
            CompressMode::Raw => return None,
            CompressMode::Lz4Block => lz4_block_into(src, out)?,
            CompressMode::Lz4Frame => lz4_frame_into(src, out)?,
        };
        if n >= src.len() {
            return None;
        }
        Some(&out[..n])
    }

    /// Decompresses a payload received with `mode`.
    pub fn decompress<'a>(
        &'a mut self,
        mode: CompressMode,
        src: &'a [u8],
    ) -> Result<&'a [u8], ProtocolError> {
        if mode == CompressMode::Raw {
            return Ok(src);
        }
        let slot = self.unpacked & 1;
        self.unpacked = self.unpacked.wrapping_add(1);
        let out = &mut self.unpack_buf[slot];
        let n = match mode {
            CompressMode::Raw => return Ok(src),
            CompressMode::Lz4Block => lz4_block_from(src, out)?,
            CompressMode::Lz4Frame => lz4_frame_from(src, out)?,
        };
        Ok(&out[..n])
    }
}

fn lz4_block_into(src: &[u8], out: &mut Vec<u8>) -> Option<usize> {
    out.resize(lz4_flex::block::get_maximum_output_size(src.len()), 0);
    lz4_flex::block::compress_into(src, out).ok()
}

fn lz4_block_from(src: &[u8], out: &mut Vec<u8>) -> Result<usize, ProtocolError> {
    out.resize(MAX_CONTENT, 0);
    lz4_flex::block::decompress_into(src, out).map_err(|e| ProtocolError::Decompress(e.to_string()))
}

fn lz4_frame_into(src: &[u8], out: &mut Vec<u8>) -> Option<usize> {
    let bound = lz4_flex::block::get_maximum_output_size(src.len());
    out.resize(LZ4_FRAME_OVERHEAD + bound.max(src.len()), 0);

    out[..4].copy_from_slice(&LZ4_FRAME_MAGIC);
    out[4] = LZ4_FLG;
    out[5] = LZ4_BD;
    out[6] = header_checksum(&[LZ4_FLG, LZ4_BD]);

    let body = 11;
    let packed = lz4_flex::block::compress_into(src, &mut out[body..body + bound]).ok()?;
    let (block_len, block_size) = if packed < src.len() {
        (packed, packed as u32)
    } else {
        out[body..body + src.len()].copy_from_slice(src);
        (src.len(), src.len() as u32 | BLOCK_UNCOMPRESSED)
    };
    out[7..11].copy_from_slice(&block_size.to_le_bytes());

    let mut pos = body + block_len;
    out[pos..pos + 4].copy_from_slice(&0u32.to_le_bytes());
    pos += 4;
    out[pos..pos + 4].copy_from_slice(&xxh32(src).to_le_bytes());
    Some(pos + 4)
}

fn lz4_frame_from(src: &[u8], out: &mut Vec<u8>) -> Result<usize, ProtocolError> {
    if src.len() < 7 {
        return Err(ProtocolError::Decompress("truncated lz4 frame header".into()));
    }
    if src[..4] != LZ4_FRAME_MAGIC {
        return Err(ProtocolError::InvalidMagic {
            expected: u32::from_le_bytes(LZ4_FRAME_MAGIC),
            actual: u32::from_le_bytes([src[0], src[1], src[2], src[3]]),
        });
    }
    let flg = src[4];
    if flg & FLG_VERSION_MASK != FLG_VERSION {
        return Err(ProtocolError::Decompress(format!("unsupported lz4 frame version in {flg:#04x}")));
    }
    if flg & FLG_BLOCK_INDEPENDENT == 0 {
        return Err(ProtocolError::Decompress("linked lz4 blocks are not supported".into()));
    }

    let mut pos = 6;
    if flg & FLG_CONTENT_SIZE != 0 {
        pos += 8;
    }
    if flg & FLG_DICT_ID != 0 {
        pos += 4;
    }
    let hc = *src
        .get(pos)
        .ok_or_else(|| ProtocolError::Decompress("truncated lz4 frame header".into()))?;
    let expected = header_checksum(&src[4..pos]);
    if hc != expected {
        return Err(ProtocolError::ChecksumMismatch {
            expected: expected as u32,
            actual: hc as u32,
        });
    }
    pos += 1;

    out.clear();
    loop {
        let size = read_u32_le(src, pos)?;
        pos += 4;
        if size == 0 {
            break;
        }
        let len = (size & !BLOCK_UNCOMPRESSED) as usize;
        let block = src
            .get(pos..pos + len)
            .ok_or_else(|| ProtocolError::Decompress("truncated lz4 block".into()))?;
        if size & BLOCK_UNCOMPRESSED != 0 {
            out.extend_from_slice(block);
        } else {
            let start = out.len();
            out.resize(start + MAX_CONTENT, 0);
            let n = lz4_flex::block::decompress_into(block, &mut out[start..])
                .map_err(|e| ProtocolError::Decompress(e.to_string()))?;
            out.truncate(start + n);
        }
        pos += len;
        if flg & FLG_BLOCK_CHECKSUM != 0 {
            pos += 4;
        }
    }

    if flg & FLG_CONTENT_CHECKSUM != 0 {
        let expected = read_u32_le(src, pos)?;
        let actual = xxh32(out);
        if expected != actual {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }
    }
    Ok(out.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 17) as u8).collect()
    }

    #[test]
    fn test_mode_codes() {
        assert_eq!(CompressMode::try_from(2).unwrap(), CompressMode::Lz4Block);
        assert!(matches!(
            CompressMode::try_from(3),
            Err(ProtocolError::UnknownCompression(3))
        ));
        assert_eq!("lz4-frame".parse::<CompressMode>().unwrap(), CompressMode::Lz4Frame);
        assert!("zstd".parse::<CompressMode>().is_err());
    }

    #[test]
    fn test_block_round_trip() {
        let data = sample(4000);
        let mut c = Compressor::new();
        let packed = c.compress(CompressMode::Lz4Block, &data).unwrap().to_vec();
        assert!(packed.len() < data.len());
        let mut d = Compressor::new();
        assert_eq!(d.decompress(CompressMode::Lz4Block, &packed).unwrap(), &data[..]);
    }

    #[test]
    fn test_frame_layout() {
        let data = sample(2000);
        let mut c = Compressor::new();
        let packed = c.compress(CompressMode::Lz4Frame, &data).unwrap().to_vec();
        assert_eq!(&packed[..4], &LZ4_FRAME_MAGIC);
        assert_eq!(packed[4], LZ4_FLG);
        assert_eq!(packed[5], LZ4_BD);
        assert_eq!(packed[6], header_checksum(&[LZ4_FLG, LZ4_BD]));
        let n = packed.len();
        assert_eq!(&packed[n - 8..n - 4], &[0, 0, 0, 0]);
        assert_eq!(&packed[n - 4..], &xxh32(&data).to_le_bytes());

        let mut d = Compressor::new();
        assert_eq!(d.decompress(CompressMode::Lz4Frame, &packed).unwrap(), &data[..]);
    }

    #[test]
    fn test_frame_checksum_mismatch() {
        let data = sample(2000);
        let mut c = Compressor::new();
        let mut packed = c.compress(CompressMode::Lz4Frame, &data).unwrap().to_vec();
        let n = packed.len();
        packed[n - 1] ^= 0xff;
        let mut d = Compressor::new();
        assert!(matches!(
            d.decompress(CompressMode::Lz4Frame, &packed),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_frame_bad_magic() {
        let mut d = Compressor::new();
        let err = d
            .decompress(CompressMode::Lz4Frame, &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMagic { .. }));
    }

    #[test]
    fn test_incompressible_falls_back() {
        let data: Vec<u8> = (0..64u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let mut c = Compressor::new();
        assert!(c.compress(CompressMode::Lz4Frame, &data).is_none());
        assert!(c.compress(CompressMode::Raw, &data).is_none());
        assert!(c.compress(CompressMode::Lz4Block, &[]).is_none());
    }

    #[test]
    fn test_alternating_arenas() {
        let a = sample(3000);
        let b: Vec<u8> = sample(3000).into_iter().map(|x| x.wrapping_add(1)).collect();
        let mut c = Compressor::new();
        let first = c.compress(CompressMode::Lz4Block, &a).unwrap().as_ptr();
        let second = c.compress(CompressMode::Lz4Block, &b).unwrap().as_ptr();
        assert_ne!(first, second);
    }

    proptest! {
        #[test]
        fn prop_decompress_inverts_compress(
            data in proptest::collection::vec(0u8..4, 1..20000),
            mode in prop_oneof![Just(CompressMode::Lz4Block), Just(CompressMode::Lz4Frame)],
        ) {
            let mut c = Compressor::new();
            let packed = c.compress(mode, &data).map(|p| p.to_vec());
            if let Some(packed) = packed {
                prop_assert!(packed.len() < data.len());
                let mut d = Compressor::new();
                prop_assert_eq!(d.decompress(mode, &packed).unwrap(), &data[..]);
            }
        }
    }
}
