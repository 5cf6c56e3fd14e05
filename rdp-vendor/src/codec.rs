//! Bitmap codec plug-ins selected by CacheBitmap v3's `codecId` field.
//!
//! `rdp-core::bitmap_cache` never decodes pixels itself; it hands the wire
//! payload to whichever `BitmapCodec` the order names and stores the
//! result. `NONE` bypasses this module entirely (spec §4.4).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    None,
    InterleavedRle,
    Plugin(u8),
}

impl CodecId {
    pub fn from_wire(id: u8) -> Self {
        match id {
            0 => CodecId::None,
            1 => CodecId::InterleavedRle,
            other => CodecId::Plugin(other),
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    TruncatedInput,
    InvalidDimensions { width: u16, height: u16 },
    UnsupportedCodec(CodecId),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::TruncatedInput => write!(f, "codec input truncated"),
            CodecError::InvalidDimensions { width, height } => {
                write!(f, "invalid bitmap dimensions {width}x{height}")
            }
            CodecError::UnsupportedCodec(id) => write!(f, "unsupported codec: {id:?}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// A decoder from wire bytes to a flat `bpp`-bits-per-pixel buffer.
/// Implementors own no state beyond what's needed per call, matching the
/// stateless per-order decode the dispatcher performs (spec §4.4/§4.5).
pub trait BitmapCodec: Send + Sync {
    fn id(&self) -> CodecId;

    fn decode(
        &self,
        input: &[u8],
        width: u16,
        height: u16,
        bpp: u8,
    ) -> Result<Vec<u8>, CodecError>;
}

fn bytes_per_pixel(bpp: u8) -> usize {
    match bpp {
        0 => 0,
        1..=8 => 1,
        9..=16 => 2,
        17..=24 => 3,
        _ => 4,
    }
}

/// `codecId == NONE` / v1's uncompressed path: the payload is already a
/// flat pixel buffer, copied verbatim after a size check.
#[derive(Debug, Default)]
pub struct RawCodec;

impl BitmapCodec for RawCodec {
    fn id(&self) -> CodecId {
        CodecId::None
    }

    fn decode(
        &self,
        input: &[u8],
        width: u16,
        height: u16,
        bpp: u8,
    ) -> Result<Vec<u8>, CodecError> {
        if width == 0 || height == 0 {
            return Err(CodecError::InvalidDimensions { width, height });
        }
        let expected = width as usize * height as usize * bytes_per_pixel(bpp);
        if input.len() < expected {
            return Err(CodecError::TruncatedInput);
        }
        Ok(input[..expected].to_vec())
    }
}

/// Interleaved RLE ("RDP 4.0 bitmap compression"), the default for v1/v2
/// orders whose `compressed` flag is set. Implements the row-interleaved
/// run-length scheme: each scanline is encoded bottom-up, and runs can
/// either repeat a single pixel (`FILL`) or copy literal bytes (`COLOR`/
/// `MIX`), tagged by a one-byte order header's low bits.
#[derive(Debug, Default)]
pub struct InterleavedRle8Codec;

const RLE_FILL: u8 = 0b000;
const RLE_MIX: u8 = 0b001;
const RLE_FGBG_IMAGE: u8 = 0b010;
const RLE_COLOR: u8 = 0b011;
const RLE_COPY: u8 = 0b100;

impl BitmapCodec for InterleavedRle8Codec {
    fn id(&self) -> CodecId {
        CodecId::InterleavedRle
    }

    fn decode(
        &self,
        input: &[u8],
        width: u16,
        height: u16,
        bpp: u8,
    ) -> Result<Vec<u8>, CodecError> {
        if width == 0 || height == 0 {
            return Err(CodecError::InvalidDimensions { width, height });
        }
        if bpp != 8 {
            // Only the 8-bpp scheme is implemented; higher depths use a
            // different run encoding that this cache never negotiates.
            return Err(CodecError::UnsupportedCodec(CodecId::InterleavedRle));
        }

        let row_len = width as usize;
        let mut out = vec![0u8; row_len * height as usize];
        let mut pos = 0usize;

        for row in (0..height as usize).rev() {
            let row_start = row * row_len;
            let mut col = 0usize;
            while col < row_len {
                let header = *input.get(pos).ok_or(CodecError::TruncatedInput)?;
                pos += 1;
                let opcode = header >> 5;
                let mut run_len = (header & 0x1f) as usize;
                if run_len == 0x1f {
                    let extra = *input.get(pos).ok_or(CodecError::TruncatedInput)?;
                    pos += 1;
                    run_len += extra as usize;
                }
                run_len = run_len.min(row_len - col);

                match opcode {
                    RLE_FILL | RLE_MIX | RLE_FGBG_IMAGE => {
                        let value = *input.get(pos).ok_or(CodecError::TruncatedInput)?;
                        pos += 1;
                        for i in 0..run_len {
                            out[row_start + col + i] = value;
                        }
                    }
                    RLE_COLOR | RLE_COPY => {
                        let slice = input
                            .get(pos..pos + run_len)
                            .ok_or(CodecError::TruncatedInput)?;
                        out[row_start + col..row_start + col + run_len].copy_from_slice(slice);
                        pos += run_len;
                    }
                    _ => {
                        return Err(CodecError::UnsupportedCodec(CodecId::InterleavedRle));
                    }
                }
                col += run_len.max(1);
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_id_zero_is_none() {
        assert_eq!(CodecId::from_wire(0), CodecId::None);
    }

    #[test]
    fn codec_id_one_is_interleaved_rle() {
        assert_eq!(CodecId::from_wire(1), CodecId::InterleavedRle);
    }

    #[test]
    fn codec_id_other_is_plugin() {
        assert_eq!(CodecId::from_wire(9), CodecId::Plugin(9));
    }

    #[test]
    fn raw_codec_copies_exact_buffer() {
        let codec = RawCodec;
        let input = vec![1u8, 2, 3, 4];
        let out = codec.decode(&input, 2, 2, 8).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[test]
    fn raw_codec_rejects_truncated_input() {
        let codec = RawCodec;
        let input = vec![1u8, 2];
        assert!(matches!(
            codec.decode(&input, 2, 2, 8),
            Err(CodecError::TruncatedInput)
        ));
    }

    #[test]
    fn raw_codec_rejects_zero_dimensions() {
        let codec = RawCodec;
        assert!(matches!(
            codec.decode(&[], 0, 2, 8),
            Err(CodecError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn interleaved_rle_decodes_single_fill_row() {
        let codec = InterleavedRle8Codec;
        // One row of width 4: FILL opcode (000), run length 4, value 0x42.
        let input = vec![0b000_00100, 0x42];
        let out = codec.decode(&input, 4, 1, 8).unwrap();
        assert_eq!(out, vec![0x42, 0x42, 0x42, 0x42]);
    }

    #[test]
    fn interleaved_rle_decodes_color_run() {
        let codec = InterleavedRle8Codec;
        // COLOR opcode (011), run length 3, three literal bytes.
        let input = vec![0b011_00011, 0x10, 0x20, 0x30];
        let out = codec.decode(&input, 3, 1, 8).unwrap();
        assert_eq!(out, vec![0x10, 0x20, 0x30]);
    }

    #[test]
    fn interleaved_rle_rejects_non_8bpp() {
        let codec = InterleavedRle8Codec;
        assert!(matches!(
            codec.decode(&[], 4, 4, 16),
            Err(CodecError::UnsupportedCodec(_))
        ));
    }

    #[test]
    fn interleaved_rle_rejects_truncated_header() {
        let codec = InterleavedRle8Codec;
        assert!(matches!(
            codec.decode(&[], 4, 1, 8),
            Err(CodecError::TruncatedInput)
        ));
    }

    #[test]
    fn interleaved_rle_fills_multiple_rows_bottom_up() {
        let codec = InterleavedRle8Codec;
        let row = vec![0b000_00010u8, 0xAA];
        let mut input = Vec::new();
        input.extend_from_slice(&row);
        input.extend_from_slice(&row);
        let out = codec.decode(&input, 2, 2, 8).unwrap();
        assert_eq!(out, vec![0xAA, 0xAA, 0xAA, 0xAA]);
    }
}
