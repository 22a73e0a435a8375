// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The boolean (range) decoder used by the VP9 compressed frame header, as
//! per "9.2 Boolean decoder" in the VP9 specification.

use bitreader::BitReader;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BoolDecoderError {
    #[error("the compressed header region is empty")]
    EmptyRegion,
    #[error("the marker bit at the start of the compressed header is not zero")]
    BadMarker,
    #[error("the compressed header region ran out of bits")]
    OutOfBits,
    #[error("the unused tail of the compressed header is not valid padding")]
    BadPadding,
}

pub type BoolDecoderResult<T> = std::result::Result<T, BoolDecoderError>;

/// Number of bits the decoder examines per symbol.
const BOOL_SIZE: u32 = 8;
/// Width of the prefetch window.
const BIG_BOOL_BIT_SIZE: u32 = u64::BITS;

const MV_UPDATE_PROB: u8 = 252;
const DIFF_UPDATE_PROB: u8 = 252;

/// Number of left shifts needed to bring a post-split range back into
/// [128, 255].
const NORM: [u8; 256] = [
    0, 7, 6, 6, 5, 5, 5, 5, 4, 4, 4, 4, 4, 4, 4, 4,
    3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Maps the raw subexponential code onto the probability value it stands
/// for. Note that 0 never appears: it is reserved as the "not updated"
/// sentinel.
const INV_MAP_TABLE: [u8; 255] = [
    7, 20, 33, 46, 59, 72, 85, 98, 111, 124, 137, 150, 163, 176, 189,
    202, 215, 228, 241, 254, 1, 2, 3, 4, 5, 6, 8, 9, 10, 11,
    12, 13, 14, 15, 16, 17, 18, 19, 21, 22, 23, 24, 25, 26, 27,
    28, 29, 30, 31, 32, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43,
    44, 45, 47, 48, 49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 60,
    61, 62, 63, 64, 65, 66, 67, 68, 69, 70, 71, 73, 74, 75, 76,
    77, 78, 79, 80, 81, 82, 83, 84, 86, 87, 88, 89, 90, 91, 92,
    93, 94, 95, 96, 97, 99, 100, 101, 102, 103, 104, 105, 106, 107, 108,
    109, 110, 112, 113, 114, 115, 116, 117, 118, 119, 120, 121, 122, 123, 125,
    126, 127, 128, 129, 130, 131, 132, 133, 134, 135, 136, 138, 139, 140, 141,
    142, 143, 144, 145, 146, 147, 148, 149, 151, 152, 153, 154, 155, 156, 157,
    158, 159, 160, 161, 162, 164, 165, 166, 167, 168, 169, 170, 171, 172, 173,
    174, 175, 177, 178, 179, 180, 181, 182, 183, 184, 185, 186, 187, 188, 190,
    191, 192, 193, 194, 195, 196, 197, 198, 199, 200, 201, 203, 204, 205, 206,
    207, 208, 209, 210, 211, 212, 213, 214, 216, 217, 218, 219, 220, 221, 222,
    223, 224, 225, 226, 227, 229, 230, 231, 232, 233, 234, 235, 236, 237, 238,
    239, 240, 242, 243, 244, 245, 246, 247, 248, 249, 250, 251, 252, 253, 255,
];

/// A renormalizing binary arithmetic decoder over a byte-aligned region of
/// the bitstream. Symbols are pulled lazily from the underlying reader into
/// a 64-bit window; `count_to_fill` tracks how many bits the window is
/// short.
pub struct BoolDecoder<'a> {
    reader: BitReader<'a>,
    value: u64,
    range: u32,
    count_to_fill: i32,
}

impl<'a> BoolDecoder<'a> {
    /// Initializes the decoder over `data`, which must be the exact
    /// compressed header region. The first decoded bit is a marker that is
    /// required to be zero.
    pub fn new(data: &'a [u8]) -> BoolDecoderResult<Self> {
        if data.is_empty() {
            return Err(BoolDecoderError::EmptyRegion);
        }

        let mut bd = Self {
            reader: BitReader::new(data),
            value: 0,
            range: 255,
            count_to_fill: BOOL_SIZE as i32,
        };

        if bd.read_literal(1)? != 0 {
            return Err(BoolDecoderError::BadMarker);
        }

        Ok(bd)
    }

    /// Tops up the prefetch window. The stream must hold at least
    /// `count_to_fill` more bits or the decoder would be working with
    /// invented data.
    fn fill(&mut self) -> BoolDecoderResult<()> {
        let bits_left = self.reader.remaining();

        if bits_left < self.count_to_fill as u64 {
            return Err(BoolDecoderError::OutOfBits);
        }

        let max_bits_to_read = (BIG_BOOL_BIT_SIZE - BOOL_SIZE) as i32 + self.count_to_fill;
        let bits_to_read = std::cmp::min(max_bits_to_read as u64, bits_left) as u32;

        let data = self
            .reader
            .read_u64(bits_to_read as u8)
            .map_err(|_| BoolDecoderError::OutOfBits)?;

        if bits_to_read < BIG_BOOL_BIT_SIZE {
            self.value |= data << (max_bits_to_read as u32 - bits_to_read);
        } else {
            self.value |= data;
        }

        self.count_to_fill -= bits_to_read as i32;

        Ok(())
    }

    /// Decodes one boolean at probability `prob`/256, as per "9.2.2 Boolean
    /// decoding process".
    pub fn read_bool(&mut self, prob: u8) -> BoolDecoderResult<bool> {
        if self.count_to_fill > 0 {
            self.fill()?;
        }

        let split = 1 + (((self.range - 1) * u32::from(prob)) >> 8);
        let big_split = u64::from(split) << (BIG_BOOL_BIT_SIZE - BOOL_SIZE);

        let bit = if self.value < big_split {
            self.range = split;
            false
        } else {
            self.range -= split;
            self.value -= big_split;
            true
        };

        let shift = NORM[self.range as usize];
        self.range <<= shift;
        self.value <<= shift;
        self.count_to_fill += i32::from(shift);

        Ok(bit)
    }

    /// Decodes an `n`-bit unsigned literal, MSB first, each bit at
    /// probability 128.
    pub fn read_literal(&mut self, bits: u32) -> BoolDecoderResult<u32> {
        let mut ret = 0;

        for _ in 0..bits {
            ret = 2 * ret + u32::from(self.read_bool(128)?);
        }

        Ok(ret)
    }

    /// Decodes one gated subexponential probability update, as per "6.3.5
    /// Decode term subexp syntax". Returns the updated probability value, or
    /// 0 when the bitstream carries no update for this entry.
    pub fn decode_term_subexp(&mut self) -> BoolDecoderResult<u8> {
        if !self.read_bool(DIFF_UPDATE_PROB)? {
            return Ok(0);
        }

        if !self.read_bool(128)? {
            let v = self.read_literal(4)?;
            return Ok(INV_MAP_TABLE[v as usize]);
        }

        if !self.read_bool(128)? {
            let v = self.read_literal(4)? + 16;
            return Ok(INV_MAP_TABLE[v as usize]);
        }

        if !self.read_bool(128)? {
            let v = self.read_literal(5)? + 32;
            return Ok(INV_MAP_TABLE[v as usize]);
        }

        let v = self.read_literal(7)?;
        if v < 65 {
            return Ok(INV_MAP_TABLE[v as usize + 64]);
        }

        let bit = self.read_literal(1)?;
        Ok(INV_MAP_TABLE[((v << 1) - 1 + bit) as usize])
    }

    /// Decodes one gated motion-vector probability update. Updates are
    /// always odd, so 0 unambiguously means "not updated".
    pub fn read_mv_prob(&mut self) -> BoolDecoderResult<u8> {
        if self.read_bool(MV_UPDATE_PROB)? {
            Ok((self.read_literal(7)? as u8) << 1 | 1)
        } else {
            Ok(0)
        }
    }

    /// Consumes the rest of the region and checks it is valid padding, as
    /// per "9.2.3 Exit process for Boolean decoder". Whole 8-bit chunks must
    /// be zero; a trailing partial chunk whose top 3 bits read `110` is a
    /// superframe marker byte that leaked into the declared header size.
    pub fn exit(mut self) -> BoolDecoderResult<()> {
        while self.reader.remaining() > 0 {
            let n_bits = std::cmp::min(self.reader.remaining(), 8) as u8;
            let data = self
                .reader
                .read_u8(n_bits)
                .map_err(|_| BoolDecoderError::OutOfBits)?;

            if n_bits == 8 {
                if data != 0 {
                    return Err(BoolDecoderError::BadPadding);
                }
            } else if n_bits >= 3 && data >> (n_bits - 3) == 0b110 {
                return Err(BoolDecoderError::BadPadding);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod synth {
    use super::NORM;

    /// A boolean arithmetic encoder, only used to synthesize compressed
    /// header fixtures for the tests in this crate.
    pub(crate) struct BoolEncoder {
        buffer: Vec<u8>,
        low: u32,
        range: u32,
        count: i32,
    }

    impl BoolEncoder {
        pub(crate) fn new() -> Self {
            Self {
                buffer: Vec::new(),
                low: 0,
                range: 255,
                count: -24,
            }
        }

        pub(crate) fn put_bool(&mut self, bit: bool, prob: u8) {
            let split = 1 + (((self.range - 1) * u32::from(prob)) >> 8);

            if bit {
                self.low += split;
                self.range -= split;
            } else {
                self.range = split;
            }

            let mut shift = i32::from(NORM[self.range as usize]);
            self.range <<= shift;
            self.count += shift;

            if self.count >= 0 {
                let offset = shift - self.count;

                if (self.low << (offset - 1)) & 0x8000_0000 != 0 {
                    for byte in self.buffer.iter_mut().rev() {
                        if *byte == 0xff {
                            *byte = 0;
                        } else {
                            *byte += 1;
                            break;
                        }
                    }
                }

                self.buffer.push((self.low >> (24 - offset)) as u8);
                self.low <<= offset;
                self.low &= 0x00ff_ffff;
                shift = self.count;
                self.count -= 8;
            }

            self.low <<= shift;
        }

        pub(crate) fn put_literal(&mut self, bits: u32, value: u32) {
            for bit in (0..bits).rev() {
                self.put_bool((value >> bit) & 1 != 0, 128);
            }
        }

        /// Flushes the arithmetic state and pads the output to `len` bytes.
        pub(crate) fn finish(mut self, len: usize) -> Vec<u8> {
            for _ in 0..32 {
                self.put_bool(false, 128);
            }

            assert!(self.buffer.len() <= len, "fixture region too small");
            self.buffer.resize(len, 0);
            self.buffer
        }
    }

    /// Encodes `marker bit + payload` the way a compliant stream would.
    pub(crate) fn encode_region(len: usize, payload: impl FnOnce(&mut BoolEncoder)) -> Vec<u8> {
        let mut enc = BoolEncoder::new();
        enc.put_bool(false, 128);
        payload(&mut enc);
        enc.finish(len)
    }
}
