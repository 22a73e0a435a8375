// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The compressed (entropy-coded) half of the VP9 frame header: the
//! transform mode, the reference mode and the probability updates, decoded
//! with the boolean decoder over the byte range the uncompressed header
//! declares.

use enumn::N;
use log::debug;

use crate::codec::vp9::bool_decoder::BoolDecoder;
use crate::codec::vp9::parser::Header;
use crate::codec::vp9::parser::InterpolationFilter;
use crate::codec::vp9::parser::ParseError;
use crate::codec::vp9::parser::ParseResult;
use crate::codec::vp9::parser::Parser;
use crate::codec::vp9::parser::ALTREF_FRAME;
use crate::codec::vp9::parser::GOLDEN_FRAME;
use crate::codec::vp9::parser::LAST_FRAME;

pub const TX_SIZES: usize = 4;
pub const TX_SIZE_CONTEXTS: usize = 2;

pub const COEF_BANDS: usize = 6;
pub const PREV_COEF_CONTEXTS: usize = 6;
pub const UNCONSTRAINED_NODES: usize = 3;

pub const SKIP_CONTEXTS: usize = 3;
pub const INTER_MODE_CONTEXTS: usize = 7;
pub const INTER_MODES: usize = 4;
pub const INTERP_FILTER_CONTEXTS: usize = 4;
pub const SWITCHABLE_FILTERS: usize = 3;
pub const IS_INTER_CONTEXTS: usize = 4;
pub const COMP_MODE_CONTEXTS: usize = 5;
pub const REF_CONTEXTS: usize = 5;
pub const BLOCK_SIZE_GROUPS: usize = 4;
pub const INTRA_MODES: usize = 10;
pub const PARTITION_CONTEXTS: usize = 16;
pub const PARTITION_TYPES: usize = 4;

pub const MV_JOINTS: usize = 4;
pub const MV_CLASSES: usize = 11;
pub const CLASS0_SIZE: usize = 2;
pub const MV_OFFSET_BITS: usize = 10;
pub const MV_FR_SIZE: usize = 4;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum TxMode {
    #[default]
    Only4x4 = 0,
    Allow8x8 = 1,
    Allow16x16 = 2,
    Allow32x32 = 3,
    Select = 4,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum ReferenceMode {
    #[default]
    SingleReference = 0,
    CompoundReference = 1,
    ReferenceModeSelect = 2,
}

/// Motion-vector probability updates, one entry per adaptively coded
/// context.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MvDeltaProbs {
    pub joints: [u8; MV_JOINTS - 1],
    pub sign: [u8; 2],
    pub classes: [[u8; MV_CLASSES - 1]; 2],
    pub class0: [[u8; CLASS0_SIZE - 1]; 2],
    pub bits: [[u8; MV_OFFSET_BITS]; 2],
    pub class0_fr: [[[u8; MV_FR_SIZE - 1]; CLASS0_SIZE]; 2],
    pub fr: [[u8; MV_FR_SIZE - 1]; 2],
    pub class0_hp: [u8; 2],
    pub hp: [u8; 2],
}

/// The probability updates carried by one compressed header, stored exactly
/// as decoded from the wire. An entry of 0 means "not updated": neither the
/// subexponential code nor the motion-vector code can produce 0 for an
/// update. Folding these values into the baseline probability tables per
/// the forward-adaptation rules is the consuming decoder's responsibility;
/// this parser never reads a previous frame's values back in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeltaProbabilities {
    pub tx_probs_8x8: [[u8; TX_SIZES - 3]; TX_SIZE_CONTEXTS],
    pub tx_probs_16x16: [[u8; TX_SIZES - 2]; TX_SIZE_CONTEXTS],
    pub tx_probs_32x32: [[u8; TX_SIZES - 1]; TX_SIZE_CONTEXTS],
    pub coef: [[[[[[u8; UNCONSTRAINED_NODES]; PREV_COEF_CONTEXTS]; COEF_BANDS]; 2]; 2]; TX_SIZES],
    pub skip: [u8; SKIP_CONTEXTS],
    pub inter_mode: [[u8; INTER_MODES - 1]; INTER_MODE_CONTEXTS],
    pub interp_filter: [[u8; SWITCHABLE_FILTERS - 1]; INTERP_FILTER_CONTEXTS],
    pub is_inter: [u8; IS_INTER_CONTEXTS],
    pub comp_mode: [u8; COMP_MODE_CONTEXTS],
    pub single_ref: [[u8; 2]; REF_CONTEXTS],
    pub comp_ref: [u8; REF_CONTEXTS],
    pub y_mode: [[u8; INTRA_MODES - 1]; BLOCK_SIZE_GROUPS],
    pub partition: [[u8; PARTITION_TYPES - 1]; PARTITION_CONTEXTS],
    pub mv: MvDeltaProbs,
}

impl Parser {
    fn read_tx_mode(bd: &mut BoolDecoder, hdr: &mut Header) -> ParseResult<()> {
        hdr.tx_mode = if hdr.lossless {
            TxMode::Only4x4
        } else {
            let mut raw = bd.read_literal(2)?;
            if raw == TxMode::Allow32x32 as u32 {
                raw += bd.read_literal(1)?;
            }

            TxMode::n(raw)
                .ok_or_else(|| ParseError::InvalidValue(format!("invalid tx mode {}", raw)))?
        };

        Ok(())
    }

    fn read_tx_mode_probs(bd: &mut BoolDecoder, probs: &mut DeltaProbabilities) -> ParseResult<()> {
        for ctx in probs.tx_probs_8x8.iter_mut() {
            for prob in ctx.iter_mut() {
                *prob = bd.decode_term_subexp()?;
            }
        }

        for ctx in probs.tx_probs_16x16.iter_mut() {
            for prob in ctx.iter_mut() {
                *prob = bd.decode_term_subexp()?;
            }
        }

        for ctx in probs.tx_probs_32x32.iter_mut() {
            for prob in ctx.iter_mut() {
                *prob = bd.decode_term_subexp()?;
            }
        }

        Ok(())
    }

    fn read_coef_probs(bd: &mut BoolDecoder, hdr: &mut Header) -> ParseResult<()> {
        const TX_MODE_TO_BIGGEST_TX_SIZE: [usize; 5] = [0, 1, 2, 3, 3];

        let max_tx_size = TX_MODE_TO_BIGGEST_TX_SIZE[hdr.tx_mode as usize];

        for tx_size in 0..=max_tx_size {
            let update_probs = bd.read_literal(1)?;
            if update_probs == 0 {
                continue;
            }

            for i in 0..2 {
                for j in 0..2 {
                    for k in 0..COEF_BANDS {
                        // The first band carries fewer contexts.
                        let max_l = if k == 0 { 3 } else { PREV_COEF_CONTEXTS };

                        for l in 0..max_l {
                            for m in 0..UNCONSTRAINED_NODES {
                                hdr.delta_probabilities.coef[tx_size][i][j][k][l][m] =
                                    bd.decode_term_subexp()?;
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn read_skip_probs(bd: &mut BoolDecoder, probs: &mut DeltaProbabilities) -> ParseResult<()> {
        for prob in probs.skip.iter_mut() {
            *prob = bd.decode_term_subexp()?;
        }

        Ok(())
    }

    fn read_inter_mode_probs(
        bd: &mut BoolDecoder,
        probs: &mut DeltaProbabilities,
    ) -> ParseResult<()> {
        for ctx in probs.inter_mode.iter_mut() {
            for prob in ctx.iter_mut() {
                *prob = bd.decode_term_subexp()?;
            }
        }

        Ok(())
    }

    fn read_interp_filter_probs(
        bd: &mut BoolDecoder,
        probs: &mut DeltaProbabilities,
    ) -> ParseResult<()> {
        for ctx in probs.interp_filter.iter_mut() {
            for prob in ctx.iter_mut() {
                *prob = bd.decode_term_subexp()?;
            }
        }

        Ok(())
    }

    fn read_is_inter_probs(bd: &mut BoolDecoder, probs: &mut DeltaProbabilities) -> ParseResult<()> {
        for prob in probs.is_inter.iter_mut() {
            *prob = bd.decode_term_subexp()?;
        }

        Ok(())
    }

    /// Derives the reference mode for the frame. Compound prediction is only
    /// possible when the sign biases disagree, in which case the mode is
    /// coded.
    fn frame_reference_mode(bd: &mut BoolDecoder, hdr: &mut Header) -> ParseResult<()> {
        let compound_reference_allowed = hdr.ref_frame_sign_bias[GOLDEN_FRAME]
            != hdr.ref_frame_sign_bias[LAST_FRAME]
            || hdr.ref_frame_sign_bias[ALTREF_FRAME] != hdr.ref_frame_sign_bias[LAST_FRAME];

        hdr.reference_mode = if compound_reference_allowed {
            let non_single_reference = bd.read_literal(1)?;

            if non_single_reference == 0 {
                ReferenceMode::SingleReference
            } else {
                let reference_select = bd.read_literal(1)?;

                if reference_select == 1 {
                    ReferenceMode::ReferenceModeSelect
                } else {
                    ReferenceMode::CompoundReference
                }
            }
        } else {
            ReferenceMode::SingleReference
        };

        Ok(())
    }

    fn frame_reference_mode_probs(bd: &mut BoolDecoder, hdr: &mut Header) -> ParseResult<()> {
        let probs = &mut hdr.delta_probabilities;

        if hdr.reference_mode == ReferenceMode::ReferenceModeSelect {
            for prob in probs.comp_mode.iter_mut() {
                *prob = bd.decode_term_subexp()?;
            }
        }

        if hdr.reference_mode != ReferenceMode::CompoundReference {
            for ctx in probs.single_ref.iter_mut() {
                for prob in ctx.iter_mut() {
                    *prob = bd.decode_term_subexp()?;
                }
            }
        }

        if hdr.reference_mode != ReferenceMode::SingleReference {
            for prob in probs.comp_ref.iter_mut() {
                *prob = bd.decode_term_subexp()?;
            }
        }

        Ok(())
    }

    fn read_y_mode_probs(bd: &mut BoolDecoder, probs: &mut DeltaProbabilities) -> ParseResult<()> {
        for group in probs.y_mode.iter_mut() {
            for prob in group.iter_mut() {
                *prob = bd.decode_term_subexp()?;
            }
        }

        Ok(())
    }

    fn read_partition_probs(
        bd: &mut BoolDecoder,
        probs: &mut DeltaProbabilities,
    ) -> ParseResult<()> {
        for ctx in probs.partition.iter_mut() {
            for prob in ctx.iter_mut() {
                *prob = bd.decode_term_subexp()?;
            }
        }

        Ok(())
    }

    fn read_mv_probs(bd: &mut BoolDecoder, hdr: &mut Header) -> ParseResult<()> {
        let mv = &mut hdr.delta_probabilities.mv;

        for prob in mv.joints.iter_mut() {
            *prob = bd.read_mv_prob()?;
        }

        for i in 0..2 {
            mv.sign[i] = bd.read_mv_prob()?;

            for j in 0..MV_CLASSES - 1 {
                mv.classes[i][j] = bd.read_mv_prob()?;
            }

            for j in 0..CLASS0_SIZE - 1 {
                mv.class0[i][j] = bd.read_mv_prob()?;
            }

            for j in 0..MV_OFFSET_BITS {
                mv.bits[i][j] = bd.read_mv_prob()?;
            }
        }

        for i in 0..2 {
            for j in 0..CLASS0_SIZE {
                for k in 0..MV_FR_SIZE - 1 {
                    mv.class0_fr[i][j][k] = bd.read_mv_prob()?;
                }
            }

            for k in 0..MV_FR_SIZE - 1 {
                mv.fr[i][k] = bd.read_mv_prob()?;
            }
        }

        if hdr.allow_high_precision_mv {
            for i in 0..2 {
                mv.class0_hp[i] = bd.read_mv_prob()?;
                mv.hp[i] = bd.read_mv_prob()?;
            }
        }

        Ok(())
    }

    /// Parses the compressed frame header into `hdr`. `data` must start at
    /// the byte offset announced by `uncompressed_header_size_in_bytes` and
    /// hold at least `header_size_in_bytes` bytes; exactly that many bytes
    /// are consumed.
    pub fn parse_compressed_header(&mut self, hdr: &mut Header, data: &[u8]) -> ParseResult<()> {
        debug!("Parsing VP9 compressed frame header.");

        let size = usize::from(hdr.header_size_in_bytes);
        let region = data.get(..size).ok_or_else(|| {
            ParseError::BrokenData(format!(
                "compressed header needs {} bytes but only {} are available",
                size,
                data.len()
            ))
        })?;

        let mut bd = BoolDecoder::new(region)?;

        Self::read_tx_mode(&mut bd, hdr)?;

        if hdr.tx_mode == TxMode::Select {
            Self::read_tx_mode_probs(&mut bd, &mut hdr.delta_probabilities)?;
        }

        Self::read_coef_probs(&mut bd, hdr)?;
        Self::read_skip_probs(&mut bd, &mut hdr.delta_probabilities)?;

        if !hdr.frame_is_intra() {
            Self::read_inter_mode_probs(&mut bd, &mut hdr.delta_probabilities)?;

            if hdr.interpolation_filter == InterpolationFilter::Switchable {
                Self::read_interp_filter_probs(&mut bd, &mut hdr.delta_probabilities)?;
            }

            Self::read_is_inter_probs(&mut bd, &mut hdr.delta_probabilities)?;
            Self::frame_reference_mode(&mut bd, hdr)?;
            Self::frame_reference_mode_probs(&mut bd, hdr)?;
            Self::read_y_mode_probs(&mut bd, &mut hdr.delta_probabilities)?;
            Self::read_partition_probs(&mut bd, &mut hdr.delta_probabilities)?;
            Self::read_mv_probs(&mut bd, hdr)?;
        }

        bd.exit()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::vp9::bool_decoder::synth::encode_region;
    use crate::codec::vp9::parser::FrameType;

    fn intra_header(header_size: u16) -> Header {
        Header {
            frame_type: FrameType::KeyFrame,
            header_size_in_bytes: header_size,
            ..Default::default()
        }
    }

    fn inter_header(header_size: u16) -> Header {
        Header {
            frame_type: FrameType::InterFrame,
            quant: crate::codec::vp9::parser::QuantizationParams {
                base_q_idx: 60,
                ..Default::default()
            },
            header_size_in_bytes: header_size,
            ..Default::default()
        }
    }

    #[test]
    fn all_zero_region_decodes_to_no_updates() {
        let mut hdr = intra_header(32);
        hdr.quant.base_q_idx = 100;

        let mut parser = Parser::default();
        parser
            .parse_compressed_header(&mut hdr, &[0u8; 32])
            .unwrap();

        assert_eq!(hdr.tx_mode, TxMode::Only4x4);
        assert_eq!(hdr.delta_probabilities, DeltaProbabilities::default());
    }

    #[test]
    fn all_zero_inter_region_decodes_to_no_updates() {
        let mut hdr = inter_header(32);
        hdr.interpolation_filter = InterpolationFilter::Switchable;
        hdr.allow_high_precision_mv = true;

        let mut parser = Parser::default();
        parser
            .parse_compressed_header(&mut hdr, &[0u8; 32])
            .unwrap();

        assert_eq!(hdr.tx_mode, TxMode::Only4x4);
        assert_eq!(hdr.reference_mode, ReferenceMode::SingleReference);
        assert_eq!(hdr.delta_probabilities, DeltaProbabilities::default());
    }

    #[test]
    fn lossless_forces_the_4x4_transform() {
        // The first two payload bits would read as a tx mode of 2.
        let data = encode_region(16, |enc| enc.put_literal(2, 2));

        let mut hdr = intra_header(16);
        hdr.lossless = true;

        let mut parser = Parser::default();
        parser.parse_compressed_header(&mut hdr, &data).unwrap();
        assert_eq!(hdr.tx_mode, TxMode::Only4x4);

        let mut hdr = intra_header(16);
        hdr.quant.base_q_idx = 100;

        parser.parse_compressed_header(&mut hdr, &data).unwrap();
        assert_eq!(hdr.tx_mode, TxMode::Allow16x16);
    }

    #[test]
    fn select_tx_mode_takes_the_escape_bit() {
        let data = encode_region(16, |enc| {
            enc.put_literal(2, 3);
            enc.put_literal(1, 1);
            // Under tx mode selection the per-size probability deltas
            // follow, then one coefficient presence bit per transform size
            // and the skip contexts.
            for _ in 0..TX_SIZE_CONTEXTS * ((TX_SIZES - 3) + (TX_SIZES - 2) + (TX_SIZES - 1)) {
                enc.put_bool(false, 252);
            }
            for _ in 0..TX_SIZES {
                enc.put_literal(1, 0);
            }
            for _ in 0..SKIP_CONTEXTS {
                enc.put_bool(false, 252);
            }
        });

        let mut hdr = intra_header(16);
        hdr.quant.base_q_idx = 100;

        let mut parser = Parser::default();
        parser.parse_compressed_header(&mut hdr, &data).unwrap();
        assert_eq!(hdr.tx_mode, TxMode::Select);
        assert_eq!(hdr.delta_probabilities, DeltaProbabilities::default());
    }

    #[test]
    fn skip_probability_update_is_decoded() {
        let data = encode_region(8, |enc| {
            enc.put_literal(2, 0); // tx mode: 4x4 only
            enc.put_literal(1, 0); // no coef updates
            enc.put_bool(true, 252); // skip[0] updated
            enc.put_bool(false, 128);
            enc.put_literal(4, 5);
            enc.put_bool(false, 252); // skip[1]
            enc.put_bool(false, 252); // skip[2]
        });

        let mut hdr = intra_header(8);
        hdr.quant.base_q_idx = 100;

        let mut parser = Parser::default();
        parser.parse_compressed_header(&mut hdr, &data).unwrap();

        assert_eq!(hdr.delta_probabilities.skip, [72, 0, 0]);
    }

    #[test]
    fn reference_mode_select_is_derived_from_sign_bias() {
        let data = encode_region(16, |enc| {
            enc.put_literal(2, 0); // tx mode: 4x4 only
            enc.put_literal(1, 0); // no coef updates
            for _ in 0..SKIP_CONTEXTS {
                enc.put_bool(false, 252);
            }
            for _ in 0..INTER_MODE_CONTEXTS * (INTER_MODES - 1) {
                enc.put_bool(false, 252);
            }
            for _ in 0..IS_INTER_CONTEXTS {
                enc.put_bool(false, 252);
            }
            enc.put_literal(1, 1); // not single reference
            enc.put_literal(1, 1); // per-block selection
            for _ in 0..COMP_MODE_CONTEXTS {
                enc.put_bool(false, 252);
            }
            for _ in 0..REF_CONTEXTS * 2 {
                enc.put_bool(false, 252);
            }
            for _ in 0..REF_CONTEXTS {
                enc.put_bool(false, 252);
            }
            for _ in 0..BLOCK_SIZE_GROUPS * (INTRA_MODES - 1) {
                enc.put_bool(false, 252);
            }
            for _ in 0..PARTITION_CONTEXTS * (PARTITION_TYPES - 1) {
                enc.put_bool(false, 252);
            }
            // Motion vector probabilities, all unchanged.
            for _ in 0..MV_JOINTS - 1 {
                enc.put_bool(false, 252);
            }
            for _ in 0..2 * (1 + (MV_CLASSES - 1) + (CLASS0_SIZE - 1) + MV_OFFSET_BITS) {
                enc.put_bool(false, 252);
            }
            for _ in 0..2 * (CLASS0_SIZE + 1) * (MV_FR_SIZE - 1) {
                enc.put_bool(false, 252);
            }
        });

        let mut hdr = inter_header(16);
        hdr.ref_frame_sign_bias[GOLDEN_FRAME] = 1;

        let mut parser = Parser::default();
        parser.parse_compressed_header(&mut hdr, &data).unwrap();

        assert_eq!(hdr.reference_mode, ReferenceMode::ReferenceModeSelect);
    }

    #[test]
    fn truncated_region_is_broken_data() {
        let mut hdr = intra_header(1);
        hdr.quant.base_q_idx = 100;

        let mut parser = Parser::default();
        assert!(matches!(
            parser.parse_compressed_header(&mut hdr, &[0u8]),
            Err(ParseError::BrokenData(_))
        ));
    }

    #[test]
    fn region_shorter_than_declared_is_broken_data() {
        let mut hdr = intra_header(32);

        let mut parser = Parser::default();
        assert!(matches!(
            parser.parse_compressed_header(&mut hdr, &[0u8; 16]),
            Err(ParseError::BrokenData(_))
        ));
    }

    #[test]
    fn nonzero_padding_is_broken_data() {
        let mut data = [0u8; 100];
        data[50] = 0xaa;

        let mut hdr = intra_header(100);
        hdr.quant.base_q_idx = 100;

        let mut parser = Parser::default();
        assert!(matches!(
            parser.parse_compressed_header(&mut hdr, &data),
            Err(ParseError::BrokenData(_))
        ));
    }

    #[test]
    fn marker_bit_is_enforced() {
        let mut hdr = intra_header(8);
        hdr.quant.base_q_idx = 100;

        let mut parser = Parser::default();
        assert!(matches!(
            parser.parse_compressed_header(&mut hdr, &[0x80, 0, 0, 0, 0, 0, 0, 0]),
            Err(ParseError::BrokenData(_))
        ));
    }
}
