// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A VP9 frame-header parser: the uncompressed header grammar, the
//! cross-frame parser state it maintains, and the records it produces.
//!
//! The compressed (entropy-coded) half of the header is handled by
//! [`crate::codec::vp9::compressed_header`], which decorates the same
//! [`Header`] record.

use bitreader::BitReader;
use enumn::N;
use log::debug;
use thiserror::Error;

use crate::codec::vp9::bool_decoder::BoolDecoderError;
use crate::codec::vp9::compressed_header::DeltaProbabilities;
use crate::codec::vp9::compressed_header::ReferenceMode;
use crate::codec::vp9::compressed_header::TxMode;
use crate::codec::vp9::lookups::get_ac_quant;
use crate::codec::vp9::lookups::get_dc_quant;
use crate::codec::vp9::lookups::get_qindex;
use crate::codec::vp9::lookups::seg_feature_active;

pub const REFS_PER_FRAME: usize = 3;

pub const MAX_REF_LF_DELTAS: usize = 4;
pub const MAX_MODE_LF_DELTAS: usize = 2;

pub const INTRA_FRAME: usize = 0;
pub const LAST_FRAME: usize = 1;
pub const GOLDEN_FRAME: usize = 2;
pub const ALTREF_FRAME: usize = 3;
pub const MAX_REF_FRAMES: usize = 4;

pub const MAX_SEGMENTS: usize = 8;
pub const SEG_TREE_PROBS: usize = MAX_SEGMENTS - 1;
pub const PREDICTION_PROBS: usize = 3;

pub const SEG_LVL_ALT_Q: usize = 0;
pub const SEG_LVL_ALT_L: usize = 1;
pub const SEG_LVL_REF_FRAME: usize = 2;
pub const SEG_LVL_SKIP: usize = 3;
pub const SEG_LVL_MAX: usize = 4;

pub const MAX_LOOP_FILTER: u32 = 63;

pub const FRAME_MARKER: u32 = 0x02;
pub const SYNC_CODE: u32 = 0x498342;

pub const MIN_TILE_WIDTH_B64: u32 = 4;
pub const MAX_TILE_WIDTH_B64: u32 = 64;
pub const MAX_TILE_COLS_LOG2: u32 = 6;

/// The number of reference frame slots.
pub const NUM_REF_FRAMES: usize = 8;

#[derive(Debug, Error)]
pub enum ParseError {
    /// The literal content of the bitstream is corrupt: a mandatory bit
    /// pattern is missing or there are not enough bits left for a required
    /// field. The frame must be discarded.
    #[error("broken data: {0}")]
    BrokenData(String),
    /// A decoded value is outside the range its syntax element allows. The
    /// frame must be discarded.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

pub type ParseResult<T> = std::result::Result<T, ParseError>;

impl From<bitreader::BitReaderError> for ParseError {
    fn from(err: bitreader::BitReaderError) -> Self {
        ParseError::BrokenData(err.to_string())
    }
}

impl From<BoolDecoderError> for ParseError {
    fn from(err: BoolDecoderError) -> Self {
        ParseError::BrokenData(err.to_string())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum InterpolationFilter {
    #[default]
    EightTap = 0,
    EightTapSmooth = 1,
    EightTapSharp = 2,
    Bilinear = 3,
    Switchable = 4,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
pub enum ReferenceFrameType {
    Intra = 0,
    Last = 1,
    Golden = 2,
    AltRef = 3,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum FrameType {
    #[default]
    KeyFrame = 0,
    InterFrame = 1,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum Profile {
    #[default]
    Profile0 = 0,
    Profile1 = 1,
    Profile2 = 2,
    Profile3 = 3,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum BitDepth {
    #[default]
    Depth8 = 8,
    Depth10 = 10,
    Depth12 = 12,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum ColorSpace {
    #[default]
    Unknown = 0,
    Bt601 = 1,
    Bt709 = 2,
    Smpte170 = 3,
    Smpte240 = 4,
    Bt2020 = 5,
    Reserved = 6,
    Srgb = 7,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum ColorRange {
    #[default]
    StudioSwing = 0,
    FullSwing = 1,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopFilterParams {
    /// Indicates the loop filter strength.
    pub level: u8,
    /// Indicates the sharpness level. The level and sharpness together
    /// determine when a block edge is filtered and by how much the filtering
    /// can change the sample values.
    pub sharpness: u8,
    /// If set, the filter level depends on the mode and reference frame used
    /// to predict a block.
    pub delta_enabled: bool,
    /// If set, the bitstream contains additional syntax elements that
    /// specify which mode and reference frame deltas are to be updated.
    pub delta_update: bool,
    /// Per-entry presence of a ref delta update in this frame's bitstream.
    pub update_ref_delta: [bool; MAX_REF_LF_DELTAS],
    /// The adjustment needed for the filter level based on the chosen
    /// reference frame. An entry not present in the bitstream keeps its
    /// previous value.
    pub ref_deltas: [i8; MAX_REF_LF_DELTAS],
    /// Per-entry presence of a mode delta update in this frame's bitstream.
    pub update_mode_delta: [bool; MAX_MODE_LF_DELTAS],
    /// The adjustment needed for the filter level based on the chosen mode.
    /// An entry not present in the bitstream keeps its previous value.
    pub mode_deltas: [i8; MAX_MODE_LF_DELTAS],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuantizationParams {
    /// The base frame qindex. Used for Y AC coefficients and as the base
    /// value for the other quantizers.
    pub base_q_idx: u8,
    /// The Y DC quantizer relative to base_q_idx.
    pub delta_q_y_dc: i8,
    /// The UV DC quantizer relative to base_q_idx.
    pub delta_q_uv_dc: i8,
    /// The UV AC quantizer relative to base_q_idx.
    pub delta_q_uv_ac: i8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentationParams {
    /// If set, this frame makes use of the segmentation tool.
    pub enabled: bool,
    /// If set, the segmentation map is updated during the decoding of this
    /// frame; if unset, the map from the previous frame is used.
    pub update_map: bool,
    /// The probability values to be used when decoding segment_id.
    pub tree_probs: [u8; SEG_TREE_PROBS],
    /// The probability values to be used when decoding seg_id_predicted.
    pub pred_probs: [u8; PREDICTION_PROBS],
    /// If set, updates to the segmentation map are coded relative to the
    /// existing map.
    pub temporal_update: bool,
    /// If set, new parameters are specified for each segment; if unset, the
    /// segmentation parameters keep their existing values.
    pub update_data: bool,
    /// If unset, feature data are adjustments relative to the standard
    /// values; if set, they are the actual values to be used.
    pub abs_or_delta_update: bool,
    /// Per-segment, per-feature enable bits.
    pub feature_enabled: [[bool; SEG_LVL_MAX]; MAX_SEGMENTS],
    /// Per-segment, per-feature data.
    pub feature_data: [[i16; SEG_LVL_MAX]; MAX_SEGMENTS],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct FrameSize {
    width: u32,
    height: u32,
}

/// A VP9 frame header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    /// The coding profile in use.
    pub profile: Profile,
    /// The bit depth of the frame.
    pub bit_depth: BitDepth,
    /// Specifies the chroma subsampling format.
    pub subsampling_x: bool,
    /// Specifies the chroma subsampling format.
    pub subsampling_y: bool,
    /// Specifies the color space of the stream.
    pub color_space: ColorSpace,
    /// Specifies the black level and range of the luma and chroma signals.
    pub color_range: ColorRange,
    /// If set, the frame indexed by frame_to_show_map_idx is to be displayed
    /// and this header carries no further fields.
    pub show_existing_frame: bool,
    /// The reference slot to display. Only meaningful when
    /// show_existing_frame is set.
    pub frame_to_show_map_idx: u8,
    /// Whether this frame is a key frame.
    pub frame_type: FrameType,
    /// Whether this frame should be displayed.
    pub show_frame: bool,
    /// Whether error resilient mode is enabled.
    pub error_resilient_mode: bool,
    /// The width of the frame in pixels.
    pub width: u32,
    /// The height of the frame in pixels.
    pub height: u32,
    /// If set, the render width and height are explicitly coded; if unset,
    /// they are inferred from the frame width and height.
    pub render_and_frame_size_different: bool,
    /// The render width of the frame in pixels.
    pub render_width: u32,
    /// The render height of the frame in pixels.
    pub render_height: u32,
    /// If set, this frame is an intra-only frame.
    pub intra_only: bool,
    /// Specifies whether the frame context should be reset to default
    /// values.
    pub reset_frame_context: u8,
    /// A bitmask of the reference slots updated with the current frame
    /// after it is decoded.
    pub refresh_frame_flags: u8,
    /// The reference slots used by this inter frame.
    pub ref_frame_idx: [u8; REFS_PER_FRAME],
    /// The intended direction of the motion vector in time for each
    /// reference frame.
    pub ref_frame_sign_bias: [u8; MAX_REF_FRAMES],
    /// If set, motion vectors are specified to eighth-pel precision instead
    /// of quarter-pel.
    pub allow_high_precision_mv: bool,
    /// The interpolation filter selection.
    pub interpolation_filter: InterpolationFilter,
    /// If set, the probabilities computed for this frame should be stored
    /// for reference by future frames.
    pub refresh_frame_context: bool,
    /// Whether parallel decoding mode is enabled.
    pub frame_parallel_decoding_mode: bool,
    /// The frame context to use.
    pub frame_context_idx: u8,
    /// The loop filter parameters, after merging with the persistent state.
    pub lf: LoopFilterParams,
    /// The quantization parameters.
    pub quant: QuantizationParams,
    /// The segmentation parameters, after merging with the persistent state.
    pub seg: SegmentationParams,
    /// Base 2 logarithm of the tile column count. At most 6.
    pub tile_cols_log2: u8,
    /// Base 2 logarithm of the tile row count.
    pub tile_rows_log2: u8,
    /// Set when the base quantizer index and all three quantizer deltas are
    /// zero, which switches the frame to the special lossless 4x4 transform.
    pub lossless: bool,
    /// The size of the compressed header that follows, in bytes.
    pub header_size_in_bytes: u16,
    /// The size of this uncompressed header, in bytes. The compressed
    /// header begins at this byte offset.
    pub uncompressed_header_size_in_bytes: u16,
    /// The transform mode, decoded from the compressed header.
    pub tx_mode: TxMode,
    /// The reference mode, decoded from the compressed header.
    pub reference_mode: ReferenceMode,
    /// The probability updates decoded from the compressed header.
    pub delta_probabilities: DeltaProbabilities,
}

impl Header {
    /// Whether this frame is coded without reference to any other frame.
    pub fn frame_is_intra(&self) -> bool {
        matches!(self.frame_type, FrameType::KeyFrame) || self.intra_only
    }
}

/// A parsed VP9 frame: the header plus the bitstream bytes it was parsed
/// from.
pub struct Frame<'a> {
    /// The bitstream data for this frame.
    bitstream: &'a [u8],
    /// The parsed frame header.
    pub header: Header,
}

impl<'a> AsRef<[u8]> for Frame<'a> {
    fn as_ref(&self) -> &[u8] {
        self.bitstream
    }
}

/// Per-segment state derived from a parsed frame header: the loop filter
/// level lookup of "8.8.1 Loop filter frame init process" and the quantizer
/// scales of "8.6.1 Dequantization functions".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segmentation {
    /// The loop filter level per reference frame and mode.
    pub lvl_lookup: [[u8; MAX_MODE_LF_DELTAS]; MAX_REF_FRAMES],

    /// AC quant scale for the luma component.
    pub luma_ac_quant_scale: i16,
    /// DC quant scale for the luma component.
    pub luma_dc_quant_scale: i16,
    /// AC quant scale for the chroma components.
    pub chroma_ac_quant_scale: i16,
    /// DC quant scale for the chroma components.
    pub chroma_dc_quant_scale: i16,

    /// Whether the forced-reference-frame feature is enabled.
    pub reference_frame_enabled: bool,
    /// The feature data for the forced-reference-frame feature.
    pub reference_frame: i16,
    /// Whether the skip feature is enabled.
    pub reference_skip_enabled: bool,
}

impl Segmentation {
    /// Update the per-segment derived state after parsing a frame header.
    pub fn update_segmentation(segmentation: &mut [Segmentation; MAX_SEGMENTS], hdr: &Header) {
        let lf = &hdr.lf;
        let seg = &hdr.seg;

        let n_shift = lf.level >> 5;

        for segment_id in 0..MAX_SEGMENTS as u8 {
            let qindex = get_qindex(seg, &hdr.quant, segment_id);
            let luma_dc_quant_scale = get_dc_quant(qindex, hdr.quant.delta_q_y_dc, hdr.bit_depth);
            let luma_ac_quant_scale = get_ac_quant(qindex, 0, hdr.bit_depth);
            let chroma_dc_quant_scale =
                get_dc_quant(qindex, hdr.quant.delta_q_uv_dc, hdr.bit_depth);
            let chroma_ac_quant_scale =
                get_ac_quant(qindex, hdr.quant.delta_q_uv_ac, hdr.bit_depth);

            let mut lvl_seg = i32::from(lf.level);
            let mut lvl_lookup: [[u8; MAX_MODE_LF_DELTAS]; MAX_REF_FRAMES];

            if lvl_seg == 0 {
                lvl_lookup = Default::default()
            } else {
                if seg_feature_active(seg, segment_id, SEG_LVL_ALT_L) {
                    let data = i32::from(seg.feature_data[usize::from(segment_id)][SEG_LVL_ALT_L]);

                    lvl_seg = if seg.abs_or_delta_update {
                        data
                    } else {
                        lvl_seg + data
                    };

                    lvl_seg = lvl_seg.clamp(0, MAX_LOOP_FILTER as i32);
                }

                if !lf.delta_enabled {
                    lvl_lookup = [[lvl_seg as u8; MAX_MODE_LF_DELTAS]; MAX_REF_FRAMES]
                } else {
                    let intra_delta = i32::from(lf.ref_deltas[INTRA_FRAME]);
                    let mut intra_lvl = lvl_seg + (intra_delta << n_shift);

                    lvl_lookup = segmentation[usize::from(segment_id)].lvl_lookup;
                    lvl_lookup[INTRA_FRAME][0] =
                        intra_lvl.clamp(0, MAX_LOOP_FILTER as i32) as u8;

                    // The [0] entry is unused for the intra row; deltas only
                    // apply from LAST_FRAME on.
                    #[allow(clippy::needless_range_loop)]
                    for ref_ in LAST_FRAME..MAX_REF_FRAMES {
                        for mode in 0..MAX_MODE_LF_DELTAS {
                            let ref_delta = i32::from(lf.ref_deltas[ref_]);
                            let mode_delta = i32::from(lf.mode_deltas[mode]);

                            intra_lvl =
                                lvl_seg + (ref_delta << n_shift) + (mode_delta << n_shift);

                            lvl_lookup[ref_][mode] =
                                intra_lvl.clamp(0, MAX_LOOP_FILTER as i32) as u8;
                        }
                    }
                }
            }

            segmentation[usize::from(segment_id)] = Segmentation {
                lvl_lookup,
                luma_ac_quant_scale,
                luma_dc_quant_scale,
                chroma_ac_quant_scale,
                chroma_dc_quant_scale,
                reference_frame_enabled: seg.feature_enabled[usize::from(segment_id)]
                    [SEG_LVL_REF_FRAME],
                reference_frame: seg.feature_data[usize::from(segment_id)][SEG_LVL_REF_FRAME],
                reference_skip_enabled: seg.feature_enabled[usize::from(segment_id)]
                    [SEG_LVL_SKIP],
            }
        }
    }
}

/// A VP9 bitstream parser. Owns the state that persists across frames of
/// one elementary stream: the color configuration, the derived tile grid
/// dimensions, the carried-over loop filter and segmentation parameters,
/// and the geometry recorded per reference slot.
///
/// One `Parser` serves exactly one stream; mutating it from a second stream
/// corrupts both.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Parser {
    bit_depth: BitDepth,
    subsampling_x: bool,
    subsampling_y: bool,
    color_space: ColorSpace,
    color_range: ColorRange,

    mi_cols: u32,
    mi_rows: u32,
    sb64_cols: u32,
    sb64_rows: u32,

    lf: LoopFilterParams,
    seg: SegmentationParams,

    reference_frame_sz: [FrameSize; NUM_REF_FRAMES],
}

impl Parser {
    /// Reads an `nbits`-wide magnitude followed by a sign bit.
    fn read_signed_8(r: &mut BitReader, nbits: u8) -> ParseResult<i8> {
        let value = r.read_u8(nbits)?;
        let negative = r.read_bool()?;

        if negative {
            Ok(-(value as i8))
        } else {
            Ok(value as i8)
        }
    }

    fn parse_frame_marker(r: &mut BitReader) -> ParseResult<()> {
        let marker = r.read_u32(2)?;

        if marker != FRAME_MARKER {
            return Err(ParseError::BrokenData(format!(
                "expected frame marker {}, found {}",
                FRAME_MARKER, marker
            )));
        }

        Ok(())
    }

    fn parse_profile(r: &mut BitReader, hdr: &mut Header) -> ParseResult<()> {
        let low = r.read_u32(1)?;
        let high = r.read_u32(1)?;

        let profile = (high << 1) | low;

        if profile == 3 {
            let reserved_zero = r.read_bool()?;
            if reserved_zero {
                return Err(ParseError::InvalidValue(
                    "reserved bit set after profile 3".into(),
                ));
            }
        }

        hdr.profile = Profile::n(profile)
            .ok_or_else(|| ParseError::InvalidValue(format!("invalid profile {}", profile)))?;

        Ok(())
    }

    fn parse_frame_sync_code(r: &mut BitReader) -> ParseResult<()> {
        let sync_code = r.read_u32(24)?;

        if sync_code != SYNC_CODE {
            return Err(ParseError::BrokenData(format!(
                "expected sync code {:#x}, found {:#x}",
                SYNC_CODE, sync_code
            )));
        }

        Ok(())
    }

    fn parse_color_config(&mut self, r: &mut BitReader, hdr: &mut Header) -> ParseResult<()> {
        if matches!(hdr.profile, Profile::Profile2 | Profile::Profile3) {
            let ten_or_twelve_bit = r.read_bool()?;
            hdr.bit_depth = if ten_or_twelve_bit {
                BitDepth::Depth12
            } else {
                BitDepth::Depth10
            };
        } else {
            hdr.bit_depth = BitDepth::Depth8;
        }

        let color_space = r.read_u32(3)?;
        hdr.color_space = ColorSpace::n(color_space)
            .ok_or_else(|| ParseError::InvalidValue(format!("invalid color space {}", color_space)))?;

        if !matches!(hdr.color_space, ColorSpace::Srgb) {
            hdr.color_range = if r.read_bool()? {
                ColorRange::FullSwing
            } else {
                ColorRange::StudioSwing
            };

            if matches!(hdr.profile, Profile::Profile1 | Profile::Profile3) {
                hdr.subsampling_x = r.read_bool()?;
                hdr.subsampling_y = r.read_bool()?;

                if hdr.subsampling_x && hdr.subsampling_y {
                    return Err(ParseError::InvalidValue(
                        "4:2:0 subsampling is not allowed in profiles 1 and 3".into(),
                    ));
                }

                let reserved_zero = r.read_bool()?;
                if reserved_zero {
                    return Err(ParseError::InvalidValue(
                        "reserved bit set in color config".into(),
                    ));
                }
            } else {
                hdr.subsampling_x = true;
                hdr.subsampling_y = true;
            }
        } else {
            hdr.color_range = ColorRange::FullSwing;

            if matches!(hdr.profile, Profile::Profile1 | Profile::Profile3) {
                hdr.subsampling_x = false;
                hdr.subsampling_y = false;

                let reserved_zero = r.read_bool()?;
                if reserved_zero {
                    return Err(ParseError::InvalidValue(
                        "reserved bit set in color config".into(),
                    ));
                }
            } else {
                return Err(ParseError::InvalidValue(
                    "sRGB color space requires profile 1 or 3".into(),
                ));
            }
        }

        self.bit_depth = hdr.bit_depth;
        self.color_space = hdr.color_space;
        self.subsampling_x = hdr.subsampling_x;
        self.subsampling_y = hdr.subsampling_y;
        self.color_range = hdr.color_range;

        Ok(())
    }

    fn compute_image_size(&mut self, width: u32, height: u32) {
        self.mi_cols = (width + 7) >> 3;
        self.mi_rows = (height + 7) >> 3;
        self.sb64_cols = (self.mi_cols + 7) >> 3;
        self.sb64_rows = (self.mi_rows + 7) >> 3;
    }

    fn parse_frame_size(&mut self, r: &mut BitReader, hdr: &mut Header) -> ParseResult<()> {
        hdr.width = r.read_u32(16)? + 1;
        hdr.height = r.read_u32(16)? + 1;
        self.compute_image_size(hdr.width, hdr.height);
        Ok(())
    }

    fn parse_render_size(&mut self, r: &mut BitReader, hdr: &mut Header) -> ParseResult<()> {
        hdr.render_and_frame_size_different = r.read_bool()?;

        if hdr.render_and_frame_size_different {
            hdr.render_width = r.read_u32(16)? + 1;
            hdr.render_height = r.read_u32(16)? + 1;
        } else {
            hdr.render_width = hdr.width;
            hdr.render_height = hdr.height;
        }

        Ok(())
    }

    fn parse_frame_size_with_refs(&mut self, r: &mut BitReader, hdr: &mut Header) -> ParseResult<()> {
        let mut found_ref = false;

        for i in 0..REFS_PER_FRAME {
            found_ref = r.read_bool()?;

            if found_ref {
                let idx = usize::from(hdr.ref_frame_idx[i]);
                hdr.width = self.reference_frame_sz[idx].width;
                hdr.height = self.reference_frame_sz[idx].height;
                break;
            }
        }

        if !found_ref {
            self.parse_frame_size(r, hdr)?;
        } else {
            self.compute_image_size(hdr.width, hdr.height)
        }

        self.parse_render_size(r, hdr)
    }

    fn read_interpolation_filter(r: &mut BitReader, hdr: &mut Header) -> ParseResult<()> {
        const LITERAL_TO_TYPE: [InterpolationFilter; 4] = [
            InterpolationFilter::EightTapSmooth,
            InterpolationFilter::EightTap,
            InterpolationFilter::EightTapSharp,
            InterpolationFilter::Bilinear,
        ];

        let is_filter_switchable = r.read_bool()?;

        if is_filter_switchable {
            hdr.interpolation_filter = InterpolationFilter::Switchable;
        } else {
            let raw_interpolation_filter = r.read_u32(2)?;
            hdr.interpolation_filter = LITERAL_TO_TYPE[raw_interpolation_filter as usize];
        }

        Ok(())
    }

    /// Resets the adaptive state that key frames, intra-only frames and
    /// error-resilient frames must not inherit. Runs before the loop filter
    /// and segmentation sections so their updates apply on top of the reset
    /// baseline.
    fn setup_past_independence(&mut self, hdr: &mut Header) {
        self.seg.feature_enabled = Default::default();
        self.seg.feature_data = Default::default();
        self.seg.abs_or_delta_update = false;

        self.lf.delta_enabled = true;
        self.lf.ref_deltas[ReferenceFrameType::Intra as usize] = 1;
        self.lf.ref_deltas[ReferenceFrameType::Last as usize] = 0;
        self.lf.ref_deltas[ReferenceFrameType::Golden as usize] = -1;
        self.lf.ref_deltas[ReferenceFrameType::AltRef as usize] = -1;

        self.lf.mode_deltas = Default::default();
        hdr.ref_frame_sign_bias = Default::default();
    }

    fn parse_loop_filter_params(r: &mut BitReader, lf: &mut LoopFilterParams) -> ParseResult<()> {
        // The update flags describe this frame's bitstream only; the deltas
        // themselves carry over.
        lf.delta_update = false;
        lf.update_ref_delta = Default::default();
        lf.update_mode_delta = Default::default();

        lf.level = r.read_u8(6)?;
        lf.sharpness = r.read_u8(3)?;
        lf.delta_enabled = r.read_bool()?;

        if lf.delta_enabled {
            lf.delta_update = r.read_bool()?;

            if lf.delta_update {
                for i in 0..MAX_REF_LF_DELTAS {
                    lf.update_ref_delta[i] = r.read_bool()?;
                    if lf.update_ref_delta[i] {
                        lf.ref_deltas[i] = Self::read_signed_8(r, 6)?;
                    }
                }

                for i in 0..MAX_MODE_LF_DELTAS {
                    lf.update_mode_delta[i] = r.read_bool()?;
                    if lf.update_mode_delta[i] {
                        lf.mode_deltas[i] = Self::read_signed_8(r, 6)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn read_delta_q(r: &mut BitReader, value: &mut i8) -> ParseResult<()> {
        let delta_coded = r.read_bool()?;

        if delta_coded {
            *value = Self::read_signed_8(r, 4)?;
        } else {
            *value = 0;
        }

        Ok(())
    }

    fn parse_quantization_params(r: &mut BitReader, hdr: &mut Header) -> ParseResult<()> {
        let quant = &mut hdr.quant;

        quant.base_q_idx = r.read_u8(8)?;

        Self::read_delta_q(r, &mut quant.delta_q_y_dc)?;
        Self::read_delta_q(r, &mut quant.delta_q_uv_dc)?;
        Self::read_delta_q(r, &mut quant.delta_q_uv_ac)?;

        hdr.lossless = quant.base_q_idx == 0
            && quant.delta_q_y_dc == 0
            && quant.delta_q_uv_dc == 0
            && quant.delta_q_uv_ac == 0;

        Ok(())
    }

    fn read_prob(r: &mut BitReader) -> ParseResult<u8> {
        let prob_coded = r.read_bool()?;

        let prob = if prob_coded { r.read_u8(8)? } else { 255 };

        Ok(prob)
    }

    fn parse_segmentation_params(r: &mut BitReader, seg: &mut SegmentationParams) -> ParseResult<()> {
        const SEGMENTATION_FEATURE_BITS: [u8; SEG_LVL_MAX] = [8, 6, 2, 0];
        const SEGMENTATION_FEATURE_SIGNED: [bool; SEG_LVL_MAX] = [true, true, false, false];

        seg.update_map = false;
        seg.update_data = false;

        seg.enabled = r.read_bool()?;

        if !seg.enabled {
            return Ok(());
        }

        seg.update_map = r.read_bool()?;

        if seg.update_map {
            for i in 0..SEG_TREE_PROBS {
                seg.tree_probs[i] = Self::read_prob(r)?;
            }

            seg.temporal_update = r.read_bool()?;

            for i in 0..PREDICTION_PROBS {
                seg.pred_probs[i] = if seg.temporal_update {
                    Self::read_prob(r)?
                } else {
                    255
                };
            }
        }

        seg.update_data = r.read_bool()?;

        if seg.update_data {
            seg.abs_or_delta_update = r.read_bool()?;

            for i in 0..MAX_SEGMENTS {
                for j in 0..SEG_LVL_MAX {
                    seg.feature_enabled[i][j] = r.read_bool()?;

                    let mut feature_value = 0i16;

                    if seg.feature_enabled[i][j] {
                        let bits_to_read = SEGMENTATION_FEATURE_BITS[j];
                        if bits_to_read > 0 {
                            feature_value = r.read_u16(bits_to_read)? as i16;
                        }

                        if SEGMENTATION_FEATURE_SIGNED[j] {
                            let feature_sign = r.read_bool()?;

                            if feature_sign {
                                feature_value = -feature_value;
                            }
                        }
                    }

                    seg.feature_data[i][j] = feature_value;
                }
            }
        }

        Ok(())
    }

    fn calc_min_log2_tile_cols(sb64_cols: u32) -> u32 {
        let mut min_log2 = 0;

        while (MAX_TILE_WIDTH_B64 << min_log2) < sb64_cols {
            min_log2 += 1;
        }

        min_log2
    }

    fn calc_max_log2_tile_cols(sb64_cols: u32) -> u32 {
        let mut max_log2 = 1;

        while (sb64_cols >> max_log2) >= MIN_TILE_WIDTH_B64 {
            max_log2 += 1;
        }

        max_log2 - 1
    }

    fn parse_tile_info(&mut self, r: &mut BitReader, hdr: &mut Header) -> ParseResult<()> {
        let min_log2_tile_cols = Self::calc_min_log2_tile_cols(self.sb64_cols);
        let max_log2_tile_cols = Self::calc_max_log2_tile_cols(self.sb64_cols);

        let mut tile_cols_log2 = min_log2_tile_cols;

        while tile_cols_log2 < max_log2_tile_cols {
            let increment_tile_cols_log2 = r.read_bool()?;

            if increment_tile_cols_log2 {
                tile_cols_log2 += 1;
            } else {
                break;
            }
        }

        if tile_cols_log2 > MAX_TILE_COLS_LOG2 {
            return Err(ParseError::InvalidValue(format!(
                "tile_cols_log2 {} exceeds the maximum of {}",
                tile_cols_log2, MAX_TILE_COLS_LOG2
            )));
        }

        hdr.tile_cols_log2 = tile_cols_log2 as u8;

        hdr.tile_rows_log2 = r.read_u8(1)?;

        if hdr.tile_rows_log2 > 0 {
            let increment_tile_rows_log2 = r.read_bool()?;
            hdr.tile_rows_log2 += increment_tile_rows_log2 as u8;
        }

        Ok(())
    }

    /// Parses the uncompressed frame header at the start of `bitstream` and
    /// advances the persistent state accordingly.
    ///
    /// `bitstream` must hold exactly one frame, superframes already
    /// demultiplexed by the caller.
    pub fn parse_uncompressed_header(&mut self, bitstream: &[u8]) -> ParseResult<Header> {
        debug!("Parsing VP9 uncompressed frame header.");

        let mut r = BitReader::new(bitstream);
        let mut hdr = Header::default();

        Self::parse_frame_marker(&mut r)?;
        Self::parse_profile(&mut r, &mut hdr)?;

        hdr.show_existing_frame = r.read_bool()?;

        if hdr.show_existing_frame {
            hdr.frame_to_show_map_idx = r.read_u8(3)?;
            return Ok(hdr);
        }

        hdr.frame_type = FrameType::n(r.read_u8(1)?)
            .ok_or_else(|| ParseError::BrokenData("invalid frame type".into()))?;

        hdr.show_frame = r.read_bool()?;
        hdr.error_resilient_mode = r.read_bool()?;

        if matches!(hdr.frame_type, FrameType::KeyFrame) {
            Self::parse_frame_sync_code(&mut r)?;
            self.parse_color_config(&mut r, &mut hdr)?;
            self.parse_frame_size(&mut r, &mut hdr)?;
            self.parse_render_size(&mut r, &mut hdr)?;
            hdr.refresh_frame_flags = 0xff;
        } else {
            if !hdr.show_frame {
                hdr.intra_only = r.read_bool()?;
            }

            if !hdr.error_resilient_mode {
                hdr.reset_frame_context = r.read_u8(2)?;
            } else {
                hdr.reset_frame_context = 0;
            }

            if hdr.intra_only {
                Self::parse_frame_sync_code(&mut r)?;

                if !matches!(hdr.profile, Profile::Profile0) {
                    self.parse_color_config(&mut r, &mut hdr)?;
                } else {
                    // Profile 0 intra-only frames are 8-bit BT.601 4:2:0
                    // with studio swing.
                    hdr.color_space = ColorSpace::Bt601;
                    hdr.color_range = ColorRange::StudioSwing;
                    hdr.subsampling_x = true;
                    hdr.subsampling_y = true;
                    hdr.bit_depth = BitDepth::Depth8;

                    self.color_space = hdr.color_space;
                    self.color_range = hdr.color_range;
                    self.subsampling_x = hdr.subsampling_x;
                    self.subsampling_y = hdr.subsampling_y;
                    self.bit_depth = hdr.bit_depth;
                }

                hdr.refresh_frame_flags = r.read_u8(8)?;
                self.parse_frame_size(&mut r, &mut hdr)?;
                self.parse_render_size(&mut r, &mut hdr)?;
            } else {
                // The color configuration is never re-coded for ordinary
                // inter frames; it carries over from the last key or
                // intra-only frame.
                hdr.color_space = self.color_space;
                hdr.color_range = self.color_range;
                hdr.subsampling_x = self.subsampling_x;
                hdr.subsampling_y = self.subsampling_y;
                hdr.bit_depth = self.bit_depth;

                hdr.refresh_frame_flags = r.read_u8(8)?;

                for i in 0..REFS_PER_FRAME {
                    hdr.ref_frame_idx[i] = r.read_u8(3)?;
                    hdr.ref_frame_sign_bias[LAST_FRAME + i] = r.read_u8(1)?;
                }

                self.parse_frame_size_with_refs(&mut r, &mut hdr)?;
                hdr.allow_high_precision_mv = r.read_bool()?;
                Self::read_interpolation_filter(&mut r, &mut hdr)?;
            }
        }

        if !hdr.error_resilient_mode {
            hdr.refresh_frame_context = r.read_bool()?;
            hdr.frame_parallel_decoding_mode = r.read_bool()?;
        } else {
            hdr.refresh_frame_context = false;
            hdr.frame_parallel_decoding_mode = true;
        }

        hdr.frame_context_idx = r.read_u8(2)?;

        if hdr.frame_is_intra() || hdr.error_resilient_mode {
            self.setup_past_independence(&mut hdr);
        }

        Self::parse_loop_filter_params(&mut r, &mut self.lf)?;
        Self::parse_quantization_params(&mut r, &mut hdr)?;
        Self::parse_segmentation_params(&mut r, &mut self.seg)?;
        self.parse_tile_info(&mut r, &mut hdr)?;

        hdr.header_size_in_bytes = r.read_u16(16)?;

        if hdr.header_size_in_bytes == 0 {
            return Err(ParseError::InvalidValue(
                "a compressed header must be present".into(),
            ));
        }

        hdr.lf = self.lf.clone();
        hdr.seg = self.seg.clone();

        for i in 0..NUM_REF_FRAMES {
            let flag = 1 << i;
            if hdr.refresh_frame_flags & flag != 0 {
                self.reference_frame_sz[i].width = hdr.width;
                self.reference_frame_sz[i].height = hdr.height;
            }
        }

        hdr.uncompressed_header_size_in_bytes = ((r.position() + 7) / 8) as u16;

        Ok(hdr)
    }

    /// Parses one whole frame: the uncompressed header, then the compressed
    /// header over the byte range the former declares.
    pub fn parse_frame<'a>(&mut self, bitstream: &'a [u8]) -> ParseResult<Frame<'a>> {
        let mut header = self.parse_uncompressed_header(bitstream)?;

        if header.show_existing_frame {
            return Ok(Frame { bitstream, header });
        }

        let offset = usize::from(header.uncompressed_header_size_in_bytes);
        let compressed = bitstream.get(offset..).ok_or_else(|| {
            ParseError::BrokenData(format!(
                "frame of {} bytes ends before the compressed header at offset {}",
                bitstream.len(),
                offset
            ))
        })?;

        self.parse_compressed_header(&mut header, compressed)?;

        Ok(Frame { bitstream, header })
    }
}
