// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A stateful VP9 frame-header parser.
//!
//! [`codec::vp9::parser::Parser`] extracts the uncompressed and compressed
//! frame headers of a VP9 elementary stream while maintaining the
//! cross-frame state the format requires: reference-slot geometry,
//! segmentation and loop-filter carryover, and the color configuration
//! established by the last key or intra-only frame.
//!
//! The parser recovers header semantics only. Pixel reconstruction,
//! superframe demultiplexing and container handling belong to the caller.

pub mod bitstream_utils;
pub mod codec;
