// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod bool_decoder;
pub mod compressed_header;
pub mod lookups;
pub mod parser;
