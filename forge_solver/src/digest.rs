/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::fmt;

use allocative::Allocative;
use dupe::Dupe;
use thiserror::Error;

/// The number of bytes in a content digest.
pub const DIGEST_SIZE: usize = blake3::OUT_LEN;

/// Blake3 content digest identifying one graph node. The registry keys its
/// active-node table by this.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Allocative)]
pub struct ContentDigest([u8; DIGEST_SIZE]);

// We consider copying 32 bytes cheap enough not to qualify for Dupe
impl Dupe for ContentDigest {}

impl ContentDigest {
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn parse(data: &str) -> Result<Self, ContentDigestParseError> {
        let mut raw = [0; DIGEST_SIZE];
        hex::decode_to_slice(data, &mut raw).map_err(ContentDigestParseError::InvalidHex)?;
        Ok(Self(raw))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[derive(Error, Debug)]
pub enum ContentDigestParseError {
    #[error("Invalid hex digest: {0}")]
    InvalidHex(hex::FromHexError),
}
