/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::fmt::Debug;
use std::sync::Arc;

use dupe::Dupe;

use crate::api::cache::CacheKey;

/// Concrete result of executing one vertex output. Implementations own
/// whatever resources back the result and release them in `Drop`.
pub trait Output: Debug + Send + Sync + 'static {
    /// Stable identity of the underlying result.
    fn id(&self) -> &str;
}

/// Reference-counted handle over an [`Output`]. Clones are independent
/// views handed to separate observers; the output is dropped when the last
/// handle goes, so releasing one observer's clones never invalidates
/// another's.
#[derive(Clone, Dupe, Debug)]
pub struct SharedOutput {
    inner: Arc<dyn Output>,
}

impl SharedOutput {
    pub fn new(output: Box<dyn Output>) -> Self {
        Self {
            inner: Arc::from(output),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// Whether two handles view the same underlying output.
    pub fn ptr_eq(&self, other: &SharedOutput) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A result together with the cache key it is addressed by.
#[derive(Clone, Dupe, Debug)]
pub struct CachedResult {
    pub output: SharedOutput,
    pub cache_key: CacheKey,
}
