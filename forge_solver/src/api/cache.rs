/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use allocative::Allocative;
use async_trait::async_trait;
use derive_more::Display;
use dupe::Dupe;

use crate::api::output::SharedOutput;
use crate::api::vertex::Index;
use crate::ctx::BuildContext;
use crate::digest::ContentDigest;

/// Content-addressed key of one vertex output. Also the unit handed to
/// external cache exporters.
#[derive(Clone, Dupe, Copy, Debug, Display, PartialEq, Eq, Hash, Allocative)]
#[display("{}#{}", digest, output)]
pub struct CacheKey {
    pub digest: ContentDigest,
    pub output: Index,
}

/// Pointer to a stored result inside a particular cache manager.
#[derive(Clone, Debug)]
pub struct CacheRecord {
    pub id: String,
    /// Identity of the manager that produced the record, used to route the
    /// load back to it when managers are combined.
    pub cache_id: String,
}

#[async_trait]
pub trait CacheManager: Send + Sync {
    fn id(&self) -> &str;

    async fn load(
        &self,
        ctx: &BuildContext,
        record: &CacheRecord,
    ) -> anyhow::Result<SharedOutput>;
}
