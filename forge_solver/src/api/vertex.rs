/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use dupe::Dupe;

use crate::api::cache::CacheManager;
use crate::digest::ContentDigest;

/// Selects one output of a vertex.
pub type Index = usize;

/// A node descriptor in the build graph. Implementations are provided by
/// the frontend producing the graph; the solver only reads them.
///
/// `digest` must be a content digest: two vertices with equal digests are
/// merged into one shared node.
pub trait Vertex: Send + Sync {
    fn digest(&self) -> ContentDigest;

    fn inputs(&self) -> Vec<Edge>;

    /// Human-readable name surfaced through progress and tracing.
    fn name(&self) -> &str;

    fn options(&self) -> &VertexOptions;
}

#[derive(Default)]
pub struct VertexOptions {
    /// Skip cache lookups for this vertex. Affects node identity: see the
    /// one-way merge rule in the registry's loader.
    pub ignore_cache: bool,
    /// Additional cache to consult for this vertex and, transitively, its
    /// subgraph.
    pub cache_source: Option<Arc<dyn CacheManager>>,
}

/// One output of one vertex. Equality is structural: `(digest, index)`.
#[derive(Clone, Dupe)]
pub struct Edge {
    pub vertex: Arc<dyn Vertex>,
    pub index: Index,
}

impl PartialEq for Edge {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.vertex.digest() == other.vertex.digest()
    }
}

impl Eq for Edge {}

impl Hash for Edge {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.vertex.digest().hash(state);
        self.index.hash(state);
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("vertex", &self.vertex.digest())
            .field("index", &self.index)
            .finish()
    }
}
