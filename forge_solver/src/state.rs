/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Per-node shared state: referents, graph links, edges, caches and
//! progress fan-out for one merged graph node.

use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use dupe::Dupe;
use forge_progress::MultiWriter;
use forge_progress::Writer;
use forge_progress::WriterId;
use parking_lot::Mutex;

use crate::api::cache::CacheKey;
use crate::api::cache::CacheManager;
use crate::api::op::Builder;
use crate::api::op::CallFn;
use crate::api::op::ResolveOpFn;
use crate::api::output::CachedResult;
use crate::api::vertex::Edge;
use crate::api::vertex::Index;
use crate::api::vertex::Vertex;
use crate::cache::CombinedCacheManager;
use crate::ctx::BuildContext;
use crate::digest::ContentDigest;
use crate::error::SolverError;
use crate::error::SolverResult;
use crate::jobs::Job;
use crate::jobs::Solver;
use crate::progress::in_vertex_context;
use crate::progress::notify_completed;
use crate::progress::notify_started;
use crate::progress::ClientVertex;
use crate::scheduler::SolverEdge;
use crate::shared_op::SharedOp;
use crate::HashMap;
use crate::HashSet;

/// One merged graph node. Owned exclusively by the registry's actives
/// table; everything else holds weak or digest references.
pub(crate) struct NodeState {
    /// The effective vertex: digest and inputs reflect the identity this
    /// node was entered into the actives table under.
    vertex: Arc<dyn Vertex>,
    pub(crate) client_vertex: Mutex<ClientVertex>,
    pub(crate) mpw: Arc<MultiWriter<ClientVertex>>,
    pub(crate) main_cache: Arc<dyn CacheManager>,
    pub(crate) solver: Weak<Solver>,
    resolve_op: ResolveOpFn,

    pub(crate) inner: Mutex<NodeStateInner>,

    /// Digest back-links for GC and progress/cache inheritance. Mutated
    /// only while the registry writer lock is held.
    pub(crate) parents: Mutex<HashSet<ContentDigest>>,
    pub(crate) children: Mutex<HashSet<ContentDigest>>,
}

#[derive(Default)]
pub(crate) struct NodeStateInner {
    /// Jobs directly requesting this node, by job id.
    pub(crate) jobs: HashMap<String, Arc<Job>>,
    /// Extra caches registered from this node's or an ancestor's
    /// `cache_source`, by manager id.
    pub(crate) cache: HashMap<String, Arc<dyn CacheManager>>,
    /// Witness set of writers already attached to `mpw`.
    pub(crate) all_pw: HashSet<WriterId>,
    pub(crate) edges: HashMap<Index, Arc<SolverEdge>>,
    pub(crate) op: Option<Arc<SharedOp>>,
}

impl NodeState {
    pub(crate) fn new(
        vertex: Arc<dyn Vertex>,
        main_cache: Arc<dyn CacheManager>,
        solver: Weak<Solver>,
        resolve_op: ResolveOpFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_vertex: Mutex::new(ClientVertex::new(&*vertex)),
            mpw: Arc::new(MultiWriter::new()),
            main_cache,
            solver,
            resolve_op,
            inner: Mutex::new(NodeStateInner::default()),
            parents: Mutex::new(HashSet::default()),
            children: Mutex::new(HashSet::default()),
            vertex,
        })
    }

    pub(crate) fn vertex(&self) -> &Arc<dyn Vertex> {
        &self.vertex
    }

    pub(crate) fn digest(&self) -> ContentDigest {
        self.vertex.digest()
    }

    /// First non-empty session id among direct referents, then among
    /// ancestors. No lock is held while another is taken: the referent scan
    /// drops the state lock before parents are dereferenced through the
    /// registry.
    pub(crate) fn get_session_id(&self) -> Option<String> {
        let mut visited = HashSet::default();
        self.get_session_id_impl(&mut visited)
    }

    fn get_session_id_impl(&self, visited: &mut HashSet<ContentDigest>) -> Option<String> {
        visited.insert(self.digest());

        {
            let inner = self.inner.lock();
            for job in inner.jobs.values() {
                let session_id = job.session_id();
                if !session_id.is_empty() {
                    return Some(session_id);
                }
            }
        }
        let parents: Vec<ContentDigest> = self.parents.lock().iter().copied().collect();

        let solver = self.solver.upgrade()?;
        for parent in parents {
            if visited.contains(&parent) {
                continue;
            }
            let parent_state = solver.active_state(&parent);
            if let Some(parent_state) = parent_state {
                if let Some(session_id) = parent_state.get_session_id_impl(visited) {
                    return Some(session_id);
                }
            }
        }
        None
    }

    pub(crate) fn builder(self: &Arc<Self>) -> Arc<SubBuilder> {
        Arc::new(SubBuilder {
            state: Arc::downgrade(self),
            exporters: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn get_edge(self: &Arc<Self>, index: Index) -> Arc<SolverEdge> {
        let mut inner = self.inner.lock();
        if let Some(edge) = inner.edges.get(&index) {
            return edge.dupe();
        }

        let op = match inner.op.as_ref().map(Dupe::dupe) {
            Some(op) => op,
            None => {
                let op = SharedOp::new(self, self.resolve_op.dupe());
                inner.op = Some(op.dupe());
                op
            }
        };

        let edge = SolverEdge::new(
            Edge {
                vertex: self.vertex.dupe(),
                index,
            },
            op,
        );
        inner.edges.insert(index, edge.dupe());
        edge
    }

    /// Install the scheduler's edge for `index`, releasing any previously
    /// installed one. Idempotent when `new_edge` is already installed.
    pub(crate) fn set_edge(&self, index: Index, new_edge: Arc<SolverEdge>) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.edges.get(&index) {
            if Arc::ptr_eq(existing, &new_edge) {
                return;
            }
            existing.release();
        }

        new_edge.increment_reference_count();
        inner.edges.insert(index, new_edge);
    }

    pub(crate) fn combined_cache_manager(&self) -> Arc<dyn CacheManager> {
        let extras: Vec<Arc<dyn CacheManager>> = {
            let inner = self.inner.lock();
            inner.cache.values().map(Dupe::dupe).collect()
        };

        if extras.is_empty() {
            return self.main_cache.dupe();
        }

        let mut managers = Vec::with_capacity(extras.len() + 1);
        managers.push(self.main_cache.dupe());
        managers.extend(extras);
        Arc::new(CombinedCacheManager::new(managers, self.main_cache.dupe()))
    }

    pub(crate) fn notify_started(&self, cached: bool) {
        let mut client_vertex = self.client_vertex.lock();
        notify_started(&*self.mpw, &mut client_vertex, cached);
    }

    pub(crate) fn notify_completed(&self, error: Option<String>, cached: bool) {
        let mut client_vertex = self.client_vertex.lock();
        notify_completed(&*self.mpw, &mut client_vertex, error, cached);
    }

    /// Releases every per-index edge and the shared operation, dropping its
    /// cached execution outputs. Scheduler-held edge handles survive but no
    /// longer pin results.
    pub(crate) fn release(&self) {
        let mut inner = self.inner.lock();
        for (_, edge) in inner.edges.drain() {
            edge.release();
        }
        if let Some(op) = inner.op.take() {
            op.release();
        }
    }
}

/// The [`Builder`] capability handed to this node's op. Sub-builds are
/// recorded as parent/child links in the registry and their cache keys are
/// accumulated for the exec exporter snapshot.
pub(crate) struct SubBuilder {
    state: Weak<NodeState>,
    exporters: Mutex<Vec<CacheKey>>,
}

impl SubBuilder {
    fn state(&self) -> SolverResult<Arc<NodeState>> {
        self.state.upgrade().ok_or_else(SolverError::shut_down)
    }

    pub(crate) fn exporters_snapshot(&self) -> Vec<CacheKey> {
        self.exporters.lock().clone()
    }
}

#[async_trait]
impl Builder for SubBuilder {
    async fn build(&self, ctx: &BuildContext, edge: Edge) -> SolverResult<CachedResult> {
        let state = self.state()?;
        let solver = state.solver.upgrade().ok_or_else(SolverError::shut_down)?;
        let res = solver.sub_build(ctx, edge, state.vertex().dupe()).await?;
        self.exporters.lock().push(res.cache_key.dupe());
        Ok(res)
    }

    async fn call(&self, ctx: &BuildContext, name: &str, f: CallFn) -> SolverResult<()> {
        let state = self.state()?;
        let ctx = ctx.with_progress(state.mpw.dupe() as Arc<dyn Writer<ClientVertex>>);
        in_vertex_context(ctx, name, f).await
    }
}
