/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The solver registry: a shared graph of all vertices currently being
//! processed. Every vertex being solved is first loaded into the registry
//! under a job; node operations are invoked and progress tracked through
//! jobs.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use dupe::Dupe;
use forge_progress::ChannelWriter;
use forge_progress::ProgressReader;
use forge_progress::Writer;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::api::cache::CacheManager;
use crate::api::op::CallFn;
use crate::api::op::ResolveOpFn;
use crate::api::output::CachedResult;
use crate::api::vertex::Edge;
use crate::api::vertex::Vertex;
use crate::api::vertex::VertexOptions;
use crate::cache::InMemoryCacheManager;
use crate::ctx::BuildContext;
use crate::digest::ContentDigest;
use crate::error::SolverError;
use crate::error::SolverResult;
use crate::progress::in_vertex_context;
use crate::progress::ClientVertex;
use crate::scheduler::Scheduler;
use crate::scheduler::SchedulerFactory;
use crate::scheduler::SolverEdge;
use crate::state::NodeState;
use crate::HashMap;

/// How long `get` waits for a racing `new_job` before giving up.
const JOB_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

pub struct SolverOpt {
    pub resolve_op: ResolveOpFn,
    /// Main cache for every node. Defaults to an in-memory manager.
    pub default_cache: Option<Arc<dyn CacheManager>>,
    pub scheduler: SchedulerFactory,
}

/// The solver registry. Owns the table of active node states, merged
/// across jobs, and the jobs themselves.
pub struct Solver {
    pub(crate) shared: RwLock<SolverShared>,
    resolve_op: ResolveOpFn,
    default_cache: Arc<dyn CacheManager>,
    scheduler: Arc<dyn Scheduler>,
    job_added: Notify,
}

#[derive(Default)]
pub(crate) struct SolverShared {
    pub(crate) jobs: HashMap<String, Arc<Job>>,
    pub(crate) actives: HashMap<ContentDigest, Arc<NodeState>>,
}

impl Solver {
    pub fn new(opts: SolverOpt) -> Arc<Self> {
        let default_cache = opts
            .default_cache
            .unwrap_or_else(|| Arc::new(InMemoryCacheManager::new()));
        let scheduler_factory = opts.scheduler;
        Arc::new_cyclic(|solver: &Weak<Solver>| Self {
            shared: RwLock::new(SolverShared::default()),
            resolve_op: opts.resolve_op,
            default_cache,
            scheduler: scheduler_factory(solver.clone()),
            job_added: Notify::new(),
        })
    }

    pub fn new_job(self: &Arc<Self>, id: &str) -> SolverResult<Arc<Job>> {
        let job = {
            let mut shared = self.shared.write();
            if shared.jobs.contains_key(id) {
                return Err(SolverError::duplicate_job_id(id));
            }

            let (pw, pr) = forge_progress::channel();
            let job = Arc::new(Job {
                id: id.to_owned(),
                solver: Arc::downgrade(self),
                pw,
                pr: Mutex::new(Some(pr)),
                session_id: RwLock::new(String::new()),
            });
            shared.jobs.insert(id.to_owned(), job.dupe());
            job
        };

        self.job_added.notify_waiters();
        Ok(job)
    }

    /// Look up a job, waiting out a racing `new_job` up to the deadline.
    pub async fn get(&self, id: &str) -> SolverResult<Arc<Job>> {
        let deadline = tokio::time::Instant::now() + JOB_LOOKUP_TIMEOUT;
        loop {
            // arm the wakeup before checking so an insert cannot be missed
            let mut job_added = std::pin::pin!(self.job_added.notified());
            job_added.as_mut().enable();
            if let Some(job) = self.shared.read().jobs.get(id) {
                return Ok(job.dupe());
            }
            if tokio::time::timeout_at(deadline, job_added).await.is_err() {
                return Err(SolverError::no_such_job(id));
            }
        }
    }

    pub fn get_edge(&self, edge: &Edge) -> Option<Arc<SolverEdge>> {
        let shared = self.shared.read();
        let state = shared.actives.get(&edge.vertex.digest())?.dupe();
        Some(state.get_edge(edge.index))
    }

    pub fn set_edge(&self, edge: &Edge, new_edge: Arc<SolverEdge>) {
        let shared = self.shared.read();
        if let Some(state) = shared.actives.get(&edge.vertex.digest()) {
            state.set_edge(edge.index, new_edge);
        }
    }

    /// Shuts the scheduler down. Jobs are not discarded; callers own that.
    pub fn close(&self) {
        self.scheduler.stop();
    }

    pub(crate) fn active_state(&self, digest: &ContentDigest) -> Option<Arc<NodeState>> {
        self.shared.read().actives.get(digest).map(Dupe::dupe)
    }

    /// Build requested from inside an op's exec, attributed to the
    /// requesting vertex so the new subgraph is linked as its children.
    pub(crate) async fn sub_build(
        self: &Arc<Self>,
        ctx: &BuildContext,
        mut edge: Edge,
        parent: Arc<dyn Vertex>,
    ) -> SolverResult<CachedResult> {
        edge.vertex = self.load(&edge.vertex, Some(&parent), None)?;
        self.scheduler.build(ctx, edge).await
    }

    /// Load the graph rooted at `vertex` into the registry. Synchronous
    /// and entirely under the writer lock; never suspends.
    pub(crate) fn load(
        self: &Arc<Self>,
        vertex: &Arc<dyn Vertex>,
        parent: Option<&Arc<dyn Vertex>>,
        job: Option<&Arc<Job>>,
    ) -> SolverResult<Arc<dyn Vertex>> {
        let mut shared = self.shared.write();
        // memoized per incoming vertex identity to handle shared inputs
        let mut loaded = HashMap::default();
        self.load_locked(&mut shared, vertex, parent, job, &mut loaded)
    }

    fn load_locked(
        self: &Arc<Self>,
        shared: &mut SolverShared,
        vertex: &Arc<dyn Vertex>,
        parent: Option<&Arc<dyn Vertex>>,
        job: Option<&Arc<Job>>,
        loaded: &mut HashMap<usize, Arc<dyn Vertex>>,
    ) -> SolverResult<Arc<dyn Vertex>> {
        let vertex_key = Arc::as_ptr(vertex) as *const () as usize;
        if let Some(v) = loaded.get(&vertex_key) {
            return Ok(v.dupe());
        }

        let mut inputs = Vec::with_capacity(vertex.inputs().len());
        for input in vertex.inputs() {
            let v = self.load_locked(shared, &input.vertex, parent, job, loaded)?;
            inputs.push(Edge {
                vertex: v,
                index: input.index,
            });
        }

        let mut digest = vertex.digest();
        let digest_without_cache =
            ContentDigest::from_bytes(format!("{}-ignorecache", digest).as_bytes());

        if shared.actives.contains_key(&digest_without_cache) {
            // the same vertex is already loaded without cache; use that
            digest = digest_without_cache;
        } else if let Some(existing) = shared.actives.get(&digest) {
            // !ignore_cache merges with ignore_cache, but ignore_cache must
            // not merge with !ignore_cache: re-key to keep the cached node
            // clean
            if !existing.vertex().options().ignore_cache && vertex.options().ignore_cache {
                digest = digest_without_cache;
            }
        }

        let effective: Arc<dyn Vertex> = Arc::new(VertexWithCacheOptions {
            inner: vertex.dupe(),
            digest,
            inputs,
        });

        let state = match shared.actives.get(&digest).map(Dupe::dupe) {
            Some(state) => state,
            None => {
                let state = NodeState::new(
                    effective.dupe(),
                    self.default_cache.dupe(),
                    Arc::downgrade(self),
                    self.resolve_op.dupe(),
                );
                shared.actives.insert(digest, state.dupe());
                state
            }
        };

        {
            let mut inner = state.inner.lock();
            if let Some(cache_source) = &vertex.options().cache_source {
                if cache_source.id() != state.main_cache.id() {
                    inner
                        .cache
                        .insert(cache_source.id().to_owned(), cache_source.dupe());
                }
            }
            if let Some(job) = job {
                inner
                    .jobs
                    .entry(job.id().to_owned())
                    .or_insert_with(|| job.dupe());
            }
        }

        if let Some(parent) = parent {
            let parent_digest = parent.digest();
            if !state.parents.lock().contains(&parent_digest) {
                let parent_state = shared
                    .actives
                    .get(&parent_digest)
                    .ok_or_else(|| SolverError::inactive_parent(parent_digest))?
                    .dupe();
                state.parents.lock().insert(parent_digest);
                parent_state.children.lock().insert(digest);

                // the subgraph consults every cache its ancestors brought in
                let parent_extras: Vec<(String, Arc<dyn CacheManager>)> = parent_state
                    .inner
                    .lock()
                    .cache
                    .iter()
                    .map(|(id, cache)| (id.clone(), cache.dupe()))
                    .collect();
                let mut inner = state.inner.lock();
                for (id, cache) in parent_extras {
                    inner.cache.insert(id, cache);
                }
            }
        }

        self.connect_progress_from_state(shared, &state, &state);
        loaded.insert(vertex_key, effective.dupe());
        Ok(effective)
    }

    /// Attach the progress writer of every job referencing `src` (or an
    /// ancestor of `src`) to `target`, emitting the current snapshot on
    /// first attach.
    fn connect_progress_from_state(
        &self,
        shared: &SolverShared,
        target: &Arc<NodeState>,
        src: &Arc<NodeState>,
    ) {
        let src_jobs: Vec<Arc<Job>> = src.inner.lock().jobs.values().map(Dupe::dupe).collect();
        for job in src_jobs {
            let pw = job.pw.dupe();
            let newly_attached = target.inner.lock().all_pw.insert(pw.id());
            if newly_attached {
                target.mpw.add(pw.dupe() as Arc<dyn Writer<ClientVertex>>);
                let snapshot = target.client_vertex.lock().clone();
                pw.write(snapshot);
            }
        }

        let src_parents: Vec<ContentDigest> = src.parents.lock().iter().copied().collect();
        for parent in src_parents {
            if let Some(parent_state) = shared.actives.get(&parent) {
                self.connect_progress_from_state(shared, target, parent_state);
            }
        }
    }

    /// Requires the writer lock. A state with no referents and no parents
    /// is torn down; children are unlinked and collected in cascade.
    fn delete_if_unreferenced(
        shared: &mut SolverShared,
        digest: ContentDigest,
        state: &Arc<NodeState>,
    ) {
        let referenced = !state.inner.lock().jobs.is_empty() || !state.parents.lock().is_empty();
        if referenced {
            return;
        }

        let children: Vec<ContentDigest> = state.children.lock().iter().copied().collect();
        for child in children {
            if let Some(child_state) = shared.actives.get(&child).map(Dupe::dupe) {
                child_state.parents.lock().remove(&digest);
                Self::delete_if_unreferenced(shared, child, &child_state);
            }
        }
        state.release();
        shared.actives.remove(&digest);
    }
}

/// Client handle into the registry: binds a progress stream and session
/// identity to the subgraphs it loads.
#[derive(Debug)]
pub struct Job {
    id: String,
    solver: Weak<Solver>,
    pw: Arc<ChannelWriter<ClientVertex>>,
    pr: Mutex<Option<ProgressReader<ClientVertex>>>,
    session_id: RwLock<String>,
}

impl Job {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> String {
        self.session_id.read().clone()
    }

    pub fn set_session_id(&self, session_id: &str) {
        *self.session_id.write() = session_id.to_owned();
    }

    /// The reader half of this job's progress pipe. Yields `None` after the
    /// first call.
    pub fn take_progress_reader(&self) -> Option<ProgressReader<ClientVertex>> {
        self.pr.lock().take()
    }

    pub(crate) fn progress_writer_id(&self) -> forge_progress::WriterId {
        self.pw.id()
    }

    pub async fn build(self: &Arc<Self>, ctx: &BuildContext, mut edge: Edge) -> SolverResult<CachedResult> {
        let solver = self.solver.upgrade().ok_or_else(SolverError::shut_down)?;
        edge.vertex = solver.load(&edge.vertex, None, Some(self))?;
        solver.scheduler.build(ctx, edge).await
    }

    pub async fn call(&self, ctx: &BuildContext, name: &str, f: CallFn) -> SolverResult<()> {
        let ctx = ctx.with_progress(self.pw.dupe() as Arc<dyn Writer<ClientVertex>>);
        in_vertex_context(ctx, name, f).await
    }

    /// Drop this job from the registry: removed from every node's
    /// referents and fan-out, collecting states that lose their last
    /// reference. The progress writer is closed after the registry lock is
    /// released so a slow sink cannot stall other jobs.
    pub fn discard(&self) -> SolverResult<()> {
        if let Some(solver) = self.solver.upgrade() {
            let mut shared = solver.shared.write();
            shared.jobs.remove(&self.id);

            let entries: Vec<(ContentDigest, Arc<NodeState>)> = shared
                .actives
                .iter()
                .map(|(digest, state)| (*digest, state.dupe()))
                .collect();
            for (digest, state) in entries {
                let was_referent = {
                    let mut inner = state.inner.lock();
                    let was_referent = inner.jobs.remove(&self.id).is_some();
                    if inner.all_pw.remove(&self.pw.id()) {
                        state.mpw.remove(self.pw.id());
                    }
                    was_referent
                };
                if was_referent {
                    Solver::delete_if_unreferenced(&mut shared, digest, &state);
                }
            }
        }

        self.pw.close();
        Ok(())
    }
}

/// Wraps a loaded vertex so later `digest()` and `inputs()` calls observe
/// the effective identity chosen by the cache-policy merge rule.
struct VertexWithCacheOptions {
    inner: Arc<dyn Vertex>,
    digest: ContentDigest,
    inputs: Vec<Edge>,
}

impl Vertex for VertexWithCacheOptions {
    fn digest(&self) -> ContentDigest {
        self.digest
    }

    fn inputs(&self) -> Vec<Edge> {
        self.inputs.clone()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn options(&self) -> &VertexOptions {
        self.inner.options()
    }
}
