/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use dupe::Dupe;
use forge_progress::Writer;

use crate::api::op::CallFn;
use crate::api::vertex::Vertex;
use crate::ctx::BuildContext;
use crate::digest::ContentDigest;
use crate::error::SolverError;
use crate::error::SolverResult;

/// Client-facing snapshot of one graph node's lifecycle, published to
/// every attached progress writer on attachment and on state transitions.
#[derive(Clone, Debug)]
pub struct ClientVertex {
    pub digest: ContentDigest,
    pub name: String,
    pub inputs: Vec<ContentDigest>,
    pub started: Option<SystemTime>,
    pub completed: Option<SystemTime>,
    pub cached: bool,
    pub error: Option<String>,
}

impl ClientVertex {
    pub(crate) fn new(vertex: &dyn Vertex) -> Self {
        Self {
            digest: vertex.digest(),
            name: vertex.name().to_owned(),
            inputs: vertex.inputs().iter().map(|e| e.vertex.digest()).collect(),
            started: None,
            completed: None,
            cached: false,
            error: None,
        }
    }
}

pub(crate) fn notify_started(pw: &dyn Writer<ClientVertex>, v: &mut ClientVertex, cached: bool) {
    v.started = Some(SystemTime::now());
    v.completed = None;
    v.cached = cached;
    pw.write(v.clone());
}

pub(crate) fn notify_completed(
    pw: &dyn Writer<ClientVertex>,
    v: &mut ClientVertex,
    error: Option<String>,
    cached: bool,
) {
    let now = SystemTime::now();
    if v.started.is_none() {
        v.started = Some(now);
    }
    v.completed = Some(now);
    v.cached = cached;
    v.error = error;
    pw.write(v.clone());
}

/// Runs `f` as a synthetic vertex: a fresh client vertex bracketed by
/// started/completed events on the context's progress writer.
pub(crate) async fn in_vertex_context(
    ctx: BuildContext,
    name: &str,
    f: CallFn,
) -> SolverResult<()> {
    static NEXT_CALL: AtomicU64 = AtomicU64::new(0);
    let call = NEXT_CALL.fetch_add(1, Ordering::Relaxed);
    let digest = ContentDigest::from_bytes(format!("call-{}-{}", call, name).as_bytes());

    let mut vertex = ClientVertex {
        digest,
        name: name.to_owned(),
        inputs: Vec::new(),
        started: None,
        completed: None,
        cached: false,
        error: None,
    };

    let pw = ctx.progress().map(Dupe::dupe);
    if let Some(pw) = &pw {
        notify_started(&**pw, &mut vertex, false);
    }
    let res = f(ctx).await;
    if let Some(pw) = &pw {
        notify_completed(
            &**pw,
            &mut vertex,
            res.as_ref().err().map(|err| format!("{:#}", err)),
            false,
        );
    }
    res.map_err(SolverError::op)
}
