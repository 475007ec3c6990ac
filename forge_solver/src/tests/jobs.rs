/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use dupe::Dupe;
use futures::FutureExt;

use crate::api::vertex::Edge;
use crate::ctx::BuildContext;
use crate::error::SolverErrorKind;
use crate::scheduler::SolverEdge;
use crate::tests::fixtures::edge;
use crate::tests::fixtures::TestSetup;
use crate::tests::fixtures::TestVertex;

#[tokio::test]
async fn duplicate_job_id_is_rejected() {
    let setup = TestSetup::new();
    setup.solver.new_job("job-a").unwrap();

    let err = setup.solver.new_job("job-a").unwrap_err();
    assert_matches!(&*err.0, SolverErrorKind::DuplicateJobId(..));
}

#[tokio::test(start_paused = true)]
async fn get_waits_for_a_racing_new_job() {
    let setup = TestSetup::new();
    let solver = setup.solver.dupe();

    tokio::spawn({
        let solver = solver.dupe();
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            solver.new_job("late").unwrap();
        }
    });

    let job = solver.get("late").await.unwrap();
    assert_eq!(job.id(), "late");
}

#[tokio::test(start_paused = true)]
async fn get_gives_up_after_the_deadline() {
    let setup = TestSetup::new();
    let err = setup.solver.get("missing").await.unwrap_err();
    assert_matches!(&*err.0, SolverErrorKind::NoSuchJob(..));
}

#[tokio::test]
async fn new_job_then_discard_is_a_round_trip() {
    let setup = TestSetup::new();
    let job = setup.solver.new_job("job-a").unwrap();
    let ctx = BuildContext::background();
    let res = job.build(&ctx, edge(TestVertex::new("A").arc())).await.unwrap();

    drop(res);
    job.discard().unwrap();

    assert!(setup.active_digests().is_empty());
    assert!(setup.solver.shared.read().jobs.is_empty());
}

#[tokio::test]
async fn set_edge_round_trip_without_double_release() {
    let setup = TestSetup::new();
    let job = setup.solver.new_job("job-a").unwrap();
    let ctx = BuildContext::background();
    job.build(&ctx, edge(TestVertex::new("A").arc())).await.unwrap();

    let lookup = Edge {
        vertex: TestVertex::new("A").arc(),
        index: 0,
    };
    let installed = setup.solver.get_edge(&lookup).unwrap();
    assert_eq!(installed.reference_count(), 1);

    let replacement = SolverEdge::new(installed.edge().dupe(), installed.op().dupe());
    setup.solver.set_edge(&lookup, replacement.dupe());

    let current = setup.solver.get_edge(&lookup).unwrap();
    assert!(Arc::ptr_eq(&current, &replacement));
    assert_eq!(replacement.reference_count(), 2);
    assert_eq!(installed.reference_count(), 0);

    // re-installing the same edge neither releases nor re-references
    setup.solver.set_edge(&lookup, replacement.dupe());
    assert_eq!(replacement.reference_count(), 2);
}

#[tokio::test]
async fn call_runs_inside_a_synthetic_vertex() {
    let setup = TestSetup::new();
    let job = setup.solver.new_job("job-a").unwrap();
    let mut reader = job.take_progress_reader().unwrap();
    let ctx = BuildContext::background();

    job.call(&ctx, "prepare-context", Box::new(|_ctx| async { Ok(()) }.boxed()))
        .await
        .unwrap();

    let events = reader.drain();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].name, "prepare-context");
    assert_eq!(events[0].digest, events[1].digest);
    assert!(events[0].started.is_some() && events[0].completed.is_none());
    assert!(events[1].completed.is_some());
    assert!(events[1].error.is_none());
}

#[tokio::test]
async fn failing_call_reports_the_error() {
    let setup = TestSetup::new();
    let job = setup.solver.new_job("job-a").unwrap();
    let mut reader = job.take_progress_reader().unwrap();
    let ctx = BuildContext::background();

    let err = job
        .call(
            &ctx,
            "prepare-context",
            Box::new(|_ctx| async { Err(anyhow::anyhow!("setup went sideways")) }.boxed()),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("setup went sideways"));

    let events = reader.drain();
    assert_eq!(events.len(), 2);
    assert_matches!(&events[1].error, Some(msg) => assert!(msg.contains("setup went sideways")));
}
