/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dupe::Dupe;
use tokio::sync::Notify;

use crate::api::cache::CacheKey;
use crate::ctx::BuildContext;
use crate::digest::ContentDigest;
use crate::tests::fixtures::assert_invariants;
use crate::tests::fixtures::edge;
use crate::tests::fixtures::wait_until;
use crate::tests::fixtures::OpConfig;
use crate::tests::fixtures::TestSetup;
use crate::tests::fixtures::TestVertex;

#[tokio::test]
async fn merge_across_jobs() {
    let setup = TestSetup::new();
    let tracker = setup.tracker("A");

    let job_a = setup.solver.new_job("job-a").unwrap();
    let job_b = setup.solver.new_job("job-b").unwrap();
    let ctx = BuildContext::background();

    // distinct vertex instances, identical digest: one shared node
    let (res_a, res_b) = tokio::join!(
        job_a.build(&ctx, edge(TestVertex::new("A").arc())),
        job_b.build(&ctx, edge(TestVertex::new("A").arc())),
    );
    let res_a = res_a.unwrap();
    let res_b = res_b.unwrap();

    let digest = ContentDigest::from_bytes(b"A");
    assert_eq!(setup.active_digests(), vec![digest]);
    assert_eq!(tracker.cache_map_calls.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.exec_calls.load(Ordering::SeqCst), 1);
    assert!(res_a.output.ptr_eq(&res_b.output));
    assert_eq!(setup.referent_ids(digest), ["job-a", "job-b"]);
    assert_invariants(&setup.solver);

    job_a.discard().unwrap();
    assert_eq!(setup.referent_ids(digest), ["job-b"]);
    assert_invariants(&setup.solver);

    job_b.discard().unwrap();
    assert!(setup.active_digests().is_empty());
}

#[tokio::test]
async fn discard_removes_loaded_subgraph() {
    let setup = TestSetup::new();
    let job = setup.solver.new_job("job-a").unwrap();
    let ctx = BuildContext::background();

    let target = TestVertex::new("P")
        .with_inputs(vec![edge(TestVertex::new("C").arc())])
        .arc();
    let res = job.build(&ctx, edge(target)).await.unwrap();

    let mut expected = vec![
        ContentDigest::from_bytes(b"P"),
        ContentDigest::from_bytes(b"C"),
    ];
    expected.sort();
    assert_eq!(setup.active_digests(), expected);
    assert_invariants(&setup.solver);

    drop(res);
    job.discard().unwrap();
    assert!(setup.active_digests().is_empty());
    assert!(setup.solver.shared.read().jobs.is_empty());
}

#[tokio::test]
async fn gc_cascades_through_parent_links() {
    let setup = TestSetup::new();
    let parent_drops = Arc::new(AtomicUsize::new(0));
    let child_drops = Arc::new(AtomicUsize::new(0));

    setup.configure(
        "C",
        OpConfig {
            drop_counter: Some(child_drops.dupe()),
            ..Default::default()
        },
    );
    setup.configure(
        "P",
        OpConfig {
            sub_builds: vec![edge(TestVertex::new("C").arc())],
            drop_counter: Some(parent_drops.dupe()),
            ..Default::default()
        },
    );

    let job = setup.solver.new_job("job-a").unwrap();
    let ctx = BuildContext::background();
    let res = job.build(&ctx, edge(TestVertex::new("P").arc())).await.unwrap();

    let child_digest = ContentDigest::from_bytes(b"C");
    assert_eq!(setup.active_digests().len(), 2);
    // the child is alive through its parent link alone
    assert!(setup.referent_ids(child_digest).is_empty());
    assert_invariants(&setup.solver);

    drop(res);
    job.discard().unwrap();

    assert!(setup.active_digests().is_empty());
    assert_eq!(parent_drops.load(Ordering::SeqCst), 1);
    assert_eq!(child_drops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn late_joiner_receives_current_snapshot() {
    let setup = TestSetup::new();
    let gate = Arc::new(Notify::new());
    let tracker = setup.configure(
        "P",
        OpConfig {
            exec_gate: Some(gate.dupe()),
            ..Default::default()
        },
    );

    let job_a = setup.solver.new_job("job-a").unwrap();
    let job_b = setup.solver.new_job("job-b").unwrap();
    let mut reader_b = job_b.take_progress_reader().unwrap();

    let build_a = tokio::spawn({
        let job_a = job_a.dupe();
        async move {
            let target = TestVertex::new("P")
                .with_inputs(vec![edge(TestVertex::new("C").arc())])
                .arc();
            job_a.build(&BuildContext::background(), edge(target)).await
        }
    });

    // P is now executing and holding the gate; C has already completed
    wait_until(|| tracker.exec_calls.load(Ordering::SeqCst) == 1).await;

    let child_digest = ContentDigest::from_bytes(b"C");
    job_b
        .build(&BuildContext::background(), edge(TestVertex::new("C").arc()))
        .await
        .unwrap();

    let child_state = setup.solver.active_state(&child_digest).unwrap();
    {
        let inner = child_state.inner.lock();
        assert!(inner.all_pw.contains(&job_a.progress_writer_id()));
        assert!(inner.all_pw.contains(&job_b.progress_writer_id()));
    }

    // the join delivered the child's current snapshot, not merely future
    // events
    let received = reader_b.drain();
    assert!(!received.is_empty());
    assert_eq!(received[0].digest, child_digest);
    assert_eq!(received[0].name, "C");
    assert_invariants(&setup.solver);

    gate.notify_one();
    build_a.await.unwrap().unwrap();
}

#[tokio::test]
async fn sub_build_exporters_accumulate_in_order() {
    let setup = TestSetup::new();
    setup.configure(
        "P",
        OpConfig {
            sub_builds: vec![
                edge(TestVertex::new("C1").arc()),
                edge(TestVertex::new("C2").arc()),
            ],
            ..Default::default()
        },
    );

    let job = setup.solver.new_job("job-a").unwrap();
    let ctx = BuildContext::background();
    job.build(&ctx, edge(TestVertex::new("P").arc())).await.unwrap();

    let parent_state = setup
        .solver
        .active_state(&ContentDigest::from_bytes(b"P"))
        .unwrap();
    let op = parent_state.get_edge(0).op().dupe();
    let (_outputs, exporters) = op.exec(&ctx, Vec::new()).await.unwrap();

    assert_eq!(
        exporters,
        [
            CacheKey {
                digest: ContentDigest::from_bytes(b"cm-C1"),
                output: 0,
            },
            CacheKey {
                digest: ContentDigest::from_bytes(b"cm-C2"),
                output: 0,
            },
        ]
    );
}

#[tokio::test]
async fn session_id_is_resolved_through_parents() {
    let setup = TestSetup::new();
    setup.configure(
        "P",
        OpConfig {
            sub_builds: vec![edge(TestVertex::new("C").arc())],
            ..Default::default()
        },
    );

    let job = setup.solver.new_job("job-a").unwrap();
    job.set_session_id("sess-a");
    let ctx = BuildContext::background();
    job.build(&ctx, edge(TestVertex::new("P").arc())).await.unwrap();

    let child_state = setup
        .solver
        .active_state(&ContentDigest::from_bytes(b"C"))
        .unwrap();
    // the child has no direct referent; the session comes from the parent's
    assert!(setup
        .referent_ids(ContentDigest::from_bytes(b"C"))
        .is_empty());
    assert_eq!(child_state.get_session_id(), Some("sess-a".to_owned()));
}
