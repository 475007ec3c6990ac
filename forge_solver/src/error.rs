/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::sync::Arc;

use dupe::Dupe;
use forge_futures::CancellationReason;
use thiserror::Error;

use crate::digest::ContentDigest;

pub type SolverResult<T> = Result<T, SolverError>;

/// Cheap to clone so that a single-flight outcome can be handed to every
/// waiter and memoized for later callers.
#[derive(Clone, Dupe, Debug, Error)]
#[error(transparent)]
pub struct SolverError(pub Arc<SolverErrorKind>);

#[derive(Debug, Error)]
pub enum SolverErrorKind {
    #[error("job ID {0} exists")]
    DuplicateJobId(String),
    #[error("no such job {0}")]
    NoSuchJob(String),
    #[error("inactive parent {0}")]
    InactiveParent(ContentDigest),
    #[error("solver registry is gone")]
    ShutDown,
    #[error("failed to resolve op for vertex {0}: {1}")]
    ResolveOp(ContentDigest, anyhow::Error),
    #[error("{0}")]
    Op(anyhow::Error),
    #[error("cancelled: {0}")]
    Cancelled(CancellationReason),
}

impl SolverError {
    fn new(kind: SolverErrorKind) -> Self {
        Self(Arc::new(kind))
    }

    pub fn duplicate_job_id(id: &str) -> Self {
        Self::new(SolverErrorKind::DuplicateJobId(id.to_owned()))
    }

    pub fn no_such_job(id: &str) -> Self {
        Self::new(SolverErrorKind::NoSuchJob(id.to_owned()))
    }

    pub fn inactive_parent(digest: ContentDigest) -> Self {
        Self::new(SolverErrorKind::InactiveParent(digest))
    }

    pub fn shut_down() -> Self {
        Self::new(SolverErrorKind::ShutDown)
    }

    pub fn resolve_op(vertex: ContentDigest, err: anyhow::Error) -> Self {
        Self::new(SolverErrorKind::ResolveOp(vertex, err))
    }

    pub fn op(err: anyhow::Error) -> Self {
        Self::new(SolverErrorKind::Op(err))
    }

    pub fn cancelled(reason: CancellationReason) -> Self {
        Self::new(SolverErrorKind::Cancelled(reason))
    }

    /// Whether the root cause of this error is a cancellation. Cancelled
    /// outcomes are never memoized; the next caller retries.
    pub fn is_cancelled(&self) -> bool {
        match &*self.0 {
            SolverErrorKind::Cancelled(..) => true,
            SolverErrorKind::Op(err) => err
                .chain()
                .any(|cause| cause.downcast_ref::<CancellationReason>().is_some()),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_found_at_the_error_root() {
        let op_err = anyhow::Error::new(CancellationReason::AllWaitersCancelled)
            .context("exec failed");
        assert!(SolverError::op(op_err).is_cancelled());
        assert!(SolverError::cancelled(CancellationReason::ByTest).is_cancelled());
        assert!(!SolverError::op(anyhow::anyhow!("boom")).is_cancelled());
        assert!(!SolverError::shut_down().is_cancelled());
    }
}
