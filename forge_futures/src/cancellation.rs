/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Cancellable results and the context/handle pair for requesting
//! cancellation

use allocative::Allocative;
use derive_more::Display;
use dupe::Dupe;
use thiserror::Error;
use tokio::sync::watch;

pub type CancellableResult<T> = Result<T, CancellationReason>;

#[derive(Clone, Dupe, Copy, Display, Debug, Error, Allocative, PartialEq, Eq)]
#[display("{:?}", self)]
pub enum CancellationReason {
    CallerCancelled,
    AllWaitersCancelled,
    /// The worker side went away without producing a value.
    WorkerDropped,
    ShutDown,
    /// Used by test code that manually cancels things.
    ByTest,
}

/// Observer half of a cancellation pair. Work that should stop early holds
/// one of these and checks it between suspension points.
///
/// Cloning is cheap; every clone observes the same request.
#[derive(Clone)]
pub struct CancellationContext(CancellationContextInner);

impl Dupe for CancellationContext {}

#[derive(Clone)]
enum CancellationContextInner {
    NeverCancelled,
    Explicit(watch::Receiver<Option<CancellationReason>>),
}

impl CancellationContext {
    /// A context for root callers that is never cancelled.
    pub fn never_cancelled() -> Self {
        Self(CancellationContextInner::NeverCancelled)
    }

    pub fn new() -> (CancellationHandle, CancellationContext) {
        let (sender, observer) = watch::channel(None);
        (
            CancellationHandle { sender },
            Self(CancellationContextInner::Explicit(observer)),
        )
    }

    /// Intended for synchronous code deciding to exit early.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_reason().is_some()
    }

    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        match &self.0 {
            CancellationContextInner::NeverCancelled => None,
            CancellationContextInner::Explicit(observer) => *observer.borrow(),
        }
    }

    /// Resolves once cancellation is requested. Never resolves for a root
    /// context, or when the handle is dropped without cancelling.
    pub async fn cancelled(&self) -> CancellationReason {
        match &self.0 {
            CancellationContextInner::NeverCancelled => std::future::pending().await,
            CancellationContextInner::Explicit(observer) => {
                let mut observer = observer.clone();
                let signalled = observer.wait_for(|state| state.is_some()).await.is_ok();
                if signalled {
                    observer.borrow().expect("guaranteed by the wait_for predicate")
                } else {
                    std::future::pending().await
                }
            }
        }
    }
}

/// Owner half of a cancellation pair.
pub struct CancellationHandle {
    sender: watch::Sender<Option<CancellationReason>>,
}

impl CancellationHandle {
    /// Request cancellation. Only the first request is recorded; returns
    /// whether this call was the one that cancelled.
    pub fn cancel(&self, reason: CancellationReason) -> bool {
        self.sender.send_if_modified(|state| match state {
            Some(_) => false,
            None => {
                *state = Some(reason);
                true
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_observer() {
        let (handle, ctx) = CancellationContext::new();
        assert!(!ctx.is_cancelled());

        assert!(handle.cancel(CancellationReason::ByTest));
        assert_eq!(ctx.cancelled().await, CancellationReason::ByTest);
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn first_cancel_wins() {
        let (handle, ctx) = CancellationContext::new();

        assert!(handle.cancel(CancellationReason::ByTest));
        assert!(!handle.cancel(CancellationReason::CallerCancelled));
        assert_eq!(
            ctx.cancellation_reason(),
            Some(CancellationReason::ByTest)
        );
    }

    #[tokio::test]
    async fn dropped_handle_is_not_cancellation() {
        let (handle, ctx) = CancellationContext::new();
        drop(handle);

        assert!(!ctx.is_cancelled());
        let pending = futures::poll!(std::pin::pin!(ctx.cancelled()));
        assert!(pending.is_pending());
    }

    #[tokio::test]
    async fn never_cancelled_never_resolves() {
        let ctx = CancellationContext::never_cancelled();
        assert!(!ctx.is_cancelled());
        let pending = futures::poll!(std::pin::pin!(ctx.cancelled()));
        assert!(pending.is_pending());
    }
}
