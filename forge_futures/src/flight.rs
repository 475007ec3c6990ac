/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Single-flight execution keyed by string

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dupe::Dupe;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::cancellation::CancellableResult;
use crate::cancellation::CancellationContext;
use crate::cancellation::CancellationHandle;
use crate::cancellation::CancellationReason;

/// Collapses concurrent calls for the same key into a single running
/// worker. Every caller in a given flight observes the worker's value, so
/// values must be cheap to clone; callers are expected to put their real
/// payload behind an `Arc` or a cheap-clone error.
///
/// The worker runs under its own [`CancellationContext`], detached from any
/// single caller. A caller whose context fires stops waiting immediately;
/// the worker is only cancelled once every current waiter has gone.
///
/// Memoization of completed values is the caller's responsibility, in the
/// closure. Once a flight completes, the key is vacated and a later call
/// starts a fresh flight.
pub struct FlightGroup<T: Clone + Send + Sync + 'static> {
    flights: Arc<Mutex<HashMap<String, Flight<T>>>>,
    next_id: AtomicU64,
}

struct Flight<T> {
    /// Distinguishes this flight from a successor under the same key.
    id: u64,
    waiters: usize,
    handle: CancellationHandle,
    observer: watch::Receiver<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Default for FlightGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> FlightGroup<T> {
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Join the in-flight worker for `key`, or start one from `work`.
    ///
    /// Returns the worker's value, or the reason this caller stopped
    /// waiting. An abandoned worker keeps running for the remaining
    /// waiters and is only cancelled when the last one leaves.
    pub async fn run<F, Fut>(
        &self,
        ctx: &CancellationContext,
        key: &str,
        work: F,
    ) -> CancellableResult<T>
    where
        F: FnOnce(CancellationContext) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (flight_id, mut observer) = {
            let mut flights = self.flights.lock();
            match flights.get_mut(key) {
                Some(flight) => {
                    flight.waiters += 1;
                    (flight.id, flight.observer.clone())
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (handle, worker_ctx) = CancellationContext::new();
                    let (value_sender, observer) = watch::channel(None);
                    let fut = work(worker_ctx);

                    let flights_of_worker = self.flights.dupe();
                    let key_of_worker = key.to_owned();
                    tokio::spawn(async move {
                        let value = fut.await;
                        let mut flights = flights_of_worker.lock();
                        if flights.get(&key_of_worker).is_some_and(|f| f.id == id) {
                            flights.remove(&key_of_worker);
                        }
                        let _ignore = value_sender.send(Some(value));
                    });

                    flights.insert(
                        key.to_owned(),
                        Flight {
                            id,
                            waiters: 1,
                            handle,
                            observer: observer.clone(),
                        },
                    );
                    (id, observer)
                }
            }
        };

        tokio::select! {
            biased;
            value = wait_value(&mut observer) => value,
            reason = ctx.cancelled() => {
                self.abandon(key, flight_id);
                Err(reason)
            }
        }
    }

    /// One waiter gave up. The last one out cancels the worker.
    fn abandon(&self, key: &str, flight_id: u64) {
        let mut flights = self.flights.lock();
        if let Some(flight) = flights.get_mut(key) {
            if flight.id == flight_id {
                flight.waiters -= 1;
                if flight.waiters == 0 {
                    flight
                        .handle
                        .cancel(CancellationReason::AllWaitersCancelled);
                }
            }
        }
    }
}

async fn wait_value<T: Clone>(
    observer: &mut watch::Receiver<Option<T>>,
) -> CancellableResult<T> {
    loop {
        if let Some(value) = observer.borrow_and_update().as_ref() {
            return Ok(value.clone());
        }
        if observer.changed().await.is_err() {
            return Err(CancellationReason::WorkerDropped);
        }
    }
}
