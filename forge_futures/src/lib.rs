/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Cancellation primitives and the single-flight group used by the forge
//! solver.
//!
//! Callers observe cancellation through a [`CancellationContext`]; the
//! owning side requests it through a [`CancellationHandle`]. The
//! [`FlightGroup`] collapses concurrent calls for the same key into one
//! running worker whose result is broadcast to every waiter.

pub mod cancellation;
pub mod flight;

pub use crate::cancellation::CancellableResult;
pub use crate::cancellation::CancellationContext;
pub use crate::cancellation::CancellationHandle;
pub use crate::cancellation::CancellationReason;
pub use crate::flight::FlightGroup;
