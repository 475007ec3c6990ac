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
use forge_futures::CancellationContext;
use forge_progress::Writer;

use crate::progress::ClientVertex;

/// Ambient context threaded through every registry and operation call:
/// cancellation, the progress writer in effect, and the best-effort session
/// id. Decoration produces a new context; clones are cheap.
#[derive(Clone, Dupe)]
pub struct BuildContext {
    cancellation: CancellationContext,
    progress: Option<Arc<dyn Writer<ClientVertex>>>,
    session_id: Option<Arc<str>>,
}

impl BuildContext {
    /// Root context: never cancelled, no progress sink, no session.
    pub fn background() -> Self {
        Self::new(CancellationContext::never_cancelled())
    }

    pub fn new(cancellation: CancellationContext) -> Self {
        Self {
            cancellation,
            progress: None,
            session_id: None,
        }
    }

    pub fn with_progress(&self, progress: Arc<dyn Writer<ClientVertex>>) -> Self {
        Self {
            progress: Some(progress),
            ..self.dupe()
        }
    }

    pub fn with_session_id(&self, session_id: &str) -> Self {
        Self {
            session_id: Some(Arc::from(session_id)),
            ..self.dupe()
        }
    }

    pub fn with_cancellation(&self, cancellation: CancellationContext) -> Self {
        Self {
            cancellation,
            ..self.dupe()
        }
    }

    pub fn cancellation(&self) -> &CancellationContext {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn progress(&self) -> Option<&Arc<dyn Writer<ClientVertex>>> {
        self.progress.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}
