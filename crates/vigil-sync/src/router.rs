//! Frame routing.
//!
//! The connection layer surfaces application frames; [`FrameRouter`] hands
//! each one to the handlers registered for its [`FrameKind`]. Control frames
//! never get here in normal operation, but the router tolerates them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use vigil_core::{FrameKind, InboundFrame};

/// A consumer of routed frames.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Process one frame. Handlers own their failure handling; the router
    /// does not inspect outcomes.
    async fn handle(&self, frame: InboundFrame);
}

/// Routes frames to registered handlers by kind.
#[derive(Default)]
pub struct FrameRouter {
    handlers: RwLock<HashMap<FrameKind, Vec<Arc<dyn FrameHandler>>>>,
}

impl FrameRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a frame kind.
    ///
    /// Handlers for the same kind run in registration order.
    pub fn register(&self, kind: FrameKind, handler: Arc<dyn FrameHandler>) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    /// Dispatch a frame to every handler registered for its kind.
    ///
    /// Frames with no registered handler are logged and dropped.
    pub async fn dispatch(&self, frame: InboundFrame) {
        let Some(kind) = frame.kind() else {
            debug!(frame = frame.name(), "control frame reached router, ignoring");
            return;
        };
        let targets = self
            .handlers
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        if targets.is_empty() {
            debug!(kind = %kind, "no handlers registered, frame dropped");
            return;
        }
        for handler in targets {
            handler.handle(frame.clone()).await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
