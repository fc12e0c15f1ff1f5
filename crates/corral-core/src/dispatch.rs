//! Control-request dispatcher.
//!
//! Consumes a session's sideband requests in arrival order and translates
//! each one into a terminal effect and a reply:
//!
//! | request         | effect          | reply                       |
//! |-----------------|-----------------|-----------------------------|
//! | `shell`         | none            | success iff payload empty   |
//! | `pty-req`       | resize          | success, failure if malformed |
//! | `window-change` | resize          | success, failure if malformed |
//! | `env`           | none            | success                     |
//! | anything else   | none            | failure                     |

use crate::codec::{decode_pty_request, decode_window_change, WindowSize};
use crate::error::CoreError;
use crate::transport::ControlRequest;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Something whose terminal window can be resized.
pub trait WindowSizer: Send + Sync {
    /// Apply a new window size.
    fn resize(&self, size: WindowSize) -> io::Result<()>;
}

/// Recognized control request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Start the login shell.
    Shell,
    /// Allocate a pty with an initial geometry.
    PtyAllocate,
    /// Terminal window resized.
    WindowChange,
    /// Set an environment variable.
    Env,
    /// Anything else.
    Other,
}

impl RequestKind {
    /// Classify a wire request name.
    pub fn from_wire(name: &str) -> Self {
        match name {
            "shell" => Self::Shell,
            "pty-req" => Self::PtyAllocate,
            "window-change" => Self::WindowChange,
            "env" => Self::Env,
            _ => Self::Other,
        }
    }
}

/// Handle a single request, replying if the client asked for it.
///
/// Returns whether the request succeeded.
pub fn dispatch(request: ControlRequest, sizer: &dyn WindowSizer) -> bool {
    let kind = RequestKind::from_wire(&request.kind);
    let ok = match kind {
        RequestKind::Shell => request.payload.is_empty(),
        RequestKind::Env => true,
        RequestKind::Other => {
            tracing::debug!(kind = %request.kind, "Ignoring unknown request");
            false
        }
        RequestKind::PtyAllocate => match decode_pty_request(&request.payload) {
            Ok(pty) => {
                tracing::debug!(term = %pty.term, cols = pty.size.cols, rows = pty.size.rows, "Pty requested");
                apply(sizer, pty.size);
                true
            }
            Err(e) => malformed(&request.kind, e.into()),
        },
        RequestKind::WindowChange => match decode_window_change(&request.payload) {
            Ok(size) => {
                apply(sizer, size);
                true
            }
            Err(e) => malformed(&request.kind, e.into()),
        },
    };
    request.reply(ok);
    ok
}

/// Process requests until the stream ends.
pub async fn run_dispatcher(
    mut requests: mpsc::Receiver<ControlRequest>,
    sizer: Arc<dyn WindowSizer>,
) {
    while let Some(request) = requests.recv().await {
        dispatch(request, sizer.as_ref());
    }
    tracing::debug!("Control request stream ended");
}

fn apply(sizer: &dyn WindowSizer, size: WindowSize) {
    // A failed resize is not the client's fault; the reply stays a success.
    if let Err(e) = sizer.resize(size) {
        tracing::warn!(error = %e, cols = size.cols, rows = size.rows, "Failed to resize pty");
    }
}

fn malformed(kind: &str, err: CoreError) -> bool {
    tracing::warn!(kind, error = %err, "Rejecting request");
    false
}
