//! Non-blocking calls.
//!
//! A `CALL` to an operation published with `blocking: false` is answered with
//! `STARTED` right away; the driver runs on a separate task through the same
//! device gate as every other call. Each session owns at most one such call
//! until it collects the outcome with `GET_RESULT`.

use crate::error::ProxyError;
use crate::protocol::{Frame, CONTROL_CALL_ID};
use std::time::Duration;
use tokio::sync::watch;

/// How long `GET_RESULT` waits for a running call before answering `RESULT_PENDING`.
pub(crate) const RESULT_WAIT: Duration = Duration::from_millis(200);

/// A background call owned by one session.
#[derive(Debug, Clone)]
pub(crate) struct BackgroundCall {
    pub(crate) call_id: u64,
    pub(crate) operation: String,
    outcome: watch::Receiver<Option<Frame>>,
}

/// Completes a [`BackgroundCall`] with its reply frame.
pub(crate) type Completion = watch::Sender<Option<Frame>>;

impl BackgroundCall {
    pub(crate) fn new(call_id: u64, operation: impl Into<String>) -> (Self, Completion) {
        let (done, outcome) = watch::channel(None);
        let call = Self {
            call_id,
            operation: operation.into(),
            outcome,
        };
        (call, done)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// The reply frame, waiting at most `limit` for the call to finish.
    pub(crate) async fn outcome(&self, limit: Duration) -> Option<Frame> {
        let mut outcome = self.outcome.clone();
        // Also returns early if the task is gone without completing.
        if tokio::time::timeout(limit, outcome.wait_for(Option::is_some))
            .await
            .is_err()
        {
            return None;
        }
        let frame = outcome.borrow().clone();
        frame.or_else(|| {
            outcome.has_changed().is_err().then(|| {
                Frame::error(
                    CONTROL_CALL_ID,
                    &ProxyError::driver("cancelled", "background call ended without a result"),
                )
            })
        })
    }
}
