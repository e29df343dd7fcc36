//! Admin arbitration: who may invoke mutating operations.
//!
//! ```text
//!            request(s)                 release(s) / close(s) / shutdown
//!   Free ----------------> Held(s) ----------------------------------> Free
//!                            |  request(o), force = false  -> Busy(s), unchanged
//!                            |  request(o), force = true   -> Held(o), s revoked
//! ```
//!
//! There is no queue: a rejected requester has to retry.

use super::session::SessionId;
use crate::error::{AppResult, ProxyError};

/// Outcome of a successful acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// The token was free.
    Granted,
    /// The requester already held the token.
    AlreadyHeld,
    /// The token was taken from another session.
    TakenFrom(SessionId),
}

/// Arbitration state owned by one server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdminToken {
    /// Nobody holds admin rights.
    #[default]
    Free,
    /// The given session holds admin rights.
    Held(SessionId),
}

impl AdminToken {
    /// Current holder, if any.
    pub fn holder(&self) -> Option<SessionId> {
        match self {
            AdminToken::Free => None,
            AdminToken::Held(id) => Some(*id),
        }
    }

    /// Whether `session` holds the token.
    pub fn is_held_by(&self, session: SessionId) -> bool {
        *self == AdminToken::Held(session)
    }

    /// Try to hand the token to `session`.
    ///
    /// Without `force`, a token held by another session yields `Busy` and the state
    /// is left untouched.
    pub fn acquire(&mut self, session: SessionId, force: bool) -> AppResult<Acquired> {
        match *self {
            AdminToken::Free => {
                *self = AdminToken::Held(session);
                Ok(Acquired::Granted)
            }
            AdminToken::Held(holder) if holder == session => Ok(Acquired::AlreadyHeld),
            AdminToken::Held(holder) if force => {
                *self = AdminToken::Held(session);
                Ok(Acquired::TakenFrom(holder))
            }
            AdminToken::Held(holder) => Err(ProxyError::Busy { held_by: holder }),
        }
    }

    /// Clear the token if `session` holds it. Returns whether anything changed.
    pub fn release(&mut self, session: SessionId) -> bool {
        if self.is_held_by(session) {
            *self = AdminToken::Free;
            true
        } else {
            false
        }
    }
}
