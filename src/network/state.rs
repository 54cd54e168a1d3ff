use std::sync::atomic::{AtomicU32, Ordering};

use crate::service::CloseReason;

const SENDING: u8 = 1;
const RECEIVING: u8 = 2;
const CLOSING: u8 = 16;
const CLOSED: u8 = 32;

/// Decoded view of a session's state word: the activity flags plus the
/// close reason recorded by the winning `close` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    flags: u8,
    reason: Option<CloseReason>,
}

impl SessionState {
    fn unpack(word: u32) -> SessionState {
        let flags = (word & 0xff) as u8;
        let reason = if flags & CLOSING != 0 {
            Some(CloseReason::from_u8((word >> 8) as u8))
        } else {
            None
        };
        SessionState { flags, reason }
    }

    fn pack(self) -> u32 {
        let reason = self.reason.map_or(0, |reason| reason as u8);
        (reason as u32) << 8 | self.flags as u32
    }

    pub fn is_sending(&self) -> bool {
        self.flags & SENDING != 0
    }

    pub fn is_receiving(&self) -> bool {
        self.flags & RECEIVING != 0
    }

    pub fn is_closing(&self) -> bool {
        self.flags & CLOSING != 0
    }

    pub fn is_closed(&self) -> bool {
        self.flags & CLOSED != 0
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason
    }
}

/// The state word of one session. Every transition is a single
/// compare-and-swap, so exactly one caller wins each of them.
#[derive(Debug, Default)]
pub struct AtomicSessionState {
    word: AtomicU32,
}

impl AtomicSessionState {
    pub fn new() -> Self {
        AtomicSessionState {
            word: AtomicU32::new(0),
        }
    }

    pub fn load(&self) -> SessionState {
        SessionState::unpack(self.word.load(Ordering::Acquire))
    }

    fn update<F>(&self, mut f: F) -> Result<SessionState, SessionState>
    where
        F: FnMut(SessionState) -> Option<SessionState>,
    {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                f(SessionState::unpack(word)).map(SessionState::pack)
            })
            .map(SessionState::unpack)
            .map_err(SessionState::unpack)
    }

    fn try_add(&self, flag: u8) -> bool {
        self.update(|state| {
            if state.flags & (flag | CLOSING | CLOSED) != 0 {
                return None;
            }
            Some(SessionState {
                flags: state.flags | flag,
                ..state
            })
        })
        .is_ok()
    }

    fn remove(&self, flag: u8) -> SessionState {
        let previous = match self.update(|state| {
            Some(SessionState {
                flags: state.flags & !flag,
                ..state
            })
        }) {
            Ok(previous) | Err(previous) => previous,
        };
        SessionState {
            flags: previous.flags & !flag,
            ..previous
        }
    }

    /// Enters sending unless a send is already running or the session is
    /// closing.
    pub fn try_start_sending(&self) -> bool {
        self.try_add(SENDING)
    }

    pub fn end_sending(&self) -> SessionState {
        self.remove(SENDING)
    }

    pub fn try_start_receiving(&self) -> bool {
        self.try_add(RECEIVING)
    }

    pub fn end_receiving(&self) -> SessionState {
        self.remove(RECEIVING)
    }

    /// Marks the session closing and records `reason`. Only the first caller
    /// gets `true`.
    pub fn start_closing(&self, reason: CloseReason) -> bool {
        self.update(|state| {
            if state.flags & (CLOSING | CLOSED) != 0 {
                return None;
            }
            Some(SessionState {
                flags: state.flags | CLOSING,
                reason: Some(reason),
            })
        })
        .is_ok()
    }

    /// Moves a closing session to closed once nothing is in flight, returning
    /// the recorded reason to the single caller that made the move.
    pub fn try_finalize(&self) -> Option<CloseReason> {
        self.update(|state| {
            let busy = SENDING | RECEIVING | CLOSED;
            if state.flags & CLOSING == 0 || state.flags & busy != 0 {
                return None;
            }
            Some(SessionState {
                flags: state.flags | CLOSED,
                ..state
            })
        })
        .ok()
        .map(|previous| previous.reason.unwrap_or(CloseReason::Unknown))
    }
}
