// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt, io, time};

use crate::duration;

/// Errors produced by the session core.
///
/// Variants partition into four kinds (see [`ErrorKind`]):
///
/// - **Connection**: [`Connect`](Self::Connect),
///   [`Handshake`](Self::Handshake), [`ConnectionLost`](Self::ConnectionLost).
/// - **Session**: [`NoSession`](Self::NoSession),
///   [`UnknownSession`](Self::UnknownSession), [`Reaped`](Self::Reaped),
///   [`NotConnected`](Self::NotConnected), [`NotPaused`](Self::NotPaused),
///   [`SessionEnded`](Self::SessionEnded), [`PauseFailed`](Self::PauseFailed).
/// - **Timeout**: [`Timeout`](Self::Timeout).
/// - **Backend**: [`Backend`](Self::Backend) — the debugger answered with an
///   error payload, surfaced verbatim.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening the transport to the backend failed.
    #[error("connecting to debugger backend: {0}")]
    Connect(#[source] io::Error),

    /// The transport opened but the greeting exchange never reached an
    /// `input` prompt.
    #[error("debugger backend did not complete the greeting handshake: {0}")]
    Handshake(String),

    /// The byte stream died (EOF, broken pipe, socket error). The session
    /// is Disconnected by the time this is returned.
    #[error("debugger connection lost: {0}; use connect to reconnect")]
    ConnectionLost(String),

    /// No session is registered at all.
    #[error("no active debug session; use connect first")]
    NoSession,

    /// The named session is not in the registry and was not recently reaped.
    #[error("no debug session named '{0}'; use connect to reconnect")]
    UnknownSession(String),

    /// The named session was reaped recently enough that we can still say
    /// why.
    #[error("session '{id}' {reason} ({} ago); use connect to reconnect", duration::humanize(*.ago))]
    Reaped { id: String, reason: ReapReason, ago: time::Duration },

    /// The session object exists but its byte stream is gone.
    #[error("session is not connected to a debugger backend; use connect to reconnect")]
    NotConnected,

    /// The backend ended the session (sent `quit`) while we were talking
    /// to it. Output accumulated before the end rides along.
    #[error("debug session ended by the backend; output before exit:\n{output}")]
    SessionEnded { output: String },

    /// The target is running, so no command frame may be sent.
    #[error("target is not paused; wait for a breakpoint or use pause")]
    NotPaused,

    /// The out-of-band pause request went unanswered.
    #[error("could not pause the target; it may be blocked on uninterruptible I/O")]
    PauseFailed,

    /// The backend produced no `input` prompt within the budget.
    #[error("no response from debugger within {}s", .timeout.as_secs_f32())]
    Timeout { timeout: time::Duration },

    /// The backend answered with an error payload.
    #[error("debugger backend error: {0}")]
    Backend(String),
}

/// The four disjoint failure categories callers route on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Session,
    Timeout,
    Backend,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connect(_) | Error::Handshake(_) | Error::ConnectionLost(_) => {
                ErrorKind::Connection
            }
            Error::NoSession
            | Error::UnknownSession(_)
            | Error::Reaped { .. }
            | Error::NotConnected
            | Error::SessionEnded { .. }
            | Error::NotPaused
            | Error::PauseFailed => ErrorKind::Session,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Backend(_) => ErrorKind::Backend,
        }
    }
}

/// Why the reaper removed a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapReason {
    IdleTimeout { limit: time::Duration },
    ProcessDied,
    SocketClosed,
}

impl fmt::Display for ReapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReapReason::IdleTimeout { limit } => {
                write!(
                    f,
                    "was automatically disconnected after {} of inactivity",
                    duration::humanize(*limit)
                )
            }
            ReapReason::ProcessDied => {
                write!(f, "was disconnected because its target process died")
            }
            ReapReason::SocketClosed => {
                write!(f, "was disconnected because the backend closed the socket")
            }
        }
    }
}
