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

/*! One live attachment to a debugger backend.

  A session is Disconnected (no stream), or Connected and either Paused
  (the backend last sent an `input` prompt) or Running. The `paused`
  flag is authoritative: command frames may only be written while it is
  set, and writing one while the target runs corrupts the backend. A
  session whose byte stream breaks goes Disconnected and never comes
  back; reconnecting makes a new session.
*/

use std::{
    any::Any,
    collections::HashSet,
    fmt, process,
    sync::Mutex,
    time,
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{
    capture::CaptureFiles,
    error::Error,
    protocol::{Endpoint, FramedStream, RawControl},
};

pub mod cleanup;
pub mod command;
pub mod execution;
pub mod exit;

/// Whether the backend is pinned in a signal-handler context.
///
/// An out-of-band pause lands in the target as a signal, so the prompt
/// it produces lives in trap context: thread creation, `require`, and
/// framework autoload will fault there. The flag is latched by a
/// successful re-pause and cleared by the next normal prompt. It is
/// advisory; callers that care run [`Session::probe_trap_context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapContext {
    Unknown,
    Normal,
    Trap,
}

/// How the target was originally launched, kept so the tool surface can
/// relaunch it and ask for its breakpoints back.
#[derive(Debug, Clone)]
pub struct LaunchInfo {
    pub script: String,
    pub args: Vec<String>,
}

/// Mutable session state. Lives behind the session mutex; holding the
/// lock is what serializes round trips on the byte stream.
pub struct SessionInner {
    /// `None` means Disconnected.
    pub(crate) stream: Option<FramedStream>,
    /// Target pid as reported by the most recent `input` frame.
    pub(crate) pid: String,
    pub(crate) width: u16,
    pub(crate) paused: bool,
    pub(crate) trap_context: TrapContext,
    /// Backend indices of breakpoints to auto-delete after one hit.
    pub(crate) one_shots: HashSet<u32>,
    /// Safety-warning categories the user has waived for this session.
    pub(crate) acked_warnings: HashSet<String>,
    /// An eval redirected the target's stdout; cleanup must restore it.
    pub(crate) stdout_redirected: bool,
    /// An eval saved the target's interrupt handler aside.
    pub(crate) int_handler_saved: bool,
    /// Present only when the adapter launched the target itself.
    pub(crate) child: Option<process::Child>,
    pub(crate) capture: Option<CaptureFiles>,
    pub(crate) launch: Option<LaunchInfo>,
    /// Opaque collaborator payload (a background request in flight). We
    /// hold it and hand it back; we never look inside.
    pub(crate) pending_request: Option<Box<dyn Any + Send>>,
    /// Protocol output from the most recent round trip, kept for the
    /// exit detector.
    pub(crate) last_output: String,
}

// the pending-request slot is opaque, so Debug is written by hand
impl fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInner")
            .field("connected", &self.stream.is_some())
            .field("pid", &self.pid)
            .field("paused", &self.paused)
            .field("trap_context", &self.trap_context)
            .field("one_shots", &self.one_shots)
            .field("pending_request", &self.pending_request.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    pub(crate) fn stream_mut(&mut self) -> Result<&mut FramedStream, Error> {
        self.stream.as_mut().ok_or(Error::NotConnected)
    }

    /// Tear down the byte stream. This is the one-way door into
    /// Disconnected.
    pub(crate) fn mark_disconnected(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.shutdown();
        }
        self.paused = false;
    }
}

/// One connected debugger backend, owned by the session manager.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub endpoint: Endpoint,
    pub connected_at: time::SystemTime,
    last_activity: Mutex<Instant>,
    /// Socket handle that bypasses `inner` for signal-path cleanup
    /// writes and shutdowns.
    raw: RawControl,
    raw_pid: String,
    raw_width: u16,
    pub(crate) inner: Mutex<SessionInner>,
}

/// Optional attachments for a freshly connected session.
#[derive(Debug, Default)]
pub struct SessionExtras {
    pub child: Option<process::Child>,
    pub capture: Option<CaptureFiles>,
    pub launch: Option<LaunchInfo>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        endpoint: Endpoint,
        stream: FramedStream,
        pid: String,
        width: u16,
        extras: SessionExtras,
    ) -> Result<Session, Error> {
        let raw = stream.raw_control()?;
        Ok(Session {
            id,
            endpoint,
            connected_at: time::SystemTime::now(),
            last_activity: Mutex::new(Instant::now()),
            raw,
            raw_pid: pid.clone(),
            raw_width: width,
            inner: Mutex::new(SessionInner {
                stream: Some(stream),
                pid,
                width,
                paused: true,
                trap_context: TrapContext::Unknown,
                one_shots: HashSet::new(),
                acked_warnings: HashSet::new(),
                stdout_redirected: false,
                int_handler_saved: false,
                child: extras.child,
                capture: extras.capture,
                launch: extras.launch,
                pending_request: None,
                last_output: String::new(),
            }),
        })
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn pid(&self) -> String {
        self.inner.lock().unwrap().pid.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().paused
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().stream.is_some()
    }

    pub fn trap_context(&self) -> TrapContext {
        self.inner.lock().unwrap().trap_context
    }

    pub fn launch_info(&self) -> Option<LaunchInfo> {
        self.inner.lock().unwrap().launch.clone()
    }

    pub fn capture_files(&self) -> Option<CaptureFiles> {
        self.inner.lock().unwrap().capture.clone()
    }

    pub fn last_output(&self) -> String {
        self.inner.lock().unwrap().last_output.clone()
    }

    /// The collaborator rewrote the target's stdout; remember to put it
    /// back before letting go of the target.
    pub fn mark_stdout_redirected(&self) {
        self.inner.lock().unwrap().stdout_redirected = true;
    }

    /// The collaborator saved the target's interrupt handler aside.
    pub fn mark_int_handler_saved(&self) {
        self.inner.lock().unwrap().int_handler_saved = true;
    }

    pub fn acknowledge_warning(&self, category: &str) {
        self.inner.lock().unwrap().acked_warnings.insert(String::from(category));
    }

    pub fn warning_acknowledged(&self, category: &str) -> bool {
        self.inner.lock().unwrap().acked_warnings.contains(category)
    }

    /// Track a backend breakpoint index for deletion after its first hit.
    pub fn register_one_shot(&self, index: u32) {
        self.inner.lock().unwrap().one_shots.insert(index);
    }

    pub fn one_shots(&self) -> Vec<u32> {
        let inner = self.inner.lock().unwrap();
        let mut v: Vec<u32> = inner.one_shots.iter().copied().collect();
        v.sort_unstable();
        v
    }

    /// Park an opaque collaborator payload on the session.
    pub fn stash_pending_request(&self, payload: Box<dyn Any + Send>) {
        self.inner.lock().unwrap().pending_request = Some(payload);
    }

    /// Hand back whatever was parked, if anything.
    pub fn take_pending_request(&self) -> Option<Box<dyn Any + Send>> {
        self.inner.lock().unwrap().pending_request.take()
    }

    /// The raw socket handle plus greeting-time pid and width for
    /// signal-path cleanup. Never touches the session mutex.
    pub(crate) fn raw_parts(&self) -> (&RawControl, &str, u16) {
        (&self.raw, &self.raw_pid, self.raw_width)
    }

    /// Close the byte stream and delete any capture files. Called by the
    /// manager after the resume-before-disconnect pipeline has run.
    pub(crate) fn close(&self) {
        debug!("closing session '{}'", self.id);
        let mut inner = self.inner.lock().unwrap();
        inner.mark_disconnected();
        if let Some(capture) = inner.capture.take() {
            capture.remove();
        }
    }
}
