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

/*! Resuming the target and getting it paused again.

  Execution commands differ from ordinary round trips in that the reply
  may never come: the target can run forever. So instead of raising on
  deadline these primitives return a tagged outcome, poll an interrupt
  predicate while they wait, and go out of their way never to leave an
  `input` prompt unclaimed in the stream: an unclaimed prompt is how
  sessions desync.
*/

use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info, instrument};

use crate::{
    consts,
    error::Error,
    protocol::Frame,
    session::{Session, SessionInner, TrapContext},
};

lazy_static! {
    /// Backends report breakpoint hits as `Stop by #<n>  ...`.
    static ref STOP_BY_RE: Regex = Regex::new(r"Stop by #(\d+)").unwrap();
}

/// How a wait for execution ended.
#[derive(Debug)]
pub enum ExecOutcome {
    /// The backend came back to its prompt; the session is Paused.
    Breakpoint { output: String },
    /// The interrupt predicate fired while the target was still running.
    /// No prompt is left buffered in the stream.
    Interrupted { output: String },
    /// The deadline and its grace window both expired with the target
    /// still running.
    Timeout { output: String },
}

impl Session {
    /// Send `c` and wait for the next prompt, polling `interrupt`
    /// between 500ms ticks.
    pub fn continue_and_wait(
        &self,
        timeout: Duration,
        interrupt: &dyn Fn() -> bool,
    ) -> Result<ExecOutcome, Error> {
        self.execute_and_wait(consts::CONTINUE_CMD, timeout, interrupt)
    }

    /// Like [`Session::continue_and_wait`] for the stepping commands
    /// (`next`, `step`, `finish`).
    #[instrument(skip_all, fields(s = self.id, cmd = cmd))]
    pub fn execute_and_wait(
        &self,
        cmd: &str,
        timeout: Duration,
        interrupt: &dyn Fn() -> bool,
    ) -> Result<ExecOutcome, Error> {
        self.touch();
        let mut inner = self.inner.lock().unwrap();
        inner.execute_and_wait_locked(cmd, timeout, interrupt)
    }

    /// Resume the target without waiting for anything.
    pub fn send_continue(&self) -> Result<(), Error> {
        self.touch();
        let mut inner = self.inner.lock().unwrap();
        if inner.stream.is_none() {
            return Err(Error::NotConnected);
        }
        inner.drain_stale()?;
        if !inner.paused {
            return Err(Error::NotPaused);
        }
        let pid = inner.pid.clone();
        let width = inner.width;
        if let Err(e) = inner.stream_mut()?.write_command(&pid, width, consts::CONTINUE_CMD) {
            inner.mark_disconnected();
            return Err(e);
        }
        inner.paused = false;
        Ok(())
    }

    /// Ask a running target to stop via the out-of-band `pause` frame.
    ///
    /// Returns whether the target is paused afterwards. A successful
    /// out-of-band pause lands in the target as a signal, so it latches
    /// trap context. On failure the session is left Running.
    #[instrument(skip_all, fields(s = self.id))]
    pub fn repause(&self, timeout: Duration) -> Result<bool, Error> {
        self.touch();
        let mut inner = self.inner.lock().unwrap();
        inner.repause_locked(timeout)
    }

    /// Passive wait for a pause that is believed to be in flight. Never
    /// writes anything; only drains with a deadline and updates state.
    pub fn ensure_paused(&self, timeout: Duration) -> Result<bool, Error> {
        self.touch();
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_paused_locked(timeout)
    }

    /// The policy every read-only tool operation runs first: tolerate a
    /// session the agent accidentally left Running by pausing it.
    pub fn auto_repause(&self, timeout: Duration) -> Result<(), Error> {
        self.touch();
        let mut inner = self.inner.lock().unwrap();
        if inner.stream.is_none() {
            return Err(Error::NotConnected);
        }
        inner.drain_stale()?;
        if inner.paused {
            return Ok(());
        }
        info!("session '{}' left running, attempting repause", self.id);
        if inner.repause_locked(timeout)? {
            Ok(())
        } else {
            Err(Error::PauseFailed)
        }
    }

    /// Probe whether the current prompt lives in a signal-handler
    /// context by locking a fresh mutex in the target. Updates and
    /// returns the latched flag. Advisory.
    pub fn probe_trap_context(&self, timeout: Duration) -> Result<TrapContext, Error> {
        self.touch();
        let mut inner = self.inner.lock().unwrap();
        let out = inner.send_command_locked(consts::TRAP_PROBE_CMD, timeout)?;
        let ctx = if out.contains("ThreadError") || out.contains("trap context") {
            TrapContext::Trap
        } else {
            TrapContext::Normal
        };
        debug!("trap probe verdict: {:?}", ctx);
        inner.trap_context = ctx;
        Ok(ctx)
    }

    /// Delete any registered one-shot breakpoints that `output` reports
    /// a stop at. Returns the indices deleted.
    pub fn cleanup_one_shots(
        &self,
        output: &str,
        timeout: Duration,
    ) -> Result<Vec<u32>, Error> {
        let hits: Vec<u32> = STOP_BY_RE
            .captures_iter(output)
            .filter_map(|c| c[1].parse().ok())
            .collect();
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let mut inner = self.inner.lock().unwrap();
        let mut deleted = Vec::new();
        for index in hits.into_iter() {
            if !inner.one_shots.contains(&index) {
                continue;
            }
            inner.send_command_locked(&format!("del {index}"), timeout)?;
            inner.one_shots.remove(&index);
            deleted.push(index);
        }
        if !deleted.is_empty() {
            info!("deleted one-shot breakpoints {:?}", deleted);
        }
        Ok(deleted)
    }
}

impl SessionInner {
    fn note_prompt(&mut self, pid: String) {
        self.pid = pid;
        self.paused = true;
        self.trap_context = TrapContext::Normal;
    }

    pub(crate) fn execute_and_wait_locked(
        &mut self,
        cmd: &str,
        timeout: Duration,
        interrupt: &dyn Fn() -> bool,
    ) -> Result<ExecOutcome, Error> {
        if self.stream.is_none() {
            return Err(Error::NotConnected);
        }
        self.drain_stale()?;
        if !self.paused {
            return Err(Error::NotPaused);
        }

        let pid = self.pid.clone();
        let width = self.width;
        if let Err(e) = self.stream_mut()?.write_command(&pid, width, cmd) {
            self.mark_disconnected();
            return Err(e);
        }
        self.paused = false;

        let deadline = Instant::now() + timeout;
        let mut out = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.finish_after_deadline(out, timeout);
            }

            let tick = remaining.min(consts::EXEC_POLL_DURATION);
            let frame = self.stream_mut()?.read_frame(tick);
            match frame {
                Ok(Frame::Out(text)) => {
                    out.push_str(&text);
                    out.push('\n');
                }
                Ok(Frame::Input(pid)) => {
                    self.note_prompt(pid);
                    self.last_output = out.clone();
                    return Ok(ExecOutcome::Breakpoint { output: out });
                }
                Ok(Frame::Ask { id, .. }) => self.answer_ask_exec(&id)?,
                Ok(Frame::Quit) => {
                    self.last_output = out.clone();
                    self.mark_disconnected();
                    return Err(Error::SessionEnded { output: out });
                }
                Err(Error::Timeout { .. }) => {
                    if interrupt() {
                        // claim any prompt that raced the interrupt;
                        // leaving it buffered would desync the session
                        if self.claim_buffered(&mut out)? {
                            self.trap_context = TrapContext::Normal;
                            self.last_output = out.clone();
                            return Ok(ExecOutcome::Breakpoint { output: out });
                        }
                        self.last_output = out.clone();
                        return Ok(ExecOutcome::Interrupted { output: out });
                    }
                }
                Err(e @ Error::ConnectionLost(_)) => {
                    self.mark_disconnected();
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The deadline has passed, but a breakpoint hit may be mid-flight.
    /// Linger through the grace window before reporting the timeout.
    fn finish_after_deadline(
        &mut self,
        mut out: String,
        timeout: Duration,
    ) -> Result<ExecOutcome, Error> {
        let grace_deadline = Instant::now() + consts::EXEC_GRACE_DURATION;
        loop {
            let remaining = grace_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let frame = self.stream_mut()?.read_frame(remaining);
            match frame {
                Ok(Frame::Out(text)) => {
                    out.push_str(&text);
                    out.push('\n');
                }
                Ok(Frame::Input(pid)) => {
                    debug!("breakpoint arrived inside the grace window");
                    self.note_prompt(pid);
                    self.last_output = out.clone();
                    return Ok(ExecOutcome::Breakpoint { output: out });
                }
                Ok(Frame::Ask { id, .. }) => self.answer_ask_exec(&id)?,
                Ok(Frame::Quit) => {
                    self.last_output = out.clone();
                    self.mark_disconnected();
                    return Err(Error::SessionEnded { output: out });
                }
                Err(Error::Timeout { .. }) => break,
                Err(e @ Error::ConnectionLost(_)) => {
                    self.mark_disconnected();
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        debug!("execution timed out after {:?} plus grace", timeout);
        self.last_output = out.clone();
        Ok(ExecOutcome::Timeout { output: out })
    }

    pub(crate) fn repause_locked(&mut self, timeout: Duration) -> Result<bool, Error> {
        if self.stream.is_none() {
            return Err(Error::NotConnected);
        }

        // a breakpoint hit may already be sitting in the stream
        let mut out = String::new();
        if self.claim_buffered(&mut out)? || self.paused {
            return Ok(true);
        }

        if let Err(e) = self.stream_mut()?.write_pause() {
            self.mark_disconnected();
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("pause request went unanswered");
                return Ok(false);
            }
            let frame = self.stream_mut()?.read_frame(remaining);
            match frame {
                Ok(Frame::Out(text)) => {
                    out.push_str(&text);
                    out.push('\n');
                }
                Ok(Frame::Input(pid)) => {
                    self.pid = pid;
                    self.paused = true;
                    // the pause mechanism delivers a signal, so this
                    // prompt lives in the handler
                    self.trap_context = TrapContext::Trap;
                    self.last_output = out.clone();
                    return Ok(true);
                }
                Ok(Frame::Ask { id, .. }) => self.answer_ask_exec(&id)?,
                Ok(Frame::Quit) => {
                    self.last_output = out.clone();
                    self.mark_disconnected();
                    return Err(Error::SessionEnded { output: out });
                }
                Err(Error::Timeout { .. }) => return Ok(false),
                Err(e @ Error::ConnectionLost(_)) => {
                    self.mark_disconnected();
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn ensure_paused_locked(&mut self, timeout: Duration) -> Result<bool, Error> {
        if self.stream.is_none() {
            return Err(Error::NotConnected);
        }
        if self.paused {
            return Ok(true);
        }

        let deadline = Instant::now() + timeout;
        let mut out = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(self.paused);
            }
            let frame = self.stream_mut()?.read_frame(remaining);
            match frame {
                Ok(Frame::Out(text)) => {
                    out.push_str(&text);
                    out.push('\n');
                }
                Ok(Frame::Input(pid)) => {
                    self.note_prompt(pid);
                    self.last_output = out.clone();
                    return Ok(true);
                }
                Ok(Frame::Ask { id, .. }) => self.answer_ask_exec(&id)?,
                Ok(Frame::Quit) => {
                    self.last_output = out.clone();
                    self.mark_disconnected();
                    return Err(Error::SessionEnded { output: out });
                }
                Err(Error::Timeout { .. }) => return Ok(self.paused),
                Err(e @ Error::ConnectionLost(_)) => {
                    self.mark_disconnected();
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn answer_ask_exec(&mut self, id: &str) -> Result<(), Error> {
        let res = self.stream_mut()?.write_answer(id);
        if let Err(e) = res {
            self.mark_disconnected();
            return Err(e);
        }
        Ok(())
    }
}
