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

/*! Putting the target back on its feet before letting go of it.

  A user who attached to a long-lived daemon must not leave it pinned
  at a debugger prompt with stale breakpoints. Before a session's
  socket closes, this pipeline restores rewritten globals, deletes
  every breakpoint, and issues a forced continue, all under a hard
  deadline. Every step is best-effort: a failure is logged and the
  pipeline moves on, because a half-cleaned target beats an abandoned
  paused one.
*/

use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::{
    consts,
    error::Error,
    protocol::Frame,
    session::{Session, SessionInner},
};

lazy_static! {
    /// Listing lines look like `#0  BP - Line  /tmp/a.rb:3`.
    static ref BREAKPOINT_INDEX_RE: Regex = Regex::new(r"(?m)^\s*#(\d+)\s").unwrap();
}

/// Pull breakpoint indices out of a `break` listing.
pub(crate) fn parse_breakpoint_indices(listing: &str) -> Vec<u32> {
    BREAKPOINT_INDEX_RE
        .captures_iter(listing)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

fn log_step<T>(ctx: &str, res: Result<T, Error>) -> Result<T, Error> {
    res.map_err(|e| {
        debug!("cleanup step '{}': {:?}", ctx, e);
        e
    })
}

impl Session {
    /// Run the resume-before-disconnect pipeline with the given total
    /// budget. Infallible by design; whatever could not be done in time
    /// is logged and abandoned.
    #[instrument(skip_all, fields(s = self.id))]
    pub fn resume_before_disconnect(&self, budget: Duration, retries: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.resume_before_disconnect_locked(budget, retries);
    }

    /// The signal-path variant: raw frames straight onto the socket,
    /// no locks, no reads. Deletes breakpoint indices 0 through 9 only,
    /// since the listing cannot be queried here; higher indices leak.
    pub(crate) fn write_raw_resume(&self) {
        let (raw, pid, width) = self.raw_parts();
        for index in 0..consts::RAW_RESUME_INDEX_LIMIT {
            raw.write_line(&format!("command {pid} {width} del {index}"));
        }
        raw.write_line(&format!("command {pid} {width} c"));
    }
}

impl SessionInner {
    pub(crate) fn resume_before_disconnect_locked(&mut self, budget: Duration, retries: u32) {
        if self.stream.is_none() {
            return;
        }
        let deadline = Instant::now() + budget;

        if self.stdout_redirected
            && log_step(
                "restore stdout",
                self.send_command_locked(consts::RESTORE_STDOUT_CMD, step_budget(deadline)),
            )
            .is_ok()
        {
            self.stdout_redirected = false;
        }

        // The step that matters most: a resumed daemon with a leftover
        // breakpoint will pause again with nobody listening.
        let _ = log_step("delete breakpoints", self.delete_all_breakpoints(deadline));

        if self.int_handler_saved
            && log_step(
                "restore int handler",
                self.send_command_locked(consts::RESTORE_INT_HANDLER_CMD, step_budget(deadline)),
            )
            .is_ok()
        {
            self.int_handler_saved = false;
        }

        let _ = log_step("forced continue", self.force_continue());
        self.settle(deadline);

        // A pause request buffered before we continued can put the
        // target right back at a prompt. Bounded retries break the loop.
        let mut round = 0;
        while self.paused && round < retries {
            round += 1;
            info!("target re-paused after resume, defense round {}", round);
            let _ = log_step("defense delete breakpoints", self.delete_all_breakpoints(deadline));
            let _ = log_step("defense forced continue", self.force_continue());
            self.settle(deadline);
        }
        if self.paused {
            warn!("target still paused after {} defense rounds, giving up", retries);
        }
    }

    /// Query the breakpoint listing and delete every index it names,
    /// highest first so the remaining numbers stay valid.
    fn delete_all_breakpoints(&mut self, deadline: Instant) -> Result<(), Error> {
        let listing =
            self.send_command_locked(consts::BREAK_LIST_CMD, step_budget(deadline))?;
        let mut indices = parse_breakpoint_indices(&listing);
        if indices.is_empty() {
            return Ok(());
        }
        indices.sort_unstable_by(|a, b| b.cmp(a));
        debug!("deleting breakpoints {:?}", indices);
        for index in indices.into_iter() {
            self.send_command_locked(&format!("del {index}"), step_budget(deadline))?;
        }
        self.one_shots.clear();
        Ok(())
    }

    /// Continue without checking the paused flag. A timed-out command
    /// can leave the flag claiming Running while the backend sits at a
    /// prompt; this is the escape hatch for exactly that state.
    pub(crate) fn force_continue(&mut self) -> Result<(), Error> {
        let pid = self.pid.clone();
        let width = self.width;
        let res = self.stream_mut()?.write_command(&pid, width, consts::CONTINUE_CMD);
        if let Err(e) = res {
            self.mark_disconnected();
            return Err(e);
        }
        self.paused = false;
        Ok(())
    }

    /// Give the backend's reader a moment so it is not racing the
    /// socket close. An unsolicited prompt arriving here is the stale
    /// pause the defense rounds deal with.
    fn settle(&mut self, deadline: Instant) {
        let cap = deadline
            .saturating_duration_since(Instant::now())
            .min(consts::CLEANUP_SETTLE_DURATION);
        let settle_deadline = Instant::now() + cap;
        loop {
            let remaining = settle_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            let frame = match self.stream.as_mut() {
                Some(stream) => stream.read_frame(remaining),
                None => return,
            };
            match frame {
                Ok(Frame::Input(pid)) => {
                    self.pid = pid;
                    self.paused = true;
                    return;
                }
                Ok(Frame::Ask { id, .. }) => {
                    if let Some(stream) = self.stream.as_mut() {
                        let _ = stream.write_answer(&id);
                    }
                }
                Ok(_) => {}
                Err(Error::Timeout { .. }) => return,
                Err(_) => {
                    self.mark_disconnected();
                    return;
                }
            }
        }
    }
}

fn step_budget(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now()).min(consts::CLEANUP_STEP_CAP)
}
