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

/*! The synchronous request/response primitive.

  One command round trip: drain whatever a previous timed-out or
  interrupted command left in the stream, write the frame, then read
  until the terminating `input` prompt. The drain is what keeps the
  protocol in sync: it claims any unclaimed prompt (restoring the
  authoritative paused flag) so a command never reads its predecessor's
  response.
*/

use std::time::{Duration, Instant};

use tracing::{debug, instrument, trace};

use crate::{
    consts,
    error::Error,
    protocol::Frame,
    session::{Session, SessionInner},
};

impl Session {
    /// Run one command at the backend prompt and return its output.
    ///
    /// The output is the concatenation of `out` lines (newline-joined)
    /// received before the prompt came back. On timeout the session is
    /// left flagged not-paused until a later drain reconciles it, and
    /// no partial output is returned.
    #[instrument(skip_all, fields(s = self.id))]
    pub fn send_command(&self, payload: &str, timeout: Duration) -> Result<String, Error> {
        self.touch();
        let mut inner = self.inner.lock().unwrap();
        inner.send_command_locked(payload, timeout)
    }

    /// Ask the backend for the exception currently being raised.
    /// Whitespace or `nil` replies mean none.
    pub fn check_current_exception(&self, timeout: Duration) -> Result<Option<String>, Error> {
        let out = self.send_command(consts::CURRENT_EXCEPTION_CMD, timeout)?;
        let mut text = out.trim();
        if let Some(rest) = text.strip_prefix("=>") {
            text = rest.trim();
        }
        let text = text.trim_matches('"');
        if text.is_empty() || text == "nil" {
            Ok(None)
        } else {
            Ok(Some(String::from(text)))
        }
    }
}

impl SessionInner {
    /// Non-blocking sweep of whatever is already buffered. Output lines
    /// are appended to `out`, `ask` prompts are answered, and the sweep
    /// stops as soon as an `input` prompt is claimed (bytes past it are
    /// left for the next reader). Returns whether a prompt was claimed.
    pub(crate) fn claim_buffered(&mut self, out: &mut String) -> Result<bool, Error> {
        loop {
            let frame = match self.stream.as_mut() {
                Some(stream) => stream.try_read_frame(),
                None => return Ok(false),
            };
            match frame {
                Ok(Some(Frame::Out(text))) => {
                    out.push_str(&text);
                    out.push('\n');
                }
                Ok(Some(Frame::Input(pid))) => {
                    self.pid = pid;
                    self.paused = true;
                    return Ok(true);
                }
                Ok(Some(Frame::Ask { id, .. })) => self.answer_ask(&id)?,
                Ok(Some(Frame::Quit)) => {
                    self.last_output = out.clone();
                    self.mark_disconnected();
                    return Err(Error::SessionEnded { output: out.clone() });
                }
                Ok(None) => return Ok(false),
                Err(e @ Error::ConnectionLost(_)) => {
                    self.mark_disconnected();
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Consume every frame a previous command left behind. The latest
    /// buffered `input` wins: it updates the authoritative pid and marks
    /// the session Paused. Drained output is discarded.
    pub(crate) fn drain_stale(&mut self) -> Result<(), Error> {
        let mut scratch = String::new();
        let mut prompts = 0u32;
        while self.claim_buffered(&mut scratch)? {
            prompts += 1;
        }
        if prompts > 0 || !scratch.is_empty() {
            debug!(
                "drained stale data: {} prompts, {} output bytes",
                prompts,
                scratch.len()
            );
            trace!("stale output: {}", scratch);
        }
        Ok(())
    }

    pub(crate) fn send_command_locked(
        &mut self,
        payload: &str,
        timeout: Duration,
    ) -> Result<String, Error> {
        if self.stream.is_none() {
            return Err(Error::NotConnected);
        }
        self.drain_stale()?;
        if !self.paused {
            return Err(Error::NotPaused);
        }

        let pid = self.pid.clone();
        let width = self.width;
        if let Err(e) = self.stream_mut()?.write_command(&pid, width, payload) {
            self.mark_disconnected();
            return Err(e);
        }
        self.read_response(timeout)
    }

    fn read_response(&mut self, timeout: Duration) -> Result<String, Error> {
        let deadline = Instant::now() + timeout;
        let mut out = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = self.stream_mut()?.read_frame(remaining);
            match frame {
                Ok(Frame::Out(text)) => {
                    out.push_str(&text);
                    out.push('\n');
                }
                Ok(Frame::Input(pid)) => {
                    self.pid = pid;
                    self.paused = true;
                    self.last_output = out.clone();
                    return Ok(out);
                }
                Ok(Frame::Ask { id, .. }) => self.answer_ask(&id)?,
                Ok(Frame::Quit) => {
                    self.last_output = out.clone();
                    self.mark_disconnected();
                    return Err(Error::SessionEnded { output: out });
                }
                Err(Error::Timeout { .. }) => {
                    // the prompt may have raced the deadline; claim it if
                    // it is already here, otherwise report the timeout
                    if self.claim_buffered(&mut out)? {
                        self.last_output = out.clone();
                        return Ok(out);
                    }
                    self.paused = false;
                    self.last_output = out.clone();
                    return Err(Error::Timeout { timeout });
                }
                Err(e @ Error::ConnectionLost(_)) => {
                    self.mark_disconnected();
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn answer_ask(&mut self, id: &str) -> Result<(), Error> {
        trace!("auto-answering ask {}", id);
        let res = self.stream_mut()?.write_answer(id);
        if let Err(e) = res {
            self.mark_disconnected();
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::testutil::{paired_session, read_lines};
    use ntest::timeout;
    use std::{io::Write, thread};

    #[test]
    #[timeout(30000)]
    fn round_trip_returns_output_until_prompt() {
        let (session, backend) = paired_session("12345");
        let backend_side = backend.try_clone().expect("clone");

        let reader = thread::spawn(move || {
            let lines = read_lines(&backend_side, 1);
            assert_eq!(lines[0], "command 12345 500 p 1+1");
            let mut w = &backend_side;
            w.write_all(b"out => 2\ninput 12345\n").expect("write");
        });

        let out = session.send_command("p 1+1", Duration::from_secs(5)).expect("round trip");
        assert_eq!(out, "=> 2\n");
        assert!(session.is_paused());
        reader.join().expect("join");
    }

    #[test]
    #[timeout(30000)]
    fn refuses_to_send_while_running() {
        let (session, _backend) = paired_session("1");
        session.inner.lock().unwrap().paused = false;

        match session.send_command("p 1", Duration::from_secs(1)) {
            Err(Error::NotPaused) => {}
            other => panic!("expected NotPaused, got {other:?}"),
        }
    }

    #[test]
    #[timeout(30000)]
    fn timeout_then_drain_restores_correspondence() {
        let (session, mut backend) = paired_session("1");
        let backend_side = backend.try_clone().expect("clone");

        let reader = thread::spawn(move || {
            let first = read_lines(&backend_side, 1);
            assert_eq!(first[0], "command 1 500 p slow");
            // sit on the first command; only the second gets a reply
            let second = read_lines(&backend_side, 1);
            assert_eq!(second[0], "command 1 500 p 2+2");
            let mut w = &backend_side;
            w.write_all(b"out => 4\ninput 1\n").expect("write");
        });

        match session.send_command("p slow", Duration::from_millis(100)) {
            Err(Error::Timeout { .. }) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(!session.is_paused());

        // the delayed response lands after the deadline; the next
        // command's drain must eat it
        backend.write_all(b"out => :late\ninput 1\n").expect("write");
        thread::sleep(Duration::from_millis(50));

        let out = session.send_command("p 2+2", Duration::from_secs(5)).expect("fresh");
        assert_eq!(out, "=> 4\n");
        assert!(!out.contains(":late"));
        reader.join().expect("join");
    }

    #[test]
    #[timeout(30000)]
    fn asks_are_answered_automatically() {
        let (session, backend) = paired_session("1");
        let backend_side = backend.try_clone().expect("clone");

        let reader = thread::spawn(move || {
            let lines = read_lines(&backend_side, 1);
            assert_eq!(lines[0], "command 1 500 reload");
            let mut w = &backend_side;
            w.write_all(b"ask 7 really reload?\n").expect("write");
            let answer = read_lines(&backend_side, 1);
            assert_eq!(answer[0], "answer 7 y");
            w.write_all(b"out reloaded\ninput 1\n").expect("write");
        });

        let out = session.send_command("reload", Duration::from_secs(5)).expect("round trip");
        assert_eq!(out, "reloaded\n");
        reader.join().expect("join");
    }

    #[test]
    #[timeout(30000)]
    fn quit_mid_command_ends_session_with_output() {
        let (session, mut backend) = paired_session("1");
        backend.write_all(b"out bye\nquit\n").expect("write");

        // wait for the frames to be visible before the command drains
        thread::sleep(Duration::from_millis(50));
        let err = session.send_command("p 1", Duration::from_secs(5));
        match err {
            Err(Error::SessionEnded { output }) => assert!(output.contains("bye")),
            other => panic!("expected session end, got {other:?}"),
        }
        assert!(!session.is_connected());
    }

    #[test]
    #[timeout(30000)]
    fn current_exception_parses_nil_and_values() {
        let (session, backend) = paired_session("1");
        let backend_side = backend.try_clone().expect("clone");

        let reader = thread::spawn(move || {
            for reply in [b"out => nil\ninput 1\n".as_slice(), b"out => \"RuntimeError: boom\"\ninput 1\n".as_slice()] {
                let _ = read_lines(&backend_side, 1);
                let mut w = &backend_side;
                w.write_all(reply).expect("write");
            }
        });

        assert_eq!(session.check_current_exception(Duration::from_secs(5)).expect("none"), None);
        assert_eq!(
            session.check_current_exception(Duration::from_secs(5)).expect("some"),
            Some(String::from("RuntimeError: boom"))
        );
        reader.join().expect("join");
    }
}
