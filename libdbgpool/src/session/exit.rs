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

/*! Post-mortem for a finished target.

  Given the session's last protocol output and whatever streams were
  captured, work out how the target died: clean exit, error exit,
  signal, or an unhandled exception fished out of the text. Everything
  here is pure over its inputs; no socket traffic.
*/

use std::{
    fmt::Write as _,
    os::unix::process::ExitStatusExt as _,
    process, thread,
    time::{Duration, Instant},
};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::instrument;

use crate::{consts, session::Session};

lazy_static! {
    /// The host language's backtrace head: `path:line:in 'method': msg (Class)`.
    /// Both the old backquote and the new single-quote style appear in
    /// the wild.
    static ref BACKTRACE_HEAD_RE: Regex = Regex::new(
        r"(?m)^\s*([^\s:]+):(\d+):in [`']([^']+)': (.+) \(([A-Z][A-Za-z0-9_]*(?:::[A-Z][A-Za-z0-9_]*)*)\)\s*$"
    )
    .unwrap();

    /// The bare `Class: message` form some runtimes print instead.
    static ref LEADING_EXCEPTION_RE: Regex = Regex::new(
        r"(?m)^([A-Z][A-Za-z0-9_]*(?:::[A-Z][A-Za-z0-9_]*)*(?:Error|Exception|Interrupt)): (.+)$"
    )
    .unwrap();
}

/// How the target process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    ErrorExit(i32),
    Signaled(i32),
    /// We never held a handle on the process (attach case), or it has
    /// not exited yet.
    NotAvailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnhandledException {
    pub class: String,
    pub message: String,
    /// `path:line in 'method'` when the backtrace head was found.
    pub location: Option<String>,
}

/// Poll the child until it exits or the budget runs out.
fn wait_for_exit(child: &mut process::Child, budget: Duration) -> Option<process::ExitStatus> {
    let deadline = Instant::now() + budget;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(_) => return None,
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(consts::EXIT_WAIT_POLL);
    }
}

fn classify_exit(status: Option<process::ExitStatus>) -> ExitKind {
    match status {
        None => ExitKind::NotAvailable,
        Some(status) => match status.code() {
            Some(0) => ExitKind::Success,
            Some(code) => ExitKind::ErrorExit(code),
            None => match status.signal() {
                Some(sig) => ExitKind::Signaled(sig),
                None => ExitKind::NotAvailable,
            },
        },
    }
}

/// Look for an unhandled exception, preferring stderr over debugger
/// output and the backtrace head over the bare form.
pub(crate) fn scan_exception(
    stderr: Option<&str>,
    debugger_output: &str,
) -> Option<UnhandledException> {
    for source in [stderr.unwrap_or(""), debugger_output] {
        if let Some(caps) = BACKTRACE_HEAD_RE.captures(source) {
            return Some(UnhandledException {
                class: String::from(&caps[5]),
                message: String::from(&caps[4]),
                location: Some(format!("{}:{} in '{}'", &caps[1], &caps[2], &caps[3])),
            });
        }
        if let Some(caps) = LEADING_EXCEPTION_RE.captures(source) {
            return Some(UnhandledException {
                class: String::from(&caps[1]),
                message: String::from(&caps[2]),
                location: None,
            });
        }
    }
    None
}

pub(crate) fn compose_post_mortem(
    kind: &ExitKind,
    stdout: Option<&str>,
    stderr: Option<&str>,
    debugger_output: &str,
) -> String {
    let mut msg = String::from("Target process finished.\n");
    match kind {
        ExitKind::Success => msg.push_str("Exit status: 0 (clean exit)\n"),
        ExitKind::ErrorExit(code) => {
            let _ = writeln!(msg, "Exit status: {code} (error exit)");
        }
        ExitKind::Signaled(sig) => {
            let _ = writeln!(msg, "Terminated by signal {sig}");
        }
        ExitKind::NotAvailable => {
            msg.push_str("Exit status: not available (target was not launched by the adapter)\n");
        }
    }

    if let Some(exception) = scan_exception(stderr, debugger_output) {
        let _ = writeln!(
            msg,
            "Unhandled exception: {}: {}",
            exception.class, exception.message
        );
        if let Some(location) = exception.location {
            let _ = writeln!(msg, "  raised at {location}");
        }
    }

    let captured = stdout.is_some() || stderr.is_some();
    if let Some(stdout) = stdout {
        msg.push_str("\n--- captured stdout ---\n");
        msg.push_str(stdout);
        if !stdout.ends_with('\n') {
            msg.push('\n');
        }
    }
    if let Some(stderr) = stderr {
        msg.push_str("\n--- captured stderr ---\n");
        msg.push_str(stderr);
        if !stderr.ends_with('\n') {
            msg.push('\n');
        }
    }
    if !captured {
        if !debugger_output.trim().is_empty() {
            msg.push_str("\n--- last debugger output ---\n");
            msg.push_str(debugger_output);
            if !debugger_output.ends_with('\n') {
                msg.push('\n');
            }
        }
        msg.push_str(
            "\nstdout/stderr were not captured for this session; launch the target through the adapter to capture them.\n",
        );
    }
    msg
}

impl Session {
    /// Build the post-mortem for a target that stopped talking to us,
    /// waiting up to `wait` for a held process handle to report its
    /// exit status.
    #[instrument(skip_all, fields(s = self.id))]
    pub fn process_finished(&self, wait: Duration) -> String {
        self.touch();
        let mut inner = self.inner.lock().unwrap();
        let kind = match inner.child.as_mut() {
            Some(child) => classify_exit(wait_for_exit(child, wait)),
            None => ExitKind::NotAvailable,
        };
        let stdout = inner.capture.as_ref().and_then(|c| c.read_stdout());
        let stderr = inner.capture.as_ref().and_then(|c| c.read_stderr());
        let debugger_output = inner.last_output.clone();
        compose_post_mortem(&kind, stdout.as_deref(), stderr.as_deref(), &debugger_output)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    #[test]
    fn exception_scanning() {
        let cases = vec![
            (
                None,
                "/tmp/a.rb:3:in 'divide': divided by 0 (ZeroDivisionError)\n",
                Some(UnhandledException {
                    class: String::from("ZeroDivisionError"),
                    message: String::from("divided by 0"),
                    location: Some(String::from("/tmp/a.rb:3 in 'divide'")),
                }),
            ),
            (
                // the old backquote style
                None,
                "/tmp/a.rb:3:in `divide': divided by 0 (ZeroDivisionError)\n",
                Some(UnhandledException {
                    class: String::from("ZeroDivisionError"),
                    message: String::from("divided by 0"),
                    location: Some(String::from("/tmp/a.rb:3 in 'divide'")),
                }),
            ),
            (
                None,
                "RuntimeError: boom\n",
                Some(UnhandledException {
                    class: String::from("RuntimeError"),
                    message: String::from("boom"),
                    location: None,
                }),
            ),
            (
                None,
                "ActiveRecord::RecordNotFoundError: no such row\n",
                Some(UnhandledException {
                    class: String::from("ActiveRecord::RecordNotFoundError"),
                    message: String::from("no such row"),
                    location: None,
                }),
            ),
            (None, "everything is fine\n", None),
            // stderr wins over debugger output
            (
                Some("/tmp/b.rb:9:in 'main': oops (StandardError)\n"),
                "RuntimeError: boom\n",
                Some(UnhandledException {
                    class: String::from("StandardError"),
                    message: String::from("oops"),
                    location: Some(String::from("/tmp/b.rb:9 in 'main'")),
                }),
            ),
        ];

        for (stderr, output, want) in cases.into_iter() {
            assert_eq!(scan_exception(stderr, output), want, "scanning {output:?}");
        }
    }

    #[test]
    fn post_mortem_composition() {
        let msg = compose_post_mortem(
            &ExitKind::ErrorExit(1),
            Some("hello from target\n"),
            Some("RuntimeError: boom\n"),
            "",
        );
        assert!(msg.contains("Exit status: 1"));
        assert!(msg.contains("Unhandled exception: RuntimeError: boom"));
        assert!(msg.contains("captured stdout"));
        assert!(msg.contains("hello from target"));
        assert!(!msg.contains("were not captured"));

        let msg = compose_post_mortem(&ExitKind::Success, None, None, "out of band\n");
        assert!(msg.contains("clean exit"));
        assert!(msg.contains("last debugger output"));
        assert!(msg.contains("were not captured"));
    }

    #[test]
    #[timeout(30000)]
    fn classifies_real_child_exits() {
        let mut child = process::Command::new("/bin/sh")
            .args(["-c", "exit 3"])
            .spawn()
            .expect("spawn");
        let kind = classify_exit(wait_for_exit(&mut child, consts::EXIT_WAIT_TIMEOUT));
        assert_eq!(kind, ExitKind::ErrorExit(3));

        let mut child = process::Command::new("/bin/sh")
            .args(["-c", "sleep 30"])
            .spawn()
            .expect("spawn");
        child.kill().expect("kill");
        let kind = classify_exit(wait_for_exit(&mut child, Duration::from_secs(5)));
        assert_eq!(kind, ExitKind::Signaled(libc::SIGKILL));

        let mut child =
            process::Command::new("/bin/sh").args(["-c", "sleep 30"]).spawn().expect("spawn");
        let kind = classify_exit(wait_for_exit(&mut child, Duration::from_millis(200)));
        assert_eq!(kind, ExitKind::NotAvailable);
        child.kill().expect("kill");
        let _ = child.wait();
    }
}
