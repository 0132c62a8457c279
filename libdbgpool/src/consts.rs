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

use std::time;

/// Version string advertised in the greeting line. Backends tolerate a
/// minor mismatch; override with the `protocol_version` config setting
/// when talking to a picky one.
pub const PROTOCOL_VERSION: &str = "1.11.0";

/// Output width advertised in the greeting and echoed in every command
/// frame, in columns.
pub const DEFAULT_OUTPUT_WIDTH: u16 = 500;

pub const DEFAULT_COMMAND_TIMEOUT: time::Duration = time::Duration::from_secs(30);
pub const HANDSHAKE_TIMEOUT: time::Duration = time::Duration::from_secs(10);

// Cadence for checking the interrupt predicate while the target runs.
pub const EXEC_POLL_DURATION: time::Duration = time::Duration::from_millis(500);

// After an execution deadline expires, a breakpoint hit may already be in
// flight. We linger this long before reporting the timeout so an `input`
// frame that races the deadline still gets claimed.
pub const EXEC_GRACE_DURATION: time::Duration = time::Duration::from_secs(1);

pub const DEFAULT_IDLE_TIMEOUT: time::Duration = time::Duration::from_secs(30 * 60);
pub const DEFAULT_REAP_POLL_INTERVAL: time::Duration = time::Duration::from_secs(60);

/// How long a reaped session id keeps producing a diagnostic instead of
/// a bare "not found".
pub const REAPED_ENTRY_TTL: time::Duration = time::Duration::from_secs(10 * 60);

// Resume-before-disconnect budgets. No single step may eat the whole
// deadline, so each is additionally capped.
pub const CLEANUP_STEP_CAP: time::Duration = time::Duration::from_secs(2);
pub const CLEANUP_SETTLE_DURATION: time::Duration = time::Duration::from_secs(2);
pub const DISCONNECT_DEADLINE: time::Duration = time::Duration::from_secs(10);
pub const REAPER_CLEANUP_DEADLINE: time::Duration = time::Duration::from_secs(5);
pub const DEFAULT_RESUME_RETRIES: u32 = 2;

// The signal path cannot query the breakpoint listing, so it deletes a
// fixed index range. Breakpoints numbered past the limit leak.
pub const RAW_RESUME_INDEX_LIMIT: u32 = 10;
pub const RAW_RESUME_SLEEP: time::Duration = time::Duration::from_millis(300);

/// Lists breakpoints. The reply lines carry `#<n>` indices.
pub const BREAK_LIST_CMD: &str = "break";

pub const CONTINUE_CMD: &str = "c";

/// Locks a freshly allocated mutex in the target. In a signal-handler
/// (trap) context the backend host refuses this with a thread error,
/// which is how we detect trap context. Advisory only.
pub const TRAP_PROBE_CMD: &str = "p ::Thread::Mutex.new.synchronize { :ok }";

/// Undoes the stdout redirection that output-capturing evals install.
pub const RESTORE_STDOUT_CMD: &str = "eval $stdout = STDOUT";

/// Puts back the interrupt handler an eval may have saved aside.
pub const RESTORE_INT_HANDLER_CMD: &str =
    "eval Signal.trap('INT', $__saved_int_handler) if defined?($__saved_int_handler) && $__saved_int_handler";

/// Asks the backend for the exception currently being raised, if any.
/// A blank or `nil` reply means none.
pub const CURRENT_EXCEPTION_CMD: &str =
    "p $! ? \"#{$!.class}: #{$!.message}\" : nil";

/// How long the exit detector waits for a launched target to finish.
pub const EXIT_WAIT_TIMEOUT: time::Duration = time::Duration::from_secs(5);
pub const EXIT_WAIT_POLL: time::Duration = time::Duration::from_millis(100);
