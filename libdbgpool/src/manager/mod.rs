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

/*! The multi-session registry.

  Sessions are owned here and keyed by session id; everything outside
  gets `Arc` references whose validity is re-checked by registry lookup.
  The registry mutex is held only across bookkeeping, never across
  protocol traffic: connect/disconnect/reap all collect what they need
  under the lock and do their socket work after releasing it.
*/

use std::{
    collections::HashMap,
    process,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use nix::{sys::signal, unistd::Pid};
use tracing::{info, instrument, span, warn, Level};

use crate::{
    breakpoints::BreakpointStore,
    capture::CaptureFiles,
    config::Config,
    consts,
    error::{Error, ReapReason},
    protocol,
    protocol::Endpoint,
    session::{LaunchInfo, Session, SessionExtras},
};

pub mod reaper;
pub mod signals;

/// Everything `connect` needs to establish one session.
#[derive(Debug)]
pub struct ConnectOptions {
    /// Explicit session id; when absent one is derived from the pid.
    pub session_id: Option<String>,
    pub endpoint: Endpoint,
    /// Present when the adapter launched the target itself.
    pub child: Option<process::Child>,
    pub capture: Option<CaptureFiles>,
    pub launch: Option<LaunchInfo>,
    /// Replay the breakpoint specs recorded from earlier sessions.
    pub restore_breakpoints: bool,
}

impl ConnectOptions {
    pub fn new(endpoint: Endpoint) -> ConnectOptions {
        ConnectOptions {
            session_id: None,
            endpoint,
            child: None,
            capture: None,
            launch: None,
            restore_breakpoints: false,
        }
    }
}

/// A line of `list` output.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub endpoint: String,
    pub pid: String,
    pub paused: bool,
    pub connected_at: DateTime<Local>,
    pub idle: Duration,
}

#[derive(Debug)]
struct ReapedEntry {
    reason: ReapReason,
    pid: String,
    reaped_at: Instant,
}

pub struct SessionManager {
    config: Config,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    /// Calls that omit a session id go here. Reassigned to an arbitrary
    /// survivor when the default session goes away.
    default_id: Mutex<Option<String>>,
    /// Sessions the reaper removed recently, so a later reference gets
    /// a reason instead of a bare "not found". Pruned on every touch.
    reaped: Mutex<HashMap<String, ReapedEntry>>,
    breakpoints: BreakpointStore,
}

impl SessionManager {
    pub fn new(config: Config) -> Arc<SessionManager> {
        Arc::new(SessionManager {
            config,
            sessions: Mutex::new(HashMap::new()),
            default_id: Mutex::new(None),
            reaped: Mutex::new(HashMap::new()),
            breakpoints: BreakpointStore::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn breakpoints(&self) -> &BreakpointStore {
        &self.breakpoints
    }

    /// Spawn the idle reaper. Dropping the returned sender stops it.
    pub fn spawn_reaper(self: &Arc<Self>) -> crossbeam_channel::Sender<()> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let manager = Arc::clone(self);
        thread::spawn(move || {
            if let Err(e) = reaper::run(manager, shutdown_rx) {
                warn!("reaper exited with error: {:?}", e);
            }
        });
        shutdown_tx
    }

    /// Establish a new session.
    ///
    /// Before the new byte stream opens, any existing session with the
    /// same explicit id or the same endpoint is closed; once the
    /// greeting reveals the target pid, sessions on the same pid are
    /// closed too. A second attach to a backend whose first attachment
    /// still holds the stream would hang, so the old one must go first.
    #[instrument(skip_all, fields(ep = %options.endpoint))]
    pub fn connect(&self, options: ConnectOptions) -> Result<Arc<Session>, Error> {
        let conflicts = {
            let _s = span!(Level::INFO, "lock(sessions)").entered();
            let sessions = self.sessions.lock().unwrap();
            sessions
                .iter()
                .filter(|(id, session)| {
                    options.session_id.as_deref() == Some(id.as_str())
                        || session.endpoint == options.endpoint
                })
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>()
        };
        for id in conflicts.into_iter() {
            info!("pre-connect cleanup of conflicting session '{}'", id);
            if let Err(e) = self.disconnect(Some(&id)) {
                warn!("pre-connect cleanup of '{}': {:?}", id, e);
            }
        }

        let (stream, greeting) = protocol::connect(
            &options.endpoint,
            &self.config.protocol_version(),
            self.config.output_width(),
            &self.config.auth_cookie(),
            consts::HANDSHAKE_TIMEOUT,
        )?;

        // now that the pid is known, close anything else attached to
        // the same target (greeting-time pids, so no session locks are
        // touched while the registry lock is held)
        let pid_conflicts = {
            let _s = span!(Level::INFO, "lock(sessions)").entered();
            let sessions = self.sessions.lock().unwrap();
            sessions
                .iter()
                .filter(|(_, session)| {
                    let (_, raw_pid, _) = session.raw_parts();
                    raw_pid == greeting.pid
                })
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>()
        };
        for id in pid_conflicts.into_iter() {
            info!("pre-connect cleanup of session '{}' on pid {}", id, greeting.pid);
            if let Err(e) = self.disconnect(Some(&id)) {
                warn!("pre-connect cleanup of '{}': {:?}", id, e);
            }
        }

        let id = options
            .session_id
            .clone()
            .unwrap_or_else(|| format!("pid-{}", greeting.pid));
        let session = Arc::new(Session::new(
            id.clone(),
            options.endpoint,
            stream,
            greeting.pid.clone(),
            self.config.output_width(),
            SessionExtras {
                child: options.child,
                capture: options.capture,
                launch: options.launch,
            },
        )?);

        {
            let _s = span!(Level::INFO, "lock(sessions)").entered();
            let mut sessions = self.sessions.lock().unwrap();
            sessions.insert(id.clone(), Arc::clone(&session));
            *self.default_id.lock().unwrap() = Some(id.clone());
        }
        info!("connected session '{}' to pid {}", id, greeting.pid);

        if options.restore_breakpoints {
            if let Err(e) =
                self.breakpoints.restore_on(&session, self.config.command_timeout())
            {
                warn!("restoring breakpoints on '{}': {:?}", id, e);
            }
        }

        Ok(session)
    }

    /// Resolve a session reference, touching its activity clock.
    pub fn client(&self, session_id: Option<&str>) -> Result<Arc<Session>, Error> {
        let resolved = {
            let _s = span!(Level::INFO, "lock(sessions)").entered();
            let sessions = self.sessions.lock().unwrap();
            let id = match session_id {
                Some(id) => Some(String::from(id)),
                None => self.default_id.lock().unwrap().clone(),
            };
            match id {
                None => return Err(Error::NoSession),
                Some(id) => match sessions.get(&id) {
                    Some(session) => Ok(Arc::clone(session)),
                    None => Err(id),
                },
            }
        };
        match resolved {
            Ok(session) => {
                session.touch();
                Ok(session)
            }
            Err(id) => Err(self.missing_session_diagnostic(&id)),
        }
    }

    /// Remove a session from the registry, resume its target, and close
    /// it. Returns the id that was disconnected.
    #[instrument(skip_all)]
    pub fn disconnect(&self, session_id: Option<&str>) -> Result<String, Error> {
        let session = {
            let _s = span!(Level::INFO, "lock(sessions)").entered();
            let mut sessions = self.sessions.lock().unwrap();
            let id = match session_id {
                Some(id) => String::from(id),
                None => self.default_id.lock().unwrap().clone().ok_or(Error::NoSession)?,
            };
            let session = match sessions.remove(&id) {
                Some(session) => session,
                None => return Err(self.missing_session_diagnostic(&id)),
            };
            let mut default = self.default_id.lock().unwrap();
            if default.as_deref() == Some(id.as_str()) {
                *default = sessions.keys().next().cloned();
            }
            session
        };

        session.resume_before_disconnect(
            consts::DISCONNECT_DEADLINE,
            self.config.resume_retries(),
        );
        session.close();
        info!("disconnected session '{}'", session.id);
        Ok(session.id.clone())
    }

    /// Drop every session at once, resuming targets with raw frames.
    ///
    /// This is the signal path: no session mutex is taken (a stuck
    /// command thread may hold one), no protocol reads happen, and the
    /// only blocking is one bounded sleep between the resume writes and
    /// the socket shutdowns. Idempotent: the registry drains once.
    pub fn disconnect_all(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().unwrap();
            *self.default_id.lock().unwrap() = None;
            sessions.drain().map(|(_, session)| session).collect()
        };
        if drained.is_empty() {
            return;
        }

        info!("raw-resuming {} session(s) before close", drained.len());
        for session in drained.iter() {
            session.write_raw_resume();
        }
        thread::sleep(consts::RAW_RESUME_SLEEP);
        for session in drained.iter() {
            let (raw, _, _) = session.raw_parts();
            raw.shutdown();
        }
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        // clone the references out so no session lock is taken while
        // the registry lock is held
        let sessions: Vec<Arc<Session>> = {
            let _s = span!(Level::INFO, "lock(sessions)").entered();
            self.sessions.lock().unwrap().values().map(Arc::clone).collect()
        };
        let mut summaries: Vec<SessionSummary> = sessions
            .iter()
            .map(|session| SessionSummary {
                id: session.id.clone(),
                endpoint: session.endpoint.to_string(),
                pid: session.pid(),
                paused: session.is_paused(),
                connected_at: DateTime::from(session.connected_at),
                idle: session.idle_for(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn session_ids(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap();
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    // Breakpoint-spec persistence, delegated to the store so the tool
    // surface has one place to call.

    pub fn record_breakpoint(&self, spec: &str) {
        self.breakpoints.record(spec);
    }

    pub fn remove_breakpoint_specs_matching(&self, needle: &str) {
        self.breakpoints.remove_matching(needle);
    }

    pub fn clear_breakpoint_specs(&self) {
        self.breakpoints.clear();
    }

    pub fn restore_breakpoints(&self, session_id: Option<&str>) -> Result<usize, Error> {
        let session = self.client(session_id)?;
        self.breakpoints.restore_on(&session, self.config.command_timeout())
    }

    /// One reaper pass: classify every session, pull the stale ones out
    /// of the registry, then resume and close them with the lock
    /// released.
    pub(crate) fn reap_stale_sessions(&self) {
        let idle_limit = self.config.idle_timeout();
        let stale: Vec<(Arc<Session>, ReapReason)> = {
            let _s = span!(Level::INFO, "lock(sessions)").entered();
            let mut sessions = self.sessions.lock().unwrap();
            let stale_ids: Vec<(String, ReapReason)> = sessions
                .iter()
                .filter_map(|(id, session)| {
                    classify_stale(session, idle_limit).map(|reason| (id.clone(), reason))
                })
                .collect();
            let mut stale = Vec::new();
            for (id, reason) in stale_ids.into_iter() {
                if let Some(session) = sessions.remove(&id) {
                    stale.push((session, reason));
                }
            }
            if !stale.is_empty() {
                let mut default = self.default_id.lock().unwrap();
                if let Some(id) = default.as_deref() {
                    if !sessions.contains_key(id) {
                        *default = sessions.keys().next().cloned();
                    }
                }
            }
            stale
        };

        for (session, reason) in stale.into_iter() {
            info!("reaping session '{}': {:?}", session.id, reason);
            if matches!(reason, ReapReason::IdleTimeout { .. }) {
                // only an idle session still has a live backend worth
                // resuming gracefully
                session.resume_before_disconnect(
                    consts::REAPER_CLEANUP_DEADLINE,
                    self.config.resume_retries(),
                );
            }
            let pid = session.pid();
            session.close();

            let mut reaped = self.reaped.lock().unwrap();
            prune_reaped(&mut reaped);
            reaped.insert(
                session.id.clone(),
                ReapedEntry { reason, pid, reaped_at: Instant::now() },
            );
        }
    }

    fn missing_session_diagnostic(&self, id: &str) -> Error {
        let mut reaped = self.reaped.lock().unwrap();
        prune_reaped(&mut reaped);
        match reaped.get(id) {
            Some(entry) => {
                info!(
                    "lookup of reaped session '{}' (pid {}): {:?}",
                    id, entry.pid, entry.reason
                );
                Error::Reaped {
                    id: String::from(id),
                    reason: entry.reason,
                    ago: entry.reaped_at.elapsed(),
                }
            }
            None => Error::UnknownSession(String::from(id)),
        }
    }
}

fn prune_reaped(reaped: &mut HashMap<String, ReapedEntry>) {
    reaped.retain(|_, entry| entry.reaped_at.elapsed() <= consts::REAPED_ENTRY_TTL);
}

/// Decide whether a session is worth keeping. `None` means alive. A
/// session whose mutex is busy is mid round trip, which is the opposite
/// of stale, so it is skipped without blocking.
fn classify_stale(session: &Session, idle_limit: Duration) -> Option<ReapReason> {
    let connected = match session.inner.try_lock() {
        Ok(inner) => inner.stream.is_some(),
        Err(_) => return None,
    };
    if !connected {
        return Some(ReapReason::SocketClosed);
    }

    let (_, raw_pid, _) = session.raw_parts();
    if let Ok(pid) = raw_pid.parse::<i32>() {
        if signal::kill(Pid::from_raw(pid), None).is_err() {
            return Some(ReapReason::ProcessDied);
        }
    }

    if session.idle_for() > idle_limit {
        return Some(ReapReason::IdleTimeout { limit: idle_limit });
    }
    None
}
