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

use std::{thread, time::Duration};

use libdbgpool::{
    Config, ConnectOptions, Endpoint, Error, ExecOutcome, ReapReason, SessionManager,
};
use ntest::timeout;

mod support;
use support::{out_input, FakeBackend, Response};

fn tcp(port: u16) -> Endpoint {
    Endpoint::Tcp { host: String::from("127.0.0.1"), port }
}

/// The standard cleanup replies every backend needs: an empty listing
/// for `break`, silence for `c`.
fn cleanup_replies(payload: &str, pid: u32) -> Option<Response> {
    match payload {
        "break" => Some(out_input(&["no breakpoints"], pid)),
        "c" => Some(Response::Silent),
        _ => None,
    }
}

#[test]
#[timeout(60000)]
fn attach_evaluate_detach() {
    let pid = std::process::id();
    let backend = FakeBackend::spawn(Box::new(move |payload| {
        cleanup_replies(payload, pid).unwrap_or_else(|| match payload {
            "p 1+1" => out_input(&["=> 2"], pid),
            _ => out_input(&["=> nil"], pid),
        })
    }));

    let manager = SessionManager::new(Config::default());
    let session =
        manager.connect(ConnectOptions::new(tcp(backend.port))).expect("connect");
    assert!(session.is_paused());
    assert_eq!(session.pid(), backend.pid.to_string());

    let out = session.send_command("p 1+1", Duration::from_secs(5)).expect("eval");
    assert_eq!(out, "=> 2\n");
    assert!(session.is_paused());

    manager.disconnect(None).expect("disconnect");
    assert!(manager.session_ids().is_empty());
    assert!(!session.is_connected());

    thread::sleep(Duration::from_millis(200));
    let seen = backend.seen();
    assert!(seen.iter().any(|f| f == "<disconnect>"), "socket not closed: {seen:?}");
    // the disconnect path resumed the target before closing
    assert!(seen.iter().any(|f| f == "c"), "no resume before close: {seen:?}");

    match manager.client(None) {
        Err(Error::NoSession) => {}
        other => panic!("expected NoSession after disconnect, got {other:?}"),
    }
}

#[test]
#[timeout(60000)]
fn breakpoint_hit_under_continue() {
    let pid = std::process::id();
    let backend = FakeBackend::spawn(Box::new(move |payload| match payload {
        "c" => Response::Delayed(
            Duration::from_millis(200),
            vec![
                String::from("out Stop by #0  BP - Line /tmp/a.rb:3"),
                format!("input {pid}"),
            ],
        ),
        "del 0" => out_input(&["deleted breakpoint #0"], pid),
        other => cleanup_replies(other, pid).unwrap_or(Response::Silent),
    }));

    let manager = SessionManager::new(Config::default());
    let session =
        manager.connect(ConnectOptions::new(tcp(backend.port))).expect("connect");
    session.register_one_shot(0);

    let outcome = session
        .continue_and_wait(Duration::from_secs(10), &|| false)
        .expect("continue");
    let output = match outcome {
        ExecOutcome::Breakpoint { output } => output,
        other => panic!("expected breakpoint, got {other:?}"),
    };
    assert!(output.contains("Stop by #0"));
    assert!(session.is_paused());

    // the one-shot registry deletes the hit breakpoint
    let deleted =
        session.cleanup_one_shots(&output, Duration::from_secs(5)).expect("one shots");
    assert_eq!(deleted, vec![0]);
    assert!(backend.seen().iter().any(|f| f == "del 0"));
}

#[test]
#[timeout(60000)]
fn timeout_then_recovery() {
    let pid = std::process::id();
    let backend = FakeBackend::spawn(Box::new(move |payload| match payload {
        "p slow" => Response::Delayed(
            Duration::from_millis(1200),
            vec![String::from("out => :late"), format!("input {pid}")],
        ),
        "p 2+2" => out_input(&["=> 4"], pid),
        other => cleanup_replies(other, pid).unwrap_or(Response::Silent),
    }));

    let manager = SessionManager::new(Config::default());
    let session =
        manager.connect(ConnectOptions::new(tcp(backend.port))).expect("connect");

    match session.send_command("p slow", Duration::from_millis(300)) {
        Err(Error::Timeout { .. }) => {}
        other => panic!("expected timeout, got {other:?}"),
    }

    // let the delayed response land, stale, in the stream
    thread::sleep(Duration::from_millis(1200));

    // the next command's drain swallows it and the fresh response
    // corresponds to the fresh command
    let out = session.send_command("p 2+2", Duration::from_secs(5)).expect("fresh");
    assert_eq!(out, "=> 4\n");
    assert!(!out.contains(":late"));
}

#[test]
#[timeout(60000)]
fn idle_reap_then_diagnostic() {
    let pid = std::process::id();
    let backend = FakeBackend::spawn(Box::new(move |payload| {
        cleanup_replies(payload, pid).unwrap_or_else(|| out_input(&["=> nil"], pid))
    }));

    let config = Config {
        idle_timeout: Some(String::from("1s")),
        reap_poll_interval: Some(String::from("1s")),
        ..Config::default()
    };
    let manager = SessionManager::new(config);
    let mut options = ConnectOptions::new(tcp(backend.port));
    options.session_id = Some(String::from("s1"));
    manager.connect(options).expect("connect");

    let _reaper = manager.spawn_reaper();

    // idle past the limit plus a poll tick plus the cleanup settle
    thread::sleep(Duration::from_secs(6));

    match manager.client(Some("s1")) {
        Err(err @ Error::Reaped { reason: ReapReason::IdleTimeout { .. }, .. }) => {
            let msg = err.to_string();
            assert!(
                msg.contains("automatically disconnected after 1s of inactivity"),
                "bad diagnostic: {msg}"
            );
            assert!(msg.contains("ago"), "bad diagnostic: {msg}");
        }
        other => panic!("expected reaped diagnostic, got {other:?}"),
    }
    assert!(manager.session_ids().is_empty());

    // the reaper resumed the target before closing the socket
    let seen = backend.seen();
    assert!(seen.iter().any(|f| f == "c"), "no resume before reap: {seen:?}");
}

#[test]
#[timeout(60000)]
fn reattach_to_same_endpoint_replaces_session() {
    let pid = std::process::id();
    let backend = FakeBackend::spawn(Box::new(move |payload| {
        cleanup_replies(payload, pid).unwrap_or_else(|| out_input(&["=> :ok"], pid))
    }));

    let manager = SessionManager::new(Config::default());

    let mut options = ConnectOptions::new(tcp(backend.port));
    options.session_id = Some(String::from("s1"));
    let first = manager.connect(options).expect("connect s1");

    let mut options = ConnectOptions::new(tcp(backend.port));
    options.session_id = Some(String::from("s2"));
    let second = manager.connect(options).expect("connect s2");

    // exactly one session survives, and it is the new one
    assert_eq!(manager.session_ids(), vec![String::from("s2")]);
    assert!(!first.is_connected());
    match manager.client(Some("s1")) {
        Err(Error::UnknownSession(_)) => {}
        other => panic!("expected UnknownSession for s1, got {other:?}"),
    }

    // the survivor works
    let out = second.send_command("p :alive", Duration::from_secs(5)).expect("eval");
    assert_eq!(out, "=> :ok\n");

    // both greetings hit the backend, and the first connection was
    // resumed and closed in between
    let seen = backend.seen();
    assert_eq!(seen.iter().filter(|f| f.starts_with("<greeting>")).count(), 2);
    assert!(seen.iter().any(|f| f == "<disconnect>"));
}

#[test]
#[timeout(60000)]
fn reconnect_with_the_same_id_yields_one_session() {
    let pid = std::process::id();
    let backend = FakeBackend::spawn(Box::new(move |payload| {
        cleanup_replies(payload, pid).unwrap_or_else(|| out_input(&["=> :ok"], pid))
    }));

    let manager = SessionManager::new(Config::default());
    for _ in 0..2 {
        let mut options = ConnectOptions::new(tcp(backend.port));
        options.session_id = Some(String::from("sx"));
        manager.connect(options).expect("connect sx");
    }

    // the first connection was closed before the second opened;
    // exactly one session with the id exists
    assert_eq!(manager.session_ids(), vec![String::from("sx")]);
    let seen = backend.seen();
    assert_eq!(seen.iter().filter(|f| f.starts_with("<greeting>")).count(), 2);
    assert_eq!(seen.iter().filter(|f| *f == "<disconnect>").count(), 1);
}

#[test]
#[timeout(60000)]
fn second_attach_to_same_pid_replaces_session() {
    let pid = std::process::id();
    // two distinct endpoints whose backends report the same target pid
    let backend_a = FakeBackend::spawn(Box::new(move |payload| {
        cleanup_replies(payload, pid).unwrap_or_else(|| out_input(&["a"], pid))
    }));
    let backend_b = FakeBackend::spawn(Box::new(move |payload| {
        cleanup_replies(payload, pid).unwrap_or_else(|| out_input(&["b"], pid))
    }));

    let manager = SessionManager::new(Config::default());

    let mut options = ConnectOptions::new(tcp(backend_a.port));
    options.session_id = Some(String::from("s1"));
    manager.connect(options).expect("connect s1");

    let mut options = ConnectOptions::new(tcp(backend_b.port));
    options.session_id = Some(String::from("s2"));
    manager.connect(options).expect("connect s2");

    // the pid conflict closed s1 even though the endpoints differ
    assert_eq!(manager.session_ids(), vec![String::from("s2")]);
    thread::sleep(Duration::from_millis(200));
    assert!(backend_a.seen().iter().any(|f| f == "<disconnect>"));
}

#[test]
#[timeout(60000)]
fn graceful_resume_on_disconnect_all() {
    let pid = std::process::id();
    let backend = FakeBackend::spawn(Box::new(move |payload| {
        if payload.starts_with("break /") {
            let index = if payload.contains("a.rb") { 0 } else { 1 };
            return Response::Lines(vec![
                format!("out #{index}  BP - Line  {}", payload.trim_start_matches("break ")),
                format!("input {pid}"),
            ]);
        }
        if payload.starts_with("del ") {
            return Response::Silent;
        }
        cleanup_replies(payload, pid).unwrap_or_else(|| out_input(&["=> nil"], pid))
    }));

    let manager = SessionManager::new(Config::default());
    let session =
        manager.connect(ConnectOptions::new(tcp(backend.port))).expect("connect");
    session.send_command("break /tmp/a.rb:3", Duration::from_secs(5)).expect("bp 1");
    session.send_command("break /tmp/b.rb:9", Duration::from_secs(5)).expect("bp 2");

    manager.disconnect_all();
    thread::sleep(Duration::from_millis(300));

    // every index in the raw range got a delete frame, then a final
    // continue, then the socket closed
    let seen = backend.seen();
    for index in 0..10 {
        assert!(
            seen.iter().any(|f| f == &format!("del {index}")),
            "missing del {index}: {seen:?}"
        );
    }
    let del_pos = seen.iter().position(|f| f == "del 0").expect("del frame");
    let c_pos = seen.iter().rposition(|f| f == "c").expect("continue frame");
    assert!(c_pos > del_pos, "continue did not follow deletes: {seen:?}");
    assert!(seen.iter().any(|f| f == "<disconnect>"), "socket not closed: {seen:?}");
    assert!(manager.session_ids().is_empty());

    // calling it again changes nothing
    let frames_before = backend.seen().len();
    manager.disconnect_all();
    assert_eq!(backend.seen().len(), frames_before);
}

#[test]
#[timeout(60000)]
fn silent_greeting_is_a_connection_error() {
    let backend = FakeBackend::spawn_mute();

    let manager = SessionManager::new(Config::default());
    match manager.connect(ConnectOptions::new(tcp(backend.port))) {
        Err(e @ Error::Handshake(_)) => {
            assert_eq!(e.kind(), libdbgpool::ErrorKind::Connection);
        }
        other => panic!("expected handshake failure, got {other:?}"),
    }
    assert!(manager.session_ids().is_empty());
}
