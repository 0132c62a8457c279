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

/*! A scripted fake debugger backend for integration tests.

  Listens on an ephemeral tcp port, greets like the real thing, then
  answers command frames according to a script function. Everything the
  adapter sends is recorded so tests can assert on the exact frame
  sequence.
*/

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

/// How a scripted backend reacts to one inbound frame.
pub enum Response {
    /// Write these protocol lines immediately.
    Lines(Vec<String>),
    /// Sleep first, then write. The backend reads nothing while it
    /// sleeps, just like a busy target.
    Delayed(Duration, Vec<String>),
    /// Say nothing at all.
    Silent,
}

/// Build the classic `out ... / input <pid>` reply.
pub fn out_input(lines: &[&str], pid: u32) -> Response {
    let mut reply: Vec<String> = lines.iter().map(|l| format!("out {l}")).collect();
    reply.push(format!("input {pid}"));
    Response::Lines(reply)
}

pub type Script = Box<dyn Fn(&str) -> Response + Send + Sync>;

pub struct FakeBackend {
    pub port: u16,
    pub pid: u32,
    seen: Arc<Mutex<Vec<String>>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FakeBackend {
    /// Spawn a backend whose replies come from `script`. The script is
    /// handed the command payload (`p 1+1`), or the raw frame for
    /// non-command frames (`pause`, `answer 1 y`).
    pub fn spawn(script: Script) -> FakeBackend {
        FakeBackend::spawn_inner(script, false)
    }

    /// Spawn a backend that accepts connections but never greets back.
    pub fn spawn_mute() -> FakeBackend {
        FakeBackend::spawn_inner(Box::new(|_| Response::Silent), true)
    }

    fn spawn_inner(script: Script, mute: bool) -> FakeBackend {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        listener.set_nonblocking(true).expect("nonblocking");

        // the adapter probes this pid for liveness, so it must be a
        // real, living process: us
        let pid = process::id();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_seen = Arc::clone(&seen);
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            loop {
                if thread_shutdown.load(Ordering::Acquire) {
                    return;
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(false).expect("blocking conn");
                        handle_conn(stream, pid, &script, &thread_seen, mute);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => return,
                }
            }
        });

        FakeBackend { port, pid, seen, shutdown, handle: Some(handle) }
    }

    /// Every frame the adapter has sent, in order. Command frames are
    /// recorded as their payload; connection events appear as
    /// `<greeting>` and `<disconnect>` markers.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        // poke the listener loose in case it is between polls
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn read_line(stream: &mut TcpStream) -> Option<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) | Err(_) => return None,
            Ok(_) if byte[0] == b'\n' => {
                return Some(String::from_utf8_lossy(&line).into_owned());
            }
            Ok(_) => line.push(byte[0]),
        }
    }
}

fn write_lines(stream: &mut TcpStream, lines: &[String]) {
    for line in lines.iter() {
        if stream.write_all(line.as_bytes()).is_err() || stream.write_all(b"\n").is_err() {
            return;
        }
    }
    let _ = stream.flush();
}

fn handle_conn(
    mut stream: TcpStream,
    pid: u32,
    script: &Script,
    seen: &Arc<Mutex<Vec<String>>>,
    mute: bool,
) {
    let greeting = match read_line(&mut stream) {
        Some(line) => line,
        None => return,
    };
    seen.lock().unwrap().push(format!("<greeting> {greeting}"));
    if mute {
        // swallow frames until the client gives up
        while read_line(&mut stream).is_some() {}
        seen.lock().unwrap().push(String::from("<disconnect>"));
        return;
    }
    write_lines(
        &mut stream,
        &[String::from("out connected to fake backend"), format!("input {pid}")],
    );

    loop {
        let line = match read_line(&mut stream) {
            Some(line) => line,
            None => {
                seen.lock().unwrap().push(String::from("<disconnect>"));
                return;
            }
        };
        let recorded = match line.strip_prefix("command ") {
            // strip the `<pid> <width>` prefix off command frames
            Some(rest) => match rest.splitn(3, ' ').nth(2) {
                Some(payload) => String::from(payload),
                None => line.clone(),
            },
            None => line.clone(),
        };
        seen.lock().unwrap().push(recorded.clone());

        match script(&recorded) {
            Response::Lines(lines) => write_lines(&mut stream, &lines),
            Response::Delayed(delay, lines) => {
                thread::sleep(delay);
                write_lines(&mut stream, &lines);
            }
            Response::Silent => {}
        }
    }
}
