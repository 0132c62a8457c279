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

/*! The line-framed codec spoken to the debugger backend.

  The wire is newline-terminated UTF-8 over a unix or tcp stream. The
  backend emits `out`, `input`, `ask` and `quit` frames; we emit one
  greeting line at open, then `command`, `answer` and the out-of-band
  `pause` frame. Bytes are read as binary and re-interpreted lossily so
  a target that prints garbage cannot wedge the codec, and ANSI escape
  sequences are stripped from output payloads before anyone sees them.
*/

use std::{
    fmt, io,
    io::{Read, Write},
    net::{Shutdown, TcpStream},
    os::unix::net::UnixStream,
    path::PathBuf,
    time::{Duration, Instant},
};

use tracing::{debug, instrument, trace, warn};

use crate::error::Error;

const READ_CHUNK_SIZE: usize = 4096;

// set_read_timeout rejects a zero duration, so deadline math clamps here.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Where a debugger backend lives. Discovery of endpoints is the
/// caller's problem; we accept either flavor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// One inbound frame from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A line of debugger output, ANSI-stripped.
    Out(String),
    /// The backend is at its prompt; the payload is the target pid.
    Input(String),
    /// A yes/no prompt that must be acknowledged with `answer <id> y`.
    Ask { id: String, text: String },
    /// The backend is terminating.
    Quit,
}

impl Frame {
    /// Parse one line (without its terminator). Lines that match none of
    /// the known prefixes are carried as output text rather than dropped;
    /// real backends occasionally emit unprefixed noise at attach time.
    pub fn parse(line: &str) -> Frame {
        if let Some(rest) = line.strip_prefix("out ") {
            Frame::Out(strip_ansi_escapes::strip_str(rest))
        } else if line == "out" {
            Frame::Out(String::new())
        } else if let Some(rest) = line.strip_prefix("input ") {
            Frame::Input(String::from(rest.trim()))
        } else if let Some(rest) = line.strip_prefix("ask ") {
            match rest.split_once(' ') {
                Some((id, text)) => {
                    Frame::Ask { id: String::from(id), text: String::from(text) }
                }
                None => Frame::Ask { id: String::from(rest), text: String::new() },
            }
        } else if line.starts_with("quit") {
            Frame::Quit
        } else {
            Frame::Out(strip_ansi_escapes::strip_str(line))
        }
    }
}

/// The transport under the codec.
#[derive(Debug)]
pub enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.set_read_timeout(timeout),
            Stream::Tcp(s) => s.set_read_timeout(timeout),
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.set_nonblocking(nonblocking),
            Stream::Tcp(s) => s.set_nonblocking(nonblocking),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.write_all(buf),
            Stream::Tcp(s) => s.write_all(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.flush(),
            Stream::Tcp(s) => s.flush(),
        }
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.shutdown(how),
            Stream::Tcp(s) => s.shutdown(how),
        }
    }

    fn try_clone(&self) -> io::Result<Stream> {
        Ok(match self {
            Stream::Unix(s) => Stream::Unix(s.try_clone()?),
            Stream::Tcp(s) => Stream::Tcp(s.try_clone()?),
        })
    }
}

/// A handle onto the same socket that lives outside the session lock.
///
/// The signal path and `disconnect_all` write their raw resume frames
/// through this so they never have to wait on a session mutex that a
/// stuck command thread might hold. Writes through `&UnixStream` and
/// `&TcpStream` go straight to the fd, so `&self` suffices.
#[derive(Debug)]
pub struct RawControl {
    stream: Stream,
}

impl RawControl {
    /// Best-effort single-line write. Errors are swallowed; the socket
    /// is about to be closed anyway.
    pub fn write_line(&self, line: &str) {
        let res = match &self.stream {
            Stream::Unix(s) => (&*s).write_all(line.as_bytes()).and_then(|_| (&*s).write_all(b"\n")),
            Stream::Tcp(s) => (&*s).write_all(line.as_bytes()).and_then(|_| (&*s).write_all(b"\n")),
        };
        if let Err(e) = res {
            trace!("raw write failed: {:?}", e);
        }
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!("raw shutdown failed: {:?}", e);
        }
    }
}

/// The codec: a byte stream plus a persistent read buffer.
///
/// The buffer is what keeps the protocol honest across timeouts: a read
/// that gives up mid-line leaves the partial line buffered, and bytes
/// past a terminating `input` frame stay here untouched until the next
/// read wants them.
#[derive(Debug)]
pub struct FramedStream {
    stream: Stream,
    rdbuf: Vec<u8>,
}

impl FramedStream {
    pub fn open(endpoint: &Endpoint) -> Result<FramedStream, Error> {
        let stream = match endpoint {
            Endpoint::Unix(path) => {
                Stream::Unix(UnixStream::connect(path).map_err(Error::Connect)?)
            }
            Endpoint::Tcp { host, port } => Stream::Tcp(
                TcpStream::connect((host.as_str(), *port)).map_err(Error::Connect)?,
            ),
        };
        Ok(FramedStream { stream, rdbuf: Vec::new() })
    }

    pub fn from_stream(stream: Stream) -> FramedStream {
        FramedStream { stream, rdbuf: Vec::new() }
    }

    /// Clone a raw control handle for lock-free cleanup writes.
    pub fn raw_control(&self) -> Result<RawControl, Error> {
        let stream = self
            .stream
            .try_clone()
            .map_err(|e| Error::ConnectionLost(format!("cloning stream: {e}")))?;
        Ok(RawControl { stream })
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Read one frame, waiting at most `timeout`.
    ///
    /// Returns `Timeout` on deadline expiry with any partial line left
    /// buffered, and `ConnectionLost` on EOF or socket error.
    pub fn read_frame(&mut self, timeout: Duration) -> Result<Frame, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.take_buffered_line() {
                return Ok(self.parse_line(&line));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout { timeout });
            }
            self.stream
                .set_read_timeout(Some(remaining.max(MIN_READ_TIMEOUT)))
                .map_err(|e| self.fail(e))?;

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::ConnectionLost(String::from(
                        "EOF from debugger backend",
                    )));
                }
                Ok(n) => self.rdbuf.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    /// Read one frame without blocking. `Ok(None)` means nothing complete
    /// is available right now.
    pub fn try_read_frame(&mut self) -> Result<Option<Frame>, Error> {
        if let Some(line) = self.take_buffered_line() {
            return Ok(Some(self.parse_line(&line)));
        }

        self.stream.set_nonblocking(true).map_err(|e| self.fail(e))?;
        let res = self.fill_nonblocking();
        if let Err(e) = self.stream.set_nonblocking(false) {
            warn!("could not restore blocking mode: {:?}", e);
        }
        res?;

        match self.take_buffered_line() {
            Some(line) => Ok(Some(self.parse_line(&line))),
            None => Ok(None),
        }
    }

    fn fill_nonblocking(&mut self) -> Result<(), Error> {
        loop {
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::ConnectionLost(String::from(
                        "EOF from debugger backend",
                    )));
                }
                Ok(n) => {
                    self.rdbuf.extend_from_slice(&chunk[..n]);
                    // keep pulling until the kernel runs dry so a drain
                    // sees everything that has already arrived
                    if self.rdbuf.iter().any(|b| *b == b'\n') && n < READ_CHUNK_SIZE {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn take_buffered_line(&mut self) -> Option<String> {
        let pos = self.rdbuf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.rdbuf.drain(..=pos).collect();
        line.pop(); // the \n
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn parse_line(&self, line: &str) -> Frame {
        let frame = Frame::parse(line);
        trace!("read frame {:?}", frame);
        frame
    }

    fn fail(&self, e: io::Error) -> Error {
        Error::ConnectionLost(e.to_string())
    }

    fn write_line(&mut self, line: &str) -> Result<(), Error> {
        trace!("write line '{}'", line);
        self.stream
            .write_all(line.as_bytes())
            .and_then(|_| self.stream.write_all(b"\n"))
            .and_then(|_| self.stream.flush())
            .map_err(|e| self.fail(e))
    }

    /// The one-shot greeting that opens every session.
    pub fn write_greeting(&mut self, version: &str, width: u16, cookie: &str) -> Result<(), Error> {
        self.write_line(&format!(
            "version: {version} width: {width} cookie: {cookie} nonstop: false"
        ))
    }

    /// Submit a command for the prompt to run. The payload must already
    /// be a single line; we only guarantee to transmit one.
    pub fn write_command(&mut self, pid: &str, width: u16, payload: &str) -> Result<(), Error> {
        self.write_line(&format!("command {pid} {width} {payload}"))
    }

    pub fn write_answer(&mut self, id: &str) -> Result<(), Error> {
        self.write_line(&format!("answer {id} y"))
    }

    /// The out-of-band re-pause request. Only valid while the backend is
    /// not at its prompt.
    pub fn write_pause(&mut self) -> Result<(), Error> {
        self.write_line("pause")
    }
}

/// What the greeting exchange learned.
#[derive(Debug)]
pub struct Greeting {
    pub pid: String,
    pub banner: String,
}

/// Open a stream to `endpoint` and run the greeting exchange to its
/// first `input` prompt.
#[instrument(skip_all, fields(ep = %endpoint))]
pub fn connect(
    endpoint: &Endpoint,
    version: &str,
    width: u16,
    cookie: &str,
    timeout: Duration,
) -> Result<(FramedStream, Greeting), Error> {
    let mut stream = FramedStream::open(endpoint)?;
    stream.write_greeting(version, width, cookie)?;

    let deadline = Instant::now() + timeout;
    let mut banner = String::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match stream.read_frame(remaining) {
            Ok(Frame::Out(text)) => {
                banner.push_str(&text);
                banner.push('\n');
            }
            Ok(Frame::Input(pid)) => {
                debug!("greeting complete, target pid {}", pid);
                return Ok((stream, Greeting { pid, banner }));
            }
            Ok(Frame::Ask { id, .. }) => stream.write_answer(&id)?,
            Ok(Frame::Quit) => {
                return Err(Error::Backend(format!(
                    "backend refused the connection: {}",
                    banner.trim()
                )));
            }
            Err(Error::Timeout { .. }) => {
                return Err(Error::Handshake(format!(
                    "no input prompt within {}s",
                    timeout.as_secs_f32()
                )));
            }
            Err(e) => return Err(e),
        }
    }
}
