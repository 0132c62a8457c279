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

use std::{
    fs,
    fs::OpenOptions,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing::warn;

/// The pair of append-only files a launched target's stdout and stderr
/// get teed into. The session owns them and deletes them at disconnect;
/// the exit detector re-reads them for its post-mortem.
#[derive(Debug, Clone)]
pub struct CaptureFiles {
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl CaptureFiles {
    /// Create both files (empty, append-only) under `dir`.
    pub fn create(dir: &Path, session_id: &str) -> anyhow::Result<CaptureFiles> {
        fs::create_dir_all(dir).context("creating capture dir")?;
        let stdout_path = dir.join(format!("{session_id}.stdout"));
        let stderr_path = dir.join(format!("{session_id}.stderr"));
        for path in [&stdout_path, &stderr_path] {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening capture file {path:?}"))?;
        }
        Ok(CaptureFiles { stdout_path, stderr_path })
    }

    pub fn from_paths(stdout_path: PathBuf, stderr_path: PathBuf) -> CaptureFiles {
        CaptureFiles { stdout_path, stderr_path }
    }

    /// Contents of the stdout capture, invalid bytes replaced.
    pub fn read_stdout(&self) -> Option<String> {
        read_lossy(&self.stdout_path)
    }

    /// Contents of the stderr capture, invalid bytes replaced.
    pub fn read_stderr(&self) -> Option<String> {
        read_lossy(&self.stderr_path)
    }

    /// Best-effort removal of both files.
    pub fn remove(&self) {
        for path in [&self.stdout_path, &self.stderr_path] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("removing capture file {:?}: {:?}", path, e);
                }
            }
        }
    }
}

fn read_lossy(path: &Path) -> Option<String> {
    match fs::read(path) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(_) => None,
    }
}
