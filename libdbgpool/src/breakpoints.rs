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

use std::{sync::Mutex, time::Duration};

use tracing::{info, warn};

use crate::{error::Error, session::Session};

/// The specs that recreate the user's breakpoints: opaque backend
/// command strings like `break foo.rb:12` or `catch RuntimeError`.
///
/// The store outlives sessions so that a relaunched target can opt in
/// to getting its breakpoints back. Order is preserved, duplicates are
/// dropped by exact string equality.
#[derive(Debug, Default)]
pub struct BreakpointStore {
    specs: Mutex<Vec<String>>,
}

impl BreakpointStore {
    pub fn new() -> BreakpointStore {
        BreakpointStore::default()
    }

    pub fn record(&self, spec: &str) {
        let mut specs = self.specs.lock().unwrap();
        if !specs.iter().any(|s| s == spec) {
            specs.push(String::from(spec));
        }
    }

    pub fn clear(&self) {
        self.specs.lock().unwrap().clear();
    }

    /// Drop every spec containing `needle`. Used when the tool surface
    /// reports a breakpoint deletion: the deletion names a location, not
    /// the exact spec string.
    pub fn remove_matching(&self, needle: &str) {
        self.specs.lock().unwrap().retain(|s| !s.contains(needle));
    }

    pub fn specs(&self) -> Vec<String> {
        self.specs.lock().unwrap().clone()
    }

    /// Replay every recorded spec into `session`. Individual failures
    /// are logged and skipped so one bad spec cannot block the rest.
    pub fn restore_on(&self, session: &Session, timeout: Duration) -> Result<usize, Error> {
        let specs = self.specs();
        let mut restored = 0;
        for spec in specs.iter() {
            match session.send_command(spec, timeout) {
                Ok(_) => restored += 1,
                Err(e @ Error::ConnectionLost(_)) | Err(e @ Error::NotConnected) => {
                    return Err(e);
                }
                Err(e) => warn!("restoring breakpoint '{}': {:?}", spec, e),
            }
        }
        info!("restored {}/{} breakpoints", restored, specs.len());
        Ok(restored)
    }
}
