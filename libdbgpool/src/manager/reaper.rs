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

/*! The idle reaper is responsible for sessions nobody is using
  anymore. On every tick it scans the registry, classifies each session
  as alive, idle, orphaned by a dead target, or orphaned by a closed
  socket, and puts the stale ones through the resume-before-disconnect
  pipeline so their targets are not left pinned at a prompt. Whatever
  goes wrong in a pass must never take the loop down with it.
*/

use std::{panic, panic::AssertUnwindSafe, sync::Arc};

use tracing::{info, span, trace, warn, Level};

use super::SessionManager;

/// Run the reaper loop. Should be invoked in a dedicated thread.
/// Returns when `shutdown` is signalled or its sender is dropped.
pub(crate) fn run(
    manager: Arc<SessionManager>,
    shutdown: crossbeam_channel::Receiver<()>,
) -> anyhow::Result<()> {
    let _s = span!(Level::INFO, "reaper").entered();
    let ticker = crossbeam_channel::tick(manager.config().reap_poll_interval());
    info!("reaper running, poll interval {:?}", manager.config().reap_poll_interval());

    loop {
        crossbeam_channel::select! {
            recv(shutdown) -> _ => {
                info!("reaper shutting down");
                return Ok(());
            }
            recv(ticker) -> _ => {
                trace!("reaper scan");
                let res = panic::catch_unwind(AssertUnwindSafe(|| {
                    manager.reap_stale_sessions();
                }));
                if let Err(e) = res {
                    warn!("reaper scan panicked: {:?}", e);
                }
            }
        }
    }
}
