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
/// dbgpool brokers interactive debug sessions against processes paused
/// under a line-protocol debugger backend. Attach to a target, poke at
/// it, and let go knowing the target gets resumed on the way out.
use clap::Parser;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let args = libdbgpool::Args::parse();

    if args.version() {
        println!("dbgpool {}", VERSION);
        return Ok(());
    }

    libdbgpool::run(args)
}
