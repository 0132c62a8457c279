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

use std::{env, fs, path::PathBuf, time};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{instrument, warn};

use crate::{consts, duration};

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else if let Ok(home) = env::var("HOME") {
        let mut config_path = PathBuf::from(home);
        config_path.push(".config");
        config_path.push("dbgpool");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// How long a session may sit with no commands before the reaper
    /// resumes its target and disconnects it. A duration string like
    /// "30m" or "90s". By default, 30 minutes.
    pub idle_timeout: Option<String>,

    /// How often the reaper wakes up to scan sessions. By default, 60s.
    pub reap_poll_interval: Option<String>,

    /// Default budget for a single command round trip. By default, 30s.
    pub command_timeout: Option<String>,

    /// How many times the resume-before-disconnect pipeline re-runs its
    /// delete-breakpoints-and-continue rounds when a buffered pause
    /// request re-pauses the target it just resumed.
    pub resume_retries: Option<u32>,

    /// Output width in columns advertised to the backend. By default, 500.
    pub output_width: Option<u16>,

    /// Protocol version string sent in the greeting line.
    pub protocol_version: Option<String>,

    /// Auth cookie sent in the greeting line. Backends that were started
    /// without a cookie accept the placeholder "-".
    pub auth_cookie: Option<String>,
}

impl Config {
    pub fn idle_timeout(&self) -> time::Duration {
        self.duration_or(&self.idle_timeout, "idle_timeout", consts::DEFAULT_IDLE_TIMEOUT)
    }

    pub fn reap_poll_interval(&self) -> time::Duration {
        self.duration_or(
            &self.reap_poll_interval,
            "reap_poll_interval",
            consts::DEFAULT_REAP_POLL_INTERVAL,
        )
    }

    pub fn command_timeout(&self) -> time::Duration {
        self.duration_or(&self.command_timeout, "command_timeout", consts::DEFAULT_COMMAND_TIMEOUT)
    }

    pub fn resume_retries(&self) -> u32 {
        self.resume_retries.unwrap_or(consts::DEFAULT_RESUME_RETRIES)
    }

    pub fn output_width(&self) -> u16 {
        self.output_width.unwrap_or(consts::DEFAULT_OUTPUT_WIDTH)
    }

    pub fn protocol_version(&self) -> String {
        self.protocol_version.clone().unwrap_or_else(|| String::from(consts::PROTOCOL_VERSION))
    }

    pub fn auth_cookie(&self) -> String {
        self.auth_cookie.clone().unwrap_or_else(|| String::from("-"))
    }

    fn duration_or(
        &self,
        field: &Option<String>,
        name: &str,
        default: time::Duration,
    ) -> time::Duration {
        match field {
            None => default,
            Some(src) => match duration::parse(src) {
                Ok(d) => d,
                Err(e) => {
                    warn!("bad {} value '{}': {:?}, using default", name, src, e);
                    default
                }
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse() -> anyhow::Result<()> {
        let cases = vec![
            r#"
            idle_timeout = "30m"
            "#,
            r#"
            idle_timeout = "90s"
            reap_poll_interval = "10s"
            resume_retries = 3
            "#,
            r#"
            output_width = 120
            protocol_version = "1.9.2"
            auth_cookie = "sekrit"
            "#,
        ];

        for case in cases.into_iter() {
            let _: Config = toml::from_str(case)?;
        }

        Ok(())
    }

    #[test]
    fn duration_defaults() {
        let config = Config::default();
        assert_eq!(config.idle_timeout(), consts::DEFAULT_IDLE_TIMEOUT);

        let config =
            Config { idle_timeout: Some(String::from("1s")), ..Config::default() };
        assert_eq!(config.idle_timeout(), time::Duration::from_secs(1));

        // unparsable values fall back rather than erroring
        let config =
            Config { idle_timeout: Some(String::from("nonsense")), ..Config::default() };
        assert_eq!(config.idle_timeout(), consts::DEFAULT_IDLE_TIMEOUT);
    }
}
