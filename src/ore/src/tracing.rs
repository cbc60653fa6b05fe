// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tracing utilities.
//!
//! The key export is the **[`configure`]** function, which installs a
//! `tracing` subscriber writing to stderr and should be called once during
//! initialization of every binary in this workspace.

use std::io;
use std::str::FromStr;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

/// The output format of the stderr log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human readable lines, colored when stderr is a terminal.
    Text,
    /// One JSON object per line, for log collectors.
    Json,
}

/// Application tracing configuration.
///
/// See the [`configure`] function for details.
#[derive(Debug)]
pub struct TracingConfig {
    /// The name of the service, attached to every JSON log line.
    pub service_name: &'static str,
    /// A filter which determines which events are emitted to the log.
    pub filter: EnvFilter,
    /// The log line format.
    pub format: LogFormat,
}

impl TracingConfig {
    /// Builds a configuration from a filter directive string such as
    /// `info,citus_orchestratord=debug`.
    pub fn new(
        service_name: &'static str,
        filter: &str,
        format: LogFormat,
    ) -> Result<TracingConfig, anyhow::Error> {
        Ok(TracingConfig {
            service_name,
            filter: EnvFilter::from_str(filter)?,
            format,
        })
    }
}

/// Configures tracing according to the provided configuration.
///
/// Returns an error if a global subscriber has already been installed.
pub fn configure(config: TracingConfig) -> Result<(), anyhow::Error> {
    let stderr_layer = match config.format {
        LogFormat::Text => fmt::layer()
            .with_writer(io::stderr)
            .with_ansi(io::IsTerminal::is_terminal(&io::stderr()))
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_current_span(true)
            .boxed(),
    };
    tracing_subscriber::registry()
        .with(stderr_layer.with_filter(config.filter))
        .try_init()?;
    tracing::info!(service = config.service_name, "tracing configured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_filters() {
        assert!(TracingConfig::new("test", "info,citus_orchestratord=debug", LogFormat::Text).is_ok());
        assert!(TracingConfig::new("test", "info,citus=notalevel", LogFormat::Json).is_err());
    }
}
