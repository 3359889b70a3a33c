// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Crates whose log level follows the requested level
const ENGINE_TARGETS: [&str; 2] = ["mqtt_engine_tokio", "mqtt_broker"];

/// Crates that stay quiet unless something goes wrong
const QUIET_TARGETS: [&str; 2] = ["tokio", "tokio_util"];

/// Filter directives for `log_level`, e.g.
/// `mqtt_engine_tokio=debug,mqtt_broker=debug,tokio=warn,tokio_util=warn`
pub fn filter_directives(log_level: tracing::Level) -> String {
    let level = log_level.as_str().to_lowercase();
    ENGINE_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .chain(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber writing to stdout through a non-blocking
/// appender. `RUST_LOG` replaces the computed directives when set.
///
/// The returned guard flushes pending lines on drop and must live as long as
/// the process logs.
pub fn init_tracing(log_level: tracing::Level) -> Result<WorkerGuard> {
    let (non_blocking_stdout, guard) = tracing_appender::non_blocking(std::io::stdout());

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::builder()
            .with_default_directive(tracing::Level::WARN.into())
            .parse_lossy(filter_directives(log_level)),
    };

    let formatting_layer = fmt::layer()
        .with_writer(non_blocking_stdout)
        .with_ansi(true)
        .with_level(true)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(formatting_layer)
        .try_init()?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_follow_requested_level() {
        assert_eq!(
            filter_directives(tracing::Level::DEBUG),
            "mqtt_engine_tokio=debug,mqtt_broker=debug,tokio=warn,tokio_util=warn"
        );
    }
}
