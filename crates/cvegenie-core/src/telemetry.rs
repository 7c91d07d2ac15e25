//! Tracing setup for the `cvegenie` binary and embedding drivers.
//!
//! Without `RUST_LOG`, the CVE-Genie crates log at the configured level and
//! everything else at `warn`. JSON lines carry the enclosing `cvegenie.plan`
//! span, so one run can be filtered out of a shared log by `run_id` or
//! `cve_id`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Crates whose targets follow the configured level.
const GENIE_TARGETS: [&str; 3] = ["cvegenie_core", "cvegenie_bus", "cvegenie"];

/// Filter used when `RUST_LOG` is unset, e.g.
/// `warn,cvegenie_core=debug,cvegenie_bus=debug,cvegenie=debug`.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    std::iter::once("warn".to_string())
        .chain(GENIE_TARGETS.iter().map(|target| format!("{target}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays machine-readable.
///
/// Returns `false` when a subscriber was already installed; the first call
/// in a process wins.
pub fn init_tracing(json: bool, level: Level) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    installed.is_ok()
}

/// Parse a level name (`trace`..`error`, case-insensitive).
pub fn parse_level(name: &str) -> Option<Level> {
    name.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_refused() {
        init_tracing(false, Level::WARN);
        assert!(!init_tracing(true, Level::DEBUG));
    }

    #[test]
    fn defaults_scope_the_level_to_genie_crates() {
        assert_eq!(
            default_directives(Level::DEBUG),
            "warn,cvegenie_core=debug,cvegenie_bus=debug,cvegenie=debug"
        );
        assert!(EnvFilter::try_new(default_directives(Level::TRACE)).is_ok());
    }

    #[test]
    fn level_names() {
        assert_eq!(parse_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(parse_level(" warn "), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }
}
