//! Logging and tracing initialization for keepd.
//!
//! Structured logging using the `tracing` ecosystem, with pretty console
//! output or JSON output for machine parsing. Also home to the helpers that
//! keep secrets and unbounded tool output out of log lines and stored messages.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self as tfmt, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Longest message kept from external tool output.
pub const MAX_MESSAGE_LEN: usize = 512;

/// Configuration for the logging system.
#[derive(Default)]
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
}

/// Initialize the tracing subscriber with the given configuration.
///
/// Call once, early in main(), after config is loaded.
/// `RUST_LOG` overrides the default level.
pub fn init(config: LogConfig) {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("keepd={}", default_level.as_str().to_lowercase()))
    });

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tfmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tfmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

/// Wrapper that prints `<redacted>` in place of its contents.
pub struct Redacted<T>(pub T);

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Replace every occurrence of `secret` in `text`.
pub fn redact(text: &str, secret: Option<&str>) -> String {
    match secret {
        Some(s) if !s.is_empty() => text.replace(s, "<redacted>"),
        _ => text.to_string(),
    }
}

/// Trim tool output down to something safe to store and log.
///
/// Keeps the last non-empty lines (tools print the useful error last) and
/// caps the result at [`MAX_MESSAGE_LEN`] characters.
pub fn bounded_message(text: &str, secret: Option<&str>) -> String {
    let redacted = redact(text.trim(), secret);
    let chars: Vec<char> = redacted.chars().collect();
    if chars.len() <= MAX_MESSAGE_LEN {
        return redacted;
    }
    let tail: String = chars[chars.len() - (MAX_MESSAGE_LEN - 3)..].iter().collect();
    format!("...{}", tail)
}

/// A rate limiter for throttling log messages.
///
/// Progress updates arrive several times a second; only some of them are logged.
pub struct LogThrottle {
    interval_ms: u64,
    /// Stores the last log time in ms, or u64::MAX to indicate "never logged"
    last_log_ms: AtomicU64,
    start: Instant,
}

/// Sentinel value indicating the throttle has never logged
const NEVER_LOGGED: u64 = u64::MAX;

impl LogThrottle {
    /// Create a new throttle with the given minimum interval between logs.
    pub fn new(interval: std::time::Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_log_ms: AtomicU64::new(NEVER_LOGGED),
            start: Instant::now(),
        }
    }

    /// Returns true if enough time has passed since the last log.
    pub fn should_log(&self) -> bool {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_log_ms.load(Ordering::Relaxed);

        let should = last == NEVER_LOGGED || now_ms.saturating_sub(last) >= self.interval_ms;

        if should {
            // Lost races mean another thread just logged
            self.last_log_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }

    /// Reset the throttle, allowing the next log immediately.
    pub fn reset(&self) {
        self.last_log_ms.store(NEVER_LOGGED, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn throttle_allows_first_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
    }

    #[test]
    fn throttle_blocks_immediate_second_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }

    #[test]
    fn throttle_reset_allows_log() {
        let throttle = LogThrottle::new(Duration::from_secs(100));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
        throttle.reset();
        assert!(throttle.should_log());
    }

    #[test]
    fn redacted_never_prints_contents() {
        let r = Redacted("hunter2");
        assert_eq!(format!("{:?}", r), "<redacted>");
        assert_eq!(format!("{}", r), "<redacted>");
    }

    #[test]
    fn redact_replaces_secret() {
        assert_eq!(
            redact("bad password hunter2 given", Some("hunter2")),
            "bad password <redacted> given"
        );
        assert_eq!(redact("nothing here", Some("")), "nothing here");
        assert_eq!(redact("nothing here", None), "nothing here");
    }

    #[test]
    fn bounded_message_caps_length_and_keeps_tail() {
        let long = format!("{}END", "x".repeat(2000));
        let msg = bounded_message(&long, None);
        assert_eq!(msg.chars().count(), MAX_MESSAGE_LEN);
        assert!(msg.starts_with("..."));
        assert!(msg.ends_with("END"));
    }
}
