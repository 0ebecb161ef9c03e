//! `tracing` integration.
//!
//! [`SevlogLayer`] forwards `tracing` events into a [`Logger`]:
//!
//! | tracing | severity | verbosity |
//! |---------|----------|-----------|
//! | ERROR   | ERROR    | -         |
//! | WARN    | WARNING  | -         |
//! | INFO    | INFO     | -         |
//! | DEBUG   | INFO     | V(1)      |
//! | TRACE   | INFO     | V(2)      |
//!
//! DEBUG and TRACE events go through the verbosity controller keyed by the
//! event's callsite metadata, so `vmodule` patterns apply to them as well.
//! Events whose target is this crate or one of its modules are dropped, so
//! the engine's own diagnostics never feed back into it. Other crates,
//! including `sevlog_runner`, pass through.

use std::fmt::{self, Write as _};

use tracing::{
    Event, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{Layer, layer::Context};

use crate::{level::Level, logger::Logger, severity::Severity};

const OWN_CRATE: &str = "sevlog_core";

fn is_own_target(target: &str) -> bool {
    target.strip_prefix(OWN_CRATE).is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

/// A `tracing_subscriber` layer writing events through a [`Logger`].
pub struct SevlogLayer {
    logger: Logger,
}

impl SevlogLayer {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

fn map_level(level: &tracing::Level) -> (Severity, Option<Level>) {
    match *level {
        tracing::Level::ERROR => (Severity::Error, None),
        tracing::Level::WARN => (Severity::Warning, None),
        tracing::Level::INFO => (Severity::Info, None),
        tracing::Level::DEBUG => (Severity::Info, Some(1)),
        tracing::Level::TRACE => (Severity::Info, Some(2)),
    }
}

impl<S: Subscriber> Layer<S> for SevlogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if is_own_target(meta.target()) {
            return;
        }
        let (sev, v) = map_level(meta.level());
        let file = meta.file().unwrap_or("<unknown>");
        if let Some(v) = v {
            let key = meta as *const _ as usize;
            if !self.logger.verbosity().check_v_key(v, key, file) {
                return;
            }
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        // Nowhere to report a failed write from inside a subscriber.
        let _ = self.logger.log_at(sev, file, meta.line().unwrap_or(0), format_args!("{visitor}"));
    }
}

/// Collects the `message` field followed by the remaining `key=value` pairs.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}

impl fmt::Display for MessageVisitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        f.write_str(&self.fields)
    }
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;
    use crate::logger::tests::harness;

    fn with_layer(logger: &Logger, f: impl FnOnce()) {
        let subscriber = tracing_subscriber::registry().with(SevlogLayer::new(logger.clone()));
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn levels_map_to_severities() {
        let h = harness();
        with_layer(&h.logger, || {
            tracing::error!(target: "app", "disk full");
            tracing::warn!(target: "app", "retrying");
            tracing::info!(target: "app", port = 8080, "listening");
        });
        let info = h.file(Severity::Info);
        let lines: Vec<&str> = info.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('E') && lines[0].ends_with("] disk full"));
        assert!(lines[1].starts_with('W') && lines[1].ends_with("] retrying"));
        assert!(lines[2].starts_with('I') && lines[2].ends_with("] listening port=8080"));
        assert!(lines[2].contains("bridge.rs:"));
        assert_eq!(h.file(Severity::Error).lines().count(), 1);
    }

    #[test]
    fn debug_and_trace_follow_verbosity() {
        let h = harness();
        let emit = || {
            tracing::debug!(target: "app", "debug detail");
            tracing::trace!(target: "app", "trace detail");
        };
        with_layer(&h.logger, emit);
        assert_eq!(h.file(Severity::Info), "");

        h.logger.set_level(1);
        with_layer(&h.logger, emit);
        assert!(h.file(Severity::Info).contains("debug detail"));
        assert!(!h.file(Severity::Info).contains("trace detail"));

        h.logger.set_level(0);
        h.logger.set_vmodule("bridge=2").unwrap();
        h.files[Severity::Info.index()].clear();
        with_layer(&h.logger, emit);
        assert!(h.file(Severity::Info).contains("trace detail"));
    }

    #[test]
    fn own_events_are_dropped() {
        let h = harness();
        with_layer(&h.logger, || {
            tracing::warn!(target: "sevlog_core::flush", "periodic flush failed");
        });
        assert_eq!(h.file(Severity::Info), "");
    }

    #[test]
    fn sibling_crate_events_pass() {
        let h = harness();
        with_layer(&h.logger, || {
            tracing::info!(target: "sevlog_runner", "batch written");
            tracing::warn!(target: "sevlog_corex", "lookalike crate");
            tracing::info!(target: "sevlog_core", "engine root");
        });
        let info = h.file(Severity::Info);
        assert!(info.contains("] batch written\n"));
        assert!(info.contains("] lookalike crate\n"));
        assert!(!info.contains("engine root"));
    }
}
