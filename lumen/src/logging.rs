//! Thin wrapper over `slog` so the rest of the workspace can use a single
//! `logging::` path for loggers and macros.
//!
//! Components take a `L: Into<Option<&Logger>>` constructor argument and fall
//! back to a discarding root, so library code never forces a logging setup on
//! the caller.

pub use slog::{self, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Root logger that drops everything. Used as the default when a component is
/// constructed without a logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Derive a child logger from an optional parent.
pub fn child<'a, L: Into<Option<&'a Logger>>>(parent: L) -> Logger {
    match parent.into() {
        Some(log) => log.new(o!()),
        None => discard(),
    }
}

/// Build a terminal logger writing to stderr at the given severity.
pub fn terminal(level: Severity) -> Result<Logger, sloggers::Error> {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_of_none_discards() {
        let log = child(None);
        info!(log, "dropped"; "k" => 1);
    }

    #[test]
    fn test_child_of_parent() {
        let root = discard();
        let log = child(&root);
        debug!(log, "dropped");
    }
}
