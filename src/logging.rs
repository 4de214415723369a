//! Logger construction
//!
//! Components take an explicit `slog::Logger`; these helpers build the two
//! loggers the crate needs.

use slog::{o, Drain, Logger};

/// Asynchronous terminal logger writing to stderr
pub fn terminal_logger() -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

/// Logger that drops everything
pub fn discard_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Logger for tests, captured by the test harness
#[cfg(test)]
pub(crate) fn test_logger() -> Logger {
    let decorator = slog_term::PlainDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}
