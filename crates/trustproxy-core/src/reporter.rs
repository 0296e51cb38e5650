//! Human-facing progress reporting, threaded through long-running
//! operations instead of a `tracing`/`log` dependency.

/// Progress sink for long-running operations (proxy lifetime, a
/// single truststore patch, a container filesystem walk). Callers
/// supply a concrete implementation; library code only depends on
/// this trait.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// A `Reporter` that discards everything — useful in tests and
/// library callers that don't want progress output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}
