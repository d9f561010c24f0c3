//! Per-run context threaded through every pipeline stage.
//!
//! Holds the debug flag and the sink user-facing progress lines are written
//! to. Diagnostic logging goes through `tracing`; this is only for the
//! messages a user running the tool needs to see.

use std::sync::Arc;

/// Severity of a user-facing status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Info,
    Success,
    Warning,
    Error,
    Debug,
}

impl Status {
    fn prefix(self) -> &'static str {
        match self {
            Status::Info => "info:",
            Status::Success => "ok:",
            Status::Warning => "warning:",
            Status::Error => "error:",
            Status::Debug => "debug:",
        }
    }
}

/// Destination for user-facing status lines.
pub trait OutputSink: Send + Sync {
    fn emit(&self, status: Status, message: &str);
}

/// Writes status lines to stdout (errors to stderr).
pub struct ConsoleSink;

impl OutputSink for ConsoleSink {
    fn emit(&self, status: Status, message: &str) {
        match status {
            Status::Error => eprintln!("{} {}", status.prefix(), message),
            _ => println!("{} {}", status.prefix(), message),
        }
    }
}

/// Cheap to clone; workers each take their own copy.
#[derive(Clone)]
pub struct RunContext {
    debug: bool,
    sink: Arc<dyn OutputSink>,
}

impl RunContext {
    pub fn new(debug: bool, sink: Arc<dyn OutputSink>) -> Self {
        Self { debug, sink }
    }

    /// Context that prints to the terminal
    pub fn console(debug: bool) -> Self {
        Self::new(debug, Arc::new(ConsoleSink))
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.sink.emit(Status::Info, message.as_ref());
    }

    pub fn success(&self, message: impl AsRef<str>) {
        self.sink.emit(Status::Success, message.as_ref());
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.sink.emit(Status::Warning, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.sink.emit(Status::Error, message.as_ref());
    }

    /// Dropped unless the run was started in debug mode.
    pub fn debug(&self, message: impl AsRef<str>) {
        if self.debug {
            self.sink.emit(Status::Debug, message.as_ref());
        }
    }
}
