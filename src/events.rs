// Status reporting. The engine never writes to a global logger on its own; whoever creates a
// client or server hands it an event sink, and `LogSink` is the one that forwards to `log`.

use log::Level;
use std::fmt;
use std::sync::Arc;

/// Receives human-readable status messages from the engine.
pub trait EventSink: Send + Sync {
    fn event(&self, level: Level, message: &str);
}

impl<F> EventSink for F
where
    F: Fn(Level, &str) + Send + Sync,
{
    fn event(&self, level: Level, message: &str) {
        self(level, message)
    }
}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn event(&self, level: Level, message: &str) {
        log::log!(target: "tftp", level, "{}", message);
    }
}

/// Cheaply clonable handle to an event sink.
#[derive(Clone)]
pub struct Events(Arc<dyn EventSink>);

impl Events {
    pub fn new(sink: Arc<dyn EventSink>) -> Events {
        Events(sink)
    }

    pub fn error(&self, args: fmt::Arguments) {
        self.0.event(Level::Error, &args.to_string());
    }

    pub fn warn(&self, args: fmt::Arguments) {
        self.0.event(Level::Warn, &args.to_string());
    }

    pub fn info(&self, args: fmt::Arguments) {
        self.0.event(Level::Info, &args.to_string());
    }

    pub fn debug(&self, args: fmt::Arguments) {
        self.0.event(Level::Debug, &args.to_string());
    }
}

impl Default for Events {
    fn default() -> Self {
        Events(Arc::new(LogSink))
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Events")
    }
}

/// Progress of one transfer, reported after every applied DATA block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub transferred: u64,

    /// Total size when `tsize` was negotiated or the size is otherwise known.
    pub total: Option<u64>,
}
