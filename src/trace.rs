//! Trace sinks: buffered and streaming
//!
//! A [`Trace`] keeps every event in memory and can be serialized into a full
//! Chrome trace document any number of times. A [`StreamingTrace`] writes
//! each event as soon as it arrives and keeps nothing, which leaves the
//! document open (`[` plus comma-terminated objects) until a consumer repairs
//! it, see [`crate::post::repair`].
//!
//! Both sinks are safe to share across threads; each append takes a single
//! lock.

use crate::event::TraceEvent;
use serde::Serialize;
use std::fs::File;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Unit the viewer uses to display timestamps
pub const DISPLAY_TIME_UNIT: &str = "ns";

/// Errors raised by trace sinks
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Failed to serialize trace: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write trace output: {0}")]
    Io(#[from] io::Error),
}

/// Result type for trace sink operations
pub type Result<T> = std::result::Result<T, TraceError>;

/// Destination for trace events
pub trait TraceSink: Send + Sync {
    /// Append one event. Events are never mutated or removed afterwards.
    fn add_event(&self, event: TraceEvent) -> Result<()>;

    /// Textual form of everything recorded so far
    fn serialize(&self) -> Result<String>;
}

/// Identity comparison for shared sinks
pub fn same_sink(a: &Arc<dyn TraceSink>, b: &Arc<dyn TraceSink>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Version string recorded in the document header
pub fn recorder_version() -> String {
    format!("Panopticon {}", env!("CARGO_PKG_VERSION"))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Serialize)]
struct OtherData {
    version: String,
}

#[derive(Serialize)]
struct TraceDocument<'a> {
    #[serde(rename = "traceEvents")]
    trace_events: &'a [TraceEvent],
    #[serde(rename = "displayTimeUnit")]
    display_time_unit: &'static str,
    #[serde(rename = "otherData")]
    other_data: OtherData,
}

/// In-memory trace
#[derive(Debug, Default)]
pub struct Trace {
    events: Mutex<Vec<TraceEvent>>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded events
    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.events).is_empty()
    }

    /// Snapshot of the recorded events in emission order
    pub fn events(&self) -> Vec<TraceEvent> {
        lock(&self.events).clone()
    }
}

impl TraceSink for Trace {
    fn add_event(&self, event: TraceEvent) -> Result<()> {
        lock(&self.events).push(event);
        Ok(())
    }

    fn serialize(&self) -> Result<String> {
        let events = lock(&self.events);
        let document = TraceDocument {
            trace_events: &events,
            display_time_unit: DISPLAY_TIME_UNIT,
            other_data: OtherData {
                version: recorder_version(),
            },
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }
}

/// Writer a [`StreamingTrace`] can stream into
///
/// Writers backed by memory can hand their text back through
/// `buffered_text`; everything else is described by `describe`.
pub trait TraceOutput: Write + Send {
    fn buffered_text(&self) -> Option<String> {
        None
    }

    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

impl TraceOutput for File {}

impl TraceOutput for io::Stdout {
    fn describe(&self) -> String {
        "<stdout>".to_string()
    }
}

impl TraceOutput for io::Stderr {
    fn describe(&self) -> String {
        "<stderr>".to_string()
    }
}

impl TraceOutput for io::Sink {
    fn describe(&self) -> String {
        "<discarded>".to_string()
    }
}

impl TraceOutput for Vec<u8> {
    fn buffered_text(&self) -> Option<String> {
        Some(String::from_utf8_lossy(self).into_owned())
    }
}

/// Cloneable in-memory writer; all clones see the same bytes
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.bytes)).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.bytes).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl TraceOutput for SharedBuffer {
    fn buffered_text(&self) -> Option<String> {
        Some(self.contents())
    }
}

/// Trace that writes events out immediately instead of keeping them
pub struct StreamingTrace<W: TraceOutput> {
    out: Mutex<W>,
}

impl<W: TraceOutput> StreamingTrace<W> {
    /// Open the document (writes the opening bracket)
    pub fn new(mut out: W) -> Result<Self> {
        out.write_all(b"[\n")?;
        out.flush()?;
        Ok(Self {
            out: Mutex::new(out),
        })
    }

    /// Give back the writer; the document stays unterminated
    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: TraceOutput> TraceSink for StreamingTrace<W> {
    fn add_event(&self, event: TraceEvent) -> Result<()> {
        let fragment = event.to_json()?;
        let mut out = lock(&self.out);
        out.write_all(fragment.as_bytes())?;
        out.write_all(b",\n")?;
        out.flush()?;
        Ok(())
    }

    fn serialize(&self) -> Result<String> {
        let out = lock(&self.out);
        Ok(out
            .buffered_text()
            .unwrap_or_else(|| format!("StreamingTrace ({})", out.describe())))
    }
}

impl<W: TraceOutput> std::fmt::Debug for StreamingTrace<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingTrace")
            .field("out", &lock(&self.out).describe())
            .finish()
    }
}
