//! Post-processing of recorded traces
//!
//! [`flatten`] throws away real timing and gives every duration on a thread
//! a fixed minimal width, so that the trace reads as a picture of control
//! flow. Timing from a recording session is distorted by the recorder's own
//! overhead anyway.
//!
//! Streamed documents are missing their closing bracket; [`parse_trace`]
//! repairs them transparently.

use fnv::FnvHashMap;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Width of one flattened duration cell
pub const CELL_WIDTH: i64 = 100;

/// Gap left between an END and the cell boundary
pub const CELL_PADDING: i64 = 10;

/// Key of the event array in a full trace document
pub const EVENTS_KEY: &str = "traceEvents";

#[derive(Error, Debug)]
pub enum PostError {
    #[error("Exactly one of a trace file, trace text or parsed trace must be given, got {0}")]
    InputForms(usize),

    #[error("Failed to read trace {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse trace: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Trace document has no traceEvents array")]
    MissingEvents,
}

pub type Result<T> = std::result::Result<T, PostError>;

/// The trace to flatten, in exactly one of three forms
#[derive(Debug, Clone, Default)]
pub struct FlattenInput {
    pub file: Option<PathBuf>,
    pub text: Option<String>,
    pub json: Option<Value>,
}

impl FlattenInput {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn from_json(json: Value) -> Self {
        Self {
            json: Some(json),
            ..Self::default()
        }
    }

    /// Number of non-empty forms present
    pub fn forms(&self) -> usize {
        let file = self
            .file
            .as_ref()
            .is_some_and(|path| !path.as_os_str().is_empty());
        let text = self.text.as_ref().is_some_and(|text| !text.is_empty());
        [file, text, self.json.is_some()]
            .iter()
            .filter(|present| **present)
            .count()
    }

    fn into_document(self) -> Result<Value> {
        let forms = self.forms();
        if forms != 1 {
            return Err(PostError::InputForms(forms));
        }

        match (self.file, self.text, self.json) {
            (_, _, Some(json)) => Ok(json),
            (_, Some(text), _) if !text.is_empty() => parse_trace(&text),
            (Some(path), _, _) => read_trace(&path),
            _ => Err(PostError::InputForms(0)),
        }
    }
}

/// Flatten a trace given as a file, text or parsed JSON
///
/// Returns the document in the shape it was given: a bare event array or an
/// object with a `traceEvents` array.
pub fn flatten(input: FlattenInput) -> Result<Value> {
    flatten_document(input.into_document()?)
}

/// Flatten a parsed document in place
pub fn flatten_document(mut document: Value) -> Result<Value> {
    match &mut document {
        Value::Array(events) => flatten_events(events),
        Value::Object(map) => match map.get_mut(EVENTS_KEY) {
            Some(Value::Array(events)) => flatten_events(events),
            _ => return Err(PostError::MissingEvents),
        },
        _ => return Err(PostError::MissingEvents),
    }
    Ok(document)
}

/// Rewrite the `ts` of duration events, per thread
///
/// A START takes the thread's current offset. An END takes the offset minus
/// the padding, after advancing the offset by one cell if nothing else has
/// advanced it since the matching START. ENDs without a START are left as
/// they are.
pub fn flatten_events(events: &mut [Value]) {
    let mut stacks: FnvHashMap<String, Vec<i64>> = FnvHashMap::default();
    let mut offsets: FnvHashMap<String, i64> = FnvHashMap::default();

    for event in events.iter_mut() {
        let tid = event.get("tid").map(Value::to_string).unwrap_or_default();

        match event.get("ph").and_then(Value::as_str) {
            Some("B") => {
                let offset = *offsets.entry(tid.clone()).or_insert(0);
                set_ts(event, offset);
                stacks.entry(tid).or_default().push(offset);
            }
            Some("E") => {
                let Some(start) = stacks.get_mut(&tid).and_then(Vec::pop) else {
                    tracing::warn!("Discarding unmatched END event {}", event);
                    continue;
                };
                let offset = offsets.entry(tid).or_insert(0);
                if *offset == start {
                    *offset += CELL_WIDTH;
                }
                let ts = *offset - CELL_PADDING;
                set_ts(event, ts);
            }
            _ => {}
        }
    }
}

fn set_ts(event: &mut Value, ts: i64) {
    if let Some(fields) = event.as_object_mut() {
        fields.insert("ts".to_string(), Value::from(ts));
    }
}

/// Close a streamed document: drop the trailing separator, append `]`
pub fn repair(text: &str) -> String {
    format!("{}]", text.trim_end().trim_end_matches(','))
}

/// Parse a trace document, repairing it once if it is unterminated
pub fn parse_trace(text: &str) -> Result<Value> {
    match serde_json::from_str(text) {
        Ok(document) => Ok(document),
        Err(_) => Ok(serde_json::from_str(&repair(text))?),
    }
}

/// Read and parse a trace file
pub fn read_trace(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path).map_err(|source| PostError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_trace(&text)
}
