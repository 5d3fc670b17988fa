// Shared helpers for integration tests

#![allow(dead_code)]

use panopticon::frame::{CodeFlags, CodeUnit};
use panopticon::post;
use serde_json::Value;
use std::sync::Arc;

/// Path used for code units that stand in for the program under test
pub const TEST_PATH: &str = "tests/test_tracer.py";

pub fn code(line: u32, name: &str) -> Arc<CodeUnit> {
    Arc::new(CodeUnit::new(TEST_PATH, line, name))
}

pub fn continuation(line: u32, name: &str, flags: CodeFlags) -> Arc<CodeUnit> {
    Arc::new(CodeUnit::new(TEST_PATH, line, name).with_flags(flags))
}

/// Events of a streamed or complete trace document
pub fn parse_json_trace(text: &str) -> Vec<Value> {
    let document = post::parse_trace(text).expect("trace should parse");
    match document {
        Value::Array(events) => events,
        Value::Object(mut map) => match map.remove("traceEvents") {
            Some(Value::Array(events)) => events,
            other => panic!("no traceEvents array: {:?}", other),
        },
        other => panic!("unexpected trace document: {}", other),
    }
}

/// `ph` of every event, in order
pub fn phases(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|e| e["ph"].as_str().unwrap_or_default().to_string())
        .collect()
}

pub fn count_named(events: &[Value], name: &str) -> usize {
    events.iter().filter(|e| e["name"] == name).count()
}
