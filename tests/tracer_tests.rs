//! Integration tests for duration tracing, installation and sinks

mod utils;

use panopticon::config::TracerConfig;
use panopticon::event::{current_thread_id, EventArgs, Phase};
use panopticon::frame::{CodeUnit, Frame, TraceValue, ValueError};
use panopticon::host::{Host, TypeInfo};
use panopticon::observer;
use panopticon::predicate::Predicate;
use panopticon::trace::{same_sink, SharedBuffer, StreamingTrace, Trace, TraceSink};
use panopticon::tracer::{
    FunctionTracer, InstallWarning, Installation, TracerState, NATIVE_CATEGORY, RETURN_KEY,
    UNCONVERTIBLE,
};
use serial_test::serial;
use std::sync::Arc;
use utils::{code, count_named, parse_json_trace, phases};

fn args(pairs: &[(&str, &str)]) -> EventArgs {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn test_capture_arguments_and_return_value() {
    let trace = Arc::new(Trace::new());
    let config = TracerConfig::new().with_capture_args(Predicate::always());
    let tracer = FunctionTracer::new(trace.clone(), config);
    let host = Host::new();
    let f = code(10, "f");

    {
        let _guard = tracer.start();
        let record = host.activate(&f).with_local("x", 2_i64).with_local("y", 3_i64);
        let product = host.invoke(record, |_| 2_i64 * 3);
        assert_eq!(product, 6);
    }

    let events = trace.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].phase(), Phase::DurationBegin);
    assert_eq!(events[0].args(), Some(&args(&[("x", "2"), ("y", "3")])));
    assert_eq!(events[1].phase(), Phase::DurationEnd);
    assert_eq!(events[1].args(), Some(&args(&[(RETURN_KEY, "6")])));
}

#[test]
fn test_no_args_without_capture() {
    let trace = Arc::new(Trace::new());
    let tracer = FunctionTracer::new(trace.clone(), TracerConfig::default());
    let host = Host::new();

    {
        let _guard = tracer.start();
        host.invoke(host.activate(&code(10, "f")).with_local("x", 1_u8), |_| ());
    }

    assert!(trace.events().iter().all(|e| e.args().is_none()));
}

#[test]
fn test_one_start_and_end_per_invocation() {
    let trace = Arc::new(Trace::new());
    let tracer = FunctionTracer::new(trace.clone(), TracerConfig::default());
    let host = Host::new();
    let outer = code(1, "outer_function");
    let inner = code(5, "inner_function");

    {
        let _guard = tracer.start();
        host.invoke(host.activate(&outer), |_| {
            host.invoke(host.activate(&inner), |_| ());
            host.invoke(host.activate(&inner), |_| ());
        });
    }

    let events = trace.events();
    let seen: Vec<(&str, &str)> = events
        .iter()
        .map(|e| (e.phase().code(), e.name()))
        .collect();
    assert_eq!(
        seen,
        [
            ("B", "test_tracer.outer_function"),
            ("B", "test_tracer.inner_function"),
            ("E", "test_tracer.inner_function"),
            ("B", "test_tracer.inner_function"),
            ("E", "test_tracer.inner_function"),
            ("E", "test_tracer.outer_function"),
        ]
    );
    assert_eq!(events[0].category(), "tests/test_tracer.py:1");
    assert_eq!(events[0].category(), events[5].category());
    assert!(events
        .windows(2)
        .all(|pair| pair[0].timestamp() <= pair[1].timestamp()));
}

#[test]
fn test_skip_filter_drops_notifications() {
    let trace = Arc::new(Trace::new());
    let config = TracerConfig::new().with_skip(Predicate::module_equals("asyncio"));
    let tracer = FunctionTracer::new(trace.clone(), config);
    let host = Host::new();
    let library = Arc::new(CodeUnit::new(
        "/usr/lib/python3/asyncio/events.py",
        80,
        "_run",
    ));

    {
        let _guard = tracer.start();
        host.invoke(host.activate(&code(1, "main")), |_| {
            host.invoke(host.activate(&library), |_| ());
        });
    }

    let events = trace.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.name() == "test_tracer.main"));
    assert_eq!(tracer.correlator().cached_names(), 0);
}

#[test]
fn test_native_calls() {
    let trace = Arc::new(Trace::new());
    let tracer = FunctionTracer::new(trace.clone(), TracerConfig::default());
    let host = Host::new();

    {
        let _guard = tracer.start();
        host.invoke(host.activate(&code(3, "hello")), |frame| {
            host.native(frame, "<built-in function print>");
        });
    }

    let events = trace.events();
    assert_eq!(events.len(), 4);
    assert_eq!(events[1].name(), "<built-in function print>");
    assert_eq!(events[1].category(), NATIVE_CATEGORY);
    assert_eq!(events[1].phase(), Phase::DurationBegin);
    assert_eq!(events[2].name(), "<built-in function print>");
    assert_eq!(events[2].phase(), Phase::DurationEnd);
}

#[test]
fn test_native_calls_can_be_skipped() {
    let trace = Arc::new(Trace::new());
    let config = TracerConfig::new().with_skip(Predicate::native());
    let tracer = FunctionTracer::new(trace.clone(), config);
    let host = Host::new();

    {
        let _guard = tracer.start();
        host.invoke(host.activate(&code(3, "hello")), |frame| {
            host.native(frame, "<built-in function print>");
            host.native_exception(frame, "<built-in function open>");
        });
    }

    assert_eq!(trace.len(), 2);
}

#[test]
fn test_method_names_include_class() {
    let trace = Arc::new(Trace::new());
    let tracer = FunctionTracer::new(trace.clone(), TracerConfig::default());
    let host = Host::new();
    let clear = code(20, "clear");

    {
        let _guard = tracer.start();
        let record = host
            .activate(&clear)
            .with_local("self", "<TabulaRasa object>")
            .with_receiver(TypeInfo::new("TabulaRasa").with_callable("clear"));
        host.invoke(record, |_| ());
    }

    assert_eq!(
        count_named(
            &parse_json_trace(&trace.serialize().unwrap()),
            "test_tracer.TabulaRasa.clear"
        ),
        2
    );
}

#[test]
fn test_cache_released_on_stop() {
    let trace = Arc::new(Trace::new());
    let tracer = FunctionTracer::new(trace.clone(), TracerConfig::default());
    let host = Host::new();
    let record = host.activate(&code(1, "long_running"));

    let guard = tracer.start();
    host.call(&record);
    assert_eq!(tracer.correlator().cached_names(), 1);
    assert_eq!(tracer.state(), TracerState::Active);
    guard.stop();

    assert_eq!(tracer.state(), TracerState::Stopped);
    assert_eq!(tracer.correlator().cached_names(), 0);
    host.finish(record, None);
    assert_eq!(trace.len(), 1);
}

#[test]
fn test_end_without_start_is_discarded() {
    let trace = Arc::new(Trace::new());
    let tracer = FunctionTracer::new(trace.clone(), TracerConfig::default());
    let host = Host::new();

    let started_earlier = host.activate(&code(1, "started_earlier"));
    host.call(&started_earlier);

    {
        let _guard = tracer.start();
        host.invoke(host.activate(&code(2, "inside")), |_| ());
        host.finish(started_earlier, None);
    }

    let events = trace.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.name() == "test_tracer.inside"));
}

struct Opaque;

impl TraceValue for Opaque {
    fn repr(&self) -> Result<String, ValueError> {
        Err(ValueError::Failed("__repr__ raised".to_string()))
    }

    fn display(&self) -> Result<String, ValueError> {
        Err(ValueError::Failed("__str__ raised".to_string()))
    }
}

#[test]
fn test_unconvertible_values_use_placeholder() {
    let trace = Arc::new(Trace::new());
    let config = TracerConfig::new().with_capture_args(Predicate::always());
    let tracer = FunctionTracer::new(trace.clone(), config);
    let host = Host::new();

    {
        let _guard = tracer.start();
        let record = host.activate(&code(1, "f")).with_local("weird", Opaque);
        host.invoke(record, |_| 1_i32);
    }

    let events = trace.events();
    assert_eq!(events[0].args(), Some(&args(&[("weird", UNCONVERTIBLE)])));
    assert_eq!(events[1].args(), Some(&args(&[(RETURN_KEY, "1")])));
}

#[test]
fn test_capture_predicate_is_per_notification() {
    let trace = Arc::new(Trace::new());
    let config = TracerConfig::new()
        .with_capture_args(Predicate::new(|frame, _, _| frame.code().name() == "captured"));
    let tracer = FunctionTracer::new(trace.clone(), config);
    let host = Host::new();

    {
        let _guard = tracer.start();
        host.invoke(host.activate(&code(1, "captured")).with_local("a", 1_i32), |_| ());
        host.invoke(host.activate(&code(2, "ignored")).with_local("a", 1_i32), |_| ());
    }

    let events = trace.events();
    assert!(events[0].args().is_some());
    assert!(events[1].args().is_some());
    assert!(events[2].args().is_none());
    assert!(events[3].args().is_none());
}

struct Chatty {
    host: Arc<Host>,
}

impl TraceValue for Chatty {
    fn repr(&self) -> Result<String, ValueError> {
        let helper = code(99, "repr_helper");
        self.host.invoke(self.host.activate(&helper), |_| ());
        Ok("chatty".to_string())
    }
}

#[test]
fn test_conversion_does_not_trace_itself() {
    let trace = Arc::new(Trace::new());
    let config = TracerConfig::new().with_capture_args(Predicate::always());
    let tracer = FunctionTracer::new(trace.clone(), config);
    let host = Arc::new(Host::new());

    {
        let _guard = tracer.start();
        let value = Chatty {
            host: Arc::clone(&host),
        };
        host.invoke(host.activate(&code(1, "f")).with_local("value", value), |_| ());
    }

    let events = trace.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].args(), Some(&args(&[("value", "chatty")])));
}

#[test]
fn test_nested_start_same_trace_delegates() {
    let trace = Arc::new(Trace::new());
    let outer = FunctionTracer::new(trace.clone(), TracerConfig::default());
    let inner = FunctionTracer::new(trace.clone(), TracerConfig::default());
    let host = Host::new();

    {
        let _outer_guard = outer.start();
        {
            let inner_guard = inner.start();
            assert_eq!(inner_guard.installation(), &Installation::Delegated);
            assert!(inner_guard.warning().is_none());
            host.invoke(host.activate(&code(1, "f")), |_| ());
        }
        assert_eq!(observer::current().map(|o| o.kind()), Some("FunctionTracer"));
        host.invoke(host.activate(&code(2, "g")), |_| ());
    }

    assert!(observer::current().is_none());
    assert_eq!(trace.len(), 4);
    assert_eq!(inner.state(), TracerState::Stopped);
}

#[test]
fn test_same_tracer_started_twice() {
    let trace = Arc::new(Trace::new());
    let tracer = FunctionTracer::new(trace.clone(), TracerConfig::default());
    let host = Host::new();

    let first = tracer.start();
    let second = tracer.start();
    assert_eq!(second.installation(), &Installation::Delegated);
    host.invoke(host.activate(&code(1, "f")), |_| ());
    drop(second);
    host.invoke(host.activate(&code(1, "f")), |_| ());
    drop(first);

    assert_eq!(trace.len(), 4);
    assert!(observer::current().is_none());
}

#[test]
fn test_conflicting_trace_warns_and_records_nothing() {
    let trace1 = Arc::new(Trace::new());
    let trace2 = Arc::new(Trace::new());
    let tracer1 = FunctionTracer::new(trace1.clone(), TracerConfig::default());
    let tracer2 = FunctionTracer::new(trace2.clone(), TracerConfig::default());
    let host = Host::new();

    {
        let _outer = tracer2.start();
        host.invoke(host.activate(&code(1, "outer_hello")), |_| {
            let inner = tracer1.start();
            let warning = inner.warning().cloned().expect("conflict expected");
            assert!(matches!(warning, InstallWarning::MultipleTracers { .. }));
            assert!(warning.to_string().contains("Multiple"));
            host.invoke(host.activate(&code(5, "inner_hello")), |_| ());
        });
    }

    assert!(trace1.is_empty());
    let names: Vec<String> = trace2.events().iter().map(|e| e.name().to_string()).collect();
    assert_eq!(names.len(), 4);
    assert!(names.contains(&"test_tracer.inner_hello".to_string()));
    assert_eq!(tracer1.state(), TracerState::Stopped);
}

#[test]
fn test_concurrent_threads_trace_independently() {
    let handles: Vec<_> = ["alpha", "beta"]
        .into_iter()
        .map(|name| {
            std::thread::spawn(move || {
                let trace = Arc::new(Trace::new());
                let tracer = FunctionTracer::new(trace.clone(), TracerConfig::default());
                let host = Host::new();
                let unit = code(1, name);
                let guard = tracer.start();
                assert_eq!(guard.installation(), &Installation::Installed);
                for _ in 0..200 {
                    host.invoke(host.activate(&unit), |_| ());
                }
                drop(guard);
                (name, current_thread_id(), trace)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_ne!(results[0].1, results[1].1);

    for (name, tid, trace) in results {
        let events = trace.events();
        assert_eq!(events.len(), 400);
        let expected = format!("test_tracer.{}", name);
        assert!(events.iter().all(|e| e.name() == expected));
        assert!(events.iter().all(|e| e.thread_id() == tid));
    }
}

#[test]
fn test_shared_trace_across_threads() {
    let trace = Arc::new(Trace::new());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let trace = Arc::clone(&trace);
            std::thread::spawn(move || {
                let tracer = FunctionTracer::new(trace, TracerConfig::default());
                let host = Host::new();
                let unit = code(i, "worker");
                let _guard = tracer.start();
                for _ in 0..50 {
                    host.invoke(host.activate(&unit), |_| ());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(trace.len(), 400);
    let json = parse_json_trace(&trace.serialize().unwrap());
    assert_eq!(count_named(&json, "test_tracer.worker"), 400);
}

#[test]
#[serial]
fn test_trace_threads_follows_spawned_threads() {
    let trace = Arc::new(Trace::new());
    let config = TracerConfig::new().with_trace_threads(true);
    let tracer = FunctionTracer::new(trace.clone(), config);

    let child_tid = {
        let _guard = tracer.start();
        let inherited = observer::spawn(|| {
            let host = Host::new();
            host.invoke(host.activate(&code(1, "child")), |_| ());
            current_thread_id()
        })
        .join()
        .unwrap();

        std::thread::spawn(|| {
            let host = Host::new();
            host.invoke(host.activate(&code(2, "untraced")), |_| ());
        })
        .join()
        .unwrap();

        inherited
    };

    assert!(observer::default_observer().is_none());
    let events = trace.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.name() == "test_tracer.child"));
    assert!(events.iter().all(|e| e.thread_id() == child_tid));
}

#[test]
#[serial]
fn test_second_thread_tracer_keeps_first_default() {
    let first_trace = Arc::new(Trace::new());
    let second_trace = Arc::new(Trace::new());
    let config = TracerConfig::new().with_trace_threads(true);
    let first = FunctionTracer::new(first_trace.clone(), config.clone());
    let second = FunctionTracer::new(second_trace.clone(), config);

    {
        let _guard = first.start();
        std::thread::spawn(move || {
            let guard = second.start();
            assert_eq!(guard.installation(), &Installation::Installed);
            observer::spawn(|| {
                let host = Host::new();
                host.invoke(host.activate(&code(1, "child")), |_| ());
            })
            .join()
            .unwrap();
        })
        .join()
        .unwrap();

        let first_sink: Arc<dyn TraceSink> = first_trace.clone();
        let default = observer::default_observer().expect("first tracer stays the default");
        assert!(same_sink(default.sink(), &first_sink));
    }

    assert!(observer::default_observer().is_none());
    let events = parse_json_trace(&first_trace.serialize().unwrap());
    assert_eq!(count_named(&events, "test_tracer.child"), 2);
    assert!(second_trace.is_empty());
}

#[test]
#[serial]
fn test_without_trace_threads_children_are_untraced() {
    let trace = Arc::new(Trace::new());
    let tracer = FunctionTracer::new(trace.clone(), TracerConfig::default());

    {
        let _guard = tracer.start();
        observer::spawn(|| {
            let host = Host::new();
            host.invoke(host.activate(&code(1, "child")), |_| ());
        })
        .join()
        .unwrap();
    }

    assert!(trace.is_empty());
}

#[test]
fn test_streaming_trace_output() {
    let buffer = SharedBuffer::new();
    let sink = Arc::new(StreamingTrace::new(buffer.clone()).unwrap());
    let tracer = FunctionTracer::new(sink.clone(), TracerConfig::default());
    let host = Host::new();

    {
        let _guard = tracer.start();
        host.invoke(host.activate(&code(3, "hello")), |frame| {
            host.native(frame, "<built-in function print>");
        });
    }

    let text = buffer.contents();
    assert!(text.starts_with("[\n"));
    assert!(text.ends_with(",\n"));
    assert_eq!(sink.serialize().unwrap(), text);

    let events = parse_json_trace(&text);
    assert_eq!(phases(&events), ["B", "B", "E", "E"]);
    for event in &events {
        for key in ["name", "cat", "ph", "pid", "tid", "ts", "tts"] {
            assert!(event.get(key).is_some(), "missing {key}");
        }
    }
}

#[test]
fn test_buffered_serialization_is_repeatable() {
    let trace = Arc::new(Trace::new());
    let tracer = FunctionTracer::new(trace.clone(), TracerConfig::default());
    let host = Host::new();

    {
        let _guard = tracer.start();
        host.invoke(host.activate(&code(3, "hello")), |_| ());
    }

    let first = trace.serialize().unwrap();
    let second = trace.serialize().unwrap();
    assert_eq!(first, second);

    let document: serde_json::Value = serde_json::from_str(&first).unwrap();
    assert_eq!(document["displayTimeUnit"], "ns");
    assert_eq!(document["traceEvents"].as_array().unwrap().len(), 2);
}

#[test]
fn test_mark_adds_instant_event() {
    let trace = Arc::new(Trace::new());
    let tracer = FunctionTracer::new(trace.clone(), TracerConfig::default());
    let host = Host::new();

    {
        let _guard = tracer.start();
        host.invoke(host.activate(&code(3, "hello")), |_| {
            tracer.mark("halfway").unwrap();
        });
    }

    let json = parse_json_trace(&trace.serialize().unwrap());
    assert_eq!(phases(&json), ["B", "i", "E"]);
    assert_eq!(json[1]["name"], "halfway");
    assert_eq!(json[1]["s"], "t");
}
