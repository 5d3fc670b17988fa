//! Panopticon - continuation-aware execution trace recorder
//!
//! This library turns a host runtime's call/return notifications into
//! Chrome Trace Event Format documents. Ordinary activations become
//! duration slices; generators and coroutines that suspend and resume get
//! flow arrows joining each suspension to its resumption.
//!
//! A host adapter reports boundaries through [`observer::dispatch`]; a
//! [`tracer::Tracer`] installed on the thread filters, names and records
//! them into a buffered [`trace::Trace`] or a [`trace::StreamingTrace`].
//!
//! ```
//! use panopticon::config::TracerConfig;
//! use panopticon::frame::CodeUnit;
//! use panopticon::host::Host;
//! use panopticon::trace::{Trace, TraceSink};
//! use panopticon::tracer::FunctionTracer;
//! use std::sync::Arc;
//!
//! let trace = Arc::new(Trace::new());
//! let tracer = FunctionTracer::new(trace.clone(), TracerConfig::default());
//! let host = Host::new();
//! let code = Arc::new(CodeUnit::new("demo/hello.py", 3, "greet"));
//!
//! {
//!     let _guard = tracer.start();
//!     host.invoke(host.activate(&code), |_| ());
//! }
//!
//! assert_eq!(trace.len(), 2);
//! assert!(trace.serialize().unwrap().contains("hello.greet"));
//! ```

pub mod cli;
pub mod config;
pub mod event;
pub mod frame;
pub mod host;
pub mod observer;
pub mod post;
pub mod predicate;
pub mod resolver;
pub mod trace;
pub mod tracer;

pub use tracer::{record_trace, AsyncTracer, FunctionTracer};
