//! Trace event records in the Chrome Trace Event Format
//!
//! Every record carries the fields the trace viewer requires (`name`, `cat`,
//! `ph`, `pid`, `tid`, `ts`) plus a best-effort thread CPU timestamp (`tts`).
//! Duration events use `B`/`E`, flow events `s`/`t`/`f` with `id` and `bp`,
//! and instant events `i` with a scope `s`.
//!
//! Records are immutable once built: all fields are private and the
//! timestamps are sampled inside the constructor, so `ts` is the instant the
//! event was created, never the instant it reached a sink.

use serde::Serialize;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Captured arguments (parameter name -> display string)
pub type EventArgs = BTreeMap<String, String>;

/// Event phase, serialized as the single-character Chrome phase code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    #[serde(rename = "B")]
    DurationBegin,
    #[serde(rename = "E")]
    DurationEnd,
    #[serde(rename = "i")]
    Instant,
    #[serde(rename = "s")]
    FlowStart,
    #[serde(rename = "t")]
    FlowStep,
    #[serde(rename = "f")]
    FlowEnd,
}

impl Phase {
    /// Chrome phase code
    pub fn code(&self) -> &'static str {
        match self {
            Phase::DurationBegin => "B",
            Phase::DurationEnd => "E",
            Phase::Instant => "i",
            Phase::FlowStart => "s",
            Phase::FlowStep => "t",
            Phase::FlowEnd => "f",
        }
    }
}

/// Phase of a duration event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DurationPhase {
    Start,
    End,
}

impl From<DurationPhase> for Phase {
    fn from(phase: DurationPhase) -> Self {
        match phase {
            DurationPhase::Start => Phase::DurationBegin,
            DurationPhase::End => Phase::DurationEnd,
        }
    }
}

/// Phase of a flow event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowPhase {
    Start,
    Instant,
    End,
}

impl From<FlowPhase> for Phase {
    fn from(phase: FlowPhase) -> Self {
        match phase {
            FlowPhase::Start => Phase::FlowStart,
            FlowPhase::Instant => Phase::FlowStep,
            FlowPhase::End => Phase::FlowEnd,
        }
    }
}

/// Scope of an instant event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InstantScope {
    #[serde(rename = "g")]
    Global,
    #[serde(rename = "p")]
    Process,
    #[serde(rename = "t")]
    Thread,
}

/// Whether a flow arrow binds to the enclosing slice or the next slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FlowBindingPoint {
    #[serde(rename = "e")]
    Enclosing,
    #[serde(rename = "n")]
    Next,
}

/// A single trace event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEvent {
    name: String,
    cat: String,
    ph: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<EventArgs>,
    ts: f64,
    tts: f64,
    pid: u32,
    tid: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bp: Option<FlowBindingPoint>,
    #[serde(rename = "s", skip_serializing_if = "Option::is_none")]
    scope: Option<InstantScope>,
}

impl TraceEvent {
    fn stamped(name: String, cat: String, ph: Phase, args: Option<EventArgs>) -> Self {
        Self {
            name,
            cat,
            ph,
            args,
            ts: now_us(),
            tts: thread_cpu_us(),
            pid: std::process::id(),
            tid: current_thread_id(),
            id: None,
            bp: None,
            scope: None,
        }
    }

    /// Begin or end of an activation's visible span
    pub fn duration(
        name: impl Into<String>,
        cat: impl Into<String>,
        phase: DurationPhase,
        args: Option<EventArgs>,
    ) -> Self {
        Self::stamped(name.into(), cat.into(), phase.into(), args)
    }

    /// A point in time with no duration
    pub fn instant(name: impl Into<String>, cat: impl Into<String>, scope: InstantScope) -> Self {
        let mut event = Self::stamped(name.into(), cat.into(), Phase::Instant, None);
        event.scope = Some(scope);
        event
    }

    /// One end (or step) of a flow arrow correlated by `id`
    pub fn flow(
        name: impl Into<String>,
        cat: impl Into<String>,
        phase: FlowPhase,
        id: u64,
        bp: FlowBindingPoint,
    ) -> Self {
        let mut event = Self::stamped(name.into(), cat.into(), phase.into(), None);
        event.id = Some(id);
        event.bp = Some(bp);
        event
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &str {
        &self.cat
    }

    pub fn phase(&self) -> Phase {
        self.ph
    }

    pub fn args(&self) -> Option<&EventArgs> {
        self.args.as_ref()
    }

    /// Wall-aligned monotonic timestamp in microseconds
    pub fn timestamp(&self) -> f64 {
        self.ts
    }

    /// Thread CPU time in microseconds (0 when unavailable)
    pub fn thread_timestamp(&self) -> f64 {
        self.tts
    }

    pub fn process_id(&self) -> u32 {
        self.pid
    }

    pub fn thread_id(&self) -> u64 {
        self.tid
    }

    /// Flow correlation id (flow events only)
    pub fn flow_id(&self) -> Option<u64> {
        self.id
    }

    pub fn binding_point(&self) -> Option<FlowBindingPoint> {
        self.bp
    }

    pub fn scope(&self) -> Option<InstantScope> {
        self.scope
    }

    /// Serialize as a single compact JSON object
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

struct ClockAnchor {
    wall_us: f64,
    origin: Instant,
}

fn anchor() -> &'static ClockAnchor {
    static ANCHOR: OnceLock<ClockAnchor> = OnceLock::new();
    ANCHOR.get_or_init(|| ClockAnchor {
        wall_us: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as f64 / 1000.0)
            .unwrap_or(0.0),
        origin: Instant::now(),
    })
}

/// Microseconds since the Unix epoch, advanced by a monotonic clock so that
/// wall-clock adjustments never reorder events.
pub fn now_us() -> f64 {
    let anchor = anchor();
    anchor.wall_us + anchor.origin.elapsed().as_nanos() as f64 / 1000.0
}

/// CPU time consumed by the calling thread, in microseconds
#[cfg(unix)]
pub fn thread_cpu_us() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return 0.0;
    }
    ts.tv_sec as f64 * 1_000_000.0 + ts.tv_nsec as f64 / 1000.0
}

#[cfg(not(unix))]
pub fn thread_cpu_us() -> f64 {
    0.0
}

thread_local! {
    static THREAD_ID: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Native id of the calling thread (cached per thread)
pub fn current_thread_id() -> u64 {
    THREAD_ID
        .try_with(|cached| match cached.get() {
            Some(tid) => tid,
            None => {
                let tid = native_thread_id();
                cached.set(Some(tid));
                tid
            }
        })
        .unwrap_or_else(|_| native_thread_id())
}

#[cfg(target_os = "linux")]
fn native_thread_id() -> u64 {
    // SAFETY: gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(not(target_os = "linux"))]
fn native_thread_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
