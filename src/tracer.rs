//! Tracers: turn activation notifications into trace events
//!
//! A [`Tracer`] applies the skip filter and hands every surviving
//! notification to its [`Correlator`], which decides what to emit:
//!
//! - [`Durations`] emits one `B`/`E` pair per activation, naming user code
//!   `module.Class.function` and native callables by their own descriptor.
//! - [`Continuations`] additionally links each suspension of a generator or
//!   coroutine to its resumption with an `s`/`f` flow pair, so the gap
//!   between two slices of one logical unit of work is visible.
//!
//! Tracers are installed per thread through scoped [`TracerGuard`]s.
//! Starting a second tracer on a thread that already has one never stacks
//! observers: a tracer writing into the same trace is reused, and one
//! writing into a different trace is refused with an [`InstallWarning`].

use crate::config::TracerConfig;
use crate::event::{
    current_thread_id, DurationPhase, EventArgs, FlowBindingPoint, FlowPhase, InstantScope,
    TraceEvent,
};
use crate::frame::{ActivationEvent, ActivationId, Frame, Payload, TraceValue, ValueError};
use crate::observer::{self, Observer};
use crate::predicate::Predicate;
use crate::resolver::NameResolver;
use crate::trace::{self, same_sink, StreamingTrace, TraceSink};
use fnv::{FnvHashMap, FnvHashSet};
use std::fs::File;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Argument key holding a captured return value
pub const RETURN_KEY: &str = "[return value]";

/// Category of native call events
pub const NATIVE_CATEGORY: &str = "native";

/// Placeholder for values that cannot be converted to text
pub const UNCONVERTIBLE: &str = "<couldn't convert>";

/// Category of instant events written by [`Tracer::mark`]
pub const MARK_CATEGORY: &str = "mark";

/// Non-fatal problems reported when starting a tracer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallWarning {
    #[error("Multiple tracers on one thread: {active} already records into another trace, {requested} will not record")]
    MultipleTracers {
        active: &'static str,
        requested: &'static str,
    },
}

/// Outcome of [`Tracer::start`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Installation {
    /// Installed as the thread's observer
    Installed,
    /// An observer for the same trace was already active and keeps recording
    Delegated,
    /// An observer for another trace is active; nothing was installed
    Conflicted(InstallWarning),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerState {
    Stopped,
    Active,
}

/// Strategy turning filtered notifications into events
pub trait Correlator: Send + Sync + 'static {
    /// Name used in diagnostics and conflict warnings
    const KIND: &'static str;

    fn correlate(
        &self,
        sink: &dyn TraceSink,
        frame: &dyn Frame,
        event: ActivationEvent,
        payload: Payload<'_>,
    );

    /// Drop all per-activation state
    fn reset(&self);

    /// Drop the state of one activation destroyed without a final return
    fn release(&self, id: ActivationId);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn record(sink: &dyn TraceSink, event: TraceEvent) {
    if let Err(e) = sink.add_event(event) {
        tracing::warn!("Failed to record trace event: {}", e);
    }
}

fn attempt<F>(convert: F) -> Result<String, ValueError>
where
    F: FnOnce() -> Result<String, ValueError>,
{
    panic::catch_unwind(AssertUnwindSafe(convert)).unwrap_or(Err(ValueError::Panicked))
}

/// Text for a captured value; never fails
///
/// Tries the value's `repr`, then its `display`, then gives up with
/// [`UNCONVERTIBLE`]. Panics inside either conversion count as failures.
pub fn safe_repr(key: &str, value: &dyn TraceValue) -> String {
    match attempt(|| value.repr()) {
        Ok(text) => return text,
        Err(e) => tracing::warn!("Couldn't represent value for {}: {}", key, e),
    }

    match attempt(|| value.display()) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("Couldn't stringify value for {}: {}", key, e);
            UNCONVERTIBLE.to_string()
        }
    }
}

/// Duration events for calls and returns
#[derive(Debug, Default)]
pub struct Durations {
    capture_args: Option<Predicate>,
    names: Mutex<NameResolver>,
    // open `B` events per thread id
    open: Mutex<FnvHashMap<u64, usize>>,
}

impl Durations {
    pub fn new(capture_args: Option<Predicate>) -> Self {
        Self {
            capture_args,
            ..Self::default()
        }
    }

    /// Number of activations with a cached name
    pub fn cached_names(&self) -> usize {
        lock(&self.names).len()
    }

    /// Emit the duration event for one notification.
    ///
    /// `release` evicts the activation's cached name; pass it on the
    /// activation's final return.
    pub fn emit(
        &self,
        sink: &dyn TraceSink,
        frame: &dyn Frame,
        event: ActivationEvent,
        payload: Payload<'_>,
        release: bool,
    ) {
        let phase = if event.is_call_like() {
            DurationPhase::Start
        } else if event.is_return_like() {
            DurationPhase::End
        } else {
            return;
        };

        if !self.balance(phase) {
            tracing::warn!(
                "Discarding END for {} at {}: no matching START on this thread",
                frame.code().name(),
                frame.code().category()
            );
            if release {
                lock(&self.names).resolve(frame, true);
            }
            return;
        }

        let (name, category) = if event.is_native() {
            let name = payload.native_name().unwrap_or("<native>").to_string();
            (name, NATIVE_CATEGORY.to_string())
        } else {
            let resolved = lock(&self.names).resolve(frame, release);
            (resolved.name, resolved.category)
        };

        let args = self.capture(frame, event, payload);
        record(sink, TraceEvent::duration(name, category, phase, args));
    }

    /// Whether an END on the calling thread would match an open START
    pub fn accepts_end(&self) -> bool {
        lock(&self.open)
            .get(&current_thread_id())
            .is_some_and(|depth| *depth > 0)
    }

    /// Track nesting on the calling thread; false for an unmatched END
    fn balance(&self, phase: DurationPhase) -> bool {
        let tid = current_thread_id();
        let mut open = lock(&self.open);
        match phase {
            DurationPhase::Start => {
                *open.entry(tid).or_insert(0) += 1;
                true
            }
            DurationPhase::End => match open.get_mut(&tid) {
                Some(depth) if *depth > 0 => {
                    *depth -= 1;
                    if *depth == 0 {
                        open.remove(&tid);
                    }
                    true
                }
                _ => false,
            },
        }
    }

    fn capture(
        &self,
        frame: &dyn Frame,
        event: ActivationEvent,
        payload: Payload<'_>,
    ) -> Option<EventArgs> {
        let capture = self.capture_args.as_ref()?;
        if !capture.matches(frame, event, payload) {
            return None;
        }

        match event {
            ActivationEvent::Call => Some(
                frame
                    .locals()
                    .into_iter()
                    .map(|(key, value)| (key.to_string(), safe_repr(key, value)))
                    .collect(),
            ),
            ActivationEvent::Return => {
                let value = payload.value().unwrap_or(&());
                let mut args = EventArgs::new();
                args.insert(RETURN_KEY.to_string(), safe_repr(RETURN_KEY, value));
                Some(args)
            }
            _ => None,
        }
    }
}

impl Correlator for Durations {
    const KIND: &'static str = "FunctionTracer";

    fn correlate(
        &self,
        sink: &dyn TraceSink,
        frame: &dyn Frame,
        event: ActivationEvent,
        payload: Payload<'_>,
    ) {
        self.emit(sink, frame, event, payload, event == ActivationEvent::Return);
    }

    fn reset(&self) {
        lock(&self.names).clear();
        lock(&self.open).clear();
    }

    fn release(&self, id: ActivationId) {
        lock(&self.names).evict(id);
    }
}

/// Duration events plus flow arrows across continuation suspensions
///
/// An activation is in the suspended set exactly while its continuation has
/// been seen suspending and not yet seen resuming, finishing or being
/// released. A suspension whose END is discarded as unmatched is not seen.
#[derive(Debug, Default)]
pub struct Continuations {
    durations: Durations,
    suspended: Mutex<FnvHashSet<ActivationId>>,
}

impl Continuations {
    pub fn new(capture_args: Option<Predicate>) -> Self {
        Self {
            durations: Durations::new(capture_args),
            suspended: Mutex::default(),
        }
    }

    /// Number of continuations currently suspended
    pub fn suspended_count(&self) -> usize {
        lock(&self.suspended).len()
    }

    pub fn is_suspended(&self, id: ActivationId) -> bool {
        lock(&self.suspended).contains(&id)
    }

    pub fn cached_names(&self) -> usize {
        self.durations.cached_names()
    }

    fn flow(frame: &dyn Frame, category: &str, phase: FlowPhase) -> TraceEvent {
        TraceEvent::flow(
            frame.code().name(),
            category,
            phase,
            frame.id().flow_key(),
            FlowBindingPoint::Enclosing,
        )
    }
}

impl Correlator for Continuations {
    const KIND: &'static str = "AsyncTracer";

    fn correlate(
        &self,
        sink: &dyn TraceSink,
        frame: &dyn Frame,
        event: ActivationEvent,
        payload: Payload<'_>,
    ) {
        let kind = frame.code().flags().continuation_kind();
        let finished = frame.is_finished();

        if let (ActivationEvent::Return, Some(kind)) = (event, kind) {
            if finished {
                lock(&self.suspended).remove(&frame.id());
            } else if self.durations.accepts_end() {
                lock(&self.suspended).insert(frame.id());
                record(sink, Self::flow(frame, kind.as_str(), FlowPhase::Start));
            }
        }

        self.durations.emit(
            sink,
            frame,
            event,
            payload,
            event == ActivationEvent::Return && finished,
        );

        if event == ActivationEvent::Call && lock(&self.suspended).remove(&frame.id()) {
            let category = kind.map(|kind| kind.as_str()).unwrap_or("UNKNOWN");
            record(sink, Self::flow(frame, category, FlowPhase::End));
        }
    }

    fn reset(&self) {
        self.durations.reset();
        lock(&self.suspended).clear();
    }

    fn release(&self, id: ActivationId) {
        self.durations.release(id);
        lock(&self.suspended).remove(&id);
    }
}

/// Observer writing into one trace
pub struct Tracer<C: Correlator> {
    sink: Arc<dyn TraceSink>,
    skip: Predicate,
    trace_threads: bool,
    correlator: C,
    installs: AtomicUsize,
}

/// Tracer emitting duration events
pub type FunctionTracer = Tracer<Durations>;

/// Tracer emitting duration and continuation flow events
pub type AsyncTracer = Tracer<Continuations>;

impl Tracer<Durations> {
    pub fn new(sink: Arc<dyn TraceSink>, config: TracerConfig) -> Arc<Self> {
        let capture_args = config.capture_args.clone();
        Self::with_correlator(sink, Durations::new(capture_args), config)
    }
}

impl Tracer<Continuations> {
    pub fn new(sink: Arc<dyn TraceSink>, config: TracerConfig) -> Arc<Self> {
        let capture_args = config.capture_args.clone();
        Self::with_correlator(sink, Continuations::new(capture_args), config)
    }
}

impl<C: Correlator> Tracer<C> {
    /// Build a tracer around any correlator. The recorder's own sources are
    /// always skipped in addition to `config.skip`.
    pub fn with_correlator(sink: Arc<dyn TraceSink>, correlator: C, config: TracerConfig) -> Arc<Self> {
        let skip = match config.skip {
            Some(user) => Predicate::recorder_internals().or(user),
            None => Predicate::recorder_internals(),
        };
        Arc::new(Self {
            sink,
            skip,
            trace_threads: config.trace_threads,
            correlator,
            installs: AtomicUsize::new(0),
        })
    }

    pub fn correlator(&self) -> &C {
        &self.correlator
    }

    pub fn state(&self) -> TracerState {
        if self.installs.load(Ordering::SeqCst) > 0 {
            TracerState::Active
        } else {
            TracerState::Stopped
        }
    }

    /// Install on the calling thread until the guard is dropped
    pub fn start(self: &Arc<Self>) -> TracerGuard<C> {
        let me: Arc<dyn Observer> = Arc::clone(self) as Arc<dyn Observer>;

        let installation = match observer::current() {
            Some(active) if same_sink(active.sink(), &self.sink) => {
                tracing::debug!(
                    "{} already records into this trace; delegating",
                    active.kind()
                );
                Installation::Delegated
            }
            Some(active) => {
                let warning = InstallWarning::MultipleTracers {
                    active: active.kind(),
                    requested: C::KIND,
                };
                tracing::warn!("{}", warning);
                Installation::Conflicted(warning)
            }
            None => {
                if self.installs.fetch_add(1, Ordering::SeqCst) == 0 {
                    self.correlator.reset();
                    if self.trace_threads {
                        self.claim_default(&me);
                    }
                }
                observer::install(me);
                tracing::debug!("{} started", C::KIND);
                Installation::Installed
            }
        };

        TracerGuard {
            tracer: Arc::clone(self),
            installation,
            _thread_bound: PhantomData,
        }
    }

    /// Become the observer inherited by spawned threads, unless another
    /// tracer already is
    fn claim_default(&self, me: &Arc<dyn Observer>) {
        if let Err(existing) = observer::claim_default(Arc::clone(me)) {
            if same_sink(existing.sink(), &self.sink) {
                tracing::debug!(
                    "{} already traces spawned threads into this trace",
                    existing.kind()
                );
            } else {
                tracing::warn!(
                    "{} already traces spawned threads into another trace; {} will not trace them",
                    existing.kind(),
                    C::KIND
                );
            }
        }
    }

    fn stop(self: &Arc<Self>) {
        let me: Arc<dyn Observer> = Arc::clone(self) as Arc<dyn Observer>;
        if observer::is_installed(&me) {
            observer::uninstall();
        }
        if self.installs.fetch_sub(1, Ordering::SeqCst) == 1 {
            observer::clear_default_if(&me);
            self.correlator.reset();
            tracing::debug!("{} stopped", C::KIND);
        }
    }

    /// Record a thread-scoped instant event
    pub fn mark(&self, name: &str) -> trace::Result<()> {
        self.sink
            .add_event(TraceEvent::instant(name, MARK_CATEGORY, InstantScope::Thread))
    }
}

impl<C: Correlator> Observer for Tracer<C> {
    fn notify(&self, frame: &dyn Frame, event: ActivationEvent, payload: Payload<'_>) {
        if self.installs.load(Ordering::SeqCst) == 0 {
            return;
        }
        if self.skip.matches(frame, event, payload) {
            return;
        }
        self.correlator
            .correlate(self.sink.as_ref(), frame, event, payload);
    }

    fn sink(&self) -> &Arc<dyn TraceSink> {
        &self.sink
    }

    fn kind(&self) -> &'static str {
        C::KIND
    }

    fn release(&self, id: ActivationId) {
        if self.installs.load(Ordering::SeqCst) > 0 {
            self.correlator.release(id);
        }
    }
}

impl<C: Correlator + std::fmt::Debug> std::fmt::Debug for Tracer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("kind", &C::KIND)
            .field("state", &self.state())
            .field("trace_threads", &self.trace_threads)
            .field("correlator", &self.correlator)
            .finish()
    }
}

/// Scoped installation; dropping it uninstalls
///
/// Bound to the thread that created it.
#[must_use = "the tracer stops when the guard is dropped"]
pub struct TracerGuard<C: Correlator> {
    tracer: Arc<Tracer<C>>,
    installation: Installation,
    _thread_bound: PhantomData<*const ()>,
}

impl<C: Correlator> TracerGuard<C> {
    pub fn installation(&self) -> &Installation {
        &self.installation
    }

    /// The conflict warning, if this start was refused
    pub fn warning(&self) -> Option<&InstallWarning> {
        match &self.installation {
            Installation::Conflicted(warning) => Some(warning),
            _ => None,
        }
    }

    pub fn tracer(&self) -> &Arc<Tracer<C>> {
        &self.tracer
    }

    /// Stop now instead of at end of scope
    pub fn stop(self) {}
}

impl<C: Correlator> Drop for TracerGuard<C> {
    fn drop(&mut self) {
        if self.installation == Installation::Installed {
            self.tracer.stop();
        }
    }
}

/// Stream a continuation-aware trace of the calling thread into `path`
pub fn record_trace(path: impl AsRef<Path>) -> trace::Result<TracerGuard<Continuations>> {
    record_trace_with(path, TracerConfig::default())
}

pub fn record_trace_with(
    path: impl AsRef<Path>,
    config: TracerConfig,
) -> trace::Result<TracerGuard<Continuations>> {
    let file = File::create(path)?;
    let sink: Arc<dyn TraceSink> = Arc::new(StreamingTrace::new(file)?);
    Ok(AsyncTracer::new(sink, config).start())
}
