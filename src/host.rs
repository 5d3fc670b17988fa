//! Reference host adapter
//!
//! Drives the observer slot by hand: allocates activation identities,
//! owns the bound locals of each activation and reports call, return,
//! suspension and native boundaries through [`crate::observer::dispatch`].
//! Tests, benchmarks and embedders without a runtime of their own use it to
//! produce notification streams.
//!
//! # Example
//! ```
//! use panopticon::frame::CodeUnit;
//! use panopticon::host::Host;
//! use std::sync::Arc;
//!
//! let host = Host::new();
//! let code = Arc::new(CodeUnit::new("demo/math.py", 1, "mul"));
//! let record = host.activate(&code).with_local("x", 2_i64).with_local("y", 3_i64);
//! let product = host.invoke(record, |_| 6_i64);
//! assert_eq!(product, 6);
//! assert_eq!(host.live(), 0);
//! ```

use crate::frame::{ActivationEvent, ActivationId, CodeUnit, Frame, Payload, Receiver, TraceValue};
use crate::observer;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Type description usable as an activation's receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    name: String,
    callables: Vec<String>,
}

impl TypeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            callables: Vec::new(),
        }
    }

    pub fn with_callable(mut self, name: impl Into<String>) -> Self {
        self.callables.push(name.into());
        self
    }
}

impl Receiver for TypeInfo {
    fn type_name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn has_callable(&self, name: &str) -> bool {
        self.callables.iter().any(|callable| callable == name)
    }
}

/// One activation owned by the host
pub struct ActivationRecord {
    id: ActivationId,
    code: Arc<CodeUnit>,
    locals: Vec<(String, Box<dyn TraceValue>)>,
    receiver: Option<Box<dyn Receiver>>,
    finished: bool,
}

impl ActivationRecord {
    pub fn new(id: ActivationId, code: Arc<CodeUnit>) -> Self {
        Self {
            id,
            code,
            locals: Vec::new(),
            receiver: None,
            finished: false,
        }
    }

    /// Bind a parameter
    pub fn with_local(mut self, name: impl Into<String>, value: impl TraceValue + 'static) -> Self {
        self.locals.push((name.into(), Box::new(value)));
        self
    }

    /// Set the first bound local's type, for class naming
    pub fn with_receiver(mut self, receiver: impl Receiver + 'static) -> Self {
        self.receiver = Some(Box::new(receiver));
        self
    }

    pub fn set_finished(&mut self, finished: bool) {
        self.finished = finished;
    }
}

impl Frame for ActivationRecord {
    fn id(&self) -> ActivationId {
        self.id
    }

    fn code(&self) -> &CodeUnit {
        &self.code
    }

    fn locals(&self) -> Vec<(&str, &dyn TraceValue)> {
        self.locals
            .iter()
            .map(|(name, value)| (name.as_str(), &**value))
            .collect()
    }

    fn receiver(&self) -> Option<&dyn Receiver> {
        self.receiver.as_deref()
    }

    fn is_finished(&self) -> bool {
        !self.code.flags().is_continuation() || self.finished
    }
}

impl fmt::Debug for ActivationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationRecord")
            .field("id", &self.id)
            .field("code", &self.code)
            .field("locals", &self.locals.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .field("finished", &self.finished)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    generation: u32,
    live: bool,
}

/// Slot allocator handing out generation-tagged identities
#[derive(Debug, Default)]
pub struct ActivationTable {
    slots: Vec<Slot>,
    free: Vec<u64>,
}

impl ActivationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse the most recently freed slot, or grow
    pub fn allocate(&mut self) -> ActivationId {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u64
            }
        };
        let entry = &mut self.slots[slot as usize];
        entry.live = true;
        ActivationId::new(slot, entry.generation)
    }

    /// Free `id`'s slot; the next occupant gets a new generation
    pub fn release(&mut self, id: ActivationId) -> bool {
        if !self.is_live(id) {
            return false;
        }
        let entry = &mut self.slots[id.slot() as usize];
        entry.live = false;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.slot());
        true
    }

    pub fn is_live(&self, id: ActivationId) -> bool {
        self.slots
            .get(id.slot() as usize)
            .is_some_and(|entry| entry.live && entry.generation == id.generation())
    }

    /// Number of live activations
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// Notification driver
#[derive(Debug, Default)]
pub struct Host {
    table: Mutex<ActivationTable>,
}

impl Host {
    pub fn new() -> Self {
        Self::default()
    }

    /// New activation of `code` with a fresh identity
    pub fn activate(&self, code: &Arc<CodeUnit>) -> ActivationRecord {
        let id = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocate();
        ActivationRecord::new(id, Arc::clone(code))
    }

    /// Report entry (first call or resumption)
    pub fn call(&self, record: &ActivationRecord) {
        observer::dispatch(record, ActivationEvent::Call, Payload::None);
    }

    /// Report a suspension of a continuation yielding `value`
    pub fn suspend(&self, record: &mut ActivationRecord, value: Option<&dyn TraceValue>) {
        record.set_finished(false);
        observer::dispatch(record, ActivationEvent::Return, payload(value));
    }

    /// Report the final return and free the identity
    pub fn finish(&self, mut record: ActivationRecord, value: Option<&dyn TraceValue>) {
        record.set_finished(true);
        observer::dispatch(&record, ActivationEvent::Return, payload(value));
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(record.id());
    }

    /// Destroy an activation without a final return, as happens to a
    /// suspended continuation that is dropped before it finishes. The
    /// observer is told to forget the identity; no events are reported.
    pub fn discard(&self, record: ActivationRecord) {
        observer::release(record.id());
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(record.id());
    }

    /// Report a native callable invoked from `caller`
    pub fn native(&self, caller: &ActivationRecord, descriptor: &str) {
        observer::dispatch(caller, ActivationEvent::NativeCall, Payload::Native(descriptor));
        observer::dispatch(caller, ActivationEvent::NativeReturn, Payload::Native(descriptor));
    }

    /// Report a native callable that raised instead of returning
    pub fn native_exception(&self, caller: &ActivationRecord, descriptor: &str) {
        observer::dispatch(caller, ActivationEvent::NativeCall, Payload::Native(descriptor));
        observer::dispatch(
            caller,
            ActivationEvent::NativeException,
            Payload::Native(descriptor),
        );
    }

    /// Run `body` as one complete ordinary activation
    pub fn invoke<T, F>(&self, record: ActivationRecord, body: F) -> T
    where
        T: TraceValue,
        F: FnOnce(&ActivationRecord) -> T,
    {
        self.call(&record);
        let value = body(&record);
        self.finish(record, Some(&value as &dyn TraceValue));
        value
    }

    /// Number of live activations
    pub fn live(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live()
    }
}

fn payload(value: Option<&dyn TraceValue>) -> Payload<'_> {
    match value {
        Some(value) => Payload::Value(value),
        None => Payload::None,
    }
}
