//! What a host runtime reports about each activation
//!
//! The recorder never inspects a running program directly. A host adapter
//! hands it a [`Frame`] for every call/return boundary, together with an
//! [`ActivationEvent`] and a [`Payload`]. This module defines those shapes.

use std::fmt;
use std::ops::BitOr;
use thiserror::Error;

const SLOT_MASK: u64 = (1 << 48) - 1;

/// Identity of one live activation
///
/// Hosts recycle slots once an activation is destroyed, so the identity is
/// the slot plus a generation counter that changes on every reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivationId {
    slot: u64,
    generation: u32,
}

impl ActivationId {
    pub const fn new(slot: u64, generation: u32) -> Self {
        Self { slot, generation }
    }

    pub fn slot(&self) -> u64 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Numeric key used as the flow event `id`
    pub fn flow_key(&self) -> u64 {
        (u64::from(self.generation) << 48) | (self.slot & SLOT_MASK)
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

/// Kind of suspendable unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContinuationKind {
    Generator,
    AsyncGenerator,
    Coroutine,
    IterableCoroutine,
}

impl ContinuationKind {
    /// Category used for flow events
    pub fn as_str(&self) -> &'static str {
        match self {
            ContinuationKind::Generator => "GENERATOR",
            ContinuationKind::AsyncGenerator => "ASYNC_GENERATOR",
            ContinuationKind::Coroutine => "COROUTINE",
            ContinuationKind::IterableCoroutine => "ITERABLE_COROUTINE",
        }
    }
}

impl fmt::Display for ContinuationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compile-time flags of a code unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CodeFlags(u32);

impl CodeFlags {
    pub const NONE: CodeFlags = CodeFlags(0);
    pub const GENERATOR: CodeFlags = CodeFlags(0x0020);
    pub const COROUTINE: CodeFlags = CodeFlags(0x0080);
    pub const ITERABLE_COROUTINE: CodeFlags = CodeFlags(0x0100);
    pub const ASYNC_GENERATOR: CodeFlags = CodeFlags(0x0200);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: CodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// First matching entry of the classification table, if any
    pub fn continuation_kind(&self) -> Option<ContinuationKind> {
        CONTINUATION_KINDS
            .iter()
            .find(|(flag, _)| self.0 & flag.0 != 0)
            .map(|(_, kind)| *kind)
    }

    pub fn is_continuation(&self) -> bool {
        self.continuation_kind().is_some()
    }
}

impl BitOr for CodeFlags {
    type Output = CodeFlags;

    fn bitor(self, rhs: CodeFlags) -> CodeFlags {
        CodeFlags(self.0 | rhs.0)
    }
}

const CONTINUATION_KINDS: [(CodeFlags, ContinuationKind); 4] = [
    (CodeFlags::GENERATOR, ContinuationKind::Generator),
    (CodeFlags::ASYNC_GENERATOR, ContinuationKind::AsyncGenerator),
    (CodeFlags::COROUTINE, ContinuationKind::Coroutine),
    (CodeFlags::ITERABLE_COROUTINE, ContinuationKind::IterableCoroutine),
];

/// Static description of a callable unit
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodeUnit {
    path: String,
    first_line: u32,
    name: String,
    flags: CodeFlags,
}

impl CodeUnit {
    pub fn new(path: impl Into<String>, first_line: u32, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            first_line,
            name: name.into(),
            flags: CodeFlags::NONE,
        }
    }

    pub fn with_flags(mut self, flags: CodeFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Path of the defining unit
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    /// Short name of the callable
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> CodeFlags {
        self.flags
    }

    /// `path:first_line`
    pub fn category(&self) -> String {
        format!("{}:{}", self.path, self.first_line)
    }
}

/// Boundary kinds reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationEvent {
    Call,
    Return,
    NativeCall,
    NativeReturn,
    NativeException,
}

impl ActivationEvent {
    pub fn is_call_like(&self) -> bool {
        matches!(self, ActivationEvent::Call | ActivationEvent::NativeCall)
    }

    pub fn is_return_like(&self) -> bool {
        matches!(self, ActivationEvent::Return | ActivationEvent::NativeReturn)
    }

    pub fn is_native(&self) -> bool {
        matches!(
            self,
            ActivationEvent::NativeCall
                | ActivationEvent::NativeReturn
                | ActivationEvent::NativeException
        )
    }
}

/// Why a value could not be turned into text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("value has no textual representation")]
    Unrepresentable,

    #[error("conversion panicked")]
    Panicked,

    #[error("{0}")]
    Failed(String),
}

/// A host value the recorder may capture as an argument or return value
///
/// `repr` is the preferred debugging form, `display` the fallback. Either
/// may fail; the recorder falls back to a placeholder.
pub trait TraceValue {
    fn repr(&self) -> Result<String, ValueError>;

    fn display(&self) -> Result<String, ValueError> {
        Err(ValueError::Unrepresentable)
    }
}

macro_rules! impl_trace_value_to_string {
    ($($ty:ty),* $(,)?) => {
        $(
            impl TraceValue for $ty {
                fn repr(&self) -> Result<String, ValueError> {
                    Ok(self.to_string())
                }
            }
        )*
    };
}

impl_trace_value_to_string!(
    i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, bool, char,
);

impl TraceValue for str {
    fn repr(&self) -> Result<String, ValueError> {
        Ok(format!("{:?}", self))
    }

    fn display(&self) -> Result<String, ValueError> {
        Ok(self.to_string())
    }
}

impl TraceValue for String {
    fn repr(&self) -> Result<String, ValueError> {
        self.as_str().repr()
    }

    fn display(&self) -> Result<String, ValueError> {
        Ok(self.clone())
    }
}

impl TraceValue for () {
    fn repr(&self) -> Result<String, ValueError> {
        Ok("()".to_string())
    }
}

impl<T: TraceValue + ?Sized> TraceValue for &T {
    fn repr(&self) -> Result<String, ValueError> {
        (**self).repr()
    }

    fn display(&self) -> Result<String, ValueError> {
        (**self).display()
    }
}

impl<T: TraceValue + ?Sized> TraceValue for Box<T> {
    fn repr(&self) -> Result<String, ValueError> {
        (**self).repr()
    }

    fn display(&self) -> Result<String, ValueError> {
        (**self).display()
    }
}

impl<T: TraceValue> TraceValue for Option<T> {
    fn repr(&self) -> Result<String, ValueError> {
        match self {
            Some(value) => Ok(format!("Some({})", value.repr()?)),
            None => Ok("None".to_string()),
        }
    }
}

impl<T: TraceValue> TraceValue for Vec<T> {
    fn repr(&self) -> Result<String, ValueError> {
        let items = self
            .iter()
            .map(|item| item.repr())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!("[{}]", items.join(", ")))
    }
}

/// Capture any `Debug` value through its `{:?}` form
#[derive(Debug, Clone, PartialEq)]
pub struct Debugged<T>(pub T);

impl<T: fmt::Debug> TraceValue for Debugged<T> {
    fn repr(&self) -> Result<String, ValueError> {
        let mut out = String::new();
        fmt::write(&mut out, format_args!("{:?}", self.0))
            .map_err(|_| ValueError::Unrepresentable)?;
        Ok(out)
    }
}

/// The first bound local of an activation, as far as class naming cares
pub trait Receiver {
    /// Runtime type name of the value
    fn type_name(&self) -> Option<String>;

    /// Whether the value exposes a callable attribute called `name`
    fn has_callable(&self, name: &str) -> bool;
}

/// Extra data attached to a notification
#[derive(Clone, Copy)]
pub enum Payload<'a> {
    None,
    /// Value being returned (return events)
    Value(&'a dyn TraceValue),
    /// Textual identity of the native callable (native events)
    Native(&'a str),
}

impl<'a> Payload<'a> {
    pub fn value(&self) -> Option<&'a dyn TraceValue> {
        match self {
            Payload::Value(value) => Some(*value),
            _ => None,
        }
    }

    pub fn native_name(&self) -> Option<&'a str> {
        match self {
            Payload::Native(name) => Some(*name),
            _ => None,
        }
    }
}

impl fmt::Debug for Payload<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::None => f.write_str("None"),
            Payload::Value(_) => f.write_str("Value(..)"),
            Payload::Native(name) => f.debug_tuple("Native").field(name).finish(),
        }
    }
}

/// One activation as seen at a notification
pub trait Frame {
    /// Stable for the activation's lifetime, possibly reused afterwards
    fn id(&self) -> ActivationId;

    fn code(&self) -> &CodeUnit;

    /// Bound parameters, in declaration order
    fn locals(&self) -> Vec<(&str, &dyn TraceValue)>;

    /// First bound local, used to guess an owning type
    fn receiver(&self) -> Option<&dyn Receiver> {
        None
    }

    /// For continuations: whether this return is the final one rather than
    /// a suspension. Ordinary activations always finish when they return.
    fn is_finished(&self) -> bool {
        true
    }
}
