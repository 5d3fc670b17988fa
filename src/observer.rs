//! Per-thread activation observer slot
//!
//! A host adapter reports every call/return boundary through [`dispatch`],
//! which forwards it synchronously to the observer installed on the calling
//! thread, if any. Installation is strictly thread-local; the only way an
//! observer reaches another thread is the process-wide default, picked up by
//! threads started with [`spawn`].
//!
//! Notifications raised while an observer is already running on the same
//! thread (for instance by values whose conversion calls back into traced
//! code) are dropped rather than re-entering the observer.

use crate::frame::{ActivationEvent, ActivationId, Frame, Payload};
use crate::trace::TraceSink;
use std::cell::{Cell, RefCell};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;

/// Receiver of activation notifications
pub trait Observer: Send + Sync {
    fn notify(&self, frame: &dyn Frame, event: ActivationEvent, payload: Payload<'_>);

    /// Trace this observer writes into
    fn sink(&self) -> &Arc<dyn TraceSink>;

    /// Short name of the observer flavour, used in diagnostics
    fn kind(&self) -> &'static str;

    /// `id` was destroyed without a final return; forget anything kept for it
    fn release(&self, _id: ActivationId) {}
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<dyn Observer>>> = const { RefCell::new(None) };
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

static DEFAULT: RwLock<Option<Arc<dyn Observer>>> = RwLock::new(None);

fn same_observer(a: &Arc<dyn Observer>, b: &Arc<dyn Observer>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Observer installed on the calling thread
pub fn current() -> Option<Arc<dyn Observer>> {
    CURRENT
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten()
}

/// Install `observer` on the calling thread, returning the one it replaces
pub fn install(observer: Arc<dyn Observer>) -> Option<Arc<dyn Observer>> {
    CURRENT
        .try_with(|slot| slot.borrow_mut().replace(observer))
        .ok()
        .flatten()
}

/// Remove whatever observer the calling thread has
pub fn uninstall() -> Option<Arc<dyn Observer>> {
    CURRENT
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten()
}

/// Whether `observer` is the one installed on the calling thread
pub fn is_installed(observer: &Arc<dyn Observer>) -> bool {
    CURRENT
        .try_with(|slot| {
            slot.borrow()
                .as_ref()
                .is_some_and(|current| same_observer(current, observer))
        })
        .unwrap_or(false)
}

/// Observer inherited by threads started through [`spawn`]
pub fn default_observer() -> Option<Arc<dyn Observer>> {
    DEFAULT
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

pub fn set_default(observer: Option<Arc<dyn Observer>>) {
    *DEFAULT.write().unwrap_or_else(PoisonError::into_inner) = observer;
}

/// Make `observer` the default unless one is already set.
///
/// Returns the existing default when the claim is refused.
pub fn claim_default(observer: Arc<dyn Observer>) -> Result<(), Arc<dyn Observer>> {
    let mut default = DEFAULT.write().unwrap_or_else(PoisonError::into_inner);
    match default.as_ref() {
        Some(existing) if !same_observer(existing, &observer) => Err(Arc::clone(existing)),
        _ => {
            *default = Some(observer);
            Ok(())
        }
    }
}

/// Clear the default observer only if it is `observer`
pub fn clear_default_if(observer: &Arc<dyn Observer>) -> bool {
    let mut default = DEFAULT.write().unwrap_or_else(PoisonError::into_inner);
    if default
        .as_ref()
        .is_some_and(|current| same_observer(current, observer))
    {
        *default = None;
        return true;
    }
    false
}

struct DispatchGuard;

impl DispatchGuard {
    fn enter() -> Option<Self> {
        let entered = DISPATCHING
            .try_with(|flag| !flag.replace(true))
            .unwrap_or(false);
        entered.then_some(DispatchGuard)
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        let _ = DISPATCHING.try_with(|flag| flag.set(false));
    }
}

/// Forward one notification to the calling thread's observer
pub fn dispatch(frame: &dyn Frame, event: ActivationEvent, payload: Payload<'_>) {
    let Some(observer) = current() else {
        return;
    };
    let Some(_guard) = DispatchGuard::enter() else {
        return;
    };
    observer.notify(frame, event, payload);
}

/// Tell the calling thread's observer that `id` is gone.
///
/// Unlike [`dispatch`] this is delivered even from inside a notification.
pub fn release(id: ActivationId) {
    if let Some(observer) = current() {
        observer.release(id);
    }
}

/// Start a thread that begins with the current default observer installed
pub fn spawn<F, T>(f: F) -> thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let inherited = default_observer();
    thread::spawn(move || {
        if let Some(observer) = inherited.clone() {
            install(observer);
        }
        let result = f();
        if let Some(observer) = inherited {
            if is_installed(&observer) {
                uninstall();
            }
        }
        result
    })
}
