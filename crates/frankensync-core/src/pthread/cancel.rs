//! Deferred thread cancellation.
//!
//! A canceled thread unwinds from its next cancellation point as an ordinary
//! Rust unwind whose payload is [`ThreadCanceled`]. Lock and queue state is
//! restored by drop guards along the way, and [`cleanup_push`] registers
//! user handlers that run during that unwind. [`catch_cancel`] stops the
//! unwind at a thread boundary.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;

use super::thread::{
    self, CANCELSTATE_BITMASK, CANCELTYPE_BITMASK, EXITING_BITMASK, ThreadState,
    cancel_enabled_and_canceled,
};
use crate::trace::{self, SyncFamily};

/// Unwind payload of a canceled thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadCanceled;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Enable,
    Disable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelType {
    Deferred,
    /// Accepted for compatibility; still acted on at cancellation points only.
    Asynchronous,
}

pub(crate) fn testcancel_on(state: &ThreadState) {
    let word = state.cancel_word();
    let v = word.load(Ordering::SeqCst);
    if !cancel_enabled_and_canceled(v) {
        return;
    }
    word.fetch_or(EXITING_BITMASK, Ordering::SeqCst);
    trace::record(SyncFamily::Cancel, "unwind", state.tid() as usize, "canceled");
    panic::resume_unwind(Box::new(ThreadCanceled));
}

/// Cancellation point: unwind now if cancellation is pending and enabled.
pub fn testcancel() {
    testcancel_on(&thread::current());
}

/// Set the calling thread's cancel state; returns the previous one.
pub fn set_cancel_state(new: CancelState) -> CancelState {
    let me = thread::current();
    let word = me.cancel_word();
    let old = match new {
        CancelState::Disable => word.fetch_or(CANCELSTATE_BITMASK, Ordering::SeqCst),
        CancelState::Enable => word.fetch_and(!CANCELSTATE_BITMASK, Ordering::SeqCst),
    };
    if old & CANCELSTATE_BITMASK != 0 {
        CancelState::Disable
    } else {
        CancelState::Enable
    }
}

/// Set the calling thread's cancel type; returns the previous one.
pub fn set_cancel_type(new: CancelType) -> CancelType {
    let me = thread::current();
    let word = me.cancel_word();
    let old = match new {
        CancelType::Asynchronous => word.fetch_or(CANCELTYPE_BITMASK, Ordering::SeqCst),
        CancelType::Deferred => word.fetch_and(!CANCELTYPE_BITMASK, Ordering::SeqCst),
    };
    if old & CANCELTYPE_BITMASK != 0 {
        CancelType::Asynchronous
    } else {
        CancelType::Deferred
    }
}

/// Scoped cleanup handler. Runs on drop (including during an unwind) unless
/// popped first.
#[must_use = "dropping the guard runs the handler immediately"]
pub struct CleanupGuard<F: FnOnce()> {
    handler: Option<F>,
}

/// Register `handler` to run if the scope is left without [`CleanupGuard::pop`].
pub fn cleanup_push<F: FnOnce()>(handler: F) -> CleanupGuard<F> {
    CleanupGuard {
        handler: Some(handler),
    }
}

impl<F: FnOnce()> CleanupGuard<F> {
    /// Remove the handler, running it first when `execute` is true.
    pub fn pop(mut self, execute: bool) {
        let handler = self.handler.take();
        if execute {
            if let Some(handler) = handler {
                handler();
            }
        }
    }
}

impl<F: FnOnce()> Drop for CleanupGuard<F> {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler();
        }
    }
}

/// Whether an unwind payload is a cancellation.
pub fn is_cancellation(payload: &(dyn Any + Send)) -> bool {
    payload.is::<ThreadCanceled>()
}

/// Run `f`, turning a cancellation unwind into `Err(ThreadCanceled)`.
/// Other panics keep unwinding.
pub fn catch_cancel<F, R>(f: F) -> Result<R, ThreadCanceled>
where
    F: FnOnce() -> R,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => Ok(v),
        Err(payload) if is_cancellation(payload.as_ref()) => Err(ThreadCanceled),
        Err(payload) => panic::resume_unwind(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn testcancel_without_request_is_noop() {
        assert_eq!(catch_cancel(testcancel), Ok(()));
    }

    #[test]
    fn self_cancel_unwinds_at_next_point() {
        let r = std::thread::spawn(|| {
            catch_cancel(|| {
                thread::current().cancel();
                testcancel();
                unreachable!("cancellation point returned");
            })
        })
        .join()
        .unwrap();
        assert_eq!(r, Err(ThreadCanceled));
    }

    #[test]
    fn disabled_cancellation_stays_pending() {
        let r = std::thread::spawn(|| {
            catch_cancel(|| {
                assert_eq!(set_cancel_state(CancelState::Disable), CancelState::Enable);
                thread::current().cancel();
                testcancel();
                assert_eq!(set_cancel_state(CancelState::Enable), CancelState::Disable);
                testcancel();
                1
            })
        })
        .join()
        .unwrap();
        assert_eq!(r, Err(ThreadCanceled));
    }

    #[test]
    fn cancel_type_round_trips() {
        std::thread::spawn(|| {
            assert_eq!(set_cancel_type(CancelType::Asynchronous), CancelType::Deferred);
            assert_eq!(set_cancel_type(CancelType::Deferred), CancelType::Asynchronous);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn cleanup_handlers_run_on_unwind_and_on_pop() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let r = std::thread::spawn(move || {
            catch_cancel(|| {
                let h2 = Arc::clone(&h);
                let _guard = cleanup_push(move || {
                    h2.fetch_add(1, Ordering::SeqCst);
                });
                thread::current().cancel();
                testcancel();
            })
        })
        .join()
        .unwrap();
        assert_eq!(r, Err(ThreadCanceled));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = Arc::clone(&hits);
        cleanup_push(move || {
            h.fetch_add(10, Ordering::SeqCst);
        })
        .pop(false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let h = Arc::clone(&hits);
        cleanup_push(move || {
            h.fetch_add(10, Ordering::SeqCst);
        })
        .pop(true);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn catch_cancel_does_not_swallow_panics() {
        let r = std::panic::catch_unwind(|| catch_cancel(|| panic!("boom")));
        assert!(r.is_err());
    }
}
