use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use anyhow::{anyhow, Result};

const HEALTHY: u8 = 0;
const FAILED: u8 = 1;
const CLOSED_OK: u8 = 2;
const CLOSED_FAILED: u8 = 3;

/// Lifecycle state shared by every stream and codec object.
///
/// An object is *open-healthy*, *open-failed* (with a sticky message), or
/// *closed* (successfully or after a failure). Transitions are monotonic:
/// once failed, an object never becomes healthy again; once closed it stays
/// closed. The discriminant is a single atomic byte and the failure message
/// is set at most once, so another thread may observe `healthy()` and
/// `message()` of an in-flight object without locking. All mutation happens
/// on the owning thread.
#[derive(Debug, Default)]
pub struct ObjectState {
    status: AtomicU8,
    message: OnceLock<String>,
}

impl ObjectState {
    /// A fresh open-healthy state.
    pub fn open() -> Self {
        ObjectState {
            status: AtomicU8::new(HEALTHY),
            message: OnceLock::new(),
        }
    }

    /// A state that starts out closed (for objects that are inert until the
    /// first `reset`).
    pub fn new_closed() -> Self {
        ObjectState {
            status: AtomicU8::new(CLOSED_OK),
            message: OnceLock::new(),
        }
    }

    pub fn healthy(&self) -> bool {
        self.status.load(Ordering::Acquire) == HEALTHY
    }

    pub fn closed(&self) -> bool {
        matches!(
            self.status.load(Ordering::Acquire),
            CLOSED_OK | CLOSED_FAILED
        )
    }

    /// The retained failure message, or `None` while healthy / after a clean
    /// close.
    pub fn message(&self) -> Option<&str> {
        match self.status.load(Ordering::Acquire) {
            FAILED | CLOSED_FAILED => self.message.get().map(|s| s.as_str()),
            _ => None,
        }
    }

    /// Records the first failure and returns an error carrying the same
    /// message. A second failure keeps the first message.
    pub fn fail<T>(&self, message: impl Into<String>) -> Result<T> {
        let message = message.into();
        debug_assert!(!self.closed(), "fail() on a closed object");
        let _ = self.message.set(message.clone());
        let _ = self.status.compare_exchange(
            HEALTHY,
            FAILED,
            Ordering::Release,
            Ordering::Relaxed,
        );
        Err(anyhow!(message))
    }

    /// Adopts a step's error as this object's failure, passing successes
    /// through unchanged.
    pub fn track<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => self.fail(e.to_string()),
        }
    }

    /// Short-circuit guard run at the top of every operation.
    pub fn check_healthy(&self) -> Result<()> {
        match self.status.load(Ordering::Acquire) {
            HEALTHY => Ok(()),
            FAILED | CLOSED_FAILED => Err(anyhow!(
                "{}",
                self.message.get().map(|s| s.as_str()).unwrap_or("failed")
            )),
            _ => Err(anyhow!("object is closed")),
        }
    }

    /// Transitions to the closed state, preserving a failure if one was
    /// recorded. Returns true iff the object closed cleanly.
    pub fn mark_closed(&self) -> bool {
        let _ = self.status.compare_exchange(
            HEALTHY,
            CLOSED_OK,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        let _ = self.status.compare_exchange(
            FAILED,
            CLOSED_FAILED,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        self.status.load(Ordering::Acquire) == CLOSED_OK
    }

    /// Returns the object to open-healthy, clearing any retained message.
    pub fn reset(&mut self) {
        *self = ObjectState::open();
    }
}

/// Close discipline shared by streams and codecs: `close` runs the object's
/// `done` cleanup exactly once, even if the object already failed, and is
/// idempotent afterwards.
pub trait Object {
    fn state(&self) -> &ObjectState;

    /// One-shot cleanup hook invoked by `close`. May record a failure via
    /// `state().fail(..)`.
    fn done(&mut self);

    fn healthy(&self) -> bool {
        self.state().healthy()
    }

    fn closed(&self) -> bool {
        self.state().closed()
    }

    fn message(&self) -> Option<&str> {
        self.state().message()
    }

    /// Closes the object. Runs `done` on the first call whether the object is
    /// healthy or failed; later calls return the same boolean without side
    /// effects.
    fn close(&mut self) -> bool {
        if self.state().closed() {
            return self.state().message().is_none();
        }
        self.done();
        self.state().mark_closed()
    }
}
