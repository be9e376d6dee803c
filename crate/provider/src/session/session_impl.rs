use std::{
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use tokenbridge_interfaces::SessionHandle;

/// A session opened on the token.
///
/// The session keeps track of the number of session objects created through it: a session
/// owning objects must stay open as long as the objects may be used, since closing it destroys
/// them. The count is only updated by the session manager, under its lock.
#[derive(Debug)]
pub struct Session {
    handle: SessionHandle,
    objects: AtomicUsize,
    last_access: Mutex<Instant>,
}

impl Session {
    pub(crate) fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            objects: AtomicUsize::new(0),
            last_access: Mutex::new(Instant::now()),
        }
    }

    #[must_use]
    pub const fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Number of live session objects created through this session
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn has_objects(&self) -> bool {
        self.object_count() > 0
    }

    pub(crate) fn add_object(&self) {
        self.objects.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the number of objects left
    pub(crate) fn remove_object(&self) -> usize {
        let previous = self
            .objects
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or_default();
        previous.saturating_sub(1)
    }

    fn lock_last_access(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.last_access
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn touch(&self) {
        *self.lock_last_access() = Instant::now();
    }

    pub(crate) fn last_access(&self) -> Instant {
        *self.lock_last_access()
    }

    pub(crate) fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access())
    }
}
