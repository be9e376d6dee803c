//! Deferred destruction of the objects of dropped session keys.
//!
//! Dropping a key never calls the token: the key posts its object to the reaper, which destroys
//! it later from a regular thread with a session of its own.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    thread,
    time::Duration,
};

use tokenbridge_interfaces::{ObjectHandle, SessionHandle};
use tracing::{debug, trace, warn};

use crate::{
    HError,
    error::result::{HResult, HResultHelper},
    hsm_call,
    key::TokenKey,
    session::Session,
    token::Token,
};

const REAPER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The object of a dropped session key, with the session owning it
pub(crate) struct Disposal {
    pub(crate) handle: ObjectHandle,
    pub(crate) owner: Arc<Session>,
}

impl Disposal {
    fn id(&self) -> (ObjectHandle, SessionHandle) {
        (self.handle, self.owner.handle())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub(crate) struct KeyReaper {
    sender: Sender<Disposal>,
    receiver: Arc<Mutex<Receiver<Disposal>>>,
    registry: Mutex<BTreeMap<(ObjectHandle, SessionHandle), Weak<TokenKey>>>,
    /// Disposals waiting for a session
    deferred: Mutex<Vec<Disposal>>,
}

impl KeyReaper {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            registry: Mutex::new(BTreeMap::new()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn sender(&self) -> Sender<Disposal> {
        self.sender.clone()
    }

    /// Track a session key until its object is destroyed
    pub(crate) fn register(&self, key: &Arc<TokenKey>) {
        if let Some(owner) = key.owner() {
            lock(&self.registry).insert((key.handle(), owner.handle()), Arc::downgrade(key));
        }
    }

    /// Number of session keys whose object is not destroyed yet
    pub(crate) fn registered(&self) -> usize {
        lock(&self.registry).len()
    }

    fn unregister(&self, disposals: &[Disposal]) {
        let mut registry = lock(&self.registry);
        for disposal in disposals {
            registry.remove(&disposal.id());
        }
    }

    fn defer(&self, disposals: impl IntoIterator<Item = Disposal>) {
        lock(&self.deferred).extend(disposals);
    }

    /// Collect the pending disposals, unless the reaper thread is receiving them
    fn pending(&self) -> Vec<Disposal> {
        let mut pending = std::mem::take(&mut *lock(&self.deferred));
        if let Ok(receiver) = self.receiver.try_lock() {
            pending.extend(receiver.try_iter());
        }
        pending
    }

    /// Destroy the objects of the dropped keys of `token`. Returns the number of objects
    /// destroyed.
    ///
    /// Disposals are deferred while no session is available. Once the token is invalid the
    /// objects are gone with it and the disposals are discarded.
    pub(crate) fn drain(&self, token: &Arc<Token>) -> usize {
        let pending = self.pending();
        if pending.is_empty() {
            return 0;
        }
        if !token.is_valid() {
            debug!(
                "{}: discarding {} disposals of an invalid token",
                token.name(),
                pending.len()
            );
            self.unregister(&pending);
            return 0;
        }
        let mut destroyed = 0;
        let mut pending = pending.into_iter();
        while let Some(disposal) = pending.next() {
            let session = match token.acquire_operation_session() {
                Ok(session) => session,
                Err(HError::ResourceExhausted(e)) => {
                    trace!("{}: deferring disposals: {e}", token.name());
                    self.defer(std::iter::once(disposal).chain(pending));
                    break;
                }
                Err(e) => {
                    debug!("{}: discarding disposals: {e}", token.name());
                    let discarded: Vec<Disposal> = std::iter::once(disposal).chain(pending).collect();
                    self.unregister(&discarded);
                    break;
                }
            };
            match hsm_call!(
                token,
                "destroying a key",
                destroy_object,
                session.handle(),
                disposal.handle
            ) {
                Ok(()) => destroyed += 1,
                Err(e) => warn!("{}: failed destroying object {}: {e}", token.name(), disposal.handle),
            }
            drop(session);
            self.unregister(std::slice::from_ref(&disposal));
            token.session_manager().remove_object(&disposal.owner);
        }
        if destroyed > 0 {
            debug!("{}: destroyed {destroyed} key objects", token.name());
        }
        destroyed
    }

    /// Start a thread draining the disposals as they arrive.
    ///
    /// The thread stops once the token is dropped.
    pub(crate) fn spawn(&self, token: &Arc<Token>) -> HResult<()> {
        let receiver = self.receiver.clone();
        let weak = Arc::downgrade(token);
        thread::Builder::new()
            .name(format!("{}-key-reaper", token.name()))
            .spawn(move || {
                loop {
                    let next = lock(&receiver).recv_timeout(REAPER_POLL_INTERVAL);
                    let Some(token) = weak.upgrade() else {
                        break;
                    };
                    match next {
                        Ok(disposal) => token.key_reaper().defer(std::iter::once(disposal)),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    token.drain_disposed_keys();
                }
                trace!("key reaper stopped");
            })
            .context("failed spawning the key reaper")?;
        Ok(())
    }
}
