//! Pools of sessions.
//!
//! Sessions are expensive and limited: they are opened on demand up to a maximum and kept in
//! two pools once released. The object pool holds the sessions owning session objects, which
//! must not be closed while the objects are in use. The operation pool holds the sessions that
//! can be recycled or closed freely.

use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use tokenbridge_interfaces::{Rv, SessionHandle, TokenBackend, TokenInfo};
use tracing::{debug, trace, warn};

use crate::{
    HError,
    config::{SessionPoolConfig, TokenConfig},
    error::result::HResult,
    session::Session,
    token::Token,
};

/// A snapshot of the session accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Sessions currently open, pooled or checked out
    pub open: usize,
    pub object_pool: usize,
    pub operation_pool: usize,
    pub max_sessions: Option<usize>,
}

impl SessionStats {
    #[must_use]
    pub const fn checked_out(&self) -> usize {
        self.open
            .saturating_sub(self.object_pool)
            .saturating_sub(self.operation_pool)
    }
}

#[derive(Default)]
struct Pools {
    object: Vec<Arc<Session>>,
    operation: Vec<Arc<Session>>,
    open: usize,
}

impl Pools {
    fn contains(&self, session: &Arc<Session>) -> bool {
        self.object
            .iter()
            .chain(self.operation.iter())
            .any(|s| Arc::ptr_eq(s, session))
    }

    fn abandon(&mut self) {
        self.object.clear();
        self.operation.clear();
        self.open = 0;
    }
}

/// Close the idle sessions of `pool`, oldest first
fn evict(
    policy: &SessionPoolConfig,
    pool: &mut Vec<Arc<Session>>,
    open: &mut usize,
) -> Vec<Arc<Session>> {
    let now = Instant::now();
    pool.sort_by_key(|session| session.last_access());
    let mut evicted = Vec::new();
    let mut i = 0;
    while i < pool.len() && *open > policy.min_open {
        if pool[i].idle_time(now) < policy.max_idle() {
            break;
        }
        if pool[i].has_objects() {
            i += 1;
            continue;
        }
        evicted.push(pool.remove(i));
        *open -= 1;
    }
    evicted
}

/// Manages the sessions of a token
pub struct SessionManager {
    name: String,
    backend: Arc<dyn TokenBackend>,
    valid: Arc<AtomicBool>,
    read_write: bool,
    max_sessions: Option<usize>,
    policy: SessionPoolConfig,
    pools: Mutex<Pools>,
}

impl SessionManager {
    pub(crate) fn new(
        backend: Arc<dyn TokenBackend>,
        valid: Arc<AtomicBool>,
        info: &TokenInfo,
        config: &TokenConfig,
    ) -> Self {
        let read_write = !info.write_protected;
        let max_sessions = [
            config.max_sessions,
            info.max_session_count,
            if read_write {
                info.max_rw_session_count
            } else {
                None
            },
        ]
        .into_iter()
        .flatten()
        .min();
        debug!(
            "{}: {} sessions, at most {max_sessions:?}",
            config.name,
            if read_write { "read/write" } else { "read only" }
        );
        Self {
            name: config.name.clone(),
            backend,
            valid,
            read_write,
            max_sessions,
            policy: config.session_pool.clone(),
            pools: Mutex::new(Pools::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pools> {
        self.pools
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn ensure_valid(&self) -> HResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(HError::TokenInvalid(format!("{}: token is not valid", self.name)))
        }
    }

    /// Open a new session unless the maximum is reached
    fn open(&self, pools: &mut Pools) -> HResult<Option<Arc<Session>>> {
        if self.max_sessions.is_some_and(|max| pools.open >= max) {
            return Ok(None);
        }
        match self.backend.open_session(self.read_write) {
            Ok(handle) => {
                pools.open += 1;
                debug!("{}: opened session {handle} ({} open)", self.name, pools.open);
                Ok(Some(Arc::new(Session::new(handle))))
            }
            Err(e) if e.rv == Rv::SessionCount => {
                debug!("{}: the token refused to open a session: {e}", self.name);
                Ok(None)
            }
            Err(e) => {
                if e.rv.is_removal() {
                    self.valid.store(false, Ordering::Release);
                    pools.abandon();
                }
                Err(HError::from_backend("opening a session", e))
            }
        }
    }

    fn exhausted(&self, pools: &Pools) -> HError {
        HError::ResourceExhausted(format!(
            "{}: no session available, {} open, at most {:?}",
            self.name, pools.open, self.max_sessions
        ))
    }

    /// Get a session suitable to create objects.
    ///
    /// Sessions already owning objects are preferred, then idle operation sessions, then a
    /// new session.
    pub fn acquire_object_session(&self) -> HResult<Arc<Session>> {
        self.ensure_valid()?;
        let mut pools = self.lock();
        if let Some(session) = pools.object.pop() {
            return Ok(session);
        }
        if let Some(session) = pools.operation.pop() {
            return Ok(session);
        }
        if let Some(session) = self.open(&mut pools)? {
            return Ok(session);
        }
        Err(self.exhausted(&pools))
    }

    /// Get a session to run an operation.
    ///
    /// Opening a new session is preferred over taking one from the object pool.
    pub fn acquire_operation_session(&self) -> HResult<Arc<Session>> {
        self.ensure_valid()?;
        let mut pools = self.lock();
        if let Some(session) = pools.operation.pop() {
            return Ok(session);
        }
        if let Some(session) = self.open(&mut pools)? {
            return Ok(session);
        }
        if let Some(session) = pools.object.pop() {
            return Ok(session);
        }
        Err(self.exhausted(&pools))
    }

    /// Return a session to the pool matching its objects.
    ///
    /// Releasing a session of an invalid token is a no-op: the session is abandoned.
    pub fn release(&self, session: Arc<Session>) {
        if !self.is_valid() {
            trace!("{}: abandoning session {}", self.name, session.handle());
            return;
        }
        session.touch();
        let evicted = {
            let mut pools = self.lock();
            if pools.contains(&session) {
                warn!("{}: session {} released twice", self.name, session.handle());
                return;
            }
            let Pools {
                object,
                operation,
                open,
            } = &mut *pools;
            if session.has_objects() {
                object.push(session);
                Vec::new()
            } else {
                operation.push(session);
                if operation.len() >= self.policy.eviction_threshold {
                    evict(&self.policy, operation, open)
                } else {
                    Vec::new()
                }
            }
        };
        for session in evicted {
            debug!("{}: closing idle session {}", self.name, session.handle());
            self.close(session.handle());
        }
    }

    /// Close a session instead of returning it to the pools.
    ///
    /// A session owning objects cannot be closed: it is released instead.
    pub fn kill(&self, session: Arc<Session>) {
        if session.has_objects() {
            self.release(session);
            return;
        }
        if !self.is_valid() {
            return;
        }
        {
            let mut pools = self.lock();
            pools.open = pools.open.saturating_sub(1);
        }
        debug!("{}: killing session {}", self.name, session.handle());
        self.close(session.handle());
    }

    fn close(&self, handle: SessionHandle) {
        if let Err(e) = self.backend.close_session(handle) {
            warn!("{}: failed closing session {handle}: {e}", self.name);
            if e.rv.is_removal() {
                self.valid.store(false, Ordering::Release);
                self.lock().abandon();
            }
        }
    }

    /// Account for an object created through a checked out session
    pub(crate) fn add_object(&self, session: &Session) {
        let _pools = self.lock();
        session.add_object();
    }

    /// Account for the destruction of an object created through `session`.
    ///
    /// The session is demoted to the operation pool with its last object.
    pub(crate) fn remove_object(&self, session: &Arc<Session>) {
        let mut pools = self.lock();
        if session.remove_object() == 0 {
            Self::demote_locked(&mut pools, session);
        }
    }

    /// Move a session without objects from the object pool to the operation pool.
    ///
    /// A checked out session is moved to the right pool when it is released.
    pub fn demote(&self, session: &Arc<Session>) {
        let mut pools = self.lock();
        Self::demote_locked(&mut pools, session);
    }

    fn demote_locked(pools: &mut Pools, session: &Arc<Session>) {
        if session.has_objects() {
            return;
        }
        if let Some(position) = pools.object.iter().position(|s| Arc::ptr_eq(s, session)) {
            let session = pools.object.swap_remove(position);
            trace!("demoting session {}", session.handle());
            pools.operation.push(session);
        }
    }

    /// Forget every session without closing them, once the token is invalid
    pub(crate) fn abandon(&self) {
        let mut pools = self.lock();
        debug!("{}: abandoning {} sessions", self.name, pools.open);
        pools.abandon();
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let pools = self.lock();
        SessionStats {
            open: pools.open,
            object_pool: pools.object.len(),
            operation_pool: pools.operation.len(),
            max_sessions: self.max_sessions,
        }
    }

    #[must_use]
    pub const fn max_sessions(&self) -> Option<usize> {
        self.max_sessions
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if !self.is_valid() {
            return;
        }
        let pools = std::mem::take(&mut *self.lock());
        for session in pools.object.iter().chain(pools.operation.iter()) {
            self.close(session.handle());
        }
    }
}

/// A session checked out of the pools, released when dropped
pub struct SessionGuard {
    token: Arc<Token>,
    session: Arc<Session>,
    killed: bool,
}

impl SessionGuard {
    pub(crate) fn new(token: Arc<Token>, session: Arc<Session>) -> Self {
        Self {
            token,
            session,
            killed: false,
        }
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.session.handle()
    }

    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    #[must_use]
    pub const fn token(&self) -> &Arc<Token> {
        &self.token
    }

    /// Close the session rather than returning it to the pools
    pub fn kill(mut self) {
        self.killed = true;
        self.token.session_manager().kill(self.session.clone());
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.killed {
            self.token.session_manager().release(self.session.clone());
        }
    }
}
