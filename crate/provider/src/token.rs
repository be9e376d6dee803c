//! The token: root of the sessions and keys of a backend.

use std::{
    num::NonZeroUsize,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use lru::LruCache;
use tokenbridge_interfaces::{BackendError, TokenBackend, TokenInfo};
use tracing::{debug, info, warn};

use crate::{
    HError, TokenConfig,
    error::result::HResult,
    hsm_call,
    key::{KeyReaper, TokenKey},
    session::{SessionGuard, SessionManager},
    template::TemplateManager,
};

/// Fingerprint of imported secret key material
pub(crate) type KeyFingerprint = [u8; 32];

/// Cache of the secret keys imported into the token, indexed by the fingerprint of the material
/// they were imported from.
pub(crate) struct SecretKeyCache(Option<Mutex<LruCache<KeyFingerprint, Arc<TokenKey>>>>);

impl SecretKeyCache {
    fn new(capacity: usize) -> Self {
        Self(NonZeroUsize::new(capacity).map(|capacity| Mutex::new(LruCache::new(capacity))))
    }

    fn with<T>(&self, f: impl FnOnce(&mut LruCache<KeyFingerprint, Arc<TokenKey>>) -> T) -> Option<T> {
        self.0.as_ref().map(|cache| {
            f(&mut cache
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner))
        })
    }

    pub(crate) fn get(&self, fingerprint: &KeyFingerprint) -> Option<Arc<TokenKey>> {
        self.with(|cache| cache.get(fingerprint).cloned()).flatten()
    }

    pub(crate) fn insert(&self, fingerprint: KeyFingerprint, key: Arc<TokenKey>) {
        self.with(|cache| cache.put(fingerprint, key));
    }

    pub(crate) fn len(&self) -> usize {
        self.with(|cache| cache.len()).unwrap_or(0)
    }

    fn clear(&self) {
        // the keys are dropped once the lock is released
        let evicted = self.with(|cache| {
            let mut keys = Vec::with_capacity(cache.len());
            while let Some((_, key)) = cache.pop_lru() {
                keys.push(key);
            }
            keys
        });
        drop(evicted);
    }
}

/// A cryptographic token.
///
/// The token owns the sessions, the attribute templates, the cache of imported secret keys and
/// the reaper destroying the objects of unreachable keys. Once the backend is removed the token
/// becomes invalid for good: its sessions are abandoned and every operation fails with
/// [`HError::TokenInvalid`].
pub struct Token {
    config: TokenConfig,
    backend: Arc<dyn TokenBackend>,
    info: TokenInfo,
    valid: Arc<AtomicBool>,
    last_presence_check: Mutex<Instant>,
    session_manager: SessionManager,
    templates: TemplateManager,
    secret_key_cache: SecretKeyCache,
    key_reaper: KeyReaper,
}

impl Token {
    /// Connect to the backend
    pub fn new(backend: Arc<dyn TokenBackend>, config: TokenConfig) -> HResult<Arc<Self>> {
        let info = backend
            .token_info()
            .map_err(|e| HError::from_backend("reading the token information", e))?;
        let valid = Arc::new(AtomicBool::new(true));
        let session_manager = SessionManager::new(backend.clone(), valid.clone(), &info, &config);
        let token = Arc::new(Self {
            templates: TemplateManager::new(config.attributes.clone()),
            secret_key_cache: SecretKeyCache::new(config.secret_key_cache_size),
            key_reaper: KeyReaper::new(),
            last_presence_check: Mutex::new(Instant::now()),
            session_manager,
            valid,
            info,
            backend,
            config,
        });
        if token.config.background_key_reaper {
            token.key_reaper.spawn(&token)?;
        }
        info!(
            "{}: token {:?} ready{}",
            token.config.name,
            token.info.label,
            if token.info.write_protected {
                " (write protected)"
            } else {
                ""
            }
        );
        Ok(token)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub const fn config(&self) -> &TokenConfig {
        &self.config
    }

    #[must_use]
    pub const fn info(&self) -> &TokenInfo {
        &self.info
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn TokenBackend> {
        &self.backend
    }

    #[must_use]
    pub const fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }

    #[must_use]
    pub const fn templates(&self) -> &TemplateManager {
        &self.templates
    }

    pub(crate) const fn secret_key_cache(&self) -> &SecretKeyCache {
        &self.secret_key_cache
    }

    pub(crate) const fn key_reaper(&self) -> &KeyReaper {
        &self.key_reaper
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the token invalid: its sessions are abandoned and the cache of imported keys is
    /// cleared
    pub fn invalidate(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            warn!("{}: token invalidated", self.config.name);
        }
        self.session_manager.abandon();
        self.secret_key_cache.clear();
    }

    /// Fail with [`HError::TokenInvalid`] unless the token is valid.
    ///
    /// The presence of a removable token is checked at most once per configured interval.
    pub fn ensure_valid(&self) -> HResult<()> {
        if self.is_valid() && self.info.removable {
            let due = {
                let mut last = self
                    .last_presence_check
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let due = last.elapsed() >= self.config.presence_check_interval();
                if due {
                    *last = Instant::now();
                }
                due
            };
            if due {
                if let Err(e) = self.backend.token_info() {
                    debug!("{}: presence check failed: {e}", self.config.name);
                    if e.rv.is_removal() {
                        self.invalidate();
                    }
                }
            }
        }
        if self.is_valid() {
            Ok(())
        } else {
            self.invalidate();
            Err(HError::TokenInvalid(format!(
                "{}: token has been removed",
                self.config.name
            )))
        }
    }

    /// Classify a failure of the backend, invalidating the token on removal
    pub fn backend_error(&self, context: &str, error: BackendError) -> HError {
        if error.rv.is_removal() {
            self.invalidate();
        }
        HError::from_backend(context, error)
    }

    /// Check out a session suitable to create objects
    pub fn acquire_object_session(self: &Arc<Self>) -> HResult<SessionGuard> {
        self.ensure_valid()?;
        let session = self.session_manager.acquire_object_session()?;
        Ok(SessionGuard::new(self.clone(), session))
    }

    /// Check out a session to run an operation
    pub fn acquire_operation_session(self: &Arc<Self>) -> HResult<SessionGuard> {
        self.ensure_valid()?;
        let session = self.session_manager.acquire_operation_session()?;
        Ok(SessionGuard::new(self.clone(), session))
    }

    /// Fill `output` with random bytes from the token generator
    pub fn fill_random(self: &Arc<Self>, output: &mut [u8]) -> HResult<()> {
        let session = self.acquire_operation_session()?;
        hsm_call!(
            self,
            "generating random bytes",
            generate_random,
            session.handle(),
            output
        )
    }

    /// Generate `len` random bytes with the token generator
    pub fn generate_random(self: &Arc<Self>, len: usize) -> HResult<Vec<u8>> {
        let mut output = vec![0_u8; len];
        self.fill_random(&mut output)?;
        Ok(output)
    }

    /// Destroy the objects of the keys that became unreachable.
    /// Returns the number of objects destroyed.
    pub fn drain_disposed_keys(self: &Arc<Self>) -> usize {
        self.key_reaper.drain(self)
    }

    /// Number of session keys whose object is not destroyed yet
    #[must_use]
    pub fn live_session_objects(&self) -> usize {
        self.key_reaper.registered()
    }

    /// Number of secret keys held by the import cache
    #[must_use]
    pub fn cached_secret_keys(&self) -> usize {
        self.secret_key_cache.len()
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("name", &self.config.name)
            .field("label", &self.info.label)
            .field("valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}
