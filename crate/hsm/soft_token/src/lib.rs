//! Copyright 2024 Cosmian Tech SAS
//!
//! An in-memory software token.
//!
//! The soft token implements the [`TokenBackend`] interface on top of OpenSSL. Beyond serving
//! as a software device, it records the calls it receives and the lifecycle of its sessions
//! and objects so that the behavior of a provider driving it can be checked.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use openssl::rand::rand_bytes;
use tokenbridge_interfaces::{
    Attribute, AttributeList, AttributeType, BResult, BackendError, KeyType, Mechanism,
    ObjectClass, ObjectHandle, Rv, SessionHandle, TokenBackend, TokenInfo,
};
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::{
    keygen::{generate_pair, generate_secret},
    object::StoredObject,
    operation::{CipherOperation, DigestOperation, Operation, Direction},
};

mod keygen;
mod object;
mod operation;

#[cfg(test)]
mod tests;

/// Configuration of a soft token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftTokenConfig {
    pub label: String,
    /// Maximum number of open sessions, `None` for no limit
    pub max_sessions: Option<usize>,
    pub write_protected: bool,
    pub removable: bool,
}

impl Default for SoftTokenConfig {
    fn default() -> Self {
        Self {
            label: "soft token".to_owned(),
            max_sessions: None,
            write_protected: false,
            removable: false,
        }
    }
}

/// Lifecycle events recorded by the soft token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    SessionOpened(SessionHandle),
    /// A session was closed while owning `owned_objects` session objects
    SessionClosed {
        session: SessionHandle,
        owned_objects: usize,
    },
    ObjectCreated {
        object: ObjectHandle,
        owner: Option<SessionHandle>,
    },
    ObjectDestroyed(ObjectHandle),
}

struct SessionState {
    read_write: bool,
    operation: Option<Operation>,
}

#[derive(Default)]
struct TokenState {
    removed: bool,
    next_handle: u64,
    sessions: HashMap<SessionHandle, SessionState>,
    objects: HashMap<ObjectHandle, StoredObject>,
    events: Vec<TokenEvent>,
    calls: HashMap<&'static str, usize>,
}

impl TokenState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn session(&mut self, session: SessionHandle) -> Result<&mut SessionState, Rv> {
        self.sessions
            .get_mut(&session)
            .ok_or(Rv::SessionHandleInvalid)
    }

    fn key(&self, key: ObjectHandle) -> Result<&StoredObject, Rv> {
        self.objects.get(&key).ok_or(Rv::KeyHandleInvalid)
    }

    fn start(&mut self, session: SessionHandle, operation: Operation) -> Result<(), Rv> {
        let state = self.session(session)?;
        if let Some(active) = &state.operation {
            debug!("session {session}: {} operation already active", active.name());
            return Err(Rv::OperationActive);
        }
        state.operation = Some(operation);
        Ok(())
    }

    /// Take the active operation out of the session.
    /// It is put back by [`Self::resume`] if the operation must stay active.
    fn take(&mut self, session: SessionHandle) -> Result<Operation, Rv> {
        self.session(session)?
            .operation
            .take()
            .ok_or(Rv::OperationNotInitialized)
    }

    fn resume(&mut self, session: SessionHandle, operation: Operation) {
        if let Ok(state) = self.session(session) {
            state.operation = Some(operation);
        }
    }

    fn store(&mut self, session: SessionHandle, attributes: Vec<Attribute>) -> ObjectHandle {
        let owner = if attributes.bool_value(AttributeType::Token) == Some(true) {
            None
        } else {
            Some(session)
        };
        let handle = self.next_handle();
        self.objects.insert(handle, StoredObject { attributes, owner });
        self.events.push(TokenEvent::ObjectCreated {
            object: handle,
            owner,
        });
        handle
    }
}

/// Copy `result` into `output`, failing with `CKR_BUFFER_TOO_SMALL` when it does not fit
fn write_output(result: &[u8], output: &mut [u8]) -> Result<usize, Rv> {
    let target = output
        .get_mut(..result.len())
        .ok_or(Rv::BufferTooSmall)?;
    target.copy_from_slice(result);
    Ok(result.len())
}

/// A software token keeping its objects in memory
pub struct SoftToken {
    config: SoftTokenConfig,
    state: Mutex<TokenState>,
}

impl Default for SoftToken {
    fn default() -> Self {
        Self::new(SoftTokenConfig::default())
    }
}

impl SoftToken {
    #[must_use]
    pub fn new(config: SoftTokenConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TokenState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Run `f` on the token state, counting the call to `function`
    fn call<T>(
        &self,
        function: &'static str,
        f: impl FnOnce(&mut TokenState) -> Result<T, Rv>,
    ) -> BResult<T> {
        let mut state = self.lock();
        *state.calls.entry(function).or_default() += 1;
        trace!("{function}");
        if state.removed {
            return Err(BackendError::new(function, Rv::DeviceRemoved));
        }
        f(&mut state).map_err(|rv| BackendError::new(function, rv))
    }

    /// Simulate the removal of the device: every later call fails
    pub fn remove(&self) {
        self.lock().removed = true;
    }

    /// The lifecycle events recorded so far
    #[must_use]
    pub fn events(&self) -> Vec<TokenEvent> {
        self.lock().events.clone()
    }

    /// Number of calls received for a native function, e.g. `"C_CreateObject"`
    #[must_use]
    pub fn call_count(&self, function: &str) -> usize {
        self.lock().calls.get(function).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Number of session objects (non token objects) currently alive
    #[must_use]
    pub fn session_objects(&self) -> usize {
        self.lock()
            .objects
            .values()
            .filter(|object| object.owner.is_some())
            .count()
    }

    /// `true` when an operation is active on the session
    #[must_use]
    pub fn operation_active(&self, session: SessionHandle) -> bool {
        self.lock()
            .sessions
            .get(&session)
            .is_some_and(|state| state.operation.is_some())
    }

    fn init_cipher(
        &self,
        function: &'static str,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
        direction: Direction,
    ) -> BResult<()> {
        self.call(function, |state| {
            state.session(session)?;
            let object = state.key(key)?;
            object.permits(match direction {
                Direction::Encrypt => AttributeType::Encrypt,
                Direction::Decrypt => AttributeType::Decrypt,
                Direction::Sign => AttributeType::Sign,
                Direction::VerifyRecover => AttributeType::Verify,
            })?;
            let cipher = CipherOperation::new(mechanism, object, direction)?;
            let operation = match direction {
                Direction::Encrypt => Operation::Encrypt(cipher),
                Direction::Decrypt => Operation::Decrypt(cipher),
                Direction::Sign => Operation::Sign(cipher),
                Direction::VerifyRecover => Operation::VerifyRecover(cipher),
            };
            state.start(session, operation)
        })
    }

    /// Apply `f` to the active cipher operation of the session if it matches `direction`.
    ///
    /// The operation stays active when `f` succeeds and `terminate` is false, or when `f`
    /// fails with `CKR_BUFFER_TOO_SMALL`; any other failure terminates it.
    fn with_cipher<T>(
        &self,
        function: &'static str,
        session: SessionHandle,
        direction: Direction,
        terminate: bool,
        f: impl FnOnce(&mut CipherOperation) -> Result<T, Rv>,
    ) -> BResult<T> {
        self.call(function, |state| {
            let mut operation = state.take(session)?;
            let expected = matches!(
                (&operation, direction),
                (Operation::Encrypt(_), Direction::Encrypt)
                    | (Operation::Decrypt(_), Direction::Decrypt)
                    | (Operation::Sign(_), Direction::Sign)
                    | (Operation::VerifyRecover(_), Direction::VerifyRecover)
            );
            if !expected {
                state.resume(session, operation);
                return Err(Rv::OperationNotInitialized);
            }
            let (Operation::Encrypt(cipher)
            | Operation::Decrypt(cipher)
            | Operation::Sign(cipher)
            | Operation::VerifyRecover(cipher)) = &mut operation
            else {
                return Err(Rv::OperationNotInitialized);
            };
            let result = f(cipher);
            match &result {
                Err(Rv::BufferTooSmall) => state.resume(session, operation),
                Ok(_) if !terminate => state.resume(session, operation),
                _ => {}
            }
            result
        })
    }

    fn cipher_single(
        &self,
        function: &'static str,
        session: SessionHandle,
        direction: Direction,
        data: &[u8],
        output: &mut [u8],
    ) -> BResult<usize> {
        self.with_cipher(function, session, direction, true, |cipher| {
            if output.len() < cipher.single_len(data.len()) {
                return Err(Rv::BufferTooSmall);
            }
            let result = Zeroizing::new(cipher.single(data)?);
            write_output(&result, output)
        })
    }

    fn cipher_update(
        &self,
        function: &'static str,
        session: SessionHandle,
        direction: Direction,
        data: &[u8],
        output: &mut [u8],
    ) -> BResult<usize> {
        self.with_cipher(function, session, direction, false, |cipher| {
            if output.len() < cipher.update_len(data.len())? {
                return Err(Rv::BufferTooSmall);
            }
            let result = Zeroizing::new(cipher.update(data)?);
            write_output(&result, output)
        })
    }

    fn cipher_final(
        &self,
        function: &'static str,
        session: SessionHandle,
        direction: Direction,
        output: &mut [u8],
    ) -> BResult<usize> {
        self.with_cipher(function, session, direction, true, |cipher| {
            let result = Zeroizing::new(cipher.finalize()?);
            write_output(&result, output)
        })
    }

    fn with_digest<T>(
        &self,
        function: &'static str,
        session: SessionHandle,
        terminate: bool,
        f: impl FnOnce(&mut TokenState, &mut DigestOperation) -> Result<T, Rv>,
    ) -> BResult<T> {
        self.call(function, |state| {
            let mut operation = state.take(session)?;
            if !matches!(operation, Operation::Digest(_)) {
                state.resume(session, operation);
                return Err(Rv::OperationNotInitialized);
            }
            let Operation::Digest(digest) = &mut operation else {
                return Err(Rv::OperationNotInitialized);
            };
            let result = f(state, digest);
            match &result {
                Err(Rv::BufferTooSmall) => state.resume(session, operation),
                Ok(_) if !terminate => state.resume(session, operation),
                _ => {}
            }
            result
        })
    }
}

impl TokenBackend for SoftToken {
    fn token_info(&self) -> BResult<TokenInfo> {
        let state = self.lock();
        if state.removed {
            return Err(BackendError::new("C_GetTokenInfo", Rv::TokenNotPresent));
        }
        Ok(TokenInfo {
            label: self.config.label.clone(),
            max_session_count: self.config.max_sessions,
            max_rw_session_count: self.config.max_sessions,
            write_protected: self.config.write_protected,
            removable: self.config.removable,
        })
    }

    fn open_session(&self, read_write: bool) -> BResult<SessionHandle> {
        self.call("C_OpenSession", |state| {
            if read_write && self.config.write_protected {
                return Err(Rv::TokenWriteProtected);
            }
            if self
                .config
                .max_sessions
                .is_some_and(|max| state.sessions.len() >= max)
            {
                return Err(Rv::SessionCount);
            }
            let handle = state.next_handle();
            state.sessions.insert(
                handle,
                SessionState {
                    read_write,
                    operation: None,
                },
            );
            state.events.push(TokenEvent::SessionOpened(handle));
            debug!("opened session {handle}");
            Ok(handle)
        })
    }

    fn close_session(&self, session: SessionHandle) -> BResult<()> {
        self.call("C_CloseSession", |state| {
            state
                .sessions
                .remove(&session)
                .ok_or(Rv::SessionHandleInvalid)?;
            let owned: Vec<ObjectHandle> = state
                .objects
                .iter()
                .filter(|(_, object)| object.owner == Some(session))
                .map(|(handle, _)| *handle)
                .collect();
            for handle in &owned {
                state.objects.remove(handle);
            }
            state.events.push(TokenEvent::SessionClosed {
                session,
                owned_objects: owned.len(),
            });
            debug!(
                "closed session {session}, destroyed {} session objects",
                owned.len()
            );
            Ok(())
        })
    }

    fn create_object(
        &self,
        session: SessionHandle,
        template: &[Attribute],
    ) -> BResult<ObjectHandle> {
        self.call("C_CreateObject", |state| {
            let read_write = state.session(session)?.read_write;
            let class = template.class().ok_or(Rv::TemplateIncomplete)?;
            let key_type = template.key_type().ok_or(Rv::TemplateIncomplete)?;
            if template.bool_value(AttributeType::Token) == Some(true) && !read_write {
                return Err(Rv::TokenWriteProtected);
            }
            let object = StoredObject {
                attributes: template.to_vec(),
                owner: None,
            };
            match (class, key_type) {
                (ObjectClass::SecretKey, key_type) => {
                    let len = object.secret_value()?.len();
                    let valid = match key_type {
                        KeyType::Aes => [16, 24, 32].contains(&len),
                        KeyType::Des => len == 8,
                        KeyType::Des2 => len == 16,
                        KeyType::Des3 => len == 24,
                        KeyType::GenericSecret => len > 0,
                        _ => return Err(Rv::TemplateInconsistent),
                    };
                    if !valid {
                        return Err(Rv::AttributeValueInvalid);
                    }
                }
                (_, KeyType::Rsa) => {
                    object.rsa_key()?;
                }
                (_, KeyType::Ec) => object.check_ec()?,
                (_, KeyType::Dsa | KeyType::Dh) => {
                    object
                        .bytes_value(AttributeType::Value)
                        .ok_or(Rv::TemplateIncomplete)?;
                }
                _ => return Err(Rv::TemplateInconsistent),
            }
            Ok(state.store(session, object.attributes))
        })
    }

    fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> BResult<()> {
        self.call("C_DestroyObject", |state| {
            state.session(session)?;
            state
                .objects
                .remove(&object)
                .ok_or(Rv::ObjectHandleInvalid)?;
            state.events.push(TokenEvent::ObjectDestroyed(object));
            Ok(())
        })
    }

    fn get_attribute_value(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute_types: &[AttributeType],
    ) -> BResult<Vec<Attribute>> {
        self.call("C_GetAttributeValue", |state| {
            state.session(session)?;
            let stored = state
                .objects
                .get(&object)
                .ok_or(Rv::ObjectHandleInvalid)?;
            let hidden = stored.class()? != ObjectClass::PublicKey
                && (stored.is_sensitive() || !stored.is_extractable());
            attribute_types
                .iter()
                .map(|attribute_type| {
                    if hidden && attribute_type.is_secret() {
                        return Err(Rv::AttributeSensitive);
                    }
                    stored
                        .find(*attribute_type)
                        .cloned()
                        .ok_or(Rv::AttributeTypeInvalid)
                })
                .collect()
        })
    }

    fn generate_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        template: &[Attribute],
    ) -> BResult<ObjectHandle> {
        self.call("C_GenerateKey", |state| {
            state.session(session)?;
            let attributes = generate_secret(mechanism, template)?;
            Ok(state.store(session, attributes))
        })
    }

    fn generate_key_pair(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> BResult<(ObjectHandle, ObjectHandle)> {
        self.call("C_GenerateKeyPair", |state| {
            state.session(session)?;
            let (public, private) = generate_pair(mechanism, public_template, private_template)?;
            Ok((state.store(session, public), state.store(session, private)))
        })
    }

    fn encrypt_init(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
    ) -> BResult<()> {
        self.init_cipher("C_EncryptInit", session, mechanism, key, Direction::Encrypt)
    }

    fn encrypt(&self, session: SessionHandle, data: &[u8], output: &mut [u8]) -> BResult<usize> {
        self.cipher_single("C_Encrypt", session, Direction::Encrypt, data, output)
    }

    fn encrypt_update(
        &self,
        session: SessionHandle,
        data: &[u8],
        output: &mut [u8],
    ) -> BResult<usize> {
        self.cipher_update("C_EncryptUpdate", session, Direction::Encrypt, data, output)
    }

    fn encrypt_final(&self, session: SessionHandle, output: &mut [u8]) -> BResult<usize> {
        self.cipher_final("C_EncryptFinal", session, Direction::Encrypt, output)
    }

    fn decrypt_init(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
    ) -> BResult<()> {
        self.init_cipher("C_DecryptInit", session, mechanism, key, Direction::Decrypt)
    }

    fn decrypt(&self, session: SessionHandle, data: &[u8], output: &mut [u8]) -> BResult<usize> {
        self.cipher_single("C_Decrypt", session, Direction::Decrypt, data, output)
    }

    fn decrypt_update(
        &self,
        session: SessionHandle,
        data: &[u8],
        output: &mut [u8],
    ) -> BResult<usize> {
        self.cipher_update("C_DecryptUpdate", session, Direction::Decrypt, data, output)
    }

    fn decrypt_final(&self, session: SessionHandle, output: &mut [u8]) -> BResult<usize> {
        self.cipher_final("C_DecryptFinal", session, Direction::Decrypt, output)
    }

    fn sign_init(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
    ) -> BResult<()> {
        self.init_cipher("C_SignInit", session, mechanism, key, Direction::Sign)
    }

    fn sign(&self, session: SessionHandle, data: &[u8], output: &mut [u8]) -> BResult<usize> {
        self.cipher_single("C_Sign", session, Direction::Sign, data, output)
    }

    fn verify_recover_init(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
    ) -> BResult<()> {
        self.init_cipher(
            "C_VerifyRecoverInit",
            session,
            mechanism,
            key,
            Direction::VerifyRecover,
        )
    }

    fn verify_recover(
        &self,
        session: SessionHandle,
        signature: &[u8],
        output: &mut [u8],
    ) -> BResult<usize> {
        self.cipher_single(
            "C_VerifyRecover",
            session,
            Direction::VerifyRecover,
            signature,
            output,
        )
    }

    fn digest_init(&self, session: SessionHandle, mechanism: &Mechanism) -> BResult<()> {
        self.call("C_DigestInit", |state| {
            let digest = DigestOperation::new(mechanism)?;
            state.start(session, Operation::Digest(digest))
        })
    }

    fn digest_update(&self, session: SessionHandle, data: &[u8]) -> BResult<()> {
        self.with_digest("C_DigestUpdate", session, false, |_, digest| {
            digest.update(data)
        })
    }

    fn digest_key(&self, session: SessionHandle, key: ObjectHandle) -> BResult<()> {
        self.with_digest("C_DigestKey", session, false, |state, digest| {
            let value = state.key(key)?.secret_value()?;
            digest.update(&value)
        })
    }

    fn digest_final(&self, session: SessionHandle, output: &mut [u8]) -> BResult<usize> {
        self.with_digest("C_DigestFinal", session, true, |_, digest| {
            if output.len() < digest.length() {
                return Err(Rv::BufferTooSmall);
            }
            write_output(&digest.finish()?, output)
        })
    }

    fn digest_single(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        data: &[u8],
        output: &mut [u8],
    ) -> BResult<usize> {
        self.call("C_DigestSingle", |state| {
            if state.session(session)?.operation.is_some() {
                return Err(Rv::OperationActive);
            }
            let mut digest = DigestOperation::new(mechanism)?;
            if output.len() < digest.length() {
                return Err(Rv::BufferTooSmall);
            }
            digest.update(data)?;
            write_output(&digest.finish()?, output)
        })
    }

    fn wrap_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> BResult<Vec<u8>> {
        self.call("C_WrapKey", |state| {
            state.session(session)?;
            let target = state.key(key)?;
            if target.class()? != ObjectClass::SecretKey {
                return Err(Rv::KeyNotWrappable);
            }
            if !target.is_extractable() {
                return Err(Rv::KeyUnextractable);
            }
            let value = target.secret_value()?;
            let wrapping = state.key(wrapping_key)?;
            wrapping.permits(AttributeType::Wrap)?;
            let mut cipher = CipherOperation::new(mechanism, wrapping, Direction::Encrypt)?;
            cipher.single(&value)
        })
    }

    fn unwrap_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        unwrapping_key: ObjectHandle,
        wrapped_key: &[u8],
        template: &[Attribute],
    ) -> BResult<ObjectHandle> {
        self.call("C_UnwrapKey", |state| {
            state.session(session)?;
            if template.class() != Some(ObjectClass::SecretKey) {
                return Err(Rv::TemplateInconsistent);
            }
            let unwrapping = state.key(unwrapping_key)?;
            unwrapping.permits(AttributeType::Unwrap)?;
            let mut cipher = CipherOperation::new(mechanism, unwrapping, Direction::Decrypt)?;
            let value = Zeroizing::new(cipher.single(wrapped_key).map_err(|rv| match rv {
                Rv::EncryptedDataInvalid | Rv::EncryptedDataLenRange => Rv::WrappedKeyInvalid,
                other => other,
            })?);
            let len = value.len();
            let valid = match template.key_type() {
                Some(KeyType::Aes) => [16, 24, 32].contains(&len),
                Some(KeyType::Des) => len == 8,
                Some(KeyType::Des2) => len == 16,
                Some(KeyType::Des3) => len == 24,
                Some(KeyType::GenericSecret) => len > 0,
                _ => return Err(Rv::TemplateIncomplete),
            };
            if !valid {
                return Err(Rv::WrappedKeyLenRange);
            }
            let mut attributes: Vec<Attribute> = template
                .iter()
                .filter(|a| {
                    !matches!(a.attribute_type(), AttributeType::Value | AttributeType::ValueLen)
                })
                .cloned()
                .collect();
            attributes.push(Attribute::ValueLen(len as u64));
            attributes.push(Attribute::Value(value));
            Ok(state.store(session, attributes))
        })
    }

    fn generate_random(&self, session: SessionHandle, output: &mut [u8]) -> BResult<()> {
        self.call("C_GenerateRandom", |state| {
            state.session(session)?;
            rand_bytes(output).map_err(|_| Rv::FunctionFailed)
        })
    }
}
