//! Token backend interface.
//! This module defines the interface that a cryptographic token must implement to be driven by
//! the provider: a handle based, session oriented API modelled on PKCS#11.

use crate::{Attribute, AttributeType, BResult, Mechanism, ObjectHandle, SessionHandle};

/// Static information about the token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub label: String,
    /// Maximum number of sessions that can be open at once, `None` when not limited
    pub max_session_count: Option<usize>,
    /// Maximum number of read/write sessions that can be open at once, `None` when not limited
    pub max_rw_session_count: Option<usize>,
    pub write_protected: bool,
    /// The device can be removed (smart cards, USB tokens...)
    pub removable: bool,
}

/// Token backend trait
///
/// All calls are synchronous. Output buffers are allocated by the caller: functions writing
/// into `output` return the number of bytes written and fail with `CKR_BUFFER_TOO_SMALL` when
/// the buffer cannot hold the result, in which case the active operation is left untouched.
/// Any other failure of an update, final or single-part call terminates the active operation.
pub trait TokenBackend: Send + Sync {
    /// Get the token information
    fn token_info(&self) -> BResult<TokenInfo>;

    /// Open a new session on the token
    ///
    /// # Arguments
    /// * `read_write` - open a read/write session instead of a read-only one
    /// # Returns
    /// * `BResult<SessionHandle>` - the handle of the new session
    fn open_session(&self, read_write: bool) -> BResult<SessionHandle>;

    /// Close a session. Session objects created through the session are destroyed.
    fn close_session(&self, session: SessionHandle) -> BResult<()>;

    /// Create an object from a complete template
    fn create_object(&self, session: SessionHandle, template: &[Attribute])
    -> BResult<ObjectHandle>;

    /// Destroy an object
    fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> BResult<()>;

    /// Read attributes of an object.
    ///
    /// Fails with `CKR_ATTRIBUTE_SENSITIVE` if one of the requested attributes cannot be
    /// revealed and with `CKR_ATTRIBUTE_TYPE_INVALID` if the object does not carry one of them.
    fn get_attribute_value(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute_types: &[AttributeType],
    ) -> BResult<Vec<Attribute>>;

    /// Generate a secret key
    fn generate_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        template: &[Attribute],
    ) -> BResult<ObjectHandle>;

    /// Generate a key pair
    ///
    /// # Returns
    /// * `BResult<(ObjectHandle, ObjectHandle)>` - the public and private key handles, in that order
    fn generate_key_pair(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> BResult<(ObjectHandle, ObjectHandle)>;

    fn encrypt_init(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
    ) -> BResult<()>;

    /// Single-part encryption, terminates the operation
    fn encrypt(&self, session: SessionHandle, data: &[u8], output: &mut [u8]) -> BResult<usize>;

    fn encrypt_update(
        &self,
        session: SessionHandle,
        data: &[u8],
        output: &mut [u8],
    ) -> BResult<usize>;

    fn encrypt_final(&self, session: SessionHandle, output: &mut [u8]) -> BResult<usize>;

    fn decrypt_init(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
    ) -> BResult<()>;

    /// Single-part decryption, terminates the operation
    fn decrypt(&self, session: SessionHandle, data: &[u8], output: &mut [u8]) -> BResult<usize>;

    fn decrypt_update(
        &self,
        session: SessionHandle,
        data: &[u8],
        output: &mut [u8],
    ) -> BResult<usize>;

    fn decrypt_final(&self, session: SessionHandle, output: &mut [u8]) -> BResult<usize>;

    fn sign_init(&self, session: SessionHandle, mechanism: &Mechanism, key: ObjectHandle)
    -> BResult<()>;

    /// Single-part signature, terminates the operation
    fn sign(&self, session: SessionHandle, data: &[u8], output: &mut [u8]) -> BResult<usize>;

    fn verify_recover_init(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        key: ObjectHandle,
    ) -> BResult<()>;

    /// Recover the data from a signature, terminates the operation
    fn verify_recover(
        &self,
        session: SessionHandle,
        signature: &[u8],
        output: &mut [u8],
    ) -> BResult<usize>;

    fn digest_init(&self, session: SessionHandle, mechanism: &Mechanism) -> BResult<()>;

    fn digest_update(&self, session: SessionHandle, data: &[u8]) -> BResult<()>;

    /// Continue a digest operation with the value of a secret key
    fn digest_key(&self, session: SessionHandle, key: ObjectHandle) -> BResult<()>;

    fn digest_final(&self, session: SessionHandle, output: &mut [u8]) -> BResult<usize>;

    /// Initialize and run a single-part digest in one call
    fn digest_single(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        data: &[u8],
        output: &mut [u8],
    ) -> BResult<usize>;

    /// Wrap (encrypt) `key` with `wrapping_key`
    fn wrap_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> BResult<Vec<u8>>;

    /// Unwrap (decrypt) a key and create it on the token with the given template
    fn unwrap_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        unwrapping_key: ObjectHandle,
        wrapped_key: &[u8],
        template: &[Attribute],
    ) -> BResult<ObjectHandle>;

    /// Fill `output` with random bytes from the token generator
    fn generate_random(&self, session: SessionHandle, output: &mut [u8]) -> BResult<()>;
}
