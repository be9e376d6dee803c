use std::{
    hash::{Hash, Hasher},
    sync::{Arc, Weak, mpsc::Sender},
};

use once_cell::sync::OnceCell;
use tokenbridge_interfaces::{
    Attribute, AttributeList, AttributeType, KeyType, ObjectClass, ObjectHandle,
};
use tracing::trace;
use zeroize::Zeroizing;

use crate::{
    HError, KeyAlgorithm,
    error::result::HResult,
    hsm_call,
    key::{KeyMaterial, reaper::Disposal},
    session::{Session, SessionGuard},
    token::Token,
};

/// What is known of a key object when it is created
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeyProperties {
    pub(crate) class: ObjectClass,
    pub(crate) key_type: KeyType,
    pub(crate) bits: usize,
    pub(crate) token_object: bool,
    pub(crate) sensitive: bool,
    pub(crate) extractable: bool,
}

impl KeyProperties {
    /// Read the flags of the key from the final template of its object
    pub(crate) fn from_template(
        template: &[Attribute],
        class: ObjectClass,
        key_type: KeyType,
        bits: usize,
    ) -> Self {
        Self {
            class,
            key_type,
            bits,
            token_object: template.bool_value(AttributeType::Token).unwrap_or(false),
            sensitive: template
                .bool_value(AttributeType::Sensitive)
                .unwrap_or(false),
            extractable: template
                .bool_value(AttributeType::Extractable)
                .unwrap_or(true),
        }
    }
}

/// A key living on a token.
///
/// A session key is owned by the session it was created through, and its object is destroyed
/// once the key is dropped. Destruction is deferred to the key reaper of the token, which runs
/// on the next key creation, on an explicit drain or on its own thread.
pub struct TokenKey {
    token: Weak<Token>,
    handle: ObjectHandle,
    algorithm: KeyAlgorithm,
    properties: KeyProperties,
    owner: Option<Arc<Session>>,
    material: OnceCell<KeyMaterial>,
    disposer: Option<Sender<Disposal>>,
}

impl TokenKey {
    /// Wrap an object just created through `session`.
    ///
    /// Session keys are accounted on their session and registered with the reaper, which then
    /// gets a chance to destroy the objects of the keys dropped so far.
    pub(crate) fn new(
        session: &SessionGuard,
        handle: ObjectHandle,
        properties: KeyProperties,
        material: Option<KeyMaterial>,
    ) -> Arc<Self> {
        let token = session.token();
        let owner = (!properties.token_object).then(|| session.session().clone());
        if let Some(owner) = &owner {
            token.session_manager().add_object(owner);
        }
        let cell = OnceCell::new();
        if let Some(material) = material {
            // a fresh cell cannot be set already
            let _ = cell.set(material);
        }
        let key = Arc::new(Self {
            token: Arc::downgrade(token),
            handle,
            algorithm: KeyAlgorithm::from_key_type(properties.key_type),
            properties,
            disposer: owner.as_ref().map(|_| token.key_reaper().sender()),
            owner,
            material: cell,
        });
        trace!(
            "{}: new {} {:?} key, object {handle}",
            token.name(),
            key.algorithm,
            key.properties.class
        );
        if key.owner.is_some() {
            token.key_reaper().register(&key);
            token.drain_disposed_keys();
        }
        key
    }

    #[must_use]
    pub const fn handle(&self) -> ObjectHandle {
        self.handle
    }

    #[must_use]
    pub const fn class(&self) -> ObjectClass {
        self.properties.class
    }

    #[must_use]
    pub const fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        self.properties.key_type
    }

    /// Size of the key in bits
    #[must_use]
    pub const fn bits(&self) -> usize {
        self.properties.bits
    }

    /// Size of the key in bytes, rounded up
    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.properties.bits.div_ceil(8)
    }

    #[must_use]
    pub const fn is_token_object(&self) -> bool {
        self.properties.token_object
    }

    #[must_use]
    pub const fn is_sensitive(&self) -> bool {
        self.properties.sensitive
    }

    #[must_use]
    pub const fn is_extractable(&self) -> bool {
        self.properties.extractable
    }

    /// The session owning a session key
    #[must_use]
    pub const fn owner(&self) -> Option<&Arc<Session>> {
        self.owner.as_ref()
    }

    /// The token holding the key
    pub fn token(&self) -> HResult<Arc<Token>> {
        self.token
            .upgrade()
            .ok_or_else(|| HError::TokenInvalid("the token of the key is gone".to_owned()))
    }

    /// Whether the key lives on `token`
    #[must_use]
    pub fn belongs_to(&self, token: &Arc<Token>) -> bool {
        std::ptr::eq(self.token.as_ptr(), Arc::as_ptr(token))
    }

    /// Whether the key value can be read from the token
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.properties.class == ObjectClass::PublicKey
            || (!self.properties.sensitive && self.properties.extractable)
    }

    /// The value of the key, read from the token the first time it is needed
    pub fn material(&self) -> HResult<&KeyMaterial> {
        if !self.is_readable() {
            return Err(HError::InvalidKey(format!(
                "the value of {} key {} is sensitive or not extractable",
                self.algorithm, self.handle
            )));
        }
        self.material.get_or_try_init(|| self.read_material())
    }

    fn read_material(&self) -> HResult<KeyMaterial> {
        let token = self.token()?;
        token.ensure_valid()?;
        let session = token.acquire_operation_session()?;
        let (class, key_type) = (self.properties.class, self.properties.key_type);
        let attributes = match hsm_call!(
            token,
            "reading the key value",
            get_attribute_value,
            session.handle(),
            self.handle,
            KeyMaterial::attribute_types(class, key_type, true)
        ) {
            Ok(attributes) => attributes,
            // private keys without CRT components
            Err(HError::Backend { .. })
                if class == ObjectClass::PrivateKey && key_type == KeyType::Rsa =>
            {
                hsm_call!(
                    token,
                    "reading the key value",
                    get_attribute_value,
                    session.handle(),
                    self.handle,
                    KeyMaterial::attribute_types(class, key_type, false)
                )?
            }
            Err(e) => return Err(e),
        };
        KeyMaterial::from_attributes(class, key_type, &attributes)
    }

    /// The encoded form of the key, `None` when the value cannot be read or encoded
    #[must_use]
    pub fn encoded(&self) -> Option<Zeroizing<Vec<u8>>> {
        self.material()
            .and_then(KeyMaterial::encode)
            .map_err(|e| trace!("key {} has no encoding: {e}", self.handle))
            .ok()
    }
}

/// Keys are equal when they are the same object, or when both have an encoding and the
/// encodings are equal.
///
/// Two distinct keys of which one is sensitive are never equal, even with the same value.
impl PartialEq for TokenKey {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        if self.properties.class != other.properties.class || self.algorithm != other.algorithm {
            return false;
        }
        match (self.encoded(), other.encoded()) {
            (Some(encoded), Some(other)) => encoded == other,
            _ => false,
        }
    }
}

impl Eq for TokenKey {}

impl Hash for TokenKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.encoded() {
            Some(encoded) => encoded.hash(state),
            None => std::ptr::hash(self, state),
        }
    }
}

impl std::fmt::Debug for TokenKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenKey")
            .field("handle", &self.handle)
            .field("algorithm", &self.algorithm)
            .field("class", &self.properties.class)
            .field("bits", &self.properties.bits)
            .field("token_object", &self.properties.token_object)
            .field("sensitive", &self.properties.sensitive)
            .field("extractable", &self.properties.extractable)
            .finish_non_exhaustive()
    }
}

impl Drop for TokenKey {
    fn drop(&mut self) {
        if let (Some(owner), Some(disposer)) = (self.owner.take(), self.disposer.take()) {
            if disposer
                .send(Disposal {
                    handle: self.handle,
                    owner,
                })
                .is_err()
            {
                trace!("key {} dropped after its token", self.handle);
            }
        }
    }
}
