//! Ciphers running on the token.
//!
//! [`Cipher`] is created from a transformation `ALGORITHM/MODE/PADDING` and dispatches to the
//! block cipher engine or the RSA engine.

use std::sync::Arc;

use tokenbridge_interfaces::{
    Attribute, AttributeList, AttributeType, KeyType, Mechanism, ObjectClass, Rv,
};
use tracing::trace;

use crate::{
    CipherAlgorithm, CipherSpec, HError, KeyAlgorithm,
    error::result::HResult,
    hsm_call,
    key::{KeyProperties, TokenKey},
    template::TemplateOperation,
    token::Token,
};

mod block;
mod padding;
mod rsa;

pub use block::BlockCipher;
pub use rsa::RsaCipher;

/// What a cipher is initialized for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Encrypt,
    Decrypt,
    Wrap,
    Unwrap,
}

impl CipherMode {
    /// Wrapping encrypts, unwrapping decrypts
    #[must_use]
    pub const fn is_encrypting(self) -> bool {
        matches!(self, Self::Encrypt | Self::Wrap)
    }
}

/// A cipher of the token
pub enum Cipher {
    Block(BlockCipher),
    Rsa(RsaCipher),
}

impl Cipher {
    /// Create a cipher for a transformation such as `AES/GCM/NoPadding` or `RSA/ECB/PKCS1Padding`
    pub fn new(token: Arc<Token>, transformation: &str) -> HResult<Self> {
        let spec: CipherSpec = transformation.parse()?;
        Ok(Self::with_spec(token, spec))
    }

    #[must_use]
    pub fn with_spec(token: Arc<Token>, spec: CipherSpec) -> Self {
        match spec.algorithm {
            CipherAlgorithm::Rsa => Self::Rsa(RsaCipher::new(token, spec.padding)),
            CipherAlgorithm::Aes | CipherAlgorithm::Des | CipherAlgorithm::DesEde => {
                Self::Block(BlockCipher::new(token, spec))
            }
        }
    }

    /// Initialize the cipher, cancelling the operation in progress if any.
    ///
    /// Encrypting block ciphers generate a random IV when the mode needs one and none is given.
    pub fn init(
        &mut self,
        mode: CipherMode,
        key: &Arc<TokenKey>,
        iv: Option<&[u8]>,
    ) -> HResult<()> {
        match self {
            Self::Block(cipher) => cipher.init(mode, key, iv),
            Self::Rsa(cipher) => cipher.init(mode, key, iv),
        }
    }

    /// Continue a multi-part operation
    pub fn update(&mut self, input: &[u8]) -> HResult<Vec<u8>> {
        match self {
            Self::Block(cipher) => cipher.update(input),
            Self::Rsa(cipher) => cipher.update(input),
        }
    }

    /// Finish the operation.
    ///
    /// The cipher is reset whatever the outcome and can be reused with the same key.
    pub fn do_final(&mut self, input: &[u8]) -> HResult<Vec<u8>> {
        match self {
            Self::Block(cipher) => cipher.do_final(input),
            Self::Rsa(cipher) => cipher.do_final(input),
        }
    }

    /// Add additional authenticated data, GCM only
    pub fn update_aad(&mut self, aad: &[u8]) -> HResult<()> {
        match self {
            Self::Block(cipher) => cipher.update_aad(aad),
            Self::Rsa(_) => Err(HError::IllegalState(
                "RSA ciphers take no additional authenticated data".to_owned(),
            )),
        }
    }

    /// Length of the output of `do_final(input_len)`, an upper bound when decrypting
    #[must_use]
    pub fn output_size(&self, input_len: usize) -> usize {
        match self {
            Self::Block(cipher) => cipher.output_size(input_len),
            Self::Rsa(cipher) => cipher.output_size(input_len),
        }
    }

    /// The IV in use, given or generated
    #[must_use]
    pub fn iv(&self) -> Option<&[u8]> {
        match self {
            Self::Block(cipher) => cipher.iv(),
            Self::Rsa(_) => None,
        }
    }

    #[must_use]
    pub const fn block_size(&self) -> usize {
        match self {
            Self::Block(cipher) => cipher.block_size(),
            Self::Rsa(_) => 0,
        }
    }

    /// Wrap a secret key, once initialized in [`CipherMode::Wrap`]
    pub fn wrap(&mut self, key: &Arc<TokenKey>) -> HResult<Vec<u8>> {
        match self {
            Self::Block(cipher) => cipher.wrap(key),
            Self::Rsa(cipher) => cipher.wrap(key),
        }
    }

    /// Unwrap a key, once initialized in [`CipherMode::Unwrap`]. Only secret keys can be
    /// unwrapped.
    pub fn unwrap(
        &mut self,
        wrapped: &[u8],
        algorithm: KeyAlgorithm,
        class: ObjectClass,
    ) -> HResult<Arc<TokenKey>> {
        match self {
            Self::Block(cipher) => cipher.unwrap(wrapped, algorithm, class),
            Self::Rsa(cipher) => cipher.unwrap(wrapped, algorithm, class),
        }
    }
}

fn check_unwrapped_class(algorithm: KeyAlgorithm, class: ObjectClass) -> HResult<()> {
    if class != ObjectClass::SecretKey || !algorithm.is_secret() {
        return Err(HError::InvalidKey(format!(
            "only secret keys can be unwrapped, not {algorithm} {class:?} keys"
        )));
    }
    Ok(())
}

/// Unwrap a secret key, trying the candidate key types in order while the unwrapped value has
/// the wrong length for the type
pub(crate) fn unwrap_secret_key(
    token: &Arc<Token>,
    mechanism: &Mechanism,
    unwrapping_key: &TokenKey,
    wrapped: &[u8],
    key_types: &[KeyType],
) -> HResult<Arc<TokenKey>> {
    let mut last_error = None;
    for key_type in key_types {
        let template = token.templates().resolve(
            TemplateOperation::Unwrap,
            ObjectClass::SecretKey,
            *key_type,
            vec![
                Attribute::Class(ObjectClass::SecretKey),
                Attribute::KeyType(*key_type),
                Attribute::Token(false),
            ],
        );
        let session = token.acquire_object_session()?;
        let handle = match hsm_call!(
            token,
            "unwrapping a key",
            unwrap_key,
            session.handle(),
            mechanism,
            unwrapping_key.handle(),
            wrapped,
            &template
        ) {
            Ok(handle) => handle,
            Err(e) if e.rv() == Some(Rv::WrappedKeyLenRange) => {
                trace!("unwrapped value is not a {key_type:?} key: {e}");
                last_error = Some(e);
                continue;
            }
            Err(e) => return Err(e),
        };
        let len = hsm_call!(
            token,
            "reading the length of an unwrapped key",
            get_attribute_value,
            session.handle(),
            handle,
            &[AttributeType::ValueLen]
        )
        .map(|attributes| {
            attributes
                .find(AttributeType::ValueLen)
                .and_then(Attribute::as_ulong)
        });
        let bits = match len {
            Ok(Some(len)) => usize::try_from(len)? * 8,
            Ok(None) | Err(_) => 0,
        };
        let properties =
            KeyProperties::from_template(&template, ObjectClass::SecretKey, *key_type, bits);
        return Ok(TokenKey::new(&session, handle, properties, None));
    }
    Err(last_error.unwrap_or_else(|| HError::InvalidKey("no candidate key type".to_owned())))
}

/// The token key types a wrapped key of `algorithm` may have, most likely first
fn unwrapped_key_types(algorithm: KeyAlgorithm, estimated_len: Option<usize>) -> HResult<Vec<KeyType>> {
    Ok(match (algorithm, estimated_len) {
        (KeyAlgorithm::DesEde, Some(len)) => vec![algorithm.key_type(len)?],
        (KeyAlgorithm::DesEde, None) => vec![KeyType::Des3, KeyType::Des2],
        _ => vec![algorithm.key_type(0)?],
    })
}
