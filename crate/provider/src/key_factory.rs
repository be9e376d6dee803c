//! Import of keys into the token.

use std::sync::Arc;

use openssl::sha::Sha256;
use tokenbridge_interfaces::{Attribute, ObjectClass};
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    HError, KeyAlgorithm,
    error::result::HResult,
    hsm_call,
    key::{KeyMaterial, KeyProperties, TokenKey},
    template::TemplateOperation,
    token::{KeyFingerprint, Token},
};

/// A key held outside of the token
#[derive(Debug, Clone)]
pub enum ExternalKey {
    /// Key components
    Structured(KeyMaterial),
    /// DER encoded X.509 `SubjectPublicKeyInfo`
    X509(Vec<u8>),
    /// DER encoded PKCS#8 `PrivateKeyInfo`
    Pkcs8(Zeroizing<Vec<u8>>),
}

/// Set odd parity on every byte of a DES key
pub(crate) fn fix_des_parity(key: &mut [u8]) {
    for byte in key.iter_mut() {
        if (*byte >> 1).count_ones() % 2 == 0 {
            *byte |= 0x01;
        } else {
            *byte &= 0xFE;
        }
    }
}

fn check_secret_length(algorithm: KeyAlgorithm, len: usize) -> HResult<()> {
    let valid = match algorithm {
        KeyAlgorithm::Aes => matches!(len, 16 | 24 | 32),
        KeyAlgorithm::Des => len == 8,
        KeyAlgorithm::DesEde => matches!(len, 16 | 24),
        KeyAlgorithm::Generic => len > 0,
        KeyAlgorithm::Rsa | KeyAlgorithm::Ec | KeyAlgorithm::Dsa | KeyAlgorithm::Dh => {
            return Err(HError::InvalidKey(format!(
                "{algorithm} keys are not secret keys"
            )));
        }
    };
    if valid {
        Ok(())
    } else {
        Err(HError::InvalidKey(format!(
            "invalid {algorithm} key length: {len} bytes"
        )))
    }
}

fn fingerprint(algorithm: KeyAlgorithm, material: &[u8]) -> KeyFingerprint {
    let mut hasher = Sha256::new();
    hasher.update(algorithm.to_string().as_bytes());
    hasher.update(&[0]);
    hasher.update(material);
    hasher.finish()
}

/// Imports keys into a token
pub struct KeyFactory {
    token: Arc<Token>,
}

impl KeyFactory {
    #[must_use]
    pub const fn new(token: Arc<Token>) -> Self {
        Self { token }
    }

    /// Import secret key material.
    ///
    /// The parity of DES keys is fixed. Importing the same material twice returns the key
    /// imported the first time, as long as it is held by the import cache of the token.
    pub fn import(&self, material: &[u8], algorithm: KeyAlgorithm) -> HResult<Arc<TokenKey>> {
        self.token.ensure_valid()?;
        check_secret_length(algorithm, material.len())?;
        let fingerprint = fingerprint(algorithm, material);
        if let Some(key) = self.token.secret_key_cache().get(&fingerprint) {
            debug!("{}: imported {algorithm} key found in cache", self.token.name());
            return Ok(key);
        }
        let mut value = Zeroizing::new(material.to_vec());
        if matches!(algorithm, KeyAlgorithm::Des | KeyAlgorithm::DesEde) {
            fix_des_parity(&mut value);
        }
        let key = self.create_key(algorithm, KeyMaterial::Secret(value))?;
        self.token
            .secret_key_cache()
            .insert(fingerprint, key.clone());
        Ok(key)
    }

    /// Import an asymmetric key, given by its components or encoded
    pub fn import_key(&self, key: ExternalKey) -> HResult<Arc<TokenKey>> {
        self.token.ensure_valid()?;
        let material = match key {
            ExternalKey::Structured(material) => material,
            ExternalKey::X509(der) => KeyMaterial::from_public_der(&der)?,
            ExternalKey::Pkcs8(der) => KeyMaterial::from_pkcs8_der(&der)?,
        };
        let algorithm = material.algorithm().ok_or_else(|| {
            HError::InvalidKey("secret keys are imported with their algorithm".to_owned())
        })?;
        self.create_key(algorithm, material)
    }

    /// Get a key of this token equivalent to `key`.
    ///
    /// Keys of another token are imported through their value, which must be readable.
    pub fn translate(&self, key: &Arc<TokenKey>) -> HResult<Arc<TokenKey>> {
        if key.belongs_to(&self.token) {
            return Ok(key.clone());
        }
        let material = key
            .material()
            .map_err(|e| HError::InvalidKey(format!("cannot translate the key: {e}")))?;
        match material {
            KeyMaterial::Secret(value) => self.import(value, key.algorithm()),
            material => self.create_key(key.algorithm(), material.clone()),
        }
    }

    fn create_key(&self, algorithm: KeyAlgorithm, material: KeyMaterial) -> HResult<Arc<TokenKey>> {
        let class = material.class();
        let key_type = algorithm.key_type(match &material {
            KeyMaterial::Secret(value) => value.len(),
            _ => 0,
        })?;
        let mut requested = material.to_attributes(key_type)?;
        requested.push(Attribute::Token(false));
        let template =
            self.token
                .templates()
                .resolve(TemplateOperation::Import, class, key_type, requested);
        let session = self.token.acquire_object_session()?;
        let handle = hsm_call!(
            self.token,
            "importing a key",
            create_object,
            session.handle(),
            &template
        )?;
        let properties = KeyProperties::from_template(&template, class, key_type, material.bits());
        debug!(
            "{}: imported {algorithm} {class:?} as object {handle}",
            self.token.name()
        );
        let readable = class == ObjectClass::PublicKey
            || (!properties.sensitive && properties.extractable);
        let material = readable.then_some(material);
        Ok(TokenKey::new(&session, handle, properties, material))
    }
}

#[cfg(test)]
mod tests {
    use super::fix_des_parity;

    #[test]
    fn test_des_parity() {
        let mut key = [0x01_u8, 0x00, 0xFE, 0xFF, 0x10, 0x11, 0x7E, 0x80];
        fix_des_parity(&mut key);
        assert_eq!(key, [0x01, 0x01, 0xFE, 0xFE, 0x10, 0x10, 0x7F, 0x80]);
        assert!(key.iter().all(|b| b.count_ones() % 2 == 1));
    }
}
