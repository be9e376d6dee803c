//! Copyright 2024 Cosmian Tech SAS

//! Cryptographic provider running ciphers, digests and key management on a session based
//! token.
//!
//! A [`Token`] wraps a [`tokenbridge_interfaces::TokenBackend`] and pools its sessions. Keys
//! created on the token are [`TokenKey`]s: the objects of session keys are destroyed once the
//! keys are dropped.

pub use algorithm::{
    BlockMode, CipherAlgorithm, CipherSpec, DigestAlgorithm, KeyAlgorithm, PaddingScheme,
};
pub use cipher::{BlockCipher, Cipher, CipherMode, RsaCipher};
pub use config::{SessionPoolConfig, TokenConfig};
pub use digest::Digest;
pub use error::{
    HError,
    result::{HResult, HResultHelper},
};
pub use key::{KeyMaterial, TokenKey};
pub use key_factory::{ExternalKey, KeyFactory};
pub use keygen::{GeneratedKey, KeyGenParams, KeyGenerator, KeyPair};
pub use session::{Session, SessionGuard, SessionManager, SessionStats};
pub use template::{TemplateEntry, TemplateManager, TemplateOperation};
pub use token::Token;

mod algorithm;
mod cipher;
mod config;
mod digest;
mod error;
mod key;
mod key_factory;
mod keygen;
mod session;
mod template;
mod token;
