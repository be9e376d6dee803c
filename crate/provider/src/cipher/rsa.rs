//! RSA cipher engine.
//!
//! The operation of the token depends on the direction and on the class of the key: encrypting
//! with a private key signs, decrypting with a public key recovers the data of a signature.
//! Input is buffered until the cipher is finished and processed in a single call.

use std::sync::Arc;

use tokenbridge_interfaces::{Mechanism, ObjectClass, Rv, SessionHandle};
use tracing::trace;
use zeroize::Zeroizing;

use crate::{
    HError, KeyAlgorithm, KeyFactory, PaddingScheme,
    cipher::{CipherMode, check_unwrapped_class, unwrap_secret_key, unwrapped_key_types},
    error::result::HResult,
    hsm_call,
    key::TokenKey,
    session::SessionGuard,
    token::Token,
};

/// Overhead of PKCS#1 v1.5 padding
const PKCS1_OVERHEAD: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RsaOperation {
    Encrypt,
    Decrypt,
    Sign,
    VerifyRecover,
}

impl RsaOperation {
    fn select(mode: CipherMode, class: ObjectClass) -> HResult<Self> {
        Ok(match (mode, class) {
            (CipherMode::Encrypt | CipherMode::Wrap, ObjectClass::PublicKey) => Self::Encrypt,
            (CipherMode::Encrypt, ObjectClass::PrivateKey) => Self::Sign,
            (CipherMode::Decrypt | CipherMode::Unwrap, ObjectClass::PrivateKey) => Self::Decrypt,
            (CipherMode::Decrypt, ObjectClass::PublicKey) => Self::VerifyRecover,
            (mode, class) => {
                return Err(HError::InvalidKey(format!(
                    "cannot {mode:?} with an RSA {class:?}"
                )));
            }
        })
    }

    const fn pads_input(self) -> bool {
        matches!(self, Self::Encrypt | Self::Sign)
    }
}

pub struct RsaCipher {
    token: Arc<Token>,
    padding: PaddingScheme,
    mode: Option<CipherMode>,
    operation: RsaOperation,
    key: Option<Arc<TokenKey>>,
    /// Length of the modulus in bytes
    key_len: usize,
    max_input: usize,
    buffer: Zeroizing<Vec<u8>>,
    overflow: bool,
    session: Option<SessionGuard>,
    initialized: bool,
}

impl RsaCipher {
    #[must_use]
    pub fn new(token: Arc<Token>, padding: PaddingScheme) -> Self {
        Self {
            token,
            padding,
            mode: None,
            operation: RsaOperation::Encrypt,
            key: None,
            key_len: 0,
            max_input: 0,
            buffer: Zeroizing::new(Vec::new()),
            overflow: false,
            session: None,
            initialized: false,
        }
    }

    const fn mechanism(&self) -> Mechanism {
        match self.padding {
            PaddingScheme::Pkcs1 => Mechanism::RsaPkcs,
            PaddingScheme::NoPadding | PaddingScheme::Pkcs5 => Mechanism::RsaX509,
        }
    }

    pub fn init(
        &mut self,
        mode: CipherMode,
        key: &Arc<TokenKey>,
        iv: Option<&[u8]>,
    ) -> HResult<()> {
        self.reset(true);
        self.mode = None;
        if iv.is_some() {
            return Err(HError::InvalidParameter("RSA takes no IV".to_owned()));
        }
        self.token.ensure_valid()?;
        let key = KeyFactory::new(self.token.clone()).translate(key)?;
        if key.algorithm() != KeyAlgorithm::Rsa {
            return Err(HError::InvalidKey(format!(
                "RSA requires an RSA key, got a {} key",
                key.algorithm()
            )));
        }
        let operation = RsaOperation::select(mode, key.class())?;
        self.key_len = key.byte_len();
        self.max_input = if self.padding == PaddingScheme::Pkcs1 && operation.pads_input() {
            self.key_len.saturating_sub(PKCS1_OVERHEAD)
        } else {
            self.key_len
        };
        trace!(
            "RSA {operation:?} with a {} bits key, at most {} bytes",
            key.bits(),
            self.max_input
        );
        self.operation = operation;
        self.mode = Some(mode);
        self.key = Some(key);
        if matches!(mode, CipherMode::Encrypt | CipherMode::Decrypt) {
            self.initialize()?;
        }
        Ok(())
    }

    fn key(&self) -> HResult<&Arc<TokenKey>> {
        self.key
            .as_ref()
            .ok_or_else(|| HError::IllegalState("cipher not initialized".to_owned()))
    }

    fn session_handle(&self) -> HResult<SessionHandle> {
        self.session
            .as_ref()
            .map(SessionGuard::handle)
            .ok_or_else(|| HError::IllegalState("no session".to_owned()))
    }

    fn initialize(&mut self) -> HResult<()> {
        if self.initialized {
            return Ok(());
        }
        if self.session.is_none() {
            self.session = Some(self.token.acquire_operation_session()?);
        }
        let session = self.session_handle()?;
        let key = self.key()?.handle();
        let mechanism = self.mechanism();
        match self.operation {
            RsaOperation::Encrypt => {
                hsm_call!(self.token, "starting an RSA encryption", encrypt_init, session, &mechanism, key)
            }
            RsaOperation::Decrypt => {
                hsm_call!(self.token, "starting an RSA decryption", decrypt_init, session, &mechanism, key)
            }
            RsaOperation::Sign => {
                hsm_call!(self.token, "starting an RSA signature", sign_init, session, &mechanism, key)
            }
            RsaOperation::VerifyRecover => hsm_call!(
                self.token,
                "starting an RSA signature recovery",
                verify_recover_init,
                session,
                &mechanism,
                key
            ),
        }?;
        self.initialized = true;
        Ok(())
    }

    fn check_data_mode(&self) -> HResult<()> {
        match self.mode {
            Some(CipherMode::Encrypt | CipherMode::Decrypt) => Ok(()),
            Some(mode) => Err(HError::IllegalState(format!(
                "cipher initialized for {mode:?}"
            ))),
            None => Err(HError::IllegalState("cipher not initialized".to_owned())),
        }
    }

    /// Buffer input. Nothing is output before the cipher is finished.
    pub fn update(&mut self, input: &[u8]) -> HResult<Vec<u8>> {
        self.check_data_mode()?;
        if self.buffer.len() + input.len() > self.max_input {
            self.overflow = true;
        } else {
            self.buffer.extend_from_slice(input);
        }
        Ok(Vec::new())
    }

    pub fn do_final(&mut self, input: &[u8]) -> HResult<Vec<u8>> {
        self.update(input)?;
        if let Err(e) = self.token.ensure_valid() {
            self.reset(false);
            return Err(e);
        }
        let result = self.final_impl();
        match &result {
            Ok(_) => self.reset(false),
            Err(_) => self.reset(true),
        }
        result
    }

    fn final_impl(&mut self) -> HResult<Vec<u8>> {
        if self.overflow {
            return Err(HError::IllegalBlockSize(format!(
                "RSA input is limited to {} bytes",
                self.max_input
            )));
        }
        self.initialize()?;
        let data = std::mem::take(&mut self.buffer);
        let session = self.session_handle()?;
        let mut output = vec![0_u8; self.key_len];
        let written = match self.operation {
            RsaOperation::Encrypt => {
                hsm_call!(self.token, "RSA encryption", encrypt, session, &data, &mut output)
            }
            RsaOperation::Decrypt => {
                hsm_call!(self.token, "RSA decryption", decrypt, session, &data, &mut output)
            }
            RsaOperation::Sign => {
                hsm_call!(self.token, "RSA signature", sign, session, &data, &mut output)
            }
            RsaOperation::VerifyRecover => hsm_call!(
                self.token,
                "RSA signature recovery",
                verify_recover,
                session,
                &data,
                &mut output
            ),
        };
        self.initialized = matches!(&written, Err(e) if e.rv() == Some(Rv::BufferTooSmall));
        output.truncate(written?);
        Ok(output)
    }

    /// The length of the modulus: RSA outputs at most one block
    #[must_use]
    pub const fn output_size(&self, _input_len: usize) -> usize {
        self.key_len
    }

    fn reset(&mut self, cancel: bool) {
        if cancel && self.initialized {
            self.cancel();
        }
        self.initialized = false;
        self.session = None;
        self.buffer = Zeroizing::new(Vec::new());
        self.overflow = false;
    }

    /// Terminate the operation of the token with a throw away single-part call, or close the
    /// session when it owns no objects
    fn cancel(&mut self) {
        self.initialized = false;
        let Some(session) = self.session.take() else {
            return;
        };
        if !self.token.config().explicit_cancel && !session.session().has_objects() {
            session.kill();
            return;
        }
        let input = vec![
            0_u8;
            if self.operation.pads_input() {
                self.max_input
            } else {
                self.key_len
            }
        ];
        let mut output = vec![0_u8; self.key_len];
        let handle = session.handle();
        let result = match self.operation {
            RsaOperation::Encrypt => {
                hsm_call!(self.token, "cancelling", encrypt, handle, &input, &mut output)
            }
            RsaOperation::Decrypt => {
                hsm_call!(self.token, "cancelling", decrypt, handle, &input, &mut output)
            }
            RsaOperation::Sign => hsm_call!(self.token, "cancelling", sign, handle, &input, &mut output),
            RsaOperation::VerifyRecover => {
                hsm_call!(self.token, "cancelling", verify_recover, handle, &input, &mut output)
            }
        };
        if let Err(e) = result {
            trace!("RSA: ignoring cancellation error: {e}");
        }
    }

    /// Wrap a secret key with a public key
    pub fn wrap(&mut self, key: &Arc<TokenKey>) -> HResult<Vec<u8>> {
        if self.mode != Some(CipherMode::Wrap) {
            return Err(HError::IllegalState(
                "cipher not initialized for wrapping".to_owned(),
            ));
        }
        let key = KeyFactory::new(self.token.clone()).translate(key)?;
        if key.class() != ObjectClass::SecretKey {
            return Err(HError::InvalidKey("RSA can only wrap secret keys".to_owned()));
        }
        let wrapping_key = self.key()?.handle();
        let session = self.token.acquire_operation_session()?;
        hsm_call!(
            self.token,
            "wrapping a key",
            wrap_key,
            session.handle(),
            &self.mechanism(),
            wrapping_key,
            key.handle()
        )
    }

    /// Unwrap a secret key with a private key
    pub fn unwrap(
        &mut self,
        wrapped: &[u8],
        algorithm: KeyAlgorithm,
        class: ObjectClass,
    ) -> HResult<Arc<TokenKey>> {
        if self.mode != Some(CipherMode::Unwrap) {
            return Err(HError::IllegalState(
                "cipher not initialized for unwrapping".to_owned(),
            ));
        }
        check_unwrapped_class(algorithm, class)?;
        let key_types = unwrapped_key_types(algorithm, None)?;
        let unwrapping_key = self.key()?.clone();
        unwrap_secret_key(
            &self.token,
            &self.mechanism(),
            &unwrapping_key,
            wrapped,
            &key_types,
        )
    }
}

impl Drop for RsaCipher {
    fn drop(&mut self) {
        self.reset(true);
    }
}
