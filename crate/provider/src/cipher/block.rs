//! Block cipher engine: AES, DES and DESede in ECB, CBC, CTR and GCM modes.
//!
//! The backend operation is initialized lazily, on the first call that sends data to the token.
//! With PKCS#5 padding the engine pads and unpads itself and only ever sends complete blocks,
//! keeping the last block of a decryption until the final call. Without padding the token
//! buffers incomplete blocks. GCM operations run in a single call when the cipher is finished.

use std::sync::Arc;

use tokenbridge_interfaces::{GcmParams, Mechanism, ObjectClass, ObjectHandle, Rv};
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::{
    BlockMode, CipherAlgorithm, CipherSpec, HError, KeyAlgorithm, KeyFactory,
    cipher::{CipherMode, check_unwrapped_class, padding, unwrap_secret_key, unwrapped_key_types},
    error::result::HResult,
    hsm_call,
    key::TokenKey,
    session::SessionGuard,
    token::Token,
};

const GCM_TAG_BITS: usize = 128;
const GCM_TAG_LEN: usize = GCM_TAG_BITS / 8;

pub struct BlockCipher {
    token: Arc<Token>,
    spec: CipherSpec,
    mode: Option<CipherMode>,
    key: Option<Arc<TokenKey>>,
    iv: Option<Vec<u8>>,
    session: Option<SessionGuard>,
    /// An operation is active on the session
    initialized: bool,
    /// The cipher must be initialized again before being used
    requires_reinit: bool,
    /// Bytes held by the token, not a multiple of the block size
    token_buffered: usize,
    /// Bytes held by the engine for padding
    pad_buffer: Zeroizing<Vec<u8>>,
    /// GCM input, processed at once
    aead_buffer: Zeroizing<Vec<u8>>,
    aad: Vec<u8>,
    /// Key and IV of the last GCM encryption
    last_gcm: Option<(ObjectHandle, Vec<u8>)>,
}

impl BlockCipher {
    #[must_use]
    pub fn new(token: Arc<Token>, spec: CipherSpec) -> Self {
        Self {
            token,
            spec,
            mode: None,
            key: None,
            iv: None,
            session: None,
            initialized: false,
            requires_reinit: false,
            token_buffered: 0,
            pad_buffer: Zeroizing::new(Vec::new()),
            aead_buffer: Zeroizing::new(Vec::new()),
            aad: Vec::new(),
            last_gcm: None,
        }
    }

    #[must_use]
    pub const fn spec(&self) -> CipherSpec {
        self.spec
    }

    /// Block size of the algorithm
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.spec.algorithm.block_size()
    }

    #[must_use]
    pub fn iv(&self) -> Option<&[u8]> {
        self.iv.as_deref()
    }

    fn is_gcm(&self) -> bool {
        self.spec.mode == BlockMode::Gcm
    }

    /// Software padding applies to data operations in block modes
    fn engine_pads(&self) -> bool {
        self.spec.padded() && self.spec.block_size() > 0
    }

    fn encrypting(&self) -> bool {
        self.mode.is_some_and(CipherMode::is_encrypting)
    }

    pub fn init(
        &mut self,
        mode: CipherMode,
        key: &Arc<TokenKey>,
        iv: Option<&[u8]>,
    ) -> HResult<()> {
        self.reset(true);
        self.mode = None;
        self.token.ensure_valid()?;

        let key = KeyFactory::new(self.token.clone()).translate(key)?;
        let expected = self.spec.algorithm.key_algorithm();
        if key.class() != ObjectClass::SecretKey || key.algorithm() != expected {
            return Err(HError::InvalidKey(format!(
                "{} requires a {expected} secret key, got a {} {:?} key",
                self.spec,
                key.algorithm(),
                key.class()
            )));
        }

        let iv_len = self.spec.iv_len();
        let iv = match (iv, iv_len) {
            (Some(_), 0) => {
                return Err(HError::InvalidParameter(format!(
                    "{} takes no IV",
                    self.spec
                )));
            }
            (None, 0) => None,
            (Some(iv), len) => {
                if iv.len() != len {
                    return Err(HError::InvalidParameter(format!(
                        "{} requires a {len} bytes IV, got {}",
                        self.spec,
                        iv.len()
                    )));
                }
                Some(iv.to_vec())
            }
            (None, len) => {
                if !mode.is_encrypting() {
                    return Err(HError::InvalidParameter(format!(
                        "{} requires an IV to decrypt",
                        self.spec
                    )));
                }
                Some(self.token.generate_random(len)?)
            }
        };

        if self.is_gcm() && mode.is_encrypting() {
            if let (Some((handle, last_iv)), Some(iv)) = (&self.last_gcm, &iv) {
                if *handle == key.handle() && last_iv == iv {
                    return Err(HError::InvalidParameter(
                        "cannot reuse the key and IV of the last GCM encryption".to_owned(),
                    ));
                }
            }
        }

        trace!("{}: {mode:?} with key {}", self.spec, key.handle());
        self.mode = Some(mode);
        self.key = Some(key);
        self.iv = iv;
        self.requires_reinit = false;
        Ok(())
    }

    fn key(&self) -> HResult<&Arc<TokenKey>> {
        self.key
            .as_ref()
            .ok_or_else(|| HError::IllegalState("cipher not initialized".to_owned()))
    }

    fn iv_bytes(&self) -> Vec<u8> {
        self.iv.clone().unwrap_or_default()
    }

    /// The mechanism of the token, with the padding of the token for key wrapping
    fn mechanism(&self, token_pads: bool) -> HResult<Mechanism> {
        let unsupported = || {
            HError::InvalidParameter(format!(
                "{} is not supported by the token for this operation",
                self.spec
            ))
        };
        Ok(match (self.spec.algorithm, self.spec.mode, token_pads) {
            (CipherAlgorithm::Aes, BlockMode::Ecb, false) => Mechanism::AesEcb,
            (CipherAlgorithm::Aes, BlockMode::Cbc, false) => Mechanism::AesCbc(self.iv_bytes()),
            (CipherAlgorithm::Aes, BlockMode::Cbc, true) => Mechanism::AesCbcPad(self.iv_bytes()),
            (CipherAlgorithm::Aes, BlockMode::Ctr, false) => Mechanism::AesCtr(self.iv_bytes()),
            (CipherAlgorithm::Aes, BlockMode::Gcm, false) => Mechanism::AesGcm(GcmParams {
                iv: self.iv_bytes(),
                aad: self.aad.clone(),
                tag_bits: GCM_TAG_BITS,
            }),
            (CipherAlgorithm::Des, BlockMode::Ecb, false) => Mechanism::DesEcb,
            (CipherAlgorithm::Des, BlockMode::Cbc, false) => Mechanism::DesCbc(self.iv_bytes()),
            (CipherAlgorithm::Des, BlockMode::Cbc, true) => Mechanism::DesCbcPad(self.iv_bytes()),
            (CipherAlgorithm::DesEde, BlockMode::Ecb, false) => Mechanism::Des3Ecb,
            (CipherAlgorithm::DesEde, BlockMode::Cbc, false) => {
                Mechanism::Des3Cbc(self.iv_bytes())
            }
            (CipherAlgorithm::DesEde, BlockMode::Cbc, true) => {
                Mechanism::Des3CbcPad(self.iv_bytes())
            }
            _ => return Err(unsupported()),
        })
    }

    fn check_data_mode(&self) -> HResult<()> {
        match self.mode {
            Some(CipherMode::Encrypt | CipherMode::Decrypt) if !self.requires_reinit => Ok(()),
            Some(CipherMode::Encrypt | CipherMode::Decrypt) => Err(HError::IllegalState(
                "the cipher must be initialized again after a GCM encryption".to_owned(),
            )),
            Some(mode) => Err(HError::IllegalState(format!(
                "cipher initialized for {mode:?}"
            ))),
            None => Err(HError::IllegalState("cipher not initialized".to_owned())),
        }
    }

    fn session_handle(&self) -> HResult<tokenbridge_interfaces::SessionHandle> {
        self.session
            .as_ref()
            .map(SessionGuard::handle)
            .ok_or_else(|| HError::IllegalState("no session".to_owned()))
    }

    /// Start the operation on the token if needed
    fn ensure_initialized(&mut self) -> HResult<()> {
        if self.initialized {
            return Ok(());
        }
        let mechanism = self.mechanism(false)?;
        let key = self.key()?.handle();
        if self.session.is_none() {
            self.session = Some(self.token.acquire_operation_session()?);
        }
        let session = self.session_handle()?;
        if self.encrypting() {
            hsm_call!(self.token, "starting an encryption", encrypt_init, session, &mechanism, key)?;
        } else {
            hsm_call!(self.token, "starting a decryption", decrypt_init, session, &mechanism, key)?;
        }
        self.initialized = true;
        Ok(())
    }

    /// Send `data` to the token, expecting `expected` bytes back
    fn token_update(&mut self, data: &[u8], expected: usize) -> HResult<Vec<u8>> {
        self.ensure_initialized()?;
        let session = self.session_handle()?;
        let mut output = vec![0_u8; expected];
        let written = if self.encrypting() {
            hsm_call!(self.token, "encrypting", encrypt_update, session, data, &mut output)
        } else {
            hsm_call!(self.token, "decrypting", decrypt_update, session, data, &mut output)
        };
        let written = self.terminated_on_error(written)?;
        output.truncate(written);
        Ok(output)
    }

    /// Finish the operation of the token, expecting at most `expected` bytes back
    fn token_final(&mut self, expected: usize) -> HResult<Vec<u8>> {
        let session = self.session_handle()?;
        let mut output = vec![0_u8; expected];
        let written = if self.encrypting() {
            hsm_call!(self.token, "finishing an encryption", encrypt_final, session, &mut output)
        } else {
            hsm_call!(self.token, "finishing a decryption", decrypt_final, session, &mut output)
        };
        self.initialized = matches!(&written, Err(e) if e.rv() == Some(Rv::BufferTooSmall));
        output.truncate(written?);
        Ok(output)
    }

    /// Run a single-part operation on the token
    fn token_single(&mut self, data: &[u8], expected: usize) -> HResult<Vec<u8>> {
        self.ensure_initialized()?;
        let session = self.session_handle()?;
        let mut output = vec![0_u8; expected];
        let written = if self.encrypting() {
            hsm_call!(self.token, "encrypting", encrypt, session, data, &mut output)
        } else {
            hsm_call!(self.token, "decrypting", decrypt, session, data, &mut output)
        };
        self.initialized = matches!(&written, Err(e) if e.rv() == Some(Rv::BufferTooSmall));
        output.truncate(written?);
        Ok(output)
    }

    /// Any failure but a too small buffer terminates the operation of the token
    fn terminated_on_error<T>(&mut self, result: HResult<T>) -> HResult<T> {
        if let Err(e) = &result {
            if e.rv() != Some(Rv::BufferTooSmall) {
                self.initialized = false;
            }
        }
        result
    }

    /// Add additional authenticated data, before any data
    pub fn update_aad(&mut self, aad: &[u8]) -> HResult<()> {
        self.check_data_mode()?;
        if !self.is_gcm() {
            return Err(HError::IllegalState(format!(
                "{} takes no additional authenticated data",
                self.spec
            )));
        }
        if !self.aead_buffer.is_empty() {
            return Err(HError::IllegalState(
                "additional authenticated data must be supplied before the data".to_owned(),
            ));
        }
        self.aad.extend_from_slice(aad);
        Ok(())
    }

    pub fn update(&mut self, input: &[u8]) -> HResult<Vec<u8>> {
        self.check_data_mode()?;
        if let Err(e) = self.token.ensure_valid() {
            self.reset(false);
            return Err(e);
        }
        let result = self.update_impl(input);
        if result.is_err() {
            self.reset(true);
        }
        result
    }

    fn update_impl(&mut self, input: &[u8]) -> HResult<Vec<u8>> {
        if self.is_gcm() {
            self.aead_buffer.extend_from_slice(input);
            return Ok(Vec::new());
        }
        let block_size = self.spec.block_size();
        if block_size == 0 {
            // counter mode
            if input.is_empty() {
                return Ok(Vec::new());
            }
            return self.token_update(input, input.len());
        }
        if self.engine_pads() {
            let total = self.pad_buffer.len() + input.len();
            let mut kept = total % block_size;
            // the last block of a decryption holds the padding
            if !self.encrypting() && kept == 0 && total > 0 {
                kept = block_size;
            }
            let sent = total - kept;
            if sent == 0 {
                self.pad_buffer.extend_from_slice(input);
                return Ok(Vec::new());
            }
            let mut data = Zeroizing::new(Vec::with_capacity(total));
            data.extend_from_slice(&self.pad_buffer);
            data.extend_from_slice(input);
            let output = self.token_update(&data[..sent], sent)?;
            self.pad_buffer = Zeroizing::new(data[sent..].to_vec());
            Ok(output)
        } else {
            let total = self.token_buffered + input.len();
            let expected = total - total % block_size;
            if input.is_empty() {
                return Ok(Vec::new());
            }
            let output = self.token_update(input, expected)?;
            self.token_buffered = total % block_size;
            Ok(output)
        }
    }

    pub fn do_final(&mut self, input: &[u8]) -> HResult<Vec<u8>> {
        self.check_data_mode()?;
        if let Err(e) = self.token.ensure_valid() {
            self.reset(false);
            return Err(e);
        }
        let result = self.final_impl(input);
        match &result {
            Ok(_) => self.reset(false),
            Err(e) => {
                debug!("{}: final failed: {e}", self.spec);
                self.reset(true);
            }
        }
        result
    }

    fn final_impl(&mut self, input: &[u8]) -> HResult<Vec<u8>> {
        if self.is_gcm() {
            return self.gcm_final(input);
        }
        let block_size = self.spec.block_size();
        if block_size == 0 {
            if self.initialized {
                let mut output = self.token_update(input, input.len())?;
                output.extend(self.token_final(0)?);
                return Ok(output);
            }
            return self.token_single(input, input.len());
        }

        if !self.engine_pads() {
            let total = self.token_buffered + input.len();
            if total % block_size != 0 {
                return Err(HError::IllegalBlockSize(format!(
                    "{}: {total} bytes is not a multiple of the block size {block_size}",
                    self.spec
                )));
            }
            if self.initialized {
                let mut output = self.token_update(input, total)?;
                output.extend(self.token_final(0)?);
                return Ok(output);
            }
            if total == 0 {
                return Ok(Vec::new());
            }
            return self.token_single(input, total);
        }

        let mut data = Zeroizing::new(Vec::with_capacity(self.pad_buffer.len() + input.len()));
        data.extend_from_slice(&self.pad_buffer);
        data.extend_from_slice(input);
        if self.encrypting() {
            padding::pad(&mut data, block_size);
        } else if data.len() % block_size != 0 {
            return Err(HError::IllegalBlockSize(format!(
                "{}: {} bytes of ciphertext is not a multiple of the block size {block_size}",
                self.spec,
                data.len()
            )));
        } else if data.is_empty() {
            if self.initialized {
                self.token_final(0)?;
            }
            return Ok(Vec::new());
        }

        let len = data.len();
        let mut output = if self.initialized {
            let mut output = self.token_update(&data, len)?;
            output.extend(self.token_final(0)?);
            output
        } else {
            self.token_single(&data, len)?
        };
        if !self.encrypting() {
            let unpadded = padding::unpadded_len(&output, block_size)?;
            output.truncate(unpadded);
        }
        Ok(output)
    }

    fn gcm_final(&mut self, input: &[u8]) -> HResult<Vec<u8>> {
        self.aead_buffer.extend_from_slice(input);
        let data = std::mem::take(&mut self.aead_buffer);
        let expected = if self.encrypting() {
            data.len() + GCM_TAG_LEN
        } else {
            if data.len() < GCM_TAG_LEN {
                return Err(HError::IllegalBlockSize(format!(
                    "{}: {} bytes is shorter than the tag",
                    self.spec,
                    data.len()
                )));
            }
            data.len() - GCM_TAG_LEN
        };
        let output = self.token_single(&data, expected);
        if self.encrypting() && output.is_ok() {
            let key = self.key()?.handle();
            self.last_gcm = Some((key, self.iv_bytes()));
            self.requires_reinit = true;
        }
        output
    }

    /// Length of the output of `do_final(input_len)`
    #[must_use]
    pub fn output_size(&self, input_len: usize) -> usize {
        let total =
            input_len + self.token_buffered + self.pad_buffer.len() + self.aead_buffer.len();
        if self.is_gcm() {
            return if self.encrypting() {
                total + GCM_TAG_LEN
            } else {
                total.saturating_sub(GCM_TAG_LEN)
            };
        }
        let block_size = self.spec.block_size();
        if self.engine_pads() && self.encrypting() {
            (total / block_size + 1) * block_size
        } else {
            total
        }
    }

    /// Reset the buffers and release the session.
    /// With `cancel` the operation in progress on the token is cancelled first.
    fn reset(&mut self, cancel: bool) {
        if cancel && self.initialized {
            self.cancel();
        }
        self.initialized = false;
        self.session = None;
        self.token_buffered = 0;
        self.pad_buffer = Zeroizing::new(Vec::new());
        self.aead_buffer = Zeroizing::new(Vec::new());
        self.aad.clear();
    }

    /// Bring the session back to an idle state.
    ///
    /// The operation is finished with a throw away buffer, unless the session can be closed.
    /// A session owning objects cannot be closed.
    fn cancel(&mut self) {
        self.initialized = false;
        let Some(session) = self.session.take() else {
            return;
        };
        if !self.token.config().explicit_cancel && !session.session().has_objects() {
            trace!("{}: closing session {} to cancel", self.spec, session.handle());
            session.kill();
            return;
        }
        let mut placeholder = vec![0_u8; self.token_buffered];
        let result = if self.encrypting() {
            hsm_call!(self.token, "cancelling", encrypt_final, session.handle(), &mut placeholder)
        } else {
            hsm_call!(self.token, "cancelling", decrypt_final, session.handle(), &mut placeholder)
        };
        if let Err(e) = result {
            trace!("{}: ignoring cancellation error: {e}", self.spec);
        }
    }

    pub fn wrap(&mut self, key: &Arc<TokenKey>) -> HResult<Vec<u8>> {
        if self.mode != Some(CipherMode::Wrap) {
            return Err(HError::IllegalState(
                "cipher not initialized for wrapping".to_owned(),
            ));
        }
        if matches!(self.spec.mode, BlockMode::Ctr | BlockMode::Gcm) {
            return Err(HError::InvalidParameter(format!(
                "{} cannot wrap keys",
                self.spec
            )));
        }
        let key = KeyFactory::new(self.token.clone()).translate(key)?;
        if key.class() != ObjectClass::SecretKey {
            return Err(HError::InvalidKey(format!(
                "{} can only wrap secret keys",
                self.spec
            )));
        }
        let mechanism = self.mechanism(self.spec.padded())?;
        let wrapping_key = self.key()?.handle();
        let session = self.token.acquire_operation_session()?;
        hsm_call!(
            self.token,
            "wrapping a key",
            wrap_key,
            session.handle(),
            &mechanism,
            wrapping_key,
            key.handle()
        )
    }

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
        if matches!(self.spec.mode, BlockMode::Ctr | BlockMode::Gcm) {
            return Err(HError::InvalidParameter(format!(
                "{} cannot unwrap keys",
                self.spec
            )));
        }
        check_unwrapped_class(algorithm, class)?;
        // secret keys fill whole blocks: the padding takes a full block
        let estimated_len = if self.spec.padded() {
            wrapped.len().saturating_sub(self.block_size())
        } else {
            wrapped.len()
        };
        let key_types = unwrapped_key_types(algorithm, Some(estimated_len))?;
        let mechanism = self.mechanism(self.spec.padded())?;
        let unwrapping_key = self.key()?.clone();
        unwrap_secret_key(&self.token, &mechanism, &unwrapping_key, wrapped, &key_types)
    }
}

impl Drop for BlockCipher {
    fn drop(&mut self) {
        self.reset(true);
    }
}
