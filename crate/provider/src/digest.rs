//! Message digests computed by the token.
//!
//! Short messages are buffered and digested in a single call when the digest is requested.
//! Once the buffer would exceed the configured threshold the digest operation is started on
//! the token and the data is streamed to it.

use std::sync::Arc;

use tokenbridge_interfaces::{ObjectClass, SessionHandle};
use tracing::trace;
use zeroize::Zeroizing;

use crate::{
    DigestAlgorithm, HError, error::result::HResult, hsm_call, key::TokenKey,
    session::SessionGuard, token::Token,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DigestState {
    /// Nothing digested yet
    Blank,
    /// Data held by the buffer
    Buffered,
    /// Data streamed to the token
    Init,
}

pub struct Digest {
    token: Arc<Token>,
    algorithm: DigestAlgorithm,
    state: DigestState,
    buffer: Zeroizing<Vec<u8>>,
    threshold: usize,
    session: Option<SessionGuard>,
}

impl Digest {
    #[must_use]
    pub fn new(token: Arc<Token>, algorithm: DigestAlgorithm) -> Self {
        let threshold = token.config().digest_buffer_size;
        Self {
            token,
            algorithm,
            state: DigestState::Blank,
            buffer: Zeroizing::new(Vec::with_capacity(threshold)),
            threshold,
            session: None,
        }
    }

    /// Create a digest from an algorithm name such as `SHA-256`
    pub fn from_name(token: Arc<Token>, name: &str) -> HResult<Self> {
        Ok(Self::new(token, DigestAlgorithm::parse(name)?))
    }

    #[must_use]
    pub const fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Length of the digest in bytes
    #[must_use]
    pub const fn length(&self) -> usize {
        self.algorithm.length()
    }

    fn session_handle(&self) -> HResult<SessionHandle> {
        self.session
            .as_ref()
            .map(SessionGuard::handle)
            .ok_or_else(|| HError::IllegalState("no digest session".to_owned()))
    }

    /// Start the digest on the token with the buffered data
    fn start(&mut self) -> HResult<()> {
        if self.session.is_none() {
            self.session = Some(self.token.acquire_operation_session()?);
        }
        let session = self.session_handle()?;
        let mechanism = self.algorithm.mechanism();
        hsm_call!(self.token, "starting a digest", digest_init, session, &mechanism)?;
        self.state = DigestState::Init;
        if !self.buffer.is_empty() {
            hsm_call!(self.token, "digesting", digest_update, session, &self.buffer)?;
            self.buffer.clear();
        }
        trace!("{}: streaming to session {session}", self.algorithm);
        Ok(())
    }

    pub fn update(&mut self, data: &[u8]) -> HResult<()> {
        let result = self.update_impl(data);
        if result.is_err() {
            self.abort();
        }
        result
    }

    fn update_impl(&mut self, data: &[u8]) -> HResult<()> {
        self.token.ensure_valid()?;
        match self.state {
            DigestState::Blank | DigestState::Buffered
                if self.buffer.len() + data.len() <= self.threshold =>
            {
                self.buffer.extend_from_slice(data);
                self.state = DigestState::Buffered;
                Ok(())
            }
            DigestState::Blank | DigestState::Buffered => {
                self.start()?;
                self.stream(data)
            }
            DigestState::Init => self.stream(data),
        }
    }

    fn stream(&self, data: &[u8]) -> HResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let session = self.session_handle()?;
        hsm_call!(self.token, "digesting", digest_update, session, data)
    }

    /// Digest the value of a secret key.
    ///
    /// The value of a key of this token is digested on the token. Other keys are digested
    /// through their encoding.
    pub fn update_key(&mut self, key: &Arc<TokenKey>) -> HResult<()> {
        if key.class() != ObjectClass::SecretKey {
            return Err(HError::InvalidKey(format!(
                "only secret keys can be digested, got a {:?}",
                key.class()
            )));
        }
        if !key.belongs_to(&self.token) {
            let encoded = key.encoded().ok_or_else(|| {
                HError::InvalidKey("the value of the key cannot be read".to_owned())
            })?;
            return self.update(&encoded);
        }
        let result = self.digest_key_on_token(key);
        if result.is_err() {
            self.abort();
        }
        result
    }

    fn digest_key_on_token(&mut self, key: &TokenKey) -> HResult<()> {
        self.token.ensure_valid()?;
        if self.state != DigestState::Init {
            self.start()?;
        }
        let session = self.session_handle()?;
        hsm_call!(self.token, "digesting a key", digest_key, session, key.handle())
    }

    /// Finish the digest
    pub fn digest(&mut self) -> HResult<Vec<u8>> {
        let mut output = vec![0_u8; self.length()];
        let written = self.digest_into(&mut output)?;
        output.truncate(written);
        Ok(output)
    }

    /// Finish the digest into `output`, which must hold at least [`Self::length`] bytes.
    /// Returns the number of bytes written.
    pub fn digest_into(&mut self, output: &mut [u8]) -> HResult<usize> {
        if output.len() < self.length() {
            return Err(HError::Digest(format!(
                "{} digests are {} bytes long, the output holds {}",
                self.algorithm,
                self.length(),
                output.len()
            )));
        }
        let result = self.digest_impl(output);
        match &result {
            Ok(_) => self.clear(),
            Err(_) => self.abort(),
        }
        result
    }

    fn digest_impl(&mut self, output: &mut [u8]) -> HResult<usize> {
        self.token.ensure_valid()?;
        match self.state {
            DigestState::Blank | DigestState::Buffered => {
                let session = self.token.acquire_operation_session()?;
                let mechanism = self.algorithm.mechanism();
                hsm_call!(
                    self.token,
                    "digesting",
                    digest_single,
                    session.handle(),
                    &mechanism,
                    &self.buffer,
                    output
                )
            }
            DigestState::Init => {
                let session = self.session_handle()?;
                let written =
                    hsm_call!(self.token, "finishing a digest", digest_final, session, output);
                self.state = DigestState::Blank;
                written
            }
        }
    }

    /// Discard the data digested so far, cancelling the digest of the token
    pub fn reset(&mut self) {
        self.cancel();
        self.buffer.clear();
        self.session = None;
        self.state = DigestState::Buffered;
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.session = None;
        self.state = DigestState::Blank;
    }

    /// After a failure: the operation of the token is gone or cancelled
    fn abort(&mut self) {
        self.reset();
    }

    fn cancel(&mut self) {
        if self.state != DigestState::Init {
            return;
        }
        self.state = DigestState::Buffered;
        let Some(session) = self.session.take() else {
            return;
        };
        if !self.token.config().explicit_cancel && !session.session().has_objects() {
            session.kill();
            return;
        }
        let mut placeholder = vec![0_u8; self.length()];
        if let Err(e) = hsm_call!(
            self.token,
            "cancelling a digest",
            digest_final,
            session.handle(),
            &mut placeholder
        ) {
            trace!("{}: ignoring cancellation error: {e}", self.algorithm);
        }
    }
}

impl Drop for Digest {
    fn drop(&mut self) {
        self.cancel();
    }
}
