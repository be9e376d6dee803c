use tokenbridge_interfaces::{BackendError, Rv};
use thiserror::Error;

pub(crate) mod result;

#[derive(Error, Debug)]
pub enum HError {
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Illegal block size: {0}")]
    IllegalBlockSize(String),

    #[error("Bad padding: {0}")]
    BadPadding(String),

    #[error("Digest error: {0}")]
    Digest(String),

    #[error("Token invalid: {0}")]
    TokenInvalid(String),

    #[error("No such algorithm: {0}")]
    NoSuchAlgorithm(String),

    #[error("{context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: BackendError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("OpenSSL Error: {0}")]
    OpenSsl(String),

    #[error("{0}")]
    Default(String),
}

impl HError {
    /// Classify an error returned by the token backend.
    ///
    /// Callers holding the token must invalidate it first when the error reports the removal
    /// of the device: see `Token::backend_error`.
    #[must_use]
    pub fn from_backend(context: &str, error: BackendError) -> Self {
        let message = format!("{context}: {error}");
        match error.rv {
            rv if rv.is_removal() => Self::TokenInvalid(message),
            Rv::DataLenRange | Rv::EncryptedDataLenRange => Self::IllegalBlockSize(message),
            Rv::EncryptedDataInvalid => Self::BadPadding(message),
            Rv::SessionCount => Self::ResourceExhausted(message),
            Rv::KeyHandleInvalid
            | Rv::KeyTypeInconsistent
            | Rv::KeySizeRange
            | Rv::KeyFunctionNotPermitted
            | Rv::KeyUnextractable
            | Rv::KeyNotWrappable => Self::InvalidKey(message),
            _ => Self::Backend {
                context: context.to_owned(),
                source: error,
            },
        }
    }

    /// The native return code, when the error comes from the backend
    #[must_use]
    pub const fn rv(&self) -> Option<Rv> {
        match self {
            Self::Backend { source, .. } => Some(source.rv),
            _ => None,
        }
    }
}

impl From<openssl::error::ErrorStack> for HError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Self::OpenSsl(format!("Error: {e}. Details: {e:?}"))
    }
}

impl From<toml::de::Error> for HError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<std::num::TryFromIntError> for HError {
    fn from(e: std::num::TryFromIntError) -> Self {
        Self::InvalidParameter(e.to_string())
    }
}

/// Return early with an error if a condition is not satisfied.
///
/// This macro is equivalent to `if !$cond { return Err(From::from($err)); }`.
#[macro_export]
macro_rules! hsm_ensure {
    ($cond:expr, $err:expr $(,)?) => {
        if !$cond {
            return ::core::result::Result::Err(::core::convert::From::from($err));
        }
    };
}

/// Return early with an error.
#[macro_export]
macro_rules! hsm_bail {
    ($err:expr $(,)?) => {
        return ::core::result::Result::Err(::core::convert::From::from($err))
    };
}

/// Call a function of the backend of a token, classifying a failure with the given context.
///
/// A failure reporting the removal of the device invalidates the token.
#[macro_export]
macro_rules! hsm_call {
    ($token:expr, $context:expr, $function:ident $(, $arg:expr)* $(,)?) => {
        $token
            .backend()
            .$function($($arg),*)
            .map_err(|e| $token.backend_error($context, e))
    };
}
