//! Algorithm names understood by the provider.

use std::{fmt, str::FromStr};

use strum::{Display, EnumString};
use tokenbridge_interfaces::{KeyType, Mechanism};

use crate::{HError, error::result::HResult};

/// Key algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum KeyAlgorithm {
    #[strum(to_string = "AES")]
    Aes,
    #[strum(to_string = "DES")]
    Des,
    #[strum(to_string = "DESede", serialize = "TripleDES")]
    DesEde,
    /// Generic secrets, used by MACs and key derivations
    #[strum(
        to_string = "Generic",
        serialize = "HmacMD5",
        serialize = "HmacSHA1",
        serialize = "HmacSHA224",
        serialize = "HmacSHA256",
        serialize = "HmacSHA384",
        serialize = "HmacSHA512"
    )]
    Generic,
    #[strum(to_string = "RSA")]
    Rsa,
    #[strum(to_string = "EC")]
    Ec,
    #[strum(to_string = "DSA")]
    Dsa,
    #[strum(to_string = "DH", serialize = "DiffieHellman")]
    Dh,
}

impl KeyAlgorithm {
    /// Parse an algorithm name
    pub fn parse(name: &str) -> HResult<Self> {
        name.parse()
            .map_err(|_| HError::NoSuchAlgorithm(format!("unknown key algorithm: {name}")))
    }

    #[must_use]
    pub const fn is_secret(self) -> bool {
        matches!(self, Self::Aes | Self::Des | Self::DesEde | Self::Generic)
    }

    /// The token key type of a key of this algorithm with `len` bytes of material
    pub fn key_type(self, len: usize) -> HResult<KeyType> {
        Ok(match self {
            Self::Aes => KeyType::Aes,
            Self::Des => KeyType::Des,
            Self::DesEde => match len {
                16 => KeyType::Des2,
                24 => KeyType::Des3,
                _ => {
                    return Err(HError::InvalidKey(format!(
                        "DESede keys are 16 or 24 bytes long, got {len}"
                    )));
                }
            },
            Self::Generic => KeyType::GenericSecret,
            Self::Rsa => KeyType::Rsa,
            Self::Ec => KeyType::Ec,
            Self::Dsa => KeyType::Dsa,
            Self::Dh => KeyType::Dh,
        })
    }

    #[must_use]
    pub const fn from_key_type(key_type: KeyType) -> Self {
        match key_type {
            KeyType::Aes => Self::Aes,
            KeyType::Des => Self::Des,
            KeyType::Des2 | KeyType::Des3 => Self::DesEde,
            KeyType::GenericSecret => Self::Generic,
            KeyType::Rsa => Self::Rsa,
            KeyType::Ec => Self::Ec,
            KeyType::Dsa => Self::Dsa,
            KeyType::Dh => Self::Dh,
        }
    }
}

/// Cipher algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum CipherAlgorithm {
    #[strum(to_string = "AES")]
    Aes,
    #[strum(to_string = "DES")]
    Des,
    #[strum(to_string = "DESede", serialize = "TripleDES")]
    DesEde,
    #[strum(to_string = "RSA")]
    Rsa,
}

impl CipherAlgorithm {
    /// Block size in bytes, 0 for RSA
    #[must_use]
    pub const fn block_size(self) -> usize {
        match self {
            Self::Aes => 16,
            Self::Des | Self::DesEde => 8,
            Self::Rsa => 0,
        }
    }

    #[must_use]
    pub const fn key_algorithm(self) -> KeyAlgorithm {
        match self {
            Self::Aes => KeyAlgorithm::Aes,
            Self::Des => KeyAlgorithm::Des,
            Self::DesEde => KeyAlgorithm::DesEde,
            Self::Rsa => KeyAlgorithm::Rsa,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum BlockMode {
    #[strum(to_string = "ECB", serialize = "NONE")]
    Ecb,
    #[strum(to_string = "CBC")]
    Cbc,
    #[strum(to_string = "CTR")]
    Ctr,
    #[strum(to_string = "GCM")]
    Gcm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum PaddingScheme {
    #[strum(to_string = "NoPadding")]
    NoPadding,
    #[strum(to_string = "PKCS5Padding")]
    Pkcs5,
    #[strum(to_string = "PKCS1Padding")]
    Pkcs1,
}

/// A cipher transformation `ALGORITHM[/MODE/PADDING]`, e.g. `AES/CBC/PKCS5Padding`.
///
/// A bare algorithm name uses ECB with PKCS#5 padding, PKCS#1 padding for RSA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CipherSpec {
    pub algorithm: CipherAlgorithm,
    pub mode: BlockMode,
    pub padding: PaddingScheme,
}

impl CipherSpec {
    #[must_use]
    pub const fn new(algorithm: CipherAlgorithm, mode: BlockMode, padding: PaddingScheme) -> Self {
        Self {
            algorithm,
            mode,
            padding,
        }
    }

    /// Block size used for buffering: 0 for stream modes and RSA
    #[must_use]
    pub const fn block_size(&self) -> usize {
        match self.mode {
            BlockMode::Ctr | BlockMode::Gcm => 0,
            BlockMode::Ecb | BlockMode::Cbc => self.algorithm.block_size(),
        }
    }

    /// Length of the IV of the mode, 0 when the mode takes no IV
    #[must_use]
    pub const fn iv_len(&self) -> usize {
        match self.mode {
            BlockMode::Ecb => 0,
            // GCM IVs are 96 bits whatever the block size
            BlockMode::Gcm => 12,
            BlockMode::Cbc | BlockMode::Ctr => self.algorithm.block_size(),
        }
    }

    #[must_use]
    pub fn padded(&self) -> bool {
        self.padding != PaddingScheme::NoPadding
    }

    fn validate(self) -> HResult<Self> {
        let supported = match (self.algorithm, self.mode, self.padding) {
            (CipherAlgorithm::Rsa, BlockMode::Ecb, PaddingScheme::Pkcs1 | PaddingScheme::NoPadding)
            | (
                CipherAlgorithm::Aes | CipherAlgorithm::Des | CipherAlgorithm::DesEde,
                BlockMode::Ecb | BlockMode::Cbc,
                PaddingScheme::NoPadding | PaddingScheme::Pkcs5,
            )
            | (CipherAlgorithm::Aes, BlockMode::Ctr | BlockMode::Gcm, PaddingScheme::NoPadding) => {
                true
            }
            _ => false,
        };
        if supported {
            Ok(self)
        } else {
            Err(HError::NoSuchAlgorithm(format!(
                "unsupported transformation: {self}"
            )))
        }
    }
}

impl fmt::Display for CipherSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.algorithm, self.mode, self.padding)
    }
}

impl FromStr for CipherSpec {
    type Err = HError;

    fn from_str(transformation: &str) -> Result<Self, Self::Err> {
        let unknown =
            || HError::NoSuchAlgorithm(format!("unknown transformation: {transformation}"));
        let parts: Vec<&str> = transformation.split('/').map(str::trim).collect();
        let spec = match parts.as_slice() {
            [algorithm] => {
                let algorithm: CipherAlgorithm = algorithm.parse().map_err(|_| unknown())?;
                let padding = if algorithm == CipherAlgorithm::Rsa {
                    PaddingScheme::Pkcs1
                } else {
                    PaddingScheme::Pkcs5
                };
                Self::new(algorithm, BlockMode::Ecb, padding)
            }
            [algorithm, mode, padding] => Self::new(
                algorithm.parse().map_err(|_| unknown())?,
                mode.parse().map_err(|_| unknown())?,
                padding.parse().map_err(|_| unknown())?,
            ),
            _ => return Err(unknown()),
        };
        spec.validate()
    }
}

/// Digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum DigestAlgorithm {
    #[strum(to_string = "MD5")]
    Md5,
    #[strum(to_string = "SHA-1", serialize = "SHA1", serialize = "SHA")]
    Sha1,
    #[strum(to_string = "SHA-224", serialize = "SHA224")]
    Sha224,
    #[strum(to_string = "SHA-256", serialize = "SHA256")]
    Sha256,
    #[strum(to_string = "SHA-384", serialize = "SHA384")]
    Sha384,
    #[strum(to_string = "SHA-512", serialize = "SHA512")]
    Sha512,
}

impl DigestAlgorithm {
    pub const ALL: [Self; 6] = [
        Self::Md5,
        Self::Sha1,
        Self::Sha224,
        Self::Sha256,
        Self::Sha384,
        Self::Sha512,
    ];

    pub fn parse(name: &str) -> HResult<Self> {
        name.parse()
            .map_err(|_| HError::NoSuchAlgorithm(format!("unknown digest algorithm: {name}")))
    }

    #[must_use]
    pub const fn mechanism(self) -> Mechanism {
        match self {
            Self::Md5 => Mechanism::Md5,
            Self::Sha1 => Mechanism::Sha1,
            Self::Sha224 => Mechanism::Sha224,
            Self::Sha256 => Mechanism::Sha256,
            Self::Sha384 => Mechanism::Sha384,
            Self::Sha512 => Mechanism::Sha512,
        }
    }

    /// Length of the digest in bytes
    #[must_use]
    pub const fn length(self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }
}
