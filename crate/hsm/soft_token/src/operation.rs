//! Active cryptographic operations of a session.

use openssl::{
    hash::{Hasher, MessageDigest},
    rsa::Padding,
    symm::{Cipher, Crypter, Mode, decrypt_aead, encrypt_aead},
};
use tokenbridge_interfaces::{GcmParams, KeyType, Mechanism, ObjectClass, Rv};
use zeroize::Zeroizing;

use crate::object::{RsaKey, StoredObject};

/// The operation currently active on a session
pub(crate) enum Operation {
    Encrypt(CipherOperation),
    Decrypt(CipherOperation),
    Sign(CipherOperation),
    VerifyRecover(CipherOperation),
    Digest(DigestOperation),
}

impl Operation {
    pub(crate) const fn name(&self) -> &'static str {
        match self {
            Self::Encrypt(_) => "encrypt",
            Self::Decrypt(_) => "decrypt",
            Self::Sign(_) => "sign",
            Self::VerifyRecover(_) => "verify_recover",
            Self::Digest(_) => "digest",
        }
    }
}

/// Direction of a cipher operation
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Encrypt,
    Decrypt,
    Sign,
    VerifyRecover,
}

pub(crate) enum CipherOperation {
    Block(BlockCipher),
    Gcm(GcmCipher),
    Rsa(RsaCipher),
}

pub(crate) struct BlockCipher {
    crypter: Crypter,
    block_size: usize,
    buffered: usize,
    padding: bool,
    encrypt: bool,
}

pub(crate) struct GcmCipher {
    cipher: Cipher,
    key: Zeroizing<Vec<u8>>,
    params: GcmParams,
    encrypt: bool,
}

pub(crate) struct RsaCipher {
    key: RsaKey,
    padding: Padding,
    direction: Direction,
}

fn aes_cipher(mechanism: &Mechanism, key_len: usize) -> Result<Cipher, Rv> {
    let cipher = match (mechanism, key_len) {
        (Mechanism::AesEcb, 16) => Cipher::aes_128_ecb(),
        (Mechanism::AesEcb, 24) => Cipher::aes_192_ecb(),
        (Mechanism::AesEcb, 32) => Cipher::aes_256_ecb(),
        (Mechanism::AesCbc(_) | Mechanism::AesCbcPad(_), 16) => Cipher::aes_128_cbc(),
        (Mechanism::AesCbc(_) | Mechanism::AesCbcPad(_), 24) => Cipher::aes_192_cbc(),
        (Mechanism::AesCbc(_) | Mechanism::AesCbcPad(_), 32) => Cipher::aes_256_cbc(),
        (Mechanism::AesCtr(_), 16) => Cipher::aes_128_ctr(),
        (Mechanism::AesCtr(_), 24) => Cipher::aes_192_ctr(),
        (Mechanism::AesCtr(_), 32) => Cipher::aes_256_ctr(),
        (Mechanism::AesGcm(_), 16) => Cipher::aes_128_gcm(),
        (Mechanism::AesGcm(_), 24) => Cipher::aes_192_gcm(),
        (Mechanism::AesGcm(_), 32) => Cipher::aes_256_gcm(),
        _ => return Err(Rv::KeySizeRange),
    };
    Ok(cipher)
}

/// Two-key triple DES keys are expanded to K1 K2 K1, DES keys to K1 K1 K1
fn des3_key(key_type: KeyType, value: &[u8]) -> Result<Zeroizing<Vec<u8>>, Rv> {
    match (key_type, value.len()) {
        (KeyType::Des3, 24) => Ok(Zeroizing::new(value.to_vec())),
        (KeyType::Des, 8) => Ok(Zeroizing::new(value.repeat(3))),
        (KeyType::Des2, 16) => {
            let mut expanded = Zeroizing::new(Vec::with_capacity(24));
            expanded.extend_from_slice(value);
            expanded.extend_from_slice(&value[..8]);
            Ok(expanded)
        }
        _ => Err(Rv::KeyTypeInconsistent),
    }
}

impl CipherOperation {
    /// Build the operation for `mechanism` with the given key object
    pub(crate) fn new(
        mechanism: &Mechanism,
        key: &StoredObject,
        direction: Direction,
    ) -> Result<Self, Rv> {
        let encrypt = matches!(direction, Direction::Encrypt | Direction::Sign);
        if matches!(mechanism, Mechanism::RsaPkcs | Mechanism::RsaX509) {
            let expected_class = match direction {
                Direction::Encrypt | Direction::VerifyRecover => ObjectClass::PublicKey,
                Direction::Decrypt | Direction::Sign => ObjectClass::PrivateKey,
            };
            if key.class()? != expected_class {
                return Err(Rv::KeyFunctionNotPermitted);
            }
            let padding = if *mechanism == Mechanism::RsaPkcs {
                Padding::PKCS1
            } else {
                Padding::NONE
            };
            return Ok(Self::Rsa(RsaCipher {
                key: key.rsa_key()?,
                padding,
                direction,
            }));
        }
        if matches!(direction, Direction::Sign | Direction::VerifyRecover) {
            return Err(Rv::MechanismInvalid);
        }
        let key_type = key.key_type()?;
        let value = key.secret_value()?;
        let (cipher, value, padding) = match mechanism {
            Mechanism::AesEcb
            | Mechanism::AesCbc(_)
            | Mechanism::AesCbcPad(_)
            | Mechanism::AesCtr(_)
            | Mechanism::AesGcm(_) => {
                if key_type != KeyType::Aes {
                    return Err(Rv::KeyTypeInconsistent);
                }
                (
                    aes_cipher(mechanism, value.len())?,
                    value,
                    matches!(mechanism, Mechanism::AesCbcPad(_)),
                )
            }
            Mechanism::DesEcb | Mechanism::DesCbc(_) | Mechanism::DesCbcPad(_) => {
                if key_type != KeyType::Des || value.len() != 8 {
                    return Err(Rv::KeyTypeInconsistent);
                }
                // single DES runs as triple DES with K1 = K2 = K3
                let cipher = if *mechanism == Mechanism::DesEcb {
                    Cipher::des_ede3()
                } else {
                    Cipher::des_ede3_cbc()
                };
                (
                    cipher,
                    des3_key(KeyType::Des, &value)?,
                    matches!(mechanism, Mechanism::DesCbcPad(_)),
                )
            }
            Mechanism::Des3Ecb | Mechanism::Des3Cbc(_) | Mechanism::Des3CbcPad(_) => {
                let cipher = if *mechanism == Mechanism::Des3Ecb {
                    Cipher::des_ede3()
                } else {
                    Cipher::des_ede3_cbc()
                };
                (
                    cipher,
                    des3_key(key_type, &value)?,
                    matches!(mechanism, Mechanism::Des3CbcPad(_)),
                )
            }
            _ => return Err(Rv::MechanismInvalid),
        };

        if let Mechanism::AesGcm(params) = mechanism {
            if params.iv.is_empty() || params.tag_bits % 8 != 0 || !(96..=128).contains(&params.tag_bits)
            {
                return Err(Rv::MechanismParamInvalid);
            }
            return Ok(Self::Gcm(GcmCipher {
                cipher,
                key: value,
                params: params.clone(),
                encrypt,
            }));
        }

        let iv = mechanism.iv();
        if iv.map(<[u8]>::len) != cipher.iv_len() {
            return Err(Rv::MechanismParamInvalid);
        }
        let mode = if encrypt { Mode::Encrypt } else { Mode::Decrypt };
        let mut crypter =
            Crypter::new(cipher, mode, &value, iv).map_err(|_| Rv::FunctionFailed)?;
        crypter.pad(padding);
        Ok(Self::Block(BlockCipher {
            crypter,
            block_size: cipher.block_size(),
            buffered: 0,
            padding,
            encrypt,
        }))
    }

    /// Exact length of the output of `update(len)`, when it can be known in advance
    pub(crate) fn update_len(&self, len: usize) -> Result<usize, Rv> {
        match self {
            Self::Block(block) => Ok(block.update_len(len)),
            Self::Gcm(_) | Self::Rsa(_) => Err(Rv::MechanismInvalid),
        }
    }

    pub(crate) fn update(&mut self, data: &[u8]) -> Result<Vec<u8>, Rv> {
        match self {
            Self::Block(block) => block.update(data),
            Self::Gcm(_) | Self::Rsa(_) => Err(Rv::MechanismInvalid),
        }
    }

    pub(crate) fn finalize(&mut self) -> Result<Vec<u8>, Rv> {
        match self {
            Self::Block(block) => block.finalize(),
            Self::Gcm(_) | Self::Rsa(_) => Err(Rv::MechanismInvalid),
        }
    }

    /// Length of the output buffer required by a single-part call on `len` bytes
    pub(crate) fn single_len(&self, len: usize) -> usize {
        match self {
            Self::Block(block) => {
                block.update_len(len)
                    + if block.padding && block.encrypt {
                        block.block_size
                    } else {
                        0
                    }
            }
            Self::Gcm(gcm) => {
                let tag_len = gcm.params.tag_bits / 8;
                if gcm.encrypt {
                    len + tag_len
                } else {
                    len.saturating_sub(tag_len)
                }
            }
            Self::Rsa(rsa) => rsa.key.size(),
        }
    }

    /// Run a single-part operation
    pub(crate) fn single(&mut self, data: &[u8]) -> Result<Vec<u8>, Rv> {
        match self {
            Self::Block(block) => {
                let mut output = block.update(data)?;
                output.extend_from_slice(&block.finalize()?);
                Ok(output)
            }
            Self::Gcm(gcm) => gcm.single(data),
            Self::Rsa(rsa) => rsa.single(data),
        }
    }
}

impl BlockCipher {
    fn update_len(&self, len: usize) -> usize {
        if self.block_size <= 1 {
            return len;
        }
        let total = self.buffered + len;
        let remainder = total % self.block_size;
        // decryption with padding always holds back the last complete block
        let kept = if self.padding && !self.encrypt && remainder == 0 && total > 0 {
            self.block_size
        } else {
            remainder
        };
        total - kept
    }

    fn update(&mut self, data: &[u8]) -> Result<Vec<u8>, Rv> {
        let mut output = vec![0_u8; data.len() + self.block_size];
        let written = self
            .crypter
            .update(data, &mut output)
            .map_err(|_| Rv::FunctionFailed)?;
        output.truncate(written);
        self.buffered = self.buffered + data.len() - written;
        Ok(output)
    }

    fn finalize(&mut self) -> Result<Vec<u8>, Rv> {
        if !self.padding && self.buffered != 0 {
            return Err(if self.encrypt {
                Rv::DataLenRange
            } else {
                Rv::EncryptedDataLenRange
            });
        }
        if self.padding && !self.encrypt && self.buffered != self.block_size {
            return Err(Rv::EncryptedDataLenRange);
        }
        let mut output = vec![0_u8; self.block_size.max(1)];
        let written = self.crypter.finalize(&mut output).map_err(|_| {
            if self.encrypt {
                Rv::FunctionFailed
            } else {
                Rv::EncryptedDataInvalid
            }
        })?;
        output.truncate(written);
        self.buffered = 0;
        Ok(output)
    }
}

impl GcmCipher {
    fn single(&self, data: &[u8]) -> Result<Vec<u8>, Rv> {
        let tag_len = self.params.tag_bits / 8;
        if self.encrypt {
            let mut tag = vec![0_u8; tag_len];
            let mut output = encrypt_aead(
                self.cipher,
                &self.key,
                Some(self.params.iv.as_slice()),
                &self.params.aad,
                data,
                &mut tag,
            )
            .map_err(|_| Rv::FunctionFailed)?;
            output.extend_from_slice(&tag);
            Ok(output)
        } else {
            if data.len() < tag_len {
                return Err(Rv::EncryptedDataLenRange);
            }
            let (ciphertext, tag) = data.split_at(data.len() - tag_len);
            decrypt_aead(
                self.cipher,
                &self.key,
                Some(self.params.iv.as_slice()),
                &self.params.aad,
                ciphertext,
                tag,
            )
            .map_err(|_| Rv::EncryptedDataInvalid)
        }
    }
}

impl RsaCipher {
    fn single(&self, data: &[u8]) -> Result<Vec<u8>, Rv> {
        let k = self.key.size();
        let mut output = vec![0_u8; k];
        let written = match self.direction {
            Direction::Encrypt | Direction::Sign => {
                let max = if self.padding == Padding::PKCS1 { k.saturating_sub(11) } else { k };
                if data.len() > max {
                    return Err(Rv::DataLenRange);
                }
                // raw RSA takes the input as a big-endian integer of the modulus size
                let input = if self.padding == Padding::NONE {
                    let mut padded = Zeroizing::new(vec![0_u8; k - data.len()]);
                    padded.extend_from_slice(data);
                    padded
                } else {
                    Zeroizing::new(data.to_vec())
                };
                match (&self.key, self.direction) {
                    (RsaKey::Public(rsa), Direction::Encrypt) => {
                        rsa.public_encrypt(&input, &mut output, self.padding)
                    }
                    (RsaKey::Private(rsa), Direction::Sign) => {
                        rsa.private_encrypt(&input, &mut output, self.padding)
                    }
                    _ => return Err(Rv::KeyFunctionNotPermitted),
                }
                .map_err(|_| Rv::DataInvalid)?
            }
            Direction::Decrypt | Direction::VerifyRecover => {
                if data.len() != k {
                    return Err(if self.direction == Direction::Decrypt {
                        Rv::EncryptedDataLenRange
                    } else {
                        Rv::DataLenRange
                    });
                }
                match (&self.key, self.direction) {
                    (RsaKey::Private(rsa), Direction::Decrypt) => rsa
                        .private_decrypt(data, &mut output, self.padding)
                        .map_err(|_| Rv::EncryptedDataInvalid)?,
                    (RsaKey::Public(rsa), Direction::VerifyRecover) => rsa
                        .public_decrypt(data, &mut output, self.padding)
                        .map_err(|_| Rv::SignatureInvalid)?,
                    _ => return Err(Rv::KeyFunctionNotPermitted),
                }
            }
        };
        output.truncate(written);
        Ok(output)
    }
}

pub(crate) struct DigestOperation {
    hasher: Hasher,
    length: usize,
}

pub(crate) fn message_digest(mechanism: &Mechanism) -> Result<MessageDigest, Rv> {
    Ok(match mechanism {
        Mechanism::Md5 => MessageDigest::md5(),
        Mechanism::Sha1 => MessageDigest::sha1(),
        Mechanism::Sha224 => MessageDigest::sha224(),
        Mechanism::Sha256 => MessageDigest::sha256(),
        Mechanism::Sha384 => MessageDigest::sha384(),
        Mechanism::Sha512 => MessageDigest::sha512(),
        _ => return Err(Rv::MechanismInvalid),
    })
}

impl DigestOperation {
    pub(crate) fn new(mechanism: &Mechanism) -> Result<Self, Rv> {
        let md = message_digest(mechanism)?;
        Ok(Self {
            hasher: Hasher::new(md).map_err(|_| Rv::FunctionFailed)?,
            length: md.size(),
        })
    }

    pub(crate) const fn length(&self) -> usize {
        self.length
    }

    pub(crate) fn update(&mut self, data: &[u8]) -> Result<(), Rv> {
        self.hasher.update(data).map_err(|_| Rv::FunctionFailed)
    }

    pub(crate) fn finish(&mut self) -> Result<Vec<u8>, Rv> {
        self.hasher
            .finish()
            .map(|digest| digest.to_vec())
            .map_err(|_| Rv::FunctionFailed)
    }
}
