//! Key generation on the token.

use std::sync::Arc;

use openssl::{dh::Dh, dsa::Dsa};
use tokenbridge_interfaces::{Attribute, EcCurve, KeyType, Mechanism, ObjectClass};
use tracing::debug;

use crate::{
    HError, KeyAlgorithm,
    error::result::HResult,
    hsm_bail, hsm_call, hsm_ensure,
    key::{KeyProperties, TokenKey, bit_length},
    template::TemplateOperation,
    token::Token,
};

const DEFAULT_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

/// Parameters of a key generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyGenParams {
    /// Key size in bits
    Size(usize),
    Rsa {
        bits: usize,
        public_exponent: Vec<u8>,
    },
    Curve(EcCurve),
    Dsa {
        prime: Vec<u8>,
        subprime: Vec<u8>,
        base: Vec<u8>,
    },
    Dh {
        prime: Vec<u8>,
        base: Vec<u8>,
    },
}

/// A public key and its private key
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public: Arc<TokenKey>,
    pub private: Arc<TokenKey>,
}

/// The outcome of a key generation
#[derive(Debug, Clone)]
pub enum GeneratedKey {
    Secret(Arc<TokenKey>),
    Pair(KeyPair),
}

/// Validated generation parameters
#[derive(Debug, Clone)]
enum Generation {
    Secret {
        mechanism: Mechanism,
        key_type: KeyType,
        /// Length of the value, sent to the token when the mechanism needs it
        len: usize,
        explicit_len: bool,
    },
    Rsa {
        bits: usize,
        public_exponent: Vec<u8>,
    },
    Ec(EcCurve),
    /// Domain parameters generated with the key
    DsaSize(usize),
    Dsa {
        prime: Vec<u8>,
        subprime: Vec<u8>,
        base: Vec<u8>,
    },
    DhSize(usize),
    Dh {
        prime: Vec<u8>,
        base: Vec<u8>,
    },
}

fn check_domain_size(algorithm: KeyAlgorithm, bits: usize) -> HResult<()> {
    hsm_ensure!(
        (512..=1024).contains(&bits) && bits % 64 == 0,
        HError::InvalidParameter(format!(
            "{algorithm} keys are 512 to 1024 bits long in multiples of 64, got {bits}"
        ))
    );
    Ok(())
}

impl Generation {
    fn resolve(algorithm: KeyAlgorithm, params: KeyGenParams) -> HResult<Self> {
        let invalid = |params: &KeyGenParams| {
            HError::InvalidParameter(format!("invalid {algorithm} parameters: {params:?}"))
        };
        Ok(match (algorithm, params) {
            (KeyAlgorithm::Aes, KeyGenParams::Size(bits)) => {
                hsm_ensure!(
                    matches!(bits, 128 | 192 | 256),
                    HError::InvalidParameter(format!(
                        "AES keys are 128, 192 or 256 bits long, got {bits}"
                    ))
                );
                Self::Secret {
                    mechanism: Mechanism::AesKeyGen,
                    key_type: KeyType::Aes,
                    len: bits / 8,
                    explicit_len: true,
                }
            }
            (KeyAlgorithm::Des, KeyGenParams::Size(bits)) => {
                hsm_ensure!(
                    matches!(bits, 56 | 64),
                    HError::InvalidParameter(format!("DES keys are 56 or 64 bits long, got {bits}"))
                );
                Self::Secret {
                    mechanism: Mechanism::DesKeyGen,
                    key_type: KeyType::Des,
                    len: 8,
                    explicit_len: false,
                }
            }
            (KeyAlgorithm::DesEde, KeyGenParams::Size(bits)) => match bits {
                112 => Self::Secret {
                    mechanism: Mechanism::Des2KeyGen,
                    key_type: KeyType::Des2,
                    len: 16,
                    explicit_len: false,
                },
                168 => Self::Secret {
                    mechanism: Mechanism::Des3KeyGen,
                    key_type: KeyType::Des3,
                    len: 24,
                    explicit_len: false,
                },
                _ => hsm_bail!(HError::InvalidParameter(format!(
                    "DESede keys are 112 or 168 bits long, got {bits}"
                ))),
            },
            (KeyAlgorithm::Generic, KeyGenParams::Size(bits)) => {
                hsm_ensure!(
                    (8..=65536).contains(&bits) && bits % 8 == 0,
                    HError::InvalidParameter(format!(
                        "generic secrets are 8 to 65536 bits long in multiples of 8, got {bits}"
                    ))
                );
                Self::Secret {
                    mechanism: Mechanism::GenericSecretKeyGen,
                    key_type: KeyType::GenericSecret,
                    len: bits / 8,
                    explicit_len: true,
                }
            }
            (KeyAlgorithm::Rsa, KeyGenParams::Size(bits)) => Self::rsa(bits, DEFAULT_PUBLIC_EXPONENT.to_vec())?,
            (
                KeyAlgorithm::Rsa,
                KeyGenParams::Rsa {
                    bits,
                    public_exponent,
                },
            ) => Self::rsa(bits, public_exponent)?,
            (KeyAlgorithm::Ec, KeyGenParams::Size(bits)) => {
                hsm_ensure!(
                    (112..=2048).contains(&bits),
                    HError::InvalidParameter(format!("EC keys are 112 to 2048 bits long, got {bits}"))
                );
                Self::Ec(EcCurve::for_field_bits(bits).ok_or_else(|| {
                    HError::InvalidParameter(format!("no supported curve of {bits} bits"))
                })?)
            }
            (KeyAlgorithm::Ec, KeyGenParams::Curve(curve)) => Self::Ec(curve),
            (KeyAlgorithm::Dsa, KeyGenParams::Size(bits)) => {
                check_domain_size(algorithm, bits)?;
                Self::DsaSize(bits)
            }
            (
                KeyAlgorithm::Dsa,
                KeyGenParams::Dsa {
                    prime,
                    subprime,
                    base,
                },
            ) => Self::Dsa {
                prime,
                subprime,
                base,
            },
            (KeyAlgorithm::Dh, KeyGenParams::Size(bits)) => {
                check_domain_size(algorithm, bits)?;
                Self::DhSize(bits)
            }
            (KeyAlgorithm::Dh, KeyGenParams::Dh { prime, base }) => Self::Dh { prime, base },
            (_, params) => hsm_bail!(invalid(&params)),
        })
    }

    fn rsa(bits: usize, public_exponent: Vec<u8>) -> HResult<Self> {
        hsm_ensure!(
            (512..=65536).contains(&bits),
            HError::InvalidParameter(format!("RSA keys are 512 to 65536 bits long, got {bits}"))
        );
        hsm_ensure!(
            bit_length(&public_exponent) >= 2,
            HError::InvalidParameter("invalid RSA public exponent".to_owned())
        );
        Ok(Self::Rsa {
            bits,
            public_exponent,
        })
    }
}

/// Generates keys on a token
pub struct KeyGenerator {
    token: Arc<Token>,
    algorithm: KeyAlgorithm,
    generation: Generation,
}

impl KeyGenerator {
    /// Default key size in bits
    #[must_use]
    pub const fn default_size(algorithm: KeyAlgorithm) -> usize {
        match algorithm {
            KeyAlgorithm::Aes => 128,
            KeyAlgorithm::Des => 64,
            KeyAlgorithm::DesEde => 168,
            KeyAlgorithm::Generic => 256,
            KeyAlgorithm::Rsa => 2048,
            KeyAlgorithm::Ec => 256,
            KeyAlgorithm::Dsa | KeyAlgorithm::Dh => 1024,
        }
    }

    /// A generator of keys of the default size
    pub fn new(token: Arc<Token>, algorithm: KeyAlgorithm) -> HResult<Self> {
        let generation =
            Generation::resolve(algorithm, KeyGenParams::Size(Self::default_size(algorithm)))?;
        Ok(Self {
            token,
            algorithm,
            generation,
        })
    }

    #[must_use]
    pub const fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Set the size or the parameters of the keys
    pub fn init(&mut self, params: KeyGenParams) -> HResult<()> {
        self.generation = Generation::resolve(self.algorithm, params)?;
        Ok(())
    }

    pub fn generate(&self) -> HResult<GeneratedKey> {
        if self.algorithm.is_secret() {
            self.generate_key().map(GeneratedKey::Secret)
        } else {
            self.generate_key_pair().map(GeneratedKey::Pair)
        }
    }

    /// Generate a secret key
    pub fn generate_key(&self) -> HResult<Arc<TokenKey>> {
        let Generation::Secret {
            mechanism,
            key_type,
            len,
            explicit_len,
        } = &self.generation
        else {
            return Err(HError::IllegalState(format!(
                "{} keys come in pairs",
                self.algorithm
            )));
        };
        self.token.ensure_valid()?;
        let mut requested = vec![
            Attribute::Class(ObjectClass::SecretKey),
            Attribute::KeyType(*key_type),
            Attribute::Token(false),
        ];
        if *explicit_len {
            requested.push(Attribute::ValueLen(*len as u64));
        }
        let template = self.token.templates().resolve(
            TemplateOperation::Generate,
            ObjectClass::SecretKey,
            *key_type,
            requested,
        );
        let session = self.token.acquire_object_session()?;
        let handle = hsm_call!(
            self.token,
            "generating a key",
            generate_key,
            session.handle(),
            mechanism,
            &template
        )?;
        debug!(
            "{}: generated {} key {handle}",
            self.token.name(),
            self.algorithm
        );
        let properties =
            KeyProperties::from_template(&template, ObjectClass::SecretKey, *key_type, len * 8);
        Ok(TokenKey::new(&session, handle, properties, None))
    }

    /// Generate a key pair
    pub fn generate_key_pair(&self) -> HResult<KeyPair> {
        self.token.ensure_valid()?;
        let (mechanism, key_type, bits, domain) = match &self.generation {
            Generation::Secret { .. } => {
                return Err(HError::IllegalState(format!(
                    "{} keys are secret keys",
                    self.algorithm
                )));
            }
            Generation::Rsa {
                bits,
                public_exponent,
            } => (
                Mechanism::RsaPkcsKeyPairGen,
                KeyType::Rsa,
                *bits,
                vec![
                    Attribute::ModulusBits(*bits as u64),
                    Attribute::PublicExponent(public_exponent.clone()),
                ],
            ),
            Generation::Ec(curve) => (
                Mechanism::EcKeyPairGen,
                KeyType::Ec,
                curve.field_bits(),
                vec![Attribute::EcParams(curve.oid_der().to_vec())],
            ),
            Generation::DsaSize(bits) => {
                let dsa = Dsa::generate_params(u32::try_from(*bits)?)?;
                Self::dsa_domain(dsa.p().to_vec(), dsa.q().to_vec(), dsa.g().to_vec())
            }
            Generation::Dsa {
                prime,
                subprime,
                base,
            } => Self::dsa_domain(prime.clone(), subprime.clone(), base.clone()),
            Generation::DhSize(bits) => {
                let dh = Dh::generate_params(u32::try_from(*bits)?, 2)?;
                Self::dh_domain(dh.prime_p().to_vec(), dh.generator().to_vec())
            }
            Generation::Dh { prime, base } => Self::dh_domain(prime.clone(), base.clone()),
        };

        let mut public_requested = vec![
            Attribute::Class(ObjectClass::PublicKey),
            Attribute::KeyType(key_type),
            Attribute::Token(false),
        ];
        public_requested.extend(domain);
        let private_requested = vec![
            Attribute::Class(ObjectClass::PrivateKey),
            Attribute::KeyType(key_type),
            Attribute::Token(false),
        ];
        let templates = self.token.templates();
        let public_template = templates.resolve(
            TemplateOperation::Generate,
            ObjectClass::PublicKey,
            key_type,
            public_requested,
        );
        let private_template = templates.resolve(
            TemplateOperation::Generate,
            ObjectClass::PrivateKey,
            key_type,
            private_requested,
        );

        let session = self.token.acquire_object_session()?;
        let (public, private) = hsm_call!(
            self.token,
            "generating a key pair",
            generate_key_pair,
            session.handle(),
            &mechanism,
            &public_template,
            &private_template
        )?;
        debug!(
            "{}: generated {} {bits} bits key pair {public}/{private}",
            self.token.name(),
            self.algorithm
        );
        let public = TokenKey::new(
            &session,
            public,
            KeyProperties::from_template(&public_template, ObjectClass::PublicKey, key_type, bits),
            None,
        );
        let private = TokenKey::new(
            &session,
            private,
            KeyProperties::from_template(
                &private_template,
                ObjectClass::PrivateKey,
                key_type,
                bits,
            ),
            None,
        );
        Ok(KeyPair { public, private })
    }

    fn dsa_domain(
        prime: Vec<u8>,
        subprime: Vec<u8>,
        base: Vec<u8>,
    ) -> (Mechanism, KeyType, usize, Vec<Attribute>) {
        (
            Mechanism::DsaKeyPairGen,
            KeyType::Dsa,
            bit_length(&prime),
            vec![
                Attribute::Prime(prime),
                Attribute::Subprime(subprime),
                Attribute::Base(base),
            ],
        )
    }

    fn dh_domain(prime: Vec<u8>, base: Vec<u8>) -> (Mechanism, KeyType, usize, Vec<Attribute>) {
        (
            Mechanism::DhPkcsKeyPairGen,
            KeyType::Dh,
            bit_length(&prime),
            vec![Attribute::Prime(prime), Attribute::Base(base)],
        )
    }
}
