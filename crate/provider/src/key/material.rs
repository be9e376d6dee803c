//! Key values, as read from the token or supplied by callers.

use openssl::{
    bn::{BigNum, BigNumContext, BigNumRef},
    dsa::Dsa,
    ec::{EcGroup, EcKey, EcPoint, PointConversionForm},
    nid::Nid,
    pkey::{Id, PKey, Private, Public},
    rsa::{Rsa, RsaPrivateKeyBuilder},
};
use tokenbridge_interfaces::{
    Attribute, AttributeList, AttributeType, EcCurve, KeyType, ObjectClass, decode_ec_point,
    encode_ec_point,
};
use zeroize::Zeroizing;

use crate::{HError, KeyAlgorithm, error::result::HResult};

/// The value of a key.
///
/// Big integers are unsigned big-endian byte strings. EC points are uncompressed octet strings.
#[derive(Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    Secret(Zeroizing<Vec<u8>>),
    RsaPublic {
        modulus: Vec<u8>,
        public_exponent: Vec<u8>,
    },
    RsaPrivateCrt {
        modulus: Vec<u8>,
        public_exponent: Vec<u8>,
        private_exponent: Zeroizing<Vec<u8>>,
        prime1: Zeroizing<Vec<u8>>,
        prime2: Zeroizing<Vec<u8>>,
        exponent1: Zeroizing<Vec<u8>>,
        exponent2: Zeroizing<Vec<u8>>,
        coefficient: Zeroizing<Vec<u8>>,
    },
    RsaPrivate {
        modulus: Vec<u8>,
        public_exponent: Vec<u8>,
        private_exponent: Zeroizing<Vec<u8>>,
    },
    EcPublic {
        curve: EcCurve,
        point: Vec<u8>,
    },
    EcPrivate {
        curve: EcCurve,
        scalar: Zeroizing<Vec<u8>>,
    },
    DsaPublic {
        prime: Vec<u8>,
        subprime: Vec<u8>,
        base: Vec<u8>,
        value: Vec<u8>,
    },
    DsaPrivate {
        prime: Vec<u8>,
        subprime: Vec<u8>,
        base: Vec<u8>,
        value: Zeroizing<Vec<u8>>,
    },
    DhPublic {
        prime: Vec<u8>,
        base: Vec<u8>,
        value: Vec<u8>,
    },
    DhPrivate {
        prime: Vec<u8>,
        base: Vec<u8>,
        value: Zeroizing<Vec<u8>>,
    },
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.variant_name())?;
        match self {
            Self::EcPublic { curve, .. } | Self::EcPrivate { curve, .. } => {
                write!(f, "{}", curve.name())?;
            }
            _ => write!(f, "{} bits", self.bits())?,
        }
        write!(f, ")")
    }
}

/// Number of significant bits of a big-endian integer
pub(crate) fn bit_length(bytes: &[u8]) -> usize {
    let significant: Vec<&u8> = bytes.iter().skip_while(|b| **b == 0).collect();
    match significant.first() {
        Some(first) => (significant.len() - 1) * 8 + (8 - first.leading_zeros() as usize),
        None => 0,
    }
}

pub(crate) fn curve_nid(curve: EcCurve) -> Nid {
    match curve {
        EcCurve::P224 => Nid::SECP224R1,
        EcCurve::P256 => Nid::X9_62_PRIME256V1,
        EcCurve::P384 => Nid::SECP384R1,
        EcCurve::P521 => Nid::SECP521R1,
    }
}

fn curve_from_nid(nid: Nid) -> HResult<EcCurve> {
    EcCurve::ALL
        .into_iter()
        .find(|curve| curve_nid(*curve) == nid)
        .ok_or_else(|| HError::InvalidKey(format!("unsupported EC curve: {nid:?}")))
}

fn bn(bytes: &[u8]) -> HResult<BigNum> {
    Ok(BigNum::from_slice(bytes)?)
}

fn secret(n: &BigNumRef) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(n.to_vec())
}

fn missing(what: &str) -> HError {
    HError::InvalidKey(format!("missing key component: {what}"))
}

impl KeyMaterial {
    const fn variant_name(&self) -> &'static str {
        match self {
            Self::Secret(_) => "Secret",
            Self::RsaPublic { .. } => "RsaPublic",
            Self::RsaPrivateCrt { .. } => "RsaPrivateCrt",
            Self::RsaPrivate { .. } => "RsaPrivate",
            Self::EcPublic { .. } => "EcPublic",
            Self::EcPrivate { .. } => "EcPrivate",
            Self::DsaPublic { .. } => "DsaPublic",
            Self::DsaPrivate { .. } => "DsaPrivate",
            Self::DhPublic { .. } => "DhPublic",
            Self::DhPrivate { .. } => "DhPrivate",
        }
    }

    #[must_use]
    pub const fn class(&self) -> ObjectClass {
        match self {
            Self::Secret(_) => ObjectClass::SecretKey,
            Self::RsaPublic { .. }
            | Self::EcPublic { .. }
            | Self::DsaPublic { .. }
            | Self::DhPublic { .. } => ObjectClass::PublicKey,
            Self::RsaPrivateCrt { .. }
            | Self::RsaPrivate { .. }
            | Self::EcPrivate { .. }
            | Self::DsaPrivate { .. }
            | Self::DhPrivate { .. } => ObjectClass::PrivateKey,
        }
    }

    /// Algorithm of an asymmetric key, `None` for secret keys
    #[must_use]
    pub const fn algorithm(&self) -> Option<KeyAlgorithm> {
        match self {
            Self::Secret(_) => None,
            Self::RsaPublic { .. } | Self::RsaPrivateCrt { .. } | Self::RsaPrivate { .. } => {
                Some(KeyAlgorithm::Rsa)
            }
            Self::EcPublic { .. } | Self::EcPrivate { .. } => Some(KeyAlgorithm::Ec),
            Self::DsaPublic { .. } | Self::DsaPrivate { .. } => Some(KeyAlgorithm::Dsa),
            Self::DhPublic { .. } | Self::DhPrivate { .. } => Some(KeyAlgorithm::Dh),
        }
    }

    /// Size of the key: length of the value of secret keys, of the modulus for RSA, of the
    /// field for EC and of the prime for DSA and DH
    #[must_use]
    pub fn bits(&self) -> usize {
        match self {
            Self::Secret(value) => value.len() * 8,
            Self::RsaPublic { modulus, .. }
            | Self::RsaPrivateCrt { modulus, .. }
            | Self::RsaPrivate { modulus, .. } => bit_length(modulus),
            Self::EcPublic { curve, .. } | Self::EcPrivate { curve, .. } => curve.field_bits(),
            Self::DsaPublic { prime, .. }
            | Self::DsaPrivate { prime, .. }
            | Self::DhPublic { prime, .. }
            | Self::DhPrivate { prime, .. } => bit_length(prime),
        }
    }

    /// The attributes to read from the token to rebuild a key
    pub(crate) const fn attribute_types(
        class: ObjectClass,
        key_type: KeyType,
        crt: bool,
    ) -> &'static [AttributeType] {
        match (class, key_type) {
            (ObjectClass::SecretKey, _) => &[AttributeType::Value],
            (ObjectClass::PublicKey, KeyType::Rsa) => {
                &[AttributeType::Modulus, AttributeType::PublicExponent]
            }
            (ObjectClass::PrivateKey, KeyType::Rsa) if crt => &[
                AttributeType::Modulus,
                AttributeType::PublicExponent,
                AttributeType::PrivateExponent,
                AttributeType::Prime1,
                AttributeType::Prime2,
                AttributeType::Exponent1,
                AttributeType::Exponent2,
                AttributeType::Coefficient,
            ],
            (ObjectClass::PrivateKey, KeyType::Rsa) => &[
                AttributeType::Modulus,
                AttributeType::PublicExponent,
                AttributeType::PrivateExponent,
            ],
            (ObjectClass::PublicKey, KeyType::Ec) => {
                &[AttributeType::EcParams, AttributeType::EcPoint]
            }
            (ObjectClass::PrivateKey, KeyType::Ec) => {
                &[AttributeType::EcParams, AttributeType::Value]
            }
            (_, KeyType::Dsa) => &[
                AttributeType::Prime,
                AttributeType::Subprime,
                AttributeType::Base,
                AttributeType::Value,
            ],
            (_, KeyType::Dh) => &[AttributeType::Prime, AttributeType::Base, AttributeType::Value],
            _ => &[],
        }
    }

    /// Rebuild a key from the attributes read from the token
    pub(crate) fn from_attributes(
        class: ObjectClass,
        key_type: KeyType,
        attributes: &[Attribute],
    ) -> HResult<Self> {
        let bytes = |attribute_type: AttributeType| {
            attributes
                .bytes_value(attribute_type)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| missing(&format!("{attribute_type:?}")))
        };
        let zeroizing = |attribute_type: AttributeType| bytes(attribute_type).map(Zeroizing::new);
        let curve = || {
            let params = bytes(AttributeType::EcParams)?;
            EcCurve::from_oid_der(&params)
                .ok_or_else(|| HError::InvalidKey("unsupported EC parameters".to_owned()))
        };
        Ok(match (class, key_type) {
            (ObjectClass::SecretKey, _) => Self::Secret(zeroizing(AttributeType::Value)?),
            (ObjectClass::PublicKey, KeyType::Rsa) => Self::RsaPublic {
                modulus: bytes(AttributeType::Modulus)?,
                public_exponent: bytes(AttributeType::PublicExponent)?,
            },
            (ObjectClass::PrivateKey, KeyType::Rsa) => {
                if attributes.find(AttributeType::Prime1).is_some() {
                    Self::RsaPrivateCrt {
                        modulus: bytes(AttributeType::Modulus)?,
                        public_exponent: bytes(AttributeType::PublicExponent)?,
                        private_exponent: zeroizing(AttributeType::PrivateExponent)?,
                        prime1: zeroizing(AttributeType::Prime1)?,
                        prime2: zeroizing(AttributeType::Prime2)?,
                        exponent1: zeroizing(AttributeType::Exponent1)?,
                        exponent2: zeroizing(AttributeType::Exponent2)?,
                        coefficient: zeroizing(AttributeType::Coefficient)?,
                    }
                } else {
                    Self::RsaPrivate {
                        modulus: bytes(AttributeType::Modulus)?,
                        public_exponent: bytes(AttributeType::PublicExponent)?,
                        private_exponent: zeroizing(AttributeType::PrivateExponent)?,
                    }
                }
            }
            (ObjectClass::PublicKey, KeyType::Ec) => Self::EcPublic {
                curve: curve()?,
                point: decode_ec_point(&bytes(AttributeType::EcPoint)?)
                    .map_err(|e| HError::InvalidKey(e.to_string()))?,
            },
            (ObjectClass::PrivateKey, KeyType::Ec) => Self::EcPrivate {
                curve: curve()?,
                scalar: zeroizing(AttributeType::Value)?,
            },
            (ObjectClass::PublicKey, KeyType::Dsa) => Self::DsaPublic {
                prime: bytes(AttributeType::Prime)?,
                subprime: bytes(AttributeType::Subprime)?,
                base: bytes(AttributeType::Base)?,
                value: bytes(AttributeType::Value)?,
            },
            (ObjectClass::PrivateKey, KeyType::Dsa) => Self::DsaPrivate {
                prime: bytes(AttributeType::Prime)?,
                subprime: bytes(AttributeType::Subprime)?,
                base: bytes(AttributeType::Base)?,
                value: zeroizing(AttributeType::Value)?,
            },
            (ObjectClass::PublicKey, KeyType::Dh) => Self::DhPublic {
                prime: bytes(AttributeType::Prime)?,
                base: bytes(AttributeType::Base)?,
                value: bytes(AttributeType::Value)?,
            },
            (ObjectClass::PrivateKey, KeyType::Dh) => Self::DhPrivate {
                prime: bytes(AttributeType::Prime)?,
                base: bytes(AttributeType::Base)?,
                value: zeroizing(AttributeType::Value)?,
            },
            (class, key_type) => {
                return Err(HError::InvalidKey(format!(
                    "inconsistent key: {class:?} of type {key_type:?}"
                )));
            }
        })
    }

    /// The attributes of an object holding this key, class and key type included.
    /// `secret_key_type` is the key type of secret keys.
    pub(crate) fn to_attributes(&self, secret_key_type: KeyType) -> HResult<Vec<Attribute>> {
        let (key_type, components) = match self {
            Self::Secret(value) => (
                secret_key_type,
                vec![
                    Attribute::Value(value.clone()),
                    Attribute::ValueLen(value.len() as u64),
                ],
            ),
            Self::RsaPublic {
                modulus,
                public_exponent,
            } => (
                KeyType::Rsa,
                vec![
                    Attribute::Modulus(modulus.clone()),
                    Attribute::PublicExponent(public_exponent.clone()),
                ],
            ),
            Self::RsaPrivateCrt {
                modulus,
                public_exponent,
                private_exponent,
                prime1,
                prime2,
                exponent1,
                exponent2,
                coefficient,
            } => (
                KeyType::Rsa,
                vec![
                    Attribute::Modulus(modulus.clone()),
                    Attribute::PublicExponent(public_exponent.clone()),
                    Attribute::PrivateExponent(private_exponent.clone()),
                    Attribute::Prime1(prime1.clone()),
                    Attribute::Prime2(prime2.clone()),
                    Attribute::Exponent1(exponent1.clone()),
                    Attribute::Exponent2(exponent2.clone()),
                    Attribute::Coefficient(coefficient.clone()),
                ],
            ),
            Self::RsaPrivate {
                modulus,
                public_exponent,
                private_exponent,
            } => (
                KeyType::Rsa,
                vec![
                    Attribute::Modulus(modulus.clone()),
                    Attribute::PublicExponent(public_exponent.clone()),
                    Attribute::PrivateExponent(private_exponent.clone()),
                ],
            ),
            Self::EcPublic { curve, point } => (
                KeyType::Ec,
                vec![
                    Attribute::EcParams(curve.oid_der().to_vec()),
                    Attribute::EcPoint(
                        encode_ec_point(point).map_err(|e| HError::InvalidKey(e.to_string()))?,
                    ),
                ],
            ),
            Self::EcPrivate { curve, scalar } => (
                KeyType::Ec,
                vec![
                    Attribute::EcParams(curve.oid_der().to_vec()),
                    Attribute::Value(scalar.clone()),
                ],
            ),
            Self::DsaPublic {
                prime,
                subprime,
                base,
                value,
            } => (
                KeyType::Dsa,
                vec![
                    Attribute::Prime(prime.clone()),
                    Attribute::Subprime(subprime.clone()),
                    Attribute::Base(base.clone()),
                    Attribute::Value(Zeroizing::new(value.clone())),
                ],
            ),
            Self::DsaPrivate {
                prime,
                subprime,
                base,
                value,
            } => (
                KeyType::Dsa,
                vec![
                    Attribute::Prime(prime.clone()),
                    Attribute::Subprime(subprime.clone()),
                    Attribute::Base(base.clone()),
                    Attribute::Value(value.clone()),
                ],
            ),
            Self::DhPublic { prime, base, value } => (
                KeyType::Dh,
                vec![
                    Attribute::Prime(prime.clone()),
                    Attribute::Base(base.clone()),
                    Attribute::Value(Zeroizing::new(value.clone())),
                ],
            ),
            Self::DhPrivate { prime, base, value } => (
                KeyType::Dh,
                vec![
                    Attribute::Prime(prime.clone()),
                    Attribute::Base(base.clone()),
                    Attribute::Value(value.clone()),
                ],
            ),
        };
        let mut attributes = vec![Attribute::Class(self.class()), Attribute::KeyType(key_type)];
        attributes.extend(components);
        Ok(attributes)
    }

    /// Parse a DER encoded X.509 `SubjectPublicKeyInfo`
    pub fn from_public_der(der: &[u8]) -> HResult<Self> {
        let pkey = PKey::public_key_from_der(der)
            .map_err(|e| HError::InvalidKey(format!("invalid SubjectPublicKeyInfo: {e}")))?;
        Self::from_public_pkey(&pkey)
    }

    fn from_public_pkey(pkey: &PKey<Public>) -> HResult<Self> {
        Ok(match pkey.id() {
            Id::RSA => {
                let rsa = pkey.rsa()?;
                Self::RsaPublic {
                    modulus: rsa.n().to_vec(),
                    public_exponent: rsa.e().to_vec(),
                }
            }
            Id::EC => {
                let ec = pkey.ec_key()?;
                let group = ec.group();
                let curve = curve_from_nid(
                    group
                        .curve_name()
                        .ok_or_else(|| HError::InvalidKey("unnamed EC curve".to_owned()))?,
                )?;
                let mut ctx = BigNumContext::new()?;
                Self::EcPublic {
                    curve,
                    point: ec.public_key().to_bytes(
                        group,
                        PointConversionForm::UNCOMPRESSED,
                        &mut ctx,
                    )?,
                }
            }
            Id::DSA => {
                let dsa = pkey.dsa()?;
                Self::DsaPublic {
                    prime: dsa.p().to_vec(),
                    subprime: dsa.q().to_vec(),
                    base: dsa.g().to_vec(),
                    value: dsa.pub_key().to_vec(),
                }
            }
            Id::DH => {
                let dh = pkey.dh()?;
                Self::DhPublic {
                    prime: dh.prime_p().to_vec(),
                    base: dh.generator().to_vec(),
                    value: dh.public_key().to_vec(),
                }
            }
            id => {
                return Err(HError::InvalidKey(format!(
                    "unsupported public key type: {id:?}"
                )));
            }
        })
    }

    /// Parse a DER encoded PKCS#8 `PrivateKeyInfo`
    pub fn from_pkcs8_der(der: &[u8]) -> HResult<Self> {
        let pkey = PKey::private_key_from_pkcs8(der)
            .map_err(|e| HError::InvalidKey(format!("invalid PKCS#8 key: {e}")))?;
        Self::from_private_pkey(&pkey)
    }

    fn from_private_pkey(pkey: &PKey<Private>) -> HResult<Self> {
        Ok(match pkey.id() {
            Id::RSA => {
                let rsa = pkey.rsa()?;
                let crt = rsa
                    .p()
                    .zip(rsa.q())
                    .zip(rsa.dmp1().zip(rsa.dmq1()).zip(rsa.iqmp()));
                match crt {
                    Some(((p, q), ((dp, dq), qi))) => Self::RsaPrivateCrt {
                        modulus: rsa.n().to_vec(),
                        public_exponent: rsa.e().to_vec(),
                        private_exponent: secret(rsa.d()),
                        prime1: secret(p),
                        prime2: secret(q),
                        exponent1: secret(dp),
                        exponent2: secret(dq),
                        coefficient: secret(qi),
                    },
                    None => Self::RsaPrivate {
                        modulus: rsa.n().to_vec(),
                        public_exponent: rsa.e().to_vec(),
                        private_exponent: secret(rsa.d()),
                    },
                }
            }
            Id::EC => {
                let ec = pkey.ec_key()?;
                let curve = curve_from_nid(
                    ec.group()
                        .curve_name()
                        .ok_or_else(|| HError::InvalidKey("unnamed EC curve".to_owned()))?,
                )?;
                let scalar_len = i32::try_from(curve.field_bits().div_ceil(8))?;
                Self::EcPrivate {
                    curve,
                    scalar: Zeroizing::new(ec.private_key().to_vec_padded(scalar_len)?),
                }
            }
            Id::DSA => {
                let dsa = pkey.dsa()?;
                Self::DsaPrivate {
                    prime: dsa.p().to_vec(),
                    subprime: dsa.q().to_vec(),
                    base: dsa.g().to_vec(),
                    value: secret(dsa.priv_key()),
                }
            }
            Id::DH => {
                let dh = pkey.dh()?;
                Self::DhPrivate {
                    prime: dh.prime_p().to_vec(),
                    base: dh.generator().to_vec(),
                    value: secret(dh.private_key()),
                }
            }
            id => {
                return Err(HError::InvalidKey(format!(
                    "unsupported private key type: {id:?}"
                )));
            }
        })
    }

    /// The encoded form of the key: the raw value of secret keys, the DER X.509
    /// `SubjectPublicKeyInfo` of public keys and the DER PKCS#8 `PrivateKeyInfo` of private keys.
    ///
    /// Diffie-Hellman keys have no encoded form.
    pub fn encode(&self) -> HResult<Zeroizing<Vec<u8>>> {
        Ok(match self {
            Self::Secret(value) => value.clone(),
            Self::RsaPublic {
                modulus,
                public_exponent,
            } => {
                let rsa = Rsa::from_public_components(bn(modulus)?, bn(public_exponent)?)?;
                Zeroizing::new(PKey::from_rsa(rsa)?.public_key_to_der()?)
            }
            Self::RsaPrivateCrt {
                modulus,
                public_exponent,
                private_exponent,
                prime1,
                prime2,
                exponent1,
                exponent2,
                coefficient,
            } => {
                let rsa = Rsa::from_private_components(
                    bn(modulus)?,
                    bn(public_exponent)?,
                    bn(private_exponent)?,
                    bn(prime1)?,
                    bn(prime2)?,
                    bn(exponent1)?,
                    bn(exponent2)?,
                    bn(coefficient)?,
                )?;
                Zeroizing::new(PKey::from_rsa(rsa)?.private_key_to_pkcs8()?)
            }
            Self::RsaPrivate {
                modulus,
                public_exponent,
                private_exponent,
            } => {
                let rsa = RsaPrivateKeyBuilder::new(
                    bn(modulus)?,
                    bn(public_exponent)?,
                    bn(private_exponent)?,
                )?
                .build();
                Zeroizing::new(PKey::from_rsa(rsa)?.private_key_to_pkcs8()?)
            }
            Self::EcPublic { curve, point } => {
                let group = EcGroup::from_curve_name(curve_nid(*curve))?;
                let mut ctx = BigNumContext::new()?;
                let point = EcPoint::from_bytes(&group, point, &mut ctx)?;
                let ec = EcKey::from_public_key(&group, &point)?;
                Zeroizing::new(PKey::from_ec_key(ec)?.public_key_to_der()?)
            }
            Self::EcPrivate { curve, scalar } => {
                let group = EcGroup::from_curve_name(curve_nid(*curve))?;
                let ctx = BigNumContext::new()?;
                let scalar = bn(scalar)?;
                let mut public = EcPoint::new(&group)?;
                public.mul_generator(&group, &scalar, &ctx)?;
                let ec = EcKey::from_private_components(&group, &scalar, &public)?;
                Zeroizing::new(PKey::from_ec_key(ec)?.private_key_to_pkcs8()?)
            }
            Self::DsaPublic {
                prime,
                subprime,
                base,
                value,
            } => {
                let dsa =
                    Dsa::from_public_components(bn(prime)?, bn(subprime)?, bn(base)?, bn(value)?)?;
                Zeroizing::new(PKey::from_dsa(dsa)?.public_key_to_der()?)
            }
            Self::DsaPrivate {
                prime,
                subprime,
                base,
                value,
            } => {
                let (p, g, x) = (bn(prime)?, bn(base)?, bn(value)?);
                let mut ctx = BigNumContext::new()?;
                let mut y = BigNum::new()?;
                y.mod_exp(&g, &x, &p, &mut ctx)?;
                let dsa = Dsa::from_private_components(p, bn(subprime)?, g, x, y)?;
                Zeroizing::new(PKey::from_dsa(dsa)?.private_key_to_pkcs8()?)
            }
            Self::DhPublic { .. } | Self::DhPrivate { .. } => {
                return Err(HError::InvalidKey(
                    "Diffie-Hellman keys have no encoded form".to_owned(),
                ));
            }
        })
    }
}
