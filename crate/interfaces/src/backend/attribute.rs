//! Object attributes exchanged with the token.
//!
//! Attributes follow the PKCS#11 model: an object is a bag of typed attributes, templates are
//! lists of attributes passed on creation, and queries name the attribute types to read back.

use std::fmt::{Debug, Formatter};

use der::{Decode, Encode, asn1::OctetStringRef};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{BResult, BackendError, Rv};

/// Handle of a session opened on the token
pub type SessionHandle = u64;

/// Handle of an object (key) stored on the token
pub type ObjectHandle = u64;

/// `CKA_CLASS` values the provider deals with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    PublicKey,
    PrivateKey,
    SecretKey,
}

/// `CKA_KEY_TYPE` values the provider deals with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Rsa,
    Dsa,
    Dh,
    Ec,
    GenericSecret,
    Des,
    Des2,
    Des3,
    Aes,
}

/// Named curves supported for EC keys.
///
/// `CKA_EC_PARAMS` carries the DER encoded OID of the curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcCurve {
    P224,
    P256,
    P384,
    P521,
}

const OID_SECP224R1: &[u8] = &[0x06, 0x05, 0x2B, 0x81, 0x04, 0x00, 0x21];
const OID_PRIME256V1: &[u8] = &[0x06, 0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07];
const OID_SECP384R1: &[u8] = &[0x06, 0x05, 0x2B, 0x81, 0x04, 0x00, 0x22];
const OID_SECP521R1: &[u8] = &[0x06, 0x05, 0x2B, 0x81, 0x04, 0x00, 0x23];

impl EcCurve {
    pub const ALL: [Self; 4] = [Self::P224, Self::P256, Self::P384, Self::P521];

    /// Size of the curve field in bits
    #[must_use]
    pub const fn field_bits(self) -> usize {
        match self {
            Self::P224 => 224,
            Self::P256 => 256,
            Self::P384 => 384,
            Self::P521 => 521,
        }
    }

    /// DER encoding of the curve OID, as found in `CKA_EC_PARAMS`
    #[must_use]
    pub const fn oid_der(self) -> &'static [u8] {
        match self {
            Self::P224 => OID_SECP224R1,
            Self::P256 => OID_PRIME256V1,
            Self::P384 => OID_SECP384R1,
            Self::P521 => OID_SECP521R1,
        }
    }

    #[must_use]
    pub fn from_oid_der(params: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|curve| curve.oid_der() == params)
    }

    /// The smallest supported curve with at least `bits` bits of field size
    #[must_use]
    pub fn for_field_bits(bits: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|curve| curve.field_bits() >= bits)
    }

    /// Standard curve name, as used by OpenSSL short names
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::P224 => "secp224r1",
            Self::P256 => "prime256v1",
            Self::P384 => "secp384r1",
            Self::P521 => "secp521r1",
        }
    }
}

/// Wrap a raw EC point in the DER OCTET STRING expected in `CKA_EC_POINT`
pub fn encode_ec_point(point: &[u8]) -> BResult<Vec<u8>> {
    OctetStringRef::new(point)
        .and_then(|octets| octets.to_der())
        .map_err(|_| BackendError::new("encode_ec_point", Rv::AttributeValueInvalid))
}

/// Extract the raw EC point from a `CKA_EC_POINT` value
pub fn decode_ec_point(der: &[u8]) -> BResult<Vec<u8>> {
    OctetStringRef::from_der(der)
        .map(|octets| octets.as_bytes().to_vec())
        .map_err(|_| BackendError::new("decode_ec_point", Rv::AttributeValueInvalid))
}

/// The types of the attributes, used to query values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttributeType {
    Class,
    KeyType,
    Token,
    Private,
    Sensitive,
    Extractable,
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    Wrap,
    Unwrap,
    Derive,
    Label,
    Value,
    ValueLen,
    Modulus,
    ModulusBits,
    PublicExponent,
    PrivateExponent,
    Prime1,
    Prime2,
    Exponent1,
    Exponent2,
    Coefficient,
    Prime,
    Subprime,
    Base,
    EcParams,
    EcPoint,
}

impl AttributeType {
    /// Attribute types holding secret material: never readable on sensitive objects
    #[must_use]
    pub const fn is_secret(self) -> bool {
        matches!(
            self,
            Self::Value
                | Self::PrivateExponent
                | Self::Prime1
                | Self::Prime2
                | Self::Exponent1
                | Self::Exponent2
                | Self::Coefficient
        )
    }
}

/// Boolean attributes that can be set through attribute templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BooleanAttribute {
    Token,
    Private,
    Sensitive,
    Extractable,
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    Wrap,
    Unwrap,
    Derive,
}

impl BooleanAttribute {
    #[must_use]
    pub const fn with_value(self, value: bool) -> Attribute {
        match self {
            Self::Token => Attribute::Token(value),
            Self::Private => Attribute::Private(value),
            Self::Sensitive => Attribute::Sensitive(value),
            Self::Extractable => Attribute::Extractable(value),
            Self::Encrypt => Attribute::Encrypt(value),
            Self::Decrypt => Attribute::Decrypt(value),
            Self::Sign => Attribute::Sign(value),
            Self::Verify => Attribute::Verify(value),
            Self::Wrap => Attribute::Wrap(value),
            Self::Unwrap => Attribute::Unwrap(value),
            Self::Derive => Attribute::Derive(value),
        }
    }
}

/// An attribute with its value.
///
/// Big integers are unsigned big-endian byte strings.
/// Secret values are held in [`Zeroizing`] buffers and are redacted by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub enum Attribute {
    Class(ObjectClass),
    KeyType(KeyType),
    Token(bool),
    Private(bool),
    Sensitive(bool),
    Extractable(bool),
    Encrypt(bool),
    Decrypt(bool),
    Sign(bool),
    Verify(bool),
    Wrap(bool),
    Unwrap(bool),
    Derive(bool),
    Label(String),
    Value(Zeroizing<Vec<u8>>),
    ValueLen(u64),
    Modulus(Vec<u8>),
    ModulusBits(u64),
    PublicExponent(Vec<u8>),
    PrivateExponent(Zeroizing<Vec<u8>>),
    Prime1(Zeroizing<Vec<u8>>),
    Prime2(Zeroizing<Vec<u8>>),
    Exponent1(Zeroizing<Vec<u8>>),
    Exponent2(Zeroizing<Vec<u8>>),
    Coefficient(Zeroizing<Vec<u8>>),
    Prime(Vec<u8>),
    Subprime(Vec<u8>),
    Base(Vec<u8>),
    EcParams(Vec<u8>),
    EcPoint(Vec<u8>),
}

impl Attribute {
    #[must_use]
    pub const fn attribute_type(&self) -> AttributeType {
        match self {
            Self::Class(_) => AttributeType::Class,
            Self::KeyType(_) => AttributeType::KeyType,
            Self::Token(_) => AttributeType::Token,
            Self::Private(_) => AttributeType::Private,
            Self::Sensitive(_) => AttributeType::Sensitive,
            Self::Extractable(_) => AttributeType::Extractable,
            Self::Encrypt(_) => AttributeType::Encrypt,
            Self::Decrypt(_) => AttributeType::Decrypt,
            Self::Sign(_) => AttributeType::Sign,
            Self::Verify(_) => AttributeType::Verify,
            Self::Wrap(_) => AttributeType::Wrap,
            Self::Unwrap(_) => AttributeType::Unwrap,
            Self::Derive(_) => AttributeType::Derive,
            Self::Label(_) => AttributeType::Label,
            Self::Value(_) => AttributeType::Value,
            Self::ValueLen(_) => AttributeType::ValueLen,
            Self::Modulus(_) => AttributeType::Modulus,
            Self::ModulusBits(_) => AttributeType::ModulusBits,
            Self::PublicExponent(_) => AttributeType::PublicExponent,
            Self::PrivateExponent(_) => AttributeType::PrivateExponent,
            Self::Prime1(_) => AttributeType::Prime1,
            Self::Prime2(_) => AttributeType::Prime2,
            Self::Exponent1(_) => AttributeType::Exponent1,
            Self::Exponent2(_) => AttributeType::Exponent2,
            Self::Coefficient(_) => AttributeType::Coefficient,
            Self::Prime(_) => AttributeType::Prime,
            Self::Subprime(_) => AttributeType::Subprime,
            Self::Base(_) => AttributeType::Base,
            Self::EcParams(_) => AttributeType::EcParams,
            Self::EcPoint(_) => AttributeType::EcPoint,
        }
    }

    /// The value of a boolean attribute, `None` for other attributes
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Token(v)
            | Self::Private(v)
            | Self::Sensitive(v)
            | Self::Extractable(v)
            | Self::Encrypt(v)
            | Self::Decrypt(v)
            | Self::Sign(v)
            | Self::Verify(v)
            | Self::Wrap(v)
            | Self::Unwrap(v)
            | Self::Derive(v) => Some(*v),
            _ => None,
        }
    }

    /// The value of a byte string attribute, `None` for other attributes
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Value(v)
            | Self::PrivateExponent(v)
            | Self::Prime1(v)
            | Self::Prime2(v)
            | Self::Exponent1(v)
            | Self::Exponent2(v)
            | Self::Coefficient(v) => Some(v.as_slice()),
            Self::Modulus(v)
            | Self::PublicExponent(v)
            | Self::Prime(v)
            | Self::Subprime(v)
            | Self::Base(v)
            | Self::EcParams(v)
            | Self::EcPoint(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// The value of a numeric attribute, `None` for other attributes
    #[must_use]
    pub const fn as_ulong(&self) -> Option<u64> {
        match self {
            Self::ValueLen(v) | Self::ModulusBits(v) => Some(*v),
            _ => None,
        }
    }
}

impl Debug for Attribute {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let attribute_type = self.attribute_type();
        if attribute_type.is_secret() {
            return write!(f, "{attribute_type:?}(<redacted>)");
        }
        match self {
            Self::Class(v) => write!(f, "Class({v:?})"),
            Self::KeyType(v) => write!(f, "KeyType({v:?})"),
            Self::Label(v) => write!(f, "Label({v:?})"),
            other => {
                if let Some(v) = other.as_bool() {
                    write!(f, "{attribute_type:?}({v})")
                } else if let Some(v) = other.as_ulong() {
                    write!(f, "{attribute_type:?}({v})")
                } else {
                    let len = other.as_bytes().map_or(0, <[u8]>::len);
                    write!(f, "{attribute_type:?}({len} bytes)")
                }
            }
        }
    }
}

/// Lookup helpers over an attribute list
pub trait AttributeList {
    fn find(&self, attribute_type: AttributeType) -> Option<&Attribute>;

    fn bool_value(&self, attribute_type: AttributeType) -> Option<bool> {
        self.find(attribute_type).and_then(Attribute::as_bool)
    }

    fn bytes_value(&self, attribute_type: AttributeType) -> Option<&[u8]> {
        self.find(attribute_type).and_then(Attribute::as_bytes)
    }

    fn class(&self) -> Option<ObjectClass> {
        match self.find(AttributeType::Class) {
            Some(Attribute::Class(class)) => Some(*class),
            _ => None,
        }
    }

    fn key_type(&self) -> Option<KeyType> {
        match self.find(AttributeType::KeyType) {
            Some(Attribute::KeyType(key_type)) => Some(*key_type),
            _ => None,
        }
    }
}

impl AttributeList for [Attribute] {
    fn find(&self, attribute_type: AttributeType) -> Option<&Attribute> {
        self.iter()
            .find(|attribute| attribute.attribute_type() == attribute_type)
    }
}

impl AttributeList for Vec<Attribute> {
    fn find(&self, attribute_type: AttributeType) -> Option<&Attribute> {
        self.as_slice().find(attribute_type)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_ec_point_der() {
        let point = [0x04_u8; 65];
        let der = encode_ec_point(&point).unwrap();
        assert_eq!(&der[..2], &[0x04, 65]);
        assert_eq!(decode_ec_point(&der).unwrap(), point.to_vec());

        // P-521 points need the long length form
        let point = [0x04_u8; 133];
        let der = encode_ec_point(&point).unwrap();
        assert_eq!(&der[..3], &[0x04, 0x81, 133]);
        assert_eq!(decode_ec_point(&der).unwrap(), point.to_vec());

        decode_ec_point(&[0x02, 0x01, 0x00]).unwrap_err();
    }

    #[test]
    fn test_curve_lookup() {
        assert_eq!(EcCurve::for_field_bits(112), Some(EcCurve::P224));
        assert_eq!(EcCurve::for_field_bits(256), Some(EcCurve::P256));
        assert_eq!(EcCurve::for_field_bits(521), Some(EcCurve::P521));
        assert_eq!(EcCurve::for_field_bits(600), None);
        for curve in EcCurve::ALL {
            assert_eq!(EcCurve::from_oid_der(curve.oid_der()), Some(curve));
        }
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let attribute = Attribute::Value(Zeroizing::new(vec![0xAA; 16]));
        assert_eq!(format!("{attribute:?}"), "Value(<redacted>)");
        assert_eq!(format!("{:?}", Attribute::Token(true)), "Token(true)");
        assert_eq!(
            format!("{:?}", Attribute::Modulus(vec![1; 256])),
            "Modulus(256 bytes)"
        );
    }

    #[test]
    fn test_attribute_list_lookup() {
        let template = vec![
            Attribute::Class(ObjectClass::SecretKey),
            Attribute::KeyType(KeyType::Aes),
            Attribute::Sensitive(true),
        ];
        assert_eq!(template.class(), Some(ObjectClass::SecretKey));
        assert_eq!(template.key_type(), Some(KeyType::Aes));
        assert_eq!(template.bool_value(AttributeType::Sensitive), Some(true));
        assert_eq!(template.bool_value(AttributeType::Extractable), None);
    }

    #[test]
    fn test_boolean_attribute_from_toml() {
        #[derive(Deserialize)]
        struct Entry {
            values: std::collections::BTreeMap<BooleanAttribute, bool>,
        }
        let entry: Entry = toml::from_str("[values]\nsensitive = true\nextractable = false\n").unwrap();
        assert_eq!(entry.values.get(&BooleanAttribute::Sensitive), Some(&true));
        assert_eq!(
            BooleanAttribute::Extractable.with_value(false),
            Attribute::Extractable(false)
        );
    }
}
