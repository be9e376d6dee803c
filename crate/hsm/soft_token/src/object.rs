use openssl::{
    bn::BigNum,
    ec::{EcGroup, EcKey, EcPoint},
    nid::Nid,
    pkey::{Private, Public},
    rsa::{Rsa, RsaPrivateKeyBuilder},
};
use tokenbridge_interfaces::{
    Attribute, AttributeList, AttributeType, EcCurve, KeyType, ObjectClass, Rv, SessionHandle,
    decode_ec_point,
};
use zeroize::Zeroizing;

/// An object stored on the soft token
pub(crate) struct StoredObject {
    pub(crate) attributes: Vec<Attribute>,
    /// Session owning the object, `None` for token objects
    pub(crate) owner: Option<SessionHandle>,
}

/// An RSA key rebuilt from an object
pub(crate) enum RsaKey {
    Public(Rsa<Public>),
    Private(Rsa<Private>),
}

impl RsaKey {
    pub(crate) fn size(&self) -> usize {
        match self {
            Self::Public(rsa) => rsa.size() as usize,
            Self::Private(rsa) => rsa.size() as usize,
        }
    }
}

pub(crate) fn bn(bytes: &[u8]) -> Result<BigNum, Rv> {
    BigNum::from_slice(bytes).map_err(|_| Rv::AttributeValueInvalid)
}

pub(crate) fn nid(curve: EcCurve) -> Nid {
    match curve {
        EcCurve::P224 => Nid::SECP224R1,
        EcCurve::P256 => Nid::X9_62_PRIME256V1,
        EcCurve::P384 => Nid::SECP384R1,
        EcCurve::P521 => Nid::SECP521R1,
    }
}

impl StoredObject {
    pub(crate) fn class(&self) -> Result<ObjectClass, Rv> {
        self.attributes.class().ok_or(Rv::KeyHandleInvalid)
    }

    pub(crate) fn key_type(&self) -> Result<KeyType, Rv> {
        self.attributes.key_type().ok_or(Rv::KeyHandleInvalid)
    }

    fn flag(&self, attribute_type: AttributeType, default: bool) -> bool {
        self.attributes
            .bool_value(attribute_type)
            .unwrap_or(default)
    }

    pub(crate) fn is_extractable(&self) -> bool {
        self.flag(AttributeType::Extractable, true)
    }

    pub(crate) fn is_sensitive(&self) -> bool {
        self.flag(AttributeType::Sensitive, false)
    }

    /// Check that the key may be used for the function guarded by `usage`
    pub(crate) fn permits(&self, usage: AttributeType) -> Result<(), Rv> {
        if self.flag(usage, true) {
            Ok(())
        } else {
            Err(Rv::KeyFunctionNotPermitted)
        }
    }

    fn component(&self, attribute_type: AttributeType) -> Result<&[u8], Rv> {
        self.attributes
            .bytes_value(attribute_type)
            .ok_or(Rv::TemplateIncomplete)
    }

    /// The value of a secret key
    pub(crate) fn secret_value(&self) -> Result<Zeroizing<Vec<u8>>, Rv> {
        if self.class()? != ObjectClass::SecretKey {
            return Err(Rv::KeyTypeInconsistent);
        }
        Ok(Zeroizing::new(self.component(AttributeType::Value)?.to_vec()))
    }

    pub(crate) fn rsa_key(&self) -> Result<RsaKey, Rv> {
        if self.key_type()? != KeyType::Rsa {
            return Err(Rv::KeyTypeInconsistent);
        }
        let n = bn(self.component(AttributeType::Modulus)?)?;
        let e = bn(self.component(AttributeType::PublicExponent)?)?;
        match self.class()? {
            ObjectClass::PublicKey => Rsa::from_public_components(n, e)
                .map(RsaKey::Public)
                .map_err(|_| Rv::AttributeValueInvalid),
            ObjectClass::PrivateKey => {
                let d = bn(self.component(AttributeType::PrivateExponent)?)?;
                let crt = [
                    AttributeType::Prime1,
                    AttributeType::Prime2,
                    AttributeType::Exponent1,
                    AttributeType::Exponent2,
                    AttributeType::Coefficient,
                ]
                .into_iter()
                .map(|t| self.attributes.bytes_value(t).map(bn))
                .collect::<Option<Result<Vec<_>, _>>>();
                let rsa = match crt {
                    Some(components) => {
                        let mut components = components?.into_iter();
                        let mut next = || components.next().ok_or(Rv::TemplateIncomplete);
                        Rsa::from_private_components(
                            n,
                            e,
                            d,
                            next()?,
                            next()?,
                            next()?,
                            next()?,
                            next()?,
                        )
                    }
                    None => RsaPrivateKeyBuilder::new(n, e, d).map(RsaPrivateKeyBuilder::build),
                };
                rsa.map(RsaKey::Private)
                    .map_err(|_| Rv::AttributeValueInvalid)
            }
            ObjectClass::SecretKey => Err(Rv::KeyTypeInconsistent),
        }
    }

    /// Check the consistency of an EC object (curve known, point on the curve)
    pub(crate) fn check_ec(&self) -> Result<(), Rv> {
        let curve = EcCurve::from_oid_der(self.component(AttributeType::EcParams)?)
            .ok_or(Rv::AttributeValueInvalid)?;
        let group = EcGroup::from_curve_name(nid(curve)).map_err(|_| Rv::FunctionFailed)?;
        if self.class()? == ObjectClass::PublicKey {
            let point = decode_ec_point(self.component(AttributeType::EcPoint)?)
                .map_err(|e| e.rv)?;
            let mut ctx = openssl::bn::BigNumContext::new().map_err(|_| Rv::HostMemory)?;
            let point =
                EcPoint::from_bytes(&group, &point, &mut ctx).map_err(|_| Rv::AttributeValueInvalid)?;
            EcKey::from_public_key(&group, &point)
                .and_then(|key| key.check_key())
                .map_err(|_| Rv::AttributeValueInvalid)?;
        }
        Ok(())
    }
}

impl AttributeList for StoredObject {
    fn find(&self, attribute_type: AttributeType) -> Option<&Attribute> {
        self.attributes.find(attribute_type)
    }
}
