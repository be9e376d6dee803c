use openssl::{
    bn::{BigNum, BigNumContext},
    dh::Dh,
    dsa::Dsa,
    ec::{EcGroup, EcKey, PointConversionForm},
    rand::rand_bytes,
    rsa::Rsa,
};
use tokenbridge_interfaces::{
    Attribute, AttributeList, AttributeType, EcCurve, KeyType, Mechanism, ObjectClass, Rv,
    encode_ec_point,
};
use zeroize::Zeroizing;

use crate::object::{bn, nid};

const DEFAULT_PUBLIC_EXPONENT: u32 = 65537;

/// Set odd parity on every byte of a DES key
pub(crate) fn set_des_parity(key: &mut [u8]) {
    for byte in key.iter_mut() {
        let upper_bits = (*byte & 0xFE).count_ones();
        *byte = (*byte & 0xFE) | u8::from(upper_bits % 2 == 0);
    }
}

fn random(len: usize) -> Result<Zeroizing<Vec<u8>>, Rv> {
    let mut value = Zeroizing::new(vec![0_u8; len]);
    rand_bytes(&mut value).map_err(|_| Rv::FunctionFailed)?;
    Ok(value)
}

fn secret_len(template: &[Attribute]) -> Result<usize, Rv> {
    let len = template
        .find(AttributeType::ValueLen)
        .and_then(Attribute::as_ulong)
        .ok_or(Rv::TemplateIncomplete)?;
    usize::try_from(len).map_err(|_| Rv::AttributeValueInvalid)
}

/// Check the class and key type requested by a template against the mechanism
fn check_template(
    template: &[Attribute],
    class: ObjectClass,
    key_type: KeyType,
) -> Result<(), Rv> {
    if template.class().is_some_and(|c| c != class)
        || template.key_type().is_some_and(|k| k != key_type)
    {
        return Err(Rv::TemplateInconsistent);
    }
    Ok(())
}

/// Complete a template with the class, the key type, the generated components and the
/// default values of the boolean attributes
fn complete(
    template: &[Attribute],
    class: ObjectClass,
    key_type: KeyType,
    generated: Vec<Attribute>,
) -> Vec<Attribute> {
    let mut attributes = vec![Attribute::Class(class), Attribute::KeyType(key_type)];
    attributes.extend(template.iter().filter(|a| {
        !matches!(
            a.attribute_type(),
            AttributeType::Class | AttributeType::KeyType
        ) && !generated
            .iter()
            .any(|g| g.attribute_type() == a.attribute_type())
    }).cloned());
    attributes.extend(generated);
    for (attribute_type, default) in [
        (AttributeType::Token, Attribute::Token(false)),
        (AttributeType::Private, Attribute::Private(class != ObjectClass::PublicKey)),
        (AttributeType::Sensitive, Attribute::Sensitive(false)),
        (AttributeType::Extractable, Attribute::Extractable(true)),
    ] {
        if class == ObjectClass::PublicKey
            && matches!(attribute_type, AttributeType::Sensitive | AttributeType::Extractable)
        {
            continue;
        }
        if attributes.find(attribute_type).is_none() {
            attributes.push(default);
        }
    }
    attributes
}

/// Generate the attributes of a secret key
pub(crate) fn generate_secret(
    mechanism: &Mechanism,
    template: &[Attribute],
) -> Result<Vec<Attribute>, Rv> {
    let (key_type, len) = match mechanism {
        Mechanism::AesKeyGen => {
            let len = secret_len(template)?;
            if ![16, 24, 32].contains(&len) {
                return Err(Rv::KeySizeRange);
            }
            (KeyType::Aes, len)
        }
        Mechanism::DesKeyGen => (KeyType::Des, 8),
        Mechanism::Des2KeyGen => (KeyType::Des2, 16),
        Mechanism::Des3KeyGen => (KeyType::Des3, 24),
        Mechanism::GenericSecretKeyGen => {
            let len = secret_len(template)?;
            if len == 0 {
                return Err(Rv::KeySizeRange);
            }
            (KeyType::GenericSecret, len)
        }
        _ => return Err(Rv::MechanismInvalid),
    };
    check_template(template, ObjectClass::SecretKey, key_type)?;
    let mut value = random(len)?;
    if matches!(key_type, KeyType::Des | KeyType::Des2 | KeyType::Des3) {
        set_des_parity(&mut value);
    }
    Ok(complete(
        template,
        ObjectClass::SecretKey,
        key_type,
        vec![Attribute::ValueLen(len as u64), Attribute::Value(value)],
    ))
}

fn bytes(n: &openssl::bn::BigNumRef) -> Vec<u8> {
    n.to_vec()
}

fn secret(n: &openssl::bn::BigNumRef) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(n.to_vec())
}

/// Generate the attributes of a key pair, public key first
pub(crate) fn generate_pair(
    mechanism: &Mechanism,
    public_template: &[Attribute],
    private_template: &[Attribute],
) -> Result<(Vec<Attribute>, Vec<Attribute>), Rv> {
    let failed = |_| Rv::FunctionFailed;
    let (key_type, public, private) = match mechanism {
        Mechanism::RsaPkcsKeyPairGen => {
            let bits = public_template
                .find(AttributeType::ModulusBits)
                .and_then(Attribute::as_ulong)
                .ok_or(Rv::TemplateIncomplete)?;
            let bits = u32::try_from(bits).map_err(|_| Rv::KeySizeRange)?;
            if bits < 512 {
                return Err(Rv::KeySizeRange);
            }
            let e = match public_template.bytes_value(AttributeType::PublicExponent) {
                Some(e) => bn(e)?,
                None => BigNum::from_u32(DEFAULT_PUBLIC_EXPONENT).map_err(failed)?,
            };
            let rsa = Rsa::generate_with_e(bits, &e).map_err(failed)?;
            let modulus = bytes(rsa.n());
            let public_exponent = bytes(rsa.e());
            let crt = rsa
                .p()
                .zip(rsa.q())
                .zip(rsa.dmp1().zip(rsa.dmq1()).zip(rsa.iqmp()))
                .ok_or(Rv::FunctionFailed)?;
            let ((p, q), ((dp, dq), qi)) = crt;
            (
                KeyType::Rsa,
                vec![
                    Attribute::Modulus(modulus.clone()),
                    Attribute::ModulusBits(u64::from(bits)),
                    Attribute::PublicExponent(public_exponent.clone()),
                ],
                vec![
                    Attribute::Modulus(modulus),
                    Attribute::PublicExponent(public_exponent),
                    Attribute::PrivateExponent(secret(rsa.d())),
                    Attribute::Prime1(secret(p)),
                    Attribute::Prime2(secret(q)),
                    Attribute::Exponent1(secret(dp)),
                    Attribute::Exponent2(secret(dq)),
                    Attribute::Coefficient(secret(qi)),
                ],
            )
        }
        Mechanism::EcKeyPairGen => {
            let params = public_template
                .bytes_value(AttributeType::EcParams)
                .ok_or(Rv::TemplateIncomplete)?;
            let curve = EcCurve::from_oid_der(params).ok_or(Rv::AttributeValueInvalid)?;
            let group = EcGroup::from_curve_name(nid(curve)).map_err(failed)?;
            let key = EcKey::generate(&group).map_err(failed)?;
            let mut ctx = BigNumContext::new().map_err(failed)?;
            let point = key
                .public_key()
                .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)
                .map_err(failed)?;
            let scalar_len = curve.field_bits().div_ceil(8);
            let scalar = key
                .private_key()
                .to_vec_padded(i32::try_from(scalar_len).map_err(|_| Rv::GeneralError)?)
                .map_err(failed)?;
            (
                KeyType::Ec,
                vec![
                    Attribute::EcParams(params.to_vec()),
                    Attribute::EcPoint(encode_ec_point(&point).map_err(|e| e.rv)?),
                ],
                vec![
                    Attribute::EcParams(params.to_vec()),
                    Attribute::Value(Zeroizing::new(scalar)),
                ],
            )
        }
        Mechanism::DsaKeyPairGen => {
            let domain = |t| {
                public_template
                    .bytes_value(t)
                    .ok_or(Rv::TemplateIncomplete)
                    .map(<[u8]>::to_vec)
            };
            let (p, q, g) = (
                domain(AttributeType::Prime)?,
                domain(AttributeType::Subprime)?,
                domain(AttributeType::Base)?,
            );
            let dsa = Dsa::from_pqg(bn(&p)?, bn(&q)?, bn(&g)?)
                .and_then(Dsa::generate_key)
                .map_err(|_| Rv::AttributeValueInvalid)?;
            (
                KeyType::Dsa,
                vec![
                    Attribute::Prime(p.clone()),
                    Attribute::Subprime(q.clone()),
                    Attribute::Base(g.clone()),
                    Attribute::Value(Zeroizing::new(bytes(dsa.pub_key()))),
                ],
                vec![
                    Attribute::Prime(p),
                    Attribute::Subprime(q),
                    Attribute::Base(g),
                    Attribute::Value(secret(dsa.priv_key())),
                ],
            )
        }
        Mechanism::DhPkcsKeyPairGen => {
            let p = public_template
                .bytes_value(AttributeType::Prime)
                .ok_or(Rv::TemplateIncomplete)?
                .to_vec();
            let g = public_template
                .bytes_value(AttributeType::Base)
                .ok_or(Rv::TemplateIncomplete)?
                .to_vec();
            let dh = Dh::from_pqg(bn(&p)?, None, bn(&g)?)
                .and_then(Dh::generate_key)
                .map_err(|_| Rv::AttributeValueInvalid)?;
            (
                KeyType::Dh,
                vec![
                    Attribute::Prime(p.clone()),
                    Attribute::Base(g.clone()),
                    Attribute::Value(Zeroizing::new(bytes(dh.public_key()))),
                ],
                vec![
                    Attribute::Prime(p),
                    Attribute::Base(g),
                    Attribute::Value(secret(dh.private_key())),
                ],
            )
        }
        _ => return Err(Rv::MechanismInvalid),
    };
    check_template(public_template, ObjectClass::PublicKey, key_type)?;
    check_template(private_template, ObjectClass::PrivateKey, key_type)?;
    Ok((
        complete(public_template, ObjectClass::PublicKey, key_type, public),
        complete(private_template, ObjectClass::PrivateKey, key_type, private),
    ))
}

#[cfg(test)]
mod tests {
    use super::set_des_parity;

    #[test]
    fn test_des_parity() {
        let mut key = [0x00_u8, 0x01, 0xFE, 0xFF, 0x10, 0x11, 0x7E, 0x80];
        set_des_parity(&mut key);
        assert_eq!(key, [0x01, 0x01, 0xFE, 0xFE, 0x10, 0x10, 0x7F, 0x80]);
        assert!(key.iter().all(|b| b.count_ones() % 2 == 1));
    }
}
