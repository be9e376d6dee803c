#![allow(clippy::unwrap_used, clippy::panic)]

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    thread,
    time::Duration,
};

use openssl::{
    dh::Dh,
    ec::{EcGroup, EcKey},
    nid::Nid,
    pkey::PKey,
    rsa::Rsa,
};
use tokenbridge_interfaces::{BooleanAttribute, EcCurve, KeyType, ObjectClass};
use tokenbridge_provider::{
    Cipher, CipherMode, ExternalKey, GeneratedKey, HError, HResult, KeyAlgorithm, KeyFactory,
    KeyGenParams, KeyGenerator, KeyMaterial, TemplateEntry, TemplateOperation, TokenConfig,
};
use tokenbridge_soft_token::TokenEvent;
use zeroize::Zeroizing;

mod common;

use common::{AES_128_KEY, default_setup, des_ede_key, import, setup};

fn sensitive_imports() -> TokenConfig {
    TokenConfig {
        secret_key_cache_size: 0,
        attributes: vec![TemplateEntry {
            operation: Some(TemplateOperation::Import),
            class: Some(ObjectClass::SecretKey),
            key_type: None,
            values: BTreeMap::from([(BooleanAttribute::Sensitive, true)]),
        }],
        ..TokenConfig::default()
    }
}

#[test]
fn test_import_cache() -> HResult<()> {
    let (soft, token) = default_setup()?;
    let first = import(&token, &des_ede_key(), KeyAlgorithm::DesEde)?;
    let second = import(&token, &des_ede_key(), KeyAlgorithm::DesEde)?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(soft.call_count("C_CreateObject"), 1);
    assert_eq!(token.cached_secret_keys(), 1);
    assert_eq!(first.key_type(), KeyType::Des3);

    match first.material()? {
        KeyMaterial::Secret(value) => {
            assert_eq!(value.len(), 24);
            assert!(value.iter().all(|byte| byte.count_ones() % 2 == 1));
        }
        material => panic!("unexpected material {material:?}"),
    }

    // the same material under another algorithm is another key
    let generic = import(&token, &des_ede_key(), KeyAlgorithm::Generic)?;
    assert!(!Arc::ptr_eq(&first, &generic));
    assert_eq!(soft.call_count("C_CreateObject"), 2);

    assert!(matches!(
        import(&token, &[0_u8; 10], KeyAlgorithm::Aes),
        Err(HError::InvalidKey(_))
    ));
    assert!(matches!(
        import(&token, &[0_u8; 16], KeyAlgorithm::Rsa),
        Err(HError::InvalidKey(_))
    ));
    Ok(())
}

#[test]
fn test_key_equality() -> HResult<()> {
    let (_soft, token) = setup(TokenConfig {
        secret_key_cache_size: 0,
        ..TokenConfig::default()
    })?;
    let first = import(&token, &AES_128_KEY, KeyAlgorithm::Aes)?;
    let second = import(&token, &AES_128_KEY, KeyAlgorithm::Aes)?;
    assert_ne!(first.handle(), second.handle());
    assert_eq!(*first, *second);
    let keys: HashSet<Arc<_>> = [first.clone(), second.clone()].into_iter().collect();
    assert_eq!(keys.len(), 1);

    let other = import(&token, &[1_u8; 16], KeyAlgorithm::Aes)?;
    assert_ne!(*first, *other);

    // sensitive keys are only equal to themselves
    let (_soft, token) = setup(sensitive_imports())?;
    let first = import(&token, &AES_128_KEY, KeyAlgorithm::Aes)?;
    let second = import(&token, &AES_128_KEY, KeyAlgorithm::Aes)?;
    assert!(first.is_sensitive());
    assert!(!first.is_readable());
    assert_eq!(*first, *first.clone());
    assert_ne!(*first, *second);
    assert!(first.encoded().is_none());
    assert!(matches!(first.material(), Err(HError::InvalidKey(_))));
    Ok(())
}

#[test]
fn test_key_disposal() -> HResult<()> {
    let (soft, token) = setup(TokenConfig {
        secret_key_cache_size: 0,
        ..TokenConfig::default()
    })?;
    let key = import(&token, &AES_128_KEY, KeyAlgorithm::Aes)?;
    let handle = key.handle();
    assert_eq!(soft.session_objects(), 1);
    assert_eq!(token.live_session_objects(), 1);
    assert_eq!(token.session_manager().stats().object_pool, 1);

    drop(key);
    assert_eq!(soft.session_objects(), 1);
    assert_eq!(token.drain_disposed_keys(), 1);
    assert_eq!(token.drain_disposed_keys(), 0);
    assert_eq!(token.live_session_objects(), 0);
    assert_eq!(soft.session_objects(), 0);
    assert!(soft.events().contains(&TokenEvent::ObjectDestroyed(handle)));

    // the session owning the key is demoted once the key is destroyed
    let stats = token.session_manager().stats();
    assert_eq!(stats.object_pool, 0);
    assert_eq!(stats.operation_pool, stats.open);

    // creating a key destroys the keys dropped before
    let dropped = import(&token, &[1_u8; 16], KeyAlgorithm::Aes)?;
    let handle = dropped.handle();
    drop(dropped);
    let kept = import(&token, &[2_u8; 16], KeyAlgorithm::Aes)?;
    assert!(soft.events().contains(&TokenEvent::ObjectDestroyed(handle)));
    assert_eq!(soft.session_objects(), 1);
    assert_eq!(token.live_session_objects(), 1);
    drop(kept);
    Ok(())
}

#[test]
fn test_background_reaper() -> HResult<()> {
    let (soft, token) = setup(TokenConfig {
        secret_key_cache_size: 0,
        background_key_reaper: true,
        ..TokenConfig::default()
    })?;
    let keys = (0_u8..4)
        .map(|i| import(&token, &[i; 16], KeyAlgorithm::Aes))
        .collect::<HResult<Vec<_>>>()?;
    assert_eq!(soft.session_objects(), 4);
    drop(keys);
    for _ in 0..250 {
        if soft.session_objects() == 0 && token.live_session_objects() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(soft.session_objects(), 0);
    assert_eq!(token.live_session_objects(), 0);
    Ok(())
}

#[test]
fn test_token_removal() -> HResult<()> {
    let (soft, token) = setup(TokenConfig {
        presence_check_interval_ms: 0,
        ..TokenConfig::default()
    })?;
    let key = import(&token, &AES_128_KEY, KeyAlgorithm::Aes)?;
    let mut cipher = Cipher::new(token.clone(), "AES/CBC/PKCS5Padding")?;
    cipher.init(CipherMode::Encrypt, &key, None)?;
    cipher.update(&[0_u8; 40])?;

    soft.remove();
    assert!(matches!(
        cipher.update(&[0_u8; 16]),
        Err(HError::TokenInvalid(_))
    ));
    assert!(!token.is_valid());
    assert!(matches!(
        import(&token, &[1_u8; 16], KeyAlgorithm::Aes),
        Err(HError::TokenInvalid(_))
    ));
    assert!(matches!(
        KeyGenerator::new(token.clone(), KeyAlgorithm::Aes)?.generate_key(),
        Err(HError::TokenInvalid(_))
    ));
    assert!(matches!(
        token.generate_random(8),
        Err(HError::TokenInvalid(_))
    ));
    assert_eq!(token.cached_secret_keys(), 0);

    drop(cipher);
    drop(key);
    assert_eq!(token.drain_disposed_keys(), 0);
    assert_eq!(token.live_session_objects(), 0);
    assert_eq!(token.session_manager().stats().open, 0);
    Ok(())
}

#[test]
fn test_generate_secret_keys() -> HResult<()> {
    let (_soft, token) = default_setup()?;
    let mut generator = KeyGenerator::new(token.clone(), KeyAlgorithm::Aes)?;
    assert_eq!(generator.generate_key()?.bits(), 128);
    for bits in [128, 192, 256] {
        generator.init(KeyGenParams::Size(bits))?;
        let key = generator.generate_key()?;
        assert_eq!(key.bits(), bits);
        assert_eq!(key.byte_len(), bits / 8);
        assert_eq!(key.key_type(), KeyType::Aes);
    }
    assert!(matches!(
        generator.init(KeyGenParams::Size(100)),
        Err(HError::InvalidParameter(_))
    ));
    assert!(matches!(
        generator.generate_key_pair(),
        Err(HError::IllegalState(_))
    ));

    let mut generator = KeyGenerator::new(token.clone(), KeyAlgorithm::DesEde)?;
    for (bits, key_type) in [(112, KeyType::Des2), (168, KeyType::Des3)] {
        generator.init(KeyGenParams::Size(bits))?;
        let GeneratedKey::Secret(key) = generator.generate()? else {
            panic!("DESede keys are secret keys");
        };
        assert_eq!(key.key_type(), key_type);
        assert_eq!(key.algorithm(), KeyAlgorithm::DesEde);
    }

    let mut generator = KeyGenerator::new(token.clone(), KeyAlgorithm::Generic)?;
    generator.init(KeyGenParams::Size(160))?;
    let key = generator.generate_key()?;
    assert_eq!(key.key_type(), KeyType::GenericSecret);
    assert_eq!(key.byte_len(), 20);
    assert!(matches!(
        generator.init(KeyGenParams::Size(12)),
        Err(HError::InvalidParameter(_))
    ));
    assert!(matches!(
        generator.init(KeyGenParams::Curve(EcCurve::P256)),
        Err(HError::InvalidParameter(_))
    ));
    Ok(())
}

#[test]
fn test_generate_key_pairs() -> HResult<()> {
    let (_soft, token) = default_setup()?;

    let mut generator = KeyGenerator::new(token.clone(), KeyAlgorithm::Ec)?;
    let pair = generator.generate_key_pair()?;
    assert_eq!(pair.public.bits(), 256);
    assert_eq!(pair.public.class(), ObjectClass::PublicKey);
    assert_eq!(pair.private.class(), ObjectClass::PrivateKey);
    assert!(matches!(
        pair.public.material()?,
        KeyMaterial::EcPublic {
            curve: EcCurve::P256,
            ..
        }
    ));
    generator.init(KeyGenParams::Curve(EcCurve::P384))?;
    assert_eq!(generator.generate_key_pair()?.private.bits(), 384);
    assert!(matches!(
        generator.generate_key(),
        Err(HError::IllegalState(_))
    ));

    let mut generator = KeyGenerator::new(token.clone(), KeyAlgorithm::Rsa)?;
    generator.init(KeyGenParams::Rsa {
        bits: 1024,
        public_exponent: vec![0x03],
    })?;
    let pair = generator.generate_key_pair()?;
    match pair.public.material()? {
        KeyMaterial::RsaPublic {
            public_exponent, ..
        } => assert_eq!(public_exponent, &[0x03]),
        material => panic!("unexpected material {material:?}"),
    }
    assert!(matches!(
        pair.private.material()?,
        KeyMaterial::RsaPrivateCrt { .. }
    ));
    assert!(matches!(
        generator.init(KeyGenParams::Size(256)),
        Err(HError::InvalidParameter(_))
    ));

    let mut generator = KeyGenerator::new(token.clone(), KeyAlgorithm::Dsa)?;
    generator.init(KeyGenParams::Size(1024))?;
    let pair = generator.generate_key_pair()?;
    assert_eq!(pair.public.algorithm(), KeyAlgorithm::Dsa);
    assert!(pair.public.encoded().is_some());
    assert!(matches!(
        generator.init(KeyGenParams::Size(1000)),
        Err(HError::InvalidParameter(_))
    ));

    let dh = Dh::get_1024_160()?;
    let mut generator = KeyGenerator::new(token, KeyAlgorithm::Dh)?;
    generator.init(KeyGenParams::Dh {
        prime: dh.prime_p().to_vec(),
        base: dh.generator().to_vec(),
    })?;
    let pair = generator.generate_key_pair()?;
    assert_eq!(pair.private.key_type(), KeyType::Dh);
    // DH keys have no encoding: distinct keys are never equal
    assert!(pair.public.encoded().is_none());
    assert_eq!(*pair.public, *pair.public.clone());
    Ok(())
}

#[test]
fn test_import_encoded_keys() -> HResult<()> {
    let (_soft, token) = default_setup()?;
    let factory = KeyFactory::new(token.clone());

    let group = EcGroup::from_curve_name(Nid::SECP384R1)?;
    let ec = PKey::from_ec_key(EcKey::generate(&group)?)?;
    let public = factory.import_key(ExternalKey::X509(ec.public_key_to_der()?))?;
    assert_eq!(public.algorithm(), KeyAlgorithm::Ec);
    assert_eq!(public.class(), ObjectClass::PublicKey);
    assert_eq!(public.bits(), 384);
    let encoded = public.encoded().unwrap();
    assert_eq!(&KeyMaterial::from_public_der(&encoded)?, public.material()?);
    let private = factory.import_key(ExternalKey::Pkcs8(Zeroizing::new(
        ec.private_key_to_pkcs8()?,
    )))?;
    assert_eq!(private.class(), ObjectClass::PrivateKey);

    // an imported RSA key pair works with the ciphers of the token
    let rsa = PKey::from_rsa(Rsa::generate(1024)?)?;
    let public = factory.import_key(ExternalKey::X509(rsa.public_key_to_der()?))?;
    let private = factory.import_key(ExternalKey::Pkcs8(Zeroizing::new(
        rsa.private_key_to_pkcs8()?,
    )))?;
    assert_eq!(public.byte_len(), 128);
    let mut cipher = Cipher::new(token.clone(), "RSA/ECB/PKCS1Padding")?;
    cipher.init(CipherMode::Encrypt, &public, None)?;
    let ciphertext = cipher.do_final(b"secret message")?;
    cipher.init(CipherMode::Decrypt, &private, None)?;
    assert_eq!(cipher.do_final(&ciphertext)?, b"secret message");

    assert!(matches!(
        factory.import_key(ExternalKey::Structured(KeyMaterial::Secret(Zeroizing::new(
            vec![0_u8; 16]
        )))),
        Err(HError::InvalidKey(_))
    ));
    assert!(factory.import_key(ExternalKey::X509(vec![0x30, 0x00])).is_err());
    Ok(())
}

#[test]
fn test_translate() -> HResult<()> {
    let (_soft, token) = default_setup()?;
    let (_other_soft, other) = default_setup()?;
    let key = import(&token, &AES_128_KEY, KeyAlgorithm::Aes)?;

    let translated = KeyFactory::new(other.clone()).translate(&key)?;
    assert!(translated.belongs_to(&other));
    assert!(!translated.belongs_to(&token));
    assert!(key.belongs_to(&token));
    assert_eq!(*translated, *key);
    let again = KeyFactory::new(other.clone()).translate(&key)?;
    assert!(Arc::ptr_eq(&translated, &again));
    assert!(Arc::ptr_eq(
        &KeyFactory::new(token.clone()).translate(&key)?,
        &key
    ));

    // a cipher of one token accepts the keys of another
    let iv = [9_u8; 16];
    let mut cipher = Cipher::new(other.clone(), "AES/CBC/PKCS5Padding")?;
    cipher.init(CipherMode::Encrypt, &key, Some(&iv))?;
    let ciphertext = cipher.do_final(b"crossing tokens")?;
    let mut decipher = Cipher::new(token, "AES/CBC/PKCS5Padding")?;
    decipher.init(CipherMode::Decrypt, &key, Some(&iv))?;
    assert_eq!(decipher.do_final(&ciphertext)?, b"crossing tokens");

    let (_soft, locked) = setup(sensitive_imports())?;
    let sensitive = import(&locked, &AES_128_KEY, KeyAlgorithm::Aes)?;
    assert!(matches!(
        KeyFactory::new(other).translate(&sensitive),
        Err(HError::InvalidKey(_))
    ));
    Ok(())
}

#[test]
fn test_wrap_unwrap() -> HResult<()> {
    let (_soft, token) = default_setup()?;
    let kek = import(&token, &[0x33_u8; 32], KeyAlgorithm::Aes)?;
    let key = import(&token, &AES_128_KEY, KeyAlgorithm::Aes)?;

    let mut cipher = Cipher::new(token.clone(), "AES/ECB/NoPadding")?;
    cipher.init(CipherMode::Wrap, &kek, None)?;
    let wrapped = cipher.wrap(&key)?;
    assert_eq!(wrapped.len(), 16);
    cipher.init(CipherMode::Unwrap, &kek, None)?;
    let unwrapped = cipher.unwrap(&wrapped, KeyAlgorithm::Aes, ObjectClass::SecretKey)?;
    assert_eq!(unwrapped.bits(), 128);
    assert_eq!(*unwrapped, *key);
    assert!(matches!(
        cipher.unwrap(&wrapped, KeyAlgorithm::Rsa, ObjectClass::PrivateKey),
        Err(HError::InvalidKey(_))
    ));

    let mut cipher = Cipher::new(token.clone(), "AES/CBC/PKCS5Padding")?;
    cipher.init(CipherMode::Wrap, &kek, None)?;
    let wrapped = cipher.wrap(&key)?;
    assert_eq!(wrapped.len(), 32);
    let iv = cipher.iv().map(<[u8]>::to_vec);
    cipher.init(CipherMode::Unwrap, &kek, iv.as_deref())?;
    let unwrapped = cipher.unwrap(&wrapped, KeyAlgorithm::Aes, ObjectClass::SecretKey)?;
    assert_eq!(*unwrapped, *key);
    assert!(matches!(cipher.update(&[0_u8; 16]), Err(HError::IllegalState(_))));

    let mut cipher = Cipher::new(token.clone(), "AES/CTR/NoPadding")?;
    cipher.init(CipherMode::Wrap, &kek, None)?;
    assert!(matches!(cipher.wrap(&key), Err(HError::InvalidParameter(_))));

    // DESede keys wrapped with RSA come back with three keys
    let mut generator = KeyGenerator::new(token.clone(), KeyAlgorithm::Rsa)?;
    generator.init(KeyGenParams::Size(1024))?;
    let pair = generator.generate_key_pair()?;
    let des_ede = import(&token, &des_ede_key(), KeyAlgorithm::DesEde)?;
    let mut cipher = Cipher::new(token, "RSA/ECB/PKCS1Padding")?;
    cipher.init(CipherMode::Wrap, &pair.public, None)?;
    let wrapped = cipher.wrap(&des_ede)?;
    cipher.init(CipherMode::Unwrap, &pair.private, None)?;
    let unwrapped = cipher.unwrap(&wrapped, KeyAlgorithm::DesEde, ObjectClass::SecretKey)?;
    assert_eq!(unwrapped.key_type(), KeyType::Des3);
    assert_eq!(*unwrapped, *des_ede);
    Ok(())
}
