#![allow(clippy::unwrap_used, clippy::panic)]

use tokenbridge_interfaces::{
    Attribute, AttributeType, KeyType, Mechanism, ObjectClass, Rv, TokenBackend,
};
use tokenbridge_logger::log_init;
use zeroize::Zeroizing;

use crate::{SoftToken, SoftTokenConfig, TokenEvent};

fn aes_template(value: &[u8], sensitive: bool) -> Vec<Attribute> {
    vec![
        Attribute::Class(ObjectClass::SecretKey),
        Attribute::KeyType(KeyType::Aes),
        Attribute::Token(false),
        Attribute::Sensitive(sensitive),
        Attribute::Value(Zeroizing::new(value.to_vec())),
    ]
}

#[test]
fn test_aes_cbc_multi_part() {
    log_init(None);
    let token = SoftToken::default();
    let session = token.open_session(true).unwrap();
    let key = token
        .create_object(session, &aes_template(&[7_u8; 16], false))
        .unwrap();
    let iv = vec![1_u8; 16];
    let plaintext = [0x42_u8; 40];

    token
        .encrypt_init(session, &Mechanism::AesCbc(iv.clone()), key)
        .unwrap();
    let mut ciphertext = vec![0_u8; 32];
    // 20 bytes in: one block out, 4 bytes buffered
    assert_eq!(
        token
            .encrypt_update(session, &plaintext[..20], &mut ciphertext[..16])
            .unwrap(),
        16
    );
    assert_eq!(
        token
            .encrypt_update(session, &plaintext[20..32], &mut ciphertext[16..])
            .unwrap(),
        16
    );
    // 8 bytes left over: not a multiple of the block size
    token.encrypt_update(session, &plaintext[32..], &mut []).unwrap();
    let err = token.encrypt_final(session, &mut []).unwrap_err();
    assert_eq!(err.rv, Rv::DataLenRange);
    assert!(!token.operation_active(session));

    token
        .decrypt_init(session, &Mechanism::AesCbc(iv), key)
        .unwrap();
    let mut decrypted = vec![0_u8; 32];
    assert_eq!(
        token.decrypt(session, &ciphertext, &mut decrypted).unwrap(),
        32
    );
    assert_eq!(decrypted, plaintext[..32]);
}

#[test]
fn test_buffer_too_small_keeps_operation() {
    let token = SoftToken::default();
    let session = token.open_session(true).unwrap();
    let key = token
        .create_object(session, &aes_template(&[9_u8; 32], false))
        .unwrap();
    token.encrypt_init(session, &Mechanism::AesEcb, key).unwrap();
    let err = token
        .encrypt_update(session, &[0_u8; 32], &mut [0_u8; 16])
        .unwrap_err();
    assert_eq!(err.rv, Rv::BufferTooSmall);
    assert!(token.operation_active(session));
    let mut output = [0_u8; 32];
    assert_eq!(
        token
            .encrypt_update(session, &[0_u8; 32], &mut output)
            .unwrap(),
        32
    );
    assert_eq!(token.encrypt_final(session, &mut []).unwrap(), 0);
    assert!(!token.operation_active(session));
}

#[test]
fn test_operation_active() {
    let token = SoftToken::default();
    let session = token.open_session(true).unwrap();
    token.digest_init(session, &Mechanism::Sha256).unwrap();
    let err = token.digest_init(session, &Mechanism::Sha1).unwrap_err();
    assert_eq!(err.rv, Rv::OperationActive);
    token.digest_update(session, b"abc").unwrap();
    let mut digest = [0_u8; 32];
    token.digest_final(session, &mut digest).unwrap();
    assert_eq!(
        digest[..4],
        [0xba, 0x78, 0x16, 0xbf],
        "SHA-256(abc) starts with ba7816bf"
    );
}

#[test]
fn test_session_close_destroys_session_objects() {
    let token = SoftToken::default();
    let session = token.open_session(true).unwrap();
    let mut persistent = aes_template(&[1_u8; 16], false);
    persistent[2] = Attribute::Token(true);
    token.create_object(session, &persistent).unwrap();
    token
        .create_object(session, &aes_template(&[2_u8; 16], false))
        .unwrap();
    assert_eq!(token.session_objects(), 1);
    token.close_session(session).unwrap();
    assert_eq!(token.session_objects(), 0);
    assert!(token.events().contains(&TokenEvent::SessionClosed {
        session,
        owned_objects: 1
    }));
}

#[test]
fn test_sensitive_value_not_readable() {
    let token = SoftToken::default();
    let session = token.open_session(true).unwrap();
    let key = token
        .create_object(session, &aes_template(&[3_u8; 16], true))
        .unwrap();
    let err = token
        .get_attribute_value(session, key, &[AttributeType::Value])
        .unwrap_err();
    assert_eq!(err.rv, Rv::AttributeSensitive);
    let attributes = token
        .get_attribute_value(
            session,
            key,
            &[AttributeType::Sensitive, AttributeType::KeyType],
        )
        .unwrap();
    assert_eq!(
        attributes,
        vec![Attribute::Sensitive(true), Attribute::KeyType(KeyType::Aes)]
    );
}

#[test]
fn test_session_limit_and_removal() {
    let token = SoftToken::new(SoftTokenConfig {
        max_sessions: Some(2),
        removable: true,
        ..SoftTokenConfig::default()
    });
    token.open_session(true).unwrap();
    token.open_session(false).unwrap();
    assert_eq!(
        token.open_session(true).unwrap_err().rv,
        Rv::SessionCount
    );
    token.remove();
    assert_eq!(token.token_info().unwrap_err().rv, Rv::TokenNotPresent);
    assert_eq!(
        token.open_session(true).unwrap_err().rv,
        Rv::DeviceRemoved
    );
}

#[test]
fn test_rsa_sign_and_recover() {
    let token = SoftToken::default();
    let session = token.open_session(true).unwrap();
    let (public, private) = token
        .generate_key_pair(
            session,
            &Mechanism::RsaPkcsKeyPairGen,
            &[Attribute::ModulusBits(1024)],
            &[Attribute::Sensitive(true)],
        )
        .unwrap();
    token.sign_init(session, &Mechanism::RsaPkcs, private).unwrap();
    let mut signature = vec![0_u8; 128];
    assert_eq!(
        token.sign(session, b"raw data", &mut signature).unwrap(),
        128
    );
    token
        .verify_recover_init(session, &Mechanism::RsaPkcs, public)
        .unwrap();
    let mut recovered = vec![0_u8; 128];
    let len = token
        .verify_recover(session, &signature, &mut recovered)
        .unwrap();
    assert_eq!(&recovered[..len], b"raw data");

    // encrypting with the private key is not permitted
    let err = token
        .encrypt_init(session, &Mechanism::RsaPkcs, private)
        .unwrap_err();
    assert_eq!(err.rv, Rv::KeyFunctionNotPermitted);
}

#[test]
fn test_wrap_unwrap() {
    let token = SoftToken::default();
    let session = token.open_session(true).unwrap();
    let kek = token
        .create_object(session, &aes_template(&[5_u8; 32], true))
        .unwrap();
    let key = token
        .create_object(session, &aes_template(&[6_u8; 16], false))
        .unwrap();
    let wrapped = token
        .wrap_key(session, &Mechanism::AesEcb, kek, key)
        .unwrap();
    assert_eq!(wrapped.len(), 16);
    let unwrapped = token
        .unwrap_key(
            session,
            &Mechanism::AesEcb,
            kek,
            &wrapped,
            &[
                Attribute::Class(ObjectClass::SecretKey),
                Attribute::KeyType(KeyType::Aes),
            ],
        )
        .unwrap();
    let value = token
        .get_attribute_value(session, unwrapped, &[AttributeType::Value])
        .unwrap();
    assert_eq!(value, vec![Attribute::Value(Zeroizing::new(vec![6_u8; 16]))]);

    // non extractable keys cannot be wrapped
    let mut locked = aes_template(&[8_u8; 16], false);
    locked.push(Attribute::Extractable(false));
    let locked = token.create_object(session, &locked).unwrap();
    assert_eq!(
        token
            .wrap_key(session, &Mechanism::AesEcb, kek, locked)
            .unwrap_err()
            .rv,
        Rv::KeyUnextractable
    );
}

#[test]
fn test_single_des() {
    let token = SoftToken::default();
    let session = token.open_session(true).unwrap();
    let key = token
        .create_object(
            session,
            &[
                Attribute::Class(ObjectClass::SecretKey),
                Attribute::KeyType(KeyType::Des),
                Attribute::Value(Zeroizing::new(vec![0x01_u8; 8])),
            ],
        )
        .unwrap();

    token.encrypt_init(session, &Mechanism::DesEcb, key).unwrap();
    let mut ciphertext = [0_u8; 8];
    token
        .encrypt(
            session,
            &[0x95, 0xf8, 0xa5, 0xe5, 0xdd, 0x31, 0xd9, 0x00],
            &mut ciphertext,
        )
        .unwrap();
    assert_eq!(ciphertext, [0x80, 0, 0, 0, 0, 0, 0, 0]);

    let iv = vec![3_u8; 8];
    let plaintext = [0x5a_u8; 13];
    token
        .encrypt_init(session, &Mechanism::DesCbcPad(iv.clone()), key)
        .unwrap();
    let mut padded = [0_u8; 16];
    assert_eq!(token.encrypt(session, &plaintext, &mut padded).unwrap(), 16);
    token
        .decrypt_init(session, &Mechanism::DesCbcPad(iv), key)
        .unwrap();
    let mut decrypted = [0_u8; 16];
    let len = token.decrypt(session, &padded, &mut decrypted).unwrap();
    assert_eq!(&decrypted[..len], &plaintext);
}
