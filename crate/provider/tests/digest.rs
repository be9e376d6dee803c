#![allow(clippy::unwrap_used)]

use openssl::hash::{MessageDigest, hash};
use tokenbridge_provider::{
    Digest, DigestAlgorithm, HError, HResult, KeyAlgorithm, TokenConfig,
};

mod common;

use common::{AES_128_KEY, default_setup, import, setup};

#[test]
fn test_known_answers() -> HResult<()> {
    let (_soft, token) = default_setup()?;
    for (algorithm, reference) in [
        (DigestAlgorithm::Md5, MessageDigest::md5()),
        (DigestAlgorithm::Sha1, MessageDigest::sha1()),
        (DigestAlgorithm::Sha224, MessageDigest::sha224()),
        (DigestAlgorithm::Sha256, MessageDigest::sha256()),
        (DigestAlgorithm::Sha384, MessageDigest::sha384()),
        (DigestAlgorithm::Sha512, MessageDigest::sha512()),
    ] {
        let mut digest = Digest::new(token.clone(), algorithm);
        digest.update(b"abc")?;
        let output = digest.digest()?;
        assert_eq!(output.len(), digest.length(), "{algorithm}");
        assert_eq!(output, hash(reference, b"abc").unwrap().to_vec(), "{algorithm}");
    }
    assert!(matches!(
        Digest::from_name(token, "SHA-3"),
        Err(HError::NoSuchAlgorithm(_))
    ));
    Ok(())
}

#[test]
fn test_buffering_threshold() -> HResult<()> {
    let message: Vec<u8> = (0..1000_u32).map(|i| (i % 251) as u8).collect();
    let expected = hash(MessageDigest::sha256(), &message).unwrap().to_vec();

    for threshold in [0, 96, 4096] {
        let (soft, token) = setup(TokenConfig {
            digest_buffer_size: threshold,
            ..TokenConfig::default()
        })?;
        let mut digest = Digest::from_name(token.clone(), "SHA256")?;
        for chunk in message.chunks(33) {
            digest.update(chunk)?;
        }
        assert_eq!(digest.digest()?, expected, "threshold {threshold}");

        // the digest is reusable and deterministic
        for byte in &message {
            digest.update(std::slice::from_ref(byte))?;
        }
        assert_eq!(digest.digest()?, expected, "threshold {threshold}");

        let single = soft.call_count("C_DigestSingle");
        if threshold >= message.len() {
            assert_eq!(single, 2);
            assert_eq!(soft.call_count("C_DigestInit"), 0);
        } else {
            assert_eq!(single, 0);
            assert_eq!(soft.call_count("C_DigestInit"), 2);
        }
        assert_eq!(token.session_manager().stats().checked_out(), 0);
    }
    Ok(())
}

#[test]
fn test_short_output() -> HResult<()> {
    let (_soft, token) = default_setup()?;
    let mut digest = Digest::new(token, DigestAlgorithm::Sha1);
    digest.update(b"data")?;
    let mut output = [0_u8; 19];
    assert!(matches!(
        digest.digest_into(&mut output),
        Err(HError::Digest(_))
    ));
    // the digest is left untouched
    let mut output = [0_u8; 64];
    assert_eq!(digest.digest_into(&mut output)?, 20);
    assert_eq!(
        &output[..20],
        &hash(MessageDigest::sha1(), b"data").unwrap()[..]
    );
    Ok(())
}

#[test]
fn test_reset() -> HResult<()> {
    let (soft, token) = setup(TokenConfig {
        digest_buffer_size: 4,
        ..TokenConfig::default()
    })?;
    let mut digest = Digest::new(token, DigestAlgorithm::Sha256);
    digest.update(b"discarded data")?;
    digest.reset();
    digest.update(b"abc")?;
    assert_eq!(
        digest.digest()?,
        hash(MessageDigest::sha256(), b"abc").unwrap().to_vec()
    );
    // the digest of the token was cancelled with a final call
    assert_eq!(soft.call_count("C_DigestFinal"), 1);
    Ok(())
}

#[test]
fn test_update_key() -> HResult<()> {
    let (_soft, token) = default_setup()?;
    let key = import(&token, &AES_128_KEY, KeyAlgorithm::Aes)?;
    let mut digest = Digest::new(token.clone(), DigestAlgorithm::Sha256);
    digest.update(b"prefix")?;
    digest.update_key(&key)?;
    let expected = hash(
        MessageDigest::sha256(),
        &[b"prefix".as_slice(), AES_128_KEY.as_slice()].concat(),
    )
    .unwrap()
    .to_vec();
    assert_eq!(digest.digest()?, expected);

    // a key of another token is digested through its value
    let (_other_soft, other) = default_setup()?;
    let mut digest = Digest::new(other, DigestAlgorithm::Sha256);
    digest.update(b"prefix")?;
    digest.update_key(&key)?;
    assert_eq!(digest.digest()?, expected);
    Ok(())
}
