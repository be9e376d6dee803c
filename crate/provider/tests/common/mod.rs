#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;

use openssl::symm::{Cipher as OpensslCipher, Crypter, Mode};
use tokenbridge_logger::log_init;
use tokenbridge_provider::{
    Cipher, CipherMode, HResult, KeyAlgorithm, KeyFactory, Token, TokenConfig, TokenKey,
};
use tokenbridge_soft_token::{SoftToken, SoftTokenConfig};

pub(crate) const AES_128_KEY: [u8; 16] = [
    0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
];

/// Connect a provider to a fresh removable soft token
pub(crate) fn setup(config: TokenConfig) -> HResult<(Arc<SoftToken>, Arc<Token>)> {
    log_init(None);
    let soft = Arc::new(SoftToken::new(SoftTokenConfig {
        removable: true,
        ..SoftTokenConfig::default()
    }));
    let token = Token::new(soft.clone(), config)?;
    Ok((soft, token))
}

pub(crate) fn default_setup() -> HResult<(Arc<SoftToken>, Arc<Token>)> {
    setup(TokenConfig::default())
}

pub(crate) fn import(
    token: &Arc<Token>,
    value: &[u8],
    algorithm: KeyAlgorithm,
) -> HResult<Arc<TokenKey>> {
    KeyFactory::new(token.clone()).import(value, algorithm)
}

pub(crate) fn des_ede_key() -> Vec<u8> {
    (0_u8..24).map(|i| i.wrapping_mul(37).wrapping_add(11)).collect()
}

/// Run a whole operation in a single final call
pub(crate) fn one_shot(
    token: &Arc<Token>,
    transformation: &str,
    mode: CipherMode,
    key: &Arc<TokenKey>,
    iv: Option<&[u8]>,
    input: &[u8],
) -> HResult<(Vec<u8>, Option<Vec<u8>>)> {
    let mut cipher = Cipher::new(token.clone(), transformation)?;
    cipher.init(mode, key, iv)?;
    let output = cipher.do_final(input)?;
    Ok((output, cipher.iv().map(<[u8]>::to_vec)))
}

/// Run a whole operation feeding the input one byte at a time
pub(crate) fn byte_by_byte(
    token: &Arc<Token>,
    transformation: &str,
    mode: CipherMode,
    key: &Arc<TokenKey>,
    iv: Option<&[u8]>,
    input: &[u8],
) -> HResult<Vec<u8>> {
    let mut cipher = Cipher::new(token.clone(), transformation)?;
    cipher.init(mode, key, iv)?;
    let mut output = Vec::new();
    for byte in input {
        output.extend(cipher.update(std::slice::from_ref(byte))?);
    }
    output.extend(cipher.do_final(&[])?);
    Ok(output)
}

/// Reference encryption computed by OpenSSL in the process
pub(crate) fn openssl_encrypt(
    cipher: OpensslCipher,
    key: &[u8],
    iv: Option<&[u8]>,
    data: &[u8],
    pad: bool,
) -> Vec<u8> {
    let mut crypter = Crypter::new(cipher, Mode::Encrypt, key, iv).unwrap();
    crypter.pad(pad);
    let mut output = vec![0_u8; data.len() + cipher.block_size()];
    let mut written = crypter.update(data, &mut output).unwrap();
    written += crypter.finalize(&mut output[written..]).unwrap();
    output.truncate(written);
    output
}
