use strum_macros::IntoStaticStr;

/// Parameters of `CKM_AES_GCM`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcmParams {
    pub iv: Vec<u8>,
    pub aad: Vec<u8>,
    pub tag_bits: usize,
}

/// Mechanisms understood by the token.
///
/// IV carrying variants hold the IV (or initial counter block) as their parameter.
#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
pub enum Mechanism {
    #[strum(serialize = "CKM_AES_KEY_GEN")]
    AesKeyGen,
    #[strum(serialize = "CKM_DES_KEY_GEN")]
    DesKeyGen,
    #[strum(serialize = "CKM_DES2_KEY_GEN")]
    Des2KeyGen,
    #[strum(serialize = "CKM_DES3_KEY_GEN")]
    Des3KeyGen,
    #[strum(serialize = "CKM_GENERIC_SECRET_KEY_GEN")]
    GenericSecretKeyGen,
    #[strum(serialize = "CKM_RSA_PKCS_KEY_PAIR_GEN")]
    RsaPkcsKeyPairGen,
    #[strum(serialize = "CKM_EC_KEY_PAIR_GEN")]
    EcKeyPairGen,
    #[strum(serialize = "CKM_DSA_KEY_PAIR_GEN")]
    DsaKeyPairGen,
    #[strum(serialize = "CKM_DH_PKCS_KEY_PAIR_GEN")]
    DhPkcsKeyPairGen,
    #[strum(serialize = "CKM_AES_ECB")]
    AesEcb,
    #[strum(serialize = "CKM_AES_CBC")]
    AesCbc(Vec<u8>),
    #[strum(serialize = "CKM_AES_CBC_PAD")]
    AesCbcPad(Vec<u8>),
    #[strum(serialize = "CKM_AES_CTR")]
    AesCtr(Vec<u8>),
    #[strum(serialize = "CKM_AES_GCM")]
    AesGcm(GcmParams),
    #[strum(serialize = "CKM_DES_ECB")]
    DesEcb,
    #[strum(serialize = "CKM_DES_CBC")]
    DesCbc(Vec<u8>),
    #[strum(serialize = "CKM_DES_CBC_PAD")]
    DesCbcPad(Vec<u8>),
    #[strum(serialize = "CKM_DES3_ECB")]
    Des3Ecb,
    #[strum(serialize = "CKM_DES3_CBC")]
    Des3Cbc(Vec<u8>),
    #[strum(serialize = "CKM_DES3_CBC_PAD")]
    Des3CbcPad(Vec<u8>),
    #[strum(serialize = "CKM_RSA_PKCS")]
    RsaPkcs,
    #[strum(serialize = "CKM_RSA_X_509")]
    RsaX509,
    #[strum(serialize = "CKM_MD5")]
    Md5,
    #[strum(serialize = "CKM_SHA_1")]
    Sha1,
    #[strum(serialize = "CKM_SHA224")]
    Sha224,
    #[strum(serialize = "CKM_SHA256")]
    Sha256,
    #[strum(serialize = "CKM_SHA384")]
    Sha384,
    #[strum(serialize = "CKM_SHA512")]
    Sha512,
}

impl Mechanism {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// The IV (or initial counter block) of the mechanism, if any
    #[must_use]
    pub fn iv(&self) -> Option<&[u8]> {
        match self {
            Self::AesCbc(iv)
            | Self::AesCbcPad(iv)
            | Self::AesCtr(iv)
            | Self::DesCbc(iv)
            | Self::DesCbcPad(iv)
            | Self::Des3Cbc(iv)
            | Self::Des3CbcPad(iv) => Some(iv),
            Self::AesGcm(params) => Some(&params.iv),
            _ => None,
        }
    }

    /// Output length of a digest mechanism
    #[must_use]
    pub const fn digest_length(&self) -> Option<usize> {
        match self {
            Self::Md5 => Some(16),
            Self::Sha1 => Some(20),
            Self::Sha224 => Some(28),
            Self::Sha256 => Some(32),
            Self::Sha384 => Some(48),
            Self::Sha512 => Some(64),
            _ => None,
        }
    }
}
