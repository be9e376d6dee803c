//! Copyright 2024 Cosmian Tech SAS

use std::fmt::{Display, Formatter};

use strum_macros::IntoStaticStr;
use thiserror::Error;

pub type BResult<T> = Result<T, BackendError>;

/// Return values of the native token functions.
///
/// The numeric values are the ones of the PKCS#11 `CKR_*` constants so that a backend
/// wrapping a real cryptoki library can map them one to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
pub enum Rv {
    #[strum(serialize = "CKR_HOST_MEMORY")]
    HostMemory,
    #[strum(serialize = "CKR_GENERAL_ERROR")]
    GeneralError,
    #[strum(serialize = "CKR_FUNCTION_FAILED")]
    FunctionFailed,
    #[strum(serialize = "CKR_ARGUMENTS_BAD")]
    ArgumentsBad,
    #[strum(serialize = "CKR_ATTRIBUTE_SENSITIVE")]
    AttributeSensitive,
    #[strum(serialize = "CKR_ATTRIBUTE_TYPE_INVALID")]
    AttributeTypeInvalid,
    #[strum(serialize = "CKR_ATTRIBUTE_VALUE_INVALID")]
    AttributeValueInvalid,
    #[strum(serialize = "CKR_DATA_INVALID")]
    DataInvalid,
    #[strum(serialize = "CKR_DATA_LEN_RANGE")]
    DataLenRange,
    #[strum(serialize = "CKR_DEVICE_ERROR")]
    DeviceError,
    #[strum(serialize = "CKR_DEVICE_REMOVED")]
    DeviceRemoved,
    #[strum(serialize = "CKR_ENCRYPTED_DATA_INVALID")]
    EncryptedDataInvalid,
    #[strum(serialize = "CKR_ENCRYPTED_DATA_LEN_RANGE")]
    EncryptedDataLenRange,
    #[strum(serialize = "CKR_KEY_HANDLE_INVALID")]
    KeyHandleInvalid,
    #[strum(serialize = "CKR_KEY_SIZE_RANGE")]
    KeySizeRange,
    #[strum(serialize = "CKR_KEY_TYPE_INCONSISTENT")]
    KeyTypeInconsistent,
    #[strum(serialize = "CKR_KEY_FUNCTION_NOT_PERMITTED")]
    KeyFunctionNotPermitted,
    #[strum(serialize = "CKR_KEY_NOT_WRAPPABLE")]
    KeyNotWrappable,
    #[strum(serialize = "CKR_KEY_UNEXTRACTABLE")]
    KeyUnextractable,
    #[strum(serialize = "CKR_MECHANISM_INVALID")]
    MechanismInvalid,
    #[strum(serialize = "CKR_MECHANISM_PARAM_INVALID")]
    MechanismParamInvalid,
    #[strum(serialize = "CKR_OBJECT_HANDLE_INVALID")]
    ObjectHandleInvalid,
    #[strum(serialize = "CKR_OPERATION_ACTIVE")]
    OperationActive,
    #[strum(serialize = "CKR_OPERATION_NOT_INITIALIZED")]
    OperationNotInitialized,
    #[strum(serialize = "CKR_SESSION_COUNT")]
    SessionCount,
    #[strum(serialize = "CKR_SESSION_HANDLE_INVALID")]
    SessionHandleInvalid,
    #[strum(serialize = "CKR_SIGNATURE_INVALID")]
    SignatureInvalid,
    #[strum(serialize = "CKR_TEMPLATE_INCOMPLETE")]
    TemplateIncomplete,
    #[strum(serialize = "CKR_TEMPLATE_INCONSISTENT")]
    TemplateInconsistent,
    #[strum(serialize = "CKR_TOKEN_NOT_PRESENT")]
    TokenNotPresent,
    #[strum(serialize = "CKR_TOKEN_WRITE_PROTECTED")]
    TokenWriteProtected,
    #[strum(serialize = "CKR_WRAPPED_KEY_INVALID")]
    WrappedKeyInvalid,
    #[strum(serialize = "CKR_WRAPPED_KEY_LEN_RANGE")]
    WrappedKeyLenRange,
    #[strum(serialize = "CKR_BUFFER_TOO_SMALL")]
    BufferTooSmall,
    #[strum(serialize = "CKR_VENDOR_DEFINED")]
    Vendor(u64),
}

impl Rv {
    /// The numeric `CKR_*` value
    #[must_use]
    pub const fn code(self) -> u64 {
        match self {
            Self::HostMemory => 0x02,
            Self::GeneralError => 0x05,
            Self::FunctionFailed => 0x06,
            Self::ArgumentsBad => 0x07,
            Self::AttributeSensitive => 0x11,
            Self::AttributeTypeInvalid => 0x12,
            Self::AttributeValueInvalid => 0x13,
            Self::DataInvalid => 0x20,
            Self::DataLenRange => 0x21,
            Self::DeviceError => 0x30,
            Self::DeviceRemoved => 0x32,
            Self::EncryptedDataInvalid => 0x40,
            Self::EncryptedDataLenRange => 0x41,
            Self::KeyHandleInvalid => 0x60,
            Self::KeySizeRange => 0x62,
            Self::KeyTypeInconsistent => 0x63,
            Self::KeyFunctionNotPermitted => 0x68,
            Self::KeyNotWrappable => 0x69,
            Self::KeyUnextractable => 0x6A,
            Self::MechanismInvalid => 0x70,
            Self::MechanismParamInvalid => 0x71,
            Self::ObjectHandleInvalid => 0x82,
            Self::OperationActive => 0x90,
            Self::OperationNotInitialized => 0x91,
            Self::SessionCount => 0xB1,
            Self::SessionHandleInvalid => 0xB3,
            Self::SignatureInvalid => 0xC0,
            Self::TemplateIncomplete => 0xD0,
            Self::TemplateInconsistent => 0xD1,
            Self::TokenNotPresent => 0xE0,
            Self::TokenWriteProtected => 0xE2,
            Self::WrappedKeyInvalid => 0x110,
            Self::WrappedKeyLenRange => 0x112,
            Self::BufferTooSmall => 0x150,
            Self::Vendor(code) => code,
        }
    }

    /// `true` when the device behind the token is gone and every later call will fail
    #[must_use]
    pub const fn is_removal(self) -> bool {
        matches!(self, Self::DeviceRemoved | Self::TokenNotPresent)
    }
}

impl Display for Rv {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vendor(code) => write!(f, "CKR_VENDOR_DEFINED({code:#x})"),
            other => {
                let name: &'static str = other.into();
                f.write_str(name)
            }
        }
    }
}

/// Error returned by a native token function
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{function} failed: {rv} ({code:#x})", code = .rv.code())]
pub struct BackendError {
    pub function: &'static str,
    pub rv: Rv,
}

impl BackendError {
    #[must_use]
    pub const fn new(function: &'static str, rv: Rv) -> Self {
        Self { function, rv }
    }
}
