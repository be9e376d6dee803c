//! Copyright 2024 Cosmian Tech SAS

mod backend;
mod error;

pub use backend::{
    Attribute, AttributeList, AttributeType, BooleanAttribute, EcCurve, GcmParams, KeyType,
    Mechanism, ObjectClass, ObjectHandle, SessionHandle, TokenBackend, TokenInfo,
    decode_ec_point, encode_ec_point,
};
pub use error::{BResult, BackendError, Rv};
