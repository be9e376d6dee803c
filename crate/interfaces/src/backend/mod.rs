mod attribute;
mod interface;
mod mechanism;

pub use attribute::{
    Attribute, AttributeList, AttributeType, BooleanAttribute, EcCurve, KeyType, ObjectClass,
    ObjectHandle, SessionHandle, decode_ec_point, encode_ec_point,
};
pub use interface::{TokenBackend, TokenInfo};
pub use mechanism::{GcmParams, Mechanism};
