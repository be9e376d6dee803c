mod material;
mod reaper;
mod token_key;

pub use material::KeyMaterial;
pub(crate) use material::bit_length;
pub(crate) use reaper::KeyReaper;
pub use token_key::TokenKey;
pub(crate) use token_key::KeyProperties;
