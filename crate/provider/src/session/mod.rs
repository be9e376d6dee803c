mod manager;
mod session_impl;

pub use manager::{SessionGuard, SessionManager, SessionStats};
pub use session_impl::Session;

#[cfg(test)]
mod tests;
