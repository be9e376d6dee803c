//! Copyright 2024 Cosmian Tech SAS

pub use log_utils::{DEFAULT_DIRECTIVES, log_init};
pub use tracing::{debug, error, info, trace, warn};

mod log_utils;
