//! Caller identity.
//!
//! Token verification is done by the surrounding application; this module
//! only reads the resulting [`Principal`] from the request.

pub mod extractors;

pub use extractors::Principal;

#[cfg(feature = "test-auth-bypass")]
pub use extractors::{TEST_ROLES_HEADER, TEST_USER_HEADER};
