//! `farmflow-auth`: bearer-token authentication boundary.
//!
//! Tokens are issued elsewhere; this crate only verifies them and yields the
//! authenticated [`farmflow_core::UserId`]. It is decoupled from HTTP and storage.

pub mod claims;
pub mod validator;

pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use validator::{Hs256JwtValidator, JwtValidator};
