//! OIDC (OpenID Connect) module
//!
//! Handles CI job token verification: key set fetching, caching, and claim
//! verification.

mod jwks;
mod keyset;
mod validate;

pub use jwks::{fetch_key_set, KeyFetchError, KeySet};
pub use keyset::{KeySetCache, KeySetError};
pub use validate::{IdentityClaims, TokenVerifier, VerifyError, ACCEPTED_ALGORITHMS};
