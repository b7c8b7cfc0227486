//! Container registry module
//!
//! Provisions short-lived robot accounts through the registry's account API.

pub mod api;
mod mint;

pub use api::HarborClient;
pub use mint::{native_actions, registry_duration_days, Credential, CredentialMinter};

use thiserror::Error;

use crate::error::TransportError;

/// Why a credential could not be minted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MintError {
    #[error("registry project '{0}' not found")]
    NotFound(String),

    /// Non-success status from the registry; `message` is already redacted
    #[error("registry API error (status {status}): {message}")]
    Registry { status: u16, message: String },

    #[error("registry unreachable: {0}")]
    Transport(#[from] TransportError),

    #[error("unexpected registry response: {0}")]
    InvalidResponse(String),
}
