//! harbor-broker-core: Platform-agnostic core of the registry credential broker
//!
//! Verifies CI job tokens, decides access against policy rules, mints
//! short-lived registry robot accounts and audits the outcome. It depends only
//! on abstract platform traits (Cache, HttpClient, Clock, Environment) and
//! never imports platform-specific code.

pub mod audit;
pub mod config;
pub mod error;
pub mod oidc;
pub mod platform;
pub mod policy;
pub mod registry;
pub mod sts;

#[cfg(test)]
pub mod test_support;
