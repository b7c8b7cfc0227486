//! Credential exchange service

pub mod exchange;

pub use exchange::{Broker, ExchangeRequest, ExchangeResponse, Stage};
