//! Provisioner - device identity lifecycle service
//!
//! Registers devices and hands out their shared secret, issues short-lived
//! activation codes, transfers ownership to the user who presents a code, and
//! exchanges HMAC-signed challenges for RS256 device access tokens.
//! It exposes all modules for testing purposes.

pub mod activation;
pub mod claim;
pub mod clock;
pub mod device;
pub mod entities;
pub mod errors;
pub mod jwks;
pub mod registration;
pub mod settings;
pub mod storage;
pub mod token;
pub mod web;
