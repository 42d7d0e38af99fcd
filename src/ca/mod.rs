//! Certificate authority for TLS interception.
//!
//! This module provides CA generation and a cache of dynamically minted
//! leaf certificates keyed by wildcard-normalized hostname.

mod generator;

pub use generator::{wildcard_name, CaError, CaState, CertCache};
