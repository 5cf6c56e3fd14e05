//! # rdp-core
//!
//! TLS transport trust resolution and bitmap caching for an RDP
//! client/server stack. Everything that talks to rustls or x509-parser
//! directly lives in `rdp-vendor`; this crate only sees the narrow trait
//! surface it exposes.

pub mod bitmap_cache;
pub mod cert_store;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod persistent_cache;
pub mod ring_buffer;
pub mod trust_policy;
pub mod tls_session;
