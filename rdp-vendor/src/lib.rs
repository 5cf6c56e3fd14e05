//! Vendor bindings for the RDP trust/cache core.
//!
//! Everything that talks to an external cryptography or codec library lives
//! here, behind a narrow trait surface (`TlsEngine`, `BitmapCodec`). Callers
//! in `rdp-core` never import `rustls` or `x509-parser` types directly — see
//! design note 9 ("opaque third-party handles") in SPEC_FULL.md.

mod codec;
mod engine;
mod keylog;
mod verify;

pub use codec::{BitmapCodec, CodecError, CodecId, InterleavedRle8Codec, RawCodec};
pub use engine::{EngineError, EngineRole, EngineStatus, EngineVersion, TlsEngine};
pub use keylog::NssKeyLogWriter;
pub use engine::EngineOptions;
pub use verify::{channel_binding_hash, parse_certificate, verify_chain, ChainVerifyError, ParsedCertificate};
