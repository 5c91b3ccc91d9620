//! Certificate helpers for relay endpoints
//!
//! Relays normally load a PEM certificate and key from disk. When none is
//! configured (local development, tests) a throwaway self-signed pair is
//! generated here instead.

pub mod self_signed;

pub use self_signed::{
    generate_self_signed_cert, generate_self_signed_cert_with_domains, SelfSignedCertificate,
    SelfSignedError,
};
