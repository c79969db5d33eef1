//! Request signing primitives shared by the authgate proxy and by upstreams
//! that want to verify requests it forwards.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod signature;

pub use signature::{
    Algorithm, SIGNATURE_HEADER, SIGNED_HEADERS, SignableRequest, SignatureError, Validation,
    ValidationResult, request_signature, validate_request,
};
