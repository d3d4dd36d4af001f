//! Crypto error types

use thiserror::Error;

/// Errors raised by the crypto primitives
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptError {
    /// Key has the wrong length for the primitive
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Algorithm identity not implemented by this library
    #[error("Unsupported algorithm identity: {0}")]
    UnsupportedAlgorithm(u8),

    /// KDF parameter longer than the 16-bit length field allows
    #[error("KDF parameter too long: {0} bytes")]
    ParameterTooLong(usize),
}

/// Crypto result type
pub type CryptResult<T> = Result<T, CryptError>;
