//! NextGCore Cryptographic Library (EPS NAS subset)
//!
//! Key derivation and NAS protection primitives used by the MME NAS core:
//! - TS 33.220 Annex B.2 generic KDF, specialised per TS 33.401 Annex A
//! - 128-EIA2 (AES-CMAC) integrity, TS 33.401 Annex B.2.3
//! - 128-EEA2 (AES-CTR) ciphering, TS 33.401 Annex B.1.3

pub mod error;      // Crypto error type
pub mod aes;        // AES-128 counter mode
pub mod aes_cmac;   // AES-CMAC
pub mod kdf;        // Key Derivation Functions
pub mod nas_alg;    // EIA/EEA algorithm front-ends

pub use error::{CryptError, CryptResult};
