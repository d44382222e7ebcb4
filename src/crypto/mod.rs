//! The encryption boundary.
//!
//! Every byte shipped to a drive passes through [`Cipher::encrypt`]; every
//! byte read back passes through [`Cipher::decrypt`]. Key material is
//! derived once from the user secret and lives only in manager memory.

mod cipher;
mod kdf;

pub use cipher::{Cipher, IV_LEN};
pub use kdf::{MasterKey, derive_key};
