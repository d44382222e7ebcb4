//! AES-256-CTR with a random per-object IV prefix.

use crate::crypto::kdf::MasterKey;
use crate::error::FsError;
use cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Fixed per-object overhead: the IV prepended to every ciphertext.
pub const IV_LEN: usize = 16;

/// Symmetric cipher over whole object bodies.
///
/// Ciphertext layout is `iv || ctr(key, iv, plaintext)`, so ciphertext
/// length is always plaintext length plus [`IV_LEN`].
pub struct Cipher {
    key: MasterKey,
}

impl Cipher {
    pub fn new(key: MasterKey) -> Self {
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, FsError> {
        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);

        let mut out = Vec::with_capacity(IV_LEN + plaintext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(plaintext);

        let mut cipher = Aes256Ctr::new_from_slices(self.key.as_bytes(), &iv)
            .map_err(|_| FsError::Invalid("bad cipher key length".into()))?;
        cipher.apply_keystream(&mut out[IV_LEN..]);

        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, FsError> {
        if ciphertext.len() < IV_LEN {
            return Err(FsError::Invalid(
                "ciphertext shorter than the IV prefix".into(),
            ));
        }

        let (iv, body) = ciphertext.split_at(IV_LEN);
        let mut out = body.to_vec();

        let mut cipher = Aes256Ctr::new_from_slices(self.key.as_bytes(), iv)
            .map_err(|_| FsError::Invalid("bad cipher key length".into()))?;
        cipher.apply_keystream(&mut out);

        Ok(out)
    }
}
