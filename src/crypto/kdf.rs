//! Password-based key derivation.

use crate::error::FsError;
use anyhow::anyhow;
use zeroize::Zeroizing;

/// Application salt; fixed so the same secret yields the same key on every
/// mount. Versioned in case the KDF parameters ever change.
const KDF_SALT: &[u8] = b"cloudstash/scrypt/v1";

const KDF_LOG_N: u8 = 15;
const KDF_R: u32 = 8;
const KDF_P: u32 = 1;

pub const KEY_LEN: usize = 32;

/// A derived symmetric key. Zeroed on drop; never serialized anywhere.
pub struct MasterKey(Zeroizing<[u8; KEY_LEN]>);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.as_ref()
    }
}

/// Derive the symmetric key from the user-supplied secret.
pub fn derive_key(secret: &str) -> Result<MasterKey, FsError> {
    let params = scrypt::Params::new(KDF_LOG_N, KDF_R, KDF_P, KEY_LEN)
        .map_err(|e| FsError::Other(anyhow!("invalid scrypt parameters: {e}")))?;

    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    scrypt::scrypt(secret.as_bytes(), KDF_SALT, &params, out.as_mut())
        .map_err(|e| FsError::Other(anyhow!("key derivation failed: {e}")))?;

    Ok(MasterKey(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_key("correct horse battery staple").unwrap();
        let b = derive_key("correct horse battery staple").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn different_secrets_differ() {
        let a = derive_key("secret-a").unwrap();
        let b = derive_key("secret-b").unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
