//! Access-token resolution.
//!
//! Stored repository tokens are AES-256-GCM sealed and base64 encoded as
//! `nonce || ciphertext`. A token supplied by the requester always wins.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::errors::CodegenError;

const NONCE_LEN: usize = 12;

fn cipher(key: &str) -> Result<Aes256Gcm, CodegenError> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| {
        CodegenError::Credentials(format!("AES key must be 32 bytes, got {}", key.len()))
    })
}

/// Seal `plaintext` under `key`.
pub fn encrypt_token(key: &str, plaintext: &str) -> Result<String, CodegenError> {
    let cipher = cipher(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| CodegenError::Credentials("encryption failed".into()))?;

    let mut out = nonce.to_vec();
    out.extend_from_slice(&sealed);
    Ok(STANDARD.encode(out))
}

pub fn decrypt_token(key: &str, encoded: &str) -> Result<String, CodegenError> {
    let raw = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CodegenError::Credentials(format!("base64 decode: {}", e)))?;
    if raw.len() < NONCE_LEN {
        return Err(CodegenError::Credentials("ciphertext too short".into()));
    }
    let (nonce, sealed) = raw.split_at(NONCE_LEN);
    let plain = cipher(key)?
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CodegenError::Credentials("decrypt: authentication failed".into()))?;
    String::from_utf8(plain)
        .map_err(|_| CodegenError::Credentials("decrypted token is not UTF-8".into()))
}

/// Pick the token for a job: the requester's own token if present, else the
/// repository's stored token decrypted with `aes_key`.
///
/// With neither available the empty token is returned; cloning public
/// repositories and local-credential pushes work without one.
pub fn resolve_token(
    user_token: Option<&str>,
    stored: Option<&str>,
    aes_key: Option<&str>,
) -> Result<String, CodegenError> {
    if let Some(token) = user_token.filter(|t| !t.is_empty()) {
        tracing::debug!(len = token.len(), "Using requester's git token");
        return Ok(token.to_string());
    }
    match stored.filter(|s| !s.is_empty()) {
        Some(sealed) => {
            let key = aes_key.ok_or_else(|| {
                CodegenError::Credentials("no AES key configured for stored token".into())
            })?;
            let token = decrypt_token(key, sealed)?;
            tracing::debug!(len = token.len(), "Using repository's stored token");
            Ok(token)
        }
        None => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_encrypt_then_decrypt() {
        let sealed = encrypt_token(KEY, "glpat-abc").unwrap();
        assert_ne!(sealed, "glpat-abc");
        assert_eq!(decrypt_token(KEY, &sealed).unwrap(), "glpat-abc");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt_token(KEY, "glpat-abc").unwrap();
        let err = decrypt_token("ffffffffffffffffffffffffffffffff", &sealed).unwrap_err();
        assert!(matches!(err, CodegenError::Credentials(_)));
    }

    #[test]
    fn test_bad_inputs_fail() {
        assert!(decrypt_token(KEY, "not base64!!").is_err());
        assert!(decrypt_token(KEY, &STANDARD.encode([1u8; 4])).is_err());
        assert!(encrypt_token("short", "x").is_err());
    }

    #[test]
    fn test_resolve_prefers_user_token() {
        let token = resolve_token(Some("mine"), Some("garbage"), None).unwrap();
        assert_eq!(token, "mine");
    }

    #[test]
    fn test_resolve_decrypts_stored_token() {
        let sealed = encrypt_token(KEY, "stored").unwrap();
        assert_eq!(
            resolve_token(Some(""), Some(&sealed), Some(KEY)).unwrap(),
            "stored"
        );
    }

    #[test]
    fn test_resolve_stored_token_without_key_fails() {
        let sealed = encrypt_token(KEY, "stored").unwrap();
        assert!(resolve_token(None, Some(&sealed), None).is_err());
    }

    #[test]
    fn test_resolve_without_any_token_is_empty() {
        assert_eq!(resolve_token(None, None, Some(KEY)).unwrap(), "");
    }
}
