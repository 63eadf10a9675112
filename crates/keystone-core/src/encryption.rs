//! Encryption of saved payment instruments and redaction of gateway payloads
//!
//! Card PANs and bank account numbers are stored as AES-256-GCM ciphertext (nonce prepended,
//! base64 framed). Gateway request/response bodies are redacted before they reach the
//! transaction log.

use crate::AppError;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use std::env;

const NONCE_LEN: usize = 12;

/// JSON keys whose string values never reach the transaction log in clear.
const SENSITIVE_KEYS: &[&str] = &[
    "card_number",
    "pan",
    "cvv",
    "account_number",
    "routing_number",
    "api_key",
    "secret",
    "password",
];

/// Encryption service for saved cards and accounts.
#[derive(Clone)]
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    pub fn from_key_bytes(key_bytes: &[u8]) -> Result<Self, AppError> {
        if key_bytes.len() != 32 {
            return Err(AppError::Internal(
                "Encryption key must be 32 bytes (256 bits)".to_string(),
            ));
        }
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Expects ENCRYPTION_KEY to be a base64-encoded 32-byte key
    pub fn from_env() -> Result<Self, AppError> {
        let key_str = env::var("ENCRYPTION_KEY").map_err(|_| {
            AppError::Internal("ENCRYPTION_KEY environment variable not set".to_string())
        })?;

        let key_bytes = general_purpose::STANDARD
            .decode(key_str.trim())
            .map_err(|e| AppError::Internal(format!("Failed to decode encryption key: {}", e)))?;

        Self::from_key_bytes(&key_bytes)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, AppError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| AppError::Internal(format!("Encryption failed: {}", e)))?;

        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(&combined))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String, AppError> {
        let combined = general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|e| AppError::Internal(format!("Failed to decode encrypted data: {}", e)))?;

        if combined.len() < NONCE_LEN {
            return Err(AppError::Internal("Encrypted data too short".to_string()));
        }

        let nonce = Nonce::from_slice(&combined[..NONCE_LEN]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &combined[NONCE_LEN..])
            .map_err(|e| AppError::Internal(format!("Decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| AppError::Internal(format!("Invalid UTF-8 in decrypted data: {}", e)))
    }
}

/// Keep only the last four digits of a card or account number.
pub fn mask_number(number: &str) -> String {
    let digits: Vec<char> = number.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() <= 4 {
        return "*".repeat(digits.len());
    }
    let tail: String = digits[digits.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(digits.len() - 4), tail)
}

/// Last four digits, used as the display hint on saved instruments.
pub fn last_four(number: &str) -> String {
    let digits: Vec<char> = number.chars().filter(|c| c.is_ascii_digit()).collect();
    let start = digits.len().saturating_sub(4);
    digits[start..].iter().collect()
}

/// Redact sensitive values in a gateway payload, recursing into nested objects and arrays.
/// CVV and secrets are blanked entirely; numbers keep their last four digits.
pub fn redact_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(obj) => {
            let mut out = serde_json::Map::with_capacity(obj.len());
            for (key, v) in obj {
                let key_lower = key.to_lowercase();
                let sensitive = SENSITIVE_KEYS.iter().any(|k| key_lower.contains(k));
                let redacted = match (sensitive, v) {
                    (true, serde_json::Value::String(s)) => {
                        if key_lower.contains("number") || key_lower == "pan" {
                            serde_json::Value::String(mask_number(s))
                        } else {
                            serde_json::Value::String("[REDACTED]".to_string())
                        }
                    }
                    (true, serde_json::Value::Number(_)) => {
                        serde_json::Value::String("[REDACTED]".to_string())
                    }
                    _ => redact_json(v),
                };
                out.insert(key.clone(), redacted);
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redact_json).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service() -> EncryptionService {
        let test_key = b"01234567890123456789012345678901";
        EncryptionService::from_key_bytes(test_key).unwrap()
    }

    #[test]
    fn test_encryption_decryption() {
        let service = test_service();
        let pan = "4111111111111111";

        let encrypted = service.encrypt(pan).unwrap();
        assert_ne!(encrypted, pan);
        assert_eq!(service.decrypt(&encrypted).unwrap(), pan);
    }

    #[test]
    fn test_nonce_differs_per_call() {
        let service = test_service();
        let a = service.encrypt("4111111111111111").unwrap();
        let b = service.encrypt("4111111111111111").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(EncryptionService::from_key_bytes(b"too-short").is_err());
    }

    #[test]
    fn test_mask_number() {
        assert_eq!(mask_number("4111 1111 1111 1234"), "************1234");
        assert_eq!(mask_number("123"), "***");
        assert_eq!(last_four("000123456789"), "6789");
    }

    #[test]
    fn test_redact_nested_payload() {
        let payload = serde_json::json!({
            "amount": "10.00",
            "card": { "card_number": "4111111111111111", "cvv": "123", "exp": "12/30" },
            "accounts": [{ "account_number": "000123456789" }]
        });

        let redacted = redact_json(&payload);

        assert_eq!(redacted["amount"], "10.00");
        assert_eq!(redacted["card"]["card_number"], "************1111");
        assert_eq!(redacted["card"]["cvv"], "[REDACTED]");
        assert_eq!(redacted["card"]["exp"], "12/30");
        assert_eq!(redacted["accounts"][0]["account_number"], "********6789");
    }
}
