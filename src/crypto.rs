//! Selective field encryption and connection authentication.
//!
//! Secrecy is per-field rather than per-link: a sender moves chosen body
//! fields into a holder object, encrypts that holder with AES-128-CBC
//! (PKCS#7 padding), and stores the base64 ciphertext inside the envelope.
//! Key and IV are derived from the shared secret plus the message's `from`
//! address and id, so the receiver can reproduce both without any key
//! exchange. The broker re-encrypts in one step, never re-merging plaintext
//! into the message.
//!
//! Key material is `SHA-256(secret ‖ from ‖ id)`; the cipher uses the first
//! 16 bytes. The IV is the XOR of the two halves of `SHA-256(from ‖ id)`,
//! which keeps the two derivations visibly distinct.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::message::{Message, SECURE_PATH};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no fields to encrypt")]
    NoFields,
    #[error("field to encrypt is absent: {0}")]
    MissingField(String),
    #[error("secure data is not a base64 string")]
    BadCiphertextEncoding,
    #[error("decryption failed (wrong secret or corrupted data)")]
    DecryptFailed,
    #[error("decrypted payload is not a JSON object")]
    BadPlaintext,
}

fn cipher_key(secret: &[u8], from: &str, id: &str) -> [u8; 16] {
    let mut digest = Sha256::new();
    digest.update(secret);
    digest.update(from.as_bytes());
    digest.update(id.as_bytes());
    let hash = digest.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&hash[..16]);
    key
}

fn cipher_iv(from: &str, id: &str) -> [u8; 16] {
    let mut digest = Sha256::new();
    digest.update(from.as_bytes());
    digest.update(id.as_bytes());
    let hash = digest.finalize();
    let mut iv = [0u8; 16];
    for i in 0..16 {
        iv[i] = hash[i] ^ hash[i + 16];
    }
    iv
}

fn encrypt_bytes(secret: &[u8], from: &str, id: &str, plaintext: &[u8]) -> Vec<u8> {
    let enc = Aes128CbcEnc::new(&cipher_key(secret, from, id).into(), &cipher_iv(from, id).into());
    enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

fn decrypt_bytes(
    secret: &[u8],
    from: &str,
    id: &str,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let dec = Aes128CbcDec::new(&cipher_key(secret, from, id).into(), &cipher_iv(from, id).into());
    dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}

impl Message {
    /// Move the named (possibly dotted) fields out of this message into the
    /// envelope's ciphertext. Errors if no fields are given or any named
    /// field is absent; on error the message is left partially stripped, as
    /// the caller is expected to discard it.
    pub fn encrypt(&mut self, secret: &[u8], fields: &[&str]) -> Result<(), CryptoError> {
        if fields.is_empty() {
            return Err(CryptoError::NoFields);
        }

        let mut holder = Map::new();
        for field in fields {
            let value = self
                .remove_dotted(field)
                .ok_or_else(|| CryptoError::MissingField((*field).into()))?;
            crate::message::put_dotted(&mut holder, field, value);
        }

        let plaintext = Value::Object(holder).to_string();
        let ciphertext = encrypt_bytes(secret, &self.from, &self.id, plaintext.as_bytes());
        self.put_dotted(SECURE_PATH, STANDARD.encode(ciphertext));
        Ok(())
    }

    /// Decrypt the envelope ciphertext, if any, and merge the recovered
    /// fields back into the message. A message with no secure data is left
    /// untouched.
    pub fn decrypt(&mut self, secret: &[u8]) -> Result<(), CryptoError> {
        let Some(encoded) = self.get_dotted_str(SECURE_PATH) else {
            return Ok(());
        };
        let ciphertext = STANDARD
            .decode(encoded)
            .map_err(|_| CryptoError::BadCiphertextEncoding)?;
        let plaintext = decrypt_bytes(secret, &self.from, &self.id, &ciphertext)?;
        let holder: Value =
            serde_json::from_slice(&plaintext).map_err(|_| CryptoError::BadPlaintext)?;
        let Value::Object(holder) = holder else {
            return Err(CryptoError::BadPlaintext);
        };

        self.remove_dotted(SECURE_PATH);
        merge(self, &holder, "");
        Ok(())
    }

    /// Swap the envelope ciphertext from one secret to another without
    /// exposing the protected fields in the message itself. Used by the
    /// broker when forwarding between differently-keyed peers.
    pub fn re_encrypt(&mut self, from_secret: &[u8], to_secret: &[u8]) -> Result<(), CryptoError> {
        let Some(encoded) = self.get_dotted_str(SECURE_PATH) else {
            return Ok(());
        };
        let ciphertext = STANDARD
            .decode(encoded)
            .map_err(|_| CryptoError::BadCiphertextEncoding)?;
        let plaintext = decrypt_bytes(from_secret, &self.from, &self.id, &ciphertext)?;
        let reencrypted = encrypt_bytes(to_secret, &self.from, &self.id, &plaintext);
        self.put_dotted(SECURE_PATH, STANDARD.encode(reencrypted));
        Ok(())
    }
}

// Depth-first merge of the recovered holder back into the message body.
fn merge(msg: &mut Message, object: &Map<String, Value>, path: &str) {
    for (key, value) in object {
        let child = if path.is_empty() {
            key.clone()
        } else {
            format!("{path}.{key}")
        };
        match value {
            Value::Object(inner) => merge(msg, inner, &child),
            other => msg.put_dotted(&child, other.clone()),
        }
    }
}

/// Authentication token for `manage.connect` / `manage.reconnect`:
/// `SHA-256(secret ‖ poName ‖ messageId)`. The connecting post office sends
/// it base64-encoded; the broker recomputes and compares.
pub struct Authenticator([u8; 32]);

impl Authenticator {
    pub fn new(secret: &[u8], po_name: &str, message_id: &str) -> Authenticator {
        let mut digest = Sha256::new();
        digest.update(secret);
        digest.update(po_name.as_bytes());
        digest.update(message_id.as_bytes());
        Authenticator(digest.finalize().into())
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Verify a received base64 authenticator against this one.
    pub fn verify(&self, received_base64: &str) -> bool {
        match STANDARD.decode(received_base64) {
            Ok(bytes) => bytes == self.0,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut msg =
            Message::new("alpha.io", Some("beta.io"), Some("login"), "7.alpha", None, false)
                .unwrap();
        msg.put("user", "ann");
        msg.put_dotted("body.cred", "xyz");
        msg.put_dotted("body.note", "plain");
        msg
    }

    #[test]
    fn encrypt_then_decrypt_restores_fields() {
        let secret = b"shared secret".to_vec();
        let mut msg = sample();
        msg.encrypt(&secret, &["body.cred"]).unwrap();

        assert!(msg.is_encrypted());
        assert!(!msg.has_dotted("body.cred"));
        assert!(!msg.to_json().contains("xyz"));

        msg.decrypt(&secret).unwrap();
        assert!(!msg.is_encrypted());
        assert_eq!(msg.get_dotted_str("body.cred"), Some("xyz"));
        assert_eq!(msg.get_dotted_str("body.note"), Some("plain"));
    }

    #[test]
    fn encrypt_requires_present_fields() {
        let mut msg = sample();
        assert!(matches!(
            msg.encrypt(b"s", &["body.absent"]),
            Err(CryptoError::MissingField(_))
        ));
        let mut msg = sample();
        assert!(matches!(msg.encrypt(b"s", &[]), Err(CryptoError::NoFields)));
    }

    #[test]
    fn re_encrypt_matches_direct_decryption() {
        let s1 = b"secret one".to_vec();
        let s2 = b"secret two".to_vec();

        let mut original = sample();
        original.encrypt(&s1, &["body.cred", "user"]).unwrap();
        let first_ciphertext = original.get_dotted_str(SECURE_PATH).unwrap().to_string();

        let mut forwarded = original.clone();
        forwarded.re_encrypt(&s1, &s2).unwrap();
        let second_ciphertext = forwarded.get_dotted_str(SECURE_PATH).unwrap().to_string();
        assert_ne!(first_ciphertext, second_ciphertext);
        assert!(!forwarded.to_json().contains("xyz"));

        forwarded.decrypt(&s2).unwrap();
        original.decrypt(&s1).unwrap();
        assert_eq!(forwarded.to_json(), original.to_json());
    }

    #[test]
    fn wrong_secret_fails_cleanly() {
        let mut msg = sample();
        msg.encrypt(b"right", &["body.cred"]).unwrap();
        let err = msg.decrypt(b"wrong");
        assert!(matches!(
            err,
            Err(CryptoError::DecryptFailed) | Err(CryptoError::BadPlaintext)
        ));
    }

    #[test]
    fn authenticator_verifies_only_matching_tokens() {
        let auth = Authenticator::new(b"secret", "alpha", "1.alpha");
        let token = auth.to_base64();
        assert!(Authenticator::new(b"secret", "alpha", "1.alpha").verify(&token));
        assert!(!Authenticator::new(b"other", "alpha", "1.alpha").verify(&token));
        assert!(!auth.verify("not base64 !!!"));
    }
}
