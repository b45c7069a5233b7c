// Decryption of encrypted source assets.
//
// The payload key is an AES-256-GCM key wrapped with the recipient's RSA
// public key; jobs supply the wrapped key plus the private key that unwraps
// it. Encrypted objects are laid out as a 12-byte nonce followed by
// ciphertext and tag.

use std::sync::Arc;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use rsa::Oaep;
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;

use vod_types::DecryptionMaterial;

use crate::counter::ByteStream;
use crate::error::TransferError;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Holds the unwrapped payload cipher for one job.
pub struct SegmentDecryptor {
    cipher: Aes256Gcm,
}

impl SegmentDecryptor {
    /// Unwrap the payload key from the supplied material.
    pub fn from_material(material: &DecryptionMaterial) -> Result<Self, TransferError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(&material.private_key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&material.private_key_pem))
            .map_err(|e| TransferError::decryption(format!("invalid private key: {e}")))?;

        let wrapped = BASE64
            .decode(material.encrypted_key.trim())
            .map_err(|e| TransferError::decryption(format!("invalid wrapped key encoding: {e}")))?;

        let key = private_key
            .decrypt(Oaep::new::<sha2::Sha256>(), &wrapped)
            .map_err(|e| TransferError::decryption(format!("key unwrap failed: {e}")))?;

        if key.len() != KEY_LEN {
            return Err(TransferError::decryption(format!(
                "unwrapped key is {} bytes, expected {KEY_LEN}",
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| TransferError::decryption(format!("cipher init failed: {e}")))?;
        Ok(Self { cipher })
    }

    /// Decrypt one whole object. Offloaded to the blocking pool; GCM
    /// authenticates the full message, so there is no chunk-at-a-time mode.
    pub async fn decrypt(&self, data: Bytes) -> Result<Bytes, TransferError> {
        if data.len() < NONCE_LEN {
            return Err(TransferError::decryption(
                "ciphertext shorter than nonce".to_string(),
            ));
        }
        let cipher = self.cipher.clone();
        tokio::task::spawn_blocking(move || {
            let (nonce, ciphertext) = data.split_at(NONCE_LEN);
            cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map(Bytes::from)
                .map_err(|_| TransferError::decryption("authentication failed".to_string()))
        })
        .await
        .map_err(|e| TransferError::Internal {
            reason: format!("decryption task failed: {e}"),
        })?
    }

    /// Adapter inserted between the source stream and the destination tee.
    /// Buffers the ciphertext (the tag covers the whole object) and yields
    /// the plaintext as a single chunk.
    pub fn decrypting_stream(self: Arc<Self>, mut input: ByteStream) -> ByteStream {
        Box::pin(futures::stream::once(async move {
            let mut buffer = BytesMut::new();
            while let Some(chunk) = input.next().await {
                buffer.extend_from_slice(&chunk?);
            }
            self.decrypt(buffer.freeze()).await
        }))
    }
}
