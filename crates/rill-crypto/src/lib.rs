// Payload encryption for records in flight.
//
// The wire format is AES-128-ECB over the raw payload, zero-padded to the
// block size, then base64-encoded. There is no nonce and no authentication
// tag; topics that predate encryption carry plaintext, so decode failures
// are signals to fall back rather than hard errors.
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;

const BLOCK: usize = 16;

/// Decode failures that mark a payload as legacy plaintext.
///
/// Either variant means the bytes never went through [`PayloadCipher::seal`];
/// callers deliver the original payload unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptError {
    #[error("payload is not valid base64")]
    NotBase64,
    #[error("decoded payload is not block aligned")]
    NotBlockAligned,
}

/// AES-128-ECB codec keyed from the account's cipher key string.
///
/// The key string must be at least 16 characters; only the first 16 bytes
/// are used.
#[derive(Clone)]
pub struct PayloadCipher {
    cipher: Aes128,
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadCipher")
    }
}

impl PayloadCipher {
    /// Returns `None` when the key string is shorter than 16 characters.
    pub fn new(key: &str) -> Option<Self> {
        let bytes = key.as_bytes();
        if bytes.len() < BLOCK {
            return None;
        }
        let cipher = Aes128::new(GenericArray::from_slice(&bytes[..BLOCK]));
        Some(Self { cipher })
    }

    /// Encrypts and base64-encodes a payload for the wire.
    ///
    /// Zero-pads up to the next block boundary. Padding is not recoverable:
    /// a payload ending in `0x00` decrypts with those bytes intact, matching
    /// what the service itself produces.
    pub fn seal(&self, plaintext: &[u8]) -> String {
        let padded_len = if plaintext.is_empty() {
            BLOCK
        } else {
            plaintext.len().div_ceil(BLOCK) * BLOCK
        };
        let mut buffer = vec![0u8; padded_len];
        buffer[..plaintext.len()].copy_from_slice(plaintext);
        for block in buffer.chunks_exact_mut(BLOCK) {
            self.cipher
                .encrypt_block(GenericArray::from_mut_slice(block));
        }
        BASE64.encode(&buffer)
    }

    /// Reverses [`seal`](Self::seal). Zero padding is left in place.
    ///
    /// # Errors
    /// - [`DecryptError::NotBase64`] when the payload is not base64.
    /// - [`DecryptError::NotBlockAligned`] when the decoded length is not a
    ///   multiple of the block size.
    pub fn open(&self, wire: &[u8]) -> Result<Vec<u8>, DecryptError> {
        let mut buffer = BASE64.decode(wire).map_err(|_| DecryptError::NotBase64)?;
        if buffer.is_empty() || buffer.len() % BLOCK != 0 {
            return Err(DecryptError::NotBlockAligned);
        }
        for block in buffer.chunks_exact_mut(BLOCK) {
            self.cipher
                .decrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(buffer)
    }
}
