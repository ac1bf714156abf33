//! Cryptographic primitives used by the mutators.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{TdeError, TdeResult};

pub const AES_KEY_SIZE: usize = 32;
pub const AES_BLOCK_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Call contract of the primitives. Implementations must be safe to share between
/// connections.
pub trait CryptoProvider: Send + Sync {
    fn generate_aes_key(&self) -> Vec<u8>;

    /// AES-256-CBC with a random IV prepended to the ciphertext.
    fn aes_encrypt(&self, key: &[u8], plaintext: &[u8]) -> TdeResult<Vec<u8>>;

    fn aes_decrypt(&self, key: &[u8], ciphertext: &[u8]) -> TdeResult<Vec<u8>>;

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> TdeResult<Vec<u8>>;

    fn sha256(&self, data: &[u8]) -> Vec<u8>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RustCryptoProvider;

impl RustCryptoProvider {
    pub fn new() -> Self {
        RustCryptoProvider
    }
}

fn check_key(key: &[u8]) -> TdeResult<()> {
    if key.len() != AES_KEY_SIZE {
        return Err(TdeError::crypto(format!(
            "encryption key must be {} bytes, got {}",
            AES_KEY_SIZE,
            key.len()
        )));
    }
    Ok(())
}

impl CryptoProvider for RustCryptoProvider {
    fn generate_aes_key(&self) -> Vec<u8> {
        let mut key = vec![0u8; AES_KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        key
    }

    fn aes_encrypt(&self, key: &[u8], plaintext: &[u8]) -> TdeResult<Vec<u8>> {
        check_key(key)?;
        let mut iv = [0u8; AES_BLOCK_SIZE];
        rand::rng().fill_bytes(&mut iv);

        let cipher = Aes256CbcEnc::new_from_slices(key, &iv)
            .map_err(|e| TdeError::crypto(format!("cipher setup failed: {}", e)))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut output = Vec::with_capacity(AES_BLOCK_SIZE + ciphertext.len());
        output.extend_from_slice(&iv);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    fn aes_decrypt(&self, key: &[u8], ciphertext: &[u8]) -> TdeResult<Vec<u8>> {
        check_key(key)?;
        if ciphertext.len() < 2 * AES_BLOCK_SIZE || ciphertext.len() % AES_BLOCK_SIZE != 0 {
            return Err(TdeError::crypto(format!(
                "ciphertext of {} bytes is not a valid AES-CBC payload",
                ciphertext.len()
            )));
        }
        let (iv, body) = ciphertext.split_at(AES_BLOCK_SIZE);
        let cipher = Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| TdeError::crypto(format!("cipher setup failed: {}", e)))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(body)
            .map_err(|_| TdeError::crypto("decryption failed"))
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> TdeResult<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| TdeError::crypto(format!("invalid HMAC key: {}", e)))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn sha256(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }
}
