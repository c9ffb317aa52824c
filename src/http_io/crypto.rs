//! Block encryption (§4.4): "Symmetric block cipher in CBC mode keyed by a key derived
//! (PBKDF2) from a passphrase plus a per-bucket salt... IV derived deterministically from
//! the block index... HMAC is appended and verified."

use crate::block::BlockIndex;
use crate::error::{Result, StoreError};
use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes192CbcEnc = cbc::Encryptor<Aes192>;
type Aes192CbcDec = cbc::Decryptor<Aes192>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

const IV_LEN: usize = 16;
const HMAC_LEN: usize = 32;

/// The key material derived once per store open: an AES key sized by `Config::key_length`
/// (16/24/32 bytes, selecting AES-128/192/256) and a separate, always-32-byte
/// HMAC-SHA256 key (encrypt-then-MAC, so the two must never be the same bytes).
pub struct KeyMaterial {
    enc_key: Vec<u8>,
    mac_key: [u8; 32],
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.enc_key.zeroize();
        self.mac_key.zeroize();
    }
}

impl KeyMaterial {
    /// Derives both keys from `password` and `salt` via PBKDF2-HMAC-SHA256. `key_length`
    /// (16, 24, or 32, per `Config::key_length`) selects AES-128/192/256 for the
    /// encryption key; `key_length + 32` bytes of PBKDF2 output are requested so the
    /// encryption and MAC keys come from disjoint segments rather than reused bytes.
    pub fn derive(password: &str, salt: &[u8], iterations: u32, key_length: usize) -> Self {
        let mut out = vec![0u8; key_length + 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
        let enc_key = out[0..key_length].to_vec();
        let mut mac_key = [0u8; 32];
        mac_key.copy_from_slice(&out[key_length..key_length + 32]);
        out.zeroize();
        Self { enc_key, mac_key }
    }
}

/// Derives a per-block IV deterministically from the salt and block index, so the same
/// key never encrypts two blocks under the same IV (§4.4).
fn derive_iv(salt: &[u8], idx: BlockIndex) -> [u8; IV_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(idx.to_be_bytes());
    let digest = hasher.finalize();
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&digest[..IV_LEN]);
    iv
}

/// Encrypts `plaintext` for block `idx` and appends an HMAC-SHA256 tag over the
/// ciphertext, returning `ciphertext || tag`.
pub fn encrypt(keys: &KeyMaterial, salt: &[u8], idx: BlockIndex, plaintext: &[u8]) -> Vec<u8> {
    let iv = derive_iv(salt, idx);
    let ciphertext = match keys.enc_key.len() {
        16 => {
            let key: [u8; 16] = keys.enc_key.as_slice().try_into().expect("checked length above");
            Aes128CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
        }
        24 => {
            let key: [u8; 24] = keys.enc_key.as_slice().try_into().expect("checked length above");
            Aes192CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
        }
        _ => {
            let key: [u8; 32] = keys.enc_key.as_slice().try_into().expect("checked length above");
            Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
        }
    };

    let mut mac = HmacSha256::new_from_slice(&keys.mac_key).expect("any key length is valid");
    mac.update(&ciphertext);
    let tag = mac.finalize().into_bytes();

    let mut out = Vec::with_capacity(ciphertext.len() + HMAC_LEN);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    out
}

/// Verifies the HMAC tag and decrypts `ciphertext_and_tag` for block `idx`, returning the
/// plaintext. Fails with `INTEGRITY` on tag mismatch or invalid padding, never leaking
/// whether the failure was the tag or the padding.
pub fn decrypt(
    keys: &KeyMaterial,
    salt: &[u8],
    idx: BlockIndex,
    ciphertext_and_tag: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext_and_tag.len() < HMAC_LEN {
        return Err(StoreError::integrity("encrypted block shorter than HMAC tag"));
    }
    let (ciphertext, tag) = ciphertext_and_tag.split_at(ciphertext_and_tag.len() - HMAC_LEN);

    let mut mac = HmacSha256::new_from_slice(&keys.mac_key).expect("any key length is valid");
    mac.update(ciphertext);
    mac.verify_slice(tag)
        .map_err(|_| StoreError::integrity("HMAC verification failed"))?;

    let iv = derive_iv(salt, idx);
    match keys.enc_key.len() {
        16 => {
            let key: [u8; 16] = keys.enc_key.as_slice().try_into().expect("checked length above");
            Aes128CbcDec::new(&key.into(), &iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| StoreError::integrity("invalid padding after decryption"))
        }
        24 => {
            let key: [u8; 24] = keys.enc_key.as_slice().try_into().expect("checked length above");
            Aes192CbcDec::new(&key.into(), &iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| StoreError::integrity("invalid padding after decryption"))
        }
        _ => {
            let key: [u8; 32] = keys.enc_key.as_slice().try_into().expect("checked length above");
            Aes256CbcDec::new(&key.into(), &iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| StoreError::integrity("invalid padding after decryption"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_is_bit_for_bit() {
        let keys = KeyMaterial::derive("hunter2", b"somesalt", 10_000, 32);
        let plaintext = b"a block's worth of plaintext, not block-size aligned".to_vec();
        let ct = encrypt(&keys, b"somesalt", 42, &plaintext);
        let pt = decrypt(&keys, b"somesalt", 42, &ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn flipped_ciphertext_byte_is_detected() {
        let keys = KeyMaterial::derive("hunter2", b"somesalt", 10_000, 32);
        let plaintext = vec![0x42u8; 4096];
        let mut ct = encrypt(&keys, b"somesalt", 7, &plaintext);
        ct[0] ^= 0xFF;
        let err = decrypt(&keys, b"somesalt", 7, &ct).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Integrity);
    }

    #[test]
    fn distinct_indices_use_distinct_ivs() {
        let keys = KeyMaterial::derive("hunter2", b"somesalt", 10_000, 32);
        let plaintext = vec![0xABu8; 4096];
        let a = encrypt(&keys, b"somesalt", 0, &plaintext);
        let b = encrypt(&keys, b"somesalt", 1, &plaintext);
        assert_ne!(a, b);
    }

    #[test]
    fn roundtrips_at_every_configured_key_length() {
        for key_length in [16, 24, 32] {
            let keys = KeyMaterial::derive("hunter2", b"somesalt", 10_000, key_length);
            let plaintext = b"a block's worth of plaintext, not block-size aligned".to_vec();
            let ct = encrypt(&keys, b"somesalt", 3, &plaintext);
            let pt = decrypt(&keys, b"somesalt", 3, &ct).unwrap();
            assert_eq!(pt, plaintext, "roundtrip failed for key_length={key_length}");
        }
    }

    #[test]
    fn mismatched_key_length_fails_to_decrypt() {
        let enc_keys = KeyMaterial::derive("hunter2", b"somesalt", 10_000, 16);
        let dec_keys = KeyMaterial::derive("hunter2", b"somesalt", 10_000, 32);
        let ct = encrypt(&enc_keys, b"somesalt", 1, b"payload");
        let err = decrypt(&dec_keys, b"somesalt", 1, &ct).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Integrity);
    }
}
