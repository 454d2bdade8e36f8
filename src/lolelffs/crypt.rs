/*
 * Copyright 2025 Daniel Hodges
 *
 * This file is part of lolelffs.
 *
 * lolelffs is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free
 * Software Foundation, either version 3 of the License, or (at your option)
 * any later version.
 *
 * lolelffs is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
 * details.
 *
 * You should have received a copy of the GNU General Public License along
 * with lolelffs. If not, see <https://www.gnu.org/licenses/>.
 */

//! Per-block encryption and the password-based unlock primitives.
//!
//! The per-block IV is the file-logical block number, little-endian,
//! zero-padded to the cipher's IV size; the XTS tweak of a given logical
//! block is therefore stable across rewrites. ChaCha20-Poly1305 produces a
//! detached 16-byte tag which the caller stores in the extent's metadata
//! block.
//!
//! The volume master key is 32 bytes. AES-256-XTS needs two 256-bit keys;
//! the data unit key is the master key itself and the tweak key is its
//! SHA-256 digest.

use crate::error::{FsError, FsResult};
use crate::layout::{AEAD_TAG_SIZE, ENC_AES256_XTS, ENC_CHACHA20_POLY, ENC_NONE};
use crate::layout::{KDF_ARGON2ID, KDF_NONE, KDF_PBKDF2};
use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{AeadInPlace, ChaCha20Poly1305, Key, Nonce, Tag};
use hmac::Hmac;
use sha2::{Digest, Sha256};
use xts_mode::{Xts128, get_tweak_default};

/// Tells whether the given encryption algorithm is usable at runtime.
pub fn supported(algo: u8) -> bool {
    matches!(algo, ENC_NONE | ENC_AES256_XTS | ENC_CHACHA20_POLY)
}

/// Returns the algorithm's display name.
pub fn algo_name(algo: u8) -> &'static str {
    match algo {
        ENC_NONE => "none",
        ENC_AES256_XTS => "aes-256-xts",
        ENC_CHACHA20_POLY => "chacha20-poly1305",
        _ => "unknown",
    }
}

/// Size of the authentication tag the algorithm appends, 0 for non-AEAD
/// modes.
pub fn tag_size(algo: u8) -> usize {
    match algo {
        ENC_CHACHA20_POLY => AEAD_TAG_SIZE,
        _ => 0,
    }
}

/// Logs the available encryption algorithms.
pub fn init() {
    for algo in [ENC_AES256_XTS, ENC_CHACHA20_POLY] {
        if supported(algo) {
            log::info!("{} encryption initialized", algo_name(algo));
        }
    }
}

/// Explicitly zeroes key material so it does not linger in memory.
pub fn wipe(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        unsafe { std::ptr::write_volatile(b, 0) };
    }
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}

fn xts_cipher(key: &[u8; 32]) -> Xts128<Aes256> {
    let tweak_key: [u8; 32] = Sha256::digest(key).into();
    Xts128::new(
        Aes256::new(GenericArray::from_slice(key)),
        Aes256::new(GenericArray::from_slice(&tweak_key)),
    )
}

fn chacha_nonce(block_num: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&block_num.to_le_bytes());
    nonce.into()
}

/// Encrypts one block in place under the master key.
///
/// For AEAD algorithms the detached authentication tag is returned and must
/// be stored alongside the extent.
pub fn encrypt_block(
    algo: u8,
    key: &[u8; 32],
    block_num: u64,
    buf: &mut [u8],
) -> FsResult<Option<[u8; AEAD_TAG_SIZE]>> {
    match algo {
        ENC_AES256_XTS => {
            xts_cipher(key).encrypt_area(buf, buf.len(), block_num as u128, get_tweak_default);
            Ok(None)
        }
        ENC_CHACHA20_POLY => {
            let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
            let tag = cipher
                .encrypt_in_place_detached(&chacha_nonce(block_num), b"", buf)
                .map_err(|_| FsError::CryptoFailure)?;
            Ok(Some(tag.into()))
        }
        ENC_NONE => Err(FsError::InvalidArgument),
        _ => Err(FsError::Unsupported),
    }
}

/// Decrypts one block in place under the master key.
///
/// For AEAD algorithms the stored tag is verified; a mismatch fails with
/// [`FsError::CryptoFailure`] and is never silently substituted.
pub fn decrypt_block(
    algo: u8,
    key: &[u8; 32],
    block_num: u64,
    buf: &mut [u8],
    tag: Option<&[u8; AEAD_TAG_SIZE]>,
) -> FsResult<()> {
    match algo {
        ENC_AES256_XTS => {
            xts_cipher(key).decrypt_area(buf, buf.len(), block_num as u128, get_tweak_default);
            Ok(())
        }
        ENC_CHACHA20_POLY => {
            let tag = tag.ok_or(FsError::CryptoFailure)?;
            let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
            cipher
                .decrypt_in_place_detached(&chacha_nonce(block_num), b"", buf, Tag::from_slice(tag))
                .map_err(|_| FsError::CryptoFailure)
        }
        ENC_NONE => Err(FsError::InvalidArgument),
        _ => Err(FsError::Unsupported),
    }
}

/// Derives the 32-byte user key from a password, the volume salt and the
/// KDF parameters stored in the superblock.
pub fn derive_key(
    kdf_algo: u32,
    password: &[u8],
    salt: &[u8; 32],
    iterations: u32,
    memory_kb: u32,
    parallelism: u32,
) -> FsResult<[u8; 32]> {
    let mut key = [0u8; 32];
    match kdf_algo {
        KDF_PBKDF2 => {
            pbkdf2::pbkdf2::<Hmac<Sha256>>(password, salt, iterations.max(1), &mut key)
                .map_err(|_| FsError::CryptoFailure)?;
            Ok(key)
        }
        KDF_ARGON2ID => {
            let params = Params::new(memory_kb, iterations.max(1), parallelism.max(1), Some(32))
                .map_err(|_| FsError::InvalidArgument)?;
            Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
                .hash_password_into(password, salt, &mut key)
                .map_err(|_| FsError::CryptoFailure)?;
            Ok(key)
        }
        KDF_NONE => Err(FsError::Unsupported),
        _ => Err(FsError::InvalidArgument),
    }
}

/// Unwraps the master key: AES-256-ECB decryption of two 16-byte blocks
/// under the user key, no IV.
pub fn unwrap_master_key(wrapped: &[u8; 32], user_key: &[u8; 32]) -> [u8; 32] {
    let cipher = Aes256::new(GenericArray::from_slice(user_key));
    let mut out = *wrapped;
    for chunk in out.chunks_exact_mut(16) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
    out
}

/// Wraps the master key under the user key. Used by `mkfs`.
pub fn wrap_master_key(master: &[u8; 32], user_key: &[u8; 32]) -> [u8; 32] {
    let cipher = Aes256::new(GenericArray::from_slice(user_key));
    let mut out = *master;
    for chunk in out.chunks_exact_mut(16) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    out
}

/// SHA-256 digest of the plaintext master key, stored in the superblock and
/// checked on unlock to reject wrong passwords.
pub fn key_digest(master: &[u8; 32]) -> [u8; 32] {
    Sha256::digest(master).into()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layout::BLOCK_SIZE;

    const KEY: [u8; 32] = [0x42; 32];

    #[test]
    fn xts_round_trip() {
        let mut buf = [0u8; BLOCK_SIZE];
        buf[..5].copy_from_slice(b"hello");
        encrypt_block(ENC_AES256_XTS, &KEY, 7, &mut buf).unwrap();
        assert_ne!(&buf[..5], b"hello");
        decrypt_block(ENC_AES256_XTS, &KEY, 7, &mut buf, None).unwrap();
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn xts_tweak_depends_on_block() {
        let mut a = [0u8; BLOCK_SIZE];
        let mut b = [0u8; BLOCK_SIZE];
        encrypt_block(ENC_AES256_XTS, &KEY, 1, &mut a).unwrap();
        encrypt_block(ENC_AES256_XTS, &KEY, 2, &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn chacha_round_trip_and_auth() {
        let mut buf = [3u8; BLOCK_SIZE];
        let tag = encrypt_block(ENC_CHACHA20_POLY, &KEY, 9, &mut buf)
            .unwrap()
            .unwrap();
        let mut copy = buf;
        decrypt_block(ENC_CHACHA20_POLY, &KEY, 9, &mut copy, Some(&tag)).unwrap();
        assert_eq!(copy, [3u8; BLOCK_SIZE]);

        // Tampered ciphertext must fail authentication
        let mut tampered = buf;
        tampered[0] ^= 1;
        assert!(matches!(
            decrypt_block(ENC_CHACHA20_POLY, &KEY, 9, &mut tampered, Some(&tag)),
            Err(FsError::CryptoFailure)
        ));

        // Wrong tag must fail too
        let mut wrong_tag = tag;
        wrong_tag[0] ^= 1;
        assert!(matches!(
            decrypt_block(ENC_CHACHA20_POLY, &KEY, 9, &mut buf, Some(&wrong_tag)),
            Err(FsError::CryptoFailure)
        ));
    }

    #[test]
    fn master_key_wrap_round_trip() {
        let master = [0xA5u8; 32];
        let user = derive_key(KDF_PBKDF2, b"test", &[0x01; 32], 1000, 0, 0).unwrap();
        let wrapped = wrap_master_key(&master, &user);
        assert_ne!(wrapped, master);
        assert_eq!(unwrap_master_key(&wrapped, &user), master);
        // A wrong password yields a different key, caught by the digest
        let wrong = derive_key(KDF_PBKDF2, b"wrong", &[0x01; 32], 1000, 0, 0).unwrap();
        let bad = unwrap_master_key(&wrapped, &wrong);
        assert_ne!(key_digest(&bad), key_digest(&master));
    }

    #[test]
    fn kdf_is_deterministic() {
        let a = derive_key(KDF_PBKDF2, b"pw", &[9; 32], 10, 0, 0).unwrap();
        let b = derive_key(KDF_PBKDF2, b"pw", &[9; 32], 10, 0, 0).unwrap();
        assert_eq!(a, b);
        let c = derive_key(KDF_ARGON2ID, b"pw", &[9; 32], 3, 1024, 2).unwrap();
        let d = derive_key(KDF_ARGON2ID, b"pw", &[9; 32], 3, 1024, 2).unwrap();
        assert_eq!(c, d);
        assert_ne!(a, c);
    }

    #[test]
    fn wipe_clears() {
        let mut secret = [0xEEu8; 32];
        wipe(&mut secret);
        assert_eq!(secret, [0u8; 32]);
    }
}
