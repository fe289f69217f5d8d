use byteorder::{LittleEndian, WriteBytesExt};
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, Tag};
use rand::RngCore;

pub const MAC_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

/// Number of ciphertext bytes sampled when computing a header-protection mask.
pub const SAMPLE_SIZE: usize = 16;
/// Number of mask bytes produced for header protection.
pub const MASK_SIZE: usize = 5;

const NONCE_OFFSET: usize = NONCE_SIZE - 8;

#[inline]
fn nonce_to_bytes(nonce: u64) -> [u8; NONCE_SIZE] {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    (&mut nonce_bytes[NONCE_OFFSET..])
        .write_u64::<LittleEndian>(nonce)
        .expect("Error creating nonce");
    nonce_bytes
}

/// Encrypts the provided plain text into the cipher buffer. The encrypted message size will be
/// the plain text size plus the MAC size (16 bytes). The function will panic if the cipher slice
/// does not have exactly that size.
///
/// The additional data, nonce and key must match those used during decryption, the decryption
/// will fail otherwise.
#[inline]
pub fn encrypt(
    cipher: &mut [u8],
    plain: &[u8],
    additional_data: &[u8],
    nonce: u64,
    key: &[u8; KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Encryption: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    let aead = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce_bytes = nonce_to_bytes(nonce);

    let (body, mac) = cipher.split_at_mut(plain.len());
    body.copy_from_slice(plain);

    match aead.encrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), additional_data, body) {
        Ok(tag) => {
            mac.copy_from_slice(tag.as_slice());
            true
        }
        Err(_) => false,
    }
}

/// Decrypts the provided ciphertext into the plain buffer. The decoded message size is equal to
/// the cipher text length minus the MAC (16 bytes). The function will panic if the sizes do not
/// match.
///
/// The additional data, nonce and key must match those used during encryption, the decryption
/// will fail otherwise.
#[inline]
pub fn decrypt(
    plain: &mut [u8],
    cipher: &[u8],
    additional_data: &[u8],
    nonce: u64,
    key: &[u8; KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Decryption: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    let aead = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce_bytes = nonce_to_bytes(nonce);

    plain.copy_from_slice(&cipher[..plain.len()]);
    let tag = Tag::from_slice(&cipher[plain.len()..]);

    aead.decrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), additional_data, plain, tag)
        .is_ok()
}

/// Computes the 5-byte header-protection mask for the supplied ciphertext sample. The first
/// four sample bytes select the keystream block, the remaining twelve are the stream nonce.
#[inline]
pub fn hp_mask(sample: &[u8; SAMPLE_SIZE], key: &[u8; KEY_SIZE]) -> [u8; MASK_SIZE] {
    let counter = u32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);

    let mut stream = ChaCha20::new(
        chacha20::Key::from_slice(key),
        chacha20::Nonce::from_slice(&sample[4..]),
    );
    stream.seek(u64::from(counter) * 64);

    let mut mask = [0u8; MASK_SIZE];
    stream.apply_keystream(&mut mask);
    mask
}

/// Fills the target slice with cryptographically random bytes.
#[inline]
pub fn random_bytes(target: &mut [u8]) {
    rand::thread_rng().fill_bytes(target);
}
