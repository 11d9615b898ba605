use crate::shared::{QuicError, QuicResult};
use byteorder::{LittleEndian, WriteBytesExt};
use ctor::ctor;
use libsodium_sys;

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

const NONCE_OFFSET: usize = NONCE_SIZE - 8;

/// Initialize the sodium infrastructure
#[ctor(unsafe)]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Packet protection context. The packet number doubles as the nonce and the
/// packet header as the additional data; both encryption and decryption work
/// in place over the datagram buffer.
pub trait Aead {
    /// Size of the authentication tag appended to the plaintext.
    fn overhead(&self) -> usize;

    /// Seals `buf[..plain_len]` in place, appending the tag. `buf` must hold
    /// at least `plain_len + overhead()` bytes. Returns the sealed length.
    fn seal(&self, nonce: u64, additional_data: &[u8], buf: &mut [u8], plain_len: usize) -> usize;

    /// Opens the sealed `buf` in place, returning the plaintext length.
    fn open(&self, nonce: u64, additional_data: &[u8], buf: &mut [u8]) -> QuicResult<usize>;
}

#[inline]
fn nonce_to_bytes(nonce: u64) -> [u8; NONCE_SIZE] {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    (&mut nonce_bytes[NONCE_OFFSET..])
        .write_u64::<LittleEndian>(nonce)
        .expect("Error creating nonce");
    nonce_bytes
}

/// IETF ChaCha20-Poly1305 packet protection keyed from an exported secret.
pub struct ChaCha20Poly1305 {
    key: [u8; KEY_SIZE],
}

impl ChaCha20Poly1305 {
    #[inline]
    pub fn new(key: [u8; KEY_SIZE]) -> ChaCha20Poly1305 {
        ChaCha20Poly1305 { key }
    }

    /// Keys the context from the leading bytes of an exported secret.
    pub fn from_secret(secret: &[u8]) -> ChaCha20Poly1305 {
        let mut key = [0u8; KEY_SIZE];
        let take = secret.len().min(KEY_SIZE);
        key[..take].copy_from_slice(&secret[..take]);
        ChaCha20Poly1305 { key }
    }
}

impl Aead for ChaCha20Poly1305 {
    #[inline]
    fn overhead(&self) -> usize {
        MAC_SIZE
    }

    fn seal(&self, nonce: u64, additional_data: &[u8], buf: &mut [u8], plain_len: usize) -> usize {
        let sealed_len = plain_len + MAC_SIZE;

        if buf.len() < sealed_len {
            panic!(
                "Encryption: buffer length ({}) must hold plain data length ({}) + MAC size ({})",
                buf.len(),
                plain_len,
                MAC_SIZE
            )
        }

        let nonce_bytes = nonce_to_bytes(nonce);

        unsafe {
            let cipher = buf.as_mut_ptr();
            let plain = cipher as *const u8;

            // In-place encryption is supported by the sodium AEAD primitives.
            let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
                cipher,
                ::std::ptr::null_mut(),
                plain,
                plain_len as u64,
                additional_data.as_ptr(),
                additional_data.len() as u64,
                ::std::ptr::null(),
                nonce_bytes.as_ptr(),
                self.key.as_ptr(),
            );

            if result < 0 {
                panic!("Encryption failed")
            }
        }

        sealed_len
    }

    fn open(&self, nonce: u64, additional_data: &[u8], buf: &mut [u8]) -> QuicResult<usize> {
        if buf.len() < MAC_SIZE {
            return Err(QuicError::DecryptionFailure);
        }

        let plain_len = buf.len() - MAC_SIZE;
        let nonce_bytes = nonce_to_bytes(nonce);

        let result = unsafe {
            let plain = buf.as_mut_ptr();
            let cipher = plain as *const u8;

            libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
                plain,
                ::std::ptr::null_mut(),
                ::std::ptr::null_mut(),
                cipher,
                buf.len() as u64,
                additional_data.as_ptr(),
                additional_data.len() as u64,
                nonce_bytes.as_ptr(),
                self.key.as_ptr(),
            )
        };

        match result >= 0 {
            true => Ok(plain_len),
            _ => Err(QuicError::DecryptionFailure),
        }
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}
