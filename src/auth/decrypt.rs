//! Legacy encrypted key container decryption
//!
//! Old `ssh-keygen` output protects PKCS#1 keys with the OpenSSL "traditional"
//! PEM encryption: a `DEK-Info: ALGO,HEX-IV` header, a key derived from the
//! password with one round of MD5, and CBC ciphertext. Modern stacks dropped
//! support for this format, but such key files are still in circulation, so
//! the resolver has to read them. The scheme is reproduced here bit-for-bit;
//! it is not used for anything new.

use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use md5::{Digest, Md5};
use zeroize::Zeroizing;

use crate::error::TunnelError;

/// 3-key Triple-DES in CBC mode (`ssh-keygen` default for protected keys).
pub const CIPHER_3DES_CBC: &str = "DES-EDE3-CBC";

/// AES-128 in CBC mode (`openssl rsa -aes128` output).
pub const CIPHER_AES128_CBC: &str = "AES-128-CBC";

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type TdesEde3CbcDec = cbc::Decryptor<des::TdesEde3>;

/// A parsed legacy-encrypted key container.
///
/// Produced by the key-file parser, consumed exactly once by [`decrypt`] and
/// discarded; the plaintext is re-wrapped as an unencrypted container of the
/// same label by the caller.
#[derive(Debug)]
pub struct EncryptedKeyContainer {
    /// PEM label, e.g. `RSA PRIVATE KEY`
    pub label: String,
    /// Cipher identifier from the `DEK-Info` header
    pub cipher: String,
    /// Initialization vector from the `DEK-Info` header
    pub iv: Vec<u8>,
    /// Raw ciphertext (decoded PEM body)
    pub ciphertext: Vec<u8>,
}

/// Whether [`decrypt`] can handle the given cipher identifier.
///
/// Callers check this before prompting for a password: an unsupported
/// container must fail without ever asking.
pub fn is_supported_cipher(cipher: &str) -> bool {
    cipher == CIPHER_3DES_CBC || cipher == CIPHER_AES128_CBC
}

/// Recover the plaintext key bytes from a legacy-encrypted container.
pub fn decrypt(
    container: &EncryptedKeyContainer,
    password: &str,
) -> Result<Zeroizing<Vec<u8>>, TunnelError> {
    match container.cipher.as_str() {
        CIPHER_AES128_CBC => decrypt_cbc::<Aes128CbcDec>(container, password, 16, 16),
        CIPHER_3DES_CBC => decrypt_cbc::<TdesEde3CbcDec>(container, password, 24, 8),
        other => Err(TunnelError::UnsupportedCipher(other.to_string())),
    }
}

fn decrypt_cbc<D>(
    container: &EncryptedKeyContainer,
    password: &str,
    key_len: usize,
    block_len: usize,
) -> Result<Zeroizing<Vec<u8>>, TunnelError>
where
    D: BlockDecryptMut + KeyIvInit,
{
    if container.iv.len() != block_len {
        return Err(TunnelError::DecryptionFailed(format!(
            "IV must be {} bytes, got {}",
            block_len,
            container.iv.len()
        )));
    }
    if container.ciphertext.is_empty() || container.ciphertext.len() % block_len != 0 {
        return Err(TunnelError::DecryptionFailed(format!(
            "ciphertext length {} is not a multiple of the {}-byte block",
            container.ciphertext.len(),
            block_len
        )));
    }

    let key = derive_key(password.as_bytes(), &container.iv[..8], key_len);

    let mut plaintext = Zeroizing::new(container.ciphertext.clone());
    D::new_from_slices(&key, &container.iv)
        .map_err(|e| TunnelError::DecryptionFailed(e.to_string()))?
        .decrypt_padded_mut::<NoPadding>(&mut plaintext)
        .map_err(|e| TunnelError::DecryptionFailed(e.to_string()))?;

    strip_padding(&mut plaintext, block_len)?;
    Ok(plaintext)
}

/// OpenSSL `EVP_BytesToKey` with MD5 and a single round per block.
///
/// The salt is the first 8 bytes of the IV. Each round hashes the previous
/// digest, then the password, then the salt; digests are concatenated until
/// `key_len` bytes exist. For AES-128 that is one round; for Triple-DES the
/// 24-byte key is D1 ‖ MD5(D1 ‖ password ‖ salt)[0..8].
fn derive_key(password: &[u8], salt: &[u8], key_len: usize) -> Zeroizing<Vec<u8>> {
    let mut derived = Zeroizing::new(Vec::with_capacity(key_len + 16));
    let mut digest = Zeroizing::new(Vec::new());
    while derived.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&*digest);
        hasher.update(password);
        hasher.update(salt);
        *digest = hasher.finalize().to_vec();
        derived.extend_from_slice(&digest);
    }
    derived.truncate(key_len);
    derived
}

/// Remove PKCS#5/PKCS#7 padding the way the legacy tooling does: read the
/// last byte as the padding length and truncate. The remaining padding bytes
/// are not verified.
fn strip_padding(buf: &mut Vec<u8>, block_len: usize) -> Result<(), TunnelError> {
    let pad = *buf.last().unwrap_or(&0) as usize;
    if pad == 0 || pad > block_len || pad > buf.len() {
        return Err(TunnelError::DecryptionFailed(
            "bad padding, wrong password?".to_string(),
        ));
    }
    buf.truncate(buf.len() - pad);
    Ok(())
}
