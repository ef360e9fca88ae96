//! # Encryption Strategies
//!
//! Byte-transform strategies for the codec pipeline. Most of them are
//! obfuscation layers, not security: the protocol makes no confidentiality
//! claims. `Aes256Cbc` and `XChaCha20Poly1305` use real ciphers with keys
//! derived from a shared password via PBKDF2-HMAC-SHA256.
//!
//! Both ends of a connection must select the same strategy and key before
//! the first message. Nothing on the wire negotiates or verifies this; a
//! mismatch shows up as decode errors or garbage payloads.

use crate::error::{ProtocolError, Result};
use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Fixed salt for password-derived keys. Both peers must agree on it.
const KDF_SALT: &[u8] = b"gamewire/codec-pipeline/v1";

/// PBKDF2 iteration count
const KDF_ROUNDS: u32 = 4096;

const XCHACHA_NONCE_LEN: usize = 24;
const POLY1305_TAG_LEN: usize = 16;

/// A reversible byte transform applied to every serialized message.
pub trait Encryptor: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// True when the transform leaves bytes untouched.
    fn is_identity(&self) -> bool {
        false
    }
}

/// Selector for the built-in encryption strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionKind {
    #[default]
    None,
    Reverse,
    BitFlip,
    Xor,
    Substitution,
    SubstitutionShift,
    Aes256Cbc,
    XChaCha20Poly1305,
}

impl EncryptionKind {
    pub const ALL: [EncryptionKind; 8] = [
        EncryptionKind::None,
        EncryptionKind::Reverse,
        EncryptionKind::BitFlip,
        EncryptionKind::Xor,
        EncryptionKind::Substitution,
        EncryptionKind::SubstitutionShift,
        EncryptionKind::Aes256Cbc,
        EncryptionKind::XChaCha20Poly1305,
    ];

    pub fn requires_key(self) -> bool {
        !matches!(
            self,
            EncryptionKind::None | EncryptionKind::Reverse | EncryptionKind::BitFlip
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            EncryptionKind::None => "none",
            EncryptionKind::Reverse => "reverse",
            EncryptionKind::BitFlip => "bit_flip",
            EncryptionKind::Xor => "xor",
            EncryptionKind::Substitution => "substitution",
            EncryptionKind::SubstitutionShift => "substitution_shift",
            EncryptionKind::Aes256Cbc => "aes256_cbc",
            EncryptionKind::XChaCha20Poly1305 => "xchacha20_poly1305",
        }
    }

    /// Builds the strategy. Keyed strategies fail with `MissingKey` when
    /// `key` is absent or empty.
    pub fn build(self, key: Option<&[u8]>) -> Result<Arc<dyn Encryptor>> {
        let key = match key {
            Some(k) if !k.is_empty() => Some(k),
            _ => None,
        };
        if self.requires_key() && key.is_none() {
            return Err(ProtocolError::MissingKey(self.name().to_string()));
        }
        let key = key.unwrap_or_default();

        Ok(match self {
            EncryptionKind::None => Arc::new(NoEncryption),
            EncryptionKind::Reverse => Arc::new(ReverseCipher),
            EncryptionKind::BitFlip => Arc::new(BitFlipCipher),
            EncryptionKind::Xor => Arc::new(XorCipher::new(key)),
            EncryptionKind::Substitution => Arc::new(SubstitutionCipher::new(key, false)),
            EncryptionKind::SubstitutionShift => Arc::new(SubstitutionCipher::new(key, true)),
            EncryptionKind::Aes256Cbc => Arc::new(AesCbcCipher::from_password(key)),
            EncryptionKind::XChaCha20Poly1305 => Arc::new(XChaChaCipher::from_password(key)?),
        })
    }
}

impl fmt::Display for EncryptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Derive `out.len()` bytes of key material from a password
fn derive_key_material(password: &[u8], context: &[u8], out: &mut [u8]) {
    let mut salt = Vec::with_capacity(KDF_SALT.len() + context.len());
    salt.extend_from_slice(KDF_SALT);
    salt.extend_from_slice(context);
    pbkdf2::pbkdf2_hmac::<Sha256>(password, &salt, KDF_ROUNDS, out);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoEncryption;

impl Encryptor for NoEncryption {
    fn name(&self) -> &'static str {
        EncryptionKind::None.name()
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn is_identity(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseCipher;

impl Encryptor for ReverseCipher {
    fn name(&self) -> &'static str {
        EncryptionKind::Reverse.name()
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.iter().rev().copied().collect())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.encrypt(data)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BitFlipCipher;

impl Encryptor for BitFlipCipher {
    fn name(&self) -> &'static str {
        EncryptionKind::BitFlip.name()
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.iter().map(|b| !b).collect())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.encrypt(data)
    }
}

/// XOR with a repeating key
#[derive(Clone)]
pub struct XorCipher {
    key: Vec<u8>,
}

impl XorCipher {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }
}

impl fmt::Debug for XorCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XorCipher").field("key_len", &self.key.len()).finish()
    }
}

impl Encryptor for XorCipher {
    fn name(&self) -> &'static str {
        EncryptionKind::Xor.name()
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data
            .iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.encrypt(data)
    }
}

/// Additive substitution keyed by password bytes.
///
/// With `alternating` set, odd positions subtract the key byte instead of
/// adding it.
#[derive(Clone)]
pub struct SubstitutionCipher {
    key: Vec<u8>,
    alternating: bool,
}

impl SubstitutionCipher {
    pub fn new(key: &[u8], alternating: bool) -> Self {
        Self {
            key: key.to_vec(),
            alternating,
        }
    }

    fn shift(&self, data: &[u8], forward: bool) -> Vec<u8> {
        data.iter()
            .zip(self.key.iter().cycle())
            .enumerate()
            .map(|(i, (b, k))| {
                let add = forward ^ (self.alternating && i % 2 == 1);
                if add {
                    b.wrapping_add(*k)
                } else {
                    b.wrapping_sub(*k)
                }
            })
            .collect()
    }
}

impl fmt::Debug for SubstitutionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubstitutionCipher")
            .field("key_len", &self.key.len())
            .field("alternating", &self.alternating)
            .finish()
    }
}

impl Encryptor for SubstitutionCipher {
    fn name(&self) -> &'static str {
        if self.alternating {
            EncryptionKind::SubstitutionShift.name()
        } else {
            EncryptionKind::Substitution.name()
        }
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.shift(data, true))
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.shift(data, false))
    }
}

/// AES-256 in CBC mode with PKCS7 padding.
///
/// Key and IV are both derived from the password, so equal plaintexts give
/// equal ciphertexts. That is acceptable for this protocol's threat model.
pub struct AesCbcCipher {
    key: [u8; 32],
    iv: [u8; 16],
}

impl AesCbcCipher {
    pub fn from_password(password: &[u8]) -> Self {
        let mut material = [0u8; 48];
        derive_key_material(password, b"aes256-cbc", &mut material);
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&material[..32]);
        iv.copy_from_slice(&material[32..]);
        Self { key, iv }
    }
}

impl fmt::Debug for AesCbcCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesCbcCipher")
    }
}

impl Encryptor for AesCbcCipher {
    fn name(&self) -> &'static str {
        EncryptionKind::Aes256Cbc.name()
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(Aes256CbcEnc::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data))
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Aes256CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}

/// XChaCha20-Poly1305 with a random nonce prepended to every ciphertext
pub struct XChaChaCipher {
    cipher: XChaCha20Poly1305,
}

impl XChaChaCipher {
    pub fn from_password(password: &[u8]) -> Result<Self> {
        let mut key = [0u8; 32];
        derive_key_material(password, b"xchacha20-poly1305", &mut key);
        let cipher =
            XChaCha20Poly1305::new_from_slice(&key).map_err(|_| ProtocolError::EncryptionFailure)?;
        Ok(Self { cipher })
    }

    fn generate_nonce() -> Result<[u8; XCHACHA_NONCE_LEN]> {
        let mut nonce = [0u8; XCHACHA_NONCE_LEN];
        getrandom::fill(&mut nonce).map_err(|_| ProtocolError::EncryptionFailure)?;
        Ok(nonce)
    }
}

impl fmt::Debug for XChaChaCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("XChaChaCipher")
    }
}

impl Encryptor for XChaChaCipher {
    fn name(&self) -> &'static str {
        EncryptionKind::XChaCha20Poly1305.name()
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::generate_nonce()?;
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), data)
            .map_err(|_| ProtocolError::EncryptionFailure)?;
        let mut out = Vec::with_capacity(XCHACHA_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend(ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < XCHACHA_NONCE_LEN + POLY1305_TAG_LEN {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce, ciphertext) = data.split_at(XCHACHA_NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}
