//! Encryption primitive: the `Cipher` seam used by the engine, and `SealedBox`,
//! the bundled X25519 + ChaCha20-Poly1305 implementation.
//!
//! Sealed message layout: `ephemeral public key (32) | nonce (12) | ciphertext + tag`.
//! Keys and text-mode ciphertext travel as ASCII armor (base64 between BEGIN/END lines).

use argon2::Argon2;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::identity::KeyPair;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const SALT_SIZE: usize = 16;
const SEAL_CONTEXT: &[u8] = b"keylink-seal-v1";

const PUBLIC_LABEL: &str = "KEYLINK PUBLIC KEY";
const PRIVATE_LABEL: &str = "KEYLINK PRIVATE KEY";
const MESSAGE_LABEL: &str = "KEYLINK MESSAGE";

const KEY_PLAIN: u8 = 0;
const KEY_LOCKED: u8 = 1;
const LOCKED_KEY_LEN: usize = 1 + SALT_SIZE + NONCE_SIZE + KEY_SIZE + TAG_SIZE;

/// Asymmetric encryption to an armored public key. Implementations must be thread-safe;
/// one instance is shared by every connection of a client or server.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, public_key: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(
        &self,
        private_key: &str,
        passphrase: Option<&str>,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Stable identifier of a public key, compared against trusted fingerprint lists.
    fn fingerprint(&self, public_key: &str) -> Result<String, CryptoError>;

    /// Unlock `private_key` once; decrypting with the result skips passphrase derivation.
    /// The default passes the key and passphrase through unchanged.
    fn unlock(&self, private_key: &str, passphrase: Option<&str>) -> Result<UnlockedKey, CryptoError> {
        Ok(UnlockedKey {
            private_key: private_key.to_owned(),
            passphrase: passphrase.map(str::to_owned),
        })
    }
}

/// Private key ready for [`Cipher::decrypt`], as returned by [`Cipher::unlock`].
#[derive(Clone, PartialEq, Eq)]
pub struct UnlockedKey {
    pub private_key: String,
    pub passphrase: Option<String>,
}

impl fmt::Debug for UnlockedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockedKey").finish_non_exhaustive()
    }
}

/// Anonymous-sender sealed boxes over X25519.
#[derive(Debug, Clone, Copy, Default)]
pub struct SealedBox;

impl SealedBox {
    /// Generate a fresh armored key pair. With a passphrase the private key is locked
    /// (Argon2id-derived wrapping key).
    pub fn generate(passphrase: Option<&str>) -> Result<KeyPair, CryptoError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let body = match passphrase {
            Some(passphrase) => lock_secret(&secret.to_bytes(), passphrase)?,
            None => plain_secret(&secret),
        };
        Ok(KeyPair {
            private_key: armor(PRIVATE_LABEL, &body),
            public_key: armor(PUBLIC_LABEL, public.as_bytes()),
            passphrase: passphrase.map(str::to_owned),
        })
    }
}

impl Cipher for SealedBox {
    fn encrypt(&self, public_key: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let recipient = parse_public(public_key)?;
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&recipient);
        let key = derive_seal_key(shared.as_bytes(), &ephemeral_public, &recipient);

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let sealed = seal(&key, &nonce, plaintext).map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(KEY_SIZE + NONCE_SIZE + sealed.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(
        &self,
        private_key: &str,
        passphrase: Option<&str>,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < KEY_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Decrypt);
        }
        let secret = unlock_private(private_key, passphrase)?;
        let recipient = PublicKey::from(&secret);
        let mut ephemeral = [0u8; KEY_SIZE];
        ephemeral.copy_from_slice(&ciphertext[..KEY_SIZE]);
        let ephemeral_public = PublicKey::from(ephemeral);
        let shared = secret.diffie_hellman(&ephemeral_public);
        let key = derive_seal_key(shared.as_bytes(), &ephemeral_public, &recipient);
        open(
            &key,
            &ciphertext[KEY_SIZE..KEY_SIZE + NONCE_SIZE],
            &ciphertext[KEY_SIZE + NONCE_SIZE..],
        )
        .map_err(|_| CryptoError::Decrypt)
    }

    fn fingerprint(&self, public_key: &str) -> Result<String, CryptoError> {
        let public = parse_public(public_key)?;
        Ok(hex::encode_upper(Sha256::digest(public.as_bytes())))
    }

    /// Re-armors the secret in the plain format, so the Argon2 derivation runs only here.
    fn unlock(&self, private_key: &str, passphrase: Option<&str>) -> Result<UnlockedKey, CryptoError> {
        let secret = unlock_private(private_key, passphrase)?;
        Ok(UnlockedKey {
            private_key: armor(PRIVATE_LABEL, &plain_secret(&secret)),
            passphrase: None,
        })
    }
}

/// Armor text-mode ciphertext for a Data packet.
pub fn armor_message(ciphertext: &[u8]) -> String {
    armor(MESSAGE_LABEL, ciphertext)
}

/// Inverse of [`armor_message`].
pub fn dearmor_message(text: &str) -> Result<Vec<u8>, CryptoError> {
    dearmor(MESSAGE_LABEL, text)
}

fn armor(label: &str, bytes: &[u8]) -> String {
    format!(
        "-----BEGIN {label}-----\n{}\n-----END {label}-----\n",
        STANDARD.encode(bytes)
    )
}

fn dearmor(label: &str, text: &str) -> Result<Vec<u8>, CryptoError> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let body = text
        .trim()
        .strip_prefix(begin.as_str())
        .and_then(|rest| rest.strip_suffix(end.as_str()))
        .ok_or_else(|| CryptoError::Armor(label.to_owned()))?;
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|_| CryptoError::Armor(label.to_owned()))
}

fn parse_public(armored: &str) -> Result<PublicKey, CryptoError> {
    let bytes: [u8; KEY_SIZE] = dearmor(PUBLIC_LABEL, armored)?
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".into()))?;
    Ok(PublicKey::from(bytes))
}

fn unlock_private(armored: &str, passphrase: Option<&str>) -> Result<StaticSecret, CryptoError> {
    let body = dearmor(PRIVATE_LABEL, armored)?;
    let secret: [u8; KEY_SIZE] = match body.first() {
        Some(&KEY_PLAIN) if body.len() == 1 + KEY_SIZE => {
            let mut secret = [0u8; KEY_SIZE];
            secret.copy_from_slice(&body[1..]);
            secret
        }
        Some(&KEY_LOCKED) if body.len() == LOCKED_KEY_LEN => {
            let passphrase = passphrase.ok_or(CryptoError::PassphraseRequired)?;
            let salt = &body[1..1 + SALT_SIZE];
            let nonce = &body[1 + SALT_SIZE..1 + SALT_SIZE + NONCE_SIZE];
            let wrapping = derive_passphrase_key(passphrase, salt)?;
            open(&wrapping, nonce, &body[1 + SALT_SIZE + NONCE_SIZE..])
                .map_err(|_| CryptoError::WrongPassphrase)?
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("private key must be 32 bytes".into()))?
        }
        _ => return Err(CryptoError::InvalidKey("unrecognised private key".into())),
    };
    Ok(StaticSecret::from(secret))
}

fn plain_secret(secret: &StaticSecret) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + KEY_SIZE);
    body.push(KEY_PLAIN);
    body.extend_from_slice(&secret.to_bytes());
    body
}

fn lock_secret(secret: &[u8; KEY_SIZE], passphrase: &str) -> Result<Vec<u8>, CryptoError> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);
    let wrapping = derive_passphrase_key(passphrase, &salt)?;
    let sealed = seal(&wrapping, &nonce, secret).map_err(|_| CryptoError::Encrypt)?;
    let mut body = Vec::with_capacity(LOCKED_KEY_LEN);
    body.push(KEY_LOCKED);
    body.extend_from_slice(&salt);
    body.extend_from_slice(&nonce);
    body.extend_from_slice(&sealed);
    Ok(body)
}

fn derive_passphrase_key(passphrase: &str, salt: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    let mut key = [0u8; KEY_SIZE];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::InvalidKey(format!("passphrase key derivation: {e}")))?;
    Ok(key)
}

/// Per-message key over the shared secret and both public halves.
fn derive_seal_key(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &PublicKey) -> [u8; KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(SEAL_CONTEXT);
    hasher.update(shared);
    hasher.update(ephemeral.as_bytes());
    hasher.update(recipient.as_bytes());
    hasher.finalize().into()
}

fn seal(key: &[u8; KEY_SIZE], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, ()> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| ())?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| ())
}

fn open(key: &[u8; KEY_SIZE], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, ()> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| ())?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("malformed {0} armor")]
    Armor(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("private key is locked; passphrase required")]
    PassphraseRequired,
    #[error("wrong passphrase")]
    WrongPassphrase,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}
