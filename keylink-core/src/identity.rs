//! Local identity: armored key pair and the settings a client or server is built with.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Armored key pair. Immutable once handed to a client or server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
    /// Unlocks `private_key` when it is passphrase-protected.
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl KeyPair {
    pub fn new(private_key: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            private_key: private_key.into(),
            public_key: public_key.into(),
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }
}

// Never print secret material.
impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Construction-time settings shared by both roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub key_pair: KeyPair,
    /// Pinned peer fingerprints. When set, takes priority over any trust predicate.
    #[serde(default)]
    pub trusted_fingerprints: Option<Vec<String>>,
}

impl Settings {
    pub fn new(key_pair: KeyPair) -> Self {
        Self {
            key_pair,
            trusted_fingerprints: None,
        }
    }

    pub fn with_trusted_fingerprints<I, S>(mut self, fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trusted_fingerprints = Some(fingerprints.into_iter().map(Into::into).collect());
        self
    }
}
