//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use keylink_core::{KeyPair, Settings};
use serde::Deserialize;

/// Node configuration. File: ~/.config/keylink/config.toml or /etc/keylink/config.toml.
/// Env overrides: KEYLINK_HOST, KEYLINK_PORT, KEYLINK_PASSPHRASE, KEYLINK_HANDSHAKE_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen or connect host (default 0.0.0.0).
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port (default 45680).
    #[serde(default = "default_port")]
    pub port: u16,
    /// No deadline when unset.
    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,
    /// Armored private key file.
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    /// Armored public key file.
    #[serde(default)]
    pub public_key_path: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Pinned peer fingerprints; overrides any trust predicate.
    #[serde(default)]
    pub trusted_fingerprints: Option<Vec<String>>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    45680
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            handshake_timeout_secs: None,
            private_key_path: None,
            public_key_path: None,
            passphrase: None,
            trusted_fingerprints: None,
        }
    }
}

impl Config {
    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid address {}:{}", self.host, self.port))
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }

    /// Read the key files into the settings a client or server is built with.
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let private_path = self
            .private_key_path
            .as_deref()
            .context("private_key_path is not set")?;
        let public_path = self
            .public_key_path
            .as_deref()
            .context("public_key_path is not set")?;
        let private_key = read_key(private_path)?;
        let public_key = read_key(public_path)?;
        let mut key_pair = KeyPair::new(private_key, public_key);
        if let Some(passphrase) = &self.passphrase {
            key_pair = key_pair.with_passphrase(passphrase.clone());
        }
        let mut settings = Settings::new(key_pair);
        if let Some(fingerprints) = &self.trusted_fingerprints {
            settings = settings.with_trusted_fingerprints(fingerprints.iter().cloned());
        }
        Ok(settings)
    }
}

fn read_key(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading key file {}", path.display()))
}

/// Load config: merge default, then config file (if present), then env vars.
/// A config file that exists but cannot be read or parsed is an error.
pub fn load() -> anyhow::Result<Config> {
    let mut c = load_file(&config_paths())?.unwrap_or_default();
    apply_overrides(&mut c, |name| std::env::var(name).ok());
    Ok(c)
}

/// Load an explicit config file, then apply env vars.
pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let mut c = read_file(path.as_ref())?;
    apply_overrides(&mut c, |name| std::env::var(name).ok());
    Ok(c)
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

/// Unparseable numeric overrides are ignored.
fn apply_overrides(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("KEYLINK_HOST") {
        c.host = s;
    }
    if let Some(s) = var("KEYLINK_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Some(s) = var("KEYLINK_PASSPHRASE") {
        c.passphrase = Some(s);
    }
    if let Some(s) = var("KEYLINK_HANDSHAKE_TIMEOUT_SECS") {
        if let Ok(secs) = s.parse::<u64>() {
            c.handshake_timeout_secs = Some(secs);
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/keylink/config.toml"));
    }
    out.push(PathBuf::from("/etc/keylink/config.toml"));
    out
}

/// First existing path wins; later paths are not consulted.
fn load_file(paths: &[PathBuf]) -> anyhow::Result<Option<Config>> {
    match paths.iter().find(|p| p.exists()) {
        Some(path) => read_file(path).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keylink_core::SealedBox;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_when_fields_missing() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.host, "0.0.0.0");
        assert_eq!(c.port, 45680);
        assert_eq!(c.handshake_timeout(), None);
        assert_eq!(c.addr().unwrap().port(), 45680);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut c: Config = toml::from_str("port = 9000\nhandshake_timeout_secs = 5").unwrap();
        let vars = HashMap::from([
            ("KEYLINK_HOST", "127.0.0.1"),
            ("KEYLINK_PORT", "9100"),
            ("KEYLINK_HANDSHAKE_TIMEOUT_SECS", "not-a-number"),
        ]);
        apply_overrides(&mut c, |name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(c.addr().unwrap(), "127.0.0.1:9100".parse().unwrap());
        assert_eq!(c.handshake_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn settings_reads_key_files() {
        let keys = SealedBox::generate(Some("pw")).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let private_path = dir.path().join("id.key");
        let public_path = dir.path().join("id.pub");
        std::fs::write(&private_path, &keys.private_key).unwrap();
        std::fs::write(&public_path, &keys.public_key).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "private_key_path = {:?}\npublic_key_path = {:?}\npassphrase = \"pw\"\ntrusted_fingerprints = [\"ABCD\"]",
            private_path.display().to_string(),
            public_path.display().to_string(),
        )
        .unwrap();

        let c = load_from(file.path()).unwrap();
        let settings = c.settings().unwrap();
        assert_eq!(settings.key_pair.private_key, keys.private_key);
        assert_eq!(settings.key_pair.public_key, keys.public_key);
        assert_eq!(settings.key_pair.passphrase.as_deref(), Some("pw"));
        assert_eq!(settings.trusted_fingerprints, Some(vec!["ABCD".to_string()]));
    }

    #[test]
    fn first_existing_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("user.toml");
        let system = dir.path().join("system.toml");
        std::fs::write(&system, "port = 1000").unwrap();
        let paths = vec![user.clone(), system.clone()];
        assert_eq!(load_file(&paths).unwrap().unwrap().port, 1000);

        std::fs::write(&user, "port = 2000").unwrap();
        assert_eq!(load_file(&paths).unwrap().unwrap().port, 2000);

        assert!(load_file(&[dir.path().join("absent.toml")]).unwrap().is_none());
    }

    #[test]
    fn broken_config_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"not a port\"").unwrap();
        let err = load_file(&[path.clone()]).unwrap_err();
        assert!(format!("{err:#}").contains("parsing config"));
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn missing_key_path_is_an_error() {
        let err = Config::default().settings().unwrap_err();
        assert!(err.to_string().contains("private_key_path"));
    }
}
