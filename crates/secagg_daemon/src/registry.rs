//! Long-term key material: the public-key directory and signing keys.
//!
//! Key minting and distribution belong to an external authority; this
//! module only loads what that authority produced. The directory is a TOML
//! file mapping client ids to hex-encoded ed25519 public keys, and a
//! signing key is a bare 32-byte file.

use anyhow::{bail, Context};
use secagg_core::sign::{SigningKey, VerifyingKey};
use secagg_core::ClientId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// Directory of every participant's long-term public signature key.
#[derive(Debug, Clone, Default)]
pub struct KeyDirectory {
    keys: BTreeMap<ClientId, VerifyingKey>,
}

#[derive(Serialize, Deserialize)]
struct DirectoryFile {
    keys: BTreeMap<String, String>,
}

impl KeyDirectory {
    pub fn new(keys: BTreeMap<ClientId, VerifyingKey>) -> Self {
        Self { keys }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading key directory {}", path.display()))?;
        let file: DirectoryFile = toml::from_str(&content)
            .with_context(|| format!("parsing key directory {}", path.display()))?;

        let mut keys = BTreeMap::new();
        for (id, pubkey_hex) in file.keys {
            if id.is_empty() {
                bail!("key directory contains an empty client id");
            }
            let bytes = hex::decode(&pubkey_hex)
                .with_context(|| format!("client {id}: public key is not hex"))?;
            let arr: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("client {id}: public key must be 32 bytes"))?;
            let key = VerifyingKey::from_bytes(&arr)
                .with_context(|| format!("client {id}: invalid ed25519 public key"))?;
            keys.insert(ClientId::from(id), key);
        }

        info!(clients = keys.len(), path = %path.display(), "loaded key directory");
        Ok(Self { keys })
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let file = DirectoryFile {
            keys: self
                .keys
                .iter()
                .map(|(id, key)| (id.to_string(), hex::encode(key.to_bytes())))
                .collect(),
        };
        fs::write(path, toml::to_string_pretty(&file)?)
            .with_context(|| format!("writing key directory {}", path.display()))?;
        Ok(())
    }

    pub fn get(&self, id: &ClientId) -> Option<&VerifyingKey> {
        self.keys.get(id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Load a signing key from a 32-byte file, generating and saving a fresh one
/// if the file does not exist.
pub fn load_or_generate_signing_key(path: &Path) -> anyhow::Result<SigningKey> {
    if path.exists() {
        let bytes = fs::read(path).with_context(|| format!("reading key {}", path.display()))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("{}: signing key must be 32 bytes", path.display()))?;
        Ok(SigningKey::from_bytes(&arr))
    } else {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, key.to_bytes())
            .with_context(|| format!("writing key {}", path.display()))?;
        info!(path = %path.display(), "generated new signing key");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn directory_round_trips_through_toml() {
        let dir = std::env::temp_dir().join("secagg_test_directory.toml");
        let _ = fs::remove_file(&dir);

        let mut keys = BTreeMap::new();
        for id in ["1", "2", "3"] {
            let key = SigningKey::generate(&mut OsRng);
            keys.insert(ClientId::from(id), key.verifying_key());
        }
        let directory = KeyDirectory::new(keys.clone());

        directory.save(&dir).unwrap();
        let loaded = KeyDirectory::load(&dir).unwrap();

        assert_eq!(loaded.len(), 3);
        for (id, key) in &keys {
            assert_eq!(loaded.get(id), Some(key));
        }

        let _ = fs::remove_file(&dir);
    }

    #[test]
    fn malformed_directory_is_rejected() {
        let path = std::env::temp_dir().join("secagg_test_bad_directory.toml");
        fs::write(&path, "[keys]\n\"1\" = \"not-hex\"\n").unwrap();

        assert!(KeyDirectory::load(&path).is_err());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn signing_key_is_generated_then_reloaded() {
        let path = std::env::temp_dir().join("secagg_test_signing.key");
        let _ = fs::remove_file(&path);

        let first = load_or_generate_signing_key(&path).unwrap();
        let second = load_or_generate_signing_key(&path).unwrap();

        assert_eq!(first.to_bytes(), second.to_bytes());

        let _ = fs::remove_file(&path);
    }
}
