use crate::error::{Error, Result};
use crate::state::validate_network_name;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use std::io::Write;
use std::path::{Path, PathBuf};
use x25519_dalek::{PublicKey, StaticSecret};

const PASSPHRASE_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

pub fn generate_wg_keys() -> KeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    KeyPair {
        private_key: STANDARD.encode(secret.to_bytes()),
        public_key: STANDARD.encode(public.to_bytes()),
    }
}

pub fn wg_keys_from_private_base64(private_key: &str) -> Result<KeyPair> {
    let bytes = STANDARD
        .decode(private_key.trim())
        .map_err(|_| Error::InvalidKey("wireguard private key is not base64".to_string()))?;
    let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        Error::InvalidKey(format!(
            "wireguard private key: expected 32 bytes, got {} bytes",
            bytes.len()
        ))
    })?;
    let secret = StaticSecret::from(secret);
    let public = PublicKey::from(&secret);
    Ok(KeyPair {
        private_key: STANDARD.encode(secret.to_bytes()),
        public_key: STANDARD.encode(public.to_bytes()),
    })
}

/// Use the supplied private key when there is one, otherwise generate a pair.
pub fn resolve_wg_keys(private_key: Option<&str>) -> Result<KeyPair> {
    match private_key.map(str::trim).filter(|key| !key.is_empty()) {
        Some(key) => wg_keys_from_private_base64(key),
        None => Ok(generate_wg_keys()),
    }
}

pub fn read_private_key_file(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidKey(format!(
            "key file {} is empty",
            path.display()
        )));
    }
    Ok(trimmed.to_string())
}

/// Random alphanumeric passphrase used to authenticate the node later on.
pub fn generate_passphrase() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(PASSPHRASE_LEN)
        .map(char::from)
        .collect()
}

/// Where per-network secrets live.
pub trait SecretStore: Send + Sync {
    fn store_secret(&self, value: &str, network: &str) -> Result<()>;

    fn store_private_key(&self, value: &str, network: &str) -> Result<()>;

    fn read_private_key(&self, network: &str) -> Result<String>;

    fn remove(&self, network: &str) -> Result<()>;
}

/// Owner-only files under `<data>/secrets`.
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("secrets"),
        }
    }

    fn secret_path(&self, network: &str) -> Result<PathBuf> {
        validate_network_name(network)?;
        Ok(self.dir.join(format!("{network}.secret")))
    }

    fn key_path(&self, network: &str) -> Result<PathBuf> {
        validate_network_name(network)?;
        Ok(self.dir.join(format!("{network}.key")))
    }

    fn write_private(&self, path: &Path, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        #[cfg(unix)]
        {
            // An existing file keeps its old mode on open.
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(value.as_bytes())?;
        Ok(())
    }
}

impl SecretStore for FileSecretStore {
    fn store_secret(&self, value: &str, network: &str) -> Result<()> {
        let path = self.secret_path(network)?;
        self.write_private(&path, value)
    }

    fn store_private_key(&self, value: &str, network: &str) -> Result<()> {
        let path = self.key_path(network)?;
        self.write_private(&path, value)
    }

    fn read_private_key(&self, network: &str) -> Result<String> {
        read_private_key_file(&self.key_path(network)?)
    }

    fn remove(&self, network: &str) -> Result<()> {
        for path in [self.secret_path(network)?, self.key_path(network)?] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
