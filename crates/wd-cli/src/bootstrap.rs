//! Wires the engine together: secret key, registry, profile, orchestrator.

use std::path::PathBuf;

use anyhow::{Context, Result};
use rand::RngCore;

use wd_core::{Orchestrator, Profile, ProfileStore};
use wd_local_db::{Database, SecretCipher};
use wd_rest_client::RestClient;
use wd_workspace::Registry;

pub fn home_dir() -> Result<PathBuf> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .context("HOME environment variable not set")
}

/// Key for the registry's secret columns. Taken from `WD_SECRET_KEY`
/// (64 hex chars) when set; otherwise a per-host key file is created on
/// first use.
pub fn secret_cipher(home: &PathBuf) -> Result<SecretCipher> {
    if let Ok(hex) = std::env::var("WD_SECRET_KEY") {
        let bytes = decode_hex(&hex).context("WD_SECRET_KEY must be 64 hex characters")?;
        return Ok(SecretCipher::new(&bytes));
    }

    let key_path = home.join(".workdock").join("secret.key");
    if let Ok(existing) = std::fs::read(&key_path) {
        let bytes: [u8; 32] = existing
            .as_slice()
            .try_into()
            .context("corrupt secret key file")?;
        return Ok(SecretCipher::new(&bytes));
    }

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    if let Some(parent) = key_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&key_path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(SecretCipher::new(&bytes))
}

fn decode_hex(hex: &str) -> Result<[u8; 32]> {
    let hex = hex.trim();
    anyhow::ensure!(hex.len() == 64, "expected 64 hex characters");
    let mut bytes = [0u8; 32];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)?;
    }
    Ok(bytes)
}

pub fn profile_store() -> Result<ProfileStore> {
    Ok(ProfileStore::new(ProfileStore::default_path(&home_dir()?)))
}

/// Build the orchestrator for one command invocation.
pub fn orchestrator(callback_api_address: Option<&str>) -> Result<Orchestrator> {
    let home = home_dir()?;
    let cipher = secret_cipher(&home)?;
    let db = Database::open_default(cipher).context("cannot open workspace registry")?;
    let registry = Registry::new(db);

    let store = profile_store()?;
    let profile: Profile = store.load().unwrap_or_default();

    let mut orchestrator = Orchestrator::new(registry, profile.clone(), home);
    if let Some(address) = callback_api_address {
        let token = profile.current_auth().map(|a| a.token.clone());
        let client = RestClient::from_url(address, token)
            .context("bad --callback-api-address")?;
        orchestrator = orchestrator.with_callback(client);
    }
    Ok(orchestrator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_key_decoding() {
        let hex = "00".repeat(32);
        assert!(decode_hex(&hex).is_ok());
        assert!(decode_hex("zz").is_err());
        assert!(decode_hex(&"ab".repeat(31)).is_err());
    }

    #[test]
    fn key_file_is_created_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().to_path_buf();
        // force the file path branch
        std::env::remove_var("WD_SECRET_KEY");
        let _a = secret_cipher(&home).unwrap();
        let first = std::fs::read(home.join(".workdock/secret.key")).unwrap();
        let _b = secret_cipher(&home).unwrap();
        let second = std::fs::read(home.join(".workdock/secret.key")).unwrap();
        assert_eq!(first, second);
    }
}
