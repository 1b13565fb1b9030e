//! Where the vault key comes from: `VAULT_SYNC_KEY`, the OS keyring, or a
//! password stretched inside the engine.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use keyring::Entry;
use vault_core::{KeySource, VaultKey};
use zeroize::Zeroizing;

pub const KEY_ENV: &str = "VAULT_SYNC_KEY";
pub const PASSWORD_ENV: &str = "VAULT_SYNC_PASSWORD";
const SERVICE_NAME: &str = "DarklockVaultSync";
const MIN_PASSWORD_LEN: usize = 12;

fn keyring_entry(root: &Path) -> Result<Entry> {
    Entry::new(SERVICE_NAME, &format!("vault-key:{}", root.display()))
        .map_err(|e| anyhow!("keyring init: {e}"))
}

pub fn load_from_keyring(root: &Path) -> Result<VaultKey> {
    let encoded = Zeroizing::new(
        keyring_entry(root)?
            .get_password()
            .map_err(|e| anyhow!("load vault key: {e}"))?,
    );
    VaultKey::from_hex(&encoded).context("keyring entry is not a valid vault key")
}

pub fn store_in_keyring(root: &Path, key: &VaultKey) -> Result<()> {
    keyring_entry(root)?
        .set_password(&key.to_hex())
        .map_err(|e| anyhow!("store vault key: {e}"))
}

fn env_key() -> Result<Option<VaultKey>> {
    match std::env::var(KEY_ENV) {
        Ok(hex) if !hex.is_empty() => {
            let hex = Zeroizing::new(hex);
            Ok(Some(VaultKey::from_hex(&hex).with_context(|| format!("{KEY_ENV} is not a 64-digit hex key"))?))
        }
        _ => Ok(None),
    }
}

fn prompt_password(prompt: &str, confirm: bool) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var(PASSWORD_ENV) {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let first = Zeroizing::new(
        rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?,
    );
    if first.len() < MIN_PASSWORD_LEN {
        return Err(anyhow!(
            "password too short; minimum {MIN_PASSWORD_LEN} characters"
        ));
    }
    if confirm {
        let second = Zeroizing::new(
            rpassword::prompt_password("Confirm password")
                .map_err(|e| anyhow!("password prompt: {e}"))?,
        );
        if *first != *second {
            return Err(anyhow!("passwords do not match"));
        }
    }
    Ok(first)
}

/// Key for an existing vault.
pub fn resolve(root: &Path, use_keyring: bool) -> Result<KeySource> {
    if let Some(key) = env_key()? {
        return Ok(KeySource::Key(key));
    }
    if use_keyring {
        return Ok(KeySource::Key(load_from_keyring(root)?));
    }
    Ok(KeySource::Password(prompt_password(
        "Vault password: ",
        false,
    )?))
}

/// Key for a vault being created. With `generate`, a random key is made
/// and either stored in the keyring or handed back for the caller to show.
pub fn for_new_vault(
    root: &Path,
    use_keyring: bool,
    generate: bool,
) -> Result<(KeySource, Option<Zeroizing<String>>)> {
    if let Some(key) = env_key()? {
        return Ok((KeySource::Key(key), None));
    }
    if generate || use_keyring {
        let key = VaultKey::generate();
        if use_keyring {
            store_in_keyring(root, &key)?;
            return Ok((KeySource::Key(key), None));
        }
        let shown = key.to_hex();
        return Ok((KeySource::Key(key), Some(shown)));
    }
    Ok((
        KeySource::Password(prompt_password("Create vault password: ", true)?),
        None,
    ))
}
