//! Named platform profiles: sync cadence, encryption tier and audit behaviour.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::CipherAlgorithm;
use crate::error::{Result, VaultError};
use crate::paths::validate_entity_id;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionStrength {
    Standard,
    Maximum,
}

impl EncryptionStrength {
    pub fn algorithm(&self) -> CipherAlgorithm {
        match self {
            EncryptionStrength::Standard => CipherAlgorithm::Aes256Gcm,
            EncryptionStrength::Maximum => CipherAlgorithm::XChaCha20Poly1305,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComplianceMode {
    None,
    Audit,
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformProfile {
    pub name: String,
    pub sync_interval_secs: u64,
    pub encryption_strength: EncryptionStrength,
    pub checkpoints_enabled: bool,
    pub archival_retention: bool,
    pub compliance_mode: ComplianceMode,
}

impl PlatformProfile {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    /// Records written under any compliance mode carry the protection flag.
    pub fn protects_records(&self) -> bool {
        self.compliance_mode != ComplianceMode::None
    }

    pub fn with_overrides(&self, overrides: &ProfileOverrides) -> PlatformProfile {
        PlatformProfile {
            name: self.name.clone(),
            sync_interval_secs: overrides
                .sync_interval_secs
                .unwrap_or(self.sync_interval_secs),
            encryption_strength: overrides
                .encryption_strength
                .unwrap_or(self.encryption_strength),
            checkpoints_enabled: overrides
                .checkpoints_enabled
                .unwrap_or(self.checkpoints_enabled),
            archival_retention: overrides
                .archival_retention
                .unwrap_or(self.archival_retention),
            compliance_mode: overrides.compliance_mode.unwrap_or(self.compliance_mode),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_strength: Option<EncryptionStrength>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoints_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archival_retention: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance_mode: Option<ComplianceMode>,
}

impl ProfileOverrides {
    pub fn is_empty(&self) -> bool {
        *self == ProfileOverrides::default()
    }
}

/// Audit copy written to `platform-configs/<name>.json` on every application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedProfile {
    pub profile: PlatformProfile,
    #[serde(default, skip_serializing_if = "ProfileOverrides::is_empty")]
    pub overrides: ProfileOverrides,
    pub applied_at: i64,
}

fn profile(
    name: &str,
    sync_interval_secs: u64,
    encryption_strength: EncryptionStrength,
    checkpoints_enabled: bool,
    archival_retention: bool,
    compliance_mode: ComplianceMode,
) -> PlatformProfile {
    PlatformProfile {
        name: name.to_string(),
        sync_interval_secs,
        encryption_strength,
        checkpoints_enabled,
        archival_retention,
        compliance_mode,
    }
}

pub fn builtin_profiles() -> Vec<PlatformProfile> {
    use ComplianceMode as C;
    use EncryptionStrength as E;
    vec![
        profile("default", 30, E::Maximum, true, false, C::None),
        profile("performance", 5, E::Standard, false, false, C::None),
        profile("high-security", 60, E::Maximum, true, true, C::Strict),
        profile("audit", 30, E::Maximum, true, true, C::Audit),
    ]
}

/// Pure name -> profile lookup.
#[derive(Debug, Clone)]
pub struct ProfileManager {
    profiles: BTreeMap<String, PlatformProfile>,
}

impl ProfileManager {
    /// Built-in profiles, with `custom` added on top (a custom profile may
    /// replace a built-in one of the same name).
    pub fn new(custom: &[PlatformProfile]) -> Result<Self> {
        let mut profiles: BTreeMap<String, PlatformProfile> = builtin_profiles()
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        for p in custom {
            validate_entity_id(&p.name)
                .map_err(|_| VaultError::UnknownProfile(format!("{} (invalid name)", p.name)))?;
            profiles.insert(p.name.clone(), p.clone());
        }
        Ok(Self { profiles })
    }

    pub fn get(&self, name: &str) -> Result<&PlatformProfile> {
        self.profiles
            .get(name)
            .ok_or_else(|| VaultError::UnknownProfile(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn resolve(&self, name: &str, overrides: &ProfileOverrides) -> Result<PlatformProfile> {
        Ok(self.get(name)?.with_overrides(overrides))
    }
}

impl Default for ProfileManager {
    fn default() -> Self {
        Self {
            profiles: builtin_profiles()
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_resolve() {
        let mgr = ProfileManager::default();
        let names: Vec<&str> = mgr.names().collect();
        assert_eq!(names, vec!["audit", "default", "high-security", "performance"]);
        let perf = mgr.get("performance").unwrap();
        assert!(!perf.checkpoints_enabled);
        assert_eq!(perf.encryption_strength.algorithm(), CipherAlgorithm::Aes256Gcm);
        assert!(mgr.get("high-security").unwrap().protects_records());
        assert!(matches!(mgr.get("turbo"), Err(VaultError::UnknownProfile(_))));
    }

    #[test]
    fn overrides_apply_field_by_field() {
        let mgr = ProfileManager::default();
        let overrides = ProfileOverrides {
            sync_interval_secs: Some(2),
            checkpoints_enabled: Some(false),
            ..Default::default()
        };
        let effective = mgr.resolve("default", &overrides).unwrap();
        assert_eq!(effective.sync_interval_secs, 2);
        assert!(!effective.checkpoints_enabled);
        assert_eq!(effective.encryption_strength, EncryptionStrength::Maximum);
        assert_eq!(effective.name, "default");
    }

    #[test]
    fn custom_profiles_extend_and_replace() {
        let custom = vec![
            profile("mobile", 120, EncryptionStrength::Standard, true, false, ComplianceMode::None),
            profile("default", 10, EncryptionStrength::Standard, false, false, ComplianceMode::None),
        ];
        let mgr = ProfileManager::new(&custom).unwrap();
        assert_eq!(mgr.get("mobile").unwrap().sync_interval_secs, 120);
        assert_eq!(mgr.get("default").unwrap().sync_interval_secs, 10);

        let bad = vec![profile("../etc", 1, EncryptionStrength::Standard, true, false, ComplianceMode::None)];
        assert!(ProfileManager::new(&bad).is_err());
    }

    #[test]
    fn profile_json_shape() {
        let json = serde_json::to_value(ProfileManager::default().get("audit").unwrap()).unwrap();
        assert_eq!(json["syncIntervalSecs"], 30);
        assert_eq!(json["encryptionStrength"], "maximum");
        assert_eq!(json["complianceMode"], "audit");
    }
}
