//! Auth profile rotation.
//!
//! A pool of credentials per provider with failure and cooldown accounting.
//! Rate-limited failures cool down immediately; other failures cool down
//! only after crossing the max-failures threshold. The pool persists as a
//! JSON document next to the main configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use valet_domain::error::{Error, Result};

/// Default cooldown applied to rate-limited profiles.
pub const DEFAULT_COOLDOWN_MINUTES: i64 = 10;

/// Failures tolerated before a non-rate-limited profile cools down.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Profile
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a profile's credential comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CredentialSource {
    /// The credential itself, inline.
    Literal { value: String },
    /// Indirect through a process environment variable.
    Env { var: String },
}

impl CredentialSource {
    /// Resolve to the credential string, if available.
    pub fn resolve(&self) -> Option<String> {
        match self {
            CredentialSource::Literal { value } => Some(value.clone()),
            CredentialSource::Env { var } => std::env::var(var).ok().filter(|v| !v.is_empty()),
        }
    }
}

/// One credential set among a provider's pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthProfile {
    pub id: String,
    pub provider: String,
    pub credential: CredentialSource,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

impl AuthProfile {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, credential: CredentialSource) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            credential,
            failure_count: 0,
            cooldown_until: None,
            last_used: None,
        }
    }

    /// Available iff not cooling down.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        match self.cooldown_until {
            Some(until) => until <= now,
            None => true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rotation manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tracks a pool of auth profiles with failure/cooldown accounting.
pub struct RotationManager {
    profiles: RwLock<Vec<AuthProfile>>,
    /// Persistence location; `None` keeps the pool in memory only.
    path: Option<PathBuf>,
    cooldown: Duration,
    max_failures: u32,
}

impl RotationManager {
    pub fn new(profiles: Vec<AuthProfile>) -> Self {
        Self {
            profiles: RwLock::new(profiles),
            path: None,
            cooldown: Duration::minutes(DEFAULT_COOLDOWN_MINUTES),
            max_failures: DEFAULT_MAX_FAILURES,
        }
    }

    /// Load the pool from `auth_profiles.json` next to the config file,
    /// starting empty if the file does not exist.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join("auth_profiles.json");
        let profiles = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("auth profiles {}: {e}", path.display())))?
        } else {
            Vec::new()
        };

        tracing::info!(
            profiles = profiles.len(),
            path = %path.display(),
            "auth profile pool loaded"
        );

        let mut manager = Self::new(profiles);
        manager.path = Some(path);
        Ok(manager)
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn add_profile(&self, profile: AuthProfile) {
        self.profiles.write().push(profile);
        self.persist();
    }

    /// Pick a profile: the preferred one when available, else the
    /// least-recently-used available profile for the provider.
    pub fn next_available(&self, provider: &str, preferred: Option<&str>) -> Option<AuthProfile> {
        let now = Utc::now();
        let mut profiles = self.profiles.write();

        let chosen_index = {
            let candidates: Vec<usize> = profiles
                .iter()
                .enumerate()
                .filter(|(_, p)| p.provider == provider && p.is_available(now))
                .map(|(i, _)| i)
                .collect();

            if candidates.is_empty() {
                return None;
            }

            preferred
                .and_then(|id| candidates.iter().find(|&&i| profiles[i].id == id).copied())
                .unwrap_or_else(|| {
                    // LRU: never-used profiles first, then oldest last_used.
                    *candidates
                        .iter()
                        .min_by_key(|&&i| profiles[i].last_used)
                        .expect("candidates is non-empty")
                })
        };

        profiles[chosen_index].last_used = Some(now);
        let chosen = profiles[chosen_index].clone();
        drop(profiles);
        self.persist();
        Some(chosen)
    }

    /// A successful call resets the failure counter.
    pub fn record_success(&self, profile_id: &str) {
        {
            let mut profiles = self.profiles.write();
            if let Some(profile) = profiles.iter_mut().find(|p| p.id == profile_id) {
                profile.failure_count = 0;
                profile.cooldown_until = None;
            }
        }
        self.persist();
    }

    /// Record a failed call.
    ///
    /// Rate-limited failures cool down immediately; others increment the
    /// counter and cool down once it crosses the threshold.
    pub fn record_failure(&self, profile_id: &str, reason: &str, rate_limited: bool) {
        {
            let mut profiles = self.profiles.write();
            if let Some(profile) = profiles.iter_mut().find(|p| p.id == profile_id) {
                profile.failure_count += 1;
                if rate_limited || profile.failure_count >= self.max_failures {
                    profile.cooldown_until = Some(Utc::now() + self.cooldown);
                    tracing::warn!(
                        profile = %profile_id,
                        reason,
                        rate_limited,
                        failures = profile.failure_count,
                        "auth profile entering cooldown"
                    );
                }
            }
        }
        self.persist();
    }

    /// Snapshot of all profiles (for operator inspection).
    pub fn list(&self) -> Vec<AuthProfile> {
        self.profiles.read().clone()
    }

    /// Write the pool to disk. Last-writer-wins per profile; counters are
    /// monotone between resets, so races are at worst conservative.
    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let profiles = self.profiles.read();
        match serde_json::to_string_pretty(&*profiles) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    tracing::warn!(error = %e, "failed to persist auth profiles");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize auth profiles"),
        }
    }
}

/// Resolve the conventional env var for a provider's API key.
pub fn env_var_for_provider(provider: &str) -> Option<&'static str> {
    match provider {
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "openai" => Some("OPENAI_API_KEY"),
        "google" | "gemini" | "google-gemini" => Some("GOOGLE_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        _ => None,
    }
}
