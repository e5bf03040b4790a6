//! Node configuration for the Stagetree daemon.
//!
//! [`NodeConfig`] has defaults for everything except the reward profile,
//! which must be named explicitly. [`NodeConfig::load`] layers an optional
//! TOML file and `STAGETREE_*` environment variables over the defaults;
//! nested sections use a double underscore (`STAGETREE_ENGINE__LOCK_TIMEOUT_MS`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use stagetree_core::constants::{
    DEFAULT_LOCK_PERIOD_DAYS, DEFAULT_LOCK_REWARD_BPS, DEFAULT_RPC_PORT, SECS_PER_DAY,
};
use stagetree_core::error::ConfigError;
use stagetree_core::profile::{RewardProfile, PROFILE_CUSTOM};
use stagetree_engine::{BackoffPolicy, EngineConfig};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "STAGETREE";

/// Configuration for a node instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// IP address for the JSON-RPC server to bind to.
    pub rpc_bind: String,
    pub rpc_port: u16,
    /// Log level filter string (e.g. "info", "stagetree_engine=debug").
    pub log_level: String,
    /// Name of the reward profile. Required.
    pub profile: Option<String>,
    /// Full profile definition, used when `profile = "custom"`.
    pub custom_profile: Option<RewardProfile>,
    pub engine: EngineConfig,
    pub backoff: BackoffPolicy,
    pub lock_period_days: u64,
    /// Reward paid on a matured time-lock, in bps of the locked amount.
    pub lock_reward_bps: u64,
    /// How often the unlock sweep runs.
    pub sweep_interval_secs: u64,
    /// Send token withdrawals through the payout rail instead of the manual queue.
    pub live_payouts: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stagetree");

        Self {
            data_dir,
            rpc_bind: "127.0.0.1".to_string(),
            rpc_port: DEFAULT_RPC_PORT,
            log_level: "info".to_string(),
            profile: None,
            custom_profile: None,
            engine: EngineConfig::default(),
            backoff: BackoffPolicy::default(),
            lock_period_days: DEFAULT_LOCK_PERIOD_DAYS,
            lock_reward_bps: DEFAULT_LOCK_REWARD_BPS,
            sweep_interval_secs: 3_600,
            live_payouts: false,
        }
    }
}

impl NodeConfig {
    /// Load defaults, then `file` (if given), then environment overrides.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        let cfg: NodeConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::Source(e.to_string()))?;
        tracing::debug!(file = ?file, profile = ?cfg.profile, "configuration loaded");
        Ok(cfg)
    }

    /// Path to the RocksDB data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("matrixdata")
    }

    /// Socket address string for the RPC server.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_bind, self.rpc_port)
    }

    pub fn lock_period_secs(&self) -> u64 {
        self.lock_period_days.saturating_mul(SECS_PER_DAY)
    }

    /// The selected, validated reward profile.
    pub fn resolve_profile(&self) -> Result<RewardProfile, ConfigError> {
        let name = self.profile.as_deref().ok_or(ConfigError::MissingProfile)?;
        let profile = if name == PROFILE_CUSTOM {
            let mut custom = self.custom_profile.clone().ok_or_else(|| ConfigError::InvalidField {
                field: "custom_profile",
                reason: "profile \"custom\" requires a [custom_profile] section".into(),
            })?;
            custom.name = PROFILE_CUSTOM.to_string();
            custom
        } else {
            RewardProfile::named(name)?
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Check everything that would otherwise fail later at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resolve_profile()?.validate_recurrence(self.engine.stage_one_unit_base)?;
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidField {
                field: "sweep_interval_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.lock_period_days == 0 {
            return Err(ConfigError::InvalidField {
                field: "lock_period_days",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagetree_core::profile::{PROFILE_FLAT_TWO_LEG, PROFILE_PRINCIPAL_SIXTY_TWO};

    fn with_profile(name: &str) -> NodeConfig {
        NodeConfig { profile: Some(name.to_string()), ..NodeConfig::default() }
    }

    #[test]
    fn default_rpc_port() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.rpc_port, DEFAULT_RPC_PORT);
        assert_eq!(cfg.rpc_bind, "127.0.0.1");
    }

    #[test]
    fn default_data_dir_ends_with_stagetree() {
        let cfg = NodeConfig::default();
        assert!(cfg.data_dir.ends_with("stagetree"), "data_dir: {:?}", cfg.data_dir);
    }

    #[test]
    fn rpc_addr_custom() {
        let cfg = NodeConfig { rpc_bind: "0.0.0.0".to_string(), rpc_port: 9999, ..NodeConfig::default() };
        assert_eq!(cfg.rpc_addr(), "0.0.0.0:9999");
    }

    #[test]
    fn db_path_appends_matrixdata() {
        let cfg = NodeConfig { data_dir: PathBuf::from("/tmp/st-test"), ..NodeConfig::default() };
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/st-test/matrixdata"));
    }

    #[test]
    fn lock_period_in_seconds() {
        assert_eq!(NodeConfig::default().lock_period_secs(), 150 * 86_400);
    }

    #[test]
    fn profile_is_mandatory() {
        assert_eq!(NodeConfig::default().resolve_profile(), Err(ConfigError::MissingProfile));
    }

    #[test]
    fn stage_one_base_that_overflows_is_rejected() {
        let mut cfg = with_profile(PROFILE_PRINCIPAL_SIXTY_TWO);
        cfg.engine.stage_one_unit_base = stagetree_core::constants::Amount::MAX / 2;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidField { field: "stage_one_unit_base", .. })
        ));
    }

    #[test]
    fn builtin_profile_resolves() {
        let profile = with_profile(PROFILE_PRINCIPAL_SIXTY_TWO).resolve_profile().unwrap();
        assert_eq!(profile.completion_threshold, 62);
    }

    #[test]
    fn unknown_profile_rejected() {
        assert!(matches!(
            with_profile("golden-goose").resolve_profile(),
            Err(ConfigError::UnknownProfile(_))
        ));
    }

    #[test]
    fn custom_profile_needs_definition() {
        let cfg = with_profile(PROFILE_CUSTOM);
        assert!(matches!(
            cfg.resolve_profile(),
            Err(ConfigError::InvalidField { field: "custom_profile", .. })
        ));

        let mut definition = RewardProfile::named(PROFILE_FLAT_TWO_LEG).unwrap();
        definition.completion_threshold = 1;
        let cfg = NodeConfig { custom_profile: Some(definition), ..cfg };
        let profile = cfg.resolve_profile().unwrap();
        assert_eq!(profile.name, PROFILE_CUSTOM);
        assert_eq!(profile.completion_threshold, 1);
    }

    #[test]
    fn custom_profile_is_validated() {
        let mut definition = RewardProfile::named(PROFILE_FLAT_TWO_LEG).unwrap();
        definition.width = 0;
        let cfg = NodeConfig { custom_profile: Some(definition), ..with_profile(PROFILE_CUSTOM) };
        assert!(cfg.resolve_profile().is_err());
    }

    #[test]
    fn zero_sweep_interval_rejected() {
        let cfg = NodeConfig { sweep_interval_secs: 0, ..with_profile(PROFILE_FLAT_TWO_LEG) };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidField { field: "sweep_interval_secs", .. })
        ));
        assert!(with_profile(PROFILE_FLAT_TWO_LEG).validate().is_ok());
    }

    #[test]
    fn load_reads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stagetree.toml");
        std::fs::write(
            &path,
            "profile = \"ten-leg\"\nrpc_port = 19000\nlive_payouts = true\n\n[engine]\nlock_timeout_ms = 250\n",
        )
        .unwrap();
        let cfg = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.profile.as_deref(), Some("ten-leg"));
        assert_eq!(cfg.rpc_port, 19000);
        assert!(cfg.live_payouts);
        assert_eq!(cfg.engine.lock_timeout_ms, 250);
        assert_eq!(cfg.lock_reward_bps, DEFAULT_LOCK_REWARD_BPS);
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = NodeConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Source(_)));
    }
}
