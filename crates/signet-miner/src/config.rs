//! Block producer configuration.
//!
//! Provides [`RpcConfig`] for reaching the node, [`SchedulerConfig`] for the
//! block timing policy, and [`MinerConfig`] bundling both with the reward
//! script and solver choice.

use std::path::{Path, PathBuf};

use bitcoin::ScriptBuf;

use signet_core::constants::{
    DEFAULT_MAX_INTERVAL, DEFAULT_RPC_PORT, DEFAULT_TARGET_SPACING, MIN_NBITS,
};
use signet_core::difficulty::nbits_to_target;

use crate::commitment::ExtensionSignal;
use crate::error::MinerError;
use crate::finalize::SolverChoice;
use crate::scheduler::MultiMinerPartition;

/// Default location of the node's signet cookie file.
pub fn default_cookie_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".bitcoin").join("signet").join(".cookie"))
}

/// How requests authenticate to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcAuth {
    None,
    UserPass { user: String, password: String },
    /// File holding `user:password`, rewritten by the node on each start.
    CookieFile(PathBuf),
}

impl RpcAuth {
    /// Resolve to a `(user, password)` pair, reading the cookie if needed.
    pub fn credentials(&self) -> Result<Option<(String, String)>, MinerError> {
        match self {
            Self::None => Ok(None),
            Self::UserPass { user, password } => Ok(Some((user.clone(), password.clone()))),
            Self::CookieFile(path) => read_cookie(path).map(Some),
        }
    }
}

fn read_cookie(path: &Path) -> Result<(String, String), MinerError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| MinerError::Config(format!("reading cookie {}: {e}", path.display())))?;
    let (user, password) = contents
        .trim()
        .split_once(':')
        .ok_or_else(|| MinerError::Config(format!("malformed cookie {}", path.display())))?;
    Ok((user.to_string(), password.to_string()))
}

/// Connection settings for the node's JSON-RPC interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    pub url: String,
    pub auth: RpcAuth,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: format!("http://127.0.0.1:{DEFAULT_RPC_PORT}"),
            auth: default_cookie_path().map_or(RpcAuth::None, RpcAuth::CookieFile),
            request_timeout_secs: 60,
        }
    }
}

/// Block timing policy.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Nominal block spacing of the network in seconds.
    pub target_spacing: f64,
    /// Compact target the network is steered towards.
    pub ultimate_bits: u32,
    /// Draw exponentially distributed intervals instead of fixed ones.
    pub poisson: bool,
    /// Cap on a single interval in seconds.
    pub max_interval: f64,
    /// Added to every action time.
    pub standby_delay: i64,
    /// Added to the action time of blocks owned by another miner.
    pub backup_delay: i64,
    /// Mine one block with this timestamp, immediately.
    pub set_block_time: Option<i64>,
    pub partition: MultiMinerPartition,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            target_spacing: DEFAULT_TARGET_SPACING,
            ultimate_bits: MIN_NBITS,
            poisson: false,
            max_interval: DEFAULT_MAX_INTERVAL,
            standby_delay: 0,
            backup_delay: 0,
            set_block_time: None,
            partition: MultiMinerPartition::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), MinerError> {
        if self.target_spacing.is_nan() || self.target_spacing <= 0.0 {
            return Err(MinerError::Config("target spacing must be positive".into()));
        }
        if self.max_interval.is_nan() || self.max_interval < 1.0 {
            return Err(MinerError::Config("max interval must be at least 1s".into()));
        }
        if self.standby_delay < 0 || self.backup_delay < 0 {
            return Err(MinerError::Config("delays must not be negative".into()));
        }
        let target = nbits_to_target(self.ultimate_bits)
            .map_err(|e| MinerError::Config(format!("ultimate target: {e}")))?;
        if target.is_zero() {
            return Err(MinerError::Config("ultimate target is zero".into()));
        }
        Ok(())
    }
}

/// Everything the control loop needs.
#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Script the coinbase pays to.
    pub reward_script: ScriptBuf,
    /// Extra push after the height in the coinbase scriptSig.
    pub pool_id: Option<Vec<u8>>,
    pub solver: SolverChoice,
    /// Stop after this many blocks; `None` runs forever.
    pub max_blocks: Option<u64>,
    pub rpc: RpcConfig,
    pub scheduler: SchedulerConfig,
    pub signal: ExtensionSignal,
}

impl MinerConfig {
    pub fn new(reward_script: ScriptBuf) -> Self {
        Self {
            reward_script,
            pool_id: None,
            solver: SolverChoice::default(),
            max_blocks: None,
            rpc: RpcConfig::default(),
            scheduler: SchedulerConfig::default(),
            signal: ExtensionSignal::default(),
        }
    }

    /// Block limit after applying the fixed-time rule: a fixed block time
    /// produces exactly one block.
    pub fn effective_max_blocks(&self) -> Option<u64> {
        if self.scheduler.set_block_time.is_some() {
            Some(1)
        } else {
            self.max_blocks
        }
    }

    pub fn validate(&self) -> Result<(), MinerError> {
        if self.reward_script.is_empty() {
            return Err(MinerError::Config("reward script is empty".into()));
        }
        self.scheduler.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_rpc_url_uses_signet_port() {
        let cfg = RpcConfig::default();
        assert_eq!(cfg.url, "http://127.0.0.1:38332");
    }

    #[test]
    fn default_cookie_under_signet_dir() {
        if let Some(path) = default_cookie_path() {
            assert!(path.ends_with(".bitcoin/signet/.cookie"), "{path:?}");
        }
    }

    #[test]
    fn cookie_credentials() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "__cookie__:s3cret").unwrap();
        let auth = RpcAuth::CookieFile(file.path().to_path_buf());
        assert_eq!(
            auth.credentials().unwrap(),
            Some(("__cookie__".to_string(), "s3cret".to_string()))
        );
    }

    #[test]
    fn malformed_and_missing_cookie() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "no-separator").unwrap();
        let auth = RpcAuth::CookieFile(file.path().to_path_buf());
        assert!(matches!(auth.credentials(), Err(MinerError::Config(_))));

        let missing = RpcAuth::CookieFile(PathBuf::from("/nonexistent/.cookie"));
        assert!(matches!(missing.credentials(), Err(MinerError::Config(_))));
    }

    #[test]
    fn user_pass_and_none() {
        assert_eq!(RpcAuth::None.credentials().unwrap(), None);
        let auth = RpcAuth::UserPass { user: "u".into(), password: "p".into() };
        assert_eq!(auth.credentials().unwrap(), Some(("u".into(), "p".into())));
    }

    #[test]
    fn scheduler_defaults() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.target_spacing, 1200.0);
        assert_eq!(cfg.ultimate_bits, 0x1e0377ae);
        assert_eq!(cfg.max_interval, 1800.0);
        assert!(!cfg.poisson);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn scheduler_validation() {
        let bad = [
            SchedulerConfig { target_spacing: 0.0, ..Default::default() },
            SchedulerConfig { max_interval: 0.5, ..Default::default() },
            SchedulerConfig { backup_delay: -1, ..Default::default() },
            SchedulerConfig { ultimate_bits: 0, ..Default::default() },
            SchedulerConfig { ultimate_bits: 0x1d80_0001, ..Default::default() },
        ];
        for cfg in bad {
            assert!(matches!(cfg.validate(), Err(MinerError::Config(_))), "{cfg:?}");
        }
    }

    #[test]
    fn fixed_block_time_mines_one_block() {
        let mut cfg = MinerConfig::new(ScriptBuf::from_bytes(vec![0x51]));
        cfg.max_blocks = Some(10);
        assert_eq!(cfg.effective_max_blocks(), Some(10));
        cfg.scheduler.set_block_time = Some(1_700_000_000);
        assert_eq!(cfg.effective_max_blocks(), Some(1));
    }

    #[test]
    fn empty_reward_script_rejected() {
        assert!(matches!(
            MinerConfig::new(ScriptBuf::new()).validate(),
            Err(MinerError::Config(_))
        ));
        assert!(MinerConfig::new(ScriptBuf::from_bytes(vec![0x51])).validate().is_ok());
    }
}
