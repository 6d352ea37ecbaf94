use crate::error::EngineError;

pub const ENV_DETERMINISTIC: &str = "VERSA_DETERMINISTIC";
pub const ENV_CACHE_MODE: &str = "VERSA_CACHE_MODE";
pub const ENV_CHECKPOINT_POLICY: &str = "VERSA_CHECKPOINT_POLICY";

pub const DEFAULT_AUTHOR: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Reads go through the per-schema cache tables.
    #[default]
    Use,
    /// Every read recomputes from the log and the graph.
    Bypass,
}

impl CacheMode {
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s.to_ascii_lowercase().as_str() {
            "use" | "on" | "" => Ok(Self::Use),
            "bypass" | "off" => Ok(Self::Bypass),
            other => Err(EngineError::Config(format!("unknown cache mode {other:?}"))),
        }
    }
}

/// Which state counts as "the checkpoint" when reconciling a working set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointPolicy {
    /// Nearest ancestor commit labelled `checkpoint`.
    #[default]
    NearestLabel,
    /// The version tip right before the commit being reconciled.
    NearestCommit,
}

impl CheckpointPolicy {
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s.to_ascii_lowercase().as_str() {
            "label" | "nearest_label" | "" => Ok(Self::NearestLabel),
            "commit" | "nearest_commit" => Ok(Self::NearestCommit),
            other => Err(EngineError::Config(format!("unknown checkpoint policy {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Counter-based ids and timestamps instead of uuid v7 and wall time.
    pub deterministic: bool,
    pub cache_mode: CacheMode,
    pub checkpoint_policy: CheckpointPolicy,
    /// Author recorded on commits made by sessions without their own author.
    pub default_author: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deterministic: false,
            cache_mode: CacheMode::Use,
            checkpoint_policy: CheckpointPolicy::NearestLabel,
            default_author: DEFAULT_AUTHOR.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn deterministic(mut self, on: bool) -> Self {
        self.deterministic = on;
        self
    }

    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn checkpoint_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint_policy = policy;
        self
    }

    pub fn default_author(mut self, author: &str) -> Self {
        self.default_author = author.to_string();
        self
    }

    /// Defaults overridden by `VERSA_DETERMINISTIC`, `VERSA_CACHE_MODE` and
    /// `VERSA_CHECKPOINT_POLICY`.
    pub fn from_env() -> Result<Self, EngineError> {
        let mut config = Self::default();
        config.deterministic = std::env::var(ENV_DETERMINISTIC)
            .ok()
            .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        if let Ok(mode) = std::env::var(ENV_CACHE_MODE) {
            config.cache_mode = CacheMode::parse(&mode)?;
        }
        if let Ok(policy) = std::env::var(ENV_CHECKPOINT_POLICY) {
            config.checkpoint_policy = CheckpointPolicy::parse(&policy)?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_modes() {
        assert_eq!(CacheMode::parse("BYPASS").unwrap(), CacheMode::Bypass);
        assert_eq!(CacheMode::parse("use").unwrap(), CacheMode::Use);
        assert!(CacheMode::parse("sometimes").is_err());
        assert_eq!(
            CheckpointPolicy::parse("nearest_commit").unwrap(),
            CheckpointPolicy::NearestCommit
        );
        assert!(CheckpointPolicy::parse("latest").is_err());
    }

    #[test]
    fn builder_setters() {
        let config = EngineConfig::default()
            .deterministic(true)
            .cache_mode(CacheMode::Bypass)
            .default_author("alice");
        assert!(config.deterministic);
        assert_eq!(config.cache_mode, CacheMode::Bypass);
        assert_eq!(config.checkpoint_policy, CheckpointPolicy::NearestLabel);
        assert_eq!(config.default_author, "alice");
    }
}
