//! Evaluation options shared by call sites and process pools.
//!
//! # Environment Variables
//!
//! - `EVALCACHE_PROCESS_LIMIT` - Maximum live evaluator processes per pool
//! - `EVALCACHE_DYNAMIC_EVALUATOR` - Use the generic evaluator program (true/false)
//! - `EVALCACHE_EVALUATOR` - Path to the generic evaluator program
//! - `EVALCACHE_TIMEOUT_MS` - Read timeout for evaluator responses (0 disables)
//! - `EVALCACHE_WAIT_TIMEOUT_MS` - Bound on waiting for a free evaluator (0 blocks forever)

use crate::error::{EvalError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of evaluator processes a pool may keep alive.
pub const DEFAULT_PROCESS_LIMIT: usize = 10;

/// Options governing external function evaluation.
///
/// Read once per call site; changes are not picked up mid-evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalOptions {
    /// Maximum number of live evaluator processes per pool.
    pub process_limit: usize,
    /// Launch the generic evaluator program instead of the compiled artifact.
    pub dynamic_evaluator: bool,
    /// Generic evaluator program used when `dynamic_evaluator` is set.
    pub evaluator_program: Option<PathBuf>,
    /// Arguments passed to the generic evaluator before the library list.
    pub evaluator_args: Vec<String>,
    /// Read timeout for a single evaluator response, in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Timeout for an evaluator to announce itself after launch, in milliseconds.
    pub startup_timeout_ms: Option<u64>,
    /// Bound on waiting for a free evaluator at the process limit, in milliseconds.
    /// `None` blocks until a worker is released.
    pub wait_timeout_ms: Option<u64>,
    /// Grace period for an evaluator to exit after `EXIT`, in milliseconds.
    pub stop_grace_ms: u64,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            process_limit: DEFAULT_PROCESS_LIMIT,
            dynamic_evaluator: false,
            evaluator_program: None,
            evaluator_args: Vec::new(),
            timeout_ms: Some(30_000),
            startup_timeout_ms: Some(10_000),
            wait_timeout_ms: None,
            stop_grace_ms: 1_000,
        }
    }
}

impl EvalOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EvalError::Config(format!("Cannot read options file {}: {}", path.display(), e))
        })?;
        let options: Self = serde_json::from_str(&contents)?;
        options.validate()?;
        Ok(options)
    }

    pub fn with_process_limit(mut self, limit: usize) -> Self {
        self.process_limit = limit;
        self
    }

    /// Enable the generic evaluator program.
    pub fn with_dynamic_evaluator(mut self, program: PathBuf, args: Vec<String>) -> Self {
        self.dynamic_evaluator = true;
        self.evaluator_program = Some(program);
        self.evaluator_args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_ms = timeout.map(duration_ms);
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout_ms = timeout.map(duration_ms);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Unparseable values are ignored and the current setting is kept.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(limit) = std::env::var("EVALCACHE_PROCESS_LIMIT")
            && let Ok(limit) = limit.trim().parse()
        {
            self.process_limit = limit;
        }

        if let Ok(flag) = std::env::var("EVALCACHE_DYNAMIC_EVALUATOR")
            && let Some(flag) = parse_flag(&flag)
        {
            self.dynamic_evaluator = flag;
        }

        if let Ok(program) = std::env::var("EVALCACHE_EVALUATOR") {
            self.evaluator_program = Some(PathBuf::from(program));
        }

        if let Ok(ms) = std::env::var("EVALCACHE_TIMEOUT_MS")
            && let Ok(ms) = ms.trim().parse::<u64>()
        {
            self.timeout_ms = (ms > 0).then_some(ms);
        }

        if let Ok(ms) = std::env::var("EVALCACHE_WAIT_TIMEOUT_MS")
            && let Ok(ms) = ms.trim().parse::<u64>()
        {
            self.wait_timeout_ms = (ms > 0).then_some(ms);
        }

        self
    }

    /// Check option consistency.
    pub fn validate(&self) -> Result<()> {
        if self.process_limit == 0 {
            return Err(EvalError::Config("process_limit must be at least 1".into()));
        }
        if self.dynamic_evaluator && self.evaluator_program.is_none() {
            return Err(EvalError::Config(
                "dynamic evaluator enabled but no evaluator program configured".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout_ms.map(Duration::from_millis)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Pool-level settings, fixed when a pool is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Limit used until the first call site supplies its own.
    pub process_limit: usize,
    /// Read timeout for evaluator responses.
    pub io_timeout: Option<Duration>,
    /// Timeout for the startup handshake.
    pub startup_timeout: Option<Duration>,
    /// Bound on waiting for a free worker; `None` waits indefinitely.
    pub wait_timeout: Option<Duration>,
    /// Grace period when stopping a worker.
    pub stop_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&EvalOptions::default())
    }
}

impl From<&EvalOptions> for PoolConfig {
    fn from(options: &EvalOptions) -> Self {
        Self {
            process_limit: options.process_limit.max(1),
            io_timeout: options.timeout(),
            startup_timeout: options.startup_timeout(),
            wait_timeout: options.wait_timeout(),
            stop_grace: options.stop_grace(),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_eval_options_defaults() {
        let options = EvalOptions::default();
        assert_eq!(options.process_limit, DEFAULT_PROCESS_LIMIT);
        assert!(!options.dynamic_evaluator);
        assert!(options.evaluator_program.is_none());
        assert_eq!(options.timeout(), Some(Duration::from_secs(30)));
        assert!(options.wait_timeout().is_none());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let options = EvalOptions::new()
            .with_process_limit(2)
            .with_dynamic_evaluator(PathBuf::from("/usr/bin/evaluator"), vec!["worker".into()])
            .with_timeout(None)
            .with_wait_timeout(Some(Duration::from_millis(500)));

        assert_eq!(options.process_limit, 2);
        assert!(options.dynamic_evaluator);
        assert_eq!(options.evaluator_args, vec!["worker"]);
        assert!(options.timeout().is_none());
        assert_eq!(options.wait_timeout(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let options = EvalOptions::new().with_process_limit(0);
        assert!(matches!(options.validate(), Err(EvalError::Config(_))));
    }

    #[test]
    fn test_validate_requires_evaluator_program() {
        let options = EvalOptions {
            dynamic_evaluator: true,
            ..Default::default()
        };
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("evaluator program"));
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "process_limit": 3, "timeout_ms": 1500 }}"#).unwrap();

        let options = EvalOptions::from_file(file.path()).unwrap();
        assert_eq!(options.process_limit, 3);
        assert_eq!(options.timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(options.stop_grace_ms, EvalOptions::default().stop_grace_ms);
    }

    #[test]
    fn test_from_file_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            EvalOptions::from_file(file.path()),
            Err(EvalError::Json(_))
        ));
    }

    #[test]
    fn test_from_file_missing() {
        let err = EvalOptions::from_file(Path::new("/nonexistent/evalcache.json")).unwrap_err();
        assert!(matches!(err, EvalError::Config(_)));
    }

    #[test]
    fn test_pool_config_from_options() {
        let options = EvalOptions::new()
            .with_process_limit(0)
            .with_wait_timeout(Some(Duration::from_secs(2)));
        let config = PoolConfig::from(&options);
        assert_eq!(config.process_limit, 1);
        assert_eq!(config.wait_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("true"), Some(true));
        assert_eq!(parse_flag(" YES "), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
