//! Worker configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::MutationError;

/// Tunables of the write path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Reject edges for predicates without a schema before proposing them.
    pub strict_mutations: bool,
    /// Enforce access-control value rules (permission range).
    pub acl_enabled: bool,
    /// Upper bound on concurrent index rebuilds started by one schema batch.
    pub max_rebuilds_per_batch: usize,
    /// Attempts to reload a predicate's durable schema after a failed change.
    pub schema_reload_retries: u32,
    /// Pause between schema reload attempts.
    pub schema_reload_backoff: Duration,
    /// Indexing that ran at least this long is followed by a snapshot proposal.
    pub snapshot_after_indexing: Duration,
    /// Posting-list reads slower than this are logged.
    pub slow_read_threshold: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self {
            strict_mutations: false,
            acl_enabled: false,
            max_rebuilds_per_batch: 1024,
            schema_reload_retries: 10,
            schema_reload_backoff: Duration::from_millis(10),
            snapshot_after_indexing: Duration::from_secs(10),
            slow_read_threshold: Duration::from_millis(1),
        }
    }

    /// Enables or disables strict mutations.
    pub fn strict_mutations(mut self, enabled: bool) -> Self {
        self.strict_mutations = enabled;
        self
    }

    /// Enables or disables access-control value rules.
    pub fn acl_enabled(mut self, enabled: bool) -> Self {
        self.acl_enabled = enabled;
        self
    }

    /// Sets the rebuild parallelism bound per schema batch.
    pub fn max_rebuilds_per_batch(mut self, limit: usize) -> Self {
        self.max_rebuilds_per_batch = limit;
        self
    }

    /// Sets the schema reload retry budget.
    pub fn schema_reload(mut self, retries: u32, backoff: Duration) -> Self {
        self.schema_reload_retries = retries;
        self.schema_reload_backoff = backoff;
        self
    }

    /// Sets the indexing duration after which a snapshot is proposed.
    pub fn snapshot_after_indexing(mut self, after: Duration) -> Self {
        self.snapshot_after_indexing = after;
        self
    }

    /// Sets the slow read logging threshold.
    pub fn slow_read_threshold(mut self, threshold: Duration) -> Self {
        self.slow_read_threshold = threshold;
        self
    }

    /// Checks that every bound is usable.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.max_rebuilds_per_batch == 0 {
            return Err(OptionsError::Invalid {
                field: "max_rebuilds_per_batch",
                reason: "must be at least 1",
            });
        }
        if self.schema_reload_retries == 0 {
            return Err(OptionsError::Invalid {
                field: "schema_reload_retries",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Parses options from TOML; missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, OptionsError> {
        let raw: RawOptions =
            toml::from_str(contents).map_err(|source| OptionsError::Parse { path: None, source })?;
        let opts = raw.apply(Self::new());
        opts.validate()?;
        Ok(opts)
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| OptionsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawOptions = toml::from_str(&contents).map_err(|source| OptionsError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        let opts = raw.apply(Self::new());
        opts.validate()?;
        Ok(opts)
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RawOptions {
    strict_mutations: Option<bool>,
    acl_enabled: Option<bool>,
    max_rebuilds_per_batch: Option<usize>,
    schema_reload_retries: Option<u32>,
    schema_reload_backoff_ms: Option<u64>,
    snapshot_after_indexing_ms: Option<u64>,
    slow_read_threshold_ms: Option<u64>,
}

impl RawOptions {
    fn apply(self, mut opts: WorkerOptions) -> WorkerOptions {
        if let Some(v) = self.strict_mutations {
            opts.strict_mutations = v;
        }
        if let Some(v) = self.acl_enabled {
            opts.acl_enabled = v;
        }
        if let Some(v) = self.max_rebuilds_per_batch {
            opts.max_rebuilds_per_batch = v;
        }
        if let Some(v) = self.schema_reload_retries {
            opts.schema_reload_retries = v;
        }
        if let Some(ms) = self.schema_reload_backoff_ms {
            opts.schema_reload_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = self.snapshot_after_indexing_ms {
            opts.snapshot_after_indexing = Duration::from_millis(ms);
        }
        if let Some(ms) = self.slow_read_threshold_ms {
            opts.slow_read_threshold = Duration::from_millis(ms);
        }
        opts
    }
}

/// Errors loading or validating [`WorkerOptions`].
#[derive(Debug, Error)]
pub enum OptionsError {
    /// Options file could not be read.
    #[error("failed to read worker options {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Options were not valid TOML for this schema.
    #[error("failed to parse worker options{}: {source}", display_path(.path))]
    Parse {
        /// File path, if read from a file.
        path: Option<PathBuf>,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid worker option {field}: {reason}")]
    Invalid {
        /// Option name.
        field: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },
}

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(" {}", p.display()))
        .unwrap_or_default()
}

impl From<OptionsError> for MutationError {
    fn from(err: OptionsError) -> Self {
        MutationError::Config(err.to_string())
    }
}
