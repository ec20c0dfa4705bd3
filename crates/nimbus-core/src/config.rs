//! Configuration for NimbusFS.
//!
//! Typed structs mapping to the YAML configuration file, with
//! defaults, range validation, and the XDG path helpers used to place
//! the config file, the per-mount cache, and the per-account auth
//! token file.
//!
//! YAML keys are camelCase (`realtime.pollingOnly`,
//! `metadataQueue.workers`, ...).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Application directory name under XDG config/cache roots.
pub const APP_DIR: &str = "nimbusfs";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub realtime: RealtimeConfig,
    pub hydration: HydrationConfig,
    pub metadata_queue: MetadataQueueConfig,
    pub cache: CacheConfig,
    /// Seconds the mount startup may take before giving up.
    /// 120 is the recommended value in containers.
    pub mount_timeout: u64,
    pub overlay: OverlayConfig,
    /// Policy applied when local and remote edits collide.
    pub conflict_policy: ConflictPolicy,
}

/// Realtime change-notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RealtimeConfig {
    /// Enable the realtime transport at all.
    pub enabled: bool,
    /// Force polling even when realtime is available.
    pub polling_only: bool,
    /// Delta polling interval (seconds) when realtime is unavailable
    /// or healthy-idle. Valid range 30–7200.
    pub fallback_interval_seconds: u64,
}

/// Hydration worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HydrationConfig {
    /// Concurrent downloads, 1–64.
    pub workers: usize,
    /// Pending request bound, 1–100000.
    pub queue_size: usize,
    /// Seconds an opener waits for hydration before EIO.
    pub open_timeout_seconds: u64,
}

/// Metadata fetch queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetadataQueueConfig {
    /// Concurrent metadata fetches, 1–64.
    pub workers: usize,
    /// Bound of the user-facing queue.
    pub high_priority_size: usize,
    /// Bound of the speculative prefetch queue; overflow drops oldest.
    pub low_priority_size: usize,
}

/// Content cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Soft cap on cached content bytes, in MiB. 0 disables eviction.
    pub max_size_mib: u64,
}

/// Virtual-file overlay behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OverlayConfig {
    pub default_policy: OverlayPolicy,
}

/// How virtual files interact with same-named real items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverlayPolicy {
    /// A real item with the same name shadows the virtual file.
    #[default]
    LocalWins,
    /// The virtual file shadows any real item.
    RemoteWins,
    /// Both are listed; the virtual file wins on open.
    Merged,
}

/// Conflict resolution policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Compare mtimes; the newer side wins, the loser is discarded.
    LastWriterWins,
    /// Keep the remote under the original name and the local bytes as
    /// a conflict copy.
    #[default]
    KeepBoth,
    /// Local bytes win unconditionally.
    KeepLocal,
    /// Remote bytes win unconditionally.
    KeepRemote,
    /// Leave the item in conflict until a user-driven resolution.
    Prompt,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            polling_only: false,
            fallback_interval_seconds: 1800,
        }
    }
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 500,
            open_timeout_seconds: 120,
        }
    }
}

impl Default for MetadataQueueConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            high_priority_size: 100,
            low_priority_size: 1000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_size_mib: 0 }
    }
}

impl Config {
    /// Default mount timeout (seconds).
    pub const DEFAULT_MOUNT_TIMEOUT: u64 = 60;
}

// `Config::default()` derives; mount_timeout needs its non-zero value.
impl Config {
    /// Construct the built-in default configuration.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            mount_timeout: Self::DEFAULT_MOUNT_TIMEOUT,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and paths
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        if config.mount_timeout == 0 {
            config.mount_timeout = Self::DEFAULT_MOUNT_TIMEOUT;
        }
        Ok(config)
    }

    /// Try to load from `path`; fall back to the builtin defaults.
    #[must_use]
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|_| Self::builtin())
    }

    /// Default location of the configuration file:
    /// `$XDG_CONFIG_HOME/nimbusfs/config.yaml`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join(APP_DIR)
            .join("config.yaml")
    }

    /// Root of all cache state: `$XDG_CACHE_HOME/nimbusfs`.
    #[must_use]
    pub fn cache_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("~/.cache"))
            .join(APP_DIR)
    }

    /// Per-mount cache directory, keyed by a hash of the mount point
    /// so several mounts can share the cache root without colliding.
    #[must_use]
    pub fn mount_cache_dir(mount_point: &Path) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(mount_point.to_string_lossy().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self::cache_root().join(&digest[..16])
    }

    /// Per-account auth directory, keyed by the SHA-256 of the
    /// lowercased account email.
    #[must_use]
    pub fn account_dir(email: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(email.to_lowercase().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self::cache_root().join("accounts").join(digest)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"hydration.workers"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    #[must_use]
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let mut check_range = |field: &str, value: u64, lo: u64, hi: u64| {
            if value < lo || value > hi {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: format!("must be between {lo} and {hi}, got {value}"),
                });
            }
        };

        check_range(
            "realtime.fallbackIntervalSeconds",
            self.realtime.fallback_interval_seconds,
            30,
            7200,
        );
        check_range("hydration.workers", self.hydration.workers as u64, 1, 64);
        check_range(
            "hydration.queueSize",
            self.hydration.queue_size as u64,
            1,
            100_000,
        );
        check_range(
            "metadataQueue.workers",
            self.metadata_queue.workers as u64,
            1,
            64,
        );
        check_range(
            "metadataQueue.highPrioritySize",
            self.metadata_queue.high_priority_size as u64,
            1,
            100_000,
        );
        check_range(
            "metadataQueue.lowPrioritySize",
            self.metadata_queue.low_priority_size as u64,
            1,
            1_000_000,
        );

        if self.mount_timeout == 0 {
            errors.push(ValidationError {
                field: "mountTimeout".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
