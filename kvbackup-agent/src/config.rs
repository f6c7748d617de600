use kvbackup_common::documents::{BackupSpec, StorageType};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::upload::DEFAULT_CHUNK_SIZE;

const MIB: usize = 1024 * 1024;
/// ABS rejects blocks above this size.
const MAX_CHUNK_SIZE_MIB: usize = 4000;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_min_backup_interval_secs")]
    pub min_backup_interval_secs: u64,
    #[serde(default = "default_chunk_size_mib")]
    pub chunk_size_mib: usize,
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default, rename = "backup")]
    pub backups: Vec<BackupSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_min_backup_interval_secs() -> u64 {
    10
}

fn default_chunk_size_mib() -> usize {
    DEFAULT_CHUNK_SIZE / MIB
}

fn default_cycle_timeout_secs() -> u64 {
    3600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            min_backup_interval_secs: default_min_backup_interval_secs(),
            chunk_size_mib: default_chunk_size_mib(),
            cycle_timeout_secs: default_cycle_timeout_secs(),
            retry: RetryConfig::default(),
            backups: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: AgentConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.min_backup_interval_secs == 0 {
            anyhow::bail!("min_backup_interval_secs must be greater than zero");
        }
        if self.chunk_size_mib == 0 || self.chunk_size_mib > MAX_CHUNK_SIZE_MIB {
            anyhow::bail!("chunk_size_mib must be between 1 and {}", MAX_CHUNK_SIZE_MIB);
        }
        if self.cycle_timeout_secs == 0 {
            anyhow::bail!("cycle_timeout_secs must be greater than zero");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            anyhow::bail!("retry.initial_backoff_ms must not exceed retry.max_backoff_ms");
        }

        let mut names = HashSet::new();
        for spec in &self.backups {
            if spec.name.is_empty() {
                anyhow::bail!("backup name must not be empty");
            }
            if !names.insert(spec.name.as_str()) {
                anyhow::bail!("duplicate backup name: {}", spec.name);
            }
            // Unknown storage types are reported per backup at dispatch, so
            // only sections for known types are checked here.
            if let Ok(StorageType::Directory) = spec.storage_type.parse::<StorageType>() {
                if let Some(dir) = &spec.directory {
                    if !dir.path.is_absolute() {
                        anyhow::bail!(
                            "backup '{}': directory path must be absolute: {}",
                            spec.name,
                            dir.path.display()
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size_mib * MIB
    }

    pub fn min_backup_interval(&self) -> Duration {
        Duration::from_secs(self.min_backup_interval_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }
}
