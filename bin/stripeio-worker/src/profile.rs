//! Worker configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct RawProfile {
    workspace_name: String,
    working_dir: PathBuf,
    create_new: bool,
    #[serde(default = "default_ip")]
    ip: String,
    /// 0 means one thread per hardware core.
    #[serde(default)]
    num_threads: usize,
    do_block: bool,
    /// Cache budget in MB; 0 disables the cache layer.
    #[serde(default)]
    cache_size: usize,
    /// Values above this size bypass the cache.
    #[serde(default)]
    large_chunk_size: usize,
    #[serde(default = "default_password")]
    password: String,
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_password() -> String {
    stripeio_transport::DEFAULT_PASSWORD.to_string()
}

/// Validated worker profile.
#[derive(Clone, Debug)]
pub struct Profile {
    pub workspace_name: String,
    /// `working_dir` from the config joined with the workspace name.
    pub working_dir: PathBuf,
    pub create_new: bool,
    pub ip: String,
    pub num_threads: usize,
    pub do_block: bool,
    /// Cache budget in bytes.
    pub cache_size: usize,
    pub large_chunk_size: usize,
    pub password: String,
}

impl Profile {
    pub fn parse_toml(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let raw: RawProfile = toml::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;

        let num_threads = if raw.num_threads == 0 {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            raw.num_threads
        };
        Ok(Self {
            working_dir: raw.working_dir.join(&raw.workspace_name),
            workspace_name: raw.workspace_name,
            create_new: raw.create_new,
            ip: raw.ip,
            num_threads,
            do_block: raw.do_block,
            cache_size: raw.cache_size << 20,
            large_chunk_size: raw.large_chunk_size,
            password: raw.password,
        })
    }

    /// Create the working directory, clearing it first when `create_new`
    /// is set.
    pub fn prepare_working_dir(&self) -> Result<()> {
        if self.working_dir.exists() {
            if self.create_new {
                for entry in std::fs::read_dir(&self.working_dir)? {
                    let path = entry?.path();
                    if path.is_dir() {
                        std::fs::remove_dir_all(&path)?;
                    } else {
                        std::fs::remove_file(&path)?;
                    }
                }
            }
        } else {
            std::fs::create_dir_all(&self.working_dir)?;
        }
        Ok(())
    }
}
