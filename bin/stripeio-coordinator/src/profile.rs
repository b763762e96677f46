//! Coordinator configuration.

use anyhow::{bail, Context, Result};
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use stripeio_common::{
    ActionType, ChunkIndex, DiskId, EcParam, EcType, LoadType, MergeScheme, RepairManner,
};

/// `test_load` accepts an integer or a float in the config.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LoadValue {
    Int(i64),
    Float(f64),
}

impl LoadValue {
    fn as_f64(&self) -> f64 {
        match *self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawChunkRepair {
    manner: RepairManner,
    chunk_index: ChunkIndex,
}

#[derive(Debug, Deserialize)]
struct RawFailureDomainRepair {
    /// -1 selects a random registered disk.
    failed_disk: i64,
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    workspace_name: String,
    ip: String,
    working_dir: PathBuf,
    worker_ip: Vec<String>,
    disk_list: Vec<Vec<DiskId>>,
    action: ActionType,
    log_file: PathBuf,
    ec_k: EcParam,
    ec_m: EcParam,
    ec_type: EcType,
    #[serde(default)]
    partition_size: usize,
    load_type: LoadType,
    test_load: LoadValue,
    #[serde(default)]
    start_at: u64,
    trace: PathBuf,
    merge_size: usize,
    merge_scheme: MergeScheme,
    #[serde(default)]
    blob_size: Option<usize>,
    #[serde(default)]
    chunk_size: Option<usize>,
    pg_num: usize,
    #[serde(default)]
    repair_chunk: Option<RawChunkRepair>,
    #[serde(default)]
    repair_failure_domain: Option<RawFailureDomainRepair>,
    #[serde(default = "default_password")]
    password: String,
}

fn default_password() -> String {
    stripeio_transport::DEFAULT_PASSWORD.to_string()
}

/// Chunk-repair action parameters.
#[derive(Clone, Copy, Debug)]
pub struct ChunkRepairProfile {
    pub manner: RepairManner,
    pub chunk_index: ChunkIndex,
}

/// Failure-domain-repair action parameters.
#[derive(Clone, Copy, Debug)]
pub struct FailureDomainRepairProfile {
    pub failed_disk: DiskId,
}

/// Validated coordinator profile.
#[derive(Clone, Debug)]
pub struct Profile {
    pub workspace_name: String,
    pub ip: String,
    /// `working_dir` from the config joined with the workspace name.
    pub working_dir: PathBuf,
    pub worker_ip: Vec<String>,
    pub disk_list: Vec<Vec<DiskId>>,
    pub action: ActionType,
    pub log_file: PathBuf,
    pub ec_k: EcParam,
    pub ec_m: EcParam,
    pub ec_type: EcType,
    pub partition_size: usize,
    pub load_type: LoadType,
    /// Stripes (ByStripe) or bytes (BySize). Zero in the config means
    /// unbounded.
    pub test_load: usize,
    pub start_at: u64,
    pub trace: PathBuf,
    pub merge_size: usize,
    pub merge_scheme: MergeScheme,
    pub blob_size: usize,
    pub chunk_size: usize,
    pub pg_num: usize,
    pub chunk_repair: Option<ChunkRepairProfile>,
    pub failure_domain_repair: Option<FailureDomainRepairProfile>,
    pub password: String,
}

impl Profile {
    pub fn parse_toml(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let raw: RawProfile = toml::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;

        let load = raw.test_load.as_f64();
        if load < 0.0 {
            bail!("test_load is negative");
        }
        let test_load = if load == 0.0 {
            usize::MAX
        } else {
            match raw.load_type {
                LoadType::ByStripe => load as usize,
                LoadType::BySize => (load * (1_u64 << 30) as f64) as usize,
            }
        };

        let degrade_stream = matches!(
            raw.merge_scheme,
            MergeScheme::IntraForDegradeRead | MergeScheme::InterForDegradeRead
        );
        let (blob_size, chunk_size) = if degrade_stream {
            let blob_size = raw
                .blob_size
                .context("blob_size is required for the degraded-read streams")?;
            let chunk_size = raw
                .chunk_size
                .context("chunk_size is required for the degraded-read streams")?;
            (blob_size, chunk_size)
        } else {
            (
                raw.blob_size.unwrap_or_default(),
                raw.chunk_size.unwrap_or_default(),
            )
        };

        let chunk_repair = match (raw.action, raw.repair_chunk) {
            (ActionType::RepairChunk, Some(rc)) => Some(ChunkRepairProfile {
                manner: rc.manner,
                chunk_index: rc.chunk_index,
            }),
            (ActionType::RepairChunk, None) => {
                bail!("[repair_chunk] section is required for RepairChunk")
            }
            _ => None,
        };
        let failure_domain_repair = match (raw.action, raw.repair_failure_domain) {
            (ActionType::RepairFailureDomain, Some(fd)) => {
                let failed_disk = if fd.failed_disk == -1 {
                    let all: Vec<DiskId> = raw.disk_list.iter().flatten().copied().collect();
                    *all.choose(&mut rand::thread_rng())
                        .context("disk_list is empty")?
                } else {
                    DiskId::try_from(fd.failed_disk).context("failed_disk out of range")?
                };
                Some(FailureDomainRepairProfile { failed_disk })
            }
            (ActionType::RepairFailureDomain, None) => {
                bail!("[repair_failure_domain] section is required for RepairFailureDomain")
            }
            _ => None,
        };

        let profile = Self {
            working_dir: raw.working_dir.join(&raw.workspace_name),
            workspace_name: raw.workspace_name,
            ip: raw.ip,
            worker_ip: raw.worker_ip,
            disk_list: raw.disk_list,
            action: raw.action,
            log_file: raw.log_file,
            ec_k: raw.ec_k,
            ec_m: raw.ec_m,
            ec_type: raw.ec_type,
            partition_size: raw.partition_size,
            load_type: raw.load_type,
            test_load,
            start_at: raw.start_at,
            trace: raw.trace,
            merge_size: raw.merge_size,
            merge_scheme: raw.merge_scheme,
            blob_size,
            chunk_size,
            pg_num: raw.pg_num,
            chunk_repair,
            failure_domain_repair,
            password: raw.password,
        };
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<()> {
        if self.worker_ip.is_empty() {
            bail!("worker_ip is empty");
        }
        if self.disk_list.is_empty() {
            bail!("disk_list is empty");
        }
        if self.disk_list.len() != self.worker_ip.len() {
            bail!(
                "disk_list has {} entries for {} workers",
                self.disk_list.len(),
                self.worker_ip.len()
            );
        }
        if self.test_load == 0 {
            bail!("test_load is 0");
        }
        if self.merge_size == 0 {
            bail!("merge_size is 0");
        }
        if self.pg_num == 0 {
            bail!("pg_num is 0");
        }
        if self.merge_scheme == MergeScheme::Partition && self.partition_size == 0 {
            bail!("partition_size is required for the Partition scheme");
        }
        if (self.ec_k + self.ec_m) as usize > self.worker_ip.len() {
            bail!(
                "ec_k + ec_m = {} exceeds the {} workers",
                self.ec_k + self.ec_m,
                self.worker_ip.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_config() -> String {
        r#"
workspace_name = "ws"
ip = "10.0.0.100"
working_dir = "/tmp/stripeio"
worker_ip = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5", "10.0.0.6"]
disk_list = [[0, 1], [2, 3], [4, 5], [6, 7], [8, 9], [10, 11]]
action = "BuildData"
log_file = "/tmp/stripeio/coord.log"
ec_k = 4
ec_m = 2
ec_type = "RS"
load_type = "ByStripe"
test_load = 3
trace = "/tmp/trace.csv"
merge_size = 4194304
merge_scheme = "Baseline"
pg_num = 8
"#
        .to_string()
    }

    fn parse(config: &str) -> Result<Profile> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.as_bytes()).unwrap();
        Profile::parse_toml(file.path())
    }

    #[test]
    fn parses_baseline_build_config() {
        let profile = parse(&base_config()).unwrap();
        assert_eq!(profile.action, ActionType::BuildData);
        assert_eq!(profile.ec_type, EcType::Rs);
        assert_eq!(profile.test_load, 3);
        assert_eq!(profile.working_dir, PathBuf::from("/tmp/stripeio/ws"));
        assert_eq!(profile.worker_ip.len(), 6);
    }

    #[test]
    fn zero_test_load_means_unbounded() {
        let config = base_config().replace("test_load = 3", "test_load = 0");
        let profile = parse(&config).unwrap();
        assert_eq!(profile.test_load, usize::MAX);
    }

    #[test]
    fn by_size_load_scales_to_gib() {
        let config = base_config()
            .replace("load_type = \"ByStripe\"", "load_type = \"BySize\"")
            .replace("test_load = 3", "test_load = 0.5");
        let profile = parse(&config).unwrap();
        assert_eq!(profile.test_load, 1 << 29);
    }

    #[test]
    fn negative_test_load_is_fatal() {
        let config = base_config().replace("test_load = 3", "test_load = -1");
        assert!(parse(&config).is_err());
    }

    #[test]
    fn ec_width_must_fit_workers() {
        let config = base_config().replace("ec_k = 4", "ec_k = 8");
        assert!(parse(&config).is_err());
    }

    #[test]
    fn repair_chunk_requires_its_section() {
        let config = base_config().replace("action = \"BuildData\"", "action = \"RepairChunk\"");
        assert!(parse(&config).is_err());

        let with_section = format!(
            "{config}\n[repair_chunk]\nmanner = \"Centralized\"\nchunk_index = 3\n"
        );
        let profile = parse(&with_section).unwrap();
        let repair = profile.chunk_repair.unwrap();
        assert_eq!(repair.manner, RepairManner::Centralized);
        assert_eq!(repair.chunk_index, 3);
    }

    #[test]
    fn degrade_stream_requires_sizes() {
        let config = base_config().replace(
            "merge_scheme = \"Baseline\"",
            "merge_scheme = \"InterForDegradeRead\"",
        );
        assert!(parse(&config).is_err());

        let with_sizes = config + "blob_size = 1048576\nchunk_size = 1048576\n";
        let profile = parse(&with_sizes).unwrap();
        assert_eq!(profile.blob_size, 1_048_576);
    }
}
