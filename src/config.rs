use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Tunables persisted in `<work>/etc/config.json`.
///
/// 字段都有保守默认值；文件不存在时会用默认值创建 — every field has a
/// conservative default; the file is created with defaults when missing.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Queue length above which the ingest side slows scans and the
    /// dispatcher emits a warning event.
    pub danger_no_of_jobs: usize,
    /// Seconds a host waits after a retryable delivery failure.
    pub default_retry_interval: u64,
    /// Seconds one unit of `archive_time` is worth when computing the
    /// retention epoch of an archive bucket.
    pub archive_unit: u64,
    /// Seconds the ingest side sleeps when the staging filesystem is full.
    pub disk_full_rescan_secs: u64,
    /// Base pacing between two scans of the same directory.
    pub scan_interval_ms: u64,
    /// Per-scan ceiling applied when a directory entry does not set its own
    /// `max files` / `max size` options.
    pub max_copied_files: usize,
    pub max_copied_file_size: u64,
    /// Bounded wait for the second pipe of the queue-list handshake.
    pub queue_handshake_timeout_secs: u64,
    /// Default transfer block size when the host does not override it.
    pub default_block_size: usize,
    /// Default transfer timeout in seconds.
    pub default_transfer_timeout: u64,
    pub version: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            danger_no_of_jobs: 4096,
            default_retry_interval: 60,
            archive_unit: 86400,
            disk_full_rescan_secs: 60,
            scan_interval_ms: 1000,
            max_copied_files: 100,
            max_copied_file_size: 1024 * 1024 * 1024,
            queue_handshake_timeout_secs: 5,
            default_block_size: 64 * 1024,
            default_transfer_timeout: 120,
            version: Some(1),
        }
    }
}

impl Config {
    /// Load `<work>/etc/config.json`, creating it with defaults on first run.
    pub fn init(work: &WorkDir) -> anyhow::Result<Config> {
        use anyhow::Context as _;
        let path = work.config_file();
        if path.exists() {
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("读取配置失败: {}", path.display()))?;
            let cfg: Config = serde_json::from_str(&data)
                .with_context(|| format!("配置不是合法 JSON: {}", path.display()))?;
            Ok(cfg)
        } else {
            let cfg = Config::default();
            cfg.save_to(&path)?;
            Ok(cfg)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context as _;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("无法创建配置目录: {}", parent.display()))?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)
            .with_context(|| format!("无法写入配置: {}", path.display()))?;
        Ok(())
    }
}

/// Canonical work-directory layout. All daemons, workers and tools agree on
/// these paths; nothing outside the work dir is touched.
///
/// ```text
/// etc/DIR_CONFIG             rule source (external parser input)
/// etc/HOST_CONFIG            host overrides (JSON)
/// etc/config.json            engine tunables
/// fifodir/amg_data           parsed rule database (binary, offset layout)
/// fifodir/msg.queue          persisted dispatch queue (JSON lines)
/// fifodir/jid_number         monotonic unique counter
/// fifodir/current_msg_list   authoritative message-id list after reread
/// fifodir/*.fifo             command/handshake pipes
/// fifodir/{fsa,fra,msa,jid}  shared mmap regions
/// files/outgoing/<job>/<dir>/<msgname>/   staging directories
/// files/store/<scope>/       duplicate-check storage
/// archive/<host>/<user>/<job>/<YYYYMMDDHH>/
/// log/                       tracing + fan-out logs
/// ```
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// Resolve the work dir: explicit flag first, then `DP_WORK_DIR`, then
    /// `~/.distpilot` as the teacher-of-last-resort fallback.
    pub fn resolve(flag: Option<PathBuf>) -> anyhow::Result<WorkDir> {
        let root = match flag {
            Some(p) => p,
            None => match std::env::var_os("DP_WORK_DIR") {
                Some(v) => PathBuf::from(v),
                None => {
                    let home = dirs::home_dir()
                        .ok_or_else(|| anyhow::anyhow!("无法定位 home 目录，请指定 --work-dir"))?;
                    home.join(".distpilot")
                }
            },
        };
        Ok(WorkDir { root })
    }

    pub fn at(root: impl Into<PathBuf>) -> WorkDir {
        WorkDir { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create every directory of the layout. Idempotent.
    pub fn ensure_layout(&self) -> anyhow::Result<()> {
        use anyhow::Context as _;
        for d in [
            self.etc_dir(),
            self.fifo_dir(),
            self.outgoing_dir(),
            self.store_dir(),
            self.archive_dir(),
            self.log_dir(),
        ] {
            std::fs::create_dir_all(&d)
                .with_context(|| format!("无法创建工作目录: {}", d.display()))?;
        }
        Ok(())
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.root.join("etc")
    }
    pub fn fifo_dir(&self) -> PathBuf {
        self.root.join("fifodir")
    }
    pub fn outgoing_dir(&self) -> PathBuf {
        self.root.join("files").join("outgoing")
    }
    pub fn store_dir(&self) -> PathBuf {
        self.root.join("files").join("store")
    }
    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }
    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn config_file(&self) -> PathBuf {
        self.etc_dir().join("config.json")
    }
    pub fn dir_config_file(&self) -> PathBuf {
        self.etc_dir().join("DIR_CONFIG")
    }
    pub fn host_config_file(&self) -> PathBuf {
        self.etc_dir().join("HOST_CONFIG")
    }
    pub fn rename_rule_file(&self) -> PathBuf {
        self.etc_dir().join("rename.rule")
    }

    pub fn amg_data_file(&self) -> PathBuf {
        self.fifo_dir().join("amg_data")
    }
    pub fn msg_queue_file(&self) -> PathBuf {
        self.fifo_dir().join("msg.queue")
    }
    pub fn jid_number_file(&self) -> PathBuf {
        self.fifo_dir().join("jid_number")
    }
    pub fn current_msg_list_file(&self) -> PathBuf {
        self.fifo_dir().join("current_msg_list")
    }
    pub fn dup_db_file(&self) -> PathBuf {
        self.fifo_dir().join("dupcheck.db")
    }

    pub fn fsa_file(&self) -> PathBuf {
        self.fifo_dir().join("fsa")
    }
    pub fn fra_file(&self) -> PathBuf {
        self.fifo_dir().join("fra")
    }
    pub fn msa_file(&self) -> PathBuf {
        self.fifo_dir().join("msa")
    }
    pub fn jid_file(&self) -> PathBuf {
        self.fifo_dir().join("jid")
    }

    pub fn msg_fifo(&self) -> PathBuf {
        self.fifo_dir().join("msg.fifo")
    }
    pub fn fd_cmd_fifo(&self) -> PathBuf {
        self.fifo_dir().join("fd_cmd.fifo")
    }
    pub fn fd_wake_up_fifo(&self) -> PathBuf {
        self.fifo_dir().join("fd_wake_up.fifo")
    }
    pub fn sf_fin_fifo(&self) -> PathBuf {
        self.fifo_dir().join("sf_fin.fifo")
    }
    pub fn queue_list_ready_fifo(&self) -> PathBuf {
        self.fifo_dir().join("queue_list_ready.fifo")
    }
    pub fn queue_list_done_fifo(&self) -> PathBuf {
        self.fifo_dir().join("queue_list_done.fifo")
    }

    /// Staging directory for one message.
    pub fn staging_dir(&self, msg_name: &str) -> PathBuf {
        self.outgoing_dir().join(msg_name)
    }
}
