use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Holds `private.key` and the default download/cache directories.
    pub home_dir: PathBuf,
    /// Task descriptors (`<id>.task`) and partial files (`<id>.download`).
    pub download_dir: PathBuf,
    /// Scan cache file location.
    pub cache_dir: PathBuf,
    pub max_concurrent_tasks: usize,
    pub task_timeout: Duration,
    pub worker_idle_wait: Duration,
    pub user_agent: String,
    pub chunk_size: usize,
    pub progress_interval: Duration,
    pub retry_count: u32,
    pub retry_backoff: Duration,
    pub connect_timeout: Duration,
    /// Limit on each network read; a stalled body fails as a network error
    /// and the transfer resumes from the partial.
    pub read_timeout: Duration,
    /// Allowed difference between a caller-supplied size hint and a local file.
    pub size_tolerance_bytes: u64,
    pub scan_cache_ttl: Duration,
    pub include_hidden_files: bool,
    /// How long `delete` waits for an in-flight worker to notice cancellation.
    pub settle_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let home_dir = PathBuf::from(".modelhub");
        Self {
            download_dir: home_dir.join("downloads"),
            cache_dir: home_dir.join("cache"),
            home_dir,
            max_concurrent_tasks: 5,
            task_timeout: Duration::from_secs(300),
            worker_idle_wait: Duration::from_secs(1),
            user_agent: "modelhub/0.1".to_string(),
            chunk_size: 64 * 1024,
            progress_interval: Duration::from_secs(1),
            retry_count: 3,
            retry_backoff: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            size_tolerance_bytes: 1024,
            scan_cache_ttl: Duration::from_secs(300),
            include_hidden_files: false,
            settle_timeout: Duration::from_secs(5),
        }
    }
}

impl ManagerConfig {
    /// Rebase every on-disk location under `home`.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        self.download_dir = home.join("downloads");
        self.cache_dir = home.join("cache");
        self.home_dir = home;
        self
    }

    pub fn credential_file(&self) -> PathBuf {
        self.home_dir.join("private.key")
    }

    pub fn scan_cache_file(&self) -> PathBuf {
        self.cache_dir.join("model_scan_cache.json")
    }

    /// Defaults overridden by `MODELHUB_*` environment variables. Unparsable
    /// values are ignored.
    pub fn from_env() -> Self {
        let mut config = match env::var("MODELHUB_HOME") {
            Ok(home) if !home.is_empty() => ManagerConfig::default().with_home(home),
            _ => ManagerConfig::default(),
        };
        if let Ok(dir) = env::var("MODELHUB_DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }
        if let Some(value) = env_parse::<usize>("MODELHUB_MAX_TASKS") {
            config.max_concurrent_tasks = value.max(1);
        }
        if let Some(value) = env_parse::<u64>("MODELHUB_TASK_TIMEOUT_SECS") {
            config.task_timeout = Duration::from_secs(value.max(1));
        }
        if let Some(value) = env_parse::<u64>("MODELHUB_READ_TIMEOUT_SECS") {
            config.read_timeout = Duration::from_secs(value.max(1));
        }
        if let Some(value) = env_parse::<u64>("MODELHUB_SCAN_TTL_SECS") {
            config.scan_cache_ttl = Duration::from_secs(value);
        }
        if let Some(value) = env_parse::<bool>("MODELHUB_INCLUDE_HIDDEN") {
            config.include_hidden_files = value;
        }
        if let Ok(agent) = env::var("MODELHUB_USER_AGENT") {
            if !agent.trim().is_empty() {
                config.user_agent = agent;
            }
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse::<T>().ok())
}
