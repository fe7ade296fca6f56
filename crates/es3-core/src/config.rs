use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Hard floor for the segment size. S3 refuses multipart parts smaller than
/// 5 MiB; 6 MiB leaves headroom for the compressor to overshoot a block.
pub const MIN_SEGMENT_SIZE: u64 = 6 * 1024 * 1024;

/// Hard cap on segments held in memory at once.
pub const MAX_SEGMENTS_IN_FLIGHT: usize = 200;

/// Global configuration for the es3 engine.
///
/// Loaded from the first of: `--config` path, `$ES3_CONFIG`, `~/.es3cfg`,
/// `/conf/es3cfg`. CLI flags override file values; credentials additionally
/// fall back to `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`. Zero for any
/// tuning knob means autodetect (see `normalize`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Es3Config {
    /// S3 API access key.
    pub access_key: String,
    /// S3 API secret key.
    pub secret_key: String,
    /// Use HTTPS for all requests.
    pub use_ssl: bool,
    /// Host(:port) of an S3-compatible endpoint. Empty means AWS, with the
    /// host derived from the bucket's region.
    pub endpoint: String,
    /// GZIP-compress uploads above the block threshold.
    pub compression: bool,
    /// Directory for compressor blocks and compressed download bodies.
    pub scratch_dir: PathBuf,
    /// Number of transfer (unbound) worker threads.
    pub thread_num: usize,
    /// Number of filesystem reader/writer threads.
    pub reader_threads: usize,
    /// Number of compressor threads.
    pub compressor_threads: usize,
    /// Segment size in bytes.
    pub segment_size: u64,
    /// Maximum number of segments held in memory at once.
    pub segments_in_flight: usize,
}

impl Default for Es3Config {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            use_ssl: false,
            endpoint: String::new(),
            compression: true,
            scratch_dir: std::env::temp_dir(),
            thread_num: 0,
            reader_threads: 0,
            compressor_threads: 0,
            segment_size: 0,
            segments_in_flight: 0,
        }
    }
}

impl Es3Config {
    /// Replaces autodetect zeros with CPU-derived defaults and clamps the
    /// segment knobs into their hard bounds.
    pub fn normalize(&mut self) {
        let cpus = num_cpus::get();
        if self.thread_num == 0 {
            self.thread_num = cpus * 6 + 40;
        }
        if self.reader_threads == 0 {
            self.reader_threads = cpus * 2 + 2;
        }
        if self.compressor_threads == 0 {
            self.compressor_threads = cpus + 2;
        }
        if self.segment_size < MIN_SEGMENT_SIZE {
            self.segment_size = MIN_SEGMENT_SIZE;
        }
        if self.segments_in_flight == 0 {
            self.segments_in_flight = 40;
        } else if self.segments_in_flight > MAX_SEGMENTS_IN_FLIGHT {
            self.segments_in_flight = MAX_SEGMENTS_IN_FLIGHT;
        }
    }

    /// Fills empty credentials from the AWS environment variables.
    pub fn apply_env_credentials(&mut self) {
        if self.access_key.is_empty() {
            if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
                self.access_key = key;
            }
        }
        if self.secret_key.is_empty() {
            if let Ok(key) = std::env::var("AWS_SECRET_ACCESS_KEY") {
                self.secret_key = key;
            }
        }
    }
}

/// Returns the config file to use, honoring the resolution order.
/// `explicit` is the `--config` value, which always wins when set.
pub fn resolve_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(env_path) = std::env::var("ES3_CONFIG") {
        if !env_path.is_empty() {
            return Some(PathBuf::from(env_path));
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        let candidate = Path::new(&home).join(".es3cfg");
        if candidate.exists() {
            return Some(candidate);
        }
    }
    let fallback = Path::new("/conf/es3cfg");
    if fallback.exists() {
        return Some(fallback.to_path_buf());
    }
    None
}

/// Loads a config file; a missing resolution result yields the defaults.
pub fn load(explicit: Option<&Path>) -> Result<Es3Config> {
    let Some(path) = resolve_config_file(explicit) else {
        return Ok(Es3Config::default());
    };
    let data = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let cfg: Es3Config = toml::from_str(&data)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(cfg)
}
