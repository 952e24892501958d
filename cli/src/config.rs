use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use coop_core::models::{Collection, normalize_request_key, validate_bucket_name};

pub struct Config {
    pub db_path: PathBuf,
    pub cache_path: PathBuf,
    pub data_dir: PathBuf,
    pub worker: WorkerConfig,
}

/// One background-sync registration: events for `tag` replay unsent records
/// of `collection` to `endpoint`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SyncTargetConfig {
    pub tag: String,
    pub collection: Collection,
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Upstream origin serving the dashboard and its API.
    pub origin: String,
    /// Versioned name of the current cache bucket. Bump it on every release.
    pub cache_name: String,
    /// Static assets fetched and cached at install.
    pub manifest: Vec<String>,
    /// Document served to a failed navigation.
    pub offline_page: String,
    /// URL a notification click focuses or opens.
    pub root_url: String,
    pub fetch_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// How often pending sync registrations check whether the origin is back.
    pub connectivity_interval_secs: u64,
    pub sync: Vec<SyncTargetConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: "http://127.0.0.1:3000".to_string(),
            cache_name: "coop-farm-v1".to_string(),
            manifest: vec![
                "/".to_string(),
                "/manifest.json".to_string(),
                "/icons/icon-192x192.png".to_string(),
                "/icons/icon-512x512.png".to_string(),
            ],
            offline_page: "/".to_string(),
            root_url: "/".to_string(),
            fetch_timeout_secs: 10,
            connect_timeout_secs: 5,
            connectivity_interval_secs: 15,
            sync: vec![SyncTargetConfig {
                tag: "sync-daily-records".to_string(),
                collection: Collection::DailyRecords,
                endpoint: "/api/daily-records".to_string(),
            }],
        }
    }
}

impl WorkerConfig {
    /// Parse a YAML document; missing keys keep their defaults.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: WorkerConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.origin.starts_with("http://") && !self.origin.starts_with("https://") {
            bail!("origin must be an http(s) URL, got '{}'", self.origin);
        }
        validate_bucket_name(&self.cache_name)?;
        for asset in &self.manifest {
            normalize_request_key(asset)
                .with_context(|| format!("invalid manifest entry '{asset}'"))?;
        }
        normalize_request_key(&self.offline_page).context("invalid offline_page")?;
        if self.fetch_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            bail!("timeouts must be at least one second");
        }
        if self.connectivity_interval_secs == 0 {
            bail!("connectivity_interval_secs must be at least one second");
        }
        for (i, target) in self.sync.iter().enumerate() {
            if target.tag.trim().is_empty() {
                bail!("sync target {i} has an empty tag");
            }
            if !target.endpoint.starts_with('/') {
                bail!(
                    "sync endpoint for '{}' must be a path starting with '/'",
                    target.tag
                );
            }
            if self.sync[..i].iter().any(|t| t.tag == target.tag) {
                bail!("sync tag '{}' is registered twice", target.tag);
            }
        }
        Ok(())
    }
}

impl Config {
    /// Resolve directories and load the worker configuration.
    ///
    /// Search order for the YAML file:
    /// 1. Explicit path if provided
    /// 2. ./coop.yaml (current directory)
    /// 3. config.yaml in the platform config directory
    ///
    /// With no file, every setting keeps its default.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "coop").context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let path = match explicit_path {
            Some(p) if p.exists() => Some(p.to_path_buf()),
            Some(p) => bail!("Config file not found: {}", p.display()),
            None => find_config_file(proj_dirs.config_dir()),
        };

        let worker = match path {
            Some(p) => {
                let contents = std::fs::read_to_string(&p)
                    .with_context(|| format!("Failed to read config file {}", p.display()))?;
                let worker = WorkerConfig::from_yaml(&contents)
                    .with_context(|| format!("Invalid config file {}", p.display()))?;
                tracing::debug!(path = %p.display(), "loaded config");
                worker
            }
            None => WorkerConfig::default(),
        };

        Ok(Config {
            db_path: data_dir.join("coop.db"),
            cache_path: data_dir.join("cache.db"),
            data_dir,
            worker,
        })
    }

    /// Load the API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)` where `newly_created` is true when a
    /// fresh key was just generated (first run).
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join("api_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                validate_api_key(&key)
                    .with_context(|| format!("Invalid API key in {}", path.display()))?;
                return Ok((key, false));
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &key).context("Failed to write API key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set API key file permissions")?;
        }
        tracing::info!(path = %path.display(), "generated new API key");
        Ok((key, true))
    }
}

/// Shortest API key accepted from the key file.
const MIN_API_KEY_LEN: usize = 16;

/// Keys go into an HTTP header, so they must be printable ASCII without spaces.
fn validate_api_key(key: &str) -> Result<()> {
    if !key.chars().all(|c| c.is_ascii_graphic()) {
        bail!("API key must be printable ASCII without whitespace");
    }
    if key.len() < MIN_API_KEY_LEN {
        bail!("API key must be at least {MIN_API_KEY_LEN} characters");
    }
    Ok(())
}

/// The first and last four characters of a key, for logs.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 12 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

fn find_config_file(config_dir: &Path) -> Option<PathBuf> {
    let local = PathBuf::from("coop.yaml");
    if local.exists() {
        return Some(local);
    }
    let global = config_dir.join("config.yaml");
    global.exists().then_some(global)
}
