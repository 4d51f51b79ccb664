//! Run configuration: built-in defaults, then an optional YAML file, then
//! `CIRCWATCH_*` environment variables, then whatever the caller layers on top.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use circwatch_storage::{ExistingFilePolicy, PersistenceMode, DEFAULT_MAX_FILENAME_CHARS};
use serde::{Deserialize, Serialize};

use crate::SyncError;

pub const DEFAULT_LISTING_URL: &str =
    "https://www.sebi.gov.in/sebiweb/home/HomeAction.do?doListing=yes&sid=1&ssid=7&smid=0";
pub const CONFIG_PATH_ENV: &str = "CIRCWATCH_CONFIG";

/// What to do with a listing entry whose title is already catalogued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KnownTitlePolicy {
    /// Skip before any detail-page load.
    #[default]
    Skip,
    /// Re-resolve and re-download, without adding a catalog row.
    Refresh,
}

impl FromStr for KnownTitlePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(KnownTitlePolicy::Skip),
            "refresh" => Ok(KnownTitlePolicy::Refresh),
            other => Err(format!("unknown known-title policy `{other}`")),
        }
    }
}

/// How listing and detail pages are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Renderer {
    /// Headless Chromium; falls back to `Http` when no browser can be started.
    #[default]
    Browser,
    /// Plain document fetches.
    Http,
}

impl FromStr for Renderer {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "browser" | "chromium" => Ok(Renderer::Browser),
            "http" => Ok(Renderer::Http),
            other => Err(format!("unknown renderer `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncConfig {
    pub listing_url: String,
    pub max_entries: usize,
    pub mode: PersistenceMode,
    pub catalog_path: PathBuf,
    pub new_entries_path: PathBuf,
    pub download_dir: PathBuf,
    pub download: bool,
    pub known_titles: KnownTitlePolicy,
    pub existing_files: ExistingFilePolicy,
    pub renderer: Renderer,
    pub browser_executable: Option<PathBuf>,
    pub page_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub max_filename_chars: usize,
    pub frame_depth: usize,
    pub source_commit: Option<String>,
    pub scheduler_cron: String,
}

/// Partial configuration. Later layers win field by field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverlay {
    pub listing_url: Option<String>,
    pub max_entries: Option<usize>,
    pub mode: Option<PersistenceMode>,
    pub catalog_path: Option<PathBuf>,
    pub new_entries_path: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
    pub download: Option<bool>,
    pub known_titles: Option<KnownTitlePolicy>,
    pub existing_files: Option<ExistingFilePolicy>,
    pub renderer: Option<Renderer>,
    pub browser_executable: Option<PathBuf>,
    pub page_timeout_secs: Option<u64>,
    pub http_timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
    pub max_filename_chars: Option<usize>,
    pub frame_depth: Option<usize>,
    pub source_commit: Option<String>,
    pub scheduler_cron: Option<String>,
}

macro_rules! layer {
    ($base:ident, $top:ident, $($field:ident),+ $(,)?) => {
        ConfigOverlay {
            $($field: $top.$field.or($base.$field),)+
        }
    };
}

impl ConfigOverlay {
    pub fn from_yaml_file(path: &Path) -> Result<Self, SyncError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("reading {}: {e}", path.display())))?;
        serde_yaml::from_str(&text)
            .map_err(|e| SyncError::Config(format!("parsing {}: {e}", path.display())))
    }

    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Ok(Self {
            listing_url: var("CIRCWATCH_LISTING_URL"),
            max_entries: parse_var(&var, "CIRCWATCH_MAX_ENTRIES")?,
            mode: parse_var(&var, "CIRCWATCH_MODE")?,
            catalog_path: var("CIRCWATCH_CATALOG_PATH").map(PathBuf::from),
            new_entries_path: var("CIRCWATCH_NEW_ENTRIES_PATH").map(PathBuf::from),
            download_dir: var("CIRCWATCH_DOWNLOAD_DIR").map(PathBuf::from),
            download: var("CIRCWATCH_DOWNLOAD").map(|v| parse_flag(&v)),
            known_titles: parse_var(&var, "CIRCWATCH_KNOWN_TITLES")?,
            existing_files: parse_var(&var, "CIRCWATCH_EXISTING_FILES")?,
            renderer: parse_var(&var, "CIRCWATCH_RENDERER")?,
            browser_executable: var("CIRCWATCH_BROWSER_EXECUTABLE").map(PathBuf::from),
            page_timeout_secs: parse_var(&var, "CIRCWATCH_PAGE_TIMEOUT_SECS")?,
            http_timeout_secs: parse_var(&var, "CIRCWATCH_HTTP_TIMEOUT_SECS")?,
            user_agent: var("CIRCWATCH_USER_AGENT"),
            max_filename_chars: parse_var(&var, "CIRCWATCH_MAX_FILENAME_CHARS")?,
            frame_depth: parse_var(&var, "CIRCWATCH_FRAME_DEPTH")?,
            source_commit: var("CIRCWATCH_SOURCE_COMMIT").or_else(|| var("GITHUB_SHA")),
            scheduler_cron: var("CIRCWATCH_SCHEDULER_CRON"),
        })
    }

    /// `top` wins wherever it sets a field.
    pub fn layered(self, top: ConfigOverlay) -> ConfigOverlay {
        let base = self;
        layer!(
            base,
            top,
            listing_url,
            max_entries,
            mode,
            catalog_path,
            new_entries_path,
            download_dir,
            download,
            known_titles,
            existing_files,
            renderer,
            browser_executable,
            page_timeout_secs,
            http_timeout_secs,
            user_agent,
            max_filename_chars,
            frame_depth,
            source_commit,
            scheduler_cron,
        )
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, SyncError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| SyncError::Config(format!("{key}={raw}: {e}")))
        })
        .transpose()
}

impl SyncConfig {
    /// Defaults, then the YAML file at `config_path` (or `$CIRCWATCH_CONFIG`),
    /// then the environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self, SyncError> {
        Self::from_overlay(Self::load_overlay(config_path)?)
    }

    pub fn load_overlay(config_path: Option<&Path>) -> Result<ConfigOverlay, SyncError> {
        let file_path = config_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));
        let file = match file_path {
            Some(path) => ConfigOverlay::from_yaml_file(&path)?,
            None => ConfigOverlay::default(),
        };
        Ok(file.layered(ConfigOverlay::from_env()?))
    }

    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_overlay(ConfigOverlay::from_env()?)
    }

    pub fn from_overlay(overlay: ConfigOverlay) -> Result<Self, SyncError> {
        let mode = overlay.mode.unwrap_or_default();
        let default_catalog = match mode {
            PersistenceMode::SnapshotMerge => "sebi_master.csv",
            PersistenceMode::AppendOnly => "sebi_circulars_last10_with_pdfs.csv",
        };
        let config = Self {
            listing_url: overlay
                .listing_url
                .unwrap_or_else(|| DEFAULT_LISTING_URL.to_string()),
            max_entries: overlay.max_entries.unwrap_or(10),
            mode,
            catalog_path: overlay
                .catalog_path
                .unwrap_or_else(|| PathBuf::from(default_catalog)),
            new_entries_path: overlay
                .new_entries_path
                .unwrap_or_else(|| PathBuf::from("new_entries.json")),
            download_dir: overlay.download_dir.unwrap_or_else(|| PathBuf::from("pdfs")),
            download: overlay
                .download
                .unwrap_or(mode == PersistenceMode::AppendOnly),
            known_titles: overlay.known_titles.unwrap_or_default(),
            existing_files: overlay.existing_files.unwrap_or_default(),
            renderer: overlay.renderer.unwrap_or_default(),
            browser_executable: overlay.browser_executable,
            page_timeout_secs: overlay.page_timeout_secs.unwrap_or(45),
            http_timeout_secs: overlay.http_timeout_secs.unwrap_or(45),
            user_agent: overlay
                .user_agent
                .unwrap_or_else(|| "circwatch/0.1".to_string()),
            max_filename_chars: overlay.max_filename_chars.unwrap_or(DEFAULT_MAX_FILENAME_CHARS),
            frame_depth: overlay.frame_depth.unwrap_or(2),
            source_commit: overlay.source_commit,
            scheduler_cron: overlay
                .scheduler_cron
                .unwrap_or_else(|| "0 0 6,18 * * *".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), SyncError> {
        url::Url::parse(&self.listing_url)
            .map_err(|e| SyncError::Config(format!("listing_url {}: {e}", self.listing_url)))?;
        if self.max_entries == 0 {
            return Err(SyncError::Config("max_entries must be at least 1".into()));
        }
        if self.max_filename_chars < 8 {
            return Err(SyncError::Config("max_filename_chars must be at least 8".into()));
        }
        if self.page_timeout_secs == 0 || self.http_timeout_secs == 0 {
            return Err(SyncError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}
