use std::fs;
use std::path::PathBuf;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::UnlockError;

pub const DEFAULT_CONFIG_FILE: &str = "depot-unlock.json";
pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_RAW_BASE: &str = "https://raw.githubusercontent.com";
pub const DEFAULT_API_CONCURRENCY: usize = 10;
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 50;
pub const DEFAULT_TASK_CONCURRENCY: usize = 20;
const MAX_CONCURRENCY: usize = 512;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub steam_path: Option<String>,
    #[serde(default)]
    pub script_dir: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub disabled_dir: Option<String>,
    #[serde(default)]
    pub applist_dir: Option<String>,
    #[serde(default)]
    pub api_concurrency: Option<usize>,
    #[serde(default)]
    pub download_concurrency: Option<usize>,
    #[serde(default)]
    pub task_concurrency: Option<usize>,
    #[serde(default)]
    pub strategy: Option<StrategyPreference>,
    #[serde(default)]
    pub downloader_path: Option<String>,
    #[serde(default)]
    pub fuzzy_branch_match: Option<bool>,
    #[serde(default)]
    pub synthesize_fallback: Option<bool>,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub raw_base: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StrategyPreference {
    #[default]
    Auto,
    External,
    Async,
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoLocation {
    Local(Utf8PathBuf),
    Github { owner: String, name: String },
}

impl RepoLocation {
    pub fn parse(value: &str) -> Result<Self, UnlockError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(UnlockError::MissingSetting("repo".to_string()));
        }

        let as_path = Utf8Path::new(trimmed);
        if as_path.join(".git").as_std_path().exists() {
            return Ok(RepoLocation::Local(as_path.to_path_buf()));
        }

        let slug = trimmed
            .trim_start_matches("https://github.com/")
            .trim_start_matches("http://github.com/")
            .trim_start_matches("git@github.com:")
            .trim_end_matches('/')
            .trim_end_matches(".git");
        let parts = slug.split('/').collect::<Vec<_>>();
        let is_valid = parts.len() == 2
            && parts.iter().all(|part| {
                !part.is_empty()
                    && part
                        .chars()
                        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
            });
        if !is_valid {
            return Err(UnlockError::InvalidSetting {
                name: "repo".to_string(),
                message: format!("expected owner/repo, GitHub URL or local clone, got {value}"),
            });
        }
        Ok(RepoLocation::Github {
            owner: parts[0].to_string(),
            name: parts[1].to_string(),
        })
    }

    pub fn slug(&self) -> Option<String> {
        match self {
            RepoLocation::Github { owner, name } => Some(format!("{owner}/{name}")),
            RepoLocation::Local(_) => None,
        }
    }

    pub fn clone_url(&self) -> String {
        match self {
            RepoLocation::Github { owner, name } => format!("https://github.com/{owner}/{name}.git"),
            RepoLocation::Local(path) => path.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallDirs {
    pub script_dir: Utf8PathBuf,
    pub cache_dir: Utf8PathBuf,
    pub disabled_dir: Utf8PathBuf,
    pub applist_dir: Option<Utf8PathBuf>,
}

impl InstallDirs {
    pub fn from_steam_root(steam: &Utf8Path) -> Self {
        Self {
            script_dir: steam.join("config").join("stplug-in"),
            cache_dir: steam.join("config").join("depotcache"),
            disabled_dir: steam.join("config").join("stplug-in-disabled"),
            applist_dir: Some(steam.join("AppList")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub auth_token: Option<String>,
    pub repo: RepoLocation,
    pub dirs: InstallDirs,
    pub api_concurrency: usize,
    pub download_concurrency: usize,
    pub task_concurrency: usize,
    pub strategy: StrategyPreference,
    pub downloader_path: Option<Utf8PathBuf>,
    pub fuzzy_branch_match: bool,
    pub synthesize_fallback: bool,
    pub api_base: String,
    pub raw_base: String,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, UnlockError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(UnlockError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| UnlockError::ConfigRead(config_path.clone()))?;
        let mut config: Config = serde_json::from_str(&content)
            .map_err(|err| UnlockError::ConfigParse(err.to_string()))?;

        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            if !token.trim().is_empty() {
                config.auth_token = Some(token.trim().to_string());
            }
        }
        if config.steam_path.is_none() && config.script_dir.is_none() {
            config.steam_path = Self::detect_steam_path().map(|path| path.to_string());
        }

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, UnlockError> {
        let repo = RepoLocation::parse(config.repo.as_deref().unwrap_or_default())?;
        let dirs = resolve_dirs(&config)?;

        let auth_token = config
            .auth_token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());

        Ok(ResolvedConfig {
            auth_token,
            repo,
            dirs,
            api_concurrency: concurrency(
                "api_concurrency",
                config.api_concurrency,
                DEFAULT_API_CONCURRENCY,
            )?,
            download_concurrency: concurrency(
                "download_concurrency",
                config.download_concurrency,
                DEFAULT_DOWNLOAD_CONCURRENCY,
            )?,
            task_concurrency: concurrency(
                "task_concurrency",
                config.task_concurrency,
                DEFAULT_TASK_CONCURRENCY,
            )?,
            strategy: config.strategy.unwrap_or_default(),
            downloader_path: config.downloader_path.map(Utf8PathBuf::from),
            fuzzy_branch_match: config.fuzzy_branch_match.unwrap_or(false),
            synthesize_fallback: config.synthesize_fallback.unwrap_or(true),
            api_base: config
                .api_base
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            raw_base: config
                .raw_base
                .unwrap_or_else(|| DEFAULT_RAW_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    pub fn detect_steam_path() -> Option<Utf8PathBuf> {
        let mut candidates = Vec::new();
        if let Some(dirs) = BaseDirs::new() {
            candidates.push(dirs.home_dir().join(".steam").join("steam"));
            candidates.push(dirs.data_local_dir().join("Steam"));
        }
        for var in ["ProgramFiles(x86)", "ProgramFiles"] {
            if let Some(root) = std::env::var_os(var) {
                candidates.push(PathBuf::from(root).join("Steam"));
            }
        }
        candidates
            .into_iter()
            .filter(|path| path.join("config").is_dir())
            .find_map(|path| Utf8PathBuf::from_path_buf(path).ok())
    }
}

fn resolve_dirs(config: &Config) -> Result<InstallDirs, UnlockError> {
    let derived = config
        .steam_path
        .as_deref()
        .map(|steam| InstallDirs::from_steam_root(Utf8Path::new(steam)));

    let script_dir = config
        .script_dir
        .as_deref()
        .map(Utf8PathBuf::from)
        .or_else(|| derived.as_ref().map(|dirs| dirs.script_dir.clone()))
        .ok_or_else(|| UnlockError::MissingSetting("script_dir or steam_path".to_string()))?;
    let cache_dir = config
        .cache_dir
        .as_deref()
        .map(Utf8PathBuf::from)
        .or_else(|| derived.as_ref().map(|dirs| dirs.cache_dir.clone()))
        .ok_or_else(|| UnlockError::MissingSetting("cache_dir or steam_path".to_string()))?;
    let disabled_dir = config
        .disabled_dir
        .as_deref()
        .map(Utf8PathBuf::from)
        .or_else(|| derived.as_ref().map(|dirs| dirs.disabled_dir.clone()))
        .unwrap_or_else(|| Utf8PathBuf::from(format!("{script_dir}-disabled")));
    let applist_dir = config
        .applist_dir
        .as_deref()
        .map(Utf8PathBuf::from)
        .or_else(|| derived.and_then(|dirs| dirs.applist_dir));

    Ok(InstallDirs {
        script_dir,
        cache_dir,
        disabled_dir,
        applist_dir,
    })
}

fn concurrency(name: &str, value: Option<usize>, default: usize) -> Result<usize, UnlockError> {
    match value {
        None => Ok(default),
        Some(0) => Err(UnlockError::InvalidSetting {
            name: name.to_string(),
            message: "must be at least 1".to_string(),
        }),
        Some(value) => Ok(value.min(MAX_CONCURRENCY)),
    }
}
