use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UnlockError;

pub const SCRIPT_EXT: &str = "lua";
pub const DATA_EXT: &str = "manifest";
pub const KEY_FILE_NAME: &str = "key.vdf";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TitleId(String);

impl TitleId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn script_file_name(&self) -> String {
        format!("{}.{SCRIPT_EXT}", self.0)
    }
}

impl fmt::Display for TitleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TitleId {
    type Err = UnlockError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty() && normalized.chars().all(|ch| ch.is_ascii_digit());
        if !is_valid {
            return Err(UnlockError::InvalidTitleId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for TitleId {
    type Error = UnlockError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TitleId> for String {
    fn from(value: TitleId) -> Self {
        value.0
    }
}

pub fn dedup_titles(titles: impl IntoIterator<Item = TitleId>) -> Vec<TitleId> {
    let mut seen = HashSet::new();
    titles
        .into_iter()
        .filter(|title| seen.insert(title.clone()))
        .collect()
}

// `<depot>_<manifest>` or a bare manifest id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileHint {
    pub depot: Option<String>,
    pub manifest: String,
}

impl FileHint {
    // most specific first
    pub fn candidate_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(depot) = &self.depot {
            names.push(format!("{depot}_{}.{DATA_EXT}", self.manifest));
        }
        names.push(format!("{}.{DATA_EXT}", self.manifest));
        names
    }

    pub fn install_name(&self) -> String {
        match &self.depot {
            Some(depot) => format!("{depot}_{}.{DATA_EXT}", self.manifest),
            None => format!("{}.{DATA_EXT}", self.manifest),
        }
    }

    pub fn matches(&self, file_name: &str) -> bool {
        let stem = file_name
            .strip_suffix(&format!(".{DATA_EXT}"))
            .unwrap_or(file_name);
        match &self.depot {
            Some(depot) => stem == format!("{depot}_{}", self.manifest) || stem == self.manifest,
            None => stem == self.manifest || stem.ends_with(&format!("_{}", self.manifest)),
        }
    }
}

impl fmt::Display for FileHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.depot {
            Some(depot) => write!(f, "{depot}_{}", self.manifest),
            None => write!(f, "{}", self.manifest),
        }
    }
}

impl FromStr for FileHint {
    type Err = UnlockError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let all_digits = |part: &str| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit());
        match trimmed.split_once('_') {
            Some((depot, manifest)) if all_digits(depot) && all_digits(manifest) => Ok(Self {
                depot: Some(depot.to_string()),
                manifest: manifest.to_string(),
            }),
            None if all_digits(trimmed) => Ok(Self {
                depot: None,
                manifest: trimmed.to_string(),
            }),
            _ => Err(UnlockError::InvalidHint(value.to_string())),
        }
    }
}

pub fn parse_hint_map(
    raw: HashMap<String, Vec<String>>,
) -> Result<HashMap<TitleId, Vec<FileHint>>, UnlockError> {
    raw.into_iter()
        .map(|(title, hints)| {
            let hints = hints
                .iter()
                .map(|hint| hint.parse())
                .collect::<Result<Vec<FileHint>, _>>()?;
            Ok((title.parse()?, hints))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Script,
    DataFile,
    KeyFile,
}

impl FileKind {
    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case(KEY_FILE_NAME) {
            return Some(FileKind::KeyFile);
        }
        let (_, ext) = name.rsplit_once('.')?;
        if ext.eq_ignore_ascii_case(SCRIPT_EXT) {
            Some(FileKind::Script)
        } else if ext.eq_ignore_ascii_case(DATA_EXT) {
            Some(FileKind::DataFile)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    Url(String),
    GitObject { rev: String, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub name: String,
    pub kind: FileKind,
    pub source: FileSource,
}

impl RemoteFile {
    pub fn new(name: impl Into<String>, source: FileSource) -> Option<Self> {
        let name = name.into();
        let kind = FileKind::from_name(&name)?;
        Some(Self { name, kind, source })
    }

    pub fn download_url(&self) -> Option<&str> {
        match &self.source {
            FileSource::Url(url) => Some(url),
            FileSource::GitObject { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Active,
    Disabled,
    NotInstalled,
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallState::Active => write!(f, "active"),
            InstallState::Disabled => write!(f, "disabled"),
            InstallState::NotInstalled => write!(f, "not installed"),
        }
    }
}
