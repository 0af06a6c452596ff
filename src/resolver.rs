use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::TitleId;
use crate::error::UnlockError;
use crate::git::run_git_text;

pub const LOCAL_LIST_TIMEOUT: Duration = Duration::from_secs(30);
pub const REMOTE_LIST_TIMEOUT: Duration = Duration::from_secs(120);

static LONG_DIGIT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{5,}").expect("digit run pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    Local,
    Remote,
}

#[async_trait]
pub trait BranchSource: Send + Sync {
    fn mode(&self) -> ResolveMode;
    async fn list_branches(&self) -> Result<Vec<String>, UnlockError>;
}

pub struct LocalBranches {
    repo: Utf8PathBuf,
}

impl LocalBranches {
    pub fn new(repo: Utf8PathBuf) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl BranchSource for LocalBranches {
    fn mode(&self) -> ResolveMode {
        ResolveMode::Local
    }

    async fn list_branches(&self) -> Result<Vec<String>, UnlockError> {
        let stdout = run_git_text(
            Some(self.repo.as_std_path()),
            &["branch", "-a"],
            LOCAL_LIST_TIMEOUT,
        )
        .await?;
        Ok(parse_branch_listing(&stdout))
    }
}

pub struct RemoteHeads {
    url: String,
}

impl RemoteHeads {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BranchSource for RemoteHeads {
    fn mode(&self) -> ResolveMode {
        ResolveMode::Remote
    }

    async fn list_branches(&self) -> Result<Vec<String>, UnlockError> {
        let stdout = run_git_text(
            None,
            &["ls-remote", "--heads", &self.url],
            REMOTE_LIST_TIMEOUT,
        )
        .await?;
        Ok(parse_ls_remote(&stdout))
    }
}

pub fn parse_branch_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(|line| line.trim().trim_start_matches("* ").trim())
        .filter(|line| !line.is_empty() && !line.contains("->") && !line.starts_with('('))
        .map(|line| line.strip_prefix("remotes/").unwrap_or(line).to_string())
        .collect()
}

pub fn parse_ls_remote(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .filter_map(|(_, reference)| reference.trim().strip_prefix("refs/heads/"))
        .map(str::to_string)
        .collect()
}

fn is_all_digits(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|ch| ch.is_ascii_digit())
}

fn final_segment(branch: &str) -> &str {
    branch.rsplit('/').next().unwrap_or(branch)
}

#[derive(Debug, Clone)]
pub struct BranchIndex {
    mode: ResolveMode,
    branches: Vec<String>,
    numeric: HashMap<String, String>,
}

impl BranchIndex {
    pub fn new(mode: ResolveMode, branches: Vec<String>) -> Self {
        let mut numeric = HashMap::new();
        for branch in &branches {
            // remote heads count only when the whole name is the id
            let key = match mode {
                ResolveMode::Local => final_segment(branch),
                ResolveMode::Remote => branch.as_str(),
            };
            if is_all_digits(key) {
                numeric.entry(key.to_string()).or_insert_with(|| branch.clone());
            }
        }
        let branches = match mode {
            ResolveMode::Local => branches,
            ResolveMode::Remote => branches
                .into_iter()
                .filter(|branch| numeric.contains_key(branch.as_str()))
                .collect(),
        };
        Self {
            mode,
            branches,
            numeric,
        }
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn lookup(&self, title: &TitleId, fuzzy: bool) -> Option<String> {
        let id = title.as_str();
        if let Some(branch) = self.numeric.get(id) {
            return Some(branch.clone());
        }
        if self.mode == ResolveMode::Remote {
            return None;
        }

        if id.len() >= 5 {
            let by_run = self.branches.iter().find(|branch| {
                LONG_DIGIT_RUN
                    .find_iter(final_segment(branch))
                    .any(|run| run.as_str() == id)
            });
            if let Some(branch) = by_run {
                return Some(branch.clone());
            }
        }

        if fuzzy {
            return self
                .branches
                .iter()
                .find(|branch| final_segment(branch).contains(id))
                .cloned();
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(String),
    // listing failed, the id itself is tried as the branch
    Assumed(String),
    NotFound,
}

impl Resolution {
    pub fn branch(&self) -> Option<&str> {
        match self {
            Resolution::Found(branch) | Resolution::Assumed(branch) => Some(branch),
            Resolution::NotFound => None,
        }
    }
}

#[derive(Debug)]
enum IndexState {
    Ready(BranchIndex),
    Unavailable,
}

pub struct BranchResolver<B: BranchSource> {
    source: B,
    fuzzy: bool,
    index: Mutex<Option<Arc<IndexState>>>,
}

impl<B: BranchSource> BranchResolver<B> {
    pub fn new(source: B, fuzzy: bool) -> Self {
        Self {
            source,
            fuzzy,
            index: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> ResolveMode {
        self.source.mode()
    }

    pub async fn invalidate(&self) {
        *self.index.lock().await = None;
    }

    pub async fn resolve(&self, title: &TitleId) -> Resolution {
        match &*self.index().await {
            IndexState::Ready(index) => match index.lookup(title, self.fuzzy) {
                Some(branch) => Resolution::Found(branch),
                None => Resolution::NotFound,
            },
            IndexState::Unavailable => match self.mode() {
                ResolveMode::Remote => Resolution::Assumed(title.as_str().to_string()),
                ResolveMode::Local => Resolution::NotFound,
            },
        }
    }

    async fn index(&self) -> Arc<IndexState> {
        let mut guard = self.index.lock().await;
        if let Some(state) = guard.as_ref() {
            return Arc::clone(state);
        }
        let state = match self.source.list_branches().await {
            Ok(branches) => {
                let index = BranchIndex::new(self.mode(), branches);
                info!(branches = index.len(), mode = ?self.mode(), "branch index built");
                IndexState::Ready(index)
            }
            Err(err) => {
                warn!(error = %err, mode = ?self.mode(), "branch listing failed");
                IndexState::Unavailable
            }
        };
        let state = Arc::new(state);
        *guard = Some(Arc::clone(&state));
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn title(id: &str) -> TitleId {
        id.parse().unwrap()
    }

    #[test]
    fn parses_git_branch_output() {
        let stdout = "* main\n  1245620\n  remotes/origin/HEAD -> origin/main\n  remotes/origin/730\n";
        assert_eq!(
            parse_branch_listing(stdout),
            vec!["main", "1245620", "origin/730"]
        );
    }

    #[test]
    fn parses_ls_remote_output() {
        let stdout = "a1b2c3\trefs/heads/100\nd4e5f6\trefs/heads/main\n0000\trefs/tags/v1\n";
        assert_eq!(parse_ls_remote(stdout), vec!["100", "main"]);
    }

    #[test]
    fn exact_match_beats_digit_run() {
        let index = BranchIndex::new(
            ResolveMode::Local,
            vec!["app_1245620_old".to_string(), "origin/1245620".to_string()],
        );
        assert_eq!(
            index.lookup(&title("1245620"), false).as_deref(),
            Some("origin/1245620")
        );
    }

    #[test]
    fn digit_run_requires_full_run() {
        let index = BranchIndex::new(
            ResolveMode::Local,
            vec!["app_12456201".to_string(), "game_1245620_v2".to_string()],
        );
        assert_eq!(
            index.lookup(&title("1245620"), false).as_deref(),
            Some("game_1245620_v2")
        );
    }

    #[test]
    fn substring_only_when_fuzzy() {
        let index = BranchIndex::new(ResolveMode::Local, vec!["1005".to_string()]);
        assert_eq!(index.lookup(&title("100"), false), None);
        assert_eq!(index.lookup(&title("100"), true).as_deref(), Some("1005"));
    }

    #[test]
    fn remote_index_keeps_numeric_heads_only() {
        let index = BranchIndex::new(
            ResolveMode::Remote,
            vec![
                "main".to_string(),
                "100".to_string(),
                "200x".to_string(),
                "feature/300".to_string(),
            ],
        );
        assert_eq!(index.len(), 1);
        assert_eq!(index.lookup(&title("100"), true).as_deref(), Some("100"));
        assert_eq!(index.lookup(&title("200"), true), None);
        assert_eq!(index.lookup(&title("300"), true), None);
    }
}
