use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use tracing::debug;

use crate::domain::{FileSource, RemoteFile};
use crate::error::UnlockError;
use crate::git::{run_git, run_git_text};
use crate::github::{ContentSource, Listing};

const GIT_READ_TIMEOUT: Duration = Duration::from_secs(30);

// reads branch contents without a checkout
pub struct LocalGitSource {
    repo: Utf8PathBuf,
}

impl LocalGitSource {
    pub fn new(repo: Utf8PathBuf) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl ContentSource for LocalGitSource {
    fn label(&self) -> &str {
        "local-git"
    }

    async fn list_files(&self, branch: &str) -> Result<Listing, UnlockError> {
        let result = run_git_text(
            Some(self.repo.as_std_path()),
            &["ls-tree", "--name-only", branch],
            GIT_READ_TIMEOUT,
        )
        .await;
        let stdout = match result {
            Ok(stdout) => stdout,
            Err(UnlockError::GitCommand(message)) if is_unknown_revision(&message) => {
                debug!(branch, "revision missing from local clone");
                return Ok(Listing::NotFound);
            }
            Err(err) => return Err(err),
        };
        Ok(Listing::Files(parse_tree_listing(branch, &stdout)))
    }

    fn direct_file(&self, branch: &str, name: &str) -> Option<RemoteFile> {
        RemoteFile::new(
            name,
            FileSource::GitObject {
                rev: branch.to_string(),
                path: name.to_string(),
            },
        )
    }

    async fn fetch(&self, file: &RemoteFile) -> Result<Vec<u8>, UnlockError> {
        let FileSource::GitObject { rev, path } = &file.source else {
            return Err(UnlockError::GitCommand(format!(
                "{} is not stored in the local clone",
                file.name
            )));
        };
        let object = format!("{rev}:{path}");
        run_git(
            Some(self.repo.as_std_path()),
            &["show", &object],
            GIT_READ_TIMEOUT,
        )
        .await
    }
}

fn is_unknown_revision(message: &str) -> bool {
    message.contains("Not a valid object name") || message.contains("not a tree object")
}

fn parse_tree_listing(branch: &str, stdout: &str) -> Vec<RemoteFile> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| {
            RemoteFile::new(
                name,
                FileSource::GitObject {
                    rev: branch.to_string(),
                    path: name.to_string(),
                },
            )
        })
        .collect()
}
