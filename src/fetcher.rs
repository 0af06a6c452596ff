use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::domain::{FileHint, FileKind, KEY_FILE_NAME, RemoteFile, TitleId};
use crate::error::UnlockError;
use crate::github::{ContentSource, Listing};

pub fn script_candidates(title: &TitleId) -> Vec<String> {
    vec![
        title.script_file_name(),
        "depots.lua".to_string(),
        "config.lua".to_string(),
    ]
}

fn script_rank(title: &TitleId, name: &str) -> usize {
    script_candidates(title)
        .iter()
        .position(|candidate| candidate.eq_ignore_ascii_case(name))
        .unwrap_or(usize::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    // preference order, the first that downloads is installed
    pub scripts: Vec<RemoteFile>,
    // one group per data-file, alternatives tried in order
    pub data_files: Vec<Vec<RemoteFile>>,
    pub key_file: Option<RemoteFile>,
    pub guessed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    Plan(FetchPlan),
    NotFound,
}

#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub script: Option<(RemoteFile, Vec<u8>)>,
    pub data_files: Vec<(RemoteFile, Vec<u8>)>,
    pub key_file: Option<Vec<u8>>,
    pub failures: Vec<String>,
}

// downloads share a gate separate from the source's API gate
pub struct ContentFetcher<S: ContentSource> {
    source: Arc<S>,
    download_gate: Arc<Semaphore>,
}

impl<S: ContentSource> Clone for ContentFetcher<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            download_gate: Arc::clone(&self.download_gate),
        }
    }
}

impl<S: ContentSource> ContentFetcher<S> {
    pub fn new(source: Arc<S>, download_concurrency: usize) -> Self {
        Self {
            source,
            download_gate: Arc::new(Semaphore::new(download_concurrency.max(1))),
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub async fn plan(
        &self,
        title: &TitleId,
        branch: &str,
        hints: &[FileHint],
    ) -> Result<PlanOutcome, UnlockError> {
        match self.source.list_files(branch).await? {
            Listing::NotFound => Ok(PlanOutcome::NotFound),
            Listing::Files(files) => Ok(PlanOutcome::Plan(plan_from_listing(title, files, hints))),
            Listing::RateLimited => {
                warn!(title = %title, branch, "listing rate limited, guessing file names");
                Ok(PlanOutcome::Plan(self.guess_plan(title, branch, hints)))
            }
        }
    }

    fn guess_plan(&self, title: &TitleId, branch: &str, hints: &[FileHint]) -> FetchPlan {
        let scripts = script_candidates(title)
            .iter()
            .filter_map(|name| self.source.direct_file(branch, name))
            .collect();
        let data_files = hints
            .iter()
            .map(|hint| {
                hint.candidate_names()
                    .iter()
                    .filter_map(|name| self.source.direct_file(branch, name))
                    .map(|mut file| {
                        file.name = hint.install_name();
                        file
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|group| !group.is_empty())
            .collect();
        FetchPlan {
            scripts,
            data_files,
            key_file: self.source.direct_file(branch, KEY_FILE_NAME),
            guessed: true,
        }
    }

    pub async fn download(&self, plan: FetchPlan) -> FetchOutcome {
        let script = self.first_available(plan.scripts);
        let data = join_all(plan.data_files.into_iter().map(|group| self.first_available(group)));
        let key_file = plan.key_file;
        let key = async move {
            let file = key_file?;
            match self.fetch_one(&file).await {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    debug!(file = %file.name, error = %err, "key file download failed");
                    None
                }
            }
        };
        let (script, data, key) = futures::join!(script, data, key);

        let mut outcome = FetchOutcome {
            key_file: key,
            ..FetchOutcome::default()
        };
        let (script, script_errors) = script;
        outcome.script = script;
        outcome.failures.extend(script_errors);
        for (file, errors) in data {
            if let Some(file) = file {
                outcome.data_files.push(file);
            }
            outcome.failures.extend(errors);
        }
        outcome
    }

    async fn first_available(
        &self,
        candidates: Vec<RemoteFile>,
    ) -> (Option<(RemoteFile, Vec<u8>)>, Vec<String>) {
        let mut errors = Vec::new();
        for file in candidates {
            match self.fetch_one(&file).await {
                Ok(bytes) => return (Some((file, bytes)), Vec::new()),
                Err(err) => {
                    debug!(file = %file.name, error = %err, "download failed");
                    errors.push(format!("{}: {err}", file.name));
                }
            }
        }
        (None, errors)
    }

    async fn fetch_one(&self, file: &RemoteFile) -> Result<Vec<u8>, UnlockError> {
        let _permit = self
            .download_gate
            .acquire()
            .await
            .map_err(|_| UnlockError::Cancelled)?;
        self.source.fetch(file).await
    }
}

pub fn plan_from_listing(title: &TitleId, files: Vec<RemoteFile>, hints: &[FileHint]) -> FetchPlan {
    let mut scripts = Vec::new();
    let mut data = Vec::new();
    let mut key_file = None;
    for file in files {
        match file.kind {
            FileKind::Script => scripts.push(file),
            FileKind::DataFile => data.push(file),
            FileKind::KeyFile => {
                key_file.get_or_insert(file);
            }
        }
    }
    scripts.sort_by(|a, b| {
        script_rank(title, &a.name)
            .cmp(&script_rank(title, &b.name))
            .then_with(|| a.name.cmp(&b.name))
    });

    let mut seen = HashSet::new();
    let hinted: Vec<RemoteFile> = data
        .iter()
        .filter_map(|file| {
            let hint = hints.iter().find(|hint| hint.matches(&file.name))?;
            let mut file = file.clone();
            // a bare listed name is installed under the hint's depot-qualified name
            if hint.depot.is_some() {
                file.name = hint.install_name();
            }
            seen.insert(file.name.clone()).then_some(file)
        })
        .collect();
    let data = if hinted.is_empty() { data } else { hinted };

    FetchPlan {
        scripts,
        data_files: data.into_iter().map(|file| vec![file]).collect(),
        key_file,
        guessed: false,
    }
}
