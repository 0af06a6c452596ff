use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use camino::Utf8PathBuf;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ResolvedConfig, StrategyPreference};
use crate::domain::{FileHint, TitleId, dedup_titles};
use crate::error::UnlockError;
use crate::external::{ExternalRequest, run_downloader};
use crate::fetcher::{ContentFetcher, FetchOutcome, FetchPlan, PlanOutcome};
use crate::github::ContentSource;
use crate::installer::{InstallReport, Installer};
use crate::keyfile::script_from_key_file;
use crate::progress::{ProgressSink, ProgressTracker};
use crate::resolver::{BranchResolver, BranchSource, ResolveMode};
use crate::synth::{SynthAction, ensure_minimal};

const DOWNLOADER_NAMES: [&str; 2] = ["downloader", "downloader.exe"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionStrategy {
    ExternalProcess(Utf8PathBuf),
    InProcessAsync,
    Sequential,
}

impl AcquisitionStrategy {
    pub fn select(config: &ResolvedConfig) -> Self {
        match config.strategy {
            StrategyPreference::Async => AcquisitionStrategy::InProcessAsync,
            StrategyPreference::Sequential => AcquisitionStrategy::Sequential,
            StrategyPreference::External => match find_downloader(config) {
                Some(path) => AcquisitionStrategy::ExternalProcess(path),
                None => {
                    warn!("external downloader requested but not usable, running in-process");
                    AcquisitionStrategy::InProcessAsync
                }
            },
            StrategyPreference::Auto => find_downloader(config)
                .map(AcquisitionStrategy::ExternalProcess)
                .unwrap_or(AcquisitionStrategy::InProcessAsync),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AcquisitionStrategy::ExternalProcess(_) => "external",
            AcquisitionStrategy::InProcessAsync => "async",
            AcquisitionStrategy::Sequential => "sequential",
        }
    }
}

// local clones never use the downloader
fn find_downloader(config: &ResolvedConfig) -> Option<Utf8PathBuf> {
    config.repo.slug()?;
    if let Some(path) = &config.downloader_path {
        return path.as_std_path().is_file().then(|| path.clone());
    }
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    DOWNLOADER_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
}

#[derive(Debug, Clone, Default)]
pub struct BatchControl {
    root: CancellationToken,
    titles: Arc<Mutex<HashMap<TitleId, CancellationToken>>>,
}

impl BatchControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn cancel_title(&self, title: &TitleId) {
        self.title_token(title).cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.root
    }

    fn title_token(&self, title: &TitleId) -> CancellationToken {
        let mut titles = self
            .titles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        titles
            .entry(title.clone())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TitleOutcome {
    pub title: TitleId,
    pub success: bool,
    pub scripts_written: usize,
    pub data_written: usize,
    pub data_skipped: usize,
    pub synthesized: bool,
    pub branch: Option<String>,
    pub error: Option<String>,
    pub note: Option<String>,
}

impl TitleOutcome {
    fn new(title: TitleId) -> Self {
        Self {
            title,
            success: false,
            scripts_written: 0,
            data_written: 0,
            data_skipped: 0,
            synthesized: false,
            branch: None,
            error: None,
            note: None,
        }
    }

    pub fn failed(title: TitleId, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(title)
        }
    }

    pub fn message(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        let mut message = format!(
            "{} script, {} data-file(s)",
            self.scripts_written, self.data_written
        );
        if self.data_skipped > 0 {
            message.push_str(&format!(", {} cached", self.data_skipped));
        }
        if self.synthesized {
            message.push_str(", minimal script synthesized");
        }
        if let Some(note) = &self.note {
            message.push_str(&format!(" ({note})"));
        }
        message
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    // false only for a cancelled batch
    pub success: bool,
    pub cancelled: bool,
    pub strategy: String,
    pub results: BTreeMap<TitleId, TitleOutcome>,
    pub started_at: String,
    pub elapsed_secs: f64,
    pub api_remaining: Option<u64>,
    pub repaired: usize,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|outcome| outcome.success).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }

    pub fn failures(&self, limit: usize) -> Vec<&TitleOutcome> {
        self.results
            .values()
            .filter(|outcome| !outcome.success)
            .take(limit)
            .collect()
    }
}

struct Pipeline<S: ContentSource, B: BranchSource> {
    resolver: Arc<BranchResolver<B>>,
    fetcher: ContentFetcher<S>,
    installer: Installer,
    synthesize: bool,
}

impl<S: ContentSource + 'static, B: BranchSource + 'static> Pipeline<S, B> {
    async fn acquire(&self, title: &TitleId, hints: &[FileHint]) -> TitleOutcome {
        let mut outcome = TitleOutcome::new(title.clone());
        let resolution = self.resolver.resolve(title).await;

        let plan = match resolution.branch() {
            None => Err("no matching branch".to_string()),
            Some(branch) => {
                outcome.branch = Some(branch.to_string());
                match self.fetcher.plan(title, branch, hints).await {
                    Ok(PlanOutcome::Plan(plan)) => Ok(plan),
                    Ok(PlanOutcome::NotFound) => Err(format!("branch {branch} not found")),
                    Err(err) => Err(err.to_string()),
                }
            }
        };

        let mut problem = None;
        match plan {
            Ok(plan) => {
                let report = self.fetch_and_install(title, plan).await;
                outcome.scripts_written = report.scripts_written;
                outcome.data_written = report.data_written;
                outcome.data_skipped = report.data_skipped;
                if report.script_from_keys {
                    outcome.note = Some("script generated from key.vdf".to_string());
                }
                if report.scripts_written == 0 {
                    let reason = report
                        .failures
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "branch has no script".to_string());
                    problem = Some(reason);
                }
            }
            Err(reason) => {
                debug!(title = %title, reason, "nothing to download");
                problem = Some(reason);
            }
        }

        let Some(problem) = problem else {
            outcome.success = true;
            return outcome;
        };
        if !self.synthesize {
            outcome.error = Some(problem);
            return outcome;
        }

        let installer = self.installer.clone();
        let owned = title.clone();
        let synth = tokio::task::spawn_blocking(move || ensure_minimal(&installer, &owned))
            .await
            .map_err(|err| UnlockError::Filesystem(err.to_string()))
            .and_then(|result| result);
        match synth {
            Ok(action) => {
                outcome.success = true;
                outcome.synthesized = action == SynthAction::Written;
                outcome.note = Some(match action {
                    SynthAction::Written => problem,
                    SynthAction::AlreadyValid => format!("{problem}; kept existing script"),
                });
            }
            Err(err) => outcome.error = Some(format!("{problem}; synthesis failed: {err}")),
        }
        outcome
    }

    async fn fetch_and_install(&self, title: &TitleId, plan: FetchPlan) -> InstallReport {
        let data_file_names: Vec<String> = plan
            .data_files
            .iter()
            .filter_map(|group| group.first())
            .map(|file| file.name.clone())
            .collect();
        let (data_files, cached) = self.installer.partition_cached(plan.data_files);
        let fetched = self
            .fetcher
            .download(FetchPlan { data_files, ..plan })
            .await;

        let installer = self.installer.clone();
        let owned = title.clone();
        let mut report = tokio::task::spawn_blocking(move || {
            install_fetched(&installer, &owned, fetched, &data_file_names)
        })
        .await
        .unwrap_or_else(|err| InstallReport {
            failures: vec![format!("install task failed: {err}")],
            ..InstallReport::default()
        });
        report.data_skipped += cached;
        report
    }
}

fn install_fetched(
    installer: &Installer,
    title: &TitleId,
    fetched: FetchOutcome,
    data_file_names: &[String],
) -> InstallReport {
    let mut report = InstallReport {
        failures: fetched.failures,
        ..InstallReport::default()
    };
    if let Some((file, bytes)) = fetched.script {
        match installer.install_script(title, &bytes) {
            Ok(_) => report.scripts_written += 1,
            Err(err) => {
                warn!(title = %title, file = %file.name, error = %err, "script install failed");
                report.failures.insert(0, format!("{}: {err}", file.name));
            }
        }
    }
    for (file, bytes) in fetched.data_files {
        match installer.install_data_file(&file.name, &bytes) {
            Ok(action) => report.record_data(action),
            Err(err) => {
                warn!(title = %title, file = %file.name, error = %err, "data-file install failed");
                report.failures.push(format!("{}: {err}", file.name));
            }
        }
    }
    if report.scripts_written == 0
        && let Some(key_file) = fetched.key_file
    {
        install_keyed_script(installer, title, &key_file, data_file_names, &mut report);
    }
    report
}

// runs after data-files so the script names the manifests now in the cache
fn install_keyed_script(
    installer: &Installer,
    title: &TitleId,
    key_file: &[u8],
    data_file_names: &[String],
    report: &mut InstallReport,
) {
    let cached = data_file_names
        .iter()
        .filter(|name| installer.is_cached(name))
        .map(String::as_str);
    let script = match script_from_key_file(title, key_file, cached) {
        Ok(Some(script)) => script,
        Ok(None) => return,
        Err(err) => {
            warn!(title = %title, error = %err, "key file unusable");
            report.failures.push(err.to_string());
            return;
        }
    };
    match installer.install_script(title, script.as_bytes()) {
        Ok(_) => {
            report.scripts_written += 1;
            report.script_from_keys = true;
        }
        Err(err) => {
            warn!(title = %title, error = %err, "generated script install failed");
            report.failures.push(format!("{}: {err}", title.script_file_name()));
        }
    }
}

pub struct Orchestrator<S: ContentSource, B: BranchSource> {
    pipeline: Arc<Pipeline<S, B>>,
    strategy: AcquisitionStrategy,
    task_concurrency: usize,
    token: String,
    repo_slug: Option<String>,
}

impl<S: ContentSource + 'static, B: BranchSource + 'static> Orchestrator<S, B> {
    pub fn new(config: &ResolvedConfig, source: S, branches: B) -> Self {
        let source = Arc::new(source);
        Self {
            pipeline: Arc::new(Pipeline {
                resolver: Arc::new(BranchResolver::new(branches, config.fuzzy_branch_match)),
                fetcher: ContentFetcher::new(source, config.download_concurrency),
                installer: Installer::new(config.dirs.clone()),
                synthesize: config.synthesize_fallback,
            }),
            strategy: AcquisitionStrategy::select(config),
            task_concurrency: config.task_concurrency,
            token: config.auth_token.clone().unwrap_or_default(),
            repo_slug: config.repo.slug(),
        }
    }

    pub fn with_strategy(mut self, strategy: AcquisitionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> &AcquisitionStrategy {
        &self.strategy
    }

    pub fn installer(&self) -> &Installer {
        &self.pipeline.installer
    }

    pub async fn download_batch(
        &self,
        titles: Vec<TitleId>,
        hints: &HashMap<TitleId, Vec<FileHint>>,
        sink: &dyn ProgressSink,
        control: &BatchControl,
    ) -> Result<BatchResult, UnlockError> {
        let started = Instant::now();
        let started_at = chrono::Utc::now().to_rfc3339();
        let titles = dedup_titles(titles);
        self.pipeline.installer.ensure_dirs()?;

        let source = self.pipeline.fetcher.source();
        source.begin_run();
        if self.pipeline.resolver.mode() == ResolveMode::Remote {
            self.pipeline.resolver.invalidate().await;
        }

        let tracker = ProgressTracker::new(sink);
        tracker.report(
            format!("{} titles via {}", titles.len(), self.strategy.label()),
            0,
        );
        info!(titles = titles.len(), strategy = self.strategy.label(), source = source.label(), "batch started");

        let mut external_remaining = None;
        let mut repaired = 0;
        let mut results = match &self.strategy {
            AcquisitionStrategy::ExternalProcess(program) => {
                tracker.set_span(0, 80);
                match self.run_external(program, &titles, hints, &tracker, control).await {
                    Ok((mut results, remaining)) => {
                        external_remaining = remaining;
                        let failed: Vec<TitleId> = results
                            .values()
                            .filter(|outcome| !outcome.success)
                            .map(|outcome| outcome.title.clone())
                            .collect();
                        if !failed.is_empty() && !control.is_cancelled() {
                            info!(titles = failed.len(), "repair pass");
                            tracker.message(format!("repairing {} titles", failed.len()));
                            tracker.set_span(80, 100);
                            repaired = failed.len();
                            let fixed = self
                                .run_in_process(&self.pipeline, &failed, hints, &tracker, control)
                                .await;
                            results.extend(fixed);
                        }
                        results
                    }
                    Err(UnlockError::Cancelled) => BTreeMap::new(),
                    Err(err) => {
                        warn!(error = %err, "external downloader failed, running in-process");
                        tracker.message(format!("external downloader failed: {err}"));
                        tracker.set_span(0, 100);
                        self.run_in_process(&self.pipeline, &titles, hints, &tracker, control)
                            .await
                    }
                }
            }
            AcquisitionStrategy::InProcessAsync => {
                self.run_in_process(&self.pipeline, &titles, hints, &tracker, control)
                    .await
            }
            AcquisitionStrategy::Sequential => {
                self.run_sequential(&titles, hints, &tracker, control).await
            }
        };

        for title in &titles {
            results
                .entry(title.clone())
                .or_insert_with(|| TitleOutcome::failed(title.clone(), "cancelled"));
        }
        let cancelled = control.is_cancelled();
        let result = BatchResult {
            success: !cancelled,
            cancelled,
            strategy: self.strategy.label().to_string(),
            results,
            started_at,
            elapsed_secs: started.elapsed().as_secs_f64(),
            api_remaining: source.quota().or(external_remaining),
            repaired,
        };
        tracker.report(
            format!(
                "{} succeeded, {} failed of {}",
                result.succeeded(),
                result.failed(),
                result.total()
            ),
            100,
        );
        info!(
            succeeded = result.succeeded(),
            failed = result.failed(),
            elapsed = result.elapsed_secs,
            "batch finished"
        );
        Ok(result)
    }

    async fn run_external(
        &self,
        program: &Utf8PathBuf,
        titles: &[TitleId],
        hints: &HashMap<TitleId, Vec<FileHint>>,
        tracker: &ProgressTracker<'_>,
        control: &BatchControl,
    ) -> Result<(BTreeMap<TitleId, TitleOutcome>, Option<u64>), UnlockError> {
        let repo = self
            .repo_slug
            .clone()
            .ok_or_else(|| UnlockError::External("downloader needs a GitHub repo".to_string()))?;
        let dirs = self.pipeline.installer.dirs();
        let request = ExternalRequest {
            token: self.token.clone(),
            repo,
            app_ids: titles.iter().map(|title| title.to_string()).collect(),
            app_data: titles
                .iter()
                .filter_map(|title| {
                    let hints = hints.get(title).filter(|hints| !hints.is_empty())?;
                    Some((
                        title.to_string(),
                        hints.iter().map(FileHint::to_string).collect(),
                    ))
                })
                .collect(),
            lua_dir: dirs.script_dir.to_string(),
            manifest_dir: dirs.cache_dir.to_string(),
            direct_mode: true,
            manifest_only: false,
        };

        let summary = run_downloader(program, &request, control.token(), |current, total| {
            tracker.step(current as usize, total as usize, format!("{current}/{total}"));
        })
        .await?;

        let mut results = BTreeMap::new();
        for entry in summary.results {
            let Ok(title) = entry.app_id.parse::<TitleId>() else {
                debug!(app_id = entry.app_id, "ignoring unknown id in downloader output");
                continue;
            };
            let mut outcome = TitleOutcome::new(title.clone());
            outcome.success = !entry.needs_repair();
            outcome.scripts_written = entry.lua as usize;
            outcome.data_written = entry.manifest as usize;
            outcome.error = match entry.error.filter(|err| !err.is_empty()) {
                Some(err) => Some(err),
                None if entry.lua == 0 => Some("no script downloaded".to_string()),
                None => None,
            };
            results.insert(title, outcome);
        }
        for title in titles {
            results.entry(title.clone()).or_insert_with(|| {
                TitleOutcome::failed(title.clone(), "missing from downloader output")
            });
        }
        Ok((results, summary.api_remaining))
    }

    async fn run_in_process(
        &self,
        pipeline: &Arc<Pipeline<S, B>>,
        titles: &[TitleId],
        hints: &HashMap<TitleId, Vec<FileHint>>,
        tracker: &ProgressTracker<'_>,
        control: &BatchControl,
    ) -> BTreeMap<TitleId, TitleOutcome> {
        let gate = Arc::new(Semaphore::new(self.task_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for title in titles {
            let pipeline = Arc::clone(pipeline);
            let gate = Arc::clone(&gate);
            let cancel = control.title_token(title);
            let title = title.clone();
            let hints = hints.get(&title).cloned().unwrap_or_default();
            tasks.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return TitleOutcome::failed(title, "cancelled"),
                    permit = gate.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return TitleOutcome::failed(title, "cancelled"),
                    },
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => TitleOutcome::failed(title.clone(), "cancelled"),
                    outcome = pipeline.acquire(&title, &hints) => outcome,
                }
            });
        }

        let total = titles.len();
        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    let label = format!("{}/{} {}", results.len() + 1, total, outcome.title);
                    results.insert(outcome.title.clone(), outcome);
                    tracker.step(results.len(), total, label);
                }
                Err(err) => warn!(error = %err, "title task failed"),
            }
        }
        for title in titles {
            results
                .entry(title.clone())
                .or_insert_with(|| TitleOutcome::failed(title.clone(), "title task failed"));
        }
        results
    }

    async fn run_sequential(
        &self,
        titles: &[TitleId],
        hints: &HashMap<TitleId, Vec<FileHint>>,
        tracker: &ProgressTracker<'_>,
        control: &BatchControl,
    ) -> BTreeMap<TitleId, TitleOutcome> {
        let pipeline = Pipeline {
            resolver: Arc::clone(&self.pipeline.resolver),
            fetcher: ContentFetcher::new(Arc::clone(self.pipeline.fetcher.source()), 1),
            installer: self.pipeline.installer.clone(),
            synthesize: self.pipeline.synthesize,
        };
        let mut results = BTreeMap::new();
        for (index, title) in titles.iter().enumerate() {
            let cancel = control.title_token(title);
            let title_hints = hints.get(title).map(Vec::as_slice).unwrap_or_default();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => TitleOutcome::failed(title.clone(), "cancelled"),
                outcome = pipeline.acquire(title, title_hints) => outcome,
            };
            results.insert(title.clone(), outcome);
            tracker.step(index + 1, titles.len(), format!("{}/{} {title}", index + 1, titles.len()));
        }
        results
    }
}
