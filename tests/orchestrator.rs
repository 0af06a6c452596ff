use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use tempfile::TempDir;

use depot_unlocker::config::{Config, ConfigLoader, ResolvedConfig, StrategyPreference};
use depot_unlocker::domain::{FileHint, FileSource, RemoteFile, TitleId};
use depot_unlocker::error::UnlockError;
use depot_unlocker::github::{ContentSource, Listing};
use depot_unlocker::orchestrator::{AcquisitionStrategy, BatchControl, Orchestrator};
use depot_unlocker::progress::NoProgress;
use depot_unlocker::quota::Quota;
use depot_unlocker::resolver::{BranchSource, ResolveMode};

#[derive(Default)]
struct MockSource {
    branches: HashMap<String, Vec<(String, Vec<u8>)>>,
    rate_limited: bool,
    broken_files: HashSet<String>,
    quota: Quota,
}

impl MockSource {
    fn with_branch(mut self, branch: &str, files: &[(&str, &str)]) -> Self {
        let files = files
            .iter()
            .map(|(name, body)| (name.to_string(), body.as_bytes().to_vec()))
            .collect();
        self.branches.insert(branch.to_string(), files);
        self
    }

    fn url(branch: &str, name: &str) -> String {
        format!("mock://{branch}/{name}")
    }
}

#[async_trait]
impl ContentSource for MockSource {
    fn label(&self) -> &str {
        "mock"
    }

    async fn list_files(&self, branch: &str) -> Result<Listing, UnlockError> {
        self.quota.observe(4999);
        if self.rate_limited {
            return Ok(Listing::RateLimited);
        }
        let Some(files) = self.branches.get(branch) else {
            return Ok(Listing::NotFound);
        };
        Ok(Listing::Files(
            files
                .iter()
                .filter_map(|(name, _)| {
                    RemoteFile::new(name.clone(), FileSource::Url(Self::url(branch, name)))
                })
                .collect(),
        ))
    }

    fn direct_file(&self, branch: &str, name: &str) -> Option<RemoteFile> {
        RemoteFile::new(name, FileSource::Url(Self::url(branch, name)))
    }

    async fn fetch(&self, file: &RemoteFile) -> Result<Vec<u8>, UnlockError> {
        let not_found = || UnlockError::GithubStatus {
            status: 404,
            message: file.name.clone(),
        };
        if self.broken_files.contains(&file.name) {
            return Err(UnlockError::GithubHttp("connection reset".to_string()));
        }
        let url = file.download_url().ok_or_else(not_found)?;
        let (branch, name) = url
            .strip_prefix("mock://")
            .and_then(|rest| rest.split_once('/'))
            .ok_or_else(not_found)?;
        self.branches
            .get(branch)
            .and_then(|files| files.iter().find(|(candidate, _)| candidate == name))
            .map(|(_, body)| body.clone())
            .ok_or_else(not_found)
    }

    fn quota(&self) -> Option<u64> {
        self.quota.remaining()
    }

    fn begin_run(&self) {
        self.quota.begin_run();
    }
}

struct StaticBranches {
    names: Vec<String>,
}

impl StaticBranches {
    fn new(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|name| name.to_string()).collect(),
        }
    }
}

#[async_trait]
impl BranchSource for StaticBranches {
    fn mode(&self) -> ResolveMode {
        ResolveMode::Remote
    }

    async fn list_branches(&self) -> Result<Vec<String>, UnlockError> {
        Ok(self.names.clone())
    }
}

fn config_in(dir: &Path, tweak: impl FnOnce(&mut Config)) -> ResolvedConfig {
    let root = Utf8PathBuf::from_path_buf(dir.to_path_buf()).unwrap();
    let mut config = Config {
        repo: Some("owner/corpus".to_string()),
        script_dir: Some(root.join("stplug-in").to_string()),
        cache_dir: Some(root.join("depotcache").to_string()),
        strategy: Some(StrategyPreference::Async),
        ..Config::default()
    };
    tweak(&mut config);
    ConfigLoader::resolve_config(config).unwrap()
}

fn titles(ids: &[&str]) -> Vec<TitleId> {
    ids.iter().map(|id| id.parse().unwrap()).collect()
}

fn title(id: &str) -> TitleId {
    id.parse().unwrap()
}

fn scenario_source() -> MockSource {
    MockSource::default()
        .with_branch("100", &[("100.lua", "addappid(100, 1, \"ab\")\n"), ("5_9.manifest", "data")])
        .with_branch("200x", &[("200.lua", "addappid(200)\n")])
}

fn dir_names(dir: &Path) -> BTreeSet<String> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => BTreeSet::new(),
    }
}

#[tokio::test]
async fn mixed_batch_yields_one_outcome_per_title() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let orchestrator = Orchestrator::new(
        &config,
        scenario_source(),
        StaticBranches::new(&["main", "100", "200x"]),
    );

    let result = orchestrator
        .download_batch(
            titles(&["100", "200", "300"]),
            &HashMap::new(),
            &NoProgress,
            &BatchControl::new(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.total(), 3);
    assert_eq!(result.strategy, "async");
    assert_eq!(result.api_remaining, Some(4999));

    let found = &result.results[&title("100")];
    assert!(found.success);
    assert_eq!(found.scripts_written, 1);
    assert_eq!(found.data_written, 1);
    assert!(!found.synthesized);
    assert_eq!(found.branch.as_deref(), Some("100"));

    for id in ["200", "300"] {
        let outcome = &result.results[&title(id)];
        assert!(outcome.success, "{id} should succeed via synthesis");
        assert_eq!(outcome.scripts_written, 0);
        assert!(outcome.synthesized);
        let script = fs::read_to_string(config.dirs.script_dir.join(format!("{id}.lua"))).unwrap();
        assert_eq!(script, format!("addappid({id})\n"));
    }
    assert!(config.dirs.cache_dir.join("5_9.manifest").exists());
}

#[tokio::test]
async fn second_run_skips_cached_data_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let source = MockSource::default().with_branch(
        "100",
        &[("100.lua", "addappid(100)\n"), ("1_111.manifest", "payload")],
    );
    let orchestrator = Orchestrator::new(&config, source, StaticBranches::new(&["100"]));
    let control = BatchControl::new();

    let first = orchestrator
        .download_batch(titles(&["100"]), &HashMap::new(), &NoProgress, &control)
        .await
        .unwrap();
    assert_eq!(first.results[&title("100")].data_written, 1);

    let second = orchestrator
        .download_batch(titles(&["100"]), &HashMap::new(), &NoProgress, &control)
        .await
        .unwrap();
    let outcome = &second.results[&title("100")];
    assert_eq!(outcome.data_written, 0);
    assert_eq!(outcome.data_skipped, 1);
    assert_eq!(outcome.scripts_written, 1);
    assert_eq!(
        fs::read_to_string(config.dirs.cache_dir.join("1_111.manifest")).unwrap(),
        "payload"
    );
}

#[tokio::test]
async fn remote_script_replaces_existing_one() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    fs::create_dir_all(&config.dirs.script_dir).unwrap();
    fs::write(config.dirs.script_dir.join("100.lua"), "old").unwrap();

    let source = MockSource::default().with_branch("100", &[("100.lua", "addappid(100, 1)\n")]);
    let orchestrator = Orchestrator::new(&config, source, StaticBranches::new(&["100"]));
    orchestrator
        .download_batch(titles(&["100"]), &HashMap::new(), &NoProgress, &BatchControl::new())
        .await
        .unwrap();

    assert_eq!(
        fs::read_to_string(config.dirs.script_dir.join("100.lua")).unwrap(),
        "addappid(100, 1)\n"
    );
    assert_eq!(
        dir_names(config.dirs.script_dir.as_std_path()),
        BTreeSet::from(["100.lua".to_string()])
    );
}

#[tokio::test]
async fn outcomes_do_not_depend_on_order_or_concurrency() {
    let order_a = titles(&["100", "200", "300", "400"]);
    let order_b = titles(&["400", "300", "200", "100"]);
    let mut snapshots = Vec::new();

    for (order, limit) in [(order_a, 1), (order_b, 8)] {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), |config| config.task_concurrency = Some(limit));
        let source = scenario_source().with_branch(
            "400",
            &[("depots.lua", "addappid(400)\n"), ("7_8.manifest", "x")],
        );
        let orchestrator =
            Orchestrator::new(&config, source, StaticBranches::new(&["100", "200x", "400"]));
        let result = orchestrator
            .download_batch(order, &HashMap::new(), &NoProgress, &BatchControl::new())
            .await
            .unwrap();

        let outcomes: Vec<_> = result
            .results
            .values()
            .map(|o| (o.title.clone(), o.success, o.scripts_written, o.data_written, o.synthesized))
            .collect();
        let files = (
            dir_names(config.dirs.script_dir.as_std_path()),
            dir_names(config.dirs.cache_dir.as_std_path()),
        );
        snapshots.push((outcomes, files));
    }
    assert_eq!(snapshots[0], snapshots[1]);
}

#[tokio::test]
async fn rate_limited_listing_falls_back_to_guessed_names() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let mut source = MockSource::default().with_branch(
        "100",
        &[("depots.lua", "addappid(100)\n"), ("5_9.manifest", "m"), ("6_7.manifest", "n")],
    );
    source.rate_limited = true;
    let orchestrator = Orchestrator::new(&config, source, StaticBranches::new(&["100"]));
    let hints = HashMap::from([(title("100"), vec!["5_9".parse::<FileHint>().unwrap()])]);

    let result = orchestrator
        .download_batch(titles(&["100"]), &hints, &NoProgress, &BatchControl::new())
        .await
        .unwrap();

    let outcome = &result.results[&title("100")];
    assert!(outcome.success);
    assert_eq!(outcome.scripts_written, 1);
    assert_eq!(outcome.data_written, 1);
    assert_eq!(
        fs::read_to_string(config.dirs.script_dir.join("100.lua")).unwrap(),
        "addappid(100)\n"
    );
    assert_eq!(
        dir_names(config.dirs.cache_dir.as_std_path()),
        BTreeSet::from(["5_9.manifest".to_string()])
    );
}

#[tokio::test]
async fn hints_restrict_listed_data_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let source = MockSource::default().with_branch(
        "100",
        &[("100.lua", "addappid(100)\n"), ("5_9.manifest", "m"), ("6_7.manifest", "n")],
    );
    let orchestrator = Orchestrator::new(&config, source, StaticBranches::new(&["100"]));
    let hints = HashMap::from([(title("100"), vec!["6_7".parse::<FileHint>().unwrap()])]);

    orchestrator
        .download_batch(titles(&["100"]), &hints, &NoProgress, &BatchControl::new())
        .await
        .unwrap();

    assert_eq!(
        dir_names(config.dirs.cache_dir.as_std_path()),
        BTreeSet::from(["6_7.manifest".to_string()])
    );
}

#[tokio::test]
async fn failed_data_download_does_not_sink_the_title() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let mut source = MockSource::default().with_branch(
        "100",
        &[("100.lua", "addappid(100)\n"), ("5_9.manifest", "m"), ("6_7.manifest", "n")],
    );
    source.broken_files.insert("5_9.manifest".to_string());
    let orchestrator = Orchestrator::new(&config, source, StaticBranches::new(&["100"]));

    let result = orchestrator
        .download_batch(titles(&["100"]), &HashMap::new(), &NoProgress, &BatchControl::new())
        .await
        .unwrap();

    let outcome = &result.results[&title("100")];
    assert!(outcome.success);
    assert_eq!(outcome.scripts_written, 1);
    assert_eq!(outcome.data_written, 1);
    assert!(config.dirs.cache_dir.join("6_7.manifest").exists());
}

#[tokio::test]
async fn duplicate_titles_are_processed_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let orchestrator =
        Orchestrator::new(&config, scenario_source(), StaticBranches::new(&["100"]));

    let result = orchestrator
        .download_batch(
            titles(&["100", "100", "100"]),
            &HashMap::new(),
            &NoProgress,
            &BatchControl::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.total(), 1);
}

#[tokio::test]
async fn synthesis_can_be_turned_off() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |config| config.synthesize_fallback = Some(false));
    let orchestrator =
        Orchestrator::new(&config, scenario_source(), StaticBranches::new(&["100"]));

    let result = orchestrator
        .download_batch(titles(&["300"]), &HashMap::new(), &NoProgress, &BatchControl::new())
        .await
        .unwrap();

    let outcome = &result.results[&title("300")];
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("no matching branch"));
    assert!(!config.dirs.script_dir.join("300.lua").exists());
    assert_eq!(result.failed(), 1);
}

#[tokio::test]
async fn cancelling_one_title_keeps_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let orchestrator =
        Orchestrator::new(&config, scenario_source(), StaticBranches::new(&["100"]));
    let control = BatchControl::new();
    control.cancel_title(&title("300"));

    let result = orchestrator
        .download_batch(titles(&["100", "300"]), &HashMap::new(), &NoProgress, &control)
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.results[&title("100")].success);
    let cancelled = &result.results[&title("300")];
    assert!(!cancelled.success);
    assert_eq!(cancelled.error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn cancelled_batch_still_reports_every_title() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let orchestrator =
        Orchestrator::new(&config, scenario_source(), StaticBranches::new(&["100"]));
    let control = BatchControl::new();
    control.cancel_all();

    let result = orchestrator
        .download_batch(titles(&["100", "200"]), &HashMap::new(), &NoProgress, &control)
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.cancelled);
    assert_eq!(result.total(), 2);
}

#[tokio::test]
async fn sequential_strategy_matches_async_results() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |config| {
        config.strategy = Some(StrategyPreference::Sequential)
    });
    let orchestrator = Orchestrator::new(
        &config,
        scenario_source(),
        StaticBranches::new(&["100", "200x"]),
    );
    assert_eq!(orchestrator.strategy(), &AcquisitionStrategy::Sequential);

    let result = orchestrator
        .download_batch(
            titles(&["300", "100"]),
            &HashMap::new(),
            &NoProgress,
            &BatchControl::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.strategy, "sequential");
    assert_eq!(result.succeeded(), 2);
    assert_eq!(result.results[&title("100")].data_written, 1);
}

#[tokio::test]
async fn broken_downloader_falls_back_to_in_process() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let missing = Utf8PathBuf::from_path_buf(dir.path().join("no-such-downloader")).unwrap();
    let orchestrator = Orchestrator::new(
        &config,
        scenario_source(),
        StaticBranches::new(&["100"]),
    )
    .with_strategy(AcquisitionStrategy::ExternalProcess(missing));

    let result = orchestrator
        .download_batch(
            titles(&["100", "300"]),
            &HashMap::new(),
            &NoProgress,
            &BatchControl::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.strategy, "external");
    assert_eq!(result.total(), 2);
    assert_eq!(result.results[&title("100")].scripts_written, 1);
    assert!(result.results[&title("300")].synthesized);
}

#[tokio::test]
async fn uncreatable_destination_is_a_setup_error() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    fs::write(&blocker, "not a dir").unwrap();
    let config = config_in(dir.path(), |config| {
        config.script_dir = Some(blocker.join("stplug-in").to_string_lossy().into_owned());
    });
    let orchestrator =
        Orchestrator::new(&config, scenario_source(), StaticBranches::new(&["100"]));

    let err = orchestrator
        .download_batch(titles(&["100"]), &HashMap::new(), &NoProgress, &BatchControl::new())
        .await
        .unwrap_err();
    assert!(matches!(err, UnlockError::Filesystem(_)));
}

#[tokio::test]
async fn progress_ends_at_one_hundred() {
    let dir: TempDir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let orchestrator =
        Orchestrator::new(&config, scenario_source(), StaticBranches::new(&["100"]));
    let seen = std::sync::Mutex::new(Vec::new());
    let sink = |message: &str, percent: i32| seen.lock().unwrap().push((message.to_string(), percent));

    orchestrator
        .download_batch(titles(&["100", "300"]), &HashMap::new(), &sink, &BatchControl::new())
        .await
        .unwrap();

    let events = seen.into_inner().unwrap();
    assert_eq!(events.first().map(|(_, percent)| *percent), Some(0));
    assert_eq!(events.last().map(|(_, percent)| *percent), Some(100));
}

#[tokio::test]
async fn quota_is_not_carried_between_batches() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let orchestrator =
        Orchestrator::new(&config, scenario_source(), StaticBranches::new(&["100"]));
    let control = BatchControl::new();

    let first = orchestrator
        .download_batch(titles(&["100"]), &HashMap::new(), &NoProgress, &control)
        .await
        .unwrap();
    assert_eq!(first.api_remaining, Some(4999));

    // no branch, so no API call in this run
    let second = orchestrator
        .download_batch(titles(&["300"]), &HashMap::new(), &NoProgress, &control)
        .await
        .unwrap();
    assert_eq!(second.api_remaining, None);
}

#[tokio::test]
async fn guessed_bare_manifest_keeps_the_depot_in_its_name() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let mut source = MockSource::default().with_branch(
        "100",
        &[("100.lua", "addappid(100)\n"), ("9.manifest", "m")],
    );
    source.rate_limited = true;
    let orchestrator = Orchestrator::new(&config, source, StaticBranches::new(&["100"]));
    let hints = HashMap::from([(title("100"), vec!["5_9".parse::<FileHint>().unwrap()])]);

    let result = orchestrator
        .download_batch(titles(&["100"]), &hints, &NoProgress, &BatchControl::new())
        .await
        .unwrap();

    assert_eq!(result.results[&title("100")].data_written, 1);
    assert_eq!(
        dir_names(config.dirs.cache_dir.as_std_path()),
        BTreeSet::from(["5_9.manifest".to_string()])
    );
    assert_eq!(
        fs::read_to_string(config.dirs.cache_dir.join("5_9.manifest")).unwrap(),
        "m"
    );
}

const KEY_VDF: &str = r#""depots"
{
    "5"
    {
        "DecryptionKey" "abc123"
    }
    "6"
    {
        "DecryptionKey" "def456"
    }
}
"#;

#[tokio::test]
async fn key_file_builds_the_script_when_none_is_published() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let source = MockSource::default().with_branch(
        "100",
        &[
            ("key.vdf", KEY_VDF),
            ("5_9.manifest", "old"),
            ("5_12.manifest", "new"),
        ],
    );
    let orchestrator = Orchestrator::new(&config, source, StaticBranches::new(&["100"]));

    let result = orchestrator
        .download_batch(titles(&["100"]), &HashMap::new(), &NoProgress, &BatchControl::new())
        .await
        .unwrap();

    let outcome = &result.results[&title("100")];
    assert!(outcome.success);
    assert!(!outcome.synthesized);
    assert_eq!(outcome.scripts_written, 1);
    assert_eq!(outcome.data_written, 2);
    assert_eq!(outcome.note.as_deref(), Some("script generated from key.vdf"));
    assert_eq!(
        fs::read_to_string(config.dirs.script_dir.join("100.lua")).unwrap(),
        "addappid(100, 1, \"None\")\n\
         addappid(5, 1, \"abc123\")\n\
         setManifestid(5,\"12\")\n\
         addappid(6, 1, \"def456\")\n"
    );
}

#[tokio::test]
async fn published_script_wins_over_key_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let source = MockSource::default().with_branch(
        "100",
        &[("100.lua", "addappid(100, 1, \"ff\")\n"), ("key.vdf", KEY_VDF)],
    );
    let orchestrator = Orchestrator::new(&config, source, StaticBranches::new(&["100"]));

    let result = orchestrator
        .download_batch(titles(&["100"]), &HashMap::new(), &NoProgress, &BatchControl::new())
        .await
        .unwrap();

    assert_eq!(result.results[&title("100")].note, None);
    assert_eq!(
        fs::read_to_string(config.dirs.script_dir.join("100.lua")).unwrap(),
        "addappid(100, 1, \"ff\")\n"
    );
}

#[tokio::test]
async fn unusable_key_file_falls_back_to_minimal_script() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let source = MockSource::default().with_branch("100", &[("key.vdf", "\"depots\" {")]);
    let orchestrator = Orchestrator::new(&config, source, StaticBranches::new(&["100"]));

    let result = orchestrator
        .download_batch(titles(&["100"]), &HashMap::new(), &NoProgress, &BatchControl::new())
        .await
        .unwrap();

    let outcome = &result.results[&title("100")];
    assert!(outcome.success);
    assert!(outcome.synthesized);
    assert_eq!(
        fs::read_to_string(config.dirs.script_dir.join("100.lua")).unwrap(),
        "addappid(100)\n"
    );
}

#[cfg(unix)]
fn fake_downloader(dir: &Path, body: &str) -> Utf8PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("downloader");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    Utf8PathBuf::from_path_buf(path).unwrap()
}

#[cfg(unix)]
#[tokio::test]
async fn external_failures_get_one_repair_pass() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let summary = r#"{"success":true,"results":[{"app_id":"100","lua":1,"manifest":0},{"app_id":"300","lua":0,"manifest":0,"error":"404"}],"api_remaining":77}"#;
    let program = fake_downloader(
        dir.path(),
        &format!("echo '[PROGRESS] 1/2'\necho '[PROGRESS] 2/2'\necho '{summary}'"),
    );
    let orchestrator =
        Orchestrator::new(&config, scenario_source(), StaticBranches::new(&["100", "200x"]))
            .with_strategy(AcquisitionStrategy::ExternalProcess(program));
    let seen = std::sync::Mutex::new(Vec::new());
    let sink = |message: &str, _percent: i32| seen.lock().unwrap().push(message.to_string());

    let result = orchestrator
        .download_batch(titles(&["100", "300"]), &HashMap::new(), &sink, &BatchControl::new())
        .await
        .unwrap();

    assert_eq!(result.strategy, "external");
    assert_eq!(result.repaired, 1);
    assert_eq!(result.api_remaining, Some(77));
    assert_eq!(result.succeeded(), 2);

    let reported = &result.results[&title("100")];
    assert_eq!(reported.scripts_written, 1);
    assert!(!reported.synthesized);
    // the downloader stands in for the install, so only the repaired title touched disk
    assert!(!config.dirs.script_dir.join("100.lua").exists());
    assert!(result.results[&title("300")].synthesized);
    assert!(config.dirs.script_dir.join("300.lua").exists());

    let messages = seen.into_inner().unwrap();
    assert!(messages.iter().any(|message| message == "2/2"));
}

#[cfg(unix)]
#[tokio::test]
async fn cancelled_downloader_leaves_no_request_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), |_| {});
    let marker = dir.path().join("request-path");
    let program = fake_downloader(
        dir.path(),
        &format!(
            "echo \"$2\" > {0}.tmp\nmv {0}.tmp {0}\nexec sleep 30",
            marker.display()
        ),
    );
    let orchestrator =
        Orchestrator::new(&config, scenario_source(), StaticBranches::new(&["100"]))
            .with_strategy(AcquisitionStrategy::ExternalProcess(program));
    let control = BatchControl::new();

    let cancel_once_started = async {
        while !marker.exists() {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        control.cancel_all();
    };
    let overrides = HashMap::new();
    let (result, ()) = tokio::join!(
        orchestrator.download_batch(titles(&["100"]), &overrides, &NoProgress, &control),
        cancel_once_started
    );
    let result = result.unwrap();

    assert!(result.cancelled);
    assert_eq!(
        result.results[&title("100")].error.as_deref(),
        Some("cancelled")
    );
    let request_path = fs::read_to_string(&marker).unwrap();
    assert!(!Path::new(request_path.trim()).exists());
}
