use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use depot_unlocker::config::{
    Config, ConfigLoader, DEFAULT_DOWNLOAD_CONCURRENCY, DEFAULT_TASK_CONCURRENCY, RepoLocation,
    StrategyPreference,
};
use depot_unlocker::error::UnlockError;

fn base() -> Config {
    Config {
        repo: Some("owner/corpus".to_string()),
        script_dir: Some("/steam/config/stplug-in".to_string()),
        cache_dir: Some("/steam/config/depotcache".to_string()),
        ..Config::default()
    }
}

#[test]
fn defaults_apply_when_unset() {
    let resolved = ConfigLoader::resolve_config(base()).unwrap();

    assert_eq!(resolved.strategy, StrategyPreference::Auto);
    assert_eq!(resolved.download_concurrency, DEFAULT_DOWNLOAD_CONCURRENCY);
    assert_eq!(resolved.task_concurrency, DEFAULT_TASK_CONCURRENCY);
    assert!(resolved.synthesize_fallback);
    assert!(!resolved.fuzzy_branch_match);
    assert_eq!(resolved.auth_token, None);
    assert_eq!(
        resolved.dirs.disabled_dir,
        Utf8PathBuf::from("/steam/config/stplug-in-disabled")
    );
    assert_eq!(resolved.dirs.applist_dir, None);
}

#[test]
fn zero_concurrency_is_rejected() {
    let config = Config {
        task_concurrency: Some(0),
        ..base()
    };
    let err = ConfigLoader::resolve_config(config).unwrap_err();
    assert_matches!(err, UnlockError::InvalidSetting { name, .. } if name == "task_concurrency");
}

#[test]
fn blank_token_counts_as_anonymous() {
    let config = Config {
        auth_token: Some("   ".to_string()),
        ..base()
    };
    assert_eq!(ConfigLoader::resolve_config(config).unwrap().auth_token, None);
}

#[test]
fn missing_destination_is_reported() {
    let config = Config {
        cache_dir: None,
        ..base()
    };
    let err = ConfigLoader::resolve_config(config).unwrap_err();
    assert_matches!(err, UnlockError::MissingSetting(_));
}

#[test]
fn directory_with_git_is_a_local_repo() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join(".git")).unwrap();
    let path = dir.path().to_str().unwrap();

    let location = RepoLocation::parse(path).unwrap();
    assert_eq!(location, RepoLocation::Local(Utf8PathBuf::from(path)));
    assert_eq!(location.slug(), None);
}

#[test]
fn resolve_reads_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("depot-unlock.json");
    std::fs::write(
        &path,
        r#"{
            "repo": "https://github.com/owner/corpus",
            "steam_path": "/games/Steam",
            "strategy": "sequential",
            "download_concurrency": 4
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.repo.slug().as_deref(), Some("owner/corpus"));
    assert_eq!(resolved.strategy, StrategyPreference::Sequential);
    assert_eq!(resolved.download_concurrency, 4);
    assert_eq!(
        resolved.dirs.script_dir,
        Utf8PathBuf::from("/games/Steam/config/stplug-in")
    );
}

#[test]
fn resolve_reports_malformed_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ repo: ").unwrap();

    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, UnlockError::ConfigParse(_));
}

#[test]
fn resolve_reports_unreadable_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, UnlockError::ConfigRead(_));
}
