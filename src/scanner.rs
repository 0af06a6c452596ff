use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::InstallDirs;
use crate::domain::{InstallState, SCRIPT_EXT, TitleId};
use crate::error::UnlockError;

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub states: BTreeMap<TitleId, InstallState>,
}

impl ScanReport {
    pub fn state_of(&self, title: &TitleId) -> InstallState {
        self.states
            .get(title)
            .copied()
            .unwrap_or(InstallState::NotInstalled)
    }

    pub fn status_for<'a>(
        &self,
        titles: impl IntoIterator<Item = &'a TitleId>,
    ) -> Vec<(TitleId, InstallState)> {
        titles
            .into_iter()
            .map(|title| (title.clone(), self.state_of(title)))
            .collect()
    }

    pub fn pending(&self, titles: &[TitleId]) -> Vec<TitleId> {
        titles
            .iter()
            .filter(|title| self.state_of(title) != InstallState::Active)
            .cloned()
            .collect()
    }

    pub fn count(&self, state: InstallState) -> usize {
        self.states.values().filter(|value| **value == state).count()
    }
}

#[derive(Debug, Clone)]
pub struct StateScanner {
    script_dir: Utf8PathBuf,
    disabled_dir: Utf8PathBuf,
    applist_dir: Option<Utf8PathBuf>,
}

impl StateScanner {
    pub fn new(dirs: &InstallDirs) -> Self {
        Self {
            script_dir: dirs.script_dir.clone(),
            disabled_dir: dirs.disabled_dir.clone(),
            applist_dir: dirs.applist_dir.clone(),
        }
    }

    pub fn scan(&self) -> Result<ScanReport, UnlockError> {
        self.scan_with(DEFAULT_BATCH_SIZE, |_| {}, |_| {})
    }

    pub fn scan_with(
        &self,
        batch_size: usize,
        mut on_batch: impl FnMut(&[(TitleId, InstallState)]),
        mut on_progress: impl FnMut(&str),
    ) -> Result<ScanReport, UnlockError> {
        let mut report = ScanReport::default();
        let mut pending = Vec::with_capacity(batch_size.max(1));
        let mut emit = |report: &mut ScanReport, title: TitleId, state: InstallState| {
            if report.states.contains_key(&title) {
                return;
            }
            report.states.insert(title.clone(), state);
            pending.push((title, state));
            if pending.len() >= batch_size.max(1) {
                on_batch(&pending);
                pending.clear();
            }
        };

        on_progress(&format!("scanning {}", self.script_dir));
        for_each_entry(&self.script_dir, |path| {
            if let Some(title) = script_title(path) {
                emit(&mut report, title, InstallState::Active);
            }
        })?;

        if let Some(applist) = &self.applist_dir {
            on_progress(&format!("scanning {applist}"));
            for_each_entry(applist, |path| {
                if let Some(title) = applist_title(path) {
                    emit(&mut report, title, InstallState::Active);
                }
            })?;
        }

        on_progress(&format!("scanning {}", self.disabled_dir));
        for_each_entry(&self.disabled_dir, |path| {
            if let Some(title) = script_title(path) {
                emit(&mut report, title, InstallState::Disabled);
            }
        })?;

        if !pending.is_empty() {
            on_batch(&pending);
        }
        info!(
            active = report.count(InstallState::Active),
            disabled = report.count(InstallState::Disabled),
            "scan finished"
        );
        Ok(report)
    }
}

fn for_each_entry(dir: &Utf8Path, mut visit: impl FnMut(&Path)) -> Result<(), UnlockError> {
    let entries = match fs::read_dir(dir.as_std_path()) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(dir = %dir, "directory absent, nothing to scan");
            return Ok(());
        }
        Err(err) => return Err(UnlockError::Filesystem(format!("read {dir}: {err}"))),
    };
    for entry in entries {
        let entry = entry.map_err(|err| UnlockError::Filesystem(err.to_string()))?;
        let path = entry.path();
        if path.is_file() {
            visit(&path);
        }
    }
    Ok(())
}

fn script_title(path: &Path) -> Option<TitleId> {
    let ext = path.extension()?.to_str()?;
    if !ext.eq_ignore_ascii_case(SCRIPT_EXT) {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn applist_title(path: &Path) -> Option<TitleId> {
    if path.extension()?.to_str()? != "txt" {
        return None;
    }
    fs::read_to_string(path).ok()?.parse().ok()
}
