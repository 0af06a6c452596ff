use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;
use tracing::debug;

use crate::config::InstallDirs;
use crate::domain::{FileKind, RemoteFile, TitleId};
use crate::error::UnlockError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallAction {
    Written,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub scripts_written: usize,
    pub data_written: usize,
    pub data_skipped: usize,
    pub script_from_keys: bool,
    pub failures: Vec<String>,
}

impl InstallReport {
    pub fn record_data(&mut self, action: InstallAction) {
        match action {
            InstallAction::Written => self.data_written += 1,
            InstallAction::Skipped => self.data_skipped += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Installer {
    dirs: InstallDirs,
}

impl Installer {
    pub fn new(dirs: InstallDirs) -> Self {
        Self { dirs }
    }

    pub fn dirs(&self) -> &InstallDirs {
        &self.dirs
    }

    pub fn script_path(&self, title: &TitleId) -> Utf8PathBuf {
        self.dirs.script_dir.join(title.script_file_name())
    }

    pub fn disabled_path(&self, title: &TitleId) -> Utf8PathBuf {
        self.dirs.disabled_dir.join(title.script_file_name())
    }

    pub fn data_path(&self, name: &str) -> Result<Utf8PathBuf, UnlockError> {
        Ok(self.dirs.cache_dir.join(plain_file_name(name)?))
    }

    pub fn ensure_dirs(&self) -> Result<(), UnlockError> {
        for dir in [&self.dirs.script_dir, &self.dirs.cache_dir] {
            fs::create_dir_all(dir.as_std_path()).map_err(|err| {
                UnlockError::Filesystem(format!("create {dir}: {err}"))
            })?;
        }
        Ok(())
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.data_path(name)
            .map(|path| path.as_std_path().exists())
            .unwrap_or(false)
    }

    pub fn partition_cached(&self, groups: Vec<Vec<RemoteFile>>) -> (Vec<Vec<RemoteFile>>, usize) {
        let mut pending = Vec::with_capacity(groups.len());
        let mut cached = 0;
        for group in groups {
            let hit = group
                .iter()
                .any(|file| file.kind == FileKind::DataFile && self.is_cached(&file.name));
            if hit {
                cached += 1;
            } else {
                pending.push(group);
            }
        }
        (pending, cached)
    }

    pub fn install_script(
        &self,
        title: &TitleId,
        content: &[u8],
    ) -> Result<InstallAction, UnlockError> {
        let dest = self.script_path(title);
        let temp = write_temp(&self.dirs.script_dir, content)?;
        temp.persist(dest.as_std_path())
            .map_err(|err| UnlockError::Filesystem(format!("persist {dest}: {}", err.error)))?;
        debug!(title = %title, path = %dest, "script installed");
        Ok(InstallAction::Written)
    }

    pub fn install_data_file(
        &self,
        name: &str,
        content: &[u8],
    ) -> Result<InstallAction, UnlockError> {
        let dest = self.data_path(name)?;
        if dest.as_std_path().exists() {
            debug!(file = name, "data-file already cached");
            return Ok(InstallAction::Skipped);
        }
        let temp = write_temp(&self.dirs.cache_dir, content)?;
        match temp.persist_noclobber(dest.as_std_path()) {
            Ok(_) => Ok(InstallAction::Written),
            // lost a race with another writer of the same name
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                Ok(InstallAction::Skipped)
            }
            Err(err) => Err(UnlockError::Filesystem(format!(
                "persist {dest}: {}",
                err.error
            ))),
        }
    }

    pub fn read_script(&self, title: &TitleId) -> Option<String> {
        fs::read_to_string(self.script_path(title).as_std_path()).ok()
    }

    pub fn disable(&self, title: &TitleId) -> Result<bool, UnlockError> {
        move_script(&self.script_path(title), &self.disabled_path(title))
    }

    pub fn enable(&self, title: &TitleId) -> Result<bool, UnlockError> {
        move_script(&self.disabled_path(title), &self.script_path(title))
    }

    // cached data-files are shared and stay
    pub fn remove(&self, title: &TitleId) -> Result<usize, UnlockError> {
        let mut removed = 0;
        for path in [self.script_path(title), self.disabled_path(title)] {
            if remove_if_present(&path)? {
                removed += 1;
            }
        }
        if let Some(applist) = &self.dirs.applist_dir {
            removed += remove_applist_entries(applist, title)?;
        }
        Ok(removed)
    }
}

fn plain_file_name(name: &str) -> Result<&str, UnlockError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.contains(':');
    if invalid {
        return Err(UnlockError::Filesystem(format!(
            "refusing to write unsafe file name {name:?}"
        )));
    }
    Ok(name)
}

fn write_temp(dir: &Utf8Path, content: &[u8]) -> Result<tempfile::NamedTempFile, UnlockError> {
    fs::create_dir_all(dir.as_std_path())
        .map_err(|err| UnlockError::Filesystem(format!("create {dir}: {err}")))?;
    let mut temp = Builder::new()
        .prefix(".depot-unlock")
        .tempfile_in(dir.as_std_path())
        .map_err(|err| UnlockError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| UnlockError::Filesystem(err.to_string()))?;
    Ok(temp)
}

fn move_script(from: &Utf8Path, to: &Utf8Path) -> Result<bool, UnlockError> {
    if !from.as_std_path().is_file() {
        return Ok(false);
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| UnlockError::Filesystem(format!("create {parent}: {err}")))?;
    }
    remove_if_present(to)?;
    fs::rename(from.as_std_path(), to.as_std_path())
        .map_err(|err| UnlockError::Filesystem(format!("move {from} -> {to}: {err}")))?;
    Ok(true)
}

fn remove_if_present(path: &Utf8Path) -> Result<bool, UnlockError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(UnlockError::Filesystem(format!("remove {path}: {err}"))),
    }
}

fn remove_applist_entries(dir: &Utf8Path, title: &TitleId) -> Result<usize, UnlockError> {
    let entries = match fs::read_dir(dir.as_std_path()) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(UnlockError::Filesystem(format!("read {dir}: {err}"))),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(|err| UnlockError::Filesystem(err.to_string()))?;
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "txt") {
            continue;
        }
        let names_title = fs::read_to_string(&path)
            .map(|content| content.trim() == title.as_str())
            .unwrap_or(false);
        if names_title {
            fs::remove_file(&path).map_err(|err| {
                UnlockError::Filesystem(format!("remove {}: {err}", path.display()))
            })?;
            removed += 1;
        }
    }
    Ok(removed)
}
