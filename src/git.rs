use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::UnlockError;

pub async fn run_git(
    cwd: Option<&Path>,
    args: &[&str],
    limit: Duration,
) -> Result<Vec<u8>, UnlockError> {
    let program = find_in_path("git").unwrap_or_else(|| PathBuf::from("git"));
    let mut cmd = Command::new(&program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    debug!(?args, "running git");

    let output = tokio::time::timeout(limit, cmd.output())
        .await
        .map_err(|_| UnlockError::GitTimeout(limit.as_secs()))?
        .map_err(|err| UnlockError::GitCommand(err.to_string()))?;
    if output.status.success() {
        return Ok(output.stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("git {} exited with {}", args.join(" "), output.status)
    } else {
        stderr
    };
    Err(UnlockError::GitCommand(message))
}

pub async fn run_git_text(
    cwd: Option<&Path>,
    args: &[&str],
    limit: Duration,
) -> Result<String, UnlockError> {
    let stdout = run_git(cwd, args, limit).await?;
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.is_file() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}
