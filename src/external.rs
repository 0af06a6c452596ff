use std::collections::BTreeMap;
use std::io::Write;
use std::process::Stdio;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::UnlockError;

#[derive(Debug, Clone, Serialize)]
pub struct ExternalRequest {
    pub token: String,
    pub repo: String,
    pub app_ids: Vec<String>,
    pub app_data: BTreeMap<String, Vec<String>>,
    pub lua_dir: String,
    pub manifest_dir: String,
    pub direct_mode: bool,
    pub manifest_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExternalTitleResult {
    pub app_id: String,
    #[serde(default)]
    pub lua: u32,
    #[serde(default)]
    pub manifest: u32,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExternalTitleResult {
    pub fn needs_repair(&self) -> bool {
        self.lua == 0 || self.error.as_deref().is_some_and(|err| !err.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExternalSummary {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub results: Vec<ExternalTitleResult>,
    #[serde(default)]
    pub api_remaining: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub total_time_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExternalLine {
    Progress { current: u64, total: u64 },
    DownloadSuccess(String),
    DownloadFail(String),
    Info(String),
    Summary(ExternalSummary),
    Other(String),
}

pub fn parse_line(line: &str) -> ExternalLine {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("[PROGRESS]") {
        let parsed = rest.trim().split_once('/').and_then(|(current, total)| {
            Some((current.trim().parse().ok()?, total.trim().parse().ok()?))
        });
        return match parsed {
            Some((current, total)) => ExternalLine::Progress { current, total },
            None => ExternalLine::Other(line.to_string()),
        };
    }
    if let Some(rest) = line.strip_prefix("[DOWNLOAD_SUCCESS]") {
        return ExternalLine::DownloadSuccess(rest.trim().to_string());
    }
    if let Some(rest) = line.strip_prefix("[DOWNLOAD_FAIL]") {
        return ExternalLine::DownloadFail(rest.trim().to_string());
    }
    if let Some(rest) = line.strip_prefix("[INFO]") {
        return ExternalLine::Info(rest.trim().to_string());
    }
    if line.starts_with('{')
        && let Ok(summary) = serde_json::from_str::<ExternalSummary>(line)
    {
        return ExternalLine::Summary(summary);
    }
    ExternalLine::Other(line.to_string())
}

pub async fn run_downloader(
    program: &Utf8Path,
    request: &ExternalRequest,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(u64, u64) + Send,
) -> Result<ExternalSummary, UnlockError> {
    let config = write_request(request)?;
    let config_path = config.path().to_string_lossy().into_owned();

    let mut child = Command::new(program.as_std_path())
        .arg("-config")
        .arg(&config_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| UnlockError::External(format!("spawn {program}: {err}")))?;
    info!(program = %program, titles = request.app_ids.len(), "external downloader started");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| UnlockError::External("downloader stdout unavailable".to_string()))?;
    let mut lines = BufReader::new(stdout).lines();
    let mut summary = None;

    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                warn!("external downloader cancelled");
                return Err(UnlockError::Cancelled);
            }
            line = lines.next_line() => line,
        };
        let Some(line) = line.map_err(|err| UnlockError::External(err.to_string()))? else {
            break;
        };
        match parse_line(&line) {
            ExternalLine::Progress { current, total } => on_progress(current, total),
            ExternalLine::DownloadSuccess(detail) => debug!(detail, "external download ok"),
            ExternalLine::DownloadFail(detail) => debug!(detail, "external download failed"),
            ExternalLine::Info(detail) => info!(detail, "external downloader"),
            ExternalLine::Summary(parsed) => summary = Some(parsed),
            ExternalLine::Other(text) if !text.is_empty() => debug!(text, "external output"),
            ExternalLine::Other(_) => {}
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|err| UnlockError::External(err.to_string()))?;
    drop(config);
    info!(%status, "external downloader exited");

    let summary =
        summary.ok_or_else(|| UnlockError::External("no summary line in output".to_string()))?;
    if summary.success == Some(false) {
        let message = summary
            .error
            .clone()
            .unwrap_or_else(|| "downloader reported failure".to_string());
        return Err(UnlockError::External(message));
    }
    if !status.success() {
        return Err(UnlockError::External(format!("downloader exited with {status}")));
    }
    Ok(summary)
}

fn write_request(request: &ExternalRequest) -> Result<tempfile::NamedTempFile, UnlockError> {
    let mut file = tempfile::Builder::new()
        .prefix("depot-unlock-request")
        .suffix(".json")
        .tempfile()
        .map_err(|err| UnlockError::Filesystem(err.to_string()))?;
    let body =
        serde_json::to_vec(request).map_err(|err| UnlockError::External(err.to_string()))?;
    file.write_all(&body)
        .and_then(|_| file.flush())
        .map_err(|err| UnlockError::Filesystem(err.to_string()))?;
    Ok(file)
}
