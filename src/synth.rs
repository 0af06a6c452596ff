use std::sync::LazyLock;

use regex::Regex;
use tracing::info;

use crate::domain::TitleId;
use crate::error::UnlockError;
use crate::installer::Installer;

static CALL_ARGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:addappid|setManifestid)\s*\(([^)]*)\)").expect("call pattern")
});
static SAFE_ARGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^[a-zA-Z0-9,\s"']+$"#).expect("argument pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthAction {
    Written,
    AlreadyValid,
}

pub fn minimal_script(title: &TitleId) -> String {
    format!("addappid({title})\n")
}

pub fn is_valid_script(content: &str) -> bool {
    CALL_ARGS
        .captures_iter(content)
        .all(|caps| caps.get(1).is_some_and(|args| SAFE_ARGS.is_match(args.as_str())))
}

pub fn declares_title(content: &str, title: &TitleId) -> bool {
    CALL_ARGS.captures_iter(content).any(|caps| {
        let call = caps.get(0).map_or("", |m| m.as_str());
        let first = caps
            .get(1)
            .and_then(|args| args.as_str().split(',').next())
            .map(|arg| arg.trim().trim_matches(['"', '\'']));
        call.starts_with("addappid") && first == Some(title.as_str())
    })
}

pub fn ensure_minimal(installer: &Installer, title: &TitleId) -> Result<SynthAction, UnlockError> {
    if let Some(existing) = installer.read_script(title)
        && is_valid_script(&existing)
        && declares_title(&existing, title)
    {
        return Ok(SynthAction::AlreadyValid);
    }
    installer.install_script(title, minimal_script(title).as_bytes())?;
    info!(title = %title, "synthesized minimal script");
    Ok(SynthAction::Written)
}
