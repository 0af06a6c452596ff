use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::debug;

use crate::domain::{DATA_EXT, TitleId};
use crate::error::UnlockError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepotKey {
    pub depot: String,
    pub key: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Text(String),
    Open,
    Close,
}

fn tokenize(content: &str) -> Result<Vec<Token>, UnlockError> {
    let mut tokens = Vec::new();
    let mut chars = content.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' => tokens.push(Token::Open),
            '}' => tokens.push(Token::Close),
            '"' => {
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => {
                            if let Some(escaped) = chars.next() {
                                text.push(escaped);
                            }
                        }
                        Some(other) => text.push(other),
                        None => {
                            return Err(UnlockError::KeyFile("unterminated string".to_string()));
                        }
                    }
                }
                tokens.push(Token::Text(text));
            }
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
            }
            ch if ch.is_whitespace() => {}
            ch => {
                let mut text = String::from(ch);
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || matches!(next, '{' | '}' | '"') {
                        break;
                    }
                    text.push(next);
                    chars.next();
                }
                tokens.push(Token::Text(text));
            }
        }
    }
    Ok(tokens)
}

fn is_digits(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|ch| ch.is_ascii_digit())
}

fn depot_key(path: &[String], key: String) -> Option<DepotKey> {
    let [.., parent, depot] = path else {
        return None;
    };
    let valid = parent.eq_ignore_ascii_case("depots")
        && is_digits(depot)
        && !key.is_empty()
        && key.chars().all(|ch| ch.is_ascii_alphanumeric());
    valid.then(|| DepotKey {
        depot: depot.clone(),
        key,
    })
}

pub fn parse_depot_keys(content: &str) -> Result<Vec<DepotKey>, UnlockError> {
    let mut path: Vec<String> = Vec::new();
    let mut keys = Vec::new();
    let mut tokens = tokenize(content)?.into_iter();
    while let Some(token) = tokens.next() {
        match token {
            Token::Open => return Err(UnlockError::KeyFile("block without a name".to_string())),
            Token::Close => {
                if path.pop().is_none() {
                    return Err(UnlockError::KeyFile("unbalanced braces".to_string()));
                }
            }
            Token::Text(name) => match tokens.next() {
                Some(Token::Open) => path.push(name),
                Some(Token::Text(value)) => {
                    if name.eq_ignore_ascii_case("DecryptionKey")
                        && let Some(key) = depot_key(&path, value)
                    {
                        keys.push(key);
                    }
                }
                _ => return Err(UnlockError::KeyFile(format!("{name} has no value"))),
            },
        }
    }
    if !path.is_empty() {
        return Err(UnlockError::KeyFile("unbalanced braces".to_string()));
    }
    Ok(keys)
}

fn manifest_order(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

// newest manifest per depot, from `<depot>_<manifest>.manifest` names
pub fn newest_manifests<'a>(names: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, String> {
    let suffix = format!(".{DATA_EXT}");
    let mut newest: BTreeMap<String, String> = BTreeMap::new();
    for name in names {
        let Some((depot, manifest)) = name
            .strip_suffix(&suffix)
            .and_then(|stem| stem.split_once('_'))
        else {
            continue;
        };
        if !is_digits(depot) || !is_digits(manifest) {
            continue;
        }
        let entry = newest
            .entry(depot.to_string())
            .or_insert_with(|| manifest.to_string());
        if manifest_order(manifest, entry) == Ordering::Greater {
            *entry = manifest.to_string();
        }
    }
    newest
}

pub fn keyed_script(
    title: &TitleId,
    keys: &[DepotKey],
    manifests: &BTreeMap<String, String>,
) -> String {
    let mut script = format!("addappid({title}, 1, \"None\")\n");
    for DepotKey { depot, key } in keys {
        script.push_str(&format!("addappid({depot}, 1, \"{key}\")\n"));
        if let Some(manifest) = manifests.get(depot) {
            script.push_str(&format!("setManifestid({depot},\"{manifest}\")\n"));
        }
    }
    script
}

pub fn script_from_key_file<'a>(
    title: &TitleId,
    content: &[u8],
    data_file_names: impl IntoIterator<Item = &'a str>,
) -> Result<Option<String>, UnlockError> {
    let text = std::str::from_utf8(content).map_err(|err| UnlockError::KeyFile(err.to_string()))?;
    let keys = parse_depot_keys(text)?;
    if keys.is_empty() {
        return Ok(None);
    }
    let manifests = newest_manifests(data_file_names);
    debug!(title = %title, depots = keys.len(), manifests = manifests.len(), "script from key file");
    Ok(Some(keyed_script(title, &keys, &manifests)))
}
