//! Environment overlays
//!
//! The child's environment is layered: the server process environment, then
//! the server's base overlay (`--env` at startup), then the caller's overlay
//! for this call. Rightmost wins on key collision.

use crate::error::EnvError;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;

/// Split `KEY=VALUE`; entries without a key are ignored
pub fn split_env_kv(kv: &str) -> Option<(&str, &str)> {
    match kv.find('=') {
        Some(i) if i > 0 => Some((&kv[..i], &kv[i + 1..])),
        _ => None,
    }
}

/// Merge the three layers into a key → value map
///
/// The process environment is kept as raw `OsString`s so values that are not
/// UTF-8 reach the child unchanged.
pub fn merge_env_map<S: AsRef<str>>(
    os_env: &[(OsString, OsString)],
    server_base: &[S],
    caller_overlay: &[S],
) -> BTreeMap<OsString, OsString> {
    let mut merged: BTreeMap<OsString, OsString> = os_env.iter().cloned().collect();
    for layer in [server_base, caller_overlay] {
        for kv in layer {
            if let Some((k, v)) = split_env_kv(kv.as_ref()) {
                merged.insert(OsString::from(k), OsString::from(v));
            }
        }
    }
    merged
}

/// Current process environment
pub fn os_environ() -> Vec<(OsString, OsString)> {
    std::env::vars_os().collect()
}

/// Resolve bare-name overlay entries against this process's own environment
///
/// `KEY=VALUE` entries pass through. A bare `KEY` becomes `KEY=<value>`, and
/// fails when `KEY` is unset so the caller can stop before contacting its peer.
pub fn resolve_overlay(entries: &[String], side: &'static str) -> Result<Vec<String>, EnvError> {
    resolve_overlay_with(entries, side, |name| std::env::var(name).ok())
}

pub fn resolve_overlay_with<F>(entries: &[String], side: &'static str, lookup: F) -> Result<Vec<String>, EnvError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut resolved = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.is_empty() {
            return Err(EnvError::EmptyEntry);
        }
        if entry.contains('=') {
            resolved.push(entry.clone());
            continue;
        }
        match lookup(entry) {
            Some(value) => resolved.push(format!("{}={}", entry, value)),
            None => {
                return Err(EnvError::Missing {
                    name: entry.clone(),
                    side,
                })
            }
        }
    }
    Ok(resolved)
}

/// `{"K": "V"}` from a config file → `["K=V"]`, sorted by key
pub fn env_map_to_list(map: &HashMap<String, String>) -> Vec<String> {
    let mut list: Vec<String> = map.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    list.sort();
    list
}

/// Value of `key` in a `KEY=VALUE` list
pub fn lookup<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter()
        .filter_map(|kv| split_env_kv(kv))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}
