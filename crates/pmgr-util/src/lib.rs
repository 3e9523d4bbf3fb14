use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::Serialize;

pub const DATA_DIR_ENV: &str = "PMGR_DATA_DIR";

pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return expand_user(dir.trim());
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share/pmgr")
    } else {
        PathBuf::from("/tmp/pmgr")
    }
}

pub fn state_dir() -> PathBuf {
    data_dir().join("state")
}

pub fn state_file_path(file_name: &str) -> PathBuf {
    state_dir().join(file_name)
}

pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            let rest = path.strip_prefix("~/").unwrap_or("");
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Makes `segment` safe to embed in a file name.
///
/// ASCII alphanumerics and `-_.` are kept, whitespace becomes `_`, quotes are
/// dropped and anything else becomes `_`. Runs of `_` or `-` collapse to one
/// and leading/trailing separators are trimmed.
pub fn sanitize_filename(segment: &str) -> String {
    let mut raw = String::with_capacity(segment.len());
    for ch in segment.chars() {
        match ch {
            '0'..='9' | 'a'..='z' | 'A'..='Z' | '-' | '_' | '.' => raw.push(ch),
            '\'' | '"' | '`' => {}
            c if c.is_whitespace() => raw.push('_'),
            _ => raw.push('_'),
        }
    }

    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if (ch == '_' || ch == '-') && out.ends_with(ch) {
            continue;
        }
        out.push(ch);
    }
    out.trim_matches(|c| c == '_' || c == '-').to_string()
}

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_filename_replaces_and_collapses() {
        assert_eq!(sanitize_filename("My App  v1.2"), "My_App_v1.2");
        assert_eq!(sanitize_filename("it's \"quoted\""), "its_quoted");
        assert_eq!(sanitize_filename("--a/b:c--"), "a_b_c");
        assert_eq!(sanitize_filename("a---b___c"), "a-b_c");
        assert_eq!(sanitize_filename(""), "");
    }

    #[test]
    fn write_json_atomic_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();
        write_json_atomic(&path, &vec![4]).unwrap();

        let data = fs::read_to_string(&path).unwrap();
        let parsed: Vec<i32> = serde_json::from_str(&data).unwrap();
        assert_eq!(parsed, vec![4]);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn expand_user_leaves_plain_paths() {
        assert_eq!(expand_user("/var/tmp"), PathBuf::from("/var/tmp"));
    }
}
