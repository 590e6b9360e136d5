//! Reading and writing the permissions file.
//!
//! The file is a flat properties file: one `action=names` entry per action, where `names` is
//! the newline-joined list of identities holding the action. Peer trust is stored under the
//! [`PEER_ACTION`](super::PEER_ACTION) pseudo action. Keys and values are escaped the way
//! java-style properties files are, so actions may contain spaces and values may span lines.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

/// separates identity names inside one value
pub(crate) const SEPARATOR: char = '\n';

/// Writes `perms` to `path`, replacing the file atomically. An empty map deletes the file.
pub(crate) fn store(path: &Path, perms: &BTreeMap<String, Vec<String>>) -> io::Result<()> {
    if perms.is_empty() {
        return match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
    }
    let mut text = String::new();
    for (action, names) in perms {
        let value = names.join(&SEPARATOR.to_string());
        text.push_str(&escape(action, true));
        text.push('=');
        text.push_str(&escape(&value, false));
        text.push('\n');
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)
}

/// Reads the permissions file at `path`. A missing file yields `Ok(None)`.
pub(crate) fn load(path: &Path) -> io::Result<Option<Vec<(String, Vec<String>)>>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(Some(
        parse(&text)
            .into_iter()
            .map(|(action, value)| {
                let names = value
                    .split(SEPARATOR)
                    .filter(|n| !n.is_empty())
                    .map(String::from)
                    .collect();
                (action, names)
            })
            .collect(),
    ))
}

/// escapes a key or value so it survives a round trip through [`parse`]
fn escape(s: &str, is_key: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for (i, c) in s.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '=' | ':' | '#' | '!' => {
                out.push('\\');
                out.push(c);
            }
            ' ' if is_key || i == 0 => out.push_str("\\ "),
            _ => out.push(c),
        }
    }
    out
}

/// Parses properties text into `(key, value)` pairs, in file order.
fn parse(text: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    let mut logical = String::new();
    for line in text.lines() {
        // continuation lines drop their leading whitespace too
        let line = line.trim_start();
        if logical.is_empty() && (line.is_empty() || line.starts_with('#') || line.starts_with('!')) {
            continue;
        }
        if ends_with_continuation(line) {
            logical.push_str(&line[..line.len() - 1]);
            continue;
        }
        logical.push_str(line);
        entries.push(split_entry(&logical));
        logical.clear();
    }
    if !logical.is_empty() {
        entries.push(split_entry(&logical));
    }
    entries
}

// a line continues when it ends with an odd number of backslashes
fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|&c| c == '\\').count() % 2 == 1
}

fn split_entry(line: &str) -> (String, String) {
    let mut key = String::new();
    let mut chars = line.chars();
    let mut escaped = false;
    let mut separator = None;
    for c in chars.by_ref() {
        if escaped {
            key.push('\\');
            key.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' | ' ' | '\t' => {
                separator = Some(c);
                break;
            }
            _ => key.push(c),
        }
    }
    let mut rest: String = chars.collect();
    if matches!(separator, Some(' ') | Some('\t')) {
        // whitespace separators may be followed by one '=' or ':'
        let trimmed = rest.trim_start_matches([' ', '\t']);
        let trimmed = trimmed
            .strip_prefix('=')
            .or_else(|| trimmed.strip_prefix(':'))
            .unwrap_or(trimmed);
        rest = trimmed.to_string();
    }
    let rest = rest.trim_start_matches([' ', '\t']);
    (unescape(&key), unescape(rest))
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('f') => out.push('\x0c'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => out.push_str(&hex),
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaped_entries_round_trip() {
        let mut perms = BTreeMap::new();
        perms.insert(
            "ping hello: world".to_string(),
            vec!["CN=a, O=b".to_string(), " leading".to_string()],
        );
        perms.insert("PEER".to_string(), vec!["CN=peer=1".to_string()]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depot.permissions");
        store(&path, &perms).unwrap();

        let loaded: BTreeMap<_, _> = load(&path).unwrap().unwrap().into_iter().collect();
        assert_eq!(loaded, perms);
    }

    #[test]
    fn parses_java_style_files() {
        let text = "#Tue Oct 19 12:00:00 PDT 2026\n\
                    insert=CN\\=a\\nCN\\=b\n\
                    ping  :  CN=c\n\
                    suite = CN=d\\\n    \\nCN=e\n";
        let entries = parse(text);
        assert_eq!(
            entries,
            vec![
                ("insert".to_string(), "CN=a\nCN=b".to_string()),
                ("ping".to_string(), "CN=c".to_string()),
                ("suite".to_string(), "CN=d\nCN=e".to_string()),
            ]
        );
    }

    #[test]
    fn empty_map_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depot.permissions");
        fs::write(&path, "a=b\n").unwrap();
        store(&path, &BTreeMap::new()).unwrap();
        assert!(!path.exists());
        assert!(load(&path).unwrap().is_none());
    }
}
