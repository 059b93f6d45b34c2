//! Typed key=value settings file.
//!
//! One flat file per settings store, one `key=value` pair per line. Values
//! are stored as strings; typed getters parse on read and fall back to the
//! supplied default, so a missing or malformed entry never fails a restore.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub struct Settings {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl Settings {
    /// Open a settings store backed by `path`. A missing file is the normal
    /// fresh-session case and yields an empty store.
    pub fn open(path: &Path) -> io::Result<Settings> {
        let values = match fs::read_to_string(path) {
            Ok(text) => parse(&text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err),
        };
        Ok(Settings {
            path: path.to_path_buf(),
            values,
        })
    }

    /// An empty store for `path` without touching the file. Used when the
    /// backing file is unreadable and the caller must carry on without it.
    pub fn empty(path: &Path) -> Settings {
        Settings {
            path: path.to_path_buf(),
            values: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .map(|value| unescape(value))
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key).map(String::as_str) {
            Some("1") | Some("true") => true,
            Some("0") | Some("false") => false,
            _ => default,
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.values
            .get(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_double(&self, key: &str, default: f64) -> f64 {
        self.values
            .get(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }

    pub fn set_string(&mut self, key: &str, value: &str) -> io::Result<()> {
        self.values.insert(key.to_string(), escape(value));
        self.flush()
    }

    /// Insert a batch of values with a single write of the backing file.
    pub fn set_strings<'a, I>(&mut self, entries: I) -> io::Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in entries {
            self.values.insert(key.to_string(), escape(value));
        }
        self.flush()
    }

    pub fn set_bool(&mut self, key: &str, value: bool) -> io::Result<()> {
        self.set_string(key, if value { "1" } else { "0" })
    }

    pub fn set_int(&mut self, key: &str, value: i64) -> io::Result<()> {
        self.set_string(key, &value.to_string())
    }

    pub fn set_double(&mut self, key: &str, value: f64) -> io::Result<()> {
        self.set_string(key, &value.to_string())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// All entries, unescaped, in key order.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(key, value)| (key.clone(), unescape(value)))
            .collect()
    }

    /// Write-through: the file is rewritten on every set so a crash between
    /// sets loses at most the last mutation.
    fn flush(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut text = String::new();
        for (key, value) in &self.values {
            text.push_str(key);
            text.push('=');
            text.push_str(value);
            text.push('\n');
        }
        fs::write(&self.path, text)
    }
}

fn parse(text: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for line in text.lines() {
        let trimmed = line.trim_end_matches('\r');
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = trimmed.split_once('=') {
            values.insert(key.to_string(), value.to_string());
        }
    }
    values
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Render `path` relative to `home` with a leading `~` when possible, so
/// persisted working directories survive a change of home directory.
pub fn alias_path(path: &Path, home: &Path) -> String {
    match path.strip_prefix(home) {
        Ok(relative) if relative.as_os_str().is_empty() => "~".to_string(),
        Ok(relative) => format!("~/{}", relative.display()),
        Err(_) => path.display().to_string(),
    }
}

/// Inverse of [`alias_path`].
pub fn resolve_aliased_path(aliased: &str, home: &Path) -> PathBuf {
    if aliased == "~" {
        return home.to_path_buf();
    }
    if let Some(relative) = aliased.strip_prefix("~/") {
        return home.join(relative);
    }
    PathBuf::from(aliased)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = Settings::open(&temp.path().join("settings")).expect("open");
        assert_eq!(settings.get_int("console_width", 80), 80);
        assert!(!settings.get_bool("dev_mode_on", false));
        assert_eq!(settings.get_string("working_directory", "~"), "~");
    }

    #[test]
    fn typed_values_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("settings");
        {
            let mut settings = Settings::open(&path).expect("open");
            settings.set_int("console_width", 120).expect("set int");
            settings.set_bool("packrat_mode_on", true).expect("set bool");
            settings.set_double("pixel_ratio", 2.0).expect("set double");
            settings
                .set_string("working_directory", "~/projects/demo")
                .expect("set string");
        }
        let settings = Settings::open(&path).expect("reopen");
        assert_eq!(settings.get_int("console_width", 80), 120);
        assert!(settings.get_bool("packrat_mode_on", false));
        assert_eq!(settings.get_double("pixel_ratio", 1.0), 2.0);
        assert_eq!(
            settings.get_string("working_directory", ""),
            "~/projects/demo"
        );
    }

    #[test]
    fn batched_values_persist_with_escaping() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("settings");
        {
            let mut settings = Settings::open(&path).expect("open");
            settings
                .set_strings([("PATH", "/usr/bin"), ("NOTE", "line one\nline two")])
                .expect("set batch");
        }
        let settings = Settings::open(&path).expect("reopen");
        assert_eq!(settings.get_string("PATH", ""), "/usr/bin");
        assert_eq!(settings.get_string("NOTE", ""), "line one\nline two");
    }

    #[test]
    fn values_with_newlines_survive_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("settings");
        let original = "line one\nline two\\with backslash";
        {
            let mut settings = Settings::open(&path).expect("open");
            settings.set_string("note", original).expect("set");
        }
        let settings = Settings::open(&path).expect("reopen");
        assert_eq!(settings.get_string("note", ""), original);
    }

    #[test]
    fn malformed_lines_are_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("settings");
        std::fs::write(&path, "# comment\nno-equals-here\nconsole_width=90\n")
            .expect("seed file");
        let settings = Settings::open(&path).expect("open");
        assert_eq!(settings.get_int("console_width", 80), 90);
        assert!(!settings.contains("no-equals-here"));
    }

    #[test]
    fn alias_path_round_trips_under_home() {
        let home = Path::new("/home/user");
        let inside = Path::new("/home/user/projects/demo");
        let aliased = alias_path(inside, home);
        assert_eq!(aliased, "~/projects/demo");
        assert_eq!(resolve_aliased_path(&aliased, home), inside);

        let outside = Path::new("/srv/data");
        assert_eq!(alias_path(outside, home), "/srv/data");
        assert_eq!(resolve_aliased_path("/srv/data", home), outside);

        assert_eq!(alias_path(home, home), "~");
        assert_eq!(resolve_aliased_path("~", home), home);
    }
}
