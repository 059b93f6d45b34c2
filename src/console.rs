//! Console history and console action log.
//!
//! Both are bounded in-memory sequences with line-oriented persistence. The
//! history holds past input lines; the action log additionally records
//! prompts and output so a reconnecting client can replay what the console
//! looked like.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::Path;

pub const DEFAULT_HISTORY_CAPACITY: usize = 512;
pub const DEFAULT_ACTIONS_CAPACITY: usize = 1000;

/// Redact credential fragments before a line enters history or the action
/// log (e.g. `svn --password hunter2`).
pub fn filter_history_input(input: &str) -> String {
    let Some(start) = input.find("--password") else {
        return input.to_string();
    };
    let mut out = String::with_capacity(input.len());
    out.push_str(&input[..start]);
    out.push_str("--password");
    let rest = &input[start + "--password".len()..];
    let mut chars = rest.char_indices();
    // skip the separator run (spaces or '=') then the secret token
    let mut value_end = rest.len();
    let mut in_value = false;
    for (idx, ch) in chars.by_ref() {
        let is_separator = ch == ' ' || ch == '=';
        if !in_value {
            if is_separator {
                continue;
            }
            in_value = true;
        } else if ch.is_whitespace() {
            value_end = idx;
            break;
        }
    }
    if in_value {
        out.push_str(" XXXXXXXX");
        out.push_str(&rest[value_end..]);
    } else {
        out.push_str(rest);
    }
    out
}

pub struct ConsoleHistory {
    entries: VecDeque<String>,
    capacity: usize,
}

impl Default for ConsoleHistory {
    fn default() -> Self {
        ConsoleHistory::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ConsoleHistory {
    pub fn new(capacity: usize) -> ConsoleHistory {
        ConsoleHistory {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn add(&mut self, entry: &str) {
        if entry.is_empty() {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.to_string());
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn save_to_file(&self, path: &Path) -> io::Result<()> {
        let mut text = String::new();
        for entry in &self.entries {
            text.push_str(&entry.replace('\n', " "));
            text.push('\n');
        }
        fs::write(path, text)
    }

    /// Load entries from `path`, appending to the current contents. A missing
    /// file is the fresh-session case. When `replace` is set the current
    /// contents are dropped first (the interpreter-level `loadhistory`
    /// behavior).
    pub fn load_from_file(&mut self, path: &Path, replace: bool) -> io::Result<()> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        if replace {
            self.entries.clear();
        }
        for line in text.lines() {
            let trimmed = line.trim_end_matches('\r');
            if !trimmed.is_empty() {
                self.add(trimmed);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleActionKind {
    Prompt,
    Input,
    Output,
    OutputError,
}

impl ConsoleActionKind {
    fn tag(self) -> char {
        match self {
            ConsoleActionKind::Prompt => 'P',
            ConsoleActionKind::Input => 'I',
            ConsoleActionKind::Output => 'O',
            ConsoleActionKind::OutputError => 'E',
        }
    }

    fn from_tag(tag: char) -> Option<ConsoleActionKind> {
        match tag {
            'P' => Some(ConsoleActionKind::Prompt),
            'I' => Some(ConsoleActionKind::Input),
            'O' => Some(ConsoleActionKind::Output),
            'E' => Some(ConsoleActionKind::OutputError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleAction {
    pub kind: ConsoleActionKind,
    pub text: String,
}

pub struct ConsoleActions {
    actions: VecDeque<ConsoleAction>,
    capacity: usize,
}

impl Default for ConsoleActions {
    fn default() -> Self {
        ConsoleActions::new(DEFAULT_ACTIONS_CAPACITY)
    }
}

impl ConsoleActions {
    pub fn new(capacity: usize) -> ConsoleActions {
        ConsoleActions {
            actions: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn add(&mut self, kind: ConsoleActionKind, text: &str) {
        if self.actions.len() == self.capacity {
            self.actions.pop_front();
        }
        self.actions.push_back(ConsoleAction {
            kind,
            text: text.to_string(),
        });
    }

    pub fn actions(&self) -> impl Iterator<Item = &ConsoleAction> {
        self.actions.iter()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn save_to_file(&self, path: &Path) -> io::Result<()> {
        let mut text = String::new();
        for action in &self.actions {
            text.push(action.kind.tag());
            text.push(':');
            text.push_str(&action.text.replace('\\', "\\\\").replace('\n', "\\n"));
            text.push('\n');
        }
        fs::write(path, text)
    }

    pub fn load_from_file(&mut self, path: &Path) -> io::Result<()> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        self.actions.clear();
        for line in text.lines() {
            let trimmed = line.trim_end_matches('\r');
            let mut chars = trimmed.chars();
            let Some(tag) = chars.next() else { continue };
            let Some(kind) = ConsoleActionKind::from_tag(tag) else {
                continue;
            };
            if chars.next() != Some(':') {
                continue;
            }
            let body: String = chars.collect();
            self.add(kind, &unescape(&body));
        }
        Ok(())
    }
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
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
