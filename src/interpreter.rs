//! The seam between the session host and the embedded interpreter.
//!
//! The interpreter itself is an external collaborator: the host only needs a
//! small host API (evaluate an expression, query/set a few named options,
//! serialize environments) plus enough introspection of the search path to
//! persist and rebuild it. Everything behind this trait is a black box.

use std::path::{Path, PathBuf};

/// Prefix carried by package-type scopes on the search path.
pub const PACKAGE_PREFIX: &str = "package:";

/// Name of the global scope; always first on the search path.
pub const GLOBAL_ENV: &str = ".GlobalEnv";

/// Name of the base scope; always last on the search path.
pub const BASE_PACKAGE: &str = "package:base";

/// Structural placeholder scopes. These are part of every session's search
/// path, are never serialized as data, and are never detached.
pub const AUTOLOADS: &str = "Autoloads";
pub const TOOLS_SCOPE: &str = "tools:rstudio";

#[derive(Debug)]
pub enum EvalError {
    /// The user interrupted evaluation.
    Interrupted,
    /// An "invalid state" error the interpreter has already reported through
    /// its own error mechanism; callers pass these through silently.
    InvalidState(String),
    /// Any other evaluation failure.
    Runtime(String),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalError::Interrupted => write!(f, "evaluation interrupted"),
            EvalError::InvalidState(message) => write!(f, "invalid state: {message}"),
            EvalError::Runtime(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for EvalError {}

/// What kind of entity a search-path scope is. The kind decides whether the
/// scope is persisted as a package reference, as serialized data, or not at
/// all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeKind {
    /// The global evaluation environment (`.GlobalEnv`).
    Global,
    /// A loaded package (`package:<name>`), optionally with a resolved
    /// install path.
    Package { install_path: Option<PathBuf> },
    /// A data environment whose contents can be serialized to a file.
    Data,
    /// A structural placeholder (`Autoloads`, `tools:rstudio`).
    Placeholder,
    /// A vendor-extension scope whose contents are unsafe to persist.
    Opaque,
    /// The base scope (`package:base`).
    Base,
}

/// One named frame on the interpreter's search path.
#[derive(Debug, Clone)]
pub struct Scope {
    pub name: String,
    pub kind: ScopeKind,
}

impl Scope {
    pub fn package(name: impl Into<String>, install_path: Option<PathBuf>) -> Self {
        Scope {
            name: name.into(),
            kind: ScopeKind::Package { install_path },
        }
    }

    pub fn data(name: impl Into<String>) -> Self {
        Scope {
            name: name.into(),
            kind: ScopeKind::Data,
        }
    }

    pub fn is_package(&self) -> bool {
        matches!(self.kind, ScopeKind::Package { .. })
    }
}

/// Host API exposed by the embedded interpreter.
///
/// Methods return `Result<_, String>` in the same spirit as the rest of the
/// session protocol: the message is a human-readable failure description that
/// save/restore orchestration logs and accumulates rather than propagating.
pub trait Interpreter {
    /// Interpreter version string, `major.minor.patch`.
    fn version(&self) -> String;

    /// Version of the graphics engine the interpreter was built against.
    fn graphics_engine_version(&self) -> u32;

    /// Evaluate an expression at top level.
    fn eval(&mut self, code: &str) -> Result<(), EvalError>;

    /// Named interpreter options (e.g. `width`, `prompt`).
    fn get_option(&self, name: &str) -> Option<String>;
    fn set_option(&mut self, name: &str, value: &str) -> Result<(), String>;

    /// The full serialized global-options object, as an opaque blob.
    fn options_blob(&self) -> Result<Vec<u8>, String>;
    fn set_options_blob(&mut self, blob: &[u8]) -> Result<(), String>;

    /// Ordered library search directories.
    fn lib_paths(&self) -> Result<Vec<PathBuf>, String>;
    fn set_lib_paths(&mut self, paths: &[PathBuf]) -> Result<(), String>;
    fn append_lib_path(&mut self, path: &Path) -> Result<(), String>;

    /// The live scope chain, global scope first, base scope last.
    fn search_path(&self) -> Vec<Scope>;

    /// Attach a package by name, optionally from a specific library
    /// directory.
    fn load_package(&mut self, name: &str, lib: Option<&Path>) -> Result<(), String>;

    /// Detach a scope by its search-path name.
    fn detach(&mut self, name: &str) -> Result<(), String>;

    /// Serialize the named scope's data to a file / reattach it from one.
    fn serialize_scope_data(&self, name: &str, file: &Path) -> Result<(), String>;
    fn attach_scope_data(&mut self, file: &Path, name: &str) -> Result<(), String>;

    /// Global environment image save/restore.
    fn save_global_environment(&self, file: &Path) -> Result<(), String>;
    fn restore_global_environment(&mut self, file: &Path) -> Result<(), String>;

    /// Whether the global environment has unsaved changes.
    fn global_environment_dirty(&self) -> bool;

    /// Space/time tradeoff in environment serialization. Disabled only on
    /// terminal-teardown save paths.
    fn set_save_compression(&mut self, enabled: bool);

    /// Development-mode flag (alters library paths while active).
    fn dev_mode_on(&self) -> bool;
    fn set_dev_mode(&mut self, on: bool) -> Result<(), String>;
}

/// Split a version string into its major and minor components.
fn major_minor(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Compatibility gate for restored state: state written by one interpreter
/// version can be fully restored only by an interpreter with the same
/// major.minor version. A mismatch downgrades the restore (library paths and
/// namespace reattachment are skipped) rather than failing it.
pub fn versions_compatible(saved: &str, current: &str) -> bool {
    match (major_minor(saved), major_minor(current)) {
        (Some(saved), Some(current)) => saved == current,
        // An unparseable marker is treated as incompatible; restoring
        // binary-incompatible packages is the riskier failure mode.
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_compatible_requires_major_minor_match() {
        assert!(versions_compatible("4.3.1", "4.3.2"));
        assert!(versions_compatible("4.3.0", "4.3.0"));
        assert!(!versions_compatible("4.3.1", "4.2.1"));
        assert!(!versions_compatible("4.3.1", "5.3.1"));
    }

    #[test]
    fn versions_compatible_rejects_unparseable_markers() {
        assert!(!versions_compatible("", "4.3.1"));
        assert!(!versions_compatible("devel", "4.3.1"));
        assert!(!versions_compatible("4", "4.3.1"));
    }
}
