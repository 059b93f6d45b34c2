//! Search-path persistence: saving the ordered scope chain and rebuilding
//! it in a fresh interpreter.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::interpreter::{
    AUTOLOADS, BASE_PACKAGE, GLOBAL_ENV, Interpreter, PACKAGE_PREFIX, ScopeKind, TOOLS_SCOPE,
};
use crate::settings::Settings;

/// Serialized global-scope image, at the state-directory root.
pub const GLOBAL_ENVIRONMENT_FILE: &str = "environment";

pub const SEARCH_PATH_DIR: &str = "search_path";
const ELEMENTS_FILE: &str = "search_path_elements";
const PACKAGE_PATHS_FILE: &str = "package_paths";
const ENVIRONMENT_DATA_DIR: &str = "environment_data";

/// Scopes that are never detached during restore reconciliation, even when
/// absent from the saved list. `tools:rstudio` carries the session's own
/// hooks; utils is required by too much tooling to drop mid-session.
pub const PROTECTED_SCOPES: [&str; 2] = [TOOLS_SCOPE, "package:utils"];

/// Serialize just the global scope. Used by the global-env-only arm of the
/// checkpoint policy.
pub fn save_global_environment(state_path: &Path, interp: &dyn Interpreter) -> Result<(), String> {
    interp.save_global_environment(&state_path.join(GLOBAL_ENVIRONMENT_FILE))
}

/// Serialize the global scope plus the full scope chain.
///
/// The ordered name list is bookended by the `.GlobalEnv` and
/// `package:base` sentinels. Package scopes record their install path in a
/// side map; data-bearing scopes serialize their contents to a file named
/// by their 1-based list position. Opaque vendor scopes are unsafe to
/// persist and are skipped outright. Per-scope failures are collected so
/// one bad scope never loses the rest.
pub fn save(state_path: &Path, interp: &dyn Interpreter) -> Result<(), String> {
    let mut errors: Vec<String> = Vec::new();

    if let Err(err) = save_global_environment(state_path, interp) {
        errors.push(format!("error saving global environment: {err}"));
    }

    let dir = state_path.join(SEARCH_PATH_DIR);
    let data_dir = dir.join(ENVIRONMENT_DATA_DIR);
    fs::create_dir_all(&data_dir)
        .map_err(|e| format!("error creating {}: {e}", data_dir.display()))?;

    let mut names: Vec<String> = Vec::new();
    let mut package_paths =
        Settings::open(&dir.join(PACKAGE_PATHS_FILE)).map_err(|e| e.to_string())?;

    for scope in interp.search_path() {
        match scope.kind {
            ScopeKind::Base => break,
            ScopeKind::Opaque => continue,
            _ => {}
        }
        names.push(scope.name.clone());
        let position = names.len();
        match &scope.kind {
            ScopeKind::Package { install_path } => {
                if let Some(path) = install_path
                    && let Err(err) =
                        package_paths.set_string(&scope.name, &path.display().to_string())
                {
                    errors.push(format!(
                        "error recording path for {}: {err}",
                        scope.name
                    ));
                }
            }
            ScopeKind::Data => {
                if scope.name != AUTOLOADS && scope.name != TOOLS_SCOPE {
                    let file = data_dir.join(position.to_string());
                    if let Err(err) = interp.serialize_scope_data(&scope.name, &file) {
                        errors.push(format!("error serializing scope {}: {err}", scope.name));
                    }
                }
            }
            _ => {}
        }
    }
    names.push(BASE_PACKAGE.to_string());

    let mut elements = names.join("\n");
    elements.push('\n');
    fs::write(dir.join(ELEMENTS_FILE), elements)
        .map_err(|e| format!("error writing search path elements: {e}"))?;

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Scopes on the live path but absent from the saved list, minus the
/// protected names and the two sentinels.
pub fn detach_set(current: &[String], saved: &[String]) -> Vec<String> {
    let saved: BTreeSet<&str> = saved.iter().map(String::as_str).collect();
    current
        .iter()
        .filter(|name| {
            !saved.contains(name.as_str())
                && !PROTECTED_SCOPES.contains(&name.as_str())
                && name.as_str() != GLOBAL_ENV
                && name.as_str() != BASE_PACKAGE
                && name.as_str() != AUTOLOADS
        })
        .cloned()
        .collect()
}

/// Rebuild the scope chain saved by `save`.
///
/// The global scope is restored tolerantly (absence is a fresh session).
/// When `compatible` is false the chain reconciliation is skipped entirely:
/// reattaching packages across an interpreter major.minor boundary risks
/// loading binary-incompatible code. Failures are appended to `errors` and
/// never abort the walk.
pub fn restore(
    state_path: &Path,
    interp: &mut dyn Interpreter,
    compatible: bool,
    errors: &mut Vec<String>,
) {
    let global_file = state_path.join(GLOBAL_ENVIRONMENT_FILE);
    if global_file.exists()
        && let Err(err) = interp.restore_global_environment(&global_file)
    {
        errors.push(format!("error restoring global environment: {err}"));
    }

    if !compatible {
        return;
    }

    let dir = state_path.join(SEARCH_PATH_DIR);
    let elements_file = dir.join(ELEMENTS_FILE);
    let saved: Vec<String> = match fs::read_to_string(&elements_file) {
        Ok(contents) => contents.lines().map(str::to_string).collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
        Err(err) => {
            errors.push(format!("error reading search path elements: {err}"));
            return;
        }
    };

    let package_paths = match Settings::open(&dir.join(PACKAGE_PATHS_FILE)) {
        Ok(settings) => settings,
        Err(err) => {
            errors.push(format!("error reading package paths: {err}"));
            return;
        }
    };

    let current: Vec<String> = interp
        .search_path()
        .iter()
        .map(|s| s.name.clone())
        .collect();
    for name in detach_set(&current, &saved) {
        if let Err(err) = interp.detach(&name) {
            errors.push(format!("error detaching {name}: {err}"));
        }
    }

    // Scopes nearer the global environment were attached later, so replay
    // from the far end to reproduce the original relative order. The first
    // and last entries are the sentinels.
    if saved.len() < 2 {
        return;
    }
    let loaded: BTreeSet<String> = interp
        .search_path()
        .iter()
        .map(|s| s.name.clone())
        .collect();
    let data_dir = dir.join(ENVIRONMENT_DATA_DIR);
    for (index, name) in saved[1..saved.len() - 1].iter().enumerate().rev() {
        let position = index + 2; // 1-based position in the full saved list
        if name == AUTOLOADS || name == TOOLS_SCOPE {
            continue;
        }
        if let Some(package) = name.strip_prefix(PACKAGE_PREFIX) {
            if loaded.contains(name) {
                continue;
            }
            let lib = package_paths
                .contains(name)
                .then(|| std::path::PathBuf::from(package_paths.get_string(name, "")));
            if let Err(err) = interp.load_package(package, lib.as_deref()) {
                errors.push(format!("error loading package {package}: {err}"));
            }
        } else {
            let file = data_dir.join(position.to_string());
            if !file.exists() {
                continue;
            }
            if let Err(err) = interp.attach_scope_data(&file, name) {
                errors.push(format!("error attaching {name}: {err}"));
            }
        }
    }
}
