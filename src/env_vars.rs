//! Environment variable persistence and the restore deny-list.
//!
//! At suspend time the whole process environment is captured minus an
//! ephemeral exclusion set (session ids, sockets, temp dirs) whose values are
//! only meaningful to the process that wrote them. At restore time a fixed
//! deny-list protects identity and location variables: the hosting launcher
//! re-derives them on every start, so a persisted value must never overwrite
//! a live one.

use std::collections::BTreeMap;
use std::path::Path;

use crate::settings::Settings;

/// Variables whose live value wins over a persisted one whenever the live
/// value is non-empty. These are either re-derived fresh by the launcher on
/// every process start or are process-identity values.
const PROTECTED_ENV_VARS: &[&str] = &[
    // interpreter installation layout
    "R_HOME",
    "R_DOC_DIR",
    "R_INCLUDE_DIR",
    "R_SHARE_DIR",
    // session identity and transport
    "RSTUDIO_SESSION_ROUTE",
    "RSTUDIO_SESSION_PID",
    "RSTUDIO_SESSION_SOCKET",
    "RSTUDIO_PROGRAM_MODE",
    "RSTUDIO_VERSION",
    "RSTUDIO_STANDALONE_PORT",
    "RSTUDIO_SESSION_RSA_PRIVATE_KEY_FILE",
    // per-process scratch space
    "RSTUDIO_SESSION_TMPDIR",
];

/// Validated by filesystem existence rather than non-emptiness: a live value
/// pointing at a missing install is worth replacing.
const PANDOC_ENV_VAR: &str = "RSTUDIO_PANDOC";

/// Read/write view of an environment. The process implementation mutates the
/// real environment; tests use the map implementation so restore policy can
/// be exercised without process-global side effects.
pub trait EnvironmentView {
    fn get(&self, name: &str) -> Option<String>;
    fn set(&mut self, name: &str, value: &str);
    fn snapshot(&self) -> BTreeMap<String, String>;
}

pub struct ProcessEnvironment;

impl EnvironmentView for ProcessEnvironment {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn set(&mut self, name: &str, value: &str) {
        // `std::env::set_var` is `unsafe` in Rust 2024 because mutating
        // process-global environment variables can violate assumptions in
        // other threads / libraries. The session host is single-threaded at
        // every call site that restores environment variables.
        unsafe {
            std::env::set_var(name, value);
        }
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        std::env::vars().collect()
    }
}

#[derive(Default)]
pub struct MapEnvironment {
    values: BTreeMap<String, String>,
}

impl MapEnvironment {
    pub fn new() -> MapEnvironment {
        MapEnvironment::default()
    }

    pub fn with(values: &[(&str, &str)]) -> MapEnvironment {
        let values = values
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        MapEnvironment { values }
    }
}

impl EnvironmentView for MapEnvironment {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }

    fn set(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_string(), value.to_string());
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.clone()
    }
}

/// Capture the environment minus the ephemeral exclusion set into a
/// settings-style file at `file`.
pub fn save(
    env: &dyn EnvironmentView,
    ephemeral_names: &[String],
    file: &Path,
) -> std::io::Result<()> {
    let mut settings = Settings::open(file)?;
    let snapshot = env.snapshot();
    let retained = snapshot
        .iter()
        .filter(|(name, _)| !ephemeral_names.iter().any(|ephemeral| &ephemeral == name))
        .map(|(name, value)| (name.as_str(), value.as_str()));
    settings.set_strings(retained)
}

/// Restore persisted environment variables from `file`, applying the
/// deny-list gate to each one. A missing file means nothing to restore.
pub fn restore(env: &mut dyn EnvironmentView, file: &Path) -> std::io::Result<()> {
    let settings = Settings::open(file)?;
    for (name, value) in settings.entries() {
        set_env_var(env, &name, &value, &|path| Path::new(path).exists());
    }
    Ok(())
}

/// Apply one persisted variable, discarding it when the deny-list says the
/// live value wins. `path_exists` abstracts the filesystem probe used for
/// the pandoc entry so the policy is testable.
pub fn set_env_var(
    env: &mut dyn EnvironmentView,
    name: &str,
    value: &str,
    path_exists: &dyn Fn(&str) -> bool,
) {
    if name == PANDOC_ENV_VAR {
        if let Some(live) = env.get(name)
            && path_exists(&live)
        {
            return;
        }
        env.set(name, value);
        return;
    }

    if PROTECTED_ENV_VARS.contains(&name)
        && let Some(live) = env.get(name)
        && !live.is_empty()
    {
        return;
    }

    env.set(name, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_paths(_: &str) -> bool {
        false
    }

    #[test]
    fn protected_var_keeps_live_value() {
        let mut env = MapEnvironment::with(&[("R_HOME", "/opt/R/live")]);
        set_env_var(&mut env, "R_HOME", "/opt/R/stale", &no_paths);
        assert_eq!(env.get("R_HOME").as_deref(), Some("/opt/R/live"));
    }

    #[test]
    fn protected_var_restored_when_live_value_empty() {
        let mut env = MapEnvironment::with(&[("R_HOME", "")]);
        set_env_var(&mut env, "R_HOME", "/opt/R/saved", &no_paths);
        assert_eq!(env.get("R_HOME").as_deref(), Some("/opt/R/saved"));

        let mut env = MapEnvironment::new();
        set_env_var(&mut env, "R_HOME", "/opt/R/saved", &no_paths);
        assert_eq!(env.get("R_HOME").as_deref(), Some("/opt/R/saved"));
    }

    #[test]
    fn unprotected_var_always_restored() {
        let mut env = MapEnvironment::with(&[("EDITOR", "vi")]);
        set_env_var(&mut env, "EDITOR", "emacs", &no_paths);
        assert_eq!(env.get("EDITOR").as_deref(), Some("emacs"));
    }

    #[test]
    fn pandoc_var_gated_on_path_existence_not_emptiness() {
        // Live value names an existing install: keep it.
        let mut env = MapEnvironment::with(&[("RSTUDIO_PANDOC", "/opt/pandoc")]);
        set_env_var(&mut env, "RSTUDIO_PANDOC", "/stale/pandoc", &|path| {
            path == "/opt/pandoc"
        });
        assert_eq!(env.get("RSTUDIO_PANDOC").as_deref(), Some("/opt/pandoc"));

        // Live value names a missing install: the persisted one wins even
        // though the live value is non-empty.
        let mut env = MapEnvironment::with(&[("RSTUDIO_PANDOC", "/gone/pandoc")]);
        set_env_var(&mut env, "RSTUDIO_PANDOC", "/saved/pandoc", &no_paths);
        assert_eq!(env.get("RSTUDIO_PANDOC").as_deref(), Some("/saved/pandoc"));
    }

    #[test]
    fn save_excludes_ephemeral_names_and_restore_applies_gate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("environment_vars");

        let env = MapEnvironment::with(&[
            ("EDITOR", "vi"),
            ("SESSION_SOCKET", "/tmp/sock.1234"),
            ("R_HOME", "/opt/R/old"),
        ]);
        save(&env, &["SESSION_SOCKET".to_string()], &file).expect("save env vars");

        let mut restored = MapEnvironment::with(&[("R_HOME", "/opt/R/new")]);
        restore(&mut restored, &file).expect("restore env vars");

        assert_eq!(restored.get("EDITOR").as_deref(), Some("vi"));
        assert_eq!(restored.get("SESSION_SOCKET"), None);
        assert_eq!(restored.get("R_HOME").as_deref(), Some("/opt/R/new"));
    }

    #[test]
    fn restore_tolerates_missing_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut env = MapEnvironment::new();
        restore(&mut env, &temp.path().join("environment_vars")).expect("restore");
        assert!(env.snapshot().is_empty());
    }
}
