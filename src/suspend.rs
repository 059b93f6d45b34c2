//! Suspend/resume orchestration over the state serializer.
//!
//! `suspend` runs the synchronous checkpoint pass; the driver exits the
//! process on success. `restore` runs the cheap synchronous phase and hands
//! back a `DeferredRestore` holding the slow remainder, executed exactly
//! once after the front end reports ready.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use crate::client::{ClientEventQueue, SerializationAction, SerializationStatusScope};
use crate::interpreter::Interpreter;
use crate::restart_context::RestartContext;
use crate::search_path;
use crate::session_state::{
    self, AfterRestartCommand, PLOTS_DIR, PLOTS_FILE, SaveOptions, SessionView,
};

/// Caller-decided policy for one suspend.
#[derive(Debug, Clone, Default)]
pub struct SuspendOptions {
    /// Reduced-fidelity checkpoint: clears the display and skips library
    /// paths, options, and search-path detail.
    pub save_minimal: bool,
    pub save_workspace: bool,
    pub exclude_packages: bool,
    pub server_mode: bool,
    pub packrat_mode_on: bool,
    pub after_restart_command: Option<AfterRestartCommand>,
    pub built_package_path: Option<PathBuf>,
    pub ephemeral_env_var_names: Vec<String>,
}

/// Serialize the session to `state_path`. Returns true when the process
/// should proceed to exit; with `force` set, serialization failure is
/// logged and suspension proceeds anyway, because a forced suspend must
/// never block a host teardown.
pub fn suspend(
    state_path: &Path,
    session: &mut SessionView<'_>,
    queue: &mut ClientEventQueue,
    options: &SuspendOptions,
    disable_save_compression: bool,
    force: bool,
) -> bool {
    // disabling compression is irreversible for the interpreter instance,
    // so it is only permitted on terminal-teardown paths
    debug_assert!(!disable_save_compression || force);

    let _status = SerializationStatusScope::new(queue, SerializationAction::SuspendSession);

    let saved = if options.save_minimal {
        session.display.clear();
        session_state::save_minimal(state_path, session, options.save_workspace)
    } else {
        let save_options = SaveOptions {
            after_restart_command: options.after_restart_command.clone(),
            built_package_path: options.built_package_path.clone(),
            server_mode: options.server_mode,
            exclude_packages: options.exclude_packages,
            disable_save_compression,
            save_global_environment: options.save_workspace,
            packrat_mode_on: options.packrat_mode_on,
            ephemeral_env_var_names: options.ephemeral_env_var_names.clone(),
        };
        session_state::save(state_path, session, &save_options)
    };

    if !saved {
        if !force {
            return false;
        }
        crate::event_log::log(
            "session_suspend_forced_after_save_error",
            serde_json::json!({ "state_path": state_path.display().to_string() }),
        );
    }
    true
}

/// Suspend targeting the restart-context checkpoint path, always forced and
/// with compression disabled: the process is about to be replaced.
pub fn suspend_for_restart(
    scope_path: &Path,
    context_id: &str,
    session: &mut SessionView<'_>,
    queue: &mut ClientEventQueue,
    options: &SuspendOptions,
) -> Result<bool, String> {
    let state_path = RestartContext::create_session_state_path(scope_path, context_id)
        .map_err(|e| format!("error creating restart checkpoint path: {e}"))?;
    Ok(suspend(&state_path, session, queue, options, true, true))
}

/// Everything the deferred phase produced for the caller: restore errors to
/// surface in one batch, and warnings the user should see immediately.
#[derive(Debug, Default)]
pub struct DeferredOutcome {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// The slow remainder of a restore, bound at synchronous-restore time and
/// executed at most once. Consuming `execute` makes the at-most-once
/// guarantee structural.
pub struct DeferredRestore {
    state_path: PathBuf,
    server_mode: bool,
    compatible: bool,
}

impl DeferredRestore {
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn execute(self, session: &mut SessionView<'_>) -> DeferredOutcome {
        let mut outcome = DeferredOutcome::default();

        finish_package_install(&self.state_path, session.interp, &mut outcome);

        let command = session_state::read_after_restart_command(&self.state_path);
        if let Some(command) = command.as_ref().filter(|c| c.eager)
            && let Err(err) = session.interp.eval(&command.command)
        {
            outcome
                .errors
                .push(format!("error running restart command: {err}"));
        }

        search_path::restore(
            &self.state_path,
            session.interp,
            self.compatible,
            &mut outcome.errors,
        );

        if let Some(command) = command.as_ref().filter(|c| !c.eager)
            && let Err(err) = session.interp.eval(&command.command)
        {
            outcome
                .errors
                .push(format!("error running restart command: {err}"));
        }

        let serialized_plots = (!self.server_mode).then(|| self.state_path.join(PLOTS_DIR));
        if let Err(err) = session
            .display
            .restore_state(&self.state_path.join(PLOTS_FILE), serialized_plots.as_deref())
        {
            outcome.errors.push(format!("error restoring plots: {err}"));
        }

        outcome
    }
}

/// Synchronous restore entry point. Returns whether the phase accumulated
/// no errors, the messages themselves, and the deferred remainder.
pub fn restore(
    state_path: &Path,
    server_mode: bool,
    session: &mut SessionView<'_>,
) -> (bool, Vec<String>, DeferredRestore) {
    let outcome = session_state::restore(state_path, session);
    let deferred = DeferredRestore {
        state_path: state_path.to_path_buf(),
        server_mode,
        compatible: outcome.compatible,
    };
    (outcome.success, outcome.error_messages, deferred)
}

/// Move a just-built package from its staging library into the main
/// library. A pre-existing install is renamed aside first and cleaned up
/// only after the move succeeds. When the final move fails (open handles
/// can block renames), the package is left in staging, the staging library
/// is appended to the search path, and the user gets a warning: degraded
/// but functional beats a failed restore.
fn finish_package_install(
    state_path: &Path,
    interp: &mut dyn Interpreter,
    outcome: &mut DeferredOutcome,
) {
    let Some(source) = session_state::read_built_package_path(state_path) else {
        return;
    };
    if !source.is_dir() {
        return;
    }
    let Some(name) = source.file_name().map(|n| n.to_os_string()) else {
        outcome
            .errors
            .push(format!("invalid built package path {}", source.display()));
        return;
    };

    let target_lib = match interp.lib_paths() {
        Ok(paths) => match paths.into_iter().next() {
            Some(lib) => lib,
            None => {
                outcome
                    .errors
                    .push("no library path available for package install".to_string());
                return;
            }
        },
        Err(err) => {
            outcome
                .errors
                .push(format!("error reading library paths: {err}"));
            return;
        }
    };

    let target = target_lib.join(&name);
    let mut backup: Option<PathBuf> = None;
    if target.exists() {
        let aside = target_lib.join(format!(
            ".{}-backup-{}",
            name.to_string_lossy(),
            process::id()
        ));
        match fs::rename(&target, &aside) {
            Ok(()) => backup = Some(aside),
            Err(err) => {
                degrade_to_staging(&source, interp, outcome);
                outcome.warnings.push(format!(
                    "Unable to update package '{}' (the installed copy could not be moved aside: {err}). \
                     The new version was loaded from its build location instead.",
                    name.to_string_lossy()
                ));
                return;
            }
        }
    }

    match fs::rename(&source, &target) {
        Ok(()) => {
            if let Some(backup) = backup
                && let Err(err) = fs::remove_dir_all(&backup)
            {
                // the install already succeeded; cleanup is best-effort
                crate::event_log::log(
                    "package_backup_cleanup_error",
                    serde_json::json!({
                        "backup": backup.display().to_string(),
                        "error": err.to_string(),
                    }),
                );
            }
        }
        Err(err) => {
            if let Some(backup) = backup {
                let _ = fs::rename(&backup, &target);
            }
            degrade_to_staging(&source, interp, outcome);
            outcome.warnings.push(format!(
                "Unable to move package '{}' into the library ({err}). \
                 It was loaded from its build location instead.",
                name.to_string_lossy()
            ));
        }
    }
}

fn degrade_to_staging(
    source: &Path,
    interp: &mut dyn Interpreter,
    outcome: &mut DeferredOutcome,
) {
    if let Some(staging_lib) = source.parent()
        && let Err(err) = interp.append_lib_path(staging_lib)
    {
        outcome
            .errors
            .push(format!("error adding staging library path: {err}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_metrics::ClientMetrics;
    use crate::console::{ConsoleActions, ConsoleHistory};
    use crate::env_vars::MapEnvironment;
    use crate::graphics::Display;
    use crate::testing::{RecordingBackend, ScriptedInterpreter};
    use tempfile::TempDir;

    struct Harness {
        interp: ScriptedInterpreter,
        env: MapEnvironment,
        history: ConsoleHistory,
        actions: ConsoleActions,
        display: Display,
        metrics: ClientMetrics,
        working_directory: PathBuf,
        home: PathBuf,
    }

    impl Harness {
        fn new(scratch: &Path) -> Harness {
            let (backend, _ops) = RecordingBackend::new();
            Harness {
                interp: ScriptedInterpreter::new(),
                env: MapEnvironment::new(),
                history: ConsoleHistory::new(100),
                actions: ConsoleActions::new(100),
                display: Display::new(
                    14,
                    Box::new(backend),
                    scratch.join("plots"),
                    640.0,
                    480.0,
                    1.0,
                )
                .expect("create display"),
                metrics: ClientMetrics::default(),
                working_directory: scratch.to_path_buf(),
                home: scratch.to_path_buf(),
            }
        }

        fn view(&mut self) -> SessionView<'_> {
            SessionView {
                interp: &mut self.interp,
                env: &mut self.env,
                history: &mut self.history,
                actions: &mut self.actions,
                display: &mut self.display,
                metrics: &mut self.metrics,
                working_directory: &mut self.working_directory,
                home_directory: self.home.clone(),
                project_directory: None,
            }
        }
    }

    #[test]
    fn suspend_brackets_with_serialization_events() {
        let scratch = TempDir::new().expect("scratch");
        let state = TempDir::new().expect("state");
        let mut session = Harness::new(scratch.path());
        let mut queue = ClientEventQueue::new();

        assert!(suspend(
            state.path(),
            &mut session.view(),
            &mut queue,
            &SuspendOptions::default(),
            false,
            false,
        ));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn eager_command_runs_before_search_path_restore() {
        let scratch = TempDir::new().expect("scratch");
        let state = TempDir::new().expect("state");
        let mut session = Harness::new(scratch.path());
        let options = SuspendOptions {
            save_workspace: true,
            after_restart_command: Some(AfterRestartCommand::eager("options(warn = 1)")),
            ..SuspendOptions::default()
        };
        let mut queue = ClientEventQueue::new();
        assert!(suspend(
            state.path(),
            &mut session.view(),
            &mut queue,
            &options,
            false,
            false
        ));

        let mut fresh = Harness::new(scratch.path());
        let (ok, errors, deferred) = restore(state.path(), false, &mut fresh.view());
        assert!(ok, "errors: {errors:?}");
        let outcome = deferred.execute(&mut fresh.view());
        assert!(outcome.errors.is_empty(), "errors: {:?}", outcome.errors);
        assert_eq!(fresh.interp.evaluated, vec!["options(warn = 1)".to_string()]);
    }

    #[test]
    fn finish_package_install_moves_build_into_library() {
        let root = TempDir::new().expect("root");
        let state = root.path().join("state");
        let staging = root.path().join("staging");
        let lib = root.path().join("lib");
        fs::create_dir_all(state.join("x")).expect("state dir");
        fs::create_dir_all(staging.join("mypkg")).expect("staging pkg");
        fs::create_dir_all(&lib).expect("lib dir");
        fs::write(staging.join("mypkg/DESCRIPTION"), "Package: mypkg\n").expect("write desc");
        fs::write(
            state.join(session_state::BUILT_PACKAGE_PATH_FILE),
            staging.join("mypkg").display().to_string(),
        )
        .expect("write marker");

        let mut interp = ScriptedInterpreter::new();
        interp.lib_paths.push(lib.clone());
        let mut outcome = DeferredOutcome::default();
        finish_package_install(&state, &mut interp, &mut outcome);
        assert!(outcome.errors.is_empty(), "errors: {:?}", outcome.errors);
        assert!(outcome.warnings.is_empty());
        assert!(lib.join("mypkg/DESCRIPTION").exists());
        assert!(!staging.join("mypkg").exists());
    }

    #[test]
    fn finish_package_install_replaces_existing_install() {
        let root = TempDir::new().expect("root");
        let state = root.path().join("state");
        let staging = root.path().join("staging");
        let lib = root.path().join("lib");
        fs::create_dir_all(&state).expect("state dir");
        fs::create_dir_all(staging.join("mypkg")).expect("staging pkg");
        fs::create_dir_all(lib.join("mypkg")).expect("old install");
        fs::write(staging.join("mypkg/DESCRIPTION"), "Version: 2\n").expect("write new");
        fs::write(lib.join("mypkg/DESCRIPTION"), "Version: 1\n").expect("write old");
        fs::write(
            state.join(session_state::BUILT_PACKAGE_PATH_FILE),
            staging.join("mypkg").display().to_string(),
        )
        .expect("write marker");

        let mut interp = ScriptedInterpreter::new();
        interp.lib_paths.push(lib.clone());
        let mut outcome = DeferredOutcome::default();
        finish_package_install(&state, &mut interp, &mut outcome);
        assert!(outcome.errors.is_empty());
        let desc = fs::read_to_string(lib.join("mypkg/DESCRIPTION")).expect("read desc");
        assert_eq!(desc, "Version: 2\n");
        // the backup of the old install was cleaned up
        let leftovers: Vec<_> = fs::read_dir(&lib)
            .expect("read lib")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n != "mypkg")
            .collect();
        assert!(leftovers.is_empty(), "unexpected leftovers: {leftovers:?}");
    }

    #[test]
    fn missing_build_marker_is_a_no_op() {
        let state = TempDir::new().expect("state");
        let mut interp = ScriptedInterpreter::new();
        let mut outcome = DeferredOutcome::default();
        finish_package_install(state.path(), &mut interp, &mut outcome);
        assert!(outcome.errors.is_empty());
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn forced_suspend_proceeds_past_save_failure() {
        let scratch = TempDir::new().expect("scratch");
        let mut session = Harness::new(scratch.path());
        let mut queue = ClientEventQueue::new();
        // an unwritable state path makes the save fail
        let bad_path = scratch.path().join("not-a-dir");
        fs::write(&bad_path, b"file").expect("write file");

        assert!(!suspend(
            &bad_path,
            &mut session.view(),
            &mut queue,
            &SuspendOptions::default(),
            false,
            false,
        ));
        assert!(suspend(
            &bad_path,
            &mut session.view(),
            &mut queue,
            &SuspendOptions::default(),
            false,
            true,
        ));
    }
}
