//! End-to-end suspend/resume: a populated session is checkpointed to disk
//! and a completely fresh set of components is rebuilt from it.

use std::fs;
use std::path::{Path, PathBuf};

use repl_host::client::ClientEventQueue;
use repl_host::client_metrics::ClientMetrics;
use repl_host::console::{ConsoleActions, ConsoleHistory};
use repl_host::env_vars::{EnvironmentView, MapEnvironment};
use repl_host::graphics::Display;
use repl_host::interpreter::Interpreter;
use repl_host::session_state::{self, AfterRestartCommand, SessionView};
use repl_host::suspend::{self, SuspendOptions};
use repl_host::testing::{RecordingBackend, ScriptedInterpreter};
use tempfile::TempDir;

struct Components {
    interp: ScriptedInterpreter,
    env: MapEnvironment,
    history: ConsoleHistory,
    actions: ConsoleActions,
    display: Display,
    metrics: ClientMetrics,
    working_directory: PathBuf,
    home: PathBuf,
}

impl Components {
    fn new(scratch: &Path, plots_dir: &str) -> Components {
        let (backend, _ops) = RecordingBackend::new();
        Components {
            interp: ScriptedInterpreter::new(),
            env: MapEnvironment::new(),
            history: ConsoleHistory::new(100),
            actions: ConsoleActions::new(100),
            display: Display::new(
                14,
                Box::new(backend),
                scratch.join(plots_dir),
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
fn suspended_session_rebuilds_in_fresh_components() {
    let scratch = TempDir::new().expect("scratch");
    let state = scratch.path().join("state");

    let mut original = Components::new(scratch.path(), "plots-a");
    original.metrics.console_width = 120;
    original.history.add("x <- rnorm(100)");
    original.history.add("summary(x)");
    original.history.add("hist(x)");
    original.env.set("ROUNDTRIP_MARKER", "kept");
    original
        .interp
        .load_package("stats", None)
        .expect("load stats");
    original
        .interp
        .load_package("graphics", None)
        .expect("load graphics");
    original
        .interp
        .global_env
        .insert("x".to_string(), "numeric(100)".to_string());
    let original_scopes = original.interp.scope_names();

    let options = SuspendOptions {
        save_workspace: true,
        after_restart_command: Some(AfterRestartCommand::deferred("message('back')")),
        ..SuspendOptions::default()
    };
    let mut queue = ClientEventQueue::new();
    assert!(suspend::suspend(
        &state,
        &mut original.view(),
        &mut queue,
        &options,
        false,
        false,
    ));

    let mut fresh = Components::new(scratch.path(), "plots-b");
    let (ok, errors, deferred) = suspend::restore(&state, false, &mut fresh.view());
    assert!(ok, "restore errors: {errors:?}");

    // synchronous phase: metrics, history, environment variables
    assert_eq!(fresh.metrics.console_width, 120);
    assert_eq!(fresh.interp.get_option("width").as_deref(), Some("120"));
    let entries: Vec<&str> = fresh.history.entries().collect();
    assert_eq!(entries, vec!["x <- rnorm(100)", "summary(x)", "hist(x)"]);
    assert_eq!(fresh.env.get("ROUNDTRIP_MARKER").as_deref(), Some("kept"));

    // deferred phase: search path, workspace, restart command
    let outcome = deferred.execute(&mut fresh.view());
    assert!(outcome.errors.is_empty(), "errors: {:?}", outcome.errors);
    assert_eq!(fresh.interp.scope_names(), original_scopes);
    assert_eq!(
        fresh.interp.global_env.get("x").map(String::as_str),
        Some("numeric(100)")
    );
    assert!(
        fresh
            .interp
            .evaluated
            .contains(&"message('back')".to_string())
    );
}

#[test]
fn version_downgrade_skips_search_path_and_lib_paths() {
    let scratch = TempDir::new().expect("scratch");
    let state = scratch.path().join("state");

    let mut original = Components::new(scratch.path(), "plots-a");
    original.history.add("library(stats)");
    original
        .interp
        .lib_paths
        .push(scratch.path().join("library"));
    original
        .interp
        .load_package("stats", None)
        .expect("load stats");

    let mut queue = ClientEventQueue::new();
    assert!(suspend::suspend(
        &state,
        &mut original.view(),
        &mut queue,
        &SuspendOptions {
            save_workspace: false,
            ..SuspendOptions::default()
        },
        false,
        false,
    ));

    // the checkpoint claims a newer interpreter than the one restoring
    fs::write(state.join("rversion"), "9.9.9").expect("tamper version");

    let mut fresh = Components::new(scratch.path(), "plots-b");
    let fresh_default_scopes = fresh.interp.scope_names();
    let (_ok, _errors, deferred) = suspend::restore(&state, false, &mut fresh.view());

    // interpreter-version-coupled state stays untouched
    assert!(fresh.interp.lib_paths.is_empty());
    let outcome = deferred.execute(&mut fresh.view());
    assert!(outcome.errors.is_empty(), "errors: {:?}", outcome.errors);
    assert_eq!(fresh.interp.scope_names(), fresh_default_scopes);

    // version-independent state is still recovered
    let entries: Vec<&str> = fresh.history.entries().collect();
    assert_eq!(entries, vec!["library(stats)"]);
}

#[test]
fn minimal_checkpoint_omits_session_detail() {
    let scratch = TempDir::new().expect("scratch");
    let state = scratch.path().join("state");

    let mut original = Components::new(scratch.path(), "plots-a");
    original.history.add("plot(1)");
    original
        .interp
        .options
        .insert("warn".to_string(), "2".to_string());
    original.interp.options_blob = b"serialized options".to_vec();

    let mut queue = ClientEventQueue::new();
    assert!(suspend::suspend(
        &state,
        &mut original.view(),
        &mut queue,
        &SuspendOptions {
            save_minimal: true,
            save_workspace: false,
            ..SuspendOptions::default()
        },
        false,
        false,
    ));

    assert!(!state.join("options").exists());
    assert!(!state.join("libpaths").exists());
    assert!(!state.join("search_path").exists());

    let mut fresh = Components::new(scratch.path(), "plots-b");
    let (ok, errors, _deferred) = suspend::restore(&state, false, &mut fresh.view());
    assert!(ok, "restore errors: {errors:?}");
    let entries: Vec<&str> = fresh.history.entries().collect();
    assert_eq!(entries, vec!["plot(1)"]);
    assert!(fresh.interp.options_blob.is_empty());
}

#[test]
fn destroyed_checkpoint_restores_as_fresh() {
    let scratch = TempDir::new().expect("scratch");
    let state = scratch.path().join("state");

    let mut original = Components::new(scratch.path(), "plots-a");
    original.history.add("x <- 1");
    let mut queue = ClientEventQueue::new();
    assert!(suspend::suspend(
        &state,
        &mut original.view(),
        &mut queue,
        &SuspendOptions::default(),
        false,
        false,
    ));

    assert!(session_state::destroy(&state));
    assert!(!state.exists());
    assert!(session_state::destroy(&state));

    let mut fresh = Components::new(scratch.path(), "plots-b");
    let (ok, errors, _deferred) = suspend::restore(&state, false, &mut fresh.view());
    assert!(ok, "restore errors: {errors:?}");
    assert!(fresh.history.is_empty());
}
