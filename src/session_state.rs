//! The on-disk session checkpoint: what gets written at suspend time and
//! how a fresh process reads it back.
//!
//! Every sub-resource is an independent flat file under the state
//! directory. Saves are collect-and-continue: a failed step is logged and
//! flips the overall saved flag, but the remaining steps still run so a
//! partial checkpoint beats none. Restores accumulate error messages the
//! caller can show to the user.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::client_metrics::ClientMetrics;
use crate::console::{ConsoleActions, ConsoleHistory};
use crate::env_vars::{self, EnvironmentView};
use crate::graphics::Display;
use crate::interpreter::{Interpreter, versions_compatible};
use crate::search_path;
use crate::settings::{Settings, alias_path, resolve_aliased_path};

pub const SETTINGS_FILE: &str = "settings";
pub const CONSOLE_ACTIONS_FILE: &str = "console_actions";
pub const HISTORY_FILE: &str = "history";
pub const OPTIONS_FILE: &str = "options";
pub const RVERSION_FILE: &str = "rversion";
pub const ENVIRONMENT_VARS_FILE: &str = "environment_vars";
pub const LIB_PATHS_FILE: &str = "libpaths";
pub const AFTER_RESTART_COMMAND_FILE: &str = "after_restart_command";
pub const BUILT_PACKAGE_PATH_FILE: &str = "built_package_path";
pub const PLOTS_FILE: &str = "plots";
pub const PLOTS_DIR: &str = "plots_dir";

const KEY_R_PROFILE_ON_RESTORE: &str = "r_profile_on_restore";
const KEY_PACKRAT_MODE_ON: &str = "packrat_mode_on";
const KEY_DEV_MODE_ON: &str = "dev_mode_on";
const KEY_WORKING_DIRECTORY: &str = "working_directory";

/// Whether the checkpoint at `state_path` asks for the startup profile to
/// be re-run on restore. Unreadable settings mean no.
pub fn saved_r_profile_on_restore(state_path: &Path) -> bool {
    match Settings::open(&state_path.join(SETTINGS_FILE)) {
        Ok(settings) => settings.get_bool(KEY_R_PROFILE_ON_RESTORE, false),
        Err(_) => false,
    }
}

/// A single expression to run after restart. Eager commands run before the
/// search path is restored (to set options that control how reattachment
/// happens); deferred commands run after, with the full environment
/// available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AfterRestartCommand {
    pub command: String,
    pub eager: bool,
}

impl AfterRestartCommand {
    pub fn deferred(command: impl Into<String>) -> AfterRestartCommand {
        AfterRestartCommand {
            command: command.into(),
            eager: false,
        }
    }

    pub fn eager(command: impl Into<String>) -> AfterRestartCommand {
        AfterRestartCommand {
            command: command.into(),
            eager: true,
        }
    }

    /// On-disk form: a leading `@` marks the eager variant.
    pub fn encode(&self) -> String {
        if self.eager {
            format!("@{}", self.command)
        } else {
            self.command.clone()
        }
    }

    pub fn decode(text: &str) -> Option<AfterRestartCommand> {
        let text = text.trim_end_matches('\n');
        if text.is_empty() {
            return None;
        }
        match text.strip_prefix('@') {
            Some(command) => Some(AfterRestartCommand::eager(command)),
            None => Some(AfterRestartCommand::deferred(text)),
        }
    }
}

/// Save-time policy knobs, decided by the caller per checkpoint.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub after_restart_command: Option<AfterRestartCommand>,
    pub built_package_path: Option<PathBuf>,
    pub server_mode: bool,
    pub exclude_packages: bool,
    pub disable_save_compression: bool,
    pub save_global_environment: bool,
    pub packrat_mode_on: bool,
    pub ephemeral_env_var_names: Vec<String>,
}

/// Borrowed view of the live session pieces the serializer reads or
/// mutates. The driver owns all of these; save/restore only borrow them for
/// the duration of one pass.
pub struct SessionView<'a> {
    pub interp: &'a mut dyn Interpreter,
    pub env: &'a mut dyn EnvironmentView,
    pub history: &'a mut ConsoleHistory,
    pub actions: &'a mut ConsoleActions,
    pub display: &'a mut Display,
    pub metrics: &'a mut ClientMetrics,
    pub working_directory: &'a mut PathBuf,
    pub home_directory: PathBuf,
    pub project_directory: Option<PathBuf>,
}

fn log_save_error(step: &str, error: &str, saved: &mut bool) {
    crate::event_log::log(
        "session_save_error",
        serde_json::json!({ "step": step, "error": error }),
    );
    *saved = false;
}

/// Write the full checkpoint. Returns true iff every step succeeded; a
/// false return still means every step was attempted.
pub fn save(state_path: &Path, session: &mut SessionView<'_>, options: &SaveOptions) -> bool {
    let mut saved = true;
    if let Err(err) = fs::create_dir_all(state_path) {
        log_save_error("create_state_dir", &err.to_string(), &mut saved);
        return false;
    }

    // 1. restore-policy flags. Packrat-managed projects must always replay
    // their profile to reconstruct the right library on restore.
    match Settings::open(&state_path.join(SETTINGS_FILE)) {
        Ok(mut settings) => {
            let r_profile = !options.exclude_packages || options.packrat_mode_on;
            if let Err(err) = settings
                .set_bool(KEY_PACKRAT_MODE_ON, options.packrat_mode_on)
                .and_then(|()| settings.set_bool(KEY_R_PROFILE_ON_RESTORE, r_profile))
            {
                log_save_error("settings_flags", &err.to_string(), &mut saved);
            }
        }
        Err(err) => log_save_error("settings_flags", &err.to_string(), &mut saved),
    }

    // 2. pending command and built-package marker
    if let Err(err) = write_optional_file(
        &state_path.join(AFTER_RESTART_COMMAND_FILE),
        options
            .after_restart_command
            .as_ref()
            .map(AfterRestartCommand::encode),
    ) {
        log_save_error("after_restart_command", &err.to_string(), &mut saved);
    }
    if let Err(err) = write_optional_file(
        &state_path.join(BUILT_PACKAGE_PATH_FILE),
        options
            .built_package_path
            .as_ref()
            .map(|p| p.display().to_string()),
    ) {
        log_save_error("built_package_path", &err.to_string(), &mut saved);
    }

    // 3. version marker, the restore compatibility gate
    if let Err(err) = fs::write(state_path.join(RVERSION_FILE), session.interp.version()) {
        log_save_error("rversion", &err.to_string(), &mut saved);
    }

    // 4. environment variables minus the ephemeral set
    if let Err(err) = env_vars::save(
        session.env,
        &options.ephemeral_env_var_names,
        &state_path.join(ENVIRONMENT_VARS_FILE),
    ) {
        log_save_error("environment_vars", &err.to_string(), &mut saved);
    }

    // 5. plots: the graphics directory is stable across server-mode
    // processes, so only the index is written there
    let serialized_plots = (!options.server_mode).then(|| state_path.join(PLOTS_DIR));
    if let Err(err) = session
        .display
        .save_state(&state_path.join(PLOTS_FILE), serialized_plots.as_deref())
    {
        log_save_error("plots", &err, &mut saved);
    }

    // 6. dev mode is captured and then switched off, before library paths
    // and options are read, so the captured values exclude its mutations
    save_dev_mode(state_path, session.interp, &mut saved);

    // 7. library paths and the options blob
    match session.interp.lib_paths() {
        Ok(paths) => {
            let mut text = String::new();
            for path in paths {
                text.push_str(&path.display().to_string());
                text.push('\n');
            }
            if let Err(err) = fs::write(state_path.join(LIB_PATHS_FILE), text) {
                log_save_error("libpaths", &err.to_string(), &mut saved);
            }
        }
        Err(err) => log_save_error("libpaths", &err, &mut saved),
    }
    match session.interp.options_blob() {
        Ok(blob) => {
            if let Err(err) = fs::write(state_path.join(OPTIONS_FILE), blob) {
                log_save_error("options", &err.to_string(), &mut saved);
            }
        }
        Err(err) => log_save_error("options", &err, &mut saved),
    }

    // 8. working context
    save_working_context(state_path, session, &mut saved);

    // 9. environment / search path, per the save policy
    save_environment(state_path, session, options, &mut saved);

    saved
}

/// Reduced-fidelity checkpoint for fast or forced suspends: always replays
/// the profile on restore, skips library paths, options, and search-path
/// detail.
pub fn save_minimal(
    state_path: &Path,
    session: &mut SessionView<'_>,
    save_global_environment: bool,
) -> bool {
    let mut saved = true;
    if let Err(err) = fs::create_dir_all(state_path) {
        log_save_error("create_state_dir", &err.to_string(), &mut saved);
        return false;
    }

    match Settings::open(&state_path.join(SETTINGS_FILE)) {
        Ok(mut settings) => {
            if let Err(err) = settings.set_bool(KEY_R_PROFILE_ON_RESTORE, true) {
                log_save_error("settings_flags", &err.to_string(), &mut saved);
            }
        }
        Err(err) => log_save_error("settings_flags", &err.to_string(), &mut saved),
    }

    if let Err(err) = fs::write(state_path.join(RVERSION_FILE), session.interp.version()) {
        log_save_error("rversion", &err.to_string(), &mut saved);
    }

    save_dev_mode(state_path, session.interp, &mut saved);
    save_working_context(state_path, session, &mut saved);

    if save_global_environment
        && let Err(err) = search_path::save_global_environment(state_path, session.interp)
    {
        log_save_error("global_environment", &err, &mut saved);
    }

    saved
}

fn save_dev_mode(state_path: &Path, interp: &mut dyn Interpreter, saved: &mut bool) {
    let dev_mode = interp.dev_mode_on();
    match Settings::open(&state_path.join(SETTINGS_FILE)) {
        Ok(mut settings) => {
            if let Err(err) = settings.set_bool(KEY_DEV_MODE_ON, dev_mode) {
                log_save_error("dev_mode", &err.to_string(), saved);
            }
        }
        Err(err) => log_save_error("dev_mode", &err.to_string(), saved),
    }
    if dev_mode && let Err(err) = interp.set_dev_mode(false) {
        log_save_error("dev_mode_off", &err, saved);
    }
}

fn save_working_context(state_path: &Path, session: &mut SessionView<'_>, saved: &mut bool) {
    if let Err(err) = session.history.save_to_file(&state_path.join(HISTORY_FILE)) {
        log_save_error("history", &err.to_string(), saved);
    }
    match Settings::open(&state_path.join(SETTINGS_FILE)) {
        Ok(mut settings) => {
            if let Err(err) = session.metrics.save(&mut settings) {
                log_save_error("client_metrics", &err.to_string(), saved);
            }
            let aliased = alias_path(session.working_directory, &session.home_directory);
            if let Err(err) = settings.set_string(KEY_WORKING_DIRECTORY, &aliased) {
                log_save_error("working_directory", &err.to_string(), saved);
            }
        }
        Err(err) => log_save_error("client_metrics", &err.to_string(), saved),
    }
    if let Err(err) = session
        .actions
        .save_to_file(&state_path.join(CONSOLE_ACTIONS_FILE))
    {
        log_save_error("console_actions", &err.to_string(), saved);
    }
}

fn save_environment(
    state_path: &Path,
    session: &mut SessionView<'_>,
    options: &SaveOptions,
    saved: &mut bool,
) {
    if !options.save_global_environment {
        return;
    }
    if options.disable_save_compression {
        session.interp.set_save_compression(false);
    }
    let result = if options.exclude_packages {
        search_path::save_global_environment(state_path, session.interp)
    } else {
        search_path::save(state_path, session.interp)
    };
    if let Err(err) = result {
        log_save_error("search_path", &err, saved);
    }
}

/// Outcome of the synchronous restore phase. The slow remainder (package
/// install finish, after-restart command, search path, plots) is run later
/// by the deferred phase, which needs `compatible` and `server_mode`.
pub struct RestoreOutcome {
    pub success: bool,
    pub compatible: bool,
    pub error_messages: Vec<String>,
}

/// Synchronous restore phase: everything cheap enough to run before the
/// front end is ready. Each failure is recorded and the pass continues.
pub fn restore(
    state_path: &Path,
    session: &mut SessionView<'_>,
) -> RestoreOutcome {
    let mut errors: Vec<String> = Vec::new();

    // version gate first; it decides how much of the rest is safe to apply
    let saved_version = fs::read_to_string(state_path.join(RVERSION_FILE)).unwrap_or_default();
    let current_version = session.interp.version();
    let compatible = versions_compatible(&saved_version, &current_version);
    if !compatible {
        crate::event_log::log(
            "session_restore_downgraded",
            serde_json::json!({
                "saved_version": saved_version.trim(),
                "current_version": current_version,
            }),
        );
    }

    let settings_file = state_path.join(SETTINGS_FILE);
    let settings = match Settings::open(&settings_file) {
        Ok(settings) => settings,
        Err(err) => {
            // settings only gate defaults; the rest of the pass still runs
            errors.push(format!("error reading settings: {err}"));
            Settings::empty(&settings_file)
        }
    };

    if let Err(err) = session
        .actions
        .load_from_file(&state_path.join(CONSOLE_ACTIONS_FILE))
    {
        errors.push(format!("error restoring console actions: {err}"));
    }

    restore_working_directory(&settings, session);

    match fs::read(state_path.join(OPTIONS_FILE)) {
        Ok(blob) => {
            if let Err(err) = session.interp.set_options_blob(&blob) {
                errors.push(format!("error restoring options: {err}"));
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => errors.push(format!("error reading options: {err}")),
    }

    if compatible {
        restore_lib_paths(state_path, session, &mut errors);
        if settings.get_bool(KEY_DEV_MODE_ON, false)
            && let Err(err) = session.interp.set_dev_mode(true)
        {
            errors.push(format!("error restoring dev mode: {err}"));
        }
    }

    // after options (reads the width option's slot), before graphics
    // restore (sets the surface size)
    *session.metrics = ClientMetrics::load(&settings);
    if let Err(err) = session.metrics.apply(session.interp) {
        errors.push(err);
    }
    if let Err(err) = session.display.resize(
        session.metrics.graphics_width,
        session.metrics.graphics_height,
        session.metrics.device_pixel_ratio,
    ) {
        errors.push(format!("error restoring graphics size: {err}"));
    }

    if let Err(err) = session
        .history
        .load_from_file(&state_path.join(HISTORY_FILE), true)
    {
        errors.push(format!("error restoring history: {err}"));
    }

    if let Err(err) = env_vars::restore(session.env, &state_path.join(ENVIRONMENT_VARS_FILE)) {
        errors.push(format!("error restoring environment variables: {err}"));
    }

    RestoreOutcome {
        success: errors.is_empty(),
        compatible,
        error_messages: errors,
    }
}

fn restore_working_directory(settings: &Settings, session: &mut SessionView<'_>) {
    let saved = settings.get_string(KEY_WORKING_DIRECTORY, "");
    let mut candidates: Vec<PathBuf> = Vec::new();
    if !saved.is_empty() {
        candidates.push(resolve_aliased_path(&saved, &session.home_directory));
    }
    if let Some(project) = &session.project_directory {
        candidates.push(project.clone());
    }
    candidates.push(session.home_directory.clone());
    for candidate in candidates {
        if candidate.is_dir() {
            *session.working_directory = candidate;
            return;
        }
    }
}

fn restore_lib_paths(state_path: &Path, session: &mut SessionView<'_>, errors: &mut Vec<String>) {
    let file = state_path.join(LIB_PATHS_FILE);
    let contents = match fs::read_to_string(&file) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return,
        Err(err) => {
            errors.push(format!("error reading library paths: {err}"));
            return;
        }
    };
    let paths: Vec<PathBuf> = contents
        .lines()
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect();
    if let Err(err) = session.interp.set_lib_paths(&paths) {
        errors.push(format!("error restoring library paths: {err}"));
    }
}

/// Read the pending after-restart command, if any. Consuming is the
/// caller's job; the file is removed with the rest of the state directory.
pub fn read_after_restart_command(state_path: &Path) -> Option<AfterRestartCommand> {
    let text = fs::read_to_string(state_path.join(AFTER_RESTART_COMMAND_FILE)).ok()?;
    AfterRestartCommand::decode(&text)
}

pub fn read_built_package_path(state_path: &Path) -> Option<PathBuf> {
    let text = fs::read_to_string(state_path.join(BUILT_PACKAGE_PATH_FILE)).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

/// Remove the checkpoint. Absence already means "no checkpoint", so a
/// missing directory is success; a failed removal is logged and reported as
/// false so callers can refuse destructive follow-on actions.
pub fn destroy(state_path: &Path) -> bool {
    match fs::remove_dir_all(state_path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            crate::event_log::log(
                "session_destroy_error",
                serde_json::json!({
                    "state_path": state_path.display().to_string(),
                    "error": err.to_string(),
                }),
            );
            false
        }
    }
}

fn write_optional_file(path: &Path, contents: Option<String>) -> io::Result<()> {
    match contents {
        Some(contents) => fs::write(path, contents),
        None => match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        },
    }
}
