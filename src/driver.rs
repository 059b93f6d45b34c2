//! Session runtime driver: owns the live session pieces, wires interpreter
//! callbacks to the front end, and runs the top-level read-eval loop.
//!
//! The loop is single-threaded and cooperative. Between top-level
//! expressions a polled-event callback runs; everything else (suspend,
//! restore, quit) happens synchronously inside the loop at well-defined
//! points.

use std::fs;
use std::path::{Path, PathBuf};

use crate::client::{ClientEvent, ClientEventQueue, SerializationAction, SerializationStatusScope};
use crate::client_metrics::ClientMetrics;
use crate::console::{ConsoleActionKind, ConsoleActions, ConsoleHistory, filter_history_input};
use crate::env_vars::EnvironmentView;
use crate::graphics::Display;
use crate::interpreter::{EvalError, Interpreter};
use crate::restart_context::RestartContext;
use crate::session_state::{self, SessionView};
use crate::suspend::{self, DeferredRestore, SuspendOptions};

/// Directory under the scope path used for ordinary (non-restart)
/// suspends.
pub const SUSPENDED_STATE_DIR: &str = "suspended-session-state";

/// File written on the suicide path in non-server mode so the next start
/// can tell the user what happened.
pub const ABORT_MESSAGE_FILE: &str = "abort_message";

const DEFAULT_PROMPT: &str = "> ";

/// Default workspace image in the working directory, written by the quit
/// path and reloaded by the next fresh session.
pub const DEFAULT_WORKSPACE_FILE: &str = "workspace.bin";

/// What to do with the global environment when the session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveAction {
    Save,
    NoSave,
    Ask,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub scope_path: PathBuf,
    pub context_id: String,
    pub server_mode: bool,
    pub home_directory: PathBuf,
    pub project_directory: Option<PathBuf>,
    pub save_action: SaveAction,
    pub history_capacity: usize,
    pub ephemeral_env_var_names: Vec<String>,
}

impl SessionOptions {
    pub fn new(scope_path: PathBuf, context_id: String) -> SessionOptions {
        SessionOptions {
            scope_path,
            context_id,
            server_mode: false,
            home_directory: std::env::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            project_directory: None,
            save_action: SaveAction::Ask,
            history_capacity: 512,
            ephemeral_env_var_names: Vec::new(),
        }
    }

    fn suspended_state_path(&self) -> PathBuf {
        self.scope_path.join(SUSPENDED_STATE_DIR)
    }

    fn global_history_file(&self) -> PathBuf {
        self.home_directory.join(".history")
    }
}

/// Host-side callbacks the driver invokes. The front end implements this;
/// tests use a scripted implementation.
pub trait SessionCallbacks {
    /// Read one line of console input for `prompt`. `None` means the input
    /// stream ended and the session should quit.
    fn console_read(&mut self, prompt: &str) -> Option<String>;
    fn console_write(&mut self, text: &str, error: bool);
    fn busy(&mut self, _active: bool) {}
    /// Fired once, after first-read initialization. `resumed` is true when
    /// a checkpoint was restored.
    fn initialized(&mut self, _resumed: bool) {}
    fn suspended(&mut self) {}
    fn quit(&mut self, _saved_environment: bool) {}
    fn clean_up(&mut self) {}
    /// Invoked between top-level reads while polled events are enabled.
    fn polled_events(&mut self) {}
    /// Resolve `SaveAction::Ask` at quit time.
    fn resolve_save_prompt(&mut self) -> bool {
        false
    }
}

/// How `run` ended. `Suspended` means a checkpoint was written and the
/// process should exit so the host can reclaim it; `Quit` is an ordinary
/// end of session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Suspended,
    Quit { saved_environment: bool },
}

/// A request queued from within a callback, consumed at the next loop
/// iteration boundary.
enum PendingRequest {
    Suspend { force: bool },
    SuspendForRestart,
    Quit,
}

pub struct Session {
    options: SessionOptions,
    interp: Box<dyn Interpreter>,
    env: Box<dyn EnvironmentView>,
    display: Display,
    history: ConsoleHistory,
    actions: ConsoleActions,
    metrics: ClientMetrics,
    working_directory: PathBuf,
    queue: ClientEventQueue,
    restart_context: RestartContext,
    deferred_restore: Option<DeferredRestore>,
    pending: Option<PendingRequest>,
    initialized: bool,
    suspended: bool,
    polled_events_disabled: bool,
    output_suppressed: bool,
    interrupts_ignored: bool,
    pending_interrupt: bool,
    last_prompt: String,
}

impl Session {
    pub fn new(
        options: SessionOptions,
        interp: Box<dyn Interpreter>,
        env: Box<dyn EnvironmentView>,
        display: Display,
    ) -> Session {
        let mut restart_context = RestartContext::new();
        restart_context.initialize(&options.scope_path, &options.context_id);
        let history = ConsoleHistory::new(options.history_capacity);
        let actions = ConsoleActions::new(options.history_capacity);
        let working_directory = options.home_directory.clone();
        Session {
            options,
            interp,
            env,
            display,
            history,
            actions,
            metrics: ClientMetrics::default(),
            working_directory,
            queue: ClientEventQueue::new(),
            restart_context,
            deferred_restore: None,
            pending: None,
            initialized: false,
            suspended: false,
            polled_events_disabled: false,
            output_suppressed: false,
            interrupts_ignored: false,
            pending_interrupt: false,
            last_prompt: DEFAULT_PROMPT.to_string(),
        }
    }

    pub fn client_events(&mut self) -> Vec<ClientEvent> {
        self.queue.drain()
    }

    pub fn restart_context(&self) -> &RestartContext {
        &self.restart_context
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn history(&self) -> &ConsoleHistory {
        &self.history
    }

    pub fn display(&self) -> &Display {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut Display {
        &mut self.display
    }

    /// Permanently disable the polled-event pump. Used after fork so a
    /// child process runs headless and event-free.
    pub fn disable_polled_events(&mut self) {
        self.polled_events_disabled = true;
    }

    /// Suspension is only safe between top-level expressions, i.e. while
    /// the session is sitting at the default prompt rather than inside a
    /// continuation or readline prompt.
    pub fn is_suspendable(&self) -> bool {
        self.last_prompt == DEFAULT_PROMPT
    }

    /// Request a suspend; honored at the next loop boundary if the session
    /// is suspendable then.
    pub fn request_suspend(&mut self, force: bool) {
        self.pending = Some(PendingRequest::Suspend { force });
    }

    pub fn request_suspend_for_restart(&mut self) {
        self.pending = Some(PendingRequest::SuspendForRestart);
    }

    pub fn request_quit(&mut self) {
        self.pending = Some(PendingRequest::Quit);
    }

    /// Request an interrupt of the next queued evaluation. Dropped while
    /// interrupts are ignored, which the driver arranges around the
    /// data-affecting suspend and restore phases.
    pub fn request_interrupt(&mut self) {
        if self.interrupts_ignored {
            return;
        }
        self.pending_interrupt = true;
    }

    pub fn interrupts_ignored(&self) -> bool {
        self.interrupts_ignored
    }

    pub fn suspended(&self) -> bool {
        self.suspended
    }

    fn view(&mut self) -> SessionView<'_> {
        SessionView {
            interp: self.interp.as_mut(),
            env: self.env.as_mut(),
            history: &mut self.history,
            actions: &mut self.actions,
            display: &mut self.display,
            metrics: &mut self.metrics,
            working_directory: &mut self.working_directory,
            home_directory: self.options.home_directory.clone(),
            project_directory: self.options.project_directory.clone(),
        }
    }

    /// Top-level loop. Returns how the session ended; the caller exits the
    /// process accordingly.
    pub fn run(&mut self, callbacks: &mut dyn SessionCallbacks) -> Disposition {
        loop {
            if let Some(request) = self.pending.take()
                && let Some(disposition) = self.handle_request(request, callbacks)
            {
                return disposition;
            }

            if !self.polled_events_disabled {
                callbacks.polled_events();
            }

            if !self.initialized {
                self.initialize(callbacks);
            }

            let prompt = self
                .interp
                .get_option("prompt")
                .unwrap_or_else(|| DEFAULT_PROMPT.to_string());
            self.last_prompt = prompt.clone();
            self.queue.enqueue(ClientEvent::ConsoleWritePrompt {
                prompt: prompt.clone(),
            });

            let Some(input) = callbacks.console_read(&prompt) else {
                return self.quit_path(callbacks);
            };
            if self.pending_interrupt {
                // an interrupt discards queued console input
                self.pending_interrupt = false;
                callbacks.console_write("\n", false);
                continue;
            }
            self.actions.add(ConsoleActionKind::Prompt, &prompt);
            self.actions.add(ConsoleActionKind::Input, &input);
            let filtered = filter_history_input(&input);
            if !filtered.trim().is_empty() {
                self.history.add(&filtered);
            }

            callbacks.busy(true);
            let result = self.interp.eval(&input);
            callbacks.busy(false);
            self.publish_plot_updates();
            match result {
                Ok(()) => {}
                Err(EvalError::Interrupted) => {
                    callbacks.console_write("\n", false);
                }
                // the interpreter already reported these through its own
                // error mechanism
                Err(EvalError::InvalidState(_)) => {}
                Err(EvalError::Runtime(message)) => {
                    self.actions.add(ConsoleActionKind::OutputError, &message);
                    callbacks.console_write(&message, true);
                    callbacks.console_write("\n", true);
                }
            }
        }
    }

    /// One-time first-read initialization: restore a checkpoint when one
    /// exists, otherwise seed a fresh session, then run the deferred
    /// restore action exactly once.
    fn initialize(&mut self, callbacks: &mut dyn SessionCallbacks) {
        self.initialized = true;
        self.interrupts_ignored = true;

        let state_path = self
            .restart_context
            .session_state_path()
            .map(Path::to_path_buf)
            .or_else(|| {
                let path = self.options.suspended_state_path();
                path.is_dir().then_some(path)
            });

        let resumed = state_path.is_some();
        if let Some(state_path) = state_path {
            self.restore_checkpoint(&state_path, callbacks);
        } else {
            let history_file = self.options.global_history_file();
            if let Err(err) = self.history.load_from_file(&history_file, false) {
                crate::event_log::log(
                    "history_load_error",
                    serde_json::json!({ "error": err.to_string() }),
                );
            }
            self.load_default_workspace(callbacks);
        }

        if self.working_directory.is_dir()
            && let Err(err) = std::env::set_current_dir(&self.working_directory)
        {
            crate::event_log::log(
                "chdir_error",
                serde_json::json!({
                    "dir": self.working_directory.display().to_string(),
                    "error": err.to_string(),
                }),
            );
        }

        callbacks.initialized(resumed);
        self.ensure_deserialized(callbacks);
        self.interrupts_ignored = false;
    }

    /// Fresh-session counterpart of a checkpoint restore: reload the
    /// workspace image a previous quit left in the working directory.
    fn load_default_workspace(&mut self, callbacks: &mut dyn SessionCallbacks) {
        let workspace = self.working_directory.join(DEFAULT_WORKSPACE_FILE);
        if !workspace.is_file() {
            return;
        }
        let _status = SerializationStatusScope::new(
            &mut self.queue,
            SerializationAction::LoadDefaultWorkspace,
        );
        match self.interp.restore_global_environment(&workspace) {
            Ok(()) => {
                callbacks.console_write(
                    &format!("[Workspace loaded from {}]\n", workspace.display()),
                    false,
                );
            }
            Err(err) => {
                crate::event_log::log(
                    "workspace_load_error",
                    serde_json::json!({ "error": err }),
                );
                callbacks.console_write(&format!("Error loading workspace: {err}\n"), true);
            }
        }
    }

    fn restore_checkpoint(&mut self, state_path: &Path, callbacks: &mut dyn SessionCallbacks) {
        crate::diagnostics::startup_log("restoring session checkpoint");
        let server_mode = self.options.server_mode;
        let mut status =
            SerializationStatusScope::new(&mut self.queue, SerializationAction::ResumeSession);
        let mut view = SessionView {
            interp: self.interp.as_mut(),
            env: self.env.as_mut(),
            history: &mut self.history,
            actions: &mut self.actions,
            display: &mut self.display,
            metrics: &mut self.metrics,
            working_directory: &mut self.working_directory,
            home_directory: self.options.home_directory.clone(),
            project_directory: self.options.project_directory.clone(),
        };
        let (success, errors, deferred) = suspend::restore(state_path, server_mode, &mut view);
        self.deferred_restore = Some(deferred);
        status.queue().enqueue(ClientEvent::WorkingDirChanged {
            path: self.working_directory.display().to_string(),
        });
        if !success {
            for message in &errors {
                crate::event_log::log(
                    "session_restore_error",
                    serde_json::json!({ "error": message }),
                );
            }
            callbacks.console_write(
                "Error: the session could not be fully restored; some state may have been lost.\n",
                true,
            );
            status
                .queue()
                .enqueue(ClientEvent::RestoreErrors { messages: errors });
        }
    }

    /// Run the deferred restore action at most once. Console output is
    /// suppressed for its duration: package startup messages from a restore
    /// the user never initiated would only confuse.
    fn ensure_deserialized(&mut self, callbacks: &mut dyn SessionCallbacks) {
        let Some(deferred) = self.deferred_restore.take() else {
            return;
        };
        let consumed_path = deferred.state_path().to_path_buf();
        self.output_suppressed = true;
        let mut view = self.view();
        let outcome = deferred.execute(&mut view);
        self.output_suppressed = false;

        for warning in &outcome.warnings {
            callbacks.console_write(warning, false);
            callbacks.console_write("\n", false);
        }
        if !outcome.errors.is_empty() {
            self.queue.enqueue(ClientEvent::RestoreErrors {
                messages: outcome.errors,
            });
        }

        // the checkpoint has been consumed; a crash from here on should
        // start fresh rather than replay it
        if self.restart_context.session_state_path() == Some(consumed_path.as_path()) {
            if let Err(err) = self.restart_context.remove_session_state() {
                crate::event_log::log(
                    "restart_context_remove_error",
                    serde_json::json!({ "error": err.to_string() }),
                );
            }
        } else if !session_state::destroy(&consumed_path) {
            crate::event_log::log(
                "session_state_destroy_failed",
                serde_json::json!({ "state_path": consumed_path.display().to_string() }),
            );
        }

        if let Some(id) = self.display.plots().active_plot().map(|p| p.id.clone()) {
            self.queue
                .enqueue(ClientEvent::PlotsChanged { active_id: Some(id) });
        }
    }

    pub fn output_suppressed(&self) -> bool {
        self.output_suppressed
    }

    /// Re-render the active plot and push its image to the client when the
    /// display changed since the last publish.
    fn publish_plot_updates(&mut self) {
        if !self.display.plots().display_dirty() || self.display.events_suppressed() {
            return;
        }
        let is_new = self
            .display
            .plots()
            .active_plot()
            .is_some_and(|p| !p.rendered);
        let image = match self.display.render_active_plot() {
            Ok(Some(image)) => image,
            Ok(None) => return,
            Err(err) => {
                crate::event_log::log(
                    "plot_render_error",
                    serde_json::json!({ "error": err }),
                );
                return;
            }
        };
        let Some(id) = self.display.plots().active_plot().map(|p| p.id.clone()) else {
            return;
        };
        match fs::read(&image) {
            Ok(bytes) => {
                self.queue
                    .enqueue(ClientEvent::plot_image(&id, "image/png", &bytes, is_new));
            }
            Err(err) => {
                crate::event_log::log(
                    "plot_image_read_error",
                    serde_json::json!({ "error": err.to_string() }),
                );
            }
        }
        self.queue
            .enqueue(ClientEvent::PlotsChanged { active_id: Some(id) });
    }

    fn handle_request(
        &mut self,
        request: PendingRequest,
        callbacks: &mut dyn SessionCallbacks,
    ) -> Option<Disposition> {
        match request {
            PendingRequest::Quit => Some(self.quit_path(callbacks)),
            PendingRequest::Suspend { force } => {
                if !self.is_suspendable() && !force {
                    return None;
                }
                let state_path = self.options.suspended_state_path();
                let suspend_options = self.suspend_options(false);
                self.interrupts_ignored = true;
                let mut view = SessionView {
                    interp: self.interp.as_mut(),
                    env: self.env.as_mut(),
                    history: &mut self.history,
                    actions: &mut self.actions,
                    display: &mut self.display,
                    metrics: &mut self.metrics,
                    working_directory: &mut self.working_directory,
                    home_directory: self.options.home_directory.clone(),
                    project_directory: self.options.project_directory.clone(),
                };
                let ok = suspend::suspend(
                    &state_path,
                    &mut view,
                    &mut self.queue,
                    &suspend_options,
                    false,
                    force,
                );
                self.interrupts_ignored = false;
                if ok {
                    Some(self.finish_suspend(callbacks))
                } else {
                    // the process keeps running; the failure was logged
                    None
                }
            }
            PendingRequest::SuspendForRestart => {
                let suspend_options = self.suspend_options(true);
                let scope_path = self.options.scope_path.clone();
                let context_id = self.options.context_id.clone();
                self.interrupts_ignored = true;
                let mut view = SessionView {
                    interp: self.interp.as_mut(),
                    env: self.env.as_mut(),
                    history: &mut self.history,
                    actions: &mut self.actions,
                    display: &mut self.display,
                    metrics: &mut self.metrics,
                    working_directory: &mut self.working_directory,
                    home_directory: self.options.home_directory.clone(),
                    project_directory: self.options.project_directory.clone(),
                };
                let result = suspend::suspend_for_restart(
                    &scope_path,
                    &context_id,
                    &mut view,
                    &mut self.queue,
                    &suspend_options,
                );
                self.interrupts_ignored = false;
                match result {
                    Ok(true) => Some(self.finish_suspend(callbacks)),
                    Ok(false) => None,
                    Err(err) => {
                        crate::event_log::log(
                            "suspend_for_restart_error",
                            serde_json::json!({ "error": err }),
                        );
                        None
                    }
                }
            }
        }
    }

    fn suspend_options(&self, for_restart: bool) -> SuspendOptions {
        SuspendOptions {
            save_minimal: for_restart,
            save_workspace: true,
            exclude_packages: false,
            server_mode: self.options.server_mode,
            packrat_mode_on: false,
            after_restart_command: None,
            built_package_path: None,
            ephemeral_env_var_names: self.options.ephemeral_env_var_names.clone(),
        }
    }

    /// The checkpoint is on disk; tell everyone and hand control back so
    /// the process can exit. Cleanup here must not save again.
    fn finish_suspend(&mut self, callbacks: &mut dyn SessionCallbacks) -> Disposition {
        self.suspended = true;
        self.queue.enqueue(ClientEvent::Suspended);
        callbacks.suspended();
        callbacks.clean_up();
        crate::event_log::log("session_suspended", serde_json::Value::Null);
        Disposition::Suspended
    }

    /// Ordinary end of session: resolve the save prompt, save the global
    /// environment if asked, persist history, and discard the suspended
    /// checkpoint. A failed discard blocks the quit so the last good
    /// checkpoint is not lost.
    fn quit_path(&mut self, callbacks: &mut dyn SessionCallbacks) -> Disposition {
        let save = match self.options.save_action {
            SaveAction::Save => true,
            SaveAction::NoSave => false,
            SaveAction::Ask => {
                if self.interp.global_environment_dirty() {
                    callbacks.resolve_save_prompt()
                } else {
                    false
                }
            }
        };

        let mut saved_environment = false;
        if save {
            let target = self.working_directory.join(DEFAULT_WORKSPACE_FILE);
            let _status = SerializationStatusScope::new(
                &mut self.queue,
                SerializationAction::SaveDefaultWorkspace,
            );
            match self.interp.save_global_environment(&target) {
                Ok(()) => saved_environment = true,
                Err(err) => {
                    callbacks.console_write(
                        &format!("Error saving workspace: {err}\n"),
                        true,
                    );
                }
            }
        }

        let history_file = self.options.global_history_file();
        if let Err(err) = self.history.save_to_file(&history_file) {
            crate::event_log::log(
                "history_save_error",
                serde_json::json!({ "error": err.to_string() }),
            );
        }

        let state_path = self.options.suspended_state_path();
        if state_path.exists() && !session_state::destroy(&state_path) {
            callbacks.console_write(
                "Error: unable to discard the suspended session; quit aborted.\n",
                true,
            );
            return Disposition::Quit {
                saved_environment: false,
            };
        }

        self.display.clear();
        self.queue.enqueue(ClientEvent::Quit {
            saved_environment,
        });
        callbacks.quit(saved_environment);
        callbacks.clean_up();
        crate::event_log::log(
            "session_quit",
            serde_json::json!({ "saved_environment": saved_environment }),
        );
        Disposition::Quit { saved_environment }
    }

    /// Terminal failure path, deliberately distinct from quit: no normal
    /// cleanup hooks run. In non-server mode a best-effort abort-message
    /// file is written for the next start to show.
    pub fn record_suicide(&mut self, message: &str) {
        crate::event_log::log(
            "session_suicide",
            serde_json::json!({ "message": message }),
        );
        if !self.options.server_mode {
            let file = self.options.scope_path.join(ABORT_MESSAGE_FILE);
            if let Err(err) = fs::write(&file, message) {
                crate::event_log::log(
                    "abort_message_write_error",
                    serde_json::json!({ "error": err.to_string() }),
                );
            }
        }
    }
}
