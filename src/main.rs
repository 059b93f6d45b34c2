use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use repl_host::client::ClientEvent;
use repl_host::driver::{
    Disposition, SaveAction, Session, SessionCallbacks, SessionOptions, SUSPENDED_STATE_DIR,
};
use repl_host::env_vars::ProcessEnvironment;
use repl_host::graphics::Display;
use repl_host::interpreter::Interpreter;
use repl_host::testing::{RecordingBackend, ScriptedInterpreter};
use repl_host::{diagnostics, event_log};

struct CliOptions {
    scope_path: PathBuf,
    context_id: String,
    server_mode: bool,
    save_action: SaveAction,
    debug_events_dir: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    // The client may disconnect and close its read end while we still have
    // output to write. Ignore SIGPIPE so those writes surface broken-pipe
    // errors normally instead of terminating the process.
    ignore_sigpipe();
    diagnostics::startup_log("main: entry");

    let options = parse_cli_args()?;
    let resumed = options
        .scope_path
        .join(SUSPENDED_STATE_DIR)
        .is_dir();
    event_log::initialize(
        options.debug_events_dir.clone(),
        event_log::StartupContext {
            mode: if options.server_mode {
                "server".to_string()
            } else {
                "desktop".to_string()
            },
            scope_path: Some(options.scope_path.display().to_string()),
            context_id: Some(options.context_id.clone()),
            resumed,
        },
    )?;

    // The stdio front end drives the session machinery against the
    // in-memory interpreter; an embedded language runtime plugs in here.
    let interp: Box<dyn Interpreter> = Box::new(ScriptedInterpreter::new());
    let engine_version = interp.graphics_engine_version();
    let (backend, _ops) = RecordingBackend::new();
    let display = Display::new(
        engine_version,
        Box::new(backend),
        options.scope_path.join("graphics"),
        640.0,
        480.0,
        1.0,
    )?;

    let mut session_options =
        SessionOptions::new(options.scope_path.clone(), options.context_id.clone());
    session_options.server_mode = options.server_mode;
    session_options.save_action = options.save_action;

    let mut session = Session::new(
        session_options,
        interp,
        Box::new(ProcessEnvironment),
        display,
    );
    let mut callbacks = StdioCallbacks::new();
    diagnostics::startup_log("main: entering session loop");
    match session.run(&mut callbacks) {
        Disposition::Suspended => {
            drain_events(&mut session);
            Ok(())
        }
        Disposition::Quit { .. } => {
            drain_events(&mut session);
            Ok(())
        }
    }
}

fn drain_events(session: &mut Session) {
    for event in session.client_events() {
        if let Ok(line) = serde_json::to_string(&event) {
            println!("{line}");
        }
    }
}

#[cfg(target_family = "unix")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Console front end over stdio: prompts and output on stdout, errors on
/// stderr, one input line per read.
struct StdioCallbacks {
    stdin: io::Stdin,
}

impl StdioCallbacks {
    fn new() -> StdioCallbacks {
        StdioCallbacks { stdin: io::stdin() }
    }
}

impl SessionCallbacks for StdioCallbacks {
    fn console_read(&mut self, prompt: &str) -> Option<String> {
        print!("{prompt}");
        let _ = io::stdout().flush();
        let mut line = String::new();
        match self.stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
        }
    }

    fn console_write(&mut self, text: &str, error: bool) {
        if error {
            eprint!("{text}");
            let _ = io::stderr().flush();
        } else {
            print!("{text}");
            let _ = io::stdout().flush();
        }
    }

    fn quit(&mut self, saved_environment: bool) {
        if let Ok(line) = serde_json::to_string(&ClientEvent::Quit { saved_environment }) {
            println!("{line}");
        }
    }
}

fn parse_cli_args() -> Result<CliOptions, Box<dyn std::error::Error>> {
    let mut parser = ArgParser::new();
    let mut scope_path = None;
    let mut context_id = None;
    let mut server_mode = false;
    let mut save_action = SaveAction::Ask;
    let mut debug_events_dir = None;
    while let Some(arg) = parser.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--scope-path" => {
                let value = parser.next_value("--scope-path")?;
                scope_path = Some(PathBuf::from(value));
            }
            _ if arg.starts_with("--scope-path=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.is_empty() {
                    return Err("missing value for --scope-path".into());
                }
                scope_path = Some(PathBuf::from(value));
            }
            "--context-id" => {
                context_id = Some(parser.next_value("--context-id")?);
            }
            _ if arg.starts_with("--context-id=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.is_empty() {
                    return Err("missing value for --context-id".into());
                }
                context_id = Some(value.to_string());
            }
            "--server-mode" => {
                server_mode = true;
            }
            "--save" => {
                save_action = SaveAction::Save;
            }
            "--no-save" => {
                save_action = SaveAction::NoSave;
            }
            "--debug-events-dir" => {
                let value = parser.next_value("--debug-events-dir")?;
                if value.trim().is_empty() {
                    return Err("missing value for --debug-events-dir".into());
                }
                debug_events_dir = Some(PathBuf::from(value));
            }
            _ if arg.starts_with("--debug-events-dir=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.trim().is_empty() {
                    return Err("missing value for --debug-events-dir".into());
                }
                debug_events_dir = Some(PathBuf::from(value));
            }
            _ => return Err(format!("unknown argument: {arg}").into()),
        }
    }

    let scope_path = scope_path.ok_or("missing required argument: --scope-path")?;
    let context_id = context_id.unwrap_or_else(|| "default".to_string());

    Ok(CliOptions {
        scope_path,
        context_id,
        server_mode,
        save_action,
        debug_events_dir,
    })
}

struct ArgParser {
    args: Vec<String>,
    index: usize,
}

impl ArgParser {
    fn new() -> Self {
        Self {
            args: std::env::args().skip(1).collect(),
            index: 0,
        }
    }

    fn next(&mut self) -> Option<String> {
        let value = self.args.get(self.index)?.clone();
        self.index += 1;
        Some(value)
    }

    fn next_value(&mut self, flag: &str) -> Result<String, Box<dyn std::error::Error>> {
        self.next()
            .ok_or_else(|| format!("missing value for {flag}").into())
    }
}

fn print_usage() {
    println!(
        "Usage:\n\
repl-host --scope-path <dir> [--context-id <id>] [--server-mode] [--save|--no-save]\n\n\
--scope-path: directory holding this session's persisted state\n\
--context-id: restart context identifier (default: default)\n\
--server-mode: run headless; plot files are not copied into checkpoints\n\
--save / --no-save: resolve the workspace-save prompt up front\n\
--debug-events-dir: optional directory for per-startup JSONL debug event logs (env: REPL_HOST_DEBUG_EVENTS_DIR)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser_with(args: &[&str]) -> ArgParser {
        ArgParser {
            args: args.iter().map(|s| s.to_string()).collect(),
            index: 0,
        }
    }

    #[test]
    fn arg_parser_yields_values_in_order() {
        let mut parser = parser_with(&["--scope-path", "/tmp/scope"]);
        assert_eq!(parser.next().as_deref(), Some("--scope-path"));
        assert_eq!(
            parser.next_value("--scope-path").expect("value"),
            "/tmp/scope"
        );
        assert!(parser.next().is_none());
    }

    #[test]
    fn arg_parser_reports_missing_values() {
        let mut parser = parser_with(&[]);
        let err = parser.next_value("--context-id").expect_err("missing");
        assert!(err.to_string().contains("--context-id"));
    }
}
