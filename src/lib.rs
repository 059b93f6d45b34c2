pub mod client;
pub mod client_metrics;
pub mod console;
pub mod diagnostics;
pub mod driver;
pub mod env_vars;
pub mod event_log;
pub mod graphics;
pub mod interpreter;
pub mod restart_context;
pub mod search_path;
pub mod session_state;
pub mod settings;
pub mod suspend;
pub mod testing;
