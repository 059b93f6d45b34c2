//! In-memory interpreter used by the test suite.
//!
//! `ScriptedInterpreter` models the observable state the session host cares
//! about: options, library paths, a mutable scope chain, and a fake global
//! environment image. Serialization writes tagged marker files so tests can
//! assert on what was persisted without a real interpreter.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::graphics::shadow::{BitmapBackend, BitmapSurface, DrawOp};
use crate::interpreter::{
    AUTOLOADS, BASE_PACKAGE, EvalError, GLOBAL_ENV, Interpreter, Scope, ScopeKind, TOOLS_SCOPE,
};

pub struct ScriptedInterpreter {
    pub version: String,
    pub engine_version: u32,
    pub evaluated: Vec<String>,
    pub options: BTreeMap<String, String>,
    pub options_blob: Vec<u8>,
    pub lib_paths: Vec<PathBuf>,
    pub scopes: Vec<Scope>,
    pub global_env: BTreeMap<String, String>,
    pub global_dirty: bool,
    pub compression: bool,
    pub dev_mode: bool,
    /// Evaluations of these expressions fail with a runtime error.
    pub failing_evals: Vec<String>,
    /// Packages that fail to load, simulating a missing library.
    pub failing_packages: Vec<String>,
}

impl Default for ScriptedInterpreter {
    fn default() -> ScriptedInterpreter {
        ScriptedInterpreter::new()
    }
}

impl ScriptedInterpreter {
    pub fn new() -> ScriptedInterpreter {
        ScriptedInterpreter {
            version: "4.3.1".to_string(),
            engine_version: 16,
            evaluated: Vec::new(),
            options: BTreeMap::new(),
            options_blob: Vec::new(),
            lib_paths: Vec::new(),
            scopes: default_scopes(),
            global_env: BTreeMap::new(),
            global_dirty: false,
            compression: true,
            dev_mode: false,
            failing_evals: Vec::new(),
            failing_packages: Vec::new(),
        }
    }

    pub fn scope_names(&self) -> Vec<String> {
        self.scopes.iter().map(|s| s.name.clone()).collect()
    }

    /// Insert a scope just after the global environment, mirroring how a
    /// freshly attached scope lands at position 2 of the chain.
    pub fn attach_scope(&mut self, scope: Scope) {
        self.scopes.insert(1, scope);
    }
}

fn default_scopes() -> Vec<Scope> {
    vec![
        Scope {
            name: GLOBAL_ENV.to_string(),
            kind: ScopeKind::Global,
        },
        Scope {
            name: TOOLS_SCOPE.to_string(),
            kind: ScopeKind::Placeholder,
        },
        Scope::package("package:utils", None),
        Scope {
            name: AUTOLOADS.to_string(),
            kind: ScopeKind::Placeholder,
        },
        Scope {
            name: BASE_PACKAGE.to_string(),
            kind: ScopeKind::Base,
        },
    ]
}

impl Interpreter for ScriptedInterpreter {
    fn version(&self) -> String {
        self.version.clone()
    }

    fn graphics_engine_version(&self) -> u32 {
        self.engine_version
    }

    fn eval(&mut self, code: &str) -> Result<(), EvalError> {
        if self.failing_evals.iter().any(|c| c == code) {
            return Err(EvalError::Runtime(format!("error evaluating: {code}")));
        }
        self.evaluated.push(code.to_string());
        Ok(())
    }

    fn get_option(&self, name: &str) -> Option<String> {
        self.options.get(name).cloned()
    }

    fn set_option(&mut self, name: &str, value: &str) -> Result<(), String> {
        self.options.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn options_blob(&self) -> Result<Vec<u8>, String> {
        Ok(self.options_blob.clone())
    }

    fn set_options_blob(&mut self, blob: &[u8]) -> Result<(), String> {
        self.options_blob = blob.to_vec();
        Ok(())
    }

    fn lib_paths(&self) -> Result<Vec<PathBuf>, String> {
        Ok(self.lib_paths.clone())
    }

    fn set_lib_paths(&mut self, paths: &[PathBuf]) -> Result<(), String> {
        self.lib_paths = paths.to_vec();
        Ok(())
    }

    fn append_lib_path(&mut self, path: &Path) -> Result<(), String> {
        self.lib_paths.push(path.to_path_buf());
        Ok(())
    }

    fn search_path(&self) -> Vec<Scope> {
        self.scopes.clone()
    }

    fn load_package(&mut self, name: &str, lib: Option<&Path>) -> Result<(), String> {
        if self.failing_packages.iter().any(|p| p == name) {
            return Err(format!("package '{name}' is not available"));
        }
        self.attach_scope(Scope::package(
            format!("package:{name}"),
            lib.map(|l| l.join(name)),
        ));
        Ok(())
    }

    fn detach(&mut self, name: &str) -> Result<(), String> {
        let index = self
            .scopes
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| format!("scope '{name}' not found on search path"))?;
        self.scopes.remove(index);
        Ok(())
    }

    fn serialize_scope_data(&self, name: &str, file: &Path) -> Result<(), String> {
        fs::write(file, format!("scope-data:{name}")).map_err(|e| e.to_string())
    }

    fn attach_scope_data(&mut self, file: &Path, name: &str) -> Result<(), String> {
        let contents = fs::read_to_string(file).map_err(|e| e.to_string())?;
        if !contents.starts_with("scope-data:") {
            return Err(format!("file {} is not serialized scope data", file.display()));
        }
        self.attach_scope(Scope::data(name));
        Ok(())
    }

    fn save_global_environment(&self, file: &Path) -> Result<(), String> {
        let body = self
            .global_env
            .iter()
            .map(|(k, v)| format!("{k}={v}\n"))
            .collect::<String>();
        fs::write(file, format!("global-env\n{body}")).map_err(|e| e.to_string())
    }

    fn restore_global_environment(&mut self, file: &Path) -> Result<(), String> {
        let contents = fs::read_to_string(file).map_err(|e| e.to_string())?;
        let mut lines = contents.lines();
        if lines.next() != Some("global-env") {
            return Err(format!(
                "file {} is not a serialized global environment",
                file.display()
            ));
        }
        for line in lines {
            if let Some((key, value)) = line.split_once('=') {
                self.global_env.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    fn global_environment_dirty(&self) -> bool {
        self.global_dirty
    }

    fn set_save_compression(&mut self, enabled: bool) {
        self.compression = enabled;
    }

    fn dev_mode_on(&self) -> bool {
        self.dev_mode
    }

    fn set_dev_mode(&mut self, on: bool) -> Result<(), String> {
        self.dev_mode = on;
        Ok(())
    }
}

#[derive(Default)]
struct BackendState {
    surfaces_created: usize,
    ops_drawn: usize,
    fail_next_create: bool,
}

/// Shared view of a `RecordingBackend`'s counters, kept by tests after the
/// backend itself is boxed away inside a device.
#[derive(Clone, Default)]
pub struct SharedOps {
    state: Arc<Mutex<BackendState>>,
}

impl SharedOps {
    pub fn surfaces_created(&self) -> usize {
        self.state.lock().map(|s| s.surfaces_created).unwrap_or(0)
    }

    pub fn ops_drawn(&self) -> usize {
        self.state.lock().map(|s| s.ops_drawn).unwrap_or(0)
    }

    pub fn fail_next_create(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next_create = true;
        }
    }
}

/// Bitmap backend whose surfaces record draw counts and, on completion,
/// write a small marker file where a real backend would flush a PNG.
pub struct RecordingBackend {
    state: Arc<Mutex<BackendState>>,
}

impl RecordingBackend {
    pub fn new() -> (RecordingBackend, SharedOps) {
        let ops = SharedOps::default();
        (
            RecordingBackend {
                state: ops.state.clone(),
            },
            ops,
        )
    }
}

struct RecordingSurface {
    state: Arc<Mutex<BackendState>>,
    file: PathBuf,
    ops: Vec<String>,
}

impl BitmapBackend for RecordingBackend {
    fn create_surface(
        &mut self,
        file: &Path,
        _width: f64,
        _height: f64,
        _pixel_ratio: f64,
    ) -> Result<Box<dyn BitmapSurface>, String> {
        let mut state = self.state.lock().map_err(|e| e.to_string())?;
        if state.fail_next_create {
            state.fail_next_create = false;
            return Err("bitmap surface allocation failed".to_string());
        }
        state.surfaces_created += 1;
        Ok(Box::new(RecordingSurface {
            state: self.state.clone(),
            file: file.to_path_buf(),
            ops: Vec::new(),
        }))
    }
}

impl BitmapSurface for RecordingSurface {
    fn draw(&mut self, op: &DrawOp) -> Result<(), String> {
        if let Ok(mut state) = self.state.lock() {
            state.ops_drawn += 1;
        }
        self.ops.push(format!("{op:?}"));
        Ok(())
    }

    fn complete(self: Box<Self>) -> Result<PathBuf, String> {
        let body = format!("png\n{}\n", self.ops.join("\n"));
        fs::write(&self.file, body).map_err(|e| e.to_string())?;
        Ok(self.file)
    }
}
