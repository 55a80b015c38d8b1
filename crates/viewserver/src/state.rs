use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::ddoc::DdocNode;
use crate::error::ViewServerError;
use crate::eval::{Evaluator, FunctionHandle};
use crate::filters::truthy;
use crate::version::ProtocolVersion;

/// Bookkeeping threaded through a legacy (`<0.10.0`) list function across
/// `list_begin` / `list_row` / `list_tail`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RowInfo {
    pub first_key: Value,
    pub prev_key: Value,
    pub row_number: u64,
}

/// Process-wide mutable engine state, owned by the main loop.
///
/// `functions` and `functions_src` always have equal lengths: a compile
/// failure in `add_fun` grows neither.
pub struct State {
    pub query_config: Map<String, Value>,
    pub functions: Vec<FunctionHandle>,
    pub functions_src: Vec<String>,
    pub view_lib: Value,
    /// Byte length of the most recently read input frame.
    pub line_length: usize,
    /// Legacy list row info, keyed by function index.
    pub row_info: HashMap<usize, RowInfo>,
}

impl State {
    pub fn new() -> Self {
        State {
            query_config: Map::new(),
            functions: Vec::new(),
            functions_src: Vec::new(),
            view_lib: Value::String(String::new()),
            line_length: 0,
            row_info: HashMap::new(),
        }
    }

    /// The `reset` command: drop registered functions and query config.
    ///
    /// The design-document cache is deliberately left alone.
    pub fn reset(&mut self, config: Option<&Value>, version: &ProtocolVersion) -> Value {
        debug!("reset server state");
        self.functions.clear();
        self.functions_src.clear();
        self.query_config.clear();
        if let Some(Value::Object(config)) = config {
            debug!(?config, "set new query config");
            self.query_config
                .extend(config.iter().map(|(key, value)| (key.clone(), value.clone())));
        }
        if version.view_libs() {
            self.view_lib = Value::String(String::new());
        }
        Value::Bool(true)
    }

    /// The `add_fun` command: compile and append a map function.
    ///
    /// Since 1.1.0 map functions compile against a synthesized
    /// `{"views": {"lib": ...}}` design document so `require("views/lib/...")`
    /// resolves against the shared view library.
    pub fn add_fun(
        &mut self,
        evaluator: &dyn Evaluator,
        version: &ProtocolVersion,
        source: &str,
    ) -> Result<Value, ViewServerError> {
        debug!("add function to server state");
        let ddoc = version
            .view_libs()
            .then(|| DdocNode::from_value(&json!({ "views": { "lib": self.view_lib } })));
        let func = evaluator.compile(source, ddoc)?;
        self.functions.push(func);
        self.functions_src.push(source.to_string());
        Ok(Value::Bool(true))
    }

    /// The `add_lib` command: install the shared view library (1.1.0+).
    pub fn add_lib(&mut self, lib: Value) -> Value {
        debug!("set view_lib");
        self.view_lib = lib;
        Value::Bool(true)
    }

    /// Whether the reduce-overflow policy is active.
    pub fn reduce_limited(&self) -> bool {
        self.query_config.get("reduce_limit").is_some_and(truthy)
    }
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}
