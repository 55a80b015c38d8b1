use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, error, info};

use crate::ddoc::{self, DdocCache, DdocNode};
use crate::error::ViewServerError;
use crate::eval::{CallContext, Evaluator, FunctionHandle, RhaiEvaluator};
use crate::filters;
use crate::render;
use crate::state::State;
use crate::stream::SharedIo;
use crate::validate;
use crate::version::ProtocolVersion;
use crate::views;

/// Engine-level configuration the host process decides at spawn time.
#[derive(Clone, Copy, Debug, Default)]
pub struct ServerConfig {
    /// Permit `GET` requests to update functions.
    pub allow_get_update: bool,
}

/// A handled command either produced a single response frame or streamed its
/// frames itself (the list sub-protocol).
pub(crate) enum Handled {
    Value(Value),
    Streamed,
}

/// The view-server protocol engine.
///
/// Owns all process-wide state (function cache, design-document cache, query
/// config, render scratch) and runs the read-dispatch-respond loop over the
/// shared frame stream until end of input or a fatal error.
pub struct QueryServer {
    version: ProtocolVersion,
    config: ServerConfig,
    io: SharedIo,
    evaluator: Rc<dyn Evaluator>,
    state: State,
    ddocs: DdocCache,
    ctx: Rc<RefCell<CallContext>>,
}

impl QueryServer {
    pub fn new(version: ProtocolVersion, io: SharedIo) -> Self {
        let ctx = Rc::new(RefCell::new(CallContext::new(version.clone(), io.clone())));
        let evaluator = Rc::new(RhaiEvaluator::new(&version, ctx.clone()));
        QueryServer {
            version,
            config: ServerConfig::default(),
            io,
            evaluator,
            state: State::new(),
            ddocs: DdocCache::default(),
            ctx,
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn version(&self) -> &ProtocolVersion {
        &self.version
    }

    /// Serves until end of input. Returns the process exit code: 0 for a
    /// graceful end of stream, 1 after a fatal error.
    pub fn serve(&mut self) -> i32 {
        loop {
            // Bind before matching so the stream borrow is released; handlers
            // re-borrow it to write responses and pull list rows.
            let read = self.io.borrow_mut().read_frame();
            let frame = match read {
                Ok(Some((frame, length))) => {
                    self.state.line_length = length;
                    frame
                }
                Ok(None) => {
                    info!("input stream closed, terminating");
                    return 0;
                }
                Err(err) => {
                    self.respond_error(&err);
                    return 1;
                }
            };
            match self.process(frame) {
                Ok(Handled::Value(value)) => {
                    let written = self.io.borrow_mut().write_frame(&value);
                    if let Err(err) = written {
                        self.respond_error(&err);
                        return 1;
                    }
                }
                Ok(Handled::Streamed) => {}
                Err(err) => {
                    self.respond_error(&err);
                    if err.is_fatal() {
                        error!("that was a critical error, exiting");
                        return 1;
                    }
                }
            }
        }
    }

    fn respond_error(&self, err: &ViewServerError) {
        error!("{err}");
        let envelope = err.encode(&self.version);
        let _ = self.io.borrow_mut().write_frame(&envelope);
    }

    /// Dispatches one command frame.
    ///
    /// The command table is gated on the protocol version: a command from the
    /// wrong era is as unknown as a misspelled one.
    pub(crate) fn process(&mut self, frame: Value) -> Result<Handled, ViewServerError> {
        let Value::Array(parts) = frame else {
            return Err(ViewServerError::fatal(
                "unknown_command",
                "command frame is not an array",
            ));
        };
        let Some(command) = parts.first().and_then(Value::as_str).map(str::to_string) else {
            return Err(ViewServerError::fatal(
                "unknown_command",
                "command frame has no command name",
            ));
        };
        let args = &parts[1..];
        debug!(%command, line_length = self.state.line_length, "processing command");

        let version = self.version.clone();
        match command.as_str() {
            "reset" => Ok(Handled::Value(
                self.state.reset(args.first(), &version),
            )),
            "add_fun" => {
                let source = str_arg(args, 0, "add_fun")?;
                self.state
                    .add_fun(self.evaluator.as_ref(), &version, source)
                    .map(Handled::Value)
            }
            "add_lib" if version.view_libs() => Ok(Handled::Value(
                self.state.add_lib(value_arg(args, 0, "add_lib")?.clone()),
            )),
            "map_doc" => {
                let doc = value_arg(args, 0, "map_doc")?;
                views::map_doc(self.evaluator.as_ref(), &self.ctx, &self.state, doc)
                    .map(Handled::Value)
            }
            "reduce" => {
                let sources = array_arg(args, 0, "reduce")?;
                let kvs = array_arg(args, 1, "reduce")?;
                views::reduce(self.evaluator.as_ref(), &self.state, sources, kvs, false)
                    .map(Handled::Value)
            }
            "rereduce" => {
                let sources = array_arg(args, 0, "rereduce")?;
                let values = array_arg(args, 1, "rereduce")?;
                views::rereduce(self.evaluator.as_ref(), &self.state, sources, values)
                    .map(Handled::Value)
            }
            "validate" if !version.ddoc_commands() => {
                let source = str_arg(args, 0, "validate")?;
                validate::validate(self.evaluator.as_ref(), source, &args[1..])
                    .map(Handled::Value)
            }
            "show" if version.streaming_render() && !version.ddoc_commands() => {
                let source = str_arg(args, 0, "show")?;
                let func = self.evaluator.compile(source, None)?;
                let doc = args.get(1).cloned().unwrap_or(Value::Null);
                let req = args.get(2).cloned().unwrap_or(Value::Null);
                render::run_show(self.evaluator.as_ref(), &self.ctx, &func, &doc, &req)
                    .map(Handled::Value)
            }
            "update" if version.streaming_render() && !version.ddoc_commands() => {
                let source = str_arg(args, 0, "update")?;
                let func = self.evaluator.compile(source, None)?;
                let doc = args.get(1).cloned().unwrap_or(Value::Null);
                let req = args.get(2).cloned().unwrap_or(Value::Null);
                render::run_update(
                    self.evaluator.as_ref(),
                    &self.ctx,
                    self.config.allow_get_update,
                    &func,
                    &doc,
                    &req,
                )
                .map(Handled::Value)
            }
            "list" if version.streaming_render() && !version.ddoc_commands() => {
                let func = self.first_function()?;
                let head = args.first().cloned().unwrap_or(Value::Null);
                let req = args.get(1).cloned().unwrap_or(Value::Null);
                render::run_list(self.evaluator.as_ref(), &self.ctx, &func, &head, &req)
                    .map(|()| Handled::Streamed)
            }
            "filter" if version.streaming_render() && !version.ddoc_commands() => {
                let func = self.first_function()?;
                let docs = array_arg(args, 0, "filter")?.to_vec();
                let req = args.get(1).cloned().unwrap_or(Value::Null);
                let userctx = args.get(2).cloned();
                filters::run_filter(
                    self.evaluator.as_ref(),
                    &func,
                    &docs,
                    &req,
                    userctx.as_ref(),
                )
                .map(Handled::Value)
            }
            "show_doc" if !version.streaming_render() => {
                let source = str_arg(args, 0, "show_doc")?;
                let doc = args.get(1).cloned().unwrap_or(Value::Null);
                let req = args.get(2).cloned().unwrap_or(Value::Null);
                render::show_doc(self.evaluator.as_ref(), &self.ctx, source, &doc, &req)
                    .map(Handled::Value)
            }
            "list_begin" if !version.streaming_render() => {
                let head = args.first().cloned().unwrap_or(Value::Null);
                let req = args.get(1).cloned().unwrap_or(Value::Null);
                render::list_begin(self.evaluator.as_ref(), &mut self.state, &head, &req)
                    .map(Handled::Value)
            }
            "list_row" if !version.streaming_render() => {
                let row = args.first().cloned().unwrap_or(Value::Null);
                let req = args.get(1).cloned().unwrap_or(Value::Null);
                render::list_row(self.evaluator.as_ref(), &mut self.state, &row, &req)
                    .map(Handled::Value)
            }
            "list_tail" if !version.streaming_render() => {
                let req = args.first().cloned().unwrap_or(Value::Null);
                render::list_tail(self.evaluator.as_ref(), &mut self.state, &req)
                    .map(Handled::Value)
            }
            "ddoc" if version.ddoc_commands() => self.process_ddoc(args),
            other => Err(ViewServerError::fatal(
                "unknown_command",
                format!("unknown command {other}"),
            )),
        }
    }

    /// The `ddoc` command: either installs a design document (`new`) or
    /// walks one to a function and dispatches on the path head.
    fn process_ddoc(&mut self, args: &[Value]) -> Result<Handled, ViewServerError> {
        let head = str_arg(args, 0, "ddoc")?;
        if head == "new" {
            let ddoc_id = str_arg(args, 1, "ddoc")?;
            let ddoc = value_arg(args, 2, "ddoc")?;
            self.ddocs.insert(ddoc_id, ddoc);
            return Ok(Handled::Value(Value::Bool(true)));
        }

        let ddoc_id = head.to_string();
        let root = self.ddocs.get(&ddoc_id)?;
        let path: Vec<String> = array_arg(args, 1, "ddoc")?
            .iter()
            .map(|segment| {
                segment
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| type_error("ddoc", "function path must be strings"))
            })
            .collect::<Result<_, _>>()?;
        let command = path.first().cloned().unwrap_or_default();
        if !self.is_ddoc_command(&command) {
            return Err(ViewServerError::fatal(
                "unknown_command",
                format!("unknown ddoc command `{command}`"),
            ));
        }
        let fun_args = array_arg(args, 2, "ddoc")?.to_vec();

        let node = ddoc::lookup(&root, &ddoc_id, &path)?;
        let func = {
            let compiled = match &*node.borrow() {
                DdocNode::Fn(handle) => Some(handle.clone()),
                DdocNode::Source(_) => None,
                _ => {
                    return Err(ViewServerError::error(
                        "compilation_error",
                        format!("expected function source at {}", path.join("/")),
                    ))
                }
            };
            match compiled {
                Some(handle) => handle,
                None => {
                    let source = match &*node.borrow() {
                        DdocNode::Source(source) => source.clone(),
                        _ => String::new(),
                    };
                    let handle = self.evaluator.compile(&source, Some(root.clone()))?;
                    *node.borrow_mut() = DdocNode::Fn(handle.clone());
                    handle
                }
            }
        };
        debug!(%ddoc_id, path = %path.join("/"), "run design function");

        match command.as_str() {
            "shows" => {
                let doc = fun_args.first().cloned().unwrap_or(Value::Null);
                let req = fun_args.get(1).cloned().unwrap_or(Value::Null);
                render::run_show(self.evaluator.as_ref(), &self.ctx, &func, &doc, &req)
                    .map(Handled::Value)
            }
            "lists" => {
                let head = fun_args.first().cloned().unwrap_or(Value::Null);
                let req = fun_args.get(1).cloned().unwrap_or(Value::Null);
                render::run_list(self.evaluator.as_ref(), &self.ctx, &func, &head, &req)
                    .map(|()| Handled::Streamed)
            }
            "updates" => {
                let doc = fun_args.first().cloned().unwrap_or(Value::Null);
                let req = fun_args.get(1).cloned().unwrap_or(Value::Null);
                render::run_update(
                    self.evaluator.as_ref(),
                    &self.ctx,
                    self.config.allow_get_update,
                    &func,
                    &doc,
                    &req,
                )
                .map(Handled::Value)
            }
            "filters" => {
                let docs = match fun_args.first() {
                    Some(Value::Array(docs)) => docs.clone(),
                    _ => Vec::new(),
                };
                let req = fun_args.get(1).cloned().unwrap_or(Value::Null);
                let userctx = if self.version.trims_filter_userctx() {
                    None
                } else {
                    fun_args.get(2).cloned()
                };
                filters::run_filter(
                    self.evaluator.as_ref(),
                    &func,
                    &docs,
                    &req,
                    userctx.as_ref(),
                )
                .map(Handled::Value)
            }
            "views" => {
                let docs = match fun_args.first() {
                    Some(Value::Array(docs)) => docs.clone(),
                    _ => Vec::new(),
                };
                views::filter_view(self.evaluator.as_ref(), &self.ctx, &func, &docs)
                    .map(Handled::Value)
            }
            "validate_doc_update" => {
                validate::ddoc_validate(self.evaluator.as_ref(), &self.version, &func, &fun_args)
                    .map(Handled::Value)
            }
            _ => Err(ViewServerError::fatal(
                "unknown_command",
                format!("unknown ddoc command `{command}`"),
            )),
        }
    }

    fn is_ddoc_command(&self, command: &str) -> bool {
        match command {
            "shows" | "lists" | "updates" | "filters" | "validate_doc_update" => true,
            "views" => self.version.view_libs(),
            _ => false,
        }
    }

    fn first_function(&self) -> Result<FunctionHandle, ViewServerError> {
        self.state.functions.first().cloned().ok_or_else(|| {
            ViewServerError::unexpected("IndexError", "no function registered via add_fun")
        })
    }
}

fn type_error(command: &str, detail: &str) -> ViewServerError {
    ViewServerError::unexpected("TypeError", format!("command `{command}`: {detail}"))
}

fn value_arg<'a>(
    args: &'a [Value],
    index: usize,
    command: &str,
) -> Result<&'a Value, ViewServerError> {
    args.get(index)
        .ok_or_else(|| type_error(command, &format!("missing argument {index}")))
}

fn str_arg<'a>(args: &'a [Value], index: usize, command: &str) -> Result<&'a str, ViewServerError> {
    value_arg(args, index, command)?
        .as_str()
        .ok_or_else(|| type_error(command, &format!("argument {index} must be a string")))
}

fn array_arg<'a>(
    args: &'a [Value],
    index: usize,
    command: &str,
) -> Result<&'a [Value], ViewServerError> {
    value_arg(args, index, command)?
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| type_error(command, &format!("argument {index} must be an array")))
}
