use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{
    Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Map, NativeCallContext, Position,
    Scope, AST,
};
use serde_json::{json, Value};
use tracing::debug;

use crate::ddoc::{DdocNode, NodeRef};
use crate::error::ViewServerError;
use crate::eval::{
    CallContext, CallError, Evaluator, FunctionHandle, ModuleHandle, ProviderHandle,
};
use crate::render;
use crate::require::{self, ModuleRecord};
use crate::version::ProtocolVersion;

/// Key tagging thrown values that carry a wire-protocol error through the
/// script engine.
const ERROR_TAG: &str = "$view_server_error";

struct CompiledFn {
    ast: Rc<AST>,
    name: String,
    params: usize,
    ddoc: Option<NodeRef>,
}

struct CompiledModule {
    ast: Rc<AST>,
    source: String,
}

struct RhaiProvider {
    fn_ptr: FnPtr,
    ast: Rc<AST>,
    ddoc: Option<NodeRef>,
}

struct ExecFrame {
    ast: Rc<AST>,
    ddoc: Option<NodeRef>,
    module: Option<Rc<ModuleRecord>>,
}

#[derive(Default)]
struct ExecState {
    frames: Vec<ExecFrame>,
    /// Module ids currently being resolved in the active `require` chain.
    visited: Vec<String>,
}

fn strip_bom(source: &str) -> &str {
    source.strip_prefix('\u{feff}').unwrap_or(source)
}

fn compilation_error(reason: impl fmt::Display, source: &str) -> ViewServerError {
    ViewServerError::error("compilation_error", format!("{reason}\n{source}"))
}

fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(message.into()), Position::NONE).into()
}

/// Re-throws a wire-protocol error as a tagged script value, so it survives
/// the trip through the engine and classifies back into the same error.
fn throw_protocol(err: ViewServerError) -> Box<EvalAltResult> {
    let (kind, id, reason) = match err {
        ViewServerError::Recoverable { id, reason } => ("error", id, reason),
        ViewServerError::Fatal { id, reason } => ("fatal", id, reason),
        ViewServerError::Forbidden(reason) => ("forbidden", String::new(), reason),
        ViewServerError::Unexpected { name, message } => ("unexpected", name, message),
    };
    tagged_throw(kind, id, reason)
}

fn throw_assertion(message: String) -> Box<EvalAltResult> {
    tagged_throw("assertion", String::new(), message)
}

fn tagged_throw(kind: &str, id: String, reason: String) -> Box<EvalAltResult> {
    let mut map = Map::new();
    map.insert(ERROR_TAG.into(), kind.into());
    map.insert("id".into(), id.into());
    map.insert("reason".into(), reason.into());
    EvalAltResult::ErrorRuntime(Dynamic::from(map), Position::NONE).into()
}

fn tagged_error(value: &Dynamic) -> Option<CallError> {
    let map = value.read_lock::<Map>()?;
    let kind = map.get(ERROR_TAG)?.clone().into_string().ok()?;
    let field = |name: &str| {
        map.get(name)
            .and_then(|item| item.clone().into_string().ok())
            .unwrap_or_default()
    };
    let id = field("id");
    let reason = field("reason");
    Some(match kind.as_str() {
        "error" => CallError::Protocol(ViewServerError::error(id, reason)),
        "fatal" => CallError::Protocol(ViewServerError::fatal(id, reason)),
        "forbidden" => CallError::Protocol(ViewServerError::forbidden(reason)),
        "unexpected" => CallError::Protocol(ViewServerError::unexpected(id, reason)),
        "assertion" => CallError::Assertion(reason),
        _ => return None,
    })
}

/// Maps a script-engine failure into the call-error taxonomy.
fn classify(err: Box<EvalAltResult>) -> CallError {
    match *err {
        EvalAltResult::ErrorRuntime(value, _) => {
            if let Some(known) = tagged_error(&value) {
                known
            } else {
                CallError::Native {
                    name: "RuntimeError".to_string(),
                    message: value.to_string(),
                }
            }
        }
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => classify(inner),
        EvalAltResult::ErrorFunctionNotFound(name, _) => CallError::Native {
            name: "ReferenceError".to_string(),
            message: format!("function not found: {name}"),
        },
        EvalAltResult::ErrorVariableNotFound(name, _) => CallError::Native {
            name: "ReferenceError".to_string(),
            message: format!("variable not found: {name}"),
        },
        EvalAltResult::ErrorMismatchDataType(requested, actual, _) => CallError::Native {
            name: "TypeError".to_string(),
            message: format!("expected {requested}, got {actual}"),
        },
        EvalAltResult::ErrorMismatchOutputType(requested, actual, _) => CallError::Native {
            name: "TypeError".to_string(),
            message: format!("expected {requested} output, got {actual}"),
        },
        EvalAltResult::ErrorArithmetic(message, _) => CallError::Native {
            name: "ArithmeticError".to_string(),
            message,
        },
        other => CallError::Native {
            name: "RuntimeError".to_string(),
            message: other.to_string(),
        },
    }
}

/// Script evaluator embedding the [rhai](https://rhai.rs) engine.
///
/// User functions are rhai scripts defining exactly one `fn`. Capabilities
/// (`log`, `emit`, `send`, `get_row`, `provides`, `require`, ...) are host
/// functions registered once at construction; they reach the engine through
/// the shared [`CallContext`], so a compiled handle can be called at any
/// point of the protocol lifecycle.
pub struct RhaiEvaluator {
    engine: Engine,
    exec: Rc<RefCell<ExecState>>,
}

impl RhaiEvaluator {
    pub fn new(version: &ProtocolVersion, ctx: Rc<RefCell<CallContext>>) -> Self {
        let mut engine = Engine::new();
        let exec = Rc::new(RefCell::new(ExecState::default()));

        register_common(&mut engine, &ctx, &exec);
        if version.streaming_render() {
            register_streaming(&mut engine, &ctx, &exec);
        } else {
            register_legacy(&mut engine, &ctx, &exec);
        }

        RhaiEvaluator { engine, exec }
    }

    fn push_frame(&self, frame: ExecFrame) {
        self.exec.borrow_mut().frames.push(frame);
    }

    fn pop_frame(&self) {
        self.exec.borrow_mut().frames.pop();
    }
}

impl Evaluator for RhaiEvaluator {
    fn compile(
        &self,
        source: &str,
        ddoc: Option<NodeRef>,
    ) -> Result<FunctionHandle, ViewServerError> {
        let source = strip_bom(source);
        debug!("compiling function source");
        let ast = self
            .engine
            .compile(source)
            .map_err(|err| compilation_error(err, source))?;
        if !ast.statements().is_empty() {
            return Err(compilation_error(
                "Only function definitions are allowed at the top level namespace",
                source,
            ));
        }
        let (name, params) = {
            let mut functions = ast.iter_functions();
            let first = functions.next().ok_or_else(|| {
                compilation_error("Expression does not eval to a function", source)
            })?;
            if functions.next().is_some() {
                return Err(compilation_error(
                    "Multiple functions are defined. Only one is allowed.",
                    source,
                ));
            }
            (first.name.to_string(), first.params.len())
        };
        Ok(FunctionHandle::new(CompiledFn {
            ast: Rc::new(ast),
            name,
            params,
            ddoc,
        }))
    }

    fn arity(&self, func: &FunctionHandle) -> usize {
        func.downcast::<CompiledFn>()
            .map(|compiled| compiled.params)
            .unwrap_or(0)
    }

    fn call(&self, func: &FunctionHandle, args: &[Value]) -> Result<Value, CallError> {
        let compiled = func.downcast::<CompiledFn>().ok_or_else(|| CallError::Native {
            name: "TypeError".to_string(),
            message: "foreign function handle".to_string(),
        })?;
        let mut call_args = Vec::with_capacity(args.len());
        for arg in args {
            call_args.push(to_dynamic(arg).map_err(classify)?);
        }
        self.push_frame(ExecFrame {
            ast: compiled.ast.clone(),
            ddoc: compiled.ddoc.clone(),
            module: None,
        });
        let mut scope = Scope::new();
        let result =
            self.engine
                .call_fn::<Dynamic>(&mut scope, &compiled.ast, &compiled.name, call_args);
        self.pop_frame();
        match result {
            Ok(value) => from_dynamic(&value).map_err(classify),
            Err(err) => Err(classify(err)),
        }
    }

    fn call_provider(&self, provider: &ProviderHandle) -> Result<Value, CallError> {
        let provider = provider
            .downcast::<RhaiProvider>()
            .ok_or_else(|| CallError::Native {
                name: "TypeError".to_string(),
                message: "foreign provider handle".to_string(),
            })?;
        self.push_frame(ExecFrame {
            ast: provider.ast.clone(),
            ddoc: provider.ddoc.clone(),
            module: None,
        });
        let result = provider
            .fn_ptr
            .call::<Dynamic>(&self.engine, &provider.ast, ());
        self.pop_frame();
        match result {
            Ok(value) => from_dynamic(&value).map_err(classify),
            Err(err) => Err(classify(err)),
        }
    }
}

/// Capabilities present in every version's namespace.
fn register_common(
    engine: &mut Engine,
    ctx: &Rc<RefCell<CallContext>>,
    exec: &Rc<RefCell<ExecState>>,
) {
    let ctx_log = ctx.clone();
    engine.register_fn(
        "log",
        move |message: Dynamic| -> Result<(), Box<EvalAltResult>> {
            let message = from_dynamic::<Value>(&message)?;
            ctx_log.borrow().log(message).map_err(throw_protocol)
        },
    );

    let ctx_emit = ctx.clone();
    engine.register_fn(
        "emit",
        move |key: Dynamic, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
            let key = from_dynamic::<Value>(&key)?;
            let value = from_dynamic::<Value>(&value)?;
            ctx_emit.borrow_mut().emitted.push(json!([key, value]));
            Ok(())
        },
    );

    engine.register_fn(
        "Error",
        |id: ImmutableString, reason: ImmutableString| -> Result<Dynamic, Box<EvalAltResult>> {
            Err(throw_protocol(ViewServerError::error(
                id.as_str(),
                reason.as_str(),
            )))
        },
    );
    engine.register_fn(
        "FatalError",
        |id: ImmutableString, reason: ImmutableString| -> Result<Dynamic, Box<EvalAltResult>> {
            Err(throw_protocol(ViewServerError::fatal(
                id.as_str(),
                reason.as_str(),
            )))
        },
    );
    engine.register_fn(
        "Forbidden",
        |reason: ImmutableString| -> Result<Dynamic, Box<EvalAltResult>> {
            Err(throw_protocol(ViewServerError::forbidden(reason.as_str())))
        },
    );

    engine.register_fn("assert", |cond: bool| -> Result<(), Box<EvalAltResult>> {
        if cond {
            Ok(())
        } else {
            Err(throw_assertion("assertion failed".to_string()))
        }
    });
    engine.register_fn(
        "assert",
        |cond: bool, message: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            if cond {
                Ok(())
            } else {
                Err(throw_assertion(message.to_string()))
            }
        },
    );

    engine.register_fn(
        "json_encode",
        |value: Dynamic| -> Result<ImmutableString, Box<EvalAltResult>> {
            let value = from_dynamic::<Value>(&value)?;
            Ok(value.to_string().into())
        },
    );
    engine.register_fn(
        "json_decode",
        |text: ImmutableString| -> Result<Dynamic, Box<EvalAltResult>> {
            let value: Value = serde_json::from_str(&text)
                .map_err(|err| runtime_error(format!("invalid JSON: {err}")))?;
            to_dynamic(&value)
        },
    );

    register_mime_types(engine, ctx);

    let exec_require = exec.clone();
    engine.register_fn(
        "require",
        move |call: NativeCallContext, path: ImmutableString| -> Result<Dynamic, Box<EvalAltResult>> {
            require_module(&call, &exec_require, path.as_str())
        },
    );
}

fn register_mime_types(engine: &mut Engine, ctx: &Rc<RefCell<CallContext>>) {
    let c = ctx.clone();
    engine.register_fn(
        "register_type",
        move |key: ImmutableString, t1: ImmutableString| {
            c.borrow_mut().mime.register_type(&key, vec![t1.to_string()]);
        },
    );
    let c = ctx.clone();
    engine.register_fn(
        "register_type",
        move |key: ImmutableString, t1: ImmutableString, t2: ImmutableString| {
            c.borrow_mut()
                .mime
                .register_type(&key, vec![t1.to_string(), t2.to_string()]);
        },
    );
    let c = ctx.clone();
    engine.register_fn(
        "register_type",
        move |key: ImmutableString, t1: ImmutableString, t2: ImmutableString, t3: ImmutableString| {
            c.borrow_mut().mime.register_type(
                &key,
                vec![t1.to_string(), t2.to_string(), t3.to_string()],
            );
        },
    );
}

/// Capabilities of the streaming render protocol (0.10.0+).
fn register_streaming(
    engine: &mut Engine,
    ctx: &Rc<RefCell<CallContext>>,
    exec: &Rc<RefCell<ExecState>>,
) {
    let ctx_start = ctx.clone();
    engine.register_fn("start", move || {
        ctx_start.borrow_mut().render.startresp.clear();
    });
    let ctx_start = ctx.clone();
    engine.register_fn(
        "start",
        move |resp: Map| -> Result<(), Box<EvalAltResult>> {
            let resp = from_dynamic::<Value>(&Dynamic::from(resp))?;
            let resp = match resp {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            ctx_start.borrow_mut().render.startresp = resp;
            Ok(())
        },
    );

    let ctx_send = ctx.clone();
    engine.register_fn(
        "send",
        move |chunk: Dynamic| -> Result<(), Box<EvalAltResult>> {
            let chunk = chunk_to_string(&chunk)?;
            ctx_send.borrow_mut().render.chunks.push(chunk);
            Ok(())
        },
    );

    let ctx_rows = ctx.clone();
    engine.register_fn("get_row", move || -> Result<Dynamic, Box<EvalAltResult>> {
        match render::next_row(&ctx_rows) {
            Ok(Some(row)) => to_dynamic(&row),
            Ok(None) => Ok(Dynamic::UNIT),
            Err(err) => Err(throw_protocol(err)),
        }
    });

    let ctx_provides = ctx.clone();
    let exec_provides = exec.clone();
    engine.register_fn(
        "provides",
        move |key: ImmutableString, func: FnPtr| -> Result<(), Box<EvalAltResult>> {
            let (ast, ddoc) = current_frame(&exec_provides)?;
            ctx_provides.borrow_mut().mime.provides(
                &key,
                ProviderHandle::new(RhaiProvider {
                    fn_ptr: func,
                    ast,
                    ddoc,
                }),
            );
            Ok(())
        },
    );
}

/// Capabilities of the legacy render protocol (`<0.10.0`).
fn register_legacy(
    engine: &mut Engine,
    ctx: &Rc<RefCell<CallContext>>,
    exec: &Rc<RefCell<ExecState>>,
) {
    let ctx_rw = ctx.clone();
    let exec_rw = exec.clone();
    engine.register_fn(
        "response_with",
        move |call: NativeCallContext,
              req: Map,
              mut responders: Map|
              -> Result<Dynamic, Box<EvalAltResult>> {
            let req = from_dynamic::<Value>(&Dynamic::from(req))?;
            let fallback = responders
                .remove("fallback")
                .and_then(|value| value.into_string().ok());
            {
                let (ast, ddoc) = current_frame(&exec_rw)?;
                let mut c = ctx_rw.borrow_mut();
                for (key, value) in responders {
                    let fn_ptr: FnPtr = value.try_cast().ok_or_else(|| {
                        runtime_error(format!("responder for `{key}` is not a function"))
                    })?;
                    c.mime.provides(
                        key.as_str(),
                        ProviderHandle::new(RhaiProvider {
                            fn_ptr,
                            ast: ast.clone(),
                            ddoc: ddoc.clone(),
                        }),
                    );
                }
            }
            let provider = ctx_rw.borrow_mut().mime.select(&req);
            let provider = match provider {
                Some(provider) => Some(provider),
                None => fallback
                    .as_deref()
                    .and_then(|fb| ctx_rw.borrow_mut().mime.select_fallback(fb)),
            };
            match provider {
                Some(provider) => {
                    let rhai_provider = provider
                        .downcast::<RhaiProvider>()
                        .ok_or_else(|| runtime_error("foreign provider handle"))?;
                    let resp = rhai_provider
                        .fn_ptr
                        .call_within_context::<Dynamic>(&call, ())?;
                    let resp = render::maybe_wrap_response(from_dynamic::<Value>(&resp)?);
                    let content_type =
                        ctx_rw.borrow().mime.resp_content_type().map(str::to_string);
                    to_dynamic(&render::apply_content_type(resp, content_type.as_deref()))
                }
                None => {
                    let mimetype = req
                        .get("query")
                        .and_then(|query| query.get("format"))
                        .and_then(Value::as_str)
                        .or_else(|| {
                            req.get("headers")
                                .and_then(|headers| headers.get("Accept"))
                                .and_then(Value::as_str)
                        })
                        .unwrap_or_default();
                    to_dynamic(&json!({
                        "code": 406,
                        "body": format!("Not Acceptable: {mimetype}"),
                    }))
                }
            }
        },
    );
}

fn current_frame(
    exec: &Rc<RefCell<ExecState>>,
) -> Result<(Rc<AST>, Option<NodeRef>), Box<EvalAltResult>> {
    let state = exec.borrow();
    let frame = state
        .frames
        .last()
        .ok_or_else(|| runtime_error("no function is currently executing"))?;
    Ok((frame.ast.clone(), frame.ddoc.clone()))
}

fn chunk_to_string(chunk: &Dynamic) -> Result<String, Box<EvalAltResult>> {
    if let Some(text) = chunk.read_lock::<ImmutableString>() {
        return Ok(text.to_string());
    }
    let value = from_dynamic::<Value>(chunk)?;
    Ok(match value {
        Value::String(text) => text,
        other => other.to_string(),
    })
}

/// The `require` capability: resolve, compile (memoizing), and execute a
/// module out of the design document in scope, returning its `exports`.
fn require_module(
    call: &NativeCallContext,
    exec: &Rc<RefCell<ExecState>>,
    path: &str,
) -> Result<Dynamic, Box<EvalAltResult>> {
    debug!(%path, "importing objects");
    let (start, ddoc) = {
        let state = exec.borrow();
        let frame = state
            .frames
            .last()
            .ok_or_else(|| runtime_error("require called outside of a function"))?;
        let ddoc = frame.ddoc.clone().ok_or_else(|| {
            runtime_error("require is not available: no design document in scope")
        })?;
        let start = frame
            .module
            .clone()
            .unwrap_or_else(|| ModuleRecord::root(ddoc.clone()));
        (start, ddoc)
    };
    let record = require::resolve(path, &start).map_err(throw_protocol)?;
    {
        let mut state = exec.borrow_mut();
        if state.visited.iter().any(|id| id == &record.id) {
            return Err(throw_protocol(ViewServerError::error(
                "compilation_error",
                format!("circular require of `{}`", record.id),
            )));
        }
        state.visited.push(record.id.clone());
    }
    let result = execute_module(call, exec, &ddoc, &record);
    exec.borrow_mut().visited.pop();
    result
}

fn execute_module(
    call: &NativeCallContext,
    exec: &Rc<RefCell<ExecState>>,
    ddoc: &NodeRef,
    record: &Rc<ModuleRecord>,
) -> Result<Dynamic, Box<EvalAltResult>> {
    let (compiled, source) = {
        let node = record.node.borrow();
        match &*node {
            DdocNode::Module(handle) => (Some(handle.clone()), None),
            DdocNode::Source(source) => (None, Some(source.clone())),
            _ => return Err(runtime_error("module leaf vanished during require")),
        }
    };
    let module = match compiled {
        Some(module) => module,
        None => {
            let source = source.unwrap_or_default();
            let stripped = strip_bom(&source);
            let ast = call.engine().compile(stripped).map_err(|err| {
                throw_protocol(compilation_error(err, stripped))
            })?;
            let module = ModuleHandle::new(CompiledModule {
                ast: Rc::new(ast),
                source: stripped.to_string(),
            });
            *record.node.borrow_mut() = DdocNode::Module(module.clone());
            module
        }
    };
    let module = module
        .downcast::<CompiledModule>()
        .ok_or_else(|| runtime_error("foreign module handle"))?;

    let mut module_obj = Map::new();
    module_obj.insert("id".into(), record.id.clone().into());
    let mut scope = Scope::new();
    scope.push("module", module_obj);
    scope.push("exports", Map::new());

    exec.borrow_mut().frames.push(ExecFrame {
        ast: module.ast.clone(),
        ddoc: Some(ddoc.clone()),
        module: Some(record.clone()),
    });
    let result = call
        .engine()
        .eval_ast_with_scope::<Dynamic>(&mut scope, &module.ast);
    exec.borrow_mut().frames.pop();

    match result {
        Ok(_) => {
            let exports = scope.get_value::<Map>("exports").unwrap_or_default();
            Ok(Dynamic::from(exports))
        }
        Err(err) => {
            let described = classify(err);
            Err(throw_protocol(compilation_error(
                format!("{}: {}", described.name(), described.message()),
                &module.source,
            )))
        }
    }
}
