use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{json, Map, Value};
use tracing::{debug, error};

use crate::error::ViewServerError;
use crate::eval::{CallContext, CallError, Evaluator, FunctionHandle};
use crate::filters::truthy;
use crate::mime;
use crate::state::{RowInfo, State};

/// Per-command render scratch, shared between the engine and the `start` /
/// `send` / `get_row` capability hooks.
///
/// `gotrow` and `lastrow` drive the row generator: the first pull emits the
/// opening `start` frame, later pulls flush `chunks` frames, and once the
/// host answers `list_end` every further pull yields nothing. `rows_allowed`
/// is only set while a list function runs; a show function pulling rows is a
/// render error.
#[derive(Default)]
pub struct RenderScratch {
    pub chunks: Vec<String>,
    pub startresp: Map<String, Value>,
    pub gotrow: bool,
    pub lastrow: bool,
    pub rows_allowed: bool,
}

impl RenderScratch {
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.startresp.clear();
        self.gotrow = false;
        self.lastrow = false;
        self.rows_allowed = false;
    }
}

/// Wraps a bare string response into `{"body": ...}`.
pub fn maybe_wrap_response(resp: Value) -> Value {
    match resp {
        Value::String(body) => json!({ "body": body }),
        other => other,
    }
}

/// Ensures `resp` carries a `Content-Type` header when one was negotiated.
pub fn apply_content_type(resp: Value, content_type: Option<&str>) -> Value {
    let mut resp = match resp {
        Value::Object(map) => map,
        other => return other,
    };
    let headers = resp.entry("headers").or_insert_with(|| json!({}));
    if !headers.is_object() {
        *headers = json!({});
    }
    if let (Some(content_type), Value::Object(headers)) = (content_type, headers) {
        if !headers.contains_key("Content-Type") {
            headers.insert("Content-Type".to_string(), json!(content_type));
        }
    }
    Value::Object(resp)
}

fn coerce_chunk(chunk: &Value) -> String {
    match chunk {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn is_doc_request_path(req: &Value) -> bool {
    req.get("path")
        .and_then(Value::as_array)
        .map(|path| path.len() > 5)
        .unwrap_or(false)
}

fn send_start(ctx: &Rc<RefCell<CallContext>>) -> Result<(), ViewServerError> {
    debug!("starting response");
    let frame = {
        let mut c = ctx.borrow_mut();
        let startresp = std::mem::take(&mut c.render.startresp);
        let resp = apply_content_type(Value::Object(startresp), c.mime.resp_content_type());
        let chunks: Vec<Value> = c.render.chunks.drain(..).map(Value::String).collect();
        json!(["start", chunks, resp])
    };
    let io = ctx.borrow().io.clone();
    let result = io.borrow_mut().write_frame(&frame);
    result
}

fn blow_chunks(ctx: &Rc<RefCell<CallContext>>, label: &str) -> Result<(), ViewServerError> {
    let frame = {
        let mut c = ctx.borrow_mut();
        let chunks: Vec<Value> = c.render.chunks.drain(..).map(Value::String).collect();
        json!([label, chunks])
    };
    let io = ctx.borrow().io.clone();
    let result = io.borrow_mut().write_frame(&frame);
    result
}

/// Services one pull of the row generator inside a list function.
///
/// The first pull emits the opening `start` frame; every later pull flushes
/// accumulated chunks. Then one frame is read back from the host: `list_row`
/// yields its row, `list_end` (or end of input) finishes the generator, and
/// anything else is a protocol violation that kills the engine.
pub fn next_row(ctx: &Rc<RefCell<CallContext>>) -> Result<Option<Value>, ViewServerError> {
    {
        let c = ctx.borrow();
        if !c.render.rows_allowed {
            return Err(ViewServerError::error(
                "render_error",
                "get_row is only available within list functions",
            ));
        }
        if c.render.lastrow {
            return Ok(None);
        }
    }
    let gotrow = ctx.borrow().render.gotrow;
    if !gotrow {
        ctx.borrow_mut().render.gotrow = true;
        send_start(ctx)?;
    } else {
        blow_chunks(ctx, "chunks")?;
    }
    let io = ctx.borrow().io.clone();
    let frame = io.borrow_mut().read_frame()?;
    let Some((frame, _)) = frame else {
        ctx.borrow_mut().render.lastrow = true;
        return Ok(None);
    };
    match frame.get(0).and_then(Value::as_str) {
        Some("list_end") => {
            ctx.borrow_mut().render.lastrow = true;
            Ok(None)
        }
        Some("list_row") => Ok(Some(frame.get(1).cloned().unwrap_or(Value::Null))),
        other => {
            let name = other.map(str::to_string).unwrap_or_else(|| frame.to_string());
            error!(%name, "unexpected frame while reading list rows");
            Err(ViewServerError::fatal(
                "list_error",
                format!("not a row `{name}`"),
            ))
        }
    }
}

fn show_error(err: CallError, doc: &Value, req: &Value) -> ViewServerError {
    match err {
        CallError::Protocol(err) => err,
        other => {
            error!("show function raised: {}", other.message());
            if doc.is_null() && is_doc_request_path(req) {
                ViewServerError::error("not_found", "document not found")
            } else {
                ViewServerError::error("render_error", other.message())
            }
        }
    }
}

fn render_call_error(err: CallError) -> ViewServerError {
    match err {
        CallError::Protocol(err) => err,
        other => {
            error!("render function raised: {}", other.message());
            ViewServerError::error("render_error", other.message())
        }
    }
}

/// Runs a show function and produces its `["resp", ...]` frame.
pub fn run_show(
    evaluator: &dyn Evaluator,
    ctx: &Rc<RefCell<CallContext>>,
    func: &FunctionHandle,
    doc: &Value,
    req: &Value,
) -> Result<Value, ViewServerError> {
    {
        let mut c = ctx.borrow_mut();
        c.render.reset();
        c.mime.reset_provides();
    }
    let mut resp = evaluator
        .call(func, &[doc.clone(), req.clone()])
        .map_err(|err| show_error(err, doc, req))?;
    if resp.is_null() {
        resp = json!({});
    }
    let has_chunks = !ctx.borrow().render.chunks.is_empty();
    if has_chunks {
        resp = maybe_wrap_response(resp);
        let mut c = ctx.borrow_mut();
        if let Value::Object(obj) = &mut resp {
            let headers = obj.entry("headers").or_insert_with(|| json!({}));
            if !headers.is_object() {
                *headers = json!({});
            }
            if let Value::Object(headers) = headers {
                // Shallow overlay: anything already in resp.headers wins.
                for (key, value) in c.render.startresp.iter() {
                    if !headers.contains_key(key) {
                        headers.insert(key.clone(), value.clone());
                    }
                }
            }
            let body = c.render.chunks.concat()
                + obj.get("body").and_then(Value::as_str).unwrap_or_default();
            obj.insert("body".to_string(), Value::String(body));
        }
        c.render.reset();
    }
    let provides_used = ctx.borrow().mime.provides_used();
    if provides_used {
        resp = mime::run_provides(evaluator, ctx, req, None)
            .map_err(|err| show_error(err, doc, req))?;
        resp = maybe_wrap_response(resp);
        let content_type = ctx.borrow().mime.resp_content_type().map(str::to_string);
        resp = apply_content_type(resp, content_type.as_deref());
    }
    if matches!(resp, Value::Object(_) | Value::String(_)) {
        Ok(json!(["resp", maybe_wrap_response(resp)]))
    } else {
        error!(%resp, "invalid response object");
        Err(ViewServerError::error(
            "render_error",
            "undefined response from show function",
        ))
    }
}

/// Runs an update function and produces its `["up", doc, resp]` frame.
pub fn run_update(
    evaluator: &dyn Evaluator,
    ctx: &Rc<RefCell<CallContext>>,
    allow_get_update: bool,
    func: &FunctionHandle,
    doc: &Value,
    req: &Value,
) -> Result<Value, ViewServerError> {
    ctx.borrow_mut().render.reset();
    let method = req.get("method").and_then(Value::as_str).unwrap_or_default();
    if method == "GET" && !allow_get_update {
        error!("method `GET` is not allowed for update functions");
        return Err(ViewServerError::error(
            "method_not_allowed",
            "Method `GET` is not allowed for update functions",
        ));
    }
    let result = evaluator
        .call(func, &[doc.clone(), req.clone()])
        .map_err(render_call_error)?;
    let Value::Array(mut pair) = result else {
        return Err(undefined_update_response());
    };
    if pair.len() != 2 {
        return Err(undefined_update_response());
    }
    let resp = pair.pop().unwrap_or(Value::Null);
    let new_doc = pair.pop().unwrap_or(Value::Null);
    if matches!(resp, Value::Object(_) | Value::String(_)) {
        Ok(json!(["up", new_doc, maybe_wrap_response(resp)]))
    } else {
        error!(%resp, "invalid response object");
        Err(undefined_update_response())
    }
}

fn undefined_update_response() -> ViewServerError {
    ViewServerError::error("render_error", "undefined response from update function")
}

/// Runs a list function, streaming `start`, `chunks` and `end` frames.
///
/// The user function drives its own output through `send` and `get_row`; this
/// wrapper only finishes the job: content negotiation supplies the tail when
/// `provides` was used, an untouched row generator is drained once so the
/// `start` frame always precedes `end`, and the final chunks flush as `end`.
pub fn run_list(
    evaluator: &dyn Evaluator,
    ctx: &Rc<RefCell<CallContext>>,
    func: &FunctionHandle,
    head: &Value,
    req: &Value,
) -> Result<(), ViewServerError> {
    {
        let mut c = ctx.borrow_mut();
        c.mime.reset_provides();
        c.render.reset();
        c.render.rows_allowed = true;
    }
    let result = run_list_inner(evaluator, ctx, func, head, req);
    ctx.borrow_mut().render.reset();
    result
}

fn run_list_inner(
    evaluator: &dyn Evaluator,
    ctx: &Rc<RefCell<CallContext>>,
    func: &FunctionHandle,
    head: &Value,
    req: &Value,
) -> Result<(), ViewServerError> {
    let mut tail = evaluator
        .call(func, &[head.clone(), req.clone()])
        .map_err(render_call_error)?;
    let provides_used = ctx.borrow().mime.provides_used();
    if provides_used {
        tail = mime::run_provides(evaluator, ctx, req, None).map_err(render_call_error)?;
    }
    let gotrow = ctx.borrow().render.gotrow;
    if !gotrow {
        let _ = next_row(ctx)?;
    }
    if !tail.is_null() {
        let chunk = coerce_chunk(&tail);
        ctx.borrow_mut().render.chunks.push(chunk);
    }
    blow_chunks(ctx, "end")
}

/// Legacy (`<0.10.0`) render entry point: one synchronous call, one response.
pub fn render_function(
    evaluator: &dyn Evaluator,
    func: &FunctionHandle,
    args: &[Value],
) -> Result<Value, ViewServerError> {
    match evaluator.call(func, args) {
        Ok(resp) if truthy(&resp) => Ok(maybe_wrap_response(resp)),
        Ok(resp) => {
            error!(%resp, "undefined response from render function");
            Err(ViewServerError::error(
                "render_error",
                format!("undefined response from render function: {resp}"),
            ))
        }
        Err(CallError::Protocol(err)) => Err(err),
        Err(other) => {
            error!("render function raised: {}", other.message());
            Err(ViewServerError::error("render_error", other.message()))
        }
    }
}

/// Legacy `show_doc` command: compile and render in one step.
pub fn show_doc(
    evaluator: &dyn Evaluator,
    ctx: &Rc<RefCell<CallContext>>,
    source: &str,
    doc: &Value,
    req: &Value,
) -> Result<Value, ViewServerError> {
    ctx.borrow_mut().mime.reset_provides();
    let func = evaluator.compile(source, None)?;
    render_function(evaluator, &func, &[doc.clone(), req.clone()])
}

fn legacy_function(state: &State) -> Result<FunctionHandle, ViewServerError> {
    state.functions.first().cloned().ok_or_else(|| {
        ViewServerError::unexpected("IndexError", "no list function registered via add_fun")
    })
}

fn row_info_value(info: &RowInfo) -> Result<Value, ViewServerError> {
    serde_json::to_value(info)
        .map_err(|err| ViewServerError::unexpected("TypeError", err.to_string()))
}

/// Legacy `list_begin`: seed the per-function row info and render the head.
pub fn list_begin(
    evaluator: &dyn Evaluator,
    state: &mut State,
    head: &Value,
    req: &Value,
) -> Result<Value, ViewServerError> {
    let func = legacy_function(state)?;
    state.row_info.insert(0, RowInfo::default());
    render_function(
        evaluator,
        &func,
        &[head.clone(), Value::Null, req.clone(), Value::Null],
    )
}

/// Legacy `list_row`: render one row, threading the row info through.
pub fn list_row(
    evaluator: &dyn Evaluator,
    state: &mut State,
    row: &Value,
    req: &Value,
) -> Result<Value, ViewServerError> {
    let func = legacy_function(state)?;
    let mut info = state.row_info.get(&0).cloned().ok_or_else(|| {
        ViewServerError::unexpected("AssertionError", "list_row arrived before list_begin")
    })?;
    let resp = render_function(
        evaluator,
        &func,
        &[Value::Null, row.clone(), req.clone(), row_info_value(&info)?],
    )?;
    let key = row.get("key").cloned().unwrap_or(Value::Null);
    if info.first_key.is_null() {
        info.first_key = key.clone();
    }
    info.prev_key = key;
    info.row_number += 1;
    state.row_info.insert(0, info);
    Ok(resp)
}

/// Legacy `list_tail`: final render, consuming the row info.
pub fn list_tail(
    evaluator: &dyn Evaluator,
    state: &mut State,
    req: &Value,
) -> Result<Value, ViewServerError> {
    let func = legacy_function(state)?;
    let info = match state.row_info.remove(&0) {
        Some(info) => row_info_value(&info)?,
        None => Value::Null,
    };
    render_function(
        evaluator,
        &func,
        &[Value::Null, Value::Null, req.clone(), info],
    )
}
