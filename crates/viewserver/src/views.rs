use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{json, Value};
use tracing::{debug, error};

use crate::error::ViewServerError;
use crate::eval::{CallContext, CallError, Evaluator, FunctionHandle};
use crate::state::State;

const REDUCE_OUTPUT_FLOOR: usize = 200;

fn map_error(name: &str, docid: &str, source: &str) -> ViewServerError {
    ViewServerError::error(
        name,
        format!("Map function raised error for doc._id `{docid}`\n{source}\n"),
    )
}

/// The `map_doc` command: run every registered map function over `doc`.
///
/// Each function receives its own copy of the document, so one function
/// mutating its argument never leaks into the next. Emissions come from the
/// `emit` capability plus, for convenience, a returned array of
/// `[key, value]` pairs.
pub fn map_doc(
    evaluator: &dyn Evaluator,
    ctx: &Rc<RefCell<CallContext>>,
    state: &State,
    doc: &Value,
) -> Result<Value, ViewServerError> {
    let docid = doc
        .get("_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    debug!(%docid, "running map functions");
    let mut results = Vec::with_capacity(state.functions.len());
    for (index, func) in state.functions.iter().enumerate() {
        ctx.borrow_mut().emitted.clear();
        let returned = match evaluator.call(func, std::slice::from_ref(doc)) {
            Ok(value) => value,
            Err(CallError::Protocol(err)) => {
                error!("map function raised a protocol error, aborting");
                return Err(err);
            }
            Err(other) => {
                error!("map function raised: {}", other.message());
                return Err(map_error(other.name(), &docid, &state.functions_src[index]));
            }
        };
        let mut pairs: Vec<Value> = ctx.borrow_mut().emitted.drain(..).collect();
        match returned {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::Array(pair) if pair.len() == 2 => pairs.push(Value::Array(pair)),
                        _ => {
                            return Err(map_error(
                                "TypeError",
                                &docid,
                                &state.functions_src[index],
                            ))
                        }
                    }
                }
            }
            _ => {
                return Err(map_error(
                    "TypeError",
                    &docid,
                    &state.functions_src[index],
                ))
            }
        }
        results.push(Value::Array(pairs));
    }
    Ok(Value::Array(results))
}

fn encoded_len(value: &impl serde::Serialize) -> Result<usize, ViewServerError> {
    serde_json::to_string(value)
        .map(|encoded| encoded.len())
        .map_err(|err| ViewServerError::unexpected("TypeError", err.to_string()))
}

/// The `reduce` command (and, with `rereduce`, the `rereduce` command).
///
/// Reduce functions arrive as source every time and are compiled per call.
/// Each one is invoked with as many of `(keys, values, rereduce)` as it
/// declares parameters.
pub fn reduce(
    evaluator: &dyn Evaluator,
    state: &State,
    sources: &[Value],
    kvs: &[Value],
    rereduce: bool,
) -> Result<Value, ViewServerError> {
    let (keys, values) = if rereduce {
        (Value::Null, Value::Array(kvs.to_vec()))
    } else {
        let mut keys = Vec::with_capacity(kvs.len());
        let mut values = Vec::with_capacity(kvs.len());
        for kv in kvs {
            keys.push(kv.get(0).cloned().unwrap_or(Value::Null));
            values.push(kv.get(1).cloned().unwrap_or(Value::Null));
        }
        (Value::Array(keys), Value::Array(values))
    };
    let args = [keys, values, Value::Bool(rereduce)];
    let mut reductions = Vec::with_capacity(sources.len());
    for source in sources {
        let source = source.as_str().ok_or_else(|| {
            ViewServerError::unexpected("TypeError", "reduce function source must be a string")
        })?;
        let func = evaluator.compile(source, None)?;
        let arity = evaluator.arity(&func).min(args.len());
        let result = match evaluator.call(&func, &args[..arity]) {
            Ok(value) => value,
            Err(CallError::Protocol(err)) => {
                error!("reduce function raised a protocol error, aborting");
                return Err(err);
            }
            Err(other) => {
                error!("reduce function raised: {}", other.message());
                return Err(ViewServerError::error(
                    other.name(),
                    format!(
                        "Reduce function raised an error: {source}\n:\n{}",
                        other.message()
                    ),
                ));
            }
        };
        reductions.push(result);
    }
    if state.reduce_limited() {
        let encoded = serde_json::to_string(&reductions)
            .map_err(|err| ViewServerError::unexpected("TypeError", err.to_string()))?;
        let reduce_len = encoded.len();
        // The output only counts as overflowing when it also failed to
        // shrink to under half the encoded input.
        if reduce_len > REDUCE_OUTPUT_FLOOR && reduce_len * 2 > encoded_len(&kvs)? {
            let preview: String = encoded.chars().take(100).collect();
            let msg = format!(
                "Reduce output must shrink more rapidly:\n\
                 Current output: '{preview}'... (first 100 of {reduce_len} bytes)"
            );
            error!("{msg}");
            return Err(ViewServerError::error("reduce_overflow_error", msg));
        }
    }
    Ok(json!([true, reductions]))
}

/// The `rereduce` command: a second-pass reduce over earlier reductions.
pub fn rereduce(
    evaluator: &dyn Evaluator,
    state: &State,
    sources: &[Value],
    values: &[Value],
) -> Result<Value, ViewServerError> {
    reduce(evaluator, state, sources, values, true)
}

/// The ddoc `views` command (1.1.0+): use a map function as a changes
/// filter. A document passes when the function produces at least one
/// emission for it.
pub fn filter_view(
    evaluator: &dyn Evaluator,
    ctx: &Rc<RefCell<CallContext>>,
    func: &FunctionHandle,
    docs: &[Value],
) -> Result<Value, ViewServerError> {
    let mut passes = Vec::with_capacity(docs.len());
    for doc in docs {
        ctx.borrow_mut().emitted.clear();
        let returned = evaluator
            .call(func, std::slice::from_ref(doc))
            .map_err(|err| err.into_protocol())?;
        let emitted = !ctx.borrow().emitted.is_empty();
        let returned_rows = matches!(&returned, Value::Array(items) if !items.is_empty());
        passes.push(Value::Bool(emitted || returned_rows));
    }
    Ok(json!([true, passes]))
}
