use serde_json::{json, Value};

use crate::error::ViewServerError;
use crate::eval::{Evaluator, FunctionHandle};

/// JSON truthiness: null, false, zero, and empty strings / arrays / objects
/// are all falsy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Runs a changes filter over `docs`.
///
/// Until 0.11.1 the host also passed `userctx`, which became a third argument
/// of the user function; later versions carry it inside `req`.
pub fn run_filter(
    evaluator: &dyn Evaluator,
    func: &FunctionHandle,
    docs: &[Value],
    req: &Value,
    userctx: Option<&Value>,
) -> Result<Value, ViewServerError> {
    let mut passes = Vec::with_capacity(docs.len());
    for doc in docs {
        let mut args = vec![doc.clone(), req.clone()];
        if let Some(userctx) = userctx {
            args.push(userctx.clone());
        }
        let verdict = evaluator
            .call(func, &args)
            .map_err(|err| err.into_protocol())?;
        passes.push(Value::Bool(truthy(&verdict)));
    }
    Ok(json!([true, passes]))
}
