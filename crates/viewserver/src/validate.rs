use serde_json::{json, Value};
use tracing::{error, warn};

use crate::error::ViewServerError;
use crate::eval::{CallError, Evaluator, FunctionHandle};
use crate::version::ProtocolVersion;

/// Invokes a validate function and maps its outcome into the veto protocol.
///
/// A clean return means the write is allowed and the engine answers `1`.
/// `Forbidden` passes through verbatim, and a failed assertion becomes a
/// `Forbidden` carrying the assertion message; that conversion is what lets
/// validate functions use plain asserts for field checks.
pub fn run_validate(
    evaluator: &dyn Evaluator,
    func: &FunctionHandle,
    args: &[Value],
) -> Result<Value, ViewServerError> {
    match evaluator.call(func, args) {
        Ok(_) => Ok(json!(1)),
        Err(CallError::Protocol(err @ ViewServerError::Forbidden(_))) => {
            warn!("access denied: {err}");
            Err(err)
        }
        Err(CallError::Protocol(err)) => {
            error!("validate function raised a protocol error: {err}");
            Err(err)
        }
        Err(CallError::Assertion(message)) => {
            warn!("access denied: {message}");
            Err(ViewServerError::forbidden(message))
        }
        Err(other) => {
            error!("validate function raised: {}", other.message());
            let name = other.name().to_string();
            Err(ViewServerError::error(name, other.message()))
        }
    }
}

/// The legacy `validate` command (`<0.11.0`): compile the source and run it
/// with `(newdoc, olddoc, userctx)`.
pub fn validate(
    evaluator: &dyn Evaluator,
    source: &str,
    args: &[Value],
) -> Result<Value, ViewServerError> {
    let func = evaluator.compile(source, None)?;
    let take = args.len().min(3);
    run_validate(evaluator, &func, &args[..take])
}

/// The ddoc `validate_doc_update` command.
///
/// Hosts newer than 0.11.1 pass a fourth `secobj` argument. A function still
/// declaring three parameters keeps working, minus `secobj`, with a nudge in
/// the log.
pub fn ddoc_validate(
    evaluator: &dyn Evaluator,
    version: &ProtocolVersion,
    func: &FunctionHandle,
    args: &[Value],
) -> Result<Value, ViewServerError> {
    let mut args = args;
    if version.passes_secobj() {
        if evaluator.arity(func) == 3 && args.len() > 3 {
            warn!(
                "validate_doc_update functions take an additional 4th argument `secobj` \
                 since 0.11.1; please update your function to remove this warning"
            );
            args = &args[..3];
        }
    } else if args.len() > 3 {
        args = &args[..3];
    }
    run_validate(evaluator, func, args)
}
