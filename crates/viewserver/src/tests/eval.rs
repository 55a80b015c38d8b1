use serde_json::json;

use super::support::{evaluator, output_frames};
use crate::error::ViewServerError;
use crate::eval::{CallError, Evaluator};

#[test]
fn compiles_and_calls_a_single_function() {
    let (eval, _, _) = evaluator("0.11.0");
    let func = eval.compile("fn f(doc) { doc.x + 1 }", None).unwrap();
    assert_eq!(eval.arity(&func), 1);
    let result = eval.call(&func, &[json!({"x": 2})]).unwrap();
    assert_eq!(result, json!(3));
}

#[test]
fn reports_declared_arity() {
    let (eval, _, _) = evaluator("0.11.0");
    let func = eval
        .compile("fn reduce(keys, values, rereduce) { values }", None)
        .unwrap();
    assert_eq!(eval.arity(&func), 3);
}

#[test]
fn strips_a_leading_byte_order_mark() {
    let (eval, _, _) = evaluator("0.11.0");
    let func = eval.compile("\u{feff}fn f(doc) { 1 }", None).unwrap();
    assert_eq!(eval.call(&func, &[json!({})]).unwrap(), json!(1));
}

fn expect_compilation_error(result: Result<crate::eval::FunctionHandle, ViewServerError>) -> String {
    match result {
        Err(ViewServerError::Recoverable { id, reason }) => {
            assert_eq!(id, "compilation_error");
            reason
        }
        other => panic!("expected compilation_error, got {other:?}"),
    }
}

#[test]
fn syntax_errors_are_compilation_errors_carrying_the_source() {
    let (eval, _, _) = evaluator("0.11.0");
    let source = "fn f(doc) { this is not rhai";
    let reason = expect_compilation_error(eval.compile(source, None));
    assert!(reason.contains(source), "reason should quote the source");
}

#[test]
fn top_level_statements_are_rejected() {
    let (eval, _, _) = evaluator("0.11.0");
    let reason = expect_compilation_error(eval.compile("let x = 1;\nfn f(doc) { x }", None));
    assert!(reason.contains("top level"), "got: {reason}");
}

#[test]
fn multiple_functions_are_rejected() {
    let (eval, _, _) = evaluator("0.11.0");
    let reason =
        expect_compilation_error(eval.compile("fn f(doc) { 1 }\nfn g(doc) { 2 }", None));
    assert!(reason.contains("Multiple functions"), "got: {reason}");
}

#[test]
fn sources_without_a_function_are_rejected() {
    let (eval, _, _) = evaluator("0.11.0");
    expect_compilation_error(eval.compile("", None));
}

#[test]
fn compile_failure_does_not_poison_later_compiles() {
    let (eval, _, _) = evaluator("0.11.0");
    assert!(eval.compile("fn f(", None).is_err());
    assert!(eval.compile("fn f(doc) { 1 }", None).is_ok());
}

#[test]
fn user_raised_protocol_errors_classify_back() {
    let (eval, _, _) = evaluator("0.11.0");

    let func = eval
        .compile("fn f(doc) { Forbidden(\"bad\") }", None)
        .unwrap();
    match eval.call(&func, &[json!({})]) {
        Err(CallError::Protocol(ViewServerError::Forbidden(reason))) => {
            assert_eq!(reason, "bad")
        }
        other => panic!("expected Forbidden, got {other:?}"),
    }

    let func = eval
        .compile("fn f(doc) { Error(\"oops\", \"broke\") }", None)
        .unwrap();
    match eval.call(&func, &[json!({})]) {
        Err(CallError::Protocol(ViewServerError::Recoverable { id, reason })) => {
            assert_eq!((id.as_str(), reason.as_str()), ("oops", "broke"));
        }
        other => panic!("expected Error, got {other:?}"),
    }

    let func = eval
        .compile("fn f(doc) { FatalError(\"dead\", \"gone\") }", None)
        .unwrap();
    match eval.call(&func, &[json!({})]) {
        Err(CallError::Protocol(ViewServerError::Fatal { id, .. })) => assert_eq!(id, "dead"),
        other => panic!("expected FatalError, got {other:?}"),
    }
}

#[test]
fn failed_asserts_surface_as_assertions() {
    let (eval, _, _) = evaluator("0.11.0");
    let func = eval
        .compile("fn f(doc) { assert(doc.ok == true, \"not ok\"); 1 }", None)
        .unwrap();

    assert_eq!(eval.call(&func, &[json!({"ok": true})]).unwrap(), json!(1));
    match eval.call(&func, &[json!({"ok": false})]) {
        Err(CallError::Assertion(message)) => assert_eq!(message, "not ok"),
        other => panic!("expected assertion, got {other:?}"),
    }
}

#[test]
fn thrown_values_become_runtime_errors() {
    let (eval, _, _) = evaluator("0.11.0");
    let func = eval.compile("fn f(doc) { throw \"boom\" }", None).unwrap();
    match eval.call(&func, &[json!({})]) {
        Err(CallError::Native { name, message }) => {
            assert_eq!(name, "RuntimeError");
            assert!(message.contains("boom"), "got: {message}");
        }
        other => panic!("expected native error, got {other:?}"),
    }
}

#[test]
fn unknown_functions_become_reference_errors() {
    let (eval, _, _) = evaluator("0.11.0");
    let func = eval.compile("fn f(doc) { no_such_fn(doc) }", None).unwrap();
    match eval.call(&func, &[json!({})]) {
        Err(CallError::Native { name, .. }) => assert_eq!(name, "ReferenceError"),
        other => panic!("expected native error, got {other:?}"),
    }
}

#[test]
fn log_emits_version_shaped_frames() {
    let (eval, _, io) = evaluator("0.11.0");
    let func = eval.compile("fn f(doc) { log(\"hey\"); 1 }", None).unwrap();
    eval.call(&func, &[json!({})]).unwrap();
    assert_eq!(output_frames(&io), vec![json!(["log", "hey"])]);

    let (eval, _, io) = evaluator("0.9.0");
    let func = eval.compile("fn f(doc) { log(\"hey\"); 1 }", None).unwrap();
    eval.call(&func, &[json!({})]).unwrap();
    assert_eq!(output_frames(&io), vec![json!({"log": "hey"})]);
}

#[test]
fn log_coerces_non_string_payloads() {
    let (eval, _, io) = evaluator("0.11.0");
    let func = eval
        .compile("fn f(doc) { log(#{\"a\": 1}); 1 }", None)
        .unwrap();
    eval.call(&func, &[json!({})]).unwrap();
    assert_eq!(output_frames(&io), vec![json!(["log", "{\"a\":1}"])]);

    // Before 0.11.0 a null payload is called out explicitly.
    let (eval, _, io) = evaluator("0.9.0");
    let func = eval.compile("fn f(doc) { log(()); 1 }", None).unwrap();
    eval.call(&func, &[json!({})]).unwrap();
    assert_eq!(
        output_frames(&io),
        vec![json!({"log": "Error: attempting to log message of None"})]
    );
}

#[test]
fn json_codec_capability_round_trips() {
    let (eval, _, _) = evaluator("0.11.0");
    let func = eval
        .compile("fn f(doc) { json_decode(json_encode(doc)).a }", None)
        .unwrap();
    assert_eq!(eval.call(&func, &[json!({"a": 5})]).unwrap(), json!(5));
}
