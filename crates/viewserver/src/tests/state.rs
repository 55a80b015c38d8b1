use serde_json::json;

use super::support::{evaluator, proto};
use crate::eval::Evaluator;
use crate::state::State;

#[test]
fn reset_clears_functions_and_config() {
    let (eval, _, _) = evaluator("0.11.0");
    let version = proto("0.11.0");
    let mut state = State::new();

    state
        .add_fun(&eval, &version, "fn f(doc) { emit(doc._id, 1); }")
        .unwrap();
    state.reset(Some(&json!({"reduce_limit": true})), &version);
    assert!(state.functions.is_empty());
    assert!(state.functions_src.is_empty());
    assert!(state.reduce_limited());

    state.reset(None, &version);
    assert!(state.query_config.is_empty());
    assert!(!state.reduce_limited());
}

#[test]
fn add_fun_grows_both_sequences_in_lockstep() {
    let (eval, _, _) = evaluator("0.11.0");
    let version = proto("0.11.0");
    let mut state = State::new();

    state
        .add_fun(&eval, &version, "fn f(doc) { emit(doc._id, 1); }")
        .unwrap();
    state
        .add_fun(&eval, &version, "fn g(doc) { emit(doc._id, 2); }")
        .unwrap();
    assert_eq!(state.functions.len(), 2);
    assert_eq!(state.functions_src.len(), 2);
    assert!(state.functions_src[1].contains("fn g"));
}

#[test]
fn failed_compiles_leave_state_untouched() {
    let (eval, _, _) = evaluator("0.11.0");
    let version = proto("0.11.0");
    let mut state = State::new();

    assert!(state.add_fun(&eval, &version, "fn broken(").is_err());
    assert!(state.functions.is_empty());
    assert_eq!(state.functions.len(), state.functions_src.len());
}

#[test]
fn reset_clears_the_view_lib_on_new_hosts() {
    let mut state = State::new();

    state.add_lib(json!({"helper": "exports.x = 3;"}));
    state.reset(None, &proto("1.1.0"));
    assert_eq!(state.view_lib, json!(""));

    // Hosts without add_lib never clear it.
    state.add_lib(json!({"helper": "exports.x = 3;"}));
    state.reset(None, &proto("0.10.0"));
    assert_eq!(state.view_lib, json!({"helper": "exports.x = 3;"}));
}

#[test]
fn map_functions_can_require_the_view_lib() {
    let (eval, _, _) = evaluator("1.1.0");
    let version = proto("1.1.0");
    let mut state = State::new();

    state.add_lib(json!({"utils": "exports.factor = 3;"}));
    state
        .add_fun(
            &eval,
            &version,
            "fn f(doc) { [[doc._id, require(\"views/lib/utils\").factor]] }",
        )
        .unwrap();

    let result = eval
        .call(&state.functions[0], &[json!({"_id": "z"})])
        .unwrap();
    assert_eq!(result, json!([["z", 3]]));
}
