use serde_json::json;

use super::support::run_server;

const VALIDATE_FORBID: &str = "fn v(newdoc, olddoc, userctx) { Forbidden(\"bad\") }";

#[test]
fn installs_and_runs_design_functions() {
    let ddoc = json!({"validate_doc_update": VALIDATE_FORBID});
    let (code, frames) = run_server(
        "0.11.0",
        &[
            json!(["ddoc", "new", "_design/foo", ddoc]),
            json!(["ddoc", "_design/foo", ["validate_doc_update"], [{}, {}, {}]]),
        ],
    );
    assert_eq!(code, 0);
    assert_eq!(frames, vec![json!(true), json!({"forbidden": "bad"})]);
}

#[test]
fn design_documents_survive_reset() {
    let ddoc = json!({"shows": {"hello": "fn s(doc, req) { \"hi\" }"}});
    let (code, frames) = run_server(
        "0.11.0",
        &[
            json!(["ddoc", "new", "_design/foo", ddoc]),
            json!(["reset"]),
            json!(["ddoc", "_design/foo", ["shows", "hello"], [{}, {}]]),
        ],
    );
    assert_eq!(code, 0);
    assert_eq!(
        frames,
        vec![
            json!(true),
            json!(true),
            json!(["resp", {"body": "hi"}]),
        ]
    );
}

#[test]
fn reinstalling_a_ddoc_replaces_it() {
    let (code, frames) = run_server(
        "0.11.0",
        &[
            json!(["ddoc", "new", "_design/foo",
                   {"shows": {"hello": "fn s(doc, req) { \"one\" }"}}]),
            json!(["ddoc", "new", "_design/foo",
                   {"shows": {"hello": "fn s(doc, req) { \"two\" }"}}]),
            json!(["ddoc", "_design/foo", ["shows", "hello"], [{}, {}]]),
        ],
    );
    assert_eq!(code, 0);
    assert_eq!(frames[2], json!(["resp", {"body": "two"}]));
}

#[test]
fn an_uncached_ddoc_is_a_protocol_fatal() {
    let (code, frames) = run_server(
        "0.11.0",
        &[json!(["ddoc", "_design/nope", ["shows", "x"], [{}, {}]])],
    );
    assert_eq!(code, 1);
    assert_eq!(
        frames,
        vec![json!(["error", "query_protocol_error", "uncached design doc: _design/nope"])]
    );
}

#[test]
fn a_missing_function_path_is_recoverable() {
    let (code, frames) = run_server(
        "0.11.0",
        &[
            json!(["ddoc", "new", "_design/foo", {"shows": {}}]),
            json!(["ddoc", "_design/foo", ["shows", "missing"], [{}, {}]]),
            json!(["reset"]),
        ],
    );
    assert_eq!(code, 0, "the engine keeps serving after not_found");
    assert_eq!(frames[0], json!(true));
    assert_eq!(frames[1][0], json!("error"));
    assert_eq!(frames[1][1], json!("not_found"));
    assert_eq!(frames[2], json!(true));
}

#[test]
fn an_unknown_ddoc_command_is_fatal() {
    let (code, frames) = run_server(
        "0.11.0",
        &[
            json!(["ddoc", "new", "_design/foo", {"nonsense": {"x": "fn f(a) { 1 }"}}]),
            json!(["ddoc", "_design/foo", ["nonsense", "x"], [[]]]),
        ],
    );
    assert_eq!(code, 1);
    assert_eq!(
        frames[1],
        json!(["error", "unknown_command", "unknown ddoc command `nonsense`"])
    );
}

#[test]
fn view_filters_need_a_new_enough_host() {
    let ddoc = json!({"views": {"v": {"map": "fn f(doc) { emit(doc._id, 1); }"}}});
    let (code, frames) = run_server(
        "0.11.1",
        &[
            json!(["ddoc", "new", "_design/foo", ddoc]),
            json!(["ddoc", "_design/foo", ["views", "v", "map"], [[]]]),
        ],
    );
    assert_eq!(code, 1);
    assert_eq!(frames[1][1], json!("unknown_command"));
}

#[test]
fn view_filters_run_map_functions_as_predicates() {
    let ddoc = json!({"views": {"v": {"map":
        "fn f(doc) { if doc.good == true { emit(doc._id, 1); } }"}}});
    let docs = json!([
        {"_id": "a", "good": true},
        {"_id": "b", "good": false},
    ]);
    let (code, frames) = run_server(
        "1.1.0",
        &[
            json!(["ddoc", "new", "_design/foo", ddoc]),
            json!(["ddoc", "_design/foo", ["views", "v", "map"], [docs]]),
        ],
    );
    assert_eq!(code, 0);
    assert_eq!(frames[1], json!([true, [true, false]]));
}

#[test]
fn compiled_design_functions_are_reused() {
    let ddoc = json!({"shows": {"hello": "fn s(doc, req) { \"hi \" + doc.name }"}});
    let (code, frames) = run_server(
        "0.11.0",
        &[
            json!(["ddoc", "new", "_design/foo", ddoc]),
            json!(["ddoc", "_design/foo", ["shows", "hello"], [{"name": "a"}, {}]]),
            json!(["ddoc", "_design/foo", ["shows", "hello"], [{"name": "b"}, {}]]),
        ],
    );
    assert_eq!(code, 0);
    assert_eq!(frames[1], json!(["resp", {"body": "hi a"}]));
    assert_eq!(frames[2], json!(["resp", {"body": "hi b"}]));
}

#[test]
fn design_functions_can_require_sibling_modules() {
    let ddoc = json!({
        "lib": {"fmt": "exports.shout = |s| s + \"!\";"},
        "shows": {"hello":
            "fn s(doc, req) { let shout = require(\"lib/fmt\").shout; shout.call(\"hi\") }"},
    });
    let (code, frames) = run_server(
        "0.11.0",
        &[
            json!(["ddoc", "new", "_design/foo", ddoc]),
            json!(["ddoc", "_design/foo", ["shows", "hello"], [{}, {}]]),
        ],
    );
    assert_eq!(code, 0);
    assert_eq!(frames[1], json!(["resp", {"body": "hi!"}]));
}
