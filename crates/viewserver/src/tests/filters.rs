use serde_json::json;

use super::support::evaluator;
use crate::eval::Evaluator;
use crate::filters::{run_filter, truthy};

#[test]
fn truthiness_matches_json_semantics() {
    assert!(!truthy(&json!(null)));
    assert!(!truthy(&json!(false)));
    assert!(!truthy(&json!(0)));
    assert!(!truthy(&json!(0.0)));
    assert!(!truthy(&json!("")));
    assert!(!truthy(&json!([])));
    assert!(!truthy(&json!({})));

    assert!(truthy(&json!(true)));
    assert!(truthy(&json!(1)));
    assert!(truthy(&json!(-0.5)));
    assert!(truthy(&json!("no")));
    assert!(truthy(&json!([0])));
    assert!(truthy(&json!({"a": null})));
}

#[test]
fn filters_documents_by_predicate() {
    let (eval, _, _) = evaluator("0.11.1");
    let func = eval.compile("fn f(doc, req) { doc.good }", None).unwrap();
    let docs = [json!({"good": true}), json!({"good": false}), json!({})];
    let result = run_filter(&eval, &func, &docs, &json!({}), None).unwrap();
    assert_eq!(result, json!([true, [true, false, false]]));
}

#[test]
fn predicate_results_are_coerced_to_booleans() {
    let (eval, _, _) = evaluator("0.11.1");
    let func = eval.compile("fn f(doc, req) { doc.tags }", None).unwrap();
    let docs = [json!({"tags": ["a"]}), json!({"tags": []})];
    let result = run_filter(&eval, &func, &docs, &json!({}), None).unwrap();
    assert_eq!(result, json!([true, [true, false]]));
}

#[test]
fn older_hosts_pass_the_user_context_as_a_third_argument() {
    let (eval, _, _) = evaluator("0.10.0");
    let func = eval
        .compile("fn f(doc, req, userctx) { userctx.name == \"bob\" }", None)
        .unwrap();
    let docs = [json!({})];
    let result = run_filter(
        &eval,
        &func,
        &docs,
        &json!({}),
        Some(&json!({"name": "bob"})),
    )
    .unwrap();
    assert_eq!(result, json!([true, [true]]));
}
