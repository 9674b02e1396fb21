//! End-to-end scenarios (spec.md §8) exercised through the embedding
//! surface, grounded on the teacher's `tests/binary_serde.rs`
//! dump/load-round-trip style and `tests/parse_errors.rs`'s diagnostic
//! assertion style.

use ahash::AHashMap;
use jactl::{compile_script, eval, Context, Value};
use pretty_assertions::assert_eq;

fn int(value: &Value) -> i64 {
    value.as_i64().unwrap_or_else(|| panic!("expected a numeric value, got {}", value.type_name()))
}

#[test]
fn scenario_1_pure_sync_arithmetic() {
    let context = Context::create().build();
    let value = eval("3 + 4;", AHashMap::new(), &context).unwrap();
    assert_eq!(int(&value), 7);
}

#[test]
fn scenario_2_sync_recursion() {
    let context = Context::create().build();
    let source = "def f(x){ x == 0 ? 0 : f(x-1) + x }; f(4);";
    let value = eval(source, AHashMap::new(), &context).unwrap();
    assert_eq!(int(&value), 10);
}

#[test]
fn scenario_3_two_suspensions_single_frame() {
    let context = Context::create().build();
    let value = eval("sleep(0, 2) + sleep(0, 3);", AHashMap::new(), &context).unwrap();
    assert_eq!(int(&value), 5);
}

#[test]
fn scenario_4_field_order_dependency() {
    let context = Context::create().build();
    let source = "class X{int i=1;int j=i+1}; new X().j;";
    let value = eval(source, AHashMap::new(), &context).unwrap();
    assert_eq!(int(&value), 2);
}

#[test]
fn scenario_5_async_closure_through_sync_combinator() {
    let context = Context::create().build();
    let source = "[1,2,3].map{ sleep(0,it)*sleep(0,it) }.sum();";
    let value = eval(source, AHashMap::new(), &context).unwrap();
    assert_eq!(int(&value), 14);
}

#[test]
fn scenario_6_closure_over_heap_cell_across_invocations() {
    let context = Context::create().build();
    let source = "class A { def a() { int x=1; return { x++ } } }; def f=new A().a(); f()+f()+f();";
    let value = eval(source, AHashMap::new(), &context).unwrap();
    assert_eq!(int(&value), 6);
}

#[test]
fn async_fidelity_sync_script_never_suspends() {
    // A script with no async built-in reachable from its body must run
    // straight through `run_sync` without ever touching the checkpoint
    // store, regardless of whether checkpointing is enabled.
    let context = Context::create().build();
    let script = compile_script("return 1 + 1;", AHashMap::new(), &context).unwrap();
    let value = script.run_sync(AHashMap::new()).unwrap();
    assert_eq!(int(&value), 2);
}

#[test]
fn checkpoint_disabled_context_runs_checkpoint_as_identity() {
    let context = Context::create().checkpoint(false).build();
    let value = eval("_checkpoint(41) + 1;", AHashMap::new(), &context).unwrap();
    assert_eq!(int(&value), 42);
}

#[test]
fn globals_round_trip_through_eval() {
    let context = Context::create().build();
    let mut globals = AHashMap::new();
    globals.insert("seed".to_owned(), Value::Int(10));
    let value = eval("seed + 5;", globals, &context).unwrap();
    assert_eq!(int(&value), 15);
}

#[test]
fn compile_errors_are_reported_as_diagnostics() {
    let context = Context::create().build();
    let diagnostics = compile_script("return unknownVariable;", AHashMap::new(), &context).unwrap_err();
    assert!(!diagnostics.is_empty());
}
