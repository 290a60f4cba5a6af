//! End-to-end evaluation through the public API.
#![expect(clippy::unwrap_used)] // test code OK

use msgexpr::{InvocationContext, MessageEngine, Object, Value, run_function};
use rstest::rstest;

fn eval(expression: &str) -> Object {
    let mut ctx = InvocationContext::instant(None);
    MessageEngine::new(expression)
        .run_here(&mut ctx, false)
        .unwrap_or_else(|e| panic!("'{expression}' raised {e}"))
}

#[rstest]
#[case::chain("1 add 2 add 3", Value::Int(6))]
#[case::operators_left_to_right("2 * 3 + 4", Value::Int(10))]
#[case::negative_literal("3 * -4", Value::Int(-12))]
#[case::block_argument("10 * (1 + 2 + 3)", Value::Int(60))]
#[case::two_blocks("(7 mul 8) add (9 mul 10)", Value::Int(146))]
#[case::right_first("2 mul $ 3 add 4", Value::Int(14))]
#[case::discard("10 + 20 . 3 * 5", Value::Int(15))]
#[case::true_division("210 / 7", Value::Float(30.0))]
#[case::floor_division("7 // 2", Value::Int(3))]
#[case::negated_selector("3 !equal 4", Value::Bool(true))]
#[case::reversed_args("3 ~sub 10", Value::Int(7))]
#[case::substring_in("ZILL in GODZILLA", Value::Bool(true))]
#[case::reversed_in("GODZILLA ~in ZILL", Value::Bool(true))]
#[case::not_a_substring("GODZILLA in ZILL", Value::Bool(false))]
#[case::index_selector("GODZILLA 0", Value::Str("G".into()))]
#[case::slice_min_arity("GODZILLA slice 1", Value::Str("ODZILLA".into()))]
#[case::slice_trailing("GODZILLA slice: 1 -1", Value::Str("ODZILL".into()))]
#[case::slice_block_argument("GODZILLA slice: (9 sub 8) -1", Value::Str("ODZILL".into()))]
#[case::end_of_keywords("GODZILLA slice: 2 ; length", Value::Int(6))]
#[case::user_quote("--/0x32/ Int", Value::Int(50))]
#[case::constructor_with_base("7FFF Int: 16", Value::Int(32767))]
#[case::type_instance("Int: ff 16", Value::Int(255))]
#[case::regex_search("abcde reg-search 'c.e'", Value::Bool(true))]
#[case::negated_regex("abcde !reg-search 'x+'", Value::Bool(true))]
#[case::primitive_str_method("'A string' endswith g", Value::Bool(true))]
#[case::primitive_str_method_no_args("GODZILLA lower", Value::Str("godzilla".into()))]
#[case::bracket_type_argument("'4 5 6' Tuple[Int] last", Value::Int(6))]
#[case::keyword_type_argument("('4 5 6' Tuple: Int) reduce add", Value::Int(15))]
#[case::str_do("'1 + 2' do", Value::Int(3))]
#[case::tuple_reduce("'1 2 3 4' Tuple map '@ Int' reduce add", Value::Int(10))]
#[case::tuple_reduce_with_start("'1 2 3' Tuple map '@ Int' reduce: mul 10", Value::Int(60))]
fn evaluates_to(#[case] expression: &str, #[case] expected: Value) {
    let result = eval(expression);
    assert!(!result.is_error(), "'{expression}' failed: {result:?}");
    assert_eq!(result.value(), &expected, "'{expression}'");
}

#[rstest]
#[case::division_by_zero("1 / 0", "ZeroDivisionError")]
#[case::zero_division_stops_chain("2 / 0 + 5 non-existent-method 0", "ZeroDivisionError")]
#[case::unknown_method("3 non-existent-method", "BadInstanceMethodInvocation")]
#[case::subject_missing("@ + 1", "BadExpressionError")]
#[case::unbound_object("@x", "BadExpressionError")]
#[case::unclosed_block("1 + (2", "SyntaxError")]
#[case::bad_int_literal("'12abc' Int", "ValueError")]
#[case::bad_pattern("abc reg-match '('", "ValueError")]
#[case::raised_inside_do("--[10 / 0] do non-existent-method", "ZeroDivisionError")]
#[case::bad_type_argument("'4 x' Tuple[Int]", "ValueError")]
#[case::float_out_of_int_range("1e300 floor", "ValueError")]
fn evaluates_to_error(#[case] expression: &str, #[case] kind: &str) {
    let result = eval(expression);
    let error = result
        .get_error()
        .unwrap_or_else(|| panic!("'{expression}' expected {kind}, got {result:?}"));
    assert_eq!(error.error.kind_name(), kind, "'{expression}'");
}

#[rstest]
#[case(7, Value::Float(30.0))]
#[case(5, Value::Float(42.0))]
#[case(2, Value::Float(105.0))]
fn cached_engine_replays_over_subjects(#[case] n: i64, #[case] expected: Value) {
    let mut ctx = InvocationContext::instant(None);
    let mut engine = MessageEngine::new("210 / @");
    // warm the cache with another subject first
    let warmup = ctx.new_object(Value::Int(1));
    engine.run(Some(warmup), &mut ctx, true).unwrap();
    assert!(engine.is_cached());

    let subject = ctx.new_object(Value::Int(n));
    let result = engine.run(Some(subject), &mut ctx, true).unwrap();
    assert_eq!(result.value(), &expected);

    let zero = ctx.new_object(Value::Int(0));
    let failed = engine.run(Some(zero), &mut ctx, true).unwrap();
    assert_eq!(failed.get_error().unwrap().error.kind_name(), "ZeroDivisionError");
}

#[test]
fn raise_error_returns_err() {
    let mut ctx = InvocationContext::instant(None);
    let subject = ctx.new_object(Value::Int(0));
    let err = run_function("10 / @", Some(subject), &mut ctx, true).unwrap_err();
    assert_eq!(err.kind_name(), "ZeroDivisionError");
}

#[test]
fn fork_bindings_do_not_reach_parent() {
    let mut ctx = InvocationContext::instant(None);
    let subject = ctx.new_object(Value::Int(42));
    let result = run_function("@ => answer", Some(subject), &mut ctx, false).unwrap();
    assert_eq!(result.value(), &Value::Int(42));
    assert!(ctx.get_object("answer").is_none());

    let child = ctx.get_subcontext("0-0").unwrap();
    assert_eq!(child.get_object("answer").unwrap().value(), &Value::Int(42));
    assert_eq!(child.get_depth(), ctx.get_depth() + 1);
}

#[test]
fn nested_failures_are_listed_with_context_ids() {
    let mut ctx = InvocationContext::instant(None);
    let subject = ctx.new_object(Value::Int(0));
    let result = run_function("1 / @", Some(subject), &mut ctx, false).unwrap();
    assert!(result.is_error());
    let errors = ctx.get_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "0-0");
    assert_eq!(errors[0].1.kind_name(), "ZeroDivisionError");
}

#[test]
fn map_runs_the_function_per_item() {
    let result = eval("'ab c def' Tuple map '@ length'");
    let Value::Tuple(items) = result.value() else {
        panic!("expected a Tuple, got {result:?}");
    };
    let lengths: Vec<&Value> = items.iter().map(Object::value).collect();
    assert_eq!(lengths, vec![&Value::Int(2), &Value::Int(1), &Value::Int(3)]);
}
