//! Type-agnostic operators and methods.
//!
//! Consulted after the receiver type's own method table. Operator symbols are
//! aliases of named methods, so `+` and `add` resolve to the same entry.

use crate::context::InvocationContext;
use crate::invocation::{Invocation, Modifiers, Returned};
use crate::method::{Method, MethodFlags, MethodParameter};
use crate::object::{Object, Value};
use crate::types::{MethodTable, TypeRef, normalize_method_name};
use crate::Error;
use std::cmp::Ordering;
use std::sync::{Arc, LazyLock};

static GENERIC_METHODS: LazyLock<Result<MethodTable, Error>> = LazyLock::new(build_generic_table);

/// The shared generic method table
pub fn generic_methods() -> Result<&'static MethodTable, Error> {
    GENERIC_METHODS.as_ref().map_err(Clone::clone)
}

/// Find a generic method by name or operator alias
pub fn resolve_generic_method(name: &str) -> Result<Option<Arc<Method>>, Error> {
    Ok(generic_methods()?.get(&normalize_method_name(name)).cloned())
}

fn unsupported(v: &Value, method: &str) -> Error {
    Error::UnsupportedMethod {
        type_name: v.kind().primitive_name().to_string(),
        method: method.to_string(),
    }
}

fn int_of(v: &Value) -> Option<i64> {
    match v {
        Value::Int(n) => Some(*n),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn overflow(method: &str) -> Error {
    Error::ValueError(format!("integer overflow in {method}"))
}

/// Integer operation when both sides are integral, else a float operation
fn arith(
    method: &str,
    l: &Value,
    r: &Value,
    int_op: impl Fn(i64, i64) -> Result<i64, Error>,
    float_op: impl Fn(f64, f64) -> Result<f64, Error>,
) -> Result<Value, Error> {
    if let (Some(a), Some(b)) = (int_of(l), int_of(r)) {
        return int_op(a, b).map(Value::Int);
    }
    match (l.as_float(), r.as_float()) {
        (Some(a), Some(b)) => float_op(a, b).map(Value::Float),
        _ => Err(unsupported(l, method)),
    }
}

fn order(l: &Value, r: &Value, method: &str) -> Result<Ordering, Error> {
    match (l, r) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::Tuple(a), Value::Tuple(b)) => {
            for (x, y) in a.iter().zip(b) {
                match order(x.value(), y.value(), method)? {
                    Ordering::Equal => {}
                    other => return Ok(other),
                }
            }
            Ok(a.len().cmp(&b.len()))
        }
        _ => {
            if let (Some(a), Some(b)) = (int_of(l), int_of(r)) {
                return Ok(a.cmp(&b));
            }
            match (l.as_float(), r.as_float()) {
                (Some(a), Some(b)) => a
                    .partial_cmp(&b)
                    .ok_or_else(|| Error::ValueError("NaN is not ordered".into())),
                _ => Err(unsupported(l, method)),
            }
        }
    }
}

//
// Comparison
//

fn equal(l: Value, r: Value) -> bool {
    l == r
}

fn not_equal(l: Value, r: Value) -> bool {
    l != r
}

fn less(l: Value, r: Value) -> Result<bool, Error> {
    Ok(order(&l, &r, "less")?.is_lt())
}

fn less_equal(l: Value, r: Value) -> Result<bool, Error> {
    Ok(order(&l, &r, "less-equal")?.is_le())
}

fn greater(l: Value, r: Value) -> Result<bool, Error> {
    Ok(order(&l, &r, "greater")?.is_gt())
}

fn greater_equal(l: Value, r: Value) -> Result<bool, Error> {
    Ok(order(&l, &r, "greater-equal")?.is_ge())
}

fn compare(l: Value, r: Value) -> Result<i64, Error> {
    Ok(match order(&l, &r, "compare")? {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    })
}

fn is_between(l: Value, min: Value, max: Value) -> Result<bool, Error> {
    Ok(order(&min, &l, "is-between")?.is_le() && order(&l, &max, "is-between")?.is_le())
}

fn is(l: Object, r: Object) -> bool {
    l.get_typename() == r.get_typename() && l.value() == r.value()
}

fn is_not(l: Object, r: Object) -> bool {
    !is(l, r)
}

fn is_none(l: Value) -> bool {
    matches!(l, Value::None)
}

fn truth(l: Value) -> bool {
    l.is_truthy()
}

fn falsy(l: Value) -> bool {
    !l.is_truthy()
}

//
// Arithmetic
//

fn repeat<T: Clone>(items: &[T], times: i64) -> Vec<T> {
    let times = usize::try_from(times).unwrap_or(0);
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend_from_slice(items);
    }
    out
}

fn add(l: Value, r: Value) -> Result<Value, Error> {
    match (l, r) {
        (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
        (Value::Tuple(mut a), Value::Tuple(b)) => {
            a.extend(b);
            Ok(Value::Tuple(a))
        }
        (l, r) => arith(
            "add",
            &l,
            &r,
            |a, b| a.checked_add(b).ok_or_else(|| overflow("add")),
            |a, b| Ok(a + b),
        ),
    }
}

fn sub(l: Value, r: Value) -> Result<Value, Error> {
    arith(
        "sub",
        &l,
        &r,
        |a, b| a.checked_sub(b).ok_or_else(|| overflow("sub")),
        |a, b| Ok(a - b),
    )
}

fn mul(l: Value, r: Value) -> Result<Value, Error> {
    match (&l, &r) {
        (Value::Str(s), Value::Int(n)) => Ok(Value::Str(s.repeat(usize::try_from(*n).unwrap_or(0)))),
        (Value::Tuple(items), Value::Int(n)) => Ok(Value::Tuple(repeat(items, *n))),
        _ => arith(
            "mul",
            &l,
            &r,
            |a, b| a.checked_mul(b).ok_or_else(|| overflow("mul")),
            |a, b| Ok(a * b),
        ),
    }
}

/// True division, always a Float
fn div(l: Value, r: Value) -> Result<Value, Error> {
    match (l.as_float(), r.as_float()) {
        (Some(_), Some(b)) if b == 0.0 => Err(Error::ZeroDivision),
        (Some(a), Some(b)) => Ok(Value::Float(a / b)),
        _ => Err(unsupported(&l, "div")),
    }
}

fn floordiv(l: Value, r: Value) -> Result<Value, Error> {
    arith(
        "floordiv",
        &l,
        &r,
        |a, b| {
            if b == 0 {
                return Err(Error::ZeroDivision);
            }
            let q = a.checked_div(b).ok_or_else(|| overflow("floordiv"))?;
            Ok(if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q })
        },
        |a, b| {
            if b == 0.0 {
                return Err(Error::ZeroDivision);
            }
            Ok((a / b).floor())
        },
    )
}

/// Remainder with the sign of the divisor
fn modulo(l: Value, r: Value) -> Result<Value, Error> {
    arith(
        "mod",
        &l,
        &r,
        |a, b| {
            if b == 0 {
                return Err(Error::ZeroDivision);
            }
            let m = a.checked_rem(b).ok_or_else(|| overflow("mod"))?;
            Ok(if m != 0 && ((m < 0) != (b < 0)) { m + b } else { m })
        },
        |a, b| {
            if b == 0.0 {
                return Err(Error::ZeroDivision);
            }
            let m = a % b;
            Ok(if m != 0.0 && ((m < 0.0) != (b < 0.0)) { m + b } else { m })
        },
    )
}

fn pow(l: Value, r: Value) -> Result<Value, Error> {
    if let (Some(a), Some(b)) = (int_of(&l), int_of(&r)) {
        if let Ok(exp) = u32::try_from(b) {
            return a.checked_pow(exp).map(Value::Int).ok_or_else(|| overflow("pow"));
        }
    }
    match (l.as_float(), r.as_float()) {
        (Some(a), Some(b)) => Ok(Value::Float(a.powf(b))),
        _ => Err(unsupported(&l, "pow")),
    }
}

fn negative(l: Value) -> Result<Value, Error> {
    match l {
        Value::Int(n) => n.checked_neg().map(Value::Int).ok_or_else(|| overflow("negative")),
        Value::Float(x) => Ok(Value::Float(-x)),
        other => Err(unsupported(&other, "negative")),
    }
}

fn positive(l: Value) -> Result<Value, Error> {
    match l {
        Value::Int(_) | Value::Float(_) => Ok(l),
        other => Err(unsupported(&other, "positive")),
    }
}

//
// Bit operations
//

fn int_pair(l: &Value, r: &Value, method: &str) -> Result<(i64, i64), Error> {
    match (int_of(l), int_of(r)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(unsupported(l, method)),
    }
}

fn bitand(l: Value, r: Value) -> Result<i64, Error> {
    let (a, b) = int_pair(&l, &r, "bitand")?;
    Ok(a & b)
}

fn bitor(l: Value, r: Value) -> Result<i64, Error> {
    let (a, b) = int_pair(&l, &r, "bitor")?;
    Ok(a | b)
}

fn bitxor(l: Value, r: Value) -> Result<i64, Error> {
    let (a, b) = int_pair(&l, &r, "bitxor")?;
    Ok(a ^ b)
}

fn bitinv(l: Value) -> Result<i64, Error> {
    int_of(&l).map(|a| !a).ok_or_else(|| unsupported(&l, "bitinv"))
}

fn shift_amount(b: i64) -> Result<u32, Error> {
    u32::try_from(b).map_err(|_| Error::ValueError("negative shift count".into()))
}

fn lshift(l: Value, r: Value) -> Result<i64, Error> {
    let (a, b) = int_pair(&l, &r, "lshift")?;
    let n = shift_amount(b)?;
    a.checked_shl(n)
        .filter(|v| v >> n == a)
        .ok_or_else(|| overflow("lshift"))
}

fn rshift(l: Value, r: Value) -> Result<i64, Error> {
    let (a, b) = int_pair(&l, &r, "rshift")?;
    let n = shift_amount(b)?;
    Ok(a.checked_shr(n).unwrap_or(if a < 0 { -1 } else { 0 }))
}

//
// Containers
//

fn is_in(l: Value, r: Value) -> Result<bool, Error> {
    match (&l, &r) {
        (_, Value::Tuple(items)) => Ok(items.iter().any(|o| o.value() == &l)),
        (Value::Str(needle), Value::Str(hay)) => Ok(hay.contains(needle.as_str())),
        (Value::Str(name), Value::Collection(c)) => Ok(c.get(name).is_some()),
        _ => Err(unsupported(&r, "is-in")),
    }
}

fn contains(l: Value, r: Value) -> Result<bool, Error> {
    is_in(r, l)
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let i = if index < 0 { len + index } else { index };
    usize::try_from(i).ok().filter(|i| (*i as i64) < len)
}

fn at(l: Object, index: Object) -> Result<Returned, Error> {
    let out_of_range = || Error::IndexError(format!("index {index} out of range"));
    match l.value() {
        Value::Tuple(items) => {
            let i = index.value().as_int().ok_or_else(|| unsupported(index.value(), "at"))?;
            let i = normalize_index(i, items.len()).ok_or_else(out_of_range)?;
            Ok(Returned::Object(items[i].clone()))
        }
        Value::Str(s) => {
            let i = index.value().as_int().ok_or_else(|| unsupported(index.value(), "at"))?;
            let chars: Vec<char> = s.chars().collect();
            let i = normalize_index(i, chars.len()).ok_or_else(out_of_range)?;
            Ok(Returned::Value(Value::Str(chars[i].to_string())))
        }
        Value::Collection(c) => {
            let name = index.value().to_string();
            c.get(&name)
                .map(|item| Returned::Object(item.object.clone()))
                .ok_or(Error::BadObjectMemberInvocation(name))
        }
        Value::Native(n) => {
            let name = index.value().to_string();
            n.get_attribute(&name)
                .map(Returned::Value)
                .ok_or_else(|| Error::IndexError(format!("no attribute '{name}'")))
        }
        other => Err(unsupported(other, "at")),
    }
}

fn slice_bounds(len: usize, start: i64, end: Option<i64>) -> (usize, usize) {
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let clamp = |i: i64| {
        let i = if i < 0 { (len + i).max(0) } else { i.min(len) };
        usize::try_from(i).unwrap_or(0)
    };
    let s = clamp(start);
    let e = end.map_or(clamp(len), clamp);
    (s, e.max(s))
}

fn slice(l: Value, start: i64, end: Value) -> Result<Value, Error> {
    let end = match end {
        Value::None => None,
        other => Some(other.as_int().ok_or_else(|| unsupported(&other, "slice"))?),
    };
    match l {
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (a, b) = slice_bounds(chars.len(), start, end);
            Ok(Value::Str(chars[a..b].iter().collect()))
        }
        Value::Tuple(items) => {
            let (a, b) = slice_bounds(items.len(), start, end);
            Ok(Value::Tuple(items[a..b].to_vec()))
        }
        other => Err(unsupported(&other, "slice")),
    }
}

fn length(l: Value) -> Result<i64, Error> {
    let n = match &l {
        Value::Str(s) => s.chars().count(),
        Value::Tuple(items) => items.len(),
        Value::Collection(c) => c.len(),
        other => return Err(unsupported(other, "length")),
    };
    i64::try_from(n).map_err(|_| overflow("length"))
}

/// Append to a tuple receiver, or pair two plain objects
fn tuplepush(l: Object, r: Object) -> Value {
    if let Value::Tuple(items) = l.value() {
        let mut items = items.clone();
        items.push(r);
        return Value::Tuple(items);
    }
    Value::Tuple(vec![l, r])
}

//
// Conditionals
//

fn run_branch(ctx: &mut InvocationContext, body: Object, subject: Object) -> Result<Returned, Error> {
    match body.value() {
        Value::Function(f) => Ok(Returned::Object(f.run(subject, ctx)?)),
        _ => Ok(Returned::Object(body)),
    }
}

fn args_n<const N: usize>(args: Vec<Object>) -> Result<[Object; N], Error> {
    <[Object; N]>::try_from(args).map_err(|v| Error::arity_error(N, v.len()))
}

fn truth_then(ctx: &mut InvocationContext, args: Vec<Object>) -> Result<Returned, Error> {
    let [left, if_, else_] = args_n(args)?;
    let body = if left.is_truth() { if_ } else { else_ };
    run_branch(ctx, body, left)
}

fn falsy_then(ctx: &mut InvocationContext, args: Vec<Object>) -> Result<Returned, Error> {
    let [left, if_, else_] = args_n(args)?;
    let body = if left.is_truth() { else_ } else { if_ };
    run_branch(ctx, body, left)
}

fn test_then(ctx: &mut InvocationContext, args: Vec<Object>) -> Result<Returned, Error> {
    let [left, cond, if_, else_] = args_n(args)?;
    let tested = match run_branch(ctx, cond, left.clone())? {
        Returned::Object(o) => o.is_truth(),
        Returned::Value(v) => v.is_truthy(),
    };
    let body = if tested { if_ } else { else_ };
    run_branch(ctx, body, left)
}

//
// Objects and types
//

fn identical(l: Object) -> Object {
    l
}

fn type_of(l: Object) -> TypeRef {
    Arc::clone(l.ty())
}

fn stringify(l: Object) -> String {
    l.stringify()
}

fn help(ctx: &mut InvocationContext, args: Vec<Object>) -> Result<Returned, Error> {
    let [left] = args_n(args)?;
    let ty = Arc::clone(left.ty());
    let doc = ty.get_doc();
    if doc.is_empty() {
        ctx.post("message", ty.name());
    } else {
        ctx.post("message", &format!("{}: {doc}", ty.name()));
    }
    let table = ty.load()?;
    for method in table.methods() {
        let names = table.get_identical_names(method.name()).join(" / ");
        ctx.post(
            "message",
            &format!("  {names} {} {}", method.get_signature(), method.get_doc()),
        );
    }
    Ok(Returned::Value(Value::None))
}

fn bind(ctx: &mut InvocationContext, args: Vec<Object>) -> Result<Returned, Error> {
    let [left, name] = args_n(args)?;
    let name = name.stringify();
    ctx.bind_object(&name, left.clone())?;
    Ok(Returned::Object(left))
}

fn cast(l: Object, ty: TypeRef) -> Result<Object, Error> {
    if !ty.accepts(l.value()) {
        return Err(Error::TypeError(format!(
            "cannot cast {} to '{}'",
            l.get_typename(),
            ty.name()
        )));
    }
    Ok(Object::new(ty, l.into_value()))
}

/// Invocation that drops its arguments
fn void(l: Value) -> Result<Value, Error> {
    match l {
        Value::Invocation(inv) => {
            let voided: Invocation = inv.as_ref().clone().with_modifiers(Modifiers::IGNORE_ARGS);
            Ok(Value::Invocation(Arc::new(voided)))
        }
        other => Err(Error::TypeError(format!(
            "void needs an Invocation, got {}",
            other.kind().primitive_name()
        ))),
    }
}

fn right(typename: &str) -> MethodParameter {
    MethodParameter::new("right", typename)
}

fn branch(name: &str) -> MethodParameter {
    MethodParameter::new(name, "Function")
}

#[expect(clippy::too_many_lines)] // one registration per generic method
fn build_generic_table() -> Result<MethodTable, Error> {
    let mut t = MethodTable::new();

    // comparison
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("equal", equal)
            .doc("Equal values")
            .param(right("Any"))
            .returns("Bool"),
        &["=="],
    )?;
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("not-equal", not_equal)
            .param(right("Any"))
            .returns("Bool"),
        &["!="],
    )?;
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("less", less)
            .param(right("Any"))
            .returns("Bool"),
        &["<"],
    )?;
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("less-equal", less_equal)
            .param(right("Any"))
            .returns("Bool"),
        &["<="],
    )?;
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("greater", greater)
            .param(right("Any"))
            .returns("Bool"),
        &[">"],
    )?;
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("greater-equal", greater_equal)
            .param(right("Any"))
            .returns("Bool"),
        &[">="],
    )?;
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("compare", compare)
            .doc("-1, 0 or 1 as the receiver orders before, with or after the argument")
            .param(right("Any"))
            .returns("Int"),
        &["<=>"],
    )?;
    t.add(
        Method::function::<(Value, Value, Value), _>("is-between", is_between)
            .param(MethodParameter::new("min", "Any"))
            .param(MethodParameter::new("max", "Any"))
            .returns("Bool"),
    )?;
    t.add(
        Method::function::<(Object, Object), _>("is", is)
            .doc("Same type and value")
            .param(right("Any"))
            .returns("Bool"),
    )?;
    t.add(
        Method::function::<(Object, Object), _>("is-not", is_not)
            .param(right("Any"))
            .returns("Bool"),
    )?;
    t.add(Method::function::<(Value,), _>("is-none", is_none).returns("Bool"))?;
    t.add(Method::function::<(Value,), _>("truth", truth).returns("Bool"))?;
    t.add(Method::function::<(Value,), _>("falsy", falsy).returns("Bool"))?;

    // arithmetic
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("add", add).param(right("Any")),
        &["+"],
    )?;
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("sub", sub).param(right("Any")),
        &["-"],
    )?;
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("mul", mul).param(right("Any")),
        &["*"],
    )?;
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("div", div)
            .doc("True division")
            .param(right("Any"))
            .returns("Float"),
        &["/"],
    )?;
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("floordiv", floordiv).param(right("Any")),
        &["//"],
    )?;
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("mod", modulo).param(right("Any")),
        &["%"],
    )?;
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("pow", pow).param(right("Any")),
        &["**"],
    )?;
    t.add_with_aliases(Method::function::<(Value,), _>("negative", negative), &["-="])?;
    t.add_with_aliases(Method::function::<(Value,), _>("positive", positive), &["+="])?;

    // bits
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("bitand", bitand)
            .param(right("Int"))
            .returns("Int"),
        &["&"],
    )?;
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("bitor", bitor)
            .param(right("Int"))
            .returns("Int"),
        &["|"],
    )?;
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("bitxor", bitxor)
            .param(right("Int"))
            .returns("Int"),
        &["^"],
    )?;
    t.add_with_aliases(
        Method::function::<(Value,), _>("bitinv", bitinv).returns("Int"),
        &["~"],
    )?;
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("lshift", lshift)
            .param(right("Int"))
            .returns("Int"),
        &["<<"],
    )?;
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("rshift", rshift)
            .param(right("Int"))
            .returns("Int"),
        &[">>"],
    )?;

    // containers
    t.add_with_aliases(
        Method::function::<(Value, Value), _>("is-in", is_in)
            .doc("The receiver is an element, substring or member name of the argument")
            .param(right("Any"))
            .returns("Bool"),
        &["in"],
    )?;
    t.add(
        Method::function::<(Value, Value), _>("contains", contains)
            .param(right("Any"))
            .returns("Bool"),
    )?;
    t.add_with_aliases(
        Method::function::<(Object, Object), _>("at", at).param(MethodParameter::new("index", "Any")),
        &["#"],
    )?;
    t.add(
        Method::function::<(Value, i64, Value), _>("slice", slice)
            .doc("Items from start up to, not including, end")
            .param(MethodParameter::new("start", "Int"))
            .param(MethodParameter::new("end", "Int").with_default(Value::None)),
    )?;
    t.add(Method::function::<(Value,), _>("length", length).returns("Int"))?;
    t.add_with_aliases(
        Method::function::<(Object, Object), _>("tuplepush", tuplepush)
            .param(right("Any"))
            .returns("Tuple"),
        &["/+"],
    )?;

    // conditionals
    t.add(
        Method::contextual("truth-then", truth_then)
            .doc("Run the first function with the receiver if it is truthy, the second otherwise")
            .params([branch("if"), branch("else")]),
    )?;
    t.add(
        Method::contextual("falsy-then", falsy_then).params([branch("if"), branch("else")]),
    )?;
    t.add(
        Method::contextual("test-then", test_then)
            .params([branch("cond"), branch("if"), branch("else")]),
    )?;

    // objects
    t.add_with_aliases(Method::function::<(Object,), _>("identical", identical), &["="])?;
    t.add(Method::function::<(Object,), _>("type", type_of).returns("Type"))?;
    t.add(Method::function::<(Object,), _>("stringify", stringify).returns("Str"))?;
    t.add(
        Method::contextual("help", help)
            .doc("Post the receiver type's methods")
            .flags(MethodFlags::SPIRIT_BOUND)
            .returns("None"),
    )?;
    t.add_with_aliases(
        Method::contextual("bind", bind).param(MethodParameter::new("name", "Str")),
        &["=>"],
    )?;
    t.add(
        Method::function::<(Object, TypeRef), _>("cast", cast)
            .param(MethodParameter::new("type", "Type")),
    )?;
    t.add(Method::function::<(Value,), _>("void", void).returns("Invocation"))?;
    Ok(t)
}
