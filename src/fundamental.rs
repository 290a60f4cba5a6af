//! The fundamental type module: primitive types, the collection and error
//! types, and the root object answering `@#member`.
//!
//! Str receivers also accept a fixed set of primitive text methods
//! ([`str_instance_method`]) that are not part of the Str method table; the
//! selector resolves them as instance methods.

use crate::context::{FlagScope, InvocationContext, InvocationFlags};
use crate::function::{parse_function, parse_sequential_function};
use crate::invocation::{PrimitiveFn, Returned};
use crate::literal::parse_literal;
use crate::message::{MessageEngine, fork};
use crate::method::{Method, MethodParameter};
use crate::object::{Object, ObjectCollection, Value};
use crate::registry::TypeModule;
use crate::types::{
    MethodTable, Type, TypeFlags, TypeInstance, TypeRef, ValueKind, construct_instance, construct_obj,
};
use crate::Error;
use regex::Regex;
use std::sync::{Arc, LazyLock};

static FUNDAMENTAL: LazyLock<Arc<TypeModule>> = LazyLock::new(|| Arc::new(build_module()));

/// The shared module every context falls back to
pub fn fundamental_module() -> Arc<TypeModule> {
    Arc::clone(&FUNDAMENTAL)
}

pub fn fundamental_type(name: &str) -> Result<TypeRef, Error> {
    FUNDAMENTAL.get(name)
}

fn build_module() -> TypeModule {
    let mut module = TypeModule::new();
    let primary = TypeFlags::DEDUCIBLE;
    module.define(
        Type::new("Any", ValueKind::Any)
            .doc("Any value")
            .flags(TypeFlags::ANY),
    );
    module.define(Type::new("None", ValueKind::None).doc("No value").flags(primary));
    module.define(
        Type::new("Bool", ValueKind::Bool)
            .doc("Truth value")
            .flags(primary)
            .describe(describe_bool),
    );
    module.define(
        Type::new("Int", ValueKind::Int)
            .doc("Signed 64-bit integer")
            .flags(primary)
            .describe(describe_int),
    );
    module.define(
        Type::new("Float", ValueKind::Float)
            .doc("Double precision float")
            .flags(primary)
            .describe(describe_float),
    );
    module.define(
        Type::new("Str", ValueKind::Str)
            .doc("Text")
            .flags(primary)
            .describe(describe_str),
    );
    module.define(
        Type::new("Tuple", ValueKind::Tuple)
            .doc("Ordered sequence of objects")
            .flags(primary)
            .describe(describe_tuple),
    );
    module.define(
        Type::new("Type", ValueKind::Type)
            .doc("A type")
            .flags(primary)
            .describe(describe_type),
    );
    module.define(
        Type::new("Function", ValueKind::Function)
            .doc("Message expression run against a subject")
            .flags(primary)
            .describe(describe_function),
    );
    module.define(
        Type::new("Invocation", ValueKind::Invocation)
            .doc("A selected method, not yet invoked")
            .flags(primary)
            .describe(describe_invocation),
    );
    module.define(
        Type::new("ObjectCollection", ValueKind::Collection)
            .doc("Named objects; selectors resolve as member names")
            .flags(TypeFlags::OBJECT_COLLECTION | primary),
    );
    module.define(
        Type::new("Error", ValueKind::Error)
            .doc("A failed evaluation")
            .flags(primary)
            .describe(describe_error),
    );
    module.define(
        Type::new("RootObject", ValueKind::None)
            .doc("Context introspection")
            .flags(TypeFlags::NO_INSTANCE_METHOD)
            .describe(describe_root),
    );
    tracing::debug!(types = module.type_names().len(), "fundamental module built");
    module
}

fn text_of(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

fn cannot_construct(typename: &str, source: &Object) -> Error {
    Error::TypeError(format!(
        "cannot construct '{typename}' from '{}'",
        source.get_typename()
    ))
}

//
// Bool
//

fn bool_ctor(
    _ctx: &mut InvocationContext,
    source: Object,
    _type_args: &[TypeInstance],
    _args: &[Object],
) -> Result<Value, Error> {
    match source.value() {
        Value::Str(s) => match s.to_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(Error::ValueError(format!("invalid literal for Bool: '{s}'"))),
        },
        other => Ok(Value::Bool(other.is_truthy())),
    }
}

fn describe_bool(t: &mut MethodTable) -> Result<(), Error> {
    t.set_constructor(Vec::new(), bool_ctor);
    Ok(())
}

//
// Int
//

fn parse_int(text: &str, base: Option<u32>) -> Result<i64, Error> {
    let invalid = || Error::ValueError(format!("invalid literal for Int: '{text}'"));
    let trimmed = text.trim();
    let Some(base) = base else {
        return match parse_literal(trimmed) {
            Value::Int(n) => Ok(n),
            _ => Err(invalid()),
        };
    };
    if !(2..=36).contains(&base) {
        return Err(Error::ValueError(format!("Int base must be in 2..=36, got {base}")));
    }
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let prefix = match base {
        16 => Some("0x"),
        8 => Some("0o"),
        2 => Some("0b"),
        _ => None,
    };
    let digits = prefix
        .and_then(|p| digits.strip_prefix(p).or_else(|| digits.strip_prefix(&p.to_uppercase())))
        .unwrap_or(digits)
        .replace('_', "");
    let magnitude = i64::from_str_radix(&digits, base).map_err(|_| invalid())?;
    Ok(if negative { -magnitude } else { magnitude })
}

fn float_to_int(x: f64) -> Result<i64, Error> {
    // i64::MAX as f64 rounds up to 2^63, which is out of range
    if !x.is_finite() || x >= i64::MAX as f64 || x < i64::MIN as f64 {
        return Err(Error::ValueError(format!("cannot convert {x} to Int")));
    }
    Ok(x.trunc() as i64)
}

fn int_ctor(
    _ctx: &mut InvocationContext,
    source: Object,
    _type_args: &[TypeInstance],
    args: &[Object],
) -> Result<Value, Error> {
    let base = match args.first().map(Object::value) {
        None | Some(Value::None) => None,
        Some(Value::Int(b)) => Some(
            u32::try_from(*b).map_err(|_| Error::ValueError(format!("invalid Int base {b}")))?,
        ),
        Some(other) => {
            return Err(Error::TypeError(format!(
                "Int base must be Int, got {}",
                other.kind().primitive_name()
            )));
        }
    };
    match (source.value(), base) {
        (Value::Int(n), None) => Ok(Value::Int(*n)),
        (Value::Int(n), Some(_)) => parse_int(&n.to_string(), base).map(Value::Int),
        (Value::Bool(b), _) => Ok(Value::Int(i64::from(*b))),
        (Value::Float(x), _) => float_to_int(*x).map(Value::Int),
        (Value::Str(s), _) => parse_int(s, base).map(Value::Int),
        _ => Err(cannot_construct("Int", &source)),
    }
}

fn radix_text(n: i64, prefix: &str, digits: impl Fn(u64) -> String) -> String {
    let sign = if n < 0 { "-" } else { "" };
    format!("{sign}{prefix}{}", digits(n.unsigned_abs()))
}

fn hex(n: i64) -> String {
    radix_text(n, "0x", |m| format!("{m:x}"))
}

fn oct(n: i64) -> String {
    radix_text(n, "0o", |m| format!("{m:o}"))
}

fn bin(n: i64) -> String {
    radix_text(n, "0b", |m| format!("{m:b}"))
}

fn abs(n: i64) -> Result<i64, Error> {
    n.checked_abs()
        .ok_or_else(|| Error::ValueError("integer overflow in abs".into()))
}

fn describe_int(t: &mut MethodTable) -> Result<(), Error> {
    t.set_constructor(
        vec![MethodParameter::new("base", "Int")
            .optional()
            .doc("Radix of the source text")],
        int_ctor,
    );
    t.add(Method::function::<(i64,), _>("hex", hex).doc("Hexadecimal text").returns("Str"))?;
    t.add(Method::function::<(i64,), _>("oct", oct).doc("Octal text").returns("Str"))?;
    t.add(Method::function::<(i64,), _>("bin", bin).doc("Binary text").returns("Str"))?;
    t.add(Method::function::<(i64,), _>("abs", abs).returns("Int"))?;
    Ok(())
}

//
// Float
//

fn float_ctor(
    _ctx: &mut InvocationContext,
    source: Object,
    _type_args: &[TypeInstance],
    _args: &[Object],
) -> Result<Value, Error> {
    match source.value() {
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| Error::ValueError(format!("invalid literal for Float: '{s}'"))),
        other => other
            .as_float()
            .map(Value::Float)
            .ok_or_else(|| cannot_construct("Float", &source)),
    }
}

/// Half to even; an integer without `digits`, a float rounded at `digits` otherwise
fn round(x: f64, digits: Value) -> Result<Value, Error> {
    match digits {
        Value::None => float_to_int(x.round_ties_even()).map(Value::Int),
        Value::Int(d) => {
            let d = i32::try_from(d).map_err(|_| Error::ValueError(format!("bad digits {d}")))?;
            let scale = 10f64.powi(d);
            Ok(Value::Float((x * scale).round_ties_even() / scale))
        }
        other => Err(Error::TypeError(format!(
            "round digits must be Int, got {}",
            other.kind().primitive_name()
        ))),
    }
}

fn floor(x: f64) -> Result<i64, Error> {
    float_to_int(x.floor())
}

fn ceil(x: f64) -> Result<i64, Error> {
    float_to_int(x.ceil())
}

fn describe_float(t: &mut MethodTable) -> Result<(), Error> {
    t.set_constructor(Vec::new(), float_ctor);
    t.add(
        Method::function::<(f64, Value), _>("round", round)
            .param(MethodParameter::new("digits", "Int").with_default(Value::None)),
    )?;
    t.add(Method::function::<(f64,), _>("floor", floor).returns("Int"))?;
    t.add(Method::function::<(f64,), _>("ceil", ceil).returns("Int"))?;
    Ok(())
}

//
// Str
//

fn str_ctor(
    _ctx: &mut InvocationContext,
    source: Object,
    _type_args: &[TypeInstance],
    _args: &[Object],
) -> Result<Value, Error> {
    Ok(Value::Str(source.stringify()))
}

fn compile_pattern(pattern: &str) -> Result<Regex, Error> {
    Regex::new(pattern).map_err(|e| Error::ValueError(format!("bad pattern '{pattern}': {e}")))
}

fn reg_match(s: &str, pattern: &str) -> Result<bool, Error> {
    Ok(compile_pattern(&format!("^(?:{pattern})"))?.is_match(s))
}

fn reg_search(s: &str, pattern: &str) -> Result<bool, Error> {
    Ok(compile_pattern(pattern)?.is_match(s))
}

fn reg_replace(s: &str, pattern: &str, new: &str, count: i64) -> Result<String, Error> {
    let limit = usize::try_from(count).unwrap_or(0);
    Ok(compile_pattern(pattern)?.replacen(s, limit, new).into_owned())
}

/// Evaluate the text as a message; errors are raised, not contained
fn str_do(ctx: &mut InvocationContext, args: Vec<Object>) -> Result<Returned, Error> {
    let mut args = args.into_iter();
    let text = args.next().map(|o| o.stringify()).unwrap_or_default();
    let subject = args
        .next()
        .filter(|o| !o.is_none())
        .or_else(|| ctx.subject_object().cloned());
    let mut child = fork(ctx, subject)?;
    child.set_flags(InvocationFlags::RAISE_ERROR, FlagScope::Now);
    let result = MessageEngine::new(&text).run_here(&mut child, false);
    ctx.add_subcontext(child);
    result.map(Returned::Object)
}

fn str_fn(s: &str) -> Result<Value, Error> {
    parse_function(s).map(|f| Value::Function(Arc::new(f)))
}

fn split(ctx: &mut InvocationContext, args: Vec<Object>) -> Result<Returned, Error> {
    let mut args = args.into_iter();
    let text = args.next().map(|o| o.stringify()).unwrap_or_default();
    let pieces: Vec<String> = match args.next().map(Object::into_value) {
        None | Some(Value::None) => text.split_whitespace().map(str::to_string).collect(),
        Some(sep) => {
            let sep = text_of(&sep);
            if sep.is_empty() {
                return Err(Error::ValueError("empty separator".into()));
            }
            text.split(sep.as_str()).map(str::to_string).collect()
        }
    };
    let items = pieces
        .into_iter()
        .map(|p| ctx.new_object(Value::Str(p)))
        .collect::<Vec<_>>();
    Ok(Returned::Value(Value::Tuple(items)))
}

fn join(sep: &str, items: Vec<Object>) -> String {
    items
        .iter()
        .map(Object::stringify)
        .collect::<Vec<_>>()
        .join(sep)
}

fn describe_str(t: &mut MethodTable) -> Result<(), Error> {
    t.set_constructor(Vec::new(), str_ctor);
    let pattern = || MethodParameter::new("pattern", "Str").doc("Regular expression");
    t.add(
        Method::function::<(&str, &str), _>("reg-match", reg_match)
            .doc("Whether the pattern matches at the start")
            .param(pattern())
            .returns("Bool"),
    )?;
    t.add(
        Method::function::<(&str, &str), _>("reg-search", reg_search)
            .doc("Whether the pattern matches anywhere")
            .param(pattern())
            .returns("Bool"),
    )?;
    t.add(
        Method::function::<(&str, &str, &str, i64), _>("reg-replace", reg_replace)
            .param(pattern())
            .param(MethodParameter::new("new", "Str"))
            .param(
                MethodParameter::new("count", "Int")
                    .with_default(Value::Int(0))
                    .doc("Replacements; 0 replaces every match"),
            )
            .returns("Str"),
    )?;
    t.add(
        Method::contextual("do", str_do)
            .doc("Evaluate the text as a message")
            .param(MethodParameter::new("subject", "Any").with_default(Value::None)),
    )?;
    t.add(Method::function::<(&str,), _>("fn", str_fn).returns("Function"))?;
    t.add(
        Method::contextual("split", split)
            .param(MethodParameter::new("sep", "Str").with_default(Value::None))
            .returns("Tuple"),
    )?;
    t.add(
        Method::function::<(&str, Vec<Object>), _>("join", join)
            .doc("Join the items with the receiver between them")
            .param(MethodParameter::new("items", "Tuple"))
            .returns("Str"),
    )?;
    Ok(())
}

//
// Str primitive instance methods
//

/// A text method run on the bare receiver string
pub struct StrMethod {
    pub name: &'static str,
    pub min: usize,
    pub max: usize,
    pub action: PrimitiveFn,
}

fn arg_text(args: &[Value], i: usize) -> Option<String> {
    args.get(i).filter(|v| **v != Value::None).map(text_of)
}

fn arg_usize(args: &[Value], i: usize) -> Result<Option<usize>, Error> {
    match args.get(i) {
        None | Some(Value::None) => Ok(None),
        Some(Value::Int(n)) => Ok(Some(usize::try_from(*n).unwrap_or(0))),
        Some(Value::Str(s)) => match parse_literal(s) {
            Value::Int(n) => Ok(Some(usize::try_from(n).unwrap_or(0))),
            _ => Err(Error::TypeError(format!("expected Int, got '{s}'"))),
        },
        Some(other) => Err(Error::TypeError(format!(
            "expected Int, got {}",
            other.kind().primitive_name()
        ))),
    }
}

fn required_text(args: &[Value], i: usize) -> Result<String, Error> {
    arg_text(args, i).ok_or_else(|| Error::ValueError(format!("argument {} is missing", i + 1)))
}

fn fill_char(args: &[Value], i: usize) -> Result<char, Error> {
    match arg_text(args, i) {
        None => Ok(' '),
        Some(fill) => {
            let mut chars = fill.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(c),
                _ => Err(Error::TypeError(format!("fill must be one character, got '{fill}'"))),
            }
        }
    }
}

/// Left and right padding that brings `s` to `width`
fn padding(s: &str, args: &[Value]) -> Result<(usize, char), Error> {
    let width = arg_usize(args, 0)?.unwrap_or(0);
    Ok((width.saturating_sub(s.chars().count()), fill_char(args, 1)?))
}

fn pad(s: &str, left: usize, right: usize, fill: char) -> Value {
    let fill = fill.to_string();
    Value::Str(format!("{}{s}{}", fill.repeat(left), fill.repeat(right)))
}

fn s_startswith(s: &str, args: &[Value]) -> Result<Value, Error> {
    Ok(Value::Bool(s.starts_with(&required_text(args, 0)?)))
}

fn s_endswith(s: &str, args: &[Value]) -> Result<Value, Error> {
    Ok(Value::Bool(s.ends_with(&required_text(args, 0)?)))
}

fn s_upper(s: &str, _: &[Value]) -> Result<Value, Error> {
    Ok(Value::Str(s.to_uppercase()))
}

fn s_lower(s: &str, _: &[Value]) -> Result<Value, Error> {
    Ok(Value::Str(s.to_lowercase()))
}

fn s_strip(s: &str, args: &[Value]) -> Result<Value, Error> {
    let stripped = match arg_text(args, 0) {
        Some(chars) => s.trim_matches(|c: char| chars.contains(c)),
        None => s.trim(),
    };
    Ok(Value::Str(stripped.to_string()))
}

fn s_center(s: &str, args: &[Value]) -> Result<Value, Error> {
    let (margin, fill) = padding(s, args)?;
    let width = arg_usize(args, 0)?.unwrap_or(0);
    // odd margins put the extra fill on the left only when width is odd
    let left = margin / 2 + (margin & width & 1);
    Ok(pad(s, left, margin - left, fill))
}

fn s_ljust(s: &str, args: &[Value]) -> Result<Value, Error> {
    let (margin, fill) = padding(s, args)?;
    Ok(pad(s, 0, margin, fill))
}

fn s_rjust(s: &str, args: &[Value]) -> Result<Value, Error> {
    let (margin, fill) = padding(s, args)?;
    Ok(pad(s, margin, 0, fill))
}

fn s_replace(s: &str, args: &[Value]) -> Result<Value, Error> {
    let old = required_text(args, 0)?;
    let new = required_text(args, 1)?;
    let replaced = match arg_usize(args, 2)? {
        Some(count) => s.replacen(&old, &new, count),
        None => s.replace(&old, &new),
    };
    Ok(Value::Str(replaced))
}

fn s_find(s: &str, args: &[Value]) -> Result<Value, Error> {
    let sub = required_text(args, 0)?;
    let index = s
        .find(&sub)
        .and_then(|byte| i64::try_from(s[..byte].chars().count()).ok())
        .unwrap_or(-1);
    Ok(Value::Int(index))
}

fn s_count(s: &str, args: &[Value]) -> Result<Value, Error> {
    let sub = required_text(args, 0)?;
    let n = if sub.is_empty() {
        s.chars().count() + 1
    } else {
        s.matches(&sub).count()
    };
    Ok(Value::Int(i64::try_from(n).unwrap_or(i64::MAX)))
}

fn s_isdigit(s: &str, _: &[Value]) -> Result<Value, Error> {
    Ok(Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit())))
}

fn s_zfill(s: &str, args: &[Value]) -> Result<Value, Error> {
    let width = arg_usize(args, 0)?.unwrap_or(0);
    let zeros = "0".repeat(width.saturating_sub(s.chars().count()));
    let filled = match s.strip_prefix(|c: char| c == '+' || c == '-') {
        Some(rest) => format!("{}{zeros}{rest}", &s[..1]),
        None => format!("{zeros}{s}"),
    };
    Ok(Value::Str(filled))
}

fn s_title(s: &str, _: &[Value]) -> Result<Value, Error> {
    let mut out = String::with_capacity(s.len());
    let mut in_word = false;
    for c in s.chars() {
        if in_word {
            out.extend(c.to_lowercase());
        } else {
            out.extend(c.to_uppercase());
        }
        in_word = c.is_alphabetic();
    }
    Ok(Value::Str(out))
}

fn s_capitalize(s: &str, _: &[Value]) -> Result<Value, Error> {
    let mut chars = s.chars();
    let out: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    };
    Ok(Value::Str(out))
}

static STR_METHODS: &[StrMethod] = &[
    StrMethod { name: "startswith", min: 1, max: 1, action: s_startswith },
    StrMethod { name: "endswith", min: 1, max: 1, action: s_endswith },
    StrMethod { name: "upper", min: 0, max: 0, action: s_upper },
    StrMethod { name: "lower", min: 0, max: 0, action: s_lower },
    StrMethod { name: "strip", min: 0, max: 1, action: s_strip },
    StrMethod { name: "center", min: 1, max: 2, action: s_center },
    StrMethod { name: "ljust", min: 1, max: 2, action: s_ljust },
    StrMethod { name: "rjust", min: 1, max: 2, action: s_rjust },
    StrMethod { name: "replace", min: 2, max: 3, action: s_replace },
    StrMethod { name: "find", min: 1, max: 1, action: s_find },
    StrMethod { name: "count", min: 1, max: 1, action: s_count },
    StrMethod { name: "isdigit", min: 0, max: 0, action: s_isdigit },
    StrMethod { name: "zfill", min: 1, max: 1, action: s_zfill },
    StrMethod { name: "title", min: 0, max: 0, action: s_title },
    StrMethod { name: "capitalize", min: 0, max: 0, action: s_capitalize },
];

/// Primitive text method of Str receivers
pub fn str_instance_method(name: &str) -> Option<&'static StrMethod> {
    STR_METHODS.iter().find(|m| m.name == name)
}

//
// Tuple
//

/// Items come from the source, or the source and the extra arguments; with
/// an item type bound, each item is constructed as that type
fn tuple_ctor(
    ctx: &mut InvocationContext,
    source: Object,
    type_args: &[TypeInstance],
    args: &[Object],
) -> Result<Value, Error> {
    let items: Vec<Object> = if args.is_empty() {
        match source.into_value() {
            Value::Tuple(items) => items,
            Value::Str(s) => s
                .split_whitespace()
                .map(|p| ctx.new_object(Value::Str(p.to_string())))
                .collect(),
            Value::Collection(c) => c.items().map(|item| item.object.clone()).collect(),
            other => vec![ctx.new_object(other)],
        }
    } else {
        std::iter::once(source).chain(args.iter().cloned()).collect()
    };
    let Some(itemtype) = type_args.first().filter(|t| !t.ty.is_any()) else {
        return Ok(Value::Tuple(items));
    };
    let items = items
        .into_iter()
        .map(|item| construct_instance(itemtype, ctx, item, &[]))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Tuple(items))
}

fn first(items: Vec<Object>) -> Result<Object, Error> {
    items
        .into_iter()
        .next()
        .ok_or_else(|| Error::IndexError("first of an empty tuple".into()))
}

fn last(items: Vec<Object>) -> Result<Object, Error> {
    items
        .into_iter()
        .next_back()
        .ok_or_else(|| Error::IndexError("last of an empty tuple".into()))
}

fn tuple_items(obj: Object) -> Result<Vec<Object>, Error> {
    obj.try_into()
}

/// Fold the items pairwise with `method`: `(@ left) method (@ right)`
fn reduce(ctx: &mut InvocationContext, args: Vec<Object>) -> Result<Returned, Error> {
    let mut args = args.into_iter();
    let items = tuple_items(args.next().ok_or_else(|| Error::arity_error(2, 0))?)?;
    let method = args.next().map(|o| o.stringify()).unwrap_or_default();
    let start = args.next().filter(|o| !o.is_none());

    let mut items = items.into_iter();
    let Some(mut acc) = start.or_else(|| items.next()) else {
        return Err(Error::ValueError("reduce of an empty tuple with no start".into()));
    };
    let mut step = parse_sequential_function(&format!("(@ left) {method} (@ right)"), ctx)?;
    for right in items {
        ctx.check_interruption()?;
        let mut operands = ObjectCollection::new();
        operands.push("left", acc);
        operands.push("right", right);
        let subject = ctx.new_object(Value::Collection(Arc::new(operands)));
        acc = step.run(subject)?;
    }
    Ok(Returned::Object(acc))
}

/// Run the predicate on every item
fn map(ctx: &mut InvocationContext, args: Vec<Object>) -> Result<Returned, Error> {
    let [items, predicate] = <[Object; 2]>::try_from(args).map_err(|v| Error::arity_error(2, v.len()))?;
    let Value::Function(f) = predicate.into_value() else {
        return Err(Error::TypeError("map needs a Function".into()));
    };
    let mut results = Vec::new();
    for item in tuple_items(items)? {
        results.push(f.run(item, ctx)?);
    }
    Ok(Returned::Value(Value::Tuple(results)))
}

fn describe_tuple(t: &mut MethodTable) -> Result<(), Error> {
    t.set_type_params(vec![MethodParameter::new("itemtype", "Type")
        .optional()
        .doc("Type every item is constructed as")]);
    t.set_constructor(Vec::new(), tuple_ctor);
    t.add(Method::function::<(Vec<Object>,), _>("first", first))?;
    t.add(Method::function::<(Vec<Object>,), _>("last", last))?;
    t.add(
        Method::contextual("reduce", reduce)
            .doc("Fold the items with a binary method")
            .param(MethodParameter::new("method", "Str"))
            .param(MethodParameter::new("start", "Any").with_default(Value::None)),
    )?;
    t.add(
        Method::contextual("map", map)
            .param(MethodParameter::new("predicate", "Function"))
            .returns("Tuple"),
    )?;
    Ok(())
}

//
// Type
//

fn type_name(ty: TypeRef) -> String {
    ty.name().to_string()
}

fn type_doc(ty: TypeRef) -> String {
    ty.get_doc().to_string()
}

fn type_methods(ctx: &mut InvocationContext, args: Vec<Object>) -> Result<Returned, Error> {
    let [receiver] = <[Object; 1]>::try_from(args).map_err(|v| Error::arity_error(1, v.len()))?;
    let ty = TypeRef::try_from(receiver)?;
    let names = ty
        .load()?
        .methods()
        .iter()
        .map(|m| ctx.new_object(Value::Str(m.name().to_string())))
        .collect();
    Ok(Returned::Value(Value::Tuple(names)))
}

/// Construct an instance from the first argument and the rest as constructor arguments
fn type_instance(ctx: &mut InvocationContext, args: Vec<Object>) -> Result<Returned, Error> {
    let mut args = args.into_iter();
    let ty = TypeRef::try_from(args.next().ok_or_else(|| Error::arity_error(1, 0))?)?;
    let source = args.next().unwrap_or_else(|| ctx.new_object(Value::None));
    let rest: Vec<Object> = args.collect();
    construct_obj(&ty, ctx, source, &rest).map(Returned::Object)
}

fn describe_type(t: &mut MethodTable) -> Result<(), Error> {
    t.add(Method::function::<(TypeRef,), _>("name", type_name).returns("Str"))?;
    t.add(Method::function::<(TypeRef,), _>("doc", type_doc).returns("Str"))?;
    t.add(Method::contextual("methods", type_methods).returns("Tuple"))?;
    t.add(
        Method::contextual("instance", type_instance)
            .doc("Construct a value of this type")
            .param(MethodParameter::new("args", "Any").variable()),
    )?;
    Ok(())
}

//
// Function
//

fn function_ctor(
    _ctx: &mut InvocationContext,
    source: Object,
    _type_args: &[TypeInstance],
    _args: &[Object],
) -> Result<Value, Error> {
    match source.value() {
        Value::Str(s) => str_fn(s),
        Value::Function(f) => Ok(Value::Function(Arc::clone(f))),
        _ => Err(cannot_construct("Function", &source)),
    }
}

fn function_do(ctx: &mut InvocationContext, args: Vec<Object>) -> Result<Returned, Error> {
    let mut args = args.into_iter();
    let receiver = args.next().map(Object::into_value);
    let Some(Value::Function(f)) = receiver else {
        return Err(Error::TypeError("do needs a Function receiver".into()));
    };
    let subject = args
        .next()
        .filter(|o| !o.is_none())
        .or_else(|| ctx.subject_object().cloned())
        .unwrap_or_else(|| ctx.new_object(Value::None));
    f.run(subject, ctx).map(Returned::Object)
}

fn function_expression(f: Value) -> Result<String, Error> {
    match f {
        Value::Function(f) => Ok(f.source().to_string()),
        other => Err(Error::TypeError(format!(
            "expected Function, got {}",
            other.kind().primitive_name()
        ))),
    }
}

fn describe_function(t: &mut MethodTable) -> Result<(), Error> {
    t.set_constructor(Vec::new(), function_ctor);
    t.add(
        Method::contextual("do", function_do)
            .doc("Run against the subject, or the current subject when omitted")
            .param(MethodParameter::new("subject", "Any").with_default(Value::None)),
    )?;
    t.add(Method::function::<(Value,), _>("expression", function_expression).returns("Str"))?;
    Ok(())
}

fn invocation_name(inv: Value) -> Result<String, Error> {
    match inv {
        Value::Invocation(inv) => Ok(inv.get_method_name()),
        other => Err(Error::TypeError(format!(
            "expected Invocation, got {}",
            other.kind().primitive_name()
        ))),
    }
}

fn describe_invocation(t: &mut MethodTable) -> Result<(), Error> {
    t.add(Method::function::<(Value,), _>("name", invocation_name).returns("Str"))?;
    Ok(())
}

//
// Error
//

fn error_payload(value: &Value) -> Result<&Error, Error> {
    match value {
        Value::Error(e) => Ok(&e.error),
        other => Err(Error::TypeError(format!(
            "expected Error, got {}",
            other.kind().primitive_name()
        ))),
    }
}

fn error_message(e: Value) -> Result<String, Error> {
    error_payload(&e).map(ToString::to_string)
}

fn error_type(e: Value) -> Result<String, Error> {
    error_payload(&e).map(|e| e.kind_name().to_string())
}

fn describe_error(t: &mut MethodTable) -> Result<(), Error> {
    t.add(Method::function::<(Value,), _>("message", error_message).returns("Str"))?;
    t.add(Method::function::<(Value,), _>("error-type", error_type).returns("Str"))?;
    Ok(())
}

//
// RootObject
//

fn root_vars(ctx: &mut InvocationContext, _args: Vec<Object>) -> Result<Returned, Error> {
    let mut names: Vec<String> = Vec::new();
    for item in ctx.input_objects().items() {
        if !names.contains(&item.name) {
            names.push(item.name.clone());
        }
    }
    let names = names.into_iter().map(|n| ctx.new_object(Value::Str(n))).collect();
    Ok(Returned::Value(Value::Tuple(names)))
}

fn root_types(ctx: &mut InvocationContext, _args: Vec<Object>) -> Result<Returned, Error> {
    let names = ctx
        .type_module()
        .type_names()
        .into_iter()
        .map(|n| ctx.new_object(Value::Str(n)))
        .collect();
    Ok(Returned::Value(Value::Tuple(names)))
}

fn root_subject(ctx: &mut InvocationContext, _args: Vec<Object>) -> Result<Returned, Error> {
    let subject = ctx
        .subject_object()
        .cloned()
        .unwrap_or_else(|| ctx.new_object(Value::None));
    Ok(Returned::Object(subject))
}

fn describe_root(t: &mut MethodTable) -> Result<(), Error> {
    t.add(Method::contextual("vars", root_vars).doc("Names of bound objects"))?;
    t.add(Method::contextual("types", root_types).doc("Names of visible types"))?;
    t.add(Method::contextual("subject", root_subject).doc("The current subject"))?;
    Ok(())
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    #[derive(Debug)]
    enum TestResult {
        EvalResult(Value),         // Evaluation should succeed with this value
        Printed(&'static str),     // Evaluation should succeed, stringified like this
        ErrorObject(&'static str), // Evaluation yields an Error object of this kind
    }
    use TestResult::*;

    fn execute_test_case(input: &str, expected: &TestResult, test_id: &str) {
        let mut ctx = InvocationContext::instant(None);
        let actual = MessageEngine::new(input)
            .run_here(&mut ctx, false)
            .unwrap_or_else(|e| panic!("{test_id}: '{input}' raised {e}"));
        match expected {
            EvalResult(value) => {
                assert!(!actual.is_error(), "{test_id}: '{input}' failed: {actual:?}");
                assert_eq!(actual.value(), value, "{test_id}: '{input}'");
            }
            Printed(text) => {
                assert!(!actual.is_error(), "{test_id}: '{input}' failed: {actual:?}");
                assert_eq!(actual.stringify(), *text, "{test_id}: '{input}'");
            }
            ErrorObject(kind) => {
                let error = actual
                    .get_error()
                    .unwrap_or_else(|| panic!("{test_id}: '{input}' expected {kind}, got {actual:?}"));
                assert_eq!(error.error.kind_name(), *kind, "{test_id}: '{input}'");
            }
        }
    }

    fn run_tests(test_cases: Vec<(&str, TestResult)>) {
        for (i, (input, expected)) in test_cases.iter().enumerate() {
            execute_test_case(input, expected, &format!("#{}", i + 1));
        }
    }

    fn int(n: i64) -> TestResult {
        EvalResult(Value::Int(n))
    }

    fn text(s: &str) -> TestResult {
        EvalResult(Value::Str(s.to_string()))
    }

    fn boolean(b: bool) -> TestResult {
        EvalResult(Value::Bool(b))
    }

    #[test]
    fn test_constructors() {
        run_tests(vec![
            ("7FFF Int: 16", int(32767)),
            ("10 Int: 16", int(16)),
            ("'0x1f' Int", int(31)),
            ("'-0b101' Int", int(-5)),
            ("'12abc' Int", ErrorObject("ValueError")),
            ("3.9 Int", int(3)),
            ("3 Float", EvalResult(Value::Float(3.0))),
            ("'2.5' Float", EvalResult(Value::Float(2.5))),
            ("'true' Bool", boolean(true)),
            ("0 Bool", boolean(false)),
            ("maybe Bool", ErrorObject("ValueError")),
            ("42 Str", text("42")),
            ("'a b c' Tuple", Printed("a b c")),
            ("Int: ff 16", int(255)),
            ("(Tuple: a b c) length", int(3)),
            // item types bound by type arguments
            ("'1 2 3' Tuple[Int] first", int(1)),
            ("('1 2 3' Tuple: Int) reduce add", int(6)),
            ("('1 2 3' Tuple) reduce add", text("123")),
            ("'1 x' Tuple[Int]", ErrorObject("ValueError")),
            ("1 Int[Str]", ErrorObject("TypeError")),
            ("'1 2' Tuple[Nothing]", ErrorObject("BadTypename")),
            // floats outside the Int range
            ("9.2e18 Int", int(9_200_000_000_000_000_000)),
            ("1e300 Int", ErrorObject("ValueError")),
            ("-1e19 Int", ErrorObject("ValueError")),
        ]);
    }

    #[test]
    fn test_number_methods() {
        run_tests(vec![
            ("255 hex", text("0xff")),
            ("-255 hex", text("-0xff")),
            ("8 oct", text("0o10")),
            ("5 bin", text("0b101")),
            ("-5 abs", int(5)),
            ("2.5 floor", int(2)),
            ("2.5 ceil", int(3)),
            ("2.5 round", int(2)),
            ("3.5 round", int(4)),
            ("2.567 round: 2", EvalResult(Value::Float(2.57))),
            ("1e300 floor", ErrorObject("ValueError")),
            ("-1e300 ceil", ErrorObject("ValueError")),
            ("9.3e18 round", ErrorObject("ValueError")),
            ("-9.2e18 floor", int(-9_200_000_000_000_000_000)),
        ]);
    }

    #[test]
    fn test_str_methods() {
        run_tests(vec![
            ("abcde reg-match 'b.d'", boolean(false)),
            ("abcde reg-match 'a.c'", boolean(true)),
            ("abcde reg-search 'b.d'", boolean(true)),
            ("abcde !reg-search 'x+'", boolean(true)),
            ("abcde reg-match '('", ErrorObject("ValueError")),
            ("a1b22c reg-replace '[0-9]+' _", text("a_b_c")),
            ("a1b22c reg-replace: '[0-9]+' _ 1", text("a_b22c")),
            ("'-' join 'a b c'", text("a-b-c")),
            ("('axbxc' split: x) length", int(3)),
            ("'a b  c' split length", int(3)),
            ("'1 + 2' do", int(3)),
            ("'@ * 2' do: 21", int(42)),
            ("--[10 / 0] do", ErrorObject("ZeroDivisionError")),
            ("'@ + 1' fn do: 41", int(42)),
            ("'@ + 1' fn expression", text("@ + 1")),
        ]);
    }

    #[test]
    fn test_str_instance_methods() {
        run_tests(vec![
            ("GODZILLA lower", text("godzilla")),
            ("GODZILLA startswith GOD", boolean(true)),
            ("'  hi  ' strip", text("hi")),
            ("xxhixx strip: x", text("hi")),
            ("abc center: 7 x", text("xxabcxx")),
            ("abc center 6", text(" abc  ")),
            ("abc ljust: 5 _", text("abc__")),
            ("abc rjust 5", text("  abc")),
            ("a-b-c replace: b x", text("a-x-c")),
            ("banana find n", int(2)),
            ("banana find z", int(-1)),
            ("banana count a", int(3)),
            ("'123' isdigit", boolean(true)),
            ("'12a' isdigit", boolean(false)),
            ("'-7' zfill 4", text("-007")),
            ("'hello world' title", text("Hello World")),
            ("hELLO capitalize", text("Hello")),
        ]);
        let center = str_instance_method("center").unwrap();
        assert_eq!((center.min, center.max), (1, 2));
        assert!(str_instance_method("reg-match").is_none());
    }

    #[test]
    fn test_do_raises_inside_its_body() {
        let mut ctx = InvocationContext::instant(None);
        let result = MessageEngine::new("--[10 / 0] do").run_here(&mut ctx, false).unwrap();
        assert_eq!(result.get_error().unwrap().error, Error::ZeroDivision);
        assert!(!ctx.is_set_raise_error());
        let body = ctx.get_subcontext("0-0").unwrap();
        assert!(body.is_set_raise_error());
        assert_eq!(ctx.invocations().len(), 1);
        assert_eq!(ctx.invocations()[0].exception, Some(Error::ZeroDivision));

        // a failure in the first block keeps the second from running
        let result = MessageEngine::new("'(1 / 0) + (2 non-existent-method)' do")
            .run_here(&mut ctx, false)
            .unwrap();
        assert_eq!(result.get_error().unwrap().error, Error::ZeroDivision);

        ctx.set_flags(InvocationFlags::RAISE_ERROR, FlagScope::Now);
        let err = MessageEngine::new("'1 / 0' do").run_here(&mut ctx, false).unwrap_err();
        assert_eq!(err, Error::ZeroDivision);
    }

    #[test]
    fn test_tuple_methods() {
        run_tests(vec![
            ("'a b c' Tuple first", text("a")),
            ("'a b c' Tuple last", text("c")),
            ("'ab c def' Tuple map '@ length'", Printed("2 1 3")),
            ("'1 2 3 4' Tuple map '@ Int' reduce add", int(10)),
            ("'1 2 3' Tuple map '@ Int' reduce: mul 10", int(60)),
            ("'x y z' Tuple reduce +", text("xyz")),
        ]);

        let mut ctx = InvocationContext::instant(None);
        let empty = ctx.new_object(Value::Tuple(Vec::new()));
        let result = MessageEngine::new("@ reduce add")
            .run(Some(empty.clone()), &mut ctx, false)
            .unwrap();
        assert_eq!(result.get_error().unwrap().error.kind_name(), "ValueError");
        let result = MessageEngine::new("@ first").run(Some(empty), &mut ctx, false).unwrap();
        assert_eq!(result.get_error().unwrap().error.kind_name(), "IndexError");
    }

    #[test]
    fn test_type_methods() {
        run_tests(vec![
            ("Int name", text("Int")),
            ("Int doc", text("Signed 64-bit integer")),
            ("Int methods", Printed("hex oct bin abs")),
        ]);
    }

    fn call(ctx: &mut InvocationContext, typename: &str, method: &str, args: Vec<Object>) -> Value {
        let ty = ctx.get_type(typename).unwrap();
        let method = ty.select_method(method).unwrap().unwrap();
        match method.call(ctx, args).unwrap() {
            Returned::Value(v) => v,
            Returned::Object(o) => o.into_value(),
        }
    }

    #[test]
    fn test_error_and_root_methods() {
        let mut ctx = InvocationContext::instant(None);
        let error = ctx.new_error_object(Error::ZeroDivision, "1 / 0");
        assert_eq!(
            call(&mut ctx, "Error", "error-type", vec![error.clone()]),
            Value::Str("ZeroDivisionError".into())
        );
        assert_eq!(
            call(&mut ctx, "Error", "message", vec![error]),
            Value::Str("ZeroDivisionError: division by zero".into())
        );

        let seven = ctx.new_object(Value::Int(7));
        ctx.push_object("lucky", seven.clone());
        ctx.set_subject(Some(seven));
        let root = ctx.root_object().unwrap();
        assert_eq!(
            call(&mut ctx, "RootObject", "vars", vec![root.clone()]).to_string(),
            "lucky"
        );
        assert_eq!(call(&mut ctx, "RootObject", "subject", vec![root.clone()]), Value::Int(7));
        let types = call(&mut ctx, "RootObject", "types", vec![root]).to_string();
        assert!(types.split(' ').any(|t| t == "ObjectCollection"), "{types}");
    }

    #[test]
    fn test_module_deduces_primitive_types() {
        let module = fundamental_module();
        let cases = vec![
            (Value::None, "None"),
            (Value::Bool(true), "Bool"),
            (Value::Int(1), "Int"),
            (Value::Float(1.0), "Float"),
            (Value::Str(String::new()), "Str"),
            (Value::Tuple(Vec::new()), "Tuple"),
            (Value::Collection(Arc::new(ObjectCollection::new())), "ObjectCollection"),
        ];
        for (value, typename) in cases {
            assert_eq!(module.deduce(&value).name(), typename, "{value:?}");
        }
        assert!(fundamental_type("RootObject").unwrap().get_flags().contains(TypeFlags::NO_INSTANCE_METHOD));
        assert!(fundamental_type("NoSuchType").is_err());
    }
}
