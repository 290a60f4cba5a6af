//! Function values built from message text.
//!
//! `Int :: @ add 1` is a message function whose result is converted to `Int`.
//! A single-term body such as `length` is a selector function: the selector is
//! applied to the subject directly, without running the reducer.

use crate::context::{FlagScope, InvocationContext, InvocationFlags};
use crate::message::{MessageEngine, start_subcontext};
use crate::object::{Object, Value};
use crate::selector::{AffixedSelector, select_method};
use crate::types::{TypeDecl, construct_instance};
use crate::Error;
use std::sync::Arc;

const TYPE_INDICATOR: &str = "::";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Body is a message expression run by the reducer
    Message,
    /// Body is a single selector applied to the subject
    Selector,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionExpr {
    source: String,
    body: String,
    kind: FunctionKind,
    result_type: Option<TypeDecl>,
}

fn split_type_indicator(expr: &str) -> (Option<&str>, &str) {
    if let Some((head, rest)) = expr.split_once(char::is_whitespace) {
        if let Some(body) = rest.trim_start().strip_prefix(TYPE_INDICATOR) {
            if body.starts_with(char::is_whitespace) && !body.trim().is_empty() {
                return (Some(head), body.trim());
            }
        }
    }
    (None, expr)
}

/// Parse `[Type ::] body` into a function
pub fn parse_function(expression: &str) -> Result<FunctionExpr, Error> {
    let source = expression.trim();
    let (typename, body) = split_type_indicator(source);
    let result_type = typename.map(TypeDecl::parse).transpose()?;
    let kind = match body.split_whitespace().count() {
        0 => return Err(Error::ValueError("empty function expression".into())),
        1 => FunctionKind::Selector,
        _ => FunctionKind::Message,
    };
    Ok(FunctionExpr {
        source: source.to_string(),
        body: body.to_string(),
        kind,
        result_type,
    })
}

impl FunctionExpr {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    pub fn get_type_conversion(&self) -> Option<&TypeDecl> {
        self.result_type.as_ref()
    }

    /// Run in a fork whose subject is `subject`; the fork is kept in the
    /// caller's log.
    pub fn run(&self, subject: Object, ctx: &mut InvocationContext) -> Result<Object, Error> {
        let mut child = start_subcontext(ctx, subject)?;
        let result = self.run_here(&mut child);
        ctx.add_subcontext(child);
        result
    }

    /// Run against the context's current subject
    pub fn run_here(&self, ctx: &mut InvocationContext) -> Result<Object, Error> {
        let result = match self.kind {
            FunctionKind::Message => MessageEngine::new(&self.body).run_here(ctx, false)?,
            FunctionKind::Selector => self.run_selector(ctx)?,
        };
        self.convert_result(ctx, result)
    }

    fn run_selector(&self, ctx: &mut InvocationContext) -> Result<Object, Error> {
        let subject = ctx
            .subject_object()
            .cloned()
            .ok_or_else(|| Error::BadExpression(format!("'{}' needs a subject", self.body)))?;
        let selector = AffixedSelector::parse(&self.body);
        let prepared = select_method(ctx, selector.name(), Some(&subject), selector.modifiers())
            .and_then(|inv| inv.prepare_invoke(ctx, vec![subject]));
        match prepared {
            Ok(mut entry) => {
                entry.set_message(self.body.as_str());
                let index = ctx.begin_invocation();
                let result = entry.invoke(ctx)?;
                let failure = entry.exception.clone();
                ctx.finish_invocation(index, entry);
                match failure {
                    Some(e) if ctx.is_set_raise_error() => Err(e),
                    _ => Ok(result),
                }
            }
            Err(e) if e.is_interrupted() || ctx.is_set_raise_error() => Err(e),
            Err(e) => Ok(ctx.new_error_object(e, &self.body)),
        }
    }

    fn convert_result(&self, ctx: &mut InvocationContext, result: Object) -> Result<Object, Error> {
        match &self.result_type {
            Some(decl) if !result.is_error() => {
                let instance = decl.instantiate(ctx.type_module())?;
                construct_instance(&instance, ctx, result, &[])
            }
            _ => Ok(result),
        }
    }
}

/// One function run many times in a single sequential context.
///
/// The context reuses one invocation slot and raises errors instead of
/// containing them. Message functions keep their reducer between runs, so
/// after the first complete run the built messages are replayed.
#[derive(Debug)]
pub struct SequentialFunction {
    function: Arc<FunctionExpr>,
    context: InvocationContext,
    engine: MessageEngine,
    cache: bool,
}

impl SequentialFunction {
    pub fn new(function: Arc<FunctionExpr>, parent: &InvocationContext) -> Self {
        let engine = MessageEngine::new(function.body());
        SequentialFunction {
            function,
            context: parent.inherit_sequential(),
            engine,
            cache: true,
        }
    }

    pub fn function(&self) -> &FunctionExpr {
        &self.function
    }

    pub fn context(&self) -> &InvocationContext {
        &self.context
    }

    /// Rebuild messages from tokens on every run
    pub fn disable_cache(&mut self) {
        self.cache = false;
    }

    pub fn run(&mut self, subject: Object) -> Result<Object, Error> {
        self.context.set_subject(Some(subject));
        self.context.pop_exception();
        let result = match self.function.kind() {
            FunctionKind::Message => self.engine.run_here(&mut self.context, self.cache)?,
            FunctionKind::Selector => self.function.run_selector(&mut self.context)?,
        };
        self.function.convert_result(&mut self.context, result)
    }

    /// Run on a bare value and return a bare value
    pub fn call(&mut self, value: Value) -> Result<Value, Error> {
        let subject = self.context.new_object(value);
        Ok(self.run(subject)?.into_value())
    }
}

pub fn parse_sequential_function(
    expression: &str,
    ctx: &InvocationContext,
) -> Result<SequentialFunction, Error> {
    let function = parse_function(expression)?;
    Ok(SequentialFunction::new(Arc::new(function), ctx))
}

/// Evaluate `expression`, in a fork with `subject` when one is given
pub fn run_function(
    expression: &str,
    subject: Option<Object>,
    ctx: &mut InvocationContext,
    raise_error: bool,
) -> Result<Object, Error> {
    if raise_error {
        ctx.set_flags(InvocationFlags::RAISE_ERROR, FlagScope::InheritSet);
    }
    MessageEngine::new(expression).run_function(subject, ctx)
}

/// [`run_function`] that posts each message to the spirit before it runs
pub fn run_function_print_step(
    expression: &str,
    subject: Option<Object>,
    ctx: &mut InvocationContext,
    raise_error: bool,
) -> Result<Object, Error> {
    ctx.set_flags(InvocationFlags::PRINT_STEP, FlagScope::Now);
    run_function(expression, subject, ctx, raise_error)
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::context::TempSpirit;

    #[test]
    fn test_parse_function() {
        let cases: Vec<(&str, &str, FunctionKind, Option<&str>)> = vec![
            ("length", "length", FunctionKind::Selector, None),
            ("  @ add 1 ", "@ add 1", FunctionKind::Message, None),
            ("Int :: @ add 1", "@ add 1", FunctionKind::Message, Some("Int")),
            ("Str :: upper", "upper", FunctionKind::Selector, Some("Str")),
            // indicator without a body is kept as the body
            ("Int ::", "Int ::", FunctionKind::Message, None),
            ("a::b c", "a::b c", FunctionKind::Message, None),
        ];
        for (expr, body, kind, typename) in cases {
            let f = parse_function(expr).unwrap();
            assert_eq!(f.body(), body, "{expr:?}");
            assert_eq!(f.kind(), kind, "{expr:?}");
            assert_eq!(
                f.get_type_conversion().map(|t| t.name.as_str()),
                typename,
                "{expr:?}"
            );
        }
        assert_eq!(parse_function("   ").err().unwrap().kind_name(), "ValueError");
    }

    #[test]
    fn test_run_selector_and_message_functions() {
        let mut ctx = InvocationContext::instant(None);
        let subject = ctx.new_object(Value::Str("GODZILLA".into()));

        let length = parse_function("length").unwrap();
        let result = length.run(subject.clone(), &mut ctx).unwrap();
        assert_eq!(result.value(), &Value::Int(8));

        let sliced = parse_function("@ slice: 1 -1").unwrap();
        let result = sliced.run(subject.clone(), &mut ctx).unwrap();
        assert_eq!(result.value(), &Value::Str("ODZILL".into()));

        let typed = parse_function("Float :: @ length").unwrap();
        let result = typed.run(subject, &mut ctx).unwrap();
        assert_eq!(result.get_typename(), "Float");
        assert_eq!(result.value(), &Value::Float(8.0));

        // every run left a fork in the log
        assert_eq!(ctx.get_subcontext_list().len(), 3);
    }

    #[test]
    fn test_selector_function_failure_is_an_object() {
        let mut ctx = InvocationContext::instant(None);
        let subject = ctx.new_object(Value::Int(3));
        let f = parse_function("non-existent-method").unwrap();
        let result = f.run(subject, &mut ctx).unwrap();
        assert_eq!(
            result.get_error().unwrap().error.kind_name(),
            "BadInstanceMethodInvocation"
        );
    }

    #[test]
    fn test_sequential_function_reuses_slot() {
        let ctx = InvocationContext::instant(None);
        let mut f = parse_sequential_function("@ * 2", &ctx).unwrap();
        let doubled: Vec<Value> = (1..=4).map(|n| f.call(Value::Int(n)).unwrap()).collect();
        assert_eq!(
            doubled,
            vec![Value::Int(2), Value::Int(4), Value::Int(6), Value::Int(8)]
        );
        assert_eq!(f.context().invocations().len(), 1);

        let mut div = parse_sequential_function("10 / @", &ctx).unwrap();
        assert_eq!(div.call(Value::Int(4)).unwrap(), Value::Float(2.5));
        assert_eq!(div.call(Value::Int(0)).err().unwrap(), Error::ZeroDivision);
        assert_eq!(div.call(Value::Int(5)).unwrap(), Value::Float(2.0));
    }

    #[test]
    fn test_run_function_raise_and_print_step() {
        let mut ctx = InvocationContext::instant(None);
        let result = run_function("1 / 0", None, &mut ctx, false).unwrap();
        assert!(result.is_error());

        let subject = ctx.new_object(Value::Int(0));
        let err = run_function("1 / @", Some(subject), &mut ctx, true).err().unwrap();
        assert_eq!(err.kind_name(), "ZeroDivisionError");

        let spirit = Arc::new(TempSpirit::new());
        let mut ctx = InvocationContext::builder().spirit(spirit.clone()).build();
        let subject = ctx.new_object(Value::Int(2));
        let result = run_function_print_step("@ + 1 * 3", Some(subject), &mut ctx, false).unwrap();
        assert_eq!(result.value(), &Value::Int(9));
        assert_eq!(spirit.messages(), vec!["@ + 1".to_string(), "* 3".to_string()]);
    }
}
