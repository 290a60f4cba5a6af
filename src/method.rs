//! Method descriptors: parameters, result spec, binding flags and the action.
//!
//! Methods are registered explicitly from typed Rust functions:
//!
//! ```text
//! Method::function::<(i64, i64), _>("greater", greater)
//!     .param(MethodParameter::new("right", "Int"))
//!     .returns("Bool")
//! ```

pub mod intooperation;

use crate::Error;
use crate::context::InvocationContext;
use crate::invocation::Returned;
use crate::object::{Object, Value};
use crate::types::TypeDecl;
use bitflags::bitflags;
use intooperation::{IntoOperation, IntoVariadicOperation, OperationFn};
use std::fmt;
use std::sync::Arc;

bitflags! {
    /// What the action needs prepended to its arguments
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodFlags: u32 {
        /// The owning type object comes first
        const TYPE_BOUND = 0x1;
        /// The action receives the invocation context
        const CONTEXT_BOUND = 0x2;
        /// The action posts to the spirit (reached through the context)
        const SPIRIT_BOUND = 0x4;
        /// The last parameter swallows every remaining argument
        const TRAILING_CONSUMER = 0x8;
    }
}

/// Erased action that needs the invocation context
pub type ContextualFn =
    dyn Fn(&mut InvocationContext, Vec<Object>) -> Result<Returned, Error> + Send + Sync;

#[derive(Clone)]
pub enum Action {
    Plain(Arc<OperationFn>),
    Contextual(Arc<ContextualFn>),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Plain(_) => write!(f, "Plain"),
            Action::Contextual(_) => write!(f, "Contextual"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MethodParameter {
    name: String,
    typedecl: TypeDecl,
    doc: String,
    required: bool,
    variable: bool,
    default: Option<Value>,
}

impl MethodParameter {
    /// Required parameter. An unparsable type expression is kept as a plain name.
    pub fn new(name: impl Into<String>, typename: &str) -> Self {
        MethodParameter {
            name: name.into(),
            typedecl: TypeDecl::parse(typename).unwrap_or_else(|_| TypeDecl::new(typename)),
            doc: String::new(),
            required: true,
            variable: false,
            default: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.required = false;
        self.default = Some(value);
        self
    }

    /// Accepts any number of arguments
    pub fn variable(mut self) -> Self {
        self.required = false;
        self.variable = true;
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn typedecl(&self) -> &TypeDecl {
        &self.typedecl
    }

    pub fn typename(&self) -> &str {
        &self.typedecl.name
    }

    pub fn get_doc(&self) -> &str {
        &self.doc
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_variable(&self) -> bool {
        self.variable
    }

    pub fn get_default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn is_type_unspecified(&self) -> bool {
        self.typedecl.is_any()
    }
}

impl fmt::Display for MethodParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.variable {
            write!(f, "*")?;
        }
        write!(f, "{}: {}", self.name, self.typedecl)?;
        if !self.required && !self.variable {
            write!(f, "?")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MethodResult {
    typedecl: TypeDecl,
    return_self: bool,
}

impl MethodResult {
    pub fn new(typename: &str) -> Self {
        MethodResult {
            typedecl: TypeDecl::parse(typename).unwrap_or_else(|_| TypeDecl::new(typename)),
            return_self: false,
        }
    }

    /// Result of any type, boxed with the type deduced from the value
    pub fn any() -> Self {
        MethodResult {
            typedecl: TypeDecl::any(),
            return_self: false,
        }
    }

    pub fn typedecl(&self) -> &TypeDecl {
        &self.typedecl
    }

    /// The receiver is returned instead of the action's value
    pub fn is_return_self(&self) -> bool {
        self.return_self
    }
}

#[derive(Debug, Clone)]
pub struct Method {
    name: String,
    doc: String,
    /// Parameters after the receiver
    params: Vec<MethodParameter>,
    result: MethodResult,
    flags: MethodFlags,
    action: Action,
}

impl Method {
    pub fn new(name: impl Into<String>, action: Action) -> Self {
        Method {
            name: name.into(),
            doc: String::new(),
            params: Vec::new(),
            result: MethodResult::any(),
            flags: MethodFlags::empty(),
            action,
        }
    }

    /// Method backed by a fixed-arity typed function
    pub fn function<Args, F>(name: impl Into<String>, f: F) -> Self
    where
        F: IntoOperation<Args>,
    {
        Self::new(name, Action::Plain(f.into_operation()))
    }

    /// Method backed by a typed function ending in a rest iterator
    pub fn variadic<Args, F>(name: impl Into<String>, f: F) -> Self
    where
        F: IntoVariadicOperation<Args>,
    {
        Self::new(name, Action::Plain(f.into_variadic_operation()))
    }

    /// Method whose action receives the invocation context
    pub fn contextual<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut InvocationContext, Vec<Object>) -> Result<Returned, Error>
            + Send
            + Sync
            + 'static,
    {
        Self::new(name, Action::Contextual(Arc::new(f))).flags(MethodFlags::CONTEXT_BOUND)
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    pub fn param(mut self, param: MethodParameter) -> Self {
        self.params.push(param);
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = MethodParameter>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn returns(mut self, typename: &str) -> Self {
        self.result = MethodResult::new(typename);
        self
    }

    pub fn returns_self(mut self) -> Self {
        self.result.return_self = true;
        self
    }

    pub fn flags(mut self, flags: MethodFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_doc(&self) -> &str {
        &self.doc
    }

    pub fn get_params(&self) -> &[MethodParameter] {
        &self.params
    }

    pub fn get_result(&self) -> &MethodResult {
        &self.result
    }

    pub fn get_flags(&self) -> MethodFlags {
        self.flags
    }

    pub fn is_type_bound(&self) -> bool {
        self.flags.contains(MethodFlags::TYPE_BOUND)
    }

    pub fn is_trailing_consumer(&self) -> bool {
        self.flags.contains(MethodFlags::TRAILING_CONSUMER)
    }

    pub fn min_arity(&self) -> usize {
        self.params
            .iter()
            .filter(|p| p.is_required() && !p.is_variable())
            .count()
    }

    /// `None` when the method accepts any number of arguments
    pub fn max_arity(&self) -> Option<usize> {
        if self.is_trailing_consumer() || self.params.iter().any(MethodParameter::is_variable) {
            None
        } else {
            Some(self.params.len())
        }
    }

    /// Parameter at `index`; consumers and variable parameters repeat the last one
    pub fn get_parameter(&self, index: usize) -> Option<&MethodParameter> {
        if let Some(p) = self.params.get(index) {
            return Some(p);
        }
        let last = self.params.last()?;
        if self.is_trailing_consumer() || last.is_variable() {
            Some(last)
        } else {
            None
        }
    }

    pub fn get_signature(&self) -> String {
        let params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
        format!("({}) -> {}", params.join(", "), self.result.typedecl)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        let needs_context = self
            .flags
            .intersects(MethodFlags::CONTEXT_BOUND | MethodFlags::SPIRIT_BOUND);
        if needs_context && matches!(self.action, Action::Plain(_)) {
            return Err(Error::MethodLoad {
                method: self.name.clone(),
                reason: "context-bound method needs a contextual action".into(),
            });
        }
        if let Some(pos) = self.params.iter().position(MethodParameter::is_variable) {
            if pos + 1 != self.params.len() {
                return Err(Error::MethodLoad {
                    method: self.name.clone(),
                    reason: "variable parameter must come last".into(),
                });
            }
        }
        Ok(())
    }

    /// Append defaults of missing optional parameters. `given` counts the
    /// arguments after the receiver (and type prefix).
    pub(crate) fn default_arguments(&self, given: usize) -> Vec<Value> {
        self.params
            .iter()
            .skip(given)
            .map_while(|p| p.get_default().cloned())
            .collect()
    }

    pub fn call(&self, ctx: &mut InvocationContext, args: Vec<Object>) -> Result<Returned, Error> {
        match &self.action {
            Action::Plain(f) => f(args),
            Action::Contextual(f) => f(ctx, args),
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    fn add(a: i64, b: i64) -> i64 {
        a + b
    }

    fn describe_ctx(_ctx: &mut InvocationContext, args: Vec<Object>) -> Result<Returned, Error> {
        Ok(Returned::from(args.len() as i64))
    }

    #[test]
    fn test_arity_and_parameters() {
        let m = Method::function::<(i64, i64), _>("add", add)
            .param(MethodParameter::new("right", "Int"))
            .param(MethodParameter::new("extra", "Int").with_default(Value::Int(0)))
            .returns("Int");
        assert_eq!(m.min_arity(), 1);
        assert_eq!(m.max_arity(), Some(2));
        assert_eq!(m.get_parameter(0).unwrap().name(), "right");
        assert!(m.get_parameter(2).is_none());
        assert_eq!(m.default_arguments(1), vec![Value::Int(0)]);
        assert!(m.default_arguments(2).is_empty());
        assert_eq!(m.get_signature(), "(right: Int, extra: Int?) -> Int");

        let v = Method::function::<(i64, i64), _>("sum", add)
            .param(MethodParameter::new("values", "Int").variable());
        assert_eq!(v.min_arity(), 0);
        assert_eq!(v.max_arity(), None);
        assert_eq!(v.get_parameter(5).unwrap().name(), "values");
    }

    #[test]
    fn test_validate() {
        let ok = Method::contextual("count", describe_ctx);
        assert!(ok.validate().is_ok());
        assert!(ok.get_flags().contains(MethodFlags::CONTEXT_BOUND));

        let bad = Method::function::<(i64, i64), _>("add", add).flags(MethodFlags::SPIRIT_BOUND);
        assert_eq!(bad.validate().err().unwrap().kind_name(), "MethodLoadError");

        let misplaced = Method::function::<(i64, i64), _>("add", add)
            .param(MethodParameter::new("rest", "Int").variable())
            .param(MethodParameter::new("last", "Int"));
        assert!(misplaced.validate().is_err());
    }
}
