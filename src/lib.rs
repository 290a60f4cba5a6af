//! msgexpr - embedded message-passing expression engine
//!
//! This crate evaluates short textual messages such as `10 * (1 + 2 + 3)` or
//! `@ name == lucky` against a dynamic registry of types and methods. A message
//! is a receiver, a selector and zero or more arguments:
//!
//! ```text
//! 1 add 2 add 3            ; chained messages, evaluated left to right
//! (7 mul 8) add (9 mul 10) ; blocks are evaluated before their consumer
//! GODZILLA slice: 1 -1     ; trailing-argument selector
//! '9786' reg-match [0-9]+  ; type method on Str
//! --/0x32/ Int             ; user quote, then a type constructor
//! ```
//!
//! ## Streaming evaluation
//!
//! Tokens are consumed one at a time. Each token is classified against the
//! innermost pending message, and a message is evaluated the moment its
//! receiver, selector and required arguments are all known. There is no
//! separate AST pass: a later syntax error can surface after earlier
//! sub-expressions already ran.
//!
//! ## Error containment
//!
//! Failures inside an invocation are captured and turned into an `Error`
//! typed object that flows through the rest of the message. Contexts flagged
//! with [`context::InvocationFlags::RAISE_ERROR`] convert the first captured
//! failure back into an `Err` when the expression finishes. Cancellation
//! ([`Interrupted`]) is never captured.
//!
//! ## Modules
//!
//! - `tokenizer`: character and token stages
//! - `message`: the reducer (`MessageEngine`) and message nodes
//! - `selector`: selector-to-invocation resolution
//! - `invocation`: the closed set of invocation variants and their activation records
//! - `types`, `registry`, `method`: the type and method registry
//! - `generic`, `fundamental`: built-in operators and types
//! - `context`: per-evaluation state, flags and execution log
//! - `function`: function values built from message text

use std::fmt;

/// Maximum block nesting accepted by the tokenizer
pub const MAX_PARSE_DEPTH: usize = 32;

/// Maximum nesting of engine runs (sub-contexts) before evaluation is refused
pub const MAX_EVAL_DEPTH: usize = 64;

/// Arity reported when an invocation accepts an unknown number of arguments
pub const MAX_ARITY: usize = 0xFFFF;

/// Categorizes the different kinds of parsing errors.
#[derive(Debug, PartialEq, Clone)]
pub enum ParseErrorKind {
    /// Unexpected character or token (unmatched closing bracket)
    InvalidSyntax,
    /// Input ended while a block was still open
    Incomplete,
    /// Block nesting exceeded the maximum parse depth
    TooDeeplyNested,
}

/// A structured error providing detailed information about a tokenizing failure.
#[derive(Debug, PartialEq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Context snippet from the input showing where the error occurred (max 100 chars)
    pub context: Option<String>,
    /// The problematic token or character encountered, if identifiable
    pub found: Option<String>,
}

impl ParseError {
    /// Create a ParseError with all fields
    pub fn new(
        kind: ParseErrorKind,
        message: impl Into<String>,
        context: Option<String>,
        found: Option<String>,
    ) -> Self {
        ParseError {
            kind,
            message: message.into(),
            context,
            found,
        }
    }

    /// Create a ParseError with context extracted from input at a given char offset
    pub fn with_context(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
    ) -> Self {
        Self::with_context_and_found(kind, message, input, error_offset, None)
    }

    /// Create a ParseError with context and found token
    pub fn with_context_and_found(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
        found: Option<String>,
    ) -> Self {
        const MAX_CONTEXT: usize = 100;

        let context_start = error_offset.saturating_sub(20);
        let context_str: String = input
            .chars()
            .skip(context_start)
            .take(MAX_CONTEXT)
            .collect();

        let mut display_context = String::new();
        if context_start > 0 {
            display_context.push_str("[...]");
        }
        display_context.push_str(&context_str);
        if context_start + context_str.chars().count() < input.chars().count() {
            display_context.push_str("[...]");
        }

        let display_context = display_context.replace('\n', "\\n").replace('\r', "");

        Self::new(kind, message, Some(display_context), found)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(found) = &self.found {
            write!(f, "\nFound: {found}")?;
        }
        if let Some(context) = &self.context {
            write!(f, "\nContext: {context}")?;
        }
        Ok(())
    }
}

/// An error raised outside of any tracked invocation, tagged with the
/// expression that was being evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalMessageError {
    pub error: Error,
    pub expression: String,
}

/// Error taxonomy of the engine
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("SyntaxError: {0}")]
    Syntax(ParseError),
    #[error("BadExpressionError: {0}")]
    BadExpression(String),
    #[error("BadInstanceMethodInvocation: '{type_name}' has no method '{name}'")]
    BadInstanceMethodInvocation { type_name: String, name: String },
    #[error("BadObjectMemberInvocation: no member '{0}'")]
    BadObjectMemberInvocation(String),
    #[error("RedirectUnresolvedInvocation: {0} is used before it was resolved")]
    RedirectUnresolvedInvocation(String),
    #[error("MissingArgumentError: argument '{name}' is missing: {syntax}")]
    MissingArgument { name: String, syntax: String },
    #[error("BadTypename: {0}")]
    BadTypename(String),
    #[error("BadMethodName: {0}")]
    BadMethodName(String),
    #[error("BadObjectBindName: '{0}' cannot be used as an object name")]
    BadObjectBindName(String),
    #[error("MethodLoadError: cannot load '{method}': {reason}")]
    MethodLoad { method: String, reason: String },
    #[error("UnsupportedMethod: '{type_name}' does not support '{method}'")]
    UnsupportedMethod { type_name: String, method: String },
    #[error("ZeroDivisionError: division by zero")]
    ZeroDivision,
    #[error("TypeError: {0}")]
    TypeError(String),
    #[error("ValueError: {0}")]
    ValueError(String),
    #[error("IndexError: {0}")]
    IndexError(String),
    #[error("{}", arity_message(*.expected, *.got, .expression.as_deref()))]
    Arity {
        expected: usize,
        got: usize,
        expression: Option<String>,
    },
    #[error("error while running message [{}]: {}", .0.expression, .0.error)]
    Internal(Box<InternalMessageError>),
    #[error("Interrupted")]
    Interrupted,
}

fn arity_message(expected: usize, got: usize, expression: Option<&str>) -> String {
    match expression {
        Some(expr) => {
            format!("ArityError: expression {expr}: expected {expected} arguments, got {got}")
        }
        None => format!("ArityError: function expected {expected} arguments but got {got}"),
    }
}

impl Error {
    /// Create an Arity error without expression context
    pub fn arity_error(expected: usize, got: usize) -> Self {
        Error::Arity {
            expected,
            got,
            expression: None,
        }
    }

    /// Wrap an error raised outside of an invocation
    pub fn internal(error: Error, expression: impl Into<String>) -> Self {
        Error::Internal(Box::new(InternalMessageError {
            error,
            expression: expression.into(),
        }))
    }

    /// The error with any `Internal` wrapping removed
    pub fn root(&self) -> &Error {
        match self {
            Error::Internal(inner) => inner.error.root(),
            other => other,
        }
    }

    /// Stable kind name, reported through `Internal` wrappers
    pub fn kind_name(&self) -> &'static str {
        match self.root() {
            Error::Syntax(_) => "SyntaxError",
            Error::BadExpression(_) => "BadExpressionError",
            Error::BadInstanceMethodInvocation { .. } => "BadInstanceMethodInvocation",
            Error::BadObjectMemberInvocation(_) => "BadObjectMemberInvocation",
            Error::RedirectUnresolvedInvocation(_) => "RedirectUnresolvedInvocation",
            Error::MissingArgument { .. } => "MissingArgumentError",
            Error::BadTypename(_) => "BadTypename",
            Error::BadMethodName(_) => "BadMethodName",
            Error::BadObjectBindName(_) => "BadObjectBindName",
            Error::MethodLoad { .. } => "MethodLoadError",
            Error::UnsupportedMethod { .. } => "UnsupportedMethod",
            Error::ZeroDivision => "ZeroDivisionError",
            Error::TypeError(_) => "TypeError",
            Error::ValueError(_) => "ValueError",
            Error::IndexError(_) => "IndexError",
            Error::Arity { .. } => "ArityError",
            Error::Interrupted => "Interrupted",
            Error::Internal(_) => "InternalMessageError",
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}

/// Cooperative cancellation signal. Never captured by error containment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Interrupted")]
pub struct Interrupted;

impl From<Interrupted> for Error {
    fn from(_: Interrupted) -> Self {
        Error::Interrupted
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::Syntax(e)
    }
}

pub mod context;
pub mod function;
pub mod fundamental;
pub mod generic;
pub mod invocation;
pub mod literal;
pub mod message;
pub mod method;
pub mod object;
pub mod registry;
pub mod selector;
pub mod tokenizer;
pub mod types;

pub use context::{FlagScope, InvocationContext, InvocationFlags, Spirit, TempSpirit};
pub use function::{
    FunctionExpr, SequentialFunction, parse_function, parse_sequential_function, run_function,
    run_function_print_step,
};
pub use message::MessageEngine;
pub use object::{Object, ObjectCollection, Value};
pub use registry::TypeModule;
pub use types::{Type, TypeRef};
