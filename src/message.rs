//! The reducer.
//!
//! [`MessageEngine`] pulls tokens from a [`TokenStream`] one at a time,
//! compiles each into a small [`Code`] (argument builders plus structural
//! operations), and applies it to a stack of pending [`Message`]s. After every
//! token the innermost messages that became complete are evaluated at once and
//! their results pushed onto the [`LocalStack`], where enclosing messages pick
//! them up through [`ValueRef`]s.

use crate::context::{InvocationContext, LogEntry};
use crate::generic::resolve_generic_method;
use crate::invocation::{Invocation, Modifiers};
use crate::method::MethodParameter;
use crate::object::{Object, Value};
use crate::selector::{
    AffixedSelector, select_literal, select_method, select_method_by_object, select_type,
};
use crate::tokenizer::{SIGIL_DISCARD_MESSAGE, SIGIL_END_TRAILING_ARGS, Token, TokenKind, TokenStream};
use crate::types::construct_instance;
use crate::{Error, Interrupted, MAX_EVAL_DEPTH};
use std::fmt;
use std::sync::Arc;

const SIGIL_OBJECT_ID: char = '@';
const SIGIL_SUBJECT_MEMBER: char = '/';
const SIGIL_ROOT_MEMBER: char = '#';
const SIGIL_PREVIOUS: char = '-';
const INSTANCE_SELECTOR: &str = "instance:";

//
// Result stack
//

/// Results of completed messages, waiting for their consumer
#[derive(Debug, Default)]
pub struct LocalStack {
    objects: Vec<Object>,
}

impl LocalStack {
    pub fn push(&mut self, object: Object) {
        self.objects.push(object);
    }

    pub fn pop(&mut self) -> Option<Object> {
        self.objects.pop()
    }

    pub fn last(&self) -> Option<&Object> {
        self.objects.last()
    }

    pub fn count(&self) -> usize {
        self.objects.len()
    }

    pub fn clear(&mut self) -> Vec<Object> {
        std::mem::take(&mut self.objects)
    }
}

//
// Message elements
//

/// Where a reference takes its object from
#[derive(Debug, Clone, PartialEq)]
pub enum RefTarget {
    /// Top of the result stack, popped on first use
    ResultStack,
    /// The context subject (`@`)
    Subject,
    /// A bound object (`@name`)
    Named(String),
    /// The n-th most recently bound object (`@-n`)
    Previous(usize),
    /// The root object of the running context (`@#`)
    Root,
}

/// A message element: a ready object, or a reference picked when first needed
#[derive(Debug, Clone)]
pub enum ValueRef {
    Object(Object),
    Ref {
        target: RefTarget,
        last: Option<Object>,
    },
}

impl ValueRef {
    fn reference(target: RefTarget) -> Self {
        ValueRef::Ref { target, last: None }
    }

    fn stack() -> Self {
        Self::reference(RefTarget::ResultStack)
    }

    /// A stack reference that has not yet taken its object
    fn is_pending(&self) -> bool {
        matches!(
            self,
            ValueRef::Ref {
                target: RefTarget::ResultStack,
                last: None
            }
        )
    }

    /// Resolve the reference; the object is kept until [`ValueRef::reset`]
    pub fn pick(&mut self, ctx: &InvocationContext, locals: &mut LocalStack) -> Result<Object, Error> {
        let (target, last) = match self {
            ValueRef::Object(object) => return Ok(object.clone()),
            ValueRef::Ref { target, last } => (target, last),
        };
        if let Some(object) = last {
            return Ok(object.clone());
        }
        let object = match target {
            RefTarget::ResultStack => locals.pop().ok_or_else(|| {
                Error::BadExpression("a result was referenced but the result stack is empty".into())
            })?,
            RefTarget::Subject => ctx.subject_object().cloned().ok_or_else(|| {
                Error::BadExpression("the subject was referenced but none is given".into())
            })?,
            RefTarget::Named(name) => ctx
                .get_object(name)
                .cloned()
                .ok_or_else(|| Error::BadExpression(format!("object '{name}' does not exist")))?,
            RefTarget::Previous(n) => ctx.get_previous_object(*n).cloned().ok_or_else(|| {
                Error::BadExpression(format!("no object is bound {n} place(s) back"))
            })?,
            RefTarget::Root => ctx.root_object()?,
        };
        *last = Some(object.clone());
        Ok(object)
    }

    pub fn reset(&mut self) {
        if let ValueRef::Ref { last, .. } = self {
            *last = None;
        }
    }
}

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueRef::Object(o) => write!(f, "<{} {}>", o.get_typename(), o.value()),
            ValueRef::Ref { target, last } => match last {
                Some(o) => write!(f, "<{target:?}: {}>", o.value()),
                None => write!(f, "<{target:?}>"),
            },
        }
    }
}

#[derive(Debug, Clone)]
enum Element {
    Value(ValueRef),
    Selector(AffixedSelector),
}

#[derive(Debug, Clone)]
enum SelectorSource {
    Name(AffixedSelector),
    /// Selector given by an object, usually the result of a block
    Ref(ValueRef),
    Fixed(Invocation),
}

#[derive(Debug, Clone)]
struct Selector {
    source: SelectorSource,
    resolved: Option<Invocation>,
}

impl Selector {
    fn new(source: SelectorSource) -> Self {
        Selector {
            source,
            resolved: None,
        }
    }

    fn fixed(invocation: Invocation) -> Self {
        Selector {
            resolved: Some(invocation.clone()),
            source: SelectorSource::Fixed(invocation),
        }
    }
}

fn identity_invocation() -> Result<Invocation, Error> {
    let method = resolve_generic_method("identical")?
        .ok_or_else(|| Error::BadMethodName("identical".into()))?;
    Ok(Invocation::Function {
        method,
        modifiers: Modifiers::empty(),
    })
}

/// What the innermost pending message still needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Nothing,
    Receiver,
    Selector,
    Argument,
}

//
// Message
//

/// One receiver, selector and arguments node, complete or pending
#[derive(Debug, Clone, Default)]
pub struct Message {
    receiver: Option<ValueRef>,
    selector: Option<Selector>,
    args: Vec<ValueRef>,
    selector_mods: Modifiers,
    concluded: bool,
}

impl Message {
    fn from_elements(elements: Vec<Element>) -> Result<Self, Error> {
        let mut message = Message::default();
        message.add_elements(elements, Expect::Receiver)?;
        Ok(message)
    }

    fn add_elements(&mut self, elements: Vec<Element>, start: Expect) -> Result<(), Error> {
        let mut slot = match start {
            Expect::Nothing | Expect::Receiver => 0,
            Expect::Selector => 1,
            Expect::Argument => 2,
        };
        for element in elements {
            match (slot, element) {
                (0, Element::Value(r)) => self.receiver = Some(r),
                (1, Element::Value(r)) => self.selector = Some(Selector::new(SelectorSource::Ref(r))),
                (1, Element::Selector(s)) => {
                    self.selector = Some(Selector::new(SelectorSource::Name(s)));
                }
                (_, Element::Value(r)) => self.args.push(r),
                (_, Element::Selector(s)) => {
                    return Err(Error::BadExpression(format!(
                        "selector '{s}' is out of place in {self}"
                    )));
                }
            }
            slot += 1;
        }
        Ok(())
    }

    pub fn is_receiver_specified(&self) -> bool {
        self.receiver.is_some()
    }

    pub fn is_selector_specified(&self) -> bool {
        self.selector.as_ref().is_some_and(|s| s.resolved.is_some())
    }

    pub fn is_concluded(&self) -> bool {
        self.concluded
    }

    fn invocation(&self) -> Result<&Invocation, Error> {
        self.selector
            .as_ref()
            .and_then(|s| s.resolved.as_ref())
            .ok_or_else(|| Error::BadExpression(format!("selector is not resolved: {self}")))
    }

    fn set_selector_modifier(&mut self, modifier: Modifiers) {
        self.selector_mods |= modifier;
        if let Some(invocation) = self.selector.as_mut().and_then(|s| s.resolved.as_mut()) {
            invocation.add_modifiers(modifier);
        }
    }

    fn next_parameter_spec(&self) -> Result<Option<MethodParameter>, Error> {
        self.invocation()?.get_parameter_spec(self.args.len())
    }

    fn pending_ref_count(&self) -> usize {
        let selector_ref = match self.selector.as_ref().map(|s| &s.source) {
            Some(SelectorSource::Ref(r)) => r.is_pending(),
            _ => false,
        };
        self.receiver.iter().chain(&self.args).filter(|r| r.is_pending()).count()
            + usize::from(selector_ref)
    }

    /// Turn the selector into an invocation. Returns false while the receiver
    /// or selector is still missing from the result stack.
    fn resolve_selector(
        &mut self,
        ctx: &InvocationContext,
        locals: &mut LocalStack,
    ) -> Result<bool, Error> {
        let (Some(receiver), Some(selector)) = (self.receiver.as_mut(), self.selector.as_mut())
        else {
            return Ok(false);
        };
        if selector.resolved.is_some() {
            return Ok(true);
        }
        let selector_pending = matches!(&selector.source, SelectorSource::Ref(r) if r.is_pending());
        if locals.count() < usize::from(receiver.is_pending()) + usize::from(selector_pending) {
            return Ok(false);
        }
        let mut invocation = match &mut selector.source {
            SelectorSource::Fixed(invocation) => invocation.clone(),
            SelectorSource::Ref(r) => {
                // the selector block was opened last, so its result is on top
                let by = r.pick(ctx, locals)?;
                let object = receiver.pick(ctx, locals)?;
                select_method_by_object(ctx, &by, Some(&object), Modifiers::empty())?
            }
            SelectorSource::Name(name) => {
                let object = receiver.pick(ctx, locals)?;
                select_method(ctx, name.name(), Some(&object), name.modifiers())?
            }
        };
        invocation.add_modifiers(self.selector_mods);
        selector.resolved = Some(invocation);
        Ok(true)
    }

    /// True once receiver, selector and enough arguments are present
    pub fn check_concluded(
        &mut self,
        ctx: &InvocationContext,
        locals: &mut LocalStack,
    ) -> Result<bool, Error> {
        if self.concluded {
            return Ok(true);
        }
        if locals.count() < self.pending_ref_count() || self.receiver.is_none() {
            return Ok(false);
        }
        if !self.resolve_selector(ctx, locals)? {
            return Ok(false);
        }
        let invocation = self.invocation()?;
        let trailing = invocation
            .modifiers()
            .intersects(Modifiers::TRAILING_ARGS | Modifiers::CONSUME_ARGS);
        let needed = if trailing {
            invocation.get_max_arity()?
        } else {
            invocation.get_min_arity()?
        };
        if self.args.len() < needed {
            return Ok(false);
        }
        self.concluded = true;
        Ok(true)
    }

    /// Close the message at a block end: a missing selector becomes identity,
    /// and a selector given no arguments at all is returned as an object.
    pub fn conclude(&mut self, ctx: &InvocationContext, locals: &mut LocalStack) -> Result<(), Error> {
        if self.receiver.is_none() {
            return Err(Error::BadExpression(format!("message has no receiver: {self}")));
        }
        if self.selector.is_none() {
            self.selector = Some(Selector::fixed(identity_invocation()?));
        }
        if self.resolve_selector(ctx, locals)? {
            let invocation = self.invocation()?;
            let min = invocation.get_min_arity()?;
            if self.args.len() < min {
                if !self.args.is_empty() {
                    let name = invocation
                        .get_parameter_spec(self.args.len())?
                        .map_or_else(|| format!("param{}", self.args.len()), |p| p.name().to_string());
                    return Err(Error::MissingArgument {
                        name,
                        syntax: invocation.display_name(),
                    });
                }
                self.as_selector_returner(ctx, locals)?;
            }
        }
        self.concluded = true;
        Ok(())
    }

    /// Make the message return its own invocation instead of running it
    fn as_selector_returner(&mut self, ctx: &InvocationContext, locals: &mut LocalStack) -> Result<(), Error> {
        if !self.resolve_selector(ctx, locals)? {
            return Err(Error::BadExpression(format!(
                "message has no receiver or selector: {self}"
            )));
        }
        let invocation = self.invocation()?.clone();
        let object = ctx.new_object(Value::Invocation(Arc::new(invocation)));
        self.receiver = Some(ValueRef::Object(object));
        self.selector = Some(Selector::fixed(identity_invocation()?));
        self.args.clear();
        Ok(())
    }

    /// Drop objects picked in a previous run so the message can be replayed
    pub fn reset(&mut self) {
        for r in self.receiver.iter_mut().chain(self.args.iter_mut()) {
            r.reset();
        }
        if let Some(selector) = self.selector.as_mut() {
            match &mut selector.source {
                SelectorSource::Fixed(invocation) => selector.resolved = Some(invocation.clone()),
                SelectorSource::Ref(r) => {
                    r.reset();
                    selector.resolved = None;
                }
                SelectorSource::Name(_) => selector.resolved = None,
            }
        }
    }

    /// Run the message. Returns the result and whether the invocation failed.
    pub fn eval(
        &mut self,
        ctx: &mut InvocationContext,
        locals: &mut LocalStack,
        text: &str,
    ) -> Result<(Object, bool), Error> {
        // arguments were pushed after the receiver, so they come off first
        let mut objects = Vec::with_capacity(self.args.len() + 1);
        for arg in self.args.iter_mut().rev() {
            objects.push(arg.pick(ctx, locals)?);
        }
        if !self.resolve_selector(ctx, locals)? {
            return Err(Error::BadExpression(format!(
                "message has no receiver or selector: {self}"
            )));
        }
        let receiver = self
            .receiver
            .as_mut()
            .ok_or_else(|| Error::BadExpression("message has no receiver".into()))?
            .pick(ctx, locals)?;
        objects.push(receiver);
        objects.reverse();

        let invocation = self.invocation()?;
        tracing::debug!(message = text, invocation = %invocation.display_name(), "eval message");
        let mut entry = invocation.prepare_invoke(ctx, objects)?;
        entry.set_message(text);
        let index = ctx.begin_invocation();
        let result = entry.invoke(ctx)?;
        let failed = entry.is_failed();
        ctx.finish_invocation(index, entry);
        Ok((result, failed))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        match &self.receiver {
            Some(r) => write!(f, "{r}")?,
            None => write!(f, "<no receiver>")?,
        }
        match &self.selector {
            Some(Selector {
                resolved: Some(inv),
                ..
            }) => write!(f, " {}", inv.display_name())?,
            Some(Selector { source, .. }) => match source {
                SelectorSource::Name(s) => write!(f, " <selector {s}>")?,
                SelectorSource::Ref(r) => write!(f, " {r}")?,
                SelectorSource::Fixed(inv) => write!(f, " {}", inv.display_name())?,
            },
            None => write!(f, " <no selector>")?,
        }
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        write!(f, ")")
    }
}

//
// Compiled code
//

#[derive(Debug, Clone)]
enum ArgCode {
    RefName(String),
    RefPrevious(usize),
    Str(String),
    Type(String),
    Tuple(String),
    Literal(String),
    TypedValue(String, MethodParameter),
    ReceiverValue(String),
    Selector(AffixedSelector),
    StackRef,
    SubjectMember(Option<String>),
    RootMember(Option<String>),
}

impl ArgCode {
    fn build(&self, ctx: &mut InvocationContext, out: &mut Vec<Element>) -> Result<(), Error> {
        let object = |o: Object| Element::Value(ValueRef::Object(o));
        match self {
            ArgCode::RefName(name) => {
                out.push(Element::Value(ValueRef::reference(RefTarget::Named(name.clone()))));
            }
            ArgCode::RefPrevious(n) => {
                out.push(Element::Value(ValueRef::reference(RefTarget::Previous(*n))));
            }
            ArgCode::Str(text) => out.push(object(ctx.new_object(Value::Str(text.clone())))),
            ArgCode::Type(expr) => {
                let ty = select_type(ctx, expr).ok_or_else(|| Error::BadTypename(expr.clone()))?;
                out.push(object(ty));
            }
            ArgCode::Tuple(text) => {
                let items = text
                    .split_whitespace()
                    .map(|s| ctx.new_object(Value::Str(s.to_string())))
                    .collect();
                out.push(object(ctx.new_object_of(Value::Tuple(items), "Tuple")?));
            }
            ArgCode::Literal(text) => out.push(object(select_literal(ctx, text))),
            ArgCode::TypedValue(text, spec) => {
                let instance = spec.typedecl().instantiate(ctx.type_module())?;
                let source = ctx.new_object(Value::Str(text.clone()));
                out.push(object(construct_instance(&instance, ctx, source, &[])?));
            }
            ArgCode::ReceiverValue(text) => {
                if text.starts_with(char::is_uppercase) {
                    if let Some(typename) = text.strip_suffix(':') {
                        if let Some(ty) = select_type(ctx, typename) {
                            out.push(object(ty));
                            out.push(Element::Selector(AffixedSelector::parse(INSTANCE_SELECTOR)));
                            return Ok(());
                        }
                    } else if let Some(ty) = select_type(ctx, text) {
                        out.push(object(ty));
                        return Ok(());
                    }
                }
                out.push(object(select_literal(ctx, text)));
            }
            ArgCode::Selector(selector) => out.push(Element::Selector(selector.clone())),
            ArgCode::StackRef => out.push(Element::Value(ValueRef::stack())),
            ArgCode::SubjectMember(member) => {
                out.push(Element::Value(ValueRef::reference(RefTarget::Subject)));
                if let Some(member) = member {
                    out.push(Element::Selector(AffixedSelector::parse(member)));
                }
            }
            ArgCode::RootMember(member) => {
                out.push(Element::Value(ValueRef::reference(RefTarget::Root)));
                if let Some(member) = member {
                    out.push(Element::Selector(AffixedSelector::parse(member)));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for ArgCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgCode::RefName(n) => write!(f, "ref-name({n})"),
            ArgCode::RefPrevious(n) => write!(f, "ref-previous({n})"),
            ArgCode::Str(s) => write!(f, "string({s})"),
            ArgCode::Type(s) => write!(f, "type({s})"),
            ArgCode::Tuple(s) => write!(f, "tuple({s})"),
            ArgCode::Literal(s) => write!(f, "literal({s})"),
            ArgCode::TypedValue(s, p) => write!(f, "typed-value({s},{})", p.typename()),
            ArgCode::ReceiverValue(s) => write!(f, "receiver-value({s})"),
            ArgCode::Selector(s) => write!(f, "selector({s})"),
            ArgCode::StackRef => write!(f, "stack-ref()"),
            ArgCode::SubjectMember(m) => write!(f, "subject-member({})", m.as_deref().unwrap_or("")),
            ArgCode::RootMember(m) => write!(f, "root-member({})", m.as_deref().unwrap_or("")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum AstCode {
    AddElementToLast(Expect),
    AddElementAsNewMessage(Expect),
    AddNewMessage,
    AddTwinNewMessage,
    SetAsSelectorReturner,
    ModifyNextBlockSelector(String),
    Discard,
    PushBlock,
    PopBlock,
    PopAll,
}

impl AstCode {
    /// Adders run first, block operations last
    fn rank(&self) -> u8 {
        match self {
            AstCode::AddElementToLast(_)
            | AstCode::AddElementAsNewMessage(_)
            | AstCode::AddNewMessage
            | AstCode::AddTwinNewMessage => 0,
            AstCode::SetAsSelectorReturner
            | AstCode::ModifyNextBlockSelector(_)
            | AstCode::Discard => 1,
            AstCode::PushBlock | AstCode::PopBlock | AstCode::PopAll => 2,
        }
    }
}

/// Instructions compiled from one token
#[derive(Debug, Default)]
pub struct Code {
    args: Vec<ArgCode>,
    ops: Vec<AstCode>,
}

impl Code {
    fn arg(&mut self, code: ArgCode) {
        self.args.push(code);
    }

    fn op(&mut self, code: AstCode) {
        self.ops.push(code);
        self.ops.sort_by_key(AstCode::rank);
    }

    fn add_selector(&mut self, token: &str) {
        let selector = AffixedSelector::parse(token);
        if selector.has(Modifiers::SHOW_HELP) {
            self.op(AstCode::SetAsSelectorReturner);
        }
        self.arg(ArgCode::Selector(selector));
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ops: Vec<String> = self.ops.iter().map(|op| format!("{op:?}")).collect();
        write!(f, "{}", ops.join(" "))?;
        if !self.args.is_empty() {
            let args: Vec<String> = self.args.iter().map(ToString::to_string).collect();
            write!(f, " | {}", args.join(", "))?;
        }
        Ok(())
    }
}

//
// Engine
//

/// Progress reported by [`MessageEngine::run_step`]
#[derive(Debug)]
pub enum Step<'a> {
    /// Source text of the message about to run
    Message(&'a str),
    /// Final result of the expression
    Result(&'a Object),
}

#[derive(Debug, Clone)]
struct CachedMessage {
    text: String,
    read: usize,
    message: Message,
}

/// Streaming reducer over one expression.
///
/// The messages built by a complete, successful run are kept; a later run
/// with `cache` set replays them without reading the tokens again.
#[derive(Debug)]
pub struct MessageEngine {
    source: String,
    readings: Vec<Message>,
    blocks: Vec<usize>,
    locals: LocalStack,
    cache: Vec<CachedMessage>,
    last_read: usize,
    read: usize,
    failed: bool,
    next_firstterm: bool,
}

/// Fork `ctx` for a nested run over `subject`
pub(crate) fn start_subcontext(
    ctx: &mut InvocationContext,
    subject: Object,
) -> Result<InvocationContext, Error> {
    fork(ctx, Some(subject))
}

pub(crate) fn fork(ctx: &InvocationContext, subject: Option<Object>) -> Result<InvocationContext, Error> {
    if ctx.get_depth() >= MAX_EVAL_DEPTH {
        return Err(Error::ValueError(format!(
            "evaluation nested deeper than {MAX_EVAL_DEPTH}"
        )));
    }
    Ok(ctx.inherit(subject))
}

fn byte_offset(source: &str, chars: usize) -> usize {
    source
        .char_indices()
        .nth(chars)
        .map_or(source.len(), |(i, _)| i)
}

type StepFn<'f> = dyn FnMut(Step<'_>) -> Result<(), Interrupted> + 'f;

impl MessageEngine {
    pub fn new(expression: &str) -> Self {
        MessageEngine {
            source: expression.to_string(),
            readings: Vec::new(),
            blocks: Vec::new(),
            locals: LocalStack::default(),
            cache: Vec::new(),
            last_read: 0,
            read: 0,
            failed: false,
            next_firstterm: false,
        }
    }

    pub fn get_expression(&self) -> &str {
        &self.source
    }

    /// True when a previous run left messages to replay
    pub fn is_cached(&self) -> bool {
        !self.cache.is_empty()
    }

    fn current_reading(&self) -> Option<&Message> {
        let last = self.readings.len().checked_sub(1)?;
        if self.blocks.last().is_some_and(|top| last < *top) {
            return None;
        }
        self.readings.last()
    }

    fn compile_code(&self, token: &Token) -> Result<Code, Error> {
        let reading = self.current_reading();
        let expect = match reading {
            None => Expect::Nothing,
            Some(m) if !m.is_receiver_specified() => Expect::Receiver,
            Some(m) if !m.is_selector_specified() => Expect::Selector,
            Some(_) => Expect::Argument,
        };
        let kind = token.kind;
        let mut code = Code::default();

        if kind.contains(TokenKind::BLOCK_END) {
            code.op(AstCode::PopBlock);
        } else if kind.contains(TokenKind::ALL_BLOCK_END) {
            code.op(AstCode::PopAll);
        }

        if kind.contains(TokenKind::BLOCK_BEGIN) {
            if expect == Expect::Nothing {
                if kind.contains(TokenKind::FIRSTTERM) {
                    code.op(AstCode::AddNewMessage);
                } else {
                    code.arg(ArgCode::StackRef);
                    code.op(AstCode::AddTwinNewMessage);
                }
            } else {
                code.op(AstCode::AddElementAsNewMessage(expect));
            }
            code.op(AstCode::PushBlock);
            return Ok(code);
        }

        let is_string = token.is_string();
        let text = token.text.as_str();
        if !is_string {
            if kind.contains(TokenKind::SYNTACTIC) {
                if text == SIGIL_END_TRAILING_ARGS && expect == Expect::Argument {
                    code.op(AstCode::PopBlock);
                    return Ok(code);
                }
                if text == SIGIL_DISCARD_MESSAGE {
                    if expect == Expect::Nothing {
                        code.op(AstCode::Discard);
                        return Ok(code);
                    }
                    return Err(Error::BadExpression(format!(
                        "message elements are missing before '{SIGIL_DISCARD_MESSAGE}'"
                    )));
                }
            } else if kind.contains(TokenKind::BLOCK_SELECTOR_MOD) {
                code.op(AstCode::ModifyNextBlockSelector(token.text.clone()));
                return Ok(code);
            }
        }

        if !kind.contains(TokenKind::TERM) {
            return Ok(code);
        }

        if !is_string {
            if let Some(objid) = text.strip_prefix(SIGIL_OBJECT_ID) {
                compile_object_ref(&mut code, expect, text, objid)?;
                return Ok(code);
            }
        }

        match expect {
            Expect::Selector => {
                code.add_selector(text);
                code.op(AstCode::AddElementToLast(expect));
            }
            Expect::Argument => {
                let spec = match reading {
                    Some(m) => m.next_parameter_spec()?,
                    None => None,
                };
                let arg = match spec {
                    Some(p) if p.typename() == "Type" => ArgCode::Type(text.to_string()),
                    Some(p) if p.typename() == "Tuple" => ArgCode::Tuple(text.to_string()),
                    Some(p) if !p.is_type_unspecified() => ArgCode::TypedValue(text.to_string(), p),
                    _ if is_string => ArgCode::Str(text.to_string()),
                    _ => ArgCode::Literal(text.to_string()),
                };
                code.arg(arg);
                code.op(AstCode::AddElementToLast(expect));
            }
            Expect::Receiver => {
                code.arg(receiver_code(text, is_string));
                code.op(AstCode::AddElementToLast(expect));
            }
            Expect::Nothing => {
                if kind.contains(TokenKind::FIRSTTERM) {
                    code.arg(receiver_code(text, is_string));
                } else {
                    // selector applied to the previous result
                    code.arg(ArgCode::StackRef);
                    code.add_selector(text);
                }
                code.op(AstCode::AddNewMessage);
            }
        }
        Ok(code)
    }

    fn run_code(&mut self, code: &Code, ctx: &mut InvocationContext) -> Result<(), Error> {
        let mut elements = Vec::new();
        for arg in &code.args {
            arg.build(ctx, &mut elements)?;
        }
        for op in &code.ops {
            self.apply(op, &mut elements, ctx)?;
        }
        Ok(())
    }

    fn last_reading(&mut self) -> Result<&mut Message, Error> {
        self.readings
            .last_mut()
            .ok_or_else(|| Error::BadExpression("no message is being read".into()))
    }

    fn apply(
        &mut self,
        op: &AstCode,
        elements: &mut Vec<Element>,
        ctx: &mut InvocationContext,
    ) -> Result<(), Error> {
        match op {
            AstCode::AddElementToLast(expect) => {
                let elements = std::mem::take(elements);
                self.last_reading()?.add_elements(elements, *expect)?;
            }
            AstCode::AddElementAsNewMessage(expect) => {
                let slot = vec![Element::Value(ValueRef::stack())];
                self.last_reading()?.add_elements(slot, *expect)?;
                let message = Message::from_elements(std::mem::take(elements))?;
                self.readings.push(message);
            }
            AstCode::AddNewMessage => {
                let message = Message::from_elements(std::mem::take(elements))?;
                self.readings.push(message);
            }
            AstCode::AddTwinNewMessage => {
                // the block about to open supplies the selector
                let mut twin = std::mem::take(elements);
                twin.push(Element::Value(ValueRef::stack()));
                self.readings.push(Message::from_elements(twin)?);
                self.readings.push(Message::default());
            }
            AstCode::SetAsSelectorReturner => {
                let message = self
                    .readings
                    .last_mut()
                    .ok_or_else(|| Error::BadExpression("no message is being read".into()))?;
                message.as_selector_returner(ctx, &mut self.locals)?;
            }
            AstCode::ModifyNextBlockSelector(sigil) => {
                let modifier = Modifiers::from_sigil(sigil)
                    .ok_or_else(|| Error::BadExpression(format!("unknown modifier '{sigil}'")))?;
                let target = self
                    .readings
                    .len()
                    .checked_sub(2)
                    .ok_or_else(|| Error::BadExpression(format!("no message to apply '{sigil}' to")))?;
                self.readings[target].set_selector_modifier(modifier);
            }
            AstCode::Discard => self.next_firstterm = true,
            AstCode::PushBlock => {
                let top = self.readings.len().saturating_sub(1);
                self.blocks.push(top);
            }
            AstCode::PopBlock => {
                let top = self.blocks.last().copied().unwrap_or(0);
                for i in (top..self.readings.len()).rev() {
                    self.readings[i].conclude(ctx, &mut self.locals)?;
                }
                self.blocks.pop();
            }
            AstCode::PopAll => {
                for message in &mut self.readings {
                    message.conclude(ctx, &mut self.locals)?;
                }
                self.blocks.clear();
            }
        }
        Ok(())
    }

    fn take_read(&mut self, source: &str) -> String {
        let begin = byte_offset(source, self.last_read);
        let end = byte_offset(source, self.read.max(self.last_read));
        self.last_read = self.read.max(self.last_read);
        source[begin..end].trim().to_string()
    }

    /// Attach the read/unread split of the source to an error result
    fn locate_error(&self, ctx: &InvocationContext, result: Object, read: usize) -> Object {
        if !ctx.is_log_enabled() {
            return result;
        }
        let Some(error) = result.get_error() else {
            return result;
        };
        if !error.read.is_empty() || !error.unread.is_empty() {
            return result;
        }
        let split = byte_offset(&self.source, read);
        let located = error
            .clone()
            .with_location(&self.source[..split], &self.source[split..]);
        Object::new(Arc::clone(result.ty()), Value::Error(Arc::new(located)))
    }

    /// Evaluate every innermost message that became complete. Returns
    /// false when an evaluation failed.
    fn complete_messages(
        &mut self,
        ctx: &mut InvocationContext,
        on_step: &mut StepFn<'_>,
        completed: &mut Vec<CachedMessage>,
    ) -> Result<bool, Error> {
        let source = self.source.clone();
        let mut done = 0;
        let mut index = self.readings.len();
        let mut ok = true;
        while index > 0 {
            let i = index - 1;
            // messages outside the current block wait for it to close
            if self.blocks.last().is_some_and(|top| *top > i) {
                break;
            }
            if !self.readings[i].check_concluded(ctx, &mut self.locals)? {
                break;
            }
            let text = self.take_read(&source);
            if !text.is_empty() {
                on_step(Step::Message(&text))?;
            }
            ctx.check_interruption()?;
            let (result, failed) = self.readings[i].eval(ctx, &mut self.locals, &text)?;
            let result = self.locate_error(ctx, result, self.read);
            self.locals.push(result);
            completed.push(CachedMessage {
                text,
                read: self.read,
                message: self.readings[i].clone(),
            });
            done += 1;
            index -= 1;
            if failed {
                ok = false;
                break;
            }
        }
        let keep = self.readings.len() - done;
        self.readings.truncate(keep);
        Ok(ok)
    }

    fn read_messages(&mut self, ctx: &mut InvocationContext, on_step: &mut StepFn<'_>) -> Result<(), Error> {
        let source = self.source.clone();
        let mut tokens = TokenStream::new(&source);
        let mut completed = Vec::new();
        while let Some(token) = tokens.next() {
            let token = token?;
            self.read = token.read;
            tracing::trace!(token = %token.text, kind = ?token.kind, "read token");
            let code = self.compile_code(&token)?;
            tracing::trace!(code = %code, "compiled");
            if ctx.is_log_enabled() {
                ctx.add_log(LogEntry::Code(code.to_string()));
            }
            self.run_code(&code, ctx)?;
            if std::mem::take(&mut self.next_firstterm) {
                tokens.set_next_token_firstterm();
            }
            if !self.complete_messages(ctx, on_step, &mut completed)? {
                self.failed = true;
                return Ok(());
            }
        }
        if self.readings.is_empty() {
            self.cache = completed;
        }
        Ok(())
    }

    fn replay_messages(
        &mut self,
        ctx: &mut InvocationContext,
        cached: &mut [CachedMessage],
        on_step: &mut StepFn<'_>,
    ) -> Result<(), Error> {
        for entry in cached.iter_mut() {
            entry.message.reset();
            self.read = entry.read;
            if !entry.text.is_empty() {
                on_step(Step::Message(&entry.text))?;
            }
            ctx.check_interruption()?;
            let (result, failed) = entry.message.eval(ctx, &mut self.locals, &entry.text)?;
            let result = self.locate_error(ctx, result, entry.read);
            self.locals.push(result);
            if failed {
                self.failed = true;
                break;
            }
        }
        Ok(())
    }

    fn runner(
        &mut self,
        ctx: &mut InvocationContext,
        cache: bool,
        on_step: &mut StepFn<'_>,
    ) -> Result<(), Error> {
        self.readings.clear();
        self.blocks.clear();
        self.locals.clear();
        self.last_read = 0;
        self.read = 0;
        self.failed = false;
        self.next_firstterm = false;
        ctx.add_log(LogEntry::MessageBegin);

        let outcome = if cache && !self.cache.is_empty() {
            let mut cached = std::mem::take(&mut self.cache);
            let outcome = self.replay_messages(ctx, &mut cached, on_step);
            self.cache = cached;
            outcome
        } else {
            self.read_messages(ctx, on_step)
        };

        match outcome {
            Ok(()) => {
                ctx.add_log(LogEntry::MessageEnd);
                Ok(())
            }
            Err(Error::Interrupted) => Err(Error::Interrupted),
            Err(e) => {
                // failure outside of any invocation
                tracing::debug!(error = %e, expr = %self.source, "message engine failed");
                let error = Error::internal(e, self.source.clone());
                let object = ctx.new_error_object(error.clone(), &self.source);
                let object = self.locate_error(ctx, object, self.read);
                self.locals.push(object);
                ctx.push_extra_exception(error);
                self.failed = true;
                Ok(())
            }
        }
    }

    /// Take the last result and reset the engine for another run
    fn finish(&mut self, ctx: &InvocationContext) -> Result<Object, Error> {
        if !self.readings.is_empty() && !self.failed {
            let pending: Vec<String> = self.readings.iter().map(ToString::to_string).collect();
            self.readings.clear();
            return Err(Error::BadExpression(format!(
                "unconcluded messages remain: {}",
                pending.join(" ")
            )));
        }
        self.readings.clear();
        self.blocks.clear();
        let result = self.locals.clear().pop().ok_or_else(|| {
            Error::BadExpression("at least one result must be returned, but none is on the stack".into())
        })?;
        if ctx.is_set_raise_error() {
            if let Some(error) = result.get_error() {
                return Err(error.error.clone());
            }
        }
        Ok(result)
    }

    /// Run in a fork whose subject is `subject`, or in `ctx` itself when
    /// there is none
    pub fn run(
        &mut self,
        subject: Option<Object>,
        ctx: &mut InvocationContext,
        cache: bool,
    ) -> Result<Object, Error> {
        match subject {
            Some(subject) => {
                let mut child = start_subcontext(ctx, subject)?;
                let result = self.run_here(&mut child, cache);
                ctx.add_subcontext(child);
                result
            }
            None => self.run_here(ctx, cache),
        }
    }

    /// Run in the current context
    #[tracing::instrument(skip_all, fields(expr = %self.source))]
    pub fn run_here(&mut self, ctx: &mut InvocationContext, cache: bool) -> Result<Object, Error> {
        self.runner(ctx, cache, &mut |_| Ok(()))?;
        let result = self.finish(ctx);
        tracing::debug!(ok = result.is_ok(), "message engine finished");
        result
    }

    /// Run in a fork, reporting each message before it runs and the final
    /// result at the end
    pub fn run_step<F>(
        &mut self,
        subject: Option<Object>,
        ctx: &mut InvocationContext,
        cache: bool,
        mut on_step: F,
    ) -> Result<Object, Error>
    where
        F: FnMut(Step<'_>) -> Result<(), Interrupted>,
    {
        let subject = subject.or_else(|| ctx.subject_object().cloned());
        let mut child = fork(ctx, subject)?;
        let outcome = self
            .runner(&mut child, cache, &mut on_step)
            .and_then(|()| self.finish(&child));
        ctx.add_subcontext(child);
        let result = outcome?;
        on_step(Step::Result(&result))?;
        Ok(result)
    }

    /// [`MessageEngine::run_step`] posting each message to the spirit,
    /// indented by nesting depth
    pub fn run_print_step(
        &mut self,
        subject: Option<Object>,
        ctx: &mut InvocationContext,
        cache: bool,
    ) -> Result<Object, Error> {
        let spirit = Arc::clone(ctx.spirit());
        let indent = "  ".repeat(ctx.get_depth());
        self.run_step(subject, ctx, cache, |step| {
            spirit.interruption_point()?;
            if let Step::Message(text) = step {
                spirit.post("message", &format!("{indent}{text}"));
            }
            Ok(())
        })
    }

    /// Run the way the context flags ask for
    pub fn run_function(
        &mut self,
        subject: Option<Object>,
        ctx: &mut InvocationContext,
    ) -> Result<Object, Error> {
        if ctx.is_set_print_step() {
            self.run_print_step(subject, ctx, false)
        } else {
            self.run(subject, ctx, false)
        }
    }
}

fn receiver_code(text: &str, is_string: bool) -> ArgCode {
    if is_string {
        ArgCode::Str(text.to_string())
    } else {
        ArgCode::ReceiverValue(text.to_string())
    }
}

/// Compile `@...` object references
fn compile_object_ref(code: &mut Code, expect: Expect, token: &str, objid: &str) -> Result<(), Error> {
    if expect == Expect::Selector {
        return Err(Error::BadExpression(format!(
            "a selector is required, but found '{token}'"
        )));
    }
    let new_block = if expect == Expect::Nothing {
        AstCode::AddNewMessage
    } else {
        AstCode::AddElementAsNewMessage(expect)
    };

    if objid.is_empty() {
        code.arg(ArgCode::SubjectMember(None));
    } else if let Some((_, member)) = token.split_once(SIGIL_SUBJECT_MEMBER) {
        if member.is_empty() {
            return Err(Error::BadExpression(format!(
                "a selector is required after '{SIGIL_SUBJECT_MEMBER}'"
            )));
        }
        code.arg(ArgCode::SubjectMember(Some(member.to_string())));
        code.op(new_block);
        return Ok(());
    } else if let Some(member) = objid.strip_prefix(SIGIL_ROOT_MEMBER) {
        let member = (!member.is_empty()).then(|| member.to_string());
        code.arg(ArgCode::RootMember(member));
        code.op(new_block);
        return Ok(());
    } else if let Some(rest) = objid.strip_prefix(SIGIL_PREVIOUS) {
        let digits = if rest.is_empty() { "1" } else { rest };
        match digits.parse::<usize>() {
            Ok(n) if digits.chars().all(|c| c.is_ascii_digit()) => code.arg(ArgCode::RefPrevious(n)),
            _ => code.arg(ArgCode::RefName(objid.to_string())),
        }
    } else if objid.chars().all(|c| c.is_ascii_digit()) {
        let name = objid
            .parse::<u64>()
            .map_or_else(|_| objid.to_string(), |n| n.to_string());
        code.arg(ArgCode::RefName(name));
    } else {
        code.arg(ArgCode::RefName(objid.to_string()));
    }

    code.op(if expect == Expect::Nothing {
        AstCode::AddNewMessage
    } else {
        AstCode::AddElementToLast(expect)
    });
    Ok(())
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::context::TempSpirit;
    use crate::fundamental::fundamental_module;
    use crate::invocation::Returned;
    use crate::method::Method;
    use crate::object::NativeObject;
    use crate::registry::TypeModule;
    use crate::types::{Type, TypeFlags, ValueKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    enum TestResult {
        EvalResult(Value),         // Evaluation should succeed with this value
        ErrorObject(&'static str), // Evaluation yields an Error object of this kind
    }
    use TestResult::*;

    fn int(n: i64) -> TestResult {
        EvalResult(Value::Int(n))
    }

    fn text(s: &str) -> TestResult {
        EvalResult(Value::Str(s.to_string()))
    }

    fn execute_test_case(input: &str, expected: &TestResult, ctx: &mut InvocationContext, test_id: &str) {
        let outcome = MessageEngine::new(input).run_here(ctx, false);
        match (outcome, expected) {
            (Ok(actual), EvalResult(value)) => {
                assert!(!actual.is_error(), "{test_id}: '{input}' failed: {actual:?}");
                assert_eq!(actual.value(), value, "{test_id}: '{input}'");
            }
            (Ok(actual), ErrorObject(kind)) => {
                let error = actual
                    .get_error()
                    .unwrap_or_else(|| panic!("{test_id}: '{input}' expected {kind}, got {actual:?}"));
                assert_eq!(error.error.kind_name(), *kind, "{test_id}: '{input}'");
            }
            (Err(e), other) => panic!("{test_id}: '{input}' expected {other:?}, got error {e}"),
        }
    }

    fn run_tests(test_cases: Vec<(&str, TestResult)>) {
        for (i, (input, expected)) in test_cases.iter().enumerate() {
            let mut ctx = InvocationContext::instant(None);
            execute_test_case(input, expected, &mut ctx, &format!("#{}", i + 1));
        }
    }

    #[test]
    fn test_reducer_data_driven() {
        run_tests(vec![
            // single terms
            ("42", int(42)),
            ("'quoted string'", text("quoted string")),
            // chains evaluate left to right
            ("1 + 2", int(3)),
            ("1 add 2 add 3", int(6)),
            ("2 * 3 + 4", int(10)),
            ("3 * -4", int(-12)),
            // blocks
            ("10 * (1 + 2 + 3)", int(60)),
            ("(7 mul 8) add (9 mul 10)", int(146)),
            ("(1 sub 2) mul 3", int(-3)),
            ("((((3))))", int(3)),
            ("2 mul $ 3 add 4", int(14)),
            // discard
            ("10 + 20 . 3 * 5", int(15)),
            (". 10 + 20 . 3 * 5 .", int(15)),
            // typed arguments and trailing selectors
            ("GODZILLA slice 1", text("ODZILLA")),
            ("GODZILLA slice: 1 -1", text("ODZILL")),
            ("GODZILLA slice: (9 sub 8) -1", text("ODZILL")),
            ("GODZILLA slice: 2 ; length", int(6)),
            ("--/0x32/ Int", int(50)),
            ("'A string' endswith g", EvalResult(Value::Bool(true))),
            ("'A string' upper", text("A STRING")),
            ("GODZILLA lower", text("godzilla")),
            ("abc startswith a", EvalResult(Value::Bool(true))),
            // modifiers
            ("3 !equal 4", EvalResult(Value::Bool(true))),
            ("3 ~sub 10", int(7)),
            ("2 ~(sub) 10", int(8)),
            // failures become Error objects
            ("1 / 0", ErrorObject("ZeroDivisionError")),
            ("2 / 0 + 5 non-existent-method 0", ErrorObject("ZeroDivisionError")),
            ("3 non-existent-method", ErrorObject("BadInstanceMethodInvocation")),
            ("@ + 1", ErrorObject("BadExpressionError")),
            ("1 + (2", ErrorObject("SyntaxError")),
            ("@x", ErrorObject("BadExpressionError")),
        ]);
    }

    #[test]
    fn test_selector_returner() {
        let mut ctx = InvocationContext::instant(None);
        let result = MessageEngine::new("1 add").run_here(&mut ctx, false).unwrap();
        assert_eq!(result.get_typename(), "Invocation");
        assert!(matches!(result.value(), Value::Invocation(inv) if inv.get_method_name() == "add"));

        let result = MessageEngine::new("1 add?").run_here(&mut ctx, false).unwrap();
        assert_eq!(result.get_typename(), "Invocation");
    }

    #[test]
    fn test_object_references() {
        let mut ctx = InvocationContext::instant(None);
        ctx.bind_object("lucky", ctx.new_object(Value::Int(7))).unwrap();
        ctx.push_object("42", ctx.new_object(Value::Str("answer".into())));
        run_in(&mut ctx, "@lucky * 6", int(42));
        run_in(&mut ctx, "@042 upper", text("ANSWER"));
        run_in(&mut ctx, "@042 startswith ans", EvalResult(Value::Bool(true)));
        run_in(&mut ctx, "@- length", int(6));
        run_in(&mut ctx, "@-2 + 1", int(8));

        let subject = ctx.new_object(Value::Str("GODZILLA".into()));
        let mut child = ctx.inherit(Some(subject));
        run_in(&mut child, "@/length + 1", int(9));
        run_in(&mut child, "@ slice 0 3", text("GOD"));
        run_in(&mut child, "(@ length) * @/length", int(64));
    }

    fn run_in(ctx: &mut InvocationContext, input: &str, expected: TestResult) {
        execute_test_case(input, &expected, ctx, "shared");
    }

    #[test]
    fn test_cached_replay() {
        let ctx = InvocationContext::instant(None);
        let mut engine = MessageEngine::new("210 / @");
        let mut results = Vec::new();
        for n in [7, 5, 0, 2] {
            let mut child = ctx.inherit(Some(ctx.new_object(Value::Int(n))));
            results.push(engine.run_here(&mut child, true).unwrap());
            assert!(engine.is_cached());
        }
        assert_eq!(results[0].value(), &Value::Float(30.0));
        assert_eq!(results[1].value(), &Value::Float(42.0));
        assert_eq!(results[2].get_error().unwrap().error, Error::ZeroDivision);
        assert_eq!(results[3].value(), &Value::Float(105.0));

        // blocks replay in the order they were evaluated
        let mut engine = MessageEngine::new("(@ + 1) * (@ - 1)");
        for (n, expected) in [(3, 8), (5, 24), (1, 0)] {
            let mut child = ctx.inherit(Some(ctx.new_object(Value::Int(n))));
            let result = engine.run_here(&mut child, true).unwrap();
            assert_eq!(result.value(), &Value::Int(expected), "subject {n}");
        }
    }

    /// Counts how often its methods run
    #[derive(Debug, Default)]
    struct Counter {
        calls: AtomicUsize,
    }

    impl Counter {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl NativeObject for Counter {
        fn type_name(&self) -> &str {
            "Counter"
        }

        fn method_arity(&self, name: &str) -> Option<(usize, usize)> {
            matches!(name, "tick" | "op").then_some((0, 0))
        }

        fn call_method(&self, name: &str, _args: &[Value]) -> Option<Result<Value, Error>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match name {
                "tick" => Some(Ok(Value::Int(n as i64))),
                "op" => Some(Ok(Value::Str("add".into()))),
                _ => None,
            }
        }
    }

    fn counting_context() -> (InvocationContext, Arc<Counter>) {
        let counter = Arc::new(Counter::default());
        let mut ctx = InvocationContext::instant(None);
        let native: Arc<dyn NativeObject> = counter.clone();
        ctx.bind_object("counter", ctx.new_object(Value::Native(native))).unwrap();
        (ctx, counter)
    }

    #[test]
    fn test_each_term_is_evaluated_once() {
        let cases = vec![
            // receiver and argument
            ("(@counter tick) + (@counter tick)", int(3), 2),
            // nested block result
            ("((@counter tick))", int(1), 1),
            ("(((@counter tick)) + 10) * 2", int(22), 1),
            // selector
            ("1 (@counter op) 2", int(3), 1),
            ("@counter tick", int(1), 1),
        ];
        for (input, expected, calls) in cases {
            let (mut ctx, counter) = counting_context();
            execute_test_case(input, &expected, &mut ctx, input);
            assert_eq!(counter.calls(), calls, "'{input}'");
        }
    }

    #[test]
    fn test_cached_replay_evaluates_each_term_once() {
        let (mut ctx, counter) = counting_context();
        let mut engine = MessageEngine::new("(@counter tick) + (@ * (@counter tick))");
        for (run, expected) in [(1, 1 + 2), (2, 3 + 2 * 4), (3, 5 + 3 * 6)] {
            let subject = ctx.new_object(Value::Int(run));
            let result = engine.run(Some(subject), &mut ctx, true).unwrap();
            assert!(engine.is_cached());
            assert_eq!(result.value(), &Value::Int(expected), "run {run}");
            assert_eq!(counter.calls(), 2 * run as usize, "run {run}");
        }

        let mut engine = MessageEngine::new("1 (@counter op) 2");
        for run in 1..=3 {
            let result = engine.run_here(&mut ctx, true).unwrap();
            assert_eq!(result.value(), &Value::Int(3));
            assert_eq!(counter.calls(), 6 + run, "run {run}");
        }
    }

    fn shadowed_vars(_ctx: &mut InvocationContext, _args: Vec<Object>) -> Result<Returned, Error> {
        Ok(Returned::Value(Value::Str("shadowed".into())))
    }

    #[test]
    fn test_replay_resolves_root_object_per_run() {
        let mut module = TypeModule::new();
        module.add_ancestor(fundamental_module());
        module.define(
            Type::new("RootObject", ValueKind::None)
                .flags(TypeFlags::NO_INSTANCE_METHOD)
                .describe(|t| t.add(Method::contextual("vars", shadowed_vars))),
        );
        let mut shadowing = InvocationContext::builder().type_module(Arc::new(module)).build();

        let mut ctx = InvocationContext::instant(None);
        ctx.bind_object("lucky", ctx.new_object(Value::Int(7))).unwrap();

        let mut engine = MessageEngine::new("@#vars");
        let first = engine.run_here(&mut ctx, true).unwrap();
        assert!(engine.is_cached());
        assert_eq!(first.to_string(), "lucky");

        let replayed = engine.run_here(&mut shadowing, true).unwrap();
        assert_eq!(replayed.value(), &Value::Str("shadowed".into()));
        assert_eq!(replayed.get_typename(), "Str");

        let again = engine.run_here(&mut ctx, true).unwrap();
        assert_eq!(again.to_string(), "lucky");
    }

    #[test]
    fn test_failure_stops_the_engine() {
        let mut ctx = InvocationContext::instant(None);
        let result = MessageEngine::new("--[10 / 0] do non-existent-method")
            .run_here(&mut ctx, false)
            .unwrap();
        let error = result.get_error().unwrap();
        assert_eq!(error.error.kind_name(), "ZeroDivisionError");
        // the method after the failed block never ran
        assert_eq!(ctx.invocations().len(), 1);
        assert!(error.unread.contains("non-existent-method"));
        assert!(error.read.contains("do"));

        ctx.set_flags(crate::InvocationFlags::RAISE_ERROR, crate::FlagScope::Now);
        let err = MessageEngine::new("1 / 0").run_here(&mut ctx, false).unwrap_err();
        assert_eq!(err, Error::ZeroDivision);
    }

    #[test]
    fn test_run_step_and_log() {
        let mut ctx = InvocationContext::instant(None);
        let mut steps = Vec::new();
        let subject = ctx.new_object(Value::Int(4));
        let result = MessageEngine::new("@ * 2 + 1")
            .run_step(Some(subject), &mut ctx, false, |step| {
                match step {
                    Step::Message(text) => steps.push(text.to_string()),
                    Step::Result(obj) => steps.push(format!("= {obj}")),
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(result.value(), &Value::Int(9));
        assert_eq!(steps, vec!["@ * 2", "+ 1", "= 9"]);

        let child = ctx.get_subcontext("0-0").unwrap();
        assert_eq!(child.invocations().len(), 2);
        assert!(child.log().iter().any(|e| matches!(e, LogEntry::Code(_))));
        assert!(matches!(child.log().last(), Some(LogEntry::MessageEnd)));
    }

    #[test]
    fn test_interruption_propagates() {
        let spirit = Arc::new(TempSpirit::new());
        let mut ctx = InvocationContext::builder().spirit(spirit.clone()).build();
        spirit.interrupt();
        let err = MessageEngine::new("1 + 2").run_here(&mut ctx, false).unwrap_err();
        assert_eq!(err, Error::Interrupted);
    }

    #[test]
    fn test_depth_limit() {
        let mut ctx = InvocationContext::instant(None);
        for _ in 0..MAX_EVAL_DEPTH {
            ctx = ctx.inherit(None);
        }
        let subject = ctx.new_object(Value::Int(1));
        let err = MessageEngine::new("@ + 1").run(Some(subject), &mut ctx, false).unwrap_err();
        assert_eq!(err.kind_name(), "ValueError");
    }
}
