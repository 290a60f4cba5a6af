//! The closed set of invocation variants and their activation records.
//!
//! Selector resolution produces an [`Invocation`]. The reducer queries its
//! arity and parameter specs while a message is being read, then calls
//! [`Invocation::prepare_invoke`] to build an [`InvocationEntry`] and
//! [`InvocationEntry::invoke`] to run it.

use crate::context::InvocationContext;
use crate::function::FunctionExpr;
use crate::method::{Method, MethodParameter, MethodResult};
use crate::object::{ErrorObject, NativeObject, Object, Value};
use crate::types::{TypeDecl, TypeInstance, TypeRef, construct_instance};
use crate::{Error, Interrupted, MAX_ARITY};
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

bitflags! {
    /// Selector modifiers, from affixes or block modifier tokens
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Modifiers: u32 {
        /// `!`: boolean result is negated
        const NEGATE_RESULT = 0x1;
        /// `~`: receiver and arguments are passed in reverse order
        const REVERSE_ARGS = 0x2;
        /// `` ` ``: object collections are not searched for members
        const BASIC_RECEIVER = 0x4;
        /// `:` suffix: arguments are collected up to the maximum arity
        const TRAILING_ARGS = 0x8;
        /// `:>` suffix: the last parameter takes every remaining argument
        const CONSUME_ARGS = 0x10;
        /// `?` suffix: the message returns the invocation instead of calling it
        const SHOW_HELP = 0x20;
        /// Arguments are dropped; set by `void`
        const IGNORE_ARGS = 0x40;
        /// The collection's delegation object is the receiver
        const DELEGATE_RECEIVER = 0x80;
    }
}

impl Modifiers {
    /// Modifier named by a selector affix or block modifier token
    pub fn from_sigil(sigil: &str) -> Option<Self> {
        match sigil {
            "!" => Some(Modifiers::NEGATE_RESULT),
            "~" => Some(Modifiers::REVERSE_ARGS),
            "`" => Some(Modifiers::BASIC_RECEIVER),
            ":" => Some(Modifiers::TRAILING_ARGS),
            ":>" => Some(Modifiers::CONSUME_ARGS),
            "?" => Some(Modifiers::SHOW_HELP),
            _ => None,
        }
    }

    /// Lower-case names joined by spaces, e.g. `negate-result reverse-args`
    pub fn display_names(self) -> String {
        self.iter_names()
            .map(|(name, _)| name.to_lowercase().replace('_', "-"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What an action hands back before it is boxed into a typed object
#[derive(Debug, Clone)]
pub enum Returned {
    Value(Value),
    Object(Object),
}

impl From<Value> for Returned {
    fn from(v: Value) -> Self {
        Returned::Value(v)
    }
}

impl From<Object> for Returned {
    fn from(o: Object) -> Self {
        Returned::Object(o)
    }
}

impl From<i64> for Returned {
    fn from(n: i64) -> Self {
        Returned::Value(Value::Int(n))
    }
}

impl From<f64> for Returned {
    fn from(x: f64) -> Self {
        Returned::Value(Value::Float(x))
    }
}

impl From<bool> for Returned {
    fn from(b: bool) -> Self {
        Returned::Value(Value::Bool(b))
    }
}

impl From<String> for Returned {
    fn from(s: String) -> Self {
        Returned::Value(Value::Str(s))
    }
}

impl From<Vec<Object>> for Returned {
    fn from(items: Vec<Object>) -> Self {
        Returned::Value(Value::Tuple(items))
    }
}

impl From<TypeRef> for Returned {
    fn from(t: TypeRef) -> Self {
        Returned::Value(Value::Type(t))
    }
}

impl From<()> for Returned {
    fn from(_: ()) -> Self {
        Returned::Value(Value::None)
    }
}

impl<T> From<Option<T>> for Returned
where
    T: Into<Returned>,
{
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Returned::Value(Value::None),
        }
    }
}

/// Member access on an object collection, resolved against the live
/// collection the first time it sees a receiver.
#[derive(Debug, Clone)]
pub struct MemberRedirector {
    name: String,
    modifiers: Modifiers,
    resolved: Option<Box<Invocation>>,
}

impl MemberRedirector {
    pub fn new(name: impl Into<String>, modifiers: Modifiers) -> Self {
        MemberRedirector {
            name: name.into(),
            modifiers,
            resolved: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    fn must_be_resolved(&self) -> Result<&Invocation, Error> {
        self.resolved.as_deref().ok_or_else(|| {
            Error::RedirectUnresolvedInvocation(format!("ObjectMember {}", self.name))
        })
    }

    /// Pick a getter for a bound member, else a method on the delegation
    /// object, else a generic method.
    pub fn resolve(&mut self, ctx: &InvocationContext, collection: &Object) -> Result<(), Error> {
        if self.resolved.is_some() {
            return Ok(());
        }
        let Value::Collection(items) = collection.value() else {
            return Err(Error::BadObjectMemberInvocation(self.name.clone()));
        };
        if let Some(item) = items.get(&self.name) {
            self.resolved = Some(Box::new(Invocation::ObjectMemberGetter {
                name: self.name.clone(),
                typename: item.object.get_typename().to_string(),
                modifiers: self.modifiers,
            }));
            return Ok(());
        }
        let delegate = items
            .get_delegation()
            .filter(|_| !self.modifiers.contains(Modifiers::BASIC_RECEIVER));
        let resolved = match delegate {
            Some(delegate) => {
                self.modifiers |= Modifiers::DELEGATE_RECEIVER;
                crate::selector::select_method(ctx, &self.name, Some(delegate), self.modifiers)?
            }
            None => {
                match crate::selector::select_method(ctx, &self.name, None, self.modifiers)? {
                    Invocation::InstanceMethod { .. } => {
                        return Err(Error::BadObjectMemberInvocation(self.name.clone()));
                    }
                    inv => inv,
                }
            }
        };
        self.resolved = Some(Box::new(resolved));
        Ok(())
    }

    pub fn reset(&mut self) {
        self.resolved = None;
        self.modifiers.remove(Modifiers::DELEGATE_RECEIVER);
    }
}

/// A resolved, callable unit
#[derive(Debug, Clone)]
pub enum Invocation {
    /// Method from the receiver type's table
    TypeMethod {
        ty: TypeRef,
        method: Arc<Method>,
        modifiers: Modifiers,
    },
    /// Method looked up on the receiver value at call time
    InstanceMethod {
        name: String,
        min_arity: usize,
        max_arity: usize,
        modifiers: Modifiers,
    },
    /// Type-agnostic function, such as the generic operators
    Function {
        method: Arc<Method>,
        modifiers: Modifiers,
    },
    /// Function value run with the receiver as its subject
    Message {
        function: Arc<FunctionExpr>,
        modifiers: Modifiers,
    },
    ObjectMember(MemberRedirector),
    ObjectMemberGetter {
        name: String,
        typename: String,
        modifiers: Modifiers,
    },
    /// Converts the receiver into an instance of the type
    TypeConstructor {
        typedecl: TypeDecl,
        /// Unbound type parameters, then constructor parameters
        params: Vec<MethodParameter>,
        modifiers: Modifiers,
    },
    /// Calls an invocation with a fixed first argument
    Bind1st {
        invocation: Box<Invocation>,
        arg: Value,
        argtype: String,
        modifiers: Modifiers,
    },
}

impl Invocation {
    /// Constructor of `typedecl`. Arguments first fill the type parameters
    /// the declaration left unbound, then go to the constructor.
    pub fn type_constructor(ctx: &InvocationContext, typedecl: TypeDecl, modifiers: Modifiers) -> Self {
        let params = ctx
            .select_type(&typedecl.name)
            .and_then(|ty| {
                let table = ty.load().ok()?;
                Some(
                    table
                        .type_params()
                        .iter()
                        .skip(typedecl.args.len())
                        .chain(table.constructor_params())
                        .cloned()
                        .collect(),
                )
            })
            .unwrap_or_default();
        Invocation::TypeConstructor {
            typedecl,
            params,
            modifiers,
        }
    }

    pub fn modifiers(&self) -> Modifiers {
        match self {
            Invocation::TypeMethod { modifiers, .. }
            | Invocation::InstanceMethod { modifiers, .. }
            | Invocation::Function { modifiers, .. }
            | Invocation::Message { modifiers, .. }
            | Invocation::ObjectMemberGetter { modifiers, .. }
            | Invocation::TypeConstructor { modifiers, .. }
            | Invocation::Bind1st { modifiers, .. } => *modifiers,
            Invocation::ObjectMember(r) => r.modifiers,
        }
    }

    pub fn add_modifiers(&mut self, extra: Modifiers) {
        match self {
            Invocation::TypeMethod { modifiers, .. }
            | Invocation::InstanceMethod { modifiers, .. }
            | Invocation::Function { modifiers, .. }
            | Invocation::Message { modifiers, .. }
            | Invocation::ObjectMemberGetter { modifiers, .. }
            | Invocation::TypeConstructor { modifiers, .. }
            | Invocation::Bind1st { modifiers, .. } => *modifiers |= extra,
            Invocation::ObjectMember(r) => {
                r.modifiers |= extra;
                if let Some(inner) = r.resolved.as_deref_mut() {
                    inner.add_modifiers(extra);
                }
            }
        }
    }

    pub fn with_modifiers(mut self, extra: Modifiers) -> Self {
        self.add_modifiers(extra);
        self
    }

    pub fn get_method_name(&self) -> String {
        match self {
            Invocation::TypeMethod { method, .. } | Invocation::Function { method, .. } => {
                method.name().to_string()
            }
            Invocation::InstanceMethod { name, .. }
            | Invocation::ObjectMemberGetter { name, .. } => name.clone(),
            Invocation::Message { function, .. } => format!("({})", function.source()),
            Invocation::ObjectMember(r) => r.name.clone(),
            Invocation::TypeConstructor { typedecl, .. } => typedecl.to_string(),
            Invocation::Bind1st { invocation, .. } => invocation.get_method_name(),
        }
    }

    pub fn get_method_doc(&self) -> String {
        match self {
            Invocation::TypeMethod { method, .. } | Invocation::Function { method, .. } => {
                method.get_doc().to_string()
            }
            Invocation::ObjectMember(r) => format!("member '{}' of the collection", r.name),
            Invocation::ObjectMemberGetter { name, .. } => {
                format!("member '{name}' of the collection")
            }
            Invocation::TypeConstructor { typedecl, .. } => {
                format!("constructor of type '{typedecl}'")
            }
            Invocation::Bind1st { invocation, .. } => invocation.get_method_doc(),
            Invocation::InstanceMethod { .. } | Invocation::Message { .. } => String::new(),
        }
    }

    /// Variant tag, target and modifiers, e.g. `TypeMethod Int.hex negate-result`
    pub fn display_name(&self) -> String {
        let (kind, target) = match self {
            Invocation::TypeMethod { ty, method, .. } => {
                ("TypeMethod", format!("{}.{}", ty.name(), method.name()))
            }
            Invocation::InstanceMethod { name, .. } => ("InstanceMethod", name.clone()),
            Invocation::Function { method, .. } => ("Function", method.name().to_string()),
            Invocation::Message { function, .. } => ("Message", function.source().to_string()),
            Invocation::ObjectMember(r) => ("ObjectMember", r.name.clone()),
            Invocation::ObjectMemberGetter { name, .. } => ("ObjectMemberGetter", name.clone()),
            Invocation::TypeConstructor { typedecl, .. } => {
                ("TypeConstructor", typedecl.to_string())
            }
            Invocation::Bind1st {
                invocation,
                arg,
                argtype,
                ..
            } => {
                return format!(
                    "Bind1st[{arg}({argtype})] {}",
                    invocation.display_name()
                );
            }
        };
        let mods = self.modifiers().display_names();
        if mods.is_empty() {
            format!("{kind} {target}")
        } else {
            format!("{kind} {target} {mods}")
        }
    }

    pub fn is_trailing_consumer(&self) -> Result<bool, Error> {
        if self.modifiers().contains(Modifiers::CONSUME_ARGS) {
            return Ok(true);
        }
        Ok(match self {
            Invocation::TypeMethod { method, .. } | Invocation::Function { method, .. } => {
                method.is_trailing_consumer()
            }
            Invocation::ObjectMember(r) => r.must_be_resolved()?.is_trailing_consumer()?,
            _ => false,
        })
    }

    pub fn get_min_arity(&self) -> Result<usize, Error> {
        if self.modifiers().contains(Modifiers::IGNORE_ARGS) {
            return Ok(0);
        }
        Ok(match self {
            Invocation::TypeMethod { method, .. } | Invocation::Function { method, .. } => {
                method.min_arity()
            }
            Invocation::InstanceMethod { min_arity, .. } => *min_arity,
            Invocation::ObjectMember(r) => r.must_be_resolved()?.get_min_arity()?,
            Invocation::Message { .. }
            | Invocation::ObjectMemberGetter { .. }
            | Invocation::TypeConstructor { .. }
            | Invocation::Bind1st { .. } => 0,
        })
    }

    pub fn get_max_arity(&self) -> Result<usize, Error> {
        if self.modifiers().contains(Modifiers::IGNORE_ARGS) {
            return Ok(0);
        }
        if self.modifiers().contains(Modifiers::CONSUME_ARGS) {
            return Ok(MAX_ARITY);
        }
        Ok(match self {
            Invocation::TypeMethod { method, .. } | Invocation::Function { method, .. } => {
                method.max_arity().unwrap_or(MAX_ARITY)
            }
            Invocation::InstanceMethod { max_arity, .. } => *max_arity,
            Invocation::ObjectMember(r) => r.must_be_resolved()?.get_max_arity()?,
            Invocation::TypeConstructor { .. } => MAX_ARITY,
            Invocation::Message { .. }
            | Invocation::ObjectMemberGetter { .. }
            | Invocation::Bind1st { .. } => 0,
        })
    }

    /// Spec of the argument at `index` (after the receiver); `None` when unknown
    pub fn get_parameter_spec(&self, index: usize) -> Result<Option<MethodParameter>, Error> {
        Ok(match self {
            Invocation::TypeMethod { method, .. } | Invocation::Function { method, .. } => {
                if self.modifiers().contains(Modifiers::CONSUME_ARGS) {
                    method
                        .get_parameter(index)
                        .or_else(|| method.get_params().last())
                        .cloned()
                } else {
                    method.get_parameter(index).cloned()
                }
            }
            Invocation::ObjectMember(r) => r.must_be_resolved()?.get_parameter_spec(index)?,
            Invocation::TypeConstructor { params, .. } => params.get(index).cloned(),
            _ => None,
        })
    }

    /// Receiver type for the result spec of an `ObjectMember` redirect
    pub fn resolve_member(&mut self, ctx: &InvocationContext, receiver: &Object) -> Result<(), Error> {
        if let Invocation::ObjectMember(r) = self {
            r.resolve(ctx, receiver)?;
        }
        Ok(())
    }

    /// Drop state resolved against a previous receiver
    pub fn reset(&mut self) {
        if let Invocation::ObjectMember(r) = self {
            r.reset();
        }
    }

    /// Build the activation record. `objects` holds the receiver first.
    pub fn prepare_invoke(
        &self,
        ctx: &mut InvocationContext,
        mut objects: Vec<Object>,
    ) -> Result<InvocationEntry, Error> {
        let modifiers = self.modifiers();
        if objects.is_empty() {
            return Err(Error::BadExpression(format!(
                "{}: no receiver",
                self.display_name()
            )));
        }
        if modifiers.contains(Modifiers::IGNORE_ARGS) {
            objects.truncate(1);
        }
        match self {
            Invocation::TypeMethod { ty, method, .. } => {
                prepare_method(ctx, self, method, Some(ty), objects)
            }
            Invocation::Function { method, .. } => prepare_method(ctx, self, method, None, objects),
            Invocation::InstanceMethod { name, .. } => {
                if modifiers.contains(Modifiers::REVERSE_ARGS) {
                    objects.reverse();
                }
                let receiver = objects.remove(0);
                let action = resolve_instance_method(ctx, name, &receiver)?;
                let mut args = vec![receiver];
                args.extend(objects);
                Ok(InvocationEntry::new(self, action, args, MethodResult::any()))
            }
            Invocation::Message { function, .. } => {
                objects.truncate(1);
                Ok(InvocationEntry::new(
                    self,
                    EntryAction::RunFunction(Arc::clone(function)),
                    objects,
                    MethodResult::any(),
                ))
            }
            Invocation::ObjectMember(r) => {
                let resolved = r.must_be_resolved()?;
                if r.modifiers.contains(Modifiers::DELEGATE_RECEIVER) {
                    let delegate = match objects[0].value() {
                        Value::Collection(c) => c.get_delegation().cloned(),
                        _ => None,
                    }
                    .ok_or_else(|| Error::BadObjectMemberInvocation(r.name.clone()))?;
                    objects[0] = delegate;
                }
                let mut entry = resolved.prepare_invoke(ctx, objects)?;
                entry.invocation = self.display_name();
                Ok(entry)
            }
            Invocation::ObjectMemberGetter { name, typename, .. } => {
                let member = match objects[0].value() {
                    Value::Collection(c) => c.get(name).map(|item| item.object.clone()),
                    _ => None,
                }
                .ok_or_else(|| Error::BadObjectMemberInvocation(name.clone()))?;
                Ok(InvocationEntry::new(
                    self,
                    EntryAction::Constant(member),
                    Vec::new(),
                    MethodResult::new(typename),
                ))
            }
            Invocation::TypeConstructor { typedecl, .. } => {
                let mut instance = typedecl.instantiate(ctx.type_module())?;
                let unbound = instance
                    .ty
                    .load()?
                    .type_params()
                    .len()
                    .saturating_sub(instance.args.len());
                let bound = unbound.min(objects.len() - 1);
                for arg in objects.drain(1..=bound) {
                    instance.args.push(type_argument(ctx, &arg)?);
                }
                let result = MethodResult::new(instance.name());
                Ok(InvocationEntry::new(
                    self,
                    EntryAction::Construct(instance),
                    objects,
                    result,
                ))
            }
            Invocation::Bind1st {
                invocation,
                arg,
                argtype,
                ..
            } => {
                let bound = ctx.new_object_of(arg.clone(), argtype)?;
                objects.truncate(1);
                objects.push(bound);
                invocation.prepare_invoke(ctx, objects)
            }
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Invocation {}>", self.display_name())
    }
}

fn prepare_method(
    ctx: &mut InvocationContext,
    invocation: &Invocation,
    method: &Arc<Method>,
    owner: Option<&TypeRef>,
    mut objects: Vec<Object>,
) -> Result<InvocationEntry, Error> {
    let given = objects.len().saturating_sub(1);
    for (i, arg) in objects.iter_mut().enumerate().skip(1) {
        let Some(param) = method.get_parameter(i - 1) else {
            break;
        };
        if param.is_type_unspecified() {
            continue;
        }
        let instance = param.typedecl().instantiate(ctx.type_module())?;
        let mismatched = instance.name() != arg.get_typename() && !instance.ty.accepts(arg.value());
        if mismatched || !instance.args.is_empty() {
            let source = arg.clone();
            *arg = construct_instance(&instance, ctx, source, &[])?;
        }
    }
    for value in method.default_arguments(given) {
        let obj = ctx.new_object(value);
        objects.push(obj);
    }
    if invocation.modifiers().contains(Modifiers::REVERSE_ARGS) {
        objects.reverse();
    }
    let receiver = method
        .get_result()
        .is_return_self()
        .then(|| objects[0].clone());
    if let Some(ty) = owner.filter(|_| method.is_type_bound()) {
        let type_object = ctx.new_object(Value::Type(Arc::clone(ty)));
        objects.insert(0, type_object);
    }
    let mut entry = InvocationEntry::new(
        invocation,
        EntryAction::Method(Arc::clone(method)),
        objects,
        method.get_result().clone(),
    );
    entry.receiver = receiver;
    Ok(entry)
}

/// A type argument given as a message argument: a type object or a type expression
fn type_argument(ctx: &InvocationContext, arg: &Object) -> Result<TypeInstance, Error> {
    match arg.value() {
        Value::Type(ty) => Ok(TypeInstance::new(Arc::clone(ty))),
        Value::Str(expr) => TypeDecl::parse(expr)?.instantiate(ctx.type_module()),
        other => Err(Error::TypeError(format!(
            "type argument must be a Type, got {}",
            other.kind().primitive_name()
        ))),
    }
}

/// Per-name primitive method on a `Str` receiver
pub type PrimitiveFn = fn(&str, &[Value]) -> Result<Value, Error>;

fn resolve_instance_method(
    ctx: &InvocationContext,
    name: &str,
    receiver: &Object,
) -> Result<EntryAction, Error> {
    let missing = || Error::BadInstanceMethodInvocation {
        type_name: receiver.get_typename().to_string(),
        name: name.to_string(),
    };
    match receiver.value() {
        Value::Str(_) => crate::fundamental::str_instance_method(name)
            .map(|m| EntryAction::Primitive(m.action))
            .ok_or_else(missing),
        Value::Native(native) => {
            if native.method_arity(name).is_some() {
                Ok(EntryAction::Native(Arc::clone(native), name.to_string()))
            } else if let Some(attr) = native.get_attribute(name) {
                Ok(EntryAction::Constant(ctx.new_object(attr)))
            } else {
                Err(missing())
            }
        }
        _ => Err(missing()),
    }
}

/// What an entry runs when invoked
#[derive(Clone)]
pub enum EntryAction {
    Method(Arc<Method>),
    Primitive(PrimitiveFn),
    Native(Arc<dyn NativeObject>, String),
    RunFunction(Arc<FunctionExpr>),
    Constant(Object),
    Construct(TypeInstance),
}

impl fmt::Debug for EntryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryAction::Method(m) => write!(f, "Method({})", m.name()),
            EntryAction::Primitive(_) => write!(f, "Primitive"),
            EntryAction::Native(_, name) => write!(f, "Native({name})"),
            EntryAction::RunFunction(func) => write!(f, "RunFunction({})", func.source()),
            EntryAction::Constant(o) => write!(f, "Constant({o:?})"),
            EntryAction::Construct(t) => write!(f, "Construct({t})"),
        }
    }
}

/// Activation record of one invocation: arguments, result and failure
#[derive(Debug, Clone)]
pub struct InvocationEntry {
    /// Display name of the invocation that produced this entry
    pub invocation: String,
    action: EntryAction,
    pub args: Vec<Object>,
    pub result: Option<Object>,
    pub exception: Option<Error>,
    pub result_spec: MethodResult,
    pub modifiers: Modifiers,
    /// Source text of the message being evaluated
    pub message: String,
    receiver: Option<Object>,
}

impl InvocationEntry {
    fn new(
        invocation: &Invocation,
        action: EntryAction,
        args: Vec<Object>,
        result_spec: MethodResult,
    ) -> Self {
        InvocationEntry {
            invocation: invocation.display_name(),
            action,
            args,
            result: None,
            exception: None,
            result_spec,
            modifiers: invocation.modifiers(),
            message: String::new(),
            receiver: None,
        }
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
    }

    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    /// Run the action and box its outcome. Every failure except cancellation
    /// is kept in `exception` and turned into an `Error` object.
    pub fn invoke(&mut self, ctx: &mut InvocationContext) -> Result<Object, Interrupted> {
        let outcome = self.run_action(ctx);
        let result = match outcome {
            Err(Error::Interrupted) => return Err(Interrupted),
            Err(e) => {
                self.exception = Some(e.clone());
                self.error_object(ctx, e)
            }
            Ok(returned) => match self.result_object(ctx, returned) {
                Ok(obj) => obj,
                Err(Error::Interrupted) => return Err(Interrupted),
                Err(e) => {
                    self.exception = Some(e.clone());
                    self.error_object(ctx, e)
                }
            },
        };
        self.result = Some(result.clone());
        Ok(result)
    }

    fn run_action(&self, ctx: &mut InvocationContext) -> Result<Returned, Error> {
        match &self.action {
            EntryAction::Method(method) => method.call(ctx, self.args.clone()),
            EntryAction::Primitive(f) => {
                let (receiver, rest) = self.split_receiver()?;
                let text = receiver.value().as_str().unwrap_or_default();
                let values: Vec<Value> = rest.iter().map(|o| o.value().clone()).collect();
                f(text, &values).map(Returned::Value)
            }
            EntryAction::Native(native, name) => {
                let (_, rest) = self.split_receiver()?;
                let values: Vec<Value> = rest.iter().map(|o| o.value().clone()).collect();
                native
                    .call_method(name, &values)
                    .unwrap_or_else(|| {
                        Err(Error::BadInstanceMethodInvocation {
                            type_name: native.type_name().to_string(),
                            name: name.clone(),
                        })
                    })
                    .map(Returned::Value)
            }
            EntryAction::RunFunction(function) => {
                let (subject, _) = self.split_receiver()?;
                function.run(subject.clone(), ctx).map(Returned::Object)
            }
            EntryAction::Constant(obj) => Ok(Returned::Object(obj.clone())),
            EntryAction::Construct(instance) => {
                let (source, rest) = self.split_receiver()?;
                construct_instance(instance, ctx, source.clone(), rest).map(Returned::Object)
            }
        }
    }

    fn split_receiver(&self) -> Result<(&Object, &[Object]), Error> {
        self.args
            .split_first()
            .ok_or_else(|| Error::BadExpression(format!("{}: no receiver", self.invocation)))
    }

    /// Box the returned value with the declared result type, applying negation
    fn result_object(&self, ctx: &mut InvocationContext, returned: Returned) -> Result<Object, Error> {
        if let Some(receiver) = &self.receiver {
            return Ok(receiver.clone());
        }
        let negate = self.modifiers.contains(Modifiers::NEGATE_RESULT);
        let obj = match returned {
            Returned::Object(obj) => obj,
            Returned::Value(value) => {
                let decl = self.result_spec.typedecl();
                if decl.is_any() {
                    ctx.new_object(value)
                } else {
                    let instance = decl.instantiate(ctx.type_module())?;
                    if instance.accepts(&value) {
                        Object::new(Arc::clone(&instance.ty), value)
                    } else {
                        let source = ctx.new_object(value);
                        construct_instance(&instance, ctx, source, &[])?
                    }
                }
            }
        };
        if negate {
            let negated = !obj.is_truth();
            return Ok(ctx.new_object(Value::Bool(negated)));
        }
        Ok(obj)
    }

    fn error_object(&self, ctx: &InvocationContext, error: Error) -> Object {
        let payload = ErrorObject::new(error).with_expression(self.message.clone());
        ctx.new_object(Value::Error(Arc::new(payload)))
    }
}
