use crate::Error;
use crate::function::FunctionExpr;
use crate::invocation::Invocation;
use crate::types::{TypeRef, ValueKind};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Host-provided value with its own attribute and method surface.
///
/// Instance-method invocations that find no type-bound method fall back to
/// `call_method` and then `get_attribute` at call time.
pub trait NativeObject: fmt::Debug + Send + Sync {
    /// Primitive type name, consulted by `TypeModule::deduce`
    fn type_name(&self) -> &str;

    fn stringify(&self) -> String {
        format!("<{}>", self.type_name())
    }

    fn get_attribute(&self, _name: &str) -> Option<Value> {
        None
    }

    /// `(min, max)` argument counts of a method, `None` if there is no such method
    fn method_arity(&self, _name: &str) -> Option<(usize, usize)> {
        None
    }

    /// `None` means the object has no method of that name.
    fn call_method(&self, _name: &str, _args: &[Value]) -> Option<Result<Value, Error>> {
        None
    }
}

/// Payload of an `Error` typed object
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorObject {
    pub error: Error,
    /// Source text of the message that failed
    pub expression: String,
    /// Source already consumed by the reducer at the failure point
    pub read: String,
    /// Source not yet consumed at the failure point
    pub unread: String,
}

impl ErrorObject {
    pub fn new(error: Error) -> Self {
        ErrorObject {
            error,
            expression: String::new(),
            read: String::new(),
            unread: String::new(),
        }
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = expression.into();
        self
    }

    pub fn with_location(mut self, read: impl Into<String>, unread: impl Into<String>) -> Self {
        self.read = read.into();
        self.unread = unread.into();
        self
    }

    /// Short one-line description: kind name and message
    pub fn summarize(&self) -> String {
        format!("{}: {}", self.error.kind_name(), self.error.root())
    }
}

/// Runtime payload of an [`Object`]. There is deliberately no variant holding
/// an `Object`, so a value can never be a bare wrapped object.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Object>),
    Type(TypeRef),
    Function(Arc<FunctionExpr>),
    Invocation(Arc<Invocation>),
    Collection(Arc<ObjectCollection>),
    Error(Arc<ErrorObject>),
    Native(Arc<dyn NativeObject>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        ValueKind::of(self)
    }

    /// Truthiness used by `truth`, `falsy` and the conditional methods
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Collection(c) => !c.is_empty(),
            Value::Error(_) => false,
            Value::Type(_) | Value::Function(_) | Value::Invocation(_) | Value::Native(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view; Int widens to Float and Bool to 0/1
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.value == y.value)
            }
            (Value::Type(a), Value::Type(b)) => Arc::ptr_eq(a, b) || a.name() == b.name(),
            (Value::Function(a), Value::Function(b)) => a.source() == b.source(),
            (Value::Invocation(a), Value::Invocation(b)) => Arc::ptr_eq(a, b),
            (Value::Collection(a), Value::Collection(b)) => Arc::ptr_eq(a, b),
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Native(a), Value::Native(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(n) => write!(f, "Int({n})"),
            Value::Float(x) => write!(f, "Float({x:?})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Tuple(items) => f.debug_tuple("Tuple").field(items).finish(),
            Value::Type(t) => write!(f, "Type({})", t.name()),
            Value::Function(func) => write!(f, "Function({:?})", func.source()),
            Value::Invocation(inv) => write!(f, "Invocation({})", inv.display_name()),
            Value::Collection(c) => write!(f, "Collection({} items)", c.len()),
            Value::Error(e) => write!(f, "Error({})", e.summarize()),
            Value::Native(n) => write!(f, "Native({n:?})"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Tuple(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
            Value::Type(t) => write!(f, "<Type {}>", t.name()),
            Value::Function(func) => write!(f, "{}", func.source()),
            Value::Invocation(inv) => write!(f, "<Invocation {}>", inv.display_name()),
            Value::Collection(c) => write!(f, "<ObjectCollection {} items>", c.len()),
            Value::Error(e) => write!(f, "{}", e.summarize()),
            Value::Native(n) => write!(f, "{}", n.stringify()),
        }
    }
}

/// A runtime value paired with its type
#[derive(Clone)]
pub struct Object {
    ty: TypeRef,
    value: Value,
}

impl Object {
    pub fn new(ty: TypeRef, value: Value) -> Self {
        Object { ty, value }
    }

    pub fn get_typename(&self) -> &str {
        self.ty.name()
    }

    pub fn ty(&self) -> &TypeRef {
        &self.ty
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub(crate) fn take_value(&mut self) -> Value {
        std::mem::replace(&mut self.value, Value::None)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.value, Value::Error(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self.value, Value::None)
    }

    pub fn is_truth(&self) -> bool {
        self.value.is_truthy()
    }

    pub fn is_object_collection(&self) -> bool {
        matches!(self.value, Value::Collection(_))
    }

    pub fn get_error(&self) -> Option<&ErrorObject> {
        match &self.value {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Text produced by the type's stringifier, or the value's own display
    pub fn stringify(&self) -> String {
        self.ty.stringify(&self.value)
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}> {:?}", self.ty.name(), self.value)
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stringify())
    }
}

/// One binding in an [`ObjectCollection`]
#[derive(Debug, Clone)]
pub struct Item {
    pub ident: usize,
    pub name: String,
    pub object: Object,
    pub selected: bool,
}

/// Ordered, name-keyed multimap of objects.
///
/// `push` keeps history under the same name, `store` overwrites the latest
/// binding. Names missing locally may be answered by the delegation object.
#[derive(Debug, Clone, Default)]
pub struct ObjectCollection {
    items: Vec<Item>,
    names: HashMap<String, Vec<usize>>,
    delegation: Option<Box<Object>>,
}

impl ObjectCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Add a new binding, keeping earlier bindings of the same name
    pub fn push(&mut self, name: impl Into<String>, object: Object) -> &Item {
        let name = name.into();
        let ident = self.items.len();
        self.names.entry(name.clone()).or_default().push(ident);
        self.items.push(Item {
            ident,
            name,
            object,
            selected: false,
        });
        &self.items[ident]
    }

    /// Overwrite the latest binding of `name`, or push when absent
    pub fn store(&mut self, name: impl Into<String>, object: Object) -> &Item {
        let name = name.into();
        match self.names.get(&name).and_then(|ids| ids.last().copied()) {
            Some(ident) => {
                self.items[ident].object = object;
                &self.items[ident]
            }
            None => self.push(name, object),
        }
    }

    /// Latest binding of `name`
    pub fn get(&self, name: &str) -> Option<&Item> {
        let ident = *self.names.get(name)?.last()?;
        self.items.get(ident)
    }

    pub fn get_all(&self, name: &str) -> Vec<&Item> {
        self.names
            .get(name)
            .map(|ids| ids.iter().filter_map(|i| self.items.get(*i)).collect())
            .unwrap_or_default()
    }

    /// Mark an item as selected. Returns false if the ident is unknown.
    pub fn select(&mut self, ident: usize, selected: bool) -> bool {
        match self.items.get_mut(ident) {
            Some(item) => {
                item.selected = selected;
                true
            }
            None => false,
        }
    }

    pub fn pick_all(&self) -> impl Iterator<Item = &Item> {
        self.items.iter().filter(|item| item.selected)
    }

    /// Remove every binding of `name`. Returns the number of removed items.
    pub fn delete(&mut self, name: &str) -> usize {
        let before = self.items.len();
        self.items.retain(|item| item.name != name);
        let removed = before - self.items.len();
        if removed > 0 {
            self.reindex();
        }
        removed
    }

    fn reindex(&mut self) {
        self.names.clear();
        for (ident, item) in self.items.iter_mut().enumerate() {
            item.ident = ident;
            self.names.entry(item.name.clone()).or_default().push(ident);
        }
    }

    /// The `n`-th most recent binding, 1-based
    pub fn get_previous(&self, n: usize) -> Option<&Item> {
        if n == 0 {
            return None;
        }
        self.items.len().checked_sub(n).and_then(|i| self.items.get(i))
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.iter()
    }

    pub fn set_delegation(&mut self, object: Option<Object>) {
        self.delegation = object.map(Box::new);
    }

    pub fn get_delegation(&self) -> Option<&Object> {
        self.delegation.as_deref()
    }
}
