use crate::Error;
use crate::context::InvocationContext;
use crate::method::{Method, MethodParameter};
use crate::object::{Object, Value};
use crate::registry::TypeModule;
use bitflags::bitflags;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Shared handle to a registered type
pub type TypeRef = Arc<Type>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeFlags: u32 {
        /// Accepts values of any kind
        const ANY = 0x1;
        /// Receivers of this type resolve selectors as member names first
        const OBJECT_COLLECTION = 0x2;
        /// Selectors missing from the method table are errors, not instance methods
        const NO_INSTANCE_METHOD = 0x4;
        /// Registered in the module's deduce map for its value kind
        const DEDUCIBLE = 0x8;
    }
}

/// Kind of runtime payload a type carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Any,
    None,
    Bool,
    Int,
    Float,
    Str,
    Tuple,
    Type,
    Function,
    Invocation,
    Collection,
    Error,
    Native,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::None => ValueKind::None,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Tuple(_) => ValueKind::Tuple,
            Value::Type(_) => ValueKind::Type,
            Value::Function(_) => ValueKind::Function,
            Value::Invocation(_) => ValueKind::Invocation,
            Value::Collection(_) => ValueKind::Collection,
            Value::Error(_) => ValueKind::Error,
            Value::Native(_) => ValueKind::Native,
        }
    }

    /// Name of the fundamental type holding values of this kind
    pub fn primitive_name(self) -> &'static str {
        match self {
            ValueKind::Any => "Any",
            ValueKind::None => "None",
            ValueKind::Bool => "Bool",
            ValueKind::Int => "Int",
            ValueKind::Float => "Float",
            ValueKind::Str => "Str",
            ValueKind::Tuple => "Tuple",
            ValueKind::Type => "Type",
            ValueKind::Function => "Function",
            ValueKind::Invocation => "Invocation",
            ValueKind::Collection => "ObjectCollection",
            ValueKind::Error => "Error",
            ValueKind::Native => "Any",
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        self == ValueKind::Any || self == ValueKind::of(value)
    }
}

/// Builds a method table for a native type
pub type DescribeFn = dyn Fn(&mut MethodTable) -> Result<(), Error> + Send + Sync;

/// Converts a source object into a value of the type, given the bound type
/// arguments and any extra constructor arguments
pub type ConstructorFn = dyn Fn(&mut InvocationContext, Object, &[TypeInstance], &[Object]) -> Result<Value, Error>
    + Send
    + Sync;

pub type StringifyFn = dyn Fn(&Value) -> String + Send + Sync;

/// Source of a type's method table
#[derive(Clone, Default)]
pub enum Describer {
    #[default]
    Empty,
    Native(Arc<DescribeFn>),
    #[cfg(feature = "json")]
    Declarative(Arc<crate::registry::DeclarativeDescriber>),
}

impl fmt::Debug for Describer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Describer::Empty => write!(f, "Empty"),
            Describer::Native(_) => write!(f, "Native"),
            #[cfg(feature = "json")]
            Describer::Declarative(_) => write!(f, "Declarative"),
        }
    }
}

enum Alias {
    Name(String),
    Group(Vec<String>),
}

/// Loaded methods, aliases and meta methods of a type
#[derive(Default)]
pub struct MethodTable {
    methods: Vec<Arc<Method>>,
    index: HashMap<String, usize>,
    aliases: HashMap<String, Alias>,
    constructor: Option<Arc<ConstructorFn>>,
    ctor_params: Vec<MethodParameter>,
    type_params: Vec<MethodParameter>,
    stringify: Option<Arc<StringifyFn>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method. Names must be unique within the table.
    pub fn add(&mut self, method: Method) -> Result<(), Error> {
        let name = method.name().to_string();
        if self.index.contains_key(&name) {
            return Err(Error::BadMethodName(format!("{name}: duplicated method name")));
        }
        method.validate()?;
        self.index.insert(name, self.methods.len());
        self.methods.push(Arc::new(method));
        Ok(())
    }

    /// Register a method along with alias names
    pub fn add_with_aliases(&mut self, method: Method, aliases: &[&str]) -> Result<(), Error> {
        let name = method.name().to_string();
        self.add(method)?;
        for alias in aliases {
            self.alias(alias, &name)?;
        }
        Ok(())
    }

    pub fn alias(&mut self, alias: &str, target: &str) -> Result<(), Error> {
        if !self.index.contains_key(target) {
            return Err(Error::BadMethodName(format!(
                "{alias}: alias of undefined method '{target}'"
            )));
        }
        self.aliases
            .insert(alias.to_string(), Alias::Name(target.to_string()));
        Ok(())
    }

    /// Name a group of members
    pub fn group(&mut self, name: &str, members: &[&str]) {
        self.aliases.insert(
            name.to_string(),
            Alias::Group(members.iter().map(|m| m.to_string()).collect()),
        );
    }

    pub fn set_constructor<F>(&mut self, params: Vec<MethodParameter>, ctor: F)
    where
        F: Fn(&mut InvocationContext, Object, &[TypeInstance], &[Object]) -> Result<Value, Error>
            + Send
            + Sync
            + 'static,
    {
        self.ctor_params = params;
        self.constructor = Some(Arc::new(ctor));
    }

    /// Parameters bound by `T[A, B]` or by the leading arguments of `T: A B`
    pub fn set_type_params(&mut self, params: Vec<MethodParameter>) {
        self.type_params = params;
    }

    pub fn set_stringifier<F>(&mut self, f: F)
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.stringify = Some(Arc::new(f));
    }

    /// Look up by method name, then by alias
    pub fn get(&self, name: &str) -> Option<&Arc<Method>> {
        if let Some(i) = self.index.get(name) {
            return self.methods.get(*i);
        }
        match self.aliases.get(name)? {
            Alias::Name(target) => self.index.get(target).and_then(|i| self.methods.get(*i)),
            Alias::Group(_) => None,
        }
    }

    pub fn get_member_group(&self, name: &str) -> Option<Vec<String>> {
        match self.aliases.get(name)? {
            Alias::Name(target) => Some(vec![target.clone()]),
            Alias::Group(members) => Some(members.clone()),
        }
    }

    /// Canonical name first, then every alias pointing at it
    pub fn get_identical_names(&self, name: &str) -> Vec<String> {
        let truename = match self.aliases.get(name) {
            Some(Alias::Name(target)) => target.clone(),
            _ => name.to_string(),
        };
        let mut names = vec![truename.clone()];
        let mut aliases: Vec<&String> = self
            .aliases
            .iter()
            .filter(|(_, a)| matches!(a, Alias::Name(t) if *t == truename))
            .map(|(k, _)| k)
            .collect();
        aliases.sort();
        names.extend(aliases.into_iter().cloned());
        names
    }

    pub fn methods(&self) -> &[Arc<Method>] {
        &self.methods
    }

    pub fn constructor(&self) -> Option<&Arc<ConstructorFn>> {
        self.constructor.as_ref()
    }

    pub fn constructor_params(&self) -> &[MethodParameter] {
        &self.ctor_params
    }

    pub fn type_params(&self) -> &[MethodParameter] {
        &self.type_params
    }
}

/// A named type: flags, value kind and a lazily loaded method table
pub struct Type {
    name: String,
    scope: Option<String>,
    doc: String,
    flags: TypeFlags,
    kind: ValueKind,
    describer: Describer,
    table: OnceLock<Result<MethodTable, Error>>,
}

impl Type {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Type {
            name: name.into(),
            scope: None,
            doc: String::new(),
            flags: TypeFlags::empty(),
            kind,
            describer: Describer::Empty,
            table: OnceLock::new(),
        }
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    pub fn flags(mut self, flags: TypeFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn describe<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut MethodTable) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.describer = Describer::Native(Arc::new(f));
        self
    }

    pub fn describer(mut self, describer: Describer) -> Self {
        self.describer = describer;
        self
    }

    pub fn into_ref(self) -> TypeRef {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn get_doc(&self) -> &str {
        &self.doc
    }

    pub fn get_flags(&self) -> TypeFlags {
        self.flags
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn is_any(&self) -> bool {
        self.flags.contains(TypeFlags::ANY)
    }

    pub fn is_object_collection(&self) -> bool {
        self.flags.contains(TypeFlags::OBJECT_COLLECTION)
    }

    pub fn is_selectable_instance_method(&self) -> bool {
        !self.flags.contains(TypeFlags::NO_INSTANCE_METHOD)
    }

    pub fn is_loaded(&self) -> bool {
        self.table.get().is_some()
    }

    /// Interpret the describer once; later calls return the same table or error
    pub fn load(&self) -> Result<&MethodTable, Error> {
        self.table
            .get_or_init(|| {
                tracing::trace!(typename = %self.name, "loading method table");
                let mut table = MethodTable::new();
                match &self.describer {
                    Describer::Empty => {}
                    Describer::Native(describe) => describe(&mut table)?,
                    #[cfg(feature = "json")]
                    Describer::Declarative(decl) => decl.describe(&mut table)?,
                }
                Ok(table)
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    /// Find a method by name or alias; `_` and `-` are interchangeable
    pub fn select_method(&self, name: &str) -> Result<Option<Arc<Method>>, Error> {
        let table = self.load()?;
        let name = normalize_method_name(name);
        Ok(table.get(&name).cloned())
    }

    pub fn is_selectable_method(&self, name: &str) -> bool {
        matches!(self.select_method(name), Ok(Some(_)))
    }

    pub fn accepts(&self, value: &Value) -> bool {
        self.is_any() || self.kind.accepts(value)
    }

    pub fn stringify(&self, value: &Value) -> String {
        match self.load() {
            Ok(table) => match &table.stringify {
                Some(f) => f(value),
                None => value.to_string(),
            },
            Err(_) => value.to_string(),
        }
    }

    /// Fresh unloaded copy sharing the same describer
    pub fn copy(&self) -> Type {
        Type {
            name: self.name.clone(),
            scope: self.scope.clone(),
            doc: self.doc.clone(),
            flags: self.flags,
            kind: self.kind,
            describer: self.describer.clone(),
            table: OnceLock::new(),
        }
    }

    pub fn new_object(self: &Arc<Self>, value: Value) -> Object {
        Object::new(Arc::clone(self), value)
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Type")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("flags", &self.flags)
            .field("kind", &self.kind)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

pub fn normalize_method_name(name: &str) -> String {
    name.replace('_', "-")
}

/// A type with its type parameters bound, e.g. `Tuple[Int]`
#[derive(Debug, Clone)]
pub struct TypeInstance {
    pub ty: TypeRef,
    pub args: Vec<TypeInstance>,
}

impl TypeInstance {
    pub fn new(ty: TypeRef) -> Self {
        TypeInstance {
            ty,
            args: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.ty.name()
    }

    /// Whether a value can be boxed as this type without conversion
    pub fn accepts(&self, value: &Value) -> bool {
        self.args.is_empty() && self.ty.accepts(value)
    }
}

impl fmt::Display for TypeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ty.name())?;
        if !self.args.is_empty() {
            let args: Vec<String> = self.args.iter().map(ToString::to_string).collect();
            write!(f, "[{}]", args.join(", "))?;
        }
        Ok(())
    }
}

/// Build an object of type `ty` from `source`
pub fn construct_obj(
    ty: &TypeRef,
    ctx: &mut InvocationContext,
    source: Object,
    args: &[Object],
) -> Result<Object, Error> {
    construct_instance(&TypeInstance::new(Arc::clone(ty)), ctx, source, args)
}

/// Build an object of the instantiated type from `source`.
///
/// An object already of an unparameterized type is returned as is. Otherwise
/// the type's constructor runs with the bound type arguments; without one,
/// values whose kind already fits are re-tagged.
pub fn construct_instance(
    instance: &TypeInstance,
    ctx: &mut InvocationContext,
    source: Object,
    args: &[Object],
) -> Result<Object, Error> {
    let ty = &instance.ty;
    if args.is_empty() && instance.args.is_empty() && source.ty().name() == ty.name() {
        return Ok(source);
    }
    let table = ty.load()?;
    if instance.args.len() > table.type_params().len() {
        return Err(Error::TypeError(format!(
            "'{}' takes {} type argument(s), got {}",
            ty.name(),
            table.type_params().len(),
            instance.args.len()
        )));
    }
    if let Some(ctor) = table.constructor() {
        let ctor = Arc::clone(ctor);
        let value = ctor(ctx, source, &instance.args, args)?;
        return Ok(Object::new(Arc::clone(ty), value));
    }
    if ty.is_any() {
        return Ok(source);
    }
    if ty.kind().accepts(source.value()) {
        return Ok(Object::new(Arc::clone(ty), source.into_value()));
    }
    Err(Error::TypeError(format!(
        "cannot construct '{}' from '{}'",
        ty.name(),
        source.get_typename()
    )))
}

/// Parsed type expression: `Int`, `Tuple: Int` or `Tuple[Int]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDecl {
    pub name: String,
    pub args: Vec<TypeDecl>,
}

impl TypeDecl {
    pub fn new(name: impl Into<String>) -> Self {
        TypeDecl {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn any() -> Self {
        Self::new("Any")
    }

    pub fn parse(expr: &str) -> Result<Self, Error> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(Self::any());
        }
        if let Some(open) = expr.find('[') {
            let inner = expr[open + 1..]
                .strip_suffix(']')
                .ok_or_else(|| Error::BadTypename(format!("unclosed type arguments: {expr}")))?;
            let args = split_type_args(inner)
                .into_iter()
                .map(TypeDecl::parse)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(TypeDecl {
                name: expr[..open].trim().to_string(),
                args,
            });
        }
        if let Some((name, rest)) = expr.split_once(':') {
            let args = split_type_args(rest)
                .into_iter()
                .map(TypeDecl::parse)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(TypeDecl {
                name: name.trim().to_string(),
                args,
            });
        }
        if !expr
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
        {
            return Err(Error::BadTypename(expr.to_string()));
        }
        Ok(Self::new(expr))
    }

    pub fn is_any(&self) -> bool {
        self.name == "Any" && self.args.is_empty()
    }

    /// Resolve the declared type in `module` and bind its type arguments
    pub fn instantiate(&self, module: &TypeModule) -> Result<TypeInstance, Error> {
        let ty = module.get(&self.name)?;
        let args = self
            .args
            .iter()
            .map(|arg| arg.instantiate(module))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TypeInstance { ty, args })
    }
}

impl fmt::Display for TypeDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.args.is_empty() {
            let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
            write!(f, "[{}]", args.join(", "))?;
        }
        Ok(())
    }
}

fn split_type_args(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = s[start..].trim();
    if !last.is_empty() {
        parts.push(last);
    }
    parts
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::method::Method;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo_value(v: Value) -> Value {
        v
    }

    fn greater(a: i64, b: i64) -> bool {
        a > b
    }

    fn always(_s: &str) -> bool {
        true
    }

    fn echo() -> Method {
        Method::function::<(Value,), _>("echo", echo_value)
    }

    #[test]
    fn test_typedecl_parse() {
        let cases: Vec<(&str, TypeDecl)> = vec![
            ("Int", TypeDecl::new("Int")),
            ("", TypeDecl::any()),
            (
                "Tuple: Int",
                TypeDecl {
                    name: "Tuple".into(),
                    args: vec![TypeDecl::new("Int")],
                },
            ),
            (
                "Tuple[Str]",
                TypeDecl {
                    name: "Tuple".into(),
                    args: vec![TypeDecl::new("Str")],
                },
            ),
            (
                "Map[Str, Tuple[Int]]",
                TypeDecl {
                    name: "Map".into(),
                    args: vec![
                        TypeDecl::new("Str"),
                        TypeDecl {
                            name: "Tuple".into(),
                            args: vec![TypeDecl::new("Int")],
                        },
                    ],
                },
            ),
        ];
        for (expr, expected) in cases {
            assert_eq!(TypeDecl::parse(expr).unwrap(), expected, "typedecl {expr:?}");
        }
        assert!(TypeDecl::parse("Tuple[Int").is_err());
        assert!(TypeDecl::parse("no spaces").is_err());
        assert_eq!(
            TypeDecl::parse("Tuple: Int").unwrap().to_string(),
            "Tuple[Int]"
        );
    }

    #[test]
    fn test_instantiate_binds_type_arguments() {
        let module = crate::fundamental::fundamental_module();
        let mut ctx = InvocationContext::instant(None);
        for expr in ["Tuple[Int]", "Tuple: Int"] {
            let instance = TypeDecl::parse(expr).unwrap().instantiate(&module).unwrap();
            assert_eq!(instance.to_string(), "Tuple[Int]");
            assert!(!instance.accepts(&Value::Tuple(Vec::new())));

            let source = ctx.new_object(Value::Str("4 5".into()));
            let tuple = construct_instance(&instance, &mut ctx, source, &[]).unwrap();
            let Value::Tuple(items) = tuple.value() else {
                panic!("{expr}: expected a Tuple, got {tuple:?}");
            };
            let values: Vec<&Value> = items.iter().map(Object::value).collect();
            assert_eq!(values, vec![&Value::Int(4), &Value::Int(5)], "{expr}");
            assert!(items.iter().all(|o| o.get_typename() == "Int"), "{expr}");
        }

        let plain = TypeDecl::new("Tuple").instantiate(&module).unwrap();
        assert!(plain.accepts(&Value::Tuple(Vec::new())));

        let too_many = TypeDecl::parse("Int[Str]").unwrap().instantiate(&module).unwrap();
        let source = ctx.new_object(Value::Int(1));
        let err = construct_instance(&too_many, &mut ctx, source, &[]).unwrap_err();
        assert_eq!(err.kind_name(), "TypeError");
        assert!(TypeDecl::parse("Tuple[Nothing]").unwrap().instantiate(&module).is_err());
    }

    #[test]
    fn test_load_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let ty = Type::new("Echo", ValueKind::Any).describe(move |table| {
            counter.fetch_add(1, Ordering::SeqCst);
            table.add_with_aliases(echo(), &["say"])
        });
        assert!(!ty.is_loaded());
        assert!(ty.select_method("echo").unwrap().is_some());
        assert!(ty.select_method("say").unwrap().is_some());
        assert!(ty.select_method("shout").unwrap().is_none());
        assert!(ty.is_loaded());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let copied = ty.copy();
        assert!(!copied.is_loaded());
        assert!(copied.is_selectable_method("echo"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_duplicate_and_bad_alias() {
        let ty = Type::new("Dup", ValueKind::Any).describe(|table| {
            table.add(echo())?;
            table.add(echo())
        });
        let err = ty.load().err().unwrap();
        assert_eq!(err.kind_name(), "BadMethodName");
        // the failure is remembered
        assert!(ty.select_method("echo").is_err());

        let mut table = MethodTable::new();
        assert!(table.alias("x", "missing").is_err());
    }

    #[test]
    fn test_aliases_and_groups() {
        let mut table = MethodTable::new();
        table
            .add_with_aliases(Method::function::<(i64, i64), _>("greater", greater), &[">", "gt"])
            .unwrap();
        table.group("compare", &["greater", "less"]);
        assert_eq!(table.get("gt").unwrap().name(), "greater");
        assert!(table.get("compare").is_none());
        assert_eq!(
            table.get_member_group("compare").unwrap(),
            vec!["greater".to_string(), "less".to_string()]
        );
        assert_eq!(
            table.get_identical_names("gt"),
            vec!["greater".to_string(), ">".to_string(), "gt".to_string()]
        );
    }

    #[test]
    fn test_normalized_names() {
        let ty = Type::new("N", ValueKind::Any).describe(|table| {
            table.add(Method::function::<(&str,), _>("reg-match", always))
        });
        assert!(ty.is_selectable_method("reg_match"));
        assert!(ty.is_selectable_method("reg-match"));
    }
}
