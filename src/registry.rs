//! Type registry: a scoped name-to-type multimap with ancestor fallback.

use crate::Error;
use crate::object::Value;
use crate::types::{Type, TypeFlags, TypeRef, ValueKind};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, LazyLock, OnceLock};

/// Builds a type on first lookup
pub type TypeLoader = dyn Fn() -> Result<Type, Error> + Send + Sync;

struct DelayedType {
    loader: Box<TypeLoader>,
    cell: OnceLock<Result<TypeRef, Error>>,
}

enum TypeEntry {
    Ready(TypeRef),
    Delayed(DelayedType),
}

impl TypeEntry {
    fn materialize(&self, name: &str) -> Result<TypeRef, Error> {
        match self {
            TypeEntry::Ready(t) => Ok(Arc::clone(t)),
            TypeEntry::Delayed(d) => d
                .cell
                .get_or_init(|| {
                    tracing::debug!(typename = name, "loading delayed type");
                    (d.loader)().map(Type::into_ref)
                })
                .clone(),
        }
    }
}

struct ScopedEntry {
    scope: Option<String>,
    entry: TypeEntry,
}

static ANY_FALLBACK: LazyLock<TypeRef> =
    LazyLock::new(|| Type::new("Any", ValueKind::Any).flags(TypeFlags::ANY).into_ref());

/// Registry of types. Mutated only while booting, then shared by `Arc`.
#[derive(Default)]
pub struct TypeModule {
    types: HashMap<String, Vec<ScopedEntry>>,
    deduce_map: HashMap<ValueKind, TypeRef>,
    ancestors: Vec<Arc<TypeModule>>,
}

impl fmt::Debug for TypeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeModule")
            .field("types", &self.types.len())
            .field("ancestors", &self.ancestors.len())
            .finish()
    }
}

impl TypeModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Modules searched, in order, when a name is missing here
    pub fn add_ancestor(&mut self, module: Arc<TypeModule>) {
        self.ancestors.push(module);
    }

    fn insert(&mut self, name: String, scope: Option<String>, entry: TypeEntry) {
        let entries = self.types.entry(name).or_default();
        match entries.iter_mut().find(|e| e.scope == scope) {
            Some(existing) => existing.entry = entry,
            None => entries.push(ScopedEntry { scope, entry }),
        }
    }

    /// Register a type, replacing one with the same name and scope
    pub fn define(&mut self, ty: Type) -> TypeRef {
        self.define_ref(ty.into_ref())
    }

    pub fn define_ref(&mut self, ty: TypeRef) -> TypeRef {
        tracing::trace!(typename = ty.name(), scope = ?ty.get_scope(), "define type");
        if ty.get_flags().contains(TypeFlags::DEDUCIBLE) {
            self.deduce_map.insert(ty.kind(), Arc::clone(&ty));
        }
        self.insert(
            ty.name().to_string(),
            ty.get_scope().map(str::to_string),
            TypeEntry::Ready(Arc::clone(&ty)),
        );
        ty
    }

    /// Register an unloaded copy, so per-site customization does not leak
    pub fn define_copy(&mut self, ty: &Type) -> TypeRef {
        self.define(ty.copy())
    }

    /// Register a loader that runs on the first lookup of `name`
    pub fn define_delayed<F>(&mut self, name: &str, scope: Option<&str>, loader: F)
    where
        F: Fn() -> Result<Type, Error> + Send + Sync + 'static,
    {
        self.insert(
            name.to_string(),
            scope.map(str::to_string),
            TypeEntry::Delayed(DelayedType {
                loader: Box::new(loader),
                cell: OnceLock::new(),
            }),
        );
    }

    fn lookup(&self, name: &str, scope: Option<&str>) -> Option<Result<TypeRef, Error>> {
        if let Some(entries) = self.types.get(name) {
            let scoped = entries
                .iter()
                .find(|e| e.scope.as_deref() == scope)
                .or_else(|| entries.iter().find(|e| e.scope.is_none()));
            if let Some(e) = scoped {
                return Some(e.entry.materialize(name));
            }
        }
        self.ancestors.iter().find_map(|m| m.lookup(name, scope))
    }

    /// Type by name and scope; a failed delayed load counts as missing
    pub fn find(&self, name: &str, scope: Option<&str>) -> Option<TypeRef> {
        match self.lookup(name, scope)? {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!(typename = name, error = %e, "type failed to load");
                None
            }
        }
    }

    /// Type by name; a `scope.Name` name is looked up in that scope
    pub fn get(&self, name: &str) -> Result<TypeRef, Error> {
        match name.rsplit_once('.') {
            Some((scope, short)) if !scope.is_empty() && !short.is_empty() => {
                self.get_scoped(short, Some(scope))
            }
            _ => self.get_scoped(name, None),
        }
    }

    pub fn get_scoped(&self, name: &str, scope: Option<&str>) -> Result<TypeRef, Error> {
        self.lookup(name, scope)
            .unwrap_or_else(|| Err(Error::BadTypename(name.to_string())))
    }

    fn try_deduce(&self, value: &Value) -> Option<TypeRef> {
        if let Value::Native(native) = value {
            if let Some(t) = self.find(native.type_name(), None) {
                return Some(t);
            }
        }
        let kind = value.kind();
        if let Some(t) = self.deduce_map.get(&kind) {
            return Some(Arc::clone(t));
        }
        self.types
            .contains_key(kind.primitive_name())
            .then(|| self.find(kind.primitive_name(), None))
            .flatten()
            .or_else(|| self.ancestors.iter().find_map(|m| m.try_deduce(value)))
    }

    /// Type of a bare value; `Any` when nothing matches
    pub fn deduce(&self, value: &Value) -> TypeRef {
        self.try_deduce(value)
            .unwrap_or_else(|| Arc::clone(&ANY_FALLBACK))
    }

    /// Names of every type visible from this module, sorted
    pub fn type_names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        self.collect_names(&mut names);
        names.into_iter().collect()
    }

    fn collect_names(&self, names: &mut BTreeSet<String>) {
        names.extend(self.types.keys().cloned());
        for m in &self.ancestors {
            m.collect_names(names);
        }
    }
}

#[cfg(feature = "json")]
pub use declarative::DeclarativeDescriber;

#[cfg(feature = "json")]
mod declarative {
    use crate::Error;
    use crate::method::{Action, Method, MethodFlags, MethodParameter};
    use crate::types::{Describer, MethodTable, Type, TypeFlags, ValueKind};
    use serde_json::Value as Json;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Method table described by a JSON map, with actions bound by method name.
    ///
    /// ```text
    /// { "Typename": "Greeter", "Doc": "...", "Flags": ["NO_INSTANCE_METHOD"],
    ///   "Methods": [ { "Name": "greet", "Params": [ { "Name": "who", "Typename": "Str" } ],
    ///                  "Returns": { "Typename": "Str" }, "Aliases": ["hello"] } ] }
    /// ```
    #[derive(Debug)]
    pub struct DeclarativeDescriber {
        map: Json,
        actions: HashMap<String, Action>,
    }

    fn load_error(method: &str, reason: impl Into<String>) -> Error {
        Error::MethodLoad {
            method: method.to_string(),
            reason: reason.into(),
        }
    }

    fn str_field<'a>(obj: &'a Json, key: &str) -> Option<&'a str> {
        obj.get(key).and_then(Json::as_str)
    }

    fn flag_names(obj: &Json) -> impl Iterator<Item = &str> {
        obj.get("Flags")
            .and_then(Json::as_array)
            .into_iter()
            .flatten()
            .filter_map(Json::as_str)
    }

    impl DeclarativeDescriber {
        pub fn new(map: Json, actions: HashMap<String, Action>) -> Self {
            DeclarativeDescriber { map, actions }
        }

        pub fn typename(&self) -> Option<&str> {
            str_field(&self.map, "Typename")
        }

        pub fn type_flags(&self) -> Result<TypeFlags, Error> {
            flag_names(&self.map).try_fold(TypeFlags::empty(), |acc, name| {
                TypeFlags::from_name(name)
                    .map(|f| acc | f)
                    .ok_or_else(|| Error::BadTypename(format!("unknown type flag '{name}'")))
            })
        }

        /// Unloaded type whose methods come from this map
        pub fn into_type(self) -> Result<Type, Error> {
            let name = self
                .typename()
                .ok_or_else(|| Error::BadTypename("declarative map without Typename".into()))?
                .to_string();
            let doc = str_field(&self.map, "Doc").unwrap_or_default().to_string();
            let flags = self.type_flags()?;
            Ok(Type::new(name, ValueKind::Any)
                .doc(doc)
                .flags(flags)
                .describer(Describer::Declarative(Arc::new(self))))
        }

        fn param(method: &str, spec: &Json) -> Result<MethodParameter, Error> {
            let name = str_field(spec, "Name").ok_or_else(|| load_error(method, "parameter without Name"))?;
            let mut param = MethodParameter::new(name, str_field(spec, "Typename").unwrap_or("Any"))
                .doc(str_field(spec, "Doc").unwrap_or_default());
            if spec.get("Optional").and_then(Json::as_bool) == Some(true) {
                param = param.optional();
            }
            if spec.get("Variable").and_then(Json::as_bool) == Some(true) {
                param = param.variable();
            }
            Ok(param)
        }

        pub(crate) fn describe(&self, table: &mut MethodTable) -> Result<(), Error> {
            let methods = self
                .map
                .get("Methods")
                .and_then(Json::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for spec in methods {
                let name = str_field(spec, "Name")
                    .ok_or_else(|| load_error("?", "method without Name"))?;
                let action = self
                    .actions
                    .get(name)
                    .cloned()
                    .ok_or_else(|| load_error(name, "no action bound to this name"))?;
                let params = spec
                    .get("Params")
                    .and_then(Json::as_array)
                    .into_iter()
                    .flatten()
                    .map(|p| Self::param(name, p))
                    .collect::<Result<Vec<_>, _>>()?;
                let flags = flag_names(spec).try_fold(MethodFlags::empty(), |acc, f| {
                    MethodFlags::from_name(f)
                        .map(|bit| acc | bit)
                        .ok_or_else(|| load_error(name, format!("unknown flag '{f}'")))
                })?;
                let mut method = Method::new(name, action)
                    .doc(str_field(spec, "Doc").unwrap_or_default())
                    .params(params)
                    .flags(flags);
                if let Some(ret) = spec.get("Returns") {
                    if ret.get("Self").and_then(Json::as_bool) == Some(true) {
                        method = method.returns_self();
                    } else {
                        method = method.returns(str_field(ret, "Typename").unwrap_or("Any"));
                    }
                }
                let aliases: Vec<&str> = spec
                    .get("Aliases")
                    .and_then(Json::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Json::as_str)
                    .collect();
                table.add_with_aliases(method, &aliases)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn named(name: &str, kind: ValueKind) -> Type {
        Type::new(name, kind)
    }

    #[test]
    fn test_scoped_find() {
        let mut m = TypeModule::new();
        m.define(named("Path", ValueKind::Str).doc("plain"));
        m.define(named("Path", ValueKind::Str).scope("shell").doc("shell"));

        assert_eq!(m.find("Path", None).unwrap().get_doc(), "plain");
        assert_eq!(m.find("Path", Some("shell")).unwrap().get_doc(), "shell");
        // unknown scope falls back to the unscoped entry
        assert_eq!(m.find("Path", Some("web")).unwrap().get_doc(), "plain");
        assert_eq!(m.get("shell.Path").unwrap().get_doc(), "shell");
        assert_eq!(m.get("Nope").err().unwrap().kind_name(), "BadTypename");

        // redefinition replaces
        m.define(named("Path", ValueKind::Str).doc("replaced"));
        assert_eq!(m.find("Path", None).unwrap().get_doc(), "replaced");
    }

    #[test]
    fn test_ancestors_and_deduce() {
        let mut base = TypeModule::new();
        base.define(named("Int", ValueKind::Int).flags(TypeFlags::DEDUCIBLE));
        base.define(named("Str", ValueKind::Str));
        let base = Arc::new(base);

        let mut m = TypeModule::new();
        m.add_ancestor(Arc::clone(&base));
        m.define(named("Hex", ValueKind::Int));

        assert!(m.find("Int", None).is_some());
        assert_eq!(m.deduce(&Value::Int(3)).name(), "Int");
        assert_eq!(m.deduce(&Value::Str("x".into())).name(), "Str");
        assert_eq!(m.deduce(&Value::Float(1.0)).name(), "Any");
        assert_eq!(
            m.type_names(),
            vec!["Hex".to_string(), "Int".to_string(), "Str".to_string()]
        );
    }

    #[test]
    fn test_delayed_loads_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut m = TypeModule::new();
        m.define_delayed("Later", None, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Type::new("Later", ValueKind::Any))
        });
        m.define_delayed("Broken", None, || Err(Error::BadTypename("Broken".into())));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        let a = m.get("Later").unwrap();
        let b = m.get("Later").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(m.find("Broken", None).is_none());
        assert_eq!(m.get("Broken").err().unwrap().kind_name(), "BadTypename");
    }

    #[test]
    fn test_define_copy_is_unloaded() {
        let mut m = TypeModule::new();
        let original = Type::new("T", ValueKind::Any);
        original.load().unwrap();
        let copied = m.define_copy(&original);
        assert!(!copied.is_loaded());
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_declarative_describer() {
        use crate::method::Action;
        use crate::method::intooperation::IntoOperation;
        use crate::object::Object;
        use std::collections::HashMap;

        fn greet(_me: Object, who: String) -> String {
            format!("hello {who}")
        }

        let map = serde_json::json!({
            "Typename": "Greeter",
            "Doc": "says hello",
            "Flags": ["NO_INSTANCE_METHOD"],
            "Methods": [
                {
                    "Name": "greet",
                    "Params": [ { "Name": "who", "Typename": "Str" } ],
                    "Returns": { "Typename": "Str" },
                    "Aliases": ["hello"]
                }
            ]
        });
        let mut actions = HashMap::new();
        actions.insert(
            "greet".to_string(),
            Action::Plain(<_ as IntoOperation<(Object, String)>>::into_operation(greet)),
        );
        let ty = DeclarativeDescriber::new(map, actions).into_type().unwrap();
        assert_eq!(ty.name(), "Greeter");
        assert!(!ty.is_selectable_instance_method());
        let method = ty.select_method("hello").unwrap().unwrap();
        assert_eq!(method.name(), "greet");
        assert_eq!(method.get_signature(), "(who: Str) -> Str");

        let unbound = DeclarativeDescriber::new(
            serde_json::json!({ "Typename": "X", "Methods": [ { "Name": "missing" } ] }),
            HashMap::new(),
        )
        .into_type()
        .unwrap();
        assert_eq!(unbound.load().err().unwrap().kind_name(), "MethodLoadError");
    }
}
