//! Selector resolution: from a selector token (or an object standing in for
//! one) and a receiver to an [`Invocation`].

use crate::context::InvocationContext;
use crate::generic::resolve_generic_method;
use crate::invocation::{Invocation, MemberRedirector, Modifiers};
use crate::literal::parse_literal;
use crate::object::{Object, Value};
use crate::types::TypeDecl;
use crate::Error;
use std::fmt;
use std::sync::Arc;

const PREFIX_SIGILS: [char; 3] = ['!', '~', '`'];
// longest first
const SUFFIX_SIGILS: [&str; 3] = [":>", ":", "?"];
const TYPE_METHOD_SEPARATOR: char = '/';
const INDEX_METHOD: &str = "at";

/// A selector name with its modifier affixes split off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffixedSelector {
    name: String,
    modifiers: Modifiers,
}

impl AffixedSelector {
    /// `~!name:` is `name` with reverse-args, negate-result and trailing-args.
    /// Affixes are kept as part of the name unless what remains starts with
    /// a letter or digit, so `!=` and `<=` are plain names.
    pub fn parse(token: &str) -> Self {
        let plain = || AffixedSelector {
            name: token.to_string(),
            modifiers: Modifiers::empty(),
        };
        if token.chars().count() < 2 {
            return plain();
        }

        let mut modifiers = Modifiers::empty();
        let mut rest = token;
        while let Some(c) = rest.chars().next().filter(|c| PREFIX_SIGILS.contains(c)) {
            modifiers |= Modifiers::from_sigil(&c.to_string()).unwrap_or_default();
            rest = &rest[c.len_utf8()..];
        }
        for suffix in SUFFIX_SIGILS {
            if let Some(stripped) = rest.strip_suffix(suffix) {
                modifiers |= Modifiers::from_sigil(suffix).unwrap_or_default();
                rest = stripped;
                break;
            }
        }

        if !rest.starts_with(char::is_alphanumeric) {
            return plain();
        }
        AffixedSelector {
            name: rest.to_string(),
            modifiers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn modifiers(&self) -> Modifiers {
        self.modifiers
    }

    pub fn has(&self, modifier: Modifiers) -> bool {
        self.modifiers.contains(modifier)
    }
}

impl fmt::Display for AffixedSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.modifiers.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} [{}]", self.name, self.modifiers.display_names())
        }
    }
}

fn index_invocation(index: i64, modifiers: Modifiers) -> Result<Invocation, Error> {
    let at = resolve_generic_method(INDEX_METHOD)?
        .ok_or_else(|| Error::BadMethodName(INDEX_METHOD.into()))?;
    Ok(Invocation::Bind1st {
        invocation: Box::new(Invocation::Function {
            method: at,
            modifiers: Modifiers::empty(),
        }),
        arg: Value::Int(index),
        argtype: "Int".into(),
        modifiers,
    })
}

/// Resolve a selector name against a receiver.
///
/// Order: index digits, `Type/method`, type constructor, collection member,
/// the receiver type's method table, generic methods, and finally a method
/// looked up on the receiver value when it is invoked.
pub fn select_method(
    ctx: &InvocationContext,
    name: &str,
    receiver: Option<&Object>,
    modifiers: Modifiers,
) -> Result<Invocation, Error> {
    if name.is_empty() {
        return Err(Error::BadMethodName("empty selector".into()));
    }
    let is_collection = receiver.is_some_and(Object::is_object_collection);

    if !is_collection && name.chars().all(|c| c.is_ascii_digit()) {
        let index = name
            .parse::<i64>()
            .map_err(|_| Error::BadMethodName(name.to_string()))?;
        return index_invocation(index, modifiers);
    }

    if name.starts_with(char::is_uppercase) {
        if let Some((typename, method_name)) = name.split_once(TYPE_METHOD_SEPARATOR) {
            let ty = ctx.get_type(typename)?;
            let method = ty
                .select_method(method_name)?
                .ok_or_else(|| Error::BadMethodName(format!("{typename}/{method_name}")))?;
            return Ok(Invocation::TypeMethod {
                ty,
                method,
                modifiers,
            });
        }
        return Ok(Invocation::type_constructor(ctx, TypeDecl::parse(name)?, modifiers));
    }

    if let Some(receiver) = receiver {
        if is_collection && !modifiers.contains(Modifiers::BASIC_RECEIVER) {
            let mut redirect = Invocation::ObjectMember(MemberRedirector::new(name, modifiers));
            redirect.resolve_member(ctx, receiver)?;
            return Ok(redirect);
        }
        let ty = receiver.ty();
        if let Some(method) = ty.select_method(name)? {
            tracing::trace!(typename = %ty.name(), name, "type method selected");
            return Ok(Invocation::TypeMethod {
                ty: Arc::clone(ty),
                method,
                modifiers,
            });
        }
    }

    if let Some(method) = resolve_generic_method(name)? {
        return Ok(Invocation::Function { method, modifiers });
    }

    if let Some(receiver) = receiver {
        if !receiver.ty().is_selectable_instance_method() {
            return Err(Error::BadExpression(format!(
                "'{}' has no method '{name}'",
                receiver.get_typename()
            )));
        }
    }
    let (min_arity, max_arity) = match receiver.map(Object::value) {
        Some(Value::Str(_)) => crate::fundamental::str_instance_method(name)
            .map_or((0, 0), |m| (m.min, m.max)),
        Some(Value::Native(native)) => native.method_arity(name).unwrap_or((0, 0)),
        _ => (0, 0),
    };
    Ok(Invocation::InstanceMethod {
        name: name.to_string(),
        min_arity,
        max_arity,
        modifiers,
    })
}

/// Resolve an object standing in the selector position, e.g. a block result
pub fn select_method_by_object(
    ctx: &InvocationContext,
    selector: &Object,
    receiver: Option<&Object>,
    modifiers: Modifiers,
) -> Result<Invocation, Error> {
    match selector.value() {
        Value::Int(n) => index_invocation(*n, modifiers),
        Value::Type(ty) => Ok(Invocation::type_constructor(
            ctx,
            TypeDecl::new(ty.name()),
            modifiers,
        )),
        Value::Str(text) => {
            let affixed = AffixedSelector::parse(text);
            select_method(ctx, affixed.name(), receiver, affixed.modifiers() | modifiers)
        }
        Value::Invocation(inv) => Ok(inv.as_ref().clone().with_modifiers(modifiers)),
        Value::Function(function) => Ok(Invocation::Message {
            function: Arc::clone(function),
            modifiers,
        }),
        _ => Err(Error::BadExpression(format!(
            "'{}' object cannot be used as a selector",
            selector.get_typename()
        ))),
    }
}

/// A `Type` object for a type expression, if the type exists
pub fn select_type(ctx: &InvocationContext, expr: &str) -> Option<Object> {
    let decl = TypeDecl::parse(expr).ok()?;
    let ty = ctx.select_type(&decl.name)?;
    Some(ctx.new_object(Value::Type(ty)))
}

/// A scalar literal boxed with its deduced type
pub fn select_literal(ctx: &InvocationContext, text: &str) -> Object {
    ctx.new_object(parse_literal(text))
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::object::ObjectCollection;

    #[test]
    fn test_affixed_selector() {
        let cases: Vec<(&str, &str, Modifiers)> = vec![
            ("add", "add", Modifiers::empty()),
            ("!equal", "equal", Modifiers::NEGATE_RESULT),
            ("~sub", "sub", Modifiers::REVERSE_ARGS),
            ("`length", "length", Modifiers::BASIC_RECEIVER),
            ("slice:", "slice", Modifiers::TRAILING_ARGS),
            ("join:>", "join", Modifiers::CONSUME_ARGS),
            ("add?", "add", Modifiers::SHOW_HELP),
            (
                "!~in:",
                "in",
                Modifiers::NEGATE_RESULT
                    .union(Modifiers::REVERSE_ARGS)
                    .union(Modifiers::TRAILING_ARGS),
            ),
            // operators keep their sigils
            ("!=", "!=", Modifiers::empty()),
            ("<=", "<=", Modifiers::empty()),
            ("~", "~", Modifiers::empty()),
            ("!", "!", Modifiers::empty()),
            ("!<", "!<", Modifiers::empty()),
        ];
        for (token, name, modifiers) in cases {
            let s = AffixedSelector::parse(token);
            assert_eq!(s.name(), name, "{token:?}");
            assert_eq!(s.modifiers(), modifiers, "{token:?}");
        }
    }

    fn method_kind(inv: &Invocation) -> &'static str {
        match inv {
            Invocation::TypeMethod { .. } => "TypeMethod",
            Invocation::InstanceMethod { .. } => "InstanceMethod",
            Invocation::Function { .. } => "Function",
            Invocation::Message { .. } => "Message",
            Invocation::ObjectMember(_) => "ObjectMember",
            Invocation::ObjectMemberGetter { .. } => "ObjectMemberGetter",
            Invocation::TypeConstructor { .. } => "TypeConstructor",
            Invocation::Bind1st { .. } => "Bind1st",
        }
    }

    #[test]
    fn test_select_method_forms() {
        let ctx = InvocationContext::instant(None);
        let int = ctx.new_object(Value::Int(255));
        let text = ctx.new_object(Value::Str("GODZILLA".into()));
        let none = Modifiers::empty();

        let cases: Vec<(&str, &Object, &str)> = vec![
            ("hex", &int, "TypeMethod"),
            ("add", &int, "Function"),
            ("+", &int, "Function"),
            ("2", &text, "Bind1st"),
            ("Float", &int, "TypeConstructor"),
            ("Int/hex", &text, "TypeMethod"),
            ("upper", &text, "InstanceMethod"),
            ("reg-match", &text, "TypeMethod"),
            ("no-such-method", &int, "InstanceMethod"),
        ];
        for (name, receiver, kind) in cases {
            let inv = select_method(&ctx, name, Some(receiver), none).unwrap();
            assert_eq!(method_kind(&inv), kind, "{name}");
        }

        let upper = select_method(&ctx, "upper", Some(&text), none).unwrap();
        assert_eq!(upper.get_min_arity().unwrap(), 0);
        let center = select_method(&ctx, "center", Some(&text), none).unwrap();
        assert_eq!(center.get_min_arity().unwrap(), 1);

        assert_eq!(
            select_method(&ctx, "Int/no-such-method", None, none).unwrap_err().kind_name(),
            "BadMethodName"
        );
        assert_eq!(select_method(&ctx, "", None, none).unwrap_err().kind_name(), "BadMethodName");

        let root = ctx.root_object().unwrap();
        assert_eq!(
            select_method(&ctx, "no-such-member", Some(&root), none).unwrap_err().kind_name(),
            "BadExpressionError"
        );
    }

    #[test]
    fn test_select_collection_member() {
        let ctx = InvocationContext::instant(None);
        let mut items = ObjectCollection::new();
        items.push("name", ctx.new_object(Value::Str("mothra".into())));
        items.set_delegation(Some(ctx.new_object(Value::Int(10))));
        let collection = ctx.new_object(Value::Collection(Arc::new(items)));
        let none = Modifiers::empty();

        let inv = select_method(&ctx, "name", Some(&collection), none).unwrap();
        assert_eq!(inv.display_name(), "ObjectMember name");

        // falls through to the delegation object's methods
        let inv = select_method(&ctx, "hex", Some(&collection), none).unwrap();
        assert!(inv.modifiers().contains(Modifiers::DELEGATE_RECEIVER));

        // digits are member names on collections
        let inv = select_method(&ctx, "0", Some(&collection), none).unwrap();
        assert_eq!(method_kind(&inv), "ObjectMember");

        let bare = ctx.new_object(Value::Collection(Arc::new(ObjectCollection::new())));
        assert_eq!(
            select_method(&ctx, "no-such-member", Some(&bare), none).unwrap_err().kind_name(),
            "BadObjectMemberInvocation"
        );
        let inv = select_method(&ctx, "length", Some(&bare), none).unwrap();
        assert_eq!(inv.get_method_name(), "length");
    }

    #[test]
    fn test_select_by_object() {
        let ctx = InvocationContext::instant(None);
        let receiver = ctx.new_object(Value::Str("GODZILLA".into()));
        let none = Modifiers::empty();
        let by = |v: Value| select_method_by_object(&ctx, &ctx.new_object(v), Some(&receiver), none);

        assert_eq!(method_kind(&by(Value::Int(1)).unwrap()), "Bind1st");
        assert_eq!(method_kind(&by(Value::Str("length".into())).unwrap()), "Function");
        let negated = by(Value::Str("!startswith".into())).unwrap();
        assert!(negated.modifiers().contains(Modifiers::NEGATE_RESULT));
        let ty = ctx.get_type("Int").unwrap();
        assert_eq!(method_kind(&by(Value::Type(ty)).unwrap()), "TypeConstructor");
        assert_eq!(by(Value::None).unwrap_err().kind_name(), "BadExpressionError");
    }

    #[test]
    fn test_select_type_and_literal() {
        let ctx = InvocationContext::instant(None);
        let ty = select_type(&ctx, "Int").unwrap();
        assert_eq!(ty.get_typename(), "Type");
        assert!(select_type(&ctx, "GODZILLA").is_none());
        assert!(select_type(&ctx, "Int Float").is_none());

        assert_eq!(select_literal(&ctx, "0x10").value(), &Value::Int(16));
        assert_eq!(select_literal(&ctx, "1.5").get_typename(), "Float");
        assert_eq!(select_literal(&ctx, "GODZILLA").get_typename(), "Str");
    }
}
