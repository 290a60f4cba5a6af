use crate::Error;
use crate::invocation::Returned;
use crate::object::{Object, Value};
use crate::types::TypeRef;
use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::sync::Arc;

// NOTE: This module is the adapter layer that turns strongly-typed Rust
// functions into the erased `OperationFn` stored in a method table.
// Receivers arrive as the first argument, after the type object for
// type-bound methods.

/// Canonical erased action type for methods that need no context.
///
/// Actions receive ownership of their argument vector, so implementations
/// may consume payloads such as strings or tuples without cloning.
pub type OperationFn = dyn Fn(Vec<Object>) -> Result<Returned, Error> + Send + Sync;

// =====================================================================
// Fixed-arity argument conversion
// =====================================================================

/// Turns one argument object into a strongly-typed parameter.
///
/// `Param<'a>` is the parameter type as seen by the action for a given
/// lifetime of the argument slots used during conversion.
pub trait FromParam {
    type Param<'a>;

    /// Convert a single argument. Implementations may borrow from the
    /// object (`&str`) or move its payload out (`Object`, `Value`, `String`).
    fn from_arg<'a>(obj: &'a mut Object) -> Result<Self::Param<'a>, Error>;
}

fn take_object(obj: &mut Object) -> Object {
    let placeholder = Object::new(Arc::clone(obj.ty()), Value::None);
    std::mem::replace(obj, placeholder)
}

fn expected(what: &str, obj: &Object) -> Error {
    Error::TypeError(format!("expected {what}, got {}", obj.get_typename()))
}

impl FromParam for Object {
    type Param<'a> = Object;

    fn from_arg<'a>(obj: &'a mut Object) -> Result<Self::Param<'a>, Error> {
        Ok(take_object(obj))
    }
}

impl FromParam for Value {
    type Param<'a> = Value;

    fn from_arg<'a>(obj: &'a mut Object) -> Result<Self::Param<'a>, Error> {
        Ok(obj.take_value())
    }
}

// By-value parameters obtained through `TryFrom<Object>`, see the impls
// below for the supported types.
impl<T> FromParam for T
where
    Object: TryInto<T, Error = Error>,
{
    type Param<'a> = T;

    fn from_arg<'a>(obj: &'a mut Object) -> Result<Self::Param<'a>, Error> {
        take_object(obj).try_into()
    }
}

impl FromParam for &str {
    type Param<'a> = &'a str;

    fn from_arg<'a>(obj: &'a mut Object) -> Result<Self::Param<'a>, Error> {
        if let Value::Str(s) = obj.value() {
            Ok(s.as_str())
        } else {
            Err(expected("Str", obj))
        }
    }
}

impl TryFrom<Object> for i64 {
    type Error = Error;

    fn try_from(obj: Object) -> Result<Self, Self::Error> {
        match obj.value() {
            Value::Int(n) => Ok(*n),
            Value::Bool(b) => Ok(i64::from(*b)),
            _ => Err(expected("Int", &obj)),
        }
    }
}

impl TryFrom<Object> for f64 {
    type Error = Error;

    fn try_from(obj: Object) -> Result<Self, Self::Error> {
        obj.value()
            .as_float()
            .ok_or_else(|| expected("Float", &obj))
    }
}

impl TryFrom<Object> for bool {
    type Error = Error;

    fn try_from(obj: Object) -> Result<Self, Self::Error> {
        match obj.value() {
            Value::Bool(b) => Ok(*b),
            _ => Err(expected("Bool", &obj)),
        }
    }
}

impl TryFrom<Object> for String {
    type Error = Error;

    fn try_from(obj: Object) -> Result<Self, Self::Error> {
        match obj.into_value() {
            Value::Str(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }
}

impl TryFrom<Object> for Vec<Object> {
    type Error = Error;

    fn try_from(obj: Object) -> Result<Self, Self::Error> {
        if !matches!(obj.value(), Value::Tuple(_)) {
            return Err(expected("Tuple", &obj));
        }
        match obj.into_value() {
            Value::Tuple(items) => Ok(items),
            _ => Ok(Vec::new()),
        }
    }
}

impl TryFrom<Object> for TypeRef {
    type Error = Error;

    fn try_from(obj: Object) -> Result<Self, Self::Error> {
        match obj.value() {
            Value::Type(t) => Ok(Arc::clone(t)),
            _ => Err(expected("Type", &obj)),
        }
    }
}

// =====================================================================
// Typed iterators for rest parameters
// =====================================================================

/// Describes how to view an argument slice as a typed iterator.
#[doc(hidden)]
pub trait ObjectElementKind {
    type Item<'a>;

    fn precheck(slice: &[Object]) -> Result<(), Error>;
    fn project(obj: &Object) -> Self::Item<'_>;
}

/// Iterator over rest arguments, narrowed by an [`ObjectElementKind`]
#[doc(hidden)]
pub struct TypedObjectIter<'a, K: ObjectElementKind> {
    inner: std::slice::Iter<'a, Object>,
    _marker: PhantomData<K>,
}

impl<'a, K> TypedObjectIter<'a, K>
where
    K: ObjectElementKind,
{
    pub(crate) fn new(objects: &'a [Object]) -> Result<Self, Error> {
        K::precheck(objects)?;
        Ok(TypedObjectIter {
            inner: objects.iter(),
            _marker: PhantomData,
        })
    }
}

impl<'a, K> Iterator for TypedObjectIter<'a, K>
where
    K: ObjectElementKind,
{
    type Item = K::Item<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let obj = self.inner.next()?;
        Some(K::project(obj))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<K> ExactSizeIterator for TypedObjectIter<'_, K> where K: ObjectElementKind {}
impl<K> FusedIterator for TypedObjectIter<'_, K> where K: ObjectElementKind {}

#[doc(hidden)]
pub struct AnyObject;

impl ObjectElementKind for AnyObject {
    type Item<'a> = &'a Object;

    fn precheck(_slice: &[Object]) -> Result<(), Error> {
        Ok(())
    }

    fn project(obj: &Object) -> Self::Item<'_> {
        obj
    }
}

#[doc(hidden)]
pub struct IntObject;

impl ObjectElementKind for IntObject {
    type Item<'a> = i64;

    fn precheck(slice: &[Object]) -> Result<(), Error> {
        match slice.iter().find(|o| o.value().as_int().is_none()) {
            Some(bad) => Err(expected("Int", bad)),
            None => Ok(()),
        }
    }

    fn project(obj: &Object) -> Self::Item<'_> {
        obj.value().as_int().unwrap_or_default()
    }
}

#[doc(hidden)]
pub struct StrObject;

impl ObjectElementKind for StrObject {
    type Item<'a> = &'a str;

    fn precheck(slice: &[Object]) -> Result<(), Error> {
        match slice.iter().find(|o| o.value().as_str().is_none()) {
            Some(bad) => Err(expected("Str", bad)),
            None => Ok(()),
        }
    }

    fn project(obj: &Object) -> Self::Item<'_> {
        obj.value().as_str().unwrap_or_default()
    }
}

/// Borrowed iterator over rest arguments as objects
pub type ObjectIter<'a> = TypedObjectIter<'a, AnyObject>;

/// Borrowed iterator over rest arguments, all of which must be `Int`
pub type IntIter<'a> = TypedObjectIter<'a, IntObject>;

/// Borrowed iterator over rest arguments, all of which must be `Str`
pub type StrIter<'a> = TypedObjectIter<'a, StrObject>;

/// Builds a rest parameter from the trailing argument slice
pub trait FromRest {
    type Param<'a>;

    fn from_rest<'a>(slice: &'a [Object]) -> Result<Self::Param<'a>, Error>;
}

impl<K> FromRest for TypedObjectIter<'static, K>
where
    K: ObjectElementKind,
{
    type Param<'a> = TypedObjectIter<'a, K>;

    fn from_rest<'a>(slice: &'a [Object]) -> Result<Self::Param<'a>, Error> {
        TypedObjectIter::<K>::new(slice)
    }
}

// =====================================================================
// Return-type adaptation
// =====================================================================

/// Normalizes action return types to `Result<Returned, Error>`.
///
/// Actions may return a plain value convertible into [`Returned`]
/// (`i64`, `bool`, `String`, `Value`, `Object`, ...) or a `Result` of one.
pub trait IntoReturn {
    fn into_return(self) -> Result<Returned, Error>;
}

impl<T> IntoReturn for Result<T, Error>
where
    T: Into<Returned>,
{
    fn into_return(self) -> Result<Returned, Error> {
        self.map(Into::into)
    }
}

impl<T> IntoReturn for T
where
    T: Into<Returned>,
{
    fn into_return(self) -> Result<Returned, Error> {
        Ok(self.into())
    }
}

/// Converts a strongly-typed function into the erased [`OperationFn`],
/// parameterized by its argument tuple type.
pub trait IntoOperation<Args> {
    fn into_operation(self) -> Arc<OperationFn>;
}

/// Converts a function whose last parameter is a rest iterator
/// (`ObjectIter<'a>`, `IntIter<'a>` or `StrIter<'a>`), optionally after a
/// fixed prefix of [`FromParam`] parameters.
pub trait IntoVariadicOperation<Args> {
    fn into_variadic_operation(self) -> Arc<OperationFn>;
}

// =====================================================================
// Variadic adapters
// =====================================================================

impl<F, I, R> IntoVariadicOperation<(I,)> for F
where
    I: FromRest,
    F: for<'a> Fn(<I as FromRest>::Param<'a>) -> R + Send + Sync + 'static,
    R: IntoReturn,
{
    fn into_variadic_operation(self) -> Arc<OperationFn> {
        Arc::new(move |args: Vec<Object>| {
            let rest_param: <I as FromRest>::Param<'_> = <I as FromRest>::from_rest(&args[..])?;
            (self)(rest_param).into_return()
        })
    }
}

macro_rules! impl_into_variadic_operation_for_prefix_and_rest {
    ($prefix:expr, $( $v:ident, $p:ident : $A:ident ),+ ) => {
        impl<F, I, R, $( $A ),+> IntoVariadicOperation<( $( $A, )+ I, )> for F
        where
            I: FromRest,
            $( $A: FromParam, )+
            F: for<'a> Fn(
                    $( <$A as FromParam>::Param<'a> ),+,
                    <I as FromRest>::Param<'a>,
                ) -> R
                + Send
                + Sync
                + 'static,
            R: IntoReturn,
        {
            fn into_variadic_operation(self) -> Arc<OperationFn> {
                Arc::new(move |mut args: Vec<Object>| {
                    let len = args.len();
                    match args.as_mut_slice() {
                        &mut [ $( ref mut $v ),+, ref mut rest @ .. ] => {
                            $(
                                let $p: <$A as FromParam>::Param<'_> =
                                    <$A as FromParam>::from_arg($v)?;
                            )+

                            let rest_param: <I as FromRest>::Param<'_> =
                                <I as FromRest>::from_rest(&*rest)?;

                            (self)( $( $p ),+, rest_param ).into_return()
                        }
                        _ => Err(Error::arity_error($prefix, len)),
                    }
                })
            }
        }
    };
}

impl_into_variadic_operation_for_prefix_and_rest!(1, v0, p0: A1);
impl_into_variadic_operation_for_prefix_and_rest!(2, v0, p0: A1, v1, p1: A2);
impl_into_variadic_operation_for_prefix_and_rest!(3, v0, p0: A1, v1, p1: A2, v2, p2: A3);

// =====================================================================
// Fixed-arity adapters
// =====================================================================

/// Implements `IntoOperation` for one arity: checks the argument count,
/// then destructures the owned vector into slots that `FromParam` may
/// borrow from or move out of.
macro_rules! impl_into_operation_for_arity {
    ($arity:expr, $( $v:ident, $p:ident : $A:ident ),+ ) => {
        impl<F, R, $( $A ),+> IntoOperation<( $( $A, )+ )> for F
        where
            F: for<'a> Fn( $( <$A as FromParam>::Param<'a> ),+ ) -> R
                + Send
                + Sync
                + 'static,
            $( $A: FromParam, )+
            R: IntoReturn,
        {
            fn into_operation(self) -> Arc<OperationFn> {
                Arc::new(move |mut args: Vec<Object>| {
                    let len = args.len();
                    match args.as_mut_slice() {
                        &mut [ $( ref mut $v ),+ ] => {
                            $(
                                let $p: <$A as FromParam>::Param<'_> =
                                    <$A as FromParam>::from_arg($v)?;
                            )+

                            (self)( $( $p ),+ ).into_return()
                        }
                        _ => Err(Error::arity_error($arity, len)),
                    }
                })
            }
        }
    };
}

impl_into_operation_for_arity!(1, v0, p0: A1);
impl_into_operation_for_arity!(2, v0, p0: A1, v1, p1: A2);
impl_into_operation_for_arity!(3, v0, p0: A1, v1, p1: A2, v2, p2: A3);
impl_into_operation_for_arity!(4, v0, p0: A1, v1, p1: A2, v2, p2: A3, v3, p3: A4);
impl_into_operation_for_arity!(5, v0, p0: A1, v1, p1: A2, v2, p2: A3, v3, p3: A4, v4, p4: A5);

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::fundamental::fundamental_type;

    fn obj(typename: &str, value: Value) -> Object {
        Object::new(fundamental_type(typename).unwrap(), value)
    }

    fn returned_value(r: Result<Returned, Error>) -> Value {
        match r.unwrap() {
            Returned::Value(v) => v,
            Returned::Object(o) => o.into_value(),
        }
    }

    fn add(a: i64, b: i64) -> i64 {
        a + b
    }

    fn checked_div(a: i64, b: i64) -> Result<i64, Error> {
        a.checked_div(b).ok_or(Error::ZeroDivision)
    }

    fn shout(s: &str) -> String {
        s.to_uppercase()
    }

    fn join(sep: &str, rest: StrIter<'_>) -> String {
        rest.collect::<Vec<_>>().join(sep)
    }

    fn sum(rest: IntIter<'_>) -> i64 {
        rest.sum()
    }

    fn first_type(o: Object) -> String {
        o.get_typename().to_string()
    }

    #[test]
    fn test_fixed_arity() {
        let op = <_ as IntoOperation<(i64, i64)>>::into_operation(add);
        let v = returned_value(op(vec![
            obj("Int", Value::Int(2)),
            obj("Int", Value::Int(3)),
        ]));
        assert_eq!(v, Value::Int(5));

        let err = op(vec![obj("Int", Value::Int(2))]).err().unwrap();
        assert_eq!(err, Error::arity_error(2, 1));

        let err = op(vec![obj("Int", Value::Int(2)), obj("Str", Value::Str("x".into()))])
            .err()
            .unwrap();
        assert_eq!(err.kind_name(), "TypeError");
    }

    #[test]
    fn test_result_and_borrowed_params() {
        let op = <_ as IntoOperation<(i64, i64)>>::into_operation(checked_div);
        let err = op(vec![obj("Int", Value::Int(1)), obj("Int", Value::Int(0))])
            .err()
            .unwrap();
        assert_eq!(err, Error::ZeroDivision);

        let op = <_ as IntoOperation<(&str,)>>::into_operation(shout);
        let v = returned_value(op(vec![obj("Str", Value::Str("abc".into()))]));
        assert_eq!(v, Value::Str("ABC".into()));

        let op = <_ as IntoOperation<(Object,)>>::into_operation(first_type);
        let v = returned_value(op(vec![obj("Float", Value::Float(1.0))]));
        assert_eq!(v, Value::Str("Float".into()));
    }

    #[test]
    fn test_variadic() {
        let op = <_ as IntoVariadicOperation<(&str, StrIter<'static>)>>::into_variadic_operation(join);
        let v = returned_value(op(vec![
            obj("Str", Value::Str("-".into())),
            obj("Str", Value::Str("a".into())),
            obj("Str", Value::Str("b".into())),
        ]));
        assert_eq!(v, Value::Str("a-b".into()));

        let op = <_ as IntoVariadicOperation<(IntIter<'static>,)>>::into_variadic_operation(sum);
        let v = returned_value(op(vec![]));
        assert_eq!(v, Value::Int(0));
        let err = op(vec![obj("Str", Value::Str("a".into()))]).err().unwrap();
        assert_eq!(err.kind_name(), "TypeError");
    }
}
