//! Scalar literal recognition for bare tokens.
//!
//! A token that is not a selector, type name or object reference is read as a
//! literal: `None`, `True`/`False`, integers (with `0x`/`0o`/`0b` prefixes and
//! `_` separators), floats and quoted strings. Anything else is kept as text.

use crate::object::Value;
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::{char, one_of},
    combinator::{all_consuming, map, map_res, opt, recognize, value},
    sequence::{delimited, preceded},
};

fn has_valid_separators(digits: &str) -> bool {
    !digits.starts_with('_') && !digits.ends_with('_') && !digits.contains("__")
}

fn digits_in_radix(radix: u32) -> impl Fn(char) -> bool {
    move |c: char| c.is_digit(radix) || c == '_'
}

fn int_from_digits(digits: &str, radix: u32) -> Result<i64, String> {
    if !has_valid_separators(digits) {
        return Err(format!("bad digit separators in '{digits}'"));
    }
    i64::from_str_radix(&digits.replace('_', ""), radix).map_err(|e| e.to_string())
}

fn prefixed_int<'a>(
    prefix: &'static str,
    radix: u32,
) -> impl Parser<&'a str, Output = i64, Error = nom::error::Error<&'a str>> {
    map_res(
        preceded(tag_no_case(prefix), take_while1(digits_in_radix(radix))),
        move |digits: &str| int_from_digits(digits, radix),
    )
}

/// Decimal integer. Leading zeros are only allowed for zero itself.
fn decimal_int(input: &str) -> IResult<&str, i64> {
    map_res(take_while1(digits_in_radix(10)), |digits: &str| {
        let plain = digits.replace('_', "");
        if plain.len() > 1 && plain.starts_with('0') && plain.chars().any(|c| c != '0') {
            return Err("leading zeros in decimal literal".to_string());
        }
        int_from_digits(digits, 10)
    })
    .parse(input)
}

fn unsigned_int(input: &str) -> IResult<&str, i64> {
    alt((
        prefixed_int("0x", 16),
        prefixed_int("0o", 8),
        prefixed_int("0b", 2),
        decimal_int,
    ))
    .parse(input)
}

fn exponent(input: &str) -> IResult<&str, &str> {
    recognize((one_of("eE"), opt(one_of("+-")), take_while1(digits_in_radix(10)))).parse(input)
}

fn unsigned_float(input: &str) -> IResult<&str, f64> {
    let digits = || take_while1(digits_in_radix(10));
    map_res(
        recognize(alt((
            recognize((digits(), char('.'), opt(digits()), opt(exponent))),
            recognize((char('.'), digits(), opt(exponent))),
            recognize((digits(), exponent)),
        ))),
        |text: &str| text.replace('_', "").parse::<f64>(),
    )
    .parse(input)
}

fn number(input: &str) -> IResult<&str, Value> {
    let (input, sign) = opt(one_of("+-")).parse(input)?;
    let negative = sign == Some('-');
    alt((
        map(unsigned_float, move |f| {
            Value::Float(if negative { -f } else { f })
        }),
        map(unsigned_int, move |n| {
            Value::Int(if negative { -n } else { n })
        }),
    ))
    .parse(input)
}

fn keyword(input: &str) -> IResult<&str, Value> {
    alt((
        value(Value::None, tag("None")),
        value(Value::Bool(true), tag("True")),
        value(Value::Bool(false), tag("False")),
    ))
    .parse(input)
}

fn quoted(input: &str) -> IResult<&str, Value> {
    map(
        alt((
            delimited(char('\''), take_while(|c| c != '\''), char('\'')),
            delimited(char('"'), take_while(|c| c != '"'), char('"')),
        )),
        |s: &str| Value::Str(s.to_string()),
    )
    .parse(input)
}

/// Read a bare token as a scalar literal, falling back to text
pub fn parse_literal(text: &str) -> Value {
    match all_consuming(alt((keyword, number, quoted))).parse(text) {
        Ok((_, v)) => v,
        Err(_) => Value::Str(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_vectors() {
        let cases: Vec<(&str, Value)> = vec![
            ("32", Value::Int(32)),
            ("-4", Value::Int(-4)),
            ("+7", Value::Int(7)),
            ("0", Value::Int(0)),
            ("1_000", Value::Int(1000)),
            ("0x32", Value::Int(50)),
            ("0XfF", Value::Int(255)),
            ("0o17", Value::Int(15)),
            ("0b101", Value::Int(5)),
            ("-0x10", Value::Int(-16)),
            ("2.5", Value::Float(2.5)),
            ("1.", Value::Float(1.0)),
            (".5", Value::Float(0.5)),
            ("1e3", Value::Float(1000.0)),
            ("-2.5E-1", Value::Float(-0.25)),
            ("True", Value::Bool(true)),
            ("False", Value::Bool(false)),
            ("None", Value::None),
            ("'quoted'", Value::Str("quoted".into())),
            // Not literals: kept as text
            ("7FFF", Value::Str("7FFF".into())),
            ("007", Value::Str("007".into())),
            ("1__0", Value::Str("1__0".into())),
            ("_1", Value::Str("_1".into())),
            ("Nonesuch", Value::Str("Nonesuch".into())),
            ("[1,2]", Value::Str("[1,2]".into())),
            ("99999999999999999999", Value::Str("99999999999999999999".into())),
            ("lucky", Value::Str("lucky".into())),
            ("", Value::Str(String::new())),
        ];
        for (text, expected) in cases {
            let got = parse_literal(text);
            assert!(
                matches!((&got, &expected), (Value::Float(_), Value::Float(_)) | (Value::Int(_), Value::Int(_)) | (Value::Str(_), Value::Str(_)) | (Value::Bool(_), Value::Bool(_)) | (Value::None, Value::None)),
                "literal {text:?}: expected {expected:?}, got {got:?}"
            );
            assert_eq!(got, expected, "literal {text:?}");
        }
    }
}
