//! Default rule language.
//!
//! A small expression language over the JSON [`RuleContext`]:
//!
//! - literals: decimals (`0.1`, `500`), strings (`'a'` or `"a"`), `true`,
//!   `false`, `null`
//! - paths: `currentLineItem.lineTotal.subtotal`, `lineItems[0].productId`
//! - operators, loosest first: `||`, `&&`, `== !=`, `< <= > >=`, `+ -`,
//!   `* / %`, unary `! -`
//! - functions: `min`, `max`, `floor`, `ceil`, `round`, `abs`, `contains`
//!
//! Arithmetic is exact decimal arithmetic. Missing paths evaluate to `null`.
//!
//! ```rust
//! use engine::rules::{ExpressionRuleEvaluator, Rule, RuleContext, RuleEvaluator};
//! use serde_json::json;
//!
//! let ctx = RuleContext::from_json(json!({
//!     "currentLineItem": { "lineTotal": { "subtotal": 1999 } }
//! }));
//! let rule = Rule::new("currentLineItem.lineTotal.subtotal * 0.1");
//! let amount = ExpressionRuleEvaluator.evaluate_balance(&rule, &ctx).unwrap();
//! assert_eq!(amount, 200);
//! ```

use std::{cmp::Ordering, str::FromStr};

use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};

use super::{Rule, RuleContext, RuleError, RuleEvaluator};

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(Decimal),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
}

fn syntax(position: usize, message: impl Into<String>) -> RuleError {
    RuleError::Syntax {
        position,
        message: message.into(),
    }
}

const OPERATORS: [&str; 16] = [
    "&&", "||", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "!", "===", "!==",
];

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, RuleError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '0'..='9' => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let number = Decimal::from_str(&raw)
                    .map_err(|_| syntax(start, format!("invalid number {raw}")))?;
                tokens.push((start, Token::Number(number)));
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let mut value = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(syntax(start, "unterminated string")),
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| syntax(i, "dangling escape"))?;
                            value.push(*escaped);
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((start, Token::Str(value)));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                tokens.push((start, Token::Ident(chars[start..i].iter().collect())));
            }
            '(' => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            '[' => {
                tokens.push((start, Token::LBracket));
                i += 1;
            }
            ']' => {
                tokens.push((start, Token::RBracket));
                i += 1;
            }
            '.' => {
                tokens.push((start, Token::Dot));
                i += 1;
            }
            ',' => {
                tokens.push((start, Token::Comma));
                i += 1;
            }
            _ => {
                let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
                let op = OPERATORS
                    .iter()
                    .filter(|op| rest.starts_with(**op))
                    .max_by_key(|op| op.len())
                    .ok_or_else(|| syntax(start, format!("unexpected character {c}")))?;
                i += op.chars().count();
                // JS style strict operators mean the same thing here.
                let op = match *op {
                    "===" => "==",
                    "!==" => "!=",
                    other => other,
                };
                tokens.push((start, Token::Op(op)));
            }
        }
    }

    Ok(tokens)
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Literal(Val),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Unary(&'static str, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(p, _)| *p)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: &Token, label: &str) -> Result<(), RuleError> {
        let position = self.position();
        match self.next() {
            Some(ref token) if token == expected => Ok(()),
            _ => Err(syntax(position, format!("expected {label}"))),
        }
    }

    fn binding_power(op: &str) -> Option<u8> {
        match op {
            "||" => Some(1),
            "&&" => Some(2),
            "==" | "!=" => Some(3),
            "<" | "<=" | ">" | ">=" => Some(4),
            "+" | "-" => Some(5),
            "*" | "/" | "%" => Some(6),
            _ => None,
        }
    }

    fn expression(&mut self, min_power: u8) -> Result<Expr, RuleError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) => *op,
                _ => break,
            };
            let Some(power) = Self::binding_power(op) else {
                break;
            };
            if power < min_power {
                break;
            }
            self.next();
            let rhs = self.expression(power + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, RuleError> {
        if let Some(Token::Op(op)) = self.peek()
            && (*op == "!" || *op == "-")
        {
            let op = *op;
            self.next();
            let operand = self.unary()?;
            return Ok(Expr::Unary(op, Box::new(operand)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, RuleError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    let position = self.position();
                    match self.next() {
                        Some(Token::Ident(name)) => expr = Expr::Member(Box::new(expr), name),
                        _ => return Err(syntax(position, "expected property name")),
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = self.expression(0)?;
                    self.expect(&Token::RBracket, "]")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, RuleError> {
        let position = self.position();
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Val::Num(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Val::Str(s))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Val::Bool(true))),
                "false" => Ok(Expr::Literal(Val::Bool(false))),
                "null" | "undefined" => Ok(Expr::Literal(Val::Null)),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.next();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.expression(0)?);
                            if self.peek() == Some(&Token::Comma) {
                                self.next();
                                continue;
                            }
                            break;
                        }
                    }
                    self.expect(&Token::RParen, ")")?;
                    Ok(Expr::Call(name, args))
                }
                _ => Ok(Expr::Ident(name)),
            },
            Some(Token::LParen) => {
                let inner = self.expression(0)?;
                self.expect(&Token::RParen, ")")?;
                Ok(inner)
            }
            _ => Err(syntax(position, "expected expression")),
        }
    }
}

fn parse(source: &str) -> Result<Expr, RuleError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(syntax(0, "empty rule"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: source.chars().count(),
    };
    let expr = parser.expression(0)?;
    if parser.pos < parser.tokens.len() {
        return Err(syntax(parser.position(), "unexpected trailing input"));
    }
    Ok(expr)
}

#[derive(Clone, Debug, PartialEq)]
enum Val {
    Null,
    Bool(bool),
    Num(Decimal),
    Str(String),
    List(Vec<serde_json::Value>),
    Obj(serde_json::Map<String, serde_json::Value>),
}

impl Val {
    fn from_json(json: &serde_json::Value) -> Val {
        match json {
            serde_json::Value::Null => Val::Null,
            serde_json::Value::Bool(b) => Val::Bool(*b),
            serde_json::Value::Number(n) => {
                let raw = n.to_string();
                Decimal::from_str(&raw)
                    .or_else(|_| Decimal::from_scientific(&raw))
                    .map_or(Val::Null, Val::Num)
            }
            serde_json::Value::String(s) => Val::Str(s.clone()),
            serde_json::Value::Array(items) => Val::List(items.clone()),
            serde_json::Value::Object(map) => Val::Obj(map.clone()),
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Val::Null => false,
            Val::Bool(b) => *b,
            Val::Num(n) => !n.is_zero(),
            Val::Str(s) => !s.is_empty(),
            Val::List(_) | Val::Obj(_) => true,
        }
    }

    fn number(&self, context: &str) -> Result<Decimal, RuleError> {
        match self {
            Val::Num(n) => Ok(*n),
            other => Err(RuleError::Type(format!(
                "{context} expects a number, got {}",
                other.type_name()
            ))),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Val::Null => "null",
            Val::Bool(_) => "boolean",
            Val::Num(_) => "number",
            Val::Str(_) => "string",
            Val::List(_) => "list",
            Val::Obj(_) => "object",
        }
    }

    fn display(&self) -> String {
        match self {
            Val::Null => "null".to_string(),
            Val::Bool(b) => b.to_string(),
            Val::Num(n) => n.normalize().to_string(),
            Val::Str(s) => s.clone(),
            Val::List(items) => serde_json::Value::Array(items.clone()).to_string(),
            Val::Obj(map) => serde_json::Value::Object(map.clone()).to_string(),
        }
    }
}

fn compare(lhs: &Val, rhs: &Val) -> Option<Ordering> {
    match (lhs, rhs) {
        (Val::Num(a), Val::Num(b)) => Some(a.cmp(b)),
        (Val::Str(a), Val::Str(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn member(target: Val, name: &str) -> Val {
    match target {
        Val::Obj(map) => map.get(name).map_or(Val::Null, Val::from_json),
        Val::List(items) if name == "length" => Val::Num(Decimal::from(items.len())),
        Val::Str(s) if name == "length" => Val::Num(Decimal::from(s.chars().count())),
        _ => Val::Null,
    }
}

fn call(name: &str, args: Vec<Val>) -> Result<Val, RuleError> {
    let unary_number = |args: &[Val]| -> Result<Decimal, RuleError> {
        match args {
            [single] => single.number(name),
            _ => Err(RuleError::Type(format!("{name} expects one argument"))),
        }
    };
    match name {
        "min" | "max" => {
            let mut numbers = args.iter().map(|a| a.number(name));
            let first = numbers
                .next()
                .ok_or_else(|| RuleError::Type(format!("{name} expects arguments")))??;
            numbers.try_fold(first, |acc, n| {
                let n = n?;
                Ok(if name == "min" { acc.min(n) } else { acc.max(n) })
            })
            .map(Val::Num)
        }
        "floor" => Ok(Val::Num(unary_number(&args)?.floor())),
        "ceil" => Ok(Val::Num(unary_number(&args)?.ceil())),
        "round" => Ok(Val::Num(
            unary_number(&args)?.round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven),
        )),
        "abs" => Ok(Val::Num(unary_number(&args)?.abs())),
        "contains" => match args.as_slice() {
            [Val::List(items), needle] => Ok(Val::Bool(
                items.iter().any(|item| &Val::from_json(item) == needle),
            )),
            [Val::Str(haystack), Val::Str(needle)] => Ok(Val::Bool(haystack.contains(needle))),
            [Val::Null, _] => Ok(Val::Bool(false)),
            _ => Err(RuleError::Type(
                "contains expects (list, value) or (string, string)".to_string(),
            )),
        },
        other => Err(RuleError::UnknownFunction(other.to_string())),
    }
}

fn eval(expr: &Expr, context: &serde_json::Value) -> Result<Val, RuleError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => Ok(context.get(name).map_or(Val::Null, Val::from_json)),
        Expr::Member(target, name) => Ok(member(eval(target, context)?, name)),
        Expr::Index(target, index) => {
            let target = eval(target, context)?;
            let index = eval(index, context)?;
            Ok(match (target, index) {
                (Val::List(items), Val::Num(n)) => n
                    .to_usize()
                    .and_then(|i| items.get(i))
                    .map_or(Val::Null, Val::from_json),
                (obj @ Val::Obj(_), Val::Str(key)) => member(obj, &key),
                _ => Val::Null,
            })
        }
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|a| eval(a, context))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, args)
        }
        Expr::Unary(op, operand) => {
            let operand = eval(operand, context)?;
            match *op {
                "!" => Ok(Val::Bool(!operand.truthy())),
                _ => Ok(Val::Num(-operand.number("unary -")?)),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            if *op == "&&" {
                let lhs = eval(lhs, context)?;
                return if lhs.truthy() { eval(rhs, context) } else { Ok(lhs) };
            }
            if *op == "||" {
                let lhs = eval(lhs, context)?;
                return if lhs.truthy() { Ok(lhs) } else { eval(rhs, context) };
            }
            let lhs = eval(lhs, context)?;
            let rhs = eval(rhs, context)?;
            binary(op, lhs, rhs)
        }
    }
}

fn binary(op: &str, lhs: Val, rhs: Val) -> Result<Val, RuleError> {
    match op {
        "==" => Ok(Val::Bool(lhs == rhs)),
        "!=" => Ok(Val::Bool(lhs != rhs)),
        "<" | "<=" | ">" | ">=" => {
            let Some(ordering) = compare(&lhs, &rhs) else {
                return Ok(Val::Bool(false));
            };
            Ok(Val::Bool(match op {
                "<" => ordering == Ordering::Less,
                "<=" => ordering != Ordering::Greater,
                ">" => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        "+" => match (&lhs, &rhs) {
            (Val::Num(a), Val::Num(b)) => a
                .checked_add(*b)
                .map(Val::Num)
                .ok_or_else(|| RuleError::Type("overflow".to_string())),
            (Val::Str(_), _) | (_, Val::Str(_)) => {
                Ok(Val::Str(format!("{}{}", lhs.display(), rhs.display())))
            }
            _ => Err(RuleError::Type(format!(
                "cannot add {} and {}",
                lhs.type_name(),
                rhs.type_name()
            ))),
        },
        "-" | "*" | "/" | "%" => {
            let a = lhs.number(op)?;
            let b = rhs.number(op)?;
            let result = match op {
                "-" => a.checked_sub(b),
                "*" => a.checked_mul(b),
                "/" => {
                    if b.is_zero() {
                        return Err(RuleError::DivisionByZero);
                    }
                    a.checked_div(b)
                }
                _ => {
                    if b.is_zero() {
                        return Err(RuleError::DivisionByZero);
                    }
                    a.checked_rem(b)
                }
            };
            result
                .map(Val::Num)
                .ok_or_else(|| RuleError::Type("overflow".to_string()))
        }
        other => Err(RuleError::Type(format!("unknown operator {other}"))),
    }
}

/// Evaluator for the built-in expression language.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExpressionRuleEvaluator;

impl RuleEvaluator for ExpressionRuleEvaluator {
    fn check(&self, rule: &Rule) -> Result<(), RuleError> {
        parse(&rule.rule).map(|_| ())
    }

    fn evaluate_balance(&self, rule: &Rule, context: &RuleContext) -> Result<i64, RuleError> {
        let expr = parse(&rule.rule)?;
        match eval(&expr, context.as_json())? {
            Val::Null => Ok(0),
            Val::Num(n) => {
                let rounded = n.round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven);
                let minor = rounded
                    .to_i64()
                    .ok_or_else(|| RuleError::Type("balance rule result out of range".to_string()))?;
                Ok(minor.max(0))
            }
            other => Err(RuleError::Type(format!(
                "balance rule must produce a number, got {}",
                other.type_name()
            ))),
        }
    }

    fn evaluate_redeemable(
        &self,
        rule: &Rule,
        context: &RuleContext,
    ) -> Result<bool, RuleError> {
        let expr = parse(&rule.rule)?;
        Ok(eval(&expr, context.as_json())?.truthy())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ctx() -> RuleContext {
        RuleContext::from_json(json!({
            "currentLineItem": {
                "productId": "p1",
                "tags": ["sale", "shoes"],
                "lineTotal": { "subtotal": 1999, "remainder": 1500 }
            },
            "lineItems": [ { "productId": "p1" }, { "productId": "p2" } ],
            "value": { "balanceChange": -300, "metadata": { "tier": "gold" } },
            "metadata": {}
        }))
    }

    fn balance(rule: &str) -> Result<i64, RuleError> {
        ExpressionRuleEvaluator.evaluate_balance(&Rule::new(rule), &ctx())
    }

    fn redeemable(rule: &str) -> Result<bool, RuleError> {
        ExpressionRuleEvaluator.evaluate_redeemable(&Rule::new(rule), &ctx())
    }

    #[test]
    fn percentage_of_subtotal_rounds_half_even() {
        assert_eq!(balance("currentLineItem.lineTotal.subtotal * 0.1").unwrap(), 200);
        assert_eq!(balance("25 * 0.1").unwrap(), 2);
        assert_eq!(balance("35 * 0.1").unwrap(), 4);
    }

    #[test]
    fn precedence_and_parentheses() {
        assert_eq!(balance("2 + 3 * 4").unwrap(), 14);
        assert_eq!(balance("(2 + 3) * 4").unwrap(), 20);
        assert_eq!(balance("10 - 4 - 3").unwrap(), 3);
        assert_eq!(balance("-5 + 10").unwrap(), 5);
    }

    #[test]
    fn negative_results_clamp_to_zero() {
        assert_eq!(balance("100 + value.balanceChange * 2").unwrap(), 0);
    }

    #[test]
    fn functions() {
        assert_eq!(
            balance("min(500, currentLineItem.lineTotal.remainder)").unwrap(),
            500
        );
        assert_eq!(balance("max(1, 2, 3)").unwrap(), 3);
        assert_eq!(balance("floor(9.9)").unwrap(), 9);
        assert_eq!(balance("ceil(9.1)").unwrap(), 10);
        assert_eq!(balance("abs(-7)").unwrap(), 7);
    }

    #[test]
    fn redemption_predicates() {
        assert!(redeemable("currentLineItem.productId == 'p1'").unwrap());
        assert!(redeemable("currentLineItem.productId === \"p1\"").unwrap());
        assert!(!redeemable("currentLineItem.productId != 'p1'").unwrap());
        assert!(redeemable("contains(currentLineItem.tags, 'sale')").unwrap());
        assert!(!redeemable("contains(currentLineItem.missing, 'sale')").unwrap());
        assert!(redeemable("lineItems.length >= 2 && lineItems[1].productId == 'p2'").unwrap());
        assert!(redeemable("value.metadata.tier == 'gold' || false").unwrap());
        assert!(!redeemable("!true").unwrap());
    }

    #[test]
    fn missing_paths_are_null() {
        assert!(!redeemable("metadata.nope.deeper").unwrap());
        assert_eq!(balance("metadata.nope").unwrap(), 0);
    }

    #[test]
    fn errors() {
        assert!(matches!(balance("1 / 0"), Err(RuleError::DivisionByZero)));
        assert!(matches!(balance("nope(1)"), Err(RuleError::UnknownFunction(_))));
        assert!(matches!(balance("1 +"), Err(RuleError::Syntax { .. })));
        assert!(matches!(balance("(1"), Err(RuleError::Syntax { .. })));
        assert!(matches!(balance("'a'"), Err(RuleError::Type(_))));
        assert!(ExpressionRuleEvaluator.check(&Rule::new("")).is_err());
        assert!(ExpressionRuleEvaluator.check(&Rule::new("1 2")).is_err());
    }

    #[test]
    fn string_concatenation() {
        assert!(redeemable("'a' + 1 == 'a1'").unwrap());
    }
}
