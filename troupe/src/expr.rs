//! Boolean guard expressions for flow conditionals.
//!
//! Grammar:
//!
//! ```text
//! expr    := or
//! or      := and ("or" and)*
//! and     := prim ("and" prim)*
//! prim    := "(" expr ")"
//!          | "re.match(" pattern "," ref ")"
//!          | operand cmp operand
//! cmp     := "==" | "!=" | "<" | "<=" | ">" | ">="
//! operand := literal | ref
//! literal := "None" | "True" | "False" | integer | float | quoted-string
//! ```
//!
//! `and`/`or` are word-bounded (an identifier such as `android` never splits),
//! literals are typed at parse time, and references resolve to their stored
//! typed value at evaluation time. Guards are parsed once at bot build so
//! malformed conditions fail fast.

use regex::Regex;
use serde_json::Value;

use crate::error::BuildError;
use crate::tracker::Tracker;
use crate::vars::{ArgRef, stringify};

/// A parsed guard expression.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Disjunction; true when any branch is true.
    Or(Vec<Expr>),
    /// Conjunction; true when every branch is true.
    And(Vec<Expr>),
    /// A typed comparison between two operands.
    Cmp {
        /// Left operand.
        lhs: Operand,
        /// Comparison operator.
        op: CmpOp,
        /// Right operand.
        rhs: Operand,
    },
    /// `re.match(pattern, ref)`: the stringified reference begins matching
    /// the pattern. A null or missing reference yields false.
    ReMatch {
        /// Pre-compiled, start-anchored pattern.
        pattern: Regex,
        /// Reference to match against.
        reference: ArgRef,
    },
}

/// One side of a comparison.
#[derive(Debug, Clone)]
pub enum Operand {
    /// A literal typed at parse time.
    Literal(Value),
    /// A variable reference resolved at evaluation time.
    Ref(ArgRef),
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl Expr {
    /// Parse a guard expression.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvalidExpression`] on any lexical or
    /// structural problem, including an invalid `re.match` pattern.
    pub fn parse(input: &str) -> Result<Self, BuildError> {
        let tokens = tokenize(input).map_err(|message| BuildError::InvalidExpression {
            expression: input.to_owned(),
            message,
        })?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser
            .parse_or()
            .map_err(|message| BuildError::InvalidExpression {
                expression: input.to_owned(),
                message,
            })?;
        if parser.pos != parser.tokens.len() {
            return Err(BuildError::InvalidExpression {
                expression: input.to_owned(),
                message: format!("unexpected trailing input at token {}", parser.pos),
            });
        }
        Ok(expr)
    }

    /// Evaluate against the variable store, scoped to `agent`.
    #[must_use]
    pub fn eval(&self, tracker: &Tracker, agent: &str) -> bool {
        match self {
            Self::Or(branches) => branches.iter().any(|b| b.eval(tracker, agent)),
            Self::And(branches) => branches.iter().all(|b| b.eval(tracker, agent)),
            Self::Cmp { lhs, op, rhs } => {
                let l = lhs.resolve(tracker, agent);
                let r = rhs.resolve(tracker, agent);
                compare(*op, &l, &r)
            }
            Self::ReMatch { pattern, reference } => match reference.lookup(tracker, agent) {
                None | Some(Value::Null) => false,
                Some(value) => pattern.is_match(&stringify(&value)),
            },
        }
    }
}

impl Operand {
    fn resolve(&self, tracker: &Tracker, agent: &str) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Ref(r) => r.lookup(tracker, agent).unwrap_or(Value::Null),
        }
    }
}

/// Typed comparison with numeric coercion between integer and float.
///
/// Values of different kinds are never equal and never ordered; `!=` is the
/// negation of `==`.
fn compare(op: CmpOp, l: &Value, r: &Value) -> bool {
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        };
    }
    match op {
        CmpOp::Eq => values_equal(l, r),
        CmpOp::Ne => !values_equal(l, r),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => match (l, r) {
            (Value::String(a), Value::String(b)) => match op {
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                _ => false,
            },
            _ => false,
        },
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Op(CmpOp),
    Ident(String),
    Literal(Value),
    ReMatch,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let two = chars.get(i + 1) == Some(&'=');
                let op = match (c, two) {
                    ('=', true) => CmpOp::Eq,
                    ('!', true) => CmpOp::Ne,
                    ('<', true) => CmpOp::Le,
                    ('>', true) => CmpOp::Ge,
                    ('<', false) => CmpOp::Lt,
                    ('>', false) => CmpOp::Gt,
                    _ => return Err(format!("stray '{c}' at offset {i}")),
                };
                tokens.push(Token::Op(op));
                i += if two { 2 } else { 1 };
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(format!("unterminated string starting at offset {i}"));
                }
                let s: String = chars[start..j].iter().collect();
                tokens.push(Token::Literal(Value::String(s)));
                i = j + 1;
            }
            _ if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) =>
            {
                let start = i;
                i += 1;
                let mut is_float = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    if chars[i] == '.' {
                        is_float = true;
                    }
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let value = if is_float {
                    raw.parse::<f64>()
                        .map(Value::from)
                        .map_err(|e| format!("bad number '{raw}': {e}"))
                } else {
                    raw.parse::<i64>()
                        .map(Value::from)
                        .map_err(|e| format!("bad number '{raw}': {e}"))
                }?;
                tokens.push(Token::Literal(value));
            }
            _ if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                // trailing dots belong to `re.match(` only
                match word.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "None" => tokens.push(Token::Literal(Value::Null)),
                    "True" => tokens.push(Token::Literal(Value::Bool(true))),
                    "False" => tokens.push(Token::Literal(Value::Bool(false))),
                    "re.match" => tokens.push(Token::ReMatch),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            _ => return Err(format!("unexpected character '{c}' at offset {i}")),
        }
    }
    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), String> {
        match self.bump() {
            Some(ref t) if t == token => Ok(()),
            other => Err(format!("expected {what}, found {other:?}")),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut branches = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            branches.push(self.parse_and()?);
        }
        Ok(if branches.len() == 1 {
            branches.remove(0)
        } else {
            Expr::Or(branches)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut branches = vec![self.parse_prim()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            branches.push(self.parse_prim()?);
        }
        Ok(if branches.len() == 1 {
            branches.remove(0)
        } else {
            Expr::And(branches)
        })
    }

    fn parse_prim(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::ReMatch) => {
                self.pos += 1;
                self.expect(&Token::LParen, "'(' after re.match")?;
                let pattern = match self.bump() {
                    Some(Token::Literal(Value::String(p))) => p,
                    Some(Token::Ident(p)) => p,
                    other => return Err(format!("expected re.match pattern, found {other:?}")),
                };
                self.expect(&Token::Comma, "',' in re.match")?;
                let reference = match self.bump() {
                    Some(Token::Ident(name)) => ArgRef::parse(&name),
                    other => return Err(format!("expected re.match reference, found {other:?}")),
                };
                self.expect(&Token::RParen, "')' closing re.match")?;
                let anchored = format!("^(?:{pattern})");
                let pattern =
                    Regex::new(&anchored).map_err(|e| format!("bad re.match pattern: {e}"))?;
                Ok(Expr::ReMatch { pattern, reference })
            }
            _ => {
                let lhs = self.parse_operand()?;
                let op = match self.bump() {
                    Some(Token::Op(op)) => op,
                    other => return Err(format!("expected comparison operator, found {other:?}")),
                };
                let rhs = self.parse_operand()?;
                Ok(Expr::Cmp { lhs, op, rhs })
            }
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, String> {
        match self.bump() {
            Some(Token::Literal(v)) => Ok(Operand::Literal(v)),
            Some(Token::Ident(name)) => Ok(Operand::Ref(ArgRef::parse(&name))),
            other => Err(format!("expected operand, found {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::tracker::Tracker;
    use serde_json::json;

    fn tracker_with(args: &[(&str, Value)]) -> Tracker {
        let mut template = std::collections::HashMap::new();
        let mut slots = std::collections::HashMap::new();
        for (name, _) in args {
            slots.insert((*name).to_owned(), Value::Null);
        }
        template.insert("flow".to_owned(), slots);
        let mut tracker = Tracker::new("u1", "bot", template, Default::default(), Default::default());
        for (name, value) in args {
            tracker.set_arg("flow", name, value.clone());
        }
        tracker
    }

    #[test]
    fn comparison_forms() {
        let t = tracker_with(&[("x", json!(5)), ("name", json!("ada"))]);
        assert!(Expr::parse("x == 5").unwrap().eval(&t, "flow"));
        assert!(Expr::parse("x >= 5").unwrap().eval(&t, "flow"));
        assert!(!Expr::parse("x < 5").unwrap().eval(&t, "flow"));
        assert!(Expr::parse("name == \"ada\"").unwrap().eval(&t, "flow"));
        assert!(Expr::parse("name != 'bob'").unwrap().eval(&t, "flow"));
    }

    #[test]
    fn and_or_precedence() {
        // `or` binds looser than `and`: false or (true and true)
        let t = tracker_with(&[("a", json!(1)), ("b", json!(2)), ("c", json!(3))]);
        let e = Expr::parse("a == 0 or b == 2 and c == 3").unwrap();
        assert!(e.eval(&t, "flow"));
        let e = Expr::parse("(a == 0 or b == 2) and c == 4").unwrap();
        assert!(!e.eval(&t, "flow"));
    }

    #[test]
    fn identifiers_do_not_split_on_keywords() {
        // `android` and `sandbox` contain and/or but lex as identifiers
        let t = tracker_with(&[("android", json!(1)), ("sandbox", json!(2))]);
        let e = Expr::parse("android == 1 and sandbox == 2").unwrap();
        assert!(e.eval(&t, "flow"));
    }

    #[test]
    fn null_literal_and_missing_refs() {
        let t = tracker_with(&[("x", Value::Null)]);
        assert!(Expr::parse("x == None").unwrap().eval(&t, "flow"));
        // an unknown reference resolves to null
        assert!(Expr::parse("ghost == None").unwrap().eval(&t, "flow"));
        assert!(!Expr::parse("x != None").unwrap().eval(&t, "flow"));
    }

    #[test]
    fn re_match_semantics() {
        let t = tracker_with(&[("phone", json!("555-0199")), ("empty", Value::Null)]);
        assert!(
            Expr::parse("re.match(\"555\", phone)")
                .unwrap()
                .eval(&t, "flow")
        );
        // anchored at the start
        assert!(
            !Expr::parse("re.match(\"0199\", phone)")
                .unwrap()
                .eval(&t, "flow")
        );
        // a null reference never matches
        assert!(
            !Expr::parse("re.match(\"5\", empty)")
                .unwrap()
                .eval(&t, "flow")
        );
    }

    #[test]
    fn mixed_types_never_order() {
        let t = tracker_with(&[("x", json!("5"))]);
        assert!(!Expr::parse("x == 5").unwrap().eval(&t, "flow"));
        assert!(Expr::parse("x != 5").unwrap().eval(&t, "flow"));
        assert!(!Expr::parse("x < 9").unwrap().eval(&t, "flow"));
    }

    #[test]
    fn parse_errors_fail_fast() {
        assert!(Expr::parse("x ==").is_err());
        assert!(Expr::parse("x = 5").is_err());
        assert!(Expr::parse("(x == 5").is_err());
        assert!(Expr::parse("x == 5 junk == 1").is_err());
        assert!(Expr::parse("re.match([, x)").is_err());
    }

    #[test]
    fn qualified_refs_resolve_across_agents() {
        let mut template = std::collections::HashMap::new();
        template.insert(
            "other".to_owned(),
            [("y".to_owned(), Value::Null)].into_iter().collect(),
        );
        template.insert("flow".to_owned(), Default::default());
        let mut t = Tracker::new("u1", "bot", template, Default::default(), Default::default());
        t.set_arg("other", "y", json!(7));
        assert!(Expr::parse("other.y == 7").unwrap().eval(&t, "flow"));
    }
}
