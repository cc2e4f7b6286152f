//! The NSPredicate-style condition grammar used by manifest `conditional_items`
//! (spec §3). Parsing is recursive-descent with precedence `NOT > AND > OR`:
//!
//! ```text
//! expr   := or
//! or     := and ( "OR" and )*
//! and    := unary ( "AND" unary )*
//! unary  := "NOT" unary | primary
//! primary:= "(" expr ")" | comparison
//! comparison := [ "ANY" ] key operator value
//! operator   := "==" | "!=" | ">" | "<" | ">=" | "<=" |
//!               "LIKE" | "IN" | "CONTAINS" | "DOES_NOT_CONTAIN" |
//!               "BEGINSWITH" | "ENDSWITH"
//! value      := quoted-string | bareword | array-literal
//! ```
//!
//! Legacy manifests may instead supply a `{key, operator, value}` triple, or a
//! list of such triples with an outer `AND`/`OR`, deserialized straight into
//! the same AST without going through the tokenizer.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, PartialEq)]
pub enum FactValue {
    Str(String),
    Bool(bool),
    Number(f64),
    List(Vec<String>),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConditionParseError {
    #[error("unexpected end of condition expression")]
    UnexpectedEof,
    #[error("unexpected token `{0}` in condition expression")]
    UnexpectedToken(String),
    #[error("unknown comparison operator `{0}`")]
    UnknownOperator(String),
    #[error("expected a key before the operator, found `{0}`")]
    ExpectedKey(String),
    #[error("unterminated quoted string")]
    UnterminatedString,
    #[error("unterminated array literal")]
    UnterminatedArray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Like,
    In,
    Contains,
    DoesNotContain,
    BeginsWith,
    EndsWith,
}

impl FromStr for Operator {
    type Err = ConditionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "==" => Operator::Eq,
            "!=" => Operator::Ne,
            ">" => Operator::Gt,
            "<" => Operator::Lt,
            ">=" => Operator::Ge,
            "<=" => Operator::Le,
            _ => match s.to_ascii_uppercase().as_str() {
                "LIKE" => Operator::Like,
                "IN" => Operator::In,
                "CONTAINS" => Operator::Contains,
                "DOES_NOT_CONTAIN" => Operator::DoesNotContain,
                "BEGINSWITH" => Operator::BeginsWith,
                "ENDSWITH" => Operator::EndsWith,
                _ => return Err(ConditionParseError::UnknownOperator(s.to_string())),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Array(Vec<String>),
}

impl Value {
    fn as_list(&self) -> Vec<String> {
        match self {
            Value::Str(s) if s.contains(',') => {
                s.split(',').map(|x| x.trim().to_string()).collect()
            }
            Value::Str(s) => vec![s.clone()],
            Value::Array(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Comparison {
        any: bool,
        key: String,
        op: Operator,
        value: Value,
    },
    /// A condition that failed to parse. Treated as `false` per spec §7
    /// (`ConditionParseError` -> warning, offending conditional is false).
    Invalid,
}

impl Expr {
    pub fn evaluate(&self, facts: &HashMap<String, FactValue>) -> bool {
        match self {
            Expr::Or(children) => children.iter().any(|c| c.evaluate(facts)),
            Expr::And(children) => children.iter().all(|c| c.evaluate(facts)),
            Expr::Not(inner) => !inner.evaluate(facts),
            Expr::Invalid => false,
            Expr::Comparison { any, key, op, value } => {
                let fact = facts.get(key);
                match (any, fact) {
                    (true, Some(FactValue::List(items))) => items
                        .iter()
                        .any(|item| compare(&FactValue::Str(item.clone()), *op, value)),
                    (true, Some(other)) => compare(other, *op, value),
                    (true, None) => false,
                    (false, Some(fact)) => compare(fact, *op, value),
                    (false, None) => matches!(op, Operator::Ne | Operator::DoesNotContain),
                }
            }
        }
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }

    inner(
        pattern.to_ascii_lowercase().as_bytes(),
        text.to_ascii_lowercase().as_bytes(),
    )
}

fn compare(fact: &FactValue, op: Operator, value: &Value) -> bool {
    match op {
        Operator::In => {
            let haystack = value.as_list();
            let needle = fact_to_string(fact);
            haystack
                .iter()
                .any(|x| x.eq_ignore_ascii_case(&needle))
        }
        Operator::Contains => match fact {
            FactValue::List(items) => {
                let needle = scalar_str(value);
                items.iter().any(|x| x.eq_ignore_ascii_case(&needle))
            }
            other => fact_to_string(other)
                .to_ascii_lowercase()
                .contains(&scalar_str(value).to_ascii_lowercase()),
        },
        Operator::DoesNotContain => !compare(fact, Operator::Contains, value),
        Operator::Like => glob_match(&scalar_str(value), &fact_to_string(fact)),
        Operator::BeginsWith => fact_to_string(fact)
            .to_ascii_lowercase()
            .starts_with(&scalar_str(value).to_ascii_lowercase()),
        Operator::EndsWith => fact_to_string(fact)
            .to_ascii_lowercase()
            .ends_with(&scalar_str(value).to_ascii_lowercase()),
        Operator::Eq | Operator::Ne | Operator::Gt | Operator::Lt | Operator::Ge | Operator::Le => {
            numeric_or_string_compare(fact, op, &scalar_str(value))
        }
    }
}

fn numeric_or_string_compare(fact: &FactValue, op: Operator, rhs: &str) -> bool {
    let ordering = match (fact, rhs.parse::<f64>()) {
        (FactValue::Number(n), Ok(rhs_n)) => n.partial_cmp(&rhs_n),
        _ => {
            let lhs = fact_to_string(fact).to_ascii_lowercase();
            let rhs = rhs.to_ascii_lowercase();
            Some(lhs.cmp(&rhs))
        }
    };

    let ordering = match ordering {
        Some(o) => o,
        None => return false,
    };

    use std::cmp::Ordering::*;
    match op {
        Operator::Eq => ordering == Equal,
        Operator::Ne => ordering != Equal,
        Operator::Gt => ordering == Greater,
        Operator::Lt => ordering == Less,
        Operator::Ge => ordering != Less,
        Operator::Le => ordering != Greater,
        _ => unreachable!(),
    }
}

fn scalar_str(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Array(v) => v.join(","),
    }
}

fn fact_to_string(fact: &FactValue) -> String {
    match fact {
        FactValue::Str(s) => s.clone(),
        FactValue::Bool(b) => b.to_string(),
        FactValue::Number(n) => n.to_string(),
        FactValue::List(v) => v.join(","),
    }
}

// --- Tokenizer ---------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Any,
    Operator(Operator),
    Str(String),
    Array(Vec<String>),
    Word(String),
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Lexer {
            chars: input.chars().peekable(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, ConditionParseError> {
        let mut tokens = Vec::new();

        while let Some(&c) = self.chars.peek() {
            match c {
                c if c.is_whitespace() => {
                    self.chars.next();
                }
                '(' => {
                    self.chars.next();
                    tokens.push(Token::LParen);
                }
                ')' => {
                    self.chars.next();
                    tokens.push(Token::RParen);
                }
                '"' | '\'' => {
                    tokens.push(Token::Str(self.read_quoted(c)?));
                }
                '[' => {
                    tokens.push(Token::Array(self.read_array()?));
                }
                _ => {
                    tokens.push(self.read_word());
                }
            }
        }

        Ok(tokens)
    }

    fn read_quoted(&mut self, quote: char) -> Result<String, ConditionParseError> {
        self.chars.next(); // consume opening quote
        let mut s = String::new();
        loop {
            match self.chars.next() {
                Some(c) if c == quote => return Ok(s),
                Some(c) => s.push(c),
                None => return Err(ConditionParseError::UnterminatedString),
            }
        }
    }

    fn read_array(&mut self) -> Result<Vec<String>, ConditionParseError> {
        self.chars.next(); // consume '['
        let mut raw = String::new();
        loop {
            match self.chars.next() {
                Some(']') => break,
                Some(c) => raw.push(c),
                None => return Err(ConditionParseError::UnterminatedArray),
            }
        }
        Ok(raw
            .split(',')
            .map(|x| x.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
            .filter(|x| !x.is_empty())
            .collect())
    }

    fn read_word(&mut self) -> Token {
        let mut s = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || c == '(' || c == ')' {
                break;
            }
            s.push(c);
            self.chars.next();
        }

        match s.to_ascii_uppercase().as_str() {
            "AND" => Token::And,
            "OR" => Token::Or,
            "NOT" => Token::Not,
            "ANY" => Token::Any,
            _ => {
                if let Ok(op) = Operator::from_str(&s) {
                    Token::Operator(op)
                } else {
                    Token::Word(s)
                }
            }
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_expr(&mut self) -> Result<Expr, ConditionParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionParseError> {
        let mut terms = vec![self.parse_and()?];
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            Expr::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionParseError> {
        let mut terms = vec![self.parse_unary()?];
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            Expr::And(terms)
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionParseError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.next();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionParseError> {
        if matches!(self.peek(), Some(Token::LParen)) {
            self.next();
            let expr = self.parse_expr()?;
            match self.next() {
                Some(Token::RParen) => Ok(expr),
                Some(t) => Err(ConditionParseError::UnexpectedToken(format!("{:?}", t))),
                None => Err(ConditionParseError::UnexpectedEof),
            }
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionParseError> {
        let any = if matches!(self.peek(), Some(Token::Any)) {
            self.next();
            true
        } else {
            false
        };

        let key = match self.next() {
            Some(Token::Word(w)) => w,
            Some(t) => return Err(ConditionParseError::ExpectedKey(format!("{:?}", t))),
            None => return Err(ConditionParseError::UnexpectedEof),
        };

        let op = match self.next() {
            Some(Token::Operator(op)) => op,
            Some(t) => return Err(ConditionParseError::UnexpectedToken(format!("{:?}", t))),
            None => return Err(ConditionParseError::UnexpectedEof),
        };

        let value = match self.next() {
            Some(Token::Str(s)) => Value::Str(s),
            Some(Token::Word(w)) => Value::Str(w),
            Some(Token::Array(items)) => Value::Array(items),
            Some(t) => return Err(ConditionParseError::UnexpectedToken(format!("{:?}", t))),
            None => return Err(ConditionParseError::UnexpectedEof),
        };

        Ok(Expr::Comparison { any, key, op, value })
    }
}

fn parse_str_expr(input: &str) -> Result<Expr, ConditionParseError> {
    let tokens = Lexer::new(input).tokenize()?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ConditionParseError::UnexpectedToken(format!(
            "{:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

/// A condition gating a `ConditionalItem` (spec §3). Wraps the parsed AST;
/// construct from either the string grammar above or the legacy
/// `{key, operator, value}` document shape via `Deserialize`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionExpression(pub(crate) Expr);

impl ConditionExpression {
    pub fn evaluate(&self, facts: &HashMap<String, FactValue>) -> bool {
        self.0.evaluate(facts)
    }

    /// An `Invalid` condition: the manifest's condition failed to parse.
    /// Always evaluates to `false`, matching spec §7's `ConditionParseError`
    /// recovery rule.
    pub fn invalid() -> Self {
        ConditionExpression(Expr::Invalid)
    }
}

impl FromStr for ConditionExpression {
    type Err = ConditionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_str_expr(s).map(ConditionExpression)
    }
}

impl fmt::Display for ConditionExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyValue {
    Str(String),
    List(Vec<String>),
}

impl From<LegacyValue> for Value {
    fn from(v: LegacyValue) -> Self {
        match v {
            LegacyValue::Str(s) => Value::Str(s),
            LegacyValue::List(v) => Value::Array(v),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCondition {
    StringExpr(String),
    Triple {
        key: String,
        operator: String,
        value: LegacyValue,
    },
    Compound {
        operator: String,
        conditions: Vec<RawCondition>,
    },
}

impl RawCondition {
    fn into_expr(self) -> Expr {
        match self {
            RawCondition::StringExpr(s) => parse_str_expr(&s).unwrap_or_else(|e| {
                log::warn!("conditional item: could not parse condition `{}`: {}; treating as false", s, e);
                Expr::Invalid
            }),
            RawCondition::Triple {
                key,
                operator,
                value,
            } => match Operator::from_str(&operator) {
                Ok(op) => Expr::Comparison {
                    any: false,
                    key,
                    op,
                    value: value.into(),
                },
                Err(e) => {
                    log::warn!("conditional item: unknown operator `{}`: {}; treating as false", operator, e);
                    Expr::Invalid
                }
            },
            RawCondition::Compound {
                operator,
                conditions,
            } => {
                let exprs: Vec<Expr> = conditions.into_iter().map(RawCondition::into_expr).collect();
                match operator.to_ascii_uppercase().as_str() {
                    "AND" => Expr::And(exprs),
                    "OR" => Expr::Or(exprs),
                    _ => {
                        log::warn!("conditional item: unknown compound operator `{}`; treating as false", operator);
                        Expr::Invalid
                    }
                }
            }
        }
    }
}

impl<'de> Deserialize<'de> for ConditionExpression {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawCondition::deserialize(deserializer)?;
        Ok(ConditionExpression(raw.into_expr()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;

    fn facts() -> HashMap<String, FactValue> {
        hashmap! {
            "enrolled_usage".to_string() => FactValue::Str("Shared".to_string()),
            "enrolled_area".to_string() => FactValue::Str("Lab".to_string()),
            "catalogs".to_string() => FactValue::List(vec!["Testing".to_string()]),
            "arch".to_string() => FactValue::Str("arm64".to_string()),
        }
    }

    #[test]
    fn test_simple_eq() {
        let expr = ConditionExpression::from_str(r#"enrolled_usage == "Shared""#).unwrap();
        assert!(expr.evaluate(&facts()));
    }

    #[test]
    fn test_and_or_precedence() {
        let expr = ConditionExpression::from_str(
            r#"enrolled_usage == "Shared" AND enrolled_area != "Classroom" OR arch == "x64""#,
        )
        .unwrap();
        assert!(expr.evaluate(&facts()));
    }

    #[test]
    fn test_not() {
        let expr = ConditionExpression::from_str(r#"NOT arch == "x64""#).unwrap();
        assert!(expr.evaluate(&facts()));
    }

    #[test]
    fn test_parens() {
        let expr = ConditionExpression::from_str(
            r#"(enrolled_usage == "Shared" OR arch == "x64") AND enrolled_area == "Lab""#,
        )
        .unwrap();
        assert!(expr.evaluate(&facts()));
    }

    #[test]
    fn test_any_over_array_no_element_differs() {
        // Spec §8 boundary: ANY catalogs != "Testing" against
        // facts.catalogs = ["Testing"] evaluates to false.
        let expr = ConditionExpression::from_str(r#"ANY catalogs != "Testing""#).unwrap();
        assert!(!expr.evaluate(&facts()));
    }

    #[test]
    fn test_any_over_array_matches() {
        let mut f = facts();
        f.insert(
            "catalogs".to_string(),
            FactValue::List(vec!["Testing".to_string(), "Production".to_string()]),
        );
        let expr = ConditionExpression::from_str(r#"ANY catalogs != "Testing""#).unwrap();
        assert!(expr.evaluate(&f));
    }

    #[test]
    fn test_like_wildcard() {
        let expr = ConditionExpression::from_str(r#"arch LIKE "arm*""#).unwrap();
        assert!(expr.evaluate(&facts()));
    }

    #[test]
    fn test_in_operator() {
        let expr = ConditionExpression::from_str(r#"arch IN ["x64", "arm64"]"#).unwrap();
        assert!(expr.evaluate(&facts()));
    }

    #[test]
    fn test_begins_ends_with() {
        let expr = ConditionExpression::from_str(r#"arch BEGINSWITH "arm""#).unwrap();
        assert!(expr.evaluate(&facts()));
        let expr = ConditionExpression::from_str(r#"arch ENDSWITH "64""#).unwrap();
        assert!(expr.evaluate(&facts()));
    }

    #[test]
    fn test_case_insensitive_strings() {
        let expr = ConditionExpression::from_str(r#"enrolled_usage == "SHARED""#).unwrap();
        assert!(expr.evaluate(&facts()));
    }

    #[test]
    fn test_legacy_triple_via_yaml() {
        let yaml = "key: enrolled_usage\noperator: \"==\"\nvalue: Shared\n";
        let expr: ConditionExpression = serde_yaml::from_str(yaml).unwrap();
        assert!(expr.evaluate(&facts()));
    }

    #[test]
    fn test_legacy_compound_via_yaml() {
        let yaml = "operator: AND\nconditions:\n  - key: enrolled_usage\n    operator: \"==\"\n    value: Shared\n  - key: enrolled_area\n    operator: \"!=\"\n    value: Classroom\n";
        let expr: ConditionExpression = serde_yaml::from_str(yaml).unwrap();
        assert!(expr.evaluate(&facts()));
    }

    #[test]
    fn test_invalid_condition_evaluates_false() {
        let expr = ConditionExpression::invalid();
        assert!(!expr.evaluate(&facts()));
    }

    #[test]
    fn test_malformed_string_condition_is_invalid_not_panic() {
        let yaml = "\"enrolled_usage ===> broken\"";
        let expr: ConditionExpression = serde_yaml::from_str(yaml).unwrap();
        assert!(!expr.evaluate(&facts()));
    }
}
