//! Evaluation of the data subset of JavaScript that fixture scripts are
//! written in: literals, arithmetic, member access and a handful of numeric
//! globals. Nothing here can reach the host.

use std::{
    ops::Range,
    time::{Duration, Instant},
};

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use wptnn_core::tensor::encode_f64;

use crate::{
    lexer::{mentions, Lexer, Token, TokenKind},
    ExtractionError,
};

const MAX_DEPTH: usize = 128;
const MAX_ARRAY_LEN: usize = 1 << 24;

/// Keywords that start a new statement when they begin a line.
const STATEMENT_KEYWORDS: &[&str] = &[
    "const", "let", "var", "function", "async", "class", "if", "for", "while", "do", "try",
    "switch", "return", "import", "export",
];

#[derive(Debug, Clone, PartialEq)]
pub enum JsValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    Str(String),
    Array(Vec<JsValue>),
    Object(Vec<(String, JsValue)>),
    Builtin(Builtin),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Builtin {
    Math(&'static str),
    TypedArray(ElementKind),
    TypedArrayFrom(ElementKind),
    Array,
    BigInt,
    Number,
    /// `array.fill` bound to its receiver.
    Fill(Vec<JsValue>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Float16,
    Float32,
    Float64,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    BigInt64,
    BigUint64,
}

const TYPED_ARRAYS: &[(&str, ElementKind)] = &[
    ("Float16Array", ElementKind::Float16),
    ("Float32Array", ElementKind::Float32),
    ("Float64Array", ElementKind::Float64),
    ("Int8Array", ElementKind::Int8),
    ("Uint8Array", ElementKind::Uint8),
    ("Int16Array", ElementKind::Int16),
    ("Uint16Array", ElementKind::Uint16),
    ("Int32Array", ElementKind::Int32),
    ("Uint32Array", ElementKind::Uint32),
    ("BigInt64Array", ElementKind::BigInt64),
    ("BigUint64Array", ElementKind::BigUint64),
];

const MATH_FUNCTIONS: &[&str] = &[
    "abs", "sqrt", "exp", "log", "pow", "min", "max", "floor", "ceil", "round", "sin", "cos",
    "tan", "tanh", "trunc", "sign",
];

impl JsValue {
    /// Converts to JSON the way the rest of the harness expects elements:
    /// BigInts and non-finite numbers become strings, `undefined` object
    /// entries are dropped.
    pub fn to_json(&self) -> Value {
        match self {
            JsValue::Undefined | JsValue::Null | JsValue::Builtin(_) => Value::Null,
            JsValue::Bool(b) => Value::Bool(*b),
            JsValue::Number(n) => encode_f64(*n),
            JsValue::BigInt(n) => Value::String(n.to_string()),
            JsValue::Str(s) => Value::String(s.clone()),
            JsValue::Array(vs) => Value::Array(vs.iter().map(JsValue::to_json).collect()),
            JsValue::Object(props) => Value::Object(
                props
                    .iter()
                    .filter(|(_, v)| !matches!(v, JsValue::Undefined | JsValue::Builtin(_)))
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<_, _>>(),
            ),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            JsValue::Undefined => "undefined",
            JsValue::Null => "null",
            JsValue::Bool(_) => "boolean",
            JsValue::Number(_) => "number",
            JsValue::BigInt(_) => "bigint",
            JsValue::Str(_) => "string",
            JsValue::Array(_) => "array",
            JsValue::Object(_) => "object",
            JsValue::Builtin(_) => "function",
        }
    }

    fn truthy(&self) -> bool {
        match self {
            JsValue::Undefined | JsValue::Null => false,
            JsValue::Bool(b) => *b,
            JsValue::Number(n) => *n != 0.0 && !n.is_nan(),
            JsValue::BigInt(n) => *n != 0,
            JsValue::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    fn display(&self) -> String {
        match self {
            JsValue::Undefined => "undefined".into(),
            JsValue::Null => "null".into(),
            JsValue::Bool(b) => b.to_string(),
            JsValue::Number(n) => number_to_string(*n),
            JsValue::BigInt(n) => n.to_string(),
            JsValue::Str(s) => s.clone(),
            JsValue::Array(vs) => vs
                .iter()
                .map(|v| match v {
                    JsValue::Undefined | JsValue::Null => String::new(),
                    v => v.display(),
                })
                .collect::<Vec<_>>()
                .join(","),
            JsValue::Object(_) => "[object Object]".into(),
            JsValue::Builtin(_) => "function".into(),
        }
    }
}

fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".into()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.into()
    } else if n == 0.0 {
        "0".into()
    } else {
        n.to_string()
    }
}

fn global(name: &str) -> Option<JsValue> {
    let value = match name {
        "Infinity" => JsValue::Number(f64::INFINITY),
        "NaN" => JsValue::Number(f64::NAN),
        "undefined" => JsValue::Undefined,
        "Array" => JsValue::Builtin(Builtin::Array),
        "BigInt" => JsValue::Builtin(Builtin::BigInt),
        "Number" => JsValue::Builtin(Builtin::Number),
        "Math" => {
            let mut props = vec![
                ("PI".to_string(), JsValue::Number(std::f64::consts::PI)),
                ("E".to_string(), JsValue::Number(std::f64::consts::E)),
                ("LN2".to_string(), JsValue::Number(std::f64::consts::LN_2)),
                ("LN10".to_string(), JsValue::Number(std::f64::consts::LN_10)),
                ("SQRT2".to_string(), JsValue::Number(std::f64::consts::SQRT_2)),
                ("SQRT1_2".to_string(), JsValue::Number(std::f64::consts::FRAC_1_SQRT_2)),
            ];
            props.extend(
                MATH_FUNCTIONS
                    .iter()
                    .map(|f| (f.to_string(), JsValue::Builtin(Builtin::Math(*f)))),
            );
            JsValue::Object(props)
        }
        _ => {
            let (_, kind) = TYPED_ARRAYS.iter().find(|(n, _)| *n == name)?;
            JsValue::Builtin(Builtin::TypedArray(*kind))
        }
    };
    Some(value)
}

fn number_constant(name: &str) -> JsValue {
    match name {
        "MAX_SAFE_INTEGER" => JsValue::Number(9007199254740991.0),
        "MIN_SAFE_INTEGER" => JsValue::Number(-9007199254740991.0),
        "MAX_VALUE" => JsValue::Number(f64::MAX),
        "MIN_VALUE" => JsValue::Number(5e-324),
        "EPSILON" => JsValue::Number(f64::EPSILON),
        "POSITIVE_INFINITY" => JsValue::Number(f64::INFINITY),
        "NEGATIVE_INFINITY" => JsValue::Number(f64::NEG_INFINITY),
        "NaN" => JsValue::Number(f64::NAN),
        _ => JsValue::Undefined,
    }
}

enum Binding {
    Pending(Range<usize>),
    Evaluating,
    Ready(JsValue),
    Failed(ExtractionError),
}

/// Evaluates declarations over an already lexed token list. Initializers
/// are evaluated the first time they are referenced.
pub struct Evaluator<'t> {
    tokens: &'t [Token],
    bindings: FxHashMap<String, Binding>,
    pos: usize,
    end: usize,
    eof: Token,
    depth: usize,
    deadline: Instant,
    budget: Duration,
}

type EvalResult = Result<JsValue, ExtractionError>;

impl<'t> Evaluator<'t> {
    pub fn new(tokens: &'t [Token], deadline: Instant, budget: Duration) -> Self {
        Self {
            tokens,
            bindings: FxHashMap::default(),
            pos: 0,
            end: 0,
            eof: eof_token(0),
            depth: 0,
            deadline,
            budget,
        }
    }

    pub fn declare(&mut self, name: impl Into<String>, init: Option<Range<usize>>) {
        let binding = match init {
            Some(range) => Binding::Pending(range),
            None => Binding::Ready(JsValue::Undefined),
        };
        self.bindings.insert(name.into(), binding);
    }

    /// Evaluates the binding `name`, or the global of that name.
    pub fn lookup(&mut self, name: &str) -> EvalResult {
        let range = match self.bindings.get(name) {
            Some(Binding::Ready(v)) => return Ok(v.clone()),
            Some(Binding::Failed(e)) => return Err(e.clone()),
            Some(Binding::Evaluating) => {
                return Err(self.error(format!("'{name}' is used before its initialization")))
            }
            Some(Binding::Pending(range)) => range.clone(),
            None => {
                return global(name).ok_or_else(|| self.error(format!("{name} is not defined")))
            }
        };

        self.bindings.insert(name.to_string(), Binding::Evaluating);
        let result = self.evaluate_range(range);
        let binding = match &result {
            Ok(v) => Binding::Ready(v.clone()),
            Err(e) => Binding::Failed(e.clone()),
        };
        self.bindings.insert(name.to_string(), binding);
        result
    }

    fn evaluate_range(&mut self, range: Range<usize>) -> EvalResult {
        let eof_line = self
            .tokens
            .get(range.end)
            .or_else(|| self.tokens.last())
            .map_or(0, |t| t.line);
        let saved = (
            self.pos,
            self.end,
            std::mem::replace(&mut self.eof, eof_token(eof_line)),
        );
        self.pos = range.start;
        self.end = range.end.min(self.tokens.len());

        let result = self.expression().and_then(|v| {
            if self.pos == self.end {
                Ok(v)
            } else {
                Err(self.syntax(format!("unexpected {}", self.peek().describe())))
            }
        });

        (self.pos, self.end, self.eof) = saved;
        result
    }

    fn peek(&self) -> &Token {
        if self.pos < self.end {
            &self.tokens[self.pos]
        } else {
            &self.eof
        }
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.end {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, punct: &str) -> bool {
        if self.peek().is_punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &str) -> Result<(), ExtractionError> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(self.syntax(format!(
                "expected '{punct}', found {}",
                self.peek().describe()
            )))
        }
    }

    fn error(&self, message: impl Into<String>) -> ExtractionError {
        ExtractionError::Evaluation {
            line: self.peek().line,
            message: message.into(),
        }
    }

    fn syntax(&self, message: impl Into<String>) -> ExtractionError {
        ExtractionError::Syntax {
            line: self.peek().line,
            message: message.into(),
        }
    }

    fn step(&self) -> Result<(), ExtractionError> {
        if Instant::now() >= self.deadline {
            Err(ExtractionError::Timeout(self.budget))
        } else {
            Ok(())
        }
    }

    fn expression(&mut self) -> EvalResult {
        self.depth += 1;
        let result = if self.depth > MAX_DEPTH {
            Err(self.error("expression nested too deeply"))
        } else {
            self.conditional()
        };
        self.depth -= 1;
        result
    }

    fn conditional(&mut self) -> EvalResult {
        let cond = self.additive()?;
        if !self.eat("?") {
            return Ok(cond);
        }
        if cond.truthy() {
            let then = self.expression()?;
            self.expect(":")?;
            self.skip_branch()?;
            Ok(then)
        } else {
            self.skip_branch()?;
            self.expect(":")?;
            self.expression()
        }
    }

    /// Steps over one branch of a conditional without evaluating it.
    fn skip_branch(&mut self) -> Result<(), ExtractionError> {
        let (mut depth, mut pending) = (0usize, 0usize);
        loop {
            self.step()?;
            match &self.peek().kind {
                TokenKind::Eof => return Ok(()),
                TokenKind::Punct("(" | "[" | "{") => depth += 1,
                TokenKind::Punct(")" | "]" | "}" | "," | ";") if depth == 0 => return Ok(()),
                TokenKind::Punct(")" | "]" | "}") => depth -= 1,
                TokenKind::Punct("?") if depth == 0 => pending += 1,
                TokenKind::Punct(":") if depth == 0 => {
                    if pending == 0 {
                        return Ok(());
                    }
                    pending -= 1;
                }
                _ => {}
            }
            self.pos += 1;
        }
    }

    fn additive(&mut self) -> EvalResult {
        let mut lhs = self.multiplicative()?;
        loop {
            if self.eat("+") {
                let rhs = self.multiplicative()?;
                lhs = self.add(lhs, rhs)?;
            } else if self.eat("-") {
                let rhs = self.multiplicative()?;
                lhs = self.arith("-", lhs, rhs)?;
            } else {
                return Ok(lhs);
            }
        }
    }

    fn multiplicative(&mut self) -> EvalResult {
        let mut lhs = self.exponent()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Punct(op @ ("*" | "/" | "%")) => *op,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.exponent()?;
            lhs = self.arith(op, lhs, rhs)?;
        }
    }

    fn exponent(&mut self) -> EvalResult {
        let base = self.unary()?;
        if !self.eat("**") {
            return Ok(base);
        }
        self.depth += 1;
        let exp = if self.depth > MAX_DEPTH {
            Err(self.error("expression nested too deeply"))
        } else {
            self.exponent()
        };
        self.depth -= 1;
        self.arith("**", base, exp?)
    }

    fn unary(&mut self) -> EvalResult {
        let op = match &self.peek().kind {
            TokenKind::Punct(op @ ("-" | "+" | "!")) => *op,
            _ => return self.postfix(),
        };
        self.pos += 1;
        self.depth += 1;
        let operand = if self.depth > MAX_DEPTH {
            Err(self.error("expression nested too deeply"))
        } else {
            self.unary()
        };
        self.depth -= 1;
        let operand = operand?;
        match (op, operand) {
            ("!", v) => Ok(JsValue::Bool(!v.truthy())),
            ("-", JsValue::BigInt(n)) => n
                .checked_neg()
                .map(JsValue::BigInt)
                .ok_or_else(|| self.error("bigint arithmetic overflow")),
            ("-", v) => Ok(JsValue::Number(-self.to_number(&v)?)),
            (_, v) => Ok(JsValue::Number(self.to_number(&v)?)),
        }
    }

    fn postfix(&mut self) -> EvalResult {
        let mut value = self.primary()?;
        loop {
            if self.eat(".") {
                let name = self.property_name()?;
                value = self.member(value, &name)?;
            } else if self.eat("?.") {
                if matches!(value, JsValue::Undefined | JsValue::Null) {
                    self.property_name()?;
                    value = JsValue::Undefined;
                } else {
                    let name = self.property_name()?;
                    value = self.member(value, &name)?;
                }
            } else if self.eat("[") {
                let key = self.expression()?;
                self.expect("]")?;
                value = self.index(value, key)?;
            } else if self.peek().is_punct("(") {
                let args = self.arguments()?;
                value = self.call(value, args)?;
            } else {
                return Ok(value);
            }
        }
    }

    fn property_name(&mut self) -> Result<String, ExtractionError> {
        match self.bump().kind {
            TokenKind::Ident(name) => Ok(name),
            _ => Err(self.syntax("expected a property name")),
        }
    }

    fn arguments(&mut self) -> Result<Vec<JsValue>, ExtractionError> {
        self.expect("(")?;
        let mut args = vec![];
        while !self.eat(")") {
            if self.eat("...") {
                match self.expression()? {
                    JsValue::Array(vs) => args.extend(vs),
                    v => return Err(self.error(format!("{} is not iterable", v.type_name()))),
                }
            } else {
                args.push(self.expression()?);
            }
            if !self.eat(",") {
                self.expect(")")?;
                break;
            }
        }
        Ok(args)
    }

    fn primary(&mut self) -> EvalResult {
        self.step()?;
        let token = self.bump();
        match token.kind {
            TokenKind::Number(n) => Ok(JsValue::Number(n)),
            TokenKind::BigInt(n) => Ok(JsValue::BigInt(n)),
            TokenKind::Str(s) => Ok(JsValue::Str(s)),
            TokenKind::Template {
                raw,
                substitutions: false,
            } => Ok(JsValue::Str(raw)),
            TokenKind::Template { .. } => Err(self.error("template substitutions are not supported")),
            TokenKind::Ident(id) => match id.as_str() {
                "true" => Ok(JsValue::Bool(true)),
                "false" => Ok(JsValue::Bool(false)),
                "null" => Ok(JsValue::Null),
                "new" => self.construct(),
                _ => self.lookup(&id),
            },
            TokenKind::Punct("(") => {
                let v = self.expression()?;
                self.expect(")")?;
                Ok(v)
            }
            TokenKind::Punct("[") => self.array_literal(),
            TokenKind::Punct("{") => self.object_literal(),
            _ => Err(self.syntax(format!("unexpected {}", token.describe()))),
        }
    }

    /// `new Callee(args)`: the callee is a primary with member accesses only.
    fn construct(&mut self) -> EvalResult {
        let mut callee = self.primary()?;
        loop {
            if self.eat(".") {
                let name = self.property_name()?;
                callee = self.member(callee, &name)?;
            } else if self.eat("[") {
                let key = self.expression()?;
                self.expect("]")?;
                callee = self.index(callee, key)?;
            } else {
                break;
            }
        }
        let args = if self.peek().is_punct("(") {
            self.arguments()?
        } else {
            vec![]
        };
        self.call(callee, args)
    }

    fn array_literal(&mut self) -> EvalResult {
        let mut elems = vec![];
        loop {
            if self.eat("]") {
                return Ok(JsValue::Array(elems));
            }
            if self.eat(",") {
                elems.push(JsValue::Undefined);
                continue;
            }
            if self.eat("...") {
                match self.expression()? {
                    JsValue::Array(vs) => elems.extend(vs),
                    JsValue::Str(s) => elems.extend(s.chars().map(|c| JsValue::Str(c.into()))),
                    v => return Err(self.error(format!("{} is not iterable", v.type_name()))),
                }
            } else {
                elems.push(self.expression()?);
            }
            if !self.eat(",") {
                self.expect("]")?;
                return Ok(JsValue::Array(elems));
            }
        }
    }

    fn object_literal(&mut self) -> EvalResult {
        let mut props: Vec<(String, JsValue)> = vec![];
        while !self.eat("}") {
            if self.eat("...") {
                if let JsValue::Object(more) = self.expression()? {
                    for (k, v) in more {
                        set_property(&mut props, k, v);
                    }
                }
            } else {
                let key_token = self.bump();
                let key = match key_token.kind {
                    TokenKind::Ident(id) => {
                        if !self.peek().is_punct(":") {
                            // Shorthand `{name}`.
                            let v = self.lookup(&id)?;
                            set_property(&mut props, id, v);
                            if !self.eat(",") {
                                self.expect("}")?;
                                break;
                            }
                            continue;
                        }
                        id
                    }
                    TokenKind::Str(s) => s,
                    TokenKind::Number(n) => number_to_string(n),
                    TokenKind::BigInt(n) => n.to_string(),
                    TokenKind::Punct("[") => {
                        let key = self.expression()?.display();
                        self.expect("]")?;
                        key
                    }
                    _ => {
                        return Err(self.syntax(format!(
                            "unexpected {} in object literal",
                            key_token.describe()
                        )))
                    }
                };
                self.expect(":")?;
                let value = self.expression()?;
                set_property(&mut props, key, value);
            }
            if !self.eat(",") {
                self.expect("}")?;
                break;
            }
        }
        Ok(JsValue::Object(props))
    }

    fn member(&self, value: JsValue, name: &str) -> EvalResult {
        Ok(match value {
            JsValue::Undefined | JsValue::Null => {
                return Err(self.error(format!(
                    "cannot read properties of {} (reading '{name}')",
                    value.type_name()
                )))
            }
            JsValue::Array(vs) => match name {
                "length" => JsValue::Number(vs.len() as f64),
                "fill" => JsValue::Builtin(Builtin::Fill(vs)),
                _ => JsValue::Undefined,
            },
            JsValue::Str(s) if name == "length" => JsValue::Number(s.chars().count() as f64),
            JsValue::Object(props) => props
                .into_iter()
                .find(|(k, _)| k == name)
                .map_or(JsValue::Undefined, |(_, v)| v),
            JsValue::Builtin(Builtin::TypedArray(kind)) if name == "from" => {
                JsValue::Builtin(Builtin::TypedArrayFrom(kind))
            }
            JsValue::Builtin(Builtin::Number) => number_constant(name),
            _ => JsValue::Undefined,
        })
    }

    fn index(&self, value: JsValue, key: JsValue) -> EvalResult {
        match (value, key) {
            (JsValue::Array(vs), JsValue::Number(i)) => Ok(if i >= 0.0 && i.fract() == 0.0 {
                vs.into_iter().nth(i as usize).unwrap_or(JsValue::Undefined)
            } else {
                JsValue::Undefined
            }),
            (value, key) => self.member(value, &key.display()),
        }
    }

    fn call(&mut self, callee: JsValue, args: Vec<JsValue>) -> EvalResult {
        let builtin = match callee {
            JsValue::Builtin(builtin) => builtin,
            other => return Err(self.error(format!("{} is not a function", other.type_name()))),
        };
        match builtin {
            Builtin::Math(f) => self.math(f, &args),
            Builtin::Number => match args.first() {
                Some(JsValue::BigInt(n)) => Ok(JsValue::Number(*n as f64)),
                Some(v) => Ok(JsValue::Number(self.to_number(v)?)),
                None => Ok(JsValue::Number(0.0)),
            },
            Builtin::BigInt => match args.first() {
                Some(JsValue::BigInt(n)) => Ok(JsValue::BigInt(*n)),
                Some(JsValue::Number(n)) if n.fract() == 0.0 && n.abs() < 1.7e38 => {
                    Ok(JsValue::BigInt(*n as i128))
                }
                Some(JsValue::Str(s)) => s
                    .trim()
                    .parse::<i128>()
                    .map(JsValue::BigInt)
                    .map_err(|_| self.error(format!("cannot convert '{s}' to a BigInt"))),
                Some(JsValue::Bool(b)) => Ok(JsValue::BigInt(*b as i128)),
                _ => Err(self.error("cannot convert value to a BigInt")),
            },
            Builtin::Array => match args.as_slice() {
                [JsValue::Number(n)] => {
                    let len = self.array_length(*n)?;
                    Ok(JsValue::Array(vec![JsValue::Undefined; len]))
                }
                _ => Ok(JsValue::Array(args)),
            },
            Builtin::TypedArray(kind) => match args.into_iter().next() {
                None => Ok(JsValue::Array(vec![])),
                Some(JsValue::Number(n)) => {
                    let len = self.array_length(n)?;
                    let zero = match kind {
                        ElementKind::BigInt64 | ElementKind::BigUint64 => JsValue::BigInt(0),
                        _ => JsValue::Number(0.0),
                    };
                    Ok(JsValue::Array(vec![zero; len]))
                }
                Some(JsValue::Array(vs)) => self.typed_array(kind, vs),
                Some(v) => Err(self.error(format!(
                    "cannot construct a typed array from {}",
                    v.type_name()
                ))),
            },
            Builtin::TypedArrayFrom(kind) => match args.into_iter().next() {
                Some(JsValue::Array(vs)) => self.typed_array(kind, vs),
                _ => Err(self.error("typed array source must be an array")),
            },
            Builtin::Fill(mut vs) => {
                let value = args.first().cloned().unwrap_or(JsValue::Undefined);
                let len = vs.len() as f64;
                let bound = |arg: Option<&JsValue>, default: f64| -> Result<usize, ExtractionError> {
                    let n = match arg {
                        None | Some(JsValue::Undefined) => default,
                        Some(v) => self.to_number(v)?.trunc(),
                    };
                    let n = if n < 0.0 { (len + n).max(0.0) } else { n.min(len) };
                    Ok(if n.is_nan() { 0 } else { n as usize })
                };
                let start = bound(args.get(1), 0.0)?;
                let end = bound(args.get(2), len)?;
                for (i, slot) in vs.iter_mut().enumerate().take(end).skip(start) {
                    if i % 4096 == 0 {
                        self.step()?;
                    }
                    *slot = value.clone();
                }
                Ok(JsValue::Array(vs))
            }
        }
    }

    fn array_length(&self, n: f64) -> Result<usize, ExtractionError> {
        if n < 0.0 || n.fract() != 0.0 || n > MAX_ARRAY_LEN as f64 {
            Err(self.error(format!("invalid array length {}", number_to_string(n))))
        } else {
            Ok(n as usize)
        }
    }

    fn typed_array(&self, kind: ElementKind, values: Vec<JsValue>) -> EvalResult {
        values
            .into_iter()
            .map(|v| self.typed_element(kind, v))
            .collect::<Result<Vec<_>, _>>()
            .map(JsValue::Array)
    }

    fn typed_element(&self, kind: ElementKind, value: JsValue) -> EvalResult {
        let wrap = |bits: u32, signed: bool| -> EvalResult {
            let x = self.to_number(&value)?;
            Ok(JsValue::Number(wrap_int(x, bits, signed)))
        };
        match kind {
            ElementKind::Float32 => Ok(JsValue::Number(self.to_number(&value)? as f32 as f64)),
            // Kept at double precision; the backend rounds on load.
            ElementKind::Float16 | ElementKind::Float64 => {
                Ok(JsValue::Number(self.to_number(&value)?))
            }
            ElementKind::Int8 => wrap(8, true),
            ElementKind::Uint8 => wrap(8, false),
            ElementKind::Int16 => wrap(16, true),
            ElementKind::Uint16 => wrap(16, false),
            ElementKind::Int32 => wrap(32, true),
            ElementKind::Uint32 => wrap(32, false),
            ElementKind::BigInt64 | ElementKind::BigUint64 => match &value {
                JsValue::BigInt(n) => Ok(JsValue::BigInt(if kind == ElementKind::BigInt64 {
                    *n as i64 as i128
                } else {
                    *n as u64 as i128
                })),
                v => Err(self.error(format!("cannot convert {} to a BigInt", v.type_name()))),
            },
        }
    }

    fn math(&self, f: &str, args: &[JsValue]) -> EvalResult {
        let nums = args
            .iter()
            .map(|v| self.to_number(v))
            .collect::<Result<Vec<_>, _>>()?;
        let x = nums.first().copied().unwrap_or(f64::NAN);
        let y = nums.get(1).copied().unwrap_or(f64::NAN);
        let r = match f {
            "abs" => x.abs(),
            "sqrt" => x.sqrt(),
            "exp" => x.exp(),
            "log" => x.ln(),
            "pow" => js_pow(x, y),
            "min" => nums.iter().fold(f64::INFINITY, |a, &b| {
                if a.is_nan() || b.is_nan() {
                    f64::NAN
                } else {
                    a.min(b)
                }
            }),
            "max" => nums.iter().fold(f64::NEG_INFINITY, |a, &b| {
                if a.is_nan() || b.is_nan() {
                    f64::NAN
                } else {
                    a.max(b)
                }
            }),
            "floor" => x.floor(),
            "ceil" => x.ceil(),
            "round" => (x + 0.5).floor(),
            "sin" => x.sin(),
            "cos" => x.cos(),
            "tan" => x.tan(),
            "tanh" => x.tanh(),
            "trunc" => x.trunc(),
            "sign" => {
                if x.is_nan() || x == 0.0 {
                    x
                } else {
                    x.signum()
                }
            }
            _ => return Err(self.error(format!("Math.{f} is not supported"))),
        };
        Ok(JsValue::Number(r))
    }

    fn to_number(&self, value: &JsValue) -> Result<f64, ExtractionError> {
        Ok(match value {
            JsValue::Undefined => f64::NAN,
            JsValue::Null => 0.0,
            JsValue::Bool(b) => *b as u8 as f64,
            JsValue::Number(n) => *n,
            JsValue::BigInt(_) => {
                return Err(self.error("cannot convert a BigInt value to a number"))
            }
            JsValue::Str(s) => match s.trim() {
                "" => 0.0,
                "Infinity" | "+Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                t => t.parse::<f64>().unwrap_or(f64::NAN),
            },
            JsValue::Array(vs) if vs.is_empty() => 0.0,
            JsValue::Array(vs) if vs.len() == 1 => self.to_number(&vs[0])?,
            _ => f64::NAN,
        })
    }

    fn add(&self, lhs: JsValue, rhs: JsValue) -> EvalResult {
        let is_text = |v: &JsValue| {
            matches!(
                v,
                JsValue::Str(_) | JsValue::Array(_) | JsValue::Object(_) | JsValue::Builtin(_)
            )
        };
        if is_text(&lhs) || is_text(&rhs) {
            return Ok(JsValue::Str(lhs.display() + &rhs.display()));
        }
        self.arith("+", lhs, rhs)
    }

    fn arith(&self, op: &str, lhs: JsValue, rhs: JsValue) -> EvalResult {
        match (&lhs, &rhs) {
            (JsValue::BigInt(a), JsValue::BigInt(b)) => {
                let (a, b) = (*a, *b);
                let r = match op {
                    "+" => a.checked_add(b),
                    "-" => a.checked_sub(b),
                    "*" => a.checked_mul(b),
                    "/" | "%" if b == 0 => return Err(self.error("division by zero")),
                    "/" => a.checked_div(b),
                    "%" => a.checked_rem(b),
                    "**" if b < 0 => return Err(self.error("exponent must be non-negative")),
                    "**" => u32::try_from(b).ok().and_then(|b| a.checked_pow(b)),
                    _ => None,
                };
                r.map(JsValue::BigInt)
                    .ok_or_else(|| self.error("bigint arithmetic overflow"))
            }
            (JsValue::BigInt(_), _) | (_, JsValue::BigInt(_)) => {
                Err(self.error("cannot mix BigInt and other types"))
            }
            _ => {
                let (a, b) = (self.to_number(&lhs)?, self.to_number(&rhs)?);
                Ok(JsValue::Number(match op {
                    "+" => a + b,
                    "-" => a - b,
                    "*" => a * b,
                    "/" => a / b,
                    "%" => a % b,
                    _ => js_pow(a, b),
                }))
            }
        }
    }
}

fn eof_token(line: usize) -> Token {
    Token {
        kind: TokenKind::Eof,
        offset: 0,
        line,
        newline_before: false,
    }
}

fn set_property(props: &mut Vec<(String, JsValue)>, key: String, value: JsValue) {
    match props.iter_mut().find(|(k, _)| *k == key) {
        Some((_, v)) => *v = value,
        None => props.push((key, value)),
    }
}

fn js_pow(x: f64, y: f64) -> f64 {
    if y.is_nan() || ((x == 1.0 || x == -1.0) && y.is_infinite()) {
        f64::NAN
    } else {
        x.powf(y)
    }
}

/// JavaScript's ToInt8/ToUint8/... family: truncate, then wrap modulo 2^bits.
fn wrap_int(x: f64, bits: u32, signed: bool) -> f64 {
    if !x.is_finite() {
        return 0.0;
    }
    let m = 2f64.powi(bits as i32);
    let r = x.trunc().rem_euclid(m);
    if signed && r >= m / 2.0 {
        r - m
    } else {
        r
    }
}

/// Lexes on demand so that nothing after the extracted declaration needs to
/// be valid.
struct TokenStream<'a> {
    lexer: Lexer<'a>,
    tokens: Vec<Token>,
}

impl<'a> TokenStream<'a> {
    fn at(&mut self, i: usize) -> Result<&Token, ExtractionError> {
        while self.tokens.len() <= i {
            if self.tokens.last().map_or(false, Token::is_eof) {
                break;
            }
            let token = self.lexer.next_token()?;
            self.tokens.push(token);
        }
        Ok(&self.tokens[i.min(self.tokens.len() - 1)])
    }

    fn is_statement_start(&mut self, i: usize) -> Result<bool, ExtractionError> {
        let token = self.at(i)?;
        Ok(token.newline_before
            && matches!(&token.kind, TokenKind::Ident(id) if STATEMENT_KEYWORDS.contains(&id.as_str())))
    }
}

struct Declaration {
    name: String,
    init: Option<Range<usize>>,
}

/// Finds the top-level array declaration a fixture exports and evaluates it.
pub struct Script<'a> {
    source: &'a str,
    stream: TokenStream<'a>,
    declarations: Vec<Declaration>,
    /// Array declarations as (declaration index, source offset of their end).
    arrays: Vec<(usize, usize)>,
    deadline: Instant,
    budget: Duration,
}

/// The evaluated export of a fixture script.
#[derive(Debug, Clone, PartialEq)]
pub struct Export {
    pub name: String,
    pub value: Value,
}

impl<'a> Script<'a> {
    pub fn new(source: &'a str, budget: Duration) -> Self {
        Self {
            source,
            stream: TokenStream {
                lexer: Lexer::new(source),
                tokens: vec![],
            },
            declarations: vec![],
            arrays: vec![],
            deadline: Instant::now() + budget,
            budget,
        }
    }

    /// Locates the exported array and evaluates it together with whatever
    /// earlier declarations it references.
    pub fn evaluate_export(mut self) -> Result<Export, ExtractionError> {
        match self.scan() {
            Ok(()) => {}
            // Text after a usable declaration is allowed to be unparsable.
            Err(err @ ExtractionError::Syntax { .. }) if !self.arrays.is_empty() => {
                log::debug!("ignoring trailing script: {err}");
            }
            Err(err) => return Err(err),
        }
        let target = self.select().ok_or(ExtractionError::NoDeclaration)?;

        let name = self.declarations[target].name.clone();
        log::debug!("evaluating fixture export '{name}'");

        let mut evaluator = Evaluator::new(&self.stream.tokens, self.deadline, self.budget);
        for decl in &self.declarations[..=target] {
            evaluator.declare(decl.name.clone(), decl.init.clone());
        }
        match evaluator.lookup(&name)? {
            value @ JsValue::Array(_) => Ok(Export {
                name,
                value: value.to_json(),
            }),
            _ => Err(ExtractionError::NotAnArray(name)),
        }
    }

    /// Picks the array declaration named by the statements after the last
    /// array declaration. Failing that, the last array mentioned after its
    /// own declaration, and then the first array declared.
    fn select(&self) -> Option<usize> {
        let &(_, tail) = self.arrays.last()?;
        let trailing = &self.source[tail..];
        let named = |&&(index, _): &&(usize, usize)| {
            mentions(trailing, &self.declarations[index].name)
        };
        let mentioned = |&&(index, end): &&(usize, usize)| {
            mentions(&self.source[end..], &self.declarations[index].name)
        };
        self.arrays
            .iter()
            .rev()
            .find(named)
            .or_else(|| self.arrays.iter().rev().find(mentioned))
            .or_else(|| self.arrays.first())
            .map(|&(index, _)| index)
    }

    fn check_deadline(&self) -> Result<(), ExtractionError> {
        if Instant::now() >= self.deadline {
            Err(ExtractionError::Timeout(self.budget))
        } else {
            Ok(())
        }
    }

    /// Walks every top-level statement, recording declarations and where
    /// each array declaration ends.
    fn scan(&mut self) -> Result<(), ExtractionError> {
        let mut pos = 0;
        loop {
            self.check_deadline()?;
            let token = self.stream.at(pos)?;
            if token.is_eof() {
                return Ok(());
            }
            if !["const", "let", "var"].iter().any(|kw| token.is_ident(kw)) {
                pos = self.skip_statement(pos)?;
                continue;
            }

            pos += 1;
            loop {
                let name = match &self.stream.at(pos)?.kind {
                    TokenKind::Ident(name) => name.clone(),
                    // Destructuring patterns never hold the export.
                    _ => {
                        pos = self.skip_statement(pos)?;
                        break;
                    }
                };
                pos += 1;

                let init = if self.stream.at(pos)?.is_punct("=") {
                    let start = pos + 1;
                    pos = self.skip_expression(start)?;
                    Some(start..pos)
                } else {
                    None
                };
                let is_array = match &init {
                    Some(range) if !range.is_empty() => self.stream.at(range.start)?.is_punct("["),
                    _ => false,
                };
                self.declarations.push(Declaration {
                    name,
                    init,
                });

                if is_array {
                    let end = self.stream.at(pos)?.offset;
                    self.arrays.push((self.declarations.len() - 1, end));
                }

                let token = self.stream.at(pos)?;
                if token.is_punct(",") {
                    pos += 1;
                    continue;
                }
                if token.is_punct(";") {
                    pos += 1;
                }
                break;
            }
        }
    }

    /// Returns the index of the token that ends the expression at `start`.
    fn skip_expression(&mut self, start: usize) -> Result<usize, ExtractionError> {
        let mut depth = 0usize;
        let mut i = start;
        loop {
            if i % 1024 == 0 {
                self.check_deadline()?;
            }
            if depth == 0 && i > start && self.stream.is_statement_start(i)? {
                return Ok(i);
            }
            let token = self.stream.at(i)?;
            match &token.kind {
                TokenKind::Eof => return Ok(i),
                TokenKind::Punct("(" | "[" | "{") => depth += 1,
                TokenKind::Punct(")" | "]" | "}") if depth == 0 => return Ok(i),
                TokenKind::Punct(")" | "]" | "}") => depth -= 1,
                TokenKind::Punct(";" | ",") if depth == 0 => return Ok(i),
                _ => {}
            }
            i += 1;
        }
    }

    /// Returns the index of the first token after the statement at `start`.
    fn skip_statement(&mut self, start: usize) -> Result<usize, ExtractionError> {
        let mut depth = 0usize;
        let mut i = start;
        loop {
            if i % 1024 == 0 {
                self.check_deadline()?;
            }
            if depth == 0 && i > start && self.stream.is_statement_start(i)? {
                return Ok(i);
            }
            let token = self.stream.at(i)?;
            match &token.kind {
                TokenKind::Eof => return Ok(i),
                TokenKind::Punct("(" | "[" | "{") => depth += 1,
                TokenKind::Punct("}") if depth > 1 => depth -= 1,
                TokenKind::Punct("}") => {
                    depth = 0;
                    let next = self.stream.at(i + 1)?;
                    let continues = matches!(&next.kind, TokenKind::Ident(kw) if ["else", "catch", "finally", "while"].contains(&kw.as_str()))
                        || matches!(next.kind, TokenKind::Punct("." | "?." | "(" | ")" | "," | "[" | "]"));
                    if !continues {
                        // A trailing `;` belongs to this statement.
                        return Ok(if next.is_punct(";") { i + 2 } else { i + 1 });
                    }
                }
                TokenKind::Punct(")" | "]") => depth = depth.saturating_sub(1),
                TokenKind::Punct(";") if depth == 0 => return Ok(i + 1),
                _ => {}
            }
            i += 1;
        }
    }
}

#[cfg(test)]
fn eval(src: &str) -> Result<Value, ExtractionError> {
    Script::new(&format!("const x = {src};\nrun(x);"), Duration::from_secs(5))
        .evaluate_export()
        .map(|e| e.value)
}

#[test]
fn evaluate_literals() {
    use serde_json::json;

    assert_eq!(
        eval("[1, -2.5, 'a', \"b\", true, null, undefined, 1e400, -Infinity, NaN, 12n]").unwrap(),
        json!([1, -2.5, "a", "b", true, null, null, "Infinity", "-Infinity", "NaN", "12"])
    );
    assert_eq!(
        eval("[{a: 1, 'b': [2,], [`c`]: {d: undefined}, 4: 5},]").unwrap(),
        json!([{"a": 1, "b": [2], "c": {}, "4": 5}])
    );
    assert_eq!(eval("[1, , 2]").unwrap(), json!([1, null, 2]));
}

#[test]
fn evaluate_arithmetic() {
    use serde_json::json;

    assert_eq!(
        eval("[1 + 2 * 3, (1 + 2) * 3, 2 ** 3 ** 2, 7 % 4, 1 / 0, 'a' + 1, -(3), !0]").unwrap(),
        json!([7, 9, 512, 3, "Infinity", "a1", -3, true])
    );
    assert_eq!(
        eval("[2n ** 64n, -5n, 10n / 3n]").unwrap(),
        json!(["18446744073709551616", "-5", "3"])
    );
    assert!(matches!(
        eval("[1n + 1]"),
        Err(ExtractionError::Evaluation { .. })
    ));
    assert!(matches!(
        eval("[-((-2n) ** 127n)]"),
        Err(ExtractionError::Evaluation { ref message, .. }) if message == "bigint arithmetic overflow"
    ));
}

#[test]
fn conditional_skips_the_branch_not_taken() {
    use serde_json::json;

    assert_eq!(
        eval("[1 ? 'a' : window.x, 0 ? window.x : 'b', 0 ? 1 : 1 ? 2 : 3, 1 ? 0 ? 4 : 5 : [window]]")
            .unwrap(),
        json!(["a", "b", 2, 5])
    );
    assert!(matches!(
        eval("[0 ? 1 : window.x]"),
        Err(ExtractionError::Evaluation { ref message, .. }) if message == "window is not defined"
    ));
}

#[test]
fn evaluate_globals() {
    use serde_json::json;

    assert_eq!(
        eval("[Math.max(1, 3, 2), Math.floor(Math.PI), Number.MAX_SAFE_INTEGER, Math.round(-0.5)]")
            .unwrap(),
        json!([3, 3, 9007199254740991i64, 0])
    );
    assert_eq!(
        eval("[new Float32Array([0.1, 2]), Int8Array.from([200, -129]), new Uint8Array(2)]")
            .unwrap(),
        json!([[0.10000000149011612, 2], [-56, 127], [0, 0]])
    );
    assert_eq!(
        eval("[new BigInt64Array([2n ** 63n]), BigInt(5), Array(3).fill(7), [1, 2].length]")
            .unwrap(),
        json!([["-9223372036854775808"], "5", [7, 7, 7], 2])
    );
    assert!(matches!(
        eval("[window.location]"),
        Err(ExtractionError::Evaluation { ref message, .. }) if message == "window is not defined"
    ));
}

#[test]
fn references_resolve_lazily() {
    use serde_json::json;

    let src = "'use strict';
function helper(a) { return a * 2; }
const broken = helper(2);
const shape = [2, 3];
let data = Array(6).fill(0.5), other = 1;
const tests = [{shape, data: [...data], size: shape[0] * shape[1]}];
if (navigator.ml) {
  tests.forEach((t) => promise_test(async () => {}, t.name));
} else {
  test(() => assert_implements(navigator.ml, 'missing navigator.ml'));
}
";
    let export = Script::new(src, Duration::from_secs(5))
        .evaluate_export()
        .unwrap();
    assert_eq!(export.name, "tests");
    assert_eq!(
        export.value,
        json!([{"shape": [2, 3], "data": [0.5, 0.5, 0.5, 0.5, 0.5, 0.5], "size": 6}])
    );
}

#[test]
fn export_prefers_referenced_declarations() {
    let src = "const unused = [1];\nconst cases = [2];\ncases.forEach(run);";
    let export = Script::new(src, Duration::from_secs(5))
        .evaluate_export()
        .unwrap();
    assert_eq!(export.name, "cases");

    // Text after the last array declaration does not need to lex.
    let src = "const only = [1];\nconst s = 'unterminated";
    let export = Script::new(src, Duration::from_secs(5))
        .evaluate_export()
        .unwrap();
    assert_eq!(export.name, "only");

    let src = "const kShape = [2];
const reluTests = [{name: 'relu', shape: kShape}];
const kExtra = [kShape];
if (navigator.ml) {
  reluTests.forEach((t) => run(t, kShape));
}";
    let export = Script::new(src, Duration::from_secs(5))
        .evaluate_export()
        .unwrap();
    assert_eq!(export.name, "reluTests");

    // The harness call may come before a trailing unused array.
    let src = "const kShape = [2];\nconst tests = [{shape: kShape}];\nrun(tests);\nconst kUnused = [3];";
    let export = Script::new(src, Duration::from_secs(5))
        .evaluate_export()
        .unwrap();
    assert_eq!(export.name, "tests");
}

#[test]
fn extraction_failures() {
    let budget = Duration::from_secs(5);
    assert_eq!(
        Script::new("const a = 1;\nrun(a);", budget).evaluate_export(),
        Err(ExtractionError::NoDeclaration)
    );
    assert_eq!(
        Script::new("const a = [1, 2].length;\nrun(a);", budget).evaluate_export(),
        Err(ExtractionError::NotAnArray("a".into()))
    );
    assert!(matches!(
        Script::new("const a = [b];\nrun(a);\nconst b = 1;", budget).evaluate_export(),
        Err(ExtractionError::Evaluation { .. })
    ));
    assert!(matches!(
        Script::new("const a = [1 2];\nrun(a);", budget).evaluate_export(),
        Err(ExtractionError::Syntax { line: 1, .. })
    ));

    let deep = format!("const a = {}1{};\nrun(a);", "[".repeat(500), "]".repeat(500));
    assert!(matches!(
        Script::new(&deep, budget).evaluate_export(),
        Err(ExtractionError::Evaluation { .. })
    ));
}

#[test]
fn extraction_times_out() {
    let big = format!(
        "const a = [{}];\nrun(a);",
        vec!["Array(4096).fill(1)"; 4096].join(", ")
    );
    assert_eq!(
        Script::new(&big, Duration::ZERO).evaluate_export(),
        Err(ExtractionError::Timeout(Duration::ZERO))
    );
}
