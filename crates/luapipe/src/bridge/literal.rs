//! Literal text for values sent to the worker.
//!
//! The worker evaluates each message body as an expression, so values are written as
//! literals of its own language: `nil`, `true`, numbers, quoted strings, table
//! constructors `{[k]=v,...}`, and `chunks[n]` for function handles.

use std::fmt::Write as _;

use crate::error::{BridgeError, Result};
use crate::value::{FunctionHandle, InstanceId, Key, MAX_EXACT_INTEGER, Table, Value};

/// Deepest nesting level `encode_value` accepts.
pub const MAX_DEPTH: usize = 100;

/// Nesting limit when reading literals; leaves room for the message envelope.
const PARSE_DEPTH_LIMIT: usize = MAX_DEPTH + 16;

/// Encode a value as literal text for the interpreter `instance`.
pub fn to_literal(value: &Value, instance: InstanceId) -> Result<String> {
    let mut out = String::new();
    encode_value(value, instance, 0, &mut out)?;
    Ok(out)
}

/// Append the literal form of `value` at nesting level `depth`.
///
/// Fails without writing a usable literal when the nesting exceeds [`MAX_DEPTH`] or a
/// function handle belongs to another interpreter.
pub fn encode_value(
    value: &Value,
    instance: InstanceId,
    depth: usize,
    out: &mut String,
) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(BridgeError::encode("recursion depth limit exceeded"));
    }
    match value {
        Value::Nil => out.push_str("nil"),
        Value::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Integer(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Number(n) => encode_number(*n, out),
        Value::String(s) => encode_string(s, out),
        Value::Table(table) => encode_table(table, instance, depth, out)?,
        Value::Function(handle) => {
            if handle.instance() != instance {
                return Err(BridgeError::encode(format!(
                    "{handle} belongs to a different interpreter"
                )));
            }
            let _ = write!(out, "chunks[{}]", handle.id());
        }
    }
    Ok(())
}

fn encode_table(table: &Table, instance: InstanceId, depth: usize, out: &mut String) -> Result<()> {
    out.push('{');
    for (i, (key, value)) in table.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let key = match key {
            // The worker's numbers lose precision past 2^53; keep such keys exact as strings.
            Key::Integer(k) if !(-MAX_EXACT_INTEGER..=MAX_EXACT_INTEGER).contains(k) => {
                Value::String(k.to_string())
            }
            Key::Number(n) if n.is_nan() => return Err(BridgeError::encode("table key is NaN")),
            other => Value::from(other.clone()),
        };
        out.push('[');
        encode_value(&key, instance, depth + 1, out)?;
        out.push_str("]=");
        encode_value(value, instance, depth + 1, out)?;
    }
    out.push('}');
    Ok(())
}

fn encode_number(n: f64, out: &mut String) {
    if n.is_nan() {
        out.push_str("(0/0)");
    } else if n == f64::INFINITY {
        out.push_str("(1/0)");
    } else if n == f64::NEG_INFINITY {
        out.push_str("(-1/0)");
    } else {
        out.push_str(&format_number(n));
    }
}

fn encode_string(s: &str, out: &mut String) {
    out.reserve(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\000"),
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Format a finite double like C's `%.17g`, which round-trips every double.
pub fn format_number(n: f64) -> String {
    if n == 0.0 {
        return if n.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let sci = format!("{n:.16e}");
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return sci;
    };
    let Ok(exp) = exp.parse::<i32>() else {
        return sci;
    };

    if !(-4..17).contains(&exp) {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exp.abs())
    } else {
        let decimals = (16 - exp) as usize;
        trim_fraction(&format!("{n:.decimals$}")).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// Read literal text back into a value, resolving `chunks[n]` against `instance`.
///
/// Accepts exactly the subset [`encode_value`] produces. Used by worker implementations.
pub fn parse_literal(text: &str, instance: InstanceId) -> Result<Value> {
    let mut parser = Parser {
        src: text.as_bytes(),
        pos: 0,
        instance,
    };
    let value = parser.value(0)?;
    parser.skip_ws();
    if parser.pos != parser.src.len() {
        return Err(parser.error("trailing characters after value"));
    }
    Ok(value)
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    instance: InstanceId,
}

impl Parser<'_> {
    fn error(&self, what: &str) -> BridgeError {
        BridgeError::decode(format!("{what} at offset {}", self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.src[self.pos..].starts_with(token.as_bytes()) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<()> {
        self.skip_ws();
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected `{token}`")))
        }
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > PARSE_DEPTH_LIMIT {
            return Err(self.error("literal nested too deeply"));
        }
        self.skip_ws();
        match self.peek() {
            Some(b'{') => self.table(depth),
            Some(b'"') => self.string().map(Value::String),
            Some(b'(') => self.special_number(),
            Some(b'-' | b'0'..=b'9' | b'.') => self.number(),
            _ if self.eat("nil") => Ok(Value::Nil),
            _ if self.eat("true") => Ok(Value::Boolean(true)),
            _ if self.eat("false") => Ok(Value::Boolean(false)),
            _ if self.eat("chunks[") => {
                let id = self.integer()?;
                self.expect("]")?;
                Ok(Value::Function(FunctionHandle::new(self.instance, id)))
            }
            _ => Err(self.error("unexpected token")),
        }
    }

    fn table(&mut self, depth: usize) -> Result<Value> {
        self.expect("{")?;
        let mut table = Table::new();
        self.skip_ws();
        if self.eat("}") {
            return Ok(Value::Table(table));
        }
        loop {
            self.expect("[")?;
            let key = Key::try_from(self.value(depth + 1)?)?;
            self.expect("]")?;
            self.expect("=")?;
            let value = self.value(depth + 1)?;
            table.insert(key, value);

            self.skip_ws();
            if self.eat(",") {
                continue;
            }
            self.expect("}")?;
            return Ok(Value::Table(table));
        }
    }

    fn string(&mut self) -> Result<String> {
        self.pos += 1;
        let mut bytes = Vec::new();
        loop {
            let Some(b) = self.peek() else {
                return Err(self.error("unterminated string"));
            };
            self.pos += 1;
            match b {
                b'"' => break,
                b'\\' => {
                    let Some(escaped) = self.peek() else {
                        return Err(self.error("unterminated escape"));
                    };
                    self.pos += 1;
                    match escaped {
                        b'n' => bytes.push(b'\n'),
                        b'r' => bytes.push(b'\r'),
                        b'"' | b'\\' | b'\'' => bytes.push(escaped),
                        b'0'..=b'9' => {
                            let start = self.pos - 1;
                            while self.pos < start + 3 && matches!(self.peek(), Some(b'0'..=b'9')) {
                                self.pos += 1;
                            }
                            let code: u32 = std::str::from_utf8(&self.src[start..self.pos])
                                .ok()
                                .and_then(|s| s.parse().ok())
                                .ok_or_else(|| self.error("bad decimal escape"))?;
                            let byte = u8::try_from(code)
                                .map_err(|_| self.error("decimal escape out of range"))?;
                            bytes.push(byte);
                        }
                        _ => return Err(self.error("unknown escape")),
                    }
                }
                b => bytes.push(b),
            }
        }
        String::from_utf8(bytes).map_err(|_| self.error("string is not valid UTF-8"))
    }

    fn special_number(&mut self) -> Result<Value> {
        for (token, n) in [
            ("(0/0)", f64::NAN),
            ("(1/0)", f64::INFINITY),
            ("(-1/0)", f64::NEG_INFINITY),
        ] {
            if self.eat(token) {
                return Ok(Value::Number(n));
            }
        }
        Err(self.error("unexpected parenthesis"))
    }

    fn number(&mut self) -> Result<Value> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'-' | b'+' | b'.' | b'e' | b'E' | b'0'..=b'9')
        ) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.error("bad number"))?;

        if !text.contains(['.', 'e', 'E']) {
            if let Ok(i) = text.parse::<i64>() {
                return Ok(Value::Integer(i));
            }
        }
        text.parse::<f64>()
            .map(Value::Number)
            .map_err(|_| self.error("bad number"))
    }

    fn integer(&mut self) -> Result<i64> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        std::str::from_utf8(&self.src[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.error("expected integer"))
    }
}
