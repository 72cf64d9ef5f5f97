//! Tagged notation for values sent by the worker.
//!
//! Each value is a type tag followed by its payload, with explicit byte lengths for
//! strings and entry counts for tables, so the host never has to evaluate anything:
//!
//! ```text
//! N;                      nil
//! b:1;                    boolean
//! i:42;                   integer
//! d:0.5;  d:NAN;  d:-INF; double
//! s:5:"hello";            string (length in bytes)
//! a:2:{i:1;s:1:"x";s:1:"k";b:0;}
//! O:<n>:"<class>":2:{s:13:"interpreterId";i:<n>;s:2:"id";i:<n>;}   function handle
//! ```

use std::fmt::Write as _;

use crate::bridge::literal::format_number;
use crate::error::{BridgeError, Result};
use crate::value::{FunctionHandle, InstanceId, Key, Table, Value};

/// Class name written for function handles. Readers accept any class.
pub const FUNCTION_CLASS: &str = "LuaStandaloneInterpreterFunction";

const DEPTH_LIMIT: usize = 256;

pub fn decode(body: &[u8]) -> Result<Value> {
    let mut reader = Reader { src: body, pos: 0 };
    let value = reader.value(0)?;
    if reader.pos != body.len() {
        return Err(reader.error("trailing bytes after value"));
    }
    Ok(value)
}

struct Reader<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn error(&self, what: &str) -> BridgeError {
        BridgeError::decode(format!("{what} at byte {}", self.pos))
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.src.get(self.pos) == Some(&byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected `{}`", byte as char)))
        }
    }

    /// Everything up to (not including) `end`, which is consumed.
    fn until(&mut self, end: u8) -> Result<&'a str> {
        let rest = &self.src[self.pos..];
        let Some(len) = rest.iter().position(|&b| b == end) else {
            return Err(self.error(&format!("missing `{}`", end as char)));
        };
        let text = std::str::from_utf8(&rest[..len]).map_err(|_| self.error("non-ASCII token"))?;
        self.pos += len + 1;
        Ok(text)
    }

    fn count(&mut self, end: u8) -> Result<usize> {
        let text = self.until(end)?;
        text.parse().map_err(|_| self.error("bad length"))
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.src.len())
            .ok_or_else(|| self.error("length runs past end of body"))?;
        let bytes = &self.src[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn quoted(&mut self) -> Result<&'a [u8]> {
        let len = self.count(b':')?;
        self.expect(b'"')?;
        let bytes = self.bytes(len)?;
        self.expect(b'"')?;
        Ok(bytes)
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > DEPTH_LIMIT {
            return Err(self.error("value nested too deeply"));
        }
        let Some(&tag) = self.src.get(self.pos) else {
            return Err(self.error("unexpected end of body"));
        };
        self.pos += 1;

        if tag == b'N' {
            self.expect(b';')?;
            return Ok(Value::Nil);
        }
        self.expect(b':')?;

        match tag {
            b'b' => match self.until(b';')? {
                "0" => Ok(Value::Boolean(false)),
                "1" => Ok(Value::Boolean(true)),
                _ => Err(self.error("bad boolean")),
            },
            b'i' => {
                let text = self.until(b';')?;
                text.parse()
                    .map(Value::Integer)
                    .map_err(|_| self.error("bad integer"))
            }
            b'd' => {
                let n = match self.until(b';')? {
                    "NAN" => f64::NAN,
                    "INF" => f64::INFINITY,
                    "-INF" => f64::NEG_INFINITY,
                    text => text.parse().map_err(|_| self.error("bad double"))?,
                };
                Ok(Value::Number(n))
            }
            b's' => {
                let bytes = self.quoted()?;
                self.expect(b';')?;
                Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
            }
            b'a' => {
                let count = self.count(b':')?;
                self.entries(count, depth).map(Value::Table)
            }
            b'O' => {
                self.quoted()?;
                self.expect(b':')?;
                let count = self.count(b':')?;
                let props = self.entries(count, depth)?;
                function_from_props(&props)
                    .map(Value::Function)
                    .ok_or_else(|| self.error("object is not a function"))
            }
            _ => Err(self.error(&format!("unknown type tag `{}`", tag as char))),
        }
    }

    fn entries(&mut self, count: usize, depth: usize) -> Result<Table> {
        self.expect(b'{')?;
        // Every entry takes at least four bytes, which bounds the preallocation.
        let mut table = Table::with_capacity(count.min(self.src.len() / 4));
        for _ in 0..count {
            let key = Key::try_from(self.value(depth + 1)?)?;
            let value = self.value(depth + 1)?;
            table.insert(key, value);
        }
        self.expect(b'}')?;
        Ok(table)
    }
}

fn function_from_props(props: &Table) -> Option<FunctionHandle> {
    let instance = props.field("interpreterId")?.as_integer()?;
    let id = props.field("id")?.as_integer()?;
    Some(FunctionHandle::new(
        InstanceId::new(u64::try_from(instance).ok()?),
        id,
    ))
}

/// Write `value` in tagged notation.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    encode_into(value, &mut out);
    out.into_bytes()
}

fn encode_into(value: &Value, out: &mut String) {
    match value {
        Value::Nil => out.push_str("N;"),
        Value::Boolean(b) => {
            let _ = write!(out, "b:{};", u8::from(*b));
        }
        Value::Integer(i) => {
            let _ = write!(out, "i:{i};");
        }
        Value::Number(n) => {
            let text = if n.is_nan() {
                "NAN".to_string()
            } else if n.is_infinite() {
                (if *n > 0.0 { "INF" } else { "-INF" }).to_string()
            } else {
                format_number(*n)
            };
            let _ = write!(out, "d:{text};");
        }
        Value::String(s) => {
            let _ = write!(out, "s:{}:\"{s}\";", s.len());
        }
        Value::Table(table) => {
            let _ = write!(out, "a:{}:{{", table.len());
            for (key, value) in table {
                encode_into(&Value::from(key.clone()), out);
                encode_into(value, out);
            }
            out.push('}');
        }
        Value::Function(handle) => {
            let _ = write!(
                out,
                "O:{}:\"{FUNCTION_CLASS}\":2:{{s:13:\"interpreterId\";i:{};s:2:\"id\";i:{};}}",
                FUNCTION_CLASS.len(),
                handle.instance(),
                handle.id()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &Value) -> String {
        String::from_utf8(encode(value)).unwrap()
    }

    #[test]
    fn return_message_encoding() {
        let mut values = Table::new();
        values.insert(1, 2);
        values.insert(2, "two");
        let mut msg = Table::new();
        msg.insert("op", "return");
        msg.insert("nvalues", 2);
        msg.insert("values", values);
        insta::assert_snapshot!(
            text(&Value::Table(msg)),
            @r#"a:3:{s:2:"op";s:6:"return";s:7:"nvalues";i:2;s:6:"values";a:2:{i:1;i:2;i:2;s:3:"two";}}"#
        );
    }

    #[test]
    fn function_handles_roundtrip() {
        let handle = Value::Function(FunctionHandle::new(InstanceId::new(3), 17));
        assert_eq!(decode(&encode(&handle)).unwrap(), handle);
    }

    #[test]
    fn foreign_class_names_are_accepted() {
        let body = br#"O:8:"Whatever":2:{s:2:"id";i:5;s:13:"interpreterId";i:1;}"#;
        assert_eq!(
            decode(body).unwrap(),
            Value::Function(FunctionHandle::new(InstanceId::new(1), 5))
        );
    }

    #[test]
    fn objects_without_handle_fields_are_rejected() {
        let err = decode(br#"O:3:"Foo":1:{s:1:"x";i:1;}"#).unwrap_err();
        assert!(matches!(err, BridgeError::Decode(_)), "{err:?}");
    }

    #[test]
    fn integral_doubles_come_back_equal() {
        let value = Value::sequence([Value::Number(2.0), Value::Number(-7.0)]);
        let wire = decode(b"a:2:{i:1;i:2;i:2;i:-7;}").unwrap();
        assert_eq!(wire, value);
    }

    #[test]
    fn string_lengths_are_bytes() {
        let value = Value::from("é\"; x");
        let encoded = text(&value);
        assert!(encoded.starts_with("s:6:"));
        assert_eq!(decode(encoded.as_bytes()).unwrap(), value);
    }

    #[test]
    fn special_doubles() {
        assert!(decode(b"d:NAN;").unwrap().as_number().unwrap().is_nan());
        assert_eq!(decode(b"d:INF;").unwrap(), Value::Number(f64::INFINITY));
        assert_eq!(decode(b"d:-INF;").unwrap(), Value::Number(f64::NEG_INFINITY));
        assert_eq!(decode(b"d:1.0E+25;").unwrap(), Value::Number(1e25));
    }

    #[test]
    fn double_keys_normalize() {
        let value = decode(b"a:2:{d:1;s:1:\"a\";d:0.5;s:1:\"b\";}").unwrap();
        let table = value.as_table().unwrap();
        assert_eq!(table.get(&Key::Integer(1)), Some(&Value::from("a")));
        assert_eq!(table.get(&Key::Number(0.5)), Some(&Value::from("b")));
    }

    #[test]
    fn nested_tables_roundtrip() {
        let mut inner = Table::new();
        inner.insert("flag", false);
        inner.insert(2, Value::Nil);
        inner.insert(3, -1.25);
        let mut outer = Table::new();
        outer.insert("inner", inner);
        outer.insert(1, "x");
        let value = Value::Table(outer);
        assert_eq!(decode(&encode(&value)).unwrap(), value);
    }

    #[test]
    fn malformed_bodies_are_decode_errors() {
        let cases: &[&[u8]] = &[
            b"",
            b"x:1;",
            b"i:12",
            b"i:twelve;",
            b"b:2;",
            b"s:10:\"short\";",
            b"a:2:{i:1;i:1;}",
            b"a:1:{a:0:{}i:1;}",
            b"O:1:\"X\":1:{s:2:\"id\";i:1;}",
            b"N;N;",
        ];
        for body in cases {
            let err = decode(body).unwrap_err();
            assert!(
                matches!(err, BridgeError::Decode(_)),
                "{}: {err:?}",
                String::from_utf8_lossy(body)
            );
        }
    }
}
