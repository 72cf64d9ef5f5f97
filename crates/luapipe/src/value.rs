//! Values that cross the pipe.
//!
//! The worker's type system is small: nil, booleans, numbers, strings, tables and functions.
//! Integers and doubles are kept apart on the host side even though the worker has a single
//! number type, so an integral double sent to the worker comes back as an integer. Equality
//! follows the worker: `Integer(2) == Number(2.0)`.

use std::fmt;
use std::hash::{Hash, Hasher};

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::bridge::literal::format_number;
use crate::error::{BridgeError, Result};

/// Largest magnitude the worker's number type represents exactly (2^53).
pub const MAX_EXACT_INTEGER: i64 = 1 << 53;

/// Identifies one interpreter (one worker process) within the host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for InstanceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// A function living in the worker, scoped to the interpreter that minted it.
///
/// Covers both compiled chunks and host callbacks the worker has wrapped; the worker
/// addresses both through its chunk table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle {
    instance: InstanceId,
    id: i64,
}

impl FunctionHandle {
    pub const fn new(instance: InstanceId, id: i64) -> Self {
        Self { instance, id }
    }

    pub const fn instance(&self) -> InstanceId {
        self.instance
    }

    pub const fn id(&self) -> i64 {
        self.id
    }
}

impl fmt::Display for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function#{}:{}", self.instance, self.id)
    }
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Table(Table),
    Function(FunctionHandle),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Integer(i), Self::Number(n)) | (Self::Number(n), Self::Integer(i)) => {
                integer_equals_number(*i, *n)
            }
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Table(a), Self::Table(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => a == b,
            _ => false,
        }
    }
}

fn integer_equals_number(i: i64, n: f64) -> bool {
    // 2^63, the first double past i64::MAX.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    n.fract() == 0.0 && (-LIMIT..LIMIT).contains(&n) && n as i64 == i
}

impl Value {
    /// Build a 1-based sequence table.
    pub fn sequence(values: impl IntoIterator<Item = Value>) -> Self {
        Self::Table(Table::from_sequence(values))
    }

    /// Name of the type as the worker would report it.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) | Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Table(_) => "table",
            Self::Function(_) => "function",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view; integral doubles qualify.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Number(n) if n.fract() == 0.0 && n.abs() <= MAX_EXACT_INTEGER as f64 => {
                Some(*n as i64)
            }
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<FunctionHandle> {
        match self {
            Self::Function(f) => Some(*f),
            _ => None,
        }
    }

    pub fn into_table(self) -> Option<Table> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Visit every function handle reachable from this value.
    pub fn for_each_function(&self, f: &mut impl FnMut(FunctionHandle)) {
        match self {
            Self::Function(handle) => f(*handle),
            Self::Table(table) => {
                for value in table.values() {
                    value.for_each_function(f);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Number(n) => f.write_str(&display_number(*n)),
            Self::String(s) => f.write_str(s),
            Self::Table(t) => write!(f, "table ({} entries)", t.len()),
            Self::Function(handle) => write!(f, "{handle}"),
        }
    }
}

fn display_number(n: f64) -> String {
    if n.is_nan() {
        "nan".to_string()
    } else if n.is_infinite() {
        (if n > 0.0 { "inf" } else { "-inf" }).to_string()
    } else {
        format_number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Table> for Value {
    fn from(t: Table) -> Self {
        Self::Table(t)
    }
}

impl From<FunctionHandle> for Value {
    fn from(handle: FunctionHandle) -> Self {
        Self::Function(handle)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Self::Nil)
    }
}

/// A table key. Tables and functions are valid keys in the worker but never cross the pipe.
#[derive(Debug, Clone)]
pub enum Key {
    Integer(i64),
    String(String),
    Boolean(bool),
    Number(f64),
}

impl Key {
    /// Integral numbers in the exact range become integer keys, as the worker sees them.
    pub fn from_number(n: f64) -> Self {
        if n.fract() == 0.0 && n.abs() <= MAX_EXACT_INTEGER as f64 {
            Self::Integer(n as i64)
        } else {
            Self::Number(n)
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Integer(i) => i.hash(state),
            Self::String(s) => s.hash(state),
            Self::Boolean(b) => b.hash(state),
            Self::Number(n) => n.to_bits().hash(state),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::String(s) => f.write_str(s),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Number(n) => f.write_str(&display_number(*n)),
        }
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<f64> for Key {
    fn from(n: f64) -> Self {
        Self::from_number(n)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Key {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        match key {
            Key::Integer(i) => Self::Integer(i),
            Key::String(s) => Self::String(s),
            Key::Boolean(b) => Self::Boolean(b),
            Key::Number(n) => Self::Number(n),
        }
    }
}

impl TryFrom<Value> for Key {
    type Error = BridgeError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Integer(i) => Ok(Self::Integer(i)),
            Value::String(s) => Ok(Self::String(s)),
            Value::Boolean(b) => Ok(Self::Boolean(b)),
            Value::Number(n) if n.is_nan() => Err(BridgeError::decode("table key is NaN")),
            Value::Number(n) => Ok(Self::from_number(n)),
            other => Err(BridgeError::decode(format!(
                "{} value cannot be a table key",
                other.type_name()
            ))),
        }
    }
}

/// Ordered key→value mapping. Entries keep insertion order; equality ignores order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    entries: IndexMap<Key, Value>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity),
        }
    }

    /// Positional values at keys `1..=n`.
    pub fn from_sequence(values: impl IntoIterator<Item = Value>) -> Self {
        values
            .into_iter()
            .zip(1i64..)
            .map(|(value, i)| (Key::Integer(i), value))
            .collect()
    }

    /// Dense 0-based view of positions `1..=count`; missing positions are nil.
    pub fn into_sequence(self, count: usize) -> Vec<Value> {
        let mut out = vec![Value::Nil; count];
        for (key, value) in self.entries {
            if let Key::Integer(i) = key
                && i >= 1
                && (i as u64) <= count as u64
            {
                out[(i - 1) as usize] = value;
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Field lookup by string key.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.entries.get(&Key::String(name.to_string()))
    }

    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        self.entries.shift_remove(key)
    }

    /// Remove a string-keyed field.
    pub fn take_field(&mut self, name: &str) -> Option<Value> {
        self.entries.shift_remove(&Key::String(name.to_string()))
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, Key, Value> {
        self.entries.iter()
    }

    pub fn keys(&self) -> indexmap::map::Keys<'_, Key, Value> {
        self.entries.keys()
    }

    pub fn values(&self) -> indexmap::map::Values<'_, Key, Value> {
        self.entries.values()
    }
}

impl FromIterator<(Key, Value)> for Table {
    fn from_iter<I: IntoIterator<Item = (Key, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Table {
    type Item = (Key, Value);
    type IntoIter = indexmap::map::IntoIter<Key, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a Table {
    type Item = (&'a Key, &'a Value);
    type IntoIter = indexmap::map::Iter<'a, Key, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Nil => serializer.serialize_unit(),
            Self::Boolean(b) => serializer.serialize_bool(*b),
            Self::Integer(i) => serializer.serialize_i64(*i),
            Self::Number(n) => serializer.serialize_f64(*n),
            Self::String(s) => serializer.serialize_str(s),
            Self::Table(t) => t.serialize(serializer),
            Self::Function(handle) => serializer.collect_str(handle),
        }
    }
}

impl Serialize for Table {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (key, value) in self {
            map.serialize_entry(&key.to_string(), value)?;
        }
        map.end()
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = BridgeError;

    fn try_from(json: serde_json::Value) -> Result<Self> {
        Ok(match json {
            serde_json::Value::Null => Self::Nil,
            serde_json::Value::Bool(b) => Self::Boolean(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Integer(i)
                } else if n.is_u64() {
                    return Err(BridgeError::encode(format!(
                        "integer {n} does not fit in a signed 64-bit integer"
                    )));
                } else {
                    match n.as_f64() {
                        Some(f) => Self::Number(f),
                        None => {
                            return Err(BridgeError::encode(format!("unsupported number {n}")));
                        }
                    }
                }
            }
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::Table(
                items
                    .into_iter()
                    .zip(1i64..)
                    .map(|(item, i)| Ok((Key::Integer(i), Self::try_from(item)?)))
                    .collect::<Result<Table>>()?,
            ),
            serde_json::Value::Object(fields) => Self::Table(
                fields
                    .into_iter()
                    .map(|(k, v)| Ok((Key::String(k), Self::try_from(v)?)))
                    .collect::<Result<Table>>()?,
            ),
        })
    }
}

/// Convert any serializable host value into a wire value.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    let json = serde_json::to_value(value).map_err(|e| BridgeError::encode(e.to_string()))?;
    Value::try_from(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequence_is_one_based() {
        let table = Table::from_sequence([Value::from("a"), Value::from("b")]);
        assert_eq!(table.get(&Key::Integer(1)), Some(&Value::from("a")));
        assert_eq!(table.get(&Key::Integer(2)), Some(&Value::from("b")));
        assert_eq!(table.get(&Key::Integer(0)), None);
    }

    #[test]
    fn into_sequence_pads_missing_positions_with_nil() {
        let mut table = Table::new();
        table.insert(3, "c");
        table.insert(1, "a");
        table.insert("extra", true);
        assert_eq!(
            table.into_sequence(4),
            vec![Value::from("a"), Value::Nil, Value::from("c"), Value::Nil]
        );
    }

    #[test]
    fn table_equality_ignores_order() {
        let mut a = Table::new();
        a.insert("x", 1);
        a.insert("y", 2);
        let mut b = Table::new();
        b.insert("y", 2);
        b.insert("x", 1);
        assert_eq!(a, b);
    }

    #[test]
    fn integers_and_numbers_compare_by_value() {
        assert_eq!(Value::Integer(2), Value::Number(2.0));
        assert_eq!(Value::Number(-0.0), Value::Integer(0));
        assert_ne!(Value::Integer(2), Value::Number(2.5));
        assert_ne!(Value::Integer(i64::MAX), Value::Number(9_223_372_036_854_775_808.0));
        assert_ne!(Value::Integer((1 << 53) + 1), Value::Number((1u64 << 53) as f64));
        assert_ne!(Value::Number(f64::NAN), Value::Number(f64::NAN));
        assert_ne!(Value::Integer(1), Value::from("1"));
        assert_eq!(
            Value::sequence([Value::Number(3.0)]),
            Value::sequence([Value::Integer(3)])
        );
    }

    #[test]
    fn integral_number_keys_normalize_to_integers() {
        assert_eq!(Key::from_number(2.0), Key::Integer(2));
        assert_eq!(Key::from_number(2.5), Key::Number(2.5));
        assert!(Key::try_from(Value::Number(f64::NAN)).is_err());
        assert!(Key::try_from(Value::Table(Table::new())).is_err());
    }

    #[test]
    fn integral_doubles_read_as_integers() {
        assert_eq!(Value::Number(3.0).as_integer(), Some(3));
        assert_eq!(Value::Number(3.5).as_integer(), None);
        assert_eq!(Value::from("3").as_integer(), None);
    }

    #[test]
    fn function_handles_are_collected_recursively() {
        let inner = FunctionHandle::new(InstanceId::new(1), 7);
        let mut nested = Table::new();
        nested.insert("f", inner);
        let value = Value::sequence([Value::Table(nested), Value::Nil]);

        let mut seen = Vec::new();
        value.for_each_function(&mut |h| seen.push(h));
        assert_eq!(seen, vec![inner]);
    }

    #[test]
    fn json_objects_and_arrays_convert() {
        let value = Value::try_from(json!({"name": "x", "items": [1, 2.5, null]})).unwrap();
        let table = value.as_table().unwrap();
        assert_eq!(table.field("name"), Some(&Value::from("x")));
        let items = table.field("items").unwrap().as_table().unwrap();
        assert_eq!(items.get(&Key::Integer(1)), Some(&Value::Integer(1)));
        assert_eq!(items.get(&Key::Integer(2)), Some(&Value::Number(2.5)));
        assert_eq!(items.get(&Key::Integer(3)), Some(&Value::Nil));
    }

    #[test]
    fn oversized_unsigned_integers_are_rejected() {
        let err = Value::try_from(json!(u64::MAX)).unwrap_err();
        assert!(matches!(err, BridgeError::Encode(_)));
    }

    #[test]
    fn serializable_host_values_convert() {
        #[derive(serde::Serialize)]
        struct Args {
            title: &'static str,
            count: u8,
        }
        let value = to_value(&Args { title: "Main Page", count: 2 }).unwrap();
        let table = value.as_table().unwrap();
        assert_eq!(table.field("title"), Some(&Value::from("Main Page")));
        assert_eq!(table.field("count"), Some(&Value::Integer(2)));
    }

    #[test]
    fn values_serialize_to_json() {
        let mut table = Table::new();
        table.insert("pid", 4242);
        table.insert(1, true);
        table.insert("handle", FunctionHandle::new(InstanceId::new(3), 9));
        let json = serde_json::to_value(Value::Table(table)).unwrap();
        assert_eq!(
            json,
            json!({"pid": 4242, "1": true, "handle": "function#3:9"})
        );
    }
}
