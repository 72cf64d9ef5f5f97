//! Wire protocol messages.
//!
//! Every message is a table with an `op` field. The host writes its messages as literal
//! text ([`super::literal`]); the worker answers in tagged notation ([`super::notation`]).
//! Argument and result lists travel as 1-based tables with an explicit count so that
//! trailing nils survive; at this boundary they become dense 0-based `Vec`s.

use std::fmt::Write as _;

use crate::bridge::{literal, notation};
use crate::error::{BridgeError, Result};
use crate::value::{InstanceId, Key, Table, Value};

/// Upper bound on `nargs`/`nvalues`; a larger count is treated as a corrupt message.
pub const MAX_SEQUENCE_LEN: usize = 1 << 20;

/// Messages written by the host.
///
/// `Return` and `Error` only ever answer a worker-initiated `call`.
#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    LoadString { text: String, chunk_name: String },
    Call { id: i64, args: Vec<Value> },
    /// Ask the worker for a function that calls back into host callback `id`.
    WrapPhpFunction { id: String },
    /// `functions` maps each function name to its callback id.
    RegisterLibrary {
        name: String,
        functions: Vec<(String, String)>,
    },
    /// Ids of the chunks that stay live; the worker drops every other chunk.
    CleanupChunks { ids: Vec<i64> },
    GetStatus,
    Quit,
    TestQuit,
    Return { values: Vec<Value> },
    Error { value: Value },
}

impl HostMessage {
    pub fn op(&self) -> &'static str {
        match self {
            Self::LoadString { .. } => "loadString",
            Self::Call { .. } => "call",
            Self::WrapPhpFunction { .. } => "wrapPhpFunction",
            Self::RegisterLibrary { .. } => "registerLibrary",
            Self::CleanupChunks { .. } => "cleanupChunks",
            Self::GetStatus => "getStatus",
            Self::Quit => "quit",
            Self::TestQuit => "testquit",
            Self::Return { .. } => "return",
            Self::Error { .. } => "error",
        }
    }

    /// Literal text for the interpreter `instance`.
    ///
    /// Argument and result values are checked against the depth limit on their own,
    /// so the envelope does not eat into it.
    pub fn encode(&self, instance: InstanceId) -> Result<String> {
        let mut out = String::from("{[\"op\"]=");
        literal::encode_value(&Value::from(self.op()), instance, 0, &mut out)?;

        let field = |name: &str, value: &Value, out: &mut String| -> Result<()> {
            out.push_str(",[\"");
            out.push_str(name);
            out.push_str("\"]=");
            literal::encode_value(value, instance, 0, out)
        };

        match self {
            Self::LoadString { text, chunk_name } => {
                field("text", &Value::from(text.as_str()), &mut out)?;
                field("chunkName", &Value::from(chunk_name.as_str()), &mut out)?;
            }
            Self::Call { id, args } => {
                field("id", &Value::Integer(*id), &mut out)?;
                field("nargs", &Value::Integer(args.len() as i64), &mut out)?;
                encode_sequence("args", args, instance, &mut out)?;
            }
            Self::WrapPhpFunction { id } => {
                field("id", &Value::from(id.as_str()), &mut out)?;
            }
            Self::RegisterLibrary { name, functions } => {
                field("name", &Value::from(name.as_str()), &mut out)?;
                let functions: Table = functions
                    .iter()
                    .map(|(func, id)| (Key::from(func.as_str()), Value::from(id.as_str())))
                    .collect();
                field("functions", &Value::Table(functions), &mut out)?;
            }
            Self::CleanupChunks { ids } => {
                let ids: Table = ids
                    .iter()
                    .map(|&id| (Key::Integer(id), Value::Integer(id)))
                    .collect();
                field("ids", &Value::Table(ids), &mut out)?;
            }
            Self::GetStatus | Self::Quit | Self::TestQuit => {}
            Self::Return { values } => {
                field("nvalues", &Value::Integer(values.len() as i64), &mut out)?;
                encode_sequence("values", values, instance, &mut out)?;
            }
            Self::Error { value } => {
                field("value", value, &mut out)?;
            }
        }
        out.push('}');
        Ok(out)
    }

    /// Read a host message back from its literal text.
    pub fn decode(text: &str, instance: InstanceId) -> Result<Self> {
        let value = literal::parse_literal(text, instance)?;
        let mut msg = value
            .into_table()
            .ok_or_else(|| BridgeError::decode("host message is not a table"))?;
        let op = take_string(&mut msg, "op")?;

        Ok(match op.as_str() {
            "loadString" => Self::LoadString {
                text: take_string(&mut msg, "text")?,
                chunk_name: take_string(&mut msg, "chunkName")?,
            },
            "call" => {
                let id = take_integer(&mut msg, "id")?;
                let args = take_sequence(&mut msg, "args", "nargs")?;
                Self::Call { id, args }
            }
            "wrapPhpFunction" => Self::WrapPhpFunction {
                id: take_string(&mut msg, "id")?,
            },
            "registerLibrary" => {
                let name = take_string(&mut msg, "name")?;
                let functions = take_table(&mut msg, "functions")?
                    .into_iter()
                    .map(|(func, id)| match (func, id) {
                        (Key::String(func), Value::String(id)) => Ok((func, id)),
                        _ => Err(BridgeError::decode("registerLibrary functions must map names to ids")),
                    })
                    .collect::<Result<_>>()?;
                Self::RegisterLibrary { name, functions }
            }
            "cleanupChunks" => {
                let ids = take_table(&mut msg, "ids")?
                    .values()
                    .map(|id| {
                        id.as_integer()
                            .ok_or_else(|| BridgeError::decode("cleanupChunks id is not an integer"))
                    })
                    .collect::<Result<_>>()?;
                Self::CleanupChunks { ids }
            }
            "getStatus" => Self::GetStatus,
            "quit" => Self::Quit,
            "testquit" => Self::TestQuit,
            "return" => Self::Return {
                values: take_sequence(&mut msg, "values", "nvalues")?,
            },
            "error" => Self::Error {
                value: msg.take_field("value").unwrap_or_default(),
            },
            other => return Err(BridgeError::decode(format!("invalid request op \"{other}\""))),
        })
    }
}

fn encode_sequence(name: &str, values: &[Value], instance: InstanceId, out: &mut String) -> Result<()> {
    out.push_str(",[\"");
    out.push_str(name);
    out.push_str("\"]={");
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "[{}]=", i + 1);
        literal::encode_value(value, instance, 0, out)?;
    }
    out.push('}');
    Ok(())
}

/// Messages written by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// Invoke host callback `id`.
    Call { id: String, args: Vec<Value> },
    Return { values: Vec<Value> },
    Error {
        value: Value,
        trace: Option<Vec<Value>>,
    },
}

impl WorkerMessage {
    pub fn op(&self) -> &'static str {
        match self {
            Self::Call { .. } => "call",
            Self::Return { .. } => "return",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_table(&self) -> Table {
        let mut msg = Table::new();
        msg.insert("op", self.op());
        match self {
            Self::Call { id, args } => {
                msg.insert("id", id.as_str());
                msg.insert("nargs", args.len() as i64);
                msg.insert("args", Table::from_sequence(args.iter().cloned()));
            }
            Self::Return { values } => {
                msg.insert("nvalues", values.len() as i64);
                msg.insert("values", Table::from_sequence(values.iter().cloned()));
            }
            Self::Error { value, trace } => {
                msg.insert("value", value.clone());
                if let Some(trace) = trace {
                    msg.insert("trace", Table::from_sequence(trace.iter().cloned()));
                }
            }
        }
        msg
    }

    /// Tagged-notation body, before transport escaping.
    pub fn encode(&self) -> Vec<u8> {
        notation::encode(&Value::Table(self.to_table()))
    }

    /// Parse an unescaped worker body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let value = notation::decode(body)?;
        let mut msg = value
            .into_table()
            .ok_or_else(|| BridgeError::decode("worker message is not a table"))?;
        let op = take_string(&mut msg, "op")?;

        match op.as_str() {
            "call" => {
                let id = match msg.take_field("id") {
                    Some(Value::String(id)) => id,
                    Some(Value::Integer(id)) => id.to_string(),
                    _ => return Err(BridgeError::decode("call message has no callback id")),
                };
                let args = take_sequence(&mut msg, "args", "nargs")?;
                Ok(Self::Call { id, args })
            }
            "return" => Ok(Self::Return {
                values: take_sequence(&mut msg, "values", "nvalues")?,
            }),
            "error" => {
                let value = msg.take_field("value").unwrap_or_default();
                let trace = match msg.take_field("trace") {
                    Some(Value::Table(trace)) => Some(trace.into_iter().map(|(_, v)| v).collect()),
                    _ => None,
                };
                Ok(Self::Error { value, trace })
            }
            other => Err(BridgeError::decode(format!("invalid response op \"{other}\""))),
        }
    }
}

fn take_string(msg: &mut Table, name: &str) -> Result<String> {
    match msg.take_field(name) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(BridgeError::decode(format!("message field {name} is not a string"))),
    }
}

fn take_integer(msg: &mut Table, name: &str) -> Result<i64> {
    msg.take_field(name)
        .and_then(|v| v.as_integer())
        .ok_or_else(|| BridgeError::decode(format!("message field {name} is not an integer")))
}

fn take_table(msg: &mut Table, name: &str) -> Result<Table> {
    match msg.take_field(name) {
        Some(Value::Table(t)) => Ok(t),
        None => Ok(Table::new()),
        _ => Err(BridgeError::decode(format!("message field {name} is not a table"))),
    }
}

/// A positional table plus its declared count, as a nil-padded `Vec`.
fn take_sequence(msg: &mut Table, name: &str, count_name: &str) -> Result<Vec<Value>> {
    let count = take_integer(msg, count_name)?;
    let count = usize::try_from(count)
        .ok()
        .filter(|&n| n <= MAX_SEQUENCE_LEN)
        .ok_or_else(|| BridgeError::decode(format!("{count_name} {count} out of range")))?;
    Ok(take_table(msg, name)?.into_sequence(count))
}
