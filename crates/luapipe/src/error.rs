use thiserror::Error;

use crate::value::{InstanceId, Value};

/// Everything that can go wrong while driving a worker.
///
/// Two classes matter to callers: [`BridgeError::Runtime`] means the script failed and the
/// interpreter is still usable; every other variant means the bridge itself failed. The
/// process-level variants are cached by the interpreter and replayed on every later call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("process spawning is not available in this environment")]
    SpawnUnavailable,

    #[error("failed to spawn worker process{}", .0.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    SpawnFailed(Option<String>),

    #[error("protocol decode error: {0}")]
    Decode(String),

    #[error("worker process has gone away")]
    ProcessGone,

    #[error("worker exceeded its CPU time limit")]
    ResourceLimitExceeded,

    #[error("worker was killed by signal {0}")]
    KilledBySignal(i32),

    #[error("worker exited with code {0}")]
    ExitedWithCode(i32),

    #[error("{0}")]
    Runtime(ScriptError),

    #[error("cannot encode value: {0}")]
    Encode(String),

    #[error("function handle belongs to interpreter {found}, not {expected}")]
    HandleMismatch {
        expected: InstanceId,
        found: InstanceId,
    },
}

impl BridgeError {
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode(message.into())
    }

    /// True for failures that close the interpreter for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ProcessGone
                | Self::ResourceLimitExceeded
                | Self::KilledBySignal(_)
                | Self::ExitedWithCode(_)
        )
    }

    /// True when the worker reported a script error.
    pub fn is_runtime(&self) -> bool {
        matches!(self, Self::Runtime(_))
    }
}

impl From<ScriptError> for BridgeError {
    fn from(err: ScriptError) -> Self {
        Self::Runtime(err)
    }
}

/// A script error raised inside the worker, or raised by a host callback on the worker's behalf.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}{message}", location_prefix(.module, .line))]
pub struct ScriptError {
    pub message: String,
    pub module: Option<String>,
    pub line: Option<u32>,
    pub trace: Option<Vec<Value>>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            module: None,
            line: None,
            trace: None,
        }
    }

    pub fn with_location(mut self, module: impl Into<String>, line: u32) -> Self {
        self.module = Some(module.into());
        self.line = Some(line);
        self
    }

    pub fn with_trace(mut self, trace: Vec<Value>) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Build from the `value` of an `error` message, splitting a leading
    /// `"<module>:<line>: "` prefix into structured fields.
    pub fn from_worker(value: &Value, trace: Option<Vec<Value>>) -> Self {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Integer(_) | Value::Number(_) => value.to_string(),
            other => format!("(error object is a {} value)", other.type_name()),
        };

        let mut err = match split_location(&text) {
            Some((module, line, message)) => Self::new(message).with_location(module, line),
            None => Self::new(text),
        };
        err.trace = trace;
        err
    }

    /// The text sent back to the worker, location prefix included.
    pub fn worker_message(&self) -> String {
        self.to_string()
    }
}

fn location_prefix(module: &Option<String>, line: &Option<u32>) -> String {
    match (module, line) {
        (Some(module), Some(line)) => format!("{module}:{line}: "),
        _ => String::new(),
    }
}

/// Lazily matches `^(.*?):(\d+): (.*)$`: the first `:<digits>: ` wins.
fn split_location(text: &str) -> Option<(&str, u32, &str)> {
    let mut search = 0;
    while let Some(offset) = text[search..].find(':') {
        let colon = search + offset;
        if text[..colon].contains('\n') {
            return None;
        }
        let rest = &text[colon + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits > 0
            && rest[digits..].starts_with(": ")
            && let Ok(line) = rest[..digits].parse::<u32>()
        {
            return Some((&text[..colon], line, &rest[digits + 2..]));
        }
        search = colon + 1;
    }
    None
}

pub type Result<T> = std::result::Result<T, BridgeError>;
