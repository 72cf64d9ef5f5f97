//! Version information for luapipe and the worker binary.

use std::ffi::OsStr;
use std::process::{Command, Stdio};

/// luapipe version from Cargo.toml
pub const LUAPIPE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information for the bridge.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub luapipe: &'static str,
    /// Worker interpreter version, e.g. `Lua 5.1.5` (if queried).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            luapipe: LUAPIPE_VERSION,
            worker: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(mut self, version: String) -> Self {
        self.worker = Some(version);
        self
    }
}

/// Ask a worker binary for its version by running `<program> -v`.
///
/// `None` when the program cannot be run or prints nothing recognizable.
pub fn query_worker_version(program: impl AsRef<OsStr>) -> Option<String> {
    let program = program.as_ref();
    let output = match Command::new(program)
        .arg("-v")
        .stdin(Stdio::null())
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            tracing::debug!(?program, error = %e, "Cannot run worker for version query");
            return None;
        }
    };

    [&output.stdout, &output.stderr]
        .into_iter()
        .find_map(|stream| parse_version_line(&String::from_utf8_lossy(stream)))
}

/// Extract `Lua <version>` or `LuaJIT <version>` from the start of the first line.
pub fn parse_version_line(text: &str) -> Option<String> {
    let line = text.lines().next()?;
    let rest = line
        .strip_prefix("LuaJIT ")
        .map(|rest| ("LuaJIT", rest))
        .or_else(|| line.strip_prefix("Lua ").map(|rest| ("Lua", rest)));
    let (name, rest) = rest?;
    if rest.starts_with(char::is_whitespace) {
        return None;
    }
    let version = rest.split_whitespace().next()?;
    Some(format!("{name} {version}"))
}
