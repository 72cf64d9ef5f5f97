//! luapipe: drive a standalone Lua worker process over a framed pipe protocol.

mod error;
mod failure;
mod version;

pub mod bridge;
pub mod interpreter;
pub mod registry;
pub mod supervisor;
pub mod value;
pub mod worker;

pub use error::{BridgeError, Result, ScriptError};
pub use failure::{classify, cpu_limit_signal};
pub use interpreter::{DispatchState, Interpreter, InterpreterConfig};
pub use registry::{Callback, IdAllocator};
pub use supervisor::{
    CommandSpawner, ExitStatus, SpawnContext, StderrTarget, WorkerProcess, WorkerSpawner,
};
pub use value::{FunctionHandle, InstanceId, Key, Table, Value};
pub use version::{LUAPIPE_VERSION, VersionInfo, parse_version_line, query_worker_version};
pub use worker::{CompiledChunk, Host, WorkerExit, WorkerHandler, run_stdio_worker, run_worker};

#[cfg(unix)]
pub use worker::ThreadSpawner;
