//! Worker side of the pipe protocol.
//!
//! [`run_worker`] reads host messages, keeps the chunk table and answers each request.
//! What a chunk actually does is up to the [`WorkerHandler`]; while a chunk runs it may
//! call back into the host through [`Host`], which performs the nested `call` round-trip.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use crate::bridge::codec::{CodecError, FrameCodec, read_frame, write_frame};
use crate::bridge::protocol::{HostMessage, WorkerMessage};
use crate::error::ScriptError;
use crate::value::{FunctionHandle, InstanceId, Table, Value};

/// Exit code of a worker told to `testquit`.
pub const TEST_QUIT_CODE: i32 = 42;

/// Compiled code held in the worker's chunk table.
pub type CompiledChunk =
    Box<dyn FnMut(&mut Host, Vec<Value>) -> Result<Vec<Value>, ScriptError> + Send>;

/// The language runtime behind a worker.
pub trait WorkerHandler: Send + 'static {
    /// Compile `text`. Errors are reported to the host as script errors.
    fn compile(&mut self, text: &str, chunk_name: &str) -> Result<CompiledChunk, ScriptError>;

    /// Contents of the `getStatus` reply.
    fn status(&mut self) -> Table {
        Table::new()
    }
}

impl<H: WorkerHandler + ?Sized> WorkerHandler for Box<H> {
    fn compile(&mut self, text: &str, chunk_name: &str) -> Result<CompiledChunk, ScriptError> {
        (**self).compile(text, chunk_name)
    }

    fn status(&mut self) -> Table {
        (**self).status()
    }
}

/// Why [`run_worker`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Quit,
    TestQuit,
    /// The host closed its end of the pipe.
    HostClosed,
}

impl WorkerExit {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Quit | Self::HostClosed => 0,
            Self::TestQuit => TEST_QUIT_CODE,
        }
    }
}

enum Chunk {
    Compiled(CompiledChunk),
    /// A host callback, wrapped so worker code can call it like any function.
    Callback(String),
}

/// The worker's view of the host, handed to running chunks.
pub struct Host {
    instance: InstanceId,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    codec: FrameCodec,
    handler: Box<dyn WorkerHandler>,
    chunks: HashMap<i64, Chunk>,
    next_chunk: i64,
    libraries: HashMap<String, HashMap<String, String>>,
    exit: Option<WorkerExit>,
}

impl Host {
    fn new(
        handler: Box<dyn WorkerHandler>,
        instance: InstanceId,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            instance,
            reader,
            writer,
            codec: FrameCodec::worker(),
            handler,
            chunks: HashMap::new(),
            next_chunk: 1,
            libraries: HashMap::new(),
            exit: None,
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Call host callback `id` and wait for its results.
    pub fn call(&mut self, id: &str, args: Vec<Value>) -> Result<Vec<Value>, ScriptError> {
        let broken = |e: io::Error| ScriptError::new(format!("lost connection to host: {e}"));

        self.send(&WorkerMessage::Call {
            id: id.to_string(),
            args,
        })
        .map_err(broken)?;

        loop {
            let msg = match self.receive() {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err(broken(io::ErrorKind::UnexpectedEof.into())),
                Err(e) => return Err(broken(e)),
            };
            match msg {
                HostMessage::Return { values } => return Ok(values),
                HostMessage::Error { value } => return Err(ScriptError::from_worker(&value, None)),
                HostMessage::Quit | HostMessage::TestQuit => {
                    self.exit = Some(exit_for(&msg));
                    return Err(ScriptError::new("worker is shutting down"));
                }
                request => {
                    let reply = self.serve(request);
                    self.send(&reply).map_err(broken)?;
                }
            }
        }
    }

    /// Call a function a library registered through `registerLibrary`.
    pub fn call_library(
        &mut self,
        library: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, ScriptError> {
        let id = self
            .libraries
            .get(library)
            .and_then(|functions| functions.get(function))
            .cloned()
            .ok_or_else(|| ScriptError::new(format!("{library}.{function} is not registered")))?;
        self.call(&id, args)
    }

    /// Call a function from the chunk table: compiled code or a wrapped host callback.
    pub fn call_function(
        &mut self,
        func: &FunctionHandle,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, ScriptError> {
        if func.instance() != self.instance {
            return Err(ScriptError::new(format!("{func} belongs to a different interpreter")));
        }
        self.run_chunk(func.id(), args)
    }

    fn run_chunk(&mut self, id: i64, args: Vec<Value>) -> Result<Vec<Value>, ScriptError> {
        match self.chunks.remove(&id) {
            None => Err(ScriptError::new(format!("function id {id} does not exist"))),
            Some(Chunk::Callback(callback)) => {
                self.chunks.insert(id, Chunk::Callback(callback.clone()));
                self.call(&callback, args)
            }
            // Taken out while it runs so it can use the host mutably.
            Some(Chunk::Compiled(mut chunk)) => {
                let result = chunk(self, args);
                self.chunks.entry(id).or_insert(Chunk::Compiled(chunk));
                result
            }
        }
    }

    fn add_chunk(&mut self, chunk: Chunk) -> i64 {
        let id = self.next_chunk;
        self.next_chunk += 1;
        self.chunks.insert(id, chunk);
        id
    }

    /// Answer one host request.
    fn serve(&mut self, msg: HostMessage) -> WorkerMessage {
        let result = match msg {
            HostMessage::LoadString { text, chunk_name } => self
                .handler
                .compile(&text, &chunk_name)
                .map(|chunk| vec![Value::Integer(self.add_chunk(Chunk::Compiled(chunk)))]),
            HostMessage::Call { id, args } => self.run_chunk(id, args),
            HostMessage::WrapPhpFunction { id } => {
                let chunk = self.add_chunk(Chunk::Callback(id));
                Ok(vec![Value::Function(FunctionHandle::new(self.instance, chunk))])
            }
            HostMessage::RegisterLibrary { name, functions } => {
                self.libraries.insert(name, functions.into_iter().collect());
                Ok(vec![])
            }
            HostMessage::CleanupChunks { ids } => {
                let before = self.chunks.len();
                self.chunks.retain(|id, _| ids.contains(id));
                tracing::trace!(dropped = before - self.chunks.len(), "Cleaned up chunks");
                Ok(vec![])
            }
            HostMessage::GetStatus => Ok(vec![Value::Table(self.handler.status())]),
            other => Err(ScriptError::new(format!("unexpected {} message", other.op()))),
        };

        match result {
            Ok(values) => WorkerMessage::Return { values },
            Err(err) => WorkerMessage::Error {
                value: Value::String(err.worker_message()),
                trace: err.trace,
            },
        }
    }

    fn send(&mut self, msg: &WorkerMessage) -> io::Result<()> {
        write_frame(&mut self.codec, &mut self.writer, &msg.encode()).map_err(into_io)
    }

    /// Next host message; `None` once the host has closed the pipe.
    fn receive(&mut self) -> io::Result<Option<HostMessage>> {
        let frame = match read_frame(&mut self.codec, &mut self.reader) {
            Ok(frame) => frame,
            Err(CodecError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(into_io(e)),
        };
        let text = std::str::from_utf8(&frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        HostMessage::decode(text, self.instance)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

fn into_io(err: CodecError) -> io::Error {
    match err {
        CodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

fn exit_for(msg: &HostMessage) -> WorkerExit {
    match msg {
        HostMessage::TestQuit => WorkerExit::TestQuit,
        _ => WorkerExit::Quit,
    }
}

/// Serve host requests until told to quit or the host goes away.
pub fn run_worker<H, R, W>(
    handler: H,
    instance: InstanceId,
    reader: R,
    writer: W,
) -> io::Result<WorkerExit>
where
    H: WorkerHandler,
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let mut host = Host::new(Box::new(handler), instance, Box::new(reader), Box::new(writer));
    tracing::debug!(%instance, "Worker loop started");

    loop {
        if let Some(exit) = host.exit {
            return Ok(exit);
        }
        let msg = match host.receive() {
            Ok(Some(msg)) => msg,
            Ok(None) => return Ok(WorkerExit::HostClosed),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                tracing::error!(error = %e, "Invalid message from host");
                host.send(&WorkerMessage::Error {
                    value: Value::String(format!("invalid message: {e}")),
                    trace: None,
                })?;
                continue;
            }
            Err(e) => return Err(e),
        };
        tracing::debug!(%instance, op = msg.op(), "RX <==");

        match msg {
            HostMessage::Quit | HostMessage::TestQuit => return Ok(exit_for(&msg)),
            request => {
                let reply = host.serve(request);
                tracing::debug!(%instance, op = reply.op(), "TX ==>");
                host.send(&reply)?;
            }
        }
    }
}

/// Run a worker over this process's stdin and stdout.
pub fn run_stdio_worker<H: WorkerHandler>(
    handler: H,
    instance: InstanceId,
) -> io::Result<WorkerExit> {
    run_worker(handler, instance, io::stdin(), io::stdout())
}

#[cfg(unix)]
pub use self::thread::ThreadSpawner;

#[cfg(unix)]
mod thread {
    use std::io::{self, Read, Write};
    use std::net::Shutdown;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};

    use super::{WorkerExit, WorkerHandler, run_worker};
    use crate::error::{BridgeError, Result};
    use crate::supervisor::{ExitStatus, SpawnContext, WorkerProcess, WorkerSpawner};

    type HandlerFactory = dyn Fn() -> Box<dyn WorkerHandler> + Send + Sync;

    /// Runs each worker on a thread of this process, connected by a socket pair.
    ///
    /// A thread cannot be killed: forcing one to stop closes its socket and waits for
    /// the worker loop to notice.
    #[derive(Clone)]
    pub struct ThreadSpawner {
        factory: Arc<HandlerFactory>,
    }

    impl ThreadSpawner {
        pub fn new<F, H>(factory: F) -> Self
        where
            F: Fn() -> H + Send + Sync + 'static,
            H: WorkerHandler,
        {
            Self {
                factory: Arc::new(move || Box::new(factory()) as Box<dyn WorkerHandler>),
            }
        }
    }

    impl WorkerSpawner for ThreadSpawner {
        fn spawn(&self, ctx: &SpawnContext) -> Result<Box<dyn WorkerProcess>> {
            let failed = |e: io::Error| BridgeError::SpawnFailed(Some(e.to_string()));

            let (host_end, worker_end) = UnixStream::pair().map_err(failed)?;
            let host_reader = host_end.try_clone().map_err(failed)?;
            let worker_reader = worker_end.try_clone().map_err(failed)?;

            let handler = (self.factory)();
            let instance = ctx.instance;
            let thread = thread::Builder::new()
                .name(format!("luapipe-worker-{instance}"))
                .spawn(move || run_worker(handler, instance, worker_reader, worker_end))
                .map_err(failed)?;

            Ok(Box::new(ThreadWorker {
                reader: host_reader,
                writer: host_end,
                thread: Some(thread),
                status: None,
            }))
        }
    }

    struct ThreadWorker {
        reader: UnixStream,
        writer: UnixStream,
        thread: Option<JoinHandle<io::Result<WorkerExit>>>,
        status: Option<ExitStatus>,
    }

    impl ThreadWorker {
        fn join(&mut self) -> Option<ExitStatus> {
            if let Some(thread) = self.thread.take() {
                let status = match thread.join() {
                    Ok(Ok(exit)) => ExitStatus::exited(exit.exit_code()),
                    Ok(Err(e)) => {
                        tracing::debug!(error = %e, "Worker thread failed");
                        ExitStatus::exited(1)
                    }
                    Err(_) => ExitStatus::exited(101),
                };
                self.status = Some(status);
            }
            self.status
        }
    }

    impl WorkerProcess for ThreadWorker {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn writer(&mut self) -> io::Result<&mut dyn Write> {
            Ok(&mut self.writer)
        }

        fn reader(&mut self) -> io::Result<&mut dyn Read> {
            Ok(&mut self.reader)
        }

        fn is_running(&mut self) -> bool {
            self.thread.as_ref().is_some_and(|t| !t.is_finished())
        }

        fn force_kill_and_wait(&mut self) -> Option<ExitStatus> {
            let _ = self.writer.shutdown(Shutdown::Both);
            self.join()
        }

        fn close_and_wait(&mut self) -> Option<ExitStatus> {
            let _ = self.writer.shutdown(Shutdown::Write);
            self.join()
        }

        fn terminate(&mut self) {
            self.force_kill_and_wait();
        }
    }

    impl Drop for ThreadWorker {
        fn drop(&mut self) {
            // Never join here: a worker stuck in a chunk would hang the drop.
            let _ = self.writer.shutdown(Shutdown::Both);
        }
    }
}
