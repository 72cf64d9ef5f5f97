//! One worker process and the protocol state driving it.
//!
//! Calls are strictly sequential: every public operation takes `&mut self`, sends one
//! message and loops on replies until the worker answers with `return` or `error`. A
//! worker-initiated `call` in between is served inline from the handle registry and
//! answered before the loop continues.
//!
//! Any pipe failure reaps the worker, classifies its exit, and closes the interpreter.
//! The classified error is kept and returned by every later operation without touching
//! the pipes again.

use std::sync::Arc;

use crate::bridge::codec::{CodecError, FrameCodec, read_frame, write_frame};
use crate::bridge::protocol::{HostMessage, WorkerMessage};
use crate::error::{BridgeError, Result, ScriptError};
use crate::failure;
use crate::registry::{Callback, HandleRegistry, IdAllocator};
use crate::supervisor::{SpawnContext, WorkerProcess, WorkerSpawner};
use crate::value::{FunctionHandle, InstanceId, Value};

/// Where the dispatch loop is. Every state but `Closed` returns to `Idle` once the
/// operation that left it is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Sending,
    AwaitingReply,
    HandlingCallback,
    /// A `return` or `error` arrived and is on its way to the caller.
    ReturningToCaller,
    /// Terminal. Every later operation fails with the cached error.
    Closed,
}

#[derive(Clone)]
pub struct InterpreterConfig {
    pub spawner: Arc<dyn WorkerSpawner>,
    pub ids: Arc<IdAllocator>,
}

impl InterpreterConfig {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            spawner,
            ids: IdAllocator::process(),
        }
    }

    /// Draw instance ids and callback uids from `ids` instead of the process allocator.
    pub fn with_ids(mut self, ids: Arc<IdAllocator>) -> Self {
        self.ids = ids;
        self
    }
}

pub struct Interpreter {
    id: InstanceId,
    process: Box<dyn WorkerProcess>,
    codec: FrameCodec,
    registry: HandleRegistry,
    state: DispatchState,
    exit_error: Option<BridgeError>,
}

impl Interpreter {
    pub fn new(config: InterpreterConfig) -> Result<Self> {
        let id = config.ids.next_instance();
        let process = config.spawner.spawn(&SpawnContext { instance: id })?;
        tracing::debug!(instance = %id, pid = ?process.pid(), "Interpreter started");
        Ok(Self::with_process(id, process, config.ids))
    }

    fn with_process(id: InstanceId, process: Box<dyn WorkerProcess>, ids: Arc<IdAllocator>) -> Self {
        Self {
            id,
            process,
            codec: FrameCodec::host(),
            registry: HandleRegistry::new(id, ids),
            state: DispatchState::Idle,
            exit_error: None,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// OS process id of the worker, when it runs as a separate process.
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == DispatchState::Closed
    }

    /// The error that closed this interpreter, if a pipe failure did.
    pub fn terminal_error(&self) -> Option<&BridgeError> {
        self.exit_error.as_ref()
    }

    /// Compile `text` in the worker and return a handle to the chunk.
    pub fn load_string(&mut self, text: &str, chunk_name: &str) -> Result<FunctionHandle> {
        let msg = HostMessage::LoadString {
            text: text.to_string(),
            chunk_name: chunk_name.to_string(),
        };
        let body = msg.encode(self.id)?;
        self.cleanup_chunks()?;

        match first(self.dispatch_encoded(msg.op(), body)?) {
            Value::Function(handle) => {
                self.registry.check_handle(&handle)?;
                Ok(handle)
            }
            value => match value.as_integer() {
                Some(id) => Ok(self.registry.new_chunk_handle(id)),
                None => Err(self.protocol_violation("loadString did not return a chunk id")),
            },
        }
    }

    /// Call a worker function. Results come back nil-padded to the count the worker sent.
    pub fn call(&mut self, func: &FunctionHandle, args: Vec<Value>) -> Result<Vec<Value>> {
        self.registry.check_handle(func)?;
        let msg = HostMessage::Call {
            id: func.id(),
            args,
        };
        let body = msg.encode(self.id)?;
        self.cleanup_chunks()?;
        self.dispatch_encoded(msg.op(), body)
    }

    /// Make `callback` callable from the worker and return the worker-side function.
    pub fn wrap_callback(&mut self, callback: Callback) -> Result<FunctionHandle> {
        self.check_valid()?;
        let id = self.registry.register_anonymous(callback);
        match first(self.dispatch(HostMessage::WrapPhpFunction { id })?) {
            Value::Function(handle) => {
                self.registry.check_handle(&handle)?;
                Ok(handle)
            }
            _ => Err(self.protocol_violation("wrapPhpFunction did not return a function")),
        }
    }

    /// Install a table of host functions in the worker under `name`.
    pub fn register_library(
        &mut self,
        name: &str,
        functions: impl IntoIterator<Item = (String, Callback)>,
    ) -> Result<()> {
        self.check_valid()?;
        let functions = self.registry.register_library(name, functions);
        self.dispatch(HostMessage::RegisterLibrary {
            name: name.to_string(),
            functions,
        })?;
        Ok(())
    }

    /// Mark a chunk as no longer needed. The worker drops it before the next call.
    pub fn release(&mut self, handle: &FunctionHandle) -> Result<()> {
        self.check_valid()?;
        self.registry.mark_destroyed(handle)
    }

    /// Send `cleanupChunks` if anything was released since the last one.
    pub fn cleanup_chunks(&mut self) -> Result<()> {
        self.check_valid()?;
        let Some(released) = self.registry.drain_destroyed() else {
            return Ok(());
        };
        tracing::debug!(instance = %self.id, released = released.len(), "Cleaning up chunks");
        self.dispatch(HostMessage::CleanupChunks {
            ids: self.registry.live_chunks(),
        })?;
        Ok(())
    }

    /// The worker's status table.
    pub fn status(&mut self) -> Result<Value> {
        Ok(first(self.dispatch(HostMessage::GetStatus)?))
    }

    /// Ask the worker to exit and reap it. A no-op once the interpreter is closed.
    pub fn quit(&mut self) -> Result<()> {
        self.shutdown(HostMessage::Quit)
    }

    /// Like [`Interpreter::quit`], but the worker exits with a distinctive code.
    pub fn test_quit(&mut self) -> Result<()> {
        self.shutdown(HostMessage::TestQuit)
    }

    /// Kill the worker without asking. Later operations fail with `ProcessGone`.
    pub fn terminate(&mut self) {
        if self.state != DispatchState::Closed {
            tracing::debug!(instance = %self.id, "Terminating worker");
            self.process.terminate();
            self.state = DispatchState::Closed;
        }
    }

    fn shutdown(&mut self, msg: HostMessage) -> Result<()> {
        if self.state == DispatchState::Closed {
            return Ok(());
        }
        let body = msg.encode(self.id)?;
        self.send(msg.op(), &body)?;
        let status = self.process.close_and_wait();
        tracing::debug!(instance = %self.id, ?status, "Worker shut down");
        self.state = DispatchState::Closed;
        Ok(())
    }

    fn check_valid(&self) -> Result<()> {
        if self.state != DispatchState::Closed {
            return Ok(());
        }
        let err = self.exit_error.clone().unwrap_or(BridgeError::ProcessGone);
        tracing::error!(instance = %self.id, error = %err, "Interpreter used after close");
        Err(err)
    }

    fn dispatch(&mut self, msg: HostMessage) -> Result<Vec<Value>> {
        let body = msg.encode(self.id)?;
        self.dispatch_encoded(msg.op(), body)
    }

    fn dispatch_encoded(&mut self, op: &'static str, body: String) -> Result<Vec<Value>> {
        let result = self.run_dispatch(op, &body);
        if self.state != DispatchState::Closed {
            self.state = DispatchState::Idle;
        }
        result
    }

    fn run_dispatch(&mut self, op: &'static str, body: &str) -> Result<Vec<Value>> {
        self.send(op, body)?;
        loop {
            self.state = DispatchState::AwaitingReply;
            match self.receive()? {
                WorkerMessage::Return { values } => {
                    self.state = DispatchState::ReturningToCaller;
                    for value in &values {
                        self.registry.adopt_handles(value);
                    }
                    return Ok(values);
                }
                WorkerMessage::Call { id, args } => {
                    self.state = DispatchState::HandlingCallback;
                    let reply = self.handle_call(&id, args);
                    self.send(reply.0, &reply.1)?;
                }
                WorkerMessage::Error { value, trace } => {
                    self.state = DispatchState::ReturningToCaller;
                    return Err(ScriptError::from_worker(&value, trace).into());
                }
            }
        }
    }

    /// Run a callback and build the encoded reply for the worker.
    fn handle_call(&mut self, id: &str, args: Vec<Value>) -> (&'static str, String) {
        for arg in &args {
            self.registry.adopt_handles(arg);
        }
        let reply = match self.registry.resolve_callback(id, args) {
            Ok(values) => HostMessage::Return { values },
            Err(err) => HostMessage::Error {
                value: Value::String(err.worker_message()),
            },
        };
        match reply.encode(self.id) {
            Ok(body) => (reply.op(), body),
            Err(err) => {
                tracing::warn!(instance = %self.id, callback = id, error = %err, "Callback result cannot be sent");
                let reply = HostMessage::Error {
                    value: Value::String(err.to_string()),
                };
                // A plain string message always encodes.
                let body = reply.encode(self.id).unwrap_or_default();
                (reply.op(), body)
            }
        }
    }

    fn send(&mut self, op: &str, body: &str) -> Result<()> {
        self.check_valid()?;
        self.state = DispatchState::Sending;
        tracing::debug!(instance = %self.id, op, "TX ==>");

        let result = match self.process.writer() {
            Ok(writer) => write_frame(&mut self.codec, writer, body.as_bytes()),
            Err(e) => Err(CodecError::Io(e)),
        };
        result.map_err(|e| self.codec_failure(e))
    }

    fn receive(&mut self) -> Result<WorkerMessage> {
        self.check_valid()?;
        let result = match self.process.reader() {
            Ok(reader) => read_frame(&mut self.codec, reader),
            Err(e) => Err(CodecError::Io(e)),
        };
        let frame = result.map_err(|e| self.codec_failure(e))?;
        tracing::trace!(instance = %self.id, len = frame.len(), "Received frame");

        let msg = WorkerMessage::decode(&frame).inspect_err(|e| {
            tracing::error!(instance = %self.id, error = %e, "Invalid message from worker");
        })?;
        tracing::debug!(instance = %self.id, op = msg.op(), "RX <==");
        Ok(msg)
    }

    fn codec_failure(&mut self, err: CodecError) -> BridgeError {
        match err {
            CodecError::Io(e) => self.handle_io_error(e),
            CodecError::BadHeader(header) => {
                tracing::error!(instance = %self.id, header = %header, "Invalid frame header");
                BridgeError::decode(format!("invalid frame header {header:?}"))
            }
            CodecError::BadLength(len) => BridgeError::encode(format!("message of {len} bytes cannot be framed")),
        }
    }

    fn handle_io_error(&mut self, err: std::io::Error) -> BridgeError {
        tracing::debug!(instance = %self.id, error = %err, "Pipe failed, reaping worker");
        let status = self.process.force_kill_and_wait();
        let terminal = failure::classify(status);
        tracing::warn!(instance = %self.id, error = %terminal, "Worker is gone");
        self.exit_error = Some(terminal.clone());
        self.state = DispatchState::Closed;
        terminal
    }

    fn protocol_violation(&self, what: &str) -> BridgeError {
        tracing::error!(instance = %self.id, "{what}");
        BridgeError::decode(what)
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("id", &self.id)
            .field("pid", &self.process.pid())
            .field("state", &self.state)
            .field("exit_error", &self.exit_error)
            .finish()
    }
}

fn first(values: Vec<Value>) -> Value {
    values.into_iter().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor, Read, Write};
    use std::sync::Mutex;

    use tokio_util::bytes::BytesMut;
    use tokio_util::codec::Encoder;

    use super::*;
    use crate::supervisor::ExitStatus;
    use crate::value::Table;

    const ME: InstanceId = InstanceId::new(5);

    #[derive(Clone, Default)]
    struct Sent(Arc<Mutex<Vec<u8>>>);

    impl Write for Sent {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Sent {
        /// Host frame bodies written so far.
        fn bodies(&self) -> Vec<String> {
            let bytes = self.0.lock().unwrap().clone();
            let mut reader = Cursor::new(bytes);
            let mut codec = FrameCodec::worker();
            let mut out = Vec::new();
            while (reader.position() as usize) < reader.get_ref().len() {
                let body = read_frame(&mut codec, &mut reader).unwrap();
                out.push(String::from_utf8(body.to_vec()).unwrap());
            }
            out
        }

        fn len(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    /// Replays canned worker frames; EOF once they run out.
    struct ScriptedProcess {
        replies: Cursor<Vec<u8>>,
        sent: Sent,
        exit: Option<ExitStatus>,
    }

    impl WorkerProcess for ScriptedProcess {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn writer(&mut self) -> io::Result<&mut dyn Write> {
            Ok(&mut self.sent)
        }

        fn reader(&mut self) -> io::Result<&mut dyn Read> {
            Ok(&mut self.replies)
        }

        fn is_running(&mut self) -> bool {
            true
        }

        fn force_kill_and_wait(&mut self) -> Option<ExitStatus> {
            self.exit
        }

        fn close_and_wait(&mut self) -> Option<ExitStatus> {
            self.exit
        }

        fn terminate(&mut self) {}
    }

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        FrameCodec::worker().encode(body, &mut buf).unwrap();
        buf.to_vec()
    }

    fn scripted(replies: &[WorkerMessage], exit: Option<ExitStatus>) -> (Interpreter, Sent) {
        let bytes = replies.iter().flat_map(|msg| frame(&msg.encode())).collect();
        scripted_raw(bytes, exit)
    }

    fn scripted_raw(bytes: Vec<u8>, exit: Option<ExitStatus>) -> (Interpreter, Sent) {
        let sent = Sent::default();
        let process = ScriptedProcess {
            replies: Cursor::new(bytes),
            sent: sent.clone(),
            exit,
        };
        let interp = Interpreter::with_process(ME, Box::new(process), Arc::new(IdAllocator::new()));
        (interp, sent)
    }

    fn ret(values: Vec<Value>) -> WorkerMessage {
        WorkerMessage::Return { values }
    }

    #[test]
    fn nested_callback_is_answered_before_final_return() {
        let (mut interp, sent) = scripted(
            &[
                WorkerMessage::Call {
                    id: "anonymous*0".into(),
                    args: vec![Value::Integer(2)],
                },
                ret(vec![Value::from("final")]),
            ],
            None,
        );
        interp.registry.register_anonymous(Box::new(|args: Vec<Value>| {
            let n = args[0].as_integer().unwrap_or(0);
            Ok(vec![Value::Integer(n * 10)])
        }));
        let chunk = interp.registry.new_chunk_handle(1);

        let result = interp.call(&chunk, vec![]).unwrap();
        assert_eq!(result, vec![Value::from("final")]);
        assert_eq!(interp.state(), DispatchState::Idle);
        insta::assert_debug_snapshot!(sent.bodies(), @r#"
        [
            "{[\"op\"]=\"call\",[\"id\"]=1,[\"nargs\"]=0,[\"args\"]={}}",
            "{[\"op\"]=\"return\",[\"nvalues\"]=1,[\"values\"]={[1]=20}}",
        ]
        "#);
    }

    #[test]
    fn callback_errors_are_sent_to_the_worker() {
        let (mut interp, sent) = scripted(
            &[
                WorkerMessage::Call {
                    id: "anonymous*0".into(),
                    args: vec![],
                },
                WorkerMessage::Error {
                    value: Value::from("callback said no"),
                    trace: None,
                },
            ],
            None,
        );
        interp
            .registry
            .register_anonymous(Box::new(|_: Vec<Value>| Err(ScriptError::new("callback said no"))));
        let chunk = interp.registry.new_chunk_handle(1);

        let err = interp.call(&chunk, vec![]).unwrap_err();
        assert_eq!(err, BridgeError::Runtime(ScriptError::new("callback said no")));
        assert_eq!(
            sent.bodies()[1],
            r#"{["op"]="error",["value"]="callback said no"}"#
        );
        assert!(!interp.is_closed());
    }

    #[test]
    fn io_failure_is_classified_and_sticky() {
        let (mut interp, sent) = scripted(&[], Some(ExitStatus::signaled(9)));
        let chunk = interp.registry.new_chunk_handle(1);

        let err = interp.call(&chunk, vec![]).unwrap_err();
        assert_eq!(err, BridgeError::KilledBySignal(9));
        assert!(interp.is_closed());

        let written = sent.len();
        assert_eq!(interp.call(&chunk, vec![]).unwrap_err(), err);
        assert_eq!(interp.status().unwrap_err(), err);
        assert_eq!(interp.terminal_error(), Some(&err));
        assert_eq!(sent.len(), written);
    }

    #[test]
    fn unknown_exit_status_is_process_gone() {
        let (mut interp, _) = scripted(&[], None);
        assert_eq!(interp.status().unwrap_err(), BridgeError::ProcessGone);
    }

    #[test]
    fn foreign_handle_fails_without_io() {
        let (mut interp, sent) = scripted(&[ret(vec![])], None);
        let foreign = FunctionHandle::new(InstanceId::new(6), 1);

        let err = interp.call(&foreign, vec![]).unwrap_err();
        assert_eq!(
            err,
            BridgeError::HandleMismatch {
                expected: ME,
                found: InstanceId::new(6),
            }
        );
        assert_eq!(interp.release(&foreign).unwrap_err(), err);
        assert_eq!(sent.len(), 0);
    }

    #[test]
    fn encode_errors_fail_before_any_io() {
        let (mut interp, sent) = scripted(&[ret(vec![])], None);
        let chunk = interp.registry.new_chunk_handle(1);
        let released = interp.registry.new_chunk_handle(2);
        interp.release(&released).unwrap();

        let deep = (0..101).fold(Value::Nil, |v, _| Value::Table(Table::from_sequence([v])));
        let err = interp.call(&chunk, vec![deep]).unwrap_err();
        assert!(matches!(err, BridgeError::Encode(_)), "{err:?}");
        assert_eq!(sent.len(), 0);
        assert!(!interp.is_closed());
    }

    #[test]
    fn nan_table_keys_never_reach_the_worker() {
        let (mut interp, sent) = scripted(&[ret(vec![])], None);
        let chunk = interp.registry.new_chunk_handle(1);

        let mut table = Table::new();
        table.insert(f64::NAN, true);
        let err = interp.call(&chunk, vec![Value::Table(table)]).unwrap_err();
        assert_eq!(err, BridgeError::encode("table key is NaN"));
        assert_eq!(sent.len(), 0);
        assert_eq!(interp.state(), DispatchState::Idle);
    }

    #[test]
    fn released_chunks_are_cleaned_up_in_one_batch() {
        let (mut interp, sent) = scripted(&[ret(vec![]), ret(vec![Value::Boolean(true)])], None);
        let keep = interp.registry.new_chunk_handle(1);
        let a = interp.registry.new_chunk_handle(2);
        let b = interp.registry.new_chunk_handle(3);
        interp.release(&a).unwrap();
        interp.release(&b).unwrap();

        assert_eq!(interp.call(&keep, vec![]).unwrap(), vec![Value::Boolean(true)]);
        insta::assert_debug_snapshot!(sent.bodies(), @r#"
        [
            "{[\"op\"]=\"cleanupChunks\",[\"ids\"]={[1]=1}}",
            "{[\"op\"]=\"call\",[\"id\"]=1,[\"nargs\"]=0,[\"args\"]={}}",
        ]
        "#);
    }

    #[test]
    fn load_string_returns_a_live_handle() {
        let (mut interp, _) = scripted(&[ret(vec![Value::Integer(4)])], None);
        let chunk = interp.load_string("return 1", "=x").unwrap();
        assert_eq!(chunk, FunctionHandle::new(ME, 4));
        assert!(interp.registry.is_live(&chunk));
    }

    #[test]
    fn returned_functions_are_adopted() {
        let handle = FunctionHandle::new(ME, 9);
        let (mut interp, _) = scripted(&[ret(vec![Value::sequence([Value::Function(handle)])])], None);
        let chunk = interp.registry.new_chunk_handle(1);
        interp.call(&chunk, vec![]).unwrap();
        assert!(interp.registry.is_live(&handle));
    }

    #[test]
    fn runtime_errors_keep_the_interpreter_open() {
        let (mut interp, _) = scripted(
            &[
                WorkerMessage::Error {
                    value: Value::from("Module:Foo:3: boom"),
                    trace: Some(vec![Value::from("frame")]),
                },
                ret(vec![Value::Integer(1)]),
            ],
            None,
        );
        let chunk = interp.registry.new_chunk_handle(1);

        let BridgeError::Runtime(err) = interp.call(&chunk, vec![]).unwrap_err() else {
            panic!("expected runtime error");
        };
        assert_eq!(err.module.as_deref(), Some("Module:Foo"));
        assert_eq!(err.line, Some(3));
        assert_eq!(err.message, "boom");
        assert_eq!(err.trace, Some(vec![Value::from("frame")]));
        assert_eq!(interp.state(), DispatchState::Idle);

        assert_eq!(interp.call(&chunk, vec![]).unwrap(), vec![Value::Integer(1)]);
    }

    #[test]
    fn unknown_op_is_a_decode_error() {
        let (mut interp, _) = scripted_raw(frame(br#"a:1:{s:2:"op";s:5:"hello";}"#), None);
        let err = interp.status().unwrap_err();
        assert_eq!(err, BridgeError::decode("invalid response op \"hello\""));
        assert!(!interp.is_closed());
    }

    #[test]
    fn bad_header_is_not_terminal() {
        let (mut interp, _) = scripted_raw(b"0000000500000008hello".to_vec(), None);
        let err = interp.status().unwrap_err();
        assert!(matches!(err, BridgeError::Decode(_)), "{err:?}");
        assert!(!interp.is_closed());
    }

    #[test]
    fn quit_closes_without_a_terminal_error() {
        let (mut interp, sent) = scripted(&[], Some(ExitStatus::exited(0)));
        interp.quit().unwrap();
        assert!(interp.is_closed());
        assert_eq!(interp.terminal_error(), None);
        assert_eq!(sent.bodies(), vec![r#"{["op"]="quit"}"#.to_string()]);
        assert_eq!(interp.status().unwrap_err(), BridgeError::ProcessGone);
    }

    #[test]
    fn quitting_twice_is_silent() {
        let (mut interp, sent) = scripted(&[], Some(ExitStatus::exited(0)));
        interp.quit().unwrap();
        let written = sent.len();
        interp.quit().unwrap();
        interp.test_quit().unwrap();
        assert_eq!(sent.len(), written);
    }

    #[test]
    fn release_after_failure_replays_the_terminal_error() {
        let (mut interp, _) = scripted(&[], Some(ExitStatus::signaled(9)));
        let chunk = interp.registry.new_chunk_handle(1);
        let err = interp.status().unwrap_err();

        assert_eq!(interp.release(&chunk).unwrap_err(), err);
        assert!(interp.registry.is_live(&chunk));
    }

    #[test]
    fn replies_pass_through_returning_to_caller() {
        let (mut interp, _) = scripted(&[ret(vec![Value::Integer(1)])], None);
        let body = HostMessage::GetStatus.encode(ME).unwrap();

        interp.run_dispatch("getStatus", &body).unwrap();
        assert_eq!(interp.state(), DispatchState::ReturningToCaller);
    }

    #[test]
    fn wrap_and_register_use_distinct_callback_ids() {
        let (mut interp, sent) = scripted(
            &[
                ret(vec![Value::Function(FunctionHandle::new(ME, 3))]),
                ret(vec![]),
            ],
            None,
        );
        let wrapped = interp
            .wrap_callback(Box::new(|args: Vec<Value>| Ok(args)))
            .unwrap();
        assert_eq!(wrapped, FunctionHandle::new(ME, 3));

        interp
            .register_library(
                "mw",
                [("log".to_string(), Box::new(|_: Vec<Value>| Ok(vec![])) as Callback)],
            )
            .unwrap();
        insta::assert_debug_snapshot!(sent.bodies(), @r#"
        [
            "{[\"op\"]=\"wrapPhpFunction\",[\"id\"]=\"anonymous*0\"}",
            "{[\"op\"]=\"registerLibrary\",[\"name\"]=\"mw\",[\"functions\"]={[\"log\"]=\"mw-log-1\"}}",
        ]
        "#);
    }
}
