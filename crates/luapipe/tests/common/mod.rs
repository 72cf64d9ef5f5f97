#![allow(dead_code)]

use std::sync::Arc;

use luapipe::{
    CompiledChunk, Host, IdAllocator, Interpreter, InterpreterConfig, ScriptError, Table,
    ThreadSpawner, Value, WorkerHandler,
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A worker that knows a handful of fixed scripts.
#[derive(Default)]
pub struct ScriptHandler {
    compiled: i64,
}

impl WorkerHandler for ScriptHandler {
    fn compile(&mut self, text: &str, chunk_name: &str) -> Result<CompiledChunk, ScriptError> {
        self.compiled += 1;
        let chunk_name = chunk_name.to_string();
        let chunk: CompiledChunk = match text {
            "return 1+1" => Box::new(|_: &mut Host, _: Vec<Value>| Ok(vec![Value::Integer(2)])),
            "return ..." => Box::new(|_: &mut Host, args: Vec<Value>| Ok(args)),
            "error('boom')" => Box::new(move |_: &mut Host, _: Vec<Value>| {
                Err(ScriptError::new("boom")
                    .with_location(chunk_name.clone(), 1)
                    .with_trace(vec![Value::from("in main chunk"), Value::from("[C]: ?")]))
            }),
            // Calls its first argument with the rest.
            "local f = ... return f(select(2, ...))" => {
                Box::new(|host: &mut Host, mut args: Vec<Value>| {
                    if args.is_empty() {
                        return Err(ScriptError::new("attempt to call a nil value"));
                    }
                    let Value::Function(func) = args.remove(0) else {
                        return Err(ScriptError::new("attempt to call a non-function value"));
                    };
                    host.call_function(&func, args)
                })
            }
            "return mw.twice(...)" => {
                Box::new(|host: &mut Host, args: Vec<Value>| host.call_library("mw", "twice", args))
            }
            "return mw.fail()" => {
                Box::new(|host: &mut Host, _: Vec<Value>| host.call_library("mw", "fail", vec![]))
            }
            "mw.twice(...) return 'final'" => Box::new(|host: &mut Host, args: Vec<Value>| {
                host.call_library("mw", "twice", args)?;
                Ok(vec![Value::from("final")])
            }),
            "crash()" => Box::new(
                |_: &mut Host, _: Vec<Value>| -> Result<Vec<Value>, ScriptError> {
                    panic!("worker crashed")
                },
            ),
            _ => {
                return Err(ScriptError::new(format!("unexpected symbol near '{text}'"))
                    .with_location(chunk_name, 1));
            }
        };
        Ok(chunk)
    }

    fn status(&mut self) -> Table {
        let mut status = Table::new();
        status.insert("compiled", self.compiled);
        status.insert("vsize", 0);
        status
    }
}

pub fn thread_config(ids: &Arc<IdAllocator>) -> InterpreterConfig {
    InterpreterConfig::new(Arc::new(ThreadSpawner::new(ScriptHandler::default)))
        .with_ids(Arc::clone(ids))
}

pub fn thread_interpreter() -> Interpreter {
    init_tracing();
    Interpreter::new(thread_config(&Arc::new(IdAllocator::new()))).expect("spawn thread worker")
}
