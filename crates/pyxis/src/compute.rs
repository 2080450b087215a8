//! Compute threads: parallel interpreters in separate VM slots.
//!
//! A compute thread binds one of 16 process-wide VM slots, spawns an OS
//! thread with an independent interpreter, and communicates only through
//! pickled byte payloads: values never cross slots directly, and `join`
//! is the only happens-before edge back into the submitting VM.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread::JoinHandle,
};

use crate::{
    bytecode::code::Code,
    error::{RunError, RunResult},
    value::Value,
    vm::Vm,
};

/// Maximum concurrently bound VM slots.
pub const MAX_VM_SLOTS: usize = 16;

static SLOT_FLAGS: [AtomicBool; MAX_VM_SLOTS] = [const { AtomicBool::new(false) }; MAX_VM_SLOTS];

/// Work shipped to a compute thread. Code objects are self-contained, so
/// they cross threads as-is; argument values go through pickle.
enum ComputeJob {
    /// Run a module body; the result is the body's return value.
    Exec(Code),
    /// Run an expression body; the result is the expression value.
    Eval(Code),
    /// Run a module body, then call one of its globals with pickled
    /// arguments.
    Call {
        module: Code,
        func: String,
        args_data: Vec<u8>,
    },
}

/// A worker interpreter on its own OS thread.
pub struct ComputeThread {
    slot: usize,
    handle: Option<JoinHandle<Result<Vec<u8>, String>>>,
}

impl ComputeThread {
    /// Binds a free VM slot. Raises `OSError` when all 16 are taken.
    pub fn new() -> RunResult<Self> {
        for slot in 0..MAX_VM_SLOTS {
            if SLOT_FLAGS[slot]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(Self { slot, handle: None });
            }
        }
        Err(RunError::os_error("no free VM slot"))
    }

    /// The bound slot index.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// True when no job is running.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    fn submit(&mut self, job: ComputeJob) -> RunResult<()> {
        if self.handle.is_some() {
            return Err(RunError::os_error("thread is not done yet"));
        }
        self.handle = Some(std::thread::spawn(move || run_job(job)));
        Ok(())
    }

    /// Executes a module body on the worker.
    pub fn submit_exec(&mut self, code: Code) -> RunResult<()> {
        self.submit(ComputeJob::Exec(code))
    }

    /// Evaluates an expression body on the worker.
    pub fn submit_eval(&mut self, code: Code) -> RunResult<()> {
        self.submit(ComputeJob::Eval(code))
    }

    /// Executes a module body, then calls `func(*args)` on the worker.
    /// `args` are pickled in the submitting VM.
    pub fn submit_call(&mut self, vm: &mut Vm, module: Code, func: &str, args: &[Value]) -> RunResult<()> {
        let args_tuple = vm.new_tuple(args.to_vec());
        let args_data = vm.pickle_dumps(args_tuple)?;
        self.submit(ComputeJob::Call {
            module,
            func: func.to_owned(),
            args_data,
        })
    }

    /// Blocks until the job finishes and unpickles its result into the
    /// submitting VM. A worker exception resurfaces here as `RuntimeError`
    /// carrying the formatted traceback.
    pub fn join(&mut self, vm: &mut Vm) -> RunResult<Value> {
        let Some(handle) = self.handle.take() else {
            return Err(RunError::os_error("no job submitted"));
        };
        match handle.join() {
            Ok(Ok(bytes)) => vm.pickle_loads(&bytes),
            Ok(Err(trace)) => Err(RunError::runtime_error(format!("compute thread failed:\n{trace}"))),
            Err(_) => Err(RunError::os_error("compute thread panicked")),
        }
    }
}

impl Drop for ComputeThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        SLOT_FLAGS[self.slot].store(false, Ordering::Release);
    }
}

/// Worker entry: a fresh interpreter, the job, a pickled result out.
fn run_job(job: ComputeJob) -> Result<Vec<u8>, String> {
    let mut vm = Vm::new();
    let main = vm.main_module();

    let result: RunResult<Value> = (|| match job {
        ComputeJob::Exec(code) | ComputeJob::Eval(code) => vm.exec_code(code, main),
        ComputeJob::Call { module, func, args_data } => {
            vm.exec_code(module, main)?;
            let callable = vm
                .get_global(&func)
                .ok_or_else(|| RunError::name_error(&func))?;
            let args_tuple = vm.pickle_loads(&args_data)?;
            let args = vm.tuple_items(args_tuple)?;
            vm.call_value(callable, &args)
        }
    })();

    match result {
        Ok(v) => vm.pickle_dumps(v).map_err(|e| e.to_string()),
        Err(err) => match err {
            RunError::Value(exc) => Err(vm.format_exc(exc)),
            other => Err(other.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_exhaustion_and_release() {
        let mut threads = Vec::new();
        for _ in 0..MAX_VM_SLOTS {
            threads.push(ComputeThread::new().unwrap());
        }
        assert!(ComputeThread::new().is_err());
        threads.clear();
        let again = ComputeThread::new().unwrap();
        assert!(again.is_done());
    }
}
