//! Standalone interpreter.
//!
//! Runs either a `.pyxc` artifact (a postcard-serialised code object) or,
//! when a compiler hook is available, a `.py` source file. Exit codes
//! follow the embedding contract: 0 on normal termination, 1 for an
//! uncaught exception, 2 for a compile error, 3 for initialisation or
//! system failure.

use std::{env, fs, process::ExitCode};

use pyxis::{
    CompileMode, ExcKind, RunError, Vm,
    bytecode::Code,
};

const EXIT_OK: u8 = 0;
const EXIT_UNCAUGHT: u8 = 1;
const EXIT_COMPILE_ERROR: u8 = 2;
const EXIT_INIT_FAILURE: u8 = 3;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let Some(file_path) = args.get(1) else {
        eprintln!("usage: pyxis <file.py | file.pyxc>");
        return ExitCode::from(EXIT_INIT_FAILURE);
    };

    let mut vm = Vm::new();

    let code = if file_path.ends_with(".pyxc") {
        let bytes = match fs::read(file_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                eprintln!("error: cannot read {file_path}: {err}");
                return ExitCode::from(EXIT_INIT_FAILURE);
            }
        };
        match postcard::from_bytes::<Code>(&bytes) {
            Ok(code) => code,
            Err(err) => {
                eprintln!("error: invalid code artifact {file_path}: {err}");
                return ExitCode::from(EXIT_COMPILE_ERROR);
            }
        }
    } else {
        let source = match fs::read_to_string(file_path) {
            Ok(source) => source,
            Err(err) => {
                eprintln!("error: cannot read {file_path}: {err}");
                return ExitCode::from(EXIT_INIT_FAILURE);
            }
        };
        match vm.compile(&source, CompileMode::Exec, file_path) {
            Ok(code) => code,
            Err(err) => {
                eprintln!("{err}");
                return ExitCode::from(EXIT_COMPILE_ERROR);
            }
        }
    };

    let main_module = vm.main_module();
    match vm.exec_code(code, main_module) {
        Ok(_) => ExitCode::from(EXIT_OK),
        Err(err) => exit_for_error(&mut vm, err),
    }
}

/// Maps an escaped exception to the process exit code, printing the
/// traceback for anything that is not a clean `exit(n)`.
fn exit_for_error(vm: &mut Vm, err: RunError) -> ExitCode {
    match err {
        RunError::Value(exc) => {
            if vm.exception_kind(exc) == Some(ExcKind::SystemExit) {
                let code = vm.exception_message(exc).parse::<i64>().unwrap_or(0);
                return ExitCode::from(u8::try_from(code.clamp(0, 255)).unwrap_or(EXIT_UNCAUGHT));
            }
            eprint!("{}", vm.format_exc(exc));
            ExitCode::from(EXIT_UNCAUGHT)
        }
        RunError::Raise(ExcKind::SystemExit, msg) => {
            let code = msg.and_then(|m| m.parse::<i64>().ok()).unwrap_or(0);
            ExitCode::from(u8::try_from(code.clamp(0, 255)).unwrap_or(EXIT_UNCAUGHT))
        }
        other => {
            eprintln!("{other}");
            ExitCode::from(EXIT_UNCAUGHT)
        }
    }
}
