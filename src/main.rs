#![warn(rust_2018_idioms)]

use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::process;

mod compiler;
mod debug;
mod memory;
mod vm;

use compiler::compiler::Compiler;
use compiler::parser::Parser;
use compiler::CompileError;
use memory::GC;
use vm::vm::VM;

enum ExitReason {
    Compile,
    Runtime,
}

fn main() {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: loxvm [path]");
            process::exit(64);
        }
    }
}

fn run_file(path: &str) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read {}: {}", path, err);
            process::exit(74);
        }
    };

    let mut gc = GC::new();
    match run_source(&mut gc, &source) {
        Ok(()) => {}
        Err(ExitReason::Compile) => process::exit(65),
        Err(ExitReason::Runtime) => process::exit(70),
    }
}

fn repl() {
    let mut gc = GC::new();
    let stdin = io::stdin();

    prompt();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        // Errors have already been reported; keep the session going with
        // the globals defined so far.
        let _ = run_source(&mut gc, &line);
        prompt();
    }
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

fn run_source(gc: &mut GC, source: &str) -> Result<(), ExitReason> {
    let declarations = Parser::new(source).parse().map_err(|err| {
        report_compile_error(&err);
        ExitReason::Compile
    })?;

    let function = Compiler::new(gc).compile(&declarations).map_err(|err| {
        report_compile_error(&err);
        ExitReason::Compile
    })?;

    // Runtime errors print their own message and stack trace.
    VM::new(gc)
        .interpret_function(function)
        .map_err(|_| ExitReason::Runtime)
}

fn report_compile_error(err: &CompileError) {
    // Parse errors were already reported as they were found.
    if !matches!(err, CompileError::Parse(_)) {
        eprintln!("{}", err);
    }
}
