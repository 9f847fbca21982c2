// File: src/lib.rs
//
// Library interface for the Ardan execution engine.
// Exposes modules for integration testing and embedding.

pub mod ast;
pub mod builtins;
pub mod bytecode;
pub mod codec;
pub mod compiler;
pub mod errors;
pub mod lexer;
pub mod module;
pub mod parser;
pub mod repl;
pub mod runtime;
pub mod vm;

use errors::ArdanError;
use module::Module;
use runtime::value::Value;
use vm::Vm;

/// Lower a source string into a fresh module, returning it with its entry
/// chunk selected.
pub fn compile_source(source: &str, file: Option<std::path::PathBuf>) -> Result<Module, ArdanError> {
    let mut parser = parser::Parser::new(lexer::tokenize(source));
    if let Some(file) = file {
        parser = parser.with_source_file(file);
    }
    let program = parser.parse()?;
    let mut module = Module::new();
    compiler::compile_program(&mut module, &program)?;
    Ok(module)
}

/// Compile and run a source string on a fresh VM, returning the VM for
/// inspection alongside the script result.
pub fn run_source(source: &str) -> Result<(Vm, Value), ArdanError> {
    let module = compile_source(source, None)?;
    let mut vm = Vm::new();
    let result = vm.interpret(&module)?;
    Ok((vm, result))
}
