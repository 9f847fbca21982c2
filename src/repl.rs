// File: src/repl.rs
//
// Interactive REPL. Each input line compiles into the persistent module as a
// fresh entry chunk and runs against the persistent VM, so bindings survive
// between lines.

use crate::compiler;
use crate::lexer::tokenize;
use crate::module::Module;
use crate::parser::Parser;
use crate::vm::Vm;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub struct Repl {
    editor: DefaultEditor,
    module: Module,
    vm: Vm,
}

impl Repl {
    pub fn new() -> Result<Self, ReadlineError> {
        Ok(Self { editor: DefaultEditor::new()?, module: Module::new(), vm: Vm::new() })
    }

    pub fn run(&mut self) -> Result<(), ReadlineError> {
        println!("Ardan {} — type .exit to quit", env!("CARGO_PKG_VERSION"));

        loop {
            match self.editor.readline("ardan> ") {
                Ok(line) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if trimmed == ".exit" {
                        break;
                    }
                    let _ = self.editor.add_history_entry(trimmed);
                    self.eval_line(trimmed);
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn eval_line(&mut self, source: &str) {
        let mut parser = Parser::new(tokenize(source));
        let program = match parser.parse() {
            Ok(program) => program,
            Err(error) => {
                eprintln!("{}", error);
                return;
            }
        };

        if let Err(error) = compiler::compile_program(&mut self.module, &program) {
            eprintln!("{}", error);
            return;
        }

        match self.vm.interpret(&self.module) {
            Ok(value) => {
                if !matches!(value, crate::runtime::value::Value::Undefined) {
                    println!("{}", value.to_display_string());
                }
            }
            Err(error) => eprintln!("{}", error),
        }
    }
}
