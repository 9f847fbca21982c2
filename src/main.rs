// File: src/main.rs
//
// Main entry point for the Ardan execution engine. Parses command-line
// arguments and dispatches to the appropriate subcommand: run a source file,
// build a bytecode image, execute an image, disassemble, or start the REPL.

mod ast;
mod builtins;
mod bytecode;
mod codec;
mod compiler;
mod errors;
mod lexer;
mod module;
mod parser;
mod repl;
mod runtime;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use module::Module;
use std::fs;
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(
    name = "ardan",
    about = "Ardan: a class-based scripting language on a register bytecode VM",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Compile and run an Ardan source file
    Run {
        /// Path to the .ardan source file
        file: PathBuf,

        /// Print each chunk's bytecode before running
        #[arg(long)]
        disasm: bool,
    },

    /// Compile a source file into a .ardar bytecode image
    Build {
        /// Path to the .ardan source file
        file: PathBuf,

        /// Output path (defaults to the input with a .ardar extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Execute a compiled .ardar bytecode image
    Exec {
        /// Path to the .ardar image
        file: PathBuf,
    },

    /// Disassemble a source file or .ardar image
    Disasm {
        /// Path to a .ardan source file or .ardar image
        file: PathBuf,
    },

    /// Launch the interactive REPL
    Repl,
}

fn load_module(file: &PathBuf) -> Module {
    let is_image = file.extension().map(|ext| ext == "ardar").unwrap_or(false);
    let result = if is_image {
        codec::ArdarReader::open(file).and_then(|mut reader| reader.read_module())
    } else {
        let source = match fs::read_to_string(file) {
            Ok(source) => source,
            Err(error) => {
                eprintln!("Failed to read {}: {}", file.display(), error);
                process::exit(1);
            }
        };
        ardan_compile(&source, file.clone())
    };
    match result {
        Ok(module) => module,
        Err(error) => {
            eprintln!("{}", error);
            process::exit(1);
        }
    }
}

fn ardan_compile(source: &str, file: PathBuf) -> Result<Module, errors::ArdanError> {
    let mut parser = parser::Parser::new(lexer::tokenize(source)).with_source_file(file);
    let program = parser.parse()?;
    let mut module = Module::new();
    compiler::compile_program(&mut module, &program)?;
    Ok(module)
}

fn run_module(module: &Module) {
    let mut vm = vm::Vm::new();
    if let Err(error) = vm.interpret(module) {
        eprintln!("{}", error);
        process::exit(1);
    }
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, disasm } => {
            let module = load_module(&file);
            if disasm {
                for chunk in &module.chunks {
                    eprint!("{}", chunk.disassemble());
                }
            }
            run_module(&module);
        }

        Commands::Build { file, output } => {
            let module = load_module(&file);
            let output = output.unwrap_or_else(|| file.with_extension("ardar"));
            let result = codec::ArdarWriter::create(&output)
                .and_then(|mut writer| writer.write_module(&module));
            match result {
                Ok(()) => println!("Wrote {}", output.display()),
                Err(error) => {
                    eprintln!("{}", error);
                    process::exit(1);
                }
            }
        }

        Commands::Exec { file } => {
            let module = load_module(&file);
            run_module(&module);
        }

        Commands::Disasm { file } => {
            let module = load_module(&file);
            for chunk in &module.chunks {
                print!("{}", chunk.disassemble());
            }
        }

        Commands::Repl => match repl::Repl::new() {
            Ok(mut repl) => {
                if let Err(error) = repl.run() {
                    eprintln!("REPL error: {}", error);
                    process::exit(1);
                }
            }
            Err(error) => {
                eprintln!("Failed to start REPL: {}", error);
                process::exit(1);
            }
        },
    }
}
