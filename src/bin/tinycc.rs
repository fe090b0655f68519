//! The compiler driver binary: takes one or more source files, JIT
//! compiles them, and runs the result, propagating its return value as
//! the process exit code.
//!
//! `--dump` inspects an earlier phase instead of running anything, for
//! debugging this compiler itself.
//!
//! Run with `--help` for more info.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use tinycc::codegen;
use tinycc::diag::Sink;
use tinycc::driver;
use tinycc::front::{self, ast::TranslationUnit};
use tinycc::ir;
use tinycc::sema;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// source files to compile (and, unless --dump is given, link and run)
    files: Vec<PathBuf>,
    /// inspect one phase's output instead of running the program
    #[arg(value_enum, short, long)]
    dump: Option<Dump>,
    /// reserved: this compiler performs no optimization passes
    #[arg(short = 'O', long, default_value_t = false)]
    opt: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Dump {
    Tokens,
    Ast,
    Ir,
    Asm,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .without_time()
        .init();

    let args = Args::parse();
    if args.opt {
        eprintln!("warning: -O/--opt is not implemented; this compiler never optimizes");
    }

    match args.dump {
        Some(format) => dump(&args.files, format),
        None => run(&args.files),
    }
}

fn run(files: &[PathBuf]) -> ExitCode {
    match driver::compile_and_run(files) {
        Ok(code) => ExitCode::from((code as i32 & 0xff) as u8),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn dump(files: &[PathBuf], format: Dump) -> ExitCode {
    let mut sink = Sink::new();
    let mut unit = TranslationUnit::default();

    for path in files {
        let Ok(text) = std::fs::read_to_string(path) else {
            eprintln!("error: could not read '{}'", path.display());
            return ExitCode::FAILURE;
        };
        let name = path.display().to_string();
        let tokens = front::lex::Lexer::new(&text, &name).tokenize(&mut sink);

        if format == Dump::Tokens {
            for tok in &tokens {
                println!("{}:{}: {:?} {:?}", tok.line, tok.column, tok.kind, tok.text);
            }
            continue;
        }

        let mut parsed = front::parse(&tokens, &name, &mut sink);
        if format == Dump::Ast {
            println!("{parsed:#?}");
        }
        unit.functions.append(&mut parsed.functions);
    }

    if sink.has_errors() {
        sink.print_all();
        return ExitCode::FAILURE;
    }
    if format == Dump::Tokens || format == Dump::Ast {
        return ExitCode::SUCCESS;
    }

    sema::analyze(&mut unit, "<dump>", &mut sink);
    if sink.has_errors() {
        sink.print_all();
        return ExitCode::FAILURE;
    }

    for func in &unit.functions {
        if func.is_prototype {
            continue;
        }
        let Some(ir_func) = ir::gen_function(func, "<dump>", &mut sink) else {
            continue;
        };
        match format {
            Dump::Ir => {
                println!("function {}:", ir_func.name);
                for inst in ir_func.instructions() {
                    println!("  {inst:?}");
                }
            }
            Dump::Asm => {
                let alloc = codegen::allocate(&ir_func);
                match codegen::build_function(&ir_func, &alloc, func.params.len()) {
                    Ok(compiled) => {
                        println!("function {} ({} bytes):", compiled.name, compiled.code.len());
                        for chunk in compiled.code.chunks(16) {
                            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
                            println!("  {}", hex.join(" "));
                        }
                    }
                    Err(e) => eprintln!("error: {e}"),
                }
            }
            Dump::Tokens | Dump::Ast => unreachable!(),
        }
    }

    if sink.has_errors() {
        sink.print_all();
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
