//! Lox compiler CLI.
//!
//! With no output path the program is interpreted directly; with `-o` it
//! compiles to textual LLVM IR (`.ll`) or a native object file (`.o`).
//!
//! Exit codes: 0 on success, 64 on usage errors, 65 on compile errors,
//! 70 on runtime errors.

use clap::Parser as ClapParser;
use loxc::{CompilerConfig, DriverError, compile_file, run_file};
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(name = "loxc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lox compiler - run .lox programs or compile them to native code", long_about = None)]
struct Cli {
    /// Input source file
    input: PathBuf,

    /// Output file: .ll for LLVM IR, .o for a native object.
    /// Without it, the program runs under the interpreter.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Don't optimize when producing an object file
    #[arg(long = "dontoptimize")]
    dont_optimize: bool,

    /// Run the garbage collector on every allocation (stress mode)
    #[arg(long = "stressgc")]
    stress_gc: bool,
}

fn main() {
    let cli = Cli::parse();

    let result = match &cli.output {
        Some(output) => {
            let config = CompilerConfig::new()
                .with_optimize(!cli.dont_optimize)
                .with_stress_gc(cli.stress_gc);
            compile_file(&cli.input, output, &config)
        }
        None => run_file(&cli.input),
    };

    if let Err(error) = result {
        if let DriverError::Usage(message) = &error {
            eprintln!("Error: {}", message);
        }
        process::exit(error.exit_code());
    }
}
