//! Lox compiler library.
//!
//! Provides the driver pipeline behind the `loxc` binary:
//!
//! ```text
//! source -> tokens -> AST -> resolved AST -> interpret
//!                                         -> LLVM IR -> .ll
//!                                                    -> clang -c -> .o
//! ```
//!
//! Without an output path the program runs under the tree-walking
//! interpreter. With one, the code generator emits a textual LLVM module;
//! `.ll` is written as-is, `.o` is piped through clang for the host
//! target. Object files expose a `main` symbol and link only against
//! libc.

pub mod codegen;
pub mod config;

pub use codegen::{CodeGen, CodeGenError, get_target_triple};
pub use config::CompilerConfig;

use lox_frontend::{ErrorReporter, parse_and_resolve};
use lox_interpreter::Interpreter;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

/// Minimum clang/LLVM version required.
/// The generated IR uses opaque pointers (`ptr`), which needs LLVM 15+.
const MIN_CLANG_VERSION: u32 = 15;

/// Cache for the clang version probe; it only runs once per process.
static CLANG_VERSION_CHECKED: OnceLock<Result<u32, String>> = OnceLock::new();

/// Driver failures, mapped to process exit codes by the CLI.
#[derive(Debug)]
pub enum DriverError {
    /// Bad invocation: unreadable input, unsupported output extension,
    /// missing toolchain. Exit 64.
    Usage(String),
    /// Compile-time diagnostics were already reported to stderr. Exit 65.
    Compile,
    /// A runtime error was already reported to stderr. Exit 70.
    Runtime,
}

impl DriverError {
    pub fn exit_code(&self) -> i32 {
        match self {
            DriverError::Usage(_) => 64,
            DriverError::Compile => 65,
            DriverError::Runtime => 70,
        }
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::Usage(message) => write!(f, "{}", message),
            DriverError::Compile => write!(f, "compilation failed"),
            DriverError::Runtime => write!(f, "runtime error"),
        }
    }
}

impl std::error::Error for DriverError {}

fn read_source(path: &Path) -> Result<String, DriverError> {
    fs::read_to_string(path)
        .map_err(|e| DriverError::Usage(format!("Failed to read {}: {}", path.display(), e)))
}

fn front_end(source: &str) -> Result<lox_frontend::Program, DriverError> {
    let mut reporter = ErrorReporter::new();
    let program = parse_and_resolve(source, &mut reporter);
    if reporter.had_error() {
        return Err(DriverError::Compile);
    }
    Ok(program)
}

/// Interpret a source file with the tree-walking backend.
pub fn run_file(path: &Path) -> Result<(), DriverError> {
    let source = read_source(path)?;
    let program = front_end(&source)?;

    let mut interpreter = Interpreter::new();
    match interpreter.interpret(&program) {
        Ok(()) => Ok(()),
        Err(error) => {
            interpreter.report(&error);
            Err(DriverError::Runtime)
        }
    }
}

/// Compile a source file to `.ll` or `.o`, per the output extension.
pub fn compile_file(
    input: &Path,
    output: &Path,
    config: &CompilerConfig,
) -> Result<(), DriverError> {
    let source = read_source(input)?;
    let program = front_end(&source)?;

    let triple = config
        .target_triple
        .clone()
        .unwrap_or_else(|| get_target_triple().to_string());
    let mut codegen = CodeGen::new(config.stress_gc, triple);
    let ir = codegen.compile_program(&program).map_err(|e| {
        eprintln!("Error: {}", e);
        DriverError::Compile
    })?;

    match output.extension().and_then(|e| e.to_str()) {
        Some("ll") => {
            fs::write(output, ir).map_err(|e| {
                DriverError::Usage(format!("Failed to write {}: {}", output.display(), e))
            })?;
            Ok(())
        }
        Some("o") => write_object(output, &ir, config),
        _ => Err(DriverError::Usage(
            "Output file should have .ll or .o extension.".to_string(),
        )),
    }
}

/// Write the IR next to the object file and hand it to clang; the IR file
/// is removed afterwards.
fn write_object(output: &Path, ir: &str, config: &CompilerConfig) -> Result<(), DriverError> {
    check_clang_version().map_err(DriverError::Usage)?;

    let ir_path = output.with_extension("ll");
    fs::write(&ir_path, ir).map_err(|e| {
        DriverError::Usage(format!("Failed to write {}: {}", ir_path.display(), e))
    })?;

    let opt_level = if config.optimize { "-O2" } else { "-O0" };
    let status = Command::new("clang")
        .arg("-c")
        .arg(opt_level)
        .arg(&ir_path)
        .arg("-o")
        .arg(output)
        .status()
        .map_err(|e| DriverError::Usage(format!("Failed to run clang: {}", e)))?;

    let _ = fs::remove_file(&ir_path);

    if !status.success() {
        eprintln!("Error: clang failed with exit code {:?}", status.code());
        return Err(DriverError::Compile);
    }
    Ok(())
}

/// Check that clang is available and recent enough for opaque pointers.
fn check_clang_version() -> Result<u32, String> {
    CLANG_VERSION_CHECKED
        .get_or_init(|| {
            let output = Command::new("clang")
                .arg("--version")
                .output()
                .map_err(|e| {
                    format!(
                        "Failed to run clang: {}. Please install clang {} or later.",
                        e, MIN_CLANG_VERSION
                    )
                })?;

            if !output.status.success() {
                return Err(format!(
                    "clang --version failed with exit code {:?}",
                    output.status.code()
                ));
            }

            let version_str = String::from_utf8_lossy(&output.stdout);
            let version = parse_clang_version(&version_str).ok_or_else(|| {
                format!(
                    "Could not parse clang version from: {}",
                    version_str.lines().next().unwrap_or(&version_str)
                )
            })?;

            // Apple clang numbers differently; Apple clang 14 carries
            // LLVM 15's opaque-pointer support.
            let is_apple = version_str.contains("Apple clang");
            let effective_min = if is_apple { 14 } else { MIN_CLANG_VERSION };
            if version < effective_min {
                return Err(format!(
                    "clang version {} detected, but loxc requires {} or later \
                     (the generated IR uses opaque pointers).",
                    version, effective_min
                ));
            }

            Ok(version)
        })
        .clone()
}

/// Parse the major version out of `clang --version` output like
/// "clang version 15.0.0", "Apple clang version 14.0.3" or
/// "Homebrew clang version 17.0.6".
fn parse_clang_version(output: &str) -> Option<u32> {
    let first_line = output.lines().next()?;
    let after = first_line.split("version ").nth(1)?;
    let major = after.split('.').next()?;
    major.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_parse_clang_version_variants() {
        assert_eq!(
            parse_clang_version("clang version 15.0.0 (https://github.com/llvm)"),
            Some(15)
        );
        assert_eq!(
            parse_clang_version("Apple clang version 14.0.3 (clang-1403.0.22.14.1)"),
            Some(14)
        );
        assert_eq!(
            parse_clang_version("Homebrew clang version 17.0.6"),
            Some(17)
        );
        assert_eq!(parse_clang_version("no version here"), None);
    }

    #[test]
    fn test_compile_file_writes_ll() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("program.lox");
        let output = dir.path().join("program.ll");
        let mut file = fs::File::create(&input).unwrap();
        writeln!(file, "print 1 + 2;").unwrap();

        compile_file(&input, &output, &CompilerConfig::default()).unwrap();
        let ir = fs::read_to_string(&output).unwrap();
        assert!(ir.contains("define i32 @main()"));
        assert!(ir.contains("call void @$print(i64"));
    }

    #[test]
    fn test_unsupported_output_extension_is_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("program.lox");
        fs::write(&input, "print 1;").unwrap();
        let output = dir.path().join("program.exe");

        let error = compile_file(&input, &output, &CompilerConfig::default()).unwrap_err();
        assert_eq!(error.exit_code(), 64);
    }

    #[test]
    fn test_missing_input_is_usage_error() {
        let error = run_file(Path::new("/does/not/exist.lox")).unwrap_err();
        assert_eq!(error.exit_code(), 64);
    }

    #[test]
    fn test_compile_error_stops_before_codegen() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("bad.lox");
        fs::write(&input, "return 1;").unwrap();
        let output = dir.path().join("bad.ll");

        let error = compile_file(&input, &output, &CompilerConfig::default()).unwrap_err();
        assert_eq!(error.exit_code(), 65);
        assert!(!output.exists());
    }

    #[test]
    fn test_run_file_reports_runtime_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("boom.lox");
        fs::write(&input, "var x; x();").unwrap();

        let error = run_file(&input).unwrap_err();
        assert_eq!(error.exit_code(), 70);
    }

    #[test]
    fn test_run_file_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("ok.lox");
        fs::write(&input, "var a = 1; { var b = a + 1; }").unwrap();
        run_file(&input).unwrap();
    }
}
