// MathVM CLI
// Usage: mvm [FILE] [OPTIONS]

use clap::Parser;
use colored::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mathvm_core::binary;
use mathvm_core::compiler::Code;
use mathvm_core::error::{Error, TranslationError};
use mathvm_core::lexer::Scanner;
use mathvm_core::parser;
use mathvm_core::{Interpreter, Translator, VmConfig};

/// mvm - translate and run MathVM programs
#[derive(Parser)]
#[command(name = "mvm")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bytecode translator and interpreter for MathVM", long_about = None)]
struct Cli {
    /// Program to run (.mvm source or .mvmc compiled)
    file: Option<PathBuf>,

    /// Debug views: tokens, ast, asm (comma-separated)
    #[arg(short = 'd', long = "debug", value_delimiter = ',')]
    debug: Option<Vec<String>>,

    /// Execute inline code
    #[arg(short = 'e', long = "exec")]
    exec: Option<String>,

    /// Compile to .mvmc instead of running
    #[arg(short = 'c', long = "compile")]
    compile: bool,

    /// Check for errors without running
    #[arg(long = "check")]
    check: bool,

    /// Output path for compiled file (requires -c)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Interpreter limits as JSON
    #[arg(long = "config")]
    config: Option<PathBuf>,
}

fn main() {
    let filter = EnvFilter::try_from_env("MATHVM_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();
    let debug = DebugFlags::from_options(&cli.debug);

    let result = load_config(cli.config.as_deref()).and_then(|config| {
        if let Some(code) = &cli.exec {
            handle_source("<exec>", code, debug, &config)
        } else if let Some(path) = &cli.file {
            if cli.check {
                handle_check(path)
            } else if cli.compile {
                handle_compile(path, cli.output.clone())
            } else {
                handle_run(path, debug, &config)
            }
        } else {
            Err(format!(
                "No input. Run {} or {}",
                "mvm FILE".cyan(),
                "mvm -e CODE".cyan()
            ))
        }
    });

    if let Err(e) = result {
        eprint!("{}", e);
        if !e.ends_with('\n') {
            eprintln!();
        }
        std::process::exit(1);
    }
}

#[derive(Default, Clone, Copy)]
struct DebugFlags {
    tokens: bool,
    ast: bool,
    asm: bool,
}

impl DebugFlags {
    fn from_options(opts: &Option<Vec<String>>) -> Self {
        let mut flags = Self::default();
        if let Some(opts) = opts {
            for opt in opts {
                match opt.as_str() {
                    "tokens" => flags.tokens = true,
                    "ast" => flags.ast = true,
                    "asm" => flags.asm = true,
                    _ => eprintln!("{} Unknown debug option: {}", "!".yellow(), opt),
                }
            }
        }
        flags
    }
}

fn load_config(path: Option<&Path>) -> Result<VmConfig, String> {
    match path {
        Some(path) => VmConfig::load(path),
        None => Ok(VmConfig::default()),
    }
}

fn read_source(path: &Path) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("Error reading file '{}': {}", path.display(), e))
}

fn report_front_end(error: TranslationError, file: &str, source: &str) -> String {
    error.with_file(file).with_source(source).format()
}

fn translate(file: &str, source: &str) -> Result<Code, String> {
    Translator::new()
        .translate_file(file, source)
        .map_err(|e| e.report())
}

/// Check file for errors without running
fn handle_check(path: &Path) -> Result<(), String> {
    let source = read_source(path)?;
    let file_name = path.to_string_lossy().to_string();
    translate(&file_name, &source)?;
    println!("{} No errors found in {}", "✓".green(), path.display());
    Ok(())
}

fn handle_compile(path: &Path, output: Option<PathBuf>) -> Result<(), String> {
    let source = read_source(path)?;
    let file_name = path.to_string_lossy().to_string();
    let code = translate(&file_name, &source)?;

    let output_path = output.unwrap_or_else(|| path.with_extension("mvmc"));
    let bytes = binary::serialize(&code);
    fs::write(&output_path, bytes).map_err(|e| format!("Error writing file: {}", e))?;
    println!("{} Compiled to {}", "✓".green(), output_path.display());
    Ok(())
}

fn handle_run(path: &Path, debug: DebugFlags, config: &VmConfig) -> Result<(), String> {
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    if ext == "mvmc" {
        let data = fs::read(path)
            .map_err(|e| format!("Error reading file '{}': {}", path.display(), e))?;
        let code = binary::deserialize(&data)?;
        if debug.asm {
            print!("{}", code.disassemble_to_string());
            return Ok(());
        }
        return run(&code, config);
    }

    let source = read_source(path)?;
    let file_name = path.to_string_lossy().to_string();
    handle_source(&file_name, &source, debug, config)
}

fn handle_source(file: &str, source: &str, debug: DebugFlags, config: &VmConfig) -> Result<(), String> {
    if debug.tokens {
        let tokens = Scanner::new(source)
            .scan_tokens()
            .map_err(|e| report_front_end(e, file, source))?;
        println!("{}", "-- Tokens --".cyan());
        for token in &tokens {
            println!("  {:?} '{}'", token.kind, token.lexeme);
        }
        println!();
        return Ok(());
    }

    if debug.ast {
        let program = Scanner::new(source)
            .scan_tokens()
            .and_then(|tokens| parser::Parser::new(tokens).parse())
            .map_err(|e| report_front_end(e, file, source))?;
        println!("{}", "-- AST --".cyan());
        println!("{:#?}", program);
        return Ok(());
    }

    let code = translate(file, source)?;
    if debug.asm {
        print!("{}", code.disassemble_to_string());
        return Ok(());
    }
    run(&code, config)
}

fn run(code: &Code, config: &VmConfig) -> Result<(), String> {
    Interpreter::new(code)
        .with_config(config.clone())
        .execute(&mut [])
        .map_err(|e: Error| e.report())
}
