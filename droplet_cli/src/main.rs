//! Droplet — command-line compiler and runner.
//!
//! Modes: run a `.drop` source file, build it to a `.dbc` artifact, execute
//! an existing artifact, or disassemble.

mod pipeline;

use std::path::PathBuf;
use std::process::ExitCode;

const VERSION: &str = env!("CARGO_PKG_VERSION");

enum Mode {
    Run(PathBuf),
    Build { source: PathBuf, output: Option<PathBuf> },
    Exec(PathBuf),
    Disasm(PathBuf),
    PrintVersion,
    PrintHelp,
}

fn parse_args(args: &[String]) -> Result<Mode, String> {
    let mut iter = args.iter();
    let Some(first) = iter.next() else {
        return Ok(Mode::PrintHelp);
    };

    match first.as_str() {
        "--version" | "-V" => Ok(Mode::PrintVersion),
        "--help" | "-h" => Ok(Mode::PrintHelp),
        "run" => {
            let path = iter.next().ok_or("run: missing source file")?;
            Ok(Mode::Run(PathBuf::from(path)))
        }
        "build" => {
            let mut source = None;
            let mut output = None;
            while let Some(arg) = iter.next() {
                if arg == "-o" {
                    let out = iter.next().ok_or("build: -o requires a path")?;
                    output = Some(PathBuf::from(out));
                } else {
                    source = Some(PathBuf::from(arg));
                }
            }
            let source = source.ok_or("build: missing source file")?;
            Ok(Mode::Build { source, output })
        }
        "exec" => {
            let path = iter.next().ok_or("exec: missing artifact file")?;
            Ok(Mode::Exec(PathBuf::from(path)))
        }
        "disasm" => {
            let path = iter.next().ok_or("disasm: missing source file")?;
            Ok(Mode::Disasm(PathBuf::from(path)))
        }
        // Bare path: treat as `run`.
        other if !other.starts_with('-') => Ok(Mode::Run(PathBuf::from(other))),
        other => Err(format!("unknown option '{other}'")),
    }
}

fn help_text() -> String {
    format!(
        "droplet {VERSION}\n\
         usage:\n\
         \x20 droplet run <file.drop>          compile and run\n\
         \x20 droplet build <file.drop> [-o out.dbc]\n\
         \x20 droplet exec <file.dbc>          run a compiled artifact\n\
         \x20 droplet disasm <file.drop>       print bytecode listing\n\
         \x20 droplet --version | --help"
    )
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mode = match parse_args(&args) {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("droplet: {e}");
            return ExitCode::from(2);
        }
    };

    match mode {
        Mode::PrintVersion => {
            println!("droplet {VERSION}");
            ExitCode::SUCCESS
        }
        Mode::PrintHelp => {
            println!("{}", help_text());
            ExitCode::SUCCESS
        }
        Mode::Run(path) => pipeline::run_file(&path),
        Mode::Build { source, output } => pipeline::build_file(&source, output.as_deref()),
        Mode::Exec(path) => pipeline::exec_file(&path),
        Mode::Disasm(path) => pipeline::disasm_file(&path),
    }
}
