//! Gravity CLI: run a compiled JSON executable.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use gravity::core::value::value_display;
use gravity::{load_buffer, GravityVm};

#[derive(Parser)]
#[command(name = "gravity", version, about = "Gravity runtime core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a compiled .json executable (runs $moduleinit, then main)
    Run {
        /// Path to the compiled executable
        path: PathBuf,
        /// Silent-null mode: lookups on null return null instead of raising
        #[arg(long)]
        null_silent: bool,
    },
    /// Parse an executable and print its structure without running it
    Inspect {
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { path, null_silent } => {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| miette::miette!("Cannot read '{}': {}", path.display(), e))?;
            let mut vm = GravityVm::new_default();
            vm.set_null_silent(null_silent);
            let closure = load_buffer(&mut vm, &text)
                .map_err(|e| miette::miette!("{}", e))?;
            let result = vm
                .run_main(closure)
                .map_err(|e| miette::miette!("{}", e))?;
            println!("{}", value_display(vm.heap(), result));
            Ok(())
        }
        Command::Inspect { path } => {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| miette::miette!("Cannot read '{}': {}", path.display(), e))?;
            let json: serde_json::Value = serde_json::from_str(&text).into_diagnostic()?;
            println!("{}", serde_json::to_string_pretty(&json).into_diagnostic()?);
            Ok(())
        }
    }
}
