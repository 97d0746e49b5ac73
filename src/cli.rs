// CLI module - command-line argument parsing and handlers
//
// Provides subcommands for configuration management plus the top-level
// flags every run needs: which device to target and where the event
// database lives.

use crate::config::{Config, VERSION};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::process::Command;

#[derive(Parser)]
#[command(name = "devbenchd")]
#[command(version = VERSION)]
#[command(about = "Observation and automation core for an Android device workstation", long_about = None)]
pub struct Cli {
    /// Device serial to target (overrides config and $DEVBENCH_DEVICE)
    #[arg(long, global = true)]
    pub device: Option<String>,

    /// Path to the event database (overrides the configured data directory)
    #[arg(long, global = true)]
    pub db: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage configuration
    Config {
        #[arg(long)]
        show: bool,
        #[arg(long)]
        reset: bool,
        #[arg(long)]
        edit: bool,
        #[arg(long)]
        path: bool,
    },
}

/// Handle CLI commands. Returns true if a command was handled (exit after).
pub fn handle_cli(cli: &Cli) -> bool {
    match &cli.command {
        Some(Commands::Config { show, reset, edit, path }) => {
            if *path {
                handle_config_path();
            } else if *show {
                handle_config_show();
            } else if *reset {
                handle_config_reset();
            } else if *edit {
                handle_config_edit();
            } else {
                println!("Usage: devbenchd config [--show|--reset|--edit|--path]");
            }
            true
        }
        None => false,
    }
}

fn handle_config_path() {
    match Config::config_path() {
        Some(path) => println!("{}", path.display()),
        None => {
            eprintln!("Error: Could not determine config path");
            std::process::exit(1);
        }
    }
}

fn handle_config_show() {
    let config = Config::from_env();
    println!("# Effective configuration (env > file > defaults)");
    println!();
    println!("device_id = {:?}", config.device_id);
    println!("adb_binary = {:?}", config.adb_binary);
    println!("data_dir = {:?}", config.data_dir.display().to_string());
    println!();
    print!("{}", config.to_toml());

    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("# Source: {}", path.display());
        } else {
            println!("# Source: defaults (no config file)");
        }
    }
}

fn handle_config_reset() {
    let Some(path) = Config::config_path() else {
        eprintln!("Error: Could not determine config path");
        std::process::exit(1);
    };

    if path.exists() {
        eprint!("Config file exists at {}. Overwrite? [y/N] ", path.display());
        std::io::stderr().flush().unwrap();
        let mut input = String::new();
        std::io::stdin().read_line(&mut input).unwrap();
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return;
        }
    }

    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("Error creating directory: {e}");
            std::process::exit(1);
        }
    }

    if let Err(e) = std::fs::write(&path, Config::default().to_toml()) {
        eprintln!("Error writing config: {e}");
        std::process::exit(1);
    }
    println!("Config reset to defaults: {}", path.display());
}

fn handle_config_edit() {
    let Some(path) = Config::config_path() else {
        eprintln!("Error: Could not determine config path");
        std::process::exit(1);
    };

    if !path.exists() {
        Config::ensure_config_exists();
        println!("Created new config file: {}", path.display());
    }

    let editor = std::env::var("EDITOR")
        .or_else(|_| std::env::var("VISUAL"))
        .unwrap_or_else(|_| if cfg!(windows) { "notepad".to_string() } else { "nano".to_string() });

    println!("Opening {} with {}", path.display(), editor);
    let status = Command::new(&editor).arg(&path).status();
    match status {
        Ok(s) if s.success() => {}
        Ok(s) => {
            eprintln!("Editor exited with status: {s}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed to launch editor '{editor}': {e}");
            eprintln!("Set $EDITOR environment variable to your preferred editor");
            std::process::exit(1);
        }
    }
}
