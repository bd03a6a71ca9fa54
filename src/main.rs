//! cloudctl-core command-line entry point.
//!
//! ## CLI Subcommands
//!
//! - `cloudctl-core-cli config show|defaults|validate` - Inspect configuration
//! - `cloudctl-core-cli simulate [--devices N] [--max-size M] [--viewers V]` -
//!   Run the capacity and coalescing scenarios against mock devices
//! - `cloudctl-core-cli version` - Print the version

use std::process::ExitCode;

use cloudctl_core::cli::{config_cmd, run_simulate};
use cloudctl_core::config;
use cloudctl_core::telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => {
                    config_cmd::run_show();
                    ExitCode::SUCCESS
                }
                "defaults" => {
                    config_cmd::run_defaults();
                    ExitCode::SUCCESS
                }
                "validate" => {
                    let code = config_cmd::run_validate();
                    ExitCode::from(code as u8)
                }
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::FAILURE
                }
            }
        }
        "simulate" => {
            let env = config::load();
            if let Err(e) = telemetry::init_logging(&env.logging) {
                eprintln!("Logging disabled: {}", e);
            }
            telemetry::init_metrics();
            let code = run_simulate(&args[2..]).await;
            ExitCode::from(code as u8)
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("cloudctl-core {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "cloudctl-core - device-access core for remote Android devices v{}

USAGE:
    cloudctl-core-cli [COMMAND] [OPTIONS]

COMMANDS:
    config       Inspect configuration (show, defaults, validate)
    simulate     Run capacity and coalescing scenarios on mock devices
    version      Show version information
    help         Show this help message

ENVIRONMENT:
    CLOUDCTL_*           See `cloudctl-core-cli config defaults`
    CLOUDCTL_LOG_FORMAT  json (default) or pretty
    CLOUDCTL_LOG_LEVEL   Log filter (default: info)
    CLOUDCTL_LOG_FILE    Append logs to this file instead of stderr

EXIT CODES:
    0  Success
    1  Failure / configuration warnings
    2  Usage error
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "config" => {
            eprintln!(
                "cloudctl-core-cli config - Inspect configuration

USAGE:
    cloudctl-core-cli config [show|defaults|validate]

SUBCOMMANDS:
    show      Print effective values after environment overrides
    defaults  Print built-in defaults
    validate  Check for suspicious combinations (exit 1 on warnings)
"
            );
        }
        "simulate" => {
            eprintln!(
                "cloudctl-core-cli simulate - Capacity and coalescing scenarios

USAGE:
    cloudctl-core-cli simulate [--devices N] [--max-size M] [--viewers V]

OPTIONS:
    --devices N   Mock devices to connect (default: 1200)
    --max-size M  Connection pool capacity (default: 1000)
    --viewers V   Concurrent callers of one screenshot (default: 5)

DESCRIPTION:
    Connects N mock devices into a pool capped at M, then has V callers
    request the same screenshot at once. Prints stats as JSON.
"
            );
        }
        _ => print_usage(),
    }
}
