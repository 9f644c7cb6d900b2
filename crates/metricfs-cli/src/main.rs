//! metricfs - permission-filtered read-only metric filesystem.
//!
//! Presents a source directory of newline-delimited metric files as a
//! read-only mount in which each record is visible only when the
//! configured authorization backend allows it.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;
mod exit_codes;
mod flags;
mod fusefs;

use exit_codes::CliFailure;
use flags::CommonArgs;

/// metricfs - permission-filtered read-only metric filesystem
#[derive(Parser, Debug)]
#[command(name = "metricfs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mount the filtered view of the source tree
    Mount {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Stream one file's filtered projection to stdout
    Render {
        #[command(flatten)]
        common: CommonArgs,

        /// Source file to render
        #[arg(long)]
        file: PathBuf,
    },

    /// Pre-build the index cache for every record file
    WarmIndex {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Report file and byte totals for a mounted tree
    Stats {
        /// Mount path to walk
        #[arg(long)]
        mount: PathBuf,
    },

    /// Validate flags without side effects
    ValidateFlags {
        #[command(flatten)]
        common: CommonArgs,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let result = match &cli.command {
        Commands::Mount { common } => commands::mount::run(common),
        Commands::Render { common, file } => commands::render::run(common, file),
        Commands::WarmIndex { common } => commands::warm_index::run(common),
        Commands::Stats { mount } => commands::stats::run(mount),
        Commands::ValidateFlags { common } => commands::validate::run(common),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliFailure { code, error }) => {
            eprintln!("{error:#}");
            ExitCode::from(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn subcommands_parse() {
        let cli = Cli::try_parse_from([
            "metricfs",
            "render",
            "--source-dir",
            "/data",
            "--file",
            "/data/orders.jsonl",
            "--allow-no-authz",
        ])
        .expect("parse render");
        assert!(matches!(cli.command, Commands::Render { .. }));

        let cli = Cli::try_parse_from([
            "metricfs",
            "warm-index",
            "--source-dir",
            "/data",
            "--missing-mapper",
            "passthrough",
            "--allow-no-authz",
        ])
        .expect("parse warm-index");
        match cli.command {
            Commands::WarmIndex { common } => {
                assert_eq!(common.missing_mapper, "passthrough");
                assert!(common.read_only);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::try_parse_from(["metricfs", "stats", "--mount", "/mnt/metrics"])
            .expect("parse stats");
        assert!(matches!(cli.command, Commands::Stats { .. }));
    }

    #[test]
    fn boolean_flags_accept_explicit_values() {
        let cli = Cli::try_parse_from([
            "metricfs",
            "validate-flags",
            "--source-dir",
            "/data",
            "--mount-dir",
            "/mnt",
            "--read-only",
            "false",
            "--mapper-inherit-parent",
            "false",
        ])
        .expect("parse");
        match cli.command {
            Commands::ValidateFlags { common } => {
                assert!(!common.read_only);
                assert!(!common.mapper_inherit_parent);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
