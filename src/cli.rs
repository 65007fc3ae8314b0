//! Command-line interface built on clap.
//!
//! [`Cli`] has two subcommands, `run` and `inspect`, plus the global flags
//! `--config` and `--verbose`. Flags given here override `fanout.toml`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::FanoutConfig;
use crate::normalize::InputFormat;

/// fanout: run a batch of queries against an endpoint, concurrently and resumably.
#[derive(Debug, Parser)]
#[command(name = "fanout", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./fanout.toml if present).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Input format accepted on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FormatArg {
    /// One query per line.
    Lines,
    /// JSON array of records.
    Json,
    /// One JSON record per line.
    Jsonl,
    Csv,
    Tsv,
}

impl From<FormatArg> for InputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Lines => InputFormat::Lines,
            FormatArg::Json => InputFormat::Records,
            FormatArg::Jsonl => InputFormat::JsonLines,
            FormatArg::Csv => InputFormat::Csv,
            FormatArg::Tsv => InputFormat::Tsv,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute every item of an input file.
    Run(RunArgs),

    /// Summarize a checkpoint file.
    Inspect {
        /// Path to a checkpoint written by `fanout run`.
        checkpoint: PathBuf,
    },
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Input file; the format is guessed from its extension unless --format is given.
    pub input: PathBuf,

    #[arg(long, value_enum)]
    pub format: Option<FormatArg>,

    /// Query endpoint URL.
    #[arg(long, short)]
    pub endpoint: Option<String>,

    /// Output directory.
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Checkpoint file (defaults to <output>/checkpoint.json).
    #[arg(long, conflicts_with = "no_checkpoint")]
    pub checkpoint: Option<PathBuf>,

    /// Neither read nor write a checkpoint.
    #[arg(long, default_value_t = false)]
    pub no_checkpoint: bool,

    #[arg(long)]
    pub concurrency: Option<usize>,

    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// One item at a time, in input order.
    #[arg(long, default_value_t = false)]
    pub sequential: bool,

    /// Echo payloads instead of contacting the endpoint.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Keep results even when identical to an earlier one.
    #[arg(long, default_value_t = false)]
    pub no_dedup: bool,

    /// Stop dispatching after the first failed item.
    #[arg(long, default_value_t = false)]
    pub stop_on_error: bool,
}

impl RunArgs {
    /// Overlay command-line flags onto the loaded configuration.
    pub fn apply(&self, config: &mut FanoutConfig) {
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.max_attempts = max_attempts;
        }
        if self.sequential {
            config.sequential = true;
        }
        if self.no_dedup {
            config.deduplicate = false;
        }
        if self.stop_on_error {
            config.continue_on_error = false;
        }
    }

    /// Where the checkpoint lives for this run, if anywhere.
    pub fn checkpoint_path(&self, config: &FanoutConfig) -> Option<PathBuf> {
        if self.no_checkpoint {
            None
        } else {
            Some(
                self.checkpoint
                    .clone()
                    .unwrap_or_else(|| config.checkpoint_path()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn run_args(args: &[&str]) -> RunArgs {
        let mut argv = vec!["fanout", "run"];
        argv.extend_from_slice(args);
        match Cli::parse_from(argv).command {
            Command::Run(args) => args,
            other => panic!("expected Run command, got {other:?}"),
        }
    }

    #[test]
    fn cli_parses_run_subcommand() {
        let args = run_args(&["queries.txt"]);
        assert_eq!(args.input, PathBuf::from("queries.txt"));
        assert!(args.format.is_none());
        assert!(!args.dry_run);
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "fanout",
            "--verbose",
            "inspect",
            "out/checkpoint.json",
            "-c",
            "x.toml",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(matches!(cli.command, Command::Inspect { .. }));
    }

    #[test]
    fn flags_override_config() {
        let args = run_args(&[
            "in.csv",
            "--endpoint",
            "http://localhost:3030/ds/sparql",
            "--concurrency",
            "16",
            "--sequential",
            "--no-dedup",
            "--stop-on-error",
            "--format",
            "tsv",
        ]);
        let mut config = FanoutConfig::default();
        args.apply(&mut config);

        assert_eq!(config.endpoint, "http://localhost:3030/ds/sparql");
        assert_eq!(config.concurrency, 16);
        assert!(config.sequential);
        assert!(!config.deduplicate);
        assert!(!config.continue_on_error);
        assert_eq!(InputFormat::from(args.format.unwrap()), InputFormat::Tsv);
    }

    #[test]
    fn checkpoint_location() {
        let config = FanoutConfig::default();
        assert_eq!(
            run_args(&["in.txt"]).checkpoint_path(&config),
            Some(PathBuf::from("fanout-out/checkpoint.json"))
        );
        assert_eq!(
            run_args(&["in.txt", "--checkpoint", "cp.json"]).checkpoint_path(&config),
            Some(PathBuf::from("cp.json"))
        );
        assert_eq!(run_args(&["in.txt", "--no-checkpoint"]).checkpoint_path(&config), None);
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
