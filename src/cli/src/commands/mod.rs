//! CLI command definitions and dispatch.

mod history;
mod run;
mod version;

use a3s_mirror_core::config::{LogLevel, MirrorConfig};
use clap::{Parser, Subcommand};

/// A3S Mirror: container image mirroring for disconnected environments.
#[derive(Parser)]
#[command(name = "a3s-mirror", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Mirror a batch of images, then archive them when mirroring to disk
    Run(run::RunArgs),
    /// Show the digests already shipped in earlier archives
    History(history::HistoryArgs),
    /// Show version information
    Version(version::VersionArgs),
}

impl Cli {
    /// Log level used when `RUST_LOG` is not set.
    ///
    /// `run` takes it from its configuration file; a config that fails to
    /// load falls back to the default and the error surfaces in `run` itself.
    pub fn log_level(&self) -> LogLevel {
        match &self.command {
            Command::Run(args) => MirrorConfig::load(&args.config)
                .map(|config| config.log_level)
                .unwrap_or(LogLevel::Warn),
            _ => LogLevel::Warn,
        }
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Run(args) => run::execute(args).await,
        Command::History(args) => history::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "a3s-mirror",
            "run",
            "--config",
            "mirror.yaml",
            "--batch",
            "batch.json",
            "--parallel",
            "4",
            "--permissive",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.config.to_str(), Some("mirror.yaml"));
                assert_eq!(args.batch.to_str(), Some("batch.json"));
                assert_eq!(args.parallel, Some(4));
                assert!(args.permissive);
                assert!(!args.strict);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_strict_conflicts_with_permissive() {
        let result = Cli::try_parse_from([
            "a3s-mirror",
            "run",
            "--config",
            "c.yaml",
            "--batch",
            "b.yaml",
            "--strict",
            "--permissive",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_run_requires_batch() {
        assert!(Cli::try_parse_from(["a3s-mirror", "run", "--config", "c.yaml"]).is_err());
    }

    #[test]
    fn test_parse_history() {
        let cli =
            Cli::try_parse_from(["a3s-mirror", "history", "--working-dir", "/tmp/wd", "-q"]).unwrap();
        match cli.command {
            Command::History(args) => {
                assert_eq!(args.working_dir.to_str(), Some("/tmp/wd"));
                assert!(args.quiet);
            }
            _ => panic!("expected history"),
        }
    }

    #[test]
    fn test_log_level_defaults_without_config() {
        let cli = Cli::try_parse_from(["a3s-mirror", "version"]).unwrap();
        assert!(matches!(cli.log_level(), LogLevel::Warn));

        let cli = Cli::try_parse_from([
            "a3s-mirror",
            "run",
            "--config",
            "/nonexistent/mirror.yaml",
            "--batch",
            "b.yaml",
        ])
        .unwrap();
        assert!(matches!(cli.log_level(), LogLevel::Warn));
    }
}
