//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use ipsw_downloader_core::Config;

/// Mirror the latest firmware images for recent devices.
///
/// Runs once at startup and then daily at the configured time, downloading
/// the newest IPSW of every eligible device that is not already on disk.
#[derive(Parser, Debug)]
#[command(name = "ipsw-downloader")]
#[command(author, version, about)]
pub struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/ipsw-downloader/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory firmware images are stored in
    #[arg(long, value_name = "DIR")]
    pub storage_dir: Option<PathBuf>,

    /// Live progress file, rewritten on every update
    #[arg(long, value_name = "PATH")]
    pub progress_log: Option<PathBuf>,

    /// Append-only detailed log file
    #[arg(long, value_name = "PATH")]
    pub detailed_log: Option<PathBuf>,

    /// Maximum concurrent downloads (1-64)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub concurrency: Option<u8>,

    /// Run a single pass and exit instead of scheduling
    #[arg(long)]
    pub once: bool,

    /// Do not send the end-of-run summary
    #[arg(long)]
    pub no_notify: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only show warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    /// Applies command-line overrides on top of file configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(storage_dir) = &self.storage_dir {
            config.storage_dir.clone_from(storage_dir);
        }
        if let Some(progress_log) = &self.progress_log {
            config.progress_log.clone_from(progress_log);
        }
        if let Some(detailed_log) = &self.detailed_log {
            config.detailed_log.clone_from(detailed_log);
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = usize::from(concurrency);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["ipsw-downloader"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(!args.once);
        assert!(!args.no_notify);
        assert!(args.config.is_none());
        assert!(args.concurrency.is_none());
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["ipsw-downloader", "-v"]).unwrap();
        assert_eq!(args.verbose, 1);

        let args = Args::try_parse_from(["ipsw-downloader", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_quiet_conflicts_with_verbose() {
        let result = Args::try_parse_from(["ipsw-downloader", "-q", "-v"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::ArgumentConflict
        );
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let result = Args::try_parse_from(["ipsw-downloader", "--help"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::DisplayHelp
        );
    }

    #[test]
    fn test_cli_concurrency_range() {
        let args = Args::try_parse_from(["ipsw-downloader", "-c", "8"]).unwrap();
        assert_eq!(args.concurrency, Some(8));

        assert!(Args::try_parse_from(["ipsw-downloader", "-c", "0"]).is_err());
        assert!(Args::try_parse_from(["ipsw-downloader", "--concurrency", "65"]).is_err());
    }

    #[test]
    fn test_cli_overrides_replace_file_values() {
        let args = Args::try_parse_from([
            "ipsw-downloader",
            "--storage-dir",
            "/srv/ipsw",
            "--progress-log",
            "/var/log/ipsw/progress.log",
            "-c",
            "2",
            "--once",
        ])
        .unwrap();
        let mut config = Config::default();
        args.apply_overrides(&mut config);

        assert_eq!(config.storage_dir, PathBuf::from("/srv/ipsw"));
        assert_eq!(config.progress_log, PathBuf::from("/var/log/ipsw/progress.log"));
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.detailed_log, Config::default().detailed_log);
        assert!(args.once);
    }
}
