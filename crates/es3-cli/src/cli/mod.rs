//! CLI for the es3 parallel S3 client.
//!
//! Exit codes: 0 success, 1 help only, 2 argument error, 3 missing local
//! path, 4 work remains after the retry rounds, 5 stdout I/O failure,
//! 6 transfer failed, 8 unexpected error.

mod commands;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::PathBuf;

use es3_core::agenda::Agenda;
use es3_core::config::{self, Es3Config};
use es3_core::remote::Context;

/// Extreme S3 - fast parallel S3 client.
#[derive(Debug, Parser)]
#[command(name = "es3")]
#[command(about = "Extreme S3 - fast parallel client for S3-compatible stores", long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(flatten)]
    pub globals: GlobalOpts,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// S3 API key; falls back to AWS_ACCESS_KEY_ID.
    #[arg(long, short = 'a', global = true)]
    pub access_key: Option<String>,

    /// S3 secret key; falls back to AWS_SECRET_ACCESS_KEY.
    #[arg(long, short = 's', global = true)]
    pub secret_key: Option<String>,

    /// Use SSL for all communications.
    #[arg(long, short = 'l', global = true)]
    pub use_ssl: bool,

    /// Use GZIP compression for uploads.
    #[arg(long, short = 'm', global = true, value_name = "BOOL")]
    pub compression: Option<bool>,

    /// Host(:port) of an S3-compatible endpoint (empty = AWS).
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// Path to the scratch directory.
    #[arg(long, short = 'i', global = true, value_name = "DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Number of download/upload threads [0 - autodetect].
    #[arg(long, short = 'n', global = true, value_name = "N")]
    pub thread_num: Option<usize>,

    /// Number of filesystem reader/writer threads [0 - autodetect].
    #[arg(long, global = true, value_name = "N")]
    pub reader_threads: Option<usize>,

    /// Number of compressor threads [0 - autodetect].
    #[arg(long, short = 'o', global = true, value_name = "N")]
    pub compressor_threads: Option<usize>,

    /// Segment size in bytes [0 - autodetect, 6291456 - minimum].
    #[arg(long, short = 'g', global = true, value_name = "BYTES")]
    pub segment_size: Option<u64>,

    /// Number of segments in flight [0 - autodetect, 200 - maximum].
    #[arg(long, short = 'f', global = true, value_name = "N")]
    pub segments_in_flight: Option<usize>,

    /// Verbosity level [0 - the lowest, 9 - the highest].
    #[arg(long, short = 'v', global = true, default_value = "1")]
    pub verbosity: u32,

    /// Quiet mode (no progress indicator).
    #[arg(long, short = 'q', global = true)]
    pub no_progress: bool,

    /// Quiet mode (no final stats).
    #[arg(long, short = 't', global = true)]
    pub no_stats: bool,

    /// Path to a file that contains configuration settings.
    #[arg(long, short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Synchronize directory trees with a bucket (either direction).
    Sync {
        /// Delete missing files from the sync destination.
        #[arg(long = "delete-missing", short = 'D')]
        delete_missing: bool,
        /// Exclude paths matching the pattern; wins over include rules.
        #[arg(long = "exclude-path", short = 'E', value_name = "PATTERN")]
        excluded: Vec<String>,
        /// Include only paths matching the pattern.
        #[arg(long = "include-path", short = 'I', value_name = "PATTERN")]
        included: Vec<String>,
        /// One or more sources followed by the destination.
        #[arg(required = true, num_args = 2..)]
        paths: Vec<String>,
    },

    /// Copy a single file to or from a bucket.
    Cp {
        source: String,
        destination: String,
    },

    /// Shallow listing of a remote path.
    Ls {
        path: String,
    },

    /// Recursive listing of remote paths.
    Lsr {
        #[arg(long = "exclude-path", short = 'E', value_name = "PATTERN")]
        excluded: Vec<String>,
        #[arg(long = "include-path", short = 'I', value_name = "PATTERN")]
        included: Vec<String>,
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Delete remote paths.
    Rm {
        /// Delete recursively.
        #[arg(long, short = 'r')]
        recursive: bool,
        #[arg(long = "exclude-path", short = 'E', value_name = "PATTERN")]
        excluded: Vec<String>,
        #[arg(long = "include-path", short = 'I', value_name = "PATTERN")]
        included: Vec<String>,
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Delete the remote paths read from stdin, one per line.
    #[command(name = "mass_rm")]
    MassRm,

    /// Recursive size and file count of a remote path.
    Du {
        path: String,
    },

    /// Check that a local or remote path exists.
    Test {
        path: String,
    },

    /// Create an empty object (or local file) when absent.
    Touch {
        path: String,
    },

    /// Stream remote objects to stdout.
    Cat {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Recursively apply the public-read ACL to remote paths.
    Publish {
        #[arg(long = "exclude-path", short = 'E', value_name = "PATTERN")]
        excluded: Vec<String>,
        #[arg(long = "include-path", short = 'I', value_name = "PATTERN")]
        included: Vec<String>,
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Generate shell completions.
    #[command(hide = true)]
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Parses the command line, resolves configuration and dispatches. Returns
/// the process exit code.
pub fn run_from_args() -> Result<i32> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp
                | ErrorKind::DisplayVersion
                | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => 1,
                _ => 2,
            };
            let _ = err.print();
            return Ok(code);
        }
    };

    es3_core::logging::init(cli.globals.verbosity);

    if let CliCommand::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "es3", &mut std::io::stdout());
        return Ok(0);
    }

    let cfg = resolve_config(&cli.globals)?;
    tracing::debug!("resolved config: scratch={}", cfg.scratch_dir.display());
    let ctx = Context::new(cfg.clone());

    // cat owns stdout; never draw over it.
    let streaming = matches!(cli.command, CliCommand::Cat { .. });
    let quiet = cli.globals.no_progress || streaming;
    let final_quiet = cli.globals.no_stats || streaming;
    let agenda = Agenda::from_config(&cfg, quiet, final_quiet);

    match cli.command {
        CliCommand::Sync { delete_missing, excluded, included, paths } => {
            commands::sync::run(&ctx, &agenda, paths, delete_missing, &included, &excluded)
        }
        CliCommand::Cp { source, destination } => {
            commands::cp::run(&ctx, &agenda, &source, &destination)
        }
        CliCommand::Ls { path } => commands::ls::run(&ctx, &agenda, &path),
        CliCommand::Lsr { excluded, included, paths } => {
            commands::lsr::run(&ctx, &agenda, paths, &included, &excluded)
        }
        CliCommand::Rm { recursive, excluded, included, paths } => {
            commands::rm::run(&ctx, &agenda, paths, recursive, &included, &excluded)
        }
        CliCommand::MassRm => commands::mass_rm::run(&ctx),
        CliCommand::Du { path } => commands::du::run(&ctx, &agenda, &path),
        CliCommand::Test { path } => commands::test::run(&ctx, &path),
        CliCommand::Touch { path } => commands::touch::run(&ctx, &path),
        CliCommand::Cat { paths } => commands::cat::run(&ctx, &agenda, paths),
        CliCommand::Publish { excluded, included, paths } => {
            commands::publish::run(&ctx, &agenda, paths, &included, &excluded)
        }
        CliCommand::Completions { .. } => unreachable!("handled above"),
    }
}

/// Config file plus environment plus CLI overrides, normalized.
fn resolve_config(globals: &GlobalOpts) -> Result<Es3Config> {
    let mut cfg = config::load(globals.config.as_deref())?;
    if let Some(key) = &globals.access_key {
        cfg.access_key = key.clone();
    }
    if let Some(key) = &globals.secret_key {
        cfg.secret_key = key.clone();
    }
    if globals.use_ssl {
        cfg.use_ssl = true;
    }
    if let Some(compression) = globals.compression {
        cfg.compression = compression;
    }
    if let Some(endpoint) = &globals.endpoint {
        cfg.endpoint = endpoint.clone();
    }
    if let Some(dir) = &globals.scratch_dir {
        cfg.scratch_dir = dir.clone();
    }
    if let Some(n) = globals.thread_num {
        cfg.thread_num = n;
    }
    if let Some(n) = globals.reader_threads {
        cfg.reader_threads = n;
    }
    if let Some(n) = globals.compressor_threads {
        cfg.compressor_threads = n;
    }
    if let Some(n) = globals.segment_size {
        cfg.segment_size = n;
    }
    if let Some(n) = globals.segments_in_flight {
        cfg.segments_in_flight = n;
    }
    cfg.apply_env_credentials();
    cfg.normalize();
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_sync_with_patterns() {
        let cli = Cli::try_parse_from([
            "es3", "sync", "-D", "-I", "*.log", "-E", "debug-*.log", "src/", "s3://b/dst/",
        ])
        .unwrap();
        match cli.command {
            CliCommand::Sync { delete_missing, excluded, included, paths } => {
                assert!(delete_missing);
                assert_eq!(included, vec!["*.log"]);
                assert_eq!(excluded, vec!["debug-*.log"]);
                assert_eq!(paths, vec!["src/", "s3://b/dst/"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn cli_requires_two_sync_paths() {
        assert!(Cli::try_parse_from(["es3", "sync", "only-one"]).is_err());
    }

    #[test]
    fn cli_parses_global_tuning_flags() {
        let cli = Cli::try_parse_from([
            "es3",
            "-g",
            "8388608",
            "-f",
            "10",
            "-q",
            "ls",
            "s3://b/",
        ])
        .unwrap();
        assert_eq!(cli.globals.segment_size, Some(8_388_608));
        assert_eq!(cli.globals.segments_in_flight, Some(10));
        assert!(cli.globals.no_progress);
    }

    #[test]
    fn mass_rm_keeps_underscore_name() {
        let cli = Cli::try_parse_from(["es3", "mass_rm"]).unwrap();
        assert!(matches!(cli.command, CliCommand::MassRm));
    }
}
