use std::time::Duration;

use clap::Parser;

use crate::config::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "arcpeek")]
#[command(version)]
#[command(about = "Browse and extract ZIP, TAR and TAR.GZ archives, local or over HTTP", long_about = None)]
#[command(after_help = "Examples:\n  \
  arcpeek -l https://example.com/archive.zip       list a remote ZIP\n  \
  arcpeek -t https://example.com/src.tar.gz        show the tree of a remote tarball\n  \
  arcpeek -l --prefix docs data.tar                list one directory\n  \
  arcpeek data1.zip -x joe                         extract all files except joe\n  \
  arcpeek -p foo.tar README | more                 send README via pipe into more")]
pub struct Cli {
    /// Archive path or HTTP URL (.zip, .tar, .tar.gz, .tgz)
    #[arg(value_name = "FILE")]
    pub file: String,

    /// Files to extract (default: all)
    #[arg(value_name = "FILES")]
    pub files: Vec<String>,

    /// List files (short format)
    #[arg(short = 'l')]
    pub list: bool,

    /// List verbosely
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Print the directory tree
    #[arg(short = 't')]
    pub tree: bool,

    /// Only list the direct children of this directory
    #[arg(long, value_name = "DIR")]
    pub prefix: Option<String>,

    /// Extract files to pipe, no messages
    #[arg(short = 'p')]
    pub pipe: bool,

    /// Extract files into exdir
    #[arg(short = 'd', value_name = "DIR")]
    pub extract_dir: Option<String>,

    /// Exclude files that follow
    #[arg(short = 'x', value_name = "FILE", num_args = 1..)]
    pub exclude: Vec<String>,

    /// Never overwrite existing files
    #[arg(short = 'n')]
    pub never_overwrite: bool,

    /// Overwrite files WITHOUT prompting
    #[arg(short = 'o')]
    pub overwrite: bool,

    /// Junk paths (do not make directories)
    #[arg(short = 'j')]
    pub junk_paths: bool,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// Bytes read from the end of a ZIP to find its directory
    #[arg(long, value_name = "BYTES", env = "ARCPEEK_TAIL_WINDOW", default_value_t = 16 * 1024)]
    pub tail_window: u64,

    /// HTTP request timeout in seconds
    #[arg(long, value_name = "SECS", env = "ARCPEEK_TIMEOUT", default_value_t = 30)]
    pub timeout: u64,

    /// Retries for connection errors
    #[arg(long, value_name = "N", env = "ARCPEEK_RETRIES", default_value_t = 10)]
    pub retries: u32,

    /// Download .tar.gz fully before decompressing
    #[arg(long, env = "ARCPEEK_NO_STREAM_GZIP")]
    pub no_stream_gzip: bool,

    /// Do not retry a failed ranged listing as a full download
    #[arg(long, env = "ARCPEEK_NO_FALLBACK")]
    pub no_fallback: bool,

    /// Log filter when RUST_LOG is unset (e.g. "debug", "arcpeek=trace")
    #[arg(long, value_name = "FILTER", env = "ARCPEEK_LOG")]
    pub log: Option<String>,
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet > 0 || self.pipe
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }

    /// Any of `-l`, `-v`, `-t` or `--prefix`.
    pub fn is_listing(&self) -> bool {
        self.list || self.verbose || self.tree || self.prefix.is_some()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            zip_tail_window: self.tail_window,
            request_timeout: Duration::from_secs(self.timeout),
            max_retries: self.retries,
            stream_gzip: !self.no_stream_gzip,
            fallback_on_transfer_error: !self.no_fallback,
            ..EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_into_config() {
        let cli = Cli::parse_from([
            "arcpeek",
            "-l",
            "--tail-window",
            "1024",
            "--no-stream-gzip",
            "https://h/a.tgz",
        ]);
        assert!(cli.is_listing());

        let config = cli.engine_config();
        assert_eq!(config.zip_tail_window, 1024);
        assert!(!config.stream_gzip);
        assert!(config.fallback_on_transfer_error);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn pipe_implies_quiet() {
        let cli = Cli::parse_from(["arcpeek", "-p", "a.tar", "x"]);
        assert!(cli.is_quiet());
        assert!(!cli.is_very_quiet());
        assert!(!cli.is_listing());
        assert_eq!(cli.files, ["x"]);
    }
}
