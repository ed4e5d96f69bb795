//! Command-line front end for arcpeek.
//!
//! Lists, browses and extracts ZIP, TAR and TAR.GZ archives from the local
//! filesystem or from HTTP URLs. Listings are printed while discovery is
//! still running.

use anyhow::{Result, bail};
use clap::Parser;
use std::path::{Component, Path, PathBuf};

use arcpeek::{
    ArchiveEntry, ArchiveError, ArchiveSource, Cli, DiscoverySession, clamp_prefix, list_contents,
};

/// Application entry point.
///
/// Parses arguments, sets up logging and runs one discovery session. Ctrl-C
/// cancels the session; a cancelled run exits quietly.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let mut session = DiscoverySession::open(ArchiveSource::from_location(&cli.file), cli.engine_config())?;

    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    match process_archive(&mut session, &cli).await {
        Err(e) if is_cancelled(&e) => return Ok(()),
        res => res?,
    }

    // Display network transfer statistics for HTTP sources
    if let Some(stats) = session.transfer_stats() {
        if !cli.is_quiet() {
            eprintln!(
                "\nTotal bytes transferred: {} in {} requests",
                format_size(stats.bytes()),
                stats.requests()
            );
        }
    }

    Ok(())
}

/// Install the tracing subscriber.
///
/// Logs go to stderr so they never mix with piped entry data. `RUST_LOG`
/// wins over `--log`; without either, `-qq` lowers the level to errors.
///
/// # Arguments
///
/// * `cli` - Parsed command-line arguments
fn init_logging(cli: &Cli) {
    let fallback = match (&cli.log, cli.is_very_quiet()) {
        (Some(filter), _) => filter.clone(),
        (None, true) => "error".to_string(),
        (None, false) => "warn".to_string(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn is_cancelled(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ArchiveError>()
        .is_some_and(ArchiveError::is_cancelled)
}

/// Process an archive based on CLI options.
///
/// This function handles both listing and extraction modes:
/// - Tree mode (`-t`): Display the whole directory tree
/// - Directory mode (`--prefix`): Display the children of one directory
/// - List mode (`-l` or `-v`): Display entries as they are discovered
/// - Extract mode: Extract files matching the specified filters
///
/// # Arguments
///
/// * `session` - A discovery session for the archive
/// * `cli` - Parsed command-line arguments
///
/// # Returns
///
/// Returns `Ok(())` on success, or an error if discovery or extraction fails.
async fn process_archive(session: &mut DiscoverySession, cli: &Cli) -> Result<()> {
    if cli.is_listing() {
        return list_archive(session, cli).await;
    }

    // Extract mode: discover every entry first
    session.discover_all().await?;

    // Directories are created on demand while extracting
    let files_to_extract: Vec<ArchiveEntry> = session
        .entries()
        .iter()
        .filter(|e| !e.directory && selected(e, cli))
        .cloned()
        .collect();

    if files_to_extract.is_empty() && !cli.files.is_empty() && !cli.is_very_quiet() {
        eprintln!("No matching files in {}", cli.file);
    }

    // In pipe mode, print a separator before each file when there are several
    let multiple_files = cli.pipe && files_to_extract.len() > 1;
    for entry in &files_to_extract {
        extract_file(session, entry, cli, multiple_files).await?;
    }

    Ok(())
}

/// Dispatch to tree, directory listing or progressive listing.
async fn list_archive(session: &mut DiscoverySession, cli: &Cli) -> Result<()> {
    if cli.tree {
        session.discover_all().await?;
        print_tree(session);
        return Ok(());
    }

    if let Some(prefix) = &cli.prefix {
        let Some(prefix) = clamp_prefix(prefix) else {
            bail!("{prefix} is outside the archive root");
        };
        session.discover_all().await?;
        let listing = list_contents(session.entries().as_slice(), &prefix);
        for dir in &listing.directories {
            println!("{dir}/");
        }
        for entry in &listing.files {
            print_entry(entry, cli.verbose);
        }
        return Ok(());
    }

    list_files(session, cli.verbose).await
}

/// Decide whether an entry takes part in extraction.
///
/// Positional names select (exact path, base name, or glob); `-x` rejects.
///
/// # Returns
///
/// Returns `true` if the entry should be extracted.
fn selected(entry: &ArchiveEntry, cli: &Cli) -> bool {
    if !cli.files.is_empty() {
        let matches = cli.files.iter().any(|f| {
            if has_glob_chars(f) {
                glob_match(f, &entry.filename)
            } else {
                entry.filename == *f || entry.name() == *f
            }
        });
        if !matches {
            return false;
        }
    }

    !cli.exclude
        .iter()
        .any(|x| entry.filename.contains(x.as_str()) || glob_match(x, &entry.filename))
}

/// List entries batch by batch as discovery finds them.
///
/// In verbose mode, displays a table with size, compression ratio and
/// modification time. The totals only count files; TAR entries have no
/// separate compressed size and show `-` in the ratio column.
///
/// # Arguments
///
/// * `session` - The discovery session to drive
/// * `verbose` - Whether to show the detailed table
async fn list_files(session: &mut DiscoverySession, verbose: bool) -> Result<()> {
    if verbose {
        println!(
            "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  Name",
            "Length", "Size", "Cmpr", "Date", "Time"
        );
        println!("{}", "-".repeat(70));
    }

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    while let Some(batch) = session.next_batch().await? {
        for entry in &batch {
            print_entry(entry, verbose);
            if !entry.directory {
                total_uncompressed += entry.uncompressed_size;
                total_compressed += entry.compressed_size;
                file_count += 1;
            }
        }
    }

    if verbose {
        println!("{}", "-".repeat(70));
        println!(
            "{:>10}  {:>10}  {}  {:>17}  {} files",
            total_uncompressed,
            total_compressed,
            ratio(total_compressed, total_uncompressed),
            "",
            file_count
        );
    }

    Ok(())
}

/// Print one listing line; directories get a trailing `/`.
fn print_entry(entry: &ArchiveEntry, verbose: bool) {
    let name = if entry.directory {
        format!("{}/", entry.filename)
    } else {
        entry.filename.clone()
    };

    if !verbose {
        println!("{name}");
        return;
    }

    let (date, time) = match entry.last_modified {
        Some(ts) => (ts.format("%Y-%m-%d").to_string(), ts.format("%H:%M").to_string()),
        None => ("-".to_string(), "-".to_string()),
    };
    println!(
        "{:>10}  {:>10}  {}  {:>10}  {:>5}  {}",
        entry.uncompressed_size,
        entry.compressed_size,
        ratio(entry.compressed_size, entry.uncompressed_size),
        date,
        time,
        name
    );
}

/// Percentage saved by compression.
fn ratio(compressed: u64, uncompressed: u64) -> String {
    if compressed == 0 && uncompressed > 0 {
        "    -".to_string()
    } else if uncompressed > 0 && compressed <= uncompressed {
        format!("{:>4}%", 100 - (compressed * 100 / uncompressed))
    } else {
        "  0%".to_string()
    }
}

/// Print the directory tree, two spaces per level, with sizes.
fn print_tree(session: &DiscoverySession) {
    let tree = session.tree();
    for (depth, node) in tree.walk().into_iter().skip(1) {
        let indent = "  ".repeat(depth - 1);
        if node.is_dir {
            println!("{indent}{}/  ({})", node.name, format_size(node.size));
        } else {
            println!("{indent}{}  ({})", node.name, format_size(node.size));
        }
    }
}

/// Extract one entry to disk or, with `-p`, to stdout.
///
/// `-d` picks the output directory, `-j` drops archive directories and
/// `-n`/`-o` decide what happens to existing files.
///
/// # Arguments
///
/// * `session` - The session the entry was discovered by
/// * `entry` - The entry to extract
/// * `cli` - Parsed command-line arguments
/// * `show_filename` - Whether to print a filename header (for multi-file pipe mode)
async fn extract_file(
    session: &DiscoverySession,
    entry: &ArchiveEntry,
    cli: &Cli,
    show_filename: bool,
) -> Result<()> {
    if cli.pipe {
        let mut stdout = tokio::io::stdout();
        if show_filename {
            use tokio::io::AsyncWriteExt;
            stdout
                .write_all(format!("--- {} ---\n", entry.filename).as_bytes())
                .await?;
        }
        session.extract_to_writer(entry, &mut stdout).await?;
        return Ok(());
    }

    let output_path = match output_path(entry, cli) {
        Ok(path) => path,
        Err(e) => {
            if !cli.is_very_quiet() {
                eprintln!("  skipped: {}: {e}", entry.filename);
            }
            return Ok(());
        }
    };

    // Handle existing files according to the overwrite policy
    if output_path.exists() {
        if cli.never_overwrite {
            if !cli.is_quiet() {
                eprintln!("Skipping: {} (file exists)", entry.filename);
            }
            return Ok(());
        }

        if !cli.overwrite {
            if !cli.is_quiet() {
                eprintln!("Skipping: {} (use -o to overwrite)", entry.filename);
            }
            return Ok(());
        }
    }

    if !cli.is_quiet() {
        println!("  extracting: {}", entry.filename);
    }

    match session.extract_to_file(entry, &output_path).await {
        // One bad entry does not stop the rest.
        Err(e @ (ArchiveError::Unsupported(_) | ArchiveError::MalformedArchive(_))) => {
            if !cli.is_very_quiet() {
                eprintln!("  skipped: {}: {e}", entry.filename);
            }
            Ok(())
        }
        res => Ok(res?),
    }
}

/// Determine where an entry is written.
///
/// # Returns
///
/// The output path under `-d` (or the current directory), or an error if
/// the entry name would leave it.
fn output_path(entry: &ArchiveEntry, cli: &Cli) -> Result<PathBuf> {
    let relative = if cli.junk_paths {
        entry.name()
    } else {
        entry.filename.as_str()
    };
    join_contained(cli.extract_dir.as_deref(), relative)
}

/// Join `relative` onto `base`, refusing anything but plain name components.
fn join_contained(base: Option<&str>, relative: &str) -> Result<PathBuf> {
    let relative = Path::new(relative);
    if relative.as_os_str().is_empty()
        || !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
    {
        bail!("refusing to write {} outside the output directory", relative.display());
    }

    Ok(match base {
        Some(dir) => Path::new(dir).join(relative),
        None => relative.to_path_buf(),
    })
}

/// Whether a pattern contains `*` or `?`.
fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Minimal glob matching: `*` matches any run of characters (including
/// `/`), `?` matches exactly one.
///
/// ```ignore
/// assert!(glob_match("*.txt", "docs/readme.txt"));
/// assert!(glob_match("file?.dat", "file1.dat"));
/// assert!(!glob_match("*.txt", "readme.md"));
/// ```
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern_chars: Vec<char> = pattern.chars().collect();
    let text_chars: Vec<char> = text.chars().collect();

    fn do_match(pattern: &[char], text: &[char]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                do_match(&pattern[1..], text) || (!text.is_empty() && do_match(pattern, &text[1..]))
            }
            (Some('?'), Some(_)) => do_match(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if *p == *t => do_match(&pattern[1..], &text[1..]),
            _ => false,
        }
    }

    do_match(&pattern_chars, &text_chars)
}

/// Human-readable byte size.
///
/// ```ignore
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
