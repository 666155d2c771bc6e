//! FileVault CLI - Passphrase-based file encryption
//!
//! Command-line interface for sealing files into authenticated containers
//! (XSalsa20 + HMAC-SHA256) with scrypt key derivation.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error as _;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use filevault::config::{VaultConfig, parse_size};
use filevault::container;
use filevault::passphrase::{PassphraseReader, ReaderPassphraseReader, TerminalPassphraseReader};
use filevault::{Progress, Request, Result, Vault, VaultError};

const LOG_ENV: &str = "FILEVAULT_LOG";

#[derive(Parser)]
#[command(name = "filevault")]
#[command(version)]
#[command(about = "Passphrase-based file encryption.", long_about = None)]
struct Cli {
    /// Read passphrase from stdin instead of from terminal
    #[arg(long, global = true)]
    passphrase_stdin: bool,

    /// Size of the buffer used to stream file contents (e.g. 64K, 1M)
    #[arg(
        long,
        global = true,
        env = "FILEVAULT_CHUNK_SIZE",
        value_name = "SIZE",
        value_parser = parse_size,
        default_value_t = VaultConfig::DEFAULT_CHUNK_SIZE
    )]
    chunk_size: usize,

    /// Number of progress steps reported per processing phase
    #[arg(
        long,
        global = true,
        env = "FILEVAULT_PROGRESS_STEPS",
        default_value_t = VaultConfig::DEFAULT_PROGRESS_STEPS
    )]
    progress_steps: u32,

    /// Format of diagnostic log lines written to stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Do not show a progress bar or status output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a file
    #[command(alias = "e")]
    Encrypt {
        /// Path to the file whose contents is to be encrypted
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Path to the container file to write
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Decrypt a file
    #[command(alias = "d")]
    Decrypt {
        /// Path to the container file to decrypt
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Path to the file to write the decrypted contents to
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Update an encrypted file with new content, while validating
    /// that the passphrase is not accidentally changed.
    #[command(alias = "u")]
    Update {
        /// Path to the file whose contents is to be encrypted
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Path to the existing container to replace
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Check that a container opens with the passphrase, without writing
    /// any plaintext
    #[command(alias = "v")]
    Verify {
        /// Path to the container file to check
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
    },

    /// Print the public header fields of a container
    Inspect {
        /// Path to the container file to inspect
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", render_chain(&e));
        process::exit(e.kind.exit_code());
    }
}

fn run(cli: &Cli) -> Result<()> {
    let request = match &cli.command {
        Commands::Encrypt { input, output } => Request::encrypt(input, output),
        Commands::Decrypt { input, output } => Request::decrypt(input, output),
        Commands::Update { input, output } => Request::update(input, output),
        Commands::Verify { input } => Request::verify(input),
        Commands::Inspect { input } => return inspect(input),
    };

    let config = VaultConfig::default()
        .with_chunk_size(cli.chunk_size)
        .with_progress_steps(cli.progress_steps);
    let vault = Vault::new(config)?;
    tracing::debug!(
        chunk_size = vault.config().chunk_size,
        progress_steps = vault.config().progress_steps,
        "vault configured"
    );

    let mut reader = get_passphrase_reader(cli.passphrase_stdin);
    let passphrase = reader.read_passphrase()?;

    let bar = progress_bar(cli.quiet, request.name());
    let sink = bar.clone();
    let handle = vault.spawn(
        request.clone(),
        passphrase,
        move |p: Progress| {
            sink.set_length(p.total);
            sink.set_position(p.processed);
        },
        |_: &Result<filevault::Report>| {},
    )?;
    let result = handle.join();
    bar.finish_and_clear();
    let report = result?;

    if !cli.quiet {
        if let Request::Verify { source } = &request {
            println!(
                "{}: OK ({} bytes authenticated)",
                source.display(),
                report.bytes_processed
            );
        }
    }
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let opened = container::open(path)?;
    let header = &opened.header;
    println!("format version: {}", header.version);
    println!("salt: {}", STANDARD.encode(header.salt));
    println!("nonce: {}", STANDARD.encode(header.nonce));
    println!("original size: {}", header.original_size);
    if let Some(len) = header.container_len() {
        println!("container size: {}", len);
    }
    Ok(())
}

fn get_passphrase_reader(use_stdin: bool) -> Box<dyn PassphraseReader> {
    if use_stdin {
        Box::new(ReaderPassphraseReader::new(Box::new(io::stdin())))
    } else {
        Box::new(TerminalPassphraseReader)
    }
}

fn progress_bar(quiet: bool, op: &'static str) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
    let style = ProgressStyle::with_template(
        "{msg:>8} [{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} ({eta})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ");
    bar.set_style(style);
    bar.set_message(op);
    bar
}

/// Log lines go to stderr so they never mix with command output.
fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init(),
        LogFormat::Text => registry.with(fmt::layer().with_writer(io::stderr)).init(),
    }
}

/// Render the error and its causes on one line, outermost first.
fn render_chain(err: &VaultError) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
