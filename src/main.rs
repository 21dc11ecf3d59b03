mod config;
mod embed;
mod materialize;
mod resize;
mod scan;

use clap::{Parser, ValueEnum};
use config::{CliArgs, CliImageArgs, Config};
use embed::embed_images;
use log::{LevelFilter, debug, error, info};
use materialize::{HttpFetcher, Materializer};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum EmbedMode {
    /// Embed both local and remote images (default)
    #[default]
    All,
    /// Only embed local/relative images
    Local,
    /// Only embed remote images
    Remote,
    /// Don't embed any images
    None,
}

impl EmbedMode {
    pub fn allows(self, remote: bool) -> bool {
        match self {
            EmbedMode::All => true,
            EmbedMode::Local => !remote,
            EmbedMode::Remote => remote,
            EmbedMode::None => false,
        }
    }
}

#[derive(Parser)]
#[command(name = "mdembed")]
#[command(about = "Embed markdown and HTML image references as inline base64 data URLs")]
struct Args {
    /// Input file (use - for stdin, default: stdin)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output file (use - for stdout, default: <input>_embedded.md, or stdout when reading stdin)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Root directory for resolving relative image paths (default: input file's directory or cwd)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Image embedding mode [possible values: all, local, remote, none]
    #[arg(short, long, value_enum)]
    embed: Option<EmbedMode>,

    /// Exit with an error if any image could not be embedded
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    strict: Option<bool>,

    /// Longest side, in pixels, for images without a requested size
    #[arg(long = "max-dimension")]
    max_dimension: Option<u32>,

    /// JPEG quality used when re-encoding (1-100)
    #[arg(long)]
    quality: Option<u8>,

    /// Timeout in seconds for fetching remote images
    #[arg(long)]
    timeout: Option<u64>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn init_logger(verbose: u8, quiet: bool) {
    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format_target(false)
        .format_timestamp(None)
        .init();
}

fn is_stdio(path: &Path) -> bool {
    path.as_os_str() == "-"
}

fn read_input(path: &Path) -> io::Result<String> {
    if is_stdio(path) {
        let mut content = String::new();
        io::stdin().read_to_string(&mut content)?;
        Ok(content)
    } else {
        fs::read_to_string(path)
    }
}

fn resolve_base_dir(input: &Path, root: Option<PathBuf>) -> PathBuf {
    if let Some(root) = root {
        root
    } else if is_stdio(input) {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    } else {
        input
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// `notes.md` becomes `notes_embedded.md` in the same directory; stdin goes to stdout
fn default_output_path(input: &Path) -> PathBuf {
    if is_stdio(input) {
        return PathBuf::from("-");
    }
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    input.with_file_name(format!("{}_embedded.md", stem))
}

fn main() -> io::Result<()> {
    let args = Args::parse();
    init_logger(args.verbose, args.quiet);

    let cli_args = CliArgs {
        input: args.input,
        output: args.output,
        root: args.root,
        embed: args.embed,
        strict: args.strict,
        image: CliImageArgs {
            max_dimension: args.max_dimension,
            quality: args.quality,
            timeout: args.timeout,
        },
    };

    let cfg = Config::build(cli_args, args.config);
    debug!("Input: {:?}", cfg.input);
    debug!("Embed mode: {:?}", cfg.embed);
    debug!("Strict mode: {}", cfg.strict);
    debug!("Image settings: {:?}", cfg.image);

    let markdown_text = read_input(&cfg.input)?;
    info!("Read {} bytes of markdown", markdown_text.len());

    let base_dir = resolve_base_dir(&cfg.input, cfg.root.clone());
    debug!("Base directory for images: {:?}", base_dir);

    let materializer = Materializer::new(
        Box::new(HttpFetcher::new(&cfg.image)),
        cfg.image.clone(),
        cfg.embed,
    );
    let report = embed_images(&markdown_text, &base_dir, &materializer);

    let output = cfg
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&cfg.input));
    if is_stdio(&output) {
        debug!("Writing to stdout");
        io::stdout().write_all(report.text.as_bytes())?;
    } else {
        debug!("Writing to {:?}", output);
        fs::write(&output, &report.text)?;
        info!(
            "Embedded {} image(s): {:?} -> {:?}",
            report.embedded, cfg.input, output
        );
    }

    if cfg.strict && !report.failures.is_empty() {
        for failure in &report.failures {
            error!("{} ({})", failure.error, failure.locator);
        }
        return Err(io::Error::other(format!(
            "{} image(s) could not be embedded",
            report.failures.len()
        )));
    }

    Ok(())
}
