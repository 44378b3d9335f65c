//! # sealed-post
//!
//! Build-time sealing of password-protected blog posts, plus the matching
//! unlock flow for verifying or recovering published output.
//!
//! ## Architecture
//!
//! ```text
//!                      ┌─────────────┐
//!                      │  CLI (clap) │
//!                      └──────┬──────┘
//!                             │
//!              ┌──────────────┼──────────────┐
//!              ▼              ▼              ▼
//!         ┌─────────┐   ┌──────────┐   ┌──────────┐
//!         │  Batch  │   │ Decoder  │   │ Inspect  │
//!         └────┬────┘   └────┬─────┘   └────┬─────┘
//!              ▼             │              │
//!         ┌─────────┐        │              │
//!         │ Encoder │        │              │
//!         └────┬────┘        │              │
//!     ┌────────┼────────┐    │              │
//!     ▼        ▼        ▼    ▼              ▼
//! ┌────────┐┌────────┐┌──────────────────────────┐
//! │ Images ││Resolve ││   Payload (base64/JSON)   │
//! │(regex) ││(reqwest)│└────────────┬─────────────┘
//! └────────┘└────────┘             ▼
//!                           ┌──────────────┐
//!                           │    Crypto    │
//!                           │ PBKDF2 + GCM │
//!                           └──────────────┘
//! ```

mod batch;
mod config;
mod crypto;
mod decoder;
mod encoder;
mod error;
mod images;
mod payload;
mod post;
mod resolve;

use clap::{Parser, Subcommand};
use colored::Colorize;
use decoder::{HttpTransport, PayloadSource, PayloadTransport, UnlockSession};
use payload::EncryptedPayload;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Environment variable read by `decrypt` when no password flag is given.
const PASSWORD_ENV: &str = "SEALED_POST_PASSWORD";

/// sealed-post: encrypt protected blog posts at build time
#[derive(Parser, Debug)]
#[command(
    name = "sealed-post",
    version,
    about = "Encrypt password-protected blog posts and their images at build time 🔒",
    long_about = "sealed-post replaces the rendered content of password-protected posts \
                  with an AES-256-GCM sealed payload and a small unlock widget. Images are \
                  sealed individually and decrypted lazily once the reader unlocks the post.\n\n\
                  Posts are read as JSON records as produced by the site build."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (overrides default search)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a new configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "sealed-post.toml")]
        output: PathBuf,
    },

    /// Seal every protected post in the given files or directories
    Encrypt {
        /// Post records (`*.json`) or directories containing them
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Write results here instead of rewriting the inputs
        #[arg(short, long)]
        out_dir: Option<PathBuf>,

        /// Site source directory for resolving absolute image paths
        #[arg(short, long)]
        source_dir: Option<PathBuf>,
    },

    /// Unlock a sealed post and write the decrypted HTML
    Decrypt {
        /// Post record, published HTML, raw payload file, or payload URL
        input: String,

        /// Post password (or set SEALED_POST_PASSWORD env var)
        #[arg(short, long)]
        password: Option<String>,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Base URL for site-relative payload paths
        #[arg(short, long)]
        base_url: Option<String>,
    },

    /// Show the structure of a sealed payload without decrypting it
    Inspect {
        /// Post record, published HTML, raw payload file, or payload URL
        input: String,

        /// Base URL for site-relative payload paths
        #[arg(short, long)]
        base_url: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("{} {}", "error:".red(), e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> error::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    match &cli.command {
        Command::Init { output } => cmd_init(output),
        Command::Encrypt {
            paths,
            out_dir,
            source_dir,
        } => runtime.block_on(cmd_encrypt(
            &cli,
            paths,
            out_dir.as_deref(),
            source_dir.as_deref(),
        )),
        Command::Decrypt {
            input,
            password,
            output,
            base_url,
        } => runtime.block_on(cmd_decrypt(
            &cli,
            input,
            password.as_deref(),
            output.as_deref(),
            base_url.as_deref(),
        )),
        Command::Inspect { input, base_url } => {
            runtime.block_on(cmd_inspect(&cli, input, base_url.as_deref()))
        }
    }
}

// ─── Command Implementations ────────────────────────────────────────────────

fn cmd_init(output: &Path) -> error::Result<()> {
    config::init_config(output)?;
    eprintln!("{} Created configuration file: {}", "✓".green(), output.display());
    eprintln!("  Edit the file to point at your site, then run:");
    eprintln!("  {} sealed-post encrypt posts/", "$".bold());
    Ok(())
}

async fn cmd_encrypt(
    cli: &Cli,
    paths: &[PathBuf],
    out_dir: Option<&Path>,
    source_dir: Option<&Path>,
) -> error::Result<()> {
    let cfg = load_config(cli)?;
    let source_dir = source_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cfg.site.source_dir.clone());

    print_header("Encrypt");

    let files = batch::collect_posts(paths);
    if files.is_empty() {
        eprintln!("  No post records found.");
        return Ok(());
    }

    eprintln!("  Posts:     {}", files.len());
    eprintln!("  Source:    {}", source_dir.display());
    eprintln!("  Delivery:  {}", cfg.delivery.mode);
    eprintln!();

    let fetcher = resolve::ImageFetcher::new(cfg.fetch.clone())?;
    let resolver = resolve::Resolver::new(fetcher, source_dir);
    let sealer = encoder::Sealer::new(resolver, cfg.delivery.clone());

    let opts = batch::BatchOptions {
        out_dir: out_dir.map(Path::to_path_buf),
        public_dir: cfg.delivery.public_dir.clone(),
        verbose: cli.verbose,
    };
    let stats = batch::seal_all(&sealer, &files, &opts).await?;
    batch::print_summary(&stats);

    if stats.posts_failed > 0 {
        return Err(anyhow::anyhow!("{} post(s) failed to seal", stats.posts_failed).into());
    }
    Ok(())
}

async fn cmd_decrypt(
    cli: &Cli,
    input: &str,
    password: Option<&str>,
    output: Option<&Path>,
    base_url: Option<&str>,
) -> error::Result<()> {
    let cfg = load_config(cli)?;
    let password = password
        .map(String::from)
        .or_else(|| std::env::var(PASSWORD_ENV).ok())
        .unwrap_or_default();

    let mut session = open_session(input, transport(&cfg, base_url)?, &cfg)?;
    let unlocked = session.unlock(password).await.map(|_| ());
    if let Err(e) = unlocked {
        tracing::debug!(
            slug = session.slug(),
            state = ?session.state(),
            error = ?e,
            "unlock rejected"
        );
        // Same text the widget shows the reader.
        let notice = session.error().map_or_else(|| e.to_string(), String::from);
        return Err(anyhow::anyhow!(notice).into());
    }

    let image_count = session.pending_images();
    tracing::debug!(
        slug = session.slug(),
        body_bytes = session.body().map_or(0, str::len),
        images = image_count,
        "unlocked"
    );
    let html = session
        .reveal_all()
        .ok_or_else(|| anyhow::anyhow!("session did not unlock"))?;
    let unrevealed = images::placeholder_ids(&html).len();
    if unrevealed > 0 {
        eprintln!("  {} {unrevealed} image(s) could not be decrypted", "!".yellow());
    }

    match output {
        Some(path) => {
            std::fs::write(path, &html)?;
            eprintln!(
                "  {} Unlocked '{}' ({image_count} image(s)) → {}",
                "✓".green(),
                session.slug(),
                path.display()
            );
        }
        None => println!("{html}"),
    }
    Ok(())
}

async fn cmd_inspect(cli: &Cli, input: &str, base_url: Option<&str>) -> error::Result<()> {
    let cfg = load_config(cli)?;
    let session = open_session(input, transport(&cfg, base_url)?, &cfg)?;
    let source = session.source().ok_or(error::UnlockError::NoPayload)?;
    let slug = session.slug();

    let text = match source {
        PayloadSource::Inline(text) => text.clone(),
        PayloadSource::Remote(url) => transport(&cfg, base_url)?.fetch(url).await?,
    };
    let payload = EncryptedPayload::parse(&text)?;

    eprintln!("  Post:        {}", slug.bold());
    eprintln!(
        "  Delivery:    {}",
        match source {
            PayloadSource::Inline(_) => "inline".to_string(),
            PayloadSource::Remote(url) => format!("external ({url})"),
        }
    );
    eprintln!("  Iterations:  {}", payload.i);
    eprintln!("  Salt:        {} bytes", payload.salt()?.len());
    eprintln!("  Body:        {} (base64)", batch::format_size(payload.ct.len() as u64));
    eprintln!("  Images:      {}", payload.imgs.len());
    for (id, image) in &payload.imgs {
        eprintln!(
            "    {:8} {:14} {:>10}",
            id,
            image.m,
            batch::format_size(image.ct.len() as u64)
        );
    }
    Ok(())
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn load_config(cli: &Cli) -> error::Result<config::Config> {
    if let Some(path) = &cli.config {
        config::load_config_from(path)
    } else {
        config::load_config()
    }
}

fn transport(cfg: &config::Config, base_url: Option<&str>) -> error::Result<HttpTransport> {
    let transport = HttpTransport::new(Duration::from_secs(cfg.unlock.fetch_timeout_secs))?;
    Ok(match base_url {
        Some(base) => transport.with_base_url(base),
        None => transport,
    })
}

/// Builds an unlock session for a decrypt or inspect input.
///
/// Accepts a payload URL, a file holding the payload itself, or a post record
/// or published HTML page carrying the unlock widget.
fn open_session(
    input: &str,
    transport: HttpTransport,
    cfg: &config::Config,
) -> error::Result<UnlockSession<HttpTransport>> {
    let ttl = Duration::from_secs(cfg.unlock.error_display_secs);

    let lower = input.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        let slug = input
            .rsplit('/')
            .next()
            .unwrap_or(input)
            .trim_end_matches(".json");
        let source = PayloadSource::Remote(input.to_string());
        return Ok(UnlockSession::new(slug, Some(source), transport, ttl));
    }

    let path = Path::new(input);
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;

    let trimmed = text.trim();
    if EncryptedPayload::parse(trimmed).is_ok() {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let source = PayloadSource::Inline(trimmed.to_string());
        return Ok(UnlockSession::new(stem, Some(source), transport, ttl));
    }

    let markup = post::Post::from_json(&text)
        .ok()
        .filter(|p| !p.content.is_empty())
        .map_or(text, |p| p.content);
    let session = UnlockSession::from_markup(&markup, transport, ttl);
    if session.source().is_none() {
        tracing::debug!(input, "no unlock widget or payload found");
    }
    Ok(session)
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "sealed_post=debug"
    } else {
        "sealed_post=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_header(action: &str) {
    eprintln!();
    eprintln!(
        "  {} sealed-post v{} · {action}",
        "⚡".bold(),
        env!("CARGO_PKG_VERSION"),
    );
    eprintln!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::unlock_widget;

    fn session_for(input: &str) -> UnlockSession<HttpTransport> {
        let cfg = config::Config::default();
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        open_session(input, transport, &cfg).unwrap()
    }

    #[test]
    fn url_input_is_remote() {
        let session = session_for("https://example.com/api/encrypted/diary.json");
        assert_eq!(session.slug(), "diary");
        assert_eq!(
            session.source(),
            Some(&PayloadSource::Remote(
                "https://example.com/api/encrypted/diary.json".into()
            ))
        );
    }

    #[test]
    fn post_record_input_uses_widget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        let record = post::Post {
            slug: "diary".into(),
            content: unlock_widget("diary", "/api/encrypted/diary.json"),
            encrypted: true,
            ..post::Post::default()
        };
        post::save_post(&path, &record).unwrap();

        let session = session_for(path.to_str().unwrap());
        assert_eq!(session.slug(), "diary");
        assert_eq!(
            session.source(),
            Some(&PayloadSource::Remote("/api/encrypted/diary.json".into()))
        );
    }

    #[test]
    fn raw_payload_input_is_inline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diary.json");
        let zeros = "AAAAAAAAAAAAAAAAAAAAAA==";
        let json = format!(r#"{{"ct":"AA==","s":"{zeros}","iv":"{zeros}","at":"{zeros}","i":1}}"#);
        std::fs::write(&path, format!("{json}\n")).unwrap();

        let session = session_for(path.to_str().unwrap());
        assert_eq!(session.slug(), "diary");
        assert_eq!(session.source(), Some(&PayloadSource::Inline(json)));
    }

    #[test]
    fn unrelated_file_has_no_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.html");
        std::fs::write(&path, "<p>nothing here</p>").unwrap();
        assert!(session_for(path.to_str().unwrap()).source().is_none());
    }

    #[test]
    fn cli_parses_encrypt() {
        let cli = Cli::try_parse_from(["sealed-post", "encrypt", "posts", "-o", "out"]).unwrap();
        match cli.command {
            Command::Encrypt { paths, out_dir, .. } => {
                assert_eq!(paths, vec![PathBuf::from("posts")]);
                assert_eq!(out_dir, Some(PathBuf::from("out")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
