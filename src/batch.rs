//! # Batch Sealing
//!
//! Runs the encoder over post records on disk, the way the site pipeline hands
//! them over: one JSON file per rendered post.
//!
//! 1. Collect `*.json` files from the given files and directories
//! 2. Seal each post; a post that fails is reported and the batch moves on
//! 3. Write every record back (sealed or passed through) to the output tree
//! 4. In external delivery mode, write each payload under the public root at
//!    the path its URL serves

use crate::encoder::{SealOutcome, Sealer};
use crate::error::Result;
use crate::post::{self, Post};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Instant;
use walkdir::WalkDir;

/// A post record to process and where it sits relative to its input root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostFile {
    pub path: PathBuf,
    pub relative: PathBuf,
}

/// Options controlling where results land.
pub struct BatchOptions {
    /// Output root. `None` rewrites the inputs in place.
    pub out_dir: Option<PathBuf>,

    /// Site output root that externally delivered payloads are served from.
    pub public_dir: PathBuf,

    pub verbose: bool,
}

/// Aggregate results for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub posts_total: u64,
    pub posts_sealed: u64,
    pub posts_skipped: u64,
    pub posts_failed: u64,
    pub images_sealed: u64,
    pub images_failed: u64,
    pub payload_bytes: u64,
    pub duration_ms: u64,
}

/// Expands files and directories into post records, sorted by path.
pub fn collect_posts(inputs: &[PathBuf]) -> Vec<PostFile> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_file() {
            let relative = input
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| input.clone());
            files.push(PostFile {
                path: input.clone(),
                relative,
            });
            continue;
        }

        files.extend(
            WalkDir::new(input)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                .map(|e| PostFile {
                    path: e.path().to_path_buf(),
                    relative: e
                        .path()
                        .strip_prefix(input)
                        .unwrap_or(e.path())
                        .to_path_buf(),
                }),
        );
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

fn output_path(file: &PostFile, opts: &BatchOptions) -> PathBuf {
    match &opts.out_dir {
        Some(dir) => dir.join(&file.relative),
        None => file.path.clone(),
    }
}

/// Seals every post in `files`.
pub async fn seal_all(
    sealer: &Sealer,
    files: &[PostFile],
    opts: &BatchOptions,
) -> Result<BatchStats> {
    let pb = create_progress_bar(files.len() as u64);
    let start = Instant::now();
    let mut stats = BatchStats::default();

    for file in files {
        stats.posts_total += 1;
        pb.set_message(truncate_path(&file.relative.to_string_lossy(), 40));

        match seal_one(sealer, file, opts, &mut stats).await {
            Ok(label) if opts.verbose => {
                pb.println(format!("  {} {label}", "+".green()));
            }
            Ok(_) => {}
            Err(e) => {
                stats.posts_failed += 1;
                pb.println(format!(
                    "  {} {}: {e}",
                    "✗".red(),
                    file.path.display()
                ));
            }
        }
        pb.inc(1);
    }

    pb.finish_with_message("done");
    stats.duration_ms = start.elapsed().as_millis() as u64;
    Ok(stats)
}

async fn seal_one(
    sealer: &Sealer,
    file: &PostFile,
    opts: &BatchOptions,
    stats: &mut BatchStats,
) -> Result<String> {
    let input: Post = post::load_post(&file.path)?;
    let (sealed, outcome) = sealer.seal_post(input).await?;

    let label = match &outcome {
        SealOutcome::Sealed { report, external } => {
            stats.posts_sealed += 1;
            stats.images_sealed += report.images_sealed as u64;
            stats.images_failed += report.images_failed as u64;
            stats.payload_bytes += report.payload_bytes as u64;

            if let Some(external) = external {
                let path = opts.public_dir.join(&external.path);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, &external.json)?;
                tracing::debug!(path = %path.display(), "wrote external payload");
            }

            format!(
                "{} ({} images, {})",
                sealed.label(),
                report.images_sealed,
                format_size(report.payload_bytes as u64)
            )
        }
        SealOutcome::Skipped(reason) => {
            stats.posts_skipped += 1;
            format!("{} (skipped: {reason})", sealed.label())
        }
    };

    post::save_post(&output_path(file, opts), &sealed)?;
    Ok(label)
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner:.green} sealing [{bar:30.cyan/dim}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━╸─"),
    );
    pb
}

fn truncate_path(path: &str, max_len: usize) -> String {
    let count = path.chars().count();
    if count <= max_len {
        path.to_string()
    } else {
        let tail: String = path.chars().skip(count - max_len + 1).collect();
        format!("…{tail}")
    }
}

/// Prints a summary of a completed batch.
pub fn print_summary(stats: &BatchStats) {
    eprintln!();
    eprintln!(
        "  {} Sealed {} of {} post(s)",
        "✓".green(),
        stats.posts_sealed,
        stats.posts_total,
    );
    eprintln!(
        "    Posts:    {} sealed, {} skipped, {} failed",
        stats.posts_sealed, stats.posts_skipped, stats.posts_failed,
    );
    eprintln!(
        "    Images:   {} sealed, {} left unencrypted",
        stats.images_sealed, stats.images_failed,
    );
    eprintln!("    Payloads: {}", format_size(stats.payload_bytes));
    eprintln!("    Duration: {:.2}s", stats.duration_ms as f64 / 1000.0);
}

/// Formats a byte count as a human-readable size string.
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} PiB")
}
