//! # Encoder
//!
//! Seals one rendered post.
//!
//! ## Algorithm
//!
//! 1. Resolve the password (literal, or `env:NAME` from the environment)
//! 2. Discover `<img>` tags and resolve their bytes, remote ones concurrently
//! 3. Derive one key from the password and a fresh salt
//! 4. Encrypt each resolved image under its own IV and swap its tag for a
//!    placeholder carrying `data-enc-id`
//! 5. Encrypt the rewritten body under another fresh IV
//! 6. Replace the content with the unlock widget and scrub the excerpt,
//!    teaser and password
//!
//! Problems scoped to one post or one image never fail the build. A post whose
//! password cannot be resolved is passed through unchanged, and an image that
//! cannot be resolved keeps its original tag.

use crate::config::{DeliveryMode, DeliverySettings};
use crate::crypto::{self, IvLedger, ITERATIONS};
use crate::error::{PayloadError, Result};
use crate::images::{self, Splice};
use crate::payload::{EncryptedPayload, SealedImage};
use crate::post::{Post, PROTECTED_EXCERPT};
use crate::resolve::{Resolution, Resolver};
use std::collections::BTreeMap;
use std::path::PathBuf;
use zeroize::Zeroizing;

/// Prefix selecting an environment variable as the password source.
pub const ENV_PREFIX: &str = "env:";

/// Why a post was left unencrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoPassword,
    /// `env:NAME` named a variable that is not set.
    MissingEnv(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoPassword => write!(f, "no password"),
            SkipReason::MissingEnv(name) => write!(f, "environment variable '{name}' not set"),
        }
    }
}

/// Per-post image statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SealReport {
    pub images_sealed: usize,
    /// Data URIs, already self-contained and left in the body as-is.
    pub images_inline: usize,
    /// References that could not be resolved and stay unencrypted.
    pub images_failed: usize,
    pub payload_bytes: usize,
}

/// A payload to be published next to the page in external delivery mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalPayload {
    pub slug: String,
    pub url: String,
    /// Where the payload must be served from, relative to the public root.
    pub path: PathBuf,
    pub json: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SealOutcome {
    Sealed {
        report: SealReport,
        external: Option<ExternalPayload>,
    },
    Skipped(SkipReason),
}

/// Resolves a password value through `lookup` when it uses the `env:` form.
pub fn resolve_password<F>(
    raw: &str,
    lookup: F,
) -> std::result::Result<Zeroizing<String>, SkipReason>
where
    F: Fn(&str) -> Option<String>,
{
    match raw.strip_prefix(ENV_PREFIX) {
        Some(name) => match lookup(name) {
            Some(value) if !value.is_empty() => Ok(Zeroizing::new(value)),
            _ => Err(SkipReason::MissingEnv(name.to_string())),
        },
        None if raw.is_empty() => Err(SkipReason::NoPassword),
        None => Ok(Zeroizing::new(raw.to_string())),
    }
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Seals posts for one site.
pub struct Sealer {
    resolver: Resolver,
    delivery: DeliverySettings,
    env: EnvLookup,
}

impl Sealer {
    pub fn new(resolver: Resolver, delivery: DeliverySettings) -> Self {
        Self {
            resolver,
            delivery,
            env: Box::new(|name| std::env::var(name).ok()),
        }
    }

    /// Replaces the process environment as the source for `env:` passwords.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Box::new(lookup);
        self
    }

    /// Seals `post`, returning the rewritten record and what happened.
    ///
    /// Errors only on cipher or serialization failure; every configuration or
    /// resource problem degrades instead.
    pub async fn seal_post(&self, mut post: Post) -> Result<(Post, SealOutcome)> {
        let Some(raw) = post.password.as_deref() else {
            return Ok((post, SealOutcome::Skipped(SkipReason::NoPassword)));
        };
        let password = match resolve_password(raw, &self.env) {
            Ok(password) => password,
            Err(reason) => {
                if let SkipReason::MissingEnv(name) = &reason {
                    tracing::warn!(
                        post = post.label(),
                        variable = %name,
                        "environment variable not found, publishing unencrypted"
                    );
                }
                return Ok((post, SealOutcome::Skipped(reason)));
            }
        };

        let refs = images::find_images(&post.content);
        let resolutions = self
            .resolver
            .resolve_all(&refs, post.asset_dir.as_deref())
            .await;

        let salt = crypto::random_salt();
        let key = crypto::derive_key(&password, &salt, ITERATIONS);
        drop(password);

        let mut ledger = IvLedger::new();
        let mut report = SealReport::default();
        let mut imgs = BTreeMap::new();
        let mut splices = Vec::new();

        for (reference, resolution) in refs.iter().zip(resolutions) {
            match resolution {
                Resolution::Skipped => report.images_inline += 1,
                Resolution::Failed(e) => {
                    tracing::warn!(
                        post = post.label(),
                        src = %reference.src,
                        error = %e,
                        "leaving image unencrypted"
                    );
                    report.images_failed += 1;
                }
                Resolution::Resolved(asset) => {
                    let chunk = crypto::seal(&key, &asset.buffer, &mut ledger)?;
                    let id = format!("img{}", imgs.len());
                    tracing::debug!(
                        post = post.label(),
                        src = %reference.src,
                        %id,
                        bytes = asset.buffer.len(),
                        "sealed image"
                    );

                    splices.push(Splice::over(reference, images::placeholder_tag(reference, &id)));
                    imgs.insert(id, SealedImage::from_chunk(&chunk, &asset.mime));
                    report.images_sealed += 1;
                }
            }
        }

        let body = images::apply_splices(&post.content, splices);
        let body_chunk = crypto::seal(&key, body.as_bytes(), &mut ledger)?;
        let payload = EncryptedPayload::new(&body_chunk, &salt, ITERATIONS, imgs);

        let (widget_arg, external) = match self.delivery.mode {
            DeliveryMode::Inline => {
                let encoded = payload.encode()?;
                report.payload_bytes = encoded.len();
                (encoded, None)
            }
            DeliveryMode::External => {
                let (url, path) = external_location(&self.delivery.payload_url, &post.slug)?;
                let json = payload.to_json()?;
                report.payload_bytes = json.len();
                let external = ExternalPayload {
                    slug: post.slug.clone(),
                    url: url.clone(),
                    path,
                    json,
                };
                (url, Some(external))
            }
        };

        post.content = unlock_widget(&post.slug, &widget_arg);
        post.excerpt = Some(PROTECTED_EXCERPT.to_string());
        post.more = Some(String::new());
        drop(post.password.take().map(Zeroizing::new));
        post.encrypted = true;

        Ok((post, SealOutcome::Sealed { report, external }))
    }
}

/// Renders the payload URL for `slug` and the file path that serves it.
fn external_location(
    template: &str,
    slug: &str,
) -> std::result::Result<(String, PathBuf), PayloadError> {
    if slug.is_empty() || slug.contains(['/', '\\']) || slug.contains("..") {
        return Err(PayloadError::UnsafeSlug(slug.to_string()));
    }
    let url = template.replace("{slug}", slug);
    let path = served_path(&url).ok_or_else(|| PayloadError::UnservableUrl(url.clone()))?;
    Ok((url, path))
}

/// Path component of `url` as a relative file path under the public root.
///
/// `https://host/a/b.json` and `/a/b.json` both map to `a/b.json`. Returns
/// `None` for URLs without a path or with `..` segments.
pub fn served_path(url: &str) -> Option<PathBuf> {
    let lower = url.to_ascii_lowercase();
    let path = if lower.starts_with("http://") || lower.starts_with("https://") {
        let rest = &url[url.find("://")? + 3..];
        &rest[rest.find('/')?..]
    } else {
        url
    };
    let path = path.split(['?', '#']).next().unwrap_or(path);

    let mut out = PathBuf::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            segment => out.push(segment),
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

/// Escapes a value for a single-quoted JS string inside a double-quoted
/// HTML attribute.
fn escape_js_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\n' | '\r' => out.push(' '),
            _ => out.push(c),
        }
    }
    out
}

/// Unlock widget markup. `source` is the base64 payload or its URL.
pub fn unlock_widget(slug: &str, source: &str) -> String {
    let slug = escape_js_attr(slug);
    let source = escape_js_attr(source);
    format!(
        r#"
    <div class="encrypted-post" x-data="encryptedPost('{slug}', '{source}')">
      <div class="encrypted-form" x-show="!decryptedContent">
        <div class="encrypted-input-wrap">
          <input
            type="password"
            class="encrypted-input"
            x-model="password"
            @keydown.enter.prevent="handleUnlock"
            :id="'pass-' + slug"
            placeholder=" "
            autocomplete="off"
          >
          <label class="encrypted-label" :for="'pass-' + slug">Enter password</label>
        </div>
        <button type="button" class="encrypted-button" @click="handleUnlock" :disabled="isDecrypting">Unlock</button>
        <p class="encrypted-error" x-show="error" x-text="error" style="display:none;"></p>
      </div>
      <div class="encrypted-post-content" x-ref="contentContainer" x-show="decryptedContent" x-html="decryptedContent"></div>
    </div>"#
    )
}
