//! # Decoder
//!
//! The unlock state machine the browser widget runs, usable from Rust for
//! verification and offline recovery.
//!
//! ```text
//!            unlock(pw)                 ok
//!  Locked ─────────────▶ Unlocking ───────────▶ Unlocked
//!    ▲                       │
//!    └───────────────────────┘
//!      error (notice expires)
//! ```
//!
//! Only the body is decrypted on unlock. Images stay sealed in the pending map
//! until [`UnlockSession::on_visible`] reports their placeholder in view, then
//! each is decrypted once and dropped from the map.

use crate::crypto::DerivedKey;
use crate::error::{CryptoError, Result, UnlockError};
use crate::images::{self, Splice, PLACEHOLDER_SRC};
use crate::payload::{extract_from_markup, EncryptedPayload, RevealedImage, SealedImage};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockState {
    Locked,
    Unlocking,
    Unlocked,
}

/// Where the session gets its payload from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSource {
    /// base64 payload embedded in the page.
    Inline(String),
    /// URL serving the raw JSON payload.
    Remote(String),
}

impl PayloadSource {
    /// Interprets the second argument of the widget's `encryptedPost(..)`.
    pub fn from_widget_arg(arg: &str) -> Self {
        let lower = arg.to_ascii_lowercase();
        if arg.starts_with('/')
            || lower.starts_with("http://")
            || lower.starts_with("https://")
            || lower.ends_with(".json")
        {
            PayloadSource::Remote(arg.to_string())
        } else {
            PayloadSource::Inline(arg.to_string())
        }
    }
}

/// Fetches externally delivered payloads.
#[allow(async_fn_in_trait)]
pub trait PayloadTransport {
    async fn fetch(&self, url: &str) -> anyhow::Result<String>;
}

/// `reqwest`-backed transport with a request timeout.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            base_url: None,
        })
    }

    /// Resolves site-relative URLs such as `/api/encrypted/x.json` against `base`.
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base_url = Some(base.into().trim_end_matches('/').to_string());
        self
    }

    fn absolute<'a>(&self, url: &'a str) -> Cow<'a, str> {
        match &self.base_url {
            Some(base) if url.starts_with('/') => Cow::Owned(format!("{base}{url}")),
            _ => Cow::Borrowed(url),
        }
    }
}

impl PayloadTransport for HttpTransport {
    async fn fetch(&self, url: &str) -> anyhow::Result<String> {
        let url = self.absolute(url);
        let text = self
            .client
            .get(url.as_ref())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(text)
    }
}

/// An error message shown for a bounded time.
#[derive(Debug, Clone)]
pub struct Notice {
    pub message: String,
    expires_at: Instant,
}

impl Notice {
    fn new(message: String, ttl: Duration) -> Self {
        Self {
            message,
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn is_visible_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// What a successful unlock hands back to the session.
struct Opened {
    body: String,
    key: DerivedKey,
    images: BTreeMap<String, SealedImage>,
}

/// Resets an interrupted unlock to `Locked`.
struct InFlight<'a> {
    state: &'a mut UnlockState,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if *self.state == UnlockState::Unlocking {
            *self.state = UnlockState::Locked;
        }
    }
}

/// One reader's unlock session for one post.
pub struct UnlockSession<T> {
    slug: String,
    source: Option<PayloadSource>,
    transport: T,
    state: UnlockState,
    notice: Option<Notice>,
    notice_ttl: Duration,
    body: Option<String>,
    key: Option<DerivedKey>,
    pending: BTreeMap<String, SealedImage>,
    observed: BTreeSet<String>,
}

impl<T: PayloadTransport> UnlockSession<T> {
    pub fn new(
        slug: impl Into<String>,
        source: Option<PayloadSource>,
        transport: T,
        notice_ttl: Duration,
    ) -> Self {
        Self {
            slug: slug.into(),
            source,
            transport,
            state: UnlockState::Locked,
            notice: None,
            notice_ttl,
            body: None,
            key: None,
            pending: BTreeMap::new(),
            observed: BTreeSet::new(),
        }
    }

    /// Builds a session from published unlock widget markup.
    ///
    /// Markup without a widget yields a session with no payload, which fails
    /// to unlock with [`UnlockError::NoPayload`].
    pub fn from_markup(html: &str, transport: T, notice_ttl: Duration) -> Self {
        match extract_from_markup(html) {
            Some((slug, arg)) => {
                let source = PayloadSource::from_widget_arg(&arg);
                Self::new(slug, Some(source), transport, notice_ttl)
            }
            None => Self::new(String::new(), None, transport, notice_ttl),
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn source(&self) -> Option<&PayloadSource> {
        self.source.as_ref()
    }

    pub fn state(&self) -> UnlockState {
        self.state
    }

    /// Decrypted body, once unlocked.
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// The current error message, if it has not expired.
    pub fn error(&self) -> Option<&str> {
        self.error_at(Instant::now())
    }

    pub fn error_at(&self, now: Instant) -> Option<&str> {
        self.notice
            .as_ref()
            .filter(|n| n.is_visible_at(now))
            .map(|n| n.message.as_str())
    }

    /// Images still waiting to be revealed.
    pub fn pending_images(&self) -> usize {
        self.pending.len()
    }

    /// Attempts to unlock with `password`, which is wiped on every path.
    ///
    /// Wrong passwords and damaged payloads produce the same error. An
    /// already unlocked session returns its body without touching the password.
    pub async fn unlock(
        &mut self,
        password: impl Into<String>,
    ) -> std::result::Result<&str, UnlockError> {
        let password = Zeroizing::new(password.into());

        match self.state {
            UnlockState::Unlocking => return Err(UnlockError::Busy),
            UnlockState::Unlocked => return Ok(self.body.as_deref().unwrap_or_default()),
            UnlockState::Locked => {}
        }

        if password.is_empty() {
            return Err(self.fail(UnlockError::EmptyPassword));
        }
        let Some(source) = self.source.as_ref() else {
            return Err(self.fail(UnlockError::NoPayload));
        };

        self.notice = None;
        self.state = UnlockState::Unlocking;
        let guard = InFlight {
            state: &mut self.state,
        };
        let result = open_payload(&self.transport, source, &password).await;
        drop(password);
        drop(guard);

        match result {
            Ok(opened) => {
                tracing::debug!(slug = %self.slug, images = opened.images.len(), "unlocked");
                self.key = Some(opened.key);
                self.pending = opened.images;
                self.state = UnlockState::Unlocked;
                Ok(self.body.insert(opened.body).as_str())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, err: UnlockError) -> UnlockError {
        self.state = UnlockState::Locked;
        self.notice = Some(Notice::new(err.to_string(), self.notice_ttl));
        err
    }

    /// Starts watching every placeholder in the body that still has a
    /// pending image. Returns the ids now observed, in document order.
    pub fn observe(&mut self) -> Vec<String> {
        let Some(body) = self.body.as_deref() else {
            return Vec::new();
        };
        let ids: Vec<String> = images::placeholder_ids(body)
            .into_iter()
            .filter(|id| self.pending.contains_key(id))
            .collect();
        self.observed.extend(ids.iter().cloned());
        ids
    }

    pub fn is_observed(&self, id: &str) -> bool {
        self.observed.contains(id)
    }

    /// Called when the placeholder `id` enters (or nears) the viewport.
    ///
    /// Decrypts that image once, forgets its ciphertext and stops observing
    /// it. Returns `None` for ids that are not observed or already revealed.
    pub fn on_visible(
        &mut self,
        id: &str,
    ) -> Option<std::result::Result<RevealedImage, CryptoError>> {
        if !self.observed.remove(id) {
            return None;
        }
        let sealed = self.pending.remove(id)?;
        let key = self.key.as_ref()?;

        let result = sealed.open(key);
        if let Err(e) = &result {
            tracing::warn!(slug = %self.slug, %id, error = %e, "failed to decrypt image");
        }
        Some(result)
    }

    /// Reveals every observed image and returns the body with placeholders
    /// pointing at inline data URIs. Images that fail keep the placeholder.
    pub fn reveal_all(&mut self) -> Option<String> {
        self.observe();
        let body = self.body.clone()?;

        let mut splices = Vec::new();
        for reference in images::find_images(&body) {
            if reference.src != PLACEHOLDER_SRC {
                continue;
            }
            let Some(id) = reference.enc_id().map(String::from) else {
                continue;
            };
            if !self.is_observed(&id) {
                continue;
            }
            if let Some(Ok(image)) = self.on_visible(&id) {
                let tag = images::replacement_tag(&reference, &image.data_uri());
                splices.push(Splice::over(&reference, tag));
            }
        }
        Some(images::apply_splices(&body, splices))
    }
}

async fn open_payload<T: PayloadTransport>(
    transport: &T,
    source: &PayloadSource,
    password: &str,
) -> std::result::Result<Opened, UnlockError> {
    let text = match source {
        PayloadSource::Inline(payload) => Cow::Borrowed(payload.as_str()),
        PayloadSource::Remote(url) => Cow::Owned(transport.fetch(url).await.map_err(|e| {
            tracing::warn!(%url, error = %e, "failed to fetch payload");
            UnlockError::Transport
        })?),
    };

    let payload = EncryptedPayload::parse(&text).map_err(|e| {
        tracing::debug!(error = %e, "rejected malformed payload");
        UnlockError::Decryption
    })?;
    let key = payload.derive_key(password).map_err(|_| UnlockError::Decryption)?;
    let body = payload.open_body(&key).map_err(|_| UnlockError::Decryption)?;

    Ok(Opened {
        body,
        key,
        images: payload.imgs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{self, IvLedger};
    use crate::images::placeholder_tag;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TTL: Duration = Duration::from_secs(5);

    /// Builds a payload with two images at a low round count.
    fn payload(password: &str) -> EncryptedPayload {
        let salt = crypto::random_salt();
        let key = crypto::derive_key(password, &salt, 1_000);
        let mut ledger = IvLedger::new();

        let mut imgs = BTreeMap::new();
        let mut body = String::from("<h1>Title</h1>");
        for (id, bytes) in [("img0", b"first".as_slice()), ("img1", b"second".as_slice())] {
            let chunk = crypto::seal(&key, bytes, &mut ledger).unwrap();
            imgs.insert(id.to_string(), SealedImage::from_chunk(&chunk, "image/png"));
            let reference = &images::find_images(r#"<img alt="x" src="/p.png">"#)[0];
            body.push_str(&placeholder_tag(reference, id));
        }

        let chunk = crypto::seal(&key, body.as_bytes(), &mut ledger).unwrap();
        EncryptedPayload::new(&chunk, &salt, 1_000, imgs)
    }

    #[derive(Default)]
    struct StubTransport {
        response: Option<String>,
        hang: bool,
        calls: AtomicUsize,
    }

    impl PayloadTransport for StubTransport {
        async fn fetch(&self, _url: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.response.clone().ok_or_else(|| anyhow::anyhow!("offline"))
        }
    }

    fn inline_session(password: &str) -> UnlockSession<StubTransport> {
        let source = PayloadSource::Inline(payload(password).encode().unwrap());
        UnlockSession::new("post", Some(source), StubTransport::default(), TTL)
    }

    #[tokio::test]
    async fn unlock_reveals_body_and_keeps_images_pending() {
        let mut session = inline_session("pw");
        let body = session.unlock("pw").await.unwrap().to_string();

        assert!(body.starts_with("<h1>Title</h1>"));
        assert_eq!(session.state(), UnlockState::Unlocked);
        assert_eq!(session.pending_images(), 2);
        assert!(session.error().is_none());
    }

    #[tokio::test]
    async fn wrong_password_returns_to_locked_with_expiring_notice() {
        let mut session = inline_session("pw");
        let err = session.unlock("nope").await.unwrap_err();

        assert_eq!(err, UnlockError::Decryption);
        assert_eq!(session.state(), UnlockState::Locked);
        assert_eq!(session.error(), Some("Incorrect password or decryption failed."));
        assert!(session.error_at(Instant::now() + TTL + Duration::from_secs(1)).is_none());
        assert!(session.body().is_none());
    }

    #[tokio::test]
    async fn retry_after_failure_is_permitted() {
        let mut session = inline_session("pw");
        assert!(session.unlock("nope").await.is_err());
        assert!(session.unlock("pw").await.is_ok());
        assert!(session.error().is_none());
    }

    #[tokio::test]
    async fn corrupted_payload_gets_the_same_message() {
        let source = PayloadSource::Inline("bm90IGpzb24=".into());
        let mut session = UnlockSession::new("post", Some(source), StubTransport::default(), TTL);
        assert_eq!(session.unlock("pw").await.unwrap_err(), UnlockError::Decryption);
    }

    #[tokio::test]
    async fn empty_password_never_touches_transport() {
        let source = PayloadSource::Remote("/api/encrypted/post.json".into());
        let mut session = UnlockSession::new("post", Some(source), StubTransport::default(), TTL);

        assert_eq!(session.unlock("").await.unwrap_err(), UnlockError::EmptyPassword);
        assert_eq!(session.error(), Some("Please enter a password."));
        assert_eq!(session.transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_source_is_a_configuration_error() {
        let mut session = UnlockSession::new("post", None, StubTransport::default(), TTL);
        assert_eq!(session.unlock("pw").await.unwrap_err(), UnlockError::NoPayload);
    }

    #[tokio::test]
    async fn remote_payload_is_fetched() {
        let transport = StubTransport {
            response: Some(payload("pw").to_json().unwrap()),
            ..StubTransport::default()
        };
        let source = PayloadSource::Remote("/api/encrypted/post.json".into());
        let mut session = UnlockSession::new("post", Some(source), transport, TTL);

        assert!(session.unlock("pw").await.is_ok());
        assert_eq!(session.transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_failure_has_its_own_message() {
        let source = PayloadSource::Remote("/api/encrypted/post.json".into());
        let mut session = UnlockSession::new("post", Some(source), StubTransport::default(), TTL);

        assert_eq!(session.unlock("pw").await.unwrap_err(), UnlockError::Transport);
        assert_eq!(
            session.error(),
            Some("Failed to load content. Please check your connection.")
        );
        assert_eq!(session.state(), UnlockState::Locked);
    }

    #[tokio::test]
    async fn interrupted_unlock_returns_to_locked() {
        let transport = StubTransport {
            hang: true,
            ..StubTransport::default()
        };
        let source = PayloadSource::Remote("/slow.json".into());
        let mut session = UnlockSession::new("post", Some(source), transport, TTL);

        let attempt = tokio::time::timeout(Duration::from_millis(20), session.unlock("pw")).await;
        assert!(attempt.is_err());
        assert_eq!(session.state(), UnlockState::Locked);
    }

    #[tokio::test]
    async fn images_reveal_once_when_visible() {
        let mut session = inline_session("pw");
        session.unlock("pw").await.unwrap();

        assert_eq!(session.observe(), vec!["img0", "img1"]);
        assert!(session.on_visible("unknown").is_none());

        let second = session.on_visible("img1").unwrap().unwrap();
        assert_eq!(second.bytes, b"second");
        assert_eq!(second.mime, "image/png");
        assert!(!session.is_observed("img1"));
        assert_eq!(session.pending_images(), 1);

        assert!(session.on_visible("img1").is_none());

        let first = session.on_visible("img0").unwrap().unwrap();
        assert_eq!(first.bytes, b"first");
        assert_eq!(session.pending_images(), 0);
    }

    #[tokio::test]
    async fn nothing_is_observed_before_unlock() {
        let mut session = inline_session("pw");
        assert!(session.observe().is_empty());
        assert!(session.on_visible("img0").is_none());
    }

    #[tokio::test]
    async fn reveal_all_inlines_decrypted_images() {
        let mut session = inline_session("pw");
        session.unlock("pw").await.unwrap();

        let html = session.reveal_all().unwrap();
        assert!(!html.contains(PLACEHOLDER_SRC));
        let revealed = r#"<img alt="x" src="data:image/png;base64,Zmlyc3Q=" data-enc-id="img0">"#;
        assert!(html.contains(revealed));
        assert_eq!(session.pending_images(), 0);
    }

    #[tokio::test]
    async fn session_from_published_markup() {
        let encoded = payload("pw").encode().unwrap();
        let html = crate::encoder::unlock_widget("my-post", &encoded);
        let mut session = UnlockSession::from_markup(&html, StubTransport::default(), TTL);

        assert_eq!(session.slug(), "my-post");
        assert!(matches!(session.source(), Some(PayloadSource::Inline(_))));
        assert!(session.unlock("pw").await.is_ok());
    }

    #[tokio::test]
    async fn markup_without_widget_has_no_payload() {
        let mut session =
            UnlockSession::from_markup("<p>plain page</p>", StubTransport::default(), TTL);
        assert!(session.source().is_none());
        assert_eq!(session.unlock("pw").await.unwrap_err(), UnlockError::NoPayload);
        assert_eq!(session.error(), Some("Configuration error: No payload found."));
    }

    #[test]
    fn widget_arg_classification() {
        assert_eq!(
            PayloadSource::from_widget_arg("/api/encrypted/a.json"),
            PayloadSource::Remote("/api/encrypted/a.json".into())
        );
        assert_eq!(
            PayloadSource::from_widget_arg("eyJjdCI6IiJ9"),
            PayloadSource::Inline("eyJjdCI6IiJ9".into())
        );
    }

    #[tokio::test]
    async fn http_transport_fetches_relative_urls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/encrypted/a.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"ct\":\"\"}"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/encrypted/missing.json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Duration::from_secs(5))
            .unwrap()
            .with_base_url(format!("{}/", server.uri()));

        assert_eq!(transport.fetch("/api/encrypted/a.json").await.unwrap(), "{\"ct\":\"\"}");
        assert!(transport.fetch("/api/encrypted/missing.json").await.is_err());
    }
}
