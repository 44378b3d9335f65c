//! # Payload Format
//!
//! The only artifact that crosses from the build to the browser. Serialized as
//! JSON, then base64 when embedded inline in a page:
//!
//! ```text
//! {
//!   "ct":   "<base64 body ciphertext>",
//!   "imgs": { "<id>": { "ct": "..", "iv": "..", "at": "..", "m": "image/png" } },
//!   "s":    "<base64 salt>",
//!   "iv":   "<base64 body iv>",
//!   "at":   "<base64 body tag>",
//!   "i":    100000
//! }
//! ```
//!
//! `imgs` is omitted when a post has no encrypted images. Every field is
//! required otherwise; [`EncryptedPayload::validate`] rejects anything that
//! could not be decrypted before a key is ever derived.

use crate::crypto::{self, DerivedKey, SealedChunk, IV_LEN, MAX_ITERATIONS, SALT_LEN, TAG_LEN};
use crate::error::{CryptoError, PayloadError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// One encrypted image, keyed by its opaque id in [`EncryptedPayload::imgs`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedImage {
    pub ct: String,
    pub iv: String,
    pub at: String,
    /// Mime type of the decrypted bytes.
    pub m: String,
}

/// Sealed document body plus its images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub ct: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub imgs: BTreeMap<String, SealedImage>,
    pub s: String,
    pub iv: String,
    pub at: String,
    pub i: u32,
}

/// Decrypted image bytes, ready to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealedImage {
    pub bytes: Vec<u8>,
    pub mime: String,
}

impl RevealedImage {
    /// Inline `data:` URI for the image.
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, STANDARD.encode(&self.bytes))
    }
}

impl SealedImage {
    pub fn from_chunk(chunk: &SealedChunk, mime: &str) -> Self {
        Self {
            ct: STANDARD.encode(&chunk.ciphertext),
            iv: STANDARD.encode(chunk.iv),
            at: STANDARD.encode(chunk.tag),
            m: mime.to_string(),
        }
    }

    /// Decrypts this image. Depends only on the key and this entry.
    pub fn open(&self, key: &DerivedKey) -> Result<RevealedImage, CryptoError> {
        let bytes = open_fields(key, &self.ct, &self.iv, &self.at)?;
        Ok(RevealedImage {
            bytes,
            mime: self.m.clone(),
        })
    }
}

impl EncryptedPayload {
    /// Builds a payload around a sealed body.
    pub fn new(
        body: &SealedChunk,
        salt: &[u8],
        iterations: u32,
        imgs: BTreeMap<String, SealedImage>,
    ) -> Self {
        Self {
            ct: STANDARD.encode(&body.ciphertext),
            imgs,
            s: STANDARD.encode(salt),
            iv: STANDARD.encode(body.iv),
            at: STANDARD.encode(body.tag),
            i: iterations,
        }
    }

    pub fn to_json(&self) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(self)?)
    }

    /// base64(JSON), the form embedded in the unlock widget.
    pub fn encode(&self) -> Result<String, PayloadError> {
        Ok(STANDARD.encode(self.to_json()?))
    }

    /// Parses either base64(JSON) or raw JSON, then validates.
    pub fn parse(text: &str) -> Result<Self, PayloadError> {
        let text = text.trim();
        let payload: Self = if text.starts_with('{') {
            serde_json::from_str(text)?
        } else {
            serde_json::from_slice(&STANDARD.decode(text)?)?
        };
        payload.validate()?;
        Ok(payload)
    }

    /// Checks every field decodes to something the cipher can use.
    pub fn validate(&self) -> Result<(), PayloadError> {
        decode_field("ct", &self.ct, None, true)?;
        decode_field("s", &self.s, Some(SALT_LEN), false)?;
        decode_field("iv", &self.iv, Some(IV_LEN), false)?;
        decode_field("at", &self.at, Some(TAG_LEN), false)?;
        if self.i == 0 {
            return Err(PayloadError::ZeroIterations);
        }
        if self.i > MAX_ITERATIONS {
            return Err(PayloadError::TooManyIterations(self.i));
        }

        for (id, img) in &self.imgs {
            decode_field(&format!("imgs.{id}.ct"), &img.ct, None, true)?;
            decode_field(&format!("imgs.{id}.iv"), &img.iv, Some(IV_LEN), false)?;
            decode_field(&format!("imgs.{id}.at"), &img.at, Some(TAG_LEN), false)?;
            if img.m.trim().is_empty() {
                return Err(PayloadError::MissingMime(id.clone()));
            }
        }
        Ok(())
    }

    pub fn salt(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(STANDARD.decode(&self.s)?)
    }

    /// Derives the document key from a password and the stored parameters.
    pub fn derive_key(&self, password: &str) -> Result<DerivedKey, PayloadError> {
        Ok(crypto::derive_key(password, &self.salt()?, self.i))
    }

    /// Decrypts the body to UTF-8 text.
    pub fn open_body(&self, key: &DerivedKey) -> Result<String, CryptoError> {
        let bytes = open_fields(key, &self.ct, &self.iv, &self.at)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Decodes base64 fields and opens the chunk. Undecodable fields count as a
/// failed decryption.
fn open_fields(key: &DerivedKey, ct: &str, iv: &str, at: &str) -> Result<Vec<u8>, CryptoError> {
    let decode = |s: &str| STANDARD.decode(s).map_err(|_| CryptoError::DecryptionFailed);
    crypto::open(key, &decode(ct)?, &decode(iv)?, &decode(at)?)
}

/// Validates one base64 field. Ciphertexts may be empty (an empty body or a
/// zero-byte file); the base64 text itself may be empty only in that case.
fn decode_field(
    field: &str,
    value: &str,
    expected_len: Option<usize>,
    allow_empty: bool,
) -> Result<(), PayloadError> {
    if value.is_empty() && !allow_empty {
        return Err(PayloadError::EmptyField(field.to_string()));
    }
    let bytes = STANDARD.decode(value)?;
    if let Some(expected) = expected_len {
        if bytes.len() != expected {
            return Err(PayloadError::FieldLength {
                field: field.to_string(),
                expected,
                actual: bytes.len(),
            });
        }
    }
    Ok(())
}

static WIDGET_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"encryptedPost\('((?:[^'\\]|\\.)*)',\s*'((?:[^'\\]|\\.)*)'\)"#)
        .expect("widget pattern is valid")
});

/// Finds the `(slug, payload-or-url)` pair inside emitted unlock widget markup.
pub fn extract_from_markup(html: &str) -> Option<(String, String)> {
    let caps = WIDGET_REGEX.captures(html)?;
    let slug = unescape_js(&unescape_html(caps.get(1)?.as_str()));
    let arg = unescape_js(&unescape_html(caps.get(2)?.as_str()));
    Some((slug, arg))
}

fn unescape_html(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn unescape_js(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IvLedger;

    fn sample(password: &str) -> (EncryptedPayload, DerivedKey) {
        let salt = crypto::random_salt();
        let key = crypto::derive_key(password, &salt, 1_000);
        let mut ledger = IvLedger::new();
        let body = crypto::seal(&key, b"<p>body</p>", &mut ledger).unwrap();
        let img = crypto::seal(&key, &[0x89, 0x50], &mut ledger).unwrap();

        let mut imgs = BTreeMap::new();
        imgs.insert("img0".to_string(), SealedImage::from_chunk(&img, "image/png"));
        (EncryptedPayload::new(&body, &salt, 1_000, imgs), key)
    }

    #[test]
    fn json_has_wire_field_names_in_order() {
        let (payload, _) = sample("pw");
        let json = payload.to_json().unwrap();
        assert!(json.starts_with("{\"ct\":\""), "{json}");

        // Top-level keys after the nested image map.
        let imgs_at = json.find(",\"imgs\":{\"img0\":{").unwrap();
        let imgs_end = imgs_at + json[imgs_at..].find("}},").unwrap() + 3;
        let tail = &json[imgs_end..];
        let positions: Vec<_> = ["\"s\":", "\"iv\":", "\"at\":", "\"i\":"]
            .iter()
            .map(|k| tail.find(k).unwrap())
            .collect();
        assert_eq!(positions[0], 0, "{json}");
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{json}");

        let image = &json[imgs_at..imgs_end];
        assert!(image.contains("\"m\":\"image/png\""));
    }

    #[test]
    fn empty_images_are_omitted() {
        let (mut payload, _) = sample("pw");
        payload.imgs.clear();
        assert!(!payload.to_json().unwrap().contains("imgs"));

        let parsed = EncryptedPayload::parse(&payload.encode().unwrap()).unwrap();
        assert!(parsed.imgs.is_empty());
    }

    #[test]
    fn parse_accepts_base64_and_raw_json() {
        let (payload, _) = sample("pw");
        assert_eq!(EncryptedPayload::parse(&payload.encode().unwrap()).unwrap(), payload);
        assert_eq!(EncryptedPayload::parse(&payload.to_json().unwrap()).unwrap(), payload);
    }

    #[test]
    fn missing_salt_is_rejected() {
        let json = r#"{"ct":"","iv":"AAAAAAAAAAAAAAAAAAAAAA==","at":"AAAAAAAAAAAAAAAAAAAAAA==","i":1}"#;
        let err = EncryptedPayload::parse(json).unwrap_err();
        assert!(matches!(err, PayloadError::Json(_)));
    }

    #[test]
    fn short_iv_is_rejected() {
        let (mut payload, _) = sample("pw");
        payload.iv = STANDARD.encode([0u8; 12]);
        let err = payload.validate().unwrap_err();
        assert!(matches!(err, PayloadError::FieldLength { expected: 16, actual: 12, .. }));
    }

    #[test]
    fn zero_iterations_are_rejected() {
        let (mut payload, _) = sample("pw");
        payload.i = 0;
        assert!(matches!(payload.validate(), Err(PayloadError::ZeroIterations)));
    }

    #[test]
    fn runaway_iteration_count_is_rejected() {
        let (mut payload, _) = sample("pw");
        payload.i = u32::MAX;
        assert!(matches!(
            payload.validate(),
            Err(PayloadError::TooManyIterations(u32::MAX))
        ));

        payload.i = MAX_ITERATIONS;
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn image_without_mime_is_rejected() {
        let (mut payload, _) = sample("pw");
        payload.imgs.get_mut("img0").unwrap().m = String::new();
        assert!(matches!(payload.validate(), Err(PayloadError::MissingMime(id)) if id == "img0"));
    }

    #[test]
    fn body_and_image_open_with_the_same_key() {
        let (payload, key) = sample("pw");
        assert_eq!(payload.open_body(&key).unwrap(), "<p>body</p>");

        let image = payload.imgs["img0"].open(&key).unwrap();
        assert_eq!(image.bytes, vec![0x89, 0x50]);
        assert_eq!(image.data_uri(), "data:image/png;base64,iVA=");
    }

    #[test]
    fn rederived_key_opens_payload() {
        let (payload, _) = sample("pw");
        let key = payload.derive_key("pw").unwrap();
        assert!(payload.open_body(&key).is_ok());

        let wrong = payload.derive_key("nope").unwrap();
        assert!(payload.open_body(&wrong).is_err());
        assert!(payload.imgs["img0"].open(&wrong).is_err());
    }

    #[test]
    fn extracts_slug_and_payload_from_markup() {
        let html = r#"<div class="encrypted-post" x-data="encryptedPost('it\'s-mine', 'eyJjdCI6')">"#;
        let (slug, arg) = extract_from_markup(html).unwrap();
        assert_eq!(slug, "it's-mine");
        assert_eq!(arg, "eyJjdCI6");
        assert!(extract_from_markup("<p>plain</p>").is_none());
    }
}
