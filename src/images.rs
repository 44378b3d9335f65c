//! # Image Discovery
//!
//! Finds `<img ... src="...">` tags in rendered HTML with a regular expression
//! (not an HTML parser) and rewrites them through a list of splices.
//!
//! Splices carry byte offsets into the original text. They are applied from
//! the highest offset to the lowest so that every pending splice still points
//! at the bytes it was computed against.

use regex::Regex;
use std::sync::LazyLock;

/// Fixed 1×1 transparent GIF shown until an image is decrypted.
pub const PLACEHOLDER_SRC: &str =
    "data:image/gif;base64,R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7";

/// Attribute carrying the opaque image id on a placeholder tag.
pub const ENC_ID_ATTR: &str = "data-enc-id";

static IMG_TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img([^>]*)src=["']([^"']+)["']([^>]*)>"#)
        .expect("img pattern is valid")
});

static ENC_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:^|\s)data-enc-id=["']([^"']+)["']"#)
        .expect("placeholder pattern is valid")
});

/// One `<img>` occurrence in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Byte offset of the tag's `<`.
    pub index: usize,
    /// Byte length of the whole tag.
    pub length: usize,
    pub src: String,
    /// Attributes between `<img` and `src=`.
    pub prefix: String,
    /// Attributes between the closing quote of `src` and `>`.
    pub suffix: String,
}

impl ImageReference {
    /// The `data-enc-id` of a placeholder tag, if this is one.
    pub fn enc_id(&self) -> Option<&str> {
        [self.prefix.as_str(), self.suffix.as_str()]
            .into_iter()
            .find_map(|attrs| ENC_ID_REGEX.captures(attrs)?.get(1))
            .map(|m| m.as_str())
    }
}

/// Returns every image tag in `html`, in document order.
pub fn find_images(html: &str) -> Vec<ImageReference> {
    IMG_TAG_REGEX
        .captures_iter(html)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(ImageReference {
                index: whole.start(),
                length: whole.len(),
                src: caps.get(2)?.as_str().to_string(),
                prefix: caps.get(1).map_or("", |m| m.as_str()).to_string(),
                suffix: caps.get(3).map_or("", |m| m.as_str()).to_string(),
            })
        })
        .collect()
}

/// Builds the stand-in tag for an encrypted image, keeping its other attributes.
pub fn placeholder_tag(reference: &ImageReference, id: &str) -> String {
    format!(
        r#"<img{}src="{PLACEHOLDER_SRC}" {ENC_ID_ATTR}="{id}"{}>"#,
        reference.prefix, reference.suffix
    )
}

/// Builds a tag that displays `src` in place of `reference`.
pub fn replacement_tag(reference: &ImageReference, src: &str) -> String {
    format!(r#"<img{}src="{src}"{}>"#, reference.prefix, reference.suffix)
}

/// Returns the placeholder ids present in a decrypted body, in document order.
pub fn placeholder_ids(html: &str) -> Vec<String> {
    find_images(html)
        .iter()
        .filter_map(|r| r.enc_id().map(String::from))
        .collect()
}

/// A pending text replacement: `length` bytes at `offset` become `replacement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Splice {
    pub offset: usize,
    pub length: usize,
    pub replacement: String,
}

impl Splice {
    pub fn over(reference: &ImageReference, replacement: String) -> Self {
        Self {
            offset: reference.index,
            length: reference.length,
            replacement,
        }
    }
}

/// Applies splices right-to-left.
///
/// Offsets refer to `text` as passed in. Splices must not overlap; ones that
/// run past the end of the text or off a char boundary are skipped.
pub fn apply_splices(text: &str, mut splices: Vec<Splice>) -> String {
    splices.sort_by(|a, b| b.offset.cmp(&a.offset));

    let mut out = text.to_string();
    for splice in splices {
        let end = splice.offset + splice.length;
        if end > out.len() || !out.is_char_boundary(splice.offset) || !out.is_char_boundary(end) {
            tracing::debug!(offset = splice.offset, "skipping out-of-range splice");
            continue;
        }
        out.replace_range(splice.offset..end, &splice.replacement);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_tags_with_surrounding_attributes() {
        let html = r#"<p>a</p><img class="wide" src='/x.png' alt="x"><IMG SRC="y.jpg">"#;
        let refs = find_images(html);
        assert_eq!(refs.len(), 2);

        assert_eq!(refs[0].src, "/x.png");
        assert_eq!(refs[0].prefix, r#" class="wide" "#);
        assert_eq!(refs[0].suffix, r#" alt="x""#);
        let first = &html[refs[0].index..refs[0].index + refs[0].length];
        assert_eq!(first, r#"<img class="wide" src='/x.png' alt="x">"#);

        assert_eq!(refs[1].src, "y.jpg");
        assert!(refs[1].index > refs[0].index);
    }

    #[test]
    fn ignores_images_without_src() {
        assert!(find_images(r#"<img alt="nothing">"#).is_empty());
    }

    #[test]
    fn placeholder_keeps_attributes_and_id() {
        let html = r#"<img src="/a.png">"#;
        let reference = &find_images(html)[0];
        let tag = placeholder_tag(reference, "img0");
        assert_eq!(
            tag,
            format!(r#"<img src="{PLACEHOLDER_SRC}" data-enc-id="img0">"#)
        );
        assert_eq!(placeholder_ids(&tag), vec!["img0".to_string()]);
    }

    #[test]
    fn splices_apply_right_to_left_with_changing_lengths() {
        // Tags at 10, 50 and 120, each replaced with a differently sized string.
        let mut text = String::new();
        text.push_str(&"a".repeat(10));
        text.push_str("<img src=\"1\">");
        while text.len() < 50 {
            text.push('b');
        }
        text.push_str("<img src=\"2\">");
        while text.len() < 120 {
            text.push('c');
        }
        text.push_str("<img src=\"3\">");
        text.push_str("tail");

        let refs = find_images(&text);
        assert_eq!(
            refs.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![10, 50, 120]
        );

        // Deliberately supplied in forward order.
        let splices = vec![
            Splice::over(&refs[0], "[ONE-LONGER-THAN-ORIGINAL]".into()),
            Splice::over(&refs[1], "2".into()),
            Splice::over(&refs[2], "[three]".into()),
        ];
        let out = apply_splices(&text, splices);

        let expected = format!(
            "{}[ONE-LONGER-THAN-ORIGINAL]{}2{}[three]tail",
            "a".repeat(10),
            "b".repeat(50 - 10 - 13),
            "c".repeat(120 - 50 - 13),
        );
        assert_eq!(out, expected);
    }

    #[test]
    fn out_of_range_splice_is_skipped() {
        let out = apply_splices(
            "short",
            vec![Splice {
                offset: 3,
                length: 10,
                replacement: "x".into(),
            }],
        );
        assert_eq!(out, "short");
    }

    #[test]
    fn ordinary_tags_have_no_enc_id() {
        let refs = find_images(r#"<img data-enc-idx="no" src="/a.png">"#);
        assert_eq!(refs[0].enc_id(), None);
    }

    #[test]
    fn placeholder_ids_in_document_order() {
        let html = format!(
            r#"<img src="{p}" data-enc-id="b"><p>t</p><img alt="" src="{p}" data-enc-id="a">"#,
            p = PLACEHOLDER_SRC
        );
        assert_eq!(placeholder_ids(&html), vec!["b", "a"]);
    }
}
