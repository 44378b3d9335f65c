//! # Post Records
//!
//! A post as handed over by the site pipeline right after markdown rendering.
//! Fields the sealer does not know about are carried through untouched in
//! [`Post::extra`] so the pipeline gets back exactly what it sent, minus the
//! password.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Excerpt shown in listings and feeds for sealed posts.
pub const PROTECTED_EXCERPT: &str = "<p>This post has been password protected.</p>";

/// A rendered post.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Post {
    #[serde(default)]
    pub title: String,

    /// Document identifier, used in the unlock widget and payload URLs.
    #[serde(default)]
    pub slug: String,

    /// Rendered HTML.
    #[serde(default)]
    pub content: String,

    /// Literal password, or `env:NAME`. Removed once the post is sealed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Directory holding this post's own assets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,

    /// "Read more" teaser content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub more: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encrypted: bool,

    /// Any other front matter.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Post {
    /// Name used in log lines: the title, or the slug if untitled.
    pub fn label(&self) -> &str {
        if self.title.is_empty() {
            &self.slug
        } else {
            &self.title
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("failed to serialize post: {e}"))
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).map_err(|e| anyhow::anyhow!("failed to parse post: {e}"))
    }
}

/// Reads a post record from disk.
pub fn load_post(path: &Path) -> anyhow::Result<Post> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    Post::from_json(&json).map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))
}

/// Writes a post record, creating parent directories as needed.
pub fn save_post(path: &Path, post: &Post) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, post.to_json()?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_front_matter_round_trips() {
        let json = r#"{
            "title": "Diary",
            "slug": "diary",
            "content": "<p>x</p>",
            "password": "pw",
            "tags": ["private"],
            "date": "2024-05-01"
        }"#;
        let post = Post::from_json(json).unwrap();
        assert_eq!(post.password.as_deref(), Some("pw"));
        assert_eq!(post.extra["tags"], serde_json::json!(["private"]));

        let back = Post::from_json(&post.to_json().unwrap()).unwrap();
        assert_eq!(back, post);
    }

    #[test]
    fn absent_optionals_are_not_written() {
        let post = Post {
            slug: "s".into(),
            content: "c".into(),
            ..Post::default()
        };
        let json = post.to_json().unwrap();
        assert!(!json.contains("password"));
        assert!(!json.contains("encrypted"));
    }

    #[test]
    fn label_falls_back_to_slug() {
        let post = Post {
            slug: "untitled-post".into(),
            ..Post::default()
        };
        assert_eq!(post.label(), "untitled-post");
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/post.json");
        let post = Post {
            title: "T".into(),
            slug: "t".into(),
            content: "<p>t</p>".into(),
            ..Post::default()
        };
        save_post(&path, &post).unwrap();
        assert_eq!(load_post(&path).unwrap(), post);
    }
}
