//! Node content values.
//!
//! `Content` is a closed set of variants. Its JSON form (internally tagged by
//! `"type"`, camelCase fields, absent optionals omitted) is the form that gets
//! canonicalized and hashed, so field names here are part of the hash chain.
//!
//! Binary media is never inlined: image and audio variants carry an opaque
//! `mediaRef` into external storage.

use crate::primitives::{MAX_LABEL_LENGTH, MAX_MIXED_BLOCKS, MAX_TEXT_LENGTH};
use crate::types::LoomError;
use serde::{Deserialize, Serialize};

/// Image payload stored by reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageContent {
    pub media_ref: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Audio payload stored by reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioContent {
    pub media_ref: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

/// One block of a mixed content value. Cannot itself be mixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    Image(ImageContent),
    Audio(AudioContent),
}

/// The payload of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text { text: String },
    Image(ImageContent),
    Audio(AudioContent),
    Mixed { blocks: Vec<ContentBlock> },
}

impl Content {
    /// Plain text content.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Short lowercase name of the variant.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image(_) => "image",
            Self::Audio(_) => "audio",
            Self::Mixed { .. } => "mixed",
        }
    }

    /// Check size limits and required fields.
    pub fn validate(&self) -> Result<(), LoomError> {
        match self {
            Self::Text { text } => validate_text(text),
            Self::Image(image) => validate_image(image),
            Self::Audio(audio) => validate_audio(audio),
            Self::Mixed { blocks } => {
                if blocks.is_empty() {
                    return Err(LoomError::Validation(
                        "mixed content needs at least one block".into(),
                    ));
                }
                if blocks.len() > MAX_MIXED_BLOCKS {
                    return Err(LoomError::Validation(format!(
                        "mixed content has {} blocks (max {})",
                        blocks.len(),
                        MAX_MIXED_BLOCKS
                    )));
                }
                blocks.iter().try_for_each(|block| match block {
                    ContentBlock::Text { text } => validate_text(text),
                    ContentBlock::Image(image) => validate_image(image),
                    ContentBlock::Audio(audio) => validate_audio(audio),
                })
            }
        }
    }

    /// Flatten to text for prompt assembly.
    ///
    /// Media without a textual stand-in renders as a bracketed placeholder.
    #[must_use]
    pub fn render_text(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Image(image) => render_image(image),
            Self::Audio(audio) => render_audio(audio),
            Self::Mixed { blocks } => blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => text.clone(),
                    ContentBlock::Image(image) => render_image(image),
                    ContentBlock::Audio(audio) => render_audio(audio),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

fn validate_text(text: &str) -> Result<(), LoomError> {
    if text.len() > MAX_TEXT_LENGTH {
        return Err(LoomError::Validation(format!(
            "text content is {} bytes (max {})",
            text.len(),
            MAX_TEXT_LENGTH
        )));
    }
    Ok(())
}

fn validate_media_ref(media_ref: &str, mime_type: &str) -> Result<(), LoomError> {
    if media_ref.trim().is_empty() {
        return Err(LoomError::Validation("media reference is empty".into()));
    }
    if mime_type.trim().is_empty() || !mime_type.contains('/') {
        return Err(LoomError::Validation(format!(
            "invalid mime type '{}'",
            mime_type
        )));
    }
    if media_ref.len() > MAX_LABEL_LENGTH * 4 {
        return Err(LoomError::Validation("media reference too long".into()));
    }
    Ok(())
}

fn validate_image(image: &ImageContent) -> Result<(), LoomError> {
    validate_media_ref(&image.media_ref, &image.mime_type)?;
    if let Some(alt) = &image.alt_text {
        validate_text(alt)?;
    }
    Ok(())
}

fn validate_audio(audio: &AudioContent) -> Result<(), LoomError> {
    validate_media_ref(&audio.media_ref, &audio.mime_type)?;
    if let Some(transcript) = &audio.transcript {
        validate_text(transcript)?;
    }
    Ok(())
}

fn render_image(image: &ImageContent) -> String {
    match &image.alt_text {
        Some(alt) => format!("[image: {}]", alt),
        None => format!("[image: {}]", image.media_ref),
    }
}

fn render_audio(audio: &AudioContent) -> String {
    match &audio.transcript {
        Some(transcript) => transcript.clone(),
        None => format!("[audio: {}]", audio.media_ref),
    }
}

/// Serde adapter for `Content` inside stored records.
///
/// Human-readable formats get the tagged JSON object. Binary formats (postcard)
/// cannot decode internally tagged enums or skipped fields, so they get the
/// JSON text as a string instead.
pub(crate) mod storage_repr {
    use super::Content;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(content: &Content, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            content.serialize(serializer)
        } else {
            let json = serde_json::to_string(content).map_err(serde::ser::Error::custom)?;
            serializer.serialize_str(&json)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Content, D::Error> {
        if deserializer.is_human_readable() {
            Content::deserialize(deserializer)
        } else {
            let json = String::deserialize(deserializer)?;
            serde_json::from_str(&json).map_err(serde::de::Error::custom)
        }
    }
}
