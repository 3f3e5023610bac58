//! Process-wide named-encoding registry.
//!
//! Spec §3 tags every `String` node with a named encoding; §5 lists the
//! encoding registry among the core's process-wide singletons,
//! constructed lazily on first use. This is a deliberately small registry
//! (utf-8, ascii, latin1) rather than a full multi-byte conversion
//! library — conversion libraries are an external collaborator per
//! spec.md's Non-goals.

use crate::error::ValueError;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Utf8,
    Ascii,
    Latin1,
}

impl Encoding {
    pub fn tag(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Ascii => "ascii",
            Encoding::Latin1 => "iso-8859-1",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Encoding::Utf8),
            "ascii" | "us-ascii" => Some(Encoding::Ascii),
            "iso-8859-1" | "latin1" | "latin-1" => Some(Encoding::Latin1),
            _ => None,
        }
    }

    /// Re-encodes `bytes` (assumed valid in `self`) into `target`, failing
    /// if a character is unrepresentable in the target encoding.
    pub fn convert(self, bytes: &[u8], target: Encoding) -> Result<Vec<u8>, ValueError> {
        if self == target {
            return Ok(bytes.to_vec());
        }
        let text = match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Ascii | Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        };
        match target {
            Encoding::Utf8 => Ok(text.into_bytes()),
            Encoding::Ascii => {
                if text.chars().all(|c| c.is_ascii()) {
                    Ok(text.bytes().collect())
                } else {
                    Err(ValueError::EncodingConversion {
                        from: self.tag().to_string(),
                        to: target.tag().to_string(),
                        reason: "non-ASCII character in input".to_string(),
                    })
                }
            }
            Encoding::Latin1 => {
                if text.chars().all(|c| (c as u32) <= 0xFF) {
                    Ok(text.chars().map(|c| c as u8).collect())
                } else {
                    Err(ValueError::EncodingConversion {
                        from: self.tag().to_string(),
                        to: target.tag().to_string(),
                        reason: "character outside Latin-1 range".to_string(),
                    })
                }
            }
        }
    }
}

/// Process-wide set of known encoding tags, seeded with the built-ins and
/// extensible by an embedder registering a custom tag name.
pub struct EncodingRegistry {
    known: RwLock<HashSet<String>>,
}

static REGISTRY: Lazy<EncodingRegistry> = Lazy::new(EncodingRegistry::new);

impl EncodingRegistry {
    fn new() -> Self {
        let mut known = HashSet::new();
        known.insert(Encoding::Utf8.tag().to_string());
        known.insert(Encoding::Ascii.tag().to_string());
        known.insert(Encoding::Latin1.tag().to_string());
        Self {
            known: RwLock::new(known),
        }
    }

    pub fn global() -> &'static EncodingRegistry {
        &REGISTRY
    }

    pub fn register(&self, tag: impl Into<String>) -> Result<(), ValueError> {
        let tag = tag.into();
        let mut known = self.known.write().expect("encoding registry poisoned");
        if known.contains(&tag) {
            return Err(ValueError::DuplicateEncoding { tag });
        }
        known.insert(tag);
        Ok(())
    }

    pub fn is_known(&self, tag: &str) -> bool {
        self.known.read().expect("encoding registry poisoned").contains(tag)
    }
}
