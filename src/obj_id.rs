//! `ObjId` — either a non-empty opaque string or the distinguished root
//! sentinel.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjId {
    Root,
    Id(String),
}

impl ObjId {
    pub fn parse(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            None
        } else {
            Some(ObjId::Id(raw))
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, ObjId::Root)
    }

    /// Stable string form used as a map key and as a folder-name component.
    pub fn as_str(&self) -> &str {
        match self {
            ObjId::Root => ROOT_KEY,
            ObjId::Id(s) => s,
        }
    }
}

/// Reserved key for the root object — never a valid user-supplied id since
/// `ObjId::parse` rejects the empty string.
const ROOT_KEY: &str = "";

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjId::Root => write!(f, "<root>"),
            ObjId::Id(s) => write!(f, "{s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_empty() {
        assert!(ObjId::parse("").is_none());
    }

    #[test]
    fn parse_accepts_nonempty() {
        assert_eq!(ObjId::parse("obj-A"), Some(ObjId::Id("obj-A".to_string())));
    }

    #[test]
    fn root_is_root() {
        assert!(ObjId::Root.is_root());
        assert!(!ObjId::parse("obj-A").unwrap().is_root());
    }

    #[test]
    fn root_key_never_collides_with_parsed_id() {
        assert!(ObjId::parse(ROOT_KEY).is_none());
    }
}
