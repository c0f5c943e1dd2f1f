//! Node path codec.
//!
//! A node path is `/index:key/index:key/...`: one segment per level, where
//! `index` is the position of the child mapping in the parent's definition and
//! `key` is the folder name or the displayed item's key. Keys are escaped so
//! that `/` and `:` never appear raw inside a segment.

use std::fmt;

use crate::core::tree::TreeError;

/// One `index:key` step of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    /// Child mapping index.
    pub index: usize,
    /// Unescaped key.
    pub key: String,
}

/// # Node Path
///
/// Escaped path string; the root is the empty path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePath(String);

impl NodePath {
    /// The (invisible) tree root.
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Whether this is the root.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The escaped path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of the child produced by mapping `index` for `key`.
    pub fn child(&self, index: usize, key: &str) -> NodePath {
        NodePath(format!("{}/{}:{}", self.0, index, escape(key)))
    }

    /// Parses and validates a path string.
    pub fn parse(raw: &str) -> Result<NodePath, TreeError> {
        if raw.is_empty() {
            return Ok(Self::root());
        }
        let rest = raw
            .strip_prefix('/')
            .ok_or_else(|| TreeError::BadPath(raw.to_string()))?;
        for segment in rest.split('/') {
            parse_segment(segment).ok_or_else(|| TreeError::BadPath(raw.to_string()))?;
        }
        Ok(NodePath(raw.to_string()))
    }

    /// Decoded segments, root first.
    pub fn segments(&self) -> Vec<PathSegment> {
        if self.is_root() {
            return Vec::new();
        }
        self.0[1..].split('/').filter_map(parse_segment).collect()
    }

    /// The last segment.
    pub fn last(&self) -> Option<PathSegment> {
        let (_, segment) = self.0.rsplit_once('/')?;
        parse_segment(segment)
    }

    /// Enclosing path; `None` for the root. Root-level nodes have the root as
    /// their parent.
    pub fn parent(&self) -> Option<NodePath> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| NodePath(parent.to_string()))
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.0.matches('/').count()
    }

    /// Whether `self` lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &NodePath) -> bool {
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(&ancestor.0)
            && self.0.as_bytes()[ancestor.0.len()] == b'/'
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            f.write_str(&self.0)
        }
    }
}

fn parse_segment(segment: &str) -> Option<PathSegment> {
    let (index, key) = segment.split_once(':')?;
    Some(PathSegment {
        index: index.parse().ok()?,
        key: unescape(key)?,
    })
}

fn escape(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            ':' => out.push_str("%3A"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(raw: &str) -> Option<String> {
    if raw.contains(':') {
        return None;
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let code = rest.get(at + 1..at + 3)?;
        out.push(match code {
            "25" => '%',
            "2F" => '/',
            "3A" => ':',
            _ => return None,
        });
        rest = &rest[at + 3..];
    }
    out.push_str(rest);
    Some(out)
}
