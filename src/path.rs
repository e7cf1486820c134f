// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Addresses of locations within a document.
//!
//! A [`Path`] is an ordered sequence of segments. Object members are addressed by key, array
//! elements by their decimal index, and the special segment [`APPEND`] (`"-"`) addresses the end
//! of an array (the last element for reads, the position past it for inserts).
//!
//! Paths are written either as a `/`-delimited string or as a list of raw segments; both forms are
//! accepted wherever a path is expected, including when deserializing operations:
//!
//! ```rust
//! # use patchsync::{Path, path};
//! let from_str: Path = "/planet/earth/name".parse().unwrap();
//! let from_segments = Path::from(["planet", "earth", "name"]);
//! assert_eq!(from_str, from_segments);
//! assert_eq!(from_str, path!("planet", "earth", "name"));
//! assert_eq!(from_str.to_string(), "/planet/earth/name");
//! ```
//!
//! Segments are taken verbatim. Unlike RFC 6901 pointers, `~0`/`~1` escapes are not decoded, so
//! keys containing `/` can only be addressed through the segment form.
use serde::{Deserialize, Serialize, Serializer};
use smallvec::SmallVec;
use std::{convert::Infallible, fmt, str::FromStr};

/// The segment addressing the end of an array.
pub const APPEND: &str = "-";

/// An ordered sequence of segments addressing a location within a document.
///
/// The empty path addresses the document root.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(from = "PathRepr")]
pub struct Path {
    segments: SmallVec<[String; 4]>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PathRepr {
    Pointer(String),
    Segments(Vec<String>),
}

impl From<PathRepr> for Path {
    fn from(repr: PathRepr) -> Self {
        match repr {
            PathRepr::Pointer(pointer) => Path::parse(&pointer),
            PathRepr::Segments(segments) => Path::from(segments),
        }
    }
}

/// Serializes as a `/`-delimited string, or as a list of segments if the string form would not
/// parse back into the same path.
impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self
            .segments
            .iter()
            .any(|segment| segment.is_empty() || segment.contains('/'))
        {
            serializer.collect_seq(&self.segments)
        } else {
            serializer.collect_str(self)
        }
    }
}

impl Path {
    /// The path addressing the document root.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses a `/`-delimited path. A leading `/` is optional; `""` and `"/"` denote the root.
    pub fn parse(pointer: &str) -> Self {
        let pointer = pointer.strip_prefix('/').unwrap_or(pointer);
        if pointer.is_empty() {
            return Self::root();
        }
        pointer.split('/').map(str::to_owned).collect()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The last segment, or `None` for the root.
    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The segment at `index`, if any.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    /// Splits off the last segment, returning the parent segments and the last segment.
    ///
    /// Returns `None` for the root.
    pub fn split_last(&self) -> Option<(&[String], &str)> {
        self.segments
            .split_last()
            .map(|(last, parent)| (parent, last.as_str()))
    }

    pub fn push(&mut self, segment: impl Into<String>) {
        self.segments.push(segment.into());
    }

    /// Returns a new path with `segment` appended.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut child = self.clone();
        child.push(segment);
        child
    }

    /// Returns a new path with all `segments` appended.
    pub fn join<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut joined = self.clone();
        joined.extend(segments.into_iter().map(Into::into));
        joined
    }

    /// Returns true if `prefix` addresses this path or one of its ancestors.
    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.segments.starts_with(&prefix.segments)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({self})")
    }
}

impl FromStr for Path {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Path::parse(s))
    }
}

impl From<&str> for Path {
    fn from(pointer: &str) -> Self {
        Path::parse(pointer)
    }
}

impl From<Vec<String>> for Path {
    fn from(segments: Vec<String>) -> Self {
        Self {
            segments: SmallVec::from_vec(segments),
        }
    }
}

impl From<&[String]> for Path {
    fn from(segments: &[String]) -> Self {
        segments.iter().cloned().collect()
    }
}

impl<const N: usize> From<[&str; N]> for Path {
    fn from(segments: [&str; N]) -> Self {
        segments.into_iter().map(str::to_owned).collect()
    }
}

impl FromIterator<String> for Path {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            segments: iter.into_iter().collect(),
        }
    }
}

impl Extend<String> for Path {
    fn extend<I: IntoIterator<Item = String>>(&mut self, iter: I) {
        self.segments.extend(iter);
    }
}

impl<'a> IntoIterator for &'a Path {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        assert_eq!(Path::parse("/a/b"), Path::from(["a", "b"]));
        assert_eq!(Path::parse("a/b"), Path::from(["a", "b"]));
        assert!(Path::parse("").is_root());
        assert!(Path::parse("/").is_root());
        assert_eq!(Path::parse("/a/-").last(), Some(APPEND));
        // an empty key is still a segment
        assert_eq!(Path::parse("/a/").segments(), ["a", ""]);
    }

    #[test]
    fn display() {
        assert_eq!(Path::root().to_string(), "/");
        assert_eq!(Path::from(["planet", "1"]).to_string(), "/planet/1");
    }

    #[test]
    fn navigation() {
        let path = Path::from(["planet", "1", "__rel", "moons"]);
        let (parent, last) = path.split_last().unwrap();
        assert_eq!(parent, ["planet", "1", "__rel"]);
        assert_eq!(last, "moons");
        assert_eq!(path.get(1), Some("1"));
        assert!(path.starts_with(&Path::from(["planet", "1"])));
        assert!(!Path::from(["planet"]).starts_with(&path));
        assert_eq!(
            Path::from(["planet"]).join(["1", "name"]),
            Path::from(["planet", "1", "name"])
        );
        assert_eq!(Path::root().child("planet"), Path::from(["planet"]));
        assert!(Path::root().split_last().is_none());
    }

    #[test]
    fn serde_accepts_both_forms() {
        let from_str: Path = serde_json::from_str(r#""/planet/1""#).unwrap();
        let from_list: Path = serde_json::from_str(r#"["planet", "1"]"#).unwrap();
        assert_eq!(from_str, from_list);
        assert_eq!(serde_json::to_string(&from_list).unwrap(), r#""/planet/1""#);
    }

    #[test]
    fn serde_keeps_segments_containing_slashes() {
        let path = Path::from(["planet", "1", "__rev", "/moon/2/__rel/planet"]);
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, r#"["planet","1","__rev","/moon/2/__rel/planet"]"#);
        assert_eq!(serde_json::from_str::<Path>(&json).unwrap(), path);
        let root: Path = serde_json::from_str(&serde_json::to_string(&Path::root()).unwrap()).unwrap();
        assert!(root.is_root());
    }
}
