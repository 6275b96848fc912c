use serde_json::Value as JsonValue;

use crate::{ErrorKind, ReplicantError};

/// Slash-rooted locator into a value tree. `/` in keys is escaped as `~1`
/// and `~` as `~0`; the root pointer renders as `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Pointer {
    segments: Vec<String>,
}

impl Pointer {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn parse(raw: &str) -> Result<Self, ReplicantError> {
        if raw.is_empty() || raw == "/" {
            return Ok(Self::root());
        }
        let Some(rest) = raw.strip_prefix('/') else {
            return Err(ReplicantError::new(
                ErrorKind::Internal,
                format!("invalid path '{raw}': missing leading slash"),
            ));
        };
        let segments = rest
            .split('/')
            .map(unescape_segment)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }

    pub fn render(&self) -> String {
        if self.segments.is_empty() {
            return "/".to_string();
        }
        let mut out = String::new();
        for segment in &self.segments {
            out.push('/');
            out.push_str(&escape_segment(segment));
        }
        out
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// True when `self` is `other` or a descendant of `other`.
    pub fn is_under(&self, other: &Pointer) -> bool {
        self.segments.len() >= other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }

    pub fn resolve<'a>(&self, value: &'a JsonValue) -> Option<&'a JsonValue> {
        let mut current = value;
        for segment in &self.segments {
            current = match current {
                JsonValue::Object(map) => map.get(segment)?,
                JsonValue::Array(items) => items.get(parse_index(segment)?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn resolve_mut<'a>(&self, value: &'a mut JsonValue) -> Option<&'a mut JsonValue> {
        let mut current = value;
        for segment in &self.segments {
            current = match current {
                JsonValue::Object(map) => map.get_mut(segment)?,
                JsonValue::Array(items) => {
                    let index = parse_index(segment)?;
                    items.get_mut(index)?
                }
                _ => return None,
            };
        }
        Some(current)
    }
}

impl std::fmt::Display for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

pub(crate) fn parse_index(segment: &str) -> Option<usize> {
    // Leading zeros and signs are not valid array indices.
    if segment.len() > 1 && segment.starts_with('0') {
        return None;
    }
    segment.parse::<usize>().ok()
}

pub(crate) fn escape_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

pub(crate) fn unescape_segment(segment: &str) -> Result<String, ReplicantError> {
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars();
    while let Some(ch) = chars.next() {
        if ch == '~' {
            match chars.next() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                _ => {
                    return Err(ReplicantError::new(
                        ErrorKind::Internal,
                        format!("invalid path segment '{segment}'"),
                    ))
                }
            }
        } else {
            out.push(ch);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn root_renders_as_single_slash() {
        assert_eq!(Pointer::root().render(), "/");
        assert_eq!(Pointer::parse("/").unwrap(), Pointer::root());
        assert_eq!(Pointer::parse("").unwrap(), Pointer::root());
    }

    #[test]
    fn escapes_slash_and_tilde_in_keys() {
        let pointer = Pointer::root().child("a/b").child("c~d");
        assert_eq!(pointer.render(), "/a~1b/c~0d");

        let parsed = Pointer::parse("/a~1b/c~0d").unwrap();
        assert_eq!(parsed.segments(), ["a/b", "c~d"]);
    }

    #[test]
    fn rejects_dangling_escape_and_missing_slash() {
        assert!(Pointer::parse("/a~").is_err());
        assert!(Pointer::parse("/a~2b").is_err());
        assert!(Pointer::parse("a/b").is_err());
    }

    #[test]
    fn resolves_through_objects_and_arrays() {
        let value = json!({"a": {"b": [1, {"c": 2}]}});
        let pointer = Pointer::parse("/a/b/1/c").unwrap();
        assert_eq!(pointer.resolve(&value), Some(&json!(2)));

        assert_eq!(Pointer::parse("/a/b/9").unwrap().resolve(&value), None);
        assert_eq!(Pointer::parse("/a/b/01").unwrap().resolve(&value), None);
    }

    #[test]
    fn is_under_covers_self_and_descendants() {
        let base = Pointer::parse("/a/b").unwrap();
        assert!(Pointer::parse("/a/b").unwrap().is_under(&base));
        assert!(Pointer::parse("/a/b/c").unwrap().is_under(&base));
        assert!(!Pointer::parse("/a").unwrap().is_under(&base));
        assert!(!Pointer::parse("/a/bc").unwrap().is_under(&base));
        assert!(Pointer::parse("/a/b").unwrap().is_under(&Pointer::root()));
    }
}
