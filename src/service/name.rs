//! # Hierarchical service names.
//!
//! A [`ServiceName`] is a non-empty sequence of segments. The canonical text form
//! joins segments with `.`; a segment containing `.`, `"` or `\` (or an empty one)
//! is written in double quotes with `\"` and `\\` escapes:
//!
//! ```text
//! ServiceName::of("net").append("listener").append("http.8080")
//!     ──► net.listener."http.8080"
//! ```
//!
//! Names order segment by segment; a parent sorts before its children.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::ContainerError;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ServiceName {
    segments: Arc<[Arc<str>]>,
}

impl ServiceName {
    /// A single-segment name.
    pub fn of(segment: impl Into<Arc<str>>) -> Self {
        Self {
            segments: Arc::from(vec![segment.into()]),
        }
    }

    /// Builds a name from its segments, `None` when there are none.
    pub fn from_segments<I, S>(segments: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        let segments: Vec<Arc<str>> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            None
        } else {
            Some(Self {
                segments: Arc::from(segments),
            })
        }
    }

    /// Parses the canonical text form.
    ///
    /// # Example
    /// ```
    /// use svcgraph::ServiceName;
    ///
    /// let name = ServiceName::parse(r#"net."http.8080""#).unwrap();
    /// assert_eq!(name.segments().len(), 2);
    /// assert_eq!(name.simple_name(), "http.8080");
    /// assert!(ServiceName::parse("a..b").is_err());
    /// ```
    pub fn parse(input: &str) -> Result<Self, ContainerError> {
        let invalid = |reason| ContainerError::InvalidName {
            input: input.to_string(),
            reason,
        };

        let mut segments: Vec<Arc<str>> = Vec::new();
        let mut chars = input.chars().peekable();
        loop {
            let mut segment = String::new();
            if chars.peek() == Some(&'"') {
                chars.next();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => segment.push(c),
                            _ => return Err(invalid("bad escape in quoted segment")),
                        },
                        Some(c) => segment.push(c),
                        None => return Err(invalid("unterminated quoted segment")),
                    }
                }
                match chars.peek() {
                    None | Some('.') => {}
                    Some(_) => return Err(invalid("text after closing quote")),
                }
            } else {
                while let Some(&c) = chars.peek() {
                    match c {
                        '.' => break,
                        '"' | '\\' => return Err(invalid("unquoted segment contains a quote or escape")),
                        _ => {
                            segment.push(c);
                            chars.next();
                        }
                    }
                }
                if segment.is_empty() {
                    return Err(invalid("empty segment"));
                }
            }
            segments.push(segment.into());

            match chars.next() {
                None => break,
                Some('.') => continue,
                Some(_) => return Err(invalid("unexpected character")),
            }
        }
        Ok(Self {
            segments: Arc::from(segments),
        })
    }

    /// A child name with one more segment.
    pub fn append(&self, segment: impl Into<Arc<str>>) -> Self {
        let mut segments: Vec<Arc<str>> = self.segments.to_vec();
        segments.push(segment.into());
        Self {
            segments: Arc::from(segments),
        }
    }

    /// The name without its last segment, `None` for single-segment names.
    pub fn parent(&self) -> Option<Self> {
        let n = self.segments.len();
        if n < 2 {
            return None;
        }
        Some(Self {
            segments: Arc::from(&self.segments[..n - 1]),
        })
    }

    /// True if `self` is a strict prefix of `other`.
    pub fn is_parent_of(&self, other: &ServiceName) -> bool {
        self.segments.len() < other.segments.len()
            && other.segments.iter().zip(self.segments.iter()).all(|(a, b)| a == b)
    }

    /// The last segment.
    pub fn simple_name(&self) -> &str {
        self.segments.last().map(|s| &**s).unwrap_or_default()
    }

    pub fn segments(&self) -> &[Arc<str>] {
        &self.segments
    }

    /// The canonical text form, parseable by [`ServiceName::parse`].
    pub fn canonical_name(&self) -> String {
        self.to_string()
    }
}

fn needs_quotes(segment: &str) -> bool {
    segment.is_empty() || segment.contains(['.', '"', '\\'])
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            if needs_quotes(seg) {
                f.write_str("\"")?;
                for c in seg.chars() {
                    if matches!(c, '"' | '\\') {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("\"")?;
            } else {
                f.write_str(seg)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceName({self})")
    }
}

impl Ord for ServiceName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments.iter().cmp(other.segments.iter())
    }
}

impl PartialOrd for ServiceName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for ServiceName {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<&ServiceName> for Arc<str> {
    fn from(name: &ServiceName) -> Self {
        Arc::from(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_quotes_special_segments() {
        let name = ServiceName::of("net")
            .append("listener")
            .append("http.8080");
        assert_eq!(name.to_string(), r#"net.listener."http.8080""#);
        assert_eq!(ServiceName::parse(&name.canonical_name()).unwrap(), name);

        let odd = ServiceName::of(r#"say "hi""#);
        assert_eq!(odd.to_string(), r#""say \"hi\"""#);
        assert_eq!(ServiceName::parse(&odd.to_string()).unwrap(), odd);
    }

    #[test]
    fn parse_rejects_malformed_names() {
        for bad in ["", "a..b", ".a", "a.", r#""open"#, r#""a"b"#, r#"a"b"#] {
            assert!(ServiceName::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn hierarchy() {
        let root = ServiceName::of("jboss");
        let child = root.append("web");
        let grandchild = child.append("host");

        assert_eq!(grandchild.parent(), Some(child.clone()));
        assert_eq!(root.parent(), None);
        assert!(root.is_parent_of(&grandchild));
        assert!(!grandchild.is_parent_of(&root));
        assert!(!child.is_parent_of(&child));
        assert_eq!(grandchild.simple_name(), "host");
    }

    #[test]
    fn parents_sort_before_children() {
        let mut names = vec![
            ServiceName::parse("b").unwrap(),
            ServiceName::parse("a.b").unwrap(),
            ServiceName::parse("a").unwrap(),
        ];
        names.sort();
        let rendered: Vec<String> = names.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["a", "a.b", "b"]);
    }

    #[test]
    fn from_segments_requires_one_segment() {
        assert!(ServiceName::from_segments(Vec::<String>::new()).is_none());
        let name = ServiceName::from_segments(["a", "b"]).unwrap();
        assert_eq!(name.to_string(), "a.b");
    }
}
