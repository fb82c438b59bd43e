//! Route patterns with `{placeholder}` segments.
//!
//! Patterns and destinations are split on `/`. A literal segment matches
//! only itself (case-sensitive); a placeholder matches any non-empty segment
//! and binds it. Segment counts must be equal.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed route pattern such as `/greet/{name}/{age}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    /// Parse a pattern.
    ///
    /// Placeholder names must be non-empty, unique, and span a whole segment.
    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid = |reason: &str| RelayError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let mut seen = HashSet::new();
        let mut segments = Vec::new();
        for part in pattern.split('/') {
            if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                if name.is_empty() {
                    return Err(invalid("empty placeholder name"));
                }
                if name.contains(['{', '}']) {
                    return Err(invalid("nested braces in placeholder"));
                }
                if !seen.insert(name) {
                    return Err(invalid(&format!("duplicate placeholder {{{name}}}")));
                }
                segments.push(Segment::Placeholder(name.to_string()));
            } else if part.contains(['{', '}']) {
                return Err(invalid("placeholders must span a whole segment"));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Placeholder names in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Number of placeholders; fewer means more specific.
    pub fn placeholder_count(&self) -> usize {
        self.placeholders().count()
    }

    pub(crate) fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Match a concrete destination, binding placeholder values.
    pub fn matches(&self, destination: &str) -> Option<PathVariables> {
        let mut variables = PathVariables::default();
        let mut parts = destination.split('/');
        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Placeholder(_) if part.is_empty() => return None,
                Segment::Placeholder(name) => {
                    variables.values.insert(name.clone(), part.to_string());
                }
            }
        }
        if parts.next().is_some() {
            return None;
        }
        Some(variables)
    }

    /// Whether some destination matches both patterns.
    pub(crate) fn overlaps(&self, other: &RoutePattern) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|pair| match pair {
                    (Segment::Literal(a), Segment::Literal(b)) => a == b,
                    (Segment::Literal(a), Segment::Placeholder(_))
                    | (Segment::Placeholder(_), Segment::Literal(a)) => !a.is_empty(),
                    (Segment::Placeholder(_), Segment::Placeholder(_)) => true,
                })
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for RoutePattern {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Placeholder values bound by a match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathVariables {
    values: BTreeMap<String, String>,
}

impl PathVariables {
    /// Raw value of a placeholder.
    pub fn raw(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Value of a placeholder coerced to `T`.
    ///
    /// # Errors
    ///
    /// [`RelayError::Binding`] if the placeholder is missing or does not parse.
    pub fn get<T>(&self, name: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.raw(name).ok_or_else(|| RelayError::Binding {
            name: name.to_string(),
            reason: "no such path variable".to_string(),
        })?;
        raw.parse().map_err(|e: T::Err| RelayError::Binding {
            name: name.to_string(),
            reason: format!("{raw:?}: {e}"),
        })
    }

    /// Number of bound placeholders.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing was bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_binds_placeholders() {
        let pattern = RoutePattern::parse("/greet/{name}/{age}").unwrap();
        let vars = pattern.matches("/greet/jlong/36").unwrap();

        assert_eq!(vars.raw("name"), Some("jlong"));
        assert_eq!(vars.get::<u32>("age").unwrap(), 36);
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn test_segment_count_must_match() {
        let pattern = RoutePattern::parse("/greet/{name}").unwrap();
        assert!(pattern.matches("/greet").is_none());
        assert!(pattern.matches("/greet/a/b").is_none());
        assert!(pattern.matches("/greet/").is_none());
    }

    #[test]
    fn test_literals_are_case_sensitive() {
        let pattern = RoutePattern::parse("/greet/{name}").unwrap();
        assert!(pattern.matches("/Greet/x").is_none());
        assert!(pattern.matches("greet/x").is_none());
    }

    #[test]
    fn test_binding_failure() {
        let pattern = RoutePattern::parse("/greet/{name}/{age}").unwrap();
        let vars = pattern.matches("/greet/jlong/old").unwrap();

        let err = vars.get::<u32>("age").unwrap_err();
        assert!(matches!(err, RelayError::Binding { ref name, .. } if name == "age"));
        assert!(matches!(
            vars.get::<String>("missing"),
            Err(RelayError::Binding { .. })
        ));
    }

    #[test]
    fn test_invalid_patterns() {
        for bad in ["/a/{}", "/a/{x}/{x}", "/a/pre{x}", "/a/{x", "/a/{{x}}"] {
            assert!(
                matches!(RoutePattern::parse(bad), Err(RelayError::InvalidPattern { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_placeholders_in_order() {
        let pattern: RoutePattern = "/users/{id}/posts/{post}".parse().unwrap();
        let names: Vec<_> = pattern.placeholders().collect();
        assert_eq!(names, vec!["id", "post"]);
        assert_eq!(pattern.placeholder_count(), 2);
        assert_eq!(pattern.to_string(), "/users/{id}/posts/{post}");
    }

    #[test]
    fn test_overlap() {
        let a = RoutePattern::parse("/greet/{name}").unwrap();
        let b = RoutePattern::parse("/greet/{other}").unwrap();
        let c = RoutePattern::parse("/greet/world").unwrap();
        let d = RoutePattern::parse("/hello/{name}").unwrap();

        assert!(a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(!a.overlaps(&d));
        assert!(!c.overlaps(&RoutePattern::parse("/greet/mars").unwrap()));
    }
}
