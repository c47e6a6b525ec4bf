//! URL path patterns used to classify intercepted requests.

/// A pattern matched against a URL path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    /// Prefix match (e.g. `/_next/static/`).
    Prefix(String),
    /// Suffix match (e.g. a file extension).
    Suffix(String),
    /// Contains substring.
    Contains(String),
}

impl PathPattern {
    /// Create a prefix match pattern.
    pub fn prefix(prefix: &str) -> Self {
        Self::Prefix(prefix.to_string())
    }

    /// Create a suffix match pattern.
    pub fn suffix(suffix: &str) -> Self {
        Self::Suffix(suffix.to_string())
    }

    /// Create a file extension pattern. `"woff2"` and `".woff2"` are equivalent.
    pub fn extension(ext: &str) -> Self {
        if ext.starts_with('.') {
            Self::Suffix(ext.to_string())
        } else {
            Self::Suffix(format!(".{ext}"))
        }
    }

    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self::Contains(substring.to_string())
    }

    /// Check if a path matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Prefix(p) => path.starts_with(p.as_str()),
            PathPattern::Suffix(p) => path.ends_with(p.as_str()),
            PathPattern::Contains(p) => path.contains(p.as_str()),
        }
    }

    /// Check if any pattern in `patterns` matches `path`.
    pub fn any_matches(patterns: &[PathPattern], path: &str) -> bool {
        patterns.iter().any(|p| p.matches(path))
    }
}
