//! Prefix allow-list deciding which remote paths are visible

/// Wildcard entry exposing the whole namespace.
pub const WILDCARD: &str = "*";

/// Top-level prefixes exposed through the mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPolicy {
    allowed_prefixes: Vec<String>,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl PathPolicy {
    pub fn new<I, S>(allowed_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_prefixes: allowed_prefixes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allow_all() -> Self {
        Self::new([WILDCARD])
    }

    /// Parses a comma-separated list such as `data,logs`. Blank items and
    /// surrounding slashes are ignored.
    pub fn parse(list: &str) -> Self {
        Self::new(
            list.split(',')
                .map(|prefix| prefix.trim().trim_matches('/'))
                .filter(|prefix| !prefix.is_empty()),
        )
    }

    pub fn allowed_prefixes(&self) -> &[String] {
        &self.allowed_prefixes
    }

    /// Whether an absolute path may be exposed. `/` always is; otherwise the
    /// path must be a configured prefix or lie beneath one, matching whole
    /// path segments only.
    pub fn is_path_allowed(&self, path: &str) -> bool {
        if path == "/" {
            return true;
        }
        self.allowed_prefixes.iter().any(|prefix| {
            if prefix == WILDCARD {
                return true;
            }
            path.strip_prefix('/')
                .and_then(|rest| rest.strip_prefix(prefix.as_str()))
                .is_some_and(|tail| tail.is_empty() || tail.starts_with('/'))
        })
    }
}
