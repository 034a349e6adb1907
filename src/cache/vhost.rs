//! Virtual-host path rewriting.
//!
//! The origin addresses API objects through a virtual-hosting prefix, so a
//! client path like `/++api++/page` is cached by the origin gateway under
//! `/VirtualHostBase/.../VirtualHostRoot/page`. Purges must hit both.

use std::{borrow::Cow, collections::HashSet};

pub const DEFAULT_MARKER: &str = "++api++";
pub const DEFAULT_PREFIX: &str =
    "/VirtualHostBase/http/plone.localhost:80/Plone/++api++/VirtualHostRoot";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHostRewrite {
    marker: String,
    prefix: String,
}

impl Default for VirtualHostRewrite {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER, DEFAULT_PREFIX)
    }
}

impl VirtualHostRewrite {
    pub fn new(marker: impl Into<String>, prefix: impl Into<String>) -> Self {
        let marker = marker.into().trim_matches('/').to_string();
        let prefix = prefix.into().trim_end_matches('/').to_string();
        Self { marker, prefix }
    }

    /// API path segment without slashes, e.g. `++api++`.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Replace a leading run of API markers with the virtual-host prefix.
    ///
    /// `/++api++/page`, `/++api++/++api++/page` and `/++api++//page` all become
    /// `<prefix>/page`. When the run ends inside a segment, as in
    /// `/++api++/++api++x`, the run is shortened to the last whole segment and
    /// the result is `<prefix>/++api++x`. Paths that do not start with a whole
    /// marker segment are returned unchanged.
    pub fn translate<'a>(&self, path: &'a str) -> Cow<'a, str> {
        if self.marker.is_empty() {
            return Cow::Borrowed(path);
        }
        let Some(rest) = path.strip_prefix('/') else {
            return Cow::Borrowed(path);
        };

        match self.marker_run_end(rest) {
            Some(end) => Cow::Owned(format!("{}{}", self.prefix, &rest[end..])),
            None => Cow::Borrowed(path),
        }
    }

    /// End of the leading `(marker/?)+` run in `rest`.
    ///
    /// Longer runs are preferred, and within one repetition the trailing slash
    /// is preferred. The chosen end must be followed by nothing, `/` or `?`.
    fn marker_run_end(&self, rest: &str) -> Option<usize> {
        enum Step {
            Extend(usize),
            Accept(usize),
        }

        let marker = self.marker.as_str();
        let mut extended = HashSet::new();
        let mut stack = vec![Step::Extend(0)];

        while let Some(step) = stack.pop() {
            match step {
                Step::Accept(pos) => {
                    let tail = &rest[pos..];
                    if tail.is_empty() || tail.starts_with('/') || tail.starts_with('?') {
                        return Some(pos);
                    }
                }
                Step::Extend(pos) => {
                    if !extended.insert(pos) || !rest[pos..].starts_with(marker) {
                        continue;
                    }
                    let after = pos + marker.len();
                    // Popped in reverse: the slash branch is explored first.
                    stack.push(Step::Accept(after));
                    stack.push(Step::Extend(after));
                    if rest[after..].starts_with('/') {
                        stack.push(Step::Accept(after + 1));
                        stack.push(Step::Extend(after + 1));
                    }
                }
            }
        }
        None
    }

    /// Strip a leading run of API markers, giving the canonical content path.
    pub fn canonical<'a>(&self, path: &'a str) -> Cow<'a, str> {
        match self.translate(path) {
            Cow::Owned(translated) => {
                let rest = &translated[self.prefix.len()..];
                if rest.is_empty() || rest.starts_with('?') {
                    Cow::Owned(format!("/{rest}"))
                } else {
                    Cow::Owned(rest.to_string())
                }
            }
            Cow::Borrowed(unchanged) => Cow::Borrowed(unchanged),
        }
    }

    /// The API-prefixed form of a canonical path.
    pub fn api_path(&self, canonical: &str) -> String {
        let rest = canonical.trim_start_matches('/');
        if rest.is_empty() {
            format!("/{}", self.marker)
        } else {
            format!("/{}/{}", self.marker, rest)
        }
    }
}
