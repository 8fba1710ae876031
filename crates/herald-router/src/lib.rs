// Channel route specifiers and the matcher that decides which channels they select.
use regex::Regex;
use std::fmt;

#[derive(thiserror::Error, Debug)]
pub enum RouteError {
    #[error("invalid route pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Selector for zero or more channels.
///
/// Strings are classified once, at the API boundary: anything containing `*`
/// becomes a [`Route::Wildcard`], everything else a [`Route::Literal`].
///
/// ```
/// use herald_router::Route;
///
/// let route = Route::from(["sand*", "*wich"]);
/// assert!(route.is_match("sandwich"));
/// assert!(!Route::from("*dw*").is_match("sandwich"));
/// ```
#[derive(Debug, Clone)]
pub enum Route {
    Literal(String),
    Wildcard(String),
    Pattern(Regex),
    Any(Vec<Route>),
}

impl Route {
    /// Compile a regular expression route. The expression is not anchored.
    pub fn pattern(expression: &str) -> Result<Self, RouteError> {
        Ok(Route::Pattern(Regex::new(expression)?))
    }

    pub fn is_match(&self, channel: &str) -> bool {
        matches(self, channel)
    }

    // Only literal names can name a channel that does not exist yet.
    pub fn is_literal(&self) -> bool {
        match self {
            Route::Literal(name) => !name.contains('*'),
            _ => false,
        }
    }

    /// Leaf routes in order, with nested lists flattened.
    pub fn leaves(&self) -> Vec<&Route> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Route>) {
        match self {
            Route::Any(routes) => {
                for route in routes {
                    route.collect_leaves(out);
                }
            }
            leaf => out.push(leaf),
        }
    }
}

impl From<&str> for Route {
    fn from(value: &str) -> Self {
        if value.contains('*') {
            Route::Wildcard(value.to_string())
        } else {
            Route::Literal(value.to_string())
        }
    }
}

impl From<String> for Route {
    fn from(value: String) -> Self {
        if value.contains('*') {
            Route::Wildcard(value)
        } else {
            Route::Literal(value)
        }
    }
}

impl From<&String> for Route {
    fn from(value: &String) -> Self {
        Route::from(value.as_str())
    }
}

impl From<Regex> for Route {
    fn from(value: Regex) -> Self {
        Route::Pattern(value)
    }
}

impl<T: Into<Route>> From<Vec<T>> for Route {
    fn from(value: Vec<T>) -> Self {
        Route::Any(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Route>, const N: usize> From<[T; N]> for Route {
    fn from(value: [T; N]) -> Self {
        Route::Any(value.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Literal(name) | Route::Wildcard(name) => f.write_str(name),
            Route::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
            Route::Any(routes) => {
                f.write_str("[")?;
                for (idx, route) in routes.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{route}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Literal part of a single-`*` wildcard and which end it anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Affix<'a> {
    pub term: &'a str,
    pub is_suffix: bool,
}

/// Reduce `word*` or `*word` to its literal term.
///
/// Returns `None` for a bare `*`, for patterns with more than one `*`, for a
/// `*` anywhere but the first or last position, and for patterns with no `*`.
pub fn affix(pattern: &str) -> Option<Affix<'_>> {
    if pattern.len() < 2 || pattern.matches('*').count() != 1 {
        return None;
    }
    if let Some(term) = pattern.strip_prefix('*') {
        return Some(Affix {
            term,
            is_suffix: true,
        });
    }
    pattern.strip_suffix('*').map(|term| Affix {
        term,
        is_suffix: false,
    })
}

/// Decide whether `route` selects `channel`.
///
/// Infix wildcards (`a*b`, `*a*`) are not supported and match nothing;
/// callers that need them should use [`Route::pattern`].
pub fn matches(route: &Route, channel: &str) -> bool {
    match route {
        Route::Any(routes) => routes.iter().any(|route| matches(route, channel)),
        Route::Pattern(regex) => regex.is_match(channel),
        Route::Literal(name) => name == "*" || name == channel,
        Route::Wildcard(pattern) => {
            if pattern == "*" {
                return true;
            }
            if !pattern.contains('*') {
                return pattern == channel;
            }
            match affix(pattern) {
                Some(Affix {
                    term,
                    is_suffix: true,
                }) => channel.ends_with(term),
                Some(Affix {
                    term,
                    is_suffix: false,
                }) => channel.starts_with(term),
                None => false,
            }
        }
    }
}
