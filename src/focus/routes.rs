//! Route rules for the page-routing layer.
//!
//! Patterns are matched against normalised route paths segment by segment:
//! literal segments must match exactly, `*` matches one segment and `**` any
//! number of segments. Every pattern matches as a segment-bounded prefix, so
//! `/games` covers `/games/chess` but not `/gamesroom`. A leading `!` marks an
//! exception. When several patterns match, the most specific one decides.

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{FocusError, Result};
use crate::focus::policy::GuardianPolicy;

const ROUTE_BASE: &str = "http://routes.invalid/";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    AnyOne,
    AnyMany,
}

/// A parsed route pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    exception: bool,
    segments: Vec<Segment>,
}

/// Ordering key for "most specific wins": literal segments first, then
/// single-segment wildcards, then literal length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    literals: usize,
    single_wildcards: usize,
    literal_chars: usize,
}

impl RoutePattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let (exception, path) = match trimmed.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };

        if !path.starts_with('/') {
            return Err(FocusError::InvalidPolicy(format!(
                "route pattern must start with '/': '{}'",
                raw
            )));
        }

        let mut segments = Vec::new();
        for part in path.split('/').filter(|s| !s.is_empty()) {
            let segment = match part {
                "**" => Segment::AnyMany,
                "*" => Segment::AnyOne,
                literal if literal.contains('*') => {
                    return Err(FocusError::InvalidPolicy(format!(
                        "wildcards must fill a whole segment in '{}'",
                        raw
                    )));
                }
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self { exception, segments })
    }

    pub fn is_exception(&self) -> bool {
        self.exception
    }

    pub fn matches(&self, route: &[&str]) -> bool {
        match_prefix(&self.segments, route)
    }

    pub fn specificity(&self) -> Specificity {
        let mut key = Specificity {
            literals: 0,
            single_wildcards: 0,
            literal_chars: 0,
        };
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => {
                    key.literals += 1;
                    key.literal_chars += text.len();
                }
                Segment::AnyOne => key.single_wildcards += 1,
                Segment::AnyMany => {}
            }
        }
        key
    }
}

/// Segment-wise glob match of `pattern` against a prefix of `route`.
///
/// Only the most recent `**` is ever revisited, which keeps the scan at
/// O(pattern * route) however many `**` segments a pattern has.
fn match_prefix(pattern: &[Segment], route: &[&str]) -> bool {
    let (mut p, mut r) = (0, 0);
    // Pattern index after the last `**`, and the route index it currently resumes from
    let mut resume: Option<(usize, usize)> = None;

    while p < pattern.len() {
        let step = match &pattern[p] {
            Segment::AnyMany => {
                resume = Some((p + 1, r));
                p += 1;
                continue;
            }
            Segment::AnyOne => r < route.len(),
            Segment::Literal(literal) => route.get(r).is_some_and(|segment| segment == literal),
        };

        if step {
            p += 1;
            r += 1;
            continue;
        }

        match resume {
            Some((after, from)) if from < route.len() => {
                resume = Some((after, from + 1));
                p = after;
                r = from + 1;
            }
            _ => return false,
        }
    }
    true
}

/// Normalise a route: drop query and fragment, resolve dot segments
pub fn normalize_route(route: &str) -> String {
    Url::parse(ROUTE_BASE)
        .and_then(|base| base.join(route))
        .map(|url| url.path().to_string())
        .unwrap_or_else(|_| route.to_string())
}

/// Decide a route against a pattern set.
///
/// Returns `None` when nothing matches, otherwise whether the winning pattern
/// is a plain (non-exception) pattern. On equal specificity the plain pattern wins.
pub fn decide(patterns: &[String], route: &str) -> Option<bool> {
    let normalized = normalize_route(route);
    let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();

    patterns
        .iter()
        .filter_map(|raw| match RoutePattern::parse(raw) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                debug!("Skipping unparseable route pattern: {}", e);
                None
            }
        })
        .filter(|pattern| pattern.matches(&segments))
        .max_by_key(|pattern| (pattern.specificity(), !pattern.is_exception()))
        .map(|pattern| !pattern.is_exception())
}

/// Whether a route is blocked by the guardian policy
pub fn is_route_blocked(policy: &GuardianPolicy, route: &str) -> bool {
    decide(&policy.blocked_routes, route).unwrap_or(false)
}

/// Whether a route may render during a focus session.
///
/// An empty allow-list permits every route.
pub fn is_route_allowed_during_focus(policy: &GuardianPolicy, route: &str) -> bool {
    if policy.allowed_routes_during_focus.is_empty() {
        return true;
    }
    decide(&policy.allowed_routes_during_focus, route).unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectReason {
    Blocked,
    NotAllowedDuringFocus,
}

/// What a page renderer should do with a route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RouteDecision {
    Render,
    Redirect { to: String, reason: RedirectReason },
}

/// Route guard for page renderers. Redirects are not violations.
pub fn guard_route(policy: &GuardianPolicy, route: &str, focus_active: bool) -> RouteDecision {
    let normalized = normalize_route(route);
    let home = if focus_active { policy.focus_home_route.as_str() } else { "/" };

    if normalized == normalize_route(home) {
        return RouteDecision::Render;
    }

    if is_route_blocked(policy, &normalized) {
        return RouteDecision::Redirect {
            to: home.to_string(),
            reason: RedirectReason::Blocked,
        };
    }

    if focus_active && !is_route_allowed_during_focus(policy, &normalized) {
        return RouteDecision::Redirect {
            to: home.to_string(),
            reason: RedirectReason::NotAllowedDuringFocus,
        };
    }

    RouteDecision::Render
}
