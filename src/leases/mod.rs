//! Advisory file-path leases: overlap detection and conflict evaluation.
//!
//! A claim covers a literal project-relative path or a glob (`*`, `?`,
//! `**`). Reservation decisions compare the requested path against every
//! active claim in the project; the rules here are pure so they can be
//! tested exhaustively without a store.

use chrono::{DateTime, Duration, Utc};
use glob::Pattern;

use crate::error::ErrorCode;
use crate::model::{Claim, ClaimHolder, PathConflict};

pub const MIN_TTL_SECS: i64 = 60;
pub const DEFAULT_TTL_SECS: i64 = 3600;

/// Clamp a requested TTL into the valid range.
pub fn effective_ttl(ttl_seconds: Option<i64>) -> Duration {
    Duration::seconds(ttl_seconds.unwrap_or(DEFAULT_TTL_SECS).max(MIN_TTL_SECS))
}

/// Strip `./` prefixes and collapse duplicate separators.
pub fn normalize(path: &str) -> String {
    let mut s = path.trim();
    while let Some(rest) = s.strip_prefix("./") {
        s = rest;
    }
    let mut out = String::with_capacity(s.len());
    let mut prev_slash = false;
    for ch in s.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(ch);
    }
    out
}

pub fn is_glob(path: &str) -> bool {
    path.contains(['*', '?', '['])
}

/// The wildcard-free leading portion of a pattern.
fn literal_prefix(path: &str) -> &str {
    match path.find(['*', '?', '[']) {
        Some(idx) => &path[..idx],
        None => path,
    }
}

/// Do two claim paths overlap?
///
/// Overlap holds when the normalized paths are equal, when either side —
/// compiled as a glob — matches the other side taken literally, or, for a
/// glob-vs-glob pair, when their wildcard-free prefixes are
/// prefix-comparable. The glob-vs-glob rule is a conservative
/// approximation: it may report overlap for disjoint patterns but never
/// misses one that shares a literal path.
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    let a = normalize(a);
    let b = normalize(b);
    if a == b {
        return true;
    }
    let a_matches_b = Pattern::new(&a).is_ok_and(|p| p.matches(&b));
    let b_matches_a = Pattern::new(&b).is_ok_and(|p| p.matches(&a));
    if a_matches_b || b_matches_a {
        return true;
    }
    if is_glob(&a) && is_glob(&b) {
        let pa = literal_prefix(&a);
        let pb = literal_prefix(&b);
        return pa.starts_with(pb) || pb.starts_with(pa);
    }
    false
}

/// Does an existing active claim conflict with a request?
///
/// Never against the requester's own claims; shared-with-shared coexists.
pub fn claim_conflicts(
    existing: &Claim,
    candidate_path: &str,
    candidate_exclusive: bool,
    candidate_agent: &str,
    now: DateTime<Utc>,
) -> bool {
    if !existing.is_active(now) {
        return false;
    }
    if existing.agent_name.eq_ignore_ascii_case(candidate_agent) {
        return false;
    }
    if !existing.exclusive && !candidate_exclusive {
        return false;
    }
    patterns_overlap(&existing.path, candidate_path)
}

/// Partition requested paths into grants and per-path conflicts against the
/// project's active claims.
pub fn evaluate_request(
    active: &[Claim],
    paths: &[String],
    exclusive: bool,
    agent: &str,
    now: DateTime<Utc>,
) -> (Vec<String>, Vec<PathConflict>) {
    let mut granted = Vec::new();
    let mut conflicts = Vec::new();
    for path in paths {
        let holders: Vec<ClaimHolder> = active
            .iter()
            .filter(|claim| claim_conflicts(claim, path, exclusive, agent, now))
            .map(|claim| ClaimHolder {
                agent: claim.agent_name.clone(),
                path: claim.path.clone(),
                exclusive: claim.exclusive,
                expires_ts: claim.expires_ts,
            })
            .collect();
        if holders.is_empty() {
            granted.push(path.clone());
        } else {
            conflicts.push(PathConflict {
                path: path.clone(),
                code: ErrorCode::ClaimConflict,
                holders,
            });
        }
    }
    (granted, conflicts)
}

/// Do two agents hold overlapping active claims? Drives the `auto` contact
/// policy: agents already working the same files may message each other.
pub fn agents_share_overlap(a_claims: &[Claim], b_claims: &[Claim]) -> bool {
    a_claims.iter().any(|a| {
        b_claims
            .iter()
            .any(|b| patterns_overlap(&a.path, &b.path))
    })
}
