//! Slug derivation and agent name generation.
//!
//! Slugs are a pure function of the project's human key: the same key maps
//! to the same slug across restarts and across machines. Agent names are
//! memorable adjective+noun pairs, unique per project.

use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};

const SLUG_PREFIX_MAX: usize = 40;
const SLUG_HASH_LEN: usize = 10;
const AGENT_NAME_MAX: usize = 40;

pub const ADJECTIVES: &[&str] = &[
    "Amber", "Azure", "Black", "Blue", "Bold", "Bright", "Bronze", "Brown", "Calm", "Coral",
    "Crimson", "Electric", "Emerald", "Fuchsia", "Golden", "Green", "Indigo", "Ivory", "Jade",
    "Lilac", "Misty", "Olive", "Orange", "Pink", "Purple", "Quiet", "Red", "Royal", "Silver",
    "White",
];

pub const NOUNS: &[&str] = &[
    "Anchor", "Bear", "Beacon", "Castle", "Cat", "Cliff", "Creek", "Dog", "Falcon", "Fern",
    "Forge", "Garden", "Harbor", "Hill", "Lake", "Meadow", "Mountain", "Oak", "Otter", "Pond",
    "Raven", "Ridge", "River", "Snow", "Stone", "Summit", "Thicket", "Trail", "Willow", "Wren",
];

/// Derive the stable slug for a project human key.
///
/// `sanitize(human_key)[..40] + "-" + hex(sha1(human_key))[..10]`. The hash
/// suffix disambiguates keys that sanitize to the same prefix.
pub fn slugify(human_key: &str) -> String {
    let mut prefix = String::with_capacity(SLUG_PREFIX_MAX);
    let mut last_dash = true;
    for ch in human_key.trim().to_lowercase().chars() {
        let mapped = if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            ch
        } else {
            '-'
        };
        if mapped == '-' {
            if last_dash {
                continue;
            }
            last_dash = true;
        } else {
            last_dash = false;
        }
        prefix.push(mapped);
        if prefix.len() >= SLUG_PREFIX_MAX {
            break;
        }
    }
    let prefix = prefix.trim_matches('-');
    let prefix = if prefix.is_empty() { "project" } else { prefix };

    format!("{}-{}", prefix, &sha1_hex(human_key)[..SLUG_HASH_LEN])
}

pub fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(40), |mut acc, byte| {
            use std::fmt::Write;
            let _ = write!(acc, "{byte:02x}");
            acc
        })
}

/// Strip a caller-provided name hint down to alphanumerics, capped at 40
/// chars. Returns `None` when nothing usable remains.
pub fn sanitize_agent_name(value: &str) -> Option<String> {
    let cleaned: String = value
        .trim()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(AGENT_NAME_MAX)
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Pick a random adjective+noun agent name.
pub fn generate_agent_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).unwrap_or(&"Blue");
    let noun = NOUNS.choose(&mut rng).unwrap_or(&"Lake");
    format!("{adjective}{noun}")
}

/// Choose a unique agent name for a project.
///
/// A sanitized hint wins when free; otherwise names are generated and, if
/// the project is crowded, extended with an increasing numeric suffix.
/// `taken` holds existing names lowercased.
pub fn unique_agent_name(
    taken: &std::collections::HashSet<String>,
    name_hint: Option<&str>,
) -> String {
    if let Some(hint) = name_hint.and_then(sanitize_agent_name) {
        if !taken.contains(&hint.to_lowercase()) {
            return hint;
        }
    }
    for _ in 0..16 {
        let candidate = generate_agent_name();
        if !taken.contains(&candidate.to_lowercase()) {
            return candidate;
        }
    }
    let base = generate_agent_name();
    let mut suffix = 2u32;
    loop {
        let candidate = format!("{base}-{suffix}");
        if !taken.contains(&candidate.to_lowercase()) {
            return candidate;
        }
        suffix += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn slug_is_stable_and_safe() {
        let a = slugify("/home/user/projects/demo");
        let b = slugify("/home/user/projects/demo");
        assert_eq!(a, b);
        assert!(a.starts_with("home-user-projects-demo-"));
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
    }

    #[test]
    fn slug_disambiguates_same_prefix() {
        // Both keys sanitize to the same 40-char prefix; the hash suffix
        // must keep them apart.
        let long = "x".repeat(60);
        let a = slugify(&format!("/{long}/one"));
        let b = slugify(&format!("/{long}/two"));
        assert_ne!(a, b);
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn slug_of_empty_key_still_valid() {
        let s = slugify("///");
        assert!(s.starts_with("project-"));
    }

    #[test]
    fn hint_sanitization() {
        assert_eq!(sanitize_agent_name(" Alpha-1! "), Some("Alpha1".into()));
        assert_eq!(sanitize_agent_name("@@@"), None);
        let long = "a".repeat(100);
        assert_eq!(sanitize_agent_name(&long).unwrap().len(), 40);
    }

    #[test]
    fn unique_name_prefers_free_hint() {
        let taken = HashSet::new();
        assert_eq!(unique_agent_name(&taken, Some("Alpha")), "Alpha");
    }

    #[test]
    fn unique_name_skips_taken_hint_case_insensitively() {
        let mut taken = HashSet::new();
        taken.insert("alpha".to_string());
        let name = unique_agent_name(&taken, Some("Alpha"));
        assert_ne!(name.to_lowercase(), "alpha");
        assert!(!taken.contains(&name.to_lowercase()));
    }

    #[test]
    fn generated_names_are_word_pairs() {
        let name = generate_agent_name();
        assert!(ADJECTIVES.iter().any(|a| name.starts_with(a)));
        assert!(NOUNS.iter().any(|n| name.ends_with(n)));
    }
}
