//! Memorable agent name generation
//!
//! Agent names are `Adjective+Noun` pairs (`BlueFalcon`, `QuietHarbor`) so
//! they read naturally in a thread ("assigned to QuietHarbor") instead of
//! as an opaque id. Grounded in the naming convention documented in the
//! wider agent-mail corpus, not in anything the teacher itself does.

use crate::error::{CoreError, CoreResult};
use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "Blue", "Quiet", "Swift", "Bright", "Calm", "Bold", "Gentle", "Sharp", "Silent", "Amber",
    "Crimson", "Golden", "Hidden", "Lucky", "Mellow", "Nimble", "Proud", "Rapid", "Sturdy",
    "Vivid", "Wandering", "Wild", "Cosmic", "Dusty", "Eager", "Faint", "Gallant", "Humble",
    "Iron", "Jovial",
];

const NOUNS: &[&str] = &[
    "Falcon", "Harbor", "River", "Summit", "Meadow", "Comet", "Lantern", "Badger", "Otter",
    "Glacier", "Ember", "Thicket", "Canyon", "Orchard", "Beacon", "Compass", "Anchor", "Ridge",
    "Willow", "Frost", "Tide", "Quartz", "Sparrow", "Pioneer", "Horizon", "Maple", "Cascade",
    "Drift", "Ember", "Voyager",
];

/// Draw one random `Adjective+Noun` name. Not guaranteed unique — callers
/// must check against existing agents and retry (see
/// [`generate_unique_name`]).
pub fn random_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).expect("ADJECTIVES is non-empty");
    let noun = NOUNS.choose(&mut rng).expect("NOUNS is non-empty");
    format!("{adjective}{noun}")
}

/// Generate a name that passes `is_free`, retrying up to `attempts` times
/// (§5: "bounded by a small constant") before failing. Does not fall back
/// to a synthetic suffix — a caller that needs to guarantee success should
/// widen `is_free`'s acceptance criteria itself, not rely on this to paper
/// over an exhausted space.
pub fn generate_unique_name(attempts: u32, is_free: impl Fn(&str) -> bool) -> CoreResult<String> {
    for _ in 0..attempts {
        let candidate = random_name();
        if is_free(&candidate) {
            return Ok(candidate);
        }
    }
    Err(CoreError::internal("agent name space exhausted"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn random_name_is_adjective_noun() {
        let name = random_name();
        let matches_adjective = ADJECTIVES.iter().any(|a| name.starts_with(a));
        assert!(matches_adjective, "{name} does not start with a known adjective");
    }

    #[test]
    fn generate_unique_name_avoids_taken_names() {
        let taken: HashSet<&str> = ["BlueFalcon"].into_iter().collect();
        for _ in 0..50 {
            let name = generate_unique_name(20, |n| !taken.contains(n)).unwrap();
            assert_ne!(name, "BlueFalcon");
        }
    }

    #[test]
    fn generate_unique_name_fails_when_everything_is_taken() {
        let err = generate_unique_name(3, |_| false).unwrap_err();
        assert!(matches!(err, CoreError::Internal(_)));
    }
}
