//! Trust gate: decides once per connection, at key exchange, whether a peer key is accepted.

/// Outcome of evaluating a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    Trusted,
    Untrusted,
    /// The host must run its predicate and report back via `Engine::resolve_trust`.
    Deferred,
}

/// Policy resolved from settings. Pinned list beats predicate beats trust-all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TrustPolicy {
    Pinned(Vec<String>),
    Predicate,
    #[default]
    TrustAll,
}

impl TrustPolicy {
    pub fn resolve(trusted_fingerprints: Option<&[String]>, has_predicate: bool) -> Self {
        match trusted_fingerprints {
            Some(list) => TrustPolicy::Pinned(list.to_vec()),
            None if has_predicate => TrustPolicy::Predicate,
            None => TrustPolicy::TrustAll,
        }
    }

    /// Fingerprints compare ASCII case-insensitively.
    pub fn evaluate(&self, fingerprint: &str) -> TrustDecision {
        match self {
            TrustPolicy::Pinned(list) => {
                if list.iter().any(|fp| fp.eq_ignore_ascii_case(fingerprint)) {
                    TrustDecision::Trusted
                } else {
                    TrustDecision::Untrusted
                }
            }
            TrustPolicy::Predicate => TrustDecision::Deferred,
            TrustPolicy::TrustAll => TrustDecision::Trusted,
        }
    }
}
