//! Runtime trust predicate. `true` means the fingerprint is trusted.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use keylink_core::TrustPolicy;

/// Async predicate over a peer fingerprint.
pub type TrustPredicate =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// Shared, replaceable predicate slot. Read once per connection when it is opened or accepted.
#[derive(Clone, Default)]
pub(crate) struct TrustSlot(Arc<RwLock<Option<TrustPredicate>>>);

impl TrustSlot {
    pub(crate) fn set<F, Fut>(&self, predicate: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let predicate: TrustPredicate = Arc::new(move |fingerprint| Box::pin(predicate(fingerprint)));
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = Some(predicate);
    }

    pub(crate) fn get(&self) -> Option<TrustPredicate> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Pinned fingerprints beat the predicate; with neither, every peer is trusted.
pub(crate) fn policy(
    trusted_fingerprints: Option<&[String]>,
    predicate: &Option<TrustPredicate>,
) -> TrustPolicy {
    TrustPolicy::resolve(trusted_fingerprints, predicate.is_some())
}
