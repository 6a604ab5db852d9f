use crate::Gvk;
use gatekeeper_policy_controller_k8s_api::DynamicObject;
use std::sync::Arc;

/// Readiness expectations for the objects of a single kind.
pub trait Expectations: Send + Sync {
    fn expect(&self, obj: &DynamicObject);

    fn observe(&self, obj: &DynamicObject);

    /// Stops waiting on the object.
    fn cancel_expect(&self, obj: &DynamicObject);

    /// Records a failed attempt to satisfy the object's expectation, cancelling
    /// it once too many attempts have failed. Returns true if cancelled.
    fn try_cancel_expect(&self, obj: &DynamicObject) -> bool;
}

/// Gates process readiness on expected objects having been handled once.
pub trait Tracker: Send + Sync {
    fn for_gvk(&self, gvk: &Gvk) -> Arc<dyn Expectations>;
}
