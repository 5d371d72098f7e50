//! Drift detection between the desired and the observed DaemonSet.

use extop_reconcile::Drift;
use k8s_openapi::api::apps::v1::DaemonSet;

use crate::desired::{DesiredDaemonSet, TEMPLATE_HASH_ANNOTATION};

/// The fingerprint stamped on a DaemonSet, if any.
pub fn stamp_of(daemon_set: &DaemonSet) -> Option<&str> {
    daemon_set
        .metadata
        .annotations
        .as_ref()?
        .get(TEMPLATE_HASH_ANNOTATION)
        .map(String::as_str)
}

/// Classifies the observed DaemonSet against the desired one.
///
/// Only the stamps are compared. A DaemonSet without a stamp counts as changed.
pub fn classify(desired: &DesiredDaemonSet, observed: Option<&DaemonSet>) -> Drift {
    extop_reconcile::classify(&desired.fingerprint, observed.map(stamp_of))
}
