//! Staleness evaluation. Pure and total.

use confcascade_core::{ConfigurationResource, Reference};

use crate::types::Staleness;

/// Classify a reference against the current state of a configuration resource.
///
/// Version markers are compared for exact equality only; they carry no order.
/// A reference with no recorded version is stale.
pub fn classify(reference: &Reference, current: &ConfigurationResource) -> Staleness {
    if reference.configuration_name != current.metadata.name {
        return Staleness::Unrelated;
    }
    match reference.recorded_version.as_deref() {
        Some(recorded) if recorded == current.version() => Staleness::Current,
        _ => Staleness::Stale,
    }
}

/// Whether `reference` names `current` and records a different version.
pub fn is_stale(reference: &Reference, current: &ConfigurationResource) -> bool {
    classify(reference, current) == Staleness::Stale
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(version: &str) -> ConfigurationResource {
        ConfigurationResource::new("ns", "A").with_resource_version(version)
    }

    #[test]
    fn test_matching_version_is_current() {
        let reference = Reference::new("A", Some("v1".into()));
        assert_eq!(classify(&reference, &cfg("v1")), Staleness::Current);
        assert!(!is_stale(&reference, &cfg("v1")));
    }

    #[test]
    fn test_differing_version_is_stale() {
        let reference = Reference::new("A", Some("v0".into()));
        assert!(is_stale(&reference, &cfg("v1")));
    }

    #[test]
    fn test_no_ordering_assumed() {
        // A "newer looking" recorded version is still stale.
        let reference = Reference::new("A", Some("10".into()));
        assert!(is_stale(&reference, &cfg("9")));
    }

    #[test]
    fn test_missing_recorded_version_is_stale() {
        let reference = Reference::new("A", None);
        assert!(is_stale(&reference, &cfg("v1")));
    }

    #[test]
    fn test_other_name_is_never_stale() {
        let reference = Reference::new("B", Some("v0".into()));
        assert_eq!(classify(&reference, &cfg("v1")), Staleness::Unrelated);
        assert!(!is_stale(&reference, &cfg("v1")));
    }
}
