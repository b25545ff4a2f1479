//! Tap identity and meter-name resolution.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

// ============================================================================
// Tap
// ============================================================================

/// A physical pour point with an associated flow meter.
///
/// Equality defines session ownership: the manager keeps at most one
/// flow per `Tap`. Two handles with the same name and meter are the same tap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tap {
    /// Display name (e.g., "Main Tap")
    name: String,

    /// Name of the meter feeding this tap (e.g., "kegboard.flow0")
    meter_name: String,
}

impl Tap {
    /// Creates a new tap handle.
    pub fn new(name: impl Into<String>, meter_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            meter_name: meter_name.into(),
        }
    }

    /// Creates a tap whose display name is its meter name.
    pub fn from_meter_name(meter_name: impl Into<String>) -> Self {
        let meter_name = meter_name.into();
        Self {
            name: meter_name.clone(),
            meter_name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meter_name(&self) -> &str {
        &self.meter_name
    }
}

impl fmt::Display for Tap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

// ============================================================================
// Tap Registry
// ============================================================================

/// Resolves physical meter identifiers to logical taps.
///
/// Tap configuration and discovery live outside the flow core; the
/// manager only needs this lookup.
pub trait TapRegistry: Send + Sync {
    /// Returns the tap fed by `meter_name`, if one is configured.
    fn tap_for_meter_name(&self, meter_name: &str) -> Option<Tap>;

    /// Returns every known tap in configuration order.
    fn taps(&self) -> Vec<Tap>;
}

/// Fixed tap registry built once from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTapRegistry {
    taps: Vec<Tap>,
    by_meter: HashMap<String, Tap>,
}

impl StaticTapRegistry {
    /// Builds a registry from taps. Later taps with a duplicate meter
    /// name are ignored.
    pub fn new(taps: impl IntoIterator<Item = Tap>) -> Self {
        let mut registry = Self::default();
        for tap in taps {
            registry.insert(tap);
        }
        registry
    }

    /// Adds a tap. Returns false if its meter name is already registered.
    pub fn insert(&mut self, tap: Tap) -> bool {
        if let Some(existing) = self.by_meter.get(tap.meter_name()) {
            warn!(
                meter = tap.meter_name(),
                existing = existing.name(),
                ignored = tap.name(),
                "Meter already bound to a tap"
            );
            return false;
        }
        self.by_meter
            .insert(tap.meter_name().to_string(), tap.clone());
        self.taps.push(tap);
        true
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }
}

impl TapRegistry for StaticTapRegistry {
    fn tap_for_meter_name(&self, meter_name: &str) -> Option<Tap> {
        self.by_meter.get(meter_name).cloned()
    }

    fn taps(&self) -> Vec<Tap> {
        self.taps.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_identity() {
        let a = Tap::new("Main", "kegboard.flow0");
        let b = Tap::new("Main", "kegboard.flow0");
        let c = Tap::new("Guest", "kegboard.flow1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "Main");
    }

    #[test]
    fn test_from_meter_name() {
        let tap = Tap::from_meter_name("kegboard.flow0");
        assert_eq!(tap.name(), "kegboard.flow0");
        assert_eq!(tap.meter_name(), "kegboard.flow0");
    }

    #[test]
    fn test_registry_lookup() {
        let registry = StaticTapRegistry::new([
            Tap::new("Main", "kegboard.flow0"),
            Tap::new("Guest", "kegboard.flow1"),
        ]);

        let tap = registry.tap_for_meter_name("kegboard.flow1");
        assert_eq!(tap.map(|t| t.name().to_string()), Some("Guest".to_string()));
        assert!(registry.tap_for_meter_name("kegboard.flow9").is_none());
    }

    #[test]
    fn test_registry_rejects_duplicate_meter() {
        let mut registry = StaticTapRegistry::new([Tap::new("Main", "kegboard.flow0")]);
        assert!(!registry.insert(Tap::new("Other", "kegboard.flow0")));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.taps().first().map(|t| t.name().to_string()),
            Some("Main".to_string())
        );
    }
}
