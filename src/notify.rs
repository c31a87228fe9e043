//! User-visible notifications.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::warn;

use crate::model::ClientIdentity;

/// Shows a non-blocking warning to the user.
pub trait Notifier: Send + Sync {
    fn warn(&self, title: &str, message: &str);
}

/// A [`Notifier`] that only logs.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn warn(&self, title: &str, message: &str) {
        warn!(title, "{message}");
    }
}

/// A [`Notifier`] that records every warning, for tests and introspection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    warnings: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn warnings(&self) -> Vec<(String, String)> {
        self.warnings.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn warn(&self, title: &str, message: &str) {
        self.warnings
            .lock()
            .push((title.to_string(), message.to_string()));
    }
}

/// Warns once per identity when two connected clients share it.
#[derive(Debug, Default)]
pub struct DuplicateIdentityTracker {
    reported: HashSet<ClientIdentity>,
}

impl DuplicateIdentityTracker {
    /// Checks the connected identities and notifies about new duplicates.
    /// Returns the identities reported by this call.
    pub fn check<'a>(
        &mut self,
        connected: impl IntoIterator<Item = &'a ClientIdentity>,
        notifier: &dyn Notifier,
    ) -> Vec<ClientIdentity> {
        let mut seen = HashSet::new();
        let mut reported = Vec::new();
        for identity in connected {
            if !seen.insert(identity) && self.reported.insert(identity.clone()) {
                notifier.warn(
                    "Duplicate client name",
                    &format!(
                        "More than one client is connected as {identity}. Offline client \
                         tracking cannot tell them apart."
                    ),
                );
                reported.push(identity.clone());
            }
        }
        reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_reported_once() {
        let notifier = RecordingNotifier::default();
        let mut tracker = DuplicateIdentityTracker::default();
        let alice = ClientIdentity::new("Alice", "Laptop");
        let bob = ClientIdentity::new("Bob", "Laptop");
        let connected = [alice.clone(), bob, alice.clone()];

        assert_eq!(tracker.check(&connected, &notifier), vec![alice]);
        assert!(tracker.check(&connected, &notifier).is_empty());
        assert_eq!(notifier.warnings().len(), 1);
    }
}
