use strider_core::{Identity, Notification};

/// Outbound seam to whatever delivers notifications to a viewer.
///
/// Delivery is best effort: implementations log and swallow failures.
pub trait Notifier: Send + Sync {
    fn notify(&self, identity: &Identity, notification: Notification);
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::*;

    /// Records every notification per identity, in order.
    #[derive(Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<(Identity, Notification)>>,
    }

    impl RecordingNotifier {
        pub fn for_identity(&self, identity: &Identity) -> Vec<Notification> {
            self.sent
                .lock()
                .iter()
                .filter(|(id, _)| id == identity)
                .map(|(_, n)| n.clone())
                .collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, identity: &Identity, notification: Notification) {
            self.sent.lock().push((identity.clone(), notification));
        }
    }
}
