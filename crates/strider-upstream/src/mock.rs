use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use strider_core::upstream::{FriendLocation, LocationService, Profile};
use strider_core::{Identity, LocationUpdate, UpstreamError};

/// One recorded `update_location` call.
#[derive(Clone, Debug)]
pub struct RecordedUpdate {
    pub identity: Identity,
    pub update: LocationUpdate,
}

/// In-process [`LocationService`] for deterministic tests.
///
/// Update calls are numbered from 1. Failures can be scripted per call
/// number or per identity. Every update call is recorded, failed or not.
#[derive(Default)]
pub struct MockLocationService {
    updates: Mutex<Vec<RecordedUpdate>>,
    update_calls: AtomicUsize,
    failing_calls: HashSet<usize>,
    failing_identities: HashSet<String>,
    delay: Option<Duration>,
    profile: Option<Profile>,
    friends: Vec<FriendLocation>,
    token: Option<String>,
}

impl MockLocationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the given update call numbers.
    pub fn fail_update_calls(mut self, calls: impl IntoIterator<Item = usize>) -> Self {
        self.failing_calls.extend(calls);
        self
    }

    /// Fail every update issued for `identity`.
    pub fn fail_identity(mut self, identity: &Identity) -> Self {
        self.failing_identities.insert(identity.expose().to_owned());
        self
    }

    /// Sleep before answering each update call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_friends(mut self, friends: Vec<FriendLocation>) -> Self {
        self.friends = friends;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn update_count(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.updates.lock().clone()
    }

    pub fn updates_for(&self, identity: &Identity) -> Vec<LocationUpdate> {
        self.updates
            .lock()
            .iter()
            .filter(|r| &r.identity == identity)
            .map(|r| r.update.clone())
            .collect()
    }

    pub fn last_update(&self) -> Option<RecordedUpdate> {
        self.updates.lock().last().cloned()
    }
}

#[async_trait]
impl LocationService for MockLocationService {
    async fn login(&self, _email: &str, _password: &str) -> Result<String, UpstreamError> {
        self.token
            .clone()
            .ok_or_else(|| UpstreamError::Rejected("no token configured".into()))
    }

    async fn update_location(
        &self,
        identity: &Identity,
        update: &LocationUpdate,
    ) -> Result<(), UpstreamError> {
        let call = self.update_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.updates.lock().push(RecordedUpdate {
            identity: identity.clone(),
            update: update.clone(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing_calls.contains(&call) || self.failing_identities.contains(identity.expose()) {
            return Err(UpstreamError::Status {
                status: 500,
                body: format!("scripted failure on call {call}"),
            });
        }
        Ok(())
    }

    async fn get_profile(&self, _identity: &Identity) -> Result<Profile, UpstreamError> {
        self.profile
            .clone()
            .ok_or_else(|| UpstreamError::Unauthorized("no profile configured".into()))
    }

    async fn friend_locations(
        &self,
        _identity: &Identity,
    ) -> Result<Vec<FriendLocation>, UpstreamError> {
        Ok(self.friends.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strider_core::RouteStep;

    fn update() -> LocationUpdate {
        LocationUpdate::moving(RouteStep::new(1.0, 2.0), 4.0, 90.0)
    }

    #[tokio::test]
    async fn records_every_call() {
        let mock = MockLocationService::new();
        let id = Identity::new("abc");
        mock.update_location(&id, &update()).await.unwrap();
        mock.update_location(&id, &update()).await.unwrap();
        assert_eq!(mock.update_count(), 2);
        assert_eq!(mock.updates_for(&id).len(), 2);
    }

    #[tokio::test]
    async fn scripted_call_failures() {
        let mock = MockLocationService::new().fail_update_calls([2]);
        let id = Identity::new("abc");
        assert!(mock.update_location(&id, &update()).await.is_ok());
        assert!(mock.update_location(&id, &update()).await.is_err());
        assert!(mock.update_location(&id, &update()).await.is_ok());
        assert_eq!(mock.update_count(), 3);
    }

    #[tokio::test]
    async fn identity_failures() {
        let bad = Identity::new("bad");
        let mock = MockLocationService::new().fail_identity(&bad);
        assert!(mock.update_location(&bad, &update()).await.is_err());
        assert!(mock.update_location(&Identity::new("good"), &update()).await.is_ok());
    }

    #[tokio::test]
    async fn profile_missing_is_unauthorized() {
        let mock = MockLocationService::new();
        let err = mock.get_profile(&Identity::new("x")).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Unauthorized(_)));
    }
}
