//! Contract for the remote social-location service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::UpstreamError;
use crate::ids::Identity;
use crate::route::RouteStep;

/// One location report, speed in km/h. Implementations convert units.
#[derive(Clone, Debug, PartialEq)]
pub struct LocationUpdate {
    pub step: RouteStep,
    pub speed_kmh: f64,
    pub battery: f64,
    pub stayed_at: Option<DateTime<Utc>>,
    pub is_charging: bool,
    pub is_active: bool,
}

impl LocationUpdate {
    /// A moving update, as sent for every route step.
    pub fn moving(step: RouteStep, speed_kmh: f64, battery: f64) -> Self {
        Self {
            step,
            speed_kmh,
            battery,
            stayed_at: None,
            is_charging: false,
            is_active: false,
        }
    }

    /// A stationary update: speed zero, pinned to `stayed_at`.
    pub fn stationary(step: RouteStep, battery: f64, stayed_at: Option<DateTime<Utc>>) -> Self {
        Self {
            step,
            speed_kmh: 0.0,
            battery,
            stayed_at,
            is_charging: false,
            is_active: false,
        }
    }

    pub fn speed_ms(&self) -> f64 {
        self.speed_kmh / 3.6
    }
}

/// The signed-in user's own profile.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    #[serde(default)]
    pub uid: Option<i64>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub profile_image: Option<String>,
    #[serde(default)]
    pub introduction: Option<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub friend_count: Option<i64>,
    #[serde(default)]
    pub private_mode: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Battery {
    #[serde(default)]
    pub level: f64,
    #[serde(default)]
    pub state: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FriendUser {
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub profile_image: Option<String>,
    #[serde(default)]
    pub online: bool,
}

/// A friend's last reported position.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FriendLocation {
    #[serde(deserialize_with = "f64_from_string_or_number")]
    pub latitude: f64,
    #[serde(deserialize_with = "f64_from_string_or_number")]
    pub longitude: f64,
    #[serde(default)]
    pub stayed_at: Option<String>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub battery: Option<Battery>,
    pub user: FriendUser,
    #[serde(default)]
    pub updated_at: Option<String>,
}

fn f64_from_string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Request/response client for the upstream service. No call retries
/// internally; callers own retry policy.
#[async_trait]
pub trait LocationService: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<String, UpstreamError>;

    async fn update_location(
        &self,
        identity: &Identity,
        update: &LocationUpdate,
    ) -> Result<(), UpstreamError>;

    async fn get_profile(&self, identity: &Identity) -> Result<Profile, UpstreamError>;

    async fn friend_locations(&self, identity: &Identity) -> Result<Vec<FriendLocation>, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_converted_to_metres_per_second() {
        let u = LocationUpdate::moving(RouteStep::new(0.0, 0.0), 36.0, 50.0);
        assert!((u.speed_ms() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn stationary_forces_zero_speed() {
        let u = LocationUpdate::stationary(RouteStep::new(0.0, 0.0), 80.0, None);
        assert_eq!(u.speed_kmh, 0.0);
        assert!(!u.is_active);
    }

    #[test]
    fn friend_location_accepts_string_coordinates() {
        let json = r#"{
            "latitude": "35.6812",
            "longitude": 139.7671,
            "user": {"id": 7, "username": "kai"}
        }"#;
        let loc: FriendLocation = serde_json::from_str(json).unwrap();
        assert!((loc.latitude - 35.6812).abs() < 1e-9);
        assert!((loc.longitude - 139.7671).abs() < 1e-9);
        assert_eq!(loc.user.username, "kai");
    }

    #[test]
    fn profile_tolerates_missing_fields() {
        let p: Profile = serde_json::from_str(r#"{"id": 1, "username": "me"}"#).unwrap();
        assert_eq!(p.id, 1);
        assert_eq!(p.username, "me");
        assert!(!p.online);
    }
}
