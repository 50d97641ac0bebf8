//! Request and response shapes of the upstream HTTP API.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use strider_core::upstream::{FriendLocation, Profile};
use strider_core::{LocationUpdate, UpstreamError};

pub const LOGIN_PATH: &str = "/api/email/login";
pub const LOCATION_PATH: &str = "/api/user/location";
pub const PROFILE_PATH: &str = "/api/my";
pub const FRIENDS_PATH: &str = "/api/locations";

/// Location source code reported for every update.
const LOCATION_TYPE: &str = "5";
const HORIZONTAL_ACCURACY: &str = "1";
const OS_INFO: &str = "ios";
const OS_VERSION: &str = "0.0";

/// `stayed_at` timestamps go on the wire as UTC with an explicit offset.
pub fn format_stayed_at(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S +0000").to_string()
}

/// Form body for `PATCH /api/user/location`.
pub fn location_form(update: &LocationUpdate) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("user_location[latitude]", update.step.lat.to_string()),
        ("user_location[longitude]", update.step.lng.to_string()),
        ("user_location[speed]", update.speed_ms().to_string()),
        ("user_location[getting_location_type]", LOCATION_TYPE.to_owned()),
        ("user_location[horizontal_accuracy]", HORIZONTAL_ACCURACY.to_owned()),
        ("app_state[active]", update.is_active.to_string()),
        ("user_battery[level]", update.battery.to_string()),
        (
            "user_battery[state]",
            if update.is_charging { "0" } else { "1" }.to_owned(),
        ),
        ("user_device[os_info]", OS_INFO.to_owned()),
        ("user_device[os_version]", OS_VERSION.to_owned()),
    ];
    if let Some(t) = &update.stayed_at {
        form.push(("user_location[stayed_at]", format_stayed_at(t)));
    }
    form
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub errors: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ProfileResponse {
    #[serde(default)]
    pub user: Option<Profile>,
    #[serde(default)]
    pub errors: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct FriendsResponse {
    #[serde(default)]
    pub locations: Option<Vec<FriendLocation>>,
    #[serde(default)]
    pub errors: Option<Value>,
}

/// `errors` is present on most responses; only a non-empty value counts.
pub fn check_errors(errors: &Option<Value>) -> Result<(), UpstreamError> {
    match errors {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Array(a)) if a.is_empty() => Ok(()),
        Some(Value::Object(o)) if o.is_empty() => Ok(()),
        Some(Value::String(s)) if s.is_empty() => Ok(()),
        Some(other) => Err(UpstreamError::Rejected(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use strider_core::RouteStep;

    fn field<'a>(form: &'a [(&'static str, String)], key: &str) -> Option<&'a str> {
        form.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn moving_form_fields() {
        let update = LocationUpdate::moving(RouteStep::new(35.5, 139.25), 18.0, 64.0);
        let form = location_form(&update);
        assert_eq!(field(&form, "user_location[latitude]"), Some("35.5"));
        assert_eq!(field(&form, "user_location[longitude]"), Some("139.25"));
        assert_eq!(field(&form, "user_location[speed]"), Some("5"));
        assert_eq!(field(&form, "user_location[getting_location_type]"), Some("5"));
        assert_eq!(field(&form, "user_battery[level]"), Some("64"));
        assert_eq!(field(&form, "user_battery[state]"), Some("1"));
        assert_eq!(field(&form, "app_state[active]"), Some("false"));
        assert_eq!(field(&form, "user_location[stayed_at]"), None);
    }

    #[test]
    fn stationary_form_carries_stayed_at() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let mut update = LocationUpdate::stationary(RouteStep::new(1.0, 2.0), 100.0, Some(at));
        update.is_charging = true;
        let form = location_form(&update);
        assert_eq!(field(&form, "user_location[speed]"), Some("0"));
        assert_eq!(
            field(&form, "user_location[stayed_at]"),
            Some("2026-01-02 03:04:05 +0000")
        );
        assert_eq!(field(&form, "user_battery[state]"), Some("0"));
    }

    #[test]
    fn empty_errors_accepted() {
        assert!(check_errors(&None).is_ok());
        assert!(check_errors(&Some(Value::Null)).is_ok());
        assert!(check_errors(&Some(json!([]))).is_ok());
    }

    #[test]
    fn populated_errors_rejected() {
        let err = check_errors(&Some(json!(["invalid password"]))).unwrap_err();
        assert!(matches!(err, UpstreamError::Rejected(msg) if msg.contains("invalid password")));
    }
}
