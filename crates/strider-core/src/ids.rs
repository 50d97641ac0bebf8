use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

branded_id!(ConnectionId, "conn");
branded_id!(RunId, "run");

/// Length of the identity prefix that is safe to put in logs.
const REDACTED_PREFIX: usize = 6;

/// The decoded upstream access token identifying one simulated user.
///
/// It doubles as the bearer credential for the upstream service, so
/// `Display` and `Debug` only ever show a short prefix.
#[derive(Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The full token. Only upstream requests and the store should need this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(REDACTED_PREFIX).collect();
        format!("{prefix}…")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Identity").field(&self.redacted()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_has_prefix() {
        let id = ConnectionId::new();
        assert!(id.as_str().starts_with("conn_"), "got: {id}");
    }

    #[test]
    fn run_ids_are_unique_and_ordered() {
        let ids: Vec<RunId> = (0..50).map(|_| RunId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str());
        }
    }

    #[test]
    fn identity_display_is_redacted() {
        let id = Identity::new("abcdefghijklmnop");
        assert_eq!(id.to_string(), "abcdef…");
        assert!(!format!("{id:?}").contains("ghij"));
        assert_eq!(id.expose(), "abcdefghijklmnop");
    }

    #[test]
    fn short_identity_redacts_whole_value() {
        let id = Identity::new("abc");
        assert_eq!(id.redacted(), "abc…");
    }
}
