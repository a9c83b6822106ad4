//! Production / development partition.
//!
//! The realm is resolved once, from the verified token's phone claim, and
//! then carried explicitly in `AuthContext` and `DataContext`.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Realm {
    Production,
    Development,
}

impl Realm {
    /// `Development` iff `phone` is the configured development identity.
    pub fn for_phone(phone: &str, dev_phone: Option<&str>) -> Self {
        match dev_phone {
            Some(dev) if !dev.is_empty() && dev == phone => Realm::Development,
            _ => Realm::Production,
        }
    }

    pub fn is_development(self) -> bool {
        matches!(self, Realm::Development)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Realm::Production => "production",
            Realm::Development => "development",
        }
    }
}

impl std::fmt::Display for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_phone_selects_development() {
        assert_eq!(
            Realm::for_phone("+919999999999", Some("+919999999999")),
            Realm::Development
        );
        assert_eq!(
            Realm::for_phone("+919876543210", Some("+919999999999")),
            Realm::Production
        );
    }

    #[test]
    fn test_missing_dev_phone_is_production() {
        assert_eq!(Realm::for_phone("+919999999999", None), Realm::Production);
        assert_eq!(Realm::for_phone("", Some("")), Realm::Production);
    }
}
