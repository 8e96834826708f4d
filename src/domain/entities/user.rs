use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Platform role attached to every authenticated principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Trader,
    FundedTrader,
    Admin,
    SuperAdmin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Trader => "trader",
            UserRole::FundedTrader => "funded_trader",
            UserRole::Admin => "admin",
            UserRole::SuperAdmin => "super_admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trader" => Some(UserRole::Trader),
            "funded_trader" => Some(UserRole::FundedTrader),
            "admin" => Some(UserRole::Admin),
            "super_admin" => Some(UserRole::SuperAdmin),
            _ => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, UserRole::Admin | UserRole::SuperAdmin)
    }
}

/// A platform user. Created on first successful authentication, never
/// deleted — misbehaving accounts are blocked instead.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    /// Identity assigned by the embedding host.
    pub external_id: i64,
    pub display_name: String,
    pub role: UserRole,
    pub is_blocked: bool,
    pub referral_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_str() {
        for role in [
            UserRole::Trader,
            UserRole::FundedTrader,
            UserRole::Admin,
            UserRole::SuperAdmin,
        ] {
            assert_eq!(UserRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(UserRole::parse("guest"), None);
    }

    #[test]
    fn admin_check() {
        assert!(UserRole::Admin.is_admin());
        assert!(UserRole::SuperAdmin.is_admin());
        assert!(!UserRole::Trader.is_admin());
        assert!(!UserRole::FundedTrader.is_admin());
    }
}
