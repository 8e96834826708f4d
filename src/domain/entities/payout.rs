use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payout lifecycle: `pending -> approved -> sent` (admin-driven) or
/// `pending -> rejected`. `sent` and `rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Approved,
    Rejected,
    Sent,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Approved => "approved",
            PayoutStatus::Rejected => "rejected",
            PayoutStatus::Sent => "sent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PayoutStatus::Pending),
            "approved" => Some(PayoutStatus::Approved),
            "rejected" => Some(PayoutStatus::Rejected),
            "sent" => Some(PayoutStatus::Sent),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PayoutStatus::Sent | PayoutStatus::Rejected)
    }

    /// Approved and sent payouts count against the trader's profit share.
    pub fn is_committed(&self) -> bool {
        matches!(self, PayoutStatus::Approved | PayoutStatus::Sent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PayoutNetwork {
    Trc20,
    Erc20,
    Bep20,
}

impl PayoutNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutNetwork::Trc20 => "TRC20",
            PayoutNetwork::Erc20 => "ERC20",
            PayoutNetwork::Bep20 => "BEP20",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRC20" => Some(PayoutNetwork::Trc20),
            "ERC20" => Some(PayoutNetwork::Erc20),
            "BEP20" => Some(PayoutNetwork::Bep20),
            _ => None,
        }
    }
}

/// A withdrawal request against a funded challenge's profit share.
#[derive(Debug, Clone, Serialize)]
pub struct Payout {
    pub id: i64,
    pub challenge_id: i64,
    pub user_id: i64,
    pub amount: f64,
    pub wallet_address: String,
    pub network: PayoutNetwork,
    pub status: PayoutStatus,
    pub tx_hash: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_committed_states() {
        assert!(PayoutStatus::Sent.is_terminal());
        assert!(PayoutStatus::Rejected.is_terminal());
        assert!(!PayoutStatus::Pending.is_terminal());
        assert!(!PayoutStatus::Approved.is_terminal());

        assert!(PayoutStatus::Approved.is_committed());
        assert!(PayoutStatus::Sent.is_committed());
        assert!(!PayoutStatus::Pending.is_committed());
        assert!(!PayoutStatus::Rejected.is_committed());
    }

    #[test]
    fn network_round_trips() {
        for s in ["TRC20", "ERC20", "BEP20"] {
            assert_eq!(PayoutNetwork::parse(s).unwrap().as_str(), s);
        }
        assert_eq!(PayoutNetwork::parse("BTC"), None);
    }
}
