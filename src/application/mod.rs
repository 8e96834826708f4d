pub mod leaderboard;
pub mod locks;
pub mod payout_service;
pub mod price_feed;
pub mod push;
pub mod risk_evaluator;
pub mod session;
pub mod trade_service;
