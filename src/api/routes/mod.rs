pub mod admin;
pub mod auth;
pub mod challenges;
pub mod leaderboard;
pub mod payouts;
pub mod stats;
pub mod trading;
pub mod ws;
