//! Propdesk Engine Library
//!
//! Core components of the propdesk simulated prop-trading platform:
//! price ingestion, trade ledger, risk evaluation, phase state machine,
//! payouts, leaderboards and the HTTP/WebSocket surface.

pub mod api;
pub mod application;
pub mod auth;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod rate_limit;
