pub mod candle_builder;
pub mod circuit_breaker;
pub mod margin;
pub mod phase;
pub mod pnl;
