pub mod trade_buffer;
pub mod trade_stream;

pub use trade_buffer::{Trade, TradeBuffer, DEFAULT_TICKER_CAPACITY};
pub use trade_stream::{FeedStatus, LiveTicker, TickerConfig, TickerSnapshot, TradeTape};
