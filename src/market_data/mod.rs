pub mod aggregator;
pub mod tick_store;
pub mod trade_stream;

pub use aggregator::{AggregatorSettings, OhlcAggregator};
pub use tick_store::TickStore;
pub use trade_stream::{ConnectionState, StreamClient, StreamSettings};
