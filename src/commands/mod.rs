pub mod market_data;
pub mod market_stream;
