pub mod feed_websocket; // Push transport with fixed-interval reconnect
pub mod token_rest; // Token metadata + transaction history

pub use feed_websocket::FeedWebSocketClient;
pub use token_rest::TokenRestClient;
