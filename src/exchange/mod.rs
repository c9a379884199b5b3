pub mod client;
pub mod types;
pub mod ws;

pub use client::InfoClient;
pub use ws::WsClient;
