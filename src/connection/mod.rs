pub mod channel_record;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod handler;
pub mod packet_notify;
pub mod packet_order_cache;
pub mod sequence_history;
pub mod transport;
