pub mod bunch;
pub mod channel;
pub mod channel_table;
