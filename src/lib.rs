pub mod bus;
pub mod config;
pub mod engines;
pub mod envelope;
pub mod gateway;
pub mod markdown;
pub mod relay;
pub mod store;
pub mod telegram;
pub mod telegram_log;
pub mod voice;
