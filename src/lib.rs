// src/lib.rs
pub mod ports {
    pub mod execution;
    pub mod paper_venue;
    pub mod replay_feed;
}
pub mod alert_notifier;
pub mod config;
pub mod email_client;
pub mod gridtrade;
