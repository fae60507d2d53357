pub mod config;
pub mod notifications;
pub mod orchestration;
pub mod provider;
pub mod sessions;
pub mod shared;
pub mod templates;
