pub mod gateway;
pub mod meta_store;

pub use gateway::{GatewayError, SendReceipt, SessionGateway, SessionSummary, StartSessionRequest};
pub use meta_store::{FileSessionMetaStore, SessionMeta, SessionMetaStore};
