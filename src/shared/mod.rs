pub mod errors;
pub mod fs_atomic;
pub mod ids;
pub mod logging;
pub mod time;

pub use errors::StoreError;
pub use logging::EventLog;
pub use time::{Clock, SystemClock};
