pub mod types;

pub use types::{
    AccessLevel, ProviderCapabilities, ProviderError, ProviderKind, ProviderRegistry,
    RuntimeOptions,
};
