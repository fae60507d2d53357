use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),
    #[error("provider `{0}` does not support workflow dispatch")]
    DispatchUnsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProviderKind {
    Codex,
    Claude,
    OpenCode,
    Terminal,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Claude => "claude",
            Self::OpenCode => "opencode",
            Self::Terminal => "terminal",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ProviderKind {
    type Error = ProviderError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "codex" => Ok(Self::Codex),
            "claude" => Ok(Self::Claude),
            "opencode" => Ok(Self::OpenCode),
            "terminal" => Ok(Self::Terminal),
            other => Err(ProviderError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    ReadOnly,
    #[default]
    WorkspaceWrite,
    FullAccess,
}

impl AccessLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::WorkspaceWrite => "workspace_write",
            Self::FullAccess => "full_access",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeOptions {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub access_level: Option<AccessLevel>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
}

impl RuntimeOptions {
    pub fn is_empty(&self) -> bool {
        self.provider.is_none()
            && self.model.is_none()
            && self.access_level.is_none()
            && self.reasoning_effort.is_none()
    }
}

/// What a provider can do, fixed at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub dispatch: bool,
    pub runtime_options: bool,
}

#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, ProviderCapabilities>,
    default_provider: String,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProviderRegistry {
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: BTreeMap::new(),
            default_provider: normalize_provider_id(&default_provider.into()),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new(ProviderKind::Codex.as_str());
        registry.register(
            ProviderKind::Codex.as_str(),
            ProviderCapabilities {
                dispatch: true,
                runtime_options: true,
            },
        );
        registry.register(
            ProviderKind::Claude.as_str(),
            ProviderCapabilities {
                dispatch: true,
                runtime_options: true,
            },
        );
        registry.register(
            ProviderKind::OpenCode.as_str(),
            ProviderCapabilities {
                dispatch: true,
                runtime_options: false,
            },
        );
        registry.register(
            ProviderKind::Terminal.as_str(),
            ProviderCapabilities {
                dispatch: false,
                runtime_options: false,
            },
        );
        registry
    }

    pub fn register(&mut self, provider: &str, capabilities: ProviderCapabilities) {
        self.providers
            .insert(normalize_provider_id(provider), capabilities);
    }

    pub fn capabilities(&self, provider: &str) -> Option<ProviderCapabilities> {
        self.providers.get(&normalize_provider_id(provider)).copied()
    }

    pub fn supports_dispatch(&self, provider: &str) -> bool {
        self.capabilities(provider)
            .map(|caps| caps.dispatch)
            .unwrap_or(false)
    }

    pub fn supports_runtime_options(&self, provider: &str) -> bool {
        self.capabilities(provider)
            .map(|caps| caps.runtime_options)
            .unwrap_or(false)
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    pub fn require_dispatch(&self, provider: &str) -> Result<String, ProviderError> {
        let id = normalize_provider_id(provider);
        match self.capabilities(&id) {
            Some(caps) if caps.dispatch => Ok(id),
            Some(_) => Err(ProviderError::DispatchUnsupported(id)),
            None => Err(ProviderError::UnknownProvider(id)),
        }
    }

    /// Maps a configured provider onto one that can take dispatches, falling
    /// back to the registry default.
    pub fn normalize_dispatch_provider(&self, configured: Option<&str>) -> String {
        configured
            .map(normalize_provider_id)
            .filter(|id| !id.is_empty() && self.supports_dispatch(id))
            .unwrap_or_else(|| self.default_provider.clone())
    }
}

fn normalize_provider_id(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
