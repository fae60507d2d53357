use crate::sessions::meta_store::is_json_file;
use crate::shared::errors::StoreError;
use crate::templates::bundled::bundled_workflow_templates;
use crate::templates::model::WorkflowTemplate;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait WorkflowTemplateStore: Send + Sync {
    fn list_workflow_templates(&self) -> Result<Vec<WorkflowTemplate>, StoreError>;
}

/// Reads custom templates from `<state_root>/workflows/templates/*.yaml`
/// (JSON files in the same directory are accepted too).
#[derive(Debug, Clone)]
pub struct FileTemplateStore {
    state_root: PathBuf,
}

impl FileTemplateStore {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
        }
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.state_root.join("workflows/templates")
    }
}

impl WorkflowTemplateStore for FileTemplateStore {
    fn list_workflow_templates(&self) -> Result<Vec<WorkflowTemplate>, StoreError> {
        let dir = self.templates_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::read(&dir, source)),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::read(&dir, source))?;
            let path = entry.path();
            if is_yaml_file(&path) || is_json_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut templates = Vec::with_capacity(paths.len());
        for path in paths {
            templates.push(read_template(&path)?);
        }
        Ok(templates)
    }
}

fn is_yaml_file(path: &Path) -> bool {
    path.is_file()
        && matches!(
            path.extension().and_then(|value| value.to_str()),
            Some("yaml") | Some("yml")
        )
}

fn read_template(path: &Path) -> Result<WorkflowTemplate, StoreError> {
    let raw = fs::read_to_string(path).map_err(|source| StoreError::read(path, source))?;
    let template: WorkflowTemplate = if is_json_file(path) {
        serde_json::from_str(&raw).map_err(|source| StoreError::json(path, source))?
    } else {
        serde_yaml::from_str(&raw).map_err(|source| StoreError::Yaml {
            path: path.display().to_string(),
            source,
        })?
    };
    template.validate().map_err(|reason| StoreError::Invalid {
        path: path.display().to_string(),
        reason,
    })?;
    Ok(template)
}

/// Bundled templates overlaid with custom ones; a custom template replaces a
/// bundled template with the same id.
#[derive(Clone, Default)]
pub struct TemplateCatalog {
    custom: Option<Arc<dyn WorkflowTemplateStore>>,
}

impl TemplateCatalog {
    pub fn bundled_only() -> Self {
        Self { custom: None }
    }

    pub fn with_custom_store(store: Arc<dyn WorkflowTemplateStore>) -> Self {
        Self {
            custom: Some(store),
        }
    }

    pub fn list(&self) -> Result<Vec<WorkflowTemplate>, StoreError> {
        let mut by_id = BTreeMap::new();
        let mut order = Vec::new();
        for template in bundled_workflow_templates() {
            order.push(template.id.clone());
            by_id.insert(template.id.clone(), template);
        }
        if let Some(store) = self.custom.as_ref() {
            for template in store.list_workflow_templates()? {
                if !by_id.contains_key(&template.id) {
                    order.push(template.id.clone());
                }
                by_id.insert(template.id.clone(), template);
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect())
    }

    pub fn find(&self, template_id: &str) -> Result<Option<WorkflowTemplate>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|template| template.id == template_id))
    }
}

impl std::fmt::Debug for TemplateCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateCatalog")
            .field("custom", &self.custom.is_some())
            .finish()
    }
}
