pub mod bundled;
pub mod catalog;
pub mod model;

pub use bundled::bundled_workflow_templates;
pub use catalog::{FileTemplateStore, TemplateCatalog, WorkflowTemplateStore};
pub use model::{WorkflowPhase, WorkflowStep, WorkflowTemplate};
