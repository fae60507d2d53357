use guidedflow::shared::errors::StoreError;
use guidedflow::templates::{FileTemplateStore, TemplateCatalog};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

fn write(dir: &std::path::Path, name: &str, body: &str) {
    fs::create_dir_all(dir).expect("create templates dir");
    fs::write(dir.join(name), body).expect("write template");
}

#[test]
fn catalog_module_lists_bundled_templates() {
    let ids: Vec<String> = TemplateCatalog::bundled_only()
        .list()
        .expect("list")
        .into_iter()
        .map(|template| template.id)
        .collect();
    assert_eq!(ids, vec!["feature-delivery", "bug-fix"]);
}

#[test]
fn catalog_module_custom_templates_override_bundled_by_id() {
    let temp = tempdir().expect("tempdir");
    let store = FileTemplateStore::new(temp.path());
    let dir = store.templates_dir();
    write(
        &dir,
        "bug-fix.yaml",
        r#"
id: bug-fix
name: Team bug fix
phases:
  - id: only
    name: Only
    steps:
      - id: fix
        name: Fix
        prompt: fix it
        commit: true
"#,
    );
    write(
        &dir,
        "review.json",
        r#"{"id":"review","name":"Review","phases":[{"id":"p","name":"P","steps":[{"id":"s","name":"S","prompt":"review"}]}]}"#,
    );
    write(&dir, "README.md", "not a template");

    let catalog = TemplateCatalog::with_custom_store(Arc::new(store));
    let templates = catalog.list().expect("list");
    let ids: Vec<&str> = templates.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["feature-delivery", "bug-fix", "review"]);

    let bug_fix = catalog
        .find("bug-fix")
        .expect("find")
        .expect("bug-fix exists");
    assert_eq!(bug_fix.name, "Team bug fix");
    assert_eq!(bug_fix.step_count(), 1);
    assert!(bug_fix.phases[0].steps[0].commit);
    assert!(catalog.find("missing").expect("find").is_none());
}

#[test]
fn catalog_module_rejects_invalid_custom_template() {
    let temp = tempdir().expect("tempdir");
    let store = FileTemplateStore::new(temp.path());
    write(
        &store.templates_dir(),
        "dup.yaml",
        r#"
id: dup
name: Duplicate steps
phases:
  - id: a
    name: A
    steps:
      - id: same
        name: One
        prompt: one
      - id: same
        name: Two
        prompt: two
"#,
    );

    let err = TemplateCatalog::with_custom_store(Arc::new(store))
        .list()
        .expect_err("duplicate step ids rejected");
    match err {
        StoreError::Invalid { reason, .. } => assert!(reason.contains("duplicate step id")),
        other => panic!("unexpected error: {other:?}"),
    }
}
