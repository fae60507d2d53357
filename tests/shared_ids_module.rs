use guidedflow::shared::ids::{derive_stable_id, generate_compact_id, validate_identifier_value};

#[test]
fn shared_ids_module_validates_store_keys() {
    assert!(validate_identifier_value("run id", "run-abc_1.x").is_ok());
    assert!(validate_identifier_value("run id", "").is_err());
    assert!(validate_identifier_value("run id", "run 1").is_err());
    assert!(validate_identifier_value("session id", "a/b").is_err());
}

#[test]
fn shared_ids_module_generates_safe_compact_ids() {
    let id = generate_compact_id("run", 1_700_000_000).expect("id");
    assert!(id.starts_with("run-"));
    validate_identifier_value("run id", &id).expect("compact id is a valid key");
    assert!(generate_compact_id("run", -1).is_err());
}

#[test]
fn shared_ids_module_derives_stable_ids() {
    let first = derive_stable_id("dec", &["run-1", "step-1", "turn-1"]);
    let again = derive_stable_id("dec", &["run-1", "step-1", "turn-1"]);
    let other = derive_stable_id("dec", &["run-1", "step-1", "turn-2"]);
    assert_eq!(first, again);
    assert_ne!(first, other);
    assert!(first.starts_with("dec-"));
    assert_eq!(first.len(), "dec-".len() + 16);
}
