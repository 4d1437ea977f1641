//! Integration tests for the persistent instance registry.
//!
//! Each test runs against a real backing file in its own temp directory, so
//! the properties hold through actual serialize/lock/persist cycles, not
//! just in memory.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use cvdd::error::Error;
use cvdd::registry::{Filter, GroupSpec, Instance, InstanceRegistry};

struct Workspace {
    root: PathBuf,
    artifacts: PathBuf,
}

impl Workspace {
    fn new(tag: &str) -> Self {
        let root = std::env::temp_dir().join(format!(
            "cvdd_registry_{}_{}",
            tag,
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos()
        ));
        let artifacts = root.join("toolkit");
        std::fs::create_dir_all(artifacts.join("bin")).unwrap();
        Self { root, artifacts }
    }

    fn registry(&self) -> InstanceRegistry {
        InstanceRegistry::new(self.root.join("registry.json"))
    }

    fn spec(&self, name: &str, home: &str, ids: &[u32]) -> GroupSpec {
        GroupSpec {
            name: name.to_string(),
            home_directory: self.root.join("homes").join(home),
            host_artifacts_path: self.artifacts.clone(),
            product_out_path: self.artifacts.to_string_lossy().into_owned(),
            is_default_group: false,
            instances: ids
                .iter()
                .map(|id| Instance {
                    id: *id,
                    name: id.to_string(),
                })
                .collect(),
        }
    }

    fn registry_bytes(&self) -> Vec<u8> {
        std::fs::read(self.root.join("registry.json")).unwrap()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

#[test]
fn add_group_appears_in_listing() {
    let ws = Workspace::new("add");
    let registry = ws.registry();
    assert!(registry.is_empty().unwrap());

    let group = registry.add_group(ws.spec("g", "h", &[1])).unwrap();
    assert_eq!(group.name, "g");
    assert!(!registry.is_empty().unwrap());

    let groups = registry.list_groups().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].instances.len(), 1);
    assert_eq!(groups[0].instances[0].id, 1);
    // The home directory was created as a side effect.
    assert!(groups[0].home_directory.is_dir());
}

#[test]
fn conflicting_home_is_rejected_without_mutation() {
    let ws = Workspace::new("home_conflict");
    let registry = ws.registry();
    registry.add_group(ws.spec("g1", "shared", &[1])).unwrap();
    let before = ws.registry_bytes();

    let err = registry.add_group(ws.spec("g2", "shared", &[2])).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    assert_eq!(ws.registry_bytes(), before);
    assert_eq!(registry.list_groups().unwrap().len(), 1);
}

#[test]
fn conflicting_instance_id_is_rejected_without_mutation() {
    let ws = Workspace::new("id_conflict");
    let registry = ws.registry();
    registry.add_group(ws.spec("g1", "h1", &[2])).unwrap();
    let before = ws.registry_bytes();

    let err = registry.add_group(ws.spec("g2", "h2", &[2])).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    assert_eq!(ws.registry_bytes(), before);
}

#[test]
fn invalid_group_name_is_rejected() {
    let ws = Workspace::new("bad_name");
    let registry = ws.registry();
    let err = registry.add_group(ws.spec("2fast", "h", &[1])).unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
    assert!(registry.is_empty().unwrap());
}

#[test]
fn add_then_remove_leaves_the_file_byte_identical() {
    let ws = Workspace::new("byte_identical");
    let registry = ws.registry();
    registry.add_group(ws.spec("keeper", "h0", &[1])).unwrap();
    let before = ws.registry_bytes();

    registry.add_group(ws.spec("transient", "h1", &[7])).unwrap();
    assert!(registry.remove_group("transient").unwrap());

    assert_eq!(ws.registry_bytes(), before);
}

#[test]
fn remove_returns_false_for_unknown_group() {
    let ws = Workspace::new("remove_unknown");
    let registry = ws.registry();
    assert!(!registry.remove_group("ghost").unwrap());
}

#[test]
fn clear_returns_the_prior_listing_and_empties() {
    let ws = Workspace::new("clear");
    let registry = ws.registry();
    registry.add_group(ws.spec("a", "ha", &[1])).unwrap();
    registry.add_group(ws.spec("b", "hb", &[2])).unwrap();

    let listed = registry.list_groups().unwrap();
    let cleared = registry.clear().unwrap();
    assert_eq!(cleared, listed);
    assert!(registry.is_empty().unwrap());
    assert!(registry.list_groups().unwrap().is_empty());
}

#[test]
fn groups_survive_reopening_the_backing_file() {
    let ws = Workspace::new("reopen");
    let registry = ws.registry();
    registry.add_group(ws.spec("a", "ha", &[1, 2])).unwrap();
    registry.add_group(ws.spec("b", "hb", &[5])).unwrap();
    let before = registry.list_groups().unwrap();
    drop(registry);

    let reopened = ws.registry();
    let after = reopened.list_groups().unwrap();
    assert_eq!(before, after);
}

#[test]
fn empty_filter_matches_the_full_listing() {
    let ws = Workspace::new("empty_filter");
    let registry = ws.registry();
    registry.add_group(ws.spec("a", "ha", &[1])).unwrap();
    registry.add_group(ws.spec("b", "hb", &[2])).unwrap();

    let all = registry.find_groups(&Filter::default()).unwrap();
    assert_eq!(all, registry.list_groups().unwrap());
}

#[test]
fn filter_semantics_match_membership() {
    let ws = Workspace::new("semantics");
    let registry = ws.registry();
    registry.add_group(ws.spec("a", "ha", &[1, 2])).unwrap();
    registry.add_group(ws.spec("b", "hb", &[5])).unwrap();

    // By id: only the group holding that instance.
    let by_id = registry.find_groups(&Filter::id(5)).unwrap();
    assert_eq!(by_id.len(), 1);
    assert_eq!(by_id[0].name, "b");

    // By group name and home combined.
    let filter = Filter {
        group_name: Some("a".into()),
        home: Some(ws.root.join("homes").join("ha")),
        ..Default::default()
    };
    assert_eq!(registry.find_groups(&filter).unwrap().len(), 1);

    // Mismatched combination matches nothing.
    let filter = Filter {
        group_name: Some("a".into()),
        id: Some(5),
        ..Default::default()
    };
    assert!(registry.find_groups(&filter).unwrap().is_empty());

    // Instance queries flatten the group context in.
    let instances = registry.find_instances(&Filter::id(2)).unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].group_name, "a");
    assert_eq!(instances[0].device_name, "a-2");
}

#[test]
fn import_appends_groups_from_serialized_form() {
    let ws = Workspace::new("import");
    let registry = ws.registry();
    registry.add_group(ws.spec("resident", "h0", &[1])).unwrap();

    let blob = serde_json::json!({
        "Groups": [{
            "name": "imported",
            "home_directory": ws.root.join("homes/imported"),
            "host_artifacts_path": ws.artifacts,
            "product_out_path": "/opt/out",
            "instances": [{ "id": 9, "name": "9" }],
            "start_time": "2026-08-01T00:00:00Z"
        }]
    });
    registry.load_from_json(&blob.to_string()).unwrap();

    let groups = registry.list_groups().unwrap();
    assert_eq!(groups.len(), 2);
    assert!(groups.iter().any(|g| g.name == "imported"));
}

#[test]
fn import_without_groups_key_is_invalid() {
    let ws = Workspace::new("import_bad");
    let registry = ws.registry();
    let err = registry.load_from_json("{\"NotGroups\": []}").unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));

    let err = registry.load_from_json("{\"Groups\": 7}").unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
}

#[test]
fn import_conflict_leaves_registry_unchanged() {
    let ws = Workspace::new("import_conflict");
    let registry = ws.registry();
    registry.add_group(ws.spec("resident", "h0", &[1])).unwrap();
    let before = ws.registry_bytes();

    let blob = serde_json::json!({
        "Groups": [
            {
                "name": "fresh",
                "home_directory": ws.root.join("homes/fresh"),
                "host_artifacts_path": ws.artifacts,
                "product_out_path": "/opt/out",
                "instances": [{ "id": 4, "name": "4" }],
                "start_time": "2026-08-01T00:00:00Z"
            },
            {
                "name": "clash",
                "home_directory": ws.root.join("homes/clash"),
                "host_artifacts_path": ws.artifacts,
                "product_out_path": "/opt/out",
                "instances": [{ "id": 1, "name": "1" }],
                "start_time": "2026-08-01T00:00:00Z"
            }
        ]
    });
    let err = registry.load_from_json(&blob.to_string()).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // The whole import fails atomically; not even "fresh" was added.
    assert_eq!(ws.registry_bytes(), before);
}

#[test]
fn acloud_optout_round_trips() {
    let ws = Workspace::new("optout");
    let registry = ws.registry();
    assert!(!registry.acloud_optout().unwrap());
    registry.set_acloud_optout(true).unwrap();
    assert!(registry.acloud_optout().unwrap());

    let reopened = ws.registry();
    assert!(reopened.acloud_optout().unwrap());
}

#[test]
fn concurrent_adders_never_violate_uniqueness() {
    let ws = Workspace::new("concurrent");
    let path = ws.root.join("registry.json");

    let mut handles = Vec::new();
    for worker in 0..4u32 {
        let path = path.clone();
        let artifacts = ws.artifacts.clone();
        let homes = ws.root.join("homes");
        handles.push(std::thread::spawn(move || {
            let registry = InstanceRegistry::new(path);
            for n in 0..5u32 {
                let spec = GroupSpec {
                    name: format!("w{}_{}", worker, n),
                    home_directory: homes.join(format!("w{}_{}", worker, n)),
                    host_artifacts_path: artifacts.clone(),
                    product_out_path: "/opt/out".into(),
                    is_default_group: false,
                    instances: vec![Instance {
                        // All workers race for the same id space; exactly one
                        // wins each id.
                        id: n,
                        name: n.to_string(),
                    }],
                };
                let _ = registry.add_group(spec);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let registry = ws.registry();
    let groups = registry.list_groups().unwrap();
    let mut seen_ids = std::collections::HashSet::new();
    let mut seen_homes = std::collections::HashSet::new();
    for group in &groups {
        assert!(seen_homes.insert(group.home_directory.clone()));
        for instance in &group.instances {
            assert!(seen_ids.insert(instance.id), "duplicate id {}", instance.id);
        }
    }
    assert_eq!(groups.len(), 5, "one winner per contended id");
}
