use std::fs;
use std::sync::Arc;

use crossbeam_utils::thread;
use depot::permission::{PermissionRegistry, Permittee, PermitteeGroup, PEER_ACTION};
use tempfile::TempDir;

// an exchange document granting `action` to every name in `names`
fn shared_grant(action: &str, names: &[&str]) -> String {
    let dns: String = names.iter().map(|n| format!("<dn>{}</dn>", n)).collect();
    format!(
        "<permissions><permission><action>{}</action><dns>{}</dns></permission></permissions>",
        action, dns
    )
}

#[test]
fn anonymous_is_always_permitted() {
    let perms = PermissionRegistry::new();
    assert!(perms.is_permitted(None, "insert"));
    perms.grant_permission(Some("CN=bob"), "insert");
    assert!(perms.is_permitted(None, "insert"));
    assert!(perms.is_permitted(None, "anything"));
}

#[test]
fn ungranted_actions_are_open() {
    let perms = PermissionRegistry::new();
    assert!(perms.is_permitted(Some("CN=alice"), "ping"));
    perms.grant_permission(Some("CN=bob"), "insert");
    assert!(perms.is_permitted(Some("CN=alice"), "ping"));
    assert!(perms.is_permitted(Some("CN=bob"), "ping"));
}

#[test]
fn a_grant_closes_the_action_to_others() {
    let perms = PermissionRegistry::new();
    assert!(perms.grant_permission(Some("CN=bob"), "ping"));
    assert!(perms.is_permitted(Some("CN=bob"), "ping"));
    assert!(!perms.is_permitted(Some("CN=alice"), "ping"));

    assert!(!perms.grant_permission(Some("CN=alice"), "ping"));
    assert!(!perms.is_permitted(Some("CN=alice"), "ping"));
    assert!(perms.grant_permission(Some("CN=bob"), "ping"));
    assert!(perms.grant_permission(Some("CN=alice"), "insert"));
    assert!(perms.grant_permission(None, "ping"));
    assert_eq!(perms.permittees_for_action("ping").len(), 1);
}

#[test]
fn merged_documents_may_share_an_action() {
    let perms = PermissionRegistry::new();
    perms.grant_permission(Some("CN=bob"), "ping");
    perms
        .merge_xml(&shared_grant("ping", &["CN=alice"]), None)
        .unwrap();
    assert!(perms.is_permitted(Some("CN=alice"), "ping"));
    assert!(perms.is_permitted(Some("CN=bob"), "ping"));
    assert!(!perms.is_permitted(Some("CN=carol"), "ping"));
}

#[test]
fn revoking_the_last_grant_reopens_the_action() {
    let perms = PermissionRegistry::new();
    perms
        .merge_xml(&shared_grant("ping", &["CN=bob", "CN=alice"]), None)
        .unwrap();

    assert!(perms.revoke_permission(Some("CN=bob"), "ping"));
    // alice still holds it, so bob is shut out
    assert!(!perms.is_permitted(Some("CN=bob"), "ping"));

    assert!(perms.revoke_permission(Some("CN=alice"), "ping"));
    assert!(perms.is_permitted(Some("CN=bob"), "ping"));
    assert!(!perms.revoke_permission(Some("CN=alice"), "ping"));
}

#[test]
fn revoke_all_clears_an_action() {
    let perms = PermissionRegistry::new();
    perms
        .merge_xml(&shared_grant("ping", &["CN=bob", "CN=alice"]), None)
        .unwrap();
    perms.grant_permission(Some("CN=alice"), "insert");
    assert!(perms.revoke_all_permissions("ping"));
    assert!(perms.is_permitted(Some("CN=carol"), "ping"));
    assert!(!perms.is_permitted(Some("CN=carol"), "insert"));
    assert!(!perms.revoke_all_permissions("ping"));
}

#[test]
fn peers_may_do_anything_and_resist_revoke() {
    let perms = PermissionRegistry::new();
    perms.grant_permission(Some("CN=bob"), "sync");
    assert!(perms.grant_peer_permission(Some("CN=depot2")));
    assert!(!perms.grant_peer_permission(Some("CN=depot2")));
    assert!(!perms.grant_peer_permission(None));

    assert!(perms.is_permitted(Some("CN=depot2"), "sync"));
    assert!(perms.is_permitted(Some("CN=depot2"), "anything"));
    assert!(!perms.revoke_permission(Some("CN=depot2"), "sync"));
    assert!(perms.is_permitted(Some("CN=depot2"), "sync"));

    assert_eq!(
        perms.permittees_in_group(PermitteeGroup::Peer),
        vec![Permittee::Peer {
            name: "CN=depot2".into()
        }]
    );
    assert!(perms.revoke_peer_permission(Some("CN=depot2")));
    assert!(!perms.is_permitted(Some("CN=depot2"), "sync"));
    assert!(!perms.revoke_peer_permission(Some("CN=bob")));
}

#[test]
fn table_persists_across_registries() {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let path = depot::permission::permissions_file(temp_dir.path());

    let perms = PermissionRegistry::with_path(&path);
    perms.grant_permission(Some("CN=bob"), "ping");
    perms
        .merge_xml(&shared_grant("ping", &["CN=alice, O=Org"]), None)
        .unwrap();
    perms.grant_permission(Some("CN=alice, O=Org"), "insert");
    perms.grant_peer_permission(Some("CN=depot2"));
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains(PEER_ACTION));

    let reopened = PermissionRegistry::with_path(&path);
    assert_eq!(reopened.all_permittees(), perms.all_permittees());
    assert!(!reopened.is_permitted(Some("CN=carol"), "ping"));
    assert!(reopened.is_permitted(Some("CN=alice, O=Org"), "insert"));
    assert!(reopened.is_permitted(Some("CN=depot2"), "insert"));
}

#[test]
fn exchange_document_merges_into_another_depot() {
    let source = PermissionRegistry::new();
    source.grant_permission(Some("CN=bob"), "ping");
    source.grant_permission(Some("CN=depot1"), "insert");
    source.grant_peer_permission(Some("CN=depot3"));
    let xml = source.to_xml();

    let target = PermissionRegistry::new();
    target.grant_permission(Some("CN=carol"), "suite");
    target.merge_xml(&xml, Some("CN=depot1")).unwrap();

    assert!(target.is_permitted(Some("CN=bob"), "ping"));
    assert!(target.is_permitted(Some("CN=carol"), "suite"));
    assert!(target.is_permitted(Some("CN=depot3"), "anything"));
    // the receiving depot's own identity is left out
    assert!(target
        .all_permittees()
        .iter()
        .all(|p| p.name() != "CN=depot1"));

    assert!(target.merge_xml("<html/>", None).is_err());
}

#[test]
fn concurrent_grants_all_land() {
    let perms = Arc::new(PermissionRegistry::new());
    thread::scope(|s| {
        for i in 0..8 {
            let perms = Arc::clone(&perms);
            s.spawn(move |_| {
                for j in 0..50 {
                    let action = format!("insert{}", j);
                    perms.grant_permission(Some(&format!("CN=user{}-{}", i, j)), &action);
                }
            });
        }
    })
    .unwrap();
    assert_eq!(perms.all_permittees().len(), 400);
}

#[test]
fn racing_grants_admit_one_holder() {
    let perms = Arc::new(PermissionRegistry::new());
    let granted = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let perms = Arc::clone(&perms);
                s.spawn(move |_| perms.grant_permission(Some(&format!("CN=user{}", i)), "sync"))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count()
    })
    .unwrap();
    assert_eq!(granted, 1);
    assert_eq!(perms.permittees_for_action("sync").len(), 1);
}
