use std::sync::Arc;

use parking_lot::Mutex;

use super::*;
use crate::Error;
use crate::RegistryError;

#[derive(Debug, Clone, PartialEq)]
struct Iface {
    kind: String,
    admin_up: bool,
}

fn iface(
    kind: &str,
    admin_up: bool,
) -> Iface {
    Iface {
        kind: kind.to_string(),
        admin_up,
    }
}

fn indexed_mapping() -> NamedMapping<Iface> {
    NamedMapping::with_metadata("interfaces", |value: &Iface| {
        vec![("kind".to_string(), value.kind.clone())]
    })
}

#[test]
fn put_lookup_delete_round_trip() {
    let mapping = NamedMapping::new("interfaces");

    mapping.put("eth0", iface("ethernet", true));
    assert_eq!(mapping.lookup("eth0"), Some(iface("ethernet", true)));

    assert_eq!(mapping.delete("eth0"), Some(iface("ethernet", true)));
    assert_eq!(mapping.lookup("eth0"), None);
}

#[test]
fn list_names_is_sorted() {
    let mapping = NamedMapping::new("interfaces");
    mapping.put("lo", iface("loopback", true));
    mapping.put("eth1", iface("ethernet", false));
    mapping.put("eth0", iface("ethernet", true));

    assert_eq!(mapping.list_names(), vec!["eth0", "eth1", "lo"]);
}

#[test]
fn replace_fires_event_with_previous_value() {
    let mapping = NamedMapping::new("interfaces");
    let seen: Arc<Mutex<Vec<MappingEvent<Iface>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _handle = mapping.watch(move |event| sink.lock().push(event.clone()));

    mapping.put("eth0", iface("ethernet", false));
    mapping.put("eth0", iface("ethernet", true));

    let events = seen.lock();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].old, None);
    assert_eq!(events[1].kind, MappingChange::Put);
    assert_eq!(events[1].old, Some(iface("ethernet", false)));
    assert_eq!(events[1].new, Some(iface("ethernet", true)));
}

#[test]
fn delete_fires_event_with_removed_value_only_when_present() {
    let mapping = NamedMapping::new("interfaces");
    let seen: Arc<Mutex<Vec<MappingEvent<Iface>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _handle = mapping.watch(move |event| sink.lock().push(event.clone()));

    mapping.put("eth0", iface("ethernet", true));
    mapping.delete("eth0");
    // absent key: no event
    mapping.delete("eth0");

    let events = seen.lock();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].kind, MappingChange::Delete);
    assert_eq!(events[1].old, Some(iface("ethernet", true)));
    assert_eq!(events[1].new, None);
}

#[test]
fn secondary_index_tracks_inserts_replacements_and_deletes() {
    let mapping = indexed_mapping();
    mapping.put("eth0", iface("ethernet", true));
    mapping.put("eth1", iface("ethernet", false));
    mapping.put("lo", iface("loopback", true));

    assert_eq!(
        mapping.lookup_by_metadata("kind", "ethernet").unwrap(),
        vec!["eth0", "eth1"]
    );

    // replacement moves the entry to its new index key
    mapping.put("eth1", iface("bond", false));
    assert_eq!(
        mapping.lookup_by_metadata("kind", "ethernet").unwrap(),
        vec!["eth0"]
    );
    assert_eq!(
        mapping.lookup_by_metadata("kind", "bond").unwrap(),
        vec!["eth1"]
    );

    mapping.delete("eth0");
    assert!(mapping.lookup_by_metadata("kind", "ethernet").unwrap().is_empty());
}

#[test]
fn lookup_by_metadata_without_extractor_is_an_unknown_index() {
    let mapping: NamedMapping<Iface> = NamedMapping::new("interfaces");

    match mapping.lookup_by_metadata("kind", "ethernet") {
        Err(Error::Registry(RegistryError::UnknownIndex(index))) => assert_eq!(index, "kind"),
        other => panic!("expected unknown index, got {:?}", other),
    }
}

#[tokio::test]
async fn watch_to_channel_decouples_subscribers() {
    let mapping = NamedMapping::new("interfaces");
    let (handle, mut rx) = mapping.watch_to_channel();

    mapping.put("eth0", iface("ethernet", true));
    let event = rx.recv().await.unwrap();
    assert_eq!(event.name, "eth0");
    assert_eq!(event.kind, MappingChange::Put);

    mapping.unwatch(handle);
    mapping.put("eth1", iface("ethernet", true));
    assert!(rx.try_recv().is_err());
}
