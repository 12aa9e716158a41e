use peridot::core::PeridotError;
use peridot::core::gossip::crds::{Crds, CrdsInsertOutcome, CrdsRoute};
use peridot::core::gossip::crds_value::{CrdsData, CrdsValue, CrdsValueLabel};
use peridot::core::gossip::{ContactInfo, SocketTag};

fn contact(origin: &str, wallclock: u64, outset: u64) -> CrdsValue {
    let info = ContactInfo::new(origin.to_string(), wallclock, outset)
        .with_socket(SocketTag::Gossip, "127.0.0.1:8001");
    CrdsValue::new_signed(CrdsData::ContactInfo(info), &None)
}

fn lowest_slot(origin: &str, lowest: u64, wallclock: u64) -> CrdsValue {
    CrdsValue::new_signed(
        CrdsData::LowestSlot {
            origin: origin.to_string(),
            lowest,
            wallclock_ms: wallclock,
        },
        &None,
    )
}

#[tokio::test]
async fn test_insert_then_get() {
    let crds = Crds::new("me".into(), None, 16);
    let value = contact("alice", 100, 1);
    let outcome = crds.insert(value, 100, CrdsRoute::LocalMessage).unwrap();
    assert_eq!(outcome, CrdsInsertOutcome::Inserted);

    let stored = crds
        .get(&CrdsValueLabel::ContactInfo("alice".into()))
        .unwrap();
    assert_eq!(stored.value.wallclock_ms(), 100);
    assert_eq!(crds.num_nodes(), 1);
}

#[tokio::test]
async fn test_newer_wallclock_overrides() {
    let crds = Crds::new("me".into(), None, 16);
    crds.insert(contact("k", 100, 1), 0, CrdsRoute::LocalMessage)
        .unwrap();
    let outcome = crds
        .insert(contact("k", 200, 1), 0, CrdsRoute::PushMessage)
        .unwrap();
    assert_eq!(outcome, CrdsInsertOutcome::Updated);
    assert_eq!(crds.get_contact_info(&"k".into()).unwrap().wallclock_ms, 200);

    // An older wallclock must not override.
    let result = crds.insert(contact("k", 150, 1), 0, CrdsRoute::PushMessage);
    assert!(matches!(result, Err(PeridotError::StaleValue)));
    assert_eq!(crds.get_contact_info(&"k".into()).unwrap().wallclock_ms, 200);
}

#[tokio::test]
async fn test_greater_outset_overrides_wallclock() {
    let crds = Crds::new("me".into(), None, 16);
    crds.insert(contact("k", 500, 1), 0, CrdsRoute::LocalMessage)
        .unwrap();
    // A restarted instance wins even with an older wallclock.
    let outcome = crds
        .insert(contact("k", 100, 2), 0, CrdsRoute::PushMessage)
        .unwrap();
    assert_eq!(outcome, CrdsInsertOutcome::Updated);
    let stored = crds.get_contact_info(&"k".into()).unwrap();
    assert_eq!(stored.outset, 2);
    assert_eq!(stored.wallclock_ms, 100);
}

#[tokio::test]
async fn test_override_is_order_independent() {
    let a = contact("k", 100, 1);
    let b = contact("k", 200, 1);

    let first = Crds::new("me".into(), None, 16);
    first.insert(a.clone(), 0, CrdsRoute::LocalMessage).unwrap();
    let _ = first.insert(b.clone(), 0, CrdsRoute::LocalMessage);

    let second = Crds::new("me".into(), None, 16);
    second.insert(b, 0, CrdsRoute::LocalMessage).unwrap();
    let _ = second.insert(a, 0, CrdsRoute::LocalMessage);

    let left = first.get_contact_info(&"k".into()).unwrap();
    let right = second.get_contact_info(&"k".into()).unwrap();
    assert_eq!(left, right);
    assert_eq!(left.wallclock_ms, 200);
}

#[tokio::test]
async fn test_identical_wallclock_resolves_by_hash() {
    // Same label and wallclock but different payloads: the surviving value
    // must be the same regardless of insertion order.
    let a = lowest_slot("k", 10, 100);
    let b = lowest_slot("k", 20, 100);

    let first = Crds::new("me".into(), None, 16);
    first.insert(a.clone(), 0, CrdsRoute::LocalMessage).unwrap();
    let _ = first.insert(b.clone(), 0, CrdsRoute::LocalMessage);

    let second = Crds::new("me".into(), None, 16);
    second.insert(b, 0, CrdsRoute::LocalMessage).unwrap();
    let _ = second.insert(a, 0, CrdsRoute::LocalMessage);

    let left = first.get(&CrdsValueLabel::LowestSlot("k".into())).unwrap();
    let right = second.get(&CrdsValueLabel::LowestSlot("k".into())).unwrap();
    assert_eq!(left.value.hash(), right.value.hash());
}

#[tokio::test]
async fn test_ordinals_strictly_increase_across_updates() {
    let crds = Crds::new("me".into(), None, 16);
    crds.insert(contact("k", 100, 1), 0, CrdsRoute::LocalMessage)
        .unwrap();
    let first = crds
        .get(&CrdsValueLabel::ContactInfo("k".into()))
        .unwrap()
        .ordinal;
    crds.insert(contact("k", 200, 1), 0, CrdsRoute::LocalMessage)
        .unwrap();
    let second = crds
        .get(&CrdsValueLabel::ContactInfo("k".into()))
        .unwrap()
        .ordinal;
    assert!(second > first);
}

#[tokio::test]
async fn test_get_entries_after_is_ordered_and_bounded() {
    let crds = Crds::new("me".into(), None, 16);
    for i in 0..10u64 {
        crds.insert(
            lowest_slot(&format!("origin-{i}"), i, 100 + i),
            0,
            CrdsRoute::LocalMessage,
        )
        .unwrap();
    }
    let entries = crds.get_entries_after(0, 4);
    assert_eq!(entries.len(), 4);
    for window in entries.windows(2) {
        assert!(window[0].ordinal < window[1].ordinal);
    }
    let rest = crds.get_entries_after(entries.last().unwrap().ordinal, 100);
    assert_eq!(rest.len(), 6);
}

#[tokio::test]
async fn test_trim_removes_stale_but_keeps_self() {
    let crds = Crds::new("me".into(), None, 16);
    crds.insert(contact("me", 100, 1), 1_000, CrdsRoute::LocalMessage)
        .unwrap();
    crds.insert(contact("other", 100, 1), 1_000, CrdsRoute::PushMessage)
        .unwrap();
    crds.insert(contact("fresh", 100, 1), 50_000, CrdsRoute::PushMessage)
        .unwrap();

    let removed = crds.trim(60_000, 30_000);
    assert_eq!(removed, 1);
    assert!(crds.get_contact_info(&"me".into()).is_some());
    assert!(crds.get_contact_info(&"other".into()).is_none());
    assert!(crds.get_contact_info(&"fresh".into()).is_some());
}

#[tokio::test]
async fn test_records_by_origin() {
    let crds = Crds::new("me".into(), None, 16);
    crds.insert(contact("alice", 100, 1), 0, CrdsRoute::LocalMessage)
        .unwrap();
    crds.insert(lowest_slot("alice", 5, 100), 0, CrdsRoute::LocalMessage)
        .unwrap();
    crds.insert(contact("bob", 100, 1), 0, CrdsRoute::LocalMessage)
        .unwrap();

    let records = crds.get_records(&"alice".into());
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.value.origin() == "alice"));
}

#[tokio::test]
async fn test_unsigned_value_rejected_when_secret_configured() {
    let crds = Crds::new("me".into(), Some("hunter2".into()), 16);
    let unsigned = contact("alice", 100, 1);
    let result = crds.insert(unsigned, 0, CrdsRoute::PushMessage);
    assert!(matches!(result, Err(PeridotError::SignatureInvalid)));

    let signed = CrdsValue::new_signed(
        CrdsData::ContactInfo(ContactInfo::new("alice".into(), 100, 1)),
        &Some("hunter2".into()),
    );
    assert!(crds.insert(signed, 0, CrdsRoute::PushMessage).is_ok());
}
