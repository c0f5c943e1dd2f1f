mod common;

use common::market_context;
use lib_livedata::core::types::attribute_string;
use lib_livedata::core::{Broadcast, LiveContext, Record, ReferenceSpec, RegistryError, TypeTag};

fn upsert(ctx: &LiveContext, id: &str, issuer: &str) {
    ctx.dispatcher().notify(Broadcast::Item(
        Record::new("Instrument").with("id", id).with("issuerId", issuer).into_item(),
    ));
}

fn referencing(ctx: &LiveContext, issuer: &str) -> Vec<String> {
    ctx.get_referencing_objects(&TypeTag::new("Instrument"), "issuerId", issuer)
        .unwrap()
        .iter()
        .filter_map(|item| attribute_string(&**item, "id"))
        .collect()
}

#[test]
fn index_follows_updates_removals_and_clears() {
    let ctx = market_context(Default::default());
    upsert(&ctx, "A", "X");
    upsert(&ctx, "B", "X");

    // created after the items exist: the snapshot seeds it
    assert_eq!(referencing(&ctx, "X"), vec!["A", "B"]);

    upsert(&ctx, "C", "Y");
    upsert(&ctx, "A", "Y");
    assert_eq!(referencing(&ctx, "X"), vec!["B"]);
    assert_eq!(referencing(&ctx, "Y"), vec!["A", "C"]);

    ctx.dispatcher().notify(Broadcast::Remove(
        Record::new("Instrument").with("id", "B").into_item(),
    ));
    assert!(referencing(&ctx, "X").is_empty());

    ctx.dispatcher().notify(Broadcast::Clear(TypeTag::new("Instrument")));
    assert!(referencing(&ctx, "Y").is_empty());
    assert!(referencing(&ctx, "nobody").is_empty());
}

#[test]
fn rebuild_replaces_every_reference() {
    let ctx = market_context(Default::default());
    upsert(&ctx, "A", "X");
    ctx.dispatcher().notify(Broadcast::Item(
        Record::new("Issuer").with("id", "X").with("country", "GR").into_item(),
    ));

    ctx.reload_references(&[
        ReferenceSpec::new("Instrument", "issuerId"),
        ReferenceSpec::new("Issuer", "country"),
    ])
    .unwrap();
    assert_eq!(referencing(&ctx, "X"), vec!["A"]);
    let greek = ctx
        .get_referencing_objects(&TypeTag::new("Issuer"), "country", "GR")
        .unwrap();
    assert_eq!(greek.len(), 1);

    let err = ctx.reload_references(&[ReferenceSpec::new("Bond", "issuerId")]);
    assert!(matches!(err, Err(RegistryError::NoListForType(_))));
    assert!(matches!(
        ctx.get_referencing_objects(&TypeTag::new("Bond"), "issuerId", "X"),
        Err(RegistryError::NoListForType(_))
    ));
}

#[test]
fn add_then_remove_leaves_the_index_unchanged() {
    let ctx = market_context(Default::default());
    upsert(&ctx, "A", "X");
    assert_eq!(referencing(&ctx, "X"), vec!["A"]);
    let reference = ctx.cache_reference(&TypeTag::new("Instrument"), "issuerId").unwrap();
    assert_eq!(reference.value_count(), 1);

    upsert(&ctx, "B", "Z");
    assert_eq!(reference.value_count(), 2);
    ctx.dispatcher().notify(Broadcast::Remove(
        Record::new("Instrument").with("id", "B").into_item(),
    ));

    assert_eq!(reference.value_count(), 1);
    assert!(reference.get_mapping("Z").is_empty());
    assert_eq!(referencing(&ctx, "X"), vec!["A"]);

    // a null field is never indexed
    ctx.dispatcher().notify(Broadcast::Item(
        Record::new("Instrument")
            .with("id", "N")
            .with("issuerId", serde_json::Value::Null)
            .into_item(),
    ));
    assert!(referencing(&ctx, "null").is_empty());
    assert_eq!(reference.value_count(), 1);
}
