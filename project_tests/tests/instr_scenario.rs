mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use common::{wait_until, Probe};
use lib_livedata::configs::config_sys::{resolve_config, EngineConfig};
use lib_livedata::configs::definitions::DefinitionsFile;
use lib_livedata::core::types::attribute_string;
use lib_livedata::core::{Broadcast, ListItem, Record, Scope, TypeTag};
use serde_json::Value;

const DEFINITIONS: &str = r#"{
    "types": [
        {"name": "Instrument", "keyAttributes": ["id"], "textAttribute": "name"}
    ],
    "dataSources": [
        {"id": "INSTR", "itemType": "Instrument", "kind": "reference"},
        {"id": "BY_PRICE", "itemType": "Instrument", "kind": "query", "source": "INSTR", "sort": "-price"}
    ],
    "references": [{"type": "Instrument", "field": "issuerId"}]
}"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn instrument_lifecycle_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let definitions_path = dir.path().join("definitions.json");
    std::fs::File::create(&definitions_path)
        .unwrap()
        .write_all(DEFINITIONS.as_bytes())
        .unwrap();
    let config_path = dir.path().join("server_live.conf");
    std::fs::write(
        &config_path,
        format!(r#"{{"definitionsPath": {:?}, "pulseMillis": 50}}"#, definitions_path.display().to_string()),
    )
    .unwrap();

    let config = resolve_config(EngineConfig {
        config_path: Some(config_path),
        ..Default::default()
    })
    .unwrap();
    let ctx = DefinitionsFile::load(&config.definitions_path())
        .unwrap()
        .build_context(config.context_settings().unwrap())
        .unwrap();
    let probe = Probe::attach(&ctx);
    ctx.start(&tokio::runtime::Handle::current()).unwrap();

    let instr = ctx.get_data_source(&Scope::Global, "INSTR", None, None).unwrap();
    let publish = |record: Record| ctx.broadcast(Broadcast::Item(record.into_item())).unwrap();

    publish(Record::new("Instrument").with("id", "A").with("name", "Alpha").with("price", 1));
    publish(Record::new("Instrument").with("id", "A").with("name", "Alpha").with("price", 2));
    publish(Record::new("Instrument").with("id", "B").with("issuerId", "X").with("price", 7));
    publish(Record::new("Instrument").with("id", "C").with("issuerId", "X").with("price", 3));

    let done = {
        let instr = Arc::clone(&instr);
        tokio::task::spawn_blocking(move || wait_until(Duration::from_secs(5), || instr.len() == 3 && probe.count() >= 4))
            .await
            .unwrap()
    };
    assert!(done);

    let a = instr.get("A").unwrap();
    assert_eq!(a.attribute("price"), Some(Value::from(2)));
    assert_eq!(instr.text_of(&*a), "Alpha");

    let by_price = ctx.get_data_source(&Scope::Global, "BY_PRICE", None, None).unwrap();
    assert_eq!(by_price.keys(), vec!["B", "C", "A"]);

    let mut issued: Vec<String> = ctx
        .get_referencing_objects(&TypeTag::new("Instrument"), "issuerId", "X")
        .unwrap()
        .iter()
        .filter_map(|i| attribute_string(&**i, "id"))
        .collect();
    issued.sort();
    assert_eq!(issued, vec!["B", "C"]);

    let member_view = ctx
        .get_data_source(&Scope::user("M1", "U1"), "INSTR", Some("issuerId=X"), Some("price"))
        .unwrap();
    assert_eq!(member_view.keys(), vec!["C", "B"]);
    assert_eq!(ctx.owners().user_count(), 1);

    let ctx_for_stop = Arc::clone(&ctx);
    tokio::task::spawn_blocking(move || ctx_for_stop.shutdown()).await.unwrap();
    assert!(member_view.is_destroyed());
    assert!(instr.is_destroyed());
}
