#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use lib_livedata::core::{
    BdxListener, Broadcast, ContextSettings, DataSourceDefinition, DispatchError, LiveContext, TypeMeta,
};
use lib_livedata::core::types::attribute_string;

/// Catch-all listener registered after the router: when it has seen an
/// event, every list has already ingested it.
#[derive(Default)]
pub struct Probe {
    seen: Mutex<Vec<Broadcast>>,
}

impl Probe {
    pub fn attach(ctx: &LiveContext) -> Arc<Probe> {
        let probe = Arc::new(Probe::default());
        ctx.add_bdx_listener(probe.clone(), &[]);
        probe
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// `attr` of every item event seen, in delivery order.
    pub fn item_values(&self, attr: &str) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                Broadcast::Item(item) | Broadcast::Remove(item) => attribute_string(&**item, attr),
                _ => None,
            })
            .collect()
    }

    pub fn pulses(&self) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Broadcast::Pulse(_)))
            .count()
    }
}

impl BdxListener for Probe {
    fn name(&self) -> String {
        "probe".to_string()
    }

    fn on_broadcast(&self, event: &Broadcast) -> Result<(), DispatchError> {
        self.seen.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Polls `done` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

pub fn market_types() -> Vec<TypeMeta> {
    vec![
        TypeMeta::new("Issuer", "id").with_text("name"),
        TypeMeta::new("Asset", "id").with_text("name"),
        TypeMeta::new("Instrument", "id").with_parent("Asset").with_text("name"),
        TypeMeta::new("Bond", "id").with_parent("Instrument").with_text("name"),
    ]
}

pub fn market_context(settings: ContextSettings) -> Arc<LiveContext> {
    LiveContext::builder()
        .settings(settings)
        .types(market_types())
        .data_sources([
            DataSourceDefinition::reference("ISSUERS", "Issuer"),
            DataSourceDefinition::reference("ASSETS", "Asset"),
            DataSourceDefinition::reference("INSTR", "Instrument"),
        ])
        .build()
        .unwrap()
}
