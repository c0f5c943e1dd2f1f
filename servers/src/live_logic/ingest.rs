//! JSON-lines event ingestion.
//!
//! Each line is either an item event
//! `{"type": "Instrument", "action": "upsert", "fields": {...}}`
//! (`action` is `upsert`, `remove` or `clear`; `upsert` when omitted) or a
//! tagged definition `{"tag": "tree", "body": {...}}`.

use std::path::PathBuf;
use std::sync::Arc;

use lib_livedata::core::{Broadcast, LiveContext, Record, TaggedDefinition, TypeTag};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Upsert,
    Remove,
    Clear,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IngestLine {
    Item {
        #[serde(rename = "type")]
        item_type: String,
        #[serde(default)]
        action: Action,
        #[serde(default)]
        fields: Map<String, Value>,
    },
    Definition {
        tag: String,
        body: Value,
    },
}

impl IngestLine {
    pub fn into_broadcast(self) -> Broadcast {
        match self {
            IngestLine::Item {
                item_type,
                action,
                fields,
            } => {
                let record = Record {
                    type_tag: TypeTag::new(&item_type),
                    fields,
                };
                match action {
                    Action::Upsert => Broadcast::Item(record.into_item()),
                    Action::Remove => Broadcast::Remove(record.into_item()),
                    Action::Clear => Broadcast::Clear(record.type_tag),
                }
            }
            IngestLine::Definition { tag, body } => Broadcast::Definition(TaggedDefinition { tag, body }),
        }
    }
}

/// Parses one line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Broadcast>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str::<IngestLine>(line)?.into_broadcast()))
}

async fn open(path: Option<PathBuf>) -> std::io::Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    Ok(match path {
        Some(path) => Box::new(BufReader::new(tokio::fs::File::open(path).await?)),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    })
}

/// Feeds `path` (stdin when `None`) into the context until end of input or
/// shutdown. Returns the number of events enqueued.
pub async fn run(ctx: Arc<LiveContext>, path: Option<PathBuf>, mut shutdown: broadcast::Receiver<()>) -> usize {
    let source = path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "stdin".to_string());
    let reader = match open(path).await {
        Ok(reader) => reader,
        Err(e) => {
            log::error!("Cannot open event source {}: {}", source, e);
            return 0;
        }
    };
    log::info!("Ingesting events from {}", source);

    let mut lines = reader.lines();
    let mut line_no = 0usize;
    let mut sent = 0usize;
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Ingestor received shutdown signal.");
                break;
            }
            next = lines.next_line() => {
                match next {
                    Ok(Some(line)) => {
                        line_no += 1;
                        match parse_line(&line) {
                            Ok(Some(event)) => match ctx.broadcast(event) {
                                Ok(()) => sent += 1,
                                Err(e) => {
                                    log::warn!("Dispatcher refused event at line {}: {}", line_no, e);
                                    break;
                                }
                            },
                            Ok(None) => {}
                            Err(e) => log::warn!("Skipping {} line {}: {}", source, line_no, e),
                        }
                    }
                    Ok(None) => {
                        log::info!("End of {} after {} lines.", source, line_no);
                        break;
                    }
                    Err(e) => {
                        log::error!("Read error on {}: {}", source, e);
                        break;
                    }
                }
            }
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_livedata::core::ListItem;

    #[test]
    fn item_lines() {
        match parse_line(r#"{"type": "Instrument", "fields": {"id": "A", "price": 3}}"#).unwrap() {
            Some(Broadcast::Item(item)) => {
                assert_eq!(item.type_tag().as_str(), "Instrument");
                assert_eq!(item.attribute("price"), Some(Value::from(3)));
            }
            other => panic!("unexpected {:?}", other.map(|b| b.class())),
        }
        assert!(matches!(
            parse_line(r#"{"type": "Instrument", "action": "remove", "fields": {"id": "A"}}"#).unwrap(),
            Some(Broadcast::Remove(_))
        ));
        assert!(matches!(
            parse_line(r#"{"type": "Instrument", "action": "clear"}"#).unwrap(),
            Some(Broadcast::Clear(_))
        ));
    }

    #[test]
    fn definition_and_bad_lines() {
        match parse_line(r#"{"tag": "tree", "body": {"id": "t", "roots": []}}"#).unwrap() {
            Some(Broadcast::Definition(def)) => assert_eq!(def.tag, "tree"),
            other => panic!("unexpected {:?}", other.map(|b| b.class())),
        }
        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("{oops").is_err());
        assert!(parse_line(r#"{"type": "Instrument", "action": "explode"}"#).is_err());
    }
}
