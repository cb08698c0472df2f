//! Integration tests for edgelink-common library.

use edgelink_common::{LogFormat, LoggingConfig, MessageIds, ThingMessage, ThingTopics};
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Deserialize)]
struct SampleConfig {
    name: String,
    #[serde(default)]
    logging: LoggingConfig,
}

#[test]
fn test_logging_section_in_json5_document() {
    let text = r#"{
        // comments are allowed
        name: "edgebox",
        logging: { level: "debug2", format: "json" },
    }"#;

    let config: SampleConfig = json5::from_str(text).expect("parse failed");
    assert_eq!(config.name, "edgebox");
    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.logging.filter_directive(), "trace");
}

#[test]
fn test_command_then_event_workflow() {
    // A set request as the hub delivers it
    let inbound = br#"{"id":"1001","version":"1.0","params":{"loraNodeSerialNo":"7076e841","pump":1},"method":"thing.service.property.set"}"#;
    let command = ThingMessage::from_slice(inbound).expect("parse failed");
    assert_eq!(command.node_serial(), Some("7076e841"));
    assert_eq!(command.params["pump"], 1);

    // The gateway answers with telemetry on the post topic
    let ids = MessageIds::new();
    let mut params = Map::new();
    params.insert("loraNodeSerialNo".into(), Value::from("7076e841"));
    params.insert("pump".into(), Value::from(1));
    let first = ThingMessage::property_post(ids.next_id(), params.clone());
    let second = ThingMessage::property_post(ids.next_id(), params);

    assert_eq!(first.id, Value::from(0u64));
    assert_eq!(second.id, Value::from(1u64));

    let topics = ThingTopics::new("pk", "dev");
    assert!(topics.post.ends_with("/thing/event/property/post"));
}
