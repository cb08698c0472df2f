//! Cloud property-set commands.

use serde_json::Value;
use tracing::{debug, warn};

use edgelink_common::{NODE_SERIAL_KEY, ThingMessage};

use crate::frame::RequestFrame;
use crate::registry::Registry;
use crate::transport::{OutboundFrame, Priority};

/// Error type for command parsing.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Malformed command: {0}")]
    Malformed(#[from] edgelink_common::Error),
    #[error("Command does not name a field node ({NODE_SERIAL_KEY} missing)")]
    MissingNode,
}

/// One named switch value from a command.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchAssignment {
    pub name: String,
    pub value: f64,
}

/// A batch of switch assignments for one field node.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudCommand {
    /// Field node the writes go to.
    pub node: String,
    /// Assignments in message order.
    pub assignments: Vec<SwitchAssignment>,
}

impl CloudCommand {
    /// Parse a raw set-topic payload.
    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        Self::from_message(&ThingMessage::from_slice(payload)?)
    }

    /// Extract the assignments of a parsed message.
    ///
    /// Numbers and booleans are accepted; other values are skipped.
    pub fn from_message(message: &ThingMessage) -> Result<Self, CommandError> {
        let node = message.node_serial().ok_or(CommandError::MissingNode)?;

        let assignments = message
            .params
            .iter()
            .filter(|(name, _)| name.as_str() != NODE_SERIAL_KEY)
            .filter_map(|(name, value)| match switch_value(value) {
                Some(value) => Some(SwitchAssignment {
                    name: name.clone(),
                    value,
                }),
                None => {
                    warn!("Switch '{}': unsupported value {}", name, value);
                    None
                }
            })
            .collect();

        Ok(Self {
            node: node.to_string(),
            assignments,
        })
    }

    /// One high-priority write per known switch, in message order.
    pub fn resolve(&self, registry: &Registry) -> Vec<OutboundFrame> {
        self.assignments
            .iter()
            .filter_map(|assignment| {
                let Some(switch) = registry.lookup_switch(&assignment.name) else {
                    warn!("Unknown switch '{}', skipped", assignment.name);
                    return None;
                };

                let raw = switch.kind.to_raw(assignment.value);
                let frame = RequestFrame::write(switch.controller, switch.channel, raw);
                debug!(
                    "Write {} = {} -> node {} plc={:#04x} channel={} raw={:#06x}",
                    assignment.name, assignment.value, self.node, switch.controller, switch.channel, raw
                );
                Some(OutboundFrame::new(self.node.as_str(), &frame, Priority::High))
            })
            .collect()
    }
}

fn switch_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}
