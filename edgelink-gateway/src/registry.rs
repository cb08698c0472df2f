//! Switch and controller registry.
//!
//! The registry is built once at startup from the switch definition file
//! and is read-only afterwards, so it is shared between tasks behind an
//! `Arc` without any locking.
//!
//! ```json
//! {"switches": [
//!     {"name": "pump", "plc": "01", "plc_channel": "05", "reg_len": "1"},
//!     {"name": "waterFertilizerPressure", "plc": "01", "plc_channel": "200", "plc_channel_ro": "204", "reg_len": "2"}
//! ]}
//! ```
//!
//! Numeric fields are hexadecimal text.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

/// Highest register channel a switch may use.
pub const MAX_CHANNEL: u16 = 1024;

/// Switch whose value is a pressure scaled by ten unless a scale is given.
pub const PRESSURE_SWITCH: &str = "waterFertilizerPressure";

const MAP_WORDS: usize = (MAX_CHANNEL as usize) / 64 + 1;

/// Error type for registry loading.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read switch file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed switch file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Switch file has no \"switches\" array")]
    MissingSwitches,
    #[error("Switch '{name}': {field} is not hexadecimal: {value:?}")]
    InvalidHex {
        name: String,
        field: &'static str,
        value: String,
    },
    #[error("Switch '{name}': register width must be 1 or 2, got {width}")]
    InvalidWidth { name: String, width: u32 },
    #[error("Switch '{name}': channel {channel} is above {MAX_CHANNEL}")]
    ChannelOutOfRange { name: String, channel: u32 },
    #[error("Switch '{name}': controller address {address:#x} does not fit in one byte")]
    ControllerOutOfRange { name: String, address: u32 },
}

/// Register width in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterWidth {
    /// One-byte registers.
    Single,
    /// Two-byte (big-endian) registers.
    Double,
}

impl RegisterWidth {
    /// Both widths, in polling order.
    pub const ALL: [RegisterWidth; 2] = [RegisterWidth::Single, RegisterWidth::Double];

    pub fn from_len(len: u32) -> Option<Self> {
        match len {
            1 => Some(Self::Single),
            2 => Some(Self::Double),
            _ => None,
        }
    }

    /// Width in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Double => 2,
        }
    }
}

/// How a switch value is represented on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueKind {
    /// Plain integer.
    Integer,
    /// Decimal value multiplied by the factor before writing.
    Scaled(f64),
}

impl ValueKind {
    /// Convert a cloud value into the raw register value.
    ///
    /// Truncates toward zero and keeps the low 16 bits.
    pub fn to_raw(self, value: f64) -> u16 {
        let scaled = match self {
            Self::Integer => value,
            Self::Scaled(factor) => value * factor,
        };
        (scaled.trunc() as i64) as u16
    }

    /// Convert a raw register value into the cloud value.
    pub fn to_cloud(self, raw: u16) -> serde_json::Value {
        match self {
            Self::Integer => serde_json::Value::from(raw),
            Self::Scaled(factor) => serde_json::Value::from(f64::from(raw) / factor),
        }
    }
}

/// A named switch mapped onto a controller register.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchDefinition {
    pub name: String,
    /// Controller (PLC) address.
    pub controller: u8,
    /// Channel written by commands.
    pub channel: u16,
    /// Channel read back by polling, when distinct from `channel`.
    pub read_channel: Option<u16>,
    pub width: RegisterWidth,
    pub kind: ValueKind,
}

impl SwitchDefinition {
    /// Channel the switch's state is reported on.
    pub fn effective_channel(&self) -> u16 {
        self.read_channel.unwrap_or(self.channel)
    }
}

/// Fixed-size bitmap of in-use channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    words: [u64; MAP_WORDS],
    lowest: Option<u16>,
    highest: Option<u16>,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            words: [0; MAP_WORDS],
            lowest: None,
            highest: None,
        }
    }
}

impl ChannelMap {
    /// Mark `channel` as in use. Channels above [`MAX_CHANNEL`] are ignored.
    pub fn insert(&mut self, channel: u16) {
        if channel > MAX_CHANNEL {
            return;
        }
        self.words[channel as usize / 64] |= 1u64 << (channel % 64);
        self.lowest = Some(self.lowest.map_or(channel, |l| l.min(channel)));
        self.highest = Some(self.highest.map_or(channel, |h| h.max(channel)));
    }

    pub fn contains(&self, channel: u16) -> bool {
        channel <= MAX_CHANNEL && self.words[channel as usize / 64] & (1u64 << (channel % 64)) != 0
    }

    pub fn lowest(&self) -> Option<u16> {
        self.lowest
    }

    pub fn highest(&self) -> Option<u16> {
        self.highest
    }

    pub fn is_empty(&self) -> bool {
        self.lowest.is_none()
    }

    /// First in-use channel at or after `from`.
    pub fn next_from(&self, from: u16) -> Option<u16> {
        let highest = self.highest?;
        (from..=highest).find(|&c| self.contains(c))
    }

    /// In-use channels in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.lowest
            .zip(self.highest)
            .into_iter()
            .flat_map(|(low, high)| low..=high)
            .filter(move |&c| self.contains(c))
    }
}

impl FromIterator<u16> for ChannelMap {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        let mut map = Self::default();
        for channel in iter {
            map.insert(channel);
        }
        map
    }
}

/// Everything known about one controller address.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerProfile {
    pub address: u8,
    single: ChannelMap,
    double: ChannelMap,
    names: BTreeMap<u16, String>,
}

impl ControllerProfile {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            single: ChannelMap::default(),
            double: ChannelMap::default(),
            names: BTreeMap::new(),
        }
    }

    fn record(&mut self, channel: u16, width: RegisterWidth, name: &str) {
        match width {
            RegisterWidth::Single => self.single.insert(channel),
            RegisterWidth::Double => self.double.insert(channel),
        }
        self.names.insert(channel, name.to_string());
    }

    /// In-use channels of the given width.
    pub fn channels(&self, width: RegisterWidth) -> &ChannelMap {
        match width {
            RegisterWidth::Single => &self.single,
            RegisterWidth::Double => &self.double,
        }
    }

    /// Switch name reported on `channel`.
    pub fn switch_name(&self, channel: u16) -> Option<&str> {
        self.names.get(&channel).map(String::as_str)
    }

    /// Width the registry recorded for `channel`.
    pub fn width_of(&self, channel: u16) -> Option<RegisterWidth> {
        RegisterWidth::ALL
            .into_iter()
            .find(|&w| self.channels(w).contains(channel))
    }
}

/// A radio node and the controllers reachable through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldNode {
    /// Radio device address.
    pub devaddr: String,
    /// Controller addresses behind this node.
    pub controllers: Vec<u8>,
}

/// Shape of one entry in the switch file.
#[derive(Debug, Deserialize)]
struct RawSwitch {
    name: String,
    plc: String,
    plc_channel: String,
    #[serde(default)]
    plc_channel_ro: Option<String>,
    reg_len: String,
    #[serde(default)]
    scale: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawSwitchFile {
    #[serde(default)]
    switches: Option<Vec<RawSwitch>>,
}

/// Read-only mapping of switch names, controllers and field nodes.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    switches: HashMap<String, SwitchDefinition>,
    controllers: BTreeMap<u8, ControllerProfile>,
    nodes: Vec<FieldNode>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the switch definition file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let registry = Self::from_json(&content)?;
        info!(
            "Loaded {} switch(es) on {} controller(s) from {}",
            registry.switches.len(),
            registry.controllers.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Build a registry from switch file contents.
    pub fn from_json(content: &str) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.add_definitions(content)?;
        Ok(registry)
    }

    /// Add every switch in `content`. Later definitions of a name replace
    /// earlier ones.
    pub fn add_definitions(&mut self, content: &str) -> Result<(), RegistryError> {
        let file: RawSwitchFile = serde_json::from_str(content)?;
        let raw = file.switches.ok_or(RegistryError::MissingSwitches)?;

        for entry in raw {
            let switch = parse_switch(entry)?;
            self.insert(switch);
        }

        Ok(())
    }

    /// Register one switch.
    pub fn insert(&mut self, switch: SwitchDefinition) {
        debug!(
            "Switch '{}': plc={:#04x} channel={} read={:?} width={:?}",
            switch.name, switch.controller, switch.channel, switch.read_channel, switch.width
        );

        self.controllers
            .entry(switch.controller)
            .or_insert_with(|| ControllerProfile::new(switch.controller))
            .record(switch.effective_channel(), switch.width, &switch.name);

        if let Some(previous) = self.switches.insert(switch.name.clone(), switch) {
            warn!(
                "Switch '{}' defined more than once; plc={:#04x} channel={} replaced",
                previous.name, previous.controller, previous.channel
            );
        }

        let addresses: Vec<u8> = self.controllers.keys().copied().collect();
        for node in &mut self.nodes {
            node.controllers = addresses.clone();
        }
    }

    /// Attach the configured field nodes. Every node reaches every controller.
    pub fn with_field_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let addresses: Vec<u8> = self.controllers.keys().copied().collect();
        self.nodes = nodes
            .into_iter()
            .map(|devaddr| FieldNode {
                devaddr: devaddr.into(),
                controllers: addresses.clone(),
            })
            .collect();
        self
    }

    pub fn lookup_switch(&self, name: &str) -> Option<&SwitchDefinition> {
        self.switches.get(name)
    }

    pub fn lookup_controller(&self, address: u8) -> Option<&ControllerProfile> {
        self.controllers.get(&address)
    }

    /// Controller profiles in address order.
    pub fn controllers(&self) -> impl Iterator<Item = &ControllerProfile> {
        self.controllers.values()
    }

    pub fn field_nodes(&self) -> &[FieldNode] {
        &self.nodes
    }

    pub fn switch_count(&self) -> usize {
        self.switches.len()
    }
}

fn parse_switch(raw: RawSwitch) -> Result<SwitchDefinition, RegistryError> {
    let controller = parse_hex(&raw.name, "plc", &raw.plc)?;
    let controller = u8::try_from(controller).map_err(|_| RegistryError::ControllerOutOfRange {
        name: raw.name.clone(),
        address: controller,
    })?;

    let channel = parse_channel(&raw.name, "plc_channel", &raw.plc_channel)?;
    let read_channel = raw
        .plc_channel_ro
        .as_deref()
        .map(|value| parse_channel(&raw.name, "plc_channel_ro", value))
        .transpose()?;

    let len = parse_hex(&raw.name, "reg_len", &raw.reg_len)?;
    let width = RegisterWidth::from_len(len).ok_or_else(|| RegistryError::InvalidWidth {
        name: raw.name.clone(),
        width: len,
    })?;

    let kind = match raw.scale {
        Some(scale) if scale > 1.0 => ValueKind::Scaled(scale),
        Some(_) => ValueKind::Integer,
        None if raw.name == PRESSURE_SWITCH => ValueKind::Scaled(10.0),
        None => ValueKind::Integer,
    };

    Ok(SwitchDefinition {
        name: raw.name,
        controller,
        channel,
        read_channel,
        width,
        kind,
    })
}

fn parse_channel(name: &str, field: &'static str, value: &str) -> Result<u16, RegistryError> {
    let channel = parse_hex(name, field, value)?;
    if channel > u32::from(MAX_CHANNEL) {
        return Err(RegistryError::ChannelOutOfRange {
            name: name.to_string(),
            channel,
        });
    }
    Ok(channel as u16)
}

fn parse_hex(name: &str, field: &'static str, value: &str) -> Result<u32, RegistryError> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    u32::from_str_radix(digits, 16).map_err(|_| RegistryError::InvalidHex {
        name: name.to_string(),
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SWITCHES: &str = r#"{"switches": [
        {"name": "pump", "plc": "01", "plc_channel": "05", "reg_len": "1"},
        {"name": "valve1", "plc": "01", "plc_channel": "06", "reg_len": "1"},
        {"name": "valve2", "plc": "01", "plc_channel": "0A", "plc_channel_ro": "0x10", "reg_len": "1"},
        {"name": "waterFertilizerPressure", "plc": "01", "plc_channel": "200", "plc_channel_ro": "204", "reg_len": "2"},
        {"name": "flow", "plc": "2", "plc_channel": "201", "reg_len": "2", "scale": 100}
    ]}"#;

    #[test]
    fn test_load_parses_hex_fields() {
        let registry = Registry::from_json(SWITCHES).unwrap();
        assert_eq!(registry.switch_count(), 5);

        let pump = registry.lookup_switch("pump").unwrap();
        assert_eq!(pump.controller, 0x01);
        assert_eq!(pump.channel, 0x05);
        assert_eq!(pump.width, RegisterWidth::Single);
        assert_eq!(pump.kind, ValueKind::Integer);

        let valve2 = registry.lookup_switch("valve2").unwrap();
        assert_eq!(valve2.channel, 0x0A);
        assert_eq!(valve2.effective_channel(), 0x10);

        let flow = registry.lookup_switch("flow").unwrap();
        assert_eq!(flow.kind, ValueKind::Scaled(100.0));
        assert_eq!(flow.channel, 0x201);
    }

    #[test]
    fn test_pressure_defaults_to_scaled() {
        let registry = Registry::from_json(SWITCHES).unwrap();
        let pressure = registry.lookup_switch(PRESSURE_SWITCH).unwrap();
        assert_eq!(pressure.kind, ValueKind::Scaled(10.0));
        assert_eq!(pressure.width, RegisterWidth::Double);
    }

    #[test]
    fn test_reverse_lookup_uses_effective_channel() {
        let registry = Registry::from_json(SWITCHES).unwrap();
        let profile = registry.lookup_controller(0x01).unwrap();

        assert_eq!(profile.switch_name(0x10), Some("valve2"));
        assert_eq!(profile.switch_name(0x0A), None);
        assert_eq!(profile.switch_name(0x204), Some(PRESSURE_SWITCH));

        let single: Vec<u16> = profile.channels(RegisterWidth::Single).iter().collect();
        assert_eq!(single, vec![0x05, 0x06, 0x10]);
        assert_eq!(profile.channels(RegisterWidth::Double).lowest(), Some(0x204));
    }

    #[test]
    fn test_every_in_use_channel_has_a_name() {
        let registry = Registry::from_json(SWITCHES).unwrap();
        for profile in registry.controllers() {
            for width in RegisterWidth::ALL {
                for channel in profile.channels(width).iter() {
                    assert!(profile.switch_name(channel).is_some());
                    assert_eq!(profile.width_of(channel), Some(width));
                }
            }
        }
    }

    #[test]
    fn test_duplicate_names_overwrite() {
        let mut registry = Registry::from_json(SWITCHES).unwrap();
        registry.add_definitions(SWITCHES).unwrap();
        assert_eq!(registry.switch_count(), 5);

        registry
            .add_definitions(
                r#"{"switches": [{"name": "pump", "plc": "03", "plc_channel": "07", "reg_len": "1"}]}"#,
            )
            .unwrap();

        let pump = registry.lookup_switch("pump").unwrap();
        assert_eq!(pump.controller, 0x03);
        assert_eq!(pump.channel, 0x07);
    }

    #[test]
    fn test_field_nodes_own_every_controller() {
        let registry = Registry::from_json(SWITCHES)
            .unwrap()
            .with_field_nodes(["7076e841", "7076e842"]);

        assert_eq!(registry.field_nodes().len(), 2);
        for node in registry.field_nodes() {
            assert_eq!(node.controllers, vec![0x01, 0x02]);
        }
    }

    #[test]
    fn test_missing_field_is_fatal() {
        let result = Registry::from_json(r#"{"switches": [{"name": "pump", "plc": "01", "reg_len": "1"}]}"#);
        assert!(matches!(result, Err(RegistryError::Parse(_))));
    }

    #[test]
    fn test_missing_switches_array() {
        let result = Registry::from_json(r#"{"devices": []}"#);
        assert!(matches!(result, Err(RegistryError::MissingSwitches)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_hex = r#"{"switches": [{"name": "a", "plc": "zz", "plc_channel": "1", "reg_len": "1"}]}"#;
        assert!(matches!(
            Registry::from_json(bad_hex),
            Err(RegistryError::InvalidHex { field: "plc", .. })
        ));

        let bad_width = r#"{"switches": [{"name": "a", "plc": "1", "plc_channel": "1", "reg_len": "4"}]}"#;
        assert!(matches!(
            Registry::from_json(bad_width),
            Err(RegistryError::InvalidWidth { width: 4, .. })
        ));

        let bad_channel = r#"{"switches": [{"name": "a", "plc": "1", "plc_channel": "401", "reg_len": "1"}]}"#;
        assert!(matches!(
            Registry::from_json(bad_channel),
            Err(RegistryError::ChannelOutOfRange { channel: 0x401, .. })
        ));

        let bad_plc = r#"{"switches": [{"name": "a", "plc": "100", "plc_channel": "1", "reg_len": "1"}]}"#;
        assert!(matches!(
            Registry::from_json(bad_plc),
            Err(RegistryError::ControllerOutOfRange { .. })
        ));
    }

    #[test]
    fn test_value_kind_conversion() {
        assert_eq!(ValueKind::Integer.to_raw(3.9), 3);
        assert_eq!(ValueKind::Integer.to_raw(-1.0), 0xFFFF);
        assert_eq!(ValueKind::Scaled(10.0).to_raw(2.35), 23);
        assert_eq!(ValueKind::Integer.to_raw(70_000.0), (70_000u32 & 0xFFFF) as u16);

        assert_eq!(ValueKind::Integer.to_cloud(7), serde_json::json!(7));
        assert_eq!(ValueKind::Scaled(10.0).to_cloud(235), serde_json::json!(23.5));
    }

    #[test]
    fn test_channel_map_scan() {
        let map: ChannelMap = [2u16, 3, 4, 7, 8].into_iter().collect();
        assert_eq!(map.lowest(), Some(2));
        assert_eq!(map.highest(), Some(8));
        assert_eq!(map.next_from(5), Some(7));
        assert_eq!(map.next_from(9), None);
        assert!(ChannelMap::default().is_empty());
        assert_eq!(ChannelMap::default().iter().count(), 0);
    }
}
