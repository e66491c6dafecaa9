//! # Configuration Module
//!
//! YAML configuration schema and the lenient compiler from raw config
//! values to the typed [`RuleSet`] snapshot and MITM attack settings.
//!
//! Parsing is deliberately forgiving at the rule level: each rule kind
//! accepts either a single mapping or a list (normalized to a list), and
//! individually malformed rules are skipped with a warning while loading
//! continues. Only an unreadable or syntactically broken file is fatal.

use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use tracing::warn;

use crate::error::ProxyError;
use crate::mitm::MitmConfig;
use crate::rules::{
    BlockRule, DataType, DelayRule, DirectionRules, InsertRule, Position, Repeat, ReplayRule,
    RuleBundle, RuleSet,
};

/// Attack-mode key the interceptor reads its payload from.
const SERVER_TO_CLIENT: &str = "server_to_client";

/// Top-level configuration file.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub src: Listen,
    #[serde(default)]
    pub payload_handling: PayloadHandling,
    #[serde(default)]
    pub attack_mode: BTreeMap<String, AttackModeEntry>,
}

/// Listener endpoint.
#[derive(Debug, Deserialize)]
pub struct Listen {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for Listen {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

/// The `payload_handling` section: global rules plus directional bundles.
#[derive(Debug, Default, Deserialize)]
pub struct PayloadHandling {
    #[serde(default)]
    pub global: RawRuleBundle,
    #[serde(default)]
    pub directions: Vec<RawDirection>,
}

/// Unvalidated rule lists. Values stay dynamic until compilation so a
/// single bad rule cannot fail the whole file.
#[derive(Debug, Default, Deserialize)]
pub struct RawRuleBundle {
    #[serde(default)]
    pub block: OneOrMany,
    #[serde(default)]
    pub delay: OneOrMany,
    #[serde(default)]
    pub insert: OneOrMany,
    #[serde(default)]
    pub replay: OneOrMany,
}

/// One directional bundle keyed by its outer IPs.
#[derive(Debug, Deserialize)]
pub struct RawDirection {
    #[serde(default)]
    pub source_ip: Option<String>,
    #[serde(default)]
    pub target_ip: Option<String>,
    #[serde(flatten)]
    pub rules: RawRuleBundle,
}

/// A rule list that also accepts a bare mapping, normalized to one entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    Many(Vec<Value>),
    One(Value),
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl OneOrMany {
    fn entries(&self) -> Vec<&Value> {
        match self {
            OneOrMany::Many(values) => values.iter().collect(),
            OneOrMany::One(Value::Null) => Vec::new(),
            OneOrMany::One(value) => vec![value],
        }
    }
}

/// One `attack_mode` entry.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct AttackModeEntry {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub malicious_payload_hex: String,
    #[serde(default)]
    pub log: bool,
}

impl Config {
    /// Read and parse a configuration file. Syntactic failure is fatal;
    /// semantic rule problems are handled later, per rule.
    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| ProxyError::Config(format!("cannot read {}: {err}", path.display())))?;
        serde_yaml::from_str(&text)
            .map_err(|err| ProxyError::Config(format!("cannot parse {}: {err}", path.display())))
    }

    /// The listener address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ProxyError> {
        let ip: IpAddr = self.src.host.parse().map_err(|_| {
            ProxyError::Config(format!("src.host {:?} is not an IP address", self.src.host))
        })?;
        Ok(SocketAddr::new(ip, self.src.port))
    }

    /// Compile the payload-handling section into an immutable snapshot.
    pub fn build_rules(&self) -> RuleSet {
        let global = compile_bundle(&self.payload_handling.global, "global");
        let mut directions = Vec::new();
        for (index, raw) in self.payload_handling.directions.iter().enumerate() {
            let scope = format!("direction #{}", index + 1);
            let (Some(source), Some(target)) = (&raw.source_ip, &raw.target_ip) else {
                warn!("{scope} is missing source_ip or target_ip, skipping");
                continue;
            };
            let (Ok(source_ip), Ok(target_ip)) =
                (source.parse::<IpAddr>(), target.parse::<IpAddr>())
            else {
                warn!("{scope} has unparseable source_ip or target_ip, skipping");
                continue;
            };
            directions.push(DirectionRules {
                source_ip,
                target_ip,
                rules: compile_bundle(&raw.rules, &scope),
            });
        }
        RuleSet { global, directions }
    }

    /// Distill the attack-mode section for the MITM machine. The payload
    /// comes from the `server_to_client` entry (the leg where the
    /// challenge is intercepted), falling back to the first enabled entry
    /// for configs using legacy direction names.
    pub fn mitm_config(&self) -> MitmConfig {
        let entry = self
            .attack_mode
            .get(SERVER_TO_CLIENT)
            .or_else(|| self.attack_mode.values().find(|e| e.enabled));
        let Some(entry) = entry else {
            return MitmConfig::default();
        };
        if !entry.enabled {
            return MitmConfig::default();
        }
        let payload = match crate::rules::decode_hex(&entry.malicious_payload_hex) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("attack_mode payload is not valid hex ({err}); attack disabled");
                return MitmConfig::default();
            }
        };
        MitmConfig {
            enabled: true,
            payload,
            log: entry.log,
        }
    }
}

fn compile_bundle(raw: &RawRuleBundle, scope: &str) -> RuleBundle {
    RuleBundle {
        block: raw
            .block
            .entries()
            .into_iter()
            .filter_map(|v| compile_block(v, scope))
            .collect(),
        delay: raw
            .delay
            .entries()
            .into_iter()
            .filter_map(|v| compile_delay(v, scope))
            .collect(),
        insert: raw
            .insert
            .entries()
            .into_iter()
            .filter_map(|v| compile_insert(v, scope))
            .collect(),
        replay: raw
            .replay
            .entries()
            .into_iter()
            .filter_map(|v| compile_replay(v, scope))
            .collect(),
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn compile_block(value: &Value, scope: &str) -> Option<BlockRule> {
    match str_field(value, "action") {
        Some(action) => Some(BlockRule {
            action: action.to_owned(),
        }),
        None => {
            warn!("{scope} block rule is missing 'action', ignoring");
            None
        }
    }
}

fn compile_delay(value: &Value, scope: &str) -> Option<DelayRule> {
    let action = match str_field(value, "action") {
        Some(action) => action.to_owned(),
        None => {
            warn!("{scope} delay rule is missing 'action', ignoring");
            return None;
        }
    };
    // delay_ms must be a positive integer; anything else drops the rule.
    match value.get("delay_ms").and_then(Value::as_i64) {
        Some(ms) if ms > 0 => Some(DelayRule {
            action,
            delay: std::time::Duration::from_millis(ms as u64),
        }),
        _ => {
            warn!("{scope} delay rule for action {action:?} has no positive delay_ms, ignoring");
            None
        }
    }
}

fn compile_insert(value: &Value, scope: &str) -> Option<InsertRule> {
    let (Some(action), Some(data)) = (str_field(value, "action"), str_field(value, "data"))
    else {
        warn!("{scope} insert rule is missing 'action' or 'data', ignoring");
        return None;
    };
    let data_type = match compile_data_type(value, scope, action) {
        Ok(dt) => dt,
        Err(()) => return None,
    };
    let position = compile_position(value, scope, action, Position::Before);
    let delay_sec = value
        .get("delay_sec")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let delay_ms = value.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
    let repeat = match value.get("repeat") {
        None => Repeat::Times(1),
        Some(v) => {
            if v.as_str() == Some("once") {
                Repeat::Once
            } else {
                match v.as_u64() {
                    Some(n) if n >= 1 => Repeat::Times(n as u32),
                    _ => {
                        warn!(
                            "{scope} insert rule for action {action:?} has invalid repeat, \
                             defaulting to 1"
                        );
                        Repeat::Times(1)
                    }
                }
            }
        }
    };
    Some(InsertRule::new(
        action.to_owned(),
        data.to_owned(),
        data_type,
        position,
        delay_sec,
        delay_ms,
        repeat,
    ))
}

fn compile_replay(value: &Value, scope: &str) -> Option<ReplayRule> {
    let action = match str_field(value, "action") {
        Some(action) => action.to_owned(),
        None => {
            warn!("{scope} replay rule is missing 'action', ignoring");
            return None;
        }
    };
    let count = match value.get("count").and_then(Value::as_u64) {
        Some(count) if count >= 1 => count as u32,
        _ => {
            warn!("{scope} replay rule for action {action:?} has no positive count, ignoring");
            return None;
        }
    };
    let data_type = match compile_data_type(value, scope, &action) {
        Ok(dt) => dt,
        Err(()) => return None,
    };
    Some(ReplayRule::new(
        action.clone(),
        count,
        value
            .get("block_original")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        value.get("delay_ms").and_then(Value::as_u64).unwrap_or(0),
        str_field(value, "data").map(str::to_owned),
        data_type,
        compile_position(value, scope, &action, Position::After),
    ))
}

fn compile_data_type(value: &Value, scope: &str, action: &str) -> Result<DataType, ()> {
    match value.get("data_type").and_then(Value::as_str) {
        None | Some("utf8") | Some("bytes") => Ok(DataType::Utf8),
        Some("hex") => Ok(DataType::Hex),
        Some(other) => {
            warn!("{scope} rule for action {action:?} has unknown data_type {other:?}, ignoring");
            Err(())
        }
    }
}

fn compile_position(value: &Value, scope: &str, action: &str, default: Position) -> Position {
    match value.get("position").and_then(Value::as_str) {
        None => default,
        Some("before") => Position::Before,
        Some("after") => Position::After,
        Some(other) => {
            warn!(
                "{scope} rule for action {action:?} has unknown position {other:?}, \
                 defaulting to {default}"
            );
            default
        }
    }
}
