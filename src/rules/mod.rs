//! # Manipulation Rule Model
//!
//! The parsed, immutable form of the payload-handling configuration:
//! global rules plus an ordered list of directional rule bundles keyed by
//! `(source_ip, target_ip)`. A [`RuleSet`] snapshot is published through a
//! [`RuleSetHandle`] (an atomic pointer swap); forwarders dereference it
//! once per message so every message sees a whole-snapshot-consistent
//! view, and hot reload never tears an in-flight evaluation.

pub mod evaluator;

use arc_swap::ArcSwap;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::warn;

/// How insert/replay override data is encoded in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataType {
    #[default]
    Utf8,
    Hex,
}

/// Where inserted bytes land relative to the triggering message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Position {
    #[default]
    Before,
    After,
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Position::Before => write!(f, "before"),
            Position::After => write!(f, "after"),
        }
    }
}

/// Repeat count for an insert rule. `Once` latches per forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Times(u32),
    Once,
}

impl Default for Repeat {
    fn default() -> Self {
        Repeat::Times(1)
    }
}

/// Drop messages carrying this action.
#[derive(Debug, Clone)]
pub struct BlockRule {
    pub action: String,
}

/// Hold messages carrying this action for a fixed time.
#[derive(Debug, Clone)]
pub struct DelayRule {
    pub action: String,
    pub delay: Duration,
}

/// Splice extra bytes around messages carrying this action.
#[derive(Debug)]
pub struct InsertRule {
    pub action: String,
    pub data: String,
    pub data_type: DataType,
    pub position: Position,
    /// Gate relative to process start; the rule only fires once this many
    /// seconds have elapsed.
    pub delay_sec: u64,
    /// Await before producing the insertion.
    pub delay_ms: u64,
    pub repeat: Repeat,
    decoded: OnceLock<Option<Vec<u8>>>,
}

impl InsertRule {
    pub fn new(
        action: String,
        data: String,
        data_type: DataType,
        position: Position,
        delay_sec: u64,
        delay_ms: u64,
        repeat: Repeat,
    ) -> Self {
        Self {
            action,
            data,
            data_type,
            position,
            delay_sec,
            delay_ms,
            repeat,
            decoded: OnceLock::new(),
        }
    }

    /// The insertion bytes, decoded per `data_type`. Malformed hex skips
    /// the rule; the warning fires once per rule for the process lifetime.
    pub fn data_bytes(&self) -> Option<&[u8]> {
        self.decoded
            .get_or_init(|| match decode_rule_data(&self.data, self.data_type) {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    warn!(
                        action = %self.action,
                        "skipping insert rule with malformed data: {err}"
                    );
                    None
                }
            })
            .as_deref()
    }
}

/// Re-emit framed copies of messages carrying this action.
#[derive(Debug)]
pub struct ReplayRule {
    pub action: String,
    pub count: u32,
    /// Suppress the original message (and the following `count - 1`
    /// same-action messages), writing one replayed copy in place of each.
    pub block_original: bool,
    /// Spacing between consecutive replayed copies.
    pub delay_ms: u64,
    /// Optional payload override; when absent, the triggering message's
    /// raw frame is replayed verbatim.
    pub data: Option<String>,
    pub data_type: DataType,
    pub position: Position,
    decoded: OnceLock<Option<Vec<u8>>>,
}

impl ReplayRule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        action: String,
        count: u32,
        block_original: bool,
        delay_ms: u64,
        data: Option<String>,
        data_type: DataType,
        position: Position,
    ) -> Self {
        Self {
            action,
            count,
            block_original,
            delay_ms,
            data,
            data_type,
            position,
            decoded: OnceLock::new(),
        }
    }

    /// The override payload, decoded once. `None` either because no
    /// override is configured or because the data was malformed.
    pub fn override_bytes(&self) -> Option<&[u8]> {
        self.decoded
            .get_or_init(|| {
                let data = self.data.as_deref()?;
                match decode_rule_data(data, self.data_type) {
                    Ok(bytes) => Some(bytes),
                    Err(err) => {
                        warn!(
                            action = %self.action,
                            "ignoring replay data override with malformed data: {err}"
                        );
                        None
                    }
                }
            })
            .as_deref()
    }
}

/// The rules of one scope (global, or one direction).
#[derive(Debug, Default)]
pub struct RuleBundle {
    pub block: Vec<BlockRule>,
    pub delay: Vec<DelayRule>,
    pub insert: Vec<InsertRule>,
    pub replay: Vec<ReplayRule>,
}

impl RuleBundle {
    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
            && self.delay.is_empty()
            && self.insert.is_empty()
            && self.replay.is_empty()
    }
}

/// Rules scoped to one leg: applied when the forwarder's outer IPs match.
#[derive(Debug)]
pub struct DirectionRules {
    pub source_ip: IpAddr,
    pub target_ip: IpAddr,
    pub rules: RuleBundle,
}

/// Immutable snapshot of the full parsed configuration.
#[derive(Debug, Default)]
pub struct RuleSet {
    pub global: RuleBundle,
    /// Declaration order preserved; the first matching direction wins.
    pub directions: Vec<DirectionRules>,
}

impl RuleSet {
    /// First direction whose endpoints equal the forwarder's, if any.
    pub fn direction_for(&self, source_ip: IpAddr, target_ip: IpAddr) -> Option<&DirectionRules> {
        self.directions
            .iter()
            .find(|d| d.source_ip == source_ip && d.target_ip == target_ip)
    }
}

/// Shared handle to the current snapshot. Cloning is cheap; all clones
/// observe the same published pointer.
#[derive(Clone)]
pub struct RuleSetHandle {
    inner: Arc<ArcSwap<RuleSet>>,
}

impl RuleSetHandle {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(rules)),
        }
    }

    /// The current snapshot. Taken once per message by forwarders, so an
    /// in-flight message is evaluated against exactly one set.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.inner.load_full()
    }

    /// Publish a new snapshot. In-flight forwarders pick it up at their
    /// next message boundary.
    pub fn publish(&self, rules: RuleSet) {
        self.inner.store(Arc::new(rules));
    }
}

impl Default for RuleSetHandle {
    fn default() -> Self {
        Self::new(RuleSet::default())
    }
}

/// Decode rule data per its declared encoding.
pub(crate) fn decode_rule_data(data: &str, data_type: DataType) -> Result<Vec<u8>, String> {
    match data_type {
        DataType::Utf8 => Ok(data.as_bytes().to_vec()),
        DataType::Hex => decode_hex(data),
    }
}

/// Strict hex decode: even length, [0-9a-fA-F] only.
pub(crate) fn decode_hex(input: &str) -> Result<Vec<u8>, String> {
    let input = input.trim();
    if input.len() % 2 != 0 {
        return Err(format!("odd-length hex string ({} chars)", input.len()));
    }
    let mut out = Vec::with_capacity(input.len() / 2);
    let bytes = input.as_bytes();
    for pair in bytes.chunks_exact(2) {
        let hi = hex_nibble(pair[0]).ok_or_else(|| format!("invalid hex digit {:?}", pair[0] as char))?;
        let lo = hex_nibble(pair[1]).ok_or_else(|| format!("invalid hex digit {:?}", pair[1] as char))?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_decodes() {
        assert_eq!(decode_hex("deadbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(decode_hex("DEADbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
        assert_eq!(decode_hex("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn insert_rule_decodes_once_and_caches_failure() {
        let rule = InsertRule::new(
            "get_status".into(),
            "nothex".into(),
            DataType::Hex,
            Position::Before,
            0,
            0,
            Repeat::default(),
        );
        assert!(rule.data_bytes().is_none());
        assert!(rule.data_bytes().is_none());

        let ok = InsertRule::new(
            "get_status".into(),
            "deadbeef".into(),
            DataType::Hex,
            Position::Before,
            0,
            0,
            Repeat::default(),
        );
        assert_eq!(ok.data_bytes(), Some(&[0xde, 0xad, 0xbe, 0xef][..]));
    }

    #[test]
    fn first_matching_direction_wins() {
        let a: IpAddr = "10.10.20.11".parse().unwrap();
        let b: IpAddr = "10.10.20.13".parse().unwrap();
        let set = RuleSet {
            global: RuleBundle::default(),
            directions: vec![
                DirectionRules {
                    source_ip: a,
                    target_ip: b,
                    rules: RuleBundle {
                        block: vec![BlockRule {
                            action: "first".into(),
                        }],
                        ..Default::default()
                    },
                },
                DirectionRules {
                    source_ip: a,
                    target_ip: b,
                    rules: RuleBundle {
                        block: vec![BlockRule {
                            action: "second".into(),
                        }],
                        ..Default::default()
                    },
                },
            ],
        };
        let matched = set.direction_for(a, b).unwrap();
        assert_eq!(matched.rules.block[0].action, "first");
        assert!(set.direction_for(b, a).is_none());
    }

    #[test]
    fn handle_swaps_atomically() {
        let handle = RuleSetHandle::default();
        let before = handle.snapshot();
        assert!(before.global.is_empty());

        handle.publish(RuleSet {
            global: RuleBundle {
                block: vec![BlockRule { action: "x".into() }],
                ..Default::default()
            },
            directions: Vec::new(),
        });

        // The earlier snapshot is unaffected; new loads see the block rule.
        assert!(before.global.is_empty());
        assert_eq!(handle.snapshot().global.block[0].action, "x");
    }
}
