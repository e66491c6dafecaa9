//! # Rule Evaluation Pipeline
//!
//! Applies the configured manipulation rules to one decoded message and
//! produces a [`Verdict`] the forwarder writes out. Evaluation order is
//! stable: block, then delay (global before direction, cumulative), then
//! insert (global before direction, declaration order), then replay.
//!
//! The evaluator is owned by a single forwarder task and carries that
//! forwarder's rule-local state: which `repeat: once` inserts have fired,
//! and any active replay blocking session. It holds no reference to a
//! rule set; the caller passes the snapshot it dereferenced for the
//! current message, so hot reload stays a message-boundary event.

use super::{Position, Repeat, RuleSet, ReplayRule};
use crate::codec::{Frame, FRAME_HEADER_LEN};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info};

/// Bytes to splice around the triggering message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insertion {
    pub bytes: Vec<u8>,
    pub position: Position,
}

/// One framed replayed copy, with its spacing from the previous copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayCopy {
    /// Complete frame, length prefix included.
    pub frame: Vec<u8>,
    pub gap: Duration,
}

/// What the forwarder does with the message.
#[derive(Debug, Default)]
pub struct Verdict {
    pub forward: bool,
    pub insertions: Vec<Insertion>,
    pub replays: Vec<ReplayCopy>,
}

impl Verdict {
    fn pass() -> Self {
        Self {
            forward: true,
            insertions: Vec::new(),
            replays: Vec::new(),
        }
    }

    fn blocked() -> Self {
        Self {
            forward: false,
            insertions: Vec::new(),
            replays: Vec::new(),
        }
    }

    /// Insertions placed before the message frame, in order.
    pub fn before(&self) -> impl Iterator<Item = &Insertion> {
        self.insertions
            .iter()
            .filter(|i| i.position == Position::Before)
    }

    /// Insertions placed after the message frame, in order.
    pub fn after(&self) -> impl Iterator<Item = &Insertion> {
        self.insertions
            .iter()
            .filter(|i| i.position == Position::After)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RuleScope {
    Global,
    Direction,
}

/// An in-progress `block_original` replay: the stored copy is written in
/// place of each suppressed same-action message until `remaining` runs out.
#[derive(Debug)]
struct BlockingSession {
    remaining: u32,
    frame: Vec<u8>,
}

/// Per-forwarder rule evaluation state.
pub struct Evaluator {
    source_ip: IpAddr,
    target_ip: IpAddr,
    label: String,
    process_start: Instant,
    fired_once: HashSet<(RuleScope, usize)>,
    blocking: HashMap<String, BlockingSession>,
}

impl Evaluator {
    pub fn new(
        source_ip: IpAddr,
        target_ip: IpAddr,
        label: impl Into<String>,
        process_start: Instant,
    ) -> Self {
        Self {
            source_ip,
            target_ip,
            label: label.into(),
            process_start,
            fired_once: HashSet::new(),
            blocking: HashMap::new(),
        }
    }

    /// Evaluate one message against the snapshot taken for it.
    ///
    /// Sleeps inline for delay rules; only this forwarder direction is
    /// suspended, the opposite leg keeps flowing.
    pub async fn evaluate(&mut self, frame: &Frame, rules: &RuleSet) -> Verdict {
        let Some(action) = frame.decoded.action().map(str::to_owned) else {
            // No action key, no action-based rule can match.
            return Verdict::pass();
        };
        let direction = rules.direction_for(self.source_ip, self.target_ip);

        // Block wins outright; a blocked message is not delayed.
        let global_hit = rules.global.block.iter().any(|r| r.action == action);
        let direction_hit = direction
            .map(|d| d.rules.block.iter().any(|r| r.action == action))
            .unwrap_or(false);
        if global_hit || direction_hit {
            info!(action = %action, dir = %self.label, "BLOCK");
            return Verdict::blocked();
        }

        // Delays are cumulative, global first.
        if let Some(rule) = rules.global.delay.iter().find(|r| r.action == action) {
            sleep(rule.delay).await;
            info!(
                action = %action,
                ms = rule.delay.as_millis() as u64,
                dir = %self.label,
                "DELAY"
            );
        }
        if let Some(rule) = direction
            .and_then(|d| d.rules.delay.iter().find(|r| r.action == action))
        {
            sleep(rule.delay).await;
            info!(
                action = %action,
                ms = rule.delay.as_millis() as u64,
                dir = %self.label,
                "DELAY"
            );
        }

        let mut verdict = Verdict::pass();

        let global_inserts = rules
            .global
            .insert
            .iter()
            .enumerate()
            .map(|(i, r)| (RuleScope::Global, i, r));
        let direction_inserts = direction
            .into_iter()
            .flat_map(|d| d.rules.insert.iter().enumerate())
            .map(|(i, r)| (RuleScope::Direction, i, r));

        for (scope, index, rule) in global_inserts.chain(direction_inserts) {
            if rule.action != action {
                continue;
            }
            // Unmet start-time gates skip silently; the rule becomes
            // eligible on a later match.
            if rule.delay_sec > 0
                && self.process_start.elapsed() < Duration::from_secs(rule.delay_sec)
            {
                continue;
            }
            if rule.repeat == Repeat::Once && self.fired_once.contains(&(scope, index)) {
                continue;
            }
            let Some(bytes) = rule.data_bytes() else {
                continue;
            };
            if rule.delay_ms > 0 {
                sleep(Duration::from_millis(rule.delay_ms)).await;
            }
            if rule.repeat == Repeat::Once {
                self.fired_once.insert((scope, index));
            }
            let copies = match rule.repeat {
                Repeat::Times(n) => n,
                Repeat::Once => 1,
            };
            for _ in 0..copies {
                verdict.insertions.push(Insertion {
                    bytes: bytes.to_vec(),
                    position: rule.position,
                });
            }
            info!(
                action = %action,
                pos = %rule.position,
                bytes = bytes.len(),
                "INSERT"
            );
        }

        // An active blocking session consumes this message before any new
        // replay rule can trigger.
        if let Some(session) = self.blocking.get_mut(&action) {
            session.remaining -= 1;
            verdict.forward = false;
            verdict.replays.push(ReplayCopy {
                frame: session.frame.clone(),
                gap: Duration::ZERO,
            });
            debug!(
                action = %action,
                remaining = session.remaining,
                "replay session suppressed original"
            );
            if session.remaining == 0 {
                self.blocking.remove(&action);
                debug!(action = %action, "replay session complete");
            }
            return verdict;
        }

        let global_replays = rules.global.replay.iter();
        let direction_replays = direction.into_iter().flat_map(|d| d.rules.replay.iter());
        for rule in global_replays.chain(direction_replays) {
            if rule.action != action {
                continue;
            }
            let Some(copy) = replay_frame(rule, frame) else {
                continue;
            };
            info!(action = %action, count = rule.count, "REPLAY");
            if rule.block_original {
                verdict.forward = false;
                verdict.replays.push(ReplayCopy {
                    frame: copy.clone(),
                    gap: Duration::ZERO,
                });
                if rule.count > 1 {
                    self.blocking.insert(
                        action.clone(),
                        BlockingSession {
                            remaining: rule.count - 1,
                            frame: copy,
                        },
                    );
                }
            } else {
                let gap = Duration::from_millis(rule.delay_ms);
                for _ in 0..rule.count {
                    verdict.replays.push(ReplayCopy {
                        frame: copy.clone(),
                        gap,
                    });
                }
            }
        }

        verdict
    }
}

/// The framed bytes one replayed copy carries: the override payload under
/// a freshly computed prefix, or the original frame verbatim.
fn replay_frame(rule: &ReplayRule, frame: &Frame) -> Option<Vec<u8>> {
    if rule.data.is_some() {
        let payload = rule.override_bytes()?;
        let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);
        Some(framed)
    } else {
        Some(frame.raw.clone())
    }
}
