//! # Per-Direction Forwarder
//!
//! One forwarder task per direction of a flow: read a chunk, feed the
//! frame decoder, run each decoded message through the MITM machine and
//! the rule pipeline, then write the verdict out in order. All writes for
//! a message complete before the next chunk is read, so wire order equals
//! evaluation order and peer backpressure propagates straight to the read
//! side; there is no internal queue.
//!
//! The loop is generic over the stream halves so the integration tests
//! drive it over in-memory duplex pipes.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace};

use crate::codec::FrameDecoder;
use crate::mitm::{Leg, MitmMachine, MitmVerdict};
use crate::rules::evaluator::Evaluator;
use crate::rules::RuleSetHandle;

/// Everything a forwarder needs besides its stream halves.
pub struct ForwarderContext {
    pub leg: Leg,
    /// Human-readable flow label for log lines, e.g. `10.0.0.2:4711->10.0.0.9:8000`.
    pub label: String,
    pub source_ip: IpAddr,
    pub target_ip: IpAddr,
    pub rules: RuleSetHandle,
    pub mitm: Arc<MitmMachine>,
    /// Process start, the reference point for insert start-time gates.
    pub process_start: Instant,
}

/// Why the forwarder loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Clean EOF from the read side; the peer writer was shut down.
    Eof,
    /// The MITM machine requested an RST tear-down. The writer is left
    /// unshut so the handler can reset instead of FIN-closing.
    TearDown,
    /// I/O or protocol failure; the direction is finished.
    Failed,
}

/// Pump one direction until EOF, error, or tear-down.
pub async fn run<R, W>(mut reader: R, mut writer: W, ctx: ForwarderContext) -> ForwardOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut evaluator = Evaluator::new(
        ctx.source_ip,
        ctx.target_ip,
        ctx.label.clone(),
        ctx.process_start,
    );
    let mut chunk = vec![0u8; crate::defaults::READ_CHUNK];

    let outcome = 'flow: loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break ForwardOutcome::Eof,
            Ok(n) => n,
            Err(err) => {
                // Peer resets are routine here, not worth a backtrace.
                info!(dir = %ctx.label, "read side closed: {err}");
                break ForwardOutcome::Failed;
            }
        };
        trace!(dir = %ctx.label, bytes = n, "chunk");

        let frames = match decoder.append(&chunk[..n]) {
            Ok(frames) => frames,
            Err(err) => {
                info!(dir = %ctx.label, "protocol desync, dropping direction: {err}");
                break ForwardOutcome::Failed;
            }
        };
        if frames.is_empty() {
            trace!(
                dir = %ctx.label,
                buffered = decoder.buffered(),
                pending_len = ?decoder.pending_len(),
                "no complete message in chunk"
            );
            continue;
        }
        debug!(dir = %ctx.label, messages = frames.len(), "decoded");

        for frame in &frames {
            // One snapshot per message: the whole verdict is computed
            // against a consistent rule set.
            let snapshot = ctx.rules.snapshot();

            match ctx.mitm.process_message(ctx.leg, frame, &mut writer).await {
                Ok(MitmVerdict::Pass) => {}
                Ok(MitmVerdict::Suppress) => continue,
                Ok(MitmVerdict::TearDown) => break 'flow ForwardOutcome::TearDown,
                Err(err) => {
                    info!(dir = %ctx.label, "write failed during interception: {err}");
                    break 'flow ForwardOutcome::Failed;
                }
            }

            let verdict = evaluator.evaluate(frame, &snapshot).await;
            if let Err(err) = write_verdict(&mut writer, frame, &verdict).await {
                info!(dir = %ctx.label, "write side closed: {err}");
                break 'flow ForwardOutcome::Failed;
            }
        }
    };

    if outcome != ForwardOutcome::TearDown {
        // Half-close toward the peer; errors here are uninteresting.
        let _ = writer.shutdown().await;
    }
    outcome
}

/// Write one message's verdict: before-insertions, the original frame if
/// forwarded, after-insertions, then replayed copies with their spacing.
/// Everything is awaited to completion to keep wire order exact.
async fn write_verdict<W>(
    writer: &mut W,
    frame: &crate::codec::Frame,
    verdict: &crate::rules::evaluator::Verdict,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for insertion in verdict.before() {
        writer.write_all(&insertion.bytes).await?;
    }
    if verdict.forward {
        writer.write_all(&frame.raw).await?;
    }
    for insertion in verdict.after() {
        writer.write_all(&insertion.bytes).await?;
    }
    writer.flush().await?;

    for (i, copy) in verdict.replays.iter().enumerate() {
        if i > 0 && !copy.gap.is_zero() {
            tokio::time::sleep(copy.gap).await;
        }
        writer.write_all(&copy.frame).await?;
        writer.flush().await?;
    }
    Ok(())
}
