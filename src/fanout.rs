//! The auxiliary fan-out: mirror/bot server.
//!
//! Accepts any number of observer connections. Every decoded packet the
//! relay forwards is serialized into the auxiliary frame format and
//! broadcast to all of them; any observer can send control frames back to
//! mutate the block set or inject packets into a live session. One
//! observer failing never affects the others or the relay itself: each
//! observer writes from its own task behind a bounded queue, and an
//! observer that falls too far behind is disconnected instead of ever
//! back-pressuring the broadcast loop.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::frame::{Direction, Frame, FrameBuffer, CONTROL_BLOCK, CONTROL_UNBLOCK};
use crate::relay::RelayCommand;

const OBSERVER_READ_CHUNK: usize = 4096;

/// Frames queued per observer before it counts as stalled.
const OBSERVER_QUEUE_CAPACITY: usize = 256;

/// One connected observer: its frame lane plus the writer task draining
/// that lane into the socket. The writer is aborted on removal so a
/// stalled peer's connection goes down with its table entry.
struct ObserverHandle {
    lane: mpsc::Sender<Arc<Vec<u8>>>,
    writer: tokio::task::JoinHandle<()>,
}

/// Accept loop plus broadcast loop. Observers are keyed by a
/// monotonically increasing handle, so identity is handle equality and a
/// removal can never alias another connection. The table holds each
/// observer's frame lane; the socket writes happen in per-observer
/// [`forward`] tasks so a stalled peer never parks this loop.
pub async fn run(
    listener: TcpListener,
    mut mirror_rx: mpsc::Receiver<Frame>,
    command_tx: mpsc::Sender<RelayCommand>,
) {
    let mut observers: HashMap<u64, ObserverHandle> = HashMap::new();
    let mut next_id: u64 = 0;
    let (gone_tx, mut gone_rx) = mpsc::channel::<u64>(32);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        ::tracing::debug!("set_nodelay failed: {:?}", e);
                    }
                    let (read_half, write_half) = stream.into_split();
                    let id = next_id;
                    next_id += 1;
                    ::tracing::info!(%peer, id, "observer connected");
                    let (frame_tx, frame_rx) = mpsc::channel(OBSERVER_QUEUE_CAPACITY);
                    let writer =
                        tokio::spawn(forward(id, write_half, frame_rx, gone_tx.clone()));
                    observers.insert(
                        id,
                        ObserverHandle {
                            lane: frame_tx,
                            writer,
                        },
                    );
                    tokio::spawn(observe(id, read_half, command_tx.clone(), gone_tx.clone()));
                }
                Err(e) => {
                    ::tracing::warn!("failed to accept an observer: {:?}", e);
                }
            },
            frame = mirror_rx.recv() => match frame {
                Some(frame) => broadcast(&mut observers, &frame),
                None => {
                    // Engine gone; nothing left to mirror.
                    ::tracing::info!("mirror lane closed, fan-out stopping");
                    return;
                }
            },
            gone = gone_rx.recv() => {
                if let Some(id) = gone {
                    if let Some(observer) = observers.remove(&id) {
                        observer.writer.abort();
                        ::tracing::info!(id, "observer disconnected");
                    }
                }
            }
        }
    }
}

/// Serializes the frame once and hands it to every observer's writer
/// lane without waiting. A full lane means that observer has stopped
/// reading; it is disconnected so everyone else keeps receiving.
fn broadcast(observers: &mut HashMap<u64, ObserverHandle>, frame: &Frame) {
    let wire = Arc::new(frame.to_wire());
    let mut dead = Vec::new();
    for (id, observer) in observers.iter() {
        match observer.lane.try_send(wire.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                ::tracing::warn!(id = *id, "observer stalled, disconnecting");
                dead.push(*id);
            }
            Err(TrySendError::Closed(_)) => {
                dead.push(*id);
            }
        }
    }
    for id in dead {
        if let Some(observer) = observers.remove(&id) {
            observer.writer.abort();
        }
    }
}

/// Per-observer write loop: drains the frame lane into the socket.
/// Exits on lane close or the first write failure; a stalled observer's
/// instance is aborted instead, since it may be parked in `write_all`.
/// Either way the write half drops and sends the FIN.
async fn forward(
    id: u64,
    mut write_half: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Arc<Vec<u8>>>,
    gone_tx: mpsc::Sender<u64>,
) {
    while let Some(wire) = frames.recv().await {
        if let Err(e) = write_half.write_all(&wire).await {
            ::tracing::warn!(id, "observer write failure: {:?}", e);
            break;
        }
    }
    let _ = gone_tx.send(id).await;
}

/// Per-observer read loop: reassemble frames, hand decoded commands to
/// the engine, report the connection gone on error or EOF.
async fn observe(
    id: u64,
    mut read_half: OwnedReadHalf,
    command_tx: mpsc::Sender<RelayCommand>,
    gone_tx: mpsc::Sender<u64>,
) {
    let mut frames = FrameBuffer::new();
    let mut chunk = vec![0u8; OBSERVER_READ_CHUNK];
    'read: loop {
        match read_half.read(&mut chunk).await {
            Ok(0) => {
                ::tracing::info!(id, "observer connection ended");
                break;
            }
            Ok(n) => {
                frames.extend(&chunk[..n]);
                while let Some(frame) = frames.next_frame() {
                    match decode_command(&frame) {
                        Some(command) => {
                            if command_tx.send(command).await.is_err() {
                                break 'read;
                            }
                        }
                        None => {
                            ::tracing::warn!(
                                id,
                                opcode = frame.opcode,
                                direction = frame.direction,
                                "discarding malformed observer frame"
                            );
                        }
                    }
                }
            }
            Err(e) => {
                ::tracing::warn!(id, "observer read failure: {:?}", e);
                break;
            }
        }
    }
    let _ = gone_tx.send(id).await;
}

/// Control opcodes 1/2 carry one game opcode to block or unblock; any
/// other opcode is a packet to inject, with the direction tag picking
/// the leg. Malformed frames decode to `None` and are skipped.
fn decode_command(frame: &Frame) -> Option<RelayCommand> {
    match frame.opcode {
        CONTROL_BLOCK | CONTROL_UNBLOCK => {
            if frame.payload.len() < 2 {
                return None;
            }
            let game_opcode = u16::from_le_bytes([frame.payload[0], frame.payload[1]]);
            if frame.opcode == CONTROL_BLOCK {
                Some(RelayCommand::Block(game_opcode))
            } else {
                Some(RelayCommand::Unblock(game_opcode))
            }
        }
        game_opcode => {
            let direction = Direction::from_wire(frame.direction)?;
            Some(RelayCommand::Inject {
                direction,
                opcode: game_opcode,
                payload: frame.payload.clone(),
            })
        }
    }
}
