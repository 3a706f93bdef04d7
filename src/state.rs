//! Process-wide shared state and the command/response queues that connect
//! the central, peripheral, and coordinator tasks.
//!
//! Mirrors the teacher's `HrmState`/`TreadmillState` shape (a plain struct
//! behind `Arc<Mutex<..>>`, mutated by whichever task owns a given field)
//! generalized to the dual-role bridge: the central task writes derived
//! telemetry and `last_notify_at`; the coordinator writes the peripheral
//! connection/activity flags; the peripheral task only reads.

use std::time::Instant;

use tokio::sync::{mpsc, Mutex, Notify};

use crate::derived_state::DerivedState;

/// Commands enqueued by the peripheral's Control Point handler and drained
/// by the central active loop. Speed is vendor raw (km/h x100); incline is
/// vendor raw (% x100), already unit-reconciled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetCommand {
    SetSpeed(u16),
    SetIncline(u16),
}

/// Bounded depth for `control_queue`; the active loop drains at most 5 per
/// 200ms tick, so a handful of slots is plenty of headroom without letting
/// a stuck central task build unbounded backlog.
const CONTROL_QUEUE_DEPTH: usize = 16;
/// `response_queue` carries one entry per Control Point write; writes are
/// inherently rate-limited by the BLE link, so a modest bound suffices.
const RESPONSE_QUEUE_DEPTH: usize = 16;

/// A queued FTMS Control Point indication, produced by the opcode handler
/// and consumed by the peripheral server's dispatch loop.
#[derive(Debug, Clone)]
pub struct QueuedResponse {
    pub opcode: u8,
    pub result: u8,
}

/// Process-wide mutable record described in the data model: connection
/// flags, activity timestamps, and the last DerivedState snapshot used to
/// build Treadmill Data notifications.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub central_connected: bool,
    pub peripheral_connected: bool,
    pub last_notify_at: Option<Instant>,
    pub last_peripheral_activity_at: Option<Instant>,
    pub pause_coordinator: bool,
    pub derived: DerivedState,
    pub last_notified_ftms_frame: Option<Vec<u8>>,
    pub last_notified_ftms_at: Option<Instant>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            central_connected: false,
            peripheral_connected: false,
            last_notify_at: None,
            last_peripheral_activity_at: None,
            pause_coordinator: false,
            derived: DerivedState::default(),
            last_notified_ftms_frame: None,
            last_notified_ftms_at: None,
        }
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Shared handle type used by every task: a single mutex-guarded state plus
/// the two mpsc channel halves, grouped so `main` can build it once and
/// hand clones/halves to each task.
pub struct Shared {
    pub session: Mutex<SessionState>,
    /// Signalled by the central task whenever fresh telemetry lands, so the
    /// peripheral server can re-evaluate smart-notify without polling.
    pub telemetry_notify: Notify,
    control_tx: mpsc::Sender<TargetCommand>,
    control_rx: Mutex<mpsc::Receiver<TargetCommand>>,
    response_tx: mpsc::Sender<QueuedResponse>,
    response_rx: Mutex<mpsc::Receiver<QueuedResponse>>,
}

impl Shared {
    pub fn new() -> Self {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
        Self {
            session: Mutex::new(SessionState::new()),
            telemetry_notify: Notify::new(),
            control_tx,
            control_rx: Mutex::new(control_rx),
            response_tx,
            response_rx: Mutex::new(response_rx),
        }
    }

    pub fn control_sender(&self) -> mpsc::Sender<TargetCommand> {
        self.control_tx.clone()
    }

    pub fn response_sender(&self) -> mpsc::Sender<QueuedResponse> {
        self.response_tx.clone()
    }

    /// Drain up to `max` queued commands without blocking, for the central
    /// active loop's "up to 5 per tick" rule. Queues are not replayed
    /// across a central reconnect; the caller simply stops draining.
    pub async fn drain_control(&self, max: usize) -> Vec<TargetCommand> {
        let mut rx = self.control_rx.lock().await;
        let mut out = Vec::with_capacity(max);
        while out.len() < max {
            match rx.try_recv() {
                Ok(cmd) => out.push(cmd),
                Err(_) => break,
            }
        }
        out
    }

    /// Wait for the next queued Control Point response. The peripheral
    /// server's main loop selects on this alongside GATT events so the
    /// bounded channel always has a live consumer and a slow/absent GATT
    /// subscriber can never back it up indefinitely. `recv` is cancel-safe,
    /// so this is safe to use as a `tokio::select!` branch. Returns `None`
    /// once every sender has been dropped.
    pub async fn recv_response(&self) -> Option<QueuedResponse> {
        let mut rx = self.response_rx.lock().await;
        rx.recv().await
    }
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn control_queue_is_fifo_and_drains_up_to_max() {
        let shared = Shared::new();
        let tx = shared.control_sender();
        tx.send(TargetCommand::SetSpeed(100)).await.unwrap();
        tx.send(TargetCommand::SetIncline(50)).await.unwrap();
        tx.send(TargetCommand::SetSpeed(200)).await.unwrap();

        let drained = shared.drain_control(2).await;
        assert_eq!(
            drained,
            vec![TargetCommand::SetSpeed(100), TargetCommand::SetIncline(50)]
        );
        let rest = shared.drain_control(5).await;
        assert_eq!(rest, vec![TargetCommand::SetSpeed(200)]);
    }

    #[tokio::test]
    async fn draining_an_empty_control_queue_returns_empty() {
        let shared = Shared::new();
        assert!(shared.drain_control(5).await.is_empty());
    }

    #[tokio::test]
    async fn response_queue_preserves_order() {
        let shared = Shared::new();
        let tx = shared.response_sender();
        tx.send(QueuedResponse { opcode: 0x02, result: 0x01 })
            .await
            .unwrap();
        tx.send(QueuedResponse { opcode: 0x03, result: 0x01 })
            .await
            .unwrap();
        let first = shared.recv_response().await.unwrap();
        let second = shared.recv_response().await.unwrap();
        assert_eq!(first.opcode, 0x02);
        assert_eq!(second.opcode, 0x03);
    }

    #[test]
    fn default_session_state_has_no_connections() {
        let s = SessionState::new();
        assert!(!s.central_connected);
        assert!(!s.peripheral_connected);
        assert!(s.last_notify_at.is_none());
    }
}
