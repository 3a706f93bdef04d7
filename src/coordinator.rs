//! Coordinator / Radio Arbiter: the single-threaded polling loop that
//! brokers the one physical radio between its peripheral duty (serving
//! the FTMS client) and its central duty (connecting outbound to the
//! treadmill).
//!
//! Has no direct teacher counterpart — the teacher runs its central-only
//! and peripheral-only daemons on two separate adapters, so it never faces
//! this exclusion problem. Grounded on the teacher's polling/backoff idiom
//! (`tokio::time::interval`, `tokio::select!` in `scanner.rs`/`main.rs`)
//! applied to a new concern: adapter-policy arbitration through the
//! `AdapterControl` port instead of GATT session plumbing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::adapter::{AdapterControl, ConnectionRole};
use crate::state::Shared;

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const SECURITY_WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);
const HANDOFF_STABILIZATION: Duration = Duration::from_secs(3);

/// One coordinator poll's verdict, derived from the previous/current
/// peripheral-connected flag. Kept free of I/O so the edge-detection rule
/// itself (spec §4.5) is unit-testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    None,
    Connect,
    Disconnect,
}

pub fn detect_edge(was_connected: bool, is_connected: bool) -> Edge {
    match (was_connected, is_connected) {
        (false, true) => Edge::Connect,
        (true, false) => Edge::Disconnect,
        _ => Edge::None,
    }
}

/// Whether an observed active connection should count as the FTMS client
/// (a peripheral-role link from the adapter's point of view).
pub fn counts_as_peripheral_link(role: ConnectionRole) -> bool {
    matches!(role, ConnectionRole::Peripheral)
}

/// Run the coordinator loop until cancelled. Polls every 3s for a
/// peripheral-role connection edge and performs the handoff sequence on a
/// fresh connect; runs the 10s security watchdog on its own cadence.
pub async fn run(shared: Arc<Shared>, adapter_control: Arc<dyn AdapterControl>) {
    let mut poll_tick = tokio::time::interval(POLL_INTERVAL);
    let mut security_tick = tokio::time::interval(SECURITY_WATCHDOG_INTERVAL);
    let mut was_peripheral_connected = false;

    loop {
        tokio::select! {
            _ = poll_tick.tick() => {
                if let Err(e) = poll_once(&shared, &*adapter_control, &mut was_peripheral_connected).await {
                    warn!("coordinator: poll failed: {}", e);
                }
            }
            _ = security_tick.tick() => {
                run_security_watchdog(&*adapter_control).await;
            }
        }
    }
}

async fn poll_once(
    shared: &Arc<Shared>,
    adapter_control: &dyn AdapterControl,
    was_peripheral_connected: &mut bool,
) -> bluer::Result<()> {
    let connections = adapter_control.list_active_connections().await?;
    let is_connected = connections
        .iter()
        .any(|c| counts_as_peripheral_link(c.role));

    match detect_edge(*was_peripheral_connected, is_connected) {
        Edge::Connect => {
            let central_already_linked = shared.session.lock().await.central_connected;
            if !central_already_linked {
                info!("coordinator: peripheral connect edge, performing handoff");
                perform_handoff(shared, adapter_control, &connections).await?;
            } else {
                info!("coordinator: peripheral connect edge, central already linked, accepting normally");
                shared.session.lock().await.peripheral_connected = true;
            }
        }
        Edge::Disconnect => {
            info!("coordinator: peripheral disconnect edge");
            let mut s = shared.session.lock().await;
            s.peripheral_connected = false;
            s.last_peripheral_activity_at = Some(Instant::now());
        }
        Edge::None => {}
    }

    *was_peripheral_connected = is_connected;
    Ok(())
}

async fn perform_handoff(
    shared: &Arc<Shared>,
    adapter_control: &dyn AdapterControl,
    connections: &[crate::adapter::ActiveConnection],
) -> bluer::Result<()> {
    adapter_control.set_advertising(false).await?;
    for conn in connections
        .iter()
        .filter(|c| counts_as_peripheral_link(c.role))
    {
        adapter_control.disconnect_handle(conn.handle).await?;
    }

    {
        let mut s = shared.session.lock().await;
        s.peripheral_connected = true;
        s.pause_coordinator = true;
    }

    // The central task observes pause_coordinator and drives its own
    // scan+connect; once it reports itself connected we resume
    // advertising after a settling window.
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if shared.session.lock().await.central_connected {
            break;
        }
    }

    tokio::time::sleep(HANDOFF_STABILIZATION).await;
    shared.session.lock().await.pause_coordinator = false;
    adapter_control.set_advertising(true).await?;
    info!("coordinator: handoff complete, advertising resumed");
    Ok(())
}

async fn run_security_watchdog(adapter_control: &dyn AdapterControl) {
    if let Err(e) = adapter_control.set_pairable(false).await {
        warn!("coordinator: security watchdog set_pairable failed: {}", e);
    }
    if let Err(e) = adapter_control.set_discoverable(true).await {
        warn!("coordinator: security watchdog set_discoverable failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::fake::FakeAdapterControl;
    use crate::adapter::ActiveConnection;

    #[test]
    fn edge_detection_matches_spec_table() {
        assert_eq!(detect_edge(false, true), Edge::Connect);
        assert_eq!(detect_edge(true, false), Edge::Disconnect);
        assert_eq!(detect_edge(false, false), Edge::None);
        assert_eq!(detect_edge(true, true), Edge::None);
    }

    #[test]
    fn only_peripheral_role_counts() {
        assert!(counts_as_peripheral_link(ConnectionRole::Peripheral));
        assert!(!counts_as_peripheral_link(ConnectionRole::Central));
        assert!(!counts_as_peripheral_link(ConnectionRole::Unknown));
    }

    #[tokio::test]
    async fn s5_handoff_sequences_advertising_disconnect_then_resume() {
        let fake = Arc::new(FakeAdapterControl::new());
        fake.push_connection(ActiveConnection {
            address: "AA:BB:CC".into(),
            handle: 42,
            role: ConnectionRole::Peripheral,
        })
        .await;
        let shared = Arc::new(Shared::new());

        let shared_task = shared.clone();
        let handoff = tokio::spawn({
            let fake = fake.clone();
            async move {
                perform_handoff(
                    &shared_task,
                    &*fake,
                    &[ActiveConnection {
                        address: "AA:BB:CC".into(),
                        handle: 42,
                        role: ConnectionRole::Peripheral,
                    }],
                )
                .await
            }
        });

        // Simulate the central task completing its connect shortly after.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shared.session.lock().await.central_connected = true;

        handoff.await.unwrap().unwrap();

        let calls = fake.calls_snapshot().await;
        use crate::adapter::fake::Call;
        assert!(matches!(calls[0], Call::Advertising(false)));
        assert!(matches!(calls[1], Call::Disconnect(42)));
        assert!(matches!(calls.last().unwrap(), Call::Advertising(true)));
        assert!(!shared.session.lock().await.pause_coordinator);
    }

    #[tokio::test]
    async fn poll_accepts_peripheral_normally_when_central_already_linked() {
        let fake = Arc::new(FakeAdapterControl::new());
        fake.push_connection(ActiveConnection {
            address: "AA:BB:CC".into(),
            handle: 1,
            role: ConnectionRole::Peripheral,
        })
        .await;
        let shared = Arc::new(Shared::new());
        shared.session.lock().await.central_connected = true;

        let mut was_connected = false;
        poll_once(&shared, &*fake, &mut was_connected).await.unwrap();

        assert!(was_connected);
        assert!(shared.session.lock().await.peripheral_connected);
        assert!(fake.calls_snapshot().await.is_empty(), "no handoff should run");
    }

    #[tokio::test]
    async fn poll_disconnect_edge_stamps_activity_timestamp() {
        let fake = Arc::new(FakeAdapterControl::new());
        let shared = Arc::new(Shared::new());
        shared.session.lock().await.peripheral_connected = false;

        let mut was_connected = true;
        poll_once(&shared, &*fake, &mut was_connected).await.unwrap();

        assert!(!was_connected);
        let s = shared.session.lock().await;
        assert!(!s.peripheral_connected);
        assert!(s.last_peripheral_activity_at.is_some());
    }
}
