//! Central Session: discovers the treadmill, runs the vendor handshake,
//! drains commands, polls telemetry, and recovers from zombie/ghost links.
//!
//! Grounded on `hrm/src/scanner.rs`'s shape — `bluer::Session`/`Adapter`
//! setup, a `discover_devices()` scan loop raced against a command channel
//! with `tokio::select!`, and a notify stream consumed in the same loop —
//! generalized with a write path (handshake/poll/control frames) and the
//! zombie-link/watchdog/idle rules this teacher's read-only HR client has
//! no equivalent for.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, Address, Device};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

use crate::adapter::AdapterControl;
use crate::derived_state::DerivedStateTracker;
use crate::framer::{self, Reassembler};
use crate::state::{Shared, TargetCommand};
use crate::vendor_codec::{self, ControlKind};

// Vendor GATT characteristics: service implicit, only the two
// characteristic UUIDs matter to this bridge.
pub const VENDOR_WRITE_UUID: Uuid = Uuid::from_u128(0x0000_1534_1412_efde_1523_785f_eabc_d123);
pub const VENDOR_NOTIFY_UUID: Uuid = Uuid::from_u128(0x0000_1535_1412_efde_1523_785f_eabc_d123);

const DEFAULT_DEVICE_NAME: &str = "I_TL";
const RSSI_WARN_THRESHOLD: i16 = -80;

const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_RETRIES: u32 = 3;
const ZOMBIE_WAIT: Duration = Duration::from_millis(1500);

const TICK_INTERVAL: Duration = Duration::from_millis(200);
const MAX_COMMANDS_PER_TICK: usize = 5;
const COMMAND_SPACING: Duration = Duration::from_millis(100);
const NOTIFY_POLL_THRESHOLD: Duration = Duration::from_secs(1);
const TELEMETRY_WATCHDOG: Duration = Duration::from_secs(5);
const IDLE_DISCONNECT: Duration = Duration::from_secs(60);

const HANDSHAKE_INTRA_DELAY: Duration = Duration::from_millis(100);

/// Phase of the central session's state machine. `Disconnected` is the
/// only phase that persists across iterations of the outer loop; the rest
/// are transient within one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Scanning,
    Connecting,
    Handshaking,
    Active,
    Disconnecting,
}

/// Delay to wait after sending handshake payload number `n` (1-based)
/// before sending the next one. Payloads 7 and 8 get a longer settle time;
/// payload 9 (final) gets the longest, since the vendor link drops
/// messages sent faster than it can digest them.
pub fn handshake_pacing_after(payload_number: usize) -> Duration {
    match payload_number {
        7 | 8 => Duration::from_millis(500),
        9 => Duration::from_secs(1),
        _ => Duration::from_millis(100),
    }
}

/// Whether the configured target name matches an advertised device name.
pub fn is_target_device(advertised_name: &str, configured_name: &str) -> bool {
    advertised_name == configured_name
}

pub fn rssi_below_warning_threshold(rssi: i16) -> bool {
    rssi < RSSI_WARN_THRESHOLD
}

/// Whether the active loop should send the poll payload this tick, given
/// whether a command was already sent and how long it's been since the
/// last telemetry notification.
pub fn should_poll(command_sent_this_tick: bool, time_since_last_notify: Option<Duration>) -> bool {
    if !command_sent_this_tick {
        return true;
    }
    match time_since_last_notify {
        Some(d) => d > NOTIFY_POLL_THRESHOLD,
        None => true,
    }
}

pub fn watchdog_expired(time_since_last_notify: Duration) -> bool {
    time_since_last_notify > TELEMETRY_WATCHDOG
}

pub fn idle_timeout_expired(time_since_peripheral_disconnect: Duration) -> bool {
    time_since_peripheral_disconnect > IDLE_DISCONNECT
}

/// Run the central session against a real BlueZ adapter. Loops forever,
/// cycling `Disconnected -> Scanning -> ... -> Disconnected` until
/// cancelled.
pub async fn run(
    shared: Arc<Shared>,
    adapter_control: Arc<dyn AdapterControl>,
    device_name: String,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;
    info!("central: using adapter {}", adapter.name());

    loop {
        if shared.session.lock().await.pause_coordinator {
            tokio::time::sleep(Duration::from_millis(200)).await;
            continue;
        }

        let address = match scan_for_target(&adapter, &device_name).await {
            Some(addr) => addr,
            None => continue,
        };

        match connect_with_retries(&adapter, address, &*adapter_control).await {
            Ok(device) => {
                // Record which address is the outbound link so the
                // coordinator's adapter-policy role heuristic (§4.5) can
                // tell this connection apart from an inbound FTMS peer.
                adapter_control.note_central_address(Some(address.to_string())).await;
                shared.session.lock().await.central_connected = true;
                if let Err(e) = handshake_and_run_active(&device, &shared).await {
                    warn!("central: active session ended: {}", e);
                }
                shared.session.lock().await.central_connected = false;
                let _ = device.disconnect().await;
                adapter_control.note_central_address(None).await;
            }
            Err(e) => {
                warn!("central: connect failed, re-scanning: {}", e);
            }
        }
    }
}

async fn scan_for_target(adapter: &Adapter, device_name: &str) -> Option<Address> {
    info!("central: scanning for {}", device_name);
    let discover = adapter.discover_devices().await.ok()?;
    let mut discover = Box::pin(discover);
    let deadline = tokio::time::sleep(SCAN_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return None,
            event = discover.next() => {
                match event {
                    Some(bluer::AdapterEvent::DeviceAdded(addr)) => {
                        if let Ok(device) = adapter.device(addr) {
                            let name = device.name().await.ok().flatten().unwrap_or_default();
                            if is_target_device(&name, device_name) {
                                if let Ok(Some(rssi)) = device.rssi().await {
                                    if rssi_below_warning_threshold(rssi) {
                                        warn!("central: weak signal from {} ({} dBm)", name, rssi);
                                    }
                                }
                                return Some(addr);
                            }
                        }
                    }
                    Some(_) => {}
                    None => return None,
                }
            }
        }
    }
}

async fn connect_with_retries(
    adapter: &Adapter,
    address: Address,
    adapter_control: &dyn AdapterControl,
) -> Result<Device, Box<dyn std::error::Error + Send + Sync>> {
    let device = adapter.device(address)?;

    // Pre-connect zombie check.
    for conn in adapter_control.list_active_connections().await? {
        if conn.address == address.to_string() {
            warn!("central: evicting zombie connection for {}", address);
            adapter_control.disconnect_handle(conn.handle).await?;
            tokio::time::sleep(ZOMBIE_WAIT).await;
        }
    }

    let mut attempt = 0;
    loop {
        attempt += 1;
        match tokio::time::timeout(CONNECT_TIMEOUT, device.connect()).await {
            Ok(Ok(())) => return Ok(device),
            // Non-timeout errors are not retried in place (spec §4.3: "On
            // other errors: break and re-scan") -- the outer loop in `run`
            // goes back to Scanning on any `Err` from this function.
            Ok(Err(e)) => return Err(Box::new(e)),
            Err(_) => {
                warn!("central: connect attempt {} timed out, disconnecting stale attempt", attempt);
                let _ = device.disconnect().await;
                if attempt >= CONNECT_RETRIES {
                    return Err("connect timed out after all retries".into());
                }
            }
        }
    }
}

async fn find_characteristic(device: &Device, uuid: Uuid) -> bluer::Result<Characteristic> {
    for service in device.services().await? {
        for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == uuid {
                return Ok(characteristic);
            }
        }
    }
    Err(bluer::Error::from(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "vendor characteristic not found",
    )))
}

async fn handshake_and_run_active(
    device: &Device,
    shared: &Arc<Shared>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let write_char = find_characteristic(device, VENDOR_WRITE_UUID).await?;
    let notify_char = find_characteristic(device, VENDOR_NOTIFY_UUID).await?;
    let notify_stream = notify_char.notify().await?;
    let mut notify_stream = Box::pin(notify_stream);
    let reassembler = Arc::new(TokioMutex::new(Reassembler::new()));
    let tracker = Arc::new(TokioMutex::new(DerivedStateTracker::new()));

    info!("central: handshaking");
    for (i, payload) in vendor_codec::HANDSHAKE_PAYLOADS.iter().enumerate() {
        let frames = framer::fragment(payload);
        for frame in &frames {
            write_char.write(frame).await?;
            tokio::time::sleep(HANDSHAKE_INTRA_DELAY).await;
        }
        tokio::time::sleep(handshake_pacing_after(i + 1)).await;
    }

    info!("central: active");
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if active_tick(device, &write_char, shared).await.is_err() {
                    return Ok(());
                }
            }
            notification = notify_stream.next() => {
                match notification {
                    Some(data) => {
                        if let Some(payload) = reassembler.lock().await.feed(&data) {
                            handle_incoming_payload(&payload, shared, &tracker).await;
                        }
                    }
                    None => return Ok(()),
                }
            }
        }

        let now = Instant::now();
        let (watchdog_hit, idle_hit) = {
            let s = shared.session.lock().await;
            let watchdog = match s.last_notify_at {
                Some(t) => watchdog_expired(now.saturating_duration_since(t)),
                None => false,
            };
            let idle = !s.peripheral_connected
                && s.last_peripheral_activity_at
                    .is_some_and(|t| idle_timeout_expired(now.saturating_duration_since(t)));
            (watchdog, idle)
        };
        if watchdog_hit {
            warn!("central: telemetry watchdog expired, disconnecting");
            return Ok(());
        }
        if idle_hit {
            info!("central: idle timeout, disconnecting to save power");
            return Ok(());
        }
    }
}

async fn active_tick(
    _device: &Device,
    write_char: &Characteristic,
    shared: &Arc<Shared>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let commands = shared.drain_control(MAX_COMMANDS_PER_TICK).await;
    let mut sent_any = false;
    for cmd in &commands {
        let payload = match cmd {
            TargetCommand::SetSpeed(v) => vendor_codec::encode_control(ControlKind::Speed, *v),
            TargetCommand::SetIncline(v) => vendor_codec::encode_control(ControlKind::Incline, *v),
        };
        for frame in framer::fragment(&payload) {
            write_char.write(&frame).await?;
        }
        sent_any = true;
        tokio::time::sleep(COMMAND_SPACING).await;
    }

    let time_since_notify = {
        let s = shared.session.lock().await;
        s.last_notify_at.map(|t| Instant::now().saturating_duration_since(t))
    };

    if should_poll(sent_any, time_since_notify) {
        for frame in framer::fragment(vendor_codec::POLL_PAYLOAD) {
            write_char.write(&frame).await?;
        }
    }

    Ok(())
}

async fn handle_incoming_payload(
    payload: &[u8],
    shared: &Arc<Shared>,
    tracker: &Arc<TokioMutex<DerivedStateTracker>>,
) {
    let Some(sample) = vendor_codec::decode_telemetry(payload) else {
        debug!("central: dropping undecodable payload of len {}", payload.len());
        return;
    };

    let now = Instant::now();
    let derived = tracker.lock().await.update(sample, now);

    let mut s = shared.session.lock().await;
    s.derived = derived;
    s.last_notify_at = Some(now);
    drop(s);
    shared.telemetry_notify.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacing_matches_scenario_s3() {
        assert_eq!(handshake_pacing_after(6), Duration::from_millis(100));
        assert_eq!(handshake_pacing_after(7), Duration::from_millis(500));
        assert_eq!(handshake_pacing_after(8), Duration::from_millis(500));
        assert_eq!(handshake_pacing_after(9), Duration::from_secs(1));
    }

    #[test]
    fn target_device_match_is_exact() {
        assert!(is_target_device("I_TL", "I_TL"));
        assert!(!is_target_device("I_TL_2", "I_TL"));
        assert!(!is_target_device("other", "I_TL"));
    }

    #[test]
    fn rssi_threshold_matches_spec() {
        assert!(rssi_below_warning_threshold(-81));
        assert!(!rssi_below_warning_threshold(-80));
        assert!(!rssi_below_warning_threshold(-50));
    }

    #[test]
    fn should_poll_when_nothing_sent() {
        assert!(should_poll(false, None));
        assert!(should_poll(false, Some(Duration::from_millis(10))));
    }

    #[test]
    fn should_poll_when_notify_gap_exceeds_threshold() {
        assert!(should_poll(true, Some(Duration::from_millis(1001))));
        assert!(!should_poll(true, Some(Duration::from_millis(500))));
    }

    #[test]
    fn should_poll_when_never_notified() {
        assert!(should_poll(true, None));
    }

    #[test]
    fn watchdog_matches_five_second_rule() {
        assert!(!watchdog_expired(Duration::from_millis(4999)));
        assert!(watchdog_expired(Duration::from_millis(5001)));
    }

    #[test]
    fn idle_matches_sixty_second_rule() {
        assert!(!idle_timeout_expired(Duration::from_secs(59)));
        assert!(idle_timeout_expired(Duration::from_secs(61)));
    }

    #[test]
    fn vendor_uuids_are_distinct() {
        assert_ne!(VENDOR_WRITE_UUID, VENDOR_NOTIFY_UUID);
    }
}
