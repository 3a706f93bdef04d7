//! Adapter Control port: the narrow set of adapter-policy calls the
//! coordinator needs (active-connection listing, handle-level disconnect,
//! advertising/pairable/discoverable toggles), behind a trait so the
//! coordinator is testable against a fake instead of real BlueZ.
//!
//! Grounded on the same narrowing principle the teacher applies to the BLE
//! library itself: `ftms_service::run` and `scanner::run` take a `bluer::Adapter`
//! and never leak BlueZ types past their module boundary. Here that
//! boundary is pulled one level up, to just the handful of adapter-policy
//! calls the coordinator (not the whole GATT session) needs.

use async_trait::async_trait;
use tokio::sync::Mutex;

/// The GATT role BlueZ reports for an active connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Central,
    Peripheral,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveConnection {
    pub address: String,
    pub handle: u16,
    pub role: ConnectionRole,
}

/// Classify a connected address as the bridge's own outbound (central)
/// link, if it matches the currently-known treadmill address, or else an
/// inbound FTMS peripheral link. Pure so the role heuristic behind
/// coordinator's handoff edge-detection (§4.5) is unit-testable without a
/// real adapter.
pub fn classify_role(address: &str, known_central_address: Option<&str>) -> ConnectionRole {
    match known_central_address {
        Some(central) if central == address => ConnectionRole::Central,
        _ => ConnectionRole::Peripheral,
    }
}

/// Platform-specific adapter policy port. Implementations may be no-ops on
/// platforms where the local BLE stack already owns these policies (see
/// spec's "platform-Pi mode" switch).
#[async_trait]
pub trait AdapterControl: Send + Sync {
    async fn list_active_connections(&self) -> bluer::Result<Vec<ActiveConnection>>;
    async fn disconnect_handle(&self, handle: u16) -> bluer::Result<()>;
    async fn set_advertising(&self, on: bool) -> bluer::Result<()>;
    async fn set_pairable(&self, pairable: bool) -> bluer::Result<()>;
    async fn set_discoverable(&self, discoverable: bool) -> bluer::Result<()>;

    /// Record the address of the bridge's own outbound (central) link, if
    /// any, so `list_active_connections` can tell it apart from an inbound
    /// FTMS peripheral connection via `classify_role`. Default no-op; only
    /// `BluerAdapterControl` needs to track this.
    async fn note_central_address(&self, _address: Option<String>) {}
}

/// BlueZ-backed implementation, used when the "platform-Pi mode" CLI switch
/// is enabled. Advertising is toggled by registering/unregistering the
/// peripheral's own `bluer::adv::Advertisement` handle rather than through
/// this port; this port only covers the adapter-wide policy bits that have
/// no natural home on a GATT application.
pub struct BluerAdapterControl {
    adapter: bluer::Adapter,
    /// Address of the bridge's own outbound link, set by the central
    /// session once connected and cleared on disconnect. `None` means no
    /// central link is currently up, so every connected address observed is
    /// assumed to be an inbound FTMS peripheral.
    central_address: Mutex<Option<String>>,
}

impl BluerAdapterControl {
    pub fn new(adapter: bluer::Adapter) -> Self {
        Self {
            adapter,
            central_address: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AdapterControl for BluerAdapterControl {
    async fn list_active_connections(&self) -> bluer::Result<Vec<ActiveConnection>> {
        let central_address = self.central_address.lock().await.clone();
        let mut out = Vec::new();
        for addr in self.adapter.device_addresses().await? {
            let device = self.adapter.device(addr)?;
            if !device.is_connected().await.unwrap_or(false) {
                continue;
            }
            // BlueZ doesn't expose a raw HCI handle over D-Bus; the device
            // address doubles as the "handle" this port deals in, and
            // `disconnect_handle` below resolves it back to a `Device`.
            let handle = addr.to_string().as_bytes().iter().fold(0u16, |acc, b| {
                acc.wrapping_mul(31).wrapping_add(*b as u16)
            });
            let addr_string = addr.to_string();
            let role = classify_role(&addr_string, central_address.as_deref());
            out.push(ActiveConnection {
                address: addr_string,
                handle,
                role,
            });
        }
        Ok(out)
    }

    async fn disconnect_handle(&self, handle: u16) -> bluer::Result<()> {
        for addr in self.adapter.device_addresses().await? {
            let computed = addr.to_string().as_bytes().iter().fold(0u16, |acc, b| {
                acc.wrapping_mul(31).wrapping_add(*b as u16)
            });
            if computed == handle {
                let device = self.adapter.device(addr)?;
                device.disconnect().await?;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn set_advertising(&self, _on: bool) -> bluer::Result<()> {
        // Handled by (un)registering the peripheral's own advertisement in
        // `peripheral.rs`; nothing adapter-wide to toggle here.
        Ok(())
    }

    async fn set_pairable(&self, pairable: bool) -> bluer::Result<()> {
        self.adapter.set_pairable(pairable).await
    }

    async fn set_discoverable(&self, discoverable: bool) -> bluer::Result<()> {
        self.adapter.set_discoverable(discoverable).await
    }

    async fn note_central_address(&self, address: Option<String>) {
        *self.central_address.lock().await = address;
    }
}

/// A no-op implementation for platforms where the local BLE stack already
/// owns advertising/pairable/discoverable policy (the default unless the
/// "platform-Pi mode" CLI switch is set).
pub struct NoopAdapterControl;

#[async_trait]
impl AdapterControl for NoopAdapterControl {
    async fn list_active_connections(&self) -> bluer::Result<Vec<ActiveConnection>> {
        Ok(Vec::new())
    }

    async fn disconnect_handle(&self, _handle: u16) -> bluer::Result<()> {
        Ok(())
    }

    async fn set_advertising(&self, _on: bool) -> bluer::Result<()> {
        Ok(())
    }

    async fn set_pairable(&self, _pairable: bool) -> bluer::Result<()> {
        Ok(())
    }

    async fn set_discoverable(&self, _discoverable: bool) -> bluer::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    //! A deterministic in-memory `AdapterControl` used by coordinator and
    //! central-session tests, per the design note calling for a core that
    //! is "testable against a fake".

    use super::*;

    #[derive(Debug, Clone)]
    pub enum Call {
        Disconnect(u16),
        Advertising(bool),
        Pairable(bool),
        Discoverable(bool),
    }

    #[derive(Default)]
    pub struct FakeAdapterControl {
        pub connections: Mutex<Vec<ActiveConnection>>,
        pub calls: Mutex<Vec<Call>>,
    }

    impl FakeAdapterControl {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn push_connection(&self, conn: ActiveConnection) {
            self.connections.lock().await.push(conn);
        }

        pub async fn calls_snapshot(&self) -> Vec<Call> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl AdapterControl for FakeAdapterControl {
        async fn list_active_connections(&self) -> bluer::Result<Vec<ActiveConnection>> {
            Ok(self.connections.lock().await.clone())
        }

        async fn disconnect_handle(&self, handle: u16) -> bluer::Result<()> {
            self.calls.lock().await.push(Call::Disconnect(handle));
            self.connections.lock().await.retain(|c| c.handle != handle);
            Ok(())
        }

        async fn set_advertising(&self, on: bool) -> bluer::Result<()> {
            self.calls.lock().await.push(Call::Advertising(on));
            Ok(())
        }

        async fn set_pairable(&self, pairable: bool) -> bluer::Result<()> {
            self.calls.lock().await.push(Call::Pairable(pairable));
            Ok(())
        }

        async fn set_discoverable(&self, discoverable: bool) -> bluer::Result<()> {
            self.calls.lock().await.push(Call::Discoverable(discoverable));
            Ok(())
        }
    }
}
