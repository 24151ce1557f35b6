//! Bus adapter: how control packets leave the hub and how the greenhouse
//! LAN's own traffic comes back in.
//!
//! UDP multicast has no delivery guarantee, so every logical command is
//! retransmitted a configurable number of times at fixed spacing; commands
//! are idempotent at the physical layer (ON means energise, OFF means
//! de-energise), so duplicates are harmless. An internal send lock keeps a
//! burst atomic — retransmissions of one command are never interleaved with
//! another command's packets.
//!
//! The receive loop is an optional corroborator only: operational-status
//! frames may flag divergence between the estimated and reported state, but
//! never rewrite the estimate.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::ccm;
use crate::config::BusConfig;
use crate::fsm::Phase;
use crate::registry::ActuatorRegistry;
use crate::state::SharedState;

const RECV_BUFFER: usize = 4096;

/// CCM type carrying the weather station's rain flag.
const RAIN_TYPE: &str = "WRainfall";

// ---------------------------------------------------------------------------
// Outgoing
// ---------------------------------------------------------------------------

/// One control packet as the core hands it to the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub ccm_type: String,
    pub value: u8,
    pub priority: u8,
    pub room: u8,
    pub region: u8,
    pub order: u8,
}

#[async_trait]
pub trait CcmBus: Send + Sync {
    /// Emit one logical command; the adapter owns retransmission.
    async fn send(&self, frame: ControlFrame) -> Result<()>;
}

pub struct UdpCcmBus {
    socket: UdpSocket,
    target: SocketAddr,
    local_ip: String,
    repeat: u32,
    spacing: Duration,
    send_lock: tokio::sync::Mutex<()>,
}

impl UdpCcmBus {
    pub async fn open(cfg: &BusConfig) -> Result<Self> {
        let target: SocketAddr = format!("{}:{}", cfg.multicast_addr, cfg.port)
            .parse()
            .with_context(|| format!("bad bus address {}:{}", cfg.multicast_addr, cfg.port))?;

        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .context("failed to bind control send socket")?;
        socket.set_multicast_ttl_v4(1).ok();

        Ok(Self {
            socket,
            target,
            local_ip: detect_local_ip(target),
            repeat: cfg.repeat,
            spacing: Duration::from_millis(cfg.repeat_spacing_ms),
            send_lock: tokio::sync::Mutex::new(()),
        })
    }
}

#[async_trait]
impl CcmBus for UdpCcmBus {
    async fn send(&self, frame: ControlFrame) -> Result<()> {
        let xml = ccm::build_control_xml(
            &frame.ccm_type,
            frame.value,
            frame.room,
            frame.region,
            frame.order,
            frame.priority,
            &self.local_ip,
        );

        let _burst = self.send_lock.lock().await;
        for i in 0..self.repeat {
            self.socket
                .send_to(xml.as_bytes(), self.target)
                .await
                .with_context(|| format!("bus send failed for {}", frame.ccm_type))?;
            if i + 1 < self.repeat {
                tokio::time::sleep(self.spacing).await;
            }
        }
        Ok(())
    }
}

/// Find the address the OS would source multicast from; purely cosmetic
/// (it goes into the packet's `<IP>` element).
fn detect_local_ip(target: SocketAddr) -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect(target)?;
            s.local_addr()
        })
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "0.0.0.0".to_string())
}

// ---------------------------------------------------------------------------
// Incoming
// ---------------------------------------------------------------------------

/// Join the multicast group and fold incoming frames into the hub:
/// `WRainfall` drives the rain interlock, operational-status frames for
/// known actuators are checked against the estimated state.
pub async fn run_receiver(
    cfg: &BusConfig,
    registry: Arc<ActuatorRegistry>,
    shared: SharedState,
    rain_tx: watch::Sender<bool>,
) -> Result<()> {
    let group: Ipv4Addr = cfg
        .multicast_addr
        .parse()
        .with_context(|| format!("bad multicast group {}", cfg.multicast_addr))?;
    let socket = UdpSocket::bind(("0.0.0.0", cfg.port))
        .await
        .with_context(|| format!("failed to bind receive port {}", cfg.port))?;
    socket
        .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
        .with_context(|| format!("failed to join multicast group {group}"))?;

    info!(group = %group, port = cfg.port, "bus receiver listening");

    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("bus receive error: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let payload = String::from_utf8_lossy(&buf[..len]);
        for frame in ccm::parse_ccm_xml(&payload) {
            handle_frame(&frame, addr.ip().to_string(), &registry, &shared, &rain_tx).await;
        }
    }
}

async fn handle_frame(
    frame: &ccm::CcmFrame,
    source: String,
    registry: &ActuatorRegistry,
    shared: &SharedState,
    rain_tx: &watch::Sender<bool>,
) {
    // Weather station rain flag.
    if frame.ccm_type == RAIN_TYPE {
        let raining = frame.value >= 1.0;
        rain_tx.send_replace(raining);
        shared.write().await.set_rain(raining);
        return;
    }

    // Control frames (ours included — we hear our own multicast) are not
    // operational status.
    if ccm::is_control_type(&frame.ccm_type) {
        return;
    }

    // Operational-status corroboration for known actuators in our room.
    let same_room = registry
        .describe(&frame.ccm_type)
        .is_some_and(|d| d.room == frame.room);
    if same_room && frame.level == "A" {
        let reported_on = frame.value >= 0.5;
        let expected_on = {
            let st = shared.read().await;
            st.actuators
                .get(&frame.ccm_type)
                .map(|a| matches!(a.phase, Phase::Moving | Phase::Calibrating))
        };
        if let Some(expected_on) = expected_on {
            if reported_on != expected_on {
                warn!(
                    actuator = %frame.ccm_type,
                    raw_type = %frame.raw_type,
                    reported = frame.value,
                    priority = frame.priority,
                    expected_on,
                    source = %source,
                    "operational status diverges from estimate"
                );
                let mut st = shared.write().await;
                st.record_bus(format!(
                    "{}: node reports {} while hub expects {} (from {source})",
                    frame.ccm_type,
                    if reported_on { "ON" } else { "OFF" },
                    if expected_on { "ON" } else { "OFF" },
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

/// Records frames instead of sending them; the test double used anywhere a
/// real multicast socket would be unwelcome.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MockBus {
    sent: Arc<std::sync::Mutex<Vec<SentFrame>>>,
    fail_sends: Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub frame: ControlFrame,
    pub at: tokio::time::Instant,
}

#[cfg(test)]
impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        self.sent.lock().expect("mock bus poisoned").clone()
    }

    /// (type, value) pairs in send order, for terse assertions.
    pub fn sent_values(&self) -> Vec<(String, u8)> {
        self.sent()
            .into_iter()
            .map(|s| (s.frame.ccm_type, s.frame.value))
            .collect()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_sends
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl CcmBus for MockBus {
    async fn send(&self, frame: ControlFrame) -> Result<()> {
        if self.fail_sends.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("mock bus failure");
        }
        self.sent.lock().expect("mock bus poisoned").push(SentFrame {
            frame,
            at: tokio::time::Instant::now(),
        });
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccm::SuffixMap;

    fn frame(ccm_type: &str, value: u8, priority: u8) -> ControlFrame {
        ControlFrame {
            ccm_type: ccm_type.into(),
            value,
            priority,
            room: 1,
            region: 1,
            order: 1,
        }
    }

    // -- MockBus -------------------------------------------------------------

    #[tokio::test]
    async fn mock_bus_records_in_order() {
        let bus = MockBus::new();
        bus.send(frame("IrrircM", 1, 10)).await.unwrap();
        bus.send(frame("IrrircM", 0, 10)).await.unwrap();

        assert_eq!(
            bus.sent_values(),
            vec![("IrrircM".to_string(), 1), ("IrrircM".to_string(), 0)]
        );
    }

    #[tokio::test]
    async fn mock_bus_can_fail() {
        let bus = MockBus::new();
        bus.set_failing(true);
        assert!(bus.send(frame("IrrircM", 1, 10)).await.is_err());
        bus.set_failing(false);
        assert!(bus.send(frame("IrrircM", 1, 10)).await.is_ok());
        assert_eq!(bus.sent().len(), 1);
    }

    // -- UdpCcmBus -----------------------------------------------------------

    /// Point the adapter at a local listener instead of the multicast group
    /// and count what arrives.
    #[tokio::test]
    async fn udp_bus_retransmits_each_command() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let cfg = BusConfig {
            multicast_addr: "127.0.0.1".to_string(),
            port: addr.port(),
            repeat: 3,
            repeat_spacing_ms: 1,
            suffix: SuffixMap::default(),
        };
        let bus = UdpCcmBus::open(&cfg).await.unwrap();
        bus.send(frame("VenSdWinrcM", 1, 10)).await.unwrap();

        let mut buf = [0u8; 4096];
        for _ in 0..3 {
            let (len, _) = tokio::time::timeout(
                Duration::from_secs(2),
                listener.recv_from(&mut buf),
            )
            .await
            .expect("expected a retransmission")
            .unwrap();
            let text = String::from_utf8_lossy(&buf[..len]).to_string();
            assert!(text.contains("type=\"VenSdWinrcM\""));
            assert!(text.contains(">1</DATA>"));
        }
    }
}
