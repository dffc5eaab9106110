//! End-to-end tests for candiag
//!
//! The tests run the full stack in process:
//! - virtual CAN bus shared by the session, a traffic generator and a
//!   simulated ECU
//! - network session with listener, logger and diagnostic engine
//! - signal and diagnostic databases built from fixtures
//!
//! No hardware or vcan interface is needed:
//!
//! ```bash
//! cargo test -p candiag-tests
//! ```
//!
//! # Test Structure
//!
//! - `network_e2e_test.rs` - decoding, logging, trace loading, bus faults
//! - `diagnostics_e2e_test.rs` - UDS exchanges against the simulated ECU
//! - `property_test.rs` - decoder and segmenter properties

use std::sync::Arc;
use std::time::Duration;

use candiag_core::{
    ChannelDescriptor, DefaultFrameSourceFactory, Frame, FrameSource, NetworkConfig,
    NetworkSession, SimulatedEcu, SimulatedEcuHandle, VirtualBus, VirtualEndpoint,
};
use candiag_layers::DiagnosticDatabase;
use candiag_signals::{MessageDef, SignalDatabase, SignalDef};

/// Diagnostic description of the bench ECU
pub const ENGINE_LAYERS_YAML: &str = r#"
meta:
  name: bench
  version: "1.0"
ecus:
  - name: Engine
    description: Engine control module
    addressing: { request_id: "0x7E0", response_id: "0x7E8" }
    negative_responses:
      "0x31": DID not supported
      "0x35": security key rejected
    services:
      - name: ReadDataByIdentifier
        service_id: "0x22"
        request:
          - { name: did, type: uint16 }
        positive_response:
          - { name: did, type: uint16 }
          - { name: value, type: ascii }
        negative_response_codes: ["0x13", "0x31"]
      - name: WriteDataByIdentifier
        service_id: "0x2E"
        request:
          - { name: did, type: uint16 }
          - { name: data, type: bytes }
        positive_response:
          - { name: did, type: uint16 }
      - name: ReadDTCInformation
        service_id: "0x19"
        request:
          - { name: subfunction, type: uint8 }
          - { name: status_mask, type: uint8 }
        positive_response:
          - { name: subfunction, type: uint8 }
          - { name: availability_mask, type: uint8 }
          - { name: records, type: bytes }
      - name: ClearDiagnosticInformation
        service_id: "0x14"
        request:
          - { name: group_of_dtc, type: uint24 }
      - name: ECUReset
        service_id: "0x11"
        request:
          - { name: reset_type, type: uint8 }
        positive_response:
          - { name: reset_type, type: uint8 }
      - name: SecurityAccess
        service_id: "0x27"
        request:
          - { name: level, type: uint8 }
          - { name: key, type: bytes }
        positive_response:
          - { name: level, type: uint8 }
          - { name: seed, type: bytes }
"#;

/// Bench signal database: vehicle speed and engine data
pub fn signal_database() -> SignalDatabase {
    SignalDatabase::from_messages([
        MessageDef::new(0x100, "VehicleSpeed", 1).with_signal(
            SignalDef::new("Speed", 0, 8)
                .with_scale(0.5, 0.0)
                .with_unit("km/h"),
        ),
        MessageDef::new(0x200, "EngineData", 3)
            .with_signal(
                SignalDef::new("Rpm", 0, 16)
                    .with_scale(0.25, 0.0)
                    .with_unit("rpm"),
            )
            .with_signal(
                SignalDef::new("CoolantTemp", 16, 8)
                    .with_scale(1.0, -40.0)
                    .with_unit("degC"),
            ),
    ])
    .expect("bench signal database is valid")
}

pub fn diagnostic_database() -> DiagnosticDatabase {
    DiagnosticDatabase::from_yaml(ENGINE_LAYERS_YAML).expect("bench layers are valid")
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// One virtual network: session, traffic endpoint and optional simulated ECU
pub struct Bench {
    pub factory: Arc<DefaultFrameSourceFactory>,
    pub bus: VirtualBus,
    pub session: Arc<NetworkSession>,
    traffic: VirtualEndpoint,
    ecu: Option<SimulatedEcuHandle>,
}

impl Bench {
    /// Session on the virtual bus `name` with both databases loaded and
    /// the Engine ECU selected; not yet connected
    pub fn new(name: &str) -> Self {
        Self::with_config(name, |_| {})
    }

    pub fn with_config(name: &str, adjust: impl FnOnce(&mut NetworkConfig)) -> Self {
        let factory = Arc::new(DefaultFrameSourceFactory::new());
        let bus = factory.virtual_bus(name);
        let mut config = NetworkConfig::new("Bench", ChannelDescriptor::virtual_bus(name, 0));
        config.listener.poll_timeout_ms = 20;
        config.diagnostics.response_timeout_ms = 1000;
        adjust(&mut config);

        let session = NetworkSession::new(config, factory.clone());
        session.set_signal_database(signal_database());
        session.set_diagnostic_database(diagnostic_database());
        session
            .select_ecu("Engine")
            .expect("Engine is in the bench layers");

        Self {
            traffic: bus.endpoint(),
            factory,
            bus,
            session: Arc::new(session),
            ecu: None,
        }
    }

    /// Attach a simulated ECU; must be called within a tokio runtime
    pub fn with_ecu(mut self, ecu: SimulatedEcu) -> Self {
        self.ecu = Some(ecu.spawn(self.bus.endpoint()));
        self
    }

    /// Default simulated Engine ECU at 0x7E0/0x7E8
    pub fn engine() -> SimulatedEcu {
        SimulatedEcu::new("Engine", 0x7E0, 0x7E8)
    }

    pub async fn connect(&self) {
        self.session
            .connect_configured()
            .await
            .expect("virtual channel connects");
    }

    /// Put a frame on the bus from the traffic endpoint
    pub fn send(&self, id: u32, data: &[u8]) {
        self.traffic
            .send(&Frame::new(id, data.to_vec()))
            .expect("virtual bus accepts frames");
    }

    pub async fn teardown(self) {
        self.session.shutdown().await;
        if let Some(ecu) = self.ecu {
            ecu.shutdown().await;
        }
    }
}
