//! Diagnostic session engine
//!
//! Runs one request/response exchange against an ECU layer:
//!
//! ```text
//! Idle -> AddressResolved -> Encoding -> Sent -> AwaitingResponse -> Decoded -> Completed
//!                                                                            \-> Failed
//! ```
//!
//! Only one exchange runs at a time; a concurrent call is rejected with
//! [`DiagnosticError::Busy`]. Requests are never retried. A response-pending
//! answer (NRC 0x78) extends the wait up to the configured pending limit.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use candiag_layers::{decode_response, encode_request, EcuLayer, NegativeResponseCode};

use crate::config::DiagnosticsConfig;
use crate::error::{ConfigurationError, DiagnosticError};
use crate::isotp::IsoTpChannel;
use crate::router::BusAccess;
use crate::uds::{service_id, DiagnosticRequest};

/// Progress of the current (or last) exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    AddressResolved,
    Encoding,
    Sent,
    AwaitingResponse,
    Decoded,
    Completed,
    Failed,
}

/// Classification of a finished exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Positive,
    Negative,
    TransportFailure,
}

/// Result of one diagnostic exchange
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticResult {
    pub ecu: String,
    pub service: String,
    pub outcome: Outcome,
    /// Decoded positive-response parameters
    pub values: Map<String, Value>,
    pub nrc: Option<u8>,
    pub nrc_text: Option<String>,
    #[serde(serialize_with = "hex_bytes")]
    pub request: Vec<u8>,
    #[serde(serialize_with = "hex_bytes")]
    pub response: Vec<u8>,
    /// Failure cause for transport failures
    pub error: Option<String>,
}

fn hex_bytes<S: serde::Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode_upper(data))
}

impl DiagnosticResult {
    fn new(ecu: &str, service: &str, outcome: Outcome, request: Vec<u8>) -> Self {
        Self {
            ecu: ecu.to_string(),
            service: service.to_string(),
            outcome,
            values: Map::new(),
            nrc: None,
            nrc_text: None,
            request,
            response: Vec::new(),
            error: None,
        }
    }

    /// Describe a failed exchange for presentation
    pub fn from_error(ecu: &str, request: &DiagnosticRequest, error: &DiagnosticError) -> Self {
        let mut result = Self::new(ecu, request.service_name(), Outcome::TransportFailure, Vec::new());
        result.error = Some(error.to_string());
        result
    }

    pub fn is_positive(&self) -> bool {
        self.outcome == Outcome::Positive
    }

    /// One-line description
    pub fn summary(&self) -> String {
        match self.outcome {
            Outcome::Positive => format!(
                "{} {}: positive ({} values)",
                self.ecu,
                self.service,
                self.values.len()
            ),
            Outcome::Negative => format!(
                "{} {}: NRC 0x{:02X} {}",
                self.ecu,
                self.service,
                self.nrc.unwrap_or_default(),
                self.nrc_text.as_deref().unwrap_or("")
            ),
            Outcome::TransportFailure => format!(
                "{} {}: {}",
                self.ecu,
                self.service,
                self.error.as_deref().unwrap_or("transport failure")
            ),
        }
    }

    /// Turn a negative outcome into [`DiagnosticError::NegativeResponse`]
    pub fn into_positive(self) -> Result<Self, DiagnosticError> {
        match self.outcome {
            Outcome::Positive => Ok(self),
            _ => Err(DiagnosticError::NegativeResponse(Box::new(self))),
        }
    }
}

/// Clears the in-flight flag when an exchange ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs diagnostic exchanges for one session
pub struct DiagnosticEngine {
    config: DiagnosticsConfig,
    in_flight: AtomicBool,
    state: Mutex<EngineState>,
}

impl DiagnosticEngine {
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self {
            config,
            in_flight: AtomicBool::new(false),
            state: Mutex::new(EngineState::Idle),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock() = state;
    }

    /// Run one request against `layer`
    ///
    /// Negative responses are returned as results with [`Outcome::Negative`];
    /// use [`DiagnosticResult::into_positive`] to treat them as errors.
    pub async fn execute(
        &self,
        bus: &BusAccess,
        layer: &EcuLayer,
        request: &DiagnosticRequest,
    ) -> Result<DiagnosticResult, DiagnosticError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(ecu = %layer.name, "Rejecting concurrent diagnostic request");
            return Err(DiagnosticError::Busy);
        }
        let _in_flight = InFlight(&self.in_flight);
        self.set_state(EngineState::Idle);

        let result = self.run(bus, layer, request).await;
        match &result {
            Ok(res) => {
                self.set_state(EngineState::Completed);
                info!(ecu = %layer.name, service = %res.service, outcome = ?res.outcome, "Diagnostic exchange completed");
            }
            Err(e) => {
                self.set_state(EngineState::Failed);
                warn!(ecu = %layer.name, service = request.service_name(), error = %e, "Diagnostic exchange failed");
            }
        }
        result
    }

    async fn run(
        &self,
        bus: &BusAccess,
        layer: &EcuLayer,
        request: &DiagnosticRequest,
    ) -> Result<DiagnosticResult, DiagnosticError> {
        let addressing = layer
            .addressing
            .as_ref()
            .ok_or_else(|| ConfigurationError::MissingAddressing(layer.name.clone()))?;
        self.set_state(EngineState::AddressResolved);

        self.set_state(EngineState::Encoding);
        let service = layer
            .service(request.service_name(), request.service_id())
            .ok_or_else(|| {
                DiagnosticError::EncodeFailure(format!(
                    "ECU {} has no {} service",
                    layer.name,
                    request.service_name()
                ))
            })?;
        let payload = encode_request(service, &request.param_values())
            .map_err(|e| DiagnosticError::EncodeFailure(e.to_string()))?;
        debug!(
            ecu = %layer.name,
            service = %service.name,
            tx_id = format!("0x{:X}", addressing.request_id),
            rx_id = format!("0x{:X}", addressing.response_id),
            request = %hex::encode_upper(&payload),
            "Encoded diagnostic request"
        );

        let channel = IsoTpChannel::new(
            self.config.isotp.clone(),
            addressing.request_id,
            addressing.response_id,
            addressing.is_extended(),
        );
        let mut link = bus.link(addressing.response_id)?;
        channel.send(link.as_mut(), &payload).await?;
        self.set_state(EngineState::Sent);

        self.set_state(EngineState::AwaitingResponse);
        let mut deadline = Instant::now() + self.config.response_timeout();
        let mut pending_limit: Option<Instant> = None;
        let response = loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let Some(response) = channel.recv(link.as_mut(), wait).await? else {
                let waited = match pending_limit {
                    Some(_) => self.config.response_pending_timeout_ms,
                    None => self.config.response_timeout_ms,
                };
                return Err(DiagnosticError::Timeout(waited));
            };

            if is_response_pending(&response, service.service_id) {
                deadline = *pending_limit
                    .get_or_insert_with(|| Instant::now() + self.config.response_pending_timeout());
                debug!(ecu = %layer.name, "Response pending");
                continue;
            }
            if let [service_id::NEGATIVE_RESPONSE, echoed, ..] = response.as_slice() {
                if *echoed != service.service_id {
                    debug!(
                        ecu = %layer.name,
                        response = %hex::encode_upper(&response),
                        "Ignoring negative response for another service"
                    );
                    continue;
                }
            }
            break response;
        };

        let mut result = DiagnosticResult::new(&layer.name, &service.name, Outcome::Positive, payload);
        result.response = response.clone();

        match response.first().copied() {
            Some(service_id::NEGATIVE_RESPONSE) => {
                let code = *response.get(2).ok_or_else(|| {
                    DiagnosticError::InvalidResponse(format!(
                        "truncated negative response {}",
                        hex::encode_upper(&response)
                    ))
                })?;
                if !service.negative_response_codes.is_empty()
                    && !service.negative_response_codes.contains(&code)
                {
                    debug!(service = %service.name, nrc = format!("0x{:02X}", code), "NRC not declared for service");
                }
                result.outcome = Outcome::Negative;
                result.nrc = Some(code);
                result.nrc_text = Some(layer.nrc_text(code));
            }
            Some(sid) if sid == service.positive_response_id() => {
                result.values = decode_response(service, &response[1..])?;
                self.set_state(EngineState::Decoded);
            }
            _ => {
                return Err(DiagnosticError::InvalidResponse(format!(
                    "unexpected response {} to {}",
                    hex::encode_upper(&response),
                    service.name
                )))
            }
        }
        Ok(result)
    }
}

fn is_response_pending(response: &[u8], sid: u8) -> bool {
    matches!(response, [service_id::NEGATIVE_RESPONSE, s, code, ..]
        if *s == sid && NegativeResponseCode::from(*code).is_response_pending())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsoTpConfig;
    use crate::frame::Frame;
    use crate::transport::{FrameSource, VirtualBus, VirtualEndpoint};
    use candiag_layers::{ParamDef, ParamType, ServiceDef};
    use std::sync::Arc;
    use std::time::Duration;

    fn vin_layer() -> EcuLayer {
        EcuLayer::new("Engine")
            .with_addressing(0x7E0, 0x7E8)
            .with_service(
                ServiceDef::new("ReadDataByIdentifier", 0x22)
                    .with_request(ParamDef::new("did", ParamType::Uint16))
                    .with_response(ParamDef::new("did", ParamType::Uint16))
                    .with_response(ParamDef::new("value", ParamType::Ascii)),
            )
    }

    /// Answer every request on `ecu` with the given single-frame payloads
    fn respond(ecu: VirtualEndpoint, answers: Vec<Vec<u8>>, delay: Duration) {
        std::thread::spawn(move || {
            let Ok(Some(_request)) = ecu.recv(Duration::from_secs(2)) else {
                return;
            };
            for answer in answers {
                std::thread::sleep(delay);
                let mut data = vec![answer.len() as u8];
                data.extend_from_slice(&answer);
                data.resize(8, 0xCC);
                let _ = ecu.send(&Frame::new(0x7E8, data));
            }
            std::thread::sleep(Duration::from_millis(200));
        });
    }

    fn engine(timeout_ms: u64) -> DiagnosticEngine {
        DiagnosticEngine::new(DiagnosticsConfig {
            response_timeout_ms: timeout_ms,
            response_pending_timeout_ms: 2_000,
            isotp: IsoTpConfig::default(),
        })
    }

    #[tokio::test]
    async fn test_positive_read() {
        let bus = VirtualBus::new("engine");
        respond(bus.endpoint(), vec![vec![0x62, 0xF1, 0x90, b'1', b'2', b'3']], Duration::ZERO);
        let access = BusAccess::Direct(Arc::new(bus.endpoint()));

        let engine = engine(1000);
        let result = engine
            .execute(&access, &vin_layer(), &DiagnosticRequest::ReadDataByIdentifier { did: 0xF190 })
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::Positive);
        assert_eq!(result.request, vec![0x22, 0xF1, 0x90]);
        assert_eq!(result.values["value"], Value::from("123"));
        assert_eq!(engine.state(), EngineState::Completed);
        assert!(!engine.is_busy());
    }

    #[tokio::test]
    async fn test_negative_response_uses_standard_name() {
        let bus = VirtualBus::new("engine");
        respond(bus.endpoint(), vec![vec![0x7F, 0x22, 0x31]], Duration::ZERO);
        let access = BusAccess::Direct(Arc::new(bus.endpoint()));

        let result = engine(1000)
            .execute(&access, &vin_layer(), &DiagnosticRequest::ReadDataByIdentifier { did: 0xF190 })
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::Negative);
        assert_eq!(result.nrc, Some(0x31));
        assert_eq!(result.nrc_text.as_deref(), Some("requestOutOfRange"));
        assert!(matches!(
            result.into_positive(),
            Err(DiagnosticError::NegativeResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_negative_response_for_other_service_is_skipped() {
        let bus = VirtualBus::new("engine");
        respond(
            bus.endpoint(),
            vec![vec![0x7F, 0x2E, 0x22], vec![0x7F, 0x22, 0x31]],
            Duration::ZERO,
        );
        let access = BusAccess::Direct(Arc::new(bus.endpoint()));

        let result = engine(1000)
            .execute(&access, &vin_layer(), &DiagnosticRequest::ReadDataByIdentifier { did: 0xF190 })
            .await
            .unwrap();
        assert_eq!(result.nrc, Some(0x31));
        assert_eq!(result.response, vec![0x7F, 0x22, 0x31]);

        let bus = VirtualBus::new("engine");
        respond(bus.endpoint(), vec![vec![0x7F, 0x2E, 0x22]], Duration::ZERO);
        let access = BusAccess::Direct(Arc::new(bus.endpoint()));
        let err = engine(150)
            .execute(&access, &vin_layer(), &DiagnosticRequest::ReadDataByIdentifier { did: 0xF190 })
            .await
            .unwrap_err();
        assert!(matches!(err, DiagnosticError::Timeout(150)));
    }

    #[tokio::test]
    async fn test_response_pending_then_positive() {
        let bus = VirtualBus::new("engine");
        respond(
            bus.endpoint(),
            vec![
                vec![0x7F, 0x22, 0x78],
                vec![0x62, 0xF1, 0x90, b'4', b'5', b'6'],
            ],
            Duration::from_millis(150),
        );
        let access = BusAccess::Direct(Arc::new(bus.endpoint()));

        // The positive answer arrives after the plain response timeout
        let result = engine(200)
            .execute(&access, &vin_layer(), &DiagnosticRequest::ReadDataByIdentifier { did: 0xF190 })
            .await
            .unwrap();
        assert_eq!(result.values["value"], Value::from("456"));
    }

    #[tokio::test]
    async fn test_missing_addressing_sends_nothing() {
        let bus = VirtualBus::new("engine");
        let observer = bus.endpoint();
        let access = BusAccess::Direct(Arc::new(bus.endpoint()));
        let mut layer = vin_layer();
        layer.addressing = None;

        let err = engine(100)
            .execute(&access, &layer, &DiagnosticRequest::ReadDataByIdentifier { did: 0xF190 })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DiagnosticError::Configuration(ConfigurationError::MissingAddressing(_))
        ));
        assert_eq!(observer.pending(), 0);
    }

    #[tokio::test]
    async fn test_encode_failure_sends_nothing() {
        let bus = VirtualBus::new("engine");
        let observer = bus.endpoint();
        let access = BusAccess::Direct(Arc::new(bus.endpoint()));

        let err = engine(100)
            .execute(
                &access,
                &vin_layer(),
                &DiagnosticRequest::EcuReset { reset_type: 1 },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DiagnosticError::EncodeFailure(_)));
        assert_eq!(observer.pending(), 0);
    }

    #[tokio::test]
    async fn test_timeout() {
        let bus = VirtualBus::new("engine");
        let _silent = bus.endpoint();
        let access = BusAccess::Direct(Arc::new(bus.endpoint()));
        let engine = engine(50);
        let err = engine
            .execute(&access, &vin_layer(), &DiagnosticRequest::ReadDataByIdentifier { did: 0xF190 })
            .await
            .unwrap_err();
        assert!(matches!(err, DiagnosticError::Timeout(50)));
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[tokio::test]
    async fn test_concurrent_call_is_busy() {
        let bus = VirtualBus::new("engine");
        respond(
            bus.endpoint(),
            vec![vec![0x62, 0xF1, 0x90, b'1', b'2', b'3']],
            Duration::from_millis(150),
        );
        let access = BusAccess::Direct(Arc::new(bus.endpoint()));
        let engine = Arc::new(engine(1000));
        let layer = vin_layer();
        let request = DiagnosticRequest::ReadDataByIdentifier { did: 0xF190 };

        let first = {
            let (engine, access, layer, request) =
                (engine.clone(), access.clone(), layer.clone(), request.clone());
            tokio::spawn(async move { engine.execute(&access, &layer, &request).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(
            engine.execute(&access, &layer, &request).await,
            Err(DiagnosticError::Busy)
        ));

        let result = first.await.unwrap().unwrap();
        assert!(result.is_positive());
    }
}
