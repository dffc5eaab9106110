//! Simulated ECU for benches and tests
//!
//! Answers UDS requests arriving over ISO-TP on a virtual bus endpoint.
//! Ships with a small set of identification DIDs and stored DTCs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::IsoTpConfig;
use crate::error::{ProtocolError, TransportError};
use crate::isotp::IsoTpChannel;
use crate::router::BusAccess;
use crate::transport::VirtualEndpoint;
use crate::uds::{service_id, POSITIVE_RESPONSE_OFFSET};

const NRC_SERVICE_NOT_SUPPORTED: u8 = 0x11;
const NRC_SUBFUNCTION_NOT_SUPPORTED: u8 = 0x12;
const NRC_INCORRECT_LENGTH: u8 = 0x13;
const NRC_REQUEST_OUT_OF_RANGE: u8 = 0x31;
const NRC_INVALID_KEY: u8 = 0x35;
const NRC_RESPONSE_PENDING: u8 = 0x78;

/// Request/response behaviour of a simulated ECU
#[derive(Debug, Clone)]
pub struct SimulatedEcu {
    name: String,
    request_id: u32,
    response_id: u32,
    isotp: IsoTpConfig,
    dids: HashMap<u16, Vec<u8>>,
    dtcs: BTreeMap<u32, u8>,
    pending_responses: u32,
    pending_delay: Duration,
    seed: [u8; 4],
    unlocked: Option<u8>,
}

impl SimulatedEcu {
    pub fn new(name: impl Into<String>, request_id: u32, response_id: u32) -> Self {
        let mut dids = HashMap::new();
        dids.insert(0xF190, b"1HGCM82633A123456".to_vec());
        dids.insert(0xF191, b"HW-12345".to_vec());
        dids.insert(0xF195, b"SW-1.0.0".to_vec());
        dids.insert(0xF40C, vec![0x0B, 0xB8]);
        dids.insert(0xF405, vec![0x5A]);

        let mut dtcs = BTreeMap::new();
        dtcs.insert(0x012345, 0x09);
        dtcs.insert(0x067890, 0x28);

        Self {
            name: name.into(),
            request_id,
            response_id,
            isotp: IsoTpConfig::default(),
            dids,
            dtcs,
            pending_responses: 0,
            pending_delay: Duration::from_millis(50),
            seed: [0x12, 0x34, 0x56, 0x78],
            unlocked: None,
        }
    }

    pub fn with_did(mut self, did: u16, data: impl Into<Vec<u8>>) -> Self {
        self.dids.insert(did, data.into());
        self
    }

    pub fn with_dtc(mut self, dtc: u32, status: u8) -> Self {
        self.dtcs.insert(dtc & 0xFF_FFFF, status);
        self
    }

    /// Answer "response pending" `count` times before each final response
    pub fn with_response_pending(mut self, count: u32, delay: Duration) -> Self {
        self.pending_responses = count;
        self.pending_delay = delay;
        self
    }

    pub fn with_isotp(mut self, config: IsoTpConfig) -> Self {
        self.isotp = config;
        self
    }

    /// Key accepted for the current seed
    pub fn expected_key(&self) -> Vec<u8> {
        self.seed.iter().map(|b| !b).collect()
    }

    /// Final response to one request
    pub fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        let Some(&sid) = request.first() else {
            return Vec::new();
        };
        let args = &request[1..];
        let result = match sid {
            service_id::READ_DATA_BY_ID => self.read_did(args),
            service_id::WRITE_DATA_BY_ID => self.write_did(args),
            service_id::READ_DTC_INFO => self.read_dtcs(args),
            service_id::CLEAR_DIAGNOSTIC_INFO => self.clear_dtcs(args),
            service_id::ECU_RESET => match args {
                [reset_type] => {
                    self.unlocked = None;
                    Ok(vec![*reset_type])
                }
                _ => Err(NRC_INCORRECT_LENGTH),
            },
            service_id::SECURITY_ACCESS => self.security_access(args),
            _ => Err(NRC_SERVICE_NOT_SUPPORTED),
        };

        match result {
            Ok(payload) => {
                let mut response = vec![sid + POSITIVE_RESPONSE_OFFSET];
                response.extend_from_slice(&payload);
                response
            }
            Err(nrc) => vec![service_id::NEGATIVE_RESPONSE, sid, nrc],
        }
    }

    fn read_did(&self, args: &[u8]) -> Result<Vec<u8>, u8> {
        let [hi, lo] = args else {
            return Err(NRC_INCORRECT_LENGTH);
        };
        let did = u16::from_be_bytes([*hi, *lo]);
        let data = self.dids.get(&did).ok_or(NRC_REQUEST_OUT_OF_RANGE)?;
        let mut payload = vec![*hi, *lo];
        payload.extend_from_slice(data);
        Ok(payload)
    }

    fn write_did(&mut self, args: &[u8]) -> Result<Vec<u8>, u8> {
        if args.len() < 3 {
            return Err(NRC_INCORRECT_LENGTH);
        }
        let did = u16::from_be_bytes([args[0], args[1]]);
        if !self.dids.contains_key(&did) {
            return Err(NRC_REQUEST_OUT_OF_RANGE);
        }
        self.dids.insert(did, args[2..].to_vec());
        Ok(args[..2].to_vec())
    }

    fn read_dtcs(&self, args: &[u8]) -> Result<Vec<u8>, u8> {
        let (&subfunction, rest) = args.split_first().ok_or(NRC_INCORRECT_LENGTH)?;
        let mask = rest.first().copied().unwrap_or(0xFF);
        let matching = self.dtcs.iter().filter(|(_, status)| *status & mask != 0);
        match subfunction {
            0x01 => {
                let count = matching.count() as u16;
                let [hi, lo] = count.to_be_bytes();
                Ok(vec![0x01, 0xFF, 0x01, hi, lo])
            }
            0x02 => {
                let mut payload = vec![0x02, 0xFF];
                for (dtc, status) in matching {
                    payload.extend_from_slice(&dtc.to_be_bytes()[1..]);
                    payload.push(*status);
                }
                Ok(payload)
            }
            _ => Err(NRC_SUBFUNCTION_NOT_SUPPORTED),
        }
    }

    fn clear_dtcs(&mut self, args: &[u8]) -> Result<Vec<u8>, u8> {
        let [a, b, c] = args else {
            return Err(NRC_INCORRECT_LENGTH);
        };
        let group = u32::from_be_bytes([0, *a, *b, *c]);
        if group == 0xFF_FFFF {
            self.dtcs.clear();
        } else {
            self.dtcs.remove(&group);
        }
        Ok(Vec::new())
    }

    fn security_access(&mut self, args: &[u8]) -> Result<Vec<u8>, u8> {
        let (&level, key) = args.split_first().ok_or(NRC_INCORRECT_LENGTH)?;
        if level == 0 {
            return Err(NRC_SUBFUNCTION_NOT_SUPPORTED);
        }
        if level % 2 == 1 {
            let mut payload = vec![level];
            if self.unlocked == Some(level) {
                payload.extend_from_slice(&[0; 4]);
            } else {
                payload.extend_from_slice(&self.seed);
            }
            return Ok(payload);
        }
        if key != self.expected_key().as_slice() {
            return Err(NRC_INVALID_KEY);
        }
        self.unlocked = Some(level - 1);
        Ok(vec![level])
    }

    /// Serve requests on `endpoint` until shut down or the bus closes
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(mut self, endpoint: VirtualEndpoint) -> SimulatedEcuHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let channel = IsoTpChannel::new(self.isotp.clone(), self.response_id, self.request_id, false);
        let access = BusAccess::Direct(Arc::new(endpoint));

        let task = tokio::spawn(async move {
            let mut link = match access.link(self.request_id) {
                Ok(link) => link,
                Err(e) => {
                    warn!(ecu = %self.name, error = %e, "Simulated ECU could not attach");
                    return;
                }
            };
            info!(ecu = %self.name, request_id = format!("0x{:X}", self.request_id), "Simulated ECU running");

            while !stop_flag.load(Ordering::SeqCst) {
                let request = match channel.recv(link.as_mut(), Duration::from_millis(50)).await {
                    Ok(Some(request)) => request,
                    Ok(None) => continue,
                    Err(ProtocolError::Transport(TransportError::Closed)) => break,
                    Err(e) => {
                        warn!(ecu = %self.name, error = %e, "Simulated ECU receive failed");
                        continue;
                    }
                };
                debug!(ecu = %self.name, request = %hex::encode_upper(&request), "Simulated ECU request");

                for _ in 0..self.pending_responses {
                    let pending = [service_id::NEGATIVE_RESPONSE, request[0], NRC_RESPONSE_PENDING];
                    if let Err(e) = channel.send(link.as_mut(), &pending).await {
                        warn!(ecu = %self.name, error = %e, "Simulated ECU send failed");
                    }
                    tokio::time::sleep(self.pending_delay).await;
                }
                let response = self.respond(&request);
                if response.is_empty() {
                    continue;
                }
                if let Err(e) = channel.send(link.as_mut(), &response).await {
                    warn!(ecu = %self.name, error = %e, "Simulated ECU send failed");
                }
            }
            debug!(ecu = %self.name, "Simulated ECU stopped");
        });

        SimulatedEcuHandle { stop, task }
    }
}

/// Running simulated ECU
pub struct SimulatedEcuHandle {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SimulatedEcuHandle {
    pub async fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.task.await;
    }
}
