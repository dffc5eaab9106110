//! ISO-TP (ISO 15765-2) segmentation and reassembly
//!
//! Normal addressing over a [`FrameLink`]. Payloads that fit one frame go
//! out as a Single Frame; larger ones as a First Frame followed by
//! Consecutive Frames paced by the peer's Flow Control. Reception mirrors
//! this and answers First Frames with our own Flow Control.
//!
//! Supports the 32-bit First Frame length escape and CAN FD frame sizes.

use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::IsoTpConfig;
use crate::error::ProtocolError;
use crate::frame::{fd_frame_len, Frame};
use crate::router::FrameLink;

const SF_PCI: u8 = 0x00;
const FF_PCI: u8 = 0x10;
const CF_PCI: u8 = 0x20;
const FC_PCI: u8 = 0x30;

/// Largest length a 12-bit First Frame can announce
const FF_SHORT_MAX: usize = 0xFFF;

/// Flow status of a Flow Control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    ContinueToSend,
    Wait,
    Overflow,
}

impl FlowStatus {
    fn from_nibble(value: u8) -> Option<Self> {
        match value {
            0 => Some(FlowStatus::ContinueToSend),
            1 => Some(FlowStatus::Wait),
            2 => Some(FlowStatus::Overflow),
            _ => None,
        }
    }
}

/// Decoded protocol control information of one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pci<'a> {
    Single(&'a [u8]),
    First { length: usize, data: &'a [u8] },
    Consecutive { sequence: u8, data: &'a [u8] },
    FlowControl { status: FlowStatus, block_size: u8, st_min: u8 },
}

/// Parse the PCI of a received frame
pub fn parse_pci(data: &[u8]) -> Result<Pci<'_>, ProtocolError> {
    let first = *data.first().ok_or_else(|| unexpected("empty frame"))?;
    match first & 0xF0 {
        SF_PCI => {
            let (length, offset) = match first & 0x0F {
                0 if data.len() > 8 => (usize::from(*data.get(1).unwrap_or(&0)), 2),
                n => (usize::from(n), 1),
            };
            if length == 0 || offset + length > data.len() {
                return Err(unexpected("single frame length does not match frame"));
            }
            Ok(Pci::Single(&data[offset..offset + length]))
        }
        FF_PCI => {
            if data.len() < 2 {
                return Err(unexpected("truncated first frame"));
            }
            let short = (usize::from(first & 0x0F) << 8) | usize::from(data[1]);
            if short != 0 {
                return Ok(Pci::First {
                    length: short,
                    data: &data[2..],
                });
            }
            if data.len() < 6 {
                return Err(unexpected("truncated first frame length escape"));
            }
            let length = u32::from_be_bytes([data[2], data[3], data[4], data[5]]) as usize;
            Ok(Pci::First {
                length,
                data: &data[6..],
            })
        }
        CF_PCI => Ok(Pci::Consecutive {
            sequence: first & 0x0F,
            data: &data[1..],
        }),
        FC_PCI => {
            let status = FlowStatus::from_nibble(first & 0x0F)
                .ok_or_else(|| unexpected("invalid flow status"))?;
            Ok(Pci::FlowControl {
                status,
                block_size: data.get(1).copied().unwrap_or(0),
                st_min: data.get(2).copied().unwrap_or(0),
            })
        }
        _ => Err(unexpected("unknown PCI type")),
    }
}

fn unexpected(reason: &str) -> ProtocolError {
    ProtocolError::UnexpectedFrame(reason.to_string())
}

/// Separation time encoded in a Flow Control frame
pub fn st_min_duration(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(u64::from(raw)),
        0xF1..=0xF9 => Duration::from_micros(u64::from(raw - 0xF0) * 100),
        _ => Duration::from_millis(0x7F),
    }
}

/// One segmented connection between tester and ECU
#[derive(Debug, Clone)]
pub struct IsoTpChannel {
    config: IsoTpConfig,
    tx_id: u32,
    rx_id: u32,
    extended: bool,
}

impl IsoTpChannel {
    pub fn new(config: IsoTpConfig, tx_id: u32, rx_id: u32, extended: bool) -> Self {
        Self {
            config,
            tx_id,
            rx_id,
            extended,
        }
    }

    pub fn tx_id(&self) -> u32 {
        self.tx_id
    }

    pub fn rx_id(&self) -> u32 {
        self.rx_id
    }

    fn tx_dl(&self) -> usize {
        usize::from(self.config.tx_dl.max(8))
    }

    fn n_bs(&self) -> Duration {
        Duration::from_millis(self.config.n_bs_ms)
    }

    fn n_cr(&self) -> Duration {
        Duration::from_millis(self.config.n_cr_ms)
    }

    /// Largest payload sent as a Single Frame
    pub fn single_frame_capacity(&self) -> usize {
        if self.tx_dl() > 8 {
            self.tx_dl() - 2
        } else {
            7
        }
    }

    fn frame(&self, mut data: Vec<u8>) -> Frame {
        let target = match self.config.padding {
            Some(_) if self.tx_dl() > 8 => fd_frame_len(data.len().max(8)),
            Some(_) => 8,
            None => fd_frame_len(data.len()),
        };
        data.resize(target.max(data.len()), self.config.padding.unwrap_or(0xCC));
        Frame::new(self.tx_id, data).extended(self.extended)
    }

    /// Segment a first frame and its consecutive frames
    fn segment(&self, payload: &[u8]) -> Result<(Vec<u8>, Vec<Vec<u8>>), ProtocolError> {
        let tx_dl = self.tx_dl();
        let mut first = Vec::with_capacity(tx_dl);
        if payload.len() <= FF_SHORT_MAX {
            first.push(FF_PCI | (payload.len() >> 8) as u8);
            first.push(payload.len() as u8);
        } else {
            let length = u32::try_from(payload.len())
                .map_err(|_| ProtocolError::PayloadTooLarge(payload.len()))?;
            first.extend_from_slice(&[FF_PCI, 0x00]);
            first.extend_from_slice(&length.to_be_bytes());
        }
        let head = tx_dl - first.len();
        first.extend_from_slice(&payload[..head]);

        let consecutive = payload[head..]
            .chunks(tx_dl - 1)
            .enumerate()
            .map(|(index, chunk)| {
                let mut cf = Vec::with_capacity(tx_dl);
                cf.push(CF_PCI | ((index + 1) & 0x0F) as u8);
                cf.extend_from_slice(chunk);
                cf
            })
            .collect();
        Ok((first, consecutive))
    }

    /// Send a payload, waiting for flow control as needed
    pub async fn send(&self, link: &mut dyn FrameLink, payload: &[u8]) -> Result<(), ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }

        if payload.len() <= self.single_frame_capacity() {
            let mut data = Vec::with_capacity(payload.len() + 2);
            if payload.len() <= 7 {
                data.push(SF_PCI | payload.len() as u8);
            } else {
                data.extend_from_slice(&[SF_PCI, payload.len() as u8]);
            }
            data.extend_from_slice(payload);
            trace!(tx_id = format!("0x{:X}", self.tx_id), len = payload.len(), "Sending single frame");
            link.send(self.frame(data)).await?;
            return Ok(());
        }

        let (first, consecutive) = self.segment(payload)?;
        debug!(
            tx_id = format!("0x{:X}", self.tx_id),
            len = payload.len(),
            frames = consecutive.len() + 1,
            "Sending segmented payload"
        );
        link.send(self.frame(first)).await?;

        let mut frames = consecutive.into_iter().peekable();
        while frames.peek().is_some() {
            let (block_size, st_min) = self.await_flow_control(link).await?;
            let mut sent_in_block = 0usize;
            while let Some(cf) = frames.next() {
                link.send(self.frame(cf)).await?;
                sent_in_block += 1;
                if frames.peek().is_none() {
                    break;
                }
                if block_size != 0 && sent_in_block == usize::from(block_size) {
                    break;
                }
                if !st_min.is_zero() {
                    tokio::time::sleep(st_min).await;
                }
            }
        }
        Ok(())
    }

    async fn await_flow_control(
        &self,
        link: &mut dyn FrameLink,
    ) -> Result<(u8, Duration), ProtocolError> {
        let mut waits = 0u32;
        loop {
            let frame = link
                .recv(self.n_bs())
                .await?
                .ok_or(ProtocolError::Timeout("flow control"))?;
            match parse_pci(&frame.data) {
                Ok(Pci::FlowControl {
                    status: FlowStatus::ContinueToSend,
                    block_size,
                    st_min,
                }) => return Ok((block_size, st_min_duration(st_min))),
                Ok(Pci::FlowControl {
                    status: FlowStatus::Wait,
                    ..
                }) => {
                    waits += 1;
                    if waits > self.config.max_wait_frames {
                        return Err(ProtocolError::WaitLimit(waits));
                    }
                    trace!(waits, "Flow control WAIT");
                }
                Ok(Pci::FlowControl {
                    status: FlowStatus::Overflow,
                    ..
                }) => return Err(ProtocolError::Overflow),
                Ok(other) => {
                    debug!(pci = ?other, "Ignoring frame while waiting for flow control");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Receive one payload
    ///
    /// Waits up to `timeout` for the start of a message. Returns `Ok(None)`
    /// when nothing arrived; a stalled multi-frame transfer is an error.
    pub async fn recv(
        &self,
        link: &mut dyn FrameLink,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let Some(frame) = link.recv(remaining).await? else {
                return Ok(None);
            };

            match parse_pci(&frame.data) {
                Ok(Pci::Single(data)) => return Ok(Some(data.to_vec())),
                Ok(Pci::First { length, data }) => {
                    let data = data.to_vec();
                    return self.reassemble(link, length, data).await.map(Some);
                }
                Ok(other) => debug!(pci = ?other, "Ignoring frame outside a transfer"),
                Err(e) => warn!(error = %e, "Ignoring malformed frame"),
            }
        }
    }

    async fn reassemble(
        &self,
        link: &mut dyn FrameLink,
        length: usize,
        mut data: Vec<u8>,
    ) -> Result<Vec<u8>, ProtocolError> {
        if length > self.config.max_rx_len {
            warn!(
                rx_id = format!("0x{:X}", self.rx_id),
                length,
                limit = self.config.max_rx_len,
                "Rejecting oversized segmented payload"
            );
            let fc = vec![FC_PCI | 0x02, 0, 0];
            link.send(self.frame(fc)).await?;
            return Err(ProtocolError::Overflow);
        }

        debug!(rx_id = format!("0x{:X}", self.rx_id), length, "Receiving segmented payload");
        data.reserve(length.saturating_sub(data.len()));
        self.send_flow_control(link).await?;

        let mut expected = 1u8;
        let mut in_block = 0u8;
        while data.len() < length {
            let frame = link
                .recv(self.n_cr())
                .await?
                .ok_or(ProtocolError::Timeout("consecutive frame"))?;

            match parse_pci(&frame.data)? {
                Pci::Consecutive { sequence, data: chunk } => {
                    if sequence != expected {
                        return Err(ProtocolError::SequenceMismatch {
                            expected,
                            actual: sequence,
                        });
                    }
                    data.extend_from_slice(chunk);
                    expected = (expected + 1) & 0x0F;
                }
                other => {
                    return Err(ProtocolError::UnexpectedFrame(format!(
                        "{:?} during reassembly",
                        other
                    )))
                }
            }

            in_block = in_block.wrapping_add(1);
            if self.config.block_size != 0
                && in_block == self.config.block_size
                && data.len() < length
            {
                in_block = 0;
                self.send_flow_control(link).await?;
            }
        }
        data.truncate(length);
        Ok(data)
    }

    async fn send_flow_control(&self, link: &mut dyn FrameLink) -> Result<(), ProtocolError> {
        let fc = vec![FC_PCI, self.config.block_size, self.config.st_min];
        link.send(self.frame(fc)).await?;
        Ok(())
    }
}
