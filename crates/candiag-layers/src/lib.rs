//! candiag-layers - diagnostic layer database
//!
//! Describes, per ECU, the UDS services it supports, the positional
//! parameter schema of each request and positive response, its physical
//! addressing and the texts for negative response codes.
//!
//! # Description Files
//!
//! ```yaml
//! meta:
//!   name: Bench
//! negative_responses:
//!   "0x22": Conditions not correct
//! ecus:
//!   - name: Engine
//!     addressing: { request_id: "0x7E0", response_id: "0x7E8" }
//!     services:
//!       - name: ReadDataByIdentifier
//!         service_id: "0x22"
//!         request:
//!           - { name: DataIdentifier, type: uint16 }
//!         positive_response:
//!           - { name: DataIdentifier, type: uint16 }
//!           - { name: Value, type: ascii }
//! ```
//!
//! A `.dpk` package is the gzip of one or more such documents separated by
//! `---`.
//!
//! # Quick Start
//!
//! ```rust
//! use candiag_layers::{encode_request, EcuLayer, ParamDef, ParamType, ParamValue, ServiceDef};
//!
//! let layer = EcuLayer::new("Engine")
//!     .with_addressing(0x7E0, 0x7E8)
//!     .with_service(
//!         ServiceDef::new("ReadDataByIdentifier", 0x22)
//!             .with_request(ParamDef::new("DataIdentifier", ParamType::Uint16)),
//!     );
//!
//! let service = layer.service("ReadDataByIdentifier", 0x22).unwrap();
//! let bytes = encode_request(service, &[ParamValue::Integer(0xF190)]).unwrap();
//! assert_eq!(bytes, vec![0x22, 0xF1, 0x90]);
//! ```

pub mod codec;
pub mod database;
pub mod error;
pub mod nrc;
pub mod types;

pub use codec::{decode_params, decode_response, encode_request, ParamValue};
pub use database::{DiagnosticDatabase, LayerMeta};
pub use error::{CodecError, LayerError};
pub use nrc::NegativeResponseCode;
pub use types::{Addressing, EcuLayer, ParamDef, ParamType, ServiceDef};
