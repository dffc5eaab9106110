//! candiag-signals - CAN signal database and frame decoder
//!
//! Maps frame identifiers to message layouts and turns raw payloads into
//! named physical values.
//!
//! # Features
//!
//! - **DBC import** via `can-dbc`: value tables, receivers, extended ids,
//!   multiplexed signals
//! - **YAML/JSON definition files** for hand-written bench databases
//! - **Pure decoder** with per-call truncation and choice policies
//! - **Encoder** for generating traffic, exact inverse of the decoder
//! - **Display precision** helpers that never touch stored values
//!
//! # Quick Start
//!
//! ```rust
//! use candiag_signals::{decode, MessageDef, SignalDef, SignalValue};
//!
//! let msg = MessageDef::new(0x100, "VehicleSpeed", 1)
//!     .with_signal(SignalDef::new("Speed", 0, 8).with_scale(0.5, 0.0));
//!
//! let values = decode(&msg, &[40], false, true).unwrap();
//! assert_eq!(values["Speed"], SignalValue::Physical(20.0));
//! ```
//!
//! # YAML Definition Files
//!
//! ```yaml
//! meta:
//!   name: Bench
//!   version: "1.0"
//!
//! messages:
//!   - id: 0x200
//!     name: Transmission
//!     length: 2
//!     senders: [TCM]
//!     signals:
//!       - name: Gear
//!         start_bit: 0
//!         bit_length: 4
//!         choices: { 0: Park, 1: Reverse, 2: Neutral, 3: Drive }
//!       - name: OilTemp
//!         start_bit: 8
//!         bit_length: 8
//!         signed: true
//!         offset: 40
//!         unit: degC
//! ```

pub mod database;
pub mod dbc;
pub mod decode;
pub mod encode;
pub mod error;
pub mod layout;
pub mod precision;
pub mod types;

pub use database::{DatabaseMeta, SignalDatabase};
pub use decode::{decode, decode_with, DecodeOptions};
pub use encode::encode;
pub use error::{format_frame_id, parse_frame_id, DecodeError, EncodeError, SignalError};
pub use precision::{format_physical, round_for_scale, round_significant, to_json_number};
pub use types::{ByteOrder, DecodedMessage, DecodedSignal, MessageDef, SignalDef, SignalValue};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_full_workflow() {
        let yaml = r#"
messages:
  - id: 0x200
    name: Transmission
    length: 2
    senders: [TCM]
    signals:
      - name: Gear
        start_bit: 0
        bit_length: 4
        choices: { 0: Park, 1: Reverse, 2: Neutral, 3: Drive }
      - name: OilTemp
        start_bit: 8
        bit_length: 8
        signed: true
        offset: 40
        unit: degC
"#;
        let db = SignalDatabase::from_yaml(yaml).unwrap();
        let msg = db.lookup(0x200).unwrap();

        let mut physical = BTreeMap::new();
        physical.insert("Gear".to_string(), 2.0);
        physical.insert("OilTemp".to_string(), 95.0);
        let payload = encode(msg, &physical).unwrap();
        assert_eq!(payload, vec![0x02, 55]);

        let labelled = db.decode(0x200, &payload, DecodeOptions::default()).unwrap();
        assert_eq!(labelled["Gear"].label(), Some("Neutral"));
        assert_eq!(labelled["OilTemp"].to_string(), "95");

        let numeric = db.decode(0x200, &payload, DecodeOptions::lenient()).unwrap();
        assert_eq!(numeric["Gear"], SignalValue::Physical(2.0));
    }
}
