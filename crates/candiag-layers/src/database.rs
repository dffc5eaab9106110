//! Diagnostic Layer Database
//!
//! Accepts a standalone description (`.yaml`, `.yml`, `.json`) or a bundled
//! diagnostic package (`.dpk`): a gzip-compressed stream of YAML documents,
//! each one a description. ECU layers of all documents are merged.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::LayerError;
use crate::types::EcuLayer;

/// Description metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One description document as found on disk
#[derive(Debug, Deserialize)]
struct DescriptionFile {
    #[serde(default)]
    meta: LayerMeta,
    /// NRC texts shared by every layer of this document
    #[serde(default)]
    negative_responses: BTreeMap<String, String>,
    #[serde(default)]
    ecus: Vec<EcuLayer>,
}

/// Parsed, immutable catalog of ECU diagnostic layers
#[derive(Debug, Clone, Default)]
pub struct DiagnosticDatabase {
    meta: LayerMeta,
    ecus: Vec<EcuLayer>,
    source: Option<PathBuf>,
}

impl DiagnosticDatabase {
    /// Load a description file or a bundled package by extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LayerError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let mut db = match ext.as_str() {
            "yaml" | "yml" => Self::from_yaml(&std::fs::read_to_string(path)?)?,
            "json" => Self::from_json(&std::fs::read_to_string(path)?)?,
            "dpk" => Self::from_package(&std::fs::read(path)?)?,
            other => return Err(LayerError::UnsupportedFormat(other.to_string())),
        };
        db.source = Some(path.to_path_buf());

        info!(
            path = %path.display(),
            ecus = db.ecus.len(),
            "Loaded diagnostic layer database"
        );
        Ok(db)
    }

    /// Parse a single YAML description
    pub fn from_yaml(content: &str) -> Result<Self, LayerError> {
        let file: DescriptionFile = serde_yaml::from_str(content)?;
        Self::from_documents(vec![file])
    }

    /// Parse a single JSON description
    pub fn from_json(content: &str) -> Result<Self, LayerError> {
        let file: DescriptionFile = serde_json::from_str(content)?;
        Self::from_documents(vec![file])
    }

    /// Unpack a gzip bundle of YAML documents
    pub fn from_package(bytes: &[u8]) -> Result<Self, LayerError> {
        let mut text = String::new();
        GzDecoder::new(bytes).read_to_string(&mut text)?;

        let mut documents = Vec::new();
        for document in serde_yaml::Deserializer::from_str(&text) {
            documents.push(DescriptionFile::deserialize(document)?);
        }
        debug!(documents = documents.len(), "Unpacked diagnostic package");

        let db = Self::from_documents(documents)?;
        if db.ecus.is_empty() {
            return Err(LayerError::EmptyPackage);
        }
        Ok(db)
    }

    /// Build from in-memory layers
    pub fn from_layers(meta: LayerMeta, ecus: Vec<EcuLayer>) -> Result<Self, LayerError> {
        let mut seen = HashMap::new();
        for (index, ecu) in ecus.iter().enumerate() {
            if ecu.name.is_empty() {
                return Err(LayerError::Invalid(format!("ECU #{} has no name", index)));
            }
            if seen.insert(ecu.name.as_str(), index).is_some() {
                return Err(LayerError::Invalid(format!(
                    "duplicate ECU layer '{}'",
                    ecu.name
                )));
            }
            validate_services(ecu)?;
        }
        Ok(Self {
            meta,
            ecus,
            source: None,
        })
    }

    fn from_documents(documents: Vec<DescriptionFile>) -> Result<Self, LayerError> {
        let mut meta: Option<LayerMeta> = None;
        let mut ecus = Vec::new();

        for document in documents {
            let shared = parse_nrc_table(&document.negative_responses)?;
            for mut ecu in document.ecus {
                for (code, text) in &shared {
                    ecu.negative_responses
                        .entry(*code)
                        .or_insert_with(|| text.clone());
                }
                ecus.push(ecu);
            }
            meta.get_or_insert(document.meta);
        }

        Self::from_layers(meta.unwrap_or_default(), ecus)
    }

    pub fn meta(&self) -> &LayerMeta {
        &self.meta
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// All ECU layers, in file order
    pub fn ecus(&self) -> &[EcuLayer] {
        &self.ecus
    }

    /// ECU layer by short name
    pub fn ecu(&self, name: &str) -> Option<&EcuLayer> {
        self.ecus.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.ecus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ecus.is_empty()
    }
}

fn validate_services(ecu: &EcuLayer) -> Result<(), LayerError> {
    let mut names = HashMap::new();
    for service in &ecu.services {
        if names.insert(service.name.as_str(), ()).is_some() {
            return Err(LayerError::Invalid(format!(
                "ECU '{}' declares service '{}' twice",
                ecu.name, service.name
            )));
        }
        if (0x40..0x80).contains(&service.service_id) {
            return Err(LayerError::Invalid(format!(
                "ECU '{}' service '{}' uses response identifier 0x{:02X}",
                ecu.name, service.name, service.service_id
            )));
        }
        for param in service.request.iter().chain(&service.positive_response) {
            if param.scale == 0.0 {
                return Err(LayerError::Invalid(format!(
                    "parameter '{}' of '{}' has zero scale",
                    param.name, service.name
                )));
            }
        }
    }
    Ok(())
}

fn parse_nrc_table(raw: &BTreeMap<String, String>) -> Result<Vec<(u8, String)>, LayerError> {
    raw.iter()
        .map(|(key, text)| {
            let t = key.trim();
            let code = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
                Some(hex) => u8::from_str_radix(hex, 16),
                None => t.parse::<u8>(),
            }
            .map_err(|_| LayerError::Invalid(format!("invalid NRC key '{}'", key)))?;
            Ok((code, text.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const ENGINE_YAML: &str = r#"
meta:
  name: bench
  version: "1.0"
negative_responses:
  "0x22": conditions not correct (bench)
ecus:
  - name: Engine
    addressing: { request_id: "0x7E0", response_id: "0x7E8" }
    negative_responses:
      "0x31": DID not supported
    services:
      - name: ReadDataByIdentifier
        service_id: "0x22"
        request:
          - { name: DataIdentifier, type: uint16 }
        positive_response:
          - { name: DataIdentifier, type: uint16 }
          - { name: Value, type: ascii }
        negative_response_codes: ["0x13", "0x31"]
"#;

    const BODY_YAML: &str = r#"
ecus:
  - name: Body
    addressing: { request_id: "0x740", response_id: "0x748" }
"#;

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_from_yaml() {
        let db = DiagnosticDatabase::from_yaml(ENGINE_YAML).unwrap();
        assert_eq!(db.meta().name, "bench");
        assert_eq!(db.len(), 1);

        let engine = db.ecu("Engine").unwrap();
        assert_eq!(engine.addressing.unwrap().request_id, 0x7E0);
        assert_eq!(engine.nrc_text(0x31), "DID not supported");
        assert_eq!(engine.nrc_text(0x22), "conditions not correct (bench)");
        assert_eq!(engine.nrc_text(0x11), "serviceNotSupported");
    }

    #[test]
    fn test_package_merges_documents() {
        let bundle = gzip(&format!("{}\n---\n{}", ENGINE_YAML, BODY_YAML));
        let db = DiagnosticDatabase::from_package(&bundle).unwrap();
        let names: Vec<_> = db.ecus().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Engine", "Body"]);
        assert_eq!(db.meta().name, "bench");
    }

    #[test]
    fn test_package_duplicate_ecu_rejected() {
        let bundle = gzip(&format!("{}\n---\n{}", BODY_YAML, BODY_YAML));
        assert!(matches!(
            DiagnosticDatabase::from_package(&bundle),
            Err(LayerError::Invalid(_))
        ));
    }

    #[test]
    fn test_empty_package() {
        let bundle = gzip("meta: { name: nothing }\n");
        assert!(matches!(
            DiagnosticDatabase::from_package(&bundle),
            Err(LayerError::EmptyPackage)
        ));
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let yaml = dir.path().join("bench.yaml");
        std::fs::write(&yaml, ENGINE_YAML).unwrap();
        let db = DiagnosticDatabase::load(&yaml).unwrap();
        assert_eq!(db.source(), Some(yaml.as_path()));

        let dpk = dir.path().join("bench.dpk");
        std::fs::write(&dpk, gzip(ENGINE_YAML)).unwrap();
        assert!(DiagnosticDatabase::load(&dpk).unwrap().ecu("Engine").is_some());

        let odd = dir.path().join("bench.odx");
        std::fs::write(&odd, "").unwrap();
        assert!(matches!(
            DiagnosticDatabase::load(&odd),
            Err(LayerError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_response_sid_rejected_as_service() {
        let yaml = r#"
ecus:
  - name: Bad
    services:
      - { name: Weird, service_id: "0x62" }
"#;
        assert!(DiagnosticDatabase::from_yaml(yaml).is_err());
    }
}
