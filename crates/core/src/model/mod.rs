//! Ingestion input model.
//!
//! The storage engine never disassembles anything itself. It consumes an
//! already-parsed report through two small capabilities:
//! - [`DisassemblyReport`]: file-level metadata plus an iterator over functions.
//! - [`FunctionDescriptor`]: one function's offset, normalized code bytes,
//!   serialized graph payload and (optionally) a precomputed MinHash signature.
//!
//! [`Report`] / [`ReportFunction`] are plain serde types implementing both, so
//! reports can be loaded straight from JSON.

mod hash;

pub use hash::{ContentHash, ContentHashError};

use serde::{Deserialize, Serialize};

/// One disassembled function as seen by the ingestion pipeline.
pub trait FunctionDescriptor {
    /// Function start address / offset within the binary.
    fn offset(&self) -> u64;

    /// Optional symbol name.
    fn function_name(&self) -> Option<&str> {
        None
    }

    /// Normalized (position-independent) code bytes; input to the PicHash.
    fn code_bytes(&self) -> &[u8];

    /// Serialized extended control-flow graph payload.
    fn xcfg(&self) -> serde_json::Value;

    fn num_instructions(&self) -> u32 {
        0
    }

    /// Precomputed MinHash signature, if an earlier pipeline stage built one.
    fn minhash_signature(&self) -> Option<&[u32]> {
        None
    }
}

/// A parsed disassembly report for one binary.
pub trait DisassemblyReport {
    /// SHA-256 of the original file.
    fn sha256(&self) -> ContentHash;

    /// Family label; empty string means "unassigned".
    fn family(&self) -> &str;

    fn is_library(&self) -> bool;

    fn version(&self) -> Option<&str>;

    fn filename(&self) -> &str {
        ""
    }

    fn bitness(&self) -> u32 {
        0
    }

    fn base_addr(&self) -> u64 {
        0
    }

    /// Iterate all functions of the report, in any order.
    fn functions(&self) -> Box<dyn Iterator<Item = &dyn FunctionDescriptor> + '_>;
}

/// Serde-loadable function descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportFunction {
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Normalized instruction bytes, escaped as text.
    pub code: String,
    #[serde(default = "empty_xcfg")]
    pub xcfg: serde_json::Value,
    #[serde(default)]
    pub num_instructions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minhash: Option<Vec<u32>>,
}

impl ReportFunction {
    pub fn new(offset: u64, code: impl Into<String>) -> Self {
        Self {
            offset,
            name: None,
            code: code.into(),
            xcfg: empty_xcfg(),
            num_instructions: 0,
            minhash: None,
        }
    }

    /// Builder-style helper to attach a graph payload.
    pub fn with_xcfg(mut self, xcfg: serde_json::Value) -> Self {
        self.xcfg = xcfg;
        self
    }

    /// Builder-style helper to attach a precomputed signature.
    pub fn with_minhash(mut self, signature: Vec<u32>) -> Self {
        self.minhash = Some(signature);
        self
    }
}

impl FunctionDescriptor for ReportFunction {
    fn offset(&self) -> u64 {
        self.offset
    }

    fn function_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn code_bytes(&self) -> &[u8] {
        self.code.as_bytes()
    }

    fn xcfg(&self) -> serde_json::Value {
        self.xcfg.clone()
    }

    fn num_instructions(&self) -> u32 {
        self.num_instructions
    }

    fn minhash_signature(&self) -> Option<&[u32]> {
        self.minhash.as_deref()
    }
}

/// Serde-loadable disassembly report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub sha256: ContentHash,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub is_library: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub bitness: u32,
    #[serde(default)]
    pub base_addr: u64,
    #[serde(default)]
    pub functions: Vec<ReportFunction>,
}

impl Report {
    pub fn new(sha256: ContentHash, functions: Vec<ReportFunction>) -> Self {
        Self {
            sha256,
            family: String::new(),
            is_library: false,
            version: None,
            filename: String::new(),
            bitness: 0,
            base_addr: 0,
            functions,
        }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl DisassemblyReport for Report {
    fn sha256(&self) -> ContentHash {
        self.sha256
    }

    fn family(&self) -> &str {
        &self.family
    }

    fn is_library(&self) -> bool {
        self.is_library
    }

    fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn filename(&self) -> &str {
        &self.filename
    }

    fn bitness(&self) -> u32 {
        self.bitness
    }

    fn base_addr(&self) -> u64 {
        self.base_addr
    }

    fn functions(&self) -> Box<dyn Iterator<Item = &dyn FunctionDescriptor> + '_> {
        Box::new(self.functions.iter().map(|f| f as &dyn FunctionDescriptor))
    }
}

/// The purged graph payload: an empty JSON object.
pub fn empty_xcfg() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_loads_from_minimal_json() {
        let json = format!(
            r#"{{ "sha256": "{}", "functions": [ {{ "offset": 4096, "code": "5589e5" }} ] }}"#,
            "ab".repeat(32)
        );
        let report = Report::from_json(&json).expect("parse report");
        assert_eq!(report.family(), "");
        assert!(!report.is_library());
        let functions: Vec<_> = report.functions().collect();
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].offset(), 4096);
        assert_eq!(functions[0].xcfg(), empty_xcfg());
        assert!(functions[0].minhash_signature().is_none());
    }
}
