//! Backend-independent part of sample ingestion.
//!
//! Both backends turn a report into the same records; only id assignment and
//! persistence differ.

use chrono::{DateTime, Utc};

use crate::model::{empty_xcfg, ContentHash, DisassemblyReport};
use crate::storage::models::{FunctionRecord, SampleRecord};
use crate::storage::pichash::compute_pichash;

pub(crate) struct PreparedFunction {
    offset: u64,
    function_name: Option<String>,
    num_instructions: u32,
    binweight: u32,
    pichash: u64,
    xcfg: serde_json::Value,
    minhash: Option<Vec<u32>>,
}

pub(crate) struct PreparedSample {
    pub(crate) sha256: ContentHash,
    pub(crate) family: String,
    filename: String,
    is_library: bool,
    version: Option<String>,
    bitness: u32,
    base_addr: u64,
    timestamp: DateTime<Utc>,
    functions: Vec<PreparedFunction>,
}

/// Ids and records for one sample, ready to be written.
pub(crate) struct SampleRows {
    pub(crate) sample: SampleRecord,
    pub(crate) functions: Vec<FunctionRecord>,
    /// `(function_id, signature)` for functions carrying a precomputed MinHash.
    pub(crate) minhashes: Vec<(u64, Vec<u32>)>,
}

/// Collect a report's functions in ascending offset order and hash them.
pub(crate) fn prepare_sample(
    report: &dyn DisassemblyReport,
    family: &str,
    drop_disassembly: bool,
) -> PreparedSample {
    let mut functions: Vec<PreparedFunction> = report
        .functions()
        .map(|function| {
            let code = function.code_bytes();
            PreparedFunction {
                offset: function.offset(),
                function_name: function.function_name().map(str::to_string),
                num_instructions: function.num_instructions(),
                binweight: code.len() as u32,
                pichash: compute_pichash(code),
                xcfg: if drop_disassembly { empty_xcfg() } else { function.xcfg() },
                minhash: function.minhash_signature().map(<[u32]>::to_vec),
            }
        })
        .collect();
    functions.sort_by_key(|function| function.offset);

    // Millisecond precision so both backends report the same timestamp.
    let now = Utc::now();
    let timestamp = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);

    PreparedSample {
        sha256: report.sha256(),
        family: family.to_string(),
        filename: report.filename().to_string(),
        is_library: report.is_library(),
        version: report.version().map(str::to_string),
        bitness: report.bitness(),
        base_addr: report.base_addr(),
        timestamp,
        functions,
    }
}

impl PreparedSample {
    pub(crate) fn num_functions(&self) -> usize {
        self.functions.len()
    }

    /// Assign ids: the sample's functions get `first_function_id..`, in offset order.
    pub(crate) fn into_rows(
        self,
        sample_id: u32,
        family_id: u32,
        first_function_id: u64,
    ) -> SampleRows {
        let mut functions = Vec::with_capacity(self.functions.len());
        let mut minhashes = Vec::new();
        for (index, prepared) in self.functions.into_iter().enumerate() {
            let function_id = first_function_id + index as u64;
            if let Some(signature) = prepared.minhash {
                minhashes.push((function_id, signature));
            }
            functions.push(FunctionRecord {
                function_id,
                sample_id,
                offset: prepared.offset,
                function_name: prepared.function_name,
                num_instructions: prepared.num_instructions,
                binweight: prepared.binweight,
                pichash: prepared.pichash,
                xcfg: prepared.xcfg,
            });
        }

        let sample = SampleRecord {
            sample_id,
            family_id,
            family: self.family,
            sha256: self.sha256,
            filename: self.filename,
            is_library: self.is_library,
            version: self.version,
            bitness: self.bitness,
            base_addr: self.base_addr,
            binweight: functions.iter().map(|f| u64::from(f.binweight)).sum(),
            num_functions: functions.len() as u32,
            function_ids: functions.iter().map(|f| f.function_id).collect(),
            timestamp: self.timestamp,
        };

        SampleRows { sample, functions, minhashes }
    }
}
