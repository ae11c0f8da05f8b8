//! Debug-table emission for the source-level debugger.
//!
//! Per function the code generator can record an ordered map from
//! instruction pointer to source location, plus the local-name → slot table.
//! Positions are recorded only when the line/column changes, keeping the
//! table small. These tables are consumed by an external debugger and are
//! not part of the DLBC artifact.

use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// A resolved source position inside a named file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// Debug tables for one bytecode function.
#[derive(Clone, Debug, Default)]
pub struct FunctionDebugInfo {
    /// Function name (mangled for members).
    pub name: String,
    /// Source file the function was compiled from.
    pub file: String,
    /// Ordered instruction pointer → source location map.
    pub ip_to_location: BTreeMap<u32, DebugLocation>,
    /// Local variable name → slot number.
    pub local_slots: FxHashMap<String, u8>,
}

impl FunctionDebugInfo {
    /// The source location governing the given instruction pointer: the
    /// entry at or before `ip`.
    #[must_use]
    pub fn location_for_ip(&self, ip: u32) -> Option<&DebugLocation> {
        self.ip_to_location.range(..=ip).next_back().map(|(_, l)| l)
    }
}

/// All debug tables for one compilation, keyed by function table index.
pub type DebugTables = BTreeMap<u32, FunctionDebugInfo>;
