//! Interfaces to the external collaborators: the instruction decoder, the
//! loaded binary image, the symbol table, and the per-architecture front
//! end. The core consumes these; their implementations live elsewhere.

use crate::exp::Exp;
use crate::proc::Signature;
use crate::prog::{ProcId, Prog};
use crate::stmt::StatementKind;
use crate::Address;

/// One decoded instruction: statement payloads plus decode metadata. The
/// statements get arena ids when the CFG takes them.
#[derive(Debug, Default)]
pub struct DecodedInstruction {
    pub stmts: Vec<StatementKind>,
    pub num_bytes: u32,
    pub valid: bool,
}

/// Machine-instruction decoder over the image.
pub trait Decoder {
    fn decode(&self, pc: Address, image: &dyn BinaryImage) -> DecodedInstruction;
    fn reg_name(&self, n: i64) -> String;
    fn reg_size(&self, n: i64) -> u16;
    fn reg_num_by_name(&self, name: &str) -> Option<i64>;
}

/// Read access to the loaded binary.
pub trait BinaryImage {
    fn read_native1(&self, addr: Address) -> Option<u8>;
    fn read_native2(&self, addr: Address) -> Option<u16>;
    fn read_native4(&self, addr: Address) -> Option<u32>;
    fn read_native8(&self, addr: Address) -> Option<u64>;
    fn read_native_float4(&self, addr: Address) -> Option<f32>;
    fn read_native_float8(&self, addr: Address) -> Option<f64>;
    /// True when the address lies in a read-only section.
    fn is_read_only(&self, addr: Address) -> bool;
    fn is_string_constant(&self, addr: Address) -> bool;
    fn string_at(&self, addr: Address) -> Option<String>;
    /// Target of a library thunk at `addr`, if it is one.
    fn get_jump_target(&self, addr: Address) -> Option<Address>;
}

/// A loader or user-provided symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub addr: Address,
    pub size: u32,
    pub name: String,
    pub source_file: Option<String>,
    pub imported: bool,
    pub function: bool,
}

/// Symbol lookups the core needs.
pub trait SymbolTable {
    fn find_by_name(&self, name: &str) -> Option<&Symbol>;
    fn find_by_addr(&self, addr: Address) -> Option<&Symbol>;
}

/// Simple in-memory symbol table, enough for tests and embedders without a
/// loader of their own.
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    symbols: Vec<Symbol>,
}

impl SymbolMap {
    pub fn new() -> Self {
        SymbolMap::default()
    }

    pub fn add(&mut self, sym: Symbol) {
        self.symbols.push(sym);
    }
}

impl SymbolTable for SymbolMap {
    fn find_by_name(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    fn find_by_addr(&self, addr: Address) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.addr == addr)
    }
}

/// Per-architecture front end: decoding a whole procedure and the few
/// platform facts the analysis needs.
pub trait Frontend {
    /// Decode (or re-decode) the body of a procedure into its CFG.
    /// Returns false when decoding failed outright.
    fn process_proc(&mut self, prog: &mut Prog, pid: ProcId) -> bool;
    /// Calls to these destinations never return (exit, abort, ...).
    fn is_no_return_call_dest(&self, name: &str) -> bool;
    /// Default signature for an undiscovered procedure.
    fn default_signature(&self, name: &str) -> Signature;
    fn is_win32(&self) -> bool {
        false
    }
    fn arch_name(&self) -> &str;
    fn stack_register(&self) -> i64;
}

/// Shape of a recovered jump table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchForm {
    /// Table of absolute addresses.
    Absolute,
    /// Table of offsets from the table base.
    Offset,
}

/// Description of a computed jump that turned out to be a switch.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchInfo {
    /// The expression being switched on.
    pub scrutinee: Exp,
    pub form: SwitchForm,
    pub lower: i64,
    pub upper: i64,
    pub table_addr: Address,
    pub num_cases: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_map_lookup() {
        let mut m = SymbolMap::new();
        m.add(Symbol {
            addr: 0x1000,
            size: 4,
            name: "main".into(),
            source_file: None,
            imported: false,
            function: true,
        });
        assert_eq!(m.find_by_name("main").map(|s| s.addr), Some(0x1000));
        assert_eq!(m.find_by_addr(0x1000).map(|s| s.name.as_str()), Some("main"));
        assert!(m.find_by_name("exit").is_none());
    }
}
