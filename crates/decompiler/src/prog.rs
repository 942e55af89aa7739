//! The program: modules, procedures, globals and the lookups over them.

use std::collections::HashMap;

use crate::exp::Exp;
use crate::frontend::{BinaryImage, Symbol, SymbolMap, SymbolTable};
use crate::proc::{ProcStatus, Procedure};
use crate::stmt::StmtId;
use crate::types::Type;
use crate::Address;

/// Identity of a procedure within the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcId(pub u32);

impl std::fmt::Display for ProcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A global variable recovered from the image.
#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub name: String,
    pub addr: Address,
    pub ty: Type,
}

/// Grouping of procedures, usually one per object file or library.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub procs: Vec<ProcId>,
}

/// The whole program under decompilation.
pub struct Prog {
    pub name: String,
    pub procs: Vec<Procedure>,
    pub modules: Vec<Module>,
    pub globals: Vec<Global>,
    pub symbols: SymbolMap,
    /// Image access; absent in unit tests that build CFGs by hand.
    pub image: Option<Box<dyn BinaryImage>>,
    /// Procedures registered as entry points.
    pub entry_points: Vec<ProcId>,
    name_index: HashMap<String, ProcId>,
    addr_index: HashMap<Address, ProcId>,
}

impl Prog {
    pub fn new(name: impl Into<String>) -> Self {
        Prog {
            name: name.into(),
            procs: Vec::new(),
            modules: vec![Module { name: "root".into(), procs: Vec::new() }],
            globals: Vec::new(),
            symbols: SymbolMap::new(),
            image: None,
            entry_points: Vec::new(),
            name_index: HashMap::new(),
            addr_index: HashMap::new(),
        }
    }

    // ---- procedures --------------------------------------------------------

    /// Create a procedure; reuses an existing one at the same address.
    pub fn create_proc(&mut self, name: impl Into<String>, addr: Address, is_lib: bool) -> ProcId {
        if let Some(existing) = self.addr_index.get(&addr) {
            return *existing;
        }
        let name = name.into();
        let id = ProcId(self.procs.len() as u32);
        self.procs.push(Procedure::new(id, name.clone(), addr, is_lib));
        self.name_index.insert(name, id);
        self.addr_index.insert(addr, id);
        self.modules[0].procs.push(id);
        id
    }

    /// Create a procedure at an address, naming it from the symbol table or
    /// synthesising a `proc_0x...` name.
    pub fn create_proc_at(&mut self, addr: Address) -> ProcId {
        let name = match self.symbols.find_by_addr(addr) {
            Some(sym) => sym.name.clone(),
            None => format!("proc_0x{addr:x}"),
        };
        self.create_proc(name, addr, false)
    }

    pub fn proc(&self, id: ProcId) -> &Procedure {
        &self.procs[id.0 as usize]
    }

    pub fn proc_mut(&mut self, id: ProcId) -> &mut Procedure {
        &mut self.procs[id.0 as usize]
    }

    pub fn find_proc_by_addr(&self, addr: Address) -> Option<ProcId> {
        self.addr_index.get(&addr).copied()
    }

    pub fn find_proc_by_name(&self, name: &str) -> Option<ProcId> {
        self.name_index.get(name).copied()
    }

    pub fn proc_ids(&self) -> Vec<ProcId> {
        (0..self.procs.len() as u32).map(ProcId).collect()
    }

    pub fn user_proc_ids(&self) -> Vec<ProcId> {
        self.proc_ids()
            .into_iter()
            .filter(|p| !self.proc(*p).is_lib)
            .collect()
    }

    /// Register an entry point, creating the procedure if needed.
    pub fn add_entry_point(&mut self, addr: Address) -> ProcId {
        let id = self.create_proc_at(addr);
        if !self.entry_points.contains(&id) {
            self.entry_points.push(id);
        }
        id
    }

    // ---- globals and symbols ----------------------------------------------

    pub fn add_global(&mut self, name: impl Into<String>, addr: Address, ty: Type) {
        self.globals.push(Global { name: name.into(), addr, ty });
    }

    pub fn global_at(&self, addr: Address) -> Option<&Global> {
        self.globals.iter().find(|g| g.addr == addr)
    }

    pub fn global_by_name(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn find_symbol_by_addr(&self, addr: Address) -> Option<&Symbol> {
        self.symbols.find_by_addr(addr)
    }

    // ---- call graph --------------------------------------------------------

    /// Call sites (proc, statement) whose resolved destination is `callee`.
    pub fn call_sites_of(&self, callee: ProcId) -> Vec<(ProcId, StmtId)> {
        let mut out = Vec::new();
        for pid in self.proc_ids() {
            let proc = self.proc(pid);
            for sid in proc.cfg.statements_in_order() {
                if let Some(c) = proc.cfg.try_stmt(sid).and_then(|s| s.as_call()) {
                    if c.dest_proc == Some(callee) {
                        out.push((pid, sid));
                    }
                }
            }
        }
        out
    }

    /// Resolved callees of one procedure.
    pub fn callees_of(&self, pid: ProcId) -> Vec<ProcId> {
        let proc = self.proc(pid);
        let mut out = Vec::new();
        for sid in proc.cfg.statements_in_order() {
            if let Some(c) = proc.cfg.try_stmt(sid).and_then(|s| s.as_call()) {
                if let Some(callee) = c.dest_proc {
                    if !out.contains(&callee) {
                        out.push(callee);
                    }
                }
            }
        }
        out
    }

    /// Give every procedure in `group` the same cycle-group set.
    pub fn set_cycle_group(&mut self, group: &std::collections::BTreeSet<ProcId>) {
        for pid in group {
            self.proc_mut(*pid).cycle_group = Some(group.clone());
        }
    }

    /// True once every user procedure is fully decompiled.
    pub fn all_final(&self) -> bool {
        self.user_proc_ids()
            .iter()
            .all(|p| self.proc(*p).status >= ProcStatus::Final)
    }

    /// Fold a read of a read-only word into a constant, when the image can.
    pub fn read_const_word(&self, addr: Address) -> Option<i64> {
        let image = self.image.as_deref()?;
        if !image.is_read_only(addr) {
            return None;
        }
        image.read_native4(addr).map(|w| w as i32 as i64)
    }

    /// The expression for a global at an address, registering a fresh
    /// global when the address is new.
    pub fn global_exp_at(&mut self, addr: Address) -> Exp {
        if let Some(g) = self.global_at(addr) {
            return Exp::global(g.name.clone());
        }
        let name = match self.symbols.find_by_addr(addr) {
            Some(s) => s.name.clone(),
            None => format!("global_0x{addr:x}"),
        };
        self.add_global(name.clone(), addr, Type::Void);
        Exp::global(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_proc_is_idempotent_per_address() {
        let mut prog = Prog::new("test");
        let a = prog.create_proc("main", 0x1000, false);
        let b = prog.create_proc("other", 0x1000, false);
        assert_eq!(a, b);
        assert_eq!(prog.proc(a).name, "main");
    }

    #[test]
    fn test_lookup_by_name_and_addr() {
        let mut prog = Prog::new("test");
        let id = prog.create_proc("main", 0x1000, false);
        assert_eq!(prog.find_proc_by_addr(0x1000), Some(id));
        assert_eq!(prog.find_proc_by_name("main"), Some(id));
        assert_eq!(prog.find_proc_by_addr(0x2000), None);
    }

    #[test]
    fn test_globals() {
        let mut prog = Prog::new("test");
        prog.add_global("g", 0x4000, Type::signed_int(32));
        assert!(prog.global_at(0x4000).is_some());
        assert!(prog.global_by_name("g").is_some());
        assert_eq!(prog.global_exp_at(0x4000), Exp::global("g"));
        // Unknown address mints a new global.
        let e = prog.global_exp_at(0x5000);
        assert_eq!(e, Exp::global("global_0x5000"));
        assert!(prog.global_at(0x5000).is_some());
    }
}
