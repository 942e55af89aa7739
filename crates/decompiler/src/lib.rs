//! Talon decompiler core
//!
//! Per-procedure analysis engine of a native-binary decompiler: it takes a
//! recovered control-flow graph of register-transfer-list instructions and
//! turns it into a typed, structured, high-level procedure body.
//!
//! The pipeline, bottom to top:
//!
//! * an expression algebra ([`exp`]) and statement layer ([`stmt`]) over RTLs,
//! * a basic-block CFG with splitting/merging and traversal orders ([`cfg`]),
//! * an SSA engine: dominance frontiers, phi placement, renaming, propagation
//!   and liveness ([`dataflow`]),
//! * the recursion-aware interprocedural driver ([`decompile`]) with its
//!   preservation prover ([`prove`]),
//! * post-dominator structuring ([`structuring`]) and data-flow type analysis
//!   ([`dfa`]).
//!
//! The binary loader, instruction decoder and code emitter are external; only
//! their interfaces appear here ([`frontend`]).

pub mod cfg;
pub mod dataflow;
pub mod decompile;
pub mod dfa;
pub mod dump;
pub mod exp;
pub mod frontend;
pub mod operators;
pub mod proc;
pub mod prog;
pub mod prove;
pub mod rtl;
pub mod settings;
pub mod simplify;
pub mod stmt;
pub mod structuring;
pub mod types;
pub mod visitor;

pub use cfg::{BasicBlock, BbCreationResult, BbKind, BlockId, Cfg, CfgError};
pub use decompile::{DecompileError, Driver};
pub use exp::{Const, Exp, ExpSet};
pub use operators::Operator;
pub use proc::{ProcStatus, Procedure};
pub use prog::{Global, ProcId, Prog};
pub use rtl::Rtl;
pub use settings::{EventSink, Settings};
pub use stmt::{Statement, StatementKind, StmtId};
pub use types::Type;

/// A native (source-binary) address.
pub type Address = u64;

/// Marker for "no address"; used by incomplete blocks.
pub const NO_ADDRESS: Address = u64::MAX;
