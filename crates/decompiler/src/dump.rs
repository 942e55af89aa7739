//! Text dumps: dotty graphs for the call graph and per-procedure data
//! flow, and the C-like symbols file. None of these are input contracts;
//! they exist for humans and regression diffs.

use std::fmt::Write as _;

use crate::prog::{ProcId, Prog};
use crate::Exp;

/// The whole-program call graph in dot format.
pub fn call_graph_dot(prog: &Prog) -> String {
    let mut out = String::from("digraph callgraph {\n");
    for pid in prog.proc_ids() {
        let p = prog.proc(pid);
        let shape = if p.is_lib { "ellipse" } else { "box" };
        let _ = writeln!(out, "    {} [label=\"{}\" shape={}];", pid, p.name, shape);
    }
    for pid in prog.proc_ids() {
        for callee in prog.callees_of(pid) {
            let _ = writeln!(out, "    {} -> {};", pid, callee);
        }
    }
    out.push_str("}\n");
    out
}

/// One procedure's use-def graph in dot format: a node per statement,
/// an edge from each definition to its users.
pub fn dfg_dot(prog: &Prog, pid: ProcId) -> String {
    let proc = prog.proc(pid);
    let mut out = String::new();
    let _ = writeln!(out, "digraph \"dfg_{}\" {{", proc.name);
    for sid in proc.cfg.statements_in_order() {
        let Some(s) = proc.cfg.try_stmt(sid) else { continue };
        let label = s.to_string().replace('"', "'");
        let _ = writeln!(out, "    s{} [label=\"{}\"];", sid, label.trim());
        let mut used = crate::exp::ExpSet::new();
        s.add_used_locs(&mut used, false);
        for u in used.iter() {
            if let Some((_, Some(def))) = u.as_ref_parts() {
                let _ = writeln!(out, "    s{} -> s{};", def, sid);
            }
        }
    }
    out.push_str("}\n");
    out
}

/// A C-like symbols file: one line per procedure and global, usable as a
/// header for re-feeding names into a later run.
pub fn symbols_file(prog: &Prog) -> String {
    let mut out = String::new();
    for pid in prog.proc_ids() {
        let p = prog.proc(pid);
        let mut params = String::new();
        for (i, par) in p.signature.params.iter().enumerate() {
            if i > 0 {
                params.push_str(", ");
            }
            let _ = write!(params, "{} {}", par.ty, par.name);
        }
        let ret = p
            .signature
            .returns
            .first()
            .map(|r| r.ty.to_string())
            .unwrap_or_else(|| "v".into());
        let _ = writeln!(out, "{} {}({}); // 0x{:x}", ret, p.name, params, p.addr);
    }
    for g in &prog.globals {
        let _ = writeln!(out, "{} {}; // 0x{:x}", g.ty, g.name, g.addr);
    }
    out
}

/// Render a procedure body: parameters, locals, then statements by block.
/// This is the typed statement stream an emitter consumes, in text form.
pub fn proc_text(prog: &Prog, pid: ProcId) -> String {
    let proc = prog.proc(pid);
    let mut out = String::new();
    let _ = write!(out, "{}(", proc.name);
    for (i, p) in proc.parameters.iter().enumerate() {
        if i > 0 {
            let _ = write!(out, ", ");
        }
        let _ = write!(out, "{}", p.lhs);
    }
    let _ = writeln!(out, ")");
    for (name, ty) in &proc.locals {
        let _ = writeln!(out, "    local {name}: {ty}");
    }
    out.push_str(&proc.cfg.print());
    out
}

/// Helper for dumps that need an expression without subscripts.
pub fn strip_subscripts(e: &Exp) -> Exp {
    let (clean, _) = e.clone().remove_subscripts();
    clean
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    #[test]
    fn test_call_graph_dot_contains_edges() {
        let mut prog = Prog::new("t");
        let main = prog.create_proc("main", 0x1000, false);
        let helper = prog.create_proc("helper", 0x2000, false);
        // Wire a call from main to helper.
        let sid = prog
            .proc_mut(main)
            .cfg
            .add_stmt(crate::stmt::StatementKind::Call({
                let mut c = crate::stmt::CallStatement::new(Exp::func_addr(0x2000));
                c.dest_proc = Some(helper);
                c
            }));
        let b = prog
            .proc_mut(main)
            .cfg
            .new_bb(
                vec![crate::rtl::Rtl::with_stmts(0x1000, vec![sid])],
                crate::cfg::BbKind::Call,
            )
            .block();
        prog.proc_mut(main).cfg.set_entry_and_exit(b);

        let dot = call_graph_dot(&prog);
        assert!(dot.contains("label=\"main\""));
        assert!(dot.contains("label=\"helper\""));
        assert!(dot.contains("0 -> 1;"));
    }

    #[test]
    fn test_symbols_file_lines() {
        let mut prog = Prog::new("t");
        let pid = prog.create_proc("main", 0x1000, false);
        prog.proc_mut(pid)
            .signature
            .add_param("param1", Exp::reg(24), Type::signed_int(32));
        prog.add_global("counter", 0x4000, Type::signed_int(32));
        let text = symbols_file(&prog);
        assert!(text.contains("main(i32 param1); // 0x1000"));
        assert!(text.contains("i32 counter; // 0x4000"));
    }
}
