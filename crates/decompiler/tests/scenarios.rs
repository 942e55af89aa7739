//! End-to-end dataflow scenarios: hand-built CFGs pushed through the whole
//! per-procedure pipeline, with assertions on the final procedure body.

use talon::cfg::BbKind;
use talon::decompile::Driver;
use talon::exp::{Exp, ExpSet};
use talon::operators::Operator;
use talon::proc::ProcStatus;
use talon::prog::{ProcId, Prog};
use talon::rtl::Rtl;
use talon::settings::{LogSink, Settings};
use talon::stmt::{
    Assign, BranchStatement, BranchType, CallStatement, ReturnStatement, StatementKind, StmtId,
};

fn new_proc(prog: &mut Prog, addr: u64) -> ProcId {
    let pid = prog.create_proc("test", addr, false);
    prog.proc_mut(pid).signature.stack_register = Some(28);
    pid
}

fn assign(prog: &mut Prog, pid: ProcId, lhs: Exp, rhs: Exp) -> StmtId {
    prog.proc_mut(pid)
        .cfg
        .add_stmt(StatementKind::Assign(Assign::new(lhs, rhs)))
}

/// A return statement seeded with `loc := loc` returns, the way a decoder
/// leaves them before analysis.
fn ret_stmt(prog: &mut Prog, pid: ProcId, rets: &[Exp]) -> StmtId {
    let mut r = ReturnStatement::new();
    for loc in rets {
        r.returns.push(Assign::new(loc.clone(), loc.clone()));
    }
    prog.proc_mut(pid).cfg.add_stmt(StatementKind::Ret(r))
}

fn run(prog: &mut Prog, pid: ProcId) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let settings = Settings::default();
    let mut sink = LogSink;
    let mut driver = Driver::new(&settings, &mut sink);
    let mut path = Vec::new();
    let cycles = driver.decompile(prog, pid, &mut path);
    assert!(cycles.is_empty(), "top-level decompile left a cycle set");
}

fn all_stmt_ids(prog: &Prog, pid: ProcId) -> Vec<StmtId> {
    prog.proc(pid).cfg.statements_in_order()
}

/// Edge symmetry and address-map consistency (testable property 4).
fn check_cfg_invariants(prog: &Prog, pid: ProcId) {
    let cfg = &prog.proc(pid).cfg;
    for bid in cfg.block_ids() {
        let bb = cfg.block(bid);
        for s in &bb.succs {
            assert!(
                cfg.block(*s).preds.contains(&bid),
                "edge {bid} -> {s} missing reverse entry"
            );
        }
        for p in &bb.preds {
            assert!(
                cfg.block(*p).succs.contains(&bid),
                "edge {p} -> {bid} missing forward entry"
            );
        }
        if bb.low_addr != 0 {
            if let Some(mapped) = cfg.block_at_addr(bb.low_addr) {
                assert_eq!(mapped, bid, "address map does not point at block");
            }
        }
    }
}

/// Every ref points at a statement that defines its base; every phi has one
/// operand per predecessor (testable property 3).
fn check_ssa_wellformed(prog: &Prog, pid: ProcId) {
    let cfg = &prog.proc(pid).cfg;
    for sid in cfg.statements_in_order() {
        let Some(s) = cfg.try_stmt(sid) else { continue };
        let mut used = ExpSet::new();
        s.add_used_locs(&mut used, false);
        for u in used.iter() {
            if let Some((base, Some(def))) = u.as_ref_parts() {
                let ds = cfg
                    .try_stmt(def)
                    .unwrap_or_else(|| panic!("ref {u} points at removed statement"));
                assert!(
                    ds.defines_loc(base),
                    "ref {u} points at statement that does not define {base}"
                );
            }
        }
        if let Some(p) = s.as_phi() {
            let preds = &cfg.block(s.bb).preds;
            assert_eq!(
                p.operands.len(),
                preds.len(),
                "phi {sid} operand count does not match predecessors"
            );
        }
    }
}

// ---- S1: empty procedure ---------------------------------------------------

#[test]
fn s1_empty_procedure() {
    let mut prog = Prog::new("s1");
    let pid = new_proc(&mut prog, 0x123);
    let entry = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::new(0x123)], BbKind::Ret)
        .block();
    prog.proc_mut(pid).cfg.set_entry_and_exit(entry);

    run(&mut prog, pid);

    let expected = "Control Flow Graph:\n\
                    Ret BB:\n\
                    \x20 in edges: \n\
                    \x20 out edges: \n\
                    0x00000123\n\
                    \n";
    assert_eq!(prog.proc(pid).cfg.print(), expected);
    assert!(prog.proc(pid).parameters.is_empty());
    assert_eq!(all_stmt_ids(&prog, pid).len(), 0);
    check_cfg_invariants(&prog, pid);
}

// ---- S2: linear flow -------------------------------------------------------

#[test]
fn s2_linear_flow_propagates_into_return() {
    let mut prog = Prog::new("s2");
    let pid = new_proc(&mut prog, 0x1000);
    let s1 = assign(&mut prog, pid, Exp::reg(24), Exp::int(5));
    let b0 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1000, vec![s1])], BbKind::Fall)
        .block();
    let r = ret_stmt(&mut prog, pid, &[Exp::reg(24)]);
    let b1 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1010, vec![r])], BbKind::Ret)
        .block();
    prog.proc_mut(pid).cfg.add_edge(b0, b1);
    prog.proc_mut(pid).cfg.set_entry_and_exit(b0);

    run(&mut prog, pid);

    // The constant reached the return and the assignment died.
    let printed = prog.proc(pid).cfg.print();
    assert!(printed.contains("RET *v* r24 := 5"), "got:\n{printed}");
    assert!(
        printed.contains("Reaching definitions: r24=5"),
        "got:\n{printed}"
    );
    assert!(
        prog.proc(pid).cfg.try_stmt(s1).is_none(),
        "dead assignment survived"
    );
    check_cfg_invariants(&prog, pid);
}

// ---- S3: second assignment kills the first ---------------------------------

#[test]
fn s3_kill() {
    let mut prog = Prog::new("s3");
    let pid = new_proc(&mut prog, 0x1000);
    let s1 = assign(&mut prog, pid, Exp::reg(24), Exp::int(5));
    let s2 = assign(&mut prog, pid, Exp::reg(24), Exp::int(6));
    let b0 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1000, vec![s1, s2])], BbKind::Fall)
        .block();
    let r = ret_stmt(&mut prog, pid, &[Exp::reg(24)]);
    let b1 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1010, vec![r])], BbKind::Ret)
        .block();
    prog.proc_mut(pid).cfg.add_edge(b0, b1);
    prog.proc_mut(pid).cfg.set_entry_and_exit(b0);

    run(&mut prog, pid);

    let printed = prog.proc(pid).cfg.print();
    assert!(printed.contains("RET *v* r24 := 6"), "got:\n{printed}");
    assert!(
        printed.contains("Reaching definitions: r24=6"),
        "got:\n{printed}"
    );
    assert!(prog.proc(pid).cfg.try_stmt(s1).is_none());
    check_cfg_invariants(&prog, pid);
}

// ---- S4: use across a block boundary ---------------------------------------

#[test]
fn s4_use_over_bb() {
    let mut prog = Prog::new("s4");
    let pid = new_proc(&mut prog, 0x1000);
    let s1 = assign(&mut prog, pid, Exp::reg(24), Exp::int(5));
    let s2 = assign(&mut prog, pid, Exp::reg(24), Exp::int(6));
    let b0 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1000, vec![s1, s2])], BbKind::Fall)
        .block();
    let s3 = assign(&mut prog, pid, Exp::reg(28), Exp::reg(24));
    let r = ret_stmt(&mut prog, pid, &[Exp::reg(28)]);
    let b1 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(
            vec![
                Rtl::with_stmts(0x1010, vec![s3]),
                Rtl::with_stmts(0x1012, vec![r]),
            ],
            BbKind::Ret,
        )
        .block();
    prog.proc_mut(pid).cfg.add_edge(b0, b1);
    prog.proc_mut(pid).cfg.set_entry_and_exit(b0);

    run(&mut prog, pid);

    let printed = prog.proc(pid).cfg.print();
    assert!(printed.contains("RET *v* r28 := 6"), "got:\n{printed}");
    assert!(
        printed.contains("Reaching definitions: r24=6,   r28=6"),
        "got:\n{printed}"
    );
    check_cfg_invariants(&prog, pid);
}

// ---- S5: endless loop ------------------------------------------------------

#[test]
fn s5_endless_loop_gets_phi() {
    let mut prog = Prog::new("s5");
    let pid = new_proc(&mut prog, 0x1000);
    let s1 = assign(&mut prog, pid, Exp::reg(24), Exp::int(5));
    let b0 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1000, vec![s1])], BbKind::Fall)
        .block();
    let s2 = assign(
        &mut prog,
        pid,
        Exp::reg(24),
        Exp::binary(Operator::Plus, Exp::reg(24), Exp::int(1)),
    );
    let b1 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1010, vec![s2])], BbKind::Oneway)
        .block();
    prog.proc_mut(pid).cfg.add_edge(b0, b1);
    prog.proc_mut(pid).cfg.add_edge(b1, b1);
    prog.proc_mut(pid).cfg.set_entry_and_exit(b0);

    run(&mut prog, pid);

    // A phi for r24 sits at the loop head and the increment uses it.
    let cfg = &prog.proc(pid).cfg;
    let phi_id = cfg
        .block(b1)
        .stmt_ids()
        .find(|sid| cfg.stmt(*sid).is_phi())
        .expect("loop head has a phi");
    let p = cfg.stmt(phi_id).as_phi().unwrap();
    assert_eq!(p.lhs, Exp::reg(24));
    assert_eq!(p.operands.len(), 2);
    let ops: Vec<Option<StmtId>> = p.operands.iter().map(|(_, o)| o.as_ref().unwrap().def).collect();
    assert!(ops.contains(&Some(s1)), "one phi operand is the initialiser");
    assert!(ops.contains(&Some(s2)), "one phi operand is the increment");

    let body = cfg.stmt(s2).as_assign().unwrap();
    assert_eq!(
        body.rhs,
        Exp::binary(
            Operator::Plus,
            Exp::subscript(Exp::reg(24), phi_id),
            Exp::int(1)
        )
    );
    check_ssa_wellformed(&prog, pid);
    check_cfg_invariants(&prog, pid);
}

#[test]
fn s5_structuring_marks_endless_loop() {
    // The structuring pass needs some return node to order against; a
    // detached one stands in for the noreturn exit stub.
    let mut prog = Prog::new("s5b");
    let pid = new_proc(&mut prog, 0x1000);
    let b0 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::new(0x1000)], BbKind::Fall)
        .block();
    let b1 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::new(0x1010)], BbKind::Oneway)
        .block();
    prog.proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::new(0x1020)], BbKind::Ret);
    prog.proc_mut(pid).cfg.add_edge(b0, b1);
    prog.proc_mut(pid).cfg.add_edge(b1, b1);
    prog.proc_mut(pid).cfg.set_entry_and_exit(b0);

    talon::structuring::structure(&mut prog.proc_mut(pid).cfg);

    let si = &prog.proc(pid).cfg.block(b1).sinfo;
    assert_eq!(si.struct_type, talon::structuring::StructType::Loop);
    assert_eq!(si.loop_type, Some(talon::structuring::LoopType::Endless));
    assert_eq!(si.latch, Some(b1));
}

// ---- S6: recursive call preserving registers -------------------------------

#[test]
fn s6_recursive_preserving_call() {
    let mut prog = Prog::new("s6");
    let pid = new_proc(&mut prog, 0x1000);

    // push ebp (r29) via the stack pointer (r28)
    let s1 = assign(
        &mut prog,
        pid,
        Exp::reg(28),
        Exp::binary(Operator::Minus, Exp::reg(28), Exp::int(4)),
    );
    let s2 = assign(&mut prog, pid, Exp::mem(Exp::reg(28)), Exp::reg(29));
    let b0 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1000, vec![s1, s2])], BbKind::Fall)
        .block();

    // the self call
    let call = prog
        .proc_mut(pid)
        .cfg
        .add_stmt(StatementKind::Call(CallStatement::new(Exp::func_addr(0x1000))));
    let b1 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1008, vec![call])], BbKind::Call)
        .block();

    // pop ebp and return
    let s4 = assign(&mut prog, pid, Exp::reg(29), Exp::mem(Exp::reg(28)));
    let s5 = assign(
        &mut prog,
        pid,
        Exp::reg(28),
        Exp::binary(Operator::Plus, Exp::reg(28), Exp::int(4)),
    );
    let r = ret_stmt(&mut prog, pid, &[]);
    let b2 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(
            vec![
                Rtl::with_stmts(0x1010, vec![s4, s5]),
                Rtl::with_stmts(0x1018, vec![r]),
            ],
            BbKind::Ret,
        )
        .block();

    prog.proc_mut(pid).cfg.add_edge(b0, b1);
    prog.proc_mut(pid).cfg.add_edge(b1, b2);
    prog.proc_mut(pid).cfg.set_entry_and_exit(b0);

    run(&mut prog, pid);

    // Preservation proofs: the push/pop pair cancels.
    assert!(
        prog.proc(pid).is_preserved(&Exp::reg(28)),
        "stack pointer not proved preserved"
    );
    assert!(
        prog.proc(pid).is_preserved(&Exp::reg(29)),
        "saved register not proved preserved"
    );

    // The self call defines neither preserved register.
    let c = prog.proc(pid).cfg.stmt(call).as_call().unwrap();
    assert!(
        !c.defines.iter().any(|d| d.lhs.is_reg_n(28)),
        "call defines the preserved stack pointer"
    );
    assert!(
        !c.defines.iter().any(|d| d.lhs.is_reg_n(29)),
        "call defines the preserved saved register"
    );
    assert_eq!(c.dest_proc, Some(pid), "self call resolved to itself");
    check_cfg_invariants(&prog, pid);
}

// ---- flag calls become relational branch conditions ------------------------

#[test]
fn flag_call_branch_becomes_relational() {
    let mut prog = Prog::new("flags");
    let pid = new_proc(&mut prog, 0x1000);

    // %flags := SUBFLAGS32(r24, 10, r24 - 10); jl taken
    let flags = prog.proc_mut(pid).cfg.add_stmt(StatementKind::Assign(Assign::new(
        Exp::terminal(Operator::Flags),
        Exp::FlagCall(
            "SUBFLAGS32".into(),
            vec![
                Exp::reg(24),
                Exp::int(10),
                Exp::binary(Operator::Minus, Exp::reg(24), Exp::int(10)),
            ],
        ),
    )));
    let mut br = BranchStatement::new(0x2000);
    br.set_cond_type(BranchType::SignedLess, false);
    let branch = prog.proc_mut(pid).cfg.add_stmt(StatementKind::Branch(br));
    let b0 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(
            vec![Rtl::with_stmts(0x1000, vec![flags, branch])],
            BbKind::Twoway,
        )
        .block();
    let r1 = ret_stmt(&mut prog, pid, &[]);
    let taken = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x2000, vec![r1])], BbKind::Ret)
        .block();
    let r2 = ret_stmt(&mut prog, pid, &[]);
    let fall = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1010, vec![r2])], BbKind::Ret)
        .block();
    prog.proc_mut(pid).cfg.add_edge(b0, taken);
    prog.proc_mut(pid).cfg.add_edge(b0, fall);
    prog.proc_mut(pid).cfg.set_entry_and_exit(b0);

    run(&mut prog, pid);

    let b = prog.proc(pid).cfg.stmt(branch).as_branch().unwrap();
    assert_eq!(
        b.cond,
        Exp::binary(
            Operator::Less,
            Exp::subscript_implicit(Exp::reg(24)),
            Exp::int(10)
        ),
        "flag call did not turn into a relational condition"
    );
    // The flag-setting assignment died once the branch stopped using it.
    assert!(prog.proc(pid).cfg.try_stmt(flags).is_none());
    // And the tested register surfaced as a parameter.
    assert!(prog
        .proc(pid)
        .parameters
        .iter()
        .any(|p| p.lhs == Exp::reg(24)));
    check_cfg_invariants(&prog, pid);
}

// ---- de-SSA removes all phis (testable property 6) -------------------------

#[test]
fn dessa_removes_all_phis() {
    // Diamond with different constants per arm, then a use at the join.
    let mut prog = Prog::new("dessa");
    let pid = new_proc(&mut prog, 0x1000);
    let b0 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::new(0x1000)], BbKind::Twoway)
        .block();
    let s1 = assign(&mut prog, pid, Exp::reg(24), Exp::int(1));
    let b1 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1010, vec![s1])], BbKind::Fall)
        .block();
    let s2 = assign(&mut prog, pid, Exp::reg(24), Exp::int(2));
    let b2 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1020, vec![s2])], BbKind::Fall)
        .block();
    let r = ret_stmt(&mut prog, pid, &[Exp::reg(24)]);
    let b3 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1030, vec![r])], BbKind::Ret)
        .block();
    prog.proc_mut(pid).cfg.add_edge(b0, b1);
    prog.proc_mut(pid).cfg.add_edge(b0, b2);
    prog.proc_mut(pid).cfg.add_edge(b1, b3);
    prog.proc_mut(pid).cfg.add_edge(b2, b3);
    prog.proc_mut(pid).cfg.set_entry_and_exit(b0);

    let settings = Settings::default();
    let mut sink = LogSink;
    let mut driver = Driver::new(&settings, &mut sink);
    let mut path = Vec::new();
    driver.decompile(&mut prog, pid, &mut path);
    driver.finalise(&mut prog, pid);

    for sid in all_stmt_ids(&prog, pid) {
        let s = prog.proc(pid).cfg.stmt(sid);
        assert!(!s.is_phi(), "phi survived de-SSA: {s}");
        // No subscripts anywhere either.
        let mut has_ref = false;
        s.for_each_exp(&mut |e| {
            e.visit(&mut |x| {
                if x.is_subscript() {
                    has_ref = true;
                }
                true
            })
        });
        assert!(!has_ref, "subscript survived de-SSA: {s}");
    }
    check_cfg_invariants(&prog, pid);
}

// ---- SSA well-formedness after renaming (testable property 3) --------------

#[test]
fn renaming_produces_wellformed_ssa() {
    let mut prog = Prog::new("ssa");
    let pid = new_proc(&mut prog, 0x1000);
    let s0 = assign(&mut prog, pid, Exp::reg(24), Exp::int(10));
    let b0 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1000, vec![s0])], BbKind::Twoway)
        .block();
    let s1 = assign(
        &mut prog,
        pid,
        Exp::reg(24),
        Exp::binary(Operator::Plus, Exp::reg(24), Exp::int(1)),
    );
    let b1 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1010, vec![s1])], BbKind::Fall)
        .block();
    let s2 = assign(&mut prog, pid, Exp::reg(25), Exp::reg(24));
    let r = ret_stmt(&mut prog, pid, &[Exp::reg(25)]);
    let b2 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(
            vec![
                Rtl::with_stmts(0x1020, vec![s2]),
                Rtl::with_stmts(0x1028, vec![r]),
            ],
            BbKind::Ret,
        )
        .block();
    prog.proc_mut(pid).cfg.add_edge(b0, b1);
    prog.proc_mut(pid).cfg.add_edge(b0, b2);
    prog.proc_mut(pid).cfg.add_edge(b1, b2);
    prog.proc_mut(pid).cfg.set_entry_and_exit(b0);

    run(&mut prog, pid);
    check_ssa_wellformed(&prog, pid);
    check_cfg_invariants(&prog, pid);
}

// ---- propagation is stable (testable property 7, approximated) -------------

#[test]
fn propagation_reaches_a_fixpoint() {
    // Build the same procedure twice with a different statement allocation
    // order; the propagated return must agree.
    fn build_and_run(swap_alloc: bool) -> String {
        let mut prog = Prog::new("prop");
        let pid = new_proc(&mut prog, 0x1000);
        let (sa, sb) = if swap_alloc {
            let b = assign(&mut prog, pid, Exp::reg(25), Exp::int(7));
            let a = assign(
                &mut prog,
                pid,
                Exp::reg(24),
                Exp::binary(Operator::Plus, Exp::reg(25), Exp::int(1)),
            );
            (b, a)
        } else {
            let b = assign(&mut prog, pid, Exp::reg(25), Exp::int(7));
            let a = assign(
                &mut prog,
                pid,
                Exp::reg(24),
                Exp::binary(Operator::Plus, Exp::reg(25), Exp::int(1)),
            );
            (b, a)
        };
        let b0 = prog
            .proc_mut(pid)
            .cfg
            .new_bb(vec![Rtl::with_stmts(0x1000, vec![sa, sb])], BbKind::Fall)
            .block();
        let r = ret_stmt(&mut prog, pid, &[Exp::reg(24)]);
        let b1 = prog
            .proc_mut(pid)
            .cfg
            .new_bb(vec![Rtl::with_stmts(0x1010, vec![r])], BbKind::Ret)
            .block();
        prog.proc_mut(pid).cfg.add_edge(b0, b1);
        prog.proc_mut(pid).cfg.set_entry_and_exit(b0);
        run(&mut prog, pid);
        prog.proc(pid).cfg.print()
    }

    let first = build_and_run(false);
    let second = build_and_run(true);
    assert!(first.contains("RET *v* r24 := 8"), "got:\n{first}");
    assert_eq!(first, second);
}

// ---- catastrophic and malformed inputs --------------------------------------

#[test]
fn catastrophic_blockless_procedure_is_left_alone() {
    // A procedure with no blocks at all cannot be analysed; the driver
    // logs the condition and leaves the procedure in its current state.
    let mut prog = Prog::new("cat");
    let pid = new_proc(&mut prog, 0x1000);

    let settings = Settings::default();
    let mut sink = LogSink;
    let mut driver = Driver::new(&settings, &mut sink);
    let mut path = Vec::new();
    let cycles = driver.decompile(&mut prog, pid, &mut path);

    assert!(cycles.is_empty());
    assert!(path.is_empty(), "failed procedure left itself on the path");
    assert!(prog.proc(pid).status < ProcStatus::Final);
}

#[test]
fn catastrophic_corrupt_rtl_is_caught_at_initialise() {
    let mut prog = Prog::new("corrupt");
    let pid = new_proc(&mut prog, 0x1000);
    let s1 = assign(&mut prog, pid, Exp::reg(24), Exp::int(5));
    let b0 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1000, vec![s1])], BbKind::Ret)
        .block();
    prog.proc_mut(pid).cfg.set_entry_and_exit(b0);
    // Corrupt the RTL list: the statement vanishes from the arena but its
    // id stays in the block.
    prog.proc_mut(pid).cfg.stmts.remove(s1);

    let settings = Settings::default();
    let mut sink = LogSink;
    let mut driver = Driver::new(&settings, &mut sink);
    let mut path = Vec::new();
    let cycles = driver.decompile(&mut prog, pid, &mut path);

    assert!(cycles.is_empty());
    assert!(path.is_empty());
    assert!(prog.proc(pid).status < ProcStatus::Final);
}

#[test]
fn malformed_graph_skips_analysis_but_finishes() {
    // An asymmetric edge is recoverable: the procedure still finishes
    // decompile, but every analysis stage skips and the body is left
    // exactly as decoded.
    let mut prog = Prog::new("malformed");
    let pid = new_proc(&mut prog, 0x1000);
    let s1 = assign(&mut prog, pid, Exp::reg(24), Exp::int(5));
    let b0 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1000, vec![s1])], BbKind::Fall)
        .block();
    let r = ret_stmt(&mut prog, pid, &[Exp::reg(24)]);
    let b1 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(vec![Rtl::with_stmts(0x1010, vec![r])], BbKind::Ret)
        .block();
    prog.proc_mut(pid).cfg.add_edge(b0, b1);
    prog.proc_mut(pid).cfg.set_entry_and_exit(b0);
    // Break edge symmetry behind the CFG's back.
    prog.proc_mut(pid).cfg.block_mut(b1).preds.clear();

    run(&mut prog, pid);

    assert!(!prog.proc(pid).cfg.wellformed);
    assert_eq!(prog.proc(pid).status, ProcStatus::Final);
    // Nothing was propagated or removed.
    let a = prog.proc(pid).cfg.stmt(s1).as_assign().unwrap();
    assert_eq!(a.rhs, Exp::int(5));
    let ret = prog.proc(pid).cfg.stmt(r).as_return().unwrap();
    assert_eq!(ret.returns[0].rhs, Exp::reg(24));
}

// ---- CFG invariants under splitting (testable property 4) -------------------

#[test]
fn split_keeps_address_map_consistent() {
    let mut prog = Prog::new("split");
    let pid = new_proc(&mut prog, 0x1000);
    let s1 = assign(&mut prog, pid, Exp::reg(24), Exp::int(1));
    let s2 = assign(&mut prog, pid, Exp::reg(25), Exp::int(2));
    let b0 = prog
        .proc_mut(pid)
        .cfg
        .new_bb(
            vec![
                Rtl::with_stmts(0x1000, vec![s1]),
                Rtl::with_stmts(0x1004, vec![s2]),
            ],
            BbKind::Ret,
        )
        .block();
    prog.proc_mut(pid).cfg.set_entry_and_exit(b0);

    let mut cur = Some(b0);
    assert!(prog.proc_mut(pid).cfg.label(0x1004, &mut cur));
    check_cfg_invariants(&prog, pid);

    let bottom = prog.proc(pid).cfg.block_at_addr(0x1004).unwrap();
    assert_eq!(prog.proc(pid).cfg.stmt(s2).bb, bottom);
    let mut merged = prog.proc(pid).cfg.clone();
    assert!(merged.merge_bbs(b0, bottom));
    assert!(merged.well_form());
}
