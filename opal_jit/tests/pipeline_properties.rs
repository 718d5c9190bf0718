//! End-to-end behavioral contracts of the optimization pipeline.
//!
//! Every test drives the public `compile` entry point over a built
//! graph and checks a property of the result: optimized graphs keep
//! their observable behavior, stamps bound every computed value,
//! schedules respect dominance, and the documented reductions happen.

use opal_core::{CancelToken, SplitMix64};
use opal_jit::interp::{Interp, Outcome, Value};
use opal_jit::ir::{
    ClassId, CmpOp, FieldId, Graph, GraphBuilder, IntArith, MethodId, Op, Stamp, ValKind,
};
use opal_jit::opt::Canonicalize;
use opal_jit::{compile, CompileConfig, CompileOutput, CompileStats, Phase, PhaseContext};

fn compiled(graph: &mut Graph, config: &CompileConfig) -> CompileOutput {
    let cancel = CancelToken::new();
    compile(graph, config, &cancel).expect("compile failed")
}

fn run_on(graph: &Graph, params: &[Value]) -> Outcome {
    Interp::new(graph).run(params).expect("interpreter failed")
}

/// `result = x + 0` boxed and immediately unboxed on both arms of a
/// branch. Canonicalization folds the add, escape analysis removes both
/// allocations, and the merged value collapses back to the parameter.
fn boxed_roundtrip() -> Graph {
    let mut b = GraphBuilder::new();
    let x = b.param(0, ValKind::I32);
    let cond = b.param(1, ValKind::I32);
    let zero = b.const_i32(0);
    let sum = b.int_add(x, zero);
    let c = b.int_cmp(CmpOp::Ne, cond, zero);
    let mem = b.tail().memory;
    let (t, f) = b.branch(c);
    b.seek(t, mem);
    let bt = b.new_box(ClassId(7), ValKind::I32, sum);
    let yt = b.unbox(ValKind::I32, bt);
    let t_exit = b.tail();
    b.seek(f, mem);
    let bf = b.new_box(ClassId(7), ValKind::I32, sum);
    let yf = b.unbox(ValKind::I32, bf);
    let f_exit = b.tail();
    let region = b.merge(&[t_exit, f_exit]);
    let phi = b.phi(region, ValKind::I32, &[yt, yf]);
    b.ret(Some(phi));
    b.finish()
}

/// One arm keeps its allocation virtual, the other lets it escape
/// through a call. The merge must materialize the virtual arm.
fn one_arm_escapes() -> Graph {
    let mut b = GraphBuilder::new();
    let p = b.param(0, ValKind::I32);
    let zero = b.const_i32(0);
    let k42 = b.const_i32(42);
    let c = b.int_cmp(CmpOp::Ne, p, zero);
    let mem = b.tail().memory;
    let (t, f) = b.branch(c);
    b.seek(t, mem);
    let o1 = b.new_object(ClassId(3), 1);
    b.store_field(o1, FieldId(0), p);
    let t_exit = b.tail();
    b.seek(f, mem);
    let o2 = b.new_object(ClassId(3), 1);
    b.store_field(o2, FieldId(0), k42);
    b.call(MethodId(9), None, &[o2]);
    let f_exit = b.tail();
    let region = b.merge(&[t_exit, f_exit]);
    let obj = b.phi(region, ValKind::Ref, &[o1, o2]);
    let v = b.load_field(obj, FieldId(0), ValKind::I32);
    b.ret(Some(v));
    b.finish()
}

/// Triangular sum with a loop-invariant multiply in the body.
fn loop_sum() -> Graph {
    let mut b = GraphBuilder::new();
    let n = b.param(0, ValKind::I32);
    let m = b.param(1, ValKind::I32);
    let zero = b.const_i32(0);
    let one = b.const_i32(1);

    let header = b.loop_begin();
    let j = b.loop_phi(header, ValKind::I32, zero);
    let acc = b.loop_phi(header, ValKind::I32, zero);
    let c = b.int_cmp(CmpOp::Lt, j, n);
    let mem = b.tail().memory;
    let (body, exit) = b.branch(c);

    b.seek(body, mem);
    let stride = b.int_mul(m, m);
    let term = b.int_mul(j, stride);
    let acc2 = b.int_add(acc, term);
    let j2 = b.int_add(j, one);
    b.loop_end(header);
    b.seal_loop_phi(j, j2);
    b.seal_loop_phi(acc, acc2);

    b.seek(exit, mem);
    b.ret(Some(acc));
    b.finish()
}

#[test]
fn test_boxed_roundtrip_reduces_to_the_parameter() {
    let mut g = boxed_roundtrip();
    let out = compiled(&mut g, &CompileConfig::default());

    assert_eq!(out.stats.allocs_virtualized, 2);
    assert_eq!(out.stats.allocs_materialized, 0);
    for (_, node) in g.iter_live() {
        assert!(
            !matches!(
                node.op,
                Op::New { .. } | Op::NewArray { .. } | Op::NewBox { .. } | Op::Unbox { .. }
            ),
            "allocation survived: {:?}",
            node.op
        );
    }

    // The returned value is the parameter itself, not a phi over copies.
    let returns: Vec<_> = g
        .node(g.end)
        .inputs
        .iter()
        .filter(|id| id.is_valid() && matches!(g.op(*id), Op::Return))
        .collect();
    assert_eq!(returns.len(), 1);
    let value = g.node(returns[0]).inputs.get(1).expect("return value");
    assert!(matches!(g.op(value), Op::Parameter { index: 0, .. }));

    for x in [-5i32, 0, 1, 123456] {
        for cond in [0i32, 1] {
            let got = run_on(&g, &[Value::I32(x), Value::I32(cond)]);
            assert!(
                got.same_as(&Outcome::Returned(Some(Value::I32(x)))),
                "x={x} cond={cond}: {got:?}"
            );
        }
    }
}

#[test]
fn test_merge_of_virtual_and_escaped_materializes() {
    let before = one_arm_escapes();
    let mut g = one_arm_escapes();
    let out = compiled(&mut g, &CompileConfig::default());

    assert!(out.stats.allocs_materialized >= 1);

    for p in [-7i32, 0, 3] {
        let want = run_on(&before, &[Value::I32(p)]);
        let got = run_on(&g, &[Value::I32(p)]);
        assert!(got.same_as(&want), "p={p}: {want:?} vs {got:?}");
    }
}

#[test]
fn test_stamps_bound_every_interpreted_value() {
    let mut b = GraphBuilder::new();
    let p0 = b.param(0, ValKind::I32);
    let p1 = b.param(1, ValKind::I32);
    let mask = b.const_i32(255);
    let ten = b.const_i32(10);
    let three = b.const_i32(3);
    let low = b.int_arith(IntArith::And, 32, p0, mask);
    let shifted = b.int_add(low, ten);
    let scaled = b.int_mul(shifted, three);
    let mixed = b.int_add(scaled, p1);
    b.ret(Some(mixed));
    let mut g = b.finish();
    let _ = compiled(&mut g, &CompileConfig::default());

    let mut rng = SplitMix64::new(0x5eed);
    for _ in 0..64 {
        let a = rng.next_u64() as i32;
        let c = rng.next_u64() as i32;
        let mut interp = Interp::new(&g);
        interp
            .run(&[Value::I32(a), Value::I32(c)])
            .expect("interpreter failed");
        for (id, node) in g.iter_live() {
            if !node.op.is_pure() {
                continue;
            }
            let Stamp::Int(stamp) = g.stamp(id) else {
                continue;
            };
            let value = match interp.eval(id).expect("eval failed") {
                Value::I32(v) => v as i64,
                Value::I64(v) => v,
                other => panic!("int stamp on non-int value {other:?}"),
            };
            assert!(
                stamp.contains(value),
                "node {id} computed {value} outside {stamp:?}"
            );
        }
    }
}

#[test]
fn test_schedule_respects_dominance_and_hoists_invariants() {
    let mut g = loop_sum();
    let out = compiled(&mut g, &CompileConfig::default());
    let sched = &out.schedule;

    for (id, node) in g.iter_live() {
        let Some(block) = sched.block_of(id) else {
            continue;
        };
        if matches!(g.op(id), Op::Phi { .. } | Op::MemoryPhi) || g.op(id).is_block_leader() {
            continue;
        }
        for input in node.inputs.iter() {
            if !input.is_valid() {
                continue;
            }
            let Some(in_block) = sched.block_of(input) else {
                continue;
            };
            assert!(
                sched.dominates(in_block, block),
                "{input} in {in_block:?} does not dominate its use {id} in {block:?}"
            );
        }
    }

    // The m*m multiply does not depend on the loop and leaves it.
    let invariant = g
        .iter_live()
        .find(|(_, n)| {
            matches!(n.op, Op::IntOp { op: IntArith::Mul, .. })
                && n.inputs.get(0) == n.inputs.get(1)
        })
        .map(|(id, _)| id)
        .expect("invariant multiply folded away");
    let block = sched.block_of(invariant).expect("invariant unscheduled");
    assert_eq!(sched.loop_depth(block), 0);

    // 0*9 + 1*9 + ... + 4*9
    let got = run_on(&g, &[Value::I32(5), Value::I32(3)]);
    assert!(got.same_as(&Outcome::Returned(Some(Value::I32(90)))));
}

#[test]
fn test_canonicalize_second_run_changes_nothing() {
    let mut g = boxed_roundtrip();
    let config = CompileConfig::default();
    let cancel = CancelToken::new();
    let mut stats = CompileStats::default();
    let mut ctx = PhaseContext::new(&config, &cancel, &mut stats);
    let mut phase = Canonicalize;
    phase.run(&mut g, &mut ctx).expect("first run failed");

    let settled = g.edit_count();
    phase.run(&mut g, &mut ctx).expect("second run failed");
    assert_eq!(g.edit_count(), settled, "canonicalization is not idempotent");
}

#[test]
fn test_fuzzed_phase_orders_agree_with_the_default() {
    let inputs = [-3i32, 0, 5];
    let mut reference = one_arm_escapes();
    compiled(&mut reference, &CompileConfig::default());
    let want: Vec<Outcome> = inputs
        .iter()
        .map(|&p| run_on(&reference, &[Value::I32(p)]))
        .collect();

    for seed in 0..8u64 {
        let mut g = one_arm_escapes();
        let config = CompileConfig {
            fuzz_seed: Some(seed),
            ..CompileConfig::default()
        };
        compiled(&mut g, &config);
        for (&p, expect) in inputs.iter().zip(&want) {
            let got = run_on(&g, &[Value::I32(p)]);
            assert!(got.same_as(expect), "seed {seed} p={p}: {expect:?} vs {got:?}");
        }
    }
}
