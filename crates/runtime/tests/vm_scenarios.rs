//! End-to-end scenarios, hand-assembled.
//!
//! Each test mirrors a source program a collaborating compiler would
//! emit, exercising the call protocol, closures, upvalues, defers and
//! exception unwinding together.

mod common;

use alder_core::opcode::Op;
use alder_core::{Value, values_equal};
use alder_runtime::VmError;
use common::{Asm, run_capture};

/// `fn fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2); }`
/// `print(fib(10));` → 55, through the i32 fast paths.
#[test]
fn test_fibonacci_recursion() {
    let mut fib = Asm::new("fib");
    fib.chunk.arity = 1;
    fib.op(Op::GetLocal).byte(1);
    fib.small(2);
    fib.op(Op::LessI32);
    let else_site = fib.emit_jump(Op::JumpIfFalsePop);
    fib.op(Op::GetLocal).byte(1);
    fib.op(Op::Return);
    fib.patch(else_site);
    fib.get_global("fib");
    fib.op(Op::GetLocal).byte(1);
    fib.small(1);
    fib.op(Op::SubI32);
    fib.op(Op::Call).byte(1);
    fib.get_global("fib");
    fib.op(Op::GetLocal).byte(1);
    fib.small(2);
    fib.op(Op::SubI32);
    fib.op(Op::Call).byte(1);
    fib.op(Op::AddI32);
    fib.op(Op::Return);

    let mut script = Asm::new("<script>");
    let fib_const = script.func(fib.finish());
    script.closure0(fib_const);
    script.define_global("fib");
    script.get_global("fib");
    script.small(10);
    script.op(Op::Call).byte(1);
    script.op(Op::Print).byte(1);
    script.ret_null();

    let (result, output) = run_capture(script.finish());
    result.unwrap();
    assert_eq!(output, "55\n");
}

/// `fn make() { let x = 0; return fn() { x = x + 1; return x; }; }`
/// Three calls through the same closure print 1, 2, 3.
#[test]
fn test_closure_captures_count() {
    let mut inner = Asm::new("counter");
    inner.op(Op::GetUpvalue).byte(0);
    inner.small(1);
    inner.op(Op::Add);
    inner.op(Op::SetUpvalue).byte(0);
    inner.op(Op::Return);

    let mut make = Asm::new("make");
    let inner_const = make.func(inner.finish());
    make.small(0); // let x = 0 at slot 1
    make.op(Op::Closure).u16(inner_const).byte(1);
    make.byte(1); // is_local
    make.byte(1); // slot 1
    make.op(Op::Return);

    let mut script = Asm::new("<script>");
    let make_const = script.func(make.finish());
    script.closure0(make_const);
    script.define_global("make");
    script.get_global("make");
    script.op(Op::Call).byte(0);
    script.define_global("c");
    for _ in 0..3 {
        script.get_global("c");
        script.op(Op::Call).byte(0);
        script.op(Op::Print).byte(1);
    }
    script.ret_null();

    let (result, output) = run_capture(script.finish());
    result.unwrap();
    assert_eq!(output, "1\n2\n3\n");
}

/// Defers run LIFO on function exit, after the finally clause:
/// output is exactly `x`, `fin`, `d2`, `d1`.
#[test]
fn test_try_finally_defer_order() {
    let mut d1 = Asm::new("d1");
    d1.push_str("d1");
    d1.op(Op::Print).byte(1);
    d1.ret_null();

    let mut d2 = Asm::new("d2");
    d2.push_str("d2");
    d2.op(Op::Print).byte(1);
    d2.ret_null();

    let mut f = Asm::new("f");
    let d1_const = f.func(d1.finish());
    let d2_const = f.func(d2.finish());
    f.op(Op::Defer).u16(d1_const);
    f.op(Op::Defer).u16(d2_const);
    let (catch_site, finally_site, base) = f.begin_try();
    f.push_str("x");
    f.op(Op::Throw);
    f.op(Op::EndTry);
    f.set_try_offset(catch_site, base);
    f.op(Op::Catch);
    f.op(Op::Print).byte(1);
    f.op(Op::EndTry);
    f.set_try_offset(finally_site, base);
    f.push_str("fin");
    f.op(Op::Print).byte(1);
    f.op(Op::EndTry);
    f.ret_null();

    let mut script = Asm::new("<script>");
    let f_const = script.func(f.finish());
    script.closure0(f_const);
    script.define_global("f");
    script.get_global("f");
    script.op(Op::Call).byte(0);
    script.op(Op::Pop);
    script.ret_null();

    let (result, output) = run_capture(script.finish());
    result.unwrap();
    assert_eq!(output, "x\nfin\nd2\nd1\n");
}

/// A chunk that survives the wire format runs identically.
#[test]
fn test_serialized_chunk_runs_identically() {
    let mut fib = Asm::new("fib");
    fib.chunk.arity = 1;
    fib.op(Op::GetLocal).byte(1);
    fib.small(2);
    fib.op(Op::LessI32);
    let else_site = fib.emit_jump(Op::JumpIfFalsePop);
    fib.op(Op::GetLocal).byte(1);
    fib.op(Op::Return);
    fib.patch(else_site);
    fib.get_global("fib");
    fib.op(Op::GetLocal).byte(1);
    fib.small(1);
    fib.op(Op::SubI32);
    fib.op(Op::Call).byte(1);
    fib.get_global("fib");
    fib.op(Op::GetLocal).byte(1);
    fib.small(2);
    fib.op(Op::SubI32);
    fib.op(Op::Call).byte(1);
    fib.op(Op::AddI32);
    fib.op(Op::Return);

    let mut script = Asm::new("<script>");
    let fib_const = script.func(fib.finish());
    script.closure0(fib_const);
    script.define_global("fib");
    script.get_global("fib");
    script.small(12);
    script.op(Op::Call).byte(1);
    script.op(Op::Print).byte(1);
    script.ret_null();
    let chunk = script.finish();

    let bytes = alder_core::serialize(&chunk);
    let (_, direct_output) = run_capture(chunk);
    let revived = alder_core::deserialize(&bytes).unwrap();
    let (result, wire_output) = run_capture(revived);
    result.unwrap();
    assert_eq!(direct_output, "144\n");
    assert_eq!(wire_output, direct_output);
}

/// Tail calls reuse the frame: a 5000-deep tail recursion completes
/// under the 1024-frame limit.
#[test]
fn test_tail_call_reuses_frame() {
    let mut countdown = Asm::new("countdown");
    countdown.chunk.arity = 1;
    countdown.op(Op::GetLocal).byte(1);
    countdown.small(0);
    countdown.op(Op::EqualI32);
    let recurse = countdown.emit_jump(Op::JumpIfFalsePop);
    countdown.op(Op::GetLocal).byte(1);
    countdown.op(Op::Return);
    countdown.patch(recurse);
    countdown.get_global("countdown");
    countdown.op(Op::GetLocal).byte(1);
    countdown.small(1);
    countdown.op(Op::SubI32);
    countdown.op(Op::TailCall).byte(1);

    let mut script = Asm::new("<script>");
    let countdown_const = script.func(countdown.finish());
    script.closure0(countdown_const);
    script.define_global("countdown");
    script.get_global("countdown");
    let n = script.i64(5000);
    script.op(Op::Const).u16(n);
    script.op(Op::Call).byte(1);
    script.op(Op::Print).byte(1);
    script.ret_null();

    let (result, output) = run_capture(script.finish());
    result.unwrap();
    assert_eq!(output, "0\n");
}

/// The same recursion through plain `CALL` exhausts the frame stack and
/// dies with an uncatchable error.
#[test]
fn test_deep_plain_recursion_is_fatal() {
    let mut countdown = Asm::new("countdown");
    countdown.chunk.arity = 1;
    countdown.op(Op::GetLocal).byte(1);
    countdown.small(0);
    countdown.op(Op::EqualI32);
    let recurse = countdown.emit_jump(Op::JumpIfFalsePop);
    countdown.op(Op::GetLocal).byte(1);
    countdown.op(Op::Return);
    countdown.patch(recurse);
    countdown.get_global("countdown");
    countdown.op(Op::GetLocal).byte(1);
    countdown.small(1);
    countdown.op(Op::SubI32);
    countdown.op(Op::Call).byte(1);
    countdown.op(Op::Return);

    let mut script = Asm::new("<script>");
    let countdown_const = script.func(countdown.finish());
    script.closure0(countdown_const);
    script.define_global("countdown");
    script.get_global("countdown");
    let n = script.i64(5000);
    script.op(Op::Const).u16(n);
    script.op(Op::Call).byte(1);
    script.ret_null();

    let (result, _) = run_capture(script.finish());
    match result {
        Err(VmError::Fatal(fatal)) => {
            assert!(fatal.to_string().contains("call depth"));
        }
        other => panic!("expected fatal frame overflow, got {other:?}"),
    }
}

/// Uncaught exceptions carry the payload and the frame trace.
#[test]
fn test_uncaught_exception_reports_trace() {
    let mut inner = Asm::new("inner");
    inner.push_str("boom");
    inner.op(Op::Throw);
    inner.ret_null();

    let mut script = Asm::new("<script>");
    let inner_const = script.func(inner.finish());
    script.closure0(inner_const);
    script.define_global("inner");
    script.get_global("inner");
    script.op(Op::Call).byte(0);
    script.ret_null();

    let (result, _) = run_capture(script.finish());
    match result {
        Err(VmError::Uncaught(exc)) => {
            assert!(values_equal(&exc.payload, &Value::string("boom")));
            let rendered = VmError::Uncaught(exc).to_string();
            assert!(rendered.starts_with("Uncaught exception: boom"));
            assert!(rendered.contains("at inner"));
            assert!(rendered.contains("at <script>"));
        }
        other => panic!("expected uncaught exception, got {other:?}"),
    }
}

/// A catch in the caller receives an exception thrown two frames down,
/// and the intervening frame's defers still run.
#[test]
fn test_exception_crosses_frames_running_defers() {
    let mut thrower = Asm::new("thrower");
    thrower.push_str("deep");
    thrower.op(Op::Throw);
    thrower.ret_null();

    let mut cleanup = Asm::new("cleanup");
    cleanup.push_str("cleanup");
    cleanup.op(Op::Print).byte(1);
    cleanup.ret_null();

    let mut middle = Asm::new("middle");
    let cleanup_const = middle.func(cleanup.finish());
    middle.op(Op::Defer).u16(cleanup_const);
    middle.get_global("thrower");
    middle.op(Op::Call).byte(0);
    middle.op(Op::Pop);
    middle.ret_null();

    let mut script = Asm::new("<script>");
    let thrower_const = script.func(thrower.finish());
    let middle_const = script.func(middle.finish());
    script.closure0(thrower_const);
    script.define_global("thrower");
    script.closure0(middle_const);
    script.define_global("middle");
    let (catch_site, finally_site, base) = script.begin_try();
    script.get_global("middle");
    script.op(Op::Call).byte(0);
    script.op(Op::Pop);
    script.op(Op::EndTry);
    script.set_try_offset(catch_site, base);
    script.op(Op::Catch);
    script.op(Op::Print).byte(1);
    script.op(Op::EndTry);
    script.set_try_offset(finally_site, base);
    script.op(Op::EndTry);
    script.ret_null();

    let (result, output) = run_capture(script.finish());
    result.unwrap();
    assert_eq!(output, "cleanup\ndeep\n");
}

/// Returning from inside a try routes through the finally block first.
#[test]
fn test_return_through_finally() {
    let mut f = Asm::new("f");
    let (catch_site, finally_site, base) = f.begin_try();
    f.small(7);
    f.op(Op::Return);
    f.op(Op::EndTry);
    // The catch operand keeps its 0xFFFF placeholder: no catch clause.
    let _ = catch_site;
    f.set_try_offset(finally_site, base);
    f.push_str("fin");
    f.op(Op::Print).byte(1);
    f.op(Op::EndTry);
    f.ret_null();

    let mut script = Asm::new("<script>");
    let f_const = script.func(f.finish());
    script.closure0(f_const);
    script.define_global("f");
    script.get_global("f");
    script.op(Op::Call).byte(0);
    script.op(Op::Print).byte(1);
    script.ret_null();

    let (result, output) = run_capture(script.finish());
    result.unwrap();
    assert_eq!(output, "fin\n7\n");
}
