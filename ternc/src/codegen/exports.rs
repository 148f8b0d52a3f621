//! The host boundary of an artifact.
//!
//! The host sees only i32 values and the exchange buffer. The functions
//! here translate between that view and the reference-typed outcomes the
//! rest of the module works with:
//!
//! - `tern_outcome_status` writes the outcome's record into the exchange
//!   buffer through the imported writers and returns its status word.
//! - `tern_outcome_continuation` extracts the continuation of a pending
//!   effect.
//! - `tern_resume` validates a host-written scalar and resumes with it.
//! - One wrapper per exported function boxes i32 arguments and always
//!   returns an outcome.

use tern_abi::layout::{names, outcome, request, status};
use tern_abi::wire::{self, tag};

use super::abi::{OwnerKind, OwnerSig};
use super::context::{CodegenContext, OwnerFuncs};
use crate::error::CompileResult;
use crate::ice_err;
use crate::mir::TrapKind;
use crate::span::Span;
use crate::target::{BlockType, FuncBuilder, Heap, Instr, ValType};

/// Define and export the fixed boundary functions and the memory.
pub fn define_boundary(cx: &mut CodegenContext<'_>) -> CompileResult<()> {
    define_outcome_status(cx)?;
    define_outcome_continuation(cx)?;
    define_resume(cx)?;

    let ty = cx.module.func_type(vec![], vec![ValType::I32]);
    let idx = cx.module.declare_func(names::EXCHANGE_LEN, ty);
    let mut f = FuncBuilder::new(0);
    f.emit(Instr::GlobalGet(cx.rt.exchange_len));
    let (locals, body) = f.finish();
    cx.module.define(idx, locals, body)?;
    cx.module.export_func(names::EXCHANGE_LEN, idx);

    cx.module.export_memory(names::MEMORY);
    Ok(())
}

/// Store a negative writer result in `written` and return it.
fn propagate_failure(f: &mut FuncBuilder, written: u32) {
    let failed = f.label();
    f.emit(Instr::LocalGet(written))
        .emit(Instr::I32Const(0))
        .emit(Instr::I32LtS)
        .emit(Instr::If(failed, BlockType::Empty))
        .emit(Instr::LocalGet(written))
        .emit(Instr::Return)
        .emit(Instr::End);
}

fn define_outcome_status(cx: &mut CodegenContext<'_>) -> CompileResult<()> {
    let abi = cx.abi;
    let rt = cx.rt;
    let scratch = cx.config.scratch_offset();
    let max_args = cx.config.max_host_args() as i32;

    let ty = cx.module.func_type(vec![ValType::AnyRef], vec![ValType::I32]);
    let idx = cx.module.declare_func(names::OUTCOME_STATUS, ty);

    // params: outcome
    let mut f = FuncBuilder::new(1);
    let value = f.local(ValType::AnyRef);
    let req = f.local(ValType::AnyRef);
    let args = f.local(ValType::AnyRef);
    let arg = f.local(ValType::AnyRef);
    let scalar_tag = f.local(ValType::I32);
    let payload = f.local(ValType::I32);
    let argc = f.local(ValType::I32);
    let i = f.local(ValType::I32);
    let written = f.local(ValType::I32);

    // Final value: one scalar record.
    let is_value = f.label();
    let non_null = f.label();
    let boxed = f.label();
    f.emit(Instr::LocalGet(0))
        .extend(cx.get(abi.outcome, outcome::TAG))
        .emit(Instr::I32Const(outcome::VALUE))
        .emit(Instr::I32Eq)
        .emit(Instr::If(is_value, BlockType::Empty))
        .emit(Instr::LocalGet(0))
        .extend(cx.get(abi.outcome, outcome::PAYLOAD))
        .emit(Instr::LocalSet(value))
        .emit(Instr::I32Const(tag::UNIT as i32))
        .emit(Instr::LocalSet(scalar_tag))
        .emit(Instr::LocalGet(value))
        .emit(Instr::RefIsNull)
        .emit(Instr::I32Eqz)
        .emit(Instr::If(non_null, BlockType::Empty))
        .emit(Instr::I32Const(tag::REF as i32))
        .emit(Instr::LocalSet(scalar_tag))
        .emit(Instr::LocalGet(value))
        .emit(Instr::RefTest(Heap::Concrete(abi.int)))
        .emit(Instr::If(boxed, BlockType::Empty))
        .emit(Instr::I32Const(tag::INT as i32))
        .emit(Instr::LocalSet(scalar_tag))
        .emit(Instr::LocalGet(value))
        .extend(cx.get(abi.int, 0))
        .emit(Instr::LocalSet(payload))
        .emit(Instr::End)
        .emit(Instr::End)
        .emit(Instr::LocalGet(scalar_tag))
        .emit(Instr::LocalGet(payload))
        .emit(Instr::Call(rt.write_scalar))
        .emit(Instr::LocalSet(written));
    propagate_failure(&mut f, written);
    f.emit(Instr::LocalGet(written))
        .emit(Instr::GlobalSet(rt.exchange_len))
        .emit(Instr::I32Const(status::VALUE))
        .emit(Instr::Return)
        .emit(Instr::End);

    // Pending effect: arguments go to the scratch area first.
    let too_many = f.label();
    let done = f.label();
    let top = f.label();
    let not_int = f.label();
    f.emit(Instr::LocalGet(0))
        .extend(cx.get(abi.outcome, outcome::PAYLOAD))
        .emit(Instr::LocalSet(req))
        .emit(Instr::LocalGet(req))
        .extend(cx.get(abi.request, request::ARGS))
        .emit(Instr::LocalSet(args))
        .emit(Instr::LocalGet(args))
        .emit(cx.cast(abi.slots))
        .emit(Instr::ArrayLen)
        .emit(Instr::LocalSet(argc))
        .emit(Instr::LocalGet(argc))
        .emit(Instr::I32Const(max_args))
        .emit(Instr::I32GtS)
        .emit(Instr::If(too_many, BlockType::Empty))
        .emit(Instr::I32Const(wire::OVERFLOW))
        .emit(Instr::Return)
        .emit(Instr::End)
        .emit(Instr::I32Const(0))
        .emit(Instr::LocalSet(i))
        .emit(Instr::Block(done, BlockType::Empty))
        .emit(Instr::Loop(top, BlockType::Empty))
        .emit(Instr::LocalGet(i))
        .emit(Instr::LocalGet(argc))
        .emit(Instr::I32GeS)
        .emit(Instr::BrIf(done))
        .emit(Instr::LocalGet(args))
        .emit(cx.cast(abi.slots))
        .emit(Instr::LocalGet(i))
        .emit(Instr::ArrayGet(abi.slots))
        .emit(Instr::LocalSet(arg))
        .emit(Instr::LocalGet(arg))
        .emit(Instr::RefTest(Heap::Concrete(abi.int)))
        .emit(Instr::I32Eqz)
        .emit(Instr::If(not_int, BlockType::Empty))
        .emit(Instr::I32Const(wire::MALFORMED))
        .emit(Instr::Return)
        .emit(Instr::End)
        .emit(Instr::LocalGet(i))
        .emit(Instr::I32Const(4))
        .emit(Instr::I32Mul)
        .emit(Instr::LocalGet(arg))
        .extend(cx.get(abi.int, 0))
        .emit(Instr::I32Store(scratch))
        .emit(Instr::LocalGet(i))
        .emit(Instr::I32Const(1))
        .emit(Instr::I32Add)
        .emit(Instr::LocalSet(i))
        .emit(Instr::Br(top))
        .emit(Instr::End)
        .emit(Instr::End);
    for field in [
        request::EFFECT_HI,
        request::EFFECT_LO,
        request::OP_ID,
        request::OP_INDEX,
        request::RESUME_KIND,
        request::HANDLE,
    ] {
        f.emit(Instr::LocalGet(req)).extend(cx.get(abi.request, field));
    }
    f.emit(Instr::LocalGet(argc))
        .emit(Instr::I32Const(scratch as i32))
        .emit(Instr::Call(rt.write_request))
        .emit(Instr::LocalSet(written));
    propagate_failure(&mut f, written);
    f.emit(Instr::LocalGet(written))
        .emit(Instr::GlobalSet(rt.exchange_len))
        .emit(Instr::I32Const(status::EFFECT));

    let (locals, body) = f.finish();
    cx.module.define(idx, locals, body)?;
    cx.module.export_func(names::OUTCOME_STATUS, idx);
    Ok(())
}

fn define_outcome_continuation(cx: &mut CodegenContext<'_>) -> CompileResult<()> {
    let abi = cx.abi;
    let ty = cx.module.func_type(vec![ValType::AnyRef], vec![ValType::AnyRef]);
    let idx = cx.module.declare_func(names::OUTCOME_CONTINUATION, ty);
    let mut f = FuncBuilder::new(1);
    let finished = f.label();
    f.emit(Instr::LocalGet(0))
        .extend(cx.get(abi.outcome, outcome::TAG))
        .emit(Instr::I32Const(outcome::EFFECT))
        .emit(Instr::I32Ne)
        .emit(Instr::If(finished, BlockType::Empty))
        .emit(Instr::RefNull(Heap::Any))
        .emit(Instr::Return)
        .emit(Instr::End)
        .emit(Instr::LocalGet(0))
        .extend(cx.get(abi.outcome, outcome::PAYLOAD))
        .extend(cx.get(abi.request, request::CONT));
    let (locals, body) = f.finish();
    cx.module.define(idx, locals, body)?;
    cx.module.export_func(names::OUTCOME_CONTINUATION, idx);
    Ok(())
}

fn define_resume(cx: &mut CodegenContext<'_>) -> CompileResult<()> {
    let rt = cx.rt;
    let ty = cx.module.func_type(
        vec![ValType::AnyRef, ValType::I32, ValType::I32],
        vec![ValType::AnyRef],
    );
    let idx = cx.module.declare_func(names::RESUME, ty);

    // params: cont, ptr, len
    let mut f = FuncBuilder::new(3);
    let scalar_tag = f.local(ValType::I32);
    let value = f.local(ValType::AnyRef);
    let (rejected, is_unit, is_word) = (f.label(), f.label(), f.label());
    f.emit(Instr::LocalGet(1))
        .emit(Instr::LocalGet(2))
        .emit(Instr::Call(rt.read_scalar))
        .emit(Instr::I32Const(0))
        .emit(Instr::I32LtS)
        .emit(Instr::If(rejected, BlockType::Empty))
        .emit(Instr::Unreachable)
        .emit(Instr::End)
        .emit(Instr::LocalGet(1))
        .emit(Instr::I32Load(0))
        .emit(Instr::LocalSet(scalar_tag))
        .emit(Instr::LocalGet(scalar_tag))
        .emit(Instr::I32Const(tag::UNIT as i32))
        .emit(Instr::I32Eq)
        .emit(Instr::If(is_unit, BlockType::Empty))
        .emit(Instr::RefNull(Heap::Any))
        .emit(Instr::LocalSet(value))
        .emit(Instr::Else)
        .emit(Instr::LocalGet(scalar_tag))
        .emit(Instr::I32Const(tag::BOOL as i32))
        .emit(Instr::I32Eq)
        .emit(Instr::LocalGet(scalar_tag))
        .emit(Instr::I32Const(tag::INT as i32))
        .emit(Instr::I32Eq)
        .emit(Instr::I32Or)
        .emit(Instr::If(is_word, BlockType::Empty))
        .emit(Instr::LocalGet(1))
        .emit(Instr::I32Load(4))
        .emit(Instr::Call(rt.box_int))
        .emit(Instr::LocalSet(value))
        .emit(Instr::Else)
        .emit(Instr::Unreachable)
        .emit(Instr::End)
        .emit(Instr::End)
        .emit(Instr::LocalGet(0))
        .emit(Instr::LocalGet(value))
        .emit(Instr::Call(rt.resume));
    let (locals, body) = f.finish();
    cx.module.define(idx, locals, body)?;
    cx.module.export_func(names::RESUME, idx);
    cx.trap(
        names::RESUME,
        TrapKind::BadResumeValue,
        Span::dummy(),
        "host scalar record was rejected by read_scalar",
    );
    cx.trap(
        names::RESUME,
        TrapKind::BadResumeValue,
        Span::dummy(),
        "resume value is neither unit, bool nor int",
    );
    Ok(())
}

/// Export `name(i32..) -> outcome` calling a top-level function.
pub fn define_wrapper(
    cx: &mut CodegenContext<'_>,
    sig: &OwnerSig,
    funcs: OwnerFuncs,
    name: &str,
) -> CompileResult<()> {
    if sig.kind != OwnerKind::Function {
        return Err(ice_err!(Span::dummy(), "only functions can be exported"; "owner" => sig.name.clone()));
    }
    let ty = cx
        .module
        .func_type(vec![ValType::I32; sig.arity], vec![ValType::AnyRef]);
    let idx = cx.module.declare_func(format!("{}$export", sig.name), ty);
    let effectful = sig.convention.is_effectful();

    let mut f = FuncBuilder::new(sig.arity);
    if !effectful {
        f.emit(Instr::I32Const(outcome::VALUE));
    } else {
        f.emit(Instr::RefNull(Heap::Any));
    }
    for i in 0..sig.arity {
        f.emit(Instr::LocalGet(i as u32)).emit(Instr::Call(cx.rt.box_int));
    }
    f.emit(Instr::Call(funcs.entry));
    if !effectful {
        f.emit(Instr::StructNew(cx.abi.outcome));
    }
    let (locals, body) = f.finish();
    cx.module.define(idx, locals, body)?;
    cx.module.export_func(name, idx);
    tracing::debug!(export = name, owner = %sig.name, effectful, "exported function");
    Ok(())
}
