//! The two-pass machine-code builder: run every encoder once against a
//! [`CodeBuilder::sizing`] to predict the function's total size, allocate
//! exactly that many bytes, then run the *same* encoders again against
//! [`CodeBuilder::emitting`]. If the two passes ever disagree on size, an
//! encoder must have branched on something the sizing pass couldn't see —
//! that is a codegen bug, not a recoverable diagnostic, so it is reported
//! as a hard [`CodegenError`] rather than silently truncating code.
//!
//! Grounded in `original_source/srcs/jit/jit.c`'s `jit_compile_function`
//! (the two-pass shape, `encode_prologue` called twice) and
//! `srcs/jit/encoders.c`/`helpers.c` (the per-opcode encoding sequences).

use std::collections::HashMap;

use crate::common::Id;
use crate::ir::instr::{IRFunction, IRInstruction, Label, Opcode, VReg, INVALID_VREG};

use super::regalloc::{Allocation, Location};
use super::x86::{CodeBuilder, Condition, Reg, ARG_REGISTERS, CALLEE_SAVED_POOL};

#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("internal error: two-pass encoding for '{name}' disagreed on size (predicted {predicted}, actual {actual})")]
    SizeMismatch { name: Id, predicted: usize, actual: usize },
    #[error("internal error: '{name}' jumps to a label that was never defined")]
    UnresolvedLabel { name: Id },
}

/// One call site needing the linker to patch in a real function address,
/// given as a byte offset within this function's own code.
pub struct CallSite {
    pub patch_offset: usize,
    pub target_name: Id,
}

pub struct CompiledFunction {
    pub name: Id,
    pub code: Vec<u8>,
    pub call_sites: Vec<CallSite>,
}

/// Per-build bookkeeping: label offsets discovered so far, forward-jump
/// patch records still waiting on their label, and the queue of
/// evaluated-but-not-yet-passed call arguments (mirrors the original's
/// `pending_call`, but scoped to one build instead of a file global).
#[derive(Default)]
struct Ctx {
    label_offsets: HashMap<Label, usize>,
    pending_jumps: HashMap<Label, Vec<usize>>,
    arg_queue: Vec<VReg>,
    call_sites: Vec<CallSite>,
}

/// Round a required byte count up to a frame size that keeps `%rsp`
/// 16-byte aligned at `call` sites: after `push rbp` (itself 8-aligning)
/// and five callee-saved pushes (40 bytes, `40 % 16 == 8`), the frame
/// needs to add a further `8 mod 16` bytes to land back on a 16 boundary.
fn frame_size(required_bytes: usize) -> usize {
    let base = (required_bytes + 15) & !15;
    base + 8
}

fn local_disp(combined_slot: usize) -> i32 {
    -(((combined_slot + 1) * 8) as i32)
}

fn spill_disp(stack_count: usize, spill_idx: usize) -> i32 {
    local_disp(stack_count + spill_idx)
}

fn load_location_to_reg(b: &mut CodeBuilder, alloc: &Allocation, stack_count: usize, dst: Reg, vreg: VReg) {
    if vreg == INVALID_VREG {
        b.xor(dst, dst);
        return;
    }
    match alloc.get_location(vreg) {
        Location::Register(r) => {
            if r != dst {
                b.mov_reg_reg(dst, r);
            }
        }
        Location::Spill(idx) => b.load_rbp_rel(dst, spill_disp(stack_count, idx)),
    }
}

fn store_reg_to_location(b: &mut CodeBuilder, alloc: &Allocation, stack_count: usize, vreg: VReg, src: Reg) {
    match alloc.get_location(vreg) {
        Location::Register(r) => {
            if r != src {
                b.mov_reg_reg(r, src);
            }
        }
        Location::Spill(idx) => b.store_rbp_rel(src, spill_disp(stack_count, idx)),
    }
}

/// Load the right-hand operand either directly (if it already lives in a
/// register — our allocator's pool never overlaps the scratch registers
/// used here, so reading it in place is always safe) or via `scratch`.
fn operand_or_scratch(b: &mut CodeBuilder, alloc: &Allocation, stack_count: usize, vreg: VReg, scratch: Reg) -> Reg {
    match alloc.get_location(vreg) {
        Location::Register(r) => r,
        Location::Spill(idx) => {
            b.load_rbp_rel(scratch, spill_disp(stack_count, idx));
            scratch
        }
    }
}

fn condition_for(opcode: Opcode, signed: bool) -> Condition {
    use Opcode::*;
    match (opcode, signed) {
        (CmpEq, _) => Condition::Equal,
        (CmpNe, _) => Condition::NotEqual,
        (CmpLt, true) => Condition::SignedLess,
        (CmpLt, false) => Condition::UnsignedBelow,
        (CmpLe, true) => Condition::SignedLessEqual,
        (CmpLe, false) => Condition::UnsignedBelowEqual,
        (CmpGt, true) => Condition::SignedGreater,
        (CmpGt, false) => Condition::UnsignedAbove,
        (CmpGe, true) => Condition::SignedGreaterEqual,
        (CmpGe, false) => Condition::UnsignedAboveEqual,
        _ => unreachable!("{opcode:?} is not a comparison"),
    }
}

fn encode_prologue(b: &mut CodeBuilder, frame_bytes: usize, param_count: usize, alloc: &Allocation, stack_count: usize) {
    b.push(Reg::Rbp);
    b.mov_reg_reg(Reg::Rbp, Reg::Rsp);
    for r in CALLEE_SAVED_POOL {
        b.push(r);
    }
    if frame_bytes > 0 {
        b.sub_rsp_imm32(frame_bytes as u32);
    }
    for i in 0..param_count {
        let vreg = i + 1;
        // A parameter the body never reads has no live interval, so
        // regalloc never assigned it a location; nothing needs storing.
        if alloc.get_location_opt(vreg).is_none() {
            continue;
        }
        if i < 6 {
            store_reg_to_location(b, alloc, stack_count, vreg, ARG_REGISTERS[i]);
        } else {
            let disp = 16 + 8 * (i as i32 - 6);
            b.load_rbp_rel(Reg::Rax, disp);
            store_reg_to_location(b, alloc, stack_count, vreg, Reg::Rax);
        }
    }
}

fn encode_epilogue(b: &mut CodeBuilder, frame_bytes: usize) {
    if frame_bytes > 0 {
        b.add_rsp_imm32(frame_bytes as u32);
    }
    for r in CALLEE_SAVED_POOL.into_iter().rev() {
        b.pop(r);
    }
    b.pop(Reg::Rbp);
    b.ret();
}

fn encode_bin_arith(b: &mut CodeBuilder, inst: &IRInstruction, alloc: &Allocation, stack_count: usize) {
    load_location_to_reg(b, alloc, stack_count, Reg::Rax, inst.src1);
    let right = operand_or_scratch(b, alloc, stack_count, inst.src2, Reg::Rcx);
    match inst.opcode {
        Opcode::Add => b.add(Reg::Rax, right),
        Opcode::Sub => b.sub(Reg::Rax, right),
        Opcode::And => b.and(Reg::Rax, right),
        Opcode::Or => b.or(Reg::Rax, right),
        Opcode::Xor => b.xor(Reg::Rax, right),
        Opcode::Mul => b.imul(Reg::Rax, right),
        other => unreachable!("{other:?} is not a simple arithmetic op"),
    }
    store_reg_to_location(b, alloc, stack_count, inst.dest, Reg::Rax);
}

fn encode_div(b: &mut CodeBuilder, inst: &IRInstruction, alloc: &Allocation, stack_count: usize) {
    load_location_to_reg(b, alloc, stack_count, Reg::Rax, inst.src1);
    let divisor = operand_or_scratch(b, alloc, stack_count, inst.src2, Reg::Rcx);
    if inst.ty.is_signed() {
        b.cqo();
        b.idiv(divisor);
    } else {
        b.xor(Reg::Rdx, Reg::Rdx);
        b.div(divisor);
    }
    store_reg_to_location(b, alloc, stack_count, inst.dest, Reg::Rax);
}

fn encode_shift(b: &mut CodeBuilder, inst: &IRInstruction, alloc: &Allocation, stack_count: usize) {
    load_location_to_reg(b, alloc, stack_count, Reg::Rax, inst.src1);
    load_location_to_reg(b, alloc, stack_count, Reg::Rcx, inst.src2);
    match inst.opcode {
        Opcode::Shl => b.shl_cl(Reg::Rax),
        Opcode::Shr if inst.ty.is_signed() => b.sar_cl(Reg::Rax),
        Opcode::Shr => b.shr_cl(Reg::Rax),
        other => unreachable!("{other:?} is not a shift"),
    }
    store_reg_to_location(b, alloc, stack_count, inst.dest, Reg::Rax);
}

fn encode_cmp(b: &mut CodeBuilder, inst: &IRInstruction, alloc: &Allocation, stack_count: usize) {
    load_location_to_reg(b, alloc, stack_count, Reg::Rax, inst.src1);
    let right = operand_or_scratch(b, alloc, stack_count, inst.src2, Reg::Rcx);
    b.cmp(Reg::Rax, right);
    b.setcc_and_widen(condition_for(inst.opcode, inst.ty.is_signed()), Reg::Rax);
    store_reg_to_location(b, alloc, stack_count, inst.dest, Reg::Rax);
}

fn encode_unary(b: &mut CodeBuilder, inst: &IRInstruction, alloc: &Allocation, stack_count: usize) {
    load_location_to_reg(b, alloc, stack_count, Reg::Rax, inst.src1);
    match inst.opcode {
        Opcode::Neg => b.neg(Reg::Rax),
        Opcode::BitNot => b.not(Reg::Rax),
        Opcode::LogicalNot => {
            b.test(Reg::Rax, Reg::Rax);
            b.setcc_and_widen(Condition::Equal, Reg::Rax);
        }
        other => unreachable!("{other:?} is not unary"),
    }
    store_reg_to_location(b, alloc, stack_count, inst.dest, Reg::Rax);
}

fn encode_load(b: &mut CodeBuilder, inst: &IRInstruction, alloc: &Allocation, stack_count: usize) {
    b.load_rbp_rel(Reg::Rax, local_disp(inst.stack_slot));
    store_reg_to_location(b, alloc, stack_count, inst.dest, Reg::Rax);
}

fn encode_store(b: &mut CodeBuilder, inst: &IRInstruction, alloc: &Allocation, stack_count: usize) {
    load_location_to_reg(b, alloc, stack_count, Reg::Rax, inst.src1);
    b.store_rbp_rel(Reg::Rax, local_disp(inst.stack_slot));
}

fn encode_arg(inst: &IRInstruction, ctx: &mut Ctx) {
    ctx.arg_queue.push(inst.src1);
}

fn encode_call(b: &mut CodeBuilder, inst: &IRInstruction, ctx: &mut Ctx, alloc: &Allocation, stack_count: usize) {
    let args = std::mem::take(&mut ctx.arg_queue);
    let n = args.len();
    let stack_args = n.saturating_sub(6);
    let needs_alignment = stack_args % 2 != 0;
    if needs_alignment {
        b.sub_rsp_imm32(8);
    }
    // Push stack-passed arguments highest-index first, so the lowest
    // stack-passed index ends up closest to the return address — where
    // the callee's prologue expects to find it, at `[rbp+16]`.
    for &vreg in args.iter().skip(6).rev() {
        match alloc.get_location(vreg) {
            Location::Register(r) => b.push(r),
            Location::Spill(idx) => {
                b.load_rbp_rel(Reg::Rax, spill_disp(stack_count, idx));
                b.push(Reg::Rax);
            }
        }
    }
    for (i, &vreg) in args.iter().take(6).enumerate() {
        load_location_to_reg(b, alloc, stack_count, ARG_REGISTERS[i], vreg);
    }
    let imm_offset = b.call_indirect_placeholder();
    if b.is_emitting() {
        ctx.call_sites.push(CallSite {
            patch_offset: imm_offset,
            target_name: inst.func_name.expect("Call instruction always names its callee"),
        });
    }
    let cleanup = stack_args * 8 + if needs_alignment { 8 } else { 0 };
    if cleanup > 0 {
        b.add_rsp_imm32(cleanup as u32);
    }
    store_reg_to_location(b, alloc, stack_count, inst.dest, Reg::Rax);
}

fn encode_jump(b: &mut CodeBuilder, inst: &IRInstruction, ctx: &mut Ctx) {
    const OPCODE_LEN: i64 = 5;
    if let Some(&target) = ctx.label_offsets.get(&inst.label_id) {
        let rel = target as i64 - (b.offset() as i64 + OPCODE_LEN);
        b.jmp_rel32(rel as i32);
    } else {
        let patch_at = b.offset() + 1;
        b.jmp_rel32(0);
        if b.is_emitting() {
            ctx.pending_jumps.entry(inst.label_id).or_default().push(patch_at);
        }
    }
}

fn encode_branch(b: &mut CodeBuilder, inst: &IRInstruction, ctx: &mut Ctx, alloc: &Allocation, stack_count: usize) {
    const OPCODE_LEN: i64 = 6;
    load_location_to_reg(b, alloc, stack_count, Reg::Rax, inst.src1);
    b.test(Reg::Rax, Reg::Rax);
    let cond = match inst.opcode {
        Opcode::BranchZero => Condition::Equal,
        Opcode::BranchNotZero => Condition::NotEqual,
        other => unreachable!("{other:?} is not a branch"),
    };
    if let Some(&target) = ctx.label_offsets.get(&inst.label_id) {
        let rel = target as i64 - (b.offset() as i64 + OPCODE_LEN);
        b.jcc_rel32(cond, rel as i32);
    } else {
        let patch_at = b.offset() + 2;
        b.jcc_rel32(cond, 0);
        if b.is_emitting() {
            ctx.pending_jumps.entry(inst.label_id).or_default().push(patch_at);
        }
    }
}

fn encode_label(b: &CodeBuilder, inst: &IRInstruction, ctx: &mut Ctx) -> Vec<(usize, u32)> {
    if !b.is_emitting() {
        return Vec::new();
    }
    let here = b.offset();
    ctx.label_offsets.insert(inst.label_id, here);
    ctx.pending_jumps
        .remove(&inst.label_id)
        .unwrap_or_default()
        .into_iter()
        .map(|patch_at| (patch_at, (here as i64 - (patch_at as i64 + 4)) as u32))
        .collect()
}

fn encode_inst(
    b: &mut CodeBuilder,
    inst: &IRInstruction,
    ctx: &mut Ctx,
    alloc: &Allocation,
    stack_count: usize,
    frame_bytes: usize,
) {
    match inst.opcode {
        Opcode::Const => {
            b.mov_imm64(Reg::Rax, inst.imm);
            store_reg_to_location(b, alloc, stack_count, inst.dest, Reg::Rax);
        }
        Opcode::Add | Opcode::Sub | Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Mul => {
            encode_bin_arith(b, inst, alloc, stack_count)
        }
        Opcode::Div => encode_div(b, inst, alloc, stack_count),
        Opcode::Shl | Opcode::Shr => encode_shift(b, inst, alloc, stack_count),
        Opcode::CmpEq | Opcode::CmpNe | Opcode::CmpLt | Opcode::CmpLe | Opcode::CmpGt | Opcode::CmpGe => {
            encode_cmp(b, inst, alloc, stack_count)
        }
        Opcode::Neg | Opcode::LogicalNot | Opcode::BitNot => encode_unary(b, inst, alloc, stack_count),
        Opcode::Load => encode_load(b, inst, alloc, stack_count),
        Opcode::Store => encode_store(b, inst, alloc, stack_count),
        Opcode::Arg => encode_arg(inst, ctx),
        Opcode::Call => encode_call(b, inst, ctx, alloc, stack_count),
        Opcode::Jump => encode_jump(b, inst, ctx),
        Opcode::BranchZero | Opcode::BranchNotZero => encode_branch(b, inst, ctx, alloc, stack_count),
        Opcode::Label => {
            for (patch_at, rel) in encode_label(b, inst, ctx) {
                b.patch_u32(patch_at, rel);
            }
        }
        Opcode::Ret => {
            if inst.src1 == INVALID_VREG {
                b.xor(Reg::Rax, Reg::Rax);
            } else {
                load_location_to_reg(b, alloc, stack_count, Reg::Rax, inst.src1);
            }
            encode_epilogue(b, frame_bytes);
        }
    }
}

fn run_pass(b: &mut CodeBuilder, f: &IRFunction, ctx: &mut Ctx, alloc: &Allocation, param_count: usize, frame_bytes: usize) {
    encode_prologue(b, frame_bytes, param_count, alloc, f.stack_count);
    for inst in f.instructions() {
        encode_inst(b, inst, ctx, alloc, f.stack_count, frame_bytes);
    }
}

/// Encode one function's IR to machine code. Runs the encoder twice
/// (sizing, then emitting) and checks they agree before returning.
pub fn build_function(f: &IRFunction, alloc: &Allocation, param_count: usize) -> Result<CompiledFunction, CodegenError> {
    let frame_bytes = frame_size((f.stack_count + alloc.spill_count) * 8);

    let mut sizer = CodeBuilder::sizing();
    let mut sizing_ctx = Ctx::default();
    run_pass(&mut sizer, f, &mut sizing_ctx, alloc, param_count, frame_bytes);
    let predicted = sizer.offset();

    let mut emitter = CodeBuilder::emitting(predicted);
    let mut ctx = Ctx::default();
    run_pass(&mut emitter, f, &mut ctx, alloc, param_count, frame_bytes);

    if !ctx.pending_jumps.is_empty() {
        return Err(CodegenError::UnresolvedLabel { name: f.name });
    }
    let actual = emitter.offset();
    if actual != predicted {
        return Err(CodegenError::SizeMismatch {
            name: f.name,
            predicted,
            actual,
        });
    }

    Ok(CompiledFunction {
        name: f.name,
        code: emitter.into_bytes(),
        call_sites: ctx.call_sites,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Sink;
    use crate::front::lex::Lexer;
    use crate::front::parse::parse;
    use crate::ir::gen_function;
    use crate::codegen::regalloc::allocate;

    fn build_first_function(src: &str) -> CompiledFunction {
        let mut sink = Sink::new();
        let tokens = Lexer::new(src, "<test>").tokenize(&mut sink);
        let unit = parse(&tokens, "<test>", &mut sink);
        assert!(!sink.has_errors());
        let func = &unit.functions[0];
        let ir = gen_function(func, "<test>", &mut sink).unwrap();
        let alloc = allocate(&ir);
        build_function(&ir, &alloc, func.params.len()).expect("two-pass sizes should agree")
    }

    #[test]
    fn simple_function_builds_nonempty_code() {
        let compiled = build_first_function("int add(int a, int b) { return a + b; }");
        assert!(!compiled.code.is_empty());
        assert!(compiled.code.ends_with(&[0xC3]));
    }

    #[test]
    fn call_site_is_recorded_for_patching() {
        let compiled = build_first_function("int main() { return helper(1); }");
        assert_eq!(compiled.call_sites.len(), 1);
        assert_eq!(compiled.call_sites[0].target_name.to_string(), "helper");
    }

    #[test]
    fn loop_resolves_its_backward_jump() {
        let compiled = build_first_function("int main() { int i = 0; while (i) { i = i + 1; } return i; }");
        assert!(!compiled.code.is_empty());
    }

    #[test]
    fn branch_in_if_else_resolves_forward_jumps() {
        let compiled = build_first_function("int main() { int x = 0; if (1) { x = 1; } else { x = 2; } return x; }");
        assert!(!compiled.code.is_empty());
    }
}
