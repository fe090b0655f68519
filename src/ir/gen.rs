//! The IR generator: lowers a typed [`ast::Function`] to an [`IRFunction`].
//!
//! The central design decision (spec-mandated, not the original compiler's):
//! **no phi nodes**. A variable that is ever reassigned is *stack-resident*
//! — every read is a `Load` from its frame slot and every write is a
//! `Store` to it — so control-flow merges (an `if`/`else` that both assign
//! the same variable, a loop body that mutates one) are simply sequences
//! of stores to the same slot, with no merge instruction required.
//! Function parameters and pure temporaries that are never reassigned stay
//! register-resident: they are plain vregs, left for `codegen::regalloc`
//! to place in a physical register or spill.

use std::collections::HashSet;

use crate::common::Id;
use crate::diag::{Category, Sink};
use crate::front::ast::{self, BinOp, DataType, ExprKind, StmtKind, UnaryOp};

use super::instr::{IRFunction, IRInstruction, Opcode, VReg, INVALID_VREG};
use super::symtab::{Binding, SymbolTable};

struct Gen<'a> {
    f: IRFunction,
    symtab: SymbolTable,
    filename: &'a str,
    sink: &'a mut Sink,
}

/// Lower one function definition. Prototypes (no body) have nothing to
/// generate and return `None`; a generation failure (which should not
/// happen for a program `sema` has already accepted) records a `Codegen`
/// diagnostic and also returns `None`, so one bad function never corrupts
/// the functions generated around it.
pub fn gen_function(func: &ast::Function, filename: &str, sink: &mut Sink) -> Option<IRFunction> {
    let body = func.body.as_ref()?;

    let mut gen = Gen {
        f: IRFunction::new(func.name),
        symtab: SymbolTable::new(),
        filename,
        sink,
    };

    let had_errors = gen.sink.error_count();
    let reassigned = collect_reassigned_names(body);

    for param in &func.params {
        let vreg = gen.f.alloc_vreg();
        if reassigned.contains(&param.name) {
            let slot = gen.f.alloc_stack_slot();
            gen.f.emit(store_inst(slot, vreg, param.ty));
            gen.symtab.add(param.name, Binding::Stack(slot));
        } else {
            gen.symtab.add(param.name, Binding::Register(vreg));
        }
    }

    gen.gen_block(body);

    if !matches!(body.stmts.last().map(|s| &s.kind), Some(StmtKind::Return(_))) {
        gen.f.emit(IRInstruction::new(Opcode::Ret));
    }

    let result = gen.f;
    if gen.sink.error_count() > had_errors {
        return None;
    }
    Some(result)
}

fn store_inst(slot: usize, src: VReg, ty: DataType) -> IRInstruction {
    let mut inst = IRInstruction::new(Opcode::Store);
    inst.stack_slot = slot;
    inst.src1 = src;
    inst.ty = ty;
    inst
}

fn load_inst(dest: VReg, slot: usize, ty: DataType) -> IRInstruction {
    let mut inst = IRInstruction::new(Opcode::Load);
    inst.dest = dest;
    inst.stack_slot = slot;
    inst.ty = ty;
    inst
}

fn collect_reassigned_names(block: &ast::Block) -> HashSet<Id> {
    let mut names = HashSet::new();
    collect_in_block(block, &mut names);
    names
}

fn collect_in_block(block: &ast::Block, names: &mut HashSet<Id>) {
    for stmt in &block.stmts {
        collect_in_stmt(stmt, names);
    }
}

fn collect_in_stmt(stmt: &ast::Stmt, names: &mut HashSet<Id>) {
    match &stmt.kind {
        StmtKind::Assign { name, .. } => {
            names.insert(*name);
        }
        StmtKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            collect_in_block(then_branch, names);
            if let Some(e) = else_branch {
                collect_in_block(e, names);
            }
        }
        StmtKind::While { body, .. } => collect_in_block(body, names),
        StmtKind::Block(b) => collect_in_block(b, names),
        StmtKind::VarDecl { .. } | StmtKind::Return(_) | StmtKind::ExprStmt(_) => {}
    }
}

fn binop_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Add,
        BinOp::Sub => Opcode::Sub,
        BinOp::Mul => Opcode::Mul,
        BinOp::Div => Opcode::Div,
        BinOp::And => Opcode::And,
        BinOp::Or => Opcode::Or,
        BinOp::Xor => Opcode::Xor,
        BinOp::Shl => Opcode::Shl,
        BinOp::Shr => Opcode::Shr,
        BinOp::Eq => Opcode::CmpEq,
        BinOp::Ne => Opcode::CmpNe,
        BinOp::Lt => Opcode::CmpLt,
        BinOp::Le => Opcode::CmpLe,
        BinOp::Gt => Opcode::CmpGt,
        BinOp::Ge => Opcode::CmpGe,
        BinOp::LogicalAnd | BinOp::LogicalOr => {
            unreachable!("short-circuit operators are rejected before reaching codegen")
        }
    }
}

impl<'a> Gen<'a> {
    fn error(&mut self, line: u32, column: u32, message: impl Into<String>) {
        self.sink.error(Category::Codegen, Some(self.filename), line, column, message);
    }

    fn gen_block(&mut self, block: &ast::Block) {
        self.symtab.enter_scope();
        for stmt in &block.stmts {
            self.gen_stmt(stmt);
        }
        self.symtab.exit_scope();
    }

    fn gen_stmt(&mut self, stmt: &ast::Stmt) {
        match &stmt.kind {
            StmtKind::VarDecl {
                name,
                declared_type,
                init,
            } => {
                let value = match init {
                    Some(e) => self.gen_expr(e),
                    None => {
                        let dest = self.f.alloc_vreg();
                        let mut inst = IRInstruction::new(Opcode::Const);
                        inst.dest = dest;
                        inst.imm = 0;
                        inst.ty = *declared_type;
                        self.f.emit(inst);
                        dest
                    }
                };
                let slot = self.f.alloc_stack_slot();
                self.f.emit(store_inst(slot, value, *declared_type));
                self.symtab.add(*name, Binding::Stack(slot));
            }
            StmtKind::Assign { name, value } => {
                let v = self.gen_expr(value);
                match self.symtab.lookup(*name) {
                    Some(Binding::Stack(slot)) => self.f.emit(store_inst(slot, v, value.value_type)),
                    Some(Binding::Register(_)) => {
                        self.error(
                            stmt.line,
                            stmt.column,
                            format!("internal error: '{name}' was not promoted to stack-resident before being assigned"),
                        );
                    }
                    None => self.error(stmt.line, stmt.column, format!("assignment to undeclared variable '{name}'")),
                }
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond_vreg = self.gen_expr(cond);
                let else_label = self.f.alloc_label();
                let end_label = self.f.alloc_label();

                let mut branch = IRInstruction::new(Opcode::BranchZero);
                branch.src1 = cond_vreg;
                branch.label_id = else_label;
                self.f.emit(branch);

                self.gen_block(then_branch);

                let mut jump = IRInstruction::new(Opcode::Jump);
                jump.label_id = end_label;
                self.f.emit(jump);

                let mut else_lbl = IRInstruction::new(Opcode::Label);
                else_lbl.label_id = else_label;
                self.f.emit(else_lbl);

                if let Some(else_branch) = else_branch {
                    self.gen_block(else_branch);
                }

                let mut end_lbl = IRInstruction::new(Opcode::Label);
                end_lbl.label_id = end_label;
                self.f.emit(end_lbl);
            }
            StmtKind::While { cond, body } => {
                let start_label = self.f.alloc_label();
                let end_label = self.f.alloc_label();

                let mut start_lbl = IRInstruction::new(Opcode::Label);
                start_lbl.label_id = start_label;
                self.f.emit(start_lbl);

                let cond_vreg = self.gen_expr(cond);
                let mut branch = IRInstruction::new(Opcode::BranchZero);
                branch.src1 = cond_vreg;
                branch.label_id = end_label;
                self.f.emit(branch);

                self.gen_block(body);

                let mut jump = IRInstruction::new(Opcode::Jump);
                jump.label_id = start_label;
                self.f.emit(jump);

                let mut end_lbl = IRInstruction::new(Opcode::Label);
                end_lbl.label_id = end_label;
                self.f.emit(end_lbl);
            }
            StmtKind::Return(expr) => {
                let value = expr.as_ref().map(|e| self.gen_expr(e)).unwrap_or(INVALID_VREG);
                let mut inst = IRInstruction::new(Opcode::Ret);
                inst.src1 = value;
                self.f.emit(inst);
            }
            StmtKind::Block(b) => self.gen_block(b),
            StmtKind::ExprStmt(e) => {
                self.gen_expr(e);
            }
        }
    }

    fn gen_expr(&mut self, expr: &ast::Expr) -> VReg {
        match &expr.kind {
            ExprKind::IntLiteral(v) => {
                let dest = self.f.alloc_vreg();
                let mut inst = IRInstruction::new(Opcode::Const);
                inst.dest = dest;
                inst.imm = *v;
                inst.ty = expr.value_type;
                self.f.emit(inst);
                dest
            }
            ExprKind::Identifier(name) => match self.symtab.lookup(*name) {
                Some(Binding::Register(vreg)) => vreg,
                Some(Binding::Stack(slot)) => {
                    let dest = self.f.alloc_vreg();
                    self.f.emit(load_inst(dest, slot, expr.value_type));
                    dest
                }
                None => {
                    self.error(expr.line, expr.column, format!("reference to undeclared variable '{name}'"));
                    INVALID_VREG
                }
            },
            ExprKind::Binary { op, lhs, rhs } => {
                if op.is_short_circuit() {
                    self.error(
                        expr.line,
                        expr.column,
                        "short-circuit operators ('&&', '||') are not supported by code generation",
                    );
                    return INVALID_VREG;
                }
                let l = self.gen_expr(lhs);
                let r = self.gen_expr(rhs);
                let dest = self.f.alloc_vreg();
                let mut inst = IRInstruction::new(binop_opcode(*op));
                inst.dest = dest;
                inst.src1 = l;
                inst.src2 = r;
                inst.ty = expr.value_type;
                self.f.emit(inst);
                dest
            }
            ExprKind::Unary { op, operand } => {
                let v = self.gen_expr(operand);
                let dest = self.f.alloc_vreg();
                let opcode = match op {
                    UnaryOp::Negate => Opcode::Neg,
                    UnaryOp::Not => Opcode::LogicalNot,
                    UnaryOp::BitNot => Opcode::BitNot,
                };
                let mut inst = IRInstruction::new(opcode);
                inst.dest = dest;
                inst.src1 = v;
                inst.ty = expr.value_type;
                self.f.emit(inst);
                dest
            }
            ExprKind::Call { callee, args } => {
                // Evaluate every argument (which may itself contain calls)
                // before emitting any `Arg`, so a nested call's own Args
                // can never land between this call's Args and its Call.
                let values: Vec<VReg> = args.iter().map(|arg| self.gen_expr(arg)).collect();
                for (i, v) in values.into_iter().enumerate() {
                    let mut inst = IRInstruction::new(Opcode::Arg);
                    inst.src1 = v;
                    inst.imm = i as i64;
                    self.f.emit(inst);
                }
                let dest = self.f.alloc_vreg();
                let mut inst = IRInstruction::new(Opcode::Call);
                inst.dest = dest;
                inst.func_name = Some(*callee);
                inst.ty = expr.value_type;
                self.f.emit(inst);
                dest
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::lex::Lexer;
    use crate::front::parse::parse;

    fn gen_first_function(src: &str) -> IRFunction {
        let mut sink = Sink::new();
        let tokens = Lexer::new(src, "<test>").tokenize(&mut sink);
        let unit = parse(&tokens, "<test>", &mut sink);
        assert!(!sink.has_errors());
        gen_function(&unit.functions[0], "<test>", &mut sink).expect("generation should succeed")
    }

    #[test]
    fn reassigned_local_uses_load_store_not_phi() {
        let f = gen_first_function("int main() { int x = 1; if (1) { x = 2; } return x; }");
        let stores = f.instructions().filter(|i| i.opcode == Opcode::Store).count();
        let loads = f.instructions().filter(|i| i.opcode == Opcode::Load).count();
        assert!(stores >= 2);
        assert!(loads >= 1);
    }

    #[test]
    fn reassigned_parameter_is_promoted_to_stack() {
        let f = gen_first_function("int inc(int x) { x = x + 1; return x; }");
        assert!(f.instructions().any(|i| i.opcode == Opcode::Store));
    }

    #[test]
    fn pure_temporary_stays_register_resident() {
        let f = gen_first_function("int add(int a, int b) { return a + b; }");
        assert!(!f.instructions().any(|i| i.opcode == Opcode::Store));
    }

    #[test]
    fn short_circuit_operator_is_rejected() {
        let mut sink = Sink::new();
        let tokens = Lexer::new("int main() { return 1 && 0; }", "<test>").tokenize(&mut sink);
        let unit = parse(&tokens, "<test>", &mut sink);
        assert!(gen_function(&unit.functions[0], "<test>", &mut sink).is_none());
        assert!(sink.has_errors());
    }

    #[test]
    fn while_loop_emits_matching_labels() {
        let f = gen_first_function("int main() { int i = 0; while (i) { i = i; } return i; }");
        let labels: Vec<_> = f.instructions().filter(|i| i.opcode == Opcode::Label).collect();
        assert_eq!(labels.len(), 2);
    }
}
