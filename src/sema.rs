//! Semantic analysis: name resolution, type checking, and function-table
//! construction. Two passes over the translation unit, matching the
//! original's `compile_analyze_all` — first every function signature is
//! declared (so forward references and mutual recursion resolve), then
//! every body is walked and its expressions are given a `value_type`.
//!
//! Grounded in `original_source/srcs/compile/compile.c`
//! (`compile_analyze_all`'s two-pass shape) and `incs/semantic.h`.

use std::collections::BTreeMap;

use crate::common::{Id, Map};
use crate::diag::{Category, Sink};
use crate::front::ast::{self, BinOp, DataType, Expr, ExprKind, Stmt, StmtKind, TranslationUnit, UnaryOp};

#[derive(Clone, Debug)]
pub struct FunctionSignature {
    pub return_type: DataType,
    pub params: Vec<(Id, DataType)>,
    pub is_prototype: bool,
}

/// The whole program's function table, keyed by name. Built in pass one,
/// read (never mutated) during pass two.
#[derive(Default)]
pub struct GlobalScope {
    pub functions: Map<Id, FunctionSignature>,
}

impl GlobalScope {
    pub fn new() -> Self {
        Self::default()
    }

    fn declare(&mut self, func: &ast::Function, filename: &str, sink: &mut Sink) {
        let sig = FunctionSignature {
            return_type: func.return_type,
            params: func.params.iter().map(|p| (p.name, p.ty)).collect(),
            is_prototype: func.is_prototype,
        };
        if let Some(existing) = self.functions.get(&func.name) {
            let compatible = existing.return_type == sig.return_type
                && existing.params.len() == sig.params.len()
                && existing.params.iter().zip(&sig.params).all(|(a, b)| a.1 == b.1);
            if !compatible {
                sink.error(
                    Category::Semantic,
                    Some(filename),
                    func.line,
                    func.column,
                    format!("conflicting declarations of function '{}'", func.name),
                );
                return;
            }
            if !func.is_prototype {
                self.functions.insert(func.name, sig);
            }
        } else {
            self.functions.insert(func.name, sig);
        }
    }
}

/// A per-function lexical scope stack used only to resolve types; unlike
/// `ir::symtab` it has no undo log because the analyzer never backtracks
/// across a whole translation unit, only within one function's nested
/// blocks, where a plain `Vec` push/pop is simplest. It tracks `DataType`,
/// not a vreg or stack slot — the analyzer runs before any of that exists.
struct LocalScopes {
    scopes: Vec<BTreeMap<Id, DataType>>,
}

impl LocalScopes {
    fn new() -> Self {
        LocalScopes { scopes: vec![BTreeMap::new()] }
    }

    fn enter(&mut self) {
        self.scopes.push(BTreeMap::new());
    }

    fn exit(&mut self) {
        self.scopes.pop();
    }

    fn declare(&mut self, name: Id, ty: DataType) {
        self.scopes.last_mut().expect("at least one scope").insert(name, ty);
    }

    fn lookup(&self, name: Id) -> Option<DataType> {
        self.scopes.iter().rev().find_map(|scope| scope.get(&name).copied())
    }
}

struct Analyzer<'a> {
    global: &'a GlobalScope,
    filename: &'a str,
    sink: &'a mut Sink,
    scopes: LocalScopes,
}

/// Analyze every function in a translation unit. Returns the populated
/// global function table. A declaration error abandons only the function
/// it occurs in; sibling functions are still analyzed (spec's
/// recoverable-at-the-translation-unit-level rule).
pub fn analyze(unit: &mut TranslationUnit, filename: &str, sink: &mut Sink) -> GlobalScope {
    let mut global = GlobalScope::new();
    for func in &unit.functions {
        global.declare(func, filename, sink);
    }

    for func in &mut unit.functions {
        if func.is_prototype {
            continue;
        }
        let mut analyzer = Analyzer {
            global: &global,
            filename,
            sink,
            scopes: LocalScopes::new(),
        };
        for param in &func.params {
            analyzer.scopes.declare(param.name, param.ty);
        }
        if let Some(body) = &mut func.body {
            analyzer.analyze_block(body);
        }
    }

    global
}

impl<'a> Analyzer<'a> {
    fn error(&mut self, line: u32, column: u32, message: impl Into<String>) {
        self.sink.error(Category::Semantic, Some(self.filename), line, column, message);
    }

    fn warn(&mut self, line: u32, column: u32, message: impl Into<String>) {
        self.sink.warn(Category::Semantic, Some(self.filename), line, column, message);
    }

    fn analyze_block(&mut self, block: &mut ast::Block) {
        self.scopes.enter();
        for stmt in &mut block.stmts {
            self.analyze_stmt(stmt);
        }
        self.scopes.exit();
    }

    fn analyze_stmt(&mut self, stmt: &mut Stmt) {
        match &mut stmt.kind {
            StmtKind::VarDecl { name, declared_type, init } => {
                if let Some(init) = init {
                    self.analyze_expr(init);
                    self.check_assignable(*declared_type, init);
                }
                self.scopes.declare(*name, *declared_type);
            }
            StmtKind::Assign { name, value } => {
                self.analyze_expr(value);
                match self.scopes.lookup(*name) {
                    Some(ty) => self.check_assignable(ty, value),
                    None => self.error(stmt.line, stmt.column, format!("assignment to undeclared variable '{name}'")),
                }
            }
            StmtKind::If { cond, then_branch, else_branch } => {
                self.analyze_expr(cond);
                self.analyze_block(then_branch);
                if let Some(else_branch) = else_branch {
                    self.analyze_block(else_branch);
                }
            }
            StmtKind::While { cond, body } => {
                self.analyze_expr(cond);
                self.analyze_block(body);
            }
            StmtKind::Return(expr) => {
                if let Some(expr) = expr {
                    self.analyze_expr(expr);
                }
            }
            StmtKind::Block(block) => self.analyze_block(block),
            StmtKind::ExprStmt(expr) => self.analyze_expr(expr),
        }
    }

    /// Warn (not error) when an initializer/assignment narrows the
    /// declared type — it's legal, just possibly lossy.
    fn check_assignable(&mut self, declared: DataType, value: &Expr) {
        if value.value_type.width() > declared.width() && declared != DataType::Void {
            self.warn(
                value.line,
                value.column,
                format!(
                    "implicit narrowing conversion from '{:?}' to '{:?}' may lose data",
                    value.value_type, declared
                ),
            );
        }
    }

    fn analyze_expr(&mut self, expr: &mut Expr) {
        match &mut expr.kind {
            ExprKind::IntLiteral(_) => {
                expr.value_type = DataType::Int64;
            }
            ExprKind::Identifier(name) => {
                expr.value_type = match self.scopes.lookup(*name) {
                    Some(ty) => ty,
                    None => {
                        self.error(expr.line, expr.column, format!("use of undeclared identifier '{name}'"));
                        DataType::Int32
                    }
                };
            }
            ExprKind::Binary { op, lhs, rhs } => {
                self.analyze_expr(lhs);
                self.analyze_expr(rhs);
                expr.value_type = if op.is_comparison() || op.is_short_circuit() {
                    DataType::Int32
                } else {
                    lhs.value_type.promote(rhs.value_type)
                };
                self.check_binary_operand_widening(*op, lhs.value_type, rhs.value_type, expr.line, expr.column);
            }
            ExprKind::Unary { op, operand } => {
                self.analyze_expr(operand);
                expr.value_type = match op {
                    UnaryOp::Not => DataType::Int32,
                    UnaryOp::Negate | UnaryOp::BitNot => operand.value_type,
                };
            }
            ExprKind::Call { callee, args } => {
                for arg in args.iter_mut() {
                    self.analyze_expr(arg);
                }
                match self.global.functions.get(callee) {
                    Some(sig) => {
                        if sig.params.len() != args.len() {
                            self.error(
                                expr.line,
                                expr.column,
                                format!(
                                    "'{callee}' expects {} argument(s), found {}",
                                    sig.params.len(),
                                    args.len()
                                ),
                            );
                        }
                        expr.value_type = sig.return_type;
                    }
                    None => {
                        self.error(
                            expr.line,
                            expr.column,
                            format!("call to undeclared function '{callee}' (implicit declarations are not supported)"),
                        );
                        expr.value_type = DataType::Int32;
                    }
                }
            }
        }
    }

    fn check_binary_operand_widening(&mut self, op: BinOp, lhs: DataType, rhs: DataType, line: u32, column: u32) {
        if op.is_short_circuit() {
            return;
        }
        if lhs.is_signed() != rhs.is_signed() && lhs.width() == rhs.width() {
            self.warn(
                line,
                column,
                format!(
                    "mixing signed and unsigned operands of the same width ('{:?}' and '{:?}') in '{}'",
                    lhs,
                    rhs,
                    op_symbol(op)
                ),
            );
        }
    }
}

fn op_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::And => "&",
        BinOp::Or => "|",
        BinOp::Xor => "^",
        BinOp::Shl => "<<",
        BinOp::Shr => ">>",
        BinOp::LogicalAnd => "&&",
        BinOp::LogicalOr => "||",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::lex::Lexer;
    use crate::front::parse::parse;

    fn analyze_src(src: &str) -> Sink {
        let mut sink = Sink::new();
        let tokens = Lexer::new(src, "<test>").tokenize(&mut sink);
        let mut unit = parse(&tokens, "<test>", &mut sink);
        analyze(&mut unit, "<test>", &mut sink);
        sink
    }

    #[test]
    fn accepts_well_typed_program() {
        let sink = analyze_src("int add(int a, int b) { return a + b; } int main() { return add(1, 2); }");
        assert!(!sink.has_errors());
    }

    #[test]
    fn rejects_call_to_undeclared_function() {
        let sink = analyze_src("int main() { return missing(); }");
        assert!(sink.has_errors());
    }

    #[test]
    fn rejects_wrong_arity_call() {
        let sink = analyze_src("int add(int a, int b) { return a + b; } int main() { return add(1); }");
        assert!(sink.has_errors());
    }

    #[test]
    fn rejects_assignment_to_undeclared_variable() {
        let sink = analyze_src("int main() { x = 1; return 0; }");
        assert!(sink.has_errors());
    }

    #[test]
    fn allows_forward_reference_between_functions() {
        let sink = analyze_src("int main() { return helper(); } int helper() { return 1; }");
        assert!(!sink.has_errors());
    }

    #[test]
    fn fills_in_value_types() {
        let mut sink = Sink::new();
        let tokens = Lexer::new("int main() { return 1 + 2; }", "<test>").tokenize(&mut sink);
        let mut unit = parse(&tokens, "<test>", &mut sink);
        analyze(&mut unit, "<test>", &mut sink);
        let StmtKind::Return(Some(expr)) = &unit.functions[0].body.as_ref().unwrap().stmts[0].kind else {
            panic!("expected a return");
        };
        assert_eq!(expr.value_type, DataType::Int64);
    }
}
