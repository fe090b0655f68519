//! The parser.
//!
//! Recursive-descent with precedence climbing for binary operators. Parse
//! errors are recorded to the [`Sink`] and recovered from in panic mode:
//! on error, tokens are skipped until a safe resynchronization point (`;`,
//! `{`, `if`, `while`, `return`, or a type keyword) so one malformed
//! statement doesn't abort the whole file.

use crate::common::Id;
use crate::diag::{Category, Sink};

use super::ast::*;
use super::lex::{Token, TokenKind};

/// Binary operator precedence, weakest to strongest. Matches the
/// standard C ladder: `|| && | ^ & == != < <= > >= << >> + - * /`.
const PRECEDENCE_LEVELS: &[&[TokenKind]] = &[
    &[TokenKind::PipePipe],
    &[TokenKind::AmpAmp],
    &[TokenKind::Pipe],
    &[TokenKind::Caret],
    &[TokenKind::Amp],
    &[TokenKind::EqEq, TokenKind::NotEq],
    &[TokenKind::Lt, TokenKind::Le, TokenKind::Gt, TokenKind::Ge],
    &[TokenKind::Shl, TokenKind::Shr],
    &[TokenKind::Plus, TokenKind::Minus],
    &[TokenKind::Star, TokenKind::Slash],
];

fn binop_for(kind: TokenKind) -> BinOp {
    match kind {
        TokenKind::PipePipe => BinOp::LogicalOr,
        TokenKind::AmpAmp => BinOp::LogicalAnd,
        TokenKind::Pipe => BinOp::Or,
        TokenKind::Caret => BinOp::Xor,
        TokenKind::Amp => BinOp::And,
        TokenKind::EqEq => BinOp::Eq,
        TokenKind::NotEq => BinOp::Ne,
        TokenKind::Lt => BinOp::Lt,
        TokenKind::Le => BinOp::Le,
        TokenKind::Gt => BinOp::Gt,
        TokenKind::Ge => BinOp::Ge,
        TokenKind::Shl => BinOp::Shl,
        TokenKind::Shr => BinOp::Shr,
        TokenKind::Plus => BinOp::Add,
        TokenKind::Minus => BinOp::Sub,
        TokenKind::Star => BinOp::Mul,
        TokenKind::Slash => BinOp::Div,
        other => unreachable!("{other} is not a binary operator"),
    }
}

/// Marks that a parse error was already recorded to the `Sink`; callers
/// use this to drive panic-mode recovery rather than to report twice.
struct Bail;

type PResult<T> = Result<T, Bail>;

pub struct Parser<'src> {
    tokens: &'src [Token<'src>],
    pos: usize,
    filename: String,
}

impl<'src> Parser<'src> {
    pub fn new(tokens: &'src [Token<'src>], filename: impl Into<String>) -> Self {
        Parser {
            tokens,
            pos: 0,
            filename: filename.into(),
        }
    }

    fn peek(&self) -> &Token<'src> {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn advance(&mut self) -> Token<'src> {
        let t = *self.peek();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, sink: &mut Sink) -> PResult<Token<'src>> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            let tok = *self.peek();
            sink.error(
                Category::Parser,
                Some(&self.filename),
                tok.line,
                tok.column,
                format!("expected {kind}, found {}", tok.kind),
            );
            Err(Bail)
        }
    }

    fn type_keyword(&mut self, sink: &mut Sink) -> PResult<DataType> {
        let tok = *self.peek();
        if tok.kind.is_type_keyword() {
            self.advance();
            Ok(DataType::keyword(tok.text).expect("lexer only emits known type keywords"))
        } else {
            sink.error(
                Category::Parser,
                Some(&self.filename),
                tok.line,
                tok.column,
                format!("expected a type, found {}", tok.kind),
            );
            Err(Bail)
        }
    }

    /// Skip tokens until a safe resynchronization point. Consumes a
    /// trailing `;` if that's what stopped us, so the caller can resume
    /// at the next statement.
    fn synchronize(&mut self) {
        loop {
            match self.peek_kind() {
                TokenKind::Eof => return,
                TokenKind::Semi => {
                    self.advance();
                    return;
                }
                k if k.is_type_keyword()
                    || matches!(
                        k,
                        TokenKind::KwIf
                            | TokenKind::KwWhile
                            | TokenKind::KwReturn
                            | TokenKind::LBrace
                            | TokenKind::RBrace
                    ) =>
                {
                    return;
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    pub fn parse_translation_unit(&mut self, sink: &mut Sink) -> TranslationUnit {
        let mut unit = TranslationUnit::default();
        while !self.at(TokenKind::Eof) {
            match self.parse_function(sink) {
                Ok(func) => unit.functions.push(func),
                Err(Bail) => self.synchronize(),
            }
        }
        unit
    }

    fn parse_function(&mut self, sink: &mut Sink) -> PResult<Function> {
        let start = *self.peek();
        let return_type = self.type_keyword(sink)?;
        let name_tok = self.expect(TokenKind::Ident, sink)?;
        let name: Id = Id::new(name_tok.text.to_string());
        self.expect(TokenKind::LParen, sink)?;

        let mut params = Vec::new();
        if !self.at(TokenKind::RParen) {
            if self.at(TokenKind::KwVoid)
                && matches!(self.tokens.get(self.pos + 1), Some(t) if t.kind == TokenKind::RParen)
            {
                self.advance();
            } else {
                loop {
                    let ty = self.type_keyword(sink)?;
                    let pname_tok = self.expect(TokenKind::Ident, sink)?;
                    params.push(Param {
                        name: Id::new(pname_tok.text.to_string()),
                        ty,
                    });
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
            }
        }
        self.expect(TokenKind::RParen, sink)?;

        if self.eat(TokenKind::Semi) {
            return Ok(Function {
                name,
                return_type,
                params,
                body: None,
                is_prototype: true,
                line: start.line,
                column: start.column,
            });
        }

        let body = self.parse_block(sink)?;
        Ok(Function {
            name,
            return_type,
            params,
            body: Some(body),
            is_prototype: false,
            line: start.line,
            column: start.column,
        })
    }

    fn parse_block(&mut self, sink: &mut Sink) -> PResult<Block> {
        self.expect(TokenKind::LBrace, sink)?;
        let mut block = Block::default();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            match self.parse_statement(sink) {
                Ok(stmt) => block.stmts.push(stmt),
                Err(Bail) => self.synchronize(),
            }
        }
        self.expect(TokenKind::RBrace, sink)?;
        Ok(block)
    }

    fn parse_statement(&mut self, sink: &mut Sink) -> PResult<Stmt> {
        let start = *self.peek();
        if start.kind.is_type_keyword() {
            return self.parse_var_decl(sink);
        }
        match start.kind {
            TokenKind::KwIf => self.parse_if(sink),
            TokenKind::KwWhile => self.parse_while(sink),
            TokenKind::KwReturn => self.parse_return(sink),
            TokenKind::LBrace => {
                let block = self.parse_block(sink)?;
                Ok(Stmt::new(StmtKind::Block(block), start.line, start.column))
            }
            TokenKind::Ident
                if matches!(self.tokens.get(self.pos + 1), Some(t) if t.kind == TokenKind::Assign) =>
            {
                self.parse_assign(sink)
            }
            _ => {
                let expr = self.parse_expr(sink)?;
                self.expect(TokenKind::Semi, sink)?;
                Ok(Stmt::new(StmtKind::ExprStmt(expr), start.line, start.column))
            }
        }
    }

    fn parse_var_decl(&mut self, sink: &mut Sink) -> PResult<Stmt> {
        let start = *self.peek();
        let declared_type = self.type_keyword(sink)?;
        let name_tok = self.expect(TokenKind::Ident, sink)?;
        let name = Id::new(name_tok.text.to_string());
        let init = if self.eat(TokenKind::Assign) {
            Some(self.parse_expr(sink)?)
        } else {
            None
        };
        self.expect(TokenKind::Semi, sink)?;
        Ok(Stmt::new(
            StmtKind::VarDecl {
                name,
                declared_type,
                init,
            },
            start.line,
            start.column,
        ))
    }

    fn parse_assign(&mut self, sink: &mut Sink) -> PResult<Stmt> {
        let name_tok = self.advance();
        let name = Id::new(name_tok.text.to_string());
        self.expect(TokenKind::Assign, sink)?;
        let value = self.parse_expr(sink)?;
        self.expect(TokenKind::Semi, sink)?;
        Ok(Stmt::new(
            StmtKind::Assign { name, value },
            name_tok.line,
            name_tok.column,
        ))
    }

    fn parse_if(&mut self, sink: &mut Sink) -> PResult<Stmt> {
        let start = self.advance();
        self.expect(TokenKind::LParen, sink)?;
        let cond = self.parse_expr(sink)?;
        self.expect(TokenKind::RParen, sink)?;
        let then_branch = self.parse_block(sink)?;
        let else_branch = if self.eat(TokenKind::KwElse) {
            Some(self.parse_block(sink)?)
        } else {
            None
        };
        Ok(Stmt::new(
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            },
            start.line,
            start.column,
        ))
    }

    fn parse_while(&mut self, sink: &mut Sink) -> PResult<Stmt> {
        let start = self.advance();
        self.expect(TokenKind::LParen, sink)?;
        let cond = self.parse_expr(sink)?;
        self.expect(TokenKind::RParen, sink)?;
        let body = self.parse_block(sink)?;
        Ok(Stmt::new(StmtKind::While { cond, body }, start.line, start.column))
    }

    fn parse_return(&mut self, sink: &mut Sink) -> PResult<Stmt> {
        let start = self.advance();
        let value = if self.at(TokenKind::Semi) {
            None
        } else {
            Some(self.parse_expr(sink)?)
        };
        self.expect(TokenKind::Semi, sink)?;
        Ok(Stmt::new(StmtKind::Return(value), start.line, start.column))
    }

    fn parse_expr(&mut self, sink: &mut Sink) -> PResult<Expr> {
        self.parse_binary(0, sink)
    }

    fn parse_binary(&mut self, level: usize, sink: &mut Sink) -> PResult<Expr> {
        if level == PRECEDENCE_LEVELS.len() {
            return self.parse_unary(sink);
        }
        let mut lhs = self.parse_binary(level + 1, sink)?;
        while PRECEDENCE_LEVELS[level].contains(&self.peek_kind()) {
            let op_tok = self.advance();
            let op = binop_for(op_tok.kind);
            let rhs = self.parse_binary(level + 1, sink)?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                op_tok.line,
                op_tok.column,
            );
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self, sink: &mut Sink) -> PResult<Expr> {
        let tok = *self.peek();
        let op = match tok.kind {
            TokenKind::Minus => Some(UnaryOp::Negate),
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary(sink)?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                tok.line,
                tok.column,
            ));
        }
        self.parse_primary(sink)
    }

    fn parse_primary(&mut self, sink: &mut Sink) -> PResult<Expr> {
        let tok = *self.peek();
        match tok.kind {
            TokenKind::Int => {
                self.advance();
                let value: i64 = tok.text.parse().map_err(|_| {
                    sink.error(
                        Category::Parser,
                        Some(&self.filename),
                        tok.line,
                        tok.column,
                        format!("integer literal {:?} out of range", tok.text),
                    );
                    Bail
                })?;
                Ok(Expr::new(ExprKind::IntLiteral(value), tok.line, tok.column))
            }
            TokenKind::Ident => {
                self.advance();
                if self.eat(TokenKind::LParen) {
                    let mut args = Vec::new();
                    if !self.at(TokenKind::RParen) {
                        loop {
                            args.push(self.parse_expr(sink)?);
                            if !self.eat(TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen, sink)?;
                    Ok(Expr::new(
                        ExprKind::Call {
                            callee: Id::new(tok.text.to_string()),
                            args,
                        },
                        tok.line,
                        tok.column,
                    ))
                } else {
                    Ok(Expr::new(
                        ExprKind::Identifier(Id::new(tok.text.to_string())),
                        tok.line,
                        tok.column,
                    ))
                }
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr(sink)?;
                self.expect(TokenKind::RParen, sink)?;
                Ok(inner)
            }
            _ => {
                sink.error(
                    Category::Parser,
                    Some(&self.filename),
                    tok.line,
                    tok.column,
                    format!("expected an expression, found {}", tok.kind),
                );
                Err(Bail)
            }
        }
    }
}

/// Lex and parse one source file to a `TranslationUnit`. Errors are
/// recorded to `sink`; callers gate on `sink.has_errors()` afterward
/// rather than treating parse failure as fatal for the whole program.
pub fn parse(tokens: &[Token], filename: &str, sink: &mut Sink) -> TranslationUnit {
    Parser::new(tokens, filename).parse_translation_unit(sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::lex::Lexer;

    fn parse_src(src: &str) -> (TranslationUnit, Sink) {
        let mut sink = Sink::new();
        let tokens = Lexer::new(src, "<test>").tokenize(&mut sink);
        let unit = parse(&tokens, "<test>", &mut sink);
        (unit, sink)
    }

    #[test]
    fn parses_simple_function() {
        let (unit, sink) = parse_src("int main() { return 1 + 2 * 3; }");
        assert!(!sink.has_errors());
        assert_eq!(unit.functions.len(), 1);
        assert_eq!(unit.functions[0].name.to_string(), "main");
    }

    #[test]
    fn parses_prototype() {
        let (unit, sink) = parse_src("int add(int a, int b);");
        assert!(!sink.has_errors());
        assert!(unit.functions[0].is_prototype);
    }

    #[test]
    fn respects_precedence_and_associativity() {
        let (unit, sink) = parse_src("int main() { return 1 + 2 * 3 - 4; }");
        assert!(!sink.has_errors());
        let StmtKind::Return(Some(expr)) = &unit.functions[0].body.as_ref().unwrap().stmts[0].kind else {
            panic!("expected a return statement");
        };
        let ExprKind::Binary { op: BinOp::Sub, .. } = expr.kind else {
            panic!("expected the outermost operator to be subtraction, got {:?}", expr.kind);
        };
    }

    #[test]
    fn recovers_from_a_malformed_statement() {
        let (unit, sink) = parse_src("int main() { 1 +; return 0; }");
        assert!(sink.has_errors());
        assert_eq!(unit.functions.len(), 1);
    }

    #[test]
    fn parses_void_params() {
        let (unit, sink) = parse_src("int f(void) { return 0; }");
        assert!(!sink.has_errors());
        assert!(unit.functions[0].params.is_empty());
    }
}
