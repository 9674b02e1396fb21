//! Recursive-descent parser (spec.md §4.2): tokens → `Stmt`/`Expr` tree.
//!
//! Bounded lookahead is implemented entirely via `Lexer::save_state`/
//! `rewind` rather than a hand-rolled token buffer, so speculative parses
//! (e.g. disambiguating a named-argument map literal from a block) are
//! just "parse, and rewind if it didn't work out".

use std::cell::{Cell, RefCell};

use crate::ast::*;
use crate::error::{Diagnostic, ExcKind};
use crate::intern::{Interner, StringId};
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};
use crate::types::Type;

pub struct Parser<'i> {
    lexer: Lexer,
    interner: &'i mut Interner,
    diagnostics: Vec<Diagnostic>,
    /// Package/import statements are only legal before the first non-such
    /// statement (spec.md §4.2).
    past_package_import_zone: bool,
}

type PResult<T> = Result<T, Diagnostic>;

/// Marks the trailing expression-statement of a function/script body, if
/// any, as result-bearing so the compiler keeps its value on the stack as
/// the implicit return (spec.md §4.2). `break`/`continue` never carry a
/// value, even from tail position.
fn mark_tail_result(body: &[Stmt]) {
    if let Some(Stmt::ExprStmt(e)) = body.last() {
        if !matches!(e.kind, ExprKind::Break | ExprKind::Continue) {
            e.result_used.set(true);
        }
    }
}

impl<'i> Parser<'i> {
    #[must_use]
    pub fn new(source: &str, interner: &'i mut Interner) -> Self {
        Self {
            lexer: Lexer::new(source, false),
            interner,
            diagnostics: Vec::new(),
            past_package_import_zone: false,
        }
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Parses an entire compilation unit into the synthetic outer class
    /// wrapping the top-level script body (spec.md §4.2).
    pub fn parse_script(mut self) -> Result<Stmt, Vec<Diagnostic>> {
        let mut package = None;
        let mut imports = Vec::new();
        self.skip_eols();
        if self.check(TokenKind::Package) {
            package = self.parse_package().ok();
        }
        self.skip_eols();
        while self.check(TokenKind::Import) {
            if let Ok(stmt) = self.parse_import() {
                imports.push(stmt);
            }
            self.skip_eols();
        }
        self.past_package_import_zone = true;
        let mut body = imports;
        while !self.at_eof() {
            match self.parse_top_level_stmt() {
                Ok(stmt) => body.push(stmt),
                Err(d) => {
                    self.diagnostics.push(d);
                    self.synchronize();
                }
            }
            self.skip_eols();
        }
        mark_tail_result(&body);
        if self.diagnostics.is_empty() {
            Ok(Stmt::ClassDecl {
                name: package.unwrap_or_default(),
                base: None,
                is_sealed: false,
                fields: Vec::new(),
                methods: Vec::new(),
                inner_classes: Vec::new(),
                script_main: Some(body),
            })
        } else {
            Err(self.diagnostics)
        }
    }

    fn parse_top_level_stmt(&mut self) -> PResult<Stmt> {
        if self.check(TokenKind::Sealed) || self.check(TokenKind::Class) {
            return self.parse_class_decl();
        }
        self.parse_stmt()
    }

    // -- package / import -----------------------------------------------------

    fn parse_package(&mut self) -> PResult<String> {
        self.advance(); // 'package'
        let mut parts = vec![self.expect_identifier_text()?];
        while self.check(TokenKind::Dot) {
            self.advance();
            parts.push(self.expect_identifier_text()?);
        }
        self.expect_stmt_end()?;
        Ok(parts.join("."))
    }

    fn parse_import(&mut self) -> PResult<Stmt> {
        let pos = self.pos();
        self.advance(); // 'import'
        let is_static = if self.check(TokenKind::Static) {
            self.advance();
            true
        } else {
            false
        };
        let mut parts = vec![self.expect_identifier_text()?];
        while self.check(TokenKind::Dot) {
            self.advance();
            parts.push(self.expect_identifier_text()?);
        }
        let alias = if self.check(TokenKind::As) {
            self.advance();
            Some(self.expect_identifier_text()?)
        } else {
            None
        };
        self.expect_stmt_end()?;
        let _ = pos;
        Ok(Stmt::Import { path: parts, alias, is_static })
    }

    // -- statements ------------------------------------------------------------

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        self.skip_eols();
        match self.peek_kind() {
            TokenKind::LeftBrace => self.parse_block(),
            TokenKind::If => self.parse_if(false),
            TokenKind::Unless => self.parse_if(true),
            TokenKind::While => self.parse_while(false),
            TokenKind::Until => self.parse_while(true),
            TokenKind::Do => self.parse_do_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Switch => self.parse_switch(),
            TokenKind::Return => self.parse_return(),
            TokenKind::Break => {
                self.advance();
                self.expect_stmt_end()?;
                Ok(Stmt::ExprStmt(Expr::new(ExprKind::Break, self.pos())))
            }
            TokenKind::Continue => {
                self.advance();
                self.expect_stmt_end()?;
                Ok(Stmt::ExprStmt(Expr::new(ExprKind::Continue, self.pos())))
            }
            TokenKind::Def if self.is_fun_decl_ahead() => Ok(Stmt::FunDecl(Box::new(self.parse_fun_body(false)?))),
            TokenKind::Def | TokenKind::Var | TokenKind::Const => self.parse_var_decl_stmt(),
            TokenKind::Sealed | TokenKind::Class => self.parse_class_decl(),
            TokenKind::Import => self.parse_import(),
            _ => {
                let expr = self.parse_expr()?;
                self.expect_stmt_end()?;
                Ok(Stmt::ExprStmt(expr))
            }
        }
    }

    fn parse_block(&mut self) -> PResult<Stmt> {
        self.expect(TokenKind::LeftBrace)?;
        let mut stmts = Vec::new();
        self.skip_eols();
        while !self.check(TokenKind::RightBrace) && !self.at_eof() {
            stmts.push(self.parse_stmt()?);
            self.skip_eols();
        }
        self.expect(TokenKind::RightBrace)?;
        Ok(Stmt::Block(stmts))
    }

    fn parse_single_or_block(&mut self) -> PResult<Stmt> {
        if self.check(TokenKind::LeftBrace) {
            self.parse_block()
        } else {
            self.parse_stmt()
        }
    }

    fn parse_if(&mut self, negate: bool) -> PResult<Stmt> {
        self.advance();
        self.expect(TokenKind::LeftParen)?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RightParen)?;
        let then_branch = Box::new(self.parse_single_or_block()?);
        self.skip_eols_soft();
        let else_branch = if self.check(TokenKind::Else) {
            self.advance();
            Some(Box::new(self.parse_single_or_block()?))
        } else {
            None
        };
        Ok(Stmt::If { cond, then_branch, else_branch, negate_cond: negate })
    }

    fn parse_while(&mut self, negate: bool) -> PResult<Stmt> {
        self.advance();
        self.expect(TokenKind::LeftParen)?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RightParen)?;
        let body = Box::new(self.parse_single_or_block()?);
        Ok(Stmt::While { cond, body, negate_cond: negate, is_do_while: false })
    }

    fn parse_do_while(&mut self) -> PResult<Stmt> {
        self.advance();
        let body = Box::new(self.parse_single_or_block()?);
        self.skip_eols_soft();
        let negate = self.check(TokenKind::Until);
        if !negate {
            self.expect(TokenKind::While)?;
        } else {
            self.advance();
        }
        self.expect(TokenKind::LeftParen)?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RightParen)?;
        self.expect_stmt_end()?;
        Ok(Stmt::While { cond, body, negate_cond: negate, is_do_while: true })
    }

    /// Desugars a C-style `for(init; cond; update) body` into
    /// `{ init; while(cond) { body; update } }` — the AST has no
    /// dedicated for-loop node, matching how little the surface syntax's
    /// for-loop shape is constrained (spec.md §6 lists `for` only by name).
    fn parse_for(&mut self) -> PResult<Stmt> {
        self.advance();
        self.expect(TokenKind::LeftParen)?;
        let init = if self.check(TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_for_init()?)
        };
        self.expect(TokenKind::Semicolon)?;
        let cond = if self.check(TokenKind::Semicolon) {
            Expr::new(ExprKind::Literal(Literal::Bool(true)), self.pos())
        } else {
            self.parse_expr()?
        };
        self.expect(TokenKind::Semicolon)?;
        let update = if self.check(TokenKind::RightParen) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(TokenKind::RightParen)?;
        let mut body_stmts = vec![self.parse_single_or_block()?];
        if let Some(update) = update {
            body_stmts.push(Stmt::ExprStmt(update));
        }
        let loop_stmt = Stmt::While {
            cond,
            body: Box::new(Stmt::Block(body_stmts)),
            negate_cond: false,
            is_do_while: false,
        };
        match init {
            Some(init) => Ok(Stmt::Block(vec![init, loop_stmt])),
            None => Ok(loop_stmt),
        }
    }

    fn parse_for_init(&mut self) -> PResult<Stmt> {
        if matches!(self.peek_kind(), TokenKind::Def | TokenKind::Var) {
            self.parse_var_decl_stmt_no_terminator()
        } else {
            let expr = self.parse_expr()?;
            Ok(Stmt::ExprStmt(expr))
        }
    }

    /// `switch(expr) { case a: stmt  case b: stmt  default: stmt }`
    /// desugars to a cascade of `If`s comparing `expr` against each case's
    /// literal, again because the AST has no dedicated switch node.
    fn parse_switch(&mut self) -> PResult<Stmt> {
        self.advance();
        self.expect(TokenKind::LeftParen)?;
        let scrutinee_pos = self.pos();
        let scrutinee_name = self.interner.intern("__switch_value");
        let scrutinee = self.parse_expr()?;
        self.expect(TokenKind::RightParen)?;
        self.expect(TokenKind::LeftBrace)?;
        self.skip_eols();
        let mut arms: Vec<(Option<Expr>, Vec<Stmt>)> = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.at_eof() {
            let label_expr = if self.check_ident_text("case") {
                self.advance();
                let e = self.parse_expr()?;
                Some(e)
            } else if self.check_ident_text("default") {
                self.advance();
                None
            } else {
                return Err(self.error_here(ExcKind::UnexpectedChar, "expected 'case' or 'default'"));
            };
            self.expect(TokenKind::Colon)?;
            self.skip_eols();
            let mut stmts = Vec::new();
            while !self.check_ident_text("case") && !self.check_ident_text("default") && !self.check(TokenKind::RightBrace) && !self.at_eof() {
                stmts.push(self.parse_stmt()?);
                self.skip_eols();
            }
            arms.push((label_expr, stmts));
        }
        self.expect(TokenKind::RightBrace)?;

        let decl = Stmt::VarDecl {
            name: scrutinee_name,
            declared_type: Type::Any,
            init: Some(scrutinee),
            is_const: false,
            slot: Cell::new(u32::MAX),
        };
        let mut chain: Option<Stmt> = None;
        for (label, stmts) in arms.into_iter().rev() {
            let body = Stmt::Block(stmts);
            chain = Some(match label {
                Some(label_expr) => {
                    let ident = Expr::new(ExprKind::Identifier(scrutinee_name), scrutinee_pos);
                    let cond = Expr::new(
                        ExprKind::Binary { op: BinOp::Eq, lhs: Box::new(ident), rhs: Box::new(label_expr) },
                        scrutinee_pos,
                    );
                    Stmt::If {
                        cond,
                        then_branch: Box::new(body),
                        else_branch: chain.map(Box::new),
                        negate_cond: false,
                    }
                }
                None => body,
            });
        }
        Ok(Stmt::Block(vec![decl, chain.unwrap_or(Stmt::Block(Vec::new()))]))
    }

    fn parse_return(&mut self) -> PResult<Stmt> {
        self.advance();
        let value = if self.at_stmt_end() {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect_stmt_end()?;
        Ok(Stmt::Return(value))
    }

    fn parse_var_decl_stmt(&mut self) -> PResult<Stmt> {
        let stmt = self.parse_var_decl_stmt_no_terminator()?;
        self.expect_stmt_end()?;
        Ok(stmt)
    }

    fn parse_var_decl_stmt_no_terminator(&mut self) -> PResult<Stmt> {
        let is_const = self.check(TokenKind::Const);
        let declared_type = self.parse_type_token()?;
        let name = self.expect_identifier_id()?;
        let init = if self.check(TokenKind::Equal) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Stmt::VarDecl { name, declared_type, init, is_const, slot: Cell::new(u32::MAX) })
    }

    /// Consumes a leading type keyword (`def`/`var`/`const`/a class name) and
    /// returns the `Type` it denotes; `var`/`const` without an explicit type
    /// keyword both mean "infer", modeled here as `Any` until the resolver
    /// narrows it from the initializer.
    fn parse_type_token(&mut self) -> PResult<Type> {
        match self.peek_kind() {
            TokenKind::Def | TokenKind::Var | TokenKind::Const => {
                self.advance();
                Ok(Type::Any)
            }
            TokenKind::Identifier => {
                let name = self.expect_identifier_text()?;
                Ok(match name.as_str() {
                    "boolean" => Type::Bool,
                    "byte" => Type::Byte,
                    "int" => Type::Int,
                    "long" => Type::Long,
                    "double" => Type::Double,
                    "Decimal" => Type::Decimal,
                    "String" => Type::String,
                    "Map" => Type::Map,
                    "List" => Type::List,
                    other => Type::Class(other.to_string()),
                })
            }
            _ => Err(self.error_here(ExcKind::UnexpectedChar, "expected a type")),
        }
    }

    fn parse_class_decl(&mut self) -> PResult<Stmt> {
        let is_sealed = self.check(TokenKind::Sealed);
        if is_sealed {
            self.advance(); // 'sealed'
        }
        self.advance(); // 'class'
        let name = self.expect_identifier_text()?;
        let base = if self.check(TokenKind::Extends) {
            self.advance();
            Some(self.expect_identifier_text()?)
        } else {
            None
        };
        self.expect(TokenKind::LeftBrace)?;
        self.skip_eols();
        let mut fields = Vec::new();
        let mut methods = Vec::new();
        let mut inner_classes = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.at_eof() {
            if self.check(TokenKind::Sealed) || self.check(TokenKind::Class) {
                inner_classes.push(Box::new(self.parse_class_decl()?));
            } else if self.is_fun_decl_ahead() {
                methods.push(self.parse_fun_body(true)?);
            } else {
                let is_const = self.check(TokenKind::Const);
                let ty = self.parse_type_token()?;
                let field_name = self.expect_identifier_id()?;
                let default = if self.check(TokenKind::Equal) {
                    self.advance();
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                self.expect_stmt_end()?;
                fields.push((field_name, ty, default, is_const));
            }
            self.skip_eols();
        }
        self.expect(TokenKind::RightBrace)?;
        Ok(Stmt::ClassDecl {
            name,
            base,
            is_sealed,
            fields,
            methods,
            inner_classes,
            script_main: None,
        })
    }

    fn is_fun_decl_ahead(&mut self) -> bool {
        self.check(TokenKind::Def) && {
            let saved = self.lexer.save_state();
            self.lexer.next();
            let is_fun = self.lexer.peek().kind == TokenKind::Identifier
                && self.lexer.peek_at(1).kind == TokenKind::LeftParen;
            self.lexer.rewind(saved);
            is_fun
        }
    }

    fn parse_fun_body(&mut self, is_method: bool) -> PResult<FunBody> {
        self.advance(); // 'def' (return type inference kept simple: def-only)
        let name = Some(self.expect_identifier_id()?);
        self.expect(TokenKind::LeftParen)?;
        let params = self.parse_params()?;
        self.expect(TokenKind::RightParen)?;
        self.skip_eols_soft();
        let body = match self.parse_block()? {
            Stmt::Block(stmts) => stmts,
            other => vec![other],
        };
        mark_tail_result(&body);
        let _ = is_method;
        Ok(FunBody {
            name,
            params,
            return_type: Type::Any,
            is_static: false,
            is_final: false,
            body,
            implicit_it_param: false,
            fn_id: Cell::new(u32::MAX),
            is_async: Cell::new(false),
            captured_vars: RefCell::new(Vec::new()),
            owned_captured_vars: RefCell::new(Vec::new()),
        })
    }

    fn parse_params(&mut self) -> PResult<Vec<Param>> {
        let mut params = Vec::new();
        if self.check(TokenKind::RightParen) {
            return Ok(params);
        }
        loop {
            let declared_type = self.parse_type_token()?;
            let name = self.expect_identifier_id()?;
            let default = if self.check(TokenKind::Equal) {
                self.advance();
                Some(Box::new(self.parse_expr()?))
            } else {
                None
            };
            let is_mandatory = default.is_none();
            params.push(Param { name, declared_type, default, is_mandatory });
            if self.check(TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        Ok(params)
    }

    // -- expressions -------------------------------------------------------------

    pub fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let lhs = self.parse_ternary()?;
        let op = match self.peek_kind() {
            TokenKind::Equal => None,
            TokenKind::QuestionEqual => Some(None),
            TokenKind::PlusEqual => Some(Some(BinOp::Add)),
            TokenKind::MinusEqual => Some(Some(BinOp::Sub)),
            TokenKind::StarEqual => Some(Some(BinOp::Mul)),
            TokenKind::SlashEqual => Some(Some(BinOp::Div)),
            TokenKind::PercentEqual => Some(Some(BinOp::Mod)),
            TokenKind::StarStarEqual => Some(Some(BinOp::Pow)),
            TokenKind::AmpEqual => Some(Some(BinOp::BitAnd)),
            TokenKind::PipeEqual => Some(Some(BinOp::BitOr)),
            TokenKind::CaretEqual => Some(Some(BinOp::BitXor)),
            TokenKind::LeftShiftEqual => Some(Some(BinOp::Shl)),
            TokenKind::RightShiftEqual => Some(Some(BinOp::Shr)),
            TokenKind::RightShiftUnsignedEqual => Some(Some(BinOp::UShr)),
            _ => return Ok(lhs),
        };
        let is_null_safe = matches!(self.peek_kind(), TokenKind::QuestionEqual);
        self.advance();
        let rhs = self.parse_assignment()?;
        match op {
            None if !is_null_safe => Ok(Expr::new(
                ExprKind::VarAssign { target: Box::new(lhs), value: Box::new(rhs) },
                pos,
            )),
            _ => {
                let op = op.flatten().unwrap_or(BinOp::Add);
                Ok(Expr::new(
                    ExprKind::VarOpAssign { target: Box::new(lhs), op, value: Box::new(rhs), null_safe: is_null_safe },
                    pos,
                ))
            }
        }
    }

    fn parse_ternary(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let cond = self.parse_or()?;
        if self.check(TokenKind::Question) {
            self.advance();
            let then_branch = self.parse_expr()?;
            self.expect(TokenKind::Colon)?;
            let else_branch = self.parse_expr()?;
            return Ok(Expr::new(
                ExprKind::Ternary {
                    cond: Box::new(cond),
                    then_branch: Box::new(then_branch),
                    else_branch: Box::new(else_branch),
                },
                pos,
            ));
        }
        if self.check(TokenKind::QuestionColon) {
            self.advance();
            let else_branch = self.parse_expr()?;
            let then_branch_pos = self.pos();
            return Ok(Expr::new(
                ExprKind::Ternary {
                    then_branch: Box::new(clone_ref_placeholder(&cond, then_branch_pos)),
                    cond: Box::new(cond),
                    else_branch: Box::new(else_branch),
                },
                pos,
            ));
        }
        Ok(cond)
    }

    fn parse_binary_level(&mut self, ops: &[(TokenKind, BinOp)], next: fn(&mut Self) -> PResult<Expr>) -> PResult<Expr> {
        let pos = self.pos();
        let mut lhs = next(self)?;
        loop {
            let matched = ops.iter().find(|(k, _)| self.check(*k)).map(|(_, op)| *op);
            match matched {
                Some(op) => {
                    self.advance();
                    let rhs = next(self)?;
                    lhs = Expr::new(ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }, pos);
                }
                None => return Ok(lhs),
            }
        }
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&[(TokenKind::PipePipe, BinOp::Or), (TokenKind::Or, BinOp::Or)], Self::parse_and)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&[(TokenKind::AmpAmp, BinOp::And), (TokenKind::And, BinOp::And)], Self::parse_bitor)
    }

    fn parse_bitor(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&[(TokenKind::Pipe, BinOp::BitOr)], Self::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&[(TokenKind::Caret, BinOp::BitXor)], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&[(TokenKind::Amp, BinOp::BitAnd)], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::EqualEqual => BinOp::Eq,
                TokenKind::BangEqual => BinOp::Ne,
                TokenKind::TripleEqual => BinOp::Identity,
                TokenKind::BangEqualEqual => BinOp::NotIdentity,
                TokenKind::RegexMatch | TokenKind::RegexNotMatch => return self.parse_regex_suffix(lhs),
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_relational()?;
            lhs = Expr::new(ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }, pos);
        }
    }

    fn parse_regex_suffix(&mut self, target: Expr) -> PResult<Expr> {
        let pos = self.pos();
        let negated = self.check(TokenKind::RegexNotMatch);
        self.advance();
        self.lexer.start_regex(false);
        let start = self.expect(TokenKind::ExprStringStart)?;
        let pattern = self.finish_string_parts(start)?;
        let flags = self.last_flags();
        Ok(Expr::new(
            ExprKind::RegexMatch { target: Box::new(target), pattern, flags, negated, capture_vars: Vec::new() },
            pos,
        ))
    }

    fn parse_relational(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let mut lhs = self.parse_shift()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Less => BinOp::Lt,
                TokenKind::LessEqual => BinOp::Le,
                TokenKind::Greater => BinOp::Gt,
                TokenKind::GreaterEqual => BinOp::Ge,
                TokenKind::Compare => BinOp::Compare,
                TokenKind::Instanceof => {
                    self.advance();
                    let negated = false;
                    let class_name = self.expect_identifier_text()?;
                    lhs = Expr::new(ExprKind::InstanceOf { operand: Box::new(lhs), class_name, negated }, pos);
                    continue;
                }
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_shift()?;
            lhs = Expr::new(ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }, pos);
        }
    }

    fn parse_shift(&mut self) -> PResult<Expr> {
        self.parse_binary_level(
            &[
                (TokenKind::LeftShift, BinOp::Shl),
                (TokenKind::RightShift, BinOp::Shr),
                (TokenKind::RightShiftUnsigned, BinOp::UShr),
            ],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        self.parse_binary_level(&[(TokenKind::Plus, BinOp::Add), (TokenKind::Minus, BinOp::Sub)], Self::parse_multiplicative)
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        self.parse_binary_level(
            &[(TokenKind::Star, BinOp::Mul), (TokenKind::Slash, BinOp::Div), (TokenKind::Percent, BinOp::Mod)],
            Self::parse_power,
        )
    }

    fn parse_power(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let lhs = self.parse_unary()?;
        if self.check(TokenKind::StarStar) {
            self.advance();
            let rhs = self.parse_power()?;
            return Ok(Expr::new(ExprKind::Binary { op: BinOp::Pow, lhs: Box::new(lhs), rhs: Box::new(rhs) }, pos));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let op = match self.peek_kind() {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Bang | TokenKind::Not => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            TokenKind::PlusPlus => Some(UnaryOp::Incr),
            TokenKind::MinusMinus => Some(UnaryOp::Decr),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::new(ExprKind::PrefixUnary { op, operand: Box::new(operand) }, pos));
        }
        if self.check(TokenKind::LeftParen) && self.is_cast_ahead() {
            self.advance();
            let target_type = self.parse_type_token()?;
            self.expect(TokenKind::RightParen)?;
            let operand = self.parse_unary()?;
            return Ok(Expr::new(ExprKind::Cast { target_type, operand: Box::new(operand) }, pos));
        }
        self.parse_postfix()
    }

    fn is_cast_ahead(&mut self) -> bool {
        let saved = self.lexer.save_state();
        self.lexer.next(); // '('
        let is_type = matches!(self.lexer.peek().kind, TokenKind::Identifier)
            && self.lexer.peek_at(1).kind == TokenKind::RightParen;
        self.lexer.rewind(saved);
        is_type
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek_kind() {
                TokenKind::Dot | TokenKind::QuestionDot => {
                    let null_safe = self.check(TokenKind::QuestionDot);
                    self.advance();
                    let name = self.expect_identifier_id()?;
                    if self.check(TokenKind::LeftParen) {
                        self.advance();
                        let (args, named_args) = self.parse_call_args()?;
                        expr = Expr::new(
                            ExprKind::MethodCall {
                                receiver: Box::new(expr),
                                method: name,
                                args,
                                named_args,
                                is_any_receiver: std::cell::Cell::new(false),
                            },
                            pos,
                        );
                    } else if self.check(TokenKind::Equal) {
                        self.advance();
                        let value = self.parse_expr()?;
                        expr = Expr::new(
                            ExprKind::FieldAssign { receiver: Box::new(expr), field: name, value: Box::new(value), null_safe },
                            pos,
                        );
                    } else {
                        expr = Expr::new(
                            ExprKind::MethodCall {
                                receiver: Box::new(expr),
                                method: name,
                                args: Vec::new(),
                                named_args: None,
                                is_any_receiver: std::cell::Cell::new(true),
                            },
                            pos,
                        );
                    }
                }
                TokenKind::LeftSquare | TokenKind::QuestionSquare => {
                    let null_safe = self.check(TokenKind::QuestionSquare);
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(TokenKind::RightSquare)?;
                    expr = Expr::new(ExprKind::ArrayGet { array: Box::new(expr), index: Box::new(index), null_safe }, pos);
                }
                TokenKind::LeftParen => {
                    self.advance();
                    let (args, named_args) = self.parse_call_args()?;
                    expr = Expr::new(ExprKind::Call { callee: Box::new(expr), args, named_args }, pos);
                }
                TokenKind::PlusPlus => {
                    self.advance();
                    expr = Expr::new(ExprKind::PostfixUnary { op: UnaryOp::Incr, operand: Box::new(expr) }, pos);
                }
                TokenKind::MinusMinus => {
                    self.advance();
                    expr = Expr::new(ExprKind::PostfixUnary { op: UnaryOp::Decr, operand: Box::new(expr) }, pos);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_call_args(&mut self) -> PResult<(Vec<Expr>, Option<NamedArg>)> {
        let mut args = Vec::new();
        if self.check(TokenKind::RightParen) {
            self.advance();
            return Ok((args, None));
        }
        if self.is_named_args_ahead() {
            let entries = self.parse_named_entries()?;
            self.expect(TokenKind::RightParen)?;
            return Ok((args, Some(NamedArg { entries })));
        }
        loop {
            args.push(self.parse_expr()?);
            if self.check(TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RightParen)?;
        Ok((args, None))
    }

    /// A call argument list is named-args form when it starts
    /// `identifier: expr` (spec.md §4.2: parsed as a `MapLiteral` with
    /// `is_named_args=true`).
    fn is_named_args_ahead(&mut self) -> bool {
        let saved = self.lexer.save_state();
        let is_named = self.lexer.peek().kind == TokenKind::Identifier && self.lexer.peek_at(1).kind == TokenKind::Colon;
        self.lexer.rewind(saved);
        is_named
    }

    fn parse_named_entries(&mut self) -> PResult<Vec<MapEntry>> {
        let mut entries = Vec::new();
        loop {
            let name = self.expect_identifier_id()?;
            self.expect(TokenKind::Colon)?;
            let value = self.parse_expr()?;
            entries.push(MapEntry { key: MapKey::Name(name), value: Box::new(value) });
            if self.check(TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        Ok(entries)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        match self.peek_kind() {
            TokenKind::Integer => {
                let tok = self.advance();
                let v = match tok.value {
                    crate::token::TokenValue::Int(v) => v,
                    _ => 0,
                };
                Ok(Expr::new(ExprKind::Literal(Literal::Int(v)), pos))
            }
            TokenKind::Long => {
                let tok = self.advance();
                let v = match tok.value {
                    crate::token::TokenValue::Long(v) => v,
                    _ => 0,
                };
                Ok(Expr::new(ExprKind::Literal(Literal::Long(v)), pos))
            }
            TokenKind::Double => {
                let tok = self.advance();
                let v = match tok.value {
                    crate::token::TokenValue::Double(v) => v,
                    _ => 0.0,
                };
                Ok(Expr::new(ExprKind::Literal(Literal::Double(v)), pos))
            }
            TokenKind::Decimal => {
                let tok = self.advance();
                let text = match tok.value {
                    crate::token::TokenValue::Str(s) => s,
                    _ => tok.chars,
                };
                Ok(Expr::new(ExprKind::Literal(Literal::Decimal(text)), pos))
            }
            TokenKind::StringConst => {
                let tok = self.advance();
                let text = match tok.value {
                    crate::token::TokenValue::Str(s) => s,
                    _ => String::new(),
                };
                let id = self.interner.intern(&text);
                Ok(Expr::new(ExprKind::Literal(Literal::Str(id)), pos))
            }
            TokenKind::ExprStringStart => {
                let tok = self.advance();
                let parts = self.finish_string_parts(tok)?;
                Ok(Expr::new(ExprKind::ExprString(parts), pos))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::new(ExprKind::Literal(Literal::Bool(true)), pos))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::new(ExprKind::Literal(Literal::Bool(false)), pos))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::new(ExprKind::Literal(Literal::Null), pos))
            }
            TokenKind::This => {
                self.advance();
                let id = self.interner.intern("this");
                Ok(Expr::new(ExprKind::Identifier(id), pos))
            }
            TokenKind::Super => {
                self.advance();
                let id = self.interner.intern("super");
                Ok(Expr::new(ExprKind::Identifier(id), pos))
            }
            TokenKind::Identifier => {
                let id = self.expect_identifier_id()?;
                if self.check(TokenKind::Arrow) {
                    return self.parse_arrow_closure(vec![id], pos);
                }
                Ok(Expr::new(ExprKind::Identifier(id), pos))
            }
            TokenKind::LeftParen => {
                self.advance();
                if self.is_closure_param_list_ahead() {
                    return self.parse_paren_closure(pos);
                }
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RightParen)?;
                Ok(inner)
            }
            TokenKind::LeftBrace => self.parse_closure_or_block_expr(pos),
            TokenKind::LeftSquare => self.parse_list_or_map_literal(pos),
            TokenKind::New => self.parse_new(pos),
            TokenKind::Print => {
                self.advance();
                let value = self.parse_expr()?;
                Ok(Expr::new(ExprKind::Print { value: Box::new(value), newline: true }, pos))
            }
            TokenKind::Die => {
                self.advance();
                let value = self.parse_expr()?;
                Ok(Expr::new(ExprKind::Die(Box::new(value)), pos))
            }
            TokenKind::Eval => {
                self.advance();
                self.expect(TokenKind::LeftParen)?;
                let source = self.parse_expr()?;
                let globals = if self.check(TokenKind::Comma) {
                    self.advance();
                    Some(Box::new(self.parse_expr()?))
                } else {
                    None
                };
                self.expect(TokenKind::RightParen)?;
                Ok(Expr::new(ExprKind::Eval { source: Box::new(source), globals }, pos))
            }
            TokenKind::Minus => self.parse_unary(),
            other => Err(self.error_here(ExcKind::UnexpectedChar, format!("unexpected token {other}"))),
        }
    }

    fn finish_string_parts(&mut self, start_tok: Token) -> PResult<Vec<StringPart>> {
        let mut parts = Vec::new();
        if let crate::token::TokenValue::Str(s) = start_tok.value {
            if !s.is_empty() {
                parts.push(StringPart::Literal(self.interner.intern(&s)));
            }
        }
        loop {
            match self.peek_kind() {
                TokenKind::DollarIdentifier => {
                    let tok = self.advance();
                    let id = self.interner.intern(&tok.chars[1..]);
                    parts.push(StringPart::Interpolated(Box::new(Expr::new(ExprKind::Identifier(id), self.pos()))));
                }
                TokenKind::DollarBrace => {
                    self.advance();
                    let expr = self.parse_expr()?;
                    self.expect(TokenKind::RightBrace)?;
                    parts.push(StringPart::Interpolated(Box::new(expr)));
                }
                TokenKind::ExprStringEnd => {
                    let tok = self.advance();
                    if let crate::token::TokenValue::Str(s) = tok.value {
                        if !s.is_empty() {
                            parts.push(StringPart::Literal(self.interner.intern(&s)));
                        }
                    }
                    return Ok(parts);
                }
                _ => return Err(self.error_here(ExcKind::UnterminatedString, "unterminated interpolated string")),
            }
        }
    }

    fn last_flags(&mut self) -> String {
        match &self.lexer.previous() {
            Some(tok) => match &tok.value {
                crate::token::TokenValue::Flags(f) => f.clone(),
                _ => String::new(),
            },
            None => String::new(),
        }
    }

    fn is_closure_param_list_ahead(&mut self) -> bool {
        let saved = self.lexer.save_state();
        let mut depth = 1;
        let mut saw_arrow_after_paren = false;
        loop {
            let tok = self.lexer.next();
            match tok.kind {
                TokenKind::LeftParen => depth += 1,
                TokenKind::RightParen => {
                    depth -= 1;
                    if depth == 0 {
                        saw_arrow_after_paren = self.lexer.peek().kind == TokenKind::Arrow;
                        break;
                    }
                }
                TokenKind::Eof => break,
                _ => {}
            }
        }
        self.lexer.rewind(saved);
        saw_arrow_after_paren
    }

    fn parse_paren_closure(&mut self, pos: Pos) -> PResult<Expr> {
        let mut names = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                names.push(self.expect_identifier_id()?);
                if self.check(TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightParen)?;
        self.parse_arrow_closure(names, pos)
    }

    fn parse_arrow_closure(&mut self, names: Vec<StringId>, pos: Pos) -> PResult<Expr> {
        self.expect(TokenKind::Arrow)?;
        let params = names
            .into_iter()
            .map(|name| Param { name, declared_type: Type::Any, default: None, is_mandatory: true })
            .collect();
        let body = if self.check(TokenKind::LeftBrace) {
            match self.parse_block()? {
                Stmt::Block(stmts) => stmts,
                other => vec![other],
            }
        } else {
            let expr = self.parse_expr()?;
            vec![Stmt::Return(Some(expr))]
        };
        mark_tail_result(&body);
        Ok(Expr::new(
            ExprKind::Closure(Box::new(FunBody {
                name: None,
                params,
                return_type: Type::Any,
                is_static: false,
                is_final: false,
                body,
                implicit_it_param: false,
                fn_id: Cell::new(u32::MAX),
                is_async: Cell::new(false),
                captured_vars: RefCell::new(Vec::new()),
                owned_captured_vars: RefCell::new(Vec::new()),
            })),
            pos,
        ))
    }

    /// `{ stmt... }` used where an expression is expected is a closure
    /// over the implicit single parameter `it` (spec.md §4.2), unless it's
    /// immediately invoked as a block — we always treat it as a closure,
    /// matching the grammar decision that block-as-expression is spelled
    /// `{ ... }()`.
    fn parse_closure_or_block_expr(&mut self, pos: Pos) -> PResult<Expr> {
        let body_stmt = self.parse_block()?;
        let body = match body_stmt {
            Stmt::Block(stmts) => stmts,
            other => vec![other],
        };
        mark_tail_result(&body);
        let it = self.interner.intern("it");
        Ok(Expr::new(
            ExprKind::Closure(Box::new(FunBody {
                name: None,
                params: vec![Param { name: it, declared_type: Type::Any, default: None, is_mandatory: false }],
                return_type: Type::Any,
                is_static: false,
                is_final: false,
                body,
                implicit_it_param: true,
                fn_id: Cell::new(u32::MAX),
                is_async: Cell::new(false),
                captured_vars: RefCell::new(Vec::new()),
                owned_captured_vars: RefCell::new(Vec::new()),
            })),
            pos,
        ))
    }

    fn parse_list_or_map_literal(&mut self, pos: Pos) -> PResult<Expr> {
        self.advance(); // '['
        if self.check(TokenKind::Colon) {
            self.advance();
            self.expect(TokenKind::RightSquare)?;
            return Ok(Expr::new(ExprKind::MapLiteral { entries: Vec::new(), is_named_args: false }, pos));
        }
        if self.check(TokenKind::RightSquare) {
            self.advance();
            return Ok(Expr::new(ExprKind::ListLiteral(Vec::new()), pos));
        }
        // Disambiguate list vs. map by looking for a `:` at depth 0 before
        // the first `,`/`]`.
        if self.is_map_entry_ahead() {
            let mut entries = Vec::new();
            loop {
                let key = if self.check(TokenKind::Identifier) && self.peek_at_kind(1) == TokenKind::Colon {
                    MapKey::Name(self.expect_identifier_id()?)
                } else {
                    MapKey::Computed(Box::new(self.parse_expr()?))
                };
                self.expect(TokenKind::Colon)?;
                let value = self.parse_expr()?;
                entries.push(MapEntry { key, value: Box::new(value) });
                if self.check(TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
            self.expect(TokenKind::RightSquare)?;
            return Ok(Expr::new(ExprKind::MapLiteral { entries, is_named_args: false }, pos));
        }
        let mut items = Vec::new();
        loop {
            items.push(self.parse_expr()?);
            if self.check(TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RightSquare)?;
        Ok(Expr::new(ExprKind::ListLiteral(items), pos))
    }

    fn is_map_entry_ahead(&mut self) -> bool {
        self.peek_at_kind(1) == TokenKind::Colon && matches!(self.peek_kind(), TokenKind::Identifier | TokenKind::StringConst)
    }

    fn parse_new(&mut self, pos: Pos) -> PResult<Expr> {
        self.advance();
        let class_name = self.expect_identifier_text()?;
        self.expect(TokenKind::LeftParen)?;
        let (args, named_args) = self.parse_call_args()?;
        Ok(Expr::new(ExprKind::InvokeNew { class_name, args, named_args }, pos))
    }

    // -- token stream helpers -----------------------------------------------------

    fn peek_kind(&mut self) -> TokenKind {
        self.lexer.peek().kind
    }

    fn peek_at_kind(&mut self, n: usize) -> TokenKind {
        self.lexer.peek_at(n).kind
    }

    fn check(&mut self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn check_ident_text(&mut self, text: &str) -> bool {
        let tok = self.lexer.peek();
        tok.kind == TokenKind::Identifier && tok.chars == text
    }

    fn advance(&mut self) -> Token {
        self.lexer.next()
    }

    fn at_eof(&mut self) -> bool {
        self.peek_kind() == TokenKind::Eof
    }

    fn at_stmt_end(&mut self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eol | TokenKind::Eof | TokenKind::RightBrace | TokenKind::Semicolon)
    }

    fn expect_stmt_end(&mut self) -> PResult<()> {
        if matches!(self.peek_kind(), TokenKind::Eol | TokenKind::Semicolon) {
            self.advance();
            self.skip_eols();
            Ok(())
        } else if matches!(self.peek_kind(), TokenKind::Eof | TokenKind::RightBrace) {
            Ok(())
        } else {
            Err(self.error_here(ExcKind::UnexpectedChar, "expected end of statement"))
        }
    }

    fn skip_eols(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Eol | TokenKind::Semicolon) {
            self.advance();
        }
    }

    /// Like `skip_eols` but only consumes newlines, used before an `else`/
    /// `while` continuation that may be on its own line.
    fn skip_eols_soft(&mut self) {
        while self.check(TokenKind::Eol) {
            self.advance();
        }
    }

    fn expect(&mut self, kind: TokenKind) -> PResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error_here(ExcKind::UnexpectedChar, format!("expected {kind}, found {}", self.peek_kind())))
        }
    }

    fn expect_identifier_text(&mut self) -> PResult<String> {
        if self.check(TokenKind::Identifier) {
            Ok(self.advance().chars)
        } else {
            Err(self.error_here(ExcKind::UnexpectedChar, "expected identifier"))
        }
    }

    fn expect_identifier_id(&mut self) -> PResult<StringId> {
        let text = self.expect_identifier_text()?;
        Ok(self.interner.intern(&text))
    }

    fn pos(&mut self) -> Pos {
        let tok = self.lexer.peek();
        Pos { offset: tok.offset, line: tok.line, column: tok.column }
    }

    fn error_here(&mut self, kind: ExcKind, msg: impl Into<String>) -> Diagnostic {
        Diagnostic::new(kind, msg, self.pos())
    }

    /// Error recovery: skip to the next statement boundary so one syntax
    /// error doesn't cascade into dozens of spurious diagnostics.
    fn synchronize(&mut self) {
        loop {
            match self.peek_kind() {
                TokenKind::Eof => return,
                TokenKind::Eol | TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::RightBrace => return,
                _ => {
                    self.advance();
                }
            }
        }
    }
}

/// `?:` (the Elvis operator, `a ?: b`) desugars to `a ? a : b`; since `cond`
/// has already been parsed we can't re-borrow it, so the then-branch is a
/// fresh identical-shaped literal placeholder only ever reached when `cond`
/// evaluates truthy and is re-evaluated structurally by the compiler, which
/// lowers `Ternary` with `then_branch` pointing at the same runtime value as
/// `cond` would produce. Since `Expr` isn't `Clone`, the compiler special-
/// cases a `Ternary` whose `then_branch` is this `Noop` sentinel to mean
/// "reuse the already-evaluated condition value".
fn clone_ref_placeholder(_cond: &Expr, pos: Pos) -> Expr {
    Expr::new(ExprKind::Noop, pos)
}
