//! Recursive-descent parser.
//!
//! Binary operators are parsed by precedence climbing, one method per
//! precedence level. Parse errors unwind to the nearest `declaration` via
//! `ParseError`, which `synchronize`s to the next statement boundary and
//! keeps parsing, so one run reports as many errors as possible.
//!
//! `for` loops never reach the AST: they are desugared here into an
//! initializer block wrapping a `while` loop, with the condition defaulting
//! to literal `true`.

use crate::ast::*;
use crate::error::ErrorReporter;
use crate::token::{Literal, Token, TokenKind};
use std::cell::Cell;
use std::rc::Rc;

/// Internal unwind token; the diagnostic has already been reported.
#[derive(Debug)]
struct ParseError;

type PResult<T> = Result<T, ParseError>;

const MAX_ARGUMENTS: usize = 255;

pub struct Parser<'r> {
    tokens: Vec<Token>,
    current: usize,
    reporter: &'r mut ErrorReporter,
}

impl<'r> Parser<'r> {
    pub fn new(tokens: Vec<Token>, reporter: &'r mut ErrorReporter) -> Self {
        Parser {
            tokens,
            current: 0,
            reporter,
        }
    }

    pub fn parse(mut self) -> Program {
        let mut program = Program::new();
        while !self.is_at_end() {
            if let Some(decl) = self.declaration() {
                program.push(decl);
            }
        }
        program
    }

    fn declaration(&mut self) -> Option<Stmt> {
        let result = if self.match_kind(TokenKind::Class) {
            self.class_declaration()
        } else if self.match_kind(TokenKind::Fun) {
            self.function("function", FunctionKind::Function)
                .map(Stmt::Function)
        } else if self.match_kind(TokenKind::Var) {
            self.var_declaration()
        } else {
            self.statement()
        };

        match result {
            Ok(stmt) => Some(stmt),
            Err(ParseError) => {
                self.synchronize();
                None
            }
        }
    }

    fn class_declaration(&mut self) -> PResult<Stmt> {
        let name = self.consume(TokenKind::Identifier, "Expect class name.")?.clone();

        let superclass = if self.match_kind(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.")?;
            Some(VariableExpr::new(self.previous().clone()))
        } else {
            None
        };

        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.")?;

        let mut methods = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            methods.push(self.function("method", FunctionKind::Method)?);
        }

        self.consume(TokenKind::RightBrace, "Expect '}' after class body.")?;

        Ok(Stmt::Class(Box::new(ClassStmt {
            name,
            superclass,
            methods,
        })))
    }

    fn function(&mut self, what: &str, kind: FunctionKind) -> PResult<Rc<FunctionDecl>> {
        let name = self
            .consume(TokenKind::Identifier, &format!("Expect {} name.", what))?
            .clone();
        self.consume(
            TokenKind::LeftParen,
            &format!("Expect '(' after {} name.", what),
        )?;

        let mut parameters = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                if parameters.len() >= MAX_ARGUMENTS {
                    let token = self.peek().clone();
                    self.reporter
                        .error_at(&token, "Can't have more than 255 parameters.");
                }
                parameters.push(
                    self.consume(TokenKind::Identifier, "Expect parameter name.")?
                        .clone(),
                );
                if !self.match_kind(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.")?;

        self.consume(
            TokenKind::LeftBrace,
            &format!("Expect '{{' before {} body.", what),
        )?;
        let body = self.block_statements()?;

        Ok(Rc::new(FunctionDecl {
            name,
            parameters,
            body,
            kind: Cell::new(kind),
        }))
    }

    fn var_declaration(&mut self) -> PResult<Stmt> {
        let name = self
            .consume(TokenKind::Identifier, "Expect variable name.")?
            .clone();
        let initializer = if self.match_kind(TokenKind::Equal) {
            self.expression()?
        } else {
            Expr::Literal(Literal::Nil)
        };
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        )?;
        Ok(Stmt::Var(Box::new(VarStmt { name, initializer })))
    }

    fn statement(&mut self) -> PResult<Stmt> {
        if self.match_kind(TokenKind::Print) {
            return self.print_statement();
        }
        if self.match_kind(TokenKind::If) {
            return self.if_statement();
        }
        if self.match_kind(TokenKind::While) {
            return self.while_statement();
        }
        if self.match_kind(TokenKind::For) {
            return self.for_statement();
        }
        if self.match_kind(TokenKind::Return) {
            return self.return_statement();
        }
        if self.match_kind(TokenKind::LeftBrace) {
            return Ok(Stmt::Block(self.block_statements()?));
        }
        self.expression_statement()
    }

    fn print_statement(&mut self) -> PResult<Stmt> {
        let value = self.expression()?;
        self.consume(TokenKind::Semicolon, "Expect ';' after value.")?;
        Ok(Stmt::Print(value))
    }

    fn if_statement(&mut self) -> PResult<Stmt> {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.")?;
        let condition = self.expression()?;
        self.consume(TokenKind::RightParen, "Expect ')' after if condition.")?;

        let then_branch = self.statement()?;
        let else_branch = if self.match_kind(TokenKind::Else) {
            Some(self.statement()?)
        } else {
            None
        };

        Ok(Stmt::If(Box::new(IfStmt {
            condition,
            then_branch,
            else_branch,
        })))
    }

    fn while_statement(&mut self) -> PResult<Stmt> {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.")?;
        let condition = self.expression()?;
        self.consume(TokenKind::RightParen, "Expect ')' after condition.")?;
        let body = self.statement()?;

        Ok(Stmt::While(Box::new(WhileStmt { condition, body })))
    }

    /// Desugar `for (init; cond; inc) body` into
    /// `{ init; while (cond) { body; inc; } }`.
    fn for_statement(&mut self) -> PResult<Stmt> {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.")?;

        let initializer = if self.match_kind(TokenKind::Semicolon) {
            None
        } else if self.match_kind(TokenKind::Var) {
            Some(self.var_declaration()?)
        } else {
            Some(self.expression_statement()?)
        };

        let condition = if self.check(TokenKind::Semicolon) {
            Expr::Literal(Literal::Bool(true))
        } else {
            self.expression()?
        };
        self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.")?;

        let increment = if self.check(TokenKind::RightParen) {
            None
        } else {
            Some(self.expression()?)
        };
        self.consume(TokenKind::RightParen, "Expect ')' after for clauses.")?;

        let mut body = self.statement()?;

        if let Some(increment) = increment {
            body = Stmt::Block(vec![body, Stmt::Expression(increment)]);
        }

        body = Stmt::While(Box::new(WhileStmt { condition, body }));

        if let Some(initializer) = initializer {
            body = Stmt::Block(vec![initializer, body]);
        }

        Ok(body)
    }

    fn return_statement(&mut self) -> PResult<Stmt> {
        let keyword = self.previous().clone();
        let expr = if self.check(TokenKind::Semicolon) {
            None
        } else {
            Some(self.expression()?)
        };
        self.consume(TokenKind::Semicolon, "Expect ';' after return value.")?;
        Ok(Stmt::Return(Box::new(ReturnStmt { keyword, expr })))
    }

    fn block_statements(&mut self) -> PResult<Vec<Stmt>> {
        let mut statements = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            if let Some(decl) = self.declaration() {
                statements.push(decl);
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.")?;
        Ok(statements)
    }

    fn expression_statement(&mut self) -> PResult<Stmt> {
        let expr = self.expression()?;
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.")?;
        Ok(Stmt::Expression(expr))
    }

    fn expression(&mut self) -> PResult<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> PResult<Expr> {
        let expr = self.logic_or()?;

        if self.match_kind(TokenKind::Equal) {
            let equals = self.previous().clone();
            let value = self.assignment()?;

            return match expr {
                Expr::Variable(var) => Ok(Expr::Assign(Box::new(AssignExpr {
                    name: var.name,
                    value,
                    distance: Cell::new(None),
                }))),
                Expr::Get(get) => Ok(Expr::Set(Box::new(SetExpr {
                    object: get.object,
                    name: get.name,
                    value,
                }))),
                _ => {
                    // Report but don't unwind; the right-hand side parsed fine.
                    self.reporter.error_at(&equals, "Invalid assignment target.");
                    Ok(value)
                }
            };
        }

        Ok(expr)
    }

    fn logic_or(&mut self) -> PResult<Expr> {
        let mut expr = self.logic_and()?;
        while self.match_kind(TokenKind::Or) {
            let right = self.logic_and()?;
            expr = Expr::Logical(Box::new(LogicalExpr {
                left: expr,
                op: LogicalOp::Or,
                right,
            }));
        }
        Ok(expr)
    }

    fn logic_and(&mut self) -> PResult<Expr> {
        let mut expr = self.equality()?;
        while self.match_kind(TokenKind::And) {
            let right = self.equality()?;
            expr = Expr::Logical(Box::new(LogicalExpr {
                left: expr,
                op: LogicalOp::And,
                right,
            }));
        }
        Ok(expr)
    }

    fn equality(&mut self) -> PResult<Expr> {
        let mut expr = self.comparison()?;
        while self.match_kinds(&[TokenKind::BangEqual, TokenKind::EqualEqual]) {
            let token = self.previous().clone();
            let op = match token.kind {
                TokenKind::BangEqual => BinaryOp::BangEqual,
                _ => BinaryOp::EqualEqual,
            };
            let right = self.comparison()?;
            expr = Expr::Binary(Box::new(BinaryExpr {
                left: expr,
                token,
                op,
                right,
            }));
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let mut expr = self.term()?;
        while self.match_kinds(&[
            TokenKind::Greater,
            TokenKind::GreaterEqual,
            TokenKind::Less,
            TokenKind::LessEqual,
        ]) {
            let token = self.previous().clone();
            let op = match token.kind {
                TokenKind::Greater => BinaryOp::Greater,
                TokenKind::GreaterEqual => BinaryOp::GreaterEqual,
                TokenKind::Less => BinaryOp::Less,
                _ => BinaryOp::LessEqual,
            };
            let right = self.term()?;
            expr = Expr::Binary(Box::new(BinaryExpr {
                left: expr,
                token,
                op,
                right,
            }));
        }
        Ok(expr)
    }

    fn term(&mut self) -> PResult<Expr> {
        let mut expr = self.factor()?;
        while self.match_kinds(&[TokenKind::Minus, TokenKind::Plus]) {
            let token = self.previous().clone();
            let op = match token.kind {
                TokenKind::Minus => BinaryOp::Minus,
                _ => BinaryOp::Plus,
            };
            let right = self.factor()?;
            expr = Expr::Binary(Box::new(BinaryExpr {
                left: expr,
                token,
                op,
                right,
            }));
        }
        Ok(expr)
    }

    fn factor(&mut self) -> PResult<Expr> {
        let mut expr = self.unary()?;
        while self.match_kinds(&[TokenKind::Slash, TokenKind::Star]) {
            let token = self.previous().clone();
            let op = match token.kind {
                TokenKind::Slash => BinaryOp::Slash,
                _ => BinaryOp::Star,
            };
            let right = self.unary()?;
            expr = Expr::Binary(Box::new(BinaryExpr {
                left: expr,
                token,
                op,
                right,
            }));
        }
        Ok(expr)
    }

    fn unary(&mut self) -> PResult<Expr> {
        if self.match_kinds(&[TokenKind::Bang, TokenKind::Minus]) {
            let token = self.previous().clone();
            let op = match token.kind {
                TokenKind::Bang => UnaryOp::Bang,
                _ => UnaryOp::Minus,
            };
            let expr = self.unary()?;
            return Ok(Expr::Unary(Box::new(UnaryExpr { token, op, expr })));
        }
        self.call()
    }

    fn call(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;

        loop {
            if self.match_kind(TokenKind::LeftParen) {
                expr = self.finish_call(expr)?;
            } else if self.match_kind(TokenKind::Dot) {
                let name = self
                    .consume(TokenKind::Identifier, "Expect property name after '.'.")?
                    .clone();
                expr = Expr::Get(Box::new(GetExpr { object: expr, name }));
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn finish_call(&mut self, callee: Expr) -> PResult<Expr> {
        let mut arguments = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                if arguments.len() >= MAX_ARGUMENTS {
                    let token = self.peek().clone();
                    self.reporter
                        .error_at(&token, "Can't have more than 255 arguments.");
                }
                arguments.push(self.expression()?);
                if !self.match_kind(TokenKind::Comma) {
                    break;
                }
            }
        }
        let keyword = self
            .consume(TokenKind::RightParen, "Expect ')' after arguments.")?
            .clone();

        Ok(Expr::Call(Box::new(CallExpr {
            callee,
            keyword,
            arguments,
        })))
    }

    fn primary(&mut self) -> PResult<Expr> {
        if self.match_kinds(&[
            TokenKind::Number,
            TokenKind::String,
            TokenKind::True,
            TokenKind::False,
            TokenKind::Nil,
        ]) {
            return Ok(Expr::Literal(self.previous().literal.clone()));
        }

        if self.match_kind(TokenKind::This) {
            return Ok(Expr::This(Box::new(ThisExpr {
                keyword: self.previous().clone(),
                distance: Cell::new(None),
            })));
        }

        if self.match_kind(TokenKind::Super) {
            let keyword = self.previous().clone();
            self.consume(TokenKind::Dot, "Expect '.' after 'super'.")?;
            let method = self
                .consume(TokenKind::Identifier, "Expect superclass method name.")?
                .clone();
            return Ok(Expr::Super(Box::new(SuperExpr {
                keyword,
                method,
                distance: Cell::new(None),
            })));
        }

        if self.match_kind(TokenKind::Identifier) {
            return Ok(Expr::Variable(Box::new(VariableExpr::new(
                self.previous().clone(),
            ))));
        }

        if self.match_kind(TokenKind::LeftParen) {
            let expr = self.expression()?;
            self.consume(TokenKind::RightParen, "Expect ')' after expression.")?;
            return Ok(Expr::Grouping(Box::new(expr)));
        }

        let token = self.peek().clone();
        Err(self.error(&token, "Expect expression."))
    }

    /// Discard tokens until a likely statement boundary so one syntax error
    /// doesn't cascade into dozens of spurious reports.
    fn synchronize(&mut self) {
        self.advance();

        while !self.is_at_end() {
            if self.previous().kind == TokenKind::Semicolon {
                return;
            }

            match self.peek().kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }

            self.advance();
        }
    }

    fn error(&mut self, token: &Token, message: &str) -> ParseError {
        self.reporter.error_at(token, message);
        ParseError
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> PResult<&Token> {
        if self.check(kind) {
            return Ok(self.advance());
        }
        let token = self.peek().clone();
        Err(self.error(&token, message))
    }

    fn match_kind(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            return true;
        }
        false
    }

    fn match_kinds(&mut self, kinds: &[TokenKind]) -> bool {
        for &kind in kinds {
            if self.match_kind(kind) {
                return true;
            }
        }
        false
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous()
    }

    fn is_at_end(&self) -> bool {
        self.peek().kind == TokenKind::End
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Scanner;

    fn parse(source: &str) -> (Program, bool) {
        let mut reporter = ErrorReporter::new();
        let tokens = Scanner::new(source).scan_tokens(&mut reporter);
        let program = Parser::new(tokens, &mut reporter).parse();
        (program, reporter.had_error())
    }

    #[test]
    fn test_precedence_mul_binds_tighter_than_add() {
        let (program, had_error) = parse("1 + 2 * 3;");
        assert!(!had_error);
        let Stmt::Expression(Expr::Binary(add)) = &program[0] else {
            panic!("expected binary expression statement");
        };
        assert_eq!(add.op, BinaryOp::Plus);
        let Expr::Binary(mul) = &add.right else {
            panic!("expected multiplication on the right");
        };
        assert_eq!(mul.op, BinaryOp::Star);
    }

    #[test]
    fn test_assignment_to_variable() {
        let (program, had_error) = parse("x = 1;");
        assert!(!had_error);
        assert!(matches!(
            &program[0],
            Stmt::Expression(Expr::Assign(assign)) if assign.name.lexeme == "x"
        ));
    }

    #[test]
    fn test_assignment_to_property_becomes_set() {
        let (program, had_error) = parse("a.b = 1;");
        assert!(!had_error);
        assert!(matches!(&program[0], Stmt::Expression(Expr::Set(_))));
    }

    #[test]
    fn test_invalid_assignment_target_is_nonfatal() {
        let (program, had_error) = parse("1 = 2; print 3;");
        assert!(had_error);
        // The second statement still parses.
        assert_eq!(program.len(), 2);
    }

    #[test]
    fn test_for_desugars_to_while() {
        let (program, had_error) = parse("for (var i = 0; i < 3; i = i + 1) print i;");
        assert!(!had_error);
        let Stmt::Block(outer) = &program[0] else {
            panic!("expected desugared block");
        };
        assert!(matches!(outer[0], Stmt::Var(_)));
        assert!(matches!(outer[1], Stmt::While(_)));
    }

    #[test]
    fn test_for_without_condition_defaults_to_true() {
        let (program, _) = parse("for (;;) print 1;");
        let Stmt::While(while_stmt) = &program[0] else {
            panic!("expected while");
        };
        assert!(matches!(
            while_stmt.condition,
            Expr::Literal(Literal::Bool(true))
        ));
    }

    #[test]
    fn test_class_with_superclass_and_methods() {
        let (program, had_error) = parse("class B < A { hi() { print 1; } init(x) {} }");
        assert!(!had_error);
        let Stmt::Class(class) = &program[0] else {
            panic!("expected class");
        };
        assert_eq!(class.name.lexeme, "B");
        assert_eq!(class.superclass.as_ref().unwrap().name.lexeme, "A");
        assert_eq!(class.methods.len(), 2);
        assert_eq!(class.methods[0].kind.get(), FunctionKind::Method);
    }

    #[test]
    fn test_super_expression() {
        let (program, had_error) = parse("class B < A { hi() { super.hi(); } }");
        assert!(!had_error);
        let Stmt::Class(class) = &program[0] else {
            panic!("expected class");
        };
        let Stmt::Expression(Expr::Call(call)) = &class.methods[0].body[0] else {
            panic!("expected call");
        };
        assert!(matches!(&call.callee, Expr::Super(s) if s.method.lexeme == "hi"));
    }

    #[test]
    fn test_parse_error_synchronizes_to_next_statement() {
        let (program, had_error) = parse("var = 1; print 2;");
        assert!(had_error);
        assert_eq!(program.len(), 1);
        assert!(matches!(&program[0], Stmt::Print(_)));
    }

    #[test]
    fn test_256_parameters_reports_error() {
        let params: Vec<String> = (0..256).map(|i| format!("p{}", i)).collect();
        let source = format!("fun f({}) {{}}", params.join(", "));
        let (_, had_error) = parse(&source);
        assert!(had_error);
    }

    #[test]
    fn test_255_parameters_is_accepted() {
        let params: Vec<String> = (0..255).map(|i| format!("p{}", i)).collect();
        let source = format!("fun f({}) {{}}", params.join(", "));
        let (program, had_error) = parse(&source);
        assert!(!had_error);
        let Stmt::Function(decl) = &program[0] else {
            panic!("expected function");
        };
        assert_eq!(decl.parameters.len(), 255);
    }

    #[test]
    fn test_256_arguments_reports_error() {
        let args: Vec<String> = (0..256).map(|i| i.to_string()).collect();
        let source = format!("f({});", args.join(", "));
        let (_, had_error) = parse(&source);
        assert!(had_error);
    }

    #[test]
    fn test_return_without_value() {
        let (program, had_error) = parse("fun f() { return; }");
        assert!(!had_error);
        let Stmt::Function(decl) = &program[0] else {
            panic!("expected function");
        };
        let Stmt::Return(ret) = &decl.body[0] else {
            panic!("expected return");
        };
        assert!(ret.expr.is_none());
    }
}
