//! Recursive-descent parser producing the gene AST.

use std::collections::BTreeMap;

use super::lexer::Token;
use super::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Field {
        base: Box<Expr>,
        name: String,
    },
    /// Builtin or script-defined function call.
    Call {
        name: String,
        args: Vec<Expr>,
    },
    /// `module::function(args)`, gated by `use` imports.
    ModuleCall {
        module: String,
        name: String,
        args: Vec<Expr>,
    },
    /// `sdk.operation(args)` — a kernel call through the SDK handle.
    SdkCall {
        op: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let {
        name: String,
        value: Expr,
    },
    Assign {
        target: Expr,
        value: Expr,
    },
    Expr(Expr),
    Return(Option<Expr>),
    Break,
    Continue,
    Throw(Expr),
    If {
        condition: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    For {
        variable: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    Try {
        body: Vec<Stmt>,
        error_name: String,
        catch_body: Vec<Stmt>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub imports: Vec<String>,
    pub functions: BTreeMap<String, Function>,
}

/// Identifier the kernel is injected under.
pub const SDK_HANDLE: &str = "sdk";

pub fn parse(tokens: &[Token]) -> Result<Program, ScriptError> {
    let mut parser = Parser { tokens, pos: 0 };
    parser.program()
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> Result<(), ScriptError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            other => Err(ScriptError::Parse(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn eat_ident(&mut self) -> Result<String, ScriptError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name.clone()),
            other => Err(ScriptError::Parse(format!(
                "expected identifier, found {other:?}"
            ))),
        }
    }

    fn check(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn program(&mut self) -> Result<Program, ScriptError> {
        let mut imports = Vec::new();
        let mut functions = BTreeMap::new();

        while let Some(token) = self.peek() {
            match token {
                Token::Use => {
                    self.pos += 1;
                    let module = self.eat_ident()?;
                    self.eat(&Token::Semi)?;
                    if !imports.contains(&module) {
                        imports.push(module);
                    }
                }
                Token::Fn => {
                    self.pos += 1;
                    let name = self.eat_ident()?;
                    self.eat(&Token::LParen)?;
                    let mut params = Vec::new();
                    if !self.check(&Token::RParen) {
                        loop {
                            params.push(self.eat_ident()?);
                            if self.check(&Token::RParen) {
                                break;
                            }
                            self.eat(&Token::Comma)?;
                        }
                    }
                    let body = self.block()?;
                    functions.insert(name, Function { params, body });
                }
                other => {
                    return Err(ScriptError::Parse(format!(
                        "expected 'use' or 'fn' at top level, found {other:?}"
                    )))
                }
            }
        }

        Ok(Program { imports, functions })
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.eat(&Token::LBrace)?;
        let mut body = Vec::new();
        while !self.check(&Token::RBrace) {
            if self.peek().is_none() {
                return Err(ScriptError::Parse("unterminated block".into()));
            }
            body.push(self.statement()?);
        }
        Ok(body)
    }

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        match self.peek() {
            Some(Token::Let) => {
                self.pos += 1;
                let name = self.eat_ident()?;
                self.eat(&Token::Assign)?;
                let value = self.expression()?;
                self.eat(&Token::Semi)?;
                Ok(Stmt::Let { name, value })
            }
            Some(Token::Return) => {
                self.pos += 1;
                if self.check(&Token::Semi) {
                    Ok(Stmt::Return(None))
                } else {
                    let value = self.expression()?;
                    self.eat(&Token::Semi)?;
                    Ok(Stmt::Return(Some(value)))
                }
            }
            Some(Token::Break) => {
                self.pos += 1;
                self.eat(&Token::Semi)?;
                Ok(Stmt::Break)
            }
            Some(Token::Continue) => {
                self.pos += 1;
                self.eat(&Token::Semi)?;
                Ok(Stmt::Continue)
            }
            Some(Token::Throw) => {
                self.pos += 1;
                let value = self.expression()?;
                self.eat(&Token::Semi)?;
                Ok(Stmt::Throw(value))
            }
            Some(Token::If) => self.if_statement(),
            Some(Token::For) => {
                self.pos += 1;
                let variable = self.eat_ident()?;
                self.eat(&Token::In)?;
                let iterable = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::For {
                    variable,
                    iterable,
                    body,
                })
            }
            Some(Token::Try) => {
                self.pos += 1;
                let body = self.block()?;
                self.eat(&Token::Catch)?;
                self.eat(&Token::LParen)?;
                let error_name = self.eat_ident()?;
                self.eat(&Token::RParen)?;
                let catch_body = self.block()?;
                Ok(Stmt::Try {
                    body,
                    error_name,
                    catch_body,
                })
            }
            _ => {
                let expr = self.expression()?;
                if self.check(&Token::Assign) {
                    if !matches!(expr, Expr::Ident(_) | Expr::Index { .. }) {
                        return Err(ScriptError::Parse(
                            "assignment target must be a variable or index".into(),
                        ));
                    }
                    let value = self.expression()?;
                    self.eat(&Token::Semi)?;
                    Ok(Stmt::Assign {
                        target: expr,
                        value,
                    })
                } else {
                    self.eat(&Token::Semi)?;
                    Ok(Stmt::Expr(expr))
                }
            }
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, ScriptError> {
        self.eat(&Token::If)?;
        let condition = self.expression()?;
        let then_body = self.block()?;
        let else_body = if self.check(&Token::Else) {
            if self.peek() == Some(&Token::If) {
                vec![self.if_statement()?]
            } else {
                self.block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If {
            condition,
            then_body,
            else_body,
        })
    }

    fn expression(&mut self) -> Result<Expr, ScriptError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.and_expr()?;
        while self.check(&Token::OrOr) {
            let right = self.and_expr()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.cmp_expr()?;
        while self.check(&Token::AndAnd) {
            let right = self.cmp_expr()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn cmp_expr(&mut self) -> Result<Expr, ScriptError> {
        let left = self.add_expr()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::NotEq,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::LtEq) => BinaryOp::LtEq,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::GtEq) => BinaryOp::GtEq,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.add_expr()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn add_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.mul_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.mul_expr()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn mul_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.unary_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary_expr()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary_expr(&mut self) -> Result<Expr, ScriptError> {
        match self.peek() {
            Some(Token::Bang) => {
                self.pos += 1;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(self.unary_expr()?),
                })
            }
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(self.unary_expr()?),
                })
            }
            _ => self.postfix_expr(),
        }
    }

    fn postfix_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.primary_expr()?;
        loop {
            match self.peek() {
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.expression()?;
                    self.eat(&Token::RBracket)?;
                    expr = Expr::Index {
                        base: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Some(Token::Dot) => {
                    self.pos += 1;
                    let name = self.eat_ident()?;
                    if self.peek() == Some(&Token::LParen) {
                        let args = self.call_args()?;
                        if expr == Expr::Ident(SDK_HANDLE.to_string()) {
                            expr = Expr::SdkCall { op: name, args };
                        } else {
                            return Err(ScriptError::Parse(format!(
                                "method call '.{name}()' is only valid on '{SDK_HANDLE}'"
                            )));
                        }
                    } else {
                        expr = Expr::Field {
                            base: Box::new(expr),
                            name,
                        };
                    }
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, ScriptError> {
        self.eat(&Token::LParen)?;
        let mut args = Vec::new();
        if self.check(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.check(&Token::RParen) {
                break;
            }
            self.eat(&Token::Comma)?;
        }
        Ok(args)
    }

    fn primary_expr(&mut self) -> Result<Expr, ScriptError> {
        match self.next().cloned() {
            Some(Token::Null) => Ok(Expr::Null),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Int(value)) => Ok(Expr::Int(value)),
            Some(Token::Float(value)) => Ok(Expr::Float(value)),
            Some(Token::Str(value)) => Ok(Expr::Str(value)),
            Some(Token::Ident(name)) => match self.peek() {
                Some(Token::ColonColon) => {
                    self.pos += 1;
                    let function = self.eat_ident()?;
                    let args = self.call_args()?;
                    Ok(Expr::ModuleCall {
                        module: name,
                        name: function,
                        args,
                    })
                }
                Some(Token::LParen) => {
                    let args = self.call_args()?;
                    Ok(Expr::Call { name, args })
                }
                _ => Ok(Expr::Ident(name)),
            },
            Some(Token::LParen) => {
                let expr = self.expression()?;
                self.eat(&Token::RParen)?;
                Ok(expr)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.check(&Token::RBracket) {
                    return Ok(Expr::Array(items));
                }
                loop {
                    items.push(self.expression()?);
                    if self.check(&Token::RBracket) {
                        break;
                    }
                    self.eat(&Token::Comma)?;
                }
                Ok(Expr::Array(items))
            }
            Some(Token::LBrace) => {
                let mut entries = Vec::new();
                if self.check(&Token::RBrace) {
                    return Ok(Expr::Object(entries));
                }
                loop {
                    let key = match self.next() {
                        Some(Token::Str(key)) => key.clone(),
                        other => {
                            return Err(ScriptError::Parse(format!(
                                "object keys must be strings, found {other:?}"
                            )))
                        }
                    };
                    self.eat(&Token::Colon)?;
                    entries.push((key, self.expression()?));
                    if self.check(&Token::RBrace) {
                        break;
                    }
                    self.eat(&Token::Comma)?;
                }
                Ok(Expr::Object(entries))
            }
            other => Err(ScriptError::Parse(format!(
                "unexpected token in expression: {other:?}"
            ))),
        }
    }
}
