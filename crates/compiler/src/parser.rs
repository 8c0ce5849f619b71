//! Recursive-descent parser for MF.
//!
//! The parser consumes the lexer's token stream (skipping comment tokens at
//! every boundary) and builds a [`Program`]. Syntax errors are reported to
//! the diagnostics sink and recovered from by advancing to the next `;` or
//! the next top-level keyword, so one run can surface several problems. The
//! returned tree is whatever could be built; `Program::had_errors` records
//! that recovery happened.

use crate::ast::*;
use crate::diagnostics::{Code, Diagnostics};
use crate::lexer::{Token, TokenKind};

/// Internal parse failure carrying the code and position for the report.
struct ParseError {
    code: Code,
    message: String,
    line: u32,
    column: u32,
}

type PResult<T> = Result<T, ParseError>;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        let mut parser = Parser { tokens, pos: 0 };
        parser.skip_comments();
        parser
    }

    pub fn parse(&mut self, diags: &mut Diagnostics) -> Program {
        let mut program = Program::new();

        while !self.at_eof() {
            let decorators = match self.parse_decorators() {
                Ok(d) => d,
                Err(e) => {
                    self.report(diags, e);
                    program.had_errors = true;
                    self.sync();
                    continue;
                }
            };
            match self.parse_top_decl(decorators) {
                Ok(decl) => program.decls.push(decl),
                Err(e) => {
                    self.report(diags, e);
                    program.had_errors = true;
                    self.sync();
                }
            }
            self.skip_comments();
        }

        program
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    fn parse_decorators(&mut self) -> PResult<Vec<Decorator>> {
        let mut decorators = Vec::new();
        while self.check_punct("@") {
            let loc = self.loc();
            self.advance();
            let name = self.expect_ident("decorator name")?;
            let mut args = Vec::new();
            if self.check_punct("(") {
                self.advance();
                if !self.check_punct(")") {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.check_punct(",") {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect_punct(")")?;
            }
            decorators.push(Decorator { name, args, loc });
            self.skip_comments();
        }
        Ok(decorators)
    }

    fn parse_top_decl(&mut self, decorators: Vec<Decorator>) -> PResult<Decl> {
        if self.check_kw("import") {
            self.parse_import(decorators).map(Decl::Import)
        } else if self.check_kw("class") {
            self.parse_class(decorators).map(Decl::Class)
        } else if self.check_kw("interface") {
            self.parse_interface(decorators).map(Decl::Interface)
        } else if self.check_kw("fn") || self.check_kw("func") {
            self.parse_function(decorators).map(Decl::Function)
        } else {
            Err(self.unexpected("`import`, `class`, `interface` or `fn`"))
        }
    }

    fn parse_import(&mut self, decorators: Vec<Decorator>) -> PResult<ImportDecl> {
        let loc = self.loc();
        self.advance(); // import
        let kind = self.expect_string("import kind")?;
        let header = if self.current().kind == TokenKind::Str {
            Some(self.expect_string("import header")?)
        } else {
            None
        };
        self.expect_punct(";")?;
        Ok(ImportDecl {
            kind,
            header,
            decorators,
            loc,
        })
    }

    fn parse_function(&mut self, decorators: Vec<Decorator>) -> PResult<FunctionDecl> {
        let loc = self.loc();
        self.advance(); // fn | func
        let name = self.expect_ident("function name")?;
        let generics = self.parse_generic_params()?;
        self.expect_punct("(")?;
        let params = self.parse_params()?;
        self.expect_punct(")")?;
        let return_type = if self.check_op("->") {
            self.advance();
            Some(self.parse_type()?)
        } else {
            None
        };
        let body = self.parse_block()?;
        Ok(FunctionDecl {
            name,
            generics,
            params,
            return_type,
            body,
            decorators,
            loc,
        })
    }

    fn parse_params(&mut self) -> PResult<Vec<Param>> {
        let mut params = Vec::new();
        if self.check_punct(")") {
            return Ok(params);
        }
        loop {
            let loc = self.loc();
            let name = self.expect_ident("parameter name")?;
            self.expect_punct(":")?;
            let ty = self.parse_type()?;
            params.push(Param { name, ty, loc });
            if self.check_punct(",") {
                self.advance();
            } else {
                break;
            }
        }
        Ok(params)
    }

    /// `<T, U>` on a declaration. Type parameters are opaque names here.
    fn parse_generic_params(&mut self) -> PResult<Vec<String>> {
        let mut generics = Vec::new();
        if self.check_op("<") {
            self.advance();
            loop {
                generics.push(self.expect_ident("type parameter")?);
                if self.check_punct(",") {
                    self.advance();
                } else {
                    break;
                }
            }
            self.expect_op(">")?;
        }
        Ok(generics)
    }

    fn parse_class(&mut self, decorators: Vec<Decorator>) -> PResult<ClassDecl> {
        let loc = self.loc();
        self.advance(); // class
        let name = self.expect_ident("class name")?;
        let generics = self.parse_generic_params()?;

        let parent = if self.check_kw("extends") {
            self.advance();
            Some(self.expect_ident("parent class name")?)
        } else {
            None
        };

        let mut interfaces = Vec::new();
        if self.check_kw("implements") {
            self.advance();
            loop {
                interfaces.push(self.expect_ident("interface name")?);
                if self.check_punct(",") {
                    self.advance();
                } else {
                    break;
                }
            }
        }

        self.expect_punct("{")?;
        let mut members = Vec::new();
        loop {
            self.skip_comments();
            if self.check_punct("}") || self.at_eof() {
                break;
            }
            members.push(self.parse_class_member()?);
        }
        self.expect_punct("}")?;

        Ok(ClassDecl {
            name,
            generics,
            parent,
            interfaces,
            members,
            decorators,
            loc,
        })
    }

    fn parse_class_member(&mut self) -> PResult<ClassMember> {
        let decorators = self.parse_decorators()?;

        // Visibility keywords are accepted and discarded; static/abstract
        // are recorded on methods.
        let mut is_static = false;
        let mut is_abstract = false;
        loop {
            if self.check_kw("public") || self.check_kw("private") || self.check_kw("protected")
                || self.check_kw("final")
            {
                self.advance();
            } else if self.check_kw("static") {
                is_static = true;
                self.advance();
            } else if self.check_kw("abstract") {
                is_abstract = true;
                self.advance();
            } else {
                break;
            }
        }

        if self.check_kw("fn") || self.check_kw("func") {
            // Abstract methods are bare signatures terminated by `;`.
            if is_abstract {
                let loc = self.loc();
                self.advance();
                let name = self.expect_ident("method name")?;
                let generics = self.parse_generic_params()?;
                self.expect_punct("(")?;
                let params = self.parse_params()?;
                self.expect_punct(")")?;
                let return_type = if self.check_op("->") {
                    self.advance();
                    Some(self.parse_type()?)
                } else {
                    None
                };
                self.expect_punct(";")?;
                let func = FunctionDecl {
                    name,
                    generics,
                    params,
                    return_type,
                    body: Block {
                        stmts: Vec::new(),
                        loc,
                    },
                    decorators,
                    loc,
                };
                return Ok(ClassMember::Method(MethodDecl {
                    func,
                    is_static,
                    is_abstract,
                }));
            }
            let func = self.parse_function(decorators)?;
            return Ok(ClassMember::Method(MethodDecl {
                func,
                is_static,
                is_abstract,
            }));
        }

        // Field: `let name: type (= init)? ;` or bare `name: type (= init)? ;`
        if self.check_kw("let") || self.check_kw("var") || self.check_kw("const") {
            self.advance();
        }
        let loc = self.loc();
        let name = self.expect_ident("field name")?;
        self.expect_punct(":")?;
        let ty = self.parse_type()?;
        let init = if self.check_op("=") {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect_punct(";")?;
        Ok(ClassMember::Field(FieldDecl {
            name,
            ty,
            init,
            decorators,
            loc,
        }))
    }

    fn parse_interface(&mut self, decorators: Vec<Decorator>) -> PResult<InterfaceDecl> {
        let loc = self.loc();
        self.advance(); // interface
        let name = self.expect_ident("interface name")?;
        self.expect_punct("{")?;

        let mut methods = Vec::new();
        loop {
            self.skip_comments();
            if self.check_punct("}") || self.at_eof() {
                break;
            }
            if self.check_kw("abstract") {
                self.advance();
            }
            if !(self.check_kw("fn") || self.check_kw("func")) {
                return Err(self.unexpected("`fn` in interface body"));
            }
            let sig_loc = self.loc();
            self.advance();
            let name = self.expect_ident("method name")?;
            self.expect_punct("(")?;
            let params = self.parse_params()?;
            self.expect_punct(")")?;
            let return_type = if self.check_op("->") {
                self.advance();
                Some(self.parse_type()?)
            } else {
                None
            };
            self.expect_punct(";")?;
            methods.push(MethodSig {
                name,
                params,
                return_type,
                loc: sig_loc,
            });
        }
        self.expect_punct("}")?;

        Ok(InterfaceDecl {
            name,
            methods,
            decorators,
            loc,
        })
    }

    fn parse_type(&mut self) -> PResult<TypeExpr> {
        let loc = self.loc();
        let is_hybrid = if self.check_kw("hybrid") {
            self.advance();
            true
        } else {
            false
        };

        let tok = self.current().clone();
        let base = match tok.kind {
            TokenKind::Type | TokenKind::Ident => {
                self.advance();
                tok.text
            }
            _ => return Err(self.unexpected("type name")),
        };

        let mut generics = Vec::new();
        if self.check_op("<") {
            self.advance();
            loop {
                generics.push(self.parse_type()?);
                if self.check_punct(",") {
                    self.advance();
                } else {
                    break;
                }
            }
            self.expect_op(">")?;
        }

        let mut array_dims = 0;
        while self.check_punct("[") {
            self.advance();
            // An optional fixed size is accepted and ignored.
            if self.current().kind == TokenKind::Int {
                self.advance();
            }
            self.expect_punct("]")?;
            array_dims += 1;
        }

        let is_pointer = if self.check_op("*") {
            self.advance();
            true
        } else {
            false
        };

        Ok(TypeExpr {
            base,
            generics,
            array_dims,
            is_pointer,
            is_hybrid,
            loc,
        })
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_block(&mut self) -> PResult<Block> {
        let loc = self.loc();
        self.expect_punct("{")?;
        let mut stmts = Vec::new();
        loop {
            self.skip_comments();
            if self.check_punct("}") || self.at_eof() {
                break;
            }
            stmts.push(self.parse_stmt()?);
        }
        self.expect_punct("}")?;
        Ok(Block { stmts, loc })
    }

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        let loc = self.loc();

        if self.check_kw("let") || self.check_kw("var") || self.check_kw("const")
            || self.check_kw("auto")
        {
            let mutable = !self.check_kw("const");
            let typed = !self.check_kw("auto");
            self.advance();
            let name = self.expect_ident("variable name")?;
            let ty = if typed && self.check_punct(":") {
                self.advance();
                Some(self.parse_type()?)
            } else {
                None
            };
            let init = if self.check_op("=") {
                self.advance();
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect_punct(";")?;
            return Ok(Stmt::VarDecl {
                name,
                ty,
                init,
                mutable,
                loc,
            });
        }

        if self.check_kw("if") {
            return self.parse_if();
        }

        if self.check_kw("while") {
            self.advance();
            self.expect_punct("(")?;
            let cond = self.parse_expr()?;
            self.expect_punct(")")?;
            let body = self.parse_block()?;
            return Ok(Stmt::While { cond, body, loc });
        }

        if self.check_kw("for") {
            self.advance();
            let var = self.expect_ident("loop variable")?;
            if !self.check_kw("in") {
                return Err(self.unexpected("`in`"));
            }
            self.advance();
            let iter = if self.check_kw("range") {
                ForIter::Range(self.parse_range()?)
            } else {
                ForIter::Expr(self.parse_expr()?)
            };
            let body = self.parse_block()?;
            return Ok(Stmt::For {
                var,
                iter,
                body,
                loc,
            });
        }

        if self.check_kw("return") || self.check_kw("ret") {
            self.advance();
            let value = if self.check_punct(";") {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect_punct(";")?;
            return Ok(Stmt::Return { value, loc });
        }

        if self.check_kw("break") {
            self.advance();
            self.expect_punct(";")?;
            return Ok(Stmt::Break(loc));
        }

        if self.check_kw("continue") {
            self.advance();
            self.expect_punct(";")?;
            return Ok(Stmt::Continue(loc));
        }

        if self.check_kw("raise") {
            self.advance();
            let value = self.parse_expr()?;
            self.expect_punct(";")?;
            return Ok(Stmt::Raise(value, loc));
        }

        if self.check_kw("spawn") {
            self.advance();
            let value = self.parse_expr()?;
            self.expect_punct(";")?;
            return Ok(Stmt::Spawn(value, loc));
        }

        if self.check_kw("async") {
            self.advance();
            let body = self.parse_block()?;
            return Ok(Stmt::Async(body, loc));
        }

        if self.check_punct("{") {
            return Ok(Stmt::Block(self.parse_block()?));
        }

        let expr = self.parse_expr()?;
        self.expect_punct(";")?;
        Ok(Stmt::Expression(expr))
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let loc = self.loc();
        self.advance(); // if
        self.expect_punct("(")?;
        let cond = self.parse_expr()?;
        self.expect_punct(")")?;
        let then_branch = self.parse_block()?;
        let else_branch = if self.check_kw("else") {
            self.advance();
            if self.check_kw("if") {
                Some(Box::new(self.parse_if()?))
            } else {
                Some(Box::new(Stmt::Block(self.parse_block()?)))
            }
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
            loc,
        })
    }

    fn parse_range(&mut self) -> PResult<RangeExpr> {
        let loc = self.loc();
        self.advance(); // range
        self.expect_punct("(")?;
        let start = Box::new(self.parse_expr()?);
        self.expect_punct(",")?;
        let end = Box::new(self.parse_expr()?);
        let step = if self.check_punct(",") {
            self.advance();
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        self.expect_punct(")")?;
        Ok(RangeExpr {
            start,
            end,
            step,
            loc,
        })
    }

    // ------------------------------------------------------------------
    // Expressions, lowest to highest precedence
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> PResult<Expr> {
        let lhs = self.parse_or()?;

        let op = if self.check_op("=") {
            Some(AssignOp::Assign)
        } else if self.check_op("+=") {
            Some(AssignOp::Add)
        } else if self.check_op("-=") {
            Some(AssignOp::Sub)
        } else if self.check_op("*=") {
            Some(AssignOp::Mul)
        } else if self.check_op("/=") {
            Some(AssignOp::Div)
        } else {
            None
        };

        if let Some(op) = op {
            let loc = self.loc();
            if !lhs.is_assignable() {
                return Err(ParseError {
                    code: Code::UnexpectedToken,
                    message: "invalid assignment target".into(),
                    line: loc.line,
                    column: loc.column,
                });
            }
            self.advance();
            // Right-associative.
            let value = self.parse_assignment()?;
            return Ok(Expr::Assign {
                op,
                target: Box::new(lhs),
                value: Box::new(value),
                loc,
            });
        }

        Ok(lhs)
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_and()?;
        while self.check_op("||") {
            let loc = self.loc();
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                loc,
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_equality()?;
        while self.check_op("&&") {
            let loc = self.loc();
            self.advance();
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                loc,
            };
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = if self.check_op("==") {
                BinOp::Eq
            } else if self.check_op("!=") {
                BinOp::Ne
            } else {
                break;
            };
            let loc = self.loc();
            self.advance();
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                loc,
            };
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = if self.check_op("<") {
                BinOp::Lt
            } else if self.check_op("<=") {
                BinOp::Le
            } else if self.check_op(">") {
                BinOp::Gt
            } else if self.check_op(">=") {
                BinOp::Ge
            } else {
                break;
            };
            let loc = self.loc();
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                loc,
            };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = if self.check_op("+") {
                BinOp::Add
            } else if self.check_op("-") {
                BinOp::Sub
            } else {
                break;
            };
            let loc = self.loc();
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                loc,
            };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = if self.check_op("*") {
                BinOp::Mul
            } else if self.check_op("/") {
                BinOp::Div
            } else if self.check_op("%") {
                BinOp::Mod
            } else {
                break;
            };
            let loc = self.loc();
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                loc,
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let op = if self.check_op("-") {
            Some(UnOp::Neg)
        } else if self.check_op("!") {
            Some(UnOp::Not)
        } else {
            None
        };
        if let Some(op) = op {
            let loc = self.loc();
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
                loc,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.check_punct("(") {
                let loc = self.loc();
                self.advance();
                let mut args = Vec::new();
                if !self.check_punct(")") {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.check_punct(",") {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect_punct(")")?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    loc,
                };
            } else if self.check_punct(".") {
                let loc = self.loc();
                self.advance();
                let member = self.expect_ident("member name")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    member,
                    loc,
                };
            } else if self.check_punct("[") {
                let loc = self.loc();
                self.advance();
                // `[a:b]`, `[:b]`, `[a:]` are slices; `[a]` is an index.
                let start = if self.check_punct(":") {
                    None
                } else {
                    Some(Box::new(self.parse_expr()?))
                };
                if self.check_punct(":") {
                    self.advance();
                    let end = if self.check_punct("]") {
                        None
                    } else {
                        Some(Box::new(self.parse_expr()?))
                    };
                    self.expect_punct("]")?;
                    expr = Expr::Slice {
                        object: Box::new(expr),
                        start,
                        end,
                        loc,
                    };
                } else {
                    self.expect_punct("]")?;
                    let index = start.ok_or_else(|| ParseError {
                        code: Code::MissingToken,
                        message: "expected index expression".into(),
                        line: loc.line,
                        column: loc.column,
                    })?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index,
                        loc,
                    };
                }
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let tok = self.current().clone();
        let loc = SourceLoc::new(tok.line, tok.column);

        match tok.kind {
            TokenKind::Int => {
                self.advance();
                let value = tok.text.parse::<i64>().map_err(|_| ParseError {
                    code: Code::UnexpectedToken,
                    message: format!("integer literal `{}` is out of range", tok.text),
                    line: loc.line,
                    column: loc.column,
                })?;
                Ok(Expr::Int { value, loc })
            }
            TokenKind::Float => {
                self.advance();
                let value = tok.text.parse::<f64>().map_err(|_| ParseError {
                    code: Code::UnexpectedToken,
                    message: format!("malformed float literal `{}`", tok.text),
                    line: loc.line,
                    column: loc.column,
                })?;
                Ok(Expr::Float { value, loc })
            }
            TokenKind::Str => {
                self.advance();
                Ok(Expr::Str {
                    value: unquote(&tok.text),
                    loc,
                })
            }
            TokenKind::Keyword if tok.text.eq_ignore_ascii_case("new") => {
                self.advance();
                let class = self.expect_ident("class name after `new`")?;
                self.expect_punct("(")?;
                let mut args = Vec::new();
                if !self.check_punct(")") {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.check_punct(",") {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect_punct(")")?;
                Ok(Expr::New { class, args, loc })
            }
            TokenKind::Ident => {
                self.advance();
                match tok.text.as_str() {
                    "this" => Ok(Expr::This(loc)),
                    "super" => Ok(Expr::Super(loc)),
                    "true" => Ok(Expr::Bool { value: true, loc }),
                    "false" => Ok(Expr::Bool { value: false, loc }),
                    _ => Ok(Expr::Ident {
                        name: tok.text,
                        loc,
                    }),
                }
            }
            TokenKind::Punct if tok.text == "(" => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn current(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn loc(&self) -> SourceLoc {
        let t = self.current();
        SourceLoc::new(t.line, t.column)
    }

    fn at_eof(&self) -> bool {
        self.current().kind == TokenKind::Eof
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if tok.kind != TokenKind::Eof {
            self.pos += 1;
        }
        self.skip_comments();
        tok
    }

    fn skip_comments(&mut self) {
        while self.tokens[self.pos].kind == TokenKind::Comment {
            self.pos += 1;
        }
    }

    fn check_kw(&self, kw: &str) -> bool {
        let t = self.current();
        t.kind == TokenKind::Keyword && t.text.eq_ignore_ascii_case(kw)
    }

    fn check_op(&self, op: &str) -> bool {
        self.current().is(TokenKind::Op, op)
    }

    fn check_punct(&self, p: &str) -> bool {
        self.current().is(TokenKind::Punct, p)
    }

    fn expect_punct(&mut self, p: &str) -> PResult<Token> {
        if self.check_punct(p) {
            Ok(self.advance())
        } else {
            Err(self.missing(&format!("`{}`", p)))
        }
    }

    fn expect_op(&mut self, op: &str) -> PResult<Token> {
        if self.check_op(op) {
            Ok(self.advance())
        } else {
            Err(self.missing(&format!("`{}`", op)))
        }
    }

    fn expect_ident(&mut self, what: &str) -> PResult<String> {
        if self.current().kind == TokenKind::Ident {
            Ok(self.advance().text)
        } else {
            Err(self.missing(what))
        }
    }

    fn expect_string(&mut self, what: &str) -> PResult<String> {
        if self.current().kind == TokenKind::Str {
            let tok = self.advance();
            Ok(unquote(&tok.text))
        } else {
            Err(self.missing(what))
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let t = self.current();
        ParseError {
            code: Code::UnexpectedToken,
            message: format!("expected {}, found `{}`", expected, describe(t)),
            line: t.line,
            column: t.column,
        }
    }

    fn missing(&self, expected: &str) -> ParseError {
        let t = self.current();
        ParseError {
            code: Code::MissingToken,
            message: format!("expected {}, found `{}`", expected, describe(t)),
            line: t.line,
            column: t.column,
        }
    }

    fn report(&self, diags: &mut Diagnostics, e: ParseError) {
        diags.error(e.code, e.message, e.line, e.column);
    }

    /// Panic-mode recovery: advance until just past the next `;`, or stop at
    /// the next top-level keyword.
    fn sync(&mut self) {
        while !self.at_eof() {
            if self.check_punct(";") {
                self.advance();
                return;
            }
            if self.check_kw("fn")
                || self.check_kw("func")
                || self.check_kw("class")
                || self.check_kw("interface")
                || self.check_kw("import")
            {
                return;
            }
            self.advance();
        }
    }
}

/// Strip the surrounding quotes from a string lexeme and process the
/// conventional escapes; unknown escapes keep the escaped character.
fn unquote(lexeme: &str) -> String {
    let inner = if lexeme.len() >= 2 {
        &lexeme[1..lexeme.len() - 1]
    } else {
        lexeme
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('0') => out.push('\0'),
                Some(other) => out.push(other),
                None => break,
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn describe(t: &Token) -> String {
    if t.kind == TokenKind::Eof {
        "end of file".to_string()
    } else {
        t.text.clone()
    }
}
