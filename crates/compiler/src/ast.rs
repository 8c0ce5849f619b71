//! Abstract syntax tree for MF.
//!
//! One variant per node kind, so unknown kinds are impossible by
//! construction. The tree is fully owned by [`Program`] and is not mutated
//! after parsing. Source locations are attached wherever a later stage may
//! need to point an error at user code.

use std::fmt;

/// 1-based source position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLoc {
    pub line: u32,
    pub column: u32,
}

impl SourceLoc {
    pub fn new(line: u32, column: u32) -> Self {
        SourceLoc { line, column }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A decorator attached to a declaration: `@name(arg, …)`.
///
/// Decorators are carried through the front end but not interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct Decorator {
    pub name: String,
    pub args: Vec<Expr>,
    pub loc: SourceLoc,
}

/// A type expression: base name, ordered generic arguments, array dimension
/// count, pointer flag and the `hybrid` ownership flag.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeExpr {
    pub base: String,
    pub generics: Vec<TypeExpr>,
    pub array_dims: u32,
    pub is_pointer: bool,
    pub is_hybrid: bool,
    pub loc: SourceLoc,
}

impl TypeExpr {
    pub fn simple(base: impl Into<String>, loc: SourceLoc) -> Self {
        TypeExpr {
            base: base.into(),
            generics: Vec::new(),
            array_dims: 0,
            is_pointer: false,
            is_hybrid: false,
            loc,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: TypeExpr,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub decls: Vec<Decl>,
    /// Set when the parser recovered from at least one syntax error. The
    /// tree is still whatever could be built.
    pub had_errors: bool,
}

impl Program {
    pub fn new() -> Self {
        Program {
            decls: Vec::new(),
            had_errors: false,
        }
    }

    pub fn find_function(&self, name: &str) -> Option<&FunctionDecl> {
        self.decls.iter().find_map(|d| match d {
            Decl::Function(f) if f.name == name => Some(f),
            _ => None,
        })
    }

    pub fn find_class(&self, name: &str) -> Option<&ClassDecl> {
        self.decls.iter().find_map(|d| match d {
            Decl::Class(c) if c.name == name => Some(c),
            _ => None,
        })
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decl {
    Import(ImportDecl),
    Function(FunctionDecl),
    Class(ClassDecl),
    Interface(InterfaceDecl),
}

/// `import "c" "stdio.h";` — the second string is an optional header hint.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportDecl {
    pub kind: String,
    pub header: Option<String>,
    pub decorators: Vec<Decorator>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub generics: Vec<String>,
    pub params: Vec<Param>,
    pub return_type: Option<TypeExpr>,
    pub body: Block,
    pub decorators: Vec<Decorator>,
    pub loc: SourceLoc,
}

impl FunctionDecl {
    pub fn return_type_name(&self) -> &str {
        self.return_type.as_ref().map_or("void", |t| t.base.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub name: String,
    pub generics: Vec<String>,
    pub parent: Option<String>,
    pub interfaces: Vec<String>,
    pub members: Vec<ClassMember>,
    pub decorators: Vec<Decorator>,
    pub loc: SourceLoc,
}

impl ClassDecl {
    pub fn fields(&self) -> impl Iterator<Item = &FieldDecl> {
        self.members.iter().filter_map(|m| match m {
            ClassMember::Field(f) => Some(f),
            _ => None,
        })
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodDecl> {
        self.members.iter().filter_map(|m| match m {
            ClassMember::Method(m) => Some(m),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassMember {
    Field(FieldDecl),
    Method(MethodDecl),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub name: String,
    pub ty: TypeExpr,
    pub init: Option<Expr>,
    pub decorators: Vec<Decorator>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDecl {
    pub func: FunctionDecl,
    pub is_static: bool,
    pub is_abstract: bool,
}

/// `interface I { abstract fn f() -> i32; }` — bodies are absent; each
/// method is a signature.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceDecl {
    pub name: String,
    pub methods: Vec<MethodSig>,
    pub decorators: Vec<Decorator>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodSig {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Option<TypeExpr>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `let` / `var` / `auto` / `const` declaration.
    VarDecl {
        name: String,
        ty: Option<TypeExpr>,
        init: Option<Expr>,
        mutable: bool,
        loc: SourceLoc,
    },
    If {
        cond: Expr,
        then_branch: Block,
        else_branch: Option<Box<Stmt>>,
        loc: SourceLoc,
    },
    While {
        cond: Expr,
        body: Block,
        loc: SourceLoc,
    },
    For {
        var: String,
        iter: ForIter,
        body: Block,
        loc: SourceLoc,
    },
    Return {
        value: Option<Expr>,
        loc: SourceLoc,
    },
    Break(SourceLoc),
    Continue(SourceLoc),
    Raise(Expr, SourceLoc),
    Spawn(Expr, SourceLoc),
    Async(Block, SourceLoc),
    Expression(Expr),
    Block(Block),
}

/// The iterable of a `for … in` loop. `range(a, b[, c])` is recognized
/// syntactically and kept apart from ordinary expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum ForIter {
    Range(RangeExpr),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeExpr {
    pub start: Box<Expr>,
    pub end: Box<Expr>,
    pub step: Option<Box<Expr>>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        loc: SourceLoc,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
        loc: SourceLoc,
    },
    Assign {
        op: AssignOp,
        target: Box<Expr>,
        value: Box<Expr>,
        loc: SourceLoc,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        loc: SourceLoc,
    },
    Member {
        object: Box<Expr>,
        member: String,
        loc: SourceLoc,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        loc: SourceLoc,
    },
    Slice {
        object: Box<Expr>,
        start: Option<Box<Expr>>,
        end: Option<Box<Expr>>,
        loc: SourceLoc,
    },
    New {
        class: String,
        args: Vec<Expr>,
        loc: SourceLoc,
    },
    This(SourceLoc),
    Super(SourceLoc),
    Ident {
        name: String,
        loc: SourceLoc,
    },
    Int {
        value: i64,
        loc: SourceLoc,
    },
    Float {
        value: f64,
        loc: SourceLoc,
    },
    Str {
        value: String,
        loc: SourceLoc,
    },
    Bool {
        value: bool,
        loc: SourceLoc,
    },
}

impl Expr {
    pub fn loc(&self) -> SourceLoc {
        match self {
            Expr::Binary { loc, .. }
            | Expr::Unary { loc, .. }
            | Expr::Assign { loc, .. }
            | Expr::Call { loc, .. }
            | Expr::Member { loc, .. }
            | Expr::Index { loc, .. }
            | Expr::Slice { loc, .. }
            | Expr::New { loc, .. }
            | Expr::Ident { loc, .. }
            | Expr::Int { loc, .. }
            | Expr::Float { loc, .. }
            | Expr::Str { loc, .. }
            | Expr::Bool { loc, .. } => *loc,
            Expr::This(loc) | Expr::Super(loc) => *loc,
        }
    }

    /// Whether this expression is a legal assignment target.
    pub fn is_assignable(&self) -> bool {
        matches!(
            self,
            Expr::Ident { .. } | Expr::Member { .. } | Expr::Index { .. }
        )
    }
}
