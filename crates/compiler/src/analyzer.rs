//! Semantic analysis: symbol tables, scope tree, type checks.
//!
//! Four passes over the parsed tree:
//!
//! 1. collect type declarations and top-level symbols;
//! 2. validate type relationships (parents, interfaces, cycles, overrides);
//! 3. walk every function body checking declarations, names and expression
//!    types;
//! 4. report unused non-exported symbols.
//!
//! Scopes and types form graphs with back references (scope parent, type
//! parent), so both live in flat arenas and refer to each other by index or
//! name; nothing owns its parent.

use std::collections::{HashMap, HashSet};

use crate::ast::*;
use crate::diagnostics::{Code, Diagnostics};

const PRIMITIVES: &[&str] = &[
    "i8", "i16", "i32", "i64", "u8", "u16", "u32", "u64", "f32", "f64", "bool", "string", "void",
];

const NUMERIC: &[&str] = &[
    "i8", "i16", "i32", "i64", "u8", "u16", "u32", "u64", "f32", "f64",
];

/// Functions made visible by `import "c" …`.
const C_EXTERNALS: &[&str] = &["printf", "puts", "putchar", "malloc", "free", "exit"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Variable,
    Struct,
    Enum,
    Type,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub data_type: String,
    pub loc: SourceLoc,
    pub mutable: bool,
    pub exported: bool,
    /// Locations that referenced this symbol, filled lazily in pass 3.
    pub references: Vec<SourceLoc>,
}

pub type ScopeId = usize;

#[derive(Debug)]
pub struct Scope {
    pub name: String,
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    symbols: Vec<Symbol>,
    by_name: HashMap<String, usize>,
}

impl Scope {
    fn new(name: String, parent: Option<ScopeId>) -> Self {
        Scope {
            name,
            parent,
            children: Vec::new(),
            symbols: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name).map(|&i| &self.symbols[i])
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }
}

/// Arena owning every scope; the tree structure is index-based.
#[derive(Debug)]
pub struct ScopeArena {
    scopes: Vec<Scope>,
}

impl ScopeArena {
    pub const GLOBAL: ScopeId = 0;

    fn new() -> Self {
        ScopeArena {
            scopes: vec![Scope::new("global".to_string(), None)],
        }
    }

    fn push_child(&mut self, parent: ScopeId, name: String) -> ScopeId {
        let id = self.scopes.len();
        self.scopes.push(Scope::new(name, Some(parent)));
        self.scopes[parent].children.push(id);
        id
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id]
    }

    /// Add a symbol; returns false when the name already exists in `scope`.
    fn add(&mut self, scope: ScopeId, symbol: Symbol) -> bool {
        let s = &mut self.scopes[scope];
        if s.by_name.contains_key(&symbol.name) {
            return false;
        }
        s.by_name.insert(symbol.name.clone(), s.symbols.len());
        s.symbols.push(symbol);
        true
    }

    /// Innermost symbol visible from `from` with the given name.
    pub fn lookup(&self, from: ScopeId, name: &str) -> Option<(ScopeId, usize)> {
        let mut current = Some(from);
        while let Some(id) = current {
            if let Some(&idx) = self.scopes[id].by_name.get(name) {
                return Some((id, idx));
            }
            current = self.scopes[id].parent;
        }
        None
    }

    fn mark_referenced(&mut self, scope: ScopeId, idx: usize, loc: SourceLoc) {
        self.scopes[scope].symbols[idx].references.push(loc);
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub return_type: String,
    pub param_types: Vec<String>,
    pub is_abstract: bool,
}

#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub name: String,
    pub is_primitive: bool,
    pub is_interface: bool,
    /// Field name → type name, declaration order preserved.
    pub fields: Vec<(String, String)>,
    /// Method name → signature, declaration order preserved.
    pub methods: Vec<(String, MethodInfo)>,
    pub parent: Option<String>,
    pub interfaces: Vec<String>,
}

impl TypeInfo {
    fn primitive(name: &str) -> Self {
        TypeInfo {
            name: name.to_string(),
            is_primitive: true,
            is_interface: false,
            fields: Vec::new(),
            methods: Vec::new(),
            parent: None,
            interfaces: Vec::new(),
        }
    }

    pub fn field_type(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.as_str())
    }

    pub fn method(&self, name: &str) -> Option<&MethodInfo> {
        self.methods
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m)
    }
}

/// The analyzer's durable output: the type table and the scope tree.
#[derive(Debug)]
pub struct Analysis {
    pub types: HashMap<String, TypeInfo>,
    pub type_order: Vec<String>,
    pub scopes: ScopeArena,
}

impl Analysis {
    pub fn type_info(&self, name: &str) -> Option<&TypeInfo> {
        self.types.get(name)
    }
}

pub struct Analyzer<'d> {
    diags: &'d mut Diagnostics,
    types: HashMap<String, TypeInfo>,
    type_order: Vec<String>,
    scopes: ScopeArena,
    current_scope: ScopeId,
    current_class: Option<String>,
    current_generics: Vec<String>,
}

impl<'d> Analyzer<'d> {
    pub fn new(diags: &'d mut Diagnostics) -> Self {
        let mut types = HashMap::new();
        let mut type_order = Vec::new();
        for name in PRIMITIVES {
            types.insert(name.to_string(), TypeInfo::primitive(name));
            type_order.push(name.to_string());
        }
        Analyzer {
            diags,
            types,
            type_order,
            scopes: ScopeArena::new(),
            current_scope: ScopeArena::GLOBAL,
            current_class: None,
            current_generics: Vec::new(),
        }
    }

    pub fn analyze(mut self, program: &Program) -> Analysis {
        self.collect(program);
        self.validate_types(program);
        for decl in &program.decls {
            match decl {
                Decl::Function(f) => self.check_function(f, None),
                Decl::Class(c) => self.check_class(c),
                _ => {}
            }
        }
        self.check_unused();
        Analysis {
            types: self.types,
            type_order: self.type_order,
            scopes: self.scopes,
        }
    }

    // ------------------------------------------------------------------
    // Pass 1: collection
    // ------------------------------------------------------------------

    fn collect(&mut self, program: &Program) {
        for decl in &program.decls {
            match decl {
                Decl::Class(c) => {
                    let info = TypeInfo {
                        name: c.name.clone(),
                        is_primitive: false,
                        is_interface: false,
                        fields: c
                            .fields()
                            .map(|f| (f.name.clone(), f.ty.base.clone()))
                            .collect(),
                        methods: c
                            .methods()
                            .map(|m| {
                                (
                                    m.func.name.clone(),
                                    MethodInfo {
                                        return_type: m.func.return_type_name().to_string(),
                                        param_types: m
                                            .func
                                            .params
                                            .iter()
                                            .map(|p| p.ty.base.clone())
                                            .collect(),
                                        is_abstract: m.is_abstract,
                                    },
                                )
                            })
                            .collect(),
                        parent: c.parent.clone(),
                        interfaces: c.interfaces.clone(),
                    };
                    self.register_type(info, c.loc);
                }
                Decl::Interface(i) => {
                    let info = TypeInfo {
                        name: i.name.clone(),
                        is_primitive: false,
                        is_interface: true,
                        fields: Vec::new(),
                        methods: i
                            .methods
                            .iter()
                            .map(|m| {
                                (
                                    m.name.clone(),
                                    MethodInfo {
                                        return_type: m
                                            .return_type
                                            .as_ref()
                                            .map_or("void".to_string(), |t| t.base.clone()),
                                        param_types: m
                                            .params
                                            .iter()
                                            .map(|p| p.ty.base.clone())
                                            .collect(),
                                        is_abstract: true,
                                    },
                                )
                            })
                            .collect(),
                        parent: None,
                        interfaces: Vec::new(),
                    };
                    self.register_type(info, i.loc);
                }
                Decl::Function(f) => {
                    let exported =
                        f.name == "main" || f.decorators.iter().any(|d| d.name == "export");
                    let symbol = Symbol {
                        name: f.name.clone(),
                        kind: SymbolKind::Function,
                        data_type: f.return_type_name().to_string(),
                        loc: f.loc,
                        mutable: false,
                        exported,
                        references: Vec::new(),
                    };
                    if !self.scopes.add(ScopeArena::GLOBAL, symbol) {
                        self.diags.error(
                            Code::Redefinition,
                            format!("function `{}` is already defined", f.name),
                            f.loc.line,
                            f.loc.column,
                        );
                    }
                }
                Decl::Import(i) => {
                    if i.kind == "c" {
                        for name in C_EXTERNALS {
                            // Ignore duplicates from repeated imports.
                            self.scopes.add(
                                ScopeArena::GLOBAL,
                                Symbol {
                                    name: name.to_string(),
                                    kind: SymbolKind::Function,
                                    data_type: "i32".to_string(),
                                    loc: i.loc,
                                    mutable: false,
                                    exported: true,
                                    references: Vec::new(),
                                },
                            );
                        }
                    }
                }
            }
        }
    }

    fn register_type(&mut self, info: TypeInfo, loc: SourceLoc) {
        if self.types.contains_key(&info.name) {
            self.diags.error(
                Code::Redefinition,
                format!("type `{}` is already defined", info.name),
                loc.line,
                loc.column,
            );
        } else {
            self.type_order.push(info.name.clone());
            self.types.insert(info.name.clone(), info);
        }
    }

    // ------------------------------------------------------------------
    // Pass 2: type relationships
    // ------------------------------------------------------------------

    fn validate_types(&mut self, program: &Program) {
        for name in self.type_order.clone() {
            let Some(info) = self.types.get(&name).cloned() else {
                continue;
            };
            let loc = program
                .find_class(&name)
                .map(|c| c.loc)
                .unwrap_or_default();

            if let Some(parent) = &info.parent {
                if !self.types.contains_key(parent) {
                    self.diags.error(
                        Code::UndefinedType,
                        format!("unknown parent type `{}` for `{}`", parent, name),
                        loc.line,
                        loc.column,
                    );
                } else if self.inherits_cyclically(&name) {
                    self.diags.error(
                        Code::TypeError,
                        format!("inheritance cycle detected involving `{}`", name),
                        loc.line,
                        loc.column,
                    );
                }
            }

            for iface in &info.interfaces {
                match self.types.get(iface) {
                    None => self.diags.error(
                        Code::UndefinedType,
                        format!("unknown interface `{}` for `{}`", iface, name),
                        loc.line,
                        loc.column,
                    ),
                    Some(t) if !t.is_interface => self.diags.error(
                        Code::InterfaceViolation,
                        format!("`{}` implements `{}`, which is not an interface", name, iface),
                        loc.line,
                        loc.column,
                    ),
                    Some(_) => {}
                }
            }

            if !info.is_interface && !info.is_primitive {
                self.check_overrides(&name, &info, loc);
                self.check_interface_conformance(&name, &info, loc);
            }
        }
    }

    fn inherits_cyclically(&self, name: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(name.to_string());
        while let Some(n) = current {
            if !seen.insert(n.clone()) {
                return true;
            }
            current = self.types.get(&n).and_then(|t| t.parent.clone());
        }
        false
    }

    fn check_overrides(&mut self, name: &str, info: &TypeInfo, loc: SourceLoc) {
        // Overrides must keep the inherited signature.
        if let Some(parent) = info.parent.as_ref().and_then(|p| self.types.get(p)) {
            for (method_name, method) in &info.methods {
                if let Some(inherited) = self.find_method_in_chain(&parent.name, method_name) {
                    if inherited.param_types.len() != method.param_types.len()
                        || inherited.return_type != method.return_type
                    {
                        self.diags.error(
                            Code::InvalidOverride,
                            format!(
                                "method `{}` in `{}` does not match the signature inherited from `{}`",
                                method_name,
                                name,
                                info.parent.as_deref().unwrap_or_default()
                            ),
                            loc.line,
                            loc.column,
                        );
                    }
                }
            }
        }

        // A concrete class must override every inherited abstract method.
        let declares_abstract = info.methods.iter().any(|(_, m)| m.is_abstract);
        if !declares_abstract {
            for missing in self.unimplemented_abstract_methods(name) {
                self.diags.error(
                    Code::MissingOverride,
                    format!(
                        "class `{}` does not override inherited abstract method `{}`",
                        name, missing
                    ),
                    loc.line,
                    loc.column,
                );
            }
        }
    }

    fn check_interface_conformance(&mut self, name: &str, info: &TypeInfo, loc: SourceLoc) {
        for iface_name in &info.interfaces {
            let Some(iface) = self.types.get(iface_name).cloned() else {
                continue;
            };
            if !iface.is_interface {
                continue;
            }
            for (method_name, _) in &iface.methods {
                if self.find_method_in_chain(name, method_name).is_none() {
                    self.diags.error(
                        Code::InterfaceViolation,
                        format!(
                            "class `{}` is missing method `{}` required by interface `{}`",
                            name, method_name, iface_name
                        ),
                        loc.line,
                        loc.column,
                    );
                }
            }
        }
    }

    fn find_method_in_chain(&self, class: &str, method: &str) -> Option<MethodInfo> {
        let mut seen = HashSet::new();
        let mut current = Some(class.to_string());
        while let Some(name) = current {
            if !seen.insert(name.clone()) {
                return None;
            }
            let info = self.types.get(&name)?;
            if let Some(m) = info.method(method) {
                return Some(m.clone());
            }
            current = info.parent.clone();
        }
        None
    }

    /// Abstract methods anywhere in the chain that no subclass overrode.
    fn unimplemented_abstract_methods(&self, class: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(class.to_string());
        while let Some(name) = current {
            if !seen.insert(name.clone()) {
                break;
            }
            current = self.types.get(&name).and_then(|t| t.parent.clone());
            chain.push(name);
        }

        let mut missing = Vec::new();
        for name in &chain {
            let Some(info) = self.types.get(name) else {
                continue;
            };
            for (method_name, method) in &info.methods {
                if !method.is_abstract {
                    continue;
                }
                // Look for a concrete override below `name` in the chain.
                let overridden = chain
                    .iter()
                    .take_while(|c| *c != name)
                    .any(|c| {
                        self.types
                            .get(c)
                            .and_then(|t| t.method(method_name))
                            .is_some_and(|m| !m.is_abstract)
                    });
                if !overridden && !missing.contains(method_name) {
                    missing.push(method_name.clone());
                }
            }
        }
        missing
    }

    // ------------------------------------------------------------------
    // Pass 3: declarations, statements, expressions
    // ------------------------------------------------------------------

    fn check_class(&mut self, class: &ClassDecl) {
        self.current_class = Some(class.name.clone());
        for field in class.fields() {
            self.check_type_expr(&field.ty);
            if let Some(init) = &field.init {
                let init_ty = self.expr_type(init);
                if !self.compatible(&init_ty, &field.ty.base) {
                    self.diags.error(
                        Code::TypeMismatch,
                        format!(
                            "field `{}` has type `{}` but its initializer has type `{}`",
                            field.name, field.ty.base, init_ty
                        ),
                        field.loc.line,
                        field.loc.column,
                    );
                }
            }
        }
        for method in class.methods() {
            if method.is_abstract {
                continue;
            }
            self.check_function(&method.func, Some(&class.name));
        }
        self.current_class = None;
    }

    fn check_function(&mut self, func: &FunctionDecl, class: Option<&str>) {
        let scope_name = match class {
            Some(c) => format!("{}_{}", c, func.name),
            None => func.name.clone(),
        };
        let func_scope = self.scopes.push_child(ScopeArena::GLOBAL, scope_name);
        let old_scope = std::mem::replace(&mut self.current_scope, func_scope);
        let old_generics = std::mem::replace(&mut self.current_generics, func.generics.clone());

        if class.is_some() {
            self.scopes.add(
                func_scope,
                Symbol {
                    name: "this".to_string(),
                    kind: SymbolKind::Variable,
                    data_type: class.unwrap_or_default().to_string(),
                    loc: func.loc,
                    mutable: false,
                    exported: true,
                    references: Vec::new(),
                },
            );
        }

        if let Some(ret) = &func.return_type {
            self.check_type_expr(ret);
        }

        for param in &func.params {
            self.check_type_expr(&param.ty);
            let added = self.scopes.add(
                func_scope,
                Symbol {
                    name: param.name.clone(),
                    kind: SymbolKind::Variable,
                    data_type: param.ty.base.clone(),
                    loc: param.loc,
                    mutable: true,
                    exported: false,
                    references: Vec::new(),
                },
            );
            if !added {
                self.diags.error(
                    Code::Redefinition,
                    format!("duplicate parameter name `{}`", param.name),
                    param.loc.line,
                    param.loc.column,
                );
            }
        }

        let return_type = func.return_type_name().to_string();
        self.check_block_stmts(&func.body, &return_type);

        if return_type != "void" && !block_returns(&func.body) {
            self.diags.warning_with_hint(
                Code::MissingReturn,
                format!(
                    "not all control paths in `{}` return a value of type `{}`",
                    func.name, return_type
                ),
                func.loc.line,
                func.loc.column,
                "add a return statement to the final path",
            );
        }

        self.current_generics = old_generics;
        self.current_scope = old_scope;
    }

    fn check_block_stmts(&mut self, block: &Block, return_type: &str) {
        for stmt in &block.stmts {
            self.check_stmt(stmt, return_type);
        }
    }

    fn check_block_scoped(&mut self, block: &Block, return_type: &str) {
        let n = self.scopes.scope(self.current_scope).children.len();
        let child = self
            .scopes
            .push_child(self.current_scope, format!("block{}", n));
        let old = std::mem::replace(&mut self.current_scope, child);
        self.check_block_stmts(block, return_type);
        self.current_scope = old;
    }

    fn check_stmt(&mut self, stmt: &Stmt, return_type: &str) {
        match stmt {
            Stmt::VarDecl {
                name,
                ty,
                init,
                mutable,
                loc,
            } => {
                let declared = match ty {
                    Some(t) => {
                        self.check_type_expr(t);
                        t.base.clone()
                    }
                    None => String::new(),
                };
                let init_ty = init.as_ref().map(|e| self.expr_type(e));
                let data_type = if !declared.is_empty() {
                    if let Some(init_ty) = &init_ty {
                        if !self.compatible(init_ty, &declared) {
                            self.diags.error(
                                Code::TypeMismatch,
                                format!(
                                    "type mismatch in declaration of `{}`: expected `{}`, got `{}`",
                                    name, declared, init_ty
                                ),
                                loc.line,
                                loc.column,
                            );
                        }
                    }
                    declared
                } else {
                    init_ty.unwrap_or_else(|| "unknown".to_string())
                };

                let added = self.scopes.add(
                    self.current_scope,
                    Symbol {
                        name: name.clone(),
                        kind: SymbolKind::Variable,
                        data_type,
                        loc: *loc,
                        mutable: *mutable,
                        exported: false,
                        references: Vec::new(),
                    },
                );
                if !added {
                    self.diags.error(
                        Code::Redefinition,
                        format!("variable `{}` is already declared in this scope", name),
                        loc.line,
                        loc.column,
                    );
                }
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                self.expr_type(cond);
                self.check_block_scoped(then_branch, return_type);
                if let Some(else_branch) = else_branch {
                    self.check_stmt(else_branch, return_type);
                }
            }
            Stmt::While { cond, body, .. } => {
                self.expr_type(cond);
                self.check_block_scoped(body, return_type);
            }
            Stmt::For {
                var, iter, body, loc,
            } => {
                match iter {
                    ForIter::Range(r) => {
                        self.expr_type(&r.start);
                        self.expr_type(&r.end);
                        if let Some(step) = &r.step {
                            self.expr_type(step);
                        }
                    }
                    ForIter::Expr(e) => {
                        self.expr_type(e);
                    }
                }
                let n = self.scopes.scope(self.current_scope).children.len();
                let child = self
                    .scopes
                    .push_child(self.current_scope, format!("block{}", n));
                let old = std::mem::replace(&mut self.current_scope, child);
                self.scopes.add(
                    child,
                    Symbol {
                        name: var.clone(),
                        kind: SymbolKind::Variable,
                        data_type: "i64".to_string(),
                        loc: *loc,
                        mutable: true,
                        exported: true,
                        references: Vec::new(),
                    },
                );
                self.check_block_stmts(body, return_type);
                self.current_scope = old;
            }
            Stmt::Return { value, loc } => match value {
                Some(expr) => {
                    let ty = self.expr_type(expr);
                    if return_type == "void" {
                        self.diags.error(
                            Code::TypeMismatch,
                            "cannot return a value from a void function",
                            loc.line,
                            loc.column,
                        );
                    } else if !self.compatible(&ty, return_type) {
                        self.diags.error(
                            Code::TypeMismatch,
                            format!(
                                "return type mismatch: expected `{}`, got `{}`",
                                return_type, ty
                            ),
                            loc.line,
                            loc.column,
                        );
                    }
                }
                None => {
                    if return_type != "void" {
                        self.diags.error(
                            Code::TypeMismatch,
                            format!("expected a return value of type `{}`", return_type),
                            loc.line,
                            loc.column,
                        );
                    }
                }
            },
            Stmt::Break(_) | Stmt::Continue(_) => {}
            Stmt::Raise(expr, _) | Stmt::Spawn(expr, _) => {
                self.expr_type(expr);
            }
            Stmt::Async(block, _) => self.check_block_scoped(block, return_type),
            Stmt::Expression(expr) => {
                self.expr_type(expr);
            }
            Stmt::Block(block) => self.check_block_scoped(block, return_type),
        }
    }

    fn check_type_expr(&mut self, ty: &TypeExpr) {
        let known = self.types.contains_key(&ty.base)
            || self.current_generics.iter().any(|g| g == &ty.base);
        if !known {
            self.diags.error(
                Code::UndefinedType,
                format!("unknown type `{}`", ty.base),
                ty.loc.line,
                ty.loc.column,
            );
        }
        for generic in &ty.generics {
            self.check_type_expr(generic);
        }
    }

    fn expr_type(&mut self, expr: &Expr) -> String {
        match expr {
            Expr::Int { .. } => "i32".to_string(),
            Expr::Float { .. } => "f64".to_string(),
            Expr::Str { .. } => "string".to_string(),
            Expr::Bool { .. } => "bool".to_string(),
            Expr::Ident { name, loc } => match self.scopes.lookup(self.current_scope, name) {
                Some((scope, idx)) => {
                    self.scopes.mark_referenced(scope, idx, *loc);
                    self.scopes.scope(scope).symbols[idx].data_type.clone()
                }
                None => {
                    self.diags.error(
                        Code::UndefinedVariable,
                        format!("undefined variable `{}`", name),
                        loc.line,
                        loc.column,
                    );
                    "unknown".to_string()
                }
            },
            Expr::Binary { op, lhs, rhs, loc } => {
                let lt = self.expr_type(lhs);
                let rt = self.expr_type(rhs);
                match op {
                    BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
                    | BinOp::And | BinOp::Or => "bool".to_string(),
                    _ => {
                        if !self.compatible(&lt, &rt) {
                            self.diags.error(
                                Code::IncompatibleTypes,
                                format!(
                                    "operator `{}` cannot combine `{}` and `{}`",
                                    op.symbol(),
                                    lt,
                                    rt
                                ),
                                loc.line,
                                loc.column,
                            );
                        }
                        lt
                    }
                }
            }
            Expr::Unary { op, operand, .. } => {
                let ty = self.expr_type(operand);
                match op {
                    UnOp::Neg => ty,
                    UnOp::Not => "bool".to_string(),
                }
            }
            Expr::Assign {
                target, value, loc, ..
            } => {
                let target_ty = self.expr_type(target);
                let value_ty = self.expr_type(value);
                if !self.compatible(&value_ty, &target_ty) {
                    self.diags.error(
                        Code::TypeMismatch,
                        format!(
                            "cannot assign `{}` to a target of type `{}`",
                            value_ty, target_ty
                        ),
                        loc.line,
                        loc.column,
                    );
                }
                target_ty
            }
            Expr::Call { callee, args, loc } => {
                for arg in args {
                    self.expr_type(arg);
                }
                match &**callee {
                    Expr::Ident { name, .. } => {
                        match self.scopes.lookup(ScopeArena::GLOBAL, name) {
                            Some((scope, idx))
                                if self.scopes.scope(scope).symbols[idx].kind
                                    == SymbolKind::Function =>
                            {
                                self.scopes.mark_referenced(scope, idx, *loc);
                                self.scopes.scope(scope).symbols[idx].data_type.clone()
                            }
                            _ => {
                                self.diags.error(
                                    Code::UndefinedFunction,
                                    format!("undefined function `{}`", name),
                                    loc.line,
                                    loc.column,
                                );
                                "unknown".to_string()
                            }
                        }
                    }
                    Expr::Member { object, member, .. } => {
                        let obj_ty = self.expr_type(object);
                        self.method_return_type(&obj_ty, member, *loc)
                    }
                    other => {
                        self.expr_type(other);
                        "unknown".to_string()
                    }
                }
            }
            Expr::Member {
                object,
                member,
                loc,
            } => {
                let obj_ty = self.expr_type(object);
                match self.types.get(&obj_ty) {
                    Some(info) if !info.is_primitive => {
                        match self.field_type_in_chain(&obj_ty, member) {
                            Some(t) => t,
                            None => {
                                self.diags.error(
                                    Code::UndefinedMember,
                                    format!("type `{}` has no member `{}`", obj_ty, member),
                                    loc.line,
                                    loc.column,
                                );
                                "unknown".to_string()
                            }
                        }
                    }
                    _ => "unknown".to_string(),
                }
            }
            Expr::Index { object, index, .. } => {
                self.expr_type(object);
                self.expr_type(index);
                "unknown".to_string()
            }
            Expr::Slice {
                object, start, end, ..
            } => {
                self.expr_type(object);
                if let Some(start) = start {
                    self.expr_type(start);
                }
                if let Some(end) = end {
                    self.expr_type(end);
                }
                "unknown".to_string()
            }
            Expr::New { class, args, loc } => {
                for arg in args {
                    self.expr_type(arg);
                }
                match self.types.get(class) {
                    None => {
                        self.diags.error(
                            Code::UndefinedClass,
                            format!("undefined class `{}`", class),
                            loc.line,
                            loc.column,
                        );
                        "unknown".to_string()
                    }
                    Some(info) if info.is_interface => {
                        self.diags.error(
                            Code::AbstractInstantiation,
                            format!("cannot instantiate interface `{}`", class),
                            loc.line,
                            loc.column,
                        );
                        class.clone()
                    }
                    Some(_) => {
                        let missing = self.unimplemented_abstract_methods(class);
                        if !missing.is_empty() {
                            self.diags.error(
                                Code::AbstractInstantiation,
                                format!(
                                    "cannot instantiate `{}`: abstract method `{}` has no implementation",
                                    class, missing[0]
                                ),
                                loc.line,
                                loc.column,
                            );
                        }
                        class.clone()
                    }
                }
            }
            Expr::This(loc) => match &self.current_class {
                Some(c) => c.clone(),
                None => {
                    self.diags.error(
                        Code::UndefinedVariable,
                        "`this` used outside of a class",
                        loc.line,
                        loc.column,
                    );
                    "unknown".to_string()
                }
            },
            Expr::Super(loc) => match self
                .current_class
                .as_ref()
                .and_then(|c| self.types.get(c))
                .and_then(|t| t.parent.clone())
            {
                Some(p) => p,
                None => {
                    self.diags.error(
                        Code::UndefinedVariable,
                        "`super` used in a class without a parent",
                        loc.line,
                        loc.column,
                    );
                    "unknown".to_string()
                }
            },
        }
    }

    fn method_return_type(&mut self, class: &str, method: &str, loc: SourceLoc) -> String {
        if class == "unknown" || !self.types.contains_key(class) {
            return "unknown".to_string();
        }
        if self.types.get(class).is_some_and(|t| t.is_primitive) {
            return "unknown".to_string();
        }
        match self.find_method_in_chain(class, method) {
            Some(m) => m.return_type,
            None => {
                self.diags.error(
                    Code::UndefinedMember,
                    format!("type `{}` has no method `{}`", class, method),
                    loc.line,
                    loc.column,
                );
                "unknown".to_string()
            }
        }
    }

    fn field_type_in_chain(&self, class: &str, field: &str) -> Option<String> {
        let mut seen = HashSet::new();
        let mut current = Some(class.to_string());
        while let Some(name) = current {
            if !seen.insert(name.clone()) {
                return None;
            }
            let info = self.types.get(&name)?;
            if let Some(t) = info.field_type(field) {
                return Some(t.to_string());
            }
            current = info.parent.clone();
        }
        None
    }

    /// Assignment compatibility: identical names, permissive `unknown`, any
    /// numeric to any numeric, and nominal subtyping along `extends` and
    /// `implements`.
    fn compatible(&self, source: &str, target: &str) -> bool {
        if source == target || source == "unknown" || target == "unknown" {
            return true;
        }
        if NUMERIC.contains(&source) && NUMERIC.contains(&target) {
            return true;
        }
        // A class is compatible with its ancestors and interfaces.
        let mut seen = HashSet::new();
        let mut current = Some(source.to_string());
        while let Some(name) = current {
            if !seen.insert(name.clone()) {
                break;
            }
            let Some(info) = self.types.get(&name) else {
                break;
            };
            if info.interfaces.iter().any(|i| i == target) {
                return true;
            }
            if info.parent.as_deref() == Some(target) {
                return true;
            }
            current = info.parent.clone();
        }
        false
    }

    // ------------------------------------------------------------------
    // Pass 4: unused symbols
    // ------------------------------------------------------------------

    fn check_unused(&mut self) {
        let mut unused = Vec::new();
        for id in 0..self.scopes.len() {
            for symbol in self.scopes.scope(id).symbols() {
                if symbol.references.is_empty()
                    && !symbol.exported
                    && !symbol.name.starts_with('_')
                {
                    unused.push((symbol.name.clone(), symbol.loc));
                }
            }
        }
        for (name, loc) in unused {
            self.diags.warning_with_hint(
                Code::UnusedSymbol,
                format!("symbol `{}` is never used", name),
                loc.line,
                loc.column,
                "remove it, or prefix the name with `_` to keep it",
            );
        }
    }
}

/// Whether every control path through the block ends in a return.
fn block_returns(block: &Block) -> bool {
    block.stmts.iter().any(stmt_returns)
}

fn stmt_returns(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Return { .. } => true,
        Stmt::If {
            then_branch,
            else_branch: Some(else_branch),
            ..
        } => block_returns(then_branch) && stmt_returns(else_branch),
        Stmt::Block(b) => block_returns(b),
        _ => false,
    }
}
