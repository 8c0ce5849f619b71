//! Intermediate representation and its generator.
//!
//! The IR is a flat instruction list per function plus module-level string
//! and vtable directories. Operands are names: temporaries (`t0, t1, …`),
//! named locals, labels (`L0, L1, …`) and symbols. Both counters are
//! module-wide, so generating the same tree twice yields identical IR.
//!
//! Vtables are computed before method bodies: a subclass starts from its
//! parent's table, replaces overridden slots in place and appends its own
//! methods in declaration order, which keeps slot indices stable across the
//! hierarchy.

use std::collections::HashMap;
use std::fmt;

use crate::ast::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Label,
    Enter,
    Leave,
    StoreParam,
    Load,
    Store,
    LoadConst,
    LoadString,
    String,
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Not,
    Neg,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Jump,
    BranchFalse,
    Call,
    CallMethod,
    Return,
    ReturnVoid,
    Vtable,
    VtableEntry,
    VtableMethod,
    LoadVtable,
    SetVtable,
    Sizeof,
    Alloc,
    GetField,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Label => "label",
            Opcode::Enter => "enter",
            Opcode::Leave => "leave",
            Opcode::StoreParam => "store_param",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::LoadConst => "load_const",
            Opcode::LoadString => "load_string",
            Opcode::String => "string",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Not => "not",
            Opcode::Neg => "neg",
            Opcode::Eq => "eq",
            Opcode::Ne => "ne",
            Opcode::Lt => "lt",
            Opcode::Le => "le",
            Opcode::Gt => "gt",
            Opcode::Ge => "ge",
            Opcode::Jump => "jump",
            Opcode::BranchFalse => "branch_false",
            Opcode::Call => "call",
            Opcode::CallMethod => "call_method",
            Opcode::Return => "return",
            Opcode::ReturnVoid => "return_void",
            Opcode::Vtable => "vtable",
            Opcode::VtableEntry => "vtable_entry",
            Opcode::VtableMethod => "vtable_method",
            Opcode::LoadVtable => "load_vtable",
            Opcode::SetVtable => "set_vtable",
            Opcode::Sizeof => "sizeof",
            Opcode::Alloc => "alloc",
            Opcode::GetField => "get_field",
        }
    }

    /// Terminators end a basic block.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Jump | Opcode::BranchFalse | Opcode::Return | Opcode::ReturnVoid
        )
    }

    /// Pure opcodes have no side effects and may be folded or deduplicated.
    pub fn is_pure(self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::And
                | Opcode::Or
                | Opcode::Not
                | Opcode::Neg
                | Opcode::Eq
                | Opcode::Ne
                | Opcode::Lt
                | Opcode::Le
                | Opcode::Gt
                | Opcode::Ge
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Opcode,
    pub args: Vec<String>,
    pub result: Option<String>,
}

impl Instruction {
    pub fn new(op: Opcode, args: Vec<String>, result: Option<String>) -> Self {
        Instruction { op, args, result }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        if !self.args.is_empty() {
            write!(f, " {}", self.args.join(", "))?;
        }
        if let Some(result) = &self.result {
            write!(f, " -> {}", result)?;
        }
        Ok(())
    }
}

/// Whether a name is a generated temporary.
pub fn is_temp(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next() == Some('t') && {
        let rest = chars.as_str();
        !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
    }
}

#[derive(Debug, Clone)]
pub struct IrFunction {
    pub name: String,
    pub param_count: usize,
    pub return_type: String,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone)]
pub struct VtableDef {
    pub class: String,
    pub label: String,
    /// `(method name, implementation symbol)` in slot order.
    pub entries: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct IrModule {
    pub functions: Vec<IrFunction>,
    /// `string` and `vtable`/`vtable_entry` directives in emission order.
    pub globals: Vec<Instruction>,
    /// String pool: `(label, bytes)` in insertion order.
    pub strings: Vec<(String, String)>,
    pub vtables: Vec<VtableDef>,
    /// Full field layout per class (inherited fields first).
    pub class_fields: Vec<(String, Vec<String>)>,
    string_index: HashMap<String, usize>,
}

impl IrModule {
    pub fn find_function(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn fields_of(&self, class: &str) -> Option<&[String]> {
        self.class_fields
            .iter()
            .find(|(c, _)| c == class)
            .map(|(_, f)| f.as_slice())
    }

    pub fn instruction_count(&self) -> usize {
        self.functions.iter().map(|f| f.instructions.len()).sum()
    }

    /// Readable listing used by `--dump-ir`.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        if !self.globals.is_empty() {
            out.push_str("; module directives\n");
            for instr in &self.globals {
                out.push_str(&format!("  {}\n", instr));
            }
            out.push('\n');
        }
        for func in &self.functions {
            out.push_str(&format!("function {}:\n", func.name));
            for instr in &func.instructions {
                out.push_str(&format!("  {}\n", instr));
            }
            out.push('\n');
        }
        if !self.strings.is_empty() {
            out.push_str("; string pool\n");
            for (label, bytes) in &self.strings {
                out.push_str(&format!("  {}: {:?}\n", label, bytes));
            }
        }
        out
    }
}

/// Fail-fast error from IR generation.
#[derive(Debug)]
pub struct IrError {
    pub message: String,
    pub loc: SourceLoc,
}

impl IrError {
    fn new(message: impl Into<String>, loc: SourceLoc) -> Self {
        IrError {
            message: message.into(),
            loc,
        }
    }
}

impl fmt::Display for IrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

pub struct IrGenerator {
    module: IrModule,
    temp_counter: usize,
    label_counter: usize,
    current: Vec<Instruction>,
    /// `(continue target, break target)` for the enclosing loops.
    loop_stack: Vec<(String, String)>,
}

impl IrGenerator {
    pub fn new() -> Self {
        IrGenerator {
            module: IrModule::default(),
            temp_counter: 0,
            label_counter: 0,
            current: Vec::new(),
            loop_stack: Vec::new(),
        }
    }

    pub fn generate(mut self, program: &Program) -> Result<IrModule, IrError> {
        // Vtables and field layouts first, in source order, so subclasses
        // see their parents.
        for decl in &program.decls {
            if let Decl::Class(class) = decl {
                self.collect_class(class);
            }
        }

        for decl in &program.decls {
            match decl {
                Decl::Function(func) => self.gen_function(func, None)?,
                Decl::Class(class) => {
                    self.emit_vtable_directives(&class.name);
                    for method in class.methods() {
                        if !method.is_abstract {
                            self.gen_function(&method.func, Some(&class.name))?;
                        }
                    }
                }
                Decl::Import(_) | Decl::Interface(_) => {}
            }
        }

        Ok(self.module)
    }

    fn collect_class(&mut self, class: &ClassDecl) {
        let mut entries: Vec<(String, String)> = class
            .parent
            .as_ref()
            .and_then(|p| self.module.vtables.iter().find(|v| v.class == *p))
            .map(|v| v.entries.clone())
            .unwrap_or_default();

        for method in class.methods() {
            let impl_symbol = format!("{}_{}", class.name, method.func.name);
            match entries.iter_mut().find(|(name, _)| *name == method.func.name) {
                Some(slot) => slot.1 = impl_symbol,
                None => entries.push((method.func.name.clone(), impl_symbol)),
            }
        }

        self.module.vtables.push(VtableDef {
            class: class.name.clone(),
            label: format!("Lvt_{}", class.name),
            entries,
        });

        let mut fields: Vec<String> = class
            .parent
            .as_ref()
            .and_then(|p| self.module.fields_of(p))
            .map(|f| f.to_vec())
            .unwrap_or_default();
        fields.extend(class.fields().map(|f| f.name.clone()));
        self.module.class_fields.push((class.name.clone(), fields));
    }

    fn emit_vtable_directives(&mut self, class: &str) {
        let Some(vtable) = self.module.vtables.iter().find(|v| v.class == class) else {
            return;
        };
        let label = vtable.label.clone();
        let entries = vtable.entries.clone();
        self.module.globals.push(Instruction::new(
            Opcode::Vtable,
            vec![class.to_string()],
            Some(label.clone()),
        ));
        for (method, impl_symbol) in entries {
            self.module.globals.push(Instruction::new(
                Opcode::VtableEntry,
                vec![label.clone(), method, impl_symbol],
                None,
            ));
        }
    }

    fn gen_function(&mut self, func: &FunctionDecl, class: Option<&str>) -> Result<(), IrError> {
        let name = match class {
            Some(c) => format!("{}_{}", c, func.name),
            None => func.name.clone(),
        };
        let is_method = class.is_some();
        let param_count = func.params.len() + usize::from(is_method);

        self.current.clear();
        self.emit(Opcode::Label, vec![name.clone()], None);
        self.emit(Opcode::Enter, vec![param_count.to_string()], None);

        let mut index = 0;
        if is_method {
            self.emit(
                Opcode::StoreParam,
                vec!["0".to_string()],
                Some("this".to_string()),
            );
            index = 1;
        }
        for param in &func.params {
            self.emit(
                Opcode::StoreParam,
                vec![index.to_string()],
                Some(param.name.clone()),
            );
            index += 1;
        }

        for stmt in &func.body.stmts {
            self.gen_stmt(stmt)?;
        }

        if func.return_type_name() == "void" {
            self.emit(Opcode::ReturnVoid, vec![], None);
        }
        self.emit(Opcode::Leave, vec![], None);

        self.module.functions.push(IrFunction {
            name,
            param_count,
            return_type: func.return_type_name().to_string(),
            instructions: std::mem::take(&mut self.current),
        });
        Ok(())
    }

    fn gen_stmt(&mut self, stmt: &Stmt) -> Result<(), IrError> {
        match stmt {
            Stmt::VarDecl { name, init, .. } => {
                if let Some(init) = init {
                    let value = self.gen_expr(init)?;
                    self.emit(Opcode::Store, vec![value], Some(name.clone()));
                }
                Ok(())
            }
            Stmt::Expression(expr) => {
                self.gen_expr(expr)?;
                Ok(())
            }
            Stmt::Return { value, .. } => {
                match value {
                    Some(expr) => {
                        let v = self.gen_expr(expr)?;
                        self.emit(Opcode::Return, vec![v], None);
                    }
                    None => self.emit(Opcode::ReturnVoid, vec![], None),
                }
                Ok(())
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                let cond_temp = self.gen_expr(cond)?;
                let else_label = self.new_label();
                let end_label = self.new_label();

                self.emit(
                    Opcode::BranchFalse,
                    vec![cond_temp, else_label.clone()],
                    None,
                );
                for s in &then_branch.stmts {
                    self.gen_stmt(s)?;
                }
                self.emit(Opcode::Jump, vec![end_label.clone()], None);

                self.emit(Opcode::Label, vec![else_label], None);
                if let Some(else_branch) = else_branch {
                    self.gen_stmt(else_branch)?;
                }
                self.emit(Opcode::Label, vec![end_label], None);
                Ok(())
            }
            Stmt::While { cond, body, .. } => {
                let start_label = self.new_label();
                let end_label = self.new_label();

                self.emit(Opcode::Label, vec![start_label.clone()], None);
                let cond_temp = self.gen_expr(cond)?;
                self.emit(
                    Opcode::BranchFalse,
                    vec![cond_temp, end_label.clone()],
                    None,
                );

                self.loop_stack
                    .push((start_label.clone(), end_label.clone()));
                for s in &body.stmts {
                    self.gen_stmt(s)?;
                }
                self.loop_stack.pop();

                self.emit(Opcode::Jump, vec![start_label], None);
                self.emit(Opcode::Label, vec![end_label], None);
                Ok(())
            }
            Stmt::For {
                var, iter, body, loc,
            } => {
                let ForIter::Range(range) = iter else {
                    return Err(IrError::new(
                        "only `range(…)` iteration can be lowered; arrays have no IR form",
                        *loc,
                    ));
                };

                let start = self.gen_expr(&range.start)?;
                self.emit(Opcode::Store, vec![start], Some(var.clone()));

                let cond_label = self.new_label();
                let step_label = self.new_label();
                let end_label = self.new_label();

                // The bound and step are re-evaluated per iteration; loop
                // bounds with side effects are not supported.
                self.emit(Opcode::Label, vec![cond_label.clone()], None);
                let current = self.new_temp();
                self.emit(Opcode::Load, vec![var.clone()], Some(current.clone()));
                let bound = self.gen_expr(&range.end)?;
                let cmp = self.new_temp();
                self.emit(Opcode::Lt, vec![current, bound], Some(cmp.clone()));
                self.emit(Opcode::BranchFalse, vec![cmp, end_label.clone()], None);

                self.loop_stack
                    .push((step_label.clone(), end_label.clone()));
                for s in &body.stmts {
                    self.gen_stmt(s)?;
                }
                self.loop_stack.pop();

                self.emit(Opcode::Label, vec![step_label], None);
                let value = self.new_temp();
                self.emit(Opcode::Load, vec![var.clone()], Some(value.clone()));
                let step = match &range.step {
                    Some(step) => self.gen_expr(step)?,
                    None => {
                        let one = self.new_temp();
                        self.emit(Opcode::LoadConst, vec!["1".to_string()], Some(one.clone()));
                        one
                    }
                };
                let next = self.new_temp();
                self.emit(Opcode::Add, vec![value, step], Some(next.clone()));
                self.emit(Opcode::Store, vec![next], Some(var.clone()));
                self.emit(Opcode::Jump, vec![cond_label], None);

                self.emit(Opcode::Label, vec![end_label], None);
                Ok(())
            }
            Stmt::Break(loc) => match self.loop_stack.last() {
                Some((_, break_label)) => {
                    let label = break_label.clone();
                    self.emit(Opcode::Jump, vec![label], None);
                    Ok(())
                }
                None => Err(IrError::new("`break` outside of a loop", *loc)),
            },
            Stmt::Continue(loc) => match self.loop_stack.last() {
                Some((continue_label, _)) => {
                    let label = continue_label.clone();
                    self.emit(Opcode::Jump, vec![label], None);
                    Ok(())
                }
                None => Err(IrError::new("`continue` outside of a loop", *loc)),
            },
            Stmt::Raise(expr, _) | Stmt::Spawn(expr, _) => {
                // Evaluated for effect only; there is no runtime to hand
                // the value to.
                self.gen_expr(expr)?;
                Ok(())
            }
            Stmt::Async(block, _) | Stmt::Block(block) => {
                for s in &block.stmts {
                    self.gen_stmt(s)?;
                }
                Ok(())
            }
        }
    }

    fn gen_expr(&mut self, expr: &Expr) -> Result<String, IrError> {
        match expr {
            Expr::Int { value, .. } => {
                let t = self.new_temp();
                self.emit(Opcode::LoadConst, vec![value.to_string()], Some(t.clone()));
                Ok(t)
            }
            Expr::Float { value, .. } => {
                let t = self.new_temp();
                self.emit(
                    Opcode::LoadConst,
                    vec![format!("{:?}", value)],
                    Some(t.clone()),
                );
                Ok(t)
            }
            Expr::Bool { value, .. } => {
                let t = self.new_temp();
                let v = if *value { "1" } else { "0" };
                self.emit(Opcode::LoadConst, vec![v.to_string()], Some(t.clone()));
                Ok(t)
            }
            Expr::Str { value, .. } => {
                let label = self.intern_string(value);
                let t = self.new_temp();
                self.emit(Opcode::LoadString, vec![label], Some(t.clone()));
                Ok(t)
            }
            Expr::Ident { name, .. } => {
                let t = self.new_temp();
                self.emit(Opcode::Load, vec![name.clone()], Some(t.clone()));
                Ok(t)
            }
            Expr::This(_) | Expr::Super(_) => Ok("this".to_string()),
            Expr::Binary { op, lhs, rhs, loc } => {
                let l = self.gen_expr(lhs)?;
                let r = self.gen_expr(rhs)?;
                self.gen_binop(*op, l, r, *loc)
            }
            Expr::Unary { op, operand, .. } => {
                let v = self.gen_expr(operand)?;
                let t = self.new_temp();
                let opcode = match op {
                    UnOp::Neg => Opcode::Neg,
                    UnOp::Not => Opcode::Not,
                };
                self.emit(opcode, vec![v], Some(t.clone()));
                Ok(t)
            }
            Expr::Assign {
                op,
                target,
                value,
                loc,
            } => {
                let Expr::Ident { name, .. } = &**target else {
                    return Err(IrError::new(
                        "assignment to fields or elements has no IR form",
                        *loc,
                    ));
                };
                let rhs = self.gen_expr(value)?;
                let stored = match op {
                    AssignOp::Assign => rhs,
                    _ => {
                        let current = self.new_temp();
                        self.emit(Opcode::Load, vec![name.clone()], Some(current.clone()));
                        let opcode = match op {
                            AssignOp::Add => Opcode::Add,
                            AssignOp::Sub => Opcode::Sub,
                            AssignOp::Mul => Opcode::Mul,
                            AssignOp::Div => Opcode::Div,
                            AssignOp::Assign => unreachable!(),
                        };
                        let t = self.new_temp();
                        self.emit(opcode, vec![current, rhs], Some(t.clone()));
                        t
                    }
                };
                self.emit(Opcode::Store, vec![stored.clone()], Some(name.clone()));
                Ok(stored)
            }
            Expr::Call { callee, args, loc } => match &**callee {
                Expr::Ident { name, .. } => {
                    let mut call_args = vec![name.clone()];
                    for arg in args {
                        call_args.push(self.gen_expr(arg)?);
                    }
                    let t = self.new_temp();
                    self.emit(Opcode::Call, call_args, Some(t.clone()));
                    Ok(t)
                }
                Expr::Member { object, member, .. } => {
                    let receiver = self.gen_expr(object)?;

                    let vt = self.new_temp();
                    self.emit(Opcode::LoadVtable, vec![receiver.clone()], Some(vt.clone()));
                    let fp = self.new_temp();
                    self.emit(
                        Opcode::VtableMethod,
                        vec![vt, member.clone()],
                        Some(fp.clone()),
                    );

                    let mut call_args = vec![fp, receiver];
                    for arg in args {
                        call_args.push(self.gen_expr(arg)?);
                    }
                    let t = self.new_temp();
                    self.emit(Opcode::CallMethod, call_args, Some(t.clone()));
                    Ok(t)
                }
                _ => Err(IrError::new("call target is not callable", *loc)),
            },
            Expr::Member { object, member, .. } => {
                let obj = self.gen_expr(object)?;
                let t = self.new_temp();
                self.emit(Opcode::GetField, vec![obj, member.clone()], Some(t.clone()));
                Ok(t)
            }
            Expr::New { class, args, loc } => {
                if self.module.fields_of(class).is_none() {
                    return Err(IrError::new(format!("unknown class `{}`", class), *loc));
                }
                let size = self.new_temp();
                self.emit(Opcode::Sizeof, vec![class.clone()], Some(size.clone()));
                let obj = self.new_temp();
                self.emit(Opcode::Alloc, vec![size], Some(obj.clone()));
                self.emit(
                    Opcode::SetVtable,
                    vec![obj.clone(), format!("Lvt_{}", class)],
                    None,
                );

                let ctor = format!("{}_init", class);
                if self.module.find_function(&ctor).is_some() || self.class_has_init(class) {
                    let mut call_args = vec![ctor, obj.clone()];
                    for arg in args {
                        call_args.push(self.gen_expr(arg)?);
                    }
                    self.emit(Opcode::Call, call_args, None);
                }
                Ok(obj)
            }
            Expr::Index { loc, .. } | Expr::Slice { loc, .. } => Err(IrError::new(
                "array indexing has no IR form",
                *loc,
            )),
        }
    }

    fn gen_binop(&mut self, op: BinOp, l: String, r: String, _loc: SourceLoc) -> Result<String, IrError> {
        // `%` has no opcode of its own: a % b == a - (a / b) * b.
        if op == BinOp::Mod {
            let q = self.new_temp();
            self.emit(Opcode::Div, vec![l.clone(), r.clone()], Some(q.clone()));
            let m = self.new_temp();
            self.emit(Opcode::Mul, vec![q, r], Some(m.clone()));
            let t = self.new_temp();
            self.emit(Opcode::Sub, vec![l, m], Some(t.clone()));
            return Ok(t);
        }

        let opcode = match op {
            BinOp::Add => Opcode::Add,
            BinOp::Sub => Opcode::Sub,
            BinOp::Mul => Opcode::Mul,
            BinOp::Div => Opcode::Div,
            BinOp::Eq => Opcode::Eq,
            BinOp::Ne => Opcode::Ne,
            BinOp::Lt => Opcode::Lt,
            BinOp::Le => Opcode::Le,
            BinOp::Gt => Opcode::Gt,
            BinOp::Ge => Opcode::Ge,
            BinOp::And => Opcode::And,
            BinOp::Or => Opcode::Or,
            BinOp::Mod => unreachable!(),
        };
        let t = self.new_temp();
        self.emit(opcode, vec![l, r], Some(t.clone()));
        Ok(t)
    }

    fn class_has_init(&self, class: &str) -> bool {
        self.module
            .vtables
            .iter()
            .find(|v| v.class == class)
            .is_some_and(|v| v.entries.iter().any(|(name, _)| name == "init"))
    }

    fn intern_string(&mut self, value: &str) -> String {
        if let Some(&idx) = self.module.string_index.get(value) {
            return self.module.strings[idx].0.clone();
        }
        let label = format!("str_{}", self.module.strings.len());
        self.module
            .string_index
            .insert(value.to_string(), self.module.strings.len());
        self.module
            .strings
            .push((label.clone(), value.to_string()));
        self.module.globals.push(Instruction::new(
            Opcode::String,
            vec![value.to_string()],
            Some(label.clone()),
        ));
        label
    }

    fn emit(&mut self, op: Opcode, args: Vec<String>, result: Option<String>) {
        self.current.push(Instruction::new(op, args, result));
    }

    fn new_temp(&mut self) -> String {
        let t = format!("t{}", self.temp_counter);
        self.temp_counter += 1;
        t
    }

    fn new_label(&mut self) -> String {
        let l = format!("L{}", self.label_counter);
        self.label_counter += 1;
        l
    }
}

impl Default for IrGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use crate::diagnostics::Diagnostics;

    fn gen_ir(source: &str) -> IrModule {
        let mut diags = Diagnostics::new("test.mf");
        let tokens = Lexer::new(source).tokenize(&mut diags);
        let program = Parser::new(tokens).parse(&mut diags);
        assert!(!diags.has_errors(), "{}", diags.render());
        IrGenerator::new().generate(&program).expect("IR generation")
    }

    fn ops(func: &IrFunction) -> Vec<Opcode> {
        func.instructions.iter().map(|i| i.op).collect()
    }

    #[test]
    fn test_function_frame_shape() {
        let module = gen_ir("fn main() -> i32 { return 0; }");
        let main = module.find_function("main").unwrap();
        assert_eq!(
            ops(main),
            vec![
                Opcode::Label,
                Opcode::Enter,
                Opcode::LoadConst,
                Opcode::Return,
                Opcode::Leave
            ]
        );
        assert_eq!(main.instructions[1].args, vec!["0"]);
    }

    #[test]
    fn test_void_function_gets_trailing_return() {
        let module = gen_ir("fn f() { }");
        let f = module.find_function("f").unwrap();
        assert_eq!(
            ops(f),
            vec![
                Opcode::Label,
                Opcode::Enter,
                Opcode::ReturnVoid,
                Opcode::Leave
            ]
        );
    }

    #[test]
    fn test_params_stored_in_order() {
        let module = gen_ir("fn f(a: i32, b: i32) -> i32 { return a; }");
        let f = module.find_function("f").unwrap();
        assert_eq!(f.param_count, 2);
        assert_eq!(f.instructions[2].op, Opcode::StoreParam);
        assert_eq!(f.instructions[2].args, vec!["0"]);
        assert_eq!(f.instructions[2].result.as_deref(), Some("a"));
        assert_eq!(f.instructions[3].args, vec!["1"]);
        assert_eq!(f.instructions[3].result.as_deref(), Some("b"));
    }

    #[test]
    fn test_temps_and_labels_are_deterministic() {
        let source = "fn f(c: i32) -> i32 { if (c > 0) { return 1; } return 2; }";
        let a = gen_ir(source);
        let b = gen_ir(source);
        let fa = a.find_function("f").unwrap();
        let fb = b.find_function("f").unwrap();
        assert_eq!(fa.instructions, fb.instructions);
    }

    #[test]
    fn test_if_lowering_shape() {
        let module = gen_ir("fn f(c: i32) { if (c == 0) { g(); } else { h(); } }
                          fn g() { } fn h() { }");
        let f = module.find_function("f").unwrap();
        let o = ops(f);
        // cond, branch_false to else, then, jump end, else label, else, end label
        assert!(o.contains(&Opcode::BranchFalse));
        assert!(o.contains(&Opcode::Jump));
        let branch = f
            .instructions
            .iter()
            .find(|i| i.op == Opcode::BranchFalse)
            .unwrap();
        assert_eq!(branch.args[1], "L0");
    }

    #[test]
    fn test_while_has_back_edge() {
        let module = gen_ir("fn f(n: i32) { while (n > 0) { n = n - 1; } }");
        let f = module.find_function("f").unwrap();
        let jumps: Vec<&Instruction> = f
            .instructions
            .iter()
            .filter(|i| i.op == Opcode::Jump)
            .collect();
        assert_eq!(jumps.len(), 1);
        assert_eq!(jumps[0].args[0], "L0"); // back to the loop head
    }

    #[test]
    fn test_string_interning_is_per_module() {
        let module = gen_ir(r#"fn f() { g("a"); g("b"); g("a"); } fn g(s: string) { }"#);
        assert_eq!(module.strings.len(), 2);
        assert_eq!(module.strings[0].0, "str_0");
        assert_eq!(module.strings[0].1, "a");
        assert_eq!(module.strings[1].1, "b");
        // Three loads, two pool entries.
        let f = module.find_function("f").unwrap();
        let loads = f
            .instructions
            .iter()
            .filter(|i| i.op == Opcode::LoadString)
            .count();
        assert_eq!(loads, 3);
    }

    #[test]
    fn test_vtable_inheritance_keeps_slots() {
        let source = "
            class B {
                fn greet() -> i32 { return 1; }
                fn other() -> i32 { return 2; }
            }
            class D extends B {
                fn greet() -> i32 { return 3; }
            }
        ";
        let module = gen_ir(source);
        let b = module.vtables.iter().find(|v| v.class == "B").unwrap();
        let d = module.vtables.iter().find(|v| v.class == "D").unwrap();
        assert_eq!(b.entries[0], ("greet".to_string(), "B_greet".to_string()));
        // The override lands in the same slot; the rest is inherited.
        assert_eq!(d.entries[0], ("greet".to_string(), "D_greet".to_string()));
        assert_eq!(d.entries[1], ("other".to_string(), "B_other".to_string()));
        assert_eq!(d.label, "Lvt_D");
    }

    #[test]
    fn test_method_call_goes_through_vtable() {
        let source = "
            class B { fn greet() -> i32 { return 1; } }
            fn main() -> i32 { let b: B = new B(); return b.greet(); }
        ";
        let module = gen_ir(source);
        let main = module.find_function("main").unwrap();
        let o = ops(main);
        let lv = o.iter().position(|&op| op == Opcode::LoadVtable).unwrap();
        assert_eq!(o[lv + 1], Opcode::VtableMethod);
        assert!(o[lv..].contains(&Opcode::CallMethod));
    }

    #[test]
    fn test_new_lowering() {
        let source = "
            class C { x: i32; fn init() { } }
            fn main() -> i32 { let c: C = new C(); c; return 0; }
        ";
        let module = gen_ir(source);
        let main = module.find_function("main").unwrap();
        let o = ops(main);
        let s = o.iter().position(|&op| op == Opcode::Sizeof).unwrap();
        assert_eq!(o[s + 1], Opcode::Alloc);
        assert_eq!(o[s + 2], Opcode::SetVtable);
        assert_eq!(o[s + 3], Opcode::Call);
        let call = &main.instructions[s + 3];
        assert_eq!(call.args[0], "C_init");
    }

    #[test]
    fn test_methods_take_hidden_this() {
        let source = "class C { fn get() -> i32 { return 1; } }";
        let module = gen_ir(source);
        let get = module.find_function("C_get").unwrap();
        assert_eq!(get.param_count, 1);
        assert_eq!(get.instructions[1].args, vec!["1"]); // enter 1
        assert_eq!(get.instructions[2].result.as_deref(), Some("this"));
    }

    #[test]
    fn test_for_range_lowering() {
        let module = gen_ir("fn f() { for i in range(0, 10) { g(i); } } fn g(v: i64) { }");
        let f = module.find_function("f").unwrap();
        let o = ops(f);
        assert!(o.contains(&Opcode::Lt));
        assert!(o.contains(&Opcode::BranchFalse));
        // One back edge to the condition label.
        let jump_targets: Vec<&str> = f
            .instructions
            .iter()
            .filter(|i| i.op == Opcode::Jump)
            .map(|i| i.args[0].as_str())
            .collect();
        assert!(jump_targets.contains(&"L0"));
    }

    #[test]
    fn test_modulo_expands_to_div_mul_sub() {
        let module = gen_ir("fn f(a: i32, b: i32) -> i32 { return a % b; }");
        let f = module.find_function("f").unwrap();
        let o = ops(f);
        let d = o.iter().position(|&op| op == Opcode::Div).unwrap();
        assert_eq!(o[d + 1], Opcode::Mul);
        assert_eq!(o[d + 2], Opcode::Sub);
    }

    #[test]
    fn test_break_outside_loop_fails() {
        let mut diags = Diagnostics::new("test.mf");
        let tokens = Lexer::new("fn f() { break; }").tokenize(&mut diags);
        let program = Parser::new(tokens).parse(&mut diags);
        let result = IrGenerator::new().generate(&program);
        assert!(result.is_err());
    }

    #[test]
    fn test_is_temp() {
        assert!(is_temp("t0"));
        assert!(is_temp("t17"));
        assert!(!is_temp("this"));
        assert!(!is_temp("total"));
        assert!(!is_temp("t"));
        assert!(!is_temp("x0"));
    }
}
