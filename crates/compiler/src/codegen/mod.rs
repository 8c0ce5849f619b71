//! x64 back end: lowering, register allocation, encoding, PE output.
//!
//! The pipeline hands this module an optimized [`IrModule`]; `build_image`
//! turns it into a ready-to-write [`PeImage`]:
//!
//! 1. the `.data` block is laid out (interned strings, then vtables);
//! 2. each function is register-allocated and lowered to machine
//!    instructions, `main` first so the image entry point is the first byte
//!    of `.text`;
//! 3. the whole instruction stream is encoded in one block, so internal
//!    calls resolve as rel32 without a separate link step;
//! 4. references to imported symbols and `.data` stay as fixups on the
//!    image for the PE writer to patch once section addresses exist.
//!
//! Calling convention is Win64: integer arguments in `rcx`, `rdx`, `r8`,
//! `r9`, further arguments on the stack above 32 bytes of shadow space,
//! return value in `rax`. Spill reloads and call/division sequences need
//! scratch registers; each function picks them from the registers its
//! allocation left uncolored, so scratch cannot alias a live value unless
//! every register is colored. In that case the lowering falls back to
//! `r11`/`r10`, the conventional spill-rewrite registers, and carries the
//! same latent alias the rewrite rules have always had. Spilled results
//! are stored from `rax`.
//!
//! # Module structure
//!
//! - `regalloc.rs`: live ranges, interference, graph coloring
//! - `x64.rs`: instruction model and two-pass encoder
//! - `pe.rs`: PE32+ writer and final fixup patching
//! - `error.rs`: error types

mod error;
pub mod pe;
pub mod regalloc;
pub mod x64;

pub use error::CodeGenError;

use std::collections::{HashMap, HashSet};

use crate::ir::{Instruction, IrFunction, IrModule, Opcode, is_temp};
use pe::PeImage;
use regalloc::{Allocation, Loc};
use x64::{Assembler, Cond, Inst, Mem, Reg};

const ARG_REGS: [Reg; 4] = [Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9];

/// Registers preserved around calls. Generated functions only restore
/// `rbp`, so every allocatable register is effectively caller-saved here.
const CALLER_SAVED: [Reg; 14] = regalloc::ALLOCATABLE;

/// Scratch preference for the lowering: the conventional spill-rewrite
/// registers first, then callee-ignored tail registers.
const SCRATCH_PREFERENCE: [Reg; 9] = [
    Reg::R11,
    Reg::R10,
    Reg::Rbx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

/// Imported symbols the language can reach and the DLLs providing them.
const KNOWN_EXTERNALS: &[(&str, &str)] = &[
    ("ExitProcess", "kernel32.dll"),
    ("printf", "msvcrt.dll"),
    ("puts", "msvcrt.dll"),
    ("putchar", "msvcrt.dll"),
    ("malloc", "msvcrt.dll"),
    ("free", "msvcrt.dll"),
    ("exit", "msvcrt.dll"),
];

#[derive(Debug, Default, Clone, Copy)]
pub struct BackendStats {
    pub spilled_temps: usize,
    pub text_size: usize,
    pub data_size: usize,
}

/// Lower, allocate, encode and package the module into a PE image.
pub fn build_image(
    module: &IrModule,
    image_base: u64,
    timestamp: u32,
) -> Result<(PeImage, BackendStats), CodeGenError> {
    let mut cg = CodeGen::new(module);
    cg.layout_data();

    let mut order: Vec<&IrFunction> = Vec::new();
    if let Some(main) = module.find_function("main") {
        order.push(main);
    }
    order.extend(module.functions.iter().filter(|f| f.name != "main"));

    let mut insts = Vec::new();
    let mut spilled = 0usize;
    for func in order {
        let alloc = regalloc::allocate(func);
        spilled += alloc.spill_count;
        let lowering = FunctionLowering::new(&mut cg, func, &alloc);
        lowering.lower(&mut insts)?;
    }

    // Encoder failures convert through `From<String> for CodeGenError`.
    let blob = Assembler::assemble(&insts)?;

    // Vtable slots hold absolute addresses of method bodies. Slots whose
    // implementation was never emitted (abstract methods) stay zero.
    let mut abs_fixups = Vec::new();
    for (data_offset, symbol) in &cg.pending_abs {
        if let Some(&text_offset) = blob.labels.get(symbol) {
            abs_fixups.push((*data_offset, text_offset));
        }
    }

    let mut data_rel_fixups = Vec::new();
    for (offset, label) in &blob.data_fixups {
        let data_offset = *cg
            .data_labels
            .get(label)
            .ok_or_else(|| CodeGenError::UndefinedLabel(label.clone()))?;
        data_rel_fixups.push((*offset, data_offset));
    }

    let stats = BackendStats {
        spilled_temps: spilled,
        text_size: blob.bytes.len(),
        data_size: cg.data.len(),
    };

    let imports = cg.import_table();
    let image = PeImage {
        text: blob.bytes,
        data: cg.data,
        imports,
        iat_fixups: blob.extern_fixups,
        data_rel_fixups,
        abs_fixups,
        image_base,
        timestamp,
    };
    Ok((image, stats))
}

struct CodeGen<'m> {
    module: &'m IrModule,
    data: Vec<u8>,
    data_labels: HashMap<String, usize>,
    /// `(offset in .data, text symbol)` waiting for label resolution.
    pending_abs: Vec<(usize, String)>,
    /// Method name → vtable slot index, first declaration wins.
    method_slots: HashMap<String, usize>,
    /// Field name → byte offset within the object, first declaration wins.
    field_offsets: HashMap<String, i32>,
    /// Class name → object size in bytes.
    class_sizes: HashMap<String, i64>,
    defined: HashSet<String>,
    externs_used: Vec<String>,
}

impl<'m> CodeGen<'m> {
    fn new(module: &'m IrModule) -> Self {
        let mut method_slots = HashMap::new();
        for vtable in &module.vtables {
            for (slot, (name, _)) in vtable.entries.iter().enumerate() {
                method_slots.entry(name.clone()).or_insert(slot);
            }
        }

        let mut field_offsets = HashMap::new();
        let mut class_sizes = HashMap::new();
        for (class, fields) in &module.class_fields {
            // Offset 0 is the vtable pointer.
            for (i, field) in fields.iter().enumerate() {
                field_offsets
                    .entry(field.clone())
                    .or_insert(8 + 8 * i as i32);
            }
            class_sizes.insert(class.clone(), 8 + 8 * fields.len() as i64);
        }

        let defined = module.functions.iter().map(|f| f.name.clone()).collect();

        CodeGen {
            module,
            data: Vec::new(),
            data_labels: HashMap::new(),
            pending_abs: Vec::new(),
            method_slots,
            field_offsets,
            class_sizes,
            defined,
            externs_used: Vec::new(),
        }
    }

    /// Interned strings (NUL-terminated, pool order) followed by the
    /// vtables (8-byte slots patched with absolute method addresses).
    fn layout_data(&mut self) {
        for (label, bytes) in &self.module.strings {
            self.data_labels.insert(label.clone(), self.data.len());
            self.data.extend_from_slice(bytes.as_bytes());
            self.data.push(0);
        }

        while self.data.len() % 8 != 0 {
            self.data.push(0);
        }
        for vtable in &self.module.vtables {
            self.data_labels
                .insert(vtable.label.clone(), self.data.len());
            for (_, impl_symbol) in &vtable.entries {
                self.pending_abs
                    .push((self.data.len(), impl_symbol.clone()));
                self.data.extend_from_slice(&[0u8; 8]);
            }
        }
    }

    fn mark_extern(&mut self, symbol: &str) {
        if !self.externs_used.iter().any(|s| s == symbol) {
            self.externs_used.push(symbol.to_string());
        }
    }

    fn import_table(&self) -> Vec<(String, Vec<String>)> {
        // ExitProcess is always present; printf joins whenever the module
        // carries string literals.
        let mut msvcrt: Vec<String> = Vec::new();
        if !self.module.strings.is_empty() {
            msvcrt.push("printf".to_string());
        }
        for symbol in &self.externs_used {
            let dll = KNOWN_EXTERNALS
                .iter()
                .find(|(s, _)| s == symbol)
                .map(|(_, d)| *d)
                .unwrap_or("msvcrt.dll");
            if dll == "msvcrt.dll" && !msvcrt.contains(symbol) {
                msvcrt.push(symbol.clone());
            }
        }

        let mut table = vec![(
            "kernel32.dll".to_string(),
            vec!["ExitProcess".to_string()],
        )];
        if !msvcrt.is_empty() {
            table.push(("msvcrt.dll".to_string(), msvcrt));
        }
        table
    }
}

struct FunctionLowering<'a, 'm> {
    cg: &'a mut CodeGen<'m>,
    func: &'a IrFunction,
    alloc: &'a Allocation,
    locals: HashMap<String, i32>,
    frame_size: i32,
    locals_size: i32,
    /// Primary scratch register (spill reloads, branch operands).
    scratch: Reg,
    /// Secondary scratch (second compare operand, divisors, call pointers).
    scratch2: Reg,
}

impl<'a, 'm> FunctionLowering<'a, 'm> {
    fn new(cg: &'a mut CodeGen<'m>, func: &'a IrFunction, alloc: &'a Allocation) -> Self {
        // Every named location referenced by the body gets an 8-byte frame
        // slot; spill slots follow the locals.
        let mut locals = HashMap::new();
        let mut next = 8i32;
        for instr in &func.instructions {
            match instr.op {
                Opcode::Store | Opcode::StoreParam => {
                    if let Some(name) = &instr.result {
                        locals.entry(name.clone()).or_insert_with(|| {
                            let at = next;
                            next += 8;
                            at
                        });
                    }
                }
                Opcode::Load => {
                    let name = &instr.args[0];
                    if !is_temp(name) {
                        locals.entry(name.clone()).or_insert_with(|| {
                            let at = next;
                            next += 8;
                            at
                        });
                    }
                }
                _ => {}
            }
        }

        let locals_size = next - 8;
        let raw = locals_size + 8 * alloc.spill_count as i32;
        let frame_size = (raw + 15) & !15;

        // Prefer scratch registers the allocator never colored; when the
        // whole palette is live, fall back to the conventional rewrite
        // pair and accept that a reload can clobber a colored range.
        let free = alloc.unused_registers();
        let scratch = SCRATCH_PREFERENCE
            .iter()
            .copied()
            .find(|r| free.contains(r))
            .unwrap_or(Reg::R11);
        let scratch2 = SCRATCH_PREFERENCE
            .iter()
            .copied()
            .find(|&r| r != scratch && free.contains(&r))
            .unwrap_or(if scratch == Reg::R10 { Reg::R11 } else { Reg::R10 });

        FunctionLowering {
            cg,
            func,
            alloc,
            locals,
            frame_size,
            locals_size,
            scratch,
            scratch2,
        }
    }

    fn lower(mut self, out: &mut Vec<Inst>) -> Result<(), CodeGenError> {
        for instr in &self.func.instructions {
            self.lower_instr(instr, out)?;
        }
        Ok(())
    }

    fn local_slot(&self, name: &str) -> Result<Mem, CodeGenError> {
        let off = self
            .locals
            .get(name)
            .copied()
            .ok_or_else(|| CodeGenError::UndefinedSymbol(name.to_string()))?;
        Ok(Mem::base_disp(Reg::Rbp, -off))
    }

    fn spill_slot(&self, index: usize) -> Mem {
        Mem::base_disp(Reg::Rbp, -(self.locals_size + 8 * (index as i32 + 1)))
    }

    /// Destination of a result: an allocated register or a spill slot.
    fn dest(&self, instr: &Instruction) -> Option<Loc> {
        instr
            .result
            .as_ref()
            .filter(|r| is_temp(r))
            .and_then(|r| self.alloc.loc(r))
    }

    /// Bring an operand into a register, using `scratch` when the value
    /// lives in memory (spilled temp or named local).
    fn read(&self, name: &str, scratch: Reg, out: &mut Vec<Inst>) -> Result<Reg, CodeGenError> {
        if is_temp(name) {
            match self.alloc.loc(name) {
                Some(Loc::Reg(r)) => Ok(r),
                Some(Loc::Spill(s)) => {
                    out.push(Inst::MovRM(scratch, self.spill_slot(s)));
                    Ok(scratch)
                }
                None => Err(CodeGenError::UndefinedSymbol(name.to_string())),
            }
        } else {
            out.push(Inst::MovRM(scratch, self.local_slot(name)?));
            Ok(scratch)
        }
    }

    /// Like `read`, but guarantees the value actually sits in `scratch`.
    fn read_into(
        &self,
        name: &str,
        scratch: Reg,
        out: &mut Vec<Inst>,
    ) -> Result<(), CodeGenError> {
        let r = self.read(name, scratch, out)?;
        if r != scratch {
            out.push(Inst::MovRR(scratch, r));
        }
        Ok(())
    }

    /// Store a computed register into the destination.
    fn write_dest(&self, dest: Loc, value: Reg, out: &mut Vec<Inst>) {
        match dest {
            Loc::Reg(r) => {
                if r != value {
                    out.push(Inst::MovRR(r, value));
                }
            }
            Loc::Spill(s) => out.push(Inst::MovMR(self.spill_slot(s), value)),
        }
    }

    /// `mov dest, [from]`; a spilled destination stores its rax result to
    /// the slot, with the old rax preserved around the sequence.
    fn load_mem_into(&self, dest: Loc, from: Mem, out: &mut Vec<Inst>) {
        match dest {
            Loc::Reg(r) => out.push(Inst::MovRM(r, from)),
            Loc::Spill(s) => {
                out.push(Inst::Push(Reg::Rax));
                out.push(Inst::MovRM(Reg::Rax, from));
                out.push(Inst::MovMR(self.spill_slot(s), Reg::Rax));
                out.push(Inst::Pop(Reg::Rax));
            }
        }
    }

    /// `mov dest, imm`, spilling through rax like `load_mem_into`.
    fn load_imm_into(&self, dest: Loc, value: i64, out: &mut Vec<Inst>) {
        match dest {
            Loc::Reg(r) => out.push(Inst::MovRI(r, value)),
            Loc::Spill(s) => {
                out.push(Inst::Push(Reg::Rax));
                out.push(Inst::MovRI(Reg::Rax, value));
                out.push(Inst::MovMR(self.spill_slot(s), Reg::Rax));
                out.push(Inst::Pop(Reg::Rax));
            }
        }
    }

    /// RIP-relative `lea` of a `.data` label, spilling through rax.
    fn lea_data_into(&self, dest: Loc, label: String, out: &mut Vec<Inst>) {
        match dest {
            Loc::Reg(r) => out.push(Inst::LeaData(r, label)),
            Loc::Spill(s) => {
                out.push(Inst::Push(Reg::Rax));
                out.push(Inst::LeaData(Reg::Rax, label));
                out.push(Inst::MovMR(self.spill_slot(s), Reg::Rax));
                out.push(Inst::Pop(Reg::Rax));
            }
        }
    }

    fn lower_instr(&mut self, instr: &Instruction, out: &mut Vec<Inst>) -> Result<(), CodeGenError> {
        match instr.op {
            Opcode::Label => {
                out.push(Inst::Label(instr.args[0].clone()));
            }
            Opcode::Enter => {
                out.push(Inst::Push(Reg::Rbp));
                out.push(Inst::MovRR(Reg::Rbp, Reg::Rsp));
                if self.frame_size > 0 {
                    out.push(Inst::SubRI(Reg::Rsp, self.frame_size));
                }
            }
            Opcode::Leave => {}
            Opcode::StoreParam => {
                let index: usize = instr.args[0]
                    .parse()
                    .map_err(|_| CodeGenError::Unsupported("malformed store_param".into()))?;
                let name = instr
                    .result
                    .as_ref()
                    .ok_or_else(|| CodeGenError::Unsupported("store_param without name".into()))?;
                let slot = self.local_slot(name)?;
                if index < ARG_REGS.len() {
                    out.push(Inst::MovMR(slot, ARG_REGS[index]));
                } else {
                    // Beyond the register args: home space plus stack args.
                    let from = Mem::base_disp(Reg::Rbp, 16 + 8 * index as i32);
                    out.push(Inst::MovRM(self.scratch, from));
                    out.push(Inst::MovMR(slot, self.scratch));
                }
            }
            Opcode::Load => {
                let Some(dest) = self.dest(instr) else {
                    return Ok(());
                };
                let name = &instr.args[0];
                if is_temp(name) {
                    // Copy inserted by the optimizer.
                    let src = self.read(name, self.scratch, out)?;
                    self.write_dest(dest, src, out);
                } else {
                    let slot = self.local_slot(name)?;
                    self.load_mem_into(dest, slot, out);
                }
            }
            Opcode::Store => {
                let name = instr
                    .result
                    .as_ref()
                    .ok_or_else(|| CodeGenError::Unsupported("store without target".into()))?;
                let slot = self.local_slot(name)?;
                let value = self.read(&instr.args[0], self.scratch, out)?;
                out.push(Inst::MovMR(slot, value));
            }
            Opcode::LoadConst => {
                let Some(dest) = self.dest(instr) else {
                    return Ok(());
                };
                let value = parse_const(&instr.args[0])?;
                self.load_imm_into(dest, value, out);
            }
            Opcode::LoadString => {
                let Some(dest) = self.dest(instr) else {
                    return Ok(());
                };
                self.lea_data_into(dest, instr.args[0].clone(), out);
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::And | Opcode::Or => {
                self.lower_alu(instr, out)?;
            }
            Opcode::Div => self.lower_div(instr, out)?,
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                self.lower_compare(instr, out)?;
            }
            Opcode::Neg => {
                let Some(dest) = self.dest(instr) else {
                    return Ok(());
                };
                match dest {
                    Loc::Reg(r) => {
                        let a = self.read(&instr.args[0], self.scratch, out)?;
                        if r != a {
                            out.push(Inst::MovRR(r, a));
                        }
                        out.push(Inst::NegR(r));
                    }
                    Loc::Spill(_) => {
                        out.push(Inst::Push(Reg::Rax));
                        self.read_into(&instr.args[0], self.scratch, out)?;
                        out.push(Inst::MovRR(Reg::Rax, self.scratch));
                        out.push(Inst::NegR(Reg::Rax));
                        self.write_dest(dest, Reg::Rax, out);
                        out.push(Inst::Pop(Reg::Rax));
                    }
                }
            }
            Opcode::Not => {
                let Some(dest) = self.dest(instr) else {
                    return Ok(());
                };
                match dest {
                    Loc::Reg(r) => {
                        let a = self.read(&instr.args[0], self.scratch, out)?;
                        out.push(Inst::CmpRI(a, 0));
                        out.push(Inst::SetCc(Cond::E, r));
                        out.push(Inst::MovzxR8(r, r));
                    }
                    Loc::Spill(s) => {
                        out.push(Inst::Push(Reg::Rax));
                        let a = self.read(&instr.args[0], self.scratch, out)?;
                        out.push(Inst::CmpRI(a, 0));
                        out.push(Inst::SetCc(Cond::E, Reg::Rax));
                        out.push(Inst::MovzxR8(Reg::Rax, Reg::Rax));
                        out.push(Inst::MovMR(self.spill_slot(s), Reg::Rax));
                        out.push(Inst::Pop(Reg::Rax));
                    }
                }
            }
            Opcode::Jump => out.push(Inst::Jmp(instr.args[0].clone())),
            Opcode::BranchFalse => {
                let cond = self.read(&instr.args[0], self.scratch, out)?;
                out.push(Inst::TestRR(cond, cond));
                out.push(Inst::Jcc(Cond::E, instr.args[1].clone()));
            }
            Opcode::Return => {
                let value = self.read(&instr.args[0], self.scratch, out)?;
                if value != Reg::Rax {
                    out.push(Inst::MovRR(Reg::Rax, value));
                }
                self.emit_epilogue(out);
            }
            Opcode::ReturnVoid => self.emit_epilogue(out),
            Opcode::Call => {
                let callee = instr.args[0].clone();
                let args: Vec<String> = instr.args[1..].to_vec();
                self.lower_call(CallTarget::Named(callee), &args, self.dest(instr), out)?;
            }
            Opcode::CallMethod => {
                // args: fp, receiver, actual arguments…
                let fp = instr.args[0].clone();
                let args: Vec<String> = instr.args[1..].to_vec();
                self.lower_call(CallTarget::Pointer(fp), &args, self.dest(instr), out)?;
            }
            Opcode::LoadVtable => {
                let Some(dest) = self.dest(instr) else {
                    return Ok(());
                };
                let obj = self.read(&instr.args[0], self.scratch, out)?;
                self.load_mem_into(dest, Mem::base_disp(obj, 0), out);
            }
            Opcode::VtableMethod => {
                let Some(dest) = self.dest(instr) else {
                    return Ok(());
                };
                let method = &instr.args[1];
                let slot = *self
                    .cg
                    .method_slots
                    .get(method)
                    .ok_or_else(|| CodeGenError::UndefinedSymbol(method.clone()))?;
                let vt = self.read(&instr.args[0], self.scratch, out)?;
                self.load_mem_into(dest, Mem::base_disp(vt, 8 * slot as i32), out);
            }
            Opcode::SetVtable => {
                let obj = self.read(&instr.args[0], self.scratch, out)?;
                out.push(Inst::LeaData(self.scratch2, instr.args[1].clone()));
                out.push(Inst::MovMR(Mem::base_disp(obj, 0), self.scratch2));
            }
            Opcode::Sizeof => {
                let Some(dest) = self.dest(instr) else {
                    return Ok(());
                };
                let class = &instr.args[0];
                let size = *self
                    .cg
                    .class_sizes
                    .get(class)
                    .ok_or_else(|| CodeGenError::UndefinedSymbol(class.clone()))?;
                self.load_imm_into(dest, size, out);
            }
            Opcode::Alloc => {
                let args = vec![instr.args[0].clone()];
                self.lower_call(
                    CallTarget::Named("malloc".to_string()),
                    &args,
                    self.dest(instr),
                    out,
                )?;
            }
            Opcode::GetField => {
                let Some(dest) = self.dest(instr) else {
                    return Ok(());
                };
                let field = &instr.args[1];
                let offset = *self
                    .cg
                    .field_offsets
                    .get(field)
                    .ok_or_else(|| CodeGenError::UndefinedSymbol(field.clone()))?;
                let obj = self.read(&instr.args[0], self.scratch, out)?;
                self.load_mem_into(dest, Mem::base_disp(obj, offset), out);
            }
            Opcode::String | Opcode::Vtable | Opcode::VtableEntry => {
                // Module directives; never appear in function bodies.
            }
        }
        Ok(())
    }

    fn lower_alu(&mut self, instr: &Instruction, out: &mut Vec<Inst>) -> Result<(), CodeGenError> {
        let Some(dest) = self.dest(instr) else {
            return Ok(());
        };
        let rr = |op: Opcode, dst: Reg, src: Reg| -> Inst {
            match op {
                Opcode::Add => Inst::AddRR(dst, src),
                Opcode::Sub => Inst::SubRR(dst, src),
                Opcode::Mul => Inst::ImulRR(dst, src),
                Opcode::And => Inst::AndRR(dst, src),
                Opcode::Or => Inst::OrRR(dst, src),
                _ => unreachable!("not an ALU opcode"),
            }
        };

        match dest {
            Loc::Reg(r) => {
                // The destination interferes with both operands, so the
                // copy cannot clobber either of them. The reload scratch
                // must not be the destination itself, which accumulates
                // the first operand.
                let s = if r == self.scratch {
                    self.scratch2
                } else {
                    self.scratch
                };
                let a = self.read(&instr.args[0], s, out)?;
                if r != a {
                    out.push(Inst::MovRR(r, a));
                }
                let b = self.read(&instr.args[1], s, out)?;
                out.push(rr(instr.op, r, b));
            }
            Loc::Spill(s) => {
                // Compute through rax, preserving whatever lives there.
                out.push(Inst::Push(Reg::Rax));
                self.read_into(&instr.args[1], self.scratch2, out)?;
                self.read_into(&instr.args[0], self.scratch, out)?;
                out.push(Inst::MovRR(Reg::Rax, self.scratch));
                out.push(rr(instr.op, Reg::Rax, self.scratch2));
                out.push(Inst::MovMR(self.spill_slot(s), Reg::Rax));
                out.push(Inst::Pop(Reg::Rax));
            }
        }
        Ok(())
    }

    fn lower_div(&mut self, instr: &Instruction, out: &mut Vec<Inst>) -> Result<(), CodeGenError> {
        let Some(dest) = self.dest(instr) else {
            return Ok(());
        };
        // idiv pins the dividend to rdx:rax; both are saved around the
        // sequence. A spilled result stores rax straight to its slot; a
        // register result rides out in scratch so the saves can unwind.
        out.push(Inst::Push(Reg::Rax));
        out.push(Inst::Push(Reg::Rdx));
        self.read_into(&instr.args[1], self.scratch2, out)?;
        self.read_into(&instr.args[0], self.scratch, out)?;
        out.push(Inst::MovRR(Reg::Rax, self.scratch));
        out.push(Inst::Cqo);
        out.push(Inst::Idiv(self.scratch2));
        match dest {
            Loc::Spill(s) => {
                out.push(Inst::MovMR(self.spill_slot(s), Reg::Rax));
                out.push(Inst::Pop(Reg::Rdx));
                out.push(Inst::Pop(Reg::Rax));
            }
            Loc::Reg(r) => {
                out.push(Inst::MovRR(self.scratch, Reg::Rax));
                out.push(Inst::Pop(Reg::Rdx));
                out.push(Inst::Pop(Reg::Rax));
                if r != self.scratch {
                    out.push(Inst::MovRR(r, self.scratch));
                }
            }
        }
        Ok(())
    }

    fn lower_compare(
        &mut self,
        instr: &Instruction,
        out: &mut Vec<Inst>,
    ) -> Result<(), CodeGenError> {
        let Some(dest) = self.dest(instr) else {
            return Ok(());
        };
        let cond = match instr.op {
            Opcode::Eq => Cond::E,
            Opcode::Ne => Cond::Ne,
            Opcode::Lt => Cond::L,
            Opcode::Le => Cond::Le,
            Opcode::Gt => Cond::G,
            Opcode::Ge => Cond::Ge,
            _ => unreachable!("not a comparison"),
        };
        match dest {
            Loc::Reg(r) => {
                let a = self.read(&instr.args[0], self.scratch, out)?;
                let b = self.read(&instr.args[1], self.scratch2, out)?;
                out.push(Inst::CmpRR(a, b));
                out.push(Inst::SetCc(cond, r));
                out.push(Inst::MovzxR8(r, r));
            }
            Loc::Spill(s) => {
                out.push(Inst::Push(Reg::Rax));
                let a = self.read(&instr.args[0], self.scratch, out)?;
                let b = self.read(&instr.args[1], self.scratch2, out)?;
                out.push(Inst::CmpRR(a, b));
                out.push(Inst::SetCc(cond, Reg::Rax));
                out.push(Inst::MovzxR8(Reg::Rax, Reg::Rax));
                out.push(Inst::MovMR(self.spill_slot(s), Reg::Rax));
                out.push(Inst::Pop(Reg::Rax));
            }
        }
        Ok(())
    }

    fn lower_call(
        &mut self,
        target: CallTarget,
        args: &[String],
        dest: Option<Loc>,
        out: &mut Vec<Inst>,
    ) -> Result<(), CodeGenError> {
        // Resolve the callee before emitting anything.
        let mut is_extern = false;
        let symbol = match &target {
            CallTarget::Named(name) => {
                if !self.cg.defined.contains(name) {
                    if !KNOWN_EXTERNALS.iter().any(|(s, _)| s == name) {
                        return Err(CodeGenError::UndefinedSymbol(name.clone()));
                    }
                    is_extern = true;
                    self.cg.mark_extern(name);
                }
                name.clone()
            }
            CallTarget::Pointer(_) => String::new(),
        };

        // Save every live register the call or callee could clobber,
        // keeping the destination register free to receive the result.
        let saved: Vec<Reg> = CALLER_SAVED
            .iter()
            .copied()
            .filter(|r| dest != Some(Loc::Reg(*r)))
            .collect();
        for &r in &saved {
            out.push(Inst::Push(r));
        }

        // For an indirect call, pin the pointer before the argument
        // registers are populated.
        if let CallTarget::Pointer(fp) = &target {
            self.read_into(fp, self.scratch2, out)?;
        }

        // Alignment pad goes in before the stack arguments so they end up
        // exactly above the shadow space.
        let extra = args.len().saturating_sub(ARG_REGS.len());
        let pad = if (saved.len() + extra) % 2 == 1 { 8 } else { 0 };
        if pad > 0 {
            out.push(Inst::SubRI(Reg::Rsp, pad));
        }

        // Push argument values right to left, then pop the leading four
        // into their registers; anything left on the stack is already laid
        // out for the callee above the shadow space.
        for arg in args.iter().rev() {
            let r = self.read(arg, self.scratch, out)?;
            out.push(Inst::Push(r));
        }
        for (i, _) in args.iter().take(ARG_REGS.len()).enumerate() {
            out.push(Inst::Pop(ARG_REGS[i]));
        }

        out.push(Inst::SubRI(Reg::Rsp, 32));

        match &target {
            CallTarget::Named(_) if is_extern => out.push(Inst::CallExtern(symbol)),
            CallTarget::Named(_) => out.push(Inst::Call(symbol)),
            CallTarget::Pointer(_) => out.push(Inst::CallReg(self.scratch2)),
        }

        out.push(Inst::AddRI(Reg::Rsp, 32 + pad + 8 * extra as i32));

        if let Some(dest) = dest {
            self.write_dest(dest, Reg::Rax, out);
        }
        for &r in saved.iter().rev() {
            out.push(Inst::Pop(r));
        }
        Ok(())
    }

    fn emit_epilogue(&self, out: &mut Vec<Inst>) {
        out.push(Inst::MovRR(Reg::Rsp, Reg::Rbp));
        out.push(Inst::Pop(Reg::Rbp));
        out.push(Inst::Ret);
    }
}

enum CallTarget {
    Named(String),
    Pointer(String),
}

fn parse_const(text: &str) -> Result<i64, CodeGenError> {
    if let Ok(v) = text.parse::<i64>() {
        return Ok(v);
    }
    // Float constants travel as their IEEE 754 bit pattern; non-constant
    // float arithmetic is rejected earlier.
    text.parse::<f64>()
        .map(|f| f.to_bits() as i64)
        .map_err(|_| CodeGenError::Unsupported(format!("constant `{}`", text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::ir::IrGenerator;
    use crate::lexer::Lexer;
    use crate::optimizer;
    use crate::parser::Parser;

    fn build(source: &str) -> (PeImage, BackendStats) {
        let mut diags = Diagnostics::new("test.mf");
        let tokens = Lexer::new(source).tokenize(&mut diags);
        let program = Parser::new(tokens).parse(&mut diags);
        assert!(!diags.has_errors(), "{}", diags.render());
        let mut module = IrGenerator::new().generate(&program).unwrap();
        optimizer::optimize_module(&mut module);
        build_image(&module, pe::DEFAULT_IMAGE_BASE, 0).unwrap()
    }

    #[test]
    fn test_text_starts_with_main_prologue() {
        let (image, _) = build("fn main() -> i32 { return 0; }");
        assert_eq!(&image.text[..4], &[0x55, 0x48, 0x89, 0xE5]);
    }

    #[test]
    fn test_return_zero_body() {
        let (image, _) = build("fn main() -> i32 { return 0; }");
        // prologue, mov r, 0, mov rax, r (elided when same), epilogue, ret
        let code = &image.text;
        // mov <reg>, 0 in the C7 form appears before the epilogue.
        let needle = [0x48, 0xC7, 0xC0, 0x00, 0x00, 0x00, 0x00];
        assert!(
            code.windows(needle.len()).any(|w| w == needle),
            "missing mov rax, 0 in {:02X?}",
            code
        );
        assert_eq!(code.last(), Some(&0xC3));
    }

    #[test]
    fn test_folded_arithmetic_emits_const_14() {
        let (image, _) = build("fn main() -> i32 { return 2 + 3 * 4; }");
        let needle = [0x48, 0xC7, 0xC0, 0x0E, 0x00, 0x00, 0x00];
        assert!(
            image.text.windows(needle.len()).any(|w| w == needle),
            "missing mov rax, 14 in {:02X?}",
            image.text
        );
    }

    #[test]
    fn test_dead_store_leaves_no_trace() {
        // After DCE nothing references the literal 99.
        let (image, _) = build("fn main() -> i32 { 99; return 7; }");
        let imm99 = 99i32.to_le_bytes();
        assert!(
            !image.text.windows(4).any(|w| w == imm99),
            "dead literal survived: {:02X?}",
            image.text
        );
    }

    #[test]
    fn test_imports_always_include_exit_process() {
        let (image, _) = build("fn main() -> i32 { return 0; }");
        assert_eq!(image.imports[0].0, "kernel32.dll");
        assert_eq!(image.imports[0].1, vec!["ExitProcess"]);
    }

    #[test]
    fn test_string_literal_pulls_in_printf() {
        let source = r#"
            import "c" "stdio.h";
            fn main() -> i32 { printf("hello"); return 0; }
        "#;
        let (image, _) = build(source);
        assert_eq!(image.imports.len(), 2);
        assert_eq!(image.imports[1].0, "msvcrt.dll");
        assert!(image.imports[1].1.contains(&"printf".to_string()));
        // The literal is in .data, NUL-terminated.
        assert!(
            image
                .data
                .windows(6)
                .any(|w| w == b"hello\0"),
            "string bytes missing from .data"
        );
        // The call site references the IAT.
        assert_eq!(image.iat_fixups.len(), 1);
        assert_eq!(image.iat_fixups[0].1, "printf");
        // The lea referencing the literal was exported as a data fixup.
        assert_eq!(image.data_rel_fixups.len(), 1);
    }

    #[test]
    fn test_vtables_emit_absolute_fixups() {
        let source = "
            class B { fn greet() -> i32 { return 1; } }
            class D extends B { fn greet() -> i32 { return 2; } }
            fn main() -> i32 {
                let d: D = new D();
                return d.greet();
            }
        ";
        let (image, _) = build(source);
        // Two vtables with one slot each, both patched.
        assert_eq!(image.abs_fixups.len(), 2);
        // malloc was pulled in by `new`.
        assert!(image.imports[1].1.contains(&"malloc".to_string()));
    }

    #[test]
    fn test_spill_pressure_generates_frame_traffic() {
        // Right-nested product: every term stays live until the tail is
        // done, far exceeding the register file.
        let mut expr = String::from("(a + 19)");
        for i in (0..19).rev() {
            expr = format!("(a + {}) * ({})", i, expr);
        }
        let source = format!("fn main() -> i32 {{ let a: i32 = 3; return {}; }}", expr);
        let (image, stats) = build(&source);
        assert!(
            stats.spilled_temps >= 6,
            "expected heavy spilling, got {}",
            stats.spilled_temps
        );

        // Count `mov [rbp-disp8], rax` stores: 48 89 45 xx.
        let stores = image
            .text
            .windows(3)
            .filter(|w| w == &[0x48, 0x89, 0x45])
            .count();
        // And `mov r11, [rbp-disp8]` reloads: 4C 8B 5D xx.
        let reloads = image
            .text
            .windows(3)
            .filter(|w| w == &[0x4C, 0x8B, 0x5D])
            .count();
        assert!(stores >= 6, "spill stores: {}", stores);
        assert!(reloads >= 6, "spill reloads: {}", reloads);
    }

    #[test]
    fn test_undefined_call_is_backend_error() {
        let mut diags = Diagnostics::new("test.mf");
        let tokens = Lexer::new("fn main() -> i32 { ghost(); return 0; }").tokenize(&mut diags);
        let program = Parser::new(tokens).parse(&mut diags);
        let module = IrGenerator::new().generate(&program).unwrap();
        let err = build_image(&module, pe::DEFAULT_IMAGE_BASE, 0).unwrap_err();
        assert!(matches!(err, CodeGenError::UndefinedSymbol(_)));
    }

    #[test]
    fn test_internal_calls_resolve_without_fixups() {
        let source = "
            fn helper() -> i32 { return 5; }
            fn main() -> i32 { return helper(); }
        ";
        let (image, _) = build(source);
        assert!(image.iat_fixups.is_empty());
        // A rel32 call opcode exists in the text.
        assert!(image.text.contains(&0xE8));
    }

    #[test]
    fn test_reproducible_lowering() {
        let source = "
            fn f(n: i32) -> i32 { if (n > 1) { return n * f(n - 1); } return 1; }
            fn main() -> i32 { return f(5); }
        ";
        let (a, _) = build(source);
        let (b, _) = build(source);
        assert_eq!(a.text, b.text);
        assert_eq!(a.data, b.data);
    }
}
