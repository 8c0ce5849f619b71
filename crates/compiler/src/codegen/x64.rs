//! Direct x64 instruction encoding.
//!
//! The assembler takes the lowered instruction list and produces machine
//! bytes in two passes: pass one measures every instruction and records
//! label offsets, pass two emits bytes. Internal `call`/`jmp` targets are
//! resolved against the label table as 32-bit relative displacements;
//! references to imported symbols and to `.data` labels are left zeroed and
//! exported as fixups for the container writer.

use std::collections::HashMap;

/// The sixteen general-purpose registers, numbered as the hardware does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    pub fn index(self) -> u8 {
        self as u8
    }

    fn low3(self) -> u8 {
        self.index() & 7
    }

    fn is_extended(self) -> bool {
        self.index() >= 8
    }
}

/// `[base + index*scale + disp]`; a missing base means an absolute address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Option<Reg>,
    pub index: Option<Reg>,
    pub scale: u8,
    pub disp: i32,
}

impl Mem {
    pub fn base_disp(base: Reg, disp: i32) -> Self {
        Mem {
            base: Some(base),
            index: None,
            scale: 1,
            disp,
        }
    }
}

/// Condition codes for `setcc`/`jcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
}

impl Cond {
    fn setcc_opcode(self) -> u8 {
        match self {
            Cond::E => 0x94,
            Cond::Ne => 0x95,
            Cond::L => 0x9C,
            Cond::Ge => 0x9D,
            Cond::Le => 0x9E,
            Cond::G => 0x9F,
        }
    }

    fn jcc_opcode(self) -> u8 {
        match self {
            Cond::E => 0x84,
            Cond::Ne => 0x85,
            Cond::L => 0x8C,
            Cond::Ge => 0x8D,
            Cond::Le => 0x8E,
            Cond::G => 0x8F,
        }
    }
}

/// Machine-level instructions the back end lowers to. All register
/// operations use 64-bit operand size.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Label(String),
    Push(Reg),
    Pop(Reg),
    MovRI(Reg, i64),
    MovRR(Reg, Reg),
    MovRM(Reg, Mem),
    MovMR(Mem, Reg),
    Lea(Reg, Mem),
    /// RIP-relative `lea` against a `.data` label.
    LeaData(Reg, String),
    AddRI(Reg, i32),
    AddRR(Reg, Reg),
    SubRI(Reg, i32),
    SubRR(Reg, Reg),
    ImulRR(Reg, Reg),
    Cqo,
    Idiv(Reg),
    AndRR(Reg, Reg),
    OrRR(Reg, Reg),
    XorRR(Reg, Reg),
    NegR(Reg),
    CmpRR(Reg, Reg),
    CmpRI(Reg, i32),
    TestRR(Reg, Reg),
    SetCc(Cond, Reg),
    /// `movzx dst64, src8`.
    MovzxR8(Reg, Reg),
    Jmp(String),
    Jcc(Cond, String),
    Call(String),
    /// `call [rip+disp32]` through the import address table.
    CallExtern(String),
    CallReg(Reg),
    Ret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixupKind {
    /// rel32 to a label in this code block.
    Internal,
    /// disp32 resolved by the PE writer against the IAT.
    Extern,
    /// disp32 resolved by the PE writer against `.data`.
    Data,
}

#[derive(Debug, Clone)]
struct Fixup {
    offset: usize,
    label: String,
    kind: FixupKind,
}

/// Encoded machine code with its label table and unresolved references.
#[derive(Debug, Default)]
pub struct CodeBlob {
    pub bytes: Vec<u8>,
    pub labels: HashMap<String, usize>,
    /// `(offset of disp32 field, imported symbol)`.
    pub extern_fixups: Vec<(usize, String)>,
    /// `(offset of disp32 field, data label)`.
    pub data_fixups: Vec<(usize, String)>,
}

pub struct Assembler;

impl Assembler {
    /// Assemble the instruction list.
    ///
    /// Fails when an internal label reference never gets defined.
    pub fn assemble(instructions: &[Inst]) -> Result<CodeBlob, String> {
        // Pass 1: sizes and label offsets.
        let mut labels = HashMap::new();
        let mut offset = 0usize;
        for inst in instructions {
            if let Inst::Label(name) = inst {
                labels.insert(name.clone(), offset);
            } else {
                offset += Self::encoded_size(inst);
            }
        }

        // Pass 2: bytes.
        let mut bytes = Vec::with_capacity(offset);
        let mut fixups = Vec::new();
        for inst in instructions {
            if !matches!(inst, Inst::Label(_)) {
                encode(inst, &mut bytes, &mut fixups);
            }
        }
        debug_assert_eq!(bytes.len(), offset, "pass 1 and pass 2 disagree");

        let mut blob = CodeBlob {
            bytes,
            labels,
            extern_fixups: Vec::new(),
            data_fixups: Vec::new(),
        };
        for fixup in fixups {
            match fixup.kind {
                FixupKind::Internal => {
                    let target = *blob
                        .labels
                        .get(&fixup.label)
                        .ok_or_else(|| format!("undefined label `{}`", fixup.label))?;
                    let rel = target as i64 - (fixup.offset as i64 + 4);
                    let rel: i32 = rel
                        .try_into()
                        .map_err(|_| format!("branch to `{}` out of range", fixup.label))?;
                    blob.bytes[fixup.offset..fixup.offset + 4]
                        .copy_from_slice(&rel.to_le_bytes());
                }
                FixupKind::Extern => blob.extern_fixups.push((fixup.offset, fixup.label)),
                FixupKind::Data => blob.data_fixups.push((fixup.offset, fixup.label)),
            }
        }
        Ok(blob)
    }

    /// Byte size of one instruction, as pass 1 reports it.
    pub fn encoded_size(inst: &Inst) -> usize {
        let mut scratch = Vec::new();
        let mut fixups = Vec::new();
        encode(inst, &mut scratch, &mut fixups);
        scratch.len()
    }
}

fn rex(w: bool, r: u8, x: u8, b: u8) -> u8 {
    0x40 | (u8::from(w) << 3) | ((r >> 3) << 2) | ((x >> 3) << 1) | (b >> 3)
}

fn modrm_reg(reg: u8, rm: u8) -> u8 {
    0xC0 | ((reg & 7) << 3) | (rm & 7)
}

/// Emit ModRM (+ SIB, + displacement) for a memory operand.
fn emit_modrm_mem(out: &mut Vec<u8>, reg_field: u8, mem: &Mem) {
    let reg = (reg_field & 7) << 3;

    let Some(base) = mem.base else {
        // Absolute 32-bit address: ModRM 00 reg 100, SIB 25.
        out.push(reg | 0x04);
        out.push(0x25);
        out.extend_from_slice(&mem.disp.to_le_bytes());
        return;
    };

    // rbp/r13 as base cannot use mod 00.
    let disp_mode = if mem.disp == 0 && base.low3() != 5 {
        0x00
    } else if (-128..=127).contains(&mem.disp) {
        0x40
    } else {
        0x80
    };

    match mem.index {
        None => {
            if base.low3() == 4 {
                // rsp/r12 as base forces a SIB byte.
                out.push(disp_mode | reg | 0x04);
                out.push(0x24);
            } else {
                out.push(disp_mode | reg | base.low3());
            }
        }
        Some(index) => {
            let scale_bits: u8 = match mem.scale {
                1 => 0,
                2 => 1,
                4 => 2,
                _ => 3,
            };
            out.push(disp_mode | reg | 0x04);
            out.push((scale_bits << 6) | (index.low3() << 3) | base.low3());
        }
    }

    match disp_mode {
        0x40 => out.push(mem.disp as u8),
        0x80 => out.extend_from_slice(&mem.disp.to_le_bytes()),
        _ => {}
    }
}

fn mem_rex_bits(mem: &Mem) -> (u8, u8) {
    let x = mem.index.map_or(0, Reg::index);
    let b = mem.base.map_or(0, Reg::index);
    (x, b)
}

fn encode(inst: &Inst, out: &mut Vec<u8>, fixups: &mut Vec<Fixup>) {
    match inst {
        Inst::Label(_) => {}

        Inst::Push(r) => {
            if r.is_extended() {
                out.push(0x41);
            }
            out.push(0x50 + r.low3());
        }
        Inst::Pop(r) => {
            if r.is_extended() {
                out.push(0x41);
            }
            out.push(0x58 + r.low3());
        }

        Inst::MovRI(r, imm) => {
            if i32::try_from(*imm).is_ok() {
                // Sign-extended 32-bit form.
                out.push(rex(true, 0, 0, r.index()));
                out.push(0xC7);
                out.push(modrm_reg(0, r.low3()));
                out.extend_from_slice(&(*imm as i32).to_le_bytes());
            } else {
                out.push(rex(true, 0, 0, r.index()));
                out.push(0xB8 + r.low3());
                out.extend_from_slice(&imm.to_le_bytes());
            }
        }
        Inst::MovRR(dst, src) => {
            out.push(rex(true, src.index(), 0, dst.index()));
            out.push(0x89);
            out.push(modrm_reg(src.low3(), dst.low3()));
        }
        Inst::MovRM(dst, mem) => {
            let (x, b) = mem_rex_bits(mem);
            out.push(rex(true, dst.index(), x, b));
            out.push(0x8B);
            emit_modrm_mem(out, dst.low3(), mem);
        }
        Inst::MovMR(mem, src) => {
            let (x, b) = mem_rex_bits(mem);
            out.push(rex(true, src.index(), x, b));
            out.push(0x89);
            emit_modrm_mem(out, src.low3(), mem);
        }

        Inst::Lea(dst, mem) => {
            let (x, b) = mem_rex_bits(mem);
            out.push(rex(true, dst.index(), x, b));
            out.push(0x8D);
            emit_modrm_mem(out, dst.low3(), mem);
        }
        Inst::LeaData(dst, label) => {
            out.push(rex(true, dst.index(), 0, 0));
            out.push(0x8D);
            out.push(((dst.low3()) << 3) | 0x05); // RIP-relative
            fixups.push(Fixup {
                offset: out.len(),
                label: label.clone(),
                kind: FixupKind::Data,
            });
            out.extend_from_slice(&[0, 0, 0, 0]);
        }

        Inst::AddRI(r, imm) => encode_alu_imm(out, 0, *r, *imm),
        Inst::SubRI(r, imm) => encode_alu_imm(out, 5, *r, *imm),
        Inst::CmpRI(r, imm) => encode_alu_imm(out, 7, *r, *imm),

        Inst::AddRR(dst, src) => encode_alu_rr(out, 0x01, *dst, *src),
        Inst::SubRR(dst, src) => encode_alu_rr(out, 0x29, *dst, *src),
        Inst::AndRR(dst, src) => encode_alu_rr(out, 0x21, *dst, *src),
        Inst::OrRR(dst, src) => encode_alu_rr(out, 0x09, *dst, *src),
        Inst::XorRR(dst, src) => encode_alu_rr(out, 0x31, *dst, *src),
        Inst::CmpRR(dst, src) => encode_alu_rr(out, 0x39, *dst, *src),
        Inst::TestRR(dst, src) => encode_alu_rr(out, 0x85, *dst, *src),

        Inst::ImulRR(dst, src) => {
            out.push(rex(true, dst.index(), 0, src.index()));
            out.push(0x0F);
            out.push(0xAF);
            out.push(modrm_reg(dst.low3(), src.low3()));
        }
        Inst::Cqo => {
            out.push(0x48);
            out.push(0x99);
        }
        Inst::Idiv(r) => {
            out.push(rex(true, 0, 0, r.index()));
            out.push(0xF7);
            out.push(modrm_reg(7, r.low3()));
        }
        Inst::NegR(r) => {
            out.push(rex(true, 0, 0, r.index()));
            out.push(0xF7);
            out.push(modrm_reg(3, r.low3()));
        }

        Inst::SetCc(cond, r) => {
            // Low-byte access to rsp..rdi and r8+ needs a REX prefix.
            if r.index() >= 4 {
                out.push(rex(false, 0, 0, r.index()));
            }
            out.push(0x0F);
            out.push(cond.setcc_opcode());
            out.push(modrm_reg(0, r.low3()));
        }
        Inst::MovzxR8(dst, src) => {
            out.push(rex(true, dst.index(), 0, src.index()));
            out.push(0x0F);
            out.push(0xB6);
            out.push(modrm_reg(dst.low3(), src.low3()));
        }

        Inst::Jmp(label) => {
            out.push(0xE9);
            fixups.push(Fixup {
                offset: out.len(),
                label: label.clone(),
                kind: FixupKind::Internal,
            });
            out.extend_from_slice(&[0, 0, 0, 0]);
        }
        Inst::Jcc(cond, label) => {
            out.push(0x0F);
            out.push(cond.jcc_opcode());
            fixups.push(Fixup {
                offset: out.len(),
                label: label.clone(),
                kind: FixupKind::Internal,
            });
            out.extend_from_slice(&[0, 0, 0, 0]);
        }
        Inst::Call(label) => {
            out.push(0xE8);
            fixups.push(Fixup {
                offset: out.len(),
                label: label.clone(),
                kind: FixupKind::Internal,
            });
            out.extend_from_slice(&[0, 0, 0, 0]);
        }
        Inst::CallExtern(symbol) => {
            out.push(0xFF);
            out.push(0x15);
            fixups.push(Fixup {
                offset: out.len(),
                label: symbol.clone(),
                kind: FixupKind::Extern,
            });
            out.extend_from_slice(&[0, 0, 0, 0]);
        }
        Inst::CallReg(r) => {
            if r.is_extended() {
                out.push(0x41);
            }
            out.push(0xFF);
            out.push(modrm_reg(2, r.low3()));
        }

        Inst::Ret => out.push(0xC3),
    }
}

fn encode_alu_imm(out: &mut Vec<u8>, ext: u8, r: Reg, imm: i32) {
    out.push(rex(true, 0, 0, r.index()));
    if (-128..=127).contains(&imm) {
        out.push(0x83);
        out.push(modrm_reg(ext, r.low3()));
        out.push(imm as u8);
    } else {
        out.push(0x81);
        out.push(modrm_reg(ext, r.low3()));
        out.extend_from_slice(&imm.to_le_bytes());
    }
}

fn encode_alu_rr(out: &mut Vec<u8>, opcode: u8, dst: Reg, src: Reg) {
    out.push(rex(true, src.index(), 0, dst.index()));
    out.push(opcode);
    out.push(modrm_reg(src.low3(), dst.low3()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of(insts: &[Inst]) -> Vec<u8> {
        Assembler::assemble(insts).unwrap().bytes
    }

    #[test]
    fn test_standard_prologue_bytes() {
        let code = bytes_of(&[Inst::Push(Reg::Rbp), Inst::MovRR(Reg::Rbp, Reg::Rsp)]);
        assert_eq!(code, vec![0x55, 0x48, 0x89, 0xE5]);
    }

    #[test]
    fn test_epilogue_bytes() {
        let code = bytes_of(&[
            Inst::MovRR(Reg::Rsp, Reg::Rbp),
            Inst::Pop(Reg::Rbp),
            Inst::Ret,
        ]);
        assert_eq!(code, vec![0x48, 0x89, 0xEC, 0x5D, 0xC3]);
    }

    #[test]
    fn test_mov_imm32_form() {
        // mov rax, 14 uses the sign-extended 7-byte form.
        let code = bytes_of(&[Inst::MovRI(Reg::Rax, 14)]);
        assert_eq!(code, vec![0x48, 0xC7, 0xC0, 0x0E, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_mov_imm64_form() {
        let value = 0x1122334455667788u64 as i64;
        let code = bytes_of(&[Inst::MovRI(Reg::Rax, value)]);
        assert_eq!(code.len(), 10);
        assert_eq!(&code[..2], &[0x48, 0xB8]);
        assert_eq!(&code[2..], &value.to_le_bytes());
    }

    #[test]
    fn test_push_pop_extended_registers() {
        let code = bytes_of(&[Inst::Push(Reg::R12), Inst::Pop(Reg::R12)]);
        assert_eq!(code, vec![0x41, 0x54, 0x41, 0x5C]);
    }

    #[test]
    fn test_spill_store_and_reload() {
        // mov [rbp-8], rax ; mov r11, [rbp-8]
        let slot = Mem::base_disp(Reg::Rbp, -8);
        let code = bytes_of(&[Inst::MovMR(slot, Reg::Rax), Inst::MovRM(Reg::R11, slot)]);
        assert_eq!(code, vec![0x48, 0x89, 0x45, 0xF8, 0x4C, 0x8B, 0x5D, 0xF8]);
    }

    #[test]
    fn test_large_displacement_uses_disp32() {
        let slot = Mem::base_disp(Reg::Rbp, -0x1000);
        let code = bytes_of(&[Inst::MovMR(slot, Reg::Rax)]);
        assert_eq!(code[..3], [0x48, 0x89, 0x85]);
        assert_eq!(&code[3..], &(-0x1000i32).to_le_bytes());
    }

    #[test]
    fn test_rsp_base_needs_sib() {
        let code = bytes_of(&[Inst::MovRM(Reg::Rax, Mem::base_disp(Reg::Rsp, 0x20))]);
        assert_eq!(code, vec![0x48, 0x8B, 0x44, 0x24, 0x20]);
    }

    #[test]
    fn test_scaled_index_addressing() {
        // mov rax, [rcx + rdx*8 + 0x10]
        let mem = Mem {
            base: Some(Reg::Rcx),
            index: Some(Reg::Rdx),
            scale: 8,
            disp: 0x10,
        };
        let code = bytes_of(&[Inst::MovRM(Reg::Rax, mem)]);
        assert_eq!(code, vec![0x48, 0x8B, 0x44, 0xD1, 0x10]);
    }

    #[test]
    fn test_alu_imm8_and_imm32() {
        let small = bytes_of(&[Inst::SubRI(Reg::Rsp, 0x20)]);
        assert_eq!(small, vec![0x48, 0x83, 0xEC, 0x20]);
        let large = bytes_of(&[Inst::SubRI(Reg::Rsp, 0x200)]);
        assert_eq!(large[..3], [0x48, 0x81, 0xEC]);
        assert_eq!(&large[3..], &0x200i32.to_le_bytes());
    }

    #[test]
    fn test_xor_self() {
        let code = bytes_of(&[Inst::XorRR(Reg::Rax, Reg::Rax)]);
        assert_eq!(code, vec![0x48, 0x31, 0xC0]);
    }

    #[test]
    fn test_lea_frame_address() {
        let code = bytes_of(&[Inst::Lea(Reg::Rax, Mem::base_disp(Reg::Rbp, -8))]);
        assert_eq!(code, vec![0x48, 0x8D, 0x45, 0xF8]);
    }

    #[test]
    fn test_backward_and_forward_jumps_resolve() {
        let blob = Assembler::assemble(&[
            Inst::Label("top".into()),
            Inst::CmpRI(Reg::Rax, 0),
            Inst::Jcc(Cond::E, "done".into()),
            Inst::SubRI(Reg::Rax, 1),
            Inst::Jmp("top".into()),
            Inst::Label("done".into()),
            Inst::Ret,
        ])
        .unwrap();
        assert_eq!(blob.labels["top"], 0);

        // cmp (4) + jcc (6) + sub (4) + jmp (5) = 19 bytes, ret at 19.
        assert_eq!(blob.labels["done"], 19);
        // The jmp displacement points back to offset 0.
        let jmp_field = 4 + 6 + 4 + 1;
        let rel = i32::from_le_bytes(blob.bytes[jmp_field..jmp_field + 4].try_into().unwrap());
        assert_eq!(jmp_field as i32 + 4 + rel, 0);
        // The jcc displacement points forward to `done`.
        let jcc_field = 4 + 2;
        let rel = i32::from_le_bytes(blob.bytes[jcc_field..jcc_field + 4].try_into().unwrap());
        assert_eq!(jcc_field as i32 + 4 + rel, 19);
    }

    #[test]
    fn test_undefined_label_is_an_error() {
        let result = Assembler::assemble(&[Inst::Jmp("nowhere".into())]);
        assert!(result.is_err());
    }

    #[test]
    fn test_extern_call_exports_fixup() {
        let blob = Assembler::assemble(&[Inst::CallExtern("printf".into())]).unwrap();
        assert_eq!(blob.bytes[..2], [0xFF, 0x15]);
        assert_eq!(blob.bytes[2..], [0, 0, 0, 0]);
        assert_eq!(blob.extern_fixups, vec![(2, "printf".to_string())]);
    }

    #[test]
    fn test_data_lea_exports_fixup() {
        let blob = Assembler::assemble(&[Inst::LeaData(Reg::Rcx, "str_0".into())]).unwrap();
        assert_eq!(blob.bytes[..3], [0x48, 0x8D, 0x0D]);
        assert_eq!(blob.data_fixups, vec![(3, "str_0".to_string())]);
    }

    #[test]
    fn test_pass1_size_matches_pass2_bytes() {
        let insts = vec![
            Inst::Push(Reg::Rbp),
            Inst::MovRR(Reg::Rbp, Reg::Rsp),
            Inst::SubRI(Reg::Rsp, 0x40),
            Inst::MovRI(Reg::Rax, 7),
            Inst::MovRI(Reg::R10, i64::MAX),
            Inst::MovMR(Mem::base_disp(Reg::Rbp, -16), Reg::Rax),
            Inst::MovRM(Reg::R11, Mem::base_disp(Reg::Rbp, -16)),
            Inst::ImulRR(Reg::Rax, Reg::R11),
            Inst::Cqo,
            Inst::Idiv(Reg::R11),
            Inst::SetCc(Cond::L, Reg::Rax),
            Inst::MovzxR8(Reg::Rax, Reg::Rax),
            Inst::CallExtern("printf".into()),
            Inst::CallReg(Reg::R10),
            Inst::LeaData(Reg::Rdx, "str_0".into()),
            Inst::Ret,
        ];
        let total: usize = insts.iter().map(Assembler::encoded_size).sum();
        let blob = Assembler::assemble(&insts).unwrap();
        assert_eq!(total, blob.bytes.len());
    }

    #[test]
    fn test_setcc_low_register_has_no_rex() {
        // sete al
        let code = bytes_of(&[Inst::SetCc(Cond::E, Reg::Rax)]);
        assert_eq!(code, vec![0x0F, 0x94, 0xC0]);
        // setl sil needs REX to reach the low byte.
        let code = bytes_of(&[Inst::SetCc(Cond::L, Reg::Rsi)]);
        assert_eq!(code, vec![0x40, 0x0F, 0x9C, 0xC6]);
        // setg r9b needs REX.B.
        let code = bytes_of(&[Inst::SetCc(Cond::G, Reg::R9)]);
        assert_eq!(code, vec![0x41, 0x0F, 0x9F, 0xC1]);
    }
}
