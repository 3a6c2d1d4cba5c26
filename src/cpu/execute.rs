//! Instruction execution (RV32 and RV64)
//!
//! One interpreter for both XLENs. RV32 registers hold sign-extended 32-bit
//! values, so most 64-bit ALU results only need `xlen_value` afterwards;
//! the few operations that depend on the width (right shifts, high
//! multiplies, division) have explicit 32-bit arms.

use std::sync::atomic::{fence, Ordering};

use super::csr::CsrOp;
use super::decode::*;
use super::trap::Trap;
use super::{Hart, PrivilegeLevel};
use crate::memory::AmoOp;

/// NaN-boxing for single-precision values in 64-bit FP registers
const NAN_BOX: u64 = 0xFFFF_FFFF_0000_0000;

impl Hart {
    #[inline(always)]
    fn reg(&self, idx: usize) -> u64 {
        self.regs[idx]
    }

    /// x0 is written like any register and cleared after the instruction.
    #[inline(always)]
    fn set_reg(&mut self, idx: usize, value: u64) {
        self.regs[idx] = self.xlen_value(value);
    }

    /// Execute one instruction. On success `pc` points at the next one;
    /// on a trap `pc` is left at the faulting instruction.
    pub(crate) fn execute(&mut self, f: Fetched) -> Result<(), Trap> {
        let inst = f.inst;
        let d = DecodedInst::decode(inst);
        let illegal = Trap::IllegalInstruction(f.raw as u64);
        let rv64 = self.caps.rv64;
        let next = self.xlen_addr(self.pc.wrapping_add(f.len as u64));

        match d.opcode {
            OP_LUI => self.set_reg(d.rd, DecodedInst::imm_u(inst) as u64),
            OP_AUIPC => self.set_reg(d.rd, self.pc.wrapping_add(DecodedInst::imm_u(inst) as u64)),
            OP_JAL => {
                let target = self.pc.wrapping_add(DecodedInst::imm_j(inst) as u64);
                self.set_reg(d.rd, next);
                self.pc = self.xlen_addr(target);
                return Ok(());
            }
            OP_JALR => {
                if d.funct3 != 0 {
                    return Err(illegal);
                }
                let target = self.reg(d.rs1).wrapping_add(DecodedInst::imm_i(inst) as u64) & !1;
                self.set_reg(d.rd, next);
                self.pc = self.xlen_addr(target);
                return Ok(());
            }
            OP_BRANCH => {
                let rs1 = self.reg(d.rs1);
                let rs2 = self.reg(d.rs2);
                let taken = match d.funct3 {
                    FUNCT3_BEQ => rs1 == rs2,
                    FUNCT3_BNE => rs1 != rs2,
                    FUNCT3_BLT => (rs1 as i64) < (rs2 as i64),
                    FUNCT3_BGE => (rs1 as i64) >= (rs2 as i64),
                    FUNCT3_BLTU => rs1 < rs2,
                    FUNCT3_BGEU => rs1 >= rs2,
                    _ => return Err(illegal),
                };
                self.pc = if taken {
                    self.xlen_addr(self.pc.wrapping_add(DecodedInst::imm_b(inst) as u64))
                } else {
                    next
                };
                return Ok(());
            }
            OP_LOAD => {
                let vaddr = self.reg(d.rs1).wrapping_add(DecodedInst::imm_i(inst) as u64);
                let value = match d.funct3 {
                    FUNCT3_LB => self.load(vaddr, 1)? as i8 as u64,
                    FUNCT3_LH => self.load(vaddr, 2)? as i16 as u64,
                    FUNCT3_LW => self.load(vaddr, 4)? as i32 as u64,
                    FUNCT3_LD if rv64 => self.load(vaddr, 8)?,
                    FUNCT3_LBU => self.load(vaddr, 1)?,
                    FUNCT3_LHU => self.load(vaddr, 2)?,
                    FUNCT3_LWU if rv64 => self.load(vaddr, 4)?,
                    _ => return Err(illegal),
                };
                self.set_reg(d.rd, value);
            }
            OP_STORE => {
                let vaddr = self.reg(d.rs1).wrapping_add(DecodedInst::imm_s(inst) as u64);
                let size = match d.funct3 {
                    0 => 1,
                    1 => 2,
                    2 => 4,
                    3 if rv64 => 8,
                    _ => return Err(illegal),
                };
                self.store(vaddr, size, self.reg(d.rs2))?;
            }
            OP_OP_IMM => {
                let value = self.alu_imm(inst, &d).ok_or(illegal)?;
                self.set_reg(d.rd, value);
            }
            OP_OP => {
                let rs1 = self.reg(d.rs1);
                let rs2 = self.reg(d.rs2);
                let value = if d.funct7 == FUNCT7_MULDIV {
                    if rv64 {
                        muldiv64(d.funct3, rs1, rs2)
                    } else {
                        muldiv32(d.funct3, rs1 as u32, rs2 as u32) as i32 as u64
                    }
                } else {
                    self.alu_reg(&d, rs1, rs2).ok_or(illegal)?
                };
                self.set_reg(d.rd, value);
            }
            OP_OP_IMM_32 if rv64 => {
                let rs1 = self.reg(d.rs1) as u32;
                let shamt = (inst >> 20) & 0x1F;
                let value = match (d.funct3, d.funct7) {
                    (FUNCT3_ADD_SUB, _) => rs1.wrapping_add(DecodedInst::imm_i(inst) as u32),
                    (FUNCT3_SLL, 0) => rs1 << shamt,
                    (FUNCT3_SRL_SRA, 0) => rs1 >> shamt,
                    (FUNCT3_SRL_SRA, FUNCT7_SUB_SRA) => ((rs1 as i32) >> shamt) as u32,
                    _ => return Err(illegal),
                };
                self.set_reg(d.rd, value as i32 as u64);
            }
            OP_OP_32 if rv64 => {
                let rs1 = self.reg(d.rs1) as u32;
                let rs2 = self.reg(d.rs2) as u32;
                let value = match (d.funct3, d.funct7) {
                    (FUNCT3_MUL | FUNCT3_DIV | FUNCT3_DIVU | FUNCT3_REM | FUNCT3_REMU, FUNCT7_MULDIV) => {
                        muldiv32(d.funct3, rs1, rs2)
                    }
                    (FUNCT3_ADD_SUB, 0) => rs1.wrapping_add(rs2),
                    (FUNCT3_ADD_SUB, FUNCT7_SUB_SRA) => rs1.wrapping_sub(rs2),
                    (FUNCT3_SLL, 0) => rs1 << (rs2 & 0x1F),
                    (FUNCT3_SRL_SRA, 0) => rs1 >> (rs2 & 0x1F),
                    (FUNCT3_SRL_SRA, FUNCT7_SUB_SRA) => ((rs1 as i32) >> (rs2 & 0x1F)) as u32,
                    _ => return Err(illegal),
                };
                self.set_reg(d.rd, value as i32 as u64);
            }
            OP_AMO => self.execute_amo(inst, &d, illegal)?,
            OP_MISC_MEM => match d.funct3 {
                FUNCT3_FENCE => guest_fence(inst),
                FUNCT3_FENCE_I => {
                    fence(Ordering::Acquire);
                    self.blocks.invalidate_all();
                    self.builder = None;
                }
                _ => return Err(illegal),
            },
            OP_SYSTEM => return self.execute_system(inst, &d, illegal, next),
            OP_LOAD_FP | OP_STORE_FP | OP_OP_FP => self.execute_fp_move(inst, &d, illegal)?,
            _ => return Err(illegal),
        }

        self.pc = next;
        Ok(())
    }

    fn alu_imm(&self, inst: u32, d: &DecodedInst) -> Option<u64> {
        let rs1 = self.reg(d.rs1);
        let imm = DecodedInst::imm_i(inst) as u64;
        let rv64 = self.caps.rv64;
        // RV64 shifts take a 6-bit shamt; on RV32 shamt[5] set is reserved
        let shamt = (inst >> 20) & 0x3F;
        let funct6 = inst >> 26;
        if matches!(d.funct3, FUNCT3_SLL | FUNCT3_SRL_SRA) && !rv64 && shamt & 0x20 != 0 {
            return None;
        }
        Some(match d.funct3 {
            FUNCT3_ADD_SUB => rs1.wrapping_add(imm),
            FUNCT3_SLT => ((rs1 as i64) < (imm as i64)) as u64,
            FUNCT3_SLTU => (rs1 < imm) as u64,
            FUNCT3_XOR => rs1 ^ imm,
            FUNCT3_OR => rs1 | imm,
            FUNCT3_AND => rs1 & imm,
            FUNCT3_SLL if funct6 == 0 => rs1 << shamt,
            FUNCT3_SRL_SRA if funct6 == 0 => self.shift_right(rs1, shamt, false),
            FUNCT3_SRL_SRA if funct6 == 0b010000 => self.shift_right(rs1, shamt, true),
            _ => return None,
        })
    }

    fn alu_reg(&self, d: &DecodedInst, rs1: u64, rs2: u64) -> Option<u64> {
        let shamt = (rs2 & (self.xlen_bits() as u64 - 1)) as u32;
        Some(match (d.funct3, d.funct7) {
            (FUNCT3_ADD_SUB, 0) => rs1.wrapping_add(rs2),
            (FUNCT3_ADD_SUB, FUNCT7_SUB_SRA) => rs1.wrapping_sub(rs2),
            (FUNCT3_SLL, 0) => rs1 << shamt,
            (FUNCT3_SLT, 0) => ((rs1 as i64) < (rs2 as i64)) as u64,
            (FUNCT3_SLTU, 0) => (rs1 < rs2) as u64,
            (FUNCT3_XOR, 0) => rs1 ^ rs2,
            (FUNCT3_SRL_SRA, 0) => self.shift_right(rs1, shamt, false),
            (FUNCT3_SRL_SRA, FUNCT7_SUB_SRA) => self.shift_right(rs1, shamt, true),
            (FUNCT3_OR, 0) => rs1 | rs2,
            (FUNCT3_AND, 0) => rs1 & rs2,
            _ => return None,
        })
    }

    #[inline]
    fn shift_right(&self, value: u64, shamt: u32, arithmetic: bool) -> u64 {
        match (self.caps.rv64, arithmetic) {
            (true, false) => value >> shamt,
            (true, true) => ((value as i64) >> shamt) as u64,
            (false, false) => ((value as u32) >> shamt) as u64,
            (false, true) => ((value as i32) >> shamt) as u64,
        }
    }

    fn execute_amo(&mut self, inst: u32, d: &DecodedInst, illegal: Trap) -> Result<(), Trap> {
        let size = match d.funct3 {
            2 => 4,
            3 if self.caps.rv64 => 8,
            _ => return Err(illegal),
        };
        let funct5 = inst >> 27;
        let vaddr = self.reg(d.rs1);
        let old = match funct5 {
            FUNCT5_LR => {
                if d.rs2 != 0 {
                    return Err(illegal);
                }
                self.load_reserved(vaddr, size)?
            }
            FUNCT5_SC => {
                let stored = self.store_conditional(vaddr, size, self.reg(d.rs2))?;
                (!stored) as u64
            }
            _ => {
                let op = AmoOp::from_funct5(funct5).ok_or(illegal)?;
                self.amo(op, vaddr, size, self.reg(d.rs2))?
            }
        };
        let value = if size == 4 { old as u32 as i32 as u64 } else { old };
        self.set_reg(d.rd, value);
        Ok(())
    }

    fn execute_system(&mut self, inst: u32, d: &DecodedInst, illegal: Trap, next: u64) -> Result<(), Trap> {
        match d.funct3 {
            FUNCT3_PRIV => {
                match inst {
                    INST_ECALL => return Err(Trap::ecall(self.priv_level)),
                    INST_EBREAK => return Err(Trap::Breakpoint(self.pc)),
                    INST_MRET => {
                        self.pc = self.mret().ok_or(illegal)?;
                        return Ok(());
                    }
                    INST_SRET => {
                        self.pc = self.sret().ok_or(illegal)?;
                        return Ok(());
                    }
                    INST_WFI => {
                        let trapped = match self.priv_level {
                            PrivilegeLevel::User => true,
                            PrivilegeLevel::Supervisor => self.csr.mstatus & super::csr::MSTATUS_TW != 0,
                            PrivilegeLevel::Machine => false,
                        };
                        if trapped {
                            return Err(illegal);
                        }
                        self.wfi = true;
                    }
                    _ if d.funct7 == FUNCT7_SFENCE_VMA && d.rd == 0 => {
                        let trapped = match self.priv_level {
                            PrivilegeLevel::User => true,
                            PrivilegeLevel::Supervisor => self.csr.mstatus & super::csr::MSTATUS_TVM != 0,
                            PrivilegeLevel::Machine => false,
                        };
                        if trapped {
                            return Err(illegal);
                        }
                        let page = (d.rs1 != 0).then(|| self.reg(d.rs1));
                        self.flush_tlb(page);
                    }
                    _ => return Err(illegal),
                }
            }
            FUNCT3_CSRRW | FUNCT3_CSRRS | FUNCT3_CSRRC | 5 | 6 | 7 => {
                let csr = inst >> 20;
                let mut value = if d.funct3 & 4 != 0 { d.rs1 as u64 } else { self.reg(d.rs1) };
                let op = match d.funct3 & 3 {
                    1 => CsrOp::Swap,
                    2 => CsrOp::SetBits,
                    _ => CsrOp::ClearBits,
                };
                if !self.csr_op(csr, &mut value, op) {
                    return Err(illegal);
                }
                self.set_reg(d.rd, value);
            }
            _ => return Err(illegal),
        }
        self.pc = next;
        Ok(())
    }

    /// FP loads/stores and the integer <-> FP register moves. Arithmetic is
    /// not implemented and stays illegal.
    fn execute_fp_move(&mut self, inst: u32, d: &DecodedInst, illegal: Trap) -> Result<(), Trap> {
        if !self.fpu_enabled() {
            return Err(illegal);
        }
        let rv64 = self.caps.rv64;
        let value = match d.opcode {
            OP_LOAD_FP => {
                let vaddr = self.reg(d.rs1).wrapping_add(DecodedInst::imm_i(inst) as u64);
                match d.funct3 {
                    2 => NAN_BOX | self.load(vaddr, 4)?,
                    3 => self.load(vaddr, 8)?,
                    _ => return Err(illegal),
                }
            }
            OP_STORE_FP => {
                let vaddr = self.reg(d.rs1).wrapping_add(DecodedInst::imm_s(inst) as u64);
                let bits = self.fregs.as_ref().map_or(0, |f| f[d.rs2]);
                match d.funct3 {
                    2 => self.store(vaddr, 4, bits)?,
                    3 => self.store(vaddr, 8, bits)?,
                    _ => return Err(illegal),
                }
                return Ok(());
            }
            _ => {
                if d.rs2 != 0 || d.funct3 != 0 {
                    return Err(illegal);
                }
                let bits = self.fregs.as_ref().map_or(0, |f| f[d.rs1]);
                match d.funct7 {
                    FUNCT7_FMV_X_W => {
                        self.set_reg(d.rd, bits as u32 as i32 as u64);
                        return Ok(());
                    }
                    FUNCT7_FMV_X_D if rv64 => {
                        self.set_reg(d.rd, bits);
                        return Ok(());
                    }
                    FUNCT7_FMV_W_X => NAN_BOX | (self.reg(d.rs1) & 0xFFFF_FFFF),
                    FUNCT7_FMV_D_X if rv64 => self.reg(d.rs1),
                    _ => return Err(illegal),
                }
            }
        };
        if let Some(fregs) = self.fregs.as_mut() {
            fregs[d.rd] = value;
        }
        self.mark_fs_dirty();
        Ok(())
    }
}

/// FENCE: map the predecessor/successor sets onto a host fence. Ordering
/// earlier stores before later loads needs a full barrier.
fn guest_fence(inst: u32) {
    let pred = (inst >> 24) & 0xF;
    let succ = (inst >> 20) & 0xF;
    const R: u32 = 0b0010;
    const W: u32 = 0b0001;
    if pred & W != 0 && succ & R != 0 {
        fence(Ordering::SeqCst);
    } else if pred != 0 || succ != 0 {
        fence(Ordering::AcqRel);
    }
}

fn muldiv64(funct3: u32, rs1: u64, rs2: u64) -> u64 {
    match funct3 {
        FUNCT3_MUL => rs1.wrapping_mul(rs2),
        FUNCT3_MULH => ((rs1 as i64 as i128 * rs2 as i64 as i128) >> 64) as u64,
        FUNCT3_MULHSU => ((rs1 as i64 as i128 * rs2 as i128) >> 64) as u64,
        FUNCT3_MULHU => ((rs1 as u128 * rs2 as u128) >> 64) as u64,
        FUNCT3_DIV => {
            let (a, b) = (rs1 as i64, rs2 as i64);
            if b == 0 {
                u64::MAX
            } else {
                a.wrapping_div(b) as u64
            }
        }
        FUNCT3_DIVU => rs1.checked_div(rs2).unwrap_or(u64::MAX),
        FUNCT3_REM => {
            let (a, b) = (rs1 as i64, rs2 as i64);
            if b == 0 {
                rs1
            } else {
                a.wrapping_rem(b) as u64
            }
        }
        _ => rs1.checked_rem(rs2).unwrap_or(rs1),
    }
}

/// 32-bit M extension: RV32 OP and RV64 OP-32 (where only MUL/DIV/REM exist).
fn muldiv32(funct3: u32, rs1: u32, rs2: u32) -> u32 {
    match funct3 {
        FUNCT3_MUL => rs1.wrapping_mul(rs2),
        FUNCT3_MULH => ((rs1 as i32 as i64 * rs2 as i32 as i64) >> 32) as u32,
        FUNCT3_MULHSU => ((rs1 as i32 as i64 * rs2 as i64) >> 32) as u32,
        FUNCT3_MULHU => ((rs1 as u64 * rs2 as u64) >> 32) as u32,
        FUNCT3_DIV => {
            let (a, b) = (rs1 as i32, rs2 as i32);
            if b == 0 {
                u32::MAX
            } else {
                a.wrapping_div(b) as u32
            }
        }
        FUNCT3_DIVU => rs1.checked_div(rs2).unwrap_or(u32::MAX),
        FUNCT3_REM => {
            let (a, b) = (rs1 as i32, rs2 as i32);
            if b == 0 {
                rs1
            } else {
                a.wrapping_rem(b) as u32
            }
        }
        _ => rs1.checked_rem(rs2).unwrap_or(rs1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::csr::{CSR_MSCRATCH, MSTATUS_TVM};
    use crate::cpu::testutil;

    fn r_type(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        funct7 << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
    }

    fn i_type(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        ((imm as u32) << 20) | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
    }

    fn exec(hart: &mut Hart, inst: u32) -> Result<(), Trap> {
        let r = hart.execute(Fetched { inst, raw: inst, len: 4 });
        hart.regs[0] = 0;
        r
    }

    #[test]
    fn test_addi_and_lui() {
        let mut hart = testutil::rv64();
        exec(&mut hart, i_type(-5, 0, 0, 1, OP_OP_IMM)).unwrap();
        assert_eq!(hart.regs[1] as i64, -5);
        assert_eq!(hart.pc, 0x8000_0004);
        exec(&mut hart, 0x8000_00B7).unwrap(); // lui x1, 0x80000
        assert_eq!(hart.regs[1], 0xFFFF_FFFF_8000_0000);
        // writes to x0 vanish
        exec(&mut hart, i_type(7, 0, 0, 0, OP_OP_IMM)).unwrap();
        assert_eq!(hart.regs[0], 0);
    }

    #[test]
    fn test_rv32_width() {
        let mut hart = testutil::rv32();
        hart.regs[1] = 0xFFFF_FFFF_8000_0000; // -2^31, sign-extended
        exec(&mut hart, i_type(1, 1, FUNCT3_SRL_SRA, 2, OP_OP_IMM)).unwrap(); // srli x2, x1, 1
        assert_eq!(hart.regs[2], 0x4000_0000);
        exec(&mut hart, i_type(0x401, 1, FUNCT3_SRL_SRA, 3, OP_OP_IMM)).unwrap(); // srai x3, x1, 1
        assert_eq!(hart.regs[3], 0xFFFF_FFFF_C000_0000);
        exec(&mut hart, i_type(-1, 1, 0, 4, OP_OP_IMM)).unwrap(); // addi wraps to +0x7fffffff
        assert_eq!(hart.regs[4], 0x7FFF_FFFF);
        // shamt[5] is reserved on RV32
        assert!(exec(&mut hart, i_type(32, 1, FUNCT3_SLL, 5, OP_OP_IMM)).is_err());
        // no 64-bit loads or OP-32
        assert!(exec(&mut hart, i_type(0, 0, FUNCT3_LD, 5, OP_LOAD)).is_err());
        assert!(exec(&mut hart, r_type(0, 1, 1, 0, 5, OP_OP_32)).is_err());
    }

    #[test]
    fn test_muldiv() {
        let mut hart = testutil::rv64();
        hart.regs[1] = (-7i64) as u64;
        hart.regs[2] = 0;
        exec(&mut hart, r_type(FUNCT7_MULDIV, 2, 1, FUNCT3_DIV, 3, OP_OP)).unwrap();
        assert_eq!(hart.regs[3], u64::MAX);
        exec(&mut hart, r_type(FUNCT7_MULDIV, 2, 1, FUNCT3_REM, 3, OP_OP)).unwrap();
        assert_eq!(hart.regs[3], (-7i64) as u64);
        hart.regs[1] = i64::MIN as u64;
        hart.regs[2] = u64::MAX;
        exec(&mut hart, r_type(FUNCT7_MULDIV, 2, 1, FUNCT3_DIV, 3, OP_OP)).unwrap();
        assert_eq!(hart.regs[3], i64::MIN as u64);
        exec(&mut hart, r_type(FUNCT7_MULDIV, 2, 1, FUNCT3_MULHU, 3, OP_OP)).unwrap();
        assert_eq!(hart.regs[3], 0x7FFF_FFFF_FFFF_FFFF);

        let mut hart = testutil::rv32();
        hart.regs[1] = (-2i64) as u64;
        hart.regs[2] = 3;
        exec(&mut hart, r_type(FUNCT7_MULDIV, 2, 1, FUNCT3_MULH, 3, OP_OP)).unwrap();
        assert_eq!(hart.regs[3], u64::MAX);
        exec(&mut hart, r_type(FUNCT7_MULDIV, 2, 1, FUNCT3_MULHU, 3, OP_OP)).unwrap();
        assert_eq!(hart.regs[3], 2);
    }

    #[test]
    fn test_branch_and_jumps() {
        let mut hart = testutil::rv64();
        hart.regs[1] = 1;
        exec(&mut hart, 0xFE00_8EE3).unwrap(); // beq x1, x0, -4 (not taken)
        assert_eq!(hart.pc, 0x8000_0004);
        exec(&mut hart, 0x0100_00EF).unwrap(); // jal x1, 16
        assert_eq!(hart.pc, 0x8000_0014);
        assert_eq!(hart.regs[1], 0x8000_0008);
        exec(&mut hart, i_type(1, 1, 0, 0, OP_JALR)).unwrap(); // jalr x0, 1(x1)
        assert_eq!(hart.pc, 0x8000_0008);
    }

    #[test]
    fn test_loads_sign_extend() {
        let mut hart = testutil::rv64();
        hart.store(0x8000_0100, 4, 0x8000_00FF).unwrap();
        hart.regs[1] = 0x8000_0100;
        exec(&mut hart, i_type(0, 1, FUNCT3_LB, 2, OP_LOAD)).unwrap();
        assert_eq!(hart.regs[2], u64::MAX);
        exec(&mut hart, i_type(0, 1, FUNCT3_LW, 2, OP_LOAD)).unwrap();
        assert_eq!(hart.regs[2], 0xFFFF_FFFF_8000_00FF);
        exec(&mut hart, i_type(0, 1, FUNCT3_LWU, 2, OP_LOAD)).unwrap();
        assert_eq!(hart.regs[2], 0x8000_00FF);
    }

    #[test]
    fn test_faulting_load_keeps_pc() {
        let mut hart = testutil::rv64();
        hart.regs[1] = 0x10;
        assert_eq!(exec(&mut hart, i_type(0, 1, FUNCT3_LW, 2, OP_LOAD)), Err(Trap::LoadAccessFault(0x10)));
        assert_eq!(hart.pc, 0x8000_0000);
    }

    #[test]
    fn test_csr_instructions() {
        let mut hart = testutil::rv64();
        hart.regs[1] = 0x1234;
        // csrrw x2, mscratch, x1
        exec(&mut hart, i_type(CSR_MSCRATCH as i32, 1, FUNCT3_CSRRW, 2, OP_SYSTEM)).unwrap();
        assert_eq!(hart.csr.mscratch, 0x1234);
        // csrrsi x3, mscratch, 1
        exec(&mut hart, i_type(CSR_MSCRATCH as i32, 1, 6, 3, OP_SYSTEM)).unwrap();
        assert_eq!(hart.regs[3], 0x1234);
        assert_eq!(hart.csr.mscratch, 0x1235);

        hart.set_privilege(PrivilegeLevel::User);
        let inst = i_type(CSR_MSCRATCH as i32, 1, FUNCT3_CSRRW, 2, OP_SYSTEM);
        assert_eq!(exec(&mut hart, inst), Err(Trap::IllegalInstruction(inst as u64)));
    }

    #[test]
    fn test_privileged_instruction_gating() {
        let mut hart = testutil::rv64();
        hart.set_privilege(PrivilegeLevel::User);
        assert!(exec(&mut hart, INST_WFI).is_err());
        assert!(exec(&mut hart, INST_SRET).is_err());
        assert!(exec(&mut hart, INST_MRET).is_err());
        assert_eq!(exec(&mut hart, INST_ECALL), Err(Trap::EnvironmentCallFromU));

        let sfence = r_type(FUNCT7_SFENCE_VMA, 0, 0, 0, 0, OP_SYSTEM);
        assert!(exec(&mut hart, sfence).is_err());
        hart.set_privilege(PrivilegeLevel::Supervisor);
        assert!(exec(&mut hart, sfence).is_ok());
        hart.csr.mstatus |= MSTATUS_TVM;
        assert!(exec(&mut hart, sfence).is_err());

        hart.set_privilege(PrivilegeLevel::Machine);
        exec(&mut hart, INST_WFI).unwrap();
        assert!(hart.is_waiting());
    }

    #[test]
    fn test_atomic_instructions() {
        let mut hart = testutil::rv64();
        hart.regs[1] = 0x8000_0200;
        hart.regs[2] = 5;
        let lr_w = r_type(FUNCT5_LR << 2, 0, 1, 2, 3, OP_AMO);
        let sc_w = r_type(FUNCT5_SC << 2, 2, 1, 2, 4, OP_AMO);
        let amoadd_w = r_type(0, 2, 1, 2, 5, OP_AMO);
        exec(&mut hart, lr_w).unwrap();
        exec(&mut hart, sc_w).unwrap();
        assert_eq!(hart.regs[4], 0);
        exec(&mut hart, sc_w).unwrap();
        assert_eq!(hart.regs[4], 1);
        exec(&mut hart, amoadd_w).unwrap();
        assert_eq!(hart.regs[5], 5);
        assert_eq!(hart.load(0x8000_0200, 4), Ok(10));
    }

    #[test]
    fn test_fp_moves_need_fpu() {
        let fmv_w_x = r_type(FUNCT7_FMV_W_X, 0, 1, 0, 2, OP_OP_FP);
        let fmv_x_w = r_type(FUNCT7_FMV_X_W, 0, 2, 0, 3, OP_OP_FP);
        let mut hart = testutil::rv64();
        assert!(exec(&mut hart, fmv_w_x).is_err());

        let cfg = crate::MachineConfig { fpu: true, ram_size: 1 << 20, ..Default::default() };
        let mut hart = testutil::hart(&cfg);
        // FS is off after reset
        assert!(exec(&mut hart, fmv_w_x).is_err());
        hart.csr.mstatus |= 1 << 13;
        hart.regs[1] = 0x8000_0000;
        exec(&mut hart, fmv_w_x).unwrap();
        assert_eq!(hart.fregs.as_ref().unwrap()[2], NAN_BOX | 0x8000_0000);
        exec(&mut hart, fmv_x_w).unwrap();
        assert_eq!(hart.regs[3], 0xFFFF_FFFF_8000_0000);
        assert_eq!(hart.csr.mstatus & crate::cpu::csr::MSTATUS_FS, crate::cpu::csr::MSTATUS_FS);
    }
}
