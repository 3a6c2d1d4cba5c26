//! Compressed (C) extension
//!
//! Every 16-bit instruction is expanded to its 32-bit equivalent so the
//! interpreter only has one decoder. Reserved encodings expand to `None`.

use super::decode::*;

pub fn expand_compressed(inst: u16, rv64: bool) -> Option<u32> {
    let opcode = inst & 0b11;
    let funct3 = (inst >> 13) & 0b111;

    match (funct3, opcode) {
        (0b000, 0b00) => c_addi4spn(inst),
        (0b001, 0b00) => c_fld(inst),
        (0b010, 0b00) => c_lw(inst),
        (0b011, 0b00) if rv64 => c_ld(inst),
        (0b011, 0b00) => c_flw(inst),
        (0b101, 0b00) => c_fsd(inst),
        (0b110, 0b00) => c_sw(inst),
        (0b111, 0b00) if rv64 => c_sd(inst),
        (0b111, 0b00) => c_fsw(inst),

        (0b000, 0b01) => c_addi(inst),
        (0b001, 0b01) if rv64 => c_addiw(inst),
        (0b001, 0b01) => c_jal(inst),
        (0b010, 0b01) => c_li(inst),
        (0b011, 0b01) => c_addi16sp_lui(inst),
        (0b100, 0b01) => c_alu_imm(inst, rv64),
        (0b101, 0b01) => c_j(inst),
        (0b110, 0b01) => c_beqz(inst),
        (0b111, 0b01) => c_bnez(inst),

        (0b000, 0b10) => c_slli(inst, rv64),
        (0b001, 0b10) => c_fldsp(inst),
        (0b010, 0b10) => c_lwsp(inst),
        (0b011, 0b10) if rv64 => c_ldsp(inst),
        (0b011, 0b10) => c_flwsp(inst),
        (0b100, 0b10) => c_misc_alu(inst),
        (0b101, 0b10) => c_fsdsp(inst),
        (0b110, 0b10) => c_swsp(inst),
        (0b111, 0b10) if rv64 => c_sdsp(inst),
        (0b111, 0b10) => c_fswsp(inst),
        _ => None,
    }
}

#[inline]
fn bits(inst: u16, lo: u32, len: u32) -> u32 {
    (inst as u32 >> lo) & ((1 << len) - 1)
}

fn reg_prime(val: u32) -> u32 {
    8 + (val & 0x7)
}

fn sign_extend(val: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((val << shift) as i32) >> shift
}

fn encode_i(op: u32, rd: u32, rs1: u32, funct3: u32, imm: i32) -> u32 {
    let imm_u = (imm as u32) & 0xFFF;
    (imm_u << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | op
}

fn encode_u(op: u32, rd: u32, imm: i32) -> u32 {
    (imm as u32 & 0xFFFF_F000) | (rd << 7) | op
}

fn encode_r(op: u32, rd: u32, rs1: u32, rs2: u32, funct3: u32, funct7: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | op
}

fn encode_s(op: u32, rs1: u32, rs2: u32, funct3: u32, imm: i32) -> u32 {
    let imm_u = imm as u32;
    ((imm_u >> 5) & 0x7F) << 25 | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (imm_u & 0x1F) << 7 | op
}

fn encode_b(op: u32, rs1: u32, rs2: u32, funct3: u32, imm: i32) -> u32 {
    let imm_u = imm as u32;
    ((imm_u >> 12) & 1) << 31
        | ((imm_u >> 5) & 0x3F) << 25
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | ((imm_u >> 1) & 0xF) << 8
        | ((imm_u >> 11) & 1) << 7
        | op
}

fn encode_j(op: u32, rd: u32, imm: i32) -> u32 {
    let imm_u = imm as u32;
    ((imm_u >> 20) & 1) << 31
        | ((imm_u >> 12) & 0xFF) << 12
        | ((imm_u >> 11) & 1) << 20
        | ((imm_u >> 1) & 0x3FF) << 21
        | (rd << 7)
        | op
}

// Scaled unsigned offsets shared by several loads/stores.

/// c.lw / c.sw / c.flw / c.fsw: uimm[5:3|2|6]
fn word_offset(inst: u16) -> i32 {
    (bits(inst, 10, 3) << 3 | bits(inst, 6, 1) << 2 | bits(inst, 5, 1) << 6) as i32
}

/// c.ld / c.sd / c.fld / c.fsd: uimm[5:3|7:6]
fn double_offset(inst: u16) -> i32 {
    (bits(inst, 10, 3) << 3 | bits(inst, 5, 2) << 6) as i32
}

/// c.lwsp / c.flwsp: uimm[5|4:2|7:6]
fn word_sp_load_offset(inst: u16) -> i32 {
    (bits(inst, 12, 1) << 5 | bits(inst, 4, 3) << 2 | bits(inst, 2, 2) << 6) as i32
}

/// c.ldsp / c.fldsp: uimm[5|4:3|8:6]
fn double_sp_load_offset(inst: u16) -> i32 {
    (bits(inst, 12, 1) << 5 | bits(inst, 5, 2) << 3 | bits(inst, 2, 3) << 6) as i32
}

/// c.swsp / c.fswsp: uimm[5:2|7:6]
fn word_sp_store_offset(inst: u16) -> i32 {
    (bits(inst, 9, 4) << 2 | bits(inst, 7, 2) << 6) as i32
}

/// c.sdsp / c.fsdsp: uimm[5:3|8:6]
fn double_sp_store_offset(inst: u16) -> i32 {
    (bits(inst, 10, 3) << 3 | bits(inst, 7, 3) << 6) as i32
}

fn imm6(inst: u16) -> i32 {
    sign_extend(bits(inst, 2, 5) | bits(inst, 12, 1) << 5, 6)
}

fn c_addi4spn(inst: u16) -> Option<u32> {
    let rd = reg_prime(bits(inst, 2, 3));
    let imm = bits(inst, 12, 1) << 5
        | bits(inst, 11, 1) << 4
        | bits(inst, 7, 4) << 6
        | bits(inst, 6, 1) << 2
        | bits(inst, 5, 1) << 3;
    if imm == 0 {
        return None;
    }
    Some(encode_i(OP_OP_IMM, rd, 2, FUNCT3_ADD_SUB, imm as i32))
}

fn c_lw(inst: u16) -> Option<u32> {
    let rd = reg_prime(bits(inst, 2, 3));
    let rs1 = reg_prime(bits(inst, 7, 3));
    Some(encode_i(OP_LOAD, rd, rs1, FUNCT3_LW, word_offset(inst)))
}

fn c_ld(inst: u16) -> Option<u32> {
    let rd = reg_prime(bits(inst, 2, 3));
    let rs1 = reg_prime(bits(inst, 7, 3));
    Some(encode_i(OP_LOAD, rd, rs1, FUNCT3_LD, double_offset(inst)))
}

fn c_flw(inst: u16) -> Option<u32> {
    let rd = reg_prime(bits(inst, 2, 3));
    let rs1 = reg_prime(bits(inst, 7, 3));
    Some(encode_i(OP_LOAD_FP, rd, rs1, FUNCT3_LW, word_offset(inst)))
}

fn c_fld(inst: u16) -> Option<u32> {
    let rd = reg_prime(bits(inst, 2, 3));
    let rs1 = reg_prime(bits(inst, 7, 3));
    Some(encode_i(OP_LOAD_FP, rd, rs1, FUNCT3_LD, double_offset(inst)))
}

fn c_sw(inst: u16) -> Option<u32> {
    let rs2 = reg_prime(bits(inst, 2, 3));
    let rs1 = reg_prime(bits(inst, 7, 3));
    Some(encode_s(OP_STORE, rs1, rs2, FUNCT3_LW, word_offset(inst)))
}

fn c_sd(inst: u16) -> Option<u32> {
    let rs2 = reg_prime(bits(inst, 2, 3));
    let rs1 = reg_prime(bits(inst, 7, 3));
    Some(encode_s(OP_STORE, rs1, rs2, FUNCT3_LD, double_offset(inst)))
}

fn c_fsw(inst: u16) -> Option<u32> {
    let rs2 = reg_prime(bits(inst, 2, 3));
    let rs1 = reg_prime(bits(inst, 7, 3));
    Some(encode_s(OP_STORE_FP, rs1, rs2, FUNCT3_LW, word_offset(inst)))
}

fn c_fsd(inst: u16) -> Option<u32> {
    let rs2 = reg_prime(bits(inst, 2, 3));
    let rs1 = reg_prime(bits(inst, 7, 3));
    Some(encode_s(OP_STORE_FP, rs1, rs2, FUNCT3_LD, double_offset(inst)))
}

fn c_addi(inst: u16) -> Option<u32> {
    let rd = bits(inst, 7, 5);
    Some(encode_i(OP_OP_IMM, rd, rd, FUNCT3_ADD_SUB, imm6(inst)))
}

fn c_addiw(inst: u16) -> Option<u32> {
    let rd = bits(inst, 7, 5);
    if rd == 0 {
        return None;
    }
    Some(encode_i(OP_OP_IMM_32, rd, rd, FUNCT3_ADD_SUB, imm6(inst)))
}

fn c_jal(inst: u16) -> Option<u32> {
    Some(encode_j(OP_JAL, 1, decode_cj_imm(inst)))
}

fn c_li(inst: u16) -> Option<u32> {
    let rd = bits(inst, 7, 5);
    Some(encode_i(OP_OP_IMM, rd, 0, FUNCT3_ADD_SUB, imm6(inst)))
}

fn c_addi16sp_lui(inst: u16) -> Option<u32> {
    let rd = bits(inst, 7, 5);
    if rd == 2 {
        let imm = bits(inst, 12, 1) << 9
            | bits(inst, 3, 2) << 7
            | bits(inst, 5, 1) << 6
            | bits(inst, 2, 1) << 5
            | bits(inst, 6, 1) << 4;
        if imm == 0 {
            return None;
        }
        Some(encode_i(OP_OP_IMM, 2, 2, FUNCT3_ADD_SUB, sign_extend(imm, 10)))
    } else {
        let imm = imm6(inst);
        if imm == 0 {
            return None;
        }
        Some(encode_u(OP_LUI, rd, imm << 12))
    }
}

fn c_alu_imm(inst: u16, rv64: bool) -> Option<u32> {
    let subop = bits(inst, 10, 2);
    let rs1 = reg_prime(bits(inst, 7, 3));
    let shamt = bits(inst, 2, 5) | bits(inst, 12, 1) << 5;

    match subop {
        0b00 | 0b01 if !rv64 && shamt & 0x20 != 0 => None,
        0b00 => Some(encode_i(OP_OP_IMM, rs1, rs1, FUNCT3_SRL_SRA, shamt as i32)),
        0b01 => Some(encode_i(OP_OP_IMM, rs1, rs1, FUNCT3_SRL_SRA, (0b010000 << 6) | shamt as i32)),
        0b10 => Some(encode_i(OP_OP_IMM, rs1, rs1, FUNCT3_AND, imm6(inst))),
        _ => c_alu_reg(inst, rv64),
    }
}

fn c_alu_reg(inst: u16, rv64: bool) -> Option<u32> {
    let rs1 = reg_prime(bits(inst, 7, 3));
    let rs2 = reg_prime(bits(inst, 2, 3));
    let funct2 = bits(inst, 5, 2);

    if bits(inst, 12, 1) == 0 {
        let (funct3, funct7) = match funct2 {
            0b00 => (FUNCT3_ADD_SUB, FUNCT7_SUB_SRA),
            0b01 => (FUNCT3_XOR, 0),
            0b10 => (FUNCT3_OR, 0),
            _ => (FUNCT3_AND, 0),
        };
        Some(encode_r(OP_OP, rs1, rs1, rs2, funct3, funct7))
    } else {
        if !rv64 {
            return None;
        }
        let funct7 = match funct2 {
            0b00 => FUNCT7_SUB_SRA, // subw
            0b01 => 0,              // addw
            _ => return None,
        };
        Some(encode_r(OP_OP_32, rs1, rs1, rs2, FUNCT3_ADD_SUB, funct7))
    }
}

fn c_j(inst: u16) -> Option<u32> {
    Some(encode_j(OP_JAL, 0, decode_cj_imm(inst)))
}

fn c_beqz(inst: u16) -> Option<u32> {
    let rs1 = reg_prime(bits(inst, 7, 3));
    Some(encode_b(OP_BRANCH, rs1, 0, FUNCT3_BEQ, decode_cb_imm(inst)))
}

fn c_bnez(inst: u16) -> Option<u32> {
    let rs1 = reg_prime(bits(inst, 7, 3));
    Some(encode_b(OP_BRANCH, rs1, 0, FUNCT3_BNE, decode_cb_imm(inst)))
}

fn c_slli(inst: u16, rv64: bool) -> Option<u32> {
    let rd = bits(inst, 7, 5);
    let shamt = bits(inst, 2, 5) | bits(inst, 12, 1) << 5;
    if !rv64 && shamt & 0x20 != 0 {
        return None;
    }
    Some(encode_i(OP_OP_IMM, rd, rd, FUNCT3_SLL, shamt as i32))
}

fn c_lwsp(inst: u16) -> Option<u32> {
    let rd = bits(inst, 7, 5);
    if rd == 0 {
        return None;
    }
    Some(encode_i(OP_LOAD, rd, 2, FUNCT3_LW, word_sp_load_offset(inst)))
}

fn c_ldsp(inst: u16) -> Option<u32> {
    let rd = bits(inst, 7, 5);
    if rd == 0 {
        return None;
    }
    Some(encode_i(OP_LOAD, rd, 2, FUNCT3_LD, double_sp_load_offset(inst)))
}

fn c_flwsp(inst: u16) -> Option<u32> {
    Some(encode_i(OP_LOAD_FP, bits(inst, 7, 5), 2, FUNCT3_LW, word_sp_load_offset(inst)))
}

fn c_fldsp(inst: u16) -> Option<u32> {
    Some(encode_i(OP_LOAD_FP, bits(inst, 7, 5), 2, FUNCT3_LD, double_sp_load_offset(inst)))
}

fn c_misc_alu(inst: u16) -> Option<u32> {
    let rd = bits(inst, 7, 5);
    let rs2 = bits(inst, 2, 5);

    match (bits(inst, 12, 1), rd, rs2) {
        (0, 0, 0) => None,
        (0, _, 0) => Some(encode_i(OP_JALR, 0, rd, FUNCT3_ADD_SUB, 0)), // c.jr
        (0, _, _) => Some(encode_r(OP_OP, rd, 0, rs2, FUNCT3_ADD_SUB, 0)), // c.mv
        (_, 0, 0) => Some(INST_EBREAK),
        (_, _, 0) => Some(encode_i(OP_JALR, 1, rd, FUNCT3_ADD_SUB, 0)), // c.jalr
        _ => Some(encode_r(OP_OP, rd, rd, rs2, FUNCT3_ADD_SUB, 0)), // c.add
    }
}

fn c_swsp(inst: u16) -> Option<u32> {
    Some(encode_s(OP_STORE, 2, bits(inst, 2, 5), FUNCT3_LW, word_sp_store_offset(inst)))
}

fn c_sdsp(inst: u16) -> Option<u32> {
    Some(encode_s(OP_STORE, 2, bits(inst, 2, 5), FUNCT3_LD, double_sp_store_offset(inst)))
}

fn c_fswsp(inst: u16) -> Option<u32> {
    Some(encode_s(OP_STORE_FP, 2, bits(inst, 2, 5), FUNCT3_LW, word_sp_store_offset(inst)))
}

fn c_fsdsp(inst: u16) -> Option<u32> {
    Some(encode_s(OP_STORE_FP, 2, bits(inst, 2, 5), FUNCT3_LD, double_sp_store_offset(inst)))
}

/// offset[11|4|9:8|10|6|7|3:1|5]
fn decode_cj_imm(inst: u16) -> i32 {
    let imm = bits(inst, 12, 1) << 11
        | bits(inst, 8, 1) << 10
        | bits(inst, 9, 2) << 8
        | bits(inst, 6, 1) << 7
        | bits(inst, 7, 1) << 6
        | bits(inst, 2, 1) << 5
        | bits(inst, 11, 1) << 4
        | bits(inst, 3, 3) << 1;
    sign_extend(imm, 12)
}

/// offset[8|4:3] in 12:10, offset[7:6|2:1|5] in 6:2
fn decode_cb_imm(inst: u16) -> i32 {
    let imm = bits(inst, 12, 1) << 8
        | bits(inst, 5, 2) << 6
        | bits(inst, 2, 1) << 5
        | bits(inst, 10, 2) << 3
        | bits(inst, 3, 2) << 1;
    sign_extend(imm, 9)
}
