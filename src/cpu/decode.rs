//! Instruction decoder
//!
//! Field extraction for 32-bit encodings. Compressed instructions are
//! expanded to their 32-bit equivalents first (see `compressed.rs`).

/// One fetched instruction as the interpreter and the block cache see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fetched {
    /// 32-bit encoding (expanded if compressed)
    pub inst: u32,
    /// Bits as they sit in memory, reported as tval on illegal instruction
    pub raw: u32,
    /// 2 or 4
    pub len: u8,
}

/// Decoded instruction fields
#[derive(Debug, Clone, Copy)]
pub struct DecodedInst {
    pub opcode: u32,
    pub rd: usize,
    pub rs1: usize,
    pub rs2: usize,
    pub funct3: u32,
    pub funct7: u32,
}

impl DecodedInst {
    #[inline(always)]
    pub fn decode(inst: u32) -> Self {
        DecodedInst {
            opcode: inst & 0x7F,
            rd: ((inst >> 7) & 0x1F) as usize,
            rs1: ((inst >> 15) & 0x1F) as usize,
            rs2: ((inst >> 20) & 0x1F) as usize,
            funct3: (inst >> 12) & 0x7,
            funct7: (inst >> 25) & 0x7F,
        }
    }

    #[inline(always)]
    pub fn imm_i(inst: u32) -> i64 {
        ((inst as i32) >> 20) as i64
    }

    #[inline(always)]
    pub fn imm_s(inst: u32) -> i64 {
        (((inst & 0xFE00_0000) as i32 >> 20) | ((inst >> 7) & 0x1F) as i32) as i64
    }

    #[inline(always)]
    pub fn imm_b(inst: u32) -> i64 {
        (((inst & 0x8000_0000) as i32 >> 19)
            | (((inst >> 7) & 1) << 11) as i32
            | (((inst >> 25) & 0x3F) << 5) as i32
            | (((inst >> 8) & 0xF) << 1) as i32) as i64
    }

    #[inline(always)]
    pub fn imm_u(inst: u32) -> i64 {
        (inst & 0xFFFF_F000) as i32 as i64
    }

    #[inline(always)]
    pub fn imm_j(inst: u32) -> i64 {
        (((inst & 0x8000_0000) as i32 >> 11)
            | (inst & 0xF_F000) as i32
            | (((inst >> 20) & 1) << 11) as i32
            | (((inst >> 21) & 0x3FF) << 1) as i32) as i64
    }
}

/// Instructions that end a compiled block after executing.
#[inline]
pub fn is_control_transfer(inst: u32) -> bool {
    matches!(inst & 0x7F, OP_BRANCH | OP_JAL | OP_JALR)
}

/// Instructions a compiled block cannot contain: anything that touches
/// privilege state, the block cache itself, or needs the reservation.
#[inline]
pub fn is_compilable(inst: u32) -> bool {
    match inst & 0x7F {
        OP_SYSTEM | OP_AMO => false,
        OP_MISC_MEM => (inst >> 12) & 7 != FUNCT3_FENCE_I,
        _ => true,
    }
}

// Opcodes
pub const OP_LUI: u32 = 0b0110111;
pub const OP_AUIPC: u32 = 0b0010111;
pub const OP_JAL: u32 = 0b1101111;
pub const OP_JALR: u32 = 0b1100111;
pub const OP_BRANCH: u32 = 0b1100011;
pub const OP_LOAD: u32 = 0b0000011;
pub const OP_STORE: u32 = 0b0100011;
pub const OP_OP_IMM: u32 = 0b0010011;
pub const OP_OP: u32 = 0b0110011;
pub const OP_OP_IMM_32: u32 = 0b0011011;
pub const OP_OP_32: u32 = 0b0111011;
pub const OP_MISC_MEM: u32 = 0b0001111;
pub const OP_SYSTEM: u32 = 0b1110011;
pub const OP_AMO: u32 = 0b0101111;
pub const OP_LOAD_FP: u32 = 0b0000111;
pub const OP_STORE_FP: u32 = 0b0100111;
pub const OP_OP_FP: u32 = 0b1010011;

// Branch funct3
pub const FUNCT3_BEQ: u32 = 0b000;
pub const FUNCT3_BNE: u32 = 0b001;
pub const FUNCT3_BLT: u32 = 0b100;
pub const FUNCT3_BGE: u32 = 0b101;
pub const FUNCT3_BLTU: u32 = 0b110;
pub const FUNCT3_BGEU: u32 = 0b111;

// Load/Store funct3
pub const FUNCT3_LB: u32 = 0b000;
pub const FUNCT3_LH: u32 = 0b001;
pub const FUNCT3_LW: u32 = 0b010;
pub const FUNCT3_LD: u32 = 0b011;
pub const FUNCT3_LBU: u32 = 0b100;
pub const FUNCT3_LHU: u32 = 0b101;
pub const FUNCT3_LWU: u32 = 0b110;

// ALU funct3
pub const FUNCT3_ADD_SUB: u32 = 0b000;
pub const FUNCT3_SLL: u32 = 0b001;
pub const FUNCT3_SLT: u32 = 0b010;
pub const FUNCT3_SLTU: u32 = 0b011;
pub const FUNCT3_XOR: u32 = 0b100;
pub const FUNCT3_SRL_SRA: u32 = 0b101;
pub const FUNCT3_OR: u32 = 0b110;
pub const FUNCT3_AND: u32 = 0b111;

// M extension funct3
pub const FUNCT3_MUL: u32 = 0b000;
pub const FUNCT3_MULH: u32 = 0b001;
pub const FUNCT3_MULHSU: u32 = 0b010;
pub const FUNCT3_MULHU: u32 = 0b011;
pub const FUNCT3_DIV: u32 = 0b100;
pub const FUNCT3_DIVU: u32 = 0b101;
pub const FUNCT3_REM: u32 = 0b110;
pub const FUNCT3_REMU: u32 = 0b111;

pub const FUNCT7_MULDIV: u32 = 0b0000001;
pub const FUNCT7_SUB_SRA: u32 = 0b0100000;

// MISC-MEM funct3
pub const FUNCT3_FENCE: u32 = 0b000;
pub const FUNCT3_FENCE_I: u32 = 0b001;

// System funct3
pub const FUNCT3_PRIV: u32 = 0b000;
pub const FUNCT3_CSRRW: u32 = 0b001;
pub const FUNCT3_CSRRS: u32 = 0b010;
pub const FUNCT3_CSRRC: u32 = 0b011;

// Privileged instructions (full encodings / funct7)
pub const INST_ECALL: u32 = 0x0000_0073;
pub const INST_EBREAK: u32 = 0x0010_0073;
pub const INST_SRET: u32 = 0x1020_0073;
pub const INST_MRET: u32 = 0x3020_0073;
pub const INST_WFI: u32 = 0x1050_0073;
pub const FUNCT7_SFENCE_VMA: u32 = 0b0001001;

// AMO funct5
pub const FUNCT5_LR: u32 = 0b00010;
pub const FUNCT5_SC: u32 = 0b00011;

// FP moves (integer <-> FP register bit transfers)
pub const FUNCT7_FMV_X_W: u32 = 0b1110000;
pub const FUNCT7_FMV_W_X: u32 = 0b1111000;
pub const FUNCT7_FMV_X_D: u32 = 0b1110001;
pub const FUNCT7_FMV_D_X: u32 = 0b1111001;
