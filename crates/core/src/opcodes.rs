//! AVR instruction decoder.
//!
//! Decoding is total: every 16-bit pattern maps to exactly one [`Op`],
//! with [`Op::Unknown`] as the fallback, so a corrupt or data-filled
//! program slot can never fail to decode. The whole program is decoded
//! once at load time into a flat array of [`DecodedInstruction`] records,
//! one per 2-byte word slot. Two-word instructions (JMP/CALL/LDS/STS)
//! consume the following slot as an operand; that slot decodes to
//! [`Op::Wide`] and is never independently executed.

/// Normalized opcode identifier, independent of the raw bit encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Nop,
    Movw,
    Muls,
    Mulsu,
    Fmul,
    Fmuls,
    Fmulsu,
    Cpc,
    Sbc,
    Add,
    Cpse,
    Cp,
    Sub,
    Adc,
    And,
    Eor,
    Or,
    Mov,
    Cpi,
    Sbci,
    Subi,
    Ori,
    Andi,
    // Load/store through pointer registers. The displacement forms cover
    // plain LD/ST Y/Z as the q = 0 case.
    LddY,
    LddZ,
    StdY,
    StdZ,
    Lds,
    Sts,
    LdX,
    LdXInc,
    LdXDec,
    LdYInc,
    LdYDec,
    LdZInc,
    LdZDec,
    StX,
    StXInc,
    StXDec,
    StYInc,
    StYDec,
    StZInc,
    StZDec,
    Lpm,
    LpmInc,
    LpmR0,
    Elpm,
    ElpmInc,
    ElpmR0,
    Push,
    Pop,
    Com,
    Neg,
    Swap,
    Inc,
    Asr,
    Lsr,
    Ror,
    Dec,
    Bset,
    Bclr,
    Ijmp,
    Icall,
    Ret,
    Reti,
    Sleep,
    Break,
    Wdr,
    Spm,
    Jmp,
    Call,
    Adiw,
    Sbiw,
    Cbi,
    Sbic,
    Sbi,
    Sbis,
    Mul,
    In,
    Out,
    Rjmp,
    Rcall,
    Ldi,
    Brbs,
    Brbc,
    Bld,
    Bst,
    Sbrc,
    Sbrs,
    /// Second word of a two-word instruction; never executed directly.
    Wide,
    /// Unrecognized bit pattern.
    Unknown,
    // Synthetic opcodes produced by the merge pass (merge.rs). The run
    // length (or fused branch offset) is carried in the word field.
    MergedPush,
    MergedPop,
    MergedLdi,
    MergedDecBrne,
}

impl Op {
    /// Number of program words this instruction occupies (1 or 2).
    pub fn words(self) -> u16 {
        match self {
            Op::Jmp | Op::Call | Op::Lds | Op::Sts => 2,
            _ => 1,
        }
    }
}

/// One record per 2-byte program slot.
///
/// `dst`/`src` hold register indices, immediates, or bit numbers depending
/// on the opcode; `word` holds wide immediates, I/O addresses, branch
/// offsets (a sign-extended `i16` cast to `u16`), or the second
/// instruction word.
#[derive(Debug, Clone, Copy)]
pub struct DecodedInstruction {
    pub op: Op,
    pub dst: u8,
    pub src: u8,
    pub word: u16,
}

impl DecodedInstruction {
    pub const fn unknown() -> Self {
        DecodedInstruction { op: Op::Unknown, dst: 0, src: 0, word: 0 }
    }

    const fn wide() -> Self {
        DecodedInstruction { op: Op::Wide, dst: 0, src: 0, word: 0 }
    }
}

#[inline(always)]
fn instr(op: Op, dst: u8, src: u8, word: u16) -> DecodedInstruction {
    DecodedInstruction { op, dst, src, word }
}

/// d and r fields of the two-register ALU encoding:
/// `oooo oord dddd rrrr`
#[inline(always)]
fn fields_rd(w: u16) -> (u8, u8) {
    let d = ((w >> 4) & 0x1f) as u8;
    let r = ((w & 0xf) | ((w >> 5) & 0x10)) as u8;
    (d, r)
}

/// d and K fields of the register-immediate encoding (d in 16..=31):
/// `oooo KKKK dddd KKKK`
#[inline(always)]
fn fields_dk(w: u16) -> (u8, u8) {
    let d = 16 + ((w >> 4) & 0xf) as u8;
    let k = ((w & 0xf) | ((w >> 4) & 0xf0)) as u8;
    (d, k)
}

/// Displacement q of the LDD/STD encoding:
/// `10q0 qqod dddd oqqq`
#[inline(always)]
fn field_q(w: u16) -> u8 {
    ((w & 0x7) | ((w >> 7) & 0x18) | ((w >> 8) & 0x20)) as u8
}

#[inline(always)]
fn sign_extend_7(x: u16) -> u16 {
    (((x as i16) << 9) >> 9) as u16
}

#[inline(always)]
fn sign_extend_12(x: u16) -> u16 {
    (((x as i16) << 4) >> 4) as u16
}

/// Decode one instruction word. `next` is the following program word,
/// consumed by two-word instructions.
pub fn decode(w: u16, next: u16) -> DecodedInstruction {
    match w >> 12 {
        0x0 => match (w >> 8) & 0xf {
            0x0 => {
                if w == 0 {
                    instr(Op::Nop, 0, 0, 0)
                } else {
                    DecodedInstruction::unknown()
                }
            }
            0x1 => {
                let d = (((w >> 4) & 0xf) * 2) as u8;
                let r = ((w & 0xf) * 2) as u8;
                instr(Op::Movw, d, r, 0)
            }
            0x2 => {
                let d = 16 + ((w >> 4) & 0xf) as u8;
                let r = 16 + (w & 0xf) as u8;
                instr(Op::Muls, d, r, 0)
            }
            0x3 => {
                let d = 16 + ((w >> 4) & 0x7) as u8;
                let r = 16 + (w & 0x7) as u8;
                let op = match (((w >> 7) & 1) << 1) | ((w >> 3) & 1) {
                    0 => Op::Mulsu,
                    1 => Op::Fmul,
                    2 => Op::Fmuls,
                    _ => Op::Fmulsu,
                };
                instr(op, d, r, 0)
            }
            0x4..=0x7 => {
                let (d, r) = fields_rd(w);
                instr(Op::Cpc, d, r, 0)
            }
            0x8..=0xb => {
                let (d, r) = fields_rd(w);
                instr(Op::Sbc, d, r, 0)
            }
            _ => {
                let (d, r) = fields_rd(w);
                instr(Op::Add, d, r, 0)
            }
        },
        0x1 => {
            let (d, r) = fields_rd(w);
            let op = match (w >> 10) & 0x3 {
                0 => Op::Cpse,
                1 => Op::Cp,
                2 => Op::Sub,
                _ => Op::Adc,
            };
            instr(op, d, r, 0)
        }
        0x2 => {
            let (d, r) = fields_rd(w);
            let op = match (w >> 10) & 0x3 {
                0 => Op::And,
                1 => Op::Eor,
                2 => Op::Or,
                _ => Op::Mov,
            };
            instr(op, d, r, 0)
        }
        0x3 => {
            let (d, k) = fields_dk(w);
            instr(Op::Cpi, d, k, 0)
        }
        0x4 => {
            let (d, k) = fields_dk(w);
            instr(Op::Sbci, d, k, 0)
        }
        0x5 => {
            let (d, k) = fields_dk(w);
            instr(Op::Subi, d, k, 0)
        }
        0x6 => {
            let (d, k) = fields_dk(w);
            instr(Op::Ori, d, k, 0)
        }
        0x7 => {
            let (d, k) = fields_dk(w);
            instr(Op::Andi, d, k, 0)
        }
        0x8 | 0xa => {
            // LDD/STD with displacement; q = 0 covers plain LD/ST Y/Z
            let d = ((w >> 4) & 0x1f) as u8;
            let q = field_q(w);
            let store = w & 0x0200 != 0;
            let y = w & 0x0008 != 0;
            let op = match (store, y) {
                (false, false) => Op::LddZ,
                (false, true) => Op::LddY,
                (true, false) => Op::StdZ,
                (true, true) => Op::StdY,
            };
            instr(op, d, q, 0)
        }
        0x9 => decode_9xxx(w, next),
        0xb => {
            let d = ((w >> 4) & 0x1f) as u8;
            // 6-bit I/O address converted to a data-space address here so
            // the executor never re-adds the 0x20 offset
            let a = ((w & 0xf) | ((w >> 5) & 0x30)) + 0x20;
            if w & 0x0800 != 0 {
                instr(Op::Out, d, 0, a)
            } else {
                instr(Op::In, d, 0, a)
            }
        }
        0xc => instr(Op::Rjmp, 0, 0, sign_extend_12(w & 0xfff)),
        0xd => instr(Op::Rcall, 0, 0, sign_extend_12(w & 0xfff)),
        0xe => {
            let (d, k) = fields_dk(w);
            instr(Op::Ldi, d, k, 0)
        }
        _ => decode_fxxx(w),
    }
}

fn decode_9xxx(w: u16, next: u16) -> DecodedInstruction {
    let d = ((w >> 4) & 0x1f) as u8;
    match (w >> 9) & 0x7 {
        // 0x9000..0x93ff: LDS/STS and pointer loads/stores
        0 | 1 => {
            let store = w & 0x0200 != 0;
            let op = match w & 0xf {
                0x0 => {
                    return if store {
                        instr(Op::Sts, d, 0, next)
                    } else {
                        instr(Op::Lds, d, 0, next)
                    };
                }
                0x1 => if store { Op::StZInc } else { Op::LdZInc },
                0x2 => if store { Op::StZDec } else { Op::LdZDec },
                0x4 if !store => Op::Lpm,
                0x5 if !store => Op::LpmInc,
                0x6 if !store => Op::Elpm,
                0x7 if !store => Op::ElpmInc,
                0x9 => if store { Op::StYInc } else { Op::LdYInc },
                0xa => if store { Op::StYDec } else { Op::LdYDec },
                0xc => if store { Op::StX } else { Op::LdX },
                0xd => if store { Op::StXInc } else { Op::LdXInc },
                0xe => if store { Op::StXDec } else { Op::LdXDec },
                0xf => if store { Op::Push } else { Op::Pop },
                _ => return DecodedInstruction::unknown(),
            };
            instr(op, d, 0, 0)
        }
        // 0x9400..0x95ff: one-operand ALU, SREG bit ops, misc, JMP/CALL
        2 => match w & 0xf {
            0x0 => instr(Op::Com, d, 0, 0),
            0x1 => instr(Op::Neg, d, 0, 0),
            0x2 => instr(Op::Swap, d, 0, 0),
            0x3 => instr(Op::Inc, d, 0, 0),
            0x5 => instr(Op::Asr, d, 0, 0),
            0x6 => instr(Op::Lsr, d, 0, 0),
            0x7 => instr(Op::Ror, d, 0, 0),
            0x8 => {
                if w & 0x0100 == 0 {
                    let s = ((w >> 4) & 0x7) as u8;
                    if w & 0x0080 == 0 {
                        instr(Op::Bset, s, 0, 0)
                    } else {
                        instr(Op::Bclr, s, 0, 0)
                    }
                } else {
                    decode_misc_9x8(w)
                }
            }
            0x9 => match w {
                0x9409 => instr(Op::Ijmp, 0, 0, 0),
                0x9509 => instr(Op::Icall, 0, 0, 0),
                _ => DecodedInstruction::unknown(),
            },
            0xa => instr(Op::Dec, d, 0, 0),
            0xc | 0xd => {
                let k = ((w & 1) | ((w >> 3) & 0x3e)) as u8;
                instr(Op::Jmp, k, 0, next)
            }
            0xe | 0xf => {
                let k = ((w & 1) | ((w >> 3) & 0x3e)) as u8;
                instr(Op::Call, k, 0, next)
            }
            _ => DecodedInstruction::unknown(),
        },
        // 0x9600..0x97ff: ADIW/SBIW on pairs r25:r24 / X / Y / Z
        3 => {
            let d = 24 + (((w >> 4) & 0x3) * 2) as u8;
            let k = ((w & 0xf) | ((w >> 2) & 0x30)) as u8;
            if w & 0x0100 == 0 {
                instr(Op::Adiw, d, k, 0)
            } else {
                instr(Op::Sbiw, d, k, 0)
            }
        }
        // 0x9800..0x9bff: I/O bit set/clear/test
        4 | 5 => {
            let a = ((w >> 3) & 0x1f) + 0x20;
            let b = (w & 0x7) as u8;
            let op = match (w >> 8) & 0x3 {
                0 => Op::Cbi,
                1 => Op::Sbic,
                2 => Op::Sbi,
                _ => Op::Sbis,
            };
            instr(op, b, 0, a)
        }
        // 0x9c00..0x9fff: MUL
        _ => {
            let (d, r) = fields_rd(w);
            instr(Op::Mul, d, r, 0)
        }
    }
}

fn decode_misc_9x8(w: u16) -> DecodedInstruction {
    match w {
        0x9508 => instr(Op::Ret, 0, 0, 0),
        0x9518 => instr(Op::Reti, 0, 0, 0),
        0x9588 => instr(Op::Sleep, 0, 0, 0),
        0x9598 => instr(Op::Break, 0, 0, 0),
        0x95a8 => instr(Op::Wdr, 0, 0, 0),
        0x95c8 => instr(Op::LpmR0, 0, 0, 0),
        0x95d8 => instr(Op::ElpmR0, 0, 0, 0),
        0x95e8 | 0x95f8 => instr(Op::Spm, 0, 0, 0),
        _ => DecodedInstruction::unknown(),
    }
}

fn decode_fxxx(w: u16) -> DecodedInstruction {
    match (w >> 9) & 0x7 {
        0 | 1 => {
            let s = (w & 0x7) as u8;
            let k = sign_extend_7((w >> 3) & 0x7f);
            instr(Op::Brbs, s, 0, k)
        }
        2 | 3 => {
            let s = (w & 0x7) as u8;
            let k = sign_extend_7((w >> 3) & 0x7f);
            instr(Op::Brbc, s, 0, k)
        }
        _ => {
            if w & 0x8 != 0 {
                return DecodedInstruction::unknown();
            }
            let d = ((w >> 4) & 0x1f) as u8;
            let b = (w & 0x7) as u8;
            let op = match (w >> 9) & 0x3 {
                0 => Op::Bld,
                1 => Op::Bst,
                2 => Op::Sbrc,
                _ => Op::Sbrs,
            };
            instr(op, d, b, 0)
        }
    }
}

/// Decode an entire program image into one record per word slot.
///
/// The second slot of each two-word instruction becomes [`Op::Wide`] so
/// the engine and the merge pass can tell operand words from code.
pub fn decode_program(flash: &[u8], num_words: usize) -> Vec<DecodedInstruction> {
    let read_word = |i: usize| -> u16 {
        let b = i * 2;
        if b + 1 < flash.len() {
            flash[b] as u16 | ((flash[b + 1] as u16) << 8)
        } else {
            0xffff
        }
    };

    let mut prog = Vec::with_capacity(num_words);
    let mut i = 0;
    while i < num_words {
        let d = decode(read_word(i), read_word(i + 1));
        let words = d.op.words();
        prog.push(d);
        i += 1;
        if words == 2 && i < num_words {
            prog.push(DecodedInstruction::wide());
            i += 1;
        }
    }
    prog
}
