//! Instruction execution.
//!
//! [`exec_one`] runs one decoded instruction, mutates machine state,
//! advances the program counter, and returns the cycle cost. Dispatch is a
//! flat match over [`Op`]; there is no per-instruction dynamic dispatch.
//!
//! [`exec_merged`] runs the batched opcodes produced by the merge pass.
//! A merged handler replays the underlying instructions sub-step by
//! sub-step and checks the abort condition after every sub-step, so if a
//! fault fires partway through a run the program counter and returned
//! cycle count cover only the sub-steps actually performed. This is what
//! keeps batching observationally identical to single-stepping.

use crate::opcodes::{DecodedInstruction, Op};
use crate::{BreakReason, Machine, SREG_C, SREG_H, SREG_I, SREG_N, SREG_S, SREG_T, SREG_V, SREG_Z};

#[inline(always)]
fn set_flag(m: &mut Machine, mask: u8, on: bool) {
    let s = m.mem.sreg();
    m.mem.set_sreg(if on { s | mask } else { s & !mask });
}

/// H, V, N, Z, C, S for ADD/ADC.
fn flags_add(m: &mut Machine, d: u8, r: u8, res: u8) {
    let mut s = m.mem.sreg() & !(SREG_H | SREG_V | SREG_N | SREG_Z | SREG_C | SREG_S);
    if (d & r | r & !res | !res & d) & 0x08 != 0 {
        s |= SREG_H;
    }
    if (d & r & !res | !d & !r & res) & 0x80 != 0 {
        s |= SREG_V;
    }
    if res & 0x80 != 0 {
        s |= SREG_N;
    }
    if res == 0 {
        s |= SREG_Z;
    }
    if (d & r | r & !res | !res & d) & 0x80 != 0 {
        s |= SREG_C;
    }
    if (s & SREG_N != 0) != (s & SREG_V != 0) {
        s |= SREG_S;
    }
    m.mem.set_sreg(s);
}

/// H, V, N, Z, C, S for SUB/CP family. With `keep_z` (SBC/CPC) the Z flag
/// can be cleared but never set, so multi-byte compares chain correctly.
fn flags_sub(m: &mut Machine, d: u8, r: u8, res: u8, keep_z: bool) {
    let old = m.mem.sreg();
    let mut s = old & !(SREG_H | SREG_V | SREG_N | SREG_Z | SREG_C | SREG_S);
    if (!d & r | r & res | res & !d) & 0x08 != 0 {
        s |= SREG_H;
    }
    if (d & !r & !res | !d & r & res) & 0x80 != 0 {
        s |= SREG_V;
    }
    if res & 0x80 != 0 {
        s |= SREG_N;
    }
    if res == 0 {
        if !keep_z || old & SREG_Z != 0 {
            s |= SREG_Z;
        }
    }
    if (!d & r | r & res | res & !d) & 0x80 != 0 {
        s |= SREG_C;
    }
    if (s & SREG_N != 0) != (s & SREG_V != 0) {
        s |= SREG_S;
    }
    m.mem.set_sreg(s);
}

/// V=0, N, Z, S for AND/OR/EOR/COM results.
fn flags_logic(m: &mut Machine, res: u8) {
    let mut s = m.mem.sreg() & !(SREG_V | SREG_N | SREG_Z | SREG_S);
    if res & 0x80 != 0 {
        s |= SREG_N | SREG_S;
    }
    if res == 0 {
        s |= SREG_Z;
    }
    m.mem.set_sreg(s);
}

/// N, Z, V, S for INC/DEC (C untouched). `v` is the overflow condition.
fn flags_inc_dec(m: &mut Machine, res: u8, v: bool) {
    let mut s = m.mem.sreg() & !(SREG_V | SREG_N | SREG_Z | SREG_S);
    if v {
        s |= SREG_V;
    }
    if res & 0x80 != 0 {
        s |= SREG_N;
    }
    if res == 0 {
        s |= SREG_Z;
    }
    if (s & SREG_N != 0) != (s & SREG_V != 0) {
        s |= SREG_S;
    }
    m.mem.set_sreg(s);
}

/// N, Z, C, V, S for the right-shift group. C is the bit shifted out.
fn flags_shift(m: &mut Machine, res: u8, carry: bool) {
    let mut s = m.mem.sreg() & !(SREG_V | SREG_N | SREG_Z | SREG_C | SREG_S);
    if carry {
        s |= SREG_C;
    }
    if res & 0x80 != 0 {
        s |= SREG_N;
    }
    if res == 0 {
        s |= SREG_Z;
    }
    // V = N xor C
    if (s & SREG_N != 0) != (s & SREG_C != 0) {
        s |= SREG_V;
    }
    if (s & SREG_N != 0) != (s & SREG_V != 0) {
        s |= SREG_S;
    }
    m.mem.set_sreg(s);
}

fn mul_result(m: &mut Machine, res: u16) {
    m.mem.set_reg(0, res as u8);
    m.mem.set_reg(1, (res >> 8) as u8);
    set_flag(m, SREG_C, res & 0x8000 != 0);
    set_flag(m, SREG_Z, res == 0);
}

/// Size in words of the instruction following `pc`, for skips.
#[inline(always)]
fn next_words(m: &Machine, pc: u16) -> u16 {
    m.decoded
        .get(pc as usize + 1)
        .map(|i| i.op.words())
        .unwrap_or(1)
}

#[inline(always)]
fn skip(m: &mut Machine, cond: bool) -> u32 {
    if cond {
        let w = next_words(m, m.pc);
        m.pc = m.pc.wrapping_add(1 + w);
        1 + w as u32
    } else {
        m.pc = m.pc.wrapping_add(1);
        1
    }
}

/// Execute one decoded instruction; returns its cycle cost.
pub fn exec_one(m: &mut Machine, i: DecodedInstruction) -> u32 {
    let d = i.dst;
    let r = i.src;
    match i.op {
        Op::Nop => {
            m.pc += 1;
            1
        }
        Op::Add => {
            let (a, b) = (m.mem.reg(d), m.mem.reg(r));
            let res = a.wrapping_add(b);
            flags_add(m, a, b, res);
            m.mem.set_reg(d, res);
            m.pc += 1;
            1
        }
        Op::Adc => {
            let c = m.mem.sreg() & SREG_C;
            let (a, b) = (m.mem.reg(d), m.mem.reg(r));
            let res = a.wrapping_add(b).wrapping_add(c);
            flags_add(m, a, b, res);
            m.mem.set_reg(d, res);
            m.pc += 1;
            1
        }
        Op::Sub | Op::Cp => {
            let (a, b) = (m.mem.reg(d), m.mem.reg(r));
            let res = a.wrapping_sub(b);
            flags_sub(m, a, b, res, false);
            if i.op == Op::Sub {
                m.mem.set_reg(d, res);
            }
            m.pc += 1;
            1
        }
        Op::Sbc | Op::Cpc => {
            let c = m.mem.sreg() & SREG_C;
            let (a, b) = (m.mem.reg(d), m.mem.reg(r));
            let res = a.wrapping_sub(b).wrapping_sub(c);
            flags_sub(m, a, b, res, true);
            if i.op == Op::Sbc {
                m.mem.set_reg(d, res);
            }
            m.pc += 1;
            1
        }
        Op::Subi | Op::Cpi => {
            let a = m.mem.reg(d);
            let res = a.wrapping_sub(r);
            flags_sub(m, a, r, res, false);
            if i.op == Op::Subi {
                m.mem.set_reg(d, res);
            }
            m.pc += 1;
            1
        }
        Op::Sbci => {
            let c = m.mem.sreg() & SREG_C;
            let a = m.mem.reg(d);
            let res = a.wrapping_sub(r).wrapping_sub(c);
            flags_sub(m, a, r, res, true);
            m.mem.set_reg(d, res);
            m.pc += 1;
            1
        }
        Op::And | Op::Andi => {
            let b = if i.op == Op::And { m.mem.reg(r) } else { r };
            let res = m.mem.reg(d) & b;
            flags_logic(m, res);
            m.mem.set_reg(d, res);
            m.pc += 1;
            1
        }
        Op::Or | Op::Ori => {
            let b = if i.op == Op::Or { m.mem.reg(r) } else { r };
            let res = m.mem.reg(d) | b;
            flags_logic(m, res);
            m.mem.set_reg(d, res);
            m.pc += 1;
            1
        }
        Op::Eor => {
            let res = m.mem.reg(d) ^ m.mem.reg(r);
            flags_logic(m, res);
            m.mem.set_reg(d, res);
            m.pc += 1;
            1
        }
        Op::Com => {
            let res = !m.mem.reg(d);
            flags_logic(m, res);
            set_flag(m, SREG_C, true);
            m.mem.set_reg(d, res);
            m.pc += 1;
            1
        }
        Op::Neg => {
            let a = m.mem.reg(d);
            let res = 0u8.wrapping_sub(a);
            flags_sub(m, 0, a, res, false);
            m.mem.set_reg(d, res);
            m.pc += 1;
            1
        }
        Op::Inc => {
            let res = m.mem.reg(d).wrapping_add(1);
            flags_inc_dec(m, res, res == 0x80);
            m.mem.set_reg(d, res);
            m.pc += 1;
            1
        }
        Op::Dec => {
            let res = m.mem.reg(d).wrapping_sub(1);
            flags_inc_dec(m, res, res == 0x7f);
            m.mem.set_reg(d, res);
            m.pc += 1;
            1
        }
        Op::Swap => {
            let a = m.mem.reg(d);
            m.mem.set_reg(d, (a << 4) | (a >> 4));
            m.pc += 1;
            1
        }
        Op::Asr => {
            let a = m.mem.reg(d);
            let res = ((a as i8) >> 1) as u8;
            flags_shift(m, res, a & 1 != 0);
            m.mem.set_reg(d, res);
            m.pc += 1;
            1
        }
        Op::Lsr => {
            let a = m.mem.reg(d);
            let res = a >> 1;
            flags_shift(m, res, a & 1 != 0);
            m.mem.set_reg(d, res);
            m.pc += 1;
            1
        }
        Op::Ror => {
            let a = m.mem.reg(d);
            let c = m.mem.sreg() & SREG_C;
            let res = (a >> 1) | (c << 7);
            flags_shift(m, res, a & 1 != 0);
            m.mem.set_reg(d, res);
            m.pc += 1;
            1
        }
        Op::Adiw | Op::Sbiw => {
            let a = m.mem.reg_word(d);
            let res = if i.op == Op::Adiw {
                a.wrapping_add(r as u16)
            } else {
                a.wrapping_sub(r as u16)
            };
            m.mem.set_reg_word(d, res);
            let dh7 = a & 0x8000 != 0;
            let r15 = res & 0x8000 != 0;
            let (v, c) = if i.op == Op::Adiw {
                (!dh7 && r15, !r15 && dh7)
            } else {
                (dh7 && !r15, r15 && !dh7)
            };
            let mut s = m.mem.sreg() & !(SREG_V | SREG_N | SREG_Z | SREG_C | SREG_S);
            if v {
                s |= SREG_V;
            }
            if c {
                s |= SREG_C;
            }
            if r15 {
                s |= SREG_N;
            }
            if res == 0 {
                s |= SREG_Z;
            }
            if (s & SREG_N != 0) != (s & SREG_V != 0) {
                s |= SREG_S;
            }
            m.mem.set_sreg(s);
            m.pc += 1;
            2
        }
        Op::Mul => {
            let res = m.mem.reg(d) as u16 * m.mem.reg(r) as u16;
            mul_result(m, res);
            m.pc += 1;
            2
        }
        Op::Muls => {
            let res = (m.mem.reg(d) as i8 as i16 * m.mem.reg(r) as i8 as i16) as u16;
            mul_result(m, res);
            m.pc += 1;
            2
        }
        Op::Mulsu => {
            let res = (m.mem.reg(d) as i8 as i16 * m.mem.reg(r) as i16) as u16;
            mul_result(m, res);
            m.pc += 1;
            2
        }
        Op::Fmul | Op::Fmuls | Op::Fmulsu => {
            let a = m.mem.reg(d);
            let b = m.mem.reg(r);
            let prod = match i.op {
                Op::Fmul => a as u16 * b as u16,
                Op::Fmuls => (a as i8 as i16 * b as i8 as i16) as u16,
                _ => (a as i8 as i16 * b as i16) as u16,
            };
            let res = prod << 1;
            m.mem.set_reg(0, res as u8);
            m.mem.set_reg(1, (res >> 8) as u8);
            set_flag(m, SREG_C, prod & 0x8000 != 0);
            set_flag(m, SREG_Z, res == 0);
            m.pc += 1;
            2
        }
        Op::Mov => {
            let v = m.mem.reg(r);
            m.mem.set_reg(d, v);
            m.pc += 1;
            1
        }
        Op::Movw => {
            let v = m.mem.reg_word(r);
            m.mem.set_reg_word(d, v);
            m.pc += 1;
            1
        }
        Op::Ldi => {
            m.mem.set_reg(d, r);
            m.pc += 1;
            1
        }
        Op::In => {
            let v = m.read_data(i.word);
            m.mem.set_reg(d, v);
            m.pc += 1;
            1
        }
        Op::Out => {
            let v = m.mem.reg(d);
            m.write_data(i.word, v);
            m.pc += 1;
            1
        }
        Op::Lds => {
            let v = m.read_data(i.word);
            m.mem.set_reg(d, v);
            m.pc += 2;
            2
        }
        Op::Sts => {
            let v = m.mem.reg(d);
            m.write_data(i.word, v);
            m.pc += 2;
            2
        }
        Op::LddY | Op::LddZ => {
            let base = if i.op == Op::LddY { m.mem.y() } else { m.mem.z() };
            let v = m.read_data(base.wrapping_add(r as u16));
            m.mem.set_reg(d, v);
            m.pc += 1;
            2
        }
        Op::StdY | Op::StdZ => {
            let base = if i.op == Op::StdY { m.mem.y() } else { m.mem.z() };
            let v = m.mem.reg(d);
            m.write_data(base.wrapping_add(r as u16), v);
            m.pc += 1;
            2
        }
        Op::LdX | Op::LdXInc | Op::LdXDec => {
            let mut p = m.mem.x();
            if i.op == Op::LdXDec {
                p = p.wrapping_sub(1);
            }
            let v = m.read_data(p);
            m.mem.set_reg(d, v);
            if i.op == Op::LdXInc {
                p = p.wrapping_add(1);
            }
            m.mem.set_x(p);
            m.pc += 1;
            2
        }
        Op::StX | Op::StXInc | Op::StXDec => {
            let mut p = m.mem.x();
            if i.op == Op::StXDec {
                p = p.wrapping_sub(1);
            }
            let v = m.mem.reg(d);
            m.write_data(p, v);
            if i.op == Op::StXInc {
                p = p.wrapping_add(1);
            }
            m.mem.set_x(p);
            m.pc += 1;
            2
        }
        Op::LdYInc | Op::LdYDec => {
            let mut p = m.mem.y();
            if i.op == Op::LdYDec {
                p = p.wrapping_sub(1);
            }
            let v = m.read_data(p);
            m.mem.set_reg(d, v);
            if i.op == Op::LdYInc {
                p = p.wrapping_add(1);
            }
            m.mem.set_y(p);
            m.pc += 1;
            2
        }
        Op::StYInc | Op::StYDec => {
            let mut p = m.mem.y();
            if i.op == Op::StYDec {
                p = p.wrapping_sub(1);
            }
            let v = m.mem.reg(d);
            m.write_data(p, v);
            if i.op == Op::StYInc {
                p = p.wrapping_add(1);
            }
            m.mem.set_y(p);
            m.pc += 1;
            2
        }
        Op::LdZInc | Op::LdZDec => {
            let mut p = m.mem.z();
            if i.op == Op::LdZDec {
                p = p.wrapping_sub(1);
            }
            let v = m.read_data(p);
            m.mem.set_reg(d, v);
            if i.op == Op::LdZInc {
                p = p.wrapping_add(1);
            }
            m.mem.set_z(p);
            m.pc += 1;
            2
        }
        Op::StZInc | Op::StZDec => {
            let mut p = m.mem.z();
            if i.op == Op::StZDec {
                p = p.wrapping_sub(1);
            }
            let v = m.mem.reg(d);
            m.write_data(p, v);
            if i.op == Op::StZInc {
                p = p.wrapping_add(1);
            }
            m.mem.set_z(p);
            m.pc += 1;
            2
        }
        Op::Lpm | Op::LpmInc | Op::Elpm | Op::ElpmInc => {
            // no RAMPZ on a 32 KB part; ELPM behaves like LPM
            let z = m.mem.z();
            let v = m.mem.read_flash_byte(z as usize);
            m.mem.set_reg(d, v);
            if i.op == Op::LpmInc || i.op == Op::ElpmInc {
                m.mem.set_z(z.wrapping_add(1));
            }
            m.pc += 1;
            3
        }
        Op::LpmR0 | Op::ElpmR0 => {
            let z = m.mem.z();
            let v = m.mem.read_flash_byte(z as usize);
            m.mem.set_reg(0, v);
            m.pc += 1;
            3
        }
        Op::Push => {
            let v = m.mem.reg(d);
            m.push(v);
            m.pc += 1;
            2
        }
        Op::Pop => {
            let v = m.pop();
            m.mem.set_reg(d, v);
            m.pc += 1;
            2
        }
        Op::Rjmp => {
            m.pc = m.pc.wrapping_add(1).wrapping_add(i.word);
            2
        }
        Op::Rcall => {
            let ret = m.pc.wrapping_add(1);
            m.push_word(ret);
            m.pc = ret.wrapping_add(i.word);
            3
        }
        Op::Ijmp => {
            m.pc = m.mem.z();
            2
        }
        Op::Icall => {
            let ret = m.pc.wrapping_add(1);
            m.push_word(ret);
            m.pc = m.mem.z();
            3
        }
        Op::Jmp => {
            m.pc = i.word;
            3
        }
        Op::Call => {
            let ret = m.pc.wrapping_add(2);
            m.push_word(ret);
            m.pc = i.word;
            4
        }
        Op::Ret => {
            m.pc = m.pop_word();
            4
        }
        Op::Reti => {
            m.pc = m.pop_word();
            let s = m.mem.sreg();
            m.mem.set_sreg(s | SREG_I);
            4
        }
        Op::Brbs | Op::Brbc => {
            let set = m.mem.sreg() & (1 << d) != 0;
            let taken = if i.op == Op::Brbs { set } else { !set };
            if taken {
                m.pc = m.pc.wrapping_add(1).wrapping_add(i.word);
                2
            } else {
                m.pc += 1;
                1
            }
        }
        Op::Cpse => {
            let eq = m.mem.reg(d) == m.mem.reg(r);
            skip(m, eq)
        }
        Op::Sbrc => {
            let clear = m.mem.reg(d) & (1 << r) == 0;
            skip(m, clear)
        }
        Op::Sbrs => {
            let set = m.mem.reg(d) & (1 << r) != 0;
            skip(m, set)
        }
        Op::Sbic => {
            let v = m.read_data(i.word);
            skip(m, v & (1 << d) == 0)
        }
        Op::Sbis => {
            let v = m.read_data(i.word);
            skip(m, v & (1 << d) != 0)
        }
        Op::Sbi | Op::Cbi => {
            let v = m.read_data(i.word);
            let v = if i.op == Op::Sbi {
                v | (1 << d)
            } else {
                v & !(1 << d)
            };
            m.write_data(i.word, v);
            m.pc += 1;
            2
        }
        Op::Bset => {
            let s = m.mem.sreg();
            m.mem.set_sreg(s | (1 << d));
            m.pc += 1;
            1
        }
        Op::Bclr => {
            let s = m.mem.sreg();
            m.mem.set_sreg(s & !(1 << d));
            m.pc += 1;
            1
        }
        Op::Bld => {
            let a = m.mem.reg(d);
            let t = m.mem.sreg() & SREG_T != 0;
            m.mem.set_reg(d, if t { a | (1 << r) } else { a & !(1 << r) });
            m.pc += 1;
            1
        }
        Op::Bst => {
            let bit = m.mem.reg(d) & (1 << r) != 0;
            set_flag(m, SREG_T, bit);
            m.pc += 1;
            1
        }
        Op::Sleep => {
            // SMCR sleep-enable gates the actual sleep
            if m.mem.data[0x53] & 1 != 0 {
                m.active = false;
            }
            m.pc += 1;
            1
        }
        Op::Wdr => {
            m.watchdog_restart();
            m.pc += 1;
            1
        }
        Op::Break => {
            m.paused = true;
            m.pc += 1;
            1
        }
        Op::Spm => {
            // flash self-programming is not modeled
            m.pc += 1;
            1
        }
        Op::Wide | Op::Unknown => {
            m.autobreak(BreakReason::UnknownInstruction);
            if m.paused {
                0
            } else {
                m.pc += 1;
                1
            }
        }
        Op::MergedPush | Op::MergedPop | Op::MergedLdi | Op::MergedDecBrne => exec_merged(m, i),
    }
}

/// Execute a batched opcode from the merged program.
pub fn exec_merged(m: &mut Machine, i: DecodedInstruction) -> u32 {
    match i.op {
        Op::MergedPush => {
            let base = m.pc;
            let mut cycles = 0;
            for k in 0..i.word {
                let reg = m.decoded[(base + k) as usize].dst;
                let v = m.mem.reg(reg);
                m.push(v);
                m.pc += 1;
                cycles += 2;
                if m.merge_abort() {
                    break;
                }
            }
            cycles
        }
        Op::MergedPop => {
            let base = m.pc;
            let mut cycles = 0;
            for k in 0..i.word {
                let reg = m.decoded[(base + k) as usize].dst;
                let v = m.pop();
                m.mem.set_reg(reg, v);
                m.pc += 1;
                cycles += 2;
                if m.merge_abort() {
                    break;
                }
            }
            cycles
        }
        Op::MergedLdi => {
            // LDI cannot touch I/O space, so the whole run always completes
            let base = m.pc;
            for k in 0..i.word {
                let slot = m.decoded[(base + k) as usize];
                m.mem.set_reg(slot.dst, slot.src);
            }
            m.pc += i.word;
            i.word as u32
        }
        Op::MergedDecBrne => {
            let res = m.mem.reg(i.dst).wrapping_sub(1);
            flags_inc_dec(m, res, res == 0x7f);
            m.mem.set_reg(i.dst, res);
            if res != 0 {
                m.pc = m.pc.wrapping_add(2).wrapping_add(i.word);
                3
            } else {
                m.pc += 2;
                2
            }
        }
        _ => exec_one(m, i),
    }
}
