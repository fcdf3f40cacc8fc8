//! Instruction merge pass.
//!
//! Produces a second program array, the same length as the decoded one,
//! in which maximal runs of PUSH, POP, or LDI are replaced by a single
//! batched opcode carrying the run length, and the decrement/branch-back
//! idiom (DEC followed by BRNE) is fused into one opcode. Slots covered
//! by a run keep their original records so the engine can land on them
//! from a jump and so merged handlers can re-read per-slot operands.
//!
//! Merged handlers replay the underlying instructions sub-step by
//! sub-step (exec.rs), so the merge set is restricted to opcodes that are
//! cheap to replay and whose handlers can stop after any sub-step.

use crate::opcodes::{DecodedInstruction, Op};

/// Longest batched run a single merged handler invocation will perform.
pub const MAX_MERGE_RUN: u16 = 64;

/// Build the merged program from the decoded program.
pub fn merge_program(decoded: &[DecodedInstruction]) -> Vec<DecodedInstruction> {
    let mut merged: Vec<DecodedInstruction> = decoded.to_vec();

    let mut i = 0;
    while i < decoded.len() {
        let d = decoded[i];
        match d.op {
            Op::Push | Op::Pop | Op::Ldi => {
                let mut n = 1u16;
                while (i + n as usize) < decoded.len()
                    && decoded[i + n as usize].op == d.op
                    && n < MAX_MERGE_RUN
                {
                    n += 1;
                }
                if n > 1 {
                    let op = match d.op {
                        Op::Push => Op::MergedPush,
                        Op::Pop => Op::MergedPop,
                        _ => Op::MergedLdi,
                    };
                    merged[i] = DecodedInstruction { op, dst: d.dst, src: d.src, word: n };
                }
                i += n as usize;
            }
            Op::Dec => {
                if i + 1 < decoded.len() {
                    let b = decoded[i + 1];
                    // BRNE = BRBC on the Z flag
                    if b.op == Op::Brbc && b.dst == 1 {
                        merged[i] = DecodedInstruction {
                            op: Op::MergedDecBrne,
                            dst: d.dst,
                            src: 0,
                            word: b.word,
                        };
                    }
                }
                i += 1;
            }
            _ => i += d.op.words() as usize,
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::decode_program;

    fn assemble(words: &[u16]) -> Vec<u8> {
        let mut out = Vec::new();
        for w in words {
            out.push(*w as u8);
            out.push((*w >> 8) as u8);
        }
        out
    }

    #[test]
    fn test_merge_push_run() {
        // PUSH r2, PUSH r3, PUSH r4, NOP
        let flash = assemble(&[0x922f, 0x923f, 0x924f, 0x0000]);
        let decoded = decode_program(&flash, 4);
        let merged = merge_program(&decoded);
        assert_eq!(merged.len(), decoded.len());
        assert_eq!(merged[0].op, Op::MergedPush);
        assert_eq!(merged[0].word, 3);
        // covered slots keep their original records
        assert_eq!(merged[1].op, Op::Push);
        assert_eq!(merged[2].op, Op::Push);
        assert_eq!(merged[3].op, Op::Nop);
    }

    #[test]
    fn test_merge_ldi_run() {
        // LDI r16..r19
        let flash = assemble(&[0xe000, 0xe011, 0xe022, 0xe033]);
        let decoded = decode_program(&flash, 4);
        let merged = merge_program(&decoded);
        assert_eq!(merged[0].op, Op::MergedLdi);
        assert_eq!(merged[0].word, 4);
    }

    #[test]
    fn test_single_instruction_not_merged() {
        // lone PUSH stays a plain PUSH
        let flash = assemble(&[0x922f, 0x0000]);
        let decoded = decode_program(&flash, 2);
        let merged = merge_program(&decoded);
        assert_eq!(merged[0].op, Op::Push);
    }

    #[test]
    fn test_merge_dec_brne() {
        // DEC r24; BRNE .-4
        let flash = assemble(&[0x958a, 0xf7f1, 0x0000]);
        let decoded = decode_program(&flash, 3);
        assert_eq!(decoded[0].op, Op::Dec);
        assert_eq!(decoded[1].op, Op::Brbc);
        let merged = merge_program(&decoded);
        assert_eq!(merged[0].op, Op::MergedDecBrne);
        assert_eq!(merged[0].dst, 24);
        assert_eq!(merged[0].word as i16, -2);
        // the branch slot is untouched
        assert_eq!(merged[1].op, Op::Brbc);
    }

    #[test]
    fn test_dec_without_brne_not_fused() {
        // DEC r24; NOP
        let flash = assemble(&[0x958a, 0x0000]);
        let decoded = decode_program(&flash, 2);
        let merged = merge_program(&decoded);
        assert_eq!(merged[0].op, Op::Dec);
    }
}
