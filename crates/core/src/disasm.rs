//! AVR instruction disassembler.
//!
//! Formats [`DecodedInstruction`] records as assembly text. Used by the
//! debugger seam for breakpoint and stepping views; relative branches
//! resolve their targets against the instruction's own word address.

use crate::opcodes::{decode, DecodedInstruction, Op};

fn io(addr: u16) -> u16 {
    // decode stores I/O operands as data-space addresses
    addr.wrapping_sub(0x20)
}

fn branch(name: &str, pc: u16, k: u16) -> String {
    let k = k as i16;
    let target = (pc as i32 + 1 + k as i32) as u16;
    format!("{} .{:+} ; 0x{:04X}", name, k, target.wrapping_mul(2))
}

const BRBS_NAMES: [&str; 8] = [
    "BRCS", "BREQ", "BRMI", "BRVS", "BRLT", "BRHS", "BRTS", "BRIE",
];
const BRBC_NAMES: [&str; 8] = [
    "BRCC", "BRNE", "BRPL", "BRVC", "BRGE", "BRHC", "BRTC", "BRID",
];
const BSET_NAMES: [&str; 8] = [
    "SEC", "SEZ", "SEN", "SEV", "SES", "SEH", "SET", "SEI",
];
const BCLR_NAMES: [&str; 8] = [
    "CLC", "CLZ", "CLN", "CLV", "CLS", "CLH", "CLT", "CLI",
];

/// Format one instruction as assembly text.
///
/// `pc` is the instruction's own word address, used to resolve relative
/// branch and call targets.
pub fn disassemble(i: DecodedInstruction, pc: u16) -> String {
    let d = i.dst;
    let r = i.src;
    match i.op {
        Op::Nop => "NOP".into(),
        Op::Movw => format!("MOVW R{}:R{}, R{}:R{}", d + 1, d, r + 1, r),
        Op::Muls => format!("MULS R{}, R{}", d, r),
        Op::Mulsu => format!("MULSU R{}, R{}", d, r),
        Op::Fmul => format!("FMUL R{}, R{}", d, r),
        Op::Fmuls => format!("FMULS R{}, R{}", d, r),
        Op::Fmulsu => format!("FMULSU R{}, R{}", d, r),
        Op::Cpc => format!("CPC R{}, R{}", d, r),
        Op::Sbc => format!("SBC R{}, R{}", d, r),
        Op::Add => format!("ADD R{}, R{}", d, r),
        Op::Cpse => format!("CPSE R{}, R{}", d, r),
        Op::Cp => format!("CP R{}, R{}", d, r),
        Op::Sub => format!("SUB R{}, R{}", d, r),
        Op::Adc => format!("ADC R{}, R{}", d, r),
        Op::And => format!("AND R{}, R{}", d, r),
        Op::Eor => format!("EOR R{}, R{}", d, r),
        Op::Or => format!("OR R{}, R{}", d, r),
        Op::Mov => format!("MOV R{}, R{}", d, r),
        Op::Cpi => format!("CPI R{}, 0x{:02X}", d, r),
        Op::Sbci => format!("SBCI R{}, 0x{:02X}", d, r),
        Op::Subi => format!("SUBI R{}, 0x{:02X}", d, r),
        Op::Ori => format!("ORI R{}, 0x{:02X}", d, r),
        Op::Andi => format!("ANDI R{}, 0x{:02X}", d, r),
        Op::LddY if r == 0 => format!("LD R{}, Y", d),
        Op::LddY => format!("LDD R{}, Y+{}", d, r),
        Op::LddZ if r == 0 => format!("LD R{}, Z", d),
        Op::LddZ => format!("LDD R{}, Z+{}", d, r),
        Op::StdY if r == 0 => format!("ST Y, R{}", d),
        Op::StdY => format!("STD Y+{}, R{}", r, d),
        Op::StdZ if r == 0 => format!("ST Z, R{}", d),
        Op::StdZ => format!("STD Z+{}, R{}", r, d),
        Op::Lds => format!("LDS R{}, 0x{:04X}", d, i.word),
        Op::Sts => format!("STS 0x{:04X}, R{}", i.word, d),
        Op::LdX => format!("LD R{}, X", d),
        Op::LdXInc => format!("LD R{}, X+", d),
        Op::LdXDec => format!("LD R{}, -X", d),
        Op::LdYInc => format!("LD R{}, Y+", d),
        Op::LdYDec => format!("LD R{}, -Y", d),
        Op::LdZInc => format!("LD R{}, Z+", d),
        Op::LdZDec => format!("LD R{}, -Z", d),
        Op::StX => format!("ST X, R{}", d),
        Op::StXInc => format!("ST X+, R{}", d),
        Op::StXDec => format!("ST -X, R{}", d),
        Op::StYInc => format!("ST Y+, R{}", d),
        Op::StYDec => format!("ST -Y, R{}", d),
        Op::StZInc => format!("ST Z+, R{}", d),
        Op::StZDec => format!("ST -Z, R{}", d),
        Op::Lpm => format!("LPM R{}, Z", d),
        Op::LpmInc => format!("LPM R{}, Z+", d),
        Op::LpmR0 => "LPM".into(),
        Op::Elpm => format!("ELPM R{}, Z", d),
        Op::ElpmInc => format!("ELPM R{}, Z+", d),
        Op::ElpmR0 => "ELPM".into(),
        Op::Push => format!("PUSH R{}", d),
        Op::Pop => format!("POP R{}", d),
        Op::Com => format!("COM R{}", d),
        Op::Neg => format!("NEG R{}", d),
        Op::Swap => format!("SWAP R{}", d),
        Op::Inc => format!("INC R{}", d),
        Op::Asr => format!("ASR R{}", d),
        Op::Lsr => format!("LSR R{}", d),
        Op::Ror => format!("ROR R{}", d),
        Op::Dec => format!("DEC R{}", d),
        Op::Bset => BSET_NAMES[(d & 7) as usize].into(),
        Op::Bclr => BCLR_NAMES[(d & 7) as usize].into(),
        Op::Ijmp => "IJMP".into(),
        Op::Icall => "ICALL".into(),
        Op::Ret => "RET".into(),
        Op::Reti => "RETI".into(),
        Op::Sleep => "SLEEP".into(),
        Op::Break => "BREAK".into(),
        Op::Wdr => "WDR".into(),
        Op::Spm => "SPM".into(),
        Op::Jmp => format!("JMP 0x{:06X}", (i.word as u32) * 2),
        Op::Call => format!("CALL 0x{:06X}", (i.word as u32) * 2),
        Op::Adiw => format!("ADIW R{}:R{}, {}", d + 1, d, r),
        Op::Sbiw => format!("SBIW R{}:R{}, {}", d + 1, d, r),
        Op::Cbi => format!("CBI 0x{:02X}, {}", io(i.word), d),
        Op::Sbic => format!("SBIC 0x{:02X}, {}", io(i.word), d),
        Op::Sbi => format!("SBI 0x{:02X}, {}", io(i.word), d),
        Op::Sbis => format!("SBIS 0x{:02X}, {}", io(i.word), d),
        Op::Mul => format!("MUL R{}, R{}", d, r),
        Op::In => format!("IN R{}, 0x{:02X}", d, io(i.word)),
        Op::Out => format!("OUT 0x{:02X}, R{}", io(i.word), d),
        Op::Rjmp => branch("RJMP", pc, i.word),
        Op::Rcall => branch("RCALL", pc, i.word),
        Op::Ldi => format!("LDI R{}, 0x{:02X}", d, r),
        Op::Brbs => branch(BRBS_NAMES[(d & 7) as usize], pc, i.word),
        Op::Brbc => branch(BRBC_NAMES[(d & 7) as usize], pc, i.word),
        Op::Bld => format!("BLD R{}, {}", d, r),
        Op::Bst => format!("BST R{}, {}", d, r),
        Op::Sbrc => format!("SBRC R{}, {}", d, r),
        Op::Sbrs => format!("SBRS R{}, {}", d, r),
        Op::Wide => ".dw (operand)".into(),
        Op::Unknown => ".dw ?".into(),
        // synthetic fused forms, shown with their run length
        Op::MergedPush => format!("PUSH x{}", i.word),
        Op::MergedPop => format!("POP x{}", i.word),
        Op::MergedLdi => format!("LDI x{}", i.word),
        Op::MergedDecBrne => format!("DEC R{}; BRNE", d),
    }
}

/// Format the SREG byte as "ITHSVNZC" with clear flags lowercased.
pub fn format_sreg(sreg: u8) -> String {
    let flags = ['I', 'T', 'H', 'S', 'V', 'N', 'Z', 'C'];
    let mut s = String::with_capacity(8);
    for (i, &f) in flags.iter().enumerate() {
        if sreg & (1 << (7 - i)) != 0 {
            s.push(f);
        } else {
            s.push(f.to_ascii_lowercase());
        }
    }
    s
}

/// Disassemble a word-address range of a flash image.
///
/// Returns lines of `"0xAAAA: OPCODE  MNEMONIC"`, one per instruction,
/// with byte addresses and raw opcode words shown.
pub fn disassemble_range(flash: &[u8], start_word: usize, end_word: usize) -> Vec<String> {
    let read_word = |i: usize| -> u16 {
        let b = i * 2;
        if b + 1 < flash.len() {
            flash[b] as u16 | ((flash[b + 1] as u16) << 8)
        } else {
            0xffff
        }
    };

    let mut lines = Vec::new();
    let mut i = start_word;
    while i < end_word && i * 2 + 1 < flash.len() {
        let w = read_word(i);
        let inst = decode(w, read_word(i + 1));
        let asm = disassemble(inst, i as u16);
        if inst.op.words() == 2 {
            lines.push(format!("0x{:04X}: {:04X} {:04X}  {}", i * 2, w, read_word(i + 1), asm));
            i += 2;
        } else {
            lines.push(format!("0x{:04X}: {:04X}       {}", i * 2, w, asm));
            i += 1;
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dis(w: u16) -> String {
        disassemble(decode(w, 0), 0)
    }

    #[test]
    fn test_disasm_basic() {
        assert_eq!(dis(0x0000), "NOP");
        assert_eq!(dis(0x0c12), "ADD R1, R2");
        assert_eq!(dis(0xef0f), "LDI R16, 0xFF");
        assert_eq!(dis(0x930f), "PUSH R16");
    }

    #[test]
    fn test_disasm_io_addresses_unconverted() {
        // decode stores SREG as data address 0x5F; listing shows I/O 0x3F
        assert_eq!(dis(0xbe0f), "OUT 0x3F, R0");
        assert_eq!(dis(0xb18b), "IN R24, 0x0B");
    }

    #[test]
    fn test_disasm_branch_target() {
        let i = decode(0xcfff, 0); // RJMP .-1
        let s = disassemble(i, 0x10);
        assert!(s.starts_with("RJMP .-1"));
        assert!(s.contains("0x0020")); // 0x10 + 1 - 1, bytes
        // BRNE gets its flag-specific mnemonic
        assert!(dis(0xf7e9).starts_with("BRNE"));
    }

    #[test]
    fn test_disasm_sreg_ops() {
        assert_eq!(dis(0x9478), "SEI");
        assert_eq!(dis(0x94f8), "CLI");
    }

    #[test]
    fn test_disasm_range_two_word() {
        // JMP 0x0002; NOP
        let flash = [0x0c, 0x94, 0x02, 0x00, 0x00, 0x00];
        let lines = disassemble_range(&flash, 0, 3);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("JMP 0x000004"));
        assert!(lines[1].contains("NOP"));
    }

    #[test]
    fn test_format_sreg() {
        assert_eq!(format_sreg(0xff), "ITHSVNZC");
        assert_eq!(format_sreg(0x00), "ithsvnzc");
        assert_eq!(format_sreg(0x83), "IthsvnZC");
    }
}
