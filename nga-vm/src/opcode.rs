use std::convert::TryFrom;

use strum_macros::Display;

use crate::vm::{VmError, VmErrorKind};

/// The 30 primitive operations the VM's bundle decoder recognizes.
///
/// WARN: if this enum changes, update the `TryFrom<u8>` bound check below and the repr values
/// stay dense and contiguous — the decoder relies on `0..=29` being exactly the valid range.
#[repr(u8)]
#[derive(Display, Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpCode {
    #[strum(serialize = "nop")]
    Nop = 0,
    #[strum(serialize = "lit")]
    Lit = 1,
    #[strum(serialize = "dup")]
    Dup = 2,
    #[strum(serialize = "drop")]
    Drop = 3,
    #[strum(serialize = "swap")]
    Swap = 4,
    #[strum(serialize = "push")]
    Push = 5,
    #[strum(serialize = "pop")]
    Pop = 6,
    #[strum(serialize = "jump")]
    Jump = 7,
    #[strum(serialize = "call")]
    Call = 8,
    #[strum(serialize = "ccall")]
    CCall = 9,
    #[strum(serialize = "return")]
    Return = 10,
    #[strum(serialize = "eq")]
    Eq = 11,
    #[strum(serialize = "neq")]
    Neq = 12,
    #[strum(serialize = "lt")]
    Lt = 13,
    #[strum(serialize = "gt")]
    Gt = 14,
    #[strum(serialize = "fetch")]
    Fetch = 15,
    #[strum(serialize = "store")]
    Store = 16,
    #[strum(serialize = "add")]
    Add = 17,
    #[strum(serialize = "sub")]
    Sub = 18,
    #[strum(serialize = "mul")]
    Mul = 19,
    #[strum(serialize = "divmod")]
    DivMod = 20,
    #[strum(serialize = "and")]
    And = 21,
    #[strum(serialize = "or")]
    Or = 22,
    #[strum(serialize = "xor")]
    Xor = 23,
    #[strum(serialize = "shift")]
    Shift = 24,
    #[strum(serialize = "zret")]
    ZRet = 25,
    #[strum(serialize = "halt")]
    Halt = 26,
    #[strum(serialize = "ienum")]
    IEnum = 27,
    #[strum(serialize = "iquery")]
    IQuery = 28,
    #[strum(serialize = "isend")]
    ISend = 29,
}

impl TryFrom<u8> for OpCode {
    type Error = VmError;

    fn try_from(byte: u8) -> Result<OpCode, Self::Error> {
        if byte > OpCode::ISend as u8 {
            Err(VmError { ip: None, kind: VmErrorKind::InvalidOpcode { bundle: 0, byte } })
        } else {
            Ok(unsafe { std::mem::transmute(byte) })
        }
    }
}
