//! This module contains the decoded form of JVM bytecode. The representation is slightly different
//! from the usual presentation to make it more convenient to compile from. For instance:
//!
//!   - The "wide" instruction doesn't show up at all, but instead gets merged into the
//!     instructions it is allowed to modify
//!
//!   - Families of instructions that differ only by operand type (`iload`/`lload`/..., `iadd`,
//!     `ladd`/...) get abstracted into one instruction with a [`ValueKind`] field. The short forms
//!     (`iload_0`, `iconst_m1`, ...) are folded in the same way.
//!
//!   - Branch offsets are resolved to absolute bytecode offsets, and `goto_w`/`jsr_w` are merged
//!     into `goto`/`jsr`
//!

use super::{BaseType, ConstantIndex, Error, FieldType};
use crate::util::Width;
use std::ops::Not;

/// Kinds of values that live on the operand stack and in locals
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum ValueKind {
    Int,
    Long,
    Float,
    Double,
    Object,

    /// Return address pushed by `jsr`
    Address,
}

impl ValueKind {
    /// Is this a heap reference that the garbage collector must see?
    pub fn is_reference(self) -> bool {
        self == ValueKind::Object
    }
}

impl Width for ValueKind {
    fn width(&self) -> usize {
        match self {
            ValueKind::Long | ValueKind::Double => 2,
            _ => 1,
        }
    }
}

impl From<&FieldType> for ValueKind {
    fn from(field_type: &FieldType) -> ValueKind {
        match field_type {
            FieldType::Base(BaseType::Long) => ValueKind::Long,
            FieldType::Base(BaseType::Float) => ValueKind::Float,
            FieldType::Base(BaseType::Double) => ValueKind::Double,
            FieldType::Base(_) => ValueKind::Int,
            FieldType::Object(_) | FieldType::Array(_) => ValueKind::Object,
        }
    }
}

/// Element kinds of arrays, as accessed by the `*aload`/`*astore` instructions
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum ArrayKind {
    Int,
    Long,
    Float,
    Double,
    Object,

    /// `baload`/`bastore` are used for both `byte[]` and `boolean[]`
    Byte,
    Char,
    Short,
}

impl ArrayKind {
    /// Kind of the value on the operand stack
    pub fn value_kind(self) -> ValueKind {
        match self {
            ArrayKind::Long => ValueKind::Long,
            ArrayKind::Float => ValueKind::Float,
            ArrayKind::Double => ValueKind::Double,
            ArrayKind::Object => ValueKind::Object,
            ArrayKind::Int | ArrayKind::Byte | ArrayKind::Char | ArrayKind::Short => {
                ValueKind::Int
            }
        }
    }

    /// Size of one element, in bytes
    pub fn element_size(self, reference_size: usize) -> usize {
        match self {
            ArrayKind::Byte => 1,
            ArrayKind::Char | ArrayKind::Short => 2,
            ArrayKind::Int | ArrayKind::Float => 4,
            ArrayKind::Long | ArrayKind::Double => 8,
            ArrayKind::Object => reference_size,
        }
    }
}

/// Arithmetic and bitwise operators
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,

    /// The shift amount is always an `int`, even when shifting a `long`
    Shift(ShiftType),
}

impl BinaryOp {
    /// Can this operator fault (and so throw) on integral operands?
    pub fn can_fault(self) -> bool {
        matches!(self, BinaryOp::Div | BinaryOp::Rem)
    }
}

/// Decoded JVM bytecode instruction
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    Nop,
    AConstNull,
    IConst(i32), // covers `iconst_<n>`, `bipush`, and `sipush`
    LConst(i64),
    FConst(f32),
    DConst(f64),
    Ldc(ConstantIndex), // covers both `ldc` and `ldc_w`
    Ldc2(ConstantIndex),
    Load(ValueKind, u16), // covers `iload`, `iload_<n>`, `wide iload`, and the other kinds
    Store(ValueKind, u16),
    IInc(u16, i16), // covers `iinc` and `wide iinc`
    ArrayLoad(ArrayKind),
    ArrayStore(ArrayKind),
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
    Binary(ValueKind, BinaryOp),
    Neg(ValueKind),
    Convert(ValueKind, ValueKind),
    Truncate(BaseType), // covers `i2b`, `i2c`, `i2s`
    LCmp,
    FCmp(CompareMode), // covers `fcmpl` and `fcmpg`
    DCmp(CompareMode), // covers `dcmpl` and `dcmpg`
    If(OrdComparison, usize), // covers `ifeq`, `ifne`, `iflt`, `ifge`, `ifgt`, `ifle`
    IfICmp(OrdComparison, usize),
    IfACmp(EqComparison, usize),
    IfNull(EqComparison, usize), // covers `ifnull`, `ifnonnull`
    Goto(usize),
    Jsr(usize),
    Ret(u16),
    TableSwitch {
        /// Jump target if the argument is outside of `low..low + targets.len()`
        default: usize,

        /// Value associated with the first jump target
        low: i32,
        targets: Vec<usize>,
    },
    LookupSwitch {
        /// Jump target if there is no corresponding key
        default: usize,

        /// Jump targets (keys are ascending in well-formed code)
        targets: Vec<(i32, usize)>,
    },
    Return(Option<ValueKind>),
    AThrow,
    GetStatic(ConstantIndex),
    PutStatic(ConstantIndex),
    GetField(ConstantIndex),
    PutField(ConstantIndex),
    Invoke(InvokeType, ConstantIndex),
    InvokeDynamic(ConstantIndex),
    New(ConstantIndex),
    NewArray(BaseType),
    ANewArray(ConstantIndex),
    ArrayLength,
    CheckCast(ConstantIndex),
    InstanceOf(ConstantIndex),
    MonitorEnter,
    MonitorExit,
    MultiANewArray(ConstantIndex, u8),
}

impl Instruction {
    /// Can control reach the next instruction in the code array?
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Instruction::Goto(_)
                | Instruction::Jsr(_)
                | Instruction::Ret(_)
                | Instruction::TableSwitch { .. }
                | Instruction::LookupSwitch { .. }
                | Instruction::Return(_)
                | Instruction::AThrow
        )
    }
}

/// Cursor over the operand bytes of one instruction
struct Operands<'a> {
    code: &'a [u8],

    /// Offset of the opcode
    ip: usize,

    /// Offset of the next unread byte
    position: usize,
}

impl<'a> Operands<'a> {
    fn bytes<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let end = self.position + N;
        let slice = self
            .code
            .get(self.position..end)
            .ok_or(Error::TruncatedInstruction { ip: self.ip })?;
        let mut bytes = [0; N];
        bytes.copy_from_slice(slice);
        self.position = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        self.bytes::<1>().map(|[b]| b)
    }

    fn i8(&mut self) -> Result<i8, Error> {
        self.u8().map(|b| b as i8)
    }

    fn u16(&mut self) -> Result<u16, Error> {
        self.bytes::<2>().map(u16::from_be_bytes)
    }

    fn i16(&mut self) -> Result<i16, Error> {
        self.bytes::<2>().map(i16::from_be_bytes)
    }

    fn i32(&mut self) -> Result<i32, Error> {
        self.bytes::<4>().map(i32::from_be_bytes)
    }

    fn constant(&mut self) -> Result<ConstantIndex, Error> {
        self.u16().map(ConstantIndex)
    }

    /// Turn a relative branch offset into an absolute target inside the code array
    fn target(&self, offset: i64) -> Result<usize, Error> {
        let target = self.ip as i64 + offset;
        if target < 0 || target >= self.code.len() as i64 {
            Err(Error::BadBranchTarget {
                ip: self.ip,
                target,
            })
        } else {
            Ok(target as usize)
        }
    }

    fn branch(&mut self) -> Result<usize, Error> {
        let offset = self.i16()?;
        self.target(offset as i64)
    }

    fn wide_branch(&mut self) -> Result<usize, Error> {
        let offset = self.i32()?;
        self.target(offset as i64)
    }

    /// Skip the 0-3 padding bytes that align switch operands to a multiple of four
    fn align(&mut self) -> Result<(), Error> {
        let aligned = (self.position + 3) & !3;
        if aligned > self.code.len() {
            return Err(Error::TruncatedInstruction { ip: self.ip });
        }
        self.position = aligned;
        Ok(())
    }
}

const LOAD_KINDS: [ValueKind; 5] = [
    ValueKind::Int,
    ValueKind::Long,
    ValueKind::Float,
    ValueKind::Double,
    ValueKind::Object,
];

const ARRAY_KINDS: [ArrayKind; 8] = [
    ArrayKind::Int,
    ArrayKind::Long,
    ArrayKind::Float,
    ArrayKind::Double,
    ArrayKind::Object,
    ArrayKind::Byte,
    ArrayKind::Char,
    ArrayKind::Short,
];

const NUMERIC_KINDS: [ValueKind; 4] = [
    ValueKind::Int,
    ValueKind::Long,
    ValueKind::Float,
    ValueKind::Double,
];

const ORD_COMPARISONS: [OrdComparison; 6] = [
    OrdComparison::EQ,
    OrdComparison::NE,
    OrdComparison::LT,
    OrdComparison::GE,
    OrdComparison::GT,
    OrdComparison::LE,
];

/// Decode the instruction at `ip`, returning it along with the offset of the next instruction
pub fn decode(code: &[u8], ip: usize) -> Result<(Instruction, usize), Error> {
    use Instruction::*;

    let opcode = *code.get(ip).ok_or(Error::TruncatedInstruction { ip })?;
    let mut operands = Operands {
        code,
        ip,
        position: ip + 1,
    };
    let unknown = || Error::UnknownOpcode { ip, opcode };

    let insn = match opcode {
        0x00 => Nop,
        0x01 => AConstNull,
        0x02..=0x08 => IConst(opcode as i32 - 0x03),
        0x09..=0x0a => LConst((opcode - 0x09) as i64),
        0x0b..=0x0d => FConst((opcode - 0x0b) as f32),
        0x0e..=0x0f => DConst((opcode - 0x0e) as f64),
        0x10 => IConst(operands.i8()? as i32),
        0x11 => IConst(operands.i16()? as i32),
        0x12 => Ldc(ConstantIndex(operands.u8()? as u16)),
        0x13 => Ldc(operands.constant()?),
        0x14 => Ldc2(operands.constant()?),
        0x15..=0x19 => Load(LOAD_KINDS[(opcode - 0x15) as usize], operands.u8()? as u16),
        0x1a..=0x2d => {
            let n = opcode - 0x1a;
            Load(LOAD_KINDS[(n / 4) as usize], (n % 4) as u16)
        }
        0x2e..=0x35 => ArrayLoad(ARRAY_KINDS[(opcode - 0x2e) as usize]),
        0x36..=0x3a => Store(LOAD_KINDS[(opcode - 0x36) as usize], operands.u8()? as u16),
        0x3b..=0x4e => {
            let n = opcode - 0x3b;
            Store(LOAD_KINDS[(n / 4) as usize], (n % 4) as u16)
        }
        0x4f..=0x56 => ArrayStore(ARRAY_KINDS[(opcode - 0x4f) as usize]),
        0x57 => Pop,
        0x58 => Pop2,
        0x59 => Dup,
        0x5a => DupX1,
        0x5b => DupX2,
        0x5c => Dup2,
        0x5d => Dup2X1,
        0x5e => Dup2X2,
        0x5f => Swap,
        0x60..=0x73 => {
            let n = opcode - 0x60;
            let op = [
                BinaryOp::Add,
                BinaryOp::Sub,
                BinaryOp::Mul,
                BinaryOp::Div,
                BinaryOp::Rem,
            ][(n / 4) as usize];
            Binary(NUMERIC_KINDS[(n % 4) as usize], op)
        }
        0x74..=0x77 => Neg(NUMERIC_KINDS[(opcode - 0x74) as usize]),
        0x78..=0x83 => {
            let n = opcode - 0x78;
            let op = [
                BinaryOp::Shift(ShiftType::Left),
                BinaryOp::Shift(ShiftType::ArithmeticRight),
                BinaryOp::Shift(ShiftType::LogicalRight),
                BinaryOp::And,
                BinaryOp::Or,
                BinaryOp::Xor,
            ][(n / 2) as usize];
            let kind = if n % 2 == 0 {
                ValueKind::Int
            } else {
                ValueKind::Long
            };
            Binary(kind, op)
        }
        0x84 => IInc(operands.u8()? as u16, operands.i8()? as i16),
        0x85..=0x90 => {
            // Each source kind converts to the other three, in `NUMERIC_KINDS` order
            let n = (opcode - 0x85) as usize;
            let from = NUMERIC_KINDS[n / 3];
            let to = NUMERIC_KINDS
                .iter()
                .copied()
                .filter(|kind| *kind != from)
                .nth(n % 3)
                .ok_or_else(unknown)?;
            Convert(from, to)
        }
        0x91 => Truncate(BaseType::Byte),
        0x92 => Truncate(BaseType::Char),
        0x93 => Truncate(BaseType::Short),
        0x94 => LCmp,
        0x95 => FCmp(CompareMode::L),
        0x96 => FCmp(CompareMode::G),
        0x97 => DCmp(CompareMode::L),
        0x98 => DCmp(CompareMode::G),
        0x99..=0x9e => If(ORD_COMPARISONS[(opcode - 0x99) as usize], operands.branch()?),
        0x9f..=0xa4 => IfICmp(ORD_COMPARISONS[(opcode - 0x9f) as usize], operands.branch()?),
        0xa5 => IfACmp(EqComparison::EQ, operands.branch()?),
        0xa6 => IfACmp(EqComparison::NE, operands.branch()?),
        0xa7 => Goto(operands.branch()?),
        0xa8 => Jsr(operands.branch()?),
        0xa9 => Ret(operands.u8()? as u16),
        0xaa => {
            operands.align()?;
            let default = operands.wide_branch()?;
            let low = operands.i32()?;
            let high = operands.i32()?;
            if high < low {
                return Err(Error::TruncatedInstruction { ip });
            }
            let count = (high as i64 - low as i64 + 1) as usize;
            let targets = (0..count)
                .map(|_| operands.wide_branch())
                .collect::<Result<Vec<_>, _>>()?;
            TableSwitch {
                default,
                low,
                targets,
            }
        }
        0xab => {
            operands.align()?;
            let default = operands.wide_branch()?;
            let count = operands.i32()?;
            if count < 0 {
                return Err(Error::TruncatedInstruction { ip });
            }
            let targets = (0..count)
                .map(|_| -> Result<(i32, usize), Error> {
                    Ok((operands.i32()?, operands.wide_branch()?))
                })
                .collect::<Result<Vec<_>, _>>()?;
            LookupSwitch { default, targets }
        }
        0xac..=0xb0 => Return(Some(LOAD_KINDS[(opcode - 0xac) as usize])),
        0xb1 => Return(None),
        0xb2 => GetStatic(operands.constant()?),
        0xb3 => PutStatic(operands.constant()?),
        0xb4 => GetField(operands.constant()?),
        0xb5 => PutField(operands.constant()?),
        0xb6 => Invoke(InvokeType::Virtual, operands.constant()?),
        0xb7 => Invoke(InvokeType::Special, operands.constant()?),
        0xb8 => Invoke(InvokeType::Static, operands.constant()?),
        0xb9 => {
            let index = operands.constant()?;
            let _count = operands.u8()?;
            let _zero = operands.u8()?;
            Invoke(InvokeType::Interface, index)
        }
        0xba => {
            let index = operands.constant()?;
            let _zeros = operands.u16()?;
            InvokeDynamic(index)
        }
        0xbb => New(operands.constant()?),
        0xbc => {
            let atype = operands.u8()?;
            let base_type = BaseType::from_array_type_code(atype)
                .ok_or(Error::BadNewArrayType { ip, atype })?;
            NewArray(base_type)
        }
        0xbd => ANewArray(operands.constant()?),
        0xbe => ArrayLength,
        0xbf => AThrow,
        0xc0 => CheckCast(operands.constant()?),
        0xc1 => InstanceOf(operands.constant()?),
        0xc2 => MonitorEnter,
        0xc3 => MonitorExit,
        0xc4 => {
            let modified = operands.u8()?;
            match modified {
                0x15..=0x19 => Load(LOAD_KINDS[(modified - 0x15) as usize], operands.u16()?),
                0x36..=0x3a => Store(LOAD_KINDS[(modified - 0x36) as usize], operands.u16()?),
                0xa9 => Ret(operands.u16()?),
                0x84 => IInc(operands.u16()?, operands.i16()?),
                _ => {
                    return Err(Error::UnknownOpcode {
                        ip,
                        opcode: modified,
                    })
                }
            }
        }
        0xc5 => MultiANewArray(operands.constant()?, operands.u8()?),
        0xc6 => IfNull(EqComparison::EQ, operands.branch()?),
        0xc7 => IfNull(EqComparison::NE, operands.branch()?),
        0xc8 => Goto(operands.wide_branch()?),
        0xc9 => Jsr(operands.wide_branch()?),
        _ => return Err(unknown()),
    };

    Ok((insn, operands.position))
}

/// Decode a whole code array, in order
pub fn decode_all(code: &[u8]) -> Result<Vec<(usize, Instruction)>, Error> {
    let mut decoded = vec![];
    let mut ip = 0;
    while ip < code.len() {
        let (insn, next_ip) = decode(code, ip)?;
        decoded.push((ip, insn));
        ip = next_ip;
    }
    Ok(decoded)
}

/// Possible bit shifts
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum ShiftType {
    Left,
    LogicalRight,
    ArithmeticRight,
}

/// Comparison modes for floating point
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum CompareMode {
    /// -1 on NaN
    L,

    /// 1 on NaN
    G,
}

/// Binary comparison operators available for `int` branches
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum OrdComparison {
    EQ,
    GE,
    GT,
    LE,
    LT,
    NE,
}

impl Not for OrdComparison {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            OrdComparison::EQ => OrdComparison::NE,
            OrdComparison::GE => OrdComparison::LT,
            OrdComparison::GT => OrdComparison::LE,
            OrdComparison::LE => OrdComparison::GT,
            OrdComparison::LT => OrdComparison::GE,
            OrdComparison::NE => OrdComparison::EQ,
        }
    }
}

/// Equality/inequality comparison operators
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum EqComparison {
    EQ,
    NE,
}

impl Not for EqComparison {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            EqComparison::EQ => EqComparison::NE,
            EqComparison::NE => EqComparison::EQ,
        }
    }
}

/// Type of method to invoke
///
/// Note: `InvokeDynamic` is kept separate because the constant argument it expects is not to a
/// `Constant::MethodRef`.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum InvokeType {
    Virtual,
    Special,
    Static,
    Interface,
}

#[cfg(test)]
mod test {
    use super::*;
    use Instruction::*;

    #[test]
    fn short_forms() {
        let code = [0x02, 0x08, 0x1b, 0x2d, 0x4b, 0x0a, 0x0d, 0x10, 0xff, 0x11, 0x01, 0x00];
        let decoded: Vec<Instruction> = decode_all(&code)
            .unwrap()
            .into_iter()
            .map(|(_, insn)| insn)
            .collect();
        assert_eq!(
            decoded,
            vec![
                IConst(-1),
                IConst(5),
                Load(ValueKind::Int, 1),
                Load(ValueKind::Object, 3),
                Store(ValueKind::Object, 0),
                LConst(1),
                FConst(2.0),
                IConst(-1),
                IConst(256),
            ]
        );
    }

    #[test]
    fn arithmetic_families() {
        assert_eq!(decode(&[0x6d], 0).unwrap().0, Binary(ValueKind::Long, BinaryOp::Div));
        assert_eq!(
            decode(&[0x7d], 0).unwrap().0,
            Binary(ValueKind::Long, BinaryOp::Shift(ShiftType::LogicalRight))
        );
        assert_eq!(decode(&[0x83], 0).unwrap().0, Binary(ValueKind::Long, BinaryOp::Xor));
        assert_eq!(
            decode(&[0x85], 0).unwrap().0,
            Convert(ValueKind::Int, ValueKind::Long)
        );
        assert_eq!(
            decode(&[0x8b], 0).unwrap().0,
            Convert(ValueKind::Float, ValueKind::Int)
        );
        assert_eq!(
            decode(&[0x90], 0).unwrap().0,
            Convert(ValueKind::Double, ValueKind::Float)
        );
    }

    #[test]
    fn branches_are_absolute() {
        // 0: iload_0; 1: ifle +6 (-> 7); 4: goto -4 (-> 0); 7: return
        let code = [0x1a, 0x9e, 0x00, 0x06, 0xa7, 0xff, 0xfc, 0xb1];
        let decoded = decode_all(&code).unwrap();
        assert_eq!(decoded[1], (1, If(OrdComparison::LE, 7)));
        assert_eq!(decoded[2], (4, Goto(0)));
        assert!(matches!(
            decode(&[0xa7, 0x00, 0x10], 0),
            Err(Error::BadBranchTarget { ip: 0, target: 16 })
        ));
    }

    #[test]
    fn wide_and_switches() {
        let wide = [0xc4, 0x84, 0x01, 0x00, 0xff, 0xfe];
        assert_eq!(decode(&wide, 0).unwrap(), (IInc(256, -2), 6));

        // 0: nop; 1: tableswitch (pad 2) default +23 low 0 high 1 targets +23 +23; 24: return
        let mut code = vec![0x00, 0xaa, 0x00, 0x00];
        for word in [23i32, 0, 1, 23, 23] {
            code.extend_from_slice(&word.to_be_bytes());
        }
        code.push(0xb1);
        let (insn, next) = decode(&code, 1).unwrap();
        assert_eq!(next, 24);
        assert_eq!(
            insn,
            TableSwitch {
                default: 24,
                low: 0,
                targets: vec![24, 24],
            }
        );
    }

    #[test]
    fn rejects_unknown_and_truncated() {
        assert!(matches!(
            decode(&[0xca], 0),
            Err(Error::UnknownOpcode { ip: 0, opcode: 0xca })
        ));
        assert!(matches!(
            decode(&[0xfe], 0),
            Err(Error::UnknownOpcode { .. })
        ));
        assert!(matches!(
            decode(&[0x00, 0x11, 0x01], 1),
            Err(Error::TruncatedInstruction { ip: 1 })
        ));
        assert!(matches!(
            decode(&[0xbc, 0x03], 0),
            Err(Error::BadNewArrayType { ip: 0, atype: 3 })
        ));
    }
}
