//! Opcode definitions.
//!
//! Bytecode is a byte stream: one opcode byte followed by little-endian
//! operands. Jump operands are `i16` offsets relative to the position just
//! after the operand.

use strum::FromRepr;

/// All opcodes. `#[repr(u8)]` discriminants are the wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum Opcode {
    Nop,

    // Stack manipulation
    Pop,
    Dup,
    Rot2,

    // Constants
    /// operand: u16 constant-pool index
    LoadConst,
    LoadNone,
    LoadTrue,
    LoadFalse,
    /// operand: i8 literal
    LoadSmallInt,

    // Locals (slot-addressed)
    /// operand: u8 local slot
    LoadFast,
    StoreFast,
    DeleteFast,

    // Names (locals-by-name -> closure -> globals -> builtins)
    /// operand: u16 name-pool index
    LoadName,
    StoreName,
    DeleteName,

    // Globals (module attribute dictionary)
    LoadGlobal,
    StoreGlobal,
    DeleteGlobal,

    // Attributes
    /// operand: u16 name-pool index; stack: [obj] -> [value]
    LoadAttr,
    /// stack: [value, obj] -> []
    StoreAttr,
    /// stack: [obj] -> []
    DeleteAttr,

    // Subscripts
    /// stack: [obj, key] -> [value]
    LoadSubscr,
    /// stack: [value, obj, key] -> []
    StoreSubscr,
    /// stack: [obj, key] -> []
    DeleteSubscr,

    // Binary arithmetic (dispatched through magic slots with reflected
    // fallback)
    BinaryAdd,
    BinarySub,
    BinaryMul,
    BinaryTrueDiv,
    BinaryFloorDiv,
    BinaryMod,
    BinaryPow,
    BinaryAnd,
    BinaryOr,
    BinaryXor,
    BinaryLShift,
    BinaryRShift,

    // Comparison
    CompareEq,
    CompareNe,
    CompareLt,
    CompareLe,
    CompareGt,
    CompareGe,
    /// operand: u8 (1 = `is not`)
    IsOp,
    /// operand: u8 (1 = `not in`)
    ContainsOp,

    // Unary
    UnaryNeg,
    UnaryNot,
    UnaryInvert,

    // Control flow
    /// operand: i16 relative offset
    Jump,
    PopJumpIfFalse,
    PopJumpIfTrue,
    /// Block-cleaning jump used by `break`/`continue`: exits structured
    /// blocks between here and the target before jumping.
    JumpBreak,
    /// stack: [v] -> [iter(v)]
    GetIter,
    /// operand: i16 offset to the loop exit. Pushes the next value, or on
    /// exhaustion pops the iterator and jumps.
    ForIter,

    // Exceptions
    /// stack: [exc-or-class] -> (unwinding)
    Raise,
    /// Re-raise the current exception (bare `raise`, fall-through handler).
    Reraise,
    /// operand: none; stack: [exc, cls] -> [exc, bool]
    ExcMatch,
    /// Handler epilogue: clears the current exception; stack: [exc] -> []
    PopException,

    ReturnValue,
    YieldValue,

    // Context managers
    /// stack: [ctx] -> [ctx, ctx.__enter__()]
    WithEnter,
    /// stack: [ctx] -> []; calls ctx.__exit__()
    WithExit,

    // Calls
    /// operands: u8 argc, u8 kwargc.
    /// stack: [callable, arg*, (key, value)*] -> [result]
    Call,

    // Builders
    /// operand: u8 count; stack: [seq] -> [item*]
    UnpackSequence,
    /// operand: u16 count
    BuildList,
    BuildTuple,
    /// operand: u16 pair count
    BuildDict,
    /// operand: u8 (2 = start/stop, 3 = start/stop/step)
    BuildSlice,
    /// operands: u16 decl index, u8 default count
    MakeFunction,
    /// operands: u16 name-pool index, u8 has_base flag.
    /// stack: [base?, methods-dict] -> [type]
    BuildClass,
    /// operand: u16 name-pool index; pushes the imported module
    ImportName,
}

impl Opcode {
    /// Fixed stack effect, when one exists. Opcodes whose effect depends on
    /// an operand (calls, builders) return `None` and are handled by the
    /// builder case-by-case.
    #[must_use]
    pub fn stack_effect(self) -> Option<i16> {
        match self {
            Self::Nop | Self::Rot2 | Self::DeleteFast | Self::DeleteName | Self::DeleteGlobal | Self::Jump => Some(0),
            Self::LoadConst
            | Self::LoadNone
            | Self::LoadTrue
            | Self::LoadFalse
            | Self::LoadSmallInt
            | Self::LoadFast
            | Self::LoadName
            | Self::LoadGlobal
            | Self::Dup
            | Self::ImportName => Some(1),
            Self::Pop
            | Self::StoreFast
            | Self::StoreName
            | Self::StoreGlobal
            | Self::PopJumpIfFalse
            | Self::PopJumpIfTrue
            | Self::Raise
            | Self::ReturnValue
            | Self::WithExit
            | Self::PopException => Some(-1),
            Self::LoadAttr | Self::GetIter | Self::UnaryNeg | Self::UnaryNot | Self::UnaryInvert => Some(0),
            Self::StoreAttr => Some(-2),
            Self::DeleteAttr => Some(-1),
            Self::LoadSubscr => Some(-1),
            Self::StoreSubscr => Some(-3),
            Self::DeleteSubscr => Some(-2),
            Self::BinaryAdd
            | Self::BinarySub
            | Self::BinaryMul
            | Self::BinaryTrueDiv
            | Self::BinaryFloorDiv
            | Self::BinaryMod
            | Self::BinaryPow
            | Self::BinaryAnd
            | Self::BinaryOr
            | Self::BinaryXor
            | Self::BinaryLShift
            | Self::BinaryRShift
            | Self::CompareEq
            | Self::CompareNe
            | Self::CompareLt
            | Self::CompareLe
            | Self::CompareGt
            | Self::CompareGe
            | Self::IsOp
            | Self::ContainsOp => Some(-1),
            Self::ExcMatch => Some(0),
            Self::ForIter => Some(1),
            Self::JumpBreak => Some(0),
            Self::YieldValue => Some(-1),
            Self::WithEnter => Some(1),
            Self::Reraise => Some(0),
            // Operand-dependent effects
            Self::Call
            | Self::UnpackSequence
            | Self::BuildList
            | Self::BuildTuple
            | Self::BuildDict
            | Self::BuildSlice
            | Self::MakeFunction
            | Self::BuildClass => None,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Self::from_repr(byte).ok_or(byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_encoding() {
        assert_eq!(Opcode::try_from(Opcode::Call as u8), Ok(Opcode::Call));
        assert_eq!(Opcode::try_from(Opcode::Nop as u8), Ok(Opcode::Nop));
        assert!(Opcode::try_from(0xFF).is_err());
    }
}
