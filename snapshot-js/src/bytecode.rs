use serde::Serialize;
use std::fmt;

/// Magic number at the start of every snapshot stream.
pub const MAGIC: i32 = 0x4A53_4E50;

/// Magic, table checksum, source length and source hash, each a fixed `i32`.
pub const HEADER_LEN: usize = 16;

/// Register 0 is the discard register; allocated registers start here.
pub const FIRST_REG: u32 = 1;

/// Reserved `LdArg` index binding the current execution context.
pub const ARG_CONTEXT: i32 = -1;
/// Reserved `LdArg` index binding the current source.
pub const ARG_SOURCE: i32 = -2;

/// Opcodes of the replay instruction set. The discriminant is the on-wire value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Bytecode {
  Nop,
  Node,
  Return,
  LdcInt,
  LdcLong,
  LdcBoolean,
  LdcDouble,
  LdcEnum,
  LdcString,
  LdcSingleton,
  LdArg,
  Mov,
  CollectArray,
  CollectList,
  CallTarget,
  FrameDescriptor,
  FrameSlot,
  SourceSection,
  FunctionData,
  FunctionDataNameFixup,
  JumpTarget,
  CallExtracted,
  CallExtractedLazy,
  NodeSourceSectionFixup,
  NodeTagsFixup,
}

impl Bytecode {
  pub const ALL: [Bytecode; 25] = [
    Bytecode::Nop,
    Bytecode::Node,
    Bytecode::Return,
    Bytecode::LdcInt,
    Bytecode::LdcLong,
    Bytecode::LdcBoolean,
    Bytecode::LdcDouble,
    Bytecode::LdcEnum,
    Bytecode::LdcString,
    Bytecode::LdcSingleton,
    Bytecode::LdArg,
    Bytecode::Mov,
    Bytecode::CollectArray,
    Bytecode::CollectList,
    Bytecode::CallTarget,
    Bytecode::FrameDescriptor,
    Bytecode::FrameSlot,
    Bytecode::SourceSection,
    Bytecode::FunctionData,
    Bytecode::FunctionDataNameFixup,
    Bytecode::JumpTarget,
    Bytecode::CallExtracted,
    Bytecode::CallExtractedLazy,
    Bytecode::NodeSourceSectionFixup,
    Bytecode::NodeTagsFixup,
  ];

  pub fn from_u64(raw: u64) -> Option<Bytecode> {
    usize::try_from(raw)
      .ok()
      .and_then(|i| Self::ALL.get(i))
      .copied()
  }

  pub fn code(self) -> u64 {
    self as u64
  }

  pub fn mnemonic(self) -> &'static str {
    match self {
      Bytecode::Nop => "NOP",
      Bytecode::Node => "NODE",
      Bytecode::Return => "RETURN",
      Bytecode::LdcInt => "LDC_INT",
      Bytecode::LdcLong => "LDC_LONG",
      Bytecode::LdcBoolean => "LDC_BOOLEAN",
      Bytecode::LdcDouble => "LDC_DOUBLE",
      Bytecode::LdcEnum => "LDC_ENUM",
      Bytecode::LdcString => "LDC_STRING",
      Bytecode::LdcSingleton => "LDC_SINGLETON",
      Bytecode::LdArg => "LD_ARG",
      Bytecode::Mov => "MOV",
      Bytecode::CollectArray => "COLLECT_ARRAY",
      Bytecode::CollectList => "COLLECT_LIST",
      Bytecode::CallTarget => "CALL_TARGET",
      Bytecode::FrameDescriptor => "FRAME_DESCRIPTOR",
      Bytecode::FrameSlot => "FRAME_SLOT",
      Bytecode::SourceSection => "SOURCE_SECTION",
      Bytecode::FunctionData => "FUNCTION_DATA",
      Bytecode::FunctionDataNameFixup => "FUNCTION_DATA_NAME_FIXUP",
      Bytecode::JumpTarget => "JUMP_TARGET",
      Bytecode::CallExtracted => "CALL_EXTRACTED",
      Bytecode::CallExtractedLazy => "CALL_EXTRACTED_LAZY",
      Bytecode::NodeSourceSectionFixup => "NODE_SOURCE_SECTION_FIXUP",
      Bytecode::NodeTagsFixup => "NODE_TAGS_FIXUP",
    }
  }
}

impl fmt::Display for Bytecode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.mnemonic())
  }
}
