//! Factory-free listing of a snapshot stream.

use crate::bytecode::Bytecode;
use crate::bytecode::HEADER_LEN;
use crate::codec::BinaryDecoder;
use crate::error::DecodeError;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Operand {
  Reg(u64),
  Method(u64),
  Int(i32),
  Long(i64),
  Double(f64),
  Bool(bool),
  Str(String),
  /// Absolute stream offset of an extracted batch.
  Position(i32),
}

impl fmt::Display for Operand {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Operand::Reg(r) => write!(f, "r{r}"),
      Operand::Method(m) => write!(f, "#{m}"),
      Operand::Int(v) => write!(f, "{v}"),
      Operand::Long(v) => write!(f, "{v}L"),
      Operand::Double(v) => write!(f, "{v:?}"),
      Operand::Bool(v) => write!(f, "{v}"),
      Operand::Str(v) => write!(f, "{v:?}"),
      Operand::Position(p) => write!(f, "@{p}"),
    }
  }
}

#[derive(Clone, Debug, Serialize)]
pub struct DisasmRecord {
  pub offset: usize,
  pub opcode: Bytecode,
  pub operands: Vec<Operand>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DisasmMethod {
  pub offset: usize,
  pub registers: u64,
  pub records: Vec<DisasmRecord>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Disassembly {
  pub magic: i32,
  pub checksum: i32,
  pub source_len: i32,
  pub source_hash: i32,
  pub methods: Vec<DisasmMethod>,
}

impl Disassembly {
  pub fn records(&self) -> impl Iterator<Item = &DisasmRecord> {
    self.methods.iter().flat_map(|m| m.records.iter())
  }

  pub fn count(&self, opcode: Bytecode) -> usize {
    self.records().filter(|r| r.opcode == opcode).count()
  }
}

impl fmt::Display for Disassembly {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(
      f,
      "magic {:#010x} checksum {:#010x} source {} bytes hash {:#010x}",
      self.magic, self.checksum, self.source_len, self.source_hash
    )?;
    for method in &self.methods {
      writeln!(f, "@{}: {} registers", method.offset, method.registers)?;
      for record in &method.records {
        write!(f, "  {:>6}  {}", record.offset, record.opcode)?;
        for operand in &record.operands {
          write!(f, " {operand}")?;
        }
        writeln!(f)?;
      }
    }
    Ok(())
  }
}

struct Walker {
  dec: BinaryDecoder,
  operands: Vec<Operand>,
}

impl Walker {
  fn reg(&mut self) -> Result<(), DecodeError> {
    let r = self.dec.get_uint()?;
    self.operands.push(Operand::Reg(r));
    Ok(())
  }

  fn int(&mut self) -> Result<(), DecodeError> {
    let v = self.dec.get_int()?;
    self.operands.push(Operand::Int(v));
    Ok(())
  }

  fn bool(&mut self) -> Result<(), DecodeError> {
    let v = self.dec.get_bool()?;
    self.operands.push(Operand::Bool(v));
    Ok(())
  }

  fn str(&mut self) -> Result<(), DecodeError> {
    let v = self.dec.get_utf8()?;
    self.operands.push(Operand::Str(v));
    Ok(())
  }

  fn position(&mut self) -> Result<(), DecodeError> {
    let p = self.dec.get_i32()?;
    self.operands.push(Operand::Position(p));
    Ok(())
  }

  /// Count followed by that many registers.
  fn regs(&mut self) -> Result<(), DecodeError> {
    let n = self.dec.get_int()?;
    self.operands.push(Operand::Int(n));
    let n = usize::try_from(n).map_err(|_| DecodeError::Malformed("negative count"))?;
    if n > self.dec.remaining() {
      return Err(DecodeError::UnexpectedEnd);
    };
    (0..n).try_for_each(|_| self.reg())
  }

  fn operands(&mut self, op: Bytecode) -> Result<(), DecodeError> {
    match op {
      Bytecode::Nop => {}
      Bytecode::Node => {
        let m = self.dec.get_uint()?;
        self.operands.push(Operand::Method(m));
        self.regs()?;
        self.reg()?;
      }
      Bytecode::Return | Bytecode::FrameDescriptor => self.reg()?,
      Bytecode::LdcInt | Bytecode::LdcSingleton | Bytecode::LdArg | Bytecode::JumpTarget => {
        self.int()?;
        self.reg()?;
      }
      Bytecode::LdcLong => {
        let v = self.dec.get_long()?;
        self.operands.push(Operand::Long(v));
        self.reg()?;
      }
      Bytecode::LdcBoolean => {
        self.bool()?;
        self.reg()?;
      }
      Bytecode::LdcDouble => {
        let v = self.dec.get_double()?;
        self.operands.push(Operand::Double(v));
        self.reg()?;
      }
      Bytecode::LdcEnum => {
        self.int()?;
        self.int()?;
        self.reg()?;
      }
      Bytecode::LdcString => {
        self.str()?;
        self.reg()?;
      }
      Bytecode::Mov | Bytecode::CallTarget => {
        self.reg()?;
        self.reg()?;
      }
      Bytecode::CollectArray => {
        self.int()?;
        self.regs()?;
        self.reg()?;
      }
      Bytecode::CollectList => {
        self.regs()?;
        self.reg()?;
      }
      Bytecode::FrameSlot => {
        self.reg()?;
        self.reg()?;
        self.int()?;
        self.bool()?;
        self.reg()?;
      }
      Bytecode::SourceSection => {
        self.reg()?;
        self.int()?;
        self.int()?;
        self.reg()?;
      }
      Bytecode::FunctionData => {
        self.reg()?;
        self.int()?;
        self.str()?;
        let flags = self.dec.get_i32()?;
        self.operands.push(Operand::Int(flags));
        self.reg()?;
      }
      Bytecode::FunctionDataNameFixup => {
        self.reg()?;
        self.str()?;
      }
      Bytecode::CallExtracted => {
        self.position()?;
        self.regs()?;
        self.reg()?;
      }
      Bytecode::CallExtractedLazy => {
        self.position()?;
        self.reg()?;
        self.regs()?;
        self.reg()?;
      }
      Bytecode::NodeSourceSectionFixup => {
        self.reg()?;
        self.reg()?;
        self.int()?;
        self.int()?;
      }
      Bytecode::NodeTagsFixup => {
        self.reg()?;
        for _ in 0..4 {
          self.bool()?;
        }
      }
    };
    Ok(())
  }
}

/// Lists every batch of `bytes`. The header is reported as is; nothing is
/// checked against a dispatch table or source.
pub fn disassemble(bytes: &[u8]) -> Result<Disassembly, DecodeError> {
  let mut dec = BinaryDecoder::new(Arc::from(bytes));
  let magic = dec.get_i32()?;
  let checksum = dec.get_i32()?;
  let source_len = dec.get_i32()?;
  let source_hash = dec.get_i32()?;
  debug_assert_eq!(dec.position(), HEADER_LEN);
  let mut walker = Walker {
    dec,
    operands: Vec::new(),
  };
  let mut methods = Vec::new();
  while walker.dec.has_remaining() {
    let offset = walker.dec.position();
    let registers = walker.dec.get_uint()?;
    let mut records = Vec::new();
    loop {
      if !walker.dec.has_remaining() {
        return Err(DecodeError::MissingReturn);
      };
      let record_offset = walker.dec.position();
      let raw = walker.dec.get_uint()?;
      let opcode = Bytecode::from_u64(raw).ok_or(DecodeError::UnknownOpcode(raw))?;
      walker.operands(opcode)?;
      records.push(DisasmRecord {
        offset: record_offset,
        opcode,
        operands: std::mem::take(&mut walker.operands),
      });
      if opcode == Bytecode::Return {
        break;
      };
    }
    methods.push(DisasmMethod {
      offset,
      registers,
      records,
    });
  }
  Ok(Disassembly {
    magic,
    checksum,
    source_len,
    source_hash,
    methods,
  })
}
