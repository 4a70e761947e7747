pub mod text;

use crate::bytecode::Bytecode;
use crate::bytecode::ARG_CONTEXT;
use crate::bytecode::ARG_SOURCE;
use crate::bytecode::FIRST_REG;
use crate::bytecode::MAGIC;
use crate::codec::BinaryEncoder;
use crate::codec::PLACEHOLDER;
use crate::error::EncodeError;
use crate::factory::DispatchTable;
use crate::opt::InstBatch;
use crate::record::Constant;
use crate::record::Inst;
use crate::record::InstKind;
use crate::runtime::Source;
use crate::runtime::TextRange;
use crate::value::Singleton;
use crate::value::ValueId;
use crate::value::ValueType;
use ahash::HashMap;
use tracing::debug;
use tracing::trace;

/// Wire pair of an optional range; unavailable ranges are `(-1, -1)`.
pub(crate) fn range_to_wire(range: Option<TextRange>) -> (i32, i32) {
  match range {
    Some(r) => (r.start as i32, r.len as i32),
    None => (-1, -1),
  }
}

/// Serialises batches into a snapshot stream.
///
/// Calls of extracted batches are written with a placeholder position that is
/// patched once the callee's batch is emitted. Registers are mapped per batch
/// in order of first mention, starting after the discard register.
pub struct NodeEncoder<'a> {
  table: &'a DispatchTable,
  out: BinaryEncoder,
  pending: HashMap<String, Vec<usize>>,
  resolved: HashMap<String, i32>,
  regs: HashMap<ValueId, u32>,
  next_reg: u32,
  limit: u32,
  batch: String,
}

impl<'a> NodeEncoder<'a> {
  /// Starts a stream for a recording of `source`, writing the header.
  pub fn new(table: &'a DispatchTable, source: &Source) -> Self {
    let mut out = BinaryEncoder::new();
    out.put_i32(MAGIC);
    out.put_i32(table.checksum());
    out.put_i32(source.len() as i32);
    out.put_i32(source.hash() as i32);
    Self {
      table,
      out,
      pending: HashMap::default(),
      resolved: HashMap::default(),
      regs: HashMap::default(),
      next_reg: FIRST_REG,
      limit: FIRST_REG,
      batch: String::new(),
    }
  }

  fn position(&self) -> Result<i32, EncodeError> {
    i32::try_from(self.out.position())
      .map_err(|_| EncodeError::Internal("stream exceeds 2 GiB".to_string()))
  }

  fn mark(&mut self, name: &str) -> Result<(), EncodeError> {
    if self.resolved.contains_key(name) {
      return Err(EncodeError::AlreadyResolved(name.to_string()));
    };
    let mark = self.position()?;
    self.resolved.insert(name.to_string(), mark);
    match self.pending.remove(name) {
      Some(slots) => {
        for slot in slots {
          trace!(slot, mark, name, "patching call position");
          if !self.out.patch_i32(slot, mark) {
            return Err(EncodeError::Internal(format!(
              "patch slot {slot} of `{name}` was overwritten"
            )));
          };
        }
      }
      None => debug!(name, mark, "nothing to patch"),
    };
    Ok(())
  }

  fn put_position(&mut self, name: &str) {
    if let Some(&mark) = self.resolved.get(name) {
      self.out.put_i32(mark);
      return;
    };
    self
      .pending
      .entry(name.to_string())
      .or_default()
      .push(self.out.position());
    self.out.put_i32(PLACEHOLDER);
  }

  fn put_op(&mut self, op: Bytecode) {
    self.out.put_uint(op.code());
  }

  fn put_reg(&mut self, id: ValueId) -> Result<(), EncodeError> {
    let reg = match self.regs.get(&id) {
      Some(&reg) => reg,
      None => {
        let reg = self.next_reg;
        self.next_reg += 1;
        self.regs.insert(id, reg);
        reg
      }
    };
    if reg >= self.limit {
      return Err(EncodeError::RegisterOverflow {
        batch: self.batch.clone(),
        reg,
        limit: self.limit,
      });
    };
    self.out.put_uint(reg as u64);
    Ok(())
  }

  fn put_regs(&mut self, ids: &[ValueId]) -> Result<(), EncodeError> {
    self.out.put_int(ids.len() as i32);
    ids.iter().try_for_each(|&id| self.put_reg(id))
  }

  fn put_dest(&mut self, inst: &Inst) -> Result<(), EncodeError> {
    match inst.id() {
      Some(id) => self.put_reg(id),
      None => {
        self.out.put_uint(0);
        Ok(())
      }
    }
  }

  fn put_class(&mut self, ty: &ValueType) -> Result<(), EncodeError> {
    let index = self
      .table
      .class_index(ty)
      .ok_or_else(|| EncodeError::UnsupportedClass(ty.to_string()))?;
    self.out.put_int(index);
    Ok(())
  }

  fn put_range(&mut self, range: Option<TextRange>) {
    let (index, len) = range_to_wire(range);
    self.out.put_int(index);
    self.out.put_int(len);
  }

  /// Appends one batch: its position mark, register limit, parameter loads and
  /// one record per member.
  pub fn encode_batch(&mut self, batch: &InstBatch) -> Result<(), EncodeError> {
    self.mark(&batch.name)?;
    self.batch = batch.name.clone();
    self.regs.clear();
    self.next_reg = FIRST_REG;
    self.limit = FIRST_REG + batch.value_count() as u32;
    self.out.put_uint(self.limit as u64);
    for (i, param) in batch.params.iter().enumerate() {
      self.put_op(Bytecode::LdArg);
      self.out.put_int(i as i32);
      self.put_reg(param.id)?;
    }
    for inst in &batch.insts {
      self.encode_inst(inst)?;
    }
    trace!(batch = %batch.name, regs = self.next_reg, "batch encoded");
    Ok(())
  }

  fn encode_constant(&mut self, constant: &Constant) -> Result<(), EncodeError> {
    match constant {
      Constant::Int(v) => {
        self.put_op(Bytecode::LdcInt);
        self.out.put_int(*v);
      }
      Constant::Long(v) => {
        self.put_op(Bytecode::LdcLong);
        self.out.put_long(*v);
      }
      Constant::Bool(v) => {
        self.put_op(Bytecode::LdcBoolean);
        self.out.put_bool(*v);
      }
      Constant::Double(v) => {
        self.put_op(Bytecode::LdcDouble);
        self.out.put_double(*v);
      }
      Constant::Str(v) => {
        self.put_op(Bytecode::LdcString);
        self.out.put_utf8(v);
      }
      Constant::Enum { class, ordinal } => {
        self.put_op(Bytecode::LdcEnum);
        self.put_class(&ValueType::Enum(*class))?;
        self.out.put_int(*ordinal as i32);
      }
      Constant::Singleton(s) => {
        self.put_op(Bytecode::LdcSingleton);
        self.out.put_int(s.index());
      }
    };
    Ok(())
  }

  fn encode_inst(&mut self, inst: &Inst) -> Result<(), EncodeError> {
    match inst.kind() {
      InstKind::Const(c) => {
        self.encode_constant(c)?;
        self.put_dest(inst)
      }
      InstKind::Context | InstKind::Source => {
        self.put_op(Bytecode::LdArg);
        self.out.put_int(match inst.kind() {
          InstKind::Context => ARG_CONTEXT,
          _ => ARG_SOURCE,
        });
        self.put_dest(inst)
      }
      InstKind::Placeholder => {
        self.put_op(Bytecode::LdcSingleton);
        self.out.put_int(Singleton::Absent.index());
        self.put_dest(inst)
      }
      InstKind::Invoke {
        method, name, args, ..
      } => {
        if !self.table.method(*method).is_some_and(|m| m.name == *name) {
          return Err(EncodeError::UnknownMethod(*name));
        };
        self.put_op(Bytecode::Node);
        self.out.put_uint(*method as u64);
        self.put_regs(args)?;
        self.put_dest(inst)
      }
      InstKind::Collect { component, items } => {
        match component {
          Some(component) => {
            self.put_op(Bytecode::CollectArray);
            self.put_class(component)?;
          }
          None => self.put_op(Bytecode::CollectList),
        };
        self.put_regs(items)?;
        self.put_dest(inst)
      }
      InstKind::CallTarget { root } => {
        self.put_op(Bytecode::CallTarget);
        self.put_reg(*root)?;
        self.put_dest(inst)
      }
      InstKind::FrameDescriptor => {
        self.put_op(Bytecode::FrameDescriptor);
        self.put_dest(inst)
      }
      InstKind::FrameSlot {
        descriptor,
        identifier,
        flags,
        find_or_add,
      } => {
        self.put_op(Bytecode::FrameSlot);
        self.put_reg(*descriptor)?;
        self.put_reg(*identifier)?;
        self.out.put_int(*flags);
        self.out.put_bool(*find_or_add);
        self.put_dest(inst)
      }
      InstKind::SourceSection { source, range } => {
        self.put_op(Bytecode::SourceSection);
        self.put_reg(*source)?;
        self.put_range(*range);
        self.put_dest(inst)
      }
      InstKind::FunctionData {
        context,
        length,
        name,
        flags,
      } => {
        self.put_op(Bytecode::FunctionData);
        self.put_reg(*context)?;
        self.out.put_int(*length);
        self.out.put_utf8(name);
        self.out.put_i32(*flags);
        self.put_dest(inst)
      }
      InstKind::FunctionDataName { target, name } => {
        self.put_op(Bytecode::FunctionDataNameFixup);
        self.put_reg(*target)?;
        self.out.put_utf8(name);
        Ok(())
      }
      InstKind::JumpTarget(kind) => {
        self.put_op(Bytecode::JumpTarget);
        self.out.put_int(kind.code());
        self.put_dest(inst)
      }
      InstKind::NodeSourceSection {
        target,
        source,
        range,
      } => {
        self.put_op(Bytecode::NodeSourceSectionFixup);
        self.put_reg(*target)?;
        self.put_reg(*source)?;
        self.put_range(*range);
        Ok(())
      }
      InstKind::NodeTags { target, tags } => {
        self.put_op(Bytecode::NodeTagsFixup);
        self.put_reg(*target)?;
        self.out.put_bool(tags.statement);
        self.out.put_bool(tags.call);
        self.out.put_bool(tags.expression);
        self.out.put_bool(tags.root_body);
        Ok(())
      }
      InstKind::Return { value } => {
        self.put_op(Bytecode::Return);
        self.put_reg(*value)
      }
      InstKind::CallExtracted {
        callee,
        args,
        function_data,
      } => {
        match function_data {
          Some(fd) => {
            self.put_op(Bytecode::CallExtractedLazy);
            self.put_position(callee);
            self.put_reg(*fd)?;
          }
          None => {
            self.put_op(Bytecode::CallExtracted);
            self.put_position(callee);
          }
        };
        self.put_regs(args)?;
        self.put_dest(inst)
      }
    }
  }

  /// Ends the stream. Every referenced batch must have been emitted.
  pub fn finish(self) -> Result<Vec<u8>, EncodeError> {
    if let Some(name) = self.pending.keys().min() {
      return Err(EncodeError::UnresolvedReference(name.clone()));
    };
    Ok(self.out.into_bytes())
  }
}

/// Encodes `batches` in order; the first one must be the entry batch.
pub fn encode_batches(
  batches: &[InstBatch],
  table: &DispatchTable,
  source: &Source,
) -> Result<Vec<u8>, EncodeError> {
  match batches.first() {
    Some(first) if first.is_entry() => {}
    _ => return Err(EncodeError::Internal("first batch is not the entry batch".to_string())),
  };
  let mut encoder = NodeEncoder::new(table, source);
  for batch in batches {
    encoder.encode_batch(batch)?;
  }
  let bytes = encoder.finish()?;
  debug!(batches = batches.len(), bytes = bytes.len(), "snapshot encoded");
  Ok(bytes)
}
