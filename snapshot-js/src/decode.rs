use crate::bytecode::Bytecode;
use crate::bytecode::ARG_CONTEXT;
use crate::bytecode::ARG_SOURCE;
use crate::bytecode::HEADER_LEN;
use crate::bytecode::MAGIC;
use crate::codec::BinaryDecoder;
use crate::error::DecodeError;
use crate::factory::NodeFactory;
use crate::factory::NodeRef;
use crate::runtime::CallTarget;
use crate::runtime::Context;
use crate::runtime::FrameDescriptor;
use crate::runtime::FunctionData;
use crate::runtime::JumpTarget;
use crate::runtime::JumpTargetKind;
use crate::runtime::Source;
use crate::runtime::SourceSection;
use crate::runtime::Tags;
use crate::value::Singleton;
use crate::value::Value;
use crate::value::ValueType;
use std::sync::Arc;
use tracing::debug;
use tracing::trace;

/// Maximum nesting of extracted calls within one replay.
pub const MAX_CALL_DEPTH: usize = 512;

/// Everything a batch needs to run, cheap to clone into lazy initializers.
#[derive(Clone)]
struct Replay {
  buffer: Arc<[u8]>,
  factory: Arc<dyn NodeFactory>,
  context: Arc<Context>,
  source: Arc<Source>,
}

fn operand<T>(value: &Value, expected: &'static str, get: impl FnOnce(&Value) -> Option<T>) -> Result<T, DecodeError> {
  get(value).ok_or(DecodeError::UnexpectedOperand {
    expected,
    actual: value.kind_name(),
  })
}

/// One activation of a batch: a cursor plus its register file.
struct Frame<'r> {
  replay: &'r Replay,
  dec: BinaryDecoder,
  regs: Vec<Value>,
  args: Vec<Value>,
  depth: usize,
}

impl<'r> Frame<'r> {
  fn reg_index(&mut self) -> Result<usize, DecodeError> {
    let reg = self.dec.get_uint()?;
    match usize::try_from(reg) {
      Ok(i) if i > 0 && i < self.regs.len() => Ok(i),
      _ => Err(DecodeError::BadRegister {
        reg,
        limit: self.regs.len(),
      }),
    }
  }

  fn read(&mut self) -> Result<Value, DecodeError> {
    let i = self.reg_index()?;
    Ok(self.regs[i].clone())
  }

  fn read_n(&mut self) -> Result<Vec<Value>, DecodeError> {
    let n = usize::try_from(self.dec.get_int()?).map_err(|_| DecodeError::Malformed("negative count"))?;
    if n > self.dec.remaining() {
      return Err(DecodeError::UnexpectedEnd);
    };
    (0..n).map(|_| self.read()).collect()
  }

  fn write(&mut self, value: Value) -> Result<(), DecodeError> {
    let reg = self.dec.get_uint()?;
    if reg == 0 {
      return Ok(());
    };
    match usize::try_from(reg) {
      Ok(i) if i < self.regs.len() => {
        self.regs[i] = value;
        Ok(())
      }
      _ => Err(DecodeError::BadRegister {
        reg,
        limit: self.regs.len(),
      }),
    }
  }

  fn read_node(&mut self) -> Result<NodeRef, DecodeError> {
    let v = self.read()?;
    operand(&v, "node", |v| v.as_node().cloned())
  }

  fn read_source(&mut self) -> Result<Arc<Source>, DecodeError> {
    let v = self.read()?;
    operand(&v, "source", |v| match v {
      Value::Source(s) => Some(s.clone()),
      _ => None,
    })
  }

  fn read_function_data(&mut self) -> Result<Arc<FunctionData>, DecodeError> {
    let v = self.read()?;
    operand(&v, "function data", |v| v.as_function_data().cloned())
  }

  fn read_position(&mut self) -> Result<usize, DecodeError> {
    let raw = self.dec.get_i32()?;
    match usize::try_from(raw) {
      Ok(p) if p >= HEADER_LEN && p < self.replay.buffer.len() => Ok(p),
      _ => Err(DecodeError::BadPosition(raw)),
    }
  }

  fn class(&mut self) -> Result<ValueType, DecodeError> {
    let index = self.dec.get_int()?;
    self
      .replay
      .factory
      .dispatch_table()
      .class(index)
      .ok_or(DecodeError::UnknownClass(index))
  }

  fn run(mut self) -> Result<Value, DecodeError> {
    loop {
      if !self.dec.has_remaining() {
        return Err(DecodeError::MissingReturn);
      };
      let raw = self.dec.get_uint()?;
      let op = Bytecode::from_u64(raw).ok_or(DecodeError::UnknownOpcode(raw))?;
      match op {
        Bytecode::Nop => {}
        Bytecode::Return => return self.read(),
        Bytecode::Node => {
          let raw = self.dec.get_uint()?;
          let table = self.replay.factory.dispatch_table();
          let (method, sig) = u32::try_from(raw)
            .ok()
            .and_then(|id| table.method(id).map(|sig| (id, *sig)))
            .ok_or(DecodeError::UnknownMethod(raw))?;
          let args = self.read_n()?;
          if args.len() != sig.params.len() {
            return Err(DecodeError::ArgumentCount {
              method: sig.name,
              expected: sig.params.len(),
              actual: args.len(),
            });
          };
          let result = self.replay.factory.invoke(method, args)?;
          self.write(result)?;
        }
        Bytecode::LdcInt => {
          let v = self.dec.get_int()?;
          self.write(Value::Int(v))?;
        }
        Bytecode::LdcLong => {
          let v = self.dec.get_long()?;
          self.write(Value::Long(v))?;
        }
        Bytecode::LdcBoolean => {
          let v = self.dec.get_bool()?;
          self.write(Value::Bool(v))?;
        }
        Bytecode::LdcDouble => {
          let v = self.dec.get_double()?;
          self.write(Value::Double(v))?;
        }
        Bytecode::LdcEnum => {
          let index = self.dec.get_int()?;
          let ValueType::Enum(class) = self
            .replay
            .factory
            .dispatch_table()
            .class(index)
            .ok_or(DecodeError::UnknownClass(index))?
          else {
            return Err(DecodeError::UnknownClass(index));
          };
          let ordinal = self.dec.get_int()?;
          let v = u32::try_from(ordinal)
            .ok()
            .and_then(|o| class.constant(o))
            .ok_or(DecodeError::UnknownEnumConstant {
              class: class.name,
              ordinal,
            })?;
          self.write(v)?;
        }
        Bytecode::LdcString => {
          let v = self.dec.get_utf8()?;
          self.write(Value::Str(Arc::from(v)))?;
        }
        Bytecode::LdcSingleton => {
          let index = self.dec.get_int()?;
          let s = Singleton::from_index(index).ok_or(DecodeError::UnknownSingleton(index))?;
          self.write(Value::Singleton(s))?;
        }
        Bytecode::LdArg => {
          let index = self.dec.get_int()?;
          let v = match index {
            ARG_CONTEXT => Value::Context(self.replay.context.clone()),
            ARG_SOURCE => Value::Source(self.replay.source.clone()),
            _ => usize::try_from(index)
              .ok()
              .and_then(|i| self.args.get(i))
              .cloned()
              .ok_or(DecodeError::BadArgument(index))?,
          };
          self.write(v)?;
        }
        Bytecode::Mov => {
          let dest = self.reg_index()?;
          let v = self.read()?;
          self.regs[dest] = v;
        }
        Bytecode::CollectArray => {
          let component = self.class()?;
          let items = self.read_n()?;
          self.write(Value::Array { component, items })?;
        }
        Bytecode::CollectList => {
          let items = self.read_n()?;
          self.write(Value::List(items))?;
        }
        Bytecode::CallTarget => {
          let root = self.read_node()?;
          self.write(Value::CallTarget(Arc::new(CallTarget::new(root))))?;
        }
        Bytecode::FrameDescriptor => {
          self.write(Value::FrameDescriptor(FrameDescriptor::new()))?;
        }
        Bytecode::FrameSlot => {
          let v = self.read()?;
          let fd = operand(&v, "frame descriptor", |v| v.as_frame_descriptor().cloned())?;
          let identifier = self.read()?;
          let flags = self.dec.get_int()?;
          let slot = match self.dec.get_bool()? {
            true => fd.find_or_add_slot(identifier, flags),
            false => fd.add_slot(identifier, flags),
          };
          self.write(Value::FrameSlot(slot))?;
        }
        Bytecode::SourceSection => {
          let source = self.read_source()?;
          let index = self.dec.get_int()?;
          let len = self.dec.get_int()?;
          self.write(Value::SourceSection(SourceSection::from_wire(source, index, len)))?;
        }
        Bytecode::FunctionData => {
          let v = self.read()?;
          let context = operand(&v, "context", |v| match v {
            Value::Context(c) => Some(c.clone()),
            _ => None,
          })?;
          let length = self.dec.get_int()?;
          let name = self.dec.get_utf8()?;
          let flags = self.dec.get_i32()?;
          self.write(Value::FunctionData(FunctionData::new(context, length, name, flags)))?;
        }
        Bytecode::FunctionDataNameFixup => {
          let fd = self.read_function_data()?;
          let name = self.dec.get_utf8()?;
          fd.set_name(name);
        }
        Bytecode::JumpTarget => {
          let code = self.dec.get_int()?;
          let kind = JumpTargetKind::from_code(code).ok_or(DecodeError::UnknownJumpTarget(code))?;
          self.write(Value::JumpTarget(Arc::new(JumpTarget::new(kind))))?;
        }
        Bytecode::CallExtracted => {
          let position = self.read_position()?;
          let args = self.read_n()?;
          trace!(position, depth = self.depth, "call extracted");
          let result = self.replay.run(position, args, self.depth + 1)?;
          self.write(result)?;
        }
        Bytecode::CallExtractedLazy => {
          let position = self.read_position()?;
          let fd = self.read_function_data()?;
          let args = self.read_n()?;
          let replay = self.replay.clone();
          let depth = self.depth + 1;
          fd.set_lazy_init(Box::new(move |_: &FunctionData| {
            replay.run(position, args, depth)
          }));
          self.write(Value::ABSENT)?;
        }
        Bytecode::NodeSourceSectionFixup => {
          let node = self.read_node()?;
          let source = self.read_source()?;
          let index = self.dec.get_int()?;
          let len = self.dec.get_int()?;
          node.set_source_section(SourceSection::from_wire(source, index, len));
        }
        Bytecode::NodeTagsFixup => {
          let node = self.read_node()?;
          let tags = Tags {
            statement: self.dec.get_bool()?,
            call: self.dec.get_bool()?,
            expression: self.dec.get_bool()?,
            root_body: self.dec.get_bool()?,
          };
          node.add_tags(tags);
        }
      };
    }
  }
}

impl Replay {
  /// Runs the batch at `position` with `args` bound to its parameters.
  fn run(&self, position: usize, args: Vec<Value>, depth: usize) -> Result<Value, DecodeError> {
    if depth > MAX_CALL_DEPTH {
      return Err(DecodeError::TooDeep(MAX_CALL_DEPTH));
    };
    let mut dec = BinaryDecoder::new(self.buffer.clone()).at(position)?;
    let limit = usize::try_from(dec.get_uint()?).map_err(|_| DecodeError::Malformed("register limit"))?;
    // Every register but the discard register is written by at least one byte.
    if limit == 0 || limit > dec.remaining() + 1 {
      return Err(DecodeError::Malformed("register limit"));
    };
    Frame {
      replay: self,
      dec,
      regs: vec![Value::ABSENT; limit],
      args,
      depth,
    }
    .run()
  }
}

fn check_header(
  buffer: &Arc<[u8]>,
  factory: &dyn NodeFactory,
  source: &Source,
) -> Result<(), DecodeError> {
  let mut dec = BinaryDecoder::new(buffer.clone());
  let magic = dec.get_i32()?;
  if magic != MAGIC {
    return Err(DecodeError::BadMagic(magic));
  };
  let checksum = dec.get_i32()?;
  let expected = factory.dispatch_table().checksum();
  if checksum != expected {
    return Err(DecodeError::ChecksumMismatch {
      expected,
      actual: checksum,
    });
  };
  let actual_len = dec.get_i32()?;
  let actual_hash = dec.get_i32()?;
  let (expected_len, expected_hash) = (source.len() as i32, source.hash() as i32);
  if actual_len != expected_len || actual_hash != expected_hash {
    return Err(DecodeError::SourceMismatch {
      expected_len,
      expected_hash,
      actual_len,
      actual_hash,
    });
  };
  Ok(())
}

/// Rebuilds a tree by replaying a snapshot stream against a node factory.
pub struct NodeDecoder {
  replay: Replay,
}

impl NodeDecoder {
  pub fn new(
    bytes: impl Into<Arc<[u8]>>,
    factory: Arc<dyn NodeFactory>,
    context: Arc<Context>,
    source: Arc<Source>,
  ) -> Self {
    Self {
      replay: Replay {
        buffer: bytes.into(),
        factory,
        context,
        source,
      },
    }
  }

  /// Verifies the header, then replays the entry batch. Extracted batches
  /// called lazily run later, when their function data's root is requested.
  pub fn decode(&self) -> Result<Value, DecodeError> {
    let r = &self.replay;
    check_header(&r.buffer, r.factory.as_ref(), &r.source)?;
    let root = r.run(HEADER_LEN, Vec::new(), 0)?;
    debug!(
      source = r.source.name(),
      bytes = r.buffer.len(),
      "snapshot decoded"
    );
    Ok(root)
  }
}

/// A snapshot held in memory, ready to be applied in place of parsing.
#[derive(Clone, Debug)]
pub struct BinarySnapshot {
  bytes: Arc<[u8]>,
}

impl BinarySnapshot {
  pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
    Self {
      bytes: bytes.into(),
    }
  }

  pub fn bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn apply(
    &self,
    factory: Arc<dyn NodeFactory>,
    context: Arc<Context>,
    source: Arc<Source>,
  ) -> Result<Value, DecodeError> {
    NodeDecoder::new(self.bytes.clone(), factory, context, source).decode()
  }
}
