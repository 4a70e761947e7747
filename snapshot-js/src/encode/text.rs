//! Readable pseudo-source rendering of a finished recording, for debugging
//! snapshots by eye.

use crate::encode::range_to_wire;
use crate::opt::InstBatch;
use crate::record::Inst;
use crate::record::InstKind;
use crate::record::Recording;
use crate::value::ValueId;
use itertools::Itertools;
use std::fmt::Write;

struct TextEmitter<'a> {
  recording: &'a Recording,
  out: String,
}

impl<'a> TextEmitter<'a> {
  /// A use of `id`; non-string constants are inlined.
  fn operand(&self, id: ValueId) -> String {
    match self.recording.inst(id) {
      Some(inst) if !inst.needs_var() => match inst.kind() {
        InstKind::Const(c) => c.to_string(),
        _ => format!("v{id}"),
      },
      _ => format!("v{id}"),
    }
  }

  fn operands(&self, ids: &[ValueId]) -> String {
    ids.iter().map(|&id| self.operand(id)).join(", ")
  }

  fn extracted_call(&self, callee: &str, args: &[ValueId]) -> String {
    let mut call = format!("{callee}(factory, context, source");
    for &arg in args {
      call.push_str(", ");
      call.push_str(&self.operand(arg));
    }
    call.push(')');
    call
  }

  fn rhs(&self, inst: &Inst) -> Option<String> {
    Some(match inst.kind() {
      InstKind::Const(c) => c.to_string(),
      InstKind::Context => "context".to_string(),
      InstKind::Source => "source".to_string(),
      InstKind::Placeholder => "Singleton::Absent".to_string(),
      InstKind::Invoke { name, args, .. } => {
        format!("factory.{name}({})", self.operands(args))
      }
      InstKind::Collect {
        component: Some(_),
        items,
      } => format!("[{}]", self.operands(items)),
      InstKind::Collect {
        component: None,
        items,
      } => format!("vec![{}]", self.operands(items)),
      InstKind::CallTarget { root } => format!("CallTarget::new({})", self.operand(*root)),
      InstKind::FrameDescriptor => "FrameDescriptor::new()".to_string(),
      InstKind::FrameSlot {
        descriptor,
        identifier,
        flags,
        find_or_add,
      } => format!(
        "{}.{}({}, {flags})",
        self.operand(*descriptor),
        if *find_or_add { "find_or_add_slot" } else { "add_slot" },
        self.operand(*identifier)
      ),
      InstKind::SourceSection { source, range } => {
        let (index, len) = range_to_wire(*range);
        format!("SourceSection::from_wire({}, {index}, {len})", self.operand(*source))
      }
      InstKind::FunctionData {
        context,
        length,
        name,
        flags,
      } => format!(
        "FunctionData::new({}, {length}, {name:?}, {flags:#x})",
        self.operand(*context)
      ),
      InstKind::JumpTarget(kind) => format!("JumpTarget::new(JumpTargetKind::{kind:?})"),
      InstKind::CallExtracted { callee, args, .. } => self.extracted_call(callee, args),
      InstKind::FunctionDataName { .. }
      | InstKind::NodeSourceSection { .. }
      | InstKind::NodeTags { .. }
      | InstKind::Return { .. } => return None,
    })
  }

  fn statement(&mut self, inst: &Inst) {
    let line = match inst.kind() {
      InstKind::Const(_) if !inst.needs_var() => return,
      InstKind::Return { value } => format!("return {};", self.operand(*value)),
      InstKind::FunctionDataName { target, name } => {
        format!("{}.set_name({name:?});", self.operand(*target))
      }
      InstKind::NodeSourceSection {
        target,
        source,
        range,
      } => {
        let (index, len) = range_to_wire(*range);
        format!(
          "{}.set_source_section(SourceSection::from_wire({}, {index}, {len}));",
          self.operand(*target),
          self.operand(*source)
        )
      }
      InstKind::NodeTags { target, tags } => {
        format!("{}.add_tags({tags:?});", self.operand(*target))
      }
      InstKind::CallExtracted {
        callee,
        args,
        function_data: Some(fd),
      } => {
        let id = inst.id().unwrap_or_default();
        format!(
          "{}.set_lazy_init(move |_| {});\n  let v{id} = Singleton::Absent;",
          self.operand(*fd),
          self.extracted_call(callee, args)
        )
      }
      _ => {
        let Some(rhs) = self.rhs(inst) else {
          return;
        };
        match inst.id() {
          Some(id) => format!("let v{id}: {} = {rhs};", inst.ty()),
          None => format!("{rhs};"),
        }
      }
    };
    let _ = writeln!(self.out, "  {line}");
  }

  fn batch(&mut self, batch: &InstBatch) {
    let _ = write!(
      self.out,
      "fn {}(factory: &dyn NodeFactory, context: &Context, source: &Source",
      batch.name
    );
    for param in &batch.params {
      let _ = write!(self.out, ", v{}: {}", param.id, param.ty);
    }
    let _ = writeln!(self.out, ") -> {} {{", batch.ret);
    for inst in &batch.insts {
      self.statement(inst);
    }
    self.out.push_str("}\n\n");
  }
}

/// Renders every batch of `recording` as a function, followed by a comment line
/// per recorded frame descriptor and function data.
pub fn emit_text(recording: &Recording, file_name: &str) -> String {
  let mut emitter = TextEmitter {
    recording,
    out: format!("// Snapshot of {file_name}\n\n"),
  };
  if !recording.is_finished() {
    emitter.out.push_str("// recording is not finished\n");
  };
  for batch in recording.batches() {
    emitter.batch(batch);
  }
  for fd in recording.frame_descriptors() {
    let _ = writeln!(emitter.out, "// FrameDescriptor {fd:?}");
  }
  for data in recording.function_data() {
    let _ = writeln!(emitter.out, "// FunctionData {data:?}");
  }
  emitter.out
}
