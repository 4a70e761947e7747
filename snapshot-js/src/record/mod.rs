mod fixup;
pub mod inst;
pub mod table;

use crate::encode::encode_batches;
use crate::encode::text::emit_text;
use crate::error::EncodeError;
use crate::error::FactoryError;
use crate::error::RecordError;
use crate::factory::DispatchTable;
use crate::factory::MethodId;
use crate::factory::MethodKind;
use crate::factory::MethodSig;
use crate::factory::NodeFactory;
use crate::opt::batch::build_batches;
use crate::opt::batch::InstBatch;
use crate::opt::dce::eliminate_dead_code;
use crate::runtime::FrameDescriptor;
use crate::runtime::FunctionData;
use crate::runtime::Source;
use crate::value::Value;
use crate::value::ValueId;
use crate::value::ValueType;
use ahash::HashMap;
use fixup::FixUpQueue;
use fixup::Watch;
pub use inst::Constant;
pub use inst::Inst;
pub use inst::InstKind;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
pub use table::ValueKey;
use table::ValueTable;
use tracing::debug;
use tracing::trace;

#[derive(Clone, Debug)]
pub struct RecordingOptions {
  /// Split nested function bodies into extracted batches.
  pub batches: bool,
  /// Call extracted function bodies lazily through their function data.
  pub lazy_functions: bool,
  /// Record source sections attached to nodes after creation.
  pub fixup_source_sections: bool,
  /// Record instrumentation tags attached to nodes after creation.
  pub fixup_tags: bool,
}

impl Default for RecordingOptions {
  fn default() -> Self {
    Self {
      batches: true,
      lazy_functions: true,
      fixup_source_sections: true,
      fixup_tags: true,
    }
  }
}

impl RecordingOptions {
  pub fn with_batches(mut self, enabled: bool) -> Self {
    self.batches = enabled;
    self
  }

  pub fn with_lazy_functions(mut self, enabled: bool) -> Self {
    self.lazy_functions = enabled;
    self
  }

  pub fn with_fixup_source_sections(mut self, enabled: bool) -> Self {
    self.fixup_source_sections = enabled;
    self
  }

  pub fn with_fixup_tags(mut self, enabled: bool) -> Self {
    self.fixup_tags = enabled;
    self
  }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecordingStats {
  /// Insts recorded, including the final return.
  pub recorded: usize,
  /// Insts removed as unreachable.
  pub dead: usize,
  pub batches: usize,
}

struct CallFrame {
  method: MethodId,
  sig: MethodSig,
  args: Vec<Value>,
}

/// One recording session: the trace of factory calls a translator made to build
/// one program, and after `finish`, its pruned and batched form.
pub struct Recording {
  options: RecordingOptions,
  insts: Vec<Inst>,
  defs: HashMap<ValueId, usize>,
  table: ValueTable,
  stack: Vec<CallFrame>,
  frame_descriptors: Vec<Arc<FrameDescriptor>>,
  function_data: Vec<Arc<FunctionData>>,
  fixups: FixUpQueue,
  batches: Vec<InstBatch>,
  source: Option<Arc<Source>>,
  recorded_source: Option<Arc<Source>>,
  finished: bool,
  stats: RecordingStats,
}

impl Recording {
  pub fn new(options: RecordingOptions) -> Self {
    Self {
      options,
      insts: Vec::new(),
      defs: HashMap::default(),
      table: ValueTable::new(),
      stack: Vec::new(),
      frame_descriptors: Vec::new(),
      function_data: Vec::new(),
      fixups: FixUpQueue::default(),
      batches: Vec::new(),
      source: None,
      recorded_source: None,
      finished: false,
      stats: RecordingStats::default(),
    }
  }

  pub fn options(&self) -> &RecordingOptions {
    &self.options
  }

  /// Recorded insts in order. After `finish` only live insts remain.
  pub fn insts(&self) -> &[Inst] {
    &self.insts
  }

  pub fn inst(&self, id: ValueId) -> Option<&Inst> {
    self.defs.get(&id).map(|&i| &self.insts[i])
  }

  /// Id of a recorded value.
  pub fn value_id(&self, value: &Value) -> Option<ValueId> {
    self.table.get(value)
  }

  pub fn batches(&self) -> &[InstBatch] {
    &self.batches
  }

  pub fn frame_descriptors(&self) -> &[Arc<FrameDescriptor>] {
    &self.frame_descriptors
  }

  pub fn function_data(&self) -> &[Arc<FunctionData>] {
    &self.function_data
  }

  pub fn source(&self) -> Option<&Arc<Source>> {
    self.source.as_ref()
  }

  /// Overrides the source that would otherwise be taken from the root node.
  pub fn set_source(&mut self, source: Arc<Source>) {
    self.source = Some(source);
  }

  pub fn is_finished(&self) -> bool {
    self.finished
  }

  pub fn stats(&self) -> RecordingStats {
    self.stats
  }

  fn push(&mut self, inst: Inst) {
    if let Some(id) = inst.id() {
      self.defs.insert(id, self.insts.len());
    };
    self.insts.push(inst);
  }

  /// Called before the factory runs `method`.
  pub fn record_call(
    &mut self,
    method: MethodId,
    sig: &MethodSig,
    args: &[Value],
  ) -> Result<(), RecordError> {
    self.drain_early_fixups()?;
    self.stack.push(CallFrame {
      method,
      sig: *sig,
      args: args.to_vec(),
    });
    Ok(())
  }

  /// Drops the frame of a call whose factory invocation failed.
  pub fn abandon_call(&mut self, method: MethodId) {
    if self.stack.last().is_some_and(|frame| frame.method == method) {
      trace!(method, "abandoned call");
      self.stack.pop();
    };
  }

  /// Called after the factory returned `result` from `method`.
  pub fn record_return(&mut self, method: MethodId, result: &Value) -> Result<(), RecordError> {
    let Some(frame) = self.stack.pop() else {
      return Err(RecordError::UnbalancedCall {
        expected: "<none>",
        actual: "<unknown>",
      });
    };
    if frame.method != method {
      return Err(RecordError::UnbalancedCall {
        expected: frame.sig.name,
        actual: "<other method>",
      });
    };
    if frame.sig.kind == MethodKind::FixUp {
      let Some(target) = frame.args.first() else {
        return Err(RecordError::MissingFixUpTarget(frame.sig.name));
      };
      self.table.require(target)?;
      let args = self.encode_args(&frame)?;
      trace!(method = frame.sig.name, "fix-up call");
      self.push(Inst::new(
        ValueType::Void,
        InstKind::Invoke {
          method,
          name: frame.sig.name,
          args,
          fix_up: true,
          result: None,
        },
      ));
      return Ok(());
    };
    if self.table.contains(result) {
      trace!(method = frame.sig.name, "no-op return of a recorded value");
      return Ok(());
    };
    let args = self.encode_args(&frame)?;
    let id = self.table.put(result)?;
    self.push(Inst::with_id(
      id,
      frame.sig.ret,
      InstKind::Invoke {
        method,
        name: frame.sig.name,
        args,
        fix_up: false,
        result: result.as_node().cloned(),
      },
    )?);
    self.watch_result(id, result);
    Ok(())
  }

  fn encode_args(&mut self, frame: &CallFrame) -> Result<Vec<ValueId>, RecordError> {
    frame
      .args
      .iter()
      .enumerate()
      .map(|(i, arg)| {
        let declared = frame.sig.params.get(i).copied().unwrap_or(ValueType::Object);
        self.encode(arg, declared)
      })
      .collect()
  }

  fn watch_result(&mut self, id: ValueId, result: &Value) {
    match result {
      Value::FunctionData(data) => {
        self.function_data.push(data.clone());
        self.fixups.early.push(Watch::function_data(id, data));
      }
      Value::FrameDescriptor(fd) => self.frame_descriptors.push(fd.clone()),
      Value::Node(node) if self.options.fixup_source_sections || self.options.fixup_tags => {
        self.fixups.early.push(Watch::node(id, node));
      }
      _ => {}
    }
  }

  fn get_or_put(
    &mut self,
    value: &Value,
    make: impl FnOnce(&mut Self) -> Result<(ValueType, InstKind), RecordError>,
  ) -> Result<ValueId, RecordError> {
    if let Some(id) = self.table.get(value) {
      return Ok(id);
    };
    let (ty, kind) = make(self)?;
    let id = self.table.put(value)?;
    self.push(Inst::with_id(id, ty, kind)?);
    Ok(id)
  }

  fn constant(&mut self, value: &Value, ty: ValueType, constant: Constant) -> Result<ValueId, RecordError> {
    self.get_or_put(value, |_| Ok((ty, InstKind::Const(constant))))
  }

  /// Returns the id of the inst representing `value`, recording it first if
  /// needed. `declared` is the parameter type the value was passed as.
  pub fn encode(&mut self, value: &Value, declared: ValueType) -> Result<ValueId, RecordError> {
    match value {
      Value::Int(v) => self.constant(value, ValueType::Int, Constant::Int(*v)),
      Value::Long(v) => self.constant(value, ValueType::Long, Constant::Long(*v)),
      Value::Bool(v) => self.constant(value, ValueType::Bool, Constant::Bool(*v)),
      Value::Double(v) => self.constant(value, ValueType::Double, Constant::Double(*v)),
      Value::Str(v) => self.constant(value, ValueType::Str, Constant::Str(v.clone())),
      Value::Enum { class, ordinal } => self.constant(
        value,
        ValueType::Enum(class),
        Constant::Enum {
          class,
          ordinal: *ordinal,
        },
      ),
      Value::Singleton(s) => self.constant(value, declared, Constant::Singleton(*s)),
      Value::Node(_) => self.table.require(value),
      Value::Array { component, items } => {
        let items = items
          .iter()
          .map(|item| self.encode(item, *component))
          .collect::<Result<Vec<_>, _>>()?;
        let id = self.table.put(value)?;
        self.push(Inst::with_id(
          id,
          declared,
          InstKind::Collect {
            component: Some(*component),
            items,
          },
        )?);
        Ok(id)
      }
      Value::List(items) => {
        let element = declared.element();
        let items = items
          .iter()
          .map(|item| self.encode(item, element))
          .collect::<Result<Vec<_>, _>>()?;
        let id = self.table.put(value)?;
        self.push(Inst::with_id(
          id,
          declared,
          InstKind::Collect {
            component: None,
            items,
          },
        )?);
        Ok(id)
      }
      Value::CallTarget(target) => self.get_or_put(value, |rec| {
        let root = rec.encode(&Value::Node(target.root().clone()), ValueType::FunctionRoot)?;
        Ok((ValueType::CallTarget, InstKind::CallTarget { root }))
      }),
      Value::FrameDescriptor(fd) => self.get_or_put(value, |rec| {
        rec.frame_descriptors.push(fd.clone());
        Ok((ValueType::FrameDescriptor, InstKind::FrameDescriptor))
      }),
      Value::FrameSlot(slot) => {
        if let Some(id) = self.table.get(value) {
          return Ok(id);
        };
        let fd = slot.descriptor().ok_or(RecordError::OrphanFrameSlot)?;
        let descriptor = self.encode(&Value::FrameDescriptor(fd.clone()), ValueType::FrameDescriptor)?;
        // Replay adds slots in order, so earlier slots of the descriptor go first.
        for earlier in fd.slots().into_iter().take(slot.index()) {
          self.encode(&Value::FrameSlot(earlier), ValueType::FrameSlot)?;
        }
        self.get_or_put(value, |rec| {
          let identifier = rec.encode(slot.identifier(), ValueType::Object)?;
          Ok((
            ValueType::FrameSlot,
            InstKind::FrameSlot {
              descriptor,
              identifier,
              flags: slot.flags(),
              find_or_add: slot.find_or_add(),
            },
          ))
        })
      }
      Value::FunctionData(data) => {
        if let Some(id) = self.table.get(value) {
          return Ok(id);
        };
        let id = self.get_or_put(value, |rec| {
          let context = rec.encode(&Value::Context(data.context().clone()), ValueType::Context)?;
          Ok((
            ValueType::FunctionData,
            InstKind::FunctionData {
              context,
              length: data.length(),
              name: data.name(),
              flags: data.flags(),
            },
          ))
        })?;
        self.function_data.push(data.clone());
        self.fixups.early.push(Watch::function_data(id, data));
        Ok(id)
      }
      Value::JumpTarget(target) => self.get_or_put(value, |_| {
        Ok((ValueType::JumpTarget, InstKind::JumpTarget(target.kind())))
      }),
      Value::Source(source) => self.get_or_put(value, |rec| {
        rec.recorded_source.get_or_insert_with(|| source.clone());
        Ok((ValueType::Source, InstKind::Source))
      }),
      Value::SourceSection(section) => self.get_or_put(value, |rec| {
        let source = rec.encode(&Value::Source(section.source().clone()), ValueType::Source)?;
        Ok((
          ValueType::SourceSection,
          InstKind::SourceSection {
            source,
            range: section.range(),
          },
        ))
      }),
      Value::Context(_) => self.get_or_put(value, |_| Ok((ValueType::Context, InstKind::Context))),
      Value::Opaque(_) => self.get_or_put(value, |_| Ok((ValueType::Opaque, InstKind::Placeholder))),
    }
  }

  /// Appends fix-up insts for whatever changed since `watch` last fired.
  fn poll(&mut self, watch: &mut Watch) -> Result<bool, RecordError> {
    match watch {
      Watch::FunctionDataName {
        target,
        data,
        baseline,
      } => {
        let current = data.name();
        if current == *baseline {
          return Ok(false);
        };
        trace!(id = *target, name = %current, "function data renamed");
        self.push(Inst::new(
          ValueType::Void,
          InstKind::FunctionDataName {
            target: *target,
            name: current.clone(),
          },
        ));
        *baseline = current;
        Ok(true)
      }
      Watch::Node {
        target,
        node,
        section,
        tags,
      } => {
        let mut fired = false;
        if self.options.fixup_source_sections {
          if let Some(current) = node.source_section().filter(|s| section.as_ref() != Some(s)) {
            let source = self.encode(&Value::Source(current.source().clone()), ValueType::Source)?;
            self.push(Inst::new(
              ValueType::Void,
              InstKind::NodeSourceSection {
                target: *target,
                source,
                range: current.range(),
              },
            ));
            *section = Some(current);
            fired = true;
          };
        };
        if self.options.fixup_tags {
          let current = node.tags();
          if current != *tags && !current.is_empty() {
            self.push(Inst::new(
              ValueType::Void,
              InstKind::NodeTags {
                target: *target,
                tags: current,
              },
            ));
            *tags = current;
            fired = true;
          };
        };
        Ok(fired)
      }
    }
  }

  fn drain_early_fixups(&mut self) -> Result<(), RecordError> {
    for mut watch in std::mem::take(&mut self.fixups.early) {
      if self.poll(&mut watch)? {
        self.fixups.late.push(watch);
      } else {
        self.fixups.early.push(watch);
      }
    }
    Ok(())
  }

  fn drain_fixups(&mut self) -> Result<(), RecordError> {
    self.drain_early_fixups()?;
    for mut watch in std::mem::take(&mut self.fixups.late) {
      self.poll(&mut watch)?;
    }
    trace!(pending = self.fixups.len(), "fix-up queues cleared");
    self.fixups.clear();
    Ok(())
  }

  /// Ends the recording with `root` as the terminal value, then prunes and
  /// batches the trace. May be called exactly once.
  pub fn finish(&mut self, root: &Value) -> Result<(), RecordError> {
    if self.finished {
      return Err(RecordError::AlreadyFinished);
    };
    if !self.stack.is_empty() {
      return Err(RecordError::OpenCalls(self.stack.len()));
    };
    self.finished = true;
    self.drain_fixups()?;
    let root_id = self.table.require(root)?;
    if self.source.is_none() {
      self.source = root
        .as_node()
        .and_then(|node| node.source_section())
        .map(|section| section.source().clone())
        .or_else(|| self.recorded_source.clone());
    };
    if self.source.is_none() {
      return Err(RecordError::MissingSource);
    };
    self.push(Inst::ret(root_id));
    let recorded = self.insts.len();
    let dead = eliminate_dead_code(&mut self.insts);
    self.defs = self
      .insts
      .iter()
      .enumerate()
      .filter_map(|(i, inst)| inst.id().map(|id| (id, i)))
      .collect();
    self.batches = if self.options.batches {
      build_batches(&self.insts, self.options.lazy_functions)?
    } else {
      vec![InstBatch::entry(self.insts.clone())]
    };
    self.stats = RecordingStats {
      recorded,
      dead,
      batches: self.batches.len(),
    };
    debug!(
      recorded,
      dead,
      batches = self.batches.len(),
      "recording finished"
    );
    Ok(())
  }

  /// Serialises the finished recording to a binary stream.
  pub fn to_binary(&self, table: &DispatchTable) -> Result<Vec<u8>, EncodeError> {
    let source = match (&self.source, self.finished) {
      (Some(source), true) => source,
      _ => return Err(EncodeError::Internal("recording is not finished".to_string())),
    };
    encode_batches(&self.batches, table, source)
  }

  /// Renders the finished recording as readable pseudo-source.
  pub fn to_text(&self, file_name: &str) -> String {
    emit_text(self, file_name)
  }
}

/// Node factory decorator that records every call it forwards.
pub struct RecordingFactory<F> {
  inner: F,
  recording: Mutex<Recording>,
}

impl<F: NodeFactory> RecordingFactory<F> {
  pub fn new(inner: F, options: RecordingOptions) -> Self {
    Self {
      inner,
      recording: Mutex::new(Recording::new(options)),
    }
  }

  pub fn inner(&self) -> &F {
    &self.inner
  }

  pub fn with_recording<R>(&self, f: impl FnOnce(&mut Recording) -> R) -> R {
    f(&mut self.recording.lock())
  }

  pub fn into_recording(self) -> Recording {
    self.recording.into_inner()
  }

  pub fn into_parts(self) -> (F, Recording) {
    (self.inner, self.recording.into_inner())
  }
}

impl<F: NodeFactory> NodeFactory for RecordingFactory<F> {
  fn dispatch_table(&self) -> &DispatchTable {
    self.inner.dispatch_table()
  }

  fn invoke(&self, method: MethodId, args: Vec<Value>) -> Result<Value, FactoryError> {
    let sig = *self
      .inner
      .dispatch_table()
      .method(method)
      .ok_or(FactoryError::UnknownMethod(method))?;
    self.recording.lock().record_call(method, &sig, &args)?;
    let result = match self.inner.invoke(method, args) {
      Ok(result) => result,
      Err(err) => {
        self.recording.lock().abandon_call(method);
        return Err(err);
      }
    };
    self.recording.lock().record_return(method, &result)?;
    Ok(result)
  }
}
