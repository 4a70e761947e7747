use crate::factory::MethodId;
use crate::factory::NodeRef;
use crate::runtime::JumpTargetKind;
use crate::runtime::Tags;
use crate::runtime::TextRange;
use crate::value::EnumClass;
use crate::value::Singleton;
use crate::value::ValueId;
use crate::value::ValueType;
use crate::RecordError;
use once_cell::unsync::OnceCell;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub enum Constant {
  Int(i32),
  Long(i64),
  Bool(bool),
  Double(f64),
  Str(Arc<str>),
  Enum {
    class: &'static EnumClass,
    ordinal: u32,
  },
  Singleton(Singleton),
}

impl fmt::Display for Constant {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Constant::Int(v) => write!(f, "{v}"),
      Constant::Long(v) => write!(f, "{v}i64"),
      Constant::Bool(v) => write!(f, "{v}"),
      Constant::Double(v) => write!(f, "{v:?}"),
      Constant::Str(v) => write!(f, "{v:?}"),
      Constant::Enum { class, ordinal } => {
        let name = class.constants.get(*ordinal as usize).copied().unwrap_or("?");
        write!(f, "{}::{}", class.name, name)
      }
      Constant::Singleton(s) => write!(f, "Singleton::{s:?}"),
    }
  }
}

#[derive(Clone, Debug)]
pub enum InstKind {
  Const(Constant),
  /// The execution context supplied at decode time.
  Context,
  /// The source supplied at decode time.
  Source,
  /// Opaque parser state. Replayed as `Singleton::Absent`.
  Placeholder,
  Invoke {
    method: MethodId,
    name: &'static str,
    args: Vec<ValueId>,
    fix_up: bool,
    /// Node produced by the call, kept to name extracted batches.
    result: Option<NodeRef>,
  },
  Collect {
    /// Component type for arrays, `None` for lists.
    component: Option<ValueType>,
    items: Vec<ValueId>,
  },
  CallTarget {
    root: ValueId,
  },
  FrameDescriptor,
  FrameSlot {
    descriptor: ValueId,
    identifier: ValueId,
    flags: i32,
    find_or_add: bool,
  },
  SourceSection {
    source: ValueId,
    range: Option<TextRange>,
  },
  FunctionData {
    context: ValueId,
    length: i32,
    name: String,
    flags: i32,
  },
  FunctionDataName {
    target: ValueId,
    name: String,
  },
  JumpTarget(JumpTargetKind),
  NodeSourceSection {
    target: ValueId,
    source: ValueId,
    range: Option<TextRange>,
  },
  NodeTags {
    target: ValueId,
    tags: Tags,
  },
  Return {
    value: ValueId,
  },
  /// Call of an extracted batch. Lazy when `function_data` is set; it names
  /// one of `args`.
  CallExtracted {
    callee: String,
    args: Vec<ValueId>,
    function_data: Option<ValueId>,
  },
}

/// One node of the recorded call DAG.
#[derive(Clone, Debug)]
pub struct Inst {
  id: Option<ValueId>,
  ty: ValueType,
  kind: InstKind,
  needs_var: OnceCell<bool>,
}

impl Inst {
  /// Creates an unassigned inst. Root insts (returns and pure fix-ups) stay
  /// unassigned.
  pub fn new(ty: ValueType, kind: InstKind) -> Self {
    Self {
      id: None,
      ty,
      kind,
      needs_var: OnceCell::new(),
    }
  }

  pub fn with_id(id: ValueId, ty: ValueType, kind: InstKind) -> Result<Self, RecordError> {
    let mut inst = Self::new(ty, kind);
    inst.assign_id(id)?;
    Ok(inst)
  }

  pub fn ret(value: ValueId) -> Self {
    Self::new(ValueType::Void, InstKind::Return { value })
  }

  pub fn assign_id(&mut self, id: ValueId) -> Result<(), RecordError> {
    if let Some(existing) = self.id {
      return Err(RecordError::DuplicateId(existing));
    };
    self.id = Some(id);
    Ok(())
  }

  pub fn id(&self) -> Option<ValueId> {
    self.id
  }

  pub fn ty(&self) -> ValueType {
    self.ty
  }

  pub fn kind(&self) -> &InstKind {
    &self.kind
  }

  pub fn is_root(&self) -> bool {
    self.id.is_none()
  }

  pub fn is_return(&self) -> bool {
    matches!(self.kind, InstKind::Return { .. })
  }

  /// Nested function bodies start a new batch.
  pub fn is_batch_boundary(&self) -> bool {
    self.ty == ValueType::FunctionRoot
  }

  /// Values every batch can rebuild for itself instead of receiving them as a
  /// parameter.
  pub fn is_primitive_value(&self) -> bool {
    match &self.kind {
      InstKind::Const(c) => !matches!(c, Constant::Str(_)),
      InstKind::Context | InstKind::Source | InstKind::Placeholder => true,
      _ => false,
    }
  }

  /// Whether the value is bound to a variable; non-string constants are inlined
  /// at their use sites by the text emitter.
  pub fn needs_var(&self) -> bool {
    *self
      .needs_var
      .get_or_init(|| !matches!(&self.kind, InstKind::Const(c) if !matches!(c, Constant::Str(_))))
  }

  /// The value a fix-up mutates. Frame slots are fix-ups of their descriptor.
  pub fn fixup_target(&self) -> Option<ValueId> {
    match &self.kind {
      InstKind::Invoke {
        fix_up: true, args, ..
      } => args.first().copied(),
      InstKind::FrameSlot { descriptor, .. } => Some(*descriptor),
      InstKind::FunctionDataName { target, .. }
      | InstKind::NodeSourceSection { target, .. }
      | InstKind::NodeTags { target, .. } => Some(*target),
      _ => None,
    }
  }

  pub fn inputs(&self) -> Vec<ValueId> {
    match &self.kind {
      InstKind::Const(_)
      | InstKind::Context
      | InstKind::Source
      | InstKind::Placeholder
      | InstKind::FrameDescriptor
      | InstKind::JumpTarget(_) => Vec::new(),
      InstKind::Invoke { args, .. } => args.clone(),
      InstKind::Collect { items, .. } => items.clone(),
      InstKind::CallTarget { root } => vec![*root],
      InstKind::FrameSlot {
        descriptor,
        identifier,
        ..
      } => vec![*descriptor, *identifier],
      InstKind::SourceSection { source, .. } => vec![*source],
      InstKind::FunctionData { context, .. } => vec![*context],
      InstKind::FunctionDataName { target, .. } => vec![*target],
      InstKind::NodeSourceSection { target, source, .. } => vec![*target, *source],
      InstKind::NodeTags { target, .. } => vec![*target],
      InstKind::Return { value } => vec![*value],
      InstKind::CallExtracted { args, .. } => args.clone(),
    }
  }

  /// Display name used to name the batch this inst starts.
  pub fn name(&self) -> String {
    match &self.kind {
      InstKind::Invoke {
        result: Some(node), ..
      } => node.display_name().unwrap_or_default(),
      _ => String::new(),
    }
  }

  /// Replaces a batch boundary with a call of its extracted batch, keeping the id
  /// and declared type.
  pub fn to_call_extracted(
    &self,
    callee: String,
    args: Vec<ValueId>,
    function_data: Option<ValueId>,
  ) -> Inst {
    Inst {
      id: self.id,
      ty: self.ty,
      kind: InstKind::CallExtracted {
        callee,
        args,
        function_data,
      },
      needs_var: OnceCell::new(),
    }
  }
}

impl fmt::Display for Inst {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if let Some(id) = self.id {
      write!(f, "v{id} = ")?;
    };
    match &self.kind {
      InstKind::Const(c) => write!(f, "{c}"),
      InstKind::Invoke { name, args, .. } => {
        write!(f, "{name}(")?;
        for (i, a) in args.iter().enumerate() {
          if i > 0 {
            f.write_str(", ")?;
          }
          write!(f, "v{a}")?;
        }
        f.write_str(")")
      }
      InstKind::CallExtracted { callee, .. } => write!(f, "{callee}(..)"),
      InstKind::Return { value } => write!(f, "return v{value}"),
      InstKind::Context => f.write_str("context"),
      InstKind::Source => f.write_str("source"),
      InstKind::Placeholder => f.write_str("placeholder"),
      InstKind::Collect { items, .. } => write!(f, "collect[{}]", items.len()),
      InstKind::CallTarget { root } => write!(f, "call_target(v{root})"),
      InstKind::FrameDescriptor => f.write_str("frame_descriptor"),
      InstKind::FrameSlot { descriptor, .. } => write!(f, "v{descriptor}.slot"),
      InstKind::SourceSection { source, range } => write!(f, "v{source}.section({range:?})"),
      InstKind::FunctionData { name, .. } => write!(f, "function_data({name:?})"),
      InstKind::FunctionDataName { target, name } => write!(f, "v{target}.set_name({name:?})"),
      InstKind::JumpTarget(kind) => write!(f, "jump_target({kind:?})"),
      InstKind::NodeSourceSection { target, range, .. } => {
        write!(f, "v{target}.set_source_section({range:?})")
      }
      InstKind::NodeTags { target, tags } => write!(f, "v{target}.add_tags({tags:?})"),
    }
  }
}
