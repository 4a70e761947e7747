use crate::factory::NodeRef;
use crate::runtime::CallTarget;
use crate::runtime::Context;
use crate::runtime::FrameDescriptor;
use crate::runtime::FrameSlot;
use crate::runtime::FunctionData;
use crate::runtime::JumpTarget;
use crate::runtime::Source;
use crate::runtime::SourceSection;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Identifier of a recorded value. Ids start at 1 and are unique within one
/// recording.
pub type ValueId = u32;

/// A closed enumeration known to a dispatch table.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct EnumClass {
  pub name: &'static str,
  pub constants: &'static [&'static str],
}

impl EnumClass {
  pub fn constant(&'static self, ordinal: u32) -> Option<Value> {
    ((ordinal as usize) < self.constants.len()).then_some(Value::Enum {
      class: self,
      ordinal,
    })
  }
}

/// Declared types used by method signatures and by the encoder for disambiguation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
  Void,
  Int,
  Long,
  Bool,
  Double,
  Str,
  Object,
  Enum(&'static EnumClass),
  Node,
  /// Root node of a function body. Values of this type start a new batch.
  FunctionRoot,
  Array(&'static ValueType),
  List(&'static ValueType),
  CallTarget,
  FrameDescriptor,
  FrameSlot,
  Source,
  SourceSection,
  Context,
  FunctionData,
  JumpTarget,
  Opaque,
}

impl ValueType {
  /// Element type used when encoding the items of an array or list argument.
  pub fn element(&self) -> ValueType {
    match self {
      ValueType::Array(t) | ValueType::List(t) => **t,
      _ => ValueType::Object,
    }
  }
}

impl fmt::Display for ValueType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ValueType::Void => f.write_str("()"),
      ValueType::Int => f.write_str("i32"),
      ValueType::Long => f.write_str("i64"),
      ValueType::Bool => f.write_str("bool"),
      ValueType::Double => f.write_str("f64"),
      ValueType::Str => f.write_str("Str"),
      ValueType::Object => f.write_str("Value"),
      ValueType::Enum(class) => f.write_str(class.name),
      ValueType::Node => f.write_str("Node"),
      ValueType::FunctionRoot => f.write_str("FunctionRoot"),
      ValueType::Array(t) => write!(f, "[{t}]"),
      ValueType::List(t) => write!(f, "Vec<{t}>"),
      ValueType::CallTarget => f.write_str("CallTarget"),
      ValueType::FrameDescriptor => f.write_str("FrameDescriptor"),
      ValueType::FrameSlot => f.write_str("FrameSlot"),
      ValueType::Source => f.write_str("Source"),
      ValueType::SourceSection => f.write_str("SourceSection"),
      ValueType::Context => f.write_str("Context"),
      ValueType::FunctionData => f.write_str("FunctionData"),
      ValueType::JumpTarget => f.write_str("JumpTarget"),
      ValueType::Opaque => f.write_str("Opaque"),
    }
  }
}

/// Process-wide sentinel values. The order is the on-wire index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Singleton {
  /// Host-level absence of a value.
  Absent,
  Undefined,
  Null,
  /// Marker for dead code.
  Dead,
}

impl Singleton {
  pub const ALL: [Singleton; 4] = [
    Singleton::Absent,
    Singleton::Undefined,
    Singleton::Null,
    Singleton::Dead,
  ];

  pub fn index(self) -> i32 {
    self as i32
  }

  pub fn from_index(index: i32) -> Option<Singleton> {
    usize::try_from(index)
      .ok()
      .and_then(|i| Self::ALL.get(i))
      .copied()
  }
}

/// Any value that crosses the node factory boundary.
#[derive(Clone, Debug)]
pub enum Value {
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
  Node(NodeRef),
  Array {
    component: ValueType,
    items: Vec<Value>,
  },
  List(Vec<Value>),
  CallTarget(Arc<CallTarget>),
  FrameDescriptor(Arc<FrameDescriptor>),
  FrameSlot(Arc<FrameSlot>),
  Source(Arc<Source>),
  SourceSection(SourceSection),
  Context(Arc<Context>),
  FunctionData(Arc<FunctionData>),
  JumpTarget(Arc<JumpTarget>),
  /// Parser environment object. Recorded as a placeholder and replayed as
  /// `Singleton::Absent`.
  Opaque(Arc<dyn Any + Send + Sync>),
}

fn same_arc<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
  Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl Value {
  pub const ABSENT: Value = Value::Singleton(Singleton::Absent);

  pub fn str(s: &str) -> Value {
    Value::Str(Arc::from(s))
  }

  pub fn kind_name(&self) -> &'static str {
    match self {
      Value::Int(_) => "int",
      Value::Long(_) => "long",
      Value::Bool(_) => "boolean",
      Value::Double(_) => "double",
      Value::Str(_) => "string",
      Value::Enum { .. } => "enum",
      Value::Singleton(_) => "singleton",
      Value::Node(_) => "node",
      Value::Array { .. } => "array",
      Value::List(_) => "list",
      Value::CallTarget(_) => "call target",
      Value::FrameDescriptor(_) => "frame descriptor",
      Value::FrameSlot(_) => "frame slot",
      Value::Source(_) => "source",
      Value::SourceSection(_) => "source section",
      Value::Context(_) => "context",
      Value::FunctionData(_) => "function data",
      Value::JumpTarget(_) => "jump target",
      Value::Opaque(_) => "opaque",
    }
  }

  pub fn is_absent(&self) -> bool {
    matches!(self, Value::Singleton(Singleton::Absent))
  }

  /// Identity comparison: scalars, strings, enums and singletons compare by
  /// value, source sections by source identity and range, collections
  /// element-wise, and everything else by reference.
  pub fn same(&self, other: &Value) -> bool {
    match (self, other) {
      (Value::Int(a), Value::Int(b)) => a == b,
      (Value::Long(a), Value::Long(b)) => a == b,
      (Value::Bool(a), Value::Bool(b)) => a == b,
      (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
      (Value::Str(a), Value::Str(b)) => a == b,
      (
        Value::Enum {
          class: ca,
          ordinal: oa,
        },
        Value::Enum {
          class: cb,
          ordinal: ob,
        },
      ) => std::ptr::eq(*ca, *cb) && oa == ob,
      (Value::Singleton(a), Value::Singleton(b)) => a == b,
      (Value::Node(a), Value::Node(b)) => same_arc(a, b),
      (
        Value::Array {
          component: ca,
          items: a,
        },
        Value::Array {
          component: cb,
          items: b,
        },
      ) => ca == cb && a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.same(b)),
      (Value::List(a), Value::List(b)) => {
        a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.same(b))
      }
      (Value::CallTarget(a), Value::CallTarget(b)) => same_arc(a, b),
      (Value::FrameDescriptor(a), Value::FrameDescriptor(b)) => same_arc(a, b),
      (Value::FrameSlot(a), Value::FrameSlot(b)) => same_arc(a, b),
      (Value::Source(a), Value::Source(b)) => same_arc(a, b),
      (Value::SourceSection(a), Value::SourceSection(b)) => a == b,
      (Value::Context(a), Value::Context(b)) => same_arc(a, b),
      (Value::FunctionData(a), Value::FunctionData(b)) => same_arc(a, b),
      (Value::JumpTarget(a), Value::JumpTarget(b)) => same_arc(a, b),
      (Value::Opaque(a), Value::Opaque(b)) => same_arc(a, b),
      _ => false,
    }
  }

  pub fn as_int(&self) -> Option<i32> {
    match self {
      Value::Int(v) => Some(*v),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::Str(v) => Some(v),
      _ => None,
    }
  }

  pub fn as_node(&self) -> Option<&NodeRef> {
    match self {
      Value::Node(v) => Some(v),
      _ => None,
    }
  }

  pub fn as_function_data(&self) -> Option<&Arc<FunctionData>> {
    match self {
      Value::FunctionData(v) => Some(v),
      _ => None,
    }
  }

  pub fn as_frame_descriptor(&self) -> Option<&Arc<FrameDescriptor>> {
    match self {
      Value::FrameDescriptor(v) => Some(v),
      _ => None,
    }
  }

  pub fn as_frame_slot(&self) -> Option<&Arc<FrameSlot>> {
    match self {
      Value::FrameSlot(v) => Some(v),
      _ => None,
    }
  }

  pub fn as_source_section(&self) -> Option<&SourceSection> {
    match self {
      Value::SourceSection(v) => Some(v),
      _ => None,
    }
  }

  pub fn as_jump_target(&self) -> Option<&Arc<JumpTarget>> {
    match self {
      Value::JumpTarget(v) => Some(v),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  static COLOR: EnumClass = EnumClass {
    name: "Color",
    constants: &["Red", "Green"],
  };

  #[test]
  fn singleton_indices_are_fixed() {
    assert_eq!(Singleton::Absent.index(), 0);
    assert_eq!(Singleton::Dead.index(), 3);
    assert_eq!(Singleton::from_index(2), Some(Singleton::Null));
    assert_eq!(Singleton::from_index(-1), None);
    assert_eq!(Singleton::from_index(4), None);
  }

  #[test]
  fn enum_constants_are_bounded() {
    assert!(COLOR.constant(1).is_some());
    assert!(COLOR.constant(2).is_none());
  }

  #[test]
  fn identity_comparison() {
    assert!(Value::str("x").same(&Value::str("x")));
    assert!(!Value::Int(1).same(&Value::Long(1)));
    assert!(Value::Double(f64::NAN).same(&Value::Double(f64::NAN)));
    let a = Arc::new(JumpTarget::new(crate::runtime::JumpTargetKind::Switch));
    let b = Arc::new(JumpTarget::new(crate::runtime::JumpTargetKind::Switch));
    assert!(Value::JumpTarget(a.clone()).same(&Value::JumpTarget(a)));
    assert!(!Value::JumpTarget(b.clone()).same(&Value::JumpTarget(Arc::new(
      JumpTarget::new(crate::runtime::JumpTargetKind::Switch)
    ))));
    assert_eq!(ValueType::Array(&ValueType::Node).to_string(), "[Node]");
  }
}
