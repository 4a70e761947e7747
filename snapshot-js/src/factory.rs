use crate::error::FactoryError;
use crate::hash::stable_hash_u32;
use crate::runtime::SourceSection;
use crate::runtime::Tags;
use crate::value::Value;
use crate::value::ValueType;
use ahash::HashMap;
use itertools::Itertools;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// Node produced by a factory. Nodes are shared, so implementations keep their
/// mutable metadata (source section, tags) behind interior mutability.
pub trait AstNode: Any + Debug + Send + Sync {
  fn as_any(&self) -> &dyn Any;

  /// Display name of a function root; names extracted batches.
  fn display_name(&self) -> Option<String> {
    None
  }

  fn source_section(&self) -> Option<SourceSection> {
    None
  }

  fn set_source_section(&self, _section: SourceSection) {}

  fn tags(&self) -> Tags {
    Tags::default()
  }

  fn add_tags(&self, _tags: Tags) {}
}

pub type NodeRef = Arc<dyn AstNode>;

pub type MethodId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MethodKind {
  /// Produces a new value.
  Create,
  /// Mutates its first argument. The result is ignored and never recorded.
  FixUp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MethodSig {
  pub name: &'static str,
  pub params: &'static [ValueType],
  pub ret: ValueType,
  pub kind: MethodKind,
}

impl MethodSig {
  pub const fn create(name: &'static str, params: &'static [ValueType], ret: ValueType) -> Self {
    Self {
      name,
      params,
      ret,
      kind: MethodKind::Create,
    }
  }

  pub const fn fix_up(name: &'static str, params: &'static [ValueType]) -> Self {
    Self {
      name,
      params,
      ret: ValueType::Void,
      kind: MethodKind::FixUp,
    }
  }

  /// Canonical signature text, e.g. `add(Value,Value)Node`.
  pub fn signature(&self) -> String {
    format!(
      "{}({}){}{}",
      self.name,
      self.params.iter().join(","),
      self.ret,
      match self.kind {
        MethodKind::Create => "",
        MethodKind::FixUp => "!",
      }
    )
  }
}

/// Closed, versioned table of factory methods plus the classes that enum
/// constants and array components may refer to. Encoder and decoder must agree on
/// it; the checksum in every stream header guards that.
#[derive(Clone, Debug)]
pub struct DispatchTable {
  methods: Vec<MethodSig>,
  classes: Vec<ValueType>,
  by_name: HashMap<&'static str, MethodId>,
  checksum: i32,
}

impl DispatchTable {
  pub fn new(methods: Vec<MethodSig>, classes: Vec<ValueType>) -> Self {
    let by_name = methods
      .iter()
      .enumerate()
      .map(|(i, m)| (m.name, i as MethodId))
      .collect();
    let canonical = methods
      .iter()
      .map(MethodSig::signature)
      .chain(classes.iter().map(|c| c.to_string()))
      .collect::<Vec<_>>();
    let checksum = stable_hash_u32(&canonical) as i32;
    Self {
      methods,
      classes,
      by_name,
      checksum,
    }
  }

  pub fn checksum(&self) -> i32 {
    self.checksum
  }

  pub fn methods(&self) -> &[MethodSig] {
    &self.methods
  }

  pub fn method(&self, id: MethodId) -> Option<&MethodSig> {
    self.methods.get(id as usize)
  }

  /// Method id by name. Names are expected to be unique; the last one wins.
  pub fn method_id(&self, name: &str) -> Option<MethodId> {
    self.by_name.get(name).copied()
  }

  pub fn classes(&self) -> &[ValueType] {
    &self.classes
  }

  pub fn class(&self, index: i32) -> Option<ValueType> {
    usize::try_from(index)
      .ok()
      .and_then(|i| self.classes.get(i))
      .copied()
  }

  pub fn class_index(&self, ty: &ValueType) -> Option<i32> {
    self.classes.iter().position(|c| c == ty).map(|i| i as i32)
  }
}

/// Builds AST nodes from method-id addressed calls.
pub trait NodeFactory: Send + Sync {
  fn dispatch_table(&self) -> &DispatchTable;

  fn invoke(&self, method: MethodId, args: Vec<Value>) -> Result<Value, FactoryError>;

  /// Invokes a method by name.
  fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, FactoryError> {
    let id = self
      .dispatch_table()
      .method_id(name)
      .ok_or_else(|| FactoryError::UnknownMethodName(name.to_string()))?;
    self.invoke(id, args)
  }
}

impl<F: NodeFactory + ?Sized> NodeFactory for Arc<F> {
  fn dispatch_table(&self) -> &DispatchTable {
    (**self).dispatch_table()
  }

  fn invoke(&self, method: MethodId, args: Vec<Value>) -> Result<Value, FactoryError> {
    (**self).invoke(method, args)
  }
}

impl<F: NodeFactory + ?Sized> NodeFactory for &F {
  fn dispatch_table(&self) -> &DispatchTable {
    (**self).dispatch_table()
  }

  fn invoke(&self, method: MethodId, args: Vec<Value>) -> Result<Value, FactoryError> {
    (**self).invoke(method, args)
  }
}
