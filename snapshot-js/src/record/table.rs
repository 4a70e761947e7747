use crate::error::RecordError;
use crate::runtime::TextRange;
use crate::value::EnumClass;
use crate::value::Singleton;
use crate::value::Value;
use crate::value::ValueId;
use ahash::HashMap;
use std::sync::Arc;

/// Dedup key of a recorded value. Scalars, strings, enums, singletons and source
/// sections compare structurally; reference objects compare by address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueKey {
  Int(i32),
  Long(i64),
  Bool(bool),
  Double(u64),
  Str(Arc<str>),
  Enum(usize, u32),
  Singleton(Singleton),
  Section(usize, Option<TextRange>),
  Ref(usize),
}

fn addr<T: ?Sized>(arc: &Arc<T>) -> usize {
  Arc::as_ptr(arc) as *const () as usize
}

impl ValueKey {
  /// Key of `value`, or `None` for arrays and lists, which are never shared.
  pub fn of(value: &Value) -> Option<ValueKey> {
    Some(match value {
      Value::Int(v) => ValueKey::Int(*v),
      Value::Long(v) => ValueKey::Long(*v),
      Value::Bool(v) => ValueKey::Bool(*v),
      Value::Double(v) => ValueKey::Double(v.to_bits()),
      Value::Str(v) => ValueKey::Str(v.clone()),
      Value::Enum { class, ordinal } => ValueKey::Enum(*class as *const EnumClass as usize, *ordinal),
      Value::Singleton(s) => ValueKey::Singleton(*s),
      Value::SourceSection(s) => ValueKey::Section(addr(s.source()), s.range()),
      Value::Node(v) => ValueKey::Ref(addr(v)),
      Value::CallTarget(v) => ValueKey::Ref(addr(v)),
      Value::FrameDescriptor(v) => ValueKey::Ref(addr(v)),
      Value::FrameSlot(v) => ValueKey::Ref(addr(v)),
      Value::Source(v) => ValueKey::Ref(addr(v)),
      Value::Context(v) => ValueKey::Ref(addr(v)),
      Value::FunctionData(v) => ValueKey::Ref(addr(v)),
      Value::JumpTarget(v) => ValueKey::Ref(addr(v)),
      Value::Opaque(v) => ValueKey::Ref(addr(v)),
      Value::Array { .. } | Value::List(_) => return None,
    })
  }

  fn is_address(&self) -> bool {
    matches!(self, ValueKey::Ref(_) | ValueKey::Section(..))
  }
}

/// Allocates value ids and maps recorded values back to them.
///
/// Address-keyed values are retained for the table's lifetime so an address can
/// never be reused by a different object while it is a key.
#[derive(Debug)]
pub struct ValueTable {
  ids: HashMap<ValueKey, ValueId>,
  retained: Vec<Value>,
  next: ValueId,
}

impl Default for ValueTable {
  fn default() -> Self {
    Self {
      ids: HashMap::default(),
      retained: Vec::new(),
      next: 1,
    }
  }
}

impl ValueTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn contains(&self, value: &Value) -> bool {
    self.get(value).is_some()
  }

  pub fn get(&self, value: &Value) -> Option<ValueId> {
    ValueKey::of(value).and_then(|k| self.ids.get(&k).copied())
  }

  /// Id of an already recorded value.
  pub fn require(&self, value: &Value) -> Result<ValueId, RecordError> {
    self
      .get(value)
      .ok_or_else(|| RecordError::UnrecordedValue(format!("{value:?}")))
  }

  /// Allocates an id for `value`. Unkeyed values always get a fresh id.
  pub fn put(&mut self, value: &Value) -> Result<ValueId, RecordError> {
    let key = ValueKey::of(value);
    if key.as_ref().is_some_and(|k| self.ids.contains_key(k)) {
      return Err(RecordError::DuplicatePut(format!("{value:?}")));
    };
    let id = self.fresh();
    if let Some(key) = key {
      if key.is_address() {
        self.retained.push(value.clone());
      };
      self.ids.insert(key, id);
    };
    Ok(id)
  }

  pub fn fresh(&mut self) -> ValueId {
    let id = self.next;
    self.next += 1;
    id
  }

  pub fn len(&self) -> usize {
    self.ids.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }
}
