//! The parts of the interpreter runtime that a snapshot captures and rebuilds.
//!
//! Only the externally observable state lives here: whatever the encoder needs
//! to describe an object and the decoder needs to construct an equivalent one.

use crate::error::DecodeError;
use crate::factory::NodeRef;
use crate::hash::stable_hash_bytes;
use crate::value::Value;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

/// Program text a recording was made from.
#[derive(Debug)]
pub struct Source {
  name: String,
  text: Arc<str>,
}

impl Source {
  pub fn new(name: impl Into<String>, text: impl Into<Arc<str>>) -> Arc<Source> {
    Arc::new(Source {
      name: name.into(),
      text: text.into(),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn text(&self) -> &str {
    &self.text
  }

  /// Length in UTF-8 bytes, as persisted in stream headers.
  pub fn len(&self) -> usize {
    self.text.len()
  }

  pub fn is_empty(&self) -> bool {
    self.text.is_empty()
  }

  pub fn hash(&self) -> u32 {
    stable_hash_bytes(self.text.as_bytes())
  }
}

/// Byte range within a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TextRange {
  pub start: u32,
  pub len: u32,
}

impl TextRange {
  pub fn new(start: u32, len: u32) -> Self {
    Self { start, len }
  }

  pub fn end(&self) -> u32 {
    self.start.saturating_add(self.len)
  }
}

/// A range of a source, or the unavailable section (`range == None`).
#[derive(Clone)]
pub struct SourceSection {
  source: Arc<Source>,
  range: Option<TextRange>,
}

impl SourceSection {
  pub fn new(source: Arc<Source>, start: u32, len: u32) -> Self {
    Self {
      source,
      range: Some(TextRange::new(start, len)),
    }
  }

  pub fn unavailable(source: Arc<Source>) -> Self {
    Self {
      source,
      range: None,
    }
  }

  /// Section described by a wire pair. Negative offsets, or a non-empty range
  /// into empty source text, denote the unavailable section.
  pub fn from_wire(source: Arc<Source>, index: i32, len: i32) -> Self {
    if index < 0 || len < 0 || (source.is_empty() && index as i64 + len as i64 > 0) {
      return Self::unavailable(source);
    };
    Self::new(source, index as u32, len as u32)
  }

  /// Wire pair for this section; `(-1, -1)` when unavailable.
  pub fn to_wire(&self) -> (i32, i32) {
    match self.range {
      Some(r) => (r.start as i32, r.len as i32),
      None => (-1, -1),
    }
  }

  pub fn source(&self) -> &Arc<Source> {
    &self.source
  }

  pub fn range(&self) -> Option<TextRange> {
    self.range
  }

  pub fn is_available(&self) -> bool {
    self.range.is_some()
  }

  pub fn text(&self) -> Option<&str> {
    let r = self.range?;
    self.source.text().get(r.start as usize..r.end() as usize)
  }
}

impl PartialEq for SourceSection {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.source, &other.source) && self.range == other.range
  }
}

impl fmt::Debug for SourceSection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.range {
      Some(r) => write!(f, "{}[{}+{}]", self.source.name(), r.start, r.len),
      None => write!(f, "{}[unavailable]", self.source.name()),
    }
  }
}

/// Execution context the decoder binds to reserved argument -1.
#[derive(Debug)]
pub struct Context {
  name: String,
}

impl Context {
  pub fn new(name: impl Into<String>) -> Arc<Context> {
    Arc::new(Context { name: name.into() })
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

/// Ordered list of frame slots of one function.
#[derive(Default)]
pub struct FrameDescriptor {
  slots: Mutex<Vec<Arc<FrameSlot>>>,
}

impl FrameDescriptor {
  pub fn new() -> Arc<FrameDescriptor> {
    Arc::new(FrameDescriptor::default())
  }

  pub fn add_slot(self: &Arc<Self>, identifier: Value, flags: i32) -> Arc<FrameSlot> {
    let mut slots = self.slots.lock();
    let slot = Arc::new(FrameSlot {
      descriptor: Arc::downgrade(self),
      identifier,
      flags,
      index: slots.len(),
      find_or_add: false,
    });
    slots.push(slot.clone());
    slot
  }

  pub fn find_slot(&self, identifier: &Value) -> Option<Arc<FrameSlot>> {
    self
      .slots
      .lock()
      .iter()
      .find(|s| s.identifier.same(identifier))
      .cloned()
  }

  pub fn find_or_add_slot(self: &Arc<Self>, identifier: Value, flags: i32) -> Arc<FrameSlot> {
    let mut slots = self.slots.lock();
    if let Some(slot) = slots.iter().find(|s| s.identifier.same(&identifier)) {
      return slot.clone();
    };
    let slot = Arc::new(FrameSlot {
      descriptor: Arc::downgrade(self),
      identifier,
      flags,
      index: slots.len(),
      find_or_add: true,
    });
    slots.push(slot.clone());
    slot
  }

  pub fn slots(&self) -> Vec<Arc<FrameSlot>> {
    self.slots.lock().clone()
  }

  pub fn len(&self) -> usize {
    self.slots.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl fmt::Debug for FrameDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list().entries(self.slots().iter()).finish()
  }
}

pub struct FrameSlot {
  descriptor: Weak<FrameDescriptor>,
  identifier: Value,
  flags: i32,
  index: usize,
  find_or_add: bool,
}

impl FrameSlot {
  pub fn descriptor(&self) -> Option<Arc<FrameDescriptor>> {
    self.descriptor.upgrade()
  }

  pub fn identifier(&self) -> &Value {
    &self.identifier
  }

  pub fn flags(&self) -> i32 {
    self.flags
  }

  pub fn index(&self) -> usize {
    self.index
  }

  /// Whether the slot was created through `find_or_add_slot`.
  pub fn find_or_add(&self) -> bool {
    self.find_or_add
  }
}

impl fmt::Debug for FrameSlot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FrameSlot")
      .field("index", &self.index)
      .field("identifier", &self.identifier)
      .field("flags", &self.flags)
      .finish()
  }
}

/// Deferred body builder installed on a `FunctionData`.
pub type LazyInit = Box<dyn FnOnce(&FunctionData) -> Result<Value, DecodeError> + Send>;

enum LazyState {
  Idle,
  Pending(LazyInit),
  Failed(DecodeError),
}

/// Per-function metadata. The body root may be attached eagerly with
/// `set_root` or produced on first use by a lazy initializer.
pub struct FunctionData {
  context: Arc<Context>,
  length: i32,
  name: Mutex<String>,
  flags: i32,
  root: OnceCell<Value>,
  lazy: Mutex<LazyState>,
}

impl FunctionData {
  pub fn new(context: Arc<Context>, length: i32, name: impl Into<String>, flags: i32) -> Arc<Self> {
    Arc::new(FunctionData {
      context,
      length,
      name: Mutex::new(name.into()),
      flags,
      root: OnceCell::new(),
      lazy: Mutex::new(LazyState::Idle),
    })
  }

  pub fn context(&self) -> &Arc<Context> {
    &self.context
  }

  pub fn length(&self) -> i32 {
    self.length
  }

  pub fn name(&self) -> String {
    self.name.lock().clone()
  }

  pub fn set_name(&self, name: impl Into<String>) {
    *self.name.lock() = name.into();
  }

  pub fn flags(&self) -> i32 {
    self.flags
  }

  pub fn set_lazy_init(&self, init: LazyInit) {
    *self.lazy.lock() = LazyState::Pending(init);
  }

  pub fn has_lazy_init(&self) -> bool {
    matches!(*self.lazy.lock(), LazyState::Pending(_))
  }

  /// Returns false if a root was already attached.
  pub fn set_root(&self, root: Value) -> bool {
    self.root.set(root).is_ok()
  }

  /// The body root, running the pending lazy initializer first.
  ///
  /// The initializer runs at most once even if several threads ask at the same
  /// time: later callers block until it finishes and then observe its result. A
  /// failed initializer is not retried; its error is returned to every caller.
  /// The initializer must not call `root` on the same function data.
  pub fn root(&self) -> Result<Option<Value>, DecodeError> {
    let mut lazy = self.lazy.lock();
    match std::mem::replace(&mut *lazy, LazyState::Idle) {
      LazyState::Idle => {}
      LazyState::Pending(init) => match init(self) {
        Ok(root) => {
          let _ = self.root.set(root);
        }
        Err(err) => {
          *lazy = LazyState::Failed(err.clone());
          return Err(err);
        }
      },
      LazyState::Failed(err) => {
        *lazy = LazyState::Failed(err.clone());
        return Err(err);
      }
    };
    Ok(self.root.get().cloned())
  }
}

impl fmt::Debug for FunctionData {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FunctionData")
      .field("name", &self.name())
      .field("length", &self.length)
      .field("flags", &self.flags)
      .field("lazy", &self.has_lazy_init())
      .finish()
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum JumpTargetKind {
  /// `break label`.
  Label,
  /// Unlabelled `break` out of a switch or loop.
  Switch,
  /// `continue label`.
  ContinueLoop,
  /// Unlabelled `continue`.
  ContinueUnlabeledLoop,
}

impl JumpTargetKind {
  pub fn code(self) -> i32 {
    match self {
      JumpTargetKind::Label => 1,
      JumpTargetKind::Switch => 2,
      JumpTargetKind::ContinueLoop => 3,
      JumpTargetKind::ContinueUnlabeledLoop => 4,
    }
  }

  pub fn from_code(code: i32) -> Option<Self> {
    match code {
      1 => Some(JumpTargetKind::Label),
      2 => Some(JumpTargetKind::Switch),
      3 => Some(JumpTargetKind::ContinueLoop),
      4 => Some(JumpTargetKind::ContinueUnlabeledLoop),
      _ => None,
    }
  }
}

#[derive(Debug)]
pub struct JumpTarget {
  kind: JumpTargetKind,
}

impl JumpTarget {
  pub fn new(kind: JumpTargetKind) -> Self {
    Self { kind }
  }

  pub fn kind(&self) -> JumpTargetKind {
    self.kind
  }
}

/// Callable wrapper around a function root node.
#[derive(Debug)]
pub struct CallTarget {
  root: NodeRef,
}

impl CallTarget {
  pub fn new(root: NodeRef) -> Self {
    Self { root }
  }

  pub fn root(&self) -> &NodeRef {
    &self.root
  }
}

/// Instrumentation tags of a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Tags {
  pub statement: bool,
  pub call: bool,
  pub expression: bool,
  pub root_body: bool,
}

impl Tags {
  pub fn is_empty(&self) -> bool {
    !(self.statement || self.call || self.expression || self.root_body)
  }

  pub fn union(self, other: Tags) -> Tags {
    Tags {
      statement: self.statement || other.statement,
      call: self.call || other.call,
      expression: self.expression || other.expression,
      root_body: self.root_body || other.root_body,
    }
  }
}
