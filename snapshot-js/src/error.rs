use crate::value::ValueId;

/// Errors raised while recording a factory-call trace, pruning it, or splitting it
/// into batches. None of them are recoverable: the recording is abandoned and no
/// partial snapshot is produced.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RecordError {
  /// A value reached the recorder that has no instruction representation.
  #[error("unsupported value: {0}")]
  UnsupportedValue(String),

  #[error("value id {0} is already assigned")]
  DuplicateId(ValueId),

  #[error("value is already present in the value table: {0}")]
  DuplicatePut(String),

  /// A reference value was used as an argument before any call produced it.
  #[error("value was never recorded: {0}")]
  UnrecordedValue(String),

  #[error("unbalanced factory call: expected return from `{expected}`, got `{actual}`")]
  UnbalancedCall {
    expected: &'static str,
    actual: &'static str,
  },

  #[error("frame slot is not owned by any frame descriptor")]
  OrphanFrameSlot,

  #[error("fix-up method `{0}` was called without a target argument")]
  MissingFixUpTarget(&'static str),

  #[error("recording has no source")]
  MissingSource,

  #[error("recording has already been finished")]
  AlreadyFinished,

  #[error("recording finished with {0} factory calls still open")]
  OpenCalls(usize),

  /// The batching pass violated one of its own invariants.
  #[error("internal error: {0}")]
  Internal(String),
}

/// Errors raised while serialising batches to a binary stream.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EncodeError {
  #[error("extracted method `{0}` was resolved twice")]
  AlreadyResolved(String),

  #[error("call to extracted method `{0}` was never resolved")]
  UnresolvedReference(String),

  #[error("register {reg} exceeds the limit {limit} of `{batch}`")]
  RegisterOverflow { batch: String, reg: u32, limit: u32 },

  #[error("class `{0}` is not in the dispatch table")]
  UnsupportedClass(String),

  #[error("method `{0}` is not in the dispatch table")]
  UnknownMethod(&'static str),

  #[error("internal error: {0}")]
  Internal(String),
}

/// Errors raised while replaying a binary stream. Every decode error aborts the
/// whole decode; a partially built tree is never returned.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
  #[error("bad magic number {0:#010x}")]
  BadMagic(i32),

  #[error("dispatch table checksum mismatch: stream has {actual:#010x}, decoder has {expected:#010x}")]
  ChecksumMismatch { expected: i32, actual: i32 },

  #[error("source mismatch: stream was recorded from {actual_len} bytes (hash {actual_hash:#010x}), got {expected_len} bytes (hash {expected_hash:#010x})")]
  SourceMismatch {
    expected_len: i32,
    expected_hash: i32,
    actual_len: i32,
    actual_hash: i32,
  },

  #[error("unknown opcode {0}")]
  UnknownOpcode(u64),

  #[error("unexpected end of buffer")]
  UnexpectedEnd,

  #[error("reached end of buffer without return")]
  MissingReturn,

  #[error("malformed stream: {0}")]
  Malformed(&'static str),

  #[error("register {reg} is out of range (limit {limit})")]
  BadRegister { reg: u64, limit: usize },

  #[error("argument index {0} is out of range")]
  BadArgument(i32),

  #[error("position {0} is outside the buffer")]
  BadPosition(i32),

  #[error("unknown method id {0}")]
  UnknownMethod(u64),

  #[error("method `{method}` takes {expected} arguments, stream passes {actual}")]
  ArgumentCount {
    method: &'static str,
    expected: usize,
    actual: usize,
  },

  #[error("expected {expected} operand, found {actual}")]
  UnexpectedOperand {
    expected: &'static str,
    actual: &'static str,
  },

  #[error("unknown class index {0}")]
  UnknownClass(i32),

  #[error("unknown singleton index {0}")]
  UnknownSingleton(i32),

  #[error("enum `{class}` has no constant with ordinal {ordinal}")]
  UnknownEnumConstant { class: &'static str, ordinal: i32 },

  #[error("unknown jump target kind {0}")]
  UnknownJumpTarget(i32),

  #[error("extracted calls nest deeper than {0}")]
  TooDeep(usize),

  #[error(transparent)]
  Factory(#[from] FactoryError),
}

/// Errors returned by node factories.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FactoryError {
  #[error("unknown method id {0}")]
  UnknownMethod(u32),

  #[error("unknown method `{0}`")]
  UnknownMethodName(String),

  #[error("`{method}` argument {index}: expected {expected}")]
  BadArgument {
    method: &'static str,
    index: usize,
    expected: &'static str,
  },

  #[error("{0}")]
  Failed(String),

  /// The recording wrapper rejected the call.
  #[error(transparent)]
  Record(#[from] RecordError),
}

/// Umbrella error for the end-to-end snapshot pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SnapshotError {
  #[error(transparent)]
  Record(#[from] RecordError),

  #[error(transparent)]
  Encode(#[from] EncodeError),

  #[error(transparent)]
  Decode(#[from] DecodeError),

  #[error(transparent)]
  Factory(#[from] FactoryError),

  /// The driving translator failed before it produced a root node.
  #[error("translation failed: {0}")]
  Translate(String),

  #[error("cannot build worker pool: {0}")]
  Pool(String),
}
