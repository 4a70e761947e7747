#[path = "common/mod.rs"]
mod common;

use common::decode;
use common::record;
use common::Recorded;
use common::TestFactory;
use snapshot_js::bytecode::Bytecode;
use snapshot_js::bytecode::MAGIC;
use snapshot_js::codec::BinaryEncoder;
use snapshot_js::Context;
use snapshot_js::DecodeError;
use snapshot_js::FactoryError;
use snapshot_js::NodeDecoder;
use snapshot_js::NodeFactory;
use snapshot_js::RecordingOptions;
use snapshot_js::Source;
use std::sync::Arc;

fn simple() -> Recorded {
  record("(+ 1 2)", RecordingOptions::default())
}

fn decode_bytes(bytes: Vec<u8>, source: &Arc<Source>) -> Result<snapshot_js::Value, DecodeError> {
  NodeDecoder::new(bytes, Arc::new(TestFactory), Context::new("ctx"), source.clone()).decode()
}

/// A header that passes every check for `source`.
fn header(source: &Source) -> BinaryEncoder {
  let mut enc = BinaryEncoder::new();
  enc.put_i32(MAGIC);
  enc.put_i32(TestFactory.dispatch_table().checksum());
  enc.put_i32(source.len() as i32);
  enc.put_i32(source.hash() as i32);
  enc
}

#[test]
fn bad_magic() {
  let mut recorded = simple();
  recorded.bytes[0] ^= 0xff;
  assert!(matches!(decode(&recorded), Err(DecodeError::BadMagic(_))));
}

#[test]
fn checksum_mismatch() {
  let mut recorded = simple();
  recorded.bytes[4] ^= 1;
  let expected = TestFactory.dispatch_table().checksum();
  assert!(matches!(
    decode(&recorded),
    Err(DecodeError::ChecksumMismatch { expected: e, .. }) if e == expected
  ));
}

#[test]
fn source_mismatch() {
  let recorded = simple();
  let other = Source::new("other.sx", "(+ 1 3)");
  assert!(matches!(
    decode_bytes(recorded.bytes.clone(), &other),
    Err(DecodeError::SourceMismatch { .. })
  ));
  let longer = Source::new("longer.sx", "(+ 1 2) ");
  assert!(matches!(
    decode_bytes(recorded.bytes, &longer),
    Err(DecodeError::SourceMismatch { .. })
  ));
}

#[test]
fn unknown_opcode() {
  let source = Source::new("s.sx", "");
  let mut enc = header(&source);
  enc.put_uint(2);
  enc.put_uint(99);
  assert!(matches!(
    decode_bytes(enc.into_bytes(), &source),
    Err(DecodeError::UnknownOpcode(99))
  ));
}

#[test]
fn truncated_streams() {
  let recorded = simple();
  let mut bytes = recorded.bytes.clone();
  bytes.truncate(bytes.len() - 1);
  assert!(matches!(
    decode_bytes(bytes, &recorded.source),
    Err(DecodeError::UnexpectedEnd)
  ));

  let mut bytes = recorded.bytes.clone();
  bytes.truncate(bytes.len() - 2);
  assert!(matches!(
    decode_bytes(bytes, &recorded.source),
    Err(DecodeError::MissingReturn) | Err(DecodeError::Malformed(_))
  ));

  let bytes = recorded.bytes[..8].to_vec();
  assert!(matches!(
    decode_bytes(bytes, &recorded.source),
    Err(DecodeError::UnexpectedEnd)
  ));
}

#[test]
fn missing_return() {
  let source = Source::new("s.sx", "");
  let mut enc = header(&source);
  enc.put_uint(2);
  enc.put_uint(Bytecode::LdcInt.code());
  enc.put_int(5);
  enc.put_uint(1);
  enc.put_uint(Bytecode::Nop.code());
  assert!(matches!(
    decode_bytes(enc.into_bytes(), &source),
    Err(DecodeError::MissingReturn)
  ));
}

#[test]
fn register_out_of_range() {
  let source = Source::new("s.sx", "");
  let mut enc = header(&source);
  enc.put_uint(2);
  enc.put_uint(Bytecode::LdcInt.code());
  enc.put_int(5);
  enc.put_uint(7);
  enc.put_uint(Bytecode::Return.code());
  enc.put_uint(1);
  assert!(matches!(
    decode_bytes(enc.into_bytes(), &source),
    Err(DecodeError::BadRegister { reg: 7, .. })
  ));
}

#[test]
fn factory_errors_abort_the_decode() {
  let source = Source::new("s.sx", "");
  let string = TestFactory.dispatch_table().method_id("string").unwrap();
  let mut enc = header(&source);
  enc.put_uint(3);
  enc.put_uint(Bytecode::LdcInt.code());
  enc.put_int(5);
  enc.put_uint(1);
  enc.put_uint(Bytecode::Node.code());
  enc.put_uint(string as u64);
  enc.put_int(1);
  enc.put_uint(1);
  enc.put_uint(2);
  enc.put_uint(Bytecode::Return.code());
  enc.put_uint(2);
  assert!(matches!(
    decode_bytes(enc.into_bytes(), &source),
    Err(DecodeError::Factory(FactoryError::BadArgument {
      method: "string",
      ..
    }))
  ));
}

#[test]
fn argument_count_is_checked() {
  let source = Source::new("s.sx", "");
  let add = TestFactory.dispatch_table().method_id("add").unwrap();
  let mut enc = header(&source);
  enc.put_uint(2);
  enc.put_uint(Bytecode::Node.code());
  enc.put_uint(add as u64);
  enc.put_int(0);
  enc.put_uint(1);
  enc.put_uint(Bytecode::Return.code());
  enc.put_uint(1);
  assert!(matches!(
    decode_bytes(enc.into_bytes(), &source),
    Err(DecodeError::ArgumentCount {
      method: "add",
      expected: 2,
      actual: 0
    })
  ));
}

#[test]
fn failed_lazy_body_reports_on_every_access() {
  let recorded = record("(fn f () 1)", RecordingOptions::default());
  let dis = snapshot_js::disassemble(&recorded.bytes).unwrap();
  // Cut the stream right after the entry batch so the body's position dangles.
  let entry_end = dis.methods[1].offset;
  let mut bytes = recorded.bytes[..entry_end].to_vec();
  bytes.push(0);
  let root = decode_bytes(bytes, &recorded.source).unwrap();
  let root = root.as_node().unwrap();
  let common::Kind::Program(_, items) = &common::expr(root).kind else {
    panic!("expected a program");
  };
  let common::Kind::FunctionExpr(data) = &common::expr(&items[0]).kind else {
    panic!("expected a function expression");
  };
  assert!(data.root().is_err());
  assert!(data.root().is_err());
}
