#[path = "common/mod.rs"]
mod common;

use common::decode;
use common::expr;
use common::record;
use common::same_tree;
use common::Kind;
use common::SexprTranslator;
use common::TestFactory;
use snapshot_js::bytecode::Bytecode;
use snapshot_js::disasm::Operand;
use snapshot_js::disassemble;
use snapshot_js::AstNode;
use snapshot_js::Context;
use snapshot_js::NodeDecoder;
use snapshot_js::NodeFactory;
use snapshot_js::RecordingFactory;
use snapshot_js::RecordingOptions;
use snapshot_js::Source;
use snapshot_js::Value;
use std::sync::Arc;

fn sum_recording(with_unused_call: bool) -> (snapshot_js::Recording, Value, Arc<Source>) {
  let source = Source::new("sum.js", "42 + 7");
  let recorder = RecordingFactory::new(TestFactory, RecordingOptions::default());
  if with_unused_call {
    recorder.call("string", vec![Value::str("unused")]).unwrap();
  };
  let result = recorder
    .call("sum", vec![Value::Int(42), Value::Int(7)])
    .unwrap();
  let mut recording = recorder.into_recording();
  recording.set_source(source.clone());
  recording.finish(&result).unwrap();
  (recording, result, source)
}

#[test]
fn sum_of_two_constants_round_trips() {
  let (recording, _, source) = sum_recording(false);
  assert_eq!(recording.insts().len(), 4);
  assert_eq!(recording.stats().dead, 0);
  assert_eq!(recording.batches().len(), 1);

  let bytes = recording.to_binary(TestFactory.dispatch_table()).unwrap();
  let decoded = NodeDecoder::new(bytes, Arc::new(TestFactory), Context::new("ctx"), source)
    .decode()
    .unwrap();
  let direct = TestFactory
    .call("sum", vec![Value::Int(42), Value::Int(7)])
    .unwrap();
  assert!(same_tree(decoded.as_node().unwrap(), direct.as_node().unwrap()));
  assert!(matches!(expr(decoded.as_node().unwrap()).kind, Kind::Sum(42, 7)));
}

#[test]
fn shared_string_constant_is_loaded_once() {
  let recorded = record(r#"(+ "x" "x")"#, RecordingOptions::default());
  let dis = disassemble(&recorded.bytes).unwrap();
  assert_eq!(dis.count(Bytecode::LdcString), 1);

  let string = TestFactory.dispatch_table().method_id("string").unwrap() as u64;
  let inputs = dis
    .records()
    .filter(|r| r.opcode == Bytecode::Node && r.operands[0] == Operand::Method(string))
    .map(|r| r.operands[2].clone())
    .collect::<Vec<_>>();
  assert_eq!(inputs.len(), 2);
  assert_eq!(inputs[0], inputs[1]);

  let json = serde_json::to_value(&dis).unwrap();
  let records = json["methods"][0]["records"].as_array().unwrap();
  assert!(records.iter().any(|r| r["opcode"] == "LDC_STRING"));

  let decoded = decode(&recorded).unwrap();
  assert!(same_tree(&recorded.root, &decoded));
}

#[test]
fn unrelated_side_call_is_dropped() {
  let (recording, _, _) = sum_recording(true);
  assert_eq!(recording.stats().recorded, 6);
  assert_eq!(recording.stats().dead, 2);
  assert_eq!(recording.insts().len(), 4);

  let bytes = recording.to_binary(TestFactory.dispatch_table()).unwrap();
  let dis = disassemble(&bytes).unwrap();
  assert_eq!(dis.count(Bytecode::Node), 1);
  assert_eq!(dis.count(Bytecode::LdcString), 0);
}

#[test]
fn snapshot_then_apply() {
  let source = Source::new("prog.sx", r#"(do 1 (neg 2) (stmt "s") undefined null (break))"#);
  let context = Context::new("ctx");
  let bytes = snapshot_js::snapshot(
    TestFactory,
    &SexprTranslator,
    &context,
    &source,
    RecordingOptions::default(),
  )
  .unwrap();

  let snapshot = snapshot_js::BinarySnapshot::new(bytes);
  let root = snapshot
    .apply(Arc::new(TestFactory), context.clone(), source.clone())
    .unwrap();
  let root = root.as_node().unwrap();
  let Kind::Program(section, items) = &expr(root).kind else {
    panic!("expected a program");
  };
  assert_eq!(section.text(), Some(source.text()));
  assert_eq!(items.len(), 1);
  let Kind::Block(children) = &expr(&items[0]).kind else {
    panic!("expected a block");
  };
  assert_eq!(children.len(), 6);
  assert!(expr(&children[1]).tags().expression);
  assert!(expr(&children[2]).is_statement());
  assert_eq!(
    children[2].source_section().and_then(|s| s.text().map(str::to_string)).as_deref(),
    Some("(stmt \"s\")")
  );
  assert!(matches!(
    &expr(&children[3]).kind,
    Kind::Constant(Value::Singleton(snapshot_js::Singleton::Undefined))
  ));
}

#[test]
fn unavailable_sections_survive_the_round_trip() {
  let source = Source::new("empty.js", "");
  let recorder = RecordingFactory::new(TestFactory, RecordingOptions::default());
  let node = recorder.call("number", vec![Value::Int(1)]).unwrap();
  let node = node.as_node().unwrap().clone();
  node.set_source_section(snapshot_js::SourceSection::unavailable(source.clone()));
  let mut recording = recorder.into_recording();
  recording.finish(&Value::Node(node)).unwrap();
  assert!(Arc::ptr_eq(recording.source().unwrap(), &source));

  let bytes = recording.to_binary(TestFactory.dispatch_table()).unwrap();
  let decoded = NodeDecoder::new(bytes, Arc::new(TestFactory), Context::new("ctx"), source)
    .decode()
    .unwrap();
  let section = decoded.as_node().unwrap().source_section().unwrap();
  assert!(!section.is_available());
}

#[test]
fn text_dump_lists_every_batch() {
  let recorded = record(
    r#"(fn outer (a) (+ (var a) (fn inner () "x")))"#,
    RecordingOptions::default(),
  );
  let text = recorded.recording.to_text("test.sx");
  assert!(text.starts_with("// Snapshot of test.sx"));
  assert!(text.contains("fn apply(factory: &dyn NodeFactory"));
  assert_eq!(text.matches("\nfn ").count(), 3);
  assert!(text.contains("set_lazy_init"));
  assert!(text.contains("factory.function_root("));
  assert!(text.contains("// FunctionData"));
  assert!(text.contains("// FrameDescriptor"));
}

#[test]
fn failed_factory_call_leaves_no_open_frame() {
  let recorder = RecordingFactory::new(TestFactory, RecordingOptions::default());
  assert!(matches!(
    recorder.call("string", vec![Value::Int(1)]),
    Err(snapshot_js::FactoryError::BadArgument { method: "string", .. })
  ));
  let result = recorder
    .call("sum", vec![Value::Int(1), Value::Int(2)])
    .unwrap();
  let mut recording = recorder.into_recording();
  recording.set_source(Source::new("sum.js", "1 + 2"));
  recording.finish(&result).unwrap();
  assert_eq!(recording.batches().len(), 1);
}
