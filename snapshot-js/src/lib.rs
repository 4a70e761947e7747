pub mod bytecode;
pub mod codec;
pub mod decode;
pub mod disasm;
pub mod encode;
pub mod error;
pub mod factory;
pub mod generate;
mod hash;
pub mod opt;
pub mod record;
pub mod runtime;
pub mod value;

pub use decode::BinarySnapshot;
pub use decode::NodeDecoder;
pub use disasm::disassemble;
pub use disasm::Disassembly;
pub use encode::NodeEncoder;
pub use error::DecodeError;
pub use error::EncodeError;
pub use error::FactoryError;
pub use error::RecordError;
pub use error::SnapshotError;
pub use factory::AstNode;
pub use factory::DispatchTable;
pub use factory::MethodId;
pub use factory::MethodKind;
pub use factory::MethodSig;
pub use factory::NodeFactory;
pub use factory::NodeRef;
pub use generate::generate_snapshots;
pub use generate::GenerateOptions;
pub use generate::GenerateReport;
pub use generate::SourceJob;
pub use generate::Translator;
pub use record::Recording;
pub use record::RecordingFactory;
pub use record::RecordingOptions;
pub use runtime::Context;
pub use runtime::Source;
pub use runtime::SourceSection;
pub use value::Singleton;
pub use value::Value;
pub use value::ValueType;

/// Records one translation of `source` and returns the encoded snapshot.
///
/// The translator drives a recording wrapper around `factory`; the resulting
/// trace is pruned, split into batches and serialised with the factory's
/// dispatch table.
pub fn snapshot<F: NodeFactory, T: Translator + ?Sized>(
  factory: F,
  translator: &T,
  context: &std::sync::Arc<Context>,
  source: &std::sync::Arc<Source>,
  options: RecordingOptions,
) -> Result<Vec<u8>, SnapshotError> {
  let recorder = RecordingFactory::new(factory, options);
  let root = translator.translate(&recorder, context, source)?;
  let (factory, mut recording) = recorder.into_parts();
  recording.set_source(source.clone());
  recording.finish(&Value::Node(root))?;
  Ok(recording.to_binary(factory.dispatch_table())?)
}
