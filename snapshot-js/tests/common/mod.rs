#![allow(dead_code)]

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use snapshot_js::runtime::FrameDescriptor;
use snapshot_js::runtime::FrameSlot;
use snapshot_js::runtime::FunctionData;
use snapshot_js::runtime::JumpTarget;
use snapshot_js::runtime::JumpTargetKind;
use snapshot_js::runtime::Tags;
use snapshot_js::value::EnumClass;
use snapshot_js::AstNode;
use snapshot_js::Context;
use snapshot_js::DispatchTable;
use snapshot_js::FactoryError;
use snapshot_js::MethodId;
use snapshot_js::MethodSig;
use snapshot_js::NodeDecoder;
use snapshot_js::NodeFactory;
use snapshot_js::NodeRef;
use snapshot_js::Recording;
use snapshot_js::RecordingFactory;
use snapshot_js::RecordingOptions;
use snapshot_js::SnapshotError;
use snapshot_js::Source;
use snapshot_js::SourceSection;
use snapshot_js::Translator;
use snapshot_js::Value;
use snapshot_js::ValueType;
use std::any::Any;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub static OPERATOR: EnumClass = EnumClass {
  name: "Operator",
  constants: &["Neg", "Not"],
};

static UNARY_PARAMS: [ValueType; 2] = [ValueType::Enum(&OPERATOR), ValueType::Node];

static TABLE: Lazy<DispatchTable> = Lazy::new(|| {
  use ValueType as T;
  DispatchTable::new(
    vec![
      MethodSig::create("add", &[T::Node, T::Node], T::Node),
      MethodSig::create("string", &[T::Str], T::Node),
      MethodSig::create("number", &[T::Int], T::Node),
      MethodSig::create("block", &[T::Array(&T::Node)], T::Node),
      MethodSig::create("sequence", &[T::List(&T::Node)], T::Node),
      MethodSig::create("unary", &UNARY_PARAMS, T::Node),
      MethodSig::create("constant", &[T::Object], T::Node),
      MethodSig::create("read_var", &[T::FrameSlot], T::Node),
      MethodSig::create("jump", &[T::JumpTarget], T::Node),
      MethodSig::create(
        "function_root",
        &[T::FunctionData, T::FrameDescriptor, T::Node],
        T::FunctionRoot,
      ),
      MethodSig::create("function_expr", &[T::FunctionData, T::FunctionRoot], T::Node),
      MethodSig::create("program", &[T::SourceSection, T::List(&T::Node)], T::Node),
      MethodSig::fix_up("mark_statement", &[T::Node]),
      MethodSig::create("sum", &[T::Int, T::Int], T::Node),
      MethodSig::create("function_ref", &[T::FunctionData], T::Node),
    ],
    vec![UNARY_PARAMS[0], T::Node],
  )
});

#[derive(Debug)]
pub enum Kind {
  Add(NodeRef, NodeRef),
  Sum(i32, i32),
  Str(String),
  Num(i32),
  Block(Vec<NodeRef>),
  Sequence(Vec<NodeRef>),
  Unary(u32, NodeRef),
  Constant(Value),
  ReadVar(Arc<FrameSlot>),
  Jump(JumpTargetKind),
  FunctionRoot {
    data: Arc<FunctionData>,
    body: NodeRef,
  },
  FunctionExpr(Arc<FunctionData>),
  FunctionRef(Arc<FunctionData>),
  Program(SourceSection, Vec<NodeRef>),
}

#[derive(Debug)]
pub struct Expr {
  pub kind: Kind,
  section: Mutex<Option<SourceSection>>,
  tags: Mutex<Tags>,
  statement: AtomicBool,
}

impl Expr {
  fn new(kind: Kind) -> Self {
    Self {
      kind,
      section: Mutex::new(None),
      tags: Mutex::new(Tags::default()),
      statement: AtomicBool::new(false),
    }
  }

  pub fn is_statement(&self) -> bool {
    self.statement.load(Ordering::SeqCst)
  }
}

impl AstNode for Expr {
  fn as_any(&self) -> &dyn Any {
    self
  }

  fn display_name(&self) -> Option<String> {
    match &self.kind {
      Kind::FunctionRoot { data, .. } => Some(data.name()),
      _ => None,
    }
  }

  fn source_section(&self) -> Option<SourceSection> {
    self.section.lock().clone()
  }

  fn set_source_section(&self, section: SourceSection) {
    *self.section.lock() = Some(section);
  }

  fn tags(&self) -> Tags {
    *self.tags.lock()
  }

  fn add_tags(&self, tags: Tags) {
    let mut current = self.tags.lock();
    *current = current.union(tags);
  }
}

pub fn expr(node: &NodeRef) -> &Expr {
  node
    .as_any()
    .downcast_ref::<Expr>()
    .expect("test factory node")
}

fn node(kind: Kind) -> Value {
  Value::Node(Arc::new(Expr::new(kind)))
}

fn bad(method: &'static str, index: usize, expected: &'static str) -> FactoryError {
  FactoryError::BadArgument {
    method,
    index,
    expected,
  }
}

fn node_arg(method: &'static str, args: &[Value], index: usize) -> Result<NodeRef, FactoryError> {
  args
    .get(index)
    .and_then(|v| v.as_node().cloned())
    .ok_or_else(|| bad(method, index, "node"))
}

fn nodes_arg(method: &'static str, items: &[Value]) -> Result<Vec<NodeRef>, FactoryError> {
  items
    .iter()
    .enumerate()
    .map(|(i, v)| v.as_node().cloned().ok_or_else(|| bad(method, i, "node")))
    .collect()
}

fn data_arg(method: &'static str, args: &[Value]) -> Result<Arc<FunctionData>, FactoryError> {
  args
    .first()
    .and_then(|v| v.as_function_data().cloned())
    .ok_or_else(|| bad(method, 0, "function data"))
}

/// Builds `Expr` trees.
pub struct TestFactory;

impl NodeFactory for TestFactory {
  fn dispatch_table(&self) -> &DispatchTable {
    &TABLE
  }

  fn invoke(&self, method: MethodId, args: Vec<Value>) -> Result<Value, FactoryError> {
    let sig = TABLE.method(method).ok_or(FactoryError::UnknownMethod(method))?;
    let name = sig.name;
    Ok(match name {
      "add" => node(Kind::Add(node_arg(name, &args, 0)?, node_arg(name, &args, 1)?)),
      "sum" => match (args.first(), args.get(1)) {
        (Some(Value::Int(a)), Some(Value::Int(b))) => node(Kind::Sum(*a, *b)),
        _ => return Err(bad(name, 0, "two ints")),
      },
      "string" => match args.first() {
        Some(Value::Str(s)) => node(Kind::Str(s.to_string())),
        _ => return Err(bad(name, 0, "string")),
      },
      "number" => match args.first() {
        Some(Value::Int(v)) => node(Kind::Num(*v)),
        _ => return Err(bad(name, 0, "int")),
      },
      "block" => match args.first() {
        Some(Value::Array { items, .. }) => node(Kind::Block(nodes_arg(name, items)?)),
        _ => return Err(bad(name, 0, "array")),
      },
      "sequence" => match args.first() {
        Some(Value::List(items)) => node(Kind::Sequence(nodes_arg(name, items)?)),
        _ => return Err(bad(name, 0, "list")),
      },
      "unary" => match args.first() {
        Some(Value::Enum { ordinal, .. }) => node(Kind::Unary(*ordinal, node_arg(name, &args, 1)?)),
        _ => return Err(bad(name, 0, "operator")),
      },
      "constant" => node(Kind::Constant(
        args.first().cloned().ok_or_else(|| bad(name, 0, "value"))?,
      )),
      "read_var" => match args.first() {
        Some(Value::FrameSlot(slot)) => node(Kind::ReadVar(slot.clone())),
        _ => return Err(bad(name, 0, "frame slot")),
      },
      "jump" => match args.first() {
        Some(Value::JumpTarget(target)) => node(Kind::Jump(target.kind())),
        _ => return Err(bad(name, 0, "jump target")),
      },
      "function_root" => {
        let data = data_arg(name, &args)?;
        if args.get(1).and_then(|v| v.as_frame_descriptor()).is_none() {
          return Err(bad(name, 1, "frame descriptor"));
        };
        node(Kind::FunctionRoot {
          data,
          body: node_arg(name, &args, 2)?,
        })
      }
      "function_expr" => {
        let data = data_arg(name, &args)?;
        // A lazily replayed body arrives as absent and is built on first use.
        match args.get(1) {
          Some(root @ Value::Node(_)) => {
            data.set_root(root.clone());
          }
          Some(v) if v.is_absent() => {}
          _ => return Err(bad(name, 1, "function root")),
        };
        node(Kind::FunctionExpr(data))
      }
      "function_ref" => node(Kind::FunctionRef(data_arg(name, &args)?)),
      "program" => match (args.first(), args.get(1)) {
        (Some(Value::SourceSection(section)), Some(Value::List(items))) => {
          node(Kind::Program(section.clone(), nodes_arg(name, items)?))
        }
        _ => return Err(bad(name, 0, "section and list")),
      },
      "mark_statement" => {
        expr(&node_arg(name, &args, 0)?)
          .statement
          .store(true, Ordering::SeqCst);
        Value::ABSENT
      }
      _ => return Err(FactoryError::UnknownMethod(method)),
    })
  }
}

fn same_nodes(a: &[NodeRef], b: &[NodeRef]) -> bool {
  a.len() == b.len() && a.iter().zip(b).all(|(a, b)| same_tree(a, b))
}

/// Structural comparison. Function bodies are forced before their names are
/// compared, since a lazily replayed body carries the name fix-up.
pub fn same_tree(a: &NodeRef, b: &NodeRef) -> bool {
  let (a, b) = (expr(a), expr(b));
  let section = |e: &Expr| e.source_section().map(|s| s.range());
  if section(a) != section(b) || a.tags() != b.tags() || a.is_statement() != b.is_statement() {
    return false;
  };
  match (&a.kind, &b.kind) {
    (Kind::Add(a1, a2), Kind::Add(b1, b2)) => same_tree(a1, b1) && same_tree(a2, b2),
    (Kind::Sum(a1, a2), Kind::Sum(b1, b2)) => a1 == b1 && a2 == b2,
    (Kind::Str(a), Kind::Str(b)) => a == b,
    (Kind::Num(a), Kind::Num(b)) => a == b,
    (Kind::Block(a), Kind::Block(b)) | (Kind::Sequence(a), Kind::Sequence(b)) => same_nodes(a, b),
    (Kind::Unary(oa, a), Kind::Unary(ob, b)) => oa == ob && same_tree(a, b),
    (Kind::Constant(a), Kind::Constant(b)) => a.same(b),
    (Kind::ReadVar(a), Kind::ReadVar(b)) => {
      a.index() == b.index() && a.flags() == b.flags() && a.identifier().same(b.identifier())
    }
    (Kind::Jump(a), Kind::Jump(b)) => a == b,
    (
      Kind::FunctionRoot {
        data: da,
        body: ba,
      },
      Kind::FunctionRoot {
        data: db,
        body: bb,
      },
    ) => da.name() == db.name() && same_tree(ba, bb),
    (Kind::FunctionExpr(a), Kind::FunctionExpr(b)) => {
      let roots = match (a.root(), b.root()) {
        (Ok(Some(Value::Node(ra))), Ok(Some(Value::Node(rb)))) => same_tree(&ra, &rb),
        _ => false,
      };
      roots && a.name() == b.name() && a.length() == b.length() && a.flags() == b.flags()
    }
    // Forcing the referenced body here could re-enter one that is being built.
    (Kind::FunctionRef(a), Kind::FunctionRef(b)) => a.length() == b.length(),
    (Kind::Program(sa, a), Kind::Program(sb, b)) => sa.range() == sb.range() && same_nodes(a, b),
    _ => false,
  }
}

#[derive(Debug)]
enum Sx {
  Sym(String, u32, u32),
  Str(String, u32, u32),
  Int(i32, u32, u32),
  List(Vec<Sx>, u32, u32),
}

impl Sx {
  fn span(&self) -> (u32, u32) {
    match self {
      Sx::Sym(_, s, l) | Sx::Str(_, s, l) | Sx::Int(_, s, l) | Sx::List(_, s, l) => (*s, *l),
    }
  }
}

struct Parser<'a> {
  text: &'a [u8],
  pos: usize,
}

fn fail(msg: impl Into<String>) -> SnapshotError {
  SnapshotError::Translate(msg.into())
}

impl<'a> Parser<'a> {
  fn skip_ws(&mut self) {
    while self.pos < self.text.len() && self.text[self.pos].is_ascii_whitespace() {
      self.pos += 1;
    }
  }

  fn at_end(&mut self) -> bool {
    self.skip_ws();
    self.pos >= self.text.len()
  }

  fn parse(&mut self) -> Result<Sx, SnapshotError> {
    self.skip_ws();
    let start = self.pos;
    let span = |end: usize| (start as u32, (end - start) as u32);
    match self.text.get(self.pos) {
      None => Err(fail("unexpected end of input")),
      Some(b'(') => {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
          self.skip_ws();
          match self.text.get(self.pos) {
            None => return Err(fail("unclosed list")),
            Some(b')') => break,
            Some(_) => items.push(self.parse()?),
          }
        }
        self.pos += 1;
        let (s, l) = span(self.pos);
        Ok(Sx::List(items, s, l))
      }
      Some(b')') => Err(fail(format!("unexpected `)` at {start}"))),
      Some(b'"') => {
        self.pos += 1;
        while self.text.get(self.pos).is_some_and(|c| *c != b'"') {
          self.pos += 1;
        }
        if self.pos >= self.text.len() {
          return Err(fail("unclosed string"));
        };
        let value = String::from_utf8_lossy(&self.text[start + 1..self.pos]).into_owned();
        self.pos += 1;
        let (s, l) = span(self.pos);
        Ok(Sx::Str(value, s, l))
      }
      Some(_) => {
        while self
          .text
          .get(self.pos)
          .is_some_and(|c| !c.is_ascii_whitespace() && *c != b'(' && *c != b')')
        {
          self.pos += 1;
        }
        let word = String::from_utf8_lossy(&self.text[start..self.pos]).into_owned();
        let (s, l) = span(self.pos);
        Ok(match word.parse::<i32>() {
          Ok(v) => Sx::Int(v, s, l),
          Err(_) => Sx::Sym(word, s, l),
        })
      }
    }
  }
}

/// Translates a tiny s-expression language into `TestFactory` calls:
///
/// `(+ a b)`, `"str"`, `42`, `(do ...)`, `(list ...)`, `(neg e)`, `(not e)`,
/// `undefined`, `null`, `(break)`, `(var x)`, `(stmt e)`, `(ref name)` and
/// `(fn name (params) body)`. Every node gets the section of its form; unary
/// nodes are tagged as expressions.
pub struct SexprTranslator;

struct Scope<'f> {
  factory: &'f dyn NodeFactory,
  context: Arc<Context>,
  source: Arc<Source>,
  frames: Vec<Arc<FrameDescriptor>>,
  functions: Vec<(String, Arc<FunctionData>)>,
}

fn as_node(value: Value, what: &str) -> Result<NodeRef, SnapshotError> {
  value
    .as_node()
    .cloned()
    .ok_or_else(|| fail(format!("{what} did not return a node")))
}

impl<'f> Scope<'f> {
  fn call(&self, name: &str, args: Vec<Value>) -> Result<NodeRef, SnapshotError> {
    as_node(self.factory.call(name, args)?, name)
  }

  fn section(&self, sx: &Sx) -> SourceSection {
    let (start, len) = sx.span();
    SourceSection::new(self.source.clone(), start, len)
  }

  fn frame(&self) -> Result<&Arc<FrameDescriptor>, SnapshotError> {
    self.frames.last().ok_or_else(|| fail("no frame"))
  }

  fn children(&mut self, items: &[Sx]) -> Result<Vec<Value>, SnapshotError> {
    items
      .iter()
      .map(|sx| self.translate(sx).map(Value::Node))
      .collect()
  }

  fn translate(&mut self, sx: &Sx) -> Result<NodeRef, SnapshotError> {
    let node = self.build(sx)?;
    node.set_source_section(self.section(sx));
    Ok(node)
  }

  fn function(&mut self, items: &[Sx]) -> Result<NodeRef, SnapshotError> {
    let [Sx::Sym(name, ..), Sx::List(params, ..), body] = items else {
      return Err(fail("expected (fn name (params) body)"));
    };
    let data = FunctionData::new(self.context.clone(), params.len() as i32, "", 0);
    let descriptor = FrameDescriptor::new();
    for param in params {
      let Sx::Sym(param, ..) = param else {
        return Err(fail("parameter must be a symbol"));
      };
      descriptor.add_slot(Value::str(param), 0);
    }
    self.frames.push(descriptor.clone());
    self.functions.push((name.clone(), data.clone()));
    let body = self.translate(body);
    self.functions.pop();
    self.frames.pop();
    let root = self.call("function_root", vec![
      Value::FunctionData(data.clone()),
      Value::FrameDescriptor(descriptor),
      Value::Node(body?),
    ])?;
    data.set_name(name.as_str());
    self.call("function_expr", vec![
      Value::FunctionData(data),
      Value::Node(root),
    ])
  }

  fn build(&mut self, sx: &Sx) -> Result<NodeRef, SnapshotError> {
    match sx {
      Sx::Int(v, ..) => self.call("number", vec![Value::Int(*v)]),
      Sx::Str(s, ..) => self.call("string", vec![Value::str(s)]),
      Sx::Sym(s, ..) if s == "undefined" => self.call("constant", vec![Value::Singleton(
        snapshot_js::Singleton::Undefined,
      )]),
      Sx::Sym(s, ..) if s == "null" => {
        self.call("constant", vec![Value::Singleton(snapshot_js::Singleton::Null)])
      }
      Sx::Sym(s, ..) => Err(fail(format!("unknown symbol `{s}`"))),
      Sx::List(items, ..) => {
        let Some(Sx::Sym(head, ..)) = items.first() else {
          return Err(fail("expected a form"));
        };
        let rest = &items[1..];
        match (head.as_str(), rest) {
          ("+", [a, b]) => {
            let a = self.translate(a)?;
            let b = self.translate(b)?;
            self.call("add", vec![Value::Node(a), Value::Node(b)])
          }
          ("do", _) => {
            let items = self.children(rest)?;
            self.call("block", vec![Value::Array {
              component: ValueType::Node,
              items,
            }])
          }
          ("list", _) => {
            let items = self.children(rest)?;
            self.call("sequence", vec![Value::List(items)])
          }
          (op @ ("neg" | "not"), [e]) => {
            let e = self.translate(e)?;
            let ordinal = if op == "neg" { 0 } else { 1 };
            let operator = OPERATOR.constant(ordinal).ok_or_else(|| fail("operator"))?;
            let node = self.call("unary", vec![operator, Value::Node(e)])?;
            node.add_tags(Tags {
              expression: true,
              ..Tags::default()
            });
            Ok(node)
          }
          ("break", []) => self.call("jump", vec![Value::JumpTarget(Arc::new(JumpTarget::new(
            JumpTargetKind::Switch,
          )))]),
          ("var", [Sx::Sym(name, ..)]) => {
            let slot = self.frame()?.find_or_add_slot(Value::str(name), 0);
            self.call("read_var", vec![Value::FrameSlot(slot)])
          }
          ("stmt", [e]) => {
            let e = self.translate(e)?;
            self.factory.call("mark_statement", vec![Value::Node(e.clone())])?;
            Ok(e)
          }
          ("ref", [Sx::Sym(name, ..)]) => {
            let data = self
              .functions
              .iter()
              .rev()
              .find(|(n, _)| n == name)
              .map(|(_, data)| data.clone())
              .ok_or_else(|| fail(format!("no enclosing function `{name}`")))?;
            self.call("function_ref", vec![Value::FunctionData(data)])
          }
          ("fn", _) => self.function(rest),
          _ => Err(fail(format!("malformed `{head}` form"))),
        }
      }
    }
  }
}

impl Translator for SexprTranslator {
  fn translate(
    &self,
    factory: &dyn NodeFactory,
    context: &Arc<Context>,
    source: &Arc<Source>,
  ) -> Result<NodeRef, SnapshotError> {
    let mut parser = Parser {
      text: source.text().as_bytes(),
      pos: 0,
    };
    let mut forms = Vec::new();
    while !parser.at_end() {
      forms.push(parser.parse()?);
    }
    let mut scope = Scope {
      factory,
      context: context.clone(),
      source: source.clone(),
      frames: vec![FrameDescriptor::new()],
      functions: Vec::new(),
    };
    let items = forms
      .iter()
      .map(|sx| scope.translate(sx).map(Value::Node))
      .collect::<Result<Vec<_>, _>>()?;
    let whole = SourceSection::new(source.clone(), 0, source.len() as u32);
    let program = scope.call("program", vec![Value::SourceSection(whole.clone()), Value::List(items)])?;
    program.set_source_section(whole);
    Ok(program)
  }
}

/// A recorded translation: the tree built while recording, plus the stream.
pub struct Recorded {
  pub root: NodeRef,
  pub recording: Recording,
  pub bytes: Vec<u8>,
  pub context: Arc<Context>,
  pub source: Arc<Source>,
}

pub fn record(text: &str, options: RecordingOptions) -> Recorded {
  try_record(text, options).expect("record")
}

pub fn try_record(text: &str, options: RecordingOptions) -> Result<Recorded, SnapshotError> {
  let context = Context::new("test");
  let source = Source::new("test.sx", text);
  let recorder = RecordingFactory::new(TestFactory, options);
  let root = SexprTranslator.translate(&recorder, &context, &source)?;
  let (factory, mut recording) = recorder.into_parts();
  recording.set_source(source.clone());
  recording.finish(&Value::Node(root.clone()))?;
  let bytes = recording.to_binary(factory.dispatch_table())?;
  Ok(Recorded {
    root,
    recording,
    bytes,
    context,
    source,
  })
}

pub fn decode(recorded: &Recorded) -> Result<NodeRef, snapshot_js::DecodeError> {
  let value = NodeDecoder::new(
    recorded.bytes.clone(),
    Arc::new(TestFactory),
    recorded.context.clone(),
    recorded.source.clone(),
  )
  .decode()?;
  Ok(value.as_node().cloned().expect("decoded root is a node"))
}
