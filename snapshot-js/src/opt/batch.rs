//! Splits a pruned recording into one entry batch plus one extracted batch per
//! nested function body.
//!
//! Each batch owns the insts needed to compute its start value without
//! descending into nested function roots. Values already owned by an enclosing
//! batch are passed in as parameters, except primitives, which every batch
//! rebuilds for itself. Nested roots become calls of their extracted batch.

use crate::error::RecordError;
use crate::record::Inst;
use crate::record::InstKind;
use crate::value::ValueId;
use crate::value::ValueType;
use ahash::HashMap;
use ahash::HashSet;
use croaring::Bitmap;
use itertools::Itertools;
use tracing::debug;
use tracing::trace;

/// Name of the batch that rebuilds the whole tree.
pub const ENTRY_BATCH: &str = "apply";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Param {
  pub id: ValueId,
  pub ty: ValueType,
}

/// A self-contained unit of replay with explicit parameters.
#[derive(Clone, Debug)]
pub struct InstBatch {
  pub name: String,
  pub params: Vec<Param>,
  /// Member insts in recorded order, ending with a `Return`.
  pub insts: Vec<Inst>,
  pub ret: ValueType,
}

impl InstBatch {
  /// The single batch of an unsplit recording.
  pub fn entry(insts: Vec<Inst>) -> Self {
    Self {
      name: ENTRY_BATCH.to_string(),
      params: Vec::new(),
      insts,
      ret: ValueType::Object,
    }
  }

  pub fn is_entry(&self) -> bool {
    self.name == ENTRY_BATCH
  }

  /// Number of values the batch defines, parameters included.
  pub fn value_count(&self) -> usize {
    self.params.len() + self.insts.iter().filter(|inst| inst.id().is_some()).count()
  }
}

fn mangle(name: &str) -> String {
  name
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
    .collect()
}

fn bitmap_union(a: &Bitmap, b: &Bitmap) -> Bitmap {
  let mut merged = a.clone();
  merged.or_inplace(b);
  merged
}

/// Def and use edges of the arena, by index.
struct Graph<'a> {
  insts: &'a [Inst],
  defs: HashMap<ValueId, u32>,
  fixups: HashMap<ValueId, Vec<u32>>,
  boundary_users: HashMap<ValueId, Vec<u32>>,
}

impl<'a> Graph<'a> {
  fn new(insts: &'a [Inst]) -> Self {
    let mut defs = HashMap::default();
    let mut fixups = HashMap::<ValueId, Vec<u32>>::default();
    let mut boundary_users = HashMap::<ValueId, Vec<u32>>::default();
    for (i, inst) in insts.iter().enumerate() {
      let i = i as u32;
      if let Some(id) = inst.id() {
        defs.insert(id, i);
      };
      if let Some(target) = inst.fixup_target() {
        fixups.entry(target).or_default().push(i);
      };
      if inst.is_batch_boundary() {
        for input in inst.inputs() {
          boundary_users.entry(input).or_default().push(i);
        }
      };
    }
    Self {
      insts,
      defs,
      fixups,
      boundary_users,
    }
  }

  fn inst(&self, index: u32) -> &'a Inst {
    &self.insts[index as usize]
  }

  fn index(&self, id: ValueId) -> Result<u32, RecordError> {
    self
      .defs
      .get(&id)
      .copied()
      .ok_or_else(|| RecordError::Internal(format!("v{id} has no defining inst")))
  }

  fn add_inputs(&self, set: &mut Bitmap, index: u32) -> Result<(), RecordError> {
    for input in self.inst(index).inputs() {
      set.add(self.index(input)?);
    }
    Ok(())
  }

  /// Whether a value owned by an enclosing batch is received as a parameter
  /// rather than rebuilt.
  fn is_inherited(&self, index: u32, outer: &Bitmap) -> bool {
    let inst = self.inst(index);
    outer.contains(index) && !inst.is_primitive_value() && !inst.is_batch_boundary()
  }

  /// Whether `index` is a nested root that will get its own batch, judged
  /// against a usage set that still holds inherited values.
  fn is_extracted(&self, index: u32, start: u32, set: &Bitmap, outer: &Bitmap) -> bool {
    index != start
      && self.inst(index).is_batch_boundary()
      && !self.inst(index).inputs().into_iter().all(|input| {
        self
          .defs
          .get(&input)
          .is_some_and(|&i| set.contains(i) && !self.is_inherited(i, outer))
      })
  }

  /// Adds fix-ups of members, unless an enclosing batch already owns them.
  /// Fix-ups of an extracted root, and of its function's data, belong to the
  /// root's own batch.
  fn add_fixups(&self, set: &mut Bitmap, start: u32, outer: &Bitmap) {
    for member in set.iter().collect_vec() {
      let inst = self.inst(member);
      let Some(id) = inst.id() else {
        continue;
      };
      if self.is_extracted(member, start, set, outer) {
        continue;
      };
      if inst.ty() == ValueType::FunctionData
        && self.boundary_users.get(&id).is_some_and(|users| {
          users
            .iter()
            .any(|&u| u != start && (!set.contains(u) || self.is_extracted(u, start, set, outer)))
        })
      {
        continue;
      };
      for &fixup in self.fixups.get(&id).into_iter().flatten() {
        if !set.contains(fixup) && !outer.contains(fixup) {
          trace!(fixup = %self.inst(fixup), "fix-up joins batch");
          set.add(fixup);
        };
      }
    }
  }

  fn usage_set(&self, start: u32, outer: &Bitmap) -> Result<Bitmap, RecordError> {
    let mut set = Bitmap::new();
    set.add(start);
    self.add_inputs(&mut set, start)?;
    self.add_fixups(&mut set, start, outer);
    loop {
      let before = set.cardinality();
      for member in set.iter().collect_vec() {
        if !self.inst(member).is_batch_boundary() {
          self.add_inputs(&mut set, member)?;
        };
      }
      self.add_fixups(&mut set, start, outer);
      if set.cardinality() == before {
        break;
      };
    }
    for member in set.iter().collect_vec() {
      if self.is_inherited(member, outer) {
        trace!(inst = %self.inst(member), "owned by an enclosing batch");
        set.remove(member);
      };
    }
    Ok(set)
  }

  /// Whether every input of a nested root is already computed by the batch, in
  /// which case the root stays inline.
  fn is_contained(&self, index: u32, set: &Bitmap) -> bool {
    self
      .inst(index)
      .inputs()
      .into_iter()
      .all(|input| self.defs.get(&input).is_some_and(|&i| set.contains(i)))
  }

  /// Inputs of members that the batch does not compute itself.
  fn missing_inputs(&self, start: u32, set: &Bitmap) -> Vec<ValueId> {
    let mut missing = Vec::new();
    for member in set.iter() {
      let inst = self.inst(member);
      if member != start && inst.is_batch_boundary() && !self.is_contained(member, set) {
        continue;
      };
      for input in inst.inputs() {
        let inside = self.defs.get(&input).is_some_and(|&i| set.contains(i));
        if !inside && !missing.contains(&input) {
          missing.push(input);
        };
      }
    }
    missing
  }
}

struct WorkItem {
  start: u32,
  outer: Bitmap,
  caller: Option<usize>,
}

struct Extracted {
  start: u32,
  set: Bitmap,
  params: Vec<ValueId>,
  caller: Option<usize>,
  name: String,
}

/// Splits `insts`, which must end with the recording's `Return`, into batches.
/// The entry batch comes first.
pub fn build_batches(insts: &[Inst], lazy_functions: bool) -> Result<Vec<InstBatch>, RecordError> {
  let root = match insts.last() {
    Some(inst) if inst.is_return() => (insts.len() - 1) as u32,
    _ => {
      return Err(RecordError::Internal(
        "recording does not end with a return".to_string(),
      ))
    }
  };
  let graph = Graph::new(insts);

  let mut worklist = vec![WorkItem {
    start: root,
    outer: Bitmap::new(),
    caller: None,
  }];
  let mut visited = Bitmap::new();
  let mut extracted = Vec::<Extracted>::new();
  let mut count = 0;
  while let Some(WorkItem {
    start,
    outer,
    caller,
  }) = worklist.pop()
  {
    if !visited.add_checked(start) {
      continue;
    };
    let start_inst = graph.inst(start);
    let set = graph.usage_set(start, &outer)?;
    let params = graph.missing_inputs(start, &set);

    // A caller that does not own a parameter must receive it from its own caller.
    for &param in &params {
      let index = graph.index(param)?;
      let mut owner = caller;
      loop {
        let Some(c) = owner else {
          return Err(RecordError::Internal(format!(
            "no enclosing batch defines v{param}"
          )));
        };
        let batch = &mut extracted[c];
        if batch.set.contains(index) {
          break;
        };
        if !batch.params.contains(&param) {
          trace!(param, batch = %batch.name, "forwarding parameter");
          batch.params.push(param);
        };
        owner = batch.caller;
      }
    }

    let name = if start_inst.is_return() {
      ENTRY_BATCH.to_string()
    } else {
      match start_inst.name() {
        n if n.is_empty() => format!("function{count}"),
        n => format!("function{count}_{}", mangle(&n)),
      }
    };
    count += 1;

    let this = extracted.len();
    let nested_outer = bitmap_union(&outer, &set);
    for member in set.iter() {
      if member != start && graph.inst(member).is_batch_boundary() && !graph.is_contained(member, &set)
      {
        worklist.push(WorkItem {
          start: member,
          outer: nested_outer.clone(),
          caller: Some(this),
        });
      };
    }
    debug!(
      batch = %name,
      members = set.cardinality(),
      params = params.len(),
      "batch extracted"
    );
    extracted.push(Extracted {
      start,
      set,
      params,
      caller,
      name,
    });
  }

  for batch in extracted.iter_mut() {
    batch.params.sort_unstable();
  }
  let by_start: HashMap<u32, usize> = extracted
    .iter()
    .enumerate()
    .map(|(i, b)| (b.start, i))
    .collect();

  extracted
    .iter()
    .map(|batch| {
      let mut members = Vec::with_capacity(batch.set.cardinality() as usize + 1);
      for index in batch.set.iter() {
        let inst = graph.inst(index);
        let callee = (index != batch.start)
          .then(|| by_start.get(&index))
          .flatten()
          .map(|&c| &extracted[c]);
        match callee {
          Some(callee) => {
            // The initializer goes on the nested root's own function data.
            let function_data = lazy_functions
              .then(|| {
                graph.inst(callee.start).inputs().into_iter().find(|input| {
                  callee.params.contains(input)
                    && graph
                      .defs
                      .get(input)
                      .is_some_and(|&i| graph.inst(i).ty() == ValueType::FunctionData)
                })
              })
              .flatten();
            members.push(inst.to_call_extracted(
              callee.name.clone(),
              callee.params.clone(),
              function_data,
            ));
          }
          None => members.push(inst.clone()),
        };
      }
      let start_inst = graph.inst(batch.start);
      let ret = if start_inst.is_return() {
        ValueType::Object
      } else {
        let id = start_inst
          .id()
          .ok_or_else(|| RecordError::Internal("batch starts at a root inst".to_string()))?;
        members.push(Inst::ret(id));
        start_inst.ty()
      };
      let params = batch
        .params
        .iter()
        .map(|&id| {
          Ok(Param {
            id,
            ty: graph.inst(graph.index(id)?).ty(),
          })
        })
        .collect::<Result<Vec<_>, RecordError>>()?;
      let built = InstBatch {
        name: batch.name.clone(),
        params,
        insts: members,
        ret,
      };
      check_defined_before_use(&built)?;
      Ok(built)
    })
    .collect()
}

/// Every input of a batch member must be a parameter or an earlier member.
fn check_defined_before_use(batch: &InstBatch) -> Result<(), RecordError> {
  let mut defined: HashSet<ValueId> = batch.params.iter().map(|p| p.id).collect();
  for inst in &batch.insts {
    if let Some(missing) = inst.inputs().into_iter().find(|i| !defined.contains(i)) {
      return Err(RecordError::Internal(format!(
        "`{}` uses v{missing} before defining it in `{inst}`",
        batch.name
      )));
    };
    if let InstKind::Return { .. } = inst.kind() {
      break;
    };
    if let Some(id) = inst.id() {
      defined.insert(id);
    };
  }
  Ok(())
}
