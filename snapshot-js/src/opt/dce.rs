use crate::record::Inst;
use crate::value::ValueId;
use ahash::HashMap;
use croaring::Bitmap;
use tracing::trace;

fn mark(defs: &HashMap<ValueId, usize>, insts: &[Inst], live: &mut Bitmap, start: &[ValueId]) {
  let mut stack = start.to_vec();
  while let Some(id) = stack.pop() {
    if !live.add_checked(id) {
      continue;
    };
    if let Some(&i) = defs.get(&id) {
      stack.extend(insts[i].inputs());
    };
  }
}

/// Removes every inst that the final `Return` does not reach. Fix-ups are kept
/// when the value they mutate is live. Returns the number of removed insts.
pub fn eliminate_dead_code(insts: &mut Vec<Inst>) -> usize {
  let defs: HashMap<ValueId, usize> = insts
    .iter()
    .enumerate()
    .filter_map(|(i, inst)| inst.id().map(|id| (id, i)))
    .collect();
  let mut live = Bitmap::new();
  for inst in insts.iter().rev().filter(|inst| inst.is_return()) {
    mark(&defs, insts, &mut live, &inst.inputs());
  }

  // Root fix-ups have no id, so their liveness is tracked by arena index.
  let mut live_roots = Bitmap::new();
  loop {
    let mut changed = false;
    for (i, inst) in insts.iter().enumerate() {
      let Some(target) = inst.fixup_target() else {
        continue;
      };
      if !live.contains(target) {
        continue;
      };
      let already = match inst.id() {
        Some(id) => live.contains(id),
        None => live_roots.contains(i as u32),
      };
      if already {
        continue;
      };
      match inst.id() {
        Some(id) => mark(&defs, insts, &mut live, &[id]),
        None => {
          live_roots.add(i as u32);
          mark(&defs, insts, &mut live, &inst.inputs());
        }
      };
      changed = true;
    }
    if !changed {
      break;
    };
  }

  let before = insts.len();
  let mut i = 0;
  insts.retain(|inst| {
    let keep = inst.is_return()
      || match inst.id() {
        Some(id) => live.contains(id),
        None => live_roots.contains(i as u32),
      };
    if !keep {
      trace!(inst = %inst, "dead");
    };
    i += 1;
    keep
  });
  before - insts.len()
}
