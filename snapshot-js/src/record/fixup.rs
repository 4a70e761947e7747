use crate::factory::NodeRef;
use crate::runtime::FunctionData;
use crate::runtime::SourceSection;
use crate::runtime::Tags;
use crate::value::ValueId;
use std::sync::Arc;

/// A deferred check for a mutation the translator makes after the factory
/// returned an object. Each watch remembers the state it last reported.
pub(super) enum Watch {
  FunctionDataName {
    target: ValueId,
    data: Arc<FunctionData>,
    baseline: String,
  },
  Node {
    target: ValueId,
    node: NodeRef,
    section: Option<SourceSection>,
    tags: Tags,
  },
}

impl Watch {
  pub fn function_data(target: ValueId, data: &Arc<FunctionData>) -> Self {
    Watch::FunctionDataName {
      target,
      data: data.clone(),
      baseline: data.name(),
    }
  }

  pub fn node(target: ValueId, node: &NodeRef) -> Self {
    Watch::Node {
      target,
      node: node.clone(),
      section: node.source_section(),
      tags: node.tags(),
    }
  }
}

/// Two-phase fix-up queue. Early watches are polled before every recorded call;
/// once a watch fires it moves to the late queue, which is polled exactly once
/// when the recording finishes.
#[derive(Default)]
pub(super) struct FixUpQueue {
  pub early: Vec<Watch>,
  pub late: Vec<Watch>,
}

impl FixUpQueue {
  pub fn len(&self) -> usize {
    self.early.len() + self.late.len()
  }

  pub fn clear(&mut self) {
    self.early.clear();
    self.late.clear();
  }
}
