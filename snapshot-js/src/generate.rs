use crate::decode::NodeDecoder;
use crate::error::SnapshotError;
use crate::factory::NodeFactory;
use crate::factory::NodeRef;
use crate::record::RecordingOptions;
use crate::runtime::Context;
use crate::runtime::Source;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::debug_span;
use tracing::warn;

/// Drives a node factory to build the tree of one source, the way a parser
/// front end would.
pub trait Translator: Sync {
  fn translate(
    &self,
    factory: &dyn NodeFactory,
    context: &Arc<Context>,
    source: &Arc<Source>,
  ) -> Result<NodeRef, SnapshotError>;
}

#[derive(Clone, Debug)]
pub struct SourceJob {
  pub name: String,
  pub source: Arc<Source>,
}

impl SourceJob {
  pub fn new(source: Arc<Source>) -> Self {
    Self {
      name: source.name().to_string(),
      source,
    }
  }
}

#[derive(Clone, Debug, Default)]
pub struct GenerateOptions {
  /// Worker threads; rayon's default when unset.
  pub threads: Option<usize>,
  /// Decode every stream again before reporting it as a success.
  pub verify: bool,
  pub recording: RecordingOptions,
}

impl GenerateOptions {
  pub fn with_threads(mut self, threads: usize) -> Self {
    self.threads = Some(threads);
    self
  }

  pub fn with_verify(mut self, verify: bool) -> Self {
    self.verify = verify;
    self
  }

  pub fn with_recording(mut self, recording: RecordingOptions) -> Self {
    self.recording = recording;
    self
  }
}

#[derive(Debug)]
pub struct JobOutcome {
  pub name: String,
  pub result: Result<Vec<u8>, SnapshotError>,
}

/// Outcomes in job order.
#[derive(Debug, Default)]
pub struct GenerateReport {
  pub outcomes: Vec<JobOutcome>,
}

impl GenerateReport {
  pub fn failures(&self) -> impl Iterator<Item = (&str, &SnapshotError)> {
    self
      .outcomes
      .iter()
      .filter_map(|o| o.result.as_ref().err().map(|e| (o.name.as_str(), e)))
  }

  pub fn first_failure(&self) -> Option<(&str, &SnapshotError)> {
    self.failures().next()
  }

  pub fn successes(&self) -> usize {
    self.outcomes.iter().filter(|o| o.result.is_ok()).count()
  }

  pub fn is_ok(&self) -> bool {
    self.first_failure().is_none()
  }
}

fn generate_one<F: NodeFactory + 'static, T: Translator + ?Sized>(
  job: &SourceJob,
  factory: &Arc<F>,
  translator: &T,
  context: &Arc<Context>,
  options: &GenerateOptions,
) -> Result<Vec<u8>, SnapshotError> {
  let _span = debug_span!("snapshot", file = %job.name).entered();
  let bytes = crate::snapshot(
    factory.clone(),
    translator,
    context,
    &job.source,
    options.recording.clone(),
  )?;
  if options.verify {
    NodeDecoder::new(
      bytes.clone(),
      factory.clone(),
      context.clone(),
      job.source.clone(),
    )
    .decode()?;
  };
  Ok(bytes)
}

/// Snapshots every job on a dedicated pool. A failing job is reported in its
/// outcome and does not affect the others.
pub fn generate_snapshots<F: NodeFactory + 'static, T: Translator + ?Sized>(
  jobs: &[SourceJob],
  factory: &Arc<F>,
  translator: &T,
  options: &GenerateOptions,
) -> Result<GenerateReport, SnapshotError> {
  let mut builder = rayon::ThreadPoolBuilder::new();
  if let Some(threads) = options.threads {
    builder = builder.num_threads(threads.max(1));
  };
  let pool = builder
    .build()
    .map_err(|err| SnapshotError::Pool(err.to_string()))?;
  let contexts = (0..pool.current_num_threads())
    .map(|i| Context::new(format!("worker-{i}")))
    .collect::<Vec<_>>();
  let outcomes = pool.install(|| {
    jobs
      .par_iter()
      .map(|job| {
        let worker = rayon::current_thread_index().unwrap_or(0) % contexts.len();
        let result = generate_one(job, factory, translator, &contexts[worker], options);
        if let Err(err) = &result {
          warn!(file = %job.name, error = %err, "snapshot failed");
        };
        JobOutcome {
          name: job.name.clone(),
          result,
        }
      })
      .collect::<Vec<_>>()
  });
  Ok(GenerateReport { outcomes })
}
