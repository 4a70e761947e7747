use clap::Parser;
use clap::Subcommand;
use rayon::prelude::*;
use serde::Serialize;
use snapshot_js::disassemble;
use snapshot_js::Disassembly;
use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process;
use tracing::debug;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
#[command(name = "snapshot-js", about = "Inspect JavaScript AST snapshot streams")]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Disassemble snapshot files; directories are searched recursively.
  Inspect {
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Print JSON instead of a listing.
    #[arg(long)]
    json: bool,

    /// Emit tracing events as JSON to stderr.
    #[arg(long)]
    trace: bool,

    /// Worker threads; defaults to the number of CPUs.
    #[arg(long)]
    threads: Option<usize>,
  },
}

#[derive(Serialize)]
struct FileReport {
  path: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  disassembly: Option<Disassembly>,
  #[serde(skip_serializing_if = "Option::is_none")]
  error: Option<String>,
}

fn init_tracing(enabled: bool) {
  if !enabled {
    return;
  }
  let _ = tracing_subscriber::fmt()
    .with_writer(io::stderr)
    .with_span_events(FmtSpan::CLOSE)
    .with_max_level(Level::DEBUG)
    .json()
    .with_ansi(false)
    .try_init();
}

fn collect_files(path: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
  if !path.is_dir() {
    out.push(path.to_path_buf());
    return Ok(());
  };
  let mut entries = fs::read_dir(path)?
    .map(|e| e.map(|e| e.path()))
    .collect::<io::Result<Vec<_>>>()?;
  entries.sort();
  for entry in entries {
    collect_files(&entry, out)?;
  }
  Ok(())
}

fn inspect(path: &Path) -> FileReport {
  let result = fs::read(path)
    .map_err(|err| err.to_string())
    .and_then(|bytes| disassemble(&bytes).map_err(|err| err.to_string()));
  debug!(path = %path.display(), ok = result.is_ok(), "inspected");
  let (disassembly, error) = match result {
    Ok(d) => (Some(d), None),
    Err(e) => (None, Some(e)),
  };
  FileReport {
    path: path.display().to_string(),
    disassembly,
    error,
  }
}

fn run_inspect(paths: &[PathBuf], json: bool, threads: Option<usize>) -> Result<bool, String> {
  let mut files = Vec::new();
  for path in paths {
    collect_files(path, &mut files).map_err(|err| format!("{}: {err}", path.display()))?;
  }
  let mut builder = rayon::ThreadPoolBuilder::new();
  if let Some(threads) = threads {
    builder = builder.num_threads(threads.max(1));
  };
  let pool = builder
    .build()
    .map_err(|err| format!("create thread pool: {err}"))?;
  let reports: Vec<FileReport> = pool.install(|| files.par_iter().map(|f| inspect(f)).collect());
  let ok = reports.iter().all(|r| r.error.is_none());

  let stdout = io::stdout();
  let mut out = stdout.lock();
  if json {
    serde_json::to_writer_pretty(&mut out, &reports).map_err(|err| err.to_string())?;
    writeln!(out).map_err(|err| err.to_string())?;
  } else {
    for report in &reports {
      let written = match (&report.disassembly, &report.error) {
        (Some(d), _) => write!(out, "== {}\n{d}\n", report.path),
        (None, Some(e)) => writeln!(out, "== {}\nerror: {e}\n", report.path),
        (None, None) => Ok(()),
      };
      written.map_err(|err| err.to_string())?;
    }
  };
  Ok(ok)
}

fn main() {
  let cli = Cli::parse();
  match cli.command {
    Command::Inspect {
      paths,
      json,
      trace,
      threads,
    } => {
      init_tracing(trace);
      match run_inspect(&paths, json, threads) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(err) => {
          eprintln!("{err}");
          process::exit(1);
        }
      };
    }
  };
}
