//! CLI entrypoint for the rtlheap workload harness.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use rtlheap_core::{Heap, HeapConfig, HeapFlags, HeapLogLevel, HeapOps, VirtualMemory};
use rtlheap_harness::structured_log::validate_log_file;
use rtlheap_harness::{HarnessError, LogEmitter, WalkReport, WorkloadSpec, run_workload};

/// Workload tooling for rtlheap.
#[derive(Debug, Parser)]
#[command(name = "rtlheap-harness")]
#[command(about = "Deterministic workload harness for rtlheap")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a workload and print its statistics and walk digest.
    Run {
        #[command(flatten)]
        workload: WorkloadArgs,
        /// Write drained heap records here as JSONL.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Minimum record level kept by the heap.
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Run a workload without freeing and print the full walk report.
    Walk {
        #[command(flatten)]
        workload: WorkloadArgs,
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate a JSONL log produced by `run --log`.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
}

#[derive(Debug, Args)]
struct WorkloadArgs {
    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,
    #[arg(long, default_value_t = 2000)]
    steps: usize,
    #[arg(long, default_value_t = 2048)]
    max_size: usize,
    /// Every n-th allocation takes the large-block path; 0 disables.
    #[arg(long, default_value_t = 0)]
    large_every: usize,
    #[arg(long, default_value_t = 256)]
    max_live: usize,
    #[arg(long, default_value_t = 250)]
    validate_every: usize,
    /// Fixed heap size; growable when omitted.
    #[arg(long)]
    fixed: Option<usize>,
    #[arg(long)]
    tail_checking: bool,
    #[arg(long)]
    free_checking: bool,
}

impl WorkloadArgs {
    fn spec(&self) -> WorkloadSpec {
        WorkloadSpec {
            seed: self.seed,
            steps: self.steps,
            max_size: self.max_size,
            large_every: self.large_every,
            max_live: self.max_live,
            validate_every: self.validate_every,
            ..WorkloadSpec::default()
        }
    }

    fn create_heap(&self, config: HeapConfig) -> Result<Heap, HarnessError> {
        let mut flags = HeapFlags::NONE;
        if self.tail_checking {
            flags |= HeapFlags::TAIL_CHECKING_ENABLED;
        }
        if self.free_checking {
            flags |= HeapFlags::FREE_CHECKING_ENABLED;
        }
        let size = self.fixed.unwrap_or(0);
        let heap = Heap::create(flags, size, size, config, Arc::new(VirtualMemory::new()))?;
        Ok(heap)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            workload,
            log,
            log_level,
        } => {
            let level = HeapLogLevel::from_str_loose(&log_level)
                .ok_or_else(|| format!("unknown log level '{log_level}'"))?;
            let config = HeapConfig::default().with_log(1 << 20, level);
            let heap = workload.create_heap(config)?;
            let stats = run_workload(&heap, &workload.spec(), false)?;
            let report = WalkReport::collect(&heap, false)?;

            if let Some(path) = log {
                let mut emitter = LogEmitter::to_file(&path, &format!("{:016x}", workload.seed))?;
                emitter.emit_records(heap.id(), &heap.drain_logs())?;
                emitter.flush()?;
            }
            let out = serde_json::json!({ "stats": stats, "walk": report });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Walk { workload, output } => {
            let heap = workload.create_heap(HeapConfig::default())?;
            run_workload(&heap, &workload.spec(), false)?;
            let json = WalkReport::collect(&heap, true)?.to_json()?;
            match output {
                Some(path) => std::fs::write(&path, json)?,
                None => println!("{json}"),
            }
        }
        Command::ValidateLog { log } => {
            let (valid, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            println!("{valid} valid line(s), {} error(s)", errors.len());
            if !errors.is_empty() {
                return Err(HarnessError::InvalidLog {
                    count: errors.len(),
                }
                .into());
            }
        }
    }
    Ok(())
}
