//! Entry manager entry point.
//!
//! Loads a device profile, builds the table registry on a logging
//! transport, optionally restores a saved device state, and prints the
//! resulting state walk.

use clap::Parser;
use log::{debug, error, info};
use pipemgr::audit::{self, AuditCategory, AuditOutcome, AuditRecord};
use pipemgr::{DeviceProfile, DeviceState, EntryData, Hardware, PipeError, PipeResult, TableRegistry};
use pipemgr_hw::{EncodeTarget, EntryEncoder, InstrTarget, Instruction, InstructionTransport, PhysAddr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

/// Pipeline table-entry manager
#[derive(Parser, Debug)]
#[command(name = "entrymgr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Device profile (YAML)
    #[arg(short = 'p', long)]
    profile: PathBuf,

    /// Saved device state (JSON) to restore
    #[arg(short = 'r', long)]
    restore: Option<PathBuf>,

    /// Print the device state walk as JSON
    #[arg(long)]
    dump_state: bool,

    /// Emit logs as JSON through tracing
    #[arg(long)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Outbound buffer size reported by the transport, in bytes
    #[arg(long, default_value = "65536")]
    transport_capacity: usize,
}

/// Transport that logs instructions instead of reaching a device.
struct LoggingTransport {
    capacity: usize,
    pending: usize,
}

impl InstructionTransport for LoggingTransport {
    fn post(&mut self, target: &InstrTarget, instr: &Instruction) -> PipeResult<()> {
        debug!("post {} -> {}", instr, target);
        self.pending += instr.encoded_len();
        Ok(())
    }

    fn flush(&mut self) -> PipeResult<()> {
        debug!("flush {} byte(s)", self.pending);
        self.pending = 0;
        Ok(())
    }

    fn discard(&mut self) {
        debug!("discard {} byte(s)", self.pending);
        self.pending = 0;
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Encodes payloads as JSON words.
struct JsonEncoder;

impl EntryEncoder for JsonEncoder {
    fn encode(&self, _target: &EncodeTarget, data: &EntryData) -> PipeResult<Vec<u8>> {
        serde_json::to_vec(data).map_err(|e| PipeError::unexpected(format!("encode: {}", e)))
    }

    fn decode(&self, addr: &PhysAddr, words: &[u8]) -> PipeResult<EntryData> {
        serde_json::from_slice(words)
            .map_err(|e| PipeError::invalid_argument(format!("decode at {:?}: {}", addr, e)))
    }
}

fn load_state(path: &Path) -> PipeResult<DeviceState> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        PipeError::invalid_argument(format!("cannot read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&text)
        .map_err(|e| PipeError::invalid_argument(format!("device state {}: {}", path.display(), e)))
}

fn run(args: &Args) -> PipeResult<()> {
    let profile = DeviceProfile::from_file(&args.profile)?;
    info!("Profile: {}", args.profile.display());
    info!("Device: {}", profile.dev_id);
    info!("Pipes: {}", profile.num_pipes);
    info!("Instruction buffer: {} bytes", profile.instr_buffer_bytes);
    info!("Tables: {}", profile.tables.len());

    let transport = LoggingTransport {
        capacity: args.transport_capacity,
        pending: 0,
    };
    let hw = Hardware::new(Arc::new(JsonEncoder), Box::new(transport));
    let mut registry = TableRegistry::new(&profile, hw)?;

    if let Some(path) = &args.restore {
        let state = load_state(path)?;
        registry.restore_state(&state)?;
        info!("Restored {} entr(y/ies) from {}", state.entry_count(), path.display());
    }

    let state = registry.log_state();
    for instance in &state.instances {
        info!(
            "  table {} {:?}: {} entr(y/ies)",
            instance.table,
            instance.pipe,
            instance.entries.len()
        );
    }
    if args.dump_state {
        let text = serde_json::to_string_pretty(&state)
            .map_err(|e| PipeError::unexpected(format!("state walk: {}", e)))?;
        println!("{}", text);
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.json_logs {
        audit::init_logging(&args.log_level);
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
            .init();
    }

    info!("====================================================================");
    info!("Starting entry manager");
    info!("====================================================================");
    pipemgr::audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "entrymgr", "start")
        .with_outcome(AuditOutcome::Success));

    match run(&args) {
        Ok(()) => {
            pipemgr::audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "entrymgr", "stop")
                .with_outcome(AuditOutcome::Success));
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Entry manager failed ({}): {}", e.status(), e);
            pipemgr::audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "entrymgr", "stop")
                .with_error(e.to_string()));
            ExitCode::FAILURE
        }
    }
}
