use std::io::IsTerminal;
use std::mem::size_of;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::FmtSubscriber;

use unwind_maps::address_mapping::PidPageMappings;
use unwind_maps::bpf::{FileId, PidPage, PidPageMappingInfo, UnwindProgram};
use unwind_maps::capabilities::BatchCapabilities;
use unwind_maps::maps::libbpf::LibbpfMapFactory;
use unwind_maps::maps::{MapFactory, MapKind, MapSpec};
use unwind_maps::metrics::ErrorCounter;
use unwind_maps::util::summarize_address_range;

#[derive(clap::ValueEnum, Debug, Clone, Default)]
enum LoggingLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Checks which BPF map features the running kernel offers.
#[derive(Parser, Debug)]
struct CliArgs {
    #[arg(long, default_value_t, value_enum)]
    logging: LoggingLevel,
    /// Also store a mapping of this process in a kernel LPM trie and read
    /// every page of it back
    #[arg(long)]
    lpm_self_check: bool,
    /// Disable batch operations for the self check
    #[arg(long)]
    no_batch: bool,
}

/// Start of the fake executable mapping used by the self check.
const SELF_CHECK_LOW: u64 = 0x7f12_3456_1000;
const SELF_CHECK_HIGH: u64 = 0x7f12_3459_8fff;

fn lpm_self_check(factory: &dyn MapFactory, batch_operations: bool) -> anyhow::Result<()> {
    let _memlock = factory.raise_memlock()?;
    let map = factory.create_map(&MapSpec::new(
        "self_check_lpm",
        MapKind::LpmTrie,
        size_of::<PidPage>() as u32,
        size_of::<PidPageMappingInfo>() as u32,
        1024,
    ))?;

    let pid = std::process::id();
    let errors = Arc::new(ErrorCounter::new());
    let mappings = PidPageMappings::new(map, errors.clone(), batch_operations);
    let file_id = FileId(0x5e1f_c4ec);

    let prefixes = summarize_address_range(SELF_CHECK_LOW, SELF_CHECK_HIGH);
    for prefix in &prefixes {
        mappings.insert(pid, *prefix, file_id, SELF_CHECK_LOW, UnwindProgram::Native)?;
    }
    info!(
        "stored 0x{:x}-0x{:x} as {} prefixes",
        SELF_CHECK_LOW,
        SELF_CHECK_HIGH,
        prefixes.len()
    );

    for page in (SELF_CHECK_LOW..=SELF_CHECK_HIGH).step_by(0x1000) {
        let found = mappings
            .lookup(pid, page)
            .with_context(|| format!("lookup of page 0x{:x}", page))?;
        if found != (file_id, SELF_CHECK_LOW) {
            bail!("page 0x{:x} resolved to {:?}", page, found);
        }
    }
    if mappings.lookup(pid, SELF_CHECK_HIGH + 1).is_ok() {
        bail!("page past the mapping resolved");
    }

    let deleted = mappings.delete_many(pid, &prefixes)?;
    info!("deleted {} prefixes", deleted);
    for metric in errors.collect() {
        info!("{}: {}", metric.id, metric.value);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let level = match args.logging {
        LoggingLevel::Trace => Level::TRACE,
        LoggingLevel::Debug => Level::DEBUG,
        LoggingLevel::Info => Level::INFO,
        LoggingLevel::Warn => Level::WARN,
        LoggingLevel::Error => Level::ERROR,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
        .with_ansi(std::io::stdout().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let factory = LibbpfMapFactory;
    let capabilities = BatchCapabilities::probe(&factory);
    println!("generic batch operations: {}", capabilities.generic);
    println!("lpm trie batch operations: {}", capabilities.lpm_trie);

    if args.lpm_self_check {
        let batch_operations = capabilities.lpm_trie && !args.no_batch;
        lpm_self_check(&factory, batch_operations)?;
        println!("lpm self check passed");
    }

    Ok(())
}
