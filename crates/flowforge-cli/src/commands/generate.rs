//! The `generate` command: drive the record-generator pipeline.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Args;

use flowforge_core::recgen::classes::{GenContext, standard_classes};
use flowforge_core::recgen::{
    FILE_CACHE_SIZE_RANGE, GeneratorConfig, OutputMode, run_generator, split_windows,
    subprocess_seed,
};
use flowforge_core::site::{Site, SiteConfig};
use flowforge_core::stream::CompressionMethod;

use super::parse_time;

#[derive(Args)]
pub struct GenerateArgs {
    /// First record time: epoch ms or YYYY/MM/DD[:HH]
    #[arg(long, value_parser = parse_time)]
    pub start_time: i64,

    /// Last record time: epoch ms or YYYY/MM/DD[:HH]
    #[arg(long, value_parser = parse_time)]
    pub end_time: i64,

    /// Milliseconds the clock advances per step
    #[arg(long, default_value = "60000")]
    pub time_step: i64,

    /// Events generated per step
    #[arg(long, default_value = "4")]
    pub events_per_step: u32,

    /// Seed for the dispatch and content streams
    #[arg(long, default_value = "12345")]
    pub seed: u32,

    /// Split the run across this many child processes (0 = in-process)
    #[arg(long, default_value = "0")]
    pub num_subprocesses: u32,

    /// Seconds of record time between flush/publish passes
    #[arg(long, default_value = "120")]
    pub flush_timeout: u64,

    /// Bound on concurrently open hourly files
    #[arg(long, default_value = "32")]
    pub file_cache_size: usize,

    /// Bound on each producer's queue, in events
    #[arg(long, default_value = "16")]
    pub max_available: usize,

    /// Order records by end time before writing
    #[arg(long)]
    pub use_heap: bool,

    /// Root of the data repository
    #[arg(long, default_value = ".")]
    pub root_dir: PathBuf,

    /// Site configuration JSON; a built-in single-class site is used when
    /// absent
    #[arg(long)]
    pub site_config: Option<PathBuf>,

    /// Flow class to generate for
    #[arg(long, default_value = "all")]
    pub class: String,

    /// Type name for inbound non-web flows
    #[arg(long, default_value = "in")]
    pub flowtype_in: String,

    /// Type name for inbound web flows
    #[arg(long, default_value = "inweb")]
    pub flowtype_inweb: String,

    /// Type name for outbound non-web flows
    #[arg(long, default_value = "out")]
    pub flowtype_out: String,

    /// Type name for outbound web flows
    #[arg(long, default_value = "outweb")]
    pub flowtype_outweb: String,

    /// Directory incremental files are built in (default: <root>/processing)
    #[arg(long)]
    pub processing_dir: Option<PathBuf>,

    /// Directory completed files are published into (default: <root>/incoming)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Write everything to this single stream instead of hourly files
    #[arg(long, conflicts_with_all = ["processing_dir", "output_dir"])]
    pub output_file: Option<PathBuf>,

    /// Compression for single-file output
    #[arg(long, default_value = "none", value_parser = ["none", "zlib"])]
    pub compression: String,
}

pub fn run(args: GenerateArgs) -> Result<(), String> {
    if !FILE_CACHE_SIZE_RANGE.contains(&args.file_cache_size) {
        return Err(format!(
            "--file-cache-size must be in {}..={}",
            FILE_CACHE_SIZE_RANGE.start(),
            FILE_CACHE_SIZE_RANGE.end()
        ));
    }
    if args.num_subprocesses > 0 {
        if args.output_file.is_some() {
            return Err("subprocess mode requires directory output".to_string());
        }
        return run_parent(&args);
    }

    let site = load_site(&args)?;
    let ctx = build_context(&args, site)?;
    let cfg = build_config(&args)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        log::warn!("interrupt received, shutting down");
        flag.store(true, Ordering::Relaxed);
    })
    .map_err(|e| format!("cannot install interrupt handler: {e}"))?;

    let stats = run_generator(&cfg, &standard_classes(), ctx, shutdown)
        .map_err(|e| e.to_string())?;
    println!(
        "generated {} records in {} events ({} files published)",
        stats.records, stats.events, stats.files_published
    );
    Ok(())
}

/// Parent side of subprocess mode: one child per contiguous time window,
/// each with its own working directory and adjusted seed.
fn run_parent(args: &GenerateArgs) -> Result<(), String> {
    let windows = split_windows(
        args.start_time,
        args.end_time,
        args.time_step,
        args.num_subprocesses,
    );
    let exe = std::env::current_exe().map_err(|e| format!("cannot locate executable: {e}"))?;
    let processing_root = processing_dir(args);

    let mut children = Vec::new();
    for (i, (start, end)) in windows.iter().enumerate() {
        let child_processing = processing_root.join(format!("worker-{i:02}"));
        let mut cmd = Command::new(&exe);
        cmd.arg("generate")
            .arg("--start-time")
            .arg(start.to_string())
            .arg("--end-time")
            .arg(end.to_string())
            .arg("--time-step")
            .arg(args.time_step.to_string())
            .arg("--events-per-step")
            .arg(args.events_per_step.to_string())
            .arg("--seed")
            .arg(subprocess_seed(args.seed, i as u32).to_string())
            .arg("--num-subprocesses")
            .arg("0")
            .arg("--flush-timeout")
            .arg(args.flush_timeout.to_string())
            .arg("--file-cache-size")
            .arg(args.file_cache_size.to_string())
            .arg("--max-available")
            .arg(args.max_available.to_string())
            .arg("--root-dir")
            .arg(&args.root_dir)
            .arg("--class")
            .arg(&args.class)
            .arg("--flowtype-in")
            .arg(&args.flowtype_in)
            .arg("--flowtype-inweb")
            .arg(&args.flowtype_inweb)
            .arg("--flowtype-out")
            .arg(&args.flowtype_out)
            .arg("--flowtype-outweb")
            .arg(&args.flowtype_outweb)
            .arg("--processing-dir")
            .arg(&child_processing)
            .arg("--output-dir")
            .arg(output_dir(args));
        if let Some(site) = &args.site_config {
            cmd.arg("--site-config").arg(site);
        }
        if args.use_heap {
            cmd.arg("--use-heap");
        }
        log::info!("spawning worker {i} for window [{start}, {end}]");
        let child = cmd
            .spawn()
            .map_err(|e| format!("cannot spawn worker {i}: {e}"))?;
        children.push((i, child));
    }

    let mut failed = 0;
    for (i, mut child) in children {
        let status = child
            .wait()
            .map_err(|e| format!("cannot wait for worker {i}: {e}"))?;
        if !status.success() {
            log::error!("worker {i} exited with {status}");
            failed += 1;
        }
    }
    if failed > 0 {
        return Err(format!("{failed} worker(s) failed"));
    }
    Ok(())
}

fn processing_dir(args: &GenerateArgs) -> PathBuf {
    args.processing_dir
        .clone()
        .unwrap_or_else(|| args.root_dir.join("processing"))
}

fn output_dir(args: &GenerateArgs) -> PathBuf {
    args.output_dir
        .clone()
        .unwrap_or_else(|| args.root_dir.join("incoming"))
}

fn load_site(args: &GenerateArgs) -> Result<SiteConfig, String> {
    let site = match &args.site_config {
        Some(path) => SiteConfig::load(path)
            .map_err(|e| format!("cannot load site config {}: {e}", path.display()))?,
        None => SiteConfig::default_site(),
    };
    Ok(site.with_root(args.root_dir.clone()))
}

fn build_context(args: &GenerateArgs, site: SiteConfig) -> Result<Arc<GenContext>, String> {
    let lookup = |type_name: &str| {
        site.flowtype_lookup(&args.class, type_name)
            .ok_or_else(|| format!("site has no flowtype {}/{type_name}", args.class))
    };
    let ft_in = lookup(&args.flowtype_in)?;
    let ft_inweb = lookup(&args.flowtype_inweb)?;
    let ft_out = lookup(&args.flowtype_out)?;
    let ft_outweb = lookup(&args.flowtype_outweb)?;

    let class_id = site
        .flowtype_class(ft_in)
        .ok_or_else(|| format!("flowtype {ft_in} has no class"))?;
    let sensors = site.sensors_for_class(class_id);
    if sensors.is_empty() {
        return Err(format!("no sensors collect class {}", args.class));
    }

    Ok(Arc::new(GenContext {
        site: Arc::new(site),
        sensors,
        ft_in,
        ft_inweb,
        ft_out,
        ft_outweb,
        sensor_for_ip: None,
    }))
}

fn build_config(args: &GenerateArgs) -> Result<GeneratorConfig, String> {
    let compression = match args.compression.as_str() {
        "zlib" => CompressionMethod::Zlib,
        _ => CompressionMethod::None,
    };
    let output = match &args.output_file {
        Some(path) => OutputMode::SingleFile(path.clone()),
        None => OutputMode::Directory {
            processing_dir: processing_dir(args),
            output_dir: output_dir(args),
        },
    };
    Ok(GeneratorConfig {
        start_time_ms: args.start_time,
        end_time_ms: args.end_time,
        time_step_ms: args.time_step,
        events_per_step: args.events_per_step,
        seed: args.seed,
        max_available: args.max_available,
        flush_timeout_ms: (args.flush_timeout * 1000) as i64,
        file_cache_size: args.file_cache_size,
        use_heap: args.use_heap,
        compression,
        output,
    })
}
