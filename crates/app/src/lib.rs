use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use half::f16;
use ndarray::Array4;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use flowsplat_core::config::{config_path, data_dir, initialize_data_dir, SplatConfig};
use flowsplat_core::gradcheck::{self, GradCheckOptions};
use flowsplat_core::host::HostDevice;
use flowsplat_core::kernel_cache::{CacheStats, KernelCache, KernelLauncher};
use flowsplat_core::kernels::{KernelSource, ALL_KERNELS};
use flowsplat_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use flowsplat_core::splat::{max_abs_diff, GradRequest};
use flowsplat_core::toolchain::{log_toolchain_status, Toolchain};
use flowsplat_core::types::{BindingSet, DType, TensorDescriptor};

#[derive(Parser, Debug)]
#[command(
    name = "flowsplat",
    about = "Forward splatting kernels with a template compilation cache"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compare splat gradients against central differences.
    Gradcheck(GradcheckArgs),
    /// Time forward, backward and two-frame compositing.
    Bench(BenchArgs),
    /// Print resolved kernel sources and cache keys for a shape.
    Kernels(KernelsArgs),
}

#[derive(Args, Debug)]
struct GradcheckArgs {
    #[arg(long, value_delimiter = ',', value_name = "N,C,H,W", default_values_t = [1usize, 2, 5, 6])]
    shape: Vec<usize>,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    #[arg(long, default_value_t = 1e-3)]
    tolerance: f32,
    #[arg(long, default_value_t = 0.05)]
    step: f32,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Args, Debug)]
struct BenchArgs {
    #[arg(long, default_value_t = 256)]
    width: usize,
    #[arg(long, default_value_t = 144)]
    height: usize,
    #[arg(long, default_value_t = 3)]
    channels: usize,
    #[arg(long, default_value_t = 5)]
    iterations: u32,
    #[arg(long, help = "Feed half precision inputs to the forward pass")]
    half: bool,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Args, Debug)]
struct KernelsArgs {
    #[arg(long, value_delimiter = ',', value_name = "N,C,H,W", default_values_t = [1usize, 3, 4, 5])]
    shape: Vec<usize>,
    #[arg(long, help = "Only print the cache keys")]
    keys_only: bool,
}

#[derive(Debug, Serialize)]
struct BenchReport {
    shape: [usize; 4],
    iterations: u32,
    half: bool,
    forward_ms: f64,
    backward_ms: f64,
    interpolate_ms: f64,
    block_size_max_abs_diff: f32,
    half_max_abs_diff: Option<f32>,
    holes: usize,
    cache: CacheStats,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    let config = load_config(&resolved_data_dir);
    let toolchain = Toolchain::resolve(&config.toolchain);
    log_toolchain_status(&toolchain);

    let launcher = config.launcher(Arc::new(HostDevice::new()), KernelCache::global());
    match cli.command {
        Commands::Gradcheck(args) => run_gradcheck(&config, launcher, args),
        Commands::Bench(args) => run_bench(&config, launcher, args),
        Commands::Kernels(args) => run_kernels(launcher, &toolchain, args),
    }
}

fn load_config(data_dir: &Path) -> SplatConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    match SplatConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            SplatConfig::default()
        }
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn shape_from_args(values: &[usize]) -> Result<[usize; 4]> {
    let shape: [usize; 4] = values
        .try_into()
        .with_context(|| format!("expected a shape N,C,H,W, got {values:?}"))?;
    if shape.contains(&0) {
        bail!("shape {shape:?} has an empty dimension");
    }
    Ok(shape)
}

fn run_gradcheck(config: &SplatConfig, launcher: KernelLauncher, args: GradcheckArgs) -> Result<()> {
    let options = GradCheckOptions {
        shape: shape_from_args(&args.shape)?,
        seed: args.seed,
        step: args.step,
        tolerance: args.tolerance,
    };
    let splat = config.soft_splat(launcher);
    let report = gradcheck::run(&splat, &options)?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to encode gradcheck report")?
        );
    } else {
        println!(
            "input gradient: max abs {:.3e}, max rel {:.3e}",
            report.input_max_abs_error, report.input_max_rel_error
        );
        println!(
            "flow gradient:  max abs {:.3e}, max rel {:.3e}",
            report.flow_max_abs_error, report.flow_max_rel_error
        );
    }

    if !report.passed {
        bail!(
            "gradient check failed: relative error above {} for shape {:?}",
            report.tolerance,
            report.shape
        );
    }
    Ok(())
}

fn run_bench(config: &SplatConfig, launcher: KernelLauncher, args: BenchArgs) -> Result<()> {
    let shape = shape_from_args(&[1, args.channels, args.height, args.width])?;
    let iterations = args.iterations.max(1);

    let splat = config.soft_splat(launcher.clone());
    let compositor = config.compositor(launcher.clone());
    let (img0, flow01, output_grad) = gradcheck::random_problem(shape, args.seed);
    let (img1, flow10, _) = gradcheck::random_problem(shape, args.seed.wrapping_add(1));
    let metric = Array4::<f32>::zeros((1, 1, args.height, args.width));

    let (forward_time, output) = time_iterations(iterations, || {
        splat.forward(img0.view(), flow01.view())
    })?;
    let (backward_time, _) = time_iterations(iterations, || {
        splat.backward(
            img0.view(),
            flow01.view(),
            output_grad.view(),
            GradRequest::both(),
        )
    })?;
    let (interpolate_time, composite) = time_iterations(iterations, || {
        compositor.interpolate(
            img0.view(),
            img1.view(),
            flow01.view(),
            flow10.view(),
            metric.view(),
            metric.view(),
            0.5,
        )
    })?;

    let single_lane = config.soft_splat(launcher.clone().with_block_size(1));
    let reference = single_lane.forward(img0.view(), flow01.view())?;
    let block_size_max_abs_diff = max_abs_diff(output.view(), reference.view());

    let half_max_abs_diff = if args.half {
        let img_half = img0.mapv(f16::from_f32);
        let flow_half = flow01.mapv(f16::from_f32);
        let half_output = splat.forward_f16(img_half.view(), flow_half.view())?;
        Some(max_abs_diff(output.view(), half_output.view()))
    } else {
        None
    };

    let report = BenchReport {
        shape,
        iterations,
        half: args.half,
        forward_ms: per_iteration_ms(forward_time, iterations),
        backward_ms: per_iteration_ms(backward_time, iterations),
        interpolate_ms: per_iteration_ms(interpolate_time, iterations),
        block_size_max_abs_diff,
        half_max_abs_diff,
        holes: composite.hole_count(),
        cache: launcher.cache().stats(),
    };
    info!(
        forward_ms = report.forward_ms,
        backward_ms = report.backward_ms,
        interpolate_ms = report.interpolate_ms,
        "Benchmark finished"
    );

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to encode bench report")?
        );
    } else {
        println!("shape {:?}, {} iterations", report.shape, report.iterations);
        println!("forward      {}", format_millis(report.forward_ms));
        println!("backward     {}", format_millis(report.backward_ms));
        println!("interpolate  {}", format_millis(report.interpolate_ms));
        println!("block size drift {:.3e}", report.block_size_max_abs_diff);
        if let Some(diff) = report.half_max_abs_diff {
            println!("half precision drift {diff:.3e}");
        }
        println!("holes {}", report.holes);
        println!(
            "cache: {} entries, {} hits, {} misses, {} compilations",
            report.cache.entries, report.cache.hits, report.cache.misses, report.cache.compilations
        );
    }
    Ok(())
}

fn time_iterations<T, F>(iterations: u32, mut body: F) -> Result<(Duration, T)>
where
    F: FnMut() -> Result<T>,
{
    // Warm-up run compiles the kernel outside the timed loop.
    let mut last = body()?;
    let started = Instant::now();
    for _ in 0..iterations {
        last = body()?;
    }
    Ok((started.elapsed(), last))
}

fn per_iteration_ms(total: Duration, iterations: u32) -> f64 {
    total.as_secs_f64() * 1000.0 / f64::from(iterations.max(1))
}

fn format_millis(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2} s", ms / 1000.0)
    } else {
        format!("{ms:.3} ms")
    }
}

/// Layout-only bindings matching what the operators bind for `kernel`.
fn layout_bindings(kernel: &KernelSource, shape: [usize; 4]) -> BindingSet<'static> {
    let [batch, _, height, width] = shape;
    let flow_shape = [batch, 2, height, width];
    let layout = |dims: [usize; 4]| {
        TensorDescriptor::layout_only(
            DType::F32,
            &dims,
            &TensorDescriptor::contiguous_strides(&dims),
        )
    };

    let bindings = BindingSet::new()
        .with_tensor("input", layout(shape))
        .with_tensor("flow", layout(flow_shape));
    match kernel.name {
        "softsplat_ingrad" => bindings
            .with_tensor("output_grad", layout(shape))
            .with_tensor("input_grad", layout(shape)),
        "softsplat_flowgrad" => bindings
            .with_tensor("output_grad", layout(shape))
            .with_tensor("flow_grad", layout(flow_shape)),
        _ => bindings.with_tensor("output", layout(shape)),
    }
}

/// `// compile: nvcc -I <dir> ..`, the line a CUDA backend would run.
fn compile_line(toolchain: &Toolchain) -> String {
    format!("// compile: {}", toolchain.compile_command().join(" "))
}

fn run_kernels(launcher: KernelLauncher, toolchain: &Toolchain, args: KernelsArgs) -> Result<()> {
    let shape = shape_from_args(&args.shape)?;
    let compile = compile_line(toolchain);
    for kernel in ALL_KERNELS.iter() {
        let compiled = launcher
            .prepare(kernel.name, kernel.template, layout_bindings(kernel, shape))
            .with_context(|| format!("failed to prepare kernel `{}`", kernel.name))?;
        println!("// {}", compiled.key);
        println!("// sha256 {}", compiled.source_digest);
        println!("{compile}");
        if !args.keys_only {
            println!("{}", compiled.resolved_source);
        }
    }
    Ok(())
}
