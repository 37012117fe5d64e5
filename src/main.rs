use anyhow::{Context, Result, bail};
use ndarray::{Array1, Array2, Axis, Zip, array};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use branchmap::aggregate::compose_probabilities;
use branchmap::config::ItemKind;
use branchmap::io::{self, Job, JobItem, RawItem};
use branchmap::logictree::{Branch, BranchSet, Dataset, LogicTree};
use branchmap::{
    AssociationIndex, BlockArgs, CancelToken, Config, PartialResult, ProbabilityMap, Stage,
    runtime,
};

enum RunMode {
    Run { input: PathBuf, output: PathBuf },
    Demo { output: PathBuf },
}

fn usage() -> ! {
    eprintln!("usage: branchmap <job.npz> [result.npz]\n       branchmap --demo <job.npz>");
    std::process::exit(1);
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn default_output_path(input: &Path) -> PathBuf {
    let parent = input
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("job");
    parent.join(format!("{stem}_result.npz"))
}

fn parse_args() -> Result<RunMode> {
    let mut args = env::args().skip(1);
    let first = args.next().unwrap_or_else(|| usage());
    if first == "--demo" {
        let out = args.next().unwrap_or_else(|| usage());
        return Ok(RunMode::Demo {
            output: PathBuf::from(out),
        });
    }

    let input = PathBuf::from(first);
    if !input.exists() {
        bail!("input {:?} does not exist", input);
    }
    let output = if let Some(explicit) = args.next() {
        PathBuf::from(explicit)
    } else if let Ok(from_env) = env::var("BRANCHMAP_RESULT_PATH") {
        PathBuf::from(from_env)
    } else {
        default_output_path(&input)
    };
    Ok(RunMode::Run { input, output })
}

/// Read-only data every block sees.
struct HazardContext {
    levels: Array1<f64>,
    site_factors: Vec<f64>,
    scales: HashMap<String, f64>,
}

/// Poissonian exceedance: `1 - exp(-rate * units * scale * site * exp(-level))`
/// per item, composed over the block's items.
fn hazard(args: &BlockArgs<JobItem, HazardContext>) -> Result<PartialResult<ProbabilityMap>> {
    let ctx = &*args.context;
    let shape = (ctx.site_factors.len(), ctx.levels.len());
    let scales = args
        .variants
        .iter()
        .map(|v| {
            ctx.scales
                .get(v)
                .copied()
                .with_context(|| format!("no scale for variant {v}"))
        })
        .collect::<Result<Vec<f64>>>()?;
    let mut acc: Vec<Array2<f64>> = vec![Array2::zeros(shape); args.variants.len()];
    let decay = ctx.levels.mapv(|l| (-l).exp());

    let mut out = PartialResult::new();
    for it in &args.items {
        let t0 = Instant::now();
        if !(it.rate.is_finite() && it.rate >= 0.0) {
            bail!("item {} has invalid rate {}", it.id, it.rate);
        }
        for (curves, &scale) in acc.iter_mut().zip(&scales) {
            for (mut row, &site) in curves.axis_iter_mut(Axis(0)).zip(&ctx.site_factors) {
                let rate = it.rate * it.units as f64 * scale * site;
                Zip::from(&mut row).and(&decay).for_each(|c, &d| {
                    *c = compose_probabilities(*c, 1.0 - (-rate * d).exp());
                });
            }
        }
        out.diagnostics
            .record(args.group, &it.id, t0.elapsed().as_secs_f64(), it.units);
        out.extents
            .merge(args.group, it.index, &[&[it.rate], &[it.units as f64]])?;
    }

    for (variant, curves) in args.variants.iter().zip(acc) {
        let mut map = ProbabilityMap::new(shape.1);
        for (site, row) in curves.axis_iter(Axis(0)).enumerate() {
            map.insert(site as u32, row.to_owned())?;
        }
        out.insert(args.group, variant.clone(), map);
    }
    Ok(out)
}

fn demo_job() -> Job {
    let variants = vec![
        BranchSet::new(
            io::category_label(0),
            vec![
                Branch::new("b0_0", "v0_0", 0.5),
                Branch::new("b0_1", "v0_1", 0.3),
                Branch::new("b0_2", "v0_2", 0.2),
            ],
        ),
        BranchSet::new(
            io::category_label(1),
            vec![Branch::new("b1_0", "v1_0", 0.6), Branch::new("b1_1", "v1_1", 0.4)],
        ),
    ];
    let datasets = vec![
        Dataset {
            branch: Branch::new("sm0", "dataset-0", 0.6),
            categories: vec![io::category_label(0), io::category_label(1)],
        },
        Dataset {
            branch: Branch::new("sm1", "dataset-1", 0.4),
            categories: vec![io::category_label(0)],
        },
    ];
    let items = (0..40u32)
        .map(|i| {
            let dataset = (i % 4 == 3) as usize;
            RawItem {
                index: i,
                dataset,
                level: if dataset == 1 { 0 } else { (i % 2) as usize },
                units: 10 + u64::from(i * 37 % 200),
                kind: if i % 3 == 0 {
                    ItemKind::Point
                } else {
                    ItemKind::Extended
                },
                rate: 1e-4 * f64::from(1 + i % 5),
            }
        })
        .collect();
    // rate uncertainty on every dataset
    let modifiers = vec![BranchSet::new(
        io::modifier_label(0),
        vec![Branch::new("m0_0", "m0_0", 0.7), Branch::new("m0_1", "m0_1", 0.3)],
    )];
    let scales = [("v0_0", 1.0), ("v0_1", 1.5), ("v0_2", 0.7), ("v1_0", 1.0), ("v1_1", 1.2)];
    Job {
        tree: LogicTree {
            datasets,
            modifiers,
            variants,
        },
        items,
        levels: array![0.05, 0.1, 0.2, 0.4, 0.8],
        site_factors: vec![1.0, 0.8, 0.5, 0.2],
        variant_scales: scales.iter().map(|&(k, s)| (k.to_string(), s)).collect(),
        modifier_scales: HashMap::from([("m0_1".to_string(), 1.8)]),
        split_units: 100,
    }
}

fn run(input: &Path, output: &Path) -> Result<()> {
    let cfg = Config::from_env().context("read configuration")?;
    let job = io::load_job(input)?;
    info!(
        datasets = job.tree.datasets.len(),
        items = job.items.len(),
        "loaded job from {}",
        input.display()
    );

    let enumeration = job.tree.realizations(&cfg)?;
    let items = job.resolve_items(&enumeration.source_models);
    let assoc = AssociationIndex::build(enumeration)?;

    let mut cancel = CancelToken::watching_signals();
    if let Ok(secs) = env::var("BRANCHMAP_DEADLINE_SECS") {
        let secs: u64 = secs
            .trim()
            .parse()
            .with_context(|| format!("BRANCHMAP_DEADLINE_SECS={secs:?}"))?;
        cancel = cancel.with_deadline(Instant::now() + Duration::from_secs(secs));
    }

    let context = Arc::new(HazardContext {
        levels: job.levels.clone(),
        site_factors: job.site_factors.clone(),
        scales: job.variant_scales.clone(),
    });
    let result = Stage::new(&cfg, &assoc)
        .with_cancel(cancel)
        .with_progress(true)
        .with_key_space(job.site_factors.len())
        .run(items, context, hazard)?;

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
    }
    io::save_aggregate(output, &result, &cfg.quantiles)?;
    info!(
        realizations = result.len(),
        "results written to {}",
        output.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    init_logging();
    runtime::install_interrupt_handler();

    match parse_args()? {
        RunMode::Demo { output } => {
            io::save_job(&output, &demo_job())?;
            info!("demo job written to {}", output.display());
            Ok(())
        }
        RunMode::Run { input, output } => run(&input, &output),
    }
}
