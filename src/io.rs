use anyhow::{Context, Result, bail, ensure};
use ndarray::{Array1, Array2};
use ndarray_npy::{NpzReader, NpzWriter};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use crate::aggregate::{AggregateResult, ProbabilityMap};
use crate::config::ItemKind;
use crate::driver::WorkItem;
use crate::logictree::{Branch, BranchSet, Dataset, GroupId, LogicTree, SourceModel};

fn read_i32<R: Read + Seek>(npz: &mut NpzReader<R>, name: &str) -> Result<Array1<i32>> {
    let arr: Array1<i32> = npz
        .by_name(name)
        .with_context(|| format!("missing {}", name))?;
    Ok(arr)
}

fn read_i64<R: Read + Seek>(npz: &mut NpzReader<R>, name: &str) -> Result<Array1<i64>> {
    let arr: Array1<i64> = npz
        .by_name(name)
        .with_context(|| format!("missing {}", name))?;
    Ok(arr)
}

fn read_f64<R: Read + Seek>(npz: &mut NpzReader<R>, name: &str) -> Result<Array1<f64>> {
    let arr: Array1<f64> = npz
        .by_name(name)
        .with_context(|| format!("missing {}", name))?;
    Ok(arr)
}

/// Slices `data` by a CSR-style `indptr`.
fn ragged<T: Clone>(indptr: &Array1<i64>, data: &[T], what: &str) -> Result<Vec<Vec<T>>> {
    let mut out = Vec::with_capacity(indptr.len().saturating_sub(1));
    for w in indptr.as_slice().unwrap_or(&[]).windows(2) {
        let (s, e) = (w[0] as usize, w[1] as usize);
        ensure!(s <= e && e <= data.len(), "{what}: bad indptr [{s}, {e})");
        out.push(data[s..e].to_vec());
    }
    Ok(out)
}

pub fn category_label(level: usize) -> String {
    format!("T{level}")
}

fn variant_value(level: usize, branch: usize) -> String {
    format!("v{level}_{branch}")
}

pub fn modifier_label(level: usize) -> String {
    format!("M{level}")
}

fn modifier_id(level: usize, branch: usize) -> String {
    format!("m{level}_{branch}")
}

/// A work item as stored in the job, before group resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct RawItem {
    pub index: u32,
    pub dataset: usize,
    pub level: usize,
    pub units: u64,
    pub kind: ItemKind,
    /// Occurrence rate per unit.
    pub rate: f64,
}

/// Item bound to one group of one resolved source model.
#[derive(Debug, Clone, PartialEq)]
pub struct JobItem {
    pub id: String,
    pub index: u32,
    pub group: GroupId,
    pub units: u64,
    pub kind: ItemKind,
    pub rate: f64,
    /// Pieces are at most this many units; 0 disables splitting.
    pub split_units: u64,
}

impl WorkItem for JobItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn group(&self) -> GroupId {
        self.group
    }

    fn units(&self) -> u64 {
        self.units
    }

    fn kind(&self) -> ItemKind {
        self.kind
    }

    fn split(self) -> Vec<Self> {
        if self.split_units == 0 || self.units <= self.split_units {
            return vec![self];
        }
        let mut pieces = Vec::new();
        let mut left = self.units;
        let mut n = 0;
        while left > 0 {
            let units = left.min(self.split_units);
            pieces.push(JobItem {
                id: format!("{}:{n}", self.id),
                units,
                ..self.clone()
            });
            left -= units;
            n += 1;
        }
        pieces
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub tree: LogicTree,
    pub items: Vec<RawItem>,
    /// Intensity levels, one per curve entry.
    pub levels: Array1<f64>,
    pub site_factors: Vec<f64>,
    /// Multiplier per variant value.
    pub variant_scales: HashMap<String, f64>,
    /// Rate multiplier per modifier branch id; missing ids scale by 1.
    pub modifier_scales: HashMap<String, f64>,
    pub split_units: u64,
}

impl Job {
    /// Copies every item into each resolved source model of its dataset,
    /// with the rate scaled by the model's modifier branches.
    pub fn resolve_items(&self, source_models: &[SourceModel]) -> Vec<JobItem> {
        let mut out = Vec::new();
        for (d, ds) in self.tree.datasets.iter().enumerate() {
            for sm in source_models.iter().filter(|sm| sm.path.first() == Some(&ds.branch.id)) {
                let scale: f64 = sm.path[1..]
                    .iter()
                    .map(|id| self.modifier_scales.get(id).copied().unwrap_or(1.0))
                    .product();
                for it in self.items.iter().filter(|it| it.dataset == d) {
                    let category = category_label(it.level);
                    let Some(g) = sm.groups.iter().find(|g| g.category == category) else {
                        continue;
                    };
                    out.push(JobItem {
                        id: format!("{}/{}", sm.path_string(), it.index),
                        index: it.index,
                        group: g.id,
                        units: it.units,
                        kind: it.kind,
                        rate: it.rate * scale,
                        split_units: self.split_units,
                    });
                }
            }
        }
        out
    }
}

pub fn load_job(path: &Path) -> Result<Job> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut npz = NpzReader::new(f).context("read npz")?;

    let ds_weights = read_f64(&mut npz, "dataset_weights.npy")?;
    let ds_indptr = read_i64(&mut npz, "dataset_categories_indptr.npy")?;
    let ds_data = read_i32(&mut npz, "dataset_categories_data.npy")?.to_vec();
    let ds_levels = ragged(&ds_indptr, &ds_data, "dataset categories")?;
    ensure!(
        ds_levels.len() == ds_weights.len(),
        "{} datasets but {} category lists",
        ds_weights.len(),
        ds_levels.len()
    );

    let v_indptr = read_i64(&mut npz, "variant_indptr.npy")?;
    let v_weights = read_f64(&mut npz, "variant_weights.npy")?.to_vec();
    let v_scales = read_f64(&mut npz, "variant_scales.npy")?.to_vec();
    ensure!(
        v_weights.len() == v_scales.len(),
        "variant weights and scales differ in length"
    );
    let v_levels = ragged(&v_indptr, &v_weights, "variant weights")?;
    let s_levels = ragged(&v_indptr, &v_scales, "variant scales")?;

    let mut variants = Vec::with_capacity(v_levels.len());
    let mut variant_scales = HashMap::new();
    for (l, (weights, scales)) in v_levels.iter().zip(&s_levels).enumerate() {
        let branches = weights
            .iter()
            .enumerate()
            .map(|(j, &w)| Branch::new(format!("b{l}_{j}"), variant_value(l, j), w))
            .collect();
        for (j, &s) in scales.iter().enumerate() {
            variant_scales.insert(variant_value(l, j), s);
        }
        variants.push(BranchSet::new(category_label(l), branches));
    }

    // optional; absent means a single source path per dataset
    let mut modifiers = Vec::new();
    let mut modifier_scales = HashMap::new();
    if let Ok(m_indptr) = read_i64(&mut npz, "modifier_indptr.npy") {
        let m_weights = read_f64(&mut npz, "modifier_weights.npy")?.to_vec();
        let m_scales = read_f64(&mut npz, "modifier_scales.npy")?.to_vec();
        ensure!(
            m_weights.len() == m_scales.len(),
            "modifier weights and scales differ in length"
        );
        let w_levels = ragged(&m_indptr, &m_weights, "modifier weights")?;
        let s_levels = ragged(&m_indptr, &m_scales, "modifier scales")?;
        for (l, (weights, scales)) in w_levels.iter().zip(&s_levels).enumerate() {
            let branches = weights
                .iter()
                .enumerate()
                .map(|(j, &w)| Branch::new(modifier_id(l, j), modifier_id(l, j), w))
                .collect();
            for (j, &s) in scales.iter().enumerate() {
                modifier_scales.insert(modifier_id(l, j), s);
            }
            modifiers.push(BranchSet::new(modifier_label(l), branches));
        }
    }

    let mut datasets = Vec::with_capacity(ds_weights.len());
    for (d, (&w, levels)) in ds_weights.iter().zip(&ds_levels).enumerate() {
        let categories = levels
            .iter()
            .map(|&l| {
                if l < 0 || l as usize >= variants.len() {
                    bail!("dataset {d} refers to unknown level {l}");
                }
                Ok(category_label(l as usize))
            })
            .collect::<Result<Vec<_>>>()?;
        datasets.push(Dataset {
            branch: Branch::new(format!("sm{d}"), format!("dataset-{d}"), w),
            categories,
        });
    }

    let it_dataset = read_i32(&mut npz, "item_dataset.npy")?;
    let it_level = read_i32(&mut npz, "item_category.npy")?;
    let it_units = read_i64(&mut npz, "item_units.npy")?;
    let it_point = read_i32(&mut npz, "item_point.npy")?;
    let it_rate = read_f64(&mut npz, "item_rate.npy")?;
    let n = it_dataset.len();
    ensure!(
        [it_level.len(), it_units.len(), it_point.len(), it_rate.len()]
            .iter()
            .all(|&len| len == n),
        "item arrays differ in length"
    );
    let mut items = Vec::with_capacity(n);
    for i in 0..n {
        let (d, l, u) = (it_dataset[i], it_level[i], it_units[i]);
        ensure!(
            d >= 0 && (d as usize) < datasets.len(),
            "item {i} refers to unknown dataset {d}"
        );
        ensure!(
            l >= 0 && (l as usize) < variants.len(),
            "item {i} refers to unknown level {l}"
        );
        ensure!(u >= 0, "item {i} has negative units");
        items.push(RawItem {
            index: i as u32,
            dataset: d as usize,
            level: l as usize,
            units: u as u64,
            kind: if it_point[i] != 0 {
                ItemKind::Point
            } else {
                ItemKind::Extended
            },
            rate: it_rate[i],
        });
    }

    let levels = read_f64(&mut npz, "levels.npy")?;
    let site_factors = read_f64(&mut npz, "site_factors.npy")?.to_vec();
    // optional
    let split_units = read_i64(&mut npz, "split_units.npy")
        .ok()
        .and_then(|a| a.get(0).copied())
        .unwrap_or(0)
        .max(0) as u64;

    Ok(Job {
        tree: LogicTree {
            datasets,
            modifiers,
            variants,
        },
        items,
        levels,
        site_factors,
        variant_scales,
        modifier_scales,
        split_units,
    })
}

/// Inverse of [`load_job`]; variant and modifier branches are written in
/// level order and renamed on the way back in.
pub fn save_job(path: &Path, job: &Job) -> Result<()> {
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut npz = NpzWriter::new(f);

    let ds_weights: Vec<f64> = job.tree.datasets.iter().map(|d| d.branch.weight).collect();
    let mut ds_indptr = vec![0i64];
    let mut ds_data = Vec::new();
    for ds in &job.tree.datasets {
        for cat in &ds.categories {
            let level = job
                .tree
                .variants
                .iter()
                .position(|set| &set.label == cat)
                .with_context(|| format!("category {cat} has no variant level"))?;
            ds_data.push(level as i32);
        }
        ds_indptr.push(ds_data.len() as i64);
    }
    npz.add_array("dataset_weights.npy", &Array1::from_vec(ds_weights))?;
    npz.add_array("dataset_categories_indptr.npy", &Array1::from_vec(ds_indptr))?;
    npz.add_array("dataset_categories_data.npy", &Array1::from_vec(ds_data))?;

    let mut v_indptr = vec![0i64];
    let mut v_weights = Vec::new();
    let mut v_scales = Vec::new();
    for set in &job.tree.variants {
        for br in &set.branches {
            v_weights.push(br.weight);
            v_scales.push(job.variant_scales.get(&br.value).copied().unwrap_or(1.0));
        }
        v_indptr.push(v_weights.len() as i64);
    }
    npz.add_array("variant_indptr.npy", &Array1::from_vec(v_indptr))?;
    npz.add_array("variant_weights.npy", &Array1::from_vec(v_weights))?;
    npz.add_array("variant_scales.npy", &Array1::from_vec(v_scales))?;

    if !job.tree.modifiers.is_empty() {
        let mut m_indptr = vec![0i64];
        let mut m_weights = Vec::new();
        let mut m_scales = Vec::new();
        for set in &job.tree.modifiers {
            for br in &set.branches {
                m_weights.push(br.weight);
                m_scales.push(job.modifier_scales.get(&br.id).copied().unwrap_or(1.0));
            }
            m_indptr.push(m_weights.len() as i64);
        }
        npz.add_array("modifier_indptr.npy", &Array1::from_vec(m_indptr))?;
        npz.add_array("modifier_weights.npy", &Array1::from_vec(m_weights))?;
        npz.add_array("modifier_scales.npy", &Array1::from_vec(m_scales))?;
    }

    let col = |f: &dyn Fn(&RawItem) -> i32| -> Array1<i32> { job.items.iter().map(f).collect() };
    npz.add_array("item_dataset.npy", &col(&|it| it.dataset as i32))?;
    npz.add_array("item_category.npy", &col(&|it| it.level as i32))?;
    npz.add_array("item_point.npy", &col(&|it| i32::from(it.kind == ItemKind::Point)))?;
    let units: Array1<i64> = job.items.iter().map(|it| it.units as i64).collect();
    let rates: Array1<f64> = job.items.iter().map(|it| it.rate).collect();
    npz.add_array("item_units.npy", &units)?;
    npz.add_array("item_rate.npy", &rates)?;

    npz.add_array("levels.npy", &job.levels)?;
    npz.add_array("site_factors.npy", &Array1::from_vec(job.site_factors.clone()))?;
    npz.add_array("split_units.npy", &Array1::from_vec(vec![job.split_units as i64]))?;

    npz.finish()?;
    Ok(())
}

/// Keys and a `[keys, levels]` matrix.
pub fn curves_to_arrays(map: &ProbabilityMap) -> Result<(Array1<i64>, Array2<f64>)> {
    let keys: Array1<i64> = map.iter().map(|(k, _)| i64::from(k)).collect();
    let mut flat = Vec::with_capacity(map.len() * map.num_levels());
    for (_, curve) in map.iter() {
        flat.extend(curve.iter().copied());
    }
    let curves = Array2::from_shape_vec((map.len(), map.num_levels()), flat)
        .context("curve matrix shape")?;
    Ok((keys, curves))
}

/// Writes one key/curve pair per realization, the realization weights, the
/// statistical mean and quantiles and the diagnostic side channels.
pub fn save_aggregate(
    path: &Path,
    result: &AggregateResult<ProbabilityMap>,
    quantiles: &[f64],
) -> Result<()> {
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut npz = NpzWriter::new(f);

    npz.add_array("weights.npy", &Array1::from_vec(result.weights.clone()))?;
    npz.add_array(
        "sampled.npy",
        &Array1::from_vec(vec![i32::from(result.sampled)]),
    )?;
    for (r, map) in result.iter() {
        let (keys, curves) = curves_to_arrays(map)?;
        npz.add_array(&format!("rlz{}_keys.npy", r), &keys)?;
        npz.add_array(&format!("rlz{}_curves.npy", r), &curves)?;
    }
    let mean = result.statistical_mean().context("mean curves")?;
    let (keys, curves) = curves_to_arrays(&mean)?;
    npz.add_array("mean_keys.npy", &keys)?;
    npz.add_array("mean_curves.npy", &curves)?;
    for &q in quantiles {
        let stat = result
            .statistical_quantile(q)
            .with_context(|| format!("quantile {q} curves"))?;
        let (keys, curves) = curves_to_arrays(&stat)?;
        npz.add_array(&format!("quantile-{q}_keys.npy"), &keys)?;
        npz.add_array(&format!("quantile-{q}_curves.npy"), &curves)?;
    }

    let rows = result.diagnostics.slowest_items();
    let groups: Array1<i64> = rows.iter().map(|r| i64::from(r.0)).collect();
    let calc: Array1<f64> = rows.iter().map(|r| r.2.calc_time).collect();
    let splits: Array1<i64> = rows.iter().map(|r| i64::from(r.2.num_split)).collect();
    let units: Array1<i64> = rows.iter().map(|r| r.2.units as i64).collect();
    npz.add_array("diag_group.npy", &groups)?;
    npz.add_array("diag_calc_time.npy", &calc)?;
    npz.add_array("diag_num_split.npy", &splits)?;
    npz.add_array("diag_units.npy", &units)?;

    let t = result.transfer;
    npz.add_array(
        "transfer.npy",
        &Array1::from_vec(vec![
            t.num_tasks as i64,
            t.sent as i64,
            t.received as i64,
            t.max_received as i64,
        ]),
    )?;

    let boxes = result.extents.sorted();
    let axes = boxes.iter().map(|(_, e)| e.num_axes()).max().unwrap_or(0);
    let mut lo = Array2::from_elem((boxes.len(), axes), f64::NAN);
    let mut hi = Array2::from_elem((boxes.len(), axes), f64::NAN);
    for (row, (_, e)) in boxes.iter().enumerate() {
        for axis in 0..e.num_axes() {
            lo[[row, axis]] = e.min(axis).unwrap_or(f64::NAN);
            hi[[row, axis]] = e.max(axis).unwrap_or(f64::NAN);
        }
    }
    let ext_group: Array1<i64> = boxes.iter().map(|((g, _), _)| i64::from(*g)).collect();
    let ext_item: Array1<i64> = boxes.iter().map(|((_, i), _)| i64::from(*i)).collect();
    npz.add_array("extent_group.npy", &ext_group)?;
    npz.add_array("extent_item.npy", &ext_item)?;
    npz.add_array("extent_lo.npy", &lo)?;
    npz.add_array("extent_hi.npy", &hi)?;

    npz.finish()?;
    Ok(())
}
