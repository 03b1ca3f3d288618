use anyhow::{Context, Result, bail};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::config::LikelihoodConfig;
use crate::likelihood::BdmmLikelihood;
use crate::schedule::{RateSchedule, RateScheduleSpec};
use crate::tree::Tree;

/// One node of a serialized tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(default)]
    pub parent: Option<usize>,
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<NodeRecord>,
}

impl TreeFile {
    pub fn to_tree(&self) -> crate::error::Result<Tree> {
        let parents: Vec<Option<usize>> = self.nodes.iter().map(|n| n.parent).collect();
        let heights: Vec<f64> = self.nodes.iter().map(|n| n.height).collect();
        let labels = self.nodes.iter().map(|n| n.label.clone()).collect();
        Tree::from_parents(&parents, &heights, labels)
    }

    pub fn from_tree(tree: &Tree, name: Option<String>) -> Self {
        let nodes = (0..tree.node_count())
            .map(|i| {
                let node = tree.node(i);
                NodeRecord {
                    parent: node.parent,
                    height: node.height,
                    label: node.label.clone(),
                }
            })
            .collect();
        Self { name, nodes }
    }
}

/// Model file: rate schedule, root frequencies, evaluation settings and the
/// trees to score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFile {
    pub schedule: RateScheduleSpec,
    /// Uniform over types when omitted.
    #[serde(default)]
    pub frequencies: Option<Vec<f64>>,
    #[serde(default)]
    pub config: LikelihoodConfig,
    #[serde(default)]
    pub trees: Vec<TreeFile>,
}

impl ModelFile {
    pub fn likelihood(&self, config: LikelihoodConfig) -> Result<BdmmLikelihood> {
        let schedule =
            RateSchedule::new(self.schedule.clone()).context("invalid rate schedule")?;
        let n_types = schedule.n_types();
        let frequencies = self
            .frequencies
            .clone()
            .unwrap_or_else(|| vec![1.0 / n_types as f64; n_types]);
        let likelihood = BdmmLikelihood::new(schedule, frequencies, config)
            .context("failed to set up likelihood")?;
        Ok(likelihood)
    }

    pub fn trees(&self) -> Result<Vec<Tree>> {
        if self.trees.is_empty() {
            bail!("model file contains no trees");
        }
        self.trees
            .iter()
            .enumerate()
            .map(|(i, t)| {
                t.to_tree()
                    .with_context(|| format!("invalid tree {}", tree_name(t, i)))
            })
            .collect()
    }
}

/// Display name of the `index`-th tree of a model file.
pub fn tree_name(tree: &TreeFile, index: usize) -> String {
    tree.name.clone().unwrap_or_else(|| format!("tree_{index}"))
}

fn is_gz(path: &Path) -> bool {
    path.extension().map(|e| e == "gz").unwrap_or(false)
}

pub fn load_model(path: &Path) -> Result<ModelFile> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let reader: Box<dyn Read> = if is_gz(path) {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    let model =
        serde_json::from_reader(reader).with_context(|| format!("failed to parse {:?}", path))?;
    Ok(model)
}

pub fn save_model(path: &Path, model: &ModelFile) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
    if is_gz(path) {
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer_pretty(&mut encoder, model)
            .with_context(|| format!("failed to write {:?}", path))?;
        encoder
            .finish()
            .and_then(|mut w| w.flush())
            .with_context(|| format!("failed to write {:?}", path))?;
    } else {
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, model)
            .with_context(|| format!("failed to write {:?}", path))?;
        writer
            .flush()
            .with_context(|| format!("failed to write {:?}", path))?;
    }
    Ok(())
}
