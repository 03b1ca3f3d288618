use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::likelihood::{Engine, Evaluation, Rejection};

#[derive(Debug, Clone, Serialize)]
pub struct TreeReport {
    pub tree: String,
    pub status: &'static str,
    /// `None` when rejected (scores `-inf`).
    pub log_likelihood: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_type_probs: Option<Vec<f64>>,
}

impl TreeReport {
    pub fn new(tree: String, evaluation: &Evaluation) -> Self {
        match evaluation {
            Evaluation::Scored(s) => Self {
                tree,
                status: "scored",
                log_likelihood: Some(s.log_likelihood),
                rejection: None,
                root_type_probs: Some(s.root_type_probs.clone()),
            },
            Evaluation::Rejected(reason) => Self {
                tree,
                status: "rejected",
                log_likelihood: None,
                rejection: Some(*reason),
                root_type_probs: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationSummary {
    pub type_names: Vec<String>,
    pub engine: Engine,
    pub trees: Vec<TreeReport>,
}

fn create_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output dir {parent:?}"))?;
    }
    Ok(())
}

pub fn write_results_tsv(path: &Path, summary: &EvaluationSummary) -> Result<()> {
    create_parent_dir(path)?;
    let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
    let mut w = BufWriter::new(file);
    write!(w, "tree\tstatus\tlog_likelihood")?;
    for name in &summary.type_names {
        write!(w, "\troot_prob_{name}")?;
    }
    writeln!(w)?;

    for r in &summary.trees {
        let ll = match r.log_likelihood {
            Some(v) => format!("{v:.10e}"),
            None => "-inf".to_string(),
        };
        write!(w, "{}\t{}\t{}", r.tree, r.status, ll)?;
        for i in 0..summary.type_names.len() {
            match r.root_type_probs.as_ref().and_then(|p| p.get(i)) {
                Some(p) => write!(w, "\t{p:.8e}")?,
                None => write!(w, "\tNA")?,
            }
        }
        writeln!(w)?;
    }
    w.flush()?;
    Ok(())
}

pub fn write_results_json(path: &Path, summary: &EvaluationSummary) -> Result<()> {
    create_parent_dir(path)?;
    let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, summary)
        .with_context(|| format!("failed to write {path:?}"))?;
    Ok(())
}
