//! Tree likelihood under the multi-type birth-death-migration process.

use std::f64::consts::LN_2;
use std::fmt;

use ndarray::Array2;
use serde::Serialize;

use crate::config::LikelihoodConfig;
use crate::error::{BdmmError, Result};
use crate::integrate::IntervalIntegrator;
use crate::parallel::{ExecutionContext, SplitPolicy};
use crate::schedule::RateSchedule;
use crate::single_type::SingleTypeClosedForm;
use crate::small_number::SmallNumber;
use crate::state::P0GeState;
use crate::tree::{NodeKind, Tree};
use crate::utils::ln_factorial;

const FREQUENCY_TOLERANCE: f64 = 1e-10;

/// Why a tree/parameter combination scores `-inf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Rejection {
    NegativeRootTime,
    NoSampleProbabilityOutOfRange,
    NonFiniteExtinction,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Rejection::NegativeRootTime => "root lies before the origin",
            Rejection::NoSampleProbabilityOutOfRange => {
                "probability of no sampled descendants is outside [0, 1]"
            }
            Rejection::NonFiniteExtinction => "extinction probability is not finite",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeLikelihood {
    pub log_likelihood: f64,
    /// Posterior probability of each type at the root, summing to one.
    pub root_type_probs: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Scored(TreeLikelihood),
    Rejected(Rejection),
}

impl Evaluation {
    pub fn log_likelihood(&self) -> f64 {
        match self {
            Evaluation::Scored(s) => s.log_likelihood,
            Evaluation::Rejected(_) => f64::NEG_INFINITY,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Evaluation::Rejected(_))
    }

    pub fn root_type_probs(&self) -> Option<&[f64]> {
        match self {
            Evaluation::Scored(s) => Some(&s.root_type_probs),
            Evaluation::Rejected(_) => None,
        }
    }
}

/// Which likelihood calculation a `BdmmLikelihood` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    ClosedForm,
    Ode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    Known(usize),
    Unknown,
}

/// Sample types resolved from labels, reused while the tree's samples and
/// their labels stay the same.
#[derive(Debug, Clone, Default)]
struct SampleTypeCache {
    key: Vec<(usize, Option<String>)>,
    by_node: Vec<SampleType>,
}

impl SampleTypeCache {
    fn matches(&self, tree: &Tree) -> bool {
        let samples = tree.samples();
        self.by_node.len() == tree.node_count()
            && self.key.len() == samples.len()
            && self
                .key
                .iter()
                .zip(samples)
                .all(|((node, label), &s)| *node == s && *label == tree.node(s).label)
    }

    fn rebuild(&mut self, schedule: &RateSchedule, tree: &Tree) -> Result<()> {
        let mut by_node = vec![SampleType::Unknown; tree.node_count()];
        let mut key = Vec::with_capacity(tree.sample_count());
        for &node in tree.samples() {
            let label = tree.node(node).label.clone();
            by_node[node] = resolve_label(schedule, node, label.as_deref())?;
            key.push((node, label));
        }
        log::debug!("resolved types of {} samples", key.len());
        self.key = key;
        self.by_node = by_node;
        Ok(())
    }
}

fn resolve_label(schedule: &RateSchedule, node: usize, label: Option<&str>) -> Result<SampleType> {
    let n_types = schedule.n_types();
    if n_types == 1 {
        return Ok(SampleType::Known(0));
    }
    match label.map(str::trim) {
        None | Some("") => Err(BdmmError::MissingTypeLabel { node, n_types }),
        Some(l) if l == "?" || l.eq_ignore_ascii_case("unknown") => Ok(SampleType::Unknown),
        Some(l) => schedule
            .type_index(l)
            .map(SampleType::Known)
            .ok_or_else(|| BdmmError::UnknownTypeLabel {
                node,
                label: l.to_string(),
            }),
    }
}

fn validate_frequencies(frequencies: &[f64], n_types: usize) -> Result<()> {
    if frequencies.len() != n_types {
        return Err(BdmmError::InvalidFrequencies(format!(
            "{} frequencies given for {n_types} types",
            frequencies.len()
        )));
    }
    if let Some(f) = frequencies.iter().find(|f| !(f.is_finite() && **f >= 0.0)) {
        return Err(BdmmError::InvalidFrequencies(format!(
            "frequencies must be finite and >= 0, got {f}"
        )));
    }
    let sum: f64 = frequencies.iter().sum();
    if (sum - 1.0).abs() > FREQUENCY_TOLERANCE {
        return Err(BdmmError::InvalidFrequencies(format!(
            "frequencies must sum to 1, got {sum}"
        )));
    }
    Ok(())
}

pub struct BdmmLikelihood {
    schedule: RateSchedule,
    frequencies: Vec<f64>,
    config: LikelihoodConfig,
    context: ExecutionContext,
    sample_types: SampleTypeCache,
    root_type_probs: Vec<f64>,
}

impl BdmmLikelihood {
    pub fn new(
        schedule: RateSchedule,
        frequencies: Vec<f64>,
        config: LikelihoodConfig,
    ) -> Result<Self> {
        config.validate()?;
        validate_frequencies(&frequencies, schedule.n_types())?;
        let context = ExecutionContext::from_config(&config)?;
        let n_types = schedule.n_types();
        Ok(Self {
            schedule,
            frequencies,
            config,
            context,
            sample_types: SampleTypeCache::default(),
            root_type_probs: vec![0.0; n_types],
        })
    }

    pub fn schedule(&self) -> &RateSchedule {
        &self.schedule
    }

    pub fn config(&self) -> &LikelihoodConfig {
        &self.config
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Replaces the rate schedule; the number of types must not change.
    pub fn set_schedule(&mut self, schedule: RateSchedule) -> Result<()> {
        validate_frequencies(&self.frequencies, schedule.n_types())?;
        self.schedule = schedule;
        self.sample_types = SampleTypeCache::default();
        Ok(())
    }

    pub fn set_frequencies(&mut self, frequencies: Vec<f64>) -> Result<()> {
        validate_frequencies(&frequencies, self.schedule.n_types())?;
        self.frequencies = frequencies;
        Ok(())
    }

    /// Engine that `evaluate` uses with the current schedule and settings.
    pub fn engine(&self) -> Engine {
        if self.closed_form().is_some() {
            Engine::ClosedForm
        } else {
            Engine::Ode
        }
    }

    /// Root type probabilities of the last scored evaluation.
    pub fn root_type_probs(&self) -> &[f64] {
        &self.root_type_probs
    }

    pub fn evaluate(&mut self, tree: &Tree) -> Result<Evaluation> {
        if !self.sample_types.matches(tree) {
            self.sample_types.rebuild(&self.schedule, tree)?;
        }

        let offset = self.config.final_sample_offset;
        let root = tree.root();
        let t_root = self.schedule.node_time(tree.height(root), offset);
        if t_root < 0.0 {
            return Ok(Evaluation::Rejected(Rejection::NegativeRootTime));
        }
        if self.config.condition_on_root && !matches!(tree.kind(root), NodeKind::Birth { .. }) {
            return Err(BdmmError::InvalidConfig(
                "conditioning on the root time requires a bifurcating root".to_string(),
            ));
        }

        let evaluation = match self.closed_form() {
            Some(form) => form.evaluate(tree, &self.config),
            None => self.evaluate_general(tree, t_root)?,
        };
        if let Evaluation::Scored(s) = &evaluation {
            self.root_type_probs.clone_from(&s.root_type_probs);
        }
        Ok(evaluation)
    }

    fn closed_form(&self) -> Option<SingleTypeClosedForm<'_>> {
        if !self.config.use_single_type_closed_form || self.schedule.n_types() != 1 {
            return None;
        }
        let form = SingleTypeClosedForm::new(&self.schedule, self.config.precision());
        if form.is_none() {
            log::debug!("falling back to numerical integration for single-type model");
        }
        form
    }

    fn evaluate_general(&self, tree: &Tree, t_root: f64) -> Result<Evaluation> {
        let schedule = &self.schedule;
        let config = &self.config;
        let n_types = schedule.n_types();
        let offset = config.final_sample_offset;
        let t_condition = if config.condition_on_root { t_root } else { 0.0 };

        let samples = tree.samples();
        let sample_times: Vec<f64> = samples
            .iter()
            .map(|&s| schedule.node_time(tree.height(s), offset))
            .collect();
        let mut integrator = IntervalIntegrator::new(schedule, config);
        let initial = integrator.initial_conditions(&sample_times, t_condition)?;

        let mut sample_p0 = Array2::zeros((tree.node_count(), n_types));
        for (row, &node) in samples.iter().enumerate() {
            sample_p0.row_mut(node).assign(&initial.p0.row(row));
        }

        let p_no_sample = if config.condition_on_survival {
            let p: f64 = self
                .frequencies
                .iter()
                .zip(&initial.at_condition)
                .map(|(f, p)| f * p)
                .sum();
            log::debug!("probability of no sampled descendants: {p}");
            if !(0.0..=1.0).contains(&p) {
                return Ok(Evaluation::Rejected(Rejection::NoSampleProbabilityOutOfRange));
            }
            Some(p)
        } else {
            None
        };

        let policy = self.context.plan(tree);
        let traversal = Traversal {
            schedule,
            config,
            tree,
            sample_types: &self.sample_types.by_node,
            sample_p0: &sample_p0,
            policy: &policy,
        };
        let root_state = match self
            .context
            .install(|| traversal.root_state(&mut integrator, t_root))
        {
            Ok(state) => state,
            Err(Failure::Rejected(reason)) => return Ok(Evaluation::Rejected(reason)),
            Err(Failure::Fatal(e)) => return Err(e),
        };
        log::debug!("state at root: {root_state}");

        let mut total = SmallNumber::zero();
        let mut log_joint = vec![f64::NEG_INFINITY; n_types];
        for (i, (ge, f)) in root_state.ge.iter().zip(&self.frequencies).enumerate() {
            let joint = ge.scalar_multiply(*f);
            if !joint.is_zero() {
                log_joint[i] = joint.ln();
                total = total + joint;
            }
        }
        let log_total = total.ln();
        let root_type_probs = log_joint
            .iter()
            .map(|&l| {
                if l.is_finite() && log_total.is_finite() {
                    (l - log_total).exp()
                } else {
                    0.0
                }
            })
            .collect();

        let mut log_likelihood = log_total;
        if let Some(p) = p_no_sample {
            log_likelihood -= (1.0 - p).ln();
        }
        log_likelihood += LN_2 * tree.birth_count() as f64 - ln_factorial(tree.sample_count());

        Ok(Evaluation::Scored(TreeLikelihood {
            log_likelihood,
            root_type_probs,
        }))
    }
}

enum Failure {
    Rejected(Rejection),
    Fatal(BdmmError),
}

impl From<BdmmError> for Failure {
    fn from(e: BdmmError) -> Self {
        Failure::Fatal(e)
    }
}

type Step = std::result::Result<P0GeState, Failure>;

enum Visit {
    Enter { node: usize, t_top: f64, depth: usize },
    Exit { node: usize, t_top: f64, depth: usize },
}

fn take(finished: &mut Vec<P0GeState>, node: usize) -> std::result::Result<P0GeState, Failure> {
    finished.pop().ok_or_else(|| {
        Failure::Fatal(BdmmError::InvalidTree(format!(
            "no child state available below node {node}"
        )))
    })
}

/// Read-only view shared by every task of one traversal.
struct Traversal<'a> {
    schedule: &'a RateSchedule,
    config: &'a LikelihoodConfig,
    tree: &'a Tree,
    sample_types: &'a [SampleType],
    /// Extinction probabilities at each sample's time, by node.
    sample_p0: &'a Array2<f64>,
    policy: &'a SplitPolicy,
}

impl Traversal<'_> {
    fn node_time(&self, node: usize) -> f64 {
        self.schedule
            .node_time(self.tree.height(node), self.config.final_sample_offset)
    }

    fn root_state(&self, integrator: &mut IntervalIntegrator<'_>, t_root: f64) -> Step {
        let root = self.tree.root();
        if !self.config.condition_on_root {
            return self.subtree(root, 0.0, 0, 0, integrator);
        }
        let NodeKind::Birth { first, second } = self.tree.kind(root) else {
            return Err(Failure::Fatal(BdmmError::InvalidConfig(
                "conditioning on the root time requires a bifurcating root".to_string(),
            )));
        };
        let (left, right) = self.children(first, second, t_root, 0, integrator)?;
        let ge = left
            .ge
            .iter()
            .zip(&right.ge)
            .map(|(a, b)| a.multiply(b))
            .collect();
        Ok(P0GeState { p0: left.p0, ge })
    }

    /// State at the top of the edge above `node`, which ends at `t_top`.
    ///
    /// Walks the subtree in post-order with an explicit stack, so depth is
    /// bounded by nested splits rather than by the height of the tree.
    fn subtree(
        &self,
        node: usize,
        t_top: f64,
        depth: usize,
        nested: usize,
        integrator: &mut IntervalIntegrator<'_>,
    ) -> Step {
        let mut pending = vec![Visit::Enter { node, t_top, depth }];
        let mut finished: Vec<P0GeState> = Vec::new();

        while let Some(visit) = pending.pop() {
            match visit {
                Visit::Enter { node, t_top, depth } => {
                    let t_node = self.node_time(node);
                    log::debug!(
                        "{:indent$}node {node}: edge from {t_node} to {t_top}",
                        "",
                        indent = 2 * depth
                    );
                    pending.push(Visit::Exit { node, t_top, depth });
                    match self.tree.kind(node) {
                        NodeKind::Leaf | NodeKind::DirectAncestor => {}
                        NodeKind::SampledAncestor { child, .. } => {
                            pending.push(Visit::Enter {
                                node: child,
                                t_top: t_node,
                                depth: depth + 1,
                            });
                        }
                        NodeKind::Birth { first, second }
                            if self.policy.should_split(first, second, nested) =>
                        {
                            let (left, right) =
                                self.split(first, second, t_node, depth + 1, nested, integrator)?;
                            finished.push(left);
                            finished.push(right);
                        }
                        NodeKind::Birth { first, second } => {
                            pending.push(Visit::Enter {
                                node: second,
                                t_top: t_node,
                                depth: depth + 1,
                            });
                            pending.push(Visit::Enter {
                                node: first,
                                t_top: t_node,
                                depth: depth + 1,
                            });
                        }
                    }
                }
                Visit::Exit { node, t_top, depth } => {
                    let t_node = self.node_time(node);
                    let interval = self
                        .schedule
                        .interval_index_at(t_node, integrator.precision());
                    let mut state = match self.tree.kind(node) {
                        NodeKind::Leaf | NodeKind::DirectAncestor => {
                            self.sample_state(node, t_node, interval)
                        }
                        NodeKind::SampledAncestor { sample, .. } => {
                            let below = take(&mut finished, node)?;
                            self.sampled_ancestor_state(sample, below, t_node, interval)
                        }
                        NodeKind::Birth { .. } => {
                            let right = take(&mut finished, node)?;
                            let left = take(&mut finished, node)?;
                            self.birth_state(left, right, t_node, interval)?
                        }
                    };
                    log::debug!(
                        "{:indent$}state at base of edge: {state}",
                        "",
                        indent = 2 * depth
                    );
                    integrator.integrate_p0ge(&mut state, t_node, t_top)?;
                    finished.push(state);
                }
            }
        }
        take(&mut finished, node)
    }

    /// Evaluates both children of a birth node, concurrently when both
    /// subtrees are large enough. `first` always runs on the current
    /// integrator.
    fn children(
        &self,
        first: usize,
        second: usize,
        t_top: f64,
        depth: usize,
        integrator: &mut IntervalIntegrator<'_>,
    ) -> std::result::Result<(P0GeState, P0GeState), Failure> {
        if self.policy.should_split(first, second, 0) {
            self.split(first, second, t_top, depth, 0, integrator)
        } else {
            let left = self.subtree(first, t_top, depth, 0, integrator)?;
            let right = self.subtree(second, t_top, depth, 0, integrator)?;
            Ok((left, right))
        }
    }

    /// Runs both subtrees through `rayon::join`; `nested` counts the splits
    /// already made above them.
    fn split(
        &self,
        first: usize,
        second: usize,
        t_top: f64,
        depth: usize,
        nested: usize,
        integrator: &mut IntervalIntegrator<'_>,
    ) -> std::result::Result<(P0GeState, P0GeState), Failure> {
        let nested = nested + 1;
        let (left, right) = rayon::join(
            || self.subtree(first, t_top, depth, nested, integrator),
            || {
                let mut own = IntervalIntegrator::new(self.schedule, self.config);
                self.subtree(second, t_top, depth, nested, &mut own)
            },
        );
        Ok((left?, right?))
    }

    fn sample_state(&self, node: usize, t_node: f64, interval: usize) -> P0GeState {
        let schedule = self.schedule;
        let n = schedule.n_types();
        let removal = schedule.removal_probs();
        let rho_interval = schedule.rho_interval_at(t_node, self.config.precision());
        let (rates, k) = match rho_interval {
            Some(k) => (schedule.rho_values(), k),
            None => (schedule.sampling_rates(), interval),
        };

        let mut state = P0GeState {
            p0: self.sample_p0.row(node).to_vec(),
            ge: vec![SmallNumber::zero(); n],
        };
        let density = |i: usize, p0: f64| {
            let r = removal[(interval, i)];
            SmallNumber::new((r + p0 * (1.0 - r)) * rates[(k, i)])
        };
        match self.sample_types[node] {
            SampleType::Known(i) => state.ge[i] = density(i, state.p0[i]),
            SampleType::Unknown => {
                for i in 0..n {
                    state.ge[i] = density(i, state.p0[i]);
                }
            }
        }

        if let Some(k) = rho_interval {
            let rho = schedule.rho_values().row(k);
            for (p, r) in state.p0.iter_mut().zip(rho.iter()) {
                *p *= 1.0 - r;
            }
        }
        state
    }

    fn sampled_ancestor_state(
        &self,
        sample: usize,
        mut state: P0GeState,
        t_node: f64,
        interval: usize,
    ) -> P0GeState {
        let schedule = self.schedule;
        let removal = schedule.removal_probs();
        let rho_interval = schedule.rho_interval_at(t_node, self.config.precision());
        let factor = |i: usize| {
            let rate = match rho_interval {
                Some(k) => schedule.rho_values()[(k, i)],
                None => schedule.sampling_rates()[(interval, i)],
            };
            rate * (1.0 - removal[(interval, i)])
        };

        match self.sample_types[sample] {
            SampleType::Known(t) => {
                for (i, ge) in state.ge.iter_mut().enumerate() {
                    *ge = if i == t {
                        ge.scalar_multiply(factor(i))
                    } else {
                        SmallNumber::zero()
                    };
                }
            }
            SampleType::Unknown => {
                for (i, ge) in state.ge.iter_mut().enumerate() {
                    *ge = ge.scalar_multiply(factor(i));
                }
            }
        }

        if let Some(k) = rho_interval {
            let rho = schedule.rho_values().row(k);
            for (p, r) in state.p0.iter_mut().zip(rho.iter()) {
                *p *= 1.0 - r;
            }
        }
        state
    }

    fn birth_state(
        &self,
        mut left: P0GeState,
        mut right: P0GeState,
        t_node: f64,
        interval: usize,
    ) -> Step {
        let schedule = self.schedule;
        if let Some(k) = schedule.rho_interval_at(t_node, self.config.precision()) {
            let rho = schedule.rho_values().row(k);
            left.discount(rho.iter().copied());
            right.discount(rho.iter().copied());
        }

        let n = schedule.n_types();
        let birth = schedule.birth_rates();
        let cross = schedule.cross_birth_rates();
        let mut ge = Vec::with_capacity(n);
        for i in 0..n {
            if !left.p0[i].is_finite() {
                return Err(Failure::Rejected(Rejection::NonFiniteExtinction));
            }
            let mut g = left.ge[i]
                .multiply(&right.ge[i])
                .scalar_multiply(birth[(interval, i)]);
            for j in 0..n {
                if j == i {
                    continue;
                }
                let c = cross[(interval, i, j)];
                if c == 0.0 {
                    continue;
                }
                let pair = left.ge[i]
                    .multiply(&right.ge[j])
                    .add_scaled(&left.ge[j].multiply(&right.ge[i]));
                g = g.add_scaled(&pair.scalar_multiply(0.5 * c));
            }
            ge.push(g);
        }
        Ok(P0GeState { p0: left.p0, ge })
    }
}
