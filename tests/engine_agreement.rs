use bdmm_rs::parallel::ExecutionContext;
use bdmm_rs::{BdmmLikelihood, LikelihoodConfig, RateSchedule, RateScheduleSpec, Tree};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

/// Random bifurcating tree: `n_tips` tips, `present` of them at height 0,
/// merged pairwise at increasing heights. Tips get labels from `labels`.
fn random_tree(rng: &mut SmallRng, n_tips: usize, present: usize, labels: &[&str]) -> Tree {
    let n_nodes = 2 * n_tips - 1;
    let mut parents = vec![None; n_nodes];
    let mut heights = vec![0.0f64; n_nodes];
    let mut names = vec![None; n_nodes];
    for tip in 0..n_tips {
        if tip >= present {
            heights[tip] = rng.gen_range(0.05..1.5);
        }
        if !labels.is_empty() {
            names[tip] = Some(labels[rng.gen_range(0..labels.len())].to_string());
        }
    }

    let mut active: Vec<usize> = (0..n_tips).collect();
    for node in n_tips..n_nodes {
        let a = active.swap_remove(rng.gen_range(0..active.len()));
        let b = active.swap_remove(rng.gen_range(0..active.len()));
        heights[node] = heights[a].max(heights[b]) + rng.gen_range(0.02..0.4);
        parents[a] = Some(node);
        parents[b] = Some(node);
        active.push(node);
    }
    Tree::from_parents(&parents, &heights, names).expect("random tree is valid")
}

fn single_type_schedule(rng: &mut SmallRng, origin: f64, rho_present: f64) -> RateSchedule {
    let change_times = vec![origin * 0.3, origin * 0.7];
    let mut spec = RateScheduleSpec::zeros(origin, change_times, 1);
    spec.birth = (0..3).map(|_| vec![rng.gen_range(0.5..3.0)]).collect();
    spec.death = (0..3).map(|_| vec![rng.gen_range(0.1..1.5)]).collect();
    spec.sampling = (0..3).map(|_| vec![rng.gen_range(0.1..1.0)]).collect();
    spec.removal = Some((0..3).map(|_| vec![rng.gen_range(0.3..1.0)]).collect());
    spec.rho = Some(vec![vec![0.0], vec![0.0], vec![rho_present]]);
    RateSchedule::new(spec).expect("valid schedule")
}

fn tight(closed_form: bool) -> LikelihoodConfig {
    LikelihoodConfig {
        rel_tolerance: 1e-10,
        use_single_type_closed_form: closed_form,
        parallelize: false,
        ..LikelihoodConfig::default()
    }
}

#[test]
fn closed_form_matches_integration_on_random_trees() {
    let mut rng = SmallRng::seed_from_u64(7);
    for case in 0..6 {
        let n_tips = rng.gen_range(3..25);
        let present = if case % 2 == 0 { n_tips / 2 } else { 0 };
        let tree = random_tree(&mut rng, n_tips, present, &[]);
        let origin = tree.height(tree.root()) + 1.0;
        let rho = if present > 0 { 0.4 } else { 0.0 };
        let schedule = single_type_schedule(&mut rng, origin, rho);

        for condition_on_root in [false, true] {
            let mut closed_cfg = tight(true);
            closed_cfg.condition_on_root = condition_on_root;
            let mut general_cfg = tight(false);
            general_cfg.condition_on_root = condition_on_root;

            let mut closed = BdmmLikelihood::new(schedule.clone(), vec![1.0], closed_cfg)
                .expect("setup failed");
            let mut general = BdmmLikelihood::new(schedule.clone(), vec![1.0], general_cfg)
                .expect("setup failed");
            let a = closed.evaluate(&tree).expect("closed form failed");
            let b = general.evaluate(&tree).expect("integration failed");
            assert!(!a.is_rejected() && !b.is_rejected(), "case {case} rejected");
            approx_eq(a.log_likelihood(), b.log_likelihood(), 1e-6);
        }
    }
}

fn two_type_schedule(origin: f64) -> RateSchedule {
    let mut spec = RateScheduleSpec::zeros(origin, vec![origin * 0.5], 2);
    spec.types = Some(vec!["A".to_string(), "B".to_string()]);
    spec.birth = vec![vec![1.8, 1.2], vec![1.4, 2.2]];
    spec.death = vec![vec![0.6, 0.4], vec![0.5, 0.9]];
    spec.sampling = vec![vec![0.3, 0.5], vec![0.4, 0.2]];
    spec.removal = Some(vec![vec![0.9, 0.7], vec![1.0, 0.8]]);
    spec.rho = Some(vec![vec![0.0, 0.0], vec![0.3, 0.5]]);
    spec.migration = Some(vec![
        vec![vec![0.0, 0.25], vec![0.15, 0.0]],
        vec![vec![0.0, 0.1], vec![0.35, 0.0]],
    ]);
    spec.cross_birth = Some(vec![
        vec![vec![0.0, 0.2], vec![0.05, 0.0]],
        vec![vec![0.0, 0.0], vec![0.1, 0.0]],
    ]);
    RateSchedule::new(spec).expect("valid schedule")
}

#[test]
fn parallel_traversal_matches_serial() {
    let mut rng = SmallRng::seed_from_u64(11);
    for _ in 0..3 {
        let tree = random_tree(&mut rng, 40, 10, &["A", "B", "?"]);
        let origin = tree.height(tree.root()) + 1.0;

        let serial_cfg = tight(false);
        let parallel_cfg = LikelihoodConfig {
            parallelize: true,
            threads: Some(4),
            parallelization_factor: 0.01,
            ..serial_cfg.clone()
        };
        let mut serial = BdmmLikelihood::new(two_type_schedule(origin), vec![0.4, 0.6], serial_cfg)
            .expect("setup failed");
        let mut parallel =
            BdmmLikelihood::new(two_type_schedule(origin), vec![0.4, 0.6], parallel_cfg)
                .expect("setup failed");

        let a = serial.evaluate(&tree).expect("serial evaluation failed");
        let b = parallel.evaluate(&tree).expect("parallel evaluation failed");
        assert!(a.log_likelihood().is_finite());
        approx_eq(a.log_likelihood(), b.log_likelihood(), 1e-12);
        let (pa, pb) = (
            a.root_type_probs().expect("scored"),
            b.root_type_probs().expect("scored"),
        );
        for (x, y) in pa.iter().zip(pb) {
            approx_eq(*x, *y, 1e-12);
        }
    }
}

#[test]
fn repeated_evaluation_is_stable() {
    let mut rng = SmallRng::seed_from_u64(3);
    let tree = random_tree(&mut rng, 15, 5, &["A", "B"]);
    let origin = tree.height(tree.root()) + 1.0;
    let mut likelihood =
        BdmmLikelihood::new(two_type_schedule(origin), vec![0.5, 0.5], tight(false))
            .expect("setup failed");
    let first = likelihood.evaluate(&tree).expect("evaluation failed");
    let second = likelihood.evaluate(&tree).expect("evaluation failed");
    assert_eq!(first, second);

    let relabeled = random_tree(&mut SmallRng::seed_from_u64(3), 15, 5, &["B", "A"]);
    let third = likelihood.evaluate(&relabeled).expect("evaluation failed");
    assert!(third.log_likelihood().is_finite());
}

#[test]
fn execution_context_follows_config() {
    let serial = ExecutionContext::from_config(&tight(false)).expect("serial context");
    assert!(!serial.is_parallel());
    assert_eq!(serial.threads(), 1);

    let pooled = ExecutionContext::from_config(&LikelihoodConfig {
        parallelize: true,
        threads: Some(3),
        ..LikelihoodConfig::default()
    })
    .expect("thread pool");
    assert!(pooled.is_parallel());
    assert_eq!(pooled.threads(), 3);
    assert_eq!(pooled.install(rayon::current_num_threads), 3);

    let single = ExecutionContext::from_config(&LikelihoodConfig {
        threads: Some(1),
        ..LikelihoodConfig::default()
    })
    .expect("serial context");
    assert!(!single.is_parallel());
}

#[test]
fn split_policy_needs_two_heavy_subtrees() {
    // Root 0 with a heavy cherry (1) and a light tip (2).
    let tree = Tree::from_parents(
        &[None, Some(0), Some(0), Some(1), Some(1)],
        &[3.0, 1.0, 2.9, 0.0, 0.0],
        vec![None; 5],
    )
    .expect("valid tree");
    let context = ExecutionContext::from_config(&LikelihoodConfig {
        threads: Some(2),
        parallelization_factor: 0.2,
        ..LikelihoodConfig::default()
    })
    .expect("thread pool");
    let policy = context.plan(&tree);
    assert!(!policy.should_split(1, 2, 0));
    assert!(policy.should_split(3, 4, 0));
    assert!(!policy.should_split(3, 4, 64));
    assert!(!ExecutionContext::serial().plan(&tree).should_split(3, 4, 0));
}
