use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use paratrace::cli::{run, Paratrace};
use paratrace::core::checkpoint::{Checkpointable, StateId};
use paratrace::core::computation::Computation;
use paratrace::io::input::InputDocument;
use paratrace::model::distributions::DiscreteDistribution;
use paratrace::model::{Model, State, TransmissionModel};

fn toy_input() -> InputDocument {
    serde_json::from_value(serde_json::json!({
        "loci": {"m1": 4},
        "infections": [
            {"id": "case_a", "sampling_time": 2, "symptomatic": false,
             "genotypes": {"m1": "1010"}},
            {"id": "case_b", "sampling_time": 9, "symptomatic": false,
             "genotypes": {"m1": "0101"}}
        ]
    }))
    .unwrap()
}

fn write_toy_files(dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
    let input = dir.join("input.json");
    fs::write(
        &input,
        serde_json::to_string(&toy_input()).unwrap(),
    )
    .unwrap();
    let idp = dir.join("idp.csv");
    // uniform duration prior over days 1..=30
    let mut rows = String::from("0\n");
    for _ in 0..30 {
        rows.push_str("0.0333333333\n");
    }
    fs::write(&idp, rows).unwrap();
    (input, idp.clone(), idp)
}

fn uniform_idp() -> Rc<DiscreteDistribution> {
    let mut probabilities = vec![0.0];
    probabilities.extend(vec![1.0 / 30.0; 30]);
    Rc::new(DiscreteDistribution::new(probabilities))
}

fn toy_state(seed: u64) -> Rc<State> {
    let mut rng = StdRng::seed_from_u64(seed);
    let idp = uniform_idp();
    State::new(&toy_input(), &idp, &idp, &mut rng).unwrap()
}

fn run_toy(
    output_dir: &Path,
    seed: i64,
    null_model: bool,
    burnin: u64,
    sample: u64,
    thin: u64,
) {
    let workdir = tempfile::tempdir().unwrap();
    let (input, symptomatic_idp, asymptomatic_idp) = write_toy_files(workdir.path());
    run(Paratrace::Run {
        burnin,
        sample,
        thin,
        numchains: 1,
        numcores: 1,
        gradient: 1.0,
        seed,
        hotload: false,
        null_model,
        input,
        output_dir: output_dir.to_owned(),
        symptomatic_idp,
        asymptomatic_idp,
    })
    .unwrap();
}

fn read_column(path: &Path, column: usize) -> Vec<f64> {
    let contents = fs::read_to_string(path).unwrap();
    contents
        .lines()
        .filter_map(|line| {
            line.split(',')
                .nth(column)
                .and_then(|field| field.trim().parse::<f64>().ok())
        })
        .collect()
}

#[test]
fn minimal_toy_chain_completes() {
    let output = tempfile::tempdir().unwrap();
    run_toy(output.path(), 42, false, 2000, 10000, 100);

    let mean_coi = read_column(&output.path().join("parameters/mean_coi.csv"), 0);
    assert!(mean_coi.len() >= 100);
    let mean: f64 = mean_coi.iter().sum::<f64>() / mean_coi.len() as f64;
    assert!(
        mean > 1.0 && mean < 3.0,
        "posterior mean of mean_coi out of range: {}",
        mean
    );

    let posterior = read_column(&output.path().join("model.csv"), 0);
    assert!(posterior.len() >= 100);
    assert!(posterior.iter().all(|v| v.is_finite()));
}

#[test]
fn fixed_seed_runs_are_byte_identical() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    run_toy(first.path(), 42, false, 200, 1000, 100);
    run_toy(second.path(), 42, false, 200, 1000, 100);

    let mut compared = 0;
    for entry in walk(first.path()) {
        let relative = entry.strip_prefix(first.path()).unwrap();
        let twin = second.path().join(relative);
        let a = fs::read(&entry).unwrap();
        let b = fs::read(&twin).unwrap_or_else(|_| panic!("missing twin {:?}", twin));
        assert_eq!(a, b, "outputs diverge at {:?}", relative);
        compared += 1;
    }
    assert!(compared > 5);
}

fn walk(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_owned()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

#[test]
fn hotload_appends_to_an_existing_run() {
    let output = tempfile::tempdir().unwrap();
    run_toy(output.path(), 3, false, 50, 200, 50);
    let mean_coi_path = output.path().join("parameters/mean_coi.csv");
    let rows_before = read_column(&mean_coi_path, 0).len();
    assert!(rows_before >= 4);

    let workdir = tempfile::tempdir().unwrap();
    let (input, symptomatic_idp, asymptomatic_idp) = write_toy_files(workdir.path());
    run(Paratrace::Run {
        burnin: 10,
        sample: 100,
        thin: 50,
        numchains: 1,
        numcores: 1,
        gradient: 1.0,
        seed: 4,
        hotload: true,
        null_model: false,
        input,
        output_dir: output.path().to_owned(),
        symptomatic_idp,
        asymptomatic_idp,
    })
    .unwrap();

    let rows_after = read_column(&mean_coi_path, 0).len();
    assert!(rows_after > rows_before);
}

#[test]
fn null_model_posterior_equals_prior() {
    let output = tempfile::tempdir().unwrap();
    run_toy(output.path(), 7, true, 100, 500, 50);

    let posterior = read_column(&output.path().join("model.csv"), 0);
    let likelihood = read_column(&output.path().join("model.csv"), 1);
    let prior = read_column(&output.path().join("model.csv"), 2);
    assert!(!posterior.is_empty());
    for ((p, l), q) in posterior.iter().zip(&likelihood).zip(&prior) {
        assert_relative_eq!(*l, 0.0, epsilon = 1e-9);
        assert_relative_eq!(*p, *q, epsilon = 1e-9);
    }
}

#[test]
fn snapshot_round_trip_preserves_the_posterior() {
    let state = toy_state(11);
    let model = Model::new(&state, 1.0, false, TransmissionModel::SimpleLoss).unwrap();
    let before = *model.value();

    let mut rng = StdRng::seed_from_u64(5);
    let scalars = [
        state.loss_prob.clone(),
        state.inter_generation_prob.clone(),
        state.mean_coi.clone(),
        state.eps_pos[0].clone(),
        state.eps_neg[1].clone(),
        state.infections[0].duration().clone(),
    ];
    for parameter in &scalars {
        let id = StateId::External(1);
        parameter.save_state(id);
        let jitter: f64 = rng.gen_range(0.5..0.999);
        parameter.set_value(parameter.value() * jitter);
        let _ = model.value();
        parameter.restore_state(id);
        assert_relative_eq!(*model.value(), before, epsilon = 1e-12);
    }

    // an ordering move through the same protocol
    state.ordering.save_state(StateId::External(2));
    state.ordering.swap(0, 1);
    let _ = model.value();
    state.ordering.restore_state(StateId::External(2));
    assert_relative_eq!(*model.value(), before, epsilon = 1e-12);
}

#[test]
fn accept_is_idempotent() {
    let state = toy_state(13);
    let model = Model::new(&state, 1.0, false, TransmissionModel::SimpleLoss).unwrap();

    let parameter = &state.loss_prob;
    parameter.save_state(StateId::External(1));
    parameter.set_value(0.2);
    parameter.accept_state();
    let after_first = *model.value();

    parameter.save_state(StateId::External(1));
    parameter.set_value(0.2);
    parameter.accept_state();
    assert_relative_eq!(*model.value(), after_first, epsilon = 1e-12);
}

#[test]
fn nested_checkpoint_scopes_match_a_fresh_model() {
    let state = toy_state(17);
    let model = Model::new(&state, 1.0, false, TransmissionModel::SimpleLoss).unwrap();
    let mut rng = StdRng::seed_from_u64(23);

    let scalars = [
        state.loss_prob.clone(),
        state.inter_generation_prob.clone(),
        state.mean_coi.clone(),
        state.mean_strains.clone(),
        state.eps_pos[0].clone(),
        state.eps_pos[1].clone(),
        state.eps_neg[0].clone(),
        state.eps_neg[1].clone(),
        state.infections[0].duration().clone(),
        state.infections[1].duration().clone(),
    ];
    for parameter in &scalars {
        let outer = StateId::External(1);
        let inner = StateId::External(2);
        parameter.save_state(outer);
        parameter.set_value(parameter.value() * rng.gen_range(0.8..0.999));
        let _ = model.value();
        parameter.save_state(inner);
        parameter.set_value(parameter.value() * rng.gen_range(0.8..0.999));
        let _ = model.value();
        parameter.restore_state(inner);
        let _ = model.value();
        parameter.accept_state();
        let _ = model.value();
    }

    // an oracle model built fresh on the same state recomputes everything
    // from scratch
    let oracle = Model::new(&state, 1.0, false, TransmissionModel::SimpleLoss).unwrap();
    assert_relative_eq!(*model.value(), *oracle.value(), epsilon = 1e-12);
}

#[test]
fn transmission_cache_matches_cleared_recomputation() {
    let state = toy_state(29);
    let model = Model::new(&state, 1.0, false, TransmissionModel::SimpleLoss).unwrap();
    let mut rng = StdRng::seed_from_u64(31);

    for _ in 0..25 {
        // random accepted order move keeps the caches busy
        state.ordering.save_state(StateId::External(3));
        let a = rng.gen_range(0..state.infections.len());
        let b = rng.gen_range(0..state.infections.len());
        state.ordering.swap(a, b);
        let cached = *model.value();
        state.ordering.accept_state();

        // a node-transmission touch wipes every hypothesis cache; the
        // recomputed posterior must not move
        let loss = state.loss_prob.value();
        state.loss_prob.save_state(StateId::External(4));
        state.loss_prob.set_value(loss);
        state.loss_prob.accept_state();
        assert_relative_eq!(*model.value(), cached, epsilon = 1e-9);
    }
}

#[test]
fn multinomial_transmission_model_also_runs() {
    let state = toy_state(37);
    let model = Model::new(&state, 1.0, false, TransmissionModel::Multinomial).unwrap();
    let before = *model.value();
    assert!(before.is_finite());

    state.mean_strains.save_state(StateId::External(1));
    state.mean_strains.set_value(3.0);
    assert!((*model.value()).is_finite());
    state.mean_strains.restore_state(StateId::External(1));
    assert_relative_eq!(*model.value(), before, epsilon = 1e-12);
}

#[test]
fn replica_exchange_with_equal_temperatures_swaps_freely() {
    use paratrace::samplers::replica::{ReplicaExchange, ReplicaExchangeConfigBuilder};

    let output = tempfile::tempdir().unwrap();
    let config = ReplicaExchangeConfigBuilder::default()
        .num_chains(2)
        .num_cores(2)
        .gradient(1.0)
        .seed(99)
        .output_dir(output.path().to_owned())
        .build()
        .unwrap();
    let idp = uniform_idp();
    let mut replica_exchange =
        ReplicaExchange::new(&config, &toy_input(), &idp, &idp).unwrap();

    for _ in 0..200 {
        replica_exchange.sample().unwrap();
    }
    let rates = replica_exchange.swap_acceptance_rates();
    assert!(
        rates[0] > 0.95,
        "identical chains must swap almost always, got {}",
        rates[0]
    );
    replica_exchange.finalize().unwrap();
}

#[test]
fn zanella_order_sampler_is_uniform_under_a_flat_posterior() {
    use paratrace::samplers::order::ZanellaNeighborOrderSampler;
    use paratrace::samplers::Kernel;
    use std::cell::RefCell;
    use std::collections::HashMap as StdHashMap;

    // four infections under the null model: the posterior is order-free, so
    // the locally informed sampler must leave the ordering uniform
    let input: InputDocument = serde_json::from_value(serde_json::json!({
        "loci": {"m1": 4},
        "infections": [
            {"id": "w", "sampling_time": 1, "symptomatic": false, "genotypes": {"m1": "1000"}},
            {"id": "x", "sampling_time": 2, "symptomatic": false, "genotypes": {"m1": "0100"}},
            {"id": "y", "sampling_time": 3, "symptomatic": false, "genotypes": {"m1": "0010"}},
            {"id": "z", "sampling_time": 4, "symptomatic": false, "genotypes": {"m1": "0001"}}
        ]
    }))
    .unwrap();
    let idp = uniform_idp();
    let mut rng = StdRng::seed_from_u64(41);
    let state = State::new(&input, &idp, &idp, &mut rng).unwrap();
    let model = Model::new(&state, 1.0, true, TransmissionModel::SimpleLoss).unwrap();

    let shared_rng = Rc::new(RefCell::new(rng));
    let target: Rc<dyn paratrace::core::computation::LikelihoodNode> = model.clone();
    let sampler = ZanellaNeighborOrderSampler::new(&state.ordering, &target, &shared_rng);

    let mut visits: StdHashMap<String, u64> = StdHashMap::new();
    let steps = 48_000;
    for _ in 0..steps {
        sampler.update();
        let key: String = state
            .ordering
            .value()
            .iter()
            .map(|i| i.id().clone())
            .collect::<Vec<_>>()
            .join(">");
        *visits.entry(key).or_insert(0) += 1;
    }

    assert_eq!(visits.len(), 24, "not all orderings were visited");
    // the walk is correlated, so judge uniformity by a generous band around
    // the expected visit count rather than an iid chi-square quantile
    let expected = steps as f64 / 24.0;
    for (ordering, count) in &visits {
        let ratio = *count as f64 / expected;
        assert!(
            ratio > 0.5 && ratio < 1.5,
            "ordering {} visited disproportionately: {}x",
            ordering,
            ratio
        );
    }
}

#[test]
fn windowed_zanella_sampler_also_mixes_over_orderings() {
    use paratrace::samplers::order::ZanellaOrderSampler;
    use paratrace::samplers::Kernel;
    use std::cell::RefCell;
    use std::collections::HashMap as StdHashMap;

    let input: InputDocument = serde_json::from_value(serde_json::json!({
        "loci": {"m1": 4},
        "infections": [
            {"id": "w", "sampling_time": 1, "symptomatic": false, "genotypes": {"m1": "1000"}},
            {"id": "x", "sampling_time": 2, "symptomatic": false, "genotypes": {"m1": "0100"}},
            {"id": "y", "sampling_time": 3, "symptomatic": false, "genotypes": {"m1": "0010"}},
            {"id": "z", "sampling_time": 4, "symptomatic": false, "genotypes": {"m1": "0001"}}
        ]
    }))
    .unwrap();
    let idp = uniform_idp();
    let mut rng = StdRng::seed_from_u64(61);
    let state = State::new(&input, &idp, &idp, &mut rng).unwrap();
    let model = Model::new(&state, 1.0, true, TransmissionModel::SimpleLoss).unwrap();

    let shared_rng = Rc::new(RefCell::new(rng));
    let target: Rc<dyn paratrace::core::computation::LikelihoodNode> = model.clone();
    let sampler = ZanellaOrderSampler::new(&state.ordering, &target, &shared_rng, 2);

    let mut visits: StdHashMap<String, u64> = StdHashMap::new();
    let steps = 24_000;
    for _ in 0..steps {
        sampler.update();
        let key: String = state
            .ordering
            .value()
            .iter()
            .map(|i| i.id().clone())
            .collect::<Vec<_>>()
            .join(">");
        *visits.entry(key).or_insert(0) += 1;
    }

    assert_eq!(visits.len(), 24, "not all orderings were visited");
    let expected = steps as f64 / 24.0;
    for (ordering, count) in &visits {
        let ratio = *count as f64 / expected;
        assert!(
            ratio > 0.4 && ratio < 1.6,
            "ordering {} visited disproportionately: {}x",
            ordering,
            ratio
        );
    }
}

#[test]
fn simplex_stays_closed_under_salt_moves() {
    use paratrace::samplers::salt::SaltSampler;
    use paratrace::samplers::Kernel;
    use std::cell::RefCell;

    let state = toy_state(43);
    let model = Model::new(&state, 1.0, false, TransmissionModel::SimpleLoss).unwrap();
    let locus = state.loci.values().next().unwrap().clone();
    let frequencies = state.allele_frequencies.frequencies(&locus);

    let shared_rng = Rc::new(RefCell::new(StdRng::seed_from_u64(47)));
    let target: Rc<dyn paratrace::core::computation::LikelihoodNode> = model.clone();
    let sampler = SaltSampler::new(&frequencies, &target, &shared_rng, 1.0, 0.01, 10.0);

    for _ in 0..300 {
        sampler.update();
        let simplex = frequencies.value();
        let total: f64 = simplex.frequencies().iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(simplex.frequencies().iter().all(|f| *f >= 0.01 - 1e-12));
    }
}

#[test]
fn ordering_parent_sets_survive_a_long_mixed_schedule() {
    let state = toy_state(53);
    let model = Model::new(&state, 1.0, false, TransmissionModel::SimpleLoss).unwrap();
    let mut rng = StdRng::seed_from_u64(59);

    for _ in 0..100 {
        state.ordering.save_state(StateId::External(5));
        state.ordering.swap(
            rng.gen_range(0..state.infections.len()),
            rng.gen_range(0..state.infections.len()),
        );
        let _ = model.value();
        if rng.gen::<bool>() {
            state.ordering.accept_state();
        } else {
            state.ordering.restore_state(StateId::External(5));
        }

        let order = state.ordering.value();
        for (child, set) in model.parent_sets() {
            let position = order.iter().position(|i| i.id() == child).unwrap();
            let expected: Vec<String> =
                order[..position].iter().map(|i| i.id().clone()).collect();
            let mut expected = expected;
            expected.sort();
            let actual: Vec<String> = set.value().keys().cloned().collect();
            assert_eq!(actual, expected);
        }
    }
}
