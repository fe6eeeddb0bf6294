use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tiermix::{
    ClusterData, ConvergenceCriterion, EmConfig, EmEngine, HaltSignal, Point, StopReason, Topology,
    TrainingOptions,
};

fn sample(rng: &mut StdRng, n: usize) -> Result<ClusterData, Box<dyn std::error::Error>> {
    let noise = Normal::new(0.0, 1.0)?;
    let mut builder = ClusterData::builder(0, 3);
    for i in 0..n {
        let shift = if i % 2 == 0 { -2.0 } else { 2.0 };
        let mut point = Point::new();
        for _ in 0..2 {
            let x = (0..3).map(|_| shift + noise.sample(rng)).collect();
            point = point.with_continuous(x);
        }
        builder = builder.add_point(point);
    }
    Ok(builder.build()?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Too many clusters for the data: training log-likelihood keeps rising
    // while held-out log-likelihood eventually turns down.
    let mut rng = StdRng::seed_from_u64(5);
    let train = sample(&mut rng, 40)?;
    let held_out = sample(&mut rng, 40)?;
    let topology = Topology::flat(8)?;

    // Ctrl-C handling is left to the caller; a sentinel file works too.
    let halt = HaltSignal::new().with_sentinel(std::env::temp_dir().join("tiermix.halt"));

    for criterion in [
        ConvergenceCriterion::FirstHeldOutMax,
        ConvergenceCriterion::MaxHeldOutLl,
        ConvergenceCriterion::MaxDataLl,
    ] {
        let config = EmConfig::default().with_seed(1).with_max_iterations(200);
        let options = TrainingOptions::new().with_convergence_criterion(criterion);
        let outcome = EmEngine::new(config, options)
            .with_halt(halt.clone())
            .train(&topology, &train, Some(&held_out), None)?;

        println!(
            "{:<20} {:<32} iterations {:>3}, best {:?} ({:.4}), aic {:.2}",
            criterion.name(),
            outcome.status.to_string(),
            outcome.iterations,
            outcome.best_iteration,
            outcome.best_score.unwrap_or(f64::NAN),
            outcome.complexity.aic
        );
        if outcome.status == StopReason::Halted {
            break;
        }
    }
    Ok(())
}
