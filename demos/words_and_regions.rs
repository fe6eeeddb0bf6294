use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tiermix::{
    get_cluster_membership, ClusterData, CorrespondenceModel, EmConfig, EmEngine, InferenceOptions,
    LevelPosteriors, Point, Topology, TrainingOptions,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Images annotated with words, each with a few region feature vectors.
    // Three scenes: sky (words 0-2), sea (3-5), forest (6-8). Word 9 is
    // common to everything and should settle near the root.
    let mut rng = StdRng::seed_from_u64(3);
    let noise = Normal::new(0.0, 0.4)?;
    let centres = [[0.0, 4.0], [0.0, -4.0], [4.0, 0.0]];

    let mut builder = ClusterData::builder(10, 2);
    for i in 0..90 {
        let scene = i % 3;
        let mut point = Point::new().with_discrete(9, 1.0);
        for _ in 0..2 {
            point = point.with_discrete(scene * 3 + rng.random_range(0..3), 1.0);
        }
        for _ in 0..3 {
            let c = centres[scene];
            point = point.with_continuous(vec![c[0] + noise.sample(&mut rng), c[1] + noise.sample(&mut rng)]);
        }
        builder = builder.add_point(point);
    }
    let data = builder.build()?;

    // A root with three leaves.
    let topology = Topology::from_fan_outs(&[3], 0, 2)?;
    let config = EmConfig::default().with_seed(11).with_max_iterations(50);
    let options = TrainingOptions::new().with_model_correspondence(CorrespondenceModel::Dependent);

    let outcome = EmEngine::new(config.clone(), options)
        .with_observer(10, |r, _| {
            println!("iteration {:>3}: ll {:.4}", r.iteration, r.log_likelihood);
        })
        .train(&topology, &data, None, None)?;
    println!(
        "{} after {} iterations, ll {:.4}, mdl {:.2}",
        outcome.status, outcome.iterations, outcome.model.log_likelihood(), outcome.complexity.mdl
    );

    let model = &outcome.model;
    for level in topology.levels() {
        let nodes = model.level(level);
        for node in 0..nodes.num_nodes() {
            let row = nodes.categorical.row(node);
            let top = tiermix::numeric::top_k_indices(&row.to_vec(), 3);
            println!("level {level} node {node}: top words {top:?}");
        }
    }

    let scored = get_cluster_membership(
        model,
        &data,
        &config,
        &InferenceOptions::new()
            .with_model_correspondence(CorrespondenceModel::Dependent)
            .with_sparse_levels(1),
    )?;
    if let Some(LevelPosteriors::Sparse(rows)) = &scored.levels {
        for (p, row) in rows.iter().take(3).enumerate() {
            let cluster = tiermix::numeric::argmax(&scored.membership.row(p).to_vec());
            println!("point {p}: cluster {cluster:?}, dominant level {:?}", row.first());
        }
    }
    Ok(())
}
