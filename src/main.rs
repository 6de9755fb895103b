use std::{
    env,
    fs::read_to_string,
    io::{Error, ErrorKind, Result},
};
use rand::{SeedableRng, rngs::StdRng};
use serde::Deserialize;
use toml::from_str;
use spike_sorting_components::{
    clustering::ClusteringStrategy,
    error::SortingError,
    generation::{GroundTruthParameters, generate_ground_truth_recording},
    sorter::{SorterParameters, run_sorter},
};


#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DemoConfig {
    ground_truth: GroundTruthParameters,
    sorter: SorterParameters,
    generation_seed: u64,
}

fn to_io_error(err: SortingError) -> Error {
    Error::new(ErrorKind::Other, err.to_string())
}

fn read_config(path: Option<&String>) -> Result<DemoConfig> {
    match path {
        Some(path) => {
            let toml_content = read_to_string(path)?;

            from_str(&toml_content)
                .map_err(|err| Error::new(ErrorKind::InvalidData, format!("Cannot read config: {}", err)))
        },
        None => Ok(DemoConfig::default()),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    let config = read_config(args.get(1))?;

    let mut rng = StdRng::seed_from_u64(config.generation_seed);
    let truth = generate_ground_truth_recording(&config.ground_truth, &mut rng).map_err(to_io_error)?;
    log::info!(
        "generated {} peaks from {} units on {} channels",
        truth.peaks.len(), config.ground_truth.units.len(), config.ground_truth.num_channels,
    );

    let output = run_sorter(&truth.recording, &truth.peaks, &config.sorter).map_err(to_io_error)?;

    log::info!(
        "{}: {} clusters kept, {} raw clusters, {} merged, {} failed partitions",
        config.sorter.clustering.name(),
        output.clustering.num_units(),
        output.clustering.report.raw_clusters,
        output.clustering.report.merges.len(),
        output.clustering.report.failed_partitions,
    );
    log::info!(
        "found {} units for {} injected, {} spikes matched for {} injected",
        output.sorting.num_units(), config.ground_truth.units.len(),
        output.sorting.spikes.len(), truth.spikes.len(),
    );

    Ok(())
}
