use ndarray::{s, Array1, Array2};
use recording_merge::{load, merge, save, Dataset, MergeConfig};
use std::error::Error;

fn session(labels: &[&str], trials: usize, offset: f64) -> Result<Dataset, Box<dyn Error>> {
    let samples = 250;
    let dataset = Dataset::new(
        labels.iter().map(|s| s.to_string()).collect(),
        (0..trials)
            .map(|t| {
                Array2::from_shape_fn((labels.len(), samples), |(c, i)| {
                    offset + (t * 10 + c) as f64 + (i as f64 / 25.0).sin()
                })
            })
            .collect(),
        vec![Array1::linspace(-0.2, 0.796, samples); trials],
    )?;
    Ok(dataset)
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    // Two sessions from the same cap; the second one lost channel Oz and
    // stored its channels in a different order
    let morning = session(&["Fz", "Cz", "Pz", "Oz"], 3, 0.0)?.with_name("morning");
    let afternoon = session(&["Pz", "Cz", "Fz"], 2, 100.0)?.with_name("afternoon");

    let merged = merge(&[morning, afternoon], &MergeConfig::default())?;

    println!("Channels: {:?}", merged.labels);
    println!("Trials: {}", merged.num_trials());
    println!("Total samples: {}", merged.total_samples());

    if let Some(provenance) = &merged.provenance {
        println!("Mode: {:?}", provenance.mode);
        for source in &provenance.sources {
            println!(
                "  {}: {} ({} trials)",
                source.position,
                source.name.as_deref().unwrap_or("<unnamed>"),
                source.num_trials
            );
        }
    }

    // Show first few samples of the first channel of the last trial
    if let Some(last) = merged.trials.last() {
        let num_samples = std::cmp::min(5, last.ncols());
        println!(
            "{} (last trial, first {} samples): {:?}",
            merged.labels[0],
            num_samples,
            last.slice(s![0, ..num_samples]).to_vec()
        );
    }

    // Round trip through a container file
    let path = std::env::temp_dir().join("basic_usage.trm");
    save(&merged, &path)?;
    let reloaded = load(&path)?;
    println!(
        "Reloaded {} channels x {} trials from {}",
        reloaded.num_channels(),
        reloaded.num_trials(),
        path.display()
    );

    Ok(())
}
