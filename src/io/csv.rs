/*!
# Exporting particle populations to CSV

Enable via the `csv` feature.

Each row is one particle. The header holds `stage`, `particle`, one column per parameter
(in parameter order), then `log_weight` and `log_like`.
*/

use csv::Writer;
use std::fs::File;
use std::path::Path;

use crate::chain::ParticleChain;
use crate::error::Result;
use crate::step::SmcStep;

fn header(step: &SmcStep) -> Vec<String> {
    let mut header = vec!["stage".to_string(), "particle".to_string()];
    header.extend(step.param_names().into_iter().map(String::from));
    header.push("log_weight".to_string());
    header.push("log_like".to_string());
    header
}

fn write_rows(wtr: &mut Writer<File>, stage: usize, step: &SmcStep) -> Result<()> {
    for (i, particle) in step.particles().iter().enumerate() {
        let mut row = vec![stage.to_string(), i.to_string()];
        row.extend(particle.values().map(|v| v.to_string()));
        row.push(particle.log_weight().to_string());
        row.push(particle.log_like().to_string());
        wtr.write_record(&row)?;
    }
    Ok(())
}

/**
Saves the particles of one step as a CSV file, labelled as stage `stage`.

# Examples

```rust
use mini_smc::io::csv::save_step_csv;
use mini_smc::particle::{Params, Particle};
use mini_smc::step::SmcStep;

let params: Params = [("a".to_string(), 1.0), ("b".to_string(), 2.0)].into();
let step = SmcStep::from_particles(vec![Particle::new(params, -0.5, -1.0); 2], 1.0).unwrap();
let path = std::env::temp_dir().join("mini_smc_step.csv");
save_step_csv(&step, 0, &path).unwrap();
```
*/
pub fn save_step_csv(step: &SmcStep, stage: usize, path: impl AsRef<Path>) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path)?);
    wtr.write_record(header(step))?;
    write_rows(&mut wtr, stage, step)?;
    wtr.flush()?;
    Ok(())
}

/// Saves every stage of a chain into a single CSV file.
pub fn save_chain_csv(chain: &ParticleChain, path: impl AsRef<Path>) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path)?);
    let Some(first) = chain.get_step(0) else {
        wtr.flush()?;
        return Ok(());
    };
    wtr.write_record(header(first))?;
    for (stage, step) in chain.steps().iter().enumerate() {
        write_rows(&mut wtr, stage, step)?;
    }
    wtr.flush()?;
    Ok(())
}
