use crate::error::Result;
use crate::matrix::Matrix;
use crate::model::RnnDbn;
use crate::piano_roll::write_midi;
use std::path::{Path, PathBuf};
use tracing::info;

/// Generates `count` piano-rolls, one `generate()` call each.
pub fn generate_sequences(model: &mut RnnDbn, count: usize) -> Result<Vec<Matrix>> {
    let mut result = Vec::with_capacity(count);
    for idx in 0..count {
        let roll = model.generate()?;
        info!(
            "Generated sequence {}: {} time steps, {} active notes",
            idx,
            roll.rows(),
            roll.as_slice().iter().filter(|x| **x > 0.5).count()
        );
        result.push(roll);
    }
    Ok(result)
}

/// Output paths for `count` generated sequences. A single sequence goes to `path` as given,
/// several get an index before the extension: sample.mid -> sample-0.mid, sample-1.mid, ...
pub fn numbered_paths(path: &Path, count: usize) -> Vec<PathBuf> {
    if count == 1 {
        return vec![path.to_path_buf()];
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mid".to_string());
    (0..count)
        .map(|idx| path.with_file_name(format!("{}-{}.{}", stem, idx, extension)))
        .collect()
}

/// Generates one sequence per path and writes each as a MIDI file using the model's pitch
/// range and sampling period.
pub fn generate_to_midi<P: AsRef<Path>>(model: &mut RnnDbn, paths: &[P]) -> Result<Vec<Matrix>> {
    let rolls = generate_sequences(model, paths.len())?;
    let pitch_range = model.config().pitch_range;
    let dt = model.config().dt;
    for (roll, path) in rolls.iter().zip(paths.iter()) {
        write_midi(path, roll, pitch_range, dt)?;
        info!("Wrote {}", path.as_ref().display());
    }
    Ok(rolls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfiguration;
    use crate::piano_roll::read_midi;

    fn small_model() -> RnnDbn {
        RnnDbn::new(
            ModelConfiguration::new()
                .pitch_range(48, 60)
                .n_hidden(8)
                .n_hidden_recurrent(6)
                .generation_gibbs_steps(2)
                .generation_horizon(16)
                .weight_scale(1.0),
        )
        .unwrap()
    }

    #[test]
    fn every_sequence_has_horizon_shape() {
        let mut model = small_model();
        let rolls = generate_sequences(&mut model, 3).unwrap();
        assert_eq!(rolls.len(), 3);
        for roll in rolls.iter() {
            assert_eq!(roll.shape(), (16, 12));
        }
    }

    #[test]
    fn numbering_keeps_extension() {
        let one = numbered_paths(Path::new("out/sample.mid"), 1);
        assert_eq!(one, vec![PathBuf::from("out/sample.mid")]);
        let two = numbered_paths(Path::new("out/sample.mid"), 2);
        assert_eq!(
            two,
            vec![
                PathBuf::from("out/sample-0.mid"),
                PathBuf::from("out/sample-1.mid")
            ]
        );
    }

    #[test]
    fn written_files_read_back() {
        let mut model = small_model();
        let dir = std::env::temp_dir().join(format!("mj-rnndbn-gen-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let paths = numbered_paths(&dir.join("sample.mid"), 2);
        let rolls = generate_to_midi(&mut model, &paths).unwrap();
        for (roll, path) in rolls.iter().zip(paths.iter()) {
            let back = read_midi(path, (48, 60), model.config().dt).unwrap();
            // trailing silence is not stored
            assert!(back.rows() <= roll.rows());
            assert_eq!(back, roll.slice_rows(0, back.rows()));
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
