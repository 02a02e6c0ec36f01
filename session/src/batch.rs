//! Output path rules and converting whole directories of replays.

use std::fs;
use std::path::{Path, PathBuf};

use mupen_integrations::Log;

use crate::emulator::CancelFlag;
use crate::{SessionError, SessionReport};

pub const REPLAY_EXTENSION: &str = "krec";

/// `explicit` if given, otherwise the input with its extension swapped for `.mp4`.
pub fn output_path_for(input: &Path, explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) if !path.as_os_str().is_empty() => path.to_path_buf(),
        _ => input.with_extension("mp4"),
    }
}

/// Output path for one file of a batch: `<dir>/<stem>.mp4`, where `dir` is
/// `output_dir` or, without one, the input's own directory.
pub fn batch_output_path_for(input: &Path, output_dir: Option<&Path>) -> PathBuf {
    let dir = output_dir
        .filter(|dir| !dir.as_os_str().is_empty())
        .or_else(|| input.parent())
        .unwrap_or_else(|| Path::new(""));

    let mut name = input.file_stem().unwrap_or_default().to_os_string();
    name.push(".mp4");
    dir.join(name)
}

/// Lists the `.krec` files directly inside `dir`, sorted by path.
pub fn collect_replays(dir: &Path) -> Result<Vec<PathBuf>, SessionError> {
    let read_dir_error = |source| SessionError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut replays = Vec::new();

    for entry in fs::read_dir(dir).map_err(read_dir_error)? {
        let path = entry.map_err(read_dir_error)?.path();

        if path.is_file() && path.extension().is_some_and(|ext| ext == REPLAY_EXTENSION) {
            replays.push(path);
        }
    }

    replays.sort();

    tracing::info!(target: Log::Session, ?dir, count = replays.len(), "Collected replays");
    Ok(replays)
}

/// The result of converting one file in a batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub input: PathBuf,
    pub output: PathBuf,
    pub result: Result<SessionReport, SessionError>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Converts each input in order with `convert(input, output)`. Files left over after a
/// cancellation are reported as cancelled without being attempted.
pub fn convert_batch<F>(
    inputs: &[PathBuf],
    output_dir: Option<&Path>,
    cancel: &CancelFlag,
    mut convert: F,
) -> Vec<BatchOutcome>
where
    F: FnMut(&Path, &Path) -> Result<SessionReport, SessionError>,
{
    let mut outcomes = Vec::with_capacity(inputs.len());

    for (index, input) in inputs.iter().enumerate() {
        let output = batch_output_path_for(input, output_dir);

        let result = if cancel.is_cancelled() {
            Err(SessionError::Cancelled)
        } else {
            tracing::info!(
                target: Log::Session,
                file = index + 1,
                of = inputs.len(),
                ?input,
                "Converting"
            );

            convert(input, &output)
        };

        if let Err(error) = &result {
            tracing::error!(target: Log::Session, ?input, ?error, "Conversion failed");
        }

        outcomes.push(BatchOutcome {
            input: input.clone(),
            output,
            result,
        });
    }

    let succeeded = outcomes.iter().filter(|outcome| outcome.succeeded()).count();

    tracing::info!(
        target: Log::Session,
        succeeded,
        failed = outcomes.len() - succeeded,
        "Batch finished"
    );

    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_swaps_the_extension() {
        assert_eq!(
            output_path_for(Path::new("replays/match.krec"), None),
            PathBuf::from("replays/match.mp4")
        );

        assert_eq!(
            output_path_for(Path::new("match.krec"), Some(Path::new("out/final.mp4"))),
            PathBuf::from("out/final.mp4")
        );

        assert_eq!(
            output_path_for(Path::new("match.krec"), Some(Path::new(""))),
            PathBuf::from("match.mp4")
        );
    }

    #[test]
    fn batch_outputs_land_in_the_output_dir() {
        assert_eq!(
            batch_output_path_for(Path::new("in/a.b.krec"), Some(Path::new("videos"))),
            PathBuf::from("videos/a.b.mp4")
        );

        assert_eq!(
            batch_output_path_for(Path::new("in/game.krec"), None),
            PathBuf::from("in/game.mp4")
        );
    }

    #[test]
    fn collects_only_krec_files_sorted() {
        let dir = tempfile::tempdir().unwrap();

        for name in ["b.krec", "a.krec", "notes.txt", "c.krec.bak"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        fs::create_dir(dir.path().join("nested.krec")).unwrap();

        let replays = collect_replays(dir.path()).unwrap();
        let names: Vec<_> = replays
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();

        assert_eq!(names, ["a.krec", "b.krec"]);
    }

    #[test]
    fn missing_directory_is_an_error() {
        assert!(matches!(
            collect_replays(Path::new("/nonexistent/replays")),
            Err(SessionError::ReadDir { .. })
        ));
    }

    #[test]
    fn cancellation_skips_the_remaining_files() {
        let cancel = CancelFlag::new();
        let inputs = vec![PathBuf::from("a.krec"), PathBuf::from("b.krec"), PathBuf::from("c.krec")];
        let mut attempted = Vec::new();

        let outcomes = convert_batch(&inputs, None, &cancel, |input, _| {
            attempted.push(input.to_path_buf());
            cancel.cancel();
            Err(SessionError::NoFramesCaptured)
        });

        assert_eq!(attempted, vec![PathBuf::from("a.krec")]);
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[1].result, Err(SessionError::Cancelled)));
        assert!(matches!(outcomes[2].result, Err(SessionError::Cancelled)));
    }
}
