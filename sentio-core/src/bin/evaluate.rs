use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use sentio_core::{audio::AudioFormat, BackendKind, Emotion, EngineConfig, SentioEngine};
use serde::Serialize;

fn main() {
    if let Err(e) = run() {
        eprintln!("evaluation failed: {e}");
        std::process::exit(1);
    }
}

#[derive(Debug)]
struct Args {
    fixtures_dir: PathBuf,
    iterations: usize,
    output: Option<PathBuf>,
    model: Option<PathBuf>,
    backend: Option<BackendKind>,
}

#[derive(Debug, Clone, Serialize)]
struct CaseResult {
    file: String,
    iteration: usize,
    latency_ms: f64,
    expected: Option<Emotion>,
    predicted: Option<Emotion>,
    confidence: Option<f64>,
    correct: Option<bool>,
    error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct LabelSummary {
    label: Emotion,
    runs: usize,
    accuracy: f64,
    /// Predicted label → count.
    predicted: BTreeMap<Emotion, usize>,
}

#[derive(Debug, Clone, Serialize)]
struct Summary {
    fixtures_dir: String,
    backend: String,
    iterations: usize,
    total_runs: usize,
    total_files: usize,
    failed_runs: usize,
    p50_latency_ms: f64,
    p95_latency_ms: f64,
    avg_latency_ms: f64,
    labelled_runs: usize,
    accuracy: Option<f64>,
    avg_confidence: Option<f64>,
    labels: Vec<LabelSummary>,
    cases: Vec<CaseResult>,
}

fn flag_value(it: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    it.next().ok_or_else(|| format!("missing value for {flag}"))
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        fixtures_dir: PathBuf::from("fixtures"),
        iterations: 1,
        output: None,
        model: None,
        backend: None,
    };

    let mut it = std::env::args().skip(1);
    while let Some(flag) = it.next() {
        match flag.as_str() {
            "--fixtures" => args.fixtures_dir = flag_value(&mut it, &flag)?.into(),
            "--iterations" => {
                args.iterations = flag_value(&mut it, &flag)?
                    .parse::<usize>()
                    .map_err(|_| "--iterations expects a positive integer".to_string())?
                    .clamp(1, 10);
            }
            "--output" => args.output = Some(flag_value(&mut it, &flag)?.into()),
            "--model" => args.model = Some(flag_value(&mut it, &flag)?.into()),
            "--backend" => {
                let raw = flag_value(&mut it, &flag)?;
                args.backend = Some(raw.parse::<BackendKind>().map_err(|e| e.to_string())?);
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p sentio-core --bin evaluate -- \\
  --fixtures <dir> [--iterations <n>] [--output <file.json>] \\
  [--model <artifact>] [--backend native|onnx]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unrecognised flag {other:?}")),
        }
    }
    Ok(args)
}

fn collect_audio(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), String> {
    let entries = std::fs::read_dir(dir).map_err(|e| e.to_string())?;
    for entry in entries {
        let entry = entry.map_err(|e| e.to_string())?;
        let path = entry.path();
        if path.is_dir() {
            collect_audio(&path, out)?;
            continue;
        }
        if AudioFormat::from_path(&path).is_ok() {
            out.push(path);
        }
    }
    Ok(())
}

/// RAVDESS emotion code (third dash-separated field of the file stem).
fn ravdess_label(code: &str) -> Option<Emotion> {
    Some(match code {
        "01" => Emotion::Neutral,
        "02" => Emotion::Calm,
        "03" => Emotion::Happy,
        "04" => Emotion::Sad,
        "05" => Emotion::Angry,
        "06" => Emotion::Fearful,
        "07" => Emotion::Disgust,
        "08" => Emotion::Surprised,
        _ => return None,
    })
}

/// Expected label from the parent directory name, else a RAVDESS file name.
fn expected_label_for(path: &Path) -> Option<Emotion> {
    let from_dir = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .and_then(|n| n.parse::<Emotion>().ok());
    from_dir.or_else(|| {
        let stem = path.file_stem()?.to_str()?;
        let fields: Vec<&str> = stem.split('-').collect();
        if fields.len() == 7 {
            ravdess_label(fields[2])
        } else {
            None
        }
    })
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    if sorted.len() == 1 {
        return sorted[0];
    }
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn summarize_labels(cases: &[CaseResult]) -> Vec<LabelSummary> {
    let mut grouped: BTreeMap<Emotion, Vec<&CaseResult>> = BTreeMap::new();
    for case in cases {
        if let Some(label) = case.expected {
            grouped.entry(label).or_default().push(case);
        }
    }
    grouped
        .into_iter()
        .map(|(label, rows)| {
            let mut predicted = BTreeMap::new();
            for row in &rows {
                if let Some(p) = row.predicted {
                    *predicted.entry(p).or_insert(0) += 1;
                }
            }
            let correct = rows.iter().filter(|r| r.correct == Some(true)).count();
            LabelSummary {
                label,
                runs: rows.len(),
                accuracy: correct as f64 / rows.len() as f64,
                predicted,
            }
        })
        .collect()
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    if !args.fixtures_dir.is_dir() {
        return Err(format!("{} is not a directory", args.fixtures_dir.display()));
    }

    let mut files = Vec::new();
    collect_audio(&args.fixtures_dir, &mut files)?;
    files.sort();
    if files.is_empty() {
        return Err(format!(
            "no .wav/.mp3 fixtures found in {}",
            args.fixtures_dir.display()
        ));
    }

    let mut config = EngineConfig::from_env();
    if let Some(model) = args.model {
        config.model_path = model;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    let engine = SentioEngine::new(config).map_err(|e| e.to_string())?;
    engine.warm_up().map_err(|e| e.to_string())?;

    println!(
        "Running Sentio evaluation on {} fixtures (backend={}, iterations={})",
        files.len(),
        engine.backend_name(),
        args.iterations
    );

    let mut cases = Vec::new();
    for file_path in &files {
        let expected = expected_label_for(file_path);
        let file = file_path
            .strip_prefix(&args.fixtures_dir)
            .unwrap_or(file_path)
            .display()
            .to_string();

        for iteration in 1..=args.iterations {
            let started = Instant::now();
            let outcome = engine.predict_file(file_path);
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            let (predicted, confidence, error) = match outcome {
                Ok(p) => (Some(p.emotion), Some(p.confidence), None),
                Err(e) => (None, None, Some(e.to_string())),
            };
            let correct = match (expected, predicted) {
                (Some(e), Some(p)) => Some(e == p),
                _ => None,
            };
            println!(
                "{file} [{iteration}/{iters}] {latency_ms:.1} ms → {}",
                predicted.map_or("error", |p| p.as_str()),
                iters = args.iterations,
            );
            cases.push(CaseResult {
                file: file.clone(),
                iteration,
                latency_ms,
                expected,
                predicted,
                confidence,
                correct,
                error,
            });
        }
    }

    let latencies: Vec<f64> = cases
        .iter()
        .filter(|c| c.error.is_none())
        .map(|c| c.latency_ms)
        .collect();
    let confidences: Vec<f64> = cases.iter().filter_map(|c| c.confidence).collect();
    let judged: Vec<bool> = cases.iter().filter_map(|c| c.correct).collect();
    let accuracy = if judged.is_empty() {
        None
    } else {
        Some(judged.iter().filter(|&&ok| ok).count() as f64 / judged.len() as f64)
    };

    let summary = Summary {
        fixtures_dir: args.fixtures_dir.display().to_string(),
        backend: engine.backend_name().to_string(),
        iterations: args.iterations,
        total_runs: cases.len(),
        total_files: files.len(),
        failed_runs: cases.iter().filter(|c| c.error.is_some()).count(),
        p50_latency_ms: percentile(&latencies, 0.50),
        p95_latency_ms: percentile(&latencies, 0.95),
        avg_latency_ms: mean(&latencies).unwrap_or(0.0),
        labelled_runs: judged.len(),
        accuracy,
        avg_confidence: mean(&confidences),
        labels: summarize_labels(&cases),
        cases,
    };

    println!(
        "Done. runs={} failed={} p50={:.1}ms p95={:.1}ms accuracy={}",
        summary.total_runs,
        summary.failed_runs,
        summary.p50_latency_ms,
        summary.p95_latency_ms,
        summary
            .accuracy
            .map_or("n/a".to_string(), |a| format!("{:.1}%", a * 100.0))
    );

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    if let Some(out) = args.output {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&out, json).map_err(|e| e.to_string())?;
        println!("Wrote evaluation report: {}", out.display());
    } else {
        println!("{json}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_from_parent_directory() {
        assert_eq!(
            expected_label_for(Path::new("fixtures/Happy/clip_01.wav")),
            Some(Emotion::Happy)
        );
    }

    #[test]
    fn label_from_ravdess_name() {
        assert_eq!(
            expected_label_for(Path::new("fixtures/Actor_01/03-01-05-01-02-01-12.wav")),
            Some(Emotion::Angry)
        );
        assert_eq!(
            expected_label_for(Path::new("x/03-01-09-01-02-01-12.wav")),
            None
        );
    }

    #[test]
    fn unlabelled_file_has_no_expectation() {
        assert_eq!(expected_label_for(Path::new("misc/recording.mp3")), None);
    }

    #[test]
    fn percentile_picks_nearest_rank() {
        let v = [5.0, 1.0, 3.0, 2.0, 4.0];
        assert_eq!(percentile(&v, 0.5), 3.0);
        assert_eq!(percentile(&v, 0.95), 5.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }
}
