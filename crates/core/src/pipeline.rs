//! Pipeline for reading cut manifests in parallel and encoding them into
//! Canary2 prompt token ids.

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;

use crate::canary2::{canary2_prompt, FormatterConfig};
use crate::cut::Cut;
use crate::error::ManifestError;
use crate::formatter::PromptFormatter;
use crate::manifest::{create_writer, open_reader};
use crate::PromptTokenizer;

/// Entries between progress log lines.
const PROGRESS_EVERY: usize = 100_000;

/// Configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub num_workers: usize,
    /// Cuts shorter than this (seconds) are filtered out.
    pub min_duration: Option<f64>,
    /// Cuts longer than this (seconds) are filtered out.
    pub max_duration: Option<f64>,
    /// Seed of the per-cut random generators.
    pub seed: u64,
    pub formatter: FormatterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_workers: 8,
            min_duration: None,
            max_duration: None,
            seed: 42,
            formatter: FormatterConfig::default(),
        }
    }
}

impl PipelineConfig {
    fn keeps(&self, duration: f64) -> bool {
        self.min_duration.map_or(true, |min| duration >= min)
            && self.max_duration.map_or(true, |max| duration <= max)
    }
}

/// Cuts of a manifest split by the duration filter.
#[derive(Debug, Default)]
pub struct ManifestReadout {
    pub entries: Vec<Cut>,
    pub total_duration: f64,
    pub filtered: Vec<Cut>,
    pub filtered_duration: f64,
    /// Lines that could not be parsed as cuts.
    pub failed: usize,
}

/// One encoded cut, as written to the output JSONL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodedRecord {
    pub id: String,
    pub input_ids: Vec<u32>,
    pub context_ids: Vec<u32>,
    pub answer_ids: Vec<u32>,
    pub translated: bool,
}

/// Result of encoding a manifest.
#[derive(Debug, Default)]
pub struct EncodeResult {
    pub records: Vec<EncodedRecord>,
    pub filtered: usize,
    pub parse_failures: usize,
    pub encode_failures: usize,
    pub total_duration: f64,
}

/// Derive an independent seed per cut so results do not depend on scheduling.
fn seed_for_index(index: u64, global_seed: u64) -> u64 {
    let mut z = index
        .wrapping_add(global_seed)
        .wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Read a JSONL manifest (plain or gzip) and parse its cuts on a pool of
/// `num_workers` threads, splitting them by the duration filter.
///
/// Input order is preserved in both buckets. Unparseable lines are logged and
/// counted.
pub fn read_manifest_parallel(
    manifest: &Path,
    config: &PipelineConfig,
) -> Result<ManifestReadout, ManifestError> {
    let lines: Vec<String> = open_reader(manifest)?
        .lines()
        .collect::<Result<_, _>>()
        .map_err(|e| ManifestError::io(manifest, e))?;

    info!(
        "Processing {} entries with {} workers",
        lines.len(),
        config.num_workers
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.num_workers.max(1))
        .build()?;
    let processed = AtomicUsize::new(0);

    let parsed: Vec<Option<Cut>> = pool.install(|| {
        lines
            .par_iter()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                let count = processed.fetch_add(1, Ordering::Relaxed) + 1;
                if count % PROGRESS_EVERY == 0 {
                    info!("counter: {}", count);
                }
                serde_json::from_str::<Cut>(line)
                    .map_err(|e| warn!("Skipping line {} of {:?}: {}", idx + 1, manifest, e))
                    .ok()
            })
            .collect()
    });

    let mut readout = ManifestReadout::default();
    for cut in parsed {
        let Some(cut) = cut else {
            readout.failed += 1;
            continue;
        };
        let duration = cut.duration();
        if config.keeps(duration) {
            readout.total_duration += duration;
            readout.entries.push(cut);
        } else {
            readout.filtered_duration += duration;
            readout.filtered.push(cut);
        }
    }

    debug!(
        "Read {} entries ({:.1}s), filtered {} ({:.1}s), failed {}",
        readout.entries.len(),
        readout.total_duration,
        readout.filtered.len(),
        readout.filtered_duration,
        readout.failed
    );
    Ok(readout)
}

/// Encode every kept cut of a manifest in parallel.
///
/// Cuts that fail to encode are logged and counted; the caller decides
/// whether a non-zero failure count is fatal.
pub fn encode_manifest<T>(
    manifest: &Path,
    formatter: &PromptFormatter<T>,
    config: &PipelineConfig,
) -> Result<EncodeResult, ManifestError>
where
    T: PromptTokenizer + Sync + Send,
{
    let readout = read_manifest_parallel(manifest, config)?;
    let total = readout.entries.len();
    let processed = AtomicUsize::new(0);
    let failures = AtomicUsize::new(0);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.num_workers.max(1))
        .build()?;

    let records: Vec<EncodedRecord> = pool.install(|| {
        readout
            .entries
            .par_iter()
            .enumerate()
            .filter_map(|(idx, cut)| {
                let mut rng = StdRng::seed_from_u64(seed_for_index(idx as u64, config.seed));
                let result = canary2_prompt(cut, formatter, &config.formatter, &mut rng);
                let count = processed.fetch_add(1, Ordering::Relaxed) + 1;
                if count % PROGRESS_EVERY == 0 || count == total {
                    info!("Encoded {}/{} cuts...", count, total);
                }

                match result {
                    Ok(prompt) => Some(EncodedRecord {
                        id: prompt.sample.cut_id,
                        input_ids: prompt.encoded.input_ids,
                        context_ids: prompt.encoded.context_ids,
                        answer_ids: prompt.encoded.answer_ids,
                        translated: prompt.sample.translated,
                    }),
                    Err(e) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        warn!("Error encoding cut {}: {}", cut.id(), e);
                        None
                    }
                }
            })
            .collect()
    });

    let encode_failures = failures.load(Ordering::Relaxed);
    if encode_failures > 0 {
        warn!("{} cuts failed to encode", encode_failures);
    }

    Ok(EncodeResult {
        records,
        filtered: readout.filtered.len(),
        parse_failures: readout.failed,
        encode_failures,
        total_duration: readout.total_duration,
    })
}

/// Write encoded records as JSONL (gzip when the path ends in `.gz`).
pub fn write_jsonl_output(records: &[EncodedRecord], path: &Path) -> Result<(), ManifestError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ManifestError::io(parent, e))?;
    }
    let mut writer = create_writer(path)?;
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer
            .write_all(b"\n")
            .map_err(|e| ManifestError::io(path, e))?;
    }
    writer.flush().map_err(|e| ManifestError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ToyTokenizer;
    use crate::ProtocolVersion;
    use serde_json::json;
    use tempfile::TempDir;

    fn mono(id: &str, duration: f64, translation: Option<&str>) -> String {
        let mut sup = json!({"id": format!("{id}-sup"), "text": "ok", "language": "en"});
        if let Some(t) = translation {
            sup["custom"] = json!({"translation": t});
        }
        json!({
            "id": id,
            "type": "MonoCut",
            "duration": duration,
            "supervisions": [sup],
            "custom": {"source_lang": "en", "target_lang": "en"}
        })
        .to_string()
    }

    fn write_manifest(dir: &Path, name: &str, lines: &[String]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    #[test]
    fn test_read_manifest_parallel_filters_by_duration() {
        let temp = TempDir::new().unwrap();
        let path = write_manifest(
            temp.path(),
            "cuts.jsonl",
            &[
                mono("a", 1.0, None),
                mono("b", 30.0, None),
                "{broken".to_string(),
                String::new(),
                mono("c", 0.1, None),
                mono("d", 5.0, None),
            ],
        );
        let config = PipelineConfig {
            num_workers: 3,
            min_duration: Some(0.5),
            max_duration: Some(20.0),
            ..Default::default()
        };
        let readout = read_manifest_parallel(&path, &config).unwrap();
        let ids: Vec<&str> = readout.entries.iter().map(|c| c.id()).collect();
        assert_eq!(ids, ["a", "d"]);
        assert_eq!(readout.total_duration, 6.0);
        let filtered: Vec<&str> = readout.filtered.iter().map(|c| c.id()).collect();
        assert_eq!(filtered, ["b", "c"]);
        assert!((readout.filtered_duration - 30.1).abs() < 1e-9);
        assert_eq!(readout.failed, 1);
    }

    #[test]
    fn test_encode_manifest_is_reproducible() {
        let temp = TempDir::new().unwrap();
        let lines: Vec<String> = (0..40)
            .map(|i| mono(&format!("cut-{i}"), 1.0, Some("hallo")))
            .chain([json!({"id": "multi", "type": "MultiCut", "duration": 1.0}).to_string()])
            .collect();
        let path = write_manifest(temp.path(), "cuts.jsonl", &lines);

        let formatter = PromptFormatter::new(
            ToyTokenizer::default(),
            ProtocolVersion::UserControls.template().unwrap(),
        )
        .unwrap();
        let config = PipelineConfig {
            num_workers: 4,
            formatter: FormatterConfig {
                translation_task_prob: 0.5,
                ..Default::default()
            },
            ..Default::default()
        };

        let first = encode_manifest(&path, &formatter, &config).unwrap();
        let second = encode_manifest(&path, &formatter, &config).unwrap();
        assert_eq!(first.records.len(), 40);
        assert_eq!(first.encode_failures, 1);
        assert_eq!(first.records, second.records);
        assert!(first.records.iter().any(|r| r.translated));
        assert!(first.records.iter().any(|r| !r.translated));
        assert_eq!(first.records[0].id, "cut-0");
    }

    #[test]
    fn test_write_jsonl_output() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out/encoded.jsonl");
        let records = vec![EncodedRecord {
            id: "a".into(),
            input_ids: vec![1, 2, 3],
            context_ids: vec![1],
            answer_ids: vec![2],
            translated: false,
        }];
        write_jsonl_output(&records, &path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(value["id"], "a");
        assert_eq!(value["answer_ids"], json!([2]));
    }

    #[test]
    fn test_seed_for_index_spreads() {
        assert_ne!(seed_for_index(0, 42), seed_for_index(1, 42));
        assert_eq!(seed_for_index(3, 42), seed_for_index(3, 42));
    }
}
