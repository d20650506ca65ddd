//! Rewriting of lhotse cut manifests: language names become language codes and
//! the prompt metadata (`source_lang`, `target_lang`, `pnc`, `itn`) is added to
//! the first supervision.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use globset::{Glob, GlobMatcher};
use log::{info, warn};
use serde_json::{Map, Value};
use walkdir::WalkDir;

use crate::error::ManifestError;

/// Default file pattern of sharded lhotse cut manifests.
pub const DEFAULT_MANIFEST_PATTERN: &str = "cuts.*.jsonl.gz";

/// Language names found in source manifests and the codes the tokenizer uses.
const LANGUAGE_CODES: &[(&str, &str)] = &[
    ("marathi", "mr"),
    ("hindi", "hi"),
    ("english", "en"),
    ("kannada", "kn"),
    ("tamil", "ta"),
    ("telugu", "te"),
    ("malayalam", "ml"),
    ("bengali", "bn"),
    ("gujarati", "gu"),
    ("odia", "od"),
    ("punjabi", "pa"),
    ("assamese", "as"),
];

/// Map a language name (case-insensitive) to its code.
pub fn language_code(name: &str) -> Option<&'static str> {
    let name = name.to_lowercase();
    LANGUAGE_CODES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, code)| *code)
}

/// Why a manifest line was copied through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoSupervisions,
    NoLanguage,
    UnknownLanguage(String),
    InvalidJson(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoSupervisions => write!(f, "no supervisions found"),
            SkipReason::NoLanguage => write!(f, "no language found in supervision"),
            SkipReason::UnknownLanguage(lang) => write!(f, "unknown language '{}'", lang),
            SkipReason::InvalidJson(e) => write!(f, "error parsing JSON: {}", e),
        }
    }
}

/// Counts of rewritten and copied-through lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManifestStats {
    pub processed: usize,
    pub skipped: usize,
}

impl std::ops::AddAssign for ManifestStats {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.skipped += other.skipped;
    }
}

/// Rewrite the first supervision of a cut in place.
///
/// Returns the language code that was applied.
pub fn update_cut_language(cut: &mut Value) -> Result<&'static str, SkipReason> {
    let supervision = cut
        .get_mut("supervisions")
        .and_then(Value::as_array_mut)
        .and_then(|sups| sups.first_mut())
        .and_then(Value::as_object_mut)
        .ok_or(SkipReason::NoSupervisions)?;

    let language = supervision
        .get("language")
        .and_then(Value::as_str)
        .ok_or(SkipReason::NoLanguage)?;
    let code = language_code(language)
        .ok_or_else(|| SkipReason::UnknownLanguage(language.to_lowercase()))?;

    supervision.insert("language".to_string(), Value::from(code));
    let custom = supervision
        .entry("custom")
        .or_insert_with(|| Value::Object(Map::new()));
    if !custom.is_object() {
        *custom = Value::Object(Map::new());
    }
    if let Some(custom) = custom.as_object_mut() {
        custom.insert("source_lang".to_string(), Value::from(code));
        custom.insert("target_lang".to_string(), Value::from(code));
        custom.insert("pnc".to_string(), Value::from("yes"));
        custom.insert("itn".to_string(), Value::from("yes"));
    }
    Ok(code)
}

fn is_gzip(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "gz")
}

/// Open a manifest for line reading, decompressing `.gz` files.
pub(crate) fn open_reader(path: &Path) -> Result<Box<dyn BufRead + Send>, ManifestError> {
    let file = File::open(path).map_err(|e| ManifestError::io(path, e))?;
    let reader: Box<dyn Read + Send> = if is_gzip(path) {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

/// Create a manifest for writing, compressing `.gz` files.
pub(crate) fn create_writer(path: &Path) -> Result<Box<dyn Write>, ManifestError> {
    let file = File::create(path).map_err(|e| ManifestError::io(path, e))?;
    if is_gzip(path) {
        Ok(Box::new(GzEncoder::new(BufWriter::new(file), Compression::default())))
    } else {
        Ok(Box::new(BufWriter::new(file)))
    }
}

/// Outcome of rewriting a directory of manifests.
#[derive(Debug, Default)]
pub struct UpdateReport {
    /// Counts per rewritten file, in processing order.
    pub files: Vec<(PathBuf, ManifestStats)>,
    /// Files that failed and are left out of the counts.
    pub failed: Vec<PathBuf>,
}

impl UpdateReport {
    pub fn total(&self) -> ManifestStats {
        let mut total = ManifestStats::default();
        for (_, stats) in &self.files {
            total += *stats;
        }
        total
    }
}

/// Rewrite one manifest file line by line.
///
/// Lines that cannot be rewritten are copied through unchanged. With
/// `num_rows`, processing stops after that many rewritten lines.
pub fn process_manifest_file(
    input: &Path,
    output: &Path,
    num_rows: Option<usize>,
) -> Result<ManifestStats, ManifestError> {
    let reader = open_reader(input)?;
    let mut writer = create_writer(output)?;
    let mut stats = ManifestStats::default();

    for (idx, line) in reader.lines().enumerate() {
        if num_rows.map_or(false, |n| stats.processed >= n) {
            break;
        }
        let line_num = idx + 1;
        let line = line.map_err(|e| ManifestError::io(input, e))?;

        let outcome = serde_json::from_str::<Value>(line.trim())
            .map_err(|e| SkipReason::InvalidJson(e.to_string()))
            .and_then(|mut cut| update_cut_language(&mut cut).map(|_| cut));

        match outcome {
            Ok(cut) => {
                serde_json::to_writer(&mut writer, &cut)?;
                writer
                    .write_all(b"\n")
                    .map_err(|e| ManifestError::io(output, e))?;
                stats.processed += 1;
            }
            Err(reason) => {
                warn!("{} at line {} of {:?}", reason, line_num, input);
                writeln!(writer, "{}", line).map_err(|e| ManifestError::io(output, e))?;
                stats.skipped += 1;
            }
        }
    }

    writer.flush().map_err(|e| ManifestError::io(output, e))?;
    Ok(stats)
}

/// Compile a shell-style file name pattern (`*`, `?`, `[...]`).
fn pattern_matcher(pattern: &str) -> Result<GlobMatcher, ManifestError> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|source| ManifestError::Pattern {
            pattern: pattern.to_string(),
            source,
        })
}

/// Find the manifest files directly under `dir` matching `pattern`, sorted.
pub fn discover_manifests(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, ManifestError> {
    let matcher = pattern_matcher(pattern)?;
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_str().map_or(false, |name| matcher.is_match(name)))
        .map(|e| e.path().to_path_buf())
        .collect();
    paths.sort();
    Ok(paths)
}

/// Rewrite every manifest under `input_dir` into `output_dir`, keeping file names.
///
/// A file that fails is logged and reported in `failed`; the others are
/// still processed.
pub fn update_manifests(
    input_dir: &Path,
    output_dir: &Path,
    pattern: &str,
    num_rows: Option<usize>,
) -> Result<UpdateReport, ManifestError> {
    std::fs::create_dir_all(output_dir).map_err(|e| ManifestError::io(output_dir, e))?;

    let files = discover_manifests(input_dir, pattern)?;
    if files.is_empty() {
        return Err(ManifestError::NoManifests {
            dir: input_dir.to_path_buf(),
            pattern: pattern.to_string(),
        });
    }
    info!("Found {} manifest files to process", files.len());

    let mut report = UpdateReport::default();
    for input in files {
        let Some(name) = input.file_name() else {
            continue;
        };
        let output = output_dir.join(name);
        info!("Processing {:?}...", name);
        match process_manifest_file(&input, &output, num_rows) {
            Ok(stats) => {
                info!("  Processed: {}, Skipped: {}", stats.processed, stats.skipped);
                report.files.push((input, stats));
            }
            Err(e) => {
                warn!("Error processing {:?}: {}", input, e);
                report.failed.push(input);
            }
        }
    }
    Ok(report)
}
