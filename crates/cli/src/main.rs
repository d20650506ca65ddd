//! CLI tool for building Canary2 prompt training data.
//!
//! `encode` turns a lhotse cut manifest into prompt token ids using an
//! aggregate HuggingFace tokenizer, `update-manifests` rewrites manifest
//! language metadata, and `inspect` encodes a single ad-hoc sample.

mod tokenizer;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::{info, LevelFilter};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;

use canary_prompt_core::{
    canary2_prompt, encode_manifest, update_manifests, write_jsonl_output, Cut, FormatterConfig,
    PipelineConfig, PromptFormatter, ProtocolVersion, DEFAULT_MANIFEST_PATTERN,
    TRANSLATION_TARGET_LANG,
};

use crate::tokenizer::AggregateTokenizer;

/// Build Canary2 prompt token ids from speech manifests.
#[derive(Parser, Debug)]
#[command(name = "canary-prompt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encode every cut of a manifest into prompt token ids
    Encode(EncodeArgs),
    /// Rewrite language metadata of all manifests in a directory
    UpdateManifests(UpdateArgs),
    /// Encode one ad-hoc sample and print its token ids
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct FormatterArgs {
    /// Aggregate tokenizer config (JSON)
    #[arg(long)]
    tokenizer_config: PathBuf,

    /// Prompt protocol version (user-controls or answer-controls)
    #[arg(long, default_value_t = ProtocolVersion::default())]
    protocol: ProtocolVersion,

    /// Probability of training on the translation instead of the transcript
    #[arg(long, default_value = "0.0")]
    translation_task_prob: f64,

    /// Target language forced on translated samples
    #[arg(long, default_value = TRANSLATION_TARGET_LANG)]
    translation_target_lang: String,

    /// Take missing source/target languages from the first supervision
    #[arg(long, default_value_t = false)]
    supervision_lang_fallback: bool,
}

impl FormatterArgs {
    fn config(&self) -> FormatterConfig {
        FormatterConfig {
            version: self.protocol,
            translation_task_prob: self.translation_task_prob,
            translation_target_lang: self.translation_target_lang.clone(),
            supervision_lang_fallback: self.supervision_lang_fallback,
        }
    }

    fn formatter(&self) -> Result<PromptFormatter<AggregateTokenizer>, Box<dyn std::error::Error>> {
        println!("Loading tokenizers from {:?}...", self.tokenizer_config);
        let tokenizer = AggregateTokenizer::load(&self.tokenizer_config)?;
        Ok(PromptFormatter::new(tokenizer, self.protocol.template()?)?)
    }
}

#[derive(Args, Debug)]
struct EncodeArgs {
    /// Cut manifest (JSONL, optionally gzipped)
    #[arg(long)]
    manifest: PathBuf,

    /// Output directory for encoded.jsonl and metadata.json
    #[arg(long)]
    output_dir: PathBuf,

    #[command(flatten)]
    formatter: FormatterArgs,

    /// Seed of the per-cut random generators
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Worker threads
    #[arg(long, default_value = "8")]
    num_workers: usize,

    /// Drop cuts shorter than this many seconds
    #[arg(long)]
    min_duration: Option<f64>,

    /// Drop cuts longer than this many seconds
    #[arg(long)]
    max_duration: Option<f64>,
}

#[derive(Args, Debug)]
struct UpdateArgs {
    /// Directory containing the manifests to rewrite
    input_dir: PathBuf,

    /// Directory receiving the rewritten manifests
    output_dir: PathBuf,

    /// Glob-style file name pattern of the manifests
    #[arg(long, default_value = DEFAULT_MANIFEST_PATTERN)]
    pattern: String,

    /// Only rewrite the first N rows of each manifest
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    num_rows: Option<u64>,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[command(flatten)]
    formatter: FormatterArgs,

    #[arg(long)]
    source_lang: String,

    #[arg(long)]
    target_lang: String,

    /// Transcript text
    #[arg(long)]
    text: String,

    /// Translation of the transcript, used by the translation branch
    #[arg(long)]
    translation: Option<String>,

    #[arg(long, default_value = "")]
    decoder_context: String,

    #[arg(long)]
    emotion: Option<String>,

    #[arg(long)]
    pnc: Option<String>,

    #[arg(long)]
    itn: Option<String>,

    #[arg(long)]
    timestamp: Option<String>,

    #[arg(long)]
    diarize: Option<String>,

    #[arg(long, default_value = "42")]
    seed: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.verbose {
        // explicitly set logging to info / stdout
        env_logger::builder().filter_level(LevelFilter::Info).init();
    } else {
        // use default logging (from env vars like RUST_LOG)
        env_logger::init();
    }

    match cli.command {
        Command::Encode(args) => run_encode(args),
        Command::UpdateManifests(args) => run_update(args),
        Command::Inspect(args) => run_inspect(args),
    }
}

fn run_encode(args: EncodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let formatter = args.formatter.formatter()?;
    let config = PipelineConfig {
        num_workers: args.num_workers,
        min_duration: args.min_duration,
        max_duration: args.max_duration,
        seed: args.seed,
        formatter: args.formatter.config(),
    };

    println!("Encoding cuts from {:?}...", args.manifest);
    let result = encode_manifest(&args.manifest, &formatter, &config)?;

    let output_path = args.output_dir.join("encoded.jsonl");
    println!("Writing output to {:?}...", output_path);
    write_jsonl_output(&result.records, &output_path)?;

    let total_records = result.records.len();
    let translated = result.records.iter().filter(|r| r.translated).count();
    let total_tokens: usize = result.records.iter().map(|r| r.input_ids.len()).sum();

    let metadata_path = args.output_dir.join("metadata.json");
    let metadata = json!({
        "config": {
            "manifest": args.manifest.to_string_lossy(),
            "output_dir": args.output_dir.to_string_lossy(),
            "tokenizer_config": args.formatter.tokenizer_config.to_string_lossy(),
            "protocol": config.formatter.version.to_string(),
            "translation_task_prob": config.formatter.translation_task_prob,
            "translation_target_lang": config.formatter.translation_target_lang,
            "supervision_lang_fallback": config.formatter.supervision_lang_fallback,
            "seed": config.seed,
            "num_workers": config.num_workers,
            "min_duration": config.min_duration,
            "max_duration": config.max_duration,
        },
        "counts": {
            "encoded": total_records,
            "translated": translated,
            "filtered": result.filtered,
            "parse_failures": result.parse_failures,
            "encode_failures": result.encode_failures,
        },
        "stats": {
            "total_duration": result.total_duration,
            "total_tokens": total_tokens,
            "avg_tokens_per_cut": if total_records > 0 {
                total_tokens as f64 / total_records as f64
            } else {
                0.0
            },
        },
        "files": {
            "encoded_path": output_path.to_string_lossy(),
        },
    });
    std::fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)?;

    println!("\n[summary]");
    println!("  Encoded cuts: {}", total_records);
    println!("  Translated cuts: {}", translated);
    println!("  Filtered by duration: {}", result.filtered);
    println!("  Parse failures: {}", result.parse_failures);
    println!("  Encode failures: {}", result.encode_failures);
    println!("  Total duration: {:.1}s", result.total_duration);
    println!("  Total tokens: {}", total_tokens);
    println!("  Output: {:?}", output_path);
    println!("  Metadata: {:?}", metadata_path);

    Ok(())
}

fn run_update(args: UpdateArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "Rewriting manifests from {:?} into {:?}...",
        args.input_dir, args.output_dir
    );
    let report = update_manifests(
        &args.input_dir,
        &args.output_dir,
        &args.pattern,
        args.num_rows.map(|n| n as usize),
    )?;
    let stats = report.total();

    for (path, file_stats) in &report.files {
        println!(
            "  {:?}: processed {}, skipped {}",
            path.file_name().unwrap_or(path.as_os_str()),
            file_stats.processed,
            file_stats.skipped
        );
    }
    for path in &report.failed {
        println!("  {:?}: failed", path.file_name().unwrap_or(path.as_os_str()));
    }

    println!("\n[summary]");
    println!("  Files rewritten: {}", report.files.len());
    println!("  Files failed: {}", report.failed.len());
    println!("  Total processed: {}", stats.processed);
    println!("  Total skipped: {}", stats.skipped);
    println!("  Output: {:?}", args.output_dir);

    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let formatter = args.formatter.formatter()?;

    let mut custom = json!({
        "source_lang": args.source_lang,
        "target_lang": args.target_lang,
        "decodercontext": args.decoder_context,
    });
    for (key, value) in [
        ("emotion", &args.emotion),
        ("pnc", &args.pnc),
        ("itn", &args.itn),
        ("timestamp", &args.timestamp),
        ("diarize", &args.diarize),
    ] {
        if let Some(value) = value {
            custom[key] = json!(value);
        }
    }
    let mut supervision = json!({
        "id": "inspect-0",
        "text": args.text,
        "language": args.source_lang,
    });
    if let Some(translation) = &args.translation {
        supervision["custom"] = json!({ "translation": translation });
    }
    let cut: Cut = serde_json::from_value(json!({
        "id": "inspect",
        "type": "MonoCut",
        "duration": 0.0,
        "supervisions": [supervision],
        "custom": custom,
    }))?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let prompt = canary2_prompt(&cut, &formatter, &args.formatter.config(), &mut rng)?;
    info!("Resolved sample: {:?}", prompt.sample);

    println!("protocol:    {}", formatter.template().version);
    println!("translated:  {}", prompt.sample.translated);
    println!("context_ids: {:?}", prompt.encoded.context_ids);
    println!("answer_ids:  {:?}", prompt.encoded.answer_ids);
    println!("input_ids:   {:?}", prompt.encoded.input_ids);

    Ok(())
}
