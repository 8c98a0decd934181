#![forbid(unsafe_code)]

use gg_corpus::{CaseFailure, CorpusPlan, DatasetSlot, GenerationConfig, generate_corpus};
use gg_oracle::{OnnxRuntimeOracle, resolve_oracle_python};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Serialize)]
struct GeneratedSummary {
    case: String,
    dataset: usize,
    directory: String,
    files: usize,
}

#[derive(Debug, Serialize)]
struct GenerationSummary {
    status: &'static str,
    output_root: String,
    seed: u64,
    interpreter: String,
    case_log: Option<String>,
    case_count: usize,
    generated: Vec<GeneratedSummary>,
    failures: Vec<CaseFailure>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("generate_corpus failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut config = GenerationConfig::default_paths();
    let mut plan_path: Option<PathBuf> = None;
    let mut python: Option<String> = None;
    let mut only: Option<String> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--plan" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--plan requires a value".to_string())?;
                plan_path = Some(PathBuf::from(value));
            }
            "--out" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--out requires a value".to_string())?;
                config.output_root = PathBuf::from(value);
            }
            "--seed" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--seed requires a value".to_string())?;
                config.seed = value
                    .parse()
                    .map_err(|err| format!("invalid --seed {value}: {err}"))?;
            }
            "--dataset" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--dataset requires a value".to_string())?;
                config.dataset = DatasetSlot::parse(&value)?;
            }
            "--log-path" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--log-path requires a value".to_string())?;
                config.log_path = Some(PathBuf::from(value));
            }
            "--python" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--python requires a value".to_string())?;
                python = Some(value);
            }
            "--only" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--only requires a value".to_string())?;
                only = Some(value);
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p gg-corpus --bin generate_corpus -- [--plan <json>] [--out <dir>] [--seed <n>] [--dataset <n|next>] [--log-path <path>] [--python <interpreter>] [--only <case>]"
                );
                return Ok(());
            }
            unknown => return Err(format!("unknown argument: {unknown}")),
        }
    }

    let mut plan = match &plan_path {
        Some(path) => CorpusPlan::load(path)?,
        None => CorpusPlan::builtin(),
    };
    if let Some(name) = &only {
        plan = plan.only(name)?;
    }

    let interpreter = resolve_oracle_python(python.as_deref());
    let scratch = std::env::temp_dir().join(format!("goldgen-oracle-{}", std::process::id()));
    let oracle =
        OnnxRuntimeOracle::new(interpreter.clone(), scratch).with_metadata(config.metadata.clone());

    let report = generate_corpus(&plan, &config, &oracle, &oracle)?;
    let status = if report.all_passed() { "pass" } else { "fail" };
    let summary = GenerationSummary {
        status,
        output_root: config.output_root.display().to_string(),
        seed: config.seed,
        interpreter,
        case_log: config
            .log_path
            .as_ref()
            .map(|path| path.display().to_string()),
        case_count: report.case_count,
        generated: report
            .generated
            .iter()
            .map(|persisted| GeneratedSummary {
                case: persisted.name.clone(),
                dataset: persisted.dataset,
                directory: persisted.directory.display().to_string(),
                files: persisted.files.len(),
            })
            .collect(),
        failures: report.failures,
    };

    let summary_json = serde_json::to_string_pretty(&summary)
        .map_err(|err| format!("failed serializing summary: {err}"))?;
    println!("{summary_json}");

    if status == "fail" {
        std::process::exit(2);
    }
    Ok(())
}
