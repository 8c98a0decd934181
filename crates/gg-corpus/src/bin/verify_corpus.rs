#![forbid(unsafe_code)]

use gg_corpus::{CaseFailure, CaseVerification, CorpusLayout, GenerationConfig, verify_corpus};
use gg_oracle::{OnnxRuntimeOracle, resolve_oracle_python};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Serialize)]
struct VerificationSummary {
    status: &'static str,
    root: String,
    interpreter: String,
    cases: Vec<CaseVerification>,
    failures: Vec<CaseFailure>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("verify_corpus failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let config = GenerationConfig::default_paths();
    let mut root = config.output_root.clone();
    let mut python: Option<String> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--root" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--root requires a value".to_string())?;
                root = PathBuf::from(value);
            }
            "--python" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--python requires a value".to_string())?;
                python = Some(value);
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p gg-corpus --bin verify_corpus -- [--root <dir>] [--python <interpreter>]"
                );
                return Ok(());
            }
            unknown => return Err(format!("unknown argument: {unknown}")),
        }
    }

    let interpreter = resolve_oracle_python(python.as_deref());
    let scratch = std::env::temp_dir().join(format!("goldgen-oracle-{}", std::process::id()));
    let oracle =
        OnnxRuntimeOracle::new(interpreter.clone(), scratch).with_metadata(config.metadata.clone());
    let layout = CorpusLayout::new(&root, config.metadata);

    let report = verify_corpus(&layout, &oracle)?;
    let status = if report.all_passed() { "pass" } else { "fail" };
    let summary = VerificationSummary {
        status,
        root: root.display().to_string(),
        interpreter,
        cases: report.cases,
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
