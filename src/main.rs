use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::info;

use xmins::artifact::load_artifact;
use xmins::config::default_model_path;
use xmins::{ModelHandle, PredictionRequest};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    xmins::init_tracing();

    let requests_path = parse_path_arg("--requests")
        .or_else(first_positional)
        .ok_or_else(|| anyhow!("usage: xmins --requests <file.json> [--model <artifact>] [--out <file>] [--pretty]"))?;
    let model_path = parse_path_arg("--model")
        .or_else(default_model_path)
        .context("unable to resolve model artifact path")?;

    let bundle = load_artifact(&model_path)?;
    let handle = ModelHandle::with_bundle(bundle);

    let raw = fs::read_to_string(&requests_path)
        .with_context(|| format!("read requests {}", requests_path.display()))?;
    let requests: Vec<PredictionRequest> = serde_json::from_str(&raw)
        .with_context(|| format!("parse requests {}", requests_path.display()))?;

    let results = handle.batch_predict(&requests)?;
    info!(
        requested = requests.len(),
        predicted = results.len(),
        "batch prediction finished"
    );

    let json = if has_flag("--pretty") {
        serde_json::to_string_pretty(&results)
    } else {
        serde_json::to_string(&results)
    }
    .context("serialize predictions")?;

    match parse_path_arg("--out") {
        Some(out) => {
            fs::write(&out, json).with_context(|| format!("write {}", out.display()))?;
            info!(path = %out.display(), "predictions written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn parse_path_arg(name: &str) -> Option<PathBuf> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(v) = arg.strip_prefix(&format!("{name}="))
            && !v.trim().is_empty()
        {
            return Some(PathBuf::from(v.trim()));
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(PathBuf::from(next));
        }
    }
    None
}

fn first_positional() -> Option<PathBuf> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let mut skip_next = false;
    for arg in &args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg.starts_with("--") {
            skip_next = !arg.contains('=') && arg != "--pretty";
            continue;
        }
        return Some(PathBuf::from(arg));
    }
    None
}

fn has_flag(name: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == name)
}
