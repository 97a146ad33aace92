use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::info;

use xmins::artifact::save_artifact;
use xmins::config::{PipelineConfig, default_db_path, default_model_path};
use xmins::fake_league::{self, LeagueSpec};
use xmins::{store, training};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    xmins::init_tracing();

    let cfg = PipelineConfig::from_env()?;
    let out_path = parse_path_arg("--out")
        .or_else(default_model_path)
        .context("unable to resolve artifact output path")?;

    let histories = if has_flag("--demo") {
        let spec = LeagueSpec {
            players: parse_usize_arg("--players").unwrap_or(LeagueSpec::default().players),
            seed: cfg.training.seed,
            ..LeagueSpec::default()
        };
        info!(players = spec.players, seed = spec.seed, "generating synthetic league");
        fake_league::generate(&spec)
    } else {
        let db_path = parse_path_arg("--db")
            .or_else(default_db_path)
            .context("unable to resolve sqlite path")?;
        let conn = store::open_db(&db_path)?;
        store::load_all_histories(&conn)?
    };
    if histories.is_empty() {
        return Err(anyhow!("no player histories to train on"));
    }

    let (bundle, report) = training::train(&histories, &cfg)?;
    save_artifact(&out_path, &bundle)?;

    println!("xMins model trained");
    println!("Artifact: {}", out_path.display());
    println!("Schema: {} features ({})", bundle.schema().len(), bundle.fingerprint());
    println!(
        "Samples: {} train / {} holdout ({} outlier targets left out of minutes stage)",
        report.train_samples, report.holdout_samples, report.excluded_outlier_targets
    );
    println!(
        "Start stage: oof auc={:.3} cv_auc={:.3}±{:.3} ece={:.3}",
        report.start.out_of_fold_calibrated.auc,
        report.start.cv_auc_mean,
        report.start.cv_auc_std,
        report.start.expected_calibration_error
    );
    println!(
        "Minutes stage: oof mae={:.2} rmse={:.2} full-match rate={:.2}",
        report.minutes.out_of_fold_calibrated.mae,
        report.minutes.out_of_fold_calibrated.rmse,
        report.minutes.full_match_rate
    );
    println!(
        "Holdout: start auc={:.3} combined mae={:.2}",
        report.holdout.start.auc, report.holdout.combined.mae
    );
    for t in &report.holdout.combined.within {
        println!("  within ±{:>2} min: {:.1}%", t.tolerance, t.rate * 100.0);
    }
    if has_flag("--importance") {
        for (label, ranked) in [
            ("start", bundle.start_model().feature_importance()?),
            ("minutes", bundle.minutes_model().feature_importance()?),
        ] {
            println!("Top {label} features:");
            for item in ranked.iter().take(10) {
                println!("  {:<28} {:+.4}", item.name, item.weight);
            }
        }
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

fn parse_usize_arg(name: &str) -> Option<usize> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&format!("{name}="))
            && let Ok(v) = raw.trim().parse::<usize>()
        {
            return Some(v);
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && let Ok(v) = next.trim().parse::<usize>()
        {
            return Some(v);
        }
    }
    None
}

fn has_flag(name: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == name)
}
