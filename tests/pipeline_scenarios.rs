use std::sync::{Arc, OnceLock};

use chrono::{Duration, TimeZone, Utc};

use xmins::appearance::{Appearance, MatchContext, PeriodKey, PlayerHistory, PlayerProfile, Position};
use xmins::combiner::SquadPriors;
use xmins::config::PipelineConfig;
use xmins::error::{Stage, XMinsError};
use xmins::fake_league::{self, LeagueSpec};
use xmins::features::FeatureSchema;
use xmins::pipeline::{ModelBundle, ModelHandle, PredictionRequest};
use xmins::{PredictionSource, training};

const SEASON: &str = "2024-25";

fn league() -> Vec<PlayerHistory> {
    fake_league::generate(&LeagueSpec {
        with_stats: false,
        ..LeagueSpec::default()
    })
}

fn trained() -> &'static ModelBundle {
    static BUNDLE: OnceLock<ModelBundle> = OnceLock::new();
    BUNDLE.get_or_init(|| {
        let (bundle, _) = training::train(&league(), &PipelineConfig::default()).unwrap();
        bundle
    })
}

fn profile(id: &str, position: &str) -> PlayerProfile {
    PlayerProfile {
        player_id: id.to_string(),
        name: None,
        position: position.to_string(),
        team: "ALPHA".to_string(),
        price: 6.0,
    }
}

fn kickoff(period: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 8, 17, 14, 0, 0).unwrap() + Duration::days(7 * (period as i64 - 1))
}

fn weekly(minutes: &[(bool, u16)]) -> Vec<Appearance> {
    minutes
        .iter()
        .enumerate()
        .map(|(i, (started, mins))| {
            let period = i as u32 + 1;
            let mut a = Appearance::new(SEASON, period, *started, *mins);
            a.kickoff = Some(kickoff(period));
            a.is_home = Some(period % 2 == 0);
            a
        })
        .collect()
}

fn request(id: &str, position: &str, history: Vec<Appearance>) -> PredictionRequest {
    let period = history.len() as u32 + 1;
    PredictionRequest {
        target: PeriodKey::new(SEASON, period),
        profile: profile(id, position),
        history,
        context: MatchContext {
            kickoff: Some(kickoff(period)),
            is_home: Some(true),
            ..MatchContext::default()
        },
    }
}

#[test]
fn nailed_starter_is_role_locked_and_near_ninety() {
    let mut req = request("nailed", "DEF", weekly(&[(true, 90); 8]));
    req.profile.price = 8.0;
    let result = trained().predict(&req).unwrap();

    assert!(result.flags.role_lock);
    assert!(!result.flags.sparse_data);
    assert_eq!(result.source, PredictionSource::Model);
    assert!(result.xmins > 78.0, "xmins {}", result.xmins);
    assert!(result.xmins_start >= 85.0, "xmins_start {}", result.xmins_start);
    assert!(result.p90 > 0.7, "p90 {}", result.p90);
    assert!(result.full_match_prob_model.is_some());
    assert_eq!(result.schema_fingerprint.as_deref(), Some(trained().fingerprint()));
}

#[test]
fn empty_history_uses_position_prior() {
    let mut req = request("debut", "MID", Vec::new());
    req.profile.team = "PROMOTED".to_string();
    let result = trained().predict(&req).unwrap();

    assert_eq!(result.source, PredictionSource::Prior);
    assert!(result.flags.sparse_data);
    assert!(result.flags.prior_used);
    assert!((result.start_prob - 0.6).abs() < 1e-12);
    assert!((result.xmins_start - 75.0).abs() < 1e-12);
    assert!((result.xmins - 45.0).abs() < 1e-9);
    assert_eq!(result.full_match_prob_model, None);
}

#[test]
fn empty_history_on_a_known_squad_uses_teammates() {
    let req = request("academy", "MID", Vec::new());
    let result = trained().predict(&req).unwrap();
    let expected = SquadPriors::from_histories(&league(), 10)
        .lookup("ALPHA", Some(Position::Midfielder))
        .unwrap();

    assert_eq!(result.source, PredictionSource::Prior);
    assert!(result.flags.prior_used);
    assert!((result.start_prob - expected.start_prob).abs() < 1e-12);
    assert!((result.xmins_start - expected.minutes_if_start).abs() < 1e-9);
    // Team ALPHA's midfielder in the synthetic league is a nailed starter.
    assert!(result.start_prob > 0.85, "start_prob {}", result.start_prob);

    let mut cfg = PipelineConfig::default();
    cfg.combiner.team_prior = false;
    let bundle = ModelBundle::from_parts(
        cfg,
        trained().schema().clone(),
        trained().start_model().clone(),
        trained().minutes_model().clone(),
        None,
    )
    .unwrap()
    .with_squad_priors(trained().squad_priors().clone());
    let fallback = bundle.predict(&req).unwrap();
    assert!((fallback.start_prob - 0.6).abs() < 1e-12);
}

#[test]
fn red_card_flags_without_breaking_role_lock() {
    let mut history = weekly(&[(true, 90), (true, 90), (true, 90), (true, 90), (true, 90), (true, 23)]);
    history[5].red_card = true;
    let req = request("sent-off", "MID", history);
    let result = trained().predict(&req).unwrap();

    assert!(result.flags.role_lock);
    assert!(result.flags.recent_outlier);
    assert_eq!(result.usable_history, 5);
    assert!(!result.flags.sparse_data);
}

#[test]
fn short_history_is_sparse_but_model_backed() {
    let req = request("newcomer", "FWD", weekly(&[(true, 70), (false, 15)]));
    let result = trained().predict(&req).unwrap();
    assert_eq!(result.source, PredictionSource::Model);
    assert!(result.flags.sparse_data);
    assert!((0.0..=90.0).contains(&result.xmins));
    assert!(result.uncertainty_lower >= 0.0 && result.uncertainty_upper <= 90.0);
}

#[test]
fn history_at_or_after_target_is_ignored() {
    let history = weekly(&[(true, 90), (true, 90), (true, 90), (false, 0), (false, 0), (false, 0)]);
    let mut req = request("leak", "MID", history.clone());
    req.target = PeriodKey::new(SEASON, 4);
    let with_future = trained().predict(&req).unwrap();

    req.history = history[..3].to_vec();
    let without_future = trained().predict(&req).unwrap();
    assert_eq!(with_future.xmins, without_future.xmins);
    assert_eq!(with_future.start_prob, without_future.start_prob);
}

#[test]
fn batch_skips_failures_and_keeps_order() {
    let good_a = request("a", "DEF", weekly(&[(true, 90); 6]));
    let mut bad = request("b", "MID", weekly(&[(true, 60); 6]));
    bad.target.period = 0;
    let good_c = request("c", "FWD", weekly(&[(false, 10); 6]));

    let results = trained().batch_predict(&[good_a, bad, good_c]);
    let ids: Vec<&str> = results.iter().map(|r| r.player_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "c"]);
}

#[test]
fn reordered_schema_is_rejected_at_assembly() {
    let bundle = trained();
    let mut names = bundle.schema().names.clone();
    names.swap(0, 1);
    let swapped = FeatureSchema::from_names(bundle.schema().version, names).unwrap();
    let err = ModelBundle::from_parts(
        bundle.config().clone(),
        swapped,
        bundle.start_model().clone(),
        bundle.minutes_model().clone(),
        None,
    )
    .unwrap_err();
    assert!(matches!(err, XMinsError::SchemaMismatch(_)));
}

#[test]
fn handle_without_model_reports_not_trained() {
    let handle = ModelHandle::new();
    let req = request("x", "MID", Vec::new());
    assert_eq!(
        handle.predict(&req).unwrap_err(),
        XMinsError::NotTrained(Stage::Pipeline)
    );
}

#[test]
fn failed_retrain_keeps_published_bundle() {
    let handle = ModelHandle::with_bundle(trained().clone());
    let before = handle.snapshot().unwrap();

    // 10 players x 7 weeks with three weeks of warm-up history = 40 samples.
    let tiny: Vec<PlayerHistory> = (0..10)
        .map(|i| PlayerHistory {
            profile: profile(&format!("t{i}"), "MID"),
            appearances: weekly(&[(true, 90), (false, 0), (true, 75), (true, 90), (false, 5), (true, 60), (true, 88)]),
        })
        .collect();
    let mut cfg = PipelineConfig::default();
    cfg.training.holdout_fraction = 0.0;

    let err = handle.retrain(&tiny, &cfg).unwrap_err();
    assert_eq!(
        err,
        XMinsError::InsufficientData {
            stage: Stage::Start,
            got: 40,
            need: 50
        }
    );
    let after = handle.snapshot().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
}

#[test]
fn only_one_training_run_at_a_time() {
    let handle = ModelHandle::new();
    let guard = handle.try_begin_training().unwrap();
    let err = handle.retrain(&league(), &PipelineConfig::default()).unwrap_err();
    assert_eq!(err, XMinsError::TrainingInProgress);
    drop(guard);
    assert!(handle.try_begin_training().is_ok());
}

#[test]
fn in_flight_snapshot_survives_publish() {
    let handle = ModelHandle::with_bundle(trained().clone());
    let held = handle.snapshot().unwrap();
    let republished = handle.publish(trained().clone());
    assert!(!Arc::ptr_eq(&held, &republished));

    let req = request("steady", "GK", weekly(&[(true, 90); 5]));
    let a = held.predict(&req).unwrap();
    let b = handle.predict(&req).unwrap();
    assert_eq!(a.xmins, b.xmins);
}

#[test]
fn training_report_scores_holdout_against_true_minutes() {
    let (_, report) = training::train(&league(), &PipelineConfig::default()).unwrap();
    assert!(report.holdout_samples > 0);
    assert_eq!(report.holdout.combined.samples, report.holdout_samples);
    assert_eq!(report.holdout.combined.within.len(), 4);
    let rates: Vec<f64> = report.holdout.combined.within.iter().map(|t| t.rate).collect();
    assert!(rates.windows(2).all(|w| w[0] <= w[1]));
    assert!(report.start.out_of_fold_calibrated.auc > 0.7);
    assert_eq!(report.schema_fingerprint, PipelineConfig::default().schema().fingerprint());
}
