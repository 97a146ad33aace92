use std::collections::{HashMap, HashSet};

use chrono::{Datelike, Duration as ChronoDuration};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::appearance::{Appearance, MatchContext, MatchStats, PeriodKey, PlayerProfile, Position};
use crate::error::{XMinsError, XResult};
use crate::history::{DEFAULT_SHORT_START_FLOOR, FilteredHistory};

pub const SCHEMA_VERSION: u32 = 1;

const PRICE_FLOOR: f64 = 4.0;
const PRICE_SPAN: f64 = 11.0;
const MAX_DAYS_SINCE: f64 = 60.0;
const DEFAULT_OPPONENT_STRENGTH_NORM: f64 = 0.5;
const TOP_OPPONENT_STRENGTH: f64 = 4.5;
const DEFAULT_TEAM_ROTATION_RATE: f64 = 0.20;
const EARLY_SUB_MIN: u16 = 60;
const EARLY_SUB_MAX: u16 = 75;
const RESTED_MINUTES: u16 = 10;
const DEFAULT_DAYS_SINCE_START: f64 = 14.0;
const RESTED_DAYS: f64 = 7.0;
const SHORT_TURNAROUND_DAYS: f64 = 3.0;
const TREND_SPAN: usize = 5;
const TREND_FLAG_SLOPE: f64 = 5.0;
const MOMENTUM_SPAN: usize = 3;
const HOT_FORM_CONTRIBUTIONS: f64 = 2.0;
const YELLOW_SPAN: usize = 10;
const YELLOW_RISK_COUNT: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureGroup {
    Position,
    RecentForm,
    RoleLock,
    Lagged,
    Temporal,
    MatchContext,
    PhysicalLoad,
    FormSignals,
    Quality,
    Substitution,
    Rotation,
    Opponent,
    Outliers,
    RotationRisk,
    RecencyWeighted,
}

impl FeatureGroup {
    pub const ALL: [FeatureGroup; 15] = [
        FeatureGroup::Position,
        FeatureGroup::RecentForm,
        FeatureGroup::RoleLock,
        FeatureGroup::Lagged,
        FeatureGroup::Temporal,
        FeatureGroup::MatchContext,
        FeatureGroup::PhysicalLoad,
        FeatureGroup::FormSignals,
        FeatureGroup::Quality,
        FeatureGroup::Substitution,
        FeatureGroup::Rotation,
        FeatureGroup::Opponent,
        FeatureGroup::Outliers,
        FeatureGroup::RotationRisk,
        FeatureGroup::RecencyWeighted,
    ];

    pub fn label(self) -> &'static str {
        match self {
            FeatureGroup::Position => "position",
            FeatureGroup::RecentForm => "recent_form",
            FeatureGroup::RoleLock => "role_lock",
            FeatureGroup::Lagged => "lagged",
            FeatureGroup::Temporal => "temporal",
            FeatureGroup::MatchContext => "match_context",
            FeatureGroup::PhysicalLoad => "physical_load",
            FeatureGroup::FormSignals => "form_signals",
            FeatureGroup::Quality => "quality",
            FeatureGroup::Substitution => "substitution",
            FeatureGroup::Rotation => "rotation",
            FeatureGroup::Opponent => "opponent",
            FeatureGroup::Outliers => "outliers",
            FeatureGroup::RotationRisk => "rotation_risk",
            FeatureGroup::RecencyWeighted => "recency_weighted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let needle = raw.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|g| g.label() == needle)
    }

    fn feature_names(self, windows: &[usize]) -> Vec<String> {
        let fixed: &[&str] = match self {
            FeatureGroup::Position => &["pos_GK", "pos_DEF", "pos_MID", "pos_FWD"],
            FeatureGroup::RecentForm => {
                let mut out = Vec::with_capacity(windows.len() * 4);
                for w in windows {
                    out.push(format!("avg_minutes_last_{w}"));
                    out.push(format!("start_rate_last_{w}"));
                    out.push(format!("consistency_last_{w}"));
                    out.push(format!("trend_last_{w}"));
                }
                return out;
            }
            FeatureGroup::RoleLock => &["role_lock", "consecutive_85plus"],
            FeatureGroup::Lagged => &["prev_gw_minutes", "prev_gw_started"],
            FeatureGroup::Temporal => &["gameweek_norm", "month_norm"],
            FeatureGroup::MatchContext => &["is_home", "congestion_flag", "intl_window_flag"],
            FeatureGroup::PhysicalLoad => &[
                "days_since_last_game",
                "minutes_last_7_days",
                "games_last_2_gw",
            ],
            FeatureGroup::FormSignals => &[
                "goals_last_5",
                "assists_last_5",
                "xG_last_5",
                "xA_last_5",
                "goal_involvement_last_5",
                "xGI_last_5",
            ],
            FeatureGroup::Quality => &[
                "price_norm",
                "ict_last_5",
                "influence_last_5",
                "creativity_last_5",
                "threat_last_5",
                "bonus_last_5",
            ],
            FeatureGroup::Substitution => &["early_sub_rate_last_5", "full_90_rate_last_5"],
            FeatureGroup::Rotation => &[
                "start_volatility_5gw",
                "rested_last_gw",
                "consecutive_starts",
            ],
            FeatureGroup::Opponent => &[
                "opponent_strength_norm",
                "is_top6_opponent",
                "team_rotation_rate",
            ],
            FeatureGroup::Outliers => &["is_red_card", "is_early_injury_sub"],
            FeatureGroup::RotationRisk => &[
                "days_since_last_start",
                "rested_7plus_days",
                "played_within_3_days",
                "minutes_increasing",
                "minutes_decreasing",
                "goal_contributions_last_3",
                "hot_form",
                "yellows_last_10",
                "yellow_card_risk",
            ],
            FeatureGroup::RecencyWeighted => &["weighted_avg_minutes"],
        };
        fixed.iter().map(|s| s.to_string()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(default = "default_windows")]
    pub windows: Vec<usize>,
    #[serde(default = "default_groups")]
    pub groups: Vec<FeatureGroup>,
    #[serde(default = "default_high_minutes")]
    pub high_minutes_threshold: u16,
    #[serde(default = "default_role_lock_run")]
    pub role_lock_run: u32,
    #[serde(default = "default_short_start_floor")]
    pub short_start_floor: u16,
    #[serde(default = "default_season_length")]
    pub season_length: u32,
    #[serde(default = "default_well_rested_days")]
    pub well_rested_days: f64,
    #[serde(default = "default_load_window_days")]
    pub load_window_days: i64,
    #[serde(default = "default_form_window")]
    pub form_window: usize,
    /// Per-start decay of `weighted_avg_minutes`, newest start weighted 1.
    #[serde(default = "default_recency_alpha")]
    pub recency_alpha: f64,
    #[serde(default = "default_recency_window")]
    pub recency_window: usize,
    /// Compute form windows and role lock on the outlier-free view.
    #[serde(default = "default_true")]
    pub clean_form: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            windows: default_windows(),
            groups: default_groups(),
            high_minutes_threshold: default_high_minutes(),
            role_lock_run: default_role_lock_run(),
            short_start_floor: default_short_start_floor(),
            season_length: default_season_length(),
            well_rested_days: default_well_rested_days(),
            load_window_days: default_load_window_days(),
            form_window: default_form_window(),
            recency_alpha: default_recency_alpha(),
            recency_window: default_recency_window(),
            clean_form: true,
        }
    }
}

impl FeatureConfig {
    pub fn normalized_windows(&self) -> Vec<usize> {
        let mut seen = HashSet::new();
        self.windows
            .iter()
            .copied()
            .filter(|w| *w > 0 && seen.insert(*w))
            .collect()
    }

    fn normalized_groups(&self) -> Vec<FeatureGroup> {
        let mut seen = HashSet::new();
        self.groups
            .iter()
            .copied()
            .filter(|g| seen.insert(*g))
            .collect()
    }
}

fn default_windows() -> Vec<usize> {
    vec![3, 5, 8]
}

fn default_groups() -> Vec<FeatureGroup> {
    FeatureGroup::ALL.to_vec()
}

fn default_high_minutes() -> u16 {
    85
}

fn default_role_lock_run() -> u32 {
    3
}

fn default_short_start_floor() -> u16 {
    DEFAULT_SHORT_START_FLOOR
}

fn default_season_length() -> u32 {
    38
}

fn default_well_rested_days() -> f64 {
    7.0
}

fn default_load_window_days() -> i64 {
    7
}

fn default_form_window() -> usize {
    5
}

fn default_recency_alpha() -> f64 {
    0.8
}

fn default_recency_window() -> usize {
    8
}

fn default_true() -> bool {
    true
}

/// Ordered, versioned list of feature names. Training and inference must
/// agree on it exactly; the fingerprint travels with every fitted model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub names: Vec<String>,
}

impl FeatureSchema {
    pub fn from_config(cfg: &FeatureConfig) -> Self {
        let windows = cfg.normalized_windows();
        let names = cfg
            .normalized_groups()
            .into_iter()
            .flat_map(|g| g.feature_names(&windows))
            .collect();
        Self {
            version: SCHEMA_VERSION,
            names,
        }
    }

    pub fn from_names<I, S>(version: u32, names: I) -> XResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(XMinsError::InvalidInput("feature schema has no names".into()));
        }
        let mut seen = HashSet::new();
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(XMinsError::InvalidInput(format!(
                    "feature schema lists `{name}` twice"
                )));
            }
        }
        Ok(Self { version, names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        for name in &self.names {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn validate(&self, vector: &FeatureVector) -> XResult<()> {
        check_names(&self.names, vector.names())
    }
}

pub fn check_names(expected: &[String], actual: &[String]) -> XResult<()> {
    if expected == actual {
        return Ok(());
    }
    if expected.len() != actual.len() {
        return Err(XMinsError::SchemaMismatch(format!(
            "expected {} features, got {}",
            expected.len(),
            actual.len()
        )));
    }
    let idx = expected
        .iter()
        .zip(actual)
        .position(|(e, a)| e != a)
        .unwrap_or(0);
    Err(XMinsError::SchemaMismatch(format!(
        "column {idx}: expected `{}`, got `{}`",
        expected[idx], actual[idx]
    )))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    names: Vec<String>,
    values: Vec<f64>,
}

impl FeatureVector {
    pub fn new(names: Vec<String>, values: Vec<f64>) -> XResult<Self> {
        if names.len() != values.len() {
            return Err(XMinsError::InvalidInput(format!(
                "{} feature names but {} values",
                names.len(),
                values.len()
            )));
        }
        let vector = Self { names, values };
        vector.check_finite()?;
        Ok(vector)
    }

    pub fn check_finite(&self) -> XResult<()> {
        match self.values.iter().position(|v| !v.is_finite()) {
            None => Ok(()),
            Some(idx) => Err(XMinsError::InvalidInput(format!(
                "feature `{}` is {}",
                self.names[idx], self.values[idx]
            ))),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| self.values[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }
}

/// Row-major design matrix. Every vector must carry the same names in the
/// same order as the first one.
pub fn stack_vectors(vectors: &[FeatureVector]) -> XResult<(Vec<String>, Vec<Vec<f64>>)> {
    let Some(first) = vectors.first() else {
        return Ok((Vec::new(), Vec::new()));
    };
    let names = first.names.clone();
    let mut rows = Vec::with_capacity(vectors.len());
    for v in vectors {
        check_names(&names, &v.names)?;
        v.check_finite()?;
        rows.push(v.values.clone());
    }
    Ok((names, rows))
}

#[derive(Debug, Clone)]
pub struct DerivedFeatures {
    pub vector: FeatureVector,
    pub role_lock: bool,
    pub consecutive_high_minute_starts: u32,
    pub recent_outlier: bool,
    pub usable_history: usize,
    pub history_len: usize,
    /// Schema names this deriver does not know; they were filled with 0.
    pub missing: Vec<String>,
}

impl DerivedFeatures {
    pub fn computed_count(&self) -> usize {
        self.vector.len() - self.missing.len()
    }
}

pub struct FeatureDeriver<'c> {
    cfg: &'c FeatureConfig,
}

impl<'c> FeatureDeriver<'c> {
    pub fn new(cfg: &'c FeatureConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &FeatureConfig {
        self.cfg
    }

    pub fn filter<'a>(&self, appearances: &'a [Appearance], target: &PeriodKey) -> FilteredHistory<'a> {
        FilteredHistory::build(appearances, target, self.cfg.short_start_floor)
    }

    pub fn derive_from_history(
        &self,
        schema: &FeatureSchema,
        appearances: &[Appearance],
        profile: &PlayerProfile,
        ctx: &MatchContext,
        target: &PeriodKey,
    ) -> DerivedFeatures {
        let history = self.filter(appearances, target);
        self.derive(schema, &history, profile, ctx, target)
    }

    pub fn derive(
        &self,
        schema: &FeatureSchema,
        history: &FilteredHistory<'_>,
        profile: &PlayerProfile,
        ctx: &MatchContext,
        target: &PeriodKey,
    ) -> DerivedFeatures {
        let cfg = self.cfg;
        let mut out: HashMap<String, f64> = HashMap::with_capacity(96);

        let form_view = if cfg.clean_form {
            history.clean()
        } else {
            history.raw()
        };

        put_position(&mut out, profile.position());

        for w in cfg.normalized_windows() {
            let stats = window_stats(tail(form_view, w));
            out.insert(format!("avg_minutes_last_{w}"), stats.avg_minutes);
            out.insert(format!("start_rate_last_{w}"), stats.start_rate);
            out.insert(format!("consistency_last_{w}"), stats.consistency);
            out.insert(format!("trend_last_{w}"), stats.trend);
        }

        let run = consecutive_high_minute_starts(form_view, cfg.high_minutes_threshold);
        let role_lock = run >= cfg.role_lock_run;
        put(&mut out, "role_lock", flag(role_lock));
        put(&mut out, "consecutive_85plus", run as f64);

        let last = history.last_raw();
        put(&mut out, "prev_gw_minutes", last.map(|a| a.minutes as f64).unwrap_or(0.0));
        put(&mut out, "prev_gw_started", flag(last.is_some_and(|a| a.started)));

        let season_len = cfg.season_length.max(1) as f64;
        put(&mut out, "gameweek_norm", (target.period as f64 / season_len).clamp(0.0, 1.0));
        put(
            &mut out,
            "month_norm",
            ctx.kickoff.map(|k| (k.month0() as f64) / 11.0).unwrap_or(0.0),
        );

        put(&mut out, "is_home", flag(ctx.is_home.unwrap_or(false)));
        put(&mut out, "congestion_flag", flag(ctx.congestion.unwrap_or(false)));
        put(&mut out, "intl_window_flag", flag(ctx.international_break.unwrap_or(false)));

        put(&mut out, "days_since_last_game", days_since_last(history, ctx, cfg.well_rested_days));
        put(
            &mut out,
            "minutes_last_7_days",
            minutes_in_trailing_days(history, ctx, cfg.load_window_days),
        );
        put(&mut out, "games_last_2_gw", games_in_last_periods(history, target, 2) as f64);

        let recent = history.recent_raw(cfg.form_window.max(1));
        put_form_signals(&mut out, recent);
        put_quality(&mut out, recent, profile.price);
        put_substitution(&mut out, recent, cfg.high_minutes_threshold);
        put_rotation(&mut out, recent);
        put_opponent(&mut out, ctx);
        put_rotation_risk(&mut out, history, ctx);
        put(
            &mut out,
            "weighted_avg_minutes",
            recency_weighted_minutes(form_view, cfg.recency_alpha, cfg.recency_window),
        );

        let floor = history.short_start_floor();
        put(&mut out, "is_red_card", flag(last.is_some_and(|a| a.red_card)));
        put(
            &mut out,
            "is_early_injury_sub",
            flag(last.is_some_and(|a| a.early_exit || (a.is_short_start(floor) && a.minutes > 0))),
        );
        let recent_outlier = last.is_some_and(|a| a.is_outlier_event(floor));

        let mut values = Vec::with_capacity(schema.len());
        let mut missing = Vec::new();
        for name in &schema.names {
            match out.get(name) {
                Some(v) if v.is_finite() => values.push(*v),
                Some(_) => values.push(0.0),
                None => {
                    values.push(0.0);
                    missing.push(name.clone());
                }
            }
        }

        DerivedFeatures {
            vector: FeatureVector {
                names: schema.names.clone(),
                values,
            },
            role_lock,
            consecutive_high_minute_starts: run,
            recent_outlier,
            usable_history: history.usable_len(),
            history_len: history.raw().len(),
            missing,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowStats {
    pub avg_minutes: f64,
    pub start_rate: f64,
    pub consistency: f64,
    pub trend: f64,
}

/// Form statistics over one window, oldest first. Consistency and trend are
/// 0 below two samples.
pub fn window_stats(window: &[&Appearance]) -> WindowStats {
    if window.is_empty() {
        return WindowStats::default();
    }
    let minutes: Vec<f64> = window.iter().map(|a| a.minutes as f64).collect();
    let starts = window.iter().filter(|a| a.started).count() as f64;
    WindowStats {
        avg_minutes: mean(&minutes),
        start_rate: starts / window.len() as f64,
        consistency: sample_std(&minutes),
        trend: ols_slope(&minutes),
    }
}

pub fn consecutive_high_minute_starts(history: &[&Appearance], threshold: u16) -> u32 {
    history
        .iter()
        .rev()
        .take_while(|a| a.started && a.minutes >= threshold)
        .count() as u32
}

pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

pub fn sample_std(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let ss: f64 = xs.iter().map(|x| (x - m).powi(2)).sum();
    (ss / (xs.len() - 1) as f64).sqrt()
}

pub fn ols_slope(ys: &[f64]) -> f64 {
    let n = ys.len();
    if n < 2 {
        return 0.0;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = mean(ys);
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in ys.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    if den <= 0.0 { 0.0 } else { num / den }
}

fn tail<'s, 'a>(items: &'s [&'a Appearance], n: usize) -> &'s [&'a Appearance] {
    &items[items.len().saturating_sub(n)..]
}

fn put(out: &mut HashMap<String, f64>, name: &str, value: f64) {
    out.insert(name.to_string(), value);
}

fn flag(v: bool) -> f64 {
    if v { 1.0 } else { 0.0 }
}

fn put_position(out: &mut HashMap<String, f64>, position: Option<Position>) {
    for p in Position::ALL {
        put(out, &format!("pos_{}", p.code()), flag(position == Some(p)));
    }
}

fn days_since_last(history: &FilteredHistory<'_>, ctx: &MatchContext, default_days: f64) -> f64 {
    let Some(last) = history.last_raw() else {
        return default_days;
    };
    match (ctx.kickoff, last.kickoff) {
        (Some(now), Some(then)) if now > then => {
            let hours = (now - then).num_minutes() as f64 / 60.0;
            (hours / 24.0).clamp(0.0, MAX_DAYS_SINCE)
        }
        _ => default_days,
    }
}

fn minutes_in_trailing_days(history: &FilteredHistory<'_>, ctx: &MatchContext, days: i64) -> f64 {
    let Some(now) = ctx.kickoff else {
        return history.last_raw().map(|a| a.minutes as f64).unwrap_or(0.0);
    };
    let since = now - ChronoDuration::days(days.max(1));
    history
        .raw()
        .iter()
        .filter(|a| a.kickoff.is_some_and(|k| k >= since && k < now))
        .map(|a| a.minutes as f64)
        .sum()
}

fn games_in_last_periods(history: &FilteredHistory<'_>, target: &PeriodKey, periods: u32) -> usize {
    let from = target.period.saturating_sub(periods);
    history
        .raw()
        .iter()
        .filter(|a| a.season == target.season && a.period >= from && a.minutes > 0)
        .count()
}

fn stats_of<'a>(recent: &[&'a Appearance]) -> Vec<&'a MatchStats> {
    recent.iter().filter_map(|a| a.stats.as_ref()).collect()
}

fn put_form_signals(out: &mut HashMap<String, f64>, recent: &[&Appearance]) {
    let stats = stats_of(recent);
    let goals: f64 = stats.iter().map(|s| s.goals).sum();
    let assists: f64 = stats.iter().map(|s| s.assists).sum();
    let xg: f64 = stats.iter().map(|s| s.expected_goals).sum();
    let xa: f64 = stats.iter().map(|s| s.expected_assists).sum();
    put(out, "goals_last_5", goals);
    put(out, "assists_last_5", assists);
    put(out, "xG_last_5", xg);
    put(out, "xA_last_5", xa);
    put(out, "goal_involvement_last_5", goals + assists);
    put(out, "xGI_last_5", xg + xa);
}

fn put_quality(out: &mut HashMap<String, f64>, recent: &[&Appearance], price: f64) {
    let price_norm = if price.is_finite() && price > 0.0 {
        ((price - PRICE_FLOOR) / PRICE_SPAN).clamp(0.0, 1.0)
    } else {
        0.0
    };
    put(out, "price_norm", price_norm);

    let stats = stats_of(recent);
    let avg = |f: fn(&MatchStats) -> f64| -> f64 {
        let xs: Vec<f64> = stats.iter().map(|s| f(s)).collect();
        mean(&xs)
    };
    put(out, "ict_last_5", avg(|s| s.ict_index));
    put(out, "influence_last_5", avg(|s| s.influence));
    put(out, "creativity_last_5", avg(|s| s.creativity));
    put(out, "threat_last_5", avg(|s| s.threat));
    put(out, "bonus_last_5", stats.iter().map(|s| s.bonus).sum());
}

fn put_substitution(out: &mut HashMap<String, f64>, recent: &[&Appearance], high_minutes: u16) {
    if recent.is_empty() {
        put(out, "early_sub_rate_last_5", 0.0);
        put(out, "full_90_rate_last_5", 0.0);
        return;
    }
    let n = recent.len() as f64;
    let early = recent
        .iter()
        .filter(|a| a.started && (EARLY_SUB_MIN..=EARLY_SUB_MAX).contains(&a.minutes))
        .count() as f64;
    let full = recent
        .iter()
        .filter(|a| a.started && a.minutes >= high_minutes)
        .count() as f64;
    put(out, "early_sub_rate_last_5", early / n);
    put(out, "full_90_rate_last_5", full / n);
}

fn put_rotation(out: &mut HashMap<String, f64>, recent: &[&Appearance]) {
    let started: Vec<f64> = recent.iter().map(|a| flag(a.started)).collect();
    put(out, "start_volatility_5gw", sample_std(&started));

    let last = recent.last();
    put(
        out,
        "rested_last_gw",
        flag(last.is_some_and(|a| !a.started && a.minutes < RESTED_MINUTES)),
    );

    let last_two = &recent[recent.len().saturating_sub(2)..];
    put(
        out,
        "consecutive_starts",
        flag(last_two.len() == 2 && last_two.iter().all(|a| a.started)),
    );
}

fn put_opponent(out: &mut HashMap<String, f64>, ctx: &MatchContext) {
    let strength = ctx.opponent_strength.filter(|s| s.is_finite());
    put(
        out,
        "opponent_strength_norm",
        strength
            .map(|s| ((s - 2.0) / 3.0).clamp(0.0, 1.0))
            .unwrap_or(DEFAULT_OPPONENT_STRENGTH_NORM),
    );
    put(
        out,
        "is_top6_opponent",
        flag(strength.is_some_and(|s| s >= TOP_OPPONENT_STRENGTH)),
    );
    put(
        out,
        "team_rotation_rate",
        ctx.team_rotation_rate
            .filter(|r| r.is_finite())
            .map(|r| r.clamp(0.0, 1.0))
            .unwrap_or(DEFAULT_TEAM_ROTATION_RATE),
    );
}

fn days_since_last_start(history: &FilteredHistory<'_>, ctx: &MatchContext) -> f64 {
    let last_start = history.raw().iter().rev().find(|a| a.started);
    match (ctx.kickoff, last_start.and_then(|a| a.kickoff)) {
        (Some(now), Some(then)) if now > then => {
            let hours = (now - then).num_minutes() as f64 / 60.0;
            (hours / 24.0).clamp(0.0, MAX_DAYS_SINCE)
        }
        _ => DEFAULT_DAYS_SINCE_START,
    }
}

fn put_rotation_risk(out: &mut HashMap<String, f64>, history: &FilteredHistory<'_>, ctx: &MatchContext) {
    let days = days_since_last_start(history, ctx);
    put(out, "days_since_last_start", days);
    put(out, "rested_7plus_days", flag(days >= RESTED_DAYS));
    put(out, "played_within_3_days", flag(days <= SHORT_TURNAROUND_DAYS));

    let minutes: Vec<f64> = history
        .recent_raw(TREND_SPAN)
        .iter()
        .map(|a| a.minutes as f64)
        .collect();
    let slope = ols_slope(&minutes);
    put(out, "minutes_increasing", flag(slope > TREND_FLAG_SLOPE));
    put(out, "minutes_decreasing", flag(slope < -TREND_FLAG_SLOPE));

    let contributions: f64 = stats_of(history.recent_raw(MOMENTUM_SPAN))
        .iter()
        .map(|s| s.goals + s.assists)
        .sum();
    put(out, "goal_contributions_last_3", contributions);
    put(out, "hot_form", flag(contributions >= HOT_FORM_CONTRIBUTIONS));

    let yellows: f64 = stats_of(history.recent_raw(YELLOW_SPAN))
        .iter()
        .map(|s| s.yellow_cards)
        .sum();
    put(out, "yellows_last_10", yellows);
    put(out, "yellow_card_risk", flag(yellows >= YELLOW_RISK_COUNT));
}

/// Exponentially decayed mean minutes over the last `window` starts.
pub fn recency_weighted_minutes(history: &[&Appearance], alpha: f64, window: usize) -> f64 {
    let alpha = if alpha.is_finite() && alpha > 0.0 {
        alpha.min(1.0)
    } else {
        default_recency_alpha()
    };
    let mut weight = 1.0;
    let mut total = 0.0;
    let mut norm = 0.0;
    for a in history.iter().rev().filter(|a| a.started).take(window) {
        total += weight * a.minutes as f64;
        norm += weight;
        weight *= alpha;
    }
    if norm > 0.0 { total / norm } else { 0.0 }
}
