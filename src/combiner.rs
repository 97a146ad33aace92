use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::appearance::{PeriodKey, PlayerHistory, PlayerProfile, Position};

const SQUAD_FALLBACK_MINUTES: f64 = 70.0;

/// One step of the tiered full-match heuristic: when E[minutes | start] is at
/// least `min_minutes`, P90 = P(start) * `factor`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FullMatchTier {
    pub min_minutes: f64,
    pub factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinerConfig {
    #[serde(default = "default_uncertainty")]
    pub uncertainty_minutes: f64,
    #[serde(default = "default_match_length")]
    pub match_length: f64,
    #[serde(default = "default_sparse_threshold")]
    pub sparse_history_threshold: usize,
    /// Checked in order; the first tier whose threshold is met applies.
    #[serde(default = "default_tiers")]
    pub full_match_tiers: Vec<FullMatchTier>,
    #[serde(default = "default_floor_factor")]
    pub full_match_floor: f64,
    /// Prefer priors learned from teammates at the same position over the
    /// league-wide position defaults.
    #[serde(default = "default_team_prior")]
    pub team_prior: bool,
    #[serde(default = "default_team_prior_min")]
    pub team_prior_min_appearances: usize,
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            uncertainty_minutes: default_uncertainty(),
            match_length: default_match_length(),
            sparse_history_threshold: default_sparse_threshold(),
            full_match_tiers: default_tiers(),
            full_match_floor: default_floor_factor(),
            team_prior: default_team_prior(),
            team_prior_min_appearances: default_team_prior_min(),
        }
    }
}

fn default_uncertainty() -> f64 {
    10.0
}

fn default_match_length() -> f64 {
    90.0
}

fn default_sparse_threshold() -> usize {
    5
}

fn default_tiers() -> Vec<FullMatchTier> {
    vec![
        FullMatchTier { min_minutes: 85.0, factor: 0.85 },
        FullMatchTier { min_minutes: 80.0, factor: 0.60 },
        FullMatchTier { min_minutes: 70.0, factor: 0.35 },
    ]
}

fn default_floor_factor() -> f64 {
    0.10
}

fn default_team_prior() -> bool {
    true
}

fn default_team_prior_min() -> usize {
    10
}

impl CombinerConfig {
    /// Tiered approximation of P(full match). It scales P(start) by a factor
    /// picked from the conditional-minutes point estimate; it is not derived
    /// from a joint distribution.
    pub fn full_match_heuristic(&self, start_prob: f64, xmins_start: f64) -> f64 {
        let factor = self
            .full_match_tiers
            .iter()
            .find(|t| xmins_start >= t.min_minutes)
            .map(|t| t.factor)
            .unwrap_or(self.full_match_floor);
        (start_prob * factor).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionPrior {
    pub start_prob: f64,
    pub minutes_if_start: f64,
}

/// League-wide defaults by role; unknown roles fall back to midfielder.
pub fn position_prior(position: Option<Position>) -> PositionPrior {
    let (start_prob, minutes_if_start) = match position {
        Some(Position::Goalkeeper) => (0.90, 88.0),
        Some(Position::Defender) => (0.70, 80.0),
        Some(Position::Forward) => (0.60, 70.0),
        Some(Position::Midfielder) | None => (0.60, 75.0),
    };
    PositionPrior {
        start_prob,
        minutes_if_start,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SquadPrior {
    pub team: String,
    pub position: Position,
    pub appearances: usize,
    pub prior: PositionPrior,
}

/// Start rate and mean starting minutes per (team, position), learned from
/// the histories a model was trained on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SquadPriors {
    pub entries: Vec<SquadPrior>,
}

impl SquadPriors {
    /// Groups with fewer than `min_appearances` valid records are left out.
    pub fn from_histories(histories: &[PlayerHistory], min_appearances: usize) -> Self {
        let mut tally: HashMap<(String, Position), (usize, usize, f64)> = HashMap::new();
        for h in histories {
            let Some(position) = h.profile.position() else {
                continue;
            };
            let entry = tally.entry((h.profile.team.clone(), position)).or_default();
            for a in h.appearances.iter().filter(|a| !a.is_corrupt()) {
                entry.0 += 1;
                if a.started {
                    entry.1 += 1;
                    entry.2 += a.minutes as f64;
                }
            }
        }

        let mut entries: Vec<SquadPrior> = tally
            .into_iter()
            .filter(|(_, (apps, _, _))| *apps > 0 && *apps >= min_appearances)
            .map(|((team, position), (apps, starts, start_minutes))| SquadPrior {
                team,
                position,
                appearances: apps,
                prior: PositionPrior {
                    start_prob: starts as f64 / apps as f64,
                    minutes_if_start: if starts > 0 {
                        start_minutes / starts as f64
                    } else {
                        SQUAD_FALLBACK_MINUTES
                    },
                },
            })
            .collect();
        entries.sort_by(|a, b| {
            a.team
                .cmp(&b.team)
                .then(a.position.code().cmp(b.position.code()))
        });
        Self { entries }
    }

    pub fn lookup(&self, team: &str, position: Option<Position>) -> Option<PositionPrior> {
        let position = position?;
        self.entries
            .iter()
            .find(|e| e.position == position && e.team == team)
            .map(|e| e.prior)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn resolve_prior(cfg: &CombinerConfig, squads: &SquadPriors, profile: &PlayerProfile) -> PositionPrior {
    let position = profile.position();
    cfg.team_prior
        .then(|| squads.lookup(&profile.team, position))
        .flatten()
        .unwrap_or_else(|| position_prior(position))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    Model,
    Prior,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionFlags {
    pub sparse_data: bool,
    pub role_lock: bool,
    pub recent_outlier: bool,
    pub prior_used: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub player_id: String,
    pub target: PeriodKey,
    pub start_prob: f64,
    pub xmins_start: f64,
    pub xmins: f64,
    /// Tiered heuristic, see [`CombinerConfig::full_match_heuristic`].
    pub p90: f64,
    pub full_match_prob_model: Option<f64>,
    pub uncertainty_lower: f64,
    pub uncertainty_upper: f64,
    pub flags: PredictionFlags,
    pub source: PredictionSource,
    pub usable_history: usize,
    pub model_version: String,
    pub schema_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageOutputs {
    pub start_prob: f64,
    pub xmins_start: f64,
    pub full_match_given_start: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Diagnostics {
    pub usable_history: usize,
    pub role_lock: bool,
    pub recent_outlier: bool,
}

pub struct Combiner<'c> {
    cfg: &'c CombinerConfig,
    model_version: &'c str,
    schema_fingerprint: Option<&'c str>,
}

impl<'c> Combiner<'c> {
    pub fn new(cfg: &'c CombinerConfig, model_version: &'c str, schema_fingerprint: Option<&'c str>) -> Self {
        Self {
            cfg,
            model_version,
            schema_fingerprint,
        }
    }

    pub fn combine(
        &self,
        player_id: &str,
        target: &PeriodKey,
        stages: StageOutputs,
        diag: Diagnostics,
    ) -> PredictionResult {
        let start_prob = unit(stages.start_prob);
        let xmins_start = self.minutes(stages.xmins_start);
        let full_match_prob_model = stages
            .full_match_given_start
            .map(|p| unit(start_prob * unit(p)));
        self.build(
            player_id,
            target,
            start_prob,
            xmins_start,
            full_match_prob_model,
            diag,
            PredictionSource::Model,
        )
    }

    pub fn prior(
        &self,
        player_id: &str,
        target: &PeriodKey,
        prior: PositionPrior,
        diag: Diagnostics,
    ) -> PredictionResult {
        let xmins_start = self.minutes(prior.minutes_if_start);
        self.build(
            player_id,
            target,
            prior.start_prob,
            xmins_start,
            None,
            diag,
            PredictionSource::Prior,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        &self,
        player_id: &str,
        target: &PeriodKey,
        start_prob: f64,
        xmins_start: f64,
        full_match_prob_model: Option<f64>,
        diag: Diagnostics,
        source: PredictionSource,
    ) -> PredictionResult {
        let prior_used = source == PredictionSource::Prior;
        let xmins = self.minutes(start_prob * xmins_start);
        let band = self.cfg.uncertainty_minutes.max(0.0);
        PredictionResult {
            player_id: player_id.to_string(),
            target: target.clone(),
            start_prob,
            xmins_start,
            xmins,
            p90: self.cfg.full_match_heuristic(start_prob, xmins_start),
            full_match_prob_model,
            uncertainty_lower: self.minutes(xmins - band),
            uncertainty_upper: self.minutes(xmins + band),
            flags: PredictionFlags {
                sparse_data: prior_used || diag.usable_history < self.cfg.sparse_history_threshold,
                role_lock: diag.role_lock,
                recent_outlier: diag.recent_outlier,
                prior_used,
            },
            source,
            usable_history: diag.usable_history,
            model_version: self.model_version.to_string(),
            schema_fingerprint: self.schema_fingerprint.map(str::to_string),
        }
    }

    fn minutes(&self, m: f64) -> f64 {
        if m.is_nan() {
            return 0.0;
        }
        m.clamp(0.0, self.cfg.match_length.max(0.0))
    }
}

fn unit(p: f64) -> f64 {
    if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appearance::Appearance;
    use approx::assert_relative_eq;

    fn target() -> PeriodKey {
        PeriodKey::new("2024-25", 10)
    }

    fn diag(usable: usize) -> Diagnostics {
        Diagnostics {
            usable_history: usable,
            ..Diagnostics::default()
        }
    }

    #[test]
    fn heuristic_tiers() {
        let cfg = CombinerConfig::default();
        assert_relative_eq!(cfg.full_match_heuristic(1.0, 88.0), 0.85);
        assert_relative_eq!(cfg.full_match_heuristic(1.0, 85.0), 0.85);
        assert_relative_eq!(cfg.full_match_heuristic(0.5, 82.0), 0.30);
        assert_relative_eq!(cfg.full_match_heuristic(1.0, 70.0), 0.35);
        assert_relative_eq!(cfg.full_match_heuristic(1.0, 40.0), 0.10);
    }

    #[test]
    fn combined_and_band_stay_in_range_over_a_grid() {
        let cfg = CombinerConfig::default();
        let c = Combiner::new(&cfg, "test", None);
        let probs = [-0.5, 0.0, 0.3, 1.0, 1.7, f64::NAN];
        let minutes = [-20.0, 0.0, 5.0, 45.0, 89.0, 90.0, 140.0, f64::NAN];
        for p in probs {
            for m in minutes {
                let r = c.combine(
                    "p",
                    &target(),
                    StageOutputs {
                        start_prob: p,
                        xmins_start: m,
                        full_match_given_start: Some(p),
                    },
                    diag(8),
                );
                assert!((0.0..=90.0).contains(&r.xmins), "{p} {m} -> {}", r.xmins);
                assert!(r.uncertainty_lower >= 0.0);
                assert!(r.uncertainty_upper <= 90.0);
                assert!(r.uncertainty_lower <= r.xmins && r.xmins <= r.uncertainty_upper);
                assert!((0.0..=1.0).contains(&r.p90));
                assert!((0.0..=1.0).contains(&r.full_match_prob_model.unwrap()));
            }
        }
    }

    #[test]
    fn sparse_flag_tracks_usable_history() {
        let cfg = CombinerConfig::default();
        let c = Combiner::new(&cfg, "test", None);
        let stages = StageOutputs {
            start_prob: 0.8,
            xmins_start: 80.0,
            full_match_given_start: None,
        };
        assert!(c.combine("p", &target(), stages, diag(4)).flags.sparse_data);
        assert!(!c.combine("p", &target(), stages, diag(5)).flags.sparse_data);
    }

    #[test]
    fn prior_path_uses_position_defaults() {
        let cfg = CombinerConfig::default();
        let c = Combiner::new(&cfg, "v1", Some("abc"));
        let r = c.prior("p", &target(), position_prior(Some(Position::Midfielder)), diag(0));
        assert_relative_eq!(r.start_prob, 0.6);
        assert_relative_eq!(r.xmins_start, 75.0);
        assert_relative_eq!(r.xmins, 45.0);
        assert!(r.flags.sparse_data && r.flags.prior_used);
        assert_eq!(r.source, PredictionSource::Prior);
        assert_eq!(r.full_match_prob_model, None);
        assert_eq!(r.schema_fingerprint.as_deref(), Some("abc"));

        let gk = c.prior("g", &target(), position_prior(Some(Position::Goalkeeper)), diag(0));
        assert_relative_eq!(gk.xmins, 0.9 * 88.0);
        let unknown = c.prior("u", &target(), position_prior(None), diag(0));
        assert_relative_eq!(unknown.start_prob, 0.6);
    }

    fn squad_member(id: &str, team: &str, position: &str, records: &[(bool, u16)]) -> PlayerHistory {
        PlayerHistory {
            profile: PlayerProfile {
                player_id: id.into(),
                name: None,
                position: position.into(),
                team: team.into(),
                price: 5.0,
            },
            appearances: records
                .iter()
                .enumerate()
                .map(|(i, (s, m))| Appearance::new("2024-25", i as u32 + 1, *s, *m))
                .collect(),
        }
    }

    #[test]
    fn squad_priors_pool_teammates_at_a_position() {
        let histories = vec![
            squad_member("a", "ARS", "DEF", &[(true, 90), (true, 90), (false, 0), (true, 60)]),
            squad_member("b", "ARS", "DEF", &[(false, 0), (false, 20), (true, 80), (false, 0)]),
            squad_member("c", "ARS", "FWD", &[(false, 0), (false, 5)]),
            squad_member("d", "CHE", "DEF", &[(true, 90)]),
        ];
        let squads = SquadPriors::from_histories(&histories, 2);

        let def = squads.lookup("ARS", Some(Position::Defender)).unwrap();
        assert_relative_eq!(def.start_prob, 4.0 / 8.0);
        assert_relative_eq!(def.minutes_if_start, 80.0);
        let fwd = squads.lookup("ARS", Some(Position::Forward)).unwrap();
        assert_relative_eq!(fwd.start_prob, 0.0);
        assert_relative_eq!(fwd.minutes_if_start, 70.0);
        assert!(squads.lookup("CHE", Some(Position::Defender)).is_none());
        assert!(squads.lookup("ARS", None).is_none());
        assert_eq!(squads.entries.len(), 2);
    }

    #[test]
    fn resolve_prior_falls_back_to_position_defaults() {
        let histories = vec![squad_member("a", "ARS", "GK", &[(true, 90), (false, 0)])];
        let squads = SquadPriors::from_histories(&histories, 1);
        let mut profile = histories[0].profile.clone();

        let mut cfg = CombinerConfig::default();
        assert_relative_eq!(resolve_prior(&cfg, &squads, &profile).start_prob, 0.5);

        profile.team = "NEW".into();
        assert_eq!(resolve_prior(&cfg, &squads, &profile), position_prior(Some(Position::Goalkeeper)));

        profile.team = "ARS".into();
        cfg.team_prior = false;
        assert_eq!(resolve_prior(&cfg, &squads, &profile), position_prior(Some(Position::Goalkeeper)));
    }

    #[test]
    fn band_clamps_at_edges() {
        let cfg = CombinerConfig::default();
        let c = Combiner::new(&cfg, "test", None);
        let r = c.combine(
            "p",
            &target(),
            StageOutputs {
                start_prob: 1.0,
                xmins_start: 88.0,
                full_match_given_start: None,
            },
            diag(10),
        );
        assert_relative_eq!(r.uncertainty_lower, 78.0);
        assert_relative_eq!(r.uncertainty_upper, 90.0);
    }
}
