use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::appearance::{Appearance, MatchStats, PlayerHistory, PlayerProfile, Position};

const TEAMS: [&str; 6] = ["ALPHA", "BRAVO", "CHARLIE", "DELTA", "ECHO", "FOXTROT"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Archetype {
    Nailed,
    Regular,
    Rotation,
    Fringe,
}

impl Archetype {
    pub const ALL: [Archetype; 4] = [
        Archetype::Nailed,
        Archetype::Regular,
        Archetype::Rotation,
        Archetype::Fringe,
    ];

    fn start_rate(self) -> f64 {
        match self {
            Archetype::Nailed => 0.97,
            Archetype::Regular => 0.80,
            Archetype::Rotation => 0.50,
            Archetype::Fringe => 0.10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeagueSpec {
    pub players: usize,
    pub periods: u32,
    pub season: String,
    pub seed: u64,
    pub with_stats: bool,
}

impl Default for LeagueSpec {
    fn default() -> Self {
        Self {
            players: 32,
            periods: 38,
            season: "2024-25".to_string(),
            seed: 7,
            with_stats: true,
        }
    }
}

/// Deterministic league: the same `LeagueSpec` always yields the same histories.
pub fn generate(spec: &LeagueSpec) -> Vec<PlayerHistory> {
    let mut rng = StdRng::seed_from_u64(spec.seed);
    (0..spec.players)
        .map(|idx| {
            let archetype = Archetype::ALL[idx % Archetype::ALL.len()];
            let position = Position::ALL[(idx / Archetype::ALL.len()) % Position::ALL.len()];
            let profile = PlayerProfile {
                player_id: format!("fake-{idx:03}"),
                name: Some(format!("{} {:?} {idx}", position.code(), archetype)),
                position: position.code().to_string(),
                team: TEAMS[idx % TEAMS.len()].to_string(),
                price: price_for(archetype, &mut rng),
            };
            let appearances = (1..=spec.periods)
                .map(|period| appearance(&mut rng, spec, archetype, position, period))
                .collect();
            PlayerHistory {
                profile,
                appearances,
            }
        })
        .collect()
}

fn price_for(archetype: Archetype, rng: &mut StdRng) -> f64 {
    let base = match archetype {
        Archetype::Nailed => 7.5,
        Archetype::Regular => 6.0,
        Archetype::Rotation => 5.0,
        Archetype::Fringe => 4.5,
    };
    ((base + rng.gen_range(-0.5..1.5)) * 10.0_f64).round() / 10.0
}

fn appearance(
    rng: &mut StdRng,
    spec: &LeagueSpec,
    archetype: Archetype,
    position: Position,
    period: u32,
) -> Appearance {
    let started = rng.gen_bool(archetype.start_rate());
    let minutes: u16 = if started {
        match archetype {
            Archetype::Nailed => {
                if rng.gen_bool(0.9) {
                    90
                } else {
                    rng.gen_range(70..=89)
                }
            }
            Archetype::Regular => {
                if rng.gen_bool(0.3) {
                    90
                } else {
                    rng.gen_range(60..=85)
                }
            }
            Archetype::Rotation => rng.gen_range(55..=80),
            Archetype::Fringe => rng.gen_range(45..=70),
        }
    } else if rng.gen_bool(0.5) {
        0
    } else {
        rng.gen_range(5..=30)
    };

    let mut app = Appearance::new(spec.season.clone(), period, started, minutes);
    if started && rng.gen_bool(0.01) {
        app.red_card = true;
        app.minutes = rng.gen_range(15..=80);
    } else if started && rng.gen_bool(0.02) {
        app.early_exit = true;
        app.minutes = rng.gen_range(5..=40);
    }

    let first_kickoff = Utc.with_ymd_and_hms(2024, 8, 17, 14, 0, 0).single();
    app.kickoff = first_kickoff.map(|k| k + ChronoDuration::days(7 * (period as i64 - 1)));
    app.is_home = Some(period % 2 == 0);
    if spec.with_stats {
        app.stats = Some(stats_for(rng, position, app.minutes));
    }
    app
}

fn stats_for(rng: &mut StdRng, position: Position, minutes: u16) -> MatchStats {
    if minutes == 0 {
        return MatchStats::default();
    }
    let share = minutes as f64 / 90.0;
    let (xg_rate, xa_rate) = match position {
        Position::Goalkeeper => (0.0, 0.01),
        Position::Defender => (0.05, 0.05),
        Position::Midfielder => (0.18, 0.15),
        Position::Forward => (0.40, 0.12),
    };
    let xg = xg_rate * share * rng.gen_range(0.3..1.7);
    let xa = xa_rate * share * rng.gen_range(0.3..1.7);
    let goals = if rng.gen_bool(xg.clamp(0.0, 0.9)) { 1.0 } else { 0.0 };
    let assists = if rng.gen_bool(xa.clamp(0.0, 0.9)) { 1.0 } else { 0.0 };
    let influence = share * rng.gen_range(5.0..35.0);
    let creativity = share * rng.gen_range(0.0..30.0);
    let threat = share * rng.gen_range(0.0..40.0);
    MatchStats {
        goals,
        assists,
        expected_goals: xg,
        expected_assists: xa,
        ict_index: (influence + creativity + threat) / 10.0,
        influence,
        creativity,
        threat,
        bonus: if goals + assists > 0.0 { rng.gen_range(0.0..3.0_f64).floor() } else { 0.0 },
        yellow_cards: if rng.gen_bool((0.12 * share).clamp(0.0, 0.9)) { 1.0 } else { 0.0 },
    }
}
