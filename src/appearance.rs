use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_RECORDED_MINUTES: u16 = 120;

/// Fixture slot an appearance belongs to. Seasons compare lexically
/// ("2023-24" < "2024-25"), periods numerically within a season.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeriodKey {
    pub season: String,
    pub period: u32,
}

impl PeriodKey {
    pub fn new(season: impl Into<String>, period: u32) -> Self {
        Self {
            season: season.into(),
            period,
        }
    }
}

impl Ord for PeriodKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.season
            .cmp(&other.season)
            .then(self.period.cmp(&other.period))
    }
}

impl PartialOrd for PeriodKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} GW{}", self.season, self.period)
    }
}

/// Richer per-match numbers. Absent for sources that only report minutes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchStats {
    #[serde(default)]
    pub goals: f64,
    #[serde(default)]
    pub assists: f64,
    #[serde(default)]
    pub expected_goals: f64,
    #[serde(default)]
    pub expected_assists: f64,
    #[serde(default)]
    pub ict_index: f64,
    #[serde(default)]
    pub influence: f64,
    #[serde(default)]
    pub creativity: f64,
    #[serde(default)]
    pub threat: f64,
    #[serde(default)]
    pub bonus: f64,
    #[serde(default)]
    pub yellow_cards: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appearance {
    pub season: String,
    pub period: u32,
    pub started: bool,
    pub minutes: u16,
    #[serde(default)]
    pub early_exit: bool,
    #[serde(default)]
    pub red_card: bool,
    #[serde(default)]
    pub kickoff: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_home: Option<bool>,
    #[serde(default)]
    pub stats: Option<MatchStats>,
}

impl Appearance {
    pub fn new(season: impl Into<String>, period: u32, started: bool, minutes: u16) -> Self {
        Self {
            season: season.into(),
            period,
            started,
            minutes,
            early_exit: false,
            red_card: false,
            kickoff: None,
            is_home: None,
            stats: None,
        }
    }

    pub fn key(&self) -> PeriodKey {
        PeriodKey::new(self.season.clone(), self.period)
    }

    pub fn is_before(&self, target: &PeriodKey) -> bool {
        match self.season.as_str().cmp(target.season.as_str()) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.period < target.period,
        }
    }

    pub fn is_short_start(&self, floor: u16) -> bool {
        self.started && self.minutes < floor
    }

    pub fn is_outlier_event(&self, short_start_floor: u16) -> bool {
        self.red_card || self.early_exit || self.is_short_start(short_start_floor)
    }

    pub fn is_corrupt(&self) -> bool {
        self.period == 0 || self.minutes > MAX_RECORDED_MINUTES
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Position {
    #[serde(rename = "GK")]
    Goalkeeper,
    #[serde(rename = "DEF")]
    Defender,
    #[serde(rename = "MID")]
    Midfielder,
    #[serde(rename = "FWD")]
    Forward,
}

impl Position {
    pub const ALL: [Position; 4] = [
        Position::Goalkeeper,
        Position::Defender,
        Position::Midfielder,
        Position::Forward,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Position::Goalkeeper => "GK",
            Position::Defender => "DEF",
            Position::Midfielder => "MID",
            Position::Forward => "FWD",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "GK" | "GKP" | "GOALKEEPER" => Some(Position::Goalkeeper),
            "DEF" | "DEFENDER" => Some(Position::Defender),
            "MID" | "MIDFIELDER" => Some(Position::Midfielder),
            "FWD" | "FW" | "FORWARD" | "ATTACKER" => Some(Position::Forward),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub player_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Raw role label from the profile source; unmapped labels are kept as-is.
    pub position: String,
    #[serde(default)]
    pub team: String,
    #[serde(default)]
    pub price: f64,
}

impl PlayerProfile {
    pub fn position(&self) -> Option<Position> {
        Position::parse(&self.position)
    }
}

/// Fixture-level signals from the context collaborator. Every field is
/// optional and resolves to a neutral value when absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchContext {
    #[serde(default)]
    pub is_home: Option<bool>,
    #[serde(default)]
    pub kickoff: Option<DateTime<Utc>>,
    #[serde(default)]
    pub congestion: Option<bool>,
    #[serde(default)]
    pub international_break: Option<bool>,
    #[serde(default)]
    pub opponent_strength: Option<f64>,
    #[serde(default)]
    pub team_rotation_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerHistory {
    pub profile: PlayerProfile,
    #[serde(default)]
    pub appearances: Vec<Appearance>,
}
