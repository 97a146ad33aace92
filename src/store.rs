use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::appearance::{Appearance, MatchStats, PlayerHistory, PlayerProfile};

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let conn =
        Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS players (
            player_id TEXT PRIMARY KEY,
            name TEXT NULL,
            position TEXT NOT NULL,
            team TEXT NOT NULL,
            price REAL NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS appearances (
            player_id TEXT NOT NULL,
            season TEXT NOT NULL,
            period INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            started INTEGER NOT NULL,
            minutes INTEGER NOT NULL,
            early_exit INTEGER NOT NULL,
            red_card INTEGER NOT NULL,
            kickoff TEXT NULL,
            is_home INTEGER NULL,
            stats_json TEXT NULL,
            PRIMARY KEY (player_id, season, period, seq)
        );
        CREATE INDEX IF NOT EXISTS idx_appearances_player ON appearances(player_id);
        "#,
    )
    .context("create sqlite schema")?;
    Ok(())
}

pub fn upsert_profile(conn: &Connection, profile: &PlayerProfile) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO players (player_id, name, position, team, price, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(player_id) DO UPDATE SET
            name = excluded.name,
            position = excluded.position,
            team = excluded.team,
            price = excluded.price,
            updated_at = excluded.updated_at
        "#,
        params![
            profile.player_id,
            profile.name,
            profile.position,
            profile.team,
            profile.price,
            Utc::now().to_rfc3339(),
        ],
    )
    .with_context(|| format!("upsert player {}", profile.player_id))?;
    Ok(())
}

/// Replaces a player's stored appearances in one transaction. `seq` keeps
/// same-period records in their given order.
pub fn replace_appearances(
    conn: &mut Connection,
    player_id: &str,
    appearances: &[Appearance],
) -> Result<usize> {
    let tx = conn.transaction().context("begin appearances tx")?;
    tx.execute("DELETE FROM appearances WHERE player_id = ?1", params![player_id])
        .context("clear appearances")?;

    let mut seq_by_key: HashMap<(String, u32), i64> = HashMap::new();
    for a in appearances {
        let seq = seq_by_key.entry((a.season.clone(), a.period)).or_insert(0);
        let stats_json = a
            .stats
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serialize appearance stats")?;
        tx.execute(
            r#"
            INSERT INTO appearances (
                player_id, season, period, seq, started, minutes,
                early_exit, red_card, kickoff, is_home, stats_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                player_id,
                a.season,
                a.period as i64,
                *seq,
                bool_to_i64(a.started),
                a.minutes as i64,
                bool_to_i64(a.early_exit),
                bool_to_i64(a.red_card),
                a.kickoff.map(|k| k.to_rfc3339()),
                a.is_home.map(bool_to_i64),
                stats_json,
            ],
        )
        .with_context(|| format!("insert appearance {player_id} {} GW{}", a.season, a.period))?;
        *seq += 1;
    }
    tx.commit().context("commit appearances")?;
    Ok(appearances.len())
}

pub fn load_profile(conn: &Connection, player_id: &str) -> Result<Option<PlayerProfile>> {
    conn.query_row(
        "SELECT player_id, name, position, team, price FROM players WHERE player_id = ?1",
        params![player_id],
        profile_from_row,
    )
    .optional()
    .with_context(|| format!("load player {player_id}"))
}

pub fn load_history(conn: &Connection, player_id: &str) -> Result<Vec<Appearance>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT season, period, started, minutes, early_exit, red_card,
                   kickoff, is_home, stats_json
            FROM appearances
            WHERE player_id = ?1
            ORDER BY season ASC, period ASC, seq ASC
            "#,
        )
        .context("prepare load history query")?;
    let rows = stmt
        .query_map(params![player_id], |row| {
            Ok(RawAppearance {
                season: row.get(0)?,
                period: row.get::<_, i64>(1)?,
                started: row.get::<_, i64>(2)? != 0,
                minutes: row.get::<_, i64>(3)?,
                early_exit: row.get::<_, i64>(4)? != 0,
                red_card: row.get::<_, i64>(5)? != 0,
                kickoff: row.get(6)?,
                is_home: row.get::<_, Option<i64>>(7)?.map(|v| v != 0),
                stats_json: row.get(8)?,
            })
        })
        .context("query load history")?;

    let mut out = Vec::new();
    for row in rows {
        let raw = row.context("decode appearance row")?;
        out.push(raw.into_appearance()?);
    }
    Ok(out)
}

pub fn load_all_histories(conn: &Connection) -> Result<Vec<PlayerHistory>> {
    let mut stmt = conn
        .prepare("SELECT player_id, name, position, team, price FROM players ORDER BY player_id")
        .context("prepare load players query")?;
    let profiles = stmt
        .query_map([], profile_from_row)
        .context("query load players")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("decode player row")?;

    let mut out = Vec::with_capacity(profiles.len());
    for profile in profiles {
        let appearances = load_history(conn, &profile.player_id)?;
        out.push(PlayerHistory {
            profile,
            appearances,
        });
    }
    Ok(out)
}

fn profile_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlayerProfile> {
    Ok(PlayerProfile {
        player_id: row.get(0)?,
        name: row.get(1)?,
        position: row.get(2)?,
        team: row.get(3)?,
        price: row.get(4)?,
    })
}

struct RawAppearance {
    season: String,
    period: i64,
    started: bool,
    minutes: i64,
    early_exit: bool,
    red_card: bool,
    kickoff: Option<String>,
    is_home: Option<bool>,
    stats_json: Option<String>,
}

impl RawAppearance {
    fn into_appearance(self) -> Result<Appearance> {
        let kickoff = self
            .kickoff
            .as_deref()
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .with_context(|| format!("parse kickoff `{raw}`"))
            })
            .transpose()?;
        let stats = self
            .stats_json
            .as_deref()
            .map(serde_json::from_str::<MatchStats>)
            .transpose()
            .context("parse appearance stats")?;
        Ok(Appearance {
            season: self.season,
            period: u32::try_from(self.period).context("period out of range")?,
            started: self.started,
            minutes: u16::try_from(self.minutes).context("minutes out of range")?,
            early_exit: self.early_exit,
            red_card: self.red_card,
            kickoff,
            is_home: self.is_home,
            stats,
        })
    }
}

fn bool_to_i64(v: bool) -> i64 {
    if v { 1 } else { 0 }
}
