use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use xmins::PlayerHistory;
use xmins::config::default_db_path;
use xmins::store;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    xmins::init_tracing();

    let input = parse_path_arg("--input")
        .ok_or_else(|| anyhow!("usage: import_appearances --input <players.json> [--db <path>]"))?;
    let db_path = parse_path_arg("--db")
        .or_else(default_db_path)
        .context("unable to resolve sqlite path")?;

    let raw = fs::read_to_string(&input).with_context(|| format!("read {}", input.display()))?;
    let players: Vec<PlayerHistory> =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", input.display()))?;

    let mut conn = store::open_db(&db_path)?;
    let mut appearances = 0usize;
    let mut corrupt = 0usize;
    for player in &players {
        let bad = player.appearances.iter().filter(|a| a.is_corrupt()).count();
        if bad > 0 {
            warn!(player = %player.profile.player_id, bad, "corrupt appearances stored; ignored at prediction time");
            corrupt += bad;
        }
        store::upsert_profile(&conn, &player.profile)?;
        appearances += store::replace_appearances(&mut conn, &player.profile.player_id, &player.appearances)?;
    }
    info!(players = players.len(), appearances, "import finished");

    println!("Appearance import complete");
    println!("DB: {}", db_path.display());
    println!("Players: {}", players.len());
    println!("Appearances: {appearances} ({corrupt} flagged corrupt)");
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
