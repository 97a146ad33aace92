use crate::appearance::{Appearance, PeriodKey};

pub const DEFAULT_SHORT_START_FLOOR: u16 = 20;

/// Strictly-before-target appearances, oldest first. `clean` also drops
/// outlier events.
#[derive(Debug, Clone)]
pub struct FilteredHistory<'a> {
    raw: Vec<&'a Appearance>,
    clean: Vec<&'a Appearance>,
    short_start_floor: u16,
}

impl<'a> FilteredHistory<'a> {
    pub fn build(history: &'a [Appearance], target: &PeriodKey, short_start_floor: u16) -> Self {
        let raw = prior_appearances(history, target);
        let clean = raw
            .iter()
            .copied()
            .filter(|a| !a.is_outlier_event(short_start_floor))
            .collect();
        Self {
            raw,
            clean,
            short_start_floor,
        }
    }

    pub fn raw(&self) -> &[&'a Appearance] {
        &self.raw
    }

    pub fn clean(&self) -> &[&'a Appearance] {
        &self.clean
    }

    pub fn recent_raw(&self, n: usize) -> &[&'a Appearance] {
        tail(&self.raw, n)
    }

    pub fn recent_clean(&self, n: usize) -> &[&'a Appearance] {
        tail(&self.clean, n)
    }

    pub fn last_raw(&self) -> Option<&'a Appearance> {
        self.raw.last().copied()
    }

    pub fn last_clean(&self) -> Option<&'a Appearance> {
        self.clean.last().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn usable_len(&self) -> usize {
        self.clean.len()
    }

    pub fn outlier_count(&self) -> usize {
        self.raw.len() - self.clean.len()
    }

    pub fn short_start_floor(&self) -> u16 {
        self.short_start_floor
    }
}

/// Ties on (season, period, kickoff) keep their input order.
pub fn prior_appearances<'a>(history: &'a [Appearance], target: &PeriodKey) -> Vec<&'a Appearance> {
    let mut out: Vec<&Appearance> = history
        .iter()
        .filter(|a| !a.is_corrupt())
        .filter(|a| a.is_before(target))
        .collect();
    out.sort_by(|a, b| {
        a.season
            .cmp(&b.season)
            .then(a.period.cmp(&b.period))
            .then(a.kickoff.cmp(&b.kickoff))
    });
    out
}

fn tail<'s, T>(items: &'s [T], n: usize) -> &'s [T] {
    let start = items.len().saturating_sub(n);
    &items[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(period: u32, started: bool, minutes: u16) -> Appearance {
        Appearance::new("2024-25", period, started, minutes)
    }

    #[test]
    fn excludes_target_period_and_later() {
        let history = vec![app(1, true, 90), app(2, true, 90), app(3, true, 90), app(4, true, 90)];
        let filtered = FilteredHistory::build(&history, &PeriodKey::new("2024-25", 3), 20);
        let periods: Vec<u32> = filtered.raw().iter().map(|a| a.period).collect();
        assert_eq!(periods, vec![1, 2]);
    }

    #[test]
    fn sorts_unordered_input_and_keeps_insertion_order_on_ties() {
        let mut first = app(2, true, 60);
        first.minutes = 61;
        let second = app(2, false, 0);
        let history = vec![app(3, true, 90), first, app(1, true, 90), second];
        let filtered = FilteredHistory::build(&history, &PeriodKey::new("2024-25", 10), 20);
        let seen: Vec<(u32, u16)> = filtered.raw().iter().map(|a| (a.period, a.minutes)).collect();
        assert_eq!(seen, vec![(1, 90), (2, 61), (2, 0), (3, 90)]);
    }

    #[test]
    fn zero_history_is_empty_not_error() {
        let filtered = FilteredHistory::build(&[], &PeriodKey::new("2024-25", 1), 20);
        assert!(filtered.is_empty());
        assert_eq!(filtered.usable_len(), 0);
        assert!(filtered.recent_clean(5).is_empty());
    }

    #[test]
    fn outliers_stay_in_raw_but_leave_clean() {
        let mut red = app(3, true, 23);
        red.red_card = true;
        let history = vec![app(1, true, 90), app(2, true, 90), red];
        let filtered = FilteredHistory::build(&history, &PeriodKey::new("2024-25", 4), 20);
        assert_eq!(filtered.raw().len(), 3);
        assert_eq!(filtered.clean().len(), 2);
        assert_eq!(filtered.outlier_count(), 1);
        assert_eq!(filtered.last_raw().map(|a| a.period), Some(3));
        assert_eq!(filtered.last_clean().map(|a| a.period), Some(2));
    }

    #[test]
    fn corrupt_records_are_dropped_everywhere() {
        let history = vec![app(1, true, 90), app(2, true, 200), app(0, true, 90)];
        let filtered = FilteredHistory::build(&history, &PeriodKey::new("2024-25", 5), 20);
        assert_eq!(filtered.raw().len(), 1);
    }

    #[test]
    fn windows_cap_to_most_recent_entries() {
        let history: Vec<Appearance> = (1..=10).map(|p| app(p, true, 80 + p as u16)).collect();
        let filtered = FilteredHistory::build(&history, &PeriodKey::new("2024-25", 11), 20);
        let last3: Vec<u32> = filtered.recent_clean(3).iter().map(|a| a.period).collect();
        assert_eq!(last3, vec![8, 9, 10]);
        assert_eq!(filtered.recent_raw(50).len(), 10);
    }

    #[test]
    fn previous_season_counts_as_history() {
        let history = vec![
            Appearance::new("2023-24", 38, true, 90),
            Appearance::new("2024-25", 1, true, 90),
        ];
        let filtered = FilteredHistory::build(&history, &PeriodKey::new("2024-25", 1), 20);
        assert_eq!(filtered.raw().len(), 1);
        assert_eq!(filtered.raw()[0].season, "2023-24");
    }
}
