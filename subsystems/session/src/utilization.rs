//! # Utilization Tracker
//!
//! Per compute unit busy/idle bookkeeping used to rank load. Samples
//! accumulate into a fixed window; a full window (or an explicit
//! `finalize_window`) folds into a short history whose mean is the unit's
//! busy ratio. Ratios are in per-mille.
//!
//! Co-processor crashes mark a unit suspect; suspects rank last.

use std::collections::BTreeMap;

use accel_core::{CuIndex, Error, Result};
use arrayvec::ArrayVec;

/// Samples per window
pub const WINDOW_SAMPLES: u32 = 32;

/// Finalized windows kept for the moving average
pub const HISTORY_WINDOWS: usize = 8;

/// Crashes after which a unit is suspect
pub const SUSPECT_CRASHES: u32 = 1;

/// Load bookkeeping for one compute unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CuLoad {
    /// Running busy ticks
    pub busy_ticks: u64,
    /// Running idle ticks
    pub idle_ticks: u64,
    /// Running sample count
    pub samples: u64,
    /// Sum of sampled outstanding-command counts
    pub sampled_commands: u64,
    /// Commands completed on this unit
    pub completed: u64,
    /// Co-processor crashes
    pub crashes: u32,
    /// Busiest unit as of the last finalized window
    pub slowest: bool,
    window_busy: u64,
    window_idle: u64,
    window_samples: u32,
    window_commands: u64,
    history: ArrayVec<u16, HISTORY_WINDOWS>,
    average: Option<u16>,
    average_commands: u32,
}

impl CuLoad {
    /// Moving average busy ratio, falling back to running totals
    pub fn busy_ratio(&self) -> u16 {
        self.average
            .unwrap_or_else(|| permille(self.busy_ticks, self.idle_ticks))
    }

    /// Mean outstanding commands over the last window, times 100
    pub fn average_commands(&self) -> u32 {
        self.average_commands
    }

    /// Finalized windows, oldest first
    pub fn history(&self) -> &[u16] {
        &self.history
    }

    /// Whether the unit has crashed often enough to avoid
    pub fn is_suspect(&self) -> bool {
        self.crashes >= SUSPECT_CRASHES
    }

    fn fold(&mut self) -> Option<u16> {
        if self.window_busy + self.window_idle == 0 {
            return None;
        }
        let ratio = permille(self.window_busy, self.window_idle);
        if self.history.is_full() {
            self.history.remove(0);
        }
        self.history.push(ratio);

        let sum: u32 = self.history.iter().map(|&r| r as u32).sum();
        self.average = Some((sum / self.history.len() as u32) as u16);
        if self.window_samples > 0 {
            self.average_commands = (self.window_commands * 100 / self.window_samples as u64) as u32;
        }

        self.window_busy = 0;
        self.window_idle = 0;
        self.window_samples = 0;
        self.window_commands = 0;
        Some(ratio)
    }
}

fn permille(busy: u64, idle: u64) -> u16 {
    match busy + idle {
        0 => 0,
        total => (busy * 1000 / total) as u16,
    }
}

/// Busy/idle tracker for a set of compute units
#[derive(Debug, Clone, Default)]
pub struct UtilizationTracker {
    units: BTreeMap<CuIndex, CuLoad>,
}

impl UtilizationTracker {
    /// Track the given compute units
    pub fn new(units: impl IntoIterator<Item = CuIndex>) -> Self {
        Self {
            units: units.into_iter().map(|cu| (cu, CuLoad::default())).collect(),
        }
    }

    fn unit_mut(&mut self, cu: CuIndex) -> Result<&mut CuLoad> {
        self.units.get_mut(&cu).ok_or(Error::NotFound)
    }

    /// Load of one unit
    pub fn load(&self, cu: CuIndex) -> Result<&CuLoad> {
        self.units.get(&cu).ok_or(Error::NotFound)
    }

    /// Add ticks to the running and windowed totals
    ///
    /// A full window is folded immediately.
    pub fn record_sample(&mut self, cu: CuIndex, busy_ticks: u32, idle_ticks: u32) -> Result<()> {
        let unit = self.unit_mut(cu)?;
        unit.busy_ticks += busy_ticks as u64;
        unit.idle_ticks += idle_ticks as u64;
        unit.samples += 1;
        unit.window_busy += busy_ticks as u64;
        unit.window_idle += idle_ticks as u64;
        unit.window_samples += 1;

        if unit.window_samples >= WINDOW_SAMPLES {
            self.finalize_window(cu)?;
        }
        Ok(())
    }

    /// Add an outstanding-command count sample
    pub fn record_commands(&mut self, cu: CuIndex, outstanding: u32) -> Result<()> {
        let unit = self.unit_mut(cu)?;
        unit.sampled_commands += outstanding as u64;
        unit.window_commands += outstanding as u64;
        Ok(())
    }

    /// Count a completed command
    pub fn record_completion(&mut self, cu: CuIndex) -> Result<()> {
        self.unit_mut(cu)?.completed += 1;
        Ok(())
    }

    /// Count a co-processor crash
    pub fn record_crash(&mut self, cu: CuIndex) -> Result<()> {
        let unit = self.unit_mut(cu)?;
        unit.crashes += 1;
        if unit.crashes == SUSPECT_CRASHES {
            log::warn!("{} marked suspect after {} crash(es)", cu, unit.crashes);
        }
        Ok(())
    }

    /// Forget crashes, e.g. after the co-processor was reloaded
    pub fn clear_suspect(&mut self, cu: CuIndex) -> Result<()> {
        self.unit_mut(cu)?.crashes = 0;
        Ok(())
    }

    /// Fold the current window into the moving average
    ///
    /// Returns the window's busy ratio, or `None` for an empty window.
    pub fn finalize_window(&mut self, cu: CuIndex) -> Result<Option<u16>> {
        let ratio = self.unit_mut(cu)?.fold();
        if ratio.is_some() {
            self.update_slowest();
        }
        Ok(ratio)
    }

    fn update_slowest(&mut self) {
        let slowest = self
            .units
            .iter()
            .filter(|(_, load)| load.average.is_some())
            .max_by_key(|(cu, load)| (load.busy_ratio(), core::cmp::Reverse(**cu)))
            .map(|(cu, _)| *cu);
        for (cu, load) in self.units.iter_mut() {
            load.slowest = Some(*cu) == slowest;
        }
    }

    /// Busiest unit as of the last finalized window
    pub fn slowest(&self) -> Option<CuIndex> {
        self.units
            .iter()
            .find(|(_, load)| load.slowest)
            .map(|(cu, _)| *cu)
    }

    /// Units by ascending busy ratio, suspects last
    pub fn rank(&self) -> Vec<CuIndex> {
        let mut ranked: Vec<(bool, u16, CuIndex)> = self
            .units
            .iter()
            .map(|(cu, load)| (load.is_suspect(), load.busy_ratio(), *cu))
            .collect();
        ranked.sort_unstable();
        ranked.into_iter().map(|(_, _, cu)| cu).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cu(n: u32) -> CuIndex {
        CuIndex::new(n)
    }

    fn tracker() -> UtilizationTracker {
        UtilizationTracker::new([cu(0), cu(1), cu(2)])
    }

    #[test]
    fn test_unknown_unit() {
        let mut t = tracker();
        assert_eq!(t.record_sample(cu(9), 1, 0), Err(Error::NotFound));
    }

    #[test]
    fn test_running_ratio_before_first_window() {
        let mut t = tracker();
        t.record_sample(cu(0), 3, 1).unwrap();
        assert_eq!(t.load(cu(0)).unwrap().busy_ratio(), 750);
        assert!(t.load(cu(0)).unwrap().history().is_empty());
    }

    #[test]
    fn test_explicit_finalize_resets_window() {
        let mut t = tracker();
        t.record_sample(cu(0), 1, 1).unwrap();
        assert_eq!(t.finalize_window(cu(0)).unwrap(), Some(500));
        assert_eq!(t.finalize_window(cu(0)).unwrap(), None);
        assert_eq!(t.load(cu(0)).unwrap().history(), &[500]);
    }

    #[test]
    fn test_full_window_folds_automatically() {
        let mut t = tracker();
        for _ in 0..WINDOW_SAMPLES {
            t.record_sample(cu(1), 1, 0).unwrap();
        }
        let load = t.load(cu(1)).unwrap();
        assert_eq!(load.history(), &[1000]);
        assert_eq!(load.samples, WINDOW_SAMPLES as u64);
        assert_eq!(t.slowest(), Some(cu(1)));
    }

    #[test]
    fn test_history_is_bounded_moving_average() {
        let mut t = tracker();
        for _ in 0..HISTORY_WINDOWS {
            t.record_sample(cu(0), 1, 0).unwrap();
            t.finalize_window(cu(0)).unwrap();
        }
        t.record_sample(cu(0), 0, 1).unwrap();
        t.finalize_window(cu(0)).unwrap();

        let load = t.load(cu(0)).unwrap();
        assert_eq!(load.history().len(), HISTORY_WINDOWS);
        assert_eq!(load.busy_ratio(), (1000 * (HISTORY_WINDOWS as u32 - 1) / HISTORY_WINDOWS as u32) as u16);
    }

    #[test]
    fn test_rank_ascending_with_suspects_last() {
        let mut t = tracker();
        t.record_sample(cu(0), 9, 1).unwrap();
        t.record_sample(cu(1), 1, 9).unwrap();
        t.record_sample(cu(2), 5, 5).unwrap();
        assert_eq!(t.rank(), vec![cu(1), cu(2), cu(0)]);

        t.record_crash(cu(1)).unwrap();
        assert!(t.load(cu(1)).unwrap().is_suspect());
        assert_eq!(t.rank(), vec![cu(2), cu(0), cu(1)]);

        t.clear_suspect(cu(1)).unwrap();
        assert_eq!(t.rank()[0], cu(1));
    }

    #[test]
    fn test_average_commands() {
        let mut t = tracker();
        t.record_commands(cu(0), 2).unwrap();
        t.record_sample(cu(0), 1, 0).unwrap();
        t.record_commands(cu(0), 1).unwrap();
        t.record_sample(cu(0), 1, 0).unwrap();
        t.finalize_window(cu(0)).unwrap();
        assert_eq!(t.load(cu(0)).unwrap().average_commands(), 150);
    }
}
