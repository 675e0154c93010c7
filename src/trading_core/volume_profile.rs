//! Volume profile over a bar window
//!
//! Each bar's volume is spread evenly across every tick level it traded
//! through. From the level curve we derive the POC, the value area and
//! high/low volume nodes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::bars::Bar;

const EPS: f64 = 1e-9;

/// Point of control plus value-area bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueArea {
    pub poc: f64,
    pub vah: f64,
    pub val: f64,
}

impl ValueArea {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.val && price <= self.vah
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeProfile {
    tick_size: f64,
    /// Tick index -> accumulated volume
    levels: BTreeMap<i64, f64>,
}

impl VolumeProfile {
    pub fn from_bars<'a, I>(bars: I, tick_size: f64) -> Self
    where
        I: IntoIterator<Item = &'a Bar>,
    {
        let mut levels = BTreeMap::new();
        for bar in bars {
            if bar.volume <= 0.0 {
                continue;
            }
            let low_key = (bar.low / tick_size).round() as i64;
            let high_key = (bar.high / tick_size).round() as i64;
            let count = (high_key - low_key + 1) as f64;
            let per_level = bar.volume / count;
            for key in low_key..=high_key {
                *levels.entry(key).or_insert(0.0) += per_level;
            }
        }
        Self { tick_size, levels }
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn total_volume(&self) -> f64 {
        self.levels.values().sum()
    }

    /// (price, volume) pairs in ascending price order
    pub fn levels(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.levels
            .iter()
            .map(|(k, v)| (*k as f64 * self.tick_size, *v))
    }

    pub fn volume_at(&self, price: f64) -> f64 {
        let key = (price / self.tick_size).round() as i64;
        self.levels.get(&key).copied().unwrap_or(0.0)
    }

    /// Contiguous level curve from the lowest to the highest traded level.
    /// Untraded levels inside the range read as zero.
    fn dense(&self) -> Option<(i64, Vec<f64>)> {
        let (&first, _) = self.levels.iter().next()?;
        let (&last, _) = self.levels.iter().next_back()?;
        let curve = (first..=last)
            .map(|k| self.levels.get(&k).copied().unwrap_or(0.0))
            .collect();
        Some((first, curve))
    }

    fn price_of(&self, base: i64, idx: usize) -> f64 {
        (base + idx as i64) as f64 * self.tick_size
    }

    /// Index of the max-volume level. Ties go to the level nearest the
    /// middle of the traded range, then to the lower price.
    fn poc_index(curve: &[f64]) -> Option<usize> {
        let mid = (curve.len() - 1) as f64 / 2.0;
        let mut best: Option<usize> = None;
        for (i, &v) in curve.iter().enumerate() {
            best = match best {
                None => Some(i),
                Some(b) if v > curve[b] => Some(i),
                Some(b) if v == curve[b] && (i as f64 - mid).abs() < (b as f64 - mid).abs() => {
                    Some(i)
                }
                keep => keep,
            };
        }
        best.filter(|&b| curve[b] > 0.0)
    }

    pub fn poc(&self) -> Option<f64> {
        let (base, curve) = self.dense()?;
        Self::poc_index(&curve).map(|i| self.price_of(base, i))
    }

    /// Smallest band around the POC holding `fraction` of the volume.
    pub fn value_area(&self, fraction: f64) -> Option<ValueArea> {
        let (base, curve) = self.dense()?;
        let poc = Self::poc_index(&curve)?;
        let total: f64 = curve.iter().sum();
        let target = total * fraction;

        let mut lo = poc;
        let mut hi = poc;
        let mut included = curve[poc];

        while included < target - EPS {
            let can_lo = lo > 0;
            let can_hi = hi + 1 < curve.len();
            let take_high = match (can_lo, can_hi) {
                (false, false) => break,
                (false, true) => true,
                (true, false) => false,
                (true, true) => {
                    let below = curve[lo - 1];
                    let above = curve[hi + 1];
                    if above != below {
                        above > below
                    } else {
                        // Equal candidates: grow toward the band's volume median
                        let median = band_median(&curve[lo..=hi]) + lo;
                        let dist_below = median - (lo - 1);
                        let dist_above = (hi + 1) - median;
                        dist_above <= dist_below
                    }
                }
            };
            if take_high {
                hi += 1;
                included += curve[hi];
            } else {
                lo -= 1;
                included += curve[lo];
            }
        }

        Some(ValueArea {
            poc: self.price_of(base, poc),
            vah: self.price_of(base, hi),
            val: self.price_of(base, lo),
        })
    }

    /// High and low volume nodes: local extrema of the 3-level smoothed curve.
    ///
    /// Plateaus count once at their middle. At most `max_nodes` of each kind
    /// are kept (the strongest HVNs, the thinnest LVNs), returned in price order.
    pub fn volume_nodes(&self, max_nodes: usize) -> (Vec<f64>, Vec<f64>) {
        let Some((base, curve)) = self.dense() else {
            return (Vec::new(), Vec::new());
        };
        if curve.len() < 3 || max_nodes == 0 {
            return (Vec::new(), Vec::new());
        }

        let smooth: Vec<f64> = (0..curve.len())
            .map(|i| {
                let from = i.saturating_sub(1);
                let to = (i + 1).min(curve.len() - 1);
                let window = &curve[from..=to];
                window.iter().sum::<f64>() / window.len() as f64
            })
            .collect();

        let mut peaks: Vec<(usize, f64)> = Vec::new();
        let mut troughs: Vec<(usize, f64)> = Vec::new();

        let mut start = 0;
        while start < smooth.len() {
            let mut end = start;
            while end + 1 < smooth.len() && (smooth[end + 1] - smooth[start]).abs() < EPS {
                end += 1;
            }
            if start > 0 && end + 1 < smooth.len() {
                let left = smooth[start - 1];
                let right = smooth[end + 1];
                let value = smooth[start];
                let mid = (start + end) / 2;
                if value > left + EPS && value > right + EPS {
                    peaks.push((mid, value));
                } else if value < left - EPS && value < right - EPS && curve[mid] > 0.0 {
                    troughs.push((mid, value));
                }
            }
            start = end + 1;
        }

        peaks.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        troughs.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let to_prices = |mut nodes: Vec<(usize, f64)>| {
            nodes.truncate(max_nodes);
            let mut prices: Vec<f64> = nodes.iter().map(|(i, _)| self.price_of(base, *i)).collect();
            prices.sort_by(f64::total_cmp);
            prices
        };
        (to_prices(peaks), to_prices(troughs))
    }
}

/// Index of the volume-weighted median inside a band
fn band_median(band: &[f64]) -> usize {
    let half = band.iter().sum::<f64>() / 2.0;
    let mut running = 0.0;
    for (i, v) in band.iter().enumerate() {
        running += v;
        if running >= half {
            return i;
        }
    }
    band.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bar(i: i64, low: f64, high: f64, volume: f64) -> Bar {
        let ts = Utc.with_ymd_and_hms(2025, 3, 4, 15, 0, 0).unwrap() + Duration::minutes(i);
        Bar::new(ts, low, high, low, high, volume / 2.0, volume / 2.0)
    }

    /// Profile with one bar per level, volumes as given, starting at 100.00
    fn shaped(volumes: &[f64]) -> VolumeProfile {
        let bars: Vec<Bar> = volumes
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let p = 100.0 + i as f64 * 0.25;
                bar(i as i64, p, p, *v)
            })
            .collect();
        VolumeProfile::from_bars(&bars, 0.25)
    }

    #[test]
    fn test_level_volumes_sum_to_window_total() {
        let bars = vec![
            bar(0, 100.0, 101.5, 1234.0),
            bar(1, 100.75, 103.0, 987.0),
            bar(2, 99.25, 100.0, 55.5),
            bar(3, 102.0, 102.0, 10.0),
        ];
        let total: f64 = bars.iter().map(|b| b.volume).sum();
        let profile = VolumeProfile::from_bars(&bars, 0.25);
        assert!((profile.total_volume() - total).abs() < 1e-6);
        let summed: f64 = profile.levels().map(|(_, v)| v).sum();
        assert!((summed - total).abs() < 1e-6);
    }

    #[test]
    fn test_poc_and_value_area() {
        let profile = shaped(&[10.0, 20.0, 50.0, 100.0, 40.0, 30.0, 5.0]);
        assert_eq!(profile.poc(), Some(100.75));

        // total 255, target 178.5: 100 -> +50 (150) -> +40 (190)
        let va = profile.value_area(0.70).unwrap();
        assert_eq!(va.poc, 100.75);
        assert_eq!(va.val, 100.5);
        assert_eq!(va.vah, 101.0);
        assert!(va.contains(100.75));
        assert!(!va.contains(101.25));
    }

    #[test]
    fn test_value_area_tie_grows_toward_median() {
        // Band starts at the POC (index 2, vol 100); neighbours tie at 30.
        // Band median sits on the POC so both sides are equidistant: upper first.
        let profile = shaped(&[5.0, 30.0, 100.0, 30.0, 5.0]);
        let va = profile.value_area(0.76).unwrap();
        assert_eq!(va.val, 100.5);
        assert_eq!(va.vah, 100.75);

        // After taking 100.25 (vol 40 beats 20) the band [100.25, 100.5] has its
        // median at 100.5. The next candidates tie at 20; 100.75 is nearer.
        let profile = shaped(&[20.0, 40.0, 60.0, 20.0, 1.0]);
        let va = profile.value_area(0.95).unwrap();
        assert_eq!(va.poc, 100.5);
        assert_eq!(va.val, 100.0);
        assert_eq!(va.vah, 100.75);
    }

    #[test]
    fn test_value_area_gap_levels() {
        let bars = vec![bar(0, 100.0, 100.0, 100.0), bar(1, 101.0, 101.0, 90.0)];
        let profile = VolumeProfile::from_bars(&bars, 0.25);
        let va = profile.value_area(0.70).unwrap();
        assert_eq!(va.poc, 100.0);
        // target 133: must cross the untraded gap to reach 101.00
        assert_eq!(va.val, 100.0);
        assert_eq!(va.vah, 101.0);
    }

    #[test]
    fn test_zero_volume_window_is_empty() {
        let bars = vec![bar(0, 100.0, 101.0, 0.0), bar(1, 100.0, 101.0, 0.0)];
        let profile = VolumeProfile::from_bars(&bars, 0.25);
        assert!(profile.is_empty());
        assert_eq!(profile.poc(), None);
        assert_eq!(profile.value_area(0.7), None);
        assert_eq!(profile.volume_nodes(5), (Vec::new(), Vec::new()));
    }

    #[test]
    fn test_volume_nodes() {
        // Two humps separated by a thin area
        let profile = shaped(&[
            10.0, 40.0, 90.0, 40.0, 10.0, 5.0, 10.0, 60.0, 120.0, 60.0, 10.0,
        ]);
        let (hvn, lvn) = profile.volume_nodes(5);
        assert_eq!(hvn, vec![100.5, 102.0]);
        assert_eq!(lvn, vec![101.25]);

        let (hvn, _) = profile.volume_nodes(1);
        assert_eq!(hvn, vec![102.0]);
    }

    #[test]
    fn test_spread_across_range() {
        let profile = VolumeProfile::from_bars(&[bar(0, 100.0, 101.0, 500.0)], 0.25);
        assert_eq!(profile.levels().count(), 5);
        assert_eq!(profile.volume_at(100.5), 100.0);
    }
}
