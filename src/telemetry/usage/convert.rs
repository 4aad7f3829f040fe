use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::baseline::CounterBaselines;
use super::link::{LinkLookup, LinkSide};
use super::sample::{Counter, CounterKey, CounterSample, CounterValues, MaxTimestampsByKey, COUNTER_COUNT};

/// One output row of the usage fact table.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceUsage {
    pub time: DateTime<Utc>,
    pub device_pk: Option<String>,
    pub host: Option<String>,
    pub intf: Option<String>,
    pub user_tunnel_id: Option<i64>,
    pub link_pk: Option<String>,
    pub link_side: Option<LinkSide>,
    pub model_name: Option<String>,
    pub serial_number: Option<String>,
    pub values: CounterValues,
    pub deltas: CounterValues,
    /// Seconds since the previous sample for the same key.
    pub delta_duration: Option<f64>,
}

impl InterfaceUsage {
    fn from_sample(sample: &CounterSample) -> Self {
        Self {
            time: sample.time,
            device_pk: sample.device_pk.clone(),
            host: sample.host.clone(),
            intf: sample.intf.clone(),
            user_tunnel_id: sample.user_tunnel_id,
            link_pk: None,
            link_side: None,
            model_name: sample.model_name.clone(),
            serial_number: sample.serial_number.clone(),
            values: sample.values,
            deltas: [None; COUNTER_COUNT],
            delta_duration: None,
        }
    }

    pub fn value(&self, counter: Counter) -> Option<i64> {
        self.values[counter.index()]
    }

    pub fn delta(&self, counter: Counter) -> Option<i64> {
        self.deltas[counter.index()]
    }
}

/// Forward-fill state for one key, scoped to a single conversion pass.
#[derive(Debug)]
struct KeyState {
    last: CounterValues,
    last_time: Option<DateTime<Utc>>,
    first_row_seen: bool,
}

impl KeyState {
    fn seeded(key: &CounterKey, baselines: &CounterBaselines) -> Self {
        let mut last = [None; COUNTER_COUNT];
        for counter in Counter::SPARSE {
            last[counter.index()] = baselines.get(counter, key);
        }
        Self {
            last,
            last_time: None,
            first_row_seen: false,
        }
    }
}

/// Converts time-ordered samples into usage rows with forward-filled values and deltas.
///
/// The first row of a key that carries any dense counter only seeds state and
/// is not emitted. Rows at or before `already_written[key]` update state but
/// are not emitted either.
pub fn convert(
    samples: &[CounterSample],
    baselines: &CounterBaselines,
    links: &LinkLookup,
    already_written: Option<&MaxTimestampsByKey>,
) -> Vec<InterfaceUsage> {
    let mut states: HashMap<CounterKey, KeyState> = HashMap::new();
    let mut out = Vec::with_capacity(samples.len());

    for sample in samples {
        let Some(key) = sample.key() else {
            out.push(InterfaceUsage::from_sample(sample));
            continue;
        };

        let written = already_written
            .and_then(|m| m.get(&key))
            .is_some_and(|max| sample.time <= *max);

        let state = states
            .entry(key.clone())
            .or_insert_with(|| KeyState::seeded(&key, baselines));

        if !state.first_row_seen {
            state.first_row_seen = true;
            if sample.has_dense_value() {
                for counter in Counter::ALL {
                    if let Some(v) = sample.value(counter) {
                        state.last[counter.index()] = Some(v);
                    }
                }
                state.last_time = Some(sample.time);
                continue;
            }
        }

        let mut row = InterfaceUsage::from_sample(sample);
        for counter in Counter::ALL {
            let idx = counter.index();
            let prev = state.last[idx];
            let value = sample.values[idx].or(prev);
            if let Some(v) = value {
                row.deltas[idx] = prev.and_then(|p| v.checked_sub(p));
                state.last[idx] = Some(v);
            }
            row.values[idx] = value;
        }

        row.delta_duration = state.last_time.map(|prev| seconds_between(prev, sample.time));
        state.last_time = Some(sample.time);

        if let Some(info) = links.get(&key) {
            row.link_pk = Some(info.link_pk.clone());
            row.link_side = Some(info.side);
        }

        if !written {
            out.push(row);
        }
    }

    out
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let d = to - from;
    match d.num_nanoseconds() {
        Some(ns) => ns as f64 / 1e9,
        None => d.num_milliseconds() as f64 / 1e3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::usage::link::LinkInfo;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn sample(secs: i64, pk: &str, intf: &str, values: &[(Counter, i64)]) -> CounterSample {
        let mut s = CounterSample::empty(t(secs));
        s.device_pk = Some(pk.to_string());
        s.intf = Some(intf.to_string());
        for (c, v) in values {
            s.values[c.index()] = Some(*v);
        }
        s
    }

    fn key(pk: &str, intf: &str) -> CounterKey {
        CounterKey::new(pk, intf)
    }

    #[test]
    fn test_sparse_forward_fill() {
        let samples = vec![
            sample(0, "dev1", "eth0", &[(Counter::InErrors, 5)]),
            sample(60, "dev1", "eth0", &[]),
            sample(120, "dev1", "eth0", &[(Counter::InErrors, 9)]),
        ];
        let rows = convert(&samples, &CounterBaselines::new(), &LinkLookup::new(), None);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].value(Counter::InErrors), Some(5));
        assert_eq!(rows[0].delta(Counter::InErrors), None);
        assert_eq!(rows[1].value(Counter::InErrors), Some(5));
        assert_eq!(rows[1].delta(Counter::InErrors), Some(0));
        assert_eq!(rows[2].value(Counter::InErrors), Some(9));
        assert_eq!(rows[2].delta(Counter::InErrors), Some(4));
    }

    #[test]
    fn test_dense_first_row_consumed() {
        let samples = vec![
            sample(0, "dev1", "eth0", &[(Counter::InOctets, 1000)]),
            sample(60, "dev1", "eth0", &[(Counter::InOctets, 2500)]),
        ];
        let rows = convert(&samples, &CounterBaselines::new(), &LinkLookup::new(), None);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time, t(60));
        assert_eq!(rows[0].value(Counter::InOctets), Some(2500));
        assert_eq!(rows[0].delta(Counter::InOctets), Some(1500));
    }

    #[test]
    fn test_sparse_on_consumed_dense_row_is_folded() {
        let mut baselines = CounterBaselines::new();
        baselines.insert(Counter::InErrors, key("dev1", "eth0"), 5);

        let samples = vec![
            sample(0, "dev1", "eth0", &[(Counter::InOctets, 100), (Counter::InErrors, 8)]),
            sample(60, "dev1", "eth0", &[(Counter::InOctets, 200), (Counter::InErrors, 8)]),
        ];
        let rows = convert(&samples, &baselines, &LinkLookup::new(), None);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value(Counter::InErrors), Some(8));
        assert_eq!(rows[0].delta(Counter::InErrors), Some(0));
    }

    #[test]
    fn test_counter_reset_yields_negative_delta() {
        let samples = vec![
            sample(0, "dev1", "eth0", &[(Counter::InOctets, 5000)]),
            sample(60, "dev1", "eth0", &[(Counter::InOctets, 1200)]),
        ];
        let rows = convert(&samples, &CounterBaselines::new(), &LinkLookup::new(), None);

        assert_eq!(rows[0].delta(Counter::InOctets), Some(-3800));
    }

    #[test]
    fn test_overflowing_delta_is_omitted() {
        let samples = vec![
            sample(0, "dev1", "eth0", &[(Counter::InErrors, i64::MIN)]),
            sample(60, "dev1", "eth0", &[(Counter::InErrors, i64::MAX)]),
            sample(120, "dev1", "eth0", &[(Counter::InErrors, i64::MAX)]),
        ];
        let rows = convert(&samples, &CounterBaselines::new(), &LinkLookup::new(), None);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].value(Counter::InErrors), Some(i64::MAX));
        assert_eq!(rows[1].delta(Counter::InErrors), None);
        assert_eq!(rows[2].delta(Counter::InErrors), Some(0));
    }

    #[test]
    fn test_delta_duration() {
        let samples = vec![
            sample(0, "dev1", "eth0", &[(Counter::OutPkts, 10)]),
            sample(90, "dev1", "eth0", &[(Counter::OutPkts, 20)]),
        ];
        let rows = convert(&samples, &CounterBaselines::new(), &LinkLookup::new(), None);

        let duration = rows[0].delta_duration.expect("has duration");
        assert!((duration - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_first_emitted_sparse_row_has_no_duration() {
        let samples = vec![sample(0, "dev1", "eth0", &[(Counter::InErrors, 1)])];
        let rows = convert(&samples, &CounterBaselines::new(), &LinkLookup::new(), None);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].delta_duration, None);
    }

    #[test]
    fn test_sparse_baseline_seeds_first_delta() {
        let mut baselines = CounterBaselines::new();
        baselines.insert(Counter::OutDiscards, key("dev1", "eth0"), 40);

        let samples = vec![sample(0, "dev1", "eth0", &[(Counter::OutDiscards, 42)])];
        let rows = convert(&samples, &baselines, &LinkLookup::new(), None);

        assert_eq!(rows[0].value(Counter::OutDiscards), Some(42));
        assert_eq!(rows[0].delta(Counter::OutDiscards), Some(2));
    }

    #[test]
    fn test_baseline_forward_fills_missing_sparse_value() {
        let mut baselines = CounterBaselines::new();
        baselines.insert(Counter::InDiscards, key("dev1", "eth0"), 7);

        let samples = vec![
            sample(0, "dev1", "eth0", &[(Counter::InOctets, 100)]),
            sample(60, "dev1", "eth0", &[(Counter::InOctets, 200)]),
        ];
        let rows = convert(&samples, &baselines, &LinkLookup::new(), None);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value(Counter::InDiscards), Some(7));
        assert_eq!(rows[0].delta(Counter::InDiscards), Some(0));
    }

    #[test]
    fn test_sparse_only_first_row_leaves_dense_unseeded() {
        let samples = vec![
            sample(0, "dev1", "eth0", &[(Counter::InErrors, 1)]),
            sample(60, "dev1", "eth0", &[(Counter::InOctets, 500)]),
            sample(120, "dev1", "eth0", &[(Counter::InOctets, 800)]),
        ];
        let rows = convert(&samples, &CounterBaselines::new(), &LinkLookup::new(), None);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].value(Counter::InOctets), Some(500));
        assert_eq!(rows[1].delta(Counter::InOctets), None);
        assert_eq!(rows[1].value(Counter::InErrors), Some(1));
        assert_eq!(rows[2].delta(Counter::InOctets), Some(300));
    }

    #[test]
    fn test_dedup_skips_written_rows_but_keeps_state() {
        let samples = vec![
            sample(0, "dev1", "eth0", &[(Counter::InOctets, 100)]),
            sample(60, "dev1", "eth0", &[(Counter::InOctets, 150)]),
            sample(120, "dev1", "eth0", &[(Counter::InOctets, 175)]),
        ];
        let written = MaxTimestampsByKey::from([(key("dev1", "eth0"), t(60))]);
        let rows = convert(
            &samples,
            &CounterBaselines::new(),
            &LinkLookup::new(),
            Some(&written),
        );

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time, t(120));
        assert_eq!(rows[0].delta(Counter::InOctets), Some(25));
    }

    #[test]
    fn test_dedup_monotonic_on_refeed() {
        let samples: Vec<CounterSample> = (0..10)
            .map(|i| sample(i * 30, "dev1", "eth0", &[(Counter::OutOctets, i * 1000)]))
            .collect();
        let baselines = CounterBaselines::new();
        let links = LinkLookup::new();

        let first = convert(&samples, &baselines, &links, None);
        let max = first.iter().map(|r| r.time).max().expect("rows emitted");
        let written = MaxTimestampsByKey::from([(key("dev1", "eth0"), max)]);

        let again = convert(&samples, &baselines, &links, Some(&written));
        assert!(again.is_empty());

        let cut = MaxTimestampsByKey::from([(key("dev1", "eth0"), t(150))]);
        let partial = convert(&samples, &baselines, &links, Some(&cut));
        assert!(partial.iter().all(|r| r.time > t(150)));
        assert_eq!(partial.len(), 4);
    }

    #[test]
    fn test_dedup_is_per_key() {
        let samples = vec![
            sample(0, "dev1", "eth0", &[(Counter::InErrors, 1)]),
            sample(0, "dev2", "eth0", &[(Counter::InErrors, 1)]),
        ];
        let written = MaxTimestampsByKey::from([(key("dev1", "eth0"), t(0))]);
        let rows = convert(
            &samples,
            &CounterBaselines::new(),
            &LinkLookup::new(),
            Some(&written),
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_pk.as_deref(), Some("dev2"));
    }

    #[test]
    fn test_keyless_rows_pass_through() {
        let mut keyless = CounterSample::empty(t(0));
        keyless.host = Some("ny5-dz01".to_string());
        keyless.values[Counter::InOctets.index()] = Some(10);

        let rows = convert(
            &[keyless.clone(), keyless],
            &CounterBaselines::new(),
            &LinkLookup::new(),
            None,
        );

        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.value(Counter::InOctets), Some(10));
            assert_eq!(row.delta(Counter::InOctets), None);
            assert_eq!(row.delta_duration, None);
        }
    }

    #[test]
    fn test_link_attached() {
        let mut links = LinkLookup::new();
        links.insert(
            key("dev1", "eth0"),
            LinkInfo {
                link_pk: "link1".to_string(),
                side: LinkSide::Z,
            },
        );
        let samples = vec![
            sample(0, "dev1", "eth0", &[(Counter::InErrors, 1)]),
            sample(0, "dev1", "Tunnel500", &[(Counter::InErrors, 1)]),
        ];
        let rows = convert(&samples, &CounterBaselines::new(), &links, None);

        assert_eq!(rows[0].link_pk.as_deref(), Some("link1"));
        assert_eq!(rows[0].link_side, Some(LinkSide::Z));
        assert_eq!(rows[1].link_pk, None);
    }

    #[test]
    fn test_keys_are_independent() {
        let samples = vec![
            sample(0, "dev1", "eth0", &[(Counter::InOctets, 100)]),
            sample(0, "dev1", "eth1", &[(Counter::InOctets, 5000)]),
            sample(60, "dev1", "eth0", &[(Counter::InOctets, 110)]),
            sample(60, "dev1", "eth1", &[(Counter::InOctets, 5100)]),
        ];
        let rows = convert(&samples, &CounterBaselines::new(), &LinkLookup::new(), None);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].delta(Counter::InOctets), Some(10));
        assert_eq!(rows[1].delta(Counter::InOctets), Some(100));
    }
}
