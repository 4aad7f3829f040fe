use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// Number of tracked interface counters.
pub const COUNTER_COUNT: usize = 16;

/// Interface counters reported by device telemetry, in column order.
///
/// Sparse counters are only reported by devices when they change, so a
/// missing value usually means "unchanged" rather than "zero".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Counter {
    CarrierTransitions,
    InBroadcastPkts,
    InDiscards,
    InErrors,
    InFcsErrors,
    InMulticastPkts,
    InOctets,
    InPkts,
    InUnicastPkts,
    OutBroadcastPkts,
    OutDiscards,
    OutErrors,
    OutMulticastPkts,
    OutOctets,
    OutPkts,
    OutUnicastPkts,
}

impl Counter {
    pub const ALL: [Counter; COUNTER_COUNT] = [
        Counter::CarrierTransitions,
        Counter::InBroadcastPkts,
        Counter::InDiscards,
        Counter::InErrors,
        Counter::InFcsErrors,
        Counter::InMulticastPkts,
        Counter::InOctets,
        Counter::InPkts,
        Counter::InUnicastPkts,
        Counter::OutBroadcastPkts,
        Counter::OutDiscards,
        Counter::OutErrors,
        Counter::OutMulticastPkts,
        Counter::OutOctets,
        Counter::OutPkts,
        Counter::OutUnicastPkts,
    ];

    /// Counters seeded from a pre-window baseline.
    pub const SPARSE: [Counter; 5] = [
        Counter::InDiscards,
        Counter::InErrors,
        Counter::InFcsErrors,
        Counter::OutDiscards,
        Counter::OutErrors,
    ];

    /// Position in [`Counter::ALL`].
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn is_sparse(self) -> bool {
        matches!(
            self,
            Counter::InDiscards
                | Counter::InErrors
                | Counter::InFcsErrors
                | Counter::OutDiscards
                | Counter::OutErrors
        )
    }

    /// Field name in the time-series `intfCounters` table.
    pub const fn source_name(self) -> &'static str {
        match self {
            Counter::CarrierTransitions => "carrier-transitions",
            Counter::InBroadcastPkts => "in-broadcast-pkts",
            Counter::InDiscards => "in-discards",
            Counter::InErrors => "in-errors",
            Counter::InFcsErrors => "in-fcs-errors",
            Counter::InMulticastPkts => "in-multicast-pkts",
            Counter::InOctets => "in-octets",
            Counter::InPkts => "in-pkts",
            Counter::InUnicastPkts => "in-unicast-pkts",
            Counter::OutBroadcastPkts => "out-broadcast-pkts",
            Counter::OutDiscards => "out-discards",
            Counter::OutErrors => "out-errors",
            Counter::OutMulticastPkts => "out-multicast-pkts",
            Counter::OutOctets => "out-octets",
            Counter::OutPkts => "out-pkts",
            Counter::OutUnicastPkts => "out-unicast-pkts",
        }
    }

    /// Column name in the ClickHouse fact table.
    pub const fn column(self) -> &'static str {
        match self {
            Counter::CarrierTransitions => "carrier_transitions",
            Counter::InBroadcastPkts => "in_broadcast_pkts",
            Counter::InDiscards => "in_discards",
            Counter::InErrors => "in_errors",
            Counter::InFcsErrors => "in_fcs_errors",
            Counter::InMulticastPkts => "in_multicast_pkts",
            Counter::InOctets => "in_octets",
            Counter::InPkts => "in_pkts",
            Counter::InUnicastPkts => "in_unicast_pkts",
            Counter::OutBroadcastPkts => "out_broadcast_pkts",
            Counter::OutDiscards => "out_discards",
            Counter::OutErrors => "out_errors",
            Counter::OutMulticastPkts => "out_multicast_pkts",
            Counter::OutOctets => "out_octets",
            Counter::OutPkts => "out_pkts",
            Counter::OutUnicastPkts => "out_unicast_pkts",
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source_name())
    }
}

/// Identity of one interface on one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey {
    pub device_pk: String,
    pub intf: String,
}

impl CounterKey {
    pub fn new(device_pk: impl Into<String>, intf: impl Into<String>) -> Self {
        Self {
            device_pk: device_pk.into(),
            intf: intf.into(),
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_pk, self.intf)
    }
}

/// Counter values indexed by [`Counter::index`].
pub type CounterValues = [Option<i64>; COUNTER_COUNT];

/// One raw telemetry row.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterSample {
    pub time: DateTime<Utc>,
    pub device_pk: Option<String>,
    pub host: Option<String>,
    pub intf: Option<String>,
    pub model_name: Option<String>,
    pub serial_number: Option<String>,
    pub user_tunnel_id: Option<i64>,
    pub values: CounterValues,
}

impl CounterSample {
    /// A sample with no identity and no values.
    pub fn empty(time: DateTime<Utc>) -> Self {
        Self {
            time,
            device_pk: None,
            host: None,
            intf: None,
            model_name: None,
            serial_number: None,
            user_tunnel_id: None,
            values: [None; COUNTER_COUNT],
        }
    }

    /// Extracts a sample from a loosely typed time-series row.
    ///
    /// Returns `None` when the row has no parseable timestamp.
    pub fn from_row(row: &serde_json::Map<String, Value>) -> Option<Self> {
        let time = row.get("time").and_then(parse_time)?;

        let mut sample = Self::empty(time);
        sample.device_pk = extract_string(row.get("dzd_pubkey"));
        sample.host = extract_string(row.get("host"));
        sample.intf = extract_string(row.get("intf"));
        sample.model_name = extract_string(row.get("model_name"));
        sample.serial_number = extract_string(row.get("serial_number"));
        sample.user_tunnel_id = sample.intf.as_deref().and_then(tunnel_id);

        for counter in Counter::ALL {
            sample.values[counter.index()] = extract_int(row.get(counter.source_name()));
        }

        Some(sample)
    }

    /// Key for per-interface state, present only when both parts are.
    pub fn key(&self) -> Option<CounterKey> {
        match (&self.device_pk, &self.intf) {
            (Some(pk), Some(intf)) if !pk.is_empty() && !intf.is_empty() => {
                Some(CounterKey::new(pk.as_str(), intf.as_str()))
            }
            _ => None,
        }
    }

    pub fn value(&self, counter: Counter) -> Option<i64> {
        self.values[counter.index()]
    }

    /// Whether any non-sparse counter carries a value.
    pub fn has_dense_value(&self) -> bool {
        Counter::ALL
            .iter()
            .any(|c| !c.is_sparse() && self.values[c.index()].is_some())
    }
}

/// Parses the timestamp encodings found in time-series results.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f] +zzzz UTC`, and zone-less
/// `YYYY-MM-DD[T ]HH:MM:SS[.f]` (read as UTC).
pub fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }

    if let Ok(t) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f %z UTC") {
        return Some(t.with_timezone(&Utc));
    }

    if let Ok(t) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f %z") {
        return Some(t.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(t.and_utc());
        }
    }

    None
}

/// Strings pass through; other non-null scalars use their display form.
pub(crate) fn extract_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Integers, truncated floats, and decimal strings.
pub(crate) fn extract_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
            .or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// `Tunnel<N>` interfaces carry the user tunnel id.
pub fn tunnel_id(intf: &str) -> Option<i64> {
    intf.strip_prefix("Tunnel")?.parse::<i64>().ok()
}

/// Maximum persisted event time per key.
pub type MaxTimestampsByKey = HashMap<CounterKey, DateTime<Utc>>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn row(v: Value) -> serde_json::Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_counter_tables_are_consistent() {
        for (idx, counter) in Counter::ALL.iter().enumerate() {
            assert_eq!(counter.index(), idx);
            assert_eq!(counter.column(), counter.source_name().replace('-', "_"));
        }
        let sparse: Vec<Counter> = Counter::ALL.into_iter().filter(|c| c.is_sparse()).collect();
        assert_eq!(sparse, Counter::SPARSE.to_vec());
    }

    #[test]
    fn test_parse_time_formats() {
        let want = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();

        for s in [
            "2024-01-15T10:30:00Z",
            "2024-01-15T10:30:00.000000000Z",
            "2024-01-15T10:30:00+00:00",
            "2024-01-15 10:30:00 +0000 UTC",
            "2024-01-15 10:30:00.000 +0000 UTC",
            "2024-01-15 10:30:00.000000 +0000 UTC",
            "2024-01-15 10:30:00.000000000 +0000 UTC",
            "2024-01-15T10:30:00",
            "2024-01-15 10:30:00",
        ] {
            assert_eq!(parse_time(&json!(s)), Some(want), "format {s}");
        }
    }

    #[test]
    fn test_parse_time_keeps_nanoseconds() {
        let t = parse_time(&json!("2024-01-15T10:30:00.123456789Z")).expect("parses");
        assert_eq!(t.timestamp_subsec_nanos(), 123_456_789);
    }

    #[test]
    fn test_parse_time_offset_normalised() {
        let t = parse_time(&json!("2024-01-15 12:30:00 +0200 UTC")).expect("parses");
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_time_rejects_garbage() {
        assert_eq!(parse_time(&json!("yesterday")), None);
        assert_eq!(parse_time(&json!("")), None);
        assert_eq!(parse_time(&json!(12345)), None);
    }

    #[test]
    fn test_extract_int_variants() {
        assert_eq!(extract_int(Some(&json!(42))), Some(42));
        assert_eq!(extract_int(Some(&json!(42.9))), Some(42));
        assert_eq!(extract_int(Some(&json!("17"))), Some(17));
        assert_eq!(extract_int(Some(&json!("n/a"))), None);
        assert_eq!(extract_int(Some(&Value::Null)), None);
        assert_eq!(extract_int(None), None);
    }

    #[test]
    fn test_extract_string_formats_non_strings() {
        assert_eq!(extract_string(Some(&json!("eth0"))), Some("eth0".to_string()));
        assert_eq!(extract_string(Some(&json!(7))), Some("7".to_string()));
        assert_eq!(extract_string(Some(&Value::Null)), None);
    }

    #[test]
    fn test_tunnel_id() {
        assert_eq!(tunnel_id("Tunnel501"), Some(501));
        assert_eq!(tunnel_id("Tunnel"), None);
        assert_eq!(tunnel_id("Ethernet1"), None);
    }

    #[test]
    fn test_from_row() {
        let r = row(json!({
            "time": "2024-01-15T10:30:00Z",
            "dzd_pubkey": "dev1",
            "host": "ny5-dz01",
            "intf": "Tunnel500",
            "model_name": "7280CR3A",
            "serial_number": "SN1",
            "in-octets": 1000,
            "in-errors": "3",
            "out-pkts": 12.0,
        }));
        let sample = CounterSample::from_row(&r).expect("has time");
        assert_eq!(sample.key(), Some(CounterKey::new("dev1", "Tunnel500")));
        assert_eq!(sample.user_tunnel_id, Some(500));
        assert_eq!(sample.value(Counter::InOctets), Some(1000));
        assert_eq!(sample.value(Counter::InErrors), Some(3));
        assert_eq!(sample.value(Counter::OutPkts), Some(12));
        assert_eq!(sample.value(Counter::OutOctets), None);
        assert!(sample.has_dense_value());
    }

    #[test]
    fn test_from_row_without_time() {
        let r = row(json!({"dzd_pubkey": "dev1", "intf": "eth0"}));
        assert!(CounterSample::from_row(&r).is_none());
    }

    #[test]
    fn test_key_requires_both_parts() {
        let mut sample = CounterSample::empty(Utc::now());
        sample.device_pk = Some("dev1".to_string());
        assert!(sample.key().is_none());
        sample.intf = Some(String::new());
        assert!(sample.key().is_none());
        sample.intf = Some("eth0".to_string());
        assert_eq!(sample.key().map(|k| k.to_string()), Some("dev1:eth0".to_string()));
    }

    #[test]
    fn test_sparse_only_row_has_no_dense_value() {
        let mut sample = CounterSample::empty(Utc::now());
        sample.values[Counter::InErrors.index()] = Some(5);
        assert!(!sample.has_dense_value());
    }
}
