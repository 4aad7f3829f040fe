pub mod source;

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub use self::source::{DirSource, Dump, DumpSource, S3Source, Source};

/// A router's link-state PDU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lsp {
    /// e.g. `ac10.0001.0000.00-00`
    pub system_id: String,
    pub hostname: String,
    pub router_id: String,
    pub neighbors: Vec<Neighbor>,
}

/// One adjacency advertised in an LSP.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Neighbor {
    pub system_id: String,
    /// Latency in microseconds.
    pub metric: u32,
    pub neighbor_addr: String,
    pub adj_sids: Vec<u32>,
}

// --- JSON dump structures ---

#[derive(Deserialize)]
struct JsonDump {
    #[serde(default)]
    vrfs: BTreeMap<String, JsonVrf>,
}

#[derive(Deserialize)]
struct JsonVrf {
    #[serde(rename = "isisInstances", default)]
    isis_instances: BTreeMap<String, JsonInstance>,
}

#[derive(Deserialize)]
struct JsonInstance {
    #[serde(default)]
    level: BTreeMap<String, JsonLevel>,
}

#[derive(Deserialize)]
struct JsonLevel {
    #[serde(default)]
    lsps: BTreeMap<String, JsonLsp>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct JsonLsp {
    hostname: JsonHostname,
    neighbors: Vec<JsonNeighbor>,
    router_capabilities: JsonRouterCapabilities,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct JsonHostname {
    name: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct JsonNeighbor {
    system_id: String,
    metric: u32,
    neighbor_addr: String,
    adj_sids: Vec<u32>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct JsonRouterCapabilities {
    router_id: String,
}

/// Parses a level-2 LSP database dump of the default VRF, instance 1.
pub fn parse(data: &[u8]) -> Result<Vec<Lsp>> {
    let dump: JsonDump = serde_json::from_slice(data).context("failed to unmarshal JSON")?;

    let vrf = dump
        .vrfs
        .get("default")
        .ok_or_else(|| anyhow!("VRF 'default' not found"))?;
    let instance = vrf
        .isis_instances
        .get("1")
        .ok_or_else(|| anyhow!("IS-IS instance '1' not found"))?;
    let level2 = instance
        .level
        .get("2")
        .ok_or_else(|| anyhow!("IS-IS level '2' not found"))?;

    Ok(level2
        .lsps
        .iter()
        .map(|(system_id, lsp)| Lsp {
            system_id: system_id.clone(),
            hostname: lsp.hostname.name.clone(),
            router_id: lsp.router_capabilities.router_id.clone(),
            neighbors: lsp
                .neighbors
                .iter()
                .map(|n| Neighbor {
                    system_id: n.system_id.clone(),
                    metric: n.metric,
                    neighbor_addr: n.neighbor_addr.clone(),
                    adj_sids: n.adj_sids.clone(),
                })
                .collect(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"{
        "vrfs": {
            "default": {
                "isisInstances": {
                    "1": {
                        "level": {
                            "2": {
                                "lsps": {
                                    "ac10.0001.0000.00-00": {
                                        "hostname": {"name": "DZ-NY7-SW01"},
                                        "routerCapabilities": {"routerId": "172.16.0.1", "srgbBase": 16000},
                                        "neighbors": [
                                            {"systemId": "ac10.0002.0000", "metric": 1000, "neighborAddr": "172.16.0.117", "adjSids": [100001]}
                                        ]
                                    },
                                    "ac10.0002.0000.00-00": {
                                        "hostname": {"name": "DZ-LD4-SW01"}
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }"#;

    #[test]
    fn test_parse_dump() {
        let lsps = parse(DUMP.as_bytes()).expect("parses");
        assert_eq!(lsps.len(), 2);

        let first = &lsps[0];
        assert_eq!(first.system_id, "ac10.0001.0000.00-00");
        assert_eq!(first.hostname, "DZ-NY7-SW01");
        assert_eq!(first.router_id, "172.16.0.1");
        assert_eq!(
            first.neighbors,
            vec![Neighbor {
                system_id: "ac10.0002.0000".to_string(),
                metric: 1000,
                neighbor_addr: "172.16.0.117".to_string(),
                adj_sids: vec![100001],
            }]
        );
        assert!(lsps[1].neighbors.is_empty());
    }

    #[test]
    fn test_parse_missing_levels() {
        let err = parse(br#"{"vrfs": {}}"#).expect_err("no vrf");
        assert_eq!(err.to_string(), "VRF 'default' not found");

        let err = parse(br#"{"vrfs": {"default": {"isisInstances": {}}}}"#).expect_err("no instance");
        assert_eq!(err.to_string(), "IS-IS instance '1' not found");

        let err = parse(br#"{"vrfs": {"default": {"isisInstances": {"1": {"level": {"1": {}}}}}}}"#)
            .expect_err("no level");
        assert_eq!(err.to_string(), "IS-IS level '2' not found");
    }

    #[test]
    fn test_parse_invalid_json() {
        let err = parse(b"not json").expect_err("invalid");
        assert!(err.to_string().contains("failed to unmarshal JSON"));
    }
}
