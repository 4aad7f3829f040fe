use std::collections::HashMap;

use super::sample::CounterKey;

/// Which end of a link an interface sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSide {
    A,
    Z,
}

impl LinkSide {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkSide::A => "A",
            LinkSide::Z => "Z",
        }
    }
}

/// Link attribution for one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub link_pk: String,
    pub side: LinkSide,
}

/// Current link endpoints as stored in the topology dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkEndpoints {
    pub pk: String,
    pub side_a_pk: String,
    pub side_a_iface_name: String,
    pub side_z_pk: String,
    pub side_z_iface_name: String,
}

pub type LinkLookup = HashMap<CounterKey, LinkInfo>;

/// Maps each endpoint interface to its link and side.
///
/// Endpoints with an empty device key or interface name are skipped.
pub fn build_link_lookup(links: &[LinkEndpoints]) -> LinkLookup {
    let mut lookup = HashMap::with_capacity(links.len() * 2);

    for link in links {
        let sides = [
            (&link.side_a_pk, &link.side_a_iface_name, LinkSide::A),
            (&link.side_z_pk, &link.side_z_iface_name, LinkSide::Z),
        ];
        for (device_pk, iface, side) in sides {
            if device_pk.is_empty() || iface.is_empty() {
                continue;
            }
            lookup.insert(
                CounterKey::new(device_pk.as_str(), iface.as_str()),
                LinkInfo {
                    link_pk: link.pk.clone(),
                    side,
                },
            );
        }
    }

    lookup
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(pk: &str, a: (&str, &str), z: (&str, &str)) -> LinkEndpoints {
        LinkEndpoints {
            pk: pk.to_string(),
            side_a_pk: a.0.to_string(),
            side_a_iface_name: a.1.to_string(),
            side_z_pk: z.0.to_string(),
            side_z_iface_name: z.1.to_string(),
        }
    }

    #[test]
    fn test_build_link_lookup_both_sides() {
        let lookup = build_link_lookup(&[link("link1", ("dev1", "eth0"), ("dev2", "eth1"))]);
        assert_eq!(lookup.len(), 2);
        assert_eq!(
            lookup.get(&CounterKey::new("dev1", "eth0")),
            Some(&LinkInfo {
                link_pk: "link1".to_string(),
                side: LinkSide::A
            })
        );
        assert_eq!(
            lookup.get(&CounterKey::new("dev2", "eth1")).map(|l| l.side),
            Some(LinkSide::Z)
        );
    }

    #[test]
    fn test_build_link_lookup_skips_incomplete_endpoints() {
        let lookup = build_link_lookup(&[
            link("link1", ("dev1", ""), ("dev2", "eth1")),
            link("link2", ("", "eth0"), ("", "")),
        ]);
        assert_eq!(lookup.len(), 1);
        assert!(lookup.contains_key(&CounterKey::new("dev2", "eth1")));
    }

    #[test]
    fn test_build_link_lookup_empty() {
        assert!(build_link_lookup(&[]).is_empty());
    }
}
