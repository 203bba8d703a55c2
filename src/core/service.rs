//! Protocol specifications and service normalization
//!
//! A [`Prt`] is one protocol entry of a service (`ip`, `tcp 80`,
//! `udp 1000-2000:53`, `icmp 8/0`, `proto 50`). Services are normalized
//! once per run so that later comparisons can use plain interval
//! containment.

use crate::core::diag::{DiagKind, Diagnostics, Staged};
use crate::core::model::{Model, ServiceId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Inclusive port interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    pub const ALL: PortRange = PortRange { lo: 1, hi: 65535 };

    pub const fn single(port: u16) -> Self {
        Self { lo: port, hi: port }
    }

    pub const fn contains(&self, other: &PortRange) -> bool {
        self.lo <= other.lo && other.hi <= self.hi
    }

    pub const fn is_all(&self) -> bool {
        self.lo == 1 && self.hi == 65535
    }

    /// Overlapping or directly adjacent ranges can be joined into one.
    const fn touches(&self, other: &PortRange) -> bool {
        self.lo <= other.hi.saturating_add(1) && other.lo <= self.hi.saturating_add(1)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lo == self.hi {
            write!(f, "{}", self.lo)
        } else {
            write!(f, "{}-{}", self.lo, self.hi)
        }
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_port = |p: &str| -> Result<u16, String> {
            match p.trim().parse::<u16>() {
                Ok(0) | Err(_) => Err(format!("Invalid port '{p}'")),
                Ok(port) => Ok(port),
            }
        };
        let range = if let Some((lo, hi)) = s.split_once('-') {
            PortRange {
                lo: parse_port(lo)?,
                hi: parse_port(hi)?,
            }
        } else {
            PortRange::single(parse_port(s)?)
        };
        if range.lo > range.hi {
            return Err(format!("Invalid port range '{s}'"));
        }
        Ok(range)
    }
}

/// One protocol entry.
///
/// Serialized in its text form, e.g. `"tcp 80"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Prt {
    /// Any IP traffic
    Ip,
    Tcp {
        src: PortRange,
        dst: PortRange,
        /// Only packets of established connections (reverse rules)
        established: bool,
    },
    Udp {
        src: PortRange,
        dst: PortRange,
    },
    Icmp {
        ty: Option<u8>,
        code: Option<u8>,
    },
    /// Other IP protocol by number
    Proto(u8),
}

impl Prt {
    pub const fn tcp(dst: PortRange) -> Self {
        Prt::Tcp {
            src: PortRange::ALL,
            dst,
            established: false,
        }
    }

    pub const fn udp(dst: PortRange) -> Self {
        Prt::Udp {
            src: PortRange::ALL,
            dst,
        }
    }

    /// Returns `true` if every packet matched by `other` is matched by `self`.
    pub fn contains(&self, other: &Prt) -> bool {
        match (self, other) {
            (Prt::Ip, _) => true,
            (
                Prt::Tcp {
                    src: s1,
                    dst: d1,
                    established: e1,
                },
                Prt::Tcp {
                    src: s2,
                    dst: d2,
                    established: e2,
                },
            ) => s1.contains(s2) && d1.contains(d2) && (!*e1 || *e2),
            (Prt::Udp { src: s1, dst: d1 }, Prt::Udp { src: s2, dst: d2 }) => {
                s1.contains(s2) && d1.contains(d2)
            }
            (Prt::Icmp { ty: t1, code: c1 }, Prt::Icmp { ty: t2, code: c2 }) => match (t1, t2) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(a), Some(b)) => a == b && (c1.is_none() || c1 == c2),
            },
            (Prt::Proto(a), Prt::Proto(b)) => a == b,
            _ => false,
        }
    }

    /// Protocol entry for packets flowing back from destination to source.
    pub fn reverse(&self) -> Prt {
        match *self {
            Prt::Tcp { src, dst, .. } => Prt::Tcp {
                src: dst,
                dst: src,
                established: true,
            },
            Prt::Udp { src, dst } => Prt::Udp { src: dst, dst: src },
            // echo request -> echo reply
            Prt::Icmp { ty: Some(8), .. } => Prt::Icmp {
                ty: Some(0),
                code: Some(0),
            },
            other => other,
        }
    }

    /// IP protocol number, `None` for [`Prt::Ip`].
    pub const fn proto_number(&self) -> Option<u8> {
        match self {
            Prt::Ip => None,
            Prt::Tcp { .. } => Some(6),
            Prt::Udp { .. } => Some(17),
            Prt::Icmp { .. } => Some(1),
            Prt::Proto(n) => Some(*n),
        }
    }
}

impl fmt::Display for Prt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ports = |f: &mut fmt::Formatter<'_>, src: &PortRange, dst: &PortRange| {
            if src.is_all() {
                write!(f, "{dst}")
            } else {
                write!(f, "{src}:{dst}")
            }
        };
        match self {
            Prt::Ip => write!(f, "ip"),
            Prt::Tcp {
                src,
                dst,
                established,
            } => {
                write!(f, "tcp ")?;
                ports(f, src, dst)?;
                if *established {
                    write!(f, " established")?;
                }
                Ok(())
            }
            Prt::Udp { src, dst } => {
                write!(f, "udp ")?;
                ports(f, src, dst)
            }
            Prt::Icmp { ty: None, .. } => write!(f, "icmp"),
            Prt::Icmp {
                ty: Some(t),
                code: None,
            } => write!(f, "icmp {t}"),
            Prt::Icmp {
                ty: Some(t),
                code: Some(c),
            } => write!(f, "icmp {t}/{c}"),
            Prt::Proto(n) => write!(f, "proto {n}"),
        }
    }
}

impl FromStr for Prt {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let (name, args) = text
            .split_once(char::is_whitespace)
            .map_or((text, ""), |(n, a)| (n, a.trim()));
        match name {
            "ip" if args.is_empty() => Ok(Prt::Ip),
            "tcp" | "udp" => {
                let (args, established) = match args.strip_suffix("established") {
                    Some(rest) if name == "tcp" => (rest.trim(), true),
                    _ => (args, false),
                };
                let (src, dst) = if args.is_empty() {
                    (PortRange::ALL, PortRange::ALL)
                } else if let Some((src, dst)) = args.split_once(':') {
                    (src.parse()?, dst.parse()?)
                } else {
                    (PortRange::ALL, args.parse()?)
                };
                if name == "tcp" {
                    Ok(Prt::Tcp {
                        src,
                        dst,
                        established,
                    })
                } else {
                    Ok(Prt::Udp { src, dst })
                }
            }
            "icmp" => {
                if args.is_empty() {
                    return Ok(Prt::Icmp {
                        ty: None,
                        code: None,
                    });
                }
                let parse_u8 = |v: &str| {
                    v.trim()
                        .parse::<u8>()
                        .map_err(|_| format!("Invalid icmp value '{v}' in '{text}'"))
                };
                let (ty, code) = match args.split_once('/') {
                    Some((t, c)) => (parse_u8(t)?, Some(parse_u8(c)?)),
                    None => (parse_u8(args)?, None),
                };
                Ok(Prt::Icmp { ty: Some(ty), code })
            }
            "proto" => {
                let n: u8 = args
                    .parse()
                    .map_err(|_| format!("Invalid protocol number in '{text}'"))?;
                Ok(match n {
                    6 => Prt::tcp(PortRange::ALL),
                    17 => Prt::udp(PortRange::ALL),
                    1 => Prt::Icmp {
                        ty: None,
                        code: None,
                    },
                    _ => Prt::Proto(n),
                })
            }
            _ => Err(format!("Unknown protocol in '{text}'")),
        }
    }
}

impl Serialize for Prt {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Prt {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Merges overlapping or adjacent port ranges and drops contained entries.
///
/// The result is sorted and contains no entry that is contained in another.
pub fn normalize(prts: &[Prt]) -> Vec<Prt> {
    if prts.contains(&Prt::Ip) {
        return vec![Prt::Ip];
    }

    let mut out: Vec<Prt> = Vec::new();

    // tcp / udp entries with full source range are merged by dst interval
    let mut tcp: Vec<PortRange> = Vec::new();
    let mut udp: Vec<PortRange> = Vec::new();
    let mut rest: Vec<Prt> = Vec::new();
    for prt in prts {
        match *prt {
            Prt::Tcp {
                src,
                dst,
                established: false,
            } if src.is_all() => tcp.push(dst),
            Prt::Udp { src, dst } if src.is_all() => udp.push(dst),
            other => rest.push(other),
        }
    }
    out.extend(merge_ranges(tcp).into_iter().map(Prt::tcp));
    out.extend(merge_ranges(udp).into_iter().map(Prt::udp));
    out.extend(rest);

    out.sort();
    out.dedup();

    // Drop entries contained in another entry
    let snapshot = out.clone();
    out.retain(|p| {
        !snapshot
            .iter()
            .any(|other| other != p && other.contains(p))
    });
    out
}

fn merge_ranges(mut ranges: Vec<PortRange>) -> Vec<PortRange> {
    ranges.sort();
    let mut merged: Vec<PortRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        if let Some(last) = merged.last_mut()
            && last.touches(&range)
        {
            last.hi = last.hi.max(range.hi);
            continue;
        }
        merged.push(range);
    }
    merged
}

/// Normalized protocol lists indexed by [`ServiceId`].
#[derive(Debug, Clone, Default)]
pub struct Services {
    prts: Vec<Vec<Prt>>,
}

impl Services {
    pub fn prts(&self, id: ServiceId) -> &[Prt] {
        self.prts.get(id.index()).map_or(&[], Vec::as_slice)
    }
}

/// Normalizes every service of the model.
///
/// Empty services are reported as errors.
pub fn normalize_services(model: &Model) -> Staged<Services> {
    let mut diagnostics = Diagnostics::new();
    let prts = model
        .services
        .iter()
        .map(|service| {
            if service.prts.is_empty() {
                diagnostics.error(
                    DiagKind::Group,
                    format!("service:{} has no protocol", service.name),
                );
            }
            normalize(&service.prts)
        })
        .collect();
    Staged::new(Services { prts }, diagnostics)
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_prt() -> impl Strategy<Value = Prt> {
        prop_oneof![
            (1u16..200, 0u16..50).prop_map(|(lo, len)| Prt::tcp(PortRange { lo, hi: lo + len })),
            (1u16..200, 0u16..50).prop_map(|(lo, len)| Prt::udp(PortRange { lo, hi: lo + len })),
            proptest::option::of(0u8..16).prop_map(|ty| Prt::Icmp { ty, code: None }),
            (40u8..60).prop_map(Prt::Proto),
        ]
    }

    proptest! {
        #[test]
        fn test_normalize_is_idempotent(prts in proptest::collection::vec(arb_prt(), 0..12)) {
            let once = normalize(&prts);
            prop_assert_eq!(normalize(&once), once);
        }

        #[test]
        fn test_normalize_preserves_coverage(
            prts in proptest::collection::vec(arb_prt(), 1..12),
            sample in arb_prt()
        ) {
            let norm = normalize(&prts);
            let before = prts.iter().any(|p| p.contains(&sample));
            let after = norm.iter().any(|p| p.contains(&sample));
            // Merging can only widen single-entry coverage of a sample range.
            prop_assert!(!before || after);
        }

        #[test]
        fn test_normalized_entries_do_not_contain_each_other(
            prts in proptest::collection::vec(arb_prt(), 0..12)
        ) {
            let norm = normalize(&prts);
            for (i, a) in norm.iter().enumerate() {
                for (j, b) in norm.iter().enumerate() {
                    prop_assert!(i == j || !a.contains(b));
                }
            }
        }
    }
}
