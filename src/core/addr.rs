//! Address arithmetic on CIDR blocks
//!
//! All helpers work on normalized [`IpNetwork`] values (host bits cleared)
//! and treat IPv4 and IPv6 as disjoint address spaces.

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Value and bit width of an address family.
fn bits(net: &IpNetwork) -> (u128, u8) {
    match net {
        IpNetwork::V4(n) => (u128::from(u32::from(n.network())), 32),
        IpNetwork::V6(n) => (u128::from(n.network()), 128),
    }
}

fn addr_bits(ip: IpAddr) -> (u128, u8) {
    match ip {
        IpAddr::V4(a) => (u128::from(u32::from(a)), 32),
        IpAddr::V6(a) => (u128::from(a), 128),
    }
}

/// Network mask for `prefix` bits of a `width` bit address.
fn mask(width: u8, prefix: u8) -> u128 {
    if prefix == 0 {
        return 0;
    }
    let full = if width == 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    };
    let host_bits = u32::from(width - prefix);
    (full >> host_bits) << host_bits
}

fn max_value(width: u8) -> u128 {
    if width == 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    }
}

/// Builds a network from raw bits; host bits are cleared.
fn from_bits(width: u8, value: u128, prefix: u8) -> Option<IpNetwork> {
    let value = value & mask(width, prefix);
    if width == 32 {
        let v4 = Ipv4Addr::from(u32::try_from(value).ok()?);
        Ipv4Network::new(v4, prefix).ok().map(IpNetwork::V4)
    } else {
        Ipv6Network::new(Ipv6Addr::from(value), prefix)
            .ok()
            .map(IpNetwork::V6)
    }
}

/// Clears host bits, e.g. `10.1.1.7/24` becomes `10.1.1.0/24`.
pub fn normalize(net: IpNetwork) -> IpNetwork {
    let (value, width) = bits(&net);
    from_bits(width, value, net.prefix()).unwrap_or(net)
}

/// Single address block (`/32` or `/128`).
pub fn host_net(ip: IpAddr) -> IpNetwork {
    match ip {
        IpAddr::V4(a) => IpNetwork::V4(Ipv4Network::from(a)),
        IpAddr::V6(a) => IpNetwork::V6(Ipv6Network::from(a)),
    }
}

pub fn same_family(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

/// Returns `true` if `outer` contains `inner` (equal blocks included).
pub fn contains(outer: &IpNetwork, inner: &IpNetwork) -> bool {
    if !same_family(outer, inner) || outer.prefix() > inner.prefix() {
        return false;
    }
    let (o, width) = bits(outer);
    let (i, _) = bits(inner);
    i & mask(width, outer.prefix()) == o
}

pub fn contains_addr(outer: &IpNetwork, ip: IpAddr) -> bool {
    contains(outer, &host_net(ip))
}

/// Enclosing block with the given shorter prefix.
pub fn supernet(net: &IpNetwork, prefix: u8) -> Option<IpNetwork> {
    if prefix > net.prefix() {
        return None;
    }
    let (value, width) = bits(net);
    from_bits(width, value, prefix)
}

/// The other half of the parent block: `10.0.0.0/24` and `10.0.1.0/24`
/// are buddies under `10.0.0.0/23`.
pub fn buddy(net: &IpNetwork) -> Option<IpNetwork> {
    let prefix = net.prefix();
    if prefix == 0 {
        return None;
    }
    let (value, width) = bits(net);
    let flip = 1u128 << u32::from(width - prefix);
    from_bits(width, value ^ flip, prefix)
}

/// Maps the host part of `inner` from block `from` into block `to`.
///
/// Used for static NAT, where a translated network keeps its prefix
/// length and every address keeps its offset.
pub fn translate_static(inner: &IpNetwork, from: &IpNetwork, to: &IpNetwork) -> Option<IpNetwork> {
    if !same_family(inner, to) || !contains(from, inner) {
        return None;
    }
    let (value, width) = bits(inner);
    let (target, _) = bits(to);
    let net_mask = mask(width, to.prefix());
    from_bits(
        width,
        (target & net_mask) | (value & !net_mask),
        inner.prefix(),
    )
}

/// Splits an inclusive address range into the minimal list of CIDR blocks.
///
/// # Errors
///
/// Returns `Err` if the bounds are of different families or reversed.
pub fn range_to_cidrs(lo: IpAddr, hi: IpAddr) -> Result<Vec<IpNetwork>, String> {
    let (mut start, width) = addr_bits(lo);
    let (end, hi_width) = addr_bits(hi);
    if width != hi_width {
        return Err(format!("Range {lo}-{hi} mixes address families"));
    }
    if start > end {
        return Err(format!("Invalid range {lo}-{hi}"));
    }
    let mut blocks = Vec::new();
    loop {
        // Largest aligned block starting at `start` that stays inside the range.
        let mut size_bits = if start == 0 {
            width
        } else {
            start.trailing_zeros().min(u32::from(width)) as u8
        };
        while size_bits > 0 && block_end(start, size_bits) > end {
            size_bits -= 1;
        }
        let last = block_end(start, size_bits);
        if let Some(net) = from_bits(width, start, width - size_bits) {
            blocks.push(net);
        }
        if last >= end || last == max_value(width) {
            break;
        }
        start = last + 1;
    }
    Ok(blocks)
}

fn block_end(start: u128, size_bits: u8) -> u128 {
    if size_bits >= 128 {
        u128::MAX
    } else {
        start.saturating_add((1u128 << size_bits) - 1)
    }
}

/// Whole address space of the family of `net`.
pub fn all_of_family(net: &IpNetwork) -> IpNetwork {
    let width = if net.is_ipv4() { 32 } else { 128 };
    from_bits(width, 0, 0).unwrap_or(*net)
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_range_blocks_cover_exactly(a in any::<u32>(), b in any::<u32>()) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let blocks = range_to_cidrs(IpAddr::V4(lo.into()), IpAddr::V4(hi.into())).unwrap();
            // Blocks are contiguous, ascending and span [lo, hi].
            let mut next = u64::from(lo);
            for block in &blocks {
                let IpNetwork::V4(v4) = block else { panic!("family changed") };
                prop_assert_eq!(u64::from(u32::from(v4.network())), next);
                next += 1u64 << (32 - u32::from(v4.prefix()));
            }
            prop_assert_eq!(next, u64::from(hi) + 1);
        }

        #[test]
        fn test_buddies_share_parent(addr in any::<u32>(), prefix in 1u8..=32) {
            let block = normalize(IpNetwork::V4(Ipv4Network::new(addr.into(), prefix).unwrap()));
            let other = buddy(&block).unwrap();
            prop_assert_ne!(block, other);
            prop_assert_eq!(supernet(&block, prefix - 1), supernet(&other, prefix - 1));
        }
    }
}
