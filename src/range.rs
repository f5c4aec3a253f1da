//! CIDR and address-range algebra.
//!
//! Pure functions, no I/O. Ranges convert to their minimal CIDR cover with
//! the standard greedy algorithm; membership tests work at the bit level for
//! both address families.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Hard cap on [`expand`] output. Anything larger yields a truncation
/// marker rather than a list.
pub const EXPAND_CAP: u128 = 65_536;

/// The network block an IP belongs to: a CIDR or an explicit range.
///
/// This is the shape every ownership-resolver layer produces and every
/// operator-facing surface consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum NetworkPool {
    Cidr(IpNet),
    Range(IpAddr, IpAddr),
}

impl NetworkPool {
    /// First and last address of the pool.
    pub fn bounds(&self) -> (IpAddr, IpAddr) {
        match self {
            NetworkPool::Cidr(net) => cidr_to_range(net),
            NetworkPool::Range(start, end) => (*start, *end),
        }
    }

    /// Whether the pool contains `ip`. Mixed address families never match.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            NetworkPool::Cidr(net) => ip_in_cidr(ip, net),
            NetworkPool::Range(start, end) => match (ip, start, end) {
                (IpAddr::V4(ip), IpAddr::V4(s), IpAddr::V4(e)) => {
                    let v = u32::from(*ip);
                    u32::from(*s) <= v && v <= u32::from(*e)
                }
                (IpAddr::V6(ip), IpAddr::V6(s), IpAddr::V6(e)) => {
                    let v = u128::from(*ip);
                    u128::from(*s) <= v && v <= u128::from(*e)
                }
                _ => false,
            },
        }
    }

    /// Distance between the pool's bounds (size minus one). Used to order
    /// candidate pools by how much address space they cover.
    pub fn span(&self) -> u128 {
        match self.bounds() {
            (IpAddr::V4(s), IpAddr::V4(e)) => (u32::from(e) - u32::from(s)) as u128,
            (IpAddr::V6(s), IpAddr::V6(e)) => u128::from(e) - u128::from(s),
            _ => 0,
        }
    }

    /// Minimal CIDR cover of the pool.
    pub fn to_cidrs(&self) -> Vec<IpNet> {
        match self {
            NetworkPool::Cidr(net) => vec![*net],
            NetworkPool::Range(start, end) => range_to_cidrs(*start, *end),
        }
    }
}

impl std::fmt::Display for NetworkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkPool::Cidr(net) => write!(f, "{}", net),
            NetworkPool::Range(start, end) => write!(f, "{}-{}", start, end),
        }
    }
}

/// Parse error for [`NetworkPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPool(pub String);

impl std::fmt::Display for InvalidPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid pool: {}", self.0)
    }
}

impl std::error::Error for InvalidPool {}

impl FromStr for NetworkPool {
    type Err = InvalidPool;

    /// Accepts `a.b.c.d/n` CIDRs, `start-end` ranges (WHOIS-style
    /// `start - end` spacing included), and bare IPs (a one-address range).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Ok(net) = s.parse::<IpNet>() {
            return Ok(NetworkPool::Cidr(net));
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(NetworkPool::Range(ip, ip));
        }

        // IPv6 addresses contain no '-', so splitting on it is safe for
        // both families.
        if let Some((start, end)) = s.split_once('-') {
            let start: IpAddr = start
                .trim()
                .parse()
                .map_err(|_| InvalidPool(s.to_string()))?;
            let end: IpAddr = end.trim().parse().map_err(|_| InvalidPool(s.to_string()))?;

            let ordered = match (start, end) {
                (IpAddr::V4(a), IpAddr::V4(b)) => u32::from(a) <= u32::from(b),
                (IpAddr::V6(a), IpAddr::V6(b)) => u128::from(a) <= u128::from(b),
                _ => false,
            };
            if !ordered {
                return Err(InvalidPool(s.to_string()));
            }

            return Ok(NetworkPool::Range(start, end));
        }

        Err(InvalidPool(s.to_string()))
    }
}

impl From<NetworkPool> for String {
    fn from(pool: NetworkPool) -> Self {
        pool.to_string()
    }
}

impl TryFrom<String> for NetworkPool {
    type Error = InvalidPool;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// First and last address of a CIDR block.
pub fn cidr_to_range(net: &IpNet) -> (IpAddr, IpAddr) {
    (net.network(), net.broadcast())
}

/// Minimal set of CIDR blocks exactly covering `[start, end]`.
///
/// Greedy: at each step emit the largest block aligned to the cursor that
/// does not overrun `end`. Mixed-family or inverted input yields empty.
pub fn range_to_cidrs(start: IpAddr, end: IpAddr) -> Vec<IpNet> {
    match (start, end) {
        (IpAddr::V4(s), IpAddr::V4(e)) => cover_v4(s, e),
        (IpAddr::V6(s), IpAddr::V6(e)) => cover_v6(s, e),
        _ => Vec::new(),
    }
}

fn cover_v4(start: Ipv4Addr, end: Ipv4Addr) -> Vec<IpNet> {
    let end = u32::from(end) as u64;
    let mut cursor = u32::from(start) as u64;
    let mut blocks = Vec::new();

    while cursor <= end {
        let align = if cursor == 0 {
            32
        } else {
            (cursor as u32).trailing_zeros()
        };
        let span = end - cursor + 1;
        let fit = 63 - span.leading_zeros();
        let bits = align.min(fit).min(32);

        let net = Ipv4Net::new(Ipv4Addr::from(cursor as u32), (32 - bits) as u8)
            .expect("prefix length bounded above by 32");
        blocks.push(IpNet::V4(net));

        cursor += 1u64 << bits;
    }

    blocks
}

fn cover_v6(start: Ipv6Addr, end: Ipv6Addr) -> Vec<IpNet> {
    let end = u128::from(end);
    let mut cursor = u128::from(start);
    let mut blocks = Vec::new();

    loop {
        if cursor > end {
            break;
        }
        let align = if cursor == 0 {
            128
        } else {
            cursor.trailing_zeros()
        };
        // span = end - cursor (not +1) to dodge overflow on the full space;
        // a block of 2^bits fits when bits <= floor(log2(span + 1)).
        let span = end - cursor;
        let fit = if span == u128::MAX {
            128
        } else {
            127 - (span + 1).leading_zeros()
        };
        let bits = align.min(fit);

        let net = Ipv6Net::new(Ipv6Addr::from(cursor), (128 - bits) as u8)
            .expect("prefix length bounded above by 128");
        blocks.push(IpNet::V6(net));

        if bits >= 128 {
            break;
        }
        match cursor.checked_add(1u128 << bits) {
            Some(next) => cursor = next,
            None => break,
        }
    }

    blocks
}

/// Bit-level prefix membership test, both address families.
pub fn ip_in_cidr(ip: &IpAddr, cidr: &IpNet) -> bool {
    match (ip, cidr) {
        (IpAddr::V4(ip), IpNet::V4(net)) => {
            prefix_matches(&ip.octets(), &net.addr().octets(), net.prefix_len())
        }
        (IpAddr::V6(ip), IpNet::V6(net)) => {
            prefix_matches(&ip.octets(), &net.addr().octets(), net.prefix_len())
        }
        _ => false,
    }
}

fn prefix_matches(ip: &[u8], net: &[u8], prefix_len: u8) -> bool {
    let full_bytes = (prefix_len / 8) as usize;
    let rem_bits = prefix_len % 8;

    if ip[..full_bytes] != net[..full_bytes] {
        return false;
    }
    if rem_bits == 0 {
        return true;
    }

    let mask = 0xffu8 << (8 - rem_bits);
    (ip[full_bytes] & mask) == (net[full_bytes] & mask)
}

/// Result of expanding a pool into individual addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    Complete(Vec<IpAddr>),
    /// The pool exceeds [`EXPAND_CAP`]; only the total size is reported.
    Truncated { total: u128 },
}

/// Enumerate every address in a pool, bounded by [`EXPAND_CAP`].
pub fn expand(pool: &NetworkPool) -> Expansion {
    let (start, end) = pool.bounds();

    let total = match (start, end) {
        (IpAddr::V4(s), IpAddr::V4(e)) => (u32::from(e) as u128) - (u32::from(s) as u128) + 1,
        (IpAddr::V6(s), IpAddr::V6(e)) => {
            let span = u128::from(e) - u128::from(s);
            if span == u128::MAX {
                return Expansion::Truncated { total: u128::MAX };
            }
            span + 1
        }
        _ => return Expansion::Complete(Vec::new()),
    };

    if total > EXPAND_CAP {
        return Expansion::Truncated { total };
    }

    let ips = match (start, end) {
        (IpAddr::V4(s), IpAddr::V4(e)) => (u32::from(s)..=u32::from(e))
            .map(|v| IpAddr::V4(Ipv4Addr::from(v)))
            .collect(),
        (IpAddr::V6(s), IpAddr::V6(e)) => (u128::from(s)..=u128::from(e))
            .map(|v| IpAddr::V6(Ipv6Addr::from(v)))
            .collect(),
        _ => Vec::new(),
    };

    Expansion::Complete(ips)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_cidr_to_range() {
        let (start, end) = cidr_to_range(&net("192.168.1.0/24"));
        assert_eq!(start, v4("192.168.1.0"));
        assert_eq!(end, v4("192.168.1.255"));
    }

    #[test]
    fn test_range_to_cidrs_aligned() {
        let cidrs = range_to_cidrs(v4("10.0.0.0"), v4("10.0.0.255"));
        assert_eq!(cidrs, vec![net("10.0.0.0/24")]);
    }

    #[test]
    fn test_range_to_cidrs_unaligned() {
        let cidrs = range_to_cidrs(v4("192.168.1.3"), v4("192.168.1.9"));
        assert_eq!(
            cidrs,
            vec![
                net("192.168.1.3/32"),
                net("192.168.1.4/30"),
                net("192.168.1.8/31"),
            ]
        );
    }

    #[test]
    fn test_range_to_cidrs_single_address() {
        let cidrs = range_to_cidrs(v4("1.2.3.4"), v4("1.2.3.4"));
        assert_eq!(cidrs, vec![net("1.2.3.4/32")]);
    }

    #[test]
    fn test_range_to_cidrs_full_v4_space() {
        let cidrs = range_to_cidrs(v4("0.0.0.0"), v4("255.255.255.255"));
        assert_eq!(cidrs, vec![net("0.0.0.0/0")]);
    }

    #[test]
    fn test_range_to_cidrs_mixed_family_empty() {
        let cidrs = range_to_cidrs(v4("1.2.3.4"), "::1".parse().unwrap());
        assert!(cidrs.is_empty());
    }

    #[test]
    fn test_round_trip_exact() {
        let cases = [
            ("10.0.0.1", "10.0.3.17"),
            ("172.16.5.200", "172.16.9.0"),
            ("0.0.0.0", "0.0.0.0"),
            ("203.0.113.7", "203.0.113.250"),
        ];

        for (start, end) in cases {
            let (start, end) = (v4(start), v4(end));
            let cidrs = range_to_cidrs(start, end);

            // Blocks are contiguous, in order, and reconstruct [start, end].
            let (first, _) = cidr_to_range(&cidrs[0]);
            assert_eq!(first, start);
            let (_, last) = cidr_to_range(cidrs.last().unwrap());
            assert_eq!(last, end);

            for pair in cidrs.windows(2) {
                let (_, prev_end) = cidr_to_range(&pair[0]);
                let (next_start, _) = cidr_to_range(&pair[1]);
                let IpAddr::V4(prev_end) = prev_end else {
                    panic!()
                };
                let IpAddr::V4(next_start) = next_start else {
                    panic!()
                };
                assert_eq!(u32::from(prev_end) + 1, u32::from(next_start));
            }
        }
    }

    #[test]
    fn test_cover_is_minimal() {
        // No two adjacent blocks of equal size may be mergeable into one
        // block of twice the span.
        let cidrs = range_to_cidrs(v4("10.0.0.3"), v4("10.0.2.250"));

        for pair in cidrs.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.prefix_len() != b.prefix_len() {
                continue;
            }
            let (IpNet::V4(a), IpNet::V4(b)) = (a, b) else {
                panic!()
            };
            let merged_prefix = a.prefix_len() - 1;
            let merged = Ipv4Net::new(a.network(), merged_prefix).unwrap();
            let mergeable = merged.network() == a.network()
                && merged.broadcast() == b.broadcast();
            assert!(!mergeable, "blocks {} and {} merge into {}", a, b, merged);
        }
    }

    #[test]
    fn test_ipv6_cover() {
        let start: IpAddr = "2001:db8::".parse().unwrap();
        let end: IpAddr = "2001:db8::ffff".parse().unwrap();
        let cidrs = range_to_cidrs(start, end);
        assert_eq!(cidrs, vec![net("2001:db8::/112")]);
    }

    #[test]
    fn test_ipv6_cover_unaligned() {
        let start: IpAddr = "2001:db8::1".parse().unwrap();
        let end: IpAddr = "2001:db8::4".parse().unwrap();
        let cidrs = range_to_cidrs(start, end);
        assert_eq!(
            cidrs,
            vec![
                net("2001:db8::1/128"),
                net("2001:db8::2/127"),
                net("2001:db8::4/128"),
            ]
        );
    }

    #[test]
    fn test_ip_in_cidr_spot_checks() {
        assert!(ip_in_cidr(&v4("192.168.1.5"), &net("192.168.1.0/24")));
        assert!(!ip_in_cidr(&v4("192.168.2.5"), &net("192.168.1.0/24")));
    }

    #[test]
    fn test_ip_in_cidr_agrees_with_bitmask() {
        let cases = [
            ("10.1.2.3", "10.0.0.0/8"),
            ("10.1.2.3", "10.1.2.0/25"),
            ("10.1.2.200", "10.1.2.0/25"),
            ("172.16.0.1", "172.16.0.0/12"),
            ("192.0.2.1", "0.0.0.0/0"),
        ];

        for (ip, cidr) in cases {
            let ip = v4(ip);
            let cidr = net(cidr);
            let IpAddr::V4(ip4) = ip else { panic!() };
            let IpNet::V4(net4) = cidr else { panic!() };

            let shift = 32 - net4.prefix_len() as u32;
            let mask = if shift == 32 { 0 } else { u32::MAX << shift };
            let expected = (u32::from(ip4) & mask) == (u32::from(net4.addr()) & mask);

            assert_eq!(ip_in_cidr(&ip, &cidr), expected, "{} in {}", ip, cidr);
        }
    }

    #[test]
    fn test_ip_in_cidr_v6() {
        let cidr = net("2001:db8::/32");
        assert!(ip_in_cidr(&"2001:db8::1".parse().unwrap(), &cidr));
        assert!(!ip_in_cidr(&"2001:db9::1".parse().unwrap(), &cidr));
    }

    #[test]
    fn test_ip_in_cidr_mixed_family() {
        assert!(!ip_in_cidr(&"::1".parse().unwrap(), &net("0.0.0.0/0")));
    }

    #[test]
    fn test_expand_small_range() {
        let pool: NetworkPool = "192.168.1.0/30".parse().unwrap();
        match expand(&pool) {
            Expansion::Complete(ips) => {
                assert_eq!(ips.len(), 4);
                assert_eq!(ips[0], v4("192.168.1.0"));
                assert_eq!(ips[3], v4("192.168.1.3"));
            }
            Expansion::Truncated { .. } => panic!("unexpected truncation"),
        }
    }

    #[test]
    fn test_expand_truncates_huge_range() {
        let pool: NetworkPool = "10.0.0.0/8".parse().unwrap();
        match expand(&pool) {
            Expansion::Truncated { total } => assert_eq!(total, 1 << 24),
            Expansion::Complete(_) => panic!("a /8 must not expand"),
        }
    }

    #[test]
    fn test_pool_parse_and_display() {
        let cidr: NetworkPool = "10.0.0.0/8".parse().unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.0/8");

        let range: NetworkPool = "10.0.0.1-10.0.0.9".parse().unwrap();
        assert_eq!(range.to_string(), "10.0.0.1-10.0.0.9");

        // WHOIS-style spacing
        let spaced: NetworkPool = "10.0.0.1 - 10.0.0.9".parse().unwrap();
        assert_eq!(spaced, range);

        let single: NetworkPool = "1.2.3.4".parse().unwrap();
        assert_eq!(single, NetworkPool::Range(v4("1.2.3.4"), v4("1.2.3.4")));

        assert!("garbage".parse::<NetworkPool>().is_err());
        assert!("10.0.0.9-10.0.0.1".parse::<NetworkPool>().is_err());
    }

    #[test]
    fn test_pool_contains() {
        let pool: NetworkPool = "192.168.1.0/24".parse().unwrap();
        assert!(pool.contains(&v4("192.168.1.5")));
        assert!(!pool.contains(&v4("192.168.2.5")));

        let range: NetworkPool = "10.0.0.5-10.0.0.10".parse().unwrap();
        assert!(range.contains(&v4("10.0.0.7")));
        assert!(!range.contains(&v4("10.0.0.11")));
        assert!(!range.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn test_pool_span() {
        let small: NetworkPool = "10.0.0.0/24".parse().unwrap();
        let large: NetworkPool = "10.0.0.0/8".parse().unwrap();
        assert!(small.span() < large.span());
        assert_eq!(small.span(), 255);

        let single: NetworkPool = "1.2.3.4".parse().unwrap();
        assert_eq!(single.span(), 0);
    }

    #[test]
    fn test_pool_to_cidrs() {
        let range: NetworkPool = "192.168.1.3-192.168.1.9".parse().unwrap();
        assert_eq!(
            range.to_cidrs(),
            vec![
                net("192.168.1.3/32"),
                net("192.168.1.4/30"),
                net("192.168.1.8/31"),
            ]
        );
    }
}
