//! Public IPv4 address space: reserved-block exclusion and deterministic enumeration.
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Inclusive range of IPv4 addresses, ordered by octets. Always `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpRange {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl IpRange {
    /// Returns `None` when `start > end`.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn from_net(net: Ipv4Net) -> Self {
        Self {
            start: net.network(),
            end: net.broadcast(),
        }
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    /// Number of addresses covered; a full /0 holds 2^32.
    pub fn address_count(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.start <= ip && ip <= self.end
    }
}

// https://en.wikipedia.org/wiki/Reserved_IP_addresses
const RESERVED_BLOCKS: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
];

/// Address blocks that are never scanned, sorted by start address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionTable {
    ranges: Vec<IpRange>,
}

impl ExclusionTable {
    /// Special-purpose blocks: private, loopback, link-local, CGNAT, documentation,
    /// benchmarking, multicast and the reserved class E space.
    pub fn reserved() -> Self {
        let ranges = RESERVED_BLOCKS
            .iter()
            .filter_map(|cidr| cidr.parse::<Ipv4Net>().ok())
            .map(IpRange::from_net)
            .collect();
        Self::from_ranges(ranges)
    }

    pub fn from_ranges(mut ranges: Vec<IpRange>) -> Self {
        ranges.sort();
        Self { ranges }
    }

    pub fn empty() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn ranges(&self) -> &[IpRange] {
        &self.ranges
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.ranges.iter().any(|r| r.contains(ip))
    }
}

impl Default for ExclusionTable {
    fn default() -> Self {
        Self::reserved()
    }
}

/// Next address, clamped at 255.255.255.255.
pub fn increment(ip: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).saturating_add(1))
}

/// Previous address, clamped at 0.0.0.0.
pub fn decrement(ip: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).saturating_sub(1))
}

/// Complement of the exclusion table over the whole IPv4 space, in address order.
pub fn compute_allowed_ranges(exclusions: &ExclusionTable) -> Vec<IpRange> {
    let mut allowed = Vec::new();
    // None once the cursor has run past 255.255.255.255.
    let mut cursor = Some(Ipv4Addr::UNSPECIFIED);

    for excluded in exclusions.ranges() {
        let Some(start) = cursor else { break };
        if start < excluded.start {
            allowed.push(IpRange {
                start,
                end: decrement(excluded.start),
            });
        }
        if excluded.end >= start {
            cursor = (excluded.end != Ipv4Addr::BROADCAST).then(|| increment(excluded.end));
        }
    }

    if let Some(start) = cursor {
        allowed.push(IpRange {
            start,
            end: Ipv4Addr::BROADCAST,
        });
    }
    allowed
}

pub fn count_addresses(ranges: &[IpRange]) -> u64 {
    ranges.iter().map(IpRange::address_count).sum()
}

/// Lazily walks every address of each range in order.
///
/// Holds no randomness: two iterators over the same ranges yield the same sequence.
#[derive(Debug, Clone)]
pub struct AddressIter {
    ranges: Vec<IpRange>,
    index: usize,
    // Next address of `ranges[index]`; None when that range is finished.
    next: Option<u32>,
}

pub fn enumerate(ranges: Vec<IpRange>) -> AddressIter {
    let next = ranges.first().map(|r| u32::from(r.start));
    AddressIter {
        ranges,
        index: 0,
        next,
    }
}

impl AddressIter {
    fn remaining(&self) -> u64 {
        let Some(next) = self.next else { return 0 };
        let current = u64::from(u32::from(self.ranges[self.index].end)) - u64::from(next) + 1;
        current + count_addresses(&self.ranges[self.index + 1..])
    }
}

impl Iterator for AddressIter {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Ipv4Addr> {
        let current = self.next?;
        let end = u32::from(self.ranges[self.index].end);
        self.next = if current < end {
            Some(current + 1)
        } else {
            self.index += 1;
            self.ranges.get(self.index).map(|r| u32::from(r.start))
        };
        Some(Ipv4Addr::from(current))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        match usize::try_from(remaining) {
            Ok(n) => (n, Some(n)),
            Err(_) => (usize::MAX, None),
        }
    }
}

impl std::iter::FusedIterator for AddressIter {}
