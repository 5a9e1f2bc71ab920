use std::cmp::Ordering;
use std::net::IpAddr;

/// A network with a prefix length.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NetMask {
    pub addr: IpAddr,
    pub bits: u8,
}

impl NetMask {
    pub fn new(addr: IpAddr, bits: u8) -> Self {
        Self { addr, bits }
    }

    /// `true` if `ip` lies within this network. Mixed address families
    /// never match.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = u32::from(self.bits.min(32));
                if bits == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - bits);
                (u32::from(net) & mask) == (u32::from(*ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = u32::from(self.bits.min(128));
                if bits == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - bits);
                (u128::from(net) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }
}

/// Predicate guarding one configuration fragment.
///
/// Unset parts match anything. Used both as a mask (on a fragment) and as
/// the concrete description of a connection being looked up.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Filter {
    /// Service name; a leading `!` negates the match.
    pub service: Option<String>,
    /// One or more space-separated TLS SNI patterns; `*` matches a single
    /// DNS label.
    pub local_name: Option<String>,
    /// Network the local endpoint must lie in.
    pub local_net: Option<NetMask>,
    /// Network the remote endpoint must lie in.
    pub remote_net: Option<NetMask>,
}

impl Filter {
    pub fn local_bits(&self) -> u8 {
        self.local_net.map_or(0, |net| net.bits)
    }

    pub fn remote_bits(&self) -> u8 {
        self.remote_net.map_or(0, |net| net.bits)
    }

    /// `true` if `self` (the mask) matches the concrete `filter`.
    pub fn matches(&self, filter: &Filter) -> bool {
        self.match_service(filter) && self.match_rest(filter)
    }

    fn match_service(&self, filter: &Filter) -> bool {
        let Some(mask) = &self.service else { return true };
        let Some(service) = &filter.service else {
            return false;
        };
        match mask.strip_prefix('!') {
            Some(negated) => service != negated,
            None => service == mask,
        }
    }

    fn match_rest(&self, filter: &Filter) -> bool {
        if let Some(patterns) = &self.local_name {
            let Some(name) = &filter.local_name else {
                return false;
            };
            // local_name "mail.example.com example.com mx.example.com" { .. }
            let matched = patterns
                .split(' ')
                .filter(|p| !p.is_empty())
                .any(|pattern| dns_match_wildcard(name, pattern));
            if !matched {
                return false;
            }
        }
        if let Some(mask) = &self.remote_net {
            match &filter.remote_net {
                Some(net) if mask.contains(&net.addr) => {}
                _ => return false,
            }
        }
        if let Some(mask) = &self.local_net {
            match &filter.local_net {
                Some(net) if mask.contains(&net.addr) => {}
                _ => return false,
            }
        }
        true
    }

    /// Structural equality with case-insensitive `local_name`, matching how
    /// SNI names compare.
    pub fn equivalent(&self, other: &Filter) -> bool {
        let names_equal = match (&self.local_name, &other.local_name) {
            (None, None) => true,
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        };
        names_equal
            && self.service == other.service
            && self.local_net == other.local_net
            && self.remote_net == other.remote_net
    }
}

/// Case-insensitive DNS name match where a `*` pattern label matches
/// exactly one name label.
pub fn dns_match_wildcard(name: &str, pattern: &str) -> bool {
    let mut name_labels = name.split('.');
    let mut pattern_labels = pattern.split('.');
    loop {
        match (name_labels.next(), pattern_labels.next()) {
            (None, None) => return true,
            (Some(n), Some(p)) => {
                if p != "*" && !p.eq_ignore_ascii_case(n) {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// Specificity order over filters: the most specific sorts first.
///
/// A named local_name outranks network masks, longer prefixes outrank
/// shorter ones, and a named service outranks none. Beyond that the order
/// is not significant.
pub fn cmp_specificity(a: &Filter, b: &Filter) -> Ordering {
    match (a.local_name.is_some(), b.local_name.is_some()) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    let by_local = b.local_bits().cmp(&a.local_bits());
    if by_local != Ordering::Equal {
        return by_local;
    }
    let by_remote = b.remote_bits().cmp(&a.remote_bits());
    if by_remote != Ordering::Equal {
        return by_remote;
    }

    match (a.service.is_some(), b.service.is_some()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// `true` if every connection matched by `filter` is also matched by `sup`.
///
/// Both filters are assumed to match a common subset already, so IPs and
/// service names are not re-compared, only their presence and mask widths.
pub fn is_superset(sup: &Filter, filter: &Filter) -> bool {
    if sup.local_bits() > filter.local_bits() {
        return false;
    }
    if sup.remote_bits() > filter.remote_bits() {
        return false;
    }
    if sup.local_name.is_some() && filter.local_name.is_none() {
        return false;
    }
    if sup.service.is_some() && filter.service.is_none() {
        return false;
    }
    true
}
