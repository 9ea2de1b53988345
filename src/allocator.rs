//! External port allocation policy
//!
//! Pure function over the current [`MappingTable`]. Callers must hold the
//! manager's table lock across the scan and the insert that follows it.

use crate::table::MappingTable;

/// Default first external port tried by the allocator
pub const DEFAULT_BASE_PORT: u16 = 55001;

/// Find the lowest free external port at or above `base`
///
/// A port is free when it is a key in neither the local nor the mirror table.
/// With `pair` set, `p + 1` must be free as well so the caller can map a
/// data/control channel pair onto contiguous ports.
///
/// Returns `None` only when the scan reaches the top of the port space.
pub fn next_free_port(table: &MappingTable, pair: bool, base: u16) -> Option<u16> {
    let mut port = base;
    loop {
        if table.is_free(port) {
            if !pair {
                return Some(port);
            }
            match port.checked_add(1) {
                Some(next) if table.is_free(next) => return Some(port),
                Some(_) => {}
                None => return None,
            }
        }
        port = port.checked_add(1)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IpProtocol, PortMapping};
    use std::net::{IpAddr, Ipv4Addr};

    fn udp(port: u16) -> PortMapping {
        PortMapping::request(
            IpProtocol::UDP,
            port,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            6000,
            "test",
        )
    }

    #[test]
    fn test_empty_table_returns_base() {
        let table = MappingTable::new();
        assert_eq!(next_free_port(&table, false, DEFAULT_BASE_PORT), Some(55001));
        assert_eq!(next_free_port(&table, true, DEFAULT_BASE_PORT), Some(55001));
    }

    #[test]
    fn test_skips_local_and_mirror_ports() {
        let mut table = MappingTable::new();
        table.insert_local(udp(55001));
        table.replace_mirror(vec![udp(55002)]);

        assert_eq!(next_free_port(&table, false, 55001), Some(55003));
    }

    #[test]
    fn test_pair_requires_both_ports_free() {
        let mut table = MappingTable::new();
        // 55002 taken: 55001 alone is free but cannot start a pair
        table.replace_mirror(vec![udp(55002)]);

        assert_eq!(next_free_port(&table, false, 55001), Some(55001));
        assert_eq!(next_free_port(&table, true, 55001), Some(55003));
    }

    #[test]
    fn test_pair_never_overlaps_occupied_ports() {
        let mut table = MappingTable::new();
        for port in [55001, 55004, 55006, 55007, 55010] {
            table.insert_local(udp(port));
        }
        table.replace_mirror(vec![udp(55003), udp(55009)]);

        let mut base = 55000;
        while base < 55020 {
            let p = next_free_port(&table, true, base).expect("port available");
            assert!(p >= base);
            assert!(table.is_free(p) && table.is_free(p + 1), "pair {} overlaps", p);
            base += 1;
        }
    }

    #[test]
    fn test_exhausted_port_space() {
        let mut table = MappingTable::new();
        table.insert_local(udp(u16::MAX));

        assert_eq!(next_free_port(&table, false, u16::MAX), None);
        assert_eq!(next_free_port(&table, true, u16::MAX - 1), None);
        assert_eq!(next_free_port(&table, false, u16::MAX - 1), Some(u16::MAX - 1));
    }
}
