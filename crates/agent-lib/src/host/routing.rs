//! Kernel routing table parsing and lookup
//!
//! Parses `/proc/net/route` into a [`RoutingTable`] that maps destination
//! addresses to the NIC the kernel would route them through. The table is
//! rebuilt wholesale on every host poll and swapped atomically by the
//! sampler; lookups run against an immutable copy.

use anyhow::{Context, Result};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tracing::{debug, warn};

/// An IPv4 subnet used for route matching and interface exclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Subnet {
    network: u32,
    mask: u32,
}

impl Ipv4Subnet {
    pub fn new(address: Ipv4Addr, prefix_len: u32) -> Self {
        let mask = if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len)
        };
        Self {
            network: u32::from(address) & mask,
            mask,
        }
    }

    pub fn from_mask(address: Ipv4Addr, mask: Ipv4Addr) -> Self {
        let mask = u32::from(mask);
        Self {
            network: u32::from(address) & mask,
            mask,
        }
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & self.mask == self.network
    }

    pub fn prefix_len(&self) -> u32 {
        self.mask.count_ones()
    }
}

impl FromStr for Ipv4Subnet {
    type Err = anyhow::Error;

    /// Parse CIDR notation, e.g. `10.0.0.0/16`.
    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .with_context(|| format!("subnet '{}' is not in CIDR notation", s))?;
        let addr: Ipv4Addr = addr
            .parse()
            .with_context(|| format!("invalid subnet address in '{}'", s))?;
        let prefix: u32 = prefix
            .parse()
            .with_context(|| format!("invalid prefix length in '{}'", s))?;
        anyhow::ensure!(prefix <= 32, "prefix length {} out of range", prefix);
        Ok(Ipv4Subnet::new(addr, prefix))
    }
}

#[derive(Debug, Clone)]
struct RouteRow {
    nic: String,
    subnet: Ipv4Subnet,
    gateway: Ipv4Addr,
    metric: u32,
}

/// Routing information for the monitored host.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    rows: Vec<RouteRow>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_row(
        &mut self,
        nic: impl Into<String>,
        destination: Ipv4Addr,
        gateway: Ipv4Addr,
        metric: u32,
        mask: Ipv4Addr,
    ) {
        self.rows.push(RouteRow {
            nic: nic.into(),
            subnet: Ipv4Subnet::from_mask(destination, mask),
            gateway,
            metric,
        });
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Name of the NIC that packets to `address` are routed through.
    ///
    /// Longest prefix wins; ties are broken by the smaller metric. Returns
    /// `None` when no row's subnet contains the address - callers must
    /// treat this as an unknown route, not a failure.
    pub fn route(&self, address: Ipv4Addr) -> Option<&str> {
        let row = self
            .rows
            .iter()
            .filter(|row| row.subnet.contains(address))
            .max_by(|a, b| {
                a.subnet
                    .prefix_len()
                    .cmp(&b.subnet.prefix_len())
                    .then(b.metric.cmp(&a.metric))
            });

        match row {
            Some(row) => Some(row.nic.as_str()),
            None => {
                debug!(address = %address, "No route found");
                None
            }
        }
    }

    /// Parse the contents of `/proc/net/route`.
    ///
    /// Columns are located from the header line; rows that fail to parse
    /// are skipped with a warning.
    pub fn parse(content: &str) -> Result<Self> {
        let mut lines = content.lines();
        let header = lines.next().context("routing table is empty")?;
        let columns: Vec<&str> = header.split_whitespace().collect();

        let col = |name: &str| -> Result<usize> {
            columns
                .iter()
                .position(|c| *c == name)
                .with_context(|| format!("column '{}' not found in routing table header", name))
        };

        let nic_col = col("Iface")?;
        let dest_col = col("Destination")?;
        let gateway_col = col("Gateway")?;
        let metric_col = col("Metric")?;
        let mask_col = col("Mask")?;

        let mut table = RoutingTable::new();

        for line in lines {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let needed = nic_col.max(dest_col).max(gateway_col).max(metric_col).max(mask_col);
            if fields.len() <= needed {
                continue;
            }

            let parsed = (|| -> Result<(Ipv4Addr, Ipv4Addr, u32, Ipv4Addr)> {
                Ok((
                    hex_to_ipv4(fields[dest_col])?,
                    hex_to_ipv4(fields[gateway_col])?,
                    fields[metric_col].parse()?,
                    hex_to_ipv4(fields[mask_col])?,
                ))
            })();

            match parsed {
                Ok((destination, gateway, metric, mask)) => {
                    table.add_row(fields[nic_col], destination, gateway, metric, mask);
                }
                Err(e) => {
                    warn!(line = %line, error = %e, "Skipping unparseable route entry");
                }
            }
        }

        Ok(table)
    }

    /// Gateway for the row that routes `address`, if any.
    pub fn gateway(&self, address: Ipv4Addr) -> Option<Ipv4Addr> {
        self.rows
            .iter()
            .filter(|row| row.subnet.contains(address))
            .max_by(|a, b| {
                a.subnet
                    .prefix_len()
                    .cmp(&b.subnet.prefix_len())
                    .then(b.metric.cmp(&a.metric))
            })
            .map(|row| row.gateway)
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NIC, Network/Prefix, Gateway, Metric")?;
        for row in &self.rows {
            write!(
                f,
                "\n{}, {}/{}, {}, {}",
                row.nic,
                Ipv4Addr::from(row.subnet.network),
                row.subnet.prefix_len(),
                row.gateway,
                row.metric
            )?;
        }
        Ok(())
    }
}

/// Decode the little-endian hex IPv4 encoding used by `/proc/net/route`.
fn hex_to_ipv4(hex: &str) -> Result<Ipv4Addr> {
    let raw = u32::from_str_radix(hex, 16)
        .with_context(|| format!("invalid hex address '{}'", hex))?;
    Ok(Ipv4Addr::from(raw.swap_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_to_ipv4() {
        // 192.168.0.1 stored little-endian
        assert_eq!(
            hex_to_ipv4("0100A8C0").unwrap(),
            Ipv4Addr::new(192, 168, 0, 1)
        );
        assert_eq!(hex_to_ipv4("00000000").unwrap(), Ipv4Addr::new(0, 0, 0, 0));
        assert!(hex_to_ipv4("zzzz").is_err());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut table = RoutingTable::new();
        table.add_row(
            "eth0",
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::UNSPECIFIED,
            1,
            Ipv4Addr::new(255, 255, 255, 0),
        );
        table.add_row(
            "eth1",
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::UNSPECIFIED,
            1,
            Ipv4Addr::new(255, 255, 0, 0),
        );

        assert_eq!(table.route(Ipv4Addr::new(10, 0, 0, 5)), Some("eth0"));
        assert_eq!(table.route(Ipv4Addr::new(10, 0, 1, 5)), Some("eth1"));
    }

    #[test]
    fn test_smaller_metric_breaks_ties() {
        let mut table = RoutingTable::new();
        table.add_row(
            "eth0",
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::UNSPECIFIED,
            100,
            Ipv4Addr::new(255, 255, 0, 0),
        );
        table.add_row(
            "eth1",
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::UNSPECIFIED,
            1,
            Ipv4Addr::new(255, 255, 0, 0),
        );

        assert_eq!(table.route(Ipv4Addr::new(10, 0, 0, 5)), Some("eth1"));
    }

    #[test]
    fn test_no_match_returns_none() {
        let mut table = RoutingTable::new();
        table.add_row(
            "eth0",
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::UNSPECIFIED,
            1,
            Ipv4Addr::new(255, 255, 0, 0),
        );

        assert_eq!(table.route(Ipv4Addr::new(192, 168, 1, 1)), None);
    }

    #[test]
    fn test_host_route_matches_single_address() {
        let mut table = RoutingTable::new();
        table.add_row(
            "tun0",
            Ipv4Addr::new(10, 0, 0, 7),
            Ipv4Addr::UNSPECIFIED,
            1,
            Ipv4Addr::new(255, 255, 255, 255),
        );

        assert_eq!(table.route(Ipv4Addr::new(10, 0, 0, 7)), Some("tun0"));
        assert_eq!(table.route(Ipv4Addr::new(10, 0, 0, 8)), None);
    }

    #[test]
    fn test_parse_proc_net_route() {
        let content = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0100A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0000A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
docker0\t000011AC\t00000000\t0001\t0\t0\t0\t0000FFFF\t0\t0\t0
";
        let table = RoutingTable::parse(content).unwrap();
        assert_eq!(table.len(), 3);

        // 192.168.0.x hits the /24, everything else falls to the default
        assert_eq!(table.route(Ipv4Addr::new(192, 168, 0, 9)), Some("eth0"));
        assert_eq!(table.route(Ipv4Addr::new(172, 17, 0, 2)), Some("docker0"));
        assert_eq!(table.route(Ipv4Addr::new(8, 8, 8, 8)), Some("eth0"));
        assert_eq!(
            table.gateway(Ipv4Addr::new(8, 8, 8, 8)),
            Some(Ipv4Addr::new(192, 168, 0, 1))
        );
    }

    #[test]
    fn test_parse_skips_malformed_rows() {
        let content = "\
Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask
eth0\tnothex\t00000000\t0001\t0\t0\t100\t00FFFFFF
eth0\t0000A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF
";
        let table = RoutingTable::parse(content).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_subnet_from_cidr() {
        let subnet: Ipv4Subnet = "10.10.0.0/16".parse().unwrap();
        assert!(subnet.contains(Ipv4Addr::new(10, 10, 4, 4)));
        assert!(!subnet.contains(Ipv4Addr::new(10, 11, 4, 4)));
        assert!("10.10.0.0".parse::<Ipv4Subnet>().is_err());
        assert!("10.10.0.0/40".parse::<Ipv4Subnet>().is_err());
    }
}
