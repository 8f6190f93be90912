//! Traffic summarizer frame parsing
//!
//! The external summarizer emits periodic human-readable frames on stdout.
//! A frame ends with a `===...` line; `---...` lines divide it into
//! sections, with the per-flow table in section 1. Each flow appears as a
//! "sent" line (`=>`) immediately followed by a "received" line (`<=`);
//! sent lines without a following received line are dropped.

use crate::models::TrafficSample;
use tracing::{trace, warn};

/// Port value used when the port cannot be determined.
pub const UNKNOWN_PORT: u16 = 0;

const FRAME_END_MARKER: &str = "===============================================";
const SECTION_DIVIDER: &str = "-----------------";
const SENT_DELIMITER: &str = "=>";
const RECEIVED_DELIMITER: &str = "<=";

/// Whether a line terminates the current frame.
pub fn is_frame_boundary(line: &str) -> bool {
    line.contains(FRAME_END_MARKER)
}

/// Parse one frame's lines into traffic samples.
///
/// Parse errors on individual lines skip the line, never the frame.
pub fn parse_frame(nic: &str, lines: &[String]) -> Vec<TrafficSample> {
    let mut frame = Vec::new();
    let mut section = 0usize;

    // sent side held until the matching received line arrives
    let mut pending: Option<(String, u16, u64)> = None;

    for line in lines {
        trace!(line = %line, "Parse line");

        if line.contains(SECTION_DIVIDER) {
            section += 1;
            continue;
        }
        if section != 1 {
            continue;
        }

        if let Some(sent_index) = line.find(SENT_DELIMITER) {
            // 1 172.30.0.65:22  =>  4.44Kb  4.44Kb  4.44Kb  1.11KB
            let left = &line[..sent_index];
            let right = &line[sent_index + SENT_DELIMITER.len()..];

            // first token on the left is the flow number
            let mut left_tokens = left.split_whitespace();
            left_tokens.next();
            let Some(addr) = left_tokens.next() else {
                warn!(line = %line, "Sent line missing address, skipping");
                pending = None;
                continue;
            };
            let Some(amount) = right.split_whitespace().next() else {
                warn!(line = %line, "Sent line missing data amount, skipping");
                pending = None;
                continue;
            };

            let (local_ip, local_port) = parse_address_and_port(addr);
            pending = Some((local_ip, local_port, data_amount_to_bits(amount)));
        } else if let Some(received_index) = line.find(RECEIVED_DELIMITER) {
            //   192.168.254.21:43210  <=  208b  208b  208b  52B
            let left = &line[..received_index];
            let right = &line[received_index + RECEIVED_DELIMITER.len()..];

            let Some(addr) = left.split_whitespace().next() else {
                warn!(line = %line, "Received line missing address, skipping");
                pending = None;
                continue;
            };
            let Some(amount) = right.split_whitespace().next() else {
                warn!(line = %line, "Received line missing data amount, skipping");
                pending = None;
                continue;
            };

            let (remote_ip, remote_port) = parse_address_and_port(addr);
            let bits_received = data_amount_to_bits(amount);

            // a received line only completes a flow when the sent line was
            // parsed; otherwise the pair is incomplete and dropped
            if let Some((local_ip, local_port, bits_sent)) = pending.take() {
                frame.push(TrafficSample {
                    nic: nic.to_string(),
                    local_ip,
                    local_port,
                    remote_ip,
                    remote_port,
                    bits_sent_last_2s: bits_sent,
                    bits_received_last_2s: bits_received,
                });
            }
        }
    }

    frame
}

/// Parse an address with an optional port.
///
/// Handles `ip:port`, `[v6]:port`, unterminated `[v6:port`, the loopback
/// shorthand `::`, bare IPv6, and bare tokens. The port is
/// [`UNKNOWN_PORT`] whenever it cannot be determined.
pub fn parse_address_and_port(s: &str) -> (String, u16) {
    let open_bracket = s.find('[');
    let close_bracket = s.find(']');

    if s == "::" {
        // IPv6 loopback shorthand; resolve it explicitly
        return ("::1".to_string(), UNKNOWN_PORT);
    }

    match (open_bracket, close_bracket) {
        (Some(open), Some(close)) if open < close => {
            // [2607:f8b0:4009:810::201e]:443
            let ip = s[open + 1..close].to_string();
            let port = s
                .get(close + 2..)
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(|| {
                    warn!(value = %s, "Odd address and port from summarizer (invalid number)");
                    UNKNOWN_PORT
                });
            (ip, port)
        }
        (Some(open), None) => {
            // [2601:444:47f:c71e:617a:817:f3be:8:56640
            let rest = &s[open + 1..];
            match rest.rfind(':') {
                Some(last_colon) => {
                    let ip = rest[..last_colon].to_string();
                    let port = rest[last_colon + 1..].parse().unwrap_or_else(|_| {
                        warn!(value = %s, "Odd IPv6 address and port from summarizer (invalid number)");
                        UNKNOWN_PORT
                    });
                    (ip, port)
                }
                None => (rest.to_string(), UNKNOWN_PORT),
            }
        }
        _ => {
            let colons = s.matches(':').count();
            if colons > 1 {
                // bare IPv6, no discernible port
                (s.to_string(), UNKNOWN_PORT)
            } else if colons == 1 {
                // 73.37.165.179:39430
                let (ip, port_str) = s.split_once(':').unwrap();
                let port = port_str.parse().unwrap_or_else(|_| {
                    warn!(value = %s, "Odd address and port from summarizer (invalid number)");
                    UNKNOWN_PORT
                });
                (ip.to_string(), port)
            } else {
                (s.to_string(), UNKNOWN_PORT)
            }
        }
    }
}

const KB: f64 = 1024.0;

/// Convert a summarizer data amount such as `4.44Kb` to bits.
///
/// Units are bits with binary multipliers (`b`, `Kb`, `Mb`, `Gb`),
/// matching the source tool's convention. Byte units (trailing `B`) and
/// anything else unrecognized convert to 0.
pub fn data_amount_to_bits(amount: &str) -> u64 {
    let unit_start = amount
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(amount.len());
    let (number, unit) = amount.split_at(unit_start);

    let multiplier = match unit {
        "b" => 1.0,
        "Kb" => KB,
        "Mb" => KB * KB,
        "Gb" => KB * KB * KB,
        _ => return 0,
    };

    let number: f64 = match number.parse() {
        Ok(n) => n,
        Err(_) => return 0,
    };

    (number * multiplier).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_amount_conversion() {
        assert_eq!(data_amount_to_bits("208b"), 208);
        assert_eq!(data_amount_to_bits("4.44Kb"), 4547);
        assert_eq!(data_amount_to_bits("2Mb"), 2 * 1024 * 1024);
        assert_eq!(data_amount_to_bits("1Gb"), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_byte_units_are_not_bit_units() {
        // trailing 'B' is bytes (cumulative column), not a rate in bits
        assert_eq!(data_amount_to_bits("1.11KB"), 0);
        assert_eq!(data_amount_to_bits("52B"), 0);
        assert_eq!(data_amount_to_bits("garbage"), 0);
    }

    #[test]
    fn test_parse_ipv4_address_and_port() {
        assert_eq!(
            parse_address_and_port("73.37.165.179:39430"),
            ("73.37.165.179".to_string(), 39430)
        );
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        assert_eq!(
            parse_address_and_port("[2607:f8b0:4009:810::201e]:443"),
            ("2607:f8b0:4009:810::201e".to_string(), 443)
        );
    }

    #[test]
    fn test_parse_unterminated_ipv6_with_port() {
        assert_eq!(
            parse_address_and_port("[2601:444:47f:c71e:617a:817:f3be:8:56640"),
            ("2601:444:47f:c71e:617a:817:f3be:8".to_string(), 56640)
        );
    }

    #[test]
    fn test_parse_loopback_shorthand() {
        assert_eq!(parse_address_and_port("::"), ("::1".to_string(), 0));
    }

    #[test]
    fn test_parse_bare_addresses() {
        assert_eq!(
            parse_address_and_port("2607:f8b0:4009:810::201e"),
            ("2607:f8b0:4009:810::201e".to_string(), 0)
        );
        assert_eq!(
            parse_address_and_port("224.0.0.5"),
            ("224.0.0.5".to_string(), 0)
        );
    }

    #[test]
    fn test_parse_bad_port_reports_unknown() {
        assert_eq!(
            parse_address_and_port("10.0.0.1:notaport"),
            ("10.0.0.1".to_string(), UNKNOWN_PORT)
        );
    }

    fn frame_lines(body: &str) -> Vec<String> {
        body.lines().map(|l| l.to_string()).collect()
    }

    const SAMPLE_FRAME: &str = "\
   # Host name (port/service if enabled)            last 2s   last 10s   last 40s cumulative
--------------------------------------------------------------------------------------------
   1 172.30.0.65:22                           =>     4.44Kb     4.44Kb     4.44Kb     1.11KB
     192.168.254.21:43210                     <=      208b       208b       208b        52B
--------------------------------------------------------------------------------------------
Total send rate:                                     4.44Kb     4.44Kb     4.44Kb
Total receive rate:                                   208b       208b       208b
";

    #[test]
    fn test_parse_frame() {
        let samples = parse_frame("eth0", &frame_lines(SAMPLE_FRAME));
        assert_eq!(samples.len(), 1);

        let sample = &samples[0];
        assert_eq!(sample.nic, "eth0");
        assert_eq!(sample.local_ip, "172.30.0.65");
        assert_eq!(sample.local_port, 22);
        assert_eq!(sample.remote_ip, "192.168.254.21");
        assert_eq!(sample.remote_port, 43210);
        assert_eq!(sample.bits_sent_last_2s, 4547);
        assert_eq!(sample.bits_received_last_2s, 208);
    }

    #[test]
    fn test_incomplete_pair_is_dropped() {
        let body = "\
header
--------------------------------------------------------------------------------------------
   1 172.30.0.65:22                           =>     4.44Kb     4.44Kb     4.44Kb     1.11KB
   2 172.30.0.66:23                           =>     1.00Kb     1.00Kb     1.00Kb     1.00KB
     192.168.254.21:43210                     <=      208b       208b       208b        52B
";
        let samples = parse_frame("eth0", &frame_lines(body));
        // the first sent line never saw its received line
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].local_ip, "172.30.0.66");
    }

    #[test]
    fn test_received_without_sent_is_dropped() {
        let body = "\
header
--------------------------------------------------------------------------------------------
     192.168.254.21:43210                     <=      208b       208b       208b        52B
";
        let samples = parse_frame("eth0", &frame_lines(body));
        assert!(samples.is_empty());
    }

    #[test]
    fn test_totals_section_ignored() {
        let samples = parse_frame("eth0", &frame_lines(SAMPLE_FRAME));
        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn test_frame_boundary_detection() {
        assert!(is_frame_boundary(
            "============================================================================"
        ));
        assert!(!is_frame_boundary("Total send rate: 4.44Kb"));
    }
}
