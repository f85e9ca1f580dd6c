use anyhow::{bail, Context, Result};
use std::collections::HashSet;

/// Ports Cloudflare serves plain HTTP on; every other edge port speaks TLS.
pub const PLAINTEXT_PORTS: &[u16] = &[80, 8080, 8880, 2052, 2082, 2086, 2095];

/// Parse a probe port list into a deduplicated list of TCP ports (1..=65535).
///
/// Entries are separated by commas or newlines. Supported forms:
/// - single port number: `443`
/// - inclusive range: `2053-2096`
/// - comments: everything after `#` on a line is ignored
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        for item in line.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            if let Some((a, b)) = item.split_once('-') {
                let start = parse_port_str(a.trim())
                    .with_context(|| format!("line {line_no}: invalid start in range: {a}"))?;
                let end = parse_port_str(b.trim())
                    .with_context(|| format!("line {line_no}: invalid end in range: {b}"))?;
                if start > end {
                    bail!("line {line_no}: invalid range {start}-{end} (start > end)");
                }
                for p in start..=end {
                    if seen.insert(p) {
                        out.push(p);
                    }
                }
                continue;
            }

            let p = parse_port_str(item)
                .with_context(|| format!("line {line_no}: invalid port value: {item}"))?;
            if seen.insert(p) {
                out.push(p);
            }
        }
    }

    Ok(out)
}

/// The single port the edge probes by default.
pub fn default_ports() -> Vec<u16> {
    vec![8443]
}

/// Whether the diagnostic request on this port should be wrapped in TLS.
pub fn uses_tls(port: u16) -> bool {
    !PLAINTEXT_PORTS.contains(&port)
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_comma_list() {
        let ports = parse_ports_str("443, 8443,2053").unwrap();
        assert_eq!(ports, vec![443, 8443, 2053]);
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let input = "2083-2085\n443\n2084\n";
        let ports = parse_ports_str(input).unwrap();
        assert_eq!(ports, vec![2083, 2084, 2085, 443]);
    }

    #[test]
    fn parse_with_comments_and_whitespace() {
        let input = r#"
            # tls ports
            443  # https
            8443,2053 # alt
        "#;
        let ports = parse_ports_str(input).unwrap();
        assert_eq!(ports, vec![443, 8443, 2053]);
    }

    #[test]
    fn invalid_values_error() {
        assert!(parse_ports_str("70000").is_err());
        assert!(parse_ports_str("90-80").is_err());
    }

    #[test]
    fn tls_port_split() {
        assert!(uses_tls(443));
        assert!(uses_tls(8443));
        assert!(!uses_tls(80));
        assert!(!uses_tls(2095));
    }
}
