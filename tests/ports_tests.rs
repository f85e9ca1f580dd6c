use edge_scan_rs::ports::{default_ports, parse_ports_str};

#[test]
fn parse_mixed_separators_ranges_and_comments() {
    let input = r#"
        # edge tls ports
        443,8443
        2053-2055  # alt range
        8443  # duplicate

    "#;

    let ports = parse_ports_str(input).expect("parse ok");
    // Dedup, keep order of first appearance
    assert_eq!(ports, vec![443, 8443, 2053, 2054, 2055]);
}

#[test]
fn invalid_port_rejected() {
    assert!(parse_ports_str("0").is_err());
    assert!(parse_ports_str("443,abc").is_err());
}

#[test]
fn default_is_not_empty() {
    assert!(!default_ports().is_empty());
}
