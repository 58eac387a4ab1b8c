use blake3::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static MINT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Mints a cluster-unique opaque id, `<label>-<32 hex chars>`.
///
/// The digest covers the label, a nanosecond clock, the process id and a
/// process-local counter, so ids minted in the same instant on the same or
/// different instances still diverge. The label prefix (`connection`,
/// `instance`) keeps log lines and route keys greppable without the id
/// carrying any other meaning.
pub fn generate_id(label: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut hasher = Hasher::new();
    hasher.update(label.as_bytes());
    hasher.update(&now.as_nanos().to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(&MINT_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    let digest = hasher.finalize().to_hex();
    format!("{}-{}", label, &digest.as_str()[..32])
}

/// Extracts the bare IP from a socket address string, tolerating the
/// bracketed IPv6 form and addresses that carry no port.
pub fn peer_ip(addr: &str) -> String {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((ip, _)) = rest.split_once(']') {
            return ip.to_string();
        }
    }
    match addr.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host.to_string(),
        _ => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_connection_ids_differ() {
        let first = generate_id("connection");
        let second = generate_id("connection");
        assert_ne!(first, second);
    }

    #[test]
    fn minted_ids_carry_their_label() {
        let id = generate_id("instance");
        assert!(id.starts_with("instance-"));
        let suffix = id.strip_prefix("instance-").unwrap();
        assert_eq!(suffix.len(), 32);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn peer_ip_strips_ipv4_port() {
        assert_eq!(peer_ip("198.51.100.7:52311"), "198.51.100.7");
    }

    #[test]
    fn peer_ip_strips_bracketed_ipv6_port() {
        assert_eq!(peer_ip("[2001:db8::1]:443"), "2001:db8::1");
    }

    #[test]
    fn peer_ip_keeps_bare_ipv6() {
        assert_eq!(peer_ip("2001:db8::1"), "2001:db8::1");
    }
}
