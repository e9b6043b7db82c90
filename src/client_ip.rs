//! Client IP resolution
//!
//! Requests reach the edge either directly or through a trusted fronting
//! proxy (CDN, local TLS offloader). The resolver picks the best external
//! identity for a request from the proxy headers and the transport peer,
//! preferring public addresses and never trusting a spoofable header over a
//! public socket peer.

use std::net::IpAddr;

use axum::http::HeaderMap;

const CF_CONNECTING_IP: &str = "cf-connecting-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// True when `ip` is a routable public address.
///
/// Loopback, RFC-1918 / unique-local, link-local (unicast and multicast),
/// multicast and the unspecified address are all considered non-public.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            let seg0 = v6.segments()[0];
            let unique_local = (seg0 & 0xfe00) == 0xfc00;
            let link_local = (seg0 & 0xffc0) == 0xfe80;
            !(v6.is_loopback()
                || unique_local
                || link_local
                || v6.is_multicast()
                || v6.is_unspecified())
        }
    }
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    headers
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse::<IpAddr>()
        .ok()
}

fn forwarded_for_ips<'a>(headers: &'a HeaderMap) -> impl Iterator<Item = IpAddr> + 'a {
    headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .split(',')
        .filter_map(|token| token.trim().parse::<IpAddr>().ok())
}

/// Choose the client IP for a request.
///
/// Ordered policy:
/// 1. `CF-Connecting-IP`, if public or if the socket peer is itself
///    non-public (a local proxy trusted to supply the external identity).
/// 2. The first public hop in `X-Forwarded-For`, left to right.
/// 3. `X-Real-IP`, under the same rule as step 1.
/// 4. The socket peer, if public.
/// 5. Lenient fallback: first parseable `X-Forwarded-For` hop, then
///    `X-Real-IP`, then the socket peer as-is.
///
/// Invalid header tokens are skipped, never substituted.
pub fn best_client_ip(headers: &HeaderMap, socket_ip: IpAddr) -> IpAddr {
    let socket_public = is_public_ip(socket_ip);

    if let Some(ip) = header_ip(headers, CF_CONNECTING_IP) {
        if is_public_ip(ip) || !socket_public {
            return ip;
        }
    }

    if let Some(ip) = forwarded_for_ips(headers).find(|ip| is_public_ip(*ip)) {
        return ip;
    }

    if let Some(ip) = header_ip(headers, X_REAL_IP) {
        if is_public_ip(ip) || !socket_public {
            return ip;
        }
    }

    if socket_public {
        return socket_ip;
    }

    if let Some(ip) = forwarded_for_ips(headers).next() {
        return ip;
    }
    if let Some(ip) = header_ip(headers, X_REAL_IP) {
        return ip;
    }
    socket_ip
}

/// Append `ip` to an existing comma-separated `X-Forwarded-For` value.
pub fn append_forwarded_for(existing: &str, ip: IpAddr) -> String {
    if existing.is_empty() {
        ip.to_string()
    } else {
        format!("{existing}, {ip}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn public_discrimination() {
        assert!(is_public_ip(ip("198.51.100.7")));
        assert!(is_public_ip(ip("2001:db8::1")));
        assert!(!is_public_ip(ip("127.0.0.1")));
        assert!(!is_public_ip(ip("10.1.2.3")));
        assert!(!is_public_ip(ip("192.168.0.1")));
        assert!(!is_public_ip(ip("169.254.1.1")));
        assert!(!is_public_ip(ip("224.0.0.1")));
        assert!(!is_public_ip(ip("0.0.0.0")));
        assert!(!is_public_ip(ip("::1")));
        assert!(!is_public_ip(ip("fd00::1")));
        assert!(!is_public_ip(ip("fe80::1")));
        assert!(!is_public_ip(ip("ff02::1")));
        assert!(!is_public_ip(ip("::")));
    }

    #[test]
    fn public_socket_peer_beats_loopback_forwarded_for() {
        let h = headers(&[("x-forwarded-for", "127.0.0.1, 127.0.0.1")]);
        assert_eq!(best_client_ip(&h, ip("203.0.113.5")), ip("203.0.113.5"));
    }

    #[test]
    fn cf_connecting_ip_wins_over_x_real_ip_behind_local_proxy() {
        let h = headers(&[
            ("cf-connecting-ip", "198.51.100.7"),
            ("x-real-ip", "198.51.100.8"),
        ]);
        assert_eq!(best_client_ip(&h, ip("127.0.0.1")), ip("198.51.100.7"));
    }

    #[test]
    fn private_cf_header_ignored_when_peer_is_public() {
        let h = headers(&[("cf-connecting-ip", "10.0.0.9")]);
        assert_eq!(best_client_ip(&h, ip("203.0.113.5")), ip("203.0.113.5"));
    }

    #[test]
    fn first_public_forwarded_for_hop_wins() {
        let h = headers(&[("x-forwarded-for", "10.0.0.1, 198.51.100.3, 203.0.113.9")]);
        assert_eq!(best_client_ip(&h, ip("127.0.0.1")), ip("198.51.100.3"));
    }

    #[test]
    fn garbage_header_tokens_are_skipped() {
        let h = headers(&[("x-forwarded-for", "not-an-ip, , 198.51.100.3")]);
        assert_eq!(best_client_ip(&h, ip("127.0.0.1")), ip("198.51.100.3"));
    }

    #[test]
    fn x_real_ip_accepted_behind_private_peer() {
        let h = headers(&[("x-real-ip", "198.51.100.8")]);
        assert_eq!(best_client_ip(&h, ip("192.168.1.1")), ip("198.51.100.8"));
    }

    #[test]
    fn lenient_fallback_to_private_forwarded_hop() {
        let h = headers(&[("x-forwarded-for", "10.0.0.7")]);
        assert_eq!(best_client_ip(&h, ip("127.0.0.1")), ip("10.0.0.7"));
    }

    #[test]
    fn bare_socket_peer_when_nothing_else() {
        let h = HeaderMap::new();
        assert_eq!(best_client_ip(&h, ip("127.0.0.1")), ip("127.0.0.1"));
        assert_eq!(best_client_ip(&h, ip("203.0.113.1")), ip("203.0.113.1"));
    }

    #[test]
    fn append_forwarded_for_formats() {
        assert_eq!(append_forwarded_for("", ip("1.2.3.4")), "1.2.3.4");
        assert_eq!(
            append_forwarded_for("9.8.7.6", ip("1.2.3.4")),
            "9.8.7.6, 1.2.3.4"
        );
    }
}
