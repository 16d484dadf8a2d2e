//! Origin attribution without storing addresses. The client address (first
//! `X-Forwarded-For` entry, else the peer address) is folded through a keyed
//! sha256; the digest prefix is what gets persisted on posts and threads and
//! what moderation's exterminate action matches on.

use actix_web::HttpRequest;
use sha2::{Digest, Sha256};

pub fn client_addr(req: &HttpRequest) -> String {
    if let Some(xff) = req.headers().get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    req.peer_addr().map(|a| a.ip().to_string()).unwrap_or_default()
}

pub fn pseudoip(req: &HttpRequest) -> String {
    let secret = std::env::var("PSEUDOIP_SECRET").unwrap_or_default();
    derive(&client_addr(req), &secret)
}

pub fn derive(addr: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(addr.as_bytes());
    let digest = hasher.finalize();
    let hex = format!("{digest:x}");
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_per_addr_and_secret() {
        assert_eq!(derive("1.1.1.1", "s"), derive("1.1.1.1", "s"));
        assert_ne!(derive("1.1.1.1", "s"), derive("1.1.1.2", "s"));
        assert_ne!(derive("1.1.1.1", "s"), derive("1.1.1.1", "t"));
    }

    #[test]
    fn digest_prefix_shape() {
        let p = derive("2.2.2.2", "");
        assert_eq!(p.len(), 16);
        assert!(p.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
