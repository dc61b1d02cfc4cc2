//! In-memory timed credentials: admin OTP requests, the temp tokens they
//! mint, replay download sessions, and the IP blacklist. Everything here
//! expires; lookups evict lazily and a sweep task handles the rest.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use rand::Rng;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const OTP_TTL: Duration = Duration::from_secs(5 * 60);
pub const TEMP_TOKEN_TTL: Duration = Duration::from_secs(4 * 60 * 60);
pub const REPLAY_SESSION_TTL: Duration = Duration::from_secs(30 * 60);
/// Repeated OTP failures from one address earn it a temporary ban.
const OTP_FAILURE_LIMIT: u32 = 5;
const OTP_FAILURE_BAN: Duration = Duration::from_secs(60 * 60);

struct OtpRequest {
    otp: String,
    expires: Instant,
}

struct TempToken {
    expires: Instant,
    bound_ip: IpAddr,
}

struct ReplaySession {
    user_id: i32,
    expires: Instant,
}

#[derive(Default)]
pub struct TrustStore {
    otps: DashMap<Uuid, OtpRequest>,
    temp_tokens: DashMap<Uuid, TempToken>,
    replay_sessions: DashMap<Uuid, ReplaySession>,
    blacklist: DashMap<IpAddr, Instant>,
    otp_failures: DashMap<IpAddr, u32>,
}

/// Strict equality, except that any loopback address matches any other
/// loopback address (v4 vs v6 localhost are interchangeable).
fn ips_match(bound: IpAddr, presented: IpAddr) -> bool {
    bound == presented || (bound.is_loopback() && presented.is_loopback())
}

impl TrustStore {
    /// Issues a new OTP request: a ssid handed to the caller and a 6
    /// character code revealed out-of-band (the server log).
    pub fn create_otp(&self) -> (Uuid, String) {
        let raw: [u8; 6] = rand::rng().random();
        let otp = URL_SAFE_NO_PAD.encode(raw)[..6].to_lowercase();
        let ssid = Uuid::new_v4();
        self.otps.insert(
            ssid,
            OtpRequest {
                otp: otp.clone(),
                expires: Instant::now() + OTP_TTL,
            },
        );
        (ssid, otp)
    }

    /// Consumes the OTP request (single use) and mints a temp admin token
    /// bound to the verifying address on success.
    pub fn verify_otp(&self, ssid: Uuid, otp: &str, ip: IpAddr) -> Option<Uuid> {
        let matched = match self.otps.remove(&ssid) {
            Some((_, request)) => {
                request.expires > Instant::now() && request.otp.eq_ignore_ascii_case(otp)
            }
            None => false,
        };
        if !matched {
            self.note_otp_failure(ip);
            return None;
        }
        self.otp_failures.remove(&ip);
        let token = Uuid::new_v4();
        self.temp_tokens.insert(
            token,
            TempToken {
                expires: Instant::now() + TEMP_TOKEN_TTL,
                bound_ip: ip,
            },
        );
        Some(token)
    }

    fn note_otp_failure(&self, ip: IpAddr) {
        let mut failures = self.otp_failures.entry(ip).or_insert(0);
        *failures += 1;
        if *failures >= OTP_FAILURE_LIMIT {
            drop(failures);
            self.otp_failures.remove(&ip);
            tracing::warn!(%ip, "too many OTP failures, blacklisting");
            self.blacklist_ip(ip, OTP_FAILURE_BAN);
        }
    }

    /// Validates a temp admin token for the presenting address. Expired
    /// tokens and address mismatches evict the token.
    pub fn validate_temp_token(&self, token: Uuid, ip: IpAddr) -> bool {
        let Some(entry) = self.temp_tokens.get(&token) else {
            return false;
        };
        if entry.expires <= Instant::now() || !ips_match(entry.bound_ip, ip) {
            drop(entry);
            self.temp_tokens.remove(&token);
            return false;
        }
        true
    }

    pub fn create_replay_session(&self, user_id: i32) -> Uuid {
        let token = Uuid::new_v4();
        self.replay_sessions.insert(
            token,
            ReplaySession {
                user_id,
                expires: Instant::now() + REPLAY_SESSION_TTL,
            },
        );
        token
    }

    pub fn validate_replay_session(&self, token: Uuid) -> Option<i32> {
        let entry = self.replay_sessions.get(&token)?;
        if entry.expires <= Instant::now() {
            drop(entry);
            self.replay_sessions.remove(&token);
            return None;
        }
        Some(entry.user_id)
    }

    pub fn blacklist_ip(&self, ip: IpAddr, ttl: Duration) {
        self.blacklist.insert(ip, Instant::now() + ttl);
    }

    /// True iff an unexpired entry exists; expired entries are evicted on
    /// the spot.
    pub fn is_blacklisted(&self, ip: IpAddr) -> bool {
        let Some(entry) = self.blacklist.get(&ip) else {
            return false;
        };
        if *entry <= Instant::now() {
            drop(entry);
            self.blacklist.remove(&ip);
            return false;
        }
        true
    }

    pub fn remove_blacklisted(&self, ip: IpAddr) -> bool {
        self.blacklist.remove(&ip).is_some()
    }

    pub fn clear_blacklist(&self) {
        self.blacklist.clear();
    }

    pub fn blacklisted_ips(&self) -> Vec<IpAddr> {
        let now = Instant::now();
        self.blacklist
            .iter()
            .filter(|entry| *entry.value() > now)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Periodic eviction of everything expired. Runs every minute.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.blacklist.retain(|_, expires| *expires > now);
        self.otps.retain(|_, request| request.expires > now);
        self.temp_tokens.retain(|_, token| token.expires > now);
        self.replay_sessions.retain(|_, session| session.expires > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const V4_LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const V6_LOCAL: IpAddr = IpAddr::V6(Ipv6Addr::LOCALHOST);
    const OUTSIDE: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));

    #[test]
    fn otp_is_single_use_and_case_insensitive() {
        let trust = TrustStore::default();
        let (ssid, otp) = trust.create_otp();
        assert_eq!(otp.len(), 6);
        let token = trust.verify_otp(ssid, &otp.to_uppercase(), V4_LOCAL);
        assert!(token.is_some());
        // The request was consumed by the first verification.
        assert!(trust.verify_otp(ssid, &otp, V4_LOCAL).is_none());
    }

    #[test]
    fn wrong_otp_fails() {
        let trust = TrustStore::default();
        let (ssid, _) = trust.create_otp();
        assert!(trust.verify_otp(ssid, "nope42", V4_LOCAL).is_none());
    }

    #[test]
    fn temp_token_binds_to_ip_with_loopback_equivalence() {
        let trust = TrustStore::default();
        let (ssid, otp) = trust.create_otp();
        let token = trust.verify_otp(ssid, &otp, V4_LOCAL).unwrap();

        assert!(trust.validate_temp_token(token, V4_LOCAL));
        // Any loopback is as good as the bound loopback.
        assert!(trust.validate_temp_token(token, V6_LOCAL));
        // A non-loopback presenter both fails and evicts the token.
        assert!(!trust.validate_temp_token(token, OUTSIDE));
        assert!(!trust.validate_temp_token(token, V4_LOCAL));
    }

    #[test]
    fn non_loopback_binding_is_strict() {
        let trust = TrustStore::default();
        let (ssid, otp) = trust.create_otp();
        let token = trust.verify_otp(ssid, &otp, OUTSIDE).unwrap();
        assert!(trust.validate_temp_token(token, OUTSIDE));
        assert!(!trust.validate_temp_token(token, V4_LOCAL));
    }

    #[test]
    fn blacklist_expires_lazily() {
        let trust = TrustStore::default();
        trust.blacklist_ip(OUTSIDE, Duration::from_secs(60));
        assert!(trust.is_blacklisted(OUTSIDE));
        assert!(!trust.is_blacklisted(V4_LOCAL));

        trust.blacklist_ip(V4_LOCAL, Duration::ZERO);
        assert!(!trust.is_blacklisted(V4_LOCAL));
        assert_eq!(trust.blacklisted_ips(), vec![OUTSIDE]);

        trust.remove_blacklisted(OUTSIDE);
        assert!(!trust.is_blacklisted(OUTSIDE));
    }

    #[test]
    fn repeated_otp_failures_blacklist_the_caller() {
        let trust = TrustStore::default();
        for _ in 0..OTP_FAILURE_LIMIT {
            assert!(trust.verify_otp(Uuid::new_v4(), "wrong!", OUTSIDE).is_none());
        }
        assert!(trust.is_blacklisted(OUTSIDE));
    }

    #[test]
    fn replay_sessions_expire_on_sweep() {
        let trust = TrustStore::default();
        let token = trust.create_replay_session(42);
        assert_eq!(trust.validate_replay_session(token), Some(42));
        trust.sweep();
        assert_eq!(trust.validate_replay_session(token), Some(42));
        assert_eq!(trust.validate_replay_session(Uuid::new_v4()), None);
    }
}
