use std::time::Duration;

use callguard::context::parse_grpc_timeout;
use callguard::identity::{bearer_token, TokenIssuer, TokenVerifier};
use callguard::limiter::{Admission, KeyedRateLimiter, RateLimiter};
use proptest::prelude::*;

const SECRET: &[u8] = b"property-test-secret-of-sufficient-size";

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn grpc_timeout_parser_never_panics(value in ".{0,16}") {
        let _ = parse_grpc_timeout(&value);
    }

    #[test]
    fn grpc_timeout_parses_every_well_formed_value(
        amount in 0u64..=99_999_999,
        unit in prop::sample::select(vec!['H', 'M', 'S', 'm', 'u', 'n']),
    ) {
        let expected = match unit {
            'H' => Duration::from_secs(amount * 3600),
            'M' => Duration::from_secs(amount * 60),
            'S' => Duration::from_secs(amount),
            'm' => Duration::from_millis(amount),
            'u' => Duration::from_micros(amount),
            _ => Duration::from_nanos(amount),
        };

        prop_assert_eq!(parse_grpc_timeout(&format!("{amount}{unit}")), Some(expected));
    }

    #[test]
    fn grpc_timeout_rejects_more_than_eight_digits(amount in 100_000_000u64..u64::MAX) {
        prop_assert_eq!(parse_grpc_timeout(&format!("{amount}S")), None);
    }

    #[test]
    fn bearer_token_never_returns_blank(value in "\\PC{0,64}") {
        if let Some(token) = bearer_token(&value) {
            prop_assert!(!token.is_empty());
            prop_assert!(!token.starts_with(' '));
        }
    }

    #[test]
    fn bearer_prefix_is_stripped(token in "[A-Za-z0-9._-]{1,64}") {
        prop_assume!(!token.eq_ignore_ascii_case("bearer"));
        let header = format!("Bearer {token}");
        prop_assert_eq!(bearer_token(&header), Some(token.as_str()));
        prop_assert_eq!(bearer_token(&token), Some(token.as_str()));
    }

    #[test]
    fn issued_credentials_verify_with_same_claims(
        subject in "[a-z0-9-]{1,40}",
        role in "[a-z]{1,16}",
    ) {
        let issued = TokenIssuer::new(SECRET, Duration::from_secs(60))
            .issue(&subject, &role)
            .unwrap();
        let claims = TokenVerifier::new(SECRET).verify(&issued.token).unwrap();

        prop_assert_eq!(claims.subject_id, subject);
        prop_assert_eq!(claims.role, role);
        prop_assert_eq!(claims.expires_at, issued.expires_at);
    }

    #[test]
    fn bucket_without_refill_admits_at_most_capacity(
        capacity in 1u32..64,
        attempts in 0usize..128,
    ) {
        let admitted = runtime().block_on(async {
            let limiter = RateLimiter::new(capacity, 0.0);
            let mut admitted = 0usize;
            for _ in 0..attempts {
                if limiter.try_acquire("any").await.is_ok() {
                    admitted += 1;
                }
            }
            admitted
        });

        prop_assert_eq!(admitted, attempts.min(capacity as usize));
    }

    #[test]
    fn keyed_buckets_are_independent(capacity in 1u32..16, keys in 1usize..8) {
        let admitted = runtime().block_on(async {
            let limiter = KeyedRateLimiter::new(capacity, 0.0);
            let mut admitted = 0usize;
            for key in 0..keys {
                for _ in 0..=capacity {
                    if limiter.try_acquire(&format!("caller-{key}")).await.is_ok() {
                        admitted += 1;
                    }
                }
            }
            admitted
        });

        prop_assert_eq!(admitted, keys * capacity as usize);
    }
}
