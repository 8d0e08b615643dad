//! One-time codes for e-mail confirmation and password recovery.

use chrono::{DateTime, Duration, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{AuthCode, CodePurpose, NewAuthCode};
use crate::schema::auth_codes;

pub const MAX_ATTEMPTS: i32 = 5;

pub fn code_ttl() -> Duration {
    Duration::minutes(10)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeCheck {
    Valid,
    Mismatch,
    Expired,
    Consumed,
    Exhausted,
}

pub fn generate_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

pub fn hash_code(profile_id: Uuid, code: &str) -> String {
    let digest = Sha256::new()
        .chain_update(profile_id.as_bytes())
        .chain_update(code.trim().as_bytes())
        .finalize();
    hex::encode(digest)
}

pub fn check_code(record: &AuthCode, code: &str, now: DateTime<Utc>) -> CodeCheck {
    if record.consumed_at.is_some() {
        CodeCheck::Consumed
    } else if record.expires_at <= now {
        CodeCheck::Expired
    } else if record.attempts >= MAX_ATTEMPTS {
        CodeCheck::Exhausted
    } else if !bool::from(hash_code(record.profile_id, code).as_bytes().ct_eq(record.code_hash.as_bytes())) {
        CodeCheck::Mismatch
    } else {
        CodeCheck::Valid
    }
}

/// Issues a fresh code, retiring any outstanding code for the same purpose.
pub fn issue(conn: &mut PgConnection, profile_id: Uuid, purpose: CodePurpose) -> Result<String, AppError> {
    let code = generate_code();
    let now = Utc::now();
    conn.transaction::<_, AppError, _>(|conn| {
        diesel::update(
            auth_codes::table
                .filter(auth_codes::profile_id.eq(profile_id))
                .filter(auth_codes::purpose.eq(purpose.as_str()))
                .filter(auth_codes::consumed_at.is_null()),
        )
        .set(auth_codes::consumed_at.eq(now))
        .execute(conn)?;

        diesel::insert_into(auth_codes::table)
            .values(NewAuthCode {
                profile_id,
                purpose: purpose.as_str().to_string(),
                code_hash: hash_code(profile_id, &code),
                expires_at: now + code_ttl(),
            })
            .execute(conn)?;
        Ok(())
    })?;
    Ok(code)
}

/// Consumes the outstanding code for `purpose` if `code` matches it.
pub fn verify(conn: &mut PgConnection, profile_id: Uuid, purpose: CodePurpose, code: &str) -> Result<(), AppError> {
    let invalid = || AppError::validation("Invalid or expired code");
    let record = auth_codes::table
        .filter(auth_codes::profile_id.eq(profile_id))
        .filter(auth_codes::purpose.eq(purpose.as_str()))
        .filter(auth_codes::consumed_at.is_null())
        .order(auth_codes::created_at.desc())
        .select(AuthCode::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(invalid)?;

    let now = Utc::now();
    match check_code(&record, code, now) {
        CodeCheck::Valid => {
            diesel::update(auth_codes::table.find(record.id))
                .set(auth_codes::consumed_at.eq(now))
                .execute(conn)?;
            Ok(())
        }
        CodeCheck::Mismatch => {
            diesel::update(auth_codes::table.find(record.id))
                .set(auth_codes::attempts.eq(auth_codes::attempts + 1))
                .execute(conn)?;
            Err(invalid())
        }
        CodeCheck::Exhausted => Err(AppError::RateLimited),
        CodeCheck::Expired | CodeCheck::Consumed => Err(invalid()),
    }
}

/// Development delivery channel: codes are written to the log.
pub fn deliver(email: &str, purpose: CodePurpose, code: &str) {
    log::info!("Delivering {} code to {}: {}", purpose, email, code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(code: &str) -> AuthCode {
        let profile_id = Uuid::new_v4();
        let now = Utc::now();
        AuthCode {
            id: Uuid::new_v4(),
            profile_id,
            purpose: CodePurpose::Signup.as_str().to_string(),
            code_hash: hash_code(profile_id, code),
            attempts: 0,
            expires_at: now + code_ttl(),
            consumed_at: None,
            created_at: now,
        }
    }

    #[test]
    fn codes_are_six_digits() {
        for _ in 0..50 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn matching_code_is_valid() {
        let rec = record("123456");
        assert_eq!(check_code(&rec, "123456", Utc::now()), CodeCheck::Valid);
        assert_eq!(check_code(&rec, " 123456 ", Utc::now()), CodeCheck::Valid);
        assert_eq!(check_code(&rec, "654321", Utc::now()), CodeCheck::Mismatch);
    }

    #[test]
    fn expired_consumed_and_exhausted_codes_fail() {
        let rec = record("123456");
        assert_eq!(check_code(&rec, "123456", Utc::now() + Duration::minutes(11)), CodeCheck::Expired);

        let mut used = record("123456");
        used.consumed_at = Some(Utc::now());
        assert_eq!(check_code(&used, "123456", Utc::now()), CodeCheck::Consumed);

        let mut hammered = record("123456");
        hammered.attempts = MAX_ATTEMPTS;
        assert_eq!(check_code(&hammered, "123456", Utc::now()), CodeCheck::Exhausted);
    }

    #[test]
    fn code_hash_is_bound_to_profile() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(hash_code(a, "111111"), hash_code(b, "111111"));
    }
}
