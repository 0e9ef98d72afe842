use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;
const TOKEN_VERSION_V1: &str = "v1";
const MAX_TOKEN_LEN: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "CEO")]
    Ceo,
    #[serde(rename = "BRANCH_HEAD", alias = "CHANNEL_PARTNER")]
    BranchHead,
    #[serde(rename = "TRAINER")]
    Trainer,
    #[serde(rename = "STUDENT")]
    Student,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CEO" => Some(Self::Ceo),
            "BRANCH_HEAD" | "CHANNEL_PARTNER" => Some(Self::BranchHead),
            "TRAINER" => Some(Self::Trainer),
            "STUDENT" => Some(Self::Student),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ceo => "CEO",
            Self::BranchHead => "BRANCH_HEAD",
            Self::Trainer => "TRAINER",
            Self::Student => "STUDENT",
        }
    }
}

/// The authenticated identity behind a request, as currently stored.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub branch_id: Option<String>,
}

impl Caller {
    pub fn is_ceo(&self) -> bool {
        self.role == Role::Ceo
    }

    pub fn require(&self, allowed: &[Role]) -> AppResult<()> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(AppError::forbidden(format!(
                "role {} may not perform this action",
                self.role.as_str()
            )))
        }
    }
}

pub fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::encode_b64(Uuid::new_v4().as_bytes())
        .map_err(|e| anyhow::anyhow!("salt encoding failed: {e}"))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

pub fn validate_password(password: &str) -> AppResult<()> {
    if password.chars().count() < 8 {
        return Err(AppError::bad_params("password must be at least 8 characters"));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub sub: String,
    pub role: Role,
    pub branch_id: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

pub fn issue_token(claims: &TokenClaims, secret: &[u8]) -> AppResult<String> {
    let payload = serde_json::to_vec(claims).map_err(anyhow::Error::from)?;
    let payload_part = URL_SAFE_NO_PAD.encode(payload);
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| anyhow::anyhow!("hmac init failed: {e}"))?;
    mac.update(payload_part.as_bytes());
    let sig_part = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{}.{}.{}", TOKEN_VERSION_V1, payload_part, sig_part))
}

pub fn decode_token(token: &str, secret: &[u8], now: i64) -> AppResult<TokenClaims> {
    let invalid = || AppError::Unauthorized("invalid token".to_string());
    if token.len() > MAX_TOKEN_LEN {
        return Err(invalid());
    }
    let mut parts = token.splitn(3, '.');
    let (Some(version), Some(payload_part), Some(sig_part)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    if version != TOKEN_VERSION_V1 {
        return Err(invalid());
    }

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| anyhow::anyhow!("hmac init failed: {e}"))?;
    mac.update(payload_part.as_bytes());
    let sig = URL_SAFE_NO_PAD.decode(sig_part).map_err(|_| invalid())?;
    mac.verify_slice(&sig).map_err(|_| invalid())?;

    let payload = URL_SAFE_NO_PAD.decode(payload_part).map_err(|_| invalid())?;
    let claims: TokenClaims = serde_json::from_slice(&payload).map_err(|_| invalid())?;
    if claims.exp <= now {
        return Err(AppError::Unauthorized("token expired".to_string()));
    }
    Ok(claims)
}

pub fn load_caller(conn: &Connection, user_id: &str) -> AppResult<Option<(Caller, bool)>> {
    let row = conn
        .query_row(
            "SELECT id, email, full_name, role, branch_id, active FROM users WHERE id = ?",
            [user_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, i64>(5)? != 0,
                ))
            },
        )
        .optional()?;
    let Some((id, email, full_name, role_raw, branch_id, active)) = row else {
        return Ok(None);
    };
    let role = Role::parse(&role_raw)
        .ok_or_else(|| anyhow::anyhow!("user {id} has unknown role {role_raw}"))?;
    Ok(Some((
        Caller {
            user_id: id,
            email,
            full_name,
            role,
            branch_id,
        },
        active,
    )))
}

/// Resolves a bearer token to the caller as the store currently sees them.
pub fn authenticate(conn: &Connection, token: &str, secret: &[u8]) -> AppResult<Caller> {
    let now = chrono::Utc::now().timestamp();
    let claims = decode_token(token, secret, now)?;
    match load_caller(conn, &claims.sub)? {
        Some((caller, true)) => Ok(caller),
        Some((_, false)) => Err(AppError::Unauthorized("account is inactive".to_string())),
        None => Err(AppError::Unauthorized("unknown account".to_string())),
    }
}
