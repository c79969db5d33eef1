//! Session state and its cookie encoding
//!
//! A session is never stored server-side. It lives in the cookie as either
//! the bare `email-or-user[,group...]` form, or the four field form
//! `user-and-groups|enc(access_token)|expiry|enc(refresh_token)` when a
//! cipher is configured and there is an access token to protect.
//!
//! `,` and `|` are delimiters and are not escaped. Only the email is stored
//! when there is one, and the user is its local part. Sessions that would not
//! survive the encoding are refused by [`SessionState::check_encodable`]
//! before they are ever encoded.

mod cipher;

use std::fmt;

use chrono::{DateTime, Duration, SubsecRound, Utc};

pub use cipher::Cipher;

/// Session encoding and decryption errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Wrong number of `|` separated fields
    #[error("invalid number of fields (got {0} expected 4)")]
    FieldCount(usize),

    /// Expiry field is not a Unix timestamp
    #[error("invalid expiry timestamp: {0:?}")]
    Timestamp(String),

    /// Token field failed to decrypt or encrypt
    #[error("cookie cipher error: {0}")]
    Crypto(String),

    /// The user of a session with an email is not the email's local part
    #[error("user {user:?} does not match email {email:?}")]
    UserMismatch {
        /// Session user
        user: String,
        /// Session email
        email: String,
    },

    /// Token lifetime overflows the expiry timestamp
    #[error("token lifetime of {0}s is out of range")]
    Lifetime(i64),

    /// A field contains a reserved delimiter
    #[error("{field} contains a reserved character (',' or '|'): {value:?}")]
    ReservedCharacter {
        /// Offending field
        field: &'static str,
        /// Offending value
        value: String,
    },
}

/// Authenticated identity and credentials of one visitor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// OAuth access token (may be empty)
    pub access_token: String,
    /// OAuth refresh token (may be empty)
    pub refresh_token: String,
    /// Absolute expiry of the access token, `None` = never expires
    pub expires_on: Option<DateTime<Utc>>,
    /// Verified email address
    pub email: String,
    /// Username or subject
    pub user: String,
    /// Group memberships, in provider order
    pub groups: Vec<String>,
}

impl SessionState {
    /// True iff an expiry is set and lies strictly in the past
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_on.is_some_and(|at| at < Utc::now())
    }

    /// Set the expiry `seconds` from now, at whole-second precision so the
    /// value survives the cookie round trip unchanged
    pub fn set_expires_in(&mut self, seconds: i64) -> Result<(), SessionError> {
        let expires_on = Duration::try_seconds(seconds)
            .and_then(|lifetime| Utc::now().trunc_subsecs(0).checked_add_signed(lifetime))
            .ok_or(SessionError::Lifetime(seconds))?;
        self.expires_on = Some(expires_on);
        Ok(())
    }

    /// Identity passed upstream in `GAP-Auth` and `X-Forwarded-User`
    #[must_use]
    pub fn user_or_email(&self) -> &str {
        if self.user.is_empty() {
            &self.email
        } else {
            &self.user
        }
    }

    fn user_and_groups(&self) -> String {
        let mut out = if self.email.is_empty() {
            self.user.clone()
        } else {
            self.email.clone()
        };
        for group in &self.groups {
            out.push(',');
            out.push_str(group);
        }
        out
    }

    /// Refuse values that would corrupt the delimited cookie encoding
    pub fn check_delimiters(&self) -> Result<(), SessionError> {
        let reserved = |s: &str| s.contains(',') || s.contains('|');
        let fields = [("user", &self.user), ("email", &self.email)];
        for (field, value) in fields {
            if reserved(value) {
                return Err(SessionError::ReservedCharacter {
                    field,
                    value: value.clone(),
                });
            }
        }
        if let Some(group) = self.groups.iter().find(|g| reserved(g)) {
            return Err(SessionError::ReservedCharacter {
                field: "group",
                value: group.clone(),
            });
        }
        Ok(())
    }

    /// Refuse sessions that [`SessionState::decode`] would not give back
    /// unchanged
    pub fn check_encodable(&self) -> Result<(), SessionError> {
        self.check_delimiters()?;
        if self.email.is_empty() {
            return Ok(());
        }
        match self.email.split_once('@') {
            Some((local, _)) if local == self.user => Ok(()),
            _ => Err(SessionError::UserMismatch {
                user: self.user.clone(),
                email: self.email.clone(),
            }),
        }
    }

    /// Encode for the cookie. Without a cipher, or without an access token,
    /// only the user and groups are kept.
    pub fn encode(&self, cipher: Option<&Cipher>) -> Result<String, SessionError> {
        let Some(cipher) = cipher else {
            return Ok(self.user_and_groups());
        };
        if self.access_token.is_empty() {
            return Ok(self.user_and_groups());
        }

        let encrypt = |token: &str| {
            if token.is_empty() {
                Ok(String::new())
            } else {
                cipher.encrypt(token)
            }
        };
        let access = encrypt(&self.access_token)?;
        let refresh = encrypt(&self.refresh_token)?;
        let expiry = self.expires_on.map_or(0, |at| at.timestamp());

        Ok(format!(
            "{}|{access}|{expiry}|{refresh}",
            self.user_and_groups()
        ))
    }

    /// Decode a cookie value produced by [`SessionState::encode`]
    pub fn decode(raw: &str, cipher: Option<&Cipher>) -> Result<Self, SessionError> {
        let chunks: Vec<&str> = raw.split('|').collect();

        if chunks.len() == 1 {
            let mut session = Self::default();
            session.set_user_and_groups(chunks[0]);
            return Ok(session);
        }

        if chunks.len() != 4 {
            return Err(SessionError::FieldCount(chunks.len()));
        }

        let mut session = Self::default();
        let decrypt = |field: &str| match (field.is_empty(), cipher) {
            (true, _) => Ok(String::new()),
            (false, Some(cipher)) => cipher.decrypt(field),
            (false, None) => Err(SessionError::Crypto("encrypted field without cipher".to_string())),
        };
        session.access_token = decrypt(chunks[1])?;
        session.refresh_token = decrypt(chunks[3])?;

        session.set_user_and_groups(chunks[0]);

        let ts: i64 = chunks[2]
            .parse()
            .map_err(|_| SessionError::Timestamp(chunks[2].to_string()))?;
        // Anything at or before the epoch is the "never expires" marker
        session.expires_on = if ts > 0 {
            DateTime::from_timestamp(ts, 0)
        } else {
            None
        };

        Ok(session)
    }

    fn set_user_and_groups(&mut self, value: &str) {
        let mut parts = value.split(',');
        let first = parts.next().unwrap_or_default();
        if let Some((local, _)) = first.split_once('@') {
            self.email = first.to_string();
            self.user = local.to_string();
        } else {
            self.user = first.to_string();
        }
        self.groups = parts.map(str::to_string).collect();
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session{{{}", self.user_and_groups())?;
        if !self.access_token.is_empty() {
            f.write_str(" token:true")?;
        }
        if let Some(at) = self.expires_on {
            write!(f, " expires:{at}")?;
        }
        if !self.refresh_token.is_empty() {
            f.write_str(" refresh_token:true")?;
        }
        f.write_str("}")
    }
}
