//! Admin session: a single authenticated flag guarding the destructive and
//! export operations on the attendance table.

use crate::attendance::{AttendanceError, AttendanceLog};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::NaiveDateTime;
use thiserror::Error;

/// File name suggested for exported tables.
pub const EXPORT_FILE_NAME: &str = "attendance.csv";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("incorrect admin password")]
    AuthenticationFailed,
    #[error("admin login required")]
    NotAuthenticated,
    #[error(transparent)]
    Attendance(#[from] AttendanceError),
}

/// The attendance table encoded for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBlob {
    pub file_name: String,
    pub mime_type: String,
    /// Base64 of the CSV text.
    pub encoded: String,
}

impl ExportBlob {
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.encoded)
    }

    /// Decode back to the CSV bytes.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.encoded)
    }
}

/// Authentication state for one interactive session.
///
/// Starts logged out; [`logout`](Self::logout) or dropping the session ends
/// the authenticated state. Nothing is persisted.
pub struct AdminSession {
    credential: String,
    authenticated: bool,
}

impl AdminSession {
    pub fn new(credential: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
            authenticated: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Compare `password` with the session credential. A failed attempt
    /// leaves the current state untouched.
    pub fn login(&mut self, password: &str) -> Result<(), SessionError> {
        if password != self.credential {
            tracing::warn!("admin login failed");
            return Err(SessionError::AuthenticationFailed);
        }
        self.authenticated = true;
        tracing::info!("admin logged in");
        Ok(())
    }

    pub fn logout(&mut self) {
        if self.authenticated {
            tracing::info!("admin logged out");
        }
        self.authenticated = false;
    }

    fn require_admin(&self) -> Result<(), SessionError> {
        if self.authenticated {
            Ok(())
        } else {
            Err(SessionError::NotAuthenticated)
        }
    }

    pub fn clear_today(&self, log: &mut AttendanceLog, now: NaiveDateTime) -> Result<usize, SessionError> {
        self.require_admin()?;
        Ok(log.clear_today(now)?)
    }

    pub fn clear_all(&self, log: &mut AttendanceLog) -> Result<(), SessionError> {
        self.require_admin()?;
        Ok(log.clear_all()?)
    }

    pub fn export(&self, log: &AttendanceLog) -> Result<ExportBlob, SessionError> {
        self.require_admin()?;
        let csv = log.to_csv()?;
        Ok(ExportBlob {
            file_name: EXPORT_FILE_NAME.to_string(),
            mime_type: "file/csv".to_string(),
            encoded: BASE64.encode(csv.as_bytes()),
        })
    }
}
