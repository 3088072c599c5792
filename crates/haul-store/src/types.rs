use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifetime requested for a transfer when its upload session is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
pub enum ExpirySpec {
  #[serde(rename = "5m")]
  #[sqlx(rename = "5m")]
  FiveMinutes,
  #[serde(rename = "3h")]
  #[sqlx(rename = "3h")]
  ThreeHours,
  #[serde(rename = "12h")]
  #[sqlx(rename = "12h")]
  TwelveHours,
  #[serde(rename = "1d")]
  #[sqlx(rename = "1d")]
  OneDay,
  #[serde(rename = "3d")]
  #[sqlx(rename = "3d")]
  ThreeDays,
  #[serde(rename = "1w")]
  #[sqlx(rename = "1w")]
  OneWeek,
  #[serde(rename = "never")]
  #[sqlx(rename = "never")]
  Never,
}

impl ExpirySpec {
  /// Every accepted value, in ascending lifetime order.
  pub const ALL: [ExpirySpec; 7] = [
    ExpirySpec::FiveMinutes,
    ExpirySpec::ThreeHours,
    ExpirySpec::TwelveHours,
    ExpirySpec::OneDay,
    ExpirySpec::ThreeDays,
    ExpirySpec::OneWeek,
    ExpirySpec::Never,
  ];

  /// The textual form accepted by [`FromStr`].
  pub fn as_str(&self) -> &'static str {
    match self {
      ExpirySpec::FiveMinutes => "5m",
      ExpirySpec::ThreeHours => "3h",
      ExpirySpec::TwelveHours => "12h",
      ExpirySpec::OneDay => "1d",
      ExpirySpec::ThreeDays => "3d",
      ExpirySpec::OneWeek => "1w",
      ExpirySpec::Never => "never",
    }
  }

  /// How long a transfer lives, or `None` if it never expires.
  pub fn lifetime(&self) -> Option<Duration> {
    match self {
      ExpirySpec::FiveMinutes => Some(Duration::minutes(5)),
      ExpirySpec::ThreeHours => Some(Duration::hours(3)),
      ExpirySpec::TwelveHours => Some(Duration::hours(12)),
      ExpirySpec::OneDay => Some(Duration::hours(24)),
      ExpirySpec::ThreeDays => Some(Duration::hours(72)),
      ExpirySpec::OneWeek => Some(Duration::hours(168)),
      ExpirySpec::Never => None,
    }
  }

  /// Absolute expiry instant measured from `now`.
  pub fn resolve(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    self.lifetime().map(|lifetime| now + lifetime)
  }
}

impl fmt::Display for ExpirySpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Returned when an expiry string is not one of the accepted values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid expiry value '{0}': expected one of 5m, 3h, 12h, 1d, 3d, 1w, never")]
pub struct ParseExpiryError(pub String);

impl FromStr for ExpirySpec {
  type Err = ParseExpiryError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    ExpirySpec::ALL
      .into_iter()
      .find(|spec| spec.as_str() == s)
      .ok_or_else(|| ParseExpiryError(s.to_string()))
  }
}

/// An upload session that has not been finalized yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PendingUpload {
  pub id: Uuid,
  pub owner_id: Uuid,
  pub declared_size: i64,
  pub message: String,
  pub expiry: ExpirySpec,
  pub created_at: DateTime<Utc>,
  pub last_updated_at: DateTime<Utc>,
}

/// One accepted chunk of an upload session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ChunkRecord {
  pub id: Uuid,
  pub session_id: Uuid,
  pub chunk_index: u32,
  pub uploaded_at: DateTime<Utc>,
}

/// A finalized transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Transfer {
  pub id: Uuid,
  pub owner_id: Uuid,
  pub storage_path: String,
  pub total_size: i64,
  pub message: String,
  pub created_at: DateTime<Utc>,
  pub expires_at: Option<DateTime<Utc>>,
}

impl Transfer {
  /// Whether the transfer has an expiry at or before `now`.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|at| at <= now)
  }
}

/// A file belonging to a finalized transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TransferFile {
  pub id: Uuid,
  pub name: String,
  pub size: i64,
  pub storage_path: String,
  pub transfer_id: Uuid,
  pub extension: String,
  pub active_streams: i64,
}
