use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod error;
pub mod instance_type;
pub mod supported_types;

pub use error::{Error, Result};
pub use instance_type::{Architecture, InstanceType};

/// Status label every reservation starts with.
pub const INITIAL_STATUS: &str = "Created";

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "provider_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Aws,
    Gcp,
    Azure,
    Noop,
    Unknown,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Aws => "aws",
            ProviderType::Gcp => "gcp",
            ProviderType::Azure => "azure",
            ProviderType::Noop => "noop",
            ProviderType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses provider names as reported by the sources registry.
/// Anything outside the table is rejected here instead of deep in dispatch.
impl FromStr for ProviderType {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "aws" | "amazon" => Ok(ProviderType::Aws),
            "gcp" | "google" => Ok(ProviderType::Gcp),
            "azure" => Ok(ProviderType::Azure),
            "noop" => Ok(ProviderType::Noop),
            "" | "unknown" => Ok(ProviderType::Unknown),
            _ => Err(Error::UnknownProvider(raw.to_string())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Created,
    InProgress,
    Succeeded,
    Failed,
}

impl ReservationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReservationState::Succeeded | ReservationState::Failed)
    }
}

// --- Reservation ---

/// Parameters the background worker needs to launch instances.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub source_id: String,
    /// AWS region or GCP zone.
    pub region: String,
    pub instance_type: String,
    pub amount: i32,
    pub image_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub power_off: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AwsDetail {
    pub launch: LaunchRequest,
    /// EC2 reservation id, known once the launch call returned.
    pub aws_reservation_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GcpDetail {
    pub launch: LaunchRequest,
    /// Long-running operation handle, known once the insert call returned.
    pub gcp_operation_name: Option<String>,
}

/// Provider-specific detail attached 1:1 to a reservation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ReservationDetail {
    Noop,
    Aws(AwsDetail),
    Gcp(GcpDetail),
}

impl ReservationDetail {
    pub fn provider(&self) -> ProviderType {
        match self {
            ReservationDetail::Noop => ProviderType::Noop,
            ReservationDetail::Aws(_) => ProviderType::Aws,
            ReservationDetail::Gcp(_) => ProviderType::Gcp,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Reservation<D = ReservationDetail> {
    pub id: i64,
    pub account_id: i64,
    pub provider: ProviderType,
    pub status: String,
    pub step: i64,
    /// `None` while pending.
    pub success: Option<bool>,
    /// Set iff `success == Some(false)`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Last progress report; `None` until the first status update.
    pub updated_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub detail: D,
}

pub type AwsReservation = Reservation<AwsDetail>;
pub type GcpReservation = Reservation<GcpDetail>;

impl<D> Reservation<D> {
    pub fn state(&self) -> ReservationState {
        match self.success {
            Some(true) => ReservationState::Succeeded,
            Some(false) => ReservationState::Failed,
            None if self.updated_at.is_some() => ReservationState::InProgress,
            None => ReservationState::Created,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.success.is_some()
    }

    fn with_detail<T>(self, detail: T) -> Reservation<T> {
        Reservation {
            id: self.id,
            account_id: self.account_id,
            provider: self.provider,
            status: self.status,
            step: self.step,
            success: self.success,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
            detail,
        }
    }
}

impl Reservation {
    pub fn into_aws(self) -> Option<AwsReservation> {
        match self.detail.clone() {
            ReservationDetail::Aws(detail) => Some(self.with_detail(detail)),
            _ => None,
        }
    }

    pub fn into_gcp(self) -> Option<GcpReservation> {
        match self.detail.clone() {
            ReservationDetail::Gcp(detail) => Some(self.with_detail(detail)),
            _ => None,
        }
    }
}

/// Compute instance created on behalf of a reservation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ReservationInstance {
    pub reservation_id: i64,
    pub instance_id: String,
}

// --- Tenancy ---

/// Tenant record. Identities carry an org id, an account number or both; each
/// one maps to at most one account.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub org_id: Option<String>,
    pub account_number: Option<String>,
}

/// SSH public key uploaded by a tenant. Names are unique within an account.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Pubkey {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub body: String,
}

/// A pubkey imported into one provider, e.g. an EC2 key pair.
/// At most one per (pubkey, provider).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PubkeyResource {
    pub id: i64,
    pub pubkey_id: i64,
    pub provider: ProviderType,
    /// Provider-side identifier of the imported key.
    pub handle: String,
    /// Name the key was imported under.
    pub tag: String,
}
