//! Broker connection records, resolved by name.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use sqlx::FromRow;

/// Row as stored in the broker directory.
#[derive(Debug, Clone, FromRow)]
pub struct BrokerRecord {
    pub name: String,
    pub url: String,
    pub vpn: String,
    pub username: String,
    pub password: String,
    pub status: bool,
    pub created_on: DateTime<Utc>,
    pub last_tested: Option<DateTime<Utc>>,
}

/// Connection descriptor for a broker management API.
///
/// `url` is the configuration API base, e.g.
/// `https://broker:943/SEMP/v2/config`.
#[derive(Debug, Clone)]
pub struct Broker {
    pub name: String,
    pub url: String,
    pub vpn: String,
    pub username: String,
    pub password: Secret<String>,
}

impl Broker {
    pub fn new(name: &str, url: &str, vpn: &str, username: &str, password: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.trim_end_matches('/').to_string(),
            vpn: vpn.to_string(),
            username: username.to_string(),
            password: Secret::new(password.to_string()),
        }
    }

    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl From<BrokerRecord> for Broker {
    fn from(record: BrokerRecord) -> Self {
        Broker::new(
            &record.name,
            &record.url,
            &record.vpn,
            &record.username,
            &record.password,
        )
    }
}
