//! # Seed Domain Types
//!
//! The sync core treats records as opaque, but the LocalStore seeds a fresh
//! installation with two known records: the first administrator and the
//! business configuration. Their shapes live here.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Id of the seeded administrator.
pub const DEFAULT_ADMIN_ID: &str = "admin-1";

/// Id of the single business configuration record.
pub const APP_CONFIG_ID: &str = "app-config";

/// User role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "UPPERCASE")]
#[ts(export)]
pub enum UserRole {
    Admin,
    General,
    Operator,
}

/// Weighing modes a user may be allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum WeighingType {
    Batch,
    SoloPollo,
    SoloJabas,
}

/// An application user, as stored in the `users` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub name: String,
    pub role: UserRole,
    /// Who created this user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_modes: Option<Vec<WeighingType>>,
}

impl User {
    /// The administrator every fresh installation starts with.
    pub fn default_admin() -> Self {
        User {
            id: DEFAULT_ADMIN_ID.to_string(),
            username: "admin".to_string(),
            password: Some("123".to_string()),
            name: "Administrador Principal".to_string(),
            role: UserRole::Admin,
            parent_id: None,
            allowed_modes: None,
        }
    }
}

/// Business configuration, stored as the single record of the `config`
/// collection.
///
/// Remote credentials are deliberately not part of this record: it is
/// synchronised like any other collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct AppConfig {
    pub id: String,
    pub company_name: String,
    /// Base64 data URL or plain URL.
    pub logo_url: String,
    pub printer_connected: bool,
    pub scale_connected: bool,
    /// Crates per full-crate weighing.
    pub default_full_crate_batch: u32,
    /// Crates per empty-crate weighing.
    pub default_empty_crate_batch: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            id: APP_CONFIG_ID.to_string(),
            company_name: "Avícola Demo".to_string(),
            logo_url: String::new(),
            printer_connected: false,
            scale_connected: false,
            default_full_crate_batch: 5,
            default_empty_crate_batch: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Record;

    #[test]
    fn test_admin_round_trips_through_record() {
        let record = Record::from_typed(&User::default_admin()).unwrap();
        assert_eq!(record.id(), DEFAULT_ADMIN_ID);
        assert_eq!(record.get("role"), Some(&serde_json::json!("ADMIN")));
        let user: User = record.to_typed().unwrap();
        assert_eq!(user, User::default_admin());
    }

    #[test]
    fn test_app_config_wire_names() {
        let record = Record::from_typed(&AppConfig::default()).unwrap();
        assert_eq!(record.id(), APP_CONFIG_ID);
        assert_eq!(
            record.get("defaultFullCrateBatch"),
            Some(&serde_json::json!(5))
        );
    }
}
