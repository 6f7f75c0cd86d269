use serde::{Deserialize, Serialize};

/// A CRM contact, as much of it as the booking flows need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "firstName")]
    pub first_name: Option<String>,
    #[serde(default, alias = "phoneNumber")]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl Contact {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.first_name.as_deref())
            .unwrap_or("Cliente")
    }
}

/// A calendar event row: both real appointments and blocked slots come back
/// in this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "startTime")]
    pub start_time: Option<String>,
    #[serde(default, rename = "endTime")]
    pub end_time: Option<String>,
    #[serde(default, rename = "appointmentStatus")]
    pub appointment_status: Option<String>,
    #[serde(default, rename = "contactId")]
    pub contact_id: Option<String>,
    #[serde(default, rename = "calendarId")]
    pub calendar_id: Option<String>,
}

/// One free slot normalized out of the free-slots response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeSlot {
    /// `YYYY-MM-DD`
    pub date: String,
    /// `HH:MM`
    pub time: String,
    /// Fully qualified instant string, e.g. `2025-06-09T14:00:00`.
    pub datetime: String,
}

/// OAuth token endpoint response. `refresh_token` is present only when the
/// CRM rotates it.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default, rename = "locationId")]
    pub location_id: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}
fn default_token_type() -> String {
    "Bearer".to_string()
}
