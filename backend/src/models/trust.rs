use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::schema::agent_verifications;

text_enum!(VerificationStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

#[derive(Debug, Clone, Serialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = agent_verifications)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AgentVerification {
    pub id: Uuid,
    pub profile_id: Uuid,
    pub license_number: String,
    pub document_url: String,
    pub status: String,
    pub reviewer_id: Option<Uuid>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = agent_verifications)]
pub struct NewAgentVerification {
    pub profile_id: Uuid,
    pub license_number: String,
    pub document_url: String,
}
