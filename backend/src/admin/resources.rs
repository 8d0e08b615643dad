//! Tables exposed to the back office, and what it may do with each.

use serde_json::Value;

use crate::error::AppError;

#[derive(Debug)]
pub struct Resource {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    /// Columns accepted by create and update.
    pub writable: &'static [&'static str],
    /// Columns never returned, filtered or sorted on.
    pub hidden: &'static [&'static str],
    /// Columns matched by the free-text `q` parameter.
    pub search: &'static [&'static str],
    pub default_sort: &'static str,
    pub creatable: bool,
    pub deletable: bool,
}

impl Resource {
    pub fn is_visible(&self, column: &str) -> bool {
        self.columns.contains(&column) && !self.hidden.contains(&column)
    }

    pub fn is_writable(&self, column: &str) -> bool {
        self.writable.contains(&column)
    }

    pub fn touches_updated_at(&self) -> bool {
        self.columns.contains(&"updated_at")
    }

    /// Removes hidden columns from a row.
    pub fn scrub(&self, mut row: Value) -> Value {
        if let Value::Object(map) = &mut row {
            for column in self.hidden {
                map.remove(*column);
            }
        }
        row
    }
}

pub static RESOURCES: &[Resource] = &[
    Resource {
        name: "profiles",
        columns: &[
            "id", "email", "password_hash", "full_name", "phone", "avatar_url", "role", "email_confirmed",
            "is_verified", "created_at", "updated_at",
        ],
        writable: &["full_name", "phone", "avatar_url", "role", "email_confirmed", "is_verified"],
        hidden: &["password_hash"],
        search: &["email", "full_name", "phone"],
        default_sort: "created_at",
        creatable: false,
        deletable: true,
    },
    Resource {
        name: "properties",
        columns: &[
            "id", "owner_id", "agent_id", "title", "description", "property_type", "listing_type", "status",
            "price", "currency", "city", "address", "latitude", "longitude", "bedrooms", "bathrooms", "area_sqm",
            "amenities", "images", "is_featured", "created_at", "updated_at",
        ],
        writable: &[
            "owner_id", "agent_id", "title", "description", "property_type", "listing_type", "status", "price",
            "currency", "city", "address", "latitude", "longitude", "bedrooms", "bathrooms", "area_sqm",
            "amenities", "images", "is_featured",
        ],
        hidden: &[],
        search: &["title", "city", "address"],
        default_sort: "created_at",
        creatable: true,
        deletable: true,
    },
    Resource {
        name: "reservations",
        columns: &[
            "id", "property_id", "tenant_id", "owner_id", "start_date", "end_date", "amount", "currency",
            "phone_number", "status", "payment_status", "payment_reference", "created_at", "updated_at",
        ],
        writable: &["start_date", "end_date", "status"],
        hidden: &[],
        search: &["phone_number", "payment_reference"],
        default_sort: "created_at",
        creatable: false,
        deletable: false,
    },
    Resource {
        name: "transactions",
        columns: &[
            "id", "profile_id", "reservation_id", "withdrawal_id", "kind", "amount", "currency", "status",
            "provider_reference", "created_at", "updated_at",
        ],
        writable: &[],
        hidden: &[],
        search: &["kind", "provider_reference"],
        default_sort: "created_at",
        creatable: false,
        deletable: false,
    },
    Resource {
        name: "wallets",
        columns: &["id", "profile_id", "balance", "currency", "updated_at"],
        writable: &[],
        hidden: &[],
        search: &[],
        default_sort: "updated_at",
        creatable: false,
        deletable: false,
    },
    Resource {
        name: "withdrawal_requests",
        columns: &[
            "id", "wallet_id", "profile_id", "amount", "currency", "phone_number", "status", "provider_reference",
            "failure_reason", "created_at", "updated_at", "completed_at",
        ],
        writable: &[],
        hidden: &[],
        search: &["phone_number", "provider_reference"],
        default_sort: "created_at",
        creatable: false,
        deletable: false,
    },
    Resource {
        name: "messages",
        columns: &["id", "sender_id", "receiver_id", "property_id", "content", "is_read", "client_ref", "created_at"],
        writable: &["content", "is_read"],
        hidden: &[],
        search: &["content"],
        default_sort: "created_at",
        creatable: false,
        deletable: true,
    },
    Resource {
        name: "notifications",
        columns: &["id", "profile_id", "kind", "title", "body", "is_read", "created_at"],
        writable: &["profile_id", "kind", "title", "body", "is_read"],
        hidden: &[],
        search: &["title", "body"],
        default_sort: "created_at",
        creatable: true,
        deletable: true,
    },
    Resource {
        name: "commission_payments",
        columns: &["id", "reservation_id", "agent_id", "amount", "currency", "escrow_status", "created_at", "updated_at"],
        writable: &[],
        hidden: &[],
        search: &[],
        default_sort: "created_at",
        creatable: false,
        deletable: false,
    },
    Resource {
        name: "commission_disputes",
        columns: &[
            "id", "commission_payment_id", "raised_by", "reason", "status", "resolution", "created_at", "updated_at",
        ],
        writable: &["resolution"],
        hidden: &[],
        search: &["reason", "resolution"],
        default_sort: "created_at",
        creatable: false,
        deletable: false,
    },
    Resource {
        name: "agent_verifications",
        columns: &[
            "id", "profile_id", "license_number", "document_url", "status", "reviewer_id", "notes", "created_at",
            "updated_at",
        ],
        writable: &["notes"],
        hidden: &[],
        search: &["license_number"],
        default_sort: "created_at",
        creatable: false,
        deletable: false,
    },
    Resource {
        name: "property_reviews",
        columns: &["id", "property_id", "reviewer_id", "rating", "comment", "created_at"],
        writable: &["rating", "comment"],
        hidden: &[],
        search: &["comment"],
        default_sort: "created_at",
        creatable: false,
        deletable: true,
    },
    Resource {
        name: "property_views",
        columns: &["id", "property_id", "viewer_id", "created_at"],
        writable: &[],
        hidden: &[],
        search: &[],
        default_sort: "created_at",
        creatable: false,
        deletable: false,
    },
];

pub fn resource(name: &str) -> Result<&'static Resource, AppError> {
    RESOURCES
        .iter()
        .find(|r| r.name == name)
        .ok_or(AppError::NotFound("Resource"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_is_consistent() {
        for r in RESOURCES {
            assert!(r.columns.contains(&"id"), "{} has no id", r.name);
            assert!(r.is_visible(r.default_sort), "{} sorts on {}", r.name, r.default_sort);
            for column in r.writable.iter().chain(r.search).chain(r.hidden) {
                assert!(r.columns.contains(column), "{}.{} is not a column", r.name, column);
            }
            for column in r.writable.iter().chain(r.search) {
                assert!(!r.hidden.contains(column), "{}.{} is hidden", r.name, column);
            }
            assert!(!r.writable.contains(&"id"));
        }
        assert_eq!(RESOURCES.len(), 13);
    }

    #[test]
    fn auth_codes_are_not_exposed() {
        assert!(resource("auth_codes").is_err());
        assert!(resource("profiles").is_ok());
    }

    #[test]
    fn hidden_columns_are_scrubbed() {
        let profiles = resource("profiles").unwrap();
        let row = profiles.scrub(json!({ "id": "x", "email": "a@b.co", "password_hash": "sha256$1$a$b" }));
        assert_eq!(row, json!({ "id": "x", "email": "a@b.co" }));
        assert!(!profiles.is_visible("password_hash"));
        assert!(!profiles.is_writable("password_hash"));
    }
}
