//! Row types for every marketplace table plus the text-backed status enums.

/// Declares a status enum stored as text, with its wire spelling.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::error::AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(crate::error::AppError::Validation(format!(
                        "Unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

mod booking;
mod finance;
mod messaging;
mod profile;
mod property;
mod trust;

pub use booking::*;
pub use finance::*;
pub use messaging::*;
pub use profile::*;
pub use property::*;
pub use trust::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_text_matches_database_spelling() {
        assert_eq!(WithdrawalStatus::Successful.as_str(), "SUCCESSFUL");
        assert_eq!(EscrowStatus::Locked.as_str(), "locked");
        assert_eq!(Role::from_str("landlord").unwrap(), Role::Landlord);
        assert!(PropertyType::from_str("castle").is_err());
    }

    #[test]
    fn serde_uses_the_same_spelling() {
        let json = serde_json::to_string(&WithdrawalStatus::Expired).unwrap();
        assert_eq!(json, "\"EXPIRED\"");
        let parsed: ListingType = serde_json::from_str("\"rent\"").unwrap();
        assert_eq!(parsed, ListingType::Rent);
    }

    #[test]
    fn terminal_withdrawal_states() {
        assert!(!WithdrawalStatus::Pending.is_terminal());
        assert!(!WithdrawalStatus::Unknown.is_terminal());
        for status in [WithdrawalStatus::Successful, WithdrawalStatus::Failed, WithdrawalStatus::Expired] {
            assert!(status.is_terminal());
        }
    }
}
