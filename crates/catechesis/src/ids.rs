//! UUID-backed identifiers. Stored as hyphenated text in every store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $entity:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub const fn entity() -> &'static str {
                $entity
            }

            /// Parse a stored or path value, reporting malformed ids as validation errors.
            pub fn parse(raw: &str) -> Result<Self, PipelineError> {
                raw.parse().map_err(|_| {
                    PipelineError::validation(format!("malformed {} id '{raw}'", $entity))
                })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(value.trim()).map(Self)
            }
        }
    };
}

uuid_id!(
    /// A system actor: guardian, staff member, or administrator.
    ProfileId,
    "profile"
);
uuid_id!(
    /// One child's registration for one catechetical year.
    EnrollmentId,
    "enrollment"
);
uuid_id!(DocumentId, "document");
uuid_id!(PaymentId, "payment");
uuid_id!(ClassId, "class");

/// Decode an optional id column.
pub(crate) fn parse_optional<T>(raw: Option<String>) -> Result<Option<T>, PipelineError>
where
    T: FromStr,
{
    raw.map(|value| {
        value
            .parse::<T>()
            .map_err(|_| PipelineError::Store(format!("corrupt id column value '{value}'")))
    })
    .transpose()
}

/// Decode a required id column.
pub(crate) fn parse_stored<T>(raw: &str) -> Result<T, PipelineError>
where
    T: FromStr,
{
    raw.parse::<T>()
        .map_err(|_| PipelineError::Store(format!("corrupt id column value '{raw}'")))
}
