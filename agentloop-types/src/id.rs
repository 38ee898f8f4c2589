//! Typed identifiers for the data model.
//!
//! Plain `String` ids are easy to mix up across call sites (passing a
//! `tool_call_id` where a `turn_id` is expected still compiles). The
//! [`typed_id`] macro generates a newtype per identifier kind so the
//! compiler catches the swap.

/// Generates a `Copy`-ineligible, `Display`/`serde`-transparent string
/// identifier newtype.
macro_rules! typed_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Builds an id from any string-like value.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrows the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

typed_id!(RunId);
typed_id!(TurnId);
typed_id!(ToolCallId);
typed_id!(MessageId);
