//! Identifier newtypes shared by the simulation crates.
//!
//! Joint and part ids are chosen by the caller (they are the names the
//! gameplay layer uses), so they are plain signed integers wrapped for type
//! safety. Entity ids are assigned by the world.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $raw:ty, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        pub struct $name(pub $raw);

        impl $name {
            /// Create a new id.
            #[must_use]
            pub const fn new(id: $raw) -> Self {
                Self(id)
            }

            /// Get the raw id value.
            #[must_use]
            pub const fn raw(self) -> $raw {
                self.0
            }
        }

        impl From<$raw> for $name {
            fn from(id: $raw) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($label, "({})"), self.0)
            }
        }
    };
}

id_type!(
    /// Caller-chosen identifier of a joint inside one articulated entity.
    JointId,
    i32,
    "Joint"
);

id_type!(
    /// Caller-chosen identifier of a geometry part.
    PartId,
    i32,
    "Part"
);

id_type!(
    /// World-assigned identifier of a physical entity.
    EntityId,
    u64,
    "Entity"
);
