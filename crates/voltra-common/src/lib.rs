// SPDX-License-Identifier: MIT

//! Common types and helpers shared by the Voltra crates.

/// Implements `From<$from>` for an error enum variant that wraps the inner
/// error. Keeps error plumbing in the consensus crates down to one line per
/// conversion.
#[macro_export]
macro_rules! impl_error_from {
    ($thing:ty, $from_thing:ty, $field:ident) => {
        impl From<$from_thing> for $thing {
            fn from(e: $from_thing) -> Self {
                <$thing>::$field(e)
            }
        }
    };
}

pub mod prelude {
    //! Collection types and traits used throughout the workspace, imported
    //! in one line as `use voltra_common::prelude::*;`.
    pub use std::collections::BTreeMap;
    pub use std::collections::BTreeSet;
    pub use std::collections::HashMap;
    pub use std::collections::HashSet;
    pub use std::fmt;
    pub use std::fmt::Display;
    pub use std::fmt::Formatter;
}
