use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.into())
            }
        }
    };
}

id!(
    /// Opaque transport id, media lines refer to their transport with it
    TransportId
);
id!(
    /// Media line identification (`mid`)
    MediaLineId
);
id!(SenderId);
id!(ReceiverId);

/// Generate the next free id of the form `{prefix}{n}`
pub(crate) fn next_free<T>(
    counter: &mut u64,
    prefix: &str,
    make: impl Fn(String) -> T,
    taken: impl Fn(&T) -> bool,
) -> T {
    loop {
        let id = make(format!("{prefix}{counter}"));
        *counter += 1;

        if !taken(&id) {
            return id;
        }
    }
}
