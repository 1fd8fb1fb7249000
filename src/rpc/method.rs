//! Closed method tables.
//!
//! Every service declares its methods as a fieldless enum with a fixed wire
//! name per variant. Unknown names fail to resolve, so services reject them
//! without an open-ended string match.

/// A method of one service.
pub trait Method: Copy + Send + Sync + 'static {
    /// Wire name sent in the request header.
    fn name(self) -> &'static str;

    /// Resolve a wire name.
    fn from_name(name: &str) -> Option<Self>;
}

/// Declare a service's method enum together with its wire names.
macro_rules! rpc_methods {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $wire:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Every method of the service.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];
        }

        impl $crate::rpc::Method for $name {
            fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }

            fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($wire => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

pub(crate) use rpc_methods;
