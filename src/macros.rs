/// Declares a closed set of wire tokens together with its parse error.
///
/// For `wire_tokens! { Name / NameError: "label" { Variant => "wire", .. } }`
/// this emits:
/// - `enum Name` (`Copy`, `Hash`, non-exhaustive) with `Name::ALL` and
///   `as_str()`
/// - `Display` / `AsRef<str>` writing the wire token
/// - `FromStr`, ASCII case-insensitive and whitespace-trimmed
/// - `struct NameError(pub String)` whose message is `unknown <label>: <input>`
macro_rules! wire_tokens {
    (
        $(#[$enum_meta:meta])*
        $vis:vis $Name:ident / $Err:ident : $label:literal {
            $(
                $(#[$var_meta:meta])*
                $variant:ident => $wire:literal
            ),+ $(,)?
        }
    ) => {
        #[doc = concat!("Error returned when parsing an unrecognized ", $label, ".")]
        #[derive(Debug, Clone, PartialEq, Eq)]
        $vis struct $Err(pub String);

        impl std::fmt::Display for $Err {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!("unknown ", $label, ": {}"), self.0)
            }
        }

        impl std::error::Error for $Err {}

        $(#[$enum_meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        $vis enum $Name {
            $(
                $(#[$var_meta])*
                $variant,
            )+
        }

        impl $Name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$Name] = &[ $( $Name::$variant, )+ ];

            pub const fn as_str(&self) -> &'static str {
                match self {
                    $( $Name::$variant => $wire, )+
                }
            }
        }

        impl std::fmt::Display for $Name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl AsRef<str> for $Name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl std::str::FromStr for $Name {
            type Err = $Err;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let token = s.trim();
                Self::ALL
                    .iter()
                    .find(|v| token.eq_ignore_ascii_case(v.as_str()))
                    .copied()
                    .ok_or_else(|| $Err(token.to_string()))
            }
        }
    };
}
