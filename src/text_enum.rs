use thiserror::Error;

/// A stored or model-produced string did not name a known variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a closed set of string-backed values (status columns, enum-like
/// JSON fields). The text form is the snake_case serde name, so database rows,
/// API payloads and `as_str` always agree.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }

            /// Accepts loose spellings from model output ("Multiple Choice",
            /// "multiple-choice", "MULTIPLE_CHOICE").
            pub fn from_lenient(raw: &str) -> Option<Self> {
                let normalized = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
                normalized.parse().ok()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::text_enum::UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err($crate::text_enum::UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = $crate::text_enum::UnknownVariant;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

#[cfg(test)]
mod tests {
    text_enum! {
        pub enum Colour {
            DarkRed => "dark_red",
            Blue => "blue",
        }
    }

    #[test]
    fn parses_strict_and_lenient_forms() {
        assert_eq!("dark_red".parse::<Colour>().unwrap(), Colour::DarkRed);
        assert!("Dark Red".parse::<Colour>().is_err());
        assert_eq!(Colour::from_lenient("Dark Red"), Some(Colour::DarkRed));
        assert_eq!(Colour::from_lenient("dark-red"), Some(Colour::DarkRed));
        assert_eq!(Colour::from_lenient("green"), None);
    }

    #[test]
    fn text_form_matches_serde_name() {
        for c in Colour::ALL {
            let json = serde_json::to_string(c).unwrap();
            assert_eq!(json, format!("\"{}\"", c.as_str()));
        }
    }
}
