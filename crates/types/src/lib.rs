//! Validated primitive types shared across the EDC kernel crates.
//!
//! Each type here guarantees its invariant once constructed, so downstream code can accept a
//! `SubjectIdentifier` or `VisitCode` without re-checking it.

/// Errors that can occur when creating validated text types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,

    #[error("invalid subject identifier '{0}' (1-50 characters, alphanumeric or '-')")]
    InvalidSubjectIdentifier(String),

    #[error("invalid visit code '{0}' (1-25 characters, alphanumeric, '.' or '_')")]
    InvalidVisitCode(String),
}

/// A string type that guarantees non-empty content.
///
/// This type wraps a `String` and ensures it contains at least one non-whitespace character.
/// The input is automatically trimmed of leading and trailing whitespace during construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// Returns `Err(TextError::Empty)` if the trimmed input is empty.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier of a consented research subject, for example `101-40990029-4`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubjectIdentifier(String);

impl SubjectIdentifier {
    const MAX_LEN: usize = 50;

    /// Validates and wraps a subject identifier.
    ///
    /// The input is trimmed; the result must be 1 to 50 ASCII characters drawn from
    /// alphanumerics and `-`.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        let ok = !trimmed.is_empty()
            && trimmed.len() <= Self::MAX_LEN
            && trimmed
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-');
        if !ok {
            return Err(TextError::InvalidSubjectIdentifier(trimmed.to_owned()));
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Short code of a visit within a schedule, for example `1000` or `2000M`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VisitCode(String);

impl VisitCode {
    const MAX_LEN: usize = 25;

    /// Validates and wraps a visit code.
    ///
    /// The input is trimmed; the result must be 1 to 25 ASCII characters drawn from
    /// alphanumerics, `.` and `_`.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        let ok = !trimmed.is_empty()
            && trimmed.len() <= Self::MAX_LEN
            && trimmed
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_'));
        if !ok {
            return Err(TextError::InvalidVisitCode(trimmed.to_owned()));
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Display, AsRef and string (de)serialisation are identical for every validated text type.
macro_rules! impl_validated_text {
    ($ty:ident) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::str::FromStr for $ty {
            type Err = TextError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $ty::new(s)
            }
        }

        impl serde::Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                $ty::new(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

impl_validated_text!(NonEmptyText);
impl_validated_text!(SubjectIdentifier);
impl_validated_text!(VisitCode);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty_text_trims_input() {
        let text = NonEmptyText::new("  Day 28 visit ").unwrap();
        assert_eq!(text.as_str(), "Day 28 visit");
    }

    #[test]
    fn test_non_empty_text_rejects_whitespace() {
        assert_eq!(NonEmptyText::new("   ").unwrap_err(), TextError::Empty);
    }

    #[test]
    fn test_subject_identifier_accepts_hyphenated_ids() {
        let id = SubjectIdentifier::new("101-40990029-4").unwrap();
        assert_eq!(id.to_string(), "101-40990029-4");
    }

    #[test]
    fn test_subject_identifier_rejects_invalid_characters() {
        let err = SubjectIdentifier::new("101/409").expect_err("should reject '/'");
        assert!(matches!(err, TextError::InvalidSubjectIdentifier(s) if s == "101/409"));
        assert!(SubjectIdentifier::new("").is_err());
        assert!(SubjectIdentifier::new("a".repeat(51)).is_err());
    }

    #[test]
    fn test_visit_code_accepts_dotted_codes() {
        assert!(VisitCode::new("1000").is_ok());
        assert!(VisitCode::new("2000M.1").is_ok());
        assert!(VisitCode::new("day_28").is_ok());
    }

    #[test]
    fn test_visit_code_rejects_spaces() {
        let err = VisitCode::new("day 28").expect_err("should reject space");
        assert!(matches!(err, TextError::InvalidVisitCode(_)));
    }

    #[test]
    fn test_deserialize_validates_visit_code() {
        let ok: VisitCode = serde_json::from_str("\"1000\"").unwrap();
        assert_eq!(ok.as_str(), "1000");
        assert!(serde_json::from_str::<VisitCode>("\"bad code\"").is_err());
    }
}
