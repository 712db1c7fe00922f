//! Self-validating value objects for patient identity and contact data.

use super::{optional_text, parse_enum, required_text};
use crate::error::{RuleCode, ValidationErrors};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use vault_types::NonEmptyText;

/// A person's full name: 2 to 200 characters with at least one letter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PersonName(NonEmptyText);

impl PersonName {
    pub const MAX_LEN: usize = 200;

    pub fn new(field: &str, input: &str) -> Result<Self, ValidationErrors> {
        let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
        let text = required_text(field, &collapsed, Self::MAX_LEN)?;

        let mut errors = ValidationErrors::new();
        if text.char_len() < 2 {
            errors.push(field, RuleCode::TooShort, format!("{field} must be at least 2 characters"));
        }
        if !text.as_str().chars().any(char::is_alphabetic) {
            errors.push(field, RuleCode::InvalidFormat, format!("{field} must contain letters"));
        }
        if text
            .as_str()
            .chars()
            .any(|c| !(c.is_alphabetic() || matches!(c, ' ' | '\'' | '-' | '.')))
        {
            errors.push(
                field,
                RuleCode::InvalidFormat,
                format!("{field} may only contain letters, spaces, apostrophes, hyphens and dots"),
            );
        }
        errors.into_result()?;
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Case-insensitive comparison used by duplicate detection.
    pub fn matches_ignoring_case(&self, other: &str) -> bool {
        let other = other.split_whitespace().collect::<Vec<_>>().join(" ");
        self.0.as_str().to_lowercase() == other.to_lowercase()
    }
}

impl TryFrom<String> for PersonName {
    type Error = ValidationErrors;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new("name", &value)
    }
}

impl From<PersonName> for String {
    fn from(value: PersonName) -> Self {
        value.0.into_inner()
    }
}

impl fmt::Display for PersonName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Brazilian individual taxpayer number (CPF), stored as 11 digits.
///
/// Accepts masked (`111.444.777-35`) or bare input. Both check digits are verified and
/// repeated-digit sequences such as `000.000.000-00` are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cpf(String);

impl Cpf {
    pub fn new(field: &str, input: &str) -> Result<Self, ValidationErrors> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ValidationErrors::single(
                field,
                RuleCode::Required,
                format!("{field} is required"),
            ));
        }
        if trimmed
            .chars()
            .any(|c| !(c.is_ascii_digit() || matches!(c, '.' | '-' | ' ')))
        {
            return Err(ValidationErrors::single(
                field,
                RuleCode::InvalidFormat,
                format!("{field} may only contain digits, '.' and '-'"),
            ));
        }

        let digits: Vec<u32> = trimmed.chars().filter_map(|c| c.to_digit(10)).collect();
        if digits.len() != 11 {
            return Err(ValidationErrors::single(
                field,
                RuleCode::InvalidFormat,
                format!("{field} must have 11 digits (got {})", digits.len()),
            ));
        }
        if digits.iter().all(|d| *d == digits[0]) || !Self::check_digits_valid(&digits) {
            return Err(ValidationErrors::single(
                field,
                RuleCode::InvalidChecksum,
                format!("{field} check digits do not match"),
            ));
        }

        Ok(Self(digits.iter().map(|d| char::from(b'0' + *d as u8)).collect()))
    }

    fn check_digits_valid(digits: &[u32]) -> bool {
        let check = |len: usize| -> u32 {
            let sum: u32 = digits[..len]
                .iter()
                .enumerate()
                .map(|(i, d)| d * (len as u32 + 1 - i as u32))
                .sum();
            match (sum * 10) % 11 {
                10 => 0,
                r => r,
            }
        };
        check(9) == digits[9] && check(10) == digits[10]
    }

    /// The 11 digits without punctuation.
    pub fn digits(&self) -> &str {
        &self.0
    }

    /// Masked form: `XXX.XXX.XXX-XX`.
    pub fn masked(&self) -> String {
        format!(
            "{}.{}.{}-{}",
            &self.0[0..3],
            &self.0[3..6],
            &self.0[6..9],
            &self.0[9..11]
        )
    }
}

impl TryFrom<String> for Cpf {
    type Error = ValidationErrors;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new("cpf", &value)
    }
}

impl From<Cpf> for String {
    fn from(value: Cpf) -> Self {
        value.masked()
    }
}

impl fmt::Display for Cpf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

/// State identity document number (RG). 5 to 14 alphanumerics once punctuation is removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rg(String);

impl Rg {
    pub fn new(field: &str, input: &str) -> Result<Self, ValidationErrors> {
        let normalised: String = input
            .chars()
            .filter(|c| !matches!(c, '.' | '-' | ' ' | '/'))
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if normalised.is_empty() {
            return Err(ValidationErrors::single(
                field,
                RuleCode::Required,
                format!("{field} is required"),
            ));
        }
        if !normalised.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ValidationErrors::single(
                field,
                RuleCode::InvalidFormat,
                format!("{field} may only contain letters and digits"),
            ));
        }
        if !(5..=14).contains(&normalised.len()) {
            return Err(ValidationErrors::single(
                field,
                RuleCode::InvalidFormat,
                format!("{field} must have between 5 and 14 characters"),
            ));
        }
        Ok(Self(normalised))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Rg {
    type Error = ValidationErrors;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new("rg", &value)
    }
}

impl From<Rg> for String {
    fn from(value: Rg) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EmailAddress(String);

impl EmailAddress {
    pub const MAX_LEN: usize = 254;

    pub fn new(field: &str, input: &str) -> Result<Self, ValidationErrors> {
        let value = input.trim().to_ascii_lowercase();
        if value.is_empty() {
            return Err(ValidationErrors::single(
                field,
                RuleCode::Required,
                format!("{field} is required"),
            ));
        }
        if value.len() > Self::MAX_LEN {
            return Err(ValidationErrors::single(
                field,
                RuleCode::TooLong,
                format!("{field} must be at most {} characters", Self::MAX_LEN),
            ));
        }

        let well_formed = match value.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.contains('@')
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
                    && !value.chars().any(char::is_whitespace)
            }
            None => false,
        };
        if !well_formed {
            return Err(ValidationErrors::single(
                field,
                RuleCode::InvalidFormat,
                format!("{field} is not a valid email address"),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EmailAddress {
    type Error = ValidationErrors;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new("email", &value)
    }
}

impl From<EmailAddress> for String {
    fn from(value: EmailAddress) -> Self {
        value.0
    }
}

/// Phone number stored as 10 to 13 digits (area code required, country code optional).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn new(field: &str, input: &str) -> Result<Self, ValidationErrors> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ValidationErrors::single(
                field,
                RuleCode::Required,
                format!("{field} is required"),
            ));
        }
        if trimmed
            .chars()
            .any(|c| !(c.is_ascii_digit() || matches!(c, ' ' | '(' | ')' | '-' | '+' | '.')))
        {
            return Err(ValidationErrors::single(
                field,
                RuleCode::InvalidFormat,
                format!("{field} contains invalid characters"),
            ));
        }
        let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
        if !(10..=13).contains(&digits.len()) {
            return Err(ValidationErrors::single(
                field,
                RuleCode::InvalidFormat,
                format!("{field} must have between 10 and 13 digits"),
            ));
        }
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = ValidationErrors;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new("phone", &value)
    }
}

impl From<PhoneNumber> for String {
    fn from(value: PhoneNumber) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Female,
    Male,
    NonBinary,
    Other,
    NotInformed,
}

impl Gender {
    const VARIANTS: &'static [(&'static str, Gender)] = &[
        ("female", Gender::Female),
        ("male", Gender::Male),
        ("non_binary", Gender::NonBinary),
        ("other", Gender::Other),
        ("not_informed", Gender::NotInformed),
    ];

    pub fn parse(field: &str, input: &str) -> Result<Self, ValidationErrors> {
        parse_enum(field, input, Self::VARIANTS)
    }
}

/// Raw address fields as supplied by a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInput {
    pub street: String,
    pub number: String,
    pub complement: Option<String>,
    pub district: Option<String>,
    pub city: String,
    pub state: String,
    pub postal_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostalAddress {
    pub street: NonEmptyText,
    pub number: NonEmptyText,
    pub complement: Option<NonEmptyText>,
    pub district: Option<NonEmptyText>,
    pub city: NonEmptyText,
    /// Two-letter federative unit code.
    pub state: String,
    /// Eight-digit postal code (CEP).
    pub postal_code: String,
}

impl PostalAddress {
    pub fn new(input: &AddressInput) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let street = errors.collect(required_text("street", &input.street, 200));
        let number = errors.collect(required_text("number", &input.number, 20));
        let complement = errors.collect(optional_text("complement", input.complement.as_deref(), 100));
        let district = errors.collect(optional_text("district", input.district.as_deref(), 100));
        let city = errors.collect(required_text("city", &input.city, 100));

        let state = input.state.trim().to_ascii_uppercase();
        if state.len() != 2 || !state.chars().all(|c| c.is_ascii_alphabetic()) {
            errors.push("state", RuleCode::InvalidFormat, "state must be a two-letter code");
        }

        let postal_code: String = input
            .postal_code
            .chars()
            .filter(|c| !matches!(c, '-' | '.' | ' '))
            .collect();
        if postal_code.len() != 8 || !postal_code.chars().all(|c| c.is_ascii_digit()) {
            errors.push("postal_code", RuleCode::InvalidFormat, "postal_code must have 8 digits");
        }

        match (street, number, complement, district, city) {
            (Some(street), Some(number), Some(complement), Some(district), Some(city))
                if errors.is_empty() =>
            {
                Ok(Self {
                    street,
                    number,
                    complement,
                    district,
                    city,
                    state,
                    postal_code,
                })
            }
            _ => Err(errors),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyContactInput {
    pub name: String,
    pub relationship: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub name: PersonName,
    pub relationship: NonEmptyText,
    pub phone: PhoneNumber,
}

impl EmergencyContact {
    pub fn new(input: &EmergencyContactInput) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let name = errors.collect(PersonName::new("name", &input.name));
        let relationship = errors.collect(required_text("relationship", &input.relationship, 50));
        let phone = errors.collect(PhoneNumber::new("phone", &input.phone));

        match (name, relationship, phone) {
            (Some(name), Some(relationship), Some(phone)) => Ok(Self {
                name,
                relationship,
                phone,
            }),
            _ => Err(errors),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsuranceInput {
    pub provider: String,
    pub policy_number: String,
    pub valid_until: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsuranceInfo {
    pub provider: NonEmptyText,
    pub policy_number: NonEmptyText,
    pub valid_until: Option<NaiveDate>,
}

impl InsuranceInfo {
    pub fn new(input: &InsuranceInput) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let provider = errors.collect(required_text("provider", &input.provider, 100));
        let policy_number = errors.collect(required_text("policy_number", &input.policy_number, 50));

        match (provider, policy_number) {
            (Some(provider), Some(policy_number)) => Ok(Self {
                provider,
                policy_number,
                valid_until: input.valid_until,
            }),
            _ => Err(errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpf_accepts_masked_and_bare() {
        let masked = Cpf::new("cpf", "111.444.777-35").unwrap();
        let bare = Cpf::new("cpf", "11144477735").unwrap();

        assert_eq!(masked, bare);
        assert_eq!(masked.digits(), "11144477735");
        assert_eq!(masked.to_string(), "111.444.777-35");
        assert!(Cpf::new("cpf", "529.982.247-25").is_ok());
    }

    #[test]
    fn test_cpf_rejects_bad_check_digits_and_repeats() {
        let wrong = Cpf::new("cpf", "111.444.777-36").unwrap_err();
        assert!(wrong.has("cpf", RuleCode::InvalidChecksum));

        let repeated = Cpf::new("cpf", "000.000.000-00").unwrap_err();
        assert!(repeated.has("cpf", RuleCode::InvalidChecksum));

        let short = Cpf::new("cpf", "123.456").unwrap_err();
        assert!(short.has("cpf", RuleCode::InvalidFormat));

        let letters = Cpf::new("cpf", "111.444.abc-35").unwrap_err();
        assert!(letters.has("cpf", RuleCode::InvalidFormat));
    }

    #[test]
    fn test_person_name_rules() {
        assert_eq!(
            PersonName::new("full_name", "  João   Silva  Santos ").unwrap().as_str(),
            "João Silva Santos"
        );
        assert!(PersonName::new("full_name", "")
            .unwrap_err()
            .has("full_name", RuleCode::Required));
        assert!(PersonName::new("full_name", "J")
            .unwrap_err()
            .has("full_name", RuleCode::TooShort));
        assert!(PersonName::new("full_name", "R2-D2")
            .unwrap_err()
            .has("full_name", RuleCode::InvalidFormat));
        assert!(PersonName::new("full_name", &"a".repeat(201))
            .unwrap_err()
            .has("full_name", RuleCode::TooLong));
    }

    #[test]
    fn test_person_name_case_insensitive_match() {
        let name = PersonName::new("full_name", "João Silva Santos").unwrap();
        assert!(name.matches_ignoring_case("JOÃO  silva santos"));
        assert!(!name.matches_ignoring_case("João Silva"));
    }

    #[test]
    fn test_email_and_phone() {
        assert_eq!(
            EmailAddress::new("email", " Joao@Example.COM ").unwrap().as_str(),
            "joao@example.com"
        );
        assert!(EmailAddress::new("email", "joao@localhost").is_err());
        assert!(EmailAddress::new("email", "a@b@c.com").is_err());

        assert_eq!(
            PhoneNumber::new("phone", "+55 (11) 98765-4321").unwrap().as_str(),
            "5511987654321"
        );
        assert!(PhoneNumber::new("phone", "12345").is_err());
        assert!(PhoneNumber::new("phone", "11 9876-abcd").is_err());
    }

    #[test]
    fn test_address_reports_every_violation() {
        let input = AddressInput {
            street: "".into(),
            number: "10".into(),
            city: "".into(),
            state: "SaoPaulo".into(),
            postal_code: "123".into(),
            ..AddressInput::default()
        };
        let errors = PostalAddress::new(&input).unwrap_err();

        assert!(errors.has("street", RuleCode::Required));
        assert!(errors.has("city", RuleCode::Required));
        assert!(errors.has("state", RuleCode::InvalidFormat));
        assert!(errors.has("postal_code", RuleCode::InvalidFormat));
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_gender_parse() {
        assert_eq!(Gender::parse("gender", "Female").unwrap(), Gender::Female);
        assert!(Gender::parse("gender", "unknown")
            .unwrap_err()
            .has("gender", RuleCode::InvalidValue));
    }

    #[test]
    fn test_serde_revalidates_on_read() {
        let cpf: Cpf = serde_yaml::from_str("111.444.777-35").unwrap();
        assert_eq!(serde_yaml::to_string(&cpf).unwrap().trim(), "111.444.777-35");

        let bad: Result<Cpf, _> = serde_yaml::from_str("111.444.777-00");
        assert!(bad.is_err());
    }
}
