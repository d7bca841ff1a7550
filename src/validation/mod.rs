use bigdecimal::BigDecimal;
use std::fmt;

pub const EMAIL_MAX_LEN: usize = 254;
pub const DISPLAY_NAME_MAX_LEN: usize = 100;
pub const DESCRIPTION_MAX_LEN: usize = 255;
pub const AMOUNT_INPUT_MAX_LEN: usize = 32;
pub const AMOUNT_MAX_SCALE: i64 = 2;
pub const ROUTING_NUMBER_LEN: usize = 9;
pub const BANK_ACCOUNT_MIN_LEN: usize = 4;
pub const BANK_ACCOUNT_MAX_LEN: usize = 17;
pub const ALLOWED_METHODS: &[&str] = &["internal", "ach", "wire", "crypto", "email"];

/// Largest amount a single transfer or deposit may carry.
pub fn max_amount() -> BigDecimal {
    BigDecimal::from(1_000_000_000_i64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult = Result<(), ValidationError>;

pub fn sanitize_string(value: &str) -> String {
    value
        .chars()
        .filter(|ch| !ch.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn validate_required(field: &'static str, value: &str) -> ValidationResult {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }

    Ok(())
}

pub fn validate_max_len(field: &'static str, value: &str, max_len: usize) -> ValidationResult {
    if value.len() > max_len {
        return Err(ValidationError::new(
            field,
            format!("must be at most {} characters", max_len),
        ));
    }

    Ok(())
}

pub fn validate_enum(field: &'static str, value: &str, allowed: &[&str]) -> ValidationResult {
    if allowed.iter().all(|candidate| value != *candidate) {
        return Err(ValidationError::new(
            field,
            format!("must be one of: {}", allowed.join(", ")),
        ));
    }

    Ok(())
}

/// Deliberately loose: one `@`, a non-empty local part and a dotted domain.
pub fn validate_email(field: &'static str, email: &str) -> ValidationResult {
    validate_required(field, email)?;
    validate_max_len(field, email, EMAIL_MAX_LEN)?;

    let Some((local, domain)) = email.split_once('@') else {
        return Err(ValidationError::new(field, "must be an email address"));
    };
    let domain_ok = domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains('@');
    if local.is_empty() || !domain_ok || email.chars().any(char::is_whitespace) {
        return Err(ValidationError::new(field, "must be an email address"));
    }

    Ok(())
}

pub fn validate_display_name(display_name: &str) -> ValidationResult {
    validate_required("display_name", display_name)?;
    validate_max_len("display_name", display_name, DISPLAY_NAME_MAX_LEN)
}

pub fn validate_description(description: &str) -> ValidationResult {
    validate_max_len("description", description, DESCRIPTION_MAX_LEN)
}

/// ABA routing number: nine digits with the 3-7-1 weighted checksum.
pub fn validate_routing_number(routing_number: &str) -> ValidationResult {
    let field = "external.routing_number";
    if routing_number.len() != ROUTING_NUMBER_LEN || !routing_number.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(ValidationError::new(
            field,
            format!("must be exactly {} digits", ROUTING_NUMBER_LEN),
        ));
    }

    let digits: Vec<u32> = routing_number.chars().filter_map(|ch| ch.to_digit(10)).collect();
    let checksum: u32 = digits
        .iter()
        .zip([3, 7, 1].iter().cycle())
        .map(|(digit, weight)| digit * weight)
        .sum();
    if checksum % 10 != 0 {
        return Err(ValidationError::new(field, "checksum does not match"));
    }

    Ok(())
}

pub fn validate_bank_account_number(account_number: &str) -> ValidationResult {
    let field = "external.account_number";
    let len = account_number.len();
    if !(BANK_ACCOUNT_MIN_LEN..=BANK_ACCOUNT_MAX_LEN).contains(&len)
        || !account_number.chars().all(|ch| ch.is_ascii_digit())
    {
        return Err(ValidationError::new(
            field,
            format!(
                "must be {} to {} digits",
                BANK_ACCOUNT_MIN_LEN, BANK_ACCOUNT_MAX_LEN
            ),
        ));
    }

    Ok(())
}

/// Shape check only: legacy base58 (`1`/`3`) or bech32 (`bc1`) mainnet addresses.
pub fn validate_btc_address(address: &str) -> ValidationResult {
    let field = "btc_address";
    if !(26..=62).contains(&address.len()) {
        return Err(ValidationError::new(field, "must be 26 to 62 characters"));
    }

    let lower = address.to_ascii_lowercase();
    if lower.starts_with("bc1") {
        const BECH32_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";
        let mixed_case = address != lower && address != address.to_ascii_uppercase();
        if mixed_case || !lower[3..].chars().all(|ch| BECH32_CHARSET.contains(ch)) {
            return Err(ValidationError::new(field, "is not a valid bech32 address"));
        }
        return Ok(());
    }

    if address.starts_with('1') || address.starts_with('3') {
        let base58 = address
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() && !matches!(ch, '0' | 'O' | 'I' | 'l'));
        if !base58 || address.len() > 35 {
            return Err(ValidationError::new(field, "is not a valid base58 address"));
        }
        return Ok(());
    }

    Err(ValidationError::new(field, "must start with 1, 3 or bc1"))
}

pub fn validate_positive_amount(amount: &BigDecimal) -> ValidationResult {
    if amount <= &BigDecimal::from(0) {
        return Err(ValidationError::new("amount", "must be greater than zero"));
    }

    Ok(())
}

/// Positive, at most two decimals, below the per-operation ceiling.
pub fn validate_money(amount: &BigDecimal) -> ValidationResult {
    validate_positive_amount(amount)?;

    // `with_scale` truncates, so any lost digit makes the two differ.
    if &amount.with_scale(AMOUNT_MAX_SCALE) != amount {
        return Err(ValidationError::new(
            "amount",
            format!("must have at most {} decimal places", AMOUNT_MAX_SCALE),
        ));
    }
    if amount > &max_amount() {
        return Err(ValidationError::new("amount", "exceeds the maximum transfer amount"));
    }

    Ok(())
}

/// Reads an amount given as a JSON number or string and normalizes it to
/// two decimals. Exponent notation is rejected.
pub fn parse_money(value: &serde_json::Value) -> Result<BigDecimal, ValidationError> {
    let raw = match value {
        serde_json::Value::Number(number) => number.to_string(),
        serde_json::Value::String(text) => sanitize_string(text),
        serde_json::Value::Null => return Err(ValidationError::new("amount", "is required")),
        _ => return Err(ValidationError::new("amount", "must be a number")),
    };

    validate_max_len("amount", &raw, AMOUNT_INPUT_MAX_LEN)?;
    if raw.is_empty() || !raw.chars().all(|ch| ch.is_ascii_digit() || ch == '.' || ch == '-' || ch == '+') {
        return Err(ValidationError::new("amount", "must be a plain decimal number"));
    }

    let amount: BigDecimal = raw
        .parse()
        .map_err(|_| ValidationError::new("amount", "must be a plain decimal number"))?;
    validate_money(&amount)?;

    Ok(amount.with_scale(AMOUNT_MAX_SCALE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn parses_money_from_numbers_and_strings() {
        let expected = BigDecimal::from_str("40.50").unwrap();
        assert_eq!(parse_money(&json!(40.5)).unwrap(), expected);
        assert_eq!(parse_money(&json!("40.50")).unwrap(), expected);
        assert_eq!(parse_money(&json!(" 40.5 ")).unwrap(), expected);
        assert_eq!(parse_money(&json!(100)).unwrap(), BigDecimal::from(100));
    }

    #[test]
    fn rejects_malformed_money() {
        assert!(parse_money(&json!(null)).is_err());
        assert!(parse_money(&json!(true)).is_err());
        assert!(parse_money(&json!("abc")).is_err());
        assert!(parse_money(&json!("NaN")).is_err());
        assert!(parse_money(&json!("1e3")).is_err());
        assert!(parse_money(&json!(-5)).is_err());
        assert!(parse_money(&json!(0)).is_err());
        assert!(parse_money(&json!("0.001")).is_err());
        assert!(parse_money(&json!("")).is_err());
    }

    #[test]
    fn validates_required_field() {
        assert!(validate_required("field", "value").is_ok());
        assert!(validate_required("field", "   ").is_err());
    }

    #[test]
    fn validates_max_len() {
        assert!(validate_max_len("field", "abc", 3).is_ok());
        assert!(validate_max_len("field", "abcd", 3).is_err());
    }

    #[test]
    fn validates_enum_values() {
        assert!(validate_enum("method", "ach", ALLOWED_METHODS).is_ok());
        assert!(validate_enum("method", "paypal", ALLOWED_METHODS).is_err());
    }

    #[test]
    fn sanitizes_string() {
        assert_eq!(sanitize_string("  hello\tworld  "), "hello world");
        assert_eq!(sanitize_string("single"), "single");
        assert_eq!(sanitize_string(" \n "), "");
        assert_eq!(sanitize_string("ab\u{0000}cd\u{0007}"), "abcd");
    }

    #[test]
    fn validates_email() {
        assert!(validate_email("email", "alice@example.com").is_ok());
        assert!(validate_email("email", "alice").is_err());
        assert!(validate_email("email", "@example.com").is_err());
        assert!(validate_email("email", "alice@localhost").is_err());
        assert!(validate_email("email", "al ice@example.com").is_err());
        assert!(validate_email("email", "").is_err());
    }

    #[test]
    fn validates_routing_number_checksum() {
        assert!(validate_routing_number("011000015").is_ok());
        assert!(validate_routing_number("021000021").is_ok());
        assert!(validate_routing_number("021000022").is_err());
        assert!(validate_routing_number("12345").is_err());
        assert!(validate_routing_number("02100002a").is_err());
    }

    #[test]
    fn validates_bank_account_number() {
        assert!(validate_bank_account_number("12345678").is_ok());
        assert!(validate_bank_account_number("123").is_err());
        assert!(validate_bank_account_number(&"9".repeat(18)).is_err());
        assert!(validate_bank_account_number("1234-5678").is_err());
    }

    #[test]
    fn validates_btc_address() {
        assert!(validate_btc_address("1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2").is_ok());
        assert!(validate_btc_address("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq").is_ok());
        assert!(validate_btc_address("0BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2").is_err());
        assert!(validate_btc_address("1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN0").is_err());
        assert!(validate_btc_address("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdb").is_err());
        assert!(validate_btc_address("short").is_err());
    }

    #[test]
    fn validates_money() {
        let positive = BigDecimal::from_str("1.23").expect("valid decimal");
        let three_places = BigDecimal::from_str("1.234").expect("valid decimal");
        let trailing_zeros = BigDecimal::from_str("1.2300").expect("valid decimal");
        let zero = BigDecimal::from(0);
        let negative = BigDecimal::from(-1);

        assert!(validate_money(&positive).is_ok());
        assert!(validate_money(&trailing_zeros).is_ok());
        assert!(validate_money(&three_places).is_err());
        assert!(validate_money(&zero).is_err());
        assert!(validate_money(&negative).is_err());
        assert!(validate_money(&(max_amount() + BigDecimal::from(1))).is_err());
    }
}
