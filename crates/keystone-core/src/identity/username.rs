/// Case-folded, trimmed email used for uniqueness checks.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Username for a new user when none is supplied: the email, else country code + phone.
pub fn derive_username(
    email: Option<&str>,
    country_code: Option<&str>,
    phone: Option<&str>,
) -> Option<String> {
    if let Some(email) = email.filter(|e| !e.trim().is_empty()) {
        return Some(normalize_email(email));
    }
    let phone: String = phone?.chars().filter(|c| c.is_ascii_digit()).collect();
    if phone.is_empty() {
        return None;
    }
    let code: String = country_code
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    Some(format!("{}{}", code, phone))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_wins_and_is_lowercased() {
        assert_eq!(
            derive_username(Some(" Alice@Example.com "), Some("+1"), Some("555")),
            Some("alice@example.com".to_string())
        );
    }

    #[test]
    fn phone_fallback() {
        assert_eq!(
            derive_username(None, Some("+1"), Some("(555) 010-2000")),
            Some("15550102000".to_string())
        );
        assert_eq!(derive_username(Some(""), None, None), None);
    }
}
