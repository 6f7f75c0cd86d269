//! Phone number canonicalization.
//!
//! Every phone comparison in the system goes through [`normalize_phone`]
//! first. The two surface forms that must collapse to the same token:
//! CRM `+523319858734` and WhatsApp `5213319858734` → `5213319858734`.

/// Normalize a free-form phone string to a digits-only canonical token.
///
/// Rules, applied in order:
/// - strip every non-digit character
/// - `52` + 10 digits (CRM long form, no mobile `1`) → insert `1` after `52`
/// - bare 10 digits: leading digit in {3,5,6,8} → Mexican mobile (`521`
///   prefix), anything else → US fallback (`1` prefix)
///
/// Returns `None` when the input has no digits at all.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }

    if digits.starts_with("52") && digits.len() == 12 && !digits.starts_with("521") {
        return Some(format!("521{}", &digits[2..]));
    }

    if digits.len() == 10 {
        let first = digits.as_bytes()[0];
        return if matches!(first, b'3' | b'5' | b'6' | b'8') {
            Some(format!("521{digits}"))
        } else {
            Some(format!("1{digits}"))
        };
    }

    Some(digits)
}

/// Display form: canonical digits with a leading `+`.
pub fn format_for_display(phone: &str) -> Option<String> {
    normalize_phone(phone).map(|p| format!("+{p}"))
}

/// WhatsApp API form: canonical digits, no prefix.
pub fn format_for_whatsapp(phone: &str) -> Option<String> {
    normalize_phone(phone)
}

/// CRM (E.164-ish) form: same as display.
pub fn format_for_crm(phone: &str) -> Option<String> {
    format_for_display(phone)
}

/// Equality after canonicalization. Two empty/invalid inputs never match.
pub fn phones_match(a: &str, b: &str) -> bool {
    match (normalize_phone(a), normalize_phone(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crm_and_whatsapp_forms_collapse() {
        assert_eq!(normalize_phone("+523319858734").as_deref(), Some("5213319858734"));
        assert_eq!(normalize_phone("523319858734").as_deref(), Some("5213319858734"));
        assert_eq!(normalize_phone("5213319858734").as_deref(), Some("5213319858734"));
    }

    #[test]
    fn ten_digit_mexican_mobile_prefixes() {
        assert_eq!(normalize_phone("3319858734").as_deref(), Some("5213319858734"));
        assert_eq!(normalize_phone("5512345678").as_deref(), Some("5215512345678"));
        assert_eq!(normalize_phone("6641234567").as_deref(), Some("5216641234567"));
        assert_eq!(normalize_phone("8112345678").as_deref(), Some("5218112345678"));
    }

    #[test]
    fn ten_digit_us_fallback() {
        // Leading digit outside {3,5,6,8} is treated as a US number.
        assert_eq!(normalize_phone("2125551234").as_deref(), Some("12125551234"));
        assert_eq!(normalize_phone("(212) 555-1234").as_deref(), Some("12125551234"));
    }

    #[test]
    fn us_eleven_digit_passes_through() {
        assert_eq!(normalize_phone("+1-555-123-4567").as_deref(), Some("15551234567"));
        assert_eq!(normalize_phone("15551234567").as_deref(), Some("15551234567"));
    }

    #[test]
    fn punctuation_and_whitespace_are_stripped() {
        assert_eq!(normalize_phone("+52 33 1985 8734").as_deref(), Some("5213319858734"));
        assert_eq!(normalize_phone("52-331-985-8734").as_deref(), Some("5213319858734"));
    }

    #[test]
    fn empty_and_non_digit_inputs_return_none() {
        assert_eq!(normalize_phone(""), None);
        assert_eq!(normalize_phone("   "), None);
        assert_eq!(normalize_phone("no-digits-here"), None);
        assert_eq!(normalize_phone("+-() "), None);
    }

    #[test]
    fn normalization_is_a_fixed_point() {
        for input in ["+523319858734", "3319858734", "2125551234", "15551234567"] {
            let once = normalize_phone(input).unwrap();
            let twice = normalize_phone(&once).unwrap();
            assert_eq!(once, twice, "not a fixed point for {input}");
        }
    }

    #[test]
    fn round_trip_through_surface_forms() {
        let canon = normalize_phone("+52 3319858734").unwrap();
        let wa = format_for_whatsapp(&canon).unwrap();
        assert_eq!(normalize_phone(&wa).unwrap(), canon);
        let crm = format_for_crm(&canon).unwrap();
        assert_eq!(normalize_phone(&crm).unwrap(), canon);
    }

    #[test]
    fn display_form_has_plus_prefix() {
        assert_eq!(format_for_display("523319858734").as_deref(), Some("+5213319858734"));
        assert_eq!(format_for_display("15551234567").as_deref(), Some("+15551234567"));
    }

    #[test]
    fn matching_requires_both_sides_valid() {
        assert!(phones_match("+523319858734", "5213319858734"));
        assert!(phones_match("+1-555-123-4567", "15551234567"));
        assert!(!phones_match("", "5213319858734"));
        assert!(!phones_match("abc", "def"));
        assert!(!phones_match("5213319858734", "5215512345678"));
    }
}
