//! Internal keying of the property index, shared by both backends.

use memoir_core::normalize_term;

const PROPERTY_DELIMITER: &str = "@@";

/// Build the normalized internal key `prop.{name}@@{value}`.
pub fn make_property_term_text(name: &str, value: &str) -> String {
    format!(
        "prop.{}{}{}",
        normalize_term(name),
        PROPERTY_DELIMITER,
        normalize_term(value)
    )
}

/// Split an internal key back into `(prop.{name}, value)`.
pub fn split_property_term_text(term_text: &str) -> (String, String) {
    match term_text.split_once(PROPERTY_DELIMITER) {
        Some((name, value)) => (name.to_string(), value.to_string()),
        None => (term_text.to_string(), String::new()),
    }
}

/// Strip the `prop.` prefix from the name half of an internal key.
pub fn property_name_from_key(term_text: &str) -> String {
    let (name, _) = split_property_term_text(term_text);
    name.strip_prefix("prop.").unwrap_or(&name).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_normalized() {
        assert_eq!(
            make_property_term_text("Type", " Book "),
            "prop.type@@book"
        );
        assert_eq!(
            make_property_term_text("type", "book"),
            make_property_term_text("TYPE", "BOOK")
        );
    }

    #[test]
    fn split_round_trips() {
        let key = make_property_term_text("subject", "alice");
        let (name, value) = split_property_term_text(&key);
        assert_eq!(name, "prop.subject");
        assert_eq!(value, "alice");
        assert_eq!(property_name_from_key(&key), "subject");
    }
}
