/// Scrub secrets out of text that is about to be logged. Applied at the
/// logging boundary only; the values themselves still flow to the wire.
pub fn redact(text: &str, secrets: &[&str]) -> String {
    let mut out = text.to_string();
    for secret in secrets {
        if !secret.is_empty() {
            out = out.replace(secret, "***");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::redact;

    #[test]
    fn replaces_every_occurrence_of_each_secret() {
        let text = "key=abc123 token=xyz key=abc123";
        assert_eq!(
            redact(text, &["abc123", "xyz"]),
            "key=*** token=*** key=***"
        );
    }

    #[test]
    fn empty_secrets_do_not_mangle_the_text() {
        assert_eq!(redact("hello", &[""]), "hello");
    }
}
