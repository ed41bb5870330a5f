//! Classifies the leftmost label of an inbound `Host` header into a routing
//! [`service::Identity`]: either a token (32 lowercase hex characters) or an
//! alias candidate (lowercase letters/digits/hyphen, 1-63 characters, not
//! reserved).

use service::Identity;

#[derive(Debug)]
pub enum IdentityError {
    MissingHost,
    InvalidLabel,
    Reserved,
}

/// Extract the leftmost DNS label from a `Host` header value and classify
/// it. `host` may include a port (`token.example:7070`); the port is
/// dropped before extracting the label.
pub fn classify(host: &str, reserved: &[String]) -> Result<Identity, IdentityError> {
    let host = host.split(':').next().unwrap_or(host);
    let label = host.split('.').next().filter(|s| !s.is_empty());

    let Some(label) = label else {
        return Err(IdentityError::MissingHost);
    };

    if is_valid_token(label) {
        return Ok(Identity::Token(label.to_string()));
    }

    if !is_valid_alias(label) {
        return Err(IdentityError::InvalidLabel);
    }

    if reserved.iter().any(|r| r == label) {
        return Err(IdentityError::Reserved);
    }

    Ok(Identity::Alias(label.to_string()))
}

pub fn is_valid_token(candidate: &str) -> bool {
    candidate.len() == 32
        && candidate
            .bytes()
            .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

pub fn is_valid_alias(candidate: &str) -> bool {
    if candidate.is_empty() || candidate.len() > 63 {
        return false;
    }

    if candidate.starts_with('-') || candidate.ends_with('-') {
        return false;
    }

    candidate
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserved() -> Vec<String> {
        vec!["internal".into(), "www".into()]
    }

    #[test]
    fn classifies_a_token() {
        let id = classify("a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6.example", &reserved()).unwrap();
        assert_eq!(id, Identity::Token("a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6".into()));
    }

    #[test]
    fn classifies_an_alias() {
        let id = classify("my-app.example:7070", &reserved()).unwrap();
        assert_eq!(id, Identity::Alias("my-app".into()));
    }

    #[test]
    fn rejects_reserved_aliases() {
        assert!(matches!(
            classify("www.example", &reserved()),
            Err(IdentityError::Reserved)
        ));
    }

    #[test]
    fn rejects_empty_host() {
        assert!(matches!(classify("", &reserved()), Err(IdentityError::MissingHost)));
    }
}
