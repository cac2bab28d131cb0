// ABOUTME: Identifier generation for persisted rows
// ABOUTME: Prefixed nanoid identifiers so row kinds are recognisable in logs

/// Length of the random part of every identifier
const ID_LENGTH: usize = 12;

/// Generate a new identifier of the form `{prefix}-{nanoid}`
pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, nanoid::nanoid!(ID_LENGTH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_has_prefix_and_length() {
        let id1 = new_id("sos");
        let id2 = new_id("sos");

        assert!(id1.starts_with("sos-"));
        assert_eq!(id1.len(), "sos-".len() + ID_LENGTH);
        assert_ne!(id1, id2);
    }
}
