//! Topic builders and MQTT topic-filter matching.
//!
//! Every device publishes under its own prefix (the configured
//! `maintopic`):
//!
//! ```text
//! <prefix>/<field>    individual values, identity and status
//! <prefix>/data       structured document
//! <prefix>/cmd        inbound structured command document
//! ```

use crate::error::{Error, Result};

pub const STATUS_FIELD: &str = "status";
pub const VENDOR_FIELD: &str = "vendor";
pub const PRODUCT_FIELD: &str = "product";
pub const VERSION_FIELD: &str = "version";
pub const DATA_FIELD: &str = "data";
pub const CMD_FIELD: &str = "cmd";
pub const HEALTH_FIELD: &str = "health";

/// Fields the gateway itself publishes for every device. Inbound messages on
/// these topics are echoes, never commands.
pub const RESERVED_FIELDS: [&str; 5] = [
    STATUS_FIELD,
    VENDOR_FIELD,
    PRODUCT_FIELD,
    VERSION_FIELD,
    DATA_FIELD,
];

/// Builder for the topics of one device (or of the gateway itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    prefix: String,
}

impl TopicBuilder {
    /// Create a builder for `prefix`. Trailing slashes are dropped.
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        while prefix.ends_with('/') {
            prefix.pop();
        }
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Topic of a single published field.
    ///
    /// # Example
    /// ```
    /// use mbgate_common::topic::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("home/relay");
    /// assert_eq!(topics.field("input0"), "home/relay/input0");
    /// ```
    pub fn field(&self, field: &str) -> String {
        format!("{}/{}", self.prefix, field)
    }

    pub fn status(&self) -> String {
        self.field(STATUS_FIELD)
    }

    pub fn data(&self) -> String {
        self.field(DATA_FIELD)
    }

    pub fn cmd(&self) -> String {
        self.field(CMD_FIELD)
    }

    pub fn health(&self) -> String {
        self.field(HEALTH_FIELD)
    }

    /// Filter covering both `<prefix>/cmd` and bare `<prefix>/<field>`
    /// command topics.
    ///
    /// # Example
    /// ```
    /// use mbgate_common::topic::TopicBuilder;
    ///
    /// assert_eq!(TopicBuilder::new("home/relay").command_filter(), "home/relay/+");
    /// ```
    pub fn command_filter(&self) -> String {
        format!("{}/+", self.prefix)
    }

    /// Extract the single-level field name of a topic under this prefix.
    pub fn field_of<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.prefix.as_str())?;
        let field = rest.strip_prefix('/')?;
        if field.is_empty() || field.contains('/') {
            None
        } else {
            Some(field)
        }
    }
}

/// Check that a prefix can be used for publishing.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.trim().is_empty() {
        return Err(Error::Topic("topic prefix must not be empty".to_string()));
    }
    if prefix.contains(['+', '#']) {
        return Err(Error::Topic(format!(
            "topic prefix '{}' must not contain wildcards",
            prefix
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_builder() {
        let topics = TopicBuilder::new("bwct/relay1/");

        assert_eq!(topics.prefix(), "bwct/relay1");
        assert_eq!(topics.status(), "bwct/relay1/status");
        assert_eq!(topics.data(), "bwct/relay1/data");
        assert_eq!(topics.cmd(), "bwct/relay1/cmd");
        assert_eq!(topics.command_filter(), "bwct/relay1/+");
    }

    #[test]
    fn test_field_of() {
        let topics = TopicBuilder::new("dev");

        assert_eq!(topics.field_of("dev/relais0"), Some("relais0"));
        assert_eq!(topics.field_of("dev/a/b"), None);
        assert_eq!(topics.field_of("device/x"), None);
        assert_eq!(topics.field_of("dev/"), None);
        assert_eq!(topics.field_of("dev"), None);
    }

    #[test]
    fn test_validate_prefix() {
        assert!(validate_prefix("home/relay").is_ok());
        assert!(validate_prefix("").is_err());
        assert!(validate_prefix("home/+").is_err());
        assert!(validate_prefix("home/#").is_err());
    }
}
