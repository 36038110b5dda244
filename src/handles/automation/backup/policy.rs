use anyhow::{Result, anyhow};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Retention kinds borg accepts as `--keep-<kind> <count>`.
const RETENTION_KINDS: &[&str] = &[
    "last", "secondly", "minutely", "hourly", "daily", "weekly", "monthly", "yearly",
];

/// Retention rules for `borg prune`, in configured order.
///
/// Keys may be written as `keep-daily`, `keep_daily` or just `daily`; they are
/// stored as the bare kind. Two spellings of one kind are rejected on load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetentionPolicy(Vec<(String, u32)>);

impl RetentionPolicy {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Adds a rule, replacing an earlier rule of the same kind in place.
    pub fn with_rule(mut self, kind: &str, count: u32) -> Self {
        let kind = normalize_kind(kind);
        match self.0.iter_mut().find(|(k, _)| *k == kind) {
            Some(rule) => rule.1 = count,
            None => self.0.push((kind, count)),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn rules(&self) -> &[(String, u32)] {
        &self.0
    }

    /// Count kept for `kind`, in any accepted spelling.
    pub fn get(&self, kind: &str) -> Option<u32> {
        let kind = normalize_kind(kind);
        self.0.iter().find(|(k, _)| *k == kind).map(|(_, count)| *count)
    }

    /// Check every key names a known retention kind and every count is positive
    pub fn validate(&self) -> Result<()> {
        for (kind, count) in &self.0 {
            if !RETENTION_KINDS.contains(&kind.as_str()) {
                return Err(anyhow!(
                    "unknown retention key 'keep-{}'. Supported: {}",
                    kind,
                    RETENTION_KINDS.iter().map(|k| format!("keep-{}", k)).collect::<Vec<_>>().join(", ")
                ));
            }
            if *count == 0 {
                return Err(anyhow!("retention value cannot be zero for key 'keep-{}'", kind));
            }
        }
        Ok(())
    }

    /// Convert the policy to borg command arguments
    pub fn to_borg_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.0.len() * 2);
        for (kind, count) in &self.0 {
            args.push(format!("--keep-{}", kind));
            args.push(count.to_string());
        }
        args
    }
}

fn normalize_kind(key: &str) -> String {
    let key = key.trim().to_lowercase().replace('_', "-");
    key.strip_prefix("keep-").map(str::to_string).unwrap_or(key)
}

impl Serialize for RetentionPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (kind, count) in &self.0 {
            map.serialize_entry(&format!("keep-{}", kind), count)?;
        }
        map.end()
    }
}

struct PolicyVisitor;

impl<'de> Visitor<'de> for PolicyVisitor {
    type Value = RetentionPolicy;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of retention kinds to counts")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
        let mut rules: Vec<(String, u32)> = Vec::new();
        while let Some((key, count)) = access.next_entry::<String, u32>()? {
            let kind = normalize_kind(&key);
            if rules.iter().any(|(k, _)| *k == kind) {
                return Err(de::Error::custom(format!(
                    "retention kind '{}' is given more than once (as '{}')",
                    kind, key
                )));
            }
            rules.push((kind, count));
        }
        Ok(RetentionPolicy(rules))
    }
}

impl<'de> Deserialize<'de> for RetentionPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(PolicyVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_borg_args_keep_rule_order() {
        let policy = RetentionPolicy::new()
            .with_rule("keep-weekly", 4)
            .with_rule("keep-daily", 7);
        assert_eq!(
            policy.to_borg_args(),
            vec!["--keep-weekly", "4", "--keep-daily", "7"]
        );
    }

    #[test]
    fn test_key_spellings() {
        let policy = RetentionPolicy::new()
            .with_rule("monthly", 12)
            .with_rule("keep_yearly", 2)
            .with_rule("keep-monthly", 6);
        assert!(policy.validate().is_ok());
        assert_eq!(policy.get("keep_monthly"), Some(6));
        assert_eq!(
            policy.to_borg_args(),
            vec!["--keep-monthly", "6", "--keep-yearly", "2"]
        );
    }

    #[test]
    fn test_validate_rejects_unknown_and_zero() {
        assert!(RetentionPolicy::new().with_rule("keep-forever", 1).validate().is_err());
        assert!(RetentionPolicy::new().with_rule("keep-daily", 0).validate().is_err());
    }

    #[test]
    fn test_deserialize_keeps_configured_order() {
        let policy: RetentionPolicy = serde_yaml::from_str("keep-last: 3\nkeep-daily: 7\n").unwrap();
        assert_eq!(policy.rules().len(), 2);
        assert_eq!(policy.to_borg_args(), vec!["--keep-last", "3", "--keep-daily", "7"]);
    }

    #[test]
    fn test_deserialize_rejects_duplicate_kind() {
        let err = serde_yaml::from_str::<RetentionPolicy>("daily: 7\nkeep-daily: 14\n").unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_serialize_uses_keep_prefix() {
        let policy = RetentionPolicy::new().with_rule("daily", 7);
        assert_eq!(serde_yaml::to_string(&policy).unwrap(), "keep-daily: 7\n");
    }

    #[test]
    fn test_is_empty() {
        assert!(RetentionPolicy::new().is_empty());
        assert!(!RetentionPolicy::new().with_rule("keep-last", 1).is_empty());
    }
}
