use anyhow::{anyhow, Result};
use regex::Regex;

use super::registry::Args;

#[derive(Debug)]
pub struct ParsedStage {
    pub target: String,
    pub verb: String,
    pub args: Args,
}

/// Splits `scheme://target.verb(k=v, ...)` into its parts.
pub fn parse_stage(s: &str) -> Result<ParsedStage> {
    let s = s.trim();
    let (main_part, args_str) = match (s.rfind('('), s.rfind(')')) {
        (Some(open), Some(close)) if close > open => (s[..open].trim(), Some(s[open + 1..close].trim())),
        _ => (s, None),
    };

    let (target, verb) = main_part
        .rsplit_once('.')
        .ok_or_else(|| anyhow!("Cannot parse stage: {}", s))?;
    let verb_regex = Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_-]*$")?;
    let url_regex = Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://[^.]+$")?;
    if !verb_regex.is_match(verb) || !url_regex.is_match(target) {
        return Err(anyhow!("Cannot parse stage: {}", s));
    }

    let mut args = Args::new();
    for kv in parse_arguments(args_str.unwrap_or_default()) {
        if let Some((k, v)) = kv.split_once('=') {
            args.insert(k.trim().to_string(), v.trim().trim_matches('"').to_string());
        }
    }

    Ok(ParsedStage {
        target: target.to_string(),
        verb: verb.to_string(),
        args,
    })
}

/// Comma-separated arguments; commas inside double quotes do not split.
fn parse_arguments(args_str: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current_arg = String::new();
    let mut in_quotes = false;

    for ch in args_str.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current_arg.push(ch);
            }
            ',' if !in_quotes => {
                if !current_arg.trim().is_empty() {
                    result.push(current_arg.trim().to_string());
                }
                current_arg.clear();
            }
            _ => current_arg.push(ch),
        }
    }
    if !current_arg.trim().is_empty() {
        result.push(current_arg.trim().to_string());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_stage() {
        let p = parse_stage("backup://daily.status").unwrap();
        assert_eq!(p.target, "backup://daily");
        assert_eq!(p.verb, "status");
        assert!(p.args.is_empty());
    }

    #[test]
    fn test_stage_with_args() {
        let p = parse_stage(r#"dest://offsite.probe(retries=3, note="a,b")"#).unwrap();
        assert_eq!(p.target, "dest://offsite");
        assert_eq!(p.verb, "probe");
        assert_eq!(p.args["retries"], "3");
        assert_eq!(p.args["note"], "a,b");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(parse_stage("backup://daily").is_err());
        assert!(parse_stage("daily.status").is_err());
        assert!(parse_stage("backup://daily.").is_err());
    }
}
