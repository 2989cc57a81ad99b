//! Router-side comment codec.
//!
//! Comments correlate a router object with its local user:
//! `username|user_id|package_id|Y-m-d|service_type`. Operators may hand-edit
//! comments, so decoding is best-effort and never fails. Older routers carry
//! `key--value,key--value` comments, which are read but never written.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::service_type;

const FIELD_SEPARATOR: char = '|';

/// Values encoded into a comment
#[derive(Debug, Clone, PartialEq)]
pub struct CommentInput<'a> {
    pub username: &'a str,
    pub user_id: i64,
    pub package_id: Option<i64>,
    pub expiry_date: Option<NaiveDate>,
    pub service_type: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentFormat {
    Pipe,
    KeyValue,
}

/// Best-effort decoded comment; missing fields are empty strings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedComment {
    pub username: String,
    pub user_id: String,
    pub package_id: String,
    pub expiry_date: String,
    pub service_type: String,
    pub format: CommentFormat,
    /// Unrecognized keys of a key--value comment
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl DecodedComment {
    pub fn user_id(&self) -> Option<i64> {
        self.user_id.trim().parse().ok()
    }

    pub fn package_id(&self) -> Option<i64> {
        self.package_id.trim().parse().ok()
    }

    pub fn expiry(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.expiry_date.trim(), "%Y-%m-%d").ok()
    }

    /// True only when an expiry date parses and lies before `today`
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiry().is_some_and(|d| d < today)
    }
}

/// Strip the field separator and surrounding whitespace
pub fn sanitize(value: &str) -> String {
    value.replace(FIELD_SEPARATOR, "").trim().to_string()
}

pub fn encode(input: &CommentInput<'_>) -> String {
    let service = input
        .service_type
        .map(sanitize)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| service_type::PPPOE.to_string());
    [
        sanitize(input.username),
        input.user_id.to_string(),
        input.package_id.map(|p| p.to_string()).unwrap_or_default(),
        input
            .expiry_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        service,
    ]
    .join("|")
}

pub fn decode(comment: &str) -> DecodedComment {
    if !comment.contains(FIELD_SEPARATOR) && comment.contains("--") {
        return decode_key_value(comment);
    }
    let mut parts = comment.split(FIELD_SEPARATOR).map(str::trim);
    let mut next = || parts.next().unwrap_or("").to_string();
    let username = next();
    let user_id = next();
    let package_id = next();
    let expiry_date = next();
    let service = next();
    DecodedComment {
        username,
        user_id,
        package_id,
        expiry_date,
        service_type: if service.is_empty() {
            service_type::PPPOE.to_string()
        } else {
            service
        },
        format: CommentFormat::Pipe,
        extra: BTreeMap::new(),
    }
}

fn decode_key_value(comment: &str) -> DecodedComment {
    let mut values: BTreeMap<String, String> = comment
        .split(',')
        .filter_map(|part| part.split_once("--"))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    let mut take = |keys: &[&str]| -> String {
        keys.iter()
            .find_map(|k| values.remove(*k))
            .filter(|v| v != "N/A")
            .unwrap_or_default()
    };
    let user_id = take(&["uid", "cid"]);
    let username = take(&["name"]);
    let package_id = take(&["pkg"]);
    let expiry_date = take(&["exp"]);
    let service = take(&["type", "service"]);
    DecodedComment {
        username,
        user_id,
        package_id,
        expiry_date,
        service_type: if service.is_empty() {
            service_type::PPPOE.to_string()
        } else {
            service
        },
        format: CommentFormat::KeyValue,
        extra: values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(username: &'a str) -> CommentInput<'a> {
        CommentInput {
            username,
            user_id: 42,
            package_id: Some(7),
            expiry_date: NaiveDate::from_ymd_opt(2026, 12, 31),
            service_type: Some("pppoe"),
        }
    }

    #[test]
    fn test_round_trip() {
        let encoded = encode(&input("alice"));
        assert_eq!(encoded, "alice|42|7|2026-12-31|pppoe");
        let decoded = decode(&encoded);
        assert_eq!(decoded.username, "alice");
        assert_eq!(decoded.user_id, "42");
        assert_eq!(decoded.package_id, "7");
        assert_eq!(decoded.expiry_date, "2026-12-31");
        assert_eq!(decoded.service_type, "pppoe");
        assert_eq!(decoded.user_id(), Some(42));
    }

    #[test]
    fn test_pipes_stripped_on_encode() {
        let encoded = encode(&input(" ev|il|user "));
        assert_eq!(encoded, "eviluser|42|7|2026-12-31|pppoe");
        assert_eq!(decode(&encoded).username, "eviluser");
    }

    #[test]
    fn test_missing_optional_fields() {
        let encoded = encode(&CommentInput {
            username: "bob",
            user_id: 5,
            package_id: None,
            expiry_date: None,
            service_type: None,
        });
        assert_eq!(encoded, "bob|5|||pppoe");
        let decoded = decode(&encoded);
        assert_eq!(decoded.package_id(), None);
        assert_eq!(decoded.expiry(), None);
    }

    #[test]
    fn test_short_and_garbage_comments_never_fail() {
        let decoded = decode("carol|9");
        assert_eq!(decoded.username, "carol");
        assert_eq!(decoded.user_id, "9");
        assert_eq!(decoded.package_id, "");
        assert_eq!(decoded.expiry_date, "");
        assert_eq!(decoded.service_type, "pppoe");

        let decoded = decode("");
        assert_eq!(decoded.username, "");
        assert_eq!(decoded.service_type, "pppoe");

        let decoded = decode("set by hand, call NOC");
        assert_eq!(decoded.username, "set by hand, call NOC");
        assert_eq!(decoded.user_id(), None);

        let decoded = decode("a|b|c|d|e|f|g");
        assert_eq!(decoded.service_type, "e");
    }

    #[test]
    fn test_key_value_comment() {
        let decoded = decode("uid--123,name--John Doe,mobile--01712345678,pkg--10,exp--2026-12-31,status--active");
        assert_eq!(decoded.format, CommentFormat::KeyValue);
        assert_eq!(decoded.user_id(), Some(123));
        assert_eq!(decoded.username, "John Doe");
        assert_eq!(decoded.package_id(), Some(10));
        assert_eq!(decoded.extra.get("mobile").map(String::as_str), Some("01712345678"));

        let decoded = decode("cid--456,exp--N/A");
        assert_eq!(decoded.user_id(), Some(456));
        assert_eq!(decoded.expiry_date, "");
    }

    #[test]
    fn test_is_expired() {
        let today = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        assert!(decode("a|1|1|2026-05-31|pppoe").is_expired(today));
        assert!(!decode("a|1|1|2026-06-01|pppoe").is_expired(today));
        assert!(!decode("a|1|1|someday|pppoe").is_expired(today));
    }
}
