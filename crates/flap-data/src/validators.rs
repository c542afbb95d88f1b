//! Validators shared by the monitoring classes.

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use flap_record::{Attributes, Validator, Value, Violation};
use serde_json::Value as Json;

/// Recurrence rule types a time restriction may use.
pub const RULE_TYPES: &[&str] = &[
    "Daily", "Hourly", "Minutely", "Monthly", "Secondly", "Weekly", "Yearly",
];

/// A JSON attribute that, when set, must be a list of strings.
#[derive(Clone, Debug)]
pub struct StringList {
    attribute: &'static str,
}

impl StringList {
    pub fn new(attribute: &'static str) -> Self {
        Self { attribute }
    }
}

impl Validator for StringList {
    fn name(&self) -> &str {
        "string_list"
    }

    fn validate(&self, _id: &str, attrs: &Attributes) -> Vec<Violation> {
        match attrs.get(self.attribute).and_then(Value::as_json) {
            None | Some(Json::Null) => Vec::new(),
            Some(json) if string_list(json).is_some() => Vec::new(),
            Some(_) => vec![Violation::custom(
                self.name(),
                Some(self.attribute),
                "must be a list of strings",
            )],
        }
    }
}

/// Neither `entities` nor `entity_tags` may be an empty list. Leaving both
/// unset makes a rule match everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct EntitiesOrTags;

impl Validator for EntitiesOrTags {
    fn name(&self) -> &str {
        "entities_or_tags"
    }

    fn validate(&self, _id: &str, attrs: &Attributes) -> Vec<Violation> {
        let empty_list = |attr: &str| {
            matches!(
                attrs.get(attr).and_then(Value::as_json),
                Some(Json::Array(items)) if items.is_empty()
            )
        };
        if empty_list("entities") || empty_list("entity_tags") {
            vec![Violation::custom(
                self.name(),
                None,
                "entities or entity tags must have at least one value",
            )]
        } else {
            Vec::new()
        }
    }
}

/// Structural check of `time_restrictions`. Recurrence evaluation is left to
/// the consumer; this only rejects data it could never schedule.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimeRestrictions;

impl Validator for TimeRestrictions {
    fn name(&self) -> &str {
        "time_restrictions"
    }

    fn validate(&self, _id: &str, attrs: &Attributes) -> Vec<Violation> {
        let valid = match attrs.get("time_restrictions").and_then(Value::as_json) {
            None | Some(Json::Null) => true,
            Some(Json::Array(items)) => items.iter().all(time_restriction_is_valid),
            Some(_) => false,
        };
        if valid {
            Vec::new()
        } else {
            vec![Violation::custom(
                self.name(),
                Some("time_restrictions"),
                "are invalid",
            )]
        }
    }
}

/// One time restriction: `start_time` and `end_time` as a time string or a
/// `{ "time": ... }` object, and `rrules` as a list of objects with a known
/// `rule_type`.
pub fn time_restriction_is_valid(restriction: &Json) -> bool {
    let Some(tr) = restriction.as_object() else {
        return false;
    };
    let times_ok = ["start_time", "end_time"]
        .iter()
        .all(|field| tr.get(*field).is_some_and(time_field_is_valid));
    let rrules_ok = match tr.get("rrules") {
        Some(Json::Array(rules)) => rules.iter().all(|rule| {
            rule.get("rule_type")
                .and_then(Json::as_str)
                .is_some_and(|t| RULE_TYPES.contains(&t))
        }),
        _ => false,
    };
    times_ok && rrules_ok
}

fn time_field_is_valid(field: &Json) -> bool {
    match field {
        Json::String(s) => parse_time(s).is_some(),
        Json::Object(obj) => obj
            .get("time")
            .and_then(Json::as_str)
            .is_some_and(|s| parse_time(s).is_some()),
        _ => false,
    }
}

/// Parse an RFC 3339 time, or a local `YYYY-MM-DD HH:MM[:SS]` time.
pub fn parse_time(s: &str) -> Option<NaiveDateTime> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.naive_utc());
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// Parse a contact timezone: `UTC`, `Z`, or a fixed `±HH:MM` offset.
pub fn parse_timezone(s: &str) -> Option<FixedOffset> {
    match s {
        "UTC" | "Etc/UTC" | "Z" => FixedOffset::east_opt(0),
        other => other.parse::<FixedOffset>().ok(),
    }
}

/// `timezone`, when set, must be parseable.
#[derive(Clone, Copy, Debug, Default)]
pub struct Timezone;

impl Validator for Timezone {
    fn name(&self) -> &str {
        "timezone"
    }

    fn validate(&self, _id: &str, attrs: &Attributes) -> Vec<Violation> {
        match attrs.get("timezone").and_then(Value::as_str) {
            Some(tz) if parse_timezone(tz).is_none() => vec![Violation::custom(
                self.name(),
                Some("timezone"),
                "must be UTC or an offset like +10:00",
            )],
            _ => Vec::new(),
        }
    }
}

/// `end_time` must be strictly after `start_time` when both are set.
#[derive(Clone, Copy, Debug, Default)]
pub struct EndAfterStart;

impl Validator for EndAfterStart {
    fn name(&self) -> &str {
        "end_after_start"
    }

    fn validate(&self, _id: &str, attrs: &Attributes) -> Vec<Violation> {
        let start = attrs.get("start_time").and_then(Value::as_timestamp);
        let end = attrs.get("end_time").and_then(Value::as_timestamp);
        match (start, end) {
            (Some(start), Some(end)) if end <= start => vec![Violation::custom(
                self.name(),
                Some("end_time"),
                "must be after start_time",
            )],
            _ => Vec::new(),
        }
    }
}

/// The strings of a JSON list of strings.
pub fn string_list(json: &Json) -> Option<Vec<String>> {
    json.as_array()?
        .iter()
        .map(|item| item.as_str().map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn string_list_accepts_unset_and_rejects_mixed() {
        let v = StringList::new("entities");
        assert!(v.validate("r", &Attributes::new()).is_empty());
        assert!(v
            .validate("r", &attrs(&[("entities", json!(["a", "b"]).into())]))
            .is_empty());
        let bad = v.validate("r", &attrs(&[("entities", json!(["a", 1]).into())]));
        assert_eq!(bad[0].to_string(), "entities must be a list of strings");
        assert_eq!(
            v.validate("r", &attrs(&[("entities", json!("a").into())])).len(),
            1
        );
    }

    #[test]
    fn entities_or_tags_rejects_empty_lists() {
        let v = EntitiesOrTags;
        assert!(v.validate("r", &Attributes::new()).is_empty());
        assert!(v
            .validate("r", &attrs(&[("entities", json!(["foo"]).into())]))
            .is_empty());
        let errs = v.validate("r", &attrs(&[("entities", json!([]).into())]));
        assert_eq!(
            errs[0].to_string(),
            "entities or entity tags must have at least one value"
        );
        assert_eq!(
            v.validate(
                "r",
                &attrs(&[
                    ("entities", json!(["foo"]).into()),
                    ("entity_tags", json!([]).into()),
                ])
            )
            .len(),
            1
        );
    }

    #[test]
    fn time_restriction_structure() {
        let good = json!({
            "start_time": "2013-01-28 08:00:00",
            "end_time": {"time": "2013-01-28 18:00:00"},
            "rrules": [{"validations": {"day": [1, 2, 3, 4, 5]}, "rule_type": "Weekly", "interval": 1}],
            "exrules": [],
        });
        assert!(time_restriction_is_valid(&good));

        let mut bad_type = good.clone();
        bad_type["rrules"][0]["rule_type"] = json!("Fortnightly");
        assert!(!time_restriction_is_valid(&bad_type));

        let mut missing_end = good.clone();
        missing_end.as_object_mut().unwrap().remove("end_time");
        assert!(!time_restriction_is_valid(&missing_end));

        let mut unparseable = good.clone();
        unparseable["start_time"] = json!("soon");
        assert!(!time_restriction_is_valid(&unparseable));

        let mut no_rrules = good;
        no_rrules.as_object_mut().unwrap().remove("rrules");
        assert!(!time_restriction_is_valid(&no_rrules));
    }

    #[test]
    fn time_restrictions_validator() {
        let v = TimeRestrictions;
        assert!(v
            .validate("r", &attrs(&[("time_restrictions", json!([]).into())]))
            .is_empty());
        let errs = v.validate("r", &attrs(&[("time_restrictions", json!([{}]).into())]));
        assert_eq!(errs[0].to_string(), "time_restrictions are invalid");
    }

    #[test]
    fn timezones() {
        assert_eq!(parse_timezone("UTC"), FixedOffset::east_opt(0));
        assert_eq!(parse_timezone("+10:00"), FixedOffset::east_opt(36_000));
        assert!(parse_timezone("Mars/Olympus").is_none());
        let errs = Timezone.validate("c", &attrs(&[("timezone", "nowhere".into())]));
        assert_eq!(errs.len(), 1);
    }

    #[test]
    fn end_after_start() {
        let now = Utc::now();
        let ok = attrs(&[
            ("start_time", now.into()),
            ("end_time", (now + Duration::hours(1)).into()),
        ]);
        assert!(EndAfterStart.validate("m", &ok).is_empty());
        let backwards = attrs(&[
            ("start_time", now.into()),
            ("end_time", (now - Duration::hours(1)).into()),
        ]);
        assert_eq!(
            EndAfterStart.validate("m", &backwards)[0].to_string(),
            "end_time must be after start_time"
        );
    }
}
