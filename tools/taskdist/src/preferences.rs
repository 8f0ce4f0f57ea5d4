use crate::errors::TaskdistError;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub const PREFERENCE_FIELDS: &[&str] = &["languages", "locations"];

/// Field-by-field preference filter, e.g. `{"languages": ["en", "de"]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preference {
    fields: BTreeMap<String, BTreeSet<String>>,
}

impl Preference {
    /// Accepts `null`, or an object whose keys are known preference fields
    /// and whose values are arrays of strings. Anything else is malformed.
    pub fn parse(value: &Value) -> Result<Self, TaskdistError> {
        let object = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(object) => object,
            other => {
                return Err(TaskdistError::InvalidInput(format!(
                    "user preference must be an object, got {other}"
                )))
            }
        };

        let mut fields = BTreeMap::new();
        for (field, values) in object {
            if !PREFERENCE_FIELDS.contains(&field.as_str()) {
                return Err(TaskdistError::InvalidInput(format!(
                    "unknown user preference field `{field}`"
                )));
            }
            let Value::Array(items) = values else {
                return Err(TaskdistError::InvalidInput(format!(
                    "user preference `{field}` must be a list"
                )));
            };
            let mut set = BTreeSet::new();
            for item in items {
                let Value::String(text) = item else {
                    return Err(TaskdistError::InvalidInput(format!(
                        "user preference `{field}` must only hold strings"
                    )));
                };
                set.insert(text.trim().to_lowercase());
            }
            if !set.is_empty() {
                fields.insert(field.clone(), set);
            }
        }
        Ok(Self { fields })
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when any field of `self` shares a value with the same field of
    /// `other`.
    pub fn overlaps(&self, other: &Preference) -> bool {
        self.fields.iter().any(|(field, values)| {
            other
                .fields
                .get(field)
                .is_some_and(|theirs| !values.is_disjoint(theirs))
        })
    }
}

/// Decides whether a task filtered by `task_pref` may be offered to a
/// contributor whose stored preference is `contributor_pref`.
///
/// An empty filter is open to everyone. A contributor preference that cannot
/// be parsed only ever sees unfiltered tasks.
pub fn task_matches(task_pref: &Preference, contributor_pref: Option<&Value>) -> bool {
    if task_pref.is_empty() {
        return true;
    }
    let Some(raw) = contributor_pref else {
        return false;
    };
    match Preference::parse(raw) {
        Ok(contributor) => task_pref.overlaps(&contributor),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{task_matches, Preference};
    use serde_json::json;

    fn pref(value: serde_json::Value) -> Preference {
        Preference::parse(&value).expect("valid preference")
    }

    #[test]
    fn empty_filter_matches_everyone() {
        let open = pref(json!({}));
        assert!(task_matches(&open, None));
        assert!(task_matches(&open, Some(&json!({"languages": ["fr"]}))));
        assert!(task_matches(&open, Some(&json!("garbage"))));
        assert!(task_matches(&pref(json!(null)), None));
        assert!(task_matches(&pref(json!({"languages": []})), None));
    }

    #[test]
    fn shared_value_in_any_field_matches() {
        let task = pref(json!({"languages": ["en"]}));
        assert!(task_matches(&task, Some(&json!({"languages": ["en", "de"]}))));
        assert!(!task_matches(&task, Some(&json!({"languages": ["fr"]}))));
        assert!(!task_matches(&task, Some(&json!({"locations": ["en"]}))));

        let both = pref(json!({"languages": ["de"], "locations": ["us"]}));
        assert!(task_matches(&both, Some(&json!({"languages": ["fr"], "locations": ["US"]}))));
    }

    #[test]
    fn malformed_contributor_preference_fails_closed() {
        let task = pref(json!({"languages": ["en"]}));
        assert!(!task_matches(&task, Some(&json!({"languages": "en"}))));
        assert!(!task_matches(&task, Some(&json!(["en"]))));
        assert!(!task_matches(&task, Some(&json!({"dialects": ["en"]}))));
        assert!(!task_matches(&task, None));
    }

    #[test]
    fn malformed_task_filter_is_invalid_input() {
        for bad in [
            json!("en"),
            json!({"languages": "en"}),
            json!({"languages": [1, 2]}),
            json!({"planets": ["mars"]}),
        ] {
            assert!(
                matches!(
                    Preference::parse(&bad),
                    Err(crate::errors::TaskdistError::InvalidInput(_))
                ),
                "{bad} should be rejected"
            );
        }
    }
}
