//! Declarative placeholder resolution for entry creation (§4.4).

use std::collections::HashMap;

use chrono::Utc;

use crate::config::PlaceholderValue;

/// Lowest `uidNumber` ever handed out, matching the scenario fixtures (S5).
pub const UID_FLOOR: i64 = 2000;

/// Resolves `${field}` substitution from the in-flight attribute map. Missing
/// fields are reported to the caller as `bad_request` per §4.4.
pub fn resolve_field(
    field: &str,
    values: &HashMap<String, String>,
) -> Result<String, crate::errors::Error> {
    values
        .get(field)
        .cloned()
        .ok_or_else(|| crate::errors::Error::BadRequest(format!("missing field '{field}'")))
}

/// Integer days since 1970-01-01 UTC.
#[must_use]
pub fn days_since_epoch() -> i64 {
    Utc::now().date_naive().signed_duration_since(epoch()).num_days()
}

fn epoch() -> chrono::NaiveDate {
    chrono::NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid constant date")
}

/// Substitutes every `${field}` occurrence in a DN pattern (e.g.
/// `uid=${uid},ou=people,dc=x`) from the in-flight attribute map. Missing
/// fields fail with `bad_request`, matching attribute-level `${field}`
/// resolution.
pub fn resolve_dn_pattern(
    pattern: &str,
    values: &HashMap<String, String>,
) -> Result<String, crate::errors::Error> {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            crate::errors::Error::BadRequest(format!("unterminated placeholder in '{pattern}'"))
        })?;
        out.push_str(&resolve_field(&after[..end], values)?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Resolves every placeholder in `attributes` against `values`, substituting
/// `next_uid` with the caller-supplied `next_uid` (already allocated under the
/// per-cluster write lock by the caller, see `gateway::NextUidAllocator`).
pub fn resolve_attributes(
    attributes: &HashMap<String, PlaceholderValue>,
    values: &HashMap<String, String>,
    next_uid: i64,
) -> Result<HashMap<String, String>, crate::errors::Error> {
    let mut resolved = HashMap::with_capacity(attributes.len());
    for (name, placeholder) in attributes {
        let value = match placeholder {
            PlaceholderValue::Literal(s) => s.clone(),
            PlaceholderValue::NextUid => next_uid.to_string(),
            PlaceholderValue::DaysSinceEpoch => days_since_epoch().to_string(),
            PlaceholderValue::Field(field) => resolve_field(field, values)?,
        };
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::{resolve_attributes, resolve_dn_pattern, resolve_field, UID_FLOOR};
    use crate::config::PlaceholderValue;
    use std::collections::HashMap;

    #[test]
    fn missing_field_is_bad_request() {
        let values = HashMap::new();
        let err = resolve_field("uid", &values).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::BadRequest);
    }

    #[test]
    fn resolves_next_uid_and_field() {
        let mut attrs = HashMap::new();
        attrs.insert("uidNumber".to_string(), PlaceholderValue::NextUid);
        attrs.insert(
            "uid".to_string(),
            PlaceholderValue::Field("login".to_string()),
        );
        let mut values = HashMap::new();
        values.insert("login".to_string(), "jdoe".to_string());

        let resolved = resolve_attributes(&attrs, &values, UID_FLOOR).unwrap();
        assert_eq!(resolved["uidNumber"], "2000");
        assert_eq!(resolved["uid"], "jdoe");
    }

    #[test]
    fn resolves_dn_pattern_placeholder() {
        let mut values = HashMap::new();
        values.insert("uid".to_string(), "jdoe".to_string());
        let dn = resolve_dn_pattern("uid=${uid},ou=people,dc=x", &values).unwrap();
        assert_eq!(dn, "uid=jdoe,ou=people,dc=x");
    }

    #[test]
    fn dn_pattern_missing_field_is_bad_request() {
        let values = HashMap::new();
        let err = resolve_dn_pattern("uid=${uid},ou=people,dc=x", &values).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::BadRequest);
    }
}
