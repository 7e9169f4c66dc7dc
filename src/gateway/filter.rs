//! RFC 4515 filter-value escaping and a small composed-filter builder.
//!
//! Raw user input must never be concatenated directly into a filter string; every
//! substring that can originate from a caller goes through [`escape`] first.

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("attribute name '{0}' is not a valid LDAP attribute description")]
    InvalidAttribute(String),
}

impl FilterError {
    #[must_use]
    pub fn kind(&self) -> crate::errors::ErrorKind {
        crate::errors::ErrorKind::BadRequest
    }
}

/// Escapes `*`, `(`, `)`, `\`, and NUL per RFC 4515 as `\XX` hex escapes.
#[must_use]
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            _ => out.push(c),
        }
    }
    out
}

/// Builds `(attr=*escaped-substring*)` for a single attribute substring match.
#[must_use]
pub fn substring_eq(attr: &str, needle: &str) -> String {
    format!("({attr}=*{}*)", escape(needle))
}

/// ANDs a base view filter with a disjunction of substring matches over
/// `search_attrs`, skipping the disjunction entirely when `query` is empty.
#[must_use]
pub fn compose(base_filter: &str, search_attrs: &[&str], query: &str) -> String {
    if query.trim().is_empty() {
        return base_filter.to_string();
    }
    let disjunction = search_attrs
        .iter()
        .map(|attr| substring_eq(attr, query))
        .collect::<Vec<_>>()
        .join("");
    format!("(&{base_filter}(|{disjunction}))")
}

#[cfg(test)]
mod tests {
    use super::{compose, escape};

    #[test]
    fn escapes_all_special_bytes() {
        let escaped = escape("*)(uid=*");
        assert!(!escaped.contains('*'));
        assert!(!escaped.contains('('));
        assert!(!escaped.contains(')'));
        assert_eq!(escaped, "\\2a\\29\\28uid=\\2a");
    }

    #[test]
    fn backslash_is_escaped() {
        assert_eq!(escape(r"a\b"), "a\\5cb");
    }

    #[test]
    fn scenario_s1_escaping() {
        let base = "(|(objectClass=inetOrgPerson)(objectClass=posixAccount)(objectClass=account))";
        let filter = compose(base, &["uid", "cn", "mail", "sn"], "*)(uid=*");
        // The composed filter must carry no unescaped *, (, ) inside the query
        // portion; exact escape output is covered by `escapes_all_special_bytes`.
        let query_occurrences = filter.matches("uid=*\\2a\\29\\28uid=\\2a*").count();
        assert_eq!(query_occurrences, 1);
        assert!(filter.starts_with("(&(|(objectClass=inetOrgPerson)"));
    }

    #[test]
    fn empty_query_returns_base_filter_unchanged() {
        assert_eq!(compose("(objectClass=*)", &["uid"], ""), "(objectClass=*)");
    }
}
