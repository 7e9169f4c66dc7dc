//! Use-case layer: paginated listing, CRUD, group-membership transactions, stats
//! (§4.5). This is the layer an (external) HTTP handler calls directly.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use ldap3::{Mod, Scope, SearchEntry};
use tracing::{info, warn};

use crate::{
    config::{ClusterConfig, GatewayConfig, PlaceholderValue, View},
    errors::{Error, Result},
    gateway::{filter, placeholders, LdapGateway, MutationOutcome},
    net::{Fingerprint, Host, PasswordProvider},
    selector::{NodeSelector, OperationClass},
    vault::CredentialVault,
};

const DEFAULT_SEARCH_ATTRS: &[&str] = &["uid", "cn", "mail", "sn"];

/// Page size used when scanning a cluster's subtree for the current maximum
/// `uidNumber` during `next_uid` allocation.
const UID_SCAN_PAGE_SIZE: i32 = 1000;

/// Safety backstop on how many pages `next_uid` allocation will scan before
/// giving up; bounds the search even against a pathologically large subtree.
const UID_SCAN_MAX_PAGES: usize = 10_000;

/// A single directory entry as returned to callers: DN plus its attribute map.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attributes: HashMap<String, Vec<String>>,
}

impl From<SearchEntry> for DirectoryEntry {
    fn from(entry: SearchEntry) -> Self {
        Self {
            dn: entry.dn,
            attributes: entry.attrs,
        }
    }
}

/// Paginated listing result, per §4.5.
#[derive(Debug, Clone)]
pub struct ListResult {
    pub entries: Vec<DirectoryEntry>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub has_more: bool,
}

/// Per-view entry counts, used by `stats`.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub users: usize,
    pub groups: usize,
    pub ous: usize,
    pub total: usize,
}

/// Result of a best-effort group-membership transaction.
#[derive(Debug, Clone)]
pub struct GroupTransactionResult {
    pub applied: usize,
    pub errors: Vec<(String, String)>,
}

impl GroupTransactionResult {
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Credential resolver backed by the vault, implementing the pool's
/// [`PasswordProvider`] contract.
pub struct VaultPasswordProvider {
    vault: Arc<CredentialVault>,
}

#[async_trait::async_trait]
impl PasswordProvider for VaultPasswordProvider {
    async fn password_for(&self, cluster: &str) -> Result<String, Error> {
        self.vault
            .load(cluster)?
            .ok_or_else(|| Error::AuthFailed(format!("no cached credential for '{cluster}'")))
    }
}

/// Use-case facade wiring config, node selection, the session pool, and the LDAP
/// gateway into the operations an HTTP layer needs.
pub struct DirectoryService {
    config: Arc<GatewayConfig>,
    gateway: Arc<LdapGateway>,
    selectors: HashMap<String, NodeSelector>,
    passwords: VaultPasswordProvider,
}

impl DirectoryService {
    #[must_use]
    pub fn new(
        config: Arc<GatewayConfig>,
        gateway: Arc<LdapGateway>,
        vault: Arc<CredentialVault>,
    ) -> Self {
        let selectors = config
            .clusters
            .iter()
            .map(|c| {
                let nodes = c
                    .node_list()
                    .into_iter()
                    .map(|n| (n.address(), n.label.clone()))
                    .collect();
                (c.name.clone(), NodeSelector::new(c.name.clone(), nodes))
            })
            .collect();
        Self {
            config,
            gateway,
            selectors,
            passwords: VaultPasswordProvider { vault },
        }
    }

    fn cluster(&self, name: &str) -> Result<&ClusterConfig, Error> {
        self.config
            .cluster(name)
            .ok_or_else(|| Error::NotFound(format!("cluster '{name}'")))
    }

    fn selector(&self, name: &str) -> Result<&NodeSelector, Error> {
        self.selectors
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("cluster '{name}'")))
    }

    fn require_writable(&self, cluster: &ClusterConfig) -> Result<(), Error> {
        if cluster.readonly {
            return Err(Error::Forbidden(cluster.name.clone()));
        }
        Ok(())
    }

    async fn fingerprint_for(
        &self,
        cluster: &ClusterConfig,
        class: OperationClass,
    ) -> Result<(Fingerprint, crate::net::Host), Error> {
        let selector = self.selector(&cluster.name)?;
        let index = selector.select(class).await?;
        let host = selector
            .host_at(index)
            .ok_or_else(|| Error::Internal("selected node index out of range".into()))?
            .clone();
        Ok((Fingerprint::new(&cluster.name, &host, &cluster.bind_dn), host))
    }

    /// Per-view entry counts.
    pub async fn stats(&self, cluster_name: &str) -> Result<Stats, Error> {
        let _ = self.cluster(cluster_name)?;
        let users = self.list(cluster_name, View::Users, 0, MAX_GROUP_PAGE, "").await?.total;
        let groups = self.list(cluster_name, View::Groups, 0, MAX_GROUP_PAGE, "").await?.total;
        let ous = self.list(cluster_name, View::Ous, 0, MAX_GROUP_PAGE, "").await?.total;
        Ok(Stats {
            users,
            groups,
            ous,
            total: users + groups + ous,
        })
    }

    /// Paginated, optionally-filtered listing for one view.
    pub async fn list(
        &self,
        cluster_name: &str,
        view: View,
        page: usize,
        page_size: usize,
        query: &str,
    ) -> Result<ListResult, Error> {
        let cluster = self.cluster(cluster_name)?;
        let (fingerprint, node) = self.fingerprint_for(cluster, OperationClass::Read).await?;
        let filter_expr = filter::compose(view.base_filter(), DEFAULT_SEARCH_ATTRS, query);

        let mut search = self
            .gateway
            .search_paged(
                fingerprint,
                &node,
                &self.passwords,
                &cluster.base_dn,
                Scope::Subtree,
                &filter_expr,
                vec!["*".to_string()],
                page_size.max(1) as i32,
                page + 1,
            )
            .await?;

        // Walk pages up to and including the requested one; the cursor's own
        // `max_pages` cap (set to `page + 1` above) keeps this bounded. If the
        // result set is shorter than the requested page, the cursor exhausts
        // first and `current` ends up holding whatever page was actually last
        // reached (possibly `None` for an empty result set).
        let mut current: Option<crate::gateway::Page> = None;
        let mut entries_before_current = 0usize;
        while let Some(p) = search.next_page().await.map_err(Error::Gateway)? {
            if let Some(prev) = current.take() {
                entries_before_current += prev.entries.len();
            }
            let is_requested = p.page_index == page;
            current = Some(p);
            if is_requested {
                break;
            }
        }
        search.close().await;

        let has_more = current.as_ref().is_some_and(|p| p.has_more);
        let reached_page = current.as_ref().map_or(0, |p| p.page_index);
        let entries: Vec<DirectoryEntry> = current
            .map(|p| p.entries.into_iter().map(DirectoryEntry::from).collect())
            .unwrap_or_default();

        // `total` is exact only when this page exhausts the result set; otherwise
        // it is a lower bound (the count observed so far), per the pagination
        // contract for result sets whose true size is not cheaply knowable.
        let total = entries_before_current + entries.len();
        Ok(ListResult {
            entries,
            page: reached_page,
            page_size,
            total,
            has_more,
        })
    }

    /// Creates a new entry from `cluster`'s declarative `user_template` plus
    /// caller-supplied field values (§4.4). The DN and every `${field}`
    /// attribute placeholder are resolved from `values`; a `next_uid`
    /// placeholder, if present, is allocated under the cluster's per-cluster
    /// write lock with collision retry (§9 scenario S5).
    pub async fn create(
        &self,
        cluster_name: &str,
        values: HashMap<String, String>,
    ) -> Result<MutationOutcome, Error> {
        let cluster = self.cluster(cluster_name)?;
        self.require_writable(cluster)?;
        let template = &cluster.user_template;
        let dn = placeholders::resolve_dn_pattern(&template.dn_pattern, &values)?;
        let (fingerprint, node) = self.fingerprint_for(cluster, OperationClass::Write).await?;

        let needs_uid = template
            .attributes
            .values()
            .any(|p| matches!(p, PlaceholderValue::NextUid));

        let outcome = if needs_uid {
            let uid = self
                .gateway
                .allocate_next_uid(
                    cluster,
                    || async { self.max_uid_number(cluster, fingerprint.clone(), &node).await },
                    |candidate| {
                        let fingerprint = fingerprint.clone();
                        let node = node.clone();
                        let dn = dn.clone();
                        let values = &values;
                        async move {
                            let resolved =
                                placeholders::resolve_attributes(&template.attributes, values, candidate)?;
                            let attrs = build_entry_attributes(&template.object_classes, &resolved);
                            match self.gateway.add(fingerprint, &node, &self.passwords, &dn, attrs).await? {
                                MutationOutcome::Committed => Ok(true),
                                MutationOutcome::Rejected => Ok(false),
                                MutationOutcome::TimedOut => {
                                    Err(Error::Timeout(format!("create '{dn}'")))
                                }
                            }
                        }
                    },
                )
                .await?;
            info!(cluster = cluster_name, dn, uid_number = uid, operation = "create", outcome = "committed");
            MutationOutcome::Committed
        } else {
            let resolved = placeholders::resolve_attributes(&template.attributes, &values, 0)?;
            let attrs = build_entry_attributes(&template.object_classes, &resolved);
            let outcome = self.gateway.add(fingerprint, &node, &self.passwords, &dn, attrs).await?;
            info!(cluster = cluster_name, dn, operation = "create", outcome = ?outcome);
            outcome
        };
        Ok(outcome)
    }

    /// Scans `cluster`'s subtree for the current maximum `uidNumber`, or
    /// `None` if no entry carries one yet.
    async fn max_uid_number(
        &self,
        cluster: &ClusterConfig,
        fingerprint: Fingerprint,
        node: &Host,
    ) -> Result<Option<i64>, Error> {
        let mut search = self
            .gateway
            .search_paged(
                fingerprint,
                node,
                &self.passwords,
                &cluster.base_dn,
                Scope::Subtree,
                "(uidNumber=*)",
                vec!["uidNumber".to_string()],
                UID_SCAN_PAGE_SIZE,
                UID_SCAN_MAX_PAGES,
            )
            .await?;

        let mut max: Option<i64> = None;
        while let Some(page) = search.next_page().await.map_err(Error::Gateway)? {
            for entry in &page.entries {
                if let Some(uid) = entry
                    .attrs
                    .get("uidNumber")
                    .and_then(|v| v.first())
                    .and_then(|v| v.parse::<i64>().ok())
                {
                    max = Some(max.map_or(uid, |m| m.max(uid)));
                }
            }
            if !page.has_more {
                break;
            }
        }
        search.close().await;
        Ok(max)
    }

    /// Applies attribute modifications to an existing entry.
    pub async fn update(
        &self,
        cluster_name: &str,
        dn: &str,
        changes: Vec<Mod<String>>,
    ) -> Result<MutationOutcome, Error> {
        let cluster = self.cluster(cluster_name)?;
        self.require_writable(cluster)?;
        let (fingerprint, node) = self.fingerprint_for(cluster, OperationClass::Write).await?;
        let outcome = self
            .gateway
            .modify(fingerprint, &node, &self.passwords, dn, changes)
            .await?;
        info!(cluster = cluster_name, dn, operation = "update", outcome = ?outcome);
        Ok(outcome)
    }

    /// Deletes an entry.
    pub async fn delete(&self, cluster_name: &str, dn: &str) -> Result<MutationOutcome, Error> {
        let cluster = self.cluster(cluster_name)?;
        self.require_writable(cluster)?;
        let (fingerprint, node) = self.fingerprint_for(cluster, OperationClass::Write).await?;
        let outcome = self
            .gateway
            .delete(fingerprint, &node, &self.passwords, dn)
            .await?;
        warn!(cluster = cluster_name, dn, operation = "delete", outcome = ?outcome);
        Ok(outcome)
    }

    /// Enumerates all groups.
    pub async fn list_groups(&self, cluster_name: &str) -> Result<Vec<DirectoryEntry>, Error> {
        Ok(self
            .list(cluster_name, View::Groups, 0, MAX_GROUP_PAGE, "")
            .await?
            .entries)
    }

    /// Returns the DNs of groups `user_dn` currently belongs to.
    pub async fn user_groups(&self, cluster_name: &str, user_dn: &str) -> Result<HashSet<String>, Error> {
        let groups = self.list_groups(cluster_name).await?;
        Ok(groups
            .into_iter()
            .filter(|g| is_member(g, user_dn))
            .map(|g| g.dn)
            .collect())
    }

    /// Computes `add = desired \ current`, `remove = current \ desired`, and issues
    /// one modify per affected group. Best-effort: a failing group does not roll
    /// back successful ones (§4.5).
    pub async fn set_user_groups(
        &self,
        cluster_name: &str,
        user_dn: &str,
        desired: HashSet<String>,
    ) -> Result<GroupTransactionResult, Error> {
        let cluster = self.cluster(cluster_name)?;
        self.require_writable(cluster)?;

        let current = self.user_groups(cluster_name, user_dn).await?;
        let (to_add, to_remove) = diff_memberships(&current, &desired);

        if to_add.is_empty() && to_remove.is_empty() {
            return Ok(GroupTransactionResult { applied: 0, errors: vec![] });
        }

        let groups = self.list_groups(cluster_name).await?;
        let (fingerprint, node) = self.fingerprint_for(cluster, OperationClass::Write).await?;

        let mut applied = 0;
        let mut errors = Vec::new();
        for group_dn in &to_add {
            let attr = member_attribute(&groups, group_dn);
            let changes = vec![Mod::Add(attr, HashSet::from([user_dn.to_string()]))];
            match self
                .gateway
                .modify(fingerprint.clone(), &node, &self.passwords, group_dn, changes)
                .await
            {
                Ok(MutationOutcome::Committed) => applied += 1,
                Ok(other) => errors.push((group_dn.clone(), format!("{other:?}"))),
                Err(e) => errors.push((group_dn.clone(), e.to_string())),
            }
        }
        for group_dn in &to_remove {
            let attr = member_attribute(&groups, group_dn);
            let changes = vec![Mod::Delete(attr, HashSet::from([user_dn.to_string()]))];
            match self
                .gateway
                .modify(fingerprint.clone(), &node, &self.passwords, group_dn, changes)
                .await
            {
                Ok(MutationOutcome::Committed) => applied += 1,
                Ok(other) => errors.push((group_dn.clone(), format!("{other:?}"))),
                Err(e) => errors.push((group_dn.clone(), e.to_string())),
            }
        }

        Ok(GroupTransactionResult { applied, errors })
    }
}

const MAX_GROUP_PAGE: usize = 1000;

/// Builds the full attribute set for an `add`: the template's fixed
/// `objectClass` list plus every resolved placeholder, one value each.
fn build_entry_attributes(
    object_classes: &[String],
    resolved: &HashMap<String, String>,
) -> Vec<(String, HashSet<String>)> {
    let mut attrs = vec![(
        "objectClass".to_string(),
        object_classes.iter().cloned().collect(),
    )];
    attrs.extend(resolved.iter().map(|(k, v)| (k.clone(), HashSet::from([v.clone()]))));
    attrs
}

/// Computes `add = desired \ current` and `remove = current \ desired`. Calling
/// with `desired == current` yields two empty lists (§8 invariant 6).
fn diff_memberships(current: &HashSet<String>, desired: &HashSet<String>) -> (Vec<String>, Vec<String>) {
    let to_add = desired.difference(current).cloned().collect();
    let to_remove = current.difference(desired).cloned().collect();
    (to_add, to_remove)
}

fn is_member(group: &DirectoryEntry, user_dn: &str) -> bool {
    for attr in ["member", "uniqueMember", "memberUid"] {
        if let Some(values) = group.attributes.get(attr) {
            if values.iter().any(|v| v == user_dn) {
                return true;
            }
        }
    }
    false
}

fn member_attribute(groups: &[DirectoryEntry], group_dn: &str) -> String {
    groups
        .iter()
        .find(|g| g.dn == group_dn)
        .and_then(|g| {
            let classes = g.attributes.get("objectClass")?;
            if classes.iter().any(|c| c == "groupOfUniqueNames") {
                Some("uniqueMember".to_string())
            } else {
                Some("member".to_string())
            }
        })
        .unwrap_or_else(|| "member".to_string())
}

#[cfg(test)]
mod tests {
    use super::{build_entry_attributes, diff_memberships, is_member, DirectoryEntry};
    use std::collections::{HashMap, HashSet};

    #[test]
    fn detects_membership_across_attribute_names() {
        let mut attrs = HashMap::new();
        attrs.insert(
            "uniqueMember".to_string(),
            vec!["uid=jdoe,ou=people,dc=x".to_string()],
        );
        let group = DirectoryEntry {
            dn: "cn=admins,ou=groups,dc=x".into(),
            attributes: attrs,
        };
        assert!(is_member(&group, "uid=jdoe,ou=people,dc=x"));
        assert!(!is_member(&group, "uid=other,ou=people,dc=x"));
    }

    #[test]
    fn identical_desired_and_current_yields_no_changes() {
        let current: HashSet<String> = ["cn=admins,ou=groups,dc=x".to_string()].into();
        let (to_add, to_remove) = diff_memberships(&current, &current.clone());
        assert!(to_add.is_empty());
        assert!(to_remove.is_empty());
    }

    #[test]
    fn computes_add_and_remove_sets() {
        let current: HashSet<String> = ["a".to_string(), "b".to_string()].into();
        let desired: HashSet<String> = ["b".to_string(), "c".to_string()].into();
        let (to_add, to_remove) = diff_memberships(&current, &desired);
        assert_eq!(to_add, vec!["c".to_string()]);
        assert_eq!(to_remove, vec!["a".to_string()]);
    }

    #[test]
    fn build_entry_attributes_includes_object_classes_and_resolved_fields() {
        let object_classes = vec!["inetOrgPerson".to_string(), "posixAccount".to_string()];
        let mut resolved = HashMap::new();
        resolved.insert("uid".to_string(), "jdoe".to_string());
        resolved.insert("uidNumber".to_string(), "2000".to_string());

        let attrs = build_entry_attributes(&object_classes, &resolved);
        let object_class_values = attrs
            .iter()
            .find(|(k, _)| k == "objectClass")
            .map(|(_, v)| v)
            .expect("objectClass attribute present");
        assert_eq!(
            object_class_values,
            &HashSet::from(["inetOrgPerson".to_string(), "posixAccount".to_string()])
        );
        assert!(attrs
            .iter()
            .any(|(k, v)| k == "uid" && v.contains("jdoe")));
        assert!(attrs
            .iter()
            .any(|(k, v)| k == "uidNumber" && v.contains("2000")));
    }
}
