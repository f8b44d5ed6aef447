//! Client attribute snapshot read off `clients/<id>` (§4.6 "evaluate
//! `client_rule_set` against the client's current attribute set").

use ranger_datastore::Datastore;
use ranger_proto::{ReadMode, Subject};
use std::collections::{HashMap, HashSet};

const ATTR_PREFIX: &str = "attr:";
const LABEL_PREFIX: &str = "label:";

#[derive(Debug, Clone, Default)]
pub struct ClientAttributes {
    attrs: HashMap<String, String>,
    labels: HashSet<String>,
}

impl ClientAttributes {
    pub async fn load(datastore: &dyn Datastore, client_id: &str) -> ranger_datastore::Result<Self> {
        let subject = Subject::client(client_id);
        let attr_rows = datastore.resolve_regex(&subject, &format!("^{ATTR_PREFIX}"), ReadMode::Newest, None).await?;
        let label_rows = datastore.resolve_regex(&subject, &format!("^{LABEL_PREFIX}"), ReadMode::Newest, None).await?;

        let attrs = attr_rows
            .into_iter()
            .filter_map(|row| {
                let name = row.predicate.strip_prefix(ATTR_PREFIX)?.to_string();
                Some((name, String::from_utf8_lossy(&row.value).to_string()))
            })
            .collect();
        let labels = label_rows
            .into_iter()
            .filter_map(|row| row.predicate.strip_prefix(LABEL_PREFIX).map(ToString::to_string))
            .collect();

        Ok(Self { attrs, labels })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.parse().ok())
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub fn has_all_labels<'a>(&self, labels: impl IntoIterator<Item = &'a String>) -> bool {
        labels.into_iter().all(|l| self.has_label(l))
    }

    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    #[cfg(test)]
    pub(crate) fn set_for_test(&mut self, name: &str, value: &str) {
        self.attrs.insert(name.to_string(), value.to_string());
    }

    #[cfg(test)]
    pub(crate) fn label_for_test(&mut self, label: &str) {
        self.labels.insert(label.to_string());
    }
}
