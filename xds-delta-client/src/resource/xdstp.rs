//! `xdstp://` resource names.
//!
//! An xdstp name has the shape
//! `xdstp://{authority}/{resource_type}/{id}?{context params}`. Two names
//! denote the same resource when they agree after their context parameters
//! are sorted, which [`XdstpName::encode`] always does.
//!
//! Percent-encoding and `#` directives are not supported.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

const SCHEME: &str = "xdstp:";
const SCHEME_AND_SLASHES: &str = "xdstp://";

/// Returns true if `name` uses the `xdstp:` scheme.
pub fn has_xdstp_scheme(name: &str) -> bool {
    name.starts_with(SCHEME)
}

/// A parsed `xdstp://` resource name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XdstpName {
    authority: String,
    resource_type: String,
    id: String,
    context: BTreeMap<String, String>,
}

impl XdstpName {
    /// Parse an `xdstp://` name.
    pub fn decode(urn: &str) -> Result<Self> {
        let invalid = || Error::InvalidResourceName(urn.to_owned());

        let rest = urn.strip_prefix(SCHEME_AND_SLASHES).ok_or_else(invalid)?;
        if rest.contains('#') {
            return Err(invalid());
        }

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        let (authority, path) = path.split_once('/').ok_or_else(invalid)?;
        let (resource_type, id) = match path.split_once('/') {
            Some((resource_type, id)) => (resource_type, id),
            None => (path, ""),
        };
        if resource_type.is_empty() {
            return Err(invalid());
        }

        let mut context = BTreeMap::new();
        for param in query.into_iter().flat_map(|q| q.split('&')) {
            if param.is_empty() {
                continue;
            }
            let (key, value) = param.split_once('=').ok_or_else(invalid)?;
            context.insert(key.to_owned(), value.to_owned());
        }

        Ok(Self {
            authority: authority.to_owned(),
            resource_type: resource_type.to_owned(),
            id: id.to_owned(),
            context,
        })
    }

    /// Render the name with its context parameters sorted by key.
    pub fn encode(&self) -> String {
        let mut urn = format!(
            "{SCHEME_AND_SLASHES}{}/{}/{}",
            self.authority, self.resource_type, self.id
        );
        if !self.context.is_empty() {
            let params = self
                .context
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join("&");
            urn.push('?');
            urn.push_str(&params);
        }
        urn
    }

    /// The resource id, the path after the resource type.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The context parameters.
    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    /// Returns true if this name denotes a glob collection (`.../*`).
    pub fn is_glob_collection(&self) -> bool {
        self.id.ends_with("/*")
    }

    /// The glob collection this resource belongs to: the id's last path
    /// segment replaced by `*`.
    pub fn glob_collection(&self) -> Self {
        let id = match self.id.rfind('/') {
            Some(pos) => format!("{}/*", &self.id[..pos]),
            None => "*".to_owned(),
        };
        Self { id, ..self.clone() }
    }

    /// Merge node context parameters into this name. Parameters already on
    /// the name take precedence.
    pub fn with_node_context(mut self, node_params: &BTreeMap<String, String>) -> Self {
        for (key, value) in node_params {
            self.context
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }
}
