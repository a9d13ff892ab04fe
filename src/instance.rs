//! Instance URI parsing.
//!
//! A MeridianDB instance is addressed by a four-part identifier. Two wire
//! forms are accepted:
//!
//! - Long: `projects/<PROJECT>/locations/<REGION>/clusters/<CLUSTER>/instances/<INSTANCE>`.
//!   The project may be a legacy domain-scoped project containing a single
//!   colon (e.g. `example.com:project`).
//! - Short: `<PROJECT>.<REGION>.<CLUSTER>.<INSTANCE>`, where no part contains
//!   a colon. The project may itself contain dots; the last three components
//!   are always region, cluster, and instance.
//!
//! The parser is the only place identifiers are validated. Everything else
//! in the crate takes a parsed [`InstanceUri`].

use std::fmt;

use crate::error::{Error, Result};

/// A parsed MeridianDB instance identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct InstanceUri {
    project: String,
    region: String,
    cluster: String,
    name: String,
}

impl InstanceUri {
    /// Parse an instance identifier in either the long or short form.
    pub fn parse(uri: &str) -> Result<Self> {
        if let Some(parsed) = parse_long(uri) {
            return Ok(parsed);
        }
        if let Some(parsed) = parse_short(uri) {
            return Ok(parsed);
        }
        Err(Error::config(
            "invalid instance URI, expected \
             projects/<PROJECT>/locations/<REGION>/clusters/<CLUSTER>/instances/<INSTANCE> \
             or <PROJECT>.<REGION>.<CLUSTER>.<INSTANCE>",
            uri,
        ))
    }

    /// The project part of the identifier.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// The region part of the identifier.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// The cluster part of the identifier.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// The instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The full long-form URI.
    pub fn uri(&self) -> String {
        format!(
            "projects/{}/locations/{}/clusters/{}/instances/{}",
            self.project, self.region, self.cluster, self.name
        )
    }

    /// The long-form URI of the instance's parent cluster, used when
    /// requesting client certificates.
    pub fn parent(&self) -> String {
        format!(
            "projects/{}/locations/{}/clusters/{}",
            self.project, self.region, self.cluster
        )
    }
}

impl fmt::Display for InstanceUri {
    /// Renders the short dotted form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.project, self.region, self.cluster, self.name
        )
    }
}

fn parse_long(uri: &str) -> Option<InstanceUri> {
    let rest = uri.strip_prefix("projects/")?;
    let (project, rest) = rest.split_once("/locations/")?;
    let (region, rest) = rest.split_once("/clusters/")?;
    let (cluster, name) = rest.split_once("/instances/")?;

    if [project, region, cluster, name]
        .iter()
        .any(|part| part.is_empty() || part.contains('/'))
    {
        return None;
    }
    // Only the project may carry a colon, and only one (legacy domain-scoped
    // projects such as "example.com:project").
    let mut halves = project.split(':');
    let first = halves.next()?;
    if first.is_empty() {
        return None;
    }
    if let Some(second) = halves.next() {
        if second.is_empty() || halves.next().is_some() {
            return None;
        }
    }
    if [region, cluster, name].iter().any(|part| part.contains(':')) {
        return None;
    }
    Some(InstanceUri {
        project: project.to_string(),
        region: region.to_string(),
        cluster: cluster.to_string(),
        name: name.to_string(),
    })
}

fn parse_short(uri: &str) -> Option<InstanceUri> {
    if uri.contains(':') || uri.contains('/') {
        return None;
    }
    // The project may contain dots; the final three components may not.
    let mut parts = uri.rsplitn(4, '.');
    let name = parts.next()?;
    let cluster = parts.next()?;
    let region = parts.next()?;
    let project = parts.next()?;
    if project.is_empty() || region.is_empty() || cluster.is_empty() || name.is_empty() {
        return None;
    }
    Some(InstanceUri {
        project: project.to_string(),
        region: region.to_string(),
        cluster: cluster.to_string(),
        name: name.to_string(),
    })
}
