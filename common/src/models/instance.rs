//! Instance resource identifier.
//!
//! An AlloyDB instance is addressed by the hierarchical path
//! `projects/<project>/locations/<region>/clusters/<cluster>/instances/<instance>`.

use std::fmt;

/// Fully qualified instance URI.
///
/// Components are stored verbatim; no escaping or character validation is
/// performed here; the Admin API rejects malformed names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceUri {
    project: String,
    region: String,
    cluster: String,
    instance: String,
}

impl InstanceUri {
    /// Composes an instance URI from its four components.
    pub fn new(
        project: impl Into<String>,
        region: impl Into<String>,
        cluster: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            region: region.into(),
            cluster: cluster.into(),
            instance: instance.into(),
        }
    }

    /// Returns the parent cluster path, `projects/.../clusters/<cluster>`.
    pub fn cluster_path(&self) -> String {
        format!(
            "projects/{}/locations/{}/clusters/{}",
            self.project, self.region, self.cluster
        )
    }
}

impl fmt::Display for InstanceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/instances/{}", self.cluster_path(), self.instance)
    }
}
