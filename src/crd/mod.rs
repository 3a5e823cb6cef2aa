pub mod postgresql;

pub use postgresql::{
    CloneDescription, ClusterStatus, Patroni, Postgresql, PostgresqlParam, PostgresqlSpec,
    PostgresqlStatus, ResourceDescription, Resources, Sidecar, UserFlags, Volume,
};

/// API group of the custom resource
pub const API_GROUP: &str = "acid.zalan.do";

/// API version of the custom resource
pub const API_VERSION: &str = "v1";

/// Kind, as registered with the API server
pub const KIND: &str = "postgresql";
