//! Schema constants for the registry database.

// Current schema version
pub const SCHEMA_VERSION: u32 = 1;

// Table names
pub const TABLE_SCHEMA_MIGRATIONS: &str = "schema_migrations";
pub const TABLE_WORKSPACES: &str = "workspaces";
pub const TABLE_REMOTES: &str = "remotes";
pub const TABLE_CLUSTERS: &str = "clusters";

// Column names for the workspaces table
pub mod workspaces {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const MODE: &str = "mode";
    pub const WORKING_DIR: &str = "working_dir";
    pub const GIT_URL: &str = "git_url";
    pub const BRANCH: &str = "branch";
    pub const GIT_AUTH: &str = "git_auth";
    pub const GIT_USERNAME: &str = "git_username";
    pub const GIT_SECRET: &str = "git_secret";
    pub const CONFIG_PATH: &str = "config_path";
    pub const CONFIG_CONTENT: &str = "config_content";
    pub const LINK_COMPOSE_CONTENT: &str = "link_compose_content";
    pub const MANIFEST_CONTENT: &str = "manifest_content";
    pub const EXTEND: &str = "extend";
    pub const REMOTE_ID: &str = "remote_id";
    pub const CLUSTER_ID: &str = "cluster_id";
    pub const DELETED: &str = "deleted";
    pub const CREATED_AT: &str = "created_at";
}

// Column names for the remotes table
pub mod remotes {
    pub const ID: &str = "id";
    pub const ADDRESS: &str = "address";
    pub const SSH_PORT: &str = "ssh_port";
    pub const USER_NAME: &str = "user_name";
    pub const AUTH: &str = "auth";
    pub const SECRET: &str = "secret";
    pub const CREATED_AT: &str = "created_at";
}

// Column names for the clusters table
pub mod clusters {
    pub const ID: &str = "id";
    pub const CONTEXT: &str = "context";
    pub const NAMESPACE: &str = "namespace";
    pub const KUBECONFIG_PATH: &str = "kubeconfig_path";
    pub const KUBECONFIG_CONTENT: &str = "kubeconfig_content";
    pub const CREATED_AT: &str = "created_at";
}
