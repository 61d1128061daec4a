//! Node configuration.
//!
//! The node config file is TOML on disk. Channel memberships mirror the
//! membership document issued by the hub, so those structs keep the hub's
//! camelCase field names.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    /// Human-readable label for this node.
    pub label: String,

    #[serde(default)]
    pub owner: Option<String>,

    /// Root of the content-addressed store.
    pub storage_dir: PathBuf,

    #[serde(default)]
    pub channels: Vec<ChannelMembership>,
}

/// Membership of one federation channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMembership {
    pub channel_name: String,

    /// `gs://bucket/prefix` or a plain https URL.
    pub channel_bucket_uri: String,

    #[serde(default)]
    pub roles: ChannelRoles,

    #[serde(default)]
    pub authorization: ChannelAuthorization,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRoles {
    #[serde(default)]
    pub request_files: bool,

    #[serde(default)]
    pub provide_files: bool,

    #[serde(default)]
    pub request_feeds: bool,

    #[serde(default)]
    pub provide_feeds: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelAuthorization {
    #[serde(default)]
    pub permissions: ChannelRoles,
}

/// The four operations a membership can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    RequestFiles,
    ProvideFiles,
    RequestFeeds,
    ProvideFeeds,
}

impl ChannelRoles {
    fn has(&self, role: ChannelRole) -> bool {
        match role {
            ChannelRole::RequestFiles => self.request_files,
            ChannelRole::ProvideFiles => self.provide_files,
            ChannelRole::RequestFeeds => self.request_feeds,
            ChannelRole::ProvideFeeds => self.provide_feeds,
        }
    }
}

impl ChannelMembership {
    /// An operation is enabled iff both the role and the matching
    /// authorization permission are set.
    pub fn can(&self, role: ChannelRole) -> bool {
        self.roles.has(role) && self.authorization.permissions.has(role)
    }
}

impl ChannelRoles {
    pub fn all() -> Self {
        ChannelRoles {
            request_files: true,
            provide_files: true,
            request_feeds: true,
            provide_feeds: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_requires_matching_permission() {
        let membership = ChannelMembership {
            channel_name: "flatiron".into(),
            channel_bucket_uri: "gs://flatiron-bucket".into(),
            roles: ChannelRoles {
                request_files: true,
                provide_files: true,
                ..Default::default()
            },
            authorization: ChannelAuthorization {
                permissions: ChannelRoles {
                    request_files: true,
                    ..Default::default()
                },
            },
        };
        assert!(membership.can(ChannelRole::RequestFiles));
        assert!(!membership.can(ChannelRole::ProvideFiles));
        assert!(!membership.can(ChannelRole::RequestFeeds));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = NodeConfig {
            label: "lab-node".into(),
            owner: Some("owner@example.org".into()),
            storage_dir: "/var/kachery".into(),
            channels: vec![ChannelMembership {
                channel_name: "ch".into(),
                channel_bucket_uri: "gs://b".into(),
                roles: ChannelRoles::all(),
                authorization: ChannelAuthorization {
                    permissions: ChannelRoles::all(),
                },
            }],
        };
        let text = toml::to_string(&config).unwrap();
        let back: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
