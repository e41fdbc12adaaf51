//! Configuration for Arbor
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;

use crate::types::{DirectoryError, Result};

/// Arbor - federated directory node
///
/// One node in a tree of cooperating directories. Things registered here can
/// be replicated upward (push-up), searched across the subtree (fan-out), and
/// guarded by attribute-based policies.
#[derive(Parser, Debug, Clone)]
#[command(name = "arbor")]
#[command(about = "Federated directory node for thing descriptions")]
pub struct Args {
    /// Directory name of this node (its location identity in the tree)
    #[arg(long, env = "NODE_NAME", default_value = "master")]
    pub node_name: String,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Parent directory link as name=url (absent on the root node)
    #[arg(long, env = "PARENT")]
    pub parent: Option<String>,

    /// Child directory links as name=url (repeatable, or comma-separated in env)
    #[arg(long = "child", env = "CHILDREN", value_delimiter = ',')]
    pub children: Vec<String>,

    /// Descendant aliases as target=child (repeatable, or comma-separated in env)
    ///
    /// Maps a multi-hop descendant name to the direct child it is reachable
    /// through. Further aliases are managed at runtime via /alias.
    #[arg(long = "alias", env = "ALIASES", value_delimiter = ',')]
    pub aliases: Vec<String>,

    /// Request timeout for peer-to-peer calls in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "10000")]
    pub request_timeout_ms: u64,

    /// Maximum accepted claim token age in seconds
    #[arg(long, env = "CLAIM_MAX_AGE_SECONDS", default_value = "300")]
    pub claim_max_age_seconds: i64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Parse a name=url pair
    fn split_pair(raw: &str) -> Result<(String, String)> {
        let (name, url) = raw
            .split_once('=')
            .ok_or_else(|| DirectoryError::Config(format!("expected name=url, got '{}'", raw)))?;
        if name.trim().is_empty() || url.trim().is_empty() {
            return Err(DirectoryError::Config(format!("empty name or url in '{}'", raw)));
        }
        Ok((name.trim().to_string(), url.trim().to_string()))
    }

    /// Parent link as (name, url), if configured
    pub fn parent_link(&self) -> Result<Option<(String, String)>> {
        self.parent.as_deref().map(Self::split_pair).transpose()
    }

    /// Child links as (name, url) pairs
    pub fn child_links(&self) -> Result<Vec<(String, String)>> {
        self.children.iter().map(|c| Self::split_pair(c)).collect()
    }

    /// Descendant aliases as (target, child) pairs
    pub fn alias_links(&self) -> Result<Vec<(String, String)>> {
        self.aliases.iter().map(|a| Self::split_pair(a)).collect()
    }

    /// Validate configuration before startup
    pub fn validate(&self) -> Result<()> {
        let children = self.child_links()?;
        if let Some((parent_name, _)) = self.parent_link()? {
            if parent_name == self.node_name {
                return Err(DirectoryError::Config(
                    "parent name must differ from node name".to_string(),
                ));
            }
        }
        for (target, child) in self.alias_links()? {
            if !children.iter().any(|(name, _)| *name == child) {
                return Err(DirectoryError::Config(format!(
                    "alias {}={} refers to unknown child",
                    target, child
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_links() {
        let args = Args::parse_from([
            "arbor",
            "--node-name", "level1",
            "--parent", "master=http://localhost:8000",
            "--child", "level2a=http://localhost:8002",
            "--child", "level2b=http://localhost:8003",
            "--alias", "level3=level2a",
        ]);
        assert!(args.validate().is_ok());
        assert_eq!(
            args.parent_link().unwrap(),
            Some(("master".to_string(), "http://localhost:8000".to_string()))
        );
        assert_eq!(args.child_links().unwrap().len(), 2);
        assert_eq!(
            args.alias_links().unwrap(),
            vec![("level3".to_string(), "level2a".to_string())]
        );
    }

    #[test]
    fn test_alias_to_unknown_child_rejected() {
        let args = Args::parse_from(["arbor", "--alias", "level3=nowhere"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_malformed_pair_rejected() {
        let args = Args::parse_from(["arbor", "--child", "no-equals-sign"]);
        assert!(args.validate().is_err());
    }
}
