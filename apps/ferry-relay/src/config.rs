use config::{Config, ConfigError, Environment, File};
use ferry_core::NodeRole;
use ferry_node::{CacheBudget, NodeConfig};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    pub role: NodeRole,
    pub store_path: PathBuf,
    pub node_key_path: PathBuf,
    pub listen: Option<String>,
    #[serde(deserialize_with = "deserialize_list")]
    pub peers: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub max_frame_len: usize,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub session_idle_timeout: Duration,
    pub cache_budget_bytes: Option<u64>,
    pub cache_budget_bundles: Option<u64>,
    pub full_list_threshold: usize,
    pub bloom_false_positive_rate: f64,
    #[serde(deserialize_with = "deserialize_list")]
    pub forward_audiences: Vec<String>,
}

fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(split_list(value))
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(element) = seq.next_element()? {
                vec.push(element);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c| c == ',' || c == ';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl RelayConfig {
    /// Defaults, then the optional file, then `FERRY_*` variables.
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("role", "bridge")?
            .set_default("store_path", "data/ferry.db")?
            .set_default("node_key_path", "data/node.key")?
            .set_default("listen", "0.0.0.0:7400")?
            .set_default("peers", Vec::<String>::new())?
            .set_default("sync_interval", "60s")?
            .set_default("connect_timeout", "8s")?
            .set_default("max_frame_len", 1024 * 1024)?
            .set_default("sweep_interval", "5m")?
            .set_default("session_idle_timeout", "30s")?
            .set_default("cache_budget_bytes", None::<u64>)?
            .set_default("cache_budget_bundles", None::<u64>)?
            .set_default("full_list_threshold", 2_048)?
            .set_default("bloom_false_positive_rate", 0.01)?
            .set_default("forward_audiences", Vec::<String>::new())?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(Environment::with_prefix("FERRY").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    /// Node configuration for the relay: the role's profile with the
    /// operator's overrides applied.
    pub fn node_config(&self) -> NodeConfig {
        let mut node = NodeConfig::for_role(self.role);
        node.sweep_interval = self.sweep_interval;
        node.session_idle_timeout = self.session_idle_timeout;
        node.full_list_threshold = self.full_list_threshold;
        node.bloom_false_positive_rate = self.bloom_false_positive_rate;
        if let Some(max_bytes) = self.cache_budget_bytes {
            node.profile.cache_budget = CacheBudget {
                max_bytes,
                max_bundles: self
                    .cache_budget_bundles
                    .or(node.profile.cache_budget.max_bundles),
            };
        } else if let Some(max_bundles) = self.cache_budget_bundles {
            node.profile.cache_budget.max_bundles = Some(max_bundles);
        }
        if !self.forward_audiences.is_empty() {
            node.profile.forward_audiences = self.forward_audiences.clone();
        }
        node
    }
}
