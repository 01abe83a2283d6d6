//! Request body for an openCypher bulk-loader endpoint reading CSVs from S3.

use anyhow::Result;
use serde::{Serialize, Serializer};

pub const LOADER_PORT: u16 = 8182;

fn upper_flag<S: Serializer>(flag: &bool, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(if *flag { "TRUE" } else { "FALSE" })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderRequest {
    pub source: String,
    pub format: String,
    pub iam_role_arn: String,
    pub region: String,
    #[serde(serialize_with = "upper_flag")]
    pub fail_on_error: bool,
    pub parallelism: String,
    #[serde(serialize_with = "upper_flag")]
    pub update_single_cardinality_properties: bool,
    #[serde(serialize_with = "upper_flag")]
    pub queue_request: bool,
    pub dependencies: Vec<String>,
}

impl LoaderRequest {
    pub fn new(source: &str, iam_role_arn: &str, region: &str) -> Self {
        Self {
            source: source.to_string(),
            format: "opencypher".to_string(),
            iam_role_arn: iam_role_arn.to_string(),
            region: region.to_string(),
            fail_on_error: false,
            parallelism: "MEDIUM".to_string(),
            update_single_cardinality_properties: false,
            queue_request: true,
            dependencies: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub fn loader_url(endpoint: &str) -> String {
    format!("https://{}:{}/loader", endpoint, LOADER_PORT)
}
