use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use dagstep_core::coerce;
use dagstep_core::error::{DagstepError, Result};
use dagstep_core::types::{BuildContext, Step};

const STORAGE_CLASSES: &[&str] = &[
    "STANDARD",
    "REDUCED_REDUNDANCY",
    "STANDARD_IA",
    "ONEZONE_IA",
    "INTELLIGENT_TIERING",
    "GLACIER",
    "DEEP_ARCHIVE",
    "GLACIER_IR",
];
const SSE_MODES: &[&str] = &["AES256", "aws:kms"];
const ACLS: &[&str] = &[
    "private",
    "public-read",
    "public-read-write",
    "authenticated-read",
    "aws-exec-read",
    "bucket-owner-read",
    "bucket-owner-full-control",
];
const CHECKSUMS: &[&str] = &["CRC32", "CRC32C", "SHA1", "SHA256"];
const OUTPUT_FORMATS: &[&str] = &["json", "jsonl"];

/// What an s3 step does, taken from its command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Upload,
    Download,
    List,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Upload => "upload",
            Operation::Download => "download",
            Operation::List => "list",
            Operation::Delete => "delete",
        }
    }

    /// The operation named by a step's first command.
    pub fn from_step(step: &Step) -> Result<Self> {
        let entry = step.commands.first().ok_or_else(|| {
            DagstepError::config(format!(
                "step {}: command is required (upload, download, list or delete)",
                step.name
            ))
        })?;
        entry
            .command
            .parse()
            .map_err(|e: String| DagstepError::config(format!("step {}: {e}", step.name)))
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upload" => Ok(Operation::Upload),
            "download" => Ok(Operation::Download),
            "list" => Ok(Operation::List),
            "delete" => Ok(Operation::Delete),
            _ => Err(format!("unknown operation {s:?}")),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object storage options. Empty strings mean "not set".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    // Connection
    #[serde(default)]
    pub region: String,
    /// `file:///path` serves buckets from local directories.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: String,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default, rename = "disableSSL")]
    pub disable_ssl: bool,

    // Common
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub destination: String,

    // Upload
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub storage_class: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, rename = "sse")]
    pub server_side_encryption: String,
    #[serde(default)]
    pub sse_kms_key_id: String,
    #[serde(default)]
    pub acl: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub checksum_algorithm: String,
    /// Multipart part size in MB.
    #[serde(default = "default_part_size")]
    pub part_size: i64,
    #[serde(default = "default_concurrency")]
    pub concurrency: i64,

    // List
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub delimiter: String,
    #[serde(default = "default_max_keys")]
    pub max_keys: i64,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default = "default_output_format")]
    pub output_format: String,

    // Delete
    #[serde(default)]
    pub quiet: bool,
}

fn default_part_size() -> i64 {
    10
}
fn default_concurrency() -> i64 {
    5
}
fn default_max_keys() -> i64 {
    1000
}
fn default_output_format() -> String {
    "json".to_string()
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: String::new(),
            endpoint: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            session_token: String::new(),
            profile: String::new(),
            force_path_style: false,
            disable_ssl: false,
            bucket: String::new(),
            key: String::new(),
            source: String::new(),
            destination: String::new(),
            content_type: String::new(),
            storage_class: String::new(),
            metadata: BTreeMap::new(),
            server_side_encryption: String::new(),
            sse_kms_key_id: String::new(),
            acl: String::new(),
            tags: BTreeMap::new(),
            checksum_algorithm: String::new(),
            part_size: default_part_size(),
            concurrency: default_concurrency(),
            prefix: String::new(),
            delimiter: String::new(),
            max_keys: default_max_keys(),
            recursive: false,
            output_format: default_output_format(),
            quiet: false,
        }
    }
}

impl S3Config {
    /// In-code defaults, then `[defaults.s3]`, then the step's own config.
    pub fn resolve(ctx: &BuildContext, step: &Step) -> Result<Self> {
        coerce::decode_layered(
            &Self::default(),
            &[ctx.defaults.for_type("s3"), &step.executor.config],
        )
        .map_err(|e| DagstepError::config(format!("step {}: s3 config: {e}", step.name)))
    }

    /// Check the merged config for `op` and normalize enumerated fields.
    pub fn validate_for(&mut self, op: Operation) -> Result<()> {
        let require = |value: &str, field: &str| {
            if value.is_empty() {
                Err(DagstepError::config(format!("{field} is required for {op}")))
            } else {
                Ok(())
            }
        };

        require(&self.bucket, "bucket")?;
        match op {
            Operation::Upload => {
                require(&self.source, "source")?;
                require(&self.key, "key")?;
            }
            Operation::Download => {
                require(&self.key, "key")?;
                require(&self.destination, "destination")?;
            }
            Operation::List => {}
            Operation::Delete => {
                if self.key.is_empty() && self.prefix.is_empty() {
                    return Err(DagstepError::config("key or prefix is required for delete"));
                }
            }
        }

        normalize(&mut self.storage_class, STORAGE_CLASSES, "storageClass")?;
        normalize(&mut self.output_format, OUTPUT_FORMATS, "outputFormat")?;
        normalize(&mut self.server_side_encryption, SSE_MODES, "sse")?;
        if self.server_side_encryption == "aws:kms" && self.sse_kms_key_id.is_empty() {
            return Err(DagstepError::config(
                "sseKmsKeyId is required when sse is 'aws:kms'",
            ));
        }
        normalize(&mut self.acl, ACLS, "acl")?;
        normalize(&mut self.checksum_algorithm, CHECKSUMS, "checksumAlgorithm")?;

        if self.concurrency < 0 {
            return Err(DagstepError::config("concurrency must be >= 0"));
        }
        if self.part_size < 0 {
            return Err(DagstepError::config("partSize must be >= 0"));
        }
        if self.max_keys < 1 {
            return Err(DagstepError::config("maxKeys must be >= 1"));
        }
        Ok(())
    }

    pub fn is_jsonl(&self) -> bool {
        self.output_format == "jsonl"
    }
}

/// Replace `value` with its allow-list spelling; empty stays empty.
fn normalize(value: &mut String, allowed: &[&str], field: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    match allowed.iter().find(|a| a.eq_ignore_ascii_case(value)) {
        Some(canonical) => {
            *value = (*canonical).to_string();
            Ok(())
        }
        None => Err(DagstepError::config(format!(
            "invalid {field} {value:?}; expected one of: {}",
            allowed.join(", ")
        ))),
    }
}
