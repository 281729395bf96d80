use regex::Regex;
use secrecy::SecretString;
use serde::{Serialize, Deserialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

pub const MAX_NAME_PREFIX_LEN: usize = 32;

/// Acquisition strategy for a Batch compute environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationStrategy {
    BestFit,
    BestFitProgressive,
    SpotCapacityOptimized,
    SpotPriceCapacityOptimized,
}

impl AllocationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationStrategy::BestFit => "BEST_FIT",
            AllocationStrategy::BestFitProgressive => "BEST_FIT_PROGRESSIVE",
            AllocationStrategy::SpotCapacityOptimized => "SPOT_CAPACITY_OPTIMIZED",
            AllocationStrategy::SpotPriceCapacityOptimized => "SPOT_PRICE_CAPACITY_OPTIMIZED",
        }
    }

    pub fn is_spot_oriented(self) -> bool {
        matches!(
            self,
            AllocationStrategy::SpotCapacityOptimized | AllocationStrategy::SpotPriceCapacityOptimized
        )
    }
}

/// The full input document for one compilation. Parsed once, validated, then
/// treated as immutable.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    pub name_prefix: String,
    pub region: String,
    #[serde(default)]
    pub profile: Option<String>,

    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,

    pub work_bucket_name: String,
    #[serde(default = "default_work_dir")]
    pub work_dir_path: String,
    #[serde(default)]
    pub additional_bucket_arns: Vec<String>,

    #[serde(default)]
    pub head_min_vcpus: i64,
    #[serde(default = "default_head_max_vcpus")]
    pub head_max_vcpus: i64,
    #[serde(default)]
    pub compute_min_vcpus: i64,
    #[serde(default = "default_compute_max_vcpus")]
    pub compute_max_vcpus: i64,
    #[serde(default = "default_instance_types")]
    pub instance_types: BTreeSet<String>,
    #[serde(default)]
    pub ami_id: Option<String>,
    #[serde(default)]
    pub ec2_key_pair: Option<String>,

    #[serde(default)]
    pub use_spot_instances: bool,
    #[serde(default = "default_spot_bid_percentage")]
    pub spot_bid_percentage: i64,
    #[serde(default = "default_allocation_strategy")]
    pub allocation_strategy: AllocationStrategy,

    pub platform_server_url: String,
    pub platform_access_token: SecretString,
    pub platform_workspace_id: i64,
    #[serde(default)]
    pub platform_credentials_name: Option<String>,
    #[serde(default)]
    pub platform_env_name: Option<String>,
    #[serde(default)]
    pub platform_env_description: Option<String>,

    #[serde(default)]
    pub head_job_cpus: Option<i64>,
    #[serde(default)]
    pub head_job_memory_mb: Option<i64>,
    #[serde(default)]
    pub enable_wave: bool,
    #[serde(default)]
    pub enable_fusion: bool,
    #[serde(default)]
    pub pre_run_script: Option<String>,
    #[serde(default)]
    pub post_run_script: Option<String>,
    #[serde(default)]
    pub extra_config: Option<String>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_work_dir() -> String { "work".to_string() }
fn default_head_max_vcpus() -> i64 { 128 }
fn default_compute_max_vcpus() -> i64 { 256 }
fn default_spot_bid_percentage() -> i64 { 100 }
fn default_allocation_strategy() -> AllocationStrategy { AllocationStrategy::BestFitProgressive }
fn default_instance_types() -> BTreeSet<String> {
    ["c6id", "m6id", "r6id"].iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self { field, reason: reason.into() }
    }
}

/// Every violated invariant of one input document.
#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} invalid input field(s):", self.0.len())?;
        for e in &self.0 {
            writeln!(f, "  - {e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Check every invariant and report all violations together. The checks are
/// independent; none short-circuits another.
pub fn validate(cfg: &InputConfig) -> Result<(), ValidationErrors> {
    let mut errs = Vec::new();

    let prefix_re = Regex::new(r"^[a-z0-9-]+$").unwrap();
    if !prefix_re.is_match(&cfg.name_prefix) {
        errs.push(ValidationError::new(
            "name_prefix",
            format!("'{}' must be non-empty lowercase alphanumeric or '-'", cfg.name_prefix),
        ));
    }
    if cfg.name_prefix.len() > MAX_NAME_PREFIX_LEN {
        errs.push(ValidationError::new(
            "name_prefix",
            format!("{} chars exceeds the {MAX_NAME_PREFIX_LEN}-char limit", cfg.name_prefix.len()),
        ));
    }

    let scheme_re = Regex::new(r"^[a-z][a-z0-9+.-]*://").unwrap();
    if scheme_re.is_match(&cfg.work_bucket_name) {
        errs.push(ValidationError::new(
            "work_bucket_name",
            format!("'{}' must be a bare bucket name without a URI scheme", cfg.work_bucket_name),
        ));
    }

    if cfg.subnet_ids.is_empty() {
        errs.push(ValidationError::new("subnet_ids", "at least one subnet is required"));
    }
    if cfg.security_group_ids.is_empty() {
        errs.push(ValidationError::new("security_group_ids", "at least one security group is required"));
    }

    if !(1..=100).contains(&cfg.spot_bid_percentage) {
        errs.push(ValidationError::new(
            "spot_bid_percentage",
            format!("{} is outside 1..=100", cfg.spot_bid_percentage),
        ));
    }

    if cfg.head_min_vcpus > cfg.head_max_vcpus {
        errs.push(ValidationError::new(
            "head_min_vcpus",
            format!("min {} exceeds max {}", cfg.head_min_vcpus, cfg.head_max_vcpus),
        ));
    }
    if cfg.compute_min_vcpus > cfg.compute_max_vcpus {
        errs.push(ValidationError::new(
            "compute_min_vcpus",
            format!("min {} exceeds max {}", cfg.compute_min_vcpus, cfg.compute_max_vcpus),
        ));
    }

    if cfg.enable_fusion && !cfg.enable_wave {
        errs.push(ValidationError::new(
            "enable_fusion",
            "the Fusion file system requires Wave (set enable_wave: true)",
        ));
    }

    if errs.is_empty() { Ok(()) } else { Err(ValidationErrors(errs)) }
}

/// Everything computed from the input: names, URIs, ARNs, the effective
/// allocation strategy and the merged tag set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivedNames {
    pub head_env_name: String,
    pub compute_env_name: String,
    pub head_queue_name: String,
    pub compute_queue_name: String,
    pub launch_template_name: String,
    pub work_dir_uri: String,
    pub work_bucket_arn: String,
    pub bucket_arns: Vec<String>,
    pub credentials_name: String,
    pub env_name: String,
    pub effective_allocation_strategy: AllocationStrategy,
    pub tags: BTreeMap<String, String>,
}

/// An On-Demand-oriented strategy is never handed to a Spot fleet; anything
/// but the two Spot strategies falls back to SPOT_CAPACITY_OPTIMIZED. With
/// Spot disabled the requested strategy passes through verbatim, Spot-oriented
/// values included.
pub fn effective_allocation_strategy(use_spot: bool, requested: AllocationStrategy) -> AllocationStrategy {
    if use_spot && !requested.is_spot_oriented() {
        AllocationStrategy::SpotCapacityOptimized
    } else {
        requested
    }
}

/// Reserved tag keys win over user-supplied values.
pub fn merge_tags(cfg: &InputConfig) -> BTreeMap<String, String> {
    let mut tags = cfg.tags.clone();
    tags.insert("ManagedBy".to_string(), "terraform".to_string());
    tags.insert("Module".to_string(), "batchforge".to_string());
    tags.insert("Name".to_string(), cfg.name_prefix.clone());
    tags
}

/// Total for validated input; pure string and list composition.
pub fn derive(cfg: &InputConfig) -> DerivedNames {
    let p = &cfg.name_prefix;
    let work_bucket_arn = format!("arn:aws:s3:::{}", cfg.work_bucket_name);
    let mut bucket_arns = vec![work_bucket_arn.clone()];
    bucket_arns.extend(cfg.additional_bucket_arns.iter().cloned());
    DerivedNames {
        head_env_name: format!("{p}-head"),
        compute_env_name: format!("{p}-compute"),
        head_queue_name: format!("{p}-head-queue"),
        compute_queue_name: format!("{p}-compute-queue"),
        launch_template_name: format!("{p}-launch-template"),
        work_dir_uri: format!("s3://{}/{}", cfg.work_bucket_name, cfg.work_dir_path),
        work_bucket_arn,
        bucket_arns,
        credentials_name: cfg
            .platform_credentials_name
            .clone()
            .unwrap_or_else(|| format!("{p}-aws-credentials")),
        env_name: cfg.platform_env_name.clone().unwrap_or_else(|| p.clone()),
        effective_allocation_strategy: effective_allocation_strategy(
            cfg.use_spot_instances,
            cfg.allocation_strategy,
        ),
        tags: merge_tags(cfg),
    }
}
