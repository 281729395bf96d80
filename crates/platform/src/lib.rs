use serde_json::{json, Value as Json};

use batchforge_config::{DerivedNames, InputConfig};

/// References to the three stack roles and the programmatic key pair,
/// resolved by the provisioning engine once the infrastructure exists. The
/// compiler only ever handles the symbolic form.
#[derive(Debug, Clone)]
pub struct StackRefs {
    pub head_role: String,
    pub task_role: String,
    pub execution_role: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Body for the credential-registration call. The platform access token
/// authenticates the call itself and never appears in any payload.
#[derive(Debug, Clone)]
pub struct CredentialsRequest {
    pub name: String,
    pub workspace_id: i64,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl CredentialsRequest {
    pub fn from_config(cfg: &InputConfig, names: &DerivedNames, refs: &StackRefs) -> Self {
        Self {
            name: names.credentials_name.clone(),
            workspace_id: cfg.platform_workspace_id,
            access_key_id: refs.access_key_id.clone(),
            secret_access_key: refs.secret_access_key.clone(),
        }
    }

    pub fn to_json(&self) -> Json {
        json!({
            "credentials": {
                "name": self.name,
                "provider": "aws",
                "keys": {
                    "accessKey": self.access_key_id,
                    "secretKey": self.secret_access_key,
                }
            },
            "workspaceId": self.workspace_id,
        })
    }
}

/// Body for the compute-environment registration call. There is no
/// auto-provision section: its absence is what tells the platform to use the
/// pre-built queues instead of forging its own.
#[derive(Debug, Clone)]
pub struct ComputeEnvRequest {
    pub name: String,
    pub description: Option<String>,
    pub region: String,
    pub work_dir: String,
    pub head_queue: String,
    pub compute_queue: String,
    pub head_role: String,
    pub task_role: String,
    pub execution_role: String,
    pub head_job_cpus: Option<i64>,
    pub head_job_memory_mb: Option<i64>,
    pub wave_enabled: bool,
    pub fusion_enabled: bool,
    pub pre_run_script: Option<String>,
    pub post_run_script: Option<String>,
    pub nextflow_config: Option<String>,
}

impl ComputeEnvRequest {
    pub fn from_config(cfg: &InputConfig, names: &DerivedNames, refs: &StackRefs) -> Self {
        Self {
            name: names.env_name.clone(),
            description: cfg.platform_env_description.clone(),
            region: cfg.region.clone(),
            work_dir: names.work_dir_uri.clone(),
            head_queue: names.head_queue_name.clone(),
            compute_queue: names.compute_queue_name.clone(),
            head_role: refs.head_role.clone(),
            task_role: refs.task_role.clone(),
            execution_role: refs.execution_role.clone(),
            head_job_cpus: cfg.head_job_cpus,
            head_job_memory_mb: cfg.head_job_memory_mb,
            wave_enabled: cfg.enable_wave,
            fusion_enabled: cfg.enable_fusion,
            pre_run_script: cfg.pre_run_script.clone(),
            post_run_script: cfg.post_run_script.clone(),
            nextflow_config: cfg.extra_config.clone(),
        }
    }

    /// `credentials_id` is the opaque identifier returned by the credential
    /// call; the provisioning engine fills it in before posting.
    pub fn to_json(&self, credentials_id: Option<&str>) -> Json {
        let mut config = json!({
            "region": self.region,
            "workDir": self.work_dir,
            "headQueue": self.head_queue,
            "computeQueue": self.compute_queue,
            "headJobRole": self.head_role,
            "computeJobRole": self.task_role,
            "executionRole": self.execution_role,
            "waveEnabled": self.wave_enabled,
            "fusion2Enabled": self.fusion_enabled,
        });
        if let Some(v) = self.head_job_cpus { config["headJobCpus"] = json!(v); }
        if let Some(v) = self.head_job_memory_mb { config["headJobMemoryMb"] = json!(v); }
        if let Some(v) = &self.pre_run_script { config["preRunScript"] = json!(v); }
        if let Some(v) = &self.post_run_script { config["postRunScript"] = json!(v); }
        if let Some(v) = &self.nextflow_config { config["nextflowConfig"] = json!(v); }

        let mut env = json!({
            "name": self.name,
            "platform": "aws-batch",
            "credentialsId": credentials_id,
            "config": config,
        });
        if let Some(d) = &self.description { env["description"] = json!(d); }
        json!({ "computeEnv": env })
    }
}

/// The whole registration bundle the provisioning engine needs, in call
/// order: credentials first, then the compute environment referencing them.
pub fn registration(cfg: &InputConfig, names: &DerivedNames, refs: &StackRefs) -> Json {
    json!({
        "serverUrl": cfg.platform_server_url,
        "workspaceId": cfg.platform_workspace_id,
        "credentials": CredentialsRequest::from_config(cfg, names, refs).to_json(),
        "computeEnv": ComputeEnvRequest::from_config(cfg, names, refs).to_json(None),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchforge_config::derive;

    fn sample() -> InputConfig {
        serde_yaml::from_str(
            r#"
name_prefix: nf-dev
region: eu-west-1
subnet_ids: [subnet-aaa]
security_group_ids: [sg-ccc]
work_bucket_name: nf-dev-work
platform_server_url: https://api.cloud.seqera.io
platform_access_token: tower-token-secret
platform_workspace_id: 12345
head_job_cpus: 4
head_job_memory_mb: 8192
enable_wave: true
pre_run_script: "echo start"
"#,
        )
        .unwrap()
    }

    fn refs() -> StackRefs {
        StackRefs {
            head_role: "${aws_iam_role.head.arn}".to_string(),
            task_role: "${aws_iam_role.task.arn}".to_string(),
            execution_role: "${aws_iam_role.execution.arn}".to_string(),
            access_key_id: "${aws_iam_access_key.platform.id}".to_string(),
            secret_access_key: "${aws_iam_access_key.platform.secret}".to_string(),
        }
    }

    #[test]
    fn compute_env_request_uses_the_prebuilt_queues() {
        let cfg = sample();
        let names = derive(&cfg);
        let json = ComputeEnvRequest::from_config(&cfg, &names, &refs()).to_json(Some("cred-1"));
        let env = &json["computeEnv"];
        assert_eq!(env["platform"], "aws-batch");
        assert_eq!(env["credentialsId"], "cred-1");
        let config = &env["config"];
        assert_eq!(config["headQueue"], "nf-dev-head-queue");
        assert_eq!(config["computeQueue"], "nf-dev-compute-queue");
        assert_eq!(config["workDir"], "s3://nf-dev-work/work");
        assert_eq!(config["headJobRole"], "${aws_iam_role.head.arn}");
        assert_eq!(config["computeJobRole"], "${aws_iam_role.task.arn}");
        assert_eq!(config["executionRole"], "${aws_iam_role.execution.arn}");
        assert_eq!(config["headJobCpus"], 4);
        assert_eq!(config["headJobMemoryMb"], 8192);
        assert_eq!(config["waveEnabled"], true);
        assert_eq!(config["fusion2Enabled"], false);
        assert_eq!(config["preRunScript"], "echo start");
        assert!(config.get("postRunScript").is_none());
        assert!(config.get("nextflowConfig").is_none());
    }

    #[test]
    fn no_auto_provision_section_is_ever_emitted() {
        let cfg = sample();
        let names = derive(&cfg);
        let json = ComputeEnvRequest::from_config(&cfg, &names, &refs()).to_json(None);
        assert!(json["computeEnv"]["config"].get("forge").is_none());
        assert!(json["computeEnv"].get("forge").is_none());
        assert_eq!(json["computeEnv"]["credentialsId"], Json::Null);
    }

    #[test]
    fn credentials_request_names_fall_back_to_the_prefix() {
        let cfg = sample();
        let names = derive(&cfg);
        let json = CredentialsRequest::from_config(&cfg, &names, &refs()).to_json();
        assert_eq!(json["credentials"]["name"], "nf-dev-aws-credentials");
        assert_eq!(json["credentials"]["provider"], "aws");
        assert_eq!(json["credentials"]["keys"]["accessKey"], "${aws_iam_access_key.platform.id}");
        assert_eq!(json["workspaceId"], 12345);
    }

    #[test]
    fn the_access_token_never_enters_a_payload() {
        let cfg = sample();
        let names = derive(&cfg);
        let bundle = registration(&cfg, &names, &refs()).to_string();
        assert!(!bundle.contains("tower-token-secret"));
        assert!(bundle.contains("https://api.cloud.seqera.io"));
    }

    #[test]
    fn registration_bundle_is_deterministic() {
        let cfg = sample();
        let names = derive(&cfg);
        let a = registration(&cfg, &names, &refs()).to_string();
        let b = registration(&cfg, &names, &refs()).to_string();
        assert_eq!(a, b);
    }
}
