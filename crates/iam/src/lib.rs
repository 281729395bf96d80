use serde::Serialize;

use batchforge_config::{DerivedNames, InputConfig};

pub const POLICY_VERSION: &str = "2012-10-17";

/// Log group the Batch jobs write to; both the create/put grant and the head
/// job's read grant are scoped to it.
pub const BATCH_LOG_GROUP_PATTERN: &str = "arn:aws:logs:*:*:log-group:/aws/batch/*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    #[serde(rename = "Service")]
    pub service: String,
}

/// One IAM statement. `resources` may legally be empty ("no access"); the
/// `Resource` key is omitted from the JSON in that case, as it is for trust
/// statements which carry a principal instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statement {
    #[serde(rename = "Sid", skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(rename = "Effect")]
    pub effect: Effect,
    #[serde(rename = "Principal", skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    #[serde(rename = "Action")]
    pub actions: Vec<String>,
    #[serde(rename = "Resource", skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

impl Statement {
    pub fn allow(sid: &str, actions: &[&str], resources: Vec<String>) -> Self {
        Self {
            sid: Some(sid.to_string()),
            effect: Effect::Allow,
            principal: None,
            actions: actions.iter().map(|a| a.to_string()).collect(),
            resources,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDocument {
    #[serde(rename = "Version")]
    pub version: &'static str,
    #[serde(rename = "Statement")]
    pub statements: Vec<Statement>,
}

impl PolicyDocument {
    pub fn new(statements: Vec<Statement>) -> Self {
        Self { version: POLICY_VERSION, statements }
    }

    /// Trust document allowing one AWS service to assume the role.
    pub fn service_trust(service: &str) -> Self {
        Self::new(vec![Statement {
            sid: None,
            effect: Effect::Allow,
            principal: Some(Principal { service: service.to_string() }),
            actions: vec!["sts:AssumeRole".to_string()],
            resources: Vec::new(),
        }])
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap()
    }
}

/// Every role the stack creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoleKind {
    BatchService,
    SpotFleet,
    Instance,
    TaskExecution,
    TaskRun,
    Head,
}

impl RoleKind {
    pub fn suffix(self) -> &'static str {
        match self {
            RoleKind::BatchService => "batch-service-role",
            RoleKind::SpotFleet => "spot-fleet-role",
            RoleKind::Instance => "instance-role",
            RoleKind::TaskExecution => "execution-role",
            RoleKind::TaskRun => "task-role",
            RoleKind::Head => "head-role",
        }
    }

    pub fn role_name(self, prefix: &str) -> String {
        format!("{prefix}-{}", self.suffix())
    }

    /// Compile-time ARN for PassRole resource lists. The account id is not
    /// known at compile time, so the account field is wildcarded while the
    /// role name stays explicit.
    pub fn role_arn(self, prefix: &str) -> String {
        format!("arn:aws:iam::*:role/{}", self.role_name(prefix))
    }

    pub fn trust_service(self) -> &'static str {
        match self {
            RoleKind::BatchService => "batch.amazonaws.com",
            RoleKind::SpotFleet => "spotfleet.amazonaws.com",
            RoleKind::Instance => "ec2.amazonaws.com",
            RoleKind::TaskExecution | RoleKind::TaskRun | RoleKind::Head => "ecs-tasks.amazonaws.com",
        }
    }

    pub fn managed_policy_arns(self) -> Vec<String> {
        let arns: &[&str] = match self {
            RoleKind::BatchService => &["arn:aws:iam::aws:policy/service-role/AWSBatchServiceRole"],
            RoleKind::SpotFleet => &["arn:aws:iam::aws:policy/service-role/AmazonEC2SpotFleetTaggingRole"],
            RoleKind::Instance => &["arn:aws:iam::aws:policy/service-role/AmazonEC2ContainerServiceforEC2Role"],
            RoleKind::TaskExecution => &["arn:aws:iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy"],
            RoleKind::TaskRun | RoleKind::Head => &[],
        };
        arns.iter().map(|a| a.to_string()).collect()
    }
}

/// The identities the head job may hand to the orchestration service. The
/// head policy and the pass-role policy are both derived from this list so
/// they cannot drift apart.
pub const DELEGATED_ROLES: [RoleKind; 2] = [RoleKind::TaskRun, RoleKind::TaskExecution];

/// Identities the platform user may pass: the head role plus everything the
/// head itself delegates.
pub fn pass_role_targets() -> Vec<RoleKind> {
    let mut v = vec![RoleKind::Head];
    v.extend(DELEGATED_ROLES);
    v
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySet {
    pub job: PolicyDocument,
    pub head: PolicyDocument,
    pub pass_role: PolicyDocument,
}

pub fn build_policies(cfg: &InputConfig, names: &DerivedNames) -> PolicySet {
    PolicySet {
        job: job_policy(names),
        head: head_policy(cfg, names),
        pass_role: pass_role_policy(cfg),
    }
}

/// Work-bucket access plus log writing. Attached by reference to the
/// instance, task-execution, task-run and head roles.
fn job_policy(names: &DerivedNames) -> PolicyDocument {
    let object_arns: Vec<String> = names.bucket_arns.iter().map(|a| format!("{a}/*")).collect();
    PolicyDocument::new(vec![
        Statement::allow(
            "BucketAccess",
            &["s3:ListBucket", "s3:GetBucketLocation"],
            names.bucket_arns.clone(),
        ),
        Statement::allow(
            "ObjectAccess",
            &["s3:GetObject", "s3:PutObject", "s3:DeleteObject"],
            object_arns,
        ),
        Statement::allow(
            "BatchLogs",
            &["logs:CreateLogStream", "logs:PutLogEvents"],
            vec![BATCH_LOG_GROUP_PATTERN.to_string()],
        ),
    ])
}

/// Superset for the workflow head job: submit/inspect/cancel work, read
/// cluster state and logs, read deployment secrets, and hand the two
/// downstream identities to ECS. The PassRole resource list names the
/// delegated roles explicitly, never a wildcard.
fn head_policy(cfg: &InputConfig, _names: &DerivedNames) -> PolicyDocument {
    let p = &cfg.name_prefix;
    PolicyDocument::new(vec![
        Statement::allow(
            "WorkflowControl",
            &[
                "batch:SubmitJob",
                "batch:DescribeJobs",
                "batch:CancelJob",
                "batch:TerminateJob",
                "batch:ListJobs",
                "batch:DescribeJobQueues",
                "batch:DescribeComputeEnvironments",
                "batch:RegisterJobDefinition",
                "batch:DescribeJobDefinitions",
            ],
            vec!["*".to_string()],
        ),
        Statement::allow(
            "ClusterIntrospection",
            &[
                "ecs:DescribeTasks",
                "ecs:DescribeContainerInstances",
                "ec2:DescribeInstances",
                "ec2:DescribeInstanceTypes",
                "ec2:DescribeInstanceAttribute",
                "ec2:DescribeInstanceStatus",
            ],
            vec!["*".to_string()],
        ),
        Statement::allow(
            "LogRetrieval",
            &["logs:GetLogEvents", "logs:DescribeLogStreams"],
            vec![BATCH_LOG_GROUP_PATTERN.to_string()],
        ),
        Statement::allow(
            "SecretRead",
            &["secretsmanager:GetSecretValue"],
            vec![format!("arn:aws:secretsmanager:*:*:secret:{p}/*")],
        ),
        Statement::allow(
            "SecretDecrypt",
            &["kms:Decrypt", "kms:DescribeKey"],
            vec!["*".to_string()],
        ),
        Statement::allow(
            "DelegateRoles",
            &["iam:PassRole"],
            DELEGATED_ROLES.iter().map(|r| r.role_arn(p)).collect(),
        ),
    ])
}

/// Granted to the platform user so it can launch the head job with the three
/// stack roles.
fn pass_role_policy(cfg: &InputConfig) -> PolicyDocument {
    PolicyDocument::new(vec![Statement::allow(
        "PassStackRoles",
        &["iam:PassRole"],
        pass_role_targets().iter().map(|r| r.role_arn(&cfg.name_prefix)).collect(),
    )])
}

/// A role ready for wiring: trust document, managed policy attachments and
/// named inline documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSpec {
    pub kind: RoleKind,
    pub name: String,
    pub trust: PolicyDocument,
    pub managed_policy_arns: Vec<String>,
    pub inline: Vec<(String, PolicyDocument)>,
}

impl RoleSpec {
    fn new(kind: RoleKind, prefix: &str, inline: Vec<(String, PolicyDocument)>) -> Self {
        Self {
            kind,
            name: kind.role_name(prefix),
            trust: PolicyDocument::service_trust(kind.trust_service()),
            managed_policy_arns: kind.managed_policy_arns(),
            inline,
        }
    }
}

/// Every role in the stack. The Spot fleet role only exists when Spot
/// instances are requested, so it is an `Option`, not an empty slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleCatalog {
    pub batch_service: RoleSpec,
    pub spot_fleet: Option<RoleSpec>,
    pub instance: RoleSpec,
    pub execution: RoleSpec,
    pub task: RoleSpec,
    pub head: RoleSpec,
}

impl RoleCatalog {
    pub fn build(cfg: &InputConfig, policies: &PolicySet) -> Self {
        let p = &cfg.name_prefix;
        let job = |name: &str| (format!("{p}-{name}"), policies.job.clone());
        Self {
            batch_service: RoleSpec::new(RoleKind::BatchService, p, Vec::new()),
            spot_fleet: cfg
                .use_spot_instances
                .then(|| RoleSpec::new(RoleKind::SpotFleet, p, Vec::new())),
            instance: RoleSpec::new(RoleKind::Instance, p, vec![job("job-policy")]),
            execution: RoleSpec::new(RoleKind::TaskExecution, p, vec![job("job-policy")]),
            task: RoleSpec::new(RoleKind::TaskRun, p, vec![job("job-policy")]),
            head: RoleSpec::new(
                RoleKind::Head,
                p,
                vec![
                    (format!("{p}-head-policy"), policies.head.clone()),
                    job("job-policy"),
                ],
            ),
        }
    }

    pub fn all(&self) -> Vec<&RoleSpec> {
        let mut v = vec![&self.batch_service];
        if let Some(sf) = &self.spot_fleet {
            v.push(sf);
        }
        v.extend([&self.instance, &self.execution, &self.task, &self.head]);
        v
    }
}
