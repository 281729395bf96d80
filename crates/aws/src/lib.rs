use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;

use batchforge_bootstrap as bootstrap;
use batchforge_config::{AllocationStrategy, DerivedNames, InputConfig};
use batchforge_core::{ResourceId, ResourceSpec};
use batchforge_iam::{PolicyDocument, PolicySet, RoleCatalog, RoleKind, RoleSpec};

/// Batch queue priorities: the head queue must drain before the workers.
pub const HEAD_QUEUE_PRIORITY: i64 = 10;
pub const COMPUTE_QUEUE_PRIORITY: i64 = 1;

/// The head environment always runs On-Demand; the workflow driver is never
/// placed on reclaimable capacity.
pub const HEAD_ALLOCATION_STRATEGY: AllocationStrategy = AllocationStrategy::BestFitProgressive;

#[derive(Debug, Clone)]
pub struct AwsProvider {
    pub region: String,
    pub profile: Option<String>,
}

impl AwsProvider {
    pub fn from_config(cfg: &InputConfig) -> Self {
        Self { region: cfg.region.clone(), profile: cfg.profile.clone() }
    }

    pub fn to_tf_json(&self) -> Json {
        let mut body = json!({ "region": self.region });
        if let Some(p) = &self.profile { body["profile"] = json!(p); }
        json!({ "provider": { "aws": body } })
    }
}

fn role_arn_ref(tf: &str) -> String { format!("${{aws_iam_role.{tf}.arn}}") }
fn role_id_ref(tf: &str) -> String { format!("${{aws_iam_role.{tf}.id}}") }
fn profile_arn_ref(tf: &str) -> String { format!("${{aws_iam_instance_profile.{tf}.arn}}") }
fn user_name_ref(tf: &str) -> String { format!("${{aws_iam_user.{tf}.name}}") }
fn env_arn_ref(tf: &str) -> String { format!("${{aws_batch_compute_environment.{tf}.arn}}") }
fn launch_template_id_ref(tf: &str) -> String { format!("${{aws_launch_template.{tf}.id}}") }

fn policy_string(doc: &PolicyDocument) -> String {
    serde_json::to_string(&doc.to_json()).unwrap()
}

#[derive(Debug, Clone)]
pub struct SpotOptions {
    pub bid_percentage: i64,
    pub fleet_role_tf: String,
}

#[derive(Debug, Clone)]
pub struct ComputeResources {
    pub spot: Option<SpotOptions>,
    pub allocation_strategy: AllocationStrategy,
    pub min_vcpus: i64,
    pub max_vcpus: i64,
    pub instance_types: Vec<String>,
    pub subnets: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub instance_profile_tf: String,
    pub launch_template_tf: String,
}

/// Everything the stack creates, each rendering its own tf.json fragment.
#[derive(Debug, Clone)]
pub enum AwsResource {
    IamRole {
        tf: String,
        name: String,
        trust: PolicyDocument,
        managed_policy_arns: Vec<String>,
        tags: BTreeMap<String, String>,
    },
    IamRolePolicy {
        tf: String,
        name: String,
        role_tf: String,
        policy: PolicyDocument,
    },
    InstanceProfile {
        tf: String,
        name: String,
        role_tf: String,
    },
    IamUser {
        tf: String,
        name: String,
        tags: BTreeMap<String, String>,
    },
    IamUserPolicy {
        tf: String,
        name: String,
        user_tf: String,
        policy: PolicyDocument,
    },
    IamAccessKey {
        tf: String,
        user_tf: String,
    },
    LaunchTemplate {
        tf: String,
        name: String,
        user_data: String,
        ami_id: Option<String>,
        key_name: Option<String>,
        tags: BTreeMap<String, String>,
    },
    ComputeEnvironment {
        tf: String,
        name: String,
        service_role_tf: String,
        resources: ComputeResources,
        tags: BTreeMap<String, String>,
    },
    JobQueue {
        tf: String,
        name: String,
        priority: i64,
        env_tf: String,
        tags: BTreeMap<String, String>,
    },
}

impl AwsResource {
    pub fn tf_type(&self) -> &'static str {
        match self {
            AwsResource::IamRole { .. } => "aws_iam_role",
            AwsResource::IamRolePolicy { .. } => "aws_iam_role_policy",
            AwsResource::InstanceProfile { .. } => "aws_iam_instance_profile",
            AwsResource::IamUser { .. } => "aws_iam_user",
            AwsResource::IamUserPolicy { .. } => "aws_iam_user_policy",
            AwsResource::IamAccessKey { .. } => "aws_iam_access_key",
            AwsResource::LaunchTemplate { .. } => "aws_launch_template",
            AwsResource::ComputeEnvironment { .. } => "aws_batch_compute_environment",
            AwsResource::JobQueue { .. } => "aws_batch_job_queue",
        }
    }

    pub fn tf_name(&self) -> &str {
        match self {
            AwsResource::IamRole { tf, .. }
            | AwsResource::IamRolePolicy { tf, .. }
            | AwsResource::InstanceProfile { tf, .. }
            | AwsResource::IamUser { tf, .. }
            | AwsResource::IamUserPolicy { tf, .. }
            | AwsResource::IamAccessKey { tf, .. }
            | AwsResource::LaunchTemplate { tf, .. }
            | AwsResource::ComputeEnvironment { tf, .. }
            | AwsResource::JobQueue { tf, .. } => tf,
        }
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.tf_type(), self.tf_name())
    }

    pub fn to_tf_json(&self) -> Json {
        let body = match self {
            AwsResource::IamRole { name, trust, managed_policy_arns, tags, .. } => {
                let mut o = json!({
                    "name": name,
                    "assume_role_policy": policy_string(trust),
                    "tags": tags,
                });
                if !managed_policy_arns.is_empty() {
                    o["managed_policy_arns"] = json!(managed_policy_arns);
                }
                o
            }
            AwsResource::IamRolePolicy { name, role_tf, policy, .. } => json!({
                "name": name,
                "role": role_id_ref(role_tf),
                "policy": policy_string(policy),
            }),
            AwsResource::InstanceProfile { name, role_tf, .. } => json!({
                "name": name,
                "role": format!("${{aws_iam_role.{role_tf}.name}}"),
            }),
            AwsResource::IamUser { name, tags, .. } => json!({
                "name": name,
                "tags": tags,
            }),
            AwsResource::IamUserPolicy { name, user_tf, policy, .. } => json!({
                "name": name,
                "user": user_name_ref(user_tf),
                "policy": policy_string(policy),
            }),
            AwsResource::IamAccessKey { user_tf, .. } => json!({
                "user": user_name_ref(user_tf),
            }),
            AwsResource::LaunchTemplate { name, user_data, ami_id, key_name, tags, .. } => {
                let mut o = json!({
                    "name": name,
                    "user_data": BASE64_STANDARD.encode(user_data),
                    "tags": tags,
                });
                if let Some(ami) = ami_id { o["image_id"] = json!(ami); }
                if let Some(key) = key_name { o["key_name"] = json!(key); }
                o
            }
            AwsResource::ComputeEnvironment { name, service_role_tf, resources, tags, .. } => {
                let r = resources;
                let mut cr = json!({
                    "type": if r.spot.is_some() { "SPOT" } else { "EC2" },
                    "allocation_strategy": r.allocation_strategy.as_str(),
                    "min_vcpus": r.min_vcpus,
                    "max_vcpus": r.max_vcpus,
                    "instance_type": r.instance_types,
                    "subnets": r.subnets,
                    "security_group_ids": r.security_group_ids,
                    "instance_role": profile_arn_ref(&r.instance_profile_tf),
                    "launch_template": { "launch_template_id": launch_template_id_ref(&r.launch_template_tf) },
                    "tags": tags,
                });
                if let Some(spot) = &r.spot {
                    cr["bid_percentage"] = json!(spot.bid_percentage);
                    cr["spot_iam_fleet_role"] = json!(role_arn_ref(&spot.fleet_role_tf));
                }
                json!({
                    "compute_environment_name": name,
                    "type": "MANAGED",
                    "service_role": role_arn_ref(service_role_tf),
                    "compute_resources": cr,
                    "tags": tags,
                })
            }
            AwsResource::JobQueue { name, priority, env_tf, tags, .. } => json!({
                "name": name,
                "state": "ENABLED",
                "priority": priority,
                "compute_environments": [env_arn_ref(env_tf)],
                "tags": tags,
            }),
        };
        json!({ "resource": { self.tf_type(): { self.tf_name(): body } } })
    }
}

/// Symbolic references for the platform registration payloads, pointing at
/// the resources this crate names. Resolved by the provisioning engine after
/// apply.
pub fn stack_refs() -> batchforge_platform::StackRefs {
    batchforge_platform::StackRefs {
        head_role: role_arn_ref(role_tf_name(RoleKind::Head)),
        task_role: role_arn_ref(role_tf_name(RoleKind::TaskRun)),
        execution_role: role_arn_ref(role_tf_name(RoleKind::TaskExecution)),
        access_key_id: "${aws_iam_access_key.platform.id}".to_string(),
        secret_access_key: "${aws_iam_access_key.platform.secret}".to_string(),
    }
}

fn role_tf_name(kind: RoleKind) -> &'static str {
    match kind {
        RoleKind::BatchService => "batch_service",
        RoleKind::SpotFleet => "spot_fleet",
        RoleKind::Instance => "instance",
        RoleKind::TaskExecution => "execution",
        RoleKind::TaskRun => "task",
        RoleKind::Head => "head",
    }
}

fn role_resources(spec: &RoleSpec, tags: &BTreeMap<String, String>) -> Vec<AwsResource> {
    let tf = role_tf_name(spec.kind).to_string();
    let mut out = vec![AwsResource::IamRole {
        tf: tf.clone(),
        name: spec.name.clone(),
        trust: spec.trust.clone(),
        managed_policy_arns: spec.managed_policy_arns.clone(),
        tags: tags.clone(),
    }];
    for (i, (policy_name, doc)) in spec.inline.iter().enumerate() {
        out.push(AwsResource::IamRolePolicy {
            tf: format!("{tf}_{i}"),
            name: policy_name.clone(),
            role_tf: tf.clone(),
            policy: doc.clone(),
        });
    }
    out
}

/// The whole stack in declaration order: identities first, then the boot
/// template, then compute fleets, then the queues that route into them.
pub fn stack(cfg: &InputConfig, names: &DerivedNames, policies: &PolicySet) -> Vec<AwsResource> {
    let catalog = RoleCatalog::build(cfg, policies);
    let tags = &names.tags;
    let p = &cfg.name_prefix;

    let mut out = Vec::new();
    for role in catalog.all() {
        out.extend(role_resources(role, tags));
    }
    out.push(AwsResource::InstanceProfile {
        tf: "instance".to_string(),
        name: format!("{p}-instance-profile"),
        role_tf: role_tf_name(RoleKind::Instance).to_string(),
    });

    out.push(AwsResource::IamUser {
        tf: "platform".to_string(),
        name: format!("{p}-platform-user"),
        tags: tags.clone(),
    });
    out.push(AwsResource::IamUserPolicy {
        tf: "platform_pass_role".to_string(),
        name: format!("{p}-pass-role-policy"),
        user_tf: "platform".to_string(),
        policy: policies.pass_role.clone(),
    });
    out.push(AwsResource::IamUserPolicy {
        tf: "platform_head".to_string(),
        name: format!("{p}-head-policy"),
        user_tf: "platform".to_string(),
        policy: policies.head.clone(),
    });
    out.push(AwsResource::IamAccessKey {
        tf: "platform".to_string(),
        user_tf: "platform".to_string(),
    });

    out.push(AwsResource::LaunchTemplate {
        tf: "main".to_string(),
        name: names.launch_template_name.clone(),
        user_data: bootstrap::select(cfg),
        ami_id: cfg.ami_id.clone(),
        key_name: cfg.ec2_key_pair.clone(),
        tags: tags.clone(),
    });

    let instance_types: Vec<String> = cfg.instance_types.iter().cloned().collect();
    let base = |spot: Option<SpotOptions>, strategy, min, max| ComputeResources {
        spot,
        allocation_strategy: strategy,
        min_vcpus: min,
        max_vcpus: max,
        instance_types: instance_types.clone(),
        subnets: cfg.subnet_ids.clone(),
        security_group_ids: cfg.security_group_ids.clone(),
        instance_profile_tf: "instance".to_string(),
        launch_template_tf: "main".to_string(),
    };

    out.push(AwsResource::ComputeEnvironment {
        tf: "head".to_string(),
        name: names.head_env_name.clone(),
        service_role_tf: role_tf_name(RoleKind::BatchService).to_string(),
        resources: base(None, HEAD_ALLOCATION_STRATEGY, cfg.head_min_vcpus, cfg.head_max_vcpus),
        tags: tags.clone(),
    });

    let spot = cfg.use_spot_instances.then(|| SpotOptions {
        bid_percentage: cfg.spot_bid_percentage,
        fleet_role_tf: role_tf_name(RoleKind::SpotFleet).to_string(),
    });
    out.push(AwsResource::ComputeEnvironment {
        tf: "compute".to_string(),
        name: names.compute_env_name.clone(),
        service_role_tf: role_tf_name(RoleKind::BatchService).to_string(),
        resources: base(
            spot,
            names.effective_allocation_strategy,
            cfg.compute_min_vcpus,
            cfg.compute_max_vcpus,
        ),
        tags: tags.clone(),
    });

    out.push(AwsResource::JobQueue {
        tf: "head".to_string(),
        name: names.head_queue_name.clone(),
        priority: HEAD_QUEUE_PRIORITY,
        env_tf: "head".to_string(),
        tags: tags.clone(),
    });
    out.push(AwsResource::JobQueue {
        tf: "compute".to_string(),
        name: names.compute_queue_name.clone(),
        priority: COMPUTE_QUEUE_PRIORITY,
        env_tf: "compute".to_string(),
        tags: tags.clone(),
    });

    out
}

/// The same stack as dependency-annotated plan nodes for the external
/// provisioning engine.
pub fn plan(cfg: &InputConfig, names: &DerivedNames, policies: &PolicySet) -> Vec<ResourceSpec> {
    let resources = stack(cfg, names, policies);
    resources
        .iter()
        .map(|r| {
            let mut spec = ResourceSpec::new(r.id(), r.to_tf_json());
            for dep in dependencies(r) {
                spec = spec.after(&dep);
            }
            spec
        })
        .collect()
}

fn dependencies(r: &AwsResource) -> Vec<ResourceId> {
    match r {
        AwsResource::IamRole { .. } | AwsResource::IamUser { .. } | AwsResource::LaunchTemplate { .. } => Vec::new(),
        AwsResource::IamRolePolicy { role_tf, .. } | AwsResource::InstanceProfile { role_tf, .. } => {
            vec![ResourceId::new("aws_iam_role", role_tf)]
        }
        AwsResource::IamUserPolicy { user_tf, .. } | AwsResource::IamAccessKey { user_tf, .. } => {
            vec![ResourceId::new("aws_iam_user", user_tf)]
        }
        AwsResource::ComputeEnvironment { service_role_tf, resources, .. } => {
            let mut deps = vec![
                ResourceId::new("aws_iam_role", service_role_tf),
                ResourceId::new("aws_iam_instance_profile", &resources.instance_profile_tf),
                ResourceId::new("aws_launch_template", &resources.launch_template_tf),
            ];
            if let Some(spot) = &resources.spot {
                deps.push(ResourceId::new("aws_iam_role", &spot.fleet_role_tf));
            }
            deps
        }
        AwsResource::JobQueue { env_tf, .. } => {
            vec![ResourceId::new("aws_batch_compute_environment", env_tf)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchforge_config::derive;
    use batchforge_iam::build_policies;

    fn sample(spot: bool) -> InputConfig {
        let yaml = format!(
            r#"
name_prefix: nf-dev
region: eu-west-1
subnet_ids: [subnet-aaa, subnet-bbb]
security_group_ids: [sg-ccc]
work_bucket_name: nf-dev-work
use_spot_instances: {spot}
allocation_strategy: BEST_FIT
platform_server_url: https://api.cloud.seqera.io
platform_access_token: tower-token
platform_workspace_id: 12345
"#
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn compiled(spot: bool) -> (InputConfig, Vec<AwsResource>) {
        let cfg = sample(spot);
        let names = derive(&cfg);
        let policies = build_policies(&cfg, &names);
        let resources = stack(&cfg, &names, &policies);
        (cfg, resources)
    }

    fn find<'a>(resources: &'a [AwsResource], tf_type: &str, tf: &str) -> &'a AwsResource {
        resources
            .iter()
            .find(|r| r.tf_type() == tf_type && r.tf_name() == tf)
            .unwrap_or_else(|| panic!("missing {tf_type}.{tf}"))
    }

    fn body(r: &AwsResource) -> Json {
        r.to_tf_json()["resource"][r.tf_type()][r.tf_name()].clone()
    }

    #[test]
    fn on_demand_compute_env_has_no_spot_fields() {
        let (_, resources) = compiled(false);
        let env = body(find(&resources, "aws_batch_compute_environment", "compute"));
        let cr = &env["compute_resources"];
        assert_eq!(cr["type"], "EC2");
        assert_eq!(cr["allocation_strategy"], "BEST_FIT");
        assert!(cr.get("bid_percentage").is_none());
        assert!(cr.get("spot_iam_fleet_role").is_none());
        assert!(!resources.iter().any(|r| r.tf_name() == "spot_fleet"));
    }

    #[test]
    fn spot_compute_env_carries_bid_and_fleet_role() {
        let (_, resources) = compiled(true);
        let env = body(find(&resources, "aws_batch_compute_environment", "compute"));
        let cr = &env["compute_resources"];
        assert_eq!(cr["type"], "SPOT");
        // BEST_FIT was requested; Spot never sees an On-Demand strategy.
        assert_eq!(cr["allocation_strategy"], "SPOT_CAPACITY_OPTIMIZED");
        assert_eq!(cr["bid_percentage"], 100);
        assert_eq!(cr["spot_iam_fleet_role"], "${aws_iam_role.spot_fleet.arn}");
        let fleet = body(find(&resources, "aws_iam_role", "spot_fleet"));
        assert_eq!(fleet["name"], "nf-dev-spot-fleet-role");
    }

    #[test]
    fn head_env_is_always_on_demand() {
        for spot in [false, true] {
            let (_, resources) = compiled(spot);
            let env = body(find(&resources, "aws_batch_compute_environment", "head"));
            let cr = &env["compute_resources"];
            assert_eq!(cr["type"], "EC2");
            assert_eq!(cr["allocation_strategy"], "BEST_FIT_PROGRESSIVE");
            assert_eq!(cr["min_vcpus"], 0);
            assert_eq!(cr["max_vcpus"], 128);
        }
    }

    #[test]
    fn launch_template_embeds_the_boot_payload() {
        let (cfg, resources) = compiled(false);
        let lt = body(find(&resources, "aws_launch_template", "main"));
        assert_eq!(lt["name"], "nf-dev-launch-template");
        let decoded = BASE64_STANDARD.decode(lt["user_data"].as_str().unwrap()).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), bootstrap::select(&cfg));
        assert!(lt.get("image_id").is_none());
        assert!(lt.get("key_name").is_none());
    }

    #[test]
    fn launch_template_honors_ami_and_key_pair() {
        let mut cfg = sample(false);
        cfg.ami_id = Some("ami-0123".to_string());
        cfg.ec2_key_pair = Some("ops-key".to_string());
        let names = derive(&cfg);
        let policies = build_policies(&cfg, &names);
        let resources = stack(&cfg, &names, &policies);
        let lt = body(find(&resources, "aws_launch_template", "main"));
        assert_eq!(lt["image_id"], "ami-0123");
        assert_eq!(lt["key_name"], "ops-key");
    }

    #[test]
    fn queues_route_into_their_environments() {
        let (_, resources) = compiled(false);
        let head = body(find(&resources, "aws_batch_job_queue", "head"));
        assert_eq!(head["priority"], HEAD_QUEUE_PRIORITY);
        assert_eq!(head["compute_environments"][0], "${aws_batch_compute_environment.head.arn}");
        let compute = body(find(&resources, "aws_batch_job_queue", "compute"));
        assert_eq!(compute["priority"], COMPUTE_QUEUE_PRIORITY);
        assert_eq!(compute["compute_environments"][0], "${aws_batch_compute_environment.compute.arn}");
    }

    #[test]
    fn roles_serialize_trust_documents_as_strings() {
        let (_, resources) = compiled(false);
        let role = body(find(&resources, "aws_iam_role", "instance"));
        let trust: Json = serde_json::from_str(role["assume_role_policy"].as_str().unwrap()).unwrap();
        assert_eq!(trust["Statement"][0]["Principal"]["Service"], "ec2.amazonaws.com");
        assert_eq!(
            role["managed_policy_arns"][0],
            "arn:aws:iam::aws:policy/service-role/AmazonEC2ContainerServiceforEC2Role"
        );
    }

    #[test]
    fn merged_tags_reach_the_fleet_resources() {
        let (_, resources) = compiled(false);
        for (tf_type, tf) in [
            ("aws_batch_compute_environment", "compute"),
            ("aws_batch_job_queue", "head"),
            ("aws_launch_template", "main"),
        ] {
            let b = body(find(&resources, tf_type, tf));
            assert_eq!(b["tags"]["ManagedBy"], "terraform");
            assert_eq!(b["tags"]["Name"], "nf-dev");
        }
    }

    #[test]
    fn plan_orders_identities_before_fleet_before_queues() {
        let cfg = sample(true);
        let names = derive(&cfg);
        let policies = build_policies(&cfg, &names);
        let specs = plan(&cfg, &names, &policies);
        let ordered = batchforge_core::order(&specs).unwrap();
        let pos = |id: &str| ordered.iter().position(|x| x.0 == id).unwrap();
        assert!(pos("aws_iam_role.batch_service") < pos("aws_batch_compute_environment.head"));
        assert!(pos("aws_iam_role.spot_fleet") < pos("aws_batch_compute_environment.compute"));
        assert!(pos("aws_iam_instance_profile.instance") < pos("aws_batch_compute_environment.compute"));
        assert!(pos("aws_launch_template.main") < pos("aws_batch_compute_environment.head"));
        assert!(pos("aws_batch_compute_environment.head") < pos("aws_batch_job_queue.head"));
        assert!(pos("aws_batch_compute_environment.compute") < pos("aws_batch_job_queue.compute"));
    }

    #[test]
    fn plan_is_deterministic() {
        let cfg = sample(true);
        let names = derive(&cfg);
        let policies = build_policies(&cfg, &names);
        let a = serde_json::to_string(&plan(&cfg, &names, &policies)).unwrap();
        let b = serde_json::to_string(&plan(&cfg, &names, &policies)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn platform_user_carries_both_documents() {
        let (_, resources) = compiled(false);
        let pass = body(find(&resources, "aws_iam_user_policy", "platform_pass_role"));
        let doc: Json = serde_json::from_str(pass["policy"].as_str().unwrap()).unwrap();
        assert_eq!(doc["Statement"][0]["Action"][0], "iam:PassRole");
        let head = body(find(&resources, "aws_iam_user_policy", "platform_head"));
        assert_eq!(head["user"], "${aws_iam_user.platform.name}");
        let key = body(find(&resources, "aws_iam_access_key", "platform"));
        assert_eq!(key["user"], "${aws_iam_user.platform.name}");
    }
}
