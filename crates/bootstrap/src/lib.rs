use batchforge_config::InputConfig;

/// Which boot payload a launch template carries. Fusion needs local NVMe
/// scratch; the plain variant ships the AWS CLI for object staging instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapVariant {
    Cli,
    Fusion,
}

impl BootstrapVariant {
    pub fn for_config(cfg: &InputConfig) -> Self {
        if cfg.enable_fusion { BootstrapVariant::Fusion } else { BootstrapVariant::Cli }
    }
}

pub fn select(cfg: &InputConfig) -> String {
    payload(BootstrapVariant::for_config(cfg))
}

const MIME_HEADER: &str = "\
MIME-Version: 1.0
Content-Type: multipart/mixed; boundary=\"==BOUNDARY==\"

--==BOUNDARY==
Content-Type: text/x-shellscript; charset=\"us-ascii\"

";

const MIME_FOOTER: &str = "\

--==BOUNDARY==--
";

/// Shared setup: monitoring agent plus the fixed container-runtime and
/// kernel memory-pressure constants. None of these take input parameters.
const COMMON_SETUP: &str = r#"#!/usr/bin/env bash
set -euo pipefail

yum install -q -y amazon-cloudwatch-agent
systemctl enable --now amazon-cloudwatch-agent

cat >>/etc/ecs/ecs.config <<'EOF'
ECS_CONTAINER_STOP_TIMEOUT=60s
ECS_CONTAINER_START_TIMEOUT=10m
ECS_IMAGE_PULL_BEHAVIOR=once
EOF

cat >/etc/sysctl.d/99-batch.conf <<'EOF'
vm.swappiness = 10
vm.dirty_ratio = 40
EOF
sysctl --system
"#;

/// Nextflow stages objects through the AWS CLI when Fusion is off, so the
/// plain variant bakes it into the instance.
const AWS_CLI_INSTALL: &str = r#"
curl -fsSL https://awscli.amazonaws.com/awscli-exe-linux-x86_64.zip -o /tmp/awscliv2.zip
unzip -q /tmp/awscliv2.zip -d /tmp
/tmp/aws/install --install-dir /opt/aws-cli --bin-dir /opt/bin
rm -rf /tmp/aws /tmp/awscliv2.zip
"#;

/// Assemble all instance-store NVMe disks into one ext4 volume at /scratch.
/// Zero disks: leave /scratch on the root volume. One disk: format it
/// directly. Several disks: stripe them with LVM before formatting.
const NVME_SCRATCH: &str = r#"
mkdir -p /scratch
mapfile -t disks < <(lsblk -dpno NAME,MODEL | awk '/Instance Storage/ {print $1}')
if [ "${#disks[@]}" -eq 0 ]; then
    echo "no instance-store disks found, /scratch stays on the root volume"
elif [ "${#disks[@]}" -eq 1 ]; then
    mkfs.ext4 -F "${disks[0]}"
    mount -o noatime "${disks[0]}" /scratch
else
    pvcreate -f "${disks[@]}"
    vgcreate scratch_vg "${disks[@]}"
    lvcreate -y -n scratch_lv -l 100%FREE -i "${#disks[@]}" scratch_vg
    mkfs.ext4 -F /dev/scratch_vg/scratch_lv
    mount -o noatime /dev/scratch_vg/scratch_lv /scratch
fi
chmod 1777 /scratch
"#;

/// Render the selected template. Selection is the only variable: the blocks
/// themselves are fixed text.
pub fn payload(variant: BootstrapVariant) -> String {
    let body = match variant {
        BootstrapVariant::Cli => format!("{COMMON_SETUP}{AWS_CLI_INSTALL}"),
        BootstrapVariant::Fusion => format!("{COMMON_SETUP}{NVME_SCRATCH}"),
    };
    format!("{MIME_HEADER}{body}{MIME_FOOTER}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(enable_fusion: bool) -> InputConfig {
        let yaml = format!(
            r#"
name_prefix: nf-dev
region: eu-west-1
subnet_ids: [subnet-aaa]
security_group_ids: [sg-ccc]
work_bucket_name: nf-dev-work
platform_server_url: https://api.cloud.seqera.io
platform_access_token: tower-token
platform_workspace_id: 12345
enable_wave: {enable_fusion}
enable_fusion: {enable_fusion}
"#
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn fusion_flag_picks_the_variant() {
        assert_eq!(BootstrapVariant::for_config(&sample(false)), BootstrapVariant::Cli);
        assert_eq!(BootstrapVariant::for_config(&sample(true)), BootstrapVariant::Fusion);
    }

    #[test]
    fn cli_variant_has_no_disk_discovery() {
        let p = payload(BootstrapVariant::Cli);
        assert!(!p.contains("lsblk"));
        assert!(!p.contains("vgcreate"));
        assert!(p.contains("awscli-exe-linux-x86_64.zip"));
    }

    #[test]
    fn fusion_variant_aggregates_nvme_disks() {
        let p = payload(BootstrapVariant::Fusion);
        assert!(p.contains("lsblk"));
        assert!(p.contains("mount -o noatime"));
        assert!(!p.contains("awscli-exe-linux-x86_64.zip"));
    }

    #[test]
    fn all_three_disk_count_branches_are_distinct() {
        let p = payload(BootstrapVariant::Fusion);
        // 0 disks: skip; 1 disk: direct format; N disks: LVM stripe.
        assert!(p.contains(r#"-eq 0"#));
        assert!(p.contains(r#"-eq 1"#));
        assert!(p.contains("mkfs.ext4 -F \"${disks[0]}\""));
        assert!(p.contains("vgcreate scratch_vg"));
        assert!(p.contains("lvcreate -y -n scratch_lv -l 100%FREE"));
    }

    #[test]
    fn both_variants_share_the_fixed_runtime_constants() {
        for v in [BootstrapVariant::Cli, BootstrapVariant::Fusion] {
            let p = payload(v);
            assert!(p.contains("amazon-cloudwatch-agent"));
            assert!(p.contains("ECS_CONTAINER_STOP_TIMEOUT=60s"));
            assert!(p.contains("ECS_IMAGE_PULL_BEHAVIOR=once"));
            assert!(p.contains("vm.swappiness = 10"));
            assert!(p.contains("vm.dirty_ratio = 40"));
            assert!(p.starts_with("MIME-Version: 1.0"));
            assert!(p.ends_with("--==BOUNDARY==--\n"));
        }
    }

    #[test]
    fn selection_is_deterministic() {
        assert_eq!(select(&sample(true)), select(&sample(true)));
        assert_eq!(select(&sample(false)), payload(BootstrapVariant::Cli));
    }
}
