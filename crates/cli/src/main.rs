use anyhow::{Result, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value as Json};
use std::path::{Path, PathBuf};
use tracing_subscriber::fmt::format::FmtSpan;
use secrecy::ExposeSecret;

use batchforge_aws as aws;
use batchforge_bootstrap as bootstrap;
use batchforge_config as config;
use batchforge_crypto as crypto;
use batchforge_iam as iam;
use batchforge_platform as platform;

#[derive(Parser, Debug)]
#[command(author, version, about="batchforge — Seqera-on-AWS-Batch stack compiler")]
struct Cli {
    /// Stack file (YAML or .yml.age)
    #[arg(short, long, default_value="stack.yml", global = true)]
    file: PathBuf,

    /// Output directory
    #[arg(short, long, default_value="out", global = true)]
    out: PathBuf,

    /// AGE identities (for .age stack files)
    #[arg(long="age-identity", global = true)]
    age_ids: Vec<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)] enum Cmd {
    /// Check every input invariant and report all violations
    Validate,
    /// Print the resource creation order
    Plan,
    /// Write the full compiled bundle to the output directory
    Compile,
}

fn merge(mut a: Json, b: Json) -> Json {
    match (a.as_object_mut(), b) {
        (Some(ma), Json::Object(mb)) => {
            for (k, v) in mb.into_iter() {
                let existing = ma.remove(&k).unwrap_or(Json::Null);
                ma.insert(k, merge(existing, v));
            }
            Json::Object(ma.clone())
        }
        (_, v) => v
    }
}

fn load_stack(cli: &Cli) -> Result<config::InputConfig> {
    let cfg = if cli.file.extension().and_then(|s| s.to_str()) == Some("age") {
        let mut ids = Vec::new();
        for p in &cli.age_ids { ids.extend(crypto::load_identities(p)?); }
        if ids.is_empty() {
            anyhow::bail!("--age-identity is required for an encrypted stack file");
        }
        let f = std::fs::File::open(&cli.file)
            .with_context(|| format!("open {}", cli.file.display()))?;
        let dec = crypto::decrypt_age_bytes(std::io::BufReader::new(f), &ids)?;
        serde_yaml::from_slice(dec.expose_secret())?
    } else {
        let raw = std::fs::read(&cli.file)
            .with_context(|| format!("open {}", cli.file.display()))?;
        serde_yaml::from_slice(&raw)?
    };
    Ok(cfg)
}

fn write_out(out: &Path, name: &str, contents: &str) -> Result<()> {
    std::fs::create_dir_all(out)?;
    std::fs::write(out.join(name), contents).with_context(|| format!("write {name}"))?;
    Ok(())
}

fn compile(cli: &Cli, cfg: &config::InputConfig) -> Result<()> {
    let names = config::derive(cfg);
    let policies = iam::build_policies(cfg, &names);
    let resources = aws::stack(cfg, &names, &policies);
    let specs = aws::plan(cfg, &names, &policies);
    batchforge_core::order(&specs)?;

    let mut tf = json!({ "terraform": { "required_providers": {
        "aws": { "source": "hashicorp/aws", "version": "~> 5.0" }
    } } });
    tf = merge(tf, aws::AwsProvider::from_config(cfg).to_tf_json());
    for r in &resources {
        tf = merge(tf, r.to_tf_json());
    }

    let refs = aws::stack_refs();
    let registration = platform::registration(cfg, &names, &refs);
    let policy_docs = json!({
        "job": policies.job.to_json(),
        "head": policies.head.to_json(),
        "passRole": policies.pass_role.to_json(),
    });

    write_out(&cli.out, "main.tf.json", &serde_json::to_string_pretty(&tf)?)?;
    write_out(&cli.out, "plan.json", &serde_json::to_string_pretty(&specs)?)?;
    write_out(&cli.out, "policies.json", &serde_json::to_string_pretty(&policy_docs)?)?;
    write_out(&cli.out, "platform.json", &serde_json::to_string_pretty(&registration)?)?;
    write_out(&cli.out, "derived.json", &serde_json::to_string_pretty(&names)?)?;
    write_out(&cli.out, "user-data.sh", &bootstrap::select(cfg))?;

    tracing::info!(
        out = %cli.out.display(),
        resources = resources.len(),
        "stack compiled; pass the platform token to the provisioning engine out of band"
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().json().with_span_events(FmtSpan::CLOSE).init();
    let cli = Cli::parse();

    let cfg = load_stack(&cli)?;

    match cli.cmd {
        Cmd::Validate => {
            if let Err(errs) = config::validate(&cfg) {
                for e in &errs.0 {
                    tracing::error!(field = e.field, "{}", e.reason);
                }
                anyhow::bail!("{} invalid input field(s)", errs.0.len());
            }
            tracing::info!("stack file is valid");
        }
        Cmd::Plan => {
            config::validate(&cfg)?;
            let names = config::derive(&cfg);
            let policies = iam::build_policies(&cfg, &names);
            let specs = aws::plan(&cfg, &names, &policies);
            for id in batchforge_core::order(&specs)? {
                println!("{}", id.0);
            }
        }
        Cmd::Compile => {
            config::validate(&cfg)?;
            compile(&cli, &cfg)?;
        }
    }
    Ok(())
}
