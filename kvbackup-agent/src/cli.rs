//! One-off maintenance subcommands against an ABS container.

use anyhow::{bail, Context};
use kvbackup_common::keyspace::KeySpace;

use crate::backend::abs::{AbsBackend, AbsConfig, AbsCredential};
use crate::backend::http_client;
use crate::purge::purge;
use crate::sas;

/// Value following `--name` in `args`.
fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

fn required<'a>(args: &'a [String], name: &str) -> anyhow::Result<&'a str> {
    match flag(args, name) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => bail!("missing required flag {}", name),
    }
}

fn abs_backend(args: &[String]) -> anyhow::Result<AbsBackend> {
    let credential = match (flag(args, "--account-key"), flag(args, "--sas-token")) {
        (Some(key), _) => AbsCredential::shared_key(key).context("--account-key is not valid base64")?,
        (None, Some(token)) => AbsCredential::sas(token),
        (None, None) => bail!("one of --account-key or --sas-token is required"),
    };
    let client = http_client()?;
    Ok(AbsBackend::new(
        AbsConfig {
            account_name: required(args, "--account-name")?.to_string(),
            container: required(args, "--container")?.to_string(),
            credential,
            endpoint: flag(args, "--endpoint").map(|s| s.to_string()),
        },
        client,
    ))
}

/// `sas --container C --account-name A --account-key K [--expiry-days N]`
pub fn run_sas(args: &[String]) -> anyhow::Result<()> {
    let container = required(args, "--container")?;
    let account_name = required(args, "--account-name")?;
    let account_key = required(args, "--account-key")?;
    let days = match flag(args, "--expiry-days") {
        Some(d) => d.parse::<i64>().context("--expiry-days must be an integer")?,
        None => sas::DEFAULT_EXPIRY_DAYS,
    };
    if days <= 0 {
        bail!("--expiry-days must be positive");
    }

    let token = sas::generate_container_sas(account_name, account_key, container, sas::expiry_in(days))
        .context("--account-key is not valid base64")?;
    println!("{}", token);
    Ok(())
}

/// `list --container C --account-name A (--account-key K | --sas-token T) --prefix P`
pub async fn run_list(args: &[String]) -> anyhow::Result<()> {
    let backend = abs_backend(args)?;
    let keyspace = KeySpace::new(flag(args, "--prefix").unwrap_or_default());

    let entries = keyspace.list(&backend).await?;
    let mut total = 0u64;
    for entry in &entries {
        println!("{}\t{}", entry.id, entry.size);
        total += entry.size;
    }
    println!("{} backup(s), {} bytes", entries.len(), total);
    Ok(())
}

/// `purge ... --prefix P --max-backups N`
pub async fn run_purge(args: &[String]) -> anyhow::Result<()> {
    let backend = abs_backend(args)?;
    let keyspace = KeySpace::new(flag(args, "--prefix").unwrap_or_default());
    let max_backups: i64 = required(args, "--max-backups")?
        .parse()
        .context("--max-backups must be an integer")?;

    let report = purge(&backend, &keyspace, max_backups).await?;
    for key in &report.deleted {
        println!("deleted {}", key);
    }
    println!("{} deleted, {} retained", report.deleted.len(), report.retained);
    Ok(())
}
